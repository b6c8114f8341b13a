//! Public adapter interface
//!
//! [`ElmInterface`] is the synchronous facade used by the diagnostic stack:
//! `init` runs the handshake and starts the worker, `send_data` hands a
//! BMW-FAST request to it and `receive_data` blocks until enough response
//! bytes were queued.

use crate::channel::ElmLink;
use crate::config::ElmConfig;
use crate::error::{ElmError, Result};
use crate::protocol::AdapterKind;
use crate::stream::ElmStream;
use crate::telegram::{checksum, FastHeader, ISOTP_MAX_DATA};
use crate::worker::{self, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

enum Connection<S> {
    /// Link owned by the caller side, worker not running
    Ready(ElmLink<S>),
    /// Link owned by the worker thread
    Running {
        handle: JoinHandle<ElmLink<S>>,
        kind: AdapterKind,
    },
    /// Link lost (worker thread panicked or could not be started)
    Detached,
}

/// ELM327 adapter driving BMW-FAST over ISO-TP
pub struct ElmInterface<S: ElmStream + 'static> {
    config: ElmConfig,
    shared: Arc<Shared>,
    conn: Mutex<Connection<S>>,
    disposed: AtomicBool,
}

impl<S: ElmStream + 'static> ElmInterface<S> {
    /// Wrap a connected stream; nothing is sent before [`init`](Self::init)
    pub fn new(stream: S, config: ElmConfig) -> Self {
        let shared = Arc::new(Shared::new());
        let link = ElmLink::new(stream, config.clone(), shared.clone());
        Self {
            config,
            shared,
            conn: Mutex::new(Connection::Ready(link)),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ElmConfig {
        &self.config
    }

    /// Initialize the adapter and start the worker thread
    ///
    /// Blocks for the whole handshake. On failure no thread is running and
    /// `init` may be retried.
    pub fn init(&self) -> Result<AdapterKind> {
        let mut conn = self.conn.lock();
        let mut link = match std::mem::replace(&mut *conn, Connection::Detached) {
            Connection::Ready(link) => link,
            Connection::Running { handle, .. } => self.stop_worker(handle)?,
            Connection::Detached => return Err(ElmError::Task("adapter link lost".to_string())),
        };

        let kind = match link.initialize() {
            Ok(kind) => kind,
            Err(err) => {
                warn!("ELM327 init failed: {}", err);
                *conn = Connection::Ready(link);
                return Err(err);
            }
        };

        let handle = worker::spawn(link).map_err(|err| ElmError::Task(err.to_string()))?;
        *conn = Connection::Running { handle, kind };
        info!("ELM327 adapter ready ({:?})", kind);
        Ok(kind)
    }

    fn stop_worker(&self, handle: JoinHandle<ElmLink<S>>) -> Result<ElmLink<S>> {
        self.shared.request_terminate();
        let joined = handle.join();
        self.shared.clear_terminate();
        self.shared.clear_buffers();
        joined.map_err(|_| ElmError::Task("worker thread panicked".to_string()))
    }

    /// Transport variant detected by the last successful `init`
    pub fn adapter_kind(&self) -> Option<AdapterKind> {
        match &*self.conn.lock() {
            Connection::Running { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.conn.lock(), Connection::Running { .. })
    }

    /// Queue a BMW-FAST request for sending
    ///
    /// Never blocks; fails with [`ElmError::Busy`] while the previous request
    /// has not been picked up by the worker.
    pub fn send_data(&self, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(ElmError::NotInitialized);
        }
        let header = FastHeader::parse(data)?;
        if header.data_len > ISOTP_MAX_DATA {
            return Err(ElmError::InvalidTelegram(format!(
                "{} data bytes exceed the ISO-TP limit of {}",
                header.data_len, ISOTP_MAX_DATA
            )));
        }
        if !self.shared.submit(data.to_vec()) {
            debug!("Send rejected, request pending");
            return Err(ElmError::Busy);
        }
        Ok(())
    }

    /// Fill `buf` with response bytes
    ///
    /// Waits up to `timeout` plus the configured offset. The deadline is
    /// restarted by receive activity, so long multi-frame answers do not
    /// time out halfway. Bytes are only removed when `buf` can be filled.
    pub fn receive_data(&self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let limit = timeout.saturating_add(self.config.read_timeout_offset());
        self.shared.touch();
        loop {
            {
                let mut mailbox = self.shared.lock();
                let wanted = buf.len();
                if mailbox.responses.len() >= wanted {
                    for (slot, byte) in buf.iter_mut().zip(mailbox.responses.drain(..wanted)) {
                        *slot = byte;
                    }
                    return Ok(());
                }
            }
            if self.shared.stream_failure() {
                return Err(ElmError::Stream("adapter stream failed".to_string()));
            }

            if self.shared.receiver_busy() {
                self.shared.touch();
            }
            let idle = self.shared.idle_for();
            if idle > limit {
                debug!("Receive timeout");
                let millis = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                return Err(ElmError::Timeout(millis));
            }
            let remaining = limit.saturating_sub(idle).max(Duration::from_millis(1));
            self.shared.wait_response(remaining);
        }
    }

    /// Receive one complete BMW-FAST telegram and verify its checksum
    ///
    /// The returned telegram does not include the checksum byte.
    pub fn receive_telegram(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut telegram = vec![0u8; 3];
        self.receive_data(&mut telegram, timeout)?;

        let mut len = (telegram[0] & 0x3F) as usize;
        if len == 0 {
            let mut length_byte = [0u8; 1];
            self.receive_data(&mut length_byte, timeout)?;
            telegram.push(length_byte[0]);
            len = length_byte[0] as usize;
            if len == 0 {
                let mut escaped = [0u8; 2];
                self.receive_data(&mut escaped, timeout)?;
                telegram.extend_from_slice(&escaped);
                len = u16::from_be_bytes(escaped) as usize;
            }
        }

        let start = telegram.len();
        telegram.resize(start + len + 1, 0);
        self.receive_data(&mut telegram[start..], timeout)?;

        let actual = telegram.pop().unwrap_or_default();
        let expected = checksum(&telegram);
        if expected != actual {
            return Err(ElmError::ChecksumError { expected, actual });
        }
        Ok(telegram)
    }

    /// Drop all queued response bytes; a transfer in progress is not affected
    pub fn purge_in_buffer(&self) {
        self.shared.lock().responses.clear();
    }

    /// Sticky flag set by any stream read/write failure, cleared by `init` and `disconnect`
    pub fn stream_failure(&self) -> bool {
        self.shared.stream_failure()
    }

    /// Stop the worker and return the adapter to command mode
    ///
    /// The stream itself stays open; it belongs to the caller.
    pub fn disconnect(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let mut link = match std::mem::replace(&mut *conn, Connection::Detached) {
            Connection::Running { handle, .. } => {
                info!("Stopping ELM327 worker");
                self.stop_worker(handle)?
            }
            Connection::Ready(link) => link,
            Connection::Detached => return Ok(()),
        };

        let timeout = link.command_timeout();
        if let Err(err) = link.leave_data_mode(timeout) {
            debug!("Leaving data mode on disconnect failed: {}", err);
        }
        *conn = Connection::Ready(link);
        self.shared.set_stream_failure(false);
        Ok(())
    }

    /// Disconnect and hand the stream back
    pub fn into_stream(self) -> Result<S> {
        self.disconnect()?;
        self.disposed.store(true, Ordering::SeqCst);
        match std::mem::replace(&mut *self.conn.lock(), Connection::Detached) {
            Connection::Ready(link) => Ok(link.into_stream()),
            _ => Err(ElmError::Task("adapter link lost".to_string())),
        }
    }
}

impl<S: ElmStream + 'static> Drop for ElmInterface<S> {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.disconnect() {
            warn!("ELM327 disconnect on drop failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStream;

    fn quick_config() -> ElmConfig {
        ElmConfig {
            read_timeout_offset_ms: 50,
            command_timeout_ms: 200,
            data_timeout_ms: 200,
            poll_interval_ms: 1,
            min_frame_gap_ms: 1,
            ..ElmConfig::default()
        }
    }

    #[test]
    fn test_send_before_init() {
        let interface = ElmInterface::new(MockStream::elm327(), quick_config());
        assert!(matches!(
            interface.send_data(&[0x82, 0x12, 0xF1, 0x1A, 0x80]),
            Err(ElmError::NotInitialized)
        ));
        assert!(interface.adapter_kind().is_none());
    }

    #[test]
    fn test_invalid_telegram_rejected() {
        let interface = ElmInterface::new(MockStream::elm327(), quick_config());
        interface.init().unwrap();
        assert!(matches!(
            interface.send_data(&[0x85, 0x12, 0xF1, 0x1A]),
            Err(ElmError::InvalidTelegram(_))
        ));
    }

    #[test]
    fn test_request_beyond_first_frame_limit_rejected() {
        let interface = ElmInterface::new(MockStream::elm327(), quick_config());
        interface.init().unwrap();

        let mut telegram = vec![0x80, 0x12, 0xF1, 0x00, 0x10, 0x00];
        telegram.resize(telegram.len() + 0x1000, 0x55);
        assert!(matches!(
            interface.send_data(&telegram),
            Err(ElmError::InvalidTelegram(_))
        ));
        assert!(interface.shared.lock().request.is_none());
    }

    #[test]
    fn test_receive_with_unbounded_timeout() {
        let interface = ElmInterface::new(MockStream::elm327(), quick_config());
        interface.shared.push_response(&[0x81, 0xF1, 0x12, 0x7E, 0x02]);
        let mut buf = [0u8; 5];
        interface.receive_data(&mut buf, Duration::MAX).unwrap();
        assert_eq!(buf, [0x81, 0xF1, 0x12, 0x7E, 0x02]);

        let producer = interface.shared.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push_response(&[0x81, 0xF1, 0x40, 0x7E, 0x30]);
        });
        interface.receive_data(&mut buf, Duration::MAX).unwrap();
        handle.join().unwrap();
        assert_eq!(buf[2], 0x40);
    }

    #[test]
    fn test_receive_leaves_short_queue_untouched() {
        let interface = ElmInterface::new(MockStream::elm327(), quick_config());
        interface.shared.push_response(&[0x81, 0xF1, 0x12]);

        let mut buf = [0u8; 5];
        let result = interface.receive_data(&mut buf, Duration::from_millis(10));
        assert!(matches!(result, Err(ElmError::Timeout(60))));
        assert_eq!(interface.shared.lock().responses.len(), 3);
    }

    #[test]
    fn test_receive_telegram_checks_checksum() {
        let interface = ElmInterface::new(MockStream::elm327(), quick_config());
        interface.shared.push_response(&[0x81, 0xF1, 0x12, 0x7E, 0x00]);
        let err = interface.receive_telegram(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ElmError::ChecksumError { expected: 0x02, actual: 0x00 }));
    }

    #[test]
    fn test_receive_telegram_with_length_byte() {
        let interface = ElmInterface::new(MockStream::elm327(), quick_config());
        let mut telegram = vec![0x80, 0xF1, 0x12, 0x40];
        telegram.extend(std::iter::repeat(0x11).take(0x40));
        let sum = checksum(&telegram);
        telegram.push(sum);
        interface.shared.push_response(&telegram);

        let received = interface.receive_telegram(Duration::from_millis(10)).unwrap();
        assert_eq!(received.len(), 0x44);
        assert!(interface.shared.lock().responses.is_empty());
    }

    #[test]
    fn test_disconnect_twice() {
        let interface = ElmInterface::new(MockStream::elm327(), quick_config());
        interface.init().unwrap();
        assert!(interface.is_running());
        interface.disconnect().unwrap();
        interface.disconnect().unwrap();
        assert!(!interface.is_running());
    }
}
