//! Worker thread and the state it shares with callers
//!
//! Only the worker thread performs stream I/O once the adapter is running.
//! Callers talk to it through [`Shared`]: a single-slot request mailbox,
//! the expansion queue of the full transport sender, the response byte
//! queue and the Carly line cache, all behind one lock.

use crate::channel::ElmLink;
use crate::receiver;
use crate::sender;
use crate::stream::ElmStream;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Data guarded by the buffer lock
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    /// Request waiting to be picked up by the sender
    pub request: Option<Vec<u8>>,
    /// Unicast requests produced from a functional request
    pub request_queue: VecDeque<Vec<u8>>,
    /// Reassembled telegrams (with checksum) waiting for the caller
    pub responses: VecDeque<u8>,
    /// Carly lines returned by one read but not consumed yet
    pub carly_cache: VecDeque<String>,
    request_signaled: bool,
    response_signaled: bool,
}

/// State shared between the public interface and the worker thread
#[derive(Debug)]
pub(crate) struct Shared {
    mailbox: Mutex<Mailbox>,
    request_signal: Condvar,
    response_signal: Condvar,
    terminate: AtomicBool,
    receiver_busy: AtomicBool,
    stream_failure: AtomicBool,
    carly: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            mailbox: Mutex::new(Mailbox::default()),
            request_signal: Condvar::new(),
            response_signal: Condvar::new(),
            terminate: AtomicBool::new(false),
            receiver_busy: AtomicBool::new(false),
            stream_failure: AtomicBool::new(false),
            carly: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock()
    }

    /// Store a request in the mailbox; `false` if one is still pending
    pub fn submit(&self, request: Vec<u8>) -> bool {
        let mut mailbox = self.mailbox.lock();
        if mailbox.request.is_some() {
            return false;
        }
        mailbox.request = Some(request);
        mailbox.request_signaled = true;
        self.request_signal.notify_one();
        true
    }

    pub fn take_request(&self) -> Option<Vec<u8>> {
        self.mailbox.lock().request.take()
    }

    /// Wake the worker early
    pub fn signal_request(&self) {
        let mut mailbox = self.mailbox.lock();
        mailbox.request_signaled = true;
        self.request_signal.notify_one();
    }

    /// Wait up to `timeout` for a request signal, consuming it
    pub fn wait_request(&self, timeout: Duration) {
        let mut mailbox = self.mailbox.lock();
        if !mailbox.request_signaled {
            self.request_signal.wait_for(&mut mailbox, timeout);
        }
        mailbox.request_signaled = false;
    }

    /// Sleep between two polls of the stream; `false` once termination is requested
    pub fn pause(&self, timeout: Duration) -> bool {
        if self.terminating() {
            return false;
        }
        self.wait_request(timeout);
        !self.terminating()
    }

    /// Append a finished telegram to the response queue and wake readers
    pub fn push_response(&self, telegram: &[u8]) {
        let mut mailbox = self.mailbox.lock();
        mailbox.responses.extend(telegram.iter().copied());
        mailbox.response_signaled = true;
        self.response_signal.notify_all();
    }

    /// Wait up to `timeout` for a response signal, consuming it
    pub fn wait_response(&self, timeout: Duration) {
        let mut mailbox = self.mailbox.lock();
        if !mailbox.response_signaled {
            self.response_signal.wait_for(&mut mailbox, timeout);
        }
        mailbox.response_signaled = false;
    }

    /// Drop pending requests and queued responses
    pub fn clear_buffers(&self) {
        let mut mailbox = self.mailbox.lock();
        mailbox.request = None;
        mailbox.request_queue.clear();
        mailbox.responses.clear();
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.signal_request();
    }

    pub fn clear_terminate(&self) {
        self.terminate.store(false, Ordering::SeqCst);
    }

    pub fn terminating(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn set_stream_failure(&self, failed: bool) {
        self.stream_failure.store(failed, Ordering::SeqCst);
    }

    /// Set the failure flag, true if it was not set before
    pub fn mark_stream_failure(&self) -> bool {
        !self.stream_failure.swap(true, Ordering::SeqCst)
    }

    pub fn stream_failure(&self) -> bool {
        self.stream_failure.load(Ordering::SeqCst)
    }

    pub fn set_receiver_busy(&self, busy: bool) {
        self.receiver_busy.store(busy, Ordering::SeqCst);
    }

    /// Enable busy reporting (Carly adapters only)
    pub fn set_carly(&self, carly: bool) {
        self.carly.store(carly, Ordering::SeqCst);
    }

    /// Whether a Carly transfer is in flight
    ///
    /// True while an answer read runs, expanded requests are queued or
    /// cached lines are waiting. Always false for other adapters.
    pub fn receiver_busy(&self) -> bool {
        if !self.carly.load(Ordering::SeqCst) {
            return false;
        }
        if self.receiver_busy.load(Ordering::SeqCst) {
            return true;
        }
        let mailbox = self.mailbox.lock();
        !mailbox.request_queue.is_empty() || !mailbox.carly_cache.is_empty()
    }

    /// Restart the receive deadline
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last transfer activity
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Marks the receiver busy for the lifetime of the guard
pub(crate) struct BusyGuard<'a> {
    shared: &'a Shared,
}

impl<'a> BusyGuard<'a> {
    pub fn new(shared: &'a Shared) -> Self {
        shared.set_receiver_busy(true);
        Self { shared }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.shared.set_receiver_busy(false);
    }
}

/// Start the worker thread; the link is handed back when it terminates
pub(crate) fn spawn<S>(mut link: ElmLink<S>) -> io::Result<JoinHandle<ElmLink<S>>>
where
    S: ElmStream + 'static,
{
    thread::Builder::new()
        .name("elm327-worker".to_string())
        .spawn(move || {
            run(&mut link);
            link
        })
}

fn run<S: ElmStream>(link: &mut ElmLink<S>) {
    let shared = link.shared().clone();
    let poll_interval = link.config().poll_interval();
    info!(
        "ELM327 worker started ({:?}, timeout multiplier {})",
        link.kind(),
        link.timeout_multiplier()
    );

    while !shared.terminating() {
        sender::poll(link);
        receiver::poll(link);
        shared.wait_request(poll_interval);
    }

    debug!("ELM327 worker stopped in {:?} mode", link.mode());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot_mailbox() {
        let shared = Shared::new();
        assert!(shared.submit(vec![0x81, 0x12, 0xF1, 0x3E]));
        assert!(!shared.submit(vec![0x81, 0x12, 0xF1, 0x3E]));
        assert_eq!(shared.take_request(), Some(vec![0x81, 0x12, 0xF1, 0x3E]));
        assert!(shared.submit(vec![0x81, 0x13, 0xF1, 0x3E]));
    }

    #[test]
    fn test_request_signal_is_consumed() {
        let shared = Shared::new();
        shared.signal_request();
        let start = Instant::now();
        shared.wait_request(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));

        let start = Instant::now();
        shared.wait_request(Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_stream_failure_reported_once() {
        let shared = Shared::new();
        assert!(shared.mark_stream_failure());
        assert!(!shared.mark_stream_failure());
        assert!(shared.stream_failure());
        shared.set_stream_failure(false);
        assert!(shared.mark_stream_failure());
    }

    #[test]
    fn test_pause_stops_on_terminate() {
        let shared = Shared::new();
        assert!(shared.pause(Duration::from_millis(1)));
        shared.request_terminate();
        assert!(!shared.pause(Duration::from_secs(5)));
        shared.clear_terminate();
        assert!(shared.pause(Duration::from_millis(1)));
    }

    #[test]
    fn test_busy_only_for_carly() {
        let shared = Shared::new();
        shared.lock().carly_cache.push_back("612F1025A80".to_string());
        assert!(!shared.receiver_busy());

        shared.set_carly(true);
        assert!(shared.receiver_busy());
        shared.lock().carly_cache.clear();
        assert!(!shared.receiver_busy());

        {
            let _guard = BusyGuard::new(&shared);
            assert!(shared.receiver_busy());
        }
        assert!(!shared.receiver_busy());
    }

    #[test]
    fn test_response_wakeup() {
        let shared = std::sync::Arc::new(Shared::new());
        let producer = shared.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push_response(&[0x81, 0xF1, 0x12, 0x7E, 0xF2]);
        });

        let start = Instant::now();
        while shared.lock().responses.len() < 5 {
            shared.wait_response(Duration::from_secs(2));
            assert!(start.elapsed() < Duration::from_secs(2));
        }
        handle.join().unwrap();
        assert_eq!(shared.lock().responses.len(), 5);
    }
}
