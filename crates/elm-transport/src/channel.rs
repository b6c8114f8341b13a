//! AT-Command Channel
//!
//! [`ElmLink`] owns the stream and all adapter-lifetime state: whether the
//! adapter is in command mode or streaming CAN data, the transport variant,
//! and the cached `ATSH`/`ATST` values. Every command first returns the
//! adapter to command mode and drops stale input.

use crate::config::ElmConfig;
use crate::error::{ElmError, Result};
use crate::protocol::{
    AdapterKind, BINARY_MODE_COMMAND, DEFAULT_CAN_HEADER, IDENTITY_COMMAND, INIT_COMMANDS,
    MANUFACTURER_COMMAND, MONITOR_COMMAND, TIMEOUT_BASE_MULTIPLIER, TIMEOUT_MULTIPLIER_COMMAND,
};
use crate::stream::ElmStream;
use crate::telegram::CanFrame;
use crate::worker::{BusyGuard, Shared};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const PROMPT: u8 = b'>';
const CARLY_MORE_DATA: u8 = 0xBB;
const CARLY_LAST_BLOCK: u8 = 0xBE;
const CARLY_RECORD_LEN: usize = 10;
const CARLY_READ_CHUNK: usize = 100;
/// Slack added to the adapter timeout when waiting for Carly answers (ms)
const CARLY_READ_SLACK_MS: u64 = 200;

/// Whether the adapter currently interprets input as commands or streams CAN data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Command,
    Streaming,
}

/// Byte stream plus the adapter state tied to it
pub struct ElmLink<S> {
    stream: S,
    config: ElmConfig,
    shared: Arc<Shared>,
    mode: LinkMode,
    kind: AdapterKind,
    binary_data: bool,
    timeout_multiplier: u32,
    can_header: Option<u16>,
    st_timeout: Option<u8>,
}

impl<S: ElmStream> ElmLink<S> {
    pub(crate) fn new(stream: S, config: ElmConfig, shared: Arc<Shared>) -> Self {
        Self {
            stream,
            config,
            shared,
            mode: LinkMode::Command,
            kind: AdapterKind::Standard,
            binary_data: false,
            timeout_multiplier: 1,
            can_header: None,
            st_timeout: None,
        }
    }

    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn config(&self) -> &ElmConfig {
        &self.config
    }

    pub fn timeout_multiplier(&self) -> u32 {
        self.timeout_multiplier
    }

    /// Wait for an AT command answer, scaled by the timeout multiplier
    pub(crate) fn command_timeout(&self) -> Duration {
        self.config
            .command_timeout()
            .saturating_mul(self.timeout_multiplier)
    }

    /// Wait for one CAN frame from the ECU, scaled by the timeout multiplier
    pub(crate) fn data_timeout(&self) -> Duration {
        let millis = if self.kind == AdapterKind::Carly {
            self.config.carly_data_timeout_ms
        } else {
            self.config.data_timeout_ms
        };
        Duration::from_millis(millis).saturating_mul(self.timeout_multiplier)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn into_stream(self) -> S {
        self.stream
    }

    fn io<T>(&self, result: io::Result<T>) -> Result<T> {
        result.map_err(|err| {
            if self.shared.mark_stream_failure() {
                error!("ELM stream failure: {}", err);
            } else {
                debug!("ELM stream still failing: {}", err);
            }
            ElmError::from(err)
        })
    }

    fn input_pending(&mut self) -> Result<bool> {
        let available = self.stream.data_available();
        self.io(available)
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let read = self.stream.read(&mut byte);
        Ok(match self.io(read)? {
            0 => None,
            _ => Some(byte[0]),
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let written = self.stream.write_all(data);
        self.io(written)
    }

    fn flush_input(&mut self) -> Result<()> {
        let discarded = self.stream.discard_input();
        self.io(discarded)
    }

    fn pause(&self) -> bool {
        self.shared.pause(self.config.poll_interval())
    }

    /// Whether unread input is waiting; stream errors count as "no"
    pub(crate) fn data_available(&mut self) -> bool {
        self.input_pending().unwrap_or(false)
    }

    /// Send an AT command, optionally requiring an `OK` answer
    ///
    /// Without `expect_ok` the caller reads the answer itself.
    pub(crate) fn send_command(&mut self, command: &str, expect_ok: bool) -> Result<()> {
        let timeout = self.command_timeout();
        if let Err(err) = self.leave_data_mode(timeout) {
            self.mode = LinkMode::Command;
            return Err(err);
        }
        self.flush_input()?;
        self.write(format!("{command}\r").as_bytes())?;
        debug!("ELM CMD send: {}", command);

        if expect_ok {
            let answer = self.receive_answer(timeout, false)?.unwrap_or_default();
            if !answer.contains("OK\r") {
                warn!("ELM invalid response to {}: {:?}", command, answer);
                return Err(ElmError::InvalidResponse(answer));
            }
        }
        Ok(())
    }

    /// Read an answer from the adapter
    ///
    /// Command answers end at the `>` prompt. With `can_data` one `\r`
    /// terminated line is returned instead, and a prompt means the adapter
    /// left data mode (`None`). `None` is also returned on timeout.
    pub(crate) fn receive_answer(
        &mut self,
        timeout: Duration,
        can_data: bool,
    ) -> Result<Option<String>> {
        let start = Instant::now();
        let mut answer = String::new();
        loop {
            while self.input_pending()? {
                let Some(byte) = self.read_byte()? else {
                    break;
                };
                if byte == 0x00 {
                    continue;
                }
                if can_data && byte == b'\r' {
                    debug!("ELM CAN rec: {}", answer);
                    return Ok(Some(answer));
                }
                answer.push(byte as char);
                if byte == PROMPT {
                    self.mode = LinkMode::Command;
                    if can_data {
                        debug!("ELM data mode aborted");
                        return Ok(None);
                    }
                    debug!("ELM CMD rec: {:?}", answer);
                    return Ok(Some(answer));
                }
            }

            if start.elapsed() > timeout {
                debug!("ELM rec timeout");
                return Ok(None);
            }
            if !self.pause() {
                return Ok(None);
            }
        }
    }

    /// Bring the adapter back to command mode
    ///
    /// Any character interrupts a running CAN read; the adapter confirms
    /// with `STOPPED` and the prompt.
    pub(crate) fn leave_data_mode(&mut self, timeout: Duration) -> Result<()> {
        if self.kind == AdapterKind::Carly {
            self.mode = LinkMode::Command;
            self.shared.set_receiver_busy(false);
            self.shared.lock().carly_cache.clear();
            return Ok(());
        }

        if self.mode == LinkMode::Command {
            return Ok(());
        }

        let mut seen = String::new();
        while self.input_pending()? {
            let Some(byte) = self.read_byte()? else {
                break;
            };
            seen.push(byte as char);
            if byte == PROMPT {
                debug!("ELM data mode already terminated: {:?}", seen);
                self.mode = LinkMode::Command;
                return Ok(());
            }
        }

        self.write(b"    ")?;
        debug!("ELM send SPACE");

        let start = Instant::now();
        loop {
            while self.input_pending()? {
                let Some(byte) = self.read_byte()? else {
                    break;
                };
                seen.push(byte as char);
                if byte == PROMPT {
                    if seen.contains("STOPPED\r") {
                        debug!("ELM data mode terminated");
                    } else {
                        debug!("ELM data mode not stopped: {:?}", seen);
                    }
                    self.mode = LinkMode::Command;
                    return Ok(());
                }
            }

            if start.elapsed() > timeout {
                warn!("ELM leave data mode timeout");
                return Err(ElmError::Timeout(timeout.as_millis() as u64));
            }
            if !self.pause() {
                return Err(ElmError::Cancelled);
            }
        }
    }

    /// Adapter timeout (`ATST` units) required for the next CAN telegram
    ///
    /// Functional requests are already split into physical ones when they
    /// get here, so Carly always uses its data timeout.
    fn required_st_timeout(&self, expect_response: bool) -> u8 {
        if self.kind == AdapterKind::Carly {
            let units = self.config.carly_data_timeout_ms
                / TIMEOUT_BASE_MULTIPLIER as u64
                / self.timeout_multiplier as u64;
            return units.min(0xFF) as u8;
        }
        if expect_response {
            0xFF
        } else {
            0x00
        }
    }

    fn update_st_timeout(&mut self, timeout: u8) -> Result<()> {
        if timeout != 0x00 && self.st_timeout == Some(timeout) {
            return Ok(());
        }
        self.st_timeout = None;

        let command = format!("ATST{timeout:02X}");
        if let Err(err) = self.send_command(&command, false) {
            warn!("Setting timeout failed: {}", err);
            return Err(err);
        }
        let answer = self
            .receive_answer(self.command_timeout(), false)?
            .unwrap_or_default();
        let accepted = ["OK\r", "STOPPED\r", "NO DATA\r", "DATA ERROR\r"]
            .iter()
            .any(|token| answer.contains(token));
        if !accepted {
            warn!("ELM set timeout invalid response: {:?}", answer);
            return Err(ElmError::InvalidResponse(answer));
        }

        self.st_timeout = Some(timeout);
        Ok(())
    }

    /// Write one CAN telegram as hex
    ///
    /// With `expect_response` the adapter stays in data mode afterwards and
    /// the answer is read through [`receive_can_frame`](Self::receive_can_frame).
    pub(crate) fn send_can_telegram(&mut self, data: &[u8], expect_response: bool) -> Result<()> {
        let timeout = self.required_st_timeout(expect_response);
        self.update_st_timeout(timeout)?;

        if let Err(err) = self.leave_data_mode(self.command_timeout()) {
            self.mode = LinkMode::Command;
            self.st_timeout = None;
            return Err(err);
        }
        self.flush_input()?;

        let line = hex::encode_upper(data);
        debug!("ELM CAN send: {}", line);
        self.write(format!("{line}\r").as_bytes())?;
        self.mode = if expect_response {
            LinkMode::Streaming
        } else {
            LinkMode::Command
        };
        Ok(())
    }

    /// Configure the transmit CAN ID (and the flow control ID) if it changed
    pub(crate) fn select_can_header(
        &mut self,
        header: u16,
        flow_control_header: bool,
    ) -> Result<()> {
        if self.can_header == Some(header) {
            return Ok(());
        }
        self.can_header = None;
        self.send_command(&format!("ATSH{header:03X}"), true)?;
        if flow_control_header {
            self.send_command(&format!("ATFCSH{header:03X}"), true)?;
        }
        self.can_header = Some(header);
        Ok(())
    }

    /// Read the next CAN frame while in data mode
    pub(crate) fn receive_can_frame(&mut self, timeout: Duration) -> Option<CanFrame> {
        if self.mode == LinkMode::Command {
            return None;
        }

        let answer = if self.kind == AdapterKind::Carly {
            self.carly_answer(timeout)
        } else {
            let answer = self.receive_answer(timeout, true);
            if self.mode == LinkMode::Command {
                // keep listening in monitor mode
                if self.send_command(MONITOR_COMMAND, false).is_err() {
                    return None;
                }
                self.mode = LinkMode::Streaming;
            }
            answer
        };

        match answer {
            Ok(Some(line)) if !line.is_empty() => CanFrame::parse_line(&line),
            Ok(_) => None,
            Err(err) => {
                debug!("CAN receive failed: {}", err);
                None
            }
        }
    }

    /// Next CAN line from a Carly adapter
    ///
    /// One physical read may return several frames: the first is handed out,
    /// the rest is cached and drained by the following calls.
    pub(crate) fn carly_answer(&mut self, timeout: Duration) -> Result<Option<String>> {
        {
            let mut mailbox = self.shared.lock();
            if let Some(answer) = mailbox.carly_cache.pop_front() {
                if mailbox.carly_cache.is_empty() {
                    self.mode = LinkMode::Command;
                }
                debug!("ELM CAN rec cached: {}", answer);
                return Ok(Some(answer));
            }
        }

        let read_timeout = match self.st_timeout {
            Some(st) if st > 0 => Duration::from_millis(
                st as u64 * TIMEOUT_BASE_MULTIPLIER as u64 * self.timeout_multiplier as u64
                    + CARLY_READ_SLACK_MS,
            ),
            _ => timeout,
        };
        debug!("ELM receive timeout: {:?}", read_timeout);

        let shared = self.shared.clone();
        let _busy = BusyGuard::new(&shared);
        let mut text = String::new();
        let mut records = Vec::new();
        let mut buf = [0u8; CARLY_READ_CHUNK];
        let mut start = Instant::now();

        loop {
            while self.input_pending()? {
                let read = self.stream.read(&mut buf);
                let n = self.io(read)?;
                if n == 0 {
                    break;
                }
                start = Instant::now();

                if !self.binary_data {
                    let mut finished = false;
                    for &byte in &buf[..n] {
                        match byte {
                            b'\n' => {}
                            PROMPT => finished = true,
                            _ => text.push(byte as char),
                        }
                    }
                    if finished {
                        let lines = text
                            .split('\r')
                            .map(str::trim)
                            .filter(|line| !line.is_empty())
                            .map(str::to_string)
                            .collect();
                        return Ok(self.hand_out(lines));
                    }
                    continue;
                }

                if n < 2 {
                    continue;
                }
                let last_block = match buf[0] {
                    CARLY_MORE_DATA => false,
                    CARLY_LAST_BLOCK => true,
                    _ => {
                        self.mode = LinkMode::Command;
                        debug!("ELM rec no binary data");
                        return Ok(None);
                    }
                };
                records.extend_from_slice(&buf[1..n]);
                if last_block {
                    return Ok(self.decode_records(&records));
                }
            }

            if start.elapsed() > read_timeout {
                self.mode = LinkMode::Command;
                debug!("ELM rec timeout");
                return Ok(None);
            }
            if !self.pause() {
                return Ok(None);
            }
        }
    }

    fn decode_records(&mut self, data: &[u8]) -> Option<String> {
        if data.len() % CARLY_RECORD_LEN != 0 {
            self.mode = LinkMode::Command;
            warn!("ELM CAN data length invalid: {}", data.len());
            return None;
        }

        let mut lines = VecDeque::new();
        for record in data.chunks_exact(CARLY_RECORD_LEN) {
            if record[0] != 0x06 {
                self.mode = LinkMode::Command;
                warn!("ELM CAN data high byte invalid: {:02X}", record[0]);
                return None;
            }
            if let Some(frame) = CanFrame::from_record(record) {
                lines.push_back(frame.to_line());
            }
        }
        self.hand_out(lines)
    }

    fn hand_out(&mut self, mut lines: VecDeque<String>) -> Option<String> {
        let Some(first) = lines.pop_front() else {
            self.mode = LinkMode::Command;
            debug!("ELM CAN receive list empty");
            return None;
        };
        if lines.is_empty() {
            self.mode = LinkMode::Command;
        } else {
            self.shared.lock().carly_cache = lines;
        }
        debug!("ELM CAN rec: {}", first);
        Some(first)
    }

    /// Run the init handshake and classify the adapter
    pub(crate) fn initialize(&mut self) -> Result<AdapterKind> {
        self.mode = LinkMode::Command;
        self.kind = AdapterKind::Standard;
        self.binary_data = false;
        self.timeout_multiplier = 1;
        self.shared.set_receiver_busy(false);
        self.shared.set_carly(false);
        self.shared.clear_buffers();
        self.shared.lock().carly_cache.clear();

        for (index, entry) in INIT_COMMANDS.iter().enumerate() {
            match self.send_command(entry.command, entry.ok_response) {
                Ok(()) => {
                    if entry.command.eq_ignore_ascii_case(TIMEOUT_MULTIPLIER_COMMAND) {
                        self.timeout_multiplier = 5;
                    }
                }
                Err(err) if entry.is_optional() => {
                    warn!("ELM optional command {} failed: {}", entry.command, err);
                }
                Err(err) if index == 0 => {
                    // the first command may be eaten by a stale line
                    debug!("ELM first command {} failed, retrying: {}", entry.command, err);
                    self.send_command(entry.command, entry.ok_response)
                        .map_err(|err| init_failed(entry.command, err))?;
                }
                Err(err) => return Err(init_failed(entry.command, err)),
            }
            if !entry.ok_response {
                let timeout = self.command_timeout();
                if self.receive_answer(timeout, false)?.is_none() {
                    debug!("ELM no answer to {}", entry.command);
                }
            }
        }
        info!("ELM timeout multiplier: {}", self.timeout_multiplier);

        let identity = self.query(IDENTITY_COMMAND)?;
        info!("ELM ID: {}", identity);
        let manufacturer = self.query(MANUFACTURER_COMMAND)?;
        info!("ELM Manufacturer: {}", manufacturer);

        let kind = AdapterKind::classify(&identity, &manufacturer);
        self.kind = kind;
        if kind == AdapterKind::FullTransport && !self.config.allow_full_transport {
            warn!("WGSOFT adapter not supported");
            return Err(ElmError::UnsupportedAdapter(manufacturer));
        }
        info!("ELM adapter kind: {:?}", kind);

        for entry in kind.transport_commands() {
            match self.send_command(entry.command, true) {
                Ok(()) => {
                    if entry.command.eq_ignore_ascii_case(BINARY_MODE_COMMAND) {
                        self.binary_data = true;
                    }
                }
                Err(err) if entry.is_optional() => {
                    warn!("ELM optional command {} failed: {}", entry.command, err);
                }
                Err(err) => return Err(init_failed(entry.command, err)),
            }
        }
        info!("ELM binary data: {}", self.binary_data);

        self.shared.set_carly(kind == AdapterKind::Carly);
        self.can_header = Some(DEFAULT_CAN_HEADER);
        self.st_timeout = None;
        self.shared.set_stream_failure(false);
        Ok(kind)
    }

    /// Send a query command and return its trimmed answer
    fn query(&mut self, command: &str) -> Result<String> {
        self.send_command(command, false)
            .map_err(|err| init_failed(command, err))?;
        let answer = self
            .receive_answer(self.command_timeout(), false)?
            .unwrap_or_default();
        Ok(answer.trim_end_matches('>').trim().to_string())
    }
}

fn init_failed(command: &str, err: ElmError) -> ElmError {
    ElmError::InitFailed(format!("{command}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStream;

    fn test_config() -> ElmConfig {
        ElmConfig {
            command_timeout_ms: 200,
            data_timeout_ms: 200,
            poll_interval_ms: 1,
            min_frame_gap_ms: 1,
            ..ElmConfig::default()
        }
    }

    fn link(mock: &MockStream) -> ElmLink<MockStream> {
        ElmLink::new(mock.clone(), test_config(), Arc::new(Shared::new()))
    }

    #[test]
    fn test_initialize_standard() {
        let mock = MockStream::elm327();
        let mut link = link(&mock);
        assert_eq!(link.initialize().unwrap(), AdapterKind::Standard);
        assert_eq!(link.timeout_multiplier(), 5);
        assert_eq!(link.mode(), LinkMode::Command);

        let sent = mock.sent_lines();
        assert_eq!(sent[0], "ATD");
        assert_eq!(sent[1], "ATE0");
        assert!(sent.contains(&"AT@1".to_string()));
        assert!(sent.contains(&"AT#1".to_string()));
    }

    #[test]
    fn test_optional_command_failure_is_ignored() {
        let mock = MockStream::elm327();
        mock.reject_command("ATJE");
        mock.reject_command("ATCTM5");
        let mut link = link(&mock);
        assert_eq!(link.initialize().unwrap(), AdapterKind::Standard);
        assert_eq!(link.timeout_multiplier(), 1);
        assert_eq!(link.command_timeout(), Duration::from_millis(200));
        assert_eq!(link.data_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_timeouts_scaled_by_multiplier() {
        let mock = MockStream::elm327();
        let mut link = link(&mock);
        assert_eq!(link.command_timeout(), Duration::from_millis(200));
        link.initialize().unwrap();
        assert_eq!(link.command_timeout(), Duration::from_millis(1000));
        assert_eq!(link.data_timeout(), Duration::from_millis(1000));

        let carly = MockStream::with_identity("CARLY-UNIVERSAL 1.0", "Carly");
        let mut carly_link = ElmLink::new(carly, test_config(), Arc::new(Shared::new()));
        assert_eq!(carly_link.initialize().unwrap(), AdapterKind::Carly);
        let carly_ms = carly_link.config().carly_data_timeout_ms;
        assert_eq!(carly_link.data_timeout(), Duration::from_millis(carly_ms * 5));
    }

    #[test]
    fn test_mandatory_command_failure_aborts() {
        let mock = MockStream::elm327();
        mock.reject_command("ATSPB");
        let mut link = link(&mock);
        let err = link.initialize().unwrap_err();
        assert!(matches!(err, ElmError::InitFailed(ref msg) if msg.starts_with("ATSPB")));
    }

    #[test]
    fn test_first_command_is_retried() {
        let mock = MockStream::elm327();
        mock.reject_command("ATD");
        let mut link = link(&mock);
        assert!(link.initialize().is_err());
        assert_eq!(mock.count_sent("ATD"), 2);
    }

    #[test]
    fn test_can_header_cache() {
        let mock = MockStream::elm327();
        let mut link = link(&mock);
        link.initialize().unwrap();
        mock.clear_sent();

        link.select_can_header(0x6F1, false).unwrap();
        assert!(mock.sent_lines().is_empty());
        link.select_can_header(0x6F2, false).unwrap();
        link.select_can_header(0x6F2, false).unwrap();
        assert_eq!(mock.sent_lines(), vec!["ATSH6F2"]);
    }

    #[test]
    fn test_st_timeout_cache() {
        let mock = MockStream::elm327();
        let mut link = link(&mock);
        link.initialize().unwrap();
        mock.clear_sent();

        link.send_can_telegram(&[0x12, 0x02, 0x1A, 0x80], true).unwrap();
        assert_eq!(link.mode(), LinkMode::Streaming);
        link.send_can_telegram(&[0x12, 0x02, 0x1A, 0x80], true).unwrap();
        assert_eq!(mock.count_sent("ATSTFF"), 1);

        // a zero timeout is always re-sent
        link.send_can_telegram(&[0x12, 0x21, 0x00], false).unwrap();
        link.send_can_telegram(&[0x12, 0x22, 0x00], false).unwrap();
        assert_eq!(mock.count_sent("ATST00"), 2);
        assert_eq!(link.mode(), LinkMode::Command);
    }

    #[test]
    fn test_receive_can_frame() {
        let mock = MockStream::elm327();
        mock.on_can(|_, _| vec!["612 F1 02 5A 80".to_string()]);
        let mut link = link(&mock);
        link.initialize().unwrap();

        link.send_can_telegram(&[0x12, 0x02, 0x1A, 0x80], true).unwrap();
        let frame = link.receive_can_frame(Duration::from_millis(200)).unwrap();
        assert_eq!(frame.id, 0x612);
        assert_eq!(frame.data, vec![0xF1, 0x02, 0x5A, 0x80]);
    }

    #[test]
    fn test_prompt_switches_to_monitor_mode() {
        let mock = MockStream::elm327();
        let mut link = link(&mock);
        link.initialize().unwrap();
        link.send_can_telegram(&[0x12, 0x02, 0x1A, 0x80], true).unwrap();

        mock.push_input(b"NO DATA\r\r>");
        // "NO DATA", the empty line, then the prompt
        for _ in 0..3 {
            assert!(link.receive_can_frame(Duration::from_millis(100)).is_none());
        }
        assert_eq!(mock.count_sent(MONITOR_COMMAND), 1);
        assert_eq!(link.mode(), LinkMode::Streaming);
    }

    #[test]
    fn test_leave_data_mode_sends_spaces() {
        let mock = MockStream::elm327();
        let mut link = link(&mock);
        link.initialize().unwrap();
        link.send_can_telegram(&[0x12, 0x02, 0x1A, 0x80], true).unwrap();

        link.leave_data_mode(Duration::from_millis(200)).unwrap();
        assert_eq!(link.mode(), LinkMode::Command);
    }

    #[test]
    fn test_leave_data_mode_with_buffered_prompt() {
        let mock = MockStream::elm327();
        let mut link = link(&mock);
        link.initialize().unwrap();
        link.send_can_telegram(&[0x12, 0x02, 0x1A, 0x80], true).unwrap();

        mock.push_input(b"\r>");
        mock.set_write_failure(true);
        // no write needed: the prompt is already there
        link.leave_data_mode(Duration::from_millis(200)).unwrap();
        assert_eq!(link.mode(), LinkMode::Command);
    }

    #[test]
    fn test_write_failure_sets_stream_failure() {
        let mock = MockStream::elm327();
        let mut link = link(&mock);
        mock.set_write_failure(true);
        assert!(matches!(link.send_command("ATE0", true), Err(ElmError::Stream(_))));
        assert!(link.shared().stream_failure());

        // later failures keep the flag without raising it again
        assert!(matches!(link.send_command("ATE0", true), Err(ElmError::Stream(_))));
        assert!(!link.shared().mark_stream_failure());
    }

    #[test]
    fn test_carly_binary_records() {
        let mock = MockStream::with_identity("CARLY-UNIVERSAL 1.0", "Carly");
        mock.on_can(|_, _| {
            vec![
                "612F1100A5A800102".to_string(),
                "612F121030405060708".to_string(),
            ]
        });
        let mut link = link(&mock);
        assert_eq!(link.initialize().unwrap(), AdapterKind::Carly);
        assert!(mock.count_sent(BINARY_MODE_COMMAND) == 1);

        link.send_can_telegram(&[0x1A, 0x80], true).unwrap();
        assert_eq!(mock.count_sent("ATST19"), 1);

        let first = link.receive_can_frame(Duration::from_millis(200)).unwrap();
        assert_eq!(first.pci(), Some(0x10));
        assert!(link.shared().receiver_busy());
        let second = link.receive_can_frame(Duration::from_millis(200)).unwrap();
        assert_eq!(second.pci(), Some(0x21));
        assert_eq!(link.mode(), LinkMode::Command);
        assert!(!link.shared().receiver_busy());
    }

    #[test]
    fn test_carly_text_answers_without_binary_mode() {
        let mock = MockStream::with_identity("CARLY-UNIVERSAL 1.0", "Carly");
        mock.reject_command(BINARY_MODE_COMMAND);
        mock.on_can(|_, _| vec!["612F1025A80".to_string(), ">".to_string()]);
        let mut link = link(&mock);
        assert_eq!(link.initialize().unwrap(), AdapterKind::Carly);
        assert!(mock.count_sent("ATPBC101") == 1);

        link.send_can_telegram(&[0x1A, 0x80], true).unwrap();
        let frame = link.receive_can_frame(Duration::from_millis(200)).unwrap();
        assert_eq!(frame.id, 0x612);
        assert_eq!(frame.data, vec![0xF1, 0x02, 0x5A, 0x80]);
        assert_eq!(link.mode(), LinkMode::Command);
    }

    #[test]
    fn test_carly_rejects_invalid_high_byte() {
        let mock = MockStream::with_identity("CARLY-UNIVERSAL 1.0", "Carly");
        let mut link = link(&mock);
        link.initialize().unwrap();
        link.send_can_telegram(&[0x1A, 0x80], true).unwrap();

        let mut chunk = vec![0xBE, 0x07, 0x12];
        chunk.extend_from_slice(&[0u8; 8]);
        mock.push_input(&chunk);
        assert!(link.receive_can_frame(Duration::from_millis(200)).is_none());
        assert_eq!(link.mode(), LinkMode::Command);
    }
}
