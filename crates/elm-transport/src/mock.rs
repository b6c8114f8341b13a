//! Scripted ELM327 adapter for testing (no hardware required)
//!
//! `MockStream` behaves like an adapter behind a byte stream: AT commands
//! are answered with `OK`, identity queries with the configured strings,
//! and CAN telegrams are handed to a responder closure whose returned lines
//! are replayed as ECU traffic. Handles are cheap clones sharing one state,
//! so a test can keep one while the interface owns the other.

use crate::stream::ElmStream;
use crate::telegram::{CanFrame, CAN_FRAME_LEN};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// Responder for CAN telegrams: `(can_header, data) -> response lines`
pub type CanResponder = Box<dyn FnMut(u16, &[u8]) -> Vec<String> + Send>;

struct MockState {
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<String>,
    line: String,
    interrupted: bool,
    fail_writes: bool,
    identity: String,
    manufacturer: String,
    header: u16,
    binary: bool,
    rejected: Vec<String>,
    can_responder: Option<CanResponder>,
}

impl MockState {
    fn reply(&mut self, text: &str) {
        self.inbound.push_back(text.as_bytes().to_vec());
    }

    fn handle_line(&mut self, line: String) {
        debug!("Mock adapter received: {}", line);
        self.sent.push(line.clone());
        self.interrupted = false;

        let upper = line.to_uppercase();
        if upper.starts_with("AT") {
            self.handle_command(&upper);
        } else {
            self.handle_can(&upper);
        }
    }

    fn handle_command(&mut self, command: &str) {
        if self.rejected.iter().any(|prefix| command.starts_with(prefix.as_str())) {
            self.reply("?\r\r>");
            return;
        }
        match command {
            "AT@1" => {
                let answer = format!("{}\r\r>", self.identity);
                self.reply(&answer);
            }
            "AT#1" => {
                let answer = format!("{}\r\r>", self.manufacturer);
                self.reply(&answer);
            }
            // monitor mode stays silent until traffic shows up
            "ATMA" => {}
            _ => {
                if let Some(header) = command.strip_prefix("ATSH") {
                    if let Ok(value) = u16::from_str_radix(header, 16) {
                        self.header = value;
                    }
                }
                if command == "ATGB1" {
                    self.binary = true;
                }
                self.reply("OK\r\r>");
            }
        }
    }

    fn handle_can(&mut self, line: &str) {
        let Ok(data) = hex::decode(line) else {
            self.reply("?\r\r>");
            return;
        };
        let header = self.header;
        let lines = match self.can_responder.as_mut() {
            Some(responder) => responder(header, &data),
            None => Vec::new(),
        };
        if lines.is_empty() {
            return;
        }

        if self.binary {
            let mut chunk = vec![0xBE];
            for line in &lines {
                if let Some(frame) = CanFrame::parse_line(line) {
                    chunk.extend_from_slice(&frame.id.to_be_bytes());
                    let mut data = frame.data.clone();
                    data.resize(CAN_FRAME_LEN, 0);
                    chunk.extend_from_slice(&data);
                }
            }
            self.inbound.push_back(chunk);
        } else {
            let mut text = String::new();
            for line in &lines {
                text.push_str(line);
                text.push('\r');
            }
            self.reply(&text);
        }
    }
}

/// In-memory fake ELM327 adapter
#[derive(Clone)]
pub struct MockStream {
    state: Arc<Mutex<MockState>>,
}

impl MockStream {
    /// Plain ELM327 clone
    pub fn elm327() -> Self {
        Self::with_identity("ELM327 v1.5", "OBDII to RS232 Interpreter")
    }

    /// Adapter answering `AT@1` with `identity` and `AT#1` with `manufacturer`
    pub fn with_identity(identity: &str, manufacturer: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                inbound: VecDeque::new(),
                sent: Vec::new(),
                line: String::new(),
                interrupted: false,
                fail_writes: false,
                identity: identity.to_string(),
                manufacturer: manufacturer.to_string(),
                header: 0x6F1,
                binary: false,
                rejected: Vec::new(),
                can_responder: None,
            })),
        }
    }

    /// Install the ECU side: called for every CAN telegram the host sends
    pub fn on_can<F>(&self, responder: F)
    where
        F: FnMut(u16, &[u8]) -> Vec<String> + Send + 'static,
    {
        self.state.lock().can_responder = Some(Box::new(responder));
    }

    /// Answer commands starting with `prefix` with `?`
    pub fn reject_command(&self, prefix: &str) {
        self.state.lock().rejected.push(prefix.to_uppercase());
    }

    /// Queue unsolicited input
    pub fn push_input(&self, data: &[u8]) {
        self.state.lock().inbound.push_back(data.to_vec());
    }

    /// Make every following write fail
    pub fn set_write_failure(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// All complete lines written by the host
    pub fn sent_lines(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Number of written lines starting with `prefix`
    pub fn count_sent(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    /// CAN telegrams written by the host (everything that is not an AT command)
    pub fn sent_can_lines(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|line| !line.to_uppercase().starts_with("AT"))
            .cloned()
            .collect()
    }

    /// Forget the recorded lines
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }
}

impl ElmStream for MockStream {
    fn data_available(&mut self) -> io::Result<bool> {
        Ok(!self.state.lock().inbound.is_empty())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let Some(chunk) = state.inbound.front_mut() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            state.inbound.pop_front();
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        for &byte in data {
            match byte {
                b'\r' => {
                    let line = std::mem::take(&mut state.line);
                    if !line.is_empty() {
                        state.handle_line(line);
                    }
                }
                b'\n' => {}
                b' ' if state.line.is_empty() => {
                    // any character interrupts a running CAN read
                    if !state.interrupted {
                        state.interrupted = true;
                        state.reply("STOPPED\r\r>");
                    }
                }
                _ => state.line.push(byte as char),
            }
        }
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.state.lock().inbound.clear();
        Ok(())
    }
}
