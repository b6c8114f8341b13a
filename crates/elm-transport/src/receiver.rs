//! CAN Transport Receiver
//!
//! [`Reassembler`] turns single, first and consecutive frames back into one
//! payload. It does no I/O: [`poll`] feeds it frames from the link, sends
//! the flow control frames it asks for and queues finished telegrams.

use crate::channel::ElmLink;
use crate::protocol::AdapterKind;
use crate::stream::ElmStream;
use crate::telegram::{
    checksum, encode_telegram, flow_control_frame, CanFrame, FrameKind, CF_MAX_DATA, FAST_PHYSICAL,
    FF_DATA, SF_MAX_DATA,
};
use tracing::{debug, info, warn};

/// A completely received ISO-TP payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    /// Sending ECU (low byte of the CAN ID)
    pub source: u8,
    /// Receiver address carried in the first data byte (the tester)
    pub target: u8,
    pub payload: Vec<u8>,
}

impl Reassembled {
    /// BMW-FAST telegram with trailing checksum
    pub fn to_telegram(&self) -> Vec<u8> {
        let mut telegram = encode_telegram(FAST_PHYSICAL, self.target, self.source, &self.payload);
        telegram.push(checksum(&telegram));
        telegram
    }
}

/// Outcome of feeding one frame to the [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Frame did not fit the current state and was dropped
    Ignored,
    /// First frame accepted; the sender at `source` waits for flow control
    FirstFrame { source: u8 },
    /// Consecutive frame appended
    Consecutive { flow_control_due: bool },
    /// Sequence error, the transfer in progress was dropped
    Aborted,
    Complete(Reassembled),
}

#[derive(Debug)]
struct Pending {
    source: u8,
    target: u8,
    sequence: u8,
    fc_remaining: u8,
    buffer: Vec<u8>,
    received: usize,
}

#[derive(Debug)]
enum State {
    Idle,
    Receiving(Pending),
}

/// ISO-TP reassembly state machine
#[derive(Debug)]
pub struct Reassembler {
    state: State,
    block_size: u8,
}

impl Reassembler {
    /// `block_size` is the value advertised in our flow control frames
    pub fn new(block_size: u8) -> Self {
        Self {
            state: State::Idle,
            block_size,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Payload bytes received for the transfer in progress
    pub fn received(&self) -> usize {
        match &self.state {
            State::Idle => 0,
            State::Receiving(pending) => pending.received,
        }
    }

    /// Feed one frame
    pub fn accept(&mut self, frame: &CanFrame) -> Progress {
        let (Some(address), Some(pci)) = (frame.address(), frame.pci()) else {
            return Progress::Ignored;
        };

        match &mut self.state {
            State::Idle => match FrameKind::from_pci(pci) {
                Some(FrameKind::Single) => {
                    let len = (pci & 0x0F) as usize;
                    let data = frame.payload();
                    if len > data.len() || len > SF_MAX_DATA {
                        debug!("Invalid SF length: {}", len);
                        return Progress::Ignored;
                    }
                    debug!("Rec SF");
                    Progress::Complete(Reassembled {
                        source: frame.sender(),
                        target: address,
                        payload: data[..len].to_vec(),
                    })
                }
                Some(FrameKind::First) => {
                    if frame.data.len() < 3 + FF_DATA {
                        debug!("Invalid FF length");
                        return Progress::Ignored;
                    }
                    let len = (((pci & 0x0F) as usize) << 8) | frame.data[2] as usize;
                    if len <= SF_MAX_DATA {
                        debug!("FF announces only {} bytes", len);
                        return Progress::Ignored;
                    }
                    debug!("Rec FF ({} bytes)", len);
                    let mut buffer = vec![0u8; len];
                    buffer[..FF_DATA].copy_from_slice(&frame.data[3..3 + FF_DATA]);
                    let source = frame.sender();
                    self.state = State::Receiving(Pending {
                        source,
                        target: address,
                        sequence: 1,
                        fc_remaining: self.block_size,
                        buffer,
                        received: FF_DATA,
                    });
                    Progress::FirstFrame { source }
                }
                _ => {
                    debug!("Rec invalid frame {:X}", pci >> 4);
                    Progress::Ignored
                }
            },
            State::Receiving(pending) => {
                if FrameKind::from_pci(pci) != Some(FrameKind::Consecutive)
                    || frame.sender() != pending.source
                    || address != pending.target
                {
                    return Progress::Ignored;
                }

                let sequence = pci & 0x0F;
                if sequence != pending.sequence & 0x0F {
                    warn!(
                        "Invalid block count: {} expected {}",
                        sequence,
                        pending.sequence & 0x0F
                    );
                    self.state = State::Idle;
                    return Progress::Aborted;
                }

                let len = (pending.buffer.len() - pending.received).min(CF_MAX_DATA);
                let data = frame.payload();
                if len > data.len() {
                    debug!("Invalid CF length");
                    return Progress::Ignored;
                }
                debug!("Rec CF");
                pending.buffer[pending.received..pending.received + len]
                    .copy_from_slice(&data[..len]);
                pending.received += len;
                pending.sequence = pending.sequence.wrapping_add(1);

                let mut flow_control_due = false;
                if pending.fc_remaining > 0 && pending.received < pending.buffer.len() {
                    pending.fc_remaining -= 1;
                    if pending.fc_remaining == 0 {
                        flow_control_due = true;
                        pending.fc_remaining = self.block_size;
                    }
                }

                if pending.received >= pending.buffer.len() {
                    return match self.complete_padded() {
                        Some(done) => Progress::Complete(done),
                        None => Progress::Ignored,
                    };
                }
                Progress::Consecutive { flow_control_due }
            }
        }
    }

    /// Finish the transfer in progress, zero filling what is missing
    pub fn complete_padded(&mut self) -> Option<Reassembled> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => None,
            State::Receiving(pending) => Some(Reassembled {
                source: pending.source,
                target: pending.target,
                payload: pending.buffer,
            }),
        }
    }
}

/// One receiver pass of the worker loop
///
/// Returns as soon as no frame is pending and no transfer is in progress,
/// a read times out, or a telegram was completed.
pub(crate) fn poll<S: ElmStream>(link: &mut ElmLink<S>) {
    let kind = link.kind();
    let block_size = link.config().can_block_size;
    let sep_time = link.config().can_sep_time;
    let data_timeout = link.data_timeout();
    let shared = link.shared().clone();
    let mut reassembler = Reassembler::new(block_size);

    loop {
        // binary Carly answers cannot be peeked
        let available = kind == AdapterKind::Carly || link.data_available();
        if reassembler.is_idle() && !available {
            return;
        }

        let Some(frame) = link.receive_can_frame(data_timeout) else {
            return;
        };
        if !frame.is_diagnostic() {
            debug!("Ignoring CAN ID {:03X}", frame.id);
            continue;
        }

        match reassembler.accept(&frame) {
            Progress::Complete(done) => {
                shared.touch();
                deliver(link, &done);
                return;
            }
            Progress::FirstFrame { source } => {
                if kind == AdapterKind::Carly && shared.lock().carly_cache.is_empty() {
                    debug!("Carly aborted transmission, creating dummy response");
                    let Some(done) = reassembler.complete_padded() else {
                        return;
                    };
                    // a single byte makes the adapter drop the transfer
                    if link.send_can_telegram(&[0x00], true).is_err() {
                        return;
                    }
                    deliver(link, &done);
                    return;
                }
                if kind.sends_flow_control() {
                    let flow_control = flow_control_frame(source, block_size, sep_time);
                    if link.send_can_telegram(&flow_control, true).is_err() {
                        return;
                    }
                }
                shared.touch();
            }
            Progress::Consecutive { flow_control_due } => {
                if flow_control_due && kind.sends_flow_control() {
                    debug!("(Rec) Send FC");
                    let flow_control = flow_control_frame(frame.sender(), block_size, sep_time);
                    if link.send_can_telegram(&flow_control, true).is_err() {
                        return;
                    }
                }
                shared.touch();
            }
            Progress::Aborted | Progress::Ignored => {}
        }

        if shared.terminating() {
            return;
        }
    }
}

fn deliver<S: ElmStream>(link: &ElmLink<S>, done: &Reassembled) {
    info!("Received length: {}", done.payload.len());
    link.shared().push_response(&done.to_telegram());
}
