//! CAN Transport Sender
//!
//! Standard adapters get ISO-TP frames built on the host, with the flow
//! control handshake done here. Full transport and Carly adapters segment
//! themselves; they only need per-target flow control setup, and functional
//! requests are fanned out into one physical request per known ECU.

use crate::channel::ElmLink;
use crate::error::{ElmError, Result};
use crate::protocol::{functional_address_list, AdapterKind};
use crate::stream::ElmStream;
use crate::telegram::{is_long_request, FastHeader, Segmenter, CF_MAX_DATA, FAST_PHYSICAL};
use crate::worker::Shared;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const FC_CLEAR_TO_SEND: u8 = 0x00;
const FC_WAIT: u8 = 0x01;

/// One sender pass of the worker loop
pub(crate) fn poll<S: ElmStream>(link: &mut ElmLink<S>) {
    let result = if link.kind().is_full_transport() {
        send_full(link)
    } else {
        send_standard(link)
    };
    if let Err(err) = result {
        warn!("CAN send aborted: {}", err);
    }
}

/// Replace a functional request by physical requests to every listed ECU
///
/// Requests with more than two payload bytes (or an explicit length byte)
/// use the F01 address list, shorter ones the E89 list. Physical requests
/// are returned unchanged.
pub fn expand_functional(request: &[u8]) -> Vec<Vec<u8>> {
    let Some(&header) = request.first() else {
        return Vec::new();
    };
    if header & 0xC0 != 0xC0 {
        return vec![request.to_vec()];
    }

    let long_request = is_long_request(header);
    debug!(
        "Replacing functional address with address list, long request: {}",
        long_request
    );
    functional_address_list(long_request)
        .iter()
        .map(|&address| {
            let mut unicast = request.to_vec();
            unicast[0] = (header & !0xC0) | FAST_PHYSICAL;
            if let Some(target) = unicast.get_mut(1) {
                *target = address;
            }
            unicast
        })
        .collect()
}

/// Next request for the full transport sender, expanding the mailbox slot if needed
fn next_full_request(shared: &Shared) -> Option<Vec<u8>> {
    let mut mailbox = shared.lock();
    if mailbox.request_queue.is_empty() {
        if let Some(request) = mailbox.request.take() {
            let expanded = expand_functional(&request);
            mailbox.request_queue.extend(expanded);
        }
    }
    mailbox.request_queue.pop_front()
}

fn send_standard<S: ElmStream>(link: &mut ElmLink<S>) -> Result<()> {
    let Some(request) = link.shared().take_request() else {
        return Ok(());
    };
    let header = FastHeader::parse(&request)?;
    link.select_can_header(header.can_header(), false)?;

    let mut frames = Segmenter::new(header.target, header.payload(&request));
    let single = frames.is_single();
    let Some(first) = frames.next() else {
        return Ok(());
    };
    debug!("{}", if single { "Send SF" } else { "Send FF" });
    link.send_can_telegram(&first, true)?;
    if single {
        return Ok(());
    }

    let min_gap = Duration::from_millis(link.config().min_frame_gap_ms);
    let mut block_size = 0u8;
    let mut sep_time = 0u8;
    let mut wait_for_fc = true;
    loop {
        if wait_for_fc {
            (block_size, sep_time) = wait_flow_control(link, header.target, header.source)?;
        }

        wait_for_fc = false;
        if block_size > 0 {
            if block_size == 1 {
                wait_for_fc = true;
            }
            block_size -= 1;
        }

        let expect_response = wait_for_fc || frames.remaining() <= CF_MAX_DATA;
        let Some(frame) = frames.next() else {
            break;
        };
        debug!("Send CF");
        link.send_can_telegram(&frame, expect_response)?;
        if frames.remaining() == 0 {
            break;
        }

        if !wait_for_fc {
            thread::sleep(Duration::from_millis(sep_time as u64).max(min_gap));
        }
        if link.shared().terminating() {
            return Err(ElmError::Cancelled);
        }
    }
    Ok(())
}

/// Wait for a flow control frame from `target`; returns block size and separation time
///
/// Frames from other senders are skipped. A wait indication restarts the
/// timeout, any other flow status than clear-to-send or wait aborts.
fn wait_flow_control<S: ElmStream>(
    link: &mut ElmLink<S>,
    target: u8,
    source: u8,
) -> Result<(u8, u8)> {
    debug!("Wait for FC");
    let timeout = link.data_timeout();
    let mut deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("FC timeout");
            return Err(ElmError::Timeout(timeout.as_millis() as u64));
        }
        let Some(frame) = link.receive_can_frame(remaining) else {
            debug!("FC timeout");
            return Err(ElmError::Timeout(timeout.as_millis() as u64));
        };

        let matches = frame.data.len() >= 4
            && frame.is_diagnostic()
            && frame.sender() == target
            && frame.address() == Some(source)
            && frame.pci().is_some_and(|pci| pci & 0xF0 == 0x30);
        if matches {
            let status = frame.data[1] & 0x0F;
            let block_size = frame.data[2];
            let sep_time = frame.data[3];
            link.shared().touch();
            match status {
                FC_CLEAR_TO_SEND => {
                    debug!("BS={} ST={}", block_size, sep_time);
                    return Ok((block_size, sep_time));
                }
                FC_WAIT => {
                    debug!("Wait for next FC");
                    deadline = Instant::now() + timeout;
                }
                other => {
                    return Err(ElmError::InvalidResponse(format!("invalid FC status {other:X}")));
                }
            }
        } else {
            debug!("Ignoring {} while waiting for FC", frame.to_line());
        }

        if link.shared().terminating() {
            return Err(ElmError::Cancelled);
        }
    }
}

fn send_full<S: ElmStream>(link: &mut ElmLink<S>) -> Result<()> {
    let Some(request) = next_full_request(link.shared()) else {
        return Ok(());
    };
    let header = FastHeader::parse(&request)?;
    link.select_can_header(header.can_header(), true)?;

    let block_size = 0x00;
    let sep_time = if link.kind() == AdapterKind::Carly { 0x02 } else { 0x00 };
    link.send_command(
        &format!("ATFCSD{:02X}30{:02X}{:02X}", header.target, block_size, sep_time),
        true,
    )?;
    link.send_command(&format!("ATCEA{:02X}", header.target), true)?;
    link.send_command("ATFCSM1", true)?;

    link.send_can_telegram(header.payload(&request), true)
}
