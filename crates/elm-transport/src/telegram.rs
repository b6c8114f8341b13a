//! BMW-FAST Telegram and ISO-TP Frame Encoding
//!
//! BMW-FAST telegrams are carried over ISO 15765-2 using extended addressing:
//! the first CAN data byte holds the target address and the PCI byte follows,
//! which leaves six payload bytes in a single or consecutive frame and five in
//! a first frame.

use crate::error::{ElmError, Result};

/// Header bits of a physically addressed telegram
pub const FAST_PHYSICAL: u8 = 0x80;
/// Header bits of a functionally addressed (broadcast) telegram
pub const FAST_FUNCTIONAL: u8 = 0xC0;

const ADDRESS_MODE_MASK: u8 = 0xC0;
const LENGTH_MASK: u8 = 0x3F;

/// Data length of a classic CAN frame
pub const CAN_FRAME_LEN: usize = 8;
/// Payload bytes that fit into a single frame
pub const SF_MAX_DATA: usize = 6;
/// Payload bytes carried by a first frame
pub const FF_DATA: usize = 5;
/// Payload bytes carried by a consecutive frame
pub const CF_MAX_DATA: usize = 6;
/// Largest payload a first frame can announce (12 bit length field)
pub const ISOTP_MAX_DATA: usize = 0xFFF;

/// High byte shared by all diagnostic CAN IDs (`0x6xx`)
pub const DIAG_CAN_BASE: u16 = 0x600;

/// Calculate the BMW-FAST checksum (byte sum, mod 256)
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &x| acc.wrapping_add(x))
}

/// Decoded BMW-FAST header of a request buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastHeader {
    /// Functional (broadcast) addressing requested
    pub functional: bool,
    /// Target ECU address
    pub target: u8,
    /// Source (tester) address
    pub source: u8,
    /// Offset of the first payload byte
    pub data_offset: usize,
    /// Number of payload bytes
    pub data_len: usize,
}

impl FastHeader {
    /// Parse the header of a telegram and check that the declared payload is present
    pub fn parse(telegram: &[u8]) -> Result<Self> {
        if telegram.len() < 4 {
            return Err(ElmError::InvalidTelegram(format!(
                "telegram too short: {} bytes",
                telegram.len()
            )));
        }

        let functional = telegram[0] & ADDRESS_MODE_MASK == FAST_FUNCTIONAL;
        let mut data_offset = 3;
        let mut data_len = (telegram[0] & LENGTH_MASK) as usize;
        if data_len == 0 {
            // length byte(s) follow the addresses
            if telegram[3] == 0x00 {
                if telegram.len() < 6 {
                    return Err(ElmError::InvalidTelegram(
                        "missing escaped length bytes".to_string(),
                    ));
                }
                data_len = u16::from_be_bytes([telegram[4], telegram[5]]) as usize;
                data_offset = 6;
            } else {
                data_len = telegram[3] as usize;
                data_offset = 4;
            }
        }

        if telegram.len() < data_offset + data_len {
            return Err(ElmError::InvalidTelegram(format!(
                "declares {} data bytes, only {} present",
                data_len,
                telegram.len() - data_offset
            )));
        }

        Ok(Self {
            functional,
            target: telegram[1],
            source: telegram[2],
            data_offset,
            data_len,
        })
    }

    /// Payload slice of the telegram this header was parsed from
    pub fn payload<'a>(&self, telegram: &'a [u8]) -> &'a [u8] {
        &telegram[self.data_offset..self.data_offset + self.data_len]
    }

    /// CAN ID the adapter has to transmit with for this request
    pub fn can_header(&self) -> u16 {
        DIAG_CAN_BASE | self.source as u16
    }
}

/// Whether a header byte announces a long request (escaped or > 2 bytes)
pub fn is_long_request(header: u8) -> bool {
    let len = header & LENGTH_MASK;
    len == 0 || len > 2
}

/// Build a BMW-FAST telegram (without checksum)
///
/// Lengths up to 0x3F are encoded in the header byte, up to 0xFF in one
/// extra length byte and anything larger as `00 HI LO`.
pub fn encode_telegram(mode: u8, target: u8, source: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut telegram = Vec::with_capacity(len + 7);
    if len > 0xFF {
        telegram.extend_from_slice(&[mode, target, source, 0x00, (len >> 8) as u8, len as u8]);
    } else if len > 0x3F {
        telegram.extend_from_slice(&[mode, target, source, len as u8]);
    } else {
        telegram.extend_from_slice(&[mode | len as u8, target, source]);
    }
    telegram.extend_from_slice(payload);
    telegram
}

/// ISO-TP frame type taken from the PCI high nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Single,
    First,
    Consecutive,
    FlowControl,
}

impl FrameKind {
    /// Decode the frame type of a PCI byte
    pub fn from_pci(pci: u8) -> Option<Self> {
        match pci >> 4 {
            0 => Some(FrameKind::Single),
            1 => Some(FrameKind::First),
            2 => Some(FrameKind::Consecutive),
            3 => Some(FrameKind::FlowControl),
            _ => None,
        }
    }
}

/// A CAN frame as reported by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// 11 bit CAN identifier
    pub id: u16,
    /// Frame data (address byte, PCI, payload)
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Parse an adapter text line such as `612 F1 02 5A 80`
    ///
    /// The line must hold an odd number (3..=19) of hex digits: three for the
    /// CAN ID, two per data byte.
    pub fn parse_line(line: &str) -> Option<Self> {
        let compact: String = line.chars().filter(|c| *c != ' ').collect();
        if compact.len() % 2 == 0 || compact.len() < 3 || compact.len() > 19 {
            return None;
        }
        if !compact.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let id = u16::from_str_radix(&compact[..3], 16).ok()?;
        let data = hex::decode(&compact[3..]).ok()?;
        Some(Self { id, data })
    }

    /// Parse a 10 byte binary record (`ID-HI ID-LO` + 8 data bytes)
    pub fn from_record(record: &[u8]) -> Option<Self> {
        if record.len() != 2 + CAN_FRAME_LEN {
            return None;
        }
        Some(Self {
            id: u16::from_be_bytes([record[0], record[1]]),
            data: record[2..].to_vec(),
        })
    }

    /// Render the frame in adapter text form
    pub fn to_line(&self) -> String {
        format!("{:03X}{}", self.id, hex::encode_upper(&self.data))
    }

    /// Whether the frame uses a diagnostic CAN ID (`0x6xx`)
    pub fn is_diagnostic(&self) -> bool {
        self.id & 0xFF00 == DIAG_CAN_BASE
    }

    /// Address of the sending ECU (low byte of the CAN ID)
    pub fn sender(&self) -> u8 {
        (self.id & 0xFF) as u8
    }

    /// Extended address byte (receiver of this frame)
    pub fn address(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// PCI byte
    pub fn pci(&self) -> Option<u8> {
        self.data.get(1).copied()
    }

    /// Bytes following the PCI byte
    pub fn payload(&self) -> &[u8] {
        self.data.get(2..).unwrap_or(&[])
    }
}

/// Build a single frame
pub fn single_frame(target: u8, payload: &[u8]) -> [u8; CAN_FRAME_LEN] {
    let len = payload.len().min(SF_MAX_DATA);
    let mut frame = [0u8; CAN_FRAME_LEN];
    frame[0] = target;
    frame[1] = len as u8;
    frame[2..2 + len].copy_from_slice(&payload[..len]);
    frame
}

/// Build a first frame announcing `total_len` payload bytes
pub fn first_frame(target: u8, total_len: usize, head: &[u8]) -> [u8; CAN_FRAME_LEN] {
    let len = head.len().min(FF_DATA);
    let mut frame = [0u8; CAN_FRAME_LEN];
    frame[0] = target;
    frame[1] = 0x10 | ((total_len >> 8) & 0x0F) as u8;
    frame[2] = total_len as u8;
    frame[3..3 + len].copy_from_slice(&head[..len]);
    frame
}

/// Build a consecutive frame; only the low nibble of `sequence` is used
pub fn consecutive_frame(target: u8, sequence: u8, chunk: &[u8]) -> [u8; CAN_FRAME_LEN] {
    let len = chunk.len().min(CF_MAX_DATA);
    let mut frame = [0u8; CAN_FRAME_LEN];
    frame[0] = target;
    frame[1] = 0x20 | (sequence & 0x0F);
    frame[2..2 + len].copy_from_slice(&chunk[..len]);
    frame
}

/// Build a clear-to-send flow control frame
pub fn flow_control_frame(target: u8, block_size: u8, sep_time: u8) -> [u8; CAN_FRAME_LEN] {
    let mut frame = [0u8; CAN_FRAME_LEN];
    frame[0] = target;
    frame[1] = 0x30;
    frame[2] = block_size;
    frame[3] = sep_time;
    frame
}

/// Number of consecutive frames needed for a payload of `len` bytes
pub fn consecutive_frame_count(len: usize) -> usize {
    if len <= SF_MAX_DATA {
        0
    } else {
        (len - FF_DATA).div_ceil(CF_MAX_DATA)
    }
}

/// Splits a payload into ISO-TP frames
///
/// Yields a single frame for payloads up to six bytes, otherwise a first
/// frame followed by consecutive frames numbered from 1 (mod 16).
pub struct Segmenter<'a> {
    target: u8,
    payload: &'a [u8],
    offset: usize,
    sequence: u8,
    started: bool,
}

impl<'a> Segmenter<'a> {
    /// Create a segmenter for `payload` addressed to `target`
    pub fn new(target: u8, payload: &'a [u8]) -> Self {
        Self {
            target,
            payload,
            offset: 0,
            sequence: 1,
            started: false,
        }
    }

    /// Whether the payload fits into one single frame
    pub fn is_single(&self) -> bool {
        self.payload.len() <= SF_MAX_DATA
    }

    /// Payload bytes not yet emitted
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }
}

impl Iterator for Segmenter<'_> {
    type Item = [u8; CAN_FRAME_LEN];

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if self.is_single() {
                self.offset = self.payload.len();
                return Some(single_frame(self.target, self.payload));
            }
            self.offset = FF_DATA;
            return Some(first_frame(
                self.target,
                self.payload.len(),
                &self.payload[..FF_DATA],
            ));
        }

        if self.remaining() == 0 {
            return None;
        }
        let end = (self.offset + CF_MAX_DATA).min(self.payload.len());
        let frame = consecutive_frame(self.target, self.sequence, &self.payload[self.offset..end]);
        self.offset = end;
        self.sequence = self.sequence.wrapping_add(1);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0x82, 0x12, 0xF1]), 0x85);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn test_parse_inline_length() {
        let telegram = [0x82, 0x12, 0xF1, 0x1A, 0x80];
        let header = FastHeader::parse(&telegram).unwrap();
        assert!(!header.functional);
        assert_eq!(header.target, 0x12);
        assert_eq!(header.source, 0xF1);
        assert_eq!(header.payload(&telegram), &[0x1A, 0x80]);
        assert_eq!(header.can_header(), 0x6F1);
    }

    #[test]
    fn test_parse_length_byte() {
        let mut telegram = vec![0x80, 0x12, 0xF1, 0x40];
        telegram.extend(std::iter::repeat(0xAA).take(0x40));
        let header = FastHeader::parse(&telegram).unwrap();
        assert_eq!(header.data_offset, 4);
        assert_eq!(header.data_len, 0x40);
    }

    #[test]
    fn test_parse_escaped_length() {
        let mut telegram = vec![0x80, 0x12, 0xF1, 0x00, 0x01, 0x02];
        telegram.extend(std::iter::repeat(0x55).take(0x102));
        let header = FastHeader::parse(&telegram).unwrap();
        assert_eq!(header.data_offset, 6);
        assert_eq!(header.data_len, 0x102);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(FastHeader::parse(&[0x82, 0x12, 0xF1]).is_err());
        assert!(FastHeader::parse(&[0x85, 0x12, 0xF1, 0x01]).is_err());
        assert!(FastHeader::parse(&[0x80, 0x12, 0xF1, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_functional_flag() {
        let header = FastHeader::parse(&[0xC1, 0xDF, 0xF1, 0x3E]).unwrap();
        assert!(header.functional);
        assert!(!is_long_request(0xC1));
        assert!(!is_long_request(0xC2));
        assert!(is_long_request(0xC3));
        assert!(is_long_request(0xC0));
    }

    #[test]
    fn test_encode_length_forms() {
        assert_eq!(
            encode_telegram(FAST_PHYSICAL, 0xF1, 0x12, &[0x5A]),
            vec![0x81, 0xF1, 0x12, 0x5A]
        );

        let medium = encode_telegram(FAST_PHYSICAL, 0xF1, 0x12, &[0u8; 0x40]);
        assert_eq!(&medium[..4], &[0x80, 0xF1, 0x12, 0x40]);
        assert_eq!(medium.len(), 0x44);

        let long = encode_telegram(FAST_PHYSICAL, 0xF1, 0x12, &[0u8; 0x123]);
        assert_eq!(&long[..6], &[0x80, 0xF1, 0x12, 0x00, 0x01, 0x23]);
        assert_eq!(long.len(), 0x129);
    }

    #[test]
    fn test_parse_can_line() {
        let frame = CanFrame::parse_line("612 F1 02 5A 80").unwrap();
        assert_eq!(frame.id, 0x612);
        assert_eq!(frame.data, vec![0xF1, 0x02, 0x5A, 0x80]);
        assert!(frame.is_diagnostic());
        assert_eq!(frame.sender(), 0x12);
        assert_eq!(frame.pci(), Some(0x02));
        assert_eq!(frame.to_line(), "612F1025A80");
    }

    #[test]
    fn test_parse_can_line_rejects_garbage() {
        assert!(CanFrame::parse_line("612F1").is_none()); // even length
        assert!(CanFrame::parse_line("NO DATA").is_none());
        assert!(CanFrame::parse_line("61").is_none());
        assert!(CanFrame::parse_line("612F10102030405060708").is_none()); // too long
        assert!(CanFrame::parse_line("61ZF102").is_none());
    }

    #[test]
    fn test_from_record() {
        let record = [0x06, 0x12, 0xF1, 0x02, 0x5A, 0x80, 0, 0, 0, 0];
        let frame = CanFrame::from_record(&record).unwrap();
        assert_eq!(frame.id, 0x612);
        assert_eq!(frame.to_line(), "612F1025A8000000000");
        assert!(CanFrame::from_record(&record[..9]).is_none());
    }

    #[test]
    fn test_eight_byte_payload_frames() {
        let payload = [0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17];
        let frames: Vec<_> = Segmenter::new(0x12, &payload).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], [0x12, 0x10, 0x08, 0x10, 0x11, 0x12, 0x13, 0x14]);
        assert_eq!(frames[1], [0x12, 0x21, 0x15, 0x16, 0x17, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_single_frame_padding() {
        let frames: Vec<_> = Segmenter::new(0x12, &[0x1A, 0x80]).collect();
        assert_eq!(frames, vec![[0x12, 0x02, 0x1A, 0x80, 0, 0, 0, 0]]);
    }

    #[test]
    fn test_flow_control_frame() {
        assert_eq!(flow_control_frame(0x12, 8, 0), [0x12, 0x30, 0x08, 0x00, 0, 0, 0, 0]);
    }

    proptest! {
        #[test]
        fn prop_short_payload_is_single_frame(
            payload in proptest::collection::vec(any::<u8>(), 0..=6)
        ) {
            let frames: Vec<_> = Segmenter::new(0x12, &payload).collect();
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(frames[0][1] as usize, payload.len());
        }

        #[test]
        fn prop_consecutive_frame_count(len in 7usize..=0xFFF) {
            let payload = vec![0xA5; len];
            let frames: Vec<_> = Segmenter::new(0x12, &payload).collect();
            let expected = (len - 5).div_ceil(6);
            prop_assert_eq!(frames.len() - 1, expected);
            prop_assert_eq!(consecutive_frame_count(len), expected);
            for (index, frame) in frames.iter().skip(1).enumerate() {
                prop_assert_eq!(frame[1] & 0xF0, 0x20);
                prop_assert_eq!((frame[1] & 0x0F) as usize, (index + 1) % 16);
            }
        }

        #[test]
        fn prop_header_roundtrip(payload in proptest::collection::vec(any::<u8>(), 1..600)) {
            let telegram = encode_telegram(FAST_PHYSICAL, 0x12, 0xF1, &payload);
            let header = FastHeader::parse(&telegram).unwrap();
            prop_assert_eq!(header.payload(&telegram), &payload[..]);
        }
    }
}
