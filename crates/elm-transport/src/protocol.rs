//! ELM327 Protocol Definitions
//!
//! Init command tables, ECU address lists and adapter classification.

use serde::{Deserialize, Serialize};

/// One AT command of an init sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElmInitEntry {
    /// Command text without trailing `\r`
    pub command: &'static str,
    /// Minimum firmware version; commands carrying one are optional
    pub version: Option<u16>,
    /// Whether the adapter answers with `OK`
    pub ok_response: bool,
}

impl ElmInitEntry {
    /// Mandatory command answered with `OK`
    pub const fn new(command: &'static str) -> Self {
        Self {
            command,
            version: None,
            ok_response: true,
        }
    }

    /// Command only understood by firmware `version` and later
    pub const fn optional(command: &'static str, version: u16) -> Self {
        Self {
            command,
            version: Some(version),
            ok_response: true,
        }
    }

    /// Failure of this command is logged and ignored
    pub fn is_optional(&self) -> bool {
        self.version.is_some()
    }
}

/// Base init sequence run for every adapter
pub const INIT_COMMANDS: &[ElmInitEntry] = &[
    ElmInitEntry::new("ATD"),
    ElmInitEntry::new("ATE0"),
    ElmInitEntry::new("ATSH6F1"),
    ElmInitEntry::new("ATCF600"),
    ElmInitEntry::new("ATCM700"),
    ElmInitEntry::new("ATPBC001"),
    ElmInitEntry::new("ATSPB"),
    ElmInitEntry::new("ATAT0"),
    ElmInitEntry::new("ATSTFF"),
    ElmInitEntry::new("ATAL"),
    ElmInitEntry::new("ATH1"),
    ElmInitEntry::new("ATS0"),
    ElmInitEntry::new("ATL0"),
    // disable silent monitoring
    ElmInitEntry::optional("ATCSM0", 210),
    ElmInitEntry::optional(TIMEOUT_MULTIPLIER_COMMAND, 210),
    // ELM data format, rejected by most clones
    ElmInitEntry::optional("ATJE", 130),
];

/// Extra setup for adapters doing ISO-TP segmentation themselves
pub const INIT_FULL_TRANSPORT: &[ElmInitEntry] = &[
    ElmInitEntry::new("ATSH6F1"),
    ElmInitEntry::new("ATFCSH6F1"),
    // CAN B custom protocol 11 bit / 500 kbit, variable DLC
    ElmInitEntry::new("ATPBC101"),
    // bypass init sequence
    ElmInitEntry::new("ATBI"),
];

/// Extra setup for Carly adapters
pub const INIT_CARLY_TRANSPORT: &[ElmInitEntry] = &[
    // older firmware keeps answering in text
    ElmInitEntry::optional(BINARY_MODE_COMMAND, 0),
    ElmInitEntry::new("ATSH6F1"),
    ElmInitEntry::new("ATFCSH6F1"),
    ElmInitEntry::new("ATPBC101"),
    ElmInitEntry::new("ATBI"),
];

/// Sets the adapter timer multiplier to 5
pub const TIMEOUT_MULTIPLIER_COMMAND: &str = "ATCTM5";
/// Switches Carly adapters to binary CAN responses
pub const BINARY_MODE_COMMAND: &str = "ATGB1";
/// Device identity query (not `OK`-checked)
pub const IDENTITY_COMMAND: &str = "AT@1";
/// Manufacturer query (not `OK`-checked)
pub const MANUFACTURER_COMMAND: &str = "AT#1";
/// CAN monitor mode, entered after the adapter prompt ends a data read
pub const MONITOR_COMMAND: &str = "ATMA";

/// CAN header configured by the init sequence
pub const DEFAULT_CAN_HEADER: u16 = 0x6F1;
/// Adapter `ATST` unit is 4 ms
pub const TIMEOUT_BASE_MULTIPLIER: u32 = 4;

/// ECU addresses queried for short functional requests (E89 series)
pub const ECU_ADDR_LIST_E89: &[u8] = &[
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0D, 0x0E, 0x0F, 0x12, 0x13,
    0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x20, 0x21, 0x22, 0x23, 0x24,
    0x26, 0x27, 0x28, 0x29, 0x2A, 0x30, 0x31, 0x32, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B,
    0x3C, 0x3D, 0x3E, 0x3F, 0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B,
    0x4C, 0x4D, 0x4E, 0x4F, 0x50, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5A, 0x5B, 0x5C, 0x5D,
    0x5E, 0x5F, 0x60, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69, 0x6A, 0x6B, 0x6C, 0x6D,
    0x6E, 0x70, 0x71, 0x72, 0x73, 0x74, 0x75, 0x77, 0x78, 0x79, 0x7A, 0x7D, 0x8B, 0x90, 0x91, 0x92,
    0x93, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9A, 0x9B, 0xA0, 0xA1, 0xA2, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8,
    0xA9, 0xAB, 0xAD, 0xAE,
];

/// ECU addresses queried for long functional requests (F01 series)
pub const ECU_ADDR_LIST_F01: &[u8] = &[
    0x00, 0x01, 0x02, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0D, 0x0E, 0x0F, 0x10, 0x11,
    0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x20, 0x21, 0x22,
    0x23, 0x24, 0x25, 0x26, 0x27, 0x29, 0x2A, 0x2B, 0x2C, 0x2D, 0x2E, 0x30, 0x31, 0x32, 0x34, 0x35,
    0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F, 0x40, 0x41, 0x42, 0x43, 0x44, 0x45,
    0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B, 0x4D, 0x4E, 0x4F, 0x50, 0x53, 0x54, 0x55, 0x56, 0x57, 0x59,
    0x5A, 0x5B, 0x5D, 0x5E, 0x5F, 0x60, 0x61, 0x63, 0x64, 0x67, 0x68, 0x69, 0x6A, 0x6B, 0x6D, 0x6E,
    0x71, 0x72, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7A, 0x7B, 0xA0, 0xA5, 0xA6, 0xA7, 0xA8,
    0xA9, 0xAB,
];

/// Address list used to fan out a functional request
pub fn functional_address_list(long_request: bool) -> &'static [u8] {
    if long_request {
        ECU_ADDR_LIST_F01
    } else {
        ECU_ADDR_LIST_E89
    }
}

/// Transport variant of the connected adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdapterKind {
    /// Plain ELM327: ISO-TP segmentation is done on the host
    #[default]
    Standard,
    /// WGSoft style adapter segmenting ISO-TP itself
    FullTransport,
    /// Carly universal adapter with binary CAN responses
    Carly,
}

impl AdapterKind {
    /// Classify an adapter from its `AT@1` and `AT#1` answers
    pub fn classify(identity: &str, manufacturer: &str) -> Self {
        if identity.to_uppercase().contains("CARLY-UNIVERSAL") {
            AdapterKind::Carly
        } else if manufacturer.to_uppercase().contains("WGSOFT") {
            AdapterKind::FullTransport
        } else {
            AdapterKind::Standard
        }
    }

    /// Adapter segments ISO-TP itself and needs per-target flow control setup
    pub fn is_full_transport(&self) -> bool {
        matches!(self, AdapterKind::FullTransport | AdapterKind::Carly)
    }

    /// Host has to send flow control frames while receiving
    pub fn sends_flow_control(&self) -> bool {
        matches!(self, AdapterKind::Standard)
    }

    /// Additional init sequence for this adapter
    pub fn transport_commands(&self) -> &'static [ElmInitEntry] {
        match self {
            AdapterKind::Standard => &[],
            AdapterKind::FullTransport => INIT_FULL_TRANSPORT,
            AdapterKind::Carly => INIT_CARLY_TRANSPORT,
        }
    }
}
