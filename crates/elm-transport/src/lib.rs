//! ELM327 CAN/ISO-TP Transport
//!
//! This crate turns an ELM327 style adapter, reached through a byte stream
//! (Wi-Fi TCP, Bluetooth SPP or USB serial), into a transport for BMW-FAST
//! diagnostic telegrams over ISO 15765-2 with extended addressing. A
//! dedicated worker thread does all adapter I/O; callers use the blocking
//! [`ElmInterface`] or the tokio based [`AsyncElmClient`].

mod channel;
mod client;
mod config;
mod error;
mod interface;
pub mod mock;
pub mod protocol;
mod receiver;
mod sender;
pub mod stream;
pub mod telegram;
mod worker;

pub use client::AsyncElmClient;
pub use config::ElmConfig;
pub use error::{ElmError, Result};
pub use interface::ElmInterface;
pub use protocol::AdapterKind;
pub use receiver::{Progress, Reassembled, Reassembler};
pub use sender::expand_functional;
pub use stream::{ElmStream, SerialElmStream, TcpElmStream};

/// Well known BMW-FAST addresses
pub mod address {
    /// Diagnostic tester
    pub const TESTER: u8 = 0xF1;
    /// Functional (broadcast) target
    pub const FUNCTIONAL: u8 = 0xDF;
}
