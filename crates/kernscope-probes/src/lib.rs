//! Probe handlers for kernscope
//!
//! Each hook is a method on [`ProbeManager`] taking the invocation context
//! and the raw hook arguments. Hooks never fail: read faults, full tables
//! and full output channels all end as a counted [`Outcome::Skipped`].
//!
//! Packet classifiers take a whole Ethernet frame and return a
//! [`PacketVerdict`].

mod connection;
mod dns;
mod file;
mod manager;
mod packet;
mod router;
mod syscall;
mod tls;
pub mod types;

#[cfg(test)]
mod fixtures;

pub use connection::SocketKey;
pub use dns::{parse_dns_query, DnsParse, Malformed};
pub use file::FileKey;
pub use manager::{Outcome, ProbeManager, SkipReason};
pub use packet::{PacketCursor, PacketVerdict};
pub use router::parse_traffic;
pub use tls::parse_tls_handshake;
pub use types::{DecodedEvent, DecodedRecord};
