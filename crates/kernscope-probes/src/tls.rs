//! TLS handshake sniffer
//!
//! Flags TCP segments whose payload opens with a TLS handshake record
//! header. Only the five-byte record header is inspected.

use kernscope_common::{ProbeRecord, TlsHandshakeEvent, IPPROTO_TCP};
use kernscope_core::memory::MemoryReader;
use kernscope_core::metrics::ProbeStats;
use kernscope_core::InvocationContext;

use crate::manager::ProbeManager;
use crate::packet::{parse_ipv4, ports, PacketCursor, PacketVerdict};

/// TLS record content type for handshake messages
pub const CONTENT_HANDSHAKE: u8 = 0x16;
const TLS_RECORD_HLEN: usize = 5;
/// Highest minor version accepted under major version 3 (TLS 1.3)
const MAX_MINOR: u8 = 4;

pub fn parse_tls_handshake(frame: &[u8], ts: u64) -> Option<TlsHandshakeEvent> {
    let cursor = PacketCursor::new(frame);
    let ip = parse_ipv4(&cursor)?;
    if ip.protocol != IPPROTO_TCP {
        return None;
    }
    let (sport, dport) = ports(&cursor, ip.l4_offset)?;
    let data_offset = (cursor.u8_at(ip.l4_offset + 12)? >> 4) as usize * 4;
    if data_offset < 20 {
        return None;
    }

    let record: [u8; TLS_RECORD_HLEN] = cursor.array_at(ip.l4_offset + data_offset)?;
    let (major, minor) = (record[1], record[2]);
    if record[0] != CONTENT_HANDSHAKE || major != 3 || minor > MAX_MINOR {
        return None;
    }

    let mut event = TlsHandshakeEvent::zeroed();
    event.ts = ts;
    event.saddr = ip.saddr;
    event.daddr = ip.daddr;
    event.sport = sport;
    event.dport = dport;
    event.version_major = major;
    event.version_minor = minor;
    Some(event)
}

impl<R: MemoryReader> ProbeManager<R> {
    pub fn sniff_tls(&self, ctx: &InvocationContext, frame: &[u8]) -> PacketVerdict {
        ProbeStats::inc(&self.stats.packets);
        let Some(event) = parse_tls_handshake(frame, ctx.ts_ns) else {
            return PacketVerdict::Pass;
        };
        self.emit_packet("tls", ctx, ProbeRecord::TlsHandshake(event))
    }
}
