//! Bounds-checked packet access shared by the classifiers
//!
//! Classifiers run once per packet with no pending state. Every access goes
//! through [`PacketCursor`], which returns `None` instead of reading past
//! the end of the frame.

/// Ethernet header length
pub const ETH_HLEN: usize = 14;
/// EtherType for IPv4
pub const ETH_P_IP: u16 = 0x0800;

/// What a classifier decided for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    /// A record was produced; the packet continues
    Emit,
    /// Discard the packet
    Drop,
    /// Let the packet through without a record
    Pass,
}

#[derive(Debug, Clone, Copy)]
pub struct PacketCursor<'a> {
    data: &'a [u8],
}

impl<'a> PacketCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn u8_at(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    /// Big-endian (network order) u16
    pub fn be16_at(&self, offset: usize) -> Option<u16> {
        self.array_at::<2>(offset).map(u16::from_be_bytes)
    }

    pub fn array_at<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        self.slice(offset, N)?.try_into().ok()
    }

    pub fn slice(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        let end = offset.checked_add(len)?;
        self.data.get(offset..end)
    }
}

/// The parts of an IPv4 header the classifiers use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub saddr: [u8; 4],
    pub daddr: [u8; 4],
    pub protocol: u8,
    /// Offset of the transport header within the frame
    pub l4_offset: usize,
}

/// Parse the Ethernet and IPv4 headers of `frame`.
///
/// Returns `None` for non-IPv4 frames, truncated headers, and non-first
/// fragments (which carry no transport header).
pub fn parse_ipv4(frame: &PacketCursor<'_>) -> Option<Ipv4Header> {
    if frame.be16_at(12)? != ETH_P_IP {
        return None;
    }

    let ip = ETH_HLEN;
    let version_ihl = frame.u8_at(ip)?;
    if version_ihl >> 4 != 4 {
        return None;
    }
    let ihl = (version_ihl & 0x0f) as usize * 4;
    if ihl < 20 {
        return None;
    }
    frame.slice(ip, ihl)?;

    let fragment_offset = frame.be16_at(ip + 6)? & 0x1fff;
    if fragment_offset != 0 {
        return None;
    }

    Some(Ipv4Header {
        protocol: frame.u8_at(ip + 9)?,
        saddr: frame.array_at(ip + 12)?,
        daddr: frame.array_at(ip + 16)?,
        l4_offset: ip + ihl,
    })
}

/// Source and destination port of a TCP or UDP header at `offset`
pub fn ports(frame: &PacketCursor<'_>, offset: usize) -> Option<(u16, u16)> {
    Some((frame.be16_at(offset)?, frame.be16_at(offset + 2)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{eth_ipv4, udp};
    use kernscope_common::IPPROTO_UDP;

    #[test]
    fn test_cursor_bounds() {
        let data = [1u8, 2, 3];
        let cursor = PacketCursor::new(&data);
        assert_eq!(cursor.u8_at(2), Some(3));
        assert_eq!(cursor.u8_at(3), None);
        assert_eq!(cursor.be16_at(1), Some(0x0203));
        assert_eq!(cursor.be16_at(2), None);
        assert_eq!(cursor.slice(usize::MAX, 2), None);
    }

    #[test]
    fn test_parse_ipv4() {
        let frame = eth_ipv4(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], &udp(1000, 53, b"x"));
        let cursor = PacketCursor::new(&frame);
        let ip = parse_ipv4(&cursor).unwrap();
        assert_eq!(ip.protocol, IPPROTO_UDP);
        assert_eq!(ip.saddr, [10, 0, 0, 1]);
        assert_eq!(ip.daddr, [10, 0, 0, 2]);
        assert_eq!(ip.l4_offset, 34);
        assert_eq!(ports(&cursor, ip.l4_offset), Some((1000, 53)));
    }

    #[test]
    fn test_rejects_non_ipv4() {
        let mut frame = eth_ipv4(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], &udp(1, 2, b""));
        frame[12] = 0x86;
        frame[13] = 0xdd;
        assert!(parse_ipv4(&PacketCursor::new(&frame)).is_none());
    }

    #[test]
    fn test_rejects_truncated_header() {
        let frame = eth_ipv4(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], &[]);
        assert!(parse_ipv4(&PacketCursor::new(&frame[..30])).is_none());
    }

    #[test]
    fn test_rejects_later_fragment() {
        let mut frame = eth_ipv4(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], &udp(1, 2, b""));
        frame[ETH_HLEN + 6] = 0x00;
        frame[ETH_HLEN + 7] = 0x10;
        assert!(parse_ipv4(&PacketCursor::new(&frame)).is_none());
    }
}
