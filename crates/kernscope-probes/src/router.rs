//! Per-packet traffic router
//!
//! Summarizes every IPv4 TCP or UDP frame. The router never drops traffic.

use kernscope_common::{PacketEvent, ProbeRecord, IPPROTO_TCP, IPPROTO_UDP};
use kernscope_core::memory::MemoryReader;
use kernscope_core::metrics::ProbeStats;
use kernscope_core::InvocationContext;

use crate::manager::ProbeManager;
use crate::packet::{parse_ipv4, ports, PacketCursor, PacketVerdict};

/// Summarize an IPv4 TCP/UDP frame, or `None` for anything else
pub fn parse_traffic(frame: &[u8], ts: u64) -> Option<PacketEvent> {
    let cursor = PacketCursor::new(frame);
    let ip = parse_ipv4(&cursor)?;
    if ip.protocol != IPPROTO_TCP && ip.protocol != IPPROTO_UDP {
        return None;
    }
    let (sport, dport) = ports(&cursor, ip.l4_offset)?;

    let mut event = PacketEvent::zeroed();
    event.ts = ts;
    event.size = u32::try_from(frame.len()).unwrap_or(u32::MAX);
    event.saddr = ip.saddr;
    event.daddr = ip.daddr;
    event.sport = sport;
    event.dport = dport;
    event.proto = ip.protocol;
    Some(event)
}

impl<R: MemoryReader> ProbeManager<R> {
    pub fn route_packet(&self, ctx: &InvocationContext, frame: &[u8]) -> PacketVerdict {
        ProbeStats::inc(&self.stats.packets);
        match parse_traffic(frame, ctx.ts_ns) {
            Some(event) => self.emit_packet("router", ctx, ProbeRecord::Packet(event)),
            None => PacketVerdict::Pass,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ctx, eth_ipv4, probe_config, tcp, udp};
    use kernscope_core::memory::SimulatedMemory;
    use proptest::prelude::*;

    /// Ethernet, minimal IPv4 and the two port fields
    const PORTS_END: usize = 14 + 20 + 4;

    #[test]
    fn test_tcp_summary() {
        let frame = eth_ipv4(IPPROTO_TCP, [10, 0, 0, 1], [1, 1, 1, 1], &tcp(51000, 443, &[0u8; 100]));
        let event = parse_traffic(&frame, 5).unwrap();
        assert_eq!(event.size as usize, frame.len());
        assert_eq!(event.proto, IPPROTO_TCP);
        assert_eq!((event.sport, event.dport), (51000, 443));
        assert_eq!(event.daddr, [1, 1, 1, 1]);
        assert_eq!(event.ts, 5);
    }

    #[test]
    fn test_other_protocols_pass() {
        let icmp = eth_ipv4(1, [10, 0, 0, 1], [10, 0, 0, 2], &[8, 0, 0, 0, 0, 0, 0, 0]);
        assert!(parse_traffic(&icmp, 0).is_none());
        // UDP header cut short
        let frame = eth_ipv4(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], &[0, 53]);
        assert!(parse_traffic(&frame, 0).is_none());
    }

    #[test]
    fn test_route_never_drops() {
        let (manager, mut channels) = ProbeManager::attach(probe_config(), SimulatedMemory::new()).unwrap();
        let task = ctx(0, 0);
        let udp_frame = eth_ipv4(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], &udp(1, 2, b"hi"));

        assert_eq!(manager.route_packet(&task, &udp_frame), PacketVerdict::Emit);
        assert_eq!(manager.route_packet(&task, &[0u8; 4]), PacketVerdict::Pass);

        let out = channels.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(manager.stats().snapshot().packets, 2);
    }

    #[test]
    fn test_overflowed_summary_passes() {
        let mut config = probe_config();
        config.output.cpus = 1;
        config.output.capacity = 1;
        let (manager, mut channels) = ProbeManager::attach(config, SimulatedMemory::new()).unwrap();
        let task = ctx(0, 0);
        let frame = eth_ipv4(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(1, 2, b"hi"));

        assert_eq!(manager.route_packet(&task, &frame), PacketVerdict::Emit);
        assert_eq!(manager.route_packet(&task, &frame), PacketVerdict::Pass);
        assert_eq!(channels.drain().len(), 1);
        assert_eq!(manager.stats().snapshot().dropped, 1);
    }

    proptest! {
        #[test]
        fn test_arbitrary_frames_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = parse_traffic(&bytes, 0);
        }

        #[test]
        fn test_prefix_without_ports_never_summarized(
            udp_frame in any::<bool>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let full = if udp_frame {
                eth_ipv4(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], &udp(1000, 2000, &payload))
            } else {
                eth_ipv4(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(1000, 2000, &payload))
            };
            let event = parse_traffic(&full, 0).unwrap();
            prop_assert_eq!((event.sport, event.dport), (1000, 2000));

            for len in 0..PORTS_END {
                prop_assert!(parse_traffic(&full[..len], 0).is_none(), "prefix {} summarized", len);
            }
        }
    }
}
