//! DNS question classifier
//!
//! Accepts Ethernet/IPv4/UDP packets to or from the DNS port carrying a
//! single standard question. Queries and single-answer responses both
//! parse; anything else on the DNS port is malformed.

use kernscope_common::{DnsQueryEvent, ProbeRecord, DNS_NAME_LEN, IPPROTO_UDP};
use kernscope_core::config::MalformedPolicy;
use kernscope_core::memory::MemoryReader;
use kernscope_core::metrics::ProbeStats;
use kernscope_core::InvocationContext;
use thiserror::Error;
use tracing::trace;

use crate::manager::ProbeManager;
use crate::packet::{parse_ipv4, ports, PacketCursor, PacketVerdict};

const UDP_HLEN: usize = 8;
const DNS_HLEN: usize = 12;
/// A wire-format name is at most 255 bytes including the zero terminator
const MAX_WIRE_NAME: usize = 255;

/// Why a packet on the DNS port was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Malformed {
    #[error("DNS header truncated")]
    Header,
    #[error("unsupported opcode {0}")]
    Opcode(u8),
    #[error("expected one question, found {0}")]
    QuestionCount(u16),
    #[error("unexpected sections: an={an} ns={ns} ar={ar}")]
    Sections { an: u16, ns: u16, ar: u16 },
    #[error("question name not terminated")]
    Unterminated,
    #[error("question type/class truncated")]
    Question,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsParse {
    /// Not IPv4/UDP or not on the DNS port
    NotDns,
    Malformed(Malformed),
    Query(DnsQueryEvent),
}

/// Parse the question of a DNS packet in an Ethernet frame
pub fn parse_dns_query(frame: &[u8], dns_port: u16, ts: u64) -> DnsParse {
    let cursor = PacketCursor::new(frame);
    let Some(ip) = parse_ipv4(&cursor) else {
        return DnsParse::NotDns;
    };
    if ip.protocol != IPPROTO_UDP {
        return DnsParse::NotDns;
    }
    let Some((sport, dport)) = ports(&cursor, ip.l4_offset) else {
        return DnsParse::NotDns;
    };
    if sport != dns_port && dport != dns_port {
        return DnsParse::NotDns;
    }

    match parse_message(&cursor, ip.l4_offset + UDP_HLEN) {
        Ok(mut event) => {
            event.ts = ts;
            event.saddr = ip.saddr;
            event.daddr = ip.daddr;
            event.sport = sport;
            event.dport = dport;
            DnsParse::Query(event)
        }
        Err(reason) => DnsParse::Malformed(reason),
    }
}

fn parse_message(cursor: &PacketCursor<'_>, dns: usize) -> Result<DnsQueryEvent, Malformed> {
    let header: [u8; DNS_HLEN] = cursor.array_at(dns).ok_or(Malformed::Header)?;
    let field = |i: usize| u16::from_be_bytes([header[i], header[i + 1]]);
    let (id, flags) = (field(0), field(2));
    let (qd, an, ns, ar) = (field(4), field(6), field(8), field(10));

    let opcode = ((flags >> 11) & 0x0f) as u8;
    if opcode != 0 {
        return Err(Malformed::Opcode(opcode));
    }
    if qd != 1 {
        return Err(Malformed::QuestionCount(qd));
    }
    if an > 1 || ns != 0 || ar != 0 {
        return Err(Malformed::Sections { an, ns, ar });
    }

    let name_start = dns + DNS_HLEN;
    let mut terminator = None;
    for i in 0..MAX_WIRE_NAME {
        match cursor.u8_at(name_start + i) {
            Some(0) => {
                terminator = Some(i);
                break;
            }
            Some(_) => {}
            // Packet ended inside the name; the question cannot be read
            None => return Err(Malformed::Question),
        }
    }
    let name_len = terminator.ok_or(Malformed::Unterminated)?;

    let question = name_start + name_len + 1;
    let qtype = cursor.be16_at(question).ok_or(Malformed::Question)?;
    let qclass = cursor.be16_at(question + 2).ok_or(Malformed::Question)?;

    let copied = name_len.min(DNS_NAME_LEN);
    let mut event = DnsQueryEvent::zeroed();
    event.id = id;
    event.flags = flags;
    event.qtype = qtype;
    event.qclass = qclass;
    event.name_len = copied as u16;
    if let Some(name) = cursor.slice(name_start, copied) {
        event.name[..copied].copy_from_slice(name);
    }
    Ok(event)
}

impl<R: MemoryReader> ProbeManager<R> {
    /// Classify one packet, emitting a record for a parsed question.
    pub fn classify_dns(&self, ctx: &InvocationContext, frame: &[u8]) -> PacketVerdict {
        ProbeStats::inc(&self.stats.packets);
        match parse_dns_query(frame, self.config.network.dns_port, ctx.ts_ns) {
            DnsParse::NotDns => PacketVerdict::Pass,
            DnsParse::Malformed(reason) => {
                ProbeStats::inc(&self.stats.malformed);
                trace!(%reason, len = frame.len(), "Malformed DNS packet");
                match self.config.dns.on_malformed {
                    MalformedPolicy::Pass => PacketVerdict::Pass,
                    MalformedPolicy::Drop => PacketVerdict::Drop,
                }
            }
            DnsParse::Query(event) => {
                ProbeStats::inc(&self.stats.dns_parsed);
                self.emit_packet("dns", ctx, ProbeRecord::DnsQuery(event))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ctx, dns_message, eth_ipv4, probe_config, tcp, udp};
    use kernscope_common::IPPROTO_TCP;
    use kernscope_core::memory::SimulatedMemory;
    use proptest::prelude::*;

    const CLIENT: [u8; 4] = [192, 168, 1, 10];
    const RESOLVER: [u8; 4] = [8, 8, 8, 8];

    fn frame(counts: [u16; 4], name: &str) -> Vec<u8> {
        let msg = dns_message(0x1234, 0x0100, counts, name, 1);
        eth_ipv4(IPPROTO_UDP, CLIENT, RESOLVER, &udp(40000, 53, &msg))
    }

    fn query(parse: DnsParse) -> DnsQueryEvent {
        match parse {
            DnsParse::Query(event) => event,
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_single_answer_response_parses() {
        let event = query(parse_dns_query(&frame([1, 1, 0, 0], "example.com"), 53, 77));
        assert_eq!(event.ts, 77);
        assert_eq!(event.id, 0x1234);
        assert_eq!(event.saddr, CLIENT);
        assert_eq!(event.daddr, RESOLVER);
        assert_eq!(event.sport, 40000);
        assert_eq!(event.dport, 53);
        assert_eq!(event.qtype, 1);
        assert_eq!(event.qclass, 1);
        assert_eq!(event.name_bytes(), b"\x07example\x03com");
    }

    #[test]
    fn test_question_count_must_be_one() {
        assert_eq!(
            parse_dns_query(&frame([2, 0, 0, 0], "example.com"), 53, 0),
            DnsParse::Malformed(Malformed::QuestionCount(2))
        );
        assert_eq!(
            parse_dns_query(&frame([0, 0, 0, 0], "example.com"), 53, 0),
            DnsParse::Malformed(Malformed::QuestionCount(0))
        );
    }

    #[test]
    fn test_extra_sections_rejected() {
        assert!(matches!(
            parse_dns_query(&frame([1, 0, 0, 1], "example.com"), 53, 0),
            DnsParse::Malformed(Malformed::Sections { ar: 1, .. })
        ));
        assert!(matches!(
            parse_dns_query(&frame([1, 2, 0, 0], "example.com"), 53, 0),
            DnsParse::Malformed(Malformed::Sections { an: 2, .. })
        ));
    }

    #[test]
    fn test_non_standard_opcode() {
        let msg = dns_message(1, 2 << 11, [1, 0, 0, 0], "example.com", 1);
        let f = eth_ipv4(IPPROTO_UDP, CLIENT, RESOLVER, &udp(40000, 53, &msg));
        assert_eq!(parse_dns_query(&f, 53, 0), DnsParse::Malformed(Malformed::Opcode(2)));
    }

    #[test]
    fn test_not_dns() {
        let msg = dns_message(1, 0, [1, 0, 0, 0], "example.com", 1);
        let other_port = eth_ipv4(IPPROTO_UDP, CLIENT, RESOLVER, &udp(40000, 5353, &msg));
        assert_eq!(parse_dns_query(&other_port, 53, 0), DnsParse::NotDns);
        let over_tcp = eth_ipv4(IPPROTO_TCP, CLIENT, RESOLVER, &tcp(40000, 53, &msg));
        assert_eq!(parse_dns_query(&over_tcp, 53, 0), DnsParse::NotDns);
        assert_eq!(parse_dns_query(&[0u8; 10], 53, 0), DnsParse::NotDns);
    }

    #[test]
    fn test_truncated_packets_never_read_past_end() {
        let full = frame([1, 0, 0, 0], "example.com");
        // Every prefix that cuts into the DNS message must be rejected
        let dns_start = 14 + 20 + 8;
        for len in dns_start..full.len() {
            match parse_dns_query(&full[..len], 53, 0) {
                DnsParse::Malformed(_) => {}
                other => panic!("prefix {} parsed as {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_unterminated_long_name() {
        let mut msg = dns_message(1, 0, [1, 0, 0, 0], "", 1);
        msg.truncate(DNS_HLEN);
        msg.extend(std::iter::repeat(b'a').take(300));
        msg.extend_from_slice(&[0, 0, 1, 0, 1]);
        let f = eth_ipv4(IPPROTO_UDP, CLIENT, RESOLVER, &udp(40000, 53, &msg));
        assert_eq!(parse_dns_query(&f, 53, 0), DnsParse::Malformed(Malformed::Unterminated));
    }

    #[test]
    fn test_long_name_truncated_to_limit() {
        let mut msg = dns_message(1, 0, [1, 0, 0, 0], "", 1);
        msg.truncate(DNS_HLEN);
        msg.extend(std::iter::repeat(b'a').take(254));
        msg.extend_from_slice(&[0, 0, 1, 0, 1]);
        let f = eth_ipv4(IPPROTO_UDP, CLIENT, RESOLVER, &udp(40000, 53, &msg));
        let event = query(parse_dns_query(&f, 53, 0));
        assert_eq!(event.name_len as usize, DNS_NAME_LEN);
    }

    #[test]
    fn test_classify_policy() {
        let mut config = probe_config();
        config.dns.on_malformed = MalformedPolicy::Drop;
        let (manager, mut channels) = ProbeManager::attach(config, SimulatedMemory::new()).unwrap();
        let task = ctx(0, 0);

        assert_eq!(manager.classify_dns(&task, &frame([1, 1, 0, 0], "example.com")), PacketVerdict::Emit);
        assert_eq!(manager.classify_dns(&task, &frame([3, 0, 0, 0], "example.com")), PacketVerdict::Drop);
        let msg = dns_message(1, 0, [1, 0, 0, 0], "example.com", 1);
        let unrelated = eth_ipv4(IPPROTO_UDP, CLIENT, RESOLVER, &udp(1, 2, &msg));
        assert_eq!(manager.classify_dns(&task, &unrelated), PacketVerdict::Pass);

        let out = channels.drain();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].record, ProbeRecord::DnsQuery(_)));
        let stats = manager.stats().snapshot();
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.dns_parsed, 1);
    }

    #[test]
    fn test_overflowed_query_passes() {
        let mut config = probe_config();
        config.output.cpus = 1;
        config.output.capacity = 1;
        let (manager, mut channels) = ProbeManager::attach(config, SimulatedMemory::new()).unwrap();
        let task = ctx(0, 0);
        let packet = frame([1, 0, 0, 0], "example.com");

        assert_eq!(manager.classify_dns(&task, &packet), PacketVerdict::Emit);
        assert_eq!(manager.classify_dns(&task, &packet), PacketVerdict::Pass);

        assert_eq!(channels.drain().len(), 1);
        let stats = manager.stats().snapshot();
        assert_eq!(stats.dns_parsed, 2);
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_malformed_passes_by_default() {
        let (manager, mut channels) = ProbeManager::attach(probe_config(), SimulatedMemory::new()).unwrap();
        assert_eq!(
            manager.classify_dns(&ctx(0, 0), &frame([2, 0, 0, 0], "example.com")),
            PacketVerdict::Pass
        );
        assert!(channels.drain().is_empty());
    }

    proptest! {
        #[test]
        fn test_arbitrary_frames_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = parse_dns_query(&bytes, 53, 0);
        }

        #[test]
        fn test_arbitrary_payload_on_dns_port(payload in proptest::collection::vec(any::<u8>(), 0..300)) {
            let f = eth_ipv4(IPPROTO_UDP, CLIENT, RESOLVER, &udp(40000, 53, &payload));
            prop_assert_ne!(parse_dns_query(&f, 53, 0), DnsParse::NotDns);
        }

        #[test]
        fn test_prefix_of_query_never_parses(name in "[a-z]{1,20}(\\.[a-z]{1,20}){0,3}", qtype in any::<u16>()) {
            let msg = dns_message(7, 0x0100, [1, 0, 0, 0], &name, qtype);
            let full = eth_ipv4(IPPROTO_UDP, CLIENT, RESOLVER, &udp(40000, 53, &msg));
            let parsed = query(parse_dns_query(&full, 53, 0));
            prop_assert_eq!(parsed.qtype, qtype);

            for len in 0..full.len() {
                let cut = parse_dns_query(&full[..len], 53, 0);
                prop_assert!(!matches!(cut, DnsParse::Query(_)), "prefix {} parsed", len);
            }
        }
    }
}
