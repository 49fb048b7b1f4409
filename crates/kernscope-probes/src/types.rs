//! Consumer-side views of probe records
//!
//! Raw records are fixed-size and NUL-padded. The types here turn them into
//! owned, serializable values: command names become strings, addresses
//! become [`IpAddr`], DNS names are dotted and paths are joined.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use kernscope_common::{
    trim_nul, ConnectionEvent, Direction, DnsQueryEvent, FileAccessKind, FileEvent, PacketEvent,
    ProbeRecord, SyscallEvent, TlsHandshakeEvent, Volumes, AF_INET, IPPROTO_TCP, IPPROTO_UDP,
    PATH_RULE_MATCHED, PATH_TRUNCATED,
};
use kernscope_core::Emitted;
use serde::{Deserialize, Serialize};

/// Lossy UTF-8 of a NUL-padded buffer
pub fn comm_str(comm: &[u8]) -> String {
    String::from_utf8_lossy(trim_nul(comm)).into_owned()
}

/// Address from a 16-byte field. IPv4-mapped values decode as IPv4.
pub fn ip_addr(raw: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(raw);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// Dotted form of a wire-format DNS name.
///
/// Stops at a zero label, a compression pointer or the end of the buffer.
pub fn dns_name(wire: &[u8]) -> String {
    let mut labels = Vec::new();
    let mut pos = 0;
    while let Some(&len) = wire.get(pos) {
        if len == 0 || len & 0xc0 != 0 {
            break;
        }
        let start = pos + 1;
        let end = (start + len as usize).min(wire.len());
        labels.push(String::from_utf8_lossy(&wire[start..end]).into_owned());
        pos = end;
    }
    labels.join(".")
}

/// Join leaf-first segments into a root-to-leaf path.
///
/// Only a walk that reached the root gets a leading `/`; a truncated walk
/// or one stopped by a RECORD rule yields a relative suffix.
pub fn join_path(event: &FileEvent) -> String {
    let names: Vec<String> = event
        .segments()
        .iter()
        .rev()
        .map(|seg| comm_str(&seg.name))
        .filter(|name| !name.is_empty() && name != "/")
        .collect();
    let joined = names.join("/");
    if event.flags & (PATH_TRUNCATED | PATH_RULE_MATCHED) == 0 {
        format!("/{}", joined)
    } else {
        joined
    }
}

fn protocol_name(protocol: u8) -> String {
    match protocol {
        IPPROTO_TCP => "tcp".to_string(),
        IPPROTO_UDP => "udp".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedConnection {
    pub pid: u64,
    pub tid: u32,
    pub comm: String,
    pub protocol: String,
    pub ipv6: bool,
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
}

impl From<&ConnectionEvent> for DecodedConnection {
    fn from(event: &ConnectionEvent) -> Self {
        Self {
            pid: event.id,
            tid: event.tid,
            comm: comm_str(&event.comm),
            protocol: protocol_name(event.protocol),
            ipv6: event.family != AF_INET,
            saddr: ip_addr(event.saddr),
            sport: event.sport,
            daddr: ip_addr(event.daddr),
            dport: event.dport,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedVolumes {
    pub reads: u64,
    pub writes: u64,
    pub rbytes: u64,
    pub wbytes: u64,
}

impl From<Volumes> for DecodedVolumes {
    fn from(v: Volumes) -> Self {
        Self {
            reads: v.reads,
            writes: v.writes,
            rbytes: v.rbytes,
            wbytes: v.wbytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodedDirection {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodedAccess {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedFile {
    pub pid: u64,
    pub tid: u32,
    pub comm: String,
    pub access: DecodedAccess,
    pub bytes: u64,
    pub inode: u64,
    pub path: String,
    pub truncated: bool,
    pub rule_matched: bool,
    pub volumes: DecodedVolumes,
}

impl From<&FileEvent> for DecodedFile {
    fn from(event: &FileEvent) -> Self {
        Self {
            pid: event.id,
            tid: event.tid,
            comm: comm_str(&event.comm),
            access: match event.access {
                FileAccessKind::Read => DecodedAccess::Read,
                FileAccessKind::Write => DecodedAccess::Write,
            },
            bytes: event.bytes,
            inode: event.inode,
            path: join_path(event),
            truncated: event.flags & PATH_TRUNCATED != 0,
            rule_matched: event.flags & PATH_RULE_MATCHED != 0,
            volumes: event.volumes.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedDnsQuery {
    pub id: u16,
    pub flags: u16,
    pub response: bool,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    pub saddr: Ipv4Addr,
    pub sport: u16,
    pub daddr: Ipv4Addr,
    pub dport: u16,
}

impl From<&DnsQueryEvent> for DecodedDnsQuery {
    fn from(event: &DnsQueryEvent) -> Self {
        Self {
            id: event.id,
            flags: event.flags,
            response: event.flags & 0x8000 != 0,
            name: dns_name(event.name_bytes()),
            qtype: event.qtype,
            qclass: event.qclass,
            saddr: Ipv4Addr::from(event.saddr),
            sport: event.sport,
            daddr: Ipv4Addr::from(event.daddr),
            dport: event.dport,
        }
    }
}

/// Record payload, tagged by `kind` when serialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedRecord {
    Connection(DecodedConnection),
    Volume {
        connection: DecodedConnection,
        direction: DecodedDirection,
        bytes: u64,
        totals: DecodedVolumes,
    },
    File(DecodedFile),
    DnsQuery(DecodedDnsQuery),
    Packet {
        size: u32,
        protocol: String,
        saddr: Ipv4Addr,
        sport: u16,
        daddr: Ipv4Addr,
        dport: u16,
    },
    TlsHandshake {
        version: String,
        saddr: Ipv4Addr,
        sport: u16,
        daddr: Ipv4Addr,
        dport: u16,
    },
    Syscall {
        pid: u64,
        tid: u32,
        comm: String,
        nr: u64,
    },
}

impl From<&ProbeRecord> for DecodedRecord {
    fn from(record: &ProbeRecord) -> Self {
        match record {
            ProbeRecord::Connection(e) => DecodedRecord::Connection(e.into()),
            ProbeRecord::Volume(e) => DecodedRecord::Volume {
                connection: (&e.conn).into(),
                direction: match e.direction {
                    Direction::Send => DecodedDirection::Send,
                    Direction::Recv => DecodedDirection::Recv,
                },
                bytes: e.bytes,
                totals: e.totals.into(),
            },
            ProbeRecord::File(e) => DecodedRecord::File(e.into()),
            ProbeRecord::DnsQuery(e) => DecodedRecord::DnsQuery(e.into()),
            ProbeRecord::Packet(e) => packet(e),
            ProbeRecord::TlsHandshake(e) => tls(e),
            ProbeRecord::Syscall(e) => syscall(e),
        }
    }
}

fn packet(e: &PacketEvent) -> DecodedRecord {
    DecodedRecord::Packet {
        size: e.size,
        protocol: protocol_name(e.proto),
        saddr: Ipv4Addr::from(e.saddr),
        sport: e.sport,
        daddr: Ipv4Addr::from(e.daddr),
        dport: e.dport,
    }
}

fn tls(e: &TlsHandshakeEvent) -> DecodedRecord {
    DecodedRecord::TlsHandshake {
        version: format!("{}.{}", e.version_major, e.version_minor),
        saddr: Ipv4Addr::from(e.saddr),
        sport: e.sport,
        daddr: Ipv4Addr::from(e.daddr),
        dport: e.dport,
    }
}

fn syscall(e: &SyscallEvent) -> DecodedRecord {
    DecodedRecord::Syscall {
        pid: e.id,
        tid: e.tid,
        comm: comm_str(&e.comm),
        nr: e.syscall_nr,
    }
}

/// One output line: where the record came from plus its decoded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub cpu: u32,
    pub ts: u64,
    #[serde(flatten)]
    pub record: DecodedRecord,
}

impl From<&Emitted<ProbeRecord>> for DecodedEvent {
    fn from(emitted: &Emitted<ProbeRecord>) -> Self {
        Self {
            cpu: emitted.cpu,
            ts: emitted.record.timestamp_ns(),
            record: (&emitted.record).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernscope_common::{ipv4_mapped, PathSegment, PATH_SEGMENT_LEN};

    fn segment(ino: u64, name: &str) -> PathSegment {
        let mut seg = PathSegment::zeroed();
        seg.ino = ino;
        let len = name.len().min(PATH_SEGMENT_LEN);
        seg.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        seg
    }

    fn file_event(names: &[&str], flags: u8) -> FileEvent {
        let mut event = FileEvent::zeroed();
        for (i, name) in names.iter().enumerate() {
            event.path[i] = segment(i as u64 + 1, name);
        }
        event.depth = names.len() as u8;
        event.flags = flags;
        event
    }

    #[test]
    fn test_ip_addr_unmaps_v4() {
        assert_eq!(ip_addr(ipv4_mapped([10, 0, 0, 1])), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let loopback = Ipv6Addr::LOCALHOST.octets();
        assert_eq!(ip_addr(loopback), IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn test_dns_name() {
        assert_eq!(dns_name(b"\x07example\x03com"), "example.com");
        assert_eq!(dns_name(b""), "");
        // Compression pointer ends the name
        assert_eq!(dns_name(b"\x03www\xc0\x0c"), "www");
        // Label running off the end keeps what is there
        assert_eq!(dns_name(b"\x05ab"), "ab");
    }

    #[test]
    fn test_join_complete_path() {
        let event = file_event(&["passwd", "etc", "/"], 0);
        assert_eq!(join_path(&event), "/etc/passwd");
    }

    #[test]
    fn test_join_partial_paths_are_relative() {
        let truncated = file_event(&["c", "b"], PATH_TRUNCATED);
        assert_eq!(join_path(&truncated), "b/c");
        let matched = file_event(&["app.log", "log"], PATH_RULE_MATCHED);
        assert_eq!(join_path(&matched), "log/app.log");
    }

    #[test]
    fn test_connection_decoding() {
        let mut event = ConnectionEvent::zeroed();
        event.id = 7;
        event.family = AF_INET;
        event.protocol = IPPROTO_TCP;
        event.saddr = ipv4_mapped([192, 168, 1, 2]);
        event.daddr = ipv4_mapped([1, 1, 1, 1]);
        event.dport = 443;
        event.comm[..4].copy_from_slice(b"curl");

        let decoded = DecodedConnection::from(&event);
        assert_eq!(decoded.comm, "curl");
        assert_eq!(decoded.protocol, "tcp");
        assert!(!decoded.ipv6);
        assert_eq!(decoded.daddr.to_string(), "1.1.1.1");
    }

    #[test]
    fn test_event_serializes_flat() {
        let mut raw = SyscallEvent::zeroed();
        raw.id = 3;
        raw.ts = 99;
        raw.syscall_nr = 59;
        let emitted = Emitted {
            cpu: 1,
            record: ProbeRecord::Syscall(raw),
        };

        let value = serde_json::to_value(DecodedEvent::from(&emitted)).unwrap();
        assert_eq!(value["kind"], "syscall");
        assert_eq!(value["cpu"], 1);
        assert_eq!(value["ts"], 99);
        assert_eq!(value["nr"], 59);

        let back: DecodedEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.record, DecodedRecord::from(&emitted.record));
    }
}
