#![no_std]

//! Records emitted by kernscope probes.
//!
//! Every type here is a fixed-size value with no pointers. These are the
//! only data that cross from the probe side to the consumer, so they must be:
//! - `#[repr(C)]` for a stable memory layout
//! - `Copy` so they can be pushed into an output channel by value
//! - Fixed size (no dynamic allocation)
//!
//! There is no version field. Producer and consumer are deployed together.

/// Command name length (matches TASK_COMM_LEN in kernel)
pub const COMM_LEN: usize = 16;

/// Bytes of a single path segment name (matches DNAME_INLINE_LEN)
pub const PATH_SEGMENT_LEN: usize = 32;

/// Capacity of the path carried in a [`FileEvent`]. The configured walk
/// depth may be lower but never higher.
pub const MAX_PATH_DEPTH: usize = 11;

/// Walk depth used when nothing else is configured
pub const DEFAULT_PATH_DEPTH: usize = 8;

/// Maximum question name bytes copied out of a DNS packet
pub const DNS_NAME_LEN: usize = 253;

/// Filter rule value: abort the walk and drop the operation
pub const ACTION_IGNORE: u8 = 0;

/// Filter rule value: stop the walk and report the operation
pub const ACTION_RECORD: u8 = 1;

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// [`FileEvent::flags`] bit: the walk hit the depth ceiling before the root
pub const PATH_TRUNCATED: u8 = 1 << 0;

/// [`FileEvent::flags`] bit: a RECORD rule matched on the walk
pub const PATH_RULE_MATCHED: u8 = 1 << 1;

/// Bytes of a NUL-padded buffer up to (not including) the first NUL.
pub fn trim_nul(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    &buf[..end]
}

// =============================================================================
// Connections
// =============================================================================

/// A socket connection observed at `tcp_v4_connect` return or on a
/// UDP send/receive.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Process ID (tgid)
    pub id: u64,
    /// Timestamp in nanoseconds
    pub ts: u64,
    /// Thread ID
    pub tid: u32,
    /// Address family (AF_INET=2, AF_INET6=10)
    pub family: u16,
    /// IPPROTO_TCP or IPPROTO_UDP
    pub protocol: u8,
    _pad1: u8,
    /// Source port (host byte order)
    pub sport: u16,
    /// Destination port (host byte order)
    pub dport: u16,
    _pad2: u32,
    /// Process command name (null-terminated)
    pub comm: [u8; COMM_LEN],
    /// Source address. IPv4 is stored IPv4-mapped (`::ffff:a.b.c.d`).
    pub saddr: [u8; 16],
    /// Destination address, same encoding as `saddr`
    pub daddr: [u8; 16],
}

impl ConnectionEvent {
    /// Create a new zeroed event
    pub const fn zeroed() -> Self {
        Self {
            id: 0,
            ts: 0,
            tid: 0,
            family: 0,
            protocol: 0,
            _pad1: 0,
            sport: 0,
            dport: 0,
            _pad2: 0,
            comm: [0u8; COMM_LEN],
            saddr: [0u8; 16],
            daddr: [0u8; 16],
        }
    }
}

/// Encode an IPv4 address (network byte order octets) as IPv4-mapped IPv6.
pub const fn ipv4_mapped(octets: [u8; 4]) -> [u8; 16] {
    [
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, octets[0], octets[1], octets[2], octets[3],
    ]
}

/// Counters kept by a volume aggregator.
///
/// For sockets `reads`/`rbytes` count receives and `writes`/`wbytes` count sends.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Volumes {
    pub reads: u64,
    pub writes: u64,
    pub rbytes: u64,
    pub wbytes: u64,
}

impl Volumes {
    /// Delta for one read (or receive) of `bytes`
    pub const fn read(bytes: u64) -> Self {
        Self {
            reads: 1,
            writes: 0,
            rbytes: bytes,
            wbytes: 0,
        }
    }

    /// Delta for one write (or send) of `bytes`
    pub const fn write(bytes: u64) -> Self {
        Self {
            reads: 0,
            writes: 1,
            rbytes: 0,
            wbytes: bytes,
        }
    }

    pub fn add(&mut self, delta: &Volumes) {
        self.reads = self.reads.saturating_add(delta.reads);
        self.writes = self.writes.saturating_add(delta.writes);
        self.rbytes = self.rbytes.saturating_add(delta.rbytes);
        self.wbytes = self.wbytes.saturating_add(delta.wbytes);
    }
}

/// Traffic direction of a [`VolumeEvent`]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send = 1,
    Recv = 2,
}

/// Bytes moved on a connection by a single send or receive
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeEvent {
    pub conn: ConnectionEvent,
    pub direction: Direction,
    _pad1: [u8; 7],
    /// Bytes moved by this call
    pub bytes: u64,
    /// Running totals for the connection since it was last evicted
    pub totals: Volumes,
}

impl VolumeEvent {
    pub const fn new(conn: ConnectionEvent, direction: Direction, bytes: u64, totals: Volumes) -> Self {
        Self {
            conn,
            direction,
            _pad1: [0; 7],
            bytes,
            totals,
        }
    }
}

// =============================================================================
// Files
// =============================================================================

/// One resolved ancestor of a file: inode number and short name
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathSegment {
    pub ino: u64,
    pub name: [u8; PATH_SEGMENT_LEN],
}

impl PathSegment {
    pub const fn zeroed() -> Self {
        Self {
            ino: 0,
            name: [0u8; PATH_SEGMENT_LEN],
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileAccessKind {
    Read = 1,
    Write = 2,
}

/// Regular-file read or write with its resolved path.
///
/// `path[..depth]` holds the segments leaf first. When `flags` has
/// [`PATH_TRUNCATED`] set, segments closest to the root are missing.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileEvent {
    /// Process ID (tgid)
    pub id: u64,
    /// Timestamp in nanoseconds
    pub ts: u64,
    /// Thread ID
    pub tid: u32,
    pub access: FileAccessKind,
    /// Number of valid entries in `path`
    pub depth: u8,
    /// PATH_TRUNCATED | PATH_RULE_MATCHED
    pub flags: u8,
    _pad1: u8,
    /// Bytes moved by this call
    pub bytes: u64,
    /// Inode number of the file itself
    pub inode: u64,
    /// Counter snapshot for this (id, inode) key after this access
    pub volumes: Volumes,
    pub comm: [u8; COMM_LEN],
    pub path: [PathSegment; MAX_PATH_DEPTH],
}

impl FileEvent {
    pub const fn zeroed() -> Self {
        Self {
            id: 0,
            ts: 0,
            tid: 0,
            access: FileAccessKind::Read,
            depth: 0,
            flags: 0,
            _pad1: 0,
            bytes: 0,
            inode: 0,
            volumes: Volumes {
                reads: 0,
                writes: 0,
                rbytes: 0,
                wbytes: 0,
            },
            comm: [0u8; COMM_LEN],
            path: [PathSegment::zeroed(); MAX_PATH_DEPTH],
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        let depth = (self.depth as usize).min(MAX_PATH_DEPTH);
        &self.path[..depth]
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & PATH_TRUNCATED != 0
    }
}

// =============================================================================
// Packets
// =============================================================================

/// A DNS question parsed out of a UDP/IPv4 packet
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DnsQueryEvent {
    /// Timestamp in nanoseconds
    pub ts: u64,
    /// DNS transaction id
    pub id: u16,
    /// Header flags word
    pub flags: u16,
    pub qtype: u16,
    pub qclass: u16,
    /// Source IPv4 address (network byte order octets)
    pub saddr: [u8; 4],
    /// Destination IPv4 address (network byte order octets)
    pub daddr: [u8; 4],
    pub sport: u16,
    pub dport: u16,
    /// Number of valid bytes in `name`
    pub name_len: u16,
    /// Question name in wire format (length-prefixed labels), without the
    /// terminating zero byte
    pub name: [u8; DNS_NAME_LEN],
    _pad1: [u8; 1],
}

impl DnsQueryEvent {
    pub const fn zeroed() -> Self {
        Self {
            ts: 0,
            id: 0,
            flags: 0,
            qtype: 0,
            qclass: 0,
            saddr: [0; 4],
            daddr: [0; 4],
            sport: 0,
            dport: 0,
            name_len: 0,
            name: [0u8; DNS_NAME_LEN],
            _pad1: [0; 1],
        }
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = (self.name_len as usize).min(DNS_NAME_LEN);
        &self.name[..len]
    }
}

/// Per-packet traffic summary from the router probe
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketEvent {
    pub ts: u64,
    /// Frame size in bytes
    pub size: u32,
    pub saddr: [u8; 4],
    pub daddr: [u8; 4],
    pub sport: u16,
    pub dport: u16,
    /// IP protocol number
    pub proto: u8,
    _pad1: [u8; 7],
}

impl PacketEvent {
    pub const fn zeroed() -> Self {
        Self {
            ts: 0,
            size: 0,
            saddr: [0; 4],
            daddr: [0; 4],
            sport: 0,
            dport: 0,
            proto: 0,
            _pad1: [0; 7],
        }
    }
}

/// A TCP segment whose payload starts with a TLS handshake record
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlsHandshakeEvent {
    pub ts: u64,
    pub saddr: [u8; 4],
    pub daddr: [u8; 4],
    pub sport: u16,
    pub dport: u16,
    pub version_major: u8,
    pub version_minor: u8,
    _pad1: [u8; 2],
}

impl TlsHandshakeEvent {
    pub const fn zeroed() -> Self {
        Self {
            ts: 0,
            saddr: [0; 4],
            daddr: [0; 4],
            sport: 0,
            dport: 0,
            version_major: 0,
            version_minor: 0,
            _pad1: [0; 2],
        }
    }
}

// =============================================================================
// Syscalls
// =============================================================================

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallEvent {
    /// Process ID (tgid)
    pub id: u64,
    pub ts: u64,
    pub syscall_nr: u64,
    pub tid: u32,
    _pad1: u32,
    pub comm: [u8; COMM_LEN],
}

impl SyscallEvent {
    pub const fn zeroed() -> Self {
        Self {
            id: 0,
            ts: 0,
            syscall_nr: 0,
            tid: 0,
            _pad1: 0,
            comm: [0u8; COMM_LEN],
        }
    }
}

// =============================================================================
// Unified record
// =============================================================================

/// Any record a probe can push into an output channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeRecord {
    Connection(ConnectionEvent),
    Volume(VolumeEvent),
    File(FileEvent),
    DnsQuery(DnsQueryEvent),
    Packet(PacketEvent),
    TlsHandshake(TlsHandshakeEvent),
    Syscall(SyscallEvent),
}

impl ProbeRecord {
    /// Timestamp embedded in the record. Consumers order by this, never by
    /// arrival order.
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            ProbeRecord::Connection(e) => e.ts,
            ProbeRecord::Volume(e) => e.conn.ts,
            ProbeRecord::File(e) => e.ts,
            ProbeRecord::DnsQuery(e) => e.ts,
            ProbeRecord::Packet(e) => e.ts,
            ProbeRecord::TlsHandshake(e) => e.ts,
            ProbeRecord::Syscall(e) => e.ts,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProbeRecord::Connection(_) => "connection",
            ProbeRecord::Volume(_) => "volume",
            ProbeRecord::File(_) => "file",
            ProbeRecord::DnsQuery(_) => "dns_query",
            ProbeRecord::Packet(_) => "packet",
            ProbeRecord::TlsHandshake(_) => "tls_handshake",
            ProbeRecord::Syscall(_) => "syscall",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_record_sizes_are_stable() {
        assert_eq!(size_of::<ConnectionEvent>(), 80);
        assert_eq!(size_of::<PathSegment>(), 40);
        assert_eq!(size_of::<Volumes>(), 32);
        assert_eq!(size_of::<VolumeEvent>(), 80 + 8 + 8 + 32);
        assert_eq!(size_of::<PacketEvent>(), 32);
    }

    #[test]
    fn test_trim_nul() {
        assert_eq!(trim_nul(b"bash\0\0\0"), b"bash");
        assert_eq!(trim_nul(b"full"), b"full");
        assert_eq!(trim_nul(b"\0"), b"");
    }

    #[test]
    fn test_ipv4_mapped() {
        let mapped = ipv4_mapped([10, 0, 0, 1]);
        assert_eq!(&mapped[10..], &[0xff, 0xff, 10, 0, 0, 1]);
        assert!(mapped[..10].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_event_segments_bounded_by_depth() {
        let mut event = FileEvent::zeroed();
        event.depth = 3;
        assert_eq!(event.segments().len(), 3);
        event.depth = 200;
        assert_eq!(event.segments().len(), MAX_PATH_DEPTH);
    }
}
