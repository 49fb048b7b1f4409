//! Socket handlers: TCP connect, TCP send/receive, UDP send/receive
//!
//! Connect and TCP I/O are entry/exit pairs. The entry stores the socket
//! handle; the exit re-reads the socket's addresses once the call has
//! completed. UDP hooks are single shot.

use kernscope_common::{
    ipv4_mapped, ConnectionEvent, Direction, ProbeRecord, VolumeEvent, Volumes, AF_INET, AF_INET6,
    IPPROTO_TCP, IPPROTO_UDP,
};
use kernscope_core::correlation::{CorrelationTable, PendingOp};
use kernscope_core::memory::{Handle, MemoryReader, ReadExt};
use kernscope_core::metrics::ProbeStats;
use kernscope_core::{InvocationContext, ReadError};

use crate::manager::{Outcome, ProbeManager, SkipReason};

/// Socket traffic is counted per process and connection 4-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    pub id: u64,
    pub protocol: u8,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub sport: u16,
    pub dport: u16,
}

impl From<&ConnectionEvent> for SocketKey {
    fn from(conn: &ConnectionEvent) -> Self {
        Self {
            id: conn.id,
            protocol: conn.protocol,
            saddr: conn.saddr,
            daddr: conn.daddr,
            sport: conn.sport,
            dport: conn.dport,
        }
    }
}

impl<R: MemoryReader> ProbeManager<R> {
    // =========================================================================
    // tcp_v4_connect
    // =========================================================================

    pub fn tcp_connect_entry(&self, ctx: &InvocationContext, sock: Handle) -> Outcome {
        let op = PendingOp {
            target: sock,
            started_ns: ctx.ts_ns,
        };
        self.settle("tcp_connect_entry", Ok(self.begin(&self.connect_args, ctx, op)))
    }

    /// `ret` is the connect return value; only 0 is reported
    pub fn tcp_connect_return(&self, ctx: &InvocationContext, ret: i32) -> Outcome {
        self.settle("tcp_connect_return", self.try_tcp_connect_return(ctx, ret))
    }

    fn try_tcp_connect_return(&self, ctx: &InvocationContext, ret: i32) -> Result<Outcome, ReadError> {
        let Some(pending) = self.connect_args.end(self.key(ctx)) else {
            return Ok(Outcome::Skipped(SkipReason::MissedEntry));
        };
        if ret != 0 {
            return Ok(Outcome::Skipped(SkipReason::Suppressed));
        }

        match self.read_connection(ctx, pending.target, IPPROTO_TCP)? {
            Some(conn) => Ok(self.emit(ctx, ProbeRecord::Connection(conn))),
            None => Ok(Outcome::Skipped(SkipReason::Suppressed)),
        }
    }

    // =========================================================================
    // tcp_sendmsg / tcp_recvmsg
    // =========================================================================

    pub fn tcp_sendmsg_entry(&self, ctx: &InvocationContext, sock: Handle) -> Outcome {
        let op = PendingOp {
            target: sock,
            started_ns: ctx.ts_ns,
        };
        self.settle("tcp_sendmsg_entry", Ok(self.begin(&self.send_args, ctx, op)))
    }

    /// `ret` is the byte count returned by `tcp_sendmsg`
    pub fn tcp_sendmsg_return(&self, ctx: &InvocationContext, ret: i64) -> Outcome {
        self.settle(
            "tcp_sendmsg_return",
            self.try_tcp_io_return(ctx, &self.send_args, Direction::Send, ret),
        )
    }

    pub fn tcp_recvmsg_entry(&self, ctx: &InvocationContext, sock: Handle) -> Outcome {
        let op = PendingOp {
            target: sock,
            started_ns: ctx.ts_ns,
        };
        self.settle("tcp_recvmsg_entry", Ok(self.begin(&self.recv_args, ctx, op)))
    }

    /// `ret` is the byte count returned by `tcp_recvmsg`
    pub fn tcp_recvmsg_return(&self, ctx: &InvocationContext, ret: i64) -> Outcome {
        self.settle(
            "tcp_recvmsg_return",
            self.try_tcp_io_return(ctx, &self.recv_args, Direction::Recv, ret),
        )
    }

    fn try_tcp_io_return(
        &self,
        ctx: &InvocationContext,
        table: &CorrelationTable,
        direction: Direction,
        ret: i64,
    ) -> Result<Outcome, ReadError> {
        let Some(pending) = table.end(self.key(ctx)) else {
            return Ok(Outcome::Skipped(SkipReason::MissedEntry));
        };
        if ret <= 0 {
            return Ok(Outcome::Skipped(SkipReason::Suppressed));
        }

        match self.read_connection(ctx, pending.target, IPPROTO_TCP)? {
            Some(conn) => Ok(self.record_volume(ctx, conn, direction, ret as u64)),
            None => Ok(Outcome::Skipped(SkipReason::Suppressed)),
        }
    }

    // =========================================================================
    // udp_sendmsg / udp_rcv
    // =========================================================================

    /// `len` is the payload size passed to `udp_sendmsg`
    pub fn udp_sendmsg(&self, ctx: &InvocationContext, sock: Handle, len: u64) -> Outcome {
        self.settle("udp_sendmsg", self.try_udp(ctx, sock, Direction::Send, len))
    }

    /// Socket and length are taken from the `sk_buff`
    pub fn udp_rcv(&self, ctx: &InvocationContext, skb: Handle) -> Outcome {
        self.settle("udp_rcv", self.try_udp_rcv(ctx, skb))
    }

    fn try_udp_rcv(&self, ctx: &InvocationContext, skb: Handle) -> Result<Outcome, ReadError> {
        let layout = &self.config.layout.skb;
        let sock = self.reader.read_handle(skb.field(layout.sk))?;
        let len = self.reader.read_u32(skb.field(layout.len))?;
        if sock.is_null() {
            return Ok(Outcome::Skipped(SkipReason::Suppressed));
        }
        self.try_udp(ctx, sock, Direction::Recv, len as u64)
    }

    fn try_udp(&self, ctx: &InvocationContext, sock: Handle, direction: Direction, len: u64) -> Result<Outcome, ReadError> {
        if len == 0 {
            return Ok(Outcome::Skipped(SkipReason::Suppressed));
        }
        let Some(conn) = self.read_connection(ctx, sock, IPPROTO_UDP)? else {
            return Ok(Outcome::Skipped(SkipReason::Suppressed));
        };

        let network = &self.config.network;
        if network.udp_dns_only && conn.sport != network.dns_port && conn.dport != network.dns_port {
            return Ok(Outcome::Skipped(SkipReason::NotRecorded));
        }

        Ok(self.record_volume(ctx, conn, direction, len))
    }

    // =========================================================================
    // Shared
    // =========================================================================

    /// Read a socket's family, addresses and ports as one batch.
    ///
    /// Returns `None` for families other than IPv4/IPv6 and for sockets
    /// with any address or port still zero.
    fn read_connection(
        &self,
        ctx: &InvocationContext,
        sock: Handle,
        protocol: u8,
    ) -> Result<Option<ConnectionEvent>, ReadError> {
        let layout = &self.config.layout.sock;
        let reader = &self.reader;

        let family = reader.read_u16(sock.field(layout.family))?;
        let (saddr, daddr, unset) = match family {
            AF_INET => {
                let s: [u8; 4] = reader.read_array(sock.field(layout.saddr))?;
                let d: [u8; 4] = reader.read_array(sock.field(layout.daddr))?;
                (ipv4_mapped(s), ipv4_mapped(d), s == [0; 4] || d == [0; 4])
            }
            AF_INET6 => {
                let s: [u8; 16] = reader.read_array(sock.field(layout.v6_saddr))?;
                let d: [u8; 16] = reader.read_array(sock.field(layout.v6_daddr))?;
                (s, d, s == [0; 16] || d == [0; 16])
            }
            _ => return Ok(None),
        };
        let sport = reader.read_u16(sock.field(layout.sport))?;
        let dport = reader.read_be_u16(sock.field(layout.dport))?;

        if unset || sport == 0 || dport == 0 {
            return Ok(None);
        }

        let mut conn = ConnectionEvent::zeroed();
        conn.id = ctx.pid() as u64;
        conn.ts = ctx.ts_ns;
        conn.tid = ctx.tid();
        conn.family = family;
        conn.protocol = protocol;
        conn.sport = sport;
        conn.dport = dport;
        conn.comm = ctx.comm;
        conn.saddr = saddr;
        conn.daddr = daddr;
        Ok(Some(conn))
    }

    fn record_volume(&self, ctx: &InvocationContext, conn: ConnectionEvent, direction: Direction, bytes: u64) -> Outcome {
        let delta = match direction {
            Direction::Send => Volumes::write(bytes),
            Direction::Recv => Volumes::read(bytes),
        };
        let acc = self.socket_volumes.accumulate(SocketKey::from(&conn), delta);
        if acc.evicted.is_some() {
            ProbeStats::inc(&self.stats.evictions);
        }
        self.emit(ctx, ProbeRecord::Volume(VolumeEvent::new(conn, direction, bytes, acc.totals)))
    }
}
