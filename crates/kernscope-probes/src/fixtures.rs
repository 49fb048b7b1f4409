//! Memory images and configuration shared by handler tests.

use kernscope_common::{AF_INET, AF_INET6, PATH_SEGMENT_LEN};
use kernscope_core::config::ProbeConfig;
use kernscope_core::layout::KernelLayout;
use kernscope_core::memory::{Handle, SimulatedMemory};
use kernscope_core::InvocationContext;

pub const SOCK_SIZE: usize = 0x100;
pub const FILE_BASE: u64 = 0x5_0000;
pub const DENTRY_BASE: u64 = 0x10_0000;
pub const INODE_BASE: u64 = 0x20_0000;
pub const STRIDE: u64 = 0x100;

pub fn probe_config() -> ProbeConfig {
    let mut config = ProbeConfig::default();
    config.output.cpus = 2;
    config.output.capacity = 64;
    config
}

pub fn ctx(pid: u32, tid: u32) -> InvocationContext {
    InvocationContext::new(pid, tid, 0, 1_000).with_comm("curl")
}

/// Socket fields as they sit in kernel memory
#[derive(Debug, Clone, Copy)]
pub struct SockSpec {
    pub family: u16,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub sport: u16,
    pub dport: u16,
}

impl SockSpec {
    pub fn v4(saddr: [u8; 4], sport: u16, daddr: [u8; 4], dport: u16) -> Self {
        let mut s = [0u8; 16];
        let mut d = [0u8; 16];
        s[..4].copy_from_slice(&saddr);
        d[..4].copy_from_slice(&daddr);
        Self {
            family: AF_INET,
            saddr: s,
            daddr: d,
            sport,
            dport,
        }
    }

    pub fn v6(saddr: [u8; 16], sport: u16, daddr: [u8; 16], dport: u16) -> Self {
        Self {
            family: AF_INET6,
            saddr,
            daddr,
            sport,
            dport,
        }
    }
}

pub fn map_sock(mem: &SimulatedMemory, layout: &KernelLayout, base: u64, spec: &SockSpec) -> Handle {
    let l = &layout.sock;
    mem.map_zeroed(base, SOCK_SIZE);
    mem.write_u16(base + l.family, spec.family).unwrap();
    if spec.family == AF_INET {
        mem.write(base + l.saddr, &spec.saddr[..4]).unwrap();
        mem.write(base + l.daddr, &spec.daddr[..4]).unwrap();
    } else {
        mem.write(base + l.v6_saddr, &spec.saddr).unwrap();
        mem.write(base + l.v6_daddr, &spec.daddr).unwrap();
    }
    mem.write_u16(base + l.sport, spec.sport).unwrap();
    mem.write(base + l.dport, &spec.dport.to_be_bytes()).unwrap();
    Handle(base)
}

pub fn map_skb(mem: &SimulatedMemory, layout: &KernelLayout, base: u64, sock: Handle, len: u32) -> Handle {
    mem.map_zeroed(base, 0x100);
    mem.write_u64(base + layout.skb.sk, sock.0).unwrap();
    mem.write_u32(base + layout.skb.len, len).unwrap();
    Handle(base)
}

/// Lay out an open file whose dentry chain has the given names and inode
/// numbers, leaf first. The last entry is self-parented (the root).
pub fn map_file(mem: &SimulatedMemory, layout: &KernelLayout, names: &[&str], inos: &[u64], mode: u16) -> Handle {
    let count = names.len();
    for i in 0..count {
        let dentry = DENTRY_BASE + i as u64 * STRIDE;
        let inode = INODE_BASE + i as u64 * STRIDE;
        mem.map_zeroed(dentry, STRIDE as usize);
        mem.map_zeroed(inode, STRIDE as usize);

        let parent = if i + 1 < count { dentry + STRIDE } else { dentry };
        mem.write_u64(dentry + layout.dentry.parent, parent).unwrap();
        mem.write_u64(dentry + layout.dentry.inode, inode).unwrap();
        let mut name = [0u8; PATH_SEGMENT_LEN];
        name[..names[i].len()].copy_from_slice(names[i].as_bytes());
        mem.write(dentry + layout.dentry.iname, &name).unwrap();
        let dir_mode = if i == 0 { mode } else { 0o040755 };
        mem.write_u16(inode + layout.inode.mode, dir_mode).unwrap();
        mem.write_u64(inode + layout.inode.ino, inos[i]).unwrap();
    }

    mem.map_zeroed(FILE_BASE, 0x100);
    mem.write_u64(FILE_BASE + layout.file.dentry, DENTRY_BASE).unwrap();
    mem.write_u64(FILE_BASE + layout.file.inode, INODE_BASE).unwrap();
    Handle(FILE_BASE)
}

/// Ethernet + IPv4 frame around a transport header and payload
pub fn eth_ipv4(protocol: u8, saddr: [u8; 4], daddr: [u8; 4], l4: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame.extend_from_slice(&0x0800u16.to_be_bytes());

    let total = (20 + l4.len()) as u16;
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0x40, 0]);
    frame.push(64);
    frame.push(protocol);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&saddr);
    frame.extend_from_slice(&daddr);
    frame.extend_from_slice(l4);
    frame
}

pub fn udp(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = Vec::with_capacity(8 + payload.len());
    seg.extend_from_slice(&sport.to_be_bytes());
    seg.extend_from_slice(&dport.to_be_bytes());
    seg.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    seg.extend_from_slice(&[0, 0]);
    seg.extend_from_slice(payload);
    seg
}

pub fn tcp(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; 20];
    seg[0..2].copy_from_slice(&sport.to_be_bytes());
    seg[2..4].copy_from_slice(&dport.to_be_bytes());
    seg[12] = 5 << 4;
    seg.extend_from_slice(payload);
    seg
}

/// DNS message with the given section counts and one question for `name`
pub fn dns_message(id: u16, flags: u16, counts: [u16; 4], name: &str, qtype: u16) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&flags.to_be_bytes());
    for count in counts {
        msg.extend_from_slice(&count.to_be_bytes());
    }
    for label in name.split('.').filter(|l| !l.is_empty()) {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&qtype.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg
}
