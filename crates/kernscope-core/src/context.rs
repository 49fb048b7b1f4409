//! What the host hands every hook invocation.

use kernscope_common::COMM_LEN;

/// Identity of the current task and CPU at the moment a hook fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationContext {
    /// Process id in the upper 32 bits, thread id in the lower
    pub pid_tgid: u64,
    /// Processor that received the event
    pub cpu: u32,
    /// Monotonic timestamp in nanoseconds
    pub ts_ns: u64,
    /// Task command name, NUL padded
    pub comm: [u8; COMM_LEN],
}

impl InvocationContext {
    pub fn new(pid: u32, tid: u32, cpu: u32, ts_ns: u64) -> Self {
        Self {
            pid_tgid: pid_tgid(pid, tid),
            cpu,
            ts_ns,
            comm: [0u8; COMM_LEN],
        }
    }

    /// Set the command name, truncating to leave room for a NUL
    pub fn with_comm(mut self, comm: &str) -> Self {
        self.comm = [0u8; COMM_LEN];
        let bytes = comm.as_bytes();
        let len = bytes.len().min(COMM_LEN - 1);
        self.comm[..len].copy_from_slice(&bytes[..len]);
        self
    }

    pub fn pid(&self) -> u32 {
        (self.pid_tgid >> 32) as u32
    }

    pub fn tid(&self) -> u32 {
        self.pid_tgid as u32
    }
}

/// Pack a process and thread id the way the kernel reports them
pub fn pid_tgid(pid: u32, tid: u32) -> u64 {
    ((pid as u64) << 32) | tid as u64
}
