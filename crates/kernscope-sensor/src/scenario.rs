//! Scenario replay
//!
//! A scenario is a JSON document describing a memory image, the filter
//! rules to install and a sequence of hook invocations. Replaying it drives
//! the probe handlers exactly as a host would, one invocation at a time.
//!
//! ```json
//! {
//!   "memory": [
//!     { "base": 4096, "bytes": "0a000001", "len": 256, "words": [[24, 8192]] }
//!   ],
//!   "rules": [
//!     { "inode": 7, "action": "ignore" },
//!     { "path": "/var/log", "action": "record" }
//!   ],
//!   "steps": [
//!     { "pid": 42, "tid": 42, "comm": "curl", "hook": "tcp_connect_entry", "sock": 4096 },
//!     { "pid": 42, "tid": 42, "hook": "tcp_connect_return", "ret": 0 }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};

use kernscope_core::filter::FilterAction;
use kernscope_core::memory::{Handle, MemoryReader, SimulatedMemory};
use kernscope_core::{InvocationContext, TableFull};
use kernscope_probes::{Outcome, PacketVerdict, ProbeManager};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to read scenario: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse scenario: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Region at {base:#x}: word at offset {offset} does not fit in {len} bytes")]
    Region { base: u64, offset: u64, len: usize },

    #[error("Rule must name exactly one of inode or path")]
    RuleTarget,

    #[error("Cannot stat rule path {path}: {source}")]
    RulePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    TableFull(#[from] TableFull),
}

/// One mapped object in the simulated address space
#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    pub base: u64,
    /// Initial contents
    #[serde(default, deserialize_with = "hex_bytes")]
    pub bytes: Vec<u8>,
    /// Zero-pad the region to this length
    #[serde(default)]
    pub len: Option<usize>,
    /// `[offset, value]` pairs written as native-endian u64 after `bytes`
    #[serde(default)]
    pub words: Vec<[u64; 2]>,
}

impl Region {
    fn image(&self) -> Result<Vec<u8>, ScenarioError> {
        let mut image = self.bytes.clone();
        if let Some(len) = self.len {
            if image.len() < len {
                image.resize(len, 0);
            }
        }
        for &[offset, value] in &self.words {
            let start = offset as usize;
            let slot = image
                .get_mut(start..start.saturating_add(8))
                .ok_or(ScenarioError::Region {
                    base: self.base,
                    offset,
                    len: self.len.unwrap_or(self.bytes.len()),
                })?;
            slot.copy_from_slice(&value.to_ne_bytes());
        }
        Ok(image)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub inode: Option<u64>,
    /// A real path; its inode number is looked up at load time
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub action: FilterAction,
}

impl RuleSpec {
    pub fn resolve_inode(&self) -> Result<u64, ScenarioError> {
        match (self.inode, &self.path) {
            (Some(ino), None) => Ok(ino),
            (None, Some(path)) => inode_of(path),
            _ => Err(ScenarioError::RuleTarget),
        }
    }
}

#[cfg(unix)]
fn inode_of(path: &Path) -> Result<u64, ScenarioError> {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata(path)
        .map(|meta| meta.ino())
        .map_err(|source| ScenarioError::RulePath {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn inode_of(path: &Path) -> Result<u64, ScenarioError> {
    Err(ScenarioError::RulePath {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "inode numbers need a unix host"),
    })
}

/// A hook and its raw arguments
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum Hook {
    TcpConnectEntry { sock: Handle },
    TcpConnectReturn { ret: i32 },
    TcpSendmsgEntry { sock: Handle },
    TcpSendmsgReturn { ret: i64 },
    TcpRecvmsgEntry { sock: Handle },
    TcpRecvmsgReturn { ret: i64 },
    UdpSendmsg { sock: Handle, len: u64 },
    UdpRcv { skb: Handle },
    VfsReadEntry { file: Handle },
    VfsReadReturn { ret: i64 },
    VfsWriteEntry { file: Handle },
    VfsWriteReturn { ret: i64 },
    SysEnter { nr: u64 },
    Dns {
        #[serde(deserialize_with = "hex_bytes")]
        frame: Vec<u8>,
    },
    Router {
        #[serde(deserialize_with = "hex_bytes")]
        frame: Vec<u8>,
    },
    Tls {
        #[serde(deserialize_with = "hex_bytes")]
        frame: Vec<u8>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub tid: u32,
    #[serde(default)]
    pub cpu: u32,
    /// Timestamp; defaults to the step index so records stay ordered
    #[serde(default)]
    pub ts: Option<u64>,
    #[serde(default)]
    pub comm: String,
    #[serde(flatten)]
    pub hook: Hook,
}

impl Step {
    fn context(&self, index: usize) -> InvocationContext {
        let ts = self.ts.unwrap_or(index as u64);
        InvocationContext::new(self.pid, self.tid, self.cpu, ts).with_comm(&self.comm)
    }
}

/// What one step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Hook(Outcome),
    Packet(PacketVerdict),
}

/// Per-replay tallies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub steps: u64,
    pub emitted: u64,
    pub pending: u64,
    pub skipped: u64,
    pub passed: u64,
    pub dropped: u64,
}

impl ReplaySummary {
    fn record(&mut self, result: StepResult) {
        self.steps += 1;
        match result {
            StepResult::Hook(Outcome::Emitted) | StepResult::Packet(PacketVerdict::Emit) => self.emitted += 1,
            StepResult::Hook(Outcome::Pending) => self.pending += 1,
            StepResult::Hook(Outcome::Skipped(_)) => self.skipped += 1,
            StepResult::Packet(PacketVerdict::Pass) => self.passed += 1,
            StepResult::Packet(PacketVerdict::Drop) => self.dropped += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub memory: Vec<Region>,
    pub rules: Vec<RuleSpec>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        let scenario: Scenario = serde_json::from_str(&content)?;
        info!(
            regions = scenario.memory.len(),
            rules = scenario.rules.len(),
            steps = scenario.steps.len(),
            "Loaded scenario from {}",
            path.display()
        );
        Ok(scenario)
    }

    /// Build the simulated address space
    pub fn memory_image(&self) -> Result<SimulatedMemory, ScenarioError> {
        let memory = SimulatedMemory::new();
        for region in &self.memory {
            memory.map(region.base, region.image()?);
        }
        Ok(memory)
    }

    /// Install the scenario's filter rules on an attached manager
    pub fn install_rules<R: MemoryReader>(&self, manager: &ProbeManager<R>) -> Result<(), ScenarioError> {
        for rule in &self.rules {
            let ino = rule.resolve_inode()?;
            manager.set_rule(ino, rule.action)?;
            debug!(ino, action = ?rule.action, "Installed filter rule");
        }
        Ok(())
    }

    /// Run every step in order
    pub fn replay<R: MemoryReader>(&self, manager: &ProbeManager<R>) -> ReplaySummary {
        let mut summary = ReplaySummary::default();
        for (index, step) in self.steps.iter().enumerate() {
            let result = run_step(manager, &step.context(index), &step.hook);
            debug!(index, ?result, "Replayed step");
            summary.record(result);
        }
        summary
    }
}

fn run_step<R: MemoryReader>(manager: &ProbeManager<R>, ctx: &InvocationContext, hook: &Hook) -> StepResult {
    let outcome = match hook {
        Hook::TcpConnectEntry { sock } => manager.tcp_connect_entry(ctx, *sock),
        Hook::TcpConnectReturn { ret } => manager.tcp_connect_return(ctx, *ret),
        Hook::TcpSendmsgEntry { sock } => manager.tcp_sendmsg_entry(ctx, *sock),
        Hook::TcpSendmsgReturn { ret } => manager.tcp_sendmsg_return(ctx, *ret),
        Hook::TcpRecvmsgEntry { sock } => manager.tcp_recvmsg_entry(ctx, *sock),
        Hook::TcpRecvmsgReturn { ret } => manager.tcp_recvmsg_return(ctx, *ret),
        Hook::UdpSendmsg { sock, len } => manager.udp_sendmsg(ctx, *sock, *len),
        Hook::UdpRcv { skb } => manager.udp_rcv(ctx, *skb),
        Hook::VfsReadEntry { file } => manager.vfs_read_entry(ctx, *file),
        Hook::VfsReadReturn { ret } => manager.vfs_read_return(ctx, *ret),
        Hook::VfsWriteEntry { file } => manager.vfs_write_entry(ctx, *file),
        Hook::VfsWriteReturn { ret } => manager.vfs_write_return(ctx, *ret),
        Hook::SysEnter { nr } => manager.sys_enter(ctx, *nr),
        Hook::Dns { frame } => return StepResult::Packet(manager.classify_dns(ctx, frame)),
        Hook::Router { frame } => return StepResult::Packet(manager.route_packet(ctx, frame)),
        Hook::Tls { frame } => return StepResult::Packet(manager.sniff_tls(ctx, frame)),
    };
    StepResult::Hook(outcome)
}

fn hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(compact).map_err(serde::de::Error::custom)
}
