//! kernscope core - the engine shared by every probe
//!
//! This crate provides the pieces probe handlers are wired from:
//!
//! - **Memory**: fallible bounded reads through an injected reader
//! - **Correlation**: entry/exit tables keyed by task
//! - **Filter**: inode rules consulted during path resolution
//! - **Path**: bounded ancestor walk producing leaf-first segments
//! - **Volume**: LRU-bounded traffic counters
//! - **Emitter**: lossy per-CPU output channels
//! - **Config**: attach-time parameters and file discovery

pub mod config;
pub mod context;
pub mod correlation;
pub mod emitter;
pub mod error;
pub mod filter;
pub mod layout;
pub mod memory;
pub mod metrics;
pub mod path;
pub mod volume;

// Re-export commonly used types
pub use config::{ConfigError, ConfigLoader, ProbeConfig, SensorConfig};
pub use context::InvocationContext;
pub use correlation::{CorrelationKey, CorrelationTable, PendingOp};
pub use emitter::{output_channel, ChannelMode, CpuIdSource, EmitStatus, Emitted, Emitter, OutputChannels};
pub use error::{ReadError, TableFull};
pub use filter::{FilterAction, FilterPolicy, FilterRules, FilterVerdict};
pub use layout::KernelLayout;
pub use memory::{Handle, MemoryReader, ReadExt, SimulatedMemory};
pub use metrics::{ProbeStats, StatsSnapshot};
pub use path::{PathResolver, Resolution, ResolvedPath};
pub use volume::{Accumulated, VolumeAggregator};

/// Sensor version
pub const SENSOR_VERSION: &str = env!("CARGO_PKG_VERSION");
