//! Probe lifecycle and shared per-attach state
//!
//! [`ProbeManager`] owns the process-wide tables every handler works
//! against. They are created empty by [`ProbeManager::attach`] and cleared
//! by [`ProbeManager::detach`]; nothing outlives the attachment.

use std::sync::Arc;

use kernscope_common::{FileAccessKind, ProbeRecord};
use kernscope_core::config::{ConfigResult, ProbeConfig};
use kernscope_core::correlation::{CorrelationTable, PendingOp};
use kernscope_core::emitter::{output_channel, EmitStatus, Emitter, OutputChannels};
use kernscope_core::filter::{FilterAction, FilterRules};
use kernscope_core::memory::MemoryReader;
use kernscope_core::metrics::{ProbeStats, StatsSnapshot};
use kernscope_core::path::PathResolver;
use kernscope_core::volume::VolumeAggregator;
use kernscope_core::{InvocationContext, ReadError, TableFull};
use tracing::{debug, info, trace};

use crate::connection::SocketKey;
use crate::file::FileKey;
use crate::packet::PacketVerdict;

/// What a single hook invocation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Entry recorded, waiting for the matching exit
    Pending,
    /// A record was accepted by an output channel
    Emitted,
    /// Nothing was reported
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Exit with no pending entry
    MissedEntry,
    /// A memory read failed
    ReadFault,
    /// An IGNORE rule matched on the path
    Ignored,
    /// No RECORD rule matched under default-deny
    NotRecorded,
    /// Failed call, zero address, non-regular file or an already
    /// reported key
    Suppressed,
    /// Correlation table at capacity
    TableFull,
    /// Output channel full
    Overflow,
}

/// Pending state for a file read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingFile {
    pub op: PendingOp,
    pub access: FileAccessKind,
}

/// Owner of every table a probe set shares.
pub struct ProbeManager<R> {
    pub(crate) config: ProbeConfig,
    pub(crate) reader: R,
    pub(crate) stats: Arc<ProbeStats>,
    pub(crate) emitter: Emitter<ProbeRecord>,
    pub(crate) filters: FilterRules,
    pub(crate) resolver: PathResolver,
    pub(crate) connect_args: CorrelationTable,
    pub(crate) send_args: CorrelationTable,
    pub(crate) recv_args: CorrelationTable,
    pub(crate) file_args: CorrelationTable<PendingFile>,
    pub(crate) file_volumes: VolumeAggregator<FileKey>,
    pub(crate) socket_volumes: VolumeAggregator<SocketKey>,
}

impl<R: MemoryReader> ProbeManager<R> {
    /// Validate `config`, create empty tables and output channels, and
    /// seed the filter rules listed in the configuration.
    pub fn attach(config: ProbeConfig, reader: R) -> ConfigResult<(Self, OutputChannels<ProbeRecord>)> {
        config.validate()?;

        let (emitter, channels) = output_channel(
            config.output.cpus,
            config.output.capacity,
            config.output.mode,
            config.output.cpu_source,
        );

        let capacity = config.correlation.capacity;
        let manager = Self {
            resolver: PathResolver::new(&config.layout, config.path.depth),
            filters: FilterRules::new(config.filter.capacity),
            connect_args: CorrelationTable::new("connect_args", capacity),
            send_args: CorrelationTable::new("send_args", capacity),
            recv_args: CorrelationTable::new("recv_args", capacity),
            file_args: CorrelationTable::new("file_args", capacity),
            file_volumes: VolumeAggregator::new("file_volumes", config.volume.file_capacity),
            socket_volumes: VolumeAggregator::new("socket_volumes", config.volume.socket_capacity),
            stats: Arc::new(ProbeStats::new()),
            emitter,
            reader,
            config,
        };

        // Capacity was validated against the rule lists above
        for &ino in &manager.config.filter.record {
            let _ = manager.filters.set_rule(ino, FilterAction::Record);
        }
        for &ino in &manager.config.filter.ignore {
            let _ = manager.filters.set_rule(ino, FilterAction::Ignore);
        }

        info!(
            channels = manager.emitter.channel_count(),
            rules = manager.filters.len(),
            depth = manager.resolver.depth(),
            policy = ?manager.config.filter.policy,
            key = ?manager.config.correlation.key,
            "Probes attached"
        );

        Ok((manager, channels))
    }

    /// Clear every table and close the output channels.
    pub fn detach(self) -> StatsSnapshot {
        self.connect_args.clear();
        self.send_args.clear();
        self.recv_args.clear();
        self.file_args.clear();
        self.file_volumes.clear();
        self.socket_volumes.clear();
        self.filters.clear();

        let stats = self.stats.snapshot();
        info!(
            emitted = stats.emitted,
            dropped = stats.dropped,
            missed = stats.missed_entries,
            "Probes detached"
        );
        stats
    }

    /// Add or replace a filter rule
    pub fn set_rule(&self, ino: u64, action: FilterAction) -> Result<(), TableFull> {
        self.filters.set_rule(ino, action)
    }

    pub fn remove_rule(&self, ino: u64) -> Option<FilterAction> {
        self.filters.remove_rule(ino)
    }

    pub fn filters(&self) -> &FilterRules {
        &self.filters
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn stats(&self) -> &Arc<ProbeStats> {
        &self.stats
    }

    pub fn file_volumes(&self) -> &VolumeAggregator<FileKey> {
        &self.file_volumes
    }

    pub fn socket_volumes(&self) -> &VolumeAggregator<SocketKey> {
        &self.socket_volumes
    }

    /// Entries currently pending across all correlation tables
    pub fn pending(&self) -> usize {
        self.connect_args.len() + self.send_args.len() + self.recv_args.len() + self.file_args.len()
    }

    /// Correlation key for the task behind `ctx`
    pub(crate) fn key(&self, ctx: &InvocationContext) -> u64 {
        self.config.correlation.key.key_for(ctx.pid_tgid)
    }

    /// Store entry-side state for `ctx` in `table`
    pub(crate) fn begin<V: Copy>(&self, table: &CorrelationTable<V>, ctx: &InvocationContext, value: V) -> Outcome {
        match table.begin(self.key(ctx), value) {
            Ok(None) => Outcome::Pending,
            Ok(Some(_)) => {
                ProbeStats::inc(&self.stats.reclaimed);
                trace!(table = table.name(), tid = ctx.tid(), "Overwrote abandoned entry");
                Outcome::Pending
            }
            Err(full) => {
                debug!(table = full.table, capacity = full.capacity, "Correlation table full, entry dropped");
                Outcome::Skipped(SkipReason::TableFull)
            }
        }
    }

    pub(crate) fn emit(&self, ctx: &InvocationContext, record: ProbeRecord) -> Outcome {
        let kind = record.kind();
        match self.emitter.emit(ctx.cpu, record) {
            EmitStatus::Sent => Outcome::Emitted,
            EmitStatus::Dropped => {
                trace!(kind, cpu = ctx.cpu, "Output channel full, record dropped");
                Outcome::Skipped(SkipReason::Overflow)
            }
        }
    }

    /// Verdict for a classifier that produced `record`. A record lost to a
    /// full channel leaves the packet as if nothing was parsed.
    pub(crate) fn emit_packet(&self, hook: &'static str, ctx: &InvocationContext, record: ProbeRecord) -> PacketVerdict {
        match self.settle(hook, Ok(self.emit(ctx, record))) {
            Outcome::Emitted => PacketVerdict::Emit,
            _ => PacketVerdict::Pass,
        }
    }

    /// Fold a handler result into an outcome and count it.
    ///
    /// Read faults become a skip here so no error ever reaches the host.
    pub(crate) fn settle(&self, hook: &'static str, result: Result<Outcome, ReadError>) -> Outcome {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                trace!(hook, %err, "Read fault");
                Outcome::Skipped(SkipReason::ReadFault)
            }
        };

        let counter = match outcome {
            Outcome::Pending => return outcome,
            Outcome::Emitted => &self.stats.emitted,
            Outcome::Skipped(reason) => {
                trace!(hook, ?reason, "Skipped");
                match reason {
                    SkipReason::MissedEntry => &self.stats.missed_entries,
                    SkipReason::ReadFault => &self.stats.read_faults,
                    SkipReason::Ignored | SkipReason::NotRecorded => &self.stats.filtered,
                    SkipReason::Suppressed => &self.stats.suppressed,
                    SkipReason::TableFull => &self.stats.table_full,
                    SkipReason::Overflow => &self.stats.dropped,
                }
            }
        };
        ProbeStats::inc(counter);
        outcome
    }
}

impl<R> std::fmt::Debug for ProbeManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeManager")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ctx, probe_config};
    use kernscope_core::memory::{Handle, SimulatedMemory};

    #[test]
    fn test_attach_seeds_rules() {
        let mut config = probe_config();
        config.filter.record = vec![9];
        config.filter.ignore = vec![7];
        let (manager, _channels) = ProbeManager::attach(config, SimulatedMemory::new()).unwrap();

        assert_eq!(manager.filters().get(9), Some(FilterAction::Record));
        assert_eq!(manager.filters().get(7), Some(FilterAction::Ignore));
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn test_attach_rejects_invalid_config() {
        let mut config = probe_config();
        config.path.depth = 0;
        assert!(ProbeManager::attach(config, SimulatedMemory::new()).is_err());
    }

    #[test]
    fn test_runtime_rule_updates() {
        let (manager, _channels) = ProbeManager::attach(probe_config(), SimulatedMemory::new()).unwrap();
        manager.set_rule(3, FilterAction::Ignore).unwrap();
        assert_eq!(manager.remove_rule(3), Some(FilterAction::Ignore));
        assert!(manager.filters().is_empty());
    }

    #[test]
    fn test_settle_counts_outcomes() {
        let (manager, _channels) = ProbeManager::attach(probe_config(), SimulatedMemory::new()).unwrap();
        manager.settle("test", Err(ReadError::new(0x10, 8)));
        manager.settle("test", Ok(Outcome::Skipped(SkipReason::MissedEntry)));
        manager.settle("test", Ok(Outcome::Pending));

        let stats = manager.stats().snapshot();
        assert_eq!(stats.read_faults, 1);
        assert_eq!(stats.missed_entries, 1);
        assert_eq!(stats.emitted, 0);
    }

    #[test]
    fn test_begin_reports_full_table() {
        let mut config = probe_config();
        config.correlation.capacity = 1;
        let (manager, _channels) = ProbeManager::attach(config, SimulatedMemory::new()).unwrap();
        let op = PendingOp {
            target: Handle(0x100),
            started_ns: 0,
        };

        assert_eq!(manager.begin(&manager.connect_args, &ctx(1, 1), op), Outcome::Pending);
        assert_eq!(
            manager.begin(&manager.connect_args, &ctx(2, 2), op),
            Outcome::Skipped(SkipReason::TableFull)
        );
        // Same thread again overwrites its own entry
        assert_eq!(manager.begin(&manager.connect_args, &ctx(1, 1), op), Outcome::Pending);
        assert_eq!(manager.stats().snapshot().reclaimed, 1);
    }

    #[test]
    fn test_detach_closes_channels() {
        let (manager, channels) = ProbeManager::attach(probe_config(), SimulatedMemory::new()).unwrap();
        let op = PendingOp {
            target: Handle(0x100),
            started_ns: 0,
        };
        manager.begin(&manager.connect_args, &ctx(1, 1), op);
        let stats = manager.detach();
        assert_eq!(stats.emitted, 0);

        let mut receivers = channels.into_receivers();
        assert!(receivers.iter_mut().all(|rx| rx.try_recv().is_err()));
        assert!(receivers[0].is_closed());
    }
}
