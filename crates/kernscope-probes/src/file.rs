//! Regular-file read/write handlers (`vfs_read`, `vfs_write`)
//!
//! The entry stores the `struct file`. The exit, given a positive byte
//! count, reads the file's dentry and inode, resolves the path through the
//! filter rules, updates the (task, inode) counters, and reports the access
//! according to the filter policy and report mode.

use kernscope_common::{FileAccessKind, FileEvent, ProbeRecord, Volumes, PATH_RULE_MATCHED, PATH_TRUNCATED};
use kernscope_core::config::FileReportMode;
use kernscope_core::correlation::PendingOp;
use kernscope_core::layout::is_regular;
use kernscope_core::memory::{Handle, MemoryReader, ReadExt};
use kernscope_core::metrics::ProbeStats;
use kernscope_core::path::Resolution;
use kernscope_core::{InvocationContext, ReadError};

use crate::manager::{Outcome, PendingFile, ProbeManager, SkipReason};

/// File counters are kept per task (at the configured key granularity)
/// and inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub id: u64,
    pub ino: u64,
}

impl<R: MemoryReader> ProbeManager<R> {
    pub fn vfs_read_entry(&self, ctx: &InvocationContext, file: Handle) -> Outcome {
        self.file_entry("vfs_read_entry", ctx, file, FileAccessKind::Read)
    }

    /// `ret` is the byte count returned by `vfs_read`
    pub fn vfs_read_return(&self, ctx: &InvocationContext, ret: i64) -> Outcome {
        self.settle("vfs_read_return", self.try_file_return(ctx, FileAccessKind::Read, ret))
    }

    pub fn vfs_write_entry(&self, ctx: &InvocationContext, file: Handle) -> Outcome {
        self.file_entry("vfs_write_entry", ctx, file, FileAccessKind::Write)
    }

    /// `ret` is the byte count returned by `vfs_write`
    pub fn vfs_write_return(&self, ctx: &InvocationContext, ret: i64) -> Outcome {
        self.settle("vfs_write_return", self.try_file_return(ctx, FileAccessKind::Write, ret))
    }

    fn file_entry(&self, hook: &'static str, ctx: &InvocationContext, file: Handle, access: FileAccessKind) -> Outcome {
        let pending = PendingFile {
            op: PendingOp {
                target: file,
                started_ns: ctx.ts_ns,
            },
            access,
        };
        self.settle(hook, Ok(self.begin(&self.file_args, ctx, pending)))
    }

    fn try_file_return(&self, ctx: &InvocationContext, access: FileAccessKind, ret: i64) -> Result<Outcome, ReadError> {
        let key = self.key(ctx);
        let Some(pending) = self.file_args.end(key) else {
            return Ok(Outcome::Skipped(SkipReason::MissedEntry));
        };
        // A read exit paired with a write entry means the entry was lost
        if pending.access != access {
            return Ok(Outcome::Skipped(SkipReason::MissedEntry));
        }
        if ret <= 0 {
            return Ok(Outcome::Skipped(SkipReason::Suppressed));
        }

        let layout = &self.config.layout;
        let file = pending.op.target;
        let dentry = self.reader.read_handle(file.field(layout.file.dentry))?;
        let inode = self.reader.read_handle(file.field(layout.file.inode))?;
        let mode = self.reader.read_u16(inode.field(layout.inode.mode))?;
        let ino = self.reader.read_u64(inode.field(layout.inode.ino))?;

        if !is_regular(mode) {
            return Ok(Outcome::Skipped(SkipReason::Suppressed));
        }

        let path = match self.resolver.resolve(&self.reader, &self.filters, dentry)? {
            Resolution::Resolved(path) => path,
            Resolution::Ignored { .. } => return Ok(Outcome::Skipped(SkipReason::Ignored)),
        };
        if !self.config.filter.policy.reports(path.rule_matched()) {
            return Ok(Outcome::Skipped(SkipReason::NotRecorded));
        }

        let bytes = ret as u64;
        let delta = match access {
            FileAccessKind::Read => Volumes::read(bytes),
            FileAccessKind::Write => Volumes::write(bytes),
        };
        let acc = self.file_volumes.accumulate(FileKey { id: key, ino }, delta);
        if acc.evicted.is_some() {
            ProbeStats::inc(&self.stats.evictions);
        }
        if !acc.is_new && self.config.volume.report == FileReportMode::FirstAccess {
            return Ok(Outcome::Skipped(SkipReason::Suppressed));
        }

        let mut flags = 0;
        if path.is_truncated() {
            flags |= PATH_TRUNCATED;
        }
        if path.rule_matched() {
            flags |= PATH_RULE_MATCHED;
        }

        let mut event = FileEvent::zeroed();
        event.id = ctx.pid() as u64;
        event.ts = ctx.ts_ns;
        event.tid = ctx.tid();
        event.access = access;
        event.depth = path.depth() as u8;
        event.flags = flags;
        event.bytes = bytes;
        event.inode = ino;
        event.volumes = acc.totals;
        event.comm = ctx.comm;
        event.path = *path.raw_segments();

        Ok(self.emit(ctx, ProbeRecord::File(event)))
    }
}
