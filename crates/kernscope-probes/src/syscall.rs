//! Raw syscall entry handler

use kernscope_common::{ProbeRecord, SyscallEvent};
use kernscope_core::memory::MemoryReader;
use kernscope_core::InvocationContext;

use crate::manager::{Outcome, ProbeManager, SkipReason};

impl<R: MemoryReader> ProbeManager<R> {
    /// Report one syscall entry. The configured `ignore_pid` (normally the
    /// consumer itself) is skipped so the consumer does not observe its own
    /// draining.
    pub fn sys_enter(&self, ctx: &InvocationContext, syscall_nr: u64) -> Outcome {
        if self.config.syscall.ignore_pid == Some(ctx.pid()) {
            return self.settle("sys_enter", Ok(Outcome::Skipped(SkipReason::Suppressed)));
        }

        let mut event = SyscallEvent::zeroed();
        event.id = ctx.pid() as u64;
        event.ts = ctx.ts_ns;
        event.syscall_nr = syscall_nr;
        event.tid = ctx.tid();
        event.comm = ctx.comm;

        self.settle("sys_enter", Ok(self.emit(ctx, ProbeRecord::Syscall(event))))
    }
}
