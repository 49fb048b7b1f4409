//! Probe statistics
//!
//! Every skip path a handler can take bumps a counter here. None of these
//! are errors; they show how much the probes chose not to report and why.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ProbeStats {
    /// Records accepted by an output channel
    pub emitted: AtomicU64,
    /// Records lost to a full output channel
    pub dropped: AtomicU64,
    /// Exit hooks that found no pending entry
    pub missed_entries: AtomicU64,
    /// Operations abandoned on a failed memory read
    pub read_faults: AtomicU64,
    /// Operations dropped by an IGNORE rule or the filter policy
    pub filtered: AtomicU64,
    /// Operations with nothing worth reporting (failed call, zero
    /// address, non-regular file, already reported key)
    pub suppressed: AtomicU64,
    /// Entry hooks refused by a full correlation table
    pub table_full: AtomicU64,
    /// Stale entries overwritten by a new entry on the same key
    pub reclaimed: AtomicU64,
    /// Volume counters evicted to make room
    pub evictions: AtomicU64,
    /// Packets run through a classifier
    pub packets: AtomicU64,
    /// Packets the DNS classifier could not parse
    pub malformed: AtomicU64,
    /// DNS questions parsed out of a packet
    pub dns_parsed: AtomicU64,
}

/// Point-in-time copy of [`ProbeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub emitted: u64,
    pub dropped: u64,
    pub missed_entries: u64,
    pub read_faults: u64,
    pub filtered: u64,
    pub suppressed: u64,
    pub table_full: u64,
    pub reclaimed: u64,
    pub evictions: u64,
    pub packets: u64,
    pub malformed: u64,
    pub dns_parsed: u64,
}

impl ProbeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            missed_entries: self.missed_entries.load(Ordering::Relaxed),
            read_faults: self.read_faults.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            table_full: self.table_full.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dns_parsed: self.dns_parsed.load(Ordering::Relaxed),
        }
    }

    /// Export counters in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP kernscope_records_total Records offered to the output channels\n");
        output.push_str("# TYPE kernscope_records_total counter\n");
        output.push_str(&format!(
            "kernscope_records_total{{status=\"emitted\"}} {}\n",
            s.emitted
        ));
        output.push_str(&format!(
            "kernscope_records_total{{status=\"dropped\"}} {}\n\n",
            s.dropped
        ));

        output.push_str("# HELP kernscope_skipped_total Operations that produced no record\n");
        output.push_str("# TYPE kernscope_skipped_total counter\n");
        for (reason, value) in [
            ("missed_entry", s.missed_entries),
            ("read_fault", s.read_faults),
            ("filtered", s.filtered),
            ("suppressed", s.suppressed),
            ("table_full", s.table_full),
        ] {
            output.push_str(&format!(
                "kernscope_skipped_total{{reason=\"{}\"}} {}\n",
                reason, value
            ));
        }
        output.push('\n');

        output.push_str("# HELP kernscope_correlation_reclaimed_total Stale correlation entries overwritten\n");
        output.push_str("# TYPE kernscope_correlation_reclaimed_total counter\n");
        output.push_str(&format!("kernscope_correlation_reclaimed_total {}\n\n", s.reclaimed));

        output.push_str("# HELP kernscope_volume_evictions_total Volume counters evicted\n");
        output.push_str("# TYPE kernscope_volume_evictions_total counter\n");
        output.push_str(&format!("kernscope_volume_evictions_total {}\n\n", s.evictions));

        output.push_str("# HELP kernscope_packets_total Packets seen by classifiers\n");
        output.push_str("# TYPE kernscope_packets_total counter\n");
        output.push_str(&format!("kernscope_packets_total {}\n\n", s.packets));

        output.push_str("# HELP kernscope_dns_packets_total Packets on the DNS port by parse result\n");
        output.push_str("# TYPE kernscope_dns_packets_total counter\n");
        output.push_str(&format!("kernscope_dns_packets_total{{result=\"parsed\"}} {}\n", s.dns_parsed));
        output.push_str(&format!("kernscope_dns_packets_total{{result=\"malformed\"}} {}\n", s.malformed));

        output
    }
}
