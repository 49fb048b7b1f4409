//! Lossy output channels
//!
//! Handlers push records with a non-blocking send. When the consumer falls
//! behind the record is dropped and counted; nothing is retried and the
//! hook never waits.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// How records are spread over channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMode {
    /// One bounded channel per CPU
    #[default]
    PerCpu,
    /// A single bounded channel shared by every CPU
    Shared,
}

/// Where the processor id attached to a record comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuIdSource {
    /// The CPU the hook ran on
    #[default]
    Invocation,
    /// A fixed id, for hosts that do not report one
    Fixed(u32),
}

/// A record tagged with the processor that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emitted<T> {
    pub cpu: u32,
    pub record: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitStatus {
    Sent,
    /// Channel full or closed; the record is gone
    Dropped,
}

/// Producer side of the output channels
#[derive(Debug)]
pub struct Emitter<T> {
    senders: Vec<mpsc::Sender<Emitted<T>>>,
    cpu_source: CpuIdSource,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Consumer side: one receiver per channel
#[derive(Debug)]
pub struct OutputChannels<T> {
    receivers: Vec<mpsc::Receiver<Emitted<T>>>,
}

/// Create the output channels.
///
/// `cpus` and `capacity` below one are raised to one.
pub fn output_channel<T>(
    cpus: usize,
    capacity: usize,
    mode: ChannelMode,
    cpu_source: CpuIdSource,
) -> (Emitter<T>, OutputChannels<T>) {
    let count = match mode {
        ChannelMode::PerCpu => cpus.max(1),
        ChannelMode::Shared => 1,
    };
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..count).map(|_| mpsc::channel(capacity.max(1))).unzip();

    (
        Emitter {
            senders,
            cpu_source,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        },
        OutputChannels { receivers },
    )
}

impl<T> Emitter<T> {
    /// Push `record` without waiting.
    ///
    /// `invocation_cpu` is the processor the hook ran on; it selects the
    /// channel in per-CPU mode and tags the record unless a fixed id is
    /// configured.
    pub fn emit(&self, invocation_cpu: u32, record: T) -> EmitStatus {
        let cpu = match self.cpu_source {
            CpuIdSource::Invocation => invocation_cpu,
            CpuIdSource::Fixed(id) => id,
        };
        let sender = &self.senders[cpu as usize % self.senders.len()];

        match sender.try_send(Emitted { cpu, record }) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                EmitStatus::Sent
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                EmitStatus::Dropped
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.senders.len()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> OutputChannels<T> {
    /// Everything currently buffered, channel by channel, without waiting
    pub fn drain(&mut self) -> Vec<Emitted<T>> {
        let mut out = Vec::new();
        for rx in &mut self.receivers {
            while let Ok(item) = rx.try_recv() {
                out.push(item);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    pub fn into_receivers(self) -> Vec<mpsc::Receiver<Emitted<T>>> {
        self.receivers
    }
}
