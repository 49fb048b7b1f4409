//! JSONL export of decoded records

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use kernscope_common::ProbeRecord;
use kernscope_core::emitter::{Emitted, OutputChannels};
use kernscope_probes::DecodedEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Writes one decoded record per line
pub struct JsonlWriter {
    out: BufWriter<Box<dyn Write + Send>>,
    pretty: bool,
    written: u64,
}

impl JsonlWriter {
    pub fn new(out: Box<dyn Write + Send>, pretty: bool) -> Self {
        Self {
            out: BufWriter::new(out),
            pretty,
            written: 0,
        }
    }

    /// Write to `path`, truncating it, or to stdout when `path` is `None`
    pub fn open(path: Option<&Path>, pretty: bool) -> io::Result<Self> {
        let out: Box<dyn Write + Send> = match path {
            Some(path) => {
                info!("JSONL output: {}", path.display());
                Box::new(File::create(path)?)
            }
            None => Box::new(io::stdout()),
        };
        Ok(Self::new(out, pretty))
    }

    pub fn write(&mut self, emitted: &Emitted<ProbeRecord>) -> io::Result<()> {
        let event = DecodedEvent::from(emitted);
        let json = if self.pretty {
            serde_json::to_string_pretty(&event)?
        } else {
            serde_json::to_string(&event)?
        };
        writeln!(self.out, "{}", json)?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Forward every output channel into a single receiver.
///
/// The forwarding tasks finish once the emitter side is dropped.
pub fn merge(channels: OutputChannels<ProbeRecord>, capacity: usize) -> (mpsc::Receiver<Emitted<ProbeRecord>>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let tasks = channels
        .into_receivers()
        .into_iter()
        .enumerate()
        .map(|(index, mut source)| {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(record) = source.recv().await {
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
                debug!(channel = index, "Output channel closed");
            })
        })
        .collect();
    (rx, tasks)
}

/// Drain `records` into `writer` until every sender is gone
pub async fn drain(mut records: mpsc::Receiver<Emitted<ProbeRecord>>, mut writer: JsonlWriter) -> io::Result<u64> {
    while let Some(record) = records.recv().await {
        writer.write(&record)?;
    }
    writer.flush()?;
    Ok(writer.written())
}
