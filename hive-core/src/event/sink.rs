use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Result as IoResult, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::envelope::AgentEvent;

/// Abstraction over an output target that consumes full events.
///
/// Sinks run on the bus listener task; a sink that returns an error is
/// logged and skipped for that event, the listener keeps draining.
pub trait EventSink: Send + Sync {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()>;

    /// Logical name used in sink diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Default sink: structured `tracing` records, one per event.
#[derive(Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()> {
        tracing::debug!(
            target: "hive::event",
            event_type = %event.event_type,
            stream_id = %event.stream_id,
            node_id = event.node_id.as_deref(),
            execution_id = event.execution_id.as_deref(),
            "event"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<AgentEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured events, in arrival order.
    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()> {
        self.entries.lock().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Channel-based sink for streaming to async consumers.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Opt-in debug log: one JSON-serialized event per line, append-only.
///
/// Used for the `~/.hive/event_logs/<timestamp>.jsonl` files; flushed on
/// every event so a crashed run still leaves a usable log.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: impl AsRef<Path>) -> IoResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EventSink for JsonlSink {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()> {
        let line = event
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}
