use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use serde_json::json;

use super::TraceEvent;

/// Final destination of trace events, driven from the emission thread.
pub trait TraceSink: Send {
    fn record(&mut self, event: &TraceEvent) -> anyhow::Result<()>;

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once after the last event, when the emission thread exits.
    fn close(&mut self) -> anyhow::Result<()> {
        self.flush()
    }
}

/// Forwards every event to [`tracing`] under the `gpu_trace` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn record(&mut self, event: &TraceEvent) -> anyhow::Result<()> {
        match event {
            TraceEvent::ServiceBegin {
                span,
                service_id,
                source,
                category,
                name,
                timestamp_us,
            } => tracing::debug!(
                target: "gpu_trace",
                %span, service_id, channel = %source, gl_category = %category,
                ts = timestamp_us, "service begin {name}"
            ),
            TraceEvent::ServiceEnd {
                span,
                service_id,
                source,
                category,
                name,
                timestamp_us,
            } => tracing::debug!(
                target: "gpu_trace",
                %span, service_id, channel = %source, gl_category = %category,
                ts = timestamp_us, "service end {name}"
            ),
            TraceEvent::Device {
                span,
                device_id,
                service_id,
                source,
                category,
                name,
                start_time,
                end_time,
            } => tracing::debug!(
                target: "gpu_trace",
                %span, device_id, ?service_id, channel = %source, gl_category = %category,
                start = start_time, end = end_time, "device {name}"
            ),
        }
        Ok(())
    }
}

/// Writes a Chrome trace-event JSON array, loadable by `chrome://tracing`
/// and Perfetto.
///
/// Service spans become nestable async events in `gpu.service`; device spans
/// become complete events in `gpu.device` on one track per source. The full
/// [`TraceEvent`] is attached as `args`. The closing `]` is written by
/// [`TraceSink::close`]; the format tolerates its absence if the process
/// dies first.
pub struct ChromeTraceSink<W: Write + Send> {
    writer: BufWriter<W>,
    pid: u32,
    written: u64,
    closed: bool,
}

impl ChromeTraceSink<File> {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create trace file {}", path.display()))?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> ChromeTraceSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            pid: std::process::id(),
            written: 0,
            closed: false,
        }
    }

    fn to_json(&self, event: &TraceEvent) -> anyhow::Result<serde_json::Value> {
        let args = serde_json::to_value(event).context("failed to encode trace event")?;
        let value = match event {
            TraceEvent::ServiceBegin {
                service_id,
                source,
                name,
                timestamp_us,
                ..
            }
            | TraceEvent::ServiceEnd {
                service_id,
                source,
                name,
                timestamp_us,
                ..
            } => {
                let phase = if matches!(event, TraceEvent::ServiceBegin { .. }) {
                    "b"
                } else {
                    "e"
                };
                json!({
                    "ph": phase,
                    "cat": "gpu.service",
                    "name": name,
                    "id": format!("{service_id:#x}"),
                    "pid": self.pid,
                    "tid": source.index(),
                    "ts": timestamp_us,
                    "args": args,
                })
            }
            TraceEvent::Device {
                source,
                name,
                start_time,
                end_time,
                ..
            } => json!({
                "ph": "X",
                "cat": "gpu.device",
                "name": name,
                "pid": self.pid,
                "tid": source.index(),
                "ts": start_time,
                "dur": end_time.saturating_sub(*start_time).max(0),
                "args": args,
            }),
        };
        Ok(value)
    }
}

impl<W: Write + Send> TraceSink for ChromeTraceSink<W> {
    fn record(&mut self, event: &TraceEvent) -> anyhow::Result<()> {
        anyhow::ensure!(!self.closed, "trace file already closed");
        let value = self.to_json(event)?;
        let separator: &[u8] = if self.written == 0 { b"[\n" } else { b",\n" };
        self.writer
            .write_all(separator)
            .context("failed to write trace event")?;
        serde_json::to_writer(&mut self.writer, &value).context("failed to encode trace event")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush().context("failed to flush trace file")
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let tail: &[u8] = if self.written == 0 { b"[]\n" } else { b"\n]\n" };
        self.writer
            .write_all(tail)
            .context("failed to terminate trace file")?;
        self.flush()
    }
}

/// Keeps every event in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl TraceSink for MemorySink {
    fn record(&mut self, event: &TraceEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
