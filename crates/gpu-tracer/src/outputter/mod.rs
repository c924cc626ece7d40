//! Delivery of finished trace events to a sink.
//!
//! [`TraceOutputter`] assigns service/device ids on the calling thread and
//! hands the resulting [`TraceEvent`]s to a dedicated emission thread over a
//! single FIFO channel, so per-source ordering is preserved by construction
//! and the producer never waits on sink I/O.

mod sink;

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::TracerConfig;
use crate::source::{PerSource, TraceSource};
use crate::trace::{SpanId, TraceLabel};

pub use sink::{ChromeTraceSink, LogSink, MemorySink, TraceSink};

/// Receiver of span events produced by the tracer.
///
/// Calls arrive on the command-processing thread and must return quickly.
pub trait Outputter: Send + Sync {
    /// `timestamp` is the tracer's CPU time in microseconds, on the same base
    /// as device timestamps whenever device timing is available.
    fn trace_service_begin(&self, label: &TraceLabel, timestamp: i64);

    fn trace_service_end(&self, label: &TraceLabel, timestamp: i64);

    /// Device interval of a span, timestamps in microseconds.
    fn trace_device(&self, label: &TraceLabel, start_time: i64, end_time: i64);
}

/// Event as delivered to a [`TraceSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    ServiceBegin {
        span: SpanId,
        service_id: u64,
        source: TraceSource,
        category: String,
        name: String,
        timestamp_us: i64,
    },
    ServiceEnd {
        span: SpanId,
        service_id: u64,
        source: TraceSource,
        category: String,
        name: String,
        timestamp_us: i64,
    },
    Device {
        span: SpanId,
        device_id: u64,
        /// Set when the service span was still open at submission time.
        service_id: Option<u64>,
        source: TraceSource,
        category: String,
        name: String,
        start_time: i64,
        end_time: i64,
    },
}

impl TraceEvent {
    pub fn span(&self) -> SpanId {
        match self {
            TraceEvent::ServiceBegin { span, .. }
            | TraceEvent::ServiceEnd { span, .. }
            | TraceEvent::Device { span, .. } => *span,
        }
    }

    pub fn source(&self) -> TraceSource {
        match self {
            TraceEvent::ServiceBegin { source, .. }
            | TraceEvent::ServiceEnd { source, .. }
            | TraceEvent::Device { source, .. } => *source,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TraceEvent::ServiceBegin { name, .. }
            | TraceEvent::ServiceEnd { name, .. }
            | TraceEvent::Device { name, .. } => name,
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, TraceEvent::Device { .. })
    }
}

enum Command {
    Event(TraceEvent),
    Flush(Sender<()>),
}

#[derive(Default)]
struct IdState {
    next_service_id: u64,
    next_device_id: u64,
    open_services: PerSource<Vec<(SpanId, u64)>>,
}

/// [`Outputter`] backed by a named background thread.
pub struct TraceOutputter {
    tx: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
    ids: Mutex<IdState>,
    dropped: AtomicU64,
}

impl TraceOutputter {
    /// Spawns the emission thread, which owns `sink` until shutdown.
    pub fn spawn<S>(sink: S, config: &TracerConfig) -> anyhow::Result<Self>
    where
        S: TraceSink + 'static,
    {
        let (tx, rx) = match config.output_queue_capacity {
            Some(capacity) => crossbeam_channel::bounded(capacity.max(1)),
            None => crossbeam_channel::unbounded(),
        };
        let thread = thread::Builder::new()
            .name(config.output_thread_name.clone())
            .spawn(move || run_emission(rx, Box::new(sink)))
            .context("failed to spawn trace output thread")?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            ids: Mutex::new(IdState::default()),
            dropped: AtomicU64::new(0),
        })
    }

    /// Events discarded because the queue was full or already closed.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of service spans the sink currently sees as open for `source`.
    pub fn open_service_spans(&self, source: TraceSource) -> usize {
        self.ids.lock().open_services[source].len()
    }

    /// Blocks until every event submitted so far has reached the sink.
    ///
    /// Not meant for the command-processing thread.
    pub fn flush(&self) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Closes the queue, lets the thread drain it and joins it.
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| anyhow!("trace output thread panicked"))?;
        }
        Ok(())
    }

    fn submit(&self, event: TraceEvent) {
        let Some(tx) = self.tx.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(Command::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    tracing::warn!(
                        target: "gpu_tracer",
                        "trace output queue unavailable, dropping events"
                    );
                }
            }
        }
    }
}

impl Outputter for TraceOutputter {
    fn trace_service_begin(&self, label: &TraceLabel, timestamp: i64) {
        // Held across submission so id order matches queue order.
        let mut ids = self.ids.lock();
        let service_id = ids.next_service_id;
        ids.next_service_id += 1;
        ids.open_services[label.source].push((label.id, service_id));
        self.submit(TraceEvent::ServiceBegin {
            span: label.id,
            service_id,
            source: label.source,
            category: label.category.to_string(),
            name: label.name.to_string(),
            timestamp_us: timestamp,
        });
    }

    fn trace_service_end(&self, label: &TraceLabel, timestamp: i64) {
        let mut ids = self.ids.lock();
        let stack = &mut ids.open_services[label.source];
        // Usually the top entry; tracers sharing this outputter may interleave.
        let Some(position) = stack.iter().rposition(|(span, _)| *span == label.id) else {
            tracing::warn!(
                target: "gpu_tracer",
                span = %label.id,
                source = %label.source,
                "service end without begin"
            );
            return;
        };
        let (_, service_id) = stack.remove(position);
        self.submit(TraceEvent::ServiceEnd {
            span: label.id,
            service_id,
            source: label.source,
            category: label.category.to_string(),
            name: label.name.to_string(),
            timestamp_us: timestamp,
        });
    }

    fn trace_device(&self, label: &TraceLabel, start_time: i64, end_time: i64) {
        let mut ids = self.ids.lock();
        let device_id = ids.next_device_id;
        ids.next_device_id += 1;
        let service_id = ids.open_services[label.source]
            .iter()
            .rev()
            .find(|(span, _)| *span == label.id)
            .map(|(_, service_id)| *service_id);
        self.submit(TraceEvent::Device {
            span: label.id,
            device_id,
            service_id,
            source: label.source,
            category: label.category.to_string(),
            name: label.name.to_string(),
            start_time,
            end_time,
        });
    }
}

impl Drop for TraceOutputter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            if let Err(err) = handle.join() {
                tracing::error!(target: "gpu_tracer", ?err, "failed to join trace output thread");
            }
        }
    }
}

fn run_emission(rx: Receiver<Command>, mut sink: Box<dyn TraceSink>) {
    for command in rx {
        match command {
            Command::Event(event) => {
                if let Err(err) = sink.record(&event) {
                    tracing::warn!(
                        target: "gpu_tracer",
                        ?err,
                        span = %event.span(),
                        "trace sink rejected event"
                    );
                }
            }
            Command::Flush(done) => {
                if let Err(err) = sink.flush() {
                    tracing::warn!(target: "gpu_tracer", ?err, "trace sink flush failed");
                }
                let _ = done.send(());
            }
        }
    }
    if let Err(err) = sink.close() {
        tracing::warn!(target: "gpu_tracer", ?err, "trace sink failed to close");
    }
}
