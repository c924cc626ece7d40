//! The tracer orchestrating markers, spans and device result collection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::TracerConfig;
use crate::error::TracerError;
use crate::outputter::Outputter;
use crate::source::{PerSource, TraceSource};
use crate::timing::{DecoderContext, GpuTimingClient};
use crate::trace::{GpuTrace, SpanId, TraceLabel, TraceMarker};

static NEXT_TRACER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

const CYCLE_CATEGORY: &str = "gpu.decoder";
const CYCLE_NAME: &str = "DecodingCycle";
const DISJOINT_CATEGORY: &str = "DisjointEvent";

/// Traces GPU commands for one decoder.
///
/// All methods run on the command-processing thread and never wait on the
/// device. Misuse is reported through [`TracerError`] and leaves the tracer
/// unchanged.
pub struct GpuTracer {
    config: TracerConfig,
    context: Box<dyn DecoderContext>,
    timing_client: Option<Box<dyn GpuTimingClient>>,
    outputter: Arc<dyn Outputter>,
    markers: PerSource<Vec<TraceMarker>>,
    finished_traces: VecDeque<GpuTrace>,
    cycle_trace: Option<GpuTrace>,
    tracer_id: u64,
    epoch: Instant,
    disjoint_time: i64,
    gpu_executing: bool,
    began_device_traces: bool,
    destroyed: bool,
}

impl GpuTracer {
    /// Without a timing client every span is traced on the service side only.
    pub fn new(
        config: TracerConfig,
        context: Box<dyn DecoderContext>,
        timing_client: Option<Box<dyn GpuTimingClient>>,
        outputter: Arc<dyn Outputter>,
    ) -> Self {
        let disjoint_time = timing_client
            .as_ref()
            .map_or(0, |client| client.current_cpu_time());
        Self {
            config,
            context,
            timing_client,
            outputter,
            markers: PerSource::default(),
            finished_traces: VecDeque::new(),
            cycle_trace: None,
            tracer_id: NEXT_TRACER_ID.fetch_add(1, Ordering::Relaxed),
            epoch: Instant::now(),
            disjoint_time,
            gpu_executing: false,
            began_device_traces: false,
            destroyed: false,
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn outputter(&self) -> &Arc<dyn Outputter> {
        &self.outputter
    }

    pub fn is_decoding(&self) -> bool {
        self.gpu_executing
    }

    /// Number of open markers on `source`.
    pub fn marker_depth(&self, source: TraceSource) -> usize {
        self.markers[source].len()
    }

    /// Spans that ended and still wait to be processed.
    pub fn pending_traces(&self) -> usize {
        self.finished_traces.len()
    }

    /// Whether device-side timing can currently be collected.
    pub fn is_tracing(&self) -> bool {
        self.config.device_tracing
            && self
                .timing_client
                .as_ref()
                .is_some_and(|client| client.is_available())
    }

    pub fn begin_decoding(&mut self) -> Result<(), TracerError> {
        if self.gpu_executing {
            return Err(TracerError::AlreadyDecoding);
        }
        if !self.context.make_current() {
            return Err(TracerError::ContextUnavailable);
        }
        self.gpu_executing = true;
        self.check_disjoint_status();

        if self.config.trace_decoding_cycles {
            let mut cycle = self.create_trace(
                TraceSource::Disjoint,
                Arc::from(CYCLE_CATEGORY),
                Arc::from(CYCLE_NAME),
            );
            cycle.start(self.now_us());
            self.cycle_trace = Some(cycle);
        }

        // Markers that survived the previous cycle get a fresh span.
        let now = self.now_us();
        for source in TraceSource::ALL {
            for index in 0..self.markers[source].len() {
                let marker = &self.markers[source][index];
                if marker.trace.is_some() {
                    continue;
                }
                let (category, name) = (Arc::clone(&marker.category), Arc::clone(&marker.name));
                let mut trace = self.create_trace(source, category, name);
                trace.start(now);
                self.markers[source][index].trace = Some(trace);
            }
        }
        Ok(())
    }

    /// Ends the spans of all open markers; the markers themselves stay open.
    pub fn end_decoding(&mut self) -> Result<(), TracerError> {
        if !self.gpu_executing {
            return Err(TracerError::NotDecoding);
        }
        let now = self.now_us();
        for source in TraceSource::ALL {
            for marker in self.markers[source].iter_mut().rev() {
                if let Some(mut trace) = marker.trace.take() {
                    trace.end(now);
                    self.finished_traces.push_back(trace);
                }
            }
        }
        if let Some(mut cycle) = self.cycle_trace.take() {
            cycle.end(now);
            self.finished_traces.push_back(cycle);
        }
        self.gpu_executing = false;
        self.check_disjoint_status();
        Ok(())
    }

    /// Opens a marker on `source`. A span is started right away while
    /// decoding, otherwise at the next [`GpuTracer::begin_decoding`].
    pub fn begin(
        &mut self,
        category: &str,
        name: &str,
        source: TraceSource,
    ) -> Result<(), TracerError> {
        if source.is_reserved() {
            return Err(TracerError::ReservedSource(source));
        }
        let mut marker = TraceMarker::new(category, name);
        if self.gpu_executing {
            let mut trace = self.create_trace(
                source,
                Arc::clone(&marker.category),
                Arc::clone(&marker.name),
            );
            trace.start(self.now_us());
            marker.trace = Some(trace);
        }
        self.markers[source].push(marker);
        Ok(())
    }

    /// Closes the most recently opened marker on `source`.
    pub fn end(&mut self, source: TraceSource) -> Result<(), TracerError> {
        let marker = self.markers[source]
            .pop()
            .ok_or(TracerError::NoOpenMarker(source))?;
        if let Some(mut trace) = marker.trace {
            trace.end(self.now_us());
            self.finished_traces.push_back(trace);
        }
        Ok(())
    }

    pub fn has_traces_to_process(&self) -> bool {
        !self.finished_traces.is_empty()
    }

    /// Reports every finished span whose device result is ready, in FIFO
    /// order, stopping at the first span still waiting on the device.
    pub fn process_traces(&mut self) {
        let timing_usable = self
            .timing_client
            .as_ref()
            .is_some_and(|client| client.is_available());
        if !timing_usable {
            while let Some(trace) = self.finished_traces.pop_front() {
                trace.destroy(false);
            }
            return;
        }

        if !self.context.make_current() {
            tracing::warn!(
                target: "gpu_tracer",
                pending = self.finished_traces.len(),
                "decoder context unusable, discarding in-flight traces"
            );
            self.discard_in_flight(false);
            return;
        }

        // A disjoint event invalidates the queue, which then drains silently.
        self.check_disjoint_status();

        let mut ready = 0;
        for trace in self.finished_traces.iter_mut() {
            if !trace.is_available() {
                break;
            }
            ready += 1;
        }
        for mut trace in self.finished_traces.drain(..ready) {
            trace.process();
            trace.destroy(true);
        }
    }

    /// Category of the innermost open marker on `source`, or `""`.
    pub fn current_category(&self, source: TraceSource) -> &str {
        self.markers[source]
            .last()
            .map_or("", |marker| &*marker.category)
    }

    /// Name of the innermost open marker on `source`, or `""`.
    pub fn current_name(&self, source: TraceSource) -> &str {
        self.markers[source]
            .last()
            .map_or("", |marker| &*marker.name)
    }

    /// Queries the disjoint state. On a disjoint event every in-flight span
    /// loses its device result and, if device traces were begun, the affected
    /// window is reported on the reserved source.
    pub fn check_disjoint_status(&mut self) -> bool {
        let Some(client) = self.timing_client.as_mut() else {
            return false;
        };
        let current_time = client.current_cpu_time();
        if !self.config.device_tracing {
            return false;
        }
        let disjoint = client.check_and_reset_timer_errors();
        if disjoint {
            tracing::debug!(
                target: "gpu_tracer",
                tracer = self.tracer_id,
                timer = client.timer_type_name(),
                since = self.disjoint_time,
                until = current_time,
                "disjoint timer event"
            );
            if self.began_device_traces {
                let label = TraceLabel {
                    id: allocate_span_id(),
                    source: TraceSource::Disjoint,
                    category: Arc::from(DISJOINT_CATEGORY),
                    name: Arc::from(format!("DisjointEvent-{}", self.tracer_id)),
                };
                self.outputter
                    .trace_device(&label, self.disjoint_time, current_time);
            }
            self.invalidate_in_flight();
        }
        self.disjoint_time = current_time;
        disjoint
    }

    /// Drops every open marker and every queued span. Device results are
    /// never reported for the dropped spans.
    pub fn clear_ongoing_traces(&mut self, have_context: bool) {
        self.discard_in_flight(have_context);
        for (_, stack) in self.markers.iter_mut() {
            stack.clear();
        }
    }

    /// Tears the tracer down. With a context, spans that are ready get
    /// processed first.
    pub fn destroy(&mut self, have_context: bool) {
        if have_context {
            self.process_traces();
        }
        self.clear_ongoing_traces(have_context);
        self.gpu_executing = false;
        self.destroyed = true;
    }

    /// CPU time in microseconds. Uses the timing client's clock, which shares
    /// the device time base, and falls back to time since construction.
    fn now_us(&self) -> i64 {
        match self.timing_client.as_ref() {
            Some(client) => client.current_cpu_time(),
            None => i64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(i64::MAX),
        }
    }

    fn create_trace(&mut self, source: TraceSource, category: Arc<str>, name: Arc<str>) -> GpuTrace {
        let id = allocate_span_id();
        let timer = if self.config.device_tracing {
            self.timing_client
                .as_mut()
                .filter(|client| client.is_available())
                .and_then(|client| client.create_timer())
        } else {
            None
        };
        if timer.is_some() {
            self.began_device_traces = true;
        }
        let label = TraceLabel {
            id,
            source,
            category,
            name,
        };
        GpuTrace::new(
            label,
            Arc::clone(&self.outputter),
            timer,
            self.config.service_tracing,
        )
    }

    fn invalidate_in_flight(&mut self) {
        for (_, stack) in self.markers.iter_mut() {
            for trace in stack.iter_mut().filter_map(|marker| marker.trace.as_mut()) {
                trace.invalidate_device();
            }
        }
        if let Some(cycle) = self.cycle_trace.as_mut() {
            cycle.invalidate_device();
        }
        for trace in self.finished_traces.iter_mut() {
            trace.invalidate_device();
        }
    }

    /// Destroys all live spans but keeps the markers open.
    fn discard_in_flight(&mut self, have_context: bool) {
        let now = self.now_us();
        for (_, stack) in self.markers.iter_mut() {
            for marker in stack.iter_mut().rev() {
                if let Some(mut trace) = marker.trace.take() {
                    trace.close_service(now);
                    trace.destroy(have_context);
                }
            }
        }
        if let Some(mut cycle) = self.cycle_trace.take() {
            cycle.close_service(now);
            cycle.destroy(have_context);
        }
        while let Some(trace) = self.finished_traces.pop_front() {
            trace.destroy(have_context);
        }
    }
}

fn allocate_span_id() -> SpanId {
    SpanId(NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed))
}

impl Drop for GpuTracer {
    fn drop(&mut self) {
        if !self.destroyed {
            self.clear_ongoing_traces(false);
        }
    }
}

/// Keeps a marker open for the lifetime of the guard.
pub struct ScopedGpuTrace<'a> {
    tracer: &'a mut GpuTracer,
    source: TraceSource,
    began: bool,
}

impl<'a> ScopedGpuTrace<'a> {
    pub fn new(tracer: &'a mut GpuTracer, source: TraceSource, category: &str, name: &str) -> Self {
        let began = match tracer.begin(category, name, source) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(target: "gpu_tracer", %err, name, "scoped trace not started");
                false
            }
        };
        Self {
            tracer,
            source,
            began,
        }
    }

    /// Access to the tracer for nested markers.
    pub fn tracer(&mut self) -> &mut GpuTracer {
        self.tracer
    }
}

impl Drop for ScopedGpuTrace<'_> {
    fn drop(&mut self) {
        if !self.began {
            return;
        }
        if let Err(err) = self.tracer.end(self.source) {
            tracing::debug!(target: "gpu_tracer", %err, "scoped trace end failed");
        }
    }
}
