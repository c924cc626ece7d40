//! A single traced operation and the marker that owns it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::outputter::Outputter;
use crate::source::TraceSource;
use crate::timing::GpuTimer;

/// Correlates the service and device events of one span at the sink.
///
/// Ids are unique within the process, so tracers sharing one outputter never
/// collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SpanId(pub u64);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "span#{}", self.0)
    }
}

/// Identity of a span as seen by an [`Outputter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLabel {
    pub id: SpanId,
    pub source: TraceSource,
    pub category: Arc<str>,
    pub name: Arc<str>,
}

/// Open/close record for one traced operation on a source's stack.
///
/// A marker outlives decoding cycles; its span only exists while a cycle is
/// active.
#[derive(Debug)]
pub struct TraceMarker {
    pub category: Arc<str>,
    pub name: Arc<str>,
    pub trace: Option<GpuTrace>,
}

impl TraceMarker {
    pub fn new(category: &str, name: &str) -> Self {
        Self {
            category: Arc::from(category),
            name: Arc::from(name),
            trace: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanState {
    Created,
    Started,
    Ended,
}

/// Service (CPU) and optional device (GPU) measurement of one operation.
pub struct GpuTrace {
    label: TraceLabel,
    outputter: Arc<dyn Outputter>,
    timer: Option<Box<dyn GpuTimer>>,
    service_enabled: bool,
    device_enabled: bool,
    state: SpanState,
    service_start: Option<i64>,
    service_end: Option<i64>,
    device_ready: bool,
    device_valid: bool,
    device_reported: bool,
}

impl GpuTrace {
    /// Device tracing is enabled exactly when a timer is supplied.
    pub fn new(
        label: TraceLabel,
        outputter: Arc<dyn Outputter>,
        timer: Option<Box<dyn GpuTimer>>,
        service_enabled: bool,
    ) -> Self {
        let device_enabled = timer.is_some();
        Self {
            label,
            outputter,
            timer,
            service_enabled,
            device_enabled,
            state: SpanState::Created,
            service_start: None,
            service_end: None,
            device_ready: false,
            device_valid: true,
            device_reported: false,
        }
    }

    pub fn label(&self) -> &TraceLabel {
        &self.label
    }

    pub fn id(&self) -> SpanId {
        self.label.id
    }

    pub fn source(&self) -> TraceSource {
        self.label.source
    }

    pub fn is_service_trace_enabled(&self) -> bool {
        self.service_enabled
    }

    pub fn is_device_trace_enabled(&self) -> bool {
        self.device_enabled
    }

    /// Whether the device span has already been handed to the outputter.
    pub fn has_reported_device(&self) -> bool {
        self.device_reported
    }

    /// CPU time between [`GpuTrace::start`] and [`GpuTrace::end`].
    pub fn service_duration(&self) -> Option<Duration> {
        let elapsed = self.service_end?.checked_sub(self.service_start?)?;
        u64::try_from(elapsed).ok().map(Duration::from_micros)
    }

    /// `timestamp` is the CPU time in microseconds, on the device time base
    /// whenever device timing is available.
    pub fn start(&mut self, timestamp: i64) {
        debug_assert_eq!(self.state, SpanState::Created, "span started twice");
        if self.state != SpanState::Created {
            return;
        }
        self.state = SpanState::Started;
        self.service_start = Some(timestamp);
        if self.service_enabled {
            self.outputter.trace_service_begin(&self.label, timestamp);
        }
        if let Some(timer) = self.timer.as_mut() {
            timer.start();
        }
    }

    /// Stops measuring. The device result usually arrives later.
    pub fn end(&mut self, timestamp: i64) {
        debug_assert_eq!(self.state, SpanState::Started, "span ended before start");
        if self.state != SpanState::Started {
            return;
        }
        if let Some(timer) = self.timer.as_mut() {
            timer.end();
        }
        self.finish_service(timestamp);
    }

    /// True once nothing is left to wait for on the device. A ready result is
    /// remembered, so the query is not polled again.
    pub fn is_available(&mut self) -> bool {
        if !self.device_valid || self.device_reported || self.device_ready {
            return true;
        }
        match self.timer.as_mut() {
            Some(timer) => {
                self.device_ready = timer.is_available();
                self.device_ready
            }
            None => true,
        }
    }

    /// Drops any device result for this span, e.g. after a disjoint event.
    pub fn invalidate_device(&mut self) {
        self.device_valid = false;
    }

    /// Polls the device result and reports it once it is ready and valid.
    pub fn process(&mut self) {
        if !self.device_enabled || !self.device_valid || self.device_reported {
            return;
        }
        if !self.is_available() {
            return;
        }
        let Some(timer) = self.timer.as_mut() else {
            return;
        };
        if timer.is_disjoint() {
            tracing::trace!(
                target: "gpu_tracer",
                span = %self.label.id,
                name = %self.label.name,
                "device timing disjoint, discarding"
            );
            self.device_valid = false;
            return;
        }
        let (start_time, end_time) = timer.start_end_timestamps();
        self.output(start_time, end_time);
    }

    /// Releases the timer. With `have_context == false` the timer is not read
    /// or otherwise touched on the device.
    pub fn destroy(mut self, have_context: bool) {
        self.release(have_context);
    }

    fn output(&mut self, start_time: i64, end_time: i64) {
        if self.device_reported {
            return;
        }
        self.device_reported = true;
        self.outputter.trace_device(&self.label, start_time, end_time);
    }

    /// Closes the service side at `timestamp` without touching the timer.
    /// No-op unless the span is running.
    pub fn close_service(&mut self, timestamp: i64) {
        if self.state == SpanState::Started {
            self.finish_service(timestamp);
        }
    }

    fn finish_service(&mut self, timestamp: i64) {
        self.state = SpanState::Ended;
        self.service_end = Some(timestamp);
        if self.service_enabled {
            self.outputter.trace_service_end(&self.label, timestamp);
        }
        tracing::trace!(
            target: "gpu_tracer",
            span = %self.label.id,
            source = %self.label.source,
            name = %self.label.name,
            elapsed = ?self.service_duration(),
            "service span ended"
        );
    }

    fn release(&mut self, have_context: bool) {
        if self.state == SpanState::Started {
            // Close the service side so the sink's id stack stays balanced.
            let timestamp = self.service_start.unwrap_or_default();
            self.finish_service(timestamp);
        }
        if let Some(mut timer) = self.timer.take() {
            timer.destroy(have_context);
        }
    }
}

impl Drop for GpuTrace {
    fn drop(&mut self) {
        self.release(false);
    }
}

impl fmt::Debug for GpuTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTrace")
            .field("label", &self.label)
            .field("service_enabled", &self.service_enabled)
            .field("device_enabled", &self.device_enabled)
            .field("state", &self.state)
            .field("device_ready", &self.device_ready)
            .field("device_valid", &self.device_valid)
            .field("device_reported", &self.device_reported)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Outputter for Recorder {
        fn trace_service_begin(&self, label: &TraceLabel, _timestamp: i64) {
            self.calls.lock().push(format!("begin {}", label.name));
        }

        fn trace_service_end(&self, label: &TraceLabel, _timestamp: i64) {
            self.calls.lock().push(format!("end {}", label.name));
        }

        fn trace_device(&self, label: &TraceLabel, start_time: i64, end_time: i64) {
            self.calls
                .lock()
                .push(format!("device {} {start_time}..{end_time}", label.name));
        }
    }

    #[derive(Default)]
    struct TimerState {
        available: bool,
        disjoint: bool,
        destroyed_with: Option<bool>,
        polls: u32,
        reads: u32,
    }

    struct SharedTimer(Arc<Mutex<TimerState>>);

    impl GpuTimer for SharedTimer {
        fn start(&mut self) {}

        fn end(&mut self) {}

        fn is_available(&mut self) -> bool {
            let mut state = self.0.lock();
            state.polls += 1;
            state.available
        }

        fn start_end_timestamps(&mut self) -> (i64, i64) {
            self.0.lock().reads += 1;
            (100, 250)
        }

        fn is_disjoint(&mut self) -> bool {
            self.0.lock().disjoint
        }

        fn destroy(&mut self, have_context: bool) {
            self.0.lock().destroyed_with = Some(have_context);
        }
    }

    fn label(name: &str) -> TraceLabel {
        TraceLabel {
            id: SpanId(1),
            source: TraceSource::Chromium,
            category: Arc::from("gpu"),
            name: Arc::from(name),
        }
    }

    fn traced(name: &str, timer: Option<Arc<Mutex<TimerState>>>) -> (GpuTrace, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let timer = timer.map(|state| Box::new(SharedTimer(state)) as Box<dyn GpuTimer>);
        let trace = GpuTrace::new(label(name), recorder.clone(), timer, true);
        (trace, recorder)
    }

    #[test]
    fn service_events_are_emitted_at_start_and_end() {
        let (mut trace, recorder) = traced("draw", None);
        trace.start(1_000);
        assert_eq!(*recorder.calls.lock(), ["begin draw"]);
        trace.end(1_250);
        assert_eq!(*recorder.calls.lock(), ["begin draw", "end draw"]);
        assert_eq!(trace.service_duration(), Some(Duration::from_micros(250)));
    }

    #[test]
    fn cpu_only_span_never_reports_device() {
        let (mut trace, recorder) = traced("clear", None);
        assert!(!trace.is_device_trace_enabled());
        trace.start(0);
        trace.end(5);
        assert!(trace.is_available());
        trace.process();
        assert!(recorder.calls.lock().iter().all(|c| !c.starts_with("device")));
    }

    #[test]
    fn device_output_waits_for_availability_and_happens_once() {
        let state = Arc::new(Mutex::new(TimerState::default()));
        let (mut trace, recorder) = traced("blit", Some(state.clone()));
        trace.start(0);
        trace.end(5);

        trace.process();
        assert!(!trace.has_reported_device());

        state.lock().available = true;
        trace.process();
        trace.process();
        let devices: Vec<_> = recorder
            .calls
            .lock()
            .iter()
            .filter(|c| c.starts_with("device"))
            .cloned()
            .collect();
        assert_eq!(devices, ["device blit 100..250"]);
        assert_eq!(state.lock().reads, 1);
    }

    #[test]
    fn disjoint_timer_suppresses_device_output() {
        let state = Arc::new(Mutex::new(TimerState {
            available: true,
            disjoint: true,
            ..TimerState::default()
        }));
        let (mut trace, recorder) = traced("upload", Some(state.clone()));
        trace.start(0);
        trace.end(5);
        trace.process();
        assert!(!trace.has_reported_device());
        assert_eq!(state.lock().reads, 0);
        assert_eq!(recorder.calls.lock().len(), 2);
    }

    #[test]
    fn invalidated_span_is_available_without_polling_device() {
        let state = Arc::new(Mutex::new(TimerState::default()));
        let (mut trace, _recorder) = traced("copy", Some(state.clone()));
        trace.start(0);
        trace.end(5);
        assert!(!trace.is_available());
        trace.invalidate_device();
        assert!(trace.is_available());
        state.lock().available = true;
        trace.process();
        assert!(!trace.has_reported_device());
    }

    #[test]
    fn destroying_open_span_closes_service_side_without_device_read() {
        let state = Arc::new(Mutex::new(TimerState {
            available: true,
            ..TimerState::default()
        }));
        let (mut trace, recorder) = traced("pending", Some(state.clone()));
        trace.start(10);
        trace.destroy(false);

        assert_eq!(*recorder.calls.lock(), ["begin pending", "end pending"]);
        let state = state.lock();
        assert_eq!(state.destroyed_with, Some(false));
        assert_eq!(state.reads, 0);
    }

    #[test]
    fn ready_result_is_polled_only_once() {
        let state = Arc::new(Mutex::new(TimerState {
            available: true,
            ..TimerState::default()
        }));
        let (mut trace, _recorder) = traced("draw", Some(state.clone()));
        trace.start(0);
        trace.end(5);
        assert!(trace.is_available());
        trace.process();
        assert!(trace.has_reported_device());
        assert_eq!(state.lock().polls, 1);
    }

    #[test]
    fn close_service_leaves_timer_untouched() {
        let state = Arc::new(Mutex::new(TimerState::default()));
        let (mut trace, recorder) = traced("lost", Some(state.clone()));
        trace.start(40);
        trace.close_service(90);
        trace.close_service(95);
        assert_eq!(*recorder.calls.lock(), ["begin lost", "end lost"]);
        assert_eq!(trace.service_duration(), Some(Duration::from_micros(50)));
        assert_eq!(state.lock().polls, 0);
    }
}
