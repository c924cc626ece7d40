#![allow(dead_code)]

use std::sync::Arc;

use gpu_tracer::{
    DecoderContext, GpuTimer, GpuTimingClient, GpuTracer, MemorySink, TraceEvent, TraceOutputter,
    TracerConfig,
};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct FakeTimerState {
    pub started: bool,
    pub ended: bool,
    pub polls: u32,
    /// Poll on which the result first reports ready.
    pub available_after: u32,
    pub disjoint: bool,
    pub reads: u32,
    pub destroyed: Option<bool>,
    pub start_time: i64,
    pub end_time: i64,
}

struct ControlState {
    supported: bool,
    can_create: bool,
    context_ok: bool,
    disjoint_pending: bool,
    cpu_time: i64,
    available_after: u32,
    next_timestamp: i64,
    timers: Vec<Arc<Mutex<FakeTimerState>>>,
}

/// Test-side handle steering the fake device.
#[derive(Clone)]
pub struct GpuControl {
    inner: Arc<Mutex<ControlState>>,
}

impl Default for GpuControl {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControlState {
                supported: true,
                can_create: true,
                context_ok: true,
                disjoint_pending: false,
                cpu_time: 0,
                available_after: 1,
                next_timestamp: 1_000,
                timers: Vec::new(),
            })),
        }
    }
}

impl GpuControl {
    pub fn set_supported(&self, supported: bool) {
        self.inner.lock().supported = supported;
    }

    pub fn set_can_create(&self, can_create: bool) {
        self.inner.lock().can_create = can_create;
    }

    pub fn set_context_ok(&self, ok: bool) {
        self.inner.lock().context_ok = ok;
    }

    /// Queues a disjoint event for the next status check.
    pub fn raise_disjoint(&self) {
        self.inner.lock().disjoint_pending = true;
    }

    pub fn set_cpu_time(&self, time: i64) {
        self.inner.lock().cpu_time = time;
    }

    /// Applies to timers created from now on.
    pub fn set_available_after(&self, polls: u32) {
        self.inner.lock().available_after = polls;
    }

    pub fn timer(&self, index: usize) -> Arc<Mutex<FakeTimerState>> {
        Arc::clone(&self.inner.lock().timers[index])
    }

    pub fn timer_count(&self) -> usize {
        self.inner.lock().timers.len()
    }

    pub fn client(&self) -> Box<dyn GpuTimingClient> {
        Box::new(FakeTimingClient {
            control: self.clone(),
        })
    }

    pub fn context(&self) -> Box<dyn DecoderContext> {
        Box::new(FakeContext {
            control: self.clone(),
        })
    }
}

struct FakeTimer(Arc<Mutex<FakeTimerState>>);

impl GpuTimer for FakeTimer {
    fn start(&mut self) {
        self.0.lock().started = true;
    }

    fn end(&mut self) {
        self.0.lock().ended = true;
    }

    fn is_available(&mut self) -> bool {
        let mut state = self.0.lock();
        state.polls += 1;
        state.ended && state.polls >= state.available_after
    }

    fn start_end_timestamps(&mut self) -> (i64, i64) {
        let mut state = self.0.lock();
        state.reads += 1;
        (state.start_time, state.end_time)
    }

    fn is_disjoint(&mut self) -> bool {
        self.0.lock().disjoint
    }

    fn destroy(&mut self, have_context: bool) {
        self.0.lock().destroyed = Some(have_context);
    }
}

struct FakeTimingClient {
    control: GpuControl,
}

impl GpuTimingClient for FakeTimingClient {
    fn is_available(&self) -> bool {
        self.control.inner.lock().supported
    }

    fn create_timer(&mut self) -> Option<Box<dyn GpuTimer>> {
        let mut control = self.control.inner.lock();
        if !control.can_create {
            return None;
        }
        let state = Arc::new(Mutex::new(FakeTimerState {
            available_after: control.available_after,
            start_time: control.next_timestamp,
            end_time: control.next_timestamp + 10,
            ..FakeTimerState::default()
        }));
        control.next_timestamp += 100;
        control.timers.push(Arc::clone(&state));
        Some(Box::new(FakeTimer(state)))
    }

    fn check_and_reset_timer_errors(&mut self) -> bool {
        std::mem::take(&mut self.control.inner.lock().disjoint_pending)
    }

    fn current_cpu_time(&self) -> i64 {
        self.control.inner.lock().cpu_time
    }

    fn timer_type_name(&self) -> &str {
        "FakeTimer"
    }
}

struct FakeContext {
    control: GpuControl,
}

impl DecoderContext for FakeContext {
    fn make_current(&mut self) -> bool {
        self.control.inner.lock().context_ok
    }
}

/// A tracer wired to a fake device and an in-memory sink.
pub struct Harness {
    pub tracer: GpuTracer,
    pub control: GpuControl,
    pub outputter: Arc<TraceOutputter>,
    pub sink: MemorySink,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(TracerConfig::default())
    }

    pub fn with_config(config: TracerConfig) -> Self {
        let control = GpuControl::default();
        let sink = MemorySink::default();
        let outputter =
            Arc::new(TraceOutputter::spawn(sink.clone(), &config).expect("spawn outputter"));
        let tracer = GpuTracer::new(
            config,
            control.context(),
            Some(control.client()),
            outputter.clone(),
        );
        Self {
            tracer,
            control,
            outputter,
            sink,
        }
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.outputter.flush();
        self.sink.events()
    }

    /// `(name, start, end)` of every device event, in emission order.
    pub fn device_spans(&self) -> Vec<(String, i64, i64)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TraceEvent::Device {
                    name,
                    start_time,
                    end_time,
                    ..
                } => Some((name, start_time, end_time)),
                _ => None,
            })
            .collect()
    }

    /// `"b name"` / `"e name"` for every service event, in emission order.
    pub fn service_log(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TraceEvent::ServiceBegin { name, .. } => Some(format!("b {name}")),
                TraceEvent::ServiceEnd { name, .. } => Some(format!("e {name}")),
                TraceEvent::Device { .. } => None,
            })
            .collect()
    }
}
