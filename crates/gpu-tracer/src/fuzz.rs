use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TracerConfig;
use crate::outputter::Outputter;
use crate::source::{PerSource, TraceSource};
use crate::timing::{DecoderContext, GpuTimer, GpuTimingClient};
use crate::trace::{SpanId, TraceLabel};
use crate::tracer::GpuTracer;

#[derive(Default)]
struct Ledger {
    open: PerSource<Vec<SpanId>>,
    reported: HashSet<SpanId>,
}

/// Asserts LIFO service pairing and at-most-once device reporting.
#[derive(Default)]
struct CheckingOutputter {
    ledger: Mutex<Ledger>,
}

impl Outputter for CheckingOutputter {
    fn trace_service_begin(&self, label: &TraceLabel, _timestamp: i64) {
        self.ledger.lock().open[label.source].push(label.id);
    }

    fn trace_service_end(&self, label: &TraceLabel, _timestamp: i64) {
        let top = self.ledger.lock().open[label.source].pop();
        assert_eq!(top, Some(label.id), "service end out of order");
    }

    fn trace_device(&self, label: &TraceLabel, start_time: i64, end_time: i64) {
        assert!(start_time <= end_time);
        assert!(
            self.ledger.lock().reported.insert(label.id),
            "device reported twice for {}",
            label.id
        );
    }
}

#[derive(Default)]
struct DeviceState {
    available_after: u32,
    disjoint_pending: bool,
    context_ok: bool,
    clock: i64,
}

struct FuzzTimer {
    device: Arc<Mutex<DeviceState>>,
    polls: u32,
    available_after: u32,
    ended: bool,
    start_time: i64,
}

impl GpuTimer for FuzzTimer {
    fn start(&mut self) {
        let mut device = self.device.lock();
        device.clock += 1;
        self.start_time = device.clock;
    }

    fn end(&mut self) {
        self.ended = true;
    }

    fn is_available(&mut self) -> bool {
        self.polls += 1;
        self.ended && self.polls >= self.available_after
    }

    fn start_end_timestamps(&mut self) -> (i64, i64) {
        (self.start_time, self.start_time + 1)
    }

    fn destroy(&mut self, _have_context: bool) {}
}

struct FuzzClient(Arc<Mutex<DeviceState>>);

impl GpuTimingClient for FuzzClient {
    fn is_available(&self) -> bool {
        true
    }

    fn create_timer(&mut self) -> Option<Box<dyn GpuTimer>> {
        let available_after = self.0.lock().available_after;
        Some(Box::new(FuzzTimer {
            device: Arc::clone(&self.0),
            polls: 0,
            available_after,
            ended: false,
            start_time: 0,
        }))
    }

    fn check_and_reset_timer_errors(&mut self) -> bool {
        std::mem::take(&mut self.0.lock().disjoint_pending)
    }

    fn current_cpu_time(&self) -> i64 {
        self.0.lock().clock
    }
}

struct FuzzContext(Arc<Mutex<DeviceState>>);

impl DecoderContext for FuzzContext {
    fn make_current(&mut self) -> bool {
        self.0.lock().context_ok
    }
}

/// Drives a tracer with an operation sequence decoded from `data`.
pub fn fuzz_tracer_ops(data: &[u8]) {
    let device = Arc::new(Mutex::new(DeviceState {
        context_ok: true,
        ..DeviceState::default()
    }));
    let config = TracerConfig {
        trace_decoding_cycles: data.first().is_some_and(|byte| byte & 1 == 1),
        ..TracerConfig::default()
    };
    let mut tracer = GpuTracer::new(
        config,
        Box::new(FuzzContext(Arc::clone(&device))),
        Some(Box::new(FuzzClient(Arc::clone(&device)))),
        Arc::new(CheckingOutputter::default()),
    );

    for &byte in data {
        let source = TraceSource::ALL[usize::from(byte >> 4) % TraceSource::COUNT];
        let depth = tracer.marker_depth(source);
        let result = match byte & 0x0f {
            0 | 1 => tracer.begin("fuzz", "op", source),
            2 | 3 => tracer.end(source),
            4 => tracer.begin_decoding(),
            5 => tracer.end_decoding(),
            6 | 7 => {
                tracer.process_traces();
                Ok(())
            }
            8 => {
                device.lock().disjoint_pending = true;
                Ok(())
            }
            9 => {
                let mut device = device.lock();
                device.context_ok = !device.context_ok;
                Ok(())
            }
            10 => {
                device.lock().available_after = u32::from(byte >> 4);
                Ok(())
            }
            11 => {
                tracer.clear_ongoing_traces(byte & 0x10 != 0);
                Ok(())
            }
            12 => {
                tracer.check_disjoint_status();
                Ok(())
            }
            _ => Ok(()),
        };
        if source.is_reserved() && matches!(byte & 0x0f, 0 | 1) {
            assert!(result.is_err());
        }
        if matches!(byte & 0x0f, 2 | 3) {
            assert_eq!(result.is_ok(), depth > 0);
        }
    }
    tracer.destroy(true);
    assert!(!tracer.has_traces_to_process());
}
