use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use gpu_tracer::{
    AlwaysCurrent, GpuTimer, GpuTimingClient, GpuTracer, MemorySink, TraceOutputter, TraceSource,
    TracerConfig,
};

struct InstantTimer;

impl GpuTimer for InstantTimer {
    fn start(&mut self) {}

    fn end(&mut self) {}

    fn is_available(&mut self) -> bool {
        true
    }

    fn start_end_timestamps(&mut self) -> (i64, i64) {
        (0, 1)
    }

    fn destroy(&mut self, _have_context: bool) {}
}

struct InstantClient;

impl GpuTimingClient for InstantClient {
    fn is_available(&self) -> bool {
        true
    }

    fn create_timer(&mut self) -> Option<Box<dyn GpuTimer>> {
        Some(Box::new(InstantTimer))
    }

    fn check_and_reset_timer_errors(&mut self) -> bool {
        false
    }

    fn current_cpu_time(&self) -> i64 {
        0
    }
}

fn decode_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracer");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("batch_of_64_nested_markers", |b| {
        let config = TracerConfig::default();
        let sink = MemorySink::default();
        let outputter = Arc::new(TraceOutputter::spawn(sink.clone(), &config).expect("outputter"));
        let mut tracer = GpuTracer::new(
            config,
            Box::new(AlwaysCurrent),
            Some(Box::new(InstantClient)),
            outputter,
        );

        b.iter(|| {
            tracer.begin_decoding().expect("begin decoding");
            for _ in 0..32 {
                tracer
                    .begin("gpu", "outer", TraceSource::Decoder)
                    .expect("begin");
                tracer
                    .begin("webgl", "draw", TraceSource::Chromium)
                    .expect("begin");
                tracer.end(TraceSource::Chromium).expect("end");
                tracer.end(TraceSource::Decoder).expect("end");
            }
            tracer.end_decoding().expect("end decoding");
            tracer.process_traces();
            sink.take();
        });
    });

    group.finish();
}

criterion_group!(benches, decode_batches);
criterion_main!(benches);
