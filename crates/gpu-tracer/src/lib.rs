//! GPU Tracer
//! ==========
//! Causally ordered tracing of GPU command processing. Every traced operation
//! produces a service-side (CPU) span and, when timer queries are supported,
//! a device-side (GPU) span whose result is collected asynchronously. Events
//! are delivered to a sink from a dedicated thread so the command-processing
//! thread never blocks on tracing I/O.

pub mod config;
pub mod error;
#[cfg(any(test, feature = "fuzzing"))]
mod fuzz;
pub mod outputter;
pub mod source;
pub mod timing;
pub mod trace;
pub mod tracer;

pub use config::TracerConfig;
pub use error::TracerError;
#[cfg(any(test, feature = "fuzzing"))]
pub use fuzz::fuzz_tracer_ops;
pub use outputter::{
    ChromeTraceSink, LogSink, MemorySink, Outputter, TraceEvent, TraceOutputter, TraceSink,
};
pub use source::{PerSource, TraceSource};
pub use timing::{AlwaysCurrent, DecoderContext, GpuTimer, GpuTimingClient};
pub use trace::{GpuTrace, SpanId, TraceLabel, TraceMarker};
pub use tracer::{GpuTracer, ScopedGpuTrace};
