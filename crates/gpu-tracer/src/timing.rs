//! Capabilities consumed from the graphics layer.
//!
//! The tracer never talks to a graphics API directly. Hardware timer queries,
//! the global disjoint state and the owning context are reached through the
//! traits below so that backends (and tests) can supply their own bindings.

/// One hardware timer query.
///
/// Results become available asynchronously; [`GpuTimer::is_available`] only
/// polls and must never wait on the device.
pub trait GpuTimer: Send {
    /// Begins the timed interval.
    fn start(&mut self);

    /// Ends the timed interval. The result is usually not ready yet.
    fn end(&mut self);

    /// Non-blocking poll for the query result.
    fn is_available(&mut self) -> bool;

    /// Device timestamps of the interval in microseconds. Only meaningful
    /// once [`GpuTimer::is_available`] returned `true`.
    fn start_end_timestamps(&mut self) -> (i64, i64);

    /// Whether a timer discontinuity happened while this query was running.
    fn is_disjoint(&mut self) -> bool {
        false
    }

    /// Releases the query. Implementations must not touch the device when
    /// `have_context` is `false`.
    fn destroy(&mut self, have_context: bool);
}

/// Factory for timer queries bound to one graphics context.
pub trait GpuTimingClient: Send {
    /// Whether timer queries are supported by the current context.
    fn is_available(&self) -> bool;

    /// Creates a new query, or `None` when the driver cannot provide one.
    fn create_timer(&mut self) -> Option<Box<dyn GpuTimer>>;

    /// Returns `true` if a disjoint event occurred since the previous call and
    /// resets the driver side state.
    fn check_and_reset_timer_errors(&mut self) -> bool;

    /// CPU clock in microseconds, on the same time base as device timestamps.
    fn current_cpu_time(&self) -> i64;

    /// Human readable name of the timer implementation.
    fn timer_type_name(&self) -> &str {
        "GPUTimer"
    }
}

/// The graphics context that owns the decoder being traced.
pub trait DecoderContext: Send {
    /// Makes the context current on the calling thread. Returns `false` when
    /// the context is lost or otherwise unusable.
    fn make_current(&mut self) -> bool;
}

/// A [`DecoderContext`] that is always usable, for CPU-only setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysCurrent;

impl DecoderContext for AlwaysCurrent {
    #[inline]
    fn make_current(&mut self) -> bool {
        true
    }
}
