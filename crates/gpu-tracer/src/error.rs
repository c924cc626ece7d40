use crate::source::TraceSource;

/// Misuse of the tracer API.
///
/// None of these are fatal: callers typically log them and keep decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TracerError {
    #[error("a decoding cycle is already active")]
    AlreadyDecoding,
    #[error("no decoding cycle is active")]
    NotDecoding,
    #[error("the decoder context is unusable")]
    ContextUnavailable,
    #[error("trace source {0} is reserved for internal use")]
    ReservedSource(TraceSource),
    #[error("no open marker for trace source {0}")]
    NoOpenMarker(TraceSource),
}
