//! Trace namespaces.
//!
//! Every marker belongs to exactly one [`TraceSource`]. Nesting is only
//! meaningful within a source, so each source carries its own marker stack.

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::Serialize;

/// Identifies an independent producer of trace markers.
///
/// Serializes as its channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TraceSource {
    /// Markers issued by clients through the command stream.
    #[serde(rename = "TraceCHROMIUM")]
    Chromium,
    /// Markers generated by the command decoder itself.
    #[serde(rename = "TraceCmd")]
    Decoder,
    /// Reserved for disjoint bookkeeping and decoding-cycle spans.
    Disjoint,
}

impl TraceSource {
    pub const COUNT: usize = 3;

    pub const ALL: [TraceSource; Self::COUNT] = [
        TraceSource::Chromium,
        TraceSource::Decoder,
        TraceSource::Disjoint,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            TraceSource::Chromium => 0,
            TraceSource::Decoder => 1,
            TraceSource::Disjoint => 2,
        }
    }

    /// Channel name reported alongside every emitted event.
    pub const fn name(self) -> &'static str {
        match self {
            TraceSource::Chromium => "TraceCHROMIUM",
            TraceSource::Decoder => "TraceCmd",
            TraceSource::Disjoint => "Disjoint",
        }
    }

    /// Reserved sources are only written by the tracer itself.
    #[inline]
    pub const fn is_reserved(self) -> bool {
        matches!(self, TraceSource::Disjoint)
    }
}

impl fmt::Display for TraceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per [`TraceSource`], laid out as a fixed array.
#[derive(Debug, Clone, Default)]
pub struct PerSource<T> {
    slots: [T; TraceSource::COUNT],
}

impl<T> PerSource<T> {
    pub fn from_fn(mut init: impl FnMut(TraceSource) -> T) -> Self {
        Self {
            slots: TraceSource::ALL.map(&mut init),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TraceSource, &T)> {
        TraceSource::ALL.into_iter().zip(self.slots.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (TraceSource, &mut T)> {
        TraceSource::ALL.into_iter().zip(self.slots.iter_mut())
    }
}

impl<T> Index<TraceSource> for PerSource<T> {
    type Output = T;

    fn index(&self, source: TraceSource) -> &T {
        &self.slots[source.index()]
    }
}

impl<T> IndexMut<TraceSource> for PerSource<T> {
    fn index_mut(&mut self, source: TraceSource) -> &mut T {
        &mut self.slots[source.index()]
    }
}
