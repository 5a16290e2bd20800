//! Frame boundary detection.
//!
//! [`LengthPrefixed`] walks `size, timestamp, payload` records through any
//! [`ByteSource`]. [`MarkerScanner`] finds SOI..EOI spans in a
//! [`StreamSource`](crate::source::StreamSource) whose chunks may split a
//! marker in two.
//!
//! Neither moves the source past a frame it returns; the caller draws from
//! the span and then calls [`commit`].

mod length;
mod marker;

pub use length::LengthPrefixed;
pub use marker::MarkerScanner;

use crate::source::ByteSource;

/// Byte range of one complete frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    /// Absolute offset of the first payload byte.
    pub offset: u64,
    pub len: usize,
    /// Where the next record starts.
    pub next: u64,
    pub timestamp_ms: Option<u32>,
}

/// Why bytes were passed over without producing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Frame header size outside `(0, max_frame_bytes]`.
    InvalidSize(u32),
    /// Frame can never fit in the stream buffer.
    ExceedsBuffer { len: usize, capacity: usize },
    /// Marker-delimited frame longer than `max_frame_bytes`.
    Oversized(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demuxed {
    Frame { span: FrameSpan, wrapped: bool },
    Pending,
    Skipped(SkipReason),
    Exhausted,
}

/// Move the source past a frame returned by a demuxer.
pub fn commit(source: &mut dyn ByteSource, span: &FrameSpan) {
    source.advance_to(span.next);
}
