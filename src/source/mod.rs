//! Bounded byte sources.
//!
//! Two flavours sit behind [`ByteSource`]:
//! - [`FileSource`]: a seekable file read on demand
//! - [`StreamSource`]: a fixed-capacity buffer filled from a [`ChunkFeed`]
//!
//! Positions are absolute offsets from the start of the container, so a
//! stream buffer can reclaim consumed bytes without invalidating them.

pub mod file;
pub mod stream;

use std::ops::Deref;

use crate::container::{ByteOrder, FrameHeader};
use crate::error::SourceError;
use crate::memory::Block;

pub use file::FileSource;
pub use stream::{ChunkFeed, FileChunks, StreamBuffer, StreamSource};

/// Bytes read for format sniffing.
pub const HEADER_SNIFF_LEN: usize = 256;

/// Outcome of a positioned read.
#[derive(Debug)]
pub enum Fetch<T> {
    Ready(T),
    /// More data is expected; try again on a later tick.
    Pending,
    /// End of data reached and the source looped back to its data start.
    Rewound,
    /// End of data reached and looping is off.
    Exhausted,
}

/// Frame payload, either borrowed from a stream buffer or read into a block.
pub enum Payload<'a> {
    Borrowed(&'a [u8]),
    Owned(Block),
}

impl Deref for Payload<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Payload::Borrowed(bytes) => bytes,
            Payload::Owned(block) => block,
        }
    }
}

/// Capability set shared by file- and stream-backed sources.
pub trait ByteSource {
    /// Whether unread bytes exist or are still expected.
    fn has_bytes_available(&self) -> bool;

    /// Up to [`HEADER_SNIFF_LEN`] bytes from the start of the container.
    fn read_header_region(&mut self) -> Result<Vec<u8>, SourceError>;

    /// Check that `len` bytes starting at `pos` can be read. Hitting the end
    /// of data applies the loop policy.
    fn ensure(&mut self, pos: u64, len: usize) -> Result<Fetch<()>, SourceError>;

    /// Read and decode the frame header at `pos`.
    fn frame_header_at(
        &mut self,
        pos: u64,
        order: ByteOrder,
    ) -> Result<Fetch<FrameHeader>, SourceError>;

    /// Read exactly `len` payload bytes at `pos`. Callers must `ensure` first.
    fn payload_at(&mut self, pos: u64, len: usize) -> Result<Payload<'_>, SourceError>;

    /// Largest payload this source can ever hold at once, if bounded.
    fn max_payload(&self) -> Option<usize>;

    fn position(&self) -> u64;

    fn advance_to(&mut self, pos: u64);

    fn set_data_start(&mut self, pos: u64);

    fn rewind_to_data_start(&mut self) -> Result<(), SourceError>;

    /// End-of-data policy: loop back to the data start, or report exhaustion.
    fn set_loop(&mut self, looping: bool);

    /// Bytes delivered over the network so far.
    fn bytes_received(&self) -> u64 {
        0
    }
}
