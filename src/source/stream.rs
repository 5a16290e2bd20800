//! Stream-backed byte source.
//!
//! A [`StreamBuffer`] is one block allocated up front; chunks from a
//! [`ChunkFeed`] are appended as room allows. Consumed bytes are only
//! reclaimed when an append would not otherwise fit, so a stream shorter
//! than the buffer stays whole and can loop without reconnecting.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{ByteSource, Fetch, Payload, HEADER_SNIFF_LEN};
use crate::container::{ByteOrder, FrameHeader, FRAME_HEADER_LEN};
use crate::error::{SourceError, TransportError};
use crate::memory::{Block, TieredAllocator};
use crate::transport::{Link, LinkState};

/// Default stream buffer capacity.
pub const DEFAULT_BUFFER_BYTES: usize = 256 * 1024;
pub const MIN_BUFFER_BYTES: usize = 64 * 1024;
pub const MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// Fixed-capacity window over an unbounded byte stream.
///
/// `base` is the absolute offset of `block[0]`. The read cursor may run
/// ahead of the populated end; incoming bytes before it are then dropped.
pub struct StreamBuffer {
    block: Block,
    base: u64,
    len: usize,
    cursor: u64,
}

impl StreamBuffer {
    pub fn new(block: Block) -> Self {
        Self {
            block,
            base: 0,
            len: 0,
            cursor: 0,
        }
    }

    pub fn allocate(allocator: &TieredAllocator, capacity: usize) -> Result<Self, SourceError> {
        let block = allocator.allocate(capacity, "stream buffer")?;
        debug!(capacity, "stream buffer allocated");
        Ok(Self::new(block))
    }

    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Absolute offset one past the last populated byte.
    pub fn end(&self) -> u64 {
        self.base + self.len as u64
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn buffered(&self) -> usize {
        self.len
    }

    /// Bytes that could be appended after reclaiming consumed data.
    pub fn room(&self) -> usize {
        let unconsumed = self.end().saturating_sub(self.cursor) as usize;
        self.capacity() - unconsumed.min(self.len)
    }

    /// Full of unconsumed bytes: nothing more can be appended until the
    /// cursor moves.
    pub fn is_stuck(&self) -> bool {
        self.room() == 0
    }

    /// Whether `pos` is still held in the buffer.
    pub fn holds(&self, pos: u64) -> bool {
        pos >= self.base && pos <= self.end()
    }

    /// Append as much of `data` as fits and return how many bytes were taken.
    pub fn append(&mut self, mut data: &[u8]) -> usize {
        let mut taken = 0;
        let end = self.end();
        if self.cursor > end {
            let skip = (self.cursor - end).min(data.len() as u64) as usize;
            self.base = end + skip as u64;
            self.len = 0;
            data = &data[skip..];
            taken = skip;
        }

        if data.len() > self.capacity() - self.len {
            self.reclaim();
        }
        let n = data.len().min(self.capacity() - self.len);
        self.block[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        taken + n
    }

    fn reclaim(&mut self) {
        let consumed = (self.cursor.min(self.end()) - self.base) as usize;
        if consumed == 0 {
            return;
        }
        self.block.copy_within(consumed..self.len, 0);
        self.base += consumed as u64;
        self.len -= consumed;
    }

    /// Populated bytes in `[pos, pos + len)`, if all of them are held.
    pub fn window(&self, pos: u64, len: usize) -> Option<&[u8]> {
        let start = pos.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.len).then(|| &self.block[start..end])
    }

    /// Everything populated from `pos` onward.
    pub fn tail(&self, pos: u64) -> &[u8] {
        match pos.checked_sub(self.base) {
            Some(start) if start as usize <= self.len => &self.block[start as usize..self.len],
            _ => &[],
        }
    }

    /// Mark everything before `pos` as consumed. The cursor never moves
    /// below `base`.
    pub fn consume_to(&mut self, pos: u64) {
        self.cursor = pos.max(self.base);
    }

    /// Forget all data and start again at offset zero.
    pub fn reset(&mut self) {
        self.base = 0;
        self.len = 0;
        self.cursor = 0;
    }
}

/// Reads a local file in chunks, standing in for a network feed.
pub struct FileChunks {
    file: File,
    chunk_len: usize,
    eof: bool,
}

impl FileChunks {
    pub fn open(path: &Path, chunk_len: usize) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            file,
            chunk_len: chunk_len.max(1),
            eof: false,
        })
    }

    fn next(&mut self, room: usize) -> Result<Option<Bytes>, SourceError> {
        if self.eof {
            return Ok(None);
        }
        let mut buf = vec![0u8; room.min(self.chunk_len)];
        let read = self.file.read(&mut buf)?;
        if read == 0 {
            self.eof = true;
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(Bytes::from(buf)))
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.eof = false;
        Ok(())
    }
}

/// Where stream chunks come from.
pub enum ChunkFeed {
    Link(Link),
    File(FileChunks),
}

impl ChunkFeed {
    /// Next chunk of at most roughly `room` bytes, or `None` if nothing is
    /// ready. Network chunks arrive at their own size.
    pub fn next_chunk(&mut self, room: usize) -> Result<Option<Bytes>, SourceError> {
        match self {
            ChunkFeed::Link(link) => Ok(link.poll_chunk()),
            ChunkFeed::File(chunks) => chunks.next(room),
        }
    }

    /// No more data will arrive.
    pub fn is_finished(&self) -> bool {
        match self {
            ChunkFeed::Link(link) => !link.is_open(),
            ChunkFeed::File(chunks) => chunks.eof,
        }
    }

    pub fn failure(&self) -> Option<&TransportError> {
        match self {
            ChunkFeed::Link(link) => match link.state() {
                LinkState::Failed(err) => Some(err),
                _ => None,
            },
            ChunkFeed::File(_) => None,
        }
    }

    /// Replay from the beginning. Network links cannot restart in place.
    pub fn restart(&mut self) -> Result<bool, SourceError> {
        match self {
            ChunkFeed::Link(_) => Ok(false),
            ChunkFeed::File(chunks) => chunks.restart().map(|()| true),
        }
    }
}

/// A [`ByteSource`] over a [`StreamBuffer`] filled from a [`ChunkFeed`].
pub struct StreamSource {
    buffer: StreamBuffer,
    feed: ChunkFeed,
    pending: Option<Bytes>,
    data_start: u64,
    looping: bool,
    bytes_received: u64,
}

impl StreamSource {
    pub fn new(buffer: StreamBuffer, feed: ChunkFeed) -> Self {
        Self {
            buffer,
            feed,
            pending: None,
            data_start: 0,
            looping: true,
            bytes_received: 0,
        }
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    /// Move whatever the feed has ready into the buffer. A chunk that does
    /// not fit is parked and retried before anything else is dequeued.
    pub fn pump(&mut self) -> Result<(), SourceError> {
        if let Some(parked) = self.pending.take() {
            if !self.accept(parked) {
                return Ok(());
            }
        }

        loop {
            let room = self.buffer.room();
            if room == 0 {
                return Ok(());
            }
            match self.feed.next_chunk(room)? {
                Some(chunk) => {
                    self.bytes_received += chunk.len() as u64;
                    metrics::counter!("stream_bytes_received").increment(chunk.len() as u64);
                    if !self.accept(chunk) {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Returns false if part of the chunk had to be parked.
    fn accept(&mut self, chunk: Bytes) -> bool {
        let taken = self.buffer.append(&chunk);
        if taken < chunk.len() {
            self.pending = Some(chunk.slice(taken..));
            return false;
        }
        true
    }

    /// The feed is done and nothing is parked.
    pub fn feed_done(&self) -> bool {
        self.pending.is_none() && self.feed.is_finished()
    }

    /// Enough bytes have arrived to sniff the container format.
    pub fn header_ready(&self) -> bool {
        self.buffer.base() == 0
            && (self.buffer.buffered() >= HEADER_SNIFF_LEN
                || self.buffer.is_stuck()
                || self.feed_done())
    }

    /// Populated bytes from `pos` onward.
    pub fn tail(&self, pos: u64) -> &[u8] {
        self.buffer.tail(pos)
    }

    pub fn end(&self) -> u64 {
        self.buffer.end()
    }

    pub fn is_stuck(&self) -> bool {
        self.buffer.is_stuck()
    }

    /// Settle what happens once the populated data has been used up.
    pub fn end_of_data(&mut self) -> Result<Fetch<()>, SourceError> {
        if !self.feed.is_finished() || self.pending.is_some() {
            return Ok(Fetch::Pending);
        }
        if let Some(err) = self.feed.failure() {
            return Err(SourceError::Transport(err.clone()));
        }
        if !self.looping {
            return Ok(Fetch::Exhausted);
        }

        if self.buffer.holds(self.data_start) {
            debug!(data_start = self.data_start, "rewinding within stream buffer");
            self.rewind_to_data_start()?;
            return Ok(Fetch::Rewound);
        }
        if self.feed.restart()? {
            info!("restarting chunk feed from the beginning");
            self.buffer.reset();
            self.buffer.consume_to(self.data_start);
            return Ok(Fetch::Rewound);
        }
        Err(SourceError::OriginDiscarded)
    }
}

impl ByteSource for StreamSource {
    fn has_bytes_available(&self) -> bool {
        self.buffer.end() > self.buffer.cursor() || !self.feed_done()
    }

    fn read_header_region(&mut self) -> Result<Vec<u8>, SourceError> {
        self.pump()?;
        if self.buffer.base() != 0 {
            return Err(SourceError::OriginDiscarded);
        }
        let len = self.buffer.buffered().min(HEADER_SNIFF_LEN);
        Ok(self.buffer.tail(0)[..len].to_vec())
    }

    fn ensure(&mut self, pos: u64, len: usize) -> Result<Fetch<()>, SourceError> {
        self.pump()?;
        if self.buffer.window(pos, len).is_some() {
            return Ok(Fetch::Ready(()));
        }
        if len > self.buffer.capacity() {
            let err = SourceError::CapacityExceeded {
                chunk: len,
                capacity: self.buffer.capacity(),
            };
            warn!(error = %err, "read can never be satisfied from the stream buffer");
        }
        self.end_of_data()
    }

    fn frame_header_at(
        &mut self,
        pos: u64,
        order: ByteOrder,
    ) -> Result<Fetch<FrameHeader>, SourceError> {
        Ok(match self.ensure(pos, FRAME_HEADER_LEN)? {
            Fetch::Ready(()) => {
                let mut raw = [0u8; FRAME_HEADER_LEN];
                let bytes = self.buffer.window(pos, FRAME_HEADER_LEN).ok_or(
                    SourceError::OutOfWindow {
                        offset: pos,
                        len: FRAME_HEADER_LEN,
                    },
                )?;
                raw.copy_from_slice(bytes);
                Fetch::Ready(FrameHeader::from_bytes(raw, order))
            }
            Fetch::Pending => Fetch::Pending,
            Fetch::Rewound => Fetch::Rewound,
            Fetch::Exhausted => Fetch::Exhausted,
        })
    }

    fn payload_at(&mut self, pos: u64, len: usize) -> Result<Payload<'_>, SourceError> {
        self.buffer
            .window(pos, len)
            .map(Payload::Borrowed)
            .ok_or(SourceError::OutOfWindow { offset: pos, len })
    }

    fn max_payload(&self) -> Option<usize> {
        Some(self.buffer.capacity())
    }

    fn position(&self) -> u64 {
        self.buffer.cursor()
    }

    fn advance_to(&mut self, pos: u64) {
        self.buffer.consume_to(pos);
    }

    fn set_data_start(&mut self, pos: u64) {
        self.data_start = pos;
        self.buffer.consume_to(pos);
    }

    fn rewind_to_data_start(&mut self) -> Result<(), SourceError> {
        if self.buffer.holds(self.data_start) {
            self.buffer.consume_to(self.data_start);
            Ok(())
        } else {
            Err(SourceError::OriginDiscarded)
        }
    }

    fn set_loop(&mut self, looping: bool) {
        self.looping = looping;
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::transport::{ChannelTransport, Transport};

    fn buffer(capacity: usize) -> StreamBuffer {
        StreamBuffer::allocate(&TieredAllocator::heap(1 << 20), capacity).unwrap()
    }

    #[test]
    fn append_reclaims_only_when_needed() {
        let mut buf = buffer(8);
        assert_eq!(buf.append(b"abcdef"), 6);
        buf.consume_to(4);
        assert_eq!(buf.base(), 0, "nothing reclaimed while there is room");

        assert_eq!(buf.append(b"ghij"), 4);
        assert_eq!(buf.base(), 4);
        assert_eq!(buf.window(4, 6), Some(&b"efghij"[..]));
        assert_eq!(buf.window(0, 1), None);
    }

    #[test]
    fn full_buffer_takes_partial_chunk() {
        let mut buf = buffer(4);
        assert_eq!(buf.append(b"abcdef"), 4);
        assert!(buf.is_stuck());
        buf.consume_to(2);
        assert_eq!(buf.room(), 2);
    }

    #[test]
    fn cursor_past_end_drops_incoming_bytes() {
        let mut buf = buffer(8);
        buf.append(b"abc");
        buf.consume_to(6);
        assert_eq!(buf.append(b"defgh"), 5);
        assert_eq!(buf.base(), 6);
        assert_eq!(buf.tail(6), b"gh");
    }

    #[test]
    fn parked_chunk_waits_for_room() {
        let (transport, pusher) = ChannelTransport::new(4);
        let link = transport.open("http://camera/stream").unwrap();
        let mut source = StreamSource::new(buffer(4), ChunkFeed::Link(link));

        pusher.push(&b"abcdef"[..]).unwrap();
        pusher.push(&b"gh"[..]).unwrap();
        source.pump().unwrap();
        assert_eq!(source.tail(0), b"abcd");

        source.advance_to(4);
        source.pump().unwrap();
        assert_eq!(source.tail(4), b"efgh");
        assert_eq!(source.bytes_received(), 8);
    }

    #[test]
    fn short_stream_loops_inside_buffer() {
        let (transport, pusher) = ChannelTransport::new(4);
        let link = transport.open("http://camera/stream").unwrap();
        let mut source = StreamSource::new(buffer(64), ChunkFeed::Link(link));

        pusher.push(&[1u8; 30][..]).unwrap();
        pusher.finish().unwrap();
        source.pump().unwrap();
        source.set_data_start(20);
        assert!(matches!(source.ensure(20, 10).unwrap(), Fetch::Ready(())));
        source.advance_to(30);
        assert!(matches!(source.ensure(30, 8).unwrap(), Fetch::Rewound));
        assert_eq!(source.position(), 20);

        source.set_loop(false);
        source.advance_to(30);
        assert!(matches!(source.ensure(30, 8).unwrap(), Fetch::Exhausted));
    }

    #[test]
    fn open_link_reports_pending() {
        let (transport, pusher) = ChannelTransport::new(4);
        let link = transport.open("http://camera/stream").unwrap();
        let mut source = StreamSource::new(buffer(64), ChunkFeed::Link(link));
        pusher.push(&[0u8; 4][..]).unwrap();
        assert!(matches!(source.ensure(0, 8).unwrap(), Fetch::Pending));
        assert!(source.has_bytes_available());
    }

    #[test]
    fn reclaimed_origin_needs_reconnect() {
        let (transport, pusher) = ChannelTransport::new(8);
        let link = transport.open("http://camera/stream").unwrap();
        let mut source = StreamSource::new(buffer(8), ChunkFeed::Link(link));

        pusher.push(&[0u8; 8][..]).unwrap();
        source.pump().unwrap();
        source.advance_to(8);
        pusher.push(&[0u8; 4][..]).unwrap();
        pusher.finish().unwrap();
        source.pump().unwrap();
        source.advance_to(12);
        assert!(matches!(source.ensure(12, 1), Err(SourceError::OriginDiscarded)));
    }

    #[test]
    fn rewind_inside_buffer_restores_data_start() {
        let (transport, pusher) = ChannelTransport::new(4);
        let link = transport.open("http://camera/stream").unwrap();
        let mut source = StreamSource::new(buffer(64), ChunkFeed::Link(link));

        let bytes: Vec<u8> = (0..40).collect();
        pusher.push(bytes).unwrap();
        source.pump().unwrap();
        source.set_data_start(20);
        source.advance_to(36);

        source.rewind_to_data_start().unwrap();
        assert_eq!(source.position(), 20);
        assert_eq!(&source.tail(20)[..4], &[20, 21, 22, 23]);
    }

    #[test]
    fn rewind_fails_once_data_start_is_reclaimed() {
        let (transport, pusher) = ChannelTransport::new(8);
        let link = transport.open("http://camera/stream").unwrap();
        let mut source = StreamSource::new(buffer(8), ChunkFeed::Link(link));

        pusher.push(&[0u8; 8][..]).unwrap();
        source.pump().unwrap();
        source.set_data_start(2);
        source.advance_to(8);
        pusher.push(&[0u8; 4][..]).unwrap();
        source.pump().unwrap();

        assert!(matches!(
            source.rewind_to_data_start(),
            Err(SourceError::OriginDiscarded)
        ));
        assert_eq!(source.position(), 8);
    }

    #[test]
    fn failed_link_surfaces_transport_error() {
        let (transport, pusher) = ChannelTransport::new(4);
        let link = transport.open("http://camera/stream").unwrap();
        let mut source = StreamSource::new(buffer(16), ChunkFeed::Link(link));
        pusher.fail(TransportError::Status(500)).unwrap();
        let err = source.ensure(0, 1).unwrap_err();
        assert!(matches!(err, SourceError::Transport(TransportError::Status(500))));
        assert!(err.is_transient());
    }

    #[test]
    fn file_feed_restarts_when_origin_is_gone() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..32).collect();
        tmp.write_all(&bytes).unwrap();
        tmp.flush().unwrap();

        let feed = ChunkFeed::File(FileChunks::open(tmp.path(), 4).unwrap());
        let mut source = StreamSource::new(buffer(8), feed);
        for pos in (0..32).step_by(8) {
            assert!(matches!(source.ensure(pos, 8).unwrap(), Fetch::Ready(())));
            source.advance_to(pos + 8);
        }
        assert!(matches!(source.ensure(32, 1).unwrap(), Fetch::Rewound));
        assert!(matches!(source.ensure(0, 4).unwrap(), Fetch::Ready(())));
        assert_eq!(&*source.payload_at(0, 4).unwrap(), &[0, 1, 2, 3]);
    }
}
