//! File-backed byte source with positioned reads.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use super::{ByteSource, Fetch, Payload, HEADER_SNIFF_LEN};
use crate::container::{ByteOrder, FrameHeader, FRAME_HEADER_LEN};
use crate::error::SourceError;
use crate::memory::TieredAllocator;

/// A container file, exclusively owned for the player's lifetime.
pub struct FileSource {
    file: File,
    path: PathBuf,
    len: u64,
    cursor: u64,
    data_start: u64,
    looping: bool,
    allocator: TieredAllocator,
}

impl FileSource {
    #[instrument(skip(allocator))]
    pub fn open(path: &Path, allocator: TieredAllocator) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file.metadata()?.len();
        info!(path = %path.display(), len, "opened video file");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            cursor: 0,
            data_start: 0,
            looping: true,
            allocator,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), SourceError> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn end_of_data(&mut self) -> Result<Fetch<()>, SourceError> {
        if !self.looping {
            return Ok(Fetch::Exhausted);
        }
        debug!(path = %self.path.display(), "end of file, rewinding");
        self.rewind_to_data_start()?;
        Ok(Fetch::Rewound)
    }
}

impl ByteSource for FileSource {
    fn has_bytes_available(&self) -> bool {
        self.cursor < self.len
    }

    fn read_header_region(&mut self) -> Result<Vec<u8>, SourceError> {
        let want = HEADER_SNIFF_LEN.min(self.len as usize);
        let mut buf = vec![0u8; want];
        self.read_exact_at(0, &mut buf)?;
        Ok(buf)
    }

    fn ensure(&mut self, pos: u64, len: usize) -> Result<Fetch<()>, SourceError> {
        match pos.checked_add(len as u64) {
            Some(end) if end <= self.len => Ok(Fetch::Ready(())),
            _ => self.end_of_data(),
        }
    }

    fn frame_header_at(
        &mut self,
        pos: u64,
        order: ByteOrder,
    ) -> Result<Fetch<FrameHeader>, SourceError> {
        match self.ensure(pos, FRAME_HEADER_LEN)? {
            Fetch::Ready(()) => {
                let mut raw = [0u8; FRAME_HEADER_LEN];
                self.read_exact_at(pos, &mut raw)?;
                Ok(Fetch::Ready(FrameHeader::from_bytes(raw, order)))
            }
            Fetch::Pending => Ok(Fetch::Pending),
            Fetch::Rewound => Ok(Fetch::Rewound),
            Fetch::Exhausted => Ok(Fetch::Exhausted),
        }
    }

    fn payload_at(&mut self, pos: u64, len: usize) -> Result<Payload<'_>, SourceError> {
        let mut block = self.allocator.allocate(len, "frame payload")?;
        self.read_exact_at(pos, &mut block)?;
        Ok(Payload::Owned(block))
    }

    fn max_payload(&self) -> Option<usize> {
        None
    }

    fn position(&self) -> u64 {
        self.cursor
    }

    fn advance_to(&mut self, pos: u64) {
        self.cursor = pos;
    }

    fn set_data_start(&mut self, pos: u64) {
        self.data_start = pos;
        self.cursor = pos;
    }

    fn rewind_to_data_start(&mut self) -> Result<(), SourceError> {
        self.cursor = self.data_start;
        Ok(())
    }

    fn set_loop(&mut self, looping: bool) {
        self.looping = looping;
    }
}
