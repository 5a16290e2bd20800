//! Container encoder.

use std::io::{self, Write};

use super::{ByteOrder, FrameHeader, SIGNATURE};

/// Writes a motion-JPEG container: header first, then one record per frame.
pub struct ContainerWriter<W: Write> {
    inner: W,
    order: ByteOrder,
    fps: u32,
    frames_written: u32,
}

impl<W: Write> ContainerWriter<W> {
    /// Write the container header and return a writer ready for frames.
    pub fn new(inner: W, width: u32, height: u32, frame_count: u32, fps: u32) -> io::Result<Self> {
        Self::with_byte_order(inner, width, height, frame_count, fps, ByteOrder::Little)
    }

    pub fn with_byte_order(
        mut inner: W,
        width: u32,
        height: u32,
        frame_count: u32,
        fps: u32,
        order: ByteOrder,
    ) -> io::Result<Self> {
        // big-endian output spells the tag backwards ("GPJM")
        inner.write_all(&order.write_u32(SIGNATURE))?;
        for field in [width, height, frame_count, fps] {
            inner.write_all(&order.write_u32(field))?;
        }
        Ok(Self {
            inner,
            order,
            fps,
            frames_written: 0,
        })
    }

    /// Append one JPEG payload. Timestamps advance by `1000 / fps`.
    pub fn write_frame(&mut self, jpeg: &[u8]) -> io::Result<()> {
        let size = u32::try_from(jpeg.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        let header = FrameHeader {
            size,
            timestamp_ms: self.frames_written * (1000 / self.fps.max(1)),
        };
        self.inner.write_all(&header.to_bytes(self.order))?;
        self.inner.write_all(jpeg)?;
        self.frames_written += 1;
        Ok(())
    }

    /// Write a raw record, bypassing any validation. Used to build
    /// deliberately damaged containers.
    pub fn write_record(&mut self, header: FrameHeader, payload: &[u8]) -> io::Result<()> {
        self.inner.write_all(&header.to_bytes(self.order))?;
        self.inner.write_all(payload)?;
        Ok(())
    }

    pub fn frames_written(&self) -> u32 {
        self.frames_written
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
