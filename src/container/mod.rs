//! Motion-JPEG container format.
//!
//! ```text
//! Header  { signature:u32, width:u32, height:u32, frame_count:u32, fps:u32 }
//! Frame[i]{ size:u32, timestamp_ms:u32, payload: [u8; size] }   repeated until EOF
//! ```
//!
//! All fields are little-endian unless the signature arrives byte-swapped,
//! in which case every field (frame headers included) is big-endian.

pub mod header;
pub mod writer;

pub use header::{jpeg_dimensions, parse};
pub use writer::ContainerWriter;

/// `"MJPG"` stored little-endian.
pub const SIGNATURE: u32 = u32::from_le_bytes(*b"MJPG");
/// Alternate tag written by some encoders.
pub const ALT_SIGNATURE: u32 = u32::from_le_bytes(*b"mjpg");
/// Synthetic tag reported for bare JPEG sources.
pub const JPEG_SIGNATURE: u32 = 0xFFD8_FFD8;

pub const CONTAINER_HEADER_LEN: usize = 20;
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_BYTES: u32 = 1024 * 1024;

pub const MAX_DIMENSION: u32 = 4096;
pub const MAX_FRAME_COUNT: u32 = 10_000;
pub const MAX_FPS: u32 = 120;

pub const DEFAULT_WIDTH: u32 = 320;
pub const DEFAULT_HEIGHT: u32 = 240;
pub const DEFAULT_FRAME_COUNT: u32 = 100;
pub const DEFAULT_FPS: u32 = 30;

pub const SOI: [u8; 2] = [0xFF, 0xD8];
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Byte order the container fields were decoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    pub fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

/// How frames are delimited in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerShape {
    /// Structured header followed by length-prefixed frame records.
    Framed,
    /// Bare JPEG data; frames are found by SOI/EOI markers.
    RawJpeg,
}

/// Normalized container metadata. Every field is within its valid range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub signature: u32,
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub fps: u32,
    pub shape: ContainerShape,
    pub byte_order: ByteOrder,
}

impl ContainerHeader {
    /// Offset of the first frame record.
    pub fn data_start(&self) -> u64 {
        match self.shape {
            ContainerShape::Framed => CONTAINER_HEADER_LEN as u64,
            ContainerShape::RawJpeg => 0,
        }
    }

    /// Interval between frames implied by the header's fps.
    pub fn frame_interval_ms(&self) -> u32 {
        1000 / self.fps
    }

    /// A configured interval of zero means "follow the video's fps".
    pub fn resolve_interval(&self, configured_ms: u32) -> u32 {
        if configured_ms == 0 {
            self.frame_interval_ms()
        } else {
            configured_ms
        }
    }
}

/// Per-frame record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub size: u32,
    pub timestamp_ms: u32,
}

impl FrameHeader {
    pub fn from_bytes(bytes: [u8; FRAME_HEADER_LEN], order: ByteOrder) -> Self {
        Self {
            size: order.read_u32([bytes[0], bytes[1], bytes[2], bytes[3]]),
            timestamp_ms: order.read_u32([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self, order: ByteOrder) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[..4].copy_from_slice(&order.write_u32(self.size));
        out[4..].copy_from_slice(&order.write_u32(self.timestamp_ms));
        out
    }

    pub fn is_valid(&self, max_frame_bytes: u32) -> bool {
        self.size > 0 && self.size <= max_frame_bytes
    }
}
