//! Container header parsing with byte-order and sanity recovery.
//!
//! Devices in the field write headers with inconsistent endianness and the
//! occasional garbage field. A header is normalized to sane defaults field by
//! field; only truncation or a header with nothing recoverable is an error.

use tracing::{debug, trace, warn};

use super::{
    ByteOrder, ContainerHeader, ContainerShape, ALT_SIGNATURE, CONTAINER_HEADER_LEN,
    DEFAULT_FPS, DEFAULT_FRAME_COUNT, DEFAULT_HEIGHT, DEFAULT_WIDTH, JPEG_SIGNATURE,
    MAX_DIMENSION, MAX_FPS, MAX_FRAME_COUNT, SIGNATURE, SOI,
};
use crate::error::HeaderError;

struct FieldSpec {
    name: &'static str,
    max: u32,
    default: u32,
}

const FIELDS: [FieldSpec; 4] = [
    FieldSpec { name: "width", max: MAX_DIMENSION, default: DEFAULT_WIDTH },
    FieldSpec { name: "height", max: MAX_DIMENSION, default: DEFAULT_HEIGHT },
    FieldSpec { name: "frame_count", max: MAX_FRAME_COUNT, default: DEFAULT_FRAME_COUNT },
    FieldSpec { name: "fps", max: MAX_FPS, default: DEFAULT_FPS },
];

fn in_range(value: u32, max: u32) -> bool {
    value > 0 && value <= max
}

fn word(buf: &[u8], index: usize) -> [u8; 4] {
    let at = index * 4;
    [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
}

/// Parse and normalize a container header from the start of `buf`.
pub fn parse(buf: &[u8]) -> Result<ContainerHeader, HeaderError> {
    if buf.starts_with(&SOI) {
        return Ok(parse_bare_jpeg(buf));
    }

    if buf.len() < CONTAINER_HEADER_LEN {
        return Err(HeaderError::InsufficientData {
            needed: CONTAINER_HEADER_LEN,
            available: buf.len(),
        });
    }

    let signature = u32::from_le_bytes(word(buf, 0));
    let order = match signature {
        SIGNATURE | ALT_SIGNATURE => Some(ByteOrder::Little),
        s if s.swap_bytes() == SIGNATURE || s.swap_bytes() == ALT_SIGNATURE => {
            Some(ByteOrder::Big)
        }
        _ => None,
    };

    let mut values = [0u32; 4];
    match order {
        Some(order) => {
            trace!(?order, "container signature recognized");
            for (i, spec) in FIELDS.iter().enumerate() {
                let value = order.read_u32(word(buf, i + 1));
                values[i] = if in_range(value, spec.max) {
                    value
                } else {
                    warn!(
                        field = spec.name,
                        value,
                        default = spec.default,
                        "header field out of range, using default"
                    );
                    spec.default
                };
            }
        }
        None => {
            warn!("unknown container signature {signature:#010x}, attempting recovery");
            let mut recovered = 0;
            for (i, spec) in FIELDS.iter().enumerate() {
                let value = u32::from_le_bytes(word(buf, i + 1));
                values[i] = if in_range(value, spec.max) {
                    recovered += 1;
                    value
                } else if in_range(value.swap_bytes(), spec.max) {
                    recovered += 1;
                    debug!(field = spec.name, value, "recovered byte-swapped header field");
                    value.swap_bytes()
                } else {
                    spec.default
                };
            }
            if recovered == 0 {
                return Err(HeaderError::UnrecognizedSignature(signature));
            }
        }
    }

    Ok(ContainerHeader {
        signature,
        width: values[0],
        height: values[1],
        frame_count: values[2],
        fps: values[3],
        shape: ContainerShape::Framed,
        byte_order: order.unwrap_or(ByteOrder::Little),
    })
}

/// A bare JPEG plays as a one-frame video. This path never fails.
fn parse_bare_jpeg(buf: &[u8]) -> ContainerHeader {
    let (width, height) = match jpeg_dimensions(buf) {
        Some((w, h)) if in_range(w, MAX_DIMENSION) && in_range(h, MAX_DIMENSION) => (w, h),
        Some((w, h)) => {
            warn!(width = w, height = h, "JPEG dimensions out of range, using default");
            (DEFAULT_WIDTH, DEFAULT_HEIGHT)
        }
        None => {
            debug!(available = buf.len(), "no SOF marker found, using default resolution");
            (DEFAULT_WIDTH, DEFAULT_HEIGHT)
        }
    };

    ContainerHeader {
        signature: JPEG_SIGNATURE,
        width,
        height,
        frame_count: 1,
        fps: DEFAULT_FPS,
        shape: ContainerShape::RawJpeg,
        byte_order: ByteOrder::Big,
    }
}

fn is_start_of_frame(marker: u8) -> bool {
    // DHT, JPG and DAC share the SOF range but carry no dimensions
    (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

fn be16(buf: &[u8], at: usize) -> u32 {
    u32::from(u16::from_be_bytes([buf[at], buf[at + 1]]))
}

/// Walk the marker segments of a JPEG and return `(width, height)` from its
/// Start-Of-Frame segment, if one is present within `buf`.
pub fn jpeg_dimensions(buf: &[u8]) -> Option<(u32, u32)> {
    if !buf.starts_with(&SOI) {
        return None;
    }

    let mut i = 2;
    while i + 1 < buf.len() {
        if buf[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = buf[i + 1];
        match marker {
            // fill byte
            0xFF => {
                i += 1;
                continue;
            }
            // standalone markers
            0x00 | 0x01 | 0xD0..=0xD8 => {
                i += 2;
                continue;
            }
            // end of image or start of scan before any SOF
            0xD9 | 0xDA => return None,
            _ => {}
        }

        if i + 4 > buf.len() {
            return None;
        }
        let segment_len = be16(buf, i + 2) as usize;
        if segment_len < 2 {
            return None;
        }

        if is_start_of_frame(marker) {
            // length(2) precision(1) height(2) width(2)
            if i + 9 > buf.len() {
                return None;
            }
            let height = be16(buf, i + 5);
            let width = be16(buf, i + 7);
            return Some((width, height));
        }

        i += 2 + segment_len;
    }
    None
}
