use tracing::{debug, warn};

use super::{Demuxed, FrameSpan, SkipReason};
use crate::container::{ByteOrder, FRAME_HEADER_LEN};
use crate::error::SourceError;
use crate::source::{ByteSource, Fetch};

/// Demuxer for `size, timestamp, payload` frame records.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixed {
    order: ByteOrder,
    max_frame_bytes: u32,
}

impl LengthPrefixed {
    pub fn new(order: ByteOrder, max_frame_bytes: u32) -> Self {
        Self { order, max_frame_bytes }
    }

    pub fn next_frame(&self, source: &mut dyn ByteSource) -> Result<Demuxed, SourceError> {
        let mut wrapped = false;

        // A rewind restarts the read once; a second means the container
        // holds no complete frame at all.
        for _ in 0..2 {
            let pos = source.position();
            let header = match source.frame_header_at(pos, self.order)? {
                Fetch::Ready(header) => header,
                Fetch::Pending => return Ok(Demuxed::Pending),
                Fetch::Exhausted => return Ok(Demuxed::Exhausted),
                Fetch::Rewound => {
                    wrapped = true;
                    continue;
                }
            };

            let payload_pos = pos + FRAME_HEADER_LEN as u64;
            if !header.is_valid(self.max_frame_bytes) {
                warn!(pos, size = header.size, "invalid frame size, skipping frame header");
                source.advance_to(payload_pos);
                return Ok(Demuxed::Skipped(SkipReason::InvalidSize(header.size)));
            }

            let len = header.size as usize;
            if let Some(capacity) = source.max_payload() {
                if len + FRAME_HEADER_LEN > capacity {
                    warn!(pos, len, capacity, "frame larger than stream buffer, skipping");
                    source.advance_to(payload_pos + len as u64);
                    return Ok(Demuxed::Skipped(SkipReason::ExceedsBuffer { len, capacity }));
                }
            }

            match source.ensure(payload_pos, len)? {
                Fetch::Ready(()) => {
                    debug!(pos, len, timestamp_ms = header.timestamp_ms, "frame located");
                    let span = FrameSpan {
                        offset: payload_pos,
                        len,
                        next: payload_pos + len as u64,
                        timestamp_ms: Some(header.timestamp_ms),
                    };
                    return Ok(Demuxed::Frame { span, wrapped });
                }
                Fetch::Pending => return Ok(Demuxed::Pending),
                Fetch::Exhausted => {
                    debug!(pos, len, "truncated final frame");
                    return Ok(Demuxed::Exhausted);
                }
                Fetch::Rewound => wrapped = true,
            }
        }

        Ok(Demuxed::Pending)
    }
}
