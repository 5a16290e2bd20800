use tracing::{debug, warn};

use super::{Demuxed, FrameSpan, SkipReason};
use crate::container::{EOI, SOI};
use crate::error::SourceError;
use crate::source::{ByteSource, Fetch, StreamSource};

/// Refill/rewind rounds attempted within a single call.
const MAX_PASSES: usize = 4;

enum Scan {
    Found(FrameSpan),
    Skipped(SkipReason),
    NeedMore,
}

/// Demuxer for back-to-back JPEG images delimited by SOI/EOI markers.
///
/// Scanning state survives between calls, so a frame whose markers are
/// split across chunks is picked up once the rest arrives.
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    start: Option<u64>,
    scan_from: u64,
    max_frame_bytes: usize,
}

impl MarkerScanner {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            start: None,
            scan_from: 0,
            max_frame_bytes,
        }
    }

    pub fn reset(&mut self) {
        self.start = None;
        self.scan_from = 0;
    }

    pub fn next_frame(&mut self, source: &mut StreamSource) -> Result<Demuxed, SourceError> {
        let mut wrapped = false;

        for _ in 0..MAX_PASSES {
            source.pump()?;
            match self.scan(source) {
                Scan::Found(span) => return Ok(Demuxed::Frame { span, wrapped }),
                Scan::Skipped(reason) => return Ok(Demuxed::Skipped(reason)),
                Scan::NeedMore => {}
            }

            if source.is_stuck() {
                let capacity = source.buffer().capacity();
                let err = SourceError::CapacityExceeded {
                    chunk: capacity,
                    capacity,
                };
                warn!(error = %err, "partial frame fills the stream buffer, dropping it");
                self.drop_partial(source);
                return Ok(Demuxed::Skipped(SkipReason::ExceedsBuffer {
                    len: capacity,
                    capacity,
                }));
            }

            match source.end_of_data()? {
                Fetch::Exhausted => return Ok(Demuxed::Exhausted),
                Fetch::Rewound => {
                    debug!("marker scan wrapped to start of data");
                    self.start = None;
                    self.scan_from = source.position();
                    wrapped = true;
                }
                Fetch::Pending | Fetch::Ready(()) => {}
            }
        }

        Ok(Demuxed::Pending)
    }

    fn scan(&mut self, source: &mut StreamSource) -> Scan {
        let end = source.end();
        loop {
            let from = self.scan_from.max(source.position());
            let tail = source.tail(from);

            let Some(start) = self.start else {
                match find_marker(tail, &SOI) {
                    Some(i) => self.open_frame(source, from + i as u64),
                    None => {
                        // A trailing 0xFF may be the first half of a marker.
                        let keep = end.saturating_sub(1).max(from);
                        source.advance_to(keep);
                        self.scan_from = keep;
                        return Scan::NeedMore;
                    }
                }
                continue;
            };

            match find_any_marker(tail) {
                Some((i, marker)) if marker == EOI => {
                    let next = from + i as u64 + 2;
                    let len = (next - start) as usize;
                    self.start = None;
                    self.scan_from = next;
                    if len > self.max_frame_bytes {
                        warn!(
                            len,
                            max = self.max_frame_bytes,
                            "frame exceeds size limit, dropping"
                        );
                        source.advance_to(next);
                        return Scan::Skipped(SkipReason::Oversized(len));
                    }
                    return Scan::Found(FrameSpan {
                        offset: start,
                        len,
                        next,
                        timestamp_ms: None,
                    });
                }
                Some((i, _)) => {
                    debug!(abandoned = start, "newer SOI before EOI, restarting frame");
                    self.open_frame(source, from + i as u64);
                }
                None => {
                    self.scan_from = end.saturating_sub(1).max(start + 2);
                    let partial = (end - start) as usize;
                    if partial > self.max_frame_bytes {
                        warn!(
                            partial,
                            max = self.max_frame_bytes,
                            "partial frame exceeds size limit, dropping"
                        );
                        self.drop_partial(source);
                        return Scan::Skipped(SkipReason::Oversized(partial));
                    }
                    return Scan::NeedMore;
                }
            }
        }
    }

    fn open_frame(&mut self, source: &mut StreamSource, at: u64) {
        self.start = Some(at);
        self.scan_from = at + 2;
        source.advance_to(at);
    }

    fn drop_partial(&mut self, source: &mut StreamSource) {
        let keep = source.end().saturating_sub(1).max(source.position());
        self.start = None;
        self.scan_from = keep;
        source.advance_to(keep);
    }
}

fn find_marker(buf: &[u8], marker: &[u8; 2]) -> Option<usize> {
    buf.windows(2).position(|w| w == marker)
}

/// First SOI or EOI in `buf`.
fn find_any_marker(buf: &[u8]) -> Option<(usize, [u8; 2])> {
    buf.windows(2).enumerate().find_map(|(i, w)| {
        let pair = [w[0], w[1]];
        (pair == SOI || pair == EOI).then_some((i, pair))
    })
}
