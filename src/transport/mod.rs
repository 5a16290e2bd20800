//! Network transport boundary.
//!
//! A [`Transport`] opens a URL and returns a [`Link`]: the receiving end of a
//! bounded channel that the delivery context (a tokio task, or a host
//! callback via [`ChannelTransport`]) fills with [`StreamEvent`]s. The tick
//! only ever dequeues; nothing is shared by mutation across the boundary.

pub mod channel;
pub mod http;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use flume::{Receiver, TryRecvError};
use tracing::{debug, warn};

use crate::error::TransportError;

pub use channel::{ChannelTransport, ChunkPusher, PushError};
pub use http::HttpTransport;

/// Default number of chunks buffered between delivery and the tick.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Messages from the delivery context.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected { content_length: Option<u64> },
    Data(Bytes),
    Finished,
    Failed(TransportError),
}

/// Opens byte streams.
pub trait Transport {
    fn open(&self, url: &str) -> Result<Link, TransportError>;
}

/// Counters updated by the delivery context.
#[derive(Debug, Default)]
pub struct LinkStats {
    bytes_received: AtomicU64,
    chunks_received: AtomicU64,
}

impl LinkStats {
    pub fn record(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn chunks_received(&self) -> u64 {
        self.chunks_received.load(Ordering::Relaxed)
    }
}

pub type SharedLinkStats = Arc<CachePadded<LinkStats>>;

/// Connection lifecycle as observed by the tick.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Connecting,
    Streaming { content_length: Option<u64> },
    Finished,
    Failed(TransportError),
}

/// Receiving end of an open stream. Dropping it stops delivery.
pub struct Link {
    rx: Receiver<StreamEvent>,
    stats: SharedLinkStats,
    state: LinkState,
    abort: Option<tokio::task::AbortHandle>,
}

impl Link {
    pub fn new(rx: Receiver<StreamEvent>, stats: SharedLinkStats) -> Self {
        Self {
            rx,
            stats,
            state: LinkState::Connecting,
            abort: None,
        }
    }

    pub(crate) fn with_abort(mut self, abort: tokio::task::AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn stats(&self) -> &SharedLinkStats {
        &self.stats
    }

    /// Whether more data may still arrive.
    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            LinkState::Connecting | LinkState::Streaming { .. }
        )
    }

    /// Dequeue the next data chunk without blocking, applying any control
    /// events on the way.
    pub fn poll_chunk(&mut self) -> Option<Bytes> {
        while self.is_open() {
            match self.rx.try_recv() {
                Ok(StreamEvent::Data(chunk)) => {
                    if self.state == LinkState::Connecting {
                        self.state = LinkState::Streaming { content_length: None };
                    }
                    return Some(chunk);
                }
                Ok(StreamEvent::Connected { content_length }) => {
                    debug!(?content_length, "stream connected");
                    self.state = LinkState::Streaming { content_length };
                }
                Ok(StreamEvent::Finished) => {
                    debug!(bytes = self.stats.bytes_received(), "stream finished");
                    self.state = LinkState::Finished;
                }
                Ok(StreamEvent::Failed(err)) => {
                    warn!(error = %err, "stream failed");
                    self.state = LinkState::Failed(err);
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    debug!("delivery context went away");
                    self.state = LinkState::Finished;
                }
            }
        }
        None
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> (flume::Sender<StreamEvent>, Link) {
        let (tx, rx) = flume::bounded(4);
        (tx, Link::new(rx, SharedLinkStats::default()))
    }

    #[test]
    fn control_events_update_state() {
        let (tx, mut link) = link();
        tx.send(StreamEvent::Connected { content_length: Some(10) }).unwrap();
        tx.send(StreamEvent::Data(Bytes::from_static(b"abc"))).unwrap();
        tx.send(StreamEvent::Finished).unwrap();

        assert_eq!(link.poll_chunk().as_deref(), Some(&b"abc"[..]));
        assert_eq!(link.state(), &LinkState::Streaming { content_length: Some(10) });
        assert_eq!(link.poll_chunk(), None);
        assert_eq!(link.state(), &LinkState::Finished);
        assert!(!link.is_open());
    }

    #[test]
    fn dropped_sender_finishes_link() {
        let (tx, mut link) = link();
        drop(tx);
        assert_eq!(link.poll_chunk(), None);
        assert_eq!(link.state(), &LinkState::Finished);
    }

    #[test]
    fn failure_is_terminal() {
        let (tx, mut link) = link();
        tx.send(StreamEvent::Failed(TransportError::Status(503))).unwrap();
        tx.send(StreamEvent::Data(Bytes::from_static(b"late"))).unwrap();
        assert_eq!(link.poll_chunk(), None);
        assert!(matches!(link.state(), LinkState::Failed(TransportError::Status(503))));
    }
}
