//! Push-style transport for hosts that receive network data in their own
//! callbacks.
//!
//! The host keeps a [`ChunkPusher`] and calls [`ChunkPusher::push`] from its
//! delivery callback; the player holds the matching [`Link`]. The only lock
//! in the crate guards the current sender so a reconnect can swap it while
//! a callback is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use flume::{Sender, TrySendError};
use tracing::debug;

use super::{Link, SharedLinkStats, StreamEvent, Transport};
use crate::error::TransportError;

struct Endpoint {
    tx: Sender<StreamEvent>,
    stats: SharedLinkStats,
}

#[derive(Default)]
struct Shared {
    endpoint: Mutex<Option<Endpoint>>,
    available: AtomicBool,
    last_url: Mutex<Option<String>>,
}

impl Shared {
    fn endpoint(&self) -> MutexGuard<'_, Option<Endpoint>> {
        self.endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A [`Transport`] whose data is pushed in by the host.
pub struct ChannelTransport {
    shared: Arc<Shared>,
    queue_depth: usize,
}

/// Host-side handle feeding the currently open link.
#[derive(Clone)]
pub struct ChunkPusher {
    shared: Arc<Shared>,
}

/// Why a push was not delivered.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The queue is full; the chunk is handed back so the host can retry.
    #[error("link queue full")]
    Full(Bytes),
    /// No link is open, or the player dropped it.
    #[error("no open link")]
    Closed,
}

impl ChannelTransport {
    pub fn new(queue_depth: usize) -> (Self, ChunkPusher) {
        let shared = Arc::new(Shared {
            available: AtomicBool::new(true),
            ..Shared::default()
        });
        (
            Self {
                shared: Arc::clone(&shared),
                queue_depth: queue_depth.max(1),
            },
            ChunkPusher { shared },
        )
    }
}

impl Transport for ChannelTransport {
    fn open(&self, url: &str) -> Result<Link, TransportError> {
        if !self.shared.available.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable("network not ready".into()));
        }

        let (tx, rx) = flume::bounded(self.queue_depth);
        let stats = SharedLinkStats::default();
        *self.shared.endpoint() = Some(Endpoint {
            tx,
            stats: Arc::clone(&stats),
        });
        *self
            .shared
            .last_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(url.to_string());
        debug!(url, "channel link opened");
        Ok(Link::new(rx, stats))
    }
}

impl ChunkPusher {
    /// Mark the network as up or down. While down, `open` fails with
    /// [`TransportError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Release);
    }

    /// URL of the most recent `open`.
    pub fn last_url(&self) -> Option<String> {
        self.shared
            .last_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .endpoint()
            .as_ref()
            .is_some_and(|endpoint| !endpoint.tx.is_disconnected())
    }

    pub fn connected(&self, content_length: Option<u64>) -> Result<(), PushError> {
        self.send(StreamEvent::Connected { content_length })
    }

    pub fn push(&self, chunk: impl Into<Bytes>) -> Result<(), PushError> {
        let chunk = chunk.into();
        let guard = self.shared.endpoint();
        let endpoint = guard.as_ref().ok_or(PushError::Closed)?;
        let len = chunk.len();
        match endpoint.tx.try_send(StreamEvent::Data(chunk)) {
            Ok(()) => {
                endpoint.stats.record(len);
                Ok(())
            }
            Err(TrySendError::Full(StreamEvent::Data(chunk))) => Err(PushError::Full(chunk)),
            Err(_) => Err(PushError::Closed),
        }
    }

    pub fn finish(&self) -> Result<(), PushError> {
        self.send(StreamEvent::Finished)
    }

    pub fn fail(&self, error: TransportError) -> Result<(), PushError> {
        self.send(StreamEvent::Failed(error))
    }

    fn send(&self, event: StreamEvent) -> Result<(), PushError> {
        let guard = self.shared.endpoint();
        let endpoint = guard.as_ref().ok_or(PushError::Closed)?;
        endpoint.tx.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => PushError::Full(Bytes::new()),
            TrySendError::Disconnected(_) => PushError::Closed,
        })
    }
}
