//! HTTP streaming transport backed by `reqwest` on a tokio task.

use std::time::Duration;

use flume::Sender;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{Link, SharedLinkStats, StreamEvent, Transport};
use crate::error::TransportError;

/// Opens `GET` requests and streams the body into a [`Link`].
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    queue_depth: usize,
    handle: Option<Handle>,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, queue_depth: usize) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| TransportError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            queue_depth: queue_depth.max(1),
            handle: None,
        })
    }

    /// Spawn delivery tasks on `handle` instead of the ambient runtime.
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    fn runtime(&self) -> Result<Handle, TransportError> {
        match &self.handle {
            Some(handle) => Ok(handle.clone()),
            None => Handle::try_current()
                .map_err(|_| TransportError::Unavailable("no tokio runtime".into())),
        }
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &str) -> Result<Link, TransportError> {
        let runtime = self.runtime()?;
        let (tx, rx) = flume::bounded(self.queue_depth);
        let stats = SharedLinkStats::default();

        let task = runtime.spawn(deliver(
            self.client.clone(),
            url.to_string(),
            tx,
            stats.clone(),
        ));
        Ok(Link::new(rx, stats).with_abort(task.abort_handle()))
    }
}

async fn deliver(
    client: reqwest::Client,
    url: String,
    tx: Sender<StreamEvent>,
    stats: SharedLinkStats,
) {
    let outcome = stream_body(&client, &url, &tx, &stats).await;
    let last = match outcome {
        Ok(()) => {
            info!(%url, bytes = stats.bytes_received(), "stream body complete");
            StreamEvent::Finished
        }
        Err(err) => {
            warn!(%url, error = %err, "stream delivery failed");
            StreamEvent::Failed(err)
        }
    };
    // The link may already be gone; nothing left to notify.
    let _ = tx.send_async(last).await;
}

async fn stream_body(
    client: &reqwest::Client,
    url: &str,
    tx: &Sender<StreamEvent>,
    stats: &SharedLinkStats,
) -> Result<(), TransportError> {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|err| TransportError::Connect(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }

    let content_length = response.content_length();
    debug!(url, ?content_length, "stream connected");
    if tx.send_async(StreamEvent::Connected { content_length }).await.is_err() {
        return Ok(());
    }

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| TransportError::Read(err.to_string()))?
    {
        stats.record(chunk.len());
        if tx.send_async(StreamEvent::Data(chunk)).await.is_err() {
            debug!(url, "link dropped, stopping delivery");
            return Ok(());
        }
    }
    Ok(())
}
