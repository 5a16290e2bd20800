//! The video player component: `init()` once, then `step(now_ms)` on every
//! host tick.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{ClockState, PlaybackClock};
use crate::compositor;
use crate::container::{self, ContainerHeader, ContainerShape};
use crate::decode::{FrameDecoder, JpegDecode, ScalingJpegDecoder};
use crate::demux::{self, Demuxed, FrameSpan, LengthPrefixed, MarkerScanner, SkipReason};
use crate::display::DisplaySurface;
use crate::error::{ConfigError, HeaderError, PlayerError, Result, SourceError};
use crate::memory::TieredAllocator;
use crate::source::{ByteSource, ChunkFeed, FileChunks, FileSource, StreamBuffer, StreamSource};
use crate::transport::Transport;
use crate::{Config, SourceConfig};

/// Settings the host may change while playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSettings {
    pub looping: bool,
    /// 0 follows the video's fps.
    pub update_interval_ms: u32,
}

/// Cumulative playback counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub frames_drawn: u64,
    pub frames_skipped: u64,
    pub decode_failures: u64,
    pub loops: u64,
    pub reconnects: u64,
    pub bytes_received: u64,
}

/// What a single `step` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Interval not elapsed, or `init` not called yet.
    NotDue,
    /// Waiting for a source connection or for more stream data.
    Waiting,
    Drawn { frame_index: u32, wrapped: bool },
    Skipped(SkipReason),
    /// The frame could not be decoded or its payload not read; the last
    /// presented frame stays on screen.
    FrameDropped,
    Stopped,
    Disabled,
}

enum Pipeline {
    Framed {
        source: Box<dyn ByteSource>,
        demux: LengthPrefixed,
    },
    Raw {
        source: StreamSource,
        demux: MarkerScanner,
    },
}

impl Pipeline {
    fn next_frame(&mut self) -> Result<Demuxed, SourceError> {
        match self {
            Pipeline::Framed { source, demux } => demux.next_frame(source.as_mut()),
            Pipeline::Raw { source, demux } => demux.next_frame(source),
        }
    }

    fn source(&mut self) -> &mut dyn ByteSource {
        match self {
            Pipeline::Framed { source, .. } => source.as_mut(),
            Pipeline::Raw { source, .. } => source,
        }
    }

    fn bytes_received(&self) -> u64 {
        match self {
            Pipeline::Framed { source, .. } => source.bytes_received(),
            Pipeline::Raw { source, .. } => source.bytes_received(),
        }
    }
}

struct Connecting {
    source: StreamSource,
    since_ms: u32,
}

pub struct VideoPlayer<S, D = ScalingJpegDecoder> {
    config: Config,
    source_config: SourceConfig,
    display: S,
    transport: Option<Box<dyn Transport>>,
    allocator: TieredAllocator,
    decoder: FrameDecoder<D>,
    clock: PlaybackClock,
    settings: Arc<ArcSwap<PlaybackSettings>>,
    applied: PlaybackSettings,
    header: Option<ContainerHeader>,
    pipeline: Option<Pipeline>,
    connecting: Option<Connecting>,
    stats: PlaybackStats,
    closed_bytes: u64,
}

impl<S: DisplaySurface> VideoPlayer<S, ScalingJpegDecoder> {
    pub fn new(config: Config, display: S) -> Result<Self> {
        let jpeg = ScalingJpegDecoder::new(config.memory.ceiling_bytes);
        Self::with_decoder(config, display, jpeg)
    }
}

impl<S: DisplaySurface, D: JpegDecode> VideoPlayer<S, D> {
    /// Build a player around a custom JPEG decoder.
    pub fn with_decoder(config: Config, display: S, jpeg: D) -> Result<Self> {
        config.validate()?;
        let source_config = config.source()?;
        let settings = PlaybackSettings {
            looping: config.player.looping,
            update_interval_ms: config.player.update_interval_ms,
        };
        let allocator = config.memory.allocator();
        let decoder =
            FrameDecoder::with_decoder(jpeg, allocator.clone(), config.player.max_pixel_bytes);

        Ok(Self {
            allocator,
            clock: PlaybackClock::new(0, settings.looping, config.player.retry_interval_ms),
            config,
            source_config,
            display,
            transport: None,
            decoder,
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            applied: settings,
            header: None,
            pipeline: None,
            connecting: None,
            stats: PlaybackStats::default(),
            closed_bytes: 0,
        })
    }

    /// Transport used for URL sources.
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Shared handle for changing loop and interval between ticks.
    pub fn settings(&self) -> Arc<ArcSwap<PlaybackSettings>> {
        Arc::clone(&self.settings)
    }

    pub fn state(&self) -> ClockState {
        self.clock.state()
    }

    pub fn header(&self) -> Option<&ContainerHeader> {
        self.header.as_ref()
    }

    pub fn display(&self) -> &S {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut S {
        &mut self.display
    }

    pub fn frame_interval_ms(&self) -> u32 {
        self.clock.playback().target_interval_ms
    }

    pub fn stats(&self) -> PlaybackStats {
        let live = self.pipeline.as_ref().map_or(0, Pipeline::bytes_received);
        PlaybackStats {
            loops: self.clock.loops() as u64 + self.stats.loops,
            bytes_received: self.closed_bytes + live,
            ..self.stats
        }
    }

    /// Validate the display and open the source. File problems disable the
    /// player; stream problems are retried from `step`.
    #[instrument(skip(self), fields(source = %self.source_config))]
    pub fn init(&mut self, now_ms: u32) -> Result<()> {
        if self.display.width() == 0 || self.display.height() == 0 {
            error!("display has no pixels");
            self.clock.fail();
            return Err(PlayerError::MissingDisplay);
        }

        match self.source_config.clone() {
            SourceConfig::File(path) => match self.open_file(&path) {
                Ok(()) => {
                    self.clock.source_ready(now_ms);
                    self.dump_info();
                    Ok(())
                }
                Err(err) => {
                    error!(error = %err, path = %path.display(), "cannot play file");
                    self.clock.fail();
                    Err(err)
                }
            },
            SourceConfig::Url(_) => {
                if self.transport.is_none() {
                    self.clock.fail();
                    let err = ConfigError::Invalid("stream source needs a transport".into());
                    return Err(err.into());
                }
                self.clock.await_source(now_ms);
                self.connect(now_ms);
                Ok(())
            }
        }
    }

    fn open_file(&mut self, path: &std::path::Path) -> Result<()> {
        let mut file = FileSource::open(path, self.allocator.clone())?;
        let region = file.read_header_region()?;
        let header = container::parse(&region)?;

        let pipeline = match header.shape {
            ContainerShape::Framed => {
                file.set_data_start(header.data_start());
                file.set_loop(self.applied.looping);
                Pipeline::Framed {
                    source: Box::new(file),
                    demux: LengthPrefixed::new(
                        header.byte_order,
                        self.config.player.max_frame_bytes,
                    ),
                }
            }
            ContainerShape::RawJpeg => {
                drop(file);
                let chunks = FileChunks::open(path, self.config.player.file_chunk_bytes)?;
                let feed = ChunkFeed::File(chunks);
                let buffer = StreamBuffer::allocate(
                    &self.allocator,
                    self.config.memory.stream_buffer_bytes,
                )?;
                let mut source = StreamSource::new(buffer, feed);
                source.set_loop(self.applied.looping);
                Pipeline::Raw {
                    source,
                    demux: MarkerScanner::new(self.config.player.max_frame_bytes as usize),
                }
            }
        };

        self.install(header, pipeline);
        Ok(())
    }

    fn install(&mut self, header: ContainerHeader, pipeline: Pipeline) {
        self.clock
            .set_interval(header.resolve_interval(self.applied.update_interval_ms));
        self.header = Some(header);
        self.pipeline = Some(pipeline);
    }

    /// Log what is about to play.
    pub fn dump_info(&self) {
        match &self.header {
            Some(header) => info!(
                source = %self.source_config,
                width = header.width,
                height = header.height,
                frame_count = header.frame_count,
                fps = header.fps,
                shape = ?header.shape,
                interval_ms = self.clock.playback().target_interval_ms,
                looping = self.applied.looping,
                display_width = self.display.width(),
                display_height = self.display.height(),
                "video info"
            ),
            None => info!(
                source = %self.source_config,
                state = ?self.clock.state(),
                "video info: no header yet"
            ),
        }
    }

    /// Run one host tick.
    pub fn step(&mut self, now_ms: u32) -> Result<StepOutcome> {
        self.apply_settings();

        match self.clock.state() {
            ClockState::Uninitialized => Ok(StepOutcome::NotDue),
            ClockState::Failed => Ok(StepOutcome::Disabled),
            ClockState::Stopped => Ok(StepOutcome::Stopped),
            ClockState::AwaitingSource => {
                self.poll_connection(now_ms);
                Ok(StepOutcome::Waiting)
            }
            ClockState::Ready | ClockState::Playing | ClockState::EndOfStream => {
                if !self.clock.admit(now_ms) {
                    return Ok(StepOutcome::NotDue);
                }
                self.play_frame(now_ms)
            }
        }
    }

    fn apply_settings(&mut self) {
        let wanted = **self.settings.load();
        if wanted == self.applied {
            return;
        }
        debug!(?wanted, "playback settings changed");
        self.applied = wanted;
        self.clock.set_looping(wanted.looping);
        if let Some(header) = &self.header {
            self.clock
                .set_interval(header.resolve_interval(wanted.update_interval_ms));
        }
        if let Some(pipeline) = &mut self.pipeline {
            pipeline.source().set_loop(wanted.looping);
        }
        if let Some(connecting) = &mut self.connecting {
            connecting.source.set_loop(wanted.looping);
        }
    }

    fn play_frame(&mut self, now_ms: u32) -> Result<StepOutcome> {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(StepOutcome::Waiting);
        };

        let demuxed = match pipeline.next_frame() {
            Ok(demuxed) => demuxed,
            Err(err) => return self.source_fault(err, now_ms),
        };

        match demuxed {
            Demuxed::Frame { span, wrapped } => self.draw(span, wrapped),
            Demuxed::Pending => Ok(StepOutcome::Waiting),
            Demuxed::Skipped(reason) => {
                self.stats.frames_skipped += 1;
                metrics::counter!("frames_skipped").increment(1);
                Ok(StepOutcome::Skipped(reason))
            }
            Demuxed::Exhausted => {
                let state = self.clock.end_of_stream();
                if state == ClockState::Stopped {
                    Ok(StepOutcome::Stopped)
                } else {
                    Ok(StepOutcome::Waiting)
                }
            }
        }
    }

    fn draw(&mut self, span: FrameSpan, wrapped: bool) -> Result<StepOutcome> {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(StepOutcome::Waiting);
        };
        let header_dims = self
            .header
            .as_ref()
            .map_or((container::DEFAULT_WIDTH, container::DEFAULT_HEIGHT), |h| (h.width, h.height));
        let display_dims = (self.display.width(), self.display.height());

        let decoded = {
            let source = pipeline.source();
            match source.payload_at(span.offset, span.len) {
                Ok(payload) => Some(self.decoder.decode(&payload, header_dims, display_dims)),
                Err(err) => {
                    warn!(
                        error = %err,
                        offset = span.offset,
                        len = span.len,
                        "cannot read frame payload"
                    );
                    None
                }
            }
        };
        demux::commit(pipeline.source(), &span);

        let pixels = match decoded {
            Some(Ok(pixels)) => pixels,
            Some(Err(_)) => {
                self.stats.decode_failures += 1;
                self.clock.frame_shown(wrapped);
                return Ok(StepOutcome::FrameDropped);
            }
            None => {
                self.stats.frames_skipped += 1;
                metrics::counter!("frames_skipped").increment(1);
                self.clock.frame_shown(wrapped);
                return Ok(StepOutcome::FrameDropped);
            }
        };

        compositor::present_frame(&mut self.display, &pixels)?;
        self.clock.frame_shown(wrapped);
        self.stats.frames_drawn += 1;
        metrics::counter!("frames_drawn").increment(1);

        let frame_index = self.clock.playback().current_frame_index;
        debug!(frame_index, wrapped, ts = ?span.timestamp_ms, "frame presented");
        Ok(StepOutcome::Drawn { frame_index, wrapped })
    }

    fn source_fault(&mut self, err: SourceError, now_ms: u32) -> Result<StepOutcome> {
        let streaming = matches!(self.source_config, SourceConfig::Url(_));
        if !(streaming && err.is_transient()) {
            warn!(error = %err, "frame read failed");
            self.stats.frames_skipped += 1;
            metrics::counter!("frames_skipped").increment(1);
            return Ok(StepOutcome::FrameDropped);
        }

        self.drop_pipeline();
        self.stats.reconnects += 1;
        if matches!(err, SourceError::OriginDiscarded) {
            info!("stream ended, reconnecting to loop");
            self.stats.loops += 1;
            self.clock.await_source(now_ms);
            self.connect(now_ms);
        } else {
            warn!(error = %err, "stream lost, retrying");
            self.clock.await_source(now_ms);
        }
        Ok(StepOutcome::Waiting)
    }

    fn drop_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            self.closed_bytes += pipeline.bytes_received();
        }
    }

    /// Open a new link and stream buffer. Failures leave the player waiting
    /// for the next retry.
    fn connect(&mut self, now_ms: u32) {
        let SourceConfig::Url(url) = &self.source_config else {
            return;
        };
        let Some(transport) = &self.transport else {
            return;
        };
        self.clock.mark_attempt(now_ms);

        let link = match transport.open(url) {
            Ok(link) => link,
            Err(err) => {
                warn!(error = %err, %url, "cannot open stream");
                return;
            }
        };
        let capacity = self.config.memory.stream_buffer_bytes;
        let buffer = match StreamBuffer::allocate(&self.allocator, capacity) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!(error = %err, "cannot allocate stream buffer");
                return;
            }
        };

        let mut source = StreamSource::new(buffer, ChunkFeed::Link(link));
        source.set_loop(self.applied.looping);
        info!(%url, "stream connecting");
        self.connecting = Some(Connecting {
            source,
            since_ms: now_ms,
        });
    }

    fn poll_connection(&mut self, now_ms: u32) {
        let Some(mut connecting) = self.connecting.take() else {
            if self.clock.retry_due(now_ms) {
                self.connect(now_ms);
            }
            return;
        };

        if let Err(err) = connecting.source.pump() {
            warn!(error = %err, "stream failed before header");
            self.retry_later(connecting, now_ms);
            return;
        }

        if connecting.source.header_ready() {
            let region = match connecting.source.read_header_region() {
                Ok(region) => region,
                Err(err) => {
                    warn!(error = %err, "cannot read stream header");
                    self.retry_later(connecting, now_ms);
                    return;
                }
            };
            match container::parse(&region) {
                Ok(header) => self.start_stream(connecting.source, header, now_ms),
                Err(HeaderError::InsufficientData { available, .. }) => {
                    warn!(available, "stream ended before a full header");
                    self.retry_later(connecting, now_ms);
                }
                Err(err) => {
                    warn!(error = %err, "unusable stream header");
                    self.retry_later(connecting, now_ms);
                }
            }
            return;
        }

        if connecting.source.feed_done() {
            warn!("stream closed before a header arrived");
            self.retry_later(connecting, now_ms);
        } else if now_ms.wrapping_sub(connecting.since_ms)
            >= self.config.player.connect_timeout_ms
        {
            warn!(
                timeout_ms = self.config.player.connect_timeout_ms,
                "no header within timeout"
            );
            self.retry_later(connecting, now_ms);
        } else {
            self.connecting = Some(connecting);
        }
    }

    fn retry_later(&mut self, connecting: Connecting, now_ms: u32) {
        self.closed_bytes += connecting.source.bytes_received();
        self.clock.await_source(now_ms);
    }

    fn start_stream(&mut self, mut source: StreamSource, header: ContainerHeader, now_ms: u32) {
        source.set_data_start(header.data_start());
        let pipeline = match header.shape {
            ContainerShape::Framed => Pipeline::Framed {
                source: Box::new(source),
                demux: LengthPrefixed::new(header.byte_order, self.config.player.max_frame_bytes),
            },
            ContainerShape::RawJpeg => Pipeline::Raw {
                source,
                demux: MarkerScanner::new(self.config.player.max_frame_bytes as usize),
            },
        };
        self.install(header, pipeline);
        self.clock.source_ready(now_ms);
        self.dump_info();
    }
}
