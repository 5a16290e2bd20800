pub mod clock;
pub mod compositor;
pub mod container;
pub mod decode;
pub mod demux;
pub mod display;
pub mod error;
pub mod memory;
pub mod player;
pub mod source;
pub mod transport;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::container::MAX_FRAME_BYTES;
use crate::decode::DEFAULT_MAX_PIXEL_BYTES;
use crate::error::ConfigError;
use crate::memory::{TierConfig, TieredAllocator};
use crate::source::stream::{DEFAULT_BUFFER_BYTES, MAX_BUFFER_BYTES, MIN_BUFFER_BYTES};
use crate::transport::DEFAULT_QUEUE_DEPTH;

pub use player::{PlaybackSettings, PlaybackStats, StepOutcome, VideoPlayer};

/// Prefix for environment overrides, e.g. `KINESCOPE__PLAYER__URL`.
pub const ENV_PREFIX: &str = "KINESCOPE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub player: PlayerConfig,
    pub display: DisplayConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Local container or raw MJPEG file.
    pub path: Option<PathBuf>,
    /// Live stream URL.
    pub url: Option<String>,
    /// Milliseconds between frames; 0 follows the video's fps.
    pub update_interval_ms: u32,
    pub looping: bool,
    pub max_frame_bytes: u32,
    /// Budget for one decoded frame in RGB565.
    pub max_pixel_bytes: usize,
    pub retry_interval_ms: u32,
    pub connect_timeout_ms: u32,
    /// Chunks buffered between network delivery and the tick.
    pub queue_depth: usize,
    /// Read size when a raw file is fed through the stream path.
    pub file_chunk_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Window magnification for the desktop player.
    pub zoom: u32,
    pub headless: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Tried in order; a tier without a budget is the unbounded heap.
    pub tiers: Vec<TierConfig>,
    /// Hard ceiling on any single allocation.
    pub ceiling_bytes: usize,
    pub stream_buffer_bytes: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            path: None,
            url: None,
            update_interval_ms: 0,
            looping: true,
            max_frame_bytes: MAX_FRAME_BYTES,
            max_pixel_bytes: DEFAULT_MAX_PIXEL_BYTES,
            retry_interval_ms: 5_000,
            connect_timeout_ms: 10_000,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            file_chunk_bytes: 16 * 1024,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            zoom: 2,
            headless: false,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierConfig {
                    name: "internal".into(),
                    budget_bytes: Some(512 * 1024),
                },
                TierConfig {
                    name: "external".into(),
                    budget_bytes: None,
                },
            ],
            ceiling_bytes: 4 * 1024 * 1024,
            stream_buffer_bytes: DEFAULT_BUFFER_BYTES,
        }
    }
}

impl MemoryConfig {
    pub fn allocator(&self) -> TieredAllocator {
        TieredAllocator::from_config(&self.tiers, self.ceiling_bytes)
    }
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    File(PathBuf),
    Url(String),
}

impl std::fmt::Display for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceConfig::File(path) => write!(f, "file {}", path.display()),
            SourceConfig::Url(url) => write!(f, "stream {url}"),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `KINESCOPE__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source()?;
        let buffer = self.memory.stream_buffer_bytes;
        if !(MIN_BUFFER_BYTES..=MAX_BUFFER_BYTES).contains(&buffer) {
            return Err(ConfigError::Invalid(format!(
                "stream buffer of {buffer} bytes is outside {MIN_BUFFER_BYTES}..={MAX_BUFFER_BYTES}"
            )));
        }
        if self.player.max_frame_bytes == 0 || self.player.max_frame_bytes > MAX_FRAME_BYTES {
            return Err(ConfigError::Invalid(format!(
                "max_frame_bytes must be in 1..={MAX_FRAME_BYTES}"
            )));
        }
        if self.memory.tiers.is_empty() {
            return Err(ConfigError::Invalid("at least one memory tier is required".into()));
        }
        Ok(())
    }

    pub fn source(&self) -> Result<SourceConfig, ConfigError> {
        match (&self.player.path, &self.player.url) {
            (Some(path), None) => Ok(SourceConfig::File(path.clone())),
            (None, Some(url)) if !url.is_empty() => Ok(SourceConfig::Url(url.clone())),
            _ => Err(ConfigError::AmbiguousSource),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!((config.display.width, config.display.height), (320, 240));
        assert!(config.player.looping);
        assert_eq!(config.player.update_interval_ms, 0);
        assert_eq!(config.player.retry_interval_ms, 5_000);
        assert_eq!(config.player.connect_timeout_ms, 10_000);
        assert_eq!(config.memory.stream_buffer_bytes, 256 * 1024);
    }

    #[test]
    fn source_must_be_exactly_one() {
        let mut config = Config::default();
        assert!(matches!(config.source(), Err(ConfigError::AmbiguousSource)));

        config.player.path = Some("video.mjpg".into());
        assert_eq!(config.source().unwrap(), SourceConfig::File("video.mjpg".into()));

        config.player.url = Some("http://camera/stream".into());
        assert!(matches!(config.source(), Err(ConfigError::AmbiguousSource)));
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[player]\nurl = \"http://camera/stream\"\nlooping = false\n\n\
             [display]\nwidth = 128\nheight = 64"
        )
        .unwrap();
        file.flush().unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.source().unwrap(), SourceConfig::Url("http://camera/stream".into()));
        assert!(!config.player.looping);
        assert_eq!((config.display.width, config.display.height), (128, 64));
        assert_eq!(config.memory.tiers.len(), 2);
    }

    #[test]
    fn rejects_out_of_range_buffer() {
        let mut config = Config::default();
        config.player.path = Some("video.mjpg".into());
        config.memory.stream_buffer_bytes = 1024;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
