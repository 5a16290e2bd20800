//! Pack a directory of still images into a motion-JPEG container.
//!
//! Usage: `mjpg-pack <input-dir> <output.mjpg> [width] [height] [fps]`
//!
//! Images are taken in file-name order, resized to the container size and
//! re-encoded as baseline JPEG.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use kinescope::container::{
    ContainerWriter, DEFAULT_FPS, DEFAULT_HEIGHT, DEFAULT_WIDTH, MAX_DIMENSION, MAX_FPS,
    MAX_FRAME_BYTES, MAX_FRAME_COUNT,
};

const JPEG_QUALITY: u8 = 80;

struct Args {
    input: PathBuf,
    output: PathBuf,
    width: u32,
    height: u32,
    fps: u32,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args_os().skip(1);
    let (Some(input), Some(output)) = (args.next(), args.next()) else {
        bail!("usage: mjpg-pack <input-dir> <output.mjpg> [width] [height] [fps]");
    };
    let mut number = |name: &str, default: u32, max: u32| -> Result<u32> {
        let Some(raw) = args.next() else {
            return Ok(default);
        };
        let value: u32 = raw
            .to_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| eyre!("{name} must be a number"))?;
        if value == 0 || value > max {
            bail!("{name} must be in 1..={max}");
        }
        Ok(value)
    };
    Ok(Args {
        input: input.into(),
        output: output.into(),
        width: number("width", DEFAULT_WIDTH, MAX_DIMENSION)?,
        height: number("height", DEFAULT_HEIGHT, MAX_DIMENSION)?,
        fps: number("fps", DEFAULT_FPS, MAX_FPS)?,
    })
}

fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).wrap_err_with(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let known = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            .unwrap_or(false);
        if known {
            images.push(path);
        } else {
            debug!(path = %path.display(), "skipping non-image file");
        }
    }
    images.sort();
    if images.len() > MAX_FRAME_COUNT as usize {
        warn!(found = images.len(), kept = MAX_FRAME_COUNT, "too many images, truncating");
        images.truncate(MAX_FRAME_COUNT as usize);
    }
    Ok(images)
}

fn encode_frame(path: &Path, width: u32, height: u32) -> Result<Vec<u8>> {
    let image = image::open(path).wrap_err_with(|| format!("decoding {}", path.display()))?;
    let frame = image.resize_exact(width, height, FilterType::Triangle).to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(&frame)?;
    Ok(jpeg)
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let images = collect_images(&args.input)?;
    if images.is_empty() {
        bail!("no JPEG or PNG images in {}", args.input.display());
    }

    let out = File::create(&args.output)
        .wrap_err_with(|| format!("creating {}", args.output.display()))?;
    let mut writer = ContainerWriter::new(
        BufWriter::new(out),
        args.width,
        args.height,
        images.len() as u32,
        args.fps,
    )?;

    let mut total = 0usize;
    for path in &images {
        let jpeg = encode_frame(path, args.width, args.height)?;
        if jpeg.len() > MAX_FRAME_BYTES as usize {
            bail!("{} encodes to {} bytes, above the frame limit", path.display(), jpeg.len());
        }
        total += jpeg.len();
        writer.write_frame(&jpeg)?;
        debug!(path = %path.display(), bytes = jpeg.len(), "packed frame");
    }
    let frames = writer.frames_written();
    writer.finish()?;

    info!(
        frames,
        bytes = total,
        width = args.width,
        height = args.height,
        fps = args.fps,
        output = %args.output.display(),
        "container written"
    );
    Ok(())
}
