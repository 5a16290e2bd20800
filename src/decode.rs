//! JPEG frame decoding into bounded RGB565 pixel buffers.

use std::time::Instant;

use jpeg_decoder::{CodingProcess, Decoder, ImageInfo, PixelFormat};
use tracing::{debug, warn};

use crate::container::jpeg_dimensions;
use crate::error::DecodeError;
use crate::memory::{Block, TieredAllocator};

/// Largest decoded frame kept in memory by default (256x256 RGB565).
pub const DEFAULT_MAX_PIXEL_BYTES: usize = 256 * 256 * 2;

const BYTES_PER_PIXEL: usize = 2;

/// Power-of-two reduction applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JpegScale {
    None,
    Half,
    Quarter,
    Eighth,
}

impl JpegScale {
    pub fn factor(self) -> u32 {
        match self {
            JpegScale::None => 1,
            JpegScale::Half => 2,
            JpegScale::Quarter => 4,
            JpegScale::Eighth => 8,
        }
    }

    /// Output dimensions for a `width` x `height` source, rounded up.
    pub fn apply(self, width: u32, height: u32) -> (u32, u32) {
        let f = self.factor();
        (width.div_ceil(f), height.div_ceil(f))
    }

    fn coarser(self) -> Option<Self> {
        match self {
            JpegScale::None => Some(JpegScale::Half),
            JpegScale::Half => Some(JpegScale::Quarter),
            JpegScale::Quarter => Some(JpegScale::Eighth),
            JpegScale::Eighth => None,
        }
    }
}

/// Halve the source when it is more than twice the display in either axis.
pub fn select_scale(source: (u32, u32), display: (u32, u32)) -> JpegScale {
    if source.0 > display.0.saturating_mul(2) || source.1 > display.1.saturating_mul(2) {
        JpegScale::Half
    } else {
        JpegScale::None
    }
}

/// Pack 8-bit RGB into RGB565.
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// Decoded frame in little-endian RGB565.
#[derive(Debug)]
pub struct PixelBuffer {
    block: Block,
    width: u32,
    height: u32,
}

impl PixelBuffer {
    pub fn allocate(
        allocator: &TieredAllocator,
        width: u32,
        height: u32,
    ) -> Result<Self, DecodeError> {
        let len = width as usize * height as usize * BYTES_PER_PIXEL;
        let block = allocator.allocate(len, "pixel buffer")?;
        Ok(Self { block, width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.block
    }

    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        let at = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        u16::from_le_bytes([self.block[at], self.block[at + 1]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: u16) {
        let at = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        self.block[at..at + BYTES_PER_PIXEL].copy_from_slice(&value.to_le_bytes());
    }
}

/// JPEG bit-decoding capability.
pub trait JpegDecode {
    /// Decode `jpeg` reduced by `scale` into `out`, whose dimensions must be
    /// exactly the scaled image size.
    fn decode(
        &mut self,
        jpeg: &[u8],
        scale: JpegScale,
        out: &mut PixelBuffer,
    ) -> Result<(), DecodeError>;
}

/// [`JpegDecode`] backed by `jpeg-decoder`.
///
/// Reduction happens in the IDCT, so a baseline frame is never held at full
/// size. Frames whose decode would need more than `max_working_bytes` are
/// refused before any sample buffer is allocated.
#[derive(Debug, Clone)]
pub struct ScalingJpegDecoder {
    max_working_bytes: usize,
}

impl ScalingJpegDecoder {
    pub fn new(max_working_bytes: usize) -> Self {
        Self { max_working_bytes }
    }

    /// Sample bytes held while producing an `out`-sized image.
    fn working_bytes(info: &ImageInfo, out: (u16, u16)) -> usize {
        let sample = info.pixel_format.pixel_bytes();
        let full = info.width as usize * info.height as usize * sample;
        let scaled = out.0 as usize * out.1 as usize * sample;
        match info.coding_process {
            // coefficients for every block stay resident until the last scan
            CodingProcess::DctProgressive => full * 2 + scaled * 2,
            CodingProcess::Lossless => full * 2,
            _ => scaled * 2,
        }
    }
}

fn jpeg_error(err: jpeg_decoder::Error) -> DecodeError {
    DecodeError::Jpeg(err.to_string())
}

impl JpegDecode for ScalingJpegDecoder {
    fn decode(
        &mut self,
        jpeg: &[u8],
        scale: JpegScale,
        out: &mut PixelBuffer,
    ) -> Result<(), DecodeError> {
        let mut decoder = Decoder::new(jpeg);
        decoder.read_info().map_err(jpeg_error)?;
        let info = decoder
            .info()
            .ok_or_else(|| DecodeError::Jpeg("missing frame header".into()))?;

        let requested = match (u16::try_from(out.width), u16::try_from(out.height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => {
                return Err(DecodeError::TooLarge {
                    width: out.width,
                    height: out.height,
                    budget: self.max_working_bytes,
                })
            }
        };
        if Self::working_bytes(&info, requested) > self.max_working_bytes {
            return Err(DecodeError::TooLarge {
                width: u32::from(info.width),
                height: u32::from(info.height),
                budget: self.max_working_bytes,
            });
        }

        let (width, height) = if scale == JpegScale::None {
            (info.width, info.height)
        } else {
            decoder.scale(requested.0, requested.1).map_err(jpeg_error)?
        };
        let samples = decoder.decode().map_err(jpeg_error)?;

        let (width, height) = (width as usize, height as usize);
        let channels = info.pixel_format.pixel_bytes();
        let expected = width * height * channels;
        if expected == 0 || samples.len() != expected {
            return Err(DecodeError::OutputMismatch {
                expected,
                actual: samples.len(),
            });
        }

        // The IDCT rounds reduced sizes up, so map output onto whatever came back.
        let (ow, oh) = (out.width as usize, out.height as usize);
        for y in 0..oh {
            let sy = y * height / oh;
            for x in 0..ow {
                let sx = x * width / ow;
                let at = (sy * width + sx) * channels;
                let value = match info.pixel_format {
                    // 16-bit samples are big-endian; keep the high byte
                    PixelFormat::L8 | PixelFormat::L16 => {
                        pack_rgb565(samples[at], samples[at], samples[at])
                    }
                    PixelFormat::CMYK32 => cmyk_to_rgb565(&samples[at..at + 4]),
                    _ => pack_rgb565(samples[at], samples[at + 1], samples[at + 2]),
                };
                out.set_pixel(x as u32, y as u32, value);
            }
        }
        Ok(())
    }
}

fn cmyk_to_rgb565(cmyk: &[u8]) -> u16 {
    let k = 255 - u16::from(cmyk[3]);
    let channel = |c: u8| ((255 - u16::from(c)) * k / 255) as u8;
    pack_rgb565(channel(cmyk[0]), channel(cmyk[1]), channel(cmyk[2]))
}

/// Chooses the decode scale and owns the pixel budget.
pub struct FrameDecoder<D = ScalingJpegDecoder> {
    decoder: D,
    allocator: TieredAllocator,
    max_pixel_bytes: usize,
}

impl FrameDecoder<ScalingJpegDecoder> {
    /// Decoder whose working memory is held to the allocator's ceiling.
    pub fn new(allocator: TieredAllocator, max_pixel_bytes: usize) -> Self {
        let jpeg = ScalingJpegDecoder::new(allocator.ceiling());
        Self::with_decoder(jpeg, allocator, max_pixel_bytes)
    }
}

impl<D: JpegDecode> FrameDecoder<D> {
    pub fn with_decoder(
        decoder: D,
        allocator: TieredAllocator,
        max_pixel_bytes: usize,
    ) -> Self {
        Self {
            decoder,
            allocator,
            max_pixel_bytes,
        }
    }

    /// Scale for a `source` image on a `display`, coarsened until the
    /// output fits the pixel budget.
    pub fn plan(
        &self,
        source: (u32, u32),
        display: (u32, u32),
    ) -> Result<JpegScale, DecodeError> {
        let mut scale = select_scale(source, display);
        loop {
            let (w, h) = scale.apply(source.0, source.1);
            if w as usize * h as usize * BYTES_PER_PIXEL <= self.max_pixel_bytes {
                return Ok(scale);
            }
            scale = scale.coarser().ok_or(DecodeError::TooLarge {
                width: source.0,
                height: source.1,
                budget: self.max_pixel_bytes,
            })?;
        }
    }

    /// Decode one frame. The real dimensions come from the JPEG itself,
    /// `header_dims` is only a fallback.
    pub fn decode(
        &mut self,
        jpeg: &[u8],
        header_dims: (u32, u32),
        display_dims: (u32, u32),
    ) -> Result<PixelBuffer, DecodeError> {
        let started = Instant::now();
        let source = jpeg_dimensions(jpeg).unwrap_or(header_dims);
        let scale = self.plan(source, display_dims)?;
        let (width, height) = scale.apply(source.0, source.1);

        let mut out = PixelBuffer::allocate(&self.allocator, width, height)?;
        if let Err(err) = self.decoder.decode(jpeg, scale, &mut out) {
            warn!(error = %err, len = jpeg.len(), "frame decode failed");
            return Err(err);
        }

        let elapsed = started.elapsed();
        metrics::histogram!("decode_time_us").record(elapsed.as_micros() as f64);
        debug!(
            ?scale,
            width,
            height,
            elapsed_us = elapsed.as_micros() as u64,
            "frame decoded"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};

    use super::*;
    use crate::memory::{BudgetTier, MemoryTier};

    fn solid_jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        encode(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb(color),
        )))
    }

    fn encode(img: DynamicImage) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Jpeg).unwrap();
        bytes.into_inner()
    }

    fn heap_decoder() -> FrameDecoder {
        FrameDecoder::new(TieredAllocator::heap(1 << 20), DEFAULT_MAX_PIXEL_BYTES)
    }

    #[test]
    fn scale_follows_display_ratio() {
        assert_eq!(select_scale((1280, 960), (320, 240)), JpegScale::Half);
        assert_eq!(select_scale((300, 200), (320, 240)), JpegScale::None);
        assert_eq!(select_scale((640, 481), (320, 240)), JpegScale::Half);
    }

    #[test]
    fn budget_escalates_scale() {
        let decoder = FrameDecoder::new(TieredAllocator::heap(1 << 20), 16 * 12 * 2);
        assert_eq!(decoder.plan((64, 48), (64, 48)).unwrap(), JpegScale::Quarter);

        let tight = FrameDecoder::new(TieredAllocator::heap(1 << 20), 10);
        assert!(matches!(
            tight.plan((64, 48), (64, 48)),
            Err(DecodeError::TooLarge { width: 64, height: 48, .. })
        ));
    }

    #[test]
    fn decodes_solid_frame_to_rgb565() {
        let jpeg = solid_jpeg(64, 48, [255, 0, 0]);
        let mut decoder = heap_decoder();
        let pixels = decoder.decode(&jpeg, (320, 240), (64, 48)).unwrap();

        assert_eq!((pixels.width(), pixels.height()), (64, 48));
        assert_eq!(pixels.as_bytes().len(), 64 * 48 * 2);
        let p = pixels.pixel(10, 10);
        assert!((p >> 11) >= 28, "red channel too low: {p:#06x}");
        assert!(((p >> 5) & 0x3F) <= 4);
        assert!((p & 0x1F) <= 2);
    }

    #[test]
    fn large_frame_is_halved() {
        let jpeg = solid_jpeg(400, 300, [0, 0, 255]);
        let mut decoder = heap_decoder();
        let pixels = decoder.decode(&jpeg, (320, 240), (160, 120)).unwrap();
        assert_eq!((pixels.width(), pixels.height()), (200, 150));
        assert_eq!(pixels.pixel(100, 75) & 0x1F, 0x1F);
    }

    #[test]
    fn budget_scale_is_applied_inside_the_idct() {
        let jpeg = solid_jpeg(1024, 768, [0, 255, 0]);
        let mut decoder = heap_decoder();
        let pixels = decoder.decode(&jpeg, (1024, 768), (320, 240)).unwrap();
        assert_eq!((pixels.width(), pixels.height()), (256, 192));
        assert!(((pixels.pixel(128, 96) >> 5) & 0x3F) >= 60);
    }

    #[test]
    fn grayscale_frame_expands_to_all_channels() {
        let jpeg = encode(DynamicImage::ImageLuma8(GrayImage::from_pixel(
            32,
            32,
            Luma([255]),
        )));
        let pixels = heap_decoder().decode(&jpeg, (32, 32), (32, 32)).unwrap();
        let p = pixels.pixel(16, 16);
        assert!((p >> 11) >= 30 && ((p >> 5) & 0x3F) >= 60 && (p & 0x1F) >= 30);
    }

    #[test]
    fn frame_beyond_working_memory_is_refused() {
        let jpeg = solid_jpeg(64, 48, [0, 0, 0]);
        let mut decoder = FrameDecoder::with_decoder(
            ScalingJpegDecoder::new(64 * 48),
            TieredAllocator::heap(1 << 20),
            DEFAULT_MAX_PIXEL_BYTES,
        );
        assert!(matches!(
            decoder.decode(&jpeg, (64, 48), (64, 48)),
            Err(DecodeError::TooLarge { width: 64, height: 48, .. })
        ));
    }

    #[test]
    fn corrupt_frame_releases_its_buffer() {
        let tier = Arc::new(BudgetTier::new("internal", 1 << 20));
        let tiers = vec![tier.clone() as Arc<dyn MemoryTier>];
        let allocator = TieredAllocator::new(tiers, 1 << 20);
        let mut decoder = FrameDecoder::new(allocator, DEFAULT_MAX_PIXEL_BYTES);

        let err = decoder.decode(b"definitely not a jpeg", (32, 32), (32, 32)).unwrap_err();
        assert!(matches!(err, DecodeError::Jpeg(_)));
        assert_eq!(tier.in_use(), 0);
    }

    #[test]
    fn rgb565_packing() {
        assert_eq!(pack_rgb565(0xFF, 0xFF, 0xFF), 0xFFFF);
        assert_eq!(pack_rgb565(0xFF, 0, 0), 0xF800);
        assert_eq!(pack_rgb565(0, 0xFF, 0), 0x07E0);
        assert_eq!(pack_rgb565(0, 0, 0xFF), 0x001F);
    }
}
