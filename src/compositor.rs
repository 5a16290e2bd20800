//! Blits decoded frames onto a display surface.

use std::time::Instant;

use crate::decode::PixelBuffer;
use crate::display::{Color, DisplaySurface};
use crate::error::DisplayError;

/// Expand an RGB565 pixel to 8 bits per channel.
pub fn rgb565_to_color(p: u16) -> Color {
    Color {
        r: (((p >> 11) & 0x1F) << 3) as u8,
        g: (((p >> 5) & 0x3F) << 2) as u8,
        b: ((p & 0x1F) << 3) as u8,
    }
}

/// Nearest-neighbour draw of `frame` over the whole surface. Each axis is
/// scaled independently, so aspect ratio is not preserved.
pub fn blit(surface: &mut dyn DisplaySurface, frame: &PixelBuffer) {
    let (dw, dh) = (surface.width(), surface.height());
    if dw == 0 || dh == 0 {
        return;
    }
    let (fw, fh) = (frame.width(), frame.height());

    for y in 0..dh {
        let sy = nearest(y, fh, dh);
        if sy >= fh {
            continue;
        }
        for x in 0..dw {
            let sx = nearest(x, fw, dw);
            if sx >= fw {
                continue;
            }
            surface.draw_pixel(x, y, rgb565_to_color(frame.pixel(sx, sy)));
        }
    }
}

/// Source index for destination index `at` when `src` pixels span `dst`.
fn nearest(at: u32, src: u32, dst: u32) -> u32 {
    (u64::from(at) * u64::from(src) / u64::from(dst)) as u32
}

/// Clear to black, draw `frame` and present it.
pub fn present_frame(
    surface: &mut dyn DisplaySurface,
    frame: &PixelBuffer,
) -> Result<(), DisplayError> {
    let started = Instant::now();
    surface.fill(Color::BLACK)?;
    blit(surface, frame);
    surface.present()?;
    metrics::histogram!("render_time_us").record(started.elapsed().as_micros() as f64);
    Ok(())
}
