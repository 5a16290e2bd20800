//! SDL2 window surface.
//!
//! Pixels are staged in an RGB24 buffer and uploaded through a streaming
//! texture on `present`.

use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::info;

use super::{Color, DisplaySurface};
use crate::error::DisplayError;

fn backend(err: impl ToString) -> DisplayError {
    DisplayError::Backend(err.to_string())
}

pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    staging: Vec<u8>,
    width: u32,
    height: u32,
}

impl Sdl2Display {
    /// Open a window of `width` x `height` pixels, magnified by `zoom`.
    pub fn new(
        sdl_context: &sdl2::Sdl,
        width: u32,
        height: u32,
        zoom: u32,
    ) -> Result<Self, DisplayError> {
        let video_subsystem = sdl_context.video().map_err(backend)?;
        let zoom = zoom.max(1);

        let window = video_subsystem
            .window("kinescope", width * zoom, height * zoom)
            .position_centered()
            .build()
            .map_err(backend)?;

        let canvas = window.into_canvas().present_vsync().build().map_err(backend)?;
        let texture_creator = canvas.texture_creator();
        info!(width, height, zoom, "SDL display ready");

        Ok(Self {
            canvas,
            texture_creator,
            staging: vec![0; width as usize * height as usize * 3],
            width,
            height,
        })
    }
}

impl DisplaySurface for Sdl2Display {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn fill(&mut self, color: Color) -> Result<(), DisplayError> {
        for px in self.staging.chunks_exact_mut(3) {
            px.copy_from_slice(&[color.r, color.g, color.b]);
        }
        Ok(())
    }

    fn draw_pixel(&mut self, x: u32, y: u32, color: Color) {
        if x < self.width && y < self.height {
            let at = (y as usize * self.width as usize + x as usize) * 3;
            self.staging[at..at + 3].copy_from_slice(&[color.r, color.g, color.b]);
        }
    }

    fn present(&mut self) -> Result<(), DisplayError> {
        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGB24, self.width, self.height)
            .map_err(backend)?;
        texture
            .update(None, &self.staging, self.width as usize * 3)
            .map_err(backend)?;

        self.canvas.clear();
        self.canvas.copy(&texture, None, None).map_err(backend)?;
        self.canvas.present();
        Ok(())
    }
}
