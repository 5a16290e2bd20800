//! Display surfaces.

#[cfg(feature = "sdl-display")]
pub mod sdl;

#[cfg(feature = "sdl-display")]
pub use sdl::Sdl2Display;

use crate::error::DisplayError;

/// 24-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// A fixed-size drawing target.
pub trait DisplaySurface {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn fill(&mut self, color: Color) -> Result<(), DisplayError>;

    /// Set one pixel. Coordinates outside the surface are ignored.
    fn draw_pixel(&mut self, x: u32, y: u32, color: Color);

    /// Show everything drawn since the last present.
    fn present(&mut self) -> Result<(), DisplayError>;
}

/// In-memory surface, used headless and in tests.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixels: Vec<Color>,
    presented: u64,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![Color::BLACK; width as usize * height as usize],
            presented: 0,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        (x < self.width && y < self.height).then(|| self.pixels[(y * self.width + x) as usize])
    }

    /// Number of frames presented so far.
    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl DisplaySurface for FrameBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn fill(&mut self, color: Color) -> Result<(), DisplayError> {
        self.pixels.fill(color);
        Ok(())
    }

    fn draw_pixel(&mut self, x: u32, y: u32, color: Color) {
        if x < self.width && y < self.height {
            self.pixels[(y * self.width + x) as usize] = color;
        }
    }

    fn present(&mut self) -> Result<(), DisplayError> {
        self.presented += 1;
        Ok(())
    }
}

impl<S: DisplaySurface + ?Sized> DisplaySurface for Box<S> {
    fn width(&self) -> u32 {
        (**self).width()
    }

    fn height(&self) -> u32 {
        (**self).height()
    }

    fn fill(&mut self, color: Color) -> Result<(), DisplayError> {
        (**self).fill(color)
    }

    fn draw_pixel(&mut self, x: u32, y: u32, color: Color) {
        (**self).draw_pixel(x, y, color)
    }

    fn present(&mut self) -> Result<(), DisplayError> {
        (**self).present()
    }
}
