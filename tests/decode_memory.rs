//! Heap high-water mark while decoding a frame far larger than the display.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use kinescope::decode::FrameDecoder;
use kinescope::Config;

static CURRENT: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

struct Counting;

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            let now = CURRENT.fetch_add(layout.size(), Ordering::SeqCst) + layout.size();
            PEAK.fetch_max(now, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        CURRENT.fetch_sub(layout.size(), Ordering::SeqCst);
    }
}

#[global_allocator]
static ALLOCATOR: Counting = Counting;

fn large_jpeg(side: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(side, side, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, 75)
        .encode_image(&image)
        .unwrap();
    jpeg
}

#[test]
fn large_frame_decodes_within_the_allocation_ceiling() {
    let config = Config::default();
    let ceiling = config.memory.ceiling_bytes;
    let jpeg = large_jpeg(2048);
    assert!(
        2048 * 2048 * 3 > ceiling,
        "a full-size decode must not fit for this check to mean anything"
    );

    let mut decoder = FrameDecoder::new(config.memory.allocator(), config.player.max_pixel_bytes);
    let baseline = CURRENT.load(Ordering::SeqCst);
    PEAK.store(baseline, Ordering::SeqCst);

    let pixels = decoder.decode(&jpeg, (2048, 2048), (320, 240)).unwrap();
    let peak = PEAK.load(Ordering::SeqCst) - baseline;

    assert_eq!((pixels.width(), pixels.height()), (256, 256));
    assert!(peak <= ceiling, "decode peaked at {peak} bytes, ceiling is {ceiling}");
}
