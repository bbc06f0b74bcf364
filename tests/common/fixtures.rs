//! Image fixtures generated at test time
//!
//! Each fixture is nine vertical grey bars. Bit `i` of the pattern (most
//! significant first) says whether bar `i` is brighter than bar `i + 1`, which
//! is exactly what the difference hash records. Copies of one pattern at
//! different sizes are perceptual duplicates; different patterns are not.

use image::{GrayImage, ImageFormat, Luma};
use std::io::Cursor;

const STEP: i32 = 15;

fn bar_levels(pattern: u8) -> [u8; 9] {
    let mut levels = [0u8; 9];
    let mut level = 128i32;
    levels[0] = level as u8;
    for i in 0..8 {
        let brighter_than_next = (pattern >> (7 - i)) & 1 == 1;
        level += if brighter_than_next { -STEP } else { STEP };
        levels[i + 1] = level as u8;
    }
    levels
}

/// PNG bytes of the bar pattern at the given size.
pub fn bar_png(pattern: u8, width: u32, height: u32) -> Vec<u8> {
    let levels = bar_levels(pattern);
    let image = GrayImage::from_fn(width, height, |x, _| {
        let bar = (x * 9 / width) as usize;
        Luma([levels[bar]])
    });
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode fixture");
    out.into_inner()
}

/// The same image as [`bar_png`], re-encoded as JPEG so the bytes differ.
pub fn bar_jpeg(pattern: u8, width: u32, height: u32) -> Vec<u8> {
    let levels = bar_levels(pattern);
    let image = GrayImage::from_fn(width, height, |x, _| {
        let bar = (x * 9 / width) as usize;
        Luma([levels[bar]])
    });
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .expect("encode fixture");
    out.into_inner()
}
