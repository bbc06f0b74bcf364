//! Content and perceptual fingerprints of fetched images.

use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("not a decodable image: {0}")]
    Undecodable(#[from] image::ImageError),
}

/// 64-bit difference hash. Similar images differ in few bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    pub fn hamming(&self, other: &PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Value of the `index`-th of `bands` equal bit-bands, used as a bucket key.
    pub fn band(&self, index: u32, bands: u32) -> u64 {
        let width = 64 / bands;
        let shift = index * width;
        let mask = if width >= 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        (self.0 >> shift) & mask
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Everything the pipeline derives from the bytes of one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_hash: String,
    pub perceptual_hash: PerceptualHash,
    pub width: u32,
    pub height: u32,
    /// File extension of the decoded format, e.g. "jpg".
    pub extension: &'static str,
}

impl Fingerprint {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Decode `bytes` and compute both hashes. CPU bound, call it off the
/// async executor.
pub fn fingerprint(bytes: &[u8]) -> Result<Fingerprint, FingerprintError> {
    let format = image::guess_format(bytes)?;
    let image = image::load_from_memory_with_format(bytes, format)?;
    let (width, height) = image.dimensions();
    Ok(Fingerprint {
        content_hash: content_hash(bytes),
        perceptual_hash: difference_hash(&image),
        width,
        height,
        extension: extension_for(format),
    })
}

/// dHash: shrink to 9x8 grayscale and record whether each pixel is brighter
/// than its right neighbour.
pub fn difference_hash(image: &image::DynamicImage) -> PerceptualHash {
    let thumb = image.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut hash = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = thumb.get_pixel(x, y).0[0];
            let right = thumb.get_pixel(x + 1, y).0[0];
            hash = (hash << 1) | u64::from(left > right);
        }
    }
    PerceptualHash(hash)
}

fn extension_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        other => other.extensions_str().first().copied().unwrap_or("img"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            let v = (x * 200 / width + y * 50 / height) as u8;
            Rgb([v, v / 2, 255 - v])
        })
    }

    fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image.clone())
            .write_to(&mut out, format)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fingerprint_reports_dimensions_and_format() {
        let bytes = encode(&gradient(64, 48), ImageFormat::Png);
        let fp = fingerprint(&bytes).unwrap();
        assert_eq!((fp.width, fp.height), (64, 48));
        assert_eq!(fp.extension, "png");
        assert_eq!(fp.pixels(), 64 * 48);
        assert_eq!(fp.content_hash, content_hash(&bytes));
    }

    #[test]
    fn resized_copy_is_perceptually_close() {
        let large = DynamicImage::ImageRgb8(gradient(400, 300));
        let small = large.resize_exact(200, 150, FilterType::Lanczos3);
        let distance = difference_hash(&large).hamming(&difference_hash(&small));
        assert!(distance <= 5, "distance was {}", distance);
    }

    #[test]
    fn garbage_is_undecodable() {
        assert!(matches!(
            fingerprint(b"<html>not an image</html>"),
            Err(FingerprintError::Undecodable(_))
        ));
    }

    #[test]
    fn bands_partition_the_hash() {
        let hash = PerceptualHash(0x0123_4567_89ab_cdef);
        assert_eq!(hash.band(0, 8), 0xef);
        assert_eq!(hash.band(7, 8), 0x01);
        assert_eq!(hash.band(1, 4), 0x89ab);
        assert_eq!(hash.band(0, 1), hash.0);
        assert_eq!(hash.hamming(&PerceptualHash(0x0123_4567_89ab_cdee)), 1);
        assert_eq!(hash.to_string(), "0123456789abcdef");
    }
}
