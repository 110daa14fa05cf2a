//! Decoded pixel buffers.
//!
//! **Why**: Every decoder family (still images, multi-frame containers, numeric
//! arrays, edit expressions) hands its result to consumers in one layout:
//! row-major, channel-interleaved `f32` samples kept at their native range
//! (0..255 for 8-bit sources, 0..65535 for 16-bit, raw values for floats).
//!
//! **Used by**: Providers (produce), cache entries and consumers (share via `Arc`)
//!
//! # Range
//!
//! `min()`/`max()` are computed once, on first read, over finite samples only.

use std::sync::OnceLock;

use image::DynamicImage;

/// Immutable decoded image
#[derive(Debug)]
pub struct Image {
    pixels: Vec<f32>,
    width: usize,
    height: usize,
    channels: usize,
    range: OnceLock<(f32, f32)>,
    from_cache: bool,
}

impl Image {
    /// Wrap a channel-interleaved buffer.
    ///
    /// The buffer length must be `width * height * channels`.
    pub fn new(pixels: Vec<f32>, width: usize, height: usize, channels: usize) -> Self {
        debug_assert_eq!(pixels.len(), width * height * channels);
        Self {
            pixels,
            width,
            height,
            channels,
            range: OnceLock::new(),
            from_cache: false,
        }
    }

    /// Mark the image as produced by a cache-registered provider
    pub(crate) fn into_cached(mut self) -> Self {
        self.from_cache = true;
        self
    }

    /// Convert any `image` crate result, keeping channel count and native range
    pub fn from_dynamic(img: DynamicImage) -> Self {
        let width = img.width() as usize;
        let height = img.height() as usize;

        let (pixels, channels): (Vec<f32>, usize) = match img {
            DynamicImage::ImageLuma8(b) => (widen(b.into_raw()), 1),
            DynamicImage::ImageLumaA8(b) => (widen(b.into_raw()), 2),
            DynamicImage::ImageRgb8(b) => (widen(b.into_raw()), 3),
            DynamicImage::ImageRgba8(b) => (widen(b.into_raw()), 4),
            DynamicImage::ImageLuma16(b) => (widen(b.into_raw()), 1),
            DynamicImage::ImageLumaA16(b) => (widen(b.into_raw()), 2),
            DynamicImage::ImageRgb16(b) => (widen(b.into_raw()), 3),
            DynamicImage::ImageRgba16(b) => (widen(b.into_raw()), 4),
            DynamicImage::ImageRgb32F(b) => (b.into_raw(), 3),
            DynamicImage::ImageRgba32F(b) => (b.into_raw(), 4),
            other => (other.to_rgba32f().into_raw(), 4),
        };

        Self::new(pixels, width, height, channels)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Get resolution as tuple
    pub fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// Whether the buffer came out of a cache-registered provider
    pub fn is_cached(&self) -> bool {
        self.from_cache
    }

    /// Samples of one pixel, or None outside the image
    pub fn pixel(&self, x: usize, y: usize) -> Option<&[f32]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y * self.width + x) * self.channels;
        Some(&self.pixels[start..start + self.channels])
    }

    pub fn min(&self) -> f32 {
        self.range().0
    }

    pub fn max(&self) -> f32 {
        self.range().1
    }

    /// Memory size in bytes
    pub fn mem(&self) -> usize {
        self.pixels.len() * std::mem::size_of::<f32>()
    }

    fn range(&self) -> (f32, f32) {
        *self.range.get_or_init(|| {
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for &v in self.pixels.iter().filter(|v| v.is_finite()) {
                lo = lo.min(v);
                hi = hi.max(v);
            }
            if lo > hi { (0.0, 0.0) } else { (lo, hi) }
        })
    }
}

fn widen<T: Copy + Into<f32>>(samples: Vec<T>) -> Vec<f32> {
    samples.into_iter().map(Into::into).collect()
}
