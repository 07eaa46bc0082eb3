//! Captured frames.
//!
//! A `Frame` lives for exactly one tick: it is captured, evaluated by the
//! motion gate, optionally classified, and encoded into evidence. Pixels are
//! packed RGB8, row-major, with no padding.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GrayImage, Luma, RgbImage};

/// JPEG quality used for persisted evidence.
pub const EVIDENCE_JPEG_QUALITY: u8 = 90;

pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    /// Wall-clock capture time. Evidence ids and sidecar timestamps derive from this.
    pub captured_at: DateTime<Local>,
}

impl Frame {
    /// Wrap a packed RGB8 buffer. Fails when the buffer length does not match
    /// the dimensions.
    pub fn from_rgb(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: DateTime<Local>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at,
        })
    }

    /// Frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], captured_at: DateTime<Local>) -> Self {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            pixels,
            width,
            height,
            captured_at,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// BT.601 luma conversion.
    pub fn grayscale(&self) -> GrayImage {
        let width = self.width as usize;
        GrayImage::from_fn(self.width, self.height, |x, y| {
            let idx = (y as usize * width + x as usize) * 3;
            let r = self.pixels[idx] as f32;
            let g = self.pixels[idx + 1] as f32;
            let b = self.pixels[idx + 2] as f32;
            let luma = 0.299 * r + 0.587 * g + 0.114 * b;
            Luma([luma.round().clamp(0.0, 255.0) as u8])
        })
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, EVIDENCE_JPEG_QUALITY)
            .encode(&self.pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode evidence jpeg")?;
        Ok(out)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        let err = Frame::from_rgb(vec![0u8; 10], 2, 2, Local::now()).unwrap_err();
        assert!(err.to_string().contains("expected 12 RGB bytes"));
    }

    #[test]
    fn grayscale_of_white_is_white() -> Result<()> {
        let frame = Frame::solid(4, 3, [255, 255, 255], Local::now());
        let gray = frame.grayscale();
        assert_eq!(gray.dimensions(), (frame.width(), frame.height()));
        assert_eq!(frame.pixel_count(), 12);
        assert!(gray.pixels().all(|p| p.0[0] == 255));
        Ok(())
    }

    #[test]
    fn encodes_jpeg_with_soi_marker() -> Result<()> {
        let frame = Frame::solid(16, 16, [120, 80, 40], Local::now());
        let jpeg = frame.encode_jpeg()?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }
}
