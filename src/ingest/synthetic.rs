//! Synthetic camera for `stub://` URLs.
//!
//! Produces a dark, noisy scene. On roughly 30% of frames a large brown block
//! (the "pet") appears at a random position, which is enough to trip the
//! motion gate at default settings.

use anyhow::{anyhow, Result};
use chrono::Local;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{FrameSource, SourceStats};
use crate::config::Resolution;
use crate::frame::Frame;

const NOISE_CEILING: u8 = 50;
const PET_PROBABILITY: f64 = 0.3;
const PET_RGB: [u8; 3] = [200, 150, 100];

pub struct SyntheticSource {
    url: String,
    resolution: Resolution,
    rng: StdRng,
    running: bool,
    frames_captured: u64,
    capture_errors: u64,
}

impl SyntheticSource {
    pub fn new(url: &str, resolution: Resolution) -> Self {
        Self {
            url: url.to_string(),
            resolution,
            rng: StdRng::from_entropy(),
            running: false,
            frames_captured: 0,
            capture_errors: 0,
        }
    }

    /// Deterministic output for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let mut pixels: Vec<u8> = (0..width * height * 3)
            .map(|_| self.rng.gen_range(0..NOISE_CEILING))
            .collect();

        if self.rng.gen_bool(PET_PROBABILITY) {
            let pet_w = (width / 2).max(1);
            let pet_h = (height * 3 / 4).max(1);
            let x0 = self.rng.gen_range(0..=width - pet_w);
            let y0 = self.rng.gen_range(0..=height - pet_h);
            for y in y0..y0 + pet_h {
                for x in x0..x0 + pet_w {
                    let idx = (y * width + x) * 3;
                    pixels[idx..idx + 3].copy_from_slice(&PET_RGB);
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        log::info!(
            "SyntheticSource: started {} ({}x{})",
            self.url,
            self.resolution.width,
            self.resolution.height
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        log::info!("SyntheticSource: stopped {}", self.url);
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        if !self.running {
            self.capture_errors += 1;
            return Err(anyhow!("camera not started"));
        }
        let pixels = self.generate_pixels();
        self.frames_captured += 1;
        Frame::from_rgb(
            pixels,
            self.resolution.width,
            self.resolution.height,
            Local::now(),
        )
    }

    fn is_healthy(&self) -> bool {
        self.running
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            capture_errors: self.capture_errors,
            url: self.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SyntheticSource {
        SyntheticSource::new(
            "stub://test",
            Resolution {
                width: 40,
                height: 30,
            },
        )
        .with_seed(7)
    }

    #[test]
    fn capture_requires_start() -> Result<()> {
        let mut source = source();
        assert!(source.capture_frame().is_err());
        assert_eq!(source.stats().capture_errors, 1);

        source.start()?;
        let frame = source.capture_frame()?;
        assert_eq!(frame.pixels().len(), 40 * 30 * 3);
        assert_eq!(source.stats().frames_captured, 1);

        source.stop()?;
        assert!(!source.is_healthy());
        Ok(())
    }

    #[test]
    fn pet_appears_in_some_frames() -> Result<()> {
        let mut source = source();
        source.start()?;
        let with_pet = (0..50)
            .filter_map(|_| source.capture_frame().ok())
            .filter(|frame| frame.pixels().chunks(3).any(|px| px == PET_RGB))
            .count();
        assert!(with_pet > 0 && with_pet < 50);
        Ok(())
    }
}
