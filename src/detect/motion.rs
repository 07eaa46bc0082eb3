//! Background-subtraction motion gate.
//!
//! Cheap per-pixel comparison against an exponentially smoothed grayscale
//! background. The classifier only runs on frames this gate lets through.

use image::imageops;
use image::GrayImage;

use crate::frame::Frame;

/// Gaussian sigma equivalent to a 21x21 kernel.
pub const BLUR_SIGMA: f32 = 3.5;
/// Per-pixel intensity delta that counts as changed.
pub const PIXEL_DELTA_THRESHOLD: f32 = 25.0;
/// Weight of the current frame when updating the background.
pub const BACKGROUND_ALPHA: f32 = 0.1;

struct BackgroundModel {
    width: u32,
    height: u32,
    luma: Vec<f32>,
}

impl BackgroundModel {
    fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            luma: gray.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    fn matches(&self, gray: &GrayImage) -> bool {
        self.width == gray.width() && self.height == gray.height()
    }
}

#[derive(Default)]
pub struct MotionGate {
    background: Option<BackgroundModel>,
    last_ratio: f32,
}

impl MotionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when more than `threshold_percent` of the pixels differ
    /// from the background by more than [`PIXEL_DELTA_THRESHOLD`].
    ///
    /// The first frame after construction, [`reset`](Self::reset), or a change
    /// in dimensions only seeds the background and always returns false.
    pub fn evaluate(&mut self, frame: &Frame, threshold_percent: f32) -> bool {
        let gray = imageops::blur(&frame.grayscale(), BLUR_SIGMA);

        let seeded = self
            .background
            .as_ref()
            .is_some_and(|bg| bg.matches(&gray));
        if !seeded {
            if self.background.is_some() {
                log::info!(
                    "motion gate: frame size changed to {}x{}, resetting background",
                    gray.width(),
                    gray.height()
                );
            }
            self.background = Some(BackgroundModel::from_gray(&gray));
            self.last_ratio = 0.0;
            return false;
        }
        let Some(background) = self.background.as_mut() else {
            return false;
        };

        let mut changed = 0usize;
        for (bg, &px) in background.luma.iter_mut().zip(gray.as_raw().iter()) {
            let px = px as f32;
            if (bg.round() - px).abs() > PIXEL_DELTA_THRESHOLD {
                changed += 1;
            }
            *bg = *bg * (1.0 - BACKGROUND_ALPHA) + px * BACKGROUND_ALPHA;
        }

        let total = background.luma.len().max(1);
        self.last_ratio = changed as f32 / total as f32;
        self.last_ratio * 100.0 > threshold_percent
    }

    /// Fraction of changed pixels seen by the last evaluation.
    pub fn last_ratio(&self) -> f32 {
        self.last_ratio
    }

    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }

    /// Forget the background; the next frame seeds a new one.
    pub fn reset(&mut self) {
        self.background = None;
        self.last_ratio = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn solid(rgb: [u8; 3]) -> Frame {
        Frame::solid(32, 24, rgb, Local::now())
    }

    #[test]
    fn first_frame_only_seeds_background() {
        let mut gate = MotionGate::new();
        assert!(!gate.evaluate(&solid([255, 255, 255]), 0.0));
        assert!(gate.has_background());
    }

    #[test]
    fn static_scene_is_not_motion() {
        let mut gate = MotionGate::new();
        let frame = solid([90, 120, 60]);
        gate.evaluate(&frame, 30.0);
        assert!(!gate.evaluate(&frame, 30.0));
        assert_eq!(gate.last_ratio(), 0.0);
    }

    #[test]
    fn large_change_is_motion() {
        let mut gate = MotionGate::new();
        gate.evaluate(&solid([0, 0, 0]), 30.0);
        assert!(gate.evaluate(&solid([255, 255, 255]), 30.0));
        assert!(gate.last_ratio() > 0.99);
    }

    #[test]
    fn small_lighting_shift_is_absorbed() {
        let mut gate = MotionGate::new();
        gate.evaluate(&solid([100, 100, 100]), 30.0);
        assert!(!gate.evaluate(&solid([110, 110, 110]), 30.0));
    }

    #[test]
    fn background_converges_toward_new_scene() {
        let mut gate = MotionGate::new();
        gate.evaluate(&solid([0, 0, 0]), 30.0);
        let bright = solid([200, 200, 200]);
        assert!(gate.evaluate(&bright, 30.0));
        // 200 * (1 - 0.9^n) must come within 25 of 200: n >= 20.
        let mut last = true;
        for _ in 0..25 {
            last = gate.evaluate(&bright, 30.0);
        }
        assert!(!last);
    }

    #[test]
    fn reset_reseeds_from_the_next_frame() {
        let mut gate = MotionGate::new();
        gate.evaluate(&solid([0, 0, 0]), 30.0);
        gate.reset();
        assert!(!gate.has_background());
        assert!(!gate.evaluate(&solid([255, 255, 255]), 30.0));
        assert_eq!(gate.last_ratio(), 0.0);
    }

    #[test]
    fn dimension_change_resets_baseline() {
        let mut gate = MotionGate::new();
        gate.evaluate(&solid([0, 0, 0]), 30.0);
        let other = Frame::solid(16, 16, [255, 255, 255], Local::now());
        assert!(!gate.evaluate(&other, 30.0));
        assert!(!gate.evaluate(&other, 30.0));
    }
}
