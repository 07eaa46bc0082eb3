use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::detect::backend::ObjectClassifier;
use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Detections per call; mostly none.
const STUB_COUNTS: [usize; 5] = [0, 0, 0, 1, 2];
const STUB_LABELS: [&str; 2] = ["cat", "dog"];
const STUB_MIN_CONFIDENCE: f32 = 0.5;
const STUB_MAX_CONFIDENCE: f32 = 0.95;

/// Stand-in for a real model. Reports zero to two random cat or dog boxes
/// per frame so every evidence category fills up in development.
pub struct StubClassifier {
    rng: StdRng,
}

impl Default for StubClassifier {
    fn default() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl StubClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic output for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn random_box(&mut self, frame: &Frame) -> RawDetection {
        let width = frame.width() as f32;
        let height = frame.height() as f32;
        let x1 = self.rng.gen_range(0.0..width);
        let y1 = self.rng.gen_range(0.0..height);
        let x2 = (x1 + self.rng.gen_range(100.0..300.0)).min(width);
        let y2 = (y1 + self.rng.gen_range(100.0..300.0)).min(height);
        let label = STUB_LABELS.choose(&mut self.rng).copied().unwrap_or("cat");
        let confidence = self
            .rng
            .gen_range(STUB_MIN_CONFIDENCE..STUB_MAX_CONFIDENCE);
        RawDetection::new(label, confidence, [x1.floor(), y1.floor(), x2, y2])
    }
}

impl ObjectClassifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<RawDetection>> {
        let count = STUB_COUNTS.choose(&mut self.rng).copied().unwrap_or(0);
        Ok((0..count)
            .map(|_| self.random_box(frame))
            .filter(|d| d.confidence >= threshold)
            .collect())
    }
}

/// One queued response from a [`ScriptedClassifier`].
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    Detections(Vec<RawDetection>),
    Fail(String),
}

/// Classifier that replays queued responses, then falls back to a default.
///
/// Applies `threshold` like a real backend would so boundary filtering can be
/// observed end to end.
pub struct ScriptedClassifier {
    queue: VecDeque<ScriptedResponse>,
    fallback: Vec<RawDetection>,
}

impl ScriptedClassifier {
    pub fn new(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            queue: responses.into_iter().collect(),
            fallback: Vec::new(),
        }
    }

    /// Detections returned once the queue is drained.
    pub fn with_fallback(mut self, fallback: Vec<RawDetection>) -> Self {
        self.fallback = fallback;
        self
    }
}

impl ObjectClassifier for ScriptedClassifier {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn classify(&mut self, _frame: &Frame, threshold: f32) -> Result<Vec<RawDetection>> {
        let detections = match self.queue.pop_front() {
            Some(ScriptedResponse::Fail(reason)) => return Err(anyhow!(reason)),
            Some(ScriptedResponse::Detections(detections)) => detections,
            None => self.fallback.clone(),
        };
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= threshold)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[test]
    fn stub_reports_a_few_pets_inside_the_frame() -> Result<()> {
        let frame = Frame::solid(640, 480, [0, 0, 0], Local::now());
        let mut stub = StubClassifier::new().with_seed(42);

        let batches: Vec<Vec<RawDetection>> = (0..200)
            .map(|_| stub.classify(&frame, 0.0))
            .collect::<Result<_>>()?;
        let empty = batches.iter().filter(|b| b.is_empty()).count();
        assert!(empty > 80 && empty < 160, "empty batches: {empty}");

        let all: Vec<&RawDetection> = batches.iter().flatten().collect();
        assert!(batches.iter().all(|b| b.len() <= 2));
        assert!(all.iter().any(|d| d.label == "cat"));
        assert!(all.iter().any(|d| d.label == "dog"));
        for d in &all {
            assert!(d.label == "cat" || d.label == "dog");
            assert!((0.5..0.95).contains(&d.confidence));
            let [x1, y1, x2, y2] = d.bbox;
            assert!(0.0 <= x1 && x1 < x2 && x2 <= 640.0);
            assert!(0.0 <= y1 && y1 < y2 && y2 <= 480.0);
        }
        Ok(())
    }

    #[test]
    fn stub_is_repeatable_for_a_seed_and_honours_the_threshold() -> Result<()> {
        let frame = Frame::solid(320, 240, [0, 0, 0], Local::now());
        let mut a = StubClassifier::new().with_seed(9);
        let mut b = StubClassifier::new().with_seed(9);
        for _ in 0..20 {
            assert_eq!(a.classify(&frame, 0.0)?, b.classify(&frame, 0.0)?);
        }
        let mut strict = StubClassifier::new().with_seed(9);
        for _ in 0..50 {
            assert!(strict.classify(&frame, 0.96)?.is_empty());
        }
        Ok(())
    }
}
