use crate::detect::backend::ObjectClassifier;
use crate::detect::result::{DetectionRecord, DetectionType};
use crate::error::PipelineError;
use crate::frame::Frame;

/// Stable contract around whichever classifier backend is loaded.
///
/// Only cats and dogs at or above the threshold make it through; anything else
/// the backend reports is dropped here. Backend errors surface as
/// `PipelineError::Classification` so the caller can tell them apart from an
/// empty result.
pub struct ClassifierBoundary {
    backend: Box<dyn ObjectClassifier>,
}

impl ClassifierBoundary {
    pub fn new(backend: Box<dyn ObjectClassifier>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn warm_up(&mut self) -> Result<(), PipelineError> {
        self.backend
            .warm_up()
            .map_err(PipelineError::classification)
    }

    pub fn classify(
        &mut self,
        frame: &Frame,
        threshold: f32,
    ) -> Result<Vec<DetectionRecord>, PipelineError> {
        let raw = self
            .backend
            .classify(frame, threshold)
            .map_err(PipelineError::classification)?;

        Ok(raw
            .into_iter()
            .filter(|d| d.confidence.is_finite() && d.confidence >= threshold)
            .filter_map(|d| match DetectionType::from_label(&d.label) {
                DetectionType::Other => None,
                kind => Some(DetectionRecord {
                    kind,
                    confidence: d.confidence.clamp(0.0, 1.0),
                    bbox: d.bbox,
                }),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::{ScriptedClassifier, ScriptedResponse};
    use crate::detect::result::RawDetection;
    use chrono::Local;

    fn frame() -> Frame {
        Frame::solid(8, 8, [0, 0, 0], Local::now())
    }

    #[test]
    fn keeps_only_pets_above_threshold() {
        let backend = ScriptedClassifier::new([ScriptedResponse::Detections(vec![
            RawDetection::new("cat", 0.9, [1.0, 2.0, 3.0, 4.0]),
            RawDetection::new("dog", 0.4, [0.0, 0.0, 1.0, 1.0]),
            RawDetection::new("person", 0.99, [0.0, 0.0, 5.0, 5.0]),
            RawDetection::new("dog", 0.5, [2.0, 2.0, 6.0, 6.0]),
        ])]);
        let mut boundary = ClassifierBoundary::new(Box::new(backend));

        let detections = boundary.classify(&frame(), 0.5).unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].kind, DetectionType::Cat);
        assert_eq!(detections[0].bbox, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(detections[1].kind, DetectionType::Dog);
        assert_eq!(detections[1].confidence, 0.5);
    }

    #[test]
    fn backend_error_is_not_an_empty_result() {
        let backend = ScriptedClassifier::new([
            ScriptedResponse::Fail("model timed out".into()),
            ScriptedResponse::Detections(vec![]),
        ]);
        let mut boundary = ClassifierBoundary::new(Box::new(backend));

        let err = boundary.classify(&frame(), 0.5).unwrap_err();
        assert!(matches!(err, PipelineError::Classification(ref msg) if msg.contains("timed out")));

        let empty = boundary.classify(&frame(), 0.5).unwrap();
        assert!(empty.is_empty());
    }
}
