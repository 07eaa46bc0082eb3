use serde::{Deserialize, Serialize};

/// Kind of animal a detection refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionType {
    Cat,
    Dog,
    Other,
}

impl DetectionType {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "cat" => DetectionType::Cat,
            "dog" => DetectionType::Dog,
            _ => DetectionType::Other,
        }
    }
}

/// A filtered classifier detection. Bounding box is `[x1, y1, x2, y2]` in
/// frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    #[serde(rename = "type")]
    pub kind: DetectionType,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// Unfiltered output of a classifier backend.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

impl RawDetection {
    pub fn new(label: &str, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            label: label.to_string(),
            confidence,
            bbox,
        }
    }
}
