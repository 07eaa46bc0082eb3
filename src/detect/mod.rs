//! Motion gating, event debouncing, and the classifier boundary.

pub mod backend;
pub mod backends;
pub mod classifier;
pub mod debounce;
pub mod motion;
pub mod result;

use anyhow::{anyhow, Result};

pub use backend::ObjectClassifier;
pub use classifier::ClassifierBoundary;
pub use debounce::Debouncer;
pub use motion::MotionGate;
pub use result::{DetectionRecord, DetectionType, RawDetection};

use crate::config::ClassifierSettings;

/// Build the classifier backend named in the configuration.
pub fn open_classifier(settings: &ClassifierSettings) -> Result<Box<dyn ObjectClassifier>> {
    match settings.backend.as_str() {
        "stub" => Ok(Box::new(backends::StubClassifier::new())),
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract classifier requires a model path"))?;
            Ok(Box::new(backends::TractClassifier::new(
                model_path,
                settings.input_size,
            )?))
        }
        #[cfg(not(feature = "backend-tract"))]
        "tract" => Err(anyhow!(
            "tract classifier requires the backend-tract feature"
        )),
        other => Err(anyhow!("unknown classifier backend '{}'", other)),
    }
}
