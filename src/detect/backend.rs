use anyhow::Result;

use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Object classifier backend.
///
/// Backends wrap a pretrained detector. They receive the frame read-only and
/// report every object they find at or above `threshold`, whatever its label;
/// label filtering happens at the classifier boundary. Errors must be returned,
/// never folded into an empty result.
pub trait ObjectClassifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run the detector on a frame.
    fn classify(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, run once before the first tick.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
