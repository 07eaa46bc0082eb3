//! Frame sources.
//!
//! - `stub://...` synthetic camera (development and tests)
//! - `scripted` frames/failures queued by tests
//! - `/dev/videoN` local V4L2 devices (feature: ingest-v4l2)
//!
//! Sources hand out one `Frame` per call, packed RGB8 at the configured
//! resolution. A capture error is returned, never papered over with a blank
//! frame.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod scripted;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

pub use scripted::{ScriptedFrame, ScriptedSource};
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

use crate::config::Resolution;
use crate::frame::Frame;

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub capture_errors: u64,
    pub url: String,
}

pub trait FrameSource: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn capture_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Open a source by URL. `stub://` gives the synthetic camera; any other
/// local path is treated as a V4L2 device.
pub fn open_source(url: &str, resolution: Resolution) -> Result<Box<dyn FrameSource>> {
    if url.trim().is_empty() {
        return Err(anyhow!("frame source url cannot be empty"));
    }
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(url, resolution)));
    }
    if url.contains("://") {
        return Err(anyhow!("unsupported frame source scheme in '{}'", url));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Source::new(url, resolution)))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!(
            "camera device '{}' requires the ingest-v4l2 feature",
            url
        ))
    }
}
