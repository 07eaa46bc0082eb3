use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// One queued capture result.
pub enum ScriptedFrame {
    Frame(Frame),
    Fail(String),
}

/// Source that replays a queue of frames and failures, then reports a
/// capture error once empty.
pub struct ScriptedSource {
    queue: VecDeque<ScriptedFrame>,
    started: bool,
    stats: SourceStats,
}

impl ScriptedSource {
    pub fn new(script: impl IntoIterator<Item = ScriptedFrame>) -> Self {
        Self {
            queue: script.into_iter().collect(),
            started: false,
            stats: SourceStats {
                url: "scripted".to_string(),
                ..SourceStats::default()
            },
        }
    }
}

impl FrameSource for ScriptedSource {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        match self.queue.pop_front() {
            Some(ScriptedFrame::Frame(frame)) => {
                self.stats.frames_captured += 1;
                Ok(frame)
            }
            Some(ScriptedFrame::Fail(reason)) => {
                self.stats.capture_errors += 1;
                Err(anyhow!(reason))
            }
            None => {
                self.stats.capture_errors += 1;
                Err(anyhow!("script exhausted"))
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.started
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}
