//! V4L2 camera source.
//!
//! Opens a local device node (e.g. `/dev/video0`), asks for packed RGB at the
//! configured resolution, and converts NV12 or YUYV when the driver refuses RGB.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceStats};
use crate::config::Resolution;
use crate::frame::Frame;

const HEALTH_GRACE: Duration = Duration::from_secs(5);

pub struct V4l2Source {
    device_path: String,
    resolution: Resolution,
    state: Option<DeviceState>,
    format: PixelFormat,
    active_width: u32,
    active_height: u32,
    frames_captured: u64,
    capture_errors: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(device_path: &str, resolution: Resolution) -> Self {
        Self {
            device_path: device_path.to_string(),
            resolution,
            state: None,
            format: PixelFormat::Rgb24,
            active_width: resolution.width,
            active_height: resolution.height,
            frames_captured: 0,
            capture_errors: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn record_error(&mut self, err: &anyhow::Error) {
        self.capture_errors += 1;
        self.last_error = Some(format!("{:#}", err));
    }
}

impl FrameSource for V4l2Source {
    fn start(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.device_path)
            .with_context(|| format!("open v4l2 device {}", self.device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.resolution.width;
        format.height = self.resolution.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set RGB3 on {}: {}",
                    self.device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.format = match &format.fourcc.repr {
            b"RGB3" => PixelFormat::Rgb24,
            b"NV12" => PixelFormat::Nv12,
            b"YUYV" => PixelFormat::Yuyv,
            other => {
                return Err(anyhow!(
                    "unsupported pixel format {} on {}",
                    String::from_utf8_lossy(other),
                    self.device_path
                ))
            }
        };
        self.active_width = format.width;
        self.active_height = format.height;
        if (format.width, format.height) != (self.resolution.width, self.resolution.height) {
            log::warn!(
                "V4l2Source: {} delivers {}x{} instead of {}x{}",
                self.device_path,
                format.width,
                format.height,
                self.resolution.width,
                self.resolution.height
            );
        }

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);
        self.last_error = None;

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            self.device_path,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state.take().is_some() {
            log::info!("V4l2Source: released {}", self.device_path);
        }
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.active_width, self.active_height, self.format);
        let result = match self.state.as_mut() {
            None => Err(anyhow!("v4l2 device {} not started", self.device_path)),
            Some(state) => state
                .with_mut(|fields| {
                    fields
                        .stream
                        .next()
                        .map(|(buf, _meta)| normalize_to_rgb(buf, width, height, format))
                })
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))
                .and_then(|pixels| pixels),
        };

        match result.and_then(|pixels| Frame::from_rgb(pixels, width, height, Local::now())) {
            Ok(frame) => {
                self.frames_captured += 1;
                self.last_frame_at = Some(Instant::now());
                self.last_error = None;
                Ok(frame)
            }
            Err(err) => {
                self.record_error(&err);
                Err(err)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        if self.state.is_none() || self.last_error.is_some() {
            return false;
        }
        self.last_frame_at
            .map(|at| at.elapsed() <= HEALTH_GRACE)
            .unwrap_or(true)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            capture_errors: self.capture_errors,
            url: self.device_path.clone(),
        }
    }
}
