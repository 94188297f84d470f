use std::sync::Arc;

use super::{ActiveCapture, CaptureDevice, CaptureOptions, FrameSink, Permission};
use crate::error::AudioError;

/// Owns at most one running capture on a device.
///
/// `stop` is idempotent and safe before `start`; dropping the unit stops
/// the device as well.
pub struct CaptureUnit {
    device: Arc<dyn CaptureDevice>,
    options: CaptureOptions,
    active: Option<Box<dyn ActiveCapture>>,
}

impl CaptureUnit {
    pub fn new(device: Arc<dyn CaptureDevice>, options: CaptureOptions) -> Self {
        Self {
            device,
            options,
            active: None,
        }
    }

    pub async fn request_permission(&self) -> Result<Permission, AudioError> {
        self.device.request_permission().await
    }

    /// Start delivering frames to `sink`. A capture that is already running
    /// is kept as is.
    pub fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), AudioError> {
        if self.active.is_some() {
            log::warn!("Capture already running, ignoring start");
            return Ok(());
        }
        let capture = self.device.open(&self.options, sink)?;
        log::info!(
            "Capture started: frame_samples={}, aec={}, ns={}, agc={}",
            self.options.frame_samples,
            self.options.echo_cancellation,
            self.options.noise_suppression,
            self.options.auto_gain_control,
        );
        self.active = Some(capture);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut capture) = self.active.take() {
            capture.stop();
            log::info!("Capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for CaptureUnit {
    fn drop(&mut self) {
        self.stop();
    }
}
