//! One physical device and the pipeline reading it

use tracing::{debug, info, instrument, warn};

use super::config::CameraManagerConfig;
use crate::capture::{CaptureBackend, CaptureConfig, CaptureSource, Frame};
use crate::classifier::{ClassificationState, FrameClassifier};
use crate::sampler::FrameSampler;
use crate::{CaptureDefaults, Error, Result};

/// Sampler and classifier pair bound to one opened device.
pub struct ManagedCamera {
    serial: String,
    path: String,
    /// Last configuration applied, `None` when running on device defaults
    config: Option<CameraManagerConfig>,
    filter: bool,
    sampler: FrameSampler,
    classifier: FrameClassifier,
}

impl ManagedCamera {
    /// Open `path` with `config` applied and start sampling.
    #[instrument(skip(config, backend, defaults))]
    pub async fn start(
        serial: &str,
        path: &str,
        config: Option<CameraManagerConfig>,
        backend: Box<dyn CaptureBackend>,
        defaults: &CaptureDefaults,
    ) -> Result<Self> {
        let desired = config.clone().unwrap_or_default();
        let capture = desired.to_capture_config(path, defaults);

        let mut source = CaptureSource::new(backend);
        let (source, opened) = tokio::task::spawn_blocking(move || {
            let opened = source.apply_config(&capture);
            (source, opened)
        })
        .await
        .map_err(|e| Error::DeviceOpenFailure {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        if !opened? {
            return Err(Error::DeviceOpenFailure {
                path: path.to_string(),
                reason: "device did not open".into(),
            });
        }
        debug!("{} opened with {:?}", path, source.applied_config());

        let sampler = FrameSampler::spawn(serial);
        sampler.start(source).await?;
        let classifier = FrameClassifier::spawn(serial);

        let mut camera = Self {
            serial: serial.to_string(),
            path: path.to_string(),
            config: None,
            filter: false,
            sampler,
            classifier,
        };

        match desired.roi() {
            Ok(roi) => camera.classifier.set_roi(roi).await?,
            Err(e) => warn!("{}: ignoring roi: {}", serial, e),
        }
        if desired.filter_enabled() {
            camera.set_filter(true).await?;
        }
        camera.config = config;

        info!("Camera {} started on {}", serial, path);
        Ok(camera)
    }

    pub async fn stop(self) -> Result<()> {
        self.classifier.stop().await?;
        self.sampler.stop().await?;
        info!("Camera {} stopped", self.serial);
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn config(&self) -> Option<&CameraManagerConfig> {
        self.config.as_ref()
    }

    /// Reopening is needed when the device node or the frame geometry changes.
    pub fn needs_restart(&self, path: &str, next: &CameraManagerConfig) -> bool {
        if self.path != path {
            return true;
        }
        match &self.config {
            Some(current) => current.geometry_differs(next),
            None => true,
        }
    }

    /// Apply every field of `next` that differs from the running
    /// configuration without reopening the device. Returns how many fields
    /// were updated.
    #[instrument(skip(self, next), fields(serial = %self.serial))]
    pub async fn update(&mut self, next: CameraManagerConfig) -> Result<usize> {
        let current = self.config.clone().unwrap_or_default();
        let mut applied = current.clone();
        let mut updated = 0;

        if next.autofocus != current.autofocus {
            if let Some(enabled) = next.autofocus {
                self.set_autofocus(enabled).await?;
                updated += 1;
            }
            applied.autofocus = next.autofocus;
        }
        if next.focus != current.focus {
            if let Some(focus) = next.focus {
                self.set_focus(focus).await?;
                updated += 1;
            }
            applied.focus = next.focus;
        }
        if next.filter != current.filter {
            self.set_filter(next.filter_enabled()).await?;
            applied.filter = next.filter;
            updated += 1;
        }
        if next.roi != current.roi {
            match next.roi() {
                Ok(roi) => {
                    self.set_roi(roi).await?;
                    applied.roi = next.roi.clone();
                    updated += 1;
                }
                Err(e) => warn!("{}: roi update rejected: {}", self.serial, e),
            }
        }

        applied.width = next.width;
        applied.height = next.height;
        self.config = Some(applied);
        Ok(updated)
    }

    pub async fn set_autofocus(&self, enabled: bool) -> Result<bool> {
        self.apply(CaptureConfig {
            autofocus: Some(enabled),
            ..self.capture_base()
        })
        .await
    }

    pub async fn set_focus(&self, focus: i64) -> Result<bool> {
        self.apply(CaptureConfig {
            focus: Some(focus),
            ..self.capture_base()
        })
        .await
    }

    /// Turning the filter on takes the visible frame as the new background.
    pub async fn set_filter(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.filter {
            return Ok(());
        }
        if enabled {
            self.reset_filter().await?;
            self.classifier.start(self.sampler.reader()).await?;
        } else {
            self.classifier.stop().await?;
        }
        self.filter = enabled;
        debug!("{}: filter {}", self.serial, if enabled { "on" } else { "off" });
        Ok(())
    }

    /// Use the current frame as the classifier's base frame.
    pub async fn reset_filter(&self) -> Result<()> {
        let frame = match self.sampler.get_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{}: no frame for base: {}", self.serial, e);
                None
            }
        };
        self.classifier.set_base_frame(frame).await
    }

    pub async fn set_roi(&self, roi: Option<crate::Roi>) -> Result<()> {
        self.classifier.set_roi(roi).await
    }

    /// Classified frame when filtering, otherwise the plain sampled frame.
    pub fn get_frame(&self) -> Result<Option<Frame>> {
        if self.filter {
            Ok(self.classifier.get_frame())
        } else {
            self.sampler.get_frame()
        }
    }

    pub fn get_state(&self) -> ClassificationState {
        self.classifier.get_state()
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.is_running()
    }

    fn capture_base(&self) -> CaptureConfig {
        CaptureConfig {
            device: Some(self.path.clone()),
            ..Default::default()
        }
    }

    async fn apply(&self, config: CaptureConfig) -> Result<bool> {
        self.sampler.apply_config(config).await
    }
}
