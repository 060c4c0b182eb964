use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::rectangle::Roi;
use crate::{CaptureDefaults, Result};

/// Desired state of one camera. `None` fields keep the previous value, or
/// the device default when there never was one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraManagerConfig {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub autofocus: Option<bool>,
    pub focus: Option<i64>,
    /// Run the classifier and tag frames with their state
    pub filter: Option<bool>,
    /// `[x1, y1, x2, y2]` in unit coordinates
    pub roi: Option<Vec<f64>>,
}

impl CameraManagerConfig {
    /// Fields explicitly set in `newer` win over those of `self`.
    pub fn merge(&self, newer: &CameraManagerConfig) -> CameraManagerConfig {
        CameraManagerConfig {
            width: newer.width.or(self.width),
            height: newer.height.or(self.height),
            autofocus: newer.autofocus.or(self.autofocus),
            focus: newer.focus.or(self.focus),
            filter: newer.filter.or(self.filter),
            roi: newer.roi.clone().or_else(|| self.roi.clone()),
        }
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter.unwrap_or(false)
    }

    /// Validated ROI, `Ok(None)` when unset.
    pub fn roi(&self) -> Result<Option<Roi>> {
        self.roi.as_deref().map(Roi::from_slice).transpose()
    }

    /// Whether moving from `self` to `next` needs the device reopened.
    pub fn geometry_differs(&self, next: &CameraManagerConfig) -> bool {
        self.width != next.width || self.height != next.height
    }

    pub fn to_capture_config(&self, device: &str, defaults: &CaptureDefaults) -> CaptureConfig {
        CaptureConfig {
            device: Some(device.to_string()),
            pixel_format: defaults.pixel_format,
            width: self.width,
            height: self.height,
            fps: defaults.fps,
            autofocus: self.autofocus,
            focus: self.focus,
            ..Default::default()
        }
    }
}
