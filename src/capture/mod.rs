pub mod decoder;
pub mod frame;
#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use frame::{Frame, FrameMetadata, PixelFormat, RawFrame};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Backend;

use crate::{Error, Result};

/// Device attributes a capture backend may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    PixelFormat,
    Width,
    Height,
    Fps,
    Autofocus,
    Focus,
    Exposure,
    Brightness,
    Contrast,
    Gain,
}

/// Driver level access to one capture device.
///
/// Attribute values travel as `i64`: booleans are 0/1 and the pixel format
/// is its packed fourcc code.
pub trait CaptureBackend: Send {
    fn open(&mut self, path: &str) -> Result<()>;
    fn is_open(&self) -> bool;
    /// Returns false when the device refused the value.
    fn set_attribute(&mut self, attribute: Attribute, value: i64) -> Result<bool>;
    fn get_attribute(&mut self, attribute: Attribute) -> Result<Option<i64>>;
    /// `Ok(None)` means the device had nothing to deliver.
    fn read_frame(&mut self) -> Result<Option<RawFrame>>;
    fn close(&mut self);
}

/// Requested device configuration. `None` leaves the device's current value
/// in place; it is read back into [`CaptureSource::applied_config`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: Option<String>,
    pub pixel_format: Option<PixelFormat>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub autofocus: Option<bool>,
    pub focus: Option<i64>,
    pub exposure: Option<i64>,
    pub brightness: Option<i64>,
    pub contrast: Option<i64>,
    pub gain: Option<i64>,
}

struct AttributeField {
    attribute: Attribute,
    get: fn(&CaptureConfig) -> Option<i64>,
    set: fn(&mut CaptureConfig, Option<i64>),
}

fn to_u32(value: Option<i64>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

/// Applied in order: format and geometry before controls.
const ATTRIBUTE_FIELDS: &[AttributeField] = &[
    AttributeField {
        attribute: Attribute::PixelFormat,
        get: |c| c.pixel_format.map(|f| i64::from(f.code())),
        set: |c, v| c.pixel_format = to_u32(v).and_then(PixelFormat::from_code),
    },
    AttributeField {
        attribute: Attribute::Width,
        get: |c| c.width.map(i64::from),
        set: |c, v| c.width = to_u32(v),
    },
    AttributeField {
        attribute: Attribute::Height,
        get: |c| c.height.map(i64::from),
        set: |c, v| c.height = to_u32(v),
    },
    AttributeField {
        attribute: Attribute::Fps,
        get: |c| c.fps.map(i64::from),
        set: |c, v| c.fps = to_u32(v),
    },
    AttributeField {
        attribute: Attribute::Autofocus,
        get: |c| c.autofocus.map(i64::from),
        set: |c, v| c.autofocus = v.map(|v| v != 0),
    },
    AttributeField {
        attribute: Attribute::Focus,
        get: |c| c.focus,
        set: |c, v| c.focus = v,
    },
    AttributeField {
        attribute: Attribute::Exposure,
        get: |c| c.exposure,
        set: |c, v| c.exposure = v,
    },
    AttributeField {
        attribute: Attribute::Brightness,
        get: |c| c.brightness,
        set: |c, v| c.brightness = v,
    },
    AttributeField {
        attribute: Attribute::Contrast,
        get: |c| c.contrast,
        set: |c, v| c.contrast = v,
    },
    AttributeField {
        attribute: Attribute::Gain,
        get: |c| c.gain,
        set: |c, v| c.gain = v,
    },
];

/// An opened (or openable) device plus the configuration it effectively runs with.
pub struct CaptureSource {
    backend: Box<dyn CaptureBackend>,
    applied: CaptureConfig,
}

impl CaptureSource {
    pub fn new(backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            applied: CaptureConfig::default(),
        }
    }

    pub fn applied_config(&self) -> &CaptureConfig {
        &self.applied
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_open()
    }

    /// Open the device when needed and push every set attribute to it.
    ///
    /// The device is only (re)opened when the requested path differs from
    /// the current one or nothing is open yet. Returns `Ok(false)` when the
    /// device cannot be opened.
    #[instrument(skip(self), fields(device = ?config.device))]
    pub fn apply_config(&mut self, config: &CaptureConfig) -> Result<bool> {
        let device = match (&config.device, &self.applied.device) {
            (Some(device), _) => device.clone(),
            (None, Some(current)) => current.clone(),
            (None, None) => return Err(Error::NotStarted("capture source")),
        };

        if Some(&device) != self.applied.device.as_ref() || !self.backend.is_open() {
            if self.backend.is_open() {
                self.backend.close();
            }
            if let Err(e) = self.backend.open(&device) {
                warn!("Opening capture {} failed: {}", device, e);
                self.applied = CaptureConfig::default();
                return Ok(false);
            }
            info!("Opened capture {}", device);
            self.applied.device = Some(device.clone());
        }

        for field in ATTRIBUTE_FIELDS {
            let requested = (field.get)(config);
            let value = match requested {
                Some(value) => match self.backend.set_attribute(field.attribute, value) {
                    Ok(true) => Some(value),
                    Ok(false) => {
                        debug!("{} refused {:?} = {}", device, field.attribute, value);
                        self.backend.get_attribute(field.attribute)?
                    }
                    Err(e) => {
                        warn!("{} failed to set {:?}: {}", device, field.attribute, e);
                        self.backend.get_attribute(field.attribute)?
                    }
                },
                None => self.backend.get_attribute(field.attribute)?,
            };
            (field.set)(&mut self.applied, value);
        }

        debug!("Applied capture config {:?}", self.applied);
        Ok(true)
    }

    pub fn read_frame(&mut self) -> Result<Option<RawFrame>> {
        if !self.backend.is_open() {
            return Err(Error::NotStarted("capture source"));
        }
        self.backend.read_frame()
    }

    /// Release the device. Safe to call more than once.
    pub fn close(&mut self) {
        if self.backend.is_open() {
            info!("Releasing capture {:?}", self.applied.device);
            self.backend.close();
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}
