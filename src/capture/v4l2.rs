//! V4L2 capture backend with memory-mapped streaming

use std::io;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC, Fraction};

use super::{Attribute, CaptureBackend, PixelFormat, RawFrame};
use crate::{Error, Result};

// linux/v4l2-controls.h
const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_CONTRAST: u32 = 0x0098_0901;
const CID_GAIN: u32 = 0x0098_0913;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_FOCUS_ABSOLUTE: u32 = 0x009a_090a;
const CID_FOCUS_AUTO: u32 = 0x009a_090c;

/// V4L2 device, streamed lazily so format changes stay cheap
pub struct V4l2Backend {
    device: Option<Box<Device>>,
    stream: Option<MmapStream<'static>>,
    path: Option<String>,
    buffer_count: u32,
}

impl V4l2Backend {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            device: None,
            stream: None,
            path: None,
            buffer_count: buffer_count.max(1),
        }
    }

    fn device(&self) -> Result<&Device> {
        self.device
            .as_deref()
            .ok_or(Error::NotStarted("v4l2 device"))
    }

    fn control_id(attribute: Attribute) -> Option<u32> {
        match attribute {
            Attribute::Autofocus => Some(CID_FOCUS_AUTO),
            Attribute::Focus => Some(CID_FOCUS_ABSOLUTE),
            Attribute::Exposure => Some(CID_EXPOSURE_ABSOLUTE),
            Attribute::Brightness => Some(CID_BRIGHTNESS),
            Attribute::Contrast => Some(CID_CONTRAST),
            Attribute::Gain => Some(CID_GAIN),
            Attribute::PixelFormat | Attribute::Width | Attribute::Height | Attribute::Fps => None,
        }
    }

    fn set_format_field(&mut self, attribute: Attribute, value: i64) -> Result<bool> {
        // Buffers are sized for the old format
        self.stream = None;
        let device = self.device()?;

        if attribute == Attribute::Fps {
            let mut params = device.params()?;
            params.interval = Fraction::new(1, value.max(1) as u32);
            let applied = device.set_params(&params)?;
            return Ok(applied.interval.numerator == 1
                && i64::from(applied.interval.denominator) == value);
        }

        let mut fmt = device.format()?;
        match attribute {
            Attribute::Width => fmt.width = value as u32,
            Attribute::Height => fmt.height = value as u32,
            Attribute::PixelFormat => fmt.fourcc = FourCC::from(value as u32),
            _ => return Ok(false),
        }
        let applied = device.set_format(&fmt)?;
        Ok(match attribute {
            Attribute::Width => i64::from(applied.width) == value,
            Attribute::Height => i64::from(applied.height) == value,
            _ => i64::from(u32::from(applied.fourcc)) == value,
        })
    }
}

impl CaptureBackend for V4l2Backend {
    #[instrument(skip(self))]
    fn open(&mut self, path: &str) -> Result<()> {
        self.close();

        let device = Device::with_path(path).map_err(|e| Error::DeviceOpenFailure {
            path: path.into(),
            reason: e.to_string(),
        })?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::DeviceOpenFailure {
                path: path.into(),
                reason: "device doesn't support video capture".into(),
            });
        }

        self.device = Some(Box::new(device));
        self.path = Some(path.into());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn set_attribute(&mut self, attribute: Attribute, value: i64) -> Result<bool> {
        let Some(id) = Self::control_id(attribute) else {
            return self.set_format_field(attribute, value);
        };
        let value = match attribute {
            Attribute::Autofocus => Value::Boolean(value != 0),
            _ => Value::Integer(value),
        };
        match self.device()?.set_control(Control { id, value }) {
            Ok(()) => Ok(true),
            // Control missing or locked by another mode (e.g. focus while autofocus is on)
            Err(e) if matches!(
                e.raw_os_error(),
                Some(libc::EINVAL | libc::EACCES | libc::EBUSY)
            ) =>
            {
                debug!("{:?} refused: {}", attribute, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_attribute(&mut self, attribute: Attribute) -> Result<Option<i64>> {
        let device = self.device()?;
        let Some(id) = Self::control_id(attribute) else {
            let fmt = device.format()?;
            return Ok(Some(match attribute {
                Attribute::Width => i64::from(fmt.width),
                Attribute::Height => i64::from(fmt.height),
                Attribute::PixelFormat => i64::from(u32::from(fmt.fourcc)),
                _ => {
                    let params = device.params()?;
                    if params.interval.numerator == 0 {
                        return Ok(None);
                    }
                    i64::from(params.interval.denominator / params.interval.numerator)
                }
            }));
        };
        match device.control(id) {
            Ok(control) => Ok(match control.value {
                Value::Integer(v) => Some(v),
                Value::Boolean(b) => Some(i64::from(b)),
                _ => None,
            }),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.stream.is_none() {
            let stream =
                MmapStream::with_buffers(self.device()?, Type::VideoCapture, self.buffer_count)?;
            self.stream = Some(stream);
            info!("Capture stream started with {} buffers", self.buffer_count);
        }

        let fmt = self.device()?.format()?;
        let Some(format) = PixelFormat::from_code(u32::from(fmt.fourcc)) else {
            return Err(Error::Decode(format!("unsupported fourcc {}", fmt.fourcc)));
        };

        let stream = self
            .stream
            .as_mut()
            .ok_or(Error::NotStarted("v4l2 stream"))?;
        let (buf, meta) = stream.next().map_err(|e| {
            Error::DeviceMalfunction(format!("{}: {e}", self.path.as_deref().unwrap_or("?")))
        })?;

        if meta.bytesused == 0 {
            return Ok(None);
        }
        let used = (meta.bytesused as usize).min(buf.len());

        Ok(Some(RawFrame {
            data: Bytes::copy_from_slice(&buf[..used]),
            width: fmt.width,
            height: fmt.height,
            format,
        }))
    }

    fn close(&mut self) {
        // Stream must be dropped before the device it maps
        self.stream = None;
        if self.device.take().is_some() {
            info!("Closed {:?}", self.path.take());
        }
    }
}
