use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageBuffer, ImageEncoder, Rgb};
use serde::{Deserialize, Serialize};

use crate::classifier::ClassificationState;
use crate::{Error, Result};

/// Timestamp layout used for frame file names.
pub const TIMESTAMP_FORMAT: &str = "%F_%H-%M-%S-%6f";

/// Frame in the working colour space.
///
/// Pixel data is immutable and reference counted, so clones are cheap and
/// never observe a later sampling cycle. Use [`Frame::deep_copy`] when a
/// private buffer is needed.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Bytes,
    pub meta: Arc<FrameMetadata>,
    /// Wall-clock capture time
    pub timestamp: DateTime<Local>,
    /// Classification tag, set by the classifier
    pub state: Option<ClassificationState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Frame exactly as delivered by a capture backend.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Uyvy,
    Mjpeg,
    Nv12,
    Grey,
}

impl PixelFormat {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Yuyv4 => *b"YUYV",
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Grey => *b"GREY",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"YUYV" | b"YUY2" => Some(PixelFormat::Yuyv4),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"NV12" => Some(PixelFormat::Nv12),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    /// Little-endian packed fourcc, as V4L2 stores it.
    pub fn code(self) -> u32 {
        u32::from_le_bytes(self.fourcc())
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::from_fourcc(&code.to_le_bytes())
    }

    /// Interleaved channel count once decoded. Only meaningful for formats
    /// a [`Frame`] can hold.
    pub fn channels(self) -> u32 {
        match self {
            PixelFormat::Grey => 1,
            _ => 3,
        }
    }
}

impl Frame {
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
        timestamp: DateTime<Local>,
    ) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format,
            }),
            timestamp,
            state: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn channels(&self) -> u32 {
        self.meta.format.channels()
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Copy that shares no pixel storage with `self`.
    pub fn deep_copy(&self) -> Self {
        Self {
            data: Bytes::copy_from_slice(&self.data),
            meta: Arc::new(FrameMetadata::clone(&self.meta)),
            timestamp: self.timestamp,
            state: self.state,
        }
    }

    pub fn with_state(mut self, state: ClassificationState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Single channel luma copy of an RGB frame. Grey frames are returned as is.
    pub fn to_greyscale(&self) -> Result<Self> {
        if self.meta.format == PixelFormat::Grey {
            return Ok(self.clone());
        }
        let rgb = ImageBuffer::<Rgb<u8>, _>::from_raw(self.width(), self.height(), &self.data[..])
            .ok_or_else(|| {
                Error::Decode(format!(
                    "{}x{} buffer holds {} bytes",
                    self.width(),
                    self.height(),
                    self.data.len()
                ))
            })?;
        let luma = image::imageops::grayscale(&rgb);

        Ok(Self {
            data: Bytes::from(luma.into_raw()),
            meta: Arc::new(FrameMetadata {
                format: PixelFormat::Grey,
                ..FrameMetadata::clone(&self.meta)
            }),
            timestamp: self.timestamp,
            state: self.state,
        })
    }

    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let color = match self.meta.format {
            PixelFormat::Grey => ExtendedColorType::L8,
            PixelFormat::Rgb24 => ExtendedColorType::Rgb8,
            other => return Err(Error::Decode(format!("cannot encode {other:?} as jpeg"))),
        };
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality).write_image(
            &self.data,
            self.width(),
            self.height(),
            color,
        )?;
        Ok(out)
    }
}
