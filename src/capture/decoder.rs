//! Raw capture formats to the RGB24 working colour space

use jpeg_decoder::Decoder;

use super::frame::{PixelFormat, RawFrame};
use crate::{Error, Result};

pub fn decode_frame(raw: &RawFrame) -> Result<Vec<u8>> {
    let pixels = (raw.width as usize) * (raw.height as usize);
    let data = &raw.data[..];

    let expected = match raw.format {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
        PixelFormat::Yuyv4 | PixelFormat::Uyvy => Some(pixels * 2),
        PixelFormat::Nv12 => Some(pixels + pixels / 2),
        PixelFormat::Grey => Some(pixels),
        PixelFormat::Mjpeg => None,
    };
    if let Some(expected) = expected {
        if data.len() < expected {
            return Err(Error::Decode(format!(
                "{:?} {}x{} frame truncated: {} of {} bytes",
                raw.format,
                raw.width,
                raw.height,
                data.len(),
                expected
            )));
        }
    }

    match raw.format {
        PixelFormat::Rgb24 => Ok(data[..pixels * 3].to_vec()),
        PixelFormat::Bgr24 => Ok(data[..pixels * 3]
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect()),
        PixelFormat::Grey => Ok(data[..pixels].iter().flat_map(|&y| [y, y, y]).collect()),
        PixelFormat::Yuyv4 => Ok(packed_422(&data[..pixels * 2], [0, 1, 2, 3])),
        PixelFormat::Uyvy => Ok(packed_422(&data[..pixels * 2], [1, 0, 3, 2])),
        PixelFormat::Nv12 => Ok(nv12(data, raw.width as usize, raw.height as usize)),
        PixelFormat::Mjpeg => mjpeg(data, raw.width, raw.height),
    }
}

/// `order` gives the byte offsets of Y0, U, Y1, V inside each macropixel.
fn packed_422(data: &[u8], order: [usize; 4]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (
            chunk[order[0]],
            chunk[order[1]],
            chunk[order[2]],
            chunk[order[3]],
        );
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    rgb
}

fn nv12(data: &[u8], width: usize, height: usize) -> Vec<u8> {
    let (luma, chroma) = data.split_at(width * height);
    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        for col in 0..width {
            let y = luma[row * width + col];
            let uv = (row / 2) * width + (col & !1);
            let (u, v) = match (chroma.get(uv), chroma.get(uv + 1)) {
                (Some(&u), Some(&v)) => (u, v),
                _ => (128, 128),
            };
            rgb.extend_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    rgb
}

fn mjpeg(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| Error::Decode(format!("mjpeg: {e}")))?;
    let info = decoder
        .info()
        .ok_or_else(|| Error::Decode("mjpeg: missing header".into()))?;

    if u32::from(info.width) != width || u32::from(info.height) != height {
        return Err(Error::Decode(format!(
            "mjpeg: expected {}x{}, got {}x{}",
            width, height, info.width, info.height
        )));
    }

    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => Ok(pixels),
        jpeg_decoder::PixelFormat::L8 => Ok(pixels.iter().flat_map(|&y| [y, y, y]).collect()),
        other => Err(Error::Decode(format!("mjpeg: unsupported {other:?}"))),
    }
}

/// BT.601 full range
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;

    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;

    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
