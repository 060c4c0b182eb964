//! Normalized regions of interest
//!
//! Coordinates are unit based: (0, 0) is the top-left corner of a frame and
//! (1, 1) the bottom-right one, whatever the frame's resolution.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Validated region of interest with ordered corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

impl Roi {
    pub const FULL: Roi = Roi {
        x1: 0.0,
        y1: 0.0,
        x2: 1.0,
        y2: 1.0,
    };

    /// Corners may come in any order; every coordinate must lie in [0, 1].
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Result<Self> {
        for (name, value) in [("x1", x1), ("y1", y1), ("x2", x2), ("y2", y2)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidRoi(format!("{name} = {value} outside [0, 1]")));
            }
        }
        Ok(Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        })
    }

    pub fn from_slice(coords: &[f64]) -> Result<Self> {
        match *coords {
            [x1, y1, x2, y2] => Self::new(x1, y1, x2, y2),
            _ => Err(Error::InvalidRoi(format!(
                "expected 4 coordinates, got {}",
                coords.len()
            ))),
        }
    }

    pub fn get(&self) -> (f64, f64, f64, f64) {
        (self.x1, self.y1, self.x2, self.y2)
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.x1, self.y1, self.x2, self.y2]
    }

    /// Pixel window `(x0, y0, x1, y1)`, end exclusive, for a frame of the given
    /// size. `None` when the window would be empty.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let (w, h) = (f64::from(width), f64::from(height));
        let x0 = ((self.x1 * w) as u32).min(width);
        let x1 = ((self.x2 * w) as u32).min(width);
        let y0 = ((self.y1 * h) as u32).min(height);
        let y1 = ((self.y2 * h) as u32).min(height);

        (x0 < x1 && y0 < y1).then_some((x0, y0, x1, y1))
    }
}

impl Default for Roi {
    fn default() -> Self {
        Self::FULL
    }
}

/// Rectangle dragged out by a pointer.
///
/// `set_start` anchors both corners at the press point, `set_end` moves the
/// second corner while dragging. [`Rectangle::get`] always reports the
/// top-left corner first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rectangle {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

impl Default for Rectangle {
    fn default() -> Self {
        Self {
            x1: 0.0,
            y1: 0.0,
            x2: 1.0,
            y2: 1.0,
        }
    }
}

impl Rectangle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_start(&mut self, x: f64, y: f64) {
        let (x, y) = (clamp_unit(x), clamp_unit(y));
        self.x1 = x;
        self.x2 = x;
        self.y1 = y;
        self.y2 = y;
    }

    pub fn set_end(&mut self, x: f64, y: f64) {
        self.x2 = clamp_unit(x);
        self.y2 = clamp_unit(y);
    }

    pub fn get(&self) -> (f64, f64, f64, f64) {
        (
            self.x1.min(self.x2),
            self.y1.min(self.y2),
            self.x1.max(self.x2),
            self.y1.max(self.y2),
        )
    }

    pub fn to_roi(&self) -> Roi {
        let (x1, y1, x2, y2) = self.get();
        Roi { x1, y1, x2, y2 }
    }

    /// Pixel position inside a `width` x `height` view to unit coordinates.
    pub fn normalize_point(x: f64, y: f64, width: u32, height: u32) -> (f64, f64) {
        let scale = |value: f64, extent: u32| {
            if extent == 0 {
                0.0
            } else {
                clamp_unit(value / f64::from(extent))
            }
        };
        (scale(x, width), scale(y, height))
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
