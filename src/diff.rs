//! Frame difference primitives
//!
//! The fast test crops both frames to the ROI, takes the per-channel absolute
//! difference, binarizes it and measures the fraction of changed pixels. The
//! optional grid test splits the same window into cells and compares mean
//! cell differences, which is stricter but slower.

use crate::capture::Frame;
use crate::rectangle::Roi;
use crate::{ClassifierConfig, GridConfig};

/// Tuning shared by every comparison of a classification cycle.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub binarize_threshold: u8,
    pub grid: Option<GridConfig>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self::from(&ClassifierConfig::default())
    }
}

impl From<&ClassifierConfig> for DiffOptions {
    fn from(config: &ClassifierConfig) -> Self {
        Self {
            binarize_threshold: config.binarize_threshold,
            grid: config.grid.clone(),
        }
    }
}

/// Single channel image, 255 where the frames differ.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffMask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl DiffMask {
    pub fn differing(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    /// Fraction of changed pixels, in [0, 1].
    pub fn factor(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.differing() as f64 / self.data.len() as f64
    }
}

#[derive(Debug, Clone)]
pub struct Comparison {
    pub equal: bool,
    pub factor: f64,
    pub grid_factor: Option<f64>,
    /// Absent when the frames could not be compared
    pub mask: Option<DiffMask>,
}

/// Per-channel absolute difference of the ROI window of two frames.
#[derive(Debug, Clone)]
pub struct AbsDiff {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<u8>,
}

/// Pixel window for `roi`; a missing or empty ROI covers the whole frame.
fn window(frame: &Frame, roi: Option<&Roi>) -> (u32, u32, u32, u32) {
    roi.and_then(|roi| roi.pixel_bounds(frame.width(), frame.height()))
        .unwrap_or((0, 0, frame.width(), frame.height()))
}

/// `None` when the frames differ in geometry or a buffer is short.
pub fn abs_diff(a: &Frame, b: &Frame, roi: Option<&Roi>) -> Option<AbsDiff> {
    if a.width() != b.width() || a.height() != b.height() || a.channels() != b.channels() {
        return None;
    }
    let channels = a.channels() as usize;
    let stride = a.width() as usize * channels;
    let needed = stride * a.height() as usize;
    if a.data.len() < needed || b.data.len() < needed {
        return None;
    }

    let (x0, y0, x1, y1) = window(a, roi);
    let (start, end) = (x0 as usize * channels, x1 as usize * channels);
    let mut data = Vec::with_capacity((end - start) * (y1 - y0) as usize);
    for row in y0 as usize..y1 as usize {
        let offset = row * stride;
        let row_a = &a.data[offset + start..offset + end];
        let row_b = &b.data[offset + start..offset + end];
        data.extend(row_a.iter().zip(row_b).map(|(&p, &q)| p.abs_diff(q)));
    }

    Some(AbsDiff {
        width: x1 - x0,
        height: y1 - y0,
        channels: channels as u32,
        data,
    })
}

/// A pixel is set when any of its channels differs by more than `threshold`.
pub fn binarize(diff: &AbsDiff, threshold: u8) -> DiffMask {
    let data = diff
        .data
        .chunks_exact(diff.channels.max(1) as usize)
        .map(|px| if px.iter().any(|&v| v > threshold) { 255 } else { 0 })
        .collect();
    DiffMask {
        width: diff.width,
        height: diff.height,
        data,
    }
}

/// Mean absolute difference per cell of a `rows` x `cols` grid, row major.
/// Pixels past the last whole cell are ignored.
pub fn grid_diff(diff: &AbsDiff, rows: usize, cols: usize) -> Vec<f64> {
    let (width, height) = (diff.width as usize, diff.height as usize);
    let channels = diff.channels.max(1) as usize;
    if rows == 0 || cols == 0 || height / rows == 0 || width / cols == 0 {
        return Vec::new();
    }
    let (cell_h, cell_w) = (height / rows, width / cols);
    let cell_len = (cell_h * cell_w * channels) as f64;

    let mut grid = vec![0.0; rows * cols];
    for (index, cell) in grid.iter_mut().enumerate() {
        let (row, col) = (index / cols, index % cols);
        let mut sum = 0u64;
        for y in row * cell_h..(row + 1) * cell_h {
            let from = (y * width + col * cell_w) * channels;
            let to = from + cell_w * channels;
            sum += diff.data[from..to].iter().map(|&v| u64::from(v)).sum::<u64>();
        }
        *cell = sum as f64 / cell_len;
    }
    grid
}

/// Fraction of grid cells whose mean difference exceeds `cell_threshold`.
pub fn grid_diff_factor(grid: &[f64], cell_threshold: f64) -> f64 {
    if grid.is_empty() {
        return 0.0;
    }
    grid.iter().filter(|&&cell| cell > cell_threshold).count() as f64 / grid.len() as f64
}

/// Frames count as equal when their diff factor stays below `threshold`
/// and, with a grid configured, the grid test agrees.
pub fn equal(
    a: &Frame,
    b: &Frame,
    threshold: f64,
    roi: Option<&Roi>,
    options: &DiffOptions,
) -> Comparison {
    let Some(diff) = abs_diff(a, b, roi) else {
        return Comparison {
            equal: false,
            factor: 1.0,
            grid_factor: None,
            mask: None,
        };
    };

    let mask = binarize(&diff, options.binarize_threshold);
    let factor = mask.factor();
    let mut equal = factor < threshold;

    let grid_factor = match &options.grid {
        Some(grid) if equal => {
            let cells = grid_diff(&diff, grid.rows, grid.cols);
            let grid_factor = grid_diff_factor(&cells, grid.cell_threshold);
            equal = grid_factor < grid.grid_threshold;
            Some(grid_factor)
        }
        _ => None,
    };

    Comparison {
        equal,
        factor,
        grid_factor,
        mask: Some(mask),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Local;

    use super::*;
    use crate::capture::PixelFormat;

    fn frame_from(width: u32, height: u32, pixel: impl Fn(u32, u32) -> u8) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = pixel(x, y);
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::new(data, width, height, PixelFormat::Rgb24, 0, Local::now())
    }

    fn opts() -> DiffOptions {
        DiffOptions::default()
    }

    #[test]
    fn identical_frames_are_equal_for_any_roi() {
        let frame = frame_from(40, 30, |x, y| ((x * 7 + y * 3) % 256) as u8);
        let rois = [
            None,
            Some(Roi::FULL),
            Some(Roi::new(0.1, 0.2, 0.6, 0.9).unwrap()),
            Some(Roi::new(0.5, 0.5, 0.5, 0.5).unwrap()),
        ];
        for roi in rois {
            for threshold in [1e-9, 0.01, 0.5] {
                let cmp = equal(&frame, &frame, threshold, roi.as_ref(), &opts());
                assert!(cmp.equal);
                assert_eq!(cmp.factor, 0.0);
            }
        }
    }

    #[test]
    fn restricting_roi_never_adds_changed_pixels() {
        let a = frame_from(50, 40, |_, _| 0);
        let b = frame_from(50, 40, |x, y| if (x + y) % 3 == 0 { 255 } else { 0 });
        let full = binarize(&abs_diff(&a, &b, None).unwrap(), 100).differing();

        for roi in [
            Roi::new(0.0, 0.0, 0.5, 0.5).unwrap(),
            Roi::new(0.2, 0.1, 0.9, 0.7).unwrap(),
            Roi::new(0.9, 0.9, 1.0, 1.0).unwrap(),
        ] {
            let restricted = binarize(&abs_diff(&a, &b, Some(&roi)).unwrap(), 100).differing();
            assert!(restricted <= full);
        }
    }

    #[test]
    fn roi_excludes_changes_outside_it() {
        let a = frame_from(20, 20, |_, _| 10);
        // left half changes
        let b = frame_from(20, 20, |x, _| if x < 10 { 250 } else { 10 });

        let whole = equal(&a, &b, 0.3, None, &opts());
        assert!(!whole.equal);
        assert!((whole.factor - 0.5).abs() < 1e-9);

        let right = Roi::new(0.5, 0.0, 1.0, 1.0).unwrap();
        let cmp = equal(&a, &b, 0.3, Some(&right), &opts());
        assert!(cmp.equal);
        assert_eq!(cmp.mask.unwrap().width, 10);
    }

    #[test]
    fn small_differences_are_binarized_away() {
        let a = frame_from(10, 10, |_, _| 100);
        let b = frame_from(10, 10, |_, _| 180);
        let cmp = equal(&a, &b, 0.5, None, &opts());
        assert_eq!(cmp.factor, 0.0);
        assert!(cmp.equal);
    }

    #[test]
    fn mismatched_geometry_is_never_equal() {
        let a = frame_from(10, 10, |_, _| 0);
        let b = frame_from(12, 10, |_, _| 0);
        let cmp = equal(&a, &b, 0.5, None, &opts());
        assert!(!cmp.equal);
        assert!(cmp.mask.is_none());
    }

    #[test]
    fn grid_flags_a_localized_change() {
        let a = frame_from(20, 20, |_, _| 0);
        // one 4x4 blob inside the top-left cell of a 5x5 grid
        let b = frame_from(20, 20, |x, y| if x < 4 && y < 4 { 255 } else { 0 });
        let diff = abs_diff(&a, &b, None).unwrap();

        let cells = grid_diff(&diff, 5, 5);
        assert_eq!(cells.len(), 25);
        assert_eq!(cells[0], 255.0);
        assert!(cells[1..].iter().all(|&c| c == 0.0));
        assert!((grid_diff_factor(&cells, 10.0) - 1.0 / 25.0).abs() < 1e-9);
    }

    #[test]
    fn grid_stage_can_veto_the_fast_test() {
        let a = frame_from(20, 20, |_, _| 0);
        let b = frame_from(20, 20, |x, y| if x < 4 && y < 4 { 255 } else { 0 });
        let strict = DiffOptions {
            binarize_threshold: 100,
            grid: Some(GridConfig {
                rows: 5,
                cols: 5,
                cell_threshold: 10.0,
                grid_threshold: 0.01,
            }),
        };

        assert!(equal(&a, &b, 0.5, None, &opts()).equal);
        let cmp = equal(&a, &b, 0.5, None, &strict);
        assert!(!cmp.equal);
        assert!(cmp.grid_factor.is_some());
    }

    #[test]
    fn tiny_window_has_no_grid() {
        let a = frame_from(3, 3, |_, _| 0);
        let diff = abs_diff(&a, &a, None).unwrap();
        assert!(grid_diff(&diff, 10, 5).is_empty());
        assert_eq!(grid_diff_factor(&[], 1.0), 0.0);
    }
}
