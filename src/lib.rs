pub mod capture;
pub mod classifier;
pub mod diff;
mod error;
pub mod manager;
pub mod rectangle;
pub mod sampler;
pub mod watcher;

use std::collections::HashMap;
use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use classifier::{ClassificationState, FrameClassifier};
pub use error::{Error, Result};
pub use manager::{CameraManagerConfig, DeviceManager, Status};
pub use rectangle::{Rectangle, Roi};
pub use sampler::FrameSampler;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureDefaults,
    pub classifier: ClassifierConfig,
    pub watcher: WatcherConfig,
    pub output: OutputConfig,
    /// Desired camera configurations, one `[[cameras]]` table per serial
    pub cameras: Vec<CameraEntry>,
}

/// Serials live in a value rather than a table key, as the `config` crate
/// lowercases keys and sysfs serials are case sensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraEntry {
    pub serial: String,
    #[serde(flatten)]
    pub config: CameraManagerConfig,
}

/// Values every opened device gets unless its camera config says otherwise
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureDefaults {
    pub pixel_format: Option<PixelFormat>,
    pub fps: Option<u32>,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Diff factor below which consecutive frames count as still
    pub move_threshold: f64,
    /// Diff factor below which a frame matches the base frame
    pub base_threshold: f64,
    /// Per-channel intensity difference that marks a pixel as changed
    pub binarize_threshold: u8,
    /// Pause before polling again when no new frame was available
    pub idle_backoff_ms: u64,
    /// Second-stage grid confirmation, off when absent
    pub grid: Option<GridConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub rows: usize,
    pub cols: usize,
    /// Mean cell difference above which a cell counts as changed
    pub cell_threshold: f64,
    /// Fraction of changed cells tolerated for two frames to be equal
    pub grid_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub sysfs_root: String,
    pub dev_root: String,
    pub poll_interval_ms: u64,
    /// "manufacturer product" names to manage; empty accepts every camera
    pub supported_cameras: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Where GOOD frames are written, nothing is written when unset
    pub frames_dir: Option<String>,
    pub poll_interval_ms: u64,
    pub jpeg_quality: u8,
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            pixel_format: None,
            fps: None,
            buffer_count: 4,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            move_threshold: 0.5,
            base_threshold: 0.5,
            binarize_threshold: 100,
            idle_backoff_ms: 5,
            grid: None,
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            rows: 10,
            cols: 5,
            cell_threshold: 10.0,
            grid_threshold: 0.1,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            sysfs_root: "/sys/class/video4linux".into(),
            dev_root: "/dev".into(),
            poll_interval_ms: 500,
            supported_cameras: Vec::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            frames_dir: None,
            poll_interval_ms: 200,
            jpeg_quality: 95,
        }
    }
}

impl Config {
    /// Load from a TOML file (optional) with `PXLCAM__SECTION__KEY` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("PXLCAM").separator("__"))
            .build()?;
        Self::deserialize_from(settings)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Self::deserialize_from(settings)
    }

    /// Camera configs keyed by serial. A later entry for the same serial wins.
    pub fn camera_configs(&self) -> HashMap<String, CameraManagerConfig> {
        self.cameras
            .iter()
            .map(|entry| (entry.serial.clone(), entry.config.clone()))
            .collect()
    }

    fn deserialize_from(settings: config::Config) -> Result<Self> {
        settings
            .try_deserialize()
            .map_err(|e| Error::ConfigTypeMismatch(e.to_string()))
    }
}
