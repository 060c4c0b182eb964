use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the capture, classification and management layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not started")]
    NotStarted(&'static str),
    #[error("failed to open capture device {path}: {reason}")]
    DeviceOpenFailure { path: String, reason: String },
    #[error("device {0} malfunctioned")]
    DeviceMalfunction(String),
    #[error("invalid region of interest: {0}")]
    InvalidRoi(String),
    #[error("config type mismatch: {0}")]
    ConfigTypeMismatch(String),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("{0} mailbox closed")]
    ActorGone(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}
