use std::path::PathBuf;

use thiserror::Error;

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to bind to {1}: {0}")]
    Bind(std::io::Error, String),
    #[error("Server error: {0}")]
    Serve(std::io::Error),
    #[error("Configuration Error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage Error: {0}")]
    Storage(#[from] StorageError),
    #[error("Relay Error: {0}")]
    Relay(#[from] RelayError),
    #[error("Directory Error: {0}")]
    Directory(#[from] DirectoryError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid setting `{0}`: {1}")]
    Invalid(&'static str, String),
}

/// Errors the calibration pipeline reports back to the caller as `{ok:false, error}`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Decode(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Render(String),
}

impl From<image::ImageError> for CalibrationError {
    fn from(e: image::ImageError) -> Self {
        CalibrationError::Render(format!("ImageError: {}", e))
    }
}

/// Filesystem faults. These indicate a misconfigured deployment and are not
/// turned into a structured pipeline result.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("Failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("Failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Upstream returned status {0}")]
    UpstreamStatus(u16),
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("Upstream did not respond within {0}s")]
    Timeout(u64),
    #[error("Invalid upstream url: {0}")]
    InvalidUrl(String),
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Remote directory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Unexpected remote directory payload: {0}")]
    Payload(String),
    #[error("Invalid remote directory url: {0}")]
    InvalidUrl(String),
}

/// Either a caller-facing pipeline failure or a fatal storage fault.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
