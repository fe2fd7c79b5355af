pub mod auth;
pub mod calibration;
pub mod config;
pub mod directory;
pub mod error;
pub mod network;
pub mod storage;

pub use config::Settings;
pub use error::{AppError, CalibrationError, PipelineError, RelayError, StorageError};
pub use network::{router, AppState, Server};
