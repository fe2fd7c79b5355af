use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;

const CONFIG_PATH_ENV: &str = "FIELDCAL_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "fieldcal";
const MAX_SESSION_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub data_root: PathBuf,
    pub default_sid: String,
    pub relay_chunk_size: usize,
    pub relay_connect_timeout_secs: u64,
    pub relay_write_timeout_secs: u64,
    /// Preferred TrueType font for point labels.
    pub label_font_path: Option<PathBuf>,
    pub jpeg_quality: u8,
    /// Request body limit for snapshot uploads, in bytes.
    pub max_upload_bytes: usize,
    pub log_level: String,
    pub session_ttl_secs: u64,
    pub directory_base_url: String,
    pub directory_admin_username: String,
    pub directory_shared_password: String,
    pub directory_timeout_secs: u64,
    pub directory_cache_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".to_string(),
            data_root: PathBuf::from("calibration_data"),
            default_sid: "public".to_string(),
            relay_chunk_size: 8192,
            relay_connect_timeout_secs: 10,
            relay_write_timeout_secs: 30,
            label_font_path: None,
            jpeg_quality: 90,
            max_upload_bytes: 64 * 1024 * 1024,
            log_level: "info".to_string(),
            session_ttl_secs: 7 * 24 * 3600,
            directory_base_url: "http://127.0.0.1:10000".to_string(),
            directory_admin_username: "admin".to_string(),
            directory_shared_password: "123456".to_string(),
            directory_timeout_secs: 5,
            directory_cache_secs: 60,
        }
    }
}

impl Settings {
    /// Defaults, then `fieldcal.toml` (or the file named by `FIELDCAL_CONFIG`),
    /// then `FIELDCAL_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        let settings: Settings = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix("FIELDCAL"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "relay_chunk_size",
                "must be greater than zero".into(),
            ));
        }
        if self.relay_connect_timeout_secs == 0 || self.relay_write_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "relay timeouts",
                "must be greater than zero".into(),
            ));
        }
        if self.directory_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "directory_timeout_secs",
                "must be greater than zero".into(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_upload_bytes",
                "must be greater than zero".into(),
            ));
        }
        if self.session_ttl_secs == 0 || self.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(ConfigError::Invalid(
                "session_ttl_secs",
                format!("must be within 1..={}", MAX_SESSION_TTL_SECS),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(
                "jpeg_quality",
                format!("{} is outside 1..=100", self.jpeg_quality),
            ));
        }
        Ok(())
    }

    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_connect_timeout_secs)
    }

    pub fn relay_write_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_write_timeout_secs)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory_timeout_secs)
    }

    pub fn directory_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.directory_cache_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}
