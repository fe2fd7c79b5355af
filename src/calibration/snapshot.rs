use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Local;
use tokio::io::AsyncWriteExt;

use crate::error::{CalibrationError, PipelineError, StorageError};
use crate::storage::{SessionDirs, FRAME_EXTENSIONS};

/// Encodings accepted for uploaded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Png,
    Jpeg,
    Webp,
}

impl SnapshotFormat {
    /// JPEG variants and WEBP are recognised from the data-URL header,
    /// everything else is stored as PNG.
    pub fn from_header(header: &str) -> Self {
        let header = header.to_ascii_lowercase();
        if header.contains("jpeg") || header.contains("jpg") {
            SnapshotFormat::Jpeg
        } else if header.contains("webp") {
            SnapshotFormat::Webp
        } else {
            SnapshotFormat::Png
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SnapshotFormat::Png => "png",
            SnapshotFormat::Jpeg => "jpg",
            SnapshotFormat::Webp => "webp",
        }
    }

    pub fn content_type(ext: &str) -> &'static str {
        match ext {
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            _ => "image/png",
        }
    }
}

/// A decoded `data:<mime>;base64,<body>` payload.
#[derive(Debug, Clone)]
pub struct DecodedSnapshot {
    pub format: SnapshotFormat,
    pub bytes: Vec<u8>,
}

impl DecodedSnapshot {
    pub fn from_data_url(data_url: &str) -> Result<Self, CalibrationError> {
        let (header, body) = data_url
            .split_once(',')
            .ok_or_else(|| CalibrationError::Validation("invalid dataURL".to_string()))?;
        let bytes = STANDARD
            .decode(body.trim())
            .map_err(|e| CalibrationError::Decode(format!("DecodeError: {}", e)))?;
        Ok(Self {
            format: SnapshotFormat::from_header(header),
            bytes,
        })
    }
}

/// Timestamp id at one-second resolution, `YYYYmmdd_HHMMSS`.
pub fn timestamp_id() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Writes `bytes` as a new frame. Starting from `base_id`, a `_N` suffix is
/// appended until no file with that id exists under any known extension, and
/// the file is created exclusively so nothing is ever overwritten.
pub async fn write_new_frame(
    dirs: &SessionDirs,
    base_id: &str,
    format: SnapshotFormat,
    bytes: &[u8],
) -> Result<(String, PathBuf), PipelineError> {
    let mut attempt = 0u32;
    loop {
        let id = if attempt == 0 {
            base_id.to_string()
        } else {
            format!("{}_{}", base_id, attempt)
        };
        attempt += 1;

        if id_taken(dirs, &id).await {
            continue;
        }
        let path = dirs
            .frame_dir
            .join(format!("{}.{}", id, format.extension()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(StorageError::Write(path, e).into()),
        };
        file.write_all(bytes)
            .await
            .map_err(|e| StorageError::Write(path.clone(), e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::Write(path.clone(), e))?;
        return Ok((id, path));
    }
}

async fn id_taken(dirs: &SessionDirs, id: &str) -> bool {
    for ext in FRAME_EXTENSIONS {
        let candidate = dirs.frame_dir.join(format!("{}.{}", id, ext));
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return true;
        }
    }
    false
}
