use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StorageError;

const FRAME_DIR: &str = "snapshots";
const ANNOTATED_DIR: &str = "annotated";
const META_DIR: &str = "json";

/// Public prefix under which stored frames are served.
pub const LOCATOR_PREFIX: &str = "/calib";

/// Extensions tried, in order, when resolving a frame id to a file.
pub const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Sanitized session identifier. Only a namespace key, never a credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid(String);

impl Sid {
    /// Keeps alphanumerics, `_` and `-`. Empty or fully stripped input
    /// collapses to `default`.
    pub fn sanitize(raw: Option<&str>, default: &str) -> Self {
        let cleaned: String = raw
            .unwrap_or_default()
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if cleaned.is_empty() {
            Sid(default.to_string())
        } else {
            Sid(cleaned)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SessionDirs {
    pub frame_dir: PathBuf,
    pub annotated_dir: PathBuf,
    pub meta_dir: PathBuf,
}

/// Maps a sid to `<root>/<sid>/{snapshots,annotated,json}`.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dirs(&self, sid: &Sid) -> SessionDirs {
        let base = self.root.join(sid.as_str());
        SessionDirs {
            frame_dir: base.join(FRAME_DIR),
            annotated_dir: base.join(ANNOTATED_DIR),
            meta_dir: base.join(META_DIR),
        }
    }

    /// Computes the session's directories and creates them if missing.
    pub async fn resolve(&self, sid: &Sid) -> Result<SessionDirs, StorageError> {
        let dirs = self.session_dirs(sid);
        for dir in [&dirs.frame_dir, &dirs.annotated_dir, &dirs.meta_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::CreateDir(dir.clone(), e))?;
        }
        debug!("Resolved storage for sid {}", sid);
        Ok(dirs)
    }

    pub fn locator_path(&self, sid: &Sid, file_name: &str) -> String {
        format!("{}/{}/{}/{}", LOCATOR_PREFIX, sid, FRAME_DIR, file_name)
    }

    /// First existing `<frame_dir>/<id>.<ext>` in [`FRAME_EXTENSIONS`] order.
    pub async fn find_frame(&self, sid: &Sid, frame_id: &str) -> Option<PathBuf> {
        if !is_safe_file_stem(frame_id) {
            return None;
        }
        let frame_dir = self.session_dirs(sid).frame_dir;
        for ext in FRAME_EXTENSIONS {
            let candidate = frame_dir.join(format!("{}.{}", frame_id, ext));
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Some(candidate);
            }
        }
        None
    }

    /// Reads a stored frame by file name. `Ok(None)` for unknown or unsafe names.
    pub async fn read_frame_file(
        &self,
        sid: &Sid,
        file_name: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let Some((stem, ext)) = file_name.split_once('.') else {
            return Ok(None);
        };
        if !is_safe_file_stem(stem) || !FRAME_EXTENSIONS.contains(&ext) {
            return Ok(None);
        }
        let path = self.session_dirs(sid).frame_dir.join(file_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read(path, e)),
        }
    }
}

fn is_safe_file_stem(stem: &str) -> bool {
    !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
