//! Asset declarations and path safety.

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Files copied from the template root into each task instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetList {
    /// Relative paths under the template root.
    #[serde(default)]
    pub copy_files: Vec<String>,
}

impl AssetList {
    /// Validates every declared path.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnsafeAssetPath`] for the first path that is
    /// absolute or contains a `..` segment.
    pub fn validate(&self) -> Result<()> {
        for raw in &self.copy_files {
            safe_relative_path(raw)?;
        }
        Ok(())
    }
}

/// Parses `raw` as a path that stays inside its root.
///
/// Both `/` and `\` count as separators so a manifest written on one
/// platform cannot smuggle a traversal past another.
///
/// # Errors
///
/// Returns [`HubError::UnsafeAssetPath`] for empty, absolute, drive-prefixed,
/// or `..`-containing paths.
pub fn safe_relative_path(raw: &str) -> Result<PathBuf> {
    let unsafe_path = |reason: &str| HubError::UnsafeAssetPath {
        path: raw.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(unsafe_path("path is empty"));
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(unsafe_path("absolute paths are not allowed"));
    }
    if trimmed.len() >= 2 && trimmed.as_bytes()[1] == b':' {
        return Err(unsafe_path("drive-qualified paths are not allowed"));
    }
    if trimmed.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(unsafe_path("parent directory segments are not allowed"));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(unsafe_path("parent directory segments are not allowed"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path("absolute paths are not allowed"));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(unsafe_path("path does not name a file"));
    }
    Ok(clean)
}
