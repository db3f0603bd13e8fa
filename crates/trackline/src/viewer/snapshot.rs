//! Viewer state kept across restarts.
//!
//! A snapshot holds each device's owner, visibility and recent trail. It is
//! written as JSON next to the other data files and read back when a session
//! starts; restored devices are classified by the age of their last point
//! like any other, so stale ones fall straight to Disconnected or are dropped.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::trail::TrailPoint;
use crate::error::{Error, Result};

/// One device as saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Device id.
    pub device_id: String,
    /// Owning user.
    pub user_name: String,
    /// Whether it was shown on the map.
    pub visible: bool,
    /// Trail, oldest first. The last point is the device's last position.
    pub trail: Vec<TrailPoint>,
}

/// Everything the viewer restores on start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewerSnapshot {
    /// Tracked devices, in id order.
    pub devices: Vec<DeviceSnapshot>,
}

impl ViewerSnapshot {
    /// Read a snapshot. A missing file is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Write the snapshot, replacing any previous one in a single rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), devices = self.devices.len(), "Saved viewer snapshot");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
