use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::StoreError;

/// Snapshot file holding the last known state of every room.
///
/// The file is a single JSON object mapping room id to state. There is no
/// header or version field.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| StoreError::Read {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    /// Overwrite the snapshot with `states`.
    ///
    /// The new contents are written next to the target and renamed over it, so
    /// a crash mid-write leaves the previous snapshot intact.
    pub async fn save(&self, states: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(states)?;
        let staging = self.staging_path();
        tokio::fs::write(&staging, &encoded)
            .await
            .map_err(|source| StoreError::Write {
                path: staging.clone(),
                source,
            })?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
