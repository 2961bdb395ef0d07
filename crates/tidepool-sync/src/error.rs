use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("join token rejected")]
    Unauthorized,
    #[error("room {0} does not exist")]
    UnknownRoom(String),
    #[error("invalid state payload for room {room_id}: {source}")]
    InvalidPayload {
        room_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SyncError::Unauthorized => "unauthorized",
            SyncError::UnknownRoom(_) => "unknown_room",
            SyncError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read snapshot {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode snapshot {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write snapshot {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// True when the snapshot file simply has not been written yet.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            StoreError::Read { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
