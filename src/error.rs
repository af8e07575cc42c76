use std::io;
use std::path::PathBuf;

use serde::Serialize;

pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

/// Flat classification of [`CheckpointError`], handy for frontends that only
/// need to pick a message or an icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    OwnershipMismatch,
    Validation,
    SourceNotFound,
    ProcessRunning,
    Io,
    CorruptArchive,
    CorruptMetadata,
    InsufficientSpace,
    Cancelled,
    Database,
    Serialization,
    Remote,
    Task,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("snapshot {snapshot_id} does not belong to game {game_id}")]
    OwnershipMismatch {
        snapshot_id: String,
        game_id: String,
    },

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("save location does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("{0} is currently running")]
    ProcessRunning(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("corrupt snapshot metadata at {}: {reason}", .path.display())]
    CorruptMetadata { path: PathBuf, reason: String },

    #[error("not enough free space: {needed} bytes needed, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("remote storage error: {0}")]
    Remote(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl CheckpointError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn game_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "game",
            id: id.to_string(),
        }
    }

    pub fn snapshot_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "snapshot",
            id: id.to_string(),
        }
    }

    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::OwnershipMismatch { .. } => ErrorKind::OwnershipMismatch,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::SourceNotFound(_) => ErrorKind::SourceNotFound,
            Self::ProcessRunning(_) => ErrorKind::ProcessRunning,
            Self::Io { .. } => ErrorKind::Io,
            Self::CorruptArchive(_) => ErrorKind::CorruptArchive,
            Self::CorruptMetadata { .. } => ErrorKind::CorruptMetadata,
            Self::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Database(_) => ErrorKind::Database,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Remote(_) => ErrorKind::Remote,
            Self::Task(_) => ErrorKind::Task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let err = CheckpointError::snapshot_not_found("abc");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "snapshot not found: abc");

        let err = CheckpointError::io(
            "Failed to copy save.dat",
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.to_string(), "Failed to copy save.dat: disk full");
    }
}
