// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for Taxis

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Taxis operations
pub type Result<T> = std::result::Result<T, TaxisError>;

/// Taxis error types
#[derive(Error, Debug)]
pub enum TaxisError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("API error: {0}")]
    Api(#[from] reqwest::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("AI provider unavailable: {0}")]
    AiUnavailable(String),

    #[error("Invalid AI response: {0}")]
    InvalidAiResponse(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Path rejected: {0}")]
    PathRejected(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Destination does not resolve under any known drive: {0}")]
    UnknownVolume(String),

    #[error("Drive disconnected: {0}")]
    DriveDisconnected(String),
}

/// Per-operation failure taxonomy, recorded in the audit trail and used
/// to decide whether a fallback operation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpErrorKind {
    PermissionDenied,
    FileNotFound,
    DestinationExists,
    DiskFull,
    ArchiveCorrupt,
    PathTraversalRejected,
    DriveDisconnected,
    Other,
}

impl OpErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::FileNotFound => "file_not_found",
            Self::DestinationExists => "destination_exists",
            Self::DiskFull => "disk_full",
            Self::ArchiveCorrupt => "archive_corrupt",
            Self::PathTraversalRejected => "path_traversal_rejected",
            Self::DriveDisconnected => "drive_disconnected",
            Self::Other => "other",
        }
    }

    /// Map a raw IO error onto the operation taxonomy.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::NotFound => Self::FileNotFound,
            ErrorKind::AlreadyExists => Self::DestinationExists,
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => Self::DiskFull,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for OpErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_mapping_covers_taxonomy() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(OpErrorKind::from_io(&denied), OpErrorKind::PermissionDenied);

        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(OpErrorKind::from_io(&missing), OpErrorKind::FileNotFound);

        let exists = std::io::Error::from(std::io::ErrorKind::AlreadyExists);
        assert_eq!(OpErrorKind::from_io(&exists), OpErrorKind::DestinationExists);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&OpErrorKind::PathTraversalRejected).unwrap();
        assert_eq!(json, "\"path_traversal_rejected\"");
    }
}
