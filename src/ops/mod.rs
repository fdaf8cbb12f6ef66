// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Abstract operation vocabulary and strict plan parsing
//!
//! The AI reply is untrusted input. Parsing either yields a fully typed
//! [`OperationPlan`] or rejects the whole batch; nothing is ever executed
//! from a partially parsed reply.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::OpErrorKind;
use crate::{Result, TaxisError};

/// A platform-agnostic, typed description of a single file-system action.
///
/// Immutable once parsed; consumed exactly once by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AbstractOperation {
    // Navigation / info
    ListDir {
        path: PathBuf,
        #[serde(default)]
        show_hidden: bool,
    },
    GetInfo {
        path: PathBuf,
    },
    GetPermissions {
        path: PathBuf,
    },
    CheckExists {
        path: PathBuf,
    },
    GetSize {
        path: PathBuf,
    },
    GetDiskSpace {
        path: PathBuf,
    },

    // Mutation
    Mkdir {
        path: PathBuf,
        #[serde(default)]
        parents: bool,
    },
    Move {
        src: PathBuf,
        dest: PathBuf,
    },
    Copy {
        src: PathBuf,
        dest: PathBuf,
    },
    Delete {
        path: PathBuf,
    },
    Rename {
        src: PathBuf,
        dest: PathBuf,
    },

    // Archive
    Extract {
        archive: PathBuf,
        dest: PathBuf,
        #[serde(default)]
        delete_after: bool,
    },
    Compress {
        files: Vec<PathBuf>,
        dest: PathBuf,
    },
    ListArchive {
        archive: PathBuf,
    },

    // Security
    SetPermissions {
        path: PathBuf,
        mode: String,
    },
    ChangeOwner {
        path: PathBuf,
        owner: String,
    },
    CheckAccess {
        path: PathBuf,
        permission: AccessKind,
    },
    RequestAdmin {
        reason: String,
    },

    // Content
    ReadText {
        path: PathBuf,
        #[serde(default)]
        encoding: Option<String>,
    },
    GetMetadata {
        path: PathBuf,
    },
    HashFile {
        path: PathBuf,
        #[serde(default = "default_hash_algorithm")]
        algorithm: String,
    },
    FindDuplicates {
        paths: Vec<PathBuf>,
    },
}

fn default_hash_algorithm() -> String {
    "blake3".to_string()
}

/// Access probe kinds accepted by `check_access`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AbstractOperation {
    /// Stable action name used in prompts, events and the audit trail.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListDir { .. } => "list_dir",
            Self::GetInfo { .. } => "get_info",
            Self::GetPermissions { .. } => "get_permissions",
            Self::CheckExists { .. } => "check_exists",
            Self::GetSize { .. } => "get_size",
            Self::GetDiskSpace { .. } => "get_disk_space",
            Self::Mkdir { .. } => "mkdir",
            Self::Move { .. } => "move",
            Self::Copy { .. } => "copy",
            Self::Delete { .. } => "delete",
            Self::Rename { .. } => "rename",
            Self::Extract { .. } => "extract",
            Self::Compress { .. } => "compress",
            Self::ListArchive { .. } => "list_archive",
            Self::SetPermissions { .. } => "set_permissions",
            Self::ChangeOwner { .. } => "change_owner",
            Self::CheckAccess { .. } => "check_access",
            Self::RequestAdmin { .. } => "request_admin",
            Self::ReadText { .. } => "read_text",
            Self::GetMetadata { .. } => "get_metadata",
            Self::HashFile { .. } => "hash_file",
            Self::FindDuplicates { .. } => "find_duplicates",
        }
    }

    /// Every path argument carried by this operation, for containment checks.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::ListDir { path, .. }
            | Self::GetInfo { path }
            | Self::GetPermissions { path }
            | Self::CheckExists { path }
            | Self::GetSize { path }
            | Self::GetDiskSpace { path }
            | Self::Mkdir { path, .. }
            | Self::Delete { path }
            | Self::SetPermissions { path, .. }
            | Self::ChangeOwner { path, .. }
            | Self::CheckAccess { path, .. }
            | Self::ReadText { path, .. }
            | Self::GetMetadata { path }
            | Self::HashFile { path, .. } => vec![path],
            Self::Move { src, dest } | Self::Copy { src, dest } | Self::Rename { src, dest } => {
                vec![src, dest]
            }
            Self::Extract { archive, dest, .. } => vec![archive, dest],
            Self::Compress { files, dest } => {
                let mut all: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
                all.push(dest);
                all
            }
            Self::ListArchive { archive } => vec![archive],
            Self::FindDuplicates { paths } => paths.iter().map(PathBuf::as_path).collect(),
            Self::RequestAdmin { .. } => Vec::new(),
        }
    }

    /// Whether this operation changes on-disk state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Mkdir { .. }
                | Self::Move { .. }
                | Self::Copy { .. }
                | Self::Delete { .. }
                | Self::Rename { .. }
                | Self::Extract { .. }
                | Self::Compress { .. }
                | Self::SetPermissions { .. }
                | Self::ChangeOwner { .. }
        )
    }
}

/// Outcome of one executed operation; append-only once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation: AbstractOperation,
    pub success: bool,
    pub error_kind: Option<OpErrorKind>,
    pub error_message: Option<String>,
    pub payload: Option<serde_json::Value>,
    /// Set when this result came from a fallback substitution
    pub fallback_used: bool,
}

/// Parsed generator output: the envelope the AI must emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPlan {
    pub operations: Vec<AbstractOperation>,
    /// One human-readable string per operation, same order
    pub explanations: Vec<String>,
    /// Parallel to `operations`; `None` where no fallback applies
    pub fallback_operations: Vec<Option<AbstractOperation>>,
}

impl OperationPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

#[derive(Deserialize)]
struct RawPlan {
    operations: Vec<serde_json::Value>,
    #[serde(default)]
    explanations: Vec<String>,
    #[serde(default)]
    fallback_operations: Vec<serde_json::Value>,
}

/// Parse a raw AI reply into a validated [`OperationPlan`].
///
/// Models wrap JSON in prose or markdown fences; only the outermost JSON
/// object is considered. Any schema violation rejects the entire batch
/// with [`TaxisError::InvalidAiResponse`].
pub fn parse_plan(reply: &str) -> Result<OperationPlan> {
    let body = extract_json_object(reply)
        .ok_or_else(|| TaxisError::InvalidAiResponse("no JSON object in reply".to_string()))?;

    let raw: RawPlan = serde_json::from_str(body)
        .map_err(|e| TaxisError::InvalidAiResponse(format!("malformed envelope: {}", e)))?;

    let mut operations = Vec::with_capacity(raw.operations.len());
    for (i, value) in raw.operations.into_iter().enumerate() {
        let op: AbstractOperation = serde_json::from_value(value)
            .map_err(|e| TaxisError::InvalidAiResponse(format!("operation {}: {}", i, e)))?;
        validate_parameters(&op)
            .map_err(|msg| TaxisError::InvalidAiResponse(format!("operation {}: {}", i, msg)))?;
        operations.push(op);
    }

    if raw.explanations.len() != operations.len() {
        return Err(TaxisError::InvalidAiResponse(format!(
            "{} explanations for {} operations",
            raw.explanations.len(),
            operations.len()
        )));
    }

    if raw.fallback_operations.len() > operations.len() {
        return Err(TaxisError::InvalidAiResponse(
            "more fallback operations than operations".to_string(),
        ));
    }

    let mut fallbacks = Vec::with_capacity(operations.len());
    for (i, value) in raw.fallback_operations.into_iter().enumerate() {
        if value.is_null() {
            fallbacks.push(None);
            continue;
        }
        let op: AbstractOperation = serde_json::from_value(value)
            .map_err(|e| TaxisError::InvalidAiResponse(format!("fallback {}: {}", i, e)))?;
        validate_parameters(&op)
            .map_err(|msg| TaxisError::InvalidAiResponse(format!("fallback {}: {}", i, msg)))?;
        fallbacks.push(Some(op));
    }
    fallbacks.resize(operations.len(), None);

    Ok(OperationPlan {
        operations,
        explanations: raw.explanations,
        fallback_operations: fallbacks,
    })
}

/// Reject parameter values serde cannot: empty paths, unsupported
/// algorithms and encodings, non-octal modes.
fn validate_parameters(op: &AbstractOperation) -> std::result::Result<(), String> {
    for path in op.paths() {
        if path.as_os_str().is_empty() {
            return Err(format!("{}: empty path argument", op.kind()));
        }
    }

    match op {
        AbstractOperation::HashFile { algorithm, .. } => {
            if !algorithm.eq_ignore_ascii_case("blake3") {
                return Err(format!("unsupported hash algorithm '{}'", algorithm));
            }
        }
        AbstractOperation::ReadText {
            encoding: Some(enc),
            ..
        } => {
            let normalized = enc.to_ascii_lowercase().replace('-', "");
            if normalized != "utf8" {
                return Err(format!("unsupported encoding '{}'", enc));
            }
        }
        AbstractOperation::SetPermissions { mode, .. } => {
            if mode.is_empty() || !mode.chars().all(|c| ('0'..='7').contains(&c)) {
                return Err(format!("mode '{}' is not octal", mode));
            }
        }
        AbstractOperation::Compress { files, .. } => {
            if files.is_empty() {
                return Err("compress requires at least one file".to_string());
            }
        }
        AbstractOperation::FindDuplicates { paths } => {
            if paths.is_empty() {
                return Err("find_duplicates requires at least one path".to_string());
            }
        }
        AbstractOperation::RequestAdmin { reason } => {
            if reason.trim().is_empty() {
                return Err("request_admin requires a reason".to_string());
            }
        }
        _ => {}
    }

    Ok(())
}

/// Slice out the outermost JSON object of a reply, tolerating markdown
/// fences and surrounding prose.
fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_envelope() {
        let reply = r#"{
            "operations": [
                {"type": "mkdir", "path": "/Movies", "parents": true},
                {"type": "move", "src": "/dl/a.mkv", "dest": "/Movies/A.mkv"}
            ],
            "explanations": ["Create the movies folder", "File the movie"],
            "fallback_operations": [null, {"type": "copy", "src": "/dl/a.mkv", "dest": "/backup/A.mkv"}]
        }"#;

        let plan = parse_plan(reply).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.operations[0].kind(), "mkdir");
        assert!(plan.fallback_operations[0].is_none());
        assert_eq!(plan.fallback_operations[1].as_ref().unwrap().kind(), "copy");
    }

    #[test]
    fn unknown_type_rejects_batch() {
        let reply = r#"{
            "operations": [
                {"type": "mkdir", "path": "/ok", "parents": true},
                {"type": "teleport", "path": "/nope"}
            ],
            "explanations": ["fine", "not fine"]
        }"#;

        match parse_plan(reply) {
            Err(TaxisError::InvalidAiResponse(msg)) => assert!(msg.contains("operation 1")),
            _ => panic!("expected InvalidAiResponse"),
        }
    }

    #[test]
    fn missing_parameter_rejects_batch() {
        let reply = r#"{"operations": [{"type": "move", "src": "/a"}], "explanations": ["x"]}"#;
        assert!(matches!(
            parse_plan(reply),
            Err(TaxisError::InvalidAiResponse(_))
        ));
    }

    #[test]
    fn explanation_count_must_match() {
        let reply = r#"{"operations": [{"type": "delete", "path": "/a"}], "explanations": []}"#;
        assert!(matches!(
            parse_plan(reply),
            Err(TaxisError::InvalidAiResponse(_))
        ));
    }

    #[test]
    fn tolerates_markdown_fences() {
        let reply = "Here is the plan:\n```json\n{\"operations\": [{\"type\": \"check_exists\", \"path\": \"/x\"}], \"explanations\": [\"probe\"]}\n```\nDone.";
        let plan = parse_plan(reply).unwrap();
        assert_eq!(plan.operations[0].kind(), "check_exists");
    }

    #[test]
    fn rejects_unsupported_hash_algorithm() {
        let reply = r#"{
            "operations": [{"type": "hash_file", "path": "/a", "algorithm": "md5"}],
            "explanations": ["hash it"]
        }"#;
        assert!(matches!(
            parse_plan(reply),
            Err(TaxisError::InvalidAiResponse(_))
        ));
    }

    #[test]
    fn fallback_list_shorter_than_operations_pads_with_none() {
        let reply = r#"{
            "operations": [
                {"type": "delete", "path": "/a"},
                {"type": "delete", "path": "/b"}
            ],
            "explanations": ["one", "two"],
            "fallback_operations": [{"type": "request_admin", "reason": "locked"}]
        }"#;
        let plan = parse_plan(reply).unwrap();
        assert!(plan.fallback_operations[0].is_some());
        assert!(plan.fallback_operations[1].is_none());
    }

    #[test]
    fn empty_path_rejected() {
        let reply = r#"{"operations": [{"type": "delete", "path": ""}], "explanations": ["x"]}"#;
        assert!(matches!(
            parse_plan(reply),
            Err(TaxisError::InvalidAiResponse(_))
        ));
    }

    #[test]
    fn operation_round_trips_through_json() {
        let op = AbstractOperation::Extract {
            archive: PathBuf::from("/dl/pack.zip"),
            dest: PathBuf::from("/dl/pack"),
            delete_after: true,
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"extract\""));
        let back: AbstractOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
