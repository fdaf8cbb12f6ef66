// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Operation executor
//!
//! Validates and performs abstract operations using library filesystem
//! primitives only; no shell is ever invoked. Every attempt lands in the
//! `file_actions` audit trail, and a failed operation consumes at most
//! one declared fallback. File systems are not transactional: nothing is
//! rolled back, completed steps stay visible in the result.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::OpErrorKind;
use crate::memory::DestinationMemory;
use crate::ops::{AbstractOperation, AccessKind, OperationResult};
use crate::TaxisError;

/// Upper bound for `read_text` payloads
const MAX_READ_TEXT: u64 = 1024 * 1024;

/// Lifecycle of one operation inside the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    Pending,
    Validating,
    Executing,
    Succeeded,
    Failed,
}

/// A single failed step, mapped onto the operation taxonomy
#[derive(Debug)]
struct OpFailure {
    kind: OpErrorKind,
    message: String,
}

impl OpFailure {
    fn new(kind: OpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for OpFailure {
    fn from(err: std::io::Error) -> Self {
        Self {
            kind: OpErrorKind::from_io(&err),
            message: err.to_string(),
        }
    }
}

type OpResult = std::result::Result<Option<serde_json::Value>, OpFailure>;

/// Executor scoped to one user and one set of allowed roots.
///
/// Roots come from the coordinator (source and destination of the cycle);
/// any operation whose resolved paths escape them is rejected before it
/// touches the disk.
pub struct OperationExecutor {
    user_id: String,
    db: Database,
    memory: Arc<DestinationMemory>,
    allowed_roots: Vec<PathBuf>,
}

impl OperationExecutor {
    pub fn new(
        user_id: &str,
        db: Database,
        memory: Arc<DestinationMemory>,
        allowed_roots: Vec<PathBuf>,
    ) -> Self {
        let allowed_roots = allowed_roots
            .into_iter()
            .map(|root| root.canonicalize().unwrap_or(root))
            .collect();
        Self {
            user_id: user_id.to_string(),
            db,
            memory,
            allowed_roots,
        }
    }

    /// Run one operation to completion, substituting the fallback once if
    /// the primary fails. Returns one result per attempt, in order.
    pub fn run(
        &self,
        batch_id: &str,
        operation: &AbstractOperation,
        fallback: Option<&AbstractOperation>,
        categories: &HashMap<PathBuf, String>,
    ) -> Vec<OperationResult> {
        let mut results = vec![self.attempt(batch_id, operation, categories, false)];

        if !results[0].success {
            if let Some(fallback) = fallback {
                info!(
                    "{} failed ({}), trying fallback {}",
                    operation.kind(),
                    results[0]
                        .error_kind
                        .map(|k| k.as_str())
                        .unwrap_or("unknown"),
                    fallback.kind()
                );
                results.push(self.attempt(batch_id, fallback, categories, true));
            }
        }

        results
    }

    /// One pass through the state machine: pending -> validating ->
    /// executing -> succeeded | failed.
    fn attempt(
        &self,
        batch_id: &str,
        operation: &AbstractOperation,
        categories: &HashMap<PathBuf, String>,
        fallback_used: bool,
    ) -> OperationResult {
        let mut state = OpState::Pending;
        debug!("{} {:?}", operation.kind(), state);

        state = OpState::Validating;
        let outcome = match self.validate(operation) {
            Ok(()) => {
                state = OpState::Executing;
                debug!("{} {:?}", operation.kind(), state);
                self.dispatch(operation)
            }
            Err(failure) => Err(failure),
        };

        let result = match outcome {
            Ok(payload) => {
                state = OpState::Succeeded;
                OperationResult {
                    operation: operation.clone(),
                    success: true,
                    error_kind: None,
                    error_message: None,
                    payload,
                    fallback_used,
                }
            }
            Err(failure) => {
                state = OpState::Failed;
                OperationResult {
                    operation: operation.clone(),
                    success: false,
                    error_kind: Some(failure.kind),
                    error_message: Some(failure.message),
                    payload: None,
                    fallback_used,
                }
            }
        };
        debug!("{} -> {:?}", operation.kind(), state);

        self.audit(batch_id, &result);
        if result.success {
            self.learn_from(operation, categories);
        }
        result
    }

    /// Containment check for every path argument. Rejects `..` escapes
    /// and symlinks that resolve outside the allowed roots.
    fn validate(&self, operation: &AbstractOperation) -> std::result::Result<(), OpFailure> {
        for path in operation.paths() {
            let resolved = self.resolve(path).ok_or_else(|| {
                OpFailure::new(
                    OpErrorKind::PathTraversalRejected,
                    format!("{} cannot be resolved inside the allowed roots", path.display()),
                )
            })?;

            if !self.allowed_roots.iter().any(|root| resolved.starts_with(root)) {
                return Err(OpFailure::new(
                    OpErrorKind::PathTraversalRejected,
                    format!("{} escapes the allowed roots", path.display()),
                ));
            }
        }

        // Fail fast on paths that live on a volume known to be offline.
        if let Ok(drives) = self.memory.registry().list() {
            for path in operation.paths() {
                let owning = drives
                    .iter()
                    .filter(|d| path.starts_with(&d.current_path))
                    .max_by_key(|d| d.current_path.as_os_str().len());
                if let Some(drive) = owning {
                    if !drive.is_connected {
                        return Err(OpFailure::new(
                            OpErrorKind::DriveDisconnected,
                            format!(
                                "{} is on disconnected drive '{}'",
                                path.display(),
                                drive.label
                            ),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolve to a canonical absolute path. Existing paths canonicalize
    /// directly (following symlinks); for paths that do not exist yet the
    /// deepest existing ancestor is canonicalized and the remainder is
    /// normalized lexically, popping `..` components.
    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        if let Ok(canonical) = path.canonicalize() {
            return Some(canonical);
        }

        let mut existing = path.to_path_buf();
        let mut remainder: Vec<std::ffi::OsString> = Vec::new();
        loop {
            if existing.exists() {
                break;
            }
            let name = existing.file_name()?.to_os_string();
            remainder.push(name);
            existing = existing.parent()?.to_path_buf();
        }

        let mut resolved = existing.canonicalize().ok()?;
        for part in remainder.iter().rev() {
            match Path::new(part).components().next()? {
                Component::Normal(c) => resolved.push(c),
                Component::ParentDir => {
                    if !resolved.pop() {
                        return None;
                    }
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }

    /// Dispatch to the filesystem primitive for this operation type.
    fn dispatch(&self, operation: &AbstractOperation) -> OpResult {
        match operation {
            AbstractOperation::ListDir { path, show_hidden } => list_dir(path, *show_hidden),
            AbstractOperation::GetInfo { path } => get_info(path),
            AbstractOperation::GetPermissions { path } => get_permissions(path),
            AbstractOperation::CheckExists { path } => {
                Ok(Some(serde_json::json!({ "exists": path.exists() })))
            }
            AbstractOperation::GetSize { path } => get_size(path),
            AbstractOperation::GetDiskSpace { path } => get_disk_space(path),
            AbstractOperation::Mkdir { path, parents } => mkdir(path, *parents),
            AbstractOperation::Move { src, dest } => move_entry(src, dest),
            AbstractOperation::Copy { src, dest } => copy_entry(src, dest),
            AbstractOperation::Delete { path } => delete_entry(path),
            AbstractOperation::Rename { src, dest } => rename_entry(src, dest),
            AbstractOperation::Extract {
                archive,
                dest,
                delete_after,
            } => extract_archive(archive, dest, *delete_after),
            AbstractOperation::Compress { files, dest } => compress_files(files, dest),
            AbstractOperation::ListArchive { archive } => list_archive(archive),
            AbstractOperation::SetPermissions { path, mode } => set_permissions(path, mode),
            AbstractOperation::ChangeOwner { path, owner } => change_owner(path, owner),
            AbstractOperation::CheckAccess { path, permission } => check_access(path, *permission),
            AbstractOperation::RequestAdmin { reason } => Ok(Some(serde_json::json!({
                "escalation_requested": true,
                "reason": reason,
            }))),
            AbstractOperation::ReadText { path, .. } => read_text(path),
            AbstractOperation::GetMetadata { path } => get_metadata(path),
            AbstractOperation::HashFile { path, algorithm } => hash_file(path, algorithm),
            AbstractOperation::FindDuplicates { paths } => find_duplicates(paths),
        }
    }

    /// Append this attempt to the audit trail. Rows are never mutated.
    fn audit(&self, batch_id: &str, result: &OperationResult) {
        let (file_name, source, dest) = audit_fields(&result.operation);
        let error = result
            .error_kind
            .map(|kind| {
                format!(
                    "{}: {}",
                    kind.as_str(),
                    result.error_message.as_deref().unwrap_or("")
                )
            });

        if let Err(e) = self.db.insert_action(
            &self.user_id,
            batch_id,
            result.operation.kind(),
            file_name.as_deref(),
            source.as_deref(),
            dest.as_deref(),
            result.success,
            error.as_deref(),
        ) {
            warn!("failed to record audit row: {}", e);
        }
    }

    /// Feed successful moves/copies of recognized categories back into
    /// destination memory. Learning failures never fail the operation.
    fn learn_from(&self, operation: &AbstractOperation, categories: &HashMap<PathBuf, String>) {
        let (src, dest) = match operation {
            AbstractOperation::Move { src, dest } | AbstractOperation::Copy { src, dest } => {
                (src, dest)
            }
            _ => return,
        };

        let Some(category) = categories.get(src) else {
            return;
        };
        let Some(folder) = dest.parent() else { return };

        match self.memory.record_outcome(category, folder, true) {
            Ok(()) => debug!("learned {} -> {}", category, folder.display()),
            Err(TaxisError::UnknownVolume(path)) => {
                warn!("not learning destination on unknown volume: {}", path)
            }
            Err(e) => warn!("failed to record outcome: {}", e),
        }
    }
}

fn audit_fields(
    operation: &AbstractOperation,
) -> (Option<String>, Option<String>, Option<String>) {
    let name = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().to_string())
    };
    let full = |p: &Path| Some(p.to_string_lossy().to_string());

    match operation {
        AbstractOperation::Move { src, dest }
        | AbstractOperation::Copy { src, dest }
        | AbstractOperation::Rename { src, dest } => (name(src), full(src), full(dest)),
        AbstractOperation::Extract { archive, dest, .. } => {
            (name(archive), full(archive), full(dest))
        }
        AbstractOperation::Compress { files, dest } => (
            files.first().and_then(|p| name(p)),
            files.first().and_then(|p| full(p)),
            full(dest),
        ),
        AbstractOperation::ListArchive { archive } => (name(archive), full(archive), None),
        AbstractOperation::RequestAdmin { .. } => (None, None, None),
        other => {
            let path = other.paths().first().copied().map(Path::to_path_buf);
            (
                path.as_deref().and_then(name),
                path.as_deref().and_then(full),
                None,
            )
        }
    }
}

// === Filesystem primitives ===

fn list_dir(path: &Path, show_hidden: bool) -> OpResult {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !show_hidden && name.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata()?;
        entries.push(serde_json::json!({
            "name": name,
            "is_dir": metadata.is_dir(),
            "size": metadata.len(),
        }));
    }
    Ok(Some(serde_json::json!({ "entries": entries })))
}

fn get_info(path: &Path) -> OpResult {
    let metadata = std::fs::metadata(path)?;
    Ok(Some(serde_json::json!({
        "size": metadata.len(),
        "is_dir": metadata.is_dir(),
        "readonly": metadata.permissions().readonly(),
        "modified": modified_rfc3339(&metadata),
    })))
}

fn get_permissions(path: &Path) -> OpResult {
    let metadata = std::fs::metadata(path)?;

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        format!("{:o}", metadata.permissions().mode() & 0o7777)
    };
    #[cfg(not(unix))]
    let mode = if metadata.permissions().readonly() {
        "444".to_string()
    } else {
        "644".to_string()
    };

    Ok(Some(serde_json::json!({
        "mode": mode,
        "readonly": metadata.permissions().readonly(),
    })))
}

fn get_size(path: &Path) -> OpResult {
    let metadata = std::fs::metadata(path)?;
    let bytes = if metadata.is_dir() {
        walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    } else {
        metadata.len()
    };
    Ok(Some(serde_json::json!({ "bytes": bytes })))
}

fn get_disk_space(path: &Path) -> OpResult {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let best = disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    match best {
        Some(disk) => Ok(Some(serde_json::json!({
            "mount_point": disk.mount_point().to_string_lossy(),
            "total_bytes": disk.total_space(),
            "available_bytes": disk.available_space(),
        }))),
        None => Err(OpFailure::new(
            OpErrorKind::FileNotFound,
            format!("no mounted volume contains {}", path.display()),
        )),
    }
}

/// With `parents`, creation is idempotent: an existing directory is a
/// success, invoking it twice never errors.
fn mkdir(path: &Path, parents: bool) -> OpResult {
    if parents {
        std::fs::create_dir_all(path)?;
    } else {
        std::fs::create_dir(path)?;
    }
    Ok(None)
}

fn move_entry(src: &Path, dest: &Path) -> OpResult {
    if !src.exists() {
        return Err(OpFailure::new(
            OpErrorKind::FileNotFound,
            format!("{} does not exist", src.display()),
        ));
    }
    if dest.exists() {
        return Err(OpFailure::new(
            OpErrorKind::DestinationExists,
            format!("{} already exists", dest.display()),
        ));
    }

    match std::fs::rename(src, dest) {
        Ok(()) => Ok(None),
        Err(rename_err) => {
            // Cross-device moves degrade to copy+remove.
            if src.is_file() {
                std::fs::copy(src, dest)?;
                std::fs::remove_file(src)?;
                Ok(None)
            } else if src.is_dir() {
                copy_dir_all(src, dest)?;
                std::fs::remove_dir_all(src)?;
                Ok(None)
            } else {
                Err(rename_err.into())
            }
        }
    }
}

fn copy_entry(src: &Path, dest: &Path) -> OpResult {
    if !src.exists() {
        return Err(OpFailure::new(
            OpErrorKind::FileNotFound,
            format!("{} does not exist", src.display()),
        ));
    }
    if dest.exists() {
        return Err(OpFailure::new(
            OpErrorKind::DestinationExists,
            format!("{} already exists", dest.display()),
        ));
    }

    if src.is_dir() {
        copy_dir_all(src, dest)?;
        Ok(None)
    } else {
        let bytes = std::fs::copy(src, dest)?;
        Ok(Some(serde_json::json!({ "bytes_copied": bytes })))
    }
}

fn delete_entry(path: &Path) -> OpResult {
    let metadata = std::fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(None)
}

fn rename_entry(src: &Path, dest: &Path) -> OpResult {
    if !src.exists() {
        return Err(OpFailure::new(
            OpErrorKind::FileNotFound,
            format!("{} does not exist", src.display()),
        ));
    }
    if dest.exists() {
        return Err(OpFailure::new(
            OpErrorKind::DestinationExists,
            format!("{} already exists", dest.display()),
        ));
    }
    std::fs::rename(src, dest)?;
    Ok(None)
}

/// Extract then optionally delete the archive. The two steps audit as a
/// unit: a delete failure fails the operation while reporting how far it
/// got, and nothing is rolled back.
fn extract_archive(archive: &Path, dest: &Path, delete_after: bool) -> OpResult {
    let ext = archive
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    std::fs::create_dir_all(dest)?;

    match ext.as_str() {
        "zip" | "jar" => {
            let file = std::fs::File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file).map_err(|e| {
                OpFailure::new(OpErrorKind::ArchiveCorrupt, format!("bad ZIP: {}", e))
            })?;
            zip.extract(dest).map_err(|e| {
                OpFailure::new(OpErrorKind::ArchiveCorrupt, format!("ZIP extract failed: {}", e))
            })?;
        }
        "tar" | "tgz" | "gz" => {
            let file = std::fs::File::open(archive)?;
            let reader: Box<dyn Read> = if ext == "gz" || ext == "tgz" {
                Box::new(flate2::read::GzDecoder::new(file))
            } else {
                Box::new(file)
            };
            tar::Archive::new(reader).unpack(dest).map_err(|e| {
                OpFailure::new(OpErrorKind::ArchiveCorrupt, format!("TAR extract failed: {}", e))
            })?;
        }
        other => {
            return Err(OpFailure::new(
                OpErrorKind::ArchiveCorrupt,
                format!("unsupported archive type '{}'", other),
            ))
        }
    }

    if delete_after {
        if let Err(e) = std::fs::remove_file(archive) {
            return Err(OpFailure::new(
                OpErrorKind::from_io(&e),
                format!(
                    "archive extracted to {} but source not removed: {}",
                    dest.display(),
                    e
                ),
            ));
        }
    }

    Ok(Some(serde_json::json!({
        "extracted_to": dest.to_string_lossy(),
        "archive_removed": delete_after,
    })))
}

fn compress_files(files: &[PathBuf], dest: &Path) -> OpResult {
    if dest.exists() {
        return Err(OpFailure::new(
            OpErrorKind::DestinationExists,
            format!("{} already exists", dest.display()),
        ));
    }

    let out = std::fs::File::create(dest)?;
    let mut writer = zip::ZipWriter::new(out);
    let options = zip::write::SimpleFileOptions::default();
    let mut count = 0usize;

    for path in files {
        if path.is_file() {
            let entry_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            writer
                .start_file(entry_name, options)
                .map_err(|e| OpFailure::new(OpErrorKind::Other, e.to_string()))?;
            let mut input = std::fs::File::open(path)?;
            std::io::copy(&mut input, &mut writer)?;
            count += 1;
        } else if path.is_dir() {
            let base = path.file_name().map(PathBuf::from).unwrap_or_default();
            for entry in walkdir::WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let relative = entry
                    .path()
                    .strip_prefix(path)
                    .unwrap_or(entry.path());
                let entry_name = base.join(relative).to_string_lossy().to_string();
                writer
                    .start_file(entry_name, options)
                    .map_err(|e| OpFailure::new(OpErrorKind::Other, e.to_string()))?;
                let mut input = std::fs::File::open(entry.path())?;
                std::io::copy(&mut input, &mut writer)?;
                count += 1;
            }
        } else {
            return Err(OpFailure::new(
                OpErrorKind::FileNotFound,
                format!("{} does not exist", path.display()),
            ));
        }
    }

    writer
        .finish()
        .map_err(|e| OpFailure::new(OpErrorKind::Other, e.to_string()))?;
    Ok(Some(serde_json::json!({ "files_compressed": count })))
}

fn list_archive(archive: &Path) -> OpResult {
    if !archive.exists() {
        return Err(OpFailure::new(
            OpErrorKind::FileNotFound,
            format!("{} does not exist", archive.display()),
        ));
    }
    let listing = crate::generator::context::list_archive(archive).map_err(|e| {
        OpFailure::new(OpErrorKind::ArchiveCorrupt, e.to_string())
    })?;
    Ok(Some(serde_json::to_value(listing).unwrap_or_default()))
}

fn set_permissions(path: &Path, mode: &str) -> OpResult {
    let parsed = u32::from_str_radix(mode, 8)
        .map_err(|_| OpFailure::new(OpErrorKind::Other, format!("mode '{}' is not octal", mode)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(parsed))?;
    }
    #[cfg(not(unix))]
    {
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_readonly(parsed & 0o200 == 0);
        std::fs::set_permissions(path, permissions)?;
    }

    Ok(None)
}

fn change_owner(path: &Path, owner: &str) -> OpResult {
    #[cfg(unix)]
    {
        let uid = resolve_uid(owner).ok_or_else(|| {
            OpFailure::new(
                OpErrorKind::Other,
                format!("unknown owner '{}'", owner),
            )
        })?;
        std::os::unix::fs::chown(path, Some(uid), None)?;
        Ok(None)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Err(OpFailure::new(
            OpErrorKind::PermissionDenied,
            format!("changing owner to '{}' is not supported on this platform", owner),
        ))
    }
}

/// Numeric UID, or a name looked up in the passwd file. No shell.
#[cfg(unix)]
fn resolve_uid(owner: &str) -> Option<u32> {
    if let Ok(uid) = owner.parse::<u32>() {
        return Some(uid);
    }

    let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
    for line in passwd.lines() {
        let mut fields = line.split(':');
        if fields.next() == Some(owner) {
            return fields.nth(1)?.parse().ok();
        }
    }
    None
}

fn check_access(path: &Path, permission: AccessKind) -> OpResult {
    let metadata = std::fs::metadata(path)?;

    let allowed = match permission {
        AccessKind::Read => {
            if metadata.is_dir() {
                std::fs::read_dir(path).is_ok()
            } else {
                std::fs::File::open(path).is_ok()
            }
        }
        AccessKind::Write => {
            if metadata.is_dir() {
                // Probe by creating and removing a marker file.
                let probe = path.join(".taxis_access_probe");
                match std::fs::File::create(&probe) {
                    Ok(_) => {
                        let _ = std::fs::remove_file(&probe);
                        true
                    }
                    Err(_) => false,
                }
            } else {
                std::fs::OpenOptions::new().append(true).open(path).is_ok()
            }
        }
        AccessKind::Execute => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                metadata.permissions().mode() & 0o111 != 0
            }
            #[cfg(not(unix))]
            {
                true
            }
        }
    };

    Ok(Some(serde_json::json!({ "allowed": allowed })))
}

fn read_text(path: &Path) -> OpResult {
    let metadata = std::fs::metadata(path)?;
    let mut file = std::fs::File::open(path)?;

    let mut bytes = Vec::new();
    file.take(MAX_READ_TEXT).read_to_end(&mut bytes)?;
    let text = String::from_utf8_lossy(&bytes).to_string();

    Ok(Some(serde_json::json!({
        "text": text,
        "encoding": "utf-8",
        "truncated": metadata.len() > MAX_READ_TEXT,
    })))
}

fn get_metadata(path: &Path) -> OpResult {
    let metadata = std::fs::metadata(path)?;
    Ok(Some(serde_json::json!({
        "size": metadata.len(),
        "is_dir": metadata.is_dir(),
        "readonly": metadata.permissions().readonly(),
        "modified": modified_rfc3339(&metadata),
        "extension": path.extension().and_then(|e| e.to_str()),
    })))
}

fn hash_file(path: &Path, algorithm: &str) -> OpResult {
    let data = std::fs::read(path)?;
    let hash = blake3::hash(&data);
    Ok(Some(serde_json::json!({
        "algorithm": algorithm,
        "hash": hash.to_hex().to_string(),
    })))
}

fn find_duplicates(paths: &[PathBuf]) -> OpResult {
    let mut by_hash: HashMap<String, Vec<String>> = HashMap::new();

    for path in paths {
        if !path.is_file() {
            return Err(OpFailure::new(
                OpErrorKind::FileNotFound,
                format!("{} is not a file", path.display()),
            ));
        }
        let data = std::fs::read(path)?;
        let hash = blake3::hash(&data).to_hex().to_string();
        by_hash
            .entry(hash)
            .or_default()
            .push(path.to_string_lossy().to_string());
    }

    let mut groups: Vec<Vec<String>> = by_hash
        .into_values()
        .filter(|group| group.len() > 1)
        .collect();
    groups.sort();

    Ok(Some(serde_json::json!({ "duplicate_groups": groups })))
}

fn copy_dir_all(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn modified_rfc3339(metadata: &std::fs::Metadata) -> Option<String> {
    metadata
        .modified()
        .ok()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LearningConfig;
    use crate::drives::identity::IdentityProbe;
    use crate::drives::{DriveRegistry, MountSnapshot};
    use std::io::Write;

    fn executor_for(root: &Path) -> (OperationExecutor, Arc<DestinationMemory>, Database) {
        let db = Database::in_memory().unwrap();
        let probe = IdentityProbe::with_roots(root.join("no-sysfs"), root.join("no-uuid"));
        let registry = DriveRegistry::with_probe("u", db.clone(), probe);
        registry
            .discover_from(vec![MountSnapshot {
                mount_point: root.to_path_buf(),
                label: "root".into(),
                total_bytes: 1,
                removable: false,
                file_system: "ext4".into(),
                device: None,
            }])
            .unwrap();
        let memory = Arc::new(DestinationMemory::with_registry(
            "u",
            db.clone(),
            registry,
            LearningConfig::default(),
        ));
        let executor = OperationExecutor::new(
            "u",
            db.clone(),
            memory.clone(),
            vec![root.to_path_buf()],
        );
        (executor, memory, db)
    }

    fn no_categories() -> HashMap<PathBuf, String> {
        HashMap::new()
    }

    #[test]
    fn mkdir_with_parents_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, _, _) = executor_for(tmp.path());
        let op = AbstractOperation::Mkdir {
            path: tmp.path().join("a").join("b"),
            parents: true,
        };

        let first = executor.run("b", &op, None, &no_categories());
        let second = executor.run("b", &op, None, &no_categories());

        assert!(first[0].success);
        assert!(second[0].success);
        assert!(tmp.path().join("a").join("b").is_dir());
    }

    #[test]
    fn mkdir_then_move_scenario() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, _, db) = executor_for(tmp.path());

        let dl = tmp.path().join("dl");
        std::fs::create_dir_all(&dl).unwrap();
        std::fs::write(dl.join("a.mkv"), "film").unwrap();

        let movies = tmp.path().join("Movies");
        let ops = [
            AbstractOperation::Mkdir {
                path: movies.clone(),
                parents: true,
            },
            AbstractOperation::Move {
                src: dl.join("a.mkv"),
                dest: movies.join("A.mkv"),
            },
        ];

        for op in &ops {
            let results = executor.run("batch1", op, None, &no_categories());
            assert!(results[0].success, "{:?}", results[0].error_message);
        }

        assert!(movies.join("A.mkv").exists());
        assert!(!dl.join("a.mkv").exists());

        let actions = db.actions_for_batch("batch1").unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| a.success));
    }

    #[test]
    fn traversal_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, _, _) = executor_for(tmp.path());

        let op = AbstractOperation::Delete {
            path: tmp.path().join("sub").join("..").join("..").join("escape"),
        };
        let results = executor.run("b", &op, None, &no_categories());

        assert!(!results[0].success);
        assert_eq!(
            results[0].error_kind,
            Some(OpErrorKind::PathTraversalRejected)
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let (executor, _, _) = executor_for(tmp.path());

        std::fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();

        let op = AbstractOperation::ReadText {
            path: tmp.path().join("link").join("secret"),
            encoding: None,
        };
        let results = executor.run("b", &op, None, &no_categories());

        assert!(!results[0].success);
        assert_eq!(
            results[0].error_kind,
            Some(OpErrorKind::PathTraversalRejected)
        );
    }

    #[test]
    fn failed_move_uses_fallback_copy_and_audits_both() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, _, db) = executor_for(tmp.path());

        std::fs::write(tmp.path().join("file.txt"), "data").unwrap();
        // Destination already exists, so the move fails.
        std::fs::write(tmp.path().join("taken.txt"), "other").unwrap();
        let backup = tmp.path().join("backup.txt");

        let primary = AbstractOperation::Move {
            src: tmp.path().join("file.txt"),
            dest: tmp.path().join("taken.txt"),
        };
        let fallback = AbstractOperation::Copy {
            src: tmp.path().join("file.txt"),
            dest: backup.clone(),
        };

        let results = executor.run("b", &primary, Some(&fallback), &no_categories());

        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert_eq!(results[0].error_kind, Some(OpErrorKind::DestinationExists));
        assert!(results[1].success);
        assert!(results[1].fallback_used);
        assert!(backup.exists());

        let actions = db.actions_for_batch("b").unwrap();
        assert_eq!(actions.len(), 2);
        assert!(!actions[0].success);
        assert!(actions[1].success);
        assert_eq!(actions[0].action_type, "move");
        assert_eq!(actions[1].action_type, "copy");
    }

    #[test]
    fn extract_zip_with_delete_after() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, _, _) = executor_for(tmp.path());

        let archive = tmp.path().join("pack.zip");
        let file = std::fs::File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("inner.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"contents").unwrap();
        writer.finish().unwrap();

        let op = AbstractOperation::Extract {
            archive: archive.clone(),
            dest: tmp.path().join("out"),
            delete_after: true,
        };
        let results = executor.run("b", &op, None, &no_categories());

        assert!(results[0].success, "{:?}", results[0].error_message);
        assert!(tmp.path().join("out").join("inner.txt").exists());
        assert!(!archive.exists());
    }

    #[test]
    fn corrupt_archive_is_reported_as_such() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, _, _) = executor_for(tmp.path());

        let archive = tmp.path().join("broken.zip");
        std::fs::write(&archive, "this is not a zip").unwrap();

        let op = AbstractOperation::Extract {
            archive,
            dest: tmp.path().join("out"),
            delete_after: false,
        };
        let results = executor.run("b", &op, None, &no_categories());

        assert!(!results[0].success);
        assert_eq!(results[0].error_kind, Some(OpErrorKind::ArchiveCorrupt));
    }

    #[test]
    fn successful_move_updates_destination_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, memory, _) = executor_for(tmp.path());

        let src = tmp.path().join("invoice.pdf");
        std::fs::write(&src, "pdf bytes").unwrap();
        let finance = tmp.path().join("Finance");
        std::fs::create_dir_all(&finance).unwrap();

        let mut categories = HashMap::new();
        categories.insert(src.clone(), "Finance".to_string());

        let op = AbstractOperation::Move {
            src,
            dest: finance.join("invoice.pdf"),
        };
        let results = executor.run("b", &op, None, &categories);
        assert!(results[0].success);

        let learned = memory.lookup("Finance").unwrap().unwrap();
        assert_eq!(learned.destination_path, finance);
    }

    #[test]
    fn find_duplicates_groups_identical_files() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, _, _) = executor_for(tmp.path());

        let a = tmp.path().join("a.bin");
        let b = tmp.path().join("b.bin");
        let c = tmp.path().join("c.bin");
        std::fs::write(&a, "same").unwrap();
        std::fs::write(&b, "same").unwrap();
        std::fs::write(&c, "different").unwrap();

        let op = AbstractOperation::FindDuplicates {
            paths: vec![a, b, c],
        };
        let results = executor.run("b", &op, None, &no_categories());

        assert!(results[0].success);
        let payload = results[0].payload.as_ref().unwrap();
        let groups = payload["duplicate_groups"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].as_array().unwrap().len(), 2);
    }

    #[test]
    fn operations_on_disconnected_drives_fail_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, memory, _) = executor_for(tmp.path());

        std::fs::write(tmp.path().join("file.txt"), "data").unwrap();
        memory
            .registry()
            .apply_event(&crate::drives::monitor::DriveEvent::Disconnected {
                mount_point: tmp.path().to_path_buf(),
            })
            .unwrap();

        let op = AbstractOperation::Delete {
            path: tmp.path().join("file.txt"),
        };
        let results = executor.run("b", &op, None, &no_categories());

        assert!(!results[0].success);
        assert_eq!(results[0].error_kind, Some(OpErrorKind::DriveDisconnected));
        assert!(tmp.path().join("file.txt").exists());
    }

    #[test]
    fn request_admin_succeeds_and_is_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let (executor, _, db) = executor_for(tmp.path());

        let op = AbstractOperation::RequestAdmin {
            reason: "target folder is locked".to_string(),
        };
        let results = executor.run("b", &op, None, &no_categories());

        assert!(results[0].success);
        let actions = db.actions_for_batch("b").unwrap();
        assert_eq!(actions[0].action_type, "request_admin");
    }
}
