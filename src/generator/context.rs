// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Organize-context assembly
//!
//! Everything the AI sees about the disk is gathered here: a bounded
//! directory tree, per-file metadata with content excerpts, archive
//! listings, and the learned destination hints. Depth and file counts
//! are capped to keep prompts bounded on large trees.

use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader as XmlReader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::memory::{DestinationMapping, DestinationMemory, SeriesMapping};
use crate::{Result, TaxisError};

/// Summary of an archive's contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveListing {
    pub file_count: usize,
    pub total_bytes: u64,
    pub extensions: HashMap<String, usize>,
    pub sample_files: Vec<String>,
}

/// What the generator should do about an archive before organizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveAdvice {
    /// Contents already present at the destination; the archive is
    /// redundant and a `delete` should be proposed.
    Redundant { archive: PathBuf, found_at: PathBuf },
    /// Contents not present anywhere yet; propose `extract` first.
    ExtractFirst { archive: PathBuf },
}

/// Per-file metadata handed to the AI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    pub extension: String,
    pub category: Option<String>,
    pub content_excerpt: Option<String>,
    /// Directory containing a `.git`; moved as a whole, never file by file
    pub is_git_project: bool,
    pub archive: Option<ArchiveListing>,
}

/// Everything the generator needs to build one prompt
#[derive(Debug, Clone)]
pub struct OrganizeContext {
    pub source_root: PathBuf,
    pub destination_hint: Option<PathBuf>,
    pub tree: String,
    pub files: Vec<FileSnapshot>,
    pub memory_hints: Vec<DestinationMapping>,
    pub series_hints: Vec<SeriesMapping>,
    pub archive_advice: Vec<ArchiveAdvice>,
}

impl OrganizeContext {
    /// Category of a scanned file, for post-execution learning.
    pub fn category_of(&self, path: &Path) -> Option<String> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .and_then(|f| f.category.clone())
    }
}

/// Context builder with scan bounds from configuration
pub struct ContextBuilder {
    scan: ScanConfig,
    ignore: Vec<glob::Pattern>,
}

impl ContextBuilder {
    pub fn new(scan: ScanConfig) -> Self {
        let ignore = scan
            .ignore_globs
            .iter()
            .filter_map(|g| match glob::Pattern::new(g) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("ignoring bad glob '{}': {}", g, e);
                    None
                }
            })
            .collect();
        Self { scan, ignore }
    }

    /// Scan the source tree and assemble the context.
    pub fn build(
        &self,
        source_root: &Path,
        memory: &DestinationMemory,
        destination_hint: Option<PathBuf>,
    ) -> Result<OrganizeContext> {
        if !source_root.is_dir() {
            return Err(TaxisError::Config(format!(
                "source {:?} is not a directory",
                source_root
            )));
        }

        let mut tree = String::new();
        let mut files = Vec::new();
        let mut git_roots: Vec<PathBuf> = Vec::new();

        for entry in WalkDir::new(source_root)
            .min_depth(1)
            .max_depth(self.scan.max_depth)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("scan error: {}", e);
                    continue;
                }
            };
            let path = entry.path();

            if !self.should_scan(path) {
                continue;
            }

            // Anything inside a project folder is part of that project.
            if git_roots.iter().any(|root| path.starts_with(root)) {
                continue;
            }

            let depth = entry.depth();
            let indent = "  ".repeat(depth.saturating_sub(1));

            if entry.file_type().is_dir() {
                if path.join(".git").is_dir() {
                    git_roots.push(path.to_path_buf());
                    tree.push_str(&format!("{}{}/ (git project)\n", indent, entry_name(path)));
                    files.push(self.project_snapshot(path));
                } else {
                    tree.push_str(&format!("{}{}/\n", indent, entry_name(path)));
                }
            } else if entry.file_type().is_file() {
                tree.push_str(&format!("{}{}\n", indent, entry_name(path)));
                if files.len() < self.scan.max_files {
                    files.push(self.file_snapshot(path, &entry));
                }
            }
        }

        let memory_hints = memory.mappings()?;
        let series_hints = memory.series()?;
        let archive_advice = archive_advice(&files, destination_hint.as_deref());

        Ok(OrganizeContext {
            source_root: source_root.to_path_buf(),
            destination_hint,
            tree,
            files,
            memory_hints,
            series_hints,
            archive_advice,
        })
    }

    fn should_scan(&self, path: &Path) -> bool {
        if !should_process(path) {
            return false;
        }
        let name = entry_name(path);
        !self.ignore.iter().any(|p| p.matches(name))
    }

    fn file_snapshot(&self, path: &Path, entry: &walkdir::DirEntry) -> FileSnapshot {
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let name = entry_name(path).to_string();

        let archive = if is_archive(&extension) {
            match list_archive(path) {
                Ok(listing) => Some(listing),
                Err(e) => {
                    debug!("archive listing failed for {:?}: {}", path, e);
                    None
                }
            }
        } else {
            None
        };

        let content_excerpt = self.excerpt(path, &extension);

        FileSnapshot {
            path: path.to_path_buf(),
            name: name.clone(),
            size_bytes,
            category: infer_category(&name, &extension),
            extension,
            content_excerpt,
            is_git_project: false,
            archive,
        }
    }

    fn project_snapshot(&self, path: &Path) -> FileSnapshot {
        FileSnapshot {
            path: path.to_path_buf(),
            name: entry_name(path).to_string(),
            size_bytes: 0,
            extension: String::new(),
            category: Some("Code".to_string()),
            content_excerpt: None,
            is_git_project: true,
            archive: None,
        }
    }

    /// Content excerpt for the file types the AI can use text from.
    fn excerpt(&self, path: &Path, extension: &str) -> Option<String> {
        let limit = self.scan.excerpt_bytes;
        let text = match extension {
            "txt" | "md" | "markdown" | "rst" | "log" | "csv" => {
                std::fs::read_to_string(path).ok()?
            }
            "pdf" => {
                let bytes = std::fs::read(path).ok()?;
                pdf_extract::extract_text_from_mem(&bytes).ok()?
            }
            "docx" => extract_docx_text(path).ok()?,
            _ => return None,
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(truncate_utf8(trimmed, limit))
    }
}

/// Extract body text from a DOCX (`word/document.xml` inside the zip).
fn extract_docx_text(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| TaxisError::Archive(format!("Failed to open DOCX: {}", e)))?;

    let mut document_xml = archive
        .by_name("word/document.xml")
        .map_err(|_| TaxisError::Archive("No document.xml found".to_string()))?;

    let mut content = String::new();
    std::io::Read::read_to_string(&mut document_xml, &mut content)?;

    let mut reader = XmlReader::from_str(&content);
    let mut text = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(ref e)) if e.name().as_ref() == b"w:t" => in_text = true,
            Ok(XmlEvent::End(ref e)) if e.name().as_ref() == b"w:t" => {
                in_text = false;
                text.push(' ');
            }
            Ok(XmlEvent::Text(e)) if in_text => {
                text.push_str(&e.unescape().unwrap_or_default());
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => {
                return Err(TaxisError::Archive(format!("DOCX parse error: {}", e)));
            }
            _ => {}
        }
    }

    Ok(text)
}

/// List contents of a ZIP or TAR archive (bounded sample).
pub fn list_archive(path: &Path) -> Result<ArchiveListing> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "zip" | "jar" => list_zip(path),
        "tar" | "tgz" | "gz" => list_tar(path),
        _ => Err(TaxisError::Archive(format!(
            "unsupported archive type '{}'",
            ext
        ))),
    }
}

fn list_zip(path: &Path) -> Result<ArchiveListing> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| TaxisError::Archive(format!("Failed to open ZIP: {}", e)))?;

    let mut listing = ArchiveListing {
        file_count: archive.len(),
        ..Default::default()
    };

    for i in 0..archive.len().min(100) {
        if let Ok(entry) = archive.by_index(i) {
            let name = entry.name().to_string();
            listing.total_bytes += entry.size();

            if let Some(ext) = Path::new(&name).extension().and_then(|e| e.to_str()) {
                *listing.extensions.entry(ext.to_lowercase()).or_insert(0) += 1;
            }
            if listing.sample_files.len() < 20 {
                listing.sample_files.push(name);
            }
        }
    }

    Ok(listing)
}

fn list_tar(path: &Path) -> Result<ArchiveListing> {
    let file = std::fs::File::open(path)?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let reader: Box<dyn std::io::Read> = if ext == "gz" || ext == "tgz" {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = tar::Archive::new(reader);
    let mut listing = ArchiveListing::default();

    for entry in archive
        .entries()
        .map_err(|e| TaxisError::Archive(format!("Failed to read TAR: {}", e)))?
    {
        let Ok(entry) = entry else { continue };
        listing.file_count += 1;
        listing.total_bytes += entry.size();

        if let Ok(path) = entry.path() {
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                *listing.extensions.entry(ext.to_lowercase()).or_insert(0) += 1;
            }
            if listing.sample_files.len() < 20 {
                listing.sample_files.push(path.to_string_lossy().to_string());
            }
        }

        if listing.file_count >= 500 {
            break; // Bound for large archives
        }
    }

    Ok(listing)
}

/// Decide, per archive, whether its contents already live at the
/// destination (delete the archive) or nowhere yet (extract it first).
fn archive_advice(files: &[FileSnapshot], destination: Option<&Path>) -> Vec<ArchiveAdvice> {
    let mut advice = Vec::new();

    for file in files {
        let Some(listing) = &file.archive else { continue };
        if listing.sample_files.is_empty() {
            continue;
        }

        if let Some(dest) = destination {
            let present = listing
                .sample_files
                .iter()
                .filter(|entry| {
                    let name = Path::new(entry)
                        .file_name()
                        .map(PathBuf::from)
                        .unwrap_or_default();
                    !name.as_os_str().is_empty() && tree_contains(dest, &name)
                })
                .count();

            // Treat the archive as redundant when essentially all of its
            // sampled contents are already present.
            if present * 10 >= listing.sample_files.len() * 9 {
                advice.push(ArchiveAdvice::Redundant {
                    archive: file.path.clone(),
                    found_at: dest.to_path_buf(),
                });
                continue;
            }
            if present == 0 {
                advice.push(ArchiveAdvice::ExtractFirst {
                    archive: file.path.clone(),
                });
            }
        } else {
            advice.push(ArchiveAdvice::ExtractFirst {
                archive: file.path.clone(),
            });
        }
    }

    advice
}

fn tree_contains(root: &Path, name: &Path) -> bool {
    WalkDir::new(root)
        .max_depth(4)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name() == name.as_os_str())
}

fn entry_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("?")
}

fn is_archive(extension: &str) -> bool {
    matches!(extension, "zip" | "jar" | "tar" | "gz" | "tgz" | "7z" | "rar")
}

/// Check if a file should enter the context at all
pub fn should_process(path: &Path) -> bool {
    let filename = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };

    // Skip hidden files
    if filename.starts_with('.') {
        return false;
    }

    // Skip temporary files
    let temp_extensions = [".tmp", ".part", ".crdownload", ".partial", ".download"];
    for ext in &temp_extensions {
        if filename.ends_with(ext) {
            return false;
        }
    }

    // Skip system files
    let skip_names = ["desktop.ini", "thumbs.db", ".ds_store"];
    if skip_names.iter().any(|n| filename.eq_ignore_ascii_case(n)) {
        return false;
    }

    true
}

/// Infer a coarse category from the name and extension. Used when the AI
/// omits one, so destination learning still functions.
pub fn infer_category(name: &str, extension: &str) -> Option<String> {
    let name_lower = name.to_lowercase();
    let ext_lower = extension.to_lowercase();

    match ext_lower.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "bmp" | "tiff" => {
            if name_lower.contains("screenshot") {
                Some("Screenshots")
            } else {
                Some("Photos")
            }
        }
        "pdf" => {
            if name_lower.contains("invoice") || name_lower.contains("receipt") {
                Some("Finance")
            } else if name_lower.contains("manual") || name_lower.contains("guide") {
                Some("Manuals")
            } else {
                Some("Documents")
            }
        }
        "mp3" | "wav" | "flac" | "ogg" | "m4a" => Some("Music"),
        "mp4" | "mkv" | "webm" | "avi" | "mov" => {
            if looks_like_episode(&name_lower) {
                Some("Series")
            } else {
                Some("Movies")
            }
        }
        "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "cpp" | "h" => Some("Code"),
        "zip" | "tar" | "gz" | "7z" | "rar" => Some("Archives"),
        "doc" | "docx" | "odt" | "txt" | "md" => Some("Documents"),
        "xls" | "xlsx" | "csv" | "ods" => Some("Spreadsheets"),
        "ppt" | "pptx" | "odp" => Some("Presentations"),
        "iso" | "img" | "dmg" => Some("Disk Images"),
        "exe" | "msi" | "deb" | "rpm" | "appimage" => Some("Installers"),
        _ => None,
    }
    .map(String::from)
}

/// `S01E02`-style markers distinguish series episodes from movies.
fn looks_like_episode(name: &str) -> bool {
    let bytes = name.as_bytes();
    for i in 0..bytes.len() {
        if (bytes[i] == b's') && i + 5 < bytes.len() {
            let rest = &name[i + 1..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                let after = &rest[digits.len()..];
                if after.starts_with('e')
                    && after[1..].chars().next().is_some_and(|c| c.is_ascii_digit())
                {
                    return true;
                }
            }
        }
    }
    false
}

/// Strip junk prefixes/suffixes and illegal characters from a target
/// file name, keeping the extension intact. Applied to `move`/`rename`
/// destinations after parsing; junk removal is part of those operations,
/// not a separate one.
pub fn canonical_target_name(raw: &str) -> String {
    let (stem, ext) = match raw.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < raw.len() => (&raw[..idx], &raw[idx..]),
        _ => (raw, ""),
    };

    let mut clean = stem.to_string();

    // Bracketed release/site tags anywhere in the name
    while let (Some(start), Some(end)) = (clean.find('['), clean.find(']')) {
        if start < end {
            clean.replace_range(start..=end, "");
        } else {
            break;
        }
    }

    // Download-copy suffixes like " (1)"
    while let Some(idx) = clean.rfind('(') {
        let tail = &clean[idx..];
        if tail.ends_with(')') && tail[1..tail.len() - 1].chars().all(|c| c.is_ascii_digit()) {
            clean.truncate(idx);
        } else {
            break;
        }
    }

    for prefix in ["copy of ", "copy_of_", "new "] {
        let lower = clean.to_lowercase();
        if lower.starts_with(prefix) {
            clean = clean[prefix.len()..].to_string();
        }
    }

    // Characters invalid on at least one supported platform
    clean = clean
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();

    clean = clean.trim().trim_matches('.').trim().to_string();
    while clean.contains("  ") {
        clean = clean.replace("  ", " ");
    }
    while clean.contains("__") {
        clean = clean.replace("__", "_");
    }

    if clean.is_empty() {
        clean = "unnamed".to_string();
    }

    format!("{}{}", clean, ext)
}

fn truncate_utf8(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LearningConfig;
    use crate::db::Database;
    use crate::drives::identity::IdentityProbe;
    use crate::drives::{DriveRegistry, MountSnapshot};
    use std::io::Write;

    fn memory_for(root: &Path) -> DestinationMemory {
        let db = Database::in_memory().unwrap();
        let probe = IdentityProbe::with_roots(root.join("ns"), root.join("nu"));
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
        DestinationMemory::with_registry("u", db, registry, LearningConfig::default())
    }

    fn write_zip(path: &Path, names: &[&str]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for name in names {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"data").unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn scan_collects_files_and_skips_junk() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("report.txt"), "quarterly numbers").unwrap();
        std::fs::write(tmp.path().join("partial.crdownload"), "junk").unwrap();
        std::fs::write(tmp.path().join(".hidden"), "junk").unwrap();

        let builder = ContextBuilder::new(ScanConfig::default());
        let memory = memory_for(tmp.path());
        let ctx = builder.build(tmp.path(), &memory, None).unwrap();

        assert_eq!(ctx.files.len(), 1);
        assert_eq!(ctx.files[0].name, "report.txt");
        assert_eq!(
            ctx.files[0].content_excerpt.as_deref(),
            Some("quarterly numbers")
        );
    }

    #[test]
    fn git_projects_are_atomic() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("myproject");
        std::fs::create_dir_all(project.join(".git")).unwrap();
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(project.join("src").join("main.rs"), "fn main() {}").unwrap();

        let builder = ContextBuilder::new(ScanConfig::default());
        let memory = memory_for(tmp.path());
        let ctx = builder.build(tmp.path(), &memory, None).unwrap();

        let project_snap = ctx.files.iter().find(|f| f.name == "myproject").unwrap();
        assert!(project_snap.is_git_project);
        // Nothing inside the project is listed individually.
        assert!(!ctx.files.iter().any(|f| f.name == "main.rs"));
    }

    #[test]
    fn archive_listing_and_extract_advice() {
        let tmp = tempfile::tempdir().unwrap();
        write_zip(&tmp.path().join("photos.zip"), &["a.jpg", "b.jpg"]);

        let builder = ContextBuilder::new(ScanConfig::default());
        let memory = memory_for(tmp.path());
        let dest = tmp.path().join("organized");
        std::fs::create_dir_all(&dest).unwrap();

        let ctx = builder.build(tmp.path(), &memory, Some(dest)).unwrap();

        let snap = ctx.files.iter().find(|f| f.name == "photos.zip").unwrap();
        assert_eq!(snap.archive.as_ref().unwrap().file_count, 2);
        assert!(matches!(
            ctx.archive_advice[0],
            ArchiveAdvice::ExtractFirst { .. }
        ));
    }

    #[test]
    fn archive_already_extracted_is_redundant() {
        let tmp = tempfile::tempdir().unwrap();
        write_zip(&tmp.path().join("photos.zip"), &["a.jpg", "b.jpg"]);

        let dest = tmp.path().join("organized");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("a.jpg"), "x").unwrap();
        std::fs::write(dest.join("b.jpg"), "x").unwrap();

        let builder = ContextBuilder::new(ScanConfig::default());
        let memory = memory_for(tmp.path());
        let ctx = builder.build(tmp.path(), &memory, Some(dest.clone())).unwrap();

        assert!(matches!(
            &ctx.archive_advice[0],
            ArchiveAdvice::Redundant { found_at, .. } if found_at == &dest
        ));
    }

    #[test]
    fn category_inference() {
        assert_eq!(infer_category("invoice_march.pdf", "pdf").as_deref(), Some("Finance"));
        assert_eq!(infer_category("show.s01e02.mkv", "mkv").as_deref(), Some("Series"));
        assert_eq!(infer_category("holiday.mkv", "mkv").as_deref(), Some("Movies"));
        assert_eq!(infer_category("whatever.xyz", "xyz"), None);
    }

    #[test]
    fn target_name_normalization() {
        assert_eq!(canonical_target_name("[YTS] Movie.mkv"), "Movie.mkv");
        assert_eq!(canonical_target_name("report (1).pdf"), "report.pdf");
        assert_eq!(canonical_target_name("Copy of notes.txt"), "notes.txt");
        assert_eq!(canonical_target_name("we|ird<name>.txt"), "weirdname.txt");
        assert_eq!(canonical_target_name("...."), "unnamed");
    }
}
