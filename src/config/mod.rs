// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for Taxis

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// User this instance organizes for; isolates memory and drive state
    #[serde(default = "default_user")]
    pub user_id: String,

    /// AI engine configuration
    pub ai_engine: EngineConfig,

    /// Context scanning settings
    #[serde(default)]
    pub scan: ScanConfig,

    /// Prompt templates
    pub prompts: PromptConfig,

    /// Drive discovery settings
    #[serde(default)]
    pub drives: DriveConfig,

    /// Destination-memory learning settings
    #[serde(default)]
    pub learning: LearningConfig,

    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    pub url: String,
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanConfig {
    /// Maximum directory depth included in the AI context
    #[serde(default = "default_scan_depth")]
    pub max_depth: usize,

    /// Maximum number of files described per batch
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Content excerpt size in bytes for PDF/DOCX/text files
    #[serde(default = "default_excerpt_bytes")]
    pub excerpt_bytes: usize,

    /// Glob patterns excluded from scans, in addition to built-in skips
    #[serde(default)]
    pub ignore_globs: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptConfig {
    pub organize: String,
    #[serde(default = "default_series_prompt")]
    pub series: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DriveConfig {
    /// Directories whose children are candidate removable mounts
    #[serde(default = "default_mount_roots")]
    pub mount_roots: Vec<String>,

    /// Fallback poll interval for the hotplug monitor
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LearningConfig {
    /// Confidence granted to a mapping on first acceptance
    #[serde(default = "default_initial_confidence")]
    pub initial_confidence: f64,

    /// Confidence added per repeated acceptance (bounded at max)
    #[serde(default = "default_confidence_step")]
    pub confidence_step: f64,

    /// Multiplier applied when a mapping is rejected or overridden
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

// Default value functions
fn default_user() -> String { "default".to_string() }
fn default_timeout() -> u64 { 120 }
fn default_retries() -> u32 { 3 }
fn default_scan_depth() -> usize { 3 }
fn default_max_files() -> usize { 200 }
fn default_excerpt_bytes() -> usize { 2000 }
fn default_poll_secs() -> u64 { 15 }
fn default_initial_confidence() -> f64 { 0.5 }
fn default_confidence_step() -> f64 { 0.1 }
fn default_decay_factor() -> f64 { 0.6 }
fn default_db_path() -> String { "taxis.db".to_string() }

fn default_mount_roots() -> Vec<String> {
    vec![
        "/media".to_string(),
        "/run/media".to_string(),
        "/mnt".to_string(),
    ]
}

fn default_series_prompt() -> String {
    "When a file belongs to a TV series, place it under the series folder \
     using the recorded season structure. Known series are listed below."
        .to_string()
}

fn default_organize_prompt() -> String {
    "You are a file organization planner. Given the directory tree, file \
     details and learned destinations below, reply with ONLY a JSON object:\n\
     {\"operations\": [...], \"explanations\": [...], \"fallback_operations\": [...]}\n\
     Each operation is an object with a \"type\" field drawn from: list_dir, \
     get_info, get_permissions, check_exists, get_size, get_disk_space, mkdir, \
     move, copy, delete, rename, extract, compress, list_archive, \
     set_permissions, change_owner, check_access, request_admin, read_text, \
     get_metadata, hash_file, find_duplicates. Provide exactly one explanation \
     string per operation, in order. fallback_operations is a parallel array \
     (null where no fallback applies) tried only if the primary fails. \
     Folders containing a .git directory are projects; move them as a whole, \
     never file by file. Strip junk prefixes and release tags from target \
     names."
        .to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user_id: default_user(),
            ai_engine: EngineConfig {
                url: "http://localhost:11434".to_string(),
                model: "llama3.2:3b".to_string(),
                timeout_secs: default_timeout(),
                retries: default_retries(),
            },
            scan: ScanConfig::default(),
            prompts: PromptConfig {
                organize: default_organize_prompt(),
                series: default_series_prompt(),
            },
            drives: DriveConfig::default(),
            learning: LearningConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: default_scan_depth(),
            max_files: default_max_files(),
            excerpt_bytes: default_excerpt_bytes(),
            ignore_globs: Vec::new(),
        }
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            mount_roots: default_mount_roots(),
            poll_secs: default_poll_secs(),
        }
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            initial_confidence: default_initial_confidence(),
            confidence_step: default_confidence_step(),
            decay_factor: default_decay_factor(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| crate::TaxisError::Config(format!("Failed to parse config: {}", e)))?;
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.user_id, "default");
        assert_eq!(back.scan.max_depth, 3);
        assert_eq!(back.drives.mount_roots.len(), 3);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let json = r#"{
            "ai_engine": {"url": "http://localhost:11434", "model": "llama3.2:3b"},
            "prompts": {"organize": "plan"}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ai_engine.timeout_secs, 120);
        assert_eq!(config.learning.confidence_step, 0.1);
        assert!(!config.prompts.series.is_empty());
    }
}
