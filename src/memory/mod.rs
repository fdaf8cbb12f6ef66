// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Destination memory: learned category and series destinations
//!
//! Confidence is a bias handed to the AI, never a hard rule. Acceptance
//! nudges it up (bounded), rejection decays it; rows are never deleted,
//! so competing destinations coexist and are ranked by confidence with a
//! most-recently-used tie-break.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::LearningConfig;
use crate::db::Database;
use crate::drives::monitor::DriveEvent;
use crate::drives::{DriveRecord, DriveRegistry};
use crate::{Result, TaxisError};

/// Confidence never saturates fully; the AI should always see a bias,
/// not a certainty.
pub const CONFIDENCE_CAP: f64 = 0.99;
/// Rejected mappings keep a trace of history instead of vanishing.
pub const CONFIDENCE_FLOOR: f64 = 0.05;

/// Learned category -> destination association
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationMapping {
    pub id: i64,
    pub user_id: String,
    pub file_category: String,
    pub destination_path: PathBuf,
    pub confidence_score: f64,
    pub usage_count: i64,
    pub last_used: DateTime<Utc>,
}

/// Learned TV-series -> destination association with a season layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesMapping {
    pub id: i64,
    pub user_id: String,
    pub series_name: String,
    pub destination_path: PathBuf,
    pub season_structure: String,
    pub confidence_score: f64,
    pub usage_count: i64,
    pub last_used: DateTime<Utc>,
}

/// A drive state change applied while draining the monitor queue
#[derive(Debug, Clone)]
pub struct DriveChange {
    pub connected: bool,
    pub record: DriveRecord,
}

/// Per-user destination memory. Exclusively owns the drive registry;
/// every other component reaches drive state through here.
pub struct DestinationMemory {
    user_id: String,
    db: Database,
    registry: DriveRegistry,
    learning: LearningConfig,
    drive_events: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<DriveEvent>>>,
}

impl DestinationMemory {
    pub fn new(user_id: &str, db: Database, learning: LearningConfig) -> Self {
        let registry = DriveRegistry::new(user_id, db.clone());
        Self {
            user_id: user_id.to_string(),
            db,
            registry,
            learning,
            drive_events: Mutex::new(None),
        }
    }

    /// Memory with an explicit registry (tests inject probes).
    pub fn with_registry(
        user_id: &str,
        db: Database,
        registry: DriveRegistry,
        learning: LearningConfig,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            db,
            registry,
            learning,
            drive_events: Mutex::new(None),
        }
    }

    /// Attach the inbound queue fed by the background drive monitor.
    pub fn attach_monitor(&self, rx: tokio::sync::mpsc::UnboundedReceiver<DriveEvent>) {
        *self.drive_events.lock().expect("drive event queue lock") = Some(rx);
    }

    /// Best destination for a file category, if any.
    pub fn lookup(&self, file_category: &str) -> Result<Option<DestinationMapping>> {
        self.db.best_mapping(&self.user_id, file_category)
    }

    /// Best destination for a TV series, if any.
    pub fn lookup_series(&self, series_name: &str) -> Result<Option<SeriesMapping>> {
        self.db.best_series(&self.user_id, series_name)
    }

    /// All mappings, for prompt context and inspection.
    pub fn mappings(&self) -> Result<Vec<DestinationMapping>> {
        self.db.list_mappings(&self.user_id)
    }

    pub fn series(&self) -> Result<Vec<SeriesMapping>> {
        self.db.list_series(&self.user_id)
    }

    /// Learn from one organize outcome. Accepted outcomes reinforce the
    /// mapping (creating it on first sight); rejections decay it without
    /// deleting, so drifting preferences overtake old ones gradually.
    pub fn record_outcome(
        &self,
        file_category: &str,
        destination: &Path,
        accepted: bool,
    ) -> Result<()> {
        let destination = self.checked_destination(destination, accepted)?;

        if accepted {
            debug!("reinforcing {} -> {}", file_category, destination);
            self.db.bump_mapping(
                &self.user_id,
                file_category,
                &destination,
                self.learning.initial_confidence,
                self.learning.confidence_step,
                CONFIDENCE_CAP,
            )
        } else {
            debug!("decaying {} -> {}", file_category, destination);
            self.db.decay_mapping(
                &self.user_id,
                file_category,
                &destination,
                self.learning.decay_factor,
                CONFIDENCE_FLOOR,
            )
        }
    }

    /// Series variant of [`Self::record_outcome`].
    pub fn record_series_outcome(
        &self,
        series_name: &str,
        destination: &Path,
        season_structure: &str,
        accepted: bool,
    ) -> Result<()> {
        let destination = self.checked_destination(destination, accepted)?;

        if accepted {
            self.db.bump_series(
                &self.user_id,
                series_name,
                &destination,
                season_structure,
                self.learning.initial_confidence,
                self.learning.confidence_step,
                CONFIDENCE_CAP,
            )
        } else {
            self.db.decay_series(
                &self.user_id,
                series_name,
                &destination,
                self.learning.decay_factor,
                CONFIDENCE_FLOOR,
            )
        }
    }

    /// Current drive records; the single gateway to the registry.
    pub fn drives(&self) -> Result<Vec<DriveRecord>> {
        self.registry.discover()
    }

    /// Registry access for wiring (tests and discovery seeding).
    pub fn registry(&self) -> &DriveRegistry {
        &self.registry
    }

    /// Drain pending monitor events and apply them to the registry.
    /// Called between batches; the monitor never mutates state itself.
    pub fn drain_drive_events(&self) -> Result<Vec<DriveChange>> {
        let mut guard = self.drive_events.lock().expect("drive event queue lock");
        let Some(rx) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let connected = matches!(event, DriveEvent::Connected(_));
            if let Some(record) = self.registry.apply_event(&event)? {
                info!(
                    "drive {} {}",
                    record.primary_identifier,
                    if connected { "connected" } else { "disconnected" }
                );
                changes.push(DriveChange { connected, record });
            }
        }
        Ok(changes)
    }

    /// A stored destination must resolve under a known drive prefix, even
    /// a disconnected one. Memory never points at volumes it has not
    /// observed. Decays skip the check: the row already exists.
    fn checked_destination(&self, destination: &Path, enforce: bool) -> Result<String> {
        if enforce {
            let prefixes = self.registry.known_prefixes()?;
            let known = prefixes.iter().any(|p| destination.starts_with(p));
            if !known {
                return Err(TaxisError::UnknownVolume(
                    destination.display().to_string(),
                ));
            }
        }
        Ok(destination.to_string_lossy().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drives::identity::IdentityProbe;
    use crate::drives::MountSnapshot;

    fn memory_with_root(root: &Path) -> DestinationMemory {
        let db = Database::in_memory().unwrap();
        let probe = IdentityProbe::with_roots(
            root.join("no-sysfs"),
            root.join("no-uuid"),
        );
        let registry = DriveRegistry::with_probe("u", db.clone(), probe);
        registry
            .discover_from(vec![MountSnapshot {
                mount_point: root.to_path_buf(),
                label: "root".to_string(),
                total_bytes: 1_000_000_000,
                removable: false,
                file_system: "ext4".to_string(),
                device: None,
            }])
            .unwrap();
        DestinationMemory::with_registry("u", db, registry, LearningConfig::default())
    }

    #[test]
    fn learning_is_monotonic_over_acceptances() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = memory_with_root(tmp.path());
        let dest = tmp.path().join("Invoices");

        memory.record_outcome("invoices", &dest, true).unwrap();
        let after_one = memory.lookup("invoices").unwrap().unwrap().confidence_score;

        memory.record_outcome("invoices", &dest, true).unwrap();
        memory.record_outcome("invoices", &dest, true).unwrap();
        let after_three = memory.lookup("invoices").unwrap().unwrap();

        assert!(after_three.confidence_score >= after_one);
        assert_eq!(after_three.usage_count, 3);
        assert_eq!(after_three.destination_path, dest);
    }

    #[test]
    fn rejection_decays_without_deleting() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = memory_with_root(tmp.path());
        let dest = tmp.path().join("Docs");

        memory.record_outcome("docs", &dest, true).unwrap();
        let before = memory.lookup("docs").unwrap().unwrap().confidence_score;

        memory.record_outcome("docs", &dest, false).unwrap();
        let after = memory.lookup("docs").unwrap().unwrap();

        assert!(after.confidence_score < before);
        assert!(after.confidence_score >= CONFIDENCE_FLOOR);
    }

    #[test]
    fn competing_destination_creates_second_row_and_recency_breaks_ties() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = memory_with_root(tmp.path());
        let old = tmp.path().join("Old");
        let new = tmp.path().join("New");

        memory.record_outcome("photos", &old, true).unwrap();
        memory.record_outcome("photos", &new, true).unwrap();

        assert_eq!(memory.mappings().unwrap().len(), 2);
        // Equal confidence; the most recently used destination wins.
        let best = memory.lookup("photos").unwrap().unwrap();
        assert_eq!(best.destination_path, new);
    }

    #[test]
    fn phantom_volume_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = memory_with_root(tmp.path());

        let err = memory
            .record_outcome("docs", Path::new("/somewhere/never/seen"), true)
            .unwrap_err();
        assert!(matches!(err, TaxisError::UnknownVolume(_)));
        assert!(memory.lookup("docs").unwrap().is_none());
    }

    #[test]
    fn series_lookup_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = memory_with_root(tmp.path());
        let dest = tmp.path().join("TV").join("Severance");

        memory
            .record_series_outcome("Severance", &dest, "Season {:02}", true)
            .unwrap();

        let found = memory.lookup_series("Severance").unwrap().unwrap();
        assert_eq!(found.destination_path, dest);
        assert_eq!(found.season_structure, "Season {:02}");
    }
}
