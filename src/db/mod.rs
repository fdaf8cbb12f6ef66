// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Database module: learned mappings, drive registry state, audit trail
//!
//! One SQLite file per user keeps writers isolated; the connection mutex
//! provides the single-writer discipline the learning updates rely on.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::drives::{DriveRecord, DriveType, IdentifierType};
use crate::memory::{DestinationMapping, SeriesMapping};
use crate::{Result, TaxisError};

/// Database manager (thread-safe wrapper)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// One row of the append-only `file_actions` audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAction {
    pub id: i64,
    pub user_id: String,
    pub batch_id: String,
    pub action_type: String,
    pub file_name: Option<String>,
    pub source_path: Option<String>,
    pub destination_path: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate statistics for status displays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub mapping_count: i64,
    pub series_count: i64,
    pub drive_count: i64,
    pub action_count: i64,
}

impl Database {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TaxisError::Config("Database lock poisoned".to_string()))
    }

    /// Initialize database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS destination_mappings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                file_category TEXT NOT NULL,
                destination_path TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 1,
                last_used TEXT NOT NULL,
                UNIQUE(user_id, file_category, destination_path)
            );

            CREATE TABLE IF NOT EXISTS series_mappings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                series_name TEXT NOT NULL,
                destination_path TEXT NOT NULL,
                season_structure TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 1,
                last_used TEXT NOT NULL,
                UNIQUE(user_id, series_name, destination_path)
            );

            CREATE TABLE IF NOT EXISTS user_drives (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                current_path TEXT NOT NULL,
                drive_type TEXT NOT NULL,
                label TEXT NOT NULL,
                primary_identifier TEXT NOT NULL,
                identifier_type TEXT NOT NULL,
                is_connected INTEGER NOT NULL DEFAULT 1,
                last_seen TEXT NOT NULL,
                UNIQUE(user_id, primary_identifier)
            );

            CREATE TABLE IF NOT EXISTS file_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                batch_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                file_name TEXT,
                source_path TEXT,
                destination_path TEXT,
                success INTEGER NOT NULL,
                error_message TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_mappings_category
                ON destination_mappings(user_id, file_category);
            CREATE INDEX IF NOT EXISTS idx_series_name
                ON series_mappings(user_id, series_name);
            CREATE INDEX IF NOT EXISTS idx_actions_batch
                ON file_actions(batch_id);
        "#,
        )?;
        Ok(())
    }

    // === Drives ===

    /// Insert or refresh a drive record. The identity key absorbs mount
    /// path changes: a replugged drive updates in place.
    pub fn upsert_drive(&self, record: &DriveRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO user_drives
               (id, user_id, current_path, drive_type, label, primary_identifier,
                identifier_type, is_connected, last_seen)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(user_id, primary_identifier) DO UPDATE SET
                   current_path = excluded.current_path,
                   drive_type = excluded.drive_type,
                   label = excluded.label,
                   is_connected = excluded.is_connected,
                   last_seen = excluded.last_seen"#,
            params![
                record.id,
                record.user_id,
                record.current_path.to_string_lossy(),
                record.drive_type.as_str(),
                record.label,
                record.primary_identifier,
                record.identifier_type.as_str(),
                record.is_connected as i64,
                record.last_seen.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_drive_disconnected(
        &self,
        user_id: &str,
        primary_identifier: &str,
        when: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"UPDATE user_drives SET is_connected = 0, last_seen = ?3
               WHERE user_id = ?1 AND primary_identifier = ?2"#,
            params![user_id, primary_identifier, when.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_drive(
        &self,
        user_id: &str,
        primary_identifier: &str,
    ) -> Result<Option<DriveRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, user_id, current_path, drive_type, label, primary_identifier,
                      identifier_type, is_connected, last_seen
               FROM user_drives WHERE user_id = ?1 AND primary_identifier = ?2"#,
        )?;
        let mut rows = stmt
            .query_map(params![user_id, primary_identifier], drive_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.pop())
    }

    pub fn list_drives(&self, user_id: &str) -> Result<Vec<DriveRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, user_id, current_path, drive_type, label, primary_identifier,
                      identifier_type, is_connected, last_seen
               FROM user_drives WHERE user_id = ?1 ORDER BY last_seen DESC"#,
        )?;
        let drives = stmt
            .query_map(params![user_id], drive_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(drives)
    }

    // === Destination mappings ===

    /// Record an accepted outcome: bump the existing row or create one.
    pub fn bump_mapping(
        &self,
        user_id: &str,
        category: &str,
        destination: &str,
        initial: f64,
        step: f64,
        cap: f64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"INSERT INTO destination_mappings
               (user_id, file_category, destination_path, confidence_score, usage_count, last_used)
               VALUES (?1, ?2, ?3, ?4, 1, ?5)
               ON CONFLICT(user_id, file_category, destination_path) DO UPDATE SET
                   usage_count = usage_count + 1,
                   confidence_score = MIN(?6, confidence_score + ?7),
                   last_used = excluded.last_used"#,
            params![user_id, category, destination, initial, now, cap, step],
        )?;
        Ok(())
    }

    /// Record a rejected outcome: decay confidence, keep the row.
    pub fn decay_mapping(
        &self,
        user_id: &str,
        category: &str,
        destination: &str,
        factor: f64,
        floor: f64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"UPDATE destination_mappings
               SET confidence_score = MAX(?5, confidence_score * ?4)
               WHERE user_id = ?1 AND file_category = ?2 AND destination_path = ?3"#,
            params![user_id, category, destination, factor, floor],
        )?;
        Ok(())
    }

    /// Highest-confidence mapping for a category; ties go to the most
    /// recently used row.
    pub fn best_mapping(&self, user_id: &str, category: &str) -> Result<Option<DestinationMapping>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, user_id, file_category, destination_path, confidence_score,
                      usage_count, last_used
               FROM destination_mappings
               WHERE user_id = ?1 AND file_category = ?2
               ORDER BY confidence_score DESC, last_used DESC LIMIT 1"#,
        )?;
        let mut rows = stmt
            .query_map(params![user_id, category], mapping_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.pop())
    }

    pub fn list_mappings(&self, user_id: &str) -> Result<Vec<DestinationMapping>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, user_id, file_category, destination_path, confidence_score,
                      usage_count, last_used
               FROM destination_mappings WHERE user_id = ?1
               ORDER BY file_category, confidence_score DESC, last_used DESC"#,
        )?;
        let mappings = stmt
            .query_map(params![user_id], mapping_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mappings)
    }

    // === Series mappings ===

    pub fn bump_series(
        &self,
        user_id: &str,
        series_name: &str,
        destination: &str,
        season_structure: &str,
        initial: f64,
        step: f64,
        cap: f64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"INSERT INTO series_mappings
               (user_id, series_name, destination_path, season_structure,
                confidence_score, usage_count, last_used)
               VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
               ON CONFLICT(user_id, series_name, destination_path) DO UPDATE SET
                   usage_count = usage_count + 1,
                   confidence_score = MIN(?7, confidence_score + ?8),
                   season_structure = excluded.season_structure,
                   last_used = excluded.last_used"#,
            params![
                user_id,
                series_name,
                destination,
                season_structure,
                initial,
                now,
                cap,
                step
            ],
        )?;
        Ok(())
    }

    pub fn decay_series(
        &self,
        user_id: &str,
        series_name: &str,
        destination: &str,
        factor: f64,
        floor: f64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"UPDATE series_mappings
               SET confidence_score = MAX(?5, confidence_score * ?4)
               WHERE user_id = ?1 AND series_name = ?2 AND destination_path = ?3"#,
            params![user_id, series_name, destination, factor, floor],
        )?;
        Ok(())
    }

    pub fn best_series(&self, user_id: &str, series_name: &str) -> Result<Option<SeriesMapping>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, user_id, series_name, destination_path, season_structure,
                      confidence_score, usage_count, last_used
               FROM series_mappings
               WHERE user_id = ?1 AND series_name = ?2
               ORDER BY confidence_score DESC, last_used DESC LIMIT 1"#,
        )?;
        let mut rows = stmt
            .query_map(params![user_id, series_name], series_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.pop())
    }

    pub fn list_series(&self, user_id: &str) -> Result<Vec<SeriesMapping>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, user_id, series_name, destination_path, season_structure,
                      confidence_score, usage_count, last_used
               FROM series_mappings WHERE user_id = ?1
               ORDER BY series_name, confidence_score DESC"#,
        )?;
        let series = stmt
            .query_map(params![user_id], series_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(series)
    }

    // === Audit trail ===

    /// Append one attempt to the audit trail. Rows are never updated.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_action(
        &self,
        user_id: &str,
        batch_id: &str,
        action_type: &str,
        file_name: Option<&str>,
        source_path: Option<&str>,
        destination_path: Option<&str>,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO file_actions
               (user_id, batch_id, action_type, file_name, source_path,
                destination_path, success, error_message, timestamp)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                user_id,
                batch_id,
                action_type,
                file_name,
                source_path,
                destination_path,
                success as i64,
                error_message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_actions(&self, user_id: &str, limit: usize) -> Result<Vec<FileAction>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, user_id, batch_id, action_type, file_name, source_path,
                      destination_path, success, error_message, timestamp
               FROM file_actions WHERE user_id = ?1
               ORDER BY id DESC LIMIT ?2"#,
        )?;
        let actions = stmt
            .query_map(params![user_id, limit as i64], action_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(actions)
    }

    pub fn actions_for_batch(&self, batch_id: &str) -> Result<Vec<FileAction>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, user_id, batch_id, action_type, file_name, source_path,
                      destination_path, success, error_message, timestamp
               FROM file_actions WHERE batch_id = ?1 ORDER BY id"#,
        )?;
        let actions = stmt
            .query_map(params![batch_id], action_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(actions)
    }

    /// Get database statistics
    pub fn get_stats(&self, user_id: &str) -> Result<DbStats> {
        let conn = self.lock_conn()?;
        let count = |sql: &str| -> rusqlite::Result<i64> {
            conn.query_row(sql, params![user_id], |row| row.get(0))
        };
        Ok(DbStats {
            mapping_count: count("SELECT COUNT(*) FROM destination_mappings WHERE user_id = ?1")?,
            series_count: count("SELECT COUNT(*) FROM series_mappings WHERE user_id = ?1")?,
            drive_count: count("SELECT COUNT(*) FROM user_drives WHERE user_id = ?1")?,
            action_count: count("SELECT COUNT(*) FROM file_actions WHERE user_id = ?1")?,
        })
    }

    /// Vacuum database
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("VACUUM", [])?;
        Ok(())
    }
}

fn drive_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DriveRecord> {
    let drive_type: String = row.get(3)?;
    let identifier_type: String = row.get(6)?;
    let last_seen: String = row.get(8)?;
    Ok(DriveRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        current_path: PathBuf::from(row.get::<_, String>(2)?),
        drive_type: DriveType::parse(&drive_type).unwrap_or(DriveType::Local),
        label: row.get(4)?,
        primary_identifier: row.get(5)?,
        identifier_type: IdentifierType::parse(&identifier_type)
            .unwrap_or(IdentifierType::LabelSize),
        is_connected: row.get::<_, i64>(7)? != 0,
        last_seen: parse_timestamp(&last_seen),
    })
}

fn mapping_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DestinationMapping> {
    let last_used: String = row.get(6)?;
    Ok(DestinationMapping {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_category: row.get(2)?,
        destination_path: PathBuf::from(row.get::<_, String>(3)?),
        confidence_score: row.get(4)?,
        usage_count: row.get(5)?,
        last_used: parse_timestamp(&last_used),
    })
}

fn series_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SeriesMapping> {
    let last_used: String = row.get(7)?;
    Ok(SeriesMapping {
        id: row.get(0)?,
        user_id: row.get(1)?,
        series_name: row.get(2)?,
        destination_path: PathBuf::from(row.get::<_, String>(3)?),
        season_structure: row.get(4)?,
        confidence_score: row.get(5)?,
        usage_count: row.get(6)?,
        last_used: parse_timestamp(&last_used),
    })
}

fn action_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileAction> {
    let timestamp: String = row.get(9)?;
    Ok(FileAction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        batch_id: row.get(2)?,
        action_type: row.get(3)?,
        file_name: row.get(4)?,
        source_path: row.get(5)?,
        destination_path: row.get(6)?,
        success: row.get::<_, i64>(7)? != 0,
        error_message: row.get(8)?,
        timestamp: parse_timestamp(&timestamp),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_bump_and_decay() {
        let db = Database::in_memory().unwrap();

        db.bump_mapping("u", "invoices", "/docs/Invoices", 0.5, 0.1, 0.99)
            .unwrap();
        db.bump_mapping("u", "invoices", "/docs/Invoices", 0.5, 0.1, 0.99)
            .unwrap();

        let best = db.best_mapping("u", "invoices").unwrap().unwrap();
        assert_eq!(best.usage_count, 2);
        assert!((best.confidence_score - 0.6).abs() < 1e-9);

        db.decay_mapping("u", "invoices", "/docs/Invoices", 0.6, 0.05)
            .unwrap();
        let decayed = db.best_mapping("u", "invoices").unwrap().unwrap();
        assert!(decayed.confidence_score < 0.6);
        assert_eq!(decayed.usage_count, 2);
    }

    #[test]
    fn confidence_capped() {
        let db = Database::in_memory().unwrap();
        for _ in 0..20 {
            db.bump_mapping("u", "music", "/Music", 0.5, 0.1, 0.99).unwrap();
        }
        let best = db.best_mapping("u", "music").unwrap().unwrap();
        assert!(best.confidence_score <= 0.99);
    }

    #[test]
    fn competing_destinations_keep_both_rows() {
        let db = Database::in_memory().unwrap();
        db.bump_mapping("u", "photos", "/Pictures", 0.5, 0.1, 0.99).unwrap();
        db.bump_mapping("u", "photos", "/Backup/Pictures", 0.5, 0.1, 0.99)
            .unwrap();

        let all = db.list_mappings("u").unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn users_are_isolated() {
        let db = Database::in_memory().unwrap();
        db.bump_mapping("alice", "docs", "/a", 0.5, 0.1, 0.99).unwrap();
        assert!(db.best_mapping("bob", "docs").unwrap().is_none());
    }

    #[test]
    fn audit_rows_accumulate() {
        let db = Database::in_memory().unwrap();
        db.insert_action("u", "b1", "move", Some("a.mkv"), Some("/dl/a.mkv"), Some("/Movies/a.mkv"), true, None)
            .unwrap();
        db.insert_action("u", "b1", "delete", Some("junk"), Some("/dl/junk"), None, false, Some("permission_denied: locked"))
            .unwrap();

        let rows = db.actions_for_batch("b1").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].success);
        assert!(!rows[1].success);
        assert!(rows[1].error_message.as_deref().unwrap().contains("permission_denied"));
    }
}
