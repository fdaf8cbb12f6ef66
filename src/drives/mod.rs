// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Drive registry: stable identities for mounted storage
//!
//! Mount paths move; identities do not. The registry keeps one record per
//! `(user, identifier)` pair forever, updating the mutable mount state on
//! every discovery pass so history survives unplug/replug cycles.

pub mod identity;
pub mod monitor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::db::Database;
use crate::Result;
use identity::IdentityProbe;
use monitor::DriveEvent;

/// Volume classes tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveType {
    Local,
    Network,
    Cloud,
    Usb,
}

impl DriveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Network => "network",
            Self::Cloud => "cloud",
            Self::Usb => "usb",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "network" => Some(Self::Network),
            "cloud" => Some(Self::Cloud),
            "usb" => Some(Self::Usb),
            _ => None,
        }
    }
}

/// Identifier tiers, in descending reliability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    UsbSerial,
    PartitionUuid,
    LabelSize,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsbSerial => "usb_serial",
            Self::PartitionUuid => "partition_uuid",
            Self::LabelSize => "label_size",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "usb_serial" => Some(Self::UsbSerial),
            "partition_uuid" => Some(Self::PartitionUuid),
            "label_size" => Some(Self::LabelSize),
            _ => None,
        }
    }
}

/// One physical or logical volume known to the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveRecord {
    pub id: String,
    pub user_id: String,
    pub current_path: PathBuf,
    pub drive_type: DriveType,
    pub label: String,
    pub primary_identifier: String,
    pub identifier_type: IdentifierType,
    pub is_connected: bool,
    pub last_seen: DateTime<Utc>,
}

/// Snapshot of one mounted volume as observed by the platform probe
#[derive(Debug, Clone, PartialEq)]
pub struct MountSnapshot {
    pub mount_point: PathBuf,
    pub label: String,
    pub total_bytes: u64,
    pub removable: bool,
    pub file_system: String,
    /// Backing block device when known, e.g. `/dev/sdb1`
    pub device: Option<PathBuf>,
}

/// Registry of drives for one user, backed by the `user_drives` table.
///
/// Owned exclusively by [`crate::memory::DestinationMemory`]; no other
/// component discovers drives directly.
pub struct DriveRegistry {
    user_id: String,
    db: Database,
    probe: IdentityProbe,
}

impl DriveRegistry {
    pub fn new(user_id: &str, db: Database) -> Self {
        Self {
            user_id: user_id.to_string(),
            db,
            probe: IdentityProbe::new(),
        }
    }

    /// Registry with an injected identity probe (tests fake sysfs).
    pub fn with_probe(user_id: &str, db: Database, probe: IdentityProbe) -> Self {
        Self {
            user_id: user_id.to_string(),
            db,
            probe,
        }
    }

    /// Re-scan mounted volumes and reconcile the stored records.
    pub fn discover(&self) -> Result<Vec<DriveRecord>> {
        self.discover_from(platform_snapshots())
    }

    /// Reconcile against an explicit snapshot list. Connected records whose
    /// identifier is no longer mounted are marked disconnected, never
    /// deleted.
    pub fn discover_from(&self, snapshots: Vec<MountSnapshot>) -> Result<Vec<DriveRecord>> {
        let now = Utc::now();
        let mut seen = HashSet::new();

        for snapshot in &snapshots {
            let identity = self.probe.identify(snapshot);
            seen.insert(identity.identifier.clone());

            let record = DriveRecord {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: self.user_id.clone(),
                current_path: snapshot.mount_point.clone(),
                drive_type: classify(snapshot),
                label: snapshot.label.clone(),
                primary_identifier: identity.identifier,
                identifier_type: identity.kind,
                is_connected: true,
                last_seen: now,
            };
            self.db.upsert_drive(&record)?;
        }

        for record in self.db.list_drives(&self.user_id)? {
            if record.is_connected && !seen.contains(&record.primary_identifier) {
                debug!("drive {} no longer mounted", record.primary_identifier);
                self.db
                    .mark_drive_disconnected(&self.user_id, &record.primary_identifier, now)?;
            }
        }

        self.db.list_drives(&self.user_id)
    }

    /// All records, connected or not.
    pub fn list(&self) -> Result<Vec<DriveRecord>> {
        self.db.list_drives(&self.user_id)
    }

    /// Apply one monitor event. Connect events run the identity chain, so
    /// a drive that merely changed mount path updates in place.
    pub fn apply_event(&self, event: &DriveEvent) -> Result<Option<DriveRecord>> {
        match event {
            DriveEvent::Connected(snapshot) => {
                let identity = self.probe.identify(snapshot);
                let record = DriveRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: self.user_id.clone(),
                    current_path: snapshot.mount_point.clone(),
                    drive_type: classify(snapshot),
                    label: snapshot.label.clone(),
                    primary_identifier: identity.identifier.clone(),
                    identifier_type: identity.kind,
                    is_connected: true,
                    last_seen: Utc::now(),
                };
                self.db.upsert_drive(&record)?;
                info!("drive connected: {} at {:?}", record.primary_identifier, record.current_path);
                self.db
                    .get_drive(&self.user_id, &identity.identifier)
            }
            DriveEvent::Disconnected { mount_point } => {
                let now = Utc::now();
                for record in self.db.list_drives(&self.user_id)? {
                    if record.is_connected && &record.current_path == mount_point {
                        info!("drive disconnected: {}", record.primary_identifier);
                        self.db.mark_drive_disconnected(
                            &self.user_id,
                            &record.primary_identifier,
                            now,
                        )?;
                        return self.db.get_drive(&self.user_id, &record.primary_identifier);
                    }
                }
                Ok(None)
            }
        }
    }

    /// Mount prefixes of every known drive, connected or not. Destination
    /// memory uses these to refuse paths on volumes it never observed.
    pub fn known_prefixes(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|r| r.current_path)
            .collect())
    }
}

/// Classify a mount by its filesystem and removability.
fn classify(snapshot: &MountSnapshot) -> DriveType {
    if snapshot.removable {
        return DriveType::Usb;
    }

    let fs = snapshot.file_system.to_ascii_lowercase();
    let mount = snapshot.mount_point.to_string_lossy();

    if fs.starts_with("nfs")
        || fs == "cifs"
        || fs == "smbfs"
        || fs == "fuse.sshfs"
        || mount.starts_with("//")
    {
        return DriveType::Network;
    }

    if fs.contains("fuse") {
        let hint = format!("{} {}", mount.to_ascii_lowercase(), snapshot.label.to_ascii_lowercase());
        for cloud in ["rclone", "onedrive", "gdrive", "drive", "dropbox", "s3"] {
            if hint.contains(cloud) {
                return DriveType::Cloud;
            }
        }
    }

    DriveType::Local
}

/// Observe currently mounted volumes via sysinfo.
pub fn platform_snapshots() -> Vec<MountSnapshot> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    disks
        .iter()
        .map(|disk| {
            let name = disk.name().to_string_lossy().to_string();
            let device = if name.starts_with("/dev/") {
                Some(PathBuf::from(&name))
            } else {
                None
            };
            MountSnapshot {
                mount_point: disk.mount_point().to_path_buf(),
                label: volume_label(disk.mount_point(), &name),
                total_bytes: disk.total_space(),
                removable: disk.is_removable(),
                file_system: disk.file_system().to_string_lossy().to_string(),
                device,
            }
        })
        .collect()
}

/// Best-effort label: the mount directory name, else the device name.
fn volume_label(mount_point: &Path, device_name: &str) -> String {
    mount_point
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(device_name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn usb_snapshot(mount: &str) -> MountSnapshot {
        MountSnapshot {
            mount_point: PathBuf::from(mount),
            label: "BACKUP".to_string(),
            total_bytes: 64_000_000_000,
            removable: true,
            file_system: "vfat".to_string(),
            device: None,
        }
    }

    fn registry() -> DriveRegistry {
        let tmp = std::env::temp_dir().join("taxis-missing-probe-roots");
        let probe = IdentityProbe::with_roots(tmp.join("sysfs"), tmp.join("by-uuid"));
        DriveRegistry::with_probe("alice", Database::in_memory().unwrap(), probe)
    }

    #[test]
    fn classify_mounts() {
        let mut snap = usb_snapshot("/media/usb1");
        assert_eq!(classify(&snap), DriveType::Usb);

        snap.removable = false;
        snap.file_system = "nfs4".to_string();
        assert_eq!(classify(&snap), DriveType::Network);

        snap.file_system = "fuse.rclone".to_string();
        snap.mount_point = PathBuf::from("/home/alice/gdrive");
        assert_eq!(classify(&snap), DriveType::Cloud);

        snap.file_system = "ext4".to_string();
        snap.mount_point = PathBuf::from("/");
        assert_eq!(classify(&snap), DriveType::Local);
    }

    #[test]
    fn remount_does_not_duplicate() {
        let registry = registry();

        let first = registry.discover_from(vec![usb_snapshot("/media/usb1")]).unwrap();
        assert_eq!(first.len(), 1);
        let identifier = first[0].primary_identifier.clone();

        // Same drive (same label+size identity), new mount path.
        let second = registry.discover_from(vec![usb_snapshot("/media/usb2")]).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].primary_identifier, identifier);
        assert_eq!(second[0].current_path, PathBuf::from("/media/usb2"));
        assert!(second[0].is_connected);
    }

    #[test]
    fn vanished_drive_marked_disconnected_not_deleted() {
        let registry = registry();

        registry.discover_from(vec![usb_snapshot("/media/usb1")]).unwrap();
        let after = registry.discover_from(Vec::new()).unwrap();

        assert_eq!(after.len(), 1);
        assert!(!after[0].is_connected);
    }

    #[test]
    fn disconnect_then_reconnect_via_events() {
        let registry = registry();
        registry.discover_from(vec![usb_snapshot("/media/usb1")]).unwrap();

        registry
            .apply_event(&DriveEvent::Disconnected {
                mount_point: PathBuf::from("/media/usb1"),
            })
            .unwrap();
        assert!(!registry.list().unwrap()[0].is_connected);

        registry
            .apply_event(&DriveEvent::Connected(usb_snapshot("/media/usb2")))
            .unwrap();

        let records = registry.list().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_connected);
        assert_eq!(records[0].current_path, PathBuf::from("/media/usb2"));
    }
}
