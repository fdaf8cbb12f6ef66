// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Stable drive identification
//!
//! A mount path is the least stable thing about a volume. The identity
//! chain prefers, in order: the USB serial of the parent block device
//! (survives reformatting), the filesystem partition UUID (survives
//! remounts, not reformatting), and finally a hash of label+capacity for
//! volumes that expose neither. Probe failures degrade silently to the
//! next tier; this function never errors.

use std::path::{Path, PathBuf};
use tracing::debug;

use super::{IdentifierType, MountSnapshot};

/// Computed stable identity for one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveIdentity {
    pub identifier: String,
    pub kind: IdentifierType,
}

/// Sysfs/devfs prober with injectable roots so tests can fake the trees.
#[derive(Debug, Clone)]
pub struct IdentityProbe {
    sysfs_block_root: PathBuf,
    by_uuid_root: PathBuf,
}

impl Default for IdentityProbe {
    fn default() -> Self {
        Self {
            sysfs_block_root: PathBuf::from("/sys/class/block"),
            by_uuid_root: PathBuf::from("/dev/disk/by-uuid"),
        }
    }
}

impl IdentityProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe with explicit roots (tests fake sysfs under a tempdir).
    pub fn with_roots(sysfs_block_root: PathBuf, by_uuid_root: PathBuf) -> Self {
        Self {
            sysfs_block_root,
            by_uuid_root,
        }
    }

    /// Run the identification chain for one mounted volume.
    pub fn identify(&self, snapshot: &MountSnapshot) -> DriveIdentity {
        if let Some(serial) = self.usb_serial(snapshot) {
            return DriveIdentity {
                identifier: serial,
                kind: IdentifierType::UsbSerial,
            };
        }

        if let Some(uuid) = self.partition_uuid(snapshot) {
            return DriveIdentity {
                identifier: uuid,
                kind: IdentifierType::PartitionUuid,
            };
        }

        DriveIdentity {
            identifier: label_size_identifier(&snapshot.label, snapshot.total_bytes),
            kind: IdentifierType::LabelSize,
        }
    }

    /// Hardware serial of the parent block device, via sysfs.
    fn usb_serial(&self, snapshot: &MountSnapshot) -> Option<String> {
        let device = device_name(snapshot)?;
        let parent = parent_block_device(&device);

        // The serial lives on the device node, one or two levels up from
        // the partition entry depending on the bus.
        let candidates = [
            self.sysfs_block_root.join(&parent).join("serial"),
            self.sysfs_block_root
                .join(&parent)
                .join("device")
                .join("serial"),
        ];

        for candidate in &candidates {
            match std::fs::read_to_string(candidate) {
                Ok(raw) => {
                    let serial = raw.trim();
                    if !serial.is_empty() {
                        return Some(serial.to_string());
                    }
                }
                Err(e) => {
                    debug!("serial probe {:?} failed: {}", candidate, e);
                }
            }
        }

        None
    }

    /// Partition UUID resolved by scanning the by-uuid symlink farm.
    fn partition_uuid(&self, snapshot: &MountSnapshot) -> Option<String> {
        let device = device_name(snapshot)?;

        let entries = match std::fs::read_dir(&self.by_uuid_root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("uuid probe {:?} failed: {}", self.by_uuid_root, e);
                return None;
            }
        };

        for entry in entries.flatten() {
            let target = match std::fs::read_link(entry.path()) {
                Ok(target) => target,
                Err(_) => continue,
            };
            let target_name = target.file_name().and_then(|n| n.to_str());
            if target_name == Some(device.as_str()) {
                if let Some(uuid) = entry.file_name().to_str() {
                    return Some(uuid.to_string());
                }
            }
        }

        None
    }
}

/// Last resort: hash of label and capacity. Collides only for identical
/// twin volumes, which the mount path then disambiguates.
pub fn label_size_identifier(label: &str, total_bytes: u64) -> String {
    let seed = format!("{}:{}", label, total_bytes);
    let hash = blake3::hash(seed.as_bytes());
    hash.to_hex().as_str()[..16].to_string()
}

fn device_name(snapshot: &MountSnapshot) -> Option<String> {
    snapshot
        .device
        .as_ref()
        .and_then(|d| d.file_name())
        .and_then(|n| n.to_str())
        .map(String::from)
}

/// `sdb1` -> `sdb`, `nvme0n1p2` -> `nvme0n1`, `mmcblk0p1` -> `mmcblk0`.
fn parent_block_device(partition: &str) -> String {
    if (partition.starts_with("nvme") || partition.starts_with("mmcblk"))
        && partition.contains('p')
    {
        if let Some(idx) = partition.rfind('p') {
            if partition[idx + 1..].chars().all(|c| c.is_ascii_digit())
                && !partition[idx + 1..].is_empty()
            {
                return partition[..idx].to_string();
            }
        }
    }

    partition.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}
