// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Background drive monitor
//!
//! Watches the configured mount roots for directories appearing and
//! disappearing, with a periodic poll as a safety net for mounts notify
//! cannot see. The monitor only emits events into a queue; it never
//! touches registry state itself and never blocks an operation batch.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{platform_snapshots, MountSnapshot};
use crate::config::DriveConfig;
use crate::Result;

/// Events emitted by the monitor
#[derive(Debug, Clone)]
pub enum DriveEvent {
    /// A volume appeared (or moved to a new mount point)
    Connected(MountSnapshot),
    /// The volume mounted at this path vanished
    Disconnected { mount_point: PathBuf },
}

/// Mount-root watcher
pub struct DriveMonitor {
    watcher: RecommendedWatcher,
    watched_roots: Vec<PathBuf>,
    fs_rx: Receiver<notify::Result<Event>>,
}

impl DriveMonitor {
    /// Create a monitor watching every mount root that currently exists.
    pub fn new(mount_roots: &[String]) -> Result<Self> {
        let (tx, rx) = channel();

        let config = Config::default().with_poll_interval(Duration::from_secs(2));
        let mut watcher = RecommendedWatcher::new(tx, config)?;

        let mut watched_roots = Vec::new();
        for root in mount_roots {
            let root = PathBuf::from(root);
            if !root.exists() {
                debug!("mount root {:?} absent, skipping", root);
                continue;
            }
            watcher.watch(&root, RecursiveMode::NonRecursive)?;
            info!("Watching mount root: {:?}", root);
            watched_roots.push(root);
        }

        Ok(Self {
            watcher,
            watched_roots,
            fs_rx: rx,
        })
    }

    /// Block until a mount root changes or the timeout lapses. Returns
    /// whether an fs event arrived; either way the caller should rescan.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        match self.fs_rx.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                debug!("mount root activity: {:?}", event.kind);
                // Drain the burst so one replug is one rescan.
                while self.fs_rx.try_recv().is_ok() {}
                true
            }
            Ok(Err(e)) => {
                warn!("mount watch error: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    /// Currently watched mount roots.
    pub fn watched_roots(&self) -> &[PathBuf] {
        &self.watched_roots
    }

    /// Stop watching a root (used when a root itself is unmounted).
    pub fn unwatch(&mut self, root: &PathBuf) -> Result<()> {
        self.watcher.unwatch(root)?;
        self.watched_roots.retain(|r| r != root);
        Ok(())
    }
}

/// Diff two snapshot sets into connect/disconnect events, keyed by mount
/// point. Identity resolution happens later in the registry, so a drive
/// that moved paths shows up as one disconnect plus one connect here and
/// still lands on a single record.
pub fn diff_snapshots(
    previous: &[MountSnapshot],
    current: &[MountSnapshot],
) -> Vec<DriveEvent> {
    let before: HashMap<&PathBuf, &MountSnapshot> =
        previous.iter().map(|s| (&s.mount_point, s)).collect();
    let after: HashMap<&PathBuf, &MountSnapshot> =
        current.iter().map(|s| (&s.mount_point, s)).collect();

    let mut events = Vec::new();

    for (mount_point, _) in before.iter() {
        if !after.contains_key(*mount_point) {
            events.push(DriveEvent::Disconnected {
                mount_point: (*mount_point).clone(),
            });
        }
    }

    for (mount_point, snapshot) in after.iter() {
        if !before.contains_key(*mount_point) {
            events.push(DriveEvent::Connected((*snapshot).clone()));
        }
    }

    events
}

/// Spawn the monitor loop on a dedicated thread, feeding an unbounded
/// queue the destination memory drains between batches.
pub fn spawn_monitor(
    config: &DriveConfig,
) -> Result<tokio::sync::mpsc::UnboundedReceiver<DriveEvent>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let monitor = DriveMonitor::new(&config.mount_roots)?;
    let poll = Duration::from_secs(config.poll_secs.max(1));

    std::thread::Builder::new()
        .name("taxis-drive-monitor".to_string())
        .spawn(move || {
            let mut previous = platform_snapshots();
            loop {
                monitor.wait_for_change(poll);

                let current = platform_snapshots();
                for event in diff_snapshots(&previous, &current) {
                    if tx.send(event).is_err() {
                        debug!("drive event queue closed, stopping monitor");
                        return;
                    }
                }
                previous = current;
            }
        })?;

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(mount: &str, label: &str) -> MountSnapshot {
        MountSnapshot {
            mount_point: PathBuf::from(mount),
            label: label.to_string(),
            total_bytes: 1_000_000,
            removable: true,
            file_system: "vfat".to_string(),
            device: None,
        }
    }

    #[test]
    fn diff_detects_connect_and_disconnect() {
        let before = vec![snapshot("/media/usb1", "A")];
        let after = vec![snapshot("/media/usb2", "A")];

        let events = diff_snapshots(&before, &after);
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            DriveEvent::Disconnected { mount_point } if mount_point == &PathBuf::from("/media/usb1")
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            DriveEvent::Connected(s) if s.mount_point == PathBuf::from("/media/usb2")
        )));
    }

    #[test]
    fn diff_ignores_unchanged_mounts() {
        let set = vec![snapshot("/media/usb1", "A"), snapshot("/mnt/data", "B")];
        assert!(diff_snapshots(&set, &set).is_empty());
    }

    #[test]
    fn monitor_skips_missing_roots() {
        let monitor = DriveMonitor::new(&["/definitely/not/a/mount/root".to_string()]).unwrap();
        assert!(monitor.watched_roots().is_empty());
    }
}
