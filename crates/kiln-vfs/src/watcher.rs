use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Weak,
    time::{Duration, SystemTime},
};

use crossbeam_channel::{select, Receiver};
use tracing::warn;

use crate::{mount::MountPoint, Vfs};

/// Polling watcher. Scans watched local mounts on a fixed cadence and
/// reports files whose modification time moved since the previous scan.
/// The first scan of a mount only primes the snapshot.
pub(crate) fn run(vfs: Weak<Vfs>, shutdown: Receiver<()>, poll: Duration) {
    let ticker = crossbeam_channel::tick(poll);
    let mut snapshots: HashMap<String, HashMap<PathBuf, SystemTime>> = HashMap::new();

    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {
                let Some(vfs) = vfs.upgrade() else { break };
                scan(&vfs, &mut snapshots);
            }
        }
    }
}

fn scan(vfs: &Vfs, snapshots: &mut HashMap<String, HashMap<PathBuf, SystemTime>>) {
    let mounts = vfs.watched_local_mounts();
    let mut events = Vec::new();

    for mount in &mounts {
        let mut current = HashMap::new();
        collect(&mount.root, &mut current);

        match snapshots.get_mut(&mount.alias) {
            None => {
                snapshots.insert(mount.alias.clone(), current);
            }
            Some(previous) => {
                for (path, modified) in &current {
                    let changed = match previous.get(path) {
                        Some(old) => old != modified,
                        None => true,
                    };
                    if changed {
                        if let Some(event) = alias_relative(mount, path) {
                            events.push(event);
                        }
                    }
                }
                *previous = current;
            }
        }
    }

    if !events.is_empty() {
        vfs.dispatch_local_changes(events);
    }
}

fn alias_relative(mount: &MountPoint, path: &Path) -> Option<String> {
    path.strip_prefix(&mount.root)
        .ok()
        .map(|tail| tail.to_string_lossy().replace('\\', "/"))
}

fn collect(dir: &Path, out: &mut HashMap<PathBuf, SystemTime>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("watcher cannot scan '{}': {}", dir.display(), err);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => collect(&path, out),
            Ok(kind) if kind.is_file() => {
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    out.insert(path, modified);
                }
            }
            _ => {}
        }
    }
}
