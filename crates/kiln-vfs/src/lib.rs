//! Virtual filesystem with local, remote, and bundle mount kinds.
//!
//! Paths are virtual: the first segment names a mount alias and the rest is
//! resolved against that mount's root (`/{alias}/...`). Blocking reads and
//! writes are served directly; asynchronous requests go through a single
//! disk-worker thread and complete in submission order. Remote mounts tunnel
//! their traffic through the command bus, and a polling watcher turns local
//! modifications into change notifications that remote peers can also drain
//! over the bus.

#![warn(missing_docs)]

mod error;
mod mount;
mod remote;
mod watcher;
mod worker;

use std::{
    collections::HashMap,
    fs,
    io::Write as _,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};

use kiln_remote::RemoteClient;
use tracing::{info, warn};

pub use error::VfsError;
pub use mount::MountType;
pub use remote::register_commands;

use mount::MountPoint;
use worker::VfsRequest;

bitflags::bitflags! {
    /// Behavior flags for read/write operations.
    pub struct VfsFlags: u32 {
        /// Bypass mount resolution; the path is already a disk path.
        const ABSOLUTE_PATH = 0x1;
        /// Append a NUL byte to the blob on read.
        const TEXT_FILE = 0x2;
        /// Append to the file instead of truncating it.
        const APPEND = 0x4;
        /// Create missing directories on write.
        const CREATE_DIRS = 0x8;
    }
}

/// Completion for [`Vfs::read_async`]. `None` means the read failed.
pub type ReadCallback = Box<dyn FnOnce(&str, Option<Vec<u8>>) + Send>;

/// Completion for [`Vfs::write_async`]; receives the number of bytes
/// written, `0` on failure.
pub type WriteCallback = Box<dyn FnOnce(&str, u64) + Send>;

/// Invoked with the alias-relative path of a modified file.
pub type FileChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Default cadence of the local modification scan.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Cadence at which remote clients poll the server's change set.
const REMOTE_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

enum RemoteOp {
    Read(String, ReadCallback),
    Write(String, WriteCallback),
}

/// The virtual filesystem context.
pub struct Vfs {
    this: Mutex<Weak<Vfs>>,
    mounts: RwLock<Vec<MountPoint>>,
    worker_tx: crossbeam_channel::Sender<VfsRequest>,
    watcher_shutdown: Mutex<Option<crossbeam_channel::Sender<()>>>,
    change_callbacks: RwLock<Vec<FileChangeCallback>>,
    remote: RwLock<Option<RemoteClient>>,
    pending_remote: Mutex<HashMap<u64, RemoteOp>>,
    next_remote_cookie: AtomicU64,
    accumulated_changes: Mutex<Vec<String>>,
    monitor_running: AtomicBool,
}

impl Drop for Vfs {
    fn drop(&mut self) {
        let _ = self.worker_tx.send(VfsRequest::Terminate);
        // Dropping the sender wakes the watcher select.
        self.watcher_shutdown.lock().unwrap().take();
    }
}

impl Vfs {
    /// Creates the filesystem context and spawns its disk worker and
    /// watcher threads.
    pub fn new() -> Arc<Self> {
        let (worker_tx, worker_rx) = crossbeam_channel::unbounded::<VfsRequest>();
        let (watch_tx, watch_rx) = crossbeam_channel::bounded::<()>(1);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let worker_vfs = weak.clone();
            std::thread::Builder::new()
                .name("vfs-disk".to_owned())
                .spawn(move || worker::run(worker_vfs, worker_rx))
                .expect("spawn vfs disk worker");

            let watcher_vfs = weak.clone();
            std::thread::Builder::new()
                .name("vfs-watch".to_owned())
                .spawn(move || watcher::run(watcher_vfs, watch_rx, WATCH_POLL_INTERVAL))
                .expect("spawn vfs watcher");

            Self {
                this: Mutex::new(weak.clone()),
                mounts: RwLock::new(Vec::new()),
                worker_tx,
                watcher_shutdown: Mutex::new(Some(watch_tx)),
                change_callbacks: RwLock::new(Vec::new()),
                remote: RwLock::new(None),
                pending_remote: Mutex::new(HashMap::new()),
                next_remote_cookie: AtomicU64::new(1),
                accumulated_changes: Mutex::new(Vec::new()),
                monitor_running: AtomicBool::new(false),
            }
        })
    }

    /// Mounts a local directory under `alias`.
    pub fn mount_local(
        &self,
        root: impl Into<PathBuf>,
        alias: &str,
        watch: bool,
    ) -> Result<(), VfsError> {
        self.add_mount(MountPoint {
            kind: MountType::Local,
            root: root.into(),
            alias: normalize_alias(alias),
            watch,
        })
    }

    /// Mounts `alias` as remote: all traffic is tunneled through the
    /// connected command bus.
    pub fn mount_remote(&self, alias: &str, watch: bool) -> Result<(), VfsError> {
        self.add_mount(MountPoint {
            kind: MountType::Remote,
            root: PathBuf::new(),
            alias: normalize_alias(alias),
            watch,
        })?;
        if watch {
            self.ensure_remote_monitor();
        }
        Ok(())
    }

    /// Mounts a read-only platform bundle directory under `alias`.
    pub fn mount_bundle(&self, root: impl Into<PathBuf>, alias: &str) -> Result<(), VfsError> {
        self.add_mount(MountPoint {
            kind: MountType::Bundle,
            root: root.into(),
            alias: normalize_alias(alias),
            watch: false,
        })
    }

    fn add_mount(&self, mount: MountPoint) -> Result<(), VfsError> {
        let mut mounts = self.mounts.write().unwrap();
        if mounts.iter().any(|m| m.alias == mount.alias) {
            return Err(VfsError::AliasInUse(mount.alias));
        }
        info!("mounted '{}' ({:?})", mount.alias, mount.kind);
        mounts.push(mount);
        Ok(())
    }

    /// Attaches the remote client used by remote mounts and starts the
    /// change-monitor poll if any remote mount asked to watch.
    pub fn connect_remote(&self, client: RemoteClient) {
        *self.remote.write().unwrap() = Some(client);
        let watching = self
            .mounts
            .read()
            .unwrap()
            .iter()
            .any(|m| m.kind == MountType::Remote && m.watch);
        if watching {
            self.ensure_remote_monitor();
        }
    }

    /// Blocking read. Fails for remote mounts.
    pub fn read(&self, path: &str, flags: VfsFlags) -> Result<Vec<u8>, VfsError> {
        let (kind, disk_path) = self.classify(path, flags);
        if kind == Some(MountType::Remote) {
            return Err(VfsError::RemoteBlockingRead(path.to_owned()));
        }
        let mut data = fs::read(&disk_path)?;
        if flags.contains(VfsFlags::TEXT_FILE) {
            data.push(0);
        }
        Ok(data)
    }

    /// Blocking write to a local mount. Returns the number of bytes
    /// written.
    pub fn write(&self, path: &str, data: &[u8], flags: VfsFlags) -> Result<u64, VfsError> {
        let (kind, disk_path) = self.classify(path, flags);
        match kind {
            Some(MountType::Remote) | Some(MountType::Bundle) => {
                return Err(VfsError::NotWritable(path.to_owned()));
            }
            _ => {}
        }

        if flags.contains(VfsFlags::CREATE_DIRS) {
            if let Some(parent) = disk_path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .append(flags.contains(VfsFlags::APPEND))
            .truncate(!flags.contains(VfsFlags::APPEND))
            .open(&disk_path)?;
        file.write_all(data)?;
        Ok(data.len() as u64)
    }

    /// Queues an asynchronous read. Remote mounts forward over the bus;
    /// everything else goes through the disk worker.
    pub fn read_async(&self, path: &str, flags: VfsFlags, callback: ReadCallback) {
        if self.mount_kind_of(path, flags) == Some(MountType::Remote) {
            self.remote_read(path, flags, callback);
            return;
        }
        let _ = self.worker_tx.send(VfsRequest::Read {
            path: path.to_owned(),
            flags,
            callback,
        });
    }

    /// Queues an asynchronous write. Remote mounts forward over the bus.
    pub fn write_async(&self, path: &str, data: Vec<u8>, flags: VfsFlags, callback: WriteCallback) {
        if self.mount_kind_of(path, flags) == Some(MountType::Remote) {
            self.remote_write(path, data, flags, callback);
            return;
        }
        let _ = self.worker_tx.send(VfsRequest::Write {
            path: path.to_owned(),
            flags,
            data,
            callback,
        });
    }

    /// The mount kind a path resolves to, if any.
    pub fn get_mount_type(&self, path: &str) -> Option<MountType> {
        self.mount_kind_of(path, VfsFlags::empty())
    }

    /// Modification time of the file behind `path`, in nanoseconds since
    /// the epoch. `None` if the file cannot be stat'd.
    pub fn get_last_modified(&self, path: &str) -> Option<u64> {
        let resolved = self.resolve_filepath(path);
        let modified = fs::metadata(resolved).and_then(|m| m.modified()).ok()?;
        modified
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos() as u64)
    }

    /// File size of the file behind `path`. `None` if it cannot be stat'd.
    pub fn get_file_size(&self, path: &str) -> Option<u64> {
        let resolved = self.resolve_filepath(path);
        fs::metadata(resolved).ok().map(|m| m.len())
    }

    /// Rewrites a virtual path to the disk path of its mount. Unmatched
    /// paths pass through unchanged.
    pub fn resolve_filepath(&self, path: &str) -> PathBuf {
        mount::resolve(&self.mounts.read().unwrap(), path)
    }

    /// Strips the mount portion off a resolved or alias-prefixed path.
    pub fn strip_mount_path(&self, path: &str) -> String {
        mount::strip_mount(&self.mounts.read().unwrap(), path)
    }

    /// Registers a file-change callback. Callbacks run on the watcher (or
    /// bus) thread and must be quick and thread-safe.
    pub fn register_file_change_callback(&self, callback: FileChangeCallback) {
        self.change_callbacks.write().unwrap().push(callback);
    }

    fn classify(&self, path: &str, flags: VfsFlags) -> (Option<MountType>, PathBuf) {
        if flags.contains(VfsFlags::ABSOLUTE_PATH) {
            return (None, PathBuf::from(path));
        }
        let mounts = self.mounts.read().unwrap();
        let stripped = mount::strip_leading_slash(path);
        match mount::find_mount(&mounts, stripped) {
            Some((m, tail)) => (Some(m.kind), m.root.join(tail)),
            None => (None, PathBuf::from(path)),
        }
    }

    fn mount_kind_of(&self, path: &str, flags: VfsFlags) -> Option<MountType> {
        self.classify(path, flags).0
    }

    pub(crate) fn watched_local_mounts(&self) -> Vec<MountPoint> {
        self.mounts
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.kind == MountType::Local && m.watch)
            .cloned()
            .collect()
    }

    /// Local watcher events: fan out to callbacks and accumulate for
    /// remote peers polling over the bus.
    pub(crate) fn dispatch_local_changes(&self, paths: Vec<String>) {
        {
            let mut accumulated = self.accumulated_changes.lock().unwrap();
            accumulated.extend(paths.iter().cloned());
        }
        self.fan_out_changes(&paths);
    }

    /// Change events synthesized from a remote peer; not re-accumulated.
    pub(crate) fn dispatch_remote_changes(&self, paths: Vec<String>) {
        self.fan_out_changes(&paths);
    }

    fn fan_out_changes(&self, paths: &[String]) {
        let callbacks = self.change_callbacks.read().unwrap().clone();
        for path in paths {
            for callback in &callbacks {
                callback(path);
            }
        }
    }

    pub(crate) fn drain_changes(&self) -> Vec<String> {
        std::mem::take(&mut *self.accumulated_changes.lock().unwrap())
    }

    fn remote_client(&self) -> Option<RemoteClient> {
        self.remote.read().unwrap().clone()
    }

    fn remote_read(&self, path: &str, flags: VfsFlags, callback: ReadCallback) {
        let Some(client) = self.remote_client() else {
            warn!("remote read '{}' with no connection", path);
            callback(path, None);
            return;
        };
        let cookie = self.next_remote_cookie.fetch_add(1, Ordering::Relaxed);
        self.pending_remote
            .lock()
            .unwrap()
            .insert(cookie, RemoteOp::Read(path.to_owned(), callback));

        let payload = remote::encode_read_request(path, flags);
        if let Err(err) = client.execute_command(kiln_remote::CMD_VFS_READ, payload, cookie) {
            warn!("remote read '{}' failed to send: {}", path, err);
            self.fail_remote(cookie);
        }
    }

    fn remote_write(&self, path: &str, data: Vec<u8>, flags: VfsFlags, callback: WriteCallback) {
        let Some(client) = self.remote_client() else {
            warn!("remote write '{}' with no connection", path);
            callback(path, 0);
            return;
        };
        let cookie = self.next_remote_cookie.fetch_add(1, Ordering::Relaxed);
        self.pending_remote
            .lock()
            .unwrap()
            .insert(cookie, RemoteOp::Write(path.to_owned(), callback));

        let payload = remote::encode_write_request(path, flags, data);
        if let Err(err) = client.execute_command(kiln_remote::CMD_VFS_WRITE, payload, cookie) {
            warn!("remote write '{}' failed to send: {}", path, err);
            self.fail_remote(cookie);
        }
    }

    pub(crate) fn complete_remote(&self, cookie: u64, payload: &[u8], error: Option<&str>) {
        let Some(op) = self.pending_remote.lock().unwrap().remove(&cookie) else {
            return;
        };
        match op {
            RemoteOp::Read(path, callback) => match error {
                None => callback(&path, Some(payload.to_vec())),
                Some(desc) => {
                    warn!("remote read '{}' failed: {}", path, desc);
                    callback(&path, None);
                }
            },
            RemoteOp::Write(path, callback) => match error {
                None => callback(&path, remote::decode_bytes_written(payload)),
                Some(desc) => {
                    warn!("remote write '{}' failed: {}", path, desc);
                    callback(&path, 0);
                }
            },
        }
    }

    fn fail_remote(&self, cookie: u64) {
        self.complete_remote(cookie, &[], Some("not connected"));
    }

    fn ensure_remote_monitor(&self) {
        if self.monitor_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = self.this.lock().unwrap().clone();
        std::thread::Builder::new()
            .name("vfs-monitor".to_owned())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(REMOTE_MONITOR_INTERVAL);
                while ticker.recv().is_ok() {
                    let Some(vfs) = weak.upgrade() else { break };
                    let Some(client) = vfs.remote_client() else { continue };
                    if !client.is_connected() {
                        continue;
                    }
                    let _ =
                        client.execute_command(kiln_remote::CMD_MONITOR_CHANGES, Vec::new(), 0);
                }
            })
            .expect("spawn vfs monitor");
    }
}

fn normalize_alias(alias: &str) -> String {
    alias.trim_matches('/').to_owned()
}
