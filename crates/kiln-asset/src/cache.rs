//! On-disk store of pre-baked records plus the persistent params-hash →
//! asset-hash lookup that predicts cache locations across runs.

use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use kiln_vfs::{Vfs, VfsFlags};
use tracing::{error, info, warn};
use xxhash_rust::xxh32::{xxh32, Xxh32};

use crate::meta;

/// Magic of a cache entry body.
pub const CACHE_FILE_ID: u32 = u32::from_le_bytes(*b"ACCH");
/// Cache format version; a mismatch invalidates the entry.
pub const CACHE_VERSION: u32 = 1;

const LOOKUP_FILE: &str = "_HashLookup.txt";

/// Outcome of a cache probe.
pub(crate) enum CacheRead {
    /// Valid entry; the serialized record payload.
    Hit(Vec<u8>),
    /// No entry at the derived path.
    Miss,
    /// Entry exists but its magic, version, or checksum is wrong.
    Corrupt,
}

/// Content-addressed store of baked records.
pub struct CacheStore {
    root: String,
    cache_only: bool,
    lookup: RwLock<HashMap<u32, u32>>,
    dirty: AtomicBool,
    first_dirty: Mutex<Option<Instant>>,
    last_flush: Mutex<Instant>,
    dirty_interval: Duration,
    min_flush_interval: Duration,
}

impl CacheStore {
    /// Creates a store rooted at the virtual path `root` (e.g. `/cache`).
    pub fn new(
        root: impl Into<String>,
        cache_only: bool,
        dirty_interval: Duration,
        min_flush_interval: Duration,
    ) -> Self {
        Self {
            root: root.into().trim_end_matches('/').to_owned(),
            cache_only,
            lookup: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            first_dirty: Mutex::new(None),
            last_flush: Mutex::new(Instant::now()),
            dirty_interval,
            min_flush_interval,
        }
    }

    /// True when source bakes are disabled: an absent cache entry fails the
    /// load.
    pub fn cache_only(&self) -> bool {
        self.cache_only
    }

    fn lookup_path(&self) -> String {
        format!("{}/{}", self.root, LOOKUP_FILE)
    }

    /// Reloads the persisted params-hash → asset-hash table.
    pub fn load_lookup(&self, vfs: &Vfs) {
        let Ok(bytes) = vfs.read(&self.lookup_path(), VfsFlags::TEXT_FILE) else {
            return;
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut table = self.lookup.write().unwrap();
        for line in text.lines() {
            let line = line.trim_end_matches('\0').trim();
            if line.is_empty() {
                continue;
            }
            let Some((params, asset)) = line.split_once(';') else {
                warn!("malformed hash-lookup line: '{}'", line);
                continue;
            };
            match (parse_hex(params), parse_hex(asset)) {
                (Some(params_hash), Some(asset_hash)) => {
                    table.insert(params_hash, asset_hash);
                }
                _ => warn!("malformed hash-lookup line: '{}'", line),
            }
        }
        info!("hash lookup loaded, {} entries", table.len());
    }

    /// Predicted asset-hash for a request, if one was recorded.
    pub fn predicted_hash(&self, params_hash: u32) -> Option<u32> {
        self.lookup.read().unwrap().get(&params_hash).copied()
    }

    /// Records a fresh bake result and arms the dirty flag.
    pub fn update_lookup(&self, params_hash: u32, asset_hash: u32) {
        let changed = {
            let mut table = self.lookup.write().unwrap();
            table.insert(params_hash, asset_hash) != Some(asset_hash)
        };
        if changed && !self.dirty.swap(true, Ordering::AcqRel) {
            *self.first_dirty.lock().unwrap() = Some(Instant::now());
        }
    }

    /// Number of recorded entries.
    pub fn lookup_len(&self) -> usize {
        self.lookup.read().unwrap().len()
    }

    /// A flush is due once dirt accumulated long enough and the previous
    /// flush is far enough in the past.
    pub fn flush_due(&self) -> bool {
        if !self.dirty.load(Ordering::Acquire) {
            return false;
        }
        let aged = self
            .first_dirty
            .lock()
            .unwrap()
            .map_or(false, |t| t.elapsed() >= self.dirty_interval);
        aged && self.last_flush.lock().unwrap().elapsed() >= self.min_flush_interval
    }

    /// Writes the lookup out asynchronously. No-op while clean.
    pub fn flush(&self, vfs: &Vfs) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.first_dirty.lock().unwrap() = None;
        *self.last_flush.lock().unwrap() = Instant::now();

        let mut entries: Vec<(u32, u32)> = {
            let table = self.lookup.read().unwrap();
            table.iter().map(|(&k, &v)| (k, v)).collect()
        };
        entries.sort_unstable();

        let mut text = String::new();
        for (params_hash, asset_hash) in entries {
            text.push_str(&format!("{:#010x};{:#010x}\n", params_hash, asset_hash));
        }
        text.push('\0');

        vfs.write_async(
            &self.lookup_path(),
            text.into_bytes(),
            VfsFlags::CREATE_DIRS,
            Box::new(|path, written| {
                if written == 0 {
                    warn!("hash lookup flush to '{}' failed", path);
                }
            }),
        );
    }

    /// The content-sensitive key addressing a cache entry:
    /// `hash(sourcePath, paramsHash, sourceSize, sourceMtime, metaSize?,
    /// metaMtime?)`. Zero when the source cannot be stat'd, which forces
    /// the source path.
    pub fn compute_asset_hash(&self, vfs: &Vfs, source_path: &str, params_hash: u32) -> u32 {
        let (Some(size), Some(modified)) = (
            vfs.get_file_size(source_path),
            vfs.get_last_modified(source_path),
        ) else {
            return 0;
        };

        let mut hasher = Xxh32::new(0);
        hasher.update(source_path.as_bytes());
        hasher.update(&params_hash.to_le_bytes());
        hasher.update(&size.to_le_bytes());
        hasher.update(&modified.to_le_bytes());

        let meta_path = meta::meta_path(source_path);
        if let (Some(meta_size), Some(meta_modified)) = (
            vfs.get_file_size(&meta_path),
            vfs.get_last_modified(&meta_path),
        ) {
            hasher.update(&meta_size.to_le_bytes());
            hasher.update(&meta_modified.to_le_bytes());
        }
        hasher.digest()
    }

    /// Derives the entry path:
    /// `{root}/{source dir}/{source filename}_{hash:08x}.{type-name}`.
    pub fn cache_path(&self, source_path: &str, asset_hash: u32, type_name: &str) -> String {
        let stripped = source_path.trim_start_matches('/');
        match stripped.rsplit_once('/') {
            Some((dir, file)) => format!(
                "{}/{}/{}_{:08x}.{}",
                self.root, dir, file, asset_hash, type_name
            ),
            None => format!("{}/{}_{:08x}.{}", self.root, stripped, asset_hash, type_name),
        }
    }

    /// Probes the cache entry at `path`.
    pub(crate) fn read_entry(&self, vfs: &Vfs, path: &str) -> CacheRead {
        let Ok(bytes) = vfs.read(path, VfsFlags::empty()) else {
            return CacheRead::Miss;
        };
        match decode_entry(&bytes) {
            Ok(payload) => CacheRead::Hit(payload),
            Err(reason) => {
                error!("corrupt cache entry '{}': {}", path, reason);
                CacheRead::Corrupt
            }
        }
    }

    /// Queues an asynchronous write of a fresh entry; the pipeline does not
    /// block on it.
    pub(crate) fn write_entry_async(&self, vfs: &Vfs, path: &str, payload: &[u8]) {
        vfs.write_async(
            path,
            encode_entry(payload),
            VfsFlags::CREATE_DIRS,
            Box::new(|path, written| {
                if written == 0 {
                    warn!("cache write to '{}' failed", path);
                }
            }),
        );
    }
}

fn parse_hex(text: &str) -> Option<u32> {
    u32::from_str_radix(text.trim().trim_start_matches("0x"), 16).ok()
}

/// The 12-byte entry header: magic, version, payload size.
pub fn encode_entry_header(payload_len: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(12);
    header.write_u32::<LittleEndian>(CACHE_FILE_ID).unwrap();
    header.write_u32::<LittleEndian>(CACHE_VERSION).unwrap();
    header.write_u32::<LittleEndian>(payload_len).unwrap();
    header
}

/// Full entry bytes: header, payload, trailing payload checksum.
pub fn encode_entry(payload: &[u8]) -> Vec<u8> {
    let mut bytes = encode_entry_header(payload.len() as u32);
    bytes.extend_from_slice(payload);
    bytes
        .write_u32::<LittleEndian>(xxh32(payload, 0))
        .unwrap();
    bytes
}

/// Validates an entry and returns its payload. Entries written before the
/// checksum existed (no trailing 4 bytes) still validate on magic, version,
/// and size alone.
pub fn decode_entry(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let mut cursor = Cursor::new(bytes);
    let magic = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| "truncated header".to_owned())?;
    if magic != CACHE_FILE_ID {
        return Err(format!("bad magic {:#010x}", magic));
    }
    let version = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| "truncated header".to_owned())?;
    if version != CACHE_VERSION {
        return Err(format!("version {} (expected {})", version, CACHE_VERSION));
    }
    let size = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| "truncated header".to_owned())? as usize;

    let body_start = 12;
    let body_end = body_start + size;
    let payload = bytes
        .get(body_start..body_end)
        .ok_or_else(|| "payload shorter than header claims".to_owned())?;

    if let Some(trailer) = bytes.get(body_end..body_end + 4) {
        let stored = u32::from_le_bytes(trailer.try_into().unwrap());
        let computed = xxh32(payload, 0);
        if stored != computed {
            return Err(format!(
                "checksum mismatch (stored {:#010x}, computed {:#010x})",
                stored, computed
            ));
        }
    }

    Ok(payload.to_vec())
}
