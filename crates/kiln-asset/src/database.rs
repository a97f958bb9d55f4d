//! The asset database: a generational header pool keyed by params-hash,
//! with byte-budget accounting for committed records.
//!
//! Reads (`obj_data`, `is_alive`, `state`) are thread-safe behind the
//! database's reader/writer lock. Structural writes (`create_or_fetch`,
//! `free`) take the write half; record commits happen one group at a time
//! under the scheduler's single-in-flight rule.

use std::{
    collections::HashMap,
    ops::Deref,
    sync::{RwLock, RwLockReadGuard},
};

use tracing::error;

use crate::{
    handle::{Handle, HandlePool},
    params::AssetParams,
    record::AssetRecord,
    AssetError,
};

/// Marker type for asset handles.
pub enum AssetTag {}
/// Handle to an asset database entry.
pub type AssetHandle = Handle<AssetTag>;

/// Lifecycle state of a database entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    /// Not a live entry; what stale handles observe.
    Zombie,
    /// Queued or baking.
    Loading,
    /// Record committed and published.
    Loaded,
    /// The pipeline gave up on this asset; the type's failed placeholder
    /// stands in for its data.
    LoadFailed,
}

/// Snapshot of one entry, for tooling and debug overlays.
#[derive(Debug, Clone)]
pub struct AssetInfo {
    /// Registered type id.
    pub type_id: u32,
    /// Current state.
    pub state: AssetState,
    /// Outstanding references.
    pub ref_count: u32,
    /// Virtual source path.
    pub path: String,
    /// Number of dependencies the committed record names.
    pub num_depends: u32,
}

pub(crate) struct AssetHeader {
    pub state: AssetState,
    pub params_hash: u32,
    pub ref_count: u32,
    pub type_id: u32,
    pub params: AssetParams,
    pub record: Option<AssetRecord>,
    /// Handles resolved for the record's dependency slots, in slot order.
    pub dep_handles: Vec<AssetHandle>,
    /// Created GPU object ids, in gpu-object slot order.
    pub gpu_ids: Vec<u64>,
    /// Committed bytes accounted against the data budget.
    pub data_size: u32,
}

struct DbInner {
    pool: HandlePool<AssetHeader>,
    by_hash: HashMap<u32, AssetHandle>,
    data_bytes: usize,
}

/// Shared read access to a loaded asset's object payload, held open by the
/// database lock guard.
pub struct ObjDataGuard<'a> {
    _guard: RwLockReadGuard<'a, DbInner>,
    ptr: *const u8,
    len: usize,
}

impl Deref for ObjDataGuard<'_> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        // Safety: the pointed-at bytes live inside the pool entry kept
        // alive by `_guard`; commits and frees need the write half.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// The handle pool plus its params-hash lookup.
pub struct AssetDatabase {
    inner: RwLock<DbInner>,
    data_budget: usize,
}

impl AssetDatabase {
    pub(crate) fn new(max_assets: usize, data_budget: usize) -> Self {
        Self {
            inner: RwLock::new(DbInner {
                pool: HandlePool::new(max_assets),
                by_hash: HashMap::new(),
                data_bytes: 0,
            }),
            data_budget,
        }
    }

    /// Looks the params-hash up; a hit gains a reference, a miss allocates
    /// a fresh `Loading` header. Returns the handle and whether it was
    /// newly created.
    pub(crate) fn create_or_fetch(
        &self,
        params: &AssetParams,
    ) -> Result<(AssetHandle, bool), AssetError> {
        let params_hash = params.params_hash();
        let mut inner = self.inner.write().unwrap();

        if let Some(&handle) = inner.by_hash.get(&params_hash) {
            if let Some(header) = inner.pool.get_mut(handle.retag()) {
                header.ref_count += 1;
                return Ok((handle, false));
            }
        }

        let header = AssetHeader {
            state: AssetState::Loading,
            params_hash,
            ref_count: 1,
            type_id: params.type_id,
            params: params.clone(),
            record: None,
            dep_handles: Vec::new(),
            gpu_ids: Vec::new(),
            data_size: 0,
        };
        let Some(handle) = inner.pool.alloc(header).map(Handle::retag) else {
            error!("asset header pool exhausted ({} entries)", inner.pool.capacity());
            return Err(AssetError::AllocatorExhaustion("asset header"));
        };
        inner.by_hash.insert(params_hash, handle);
        Ok((handle, true))
    }

    /// Adds a reference. Returns false (and is a no-op) for stale handles.
    pub fn add_ref(&self, handle: AssetHandle) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.pool.get_mut(handle.retag()) {
            Some(header) => {
                header.ref_count += 1;
                true
            }
            None => false,
        }
    }

    /// Drops one reference, returning the new count. `None` for stale
    /// handles.
    pub(crate) fn dec_ref(&self, handle: AssetHandle) -> Option<u32> {
        let mut inner = self.inner.write().unwrap();
        let header = inner.pool.get_mut(handle.retag())?;
        debug_assert!(header.ref_count > 0, "refcount underflow");
        header.ref_count = header.ref_count.saturating_sub(1);
        Some(header.ref_count)
    }

    /// A handle is alive iff it still addresses a live entry.
    pub fn is_alive(&self, handle: AssetHandle) -> bool {
        self.inner.read().unwrap().pool.get(handle.retag()).is_some()
    }

    /// State of the entry; `Zombie` for stale handles.
    pub fn state(&self, handle: AssetHandle) -> AssetState {
        self.inner
            .read()
            .unwrap()
            .pool
            .get(handle.retag())
            .map_or(AssetState::Zombie, |header| header.state)
    }

    pub(crate) fn set_state(&self, handle: AssetHandle, state: AssetState) {
        if let Some(header) = self.inner.write().unwrap().pool.get_mut(handle.retag()) {
            header.state = state;
        }
    }

    /// The load parameters of an entry.
    pub fn params(&self, handle: AssetHandle) -> Option<AssetParams> {
        self.inner
            .read()
            .unwrap()
            .pool
            .get(handle.retag())
            .map(|header| header.params.clone())
    }

    /// Stored identity hash of an entry.
    pub fn params_hash_of(&self, handle: AssetHandle) -> Option<u32> {
        self.inner
            .read()
            .unwrap()
            .pool
            .get(handle.retag())
            .map(|header| header.params_hash)
    }

    /// Tooling snapshot of an entry.
    pub fn info(&self, handle: AssetHandle) -> Option<AssetInfo> {
        let inner = self.inner.read().unwrap();
        let header = inner.pool.get(handle.retag())?;
        Some(AssetInfo {
            type_id: header.type_id,
            state: header.state,
            ref_count: header.ref_count,
            path: header.params.path.clone(),
            num_depends: header
                .record
                .as_ref()
                .map_or(0, |record| record.dependencies.len() as u32),
        })
    }

    /// Object payload of a loaded entry. `None` while loading or failed;
    /// the caller substitutes the type's placeholder.
    pub fn obj_data(&self, handle: AssetHandle) -> Option<ObjDataGuard<'_>> {
        let guard = self.inner.read().unwrap();
        let header = guard.pool.get(handle.retag())?;
        if header.state != AssetState::Loaded {
            return None;
        }
        let obj = header.record.as_ref()?.obj_data.as_slice();
        let (ptr, len) = (obj.as_ptr(), obj.len());
        Some(ObjDataGuard {
            _guard: guard,
            ptr,
            len,
        })
    }

    /// Clone of the committed object payload, for reload comparison.
    pub(crate) fn obj_data_clone(&self, handle: AssetHandle) -> Option<Vec<u8>> {
        let inner = self.inner.read().unwrap();
        let header = inner.pool.get(handle.retag())?;
        header.record.as_ref().map(|r| r.obj_data.clone())
    }

    /// Publishes a committed record. Fails when the data budget would be
    /// exceeded; the entry is left untouched in that case. When a previous
    /// record is replaced (hot reload), its dependency handles and GPU ids
    /// are returned for release.
    #[allow(clippy::type_complexity)]
    pub(crate) fn commit_record(
        &self,
        handle: AssetHandle,
        record: AssetRecord,
        committed_size: usize,
        dep_handles: Vec<AssetHandle>,
        gpu_ids: Vec<u64>,
    ) -> Result<Option<(Vec<AssetHandle>, Vec<u64>)>, AssetError> {
        let mut inner = self.inner.write().unwrap();

        let occupied: usize = inner
            .pool
            .get(handle.retag())
            .map_or(0, |header| header.data_size as usize);
        if inner.data_bytes - occupied + committed_size > self.data_budget {
            error!(
                "asset data pool exhausted ({} of {} bytes in use)",
                inner.data_bytes, self.data_budget
            );
            return Err(AssetError::AllocatorExhaustion("asset data"));
        }

        let Some(header) = inner.pool.get_mut(handle.retag()) else {
            return Err(AssetError::InvalidHandle);
        };
        let replaced = header
            .record
            .replace(record)
            .map(|_| {
                (
                    std::mem::replace(&mut header.dep_handles, Vec::new()),
                    std::mem::replace(&mut header.gpu_ids, Vec::new()),
                )
            });
        header.dep_handles = dep_handles;
        header.gpu_ids = gpu_ids;
        header.data_size = committed_size as u32;
        // The state stays untouched: the pipeline flips it to Loaded once
        // the record's dependencies are terminal.

        inner.data_bytes = inner.data_bytes - occupied + committed_size;
        Ok(replaced)
    }

    /// Removes the entry, returning its header for structural teardown.
    pub(crate) fn free(&self, handle: AssetHandle) -> Option<AssetHeader> {
        let mut inner = self.inner.write().unwrap();
        let header = inner.pool.free(handle.retag())?;
        inner.by_hash.remove(&header.params_hash);
        inner.data_bytes -= header.data_size as usize;
        Some(header)
    }

    /// Handles whose source path (alias-relative or full) matches
    /// `changed`; used to re-dispatch loads on file changes.
    pub(crate) fn handles_for_changed_path(&self, changed: &str) -> Vec<AssetHandle> {
        let inner = self.inner.read().unwrap();
        inner
            .pool
            .iter()
            .filter(|(_, header)| {
                let path = header.params.path.trim_start_matches('/');
                path == changed || path.ends_with(&format!("/{}", changed))
            })
            .map(|(handle, _)| handle.retag())
            .collect()
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        self.inner.read().unwrap().pool.len()
    }

    /// Committed bytes in use.
    pub fn data_bytes(&self) -> usize {
        self.inner.read().unwrap().data_bytes
    }

    /// Configured data budget in bytes.
    pub fn data_budget(&self) -> usize {
        self.data_budget
    }

    /// Configured header capacity.
    pub fn header_capacity(&self) -> usize {
        self.inner.read().unwrap().pool.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::AssetPlatform;

    fn params(path: &str) -> AssetParams {
        AssetParams::new(1, path, AssetPlatform::Pc)
    }

    fn small_record() -> AssetRecord {
        AssetRecord {
            obj_data: vec![7; 8],
            ..AssetRecord::default()
        }
    }

    #[test]
    fn fetch_of_equal_params_returns_same_handle() {
        let db = AssetDatabase::new(16, 1 << 20);
        let (a, created_a) = db.create_or_fetch(&params("/data/a.png")).unwrap();
        let (b, created_b) = db.create_or_fetch(&params("/data/a.png")).unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a, b);
        assert_eq!(db.info(a).unwrap().ref_count, 2);
        assert_eq!(db.live_count(), 1);
    }

    #[test]
    fn params_hash_stays_stable_for_a_live_handle() {
        let db = AssetDatabase::new(16, 1 << 20);
        let request = params("/data/a.png");
        let (handle, _) = db.create_or_fetch(&request).unwrap();
        assert_eq!(db.params_hash_of(handle), Some(request.params_hash()));
        assert_eq!(
            db.params(handle).unwrap().params_hash(),
            request.params_hash()
        );
    }

    #[test]
    fn stale_handle_reads_as_zombie() {
        let db = AssetDatabase::new(16, 1 << 20);
        let (handle, _) = db.create_or_fetch(&params("/data/a.png")).unwrap();
        assert_eq!(db.state(handle), AssetState::Loading);

        db.free(handle).unwrap();
        assert_eq!(db.state(handle), AssetState::Zombie);
        assert!(!db.is_alive(handle));
        assert!(!db.add_ref(AssetHandle::INVALID));
    }

    #[test]
    fn data_budget_is_enforced_and_released() {
        let db = AssetDatabase::new(16, 10);
        let (a, _) = db.create_or_fetch(&params("/data/a.png")).unwrap();
        db.commit_record(a, small_record(), 8, Vec::new(), Vec::new())
            .unwrap();
        db.set_state(a, AssetState::Loaded);
        assert_eq!(db.data_bytes(), 8);

        let (b, _) = db.create_or_fetch(&params("/data/b.png")).unwrap();
        assert!(matches!(
            db.commit_record(b, small_record(), 8, Vec::new(), Vec::new()),
            Err(AssetError::AllocatorExhaustion(_))
        ));

        db.free(a).unwrap();
        assert_eq!(db.data_bytes(), 0);
        db.commit_record(b, small_record(), 8, Vec::new(), Vec::new())
            .unwrap();
    }

    #[test]
    fn obj_data_only_visible_once_loaded() {
        let db = AssetDatabase::new(16, 1 << 20);
        let (a, _) = db.create_or_fetch(&params("/data/a.png")).unwrap();
        assert!(db.obj_data(a).is_none());

        db.commit_record(a, small_record(), 8, Vec::new(), Vec::new())
            .unwrap();
        db.set_state(a, AssetState::Loaded);
        let guard = db.obj_data(a).unwrap();
        assert_eq!(&*guard, &[7; 8]);
    }

    #[test]
    fn header_pool_exhaustion_reports() {
        let db = AssetDatabase::new(1, 1 << 20);
        db.create_or_fetch(&params("/data/a.png")).unwrap();
        assert!(matches!(
            db.create_or_fetch(&params("/data/b.png")),
            Err(AssetError::AllocatorExhaustion(_))
        ));
    }
}
