//! The asset manager context: handle lifecycle, group scheduling, cache
//! coherency, and remote bake dispatch, driven from the main thread.

use std::{
    ops::Deref,
    sync::{
        atomic::Ordering,
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use kiln_remote::{FourCC, RemoteClient, RemoteServer};
use kiln_vfs::Vfs;
use serde::Deserialize;
use tracing::{error, info};

use crate::{
    baker::AssetBaker,
    cache::CacheStore,
    database::{AssetDatabase, AssetHandle, AssetInfo, AssetState, ObjDataGuard},
    gpu::GpuBackend,
    group::{BarrierHandle, BarrierInner, GroupData, GroupHandle, GroupState},
    handle::HandlePool,
    params::AssetParams,
    pipeline::{self, GroupJobRefs, PipelineShared},
    remote::{BakeClient, BakePendingMap},
    scheduler::{JobKind, PendingJob, Scheduler},
    server::{BakeQueue, BakeRequest},
    types::{AssetTypeDesc, TypeRegistry},
    AssetError,
};

/// Tunables of the asset manager. All fields have working defaults and the
/// whole structure deserializes from a TOML table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Virtual root of the bake cache.
    pub cache_root: String,
    /// Skip source bakes entirely; absent cache entries fail the load.
    pub cache_only: bool,
    /// Header pool capacity.
    pub max_assets: usize,
    /// Group pool capacity.
    pub max_groups: usize,
    /// Barrier pool capacity.
    pub max_barriers: usize,
    /// Byte budget of committed asset data.
    pub data_budget_bytes: usize,
    /// Worker threads of the owned runtime; `0` keeps the tokio default.
    pub worker_threads: usize,
    /// Server-mode batch ceiling per Server job.
    pub server_max_in_flight: usize,
    /// Accumulated dirty time before a hash-lookup flush, in milliseconds.
    pub lookup_flush_dirty_ms: u64,
    /// Minimum spacing between hash-lookup flushes, in milliseconds.
    pub lookup_flush_min_interval_ms: u64,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            cache_root: "/cache".to_owned(),
            cache_only: false,
            max_assets: 4096,
            max_groups: 64,
            max_barriers: 64,
            data_budget_bytes: 256 << 20,
            worker_threads: 0,
            server_max_in_flight: 128,
            lookup_flush_dirty_ms: 1000,
            lookup_flush_min_interval_ms: 2000,
        }
    }
}

impl AssetConfig {
    /// Parses a TOML table; missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, AssetError> {
        toml::from_str(text).map_err(|err| AssetError::Serialization(err.to_string()))
    }
}

/// Pool usage snapshot for tooling.
#[derive(Debug, Clone)]
pub struct BudgetStats {
    /// Live asset entries.
    pub num_assets: usize,
    /// Header pool capacity.
    pub max_assets: usize,
    /// Registered types (tombstoned included).
    pub num_types: usize,
    /// Live groups.
    pub num_groups: usize,
    /// Live barriers.
    pub num_barriers: usize,
    /// Committed data bytes in use.
    pub data_bytes_used: usize,
    /// Configured data budget.
    pub data_bytes_budget: usize,
}

/// Read access to an asset's object payload: the committed record for
/// loaded assets, the type's "async"/"failed" placeholder otherwise.
pub enum ObjData<'a> {
    /// Payload of the committed record.
    Committed(ObjDataGuard<'a>),
    /// Placeholder object registered with the type.
    Placeholder(Arc<Vec<u8>>),
}

impl Deref for ObjData<'_> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        match self {
            Self::Committed(guard) => guard,
            Self::Placeholder(bytes) => bytes.as_slice(),
        }
    }
}

/// The asset pipeline context. Lifetime bracketed by
/// [`AssetManager::initialize`] and drop.
pub struct AssetManager {
    shared: Arc<PipelineShared>,
    groups: RwLock<HandlePool<GroupData>>,
    barriers: RwLock<HandlePool<Arc<BarrierInner>>>,
    scheduler: Mutex<Scheduler>,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    runtime_handle: tokio::runtime::Handle,
    main_thread: std::thread::ThreadId,
    config: AssetConfig,
    changed_paths: Arc<Mutex<Vec<String>>>,
    /// Hidden group servicing file-change re-dispatches.
    reload_group: GroupHandle,
    bake_queue: Arc<BakeQueue>,
    bake_endpoint: Mutex<Option<Arc<RemoteServer>>>,
    bake_pending: BakePendingMap,
}

impl Drop for AssetManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_background();
        }
    }
}

impl AssetManager {
    /// Brings the pipeline up: owned runtime, cache store with its
    /// persisted hash lookup, and the file-change hookup.
    pub fn initialize(
        vfs: Arc<Vfs>,
        gpu: Arc<dyn GpuBackend>,
        config: AssetConfig,
    ) -> Result<Arc<Self>, AssetError> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("kiln-worker");
        if config.worker_threads > 0 {
            builder.worker_threads(config.worker_threads);
        }
        let runtime = builder.build()?;
        let runtime_handle = runtime.handle().clone();

        let cache = Arc::new(CacheStore::new(
            config.cache_root.clone(),
            config.cache_only,
            Duration::from_millis(config.lookup_flush_dirty_ms),
            Duration::from_millis(config.lookup_flush_min_interval_ms),
        ));
        cache.load_lookup(&vfs);

        let shared = Arc::new(PipelineShared {
            vfs: Arc::clone(&vfs),
            db: Arc::new(AssetDatabase::new(
                config.max_assets,
                config.data_budget_bytes,
            )),
            types: Arc::new(RwLock::new(TypeRegistry::default())),
            cache,
            gpu,
            bake_client: RwLock::new(None),
        });

        let mut groups = HandlePool::new(config.max_groups.max(1) + 1);
        let reload_group = groups
            .alloc(GroupData::new())
            .ok_or(AssetError::AllocatorExhaustion("group"))?;

        let changed_paths = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = Arc::clone(&changed_paths);
            vfs.register_file_change_callback(Arc::new(move |path| {
                sink.lock().unwrap().push(path.to_owned());
            }));
        }

        info!("asset manager up ({} header slots)", config.max_assets);
        Ok(Arc::new(Self {
            shared,
            groups: RwLock::new(groups),
            barriers: RwLock::new(HandlePool::new(config.max_barriers.max(1))),
            scheduler: Mutex::new(Scheduler::new()),
            runtime: Mutex::new(Some(runtime)),
            runtime_handle,
            main_thread: std::thread::current().id(),
            config,
            changed_paths,
            reload_group: reload_group.retag(),
            bake_queue: Arc::new(BakeQueue::default()),
            bake_endpoint: Mutex::new(None),
            bake_pending: Arc::new(Mutex::new(std::collections::HashMap::new())),
        }))
    }

    fn guard_main(&self, operation: &str) -> Result<(), AssetError> {
        if std::thread::current().id() != self.main_thread {
            error!("'{}' called off the main thread; ignored", operation);
            return Err(AssetError::NotMainThread);
        }
        Ok(())
    }

    // ---- type registry ----

    /// Registers an asset type.
    pub fn register_type(&self, desc: AssetTypeDesc) -> Result<(), AssetError> {
        self.shared.types.write().unwrap().register(desc)
    }

    /// Builds and registers a type descriptor in one call.
    pub fn register_type_with(
        &self,
        type_id: u32,
        name: &str,
        baker: Arc<dyn AssetBaker>,
        async_obj: Vec<u8>,
        failed_obj: Vec<u8>,
    ) -> Result<(), AssetError> {
        self.register_type(AssetTypeDesc {
            type_id,
            name: name.to_owned(),
            baker,
            async_obj: Arc::new(async_obj),
            failed_obj: Arc::new(failed_obj),
        })
    }

    /// Tombstones an asset type; in-flight loads against it drain without
    /// creating or releasing resources.
    pub fn unregister_type(&self, type_id: u32) {
        self.shared.types.write().unwrap().unregister(type_id);
    }

    // ---- groups ----

    /// Creates an empty group in the Idle state.
    pub fn create_group(&self) -> Result<GroupHandle, AssetError> {
        self.groups
            .write()
            .unwrap()
            .alloc(GroupData::new())
            .map(|h| h.retag())
            .ok_or(AssetError::AllocatorExhaustion("group"))
    }

    /// Destroys an Idle group, releasing any handles it still retains.
    pub fn destroy_group(&self, group: GroupHandle) -> Result<(), AssetError> {
        self.guard_main("destroy_group")?;
        if self.scheduler.lock().unwrap().has_pending_for(group) {
            return Err(AssetError::GroupNotIdle);
        }

        let data = {
            let mut groups = self.groups.write().unwrap();
            let Some(data) = groups.get(group.retag()) else {
                return Err(AssetError::InvalidHandle);
            };
            if data.state() != GroupState::Idle {
                return Err(AssetError::GroupNotIdle);
            }
            groups.free(group.retag()).ok_or(AssetError::InvalidHandle)?
        };

        let retained = {
            let mut lists = data.lists.lock().unwrap();
            lists.load_list.clear();
            std::mem::take(&mut lists.retained)
        };
        pipeline::teardown_handles(&self.shared, retained);
        Ok(())
    }

    /// Resolves each request to a handle (existing entries gain a
    /// reference, new ones enter the database as Loading) and queues the
    /// handles for the group's next load. Only legal while Idle.
    pub fn add_to_load_queue(
        &self,
        group: GroupHandle,
        requests: &[AssetParams],
    ) -> Result<Vec<AssetHandle>, AssetError> {
        let groups = self.groups.read().unwrap();
        let Some(data) = groups.get(group.retag()) else {
            return Err(AssetError::InvalidHandle);
        };
        if data.state() != GroupState::Idle {
            return Err(AssetError::GroupNotIdle);
        }

        let mut handles = Vec::with_capacity(requests.len());
        let mut lists = data.lists.lock().unwrap();
        for params in requests {
            let (handle, _created) = self.shared.db.create_or_fetch(params)?;
            lists.load_list.push(handle);
            lists.retained.push(handle);
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Queues a load job for the group. Cancels a pending unload of the
    /// same group. Main thread only.
    pub fn load_group(&self, group: GroupHandle) -> Result<(), AssetError> {
        self.guard_main("load_group")?;
        if self.groups.read().unwrap().get(group.retag()).is_none() {
            return Err(AssetError::InvalidHandle);
        }
        self.scheduler.lock().unwrap().submit_load(group);
        Ok(())
    }

    /// Queues an unload job for the group; annihilates with a pending load
    /// of the same group. Main thread only.
    pub fn unload_group(&self, group: GroupHandle) -> Result<(), AssetError> {
        self.guard_main("unload_group")?;
        if self.groups.read().unwrap().get(group.retag()).is_none() {
            return Err(AssetError::InvalidHandle);
        }
        self.scheduler.lock().unwrap().submit_unload(group);
        Ok(())
    }

    /// Current state of a group.
    pub fn group_state(&self, group: GroupHandle) -> GroupState {
        self.groups
            .read()
            .unwrap()
            .get(group.retag())
            .map_or(GroupState::Idle, GroupData::state)
    }

    /// True once the group's last load completed.
    pub fn is_load_finished(&self, group: GroupHandle) -> bool {
        self.group_state(group) == GroupState::Loaded
            && !self.scheduler.lock().unwrap().has_pending_for(group)
    }

    /// True while the group has no job running or pending.
    pub fn is_idle(&self, group: GroupHandle) -> bool {
        self.group_state(group) == GroupState::Idle
            && !self.scheduler.lock().unwrap().has_pending_for(group)
    }

    /// Spins the scheduler until the group settles (Loaded after a load,
    /// Idle after an unload). Main thread only: calling this from a worker
    /// would deadlock the pipeline, so it refuses and returns immediately.
    pub fn wait_group(&self, group: GroupHandle) {
        if self.guard_main("wait_group").is_err() {
            return;
        }
        loop {
            self.update();
            let pending = self.scheduler.lock().unwrap().has_pending_for(group);
            let state = self.group_state(group);
            if !pending && matches!(state, GroupState::Loaded | GroupState::Idle) {
                return;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    // ---- barriers ----

    /// Creates a counted barrier.
    pub fn create_barrier(&self) -> Result<BarrierHandle, AssetError> {
        self.barriers
            .write()
            .unwrap()
            .alloc(BarrierInner::new())
            .map(|h| h.retag())
            .ok_or(AssetError::AllocatorExhaustion("barrier"))
    }

    /// Destroys a barrier.
    pub fn destroy_barrier(&self, barrier: BarrierHandle) {
        self.barriers.write().unwrap().free(barrier.retag());
    }

    /// Attaches a barrier to a group: each load dispatch increments it,
    /// each load completion decrements it.
    pub fn attach_barrier(
        &self,
        group: GroupHandle,
        barrier: BarrierHandle,
    ) -> Result<(), AssetError> {
        let barriers = self.barriers.read().unwrap();
        let Some(inner) = barriers.get(barrier.retag()) else {
            return Err(AssetError::InvalidHandle);
        };
        let groups = self.groups.read().unwrap();
        let Some(data) = groups.get(group.retag()) else {
            return Err(AssetError::InvalidHandle);
        };
        *data.barrier.lock().unwrap() = Some(Arc::clone(inner));
        Ok(())
    }

    /// Pumps the scheduler until the barrier count reaches zero or the
    /// timeout expires. Main thread only.
    pub fn wait_barrier(&self, barrier: BarrierHandle, timeout: Duration) -> bool {
        if self.guard_main("wait_barrier").is_err() {
            return false;
        }
        let Some(inner) = self.barriers.read().unwrap().get(barrier.retag()).cloned() else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        loop {
            self.update();
            if inner.wait(Duration::from_millis(1)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    // ---- asset queries ----

    /// Object payload of an asset: the committed record once Loaded, the
    /// type's "async" placeholder while Loading, the "failed" placeholder
    /// after a failure. `None` for dead handles.
    pub fn get_obj_data(&self, handle: AssetHandle) -> Option<ObjData<'_>> {
        match self.shared.db.state(handle) {
            AssetState::Zombie => None,
            AssetState::Loaded => self.shared.db.obj_data(handle).map(ObjData::Committed),
            placeholder_state => {
                let params = self.shared.db.params(handle)?;
                let types = self.shared.types.read().unwrap();
                let (desc, _) = types.get_any(params.type_id)?;
                let bytes = if placeholder_state == AssetState::LoadFailed {
                    Arc::clone(&desc.failed_obj)
                } else {
                    Arc::clone(&desc.async_obj)
                };
                Some(ObjData::Placeholder(bytes))
            }
        }
    }

    /// Load parameters of an asset.
    pub fn get_params(&self, handle: AssetHandle) -> Option<AssetParams> {
        self.shared.db.params(handle)
    }

    /// Tooling snapshot of an asset.
    pub fn get_info(&self, handle: AssetHandle) -> Option<AssetInfo> {
        self.shared.db.info(handle)
    }

    /// State of an asset entry.
    pub fn asset_state(&self, handle: AssetHandle) -> AssetState {
        self.shared.db.state(handle)
    }

    /// True while the handle addresses a live entry.
    pub fn is_alive(&self, handle: AssetHandle) -> bool {
        self.shared.db.is_alive(handle)
    }

    /// Adds a reference to a live asset.
    pub fn add_ref(&self, handle: AssetHandle) -> bool {
        self.shared.db.add_ref(handle)
    }

    /// Number of live asset entries.
    pub fn live_assets(&self) -> usize {
        self.shared.db.live_count()
    }

    /// Number of entries in the persistent params-hash → asset-hash
    /// lookup.
    pub fn cache_lookup_len(&self) -> usize {
        self.shared.cache.lookup_len()
    }

    /// Pool usage snapshot.
    pub fn budget_stats(&self) -> BudgetStats {
        BudgetStats {
            num_assets: self.shared.db.live_count(),
            max_assets: self.shared.db.header_capacity(),
            num_types: self.shared.types.read().unwrap().len(),
            num_groups: self.groups.read().unwrap().len().saturating_sub(1),
            num_barriers: self.barriers.read().unwrap().len(),
            data_bytes_used: self.shared.db.data_bytes(),
            data_bytes_budget: self.shared.db.data_budget(),
        }
    }

    // ---- remote ----

    /// Attaches the command-bus client used for remote mounts' bakes.
    pub fn connect_remote(&self, client: RemoteClient) {
        *self.shared.bake_client.write().unwrap() =
            Some(BakeClient::new(client, Arc::clone(&self.bake_pending)));
    }

    pub(crate) fn bake_pending(&self) -> BakePendingMap {
        Arc::clone(&self.bake_pending)
    }

    pub(crate) fn set_bake_endpoint(&self, endpoint: Arc<RemoteServer>) {
        *self.bake_endpoint.lock().unwrap() = Some(endpoint);
    }

    pub(crate) fn enqueue_bake(&self, command: FourCC, params: AssetParams) {
        self.bake_queue.push(BakeRequest { command, params });
    }

    // ---- scheduler ----

    /// One main-thread tick: retire the finished job, dispatch the next
    /// pending one (Server > Load > Unload), and flush the hash lookup
    /// when due.
    pub fn update(&self) {
        if self.guard_main("update").is_err() {
            return;
        }

        self.redispatch_changed_sources();

        if self.bake_endpoint.lock().unwrap().is_some() && !self.bake_queue.is_empty() {
            self.scheduler.lock().unwrap().submit_server();
        }

        let job = self.scheduler.lock().unwrap().tick();
        if let Some(job) = job {
            self.dispatch(job);
        }

        if self.shared.cache.flush_due() {
            self.shared.cache.flush(&self.shared.vfs);
        }
    }

    fn redispatch_changed_sources(&self) {
        let changed: Vec<String> = std::mem::take(&mut *self.changed_paths.lock().unwrap());
        if changed.is_empty() {
            return;
        }

        let mut touched = false;
        for path in &changed {
            for handle in self.shared.db.handles_for_changed_path(path) {
                info!("source '{}' changed; re-dispatching", path);
                let groups = self.groups.read().unwrap();
                if let Some(data) = groups.get(self.reload_group.retag()) {
                    data.lists.lock().unwrap().load_list.push(handle);
                    touched = true;
                }
            }
        }
        if touched {
            self.scheduler.lock().unwrap().submit_load(self.reload_group);
        }
    }

    fn dispatch(&self, job: PendingJob) {
        match job.kind {
            JobKind::Server => {
                let endpoint = self.bake_endpoint.lock().unwrap().clone();
                let Some(endpoint) = endpoint else { return };
                let task = self.runtime_handle.spawn(crate::server::run_server_job(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.bake_queue),
                    endpoint,
                    self.config.server_max_in_flight,
                ));
                self.scheduler.lock().unwrap().set_current(job.kind, task);
            }
            JobKind::Load | JobKind::Unload => {
                let refs = {
                    let groups = self.groups.read().unwrap();
                    let Some(data) = groups.get(job.group.retag()) else { return };

                    let barrier = if job.kind == JobKind::Load {
                        let barrier = data.barrier.lock().unwrap().clone();
                        if let Some(barrier) = &barrier {
                            barrier.increment();
                        }
                        barrier
                    } else {
                        None
                    };
                    data.state.store(
                        if job.kind == JobKind::Load {
                            GroupState::Loading as u32
                        } else {
                            GroupState::Unloading as u32
                        },
                        Ordering::Release,
                    );
                    GroupJobRefs {
                        state: Arc::clone(&data.state),
                        lists: Arc::clone(&data.lists),
                        barrier,
                        retain_deps: job.group != self.reload_group,
                        force_rebake: job.group == self.reload_group,
                    }
                };

                let shared = Arc::clone(&self.shared);
                let task = if job.kind == JobKind::Load {
                    self.runtime_handle
                        .spawn(pipeline::run_load_group(shared, refs))
                } else {
                    self.runtime_handle
                        .spawn(pipeline::run_unload_group(shared, refs))
                };
                self.scheduler.lock().unwrap().set_current(job.kind, task);
            }
        }
    }
}

/// RAII wrapper around a barrier: waits and (when owned) destroys it on
/// scope exit.
pub struct BarrierScope<'a> {
    manager: &'a AssetManager,
    barrier: BarrierHandle,
    owns: bool,
}

impl<'a> BarrierScope<'a> {
    /// Creates and owns a fresh barrier.
    pub fn new(manager: &'a AssetManager) -> Result<Self, AssetError> {
        Ok(Self {
            manager,
            barrier: manager.create_barrier()?,
            owns: true,
        })
    }

    /// Wraps an existing barrier without taking ownership.
    pub fn wrap(manager: &'a AssetManager, barrier: BarrierHandle) -> Self {
        Self {
            manager,
            barrier,
            owns: false,
        }
    }

    /// The wrapped barrier.
    pub fn barrier(&self) -> BarrierHandle {
        self.barrier
    }
}

impl Drop for BarrierScope<'_> {
    fn drop(&mut self) {
        self.manager
            .wait_barrier(self.barrier, Duration::from_secs(60));
        if self.owns {
            self.manager.destroy_barrier(self.barrier);
        }
    }
}
