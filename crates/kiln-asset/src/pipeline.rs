//! The load and unload pipelines.
//!
//! A load job services one group in batches: resolve each asset's blob
//! source (cache, source bake, or remote bake), run the bakers in parallel,
//! harvest discovered dependencies breadth-first into the same group,
//! persist fresh bakes to the cache, instantiate GPU objects, and commit
//! the records into the database. The scheduler guarantees a single group
//! job is in flight, which makes the commit step the database's only
//! writer.

use std::{
    collections::HashSet,
    sync::{atomic::Ordering, Arc, Mutex, RwLock},
};

use kiln_vfs::{MountType, Vfs, VfsFlags};
use tracing::{error, info, warn};

use crate::{
    baker::{AssetBaker, AssetRecordBuilder},
    cache::{CacheRead, CacheStore},
    database::{AssetDatabase, AssetHandle, AssetState},
    gpu::GpuBackend,
    group::{BarrierInner, GroupLists, GroupState},
    meta,
    params::AssetParams,
    record::{AssetRecord, GpuObjectDesc},
    remote::BakeClient,
    types::TypeRegistry,
    AssetError,
};

/// Per-batch ceiling of the load pipeline.
pub(crate) const LOAD_BATCH_SIZE: usize = 128;

/// Everything a group job needs, shared with the manager.
pub(crate) struct PipelineShared {
    pub vfs: Arc<Vfs>,
    pub db: Arc<AssetDatabase>,
    pub types: Arc<RwLock<TypeRegistry>>,
    pub cache: Arc<CacheStore>,
    pub gpu: Arc<dyn GpuBackend>,
    pub bake_client: RwLock<Option<BakeClient>>,
}

/// The slices of one group a job operates on.
pub(crate) struct GroupJobRefs {
    pub state: Arc<std::sync::atomic::AtomicU32>,
    pub lists: Arc<Mutex<GroupLists>>,
    pub barrier: Option<Arc<BarrierInner>>,
    /// Whether harvested dependencies are also retained by the group.
    /// False for the internal re-dispatch group, whose reloads swap
    /// references instead of accumulating them.
    pub retain_deps: bool,
    /// Service handles even when they are already Loaded; set for
    /// file-change re-dispatches.
    pub force_rebake: bool,
}

/// Output of a successful bake or cache read, before it is wired into the
/// database.
pub(crate) struct Baked {
    pub record: AssetRecord,
    /// Serialized record payload (pre-patch); exactly the cache body.
    pub payload: Vec<u8>,
    pub asset_hash: u32,
    /// True when the payload still has to be written to the local cache.
    pub needs_persist: bool,
}

enum LoadOutcome {
    Fresh(Baked),
    AlreadyLoaded,
}

struct CommitItem {
    handle: AssetHandle,
    path: String,
    record: AssetRecord,
    committed_size: usize,
    dep_handles: Vec<AssetHandle>,
    gpu_ids: Vec<u64>,
    create_resources: bool,
}

pub(crate) async fn run_load_group(shared: Arc<PipelineShared>, refs: GroupJobRefs) {
    let mut serviced: HashSet<u32> = HashSet::new();
    // Committed referrers waiting for their dependencies to settle before
    // their state flips to Loaded.
    let mut pending_publish: Vec<(AssetHandle, Vec<AssetHandle>)> = Vec::new();

    loop {
        let batch: Vec<AssetHandle> = {
            let lists = refs.lists.lock().unwrap();
            lists
                .load_list
                .iter()
                .copied()
                .filter(|handle| !serviced.contains(&handle.raw()))
                .take(LOAD_BATCH_SIZE)
                .collect()
        };
        if batch.is_empty() {
            break;
        }
        serviced.extend(batch.iter().map(AssetHandle::raw));

        // Plan and bake the whole batch in parallel; remote bakes await
        // their per-task reply signal inside.
        let results = futures::future::join_all(
            batch
                .iter()
                .map(|&handle| load_one(Arc::clone(&shared), handle, refs.force_rebake)),
        )
        .await;

        // Harvest dependencies and queue cache writes. New handles land on
        // the group's load list, so the next batch iteration pulls them
        // in: breadth-first, and cycles are impossible because existing
        // handles are merged.
        let mut commits = Vec::new();
        for (handle, result) in results {
            match result {
                Ok(LoadOutcome::AlreadyLoaded) => {}
                Ok(LoadOutcome::Fresh(baked)) => {
                    match prepare_commit(&shared, &refs, handle, baked) {
                        Ok(Some(item)) => commits.push(item),
                        Ok(None) => {}
                        Err(err) => fail_asset(&shared, handle, &err),
                    }
                }
                Err(err) => fail_asset(&shared, handle, &err),
            }
        }

        // Instantiate GPU objects in parallel across the batch.
        let created = futures::future::join_all(commits.into_iter().map(|item| {
            let gpu = Arc::clone(&shared.gpu);
            tokio::task::spawn_blocking(move || create_gpu_objects(gpu.as_ref(), item))
        }))
        .await;

        // Commit: publish records and flip states, one at a time.
        for joined in created {
            match joined {
                Ok(Ok(item)) => commit_asset(&shared, item, &mut pending_publish),
                Ok(Err((handle, err))) => fail_asset(&shared, handle, &err),
                Err(join_err) => error!("gpu creation task failed: {}", join_err),
            }
        }
        publish_ready(&shared, &mut pending_publish);
    }

    for (handle, _) in pending_publish.drain(..) {
        warn!("publishing {:?} with unsettled dependencies", handle);
        shared.db.set_state(handle, AssetState::Loaded);
    }

    // Drain everything this job serviced; entries pushed after the final
    // batch scan (late re-dispatches) stay queued for the next job.
    refs.lists
        .lock()
        .unwrap()
        .load_list
        .retain(|handle| !serviced.contains(&handle.raw()));
    refs.state
        .store(GroupState::Loaded as u32, Ordering::Release);
    if let Some(barrier) = &refs.barrier {
        barrier.decrement();
    }
}

pub(crate) async fn run_unload_group(shared: Arc<PipelineShared>, refs: GroupJobRefs) {
    let retained = {
        let mut lists = refs.lists.lock().unwrap();
        lists.load_list.clear();
        std::mem::take(&mut lists.retained)
    };
    teardown_handles(&shared, retained);

    refs.state.store(GroupState::Idle as u32, Ordering::Release);
    if let Some(barrier) = &refs.barrier {
        barrier.decrement();
    }
}

/// Drops one reference per listed handle; entries reaching zero are freed
/// (GPU objects destroyed, data and header released) and cascade their own
/// dependencies onto the list.
pub(crate) fn teardown_handles(shared: &PipelineShared, mut list: Vec<AssetHandle>) {
    while let Some(handle) = list.pop() {
        if shared.db.dec_ref(handle) != Some(0) {
            continue;
        }
        let Some(header) = shared.db.free(handle) else {
            continue;
        };
        let tombstoned = shared
            .types
            .read()
            .unwrap()
            .get_any(header.type_id)
            .map_or(true, |(_, tombstoned)| tombstoned);
        if !tombstoned {
            for id in &header.gpu_ids {
                shared.gpu.destroy(*id);
            }
        }
        list.extend(header.dep_handles.iter().copied());
    }
}

fn type_desc_of(
    shared: &PipelineShared,
    type_id: u32,
) -> Result<(String, Arc<dyn AssetBaker>, bool), AssetError> {
    let types = shared.types.read().unwrap();
    let Some((desc, tombstoned)) = types.get_any(type_id) else {
        return Err(AssetError::UnknownType(type_id));
    };
    Ok((desc.name.clone(), Arc::clone(&desc.baker), tombstoned))
}

async fn load_one(
    shared: Arc<PipelineShared>,
    handle: AssetHandle,
    force_rebake: bool,
) -> (AssetHandle, Result<LoadOutcome, AssetError>) {
    let result = load_one_inner(shared, handle, force_rebake).await;
    (handle, result)
}

async fn load_one_inner(
    shared: Arc<PipelineShared>,
    handle: AssetHandle,
    force_rebake: bool,
) -> Result<LoadOutcome, AssetError> {
    let Some(params) = shared.db.params(handle) else {
        return Err(AssetError::InvalidHandle);
    };
    if shared.db.state(handle) == AssetState::Loaded && !force_rebake {
        return Ok(LoadOutcome::AlreadyLoaded);
    }

    let (type_name, baker, tombstoned) = type_desc_of(&shared, params.type_id)?;
    if tombstoned {
        // Unregistered mid-flight: drain without creating resources.
        return Err(AssetError::BakeFailure {
            path: params.path,
            message: "asset type was unregistered".to_owned(),
        });
    }

    if shared.vfs.get_mount_type(&params.path) == Some(MountType::Remote) {
        let baked = load_remote(&shared, &params, &type_name).await?;
        return Ok(LoadOutcome::Fresh(baked));
    }

    let worker_shared = Arc::clone(&shared);
    let baked = tokio::task::spawn_blocking(move || {
        bake_or_fetch(&worker_shared, &params, &type_name, baker.as_ref())
    })
    .await
    .map_err(|join_err| AssetError::Serialization(format!("bake task failed: {}", join_err)))??;
    Ok(LoadOutcome::Fresh(baked))
}

/// The local blob path: consult the hash lookup, probe the cache, fall back
/// to baking from source. Shared by group loads and the bake server.
pub(crate) fn bake_or_fetch(
    shared: &PipelineShared,
    params: &AssetParams,
    type_name: &str,
    baker: &dyn AssetBaker,
) -> Result<Baked, AssetError> {
    let params_hash = params.params_hash();
    let actual_hash = shared
        .cache
        .compute_asset_hash(&shared.vfs, &params.path, params_hash);

    if let Some(predicted) = shared.cache.predicted_hash(params_hash) {
        // The entry is reusable when the re-stat agrees; a zero hash means
        // the source is unreadable and the cache is all there is.
        if predicted == actual_hash || actual_hash == 0 {
            let cache_path = shared.cache.cache_path(&params.path, predicted, type_name);
            match shared.cache.read_entry(&shared.vfs, &cache_path) {
                CacheRead::Hit(payload) => {
                    let record = AssetRecord::from_bytes(&payload)?;
                    info!("[cached] {}", params.path);
                    return Ok(Baked {
                        record,
                        payload,
                        asset_hash: predicted,
                        needs_persist: false,
                    });
                }
                CacheRead::Miss | CacheRead::Corrupt => {}
            }
        }
    }

    if shared.cache.cache_only() {
        return Err(AssetError::BakeFailure {
            path: params.path.clone(),
            message: "no cache entry in cache-only mode".to_owned(),
        });
    }

    let source = shared
        .vfs
        .read(&params.path, VfsFlags::empty())
        .map_err(|_| AssetError::SourceMissing(params.path.clone()))?;
    let sidecar = meta::load_meta(&shared.vfs, &params.path, params.platform);

    let mut builder = AssetRecordBuilder::new(sidecar);
    baker
        .bake(params, &mut builder, &source)
        .map_err(|message| AssetError::BakeFailure {
            path: params.path.clone(),
            message,
        })?;
    let record = builder.finish();

    if record.is_empty() {
        // No data and no error: the baker decided the cache entry is fine.
        // The cache is the ground truth then.
        let cache_path = shared.cache.cache_path(&params.path, actual_hash, type_name);
        return match shared.cache.read_entry(&shared.vfs, &cache_path) {
            CacheRead::Hit(payload) => {
                let record = AssetRecord::from_bytes(&payload)?;
                info!("[cached] {}", params.path);
                Ok(Baked {
                    record,
                    payload,
                    asset_hash: actual_hash,
                    needs_persist: false,
                })
            }
            _ => Err(AssetError::BakeFailure {
                path: params.path.clone(),
                message: "baker produced no data and no cache entry exists".to_owned(),
            }),
        };
    }

    record.validate()?;
    let payload = record.to_bytes()?;
    Ok(Baked {
        record,
        payload,
        asset_hash: actual_hash,
        needs_persist: true,
    })
}

async fn load_remote(
    shared: &Arc<PipelineShared>,
    params: &AssetParams,
    type_name: &str,
) -> Result<Baked, AssetError> {
    let receiver = {
        let client = shared.bake_client.read().unwrap();
        let Some(client) = client.as_ref() else {
            return Err(AssetError::RemoteDisconnect(
                "no remote connection".to_owned(),
            ));
        };
        client.request(params)?
    };

    let reply = receiver
        .await
        .map_err(|_| AssetError::RemoteDisconnect("connection closed".to_owned()))?;
    let (asset_hash, entry) = reply.map_err(AssetError::RemoteDisconnect)?;

    // Persist the server's entry verbatim, then proceed identically to the
    // baked-load path.
    let cache_path = shared.cache.cache_path(&params.path, asset_hash, type_name);
    shared.vfs.write_async(
        &cache_path,
        entry.clone(),
        VfsFlags::CREATE_DIRS,
        Box::new(|path, written| {
            if written == 0 {
                warn!("cache write to '{}' failed", path);
            }
        }),
    );

    let payload = crate::cache::decode_entry(&entry)
        .map_err(|_| AssetError::CacheCorrupt(cache_path))?;
    let record = AssetRecord::from_bytes(&payload)?;
    shared.cache.update_lookup(params.params_hash(), asset_hash);

    Ok(Baked {
        record,
        payload,
        asset_hash,
        needs_persist: false,
    })
}

/// Pre-commit wiring: reload arbitration, cache persist, and dependency
/// harvest. Returns `None` when a hot reload decided to keep the old data.
fn prepare_commit(
    shared: &Arc<PipelineShared>,
    refs: &GroupJobRefs,
    handle: AssetHandle,
    baked: Baked,
) -> Result<Option<CommitItem>, AssetError> {
    let Some(params) = shared.db.params(handle) else {
        return Err(AssetError::InvalidHandle);
    };
    let (type_name, baker, _) = type_desc_of(shared, params.type_id)?;

    let Baked {
        mut record,
        payload,
        asset_hash,
        needs_persist,
    } = baked;

    if needs_persist {
        let cache_path = shared.cache.cache_path(&params.path, asset_hash, &type_name);
        shared
            .cache
            .write_entry_async(&shared.vfs, &cache_path, &payload);
        shared.cache.update_lookup(params.params_hash(), asset_hash);
    }

    // Hot reload: the baker may veto swapping the live record. The fresh
    // bake stays cached either way.
    if let Some(old_obj) = shared.db.obj_data_clone(handle) {
        if !baker.reload(&record.obj_data, &old_obj) {
            info!("reload of '{}' rejected; keeping previous data", params.path);
            return Ok(None);
        }
    }

    let committed_size = payload.len();
    let mut dep_handles = Vec::with_capacity(record.dependencies.len());
    for slot in 0..record.dependencies.len() {
        let dep = &record.dependencies[slot];
        let dep_params = AssetParams {
            type_id: dep.type_id,
            path: dep.path.clone(),
            platform: dep.platform,
            extra: dep.extra.clone(),
            dont_create_resources: false,
        };
        let (dep_handle, created) = shared.db.create_or_fetch(&dep_params)?;
        record.patch_dependency(slot, dep_handle.raw())?;
        dep_handles.push(dep_handle);

        let mut lists = refs.lists.lock().unwrap();
        if refs.retain_deps {
            shared.db.add_ref(dep_handle);
            lists.retained.push(dep_handle);
        }
        // Only new handles queue for servicing; existing ones are merged,
        // which keeps the walk bounded and cycle-free.
        if created {
            lists.load_list.push(dep_handle);
        }
    }

    Ok(Some(CommitItem {
        handle,
        path: params.path,
        record,
        committed_size,
        dep_handles,
        gpu_ids: Vec::new(),
        create_resources: !params.dont_create_resources,
    }))
}

fn create_gpu_objects(
    gpu: &dyn GpuBackend,
    mut item: CommitItem,
) -> Result<CommitItem, (AssetHandle, AssetError)> {
    if !item.create_resources {
        return Ok(item);
    }

    for slot in 0..item.record.gpu_objects.len() {
        let created = {
            let gpu_slot = &item.record.gpu_objects[slot];
            match &gpu_slot.desc {
                GpuObjectDesc::Buffer(desc) => gpu.create_buffer(desc, &gpu_slot.content),
                GpuObjectDesc::Texture(desc) => gpu.create_texture(desc, &gpu_slot.content),
            }
        };
        match created {
            Ok(id) => {
                item.gpu_ids.push(id);
                if let Err(err) = item.record.patch_gpu_object(slot, id) {
                    release_gpu(gpu, &item.gpu_ids);
                    return Err((item.handle, err));
                }
            }
            Err(message) => {
                release_gpu(gpu, &item.gpu_ids);
                return Err((
                    item.handle,
                    AssetError::BakeFailure {
                        path: item.path,
                        message,
                    },
                ));
            }
        }
    }
    Ok(item)
}

fn release_gpu(gpu: &dyn GpuBackend, ids: &[u64]) {
    for id in ids {
        gpu.destroy(*id);
    }
}

fn commit_asset(
    shared: &Arc<PipelineShared>,
    item: CommitItem,
    pending_publish: &mut Vec<(AssetHandle, Vec<AssetHandle>)>,
) {
    let deps = item.dep_handles.clone();
    match shared.db.commit_record(
        item.handle,
        item.record,
        item.committed_size,
        item.dep_handles,
        item.gpu_ids.clone(),
    ) {
        Ok(replaced) => {
            pending_publish.push((item.handle, deps));
            if let Some((old_deps, old_gpu_ids)) = replaced {
                // A reload swapped the record: the previous incarnation's
                // resources and dependency references go away.
                for id in old_gpu_ids {
                    shared.gpu.destroy(id);
                }
                teardown_handles(shared, old_deps);
            }
        }
        Err(err) => {
            release_gpu(shared.gpu.as_ref(), &item.gpu_ids);
            fail_asset(shared, item.handle, &err);
        }
    }
}

/// Flips committed referrers to Loaded once every dependency reached a
/// terminal state. Loops so chains settle within one pass.
fn publish_ready(
    shared: &Arc<PipelineShared>,
    pending_publish: &mut Vec<(AssetHandle, Vec<AssetHandle>)>,
) {
    loop {
        let mut flipped = false;
        pending_publish.retain(|(handle, deps)| {
            let settled = deps.iter().all(|dep| {
                matches!(
                    shared.db.state(*dep),
                    AssetState::Loaded | AssetState::LoadFailed | AssetState::Zombie
                )
            });
            if settled {
                shared.db.set_state(*handle, AssetState::Loaded);
                flipped = true;
            }
            !settled
        });
        if !flipped {
            break;
        }
    }
}

fn fail_asset(shared: &PipelineShared, handle: AssetHandle, err: &AssetError) {
    let path = shared
        .db
        .params(handle)
        .map_or_else(|| "<stale>".to_owned(), |params| params.path);
    error!("load of '{}' failed: {}", path, err);
    shared.db.set_state(handle, AssetState::LoadFailed);
}
