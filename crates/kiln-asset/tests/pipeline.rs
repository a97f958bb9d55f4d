//! End-to-end pipeline scenarios: cold and warm loads, meta-driven
//! re-bakes, dependency fan-out, schedule cancellation, and remote bakes.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use kiln_asset::{
    register_bake_commands, AssetBaker, AssetConfig, AssetHandle, AssetManager, AssetParams,
    AssetPlatform, AssetRecordBuilder, AssetState, DependencyParams, GpuTextureDesc, GroupState,
    NullGpuBackend,
};
use kiln_remote::{CommandRegistry, RemoteClient, RemoteServer};
use kiln_vfs::{Vfs, VfsFlags};

const IMAGE_TYPE: u32 = u32::from_le_bytes(*b"IMG ");
const MODEL_TYPE: u32 = u32::from_le_bytes(*b"MDL ");

/// Meta-driven image "encoder": the object payload is an 8-byte GPU id
/// slot followed by the chosen format name.
struct ImageBaker {
    bakes: Arc<AtomicU32>,
}

impl AssetBaker for ImageBaker {
    fn bake(
        &self,
        _params: &AssetParams,
        builder: &mut AssetRecordBuilder,
        source: &[u8],
    ) -> Result<(), String> {
        self.bakes.fetch_add(1, Ordering::SeqCst);
        if source.is_empty() {
            return Err("empty image".to_owned());
        }

        let mut format = builder.get_meta_value("format", "RGBA8".to_owned());
        if builder.get_meta_value("sRGB", false) {
            format.push_str("_SRGB");
        }
        let mip_count = if builder.get_meta_value("generateMips", false) {
            4
        } else {
            1
        };

        let mut obj = vec![0_u8; 8];
        obj.extend_from_slice(format.as_bytes());
        builder.add_gpu_texture_object(
            0,
            GpuTextureDesc {
                width: 4,
                height: 4,
                format,
                mip_count,
            },
            source.to_vec(),
        );
        builder.set_obj_data(obj);
        Ok(())
    }
}

/// "Model parser": the source lists one texture path per line; the object
/// payload is a 4-byte handle slot per texture.
struct ModelBaker {
    bakes: Arc<AtomicU32>,
}

impl AssetBaker for ModelBaker {
    fn bake(
        &self,
        params: &AssetParams,
        builder: &mut AssetRecordBuilder,
        source: &[u8],
    ) -> Result<(), String> {
        self.bakes.fetch_add(1, Ordering::SeqCst);
        let text = std::str::from_utf8(source).map_err(|_| "model is not utf-8".to_owned())?;
        let textures: Vec<&str> = text.lines().filter(|line| !line.is_empty()).collect();

        builder.set_obj_data(vec![0_u8; textures.len() * 4]);
        for (slot, texture) in textures.iter().enumerate() {
            builder.add_dependency(
                (slot * 4) as u32,
                DependencyParams {
                    path: (*texture).to_owned(),
                    type_id: IMAGE_TYPE,
                    platform: params.platform,
                    extra: Vec::new(),
                },
            );
        }
        Ok(())
    }
}

struct Fx {
    vfs: Arc<Vfs>,
    manager: Arc<AssetManager>,
    gpu: Arc<NullGpuBackend>,
    image_bakes: Arc<AtomicU32>,
    model_bakes: Arc<AtomicU32>,
}

fn test_config() -> AssetConfig {
    AssetConfig {
        lookup_flush_dirty_ms: 0,
        lookup_flush_min_interval_ms: 0,
        ..AssetConfig::default()
    }
}

/// Builds a full stack over existing data/cache directories; rebuilding on
/// the same directories models a fresh process.
fn build(data_dir: &Path, cache_dir: &Path, watch: bool, config: AssetConfig) -> Fx {
    let vfs = Vfs::new();
    vfs.mount_local(data_dir, "data", watch).unwrap();
    vfs.mount_local(cache_dir, "cache", false).unwrap();

    let gpu = Arc::new(NullGpuBackend::new());
    let manager =
        AssetManager::initialize(Arc::clone(&vfs), Arc::<NullGpuBackend>::clone(&gpu), config)
            .unwrap();

    let image_bakes = Arc::new(AtomicU32::new(0));
    let model_bakes = Arc::new(AtomicU32::new(0));
    manager
        .register_type_with(
            IMAGE_TYPE,
            "Image",
            Arc::new(ImageBaker {
                bakes: Arc::clone(&image_bakes),
            }),
            b"ASYNC".to_vec(),
            b"FAILED".to_vec(),
        )
        .unwrap();
    manager
        .register_type_with(
            MODEL_TYPE,
            "Model",
            Arc::new(ModelBaker {
                bakes: Arc::clone(&model_bakes),
            }),
            b"ASYNC".to_vec(),
            b"FAILED".to_vec(),
        )
        .unwrap();

    Fx {
        vfs,
        manager,
        gpu,
        image_bakes,
        model_bakes,
    }
}

fn scenario_dirs(root: &Path) -> (PathBuf, PathBuf) {
    let data = root.join("data");
    let cache = root.join("cache");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::create_dir_all(&cache).unwrap();
    (data, cache)
}

fn image_params(path: &str) -> AssetParams {
    AssetParams::new(IMAGE_TYPE, path, AssetPlatform::Pc)
}

fn load_and_wait(fx: &Fx, group: kiln_asset::GroupHandle) {
    fx.manager.load_group(group).unwrap();
    fx.manager.wait_group(group);
}

fn obj_bytes(fx: &Fx, handle: AssetHandle) -> Vec<u8> {
    fx.manager.get_obj_data(handle).map(|d| d.to_vec()).unwrap()
}

fn image_format(fx: &Fx, handle: AssetHandle) -> String {
    String::from_utf8(obj_bytes(fx, handle)[8..].to_vec()).unwrap()
}

fn cache_files_under(dir: &Path, name_part: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().unwrap().to_string_lossy().contains(name_part) {
                found.push(path);
            }
        }
    }
    found
}

/// Cache writes are asynchronous; poll until `count` entries containing
/// `name_part` exist under `dir`.
fn wait_for_cache_files(dir: &Path, name_part: &str, count: usize) -> Vec<PathBuf> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let found = cache_files_under(dir, name_part);
        if found.len() >= count {
            return found;
        }
        assert!(
            Instant::now() < deadline,
            "expected {} cache entries matching '{}'",
            count,
            name_part
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Pump updates until the asynchronous lookup flush lands on disk.
fn flush_lookup(fx: &Fx) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while fx.vfs.get_file_size("/cache/_HashLookup.txt").is_none() {
        fx.manager.update();
        assert!(Instant::now() < deadline, "hash lookup never flushed");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn write_image_with_meta(fx: &Fx, path: &str, meta: &str) {
    fx.vfs
        .write(path, b"fake-png-bytes", VfsFlags::CREATE_DIRS)
        .unwrap();
    fx.vfs
        .write(&format!("{}.meta", path), meta.as_bytes(), VfsFlags::empty())
        .unwrap();
}

#[test]
fn s1_cold_load_of_a_single_image() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let fx = build(&data, &cache, false, test_config());

    write_image_with_meta(&fx, "/data/img/a.png", r#"{ format: "BC7", sRGB: true }"#);

    let group = fx.manager.create_group().unwrap();
    let request = image_params("/data/img/a.png");
    let handles = fx.manager.add_to_load_queue(group, &[request.clone()]).unwrap();
    let handle = handles[0];

    load_and_wait(&fx, group);

    assert_eq!(fx.manager.group_state(group), GroupState::Loaded);
    assert_eq!(fx.manager.asset_state(handle), AssetState::Loaded);
    assert_eq!(fx.image_bakes.load(Ordering::SeqCst), 1);
    assert_eq!(image_format(&fx, handle), "BC7_SRGB");

    // The GPU texture was created and its id patched into the payload.
    assert_eq!(fx.gpu.live_count(), 1);
    let gpu_id = u64::from_le_bytes(obj_bytes(&fx, handle)[..8].try_into().unwrap());
    assert_ne!(gpu_id, 0);

    // Cache entry and one lookup row appeared.
    let entries = wait_for_cache_files(&cache, "a.png_", 1);
    assert!(entries[0].to_string_lossy().ends_with(".Image"));
    assert_eq!(fx.manager.cache_lookup_len(), 1);

    // Params survive the round trip with their identity hash intact.
    assert_eq!(
        fx.manager.get_params(handle).unwrap().params_hash(),
        request.params_hash()
    );
}

#[test]
fn s2_warm_load_skips_the_encoder() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());

    {
        let fx = build(&data, &cache, false, test_config());
        write_image_with_meta(&fx, "/data/img/a.png", r#"{ format: "BC7", sRGB: true }"#);
        let group = fx.manager.create_group().unwrap();
        fx.manager
            .add_to_load_queue(group, &[image_params("/data/img/a.png")])
            .unwrap();
        load_and_wait(&fx, group);
        wait_for_cache_files(&cache, "a.png_", 1);
        flush_lookup(&fx);
    }

    // Fresh process: same request must come straight from the cache.
    let fx = build(&data, &cache, false, test_config());
    let group = fx.manager.create_group().unwrap();
    let handle = fx
        .manager
        .add_to_load_queue(group, &[image_params("/data/img/a.png")])
        .unwrap()[0];
    load_and_wait(&fx, group);

    assert_eq!(fx.manager.asset_state(handle), AssetState::Loaded);
    assert_eq!(fx.image_bakes.load(Ordering::SeqCst), 0, "encoder ran on a warm load");
    assert_eq!(image_format(&fx, handle), "BC7_SRGB");
    assert_eq!(fx.gpu.live_count(), 1);
}

#[test]
fn s3_meta_change_forces_a_rebake() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());

    {
        let fx = build(&data, &cache, false, test_config());
        write_image_with_meta(&fx, "/data/img/a.png", r#"{ format: "BC7", sRGB: true }"#);
        let group = fx.manager.create_group().unwrap();
        fx.manager
            .add_to_load_queue(group, &[image_params("/data/img/a.png")])
            .unwrap();
        load_and_wait(&fx, group);
        wait_for_cache_files(&cache, "a.png_", 1);
        flush_lookup(&fx);
    }

    // Author rewrites the sidecar; the predicted hash goes stale.
    std::thread::sleep(Duration::from_millis(20));
    let fx = build(&data, &cache, false, test_config());
    fx.vfs
        .write(
            "/data/img/a.png.meta",
            br#"{ format: "BC1", sRGB: true }"#,
            VfsFlags::empty(),
        )
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    let handle = fx
        .manager
        .add_to_load_queue(group, &[image_params("/data/img/a.png")])
        .unwrap()[0];
    load_and_wait(&fx, group);

    assert_eq!(fx.image_bakes.load(Ordering::SeqCst), 1, "stale entry was reused");
    assert_eq!(image_format(&fx, handle), "BC1_SRGB");
    // The stale entry remains under its old hash; a second one appeared.
    wait_for_cache_files(&cache, "a.png_", 2);
}

#[test]
fn s4_model_pulls_its_textures_in() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let fx = build(&data, &cache, false, test_config());

    for name in ["t0.png", "t1.png", "t2.png"] {
        fx.vfs
            .write(&format!("/data/img/{}", name), b"texels", VfsFlags::CREATE_DIRS)
            .unwrap();
    }
    fx.vfs
        .write(
            "/data/mdl/chest.mdl",
            b"/data/img/t0.png\n/data/img/t1.png\n/data/img/t2.png\n",
            VfsFlags::CREATE_DIRS,
        )
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    let model = fx
        .manager
        .add_to_load_queue(
            group,
            &[AssetParams::new(MODEL_TYPE, "/data/mdl/chest.mdl", AssetPlatform::Pc)],
        )
        .unwrap()[0];
    load_and_wait(&fx, group);

    assert_eq!(fx.manager.group_state(group), GroupState::Loaded);
    assert_eq!(fx.model_bakes.load(Ordering::SeqCst), 1);
    assert_eq!(fx.image_bakes.load(Ordering::SeqCst), 3);
    assert_eq!(fx.manager.live_assets(), 4);
    assert_eq!(fx.manager.get_info(model).unwrap().num_depends, 3);

    // Every texture handle patched into the model resolves to a loaded
    // image record.
    let model_obj = obj_bytes(&fx, model);
    for slot in 0..3 {
        let raw = u32::from_le_bytes(model_obj[slot * 4..slot * 4 + 4].try_into().unwrap());
        assert_ne!(raw, 0);
        let texture = AssetHandle::from_raw(raw);
        assert_eq!(fx.manager.asset_state(texture), AssetState::Loaded);
        assert!(obj_bytes(&fx, texture).len() > 8);
    }
    assert_eq!(fx.gpu.live_count(), 3);

    // Unload cascades through the dependencies.
    fx.manager.unload_group(group).unwrap();
    fx.manager.wait_group(group);
    assert_eq!(fx.manager.group_state(group), GroupState::Idle);
    assert_eq!(fx.manager.live_assets(), 0);
    assert_eq!(fx.gpu.live_count(), 0);
}

#[test]
fn shared_dependency_is_merged_and_baked_once() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let fx = build(&data, &cache, false, test_config());

    fx.vfs
        .write("/data/img/shared.png", b"texels", VfsFlags::CREATE_DIRS)
        .unwrap();
    for name in ["m1.mdl", "m2.mdl"] {
        fx.vfs
            .write(
                &format!("/data/mdl/{}", name),
                b"/data/img/shared.png\n",
                VfsFlags::CREATE_DIRS,
            )
            .unwrap();
    }

    // Two referrers in the same batch harvest the same texture; the
    // second harvest merges with the existing handle instead of queueing
    // it again.
    let group = fx.manager.create_group().unwrap();
    let models = fx
        .manager
        .add_to_load_queue(
            group,
            &[
                AssetParams::new(MODEL_TYPE, "/data/mdl/m1.mdl", AssetPlatform::Pc),
                AssetParams::new(MODEL_TYPE, "/data/mdl/m2.mdl", AssetPlatform::Pc),
            ],
        )
        .unwrap();
    load_and_wait(&fx, group);

    assert_eq!(fx.manager.group_state(group), GroupState::Loaded);
    assert_eq!(fx.model_bakes.load(Ordering::SeqCst), 2);
    assert_eq!(fx.image_bakes.load(Ordering::SeqCst), 1, "shared texture baked twice");
    assert_eq!(fx.manager.live_assets(), 3);
    assert_eq!(fx.gpu.live_count(), 1, "shared texture created more than one GPU object");

    // Both models resolve to the very same texture handle.
    let resolve = |model: AssetHandle| {
        let obj = obj_bytes(&fx, model);
        AssetHandle::from_raw(u32::from_le_bytes(obj[..4].try_into().unwrap()))
    };
    let texture = resolve(models[0]);
    assert_eq!(texture, resolve(models[1]));
    assert_eq!(fx.manager.asset_state(texture), AssetState::Loaded);
    assert_eq!(fx.manager.get_info(texture).unwrap().ref_count, 4);

    // Both referrers' releases plus both group retentions unwind.
    fx.manager.unload_group(group).unwrap();
    fx.manager.wait_group(group);
    assert_eq!(fx.manager.live_assets(), 0);
    assert_eq!(fx.gpu.live_count(), 0);
}

#[test]
fn s5_load_then_unload_annihilates_before_dispatch() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let fx = build(&data, &cache, false, test_config());
    fx.vfs
        .write("/data/a.png", b"px", VfsFlags::empty())
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    let handle = fx
        .manager
        .add_to_load_queue(group, &[image_params("/data/a.png")])
        .unwrap()[0];

    fx.manager.load_group(group).unwrap();
    fx.manager.unload_group(group).unwrap();
    assert!(fx.manager.is_idle(group));

    fx.manager.update();
    std::thread::sleep(Duration::from_millis(50));
    fx.manager.update();

    assert_eq!(fx.manager.group_state(group), GroupState::Idle);
    assert_eq!(fx.image_bakes.load(Ordering::SeqCst), 0, "a job was dispatched");
    assert_eq!(fx.manager.asset_state(handle), AssetState::Loading);

    // The group still retains its queued handle until destroyed.
    fx.manager.destroy_group(group).unwrap();
    assert!(!fx.manager.is_alive(handle));
    assert_eq!(fx.manager.live_assets(), 0);
}

#[test]
fn unload_then_load_leaves_exactly_the_load() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let fx = build(&data, &cache, false, test_config());
    fx.vfs
        .write("/data/a.png", b"px", VfsFlags::empty())
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    let handle = fx
        .manager
        .add_to_load_queue(group, &[image_params("/data/a.png")])
        .unwrap()[0];
    load_and_wait(&fx, group);
    assert_eq!(fx.manager.asset_state(handle), AssetState::Loaded);

    fx.manager.unload_group(group).unwrap();
    fx.manager.load_group(group).unwrap();
    fx.manager.wait_group(group);

    // The unload was cancelled; the asset never went away.
    assert_eq!(fx.manager.group_state(group), GroupState::Loaded);
    assert_eq!(fx.manager.asset_state(handle), AssetState::Loaded);
    assert_eq!(fx.manager.live_assets(), 1);
}

#[test]
fn equal_requests_share_one_handle_and_one_bake() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let fx = build(&data, &cache, false, test_config());
    fx.vfs
        .write("/data/a.png", b"px", VfsFlags::empty())
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    let first = fx
        .manager
        .add_to_load_queue(group, &[image_params("/data/a.png")])
        .unwrap()[0];
    let second = fx
        .manager
        .add_to_load_queue(group, &[image_params("/data/a.png")])
        .unwrap()[0];
    assert_eq!(first, second);
    assert_eq!(fx.manager.get_info(first).unwrap().ref_count, 2);

    load_and_wait(&fx, group);
    assert_eq!(fx.image_bakes.load(Ordering::SeqCst), 1);

    // Both references came from this group; unload returns to baseline.
    fx.manager.unload_group(group).unwrap();
    fx.manager.wait_group(group);
    assert_eq!(fx.manager.live_assets(), 0);
}

#[test]
fn cache_only_mode_fails_absent_entries() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let config = AssetConfig {
        cache_only: true,
        ..test_config()
    };
    let fx = build(&data, &cache, false, config);
    fx.vfs
        .write("/data/a.png", b"px", VfsFlags::empty())
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    let handle = fx
        .manager
        .add_to_load_queue(group, &[image_params("/data/a.png")])
        .unwrap()[0];
    load_and_wait(&fx, group);

    assert_eq!(fx.image_bakes.load(Ordering::SeqCst), 0);
    assert_eq!(fx.manager.asset_state(handle), AssetState::LoadFailed);
    // Failed assets expose the type's failed placeholder.
    assert_eq!(&*obj_bytes(&fx, handle), b"FAILED");
    // The group still settles: failed members are terminal too.
    assert_eq!(fx.manager.group_state(group), GroupState::Loaded);
}

#[test]
fn missing_source_fails_the_asset_not_the_group() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let fx = build(&data, &cache, false, test_config());
    fx.vfs
        .write("/data/good.png", b"px", VfsFlags::empty())
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    let handles = fx
        .manager
        .add_to_load_queue(
            group,
            &[image_params("/data/good.png"), image_params("/data/gone.png")],
        )
        .unwrap();
    load_and_wait(&fx, group);

    assert_eq!(fx.manager.asset_state(handles[0]), AssetState::Loaded);
    assert_eq!(fx.manager.asset_state(handles[1]), AssetState::LoadFailed);
    assert_eq!(fx.manager.group_state(group), GroupState::Loaded);
}

#[test]
fn barrier_attached_to_a_group_load() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let fx = build(&data, &cache, false, test_config());
    fx.vfs
        .write("/data/a.png", b"px", VfsFlags::empty())
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    fx.manager
        .add_to_load_queue(group, &[image_params("/data/a.png")])
        .unwrap();

    let barrier = fx.manager.create_barrier().unwrap();
    fx.manager.attach_barrier(group, barrier).unwrap();
    fx.manager.load_group(group).unwrap();

    assert!(fx.manager.wait_barrier(barrier, Duration::from_secs(10)));
    assert_eq!(fx.manager.group_state(group), GroupState::Loaded);
    fx.manager.destroy_barrier(barrier);
}

#[test]
fn data_budget_exhaustion_fails_the_load() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let config = AssetConfig {
        data_budget_bytes: 4,
        ..test_config()
    };
    let fx = build(&data, &cache, false, config);
    fx.vfs
        .write("/data/a.png", b"px", VfsFlags::empty())
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    let handle = fx
        .manager
        .add_to_load_queue(group, &[image_params("/data/a.png")])
        .unwrap()[0];
    load_and_wait(&fx, group);

    assert_eq!(fx.manager.asset_state(handle), AssetState::LoadFailed);
    // The failed commit released its GPU objects.
    assert_eq!(fx.gpu.live_count(), 0);
}

#[test]
fn changed_source_is_redispatched_through_the_watcher() {
    let root = tempfile::tempdir().unwrap();
    let (data, cache) = scenario_dirs(root.path());
    let fx = build(&data, &cache, true, test_config());
    fx.vfs
        .write("/data/img/a.png", b"v1-pixels", VfsFlags::CREATE_DIRS)
        .unwrap();

    let group = fx.manager.create_group().unwrap();
    let handle = fx
        .manager
        .add_to_load_queue(group, &[image_params("/data/img/a.png")])
        .unwrap()[0];
    load_and_wait(&fx, group);
    assert_eq!(fx.image_bakes.load(Ordering::SeqCst), 1);
    assert_eq!(fx.gpu.live_count(), 1);

    // Give the watcher its baseline snapshot, then touch the source.
    std::thread::sleep(Duration::from_millis(1100));
    fx.vfs
        .write("/data/img/a.png", b"v2-pixels-longer", VfsFlags::empty())
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    while fx.image_bakes.load(Ordering::SeqCst) < 2 {
        fx.manager.update();
        assert!(Instant::now() < deadline, "change never re-dispatched");
        std::thread::sleep(Duration::from_millis(10));
    }

    // Let the reload job commit, then observe the swap.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        fx.manager.update();
        if fx.manager.asset_state(handle) == AssetState::Loaded && fx.gpu.live_count() == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "reload never committed");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(fx.manager.is_alive(handle), "handle must survive the reload");
}

#[test]
fn s6_remote_bake_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let server_data = root.path().join("srv-data");
    let server_cache = root.path().join("srv-cache");
    let client_cache = root.path().join("cli-cache");
    std::fs::create_dir_all(&server_data).unwrap();
    std::fs::create_dir_all(&server_cache).unwrap();
    std::fs::create_dir_all(&client_cache).unwrap();

    // Server side: local data, its own cache, a baker.
    let server_fx = build(&server_data, &server_cache, false, test_config());
    server_fx
        .vfs
        .write("/data/img/a.png", b"server-pixels", VfsFlags::CREATE_DIRS)
        .unwrap();

    // Client side: `/data` is remote, cache is local.
    let client_vfs = Vfs::new();
    client_vfs.mount_remote("data", false).unwrap();
    client_vfs.mount_local(&client_cache, "cache", false).unwrap();
    let client_gpu = Arc::new(NullGpuBackend::new());
    let client_manager = AssetManager::initialize(
        Arc::clone(&client_vfs),
        Arc::<NullGpuBackend>::clone(&client_gpu),
        test_config(),
    )
    .unwrap();
    let client_bakes = Arc::new(AtomicU32::new(0));
    client_manager
        .register_type_with(
            IMAGE_TYPE,
            "Image",
            Arc::new(ImageBaker {
                bakes: Arc::clone(&client_bakes),
            }),
            b"ASYNC".to_vec(),
            b"FAILED".to_vec(),
        )
        .unwrap();

    // Wire the bus: one registry, the server manager serving, the client
    // manager consuming.
    let bus = tokio::runtime::Runtime::new().unwrap();
    let registry = Arc::new(CommandRegistry::new());
    let endpoint = Arc::new(
        bus.block_on(RemoteServer::bind("127.0.0.1:0", Arc::clone(&registry)))
            .unwrap(),
    );
    register_bake_commands(
        &registry,
        Some((&server_fx.manager, &endpoint)),
        Some(&client_manager),
    )
    .unwrap();
    let client = bus
        .block_on(RemoteClient::connect(
            &endpoint.local_addr().to_string(),
            Arc::clone(&registry),
            Arc::new(|_, _, _| {}),
        ))
        .unwrap();
    client_manager.connect_remote(client);

    let group = client_manager.create_group().unwrap();
    let handle = client_manager
        .add_to_load_queue(group, &[image_params("/data/img/a.png")])
        .unwrap()[0];
    client_manager.load_group(group).unwrap();

    // Both schedulers live on this thread; pump them together.
    let deadline = Instant::now() + Duration::from_secs(20);
    while client_manager.group_state(group) != GroupState::Loaded {
        client_manager.update();
        server_fx.manager.update();
        assert!(Instant::now() < deadline, "remote bake never completed");
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(client_manager.asset_state(handle), AssetState::Loaded);
    assert_eq!(server_fx.image_bakes.load(Ordering::SeqCst), 1);
    assert_eq!(client_bakes.load(Ordering::SeqCst), 0, "client must not bake");
    assert_eq!(client_gpu.live_count(), 1);

    // The server's entry was persisted into the client's local cache.
    let deadline = Instant::now() + Duration::from_secs(5);
    while cache_files_under(&client_cache, "a.png_").is_empty() {
        assert!(Instant::now() < deadline, "client cache entry never written");
        std::thread::sleep(Duration::from_millis(10));
    }

    let obj = client_manager.get_obj_data(handle).map(|d| d.to_vec()).unwrap();
    assert_eq!(&obj[8..], b"RGBA8");
}
