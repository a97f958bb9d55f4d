//! Standalone bake server. Serves remote filesystem traffic (`FRD0`,
//! `FWT0`, `DMON`) and remote bake requests (`LDAS`, `CSHD`) for connected
//! clients. Type-specific bakers are linked in by embedding applications;
//! this shell registers a passthrough blob type so plain file artifacts
//! round-trip out of the box.

use std::{sync::Arc, time::Duration};

use clap::Parser;
use kiln_asset::{
    register_bake_commands, AssetBaker, AssetConfig, AssetManager, AssetParams,
    AssetRecordBuilder, NullGpuBackend,
};
use kiln_remote::{CommandRegistry, RemoteServer};
use kiln_vfs::Vfs;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(name = "kiln-bake-srv")]
#[clap(about = "Bake server: answers remote file and bake requests", version)]
struct Args {
    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1:4610")]
    listen: String,

    /// Mount specs, `alias=directory`. May repeat.
    #[clap(long)]
    mount: Vec<String>,

    /// Directory backing the `/cache` mount.
    #[clap(long, default_value = "cache")]
    cache_dir: String,

    /// Optional TOML config overriding the asset-manager defaults.
    #[clap(long)]
    config: Option<String>,

    /// Verbose logging.
    #[clap(short, long)]
    verbose: bool,
}

/// Passthrough baker: the source bytes are the object payload.
struct BlobBaker;

impl AssetBaker for BlobBaker {
    fn bake(
        &self,
        _params: &AssetParams,
        builder: &mut AssetRecordBuilder,
        source: &[u8],
    ) -> Result<(), String> {
        builder.set_obj_data(source.to_vec());
        Ok(())
    }
}

const BLOB_TYPE: u32 = u32::from_le_bytes(*b"BLOB");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = match &args.config {
        Some(path) => AssetConfig::from_toml(&std::fs::read_to_string(path)?)?,
        None => AssetConfig::default(),
    };

    let vfs = Vfs::new();
    for spec in &args.mount {
        let Some((alias, dir)) = spec.split_once('=') else {
            return Err(format!("bad mount spec '{}', expected alias=dir", spec).into());
        };
        vfs.mount_local(dir, alias, true)?;
    }
    std::fs::create_dir_all(&args.cache_dir)?;
    vfs.mount_local(&args.cache_dir, "cache", false)?;

    let manager = AssetManager::initialize(
        Arc::clone(&vfs),
        Arc::new(NullGpuBackend::new()),
        config,
    )?;
    manager.register_type_with(BLOB_TYPE, "Blob", Arc::new(BlobBaker), Vec::new(), Vec::new())?;

    // The bus needs a reactor; the manager drives its own workers, so a
    // small dedicated runtime carries the socket tasks.
    let bus = tokio::runtime::Runtime::new()?;
    let registry = Arc::new(CommandRegistry::new());
    let endpoint = Arc::new(bus.block_on(RemoteServer::bind(&args.listen, Arc::clone(&registry)))?);

    kiln_vfs::register_commands(&registry, Some((&vfs, &endpoint)), None)?;
    register_bake_commands(&registry, Some((&manager, &endpoint)), None)?;

    info!("bake server ready on {}", endpoint.local_addr());
    loop {
        manager.update();
        std::thread::sleep(Duration::from_millis(5));
    }
}
