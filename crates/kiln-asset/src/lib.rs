//! Asset pipeline core: declarative requests for content artifacts are
//! resolved to in-memory ready-to-use records, backed by an on-disk cache
//! of pre-baked blobs and, optionally, a remote bake server.
//!
//! The manager ties four pieces together:
//!
//! * a **database** of generational handles keyed by a params-hash, with
//!   reference counting and a byte budget for committed records;
//! * a **cache store** addressing baked blobs by a content-sensitive asset
//!   hash, with a persistent params-hash → asset-hash lookup;
//! * a **group scheduler** batching loads and unloads, one job in flight at
//!   a time, driven from the main thread via [`AssetManager::update`];
//! * the **load pipeline** fanning bake work out across a worker runtime
//!   and publishing relocatable [`AssetRecord`]s.
//!
//! Per-type bakers plug in through [`AssetBaker`]; the graphics device
//! plugs in through [`GpuBackend`].

// crate-specific lint exceptions:
#![allow(unsafe_code)]
#![warn(missing_docs)]

mod baker;
mod cache;
mod database;
mod error;
mod gpu;
mod group;
mod handle;
mod manager;
mod meta;
mod params;
mod pipeline;
mod record;
mod remote;
mod scheduler;
mod server;
mod types;

pub use baker::{AssetBaker, AssetRecordBuilder, DependencyParams, MetaValue};
pub use cache::{
    decode_entry, encode_entry, encode_entry_header, CacheStore, CACHE_FILE_ID, CACHE_VERSION,
};
pub use database::{AssetDatabase, AssetHandle, AssetInfo, AssetState, ObjDataGuard};
pub use error::AssetError;
pub use gpu::{GpuBackend, NullGpuBackend};
pub use group::{BarrierHandle, GroupHandle, GroupState};
pub use handle::{Handle, HandlePool, MAX_POOL_CAPACITY};
pub use manager::{AssetConfig, AssetManager, BarrierScope, BudgetStats, ObjData};
pub use meta::{load_meta, meta_path, parse_meta};
pub use params::{AssetParams, AssetPlatform};
pub use record::{
    AssetRecord, DependencySlot, GpuBufferDesc, GpuObjectDesc, GpuObjectSlot, GpuTextureDesc,
    NO_BACK_REF,
};
pub use remote::register_bake_commands;
pub use types::{AssetTypeDesc, TypeRegistry};
