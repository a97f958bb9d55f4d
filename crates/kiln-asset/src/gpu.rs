//! Seam to the graphics device. The pipeline only ever creates and destroys
//! objects described by baked records; everything else about the device is
//! someone else's concern.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use crate::record::{GpuBufferDesc, GpuTextureDesc};

/// Graphics-backend contract. Implementations must be thread-safe; the
/// pipeline creates objects in parallel across a batch.
pub trait GpuBackend: Send + Sync {
    /// Creates a buffer with initial `content`, returning its opaque id.
    fn create_buffer(&self, desc: &GpuBufferDesc, content: &[u8]) -> Result<u64, String>;

    /// Creates a texture with initial `content`, returning its opaque id.
    fn create_texture(&self, desc: &GpuTextureDesc, content: &[u8]) -> Result<u64, String>;

    /// Destroys a previously created object.
    fn destroy(&self, id: u64);
}

/// Backend that mints ids without touching a device. Used by the bake
/// server and by tests; tracks liveness so leaks are observable.
#[derive(Default)]
pub struct NullGpuBackend {
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl NullGpuBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Number of objects created and not yet destroyed.
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn mint(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().unwrap().insert(id);
        id
    }
}

impl GpuBackend for NullGpuBackend {
    fn create_buffer(&self, _desc: &GpuBufferDesc, _content: &[u8]) -> Result<u64, String> {
        Ok(self.mint())
    }

    fn create_texture(&self, _desc: &GpuTextureDesc, _content: &[u8]) -> Result<u64, String> {
        Ok(self.mint())
    }

    fn destroy(&self, id: u64) {
        self.live.lock().unwrap().remove(&id);
    }
}
