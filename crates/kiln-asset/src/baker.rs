//! The contract between the pipeline and per-type bakers.
//!
//! A baker turns source bytes plus meta key/values into an [`AssetRecord`]
//! through the builder; everything it hands the builder is addressed with
//! offsets into the object payload so the result stays relocatable.

use crate::{
    params::{AssetParams, AssetPlatform},
    record::{
        AssetRecord, DependencySlot, GpuBufferDesc, GpuObjectDesc, GpuObjectSlot, GpuTextureDesc,
    },
};

/// Parameters identifying one dependency a baker emits.
#[derive(Debug, Clone)]
pub struct DependencyParams {
    /// Virtual source path.
    pub path: String,
    /// Asset type id.
    pub type_id: u32,
    /// Target platform.
    pub platform: AssetPlatform,
    /// Type-specific parameter blob.
    pub extra: Vec<u8>,
}

/// Values parseable out of meta strings.
pub trait MetaValue: Sized {
    /// Parses the string form; `None` falls back to the default.
    fn parse_meta(value: &str) -> Option<Self>;
}

impl MetaValue for String {
    fn parse_meta(value: &str) -> Option<Self> {
        Some(value.to_owned())
    }
}

impl MetaValue for bool {
    fn parse_meta(value: &str) -> Option<Self> {
        match value {
            "true" | "True" | "1" => Some(true),
            "false" | "False" | "0" => Some(false),
            _ => None,
        }
    }
}

impl MetaValue for u32 {
    fn parse_meta(value: &str) -> Option<Self> {
        value.parse().ok()
    }
}

impl MetaValue for f32 {
    fn parse_meta(value: &str) -> Option<Self> {
        value.parse().ok()
    }
}

/// Builder a baker populates during [`AssetBaker::bake`].
pub struct AssetRecordBuilder {
    record: AssetRecord,
}

impl AssetRecordBuilder {
    pub(crate) fn new(meta: Vec<(String, String)>) -> Self {
        Self {
            record: AssetRecord {
                meta,
                ..AssetRecord::default()
            },
        }
    }

    /// Sets the user-visible object payload.
    pub fn set_obj_data(&mut self, bytes: Vec<u8>) {
        self.record.obj_data = bytes;
    }

    /// Queues a dependency. `obj_offset` locates the `u32` inside the
    /// object payload that receives the resolved handle (or
    /// [`crate::record::NO_BACK_REF`]).
    pub fn add_dependency(&mut self, obj_offset: u32, params: DependencyParams) {
        self.record.dependencies.push(DependencySlot {
            path: params.path,
            type_id: params.type_id,
            platform: params.platform,
            extra: params.extra,
            obj_offset,
        });
    }

    /// Queues a GPU buffer. `obj_offset` locates the `u64` receiving the
    /// created object id.
    pub fn add_gpu_buffer_object(&mut self, obj_offset: u32, desc: GpuBufferDesc, content: Vec<u8>) {
        self.record.gpu_objects.push(GpuObjectSlot {
            desc: GpuObjectDesc::Buffer(desc),
            content,
            obj_offset,
        });
    }

    /// Queues a GPU texture. `obj_offset` locates the `u64` receiving the
    /// created object id.
    pub fn add_gpu_texture_object(
        &mut self,
        obj_offset: u32,
        desc: GpuTextureDesc,
        content: Vec<u8>,
    ) {
        self.record.gpu_objects.push(GpuObjectSlot {
            desc: GpuObjectDesc::Texture(desc),
            content,
            obj_offset,
        });
    }

    /// Looks a key up in the meta sidecar pairs, falling back to `default`
    /// when absent or unparseable.
    pub fn get_meta_value<T: MetaValue>(&self, key: &str, default: T) -> T {
        self.record
            .meta
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| T::parse_meta(v))
            .unwrap_or(default)
    }

    pub(crate) fn finish(self) -> AssetRecord {
        self.record
    }
}

/// Per-type baker. Implementations parse source bytes and emit a
/// relocatable record; the pipeline owns everything around that (cache,
/// dependencies, GPU objects, publication).
pub trait AssetBaker: Send + Sync {
    /// Bakes `source` into the builder. Leaving the builder empty without
    /// an error signals that the existing cache entry is up to date.
    fn bake(
        &self,
        params: &AssetParams,
        builder: &mut AssetRecordBuilder,
        source: &[u8],
    ) -> Result<(), String>;

    /// Consulted on a hot reload with the freshly baked and the previous
    /// object payload. Returning `false` keeps the old data.
    fn reload(&self, _new_obj: &[u8], _old_obj: &[u8]) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_lookup_with_defaults() {
        let builder = AssetRecordBuilder::new(vec![
            ("format".to_owned(), "BC7".to_owned()),
            ("sRGB".to_owned(), "true".to_owned()),
            ("mips".to_owned(), "9".to_owned()),
        ]);

        assert_eq!(builder.get_meta_value("format", String::new()), "BC7");
        assert!(builder.get_meta_value("sRGB", false));
        assert_eq!(builder.get_meta_value("mips", 1_u32), 9);
        assert_eq!(builder.get_meta_value("scale", 1.5_f32), 1.5);
    }

    #[test]
    fn builder_collects_slots_in_order() {
        let mut builder = AssetRecordBuilder::new(Vec::new());
        builder.set_obj_data(vec![0; 32]);
        builder.add_dependency(
            0,
            DependencyParams {
                path: "/data/a.png".to_owned(),
                type_id: 1,
                platform: AssetPlatform::Pc,
                extra: vec![],
            },
        );
        builder.add_gpu_buffer_object(8, GpuBufferDesc { size: 16, usage: 0 }, vec![0; 16]);

        let record = builder.finish();
        assert_eq!(record.dependencies.len(), 1);
        assert_eq!(record.gpu_objects.len(), 1);
        record.validate().unwrap();
    }
}
