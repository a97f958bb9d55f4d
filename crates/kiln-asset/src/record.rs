//! The relocatable asset record: the persistent form of a baked asset.
//!
//! The baker's output is a flat `obj_data` byte buffer plus index-based side
//! tables, so the whole record can be written to disk or network verbatim.
//! References *into* `obj_data` are byte offsets; after a load they are
//! overwritten with the resolved dependency handle (`u32`, little-endian) or
//! the created GPU object id (`u64`, little-endian).

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::{params::AssetPlatform, AssetError};

/// Offset value marking a slot with no back-reference into `obj_data`.
pub const NO_BACK_REF: u32 = u32::MAX;

/// A dependency another asset must be loaded for. `obj_offset` locates the
/// `u32` inside `obj_data` that receives the resolved handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySlot {
    /// Virtual source path of the dependency.
    pub path: String,
    /// Asset type id of the dependency.
    pub type_id: u32,
    /// Target platform of the dependency.
    pub platform: AssetPlatform,
    /// Type-specific parameter blob of the dependency.
    pub extra: Vec<u8>,
    /// Patch location inside `obj_data`, or [`NO_BACK_REF`].
    pub obj_offset: u32,
}

/// Creation parameters of a GPU buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuBufferDesc {
    /// Size of the buffer in bytes.
    pub size: u64,
    /// Backend-defined usage bits.
    pub usage: u32,
}

/// Creation parameters of a GPU texture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuTextureDesc {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Backend-defined pixel format name (e.g. `BC7_SRGB`).
    pub format: String,
    /// Number of mip levels.
    pub mip_count: u32,
}

/// Variant descriptor of one queued GPU object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GpuObjectDesc {
    /// A buffer.
    Buffer(GpuBufferDesc),
    /// A texture.
    Texture(GpuTextureDesc),
}

/// One queued GPU object: descriptor, content bytes, and the patch location
/// of the created object id (`u64`) inside `obj_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuObjectSlot {
    /// What to create.
    pub desc: GpuObjectDesc,
    /// Initial content uploaded at creation.
    pub content: Vec<u8>,
    /// Patch location inside `obj_data`, or [`NO_BACK_REF`].
    pub obj_offset: u32,
}

/// The self-contained, address-independent record a baker produces. This is
/// exactly what the cache body stores.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssetRecord {
    /// The user-visible object, opaque to the pipeline.
    pub obj_data: Vec<u8>,
    /// Assets this record needs loaded.
    pub dependencies: Vec<DependencySlot>,
    /// GPU objects to instantiate on load.
    pub gpu_objects: Vec<GpuObjectSlot>,
    /// Flat key/value pairs from the meta sidecar.
    pub meta: Vec<(String, String)>,
}

fn codec() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .allow_trailing_bytes()
        .with_fixint_encoding()
        .with_little_endian()
}

impl AssetRecord {
    /// Serializes the record into its persistent byte form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AssetError> {
        codec()
            .serialize(self)
            .map_err(|err| AssetError::Serialization(err.to_string()))
    }

    /// Rebuilds a record from its persistent byte form and validates that
    /// every recorded offset stays inside `obj_data`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AssetError> {
        let record: Self = codec()
            .deserialize(bytes)
            .map_err(|err| AssetError::Serialization(err.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    /// A baker may legitimately produce nothing: that signals the cache is
    /// already up to date.
    pub fn is_empty(&self) -> bool {
        self.obj_data.is_empty() && self.dependencies.is_empty() && self.gpu_objects.is_empty()
    }

    /// Size of the user-visible object payload.
    pub fn data_size(&self) -> u32 {
        self.obj_data.len() as u32
    }

    fn check_offset(&self, offset: u32, width: usize) -> Result<(), AssetError> {
        if offset == NO_BACK_REF {
            return Ok(());
        }
        let end = offset as usize + width;
        if end > self.obj_data.len() {
            return Err(AssetError::Serialization(format!(
                "back-reference at {} overruns obj_data ({} bytes)",
                offset,
                self.obj_data.len()
            )));
        }
        Ok(())
    }

    /// No reference may point outside `obj_data`: the record must stay
    /// self-contained.
    pub fn validate(&self) -> Result<(), AssetError> {
        for dep in &self.dependencies {
            self.check_offset(dep.obj_offset, 4)?;
        }
        for gpu in &self.gpu_objects {
            self.check_offset(gpu.obj_offset, 8)?;
        }
        Ok(())
    }

    /// Writes the resolved handle of dependency `slot` through its
    /// back-reference.
    pub fn patch_dependency(&mut self, slot: usize, handle_raw: u32) -> Result<(), AssetError> {
        let offset = self.dependencies[slot].obj_offset;
        self.check_offset(offset, 4)?;
        if offset != NO_BACK_REF {
            let at = offset as usize;
            self.obj_data[at..at + 4].copy_from_slice(&handle_raw.to_le_bytes());
        }
        Ok(())
    }

    /// Writes the created GPU object id of slot `slot` through its
    /// back-reference.
    pub fn patch_gpu_object(&mut self, slot: usize, gpu_id: u64) -> Result<(), AssetError> {
        let offset = self.gpu_objects[slot].obj_offset;
        self.check_offset(offset, 8)?;
        if offset != NO_BACK_REF {
            let at = offset as usize;
            self.obj_data[at..at + 8].copy_from_slice(&gpu_id.to_le_bytes());
        }
        Ok(())
    }

    /// Reads a handle previously patched at `offset`; how loaded objects
    /// resolve the dependencies written into them.
    pub fn read_handle_at(&self, offset: u32) -> Option<u32> {
        let at = offset as usize;
        let bytes = self.obj_data.get(at..at + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AssetRecord {
        AssetRecord {
            obj_data: vec![0; 16],
            dependencies: vec![DependencySlot {
                path: "/data/tex.png".to_owned(),
                type_id: 42,
                platform: AssetPlatform::Pc,
                extra: vec![],
                obj_offset: 4,
            }],
            gpu_objects: vec![GpuObjectSlot {
                desc: GpuObjectDesc::Buffer(GpuBufferDesc { size: 64, usage: 1 }),
                content: vec![1, 2, 3],
                obj_offset: 8,
            }],
            meta: vec![("format".to_owned(), "BC7".to_owned())],
        }
    }

    #[test]
    fn byte_round_trip_is_identical() {
        let record = sample();
        let bytes = record.to_bytes().unwrap();
        let back = AssetRecord::from_bytes(&bytes).unwrap();
        assert_eq!(back, record);
        // Serializing the reloaded record reproduces the bytes exactly.
        assert_eq!(back.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn patching_writes_through_back_references() {
        let mut record = sample();
        record.patch_dependency(0, 0xAABBCCDD).unwrap();
        assert_eq!(record.read_handle_at(4), Some(0xAABBCCDD));

        record.patch_gpu_object(0, 0x1122334455667788).unwrap();
        assert_eq!(
            record.obj_data[8..16],
            0x1122334455667788_u64.to_le_bytes()
        );
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let mut record = sample();
        record.dependencies[0].obj_offset = 14; // 14 + 4 > 16
        assert!(record.validate().is_err());
        assert!(record.patch_dependency(0, 1).is_err());
    }

    #[test]
    fn no_back_ref_slots_are_legal() {
        let mut record = sample();
        record.dependencies[0].obj_offset = NO_BACK_REF;
        record.validate().unwrap();
        record.patch_dependency(0, 7).unwrap();
        // obj_data untouched.
        assert_eq!(record.obj_data, vec![0; 16]);
    }
}
