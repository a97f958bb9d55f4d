use std::{collections::HashMap, sync::Arc};

use crate::{baker::AssetBaker, AssetError};

/// Everything the pipeline needs to know about one asset type.
#[derive(Clone)]
pub struct AssetTypeDesc {
    /// Type id (FourCC).
    pub type_id: u32,
    /// Human name; also the cache file extension.
    pub name: String,
    /// The baker implementation.
    pub baker: Arc<dyn AssetBaker>,
    /// Object payload handed out while the asset is still loading.
    pub async_obj: Arc<Vec<u8>>,
    /// Object payload handed out when the load failed.
    pub failed_obj: Arc<Vec<u8>>,
}

struct TypeSlot {
    desc: AssetTypeDesc,
    tombstoned: bool,
}

/// Insertion-ordered table of type descriptors. Unregistering tombstones a
/// slot so in-flight loads drain cleanly; slots are never reused.
#[derive(Default)]
pub struct TypeRegistry {
    slots: Vec<TypeSlot>,
    index: HashMap<u32, usize>,
}

impl TypeRegistry {
    /// Registers a type. Duplicate id or name is an error.
    pub fn register(&mut self, desc: AssetTypeDesc) -> Result<(), AssetError> {
        if self.index.contains_key(&desc.type_id)
            || self.slots.iter().any(|slot| slot.desc.name == desc.name)
        {
            return Err(AssetError::TypeAlreadyRegistered(desc.name));
        }
        self.index.insert(desc.type_id, self.slots.len());
        self.slots.push(TypeSlot {
            desc,
            tombstoned: false,
        });
        Ok(())
    }

    /// Tombstones a type. In-flight loads against it still drain but skip
    /// resource creation and release.
    pub fn unregister(&mut self, type_id: u32) {
        if let Some(&slot) = self.index.get(&type_id) {
            self.slots[slot].tombstoned = true;
        }
    }

    /// The descriptor of a live (non-tombstoned) type.
    pub fn get(&self, type_id: u32) -> Option<&AssetTypeDesc> {
        let slot = &self.slots[*self.index.get(&type_id)?];
        (!slot.tombstoned).then_some(&slot.desc)
    }

    /// The descriptor regardless of tombstoning, plus the tombstone flag;
    /// what draining loads use.
    pub fn get_any(&self, type_id: u32) -> Option<(&AssetTypeDesc, bool)> {
        let slot = &self.slots[*self.index.get(&type_id)?];
        Some((&slot.desc, slot.tombstoned))
    }

    /// Number of registered slots, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing was ever registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
