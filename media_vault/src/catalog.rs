//! Media Vault - Catalog Boundary
//!
//! The item catalog (albums, ordering, metadata) lives outside the engine.
//! The engine only asks it which item uuids exist.

use std::collections::BTreeSet;

use parking_lot::RwLock;
use uuid::Uuid;

/// Source of the item uuids the vault should hold blobs for
pub trait Catalog: Send + Sync {
    fn all_item_uuids(&self) -> Vec<Uuid>;
}

/// Catalog kept in memory
#[derive(Default)]
pub struct MemoryCatalog {
    items: RwLock<BTreeSet<Uuid>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uuid: Uuid) -> bool {
        self.items.write().insert(uuid)
    }

    pub fn remove(&self, uuid: &Uuid) -> bool {
        self.items.write().remove(uuid)
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl FromIterator<Uuid> for MemoryCatalog {
    fn from_iter<I: IntoIterator<Item = Uuid>>(iter: I) -> Self {
        Self {
            items: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl Catalog for MemoryCatalog {
    fn all_item_uuids(&self) -> Vec<Uuid> {
        self.items.read().iter().copied().collect()
    }
}
