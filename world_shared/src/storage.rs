//! Entity storage collaborator.
//!
//! Persisted layout is `(type name, entity id) -> attribute tree`. The on-disk
//! format belongs to the backend; [`MemoryStorage`] keeps everything in a map
//! and counts round-trips so callers can assert how often it was hit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::{WorldError, WorldResult},
    id::EntityId,
    math::Vec3,
    value::{Attrs, Value},
};

/// Full serialized state of an entity, as moved during migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub type_name: String,
    pub id: EntityId,
    pub position: Vec3,
    pub attrs: Attrs,
}

impl EntitySnapshot {
    pub fn validate(&self) -> WorldResult<()> {
        self.attrs.values().try_for_each(Value::validate)
    }
}

/// Durable entity store.
#[async_trait]
pub trait EntityStorage: Send + Sync {
    async fn list_entity_ids(&self, type_name: &str) -> WorldResult<Vec<EntityId>>;

    async fn exists(&self, type_name: &str, id: EntityId) -> WorldResult<bool>;

    /// Returns `None` when nothing is stored for `(type_name, id)`.
    async fn load(&self, type_name: &str, id: EntityId) -> WorldResult<Option<Attrs>>;

    async fn save(&self, type_name: &str, id: EntityId, attrs: &Attrs) -> WorldResult<()>;
}

/// In-memory storage shared by the games of a local cluster.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<BTreeMap<(String, EntityId), Attrs>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

fn poisoned() -> WorldError {
    WorldError::Storage("storage lock poisoned".into())
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of `save` calls served so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Seeds a record without counting it as a save.
    pub fn insert(&self, type_name: &str, id: EntityId, attrs: Attrs) {
        if let Ok(mut records) = self.records.write() {
            records.insert((type_name.to_string(), id), attrs);
        }
    }

    pub fn get(&self, type_name: &str, id: EntityId) -> Option<Attrs> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(&(type_name.to_string(), id)).cloned())
    }
}

#[async_trait]
impl EntityStorage for MemoryStorage {
    async fn list_entity_ids(&self, type_name: &str) -> WorldResult<Vec<EntityId>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .keys()
            .filter(|(t, _)| t == type_name)
            .map(|(_, id)| *id)
            .collect())
    }

    async fn exists(&self, type_name: &str, id: EntityId) -> WorldResult<bool> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.contains_key(&(type_name.to_string(), id)))
    }

    async fn load(&self, type_name: &str, id: EntityId) -> WorldResult<Option<Attrs>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(&(type_name.to_string(), id)).cloned())
    }

    async fn save(&self, type_name: &str, id: EntityId, attrs: &Attrs) -> WorldResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert((type_name.to_string(), id), attrs.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{GameId, IdAllocator};

    #[tokio::test]
    async fn save_then_load() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let id = IdAllocator::new(GameId(1)).mint();
        let mut attrs = Attrs::new();
        attrs.insert("gold".into(), Value::Int(30));

        assert!(!storage.exists("Avatar", id).await?);
        storage.save("Avatar", id, &attrs).await?;
        assert!(storage.exists("Avatar", id).await?);
        assert_eq!(storage.load("Avatar", id).await?, Some(attrs));
        assert_eq!(storage.load("Monster", id).await?, None);
        assert_eq!(storage.list_entity_ids("Avatar").await?, vec![id]);
        assert_eq!(storage.load_count(), 2);
        Ok(())
    }
}
