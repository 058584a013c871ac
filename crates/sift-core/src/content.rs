//! The seam to the external content store.
//!
//! Sift never decides what content exists. It asks a [`ContentSource`] for
//! the current text of an entity when a job runs, and for the list of
//! entities when a corpus-wide pass is requested.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{Content, EntityKey, EntityType};

/// Read access to the content store that owns entities.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Current text of an entity, or `None` when the entity no longer exists.
    async fn get_content(&self, key: &EntityKey) -> Result<Option<Content>>;

    /// Every entity of the given type.
    async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<EntityKey>>;
}

/// In-memory content source.
///
/// Used by tests and by embedders that already hold their corpus in memory.
#[derive(Debug, Default)]
pub struct MemoryContentSource {
    entries: RwLock<BTreeMap<EntityKey, Content>>,
}

impl MemoryContentSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity's text. Returns the new content hash.
    pub fn put(&self, key: EntityKey, text: impl Into<String>) -> Result<String> {
        key.validate()?;
        let content = Content::new(text);
        let hash = content.content_hash.clone();
        self.write()?.insert(key, content);
        Ok(hash)
    }

    /// Remove an entity. Returns whether it existed.
    pub fn remove(&self, key: &EntityKey) -> Result<bool> {
        Ok(self.write()?.remove(key).is_some())
    }

    /// Number of entities held.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the source is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<EntityKey, Content>>> {
        self.entries
            .write()
            .map_err(|_| Error::store("content source lock poisoned"))
    }
}

#[async_trait]
impl ContentSource for MemoryContentSource {
    async fn get_content(&self, key: &EntityKey) -> Result<Option<Content>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::store("content source lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<EntityKey>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::store("content source lock poisoned"))?;
        Ok(entries
            .keys()
            .filter(|k| k.entity_type == entity_type)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_roundtrip() {
        let source = MemoryContentSource::new();
        let key = EntityKey::new(EntityType::Documentation, "intro");
        let hash = source.put(key.clone(), "Hello world.").unwrap();

        let content = source.get_content(&key).await.unwrap().unwrap();
        assert_eq!(content.text, "Hello world.");
        assert_eq!(content.content_hash, hash);

        assert!(source.remove(&key).unwrap());
        assert!(source.get_content(&key).await.unwrap().is_none());
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_memory_source_list_filters_by_type() {
        let source = MemoryContentSource::new();
        source
            .put(EntityKey::new(EntityType::Documentation, "a"), "a")
            .unwrap();
        source
            .put(EntityKey::new(EntityType::Flavor, "b"), "b")
            .unwrap();

        let docs = source.list_entities(EntityType::Documentation).await.unwrap();
        assert_eq!(docs, vec![EntityKey::new(EntityType::Documentation, "a")]);
    }

    #[test]
    fn test_memory_source_rejects_invalid_key() {
        let source = MemoryContentSource::new();
        assert!(source.put(EntityKey::new(EntityType::Flavor, ""), "x").is_err());
    }

    #[test]
    fn test_content_source_object_safe() {
        fn _assert_object_safe(_: &dyn ContentSource) {}
    }
}
