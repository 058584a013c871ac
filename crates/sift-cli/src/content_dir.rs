//! A directory of text files used as the content store.
//!
//! Every regular file under the root is one entity of a fixed type. Its id
//! is the path relative to the root with `/` separators, and its content
//! hash is the blake3 hash of the text. Hidden files and directories are
//! skipped.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use async_walkdir::WalkDir;
use futures::StreamExt;
use sift_core::{Content, ContentSource, EntityKey, EntityType, Error, Result};
use sift_search::{KeywordIndex, KeywordQuery};
use tracing::debug;

/// Files under `root`, all of one entity type.
#[derive(Debug, Clone)]
pub struct DirectoryContentSource {
    root: PathBuf,
    entity_type: EntityType,
}

impl DirectoryContentSource {
    /// Create a source over `root`.
    pub fn new(root: impl Into<PathBuf>, entity_type: EntityType) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::config(format!(
                "content directory does not exist: {}",
                root.display()
            )));
        }
        Ok(Self { root, entity_type })
    }

    /// The directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, entity_id: &str) -> Result<PathBuf> {
        let relative = Path::new(entity_id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if entity_id.is_empty() || escapes {
            return Err(Error::validation(format!(
                "entity id is not a relative path inside the content directory: '{entity_id}'"
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn files(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut walker = WalkDir::new(&self.root);

        while let Some(entry) = walker.next().await {
            let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            if is_hidden(relative) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            ids.push(id);
        }

        ids.sort();
        Ok(ids)
    }
}

fn is_hidden(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}

#[async_trait]
impl ContentSource for DirectoryContentSource {
    async fn get_content(&self, key: &EntityKey) -> Result<Option<Content>> {
        if key.entity_type != self.entity_type {
            return Ok(None);
        }
        let path = self.resolve(&key.entity_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(Content::new(text))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<EntityKey>> {
        if entity_type != self.entity_type {
            return Ok(Vec::new());
        }
        let keys: Vec<EntityKey> = self
            .files()
            .await?
            .into_iter()
            .map(|id| EntityKey::new(entity_type, id))
            .collect();
        debug!(root = %self.root.display(), count = keys.len(), "Listed content directory");
        Ok(keys)
    }
}

/// Ranks files by how often the query's terms occur in them. Enough to
/// exercise hybrid search from the command line.
#[async_trait]
impl KeywordIndex for DirectoryContentSource {
    async fn keyword_search(&self, query: &KeywordQuery<'_>) -> Result<Vec<EntityKey>> {
        if query.entity_type.is_some_and(|t| t != self.entity_type) {
            return Ok(Vec::new());
        }
        let terms: Vec<String> = query
            .text
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, String)> = Vec::new();
        for id in self.files().await? {
            let Ok(text) = tokio::fs::read_to_string(self.root.join(&id)).await else {
                continue;
            };
            let text = text.to_lowercase();
            let score: usize = terms.iter().map(|t| text.matches(t.as_str()).count()).sum();
            if score > 0 {
                scored.push((score, id));
            }
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(query.limit);
        Ok(scored
            .into_iter()
            .map(|(_, id)| EntityKey::new(self.entity_type, id))
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sift_core::hash_content;

    fn fixture() -> (tempfile::TempDir, DirectoryContentSource) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("guide")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("intro.md"), "Ownership and borrowing.").unwrap();
        std::fs::write(
            dir.path().join("guide/traits.md"),
            "Traits, traits everywhere. Borrowing too.",
        )
        .unwrap();
        std::fs::write(dir.path().join(".hidden"), "secret").unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        let source = DirectoryContentSource::new(dir.path(), EntityType::Documentation).unwrap();
        (dir, source)
    }

    fn doc(id: &str) -> EntityKey {
        EntityKey::new(EntityType::Documentation, id)
    }

    #[tokio::test]
    async fn test_list_entities() {
        let (_dir, source) = fixture();
        let keys = source.list_entities(EntityType::Documentation).await.unwrap();
        assert_eq!(keys, vec![doc("guide/traits.md"), doc("intro.md")]);
        assert!(
            source
                .list_entities(EntityType::Flavor)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_get_content() {
        let (_dir, source) = fixture();
        let content = source.get_content(&doc("intro.md")).await.unwrap().unwrap();
        assert_eq!(content.text, "Ownership and borrowing.");
        assert_eq!(content.content_hash, hash_content("Ownership and borrowing."));

        assert!(source.get_content(&doc("missing.md")).await.unwrap().is_none());
        let other = EntityKey::new(EntityType::Project, "intro.md");
        assert!(source.get_content(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_escaping_ids() {
        let (_dir, source) = fixture();
        assert!(source.get_content(&doc("../etc/passwd")).await.is_err());
        assert!(source.get_content(&doc("/etc/passwd")).await.is_err());
    }

    #[tokio::test]
    async fn test_keyword_ranking() {
        let (_dir, source) = fixture();
        let query = KeywordQuery {
            text: "Traits borrowing",
            limit: 10,
            entity_type: None,
        };
        let keys = source.keyword_search(&query).await.unwrap();
        assert_eq!(keys, vec![doc("guide/traits.md"), doc("intro.md")]);

        let query = KeywordQuery {
            text: "ownership",
            limit: 10,
            entity_type: Some(EntityType::Documentation),
        };
        assert_eq!(source.keyword_search(&query).await.unwrap(), vec![doc("intro.md")]);
    }

    #[test]
    fn test_missing_directory() {
        assert!(DirectoryContentSource::new("/definitely/not/here", EntityType::Documentation).is_err());
    }
}
