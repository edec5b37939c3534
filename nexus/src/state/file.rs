//! Durable JSON-file document store.
//!
//! Each document lives at `<root>/<collection>/<id>.json`. Writes go to a
//! temporary sibling first and are renamed into place.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::document::{document_not_found, matches_all, merge_patch, DocumentStore, Filter};
use crate::errors::NexusError;

/// Document store backed by a directory of JSON files.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

fn invalid_key(key: &str) -> NexusError {
    NexusError::critical(
        "STORE_INVALID_KEY",
        format!("Invalid document key '{key}'"),
        "state-store",
    )
}

fn validate_segment(segment: &str) -> Result<(), NexusError> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0']);
    if bad {
        Err(invalid_key(segment))
    } else {
        Ok(())
    }
}

impl FileDocumentStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, NexusError> {
        let mut dir = self.root.clone();
        for segment in collection.split('/') {
            validate_segment(segment)?;
            dir.push(segment);
        }
        Ok(dir)
    }

    fn document_path(&self, collection: &str, id: &str) -> Result<PathBuf, NexusError> {
        validate_segment(id)?;
        Ok(self.collection_dir(collection)?.join(format!("{id}.json")))
    }

    async fn read(path: &Path) -> Result<Option<Value>, NexusError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(path: &Path, document: &Value) -> Result<(), NexusError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(document)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, NexusError> {
        Self::read(&self.document_path(collection, id)?).await
    }

    async fn set(&self, collection: &str, id: &str, document: Value) -> Result<(), NexusError> {
        Self::write(&self.document_path(collection, id)?, &document).await
    }

    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<(), NexusError> {
        let path = self.document_path(collection, id)?;
        let mut document = Self::read(&path)
            .await?
            .ok_or_else(|| document_not_found(collection, id))?;
        merge_patch(collection, id, &mut document, patch)?;
        Self::write(&path, &document).await
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<(String, Value)>, NexusError> {
        let dir = self.collection_dir(collection)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut hits = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if let Some(document) = Self::read(&path).await? {
                if matches_all(filters, &document) {
                    hits.push((id, document));
                }
            }
        }
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hits)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), NexusError> {
        match tokio::fs::remove_file(self.document_path(collection, id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_documents_survive_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path());
        store
            .set("pipelines/2026-01-22/outputs", "tts", json!({"success": true}))
            .await
            .unwrap();

        let reopened = FileDocumentStore::new(dir.path());
        assert_eq!(
            reopened.get("pipelines/2026-01-22/outputs", "tts").await.unwrap(),
            Some(json!({"success": true}))
        );
        assert!(dir.path().join("pipelines/2026-01-22/outputs/tts.json").exists());
    }

    #[tokio::test]
    async fn test_update_query_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path());
        store.set("incidents", "2026-01-22-001", json!({"date": "2026-01-22"})).await.unwrap();
        store.set("incidents", "2026-01-23-001", json!({"date": "2026-01-23"})).await.unwrap();

        let mut patch = Map::new();
        patch.insert("isOpen".to_string(), json!(false));
        store.update("incidents", "2026-01-22-001", patch).await.unwrap();

        let hits = store.query("incidents", &[Filter::eq("date", "2026-01-22")]).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1["isOpen"], false);

        store.delete("incidents", "2026-01-22-001").await.unwrap();
        store.delete("incidents", "2026-01-22-001").await.unwrap();
        assert!(store.query("missing-collection", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path());
        let err = store.get("pipelines", "../etc").await.unwrap_err();
        assert_eq!(err.code, "STORE_INVALID_KEY");
        let err = store.set("../x", "a", json!({})).await.unwrap_err();
        assert_eq!(err.code, "STORE_INVALID_KEY");
    }
}
