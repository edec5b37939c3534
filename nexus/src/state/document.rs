//! Document store abstraction.
//!
//! Persistence for pipeline state, stage outputs, review items, incidents
//! and quality decisions all goes through [`DocumentStore`]: JSON documents
//! grouped into collections, addressed by id, with simple field filters.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use crate::errors::NexusError;

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
}

/// A filter on a top-level document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field name.
    pub field: String,
    /// Comparison.
    pub op: FilterOp,
    /// Value compared against.
    pub value: Value,
}

impl Filter {
    /// Creates a filter.
    #[must_use]
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Equality filter.
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Returns true if `document` satisfies the filter.
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        let Some(actual) = document.get(&self.field) else {
            return false;
        };

        if self.op == FilterOp::Eq {
            return actual == &self.value;
        }

        let ordering = match (actual, &self.value) {
            (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        };

        match ordering {
            Some(ord) => match self.op {
                FilterOp::Lt => ord == Ordering::Less,
                FilterOp::Lte => ord != Ordering::Greater,
                FilterOp::Gt => ord == Ordering::Greater,
                FilterOp::Gte => ord != Ordering::Less,
                FilterOp::Eq => ord == Ordering::Equal,
            },
            None => false,
        }
    }
}

/// Returns true if `document` satisfies every filter.
#[must_use]
pub fn matches_all(filters: &[Filter], document: &Value) -> bool {
    filters.iter().all(|f| f.matches(document))
}

/// Protocol for document persistence backends.
#[async_trait]
pub trait DocumentStore: Send + Sync + Debug {
    /// Reads a document.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, NexusError>;

    /// Creates or replaces a document.
    async fn set(&self, collection: &str, id: &str, document: Value) -> Result<(), NexusError>;

    /// Merges top-level fields into an existing document.
    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<(), NexusError>;

    /// Returns `(id, document)` pairs matching every filter, ordered by id.
    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<(String, Value)>, NexusError>;

    /// Deletes a document; deleting a missing document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), NexusError>;
}

pub(crate) fn document_not_found(collection: &str, id: &str) -> NexusError {
    NexusError::critical(
        "STORE_DOCUMENT_NOT_FOUND",
        format!("Document '{id}' not found in '{collection}'"),
        "state-store",
    )
}

pub(crate) fn merge_patch(collection: &str, id: &str, document: &mut Value, patch: Map<String, Value>) -> Result<(), NexusError> {
    let Value::Object(fields) = document else {
        return Err(NexusError::critical(
            "STORE_SERIALIZATION_ERROR",
            format!("Document '{id}' in '{collection}' is not an object"),
            "state-store",
        ));
    };
    fields.extend(patch);
    Ok(())
}

/// In-memory document store.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of documents in a collection.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.collections.read().get(collection).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, NexusError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn set(&self, collection: &str, id: &str, document: Value) -> Result<(), NexusError> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<(), NexusError> {
        let mut collections = self.collections.write();
        let document = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| document_not_found(collection, id))?;
        merge_patch(collection, id, document, patch)
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<(String, Value)>, NexusError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| matches_all(filters, doc))
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), NexusError> {
        if let Some(docs) = self.collections.write().get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }
}
