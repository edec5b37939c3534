//! Persistence: document stores and the pipeline State Store.

mod cache;
mod document;
mod file;
mod model;
mod store;

pub use cache::{CachedDocumentStore, TtlCache, DEFAULT_CACHE_TTL};
pub use document::{matches_all, DocumentStore, Filter, FilterOp, InMemoryDocumentStore};
pub use file::FileDocumentStore;
pub use model::{PipelineState, SkipInfo, StageRecord, StageUpdate};
pub use store::{outputs_collection, StateStore, PIPELINES_COLLECTION};
