//! `factmem-core` is the fact-memory engine at the heart of a personal
//! assistant: a persistent, self-organizing knowledge graph that ingests
//! free-form textual facts, links them by temporal, semantic, and
//! entity-overlap relationships, consolidates them into higher-level
//! observations, cross-pollinates unrelated clusters into dreams, and
//! retrieves relevant knowledge for a given query.
//!
//! The engine is built on a single embedded SQLite database carrying its
//! own vector-search virtual tables (via the `sqlite-vec` extension) and
//! FTS5 full-text tables, kept in sync with their parent tables by
//! triggers. All mutation flows through [`facade::FactMemory`], which
//! owns a process-wide write lock and a background consolidation task.

pub mod config;
pub mod consolidation;
pub mod error;
pub mod facade;
pub mod memory;
pub mod providers;
pub mod retrieval;
pub mod search;
pub mod storage;

pub mod prelude {
    pub use crate::config::MemoryConfig;
    pub use crate::error::{MemoryError, Result};
    pub use crate::facade::{FactMemory, RememberResult};
    pub use crate::memory::model::{
        Dream, Entity, EntityRef, Fact, FactContext, FactLink, FactType, HistoryEntry, LinkType,
        Observation,
    };
    pub use crate::providers::{EmbeddingProvider, LanguageModelProvider, Reranker};
}
