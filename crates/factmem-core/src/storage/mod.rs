//! SQLite-backed storage for facts, entities, links, observations, and
//! dreams. Each submodule adds methods onto [`connection::Storage`]
//! rather than defining its own repository type, since a single
//! connection pair backs every table.

pub mod connection;
mod dreams;
mod facts;
pub mod migrations;
mod observations;

pub use connection::{deserialize_embedding, serialize_embedding, Storage};
