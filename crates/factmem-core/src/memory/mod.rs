pub mod decay;
pub mod extraction;
pub mod links;
pub mod model;
pub mod resolution;

pub use model::{
    Dream, Entity, EntityRef, Fact, FactContext, FactLink, FactType, HistoryEntry, LinkType,
    Observation,
};
