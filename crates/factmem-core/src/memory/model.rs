//! Core value types: facts, entities, links, observations, and dreams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fact's coarse category. The source couples every fact to a single
/// `world` variant today; the enum exists so domain-specific variants can
/// be added without touching storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    World,
}

impl FactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::World => "world",
        }
    }
}

impl std::str::FromStr for FactType {
    type Err = crate::error::MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "world" => Ok(FactType::World),
            other => Err(crate::error::MemoryError::Validation(format!(
                "unknown fact_type {other}"
            ))),
        }
    }
}

/// An atomic textual assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Fact {
    pub id: i64,
    pub text: String,
    pub fact_type: FactType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub happened_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entity_refs: Vec<EntityRef>,
}

/// A canonical identity referenced by facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub is_core: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// The canonical string embedded for an entity: `"<name> (<type>)"`.
    pub fn canonical_text(name: &str, entity_type: &str) -> String {
        format!("{name} ({entity_type})")
    }
}

/// A fact-to-entity edge produced by extraction and resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct EntityRef {
    pub id: i64,
    pub fact_id: i64,
    pub name: String,
    pub entity_type: String,
    pub canonical_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Temporal,
    Semantic,
    Entity,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Temporal => "temporal",
            LinkType::Semantic => "semantic",
            LinkType::Entity => "entity",
        }
    }
}

impl std::str::FromStr for LinkType {
    type Err = crate::error::MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporal" => Ok(LinkType::Temporal),
            "semantic" => Ok(LinkType::Semantic),
            "entity" => Ok(LinkType::Entity),
            other => Err(crate::error::MemoryError::Validation(format!(
                "unknown link_type {other}"
            ))),
        }
    }
}

/// A weighted edge between two facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FactLink {
    pub id: i64,
    pub source_fact_id: i64,
    pub target_fact_id: i64,
    pub link_type: LinkType,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

/// One entry in an observation's append-only change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub previous_text: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggering_fact_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub absorbed_text: Option<String>,
}

/// A synthesized, higher-level statement distilled from one or more facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Observation {
    pub id: i64,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub evidence_count: i64,
    pub source_fact_ids: Vec<i64>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
}

impl Observation {
    pub fn invariants_hold(&self) -> bool {
        self.evidence_count == self.source_fact_ids.len() as i64 && self.updated_at >= self.created_at
    }
}

/// A cross-cluster insight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Dream {
    pub id: i64,
    pub bridge: String,
    pub insight: String,
    pub source_fact_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

/// The return type of `recall`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactContext {
    pub facts: Vec<Fact>,
    pub observations: Vec<Observation>,
    /// Maps observation id to its most recent supporting facts.
    pub bundled_sources: std::collections::HashMap<i64, Vec<Fact>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_type_roundtrip() {
        assert_eq!(FactType::World.as_str(), "world");
        assert_eq!("world".parse::<FactType>().unwrap(), FactType::World);
    }

    #[test]
    fn link_type_roundtrip() {
        for lt in [LinkType::Temporal, LinkType::Semantic, LinkType::Entity] {
            assert_eq!(lt.as_str().parse::<LinkType>().unwrap(), lt);
        }
    }

    #[test]
    fn observation_invariant_checks_evidence_count() {
        let now = Utc::now();
        let obs = Observation {
            id: 1,
            summary: "x".into(),
            embedding: None,
            evidence_count: 2,
            source_fact_ids: vec![1, 2],
            history: vec![],
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            access_count: 0,
        };
        assert!(obs.invariants_hold());
    }
}
