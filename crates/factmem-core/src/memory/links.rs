//! Link creation for a newly stored fact: temporal, semantic, and entity
//! links are each computed from the fact's own fields and written
//! through [`crate::storage::connection::Storage`].
//!
//! Reads go through the storage type's reader connection as usual; the
//! writes take an explicit connection so this can run inside the same
//! transaction as the fact insert itself (the writer mutex isn't
//! reentrant, so re-locking it here would deadlock a caller already
//! holding it for the surrounding transaction).

use chrono::Duration;
use rusqlite::Connection;

use crate::error::Result;
use crate::memory::model::{Fact, LinkType};
use crate::storage::connection::Storage;

/// Creates all links for `fact` and returns the total count created.
pub fn create_links_for_fact(storage: &Storage, conn: &Connection, fact: &Fact) -> Result<usize> {
    let mut count = 0;
    count += create_temporal_links(storage, conn, fact)?;
    count += create_semantic_links(storage, conn, fact)?;
    count += create_entity_links(storage, conn, fact)?;
    Ok(count)
}

/// Links `fact` to other facts with real event times within a window of
/// `5 * sigma` hours, weighted by exponential decay over the time gap.
/// Facts without `happened_at` never receive temporal links.
fn create_temporal_links(storage: &Storage, conn: &Connection, fact: &Fact) -> Result<usize> {
    let Some(happened_at) = fact.happened_at else {
        return Ok(0);
    };

    let sigma = storage.config.link_temporal_sigma_hours;
    let window_start = happened_at - Duration::seconds((sigma * 5.0 * 3600.0) as i64);
    let recent = storage.list_facts_in_time_window(window_start, happened_at)?;

    let mut count = 0;
    for other in recent {
        if other.id == fact.id {
            continue;
        }
        let Some(other_time) = other.happened_at else {
            continue;
        };

        let hours_diff = (happened_at - other_time).num_seconds().unsigned_abs() as f64 / 3600.0;
        let weight = (-hours_diff / sigma).exp();

        if weight < storage.config.link_temporal_min_weight {
            continue;
        }

        storage.create_link_in(conn, fact.id, other.id, LinkType::Temporal, weight)?;
        count += 1;
    }
    Ok(count)
}

/// Links `fact` to its nearest semantic neighbors above the configured
/// similarity threshold. No-op if the fact has no embedding.
fn create_semantic_links(storage: &Storage, conn: &Connection, fact: &Fact) -> Result<usize> {
    let Some(embedding) = &fact.embedding else {
        return Ok(0);
    };

    let similar = storage.search_facts_vector(embedding, storage.config.link_semantic_search_limit)?;

    let mut count = 0;
    for (other, similarity) in similar {
        if other.id == fact.id {
            continue;
        }
        if similarity >= storage.config.link_semantic_threshold {
            storage.create_link_in(conn, fact.id, other.id, LinkType::Semantic, similarity)?;
            count += 1;
        }
    }
    Ok(count)
}

/// Links `fact` to every other fact that shares at least one entity
/// mention, with a binary weight: any overlap counts as a full
/// connection regardless of how many entities are shared.
fn create_entity_links(storage: &Storage, conn: &Connection, fact: &Fact) -> Result<usize> {
    let refs = storage.get_entity_refs(fact.id)?;
    if refs.is_empty() {
        return Ok(0);
    }

    let sharing = storage.get_facts_sharing_entities(fact.id, storage.config.link_entity_search_limit, &[])?;
    if sharing.is_empty() {
        return Ok(0);
    }

    let mut count = 0;
    for (other, _shared_count) in sharing {
        storage.create_link_in(conn, fact.id, other.id, LinkType::Entity, 1.0)?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::model::FactType;

    fn storage() -> Storage {
        Storage::open_in_memory(MemoryConfig::default()).unwrap()
    }

    #[test]
    fn temporal_links_skip_facts_without_happened_at() {
        let s = storage();
        let fact = s.create_fact("no event time", FactType::World, "user", None, None, None).unwrap();
        let conn = s.writer.lock().unwrap();
        let created = create_links_for_fact(&s, &conn, &fact).unwrap();
        assert_eq!(created, 0);
    }

    #[test]
    fn entity_links_connect_facts_sharing_a_name() {
        let s = storage();
        let a = s.create_fact("Alice likes tea", FactType::World, "user", None, None, None).unwrap();
        let b = s.create_fact("Alice visited Paris", FactType::World, "user", None, None, None).unwrap();
        s.add_entity_ref(a.id, "Alice", "person", None).unwrap();
        s.add_entity_ref(b.id, "Alice", "person", None).unwrap();

        let created = {
            let conn = s.writer.lock().unwrap();
            create_entity_links(&s, &conn, &b).unwrap()
        };
        assert_eq!(created, 1);
        let links = s.get_links(b.id).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_type, LinkType::Entity);
        assert_eq!(links[0].weight, 1.0);
    }

    #[test]
    fn semantic_links_respect_threshold() {
        let s = storage();
        let a = s.create_fact("a", FactType::World, "user", None, Some(&[1.0; 768]), None).unwrap();
        let b = s.create_fact("b", FactType::World, "user", None, Some(&[1.0; 768]), None).unwrap();
        let created = {
            let conn = s.writer.lock().unwrap();
            create_semantic_links(&s, &conn, &b).unwrap()
        };
        assert_eq!(created, 1);
        let links = s.get_links(b.id).unwrap();
        assert!(links.iter().any(|l| l.link_type == LinkType::Semantic && l.target_fact_id == a.id));
    }
}
