//! Dream CRUD. Dreams carry an embedding purely for novelty checks
//! during the dream consolidation pass (is this bridge insight too
//! similar to one we've already surfaced?); they are never retrieved
//! through the normal recall path.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::error::Result;
use crate::memory::model::Dream;
use crate::storage::connection::{deserialize_embedding, serialize_embedding, Storage};

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn row_to_dream(row: &Row) -> rusqlite::Result<Dream> {
    let source_fact_ids: String = row.get("source_fact_ids")?;
    Ok(Dream {
        id: row.get("id")?,
        bridge: row.get("bridge")?,
        insight: row.get("insight")?,
        source_fact_ids: serde_json::from_str(&source_fact_ids).unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

impl Storage {
    pub fn create_dream(&self, bridge: &str, insight: &str, source_fact_ids: &[i64], embedding: Option<&[f32]>) -> Result<Dream> {
        let conn = self.writer.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO dreams (bridge, insight, embedding, source_fact_ids, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                bridge,
                insight,
                embedding.map(serialize_embedding),
                serde_json::to_string(source_fact_ids).unwrap(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(Dream {
            id: conn.last_insert_rowid(),
            bridge: bridge.to_string(),
            insight: insight.to_string(),
            source_fact_ids: source_fact_ids.to_vec(),
            created_at: now,
        })
    }

    pub fn get_dream(&self, id: i64) -> Result<Option<Dream>> {
        let conn = self.reader.lock().unwrap();
        conn.query_row("SELECT * FROM dreams WHERE id = ?", [id], row_to_dream)
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
            .map_err(Into::into)
    }

    pub fn list_recent_dreams(&self, limit: usize) -> Result<Vec<Dream>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM dreams ORDER BY created_at DESC LIMIT ?")?;
        let rows = stmt.query_map([limit as i64], row_to_dream)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn count_dreams(&self) -> Result<i64> {
        let conn = self.reader.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM dreams", [], |r| r.get(0))?)
    }

    pub fn delete_dream(&self, id: i64) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute("DELETE FROM dreams WHERE id = ?", [id])?;
        Ok(())
    }

    pub fn last_dream_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.reader.lock().unwrap();
        let raw: Option<String> = conn.query_row("SELECT MAX(created_at) FROM dreams", [], |r| r.get(0))?;
        Ok(raw.map(|s| parse_ts(&s)))
    }

    /// Embeddings of the most recently created dreams, newest first, for
    /// novelty comparison against a fresh bridge candidate.
    pub fn recent_dream_embeddings(&self, limit: usize) -> Result<Vec<Vec<f32>>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT embedding FROM dreams WHERE embedding IS NOT NULL ORDER BY created_at DESC LIMIT ?")?;
        let rows = stmt.query_map([limit as i64], |row| row.get::<_, Vec<u8>>(0))?;
        let mut result = Vec::new();
        for r in rows {
            result.push(deserialize_embedding(&r?));
        }
        Ok(result)
    }

    pub fn clear_dreams(&self) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute("DELETE FROM dreams", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    fn storage() -> Storage {
        Storage::open_in_memory(MemoryConfig::default()).unwrap()
    }

    #[test]
    fn create_and_get_dream_roundtrips() {
        let s = storage();
        let dream = s.create_dream("bridge text", "insight text", &[1, 2, 3], Some(&[0.1, 0.2])).unwrap();
        let fetched = s.get_dream(dream.id).unwrap().unwrap();
        assert_eq!(fetched.bridge, "bridge text");
        assert_eq!(fetched.source_fact_ids, vec![1, 2, 3]);
    }

    #[test]
    fn recent_embeddings_excludes_dreams_without_one() {
        let s = storage();
        s.create_dream("a", "b", &[], Some(&[1.0, 0.0])).unwrap();
        s.create_dream("c", "d", &[], None).unwrap();
        let embeddings = s.recent_dream_embeddings(10).unwrap();
        assert_eq!(embeddings.len(), 1);
    }

    #[test]
    fn last_created_at_is_none_when_empty() {
        let s = storage();
        assert!(s.last_dream_created_at().unwrap().is_none());
    }
}
