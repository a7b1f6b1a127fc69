//! Observation CRUD, history tracking, and search.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Row};

use crate::error::Result;
use crate::memory::model::{HistoryEntry, Observation};
use crate::storage::connection::{deserialize_embedding, serialize_embedding, Storage};

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn row_to_observation(row: &Row) -> rusqlite::Result<Observation> {
    let embedding_bytes: Option<Vec<u8>> = row.get("embedding")?;
    let source_fact_ids: String = row.get("source_fact_ids")?;
    let history: String = row.get("history")?;
    Ok(Observation {
        id: row.get("id")?,
        summary: row.get("summary")?,
        embedding: embedding_bytes.map(|b| deserialize_embedding(&b)),
        evidence_count: row.get("evidence_count")?,
        source_fact_ids: serde_json::from_str(&source_fact_ids).unwrap_or_default(),
        history: serde_json::from_str(&history).unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
        last_accessed_at: parse_ts(&row.get::<_, String>("last_accessed_at")?),
        access_count: row.get("access_count")?,
    })
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

impl Storage {
    pub fn create_observation(&self, summary: &str, embedding: Option<&[f32]>, source_fact_id: Option<i64>) -> Result<Observation> {
        let conn = self.writer.lock().unwrap();
        let now = Utc::now();
        let source_fact_ids: Vec<i64> = source_fact_id.into_iter().collect();
        let embedding_bytes = embedding.map(serialize_embedding);

        conn.execute(
            "INSERT INTO observations (summary, embedding, evidence_count, source_fact_ids, history, created_at, updated_at, last_accessed_at, access_count)
             VALUES (?, ?, ?, ?, '[]', ?, ?, ?, 0)",
            params![
                summary,
                embedding_bytes,
                source_fact_ids.len() as i64,
                serde_json::to_string(&source_fact_ids).unwrap(),
                now.to_rfc3339(),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        if let Some(bytes) = &embedding_bytes {
            conn.execute("INSERT INTO observations_vec (observation_id, embedding) VALUES (?, ?)", params![id, bytes])?;
        }

        Ok(Observation {
            id,
            summary: summary.to_string(),
            embedding: embedding.map(|e| e.to_vec()),
            evidence_count: source_fact_ids.len() as i64,
            source_fact_ids,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            access_count: 0,
        })
    }

    pub fn get_observation(&self, id: i64) -> Result<Option<Observation>> {
        let conn = self.reader.lock().unwrap();
        conn.query_row("SELECT * FROM observations WHERE id = ?", [id], row_to_observation)
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
            .map_err(Into::into)
    }

    pub fn get_observations_batch(&self, ids: &[i64]) -> Result<HashMap<i64, Observation>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.reader.lock().unwrap();
        let sql = format!("SELECT * FROM observations WHERE id IN ({})", placeholders(ids.len()));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_observation)?;
        let mut map = HashMap::new();
        for r in rows {
            let o = r?;
            map.insert(o.id, o);
        }
        Ok(map)
    }

    /// Appends `new_fact_id` to `source_fact_ids` (if not already present)
    /// and records a history entry describing the update, then rewrites
    /// the summary and embedding.
    pub fn update_observation(
        &self,
        id: i64,
        summary: &str,
        embedding: Option<&[f32]>,
        new_fact_id: Option<i64>,
        reason: &str,
    ) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        let existing = conn.query_row("SELECT * FROM observations WHERE id = ?", [id], row_to_observation)?;

        let mut source_fact_ids = existing.source_fact_ids.clone();
        if let Some(fid) = new_fact_id {
            if !source_fact_ids.contains(&fid) {
                source_fact_ids.push(fid);
            }
        }

        let mut history = existing.history.clone();
        history.push(HistoryEntry {
            previous_text: existing.summary.clone(),
            timestamp: Utc::now(),
            reason: reason.to_string(),
            triggering_fact_id: new_fact_id,
            absorbed_text: None,
        });

        let embedding_bytes = embedding.map(serialize_embedding);
        conn.execute(
            "UPDATE observations SET summary = ?, embedding = COALESCE(?, embedding), evidence_count = ?, source_fact_ids = ?, history = ?, updated_at = ?
             WHERE id = ?",
            params![
                summary,
                embedding_bytes,
                source_fact_ids.len() as i64,
                serde_json::to_string(&source_fact_ids).unwrap(),
                serde_json::to_string(&history).unwrap(),
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;

        if let Some(bytes) = &embedding_bytes {
            conn.execute("DELETE FROM observations_vec WHERE observation_id = ?", [id])?;
            conn.execute("INSERT INTO observations_vec (observation_id, embedding) VALUES (?, ?)", params![id, bytes])?;
        }

        Ok(())
    }

    /// Overwrites summary and embedding without touching history. Used
    /// by re-embed paths where no semantic change occurred.
    pub fn update_observation_summary(&self, id: i64, summary: &str, embedding: &[f32]) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        let bytes = serialize_embedding(embedding);
        conn.execute(
            "UPDATE observations SET summary = ?, embedding = ?, updated_at = ? WHERE id = ?",
            params![summary, bytes, Utc::now().to_rfc3339(), id],
        )?;
        conn.execute("DELETE FROM observations_vec WHERE observation_id = ?", [id])?;
        conn.execute("INSERT INTO observations_vec (observation_id, embedding) VALUES (?, ?)", params![id, bytes])?;
        Ok(())
    }

    pub fn add_source_facts(&self, id: i64, fact_ids: &[i64]) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        let existing = conn.query_row("SELECT * FROM observations WHERE id = ?", [id], row_to_observation)?;
        let mut source_fact_ids = existing.source_fact_ids.clone();
        for fid in fact_ids {
            if !source_fact_ids.contains(fid) {
                source_fact_ids.push(*fid);
            }
        }
        conn.execute(
            "UPDATE observations SET evidence_count = ?, source_fact_ids = ?, updated_at = ? WHERE id = ?",
            params![
                source_fact_ids.len() as i64,
                serde_json::to_string(&source_fact_ids).unwrap(),
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        Ok(())
    }

    pub fn reinforce_observations(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.writer.lock().unwrap();
        let sql = format!(
            "UPDATE observations SET last_accessed_at = ?, access_count = access_count + 1 WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(Utc::now().to_rfc3339())];
        for id in ids {
            bind.push(Box::new(*id));
        }
        conn.execute(&sql, params_from_iter(bind.iter().map(|p| p.as_ref())))?;
        Ok(())
    }

    pub fn delete_observation(&self, id: i64) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute("DELETE FROM observations_vec WHERE observation_id = ?", [id])?;
        conn.execute("DELETE FROM observations WHERE id = ?", [id])?;
        Ok(())
    }

    pub fn list_recent_observations(&self, limit: usize) -> Result<Vec<Observation>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM observations ORDER BY created_at DESC LIMIT ?")?;
        let rows = stmt.query_map([limit as i64], row_to_observation)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn list_all_observations_with_embeddings(&self) -> Result<Vec<Observation>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM observations WHERE embedding IS NOT NULL")?;
        let rows = stmt.query_map([], row_to_observation)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn count_observations(&self) -> Result<i64> {
        let conn = self.reader.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM observations", [], |r| r.get(0))?)
    }

    pub fn clear_observations(&self) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute("DELETE FROM observations_vec", [])?;
        conn.execute("DELETE FROM observations", [])?;
        Ok(())
    }

    /// Combines two observations' source-fact sets (dedup, keeper order
    /// preserved), appends a history entry whose `absorbed_text` is the
    /// removed observation's summary, rewrites the keeper's
    /// summary/embedding, and deletes the removed observation. Atomic
    /// under the caller's write lock.
    pub fn merge_observations(&self, keeper_id: i64, removed_id: i64, merged_text: &str, embedding: &[f32], reason: &str) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        let keeper = conn.query_row("SELECT * FROM observations WHERE id = ?", [keeper_id], row_to_observation)?;
        let removed = conn.query_row("SELECT * FROM observations WHERE id = ?", [removed_id], row_to_observation)?;

        let mut source_fact_ids = keeper.source_fact_ids.clone();
        for fid in &removed.source_fact_ids {
            if !source_fact_ids.contains(fid) {
                source_fact_ids.push(*fid);
            }
        }

        let mut history = keeper.history.clone();
        history.push(HistoryEntry {
            previous_text: keeper.summary.clone(),
            timestamp: Utc::now(),
            reason: reason.to_string(),
            triggering_fact_id: None,
            absorbed_text: Some(removed.summary.clone()),
        });

        let bytes = serialize_embedding(embedding);
        conn.execute(
            "UPDATE observations SET summary = ?, embedding = ?, evidence_count = ?, source_fact_ids = ?, history = ?, updated_at = ?
             WHERE id = ?",
            params![
                merged_text,
                bytes,
                source_fact_ids.len() as i64,
                serde_json::to_string(&source_fact_ids).unwrap(),
                serde_json::to_string(&history).unwrap(),
                Utc::now().to_rfc3339(),
                keeper_id,
            ],
        )?;
        conn.execute("DELETE FROM observations_vec WHERE observation_id = ?", [keeper_id])?;
        conn.execute("INSERT INTO observations_vec (observation_id, embedding) VALUES (?, ?)", params![keeper_id, bytes])?;

        conn.execute("DELETE FROM observations_vec WHERE observation_id = ?", [removed_id])?;
        conn.execute("DELETE FROM observations WHERE id = ?", [removed_id])?;

        Ok(())
    }

    /// Replaces every occurrence of `old_id` with `new_id` in each
    /// observation's `source_fact_ids`, deduplicating afterward. Used
    /// when a fact merge pass deletes `old_id` in favor of `new_id`.
    /// Narrows the scan with a `LIKE` filter before parsing JSON, since
    /// only observations that could possibly reference `old_id` are
    /// worth touching.
    pub fn replace_fact_id_in_observations(&self, old_id: i64, new_id: i64) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        let pattern = format!("%{old_id}%");
        let mut stmt = conn.prepare("SELECT id, source_fact_ids FROM observations WHERE source_fact_ids LIKE ?")?;
        let rows: Vec<(i64, String)> = stmt.query_map([pattern], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?;

        for (obs_id, raw) in rows {
            let ids: Vec<i64> = serde_json::from_str(&raw).unwrap_or_default();
            if !ids.contains(&old_id) {
                continue;
            }
            let mut deduped = Vec::new();
            for fid in ids {
                let mapped = if fid == old_id { new_id } else { fid };
                if !deduped.contains(&mapped) {
                    deduped.push(mapped);
                }
            }
            conn.execute(
                "UPDATE observations SET source_fact_ids = ?, evidence_count = ? WHERE id = ?",
                params![serde_json::to_string(&deduped).unwrap(), deduped.len() as i64, obs_id],
            )?;
        }
        Ok(())
    }

    // --- Search ---

    pub fn search_observations_vector(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<(Observation, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.reader.lock().unwrap();
        let query_bytes = serialize_embedding(query_embedding);
        let mut stmt = conn.prepare(
            "SELECT observation_id, distance FROM observations_vec WHERE embedding MATCH ? AND k = ? ORDER BY distance",
        )?;
        let hits: Vec<(i64, f64)> = stmt
            .query_map(params![query_bytes, limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        let sql = format!("SELECT * FROM observations WHERE id IN ({})", placeholders(ids.len()));
        let mut stmt = conn.prepare(&sql)?;
        let by_id: HashMap<i64, Observation> = stmt
            .query_map(params_from_iter(ids.iter()), row_to_observation)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|o| (o.id, o))
            .collect();
        Ok(hits.into_iter().filter_map(|(id, distance)| by_id.get(&id).map(|o| (o.clone(), 1.0 - distance))).collect())
    }

    pub fn search_observations_fts(&self, fts_query: &str, limit: usize) -> Result<Vec<Observation>> {
        if fts_query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT o.* FROM observations o JOIN observations_fts fts ON o.id = fts.rowid
             WHERE observations_fts MATCH ? ORDER BY bm25(observations_fts) LIMIT ?",
        )?;
        let rows = stmt.query_map(params![fts_query, limit as i64], row_to_observation)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
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
    fn create_observation_sets_evidence_count() {
        let s = storage();
        let obs = s.create_observation("Alice likes Python", None, Some(1)).unwrap();
        assert_eq!(obs.evidence_count, 1);
        assert_eq!(obs.source_fact_ids, vec![1]);
    }

    #[test]
    fn update_observation_appends_history_entry() {
        let s = storage();
        let obs = s.create_observation("Alice works at Google", None, Some(1)).unwrap();
        s.update_observation(obs.id, "Alice works at Meta", None, Some(2), "job change").unwrap();
        let updated = s.get_observation(obs.id).unwrap().unwrap();
        assert_eq!(updated.summary, "Alice works at Meta");
        assert_eq!(updated.source_fact_ids, vec![1, 2]);
        assert_eq!(updated.history.len(), 1);
        assert_eq!(updated.history[0].previous_text, "Alice works at Google");
    }

    #[test]
    fn merge_observations_unions_sources_and_records_absorbed_text() {
        let s = storage();
        let keeper = s.create_observation("Alice is a developer", None, Some(1)).unwrap();
        let removed = s.create_observation("Alice writes code", None, Some(2)).unwrap();

        s.merge_observations(keeper.id, removed.id, "Alice is a software developer", &[0.1, 0.2], "duplicate").unwrap();

        let merged = s.get_observation(keeper.id).unwrap().unwrap();
        assert_eq!(merged.source_fact_ids, vec![1, 2]);
        assert_eq!(merged.history.len(), 1);
        assert_eq!(merged.history[0].absorbed_text.as_deref(), Some("Alice writes code"));
        assert!(s.get_observation(removed.id).unwrap().is_none());
    }
}
