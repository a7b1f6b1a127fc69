//! Fact CRUD, entity references, fact links, and fact-level search.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};

use crate::error::Result;
use crate::memory::model::{Entity, EntityRef, Fact, FactLink, FactType, LinkType};
use crate::storage::connection::{deserialize_embedding, serialize_embedding, Storage};

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn row_to_fact(row: &Row) -> rusqlite::Result<Fact> {
    let embedding_bytes: Option<Vec<u8>> = row.get("embedding")?;
    let fact_type_str: String = row.get("fact_type")?;
    Ok(Fact {
        id: row.get("id")?,
        text: row.get("text")?,
        fact_type: fact_type_str.parse().unwrap_or(FactType::World),
        embedding: embedding_bytes.map(|b| deserialize_embedding(&b)),
        source_type: row.get("source_type")?,
        source_ref: row.get("source_ref")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        happened_at: row.get::<_, Option<String>>("happened_at")?.map(|s| parse_ts(&s)),
        last_accessed_at: parse_ts(&row.get::<_, String>("last_accessed_at")?),
        access_count: row.get("access_count")?,
        consolidated_at: row.get::<_, Option<String>>("consolidated_at")?.map(|s| parse_ts(&s)),
        entity_refs: Vec::new(),
    })
}

fn row_to_entity_ref(row: &Row) -> rusqlite::Result<EntityRef> {
    Ok(EntityRef {
        id: row.get("id")?,
        fact_id: row.get("fact_id")?,
        name: row.get("name")?,
        entity_type: row.get("entity_type")?,
        canonical_id: row.get("canonical_id")?,
    })
}

fn row_to_link(row: &Row) -> rusqlite::Result<FactLink> {
    let link_type_str: String = row.get("link_type")?;
    Ok(FactLink {
        id: row.get("id")?,
        source_fact_id: row.get("source_fact_id")?,
        target_fact_id: row.get("target_fact_id")?,
        link_type: link_type_str.parse().unwrap_or(LinkType::Entity),
        weight: row.get("weight")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

impl Storage {
    pub fn create_fact(
        &self,
        text: &str,
        fact_type: FactType,
        source_type: &str,
        source_ref: Option<&str>,
        embedding: Option<&[f32]>,
        happened_at: Option<DateTime<Utc>>,
    ) -> Result<Fact> {
        let conn = self.writer.lock().unwrap();
        self.create_fact_in(&conn, text, fact_type, source_type, source_ref, embedding, happened_at)
    }

    pub(crate) fn create_fact_in(
        &self,
        conn: &Connection,
        text: &str,
        fact_type: FactType,
        source_type: &str,
        source_ref: Option<&str>,
        embedding: Option<&[f32]>,
        happened_at: Option<DateTime<Utc>>,
    ) -> Result<Fact> {
        let now = Utc::now();
        let embedding_bytes = embedding.map(serialize_embedding);
        conn.execute(
            "INSERT INTO facts (text, fact_type, embedding, source_type, source_ref, created_at, happened_at, last_accessed_at, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                text,
                fact_type.as_str(),
                embedding_bytes,
                source_type,
                source_ref,
                now.to_rfc3339(),
                happened_at.map(|t| t.to_rfc3339()),
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        if let Some(bytes) = &embedding_bytes {
            conn.execute("INSERT INTO facts_vec (fact_id, embedding) VALUES (?1, ?2)", params![id, bytes])?;
        }

        Ok(Fact {
            id,
            text: text.to_string(),
            fact_type,
            embedding: embedding.map(|e| e.to_vec()),
            source_type: source_type.to_string(),
            source_ref: source_ref.map(|s| s.to_string()),
            created_at: now,
            happened_at,
            last_accessed_at: now,
            access_count: 0,
            consolidated_at: None,
            entity_refs: Vec::new(),
        })
    }

    pub fn get_fact(&self, id: i64) -> Result<Option<Fact>> {
        let conn = self.reader.lock().unwrap();
        let mut fact = conn
            .query_row("SELECT * FROM facts WHERE id = ?1", [id], row_to_fact)
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })?;
        if let Some(f) = &mut fact {
            f.entity_refs = self.get_entity_refs_conn(&conn, id)?;
        }
        Ok(fact)
    }

    pub fn get_facts_batch(&self, ids: &[i64]) -> Result<HashMap<i64, Fact>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.reader.lock().unwrap();
        let sql = format!("SELECT * FROM facts WHERE id IN ({})", placeholders(ids.len()));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_fact)?;
        let mut map = HashMap::new();
        for r in rows {
            let f = r?;
            map.insert(f.id, f);
        }
        Ok(map)
    }

    pub fn list_recent_facts(&self, limit: usize) -> Result<Vec<Fact>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM facts ORDER BY created_at DESC LIMIT ?1")?;
        let rows = stmt.query_map([limit as i64], row_to_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn list_facts_in_time_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Fact>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM facts WHERE created_at BETWEEN ?1 AND ?2 ORDER BY created_at DESC")?;
        let rows = stmt.query_map(params![start.to_rfc3339(), end.to_rfc3339()], row_to_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn list_unconsolidated_facts(&self, limit: usize) -> Result<Vec<Fact>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM facts WHERE consolidated_at IS NULL ORDER BY created_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn list_all_facts_with_embeddings(&self) -> Result<Vec<Fact>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM facts WHERE embedding IS NOT NULL")?;
        let rows = stmt.query_map([], row_to_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn mark_fact_consolidated(&self, id: i64) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute("UPDATE facts SET consolidated_at = ?1 WHERE id = ?2", params![Utc::now().to_rfc3339(), id])?;
        Ok(())
    }

    pub fn update_fact_text(&self, id: i64, new_text: &str, new_embedding: Option<&[f32]>) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute(
            "UPDATE facts SET text = ?1, consolidated_at = NULL WHERE id = ?2",
            params![new_text, id],
        )?;
        if let Some(emb) = new_embedding {
            let bytes = serialize_embedding(emb);
            conn.execute("UPDATE facts SET embedding = ?1 WHERE id = ?2", params![bytes, id])?;
            conn.execute("DELETE FROM facts_vec WHERE fact_id = ?1", [id])?;
            conn.execute("INSERT INTO facts_vec (fact_id, embedding) VALUES (?1, ?2)", params![id, bytes])?;
        }
        Ok(())
    }

    /// Bumps `last_accessed_at` and increments `access_count` for every
    /// id. Empty input is a no-op.
    pub fn reinforce_facts(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.writer.lock().unwrap();
        let sql = format!(
            "UPDATE facts SET last_accessed_at = ?, access_count = access_count + 1 WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(Utc::now().to_rfc3339())];
        for id in ids {
            params.push(Box::new(*id));
        }
        conn.execute(&sql, params_from_iter(params.iter().map(|p| p.as_ref())))?;
        Ok(())
    }

    /// Adds `delta` directly to `access_count`, bypassing the
    /// `last_accessed_at` bump [`Self::reinforce_facts`] performs. Used
    /// when transferring access history from a fact being merged away.
    pub fn add_access_count(&self, id: i64, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let conn = self.writer.lock().unwrap();
        conn.execute("UPDATE facts SET access_count = access_count + ?1 WHERE id = ?2", params![delta, id])?;
        Ok(())
    }

    pub fn delete_fact(&self, id: i64) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        self.delete_fact_in(&conn, id)
    }

    pub(crate) fn delete_fact_in(&self, conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM entity_refs WHERE fact_id = ?1", [id])?;
        conn.execute("DELETE FROM fact_links WHERE source_fact_id = ?1 OR target_fact_id = ?1", [id])?;
        conn.execute("DELETE FROM facts_vec WHERE fact_id = ?1", [id])?;
        conn.execute("DELETE FROM facts WHERE id = ?1", [id])?;
        Ok(())
    }

    // --- Entity references ---

    pub fn add_entity_ref(&self, fact_id: i64, name: &str, entity_type: &str, canonical_id: Option<i64>) -> Result<EntityRef> {
        let conn = self.writer.lock().unwrap();
        self.add_entity_ref_in(&conn, fact_id, name, entity_type, canonical_id)
    }

    pub(crate) fn add_entity_ref_in(
        &self,
        conn: &Connection,
        fact_id: i64,
        name: &str,
        entity_type: &str,
        canonical_id: Option<i64>,
    ) -> Result<EntityRef> {
        conn.execute(
            "INSERT INTO entity_refs (fact_id, name, entity_type, canonical_id) VALUES (?1, ?2, ?3, ?4)",
            params![fact_id, name, entity_type, canonical_id],
        )?;
        Ok(EntityRef {
            id: conn.last_insert_rowid(),
            fact_id,
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            canonical_id,
        })
    }

    pub fn get_entity_refs(&self, fact_id: i64) -> Result<Vec<EntityRef>> {
        let conn = self.reader.lock().unwrap();
        self.get_entity_refs_conn(&conn, fact_id)
    }

    fn get_entity_refs_conn(&self, conn: &Connection, fact_id: i64) -> Result<Vec<EntityRef>> {
        let mut stmt = conn.prepare("SELECT * FROM entity_refs WHERE fact_id = ?1")?;
        let rows = stmt.query_map([fact_id], row_to_entity_ref)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_entity_refs_batch(&self, fact_ids: &[i64]) -> Result<HashMap<i64, Vec<EntityRef>>> {
        let mut result: HashMap<i64, Vec<EntityRef>> = fact_ids.iter().map(|&id| (id, Vec::new())).collect();
        if fact_ids.is_empty() {
            return Ok(result);
        }
        let conn = self.reader.lock().unwrap();
        let sql = format!("SELECT * FROM entity_refs WHERE fact_id IN ({})", placeholders(fact_ids.len()));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(fact_ids.iter()), row_to_entity_ref)?;
        for r in rows {
            let er = r?;
            result.entry(er.fact_id).or_default().push(er);
        }
        Ok(result)
    }

    pub fn get_facts_for_entity(&self, name: &str, limit: usize) -> Result<Vec<Fact>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT f.* FROM facts f JOIN entity_refs er ON f.id = er.fact_id
             WHERE er.name = ?1 ORDER BY f.created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![name, limit as i64], row_to_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_facts_sharing_entities(
        &self,
        fact_id: i64,
        limit: usize,
        exclude_names: &[String],
    ) -> Result<Vec<(Fact, i64)>> {
        let conn = self.reader.lock().unwrap();
        let (sql, mut bind): (String, Vec<Box<dyn rusqlite::ToSql>>) = if exclude_names.is_empty() {
            (
                "SELECT f.*, COUNT(*) as shared_count FROM facts f
                 JOIN entity_refs er1 ON f.id = er1.fact_id
                 JOIN entity_refs er2 ON er1.name = er2.name
                 WHERE er2.fact_id = ? AND f.id != ?
                 GROUP BY f.id ORDER BY shared_count DESC, f.created_at DESC LIMIT ?"
                    .to_string(),
                vec![Box::new(fact_id), Box::new(fact_id)],
            )
        } else {
            let ph = placeholders(exclude_names.len());
            (
                format!(
                    "SELECT f.*, COUNT(*) as shared_count FROM facts f
                     JOIN entity_refs er1 ON f.id = er1.fact_id
                     JOIN entity_refs er2 ON er1.name = er2.name
                     WHERE er2.fact_id = ? AND f.id != ? AND er1.name NOT IN ({ph})
                     GROUP BY f.id ORDER BY shared_count DESC, f.created_at DESC LIMIT ?"
                ),
                {
                    let mut v: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(fact_id), Box::new(fact_id)];
                    for n in exclude_names {
                        v.push(Box::new(n.clone()));
                    }
                    v
                },
            )
        };
        bind.push(Box::new(limit as i64));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind.iter().map(|p| p.as_ref())), |row| {
            let fact = row_to_fact(row)?;
            let shared: i64 = row.get("shared_count")?;
            Ok((fact, shared))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // --- Fact links ---

    pub fn create_link(&self, source: i64, target: i64, link_type: LinkType, weight: f64) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        self.create_link_in(&conn, source, target, link_type, weight)
    }

    pub(crate) fn create_link_in(&self, conn: &Connection, source: i64, target: i64, link_type: LinkType, weight: f64) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO fact_links (source_fact_id, target_fact_id, link_type, weight, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![source, target, link_type.as_str(), weight, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_links(&self, fact_id: i64) -> Result<Vec<FactLink>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM fact_links WHERE source_fact_id = ?1 OR target_fact_id = ?1")?;
        let rows = stmt.query_map([fact_id], row_to_link)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_links_by_type(&self, fact_id: i64, link_type: LinkType) -> Result<Vec<FactLink>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM fact_links WHERE (source_fact_id = ?1 OR target_fact_id = ?1) AND link_type = ?2",
        )?;
        let rows = stmt.query_map(params![fact_id, link_type.as_str()], row_to_link)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // --- Search ---

    pub fn search_facts_vector(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<(Fact, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.reader.lock().unwrap();
        let query_bytes = serialize_embedding(query_embedding);
        let mut stmt = conn.prepare(
            "SELECT fact_id, distance FROM facts_vec WHERE embedding MATCH ?1 AND k = ?2 ORDER BY distance",
        )?;
        let hits: Vec<(i64, f64)> = stmt
            .query_map(params![query_bytes, limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        let sql = format!("SELECT * FROM facts WHERE id IN ({})", placeholders(ids.len()));
        let mut stmt = conn.prepare(&sql)?;
        let facts_by_id: HashMap<i64, Fact> = stmt
            .query_map(params_from_iter(ids.iter()), row_to_fact)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|f| (f.id, f))
            .collect();

        Ok(hits
            .into_iter()
            .filter_map(|(id, distance)| facts_by_id.get(&id).map(|f| (f.clone(), 1.0 - distance)))
            .collect())
    }

    pub fn search_facts_fts(&self, fts_query: &str, limit: usize) -> Result<Vec<Fact>> {
        if fts_query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT f.* FROM facts f JOIN facts_fts fts ON f.id = fts.rowid
             WHERE facts_fts MATCH ?1 ORDER BY bm25(facts_fts) LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![fts_query, limit as i64], row_to_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn search_facts_temporal(&self, query_time: DateTime<Utc>, overfetch: usize) -> Result<Vec<Fact>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM facts WHERE happened_at IS NOT NULL
             ORDER BY ABS(strftime('%s', happened_at) - strftime('%s', ?1)) ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![query_time.to_rfc3339(), overfetch as i64], row_to_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // --- Entity resolution helpers ---

    pub fn get_entity_source_overlap(&self, entity_name: &str, source_ref: &str) -> Result<bool> {
        let conn = self.reader.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM facts f JOIN entity_refs er ON f.id = er.fact_id
                 WHERE er.name = ?1 AND f.source_ref = ?2 LIMIT 1",
                params![entity_name, source_ref],
                |r| r.get(0),
            )
            .ok();
        Ok(exists.is_some())
    }

    pub fn get_entity_last_mention(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.reader.lock().unwrap();
        let ts: Option<String> = conn
            .query_row(
                "SELECT f.created_at FROM facts f JOIN entity_refs er ON f.id = er.fact_id
                 WHERE er.name = ?1 ORDER BY f.created_at DESC LIMIT 1",
                [name],
                |r| r.get(0),
            )
            .ok();
        Ok(ts.map(|s| parse_ts(&s)))
    }

    pub fn count_entity_facts(&self, entity_name: &str) -> Result<i64> {
        let conn = self.reader.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM entity_refs WHERE name = ?1", [entity_name], |r| r.get(0))?)
    }

    pub fn get_entity_co_occurrence(&self, name1: &str, name2: &str) -> Result<(i64, i64)> {
        let conn = self.reader.lock().unwrap();
        let shared_sources: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT f.source_ref) FROM facts f
             JOIN entity_refs er1 ON f.id = er1.fact_id
             JOIN entity_refs er2 ON f.id = er2.fact_id
             WHERE er1.name = ?1 AND er2.name = ?2 AND f.source_ref IS NOT NULL",
            params![name1, name2],
            |r| r.get(0),
        )?;
        let shared_facts: i64 = conn.query_row(
            "SELECT COUNT(*) FROM (SELECT f.id FROM facts f
             JOIN entity_refs er1 ON f.id = er1.fact_id
             JOIN entity_refs er2 ON f.id = er2.fact_id
             WHERE er1.name = ?1 AND er2.name = ?2)",
            params![name1, name2],
            |r| r.get(0),
        )?;
        Ok((shared_sources, shared_facts))
    }

    /// Distinct canonical entity ids referenced by any of `fact_ids`.
    /// Entity references without a resolved `canonical_id` are skipped.
    pub fn get_entity_ids_for_facts(&self, fact_ids: &[i64]) -> Result<Vec<i64>> {
        if fact_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.reader.lock().unwrap();
        let sql = format!(
            "SELECT DISTINCT canonical_id FROM entity_refs WHERE fact_id IN ({}) AND canonical_id IS NOT NULL",
            placeholders(fact_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(fact_ids.iter()), |r| r.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn count_entity_facts_by_id(&self, entity_id: i64) -> Result<i64> {
        let conn = self.reader.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(DISTINCT fact_id) FROM entity_refs WHERE canonical_id = ?1", [entity_id], |r| r.get(0))?)
    }

    pub fn get_facts_for_entity_id(&self, entity_id: i64, limit: usize) -> Result<Vec<Fact>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT f.* FROM facts f JOIN entity_refs er ON f.id = er.fact_id
             WHERE er.canonical_id = ?1 ORDER BY f.created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![entity_id, limit as i64], row_to_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Canonical entities mentioned in at least `min_count` facts within
    /// the last `days` days, as `(entity_id, name, count)`.
    pub fn get_entities_with_fact_count(&self, days: i64, min_count: i64) -> Result<Vec<(i64, String, i64)>> {
        let conn = self.reader.lock().unwrap();
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.name, COUNT(DISTINCT er.fact_id) as cnt
             FROM entities e
             JOIN entity_refs er ON er.canonical_id = e.id
             JOIN facts f ON f.id = er.fact_id
             WHERE f.created_at >= ?1
             GROUP BY e.id HAVING cnt >= ?2",
        )?;
        let rows = stmt.query_map(params![cutoff, min_count], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn has_temporal_checkpoint(&self, entity_id: i64, window_end: &str) -> Result<bool> {
        let conn = self.reader.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM temporal_checkpoints WHERE entity_id = ?1 AND window_end = ?2",
                params![entity_id, window_end],
                |r| r.get(0),
            )
            .ok();
        Ok(exists.is_some())
    }

    pub fn set_temporal_checkpoint(&self, entity_id: i64, window_end: &str) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO temporal_checkpoints (entity_id, window_end, processed_at) VALUES (?1, ?2, ?3)",
            params![entity_id, window_end, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_facts_for_entity_temporal(&self, entity_id: i64, days: i64, limit: usize) -> Result<Vec<Fact>> {
        let conn = self.reader.lock().unwrap();
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT f.* FROM facts f JOIN entity_refs er ON f.id = er.fact_id
             WHERE er.canonical_id = ?1 AND f.created_at >= ?2
             ORDER BY COALESCE(f.happened_at, f.created_at) ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![entity_id, cutoff, limit as i64], row_to_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // --- Entities ---

    pub fn create_entity(&self, name: &str, entity_type: &str, embedding: Option<&[f32]>, is_core: bool) -> Result<Entity> {
        let conn = self.writer.lock().unwrap();
        let now = Utc::now();
        let embedding_bytes = embedding.map(serialize_embedding);
        conn.execute(
            "INSERT OR IGNORE INTO entities (name, entity_type, embedding, is_core, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![name, entity_type, embedding_bytes, is_core, now.to_rfc3339(), now.to_rfc3339()],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM entities WHERE name = ?1 AND entity_type = ?2",
            params![name, entity_type],
            |r| r.get(0),
        )?;

        if let Some(bytes) = &embedding_bytes {
            conn.execute(
                "INSERT OR IGNORE INTO entities_vec (entity_id, embedding) VALUES (?1, ?2)",
                params![id, bytes],
            )?;
        }

        Ok(Entity {
            id,
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            embedding: embedding.map(|e| e.to_vec()),
            is_core,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_entity_by_name(&self, name: &str, entity_type: Option<&str>) -> Result<Option<Entity>> {
        let conn = self.reader.lock().unwrap();
        let result = if let Some(t) = entity_type {
            conn.query_row(
                "SELECT * FROM entities WHERE name = ?1 AND entity_type = ?2",
                params![name, t],
                row_to_entity,
            )
        } else {
            conn.query_row("SELECT * FROM entities WHERE name = ?1", [name], row_to_entity)
        };
        result.map(Some).or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) }).map_err(Into::into)
    }

    pub fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        let conn = self.reader.lock().unwrap();
        conn.query_row("SELECT * FROM entities WHERE id = ?1", [id], row_to_entity)
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
            .map_err(Into::into)
    }

    pub fn list_entities_by_type(&self, entity_type: &str, limit: usize) -> Result<Vec<Entity>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM entities WHERE entity_type = ?1 ORDER BY updated_at DESC LIMIT ?2")?;
        let rows = stmt.query_map(params![entity_type, limit as i64], row_to_entity)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn search_entities_vector(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<(Entity, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.reader.lock().unwrap();
        let query_bytes = serialize_embedding(query_embedding);
        let mut stmt = conn.prepare(
            "SELECT entity_id, distance FROM entities_vec WHERE embedding MATCH ?1 AND k = ?2 ORDER BY distance",
        )?;
        let hits: Vec<(i64, f64)> = stmt
            .query_map(params![query_bytes, limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        let sql = format!("SELECT * FROM entities WHERE id IN ({})", placeholders(ids.len()));
        let mut stmt = conn.prepare(&sql)?;
        let entities_by_id: HashMap<i64, Entity> = stmt
            .query_map(params_from_iter(ids.iter()), row_to_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();
        Ok(hits
            .into_iter()
            .filter_map(|(id, distance)| entities_by_id.get(&id).map(|e| (e.clone(), 1.0 - distance)))
            .collect())
    }

    pub fn merge_entities(&self, keep_id: i64, merge_ids: &[i64]) -> Result<i64> {
        if merge_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.writer.lock().unwrap();
        let ph = placeholders(merge_ids.len());

        let update_sql = format!("UPDATE entity_refs SET canonical_id = ? WHERE canonical_id IN ({ph})");
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(keep_id)];
        for id in merge_ids {
            bind.push(Box::new(*id));
        }
        let refs_rewritten = conn.execute(&update_sql, params_from_iter(bind.iter().map(|p| p.as_ref())))?;

        let vec_sql = format!("DELETE FROM entities_vec WHERE entity_id IN ({ph})");
        conn.execute(&vec_sql, params_from_iter(merge_ids.iter()))?;

        let del_sql = format!("DELETE FROM entities WHERE id IN ({ph})");
        conn.execute(&del_sql, params_from_iter(merge_ids.iter()))?;

        Ok(refs_rewritten as i64)
    }

    /// Deletes entities no longer referenced by any `entity_ref`, except
    /// core entities which persist regardless of current mention count.
    /// Run after fact deletion/merge passes that may have orphaned
    /// canonical entities.
    pub fn cleanup_orphaned_entities(&self) -> Result<usize> {
        let conn = self.writer.lock().unwrap();
        let orphaned: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM entities WHERE is_core = 0
                 AND id NOT IN (SELECT DISTINCT canonical_id FROM entity_refs WHERE canonical_id IS NOT NULL)",
            )?;
            stmt.query_map([], |r| r.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?
        };
        if orphaned.is_empty() {
            return Ok(0);
        }
        let ph = placeholders(orphaned.len());
        conn.execute(&format!("DELETE FROM entities_vec WHERE entity_id IN ({ph})"), params_from_iter(orphaned.iter()))?;
        conn.execute(&format!("DELETE FROM entities WHERE id IN ({ph})"), params_from_iter(orphaned.iter()))?;
        Ok(orphaned.len())
    }

    pub fn count_facts(&self) -> Result<i64> {
        let conn = self.reader.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM facts", [], |r| r.get(0))?)
    }

    pub fn count_links(&self) -> Result<i64> {
        let conn = self.reader.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM fact_links", [], |r| r.get(0))?)
    }

    /// Drops every fact, its links, and its entity references. Entities
    /// themselves survive; callers that want a full wipe also call
    /// `clear_entities`.
    pub fn clear_facts(&self) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute("DELETE FROM fact_links", [])?;
        conn.execute("DELETE FROM entity_refs", [])?;
        conn.execute("DELETE FROM facts_vec", [])?;
        conn.execute("DELETE FROM facts", [])?;
        Ok(())
    }

    pub fn clear_entities(&self) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute("DELETE FROM entities_vec", [])?;
        conn.execute("DELETE FROM entities", [])?;
        Ok(())
    }

    pub fn clear_temporal_checkpoints(&self) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute("DELETE FROM temporal_checkpoints", [])?;
        Ok(())
    }
}

fn row_to_entity(row: &Row) -> rusqlite::Result<Entity> {
    let embedding_bytes: Option<Vec<u8>> = row.get("embedding")?;
    Ok(Entity {
        id: row.get("id")?,
        name: row.get("name")?,
        entity_type: row.get("entity_type")?,
        embedding: embedding_bytes.map(|b| deserialize_embedding(&b)),
        is_core: row.get("is_core")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    fn storage() -> Storage {
        Storage::open_in_memory(MemoryConfig::default()).unwrap()
    }

    #[test]
    fn create_and_get_fact_roundtrips() {
        let s = storage();
        let fact = s.create_fact("hello world", FactType::World, "test", None, None, None).unwrap();
        let fetched = s.get_fact(fact.id).unwrap().unwrap();
        assert_eq!(fetched.text, "hello world");
        assert_eq!(fetched.access_count, 0);
    }

    #[test]
    fn reinforce_bumps_access_count_and_timestamp() {
        let s = storage();
        let fact = s.create_fact("x", FactType::World, "test", None, None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.reinforce_facts(&[fact.id]).unwrap();
        let after = s.get_fact(fact.id).unwrap().unwrap();
        assert_eq!(after.access_count, 1);
        assert!(after.last_accessed_at >= fact.last_accessed_at);
    }

    #[test]
    fn delete_fact_cascades_entity_refs_and_links() {
        let s = storage();
        let a = s.create_fact("a", FactType::World, "test", None, None, None).unwrap();
        let b = s.create_fact("b", FactType::World, "test", None, None, None).unwrap();
        s.add_entity_ref(a.id, "Alex", "generic", None).unwrap();
        s.create_link(a.id, b.id, LinkType::Entity, 1.0).unwrap();

        s.delete_fact(a.id).unwrap();

        assert!(s.get_fact(a.id).unwrap().is_none());
        assert!(s.get_entity_refs(a.id).unwrap().is_empty());
        assert!(s.get_links(b.id).unwrap().is_empty());
    }

    #[test]
    fn create_entity_is_case_insensitive_insert_or_ignore() {
        let s = storage();
        let e1 = s.create_entity("Alex", "generic", None, false).unwrap();
        let e2 = s.create_entity("alex", "generic", None, false).unwrap();
        assert_eq!(e1.id, e2.id);
    }

    #[test]
    fn link_creation_is_idempotent_on_the_triple() {
        let s = storage();
        let a = s.create_fact("a", FactType::World, "test", None, None, None).unwrap();
        let b = s.create_fact("b", FactType::World, "test", None, None, None).unwrap();
        s.create_link(a.id, b.id, LinkType::Semantic, 0.9).unwrap();
        s.create_link(a.id, b.id, LinkType::Semantic, 0.9).unwrap();
        assert_eq!(s.get_links(a.id).unwrap().len(), 1);
    }

    #[test]
    fn merge_entities_rewrites_canonical_ids() {
        let s = storage();
        let a = s.create_fact("a", FactType::World, "test", None, None, None).unwrap();
        let keep = s.create_entity("Alex", "generic", None, false).unwrap();
        let merged = s.create_entity("Alexander", "generic", None, false).unwrap();
        s.add_entity_ref(a.id, "Alexander", "generic", Some(merged.id)).unwrap();

        let rewritten = s.merge_entities(keep.id, &[merged.id]).unwrap();
        assert_eq!(rewritten, 1);
        assert!(s.get_entity(merged.id).unwrap().is_none());

        let refs = s.get_entity_refs(a.id).unwrap();
        assert_eq!(refs[0].canonical_id, Some(keep.id));
    }
}
