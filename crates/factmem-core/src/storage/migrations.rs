//! Schema migrations, applied in order and tracked in
//! `schema_migrations`. The vector tables are not part of a migration:
//! they are dimension-parameterized and managed separately in
//! [`crate::storage::connection`].

use rusqlite::Connection;

use crate::error::Result;

pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "facts, entities, links, observations, dreams, checkpoints",
    up: r#"
        CREATE TABLE IF NOT EXISTS facts (
            id INTEGER PRIMARY KEY,
            text TEXT NOT NULL,
            fact_type TEXT NOT NULL DEFAULT 'world',
            embedding BLOB,
            source_type TEXT NOT NULL,
            source_ref TEXT,
            created_at TEXT NOT NULL,
            happened_at TEXT,
            last_accessed_at TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0,
            consolidated_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_facts_created ON facts(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_facts_consolidated ON facts(consolidated_at);
        CREATE INDEX IF NOT EXISTS idx_facts_happened ON facts(happened_at);

        CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
            text,
            content='facts',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
            INSERT INTO facts_fts(rowid, text) VALUES (new.id, new.text);
        END;

        CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, text) VALUES('delete', old.id, old.text);
        END;

        CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, text) VALUES('delete', old.id, old.text);
            INSERT INTO facts_fts(rowid, text) VALUES (new.id, new.text);
        END;

        CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL COLLATE NOCASE,
            entity_type TEXT NOT NULL DEFAULT 'generic',
            embedding BLOB,
            is_core INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(name, entity_type)
        );

        CREATE TABLE IF NOT EXISTS entity_refs (
            id INTEGER PRIMARY KEY,
            fact_id INTEGER NOT NULL REFERENCES facts(id),
            name TEXT NOT NULL,
            entity_type TEXT NOT NULL DEFAULT 'generic',
            canonical_id INTEGER REFERENCES entities(id)
        );

        CREATE INDEX IF NOT EXISTS idx_entity_refs_fact ON entity_refs(fact_id);
        CREATE INDEX IF NOT EXISTS idx_entity_refs_name ON entity_refs(name);
        CREATE INDEX IF NOT EXISTS idx_entity_refs_canonical ON entity_refs(canonical_id);

        CREATE TABLE IF NOT EXISTS fact_links (
            id INTEGER PRIMARY KEY,
            source_fact_id INTEGER NOT NULL REFERENCES facts(id),
            target_fact_id INTEGER NOT NULL REFERENCES facts(id),
            link_type TEXT NOT NULL,
            weight REAL NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(source_fact_id, target_fact_id, link_type)
        );

        CREATE INDEX IF NOT EXISTS idx_fact_links_source ON fact_links(source_fact_id);
        CREATE INDEX IF NOT EXISTS idx_fact_links_target ON fact_links(target_fact_id);

        CREATE TABLE IF NOT EXISTS observations (
            id INTEGER PRIMARY KEY,
            summary TEXT NOT NULL,
            embedding BLOB,
            evidence_count INTEGER NOT NULL DEFAULT 0,
            source_fact_ids TEXT NOT NULL DEFAULT '[]',
            history TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_accessed_at TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
            summary,
            content='observations',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS observations_ai AFTER INSERT ON observations BEGIN
            INSERT INTO observations_fts(rowid, summary) VALUES (new.id, new.summary);
        END;

        CREATE TRIGGER IF NOT EXISTS observations_ad AFTER DELETE ON observations BEGIN
            INSERT INTO observations_fts(observations_fts, rowid, summary) VALUES('delete', old.id, old.summary);
        END;

        CREATE TRIGGER IF NOT EXISTS observations_au AFTER UPDATE ON observations BEGIN
            INSERT INTO observations_fts(observations_fts, rowid, summary) VALUES('delete', old.id, old.summary);
            INSERT INTO observations_fts(rowid, summary) VALUES (new.id, new.summary);
        END;

        CREATE TABLE IF NOT EXISTS dreams (
            id INTEGER PRIMARY KEY,
            bridge TEXT NOT NULL,
            insight TEXT NOT NULL,
            embedding BLOB,
            source_fact_ids TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dreams_created ON dreams(created_at DESC);

        CREATE TABLE IF NOT EXISTS temporal_checkpoints (
            entity_id INTEGER NOT NULL REFERENCES entities(id),
            window_end TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            PRIMARY KEY (entity_id, window_end)
        );
    "#,
}];

pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
        [],
    )?;

    let current: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| r.get(0))
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        tracing::info!(version = migration.version, description = migration.description, "applying migration");
        conn.execute_batch(migration.up)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            [migration.version],
        )?;
    }

    Ok(())
}
