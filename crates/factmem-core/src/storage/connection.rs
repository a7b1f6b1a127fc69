//! Connection setup: WAL journaling, the `sqlite-vec` extension, and the
//! integrity-check-and-recreate-on-open recovery strategy.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};

use rusqlite::Connection;

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::storage::migrations;

static VEC_EXTENSION_REGISTERED: Once = Once::new();

/// Registers the `sqlite-vec` loadable extension as an auto-extension so
/// every connection opened afterward (including in-memory ones used by
/// tests) picks up the `vec0` virtual table module.
fn ensure_vec_extension_registered() {
    VEC_EXTENSION_REGISTERED.call_once(|| unsafe {
        let init_fn = sqlite_vec::sqlite3_vec_init as *const ();
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(init_fn)));
    });
}

fn configure_connection(conn: &Connection, busy_timeout_ms: u32) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", busy_timeout_ms)?;
    conn.pragma_update(None, "cache_size", -64000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    Ok(())
}

/// A self-test query used to detect a corrupted database file on open.
fn integrity_check_passes(conn: &Connection) -> bool {
    conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0))
        .map(|result| result == "ok")
        .unwrap_or(false)
}

fn remove_db_and_siblings(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let candidate = PathBuf::from(format!("{}{suffix}", path.display()));
        if candidate.exists() {
            std::fs::remove_file(&candidate)?;
        }
    }
    Ok(())
}

/// Owns the single writer connection and a pool of one reader connection.
/// All mutation is serialized at the facade layer via an async lock;
/// this type only owns the raw connections and schema lifecycle.
///
/// Both fields are `Arc`-wrapped so the in-memory case can point them at
/// the very same connection: a `:memory:` database is private to the
/// connection that opened it, so two independently-opened in-memory
/// connections are two distinct, unrelated databases. On disk the
/// writer and reader are genuinely separate connections sharing one
/// file through WAL.
pub struct Storage {
    pub(crate) writer: Arc<Mutex<Connection>>,
    pub(crate) reader: Arc<Mutex<Connection>>,
    pub config: MemoryConfig,
}

const BUSY_TIMEOUT_MS: u32 = 30_000;

impl Storage {
    /// Opens (or creates) the database at `db_path`, or an app-local
    /// default location resolved via `directories::ProjectDirs` when
    /// `None` is given.
    pub fn open(db_path: Option<PathBuf>, config: MemoryConfig) -> Result<Self> {
        ensure_vec_extension_registered();

        let path = match db_path {
            Some(p) => p,
            None => Self::default_db_path()?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }

        let writer = Self::open_checked(&path, config.embedding_dim)?;
        configure_connection(&writer, BUSY_TIMEOUT_MS)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if path.exists() {
                let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
            }
        }

        migrations::apply(&writer)?;
        Self::ensure_vec_tables(&writer, config.embedding_dim)?;

        let reader = Connection::open(&path)?;
        configure_connection(&reader, BUSY_TIMEOUT_MS)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
            config,
        })
    }

    /// A `:memory:` connection is private to the connection that opened
    /// it, so two separately-opened in-memory connections are two
    /// distinct databases and WAL sharing does not apply. There is
    /// nothing to gain from separate reader/writer connections here
    /// anyway since nothing outside this process can contend for them,
    /// so both fields point at the same connection behind the same
    /// mutex.
    pub fn open_in_memory(config: MemoryConfig) -> Result<Self> {
        ensure_vec_extension_registered();
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn, BUSY_TIMEOUT_MS)?;
        migrations::apply(&conn)?;
        Self::ensure_vec_tables(&conn, config.embedding_dim)?;

        let shared = Arc::new(Mutex::new(conn));

        Ok(Self {
            writer: Arc::clone(&shared),
            reader: shared,
            config,
        })
    }

    fn open_checked(path: &Path, _dim: usize) -> Result<Connection> {
        if path.exists() {
            if let Ok(conn) = Connection::open(path) {
                if integrity_check_passes(&conn) {
                    return Ok(conn);
                }
                drop(conn);
            }
            tracing::warn!(path = %path.display(), "integrity check failed, recreating database");
            remove_db_and_siblings(path)?;
        }
        Connection::open(path).map_err(|e| MemoryError::Init(e.to_string()))
    }

    /// Reads `meta.embedding_dim`, drops and recreates the vector tables
    /// if it differs from the configured dimension, then writes the
    /// current dimension back. Raises `dim_changed` semantics are left to
    /// the caller: a changed dimension with existing embeddings means
    /// stale vectors must be re-embedded out of band.
    fn ensure_vec_tables(conn: &Connection, dim: usize) -> Result<bool> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT)",
            [],
        )?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'embedding_dim'", [], |r| r.get(0))
            .ok();

        let dim_changed = match &stored {
            Some(s) => s.parse::<usize>().map(|d| d != dim).unwrap_or(true),
            None => false,
        };

        if dim_changed || stored.is_none() {
            conn.execute("DROP TABLE IF EXISTS facts_vec", [])?;
            conn.execute("DROP TABLE IF EXISTS observations_vec", [])?;
            conn.execute("DROP TABLE IF EXISTS entities_vec", [])?;
        }

        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS facts_vec USING vec0(fact_id INTEGER PRIMARY KEY, embedding float[{dim}] distance_metric=cosine)"
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS observations_vec USING vec0(observation_id INTEGER PRIMARY KEY, embedding float[{dim}] distance_metric=cosine)"
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS entities_vec USING vec0(entity_id INTEGER PRIMARY KEY, embedding float[{dim}] distance_metric=cosine)"
            ),
            [],
        )?;

        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('embedding_dim', ?1)",
            [dim.to_string()],
        )?;

        let had_existing_embeddings: bool = conn
            .query_row("SELECT EXISTS(SELECT 1 FROM facts WHERE embedding IS NOT NULL)", [], |r| r.get(0))
            .unwrap_or(false);

        Ok(dim_changed && had_existing_embeddings)
    }

    fn default_db_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "factmem", "factmem")
            .ok_or_else(|| MemoryError::Init("could not resolve platform data directory".into()))?;
        Ok(dirs.data_dir().join("memory.db"))
    }
}

/// Serializes a float vector to the little-endian byte layout `vec0`
/// expects for a `float[D]` column.
pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_roundtrips_through_bytes() {
        let v = vec![0.1f32, -0.5, 1.0, 0.0];
        let bytes = serialize_embedding(&v);
        let back = deserialize_embedding(&bytes);
        for (a, b) in v.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn opens_in_memory_storage() {
        let storage = Storage::open_in_memory(MemoryConfig::default()).unwrap();
        let count: i64 = storage
            .writer
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM facts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
