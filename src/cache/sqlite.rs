//! SQLite-backed persistent cache

use super::{Blob, Blobs, CacheBackend, CacheEntry, CacheError, CacheSummary};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA_VERSION: i64 = 2;

fn init_schema(conn: &Connection) -> Result<(), CacheError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version != SCHEMA_VERSION {
        // Older layouts are dropped, not migrated
        conn.execute_batch(
            "DROP TABLE IF EXISTS cache_blobs;
             DROP TABLE IF EXISTS cache_entries;",
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_blobs (
            key TEXT NOT NULL,
            path TEXT NOT NULL,
            content BLOB NOT NULL,
            mode INTEGER NOT NULL,
            link_target TEXT,
            PRIMARY KEY(key, path),
            FOREIGN KEY(key) REFERENCES cache_entries(key) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_cache_entries_created ON cache_entries(created_at);
        "#,
    )?;
    Ok(())
}

/// Cache persisted in a single SQLite database
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Open or create the cache database at `path`
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the cache database inside a cache directory
    pub fn open_dir(dir: &Path) -> Result<Self, CacheError> {
        Self::open(&dir.join("cache.db"))
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Task("cache database lock poisoned".into()))
    }
}

fn utf8_path(path: &Path) -> Result<&str, CacheError> {
    path.to_str()
        .ok_or_else(|| CacheError::InvalidPath(path.display().to_string()))
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl CacheBackend for SqliteCache {
    fn load(&self, key: &str) -> Result<Option<Arc<CacheEntry>>, CacheError> {
        let conn = self.conn()?;

        let created_at: Option<i64> = conn
            .query_row(
                "SELECT created_at FROM cache_entries WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(created_at) = created_at else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare("SELECT path, content, mode, link_target FROM cache_blobs WHERE key = ?1")?;
        let blobs = stmt
            .query_map([key], |row| {
                let path: String = row.get(0)?;
                let link_target: Option<String> = row.get(3)?;
                let blob = match link_target {
                    Some(target) => Blob::Symlink {
                        target: PathBuf::from(target),
                    },
                    None => Blob::File {
                        content: row.get(1)?,
                        mode: row.get(2)?,
                    },
                };
                Ok((PathBuf::from(path), blob))
            })?
            .collect::<Result<Blobs, _>>()?;

        Ok(Some(Arc::new(CacheEntry {
            key: key.to_string(),
            blobs,
            created_at: millis_to_datetime(created_at),
        })))
    }

    fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM cache_blobs WHERE key = ?1", [&entry.key])?;
        tx.execute(
            "INSERT INTO cache_entries (key, created_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET created_at = excluded.created_at",
            (&entry.key, entry.created_at.timestamp_millis()),
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO cache_blobs (key, path, content, mode, link_target)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (path, blob) in &entry.blobs {
                let path = utf8_path(path)?;
                match blob {
                    Blob::File { content, mode } => {
                        insert.execute((&entry.key, path, content, mode, None::<&str>))?;
                    }
                    Blob::Symlink { target } => {
                        let target = utf8_path(target)?;
                        insert.execute((&entry.key, path, &[] as &[u8], 0u32, Some(target)))?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<CacheSummary>, CacheError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT e.key, e.created_at, COUNT(b.path), COALESCE(SUM(COALESCE(LENGTH(b.link_target), LENGTH(b.content))), 0)
             FROM cache_entries e
             LEFT JOIN cache_blobs b ON b.key = e.key
             GROUP BY e.key
             ORDER BY e.created_at DESC",
        )?;

        let summaries = stmt
            .query_map([], |row| {
                let files: i64 = row.get(2)?;
                let bytes: i64 = row.get(3)?;
                Ok(CacheSummary {
                    key: row.get(0)?,
                    created_at: millis_to_datetime(row.get(1)?),
                    files: files as usize,
                    bytes: bytes as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(summaries)
    }

    fn clear(&self) -> Result<usize, CacheError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM cache_blobs", [])?;
        let removed = conn.execute("DELETE FROM cache_entries", [])?;
        Ok(removed)
    }
}
