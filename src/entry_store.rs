use log::info;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::entry::{unix_timestamp, Entry, EntryId, DEFAULT_DIR_MODE, S_IFDIR, S_IFMT};
use crate::error::{FsError, FsResult};

/// Schema version tag kept in the SQLite user_version pragma. A store whose
/// tag differs is rejected as incompatible, never silently upgraded.
pub const SCHEMA_VERSION: i64 = 20190806;

/// Durable side of the namespace: one `entries` table with a self-referential
/// parent foreign key and cascading delete. All access goes through
/// spawn_blocking so store calls only suspend the calling task.
#[derive(Clone)]
pub struct EntryStore {
    conn: Arc<Mutex<Connection>>,
}

impl EntryStore {
    pub fn open(db_path: impl AsRef<str>) -> FsResult<Self> {
        let conn = Connection::open_with_flags(
            db_path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> FsResult<()> {
        // foreign_keys must be on or the parent_id cascade never fires
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> FsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> FsResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn_guard = conn
                .lock()
                .map_err(|e| FsError::internal(format!("conn lock poisoned: {}", e)))?;
            f(&conn_guard)
        })
        .await
        .map_err(|e| FsError::internal(format!("db task join failed: {}", e)))?
    }

    /// Create a fresh empty namespace: drop any existing table, recreate the
    /// schema, stamp the version tag and insert the root row (the sole entry
    /// whose parent_id is its own id).
    pub async fn init_schema(&self) -> FsResult<EntryId> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "DROP TABLE IF EXISTS entries;

                 CREATE TABLE entries (
                    id TEXT NOT NULL PRIMARY KEY,
                    content_ref TEXT,
                    name TEXT NOT NULL,
                    size INTEGER NOT NULL DEFAULT 0,
                    parent_id TEXT NOT NULL
                        REFERENCES entries(id)
                        ON UPDATE CASCADE ON DELETE CASCADE
                        DEFERRABLE INITIALLY DEFERRED,
                    created_at REAL NOT NULL DEFAULT (strftime('%s','now')),
                    modified_at REAL NOT NULL DEFAULT (strftime('%s','now')),
                    mode INTEGER NOT NULL
                 );

                 CREATE UNIQUE INDEX idx_entries_name_parent
                    ON entries(name, parent_id);",
            )?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

            let root_id = Uuid::new_v4();
            let now = unix_timestamp();
            conn.execute(
                "INSERT INTO entries (id, content_ref, name, size, parent_id, created_at, modified_at, mode)
                 VALUES (?1, NULL, '', 0, ?1, ?2, ?2, ?3)",
                params![root_id.to_string(), now, DEFAULT_DIR_MODE as i64],
            )?;

            info!("initialized fresh namespace store, root {}", root_id);
            Ok(root_id)
        })
        .await
    }

    /// Check that the store holds exactly one self-referencing directory row
    /// and carries the expected schema version. Anything else is corruption
    /// and fatal to mounting.
    pub async fn validate(&self) -> FsResult<()> {
        self.with_conn(|conn| {
            let roots: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM entries
                     WHERE parent_id = id AND (mode & ?1) = ?2",
                    params![S_IFMT as i64, S_IFDIR as i64],
                    |row| row.get(0),
                )
                .map_err(|e| FsError::corrupted(format!("no valid root mountpoint: {}", e)))?;
            if roots != 1 {
                return Err(FsError::corrupted(format!(
                    "expected exactly one root entry, found {}",
                    roots
                )));
            }

            let user_version: i64 =
                conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            if user_version != SCHEMA_VERSION {
                return Err(FsError::corrupted(format!(
                    "inconsistent schema version, current engine is {} vs store {}",
                    SCHEMA_VERSION, user_version
                )));
            }
            Ok(())
        })
        .await
    }

    /// Full table scan, for cache rebuilds.
    pub async fn select_all(&self) -> FsResult<Vec<Entry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content_ref, name, size, parent_id, created_at, modified_at, mode
                 FROM entries",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (id, content_ref, name, size, parent_id, created_at, modified_at, mode) = row?;
                entries.push(Entry {
                    id: parse_id(&id)?,
                    parent_id: parse_id(&parent_id)?,
                    name,
                    mode: mode as u32,
                    size: size.max(0) as u64,
                    content_ref,
                    created_at,
                    modified_at,
                    children: BTreeMap::new(),
                });
            }
            Ok(entries)
        })
        .await
    }

    pub async fn insert(&self, entry: Entry) -> FsResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entries (id, content_ref, name, size, parent_id, created_at, modified_at, mode)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id.to_string(),
                    entry.content_ref,
                    entry.name,
                    entry.size as i64,
                    entry.parent_id.to_string(),
                    entry.created_at,
                    entry.modified_at,
                    entry.mode as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_mtime(&self, id: EntryId, mtime: f64) -> FsResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE entries SET modified_at = ?2 WHERE id = ?1",
                params![id.to_string(), mtime],
            )?;
            Ok(())
        })
        .await
    }

    /// Move a row under a new parent and name.
    pub async fn relink(&self, id: EntryId, parent_id: EntryId, name: String) -> FsResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE entries SET name = ?2, parent_id = ?3 WHERE id = ?1",
                params![id.to_string(), name, parent_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a row; the foreign key cascade removes every descendant row in
    /// the same statement.
    pub async fn delete(&self, id: EntryId) -> FsResult<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM entries WHERE id = ?1", params![id.to_string()])?;
            Ok(())
        })
        .await
    }

    /// Live entry count, straight from the table.
    pub async fn count(&self) -> FsResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

fn parse_id(raw: &str) -> FsResult<EntryId> {
    Uuid::parse_str(raw).map_err(|e| FsError::corrupted(format!("malformed entry id {:?}: {}", raw, e)))
}
