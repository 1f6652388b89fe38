//! SQLite-backed object store.
//!
//! Each resource is one row: the full object as JSON plus its resource
//! version, so optimistic checks can run in SQL.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use vmctl_id::VmId;

use super::{merge_put, ObjectStore, StoreError};
use crate::resource::{ManagedVm, VmStatus};

/// SQLite object store.
pub struct SqliteObjectStore {
    conn: Mutex<Connection>,
}

impl SqliteObjectStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS managed_vms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                resource_version INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_managed_vms_name ON managed_vms(name);
            "#,
        )?;

        debug!("Object store schema initialized");
        Ok(())
    }

    fn load(conn: &Connection, id: VmId) -> Result<Option<ManagedVm>, StoreError> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM managed_vms WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(Into::into)
    }

    fn save(conn: &Connection, vm: &ManagedVm) -> Result<(), StoreError> {
        let body = serde_json::to_string(vm)?;
        conn.execute(
            r#"
            INSERT INTO managed_vms (id, name, resource_version, body)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                resource_version = excluded.resource_version,
                body = excluded.body
            "#,
            params![
                vm.id.to_string(),
                vm.name,
                vm.resource_version as i64,
                body
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
    async fn get(&self, id: VmId) -> Result<Option<ManagedVm>, StoreError> {
        Self::load(&self.conn(), id)
    }

    async fn put(&self, vm: ManagedVm) -> Result<ManagedVm, StoreError> {
        let conn = self.conn();
        let stored = merge_put(Self::load(&conn, vm.id)?, vm);
        Self::save(&conn, &stored)?;
        Ok(stored)
    }

    async fn patch_status(
        &self,
        id: VmId,
        expected_version: u64,
        status: VmStatus,
    ) -> Result<ManagedVm, StoreError> {
        let conn = self.conn();
        let mut current = Self::load(&conn, id)?.ok_or(StoreError::NotFound(id))?;
        if current.resource_version != expected_version {
            return Err(StoreError::Conflict {
                id,
                expected: expected_version,
                actual: current.resource_version,
            });
        }
        current.status = status;
        current.resource_version += 1;
        Self::save(&conn, &current)?;
        Ok(current)
    }

    async fn list(&self) -> Result<Vec<ManagedVm>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT body FROM managed_vms ORDER BY id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Into::into))
            .collect()
    }

    async fn delete(&self, id: VmId) -> Result<bool, StoreError> {
        let rows = self.conn().execute(
            "DELETE FROM managed_vms WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(rows > 0)
    }
}
