use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_common::{CloudKind, ClusterKey, ClusterRecord, ClusterStatus};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, params_from_iter};

use super::store::ClusterStore;
use crate::errors::StoreError;

/// Async-safe handle to the cluster database.
///
/// Wraps `ClusterDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ClusterDb>>,
}

impl DbHandle {
    pub fn new(db: ClusterDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&ClusterDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| StoreError::Backend(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct ClusterDb {
    conn: Connection,
}

const COLUMNS: &str = "project_id, tenant_id, cloud_kind, name, status, resource_group, location, properties, failure_reason, version, created_at, modified_at";

impl ClusterDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS clusters (
                    project_id TEXT NOT NULL,
                    tenant_id TEXT NOT NULL,
                    cloud_kind TEXT NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'New',
                    resource_group TEXT,
                    location TEXT,
                    properties TEXT NOT NULL DEFAULT '{}',
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    modified_at TEXT NOT NULL,
                    PRIMARY KEY (project_id, tenant_id)
                );

                CREATE INDEX IF NOT EXISTS idx_clusters_tenant ON clusters(tenant_id);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migration; only "duplicate column" is tolerated.
        match self
            .conn
            .execute("ALTER TABLE clusters ADD COLUMN failure_reason TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add failure_reason column: {}", e)),
        }
        Ok(())
    }

    pub fn get(&self, key: &ClusterKey) -> Result<ClusterRecord, StoreError> {
        let sql = format!(
            "SELECT {} FROM clusters WHERE project_id = ?1 AND tenant_id = ?2",
            COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![key.project_id, key.tenant_id], ClusterRow::from_row)
            .optional()
            .context("Failed to query cluster")?;
        match row {
            Some(row) => row.into_record(),
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    pub fn get_all(
        &self,
        tenant_id: &str,
        project_ids: &HashSet<String>,
    ) -> Result<Vec<ClusterRecord>, StoreError> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..project_ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM clusters WHERE tenant_id = ?1 AND project_id IN ({}) ORDER BY project_id",
            COLUMNS, placeholders
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_all")?;
        let values = std::iter::once(tenant_id.to_string()).chain(project_ids.iter().cloned());
        let rows = stmt
            .query_map(params_from_iter(values), ClusterRow::from_row)
            .context("Failed to query clusters")?;
        let mut records = Vec::new();
        for row in rows {
            let row = row.context("Failed to read cluster row")?;
            records.push(row.into_record()?);
        }
        Ok(records)
    }

    pub fn insert(&self, record: &ClusterRecord) -> Result<(), StoreError> {
        let properties =
            serde_json::to_string(&record.properties).context("Failed to encode properties")?;
        let result = self.conn.execute(
            &format!(
                "INSERT INTO clusters ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                COLUMNS
            ),
            params![
                record.project_id,
                record.tenant_id,
                record.cloud_kind.as_str(),
                record.name,
                record.status.as_str(),
                record.resource_group,
                record.location,
                properties,
                record.failure_reason,
                record.version as i64,
                record.created_at.to_rfc3339(),
                record.modified_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists {
                    key: record.key().to_string(),
                })
            }
            Err(e) => Err(StoreError::Backend(
                anyhow::Error::new(e).context("Failed to insert cluster"),
            )),
        }
    }

    pub fn delete(&self, key: &ClusterKey) -> Result<(), StoreError> {
        let count = self
            .conn
            .execute(
                "DELETE FROM clusters WHERE project_id = ?1 AND tenant_id = ?2",
                params![key.project_id, key.tenant_id],
            )
            .context("Failed to delete cluster")?;
        if count == 0 {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Single-statement compare-and-swap on `version`. `created_at`,
    /// `cloud_kind` and the key columns are never rewritten.
    pub fn replace(&self, record: &ClusterRecord) -> Result<ClusterRecord, StoreError> {
        let properties =
            serde_json::to_string(&record.properties).context("Failed to encode properties")?;
        let count = self
            .conn
            .execute(
                "UPDATE clusters
                 SET name = ?1, status = ?2, resource_group = ?3, location = ?4,
                     properties = ?5, failure_reason = ?6, version = version + 1,
                     modified_at = MAX(?7, modified_at)
                 WHERE project_id = ?8 AND tenant_id = ?9 AND version = ?10",
                params![
                    record.name,
                    record.status.as_str(),
                    record.resource_group,
                    record.location,
                    properties,
                    record.failure_reason,
                    Utc::now().to_rfc3339(),
                    record.project_id,
                    record.tenant_id,
                    record.version as i64,
                ],
            )
            .context("Failed to replace cluster")?;

        let key = record.key();
        let stored = self.get(&key)?;
        if count == 0 {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: record.version,
                actual: stored.version,
            });
        }
        Ok(stored)
    }
}

/// Raw row before enum and timestamp parsing.
struct ClusterRow {
    project_id: String,
    tenant_id: String,
    cloud_kind: String,
    name: String,
    status: String,
    resource_group: Option<String>,
    location: Option<String>,
    properties: String,
    failure_reason: Option<String>,
    version: i64,
    created_at: String,
    modified_at: String,
}

impl ClusterRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: row.get(0)?,
            tenant_id: row.get(1)?,
            cloud_kind: row.get(2)?,
            name: row.get(3)?,
            status: row.get(4)?,
            resource_group: row.get(5)?,
            location: row.get(6)?,
            properties: row.get(7)?,
            failure_reason: row.get(8)?,
            version: row.get(9)?,
            created_at: row.get(10)?,
            modified_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<ClusterRecord, StoreError> {
        let cloud_kind = CloudKind::from_str(&self.cloud_kind).map_err(|e| anyhow::anyhow!(e))?;
        let status = ClusterStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?;
        let properties =
            serde_json::from_str(&self.properties).context("Failed to decode properties")?;
        Ok(ClusterRecord {
            project_id: self.project_id,
            tenant_id: self.tenant_id,
            cloud_kind,
            name: self.name,
            status,
            resource_group: self.resource_group,
            location: self.location,
            properties,
            failure_reason: self.failure_reason,
            version: self.version as u64,
            created_at: parse_timestamp(&self.created_at)?,
            modified_at: parse_timestamp(&self.modified_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", value))
        .map_err(StoreError::Backend)
}

/// `ClusterStore` backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
}

impl SqliteStore {
    pub fn new(db: ClusterDb) -> Self {
        Self {
            db: DbHandle::new(db),
        }
    }

    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(ClusterDb::new(path)?))
    }
}

#[async_trait]
impl ClusterStore for SqliteStore {
    async fn get(&self, key: &ClusterKey) -> Result<ClusterRecord, StoreError> {
        let key = key.clone();
        self.db.call(move |db| db.get(&key)).await
    }

    async fn get_all(
        &self,
        tenant_id: &str,
        project_ids: &HashSet<String>,
    ) -> Result<Vec<ClusterRecord>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let project_ids = project_ids.clone();
        self.db
            .call(move |db| db.get_all(&tenant_id, &project_ids))
            .await
    }

    async fn insert(&self, record: &ClusterRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.db.call(move |db| db.insert(&record)).await
    }

    async fn delete(&self, key: &ClusterKey) -> Result<(), StoreError> {
        let key = key.clone();
        self.db.call(move |db| db.delete(&key)).await
    }

    async fn replace(&self, record: &ClusterRecord) -> Result<ClusterRecord, StoreError> {
        let record = record.clone();
        self.db.call(move |db| db.replace(&record)).await
    }
}
