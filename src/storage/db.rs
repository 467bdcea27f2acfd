use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Context as _, Result};
use chrono::{SubsecRound, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, ObjectMeta, Time};
use log::debug;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{
    context::Context,
    types::{ResourceKey, StoredResource},
};
use crate::storage::store::{LabelSelector, ResourceStore, StoreError, selector_matches};

/// Current time at the one-second precision `Time` serializes with.
fn now() -> Time {
    Time(Utc::now().trunc_subsecs(0))
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(format!("sqlite: {err}"))
    }
}

/// Resource store on a single SQLite table.
///
/// Optimistic concurrency is emulated with an integer version column that is
/// bumped on every write and compared against the caller's `resourceVersion`.
#[derive(Clone)]
pub struct SqliteResourceStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

struct StoredRow {
    version: i64,
    metadata: ObjectMeta,
    body: Value,
    status: Value,
}

impl SqliteResourceStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let created = !db_path.exists();
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_context(|| format!("failed to open SQLite database at {}", db_path.display()))?;

        Self::configure_connection(&conn, true)?;
        Self::init_schema(&conn)?;
        Self::enforce_permissions(db_path, created)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(db_path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite")?;
        Self::configure_connection(&conn, false)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|err| StoreError::Unavailable(format!("SQLite connection poisoned: {err}")))
    }

    fn configure_connection(conn: &Connection, wal: bool) -> Result<()> {
        if wal {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set SQLite busy timeout")?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                kind TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                resource_version INTEGER NOT NULL,
                metadata_json TEXT NOT NULL,
                body_json TEXT NOT NULL,
                status_json TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, namespace, name)
            );
            "#,
        )
        .context("failed to create resources table")?;
        Ok(())
    }

    #[cfg(unix)]
    fn enforce_permissions(db_path: &Path, created: bool) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let desired = fs::Permissions::from_mode(0o600);
        if created {
            fs::set_permissions(db_path, desired)?;
        } else {
            let current = fs::metadata(db_path)?.permissions();
            if current.mode() & 0o177 != 0 {
                fs::set_permissions(db_path, desired)?;
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn enforce_permissions(_db_path: &Path, _created: bool) -> Result<()> {
        Ok(())
    }

    fn key_of<R: StoredResource>(resource: &R) -> Result<ResourceKey, StoreError> {
        let key = resource.resource_key();
        if key.name.is_empty() || key.namespace.is_empty() {
            return Err(StoreError::Invalid {
                kind: R::kind(&()).to_string(),
                key,
                reason: "namespace and name are required".into(),
            });
        }
        Ok(key)
    }

    /// Splits a resource into metadata, the remaining body, and status.
    fn split<R: StoredResource>(resource: &R) -> Result<(ObjectMeta, Value, Value), StoreError> {
        let mut body = serde_json::to_value(resource)?;
        let object = body
            .as_object_mut()
            .ok_or_else(|| StoreError::Serialization("resource is not a JSON object".into()))?;
        object.remove("metadata");
        let status = object.remove("status").unwrap_or(Value::Null);
        Ok((resource.meta().clone(), body, status))
    }

    fn assemble<R: StoredResource>(row: &StoredRow) -> Result<R, StoreError> {
        let mut metadata = row.metadata.clone();
        metadata.resource_version = Some(row.version.to_string());
        let mut value = row.body.clone();
        let object = value
            .as_object_mut()
            .ok_or_else(|| StoreError::Serialization("stored body is not a JSON object".into()))?;
        object.insert("metadata".into(), serde_json::to_value(&metadata)?);
        if !row.status.is_null() {
            object.insert("status".into(), row.status.clone());
        }
        Ok(serde_json::from_value(value)?)
    }

    fn load(tx: &Transaction<'_>, kind: &str, key: &ResourceKey) -> Result<Option<StoredRow>, StoreError> {
        let raw = tx
            .query_row(
                r#"
                SELECT resource_version, metadata_json, body_json, status_json
                FROM resources WHERE kind = ?1 AND namespace = ?2 AND name = ?3
                "#,
                params![kind, key.namespace, key.name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        raw.map(|(version, metadata, body, status)| -> Result<StoredRow, StoreError> {
            Ok(StoredRow {
                version,
                metadata: serde_json::from_str(&metadata)?,
                body: serde_json::from_str(&body)?,
                status: serde_json::from_str(&status)?,
            })
        })
        .transpose()
    }

    fn save(tx: &Transaction<'_>, kind: &str, key: &ResourceKey, row: &StoredRow) -> Result<(), StoreError> {
        tx.execute(
            r#"
            INSERT INTO resources (
                kind, namespace, name, resource_version, metadata_json, body_json, status_json, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(kind, namespace, name) DO UPDATE SET
                resource_version = excluded.resource_version,
                metadata_json = excluded.metadata_json,
                body_json = excluded.body_json,
                status_json = excluded.status_json,
                updated_at = excluded.updated_at
            "#,
            params![
                kind,
                key.namespace,
                key.name,
                row.version,
                serde_json::to_string(&row.metadata)?,
                serde_json::to_string(&row.body)?,
                serde_json::to_string(&row.status)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn remove(tx: &Transaction<'_>, kind: &str, key: &ResourceKey) -> Result<(), StoreError> {
        tx.execute(
            "DELETE FROM resources WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            params![kind, key.namespace, key.name],
        )?;
        Ok(())
    }

    fn not_found(kind: &str, key: &ResourceKey) -> StoreError {
        StoreError::NotFound {
            kind: kind.to_string(),
            key: key.clone(),
        }
    }

    fn check_version(
        kind: &str,
        key: &ResourceKey,
        provided: Option<&str>,
        stored: i64,
    ) -> Result<(), StoreError> {
        match provided {
            Some(raw) if raw == stored.to_string() => Ok(()),
            Some(raw) => Err(StoreError::Conflict {
                kind: kind.to_string(),
                key: key.clone(),
                expected: raw.to_string(),
                actual: stored.to_string(),
            }),
            None => Err(StoreError::Invalid {
                kind: kind.to_string(),
                key: key.clone(),
                reason: "resourceVersion must be specified for an update".into(),
            }),
        }
    }

    fn record_manager(metadata: &mut ObjectMeta, field_manager: &str, subresource: Option<&str>) {
        let entries = metadata.managed_fields.get_or_insert_with(Vec::new);
        entries.retain(|entry| {
            !(entry.manager.as_deref() == Some(field_manager)
                && entry.subresource.as_deref() == subresource)
        });
        entries.push(ManagedFieldsEntry {
            manager: Some(field_manager.to_string()),
            operation: Some("Apply".into()),
            subresource: subresource.map(str::to_string),
            time: Some(now()),
            ..ManagedFieldsEntry::default()
        });
    }

    /// Copies the caller-owned metadata fields onto the stored metadata.
    fn merge_metadata(stored: &mut ObjectMeta, incoming: &ObjectMeta) {
        stored.finalizers = incoming.finalizers.clone().filter(|list| !list.is_empty());
        stored.labels = incoming.labels.clone();
        stored.annotations = incoming.annotations.clone();
        stored.owner_references = incoming.owner_references.clone();
    }

    /// Full write shared by `update` and `apply`; returns the resulting resource.
    fn write_resource<R: StoredResource>(
        &self,
        ctx: &Context,
        resource: &R,
        field_manager: Option<&str>,
    ) -> Result<R, StoreError> {
        ctx.check()?;
        let kind = R::kind(&());
        let key = Self::key_of(resource)?;
        let (incoming, body, _) = Self::split(resource)?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut row = Self::load(&tx, &kind, &key)?.ok_or_else(|| Self::not_found(&kind, &key))?;
        match field_manager {
            Some(manager) => Self::record_manager(&mut row.metadata, manager, None),
            None => Self::check_version(&kind, &key, incoming.resource_version.as_deref(), row.version)?,
        }
        Self::merge_metadata(&mut row.metadata, &incoming);
        row.body = body;
        row.version += 1;

        let finalized = row.metadata.deletion_timestamp.is_some()
            && row.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if finalized {
            debug!("[store] {kind} {key} has no finalizers left; removing");
            Self::remove(&tx, &kind, &key)?;
        } else {
            Self::save(&tx, &kind, &key, &row)?;
        }
        tx.commit()?;
        Self::assemble(&row)
    }

    fn write_status<R: StoredResource>(
        &self,
        ctx: &Context,
        resource: &R,
        field_manager: Option<&str>,
    ) -> Result<R, StoreError> {
        ctx.check()?;
        let kind = R::kind(&());
        let key = Self::key_of(resource)?;
        let (incoming, _, status) = Self::split(resource)?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut row = Self::load(&tx, &kind, &key)?.ok_or_else(|| Self::not_found(&kind, &key))?;
        match field_manager {
            Some(manager) => Self::record_manager(&mut row.metadata, manager, Some("status")),
            None => Self::check_version(&kind, &key, incoming.resource_version.as_deref(), row.version)?,
        }
        row.status = status;
        row.version += 1;
        Self::save(&tx, &kind, &key, &row)?;
        tx.commit()?;
        debug!("[store] {kind} {key} status written at version {}", row.version);
        Self::assemble(&row)
    }
}

impl ResourceStore for SqliteResourceStore {
    fn get<R: StoredResource>(&self, ctx: &Context, key: &ResourceKey) -> Result<R, StoreError> {
        ctx.check()?;
        let kind = R::kind(&());
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let row = Self::load(&tx, &kind, key)?.ok_or_else(|| Self::not_found(&kind, key))?;
        Self::assemble(&row)
    }

    fn list<R: StoredResource>(
        &self,
        ctx: &Context,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<R>, StoreError> {
        ctx.check()?;
        let kind = R::kind(&());
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT resource_version, metadata_json, body_json, status_json
            FROM resources WHERE kind = ?1 AND namespace = ?2
            ORDER BY name
            "#,
        )?;
        let rows = stmt.query_map(params![kind, namespace], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut resources = Vec::new();
        for raw in rows {
            let (version, metadata, body, status) = raw?;
            let row = StoredRow {
                version,
                metadata: serde_json::from_str(&metadata)?,
                body: serde_json::from_str(&body)?,
                status: serde_json::from_str(&status)?,
            };
            let resource: R = Self::assemble(&row)?;
            if selector.is_none_or(|selector| selector_matches(selector, &resource.labels())) {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    fn create<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError> {
        ctx.check()?;
        let kind = R::kind(&());
        let key = Self::key_of(resource)?;
        let (mut metadata, body, status) = Self::split(resource)?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        if Self::load(&tx, &kind, &key)?.is_some() {
            return Err(StoreError::AlreadyExists {
                kind: kind.to_string(),
                key,
            });
        }
        metadata.uid.get_or_insert_with(|| Uuid::new_v4().to_string());
        metadata
            .creation_timestamp
            .get_or_insert_with(now);
        metadata.deletion_timestamp = None;
        let row = StoredRow {
            version: 1,
            metadata,
            body,
            status,
        };
        Self::save(&tx, &kind, &key, &row)?;
        tx.commit()?;
        debug!("[store] created {kind} {key}");
        Self::assemble(&row)
    }

    fn delete<R: StoredResource>(&self, ctx: &Context, key: &ResourceKey) -> Result<(), StoreError> {
        ctx.check()?;
        let kind = R::kind(&());
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut row = Self::load(&tx, &kind, key)?.ok_or_else(|| Self::not_found(&kind, key))?;

        let has_finalizers = row
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|list| !list.is_empty());
        if has_finalizers {
            if row.metadata.deletion_timestamp.is_none() {
                row.metadata.deletion_timestamp = Some(now());
                row.version += 1;
                Self::save(&tx, &kind, key, &row)?;
                debug!("[store] {kind} {key} marked for deletion");
            }
        } else {
            Self::remove(&tx, &kind, key)?;
            debug!("[store] deleted {kind} {key}");
        }
        tx.commit()?;
        Ok(())
    }

    fn update_status<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError> {
        self.write_status(ctx, resource, None)
    }

    fn update<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError> {
        self.write_resource(ctx, resource, None)
    }

    fn apply_status<R: StoredResource>(
        &self,
        ctx: &Context,
        resource: &R,
        field_manager: &str,
    ) -> Result<R, StoreError> {
        self.write_status(ctx, resource, Some(field_manager))
    }

    fn apply<R: StoredResource>(
        &self,
        ctx: &Context,
        resource: &R,
        field_manager: &str,
    ) -> Result<R, StoreError> {
        self.write_resource(ctx, resource, Some(field_manager))
    }
}
