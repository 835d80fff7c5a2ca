use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use audioshelf_core::{BookContributor, BookSeries, DimensionRef, ReadingProgress};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use tracing::debug;

use super::conflict::{ConflictDecision, ConflictDetector, LocalSyncState};
use super::palette::{Palette, Rgb};
use super::records::{
    EntityFamily, IncomingRecord, RecordError, RelationRows, SyncRecord, format_timestamp,
    incoming_from_value, now_ms,
};
use crate::error::ErrorKind;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const LAST_SUCCESSFUL_SYNC_KEY: &str = "last_successful_sync";
const ROW_COLUMNS: &str = "id, name, data, image_ref, updated_at, dirty, local_updated_at, conflict_server_at, conflict_data, pending_delete";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("malformed stored json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("invalid operation kind: {0}")]
    InvalidOperationKind(String),
    #[error("invalid operation status: {0}")]
    InvalidOperationStatus(String),
    #[error("invalid cover state: {0}")]
    InvalidCoverState(String),
    #[error("{family} {id} not found")]
    NotFound { family: EntityFamily, id: String },
    #[error("{family} {id} has no captured server version")]
    NoConflict { family: EntityFamily, id: String },
    #[error("local changes must be a json object")]
    InvalidPatch,
    #[error("pending operation {0} not found")]
    MissingOperation(i64),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Json(_)
            | StoreError::Record(_)
            | StoreError::InvalidPatch
            | StoreError::NotFound { .. }
            | StoreError::NoConflict { .. } => ErrorKind::Data,
            _ => ErrorKind::Storage,
        }
    }
}

/// One row of a family table, with its sync markers.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub family: EntityFamily,
    pub id: String,
    pub name: String,
    pub data: Value,
    pub image_ref: Option<String>,
    /// Last server version applied or acknowledged, unix ms.
    pub updated_at: i64,
    pub dirty: bool,
    pub local_updated_at: Option<i64>,
    pub conflict_server_at: Option<i64>,
    /// Server snapshot captured when the conflict was flagged.
    pub conflict_data: Option<Value>,
    pub pending_delete: bool,
}

impl EntityRow {
    pub fn is_conflicted(&self) -> bool {
        self.conflict_server_at.is_some()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageOutcome {
    pub upserted: usize,
    pub deleted: usize,
    pub preserved: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub covers_enqueued: usize,
    /// Cached cover files whose entity or image reference is gone.
    pub orphaned_covers: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorState {
    pub cursor: Option<String>,
    /// `updatedAfter` of the run the cursor belongs to.
    pub run_updated_after: Option<i64>,
    /// Start of the run the cursor belongs to; becomes the watermark when a
    /// resumed run finishes.
    pub run_started_at: Option<i64>,
    pub last_synced_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub family: EntityFamily,
    pub entity_id: String,
    pub name: String,
}

#[derive(Debug)]
struct ExistingRow {
    state: LocalSyncState,
    image_ref: Option<String>,
}

/// SQLite-backed local library: entity tables, junction tables, sync cursors,
/// the push queue, the cover queue and the search index.
pub struct LibraryStore {
    pool: SqlitePool,
}

impl LibraryStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        let path = default_db_path()?;
        Self::open(&path).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Applies one pulled page in a single transaction: tombstones first, then the
    /// conflict gate and upsert for every record, then the cover queue.
    pub async fn apply_page(
        &self,
        family: EntityFamily,
        records: &[IncomingRecord],
        deleted_ids: &[String],
        detector: &ConflictDetector,
    ) -> Result<PageOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = PageOutcome {
            orphaned_covers: delete_entities(&mut tx, family, deleted_ids).await?,
            deleted: deleted_ids.len(),
            ..PageOutcome::default()
        };
        let tombstoned: HashSet<&str> = deleted_ids.iter().map(String::as_str).collect();

        let mut existing = HashMap::new();
        for record in records {
            if let Some(row) = load_existing(&mut tx, family, &record.id).await? {
                existing.insert(record.id.clone(), row);
            }
        }

        let mut cover_changes = Vec::new();
        for record in records {
            if tombstoned.contains(record.id.as_str()) {
                continue;
            }
            let local = existing.get(&record.id);
            match detector.decide(local.map(|row| &row.state), record.updated_at) {
                ConflictDecision::PreserveLocal => {
                    debug!(family = %family, entity_id = %record.id, "local edit is newer, keeping it");
                    outcome.preserved += 1;
                }
                ConflictDecision::Skip => outcome.skipped += 1,
                ConflictDecision::Conflict { server_at } => {
                    debug!(family = %family, entity_id = %record.id, server_at, "conflict flagged");
                    mark_conflict_in(&mut tx, family, &record.id, server_at, &record.data).await?;
                    outcome.conflicts += 1;
                }
                ConflictDecision::Apply => {
                    write_snapshot(&mut tx, family, record).await?;
                    outcome.upserted += 1;
                    let previous = local.and_then(|row| row.image_ref.as_deref());
                    if family.has_images() && previous != record.image_ref.as_deref() {
                        cover_changes.push((record.id.clone(), record.image_ref.clone()));
                    }
                }
            }
        }

        let now = now_ms();
        for (entity_id, image_ref) in cover_changes {
            match image_ref {
                Some(image_ref) => {
                    queue_cover(&mut tx, family, &entity_id, &image_ref, now).await?;
                    outcome.covers_enqueued += 1;
                }
                None => {
                    if let Some(path) = remove_cover_row(&mut tx, family, &entity_id).await? {
                        outcome.orphaned_covers.push(path);
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn delete_by_ids(
        &self,
        family: EntityFamily,
        ids: &[String],
    ) -> Result<Vec<PathBuf>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let orphaned = delete_entities(&mut tx, family, ids).await?;
        tx.commit().await?;
        Ok(orphaned)
    }

    pub async fn mark_conflict(
        &self,
        family: EntityFamily,
        id: &str,
        server_at: i64,
        server_snapshot: &Value,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        mark_conflict_in(&mut conn, family, id, server_at, server_snapshot).await
    }

    pub async fn get_entity(
        &self,
        family: EntityFamily,
        id: &str,
    ) -> Result<Option<EntityRow>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_row(&mut conn, family, id).await
    }

    /// Loads a visible entity; rows awaiting a local delete are hidden.
    pub async fn load<T: SyncRecord>(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.get_entity(T::FAMILY, id).await? {
            Some(row) if !row.pending_delete => Ok(Some(row.decode()?)),
            _ => Ok(None),
        }
    }

    pub async fn list<T: SyncRecord>(&self) -> Result<Vec<T>, StoreError> {
        let sql = format!(
            "SELECT data FROM {} WHERE pending_delete = 0 ORDER BY name COLLATE NOCASE ASC, id ASC",
            T::FAMILY.table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.try_get("data")?;
            out.push(serde_json::from_str(&data)?);
        }
        Ok(out)
    }

    pub async fn count(&self, family: EntityFamily) -> Result<i64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE pending_delete = 0",
            family.table()
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    pub async fn list_conflicts(&self, family: EntityFamily) -> Result<Vec<EntityRow>, StoreError> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE conflict_server_at IS NOT NULL ORDER BY id ASC",
            family.table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|row| entity_from_row(family, row)).collect()
    }

    pub async fn book_contributors(&self, book_id: &str) -> Result<Vec<BookContributor>, StoreError> {
        let rows = sqlx::query(
            "SELECT contributor_id, role FROM book_contributors WHERE book_id = ?1 ORDER BY position ASC",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(BookContributor {
                contributor_id: row.try_get("contributor_id")?,
                role: row.try_get("role")?,
            });
        }
        Ok(out)
    }

    pub async fn book_series(&self, book_id: &str) -> Result<Vec<BookSeries>, StoreError> {
        let rows = sqlx::query(
            "SELECT series_id, sequence FROM book_series WHERE book_id = ?1 ORDER BY series_id ASC",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(BookSeries {
                series_id: row.try_get("series_id")?,
                sequence: row.try_get("sequence")?,
            });
        }
        Ok(out)
    }

    pub async fn book_dimension_ids(
        &self,
        family: EntityFamily,
        book_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let sql = match family {
            EntityFamily::Tags => "SELECT tag_id AS id FROM book_tags WHERE book_id = ?1 ORDER BY tag_id",
            EntityFamily::Genres => {
                "SELECT genre_id AS id FROM book_genres WHERE book_id = ?1 ORDER BY genre_id"
            }
            _ => return Ok(Vec::new()),
        };
        let rows = sqlx::query(sql).bind(book_id).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    /// Ordered book ids of a collection or lens.
    pub async fn member_book_ids(
        &self,
        family: EntityFamily,
        id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let sql = match family {
            EntityFamily::Collections => {
                "SELECT book_id FROM collection_books WHERE collection_id = ?1 ORDER BY position ASC"
            }
            EntityFamily::Lenses => {
                "SELECT book_id FROM lens_books WHERE lens_id = ?1 ORDER BY position ASC"
            }
            _ => return Ok(Vec::new()),
        };
        let rows = sqlx::query(sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get("book_id").map_err(StoreError::from))
            .collect()
    }

    pub async fn get_cursor(&self, family: EntityFamily) -> Result<CursorState, StoreError> {
        let row = sqlx::query(
            "SELECT cursor, run_updated_after, run_started_at, last_synced_at
             FROM sync_cursors WHERE family = ?1",
        )
        .bind(family.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(CursorState::default());
        };
        Ok(CursorState {
            cursor: row.try_get("cursor")?,
            run_updated_after: row.try_get("run_updated_after")?,
            run_started_at: row.try_get("run_started_at")?,
            last_synced_at: row.try_get("last_synced_at")?,
        })
    }

    /// Persists the resumption point after a page; `None` means the run is done.
    pub async fn save_cursor(
        &self,
        family: EntityFamily,
        cursor: Option<&str>,
        run_updated_after: Option<i64>,
        run_started_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_cursors (family, cursor, run_updated_after, run_started_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(family) DO UPDATE SET
                cursor = excluded.cursor,
                run_updated_after = excluded.run_updated_after,
                run_started_at = excluded.run_started_at",
        )
        .bind(family.as_str())
        .bind(cursor)
        .bind(cursor.and(run_updated_after))
        .bind(cursor.map(|_| run_started_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a completed pull; `synced_at` becomes the next delta watermark.
    pub async fn finish_cursor(&self, family: EntityFamily, synced_at: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_cursors (family, cursor, run_updated_after, run_started_at, last_synced_at)
             VALUES (?1, NULL, NULL, NULL, ?2)
             ON CONFLICT(family) DO UPDATE SET
                cursor = NULL,
                run_updated_after = NULL,
                run_started_at = NULL,
                last_synced_at = excluded.last_synced_at",
        )
        .bind(family.as_str())
        .bind(synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_cursors(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_cursors")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_successful_sync(&self) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT value FROM sync_meta WHERE key = ?1")
            .bind(LAST_SUCCESSFUL_SYNC_KEY)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.try_get("value")?;
        Ok(value.parse().ok())
    }

    pub async fn set_last_successful_sync(&self, at: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(LAST_SUCCESSFUL_SYNC_KEY)
        .bind(at.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Repopulates the full-text index from every family table.
    pub async fn rebuild_search_index(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM search_index")
            .execute(&mut *tx)
            .await?;
        let mut indexed = 0;
        for family in EntityFamily::PULL_ORDER {
            let sql = format!(
                "INSERT INTO search_index (family, entity_id, name, body)
                 SELECT ?1, t.id, t.name, {} FROM {} t WHERE t.pending_delete = 0",
                search_body(family),
                family.table()
            );
            let result = sqlx::query(&sql)
                .bind(family.as_str())
                .execute(&mut *tx)
                .await?;
            indexed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(indexed)
    }

    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>, StoreError> {
        let Some(expression) = match_expression(query) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT family, entity_id, name FROM search_index
             WHERE search_index MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )
        .bind(expression)
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let family: String = row.try_get("family")?;
            out.push(SearchHit {
                family: EntityFamily::parse(&family)?,
                entity_id: row.try_get("entity_id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    /// Local edit: merge-patches the snapshot, marks it dirty and queues the push.
    pub async fn update_fields(
        &self,
        family: EntityFamily,
        id: &str,
        patch: &Value,
    ) -> Result<i64, StoreError> {
        if !patch.is_object() {
            return Err(StoreError::InvalidPatch);
        }
        let mut tx = self.pool.begin().await?;
        let row = visible_row(&mut tx, family, id).await?;
        let mut data = row.data;
        merge_patch(&mut data, patch);
        if let Value::Object(map) = &mut data {
            map.insert("id".into(), Value::String(id.to_string()));
        }
        let record = incoming_from_value(family, data)?;
        write_local(&mut tx, family, &record).await?;
        let op_id = queue_update(&mut tx, family, id, patch).await?;
        tx.commit().await?;
        Ok(op_id)
    }

    /// Local create under a provisional `local-…` id, re-keyed when the server echoes.
    pub async fn create_entity(&self, family: EntityFamily, data: Value) -> Result<String, StoreError> {
        let Value::Object(mut map) = data else {
            return Err(StoreError::InvalidPatch);
        };
        let id = format!("local-{:016x}", rand::random::<u64>());
        let now = now_ms();
        map.insert("id".into(), Value::String(id.clone()));
        if !map.contains_key("updatedAt") {
            map.insert("updatedAt".into(), Value::String(format_timestamp(now)?));
        }
        let data = Value::Object(map);
        let record = incoming_from_value(family, data.clone())?;

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO {} (id, name, data, image_ref, updated_at, dirty, local_updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, 1, ?5)",
            family.table()
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.name)
            .bind(record.data.to_string())
            .bind(&record.image_ref)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        write_relations(&mut tx, family, &record.id, &record.relations).await?;
        insert_operation(&mut tx, family, &id, OpKind::Create, None, &data).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Local delete. The row stays hidden until the server confirms; a create
    /// that never reached the server is dropped outright. Returns the queued
    /// operation id, if any.
    pub async fn delete_entity(&self, family: EntityFamily, id: &str) -> Result<Option<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        visible_row(&mut tx, family, id).await?;

        let unpushed_create: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM pending_operations
             WHERE family = ?1 AND entity_id = ?2 AND kind = 'create' AND status != 'in_flight'",
        )
        .bind(family.as_str())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        if unpushed_create.is_some() {
            delete_entities(&mut tx, family, &[id.to_string()]).await?;
            tx.commit().await?;
            return Ok(None);
        }

        sqlx::query(
            "DELETE FROM pending_operations
             WHERE family = ?1 AND entity_id = ?2 AND kind IN ('update', 'relations')
               AND status != 'in_flight'",
        )
        .bind(family.as_str())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let sql = format!(
            "UPDATE {} SET pending_delete = 1, dirty = 1, local_updated_at = ?2 WHERE id = ?1",
            family.table()
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?;
        let existing = find_queued(&mut tx, family, id, &[OpKind::Delete], None).await?;
        let op_id = match existing {
            Some((op_id, _)) => op_id,
            None => insert_operation(&mut tx, family, id, OpKind::Delete, None, &json!({})).await?,
        };
        tx.commit().await?;
        Ok(Some(op_id))
    }

    /// Replaces one relationship list locally and queues it for push.
    pub async fn set_relations(
        &self,
        family: EntityFamily,
        id: &str,
        relation: &str,
        payload: Value,
    ) -> Result<i64, StoreError> {
        let key = family.relation_key(relation)?;
        let mut tx = self.pool.begin().await?;
        let row = visible_row(&mut tx, family, id).await?;
        let mut data = row.data;
        if let Value::Object(map) = &mut data {
            map.insert(key.to_string(), payload.clone());
        }
        let record = incoming_from_value(family, data)?;
        write_local(&mut tx, family, &record).await?;

        let op_id = if let Some((op_id, mut create)) =
            find_queued(&mut tx, family, id, &[OpKind::Create], None).await?
        {
            let mut relation_patch = Map::new();
            relation_patch.insert(key.to_string(), payload.clone());
            merge_patch(&mut create, &Value::Object(relation_patch));
            set_operation_payload(&mut tx, op_id, &create).await?;
            op_id
        } else if let Some((op_id, _)) =
            find_queued(&mut tx, family, id, &[OpKind::Relations], Some(relation)).await?
        {
            set_operation_payload(&mut tx, op_id, &payload).await?;
            op_id
        } else {
            insert_operation(&mut tx, family, id, OpKind::Relations, Some(relation), &payload)
                .await?
        };
        tx.commit().await?;
        Ok(op_id)
    }

    /// Applies the captured server snapshot and discards the local edit.
    pub async fn accept_server_version(&self, family: EntityFamily, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = fetch_row(&mut tx, family, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                family,
                id: id.to_string(),
            })?;
        let snapshot = row.conflict_data.ok_or_else(|| StoreError::NoConflict {
            family,
            id: id.to_string(),
        })?;
        let record = incoming_from_value(family, snapshot)?;
        sqlx::query(
            "DELETE FROM pending_operations
             WHERE family = ?1 AND entity_id = ?2 AND status != 'in_flight'",
        )
        .bind(family.as_str())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        write_snapshot(&mut tx, family, &record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Keeps the local edit: the conflict point becomes the last-seen version so
    /// the queued push goes out without being flagged again.
    pub async fn keep_local_version(&self, family: EntityFamily, id: &str) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET
                updated_at = COALESCE(conflict_server_at, updated_at),
                conflict_server_at = NULL,
                conflict_data = NULL
             WHERE id = ?1",
            family.table()
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                family,
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("audioshelf");
    path.push("library.db");
    Ok(path)
}

fn entity_from_row(family: EntityFamily, row: &SqliteRow) -> Result<EntityRow, StoreError> {
    let data: String = row.try_get("data")?;
    let conflict_data: Option<String> = row.try_get("conflict_data")?;
    Ok(EntityRow {
        family,
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        data: serde_json::from_str(&data)?,
        image_ref: row.try_get("image_ref")?,
        updated_at: row.try_get("updated_at")?,
        dirty: row.try_get("dirty")?,
        local_updated_at: row.try_get("local_updated_at")?,
        conflict_server_at: row.try_get("conflict_server_at")?,
        conflict_data: conflict_data
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        pending_delete: row.try_get("pending_delete")?,
    })
}

async fn fetch_row(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    id: &str,
) -> Result<Option<EntityRow>, StoreError> {
    let sql = format!("SELECT {ROW_COLUMNS} FROM {} WHERE id = ?1", family.table());
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.map(|row| entity_from_row(family, &row)).transpose()
}

async fn visible_row(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    id: &str,
) -> Result<EntityRow, StoreError> {
    match fetch_row(conn, family, id).await? {
        Some(row) if !row.pending_delete => Ok(row),
        _ => Err(StoreError::NotFound {
            family,
            id: id.to_string(),
        }),
    }
}

async fn load_existing(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    id: &str,
) -> Result<Option<ExistingRow>, StoreError> {
    let sql = format!(
        "SELECT t.image_ref, t.updated_at, t.dirty, t.local_updated_at, t.conflict_server_at,
                (SELECT COUNT(*) FROM pending_operations p
                 WHERE p.family = ?2 AND p.entity_id = t.id) AS pending_ops
         FROM {} t WHERE t.id = ?1",
        family.table()
    );
    let row = sqlx::query(&sql)
        .bind(id)
        .bind(family.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let pending_ops: i64 = row.try_get("pending_ops")?;
    Ok(Some(ExistingRow {
        state: LocalSyncState {
            updated_at: row.try_get("updated_at")?,
            dirty: row.try_get("dirty")?,
            local_updated_at: row.try_get("local_updated_at")?,
            conflict_server_at: row.try_get("conflict_server_at")?,
            has_pending_op: pending_ops > 0,
        },
        image_ref: row.try_get("image_ref")?,
    }))
}

/// Upserts a server-confirmed snapshot and clears every sync marker.
async fn write_snapshot(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    record: &IncomingRecord,
) -> Result<(), StoreError> {
    if family == EntityFamily::Books {
        upsert_dimensions(conn, EntityFamily::Tags, &record.relations.tags).await?;
        upsert_dimensions(conn, EntityFamily::Genres, &record.relations.genres).await?;
    }
    let sql = format!(
        "INSERT INTO {} (id, name, data, image_ref, updated_at, dirty, local_updated_at,
                         conflict_server_at, conflict_data, pending_delete)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, NULL, NULL, 0)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            data = excluded.data,
            image_ref = excluded.image_ref,
            updated_at = excluded.updated_at,
            dirty = 0,
            local_updated_at = NULL,
            conflict_server_at = NULL,
            conflict_data = NULL,
            pending_delete = 0",
        family.table()
    );
    sqlx::query(&sql)
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.data.to_string())
        .bind(&record.image_ref)
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await?;
    write_relations(conn, family, &record.id, &record.relations).await
}

/// Rewrites a row with a local edit; the last-seen server version is untouched.
async fn write_local(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    record: &IncomingRecord,
) -> Result<(), StoreError> {
    if family == EntityFamily::Books {
        upsert_dimensions(conn, EntityFamily::Tags, &record.relations.tags).await?;
        upsert_dimensions(conn, EntityFamily::Genres, &record.relations.genres).await?;
    }
    let sql = format!(
        "UPDATE {} SET name = ?2, data = ?3, image_ref = ?4, dirty = 1, local_updated_at = ?5
         WHERE id = ?1",
        family.table()
    );
    sqlx::query(&sql)
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.data.to_string())
        .bind(&record.image_ref)
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;
    write_relations(conn, family, &record.id, &record.relations).await
}

/// Tags and genres embedded in a book are inserted as placeholders when unknown;
/// a placeholder never overwrites a row that came from the tag/genre pull.
async fn upsert_dimensions(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    refs: &[DimensionRef],
) -> Result<(), StoreError> {
    let table = family.table();
    let sql = format!(
        "INSERT INTO {table} (id, name, data, updated_at) VALUES (?1, ?2, ?3, 0)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, data = excluded.data
         WHERE {table}.updated_at = 0 AND {table}.dirty = 0"
    );
    for dimension in refs {
        let data = json!({
            "id": dimension.id,
            "name": dimension.name,
            "updatedAt": "1970-01-01T00:00:00Z",
        });
        sqlx::query(&sql)
            .bind(&dimension.id)
            .bind(&dimension.name)
            .bind(data.to_string())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Delete-then-reinsert: junction rows always mirror exactly one snapshot.
async fn write_relations(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    id: &str,
    relations: &RelationRows,
) -> Result<(), StoreError> {
    match family {
        EntityFamily::Books => {
            for table in ["book_contributors", "book_series", "book_tags", "book_genres"] {
                sqlx::query(&format!("DELETE FROM {table} WHERE book_id = ?1"))
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
            }
            for (position, contributor) in relations.contributors.iter().enumerate() {
                sqlx::query(
                    "INSERT OR IGNORE INTO book_contributors (book_id, contributor_id, role, position)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(id)
                .bind(&contributor.contributor_id)
                .bind(&contributor.role)
                .bind(position as i64)
                .execute(&mut *conn)
                .await?;
            }
            for series in &relations.series {
                sqlx::query(
                    "INSERT OR IGNORE INTO book_series (book_id, series_id, sequence) VALUES (?1, ?2, ?3)",
                )
                .bind(id)
                .bind(&series.series_id)
                .bind(&series.sequence)
                .execute(&mut *conn)
                .await?;
            }
            for tag in &relations.tags {
                sqlx::query("INSERT OR IGNORE INTO book_tags (book_id, tag_id) VALUES (?1, ?2)")
                    .bind(id)
                    .bind(&tag.id)
                    .execute(&mut *conn)
                    .await?;
            }
            for genre in &relations.genres {
                sqlx::query("INSERT OR IGNORE INTO book_genres (book_id, genre_id) VALUES (?1, ?2)")
                    .bind(id)
                    .bind(&genre.id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        EntityFamily::Collections | EntityFamily::Lenses => {
            let (table, owner) = member_table(family);
            sqlx::query(&format!("DELETE FROM {table} WHERE {owner} = ?1"))
                .bind(id)
                .execute(&mut *conn)
                .await?;
            let insert = format!(
                "INSERT OR IGNORE INTO {table} ({owner}, book_id, position) VALUES (?1, ?2, ?3)"
            );
            for (position, book_id) in relations.members.iter().enumerate() {
                sqlx::query(&insert)
                    .bind(id)
                    .bind(book_id)
                    .bind(position as i64)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn member_table(family: EntityFamily) -> (&'static str, &'static str) {
    match family {
        EntityFamily::Lenses => ("lens_books", "lens_id"),
        _ => ("collection_books", "collection_id"),
    }
}

/// Junction tables referencing an entity of the family, with the referencing column.
fn referencing_junctions(family: EntityFamily) -> &'static [(&'static str, &'static str)] {
    match family {
        EntityFamily::Books => &[
            ("book_contributors", "book_id"),
            ("book_series", "book_id"),
            ("book_tags", "book_id"),
            ("book_genres", "book_id"),
            ("collection_books", "book_id"),
            ("lens_books", "book_id"),
        ],
        EntityFamily::Contributors => &[("book_contributors", "contributor_id")],
        EntityFamily::Series => &[("book_series", "series_id")],
        EntityFamily::Tags => &[("book_tags", "tag_id")],
        EntityFamily::Genres => &[("book_genres", "genre_id")],
        EntityFamily::Collections => &[("collection_books", "collection_id")],
        EntityFamily::Lenses => &[("lens_books", "lens_id")],
        EntityFamily::Profile => &[],
    }
}

/// Tombstones win over any local state: the row, its junction rows, queued
/// operations and the cover entry all go.
async fn delete_entities(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    ids: &[String],
) -> Result<Vec<PathBuf>, StoreError> {
    let mut orphaned = Vec::new();
    let delete_row = format!("DELETE FROM {} WHERE id = ?1", family.table());
    for id in ids {
        sqlx::query(&delete_row).bind(id).execute(&mut *conn).await?;
        for (table, column) in referencing_junctions(family) {
            sqlx::query(&format!("DELETE FROM {table} WHERE {column} = ?1"))
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query("DELETE FROM pending_operations WHERE family = ?1 AND entity_id = ?2")
            .bind(family.as_str())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if family == EntityFamily::Books {
            sqlx::query("DELETE FROM reading_progress WHERE book_id = ?1")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
        if let Some(path) = remove_cover_row(conn, family, id).await? {
            orphaned.push(path);
        }
    }
    Ok(orphaned)
}

async fn mark_conflict_in(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    id: &str,
    server_at: i64,
    server_snapshot: &Value,
) -> Result<(), StoreError> {
    let sql = format!(
        "UPDATE {} SET conflict_server_at = ?2, conflict_data = ?3 WHERE id = ?1",
        family.table()
    );
    sqlx::query(&sql)
        .bind(id)
        .bind(server_at)
        .bind(server_snapshot.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Moves a provisional id to the server-assigned one everywhere it is referenced.
async fn rekey_entity(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    from: &str,
    to: &str,
) -> Result<(), StoreError> {
    let taken: Option<String> =
        sqlx::query_scalar(&format!("SELECT id FROM {} WHERE id = ?1", family.table()))
            .bind(to)
            .fetch_optional(&mut *conn)
            .await?;
    if taken.is_some() {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", family.table()))
            .bind(from)
            .execute(&mut *conn)
            .await?;
    } else {
        sqlx::query(&format!("UPDATE {} SET id = ?2 WHERE id = ?1", family.table()))
            .bind(from)
            .bind(to)
            .execute(&mut *conn)
            .await?;
    }
    for (table, column) in referencing_junctions(family) {
        sqlx::query(&format!(
            "UPDATE OR REPLACE {table} SET {column} = ?2 WHERE {column} = ?1"
        ))
        .bind(from)
        .bind(to)
        .execute(&mut *conn)
        .await?;
    }
    sqlx::query("UPDATE pending_operations SET entity_id = ?3 WHERE family = ?1 AND entity_id = ?2")
        .bind(family.as_str())
        .bind(from)
        .bind(to)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "UPDATE OR REPLACE cover_downloads SET entity_id = ?3 WHERE family = ?1 AND entity_id = ?2",
    )
    .bind(family.as_str())
    .bind(from)
    .bind(to)
    .execute(&mut *conn)
    .await?;
    if family == EntityFamily::Books {
        sqlx::query("UPDATE OR REPLACE reading_progress SET book_id = ?2 WHERE book_id = ?1")
            .bind(from)
            .bind(to)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn search_body(family: EntityFamily) -> &'static str {
    match family {
        EntityFamily::Books => {
            "COALESCE(json_extract(t.data, '$.subtitle'), '') || ' ' ||
             COALESCE(json_extract(t.data, '$.description'), '') || ' ' ||
             COALESCE((SELECT group_concat(c.name, ' ') FROM book_contributors bc
                       JOIN contributors c ON c.id = bc.contributor_id
                       WHERE bc.book_id = t.id), '')"
        }
        EntityFamily::Series | EntityFamily::Lenses => {
            "COALESCE(json_extract(t.data, '$.description'), '')"
        }
        EntityFamily::Contributors => "COALESCE(json_extract(t.data, '$.sortName'), '')",
        _ => "''",
    }
}

/// Quotes every term and makes it a prefix match, so user input never reaches
/// the FTS query grammar.
fn match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| format!("\"{}\"*", term.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// RFC 7396 merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

include!("store_queue.rs");

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
