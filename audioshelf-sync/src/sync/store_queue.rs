#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Update,
    Delete,
    Relations,
    Progress,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Relations => "relations",
            OpKind::Progress => "progress",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "create" => Ok(OpKind::Create),
            "update" => Ok(OpKind::Update),
            "delete" => Ok(OpKind::Delete),
            "relations" => Ok(OpKind::Relations),
            "progress" => Ok(OpKind::Progress),
            other => Err(StoreError::InvalidOperationKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Queued,
    InFlight,
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Queued => "queued",
            OpStatus::InFlight => "in_flight",
            OpStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "queued" => Ok(OpStatus::Queued),
            "in_flight" => Ok(OpStatus::InFlight),
            "failed" => Ok(OpStatus::Failed),
            other => Err(StoreError::InvalidOperationStatus(other.to_string())),
        }
    }
}

/// A durable local change waiting to be pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: i64,
    pub family: EntityFamily,
    pub entity_id: String,
    pub kind: OpKind,
    /// Relation path segment for [`OpKind::Relations`].
    pub relation: Option<String>,
    pub payload: Value,
    pub status: OpStatus,
    pub retry_count: u32,
    pub retryable: bool,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// How the server answered a pushed operation.
#[derive(Debug, Clone)]
pub enum OpCompletion {
    /// The echoed entity becomes the new clean snapshot.
    Applied(IncomingRecord),
    Deleted,
    Progress(ProgressRecord),
    /// Accepted, but the response carried nothing to store.
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverState {
    Pending,
    /// A file exists but the image reference changed.
    Stale,
    Downloaded,
    Failed,
}

impl CoverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverState::Pending => "pending",
            CoverState::Stale => "stale",
            CoverState::Downloaded => "downloaded",
            CoverState::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(CoverState::Pending),
            "stale" => Ok(CoverState::Stale),
            "downloaded" => Ok(CoverState::Downloaded),
            "failed" => Ok(CoverState::Failed),
            other => Err(StoreError::InvalidCoverState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverRecord {
    pub family: EntityFamily,
    pub entity_id: String,
    pub image_ref: String,
    pub state: CoverState,
    pub local_path: Option<PathBuf>,
    pub palette: Option<Palette>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub book_id: String,
    pub position_ms: i64,
    pub finished: bool,
    /// Unix ms.
    pub updated_at: i64,
    pub dirty: bool,
}

impl ProgressRecord {
    pub fn from_server(progress: &ReadingProgress) -> Result<Self, RecordError> {
        Ok(Self {
            book_id: progress.book_id.clone(),
            position_ms: progress.position_ms,
            finished: progress.finished,
            updated_at: super::records::parse_timestamp(&progress.updated_at)?,
            dirty: false,
        })
    }
}

const OP_COLUMNS: &str = "id, family, entity_id, kind, relation, payload, status, retry_count, retryable, last_error, created_at, updated_at";
const COVER_COLUMNS: &str =
    "family, entity_id, image_ref, state, local_path, dominant, dark_muted, vibrant, attempts, last_error";

impl LibraryStore {
    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>, StoreError> {
        self.query_operations("1 = 1").await
    }

    /// Everything not currently being pushed, oldest first.
    pub async fn operations_for_drain(&self) -> Result<Vec<PendingOperation>, StoreError> {
        self.query_operations("status != 'in_flight'").await
    }

    pub async fn failed_operations(&self) -> Result<Vec<PendingOperation>, StoreError> {
        self.query_operations("status = 'failed'").await
    }

    async fn query_operations(&self, filter: &str) -> Result<Vec<PendingOperation>, StoreError> {
        let sql = format!("SELECT {OP_COLUMNS} FROM pending_operations WHERE {filter} ORDER BY id ASC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(operation_from_row).collect()
    }

    pub async fn get_operation(&self, id: i64) -> Result<Option<PendingOperation>, StoreError> {
        let sql = format!("SELECT {OP_COLUMNS} FROM pending_operations WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(operation_from_row).transpose()
    }

    pub async fn pending_count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM pending_operations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Marks an operation in flight and returns its current payload. `None` when
    /// it was dismissed, completed or claimed elsewhere in the meantime.
    pub async fn claim_operation(&self, id: i64) -> Result<Option<PendingOperation>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "UPDATE pending_operations SET status = 'in_flight', updated_at = ?2
             WHERE id = ?1 AND status != 'in_flight'",
        )
        .bind(id)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(None);
        }
        let sql = format!("SELECT {OP_COLUMNS} FROM pending_operations WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_one(&mut *tx).await?;
        let op = operation_from_row(&row)?;
        tx.commit().await?;
        Ok(Some(op))
    }

    pub async fn fail_operation(&self, id: i64, error: &str, retryable: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE pending_operations SET
                status = 'failed',
                retry_count = retry_count + 1,
                retryable = ?2,
                last_error = ?3,
                updated_at = ?4
             WHERE id = ?1",
        )
        .bind(id)
        .bind(retryable)
        .bind(error)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingOperation(id));
        }
        Ok(())
    }

    /// Manual retry: back to the queue with a fresh retry budget.
    pub async fn retry_operation(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE pending_operations SET status = 'queued', retry_count = 0, retryable = 1, updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
        )
        .bind(id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingOperation(id));
        }
        Ok(())
    }

    pub async fn retry_all_failed(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE pending_operations SET status = 'queued', retry_count = 0, retryable = 1, updated_at = ?1
             WHERE status = 'failed'",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Requeues operations left in flight by an interrupted process.
    pub async fn recover_in_flight(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE pending_operations SET status = 'queued', updated_at = ?1 WHERE status = 'in_flight'",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drops an operation without pushing it. Local values stay until the server
    /// changes the entity, unless a captured server snapshot can be applied now.
    pub async fn dismiss_operation(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {OP_COLUMNS} FROM pending_operations WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *tx).await?;
        let Some(row) = row else {
            return Err(StoreError::MissingOperation(id));
        };
        let op = operation_from_row(&row)?;
        dismiss_in(&mut tx, &op).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn dismiss_all_failed(&self) -> Result<usize, StoreError> {
        let failed = self.failed_operations().await?;
        let mut tx = self.pool.begin().await?;
        for op in &failed {
            dismiss_in(&mut tx, op).await?;
        }
        tx.commit().await?;
        Ok(failed.len())
    }

    /// Folds a server confirmation into the store. Returns cover files that were
    /// orphaned by a confirmed delete.
    pub async fn complete_operation(
        &self,
        op: &PendingOperation,
        completion: OpCompletion,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM pending_operations WHERE id = ?1")
            .bind(op.id)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let family = op.family;
        let mut orphaned = Vec::new();
        match completion {
            OpCompletion::Deleted => {
                orphaned = delete_entities(&mut tx, family, &[op.entity_id.clone()]).await?;
            }
            OpCompletion::Applied(record) => {
                let mut entity_id = op.entity_id.clone();
                if op.kind == OpKind::Create && record.id != op.entity_id {
                    debug!(family = %family, from = %op.entity_id, to = %record.id, "re-keying created entity");
                    rekey_entity(&mut tx, family, &op.entity_id, &record.id).await?;
                    entity_id = record.id.clone();
                }
                let Some(existing) = fetch_row(&mut tx, family, &entity_id).await? else {
                    tx.commit().await?;
                    return Ok(orphaned);
                };
                if remaining_operations(&mut tx, family, &entity_id).await? == 0 {
                    write_snapshot(&mut tx, family, &record).await?;
                    if family.has_images() && existing.image_ref != record.image_ref {
                        match &record.image_ref {
                            Some(image_ref) => {
                                queue_cover(&mut tx, family, &entity_id, image_ref, now_ms()).await?
                            }
                            None => {
                                if let Some(path) = remove_cover_row(&mut tx, family, &entity_id).await? {
                                    orphaned.push(path);
                                }
                            }
                        }
                    }
                } else {
                    acknowledge_version(&mut tx, family, &entity_id, Some(record.updated_at)).await?;
                }
            }
            OpCompletion::Progress(progress) => {
                if remaining_operations(&mut tx, family, &op.entity_id).await? == 0 {
                    write_progress(&mut tx, &progress, false).await?;
                }
            }
            OpCompletion::Acknowledged => {
                if remaining_operations(&mut tx, family, &op.entity_id).await? == 0
                    && op.kind != OpKind::Progress
                {
                    let sql = format!(
                        "UPDATE {} SET dirty = 0, local_updated_at = NULL,
                            conflict_server_at = NULL, conflict_data = NULL
                         WHERE id = ?1",
                        family.table()
                    );
                    sqlx::query(&sql).bind(&op.entity_id).execute(&mut *tx).await?;
                } else {
                    acknowledge_version(&mut tx, family, &op.entity_id, None).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(orphaned)
    }

    pub async fn record_progress(
        &self,
        book_id: &str,
        position_ms: i64,
        finished: bool,
    ) -> Result<i64, StoreError> {
        let now = now_ms();
        let progress = ProgressRecord {
            book_id: book_id.to_string(),
            position_ms,
            finished,
            updated_at: now,
            dirty: true,
        };
        let payload = serde_json::to_value(ReadingProgress {
            book_id: book_id.to_string(),
            position_ms,
            finished,
            updated_at: format_timestamp(now)?,
        })?;

        let mut tx = self.pool.begin().await?;
        write_progress(&mut tx, &progress, true).await?;
        let family = EntityFamily::Books;
        let op_id = match find_queued(&mut tx, family, book_id, &[OpKind::Progress], None).await? {
            Some((op_id, _)) => {
                set_operation_payload(&mut tx, op_id, &payload).await?;
                op_id
            }
            None => insert_operation(&mut tx, family, book_id, OpKind::Progress, None, &payload).await?,
        };
        tx.commit().await?;
        Ok(op_id)
    }

    pub async fn get_progress(&self, book_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT book_id, position_ms, finished, updated_at, dirty FROM reading_progress WHERE book_id = ?1",
        )
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ProgressRecord {
            book_id: row.try_get("book_id")?,
            position_ms: row.try_get("position_ms")?,
            finished: row.try_get("finished")?,
            updated_at: row.try_get("updated_at")?,
            dirty: row.try_get("dirty")?,
        }))
    }

    /// Applies progress reported by the server. A dirty local position that is
    /// newer wins and `false` is returned.
    pub async fn apply_server_progress(&self, progress: &ProgressRecord) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let local: Option<(i64, bool)> =
            sqlx::query_as("SELECT updated_at, dirty FROM reading_progress WHERE book_id = ?1")
                .bind(&progress.book_id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some((local_at, true)) = local
            && local_at > progress.updated_at
        {
            tx.commit().await?;
            return Ok(false);
        }
        write_progress(&mut tx, progress, false).await?;
        sqlx::query(
            "DELETE FROM pending_operations
             WHERE family = 'books' AND entity_id = ?1 AND kind = 'progress' AND status != 'in_flight'",
        )
        .bind(&progress.book_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn enqueue_cover(
        &self,
        family: EntityFamily,
        entity_id: &str,
        image_ref: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        queue_cover(&mut conn, family, entity_id, image_ref, now_ms()).await
    }

    /// Pending and stale covers, plus failed ones still within the attempt budget.
    pub async fn covers_to_download(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> Result<Vec<CoverRecord>, StoreError> {
        let sql = format!(
            "SELECT {COVER_COLUMNS} FROM cover_downloads
             WHERE state IN ('pending', 'stale') OR (state = 'failed' AND attempts < ?1)
             ORDER BY updated_at ASC, family ASC, entity_id ASC
             LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(max_attempts))
            .bind(i64::from(limit.max(1)))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(cover_from_row).collect()
    }

    pub async fn get_cover(
        &self,
        family: EntityFamily,
        entity_id: &str,
    ) -> Result<Option<CoverRecord>, StoreError> {
        let sql = format!(
            "SELECT {COVER_COLUMNS} FROM cover_downloads WHERE family = ?1 AND entity_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(family.as_str())
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cover_from_row).transpose()
    }

    pub async fn cover_palette(
        &self,
        family: EntityFamily,
        entity_id: &str,
    ) -> Result<Option<Palette>, StoreError> {
        Ok(self
            .get_cover(family, entity_id)
            .await?
            .and_then(|cover| cover.palette))
    }

    /// Marks the cover downloaded. Returns `false` and leaves the row queued
    /// when its image reference changed while `image_ref` was being fetched.
    pub async fn complete_cover(
        &self,
        family: EntityFamily,
        entity_id: &str,
        image_ref: &str,
        local_path: &Path,
        palette: Option<Palette>,
    ) -> Result<bool, StoreError> {
        let hex = |pick: fn(&Palette) -> Rgb| palette.as_ref().map(|p| pick(p).to_hex());
        let result = sqlx::query(
            "UPDATE cover_downloads SET
                state = 'downloaded',
                local_path = ?3,
                dominant = ?4,
                dark_muted = ?5,
                vibrant = ?6,
                last_error = NULL,
                updated_at = ?7
             WHERE family = ?1 AND entity_id = ?2 AND image_ref = ?8",
        )
        .bind(family.as_str())
        .bind(entity_id)
        .bind(local_path.to_string_lossy().into_owned())
        .bind(hex(|p| p.dominant))
        .bind(hex(|p| p.dark_muted))
        .bind(hex(|p| p.vibrant))
        .bind(now_ms())
        .bind(image_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Counts a failed attempt against `image_ref`; a superseded reference
    /// leaves the row untouched and returns `false`.
    pub async fn fail_cover(
        &self,
        family: EntityFamily,
        entity_id: &str,
        image_ref: &str,
        error: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE cover_downloads SET
                state = 'failed',
                attempts = attempts + 1,
                last_error = ?3,
                updated_at = ?4
             WHERE family = ?1 AND entity_id = ?2 AND image_ref = ?5",
        )
        .bind(family.as_str())
        .bind(entity_id)
        .bind(error)
        .bind(now_ms())
        .bind(image_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Forgets the cached file; the cover becomes pending again.
    pub async fn reset_cover(&self, family: EntityFamily, entity_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE cover_downloads SET
                state = 'pending',
                local_path = NULL,
                dominant = NULL,
                dark_muted = NULL,
                vibrant = NULL,
                attempts = 0,
                last_error = NULL,
                updated_at = ?3
             WHERE family = ?1 AND entity_id = ?2",
        )
        .bind(family.as_str())
        .bind(entity_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn operation_from_row(row: &SqliteRow) -> Result<PendingOperation, StoreError> {
    let family: String = row.try_get("family")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(PendingOperation {
        id: row.try_get("id")?,
        family: EntityFamily::parse(&family)?,
        entity_id: row.try_get("entity_id")?,
        kind: OpKind::parse(&kind)?,
        relation: row.try_get("relation")?,
        payload: serde_json::from_str(&payload)?,
        status: OpStatus::parse(&status)?,
        retry_count: retry_count.clamp(0, i64::from(u32::MAX)) as u32,
        retryable: row.try_get("retryable")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cover_from_row(row: &SqliteRow) -> Result<CoverRecord, StoreError> {
    let family: String = row.try_get("family")?;
    let state: String = row.try_get("state")?;
    let local_path: Option<String> = row.try_get("local_path")?;
    let attempts: i64 = row.try_get("attempts")?;
    let color = |column: &str| -> Result<Option<Rgb>, StoreError> {
        let value: Option<String> = row.try_get(column)?;
        Ok(value.as_deref().and_then(Rgb::from_hex))
    };
    let palette = match (color("dominant")?, color("dark_muted")?, color("vibrant")?) {
        (Some(dominant), Some(dark_muted), Some(vibrant)) => Some(Palette {
            dominant,
            dark_muted,
            vibrant,
        }),
        _ => None,
    };
    Ok(CoverRecord {
        family: EntityFamily::parse(&family)?,
        entity_id: row.try_get("entity_id")?,
        image_ref: row.try_get("image_ref")?,
        state: CoverState::parse(&state)?,
        local_path: local_path.map(PathBuf::from),
        palette,
        attempts: attempts.clamp(0, i64::from(u32::MAX)) as u32,
        last_error: row.try_get("last_error")?,
    })
}

async fn insert_operation(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    entity_id: &str,
    kind: OpKind,
    relation: Option<&str>,
    payload: &Value,
) -> Result<i64, StoreError> {
    let now = now_ms();
    let result = sqlx::query(
        "INSERT INTO pending_operations (family, entity_id, kind, relation, payload, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
    )
    .bind(family.as_str())
    .bind(entity_id)
    .bind(kind.as_str())
    .bind(relation)
    .bind(payload.to_string())
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Latest queued operation of one of `kinds` for the entity. Failed and
/// in-flight operations are never coalesced into.
async fn find_queued(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    entity_id: &str,
    kinds: &[OpKind],
    relation: Option<&str>,
) -> Result<Option<(i64, Value)>, StoreError> {
    let rows = sqlx::query(
        "SELECT id, kind, relation, payload FROM pending_operations
         WHERE family = ?1 AND entity_id = ?2 AND status = 'queued'
         ORDER BY id DESC",
    )
    .bind(family.as_str())
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await?;
    for row in rows {
        let kind: String = row.try_get("kind")?;
        if !kinds.contains(&OpKind::parse(&kind)?) {
            continue;
        }
        let row_relation: Option<String> = row.try_get("relation")?;
        if relation.is_some() && row_relation.as_deref() != relation {
            continue;
        }
        let payload: String = row.try_get("payload")?;
        return Ok(Some((row.try_get("id")?, serde_json::from_str(&payload)?)));
    }
    Ok(None)
}

async fn set_operation_payload(
    conn: &mut SqliteConnection,
    op_id: i64,
    payload: &Value,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE pending_operations SET payload = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(op_id)
        .bind(payload.to_string())
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Field edits fold into a queued create or update so the queue carries one
/// write per entity.
async fn queue_update(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    entity_id: &str,
    patch: &Value,
) -> Result<i64, StoreError> {
    let queued = find_queued(conn, family, entity_id, &[OpKind::Create, OpKind::Update], None).await?;
    match queued {
        Some((op_id, mut payload)) => {
            merge_patch(&mut payload, patch);
            set_operation_payload(conn, op_id, &payload).await?;
            Ok(op_id)
        }
        None => insert_operation(conn, family, entity_id, OpKind::Update, None, patch).await,
    }
}

async fn remaining_operations(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    entity_id: &str,
) -> Result<i64, StoreError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pending_operations WHERE family = ?1 AND entity_id = ?2",
    )
    .bind(family.as_str())
    .bind(entity_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Records a server version as seen while later local edits are still queued.
async fn acknowledge_version(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    entity_id: &str,
    server_at: Option<i64>,
) -> Result<(), StoreError> {
    let sql = format!(
        "UPDATE {} SET
            updated_at = COALESCE(?2, updated_at),
            conflict_server_at = NULL,
            conflict_data = NULL
         WHERE id = ?1",
        family.table()
    );
    sqlx::query(&sql)
        .bind(entity_id)
        .bind(server_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn dismiss_in(conn: &mut SqliteConnection, op: &PendingOperation) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM pending_operations WHERE id = ?1")
        .bind(op.id)
        .execute(&mut *conn)
        .await?;
    if remaining_operations(conn, op.family, &op.entity_id).await? > 0 {
        return Ok(());
    }
    match op.kind {
        OpKind::Progress => {
            sqlx::query("UPDATE reading_progress SET dirty = 0 WHERE book_id = ?1")
                .bind(&op.entity_id)
                .execute(&mut *conn)
                .await?;
        }
        OpKind::Create => {
            delete_entities(conn, op.family, &[op.entity_id.clone()]).await?;
        }
        _ => {
            let row = fetch_row(conn, op.family, &op.entity_id).await?;
            let snapshot = row.and_then(|row| row.conflict_data);
            match snapshot.map(|data| incoming_from_value(op.family, data)) {
                Some(Ok(record)) => write_snapshot(conn, op.family, &record).await?,
                _ => {
                    let sql = format!(
                        "UPDATE {} SET dirty = 0, pending_delete = 0, local_updated_at = NULL
                         WHERE id = ?1",
                        op.family.table()
                    );
                    sqlx::query(&sql)
                        .bind(&op.entity_id)
                        .execute(&mut *conn)
                        .await?;
                }
            }
        }
    }
    Ok(())
}

async fn write_progress(
    conn: &mut SqliteConnection,
    progress: &ProgressRecord,
    dirty: bool,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO reading_progress (book_id, position_ms, finished, updated_at, dirty)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(book_id) DO UPDATE SET
            position_ms = excluded.position_ms,
            finished = excluded.finished,
            updated_at = excluded.updated_at,
            dirty = excluded.dirty",
    )
    .bind(&progress.book_id)
    .bind(progress.position_ms)
    .bind(progress.finished)
    .bind(progress.updated_at)
    .bind(dirty)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// A changed reference marks an existing file stale so the downloader replaces it.
async fn queue_cover(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    entity_id: &str,
    image_ref: &str,
    now: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO cover_downloads (family, entity_id, image_ref, state, attempts, updated_at)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4)
         ON CONFLICT(family, entity_id) DO UPDATE SET
            image_ref = excluded.image_ref,
            state = CASE WHEN cover_downloads.local_path IS NULL THEN 'pending' ELSE 'stale' END,
            attempts = 0,
            last_error = NULL,
            updated_at = excluded.updated_at
         WHERE cover_downloads.image_ref != excluded.image_ref
            OR cover_downloads.state = 'failed'",
    )
    .bind(family.as_str())
    .bind(entity_id)
    .bind(image_ref)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn remove_cover_row(
    conn: &mut SqliteConnection,
    family: EntityFamily,
    entity_id: &str,
) -> Result<Option<PathBuf>, StoreError> {
    let path: Option<Option<String>> = sqlx::query_scalar(
        "DELETE FROM cover_downloads WHERE family = ?1 AND entity_id = ?2 RETURNING local_path",
    )
    .bind(family.as_str())
    .bind(entity_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(path.flatten().map(PathBuf::from))
}
