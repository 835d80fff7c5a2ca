use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use audioshelf_core::{AudioshelfClient, ReadingProgress};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventBus, LibraryEvent};
use super::records::{EntityFamily, RecordError, incoming_from_value};
use super::store::{
    LibraryStore, OpCompletion, OpKind, OpStatus, PendingOperation, ProgressRecord,
};
use crate::error::SyncError;
use crate::token_provider::TokenProvider;

pub const DEFAULT_MAX_AUTO_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub failed: usize,
    /// Held back behind an earlier failure for the same entity, or out of
    /// automatic retries.
    pub skipped: usize,
}

/// Replays the durable queue of local mutations against the server.
pub struct PushSyncOrchestrator {
    client: Arc<AudioshelfClient>,
    store: Arc<LibraryStore>,
    tokens: Option<Arc<TokenProvider>>,
    events: EventBus<LibraryEvent>,
    max_auto_retries: u32,
    running: Mutex<()>,
    wake: Notify,
}

impl PushSyncOrchestrator {
    pub fn new(
        client: Arc<AudioshelfClient>,
        store: Arc<LibraryStore>,
        events: EventBus<LibraryEvent>,
    ) -> Self {
        Self {
            client,
            store,
            tokens: None,
            events,
            max_auto_retries: DEFAULT_MAX_AUTO_RETRIES,
            running: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    pub fn with_token_provider(mut self, tokens: Arc<TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_max_auto_retries(mut self, max_auto_retries: u32) -> Self {
        self.max_auto_retries = max_auto_retries;
        self
    }

    /// Pushes every eligible operation in enqueue order. A drain already in
    /// progress makes this call return an empty report.
    pub async fn drain(&self) -> Result<PushReport, SyncError> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("push drain already running");
            return Ok(PushReport::default());
        };

        let queued = self.store.operations_for_drain().await?;
        let mut blocked: HashSet<(EntityFamily, String)> = HashSet::new();
        let mut report = PushReport::default();

        for listed in queued {
            let key = (listed.family, listed.entity_id.clone());
            if blocked.contains(&key) {
                report.skipped += 1;
                continue;
            }
            if listed.status == OpStatus::Failed && !self.auto_retry_eligible(&listed) {
                blocked.insert(key);
                report.skipped += 1;
                continue;
            }
            // Re-read: an earlier create may have re-keyed it, or the user dismissed it.
            let Some(op) = self.store.claim_operation(listed.id).await? else {
                continue;
            };

            match self.execute_with_auth_retry(&op).await {
                Ok(completion) => {
                    let orphaned = self.store.complete_operation(&op, completion).await?;
                    for path in orphaned {
                        if let Err(err) = tokio::fs::remove_file(&path).await
                            && err.kind() != std::io::ErrorKind::NotFound
                        {
                            warn!(path = %path.display(), error = %err, "failed to remove cover");
                        }
                    }
                    debug!(op_id = op.id, kind = op.kind.as_str(), entity_id = %op.entity_id, "operation pushed");
                    self.events.publish(match op.kind {
                        OpKind::Progress => LibraryEvent::ProgressSaved {
                            book_id: op.entity_id.clone(),
                        },
                        _ => LibraryEvent::EntitiesChanged { family: op.family },
                    });
                    report.pushed += 1;
                }
                Err(err) => {
                    warn!(
                        op_id = op.id,
                        kind = op.kind.as_str(),
                        entity_id = %op.entity_id,
                        error = %err,
                        "operation push failed"
                    );
                    self.store
                        .fail_operation(op.id, &err.to_string(), err.is_retryable())
                        .await?;
                    self.events.publish(LibraryEvent::PushOperationFailed {
                        op_id: op.id,
                        entity_id: op.entity_id.clone(),
                    });
                    blocked.insert(key);
                    report.failed += 1;
                }
            }
        }

        if report != PushReport::default() {
            info!(
                pushed = report.pushed,
                failed = report.failed,
                skipped = report.skipped,
                "push drain finished"
            );
        }
        Ok(report)
    }

    fn auto_retry_eligible(&self, op: &PendingOperation) -> bool {
        op.retryable && op.retry_count < self.max_auto_retries
    }

    async fn execute_with_auth_retry(&self, op: &PendingOperation) -> Result<OpCompletion, SyncError> {
        match self.execute(op).await {
            Err(err) if err.is_auth() => {
                let Some(tokens) = &self.tokens else {
                    return Err(err);
                };
                debug!(op_id = op.id, "token rejected, refreshing before retry");
                tokens.refresh_now().await?;
                self.execute(op).await
            }
            other => other,
        }
    }

    async fn execute(&self, op: &PendingOperation) -> Result<OpCompletion, SyncError> {
        let family = op.family;
        let entity = family.as_str();
        match op.kind {
            OpKind::Create => {
                let mut body = op.payload.clone();
                if let Value::Object(map) = &mut body {
                    map.remove("id");
                }
                let echo = self.client.create_entity(entity, &body).await?;
                Ok(completion_from_echo(family, echo))
            }
            OpKind::Update => {
                let echo = self
                    .client
                    .update_entity(entity, &op.entity_id, &op.payload)
                    .await?;
                Ok(completion_from_echo(family, echo))
            }
            OpKind::Delete => {
                self.client.delete_entity(entity, &op.entity_id).await?;
                Ok(OpCompletion::Deleted)
            }
            OpKind::Relations => {
                let relation = op
                    .relation
                    .as_deref()
                    .ok_or_else(|| RecordError::UnknownRelation {
                        family,
                        relation: String::new(),
                    })?;
                let echo = self
                    .client
                    .replace_relation(entity, &op.entity_id, relation, &op.payload)
                    .await?;
                Ok(completion_from_echo(family, echo))
            }
            OpKind::Progress => {
                let progress: ReadingProgress = serde_json::from_value(op.payload.clone())
                    .map_err(|source| RecordError::Payload { family, source })?;
                let echo = self.client.put_reading_progress(&progress).await?;
                Ok(OpCompletion::Progress(ProgressRecord::from_server(&echo)?))
            }
        }
    }

    /// Manual retry of one failed operation, followed by a drain.
    pub async fn retry(&self, op_id: i64) -> Result<PushReport, SyncError> {
        self.store.retry_operation(op_id).await?;
        self.drain().await
    }

    pub async fn retry_all(&self) -> Result<PushReport, SyncError> {
        let reset = self.store.retry_all_failed().await?;
        debug!(reset, "failed operations requeued");
        self.drain().await
    }

    pub async fn dismiss(&self, op_id: i64) -> Result<(), SyncError> {
        let op = self.store.get_operation(op_id).await?;
        self.store.dismiss_operation(op_id).await?;
        if let Some(op) = op {
            self.events
                .publish(LibraryEvent::EntitiesChanged { family: op.family });
        }
        Ok(())
    }

    pub async fn dismiss_all(&self) -> Result<usize, SyncError> {
        Ok(self.store.dismiss_all_failed().await?)
    }

    pub async fn failed_operations(&self) -> Result<Vec<PendingOperation>, SyncError> {
        Ok(self.store.failed_operations().await?)
    }

    pub async fn pending_count(&self) -> Result<i64, SyncError> {
        Ok(self.store.pending_count().await?)
    }

    /// Requeues operations a previous process left in flight.
    pub async fn recover(&self) -> Result<u64, SyncError> {
        let recovered = self.store.recover_in_flight().await?;
        if recovered > 0 {
            info!(recovered, "requeued interrupted push operations");
        }
        Ok(recovered)
    }

    /// Requests a drain without waiting for the next interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn run_worker(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            if let Err(err) = self.drain().await {
                warn!(error = %err, "push drain failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("push worker stopped");
    }
}

/// An echo that does not decode as the family's record still confirms the push.
fn completion_from_echo(family: EntityFamily, echo: Value) -> OpCompletion {
    match incoming_from_value(family, echo) {
        Ok(record) => OpCompletion::Applied(record),
        Err(err) => {
            debug!(family = %family, error = %err, "push response carried no usable entity");
            OpCompletion::Acknowledged
        }
    }
}

#[cfg(test)]
#[path = "push_tests.rs"]
mod tests;
