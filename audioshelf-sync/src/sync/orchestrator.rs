use std::sync::Arc;
use std::time::Duration;

use audioshelf_core::{AudioshelfClient, StatusCode};
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflict::ConflictDetector;
use super::events::{EventBus, LibraryEvent};
use super::images::ImageDownloader;
use super::puller::{PullReport, Pullers};
use super::realtime::RealtimeEvent;
use super::records::{EntityFamily, SyncRecord, now_ms};
use super::status::{SyncFailure, SyncPhase, SyncStatus};
use super::store::{LibraryStore, ProgressRecord, SearchHit, StoreError};
use crate::error::{ErrorKind, SyncError, api_error_kind};
use crate::token_provider::TokenProvider;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// Another cycle was already running; this trigger folded into it.
    Coalesced,
    /// The last successful cycle is more recent than the minimum interval.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    Delta,
    Full,
}

/// Sequences family pulls into sync cycles and publishes the aggregate status.
pub struct SyncOrchestrator {
    client: Arc<AudioshelfClient>,
    store: Arc<LibraryStore>,
    pullers: Pullers,
    tokens: Option<Arc<TokenProvider>>,
    images: Option<Arc<ImageDownloader>>,
    events: EventBus<LibraryEvent>,
    status: watch::Sender<SyncStatus>,
    running: Mutex<()>,
    min_interval: Duration,
    skew: Duration,
}

impl SyncOrchestrator {
    pub fn new(
        client: Arc<AudioshelfClient>,
        store: Arc<LibraryStore>,
        events: EventBus<LibraryEvent>,
        skew: Duration,
        page_size: u32,
    ) -> Self {
        let pullers = Pullers::new(
            client.clone(),
            store.clone(),
            ConflictDetector::new(skew),
            page_size,
        );
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            client,
            store,
            pullers,
            tokens: None,
            images: None,
            events,
            status,
            running: Mutex::new(()),
            min_interval: DEFAULT_MIN_INTERVAL,
            skew,
        }
    }

    pub fn with_token_provider(mut self, tokens: Arc<TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_image_downloader(mut self, images: Arc<ImageDownloader>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn events(&self) -> &EventBus<LibraryEvent> {
        &self.events
    }

    /// User-requested cycle. Runs regardless of when the last one finished.
    pub async fn refresh(&self) -> Result<CycleOutcome, SyncError> {
        self.run_cycle(CycleMode::Delta).await
    }

    /// Background cycle; skipped while the last success is fresh.
    pub async fn periodic_sync(&self) -> Result<CycleOutcome, SyncError> {
        if let Some(last) = self.store.last_successful_sync().await? {
            let elapsed = now_ms().saturating_sub(last);
            if elapsed >= 0 && (elapsed as u128) < self.min_interval.as_millis() {
                debug!(elapsed_ms = elapsed, "periodic sync skipped");
                return Ok(CycleOutcome::Skipped);
            }
        }
        self.run_cycle(CycleMode::Delta).await
    }

    /// Drops every cursor and pulls all families from scratch.
    pub async fn full_resync(&self) -> Result<CycleOutcome, SyncError> {
        self.run_cycle(CycleMode::Full).await
    }

    async fn run_cycle(&self, mode: CycleMode) -> Result<CycleOutcome, SyncError> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("sync cycle already running");
            return Ok(CycleOutcome::Coalesced);
        };
        info!(full = mode == CycleMode::Full, "sync cycle started");

        if mode == CycleMode::Full
            && let Err(err) = self.store.reset_cursors().await
        {
            return Err(self.fail(None, err.into()));
        }

        for family in EntityFamily::PULL_ORDER {
            let updated_after = match mode {
                CycleMode::Full => None,
                CycleMode::Delta => match self.delta_since(family).await {
                    Ok(since) => since,
                    Err(err) => return Err(self.fail(Some(family), err.into())),
                },
            };
            self.status.send_replace(SyncStatus::Syncing {
                phase: family.phase(),
            });
            let report = match self
                .pull_with_auth_retry(family, updated_after, |status| {
                    self.status.send_replace(status);
                })
                .await
            {
                Ok(report) => report,
                Err(err) => return Err(self.fail(Some(family), err)),
            };
            self.announce(family, &report);
        }

        self.status.send_replace(SyncStatus::Syncing {
            phase: SyncPhase::RebuildingSearchIndex,
        });
        let completed_at = now_ms();
        let finish = async {
            let indexed = self.store.rebuild_search_index().await?;
            debug!(indexed, "search index rebuilt");
            self.store.set_last_successful_sync(completed_at).await
        };
        if let Err(err) = finish.await {
            return Err(self.fail(None, err.into()));
        }

        if let Some(images) = &self.images {
            images.wake();
        }
        self.status
            .send_replace(SyncStatus::Success { completed_at });
        info!("sync cycle finished");
        Ok(CycleOutcome::Completed)
    }

    /// Delta pull of one family outside a full cycle. Waits for a running cycle
    /// rather than folding into it, since that cycle may be past the family.
    pub async fn sync_family(&self, family: EntityFamily) -> Result<PullReport, SyncError> {
        let _running = self.running.lock().await;
        let updated_after = self.delta_since(family).await?;
        let report = self
            .pull_with_auth_retry(family, updated_after, |_| {})
            .await?;
        if report.upserted + report.deleted + report.conflicts > 0 {
            self.store.rebuild_search_index().await?;
        }
        self.announce(family, &report);
        if report.covers_enqueued > 0
            && let Some(images) = &self.images
        {
            images.wake();
        }
        Ok(report)
    }

    /// Re-pulls one book's reading progress. Returns whether the local copy
    /// changed; a book without server progress is not an error.
    pub async fn refresh_book_progress(&self, book_id: &str) -> Result<bool, SyncError> {
        let fetched = match self.client.get_reading_progress(book_id).await {
            Err(err) if api_error_kind(&err) == ErrorKind::Auth && self.tokens.is_some() => {
                self.refresh_token().await?;
                self.client.get_reading_progress(book_id).await
            }
            other => other,
        };
        let progress = match fetched {
            Ok(progress) => progress,
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let applied = self
            .store
            .apply_server_progress(&ProgressRecord::from_server(&progress)?)
            .await?;
        if applied {
            self.events.publish(LibraryEvent::ProgressSaved {
                book_id: book_id.to_string(),
            });
        }
        Ok(applied)
    }

    pub async fn handle_realtime_event(&self, event: &RealtimeEvent) -> Result<(), SyncError> {
        match event {
            RealtimeEvent::ReadingSessionUpdated { book_id } => {
                self.refresh_book_progress(book_id).await?;
            }
            RealtimeEvent::InboxBookAdded { book_id } | RealtimeEvent::InboxBookReleased { book_id } => {
                debug!(book_id = %book_id, "inbox changed, pulling books");
                self.sync_family(EntityFamily::Books).await?;
            }
            RealtimeEvent::UserPending { .. } | RealtimeEvent::UserApproved { .. } => {}
            RealtimeEvent::Unknown { event } => debug!(event = %event, "ignoring realtime event"),
        }
        Ok(())
    }

    /// Feeds realtime events into targeted pulls until cancelled or the bus closes.
    pub async fn run_listener(
        self: Arc<Self>,
        mut events: broadcast::Receiver<RealtimeEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => received,
            };
            match received {
                Ok(event) => {
                    if let Err(err) = self.handle_realtime_event(&event).await {
                        warn!(error = %err, "realtime event handling failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "realtime listener lagged, running delta sync");
                    if let Err(err) = self.refresh().await {
                        warn!(error = %err, "catch-up sync failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("realtime listener stopped");
    }

    pub async fn run_periodic(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            if let Err(err) = self.periodic_sync().await {
                debug!(error = %err, "periodic sync failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("periodic sync stopped");
    }

    pub async fn load<T: SyncRecord>(&self, id: &str) -> Result<Option<T>, StoreError> {
        self.store.load(id).await
    }

    pub async fn list<T: SyncRecord>(&self) -> Result<Vec<T>, StoreError> {
        self.store.list().await
    }

    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>, StoreError> {
        self.store.search(query, limit).await
    }

    async fn delta_since(&self, family: EntityFamily) -> Result<Option<i64>, StoreError> {
        let skew_ms = self.skew.as_millis().min(i64::MAX as u128) as i64;
        let cursor = self.store.get_cursor(family).await?;
        Ok(cursor
            .last_synced_at
            .map(|at| at.saturating_sub(skew_ms).max(0)))
    }

    async fn pull_with_auth_retry<F>(
        &self,
        family: EntityFamily,
        updated_after: Option<i64>,
        mut on_progress: F,
    ) -> Result<PullReport, SyncError>
    where
        F: FnMut(SyncStatus) + Send,
    {
        match self
            .pullers
            .pull_family(family, updated_after, &mut on_progress)
            .await
        {
            Err(err) if err.is_auth() && self.tokens.is_some() => {
                debug!(family = %family, "token rejected during pull, refreshing");
                self.refresh_token().await?;
                self.pullers
                    .pull_family(family, updated_after, &mut on_progress)
                    .await
            }
            other => other,
        }
    }

    async fn refresh_token(&self) -> Result<(), SyncError> {
        if let Some(tokens) = &self.tokens {
            tokens.refresh_now().await?;
        }
        Ok(())
    }

    fn announce(&self, family: EntityFamily, report: &PullReport) {
        if report.upserted + report.deleted + report.conflicts > 0 {
            self.events.publish(LibraryEvent::EntitiesChanged { family });
        }
    }

    fn fail(&self, family: Option<EntityFamily>, err: SyncError) -> SyncError {
        warn!(
            family = family.map(|f| f.as_str()),
            kind = err.kind().as_str(),
            error = %err,
            "sync cycle failed"
        );
        self.status.send_replace(SyncStatus::Error {
            failure: SyncFailure {
                kind: err.kind(),
                retryable: err.is_retryable(),
                family,
                message: err.to_string(),
            },
        });
        err
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
