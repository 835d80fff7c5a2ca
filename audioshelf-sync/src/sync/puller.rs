use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use audioshelf_core::{
    AudioshelfClient, Book, Collection, Contributor, Genre, Lens, Profile, Series, Tag,
};
use tracing::{debug, info, warn};

use super::conflict::ConflictDetector;
use super::records::{EntityFamily, IncomingRecord, SyncRecord, format_timestamp, now_ms};
use super::status::SyncStatus;
use super::store::LibraryStore;
use crate::error::SyncError;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: u32,
    pub upserted: usize,
    pub deleted: usize,
    pub preserved: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub covers_enqueued: usize,
}

/// Cursor-paginated pull of one entity family into the store.
pub struct EntityPuller<T: SyncRecord> {
    client: Arc<AudioshelfClient>,
    store: Arc<LibraryStore>,
    detector: ConflictDetector,
    page_size: u32,
    _record: PhantomData<fn() -> T>,
}

impl<T: SyncRecord> EntityPuller<T> {
    pub fn new(
        client: Arc<AudioshelfClient>,
        store: Arc<LibraryStore>,
        detector: ConflictDetector,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            store,
            detector,
            page_size: page_size.max(1),
            _record: PhantomData,
        }
    }

    /// Pulls every page changed after `updated_after` (`None` for a full pull).
    ///
    /// An interrupted run resumes from the stored cursor with the `updatedAfter`
    /// and start time of the run that saved it. The cursor is persisted after
    /// each page, so a failure loses at most the page in flight. `on_progress`
    /// fires once per page.
    pub async fn pull<F>(
        &self,
        updated_after: Option<i64>,
        mut on_progress: F,
    ) -> Result<PullReport, SyncError>
    where
        F: FnMut(SyncStatus) + Send,
    {
        let family = T::FAMILY;
        let stored = self.store.get_cursor(family).await?;
        let (mut cursor, run_updated_after, run_started) = match stored.cursor {
            Some(cursor) => {
                debug!(family = %family, cursor = %cursor, "resuming interrupted pull");
                let started = stored.run_started_at.unwrap_or_else(now_ms);
                (Some(cursor), stored.run_updated_after, started)
            }
            None => (None, updated_after, now_ms()),
        };
        let updated_after_param = run_updated_after.map(format_timestamp).transpose()?;

        let mut report = PullReport::default();
        let mut processed: u64 = 0;
        loop {
            let page = self
                .client
                .list_sync_page::<T>(
                    family.as_str(),
                    cursor.as_deref(),
                    self.page_size,
                    updated_after_param.as_deref(),
                )
                .await?;

            let records = page
                .items
                .iter()
                .map(IncomingRecord::from_record)
                .collect::<Result<Vec<_>, _>>()?;
            let outcome = self
                .store
                .apply_page(family, &records, &page.deleted_ids, &self.detector)
                .await?;
            remove_orphaned_covers(outcome.orphaned_covers).await;

            report.pages += 1;
            report.upserted += outcome.upserted;
            report.deleted += outcome.deleted;
            report.preserved += outcome.preserved;
            report.conflicts += outcome.conflicts;
            report.skipped += outcome.skipped;
            report.covers_enqueued += outcome.covers_enqueued;
            processed += (page.items.len() + page.deleted_ids.len()) as u64;
            on_progress(SyncStatus::Progress {
                phase: family.phase(),
                current: processed,
                total: page.total,
            });

            if !page.has_more {
                break;
            }
            let Some(next) = page.next_cursor else {
                return Err(SyncError::InvalidPage {
                    family,
                    reason: "hasMore without nextCursor".into(),
                });
            };
            self.store
                .save_cursor(family, Some(&next), run_updated_after, run_started)
                .await?;
            cursor = Some(next);
        }

        self.store.finish_cursor(family, run_started).await?;
        info!(
            family = %family,
            pages = report.pages,
            upserted = report.upserted,
            deleted = report.deleted,
            conflicts = report.conflicts,
            "pull finished"
        );
        Ok(report)
    }
}

async fn remove_orphaned_covers(paths: Vec<PathBuf>) {
    for path in paths {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed orphaned cover"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove orphaned cover"),
        }
    }
}

/// One typed puller per family, addressed by [`EntityFamily`].
pub struct Pullers {
    contributors: EntityPuller<Contributor>,
    series: EntityPuller<Series>,
    genres: EntityPuller<Genre>,
    tags: EntityPuller<Tag>,
    books: EntityPuller<Book>,
    collections: EntityPuller<Collection>,
    lenses: EntityPuller<Lens>,
    profile: EntityPuller<Profile>,
}

impl Pullers {
    pub fn new(
        client: Arc<AudioshelfClient>,
        store: Arc<LibraryStore>,
        detector: ConflictDetector,
        page_size: u32,
    ) -> Self {
        let make = || (client.clone(), store.clone(), detector, page_size);
        Self {
            contributors: build(make()),
            series: build(make()),
            genres: build(make()),
            tags: build(make()),
            books: build(make()),
            collections: build(make()),
            lenses: build(make()),
            profile: build(make()),
        }
    }

    pub async fn pull_family<F>(
        &self,
        family: EntityFamily,
        updated_after: Option<i64>,
        on_progress: F,
    ) -> Result<PullReport, SyncError>
    where
        F: FnMut(SyncStatus) + Send,
    {
        match family {
            EntityFamily::Contributors => self.contributors.pull(updated_after, on_progress).await,
            EntityFamily::Series => self.series.pull(updated_after, on_progress).await,
            EntityFamily::Genres => self.genres.pull(updated_after, on_progress).await,
            EntityFamily::Tags => self.tags.pull(updated_after, on_progress).await,
            EntityFamily::Books => self.books.pull(updated_after, on_progress).await,
            EntityFamily::Collections => self.collections.pull(updated_after, on_progress).await,
            EntityFamily::Lenses => self.lenses.pull(updated_after, on_progress).await,
            EntityFamily::Profile => self.profile.pull(updated_after, on_progress).await,
        }
    }
}

fn build<T: SyncRecord>(
    (client, store, detector, page_size): (Arc<AudioshelfClient>, Arc<LibraryStore>, ConflictDetector, u32),
) -> EntityPuller<T> {
    EntityPuller::new(client, store, detector, page_size)
}
