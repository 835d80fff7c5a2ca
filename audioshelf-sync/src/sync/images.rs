use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use audioshelf_core::{ApiError, AudioshelfClient};
use futures_util::StreamExt;
use futures_util::stream;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventBus, LibraryEvent};
use super::palette::{ImagePaletteExtractor, Palette, PaletteExtractor};
use super::records::EntityFamily;
use super::store::{CoverRecord, CoverState, LibraryStore, StoreError};
use crate::error::{ErrorKind, api_error_kind};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image request failed: {0}")]
    Api(#[from] ApiError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("no cover queued for {family} {id}")]
    NotQueued { family: EntityFamily, id: String },
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("palette extraction panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ImageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImageError::Api(err) => api_error_kind(err),
            ImageError::Store(err) => err.kind(),
            ImageError::NotQueued { .. } => ErrorKind::Data,
            ImageError::Io(_) | ImageError::ConcurrencyClosed | ImageError::Join(_) => {
                ErrorKind::Storage
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ImageError::Api(err) => err.is_retryable(),
            ImageError::Io(err) => err.kind() != io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverResult {
    pub family: EntityFamily,
    pub entity_id: String,
    /// `false` when a current file was already cached.
    pub downloaded: bool,
    pub error: Option<String>,
}

/// Downloads queued covers into a content-addressed cache directory and records
/// their palette.
pub struct ImageDownloader {
    client: Arc<AudioshelfClient>,
    store: Arc<LibraryStore>,
    root: PathBuf,
    extractor: Arc<dyn PaletteExtractor>,
    limit: Arc<Semaphore>,
    concurrency: usize,
    wake: Notify,
    events: EventBus<LibraryEvent>,
}

impl ImageDownloader {
    pub fn new(
        client: Arc<AudioshelfClient>,
        store: Arc<LibraryStore>,
        root: PathBuf,
        concurrency: usize,
        events: EventBus<LibraryEvent>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            client,
            store,
            root,
            extractor: Arc::new(ImagePaletteExtractor::default()),
            limit: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            wake: Notify::new(),
            events,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PaletteExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn cover_path(&self, family: EntityFamily, entity_id: &str) -> PathBuf {
        let digest = Sha256::digest(entity_id.as_bytes());
        let name: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.root.join(family.as_str()).join(format!("{name}.img"))
    }

    /// Downloads one queued cover. Returns `Ok(false)` when the cached file is
    /// current or the cover was re-pointed mid-download; failures are recorded
    /// against the cover before being returned.
    pub async fn download_cover(
        &self,
        family: EntityFamily,
        entity_id: &str,
    ) -> Result<bool, ImageError> {
        let cover = self
            .store
            .get_cover(family, entity_id)
            .await?
            .ok_or_else(|| ImageError::NotQueued {
                family,
                id: entity_id.to_string(),
            })?;
        let target = self.cover_path(family, entity_id);
        if cover.state == CoverState::Downloaded && tokio::fs::try_exists(&target).await? {
            return Ok(false);
        }

        match self.fetch_to(&cover, &target).await {
            Ok(palette) => {
                let current = self
                    .store
                    .complete_cover(family, entity_id, &cover.image_ref, &target, palette)
                    .await?;
                if !current {
                    debug!(family = %family, entity_id, "cover replaced during download");
                    return Ok(false);
                }
                debug!(family = %family, entity_id, "cover cached");
                self.events.publish(LibraryEvent::CoverCached {
                    family,
                    entity_id: entity_id.to_string(),
                });
                Ok(true)
            }
            Err(err) => {
                warn!(family = %family, entity_id, error = %err, "cover download failed");
                self.store
                    .fail_cover(family, entity_id, &cover.image_ref, &err.to_string())
                    .await?;
                Err(err)
            }
        }
    }

    async fn fetch_to(
        &self,
        cover: &CoverRecord,
        target: &Path,
    ) -> Result<Option<Palette>, ImageError> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ImageError::ConcurrencyClosed)?;
        let bytes = self.client.fetch_image(&cover.image_ref).await?;

        let extractor = self.extractor.clone();
        let (palette, bytes) = tokio::task::spawn_blocking(move || {
            let palette = extractor.extract(&bytes);
            (palette, bytes)
        })
        .await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = target.with_extension("img.partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&partial, target).await?;
        Ok(palette)
    }

    /// Best effort: every key is attempted and reported individually.
    pub async fn download_covers(&self, keys: Vec<(EntityFamily, String)>) -> Vec<CoverResult> {
        stream::iter(keys)
            .map(|(family, entity_id)| async move {
                let result = self.download_cover(family, &entity_id).await;
                CoverResult {
                    family,
                    entity_id,
                    downloaded: matches!(result, Ok(true)),
                    error: result.err().map(|err| err.to_string()),
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    /// Removes the cached file; the cover is queued again.
    pub async fn delete_cover(&self, family: EntityFamily, entity_id: &str) -> Result<(), ImageError> {
        remove_if_exists(&self.cover_path(family, entity_id)).await?;
        self.store.reset_cover(family, entity_id).await?;
        Ok(())
    }

    /// Downloads one batch from the cover queue. Stale files are dropped first.
    pub async fn drain_queue(&self, batch: u32, max_attempts: u32) -> Result<Vec<CoverResult>, ImageError> {
        let covers = self.store.covers_to_download(batch, max_attempts).await?;
        if covers.is_empty() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::with_capacity(covers.len());
        for cover in covers {
            if cover.state == CoverState::Stale {
                remove_if_exists(&self.cover_path(cover.family, &cover.entity_id)).await?;
            }
            keys.push((cover.family, cover.entity_id));
        }
        let results = self.download_covers(keys).await;
        let failed = results.iter().filter(|r| r.error.is_some()).count();
        info!(total = results.len(), failed, "cover batch finished");
        Ok(results)
    }

    /// Schedules a queue drain without waiting for the next interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn run_worker(
        self: Arc<Self>,
        interval: Duration,
        batch: u32,
        max_attempts: u32,
        cancel: CancellationToken,
    ) {
        loop {
            if let Err(err) = self.drain_queue(batch, max_attempts).await {
                warn!(error = %err, "cover queue drain failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("cover worker stopped");
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), io::Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
