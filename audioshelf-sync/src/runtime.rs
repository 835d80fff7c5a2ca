use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use audioshelf_core::{ApiError, AudioshelfClient, AuthClient, AuthError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::sync::backoff::Backoff;
use crate::sync::events::{EventBus, LibraryEvent};
use crate::sync::images::ImageDownloader;
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::push::PushSyncOrchestrator;
use crate::sync::realtime::RealtimeManager;
use crate::sync::store::{LibraryStore, StoreError};
use crate::token_provider::{Credentials, TokenProvider};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to build api client: {0}")]
    Client(#[from] ApiError),
    #[error("failed to build auth client: {0}")]
    Auth(#[from] AuthError),
    #[error("failed to open library store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to create cover directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns every engine component and the background tasks that drive them.
pub struct SyncRuntime {
    config: SyncConfig,
    store: Arc<LibraryStore>,
    tokens: Arc<TokenProvider>,
    events: EventBus<LibraryEvent>,
    images: Arc<ImageDownloader>,
    realtime: Arc<RealtimeManager>,
    push: Arc<PushSyncOrchestrator>,
    sync: Arc<SyncOrchestrator>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl SyncRuntime {
    pub async fn bootstrap(config: SyncConfig, credentials: Credentials) -> Result<Self, RuntimeError> {
        tokio::fs::create_dir_all(&config.cover_dir).await?;
        let store = Arc::new(LibraryStore::open(&config.database_path).await?);
        let client = Arc::new(AudioshelfClient::new(
            &config.server_url,
            credentials.access_token.clone(),
        )?);
        let auth = match credentials.refresh_token {
            Some(_) => Some(AuthClient::new(&config.server_url)?),
            None => None,
        };
        let tokens = Arc::new(TokenProvider::new(client.clone(), credentials, auth));
        let events = EventBus::new(EVENT_BUS_CAPACITY);

        let images = Arc::new(ImageDownloader::new(
            client.clone(),
            store.clone(),
            config.cover_dir.clone(),
            config.cover_concurrency,
            events.clone(),
        ));
        let realtime = Arc::new(
            RealtimeManager::new(
                client.clone(),
                EventBus::new(EVENT_BUS_CAPACITY),
                Backoff::new(
                    config.realtime_backoff_base,
                    config.realtime_backoff_max,
                    true,
                ),
                config.realtime_max_attempts,
            )
            .with_token_provider(tokens.clone()),
        );
        let push = Arc::new(
            PushSyncOrchestrator::new(client.clone(), store.clone(), events.clone())
                .with_token_provider(tokens.clone())
                .with_max_auto_retries(config.push_max_auto_retries),
        );
        let sync = Arc::new(
            SyncOrchestrator::new(
                client,
                store.clone(),
                events.clone(),
                config.clock_skew,
                config.page_size,
            )
            .with_token_provider(tokens.clone())
            .with_image_downloader(images.clone())
            .with_min_interval(config.min_sync_interval),
        );

        Ok(Self {
            config,
            store,
            tokens,
            events,
            images,
            realtime,
            push,
            sync,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Spawns the long-lived tasks. Calling it again is a no-op.
    pub async fn start(&self) -> Result<(), SyncError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.push.recover().await?;

        let config = &self.config;
        self.tasks.spawn(
            self.sync
                .clone()
                .run_periodic(config.periodic_interval, self.cancel.child_token()),
        );
        self.tasks.spawn(
            self.sync
                .clone()
                .run_listener(self.realtime.subscribe(), self.cancel.child_token()),
        );
        self.tasks.spawn(
            self.push
                .clone()
                .run_worker(config.push_interval, self.cancel.child_token()),
        );
        self.tasks.spawn(self.images.clone().run_worker(
            config.cover_interval,
            config.cover_batch_size,
            config.cover_max_attempts,
            self.cancel.child_token(),
        ));
        self.tasks
            .spawn(self.tokens.clone().run_refresh_loop(self.cancel.child_token()));
        self.realtime.connect().await;

        info!(server_url = %config.server_url, "sync runtime started");
        Ok(())
    }

    /// Cancels every background task and waits for them to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.realtime.disconnect().await;
        self.tasks.close();
        self.tasks.wait().await;
        info!("sync runtime stopped");
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LibraryStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus<LibraryEvent> {
        &self.events
    }

    pub fn sync(&self) -> &Arc<SyncOrchestrator> {
        &self.sync
    }

    pub fn push(&self) -> &Arc<PushSyncOrchestrator> {
        &self.push
    }

    pub fn images(&self) -> &Arc<ImageDownloader> {
        &self.images
    }

    pub fn realtime(&self) -> &Arc<RealtimeManager> {
        &self.realtime
    }

    pub fn tokens(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }
}
