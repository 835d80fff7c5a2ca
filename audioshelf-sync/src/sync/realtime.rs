use std::sync::Arc;
use std::time::Duration;

use audioshelf_core::{AudioshelfClient, SseFrame};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::events::EventBus;
use crate::token_provider::TokenProvider;

/// Typed server push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    UserPending { user_id: String },
    UserApproved { user_id: String },
    InboxBookAdded { book_id: String },
    InboxBookReleased { book_id: String },
    ReadingSessionUpdated { book_id: String },
    /// Well-formed but not understood by this client.
    Unknown { event: String },
}

impl RealtimeEvent {
    /// The event name comes from the `event:` field, or from the JSON `type`
    /// field for streams that only send `data:`. Heartbeats and events missing
    /// their id yield `None`.
    pub fn from_frame(frame: &SseFrame) -> Option<Self> {
        let payload: Value = serde_json::from_str(&frame.data).unwrap_or(Value::Null);
        let name = frame.event.clone().or_else(|| {
            payload
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string)
        })?;
        let body = payload
            .get("data")
            .filter(|data| data.is_object())
            .unwrap_or(&payload);
        let field = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);

        match name.as_str() {
            "user_pending" => Some(RealtimeEvent::UserPending {
                user_id: field("userId")?,
            }),
            "user_approved" => Some(RealtimeEvent::UserApproved {
                user_id: field("userId")?,
            }),
            "inbox_book_added" => Some(RealtimeEvent::InboxBookAdded {
                book_id: field("bookId")?,
            }),
            "inbox_book_released" => Some(RealtimeEvent::InboxBookReleased {
                book_id: field("bookId")?,
            }),
            "reading_session_updated" => Some(RealtimeEvent::ReadingSessionUpdated {
                book_id: field("bookId")?,
            }),
            "ping" | "heartbeat" => None,
            other => Some(RealtimeEvent::Unknown {
                event: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RealtimeState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts are exhausted; data may be stale until the next connect.
    Disconnected,
}

/// Single long-lived event-stream connection, demuxed onto an [`EventBus`].
/// It never touches the store.
pub struct RealtimeManager {
    client: Arc<AudioshelfClient>,
    tokens: Option<Arc<TokenProvider>>,
    events: EventBus<RealtimeEvent>,
    state: Arc<watch::Sender<RealtimeState>>,
    backoff: Backoff,
    max_attempts: u32,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RealtimeManager {
    pub fn new(
        client: Arc<AudioshelfClient>,
        events: EventBus<RealtimeEvent>,
        backoff: Backoff,
        max_attempts: u32,
    ) -> Self {
        let (state, _) = watch::channel(RealtimeState::Idle);
        Self {
            client,
            tokens: None,
            events,
            state: Arc::new(state),
            backoff,
            max_attempts,
            task: Mutex::new(None),
        }
    }

    pub fn with_token_provider(mut self, tokens: Arc<TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<RealtimeState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> RealtimeState {
        *self.state.borrow()
    }

    /// Starts the connection task. A second call while it runs is a no-op.
    pub async fn connect(&self) {
        let mut task = self.task.lock().await;
        if let Some((_, handle)) = task.as_ref()
            && !handle.is_finished()
        {
            return;
        }
        let cancel = CancellationToken::new();
        let connection = Connection {
            client: self.client.clone(),
            tokens: self.tokens.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            backoff: self.backoff,
            max_attempts: self.max_attempts,
        };
        let handle = tokio::spawn(connection.run(cancel.clone()));
        *task = Some((cancel, handle));
    }

    pub async fn disconnect(&self) {
        let running = self.task.lock().await.take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(err) = handle.await {
                warn!(error = %err, "realtime task ended abnormally");
            }
        }
        self.state.send_replace(RealtimeState::Idle);
    }
}

struct Connection {
    client: Arc<AudioshelfClient>,
    tokens: Option<Arc<TokenProvider>>,
    events: EventBus<RealtimeEvent>,
    state: Arc<watch::Sender<RealtimeState>>,
    backoff: Backoff,
    max_attempts: u32,
}

impl Connection {
    async fn run(self, cancel: CancellationToken) {
        let mut last_event_id: Option<String> = None;
        let mut retry_hint: Option<Duration> = None;
        let mut attempt: u32 = 0;

        loop {
            self.state.send_replace(if attempt == 0 {
                RealtimeState::Connecting
            } else {
                RealtimeState::Reconnecting { attempt }
            });
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = self.client.open_event_stream(last_event_id.as_deref()) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    attempt = 0;
                    self.state.send_replace(RealtimeState::Connected);
                    info!("realtime stream connected");
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = stream.next_frame() => next,
                        };
                        match next {
                            Ok(Some(frame)) => {
                                if let Some(id) = &frame.id {
                                    last_event_id = Some(id.clone());
                                }
                                if let Some(ms) = frame.retry_ms {
                                    retry_hint = Some(Duration::from_millis(ms));
                                }
                                match RealtimeEvent::from_frame(&frame) {
                                    Some(event) => {
                                        debug!(event = ?event, "realtime event");
                                        self.events.publish(event);
                                    }
                                    None => debug!(event = ?frame.event, "ignoring realtime frame"),
                                }
                            }
                            Ok(None) => {
                                debug!("realtime stream closed by server");
                                break;
                            }
                            Err(err) => {
                                warn!(error = %err, "realtime stream interrupted");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(attempt, error = %err, "realtime connect failed");
                    if err.is_auth()
                        && let Some(tokens) = &self.tokens
                        && let Err(refresh_err) = tokens.refresh_now().await
                    {
                        warn!(error = %refresh_err, "token refresh for realtime failed");
                    }
                }
            }

            attempt += 1;
            if attempt > self.max_attempts {
                warn!(attempts = attempt - 1, "realtime reconnect attempts exhausted");
                self.state.send_replace(RealtimeState::Disconnected);
                return;
            }
            let delay = self.backoff.delay_with_hint(attempt - 1, retry_hint);
            self.state
                .send_replace(RealtimeState::Reconnecting { attempt });
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
