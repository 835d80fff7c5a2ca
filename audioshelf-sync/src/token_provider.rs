use std::sync::Arc;
use std::time::Duration;

use audioshelf_core::{AudioshelfClient, AuthClient, AuthError, AuthTokens};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;

const REFRESH_FAILURE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("auth client is required to refresh expired token")]
    MissingAuthClient,
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("token refresh failed: {0}")]
    Auth(#[from] AuthError),
}

impl TokenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenError::MissingAuthClient | TokenError::MissingRefreshToken => ErrorKind::Auth,
            TokenError::Auth(err) if err.is_rejected() => ErrorKind::Auth,
            TokenError::Auth(AuthError::Request(_)) => ErrorKind::Network,
            TokenError::Auth(_) => ErrorKind::Server,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TokenError::Auth(AuthError::Request(_)) => true,
            TokenError::Auth(AuthError::Api { status, .. }) => status.is_server_error(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: Option<i64>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: None,
        }
    }

    fn from_tokens(tokens: &AuthTokens, now: i64) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            expires_at: tokens
                .expires_in
                .map(|secs| now.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX))),
        }
    }
}

/// Owns the credentials and keeps the API client's bearer token current.
///
/// Readers take the cached token synchronously through the client. Refreshes are
/// single-flight: callers that observed the same stale token wait for one
/// refresh and reuse its result.
pub struct TokenProvider {
    client: Arc<AudioshelfClient>,
    auth: Option<AuthClient>,
    state: Mutex<Credentials>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(
        client: Arc<AudioshelfClient>,
        credentials: Credentials,
        auth: Option<AuthClient>,
    ) -> Self {
        client.set_access_token(credentials.access_token.clone());
        Self {
            client,
            auth,
            state: Mutex::new(credentials),
            refresh_skew_secs: 60,
        }
    }

    pub fn access_token(&self) -> String {
        self.client.access_token()
    }

    pub async fn credentials(&self) -> Credentials {
        self.state.lock().await.clone()
    }

    pub async fn valid_access_token(&self) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;
        if self.should_refresh(&state) {
            return self.refresh_locked(&mut state).await;
        }
        Ok(state.access_token.clone())
    }

    /// Forces a refresh, typically after the server rejected the current token.
    pub async fn refresh_now(&self) -> Result<String, TokenError> {
        let observed = self.client.access_token();
        let mut state = self.state.lock().await;
        if state.access_token != observed {
            debug!("token already refreshed by a concurrent caller");
            return Ok(state.access_token.clone());
        }
        self.refresh_locked(&mut state).await
    }

    /// Time until the token should be refreshed; `None` without a known expiry.
    pub async fn next_refresh_delay(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        let expires_at = state.expires_at?;
        let due = expires_at.saturating_sub(self.refresh_skew_secs);
        let remaining = due.saturating_sub(now_unix()).max(0);
        Some(Duration::from_secs(remaining as u64))
    }

    /// Refreshes ahead of expiry until cancelled or the refresh token is rejected.
    pub async fn run_refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let Some(delay) = self.next_refresh_delay().await else {
                debug!("token has no expiry, refresh loop idle");
                cancel.cancelled().await;
                return;
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.valid_access_token().await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Auth => {
                    warn!(error = %err, "refresh token rejected, stopping refresh loop");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "token refresh failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(REFRESH_FAILURE_DELAY) => {}
                    }
                }
            }
        }
    }

    fn should_refresh(&self, state: &Credentials) -> bool {
        let Some(expires_at) = state.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn refresh_locked(&self, state: &mut Credentials) -> Result<String, TokenError> {
        let refresh_token = state
            .refresh_token
            .clone()
            .ok_or(TokenError::MissingRefreshToken)?;
        let auth = self.auth.as_ref().ok_or(TokenError::MissingAuthClient)?;
        let tokens = auth.refresh(&refresh_token).await?;
        let mut refreshed = Credentials::from_tokens(&tokens, now_unix());
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        self.client.set_access_token(refreshed.access_token.clone());
        *state = refreshed;
        info!("access token refreshed");
        Ok(state.access_token.clone())
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
