use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("auth endpoint returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl AuthError {
    /// The refresh token itself was rejected; only a new login can recover.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            AuthError::Api { status, .. }
                if matches!(*status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST)
        )
    }
}

#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: Url,
}

impl AuthClient {
    pub fn new(base_url: &str) -> Result<Self, AuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    /// Exchanges a refresh token for a new token pair via `POST /auth/refresh`.
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthTokens, AuthError> {
        let mut url = self.base_url.clone();
        let joined = format!("{}/auth/refresh", url.path().trim_end_matches('/'));
        url.set_path(&joined);

        let response = self
            .http
            .post(url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json::<AuthTokens>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::Api { status, body })
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}
