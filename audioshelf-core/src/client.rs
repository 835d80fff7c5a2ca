use std::sync::{Arc, RwLock};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::models::{ReadingProgress, SyncPage};
use crate::sse::{SseDecoder, SseFrame};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// REST client for the library server.
///
/// The bearer token lives behind a shared lock so a token refresh performed
/// elsewhere is picked up by every clone of the client on its next request.
#[derive(Clone)]
pub struct AudioshelfClient {
    http: Client,
    base_url: Url,
    token: Arc<RwLock<String>>,
}

impl AudioshelfClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_http(Client::new(), base_url, token)
    }

    pub fn with_http(
        http: Client,
        base_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: Arc::new(RwLock::new(token.into())),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn access_token(&self) -> String {
        match self.token.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_access_token(&self, token: impl Into<String>) {
        let token = token.into();
        match self.token.write() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    /// Fetches one page of `GET /sync/<entity>`.
    ///
    /// A missing `updated_after` requests a full sync.
    pub async fn list_sync_page<T: DeserializeOwned>(
        &self,
        entity: &str,
        cursor: Option<&str>,
        page_size: u32,
        updated_after: Option<&str>,
    ) -> Result<SyncPage<T>, ApiError> {
        let mut url = self.endpoint(&format!("/sync/{entity}"))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
            query.append_pair("pageSize", &page_size.max(1).to_string());
            if let Some(updated_after) = updated_after {
                query.append_pair("updatedAfter", updated_after);
            }
        }
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn create_entity(&self, entity: &str, body: &Value) -> Result<Value, ApiError> {
        let url = self.endpoint(&format!("/{entity}"))?;
        let response = self
            .authorized(self.http.post(url))
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_entity(
        &self,
        entity: &str,
        id: &str,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let url = self.entity_url(entity, id, None)?;
        let response = self
            .authorized(self.http.patch(url))
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_entity(&self, entity: &str, id: &str) -> Result<(), ApiError> {
        let url = self.entity_url(entity, id, None)?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Api { status, body })
    }

    /// Replaces one relationship list of an entity, e.g. a book's contributors.
    pub async fn replace_relation(
        &self,
        entity: &str,
        id: &str,
        relation: &str,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let url = self.entity_url(entity, id, Some(relation))?;
        let response = self
            .authorized(self.http.put(url))
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_reading_progress(&self, book_id: &str) -> Result<ReadingProgress, ApiError> {
        let url = self.entity_url("books", book_id, Some("progress"))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn put_reading_progress(
        &self,
        progress: &ReadingProgress,
    ) -> Result<ReadingProgress, ApiError> {
        let url = self.entity_url("books", &progress.book_id, Some("progress"))?;
        let response = self
            .authorized(self.http.put(url))
            .json(progress)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Downloads image bytes. Relative references resolve against the base url
    /// and carry the bearer token; absolute urls to other hosts do not.
    pub async fn fetch_image(&self, reference: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.base_url.join(reference)?;
        let same_origin = url.origin() == self.base_url.origin();
        let mut request = self.http.get(url);
        if same_origin {
            request = self.authorized(request);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Api { status, body });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Opens the long-lived `GET /events` server-sent-events stream.
    pub async fn open_event_stream(
        &self,
        last_event_id: Option<&str>,
    ) -> Result<EventStream, ApiError> {
        let url = self.endpoint("/events")?;
        let mut request = self
            .authorized(self.http.get(url))
            .header("Accept", "text/event-stream");
        if let Some(last_event_id) = last_event_id {
            request = request.header("Last-Event-ID", last_event_id);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Api { status, body });
        }
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(EventStream {
            chunks,
            decoder: SseDecoder::default(),
            ready: Vec::new(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.access_token())
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        Ok(url)
    }

    fn entity_url(&self, entity: &str, id: &str, relation: Option<&str>) -> Result<Url, ApiError> {
        let mut url = self.endpoint(&format!("/{entity}"))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
            segments.push(id);
            if let Some(relation) = relation {
                segments.push(relation);
            }
        }
        Ok(url)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        if response.status().is_success() {
            let body = response.bytes().await?;
            Ok(serde_json::from_slice(&body)?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Api { status, body })
        }
    }
}

/// Decoded frames of an open server-sent-events connection.
pub struct EventStream {
    chunks: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    ready: Vec<SseFrame>,
}

impl EventStream {
    /// Returns the next complete frame, or `None` once the server closes the stream.
    pub async fn next_frame(&mut self) -> Result<Option<SseFrame>, ApiError> {
        loop {
            if !self.ready.is_empty() {
                return Ok(Some(self.ready.remove(0)));
            }
            match self.chunks.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    self.ready.extend(self.decoder.push(&chunk));
                }
                None => return Ok(None),
            }
        }
    }
}

impl ApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            ApiError::Request(err) => err.status(),
            _ => None,
        }
    }

    /// Transport-level failure: the server was never reached or the body was cut off.
    pub fn is_network(&self) -> bool {
        match self {
            ApiError::Request(err) => {
                err.is_connect() || err.is_timeout() || err.is_request() || err.is_body()
            }
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.classification() == Some(ApiErrorClass::Auth)
    }

    pub fn is_retryable(&self) -> bool {
        self.is_network()
            || matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}
