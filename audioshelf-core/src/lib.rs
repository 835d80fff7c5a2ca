mod auth;
mod client;
mod models;
mod sse;

pub use auth::{AuthClient, AuthError, AuthTokens};
pub use client::{ApiError, ApiErrorClass, AudioshelfClient, EventStream};
pub use models::{
    Book, BookContributor, BookSeries, Collection, Contributor, DimensionRef, Genre, Lens,
    Profile, ReadingProgress, Series, SyncPage, Tag,
};
pub use reqwest::StatusCode;
pub use sse::{SseDecoder, SseFrame};
