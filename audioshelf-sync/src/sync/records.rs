use std::fmt;

use audioshelf_core::{
    Book, BookContributor, BookSeries, Collection, Contributor, DimensionRef, Genre, Lens,
    Profile, Series, Tag,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::status::SyncPhase;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        source: time::error::Parse,
    },
    #[error("timestamp {0} is out of range")]
    TimestampRange(i64),
    #[error("failed to format timestamp: {0}")]
    Format(#[from] time::error::Format),
    #[error("malformed {family} payload: {source}")]
    Payload {
        family: EntityFamily,
        source: serde_json::Error,
    },
    #[error("unknown entity family: {0}")]
    UnknownFamily(String),
    #[error("unknown relation {relation:?} for {family}")]
    UnknownRelation {
        family: EntityFamily,
        relation: String,
    },
}

/// One server-side collection that is pulled and stored as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityFamily {
    Contributors,
    Series,
    Genres,
    Tags,
    Books,
    Collections,
    Lenses,
    Profile,
}

impl EntityFamily {
    /// Dependency order: books reference contributors, series, genres and tags by
    /// id, collections and lenses reference books.
    pub const PULL_ORDER: [EntityFamily; 8] = [
        EntityFamily::Contributors,
        EntityFamily::Series,
        EntityFamily::Genres,
        EntityFamily::Tags,
        EntityFamily::Books,
        EntityFamily::Collections,
        EntityFamily::Lenses,
        EntityFamily::Profile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityFamily::Contributors => "contributors",
            EntityFamily::Series => "series",
            EntityFamily::Genres => "genres",
            EntityFamily::Tags => "tags",
            EntityFamily::Books => "books",
            EntityFamily::Collections => "collections",
            EntityFamily::Lenses => "lenses",
            EntityFamily::Profile => "profile",
        }
    }

    pub fn parse(value: &str) -> Result<Self, RecordError> {
        match value {
            "contributors" => Ok(EntityFamily::Contributors),
            "series" => Ok(EntityFamily::Series),
            "genres" => Ok(EntityFamily::Genres),
            "tags" => Ok(EntityFamily::Tags),
            "books" => Ok(EntityFamily::Books),
            "collections" => Ok(EntityFamily::Collections),
            "lenses" => Ok(EntityFamily::Lenses),
            "profile" => Ok(EntityFamily::Profile),
            other => Err(RecordError::UnknownFamily(other.to_string())),
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            EntityFamily::Profile => "profiles",
            other => other.as_str(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        match self {
            EntityFamily::Contributors => SyncPhase::Contributors,
            EntityFamily::Series => SyncPhase::Series,
            EntityFamily::Genres => SyncPhase::Genres,
            EntityFamily::Tags => SyncPhase::Tags,
            EntityFamily::Books => SyncPhase::Books,
            EntityFamily::Collections => SyncPhase::Collections,
            EntityFamily::Lenses => SyncPhase::Lenses,
            EntityFamily::Profile => SyncPhase::Profile,
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(
            self,
            EntityFamily::Books
                | EntityFamily::Series
                | EntityFamily::Contributors
                | EntityFamily::Profile
        )
    }

    /// JSON key holding the human-readable name in this family's payloads.
    pub(crate) fn name_key(&self) -> &'static str {
        match self {
            EntityFamily::Books => "title",
            EntityFamily::Profile => "displayName",
            _ => "name",
        }
    }

    /// Maps a relation path segment (`/books/{id}/contributors`) to the payload key
    /// that carries it.
    pub fn relation_key(&self, relation: &str) -> Result<&'static str, RecordError> {
        let key = match (self, relation) {
            (EntityFamily::Books, "contributors") => Some("contributors"),
            (EntityFamily::Books, "series") => Some("series"),
            (EntityFamily::Books, "tags") => Some("tags"),
            (EntityFamily::Books, "genres") => Some("genres"),
            (EntityFamily::Collections | EntityFamily::Lenses, "books") => Some("bookIds"),
            _ => None,
        };
        key.ok_or_else(|| RecordError::UnknownRelation {
            family: *self,
            relation: relation.to_string(),
        })
    }
}

impl fmt::Display for EntityFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Junction rows carried by one entity snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationRows {
    pub contributors: Vec<BookContributor>,
    pub series: Vec<BookSeries>,
    pub tags: Vec<DimensionRef>,
    pub genres: Vec<DimensionRef>,
    /// Ordered book ids of a collection or lens.
    pub members: Vec<String>,
}

/// A wire DTO that can be pulled and stored by the sync engine.
pub trait SyncRecord: Serialize + DeserializeOwned + Send + Sync + 'static {
    const FAMILY: EntityFamily;

    fn id(&self) -> &str;
    fn updated_at(&self) -> &str;
    fn display_name(&self) -> &str;

    fn image_ref(&self) -> Option<&str> {
        None
    }

    fn relations(&self) -> RelationRows {
        RelationRows::default()
    }
}

impl SyncRecord for Book {
    const FAMILY: EntityFamily = EntityFamily::Books;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn display_name(&self) -> &str {
        &self.title
    }

    fn image_ref(&self) -> Option<&str> {
        self.cover_url.as_deref()
    }

    fn relations(&self) -> RelationRows {
        RelationRows {
            contributors: self.contributors.clone(),
            series: self.series.clone(),
            tags: self.tags.clone(),
            genres: self.genres.clone(),
            members: Vec::new(),
        }
    }
}

impl SyncRecord for Series {
    const FAMILY: EntityFamily = EntityFamily::Series;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn image_ref(&self) -> Option<&str> {
        self.cover_url.as_deref()
    }
}

impl SyncRecord for Contributor {
    const FAMILY: EntityFamily = EntityFamily::Contributors;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn image_ref(&self) -> Option<&str> {
        self.image_url.as_deref()
    }
}

impl SyncRecord for Genre {
    const FAMILY: EntityFamily = EntityFamily::Genres;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

impl SyncRecord for Tag {
    const FAMILY: EntityFamily = EntityFamily::Tags;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

impl SyncRecord for Collection {
    const FAMILY: EntityFamily = EntityFamily::Collections;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn relations(&self) -> RelationRows {
        RelationRows {
            members: self.book_ids.clone(),
            ..RelationRows::default()
        }
    }
}

impl SyncRecord for Lens {
    const FAMILY: EntityFamily = EntityFamily::Lenses;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn relations(&self) -> RelationRows {
        RelationRows {
            members: self.book_ids.clone(),
            ..RelationRows::default()
        }
    }
}

impl SyncRecord for Profile {
    const FAMILY: EntityFamily = EntityFamily::Profile;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn image_ref(&self) -> Option<&str> {
        self.avatar_url.as_deref()
    }
}

/// A server snapshot flattened into what the store persists.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRecord {
    pub id: String,
    pub name: String,
    /// Server `updatedAt` in unix milliseconds.
    pub updated_at: i64,
    pub image_ref: Option<String>,
    pub data: Value,
    pub relations: RelationRows,
}

impl IncomingRecord {
    pub fn from_record<T: SyncRecord>(record: &T) -> Result<Self, RecordError> {
        let data = serde_json::to_value(record).map_err(|source| RecordError::Payload {
            family: T::FAMILY,
            source,
        })?;
        Ok(Self {
            id: record.id().to_string(),
            name: record.display_name().to_string(),
            updated_at: parse_timestamp(record.updated_at())?,
            image_ref: record.image_ref().map(str::to_string),
            data,
            relations: record.relations(),
        })
    }
}

/// Decodes a raw payload (server echo or local snapshot) of the given family.
pub fn incoming_from_value(
    family: EntityFamily,
    value: Value,
) -> Result<IncomingRecord, RecordError> {
    match family {
        EntityFamily::Books => decode::<Book>(value),
        EntityFamily::Series => decode::<Series>(value),
        EntityFamily::Contributors => decode::<Contributor>(value),
        EntityFamily::Genres => decode::<Genre>(value),
        EntityFamily::Tags => decode::<Tag>(value),
        EntityFamily::Collections => decode::<Collection>(value),
        EntityFamily::Lenses => decode::<Lens>(value),
        EntityFamily::Profile => decode::<Profile>(value),
    }
}

fn decode<T: SyncRecord>(value: Value) -> Result<IncomingRecord, RecordError> {
    let record: T = serde_json::from_value(value).map_err(|source| RecordError::Payload {
        family: T::FAMILY,
        source,
    })?;
    IncomingRecord::from_record(&record)
}

pub fn parse_timestamp(value: &str) -> Result<i64, RecordError> {
    let parsed =
        OffsetDateTime::parse(value, &Rfc3339).map_err(|source| RecordError::Timestamp {
            value: value.to_string(),
            source,
        })?;
    Ok((parsed.unix_timestamp_nanos() / 1_000_000) as i64)
}

pub fn format_timestamp(millis: i64) -> Result<String, RecordError> {
    let at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|_| RecordError::TimestampRange(millis))?;
    Ok(at.format(&Rfc3339)?)
}

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
