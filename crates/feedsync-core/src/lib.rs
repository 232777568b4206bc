//! Core domain model for feedsync: feeds, raw entries and persisted posts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedsync-core";

/// Title used when neither the channel nor an entry provides one.
pub const NO_TITLE: &str = "(no title)";

/// Failure recorded against a feed by the last pass that fetched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LastError {
    Timeout,
    NotFound,
    Generic { status: Option<u16> },
}

impl LastError {
    pub fn kind(&self) -> &'static str {
        match self {
            LastError::Timeout => "timeout",
            LastError::NotFound => "not_found",
            LastError::Generic { .. } => "generic",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            LastError::Generic { status } => *status,
            LastError::NotFound => Some(404),
            LastError::Timeout => None,
        }
    }

    /// Rebuild from the persisted `(kind, status)` pair. Unknown kinds map to
    /// `Generic` so a newer writer never makes old rows unreadable.
    pub fn from_parts(kind: &str, status: Option<u16>) -> Self {
        match kind {
            "timeout" => LastError::Timeout,
            "not_found" => LastError::NotFound,
            _ => LastError::Generic { status },
        }
    }
}

/// A subscribed feed and its refresh state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub id: Uuid,
    pub url: String,
    pub name: String,
    pub description: String,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
    /// Conditional-cache token (`ETag`) returned by the last successful fetch.
    pub http_etag: Option<String>,
    /// Conditional-cache timestamp (`Last-Modified`) from the last successful fetch.
    pub http_last_modified: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl FeedSource {
    pub fn new(url: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            name: name.into(),
            description: description.into(),
            last_refresh: None,
            last_error: None,
            http_etag: None,
            http_last_modified: None,
            created_at: Utc::now(),
        }
    }
}

/// One structured content block of an entry (e.g. `content:encoded`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContentBlock {
    pub value: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawEnclosure {
    pub url: String,
    pub length: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawCategory {
    pub name: String,
    pub domain: Option<String>,
}

/// Entry as produced by a feed parser, before normalization.
///
/// Date fields hold the source text unparsed; resolution into timestamps is
/// the sync engine's job so malformed values can fall through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawEntry {
    pub guid: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub link: Option<String>,
    pub content: Vec<ContentBlock>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub updated: Option<String>,
    pub published: Option<String>,
    pub enclosures: Vec<RawEnclosure>,
    pub categories: Vec<RawCategory>,
}

/// Channel-level metadata returned alongside the entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChannelMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub categories: Vec<RawCategory>,
}

/// Normalized post fields ready for identity resolution and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedPost {
    pub feed_id: Uuid,
    /// Empty when the entry carried no guid.
    pub guid: String,
    pub title: String,
    pub author: String,
    pub link: String,
    pub content: String,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub guid: String,
    pub title: String,
    pub author: String,
    pub link: String,
    pub content: String,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn from_normalized(id: Uuid, post: &NormalizedPost, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            feed_id: post.feed_id,
            guid: post.guid.clone(),
            title: post.title.clone(),
            author: post.author.clone(),
            link: post.link.clone(),
            content: post.content.clone(),
            published_at: post.published_at,
            updated_at: post.updated_at,
            created_at,
        }
    }
}

/// Enclosure keyed naturally by `(url, length, mime_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub url: String,
    pub length: i64,
    pub mime_type: String,
}

/// Category keyed naturally by `(name, domain)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub domain: String,
}

/// Declared maximum lengths, in characters, of persisted text fields.
/// Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldLimits {
    pub guid: usize,
    pub title: usize,
    pub author: usize,
    pub link: usize,
    pub content: usize,
    pub feed_name: usize,
    pub feed_description: usize,
    pub category_name: usize,
    pub category_domain: usize,
    pub enclosure_url: usize,
    pub enclosure_mime_type: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            guid: 200,
            title: 200,
            author: 50,
            link: 200,
            content: 0,
            feed_name: 200,
            feed_description: 0,
            category_name: 128,
            category_domain: 128,
            enclosure_url: 200,
            enclosure_mime_type: 200,
        }
    }
}

/// Row counts reported for one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeedSummary {
    pub posts: u64,
    pub enclosures: u64,
    pub categories: u64,
}
