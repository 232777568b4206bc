//! Feed fetcher contract and the RSS adapter behind it.
//!
//! The sync engine only sees [`FeedFetcher`]: one call per pass that returns
//! the HTTP status, the parsed entries and fresh conditional-cache
//! validators. [`HttpFeedFetcher`] is the production implementation; tests
//! script their own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_core::{ChannelMetadata, ContentBlock, RawCategory, RawEnclosure, RawEntry};
use feedsync_storage::{ConditionalRequest, FetchedResponse, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "feedsync-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    /// URL the content was finally served from, after redirects.
    pub final_url: String,
    pub channel: ChannelMetadata,
    pub entries: Vec<RawEntry>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FetchResponse {
    /// A response with no body, e.g. 304 or 404.
    pub fn empty(status: u16, final_url: impl Into<String>) -> Self {
        Self {
            status,
            final_url: final_url.into(),
            channel: ChannelMetadata::default(),
            entries: Vec::new(),
            etag: None,
            last_modified: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not parse feed served with status {status}: {message}")]
    Parse { status: u16, message: String },
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// Channel metadata and entries decoded from one document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedFeed {
    pub channel: ChannelMetadata,
    pub entries: Vec<RawEntry>,
}

pub fn parse_feed_bytes(body: &[u8]) -> Result<ParsedFeed, rss::Error> {
    let channel = rss::Channel::read_from(body)?;
    Ok(parse_channel(&channel))
}

/// Convert an already-parsed [`rss::Channel`]. No I/O.
pub fn parse_channel(channel: &rss::Channel) -> ParsedFeed {
    let metadata = ChannelMetadata {
        title: non_blank(Some(channel.title())),
        description: non_blank(Some(channel.description())),
        categories: channel.categories().iter().map(convert_category).collect(),
    };
    let entries = channel.items().iter().map(convert_item).collect();
    ParsedFeed {
        channel: metadata,
        entries,
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).map(str::to_string)
}

fn convert_category(category: &rss::Category) -> RawCategory {
    RawCategory {
        name: category.name().to_string(),
        domain: category.domain().map(str::to_string),
    }
}

fn convert_item(item: &rss::Item) -> RawEntry {
    let dublin_core = item.dublin_core_ext();
    let itunes = item.itunes_ext();

    let author = item
        .author()
        .map(str::to_string)
        .or_else(|| dublin_core.and_then(|dc| dc.creators().first().cloned()))
        .or_else(|| itunes.and_then(|it| it.author()).map(str::to_string));

    let content = item
        .content()
        .map(|value| {
            vec![ContentBlock {
                value: value.to_string(),
                content_type: Some("text/html".to_string()),
            }]
        })
        .unwrap_or_default();

    // atom:updated is not modelled by the rss crate; it lands in the raw extension map.
    let updated = item
        .extensions()
        .get("atom")
        .and_then(|ns| ns.get("updated"))
        .and_then(|values| values.first())
        .and_then(|ext| ext.value())
        .map(str::to_string);

    RawEntry {
        guid: item.guid().map(|g| g.value().to_string()),
        title: item.title().map(str::to_string),
        author,
        link: item.link().map(str::to_string),
        content,
        summary: itunes.and_then(|it| it.summary()).map(str::to_string),
        description: item.description().map(str::to_string),
        date: dublin_core.and_then(|dc| dc.dates().first().cloned()),
        updated,
        published: item.pub_date().map(str::to_string),
        enclosures: item
            .enclosure()
            .map(|enc| RawEnclosure {
                url: enc.url().to_string(),
                length: non_blank(Some(enc.length())),
                mime_type: non_blank(Some(enc.mime_type())),
            })
            .into_iter()
            .collect(),
        categories: item.categories().iter().map(convert_category).collect(),
    }
}

/// Map a raw HTTP response onto the fetcher contract. Only 2xx bodies are parsed.
pub fn response_from_http(resp: FetchedResponse) -> Result<FetchResponse, FetchError> {
    let status = resp.status.as_u16();
    if !resp.status.is_success() || resp.body.is_empty() {
        let mut out = FetchResponse::empty(status, resp.final_url);
        out.etag = resp.etag;
        out.last_modified = resp.last_modified;
        return Ok(out);
    }

    let parsed = parse_feed_bytes(&resp.body).map_err(|err| FetchError::Parse {
        status,
        message: err.to_string(),
    })?;
    debug!(entries = parsed.entries.len(), "parsed feed document");

    Ok(FetchResponse {
        status,
        final_url: resp.final_url,
        channel: parsed.channel,
        entries: parsed.entries,
        etag: resp.etag,
        last_modified: resp.last_modified,
    })
}

#[derive(Debug)]
pub struct HttpFeedFetcher {
    http: HttpFetcher,
}

impl HttpFeedFetcher {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }

    pub fn from_config(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self::new(HttpFetcher::new(config)?))
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let conditional = ConditionalRequest {
            url: &request.url,
            etag: request.etag.as_deref(),
            last_modified: request.last_modified,
            timeout: request.timeout,
        };
        let resp = self
            .http
            .fetch_conditional(&conditional)
            .await
            .map_err(|err| match err {
                feedsync_storage::FetchError::Timeout { after, .. } => FetchError::Timeout(after),
                feedsync_storage::FetchError::Request(err) => FetchError::Transport(err.to_string()),
            })?;
        response_from_http(resp)
    }
}
