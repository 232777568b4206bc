//! Feed synchronization: fetch a feed, normalize its entries and fold them
//! into the store without duplicating posts.

pub mod dedup;
pub mod normalize;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use feedsync_adapters::{FeedFetcher, FetchError, FetchRequest, FetchResponse, HttpFeedFetcher};
use feedsync_core::{FeedSource, FeedSummary, FieldLimits, LastError, RawCategory, RawEntry, NO_TITLE};
use feedsync_storage::{HttpClientConfig, SqliteStore, Store, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::{identity_filter, resolve_duplicate, Resolution};
use crate::normalize::{
    category_from_raw, enclosure_from_raw, extract_post, order_entries, truncate, truncate_post,
    ContentSummarizer, ExtractContext, HtmlWordSummarizer,
};

pub const CRATE_NAME: &str = "feedsync-sync";

/// Statuses whose body is imported. Anything else that is not 304 or 404 is
/// recorded as a generic failure.
pub const ACCEPTED_STATUSES: [u16; 4] = [200, 301, 302, 307];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub user_agent: String,
    /// Newest entries imported per pass; `None` imports all of them.
    pub post_limit: Option<usize>,
    pub min_refresh_interval: Duration,
    pub fetch_timeout: Duration,
    pub include_enclosures: bool,
    pub include_categories: bool,
    /// Import entries on first registration, not only on later refreshes.
    pub update_on_import: bool,
    pub max_redirects: usize,
    /// Word cap used by the default summarizer; zero keeps content whole.
    pub summary_max_words: usize,
    pub field_limits: FieldLimits,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://feedsync.db".to_string(),
            user_agent: "feedsync/0.1".to_string(),
            post_limit: Some(20),
            min_refresh_interval: Duration::from_secs(20 * 60),
            fetch_timeout: Duration::from_secs(10),
            include_enclosures: false,
            include_categories: false,
            update_on_import: true,
            max_redirects: 5,
            summary_max_words: 25,
            field_limits: FieldLimits::default(),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable keys keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |key: &str, default: bool| lookup(key).map(|v| parse_flag(v.trim())).unwrap_or(default);

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            user_agent: lookup("FEEDSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            post_limit: match number("FEEDSYNC_POST_LIMIT") {
                Some(0) => None,
                Some(n) => Some(n as usize),
                None => defaults.post_limit,
            },
            min_refresh_interval: number("FEEDSYNC_MIN_REFRESH_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.min_refresh_interval),
            fetch_timeout: number("FEEDSYNC_FETCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            include_enclosures: flag("FEEDSYNC_STORE_ENCLOSURES", defaults.include_enclosures),
            include_categories: flag("FEEDSYNC_STORE_CATEGORIES", defaults.include_categories),
            update_on_import: flag("FEEDSYNC_UPDATE_ON_IMPORT", defaults.update_on_import),
            max_redirects: number("FEEDSYNC_MAX_REDIRECTS")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_redirects),
            summary_max_words: number("FEEDSYNC_SUMMARY_MAX_WORDS")
                .map(|n| n as usize)
                .unwrap_or(defaults.summary_max_words),
            field_limits: defaults.field_limits,
        }
    }

    /// Overlay the settings present in a YAML file.
    pub fn apply_file(self, path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        self.apply_yaml(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn apply_yaml(mut self, text: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        if let Some(url) = file.database_url {
            self.database_url = url;
        }
        if let Some(agent) = file.user_agent {
            self.user_agent = agent;
        }
        if let Some(limit) = file.post_limit {
            self.post_limit = (limit > 0).then_some(limit);
        }
        if let Some(secs) = file.min_refresh_secs {
            self.min_refresh_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.fetch_timeout_secs {
            self.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = file.store_enclosures {
            self.include_enclosures = v;
        }
        if let Some(v) = file.store_categories {
            self.include_categories = v;
        }
        if let Some(v) = file.update_on_import {
            self.update_on_import = v;
        }
        if let Some(v) = file.max_redirects {
            self.max_redirects = v;
        }
        if let Some(v) = file.summary_max_words {
            self.summary_max_words = v;
        }
        if let Some(limits) = file.field_limits {
            self.field_limits = limits;
        }
        Ok(self)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    database_url: Option<String>,
    user_agent: Option<String>,
    post_limit: Option<usize>,
    min_refresh_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
    store_enclosures: Option<bool>,
    store_categories: Option<bool>,
    update_on_import: Option<bool>,
    max_redirects: Option<usize>,
    summary_max_words: Option<usize>,
    field_limits: Option<FieldLimits>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("feed {url} was not found")]
    NotFound { url: String },
    #[error("fetching {url} failed (status {status:?}): {reason}")]
    FetchFailed {
        url: String,
        status: Option<u16>,
        reason: String,
    },
    #[error("fetching {url} timed out")]
    Timeout { url: String },
    #[error("{url} redirected more than {limit} times")]
    TooManyRedirects { url: String, limit: usize },
    #[error("feed {0} is not registered")]
    UnknownFeed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure confined to a single entry; the rest of the pass continues.
#[derive(Debug, Error)]
#[error("entry {index} ({guid:?}) could not be stored: {source}")]
pub struct EntryProcessingError {
    pub index: usize,
    pub guid: String,
    #[source]
    pub source: StoreError,
}

/// What a fetch attempt means for the pass.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(FetchResponse),
    NotModified,
    Timeout,
    NotFound,
    Failed { status: Option<u16>, reason: String },
}

pub fn classify_fetch(result: Result<FetchResponse, FetchError>) -> FetchOutcome {
    match result {
        Err(FetchError::Timeout(_)) => FetchOutcome::Timeout,
        Err(FetchError::Transport(reason)) => FetchOutcome::Failed { status: None, reason },
        Err(FetchError::Parse { status, message }) => FetchOutcome::Failed {
            status: Some(status),
            reason: message,
        },
        Ok(resp) => match resp.status {
            304 => FetchOutcome::NotModified,
            404 => FetchOutcome::NotFound,
            status if ACCEPTED_STATUSES.contains(&status) => FetchOutcome::Fetched(resp),
            status => FetchOutcome::Failed {
                status: Some(status),
                reason: format!("unexpected status {status}"),
            },
        },
    }
}

/// True while `feed` was refreshed less than `interval` ago.
pub fn is_throttled(feed: &FeedSource, now: DateTime<Utc>, interval: Duration) -> bool {
    let Some(last) = feed.last_refresh else {
        return false;
    };
    let Ok(interval) = chrono::Duration::from_std(interval) else {
        return true;
    };
    match last.checked_add_signed(interval) {
        Some(next) => now < next,
        None => true,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

enum PassStep {
    Done(FeedSource),
    Redirected(String),
}

pub struct SyncEngine {
    config: SyncConfig,
    fetcher: Arc<dyn FeedFetcher>,
    store: Arc<dyn Store>,
    summarizer: Arc<dyn ContentSummarizer>,
    feed_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, fetcher: Arc<dyn FeedFetcher>, store: Arc<dyn Store>) -> Self {
        let summarizer = Arc::new(HtmlWordSummarizer::new(config.summary_max_words));
        Self {
            config,
            fetcher,
            store,
            summarizer,
            feed_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn ContentSummarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Open the configured SQLite database and build an HTTP fetcher.
    pub async fn connect(config: SyncConfig) -> anyhow::Result<Self> {
        let store = SqliteStore::open(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        let fetcher = HttpFeedFetcher::from_config(HttpClientConfig {
            timeout: config.fetch_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self::new(config, Arc::new(fetcher), Arc::new(store)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn feed_lock(&self, url: &str) -> Arc<Mutex<()>> {
        let mut guard = self.feed_locks.lock().await;
        guard
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map entry for `url` once no other pass holds or waits on it.
    async fn release_feed_lock(&self, url: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.feed_locks.lock().await;
        let only_map_and_us = locks
            .get(url)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if only_map_and_us {
            locks.remove(url);
        }
    }

    /// Register `url` on first sight, otherwise refresh it.
    ///
    /// A first fetch served from another location restarts under the final
    /// URL, at most `max_redirects` times.
    pub async fn sync_feed(&self, url: &str, force: bool) -> Result<FeedSource, SyncError> {
        let mut url = url.trim().to_string();

        for _ in 0..=self.config.max_redirects {
            let lock = self.feed_lock(&url).await;
            let guard = lock.lock().await;
            let step = self.sync_step(&url, force).await;
            drop(guard);
            self.release_feed_lock(&url, lock).await;

            match step? {
                PassStep::Done(feed) => return Ok(feed),
                PassStep::Redirected(next) => {
                    info!(from = %url, to = %next, "feed moved; following redirect");
                    url = next;
                }
            }
        }

        Err(SyncError::TooManyRedirects {
            url,
            limit: self.config.max_redirects,
        })
    }

    /// Refresh an already registered feed. Throttled unless `force`.
    ///
    /// Fetch failures are recorded on the feed and the feed is returned;
    /// only store failures surface as errors.
    pub async fn refresh_feed(&self, feed: &FeedSource, force: bool) -> Result<FeedSource, SyncError> {
        let lock = self.feed_lock(&feed.url).await;
        let guard = lock.lock().await;
        let result = match self.store.get_feed(&feed.url).await {
            Ok(Some(current)) => self.refresh_locked(current, force).await,
            Ok(None) => Err(SyncError::UnknownFeed(feed.url.clone())),
            Err(err) => Err(err.into()),
        };
        drop(guard);
        self.release_feed_lock(&feed.url, lock).await;
        result
    }

    /// Stored row counts for a registered feed.
    pub async fn feed_summary(&self, url: &str) -> Result<(FeedSource, FeedSummary), SyncError> {
        let feed = self
            .store
            .get_feed(url.trim())
            .await?
            .ok_or_else(|| SyncError::UnknownFeed(url.to_string()))?;
        let summary = self.store.feed_summary(feed.id).await?;
        Ok((feed, summary))
    }

    /// One attempt at `url` while its lock is held.
    async fn sync_step(&self, url: &str, force: bool) -> Result<PassStep, SyncError> {
        if let Some(feed) = self.store.get_feed(url).await? {
            return self.refresh_locked(feed, force).await.map(PassStep::Done);
        }
        let span = info_span!("feed_sync", url = %url, first_import = true);
        self.first_import(url).instrument(span).await
    }

    async fn first_import(&self, url: &str) -> Result<PassStep, SyncError> {
        let now = Utc::now();
        let request = FetchRequest {
            url: url.to_string(),
            etag: None,
            last_modified: None,
            timeout: self.config.fetch_timeout,
        };

        let resp = match classify_fetch(self.fetcher.fetch(&request).await) {
            FetchOutcome::Fetched(resp) => resp,
            FetchOutcome::Timeout => return Err(SyncError::Timeout { url: url.to_string() }),
            FetchOutcome::NotFound => return Err(SyncError::NotFound { url: url.to_string() }),
            FetchOutcome::NotModified => {
                return Err(SyncError::FetchFailed {
                    url: url.to_string(),
                    status: Some(304),
                    reason: "not modified on a request without validators".to_string(),
                })
            }
            FetchOutcome::Failed { status, reason } => {
                return Err(SyncError::FetchFailed {
                    url: url.to_string(),
                    status,
                    reason,
                })
            }
        };

        if resp.final_url != url {
            return Ok(PassStep::Redirected(resp.final_url));
        }

        let limits = &self.config.field_limits;
        let name = resp
            .channel
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(NO_TITLE);
        let description = resp.channel.description.as_deref().map(str::trim).unwrap_or_default();
        let feed = FeedSource::new(
            url,
            truncate(limits.feed_name, name),
            truncate(limits.feed_description, description),
        );
        let feed = self.store.get_or_create_feed(&feed).await?;
        info!(feed_id = %feed.id, name = %feed.name, "registered feed");

        if self.config.include_categories {
            self.attach_feed_categories(feed.id, &resp.channel.categories).await;
        }

        if !self.config.update_on_import {
            return Ok(PassStep::Done(feed));
        }
        let feed = self.import_response(feed, resp, now).await?;
        Ok(PassStep::Done(feed))
    }

    async fn refresh_locked(&self, feed: FeedSource, force: bool) -> Result<FeedSource, SyncError> {
        let span = info_span!("feed_sync", url = %feed.url, feed_id = %feed.id);
        self.refresh_inner(feed, force).instrument(span).await
    }

    async fn refresh_inner(&self, feed: FeedSource, force: bool) -> Result<FeedSource, SyncError> {
        let now = Utc::now();
        if !force && is_throttled(&feed, now, self.config.min_refresh_interval) {
            debug!(last_refresh = ?feed.last_refresh, "refreshed recently; skipping");
            return Ok(feed);
        }

        let request = FetchRequest {
            url: feed.url.clone(),
            etag: feed.http_etag.clone(),
            last_modified: feed.http_last_modified,
            timeout: self.config.fetch_timeout,
        };

        match classify_fetch(self.fetcher.fetch(&request).await) {
            FetchOutcome::Fetched(resp) => self.import_response(feed, resp, now).await,
            FetchOutcome::NotModified => {
                debug!("feed not modified");
                Ok(feed)
            }
            FetchOutcome::Timeout => {
                warn!(timeout = ?self.config.fetch_timeout, "feed fetch timed out");
                self.record_failure(feed, LastError::Timeout).await
            }
            FetchOutcome::NotFound => {
                warn!("feed returned 404");
                self.record_failure(feed, LastError::NotFound).await
            }
            FetchOutcome::Failed { status, reason } => {
                warn!(?status, %reason, "feed fetch failed");
                self.record_failure(feed, LastError::Generic { status }).await
            }
        }
    }

    async fn record_failure(&self, mut feed: FeedSource, error: LastError) -> Result<FeedSource, SyncError> {
        feed.last_error = Some(error);
        self.store.update_feed(&feed).await?;
        Ok(feed)
    }

    async fn import_response(
        &self,
        mut feed: FeedSource,
        resp: FetchResponse,
        now: DateTime<Utc>,
    ) -> Result<FeedSource, SyncError> {
        let FetchResponse {
            entries,
            etag,
            last_modified,
            ..
        } = resp;

        let entries = order_entries(entries, self.config.post_limit, now);
        let ctx = ExtractContext {
            feed_id: feed.id,
            feed_url: &feed.url,
            now,
            summarizer: self.summarizer.as_ref(),
        };

        let mut stats = ImportStats::default();
        for (index, entry) in entries.iter().enumerate() {
            match self.import_entry(index, entry, &ctx).await {
                Ok(Resolution::Create) => stats.created += 1,
                Ok(Resolution::Update(_)) => stats.updated += 1,
                Err(err) => {
                    warn!(error = %err, "skipping entry");
                    stats.failed += 1;
                }
            }
        }

        feed.last_refresh = Some(now);
        feed.last_error = None;
        feed.http_etag = etag;
        feed.http_last_modified = last_modified;
        self.store.update_feed(&feed).await?;

        info!(
            created = stats.created,
            updated = stats.updated,
            failed = stats.failed,
            "feed refreshed"
        );
        Ok(feed)
    }

    async fn import_entry(
        &self,
        index: usize,
        entry: &RawEntry,
        ctx: &ExtractContext<'_>,
    ) -> Result<Resolution, EntryProcessingError> {
        let candidate = truncate_post(extract_post(entry, ctx), &self.config.field_limits);
        let wrap = |source: StoreError| EntryProcessingError {
            index,
            guid: candidate.guid.clone(),
            source,
        };

        let existing = self.store.find_posts(&identity_filter(&candidate)).await.map_err(wrap)?;
        let resolution = resolve_duplicate(&candidate, &existing);
        debug!(index, guid = %candidate.guid, matches = existing.len(), ?resolution, "resolved entry");
        let post = match resolution {
            Resolution::Create => self.store.create_post(&candidate).await.map_err(wrap)?,
            Resolution::Update(id) => self.store.update_post(id, &candidate).await.map_err(wrap)?,
        };

        let limits = &self.config.field_limits;
        if self.config.include_enclosures {
            for enclosure in entry.enclosures.iter().filter_map(|e| enclosure_from_raw(e, limits)) {
                let enclosure_id = self.store.get_or_create_enclosure(&enclosure).await.map_err(wrap)?;
                self.store
                    .add_post_enclosure(post.id, enclosure_id)
                    .await
                    .map_err(wrap)?;
            }
        }
        if self.config.include_categories {
            for category in entry.categories.iter().filter_map(|c| category_from_raw(c, limits)) {
                let category_id = self.store.get_or_create_category(&category).await.map_err(wrap)?;
                self.store
                    .add_post_category(post.id, category_id)
                    .await
                    .map_err(wrap)?;
            }
        }

        Ok(resolution)
    }

    async fn attach_feed_categories(&self, feed_id: Uuid, categories: &[RawCategory]) {
        let limits = &self.config.field_limits;
        for category in categories.iter().filter_map(|c| category_from_raw(c, limits)) {
            let result = match self.store.get_or_create_category(&category).await {
                Ok(category_id) => self.store.add_feed_category(feed_id, category_id).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(error = %err, category = %category.name, "could not attach feed category");
            }
        }
    }
}
