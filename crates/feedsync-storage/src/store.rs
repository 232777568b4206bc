//! Store trait and its SQLite implementation.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_core::{Category, Enclosure, FeedSource, FeedSummary, LastError, NormalizedPost, Post};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("post {0} does not exist")]
    PostNotFound(Uuid),
    #[error("feed {0} does not exist")]
    FeedNotFound(String),
}

/// Lookup used by duplicate resolution to fetch every post sharing an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostFilter {
    Guid {
        feed_id: Uuid,
        guid: String,
    },
    TitleAndDate {
        feed_id: Uuid,
        title: String,
        published_at: DateTime<Utc>,
    },
}

/// Persistence operations needed by the sync engine.
///
/// Create-or-get methods are keyed by each record's natural identity, so
/// calling them twice with the same value yields the same row.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_feed(&self, url: &str) -> Result<Option<FeedSource>, StoreError>;

    /// Insert `feed` unless a feed with the same URL exists; return the stored row.
    async fn get_or_create_feed(&self, feed: &FeedSource) -> Result<FeedSource, StoreError>;

    /// Write name, description and all refresh state in one statement.
    async fn update_feed(&self, feed: &FeedSource) -> Result<(), StoreError>;

    async fn list_feeds(&self) -> Result<Vec<FeedSource>, StoreError>;

    /// Matching posts in insertion order.
    async fn find_posts(&self, filter: &PostFilter) -> Result<Vec<Post>, StoreError>;

    async fn create_post(&self, post: &NormalizedPost) -> Result<Post, StoreError>;

    async fn update_post(&self, id: Uuid, post: &NormalizedPost) -> Result<Post, StoreError>;

    async fn get_or_create_enclosure(&self, enclosure: &Enclosure) -> Result<i64, StoreError>;

    async fn get_or_create_category(&self, category: &Category) -> Result<i64, StoreError>;

    async fn add_post_enclosure(&self, post_id: Uuid, enclosure_id: i64) -> Result<(), StoreError>;

    async fn add_post_category(&self, post_id: Uuid, category_id: i64) -> Result<(), StoreError>;

    async fn add_feed_category(&self, feed_id: Uuid, category_id: i64) -> Result<(), StoreError>;

    async fn feed_summary(&self, feed_id: Uuid) -> Result<FeedSummary, StoreError>;
}

#[derive(Debug, FromRow)]
struct FeedRow {
    id: Uuid,
    url: String,
    name: String,
    description: String,
    last_refresh: Option<DateTime<Utc>>,
    last_error_kind: Option<String>,
    last_error_status: Option<i64>,
    http_etag: Option<String>,
    http_last_modified: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<FeedRow> for FeedSource {
    fn from(row: FeedRow) -> Self {
        let status = row.last_error_status.and_then(|s| u16::try_from(s).ok());
        FeedSource {
            id: row.id,
            url: row.url,
            name: row.name,
            description: row.description,
            last_refresh: row.last_refresh,
            last_error: row
                .last_error_kind
                .as_deref()
                .map(|kind| LastError::from_parts(kind, status)),
            http_etag: row.http_etag,
            http_last_modified: row.http_last_modified,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct PostRow {
    id: Uuid,
    feed_id: Uuid,
    guid: String,
    title: String,
    author: String,
    link: String,
    content: String,
    published_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Post {
            id: row.id,
            feed_id: row.feed_id,
            guid: row.guid,
            title: row.title,
            author: row.author,
            link: row.link,
            content: row.content,
            published_at: row.published_at,
            updated_at: row.updated_at,
            created_at: row.created_at,
        }
    }
}

const FEED_COLUMNS: &str = "id, url, name, description, last_refresh, last_error_kind, \
     last_error_status, http_etag, http_last_modified, created_at";

const POST_COLUMNS: &str =
    "id, feed_id, guid, title, author, link, content, published_at, updated_at, created_at";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url` and ensure the schema.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database; lives as long as the single pooled connection.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id BLOB PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                last_refresh TEXT,
                last_error_kind TEXT,
                last_error_status INTEGER,
                http_etag TEXT,
                http_last_modified TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id BLOB NOT NULL UNIQUE,
                feed_id BLOB NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                link TEXT NOT NULL,
                content TEXT NOT NULL,
                published_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_posts_feed_guid ON posts(feed_id, guid) WHERE guid <> ''",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_posts_identity ON posts(feed_id, title, published_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enclosures (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL,
                length INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                UNIQUE(url, length, mime_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                domain TEXT NOT NULL,
                UNIQUE(name, domain)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS post_enclosures (
                post_id BLOB NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                enclosure_id INTEGER NOT NULL REFERENCES enclosures(id) ON DELETE CASCADE,
                PRIMARY KEY (post_id, enclosure_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS post_categories (
                post_id BLOB NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                PRIMARY KEY (post_id, category_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_categories (
                feed_id BLOB NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                PRIMARY KEY (feed_id, category_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_post(&self, id: Uuid) -> Result<Post, StoreError> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Post::from).ok_or(StoreError::PostNotFound(id))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_feed(&self, url: &str) -> Result<Option<FeedSource>, StoreError> {
        let row = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedSource::from))
    }

    async fn get_or_create_feed(&self, feed: &FeedSource) -> Result<FeedSource, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feeds (id, url, name, description, last_refresh, last_error_kind,
                               last_error_status, http_etag, http_last_modified, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
            "#,
        )
        .bind(feed.id)
        .bind(&feed.url)
        .bind(&feed.name)
        .bind(&feed.description)
        .bind(feed.last_refresh)
        .bind(feed.last_error.map(|e| e.kind()))
        .bind(feed.last_error.and_then(|e| e.status()).map(i64::from))
        .bind(&feed.http_etag)
        .bind(feed.http_last_modified)
        .bind(feed.created_at)
        .execute(&self.pool)
        .await?;

        self.get_feed(&feed.url)
            .await?
            .ok_or_else(|| StoreError::FeedNotFound(feed.url.clone()))
    }

    async fn update_feed(&self, feed: &FeedSource) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                name = ?,
                description = ?,
                last_refresh = ?,
                last_error_kind = ?,
                last_error_status = ?,
                http_etag = ?,
                http_last_modified = ?
            WHERE id = ?
            "#,
        )
        .bind(&feed.name)
        .bind(&feed.description)
        .bind(feed.last_refresh)
        .bind(feed.last_error.map(|e| e.kind()))
        .bind(feed.last_error.and_then(|e| e.status()).map(i64::from))
        .bind(&feed.http_etag)
        .bind(feed.http_last_modified)
        .bind(feed.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed.url.clone()));
        }
        Ok(())
    }

    async fn list_feeds(&self) -> Result<Vec<FeedSource>, StoreError> {
        let rows = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY url"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedSource::from).collect())
    }

    async fn find_posts(&self, filter: &PostFilter) -> Result<Vec<Post>, StoreError> {
        let rows = match filter {
            PostFilter::Guid { feed_id, guid } => {
                sqlx::query_as::<_, PostRow>(&format!(
                    "SELECT {POST_COLUMNS} FROM posts WHERE feed_id = ? AND guid = ? ORDER BY seq"
                ))
                .bind(feed_id)
                .bind(guid)
                .fetch_all(&self.pool)
                .await?
            }
            PostFilter::TitleAndDate {
                feed_id,
                title,
                published_at,
            } => {
                sqlx::query_as::<_, PostRow>(&format!(
                    "SELECT {POST_COLUMNS} FROM posts \
                     WHERE feed_id = ? AND title = ? AND published_at = ? ORDER BY seq"
                ))
                .bind(feed_id)
                .bind(title)
                .bind(published_at)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(Post::from).collect())
    }

    async fn create_post(&self, post: &NormalizedPost) -> Result<Post, StoreError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO posts (id, feed_id, guid, title, author, link, content,
                               published_at, updated_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(post.feed_id)
        .bind(&post.guid)
        .bind(&post.title)
        .bind(&post.author)
        .bind(&post.link)
        .bind(&post.content)
        .bind(post.published_at)
        .bind(post.updated_at)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(Post::from_normalized(id, post, created_at))
    }

    async fn update_post(&self, id: Uuid, post: &NormalizedPost) -> Result<Post, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET
                guid = ?,
                title = ?,
                author = ?,
                link = ?,
                content = ?,
                published_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&post.guid)
        .bind(&post.title)
        .bind(&post.author)
        .bind(&post.link)
        .bind(&post.content)
        .bind(post.published_at)
        .bind(post.updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PostNotFound(id));
        }
        self.get_post(id).await
    }

    async fn get_or_create_enclosure(&self, enclosure: &Enclosure) -> Result<i64, StoreError> {
        sqlx::query(
            "INSERT INTO enclosures (url, length, mime_type) VALUES (?, ?, ?) \
             ON CONFLICT(url, length, mime_type) DO NOTHING",
        )
        .bind(&enclosure.url)
        .bind(enclosure.length)
        .bind(&enclosure.mime_type)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM enclosures WHERE url = ? AND length = ? AND mime_type = ?",
        )
        .bind(&enclosure.url)
        .bind(enclosure.length)
        .bind(&enclosure.mime_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_or_create_category(&self, category: &Category) -> Result<i64, StoreError> {
        sqlx::query(
            "INSERT INTO categories (name, domain) VALUES (?, ?) ON CONFLICT(name, domain) DO NOTHING",
        )
        .bind(&category.name)
        .bind(&category.domain)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM categories WHERE name = ? AND domain = ?")
            .bind(&category.name)
            .bind(&category.domain)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn add_post_enclosure(&self, post_id: Uuid, enclosure_id: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO post_enclosures (post_id, enclosure_id) VALUES (?, ?)")
            .bind(post_id)
            .bind(enclosure_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_post_category(&self, post_id: Uuid, category_id: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO post_categories (post_id, category_id) VALUES (?, ?)")
            .bind(post_id)
            .bind(category_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_feed_category(&self, feed_id: Uuid, category_id: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO feed_categories (feed_id, category_id) VALUES (?, ?)")
            .bind(feed_id)
            .bind(category_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn feed_summary(&self, feed_id: Uuid) -> Result<FeedSummary, StoreError> {
        let posts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        let enclosures: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM post_enclosures pe JOIN posts p ON p.id = pe.post_id WHERE p.feed_id = ?",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        let post_categories: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM post_categories pc JOIN posts p ON p.id = pc.post_id WHERE p.feed_id = ?",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        let feed_categories: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_categories WHERE feed_id = ?")
                .bind(feed_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(FeedSummary {
            posts: posts.max(0) as u64,
            enclosures: enclosures.max(0) as u64,
            categories: (post_categories + feed_categories).max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).unwrap()
    }

    fn draft(feed_id: Uuid, guid: &str, title: &str) -> NormalizedPost {
        NormalizedPost {
            feed_id,
            guid: guid.to_string(),
            title: title.to_string(),
            author: String::new(),
            link: "https://example.com/post".to_string(),
            content: "body".to_string(),
            published_at: ts(12),
            updated_at: ts(12),
        }
    }

    async fn store_with_feed() -> (SqliteStore, FeedSource) {
        let store = SqliteStore::open_in_memory().await.expect("store");
        let feed = store
            .get_or_create_feed(&FeedSource::new("https://example.com/rss", "Example", "desc"))
            .await
            .expect("feed");
        (store, feed)
    }

    #[tokio::test]
    async fn get_or_create_feed_is_keyed_by_url() {
        let (store, feed) = store_with_feed().await;
        let again = store
            .get_or_create_feed(&FeedSource::new("https://example.com/rss", "Other", ""))
            .await
            .expect("feed");
        assert_eq!(again.id, feed.id);
        assert_eq!(again.name, "Example");
        assert_eq!(store.list_feeds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_feed_persists_refresh_state_together() {
        let (store, mut feed) = store_with_feed().await;
        feed.last_refresh = Some(ts(9));
        feed.last_error = Some(LastError::Generic { status: Some(503) });
        feed.http_etag = Some("\"v1\"".to_string());
        feed.http_last_modified = Some(ts(8));
        store.update_feed(&feed).await.expect("update");

        let loaded = store.get_feed(&feed.url).await.unwrap().expect("exists");
        assert_eq!(loaded, feed);
    }

    #[tokio::test]
    async fn find_posts_by_guid_and_by_title_date() {
        let (store, feed) = store_with_feed().await;
        store.create_post(&draft(feed.id, "g1", "Hello")).await.unwrap();
        store.create_post(&draft(feed.id, "", "News")).await.unwrap();
        store.create_post(&draft(feed.id, "", "News")).await.unwrap();

        let by_guid = store
            .find_posts(&PostFilter::Guid {
                feed_id: feed.id,
                guid: "g1".into(),
            })
            .await
            .unwrap();
        assert_eq!(by_guid.len(), 1);
        assert_eq!(by_guid[0].title, "Hello");

        let by_title = store
            .find_posts(&PostFilter::TitleAndDate {
                feed_id: feed.id,
                title: "News".into(),
                published_at: ts(12),
            })
            .await
            .unwrap();
        assert_eq!(by_title.len(), 2);
        assert!(by_title[0].created_at <= by_title[1].created_at);
    }

    #[tokio::test]
    async fn guid_is_unique_per_feed() {
        let (store, feed) = store_with_feed().await;
        store.create_post(&draft(feed.id, "g1", "Hello")).await.unwrap();
        let err = store.create_post(&draft(feed.id, "g1", "Hello again")).await;
        assert!(matches!(err, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn update_post_overwrites_fields() {
        let (store, feed) = store_with_feed().await;
        let post = store.create_post(&draft(feed.id, "g1", "Hello")).await.unwrap();
        let mut changed = draft(feed.id, "g1", "Hello");
        changed.content = "new body".into();
        let updated = store.update_post(post.id, &changed).await.unwrap();
        assert_eq!(updated.id, post.id);
        assert_eq!(updated.content, "new body");
        assert_eq!(updated.created_at, post.created_at);

        let missing = store.update_post(Uuid::new_v4(), &changed).await;
        assert!(matches!(missing, Err(StoreError::PostNotFound(_))));
    }

    #[tokio::test]
    async fn attachments_dedupe_on_natural_key_and_count_in_summary() {
        let (store, feed) = store_with_feed().await;
        let post = store.create_post(&draft(feed.id, "g1", "Hello")).await.unwrap();

        let enclosure = Enclosure {
            url: "https://example.com/a.mp3".into(),
            length: 1024,
            mime_type: "audio/mpeg".into(),
        };
        let e1 = store.get_or_create_enclosure(&enclosure).await.unwrap();
        let e2 = store.get_or_create_enclosure(&enclosure).await.unwrap();
        assert_eq!(e1, e2);
        store.add_post_enclosure(post.id, e1).await.unwrap();
        store.add_post_enclosure(post.id, e2).await.unwrap();

        let category = Category {
            name: "rust".into(),
            domain: String::new(),
        };
        let c1 = store.get_or_create_category(&category).await.unwrap();
        assert_eq!(c1, store.get_or_create_category(&category).await.unwrap());
        store.add_post_category(post.id, c1).await.unwrap();
        store.add_feed_category(feed.id, c1).await.unwrap();

        let summary = store.feed_summary(feed.id).await.unwrap();
        assert_eq!(
            summary,
            FeedSummary {
                posts: 1,
                enclosures: 1,
                categories: 2,
            }
        );
    }

    #[tokio::test]
    async fn on_disk_database_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("feeds.db").display());

        let store = SqliteStore::open(&url).await.expect("open");
        store
            .get_or_create_feed(&FeedSource::new("https://example.com/rss", "Example", ""))
            .await
            .unwrap();
        drop(store);

        let reopened = SqliteStore::open(&url).await.expect("reopen");
        assert!(reopened.get_feed("https://example.com/rss").await.unwrap().is_some());
    }
}
