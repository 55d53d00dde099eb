//! Relational persistence for channels, videos and comments.
//!
//! The structs in this module mirror the rows stored in SQLite. Relationships
//! are plain ids; [`MetadataReader`] turns them into lookups when needed.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Row, Value, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{HarvestError, HarvestResult};
use crate::pool::ConnectionPool;

/// Comments are written with one multi-row statement per batch.
pub const COMMENT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub view_count: i64,
    pub subscriber_count: i64,
    pub video_count: i64,
    /// When the channel was created on YouTube.
    pub created_at: DateTime<Utc>,
}

/// Counts stay textual: the API hands them out as strings and some of them
/// overflow or change format over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub view_count: String,
    pub comment_count: String,
    pub like_count: String,
    pub published_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub comment_id: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
    pub like_count: i64,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    /// Taken at face value; the commenter's channel is not ingested.
    pub commenter_channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_comment_id: Option<String>,
}

/// Everything fetched for one video, ready to be written in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoBundle {
    pub channel: ChannelRecord,
    pub video: VideoRecord,
    pub comments: Vec<CommentRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistSummary {
    pub video_id: String,
    pub channel_created: bool,
    pub video_created: bool,
    pub comments_inserted: u64,
    pub comments_skipped: u64,
}

/// Result of [`MetadataStore::persist`]. Failures are values, not errors:
/// the caller gets a readable line either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored(PersistSummary),
    IntegrityViolation(String),
    Failed(String),
}

impl PersistOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PersistOutcome::Stored(_))
    }
}

impl fmt::Display for PersistOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistOutcome::Stored(summary) => {
                let verb = if summary.video_created {
                    "Created"
                } else {
                    "Reused"
                };
                write!(
                    f,
                    "{verb} video ID {} ({} new comments, {} already stored)",
                    summary.video_id, summary.comments_inserted, summary.comments_skipped
                )
            }
            PersistOutcome::IntegrityViolation(message) => {
                write!(f, "Database integrity error: {message}")
            }
            PersistOutcome::Failed(message) => write!(f, "Error: {message}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub channels: i64,
    pub videos: i64,
    pub comments: i64,
}

async fn ensure_schema(conn: &Connection) -> libsql::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            channel_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            keywords TEXT,
            description TEXT,
            view_count INTEGER NOT NULL,
            subscriber_count INTEGER NOT NULL,
            video_count INTEGER NOT NULL,
            country TEXT,
            created_at_remote TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS videos (
            video_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            category TEXT,
            view_count TEXT NOT NULL,
            comment_count TEXT NOT NULL,
            like_count TEXT NOT NULL,
            published_at TEXT NOT NULL,
            channel_id TEXT REFERENCES channels(channel_id) ON DELETE SET NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS comments (
            comment_id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            published_at TEXT NOT NULL,
            like_count INTEGER NOT NULL DEFAULT 0,
            reply_count INTEGER DEFAULT 0,
            video_id TEXT REFERENCES videos(video_id) ON DELETE CASCADE,
            commenter_channel_id TEXT NOT NULL,
            parent_comment_id TEXT REFERENCES comments(comment_id)
                ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id);
        CREATE INDEX IF NOT EXISTS idx_comments_video ON comments(video_id);
        CREATE INDEX IF NOT EXISTS idx_comments_commenter ON comments(commenter_channel_id);
        CREATE INDEX IF NOT EXISTS idx_comments_parent ON comments(parent_comment_id);
        "#,
    )
    .await
}

fn timestamp_to_text(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn timestamp_from_text(value: &str) -> HarvestResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| HarvestError::Persistence(format!("stored timestamp '{value}': {err}")))
}

fn optional_text(value: Option<&str>) -> Value {
    match value {
        Some(text) => Value::Text(text.to_string()),
        None => Value::Null,
    }
}

/// Write side of the store.
#[derive(Clone)]
pub struct MetadataStore {
    pool: ConnectionPool,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path, pool_size: usize) -> Result<Self> {
        let pool = ConnectionPool::open(path, pool_size).await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: ConnectionPool) -> Result<Self> {
        let conn = pool.acquire().await.context("connecting for schema setup")?;
        ensure_schema(&conn).await.context("creating schema")?;
        drop(conn);
        Ok(Self { pool })
    }

    pub fn reader(&self) -> MetadataReader {
        MetadataReader {
            pool: self.pool.clone(),
        }
    }

    /// Writes one video's bundle in a single transaction: channel, then video,
    /// then comments. Rows that already exist are left untouched.
    pub async fn persist(&self, bundle: &VideoBundle) -> PersistOutcome {
        match self.try_persist(bundle).await {
            Ok(summary) => {
                info!(
                    video_id = %summary.video_id,
                    video_created = summary.video_created,
                    comments = summary.comments_inserted,
                    "stored video bundle"
                );
                PersistOutcome::Stored(summary)
            }
            Err(HarvestError::Integrity(message)) => {
                warn!(video_id = %bundle.video.video_id, %message, "integrity violation, rolled back");
                PersistOutcome::IntegrityViolation(message)
            }
            Err(err) => {
                warn!(video_id = %bundle.video.video_id, error = %err, "persist failed, rolled back");
                PersistOutcome::Failed(err.to_string())
            }
        }
    }

    async fn try_persist(&self, bundle: &VideoBundle) -> HarvestResult<PersistSummary> {
        let mut conn = self.pool.acquire().await?;
        let tx = conn.begin().await?;
        match write_bundle(&tx, bundle).await {
            Ok(summary) => {
                tx.commit().await?;
                Ok(summary)
            }
            Err(err) => {
                tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Removes a video; its comments go with it through the cascade.
    pub async fn delete_video(&self, video_id: &str) -> HarvestResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let tx = conn.begin().await?;
        match tx
            .execute("DELETE FROM videos WHERE video_id = ?1", params![video_id])
            .await
        {
            Ok(deleted) => {
                tx.commit().await?;
                Ok(deleted > 0)
            }
            Err(err) => {
                tx.rollback().await;
                Err(err.into())
            }
        }
    }
}

async fn write_bundle(conn: &Connection, bundle: &VideoBundle) -> HarvestResult<PersistSummary> {
    let channel = &bundle.channel;
    let channel_created = if row_exists(
        conn,
        "SELECT 1 FROM channels WHERE channel_id = ?1",
        &channel.channel_id,
    )
    .await?
    {
        false
    } else {
        insert_channel(conn, channel).await?;
        true
    };

    let video = &bundle.video;
    let video_created = if row_exists(
        conn,
        "SELECT 1 FROM videos WHERE video_id = ?1",
        &video.video_id,
    )
    .await?
    {
        false
    } else {
        insert_video(conn, video, &channel.channel_id).await?;
        true
    };

    let mut comments_inserted = 0;
    for batch in bundle.comments.chunks(COMMENT_BATCH_SIZE) {
        let inserted = insert_comment_batch(conn, &video.video_id, batch).await?;
        debug!(
            video_id = %video.video_id,
            batch = batch.len(),
            inserted,
            "comment batch written"
        );
        comments_inserted += inserted;
    }

    Ok(PersistSummary {
        video_id: video.video_id.clone(),
        channel_created,
        video_created,
        comments_inserted,
        comments_skipped: bundle.comments.len() as u64 - comments_inserted,
    })
}

async fn row_exists(conn: &Connection, sql: &str, id: &str) -> HarvestResult<bool> {
    let mut rows = conn.query(sql, params![id]).await?;
    Ok(rows.next().await?.is_some())
}

async fn insert_channel(conn: &Connection, channel: &ChannelRecord) -> HarvestResult<()> {
    conn.execute(
        r#"
        INSERT INTO channels (
            channel_id, title, keywords, description, view_count,
            subscriber_count, video_count, country, created_at_remote
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            channel.channel_id.as_str(),
            channel.title.as_str(),
            channel.keywords.as_deref(),
            channel.description.as_deref(),
            channel.view_count,
            channel.subscriber_count,
            channel.video_count,
            channel.country.as_deref(),
            timestamp_to_text(&channel.created_at),
        ],
    )
    .await?;
    Ok(())
}

async fn insert_video(conn: &Connection, video: &VideoRecord, channel_id: &str) -> HarvestResult<()> {
    conn.execute(
        r#"
        INSERT INTO videos (
            video_id, title, description, category, view_count,
            comment_count, like_count, published_at, channel_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            video.video_id.as_str(),
            video.title.as_str(),
            video.description.as_deref(),
            video.category.as_deref(),
            video.view_count.as_str(),
            video.comment_count.as_str(),
            video.like_count.as_str(),
            timestamp_to_text(&video.published_at),
            channel_id,
        ],
    )
    .await?;
    Ok(())
}

const COMMENT_COLUMNS: usize = 8;

fn comment_batch_sql(rows: usize) -> String {
    let row = format!("({})", vec!["?"; COMMENT_COLUMNS].join(", "));
    let values = vec![row.as_str(); rows].join(", ");
    format!(
        "INSERT INTO comments (comment_id, text, published_at, like_count, reply_count, \
         video_id, commenter_channel_id, parent_comment_id) VALUES {values} \
         ON CONFLICT(comment_id) DO NOTHING"
    )
}

/// Inserts one batch, skipping ids that already exist. Returns how many rows
/// were actually written.
async fn insert_comment_batch(
    conn: &Connection,
    video_id: &str,
    batch: &[CommentRecord],
) -> HarvestResult<u64> {
    if batch.is_empty() {
        return Ok(0);
    }

    let mut values = Vec::with_capacity(batch.len() * COMMENT_COLUMNS);
    for comment in batch {
        values.push(Value::Text(comment.comment_id.clone()));
        values.push(Value::Text(comment.text.clone()));
        values.push(Value::Text(timestamp_to_text(&comment.published_at)));
        values.push(Value::Integer(comment.like_count));
        values.push(Value::Integer(comment.reply_count));
        values.push(Value::Text(video_id.to_string()));
        values.push(Value::Text(comment.commenter_channel_id.clone()));
        values.push(optional_text(comment.parent_comment_id.as_deref()));
    }

    let inserted = conn
        .execute(&comment_batch_sql(batch.len()), Params::Positional(values))
        .await?;
    Ok(inserted)
}

/// Read side of the store. Relationship navigation is done with explicit
/// queries by id.
#[derive(Clone)]
pub struct MetadataReader {
    pool: ConnectionPool,
}

const CHANNEL_COLUMNS: &str = "channel_id, title, keywords, description, view_count, \
     subscriber_count, video_count, country, created_at_remote";
const VIDEO_COLUMNS: &str = "video_id, title, description, category, view_count, \
     comment_count, like_count, published_at, channel_id";
const COMMENT_SELECT: &str = "comment_id, text, published_at, like_count, reply_count, \
     video_id, commenter_channel_id, parent_comment_id";

impl MetadataReader {
    pub async fn channel(&self, channel_id: &str) -> HarvestResult<Option<ChannelRecord>> {
        let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE channel_id = ?1");
        let conn = self.pool.acquire().await?;
        let mut rows = conn.query(&sql, params![channel_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn video(&self, video_id: &str) -> HarvestResult<Option<VideoRecord>> {
        let sql = format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE video_id = ?1");
        let conn = self.pool.acquire().await?;
        let mut rows = conn.query(&sql, params![video_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn comment(&self, comment_id: &str) -> HarvestResult<Option<CommentRecord>> {
        let sql = format!("SELECT {COMMENT_SELECT} FROM comments WHERE comment_id = ?1");
        let conn = self.pool.acquire().await?;
        let mut rows = conn.query(&sql, params![comment_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_comment(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn videos_for_channel(&self, channel_id: &str) -> HarvestResult<Vec<VideoRecord>> {
        let sql = format!(
            "SELECT {VIDEO_COLUMNS} FROM videos WHERE channel_id = ?1 \
             ORDER BY published_at DESC, rowid DESC"
        );
        let conn = self.pool.acquire().await?;
        let mut rows = conn.query(&sql, params![channel_id]).await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }

    pub async fn comments_for_video(&self, video_id: &str) -> HarvestResult<Vec<CommentRecord>> {
        self.comments_where("video_id = ?1", video_id).await
    }

    pub async fn comments_by_channel(&self, channel_id: &str) -> HarvestResult<Vec<CommentRecord>> {
        self.comments_where("commenter_channel_id = ?1", channel_id)
            .await
    }

    pub async fn replies_to(&self, comment_id: &str) -> HarvestResult<Vec<CommentRecord>> {
        self.comments_where("parent_comment_id = ?1", comment_id)
            .await
    }

    async fn comments_where(&self, filter: &str, id: &str) -> HarvestResult<Vec<CommentRecord>> {
        let sql = format!(
            "SELECT {COMMENT_SELECT} FROM comments WHERE {filter} \
             ORDER BY published_at ASC, rowid ASC"
        );
        let conn = self.pool.acquire().await?;
        let mut rows = conn.query(&sql, params![id]).await?;
        let mut comments = Vec::new();
        while let Some(row) = rows.next().await? {
            comments.push(row_to_comment(&row)?);
        }
        Ok(comments)
    }

    pub async fn counts(&self) -> HarvestResult<TableCounts> {
        let conn = self.pool.acquire().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM channels),
                    (SELECT COUNT(*) FROM videos),
                    (SELECT COUNT(*) FROM comments)
                "#,
                params![],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(TableCounts::default());
        };
        Ok(TableCounts {
            channels: row.get(0)?,
            videos: row.get(1)?,
            comments: row.get(2)?,
        })
    }
}

// Column order must match CHANNEL_COLUMNS.
fn row_to_channel(row: &Row) -> HarvestResult<ChannelRecord> {
    let created_at: String = row.get(8)?;
    Ok(ChannelRecord {
        channel_id: row.get(0)?,
        title: row.get(1)?,
        keywords: row.get(2)?,
        description: row.get(3)?,
        view_count: row.get(4)?,
        subscriber_count: row.get(5)?,
        video_count: row.get(6)?,
        country: row.get(7)?,
        created_at: timestamp_from_text(&created_at)?,
    })
}

// Column order must match VIDEO_COLUMNS.
fn row_to_video(row: &Row) -> HarvestResult<VideoRecord> {
    let published_at: String = row.get(7)?;
    Ok(VideoRecord {
        video_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        view_count: row.get(4)?,
        comment_count: row.get(5)?,
        like_count: row.get(6)?,
        published_at: timestamp_from_text(&published_at)?,
        channel_id: row.get(8)?,
    })
}

// Column order must match COMMENT_SELECT.
fn row_to_comment(row: &Row) -> HarvestResult<CommentRecord> {
    let published_at: String = row.get(2)?;
    Ok(CommentRecord {
        comment_id: row.get(0)?,
        text: row.get(1)?,
        published_at: timestamp_from_text(&published_at)?,
        like_count: row.get(3)?,
        reply_count: row.get::<Option<i64>>(4)?.unwrap_or(0),
        video_id: row.get(5)?,
        commenter_channel_id: row.get(6)?,
        parent_comment_id: row.get(7)?,
    })
}
