//! Access to the YouTube Data API v3.
//!
//! [`MetadataSource`] is the seam the rest of the crate talks to.
//! [`DataApiClient`] implements it over HTTP with a blocking `ureq` agent
//! driven from the blocking pool, and [`Gateway`] adds parameter validation
//! and the fail-soft search policy on top.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::HarvestSettings;
use crate::error::{HarvestError, HarvestResult};
use crate::metadata::{ChannelRecord, CommentRecord, VideoRecord};
use crate::validate::{
    validate_category, validate_date, validate_date_range, validate_max_results, validate_query,
};

/// The API refuses larger pages for search.
const SEARCH_PAGE_SIZE: u32 = 50;
const COMMENT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum VideoDuration {
    Any,
    /// Under four minutes.
    Short,
    #[default]
    Medium,
    /// Over twenty minutes.
    Long,
}

impl VideoDuration {
    pub fn as_api_value(self) -> &'static str {
        match self {
            VideoDuration::Any => "any",
            VideoDuration::Short => "short",
            VideoDuration::Medium => "medium",
            VideoDuration::Long => "long",
        }
    }
}

/// Raw search input as typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub query: String,
    pub max_results: i64,
    pub category: String,
    pub published_after: String,
    pub published_before: String,
    pub duration: VideoDuration,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            max_results: 42,
            category: "1".to_string(),
            published_after: "2005-02-14".to_string(),
            published_before: "2025-01-01".to_string(),
            duration: VideoDuration::Medium,
        }
    }
}

impl SearchParams {
    pub fn for_query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> HarvestResult<SearchRequest> {
        let published_after = validate_date(&self.published_after)?;
        let published_before = validate_date(&self.published_before)?;
        validate_date_range(published_after, published_before)?;
        Ok(SearchRequest {
            query: validate_query(&self.query)?,
            max_results: validate_max_results(self.max_results)?,
            category: validate_category(&self.category)?,
            published_after,
            published_before,
            duration: self.duration,
        })
    }
}

/// Search input that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: u32,
    pub category: u8,
    pub published_after: NaiveDate,
    pub published_before: NaiveDate,
    pub duration: VideoDuration,
}

/// A comment as delivered by the API. The commenter id is optional here
/// because the API omits it for some deleted or restricted authors.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedComment {
    pub comment_id: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
    pub like_count: i64,
    pub reply_count: i64,
    pub commenter_channel_id: Option<String>,
    pub parent_comment_id: Option<String>,
}

impl FetchedComment {
    /// `None` when the commenter is unknown.
    pub fn into_record(self, video_id: &str) -> Option<CommentRecord> {
        let commenter_channel_id = self.commenter_channel_id?;
        Some(CommentRecord {
            comment_id: self.comment_id,
            text: self.text,
            published_at: self.published_at,
            like_count: self.like_count,
            reply_count: self.reply_count,
            video_id: Some(video_id.to_string()),
            commenter_channel_id,
            parent_comment_id: self.parent_comment_id,
        })
    }
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Cheap call that proves the credentials work.
    async fn verify(&self) -> HarvestResult<()>;

    async fn search(&self, request: &SearchRequest) -> HarvestResult<Vec<String>>;

    async fn video(&self, video_id: &str) -> HarvestResult<VideoRecord>;

    async fn channel(&self, channel_id: &str) -> HarvestResult<ChannelRecord>;

    /// Every top-level comment and inline reply of a video.
    async fn comments(&self, video_id: &str) -> HarvestResult<Vec<FetchedComment>>;
}

/// HTTP client for the Data API.
#[derive(Clone)]
pub struct DataApiClient {
    agent: ureq::Agent,
    api_key: String,
    api_base: String,
    region_code: String,
    relevance_language: String,
    comment_page_limit: Option<usize>,
}

impl DataApiClient {
    pub fn new(settings: &HarvestSettings) -> anyhow::Result<Self> {
        let api_key = settings.require_api_key()?.to_string();
        Ok(Self {
            agent: ureq::AgentBuilder::new().build(),
            api_key,
            api_base: settings.api_base.clone(),
            region_code: settings.region_code.clone(),
            relevance_language: settings.relevance_language.clone(),
            comment_page_limit: settings.comment_page_limit,
        })
    }

    async fn get<T>(&self, endpoint: &str, query: Vec<(&'static str, String)>) -> HarvestResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let agent = self.agent.clone();
        let url = format!("{}/{endpoint}", self.api_base);
        let api_key = self.api_key.clone();
        let label = endpoint.to_string();
        debug!(endpoint, "calling data api");

        let body = tokio::task::spawn_blocking(move || fetch_json(&agent, &url, &api_key, &query))
            .await
            .map_err(|err| HarvestError::upstream(format!("{label} request task failed: {err}")))??;

        if let Some(message) = api_error_message(&body) {
            return Err(HarvestError::upstream(format!("{endpoint}: {message}")));
        }
        serde_json::from_value(body)
            .map_err(|err| HarvestError::upstream(format!("{endpoint}: unexpected payload: {err}")))
    }
}

fn fetch_json(
    agent: &ureq::Agent,
    url: &str,
    api_key: &str,
    query: &[(&'static str, String)],
) -> HarvestResult<Value> {
    let mut request = agent.get(url).query("key", api_key);
    for (name, value) in query {
        request = request.query(name, value);
    }

    match request.call() {
        Ok(response) => response
            .into_json::<Value>()
            .map_err(|err| HarvestError::upstream(format!("reading response: {err}"))),
        Err(ureq::Error::Status(code, response)) => {
            let detail = response
                .into_json::<Value>()
                .ok()
                .and_then(|body| api_error_message(&body))
                .unwrap_or_else(|| "no error detail".to_string());
            Err(HarvestError::upstream(format!("HTTP {code}: {detail}")))
        }
        Err(ureq::Error::Transport(err)) => Err(HarvestError::upstream(redact(
            &format!("transport failure: {err}"),
            api_key,
        ))),
    }
}

/// Transport errors quote the request URL, which carries the key.
fn redact(message: &str, api_key: &str) -> String {
    if api_key.is_empty() {
        return message.to_string();
    }
    message.replace(api_key, "<redacted>")
}

fn api_error_message(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Some(match error.get("code").and_then(Value::as_i64) {
        Some(code) => format!("{message} ({code})"),
        None => message.to_string(),
    })
}

fn start_of_day(date: NaiveDate) -> String {
    date.and_time(NaiveTime::MIN)
        .and_utc()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl MetadataSource for DataApiClient {
    async fn verify(&self) -> HarvestResult<()> {
        let _: Value = self
            .get(
                "videoCategories",
                vec![
                    ("part", "snippet".to_string()),
                    ("regionCode", self.region_code.clone()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn search(&self, request: &SearchRequest) -> HarvestResult<Vec<String>> {
        let wanted = request.max_results as usize;
        let mut ids = Vec::with_capacity(wanted);
        let mut page_token: Option<String> = None;

        loop {
            let remaining = (wanted - ids.len()) as u32;
            let mut query = vec![
                ("part", "snippet".to_string()),
                ("type", "video".to_string()),
                ("order", "viewCount".to_string()),
                ("q", request.query.clone()),
                ("maxResults", remaining.min(SEARCH_PAGE_SIZE).to_string()),
                ("regionCode", self.region_code.clone()),
                ("relevanceLanguage", self.relevance_language.clone()),
                ("publishedAfter", start_of_day(request.published_after)),
                ("publishedBefore", start_of_day(request.published_before)),
                ("videoDuration", request.duration.as_api_value().to_string()),
                ("videoCategoryId", request.category.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let page: SearchListResponse = self.get("search", query).await?;
            ids.extend(
                page.items
                    .into_iter()
                    .filter_map(|item| item.id.video_id)
                    .take(wanted - ids.len()),
            );

            match page.next_page_token {
                Some(token) if ids.len() < wanted => page_token = Some(token),
                _ => break,
            }
        }

        info!(query = %request.query, found = ids.len(), "search finished");
        Ok(ids)
    }

    async fn video(&self, video_id: &str) -> HarvestResult<VideoRecord> {
        let response: VideoListResponse = self
            .get(
                "videos",
                vec![
                    ("part", "snippet,statistics".to_string()),
                    ("id", video_id.to_string()),
                ],
            )
            .await?;
        let item = response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| HarvestError::upstream(format!("video {video_id} not found")))?;
        map_video(item)
    }

    async fn channel(&self, channel_id: &str) -> HarvestResult<ChannelRecord> {
        let response: ChannelListResponse = self
            .get(
                "channels",
                vec![
                    ("part", "snippet,statistics,brandingSettings".to_string()),
                    ("id", channel_id.to_string()),
                ],
            )
            .await?;
        let item = response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| HarvestError::upstream(format!("channel {channel_id} not found")))?;
        map_channel(item)
    }

    async fn comments(&self, video_id: &str) -> HarvestResult<Vec<FetchedComment>> {
        let mut comments = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let mut query = vec![
                ("part", "snippet,replies".to_string()),
                ("videoId", video_id.to_string()),
                ("maxResults", COMMENT_PAGE_SIZE.to_string()),
                ("textFormat", "plainText".to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let page: CommentThreadListResponse = self.get("commentThreads", query).await?;
            pages += 1;
            for thread in page.items {
                comments.extend(map_thread(thread)?);
            }

            let limit_reached = self
                .comment_page_limit
                .is_some_and(|limit| pages >= limit);
            match page.next_page_token {
                Some(token) if !limit_reached => page_token = Some(token),
                _ => break,
            }
        }

        debug!(video_id, pages, comments = comments.len(), "comments fetched");
        Ok(comments)
    }
}

// --- Data API response types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchListResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    id: String,
    snippet: VideoSnippet,
    statistics: Option<VideoStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    description: Option<String>,
    published_at: String,
    channel_id: Option<String>,
    category_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelItem {
    id: String,
    snippet: ChannelSnippet,
    statistics: Option<ChannelStatistics>,
    branding_settings: Option<BrandingSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelSnippet {
    title: String,
    description: Option<String>,
    published_at: String,
    country: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    view_count: Option<String>,
    subscriber_count: Option<String>,
    video_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BrandingSettings {
    channel: Option<BrandingChannel>,
}

#[derive(Debug, Deserialize)]
struct BrandingChannel {
    keywords: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadListResponse {
    #[serde(default)]
    items: Vec<CommentThread>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentThread {
    snippet: ThreadSnippet,
    replies: Option<ThreadReplies>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadSnippet {
    top_level_comment: CommentResource,
    total_reply_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ThreadReplies {
    #[serde(default)]
    comments: Vec<CommentResource>,
}

#[derive(Debug, Deserialize)]
struct CommentResource {
    id: String,
    snippet: CommentSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentSnippet {
    text_original: Option<String>,
    text_display: Option<String>,
    published_at: String,
    like_count: Option<i64>,
    author_channel_id: Option<AuthorChannelId>,
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorChannelId {
    value: String,
}

fn parse_timestamp(raw: &str) -> HarvestResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| HarvestError::upstream(format!("bad timestamp '{raw}': {err}")))
}

fn parse_count(raw: Option<&str>) -> HarvestResult<i64> {
    match raw {
        None => Ok(0),
        Some(value) => value
            .parse()
            .map_err(|_| HarvestError::upstream(format!("bad count '{value}'"))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

fn map_video(item: VideoItem) -> HarvestResult<VideoRecord> {
    let stats = item.statistics.unwrap_or_default();
    Ok(VideoRecord {
        published_at: parse_timestamp(&item.snippet.published_at)?,
        video_id: item.id,
        title: item.snippet.title,
        description: non_empty(item.snippet.description),
        category: item.snippet.category_id,
        view_count: stats.view_count.unwrap_or_else(|| "0".to_string()),
        comment_count: stats.comment_count.unwrap_or_else(|| "0".to_string()),
        like_count: stats.like_count.unwrap_or_else(|| "0".to_string()),
        channel_id: item.snippet.channel_id,
    })
}

fn map_channel(item: ChannelItem) -> HarvestResult<ChannelRecord> {
    let stats = item.statistics.unwrap_or_default();
    let keywords = item
        .branding_settings
        .and_then(|branding| branding.channel)
        .and_then(|channel| non_empty(channel.keywords));
    Ok(ChannelRecord {
        created_at: parse_timestamp(&item.snippet.published_at)?,
        view_count: parse_count(stats.view_count.as_deref())?,
        subscriber_count: parse_count(stats.subscriber_count.as_deref())?,
        video_count: parse_count(stats.video_count.as_deref())?,
        channel_id: item.id,
        title: item.snippet.title,
        keywords,
        description: non_empty(item.snippet.description),
        country: item.snippet.country,
    })
}

fn map_comment(
    resource: CommentResource,
    reply_count: i64,
    parent: Option<&str>,
) -> HarvestResult<FetchedComment> {
    let snippet = resource.snippet;
    Ok(FetchedComment {
        published_at: parse_timestamp(&snippet.published_at)?,
        comment_id: resource.id,
        text: snippet
            .text_original
            .or(snippet.text_display)
            .unwrap_or_default(),
        like_count: snippet.like_count.unwrap_or(0),
        reply_count,
        commenter_channel_id: snippet.author_channel_id.map(|author| author.value),
        parent_comment_id: snippet.parent_id.or_else(|| parent.map(str::to_string)),
    })
}

/// Flattens a thread: the top-level comment first, then its inline replies.
fn map_thread(thread: CommentThread) -> HarvestResult<Vec<FetchedComment>> {
    let top = map_comment(
        thread.snippet.top_level_comment,
        thread.snippet.total_reply_count.unwrap_or(0),
        None,
    )?;
    let top_id = top.comment_id.clone();
    let mut flattened = vec![top];
    for reply in thread.replies.map(|r| r.comments).unwrap_or_default() {
        flattened.push(map_comment(reply, 0, Some(&top_id))?);
    }
    Ok(flattened)
}

/// Validating, fail-soft facade over a [`MetadataSource`].
#[derive(Clone)]
pub struct Gateway {
    source: Arc<dyn MetadataSource>,
}

impl Gateway {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self { source }
    }

    pub async fn verify(&self) -> HarvestResult<()> {
        self.source.verify().await
    }

    /// Invalid parameters are an error; an upstream failure is logged and
    /// reported as `Ok(None)`.
    pub async fn search_videos(&self, params: &SearchParams) -> HarvestResult<Option<Vec<String>>> {
        let request = params.validate()?;
        match self.source.search(&request).await {
            Ok(ids) => Ok(Some(ids)),
            Err(err) => {
                warn!(query = %request.query, error = %err, "video search failed");
                Ok(None)
            }
        }
    }

    pub async fn fetch_video_metadata(&self, video_id: &str) -> HarvestResult<VideoRecord> {
        self.source.video(video_id).await
    }

    pub async fn fetch_channel_metadata(&self, channel_id: &str) -> HarvestResult<ChannelRecord> {
        self.source.channel(channel_id).await
    }

    pub async fn fetch_comments(&self, video_id: &str) -> HarvestResult<Vec<FetchedComment>> {
        self.source.comments(video_id).await
    }
}
