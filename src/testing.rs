//! In-process fixtures shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::error::{HarvestError, HarvestResult};
use crate::metadata::{ChannelRecord, CommentRecord, VideoBundle, VideoRecord};
use crate::youtube::{FetchedComment, MetadataSource, SearchRequest};

pub fn fixed_time(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 12, 30, 0)
        .single()
        .expect("valid fixture date")
}

pub fn sample_channel(channel_id: &str) -> ChannelRecord {
    ChannelRecord {
        channel_id: channel_id.to_string(),
        title: format!("Channel {channel_id}"),
        keywords: Some("rust sqlite".into()),
        description: Some("fixture channel".into()),
        country: Some("RU".into()),
        view_count: 12_345,
        subscriber_count: 678,
        video_count: 9,
        created_at: fixed_time(1),
    }
}

pub fn sample_video(video_id: &str, channel_id: &str) -> VideoRecord {
    VideoRecord {
        video_id: video_id.to_string(),
        title: format!("Video {video_id}"),
        description: None,
        category: Some("1".into()),
        view_count: "1000".into(),
        comment_count: "2".into(),
        like_count: "50".into(),
        published_at: fixed_time(2),
        channel_id: Some(channel_id.to_string()),
    }
}

pub fn sample_comment(comment_id: &str, commenter: &str) -> CommentRecord {
    CommentRecord {
        comment_id: comment_id.to_string(),
        text: format!("text-{comment_id}"),
        published_at: fixed_time(3),
        like_count: 1,
        reply_count: 0,
        video_id: None,
        commenter_channel_id: commenter.to_string(),
        parent_comment_id: None,
    }
}

/// A bundle with `comments` top-level comments, each by a different author
/// (`author-0`, `author-1`, ...).
pub fn sample_bundle(video_id: &str, channel_id: &str, comments: usize) -> VideoBundle {
    VideoBundle {
        channel: sample_channel(channel_id),
        video: sample_video(video_id, channel_id),
        comments: (0..comments)
            .map(|i| sample_comment(&format!("{video_id}-c{i}"), &format!("author-{i}")))
            .collect(),
    }
}

pub fn fetched_comment(comment_id: &str, commenter: Option<&str>, parent: Option<&str>) -> FetchedComment {
    FetchedComment {
        comment_id: comment_id.to_string(),
        text: format!("text-{comment_id}"),
        published_at: fixed_time(4),
        like_count: 0,
        reply_count: 0,
        commenter_channel_id: commenter.map(str::to_string),
        parent_comment_id: parent.map(str::to_string),
    }
}

/// Scriptable [`MetadataSource`]. Unknown videos resolve to a generated
/// video on `chan-<id>` with no comments.
#[derive(Default)]
pub struct FakeSource {
    search: Option<HarvestResult<Vec<String>>>,
    comments: HashMap<String, Vec<FetchedComment>>,
    failing_videos: HashSet<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search(mut self, result: HarvestResult<Vec<String>>) -> Self {
        self.search = Some(result);
        self
    }

    pub fn with_comments(mut self, video_id: &str, comments: Vec<FetchedComment>) -> Self {
        self.comments.insert(video_id.to_string(), comments);
        self
    }

    pub fn failing_video(mut self, video_id: &str) -> Self {
        self.failing_videos.insert(video_id.to_string());
        self
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn record(&self, call: String) {
        self.calls.lock().push(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MetadataSource for FakeSource {
    async fn verify(&self) -> HarvestResult<()> {
        self.record("verify".into()).await;
        Ok(())
    }

    async fn search(&self, request: &SearchRequest) -> HarvestResult<Vec<String>> {
        self.record(format!("search:{}", request.query)).await;
        self.search.clone().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn video(&self, video_id: &str) -> HarvestResult<VideoRecord> {
        self.record(format!("video:{video_id}")).await;
        if self.failing_videos.contains(video_id) {
            return Err(HarvestError::upstream(format!("video {video_id} not found")));
        }
        Ok(sample_video(video_id, &format!("chan-{video_id}")))
    }

    async fn channel(&self, channel_id: &str) -> HarvestResult<ChannelRecord> {
        self.record(format!("channel:{channel_id}")).await;
        Ok(sample_channel(channel_id))
    }

    async fn comments(&self, video_id: &str) -> HarvestResult<Vec<FetchedComment>> {
        self.record(format!("comments:{video_id}")).await;
        Ok(self.comments.get(video_id).cloned().unwrap_or_default())
    }
}
