//! Per-video ingest: fetch everything a video needs, then store it.
//!
//! At most `concurrency` videos are mid-flight at once; the rest queue on the
//! admission gate in arrival order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{HarvestError, HarvestResult};
use crate::metadata::{ChannelRecord, MetadataStore, PersistOutcome, VideoBundle, VideoRecord};
use crate::validate::extract_video_id;
use crate::youtube::{FetchedComment, Gateway, SearchParams};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Searching,
    Processing { total: usize, completed: usize },
    Done { succeeded: usize, total: usize },
}

#[derive(Debug, Clone)]
pub struct VideoOutcome {
    pub video_id: String,
    pub result: Result<PersistOutcome, HarvestError>,
}

impl VideoOutcome {
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(outcome) if outcome.is_success())
    }

    pub fn log_line(&self) -> String {
        match &self.result {
            Ok(outcome) if outcome.is_success() => {
                format!("Video {} processed successfully: {outcome}", self.video_id)
            }
            Ok(outcome) => format!("Error processing video {}: {outcome}", self.video_id),
            Err(err) => format!("Error processing video {}: {err}", self.video_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    /// In completion order.
    pub outcomes: Vec<VideoOutcome>,
}

impl BatchReport {
    pub fn summary(&self) -> String {
        format!(
            "Final result: processed {} out of {} videos",
            self.succeeded, self.total
        )
    }
}

#[derive(Clone)]
pub struct IngestPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    gateway: Gateway,
    store: MetadataStore,
    gate: Arc<Semaphore>,
    state: Mutex<PipelineState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a video as mid-flight for as long as it lives.
struct InFlight<'a>(&'a PipelineInner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a PipelineInner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IngestPipeline {
    pub fn new(gateway: Gateway, store: MetadataStore, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                gateway,
                store,
                gate: Arc::new(Semaphore::new(concurrency.max(1))),
                state: Mutex::new(PipelineState::Idle),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.inner.state.lock().clone()
    }

    /// Highest number of videos that were mid-flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &MetadataStore {
        &self.inner.store
    }

    pub fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    fn set_state(&self, state: PipelineState) {
        *self.inner.state.lock() = state;
    }

    pub async fn search(&self, params: &SearchParams) -> HarvestResult<Option<Vec<String>>> {
        // A running batch keeps reporting its own progress.
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, PipelineState::Processing { .. }) {
                *state = PipelineState::Searching;
            }
        }
        let result = self.inner.gateway.search_videos(params).await;
        let mut state = self.inner.state.lock();
        if *state == PipelineState::Searching {
            *state = PipelineState::Idle;
        }
        drop(state);
        result
    }

    /// Fetches and stores one video. Never fails: problems come back inside
    /// the outcome.
    pub async fn process_one(&self, raw_id: &str) -> VideoOutcome {
        let Some(video_id) = extract_video_id(raw_id) else {
            return VideoOutcome {
                video_id: raw_id.to_string(),
                result: Err(HarvestError::invalid(format!(
                    "'{raw_id}' is not a YouTube video id or URL"
                ))),
            };
        };

        let result = match self.inner.gate.clone().acquire_owned().await {
            Ok(_permit) => {
                let _flight = InFlight::enter(&self.inner);
                self.fetch_and_store(&video_id).await
            }
            Err(_) => Err(HarvestError::Persistence("admission gate closed".into())),
        };
        VideoOutcome { video_id, result }
    }

    async fn fetch_and_store(&self, video_id: &str) -> HarvestResult<PersistOutcome> {
        let gateway = &self.inner.gateway;
        let (comments, (video, channel)) = tokio::try_join!(
            gateway.fetch_comments(video_id),
            async {
                let video = gateway.fetch_video_metadata(video_id).await?;
                let channel_id = video.channel_id.clone().ok_or_else(|| {
                    HarvestError::upstream(format!("video {video_id} has no channel id"))
                })?;
                let channel = gateway.fetch_channel_metadata(&channel_id).await?;
                Ok::<_, HarvestError>((video, channel))
            }
        )?;

        let bundle = assemble_bundle(video, channel, comments);
        Ok(self.inner.store.persist(&bundle).await)
    }

    /// Runs every id concurrently (bounded by the admission gate) and reports
    /// each outcome to `on_outcome` as soon as it is known.
    pub async fn process_many<F>(&self, ids: Vec<String>, mut on_outcome: F) -> BatchReport
    where
        F: FnMut(&VideoOutcome),
    {
        let total = ids.len();
        self.set_state(PipelineState::Processing {
            total,
            completed: 0,
        });

        let mut tasks = JoinSet::new();
        let mut pending = HashMap::with_capacity(total);
        for raw_id in ids {
            let pipeline = self.clone();
            let task_arg = raw_id.clone();
            let handle = tasks.spawn(async move { pipeline.process_one(&task_arg).await });
            pending.insert(handle.id(), raw_id);
        }

        let mut outcomes = Vec::with_capacity(total);
        let mut succeeded = 0;
        while let Some(joined) = tasks.join_next_with_id().await {
            let outcome = match joined {
                Ok((task_id, outcome)) => {
                    pending.remove(&task_id);
                    outcome
                }
                Err(err) => {
                    let video_id = pending.remove(&err.id()).unwrap_or_default();
                    warn!(%video_id, error = %err, "ingest task did not finish");
                    VideoOutcome {
                        video_id,
                        result: Err(HarvestError::Persistence(format!(
                            "ingest task failed: {err}"
                        ))),
                    }
                }
            };

            if outcome.is_success() {
                succeeded += 1;
            }
            outcomes.push(outcome);
            self.set_state(PipelineState::Processing {
                total,
                completed: outcomes.len(),
            });
            if let Some(last) = outcomes.last() {
                on_outcome(last);
            }
        }

        self.set_state(PipelineState::Done { succeeded, total });
        let report = BatchReport {
            total,
            succeeded,
            outcomes,
        };
        info!(succeeded, total, "batch finished");
        report
    }
}

/// Builds the bundle to store. Comments without a commenter are dropped, and
/// so is every reply below a dropped comment, since its parent would never
/// reach the table.
fn assemble_bundle(
    video: VideoRecord,
    channel: ChannelRecord,
    comments: Vec<FetchedComment>,
) -> VideoBundle {
    let (mut kept, anonymous): (Vec<_>, Vec<_>) = comments
        .into_iter()
        .partition(|comment| comment.commenter_channel_id.is_some());
    let mut dropped: HashSet<String> = anonymous
        .into_iter()
        .map(|comment| comment.comment_id)
        .collect();
    let without_commenter = dropped.len();

    // Replies may arrive before their parents, so repeat until stable.
    loop {
        let before = kept.len();
        kept.retain(|comment| match &comment.parent_comment_id {
            Some(parent) if dropped.contains(parent) => {
                dropped.insert(comment.comment_id.clone());
                false
            }
            _ => true,
        });
        if kept.len() == before {
            break;
        }
    }

    if !dropped.is_empty() {
        warn!(
            video_id = %video.video_id,
            without_commenter,
            orphaned_replies = dropped.len() - without_commenter,
            "dropping comments without a commenter channel"
        );
    }
    let comments = kept
        .into_iter()
        .filter_map(|comment| comment.into_record(&video.video_id))
        .collect();
    VideoBundle {
        channel,
        video,
        comments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TableCounts;
    use crate::testing::{FakeSource, fetched_comment};
    use anyhow::Result;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn pipeline_with(
        source: FakeSource,
        concurrency: usize,
    ) -> Result<(tempfile::TempDir, IngestPipeline, Arc<FakeSource>)> {
        let dir = tempdir()?;
        let store = MetadataStore::open(&dir.path().join("pipeline.db"), 4).await?;
        let source = Arc::new(source);
        let pipeline = IngestPipeline::new(Gateway::new(source.clone()), store, concurrency);
        Ok((dir, pipeline, source))
    }

    fn ids(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("vid{i:08}")).collect()
    }

    #[tokio::test]
    async fn stores_a_video_with_a_reply_thread() -> Result<()> {
        let source = FakeSource::new().with_comments(
            "vid00000001",
            vec![
                fetched_comment("c-top", Some("UCa"), None),
                fetched_comment("c-reply", Some("UCb"), Some("c-top")),
            ],
        );
        let (_dir, pipeline, _source) = pipeline_with(source, 5).await?;

        let outcome = pipeline.process_one("vid00000001").await;
        assert!(outcome.is_success(), "{}", outcome.log_line());
        assert!(
            outcome
                .log_line()
                .starts_with("Video vid00000001 processed successfully: Created video ID vid00000001")
        );

        let reader = pipeline.store().reader();
        assert_eq!(
            reader.counts().await?,
            TableCounts {
                channels: 1,
                videos: 1,
                comments: 2
            }
        );
        let replies = reader.replies_to("c-top").await?;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].commenter_channel_id, "UCb");
        let video = reader.video("vid00000001").await?.expect("video stored");
        assert_eq!(video.channel_id.as_deref(), Some("chan-vid00000001"));
        Ok(())
    }

    #[tokio::test]
    async fn urls_are_normalised_before_fetching() -> Result<()> {
        let (_dir, pipeline, source) = pipeline_with(FakeSource::new(), 5).await?;
        let outcome = pipeline.process_one("https://youtu.be/vid00000007").await;
        assert_eq!(outcome.video_id, "vid00000007");
        assert!(outcome.is_success());
        assert!(source.calls().contains(&"video:vid00000007".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_ids_fail_without_network_calls() -> Result<()> {
        let (_dir, pipeline, source) = pipeline_with(FakeSource::new(), 5).await?;
        let outcome = pipeline.process_one("not a video").await;
        assert!(!outcome.is_success());
        assert!(matches!(outcome.result, Err(HarvestError::InvalidArgument(_))));
        assert!(outcome.log_line().starts_with("Error processing video not a video"));
        assert!(source.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn one_failed_fetch_does_not_sink_the_batch() -> Result<()> {
        let source = FakeSource::new().failing_video("vid00000002");
        let (_dir, pipeline, _source) = pipeline_with(source, 5).await?;

        let mut seen = Vec::new();
        let report = pipeline
            .process_many(ids(3), |outcome| seen.push(outcome.video_id.clone()))
            .await;

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.summary(), "Final result: processed 2 out of 3 videos");
        assert_eq!(seen.len(), 3);
        let failed: Vec<_> = report
            .outcomes
            .iter()
            .filter(|outcome| !outcome.is_success())
            .map(|outcome| outcome.video_id.as_str())
            .collect();
        assert_eq!(failed, ["vid00000002"]);
        assert!(matches!(
            report.outcomes.iter().find(|o| o.video_id == "vid00000002").map(|o| &o.result),
            Some(Err(HarvestError::Upstream(_)))
        ));
        assert_eq!(
            pipeline.state(),
            PipelineState::Done {
                succeeded: 2,
                total: 3
            }
        );
        assert_eq!(pipeline.store().reader().counts().await?.videos, 2);
        Ok(())
    }

    #[tokio::test]
    async fn admission_gate_caps_videos_in_flight() -> Result<()> {
        let source = FakeSource::new().with_delay(Duration::from_millis(20));
        let (_dir, pipeline, _source) = pipeline_with(source, 5).await?;

        let report = pipeline.process_many(ids(12), |_| {}).await;

        assert_eq!(report.total, 12);
        assert_eq!(report.outcomes.len(), 12);
        assert_eq!(report.succeeded, 12);
        assert_eq!(pipeline.peak_in_flight(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn rerunning_an_ingest_changes_nothing() -> Result<()> {
        let source = FakeSource::new().with_comments(
            "vid00000001",
            vec![fetched_comment("c-1", Some("UCa"), None)],
        );
        let (_dir, pipeline, _source) = pipeline_with(source, 5).await?;

        let first = pipeline.process_many(ids(2), |_| {}).await;
        let before = pipeline.store().reader().counts().await?;
        let second = pipeline.process_many(ids(2), |_| {}).await;
        let after = pipeline.store().reader().counts().await?;

        assert_eq!(first.succeeded, 2);
        assert_eq!(second.succeeded, 2);
        assert_eq!(before, after);
        assert!(second.outcomes.iter().all(|o| o.log_line().contains("Reused video ID")));
        Ok(())
    }

    #[tokio::test]
    async fn comments_without_a_commenter_are_dropped() -> Result<()> {
        let source = FakeSource::new().with_comments(
            "vid00000001",
            vec![
                fetched_comment("c-known", Some("UCa"), None),
                fetched_comment("c-anonymous", None, None),
            ],
        );
        let (_dir, pipeline, _source) = pipeline_with(source, 5).await?;

        assert!(pipeline.process_one("vid00000001").await.is_success());
        let reader = pipeline.store().reader();
        assert_eq!(reader.counts().await?.comments, 1);
        assert!(reader.comment("c-anonymous").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn replies_below_a_dropped_comment_are_dropped_too() -> Result<()> {
        let source = FakeSource::new().with_comments(
            "vid00000001",
            vec![
                fetched_comment("c-nested", Some("UCc"), Some("c-reply")),
                fetched_comment("c-top", None, None),
                fetched_comment("c-reply", Some("UCb"), Some("c-top")),
                fetched_comment("c-other", Some("UCa"), None),
            ],
        );
        let (_dir, pipeline, _source) = pipeline_with(source, 5).await?;

        let outcome = pipeline.process_one("vid00000001").await;
        assert!(outcome.is_success(), "{}", outcome.log_line());
        let reader = pipeline.store().reader();
        assert_eq!(
            reader.counts().await?,
            TableCounts {
                channels: 1,
                videos: 1,
                comments: 1
            }
        );
        assert!(reader.comment("c-other").await?.is_some());
        assert!(reader.comment("c-reply").await?.is_none());
        assert!(reader.comment("c-nested").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn search_during_a_batch_keeps_the_batch_state() -> Result<()> {
        let source = FakeSource::new()
            .with_search(Ok(ids(2)))
            .with_delay(Duration::from_millis(100));
        let (_dir, pipeline, _source) = pipeline_with(source, 5).await?;

        let batch = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.process_many(ids(3), |_| {}).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(pipeline.state(), PipelineState::Processing { total: 3, .. }));

        pipeline.search(&SearchParams::for_query("rust")).await?;
        assert!(matches!(pipeline.state(), PipelineState::Processing { total: 3, .. }));

        let report = batch.await?;
        assert_eq!(report.succeeded, 3);
        assert_eq!(
            pipeline.state(),
            PipelineState::Done {
                succeeded: 3,
                total: 3
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn orphan_replies_surface_as_integrity_failures() -> Result<()> {
        let source = FakeSource::new().with_comments(
            "vid00000001",
            vec![fetched_comment("c-reply", Some("UCb"), Some("c-missing"))],
        );
        let (_dir, pipeline, _source) = pipeline_with(source, 5).await?;

        let outcome = pipeline.process_one("vid00000001").await;
        assert!(!outcome.is_success());
        assert!(matches!(
            outcome.result,
            Ok(PersistOutcome::IntegrityViolation(_))
        ));
        assert!(outcome.log_line().contains("Database integrity error"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_search_returns_none_and_stays_idle() -> Result<()> {
        let source = FakeSource::new().with_search(Err(HarvestError::upstream("quota exceeded")));
        let (_dir, pipeline, _source) = pipeline_with(source, 5).await?;

        let found = pipeline.search(&SearchParams::for_query("rust")).await?;
        assert_eq!(found, None);
        assert_eq!(pipeline.state(), PipelineState::Idle);

        let invalid = pipeline.search(&SearchParams::for_query(" ")).await;
        assert!(matches!(invalid, Err(HarvestError::InvalidArgument(_))));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn successful_search_returns_ids() -> Result<()> {
        let source = FakeSource::new().with_search(Ok(ids(3)));
        let (_dir, pipeline, source) = pipeline_with(source, 5).await?;

        let found = pipeline.search(&SearchParams::for_query("  rust  ")).await?;
        assert_eq!(found, Some(ids(3)));
        assert_eq!(source.calls(), ["search:rust"]);
        Ok(())
    }
}
