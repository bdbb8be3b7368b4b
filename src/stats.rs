use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use tracing_futures::Instrument;

/// Share of a track that has to be heard for it to count as completed.
pub const COMPLETION_THRESHOLD: f64 = 0.9;

pub fn is_completed(listened: f64, duration: Option<f64>) -> bool {
    match duration {
        Some(duration) if duration > 0.0 => listened >= duration * COMPLETION_THRESHOLD,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackEvent {
    #[serde(rename_all = "camelCase")]
    TrackStarted { guild_id: u64, url: String, title: String, requested_by: String },
    #[serde(rename_all = "camelCase")]
    TrackFinished { guild_id: u64, url: String, listened_secs: f64, completed: bool },
    #[serde(rename_all = "camelCase")]
    TrackSkipped { guild_id: u64, url: String, listened_secs: f64, completed: bool },
    #[serde(rename_all = "camelCase")]
    ResolutionFailed { guild_id: u64, url: String, cause: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsRecord<'a> {
    #[serde(flatten)]
    event: &'a PlaybackEvent,
    recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn record(&self, event: PlaybackEvent) -> Result<(), String>;
}

/// Spawns the record call and forgets about it.
pub fn report(sink: &Arc<dyn StatsSink>, event: PlaybackEvent) {
    let sink = sink.clone();
    tokio::spawn(
        async move {
            if let Err(why) = sink.record(event).await {
                warn!("Stats event dropped: {why}");
            }
        }
        .instrument(tracing::debug_span!("stats")),
    );
}

/// Writes events to the log.
pub struct TracingStatsSink;

#[async_trait]
impl StatsSink for TracingStatsSink {
    async fn record(&self, event: PlaybackEvent) -> Result<(), String> {
        info!(?event, "Playback event");
        Ok(())
    }
}

/// Posts events as JSON to an HTTP collector.
pub struct HttpStatsSink {
    url: String,
    client: reqwest::Client,
}

impl HttpStatsSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { url: url.into(), client })
    }
}

#[async_trait]
impl StatsSink for HttpStatsSink {
    async fn record(&self, event: PlaybackEvent) -> Result<(), String> {
        let record = StatsRecord { event: &event, recorded_at: Utc::now() };

        self.client
            .post(&self.url)
            .json(&record)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
