use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a track comes from. Closed set, used to pick a resolution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    YouTube,
    SoundCloud,
    Other,
}

impl SourceKind {
    pub fn classify(reference: &str) -> SourceKind {
        let lower = reference.trim().to_lowercase();

        if lower.starts_with("file://") || lower.starts_with('/') || lower.starts_with("./") {
            return SourceKind::Local;
        }

        let host = lower
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split(['/', '?', '#']).next())
            .map(|host| host.trim_start_matches("www.").trim_start_matches("m."))
            .unwrap_or("");

        match host {
            "youtube.com" | "youtu.be" | "music.youtube.com" => SourceKind::YouTube,
            "soundcloud.com" | "on.soundcloud.com" => SourceKind::SoundCloud,
            _ => SourceKind::Other,
        }
    }
}

/// Metadata returned by a lookup, before anybody asked for it to be played
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub title: String,
    pub url: String,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub title: String,
    pub url: String,
    pub duration: Option<f64>,
    pub source: SourceKind,
    pub requested_by: String,
    pub enqueued_at: DateTime<Utc>,
}

impl Track {
    pub fn new(info: TrackInfo, requested_by: impl Into<String>) -> Self {
        Self {
            source: SourceKind::classify(&info.url),
            title: info.title,
            url: info.url,
            duration: info.duration,
            requested_by: requested_by.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// Duration is the only field filled in after enqueue.
    pub fn with_duration(mut self, duration: Option<f64>) -> Self {
        if self.duration.is_none() {
            self.duration = duration;
        }
        self
    }
}
