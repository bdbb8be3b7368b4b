use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ResolvedStream, StreamBackend, RESOLVE_TIMEOUT};
use crate::error::ResolveError;
use crate::models::{SourceKind, Track, TrackInfo};

const DIRECT_MEDIA_EXTENSIONS: &[&str] = &["mp3", "ogg", "oga", "opus", "flac", "wav", "m4a", "aac", "webm"];

/// One line of `yt-dlp -j --flat-playlist` output
#[derive(Deserialize)]
struct PlaylistEntry {
    #[serde(rename = "ie_key")]
    ie_key: Option<String>,
    id: Option<String>,
    url: Option<String>,
    #[serde(rename = "webpage_url")]
    webpage_url: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
}

impl PlaylistEntry {
    fn into_info(self) -> Option<TrackInfo> {
        let url = match (self.webpage_url, self.url, self.ie_key.as_deref(), self.id) {
            (Some(page), _, _, _) => page,
            (None, Some(url), _, _) if url.starts_with("http") => url,
            (None, _, Some("Youtube"), Some(id)) => format!("https://www.youtube.com/watch?v={id}"),
            _ => return None,
        };

        Some(TrackInfo {
            title: self.title.unwrap_or_else(|| url.clone()),
            url,
            duration: self.duration,
        })
    }
}

/// Parses `-j --flat-playlist` output, one JSON document per line.
pub fn parse_lookup_output(output: &str) -> Vec<TrackInfo> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();

    let tracks: Vec<TrackInfo> = lines
        .iter()
        .filter_map(|line| {
            let entry: PlaylistEntry = serde_json::from_str(line).ok()?;
            entry.into_info()
        })
        .collect();

    if tracks.len() < lines.len() {
        warn!(
            skipped = lines.len() - tracks.len(),
            "Some playlist entries have been skipped due to errors during parsing"
        );
    }

    tracks
}

/// Parses `-O url -O duration` output: endpoint first, then duration or `NA`.
pub fn parse_resolve_output(output: &str) -> Result<(String, Option<f64>), ResolveError> {
    let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());

    let endpoint = lines
        .next()
        .filter(|line| line.starts_with("http"))
        .ok_or_else(|| ResolveError::Process("yt-dlp returned no stream url".to_string()))?;

    let duration = lines.next().and_then(|line| line.parse::<f64>().ok());

    Ok((endpoint.to_string(), duration))
}

fn classify_failure(stderr: &str) -> ResolveError {
    let lower = stderr.to_lowercase();

    let unavailable = [
        "video unavailable",
        "private video",
        "not available",
        "has been removed",
        "sign in to confirm",
        "http error 404",
        "http error 403",
    ];

    if unavailable.iter().any(|needle| lower.contains(needle)) {
        let reason = stderr
            .lines()
            .find(|line| line.contains("ERROR"))
            .unwrap_or(stderr)
            .trim()
            .to_string();
        return ResolveError::Unavailable(reason);
    }

    if lower.contains("timed out") || lower.contains("timeout") {
        return ResolveError::Timeout;
    }

    if lower.contains("unable to download") || lower.contains("connection") {
        return ResolveError::Network(stderr.trim().to_string());
    }

    ResolveError::Process(stderr.trim().to_string())
}

fn is_direct_media(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    path.rsplit('.')
        .next()
        .map(|ext| DIRECT_MEDIA_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

fn is_url(query: &str) -> bool {
    query.starts_with("http://") || query.starts_with("https://")
}

/// Resolution through the `yt-dlp` program, with plain HTTP for direct media links.
pub struct YtDlpBackend {
    program: String,
    http: reqwest::Client,
}

impl YtDlpBackend {
    pub fn new(program: impl Into<String>) -> Result<Self, ResolveError> {
        let http = reqwest::Client::builder()
            .timeout(RESOLVE_TIMEOUT)
            .connect_timeout(RESOLVE_TIMEOUT)
            .build()?;

        Ok(Self { program: program.into(), http })
    }

    async fn run(&self, args: &[&str]) -> Result<String, ResolveError> {
        debug!(program = self.program.as_str(), ?args, "Running resolver");

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(
            RESOLVE_TIMEOUT,
            Command::new(&self.program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ResolveError::Timeout)?
        .map_err(|e| ResolveError::Process(format!("{} failed to start: {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }

        Ok(stdout)
    }

    async fn head_direct(&self, url: &str) -> Result<ResolvedStream, ResolveError> {
        self.http.head(url).send().await?.error_for_status()?;

        Ok(ResolvedStream {
            endpoint: url.to_string(),
            duration: None,
            source: SourceKind::Other,
        })
    }
}

#[async_trait]
impl StreamBackend for YtDlpBackend {
    async fn resolve(&self, track: &Track, seek: f64) -> Result<ResolvedStream, ResolveError> {
        if track.source == SourceKind::Other && is_direct_media(&track.url) {
            return self.head_direct(&track.url).await;
        }

        debug!(url = track.url.as_str(), seek, "Resolving stream");

        let stdout = self
            .run(&[
                "--no-playlist",
                "--no-warnings",
                "-f",
                "bestaudio/best",
                "-O",
                "%(url)s",
                "-O",
                "%(duration)s",
                &track.url,
            ])
            .await?;

        let (endpoint, duration) = parse_resolve_output(&stdout)?;

        Ok(ResolvedStream {
            endpoint,
            duration,
            source: track.source,
        })
    }

    async fn lookup(&self, query: &str) -> Result<Vec<TrackInfo>, ResolveError> {
        if is_url(query) && is_direct_media(query) {
            let title = query
                .split(['?', '#'])
                .next()
                .and_then(|path| path.rsplit('/').next())
                .unwrap_or(query)
                .to_string();
            return Ok(vec![TrackInfo { title, url: query.to_string(), duration: None }]);
        }

        let target = if is_url(query) {
            query.to_string()
        } else {
            format!("ytsearch1:{query}")
        };

        info!(target = target.as_str(), "Looking up tracks");

        let stdout = self.run(&["-j", "--flat-playlist", "--no-warnings", &target]).await?;
        Ok(parse_lookup_output(&stdout))
    }

    async fn related(&self, track: &Track) -> Result<Option<TrackInfo>, ResolveError> {
        let target = format!("ytsearch5:{}", track.title);
        let stdout = self.run(&["-j", "--flat-playlist", "--no-warnings", &target]).await?;

        Ok(parse_lookup_output(&stdout)
            .into_iter()
            .find(|candidate| candidate.url != track.url && candidate.title != track.title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_playlist_lines() {
        let output = concat!(
            r#"{"_type": "url", "ie_key": "Youtube", "id": "aaa", "url": "https://www.youtube.com/watch?v=aaa", "title": "First", "duration": 215.0}"#,
            "\n",
            r#"{"_type": "url", "ie_key": "Youtube", "id": "bbb", "url": "bbb", "title": "Second", "duration": null}"#,
            "\n",
            "not json at all\n",
        );

        let tracks = parse_lookup_output(output);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].title, "First");
        assert_eq!(tracks[0].duration, Some(215.0));
        assert_eq!(tracks[1].url, "https://www.youtube.com/watch?v=bbb");
        assert_eq!(tracks[1].duration, None);
    }

    #[test]
    fn single_video_prefers_webpage_url() {
        let output = r#"{"id": "x", "url": "https://rr1.googlevideo.com/videoplayback?x", "webpage_url": "https://www.youtube.com/watch?v=x", "title": "Solo", "duration": 61}"#;
        let tracks = parse_lookup_output(output);
        assert_eq!(tracks[0].url, "https://www.youtube.com/watch?v=x");
    }

    #[test]
    fn parses_stream_url_and_duration() {
        let (endpoint, duration) =
            parse_resolve_output("https://rr1.googlevideo.com/videoplayback?a=b\n213\n").unwrap();
        assert_eq!(endpoint, "https://rr1.googlevideo.com/videoplayback?a=b");
        assert_eq!(duration, Some(213.0));

        let (_, duration) = parse_resolve_output("https://host/stream\nNA\n").unwrap();
        assert_eq!(duration, None);

        assert!(parse_resolve_output("").is_err());
    }

    #[test]
    fn classifies_common_failures() {
        assert!(matches!(
            classify_failure("ERROR: [youtube] abc: Video unavailable"),
            ResolveError::Unavailable(_)
        ));
        assert_eq!(classify_failure("ERROR: Read timed out."), ResolveError::Timeout);
        assert!(matches!(classify_failure("something odd"), ResolveError::Process(_)));
    }

    #[test]
    fn detects_direct_media() {
        assert!(is_direct_media("https://cdn.example.com/a/b/song.MP3?sig=1"));
        assert!(!is_direct_media("https://www.youtube.com/watch?v=x"));
    }
}
