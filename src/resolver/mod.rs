mod cache;
mod ytdlp;

pub use cache::{StreamCache, STREAM_CACHE_CAPACITY, STREAM_CACHE_TTL};
pub use ytdlp::{parse_lookup_output, parse_resolve_output, YtDlpBackend};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ResolveError;
use crate::models::{SourceKind, Track, TrackInfo};

/// Upper bound for one resolution, including the external process.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Playlist expansion can take longer than a single resolution.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStream {
    pub endpoint: String,
    pub duration: Option<f64>,
    pub source: SourceKind,
}

/// Whatever actually talks to the outside world.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    async fn resolve(&self, track: &Track, seek: f64) -> Result<ResolvedStream, ResolveError>;

    /// Expands a URL (track or playlist) or a search term into tracks.
    async fn lookup(&self, query: &str) -> Result<Vec<TrackInfo>, ResolveError>;

    /// Something to play after `track` when autoplay is on.
    async fn related(&self, track: &Track) -> Result<Option<TrackInfo>, ResolveError> {
        let _ = track;
        Ok(None)
    }
}

pub struct StreamResolver {
    backend: Arc<dyn StreamBackend>,
    cache: StreamCache,
}

impl StreamResolver {
    pub fn new(backend: Arc<dyn StreamBackend>) -> Self {
        Self::with_cache(backend, StreamCache::default())
    }

    pub fn with_cache(backend: Arc<dyn StreamBackend>, cache: StreamCache) -> Self {
        Self { backend, cache }
    }

    pub fn cache(&self) -> &StreamCache {
        &self.cache
    }

    pub async fn resolve(&self, track: &Track, seek: f64) -> Result<ResolvedStream, ResolveError> {
        if track.source == SourceKind::Local {
            return resolve_local(&track.url).await;
        }

        let full_track = seek <= 0.0;

        if full_track {
            if let Some(hit) = self.cache.get(&track.url) {
                debug!(url = track.url.as_str(), "Stream cache hit");
                return Ok(hit);
            }
        }

        let resolved = tokio::time::timeout(RESOLVE_TIMEOUT, self.backend.resolve(track, seek))
            .await
            .map_err(|_| ResolveError::Timeout)??;

        if full_track {
            self.cache.insert(&track.url, resolved.clone());
        }

        Ok(resolved)
    }

    pub async fn lookup(&self, query: &str, requested_by: &str) -> Result<Vec<Track>, ResolveError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResolveError::NotFound("empty query".to_string()));
        }

        if SourceKind::classify(query) == SourceKind::Local {
            let path = local_path(query);
            let title = Path::new(path)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            let info = TrackInfo { title, url: query.to_string(), duration: None };
            return Ok(vec![Track::new(info, requested_by)]);
        }

        let infos = tokio::time::timeout(LOOKUP_TIMEOUT, self.backend.lookup(query))
            .await
            .map_err(|_| ResolveError::Timeout)??;

        if infos.is_empty() {
            return Err(ResolveError::NotFound(query.to_string()));
        }

        info!(query, count = infos.len(), "Lookup resolved");

        Ok(infos.into_iter().map(|info| Track::new(info, requested_by)).collect())
    }

    pub async fn related(&self, track: &Track) -> Result<Option<Track>, ResolveError> {
        let related = tokio::time::timeout(LOOKUP_TIMEOUT, self.backend.related(track))
            .await
            .map_err(|_| ResolveError::Timeout)??;

        Ok(related.map(|info| Track::new(info, "autoplay")))
    }
}

fn local_path(reference: &str) -> &str {
    reference.strip_prefix("file://").unwrap_or(reference)
}

async fn resolve_local(reference: &str) -> Result<ResolvedStream, ResolveError> {
    let path = local_path(reference);

    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(ResolvedStream {
            endpoint: path.to_string(),
            duration: None,
            source: SourceKind::Local,
        }),
        _ => Err(ResolveError::Unavailable(format!("file not found: {path}"))),
    }
}
