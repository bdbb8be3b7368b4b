use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lofty::config::ParseOptions;
use lofty::prelude::*;
use lofty::probe::Probe;
use serde::Serialize;
use serenity::model::id::GuildId;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::playback::{Playback, PlaybackEngine, PlaybackPhase};
use crate::resource::AudioResource;
use crate::transport::AudioPlayer;

pub const CLIP_EXTENSIONS: &[&str] = &["ogg", "mp3", "wav", "opus", "flac", "m4a"];

pub const CLIP_VOLUME: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayOutcome {
    pub overlaid: bool,
    pub clip: String,
    pub duration: Option<f64>,
}

pub fn is_valid_clip_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Clip length from the file headers. Runs on the blocking pool.
pub async fn read_duration(path: &Path) -> Option<f64> {
    let path = path.to_path_buf();

    let read = tokio::task::spawn_blocking(move || {
        Probe::open(&path)
            .and_then(|file| file.options(ParseOptions::new()).read())
            .map(|tagged| tagged.properties().duration().as_secs_f64())
    })
    .await;

    match read {
        Ok(Ok(duration)) if duration > 0.0 => Some(duration),
        Ok(Ok(_)) => None,
        Ok(Err(why)) => {
            debug!("Could not read clip duration: {why}");
            None
        }
        Err(why) => {
            warn!("Reading clip duration panicked: {why}");
            None
        }
    }
}

pub struct Soundboard {
    dir: PathBuf,
}

impl Soundboard {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn find(&self, clip_id: &str) -> Result<Clip> {
        if !is_valid_clip_id(clip_id) {
            return Err(EngineError::Validation(format!("invalid clip id {clip_id:?}")));
        }

        for extension in CLIP_EXTENSIONS {
            let path = self.dir.join(format!("{clip_id}.{extension}"));
            if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                let duration = read_duration(&path).await;
                return Ok(Clip { id: clip_id.to_string(), path, duration });
            }
        }

        Err(EngineError::UnknownClip(clip_id.to_string()))
    }

    pub async fn list(&self) -> Vec<Clip> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(why) => {
                warn!(dir = %self.dir.display(), "Soundboard directory unreadable: {why}");
                return Vec::new();
            }
        };

        let mut clips = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| CLIP_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()).map(str::to_string) else {
                continue;
            };

            if supported && is_valid_clip_id(&id) {
                let duration = read_duration(&path).await;
                clips.push(Clip { id, path, duration });
            }
        }

        clips.sort_by(|a, b| a.id.cmp(&b.id));
        clips
    }
}

impl PlaybackEngine {
    pub async fn play_overlay(self: &Arc<Self>, soundboard: &Soundboard, guild_id: GuildId, clip_id: &str) -> Result<OverlayOutcome> {
        // Fail fast on a missing connection before touching the disk.
        self.connected(guild_id).await?;
        let clip = soundboard.find(clip_id).await?;
        self.overlay_file(guild_id, clip.path, clip.duration, &clip.id).await
    }

    /// Plays `path` over whatever is going on in the channel. A newer overlay
    /// replaces the previous one, whichever way either was played. The queue
    /// and the current track are never touched.
    pub async fn overlay_file(
        self: &Arc<Self>,
        guild_id: GuildId,
        path: PathBuf,
        duration: Option<f64>,
        label: &str,
    ) -> Result<OverlayOutcome> {
        let channel = self.connected(guild_id).await?;
        let mut playback = channel.playback.lock().await;
        let player = playback.player().ok_or(EngineError::NotConnected(guild_id))?;

        playback.overlay_sequence += 1;
        let sequence = playback.overlay_sequence;

        let music = match (playback.phase, &playback.stream, &playback.current) {
            (PlaybackPhase::Playing, Some(stream), Some(track)) => Some((stream.clone(), track.title.clone())),
            _ => None,
        };

        let overlaid = match music {
            Some((stream, title)) => {
                let position = playback.clock.elapsed();
                let generation = playback.claim();
                let resource = AudioResource::mix(&stream, position, path, CLIP_VOLUME, playback.volume, &title);

                player.stop_clip()?;
                player.play(resource, generation).await?;
                playback.clock.start(position);
                playback.mixing = true;
                true
            }
            None => {
                if playback.mixing && playback.phase == PlaybackPhase::Paused {
                    unmix_paused(&mut playback, player.as_ref()).await?;
                }
                player.play_clip(AudioResource::file(path, playback.volume), sequence).await?;
                false
            }
        };

        playback.overlay_active = true;
        drop(playback);

        info!(guild = guild_id.0, clip = label, overlaid, "Overlay started");

        if let Some(seconds) = duration {
            let channel = channel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                let mut playback = channel.playback.lock().await;
                if playback.overlay_sequence == sequence {
                    playback.overlay_active = false;
                }
            });
        }

        Ok(OverlayOutcome { overlaid, clip: label.to_string(), duration })
    }
}

/// Swaps a paused mix for the plain music stream at the same position, so
/// the earlier clip does not come back on resume.
async fn unmix_paused(playback: &mut Playback, player: &dyn AudioPlayer) -> Result<()> {
    let (Some(stream), Some(track)) = (playback.stream.clone(), playback.current.clone()) else {
        return Ok(());
    };

    let position = playback.clock.elapsed();
    let generation = playback.claim();
    player
        .play(AudioResource::stream(&stream, position, playback.volume, &track.title), generation)
        .await?;
    player.pause()?;

    playback.clock.start(position);
    playback.clock.pause();
    playback.mixing = false;
    debug!(position, "Paused mix replaced by the plain stream");
    Ok(())
}
