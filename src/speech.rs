use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serenity::model::id::GuildId;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SpeechError};
use crate::overlay::{read_duration, OverlayOutcome};
use crate::playback::PlaybackEngine;

pub const SPEECH_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_TEXT_LEN: usize = 500;
pub const DEFAULT_VOICE: &str = "en";
const BASE_WPM: f32 = 175.0;
/// How long a rendered file is kept after its playback should have ended.
const CLEANUP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
    pub speed: f32,
}

impl SpeechRequest {
    pub fn new(text: &str, voice: Option<&str>, speed: Option<f32>) -> std::result::Result<Self, SpeechError> {
        let text = text.trim();
        let length = text.chars().count();
        if length == 0 || length > MAX_TEXT_LEN {
            return Err(SpeechError::Invalid(format!("text must be 1 to {MAX_TEXT_LEN} characters")));
        }

        let speed = speed.unwrap_or(1.0);
        if !speed.is_finite() || !(0.5..=2.0).contains(&speed) {
            return Err(SpeechError::Invalid(format!("speed must be within [0.5, 2.0], got {speed}")));
        }

        let voice = voice.map(str::trim).filter(|v| !v.is_empty()).unwrap_or(DEFAULT_VOICE);
        if !voice.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+') {
            return Err(SpeechError::Invalid(format!("unsupported voice {voice:?}")));
        }

        Ok(Self { text: text.to_string(), voice: voice.to_string(), speed })
    }

    pub fn words_per_minute(&self) -> u32 {
        (BASE_WPM * self.speed).round() as u32
    }
}

#[async_trait]
pub trait SpeechSynth: Send + Sync {
    /// Renders the request to an audio file and returns its path.
    async fn synthesize(&self, request: &SpeechRequest) -> std::result::Result<PathBuf, SpeechError>;
}

pub struct EspeakSynth {
    program: String,
    out_dir: PathBuf,
}

impl EspeakSynth {
    pub fn new(program: impl Into<String>, out_dir: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), out_dir: out_dir.into() }
    }
}

#[async_trait]
impl SpeechSynth for EspeakSynth {
    async fn synthesize(&self, request: &SpeechRequest) -> std::result::Result<PathBuf, SpeechError> {
        tokio::fs::create_dir_all(&self.out_dir)
            .await
            .map_err(|e| SpeechError::Failed(e.to_string()))?;

        let path = self.out_dir.join(format!("{}.wav", Uuid::new_v4()));
        let wpm = request.words_per_minute().to_string();

        debug!(voice = request.voice.as_str(), wpm = wpm.as_str(), "Synthesizing speech");

        let output = tokio::time::timeout(
            SPEECH_TIMEOUT,
            Command::new(&self.program)
                .arg("-v")
                .arg(&request.voice)
                .arg("-s")
                .arg(&wpm)
                .arg("-w")
                .arg(&path)
                .arg("--")
                .arg(&request.text)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SpeechError::Timeout)?
        .map_err(|e| SpeechError::Failed(format!("{} failed to start: {e}", self.program)))?;

        if !output.status.success() {
            remove_quietly(&path).await;
            return Err(SpeechError::Failed(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        Ok(path)
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(why) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), "Could not remove speech file: {why}");
    }
}

/// Speaks `request` in the guild's channel: mixed over music when something
/// plays, directly otherwise.
pub async fn speak(
    engine: &Arc<PlaybackEngine>,
    synth: &dyn SpeechSynth,
    guild_id: GuildId,
    request: SpeechRequest,
) -> Result<OverlayOutcome> {
    engine.connected(guild_id).await?;

    let path = synth.synthesize(&request).await?;
    let duration = read_duration(&path).await;

    let outcome = engine.overlay_file(guild_id, path.clone(), duration, "speech").await;

    let keep = duration.map(Duration::from_secs_f64).unwrap_or(SPEECH_TIMEOUT) + CLEANUP_GRACE;
    tokio::spawn(async move {
        tokio::time::sleep(keep).await;
        remove_quietly(&path).await;
    });

    if outcome.is_ok() {
        info!(guild = guild_id.0, chars = request.text.chars().count(), "Speech queued");
    }

    outcome
}
