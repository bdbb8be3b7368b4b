use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::idempotency::IDEMPOTENCY_TTL;
use crate::snapshot::AUTOSAVE_INTERVAL;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Expected {0} in the environment")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub discord_token: String,
    pub worker_secret: String,
    pub listen_addr: SocketAddr,
    pub snapshot_db: PathBuf,
    pub soundboard_dir: PathBuf,
    pub speech_dir: PathBuf,
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    pub espeak_path: String,
    pub autosave_interval: Duration,
    pub idempotency_ttl: Duration,
    pub stats_url: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let listen_addr = or("WORKER_ADDR", "0.0.0.0:8081");
        let listen_addr = listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid { key: "WORKER_ADDR", value: listen_addr.clone() })?;

        let seconds = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match get(key) {
                None => Ok(Duration::from_secs(default)),
                Some(value) => match value.parse::<u64>() {
                    Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
                    _ => Err(ConfigError::Invalid { key, value }),
                },
            }
        };

        Ok(Self {
            discord_token: require("DISCORD_TOKEN")?,
            worker_secret: require("WORKER_SECRET")?,
            listen_addr,
            snapshot_db: PathBuf::from(or("SNAPSHOT_DB", "data/snapshots.db")),
            soundboard_dir: PathBuf::from(or("SOUNDBOARD_DIR", "sounds")),
            speech_dir: PathBuf::from(or("SPEECH_DIR", "data/speech")),
            ytdlp_path: or("YTDLP_PATH", "yt-dlp"),
            ffmpeg_path: or("FFMPEG_PATH", "ffmpeg"),
            espeak_path: or("ESPEAK_PATH", "espeak-ng"),
            autosave_interval: seconds("AUTOSAVE_INTERVAL_SECS", AUTOSAVE_INTERVAL.as_secs())?,
            idempotency_ttl: seconds("IDEMPOTENCY_TTL_SECS", IDEMPOTENCY_TTL.as_secs())?,
            stats_url: get("STATS_URL"),
        })
    }
}
