use serenity::model::id::GuildId;
use thiserror::Error;

/// Why a track reference could not be turned into a playable stream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("network timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("no results for {0}")]
    NotFound(String),

    #[error("resolver process failed: {0}")]
    Process(String),
}

impl From<reqwest::Error> for ResolveError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return ResolveError::Timeout;
        }
        if e.is_connect() {
            let host = e
                .url()
                .and_then(|url| url.host_str().map(str::to_string))
                .unwrap_or_else(|| "server".to_string());
            return ResolveError::Network(format!("could not connect to {host}"));
        }
        if let Some(status) = e.status() {
            return ResolveError::Unavailable(format!("HTTP {status}"));
        }
        ResolveError::Network(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to join voice channel: {0}")]
    Join(String),

    #[error("player error: {0}")]
    Player(String),

    #[error("voice connection closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to open snapshot store: {0}")]
    Open(String),

    #[error("snapshot query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt snapshot row: {0}")]
    Corrupt(String),

    #[error("snapshot store lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("invalid speech request: {0}")]
    Invalid(String),

    #[error("speech synthesis timed out")]
    Timeout,

    #[error("speech synthesis failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Queue index {index} out of range (queue length {len})")]
    OutOfRange { index: usize, len: usize },
}

/// Every failure the playback engine reports to its callers
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not connected to a voice channel in guild {0}")]
    NotConnected(GuildId),

    #[error(transparent)]
    OutOfRange(#[from] QueueError),

    #[error("Nothing is playing")]
    NothingPlaying,

    #[error("Unknown soundboard clip: {0}")]
    UnknownClip(String),

    #[error(transparent)]
    Resolution(#[from] ResolveError),

    #[error("Voice connection lost in guild {0}")]
    ConnectionLost(GuildId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Speech(#[from] SpeechError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
