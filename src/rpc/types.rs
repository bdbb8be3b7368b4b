use serde::Deserialize;
use serenity::model::id::{ChannelId, GuildId};

use crate::error::EngineError;

pub const MAX_REQUEST_ID_LEN: usize = 128;

fn snowflake(field: &str, raw: &str) -> Result<u64, EngineError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| EngineError::Validation(format!("{field} must be a snowflake, got {raw:?}")))
}

pub fn parse_guild(raw: &str) -> Result<GuildId, EngineError> {
    snowflake("guildId", raw).map(GuildId)
}

pub fn parse_channel(raw: &str) -> Result<ChannelId, EngineError> {
    snowflake("channelId", raw).map(ChannelId)
}

pub fn check_request_id(id: &str) -> Result<(), EngineError> {
    if id.trim().is_empty() || id.len() > MAX_REQUEST_ID_LEN {
        return Err(EngineError::Validation(format!(
            "requestId must be 1 to {MAX_REQUEST_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// Every mutating call carries a request id and targets one guild.
pub trait Mutation {
    fn request_id(&self) -> &str;
    fn guild(&self) -> &str;
}

macro_rules! mutation {
    ($($name:ident),* $(,)?) => {
        $(impl Mutation for $name {
            fn request_id(&self) -> &str {
                &self.request_id
            }

            fn guild(&self) -> &str {
                &self.guild_id
            }
        })*
    };
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildRequest {
    pub request_id: String,
    pub guild_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub request_id: String,
    pub guild_id: String,
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    pub request_id: String,
    pub guild_id: String,
    pub volume: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub request_id: String,
    pub guild_id: String,
    pub url: String,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// Either a new `url` to put at the head, or the `index` of a queued track
/// to move there.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayNextRequest {
    pub request_id: String,
    pub guild_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipRequest {
    pub request_id: String,
    pub guild_id: String,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoplayRequest {
    pub request_id: String,
    pub guild_id: String,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakRequest {
    pub request_id: String,
    pub guild_id: String,
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveRequest {
    pub request_id: String,
    pub guild_id: String,
    /// Zero-based position in the upcoming queue.
    pub index: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoundboardRequest {
    pub request_id: String,
    pub guild_id: String,
    pub clip_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateQuery {
    #[serde(default)]
    pub guild_id: Option<String>,
}

mutation!(
    GuildRequest,
    JoinRequest,
    VolumeRequest,
    EnqueueRequest,
    PlayNextRequest,
    SkipRequest,
    AutoplayRequest,
    SpeakRequest,
    RemoveRequest,
    SoundboardRequest,
);
