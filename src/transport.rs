use std::sync::Arc;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::resource::AudioResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Disconnected,
    Signalling,
    Connecting,
    Ready,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The music track started under `generation` has stopped producing audio.
    TrackEnded { generation: u64 },
    /// The directly played clip started as overlay `sequence` has finished.
    ClipEnded { sequence: u64 },
    Connection(ConnectionEvent),
}

pub type EventSender = mpsc::UnboundedSender<PlayerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PlayerEvent>;

#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Replaces the music track. `generation` is echoed back in
    /// [`PlayerEvent::TrackEnded`].
    async fn play(&self, resource: AudioResource, generation: u64) -> Result<(), TransportError>;

    /// Plays a clip next to the music track, replacing any previous clip.
    async fn play_clip(&self, resource: AudioResource, sequence: u64) -> Result<(), TransportError>;

    fn pause(&self) -> Result<(), TransportError>;

    fn resume(&self) -> Result<(), TransportError>;

    /// Stops the clip, leaving the music track alone.
    fn stop_clip(&self) -> Result<(), TransportError>;

    fn stop(&self) -> Result<(), TransportError>;

    fn set_volume(&self, volume: f32) -> Result<(), TransportError>;
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Connects (or moves) to `channel_id`. Player and connection events are
    /// delivered through `events`.
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: EventSender,
    ) -> Result<Arc<dyn AudioPlayer>, TransportError>;

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), TransportError>;

    /// Whether the voice channel still exists and can be joined.
    async fn channel_exists(&self, guild_id: GuildId, channel_id: ChannelId) -> bool;
}
