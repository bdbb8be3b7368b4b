use std::collections::HashMap;
use std::sync::Arc;

use serenity::model::id::GuildId;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::playback::Playback;
use crate::queue::Queue;

/// Everything the worker knows about one voice channel.
///
/// Lock order when both are needed: `playback` first, then `queue`.
pub struct ChannelState {
    pub guild_id: GuildId,
    pub(crate) queue: Mutex<Queue>,
    pub(crate) playback: Mutex<Playback>,
}

impl ChannelState {
    fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            queue: Mutex::new(Queue::default()),
            playback: Mutex::new(Playback::default()),
        }
    }
}

/// At most one [`ChannelState`] per guild, created lazily.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<GuildId, Arc<ChannelState>>>,
}

impl ChannelRegistry {
    pub async fn get(&self, guild_id: GuildId) -> Option<Arc<ChannelState>> {
        self.channels.read().await.get(&guild_id).cloned()
    }

    pub async fn get_or_create(&self, guild_id: GuildId) -> Arc<ChannelState> {
        if let Some(channel) = self.get(guild_id).await {
            return channel;
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(guild_id)
            .or_insert_with(|| {
                info!(guild = guild_id.0, "Creating channel state");
                Arc::new(ChannelState::new(guild_id))
            })
            .clone()
    }

    pub async fn remove(&self, guild_id: GuildId) -> Option<Arc<ChannelState>> {
        self.channels.write().await.remove(&guild_id)
    }

    pub async fn all(&self) -> Vec<Arc<ChannelState>> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn guild_ids(&self) -> Vec<GuildId> {
        self.channels.read().await.keys().copied().collect()
    }
}
