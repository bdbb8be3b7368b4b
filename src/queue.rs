use std::collections::VecDeque;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;
use serenity::model::id::GuildId;
use tracing::debug;

use crate::error::{self, EngineError, QueueError};
use crate::models::Track;
use crate::registry::ChannelRegistry;

/// Upcoming tracks of one channel, FIFO. The current track is not part of it.
#[derive(Debug, Default)]
pub struct Queue {
    tracks: VecDeque<Track>,
}

impl Queue {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn enqueue(&mut self, tracks: impl IntoIterator<Item = Track>) -> usize {
        self.tracks.extend(tracks);
        self.tracks.len()
    }

    pub fn dequeue_next(&mut self) -> Option<Track> {
        self.tracks.pop_front()
    }

    pub fn remove_at(&mut self, index: usize) -> Result<Track, QueueError> {
        let len = self.tracks.len();
        self.tracks
            .remove(index)
            .ok_or(QueueError::OutOfRange { index, len })
    }

    pub fn clear(&mut self) -> usize {
        let count = self.tracks.len();
        self.tracks.clear();
        count
    }

    /// Skips `count` tracks, the playing one being the first of them.
    ///
    /// Discards up to `count - 1` queued tracks, then pops the next one.
    /// Returns how many queued tracks were discarded and the track to play.
    pub fn skip(&mut self, count: usize) -> (usize, Option<Track>) {
        let discard = count.saturating_sub(1).min(self.tracks.len());
        self.tracks.drain(..discard);
        (discard, self.tracks.pop_front())
    }

    pub fn peek(&self) -> Option<&Track> {
        self.tracks.front()
    }

    pub fn shuffle(&mut self) {
        self.tracks.make_contiguous().shuffle(&mut thread_rng());
    }

    /// Moves the track at `index` to the head of the queue and returns it.
    pub fn move_to_front(&mut self, index: usize) -> Result<&Track, QueueError> {
        let track = self.remove_at(index)?;
        self.tracks.push_front(track);
        Ok(&self.tracks[0])
    }

    pub fn push_front(&mut self, track: Track) -> usize {
        self.tracks.push_front(track);
        self.tracks.len()
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.tracks.iter().cloned().collect()
    }

    pub fn replace(&mut self, tracks: Vec<Track>) {
        self.tracks = VecDeque::from(tracks);
    }
}

/// Serialized access to every channel's queue. Different guilds use
/// different locks and proceed in parallel.
#[derive(Clone)]
pub struct QueueManager {
    registry: Arc<ChannelRegistry>,
}

impl QueueManager {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    /// Runs `f` with exclusive access to the guild's queue. Never creates
    /// channel state.
    pub async fn with_lock<R>(&self, guild_id: GuildId, f: impl FnOnce(&mut Queue) -> R) -> error::Result<R> {
        let channel = self
            .registry
            .get(guild_id)
            .await
            .ok_or(EngineError::NotConnected(guild_id))?;

        let mut queue = channel.queue.lock().await;
        Ok(f(&mut queue))
    }

    pub async fn enqueue(&self, guild_id: GuildId, tracks: Vec<Track>) -> error::Result<usize> {
        let added = tracks.len();
        let len = self.with_lock(guild_id, |queue| queue.enqueue(tracks)).await?;
        debug!(guild = guild_id.0, added, len, "Tracks enqueued");
        Ok(len)
    }

    /// Puts `tracks` at the head, keeping their order.
    pub async fn enqueue_front(&self, guild_id: GuildId, tracks: Vec<Track>) -> error::Result<usize> {
        self.with_lock(guild_id, |queue| {
            for track in tracks.into_iter().rev() {
                queue.push_front(track);
            }
            queue.len()
        })
        .await
    }

    pub async fn dequeue_next(&self, guild_id: GuildId) -> error::Result<Option<Track>> {
        self.with_lock(guild_id, Queue::dequeue_next).await
    }

    pub async fn remove_at(&self, guild_id: GuildId, index: usize) -> error::Result<Track> {
        Ok(self.with_lock(guild_id, |queue| queue.remove_at(index)).await??)
    }

    pub async fn move_to_front(&self, guild_id: GuildId, index: usize) -> error::Result<Track> {
        Ok(self.with_lock(guild_id, |queue| queue.move_to_front(index).cloned()).await??)
    }

    pub async fn clear(&self, guild_id: GuildId) -> error::Result<usize> {
        self.with_lock(guild_id, Queue::clear).await
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> error::Result<usize> {
        self.with_lock(guild_id, |queue| {
            queue.shuffle();
            queue.len()
        })
        .await
    }

    pub async fn len(&self, guild_id: GuildId) -> error::Result<usize> {
        self.with_lock(guild_id, |queue| queue.len()).await
    }

    pub async fn tracks(&self, guild_id: GuildId) -> error::Result<Vec<Track>> {
        self.with_lock(guild_id, |queue| queue.tracks()).await
    }
}
