//! Playback state machine
//!
//! `Idle → Starting → Playing ⇄ Paused → Ending → {Starting, Idle}`.
//!
//! Every transition that starts a track takes a new per-channel generation.
//! Track-finished events, pending resolutions and pre-buffer results tagged
//! with an older generation are ignored, which is how a skip issued while a
//! resolution is in flight wins over that resolution.

mod clock;
mod reconnect;

pub use clock::PositionClock;
pub use reconnect::{LinkState, ReconnectMachine, RECONNECT_WINDOW};

use std::sync::{Arc, Weak};

use chrono::Utc;
use serde::Serialize;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_futures::Instrument;

use crate::error::{EngineError, Result};
use crate::models::Track;
use crate::queue::QueueManager;
use crate::registry::{ChannelRegistry, ChannelState};
use crate::resolver::{ResolvedStream, StreamResolver};
use crate::resource::AudioResource;
use crate::snapshot::QueueSnapshot;
use crate::stats::{self, is_completed, PlaybackEvent, StatsSink};
use crate::transport::{AudioPlayer, ConnectionEvent, EventReceiver, EventSender, PlayerEvent, VoiceTransport};

pub const DEFAULT_VOLUME: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackPhase {
    #[default]
    Idle,
    Starting,
    Playing,
    Paused,
    Ending,
}

pub(crate) struct Connection {
    pub(crate) channel_id: ChannelId,
    pub(crate) player: Arc<dyn AudioPlayer>,
    events: EventSender,
    watcher: JoinHandle<()>,
}

pub struct Playback {
    pub(crate) phase: PlaybackPhase,
    pub(crate) connection: Option<Connection>,
    pub(crate) current: Option<Track>,
    pub(crate) stream: Option<ResolvedStream>,
    pub(crate) clock: PositionClock,
    pub(crate) volume: f32,
    pub(crate) overlay_active: bool,
    pub(crate) overlay_sequence: u64,
    /// The music track currently playing is a mix with a clip baked in.
    pub(crate) mixing: bool,
    pub(crate) autoplay: bool,
    pub(crate) generation: u64,
    prebuffer: Option<(String, ResolvedStream)>,
    last_played: Option<Track>,
    last_error: Option<String>,
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            phase: PlaybackPhase::Idle,
            connection: None,
            current: None,
            stream: None,
            clock: PositionClock::default(),
            volume: DEFAULT_VOLUME,
            overlay_active: false,
            overlay_sequence: 0,
            mixing: false,
            autoplay: false,
            generation: 0,
            prebuffer: None,
            last_played: None,
            last_error: None,
        }
    }
}

impl Playback {
    /// Starts a new transition and returns its generation.
    pub(crate) fn claim(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub(crate) fn player(&self) -> Option<Arc<dyn AudioPlayer>> {
        self.connection.as_ref().map(|connection| connection.player.clone())
    }

    fn settle_idle(&mut self) {
        self.phase = PlaybackPhase::Idle;
        self.current = None;
        self.stream = None;
        self.clock.reset();
        self.prebuffer = None;
        self.overlay_active = false;
        self.mixing = false;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub phase: PlaybackPhase,
    pub current: Option<Track>,
    pub position_secs: f64,
    pub volume: f32,
    pub paused: bool,
    pub overlay_active: bool,
    pub autoplay: bool,
    pub queue_length: usize,
    /// The next queued track has already been resolved.
    pub next_ready: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueView {
    pub current: Option<Track>,
    pub position_secs: f64,
    pub queue: Vec<Track>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOutcome {
    pub channel_id: String,
    pub already_connected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    pub added: usize,
    pub titles: Vec<String>,
    pub queue_length: usize,
    pub started: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipOutcome {
    pub skipped: usize,
    pub now_playing: Option<Track>,
}

pub struct PlaybackEngine {
    registry: Arc<ChannelRegistry>,
    queues: QueueManager,
    resolver: Arc<StreamResolver>,
    transport: Arc<dyn VoiceTransport>,
    stats: Arc<dyn StatsSink>,
}

impl PlaybackEngine {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        resolver: Arc<StreamResolver>,
        transport: Arc<dyn VoiceTransport>,
        stats: Arc<dyn StatsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues: QueueManager::new(registry.clone()),
            registry,
            resolver,
            transport,
            stats,
        })
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn resolver(&self) -> &Arc<StreamResolver> {
        &self.resolver
    }

    pub(crate) fn stats(&self) -> &Arc<dyn StatsSink> {
        &self.stats
    }

    pub async fn channel_exists(&self, guild_id: GuildId, channel_id: ChannelId) -> bool {
        self.transport.channel_exists(guild_id, channel_id).await
    }

    /// The channel state, provided a voice connection is up.
    pub(crate) async fn connected(&self, guild_id: GuildId) -> Result<Arc<ChannelState>> {
        let channel = self
            .registry
            .get(guild_id)
            .await
            .ok_or(EngineError::NotConnected(guild_id))?;

        if channel.playback.lock().await.connection.is_none() {
            return Err(EngineError::NotConnected(guild_id));
        }

        Ok(channel)
    }

    pub async fn join(self: &Arc<Self>, guild_id: GuildId, channel_id: ChannelId) -> Result<JoinOutcome> {
        let channel = self.registry.get_or_create(guild_id).await;
        let mut playback = channel.playback.lock().await;

        if let Some(connection) = &playback.connection {
            if connection.channel_id == channel_id {
                debug!(guild = guild_id.0, channel = channel_id.0, "Already connected");
                return Ok(JoinOutcome { channel_id: channel_id.0.to_string(), already_connected: true });
            }
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let player = match self.transport.connect(guild_id, channel_id, events.clone()).await {
            Ok(player) => player,
            Err(why) => {
                if playback.connection.is_none() {
                    playback.settle_idle();
                    drop(playback);
                    self.registry.remove(guild_id).await;
                }
                warn!(guild = guild_id.0, channel = channel_id.0, "Join failed: {why}");
                return Err(why.into());
            }
        };

        if let Err(why) = player.set_volume(playback.volume) {
            warn!(guild = guild_id.0, "Applying volume on join failed: {why}");
        }

        let watcher = self.spawn_event_loop(guild_id, receiver);
        let previous = playback.connection.replace(Connection { channel_id, player, events, watcher });

        info!(guild = guild_id.0, channel = channel_id.0, "Joined voice channel");

        // Moving channels: carry the current track over at its position.
        let resume = match previous {
            Some(previous) => {
                previous.watcher.abort();
                if let Err(why) = previous.player.stop() {
                    debug!("Stopping previous player failed: {why}");
                }
                match (&playback.current, playback.phase) {
                    (Some(track), PlaybackPhase::Playing | PlaybackPhase::Paused | PlaybackPhase::Starting) => {
                        Some((track.clone(), playback.clock.elapsed()))
                    }
                    _ => None,
                }
            }
            None => None,
        };

        let claimed = resume.as_ref().map(|_| {
            playback.phase = PlaybackPhase::Starting;
            playback.claim()
        });
        drop(playback);

        if let (Some(resume), Some(claimed)) = (resume, claimed) {
            self.transition(channel, Some(resume), claimed).await;
        }

        Ok(JoinOutcome { channel_id: channel_id.0.to_string(), already_connected: false })
    }

    pub async fn leave(&self, guild_id: GuildId) -> Result<()> {
        let channel = self
            .registry
            .get(guild_id)
            .await
            .ok_or(EngineError::NotConnected(guild_id))?;

        if self.teardown(&channel).await {
            Ok(())
        } else {
            Err(EngineError::NotConnected(guild_id))
        }
    }

    /// Releases the connection and forgets the channel. Returns whether a
    /// connection was open.
    async fn teardown(&self, channel: &Arc<ChannelState>) -> bool {
        let guild_id = channel.guild_id;
        self.registry.remove(guild_id).await;

        let connection = {
            let mut playback = channel.playback.lock().await;
            playback.claim();
            playback.settle_idle();
            let mut queue = channel.queue.lock().await;
            queue.clear();
            playback.connection.take()
        };

        let Some(connection) = connection else {
            return false;
        };

        if let Err(why) = connection.player.stop() {
            debug!("Stopping player failed: {why}");
        }
        connection.watcher.abort();

        if let Err(why) = self.transport.disconnect(guild_id).await {
            warn!(guild = guild_id.0, "Disconnect failed: {why}");
        }

        info!(guild = guild_id.0, "Left voice channel");
        true
    }

    async fn connection_lost(&self, guild_id: GuildId) {
        warn!(guild = guild_id.0, "{}", EngineError::ConnectionLost(guild_id));

        if let Some(channel) = self.registry.get(guild_id).await {
            self.teardown(&channel).await;
        }
    }

    /// Forwards a gateway-level connection change to the channel's event loop.
    pub async fn connection_event(&self, guild_id: GuildId, event: ConnectionEvent) {
        let Some(channel) = self.registry.get(guild_id).await else {
            return;
        };

        let playback = channel.playback.lock().await;
        if let Some(connection) = &playback.connection {
            let _ = connection.events.send(PlayerEvent::Connection(event));
        }
    }

    pub async fn enqueue(self: &Arc<Self>, guild_id: GuildId, tracks: Vec<Track>) -> Result<EnqueueOutcome> {
        self.add_tracks(guild_id, tracks, false).await
    }

    pub async fn play_next(self: &Arc<Self>, guild_id: GuildId, tracks: Vec<Track>) -> Result<EnqueueOutcome> {
        self.add_tracks(guild_id, tracks, true).await
    }

    async fn add_tracks(self: &Arc<Self>, guild_id: GuildId, tracks: Vec<Track>, front: bool) -> Result<EnqueueOutcome> {
        let channel = self.connected(guild_id).await?;
        let added = tracks.len();
        let titles = tracks.iter().map(|track| track.title.clone()).collect();

        if front {
            self.queues.enqueue_front(guild_id, tracks).await?;
        } else {
            self.queues.enqueue(guild_id, tracks).await?;
        }

        let started = self.kick(&channel).await;
        let queue_length = channel.queue.lock().await.len();

        Ok(EnqueueOutcome { added, titles, queue_length, started })
    }

    async fn kick(self: &Arc<Self>, channel: &Arc<ChannelState>) -> bool {
        let claimed = {
            let mut playback = channel.playback.lock().await;
            if playback.phase != PlaybackPhase::Idle || playback.connection.is_none() {
                return false;
            }
            playback.phase = PlaybackPhase::Starting;
            playback.claim()
        };

        self.transition(channel.clone(), None, claimed).await;
        true
    }

    /// Runs [`Self::advance`] on its own task and waits for it. Dropping the
    /// returned future leaves the transition running.
    async fn transition(self: &Arc<Self>, channel: Arc<ChannelState>, next: Option<(Track, f64)>, claimed: u64) {
        let engine = self.clone();
        let guild = channel.guild_id.0;
        let task = tokio::spawn(
            async move { engine.advance(channel, next, claimed).await }
                .instrument(tracing::debug_span!("transition", guild)),
        );

        if let Err(why) = task.await {
            warn!(guild, "Playback transition task failed: {why}");
        }
    }

    /// Plays `next` (or the head of the queue) and keeps going on failures,
    /// giving up after one pass over the queue.
    pub(crate) async fn advance(self: &Arc<Self>, channel: Arc<ChannelState>, mut next: Option<(Track, f64)>, claimed: u64) {
        let guild_id = channel.guild_id;
        let max_failures = channel.queue.lock().await.len() + 1;
        let mut claimed = claimed;
        let mut failures = 0;
        let mut autoplay_tried = false;

        loop {
            let (track, seek, generation, prebuffered) = {
                let mut playback = channel.playback.lock().await;

                if playback.generation != claimed {
                    debug!(guild = guild_id.0, "Transition superseded");
                    return;
                }

                if playback.connection.is_none() {
                    playback.settle_idle();
                    return;
                }

                let picked = match next.take() {
                    Some(picked) => Some(picked),
                    None => channel.queue.lock().await.dequeue_next().map(|track| (track, 0.0)),
                };

                let Some((track, seek)) = picked else {
                    let seed = playback.last_played.clone().filter(|_| playback.autoplay && !autoplay_tried);
                    match seed {
                        Some(seed) => {
                            drop(playback);
                            autoplay_tried = true;
                            next = self.autoplay_candidate(guild_id, &seed).await.map(|track| (track, 0.0));
                            continue;
                        }
                        None => {
                            info!(guild = guild_id.0, "Queue is empty, going idle");
                            playback.settle_idle();
                            return;
                        }
                    }
                };

                let prebuffered = playback
                    .prebuffer
                    .take()
                    .filter(|(url, _)| seek <= 0.0 && *url == track.url)
                    .map(|(_, stream)| stream);

                playback.phase = PlaybackPhase::Starting;
                playback.current = Some(track.clone());
                playback.stream = None;
                playback.clock.reset();
                claimed = playback.claim();

                (track, seek, claimed, prebuffered)
            };

            let resolved = match prebuffered {
                Some(stream) => {
                    debug!(guild = guild_id.0, url = track.url.as_str(), "Using pre-buffered stream");
                    Ok(stream)
                }
                None => self.resolver.resolve(&track, seek).await,
            };

            let mut playback = channel.playback.lock().await;

            if playback.generation != generation {
                debug!(guild = guild_id.0, url = track.url.as_str(), "Resolution finished for a superseded transition");
                return;
            }

            let Some(player) = playback.player() else {
                playback.settle_idle();
                return;
            };

            let started = match resolved {
                Ok(stream) => {
                    let resource = AudioResource::stream(&stream, seek, playback.volume, &track.title);
                    match player.play(resource, generation).await {
                        Ok(()) => Ok(stream),
                        Err(why) => Err(why.to_string()),
                    }
                }
                Err(why) => Err(why.to_string()),
            };

            match started {
                Ok(stream) => {
                    let track = track.with_duration(stream.duration);
                    playback.current = Some(track.clone());
                    playback.last_played = Some(track.clone());
                    playback.phase = PlaybackPhase::Playing;
                    playback.clock.start(seek);
                    playback.stream = Some(stream);
                    playback.overlay_active = false;
                    playback.mixing = false;
                    drop(playback);

                    info!(guild = guild_id.0, title = track.title.as_str(), url = track.url.as_str(), "Now playing");
                    stats::report(
                        &self.stats,
                        PlaybackEvent::TrackStarted {
                            guild_id: guild_id.0,
                            url: track.url.clone(),
                            title: track.title.clone(),
                            requested_by: track.requested_by.clone(),
                        },
                    );
                    self.spawn_prebuffer(channel.clone(), generation);
                    return;
                }
                Err(cause) => {
                    warn!(guild = guild_id.0, url = track.url.as_str(), %cause, "Could not start track, advancing");
                    playback.phase = PlaybackPhase::Ending;
                    playback.current = None;
                    playback.last_error = Some(format!("{}: {cause}", track.title));

                    stats::report(
                        &self.stats,
                        PlaybackEvent::ResolutionFailed { guild_id: guild_id.0, url: track.url.clone(), cause },
                    );

                    failures += 1;
                    if failures >= max_failures {
                        warn!(guild = guild_id.0, failures, "Too many failures in a row, going idle");
                        playback.settle_idle();
                        return;
                    }
                }
            }
        }
    }

    async fn autoplay_candidate(&self, guild_id: GuildId, seed: &Track) -> Option<Track> {
        match self.resolver.related(seed).await {
            Ok(Some(track)) => {
                info!(guild = guild_id.0, title = track.title.as_str(), "Autoplay picked a related track");
                Some(track)
            }
            Ok(None) => None,
            Err(why) => {
                warn!(guild = guild_id.0, "Autoplay lookup failed: {why}");
                None
            }
        }
    }

    /// Resolves the next queued track ahead of time. Failures are ignored and
    /// the track is resolved again when its turn comes.
    fn spawn_prebuffer(self: &Arc<Self>, channel: Arc<ChannelState>, generation: u64) {
        let engine = self.clone();
        let guild = channel.guild_id.0;

        tokio::spawn(
            async move {
                let Some(next) = channel.queue.lock().await.peek().cloned() else {
                    return;
                };

                match engine.resolver.resolve(&next, 0.0).await {
                    Ok(stream) => {
                        let mut playback = channel.playback.lock().await;
                        if playback.generation == generation {
                            debug!(url = next.url.as_str(), "Next track pre-buffered");
                            playback.prebuffer = Some((next.url, stream));
                        }
                    }
                    Err(why) => debug!(url = next.url.as_str(), "Pre-buffer failed: {why}"),
                }
            }
            .instrument(tracing::debug_span!("prebuffer", guild)),
        );
    }

    pub async fn on_track_end(self: &Arc<Self>, guild_id: GuildId, generation: u64) {
        let Some(channel) = self.registry.get(guild_id).await else {
            return;
        };

        let claimed = {
            let mut playback = channel.playback.lock().await;

            if playback.generation != generation
                || !matches!(playback.phase, PlaybackPhase::Playing | PlaybackPhase::Paused)
            {
                debug!(guild = guild_id.0, generation, "Ignoring stale track end");
                return;
            }

            if let Some(track) = &playback.current {
                let listened = playback.clock.elapsed();
                stats::report(
                    &self.stats,
                    PlaybackEvent::TrackFinished {
                        guild_id: guild_id.0,
                        url: track.url.clone(),
                        listened_secs: listened,
                        completed: is_completed(listened, track.duration),
                    },
                );
            }

            playback.phase = PlaybackPhase::Ending;
            playback.claim()
        };

        self.transition(channel, None, claimed).await;
    }

    async fn on_clip_end(&self, guild_id: GuildId, sequence: u64) {
        if let Some(channel) = self.registry.get(guild_id).await {
            let mut playback = channel.playback.lock().await;
            if playback.overlay_sequence == sequence {
                playback.overlay_active = false;
            }
        }
    }

    fn report_skip(&self, guild_id: GuildId, playback: &Playback) {
        if let Some(track) = &playback.current {
            let listened = playback.clock.elapsed();
            stats::report(
                &self.stats,
                PlaybackEvent::TrackSkipped {
                    guild_id: guild_id.0,
                    url: track.url.clone(),
                    listened_secs: listened,
                    completed: is_completed(listened, track.duration),
                },
            );
        }
    }

    pub async fn skip(self: &Arc<Self>, guild_id: GuildId, count: usize) -> Result<SkipOutcome> {
        let channel = self.connected(guild_id).await?;
        let count = count.max(1);

        let (skipped, discarded, next, claimed) = {
            let mut playback = channel.playback.lock().await;
            self.report_skip(guild_id, &playback);

            if let Some(player) = playback.player() {
                if let Err(why) = player.stop() {
                    debug!("Stopping track failed: {why}");
                }
            }

            let skipped = playback.current.take();
            playback.phase = PlaybackPhase::Ending;
            playback.stream = None;
            playback.clock.reset();
            let claimed = playback.claim();

            let (discarded, next) = channel.queue.lock().await.skip(count);
            (skipped, discarded, next, claimed)
        };

        info!(guild = guild_id.0, count, discarded, "Skipping");
        self.transition(channel.clone(), next.map(|track| (track, 0.0)), claimed).await;

        let now_playing = channel.playback.lock().await.current.clone();

        Ok(SkipOutcome { skipped: usize::from(skipped.is_some()) + discarded, now_playing })
    }

    /// Pauses or resumes. Returns whether playback is now paused.
    pub async fn toggle_pause(&self, guild_id: GuildId) -> Result<bool> {
        let channel = self.connected(guild_id).await?;
        let mut playback = channel.playback.lock().await;
        let player = playback.player().ok_or(EngineError::NotConnected(guild_id))?;

        match playback.phase {
            PlaybackPhase::Playing => {
                player.pause()?;
                playback.clock.pause();
                playback.phase = PlaybackPhase::Paused;
                info!(guild = guild_id.0, "Paused");
                Ok(true)
            }
            PlaybackPhase::Paused => {
                player.resume()?;
                playback.clock.resume();
                playback.phase = PlaybackPhase::Playing;
                info!(guild = guild_id.0, "Resumed");
                Ok(false)
            }
            _ => Err(EngineError::NothingPlaying),
        }
    }

    /// Stops the current track and clears the queue. The connection stays up.
    pub async fn stop(&self, guild_id: GuildId) -> Result<usize> {
        let channel = self.connected(guild_id).await?;
        let mut playback = channel.playback.lock().await;
        self.report_skip(guild_id, &playback);

        if let Some(player) = playback.player() {
            if let Err(why) = player.stop() {
                warn!(guild = guild_id.0, "Stopping player failed: {why}");
            }
        }

        playback.claim();
        playback.settle_idle();
        let cleared = channel.queue.lock().await.clear();

        info!(guild = guild_id.0, cleared, "Stopped");
        Ok(cleared)
    }

    pub async fn clear(&self, guild_id: GuildId) -> Result<usize> {
        self.connected(guild_id).await?;
        let cleared = self.queues.clear(guild_id).await?;
        info!(guild = guild_id.0, cleared, "Queue cleared");
        Ok(cleared)
    }

    pub async fn remove(&self, guild_id: GuildId, index: usize) -> Result<Track> {
        self.connected(guild_id).await?;
        self.queues.remove_at(guild_id, index).await
    }

    pub async fn promote(&self, guild_id: GuildId, index: usize) -> Result<Track> {
        self.connected(guild_id).await?;
        let track = self.queues.move_to_front(guild_id, index).await?;
        info!(guild = guild_id.0, index, title = track.title.as_str(), "Track moved to the head of the queue");
        Ok(track)
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> Result<usize> {
        self.connected(guild_id).await?;
        self.queues.shuffle(guild_id).await
    }

    pub async fn set_volume(&self, guild_id: GuildId, volume: f32) -> Result<f32> {
        if !volume.is_finite() || !(0.0..=1.0).contains(&volume) {
            return Err(EngineError::Validation(format!("volume must be within [0, 1], got {volume}")));
        }

        let channel = self.connected(guild_id).await?;
        let mut playback = channel.playback.lock().await;
        if let Some(player) = playback.player() {
            player.set_volume(volume)?;
        }
        playback.volume = volume;

        Ok(volume)
    }

    /// Sets autoplay, or toggles it when `enabled` is `None`.
    pub async fn set_autoplay(&self, guild_id: GuildId, enabled: Option<bool>) -> Result<bool> {
        let channel = self.connected(guild_id).await?;
        let mut playback = channel.playback.lock().await;
        playback.autoplay = enabled.unwrap_or(!playback.autoplay);
        Ok(playback.autoplay)
    }

    async fn describe(channel: &ChannelState) -> ChannelStatus {
        let playback = channel.playback.lock().await;
        let queue_length = channel.queue.lock().await.len();

        ChannelStatus {
            guild_id: channel.guild_id.0.to_string(),
            channel_id: playback.connection.as_ref().map(|c| c.channel_id.0.to_string()),
            phase: playback.phase,
            current: playback.current.clone(),
            position_secs: playback.clock.elapsed(),
            volume: playback.volume,
            paused: playback.phase == PlaybackPhase::Paused,
            overlay_active: playback.overlay_active,
            autoplay: playback.autoplay,
            queue_length,
            next_ready: playback.prebuffer.is_some(),
            last_error: playback.last_error.clone(),
        }
    }

    pub async fn status(&self, guild_id: GuildId) -> Option<ChannelStatus> {
        let channel = self.registry.get(guild_id).await?;
        Some(Self::describe(&channel).await)
    }

    pub async fn statuses(&self) -> Vec<ChannelStatus> {
        let mut statuses = Vec::new();
        for channel in self.registry.all().await {
            statuses.push(Self::describe(&channel).await);
        }
        statuses
    }

    pub async fn queue_view(&self, guild_id: GuildId) -> Result<QueueView> {
        let channel = self
            .registry
            .get(guild_id)
            .await
            .ok_or(EngineError::NotConnected(guild_id))?;

        let playback = channel.playback.lock().await;
        let queue = channel.queue.lock().await.tracks();

        Ok(QueueView { current: playback.current.clone(), position_secs: playback.clock.elapsed(), queue })
    }

    /// Current state worth persisting, `None` for an idle channel with an
    /// empty queue or one without connection.
    pub async fn snapshot(&self, guild_id: GuildId) -> Option<QueueSnapshot> {
        let channel = self.registry.get(guild_id).await?;
        let playback = channel.playback.lock().await;
        let queue = channel.queue.lock().await;

        let channel_id = playback.connection.as_ref()?.channel_id;

        if playback.current.is_none() && queue.is_empty() {
            return None;
        }

        Some(QueueSnapshot {
            guild_id,
            channel_id,
            queue: queue.tracks(),
            current: playback.current.clone(),
            position_secs: playback.clock.elapsed(),
            volume: playback.volume,
            saved_at: Utc::now(),
        })
    }

    /// Rejoins the snapshot's channel and resumes where it left off.
    pub async fn restore(self: &Arc<Self>, snapshot: QueueSnapshot) -> Result<()> {
        let guild_id = snapshot.guild_id;
        self.join(guild_id, snapshot.channel_id).await?;
        let channel = self.connected(guild_id).await?;

        let claimed = {
            let mut playback = channel.playback.lock().await;
            playback.volume = crate::resource::clamp_volume(snapshot.volume);
            if let Some(player) = playback.player() {
                player.set_volume(playback.volume)?;
            }
            channel.queue.lock().await.replace(snapshot.queue);
            playback.phase = PlaybackPhase::Starting;
            playback.claim()
        };

        let resume = snapshot.current.map(|track| (track, snapshot.position_secs));
        info!(guild = guild_id.0, position = snapshot.position_secs, "Restoring playback");
        self.transition(channel, resume, claimed).await;

        Ok(())
    }

    fn spawn_event_loop(self: &Arc<Self>, guild_id: GuildId, mut events: EventReceiver) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(
            async move {
                let mut link = ReconnectMachine::default();

                loop {
                    let event = match link.deadline() {
                        Some(deadline) => tokio::select! {
                            event = events.recv() => event,
                            _ = tokio::time::sleep_until(deadline) => {
                                if link.on_tick() == LinkState::Destroyed {
                                    if let Some(engine) = engine.upgrade() {
                                        tokio::spawn(async move { engine.connection_lost(guild_id).await });
                                    }
                                    break;
                                }
                                continue;
                            }
                        },
                        None => events.recv().await,
                    };

                    let (Some(event), Some(engine)) = (event, engine.upgrade()) else {
                        break;
                    };

                    match event {
                        PlayerEvent::TrackEnded { generation } => {
                            tokio::spawn(async move { engine.on_track_end(guild_id, generation).await });
                        }
                        PlayerEvent::ClipEnded { sequence } => engine.on_clip_end(guild_id, sequence).await,
                        PlayerEvent::Connection(change) => {
                            let state = link.on_event(change);
                            info!(?change, ?state, "Voice connection state changed");
                            if state == LinkState::Destroyed {
                                tokio::spawn(async move { engine.connection_lost(guild_id).await });
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("voice_events", guild = guild_id.0)),
        )
    }
}
