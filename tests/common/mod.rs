#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::Notify;

use duba_worker::error::{ResolveError, TransportError};
use duba_worker::models::{Track, TrackInfo};
use duba_worker::playback::{ChannelStatus, PlaybackEngine};
use duba_worker::registry::ChannelRegistry;
use duba_worker::resolver::{ResolvedStream, StreamBackend, StreamCache, StreamResolver};
use duba_worker::resource::{AudioResource, ResourceInput};
use duba_worker::stats::{PlaybackEvent, StatsSink};
use duba_worker::transport::{AudioPlayer, EventSender, PlayerEvent, VoiceTransport};

pub const GUILD: GuildId = GuildId(1);
pub const CHANNEL: ChannelId = ChannelId(10);

pub fn url(name: &str) -> String {
    format!("https://www.youtube.com/watch?v={name}")
}

pub fn track(name: &str) -> Track {
    Track::new(TrackInfo { title: name.to_string(), url: url(name), duration: None }, "tester")
}

/// Resolves everything to `<url>/stream` unless told to fail or hold.
#[derive(Default)]
pub struct MockBackend {
    pub resolves: AtomicUsize,
    pub lookups: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    held: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MockBackend {
    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(url(name));
    }

    /// Blocks resolution of `name` until the returned notify fires.
    pub fn hold(&self, name: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.held.lock().unwrap().insert(url(name), gate.clone());
        gate
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamBackend for MockBackend {
    async fn resolve(&self, track: &Track, _seek: f64) -> Result<ResolvedStream, ResolveError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);

        let gate = self.held.lock().unwrap().remove(&track.url);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing.lock().unwrap().contains(&track.url) {
            return Err(ResolveError::Unavailable("video removed".to_string()));
        }

        Ok(ResolvedStream {
            endpoint: format!("{}/stream", track.url),
            duration: Some(180.0),
            source: track.source,
        })
    }

    async fn lookup(&self, query: &str) -> Result<Vec<TrackInfo>, ResolveError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(vec![TrackInfo { title: query.to_string(), url: query.to_string(), duration: Some(200.0) }])
    }

    async fn related(&self, track: &Track) -> Result<Option<TrackInfo>, ResolveError> {
        let name = format!("{}-next", track.title);
        Ok(Some(TrackInfo { title: name.clone(), url: url(&name), duration: None }))
    }
}

pub struct MockPlayer {
    pub events: EventSender,
    pub played: Mutex<Vec<(AudioResource, u64)>>,
    pub clips: Mutex<Vec<(AudioResource, u64)>>,
    pub volume: Mutex<f32>,
    pub stops: AtomicUsize,
    pub clip_stops: AtomicUsize,
    /// Makes `stop` report an error after counting the call.
    pub failing_stop: AtomicBool,
}

impl MockPlayer {
    fn new(events: EventSender) -> Self {
        Self {
            events,
            played: Mutex::new(Vec::new()),
            clips: Mutex::new(Vec::new()),
            volume: Mutex::new(1.0),
            stops: AtomicUsize::new(0),
            clip_stops: AtomicUsize::new(0),
            failing_stop: AtomicBool::new(false),
        }
    }

    pub fn last_played(&self) -> Option<(AudioResource, u64)> {
        self.played.lock().unwrap().last().cloned()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.played
            .lock()
            .unwrap()
            .iter()
            .map(|(resource, _)| match &resource.input {
                ResourceInput::Stream { endpoint, .. } | ResourceInput::Mix { endpoint, .. } => endpoint.clone(),
                ResourceInput::File(path) => path.display().to_string(),
            })
            .collect()
    }

    /// Reports the current music track as finished.
    pub fn finish_current(&self) {
        if let Some((_, generation)) = self.last_played() {
            let _ = self.events.send(PlayerEvent::TrackEnded { generation });
        }
    }
}

#[async_trait]
impl AudioPlayer for MockPlayer {
    async fn play(&self, resource: AudioResource, generation: u64) -> Result<(), TransportError> {
        self.played.lock().unwrap().push((resource, generation));
        Ok(())
    }

    async fn play_clip(&self, resource: AudioResource, sequence: u64) -> Result<(), TransportError> {
        self.clips.lock().unwrap().push((resource, sequence));
        Ok(())
    }

    fn pause(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn resume(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn stop_clip(&self) -> Result<(), TransportError> {
        self.clip_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), TransportError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.failing_stop.load(Ordering::SeqCst) {
            return Err(TransportError::Player("track refused to stop".to_string()));
        }
        Ok(())
    }

    fn set_volume(&self, volume: f32) -> Result<(), TransportError> {
        *self.volume.lock().unwrap() = volume;
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTransport {
    players: Mutex<HashMap<GuildId, Arc<MockPlayer>>>,
    missing: Mutex<HashSet<ChannelId>>,
    refusing: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl MockTransport {
    pub fn player(&self, guild_id: GuildId) -> Arc<MockPlayer> {
        self.players.lock().unwrap().get(&guild_id).cloned().expect("no player for guild")
    }

    pub fn remove_channel(&self, channel_id: ChannelId) {
        self.missing.lock().unwrap().insert(channel_id);
    }

    /// Every following connect fails.
    pub fn refuse_connections(&self) {
        self.refusing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl VoiceTransport for MockTransport {
    async fn connect(
        &self,
        guild_id: GuildId,
        _channel_id: ChannelId,
        events: EventSender,
    ) -> Result<Arc<dyn AudioPlayer>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Join("gateway refused the connection".to_string()));
        }
        let player = Arc::new(MockPlayer::new(events));
        self.players.lock().unwrap().insert(guild_id, player.clone());
        Ok(player)
    }

    async fn disconnect(&self, _guild_id: GuildId) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn channel_exists(&self, _guild_id: GuildId, channel_id: ChannelId) -> bool {
        !self.missing.lock().unwrap().contains(&channel_id)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<PlaybackEvent>>,
}

#[async_trait]
impl StatsSink for RecordingSink {
    async fn record(&self, event: PlaybackEvent) -> Result<(), String> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<PlaybackEngine>,
    pub backend: Arc<MockBackend>,
    pub transport: Arc<MockTransport>,
    pub stats: Arc<RecordingSink>,
}

impl Harness {
    pub fn new() -> Self {
        let backend = Arc::new(MockBackend::default());
        let transport = Arc::new(MockTransport::default());
        let stats = Arc::new(RecordingSink::default());

        let engine = PlaybackEngine::new(
            Arc::new(ChannelRegistry::default()),
            Arc::new(StreamResolver::new(backend.clone())),
            transport.clone(),
            stats.clone(),
        );

        Self { engine, backend, transport, stats }
    }

    /// Like [`Harness::new`], but every resolution reaches the backend.
    pub fn uncached() -> Self {
        let backend = Arc::new(MockBackend::default());
        let transport = Arc::new(MockTransport::default());
        let stats = Arc::new(RecordingSink::default());

        let resolver = StreamResolver::with_cache(backend.clone(), StreamCache::new(Duration::ZERO, 1));
        let engine = PlaybackEngine::new(
            Arc::new(ChannelRegistry::default()),
            Arc::new(resolver),
            transport.clone(),
            stats.clone(),
        );

        Self { engine, backend, transport, stats }
    }

    pub async fn joined() -> Self {
        let harness = Self::new();
        harness.engine.join(GUILD, CHANNEL).await.unwrap();
        harness
    }

    pub fn player(&self) -> Arc<MockPlayer> {
        self.transport.player(GUILD)
    }

    pub async fn status(&self) -> ChannelStatus {
        self.engine.status(GUILD).await.expect("channel state exists")
    }

    pub async fn current_title(&self) -> Option<String> {
        self.engine.status(GUILD).await.and_then(|status| status.current).map(|track| track.title)
    }

    /// Whether the stats sink received an event matching `predicate`.
    pub fn recorded(&self, predicate: impl Fn(&PlaybackEvent) -> bool) -> bool {
        let events = self.stats.events.lock().unwrap();
        events.iter().any(predicate)
    }

    pub async fn queued_titles(&self) -> Vec<String> {
        match self.engine.queue_view(GUILD).await {
            Ok(view) => view.queue.into_iter().map(|track| track.title).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Polls `condition` until it holds, panicking after a while.
pub async fn eventually<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
