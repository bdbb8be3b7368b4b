use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serenity::http::Http;
use serenity::model::channel::{Channel, ChannelType};
use serenity::model::id::{ChannelId, GuildId};
use songbird::input::{children_to_reader, Codec, Container, Input, Metadata};
use songbird::tracks::TrackHandle;
use songbird::{Call, CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::resource::AudioResource;
use crate::transport::{AudioPlayer, ConnectionEvent, EventSender, PlayerEvent, VoiceTransport};

pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    http: Arc<Http>,
    ffmpeg: String,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, http: Arc<Http>, ffmpeg: impl Into<String>) -> Self {
        Self { manager, http, ffmpeg: ffmpeg.into() }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: EventSender,
    ) -> Result<Arc<dyn AudioPlayer>, TransportError> {
        let (call, joined) = self.manager.join(guild_id, channel_id).await;
        joined.map_err(|e| TransportError::Join(e.to_string()))?;

        {
            let mut handler = call.lock().await;

            if handler.is_deaf() {
                debug!("Already deafened");
            } else if let Err(e) = handler.deafen(true).await {
                info!("Deafen failed due to {e:?}");
            }

            // Handlers of an earlier connection would report into a dead channel.
            handler.remove_all_global_events();

            let changes = [
                (CoreEvent::DriverDisconnect, ConnectionEvent::Disconnected),
                (CoreEvent::DriverReconnect, ConnectionEvent::Ready),
                (CoreEvent::DriverConnect, ConnectionEvent::Ready),
            ];
            for (core, change) in changes {
                handler.add_global_event(
                    Event::Core(core),
                    Notifier { events: events.clone(), event: PlayerEvent::Connection(change) },
                );
            }
        }

        Ok(Arc::new(SongbirdPlayer::new(call, events, self.ffmpeg.clone())))
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), TransportError> {
        if self.manager.get(guild_id).is_none() {
            return Ok(());
        }

        self.manager
            .remove(guild_id)
            .await
            .map_err(|e| TransportError::Join(e.to_string()))
    }

    async fn channel_exists(&self, guild_id: GuildId, channel_id: ChannelId) -> bool {
        match self.http.get_channel(channel_id.0).await {
            Ok(Channel::Guild(channel)) => {
                channel.guild_id == guild_id && matches!(channel.kind, ChannelType::Voice | ChannelType::Stage)
            }
            Ok(_) => false,
            Err(why) => {
                warn!(channel = channel_id.0, "Channel lookup failed: {why}");
                false
            }
        }
    }
}

/// Forwards a songbird event into the channel's event loop.
struct Notifier {
    events: EventSender,
    event: PlayerEvent,
}

#[async_trait]
impl VoiceEventHandler for Notifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        debug!(event = ?self.event, "Voice notifier triggered");
        let _ = self.events.send(self.event.clone());
        None
    }
}

/// One music track plus at most one clip on top, both decoded by ffmpeg.
pub struct SongbirdPlayer {
    call: Arc<AsyncMutex<Call>>,
    events: EventSender,
    ffmpeg: String,
    music: Mutex<Option<TrackHandle>>,
    clip: Mutex<Option<TrackHandle>>,
}

impl SongbirdPlayer {
    fn new(call: Arc<AsyncMutex<Call>>, events: EventSender, ffmpeg: String) -> Self {
        Self { call, events, ffmpeg, music: Mutex::new(None), clip: Mutex::new(None) }
    }

    fn input(&self, resource: &AudioResource) -> Result<Input, TransportError> {
        let child = Command::new(&self.ffmpeg)
            .args(resource.ffmpeg_args())
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Player(format!("{} failed to start: {e}", self.ffmpeg)))?;

        let metadata = Metadata {
            title: resource.title.clone(),
            duration: resource.duration.map(Duration::from_secs_f64),
            channels: Some(2),
            sample_rate: Some(crate::resource::SAMPLE_RATE),
            ..Default::default()
        };

        Ok(Input::new(
            true,
            children_to_reader::<f32>(vec![child]),
            Codec::FloatPcm,
            Container::Raw,
            Some(metadata),
        ))
    }

    async fn start(&self, resource: &AudioResource, on_end: PlayerEvent) -> Result<TrackHandle, TransportError> {
        let input = self.input(resource)?;
        let handle = self.call.lock().await.play_source(input);

        handle.set_volume(resource.volume).map_err(player_error)?;
        handle
            .add_event(Event::Track(TrackEvent::End), Notifier { events: self.events.clone(), event: on_end })
            .map_err(player_error)?;

        Ok(handle)
    }

    fn with_music(&self, f: impl FnOnce(&TrackHandle) -> songbird::tracks::TrackResult<()>) -> Result<(), TransportError> {
        let music = self.music.lock().map_err(|_| TransportError::Closed)?;
        match music.as_ref() {
            Some(handle) => f(handle).map_err(player_error),
            None => Ok(()),
        }
    }
}

fn player_error(e: songbird::tracks::TrackError) -> TransportError {
    TransportError::Player(e.to_string())
}

fn swap(slot: &Mutex<Option<TrackHandle>>, handle: Option<TrackHandle>) -> Result<(), TransportError> {
    let previous = {
        let mut slot = slot.lock().map_err(|_| TransportError::Closed)?;
        std::mem::replace(&mut *slot, handle)
    };

    if let Some(previous) = previous {
        // A finished track refuses to stop, which is fine.
        let _ = previous.stop();
    }

    Ok(())
}

#[async_trait]
impl AudioPlayer for SongbirdPlayer {
    async fn play(&self, resource: AudioResource, generation: u64) -> Result<(), TransportError> {
        swap(&self.music, None)?;
        let handle = self.start(&resource, PlayerEvent::TrackEnded { generation }).await?;
        swap(&self.music, Some(handle))
    }

    async fn play_clip(&self, resource: AudioResource, sequence: u64) -> Result<(), TransportError> {
        swap(&self.clip, None)?;
        let handle = self.start(&resource, PlayerEvent::ClipEnded { sequence }).await?;
        swap(&self.clip, Some(handle))
    }

    fn pause(&self) -> Result<(), TransportError> {
        self.with_music(TrackHandle::pause)
    }

    fn resume(&self) -> Result<(), TransportError> {
        self.with_music(TrackHandle::play)
    }

    fn stop_clip(&self) -> Result<(), TransportError> {
        swap(&self.clip, None)
    }

    fn stop(&self) -> Result<(), TransportError> {
        swap(&self.clip, None)?;
        swap(&self.music, None)
    }

    fn set_volume(&self, volume: f32) -> Result<(), TransportError> {
        self.with_music(|handle| handle.set_volume(volume))
    }
}
