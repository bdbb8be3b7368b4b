use std::sync::Arc;

use anyhow::Context as _;
use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    http::Http,
    model::{gateway::Ready, prelude::VoiceState},
    prelude::{GatewayIntents, TypeMapKey},
};
use songbird::{SerenityInit, Songbird};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use duba_worker::config::WorkerConfig;
use duba_worker::idempotency::IdempotencyCache;
use duba_worker::overlay::Soundboard;
use duba_worker::playback::PlaybackEngine;
use duba_worker::registry::ChannelRegistry;
use duba_worker::resolver::{StreamResolver, YtDlpBackend};
use duba_worker::rpc::{self, RpcState};
use duba_worker::snapshot::{SnapshotManager, SnapshotStore};
use duba_worker::speech::EspeakSynth;
use duba_worker::stats::{HttpStatsSink, StatsSink, TracingStatsSink};
use duba_worker::transport::ConnectionEvent;
use duba_worker::voice::SongbirdTransport;

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl TypeMapKey for BotDataMap {
    type Value = BotData;
}

struct Handler {
    engine: Arc<PlaybackEngine>,
    ready: Arc<Notify>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        let bot_data = BotData { id: ready.user.id.0 };
        {
            let data = &mut ctx.data.write().await;
            data.insert::<BotDataMap>(bot_data);
        }

        self.ready.notify_one();
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let bot_id = {
            let data = ctx.data.read().await;
            data.get::<BotDataMap>().map(|data| data.id)
        };

        let (Some(bot_id), Some(guild_id)) = (bot_id, new.guild_id) else {
            return;
        };

        if bot_id != new.user_id.0 {
            return;
        }

        let event = match (old.and_then(|state| state.channel_id), new.channel_id) {
            (_, None) => ConnectionEvent::Disconnected,
            (Some(before), Some(after)) if before != after => ConnectionEvent::Signalling,
            _ => return,
        };

        info!(guild = guild_id.0, ?event, "Bot voice state changed");
        self.engine.connection_event(guild_id, event).await;
    }
}

async fn shutdown_signal() {
    if let Err(why) = tokio::signal::ctrl_c().await {
        error!("Control-C interruption failed: {why}");
    }

    info!("Received Ctrl-C, shutting down.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv_loaded = dotenv().is_ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if !dotenv_loaded {
        warn!(".env file not found, using the process environment");
    }

    let config = WorkerConfig::from_env()?;

    let backend = Arc::new(YtDlpBackend::new(config.ytdlp_path.clone())?);
    let resolver = Arc::new(StreamResolver::new(backend));

    let stats: Arc<dyn StatsSink> = match &config.stats_url {
        Some(url) => Arc::new(HttpStatsSink::new(url.clone())?),
        None => Arc::new(TracingStatsSink),
    };

    let songbird = Songbird::serenity();
    let http = Arc::new(Http::new(&config.discord_token));
    let transport = Arc::new(SongbirdTransport::new(songbird.clone(), http, config.ffmpeg_path.clone()));

    let engine = PlaybackEngine::new(Arc::new(ChannelRegistry::default()), resolver, transport, stats);
    let ready = Arc::new(Notify::new());

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler { engine: engine.clone(), ready: ready.clone() })
        .register_songbird_with(songbird)
        .await
        .context("Err creating client")?;

    let shard_manager = client.shard_manager.clone();

    tokio::spawn(async move {
        let _ = client.start().await.map_err(|why| error!("Client ended: {why:?}"));
    });

    tokio::select! {
        _ = ready.notified() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the gateway was ready");
            return Ok(());
        }
    }

    let store = SnapshotStore::open(&config.snapshot_db)?;
    let snapshots = SnapshotManager::new(engine.clone(), store);

    let restored = snapshots.restore_all().await;
    info!(restored, "Snapshots restored");

    let autosave = snapshots.spawn_autosave(config.autosave_interval);

    let state = RpcState::new(
        engine,
        Arc::new(Soundboard::new(config.soundboard_dir.clone())),
        Arc::new(EspeakSynth::new(config.espeak_path.clone(), config.speech_dir.clone())),
        IdempotencyCache::new(config.idempotency_ttl),
        &config.worker_secret,
    );

    let served = rpc::serve(config.listen_addr, state, shutdown_signal()).await;

    autosave.abort();
    let saved = snapshots.save_all().await;
    info!(saved, "Snapshots saved");

    shard_manager.lock().await.shutdown_all().await;

    served.context("RPC server failed")
}
