mod error;
mod types;

pub use error::ApiError;
pub use types::*;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use serenity::model::id::GuildId;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::idempotency::IdempotencyCache;
use crate::models::Track;
use crate::overlay::Soundboard;
use crate::playback::{EnqueueOutcome, PlaybackEngine};
use crate::speech::{self, SpeechRequest, SpeechSynth};

pub const SECRET_HEADER: &str = "x-worker-secret";

type RpcResult = Result<Json<Value>, ApiError>;

#[derive(Clone)]
pub struct RpcState {
    pub engine: Arc<PlaybackEngine>,
    pub soundboard: Arc<Soundboard>,
    pub speech: Arc<dyn SpeechSynth>,
    pub idempotency: IdempotencyCache,
    secret: Arc<str>,
}

impl RpcState {
    pub fn new(
        engine: Arc<PlaybackEngine>,
        soundboard: Arc<Soundboard>,
        speech: Arc<dyn SpeechSynth>,
        idempotency: IdempotencyCache,
        secret: &str,
    ) -> Self {
        Self { engine, soundboard, speech, idempotency, secret: Arc::from(secret) }
    }
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(get_state))
        .route("/queue/{guild_id}", get(get_queue))
        .route("/soundboard", get(list_clips).post(soundboard))
        .route("/join", post(join))
        .route("/leave", post(leave))
        .route("/volume", post(volume))
        .route("/enqueue", post(enqueue))
        .route("/playnext", post(play_next))
        .route("/skip", post(skip))
        .route("/pause", post(pause))
        .route("/stop", post(stop))
        .route("/clear", post(clear))
        .route("/remove", post(remove))
        .route("/shuffle", post(shuffle))
        .route("/autoplay", post(autoplay))
        .route("/speak", post(speak))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), require_secret))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: RpcState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "RPC server listening");

    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await
}

fn secrets_match(provided: &[u8], expected: &[u8]) -> bool {
    provided.len() == expected.len()
        && provided.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

async fn require_secret(State(state): State<RpcState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(SECRET_HEADER)
        .is_some_and(|provided| secrets_match(provided.as_bytes(), state.secret.as_bytes()));

    if !authorized {
        warn!(path = request.uri().path(), "Rejected RPC call without a valid secret");
        return ApiError::unauthorized().into_response();
    }

    next.run(request).await
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "status": "ok", "data": data }))
}

fn to_data<T: Serialize>(value: T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::internal(e.to_string()))
}

/// Validates a mutating call, then runs `effect` at most once per request id.
///
/// The effect runs on its own task: a caller hanging up does not cancel it,
/// and a retry with the same id waits for that execution.
async fn run<R, F, Fut, T>(
    state: &RpcState,
    method: &'static str,
    payload: Result<Json<R>, JsonRejection>,
    effect: F,
) -> RpcResult
where
    R: Mutation + Send + 'static,
    F: FnOnce(RpcState, GuildId, R) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    T: Serialize + Send,
{
    let Json(request) = payload?;
    check_request_id(request.request_id())?;
    let guild_id = parse_guild(request.guild())?;
    let request_id = request.request_id().to_string();

    debug!(method, request = request_id.as_str(), guild = guild_id.0, "RPC call");

    let handler_state = state.clone();
    let idempotency = state.idempotency.clone();
    let execution = tokio::spawn(async move {
        idempotency
            .run_once(&request_id, || async move {
                let output = effect(handler_state, guild_id, request).await?;
                to_data(output)
            })
            .await
    });

    let data = execution
        .await
        .map_err(|why| ApiError::internal(format!("{method} failed: {why}")))??;

    Ok(ok(data))
}

async fn not_found() -> ApiError {
    ApiError::new(axum::http::StatusCode::NOT_FOUND, "unknown method")
}

async fn health(State(state): State<RpcState>) -> RpcResult {
    let channels = state.engine.registry().guild_ids().await.len();
    Ok(ok(json!({ "healthy": true, "channels": channels })))
}

async fn get_state(State(state): State<RpcState>, query: Result<Query<StateQuery>, QueryRejection>) -> RpcResult {
    let Query(query) = query?;

    let data = match query.guild_id {
        Some(raw) => to_data(state.engine.status(parse_guild(&raw)?).await)?,
        None => to_data(state.engine.statuses().await)?,
    };

    Ok(ok(data))
}

async fn get_queue(State(state): State<RpcState>, Path(guild_id): Path<String>) -> RpcResult {
    let guild_id = parse_guild(&guild_id)?;
    let view = state.engine.queue_view(guild_id).await?;
    Ok(ok(to_data(view)?))
}

async fn list_clips(State(state): State<RpcState>) -> RpcResult {
    Ok(ok(to_data(state.soundboard.list().await)?))
}

async fn join(State(state): State<RpcState>, payload: Result<Json<JoinRequest>, JsonRejection>) -> RpcResult {
    run(&state, "join", payload, |state, guild_id, request| async move {
        let channel_id = parse_channel(&request.channel_id)?;
        state.engine.join(guild_id, channel_id).await
    })
    .await
}

async fn leave(State(state): State<RpcState>, payload: Result<Json<GuildRequest>, JsonRejection>) -> RpcResult {
    run(&state, "leave", payload, |state, guild_id, _| async move {
        state.engine.leave(guild_id).await?;
        Ok::<_, EngineError>(json!({ "left": true }))
    })
    .await
}

async fn volume(State(state): State<RpcState>, payload: Result<Json<VolumeRequest>, JsonRejection>) -> RpcResult {
    run(&state, "volume", payload, |state, guild_id, request| async move {
        let volume = state.engine.set_volume(guild_id, request.volume).await?;
        Ok::<_, EngineError>(json!({ "volume": volume }))
    })
    .await
}

async fn enqueue(State(state): State<RpcState>, payload: Result<Json<EnqueueRequest>, JsonRejection>) -> RpcResult {
    run(&state, "enqueue", payload, |state, guild_id, request| async move {
        state.engine.connected(guild_id).await?;
        let requested_by = request.requested_by.unwrap_or_else(|| "unknown".to_string());
        let tracks = state.engine.resolver().lookup(&request.url, &requested_by).await?;
        state.engine.enqueue(guild_id, tracks).await
    })
    .await
}

#[derive(Serialize)]
#[serde(untagged)]
enum PlayNext {
    Added(EnqueueOutcome),
    Promoted { promoted: Track },
}

async fn play_next(State(state): State<RpcState>, payload: Result<Json<PlayNextRequest>, JsonRejection>) -> RpcResult {
    run(&state, "playnext", payload, |state, guild_id, request| async move {
        match (request.url, request.index) {
            (Some(url), None) => {
                state.engine.connected(guild_id).await?;
                let requested_by = request.requested_by.unwrap_or_else(|| "unknown".to_string());
                let tracks = state.engine.resolver().lookup(&url, &requested_by).await?;
                Ok(PlayNext::Added(state.engine.play_next(guild_id, tracks).await?))
            }
            (None, Some(index)) => Ok(PlayNext::Promoted { promoted: state.engine.promote(guild_id, index).await? }),
            _ => Err(EngineError::Validation("exactly one of url or index is required".to_string())),
        }
    })
    .await
}

async fn skip(State(state): State<RpcState>, payload: Result<Json<SkipRequest>, JsonRejection>) -> RpcResult {
    run(&state, "skip", payload, |state, guild_id, request| async move {
        let count = request.count.unwrap_or(1);
        if count == 0 {
            return Err(EngineError::Validation("count must be at least 1".to_string()));
        }
        state.engine.skip(guild_id, count).await
    })
    .await
}

async fn pause(State(state): State<RpcState>, payload: Result<Json<GuildRequest>, JsonRejection>) -> RpcResult {
    run(&state, "pause", payload, |state, guild_id, _| async move {
        let paused = state.engine.toggle_pause(guild_id).await?;
        Ok::<_, EngineError>(json!({ "paused": paused }))
    })
    .await
}

async fn stop(State(state): State<RpcState>, payload: Result<Json<GuildRequest>, JsonRejection>) -> RpcResult {
    run(&state, "stop", payload, |state, guild_id, _| async move {
        let cleared = state.engine.stop(guild_id).await?;
        Ok::<_, EngineError>(json!({ "stopped": true, "cleared": cleared }))
    })
    .await
}

async fn clear(State(state): State<RpcState>, payload: Result<Json<GuildRequest>, JsonRejection>) -> RpcResult {
    run(&state, "clear", payload, |state, guild_id, _| async move {
        let cleared = state.engine.clear(guild_id).await?;
        Ok::<_, EngineError>(json!({ "cleared": cleared }))
    })
    .await
}

async fn remove(State(state): State<RpcState>, payload: Result<Json<RemoveRequest>, JsonRejection>) -> RpcResult {
    run(&state, "remove", payload, |state, guild_id, request| async move {
        let removed = state.engine.remove(guild_id, request.index).await?;
        Ok::<_, EngineError>(json!({ "removed": removed }))
    })
    .await
}

async fn shuffle(State(state): State<RpcState>, payload: Result<Json<GuildRequest>, JsonRejection>) -> RpcResult {
    run(&state, "shuffle", payload, |state, guild_id, _| async move {
        let queue_length = state.engine.shuffle(guild_id).await?;
        Ok::<_, EngineError>(json!({ "queueLength": queue_length }))
    })
    .await
}

async fn autoplay(State(state): State<RpcState>, payload: Result<Json<AutoplayRequest>, JsonRejection>) -> RpcResult {
    run(&state, "autoplay", payload, |state, guild_id, request| async move {
        let enabled = state.engine.set_autoplay(guild_id, request.enabled).await?;
        Ok::<_, EngineError>(json!({ "autoplay": enabled }))
    })
    .await
}

async fn soundboard(State(state): State<RpcState>, payload: Result<Json<SoundboardRequest>, JsonRejection>) -> RpcResult {
    run(&state, "soundboard", payload, |state, guild_id, request| async move {
        state.engine.play_overlay(&state.soundboard, guild_id, &request.clip_id).await
    })
    .await
}

async fn speak(State(state): State<RpcState>, payload: Result<Json<SpeakRequest>, JsonRejection>) -> RpcResult {
    run(&state, "speak", payload, |state, guild_id, request| async move {
        let request = SpeechRequest::new(&request.text, request.voice.as_deref(), request.speed)?;
        speech::speak(&state.engine, state.speech.as_ref(), guild_id, request).await
    })
    .await
}
