mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use common::{url, Harness, GUILD};
use duba_worker::error::SpeechError;
use duba_worker::idempotency::IdempotencyCache;
use duba_worker::overlay::Soundboard;
use duba_worker::playback::PlaybackPhase;
use duba_worker::rpc::{self, RpcState, SECRET_HEADER};
use duba_worker::speech::{SpeechRequest, SpeechSynth};

const SECRET: &str = "hunter2";

/// Writes an empty file instead of talking.
struct SilentSynth {
    dir: PathBuf,
}

#[async_trait]
impl SpeechSynth for SilentSynth {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<PathBuf, SpeechError> {
        let path = self.dir.join(format!("{}.wav", request.text.len()));
        tokio::fs::write(&path, b"")
            .await
            .map_err(|e| SpeechError::Failed(e.to_string()))?;
        Ok(path)
    }
}

struct Rpc {
    harness: Harness,
    app: Router,
    _dir: TempDir,
}

impl Rpc {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("airhorn.ogg"), b"not really audio").unwrap();

        let harness = Harness::new();
        let state = RpcState::new(
            harness.engine.clone(),
            Arc::new(Soundboard::new(dir.path())),
            Arc::new(SilentSynth { dir: dir.path().to_path_buf() }),
            IdempotencyCache::default(),
            SECRET,
        );

        Self { harness, app: rpc::router(state), _dir: dir }
    }

    fn dir(&self) -> &Path {
        self._dir.path()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, body)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(SECRET_HEADER, SECRET)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(SECRET_HEADER, SECRET)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn join(&self) {
        let (status, body) = self
            .post("/join", json!({ "requestId": "join-1", "guildId": "1", "channelId": "10" }))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }
}

#[tokio::test]
async fn rejects_calls_without_the_secret() {
    let rpc = Rpc::new();

    let missing = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = rpc.send(missing).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");

    let wrong = Request::builder()
        .uri("/health")
        .header(SECRET_HEADER, "hunter3")
        .body(Body::empty())
        .unwrap();
    assert_eq!(rpc.send(wrong).await.0, StatusCode::UNAUTHORIZED);

    let mutation = Request::builder()
        .method(Method::POST)
        .uri("/leave")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "requestId": "l", "guildId": "1" }).to_string()))
        .unwrap();
    assert_eq!(rpc.send(mutation).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let rpc = Rpc::new();

    let (status, body) = rpc.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "data": { "healthy": true, "channels": 0 } }));

    let (status, body) = rpc.get("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn repeated_request_id_runs_once() {
    let rpc = Rpc::new();
    rpc.join().await;

    let request = json!({ "requestId": "req-42", "guildId": "1", "url": url("a"), "requestedBy": "alice" });
    let (first_status, first) = rpc.post("/enqueue", request.clone()).await;
    let (second_status, second) = rpc.post("/enqueue", request).await;

    assert_eq!(first_status, StatusCode::OK, "{first}");
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first, second);
    assert_eq!(first["data"]["added"], 1);
    assert_eq!(first["data"]["started"], true);

    assert_eq!(rpc.harness.backend.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(rpc.harness.player().played.lock().unwrap().len(), 1);

    let (_, third) = rpc
        .post("/enqueue", json!({ "requestId": "req-43", "guildId": "1", "url": url("b") }))
        .await;
    assert_eq!(third["data"]["queueLength"], 1);
    assert_eq!(rpc.harness.backend.lookups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn abandoned_call_finishes_and_is_not_repeated() {
    let rpc = Rpc::new();
    rpc.join().await;
    let gate = rpc.harness.backend.hold("a");
    let request = json!({ "requestId": "req-slow", "guildId": "1", "url": url("a") });

    let abandoned = tokio::time::timeout(Duration::from_millis(50), rpc.post("/enqueue", request.clone())).await;
    assert!(abandoned.is_err());

    gate.notify_one();
    let harness = &rpc.harness;
    common::eventually(move || async move { harness.status().await.phase == PlaybackPhase::Playing }).await;

    let (status, body) = rpc.post("/enqueue", request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["added"], 1);
    assert_eq!(body["data"]["started"], true);

    assert_eq!(rpc.harness.backend.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(rpc.harness.player().played.lock().unwrap().len(), 1);
    assert!(rpc.harness.queued_titles().await.is_empty());
}

#[tokio::test]
async fn play_next_takes_a_url_or_a_queue_index() {
    let rpc = Rpc::new();
    rpc.join().await;

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        rpc.post("/enqueue", json!({ "requestId": format!("e{i}"), "guildId": "1", "url": url(name) }))
            .await;
    }

    let (status, body) = rpc.post("/playnext", json!({ "requestId": "n1", "guildId": "1", "index": 1 })).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["promoted"]["url"], url("c"));

    let (status, body) = rpc
        .post("/playnext", json!({ "requestId": "n2", "guildId": "1", "url": url("x") }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["added"], 1);
    assert_eq!(rpc.harness.queued_titles().await, vec![url("x"), url("c"), url("b")]);

    let (status, _) = rpc.post("/playnext", json!({ "requestId": "n3", "guildId": "1", "index": 7 })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = rpc
        .post("/playnext", json!({ "requestId": "n4", "guildId": "1", "index": 0, "url": url("y") }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = rpc.post("/playnext", json!({ "requestId": "n5", "guildId": "1" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn failed_call_is_not_cached() {
    let rpc = Rpc::new();
    let request = json!({ "requestId": "retry-me", "guildId": "1", "url": url("a") });

    let (status, body) = rpc.post("/enqueue", request.clone()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "error");

    rpc.join().await;
    let (status, body) = rpc.post("/enqueue", request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let rpc = Rpc::new();

    let garbage = Request::builder()
        .method(Method::POST)
        .uri("/skip")
        .header(SECRET_HEADER, SECRET)
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = rpc.send(garbage).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, _) = rpc.post("/skip", json!({ "guildId": "1" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = rpc.post("/skip", json!({ "requestId": "x", "guildId": "not-a-snowflake" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = rpc.post("/skip", json!({ "requestId": "", "guildId": "1" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn engine_errors_map_to_statuses() {
    let rpc = Rpc::new();

    let (status, _) = rpc.post("/pause", json!({ "requestId": "p1", "guildId": "1" })).await;
    assert_eq!(status, StatusCode::CONFLICT);

    rpc.join().await;

    let (status, _) = rpc.post("/pause", json!({ "requestId": "p2", "guildId": "1" })).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = rpc.post("/volume", json!({ "requestId": "v1", "guildId": "1", "volume": 3.0 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = rpc.post("/remove", json!({ "requestId": "r1", "guildId": "1", "index": 0 })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = rpc.post("/skip", json!({ "requestId": "s1", "guildId": "1", "count": 0 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    rpc.harness.backend.fail("broken");
    let (status, body) = rpc
        .post("/enqueue", json!({ "requestId": "e1", "guildId": "1", "url": url("broken") }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(rpc.harness.status().await.last_error.is_some());
}

#[tokio::test]
async fn playback_controls_round_trip() {
    let rpc = Rpc::new();
    rpc.join().await;

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        let (status, _) = rpc
            .post("/enqueue", json!({ "requestId": format!("e{i}"), "guildId": "1", "url": url(name) }))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = rpc.get("/queue/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["current"]["url"], url("a"));
    assert_eq!(body["data"]["queue"].as_array().unwrap().len(), 2);

    let (_, body) = rpc.post("/pause", json!({ "requestId": "p1", "guildId": "1" })).await;
    assert_eq!(body["data"]["paused"], true);

    let (_, body) = rpc.post("/skip", json!({ "requestId": "s1", "guildId": "1" })).await;
    assert_eq!(body["data"]["skipped"], 1);
    assert_eq!(body["data"]["nowPlaying"]["url"], url("b"));

    let (_, body) = rpc.post("/volume", json!({ "requestId": "v1", "guildId": "1", "volume": 0.25 })).await;
    assert_eq!(body["data"]["volume"], 0.25);

    let (_, body) = rpc.get("/state?guildId=1").await;
    assert_eq!(body["data"]["phase"], "playing");
    assert_eq!(body["data"]["volume"], 0.25);
    assert_eq!(body["data"]["queueLength"], 1);

    let (_, body) = rpc.post("/stop", json!({ "requestId": "st1", "guildId": "1" })).await;
    assert_eq!(body["data"]["cleared"], 1);

    let (_, body) = rpc.post("/leave", json!({ "requestId": "l1", "guildId": "1" })).await;
    assert_eq!(body["data"]["left"], true);

    let (status, _) = rpc.get("/queue/1").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn soundboard_and_speech() {
    let rpc = Rpc::new();

    let (status, body) = rpc.get("/soundboard").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["id"], "airhorn");

    rpc.join().await;

    let (status, body) = rpc
        .post("/soundboard", json!({ "requestId": "sb1", "guildId": "1", "clipId": "airhorn" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["overlaid"], false);

    let (status, _) = rpc
        .post("/soundboard", json!({ "requestId": "sb2", "guildId": "1", "clipId": "missing" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = rpc
        .post("/speak", json!({ "requestId": "sp1", "guildId": "1", "text": "hello there" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["clip"], "speech");
    assert!(rpc.dir().join("11.wav").exists());

    let (status, _) = rpc.post("/speak", json!({ "requestId": "sp2", "guildId": "1", "text": "  " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(rpc.harness.player().clips.lock().unwrap().len(), 2);
    assert_eq!(rpc.harness.engine.status(GUILD).await.map(|s| s.overlay_active), Some(true));
}
