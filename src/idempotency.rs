//! Request-id keyed response cache
//!
//! A retried RPC call carrying the same request id gets the first call's
//! response back without running its side effect again. Two calls racing on
//! the same id share one execution. Failed executions are not remembered.

use std::future::Future;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use tracing::debug;

pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(60);

const MAX_ENTRIES: u64 = 10_000;

#[derive(Clone)]
pub struct IdempotencyCache {
    responses: Cache<String, Value>,
    ttl: Duration,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(IDEMPOTENCY_TTL)
    }
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        let responses = Cache::builder().max_capacity(MAX_ENTRIES).time_to_live(ttl).build();
        Self { responses, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn has_cached(&self, id: &str) -> bool {
        self.get_cached(id).await.is_some()
    }

    pub async fn get_cached(&self, id: &str) -> Option<Value> {
        self.responses.get(id).await
    }

    /// Stores `response` under `id` unless a response is already there.
    pub async fn set_cached(&self, id: &str, response: Value) {
        self.responses.get_with(id.to_string(), async move { response }).await;
    }

    /// Runs `effect` at most once per id within the TTL and returns its
    /// response.
    pub async fn run_once<F, Fut, E>(&self, id: &str, effect: F) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Clone + Send + Sync + 'static,
    {
        if let Some(cached) = self.responses.get(id).await {
            debug!(request = id, "Replaying cached response");
            return Ok(cached);
        }

        self.responses
            .try_get_with(id.to_string(), effect())
            .await
            .map_err(|why| (*why).clone())
    }

    pub async fn len(&self) -> u64 {
        self.responses.run_pending_tasks().await;
        self.responses.entry_count()
    }
}
