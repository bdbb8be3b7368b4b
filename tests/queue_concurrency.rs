mod common;

use std::collections::HashSet;
use std::sync::Arc;

use serenity::model::id::GuildId;

use common::{track, Harness, GUILD};
use duba_worker::queue::QueueManager;
use duba_worker::registry::ChannelRegistry;

async fn queues_for(guild_id: GuildId) -> QueueManager {
    let registry = Arc::new(ChannelRegistry::default());
    registry.get_or_create(guild_id).await;
    QueueManager::new(registry)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_are_all_kept() {
    let queues = queues_for(GUILD).await;

    let tasks: Vec<_> = (0..64)
        .map(|i| {
            let queues = queues.clone();
            tokio::spawn(async move { queues.enqueue(GUILD, vec![track(&format!("t{i}"))]).await.unwrap() })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    let titles: HashSet<String> = queues.tracks(GUILD).await.unwrap().into_iter().map(|t| t.title).collect();
    assert_eq!(titles.len(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueue_and_dequeue_never_lose_or_repeat() {
    let queues = queues_for(GUILD).await;
    queues
        .enqueue(GUILD, (0..100).map(|i| track(&format!("t{i}"))).collect())
        .await
        .unwrap();

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let queues = queues.clone();
            tokio::spawn(async move { queues.dequeue_next(GUILD).await.unwrap() })
        })
        .collect();

    let mut seen = HashSet::new();
    for task in tasks {
        let track = task.await.unwrap().expect("a track per dequeue");
        assert!(seen.insert(track.title));
    }

    assert_eq!(queues.len(GUILD).await.unwrap(), 0);
    assert!(queues.dequeue_next(GUILD).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_engine_enqueues_start_exactly_once() {
    let h = Harness::joined().await;

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.enqueue(GUILD, vec![track(&format!("t{i}"))]).await })
        })
        .collect();

    let mut started = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().started {
            started += 1;
        }
    }

    assert_eq!(started, 1);
    assert_eq!(h.player().played.lock().unwrap().len(), 1);

    let status = h.status().await;
    assert!(status.current.is_some());
    assert_eq!(status.queue_length, 19);
}
