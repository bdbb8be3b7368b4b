use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serenity::model::id::{ChannelId, GuildId};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_futures::Instrument;

use crate::error::PersistenceError;
use crate::models::Track;
use crate::playback::PlaybackEngine;

pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub queue: Vec<Track>,
    pub current: Option<Track>,
    pub position_secs: f64,
    pub volume: f32,
    pub saved_at: DateTime<Utc>,
}

pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistenceError::Open(format!("Failed to create directory: {e}")))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| PersistenceError::Open(format!("{}: {e}", path.display())))?;

        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(|e| PersistenceError::Open(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue_snapshots (
                guild_id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                queue_json TEXT NOT NULL,
                current_json TEXT,
                position_seconds REAL NOT NULL,
                volume REAL NOT NULL,
                saved_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::Poisoned)
    }

    pub fn save(&self, snapshot: &QueueSnapshot) -> Result<(), PersistenceError> {
        let queue_json = serde_json::to_string(&snapshot.queue)?;
        let current_json = snapshot.current.as_ref().map(serde_json::to_string).transpose()?;

        self.lock()?.execute(
            "INSERT OR REPLACE INTO queue_snapshots
                (guild_id, channel_id, queue_json, current_json, position_seconds, volume, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.guild_id.0.to_string(),
                snapshot.channel_id.0.to_string(),
                queue_json,
                current_json,
                snapshot.position_secs,
                f64::from(snapshot.volume),
                snapshot.saved_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn load(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>, PersistenceError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT guild_id, channel_id, queue_json, current_json, position_seconds, volume, saved_at
                 FROM queue_snapshots WHERE guild_id = ?1",
                params![guild_id.0.to_string()],
                RawSnapshot::from_row,
            )
            .optional()?;

        row.map(RawSnapshot::decode).transpose()
    }

    /// Every stored snapshot. Rows that no longer decode are skipped.
    pub fn load_all(&self) -> Result<Vec<QueueSnapshot>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT guild_id, channel_id, queue_json, current_json, position_seconds, volume, saved_at
             FROM queue_snapshots ORDER BY saved_at",
        )?;

        let rows = stmt
            .query_map([], RawSnapshot::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|raw| {
                let guild = raw.guild_id.clone();
                raw.decode()
                    .map_err(|why| warn!(guild = guild.as_str(), "Discarding unreadable snapshot: {why}"))
                    .ok()
            })
            .collect())
    }

    pub fn delete(&self, guild_id: GuildId) -> Result<bool, PersistenceError> {
        let removed = self
            .lock()?
            .execute("DELETE FROM queue_snapshots WHERE guild_id = ?1", params![guild_id.0.to_string()])?;
        Ok(removed > 0)
    }

    pub fn guild_ids(&self) -> Result<Vec<GuildId>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT guild_id FROM queue_snapshots")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ids.iter().filter_map(|id| id.parse().ok()).map(GuildId).collect())
    }
}

struct RawSnapshot {
    guild_id: String,
    channel_id: String,
    queue_json: String,
    current_json: Option<String>,
    position_secs: f64,
    volume: f64,
    saved_at: String,
}

impl RawSnapshot {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            guild_id: row.get(0)?,
            channel_id: row.get(1)?,
            queue_json: row.get(2)?,
            current_json: row.get(3)?,
            position_secs: row.get(4)?,
            volume: row.get(5)?,
            saved_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<QueueSnapshot, PersistenceError> {
        let parse_id = |raw: &str| {
            raw.parse::<u64>()
                .map_err(|e| PersistenceError::Corrupt(format!("bad snowflake {raw:?}: {e}")))
        };

        let saved_at = DateTime::parse_from_rfc3339(&self.saved_at)
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(QueueSnapshot {
            guild_id: GuildId(parse_id(&self.guild_id)?),
            channel_id: ChannelId(parse_id(&self.channel_id)?),
            queue: serde_json::from_str(&self.queue_json)?,
            current: self.current_json.as_deref().map(serde_json::from_str).transpose()?,
            position_secs: self.position_secs,
            volume: self.volume as f32,
            saved_at,
        })
    }
}

/// Glue between the engine and the store. Failures are logged, never
/// propagated into the playback path.
pub struct SnapshotManager {
    engine: Arc<PlaybackEngine>,
    store: SnapshotStore,
}

impl SnapshotManager {
    pub fn new(engine: Arc<PlaybackEngine>, store: SnapshotStore) -> Arc<Self> {
        Arc::new(Self { engine, store })
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Writes the guild's snapshot, or drops a stale one when there is
    /// nothing worth restoring.
    pub async fn save_snapshot(&self, guild_id: GuildId) -> bool {
        let result = match self.engine.snapshot(guild_id).await {
            Some(snapshot) => self.store.save(&snapshot).map(|()| true),
            None => self.store.delete(guild_id).map(|_| false),
        };

        match result {
            Ok(saved) => {
                debug!(guild = guild_id.0, saved, "Snapshot written");
                saved
            }
            Err(why) => {
                error!(guild = guild_id.0, "Failed to save snapshot: {why}");
                false
            }
        }
    }

    pub async fn save_all(&self) -> usize {
        let active = self.engine.registry().guild_ids().await;
        let mut saved = 0;

        for guild_id in &active {
            if self.save_snapshot(*guild_id).await {
                saved += 1;
            }
        }

        match self.store.guild_ids() {
            Ok(stored) => {
                for stale in stored.into_iter().filter(|guild_id| !active.contains(guild_id)) {
                    if let Err(why) = self.store.delete(stale) {
                        error!(guild = stale.0, "Failed to delete stale snapshot: {why}");
                    }
                }
            }
            Err(why) => error!("Failed to list snapshots: {why}"),
        }

        saved
    }

    /// Resumes every stored snapshot. Returns how many channels came back.
    pub async fn restore_all(&self) -> usize {
        let snapshots = match self.store.load_all() {
            Ok(snapshots) => snapshots,
            Err(why) => {
                error!("Failed to load snapshots: {why}");
                return 0;
            }
        };

        info!(count = snapshots.len(), "Restoring snapshots");
        let mut restored = 0;

        for snapshot in snapshots {
            let guild_id = snapshot.guild_id;
            let channel_id = snapshot.channel_id;

            if !self.engine.channel_exists(guild_id, channel_id).await {
                warn!(guild = guild_id.0, channel = channel_id.0, "Voice channel is gone, discarding snapshot");
                self.discard(guild_id);
                continue;
            }

            match self.engine.restore(snapshot).await {
                Ok(()) => {
                    restored += 1;
                    self.discard(guild_id);
                }
                Err(why) => warn!(guild = guild_id.0, "Could not restore snapshot: {why}"),
            }
        }

        restored
    }

    fn discard(&self, guild_id: GuildId) {
        if let Err(why) = self.store.delete(guild_id) {
            error!(guild = guild_id.0, "Failed to delete snapshot: {why}");
        }
    }

    pub fn spawn_autosave(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately.
                interval.tick().await;

                loop {
                    interval.tick().await;
                    let saved = manager.save_all().await;
                    debug!(saved, "Autosave finished");
                }
            }
            .instrument(tracing::info_span!("autosave")),
        )
    }
}
