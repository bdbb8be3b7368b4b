use std::time::Duration;

use tokio::time::Instant;

/// Audible playback position of the current track.
///
/// Time spent paused is excluded, so the position only moves while audio is
/// actually produced.
#[derive(Debug, Default, Clone)]
pub struct PositionClock {
    offset: f64,
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl PositionClock {
    /// Starts counting from `offset` seconds into the track.
    pub fn start(&mut self, offset: f64) {
        self.offset = offset.max(0.0);
        self.started_at = Some(Instant::now());
        self.paused_at = None;
        self.paused_total = Duration::ZERO;
    }

    pub fn pause(&mut self) {
        if self.started_at.is_some() && self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += paused_at.elapsed();
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn elapsed(&self) -> f64 {
        let Some(started_at) = self.started_at else {
            return 0.0;
        };

        let end = self.paused_at.unwrap_or_else(Instant::now);
        let wall = end.saturating_duration_since(started_at);
        let audible = wall.saturating_sub(self.paused_total);

        self.offset + audible.as_secs_f64()
    }
}
