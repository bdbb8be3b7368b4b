use std::time::Duration;

use tokio::time::Instant;

use crate::transport::ConnectionEvent;

pub const RECONNECT_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected { deadline: Instant },
    Recovering { deadline: Instant },
    Destroyed,
}

/// Once disconnected, a connection has [`RECONNECT_WINDOW`] to show signs of
/// recovery before it is destroyed.
#[derive(Debug)]
pub struct ReconnectMachine {
    state: LinkState,
    window: Duration,
}

impl Default for ReconnectMachine {
    fn default() -> Self {
        Self::new(RECONNECT_WINDOW)
    }
}

impl ReconnectMachine {
    pub fn new(window: Duration) -> Self {
        Self { state: LinkState::Connected, window }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            LinkState::Disconnected { deadline } | LinkState::Recovering { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn on_event(&mut self, event: ConnectionEvent) -> LinkState {
        self.state = match (self.state, event) {
            (LinkState::Destroyed, _) => LinkState::Destroyed,
            (LinkState::Connected, ConnectionEvent::Disconnected) => LinkState::Disconnected {
                deadline: Instant::now() + self.window,
            },
            // The window spans both transitions, it is not restarted.
            (
                LinkState::Disconnected { deadline } | LinkState::Recovering { deadline },
                ConnectionEvent::Signalling | ConnectionEvent::Connecting,
            ) => LinkState::Recovering { deadline },
            (_, ConnectionEvent::Ready) => LinkState::Connected,
            (state, _) => state,
        };
        self.state
    }

    /// Called when the deadline may have passed.
    pub fn on_tick(&mut self) -> LinkState {
        if let Some(deadline) = self.deadline() {
            if Instant::now() >= deadline {
                self.state = LinkState::Destroyed;
            }
        }
        self.state
    }
}
