//! Connection state and the shared connection slot.
//!
//! `Lifecycle` is the only writer. Every other component reads the slot to
//! find the live connection, if any.

use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::transport::Connection;

mod lifecycle;

pub use lifecycle::Lifecycle;

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// A connection handed out by the slot, tagged with the generation it was
/// established in. Generations increase by one per successful connect.
#[derive(Clone)]
pub struct LiveConnection {
    pub connection: Arc<dyn Connection>,
    pub generation: u64,
}

/// Current connection and state, readable from anywhere.
pub struct ConnectionSlot {
    live: RwLock<Option<LiveConnection>>,
    state: watch::Sender<ConnectionState>,
}

impl Default for ConnectionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSlot {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            live: RwLock::new(None),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The live connection, only once fully recovered.
    pub fn current(&self) -> Option<LiveConnection> {
        if !self.is_connected() {
            return None;
        }
        self.live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Generation of the live connection, if connected.
    pub fn generation(&self) -> Option<u64> {
        self.current().map(|live| live.generation)
    }

    pub(crate) fn set_connecting(&self) {
        self.state.send_replace(ConnectionState::Connecting);
    }

    pub(crate) fn set_connected(&self, live: LiveConnection) {
        *self.live.write().unwrap_or_else(|e| e.into_inner()) = Some(live);
        self.state.send_replace(ConnectionState::Connected);
    }

    /// Clear the slot, returning the connection that was live.
    pub(crate) fn set_disconnected(&self) -> Option<LiveConnection> {
        self.state.send_replace(ConnectionState::Disconnected);
        self.live.write().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    #[tokio::test]
    async fn test_slot_hides_connection_until_connected() {
        let broker = MemoryBroker::new();
        let connection = broker.connect_raw().await.unwrap();
        let slot = ConnectionSlot::new();
        assert_eq!(slot.state(), ConnectionState::Disconnected);

        slot.set_connecting();
        assert!(slot.current().is_none());

        slot.set_connected(LiveConnection {
            connection,
            generation: 3,
        });
        assert_eq!(slot.generation(), Some(3));

        let previous = slot.set_disconnected();
        assert_eq!(previous.map(|l| l.generation), Some(3));
        assert!(slot.current().is_none());
        assert_eq!(slot.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
