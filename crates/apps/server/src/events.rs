//! Extension points.
//!
//! Listeners observe the server; they cannot veto or alter what happens.
//! Every callback runs synchronously on the task that raised the event, so
//! implementations must return quickly and never block.

use crate::network::registry::SessionId;
use crate::world::WorldDelta;
use reactocraft_protocol::ChunkCoordinate;
use std::fmt;
use std::sync::Arc;

/// Where a resolved chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkSource {
    Cache,
    Storage,
    Generated,
}

impl fmt::Display for ChunkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkSource::Cache => write!(f, "cache"),
            ChunkSource::Storage => write!(f, "storage"),
            ChunkSource::Generated => write!(f, "generated"),
        }
    }
}

/// Observer of server events. All methods default to doing nothing.
pub trait ServerListener: Send + Sync {
    fn chunk_resolved(&self, _coord: ChunkCoordinate, _source: ChunkSource) {}

    fn session_joined(&self, _session: SessionId, _player: &str) {}

    fn session_left(&self, _session: SessionId, _player: &str) {}

    fn world_delta(&self, _delta: &WorldDelta, _origin: Option<SessionId>) {}
}

/// Ordered set of listeners shared by the pipeline, the connections and the
/// broadcaster.
#[derive(Clone, Default)]
pub struct EventHooks {
    listeners: Vec<Arc<dyn ServerListener>>,
}

impl EventHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: Arc<dyn ServerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn register(&mut self, listener: Arc<dyn ServerListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn chunk_resolved(&self, coord: ChunkCoordinate, source: ChunkSource) {
        for listener in &self.listeners {
            listener.chunk_resolved(coord, source);
        }
    }

    pub fn session_joined(&self, session: SessionId, player: &str) {
        for listener in &self.listeners {
            listener.session_joined(session, player);
        }
    }

    pub fn session_left(&self, session: SessionId, player: &str) {
        for listener in &self.listeners {
            listener.session_left(session, player);
        }
    }

    pub fn world_delta(&self, delta: &WorldDelta, origin: Option<SessionId>) {
        for listener in &self.listeners {
            listener.world_delta(delta, origin);
        }
    }
}

impl fmt::Debug for EventHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHooks")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
