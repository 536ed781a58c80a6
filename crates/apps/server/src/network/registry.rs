use crate::metrics::ServerMetrics;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use glam::DVec3;
use reactocraft_protocol::ChunkCoordinate;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Longest accepted player name.
pub const MAX_PLAYER_NAME: usize = 16;

/// Where new sessions appear until their first position update.
pub const SPAWN_POSITION: DVec3 = DVec3::new(8.0, 64.0, 8.0);

/// Identifier issued to every logged-in session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginRejection {
    #[error("player names are 1-16 characters of A-Z, a-z, 0-9 and _")]
    InvalidName,
    #[error("player already online")]
    AlreadyOnline,
    #[error("server full")]
    ServerFull,
}

pub fn valid_player_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_PLAYER_NAME
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Result of offering one frame to a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full. The update is lost and the session's resync is raised.
    Dropped,
    /// Queue full too many times in a row; the session was told to leave.
    Kicked,
    /// The connection is already going away.
    Closed,
}

/// Set when a session lost a broadcast. The connection's writer answers it
/// with a `Resync` as soon as it next makes progress, whether or not any
/// further update arrives.
#[derive(Debug, Default)]
pub struct ResyncSignal {
    pending: AtomicBool,
    notify: Notify,
}

impl ResyncSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_raised(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Clear the signal, reporting whether it was raised.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Wait for the next `raise`. May wake spuriously; check with `take`.
    pub async fn raised(&self) {
        self.notify.notified().await;
    }
}

/// Registry view of one logged-in session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub player: String,
    pub connection_id: u64,
    pub view_distance: u8,
    position: DVec3,
    center: ChunkCoordinate,
    outbound: mpsc::Sender<Bytes>,
    strikes: u32,
    resync: Arc<ResyncSignal>,
    kick: CancellationToken,
}

impl SessionHandle {
    pub fn position(&self) -> DVec3 {
        self.position
    }

    /// Chunk the player stands in.
    pub fn center(&self) -> ChunkCoordinate {
        self.center
    }

    pub fn covers(&self, chunk: ChunkCoordinate) -> bool {
        self.center.chebyshev_distance(&chunk) <= u32::from(self.view_distance)
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Queue `frame` without waiting. On a full queue the frame is lost,
    /// a strike is recorded and the session's resync is raised.
    pub fn offer(&mut self, frame: &Bytes, strike_limit: u32) -> Delivery {
        match self.outbound.try_send(frame.clone()) {
            Ok(()) => {
                self.strikes = 0;
                Delivery::Sent
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
            Err(TrySendError::Full(_)) => {
                self.strikes += 1;
                self.resync.raise();
                if self.strikes >= strike_limit {
                    self.kick.cancel();
                    Delivery::Kicked
                } else {
                    Delivery::Dropped
                }
            }
        }
    }
}

/// Everything the registry needs to admit a session.
pub struct NewSession {
    pub player: String,
    pub connection_id: u64,
    pub view_distance: u8,
    pub outbound: mpsc::Sender<Bytes>,
    pub resync: Arc<ResyncSignal>,
    pub kick: CancellationToken,
}

/// All logged-in sessions, keyed by id. Player names are unique.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    names: DashMap<String, SessionId>,
    count: AtomicUsize,
    max_sessions: usize,
    metrics: Arc<ServerMetrics>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            names: DashMap::new(),
            count: AtomicUsize::new(0),
            max_sessions,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn register(&self, new: NewSession) -> Result<SessionId, LoginRejection> {
        if !valid_player_name(&new.player) {
            return Err(LoginRejection::InvalidName);
        }

        let slot = match self.names.entry(new.player.clone()) {
            Entry::Occupied(_) => return Err(LoginRejection::AlreadyOnline),
            Entry::Vacant(slot) => slot,
        };

        let reserved = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max_sessions).then_some(count + 1)
            });
        if reserved.is_err() {
            return Err(LoginRejection::ServerFull);
        }

        let id = loop {
            let candidate = SessionId(rand::random::<u64>());
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        slot.insert(id);

        self.sessions.insert(
            id,
            SessionHandle {
                id,
                player: new.player,
                connection_id: new.connection_id,
                view_distance: new.view_distance,
                position: SPAWN_POSITION,
                center: ChunkCoordinate::from_world(SPAWN_POSITION.x, SPAWN_POSITION.z),
                outbound: new.outbound,
                strikes: 0,
                resync: new.resync,
                kick: new.kick,
            },
        );
        ServerMetrics::incr(&self.metrics.active_sessions);
        Ok(id)
    }

    pub fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        let (_, handle) = self.sessions.remove(&id)?;
        self.names.remove(&handle.player);
        self.count.fetch_sub(1, Ordering::AcqRel);
        ServerMetrics::decr(&self.metrics.active_sessions);
        Some(handle)
    }

    /// Record a move. Returns the previous and new center chunks.
    pub fn update_position(
        &self,
        id: SessionId,
        position: DVec3,
    ) -> Option<(ChunkCoordinate, ChunkCoordinate)> {
        let mut handle = self.sessions.get_mut(&id)?;
        let previous = handle.center;
        handle.position = position;
        handle.center = ChunkCoordinate::from_world(position.x, position.z);
        Some((previous, handle.center))
    }

    pub fn find_by_name(&self, player: &str) -> Option<SessionId> {
        self.names.get(player).map(|id| *id)
    }

    /// Sessions whose view covers `chunk`, except `exclude`.
    pub fn viewers_of(&self, chunk: ChunkCoordinate, exclude: Option<SessionId>) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude && entry.covers(chunk))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Visit every session covering `chunk` except `exclude`, mutably.
    pub fn for_each_viewer(
        &self,
        chunk: ChunkCoordinate,
        exclude: Option<SessionId>,
        mut visit: impl FnMut(&mut SessionHandle),
    ) {
        for mut entry in self.sessions.iter_mut() {
            if Some(entry.id) == exclude || !entry.covers(chunk) {
                continue;
            }
            visit(entry.value_mut());
        }
    }
}
