use super::registry::{Delivery, SessionId, SessionRegistry};
use crate::events::EventHooks;
use crate::metrics::ServerMetrics;
use crate::world::WorldDelta;
use reactocraft_protocol::encode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Tally of one [`WorldBroadcaster::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub kicked: usize,
}

/// Fans world deltas out to the sessions that can see them.
///
/// Each delta is encoded once and the frame is shared. Publishing never
/// waits on a slow client. A full outbound queue loses the update and raises
/// the session's resync signal, which its writer answers on its own. Enough
/// consecutive misses get the session kicked.
#[derive(Clone)]
pub struct WorldBroadcaster {
    registry: Arc<SessionRegistry>,
    hooks: EventHooks,
    metrics: Arc<ServerMetrics>,
    strike_limit: u32,
}

impl WorldBroadcaster {
    pub fn new(
        registry: Arc<SessionRegistry>,
        hooks: EventHooks,
        metrics: Arc<ServerMetrics>,
        strike_limit: u32,
    ) -> Self {
        Self {
            registry,
            hooks,
            metrics,
            strike_limit: strike_limit.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn publish(&self, delta: &WorldDelta, origin: Option<SessionId>) -> BroadcastReport {
        self.hooks.world_delta(delta, origin);

        let frame = encode(&delta.to_packet());
        let mut report = BroadcastReport::default();
        let mut kicked = Vec::new();

        self.registry
            .for_each_viewer(delta.chunk(), origin, |session| {
                match session.offer(&frame, self.strike_limit) {
                    Delivery::Sent => report.delivered += 1,
                    Delivery::Dropped => report.dropped += 1,
                    Delivery::Kicked => {
                        report.kicked += 1;
                        kicked.push((session.id, session.player.clone()));
                    }
                    Delivery::Closed => {}
                }
            });

        let misses = (report.dropped + report.kicked) as u64;
        if misses > 0 {
            ServerMetrics::add(&self.metrics.backpressure_drops, misses);
        }
        for (session, player) in kicked {
            ServerMetrics::incr(&self.metrics.kicks);
            tracing::warn!(%session, %player, "outbound queue kept overflowing, kicking session");
        }
        report
    }

    /// Publish every delta arriving on `deltas` until all senders are gone.
    pub fn spawn(self, mut deltas: mpsc::Receiver<(WorldDelta, Option<SessionId>)>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((delta, origin)) = deltas.recv().await {
                let report = self.publish(&delta, origin);
                tracing::trace!(?report, "delta published");
            }
            tracing::debug!("world delta channel closed");
        })
    }
}
