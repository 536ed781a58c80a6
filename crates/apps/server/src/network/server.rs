use super::connection::{handle_connection, ConnectionContext};
use super::{ServerError, SessionId, SessionRegistry, WorldBroadcaster};
use crate::config::ServerConfig;
use crate::events::EventHooks;
use crate::metrics::ServerMetrics;
use crate::world::{ChunkPipeline, WorldDelta};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How long `run` waits for connections to say goodbye after shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// TCP listener plus everything its connections share.
pub struct Server {
    listener: TcpListener,
    ctx: ConnectionContext,
    deltas: mpsc::Sender<(WorldDelta, Option<SessionId>)>,
    delta_rx: mpsc::Receiver<(WorldDelta, Option<SessionId>)>,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        pipeline: ChunkPipeline,
        hooks: EventHooks,
        metrics: Arc<ServerMetrics>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_address.clone(),
                source,
            })?;

        let registry = Arc::new(SessionRegistry::new(
            config.max_sessions,
            Arc::clone(&metrics),
        ));
        let broadcaster = WorldBroadcaster::new(
            Arc::clone(&registry),
            hooks.clone(),
            Arc::clone(&metrics),
            config.backpressure_strikes,
        );
        let (deltas, delta_rx) = mpsc::channel(config.broadcast_queue);

        Ok(Self {
            listener,
            ctx: ConnectionContext {
                config: Arc::new(config),
                pipeline,
                registry,
                broadcaster,
                hooks,
                metrics,
                shutdown: CancellationToken::new(),
            },
            deltas,
            delta_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    pub fn broadcaster(&self) -> WorldBroadcaster {
        self.ctx.broadcaster.clone()
    }

    /// Queue for world changes made outside any connection.
    pub fn delta_sender(&self) -> mpsc::Sender<(WorldDelta, Option<SessionId>)> {
        self.deltas.clone()
    }

    /// Accept connections until `shutdown` fires, then disconnect everyone.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let Server {
            listener,
            mut ctx,
            deltas,
            delta_rx,
        } = self;
        ctx.shutdown = shutdown.child_token();
        drop(deltas);

        let broadcast_task = ctx.broadcaster.clone().spawn(delta_rx);
        let mut connections = JoinSet::new();
        let mut next_id: u64 = 0;

        tracing::info!(addr = %listener.local_addr()?, "listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    next_id += 1;
                    let span = tracing::info_span!("connection", id = next_id, %peer);
                    connections.spawn(
                        handle_connection(ctx.clone(), stream, peer, next_id).instrument(span),
                    );
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "connection task failed");
                    }
                }
            }
        }

        tracing::info!(open = connections.len(), "shutting down listener");
        ctx.shutdown.cancel();
        drop(listener);

        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = connections.len(), "aborting connections that did not close");
            connections.shutdown().await;
        }

        broadcast_task.abort();
        Ok(())
    }
}
