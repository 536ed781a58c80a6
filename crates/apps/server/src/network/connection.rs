//! One actor per TCP connection.
//!
//! The actor owns the read half and the connection state machine
//! (`Handshaking -> LoggingIn -> Play -> Closing`). A separate writer task
//! owns the write half and drains a bounded queue of encoded frames, which
//! is the same queue the broadcaster feeds. One slot of that queue stays
//! reserved for the closing `Disconnect`, and updates the broadcaster had
//! to drop are answered by the writer with a `Resync`.
//!
//! Responses leave in the order their requests arrived. Chunk requests are
//! resolved concurrently through an ordered futures queue; when it holds
//! `max_pending_requests` entries the actor stops reading until the oldest
//! one completes.

use super::registry::{NewSession, ResyncSignal, SessionId, SPAWN_POSITION};
use super::{ConnectionError, SessionRegistry, WorldBroadcaster};
use crate::config::ServerConfig;
use crate::events::EventHooks;
use crate::metrics::ServerMetrics;
use crate::world::{Chunk, ChunkPipeline, ResolveError, WorldDelta};
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::stream::FuturesOrdered;
use futures::{FutureExt, SinkExt, Stream, StreamExt};
use glam::DVec3;
use reactocraft_protocol::{
    encode, BlockPosition, ChunkCoordinate, CodecError, Packet, PacketCodec, PROTOCOL_VERSION,
};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::io::InspectReader;
use tokio_util::sync::CancellationToken;

/// Shared state every connection actor works against.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<ServerConfig>,
    pub pipeline: ChunkPipeline,
    pub registry: Arc<SessionRegistry>,
    pub broadcaster: WorldBroadcaster,
    pub hooks: EventHooks,
    pub metrics: Arc<ServerMetrics>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    LoggingIn,
    Play,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::LoggingIn => "logging in",
            ConnectionState::Play => "play",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

enum Response {
    Packet(Packet),
    Chunk {
        coord: ChunkCoordinate,
        result: Result<Arc<Chunk>, ResolveError>,
    },
}

enum Flow {
    Continue,
    Quit,
}

struct Session {
    id: SessionId,
    player: String,
    view_distance: u8,
    center: ChunkCoordinate,
    /// Chunks delivered to the client, each holding one cache pin.
    sent: HashSet<ChunkCoordinate>,
}

impl Session {
    fn in_view(&self, coord: &ChunkCoordinate) -> bool {
        self.center.chebyshev_distance(coord) <= u32::from(self.view_distance)
    }
}

/// Serve one accepted connection until it closes.
pub async fn handle_connection(ctx: ConnectionContext, stream: TcpStream, peer: SocketAddr, id: u64) {
    ServerMetrics::incr(&ctx.metrics.open_connections);
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(error = %err, "failed to set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let (outbound, frames) = mpsc::channel(ctx.config.outbound_queue);
    let resync = Arc::new(ResyncSignal::new());
    let writer = tokio::spawn(write_loop(
        FramedWrite::new(write_half, PacketCodec::new()),
        frames,
        Arc::clone(&resync),
        Arc::clone(&ctx.metrics),
    ));
    // The queue is empty, so this resolves at once.
    let farewell = outbound.clone().reserve_owned().await.ok();

    let counter = Arc::clone(&ctx.metrics);
    let counted = InspectReader::new(read_half, move |bytes: &[u8]| {
        ServerMetrics::add(&counter.bytes_received, bytes.len() as u64);
    });
    let mut reader = FramedRead::new(counted, PacketCodec::new());

    let metrics = Arc::clone(&ctx.metrics);
    let mut connection = Connection::new(ctx, outbound, farewell, resync, peer, id);
    tracing::info!("connection accepted");

    let result = connection.run(&mut reader).await;
    let error = match result {
        Ok(()) => {
            tracing::info!("client disconnected");
            None
        }
        Err(err) => {
            if err.is_protocol_violation() {
                ServerMetrics::incr(&metrics.protocol_violations);
                tracing::warn!(error = %err, state = %connection.state, "closing connection");
            } else {
                tracing::info!(reason = %err, "closing connection");
            }
            Some(err)
        }
    };

    connection.close(error, writer).await;
    ServerMetrics::decr(&metrics.open_connections);
}

struct Connection {
    id: u64,
    peer: SocketAddr,
    state: ConnectionState,
    ctx: ConnectionContext,
    outbound: mpsc::Sender<Bytes>,
    /// Slot held back for the `Disconnect` sent on close.
    farewell: Option<OwnedPermit<Bytes>>,
    resync: Arc<ResyncSignal>,
    kick: CancellationToken,
    session: Option<Session>,
    pending: FuturesOrdered<BoxFuture<'static, Response>>,
    awaiting_keepalive: Option<u64>,
    next_keepalive: u64,
}

impl Connection {
    fn new(
        ctx: ConnectionContext,
        outbound: mpsc::Sender<Bytes>,
        farewell: Option<OwnedPermit<Bytes>>,
        resync: Arc<ResyncSignal>,
        peer: SocketAddr,
        id: u64,
    ) -> Self {
        Self {
            id,
            peer,
            state: ConnectionState::Handshaking,
            ctx,
            outbound,
            farewell,
            resync,
            kick: CancellationToken::new(),
            session: None,
            pending: FuturesOrdered::new(),
            awaiting_keepalive: None,
            next_keepalive: 0,
        }
    }

    /// Main loop. `Ok` means the client left on its own.
    async fn run<S>(&mut self, reader: &mut S) -> Result<(), ConnectionError>
    where
        S: Stream<Item = Result<Packet, CodecError>> + Unpin,
    {
        let config = Arc::clone(&self.ctx.config);
        let shutdown = self.ctx.shutdown.clone();
        let kick = self.kick.clone();
        let login_deadline = Instant::now() + config.login_timeout;
        let mut last_inbound = Instant::now();
        let mut keepalive = time::interval_at(
            Instant::now() + config.keepalive_interval,
            config.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let in_play = self.state == ConnectionState::Play;
            let can_read = self.pending.len() < config.max_pending_requests;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ConnectionError::Shutdown),
                _ = kick.cancelled() => return Err(ConnectionError::Backpressure),
                Some(response) = self.pending.next(), if !self.pending.is_empty() => {
                    self.emit(response).await?;
                }
                frame = reader.next(), if can_read => {
                    let packet = match frame {
                        None => return Err(ConnectionError::Closed(self.peer)),
                        Some(Err(CodecError::Malformed(err))) => return Err(err.into()),
                        Some(Err(CodecError::Io(err))) => return Err(err.into()),
                        Some(Ok(packet)) => packet,
                    };
                    last_inbound = Instant::now();
                    ServerMetrics::incr(&self.ctx.metrics.packets_received);
                    if let Flow::Quit = self.handle(packet).await? {
                        return Ok(());
                    }
                }
                _ = time::sleep_until(login_deadline), if !in_play => {
                    return Err(ConnectionError::LoginTimeout);
                }
                _ = keepalive.tick(), if in_play => self.send_keepalive().await?,
                _ = time::sleep_until(last_inbound + config.idle_timeout), if in_play => {
                    return Err(ConnectionError::IdleTimeout);
                }
            }
        }
    }

    async fn handle(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        tracing::debug!(packet = packet.name(), state = %self.state, "received");

        match (self.state, packet) {
            (_, Packet::Disconnect { code, message }) => {
                tracing::debug!(%code, %message, "peer sent disconnect");
                return Ok(Flow::Quit);
            }
            (ConnectionState::Handshaking, Packet::Handshake { protocol_version }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(ConnectionError::VersionMismatch {
                        client: protocol_version,
                        server: PROTOCOL_VERSION,
                    });
                }
                self.send(Packet::HandshakeAck {
                    protocol_version: PROTOCOL_VERSION,
                })
                .await?;
                self.state = ConnectionState::LoggingIn;
            }
            (ConnectionState::LoggingIn, Packet::Login {
                player,
                view_distance,
            }) => self.login(player, view_distance).await?,
            (ConnectionState::Play, Packet::ChunkRequest { coord }) => self.request_chunk(coord),
            (ConnectionState::Play, Packet::PlayerPosition { position }) => self.moved(position)?,
            (ConnectionState::Play, Packet::KeepAlive { id }) => self.keepalive(id),
            (ConnectionState::Play, Packet::BlockUpdate { position, block }) => {
                self.place_block(position, block)
            }
            (state, packet) => {
                return Err(ConnectionError::ProtocolViolation(format!(
                    "unexpected {} while {}",
                    packet.name(),
                    state
                )));
            }
        }
        Ok(Flow::Continue)
    }

    async fn login(&mut self, player: String, requested: u8) -> Result<(), ConnectionError> {
        let view_distance = requested.clamp(1, self.ctx.config.max_view_distance);

        // Hold a queue slot so LoginSuccess goes out before any broadcast.
        let permit = self
            .outbound
            .reserve()
            .await
            .map_err(|_| ConnectionError::Closed(self.peer))?;

        let registered = self.ctx.registry.register(NewSession {
            player: player.clone(),
            connection_id: self.id,
            view_distance,
            outbound: self.outbound.clone(),
            resync: Arc::clone(&self.resync),
            kick: self.kick.clone(),
        });

        let id = match registered {
            Ok(id) => id,
            Err(rejection) => {
                tracing::info!(%player, reason = %rejection, "login rejected");
                permit.send(encode(&Packet::LoginFailure {
                    reason: rejection.to_string(),
                }));
                return Err(rejection.into());
            }
        };

        permit.send(encode(&Packet::LoginSuccess {
            session_id: id.0,
            view_distance,
        }));
        self.state = ConnectionState::Play;
        self.session = Some(Session {
            id,
            player: player.clone(),
            view_distance,
            center: ChunkCoordinate::from_world(SPAWN_POSITION.x, SPAWN_POSITION.z),
            sent: HashSet::new(),
        });

        tracing::info!(session = %id, %player, view_distance, "player logged in");
        self.ctx.hooks.session_joined(id, &player);
        Ok(())
    }

    fn request_chunk(&mut self, coord: ChunkCoordinate) {
        let Some(session) = &self.session else {
            return;
        };
        if !session.in_view(&coord) {
            self.pending.push_back(reply(Packet::ChunkUnavailable {
                coord,
                reason: "outside view distance".to_string(),
            }));
            return;
        }

        let pipeline = self.ctx.pipeline.clone();
        self.pending.push_back(
            async move {
                let result = pipeline.resolve(coord).await;
                Response::Chunk { coord, result }
            }
            .boxed(),
        );
    }

    fn moved(&mut self, position: [f64; 3]) -> Result<(), ConnectionError> {
        if !position.iter().all(|axis| axis.is_finite()) {
            return Err(ConnectionError::ProtocolViolation(
                "non-finite player position".to_string(),
            ));
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some((_, center)) = self
            .ctx
            .registry
            .update_position(session.id, DVec3::from_array(position))
        else {
            return Ok(());
        };

        self.ctx.broadcaster.publish(
            &WorldDelta::Entity {
                entity_id: session.id.0,
                position,
            },
            Some(session.id),
        );

        if center == session.center {
            return Ok(());
        }
        session.center = center;

        let stale: Vec<ChunkCoordinate> = session
            .sent
            .iter()
            .filter(|coord| !session.in_view(coord))
            .copied()
            .collect();
        for coord in stale {
            session.sent.remove(&coord);
            self.ctx.pipeline.release(coord);
            self.pending.push_back(reply(Packet::ChunkUnload { coord }));
        }
        Ok(())
    }

    fn keepalive(&mut self, id: u64) {
        if self.awaiting_keepalive == Some(id) {
            self.awaiting_keepalive = None;
        } else {
            self.pending.push_back(reply(Packet::KeepAlive { id }));
        }
    }

    fn place_block(&mut self, position: BlockPosition, block_id: u16) {
        let origin = self.session.as_ref().map(|session| session.id);
        match self.ctx.pipeline.apply_block(position, block_id) {
            Ok(true) => {
                self.ctx
                    .broadcaster
                    .publish(&WorldDelta::Block { position, block_id }, origin);
            }
            Ok(false) => {
                tracing::debug!(?position, "block update for a chunk that is not loaded");
            }
            Err(err) => tracing::debug!(?position, error = %err, "block update rejected"),
        }
    }

    async fn send_keepalive(&mut self) -> Result<(), ConnectionError> {
        self.next_keepalive = self.next_keepalive.wrapping_add(1);
        self.awaiting_keepalive = Some(self.next_keepalive);
        self.send(Packet::KeepAlive {
            id: self.next_keepalive,
        })
        .await
    }

    async fn emit(&mut self, response: Response) -> Result<(), ConnectionError> {
        let packet = match response {
            Response::Packet(packet) => packet,
            Response::Chunk {
                coord,
                result: Ok(chunk),
            } => match self.session.as_mut() {
                // the player moved on while the chunk was resolving
                Some(session) if !session.in_view(&coord) => Packet::ChunkUnavailable {
                    coord,
                    reason: "outside view distance".to_string(),
                },
                session => {
                    if let Some(session) = session {
                        if !session.sent.contains(&coord) && self.ctx.pipeline.retain(coord) {
                            session.sent.insert(coord);
                        }
                    }
                    Packet::ChunkData {
                        coord,
                        blocks: chunk.blocks().clone(),
                    }
                }
            },
            Response::Chunk {
                coord,
                result: Err(err),
            } => Packet::ChunkUnavailable {
                coord,
                reason: err.to_string(),
            },
        };
        self.send(packet).await
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        tracing::debug!(packet = packet.name(), "sending");
        let frame = encode(&packet);
        tokio::select! {
            sent = self.outbound.send(frame) => sent.map_err(|_| ConnectionError::Closed(self.peer)),
            _ = self.kick.cancelled() => Err(ConnectionError::Backpressure),
            _ = self.ctx.shutdown.cancelled() => Err(ConnectionError::Shutdown),
        }
    }

    /// Leave the session, say goodbye if owed, and give the writer
    /// `flush_timeout` to drain.
    async fn close(
        mut self,
        error: Option<ConnectionError>,
        mut writer: JoinHandle<Result<(), CodecError>>,
    ) {
        self.state = ConnectionState::Closing;

        let code = error.as_ref().and_then(ConnectionError::disconnect_code);
        match (self.farewell.take(), code) {
            (Some(permit), Some(code)) => {
                let message = error.as_ref().map(ToString::to_string).unwrap_or_default();
                permit.send(encode(&Packet::Disconnect { code, message }));
            }
            (None, Some(_)) => tracing::debug!("writer already gone, disconnect packet not sent"),
            _ => {}
        }

        // Dropping queued resolutions releases their waiters.
        self.pending = FuturesOrdered::new();

        if let Some(session) = self.session.take() {
            self.ctx.registry.remove(session.id);
            for coord in &session.sent {
                self.ctx.pipeline.release(*coord);
            }
            self.ctx.hooks.session_left(session.id, &session.player);
            tracing::info!(session = %session.id, player = %session.player, "player left");
        }

        let flush_timeout = self.ctx.config.flush_timeout;
        drop(self.outbound);

        match time::timeout(flush_timeout, &mut writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => tracing::debug!(error = %err, "writer stopped early"),
            Ok(Err(err)) => tracing::error!(error = %err, "writer task failed"),
            Err(_) => {
                tracing::warn!(?flush_timeout, "outbound queue not drained in time");
                writer.abort();
            }
        }
    }
}

fn reply(packet: Packet) -> BoxFuture<'static, Response> {
    future::ready(Response::Packet(packet)).boxed()
}

/// Drain `frames` into `sink`, answering a raised `resync` with a `Resync`
/// frame right after whatever frame is in flight.
async fn write_loop<W>(
    mut sink: FramedWrite<W, PacketCodec>,
    mut frames: mpsc::Receiver<Bytes>,
    resync: Arc<ResyncSignal>,
    metrics: Arc<ServerMetrics>,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let resync_frame = encode(&Packet::Resync);
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => feed(&mut sink, frame, &metrics).await?,
                None => break,
            },
            _ = resync.raised() => {}
        }
        if resync.take() {
            ServerMetrics::incr(&metrics.resyncs);
            feed(&mut sink, resync_frame.clone(), &metrics).await?;
        }
        if frames.is_empty() {
            SinkExt::<Bytes>::flush(&mut sink).await?;
        }
    }
    SinkExt::<Bytes>::flush(&mut sink).await?;
    sink.get_mut().shutdown().await?;
    Ok(())
}

async fn feed<W>(
    sink: &mut FramedWrite<W, PacketCodec>,
    frame: Bytes,
    metrics: &ServerMetrics,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    ServerMetrics::incr(&metrics.packets_sent);
    ServerMetrics::add(&metrics.bytes_sent, frame.len() as u64);
    SinkExt::<Bytes>::feed(sink, frame).await
}
