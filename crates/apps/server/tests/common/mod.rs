#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reactocraft_protocol::{ChunkCoordinate, Packet, PacketCodec, PROTOCOL_VERSION};
use reactocraft_server::{
    world::{ChunkStorage, MemoryStorage},
    ChunkPipeline, ChunkSource, EventHooks, PipelineConfig, Server, ServerConfig, ServerListener,
    ServerMetrics, SessionId,
};
use reactocraft_worldgen::{
    GenerationError, GenerationPool, InProcessGenerator, PoolConfig, TerrainGenerator,
    TerrainMode,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Flat terrain that counts calls and can be told to fail or dawdle.
#[derive(Default)]
pub struct TestGenerator {
    calls: AtomicUsize,
    failing: HashSet<ChunkCoordinate>,
    delay: Duration,
    per_coord: Mutex<Vec<ChunkCoordinate>>,
}

impl TestGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(mut self, coord: ChunkCoordinate) -> Self {
        self.failing.insert(coord);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, coord: ChunkCoordinate) -> usize {
        self.per_coord.lock().iter().filter(|c| **c == coord).count()
    }
}

impl TerrainGenerator for TestGenerator {
    fn generate(&self, coord: ChunkCoordinate, seed: u64) -> Result<Vec<u8>, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.per_coord.lock().push(coord);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.failing.contains(&coord) {
            return Err(GenerationError::NativeStatus(3));
        }
        InProcessGenerator::new(TerrainMode::Flat).generate(coord, seed)
    }
}

/// Records every hook invocation.
#[derive(Default)]
pub struct Recorder {
    pub resolved: Mutex<Vec<(ChunkCoordinate, ChunkSource)>>,
    pub joined: Mutex<Vec<String>>,
    pub left: Mutex<Vec<String>>,
}

impl ServerListener for Recorder {
    fn chunk_resolved(&self, coord: ChunkCoordinate, source: ChunkSource) {
        self.resolved.lock().push((coord, source));
    }

    fn session_joined(&self, _session: SessionId, player: &str) {
        self.joined.lock().push(player.to_string());
    }

    fn session_left(&self, _session: SessionId, player: &str) {
        self.left.lock().push(player.to_string());
    }
}

pub fn pool_config() -> PoolConfig {
    PoolConfig {
        workers: 2,
        queue_capacity: 64,
        timeout: Duration::from_secs(2),
        attempts: 2,
    }
}

pub fn pipeline_with(
    generator: Arc<TestGenerator>,
    storage: Arc<dyn ChunkStorage>,
    config: PipelineConfig,
    hooks: EventHooks,
) -> ChunkPipeline {
    pipeline_with_metrics(
        generator,
        storage,
        config,
        hooks,
        Arc::new(ServerMetrics::default()),
    )
}

/// Like [`pipeline_with`], counting into `metrics`.
pub fn pipeline_with_metrics(
    generator: Arc<TestGenerator>,
    storage: Arc<dyn ChunkStorage>,
    config: PipelineConfig,
    hooks: EventHooks,
    metrics: Arc<ServerMetrics>,
) -> ChunkPipeline {
    let pool = GenerationPool::new(generator, pool_config()).unwrap();
    ChunkPipeline::new(config, storage, Arc::new(pool), hooks, metrics)
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        login_timeout: Duration::from_secs(5),
        keepalive_interval: Duration::from_secs(10),
        idle_timeout: Duration::from_secs(30),
        flush_timeout: Duration::from_millis(500),
        metrics_interval: Duration::ZERO,
        ..ServerConfig::default()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub pipeline: ChunkPipeline,
    pub generator: Arc<TestGenerator>,
    pub recorder: Arc<Recorder>,
    pub storage: Arc<MemoryStorage>,
    pub metrics: Arc<ServerMetrics>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(generator: TestGenerator) -> Self {
        Self::start_with(generator, test_config()).await
    }

    pub async fn start_with(generator: TestGenerator, config: ServerConfig) -> Self {
        let generator = Arc::new(generator);
        let recorder = Arc::new(Recorder::default());
        let storage = Arc::new(MemoryStorage::new());
        let metrics = Arc::new(ServerMetrics::default());
        let hooks = EventHooks::new().with_listener(recorder.clone());

        let pipeline = pipeline_with_metrics(
            generator.clone(),
            storage.clone(),
            PipelineConfig::from(&config.world),
            hooks.clone(),
            metrics.clone(),
        );

        let server = Server::bind(config, pipeline.clone(), hooks, metrics.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                server.run(shutdown).await.unwrap();
            }
        });

        Self {
            addr,
            shutdown,
            pipeline,
            generator,
            recorder,
            storage,
            metrics,
            task,
        }
    }

    pub async fn connect(&self) -> Client {
        Client::connect(self.addr).await
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

pub struct Client {
    framed: Framed<TcpStream, PacketCodec>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, PacketCodec::new()),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        SinkExt::<Packet>::send(&mut self.framed, packet)
            .await
            .unwrap();
    }

    /// Next packet, or `None` once the server closed the connection.
    pub async fn recv_opt(&mut self) -> Option<Packet> {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(packet))) => Some(packet),
            Ok(Some(Err(_))) | Ok(None) => None,
            Err(_) => panic!("no packet within {RECV_TIMEOUT:?}"),
        }
    }

    pub async fn recv(&mut self) -> Packet {
        self.recv_opt().await.expect("connection closed")
    }

    /// Skip server keep-alives.
    pub async fn recv_skipping_keepalive(&mut self) -> Option<Packet> {
        loop {
            match self.recv_opt().await {
                Some(Packet::KeepAlive { .. }) => continue,
                other => return other,
            }
        }
    }

    pub async fn handshake(&mut self) {
        self.send(Packet::Handshake {
            protocol_version: PROTOCOL_VERSION,
        })
        .await;
        assert_eq!(
            self.recv().await,
            Packet::HandshakeAck {
                protocol_version: PROTOCOL_VERSION
            }
        );
    }

    /// Handshake and log in. Returns the session id and granted view distance.
    pub async fn login(&mut self, player: &str, view_distance: u8) -> (u64, u8) {
        self.handshake().await;
        self.send(Packet::Login {
            player: player.to_string(),
            view_distance,
        })
        .await;
        match self.recv().await {
            Packet::LoginSuccess {
                session_id,
                view_distance,
            } => (session_id, view_distance),
            other => panic!("expected LoginSuccess, got {other:?}"),
        }
    }

    pub async fn request_chunk(&mut self, x: i32, z: i32) -> Packet {
        self.send(Packet::ChunkRequest {
            coord: ChunkCoordinate::new(x, z),
        })
        .await;
        self.recv().await
    }

    /// Wait for the server to close the connection, returning everything
    /// received until then.
    pub async fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Some(packet) = self.recv_opt().await {
            packets.push(packet);
        }
        packets
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
