use crate::error::GenerationError;
use crate::generator::TerrainGenerator;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use reactocraft_native_worldgen::CHUNK_VOLUME;
use reactocraft_protocol::ChunkCoordinate;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

/// Sizing and failure policy for a [`GenerationPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Dedicated generation threads.
    pub workers: usize,
    /// Jobs that may wait for a free worker before submissions fail.
    pub queue_capacity: usize,
    /// Upper bound on a single attempt, measured from submission.
    pub timeout: Duration,
    /// Total attempts made by [`GenerationPool::generate_with_retry`].
    pub attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 256,
            timeout: Duration::from_secs(5),
            attempts: 2,
        }
    }
}

struct Job {
    coord: ChunkCoordinate,
    seed: u64,
    reply: oneshot::Sender<Result<Vec<u8>, GenerationError>>,
}

/// Fixed set of OS threads running a [`TerrainGenerator`].
///
/// The thread count is independent of how many clients are connected.
/// Dropping the pool closes the queue; workers finish their current job
/// and exit.
pub struct GenerationPool {
    jobs: Sender<Job>,
    config: PoolConfig,
    description: String,
}

impl GenerationPool {
    pub fn new(generator: Arc<dyn TerrainGenerator>, config: PoolConfig) -> io::Result<Self> {
        let (jobs, queue) = bounded::<Job>(config.queue_capacity.max(1));
        let description = generator.describe();

        for index in 0..config.workers.max(1) {
            let queue = queue.clone();
            let generator = Arc::clone(&generator);
            thread::Builder::new()
                .name(format!("worldgen-{index}"))
                .spawn(move || worker_loop(generator.as_ref(), queue))?;
        }

        tracing::info!(
            workers = config.workers.max(1),
            generator = %description,
            "generation pool started"
        );

        Ok(Self {
            jobs,
            config,
            description,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// One attempt, without a timeout.
    pub async fn generate(
        &self,
        coord: ChunkCoordinate,
        seed: u64,
    ) -> Result<Vec<u8>, GenerationError> {
        let (reply, response) = oneshot::channel();
        match self.jobs.try_send(Job { coord, seed, reply }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(GenerationError::QueueFull),
            Err(TrySendError::Disconnected(_)) => return Err(GenerationError::PoolClosed),
        }
        response.await.map_err(|_| GenerationError::PoolClosed)?
    }

    /// Generate with the configured per-attempt timeout, retrying failures
    /// until the attempt budget is spent.
    pub async fn generate_with_retry(
        &self,
        coord: ChunkCoordinate,
        seed: u64,
    ) -> Result<Vec<u8>, GenerationError> {
        let attempts = self.config.attempts.max(1);
        let mut last = GenerationError::PoolClosed;

        for attempt in 1..=attempts {
            let outcome = tokio::time::timeout(self.config.timeout, self.generate(coord, seed))
                .await
                .unwrap_or(Err(GenerationError::Timeout(self.config.timeout)));

            match outcome {
                Ok(blocks) => return Ok(blocks),
                Err(err) => {
                    tracing::warn!(%coord, attempt, error = %err, "terrain generation attempt failed");
                    last = err;
                }
            }
        }

        Err(GenerationError::Exhausted {
            attempts,
            last: Box::new(last),
        })
    }
}

fn worker_loop(generator: &dyn TerrainGenerator, queue: Receiver<Job>) {
    while let Ok(job) = queue.recv() {
        // Requester already gave up (timeout or cancellation).
        if job.reply.is_closed() {
            continue;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            generator.generate(job.coord, job.seed)
        }))
        .unwrap_or_else(|payload| Err(GenerationError::Panicked(panic_message(payload.as_ref()))))
        .and_then(|blocks| {
            if blocks.len() == CHUNK_VOLUME {
                Ok(blocks)
            } else {
                Err(GenerationError::WrongSize {
                    expected: CHUNK_VOLUME,
                    actual: blocks.len(),
                })
            }
        });

        let _ = job.reply.send(result);
    }
    tracing::debug!("generation worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
