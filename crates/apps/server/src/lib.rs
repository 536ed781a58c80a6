//! ReactoCraft server core.
//!
//! - [`network`]: TCP listener, per-connection actors, the session registry
//!   and the world broadcaster.
//! - [`world`]: chunks, the LRU chunk cache, chunk files and the resolution
//!   pipeline in front of the terrain generator.
//! - [`events`]: listener hooks for embedding code.
//! - [`config`] and [`metrics`]: ambient plumbing shared by the binary.

pub mod config;
pub mod events;
pub mod metrics;
pub mod network;
pub mod world;

pub use config::{GeneratorBackend, ServerConfig, WorldConfig};
pub use events::{ChunkSource, EventHooks, ServerListener};
pub use metrics::ServerMetrics;
pub use network::{ConnectionError, Server, ServerError, SessionId};
pub use world::{ChunkPipeline, PipelineConfig, ResolveError, WorldDelta};
