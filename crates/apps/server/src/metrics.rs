use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Server-wide counters, shared by every task.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub open_connections: AtomicU64,
    pub active_sessions: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub cache_hits: AtomicU64,
    pub storage_loads: AtomicU64,
    pub chunks_generated: AtomicU64,
    pub generation_failures: AtomicU64,
    pub chunks_saved: AtomicU64,
    pub partial_saves: AtomicU64,
    pub chunks_unloaded: AtomicU64,
    pub backpressure_drops: AtomicU64,
    pub kicks: AtomicU64,
    pub resyncs: AtomicU64,
    pub protocol_violations: AtomicU64,
}

impl ServerMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    fn entries(&self) -> [(&'static str, &'static str, &'static str, u64); 17] {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        [
            ("open_connections", "gauge", "Open TCP connections", load(&self.open_connections)),
            ("active_sessions", "gauge", "Logged-in sessions", load(&self.active_sessions)),
            ("packets_received", "counter", "Packets decoded from clients", load(&self.packets_received)),
            ("packets_sent", "counter", "Packets queued to clients", load(&self.packets_sent)),
            ("bytes_received", "counter", "Bytes read from sockets", load(&self.bytes_received)),
            ("bytes_sent", "counter", "Bytes written to sockets", load(&self.bytes_sent)),
            ("chunk_cache_hits", "counter", "Chunk resolutions served from the cache", load(&self.cache_hits)),
            ("chunk_storage_loads", "counter", "Chunks loaded from storage", load(&self.storage_loads)),
            ("chunks_generated", "counter", "Chunks produced by the terrain generator", load(&self.chunks_generated)),
            ("generation_failures", "counter", "Chunks that failed every generation attempt", load(&self.generation_failures)),
            ("chunks_saved", "counter", "Chunk snapshots written to storage", load(&self.chunks_saved)),
            ("partial_saves", "counter", "Chunks saved as a list of changed blocks", load(&self.partial_saves)),
            ("chunks_unloaded", "counter", "Chunks evicted from the cache", load(&self.chunks_unloaded)),
            ("backpressure_drops", "counter", "World updates dropped on full queues", load(&self.backpressure_drops)),
            ("backpressure_kicks", "counter", "Sessions disconnected for backpressure", load(&self.kicks)),
            ("resyncs", "counter", "Resync packets sent after dropped updates", load(&self.resyncs)),
            ("protocol_violations", "counter", "Connections closed for protocol violations", load(&self.protocol_violations)),
        ]
    }

    /// Prometheus text exposition of every counter.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, kind, help, value) in self.entries() {
            out.push_str(&format!(
                "# HELP reactocraft_{name} {help}\n# TYPE reactocraft_{name} {kind}\nreactocraft_{name} {value}\n\n"
            ));
        }
        out
    }

    /// Log a one-line summary.
    pub fn print_stats(&self) {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        tracing::info!(
            "Connections: {} | Sessions: {} | Pkts In: {} | Pkts Out: {} | Cache Hits: {} | Loaded: {} | Generated: {} | Gen Failures: {} | Drops: {} | Kicks: {}",
            load(&self.open_connections),
            load(&self.active_sessions),
            load(&self.packets_received),
            load(&self.packets_sent),
            load(&self.cache_hits),
            load(&self.storage_loads),
            load(&self.chunks_generated),
            load(&self.generation_failures),
            load(&self.backpressure_drops),
            load(&self.kicks),
        );
    }
}

/// Start metrics reporting task. The full exposition goes out on the
/// `reactocraft::metrics` target at debug level.
pub async fn start_metrics_reporter(metrics: Arc<ServerMetrics>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        interval.tick().await;
        metrics.print_stats();
        tracing::debug!(target: "reactocraft::metrics", "\n{}", metrics.to_prometheus());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_output_lists_counters() {
        let metrics = ServerMetrics::default();
        ServerMetrics::incr(&metrics.cache_hits);
        ServerMetrics::add(&metrics.bytes_sent, 512);

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE reactocraft_open_connections gauge"));
        assert!(text.contains("reactocraft_chunk_cache_hits 1\n"));
        assert!(text.contains("reactocraft_bytes_sent 512\n"));
        assert!(text.contains("# TYPE reactocraft_resyncs counter"));
        assert!(text.contains("reactocraft_partial_saves 0\n"));
    }
}
