//! Engine tunables
//!
//! All limits and timeouts in one place, with the defaults the rest of the
//! engine assumes. Binaries may override individual fields from CLI flags
//! or environment variables before constructing the engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the whole engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bounded capacity of the single-writer channel
    pub write_queue_capacity: usize,

    /// Max ops coalesced into one writer transaction
    pub write_batch_size: usize,

    /// Max time the writer waits to fill a batch
    #[serde(with = "duration_ms")]
    pub write_batch_window: Duration,

    /// Retries per op on transient `busy`/`locked` contention
    pub write_max_retries: u32,

    /// Extractor worker pool size; defaults to logical cores
    pub max_parse_workers: usize,

    /// Per-file extractor timeout
    #[serde(with = "duration_ms")]
    pub parse_timeout: Duration,

    /// Max stale/unparsed files parsed per query
    pub max_parse_budget: usize,

    /// Overall query deadline
    #[serde(with = "duration_ms")]
    pub query_deadline: Duration,

    /// Max hops when closing entry repos over `depends_on`
    pub max_repo_hops: usize,

    /// Sparse overlay cap: changed files per PR context
    pub max_overlay_files: usize,

    /// Sparse overlay cap: persisted fact rows per PR context
    pub max_overlay_rows: usize,

    /// PR context TTL after last access
    #[serde(with = "duration_ms")]
    pub context_ttl: Duration,

    /// Interval between GC sweeps
    #[serde(with = "duration_ms")]
    pub gc_interval: Duration,

    /// Sync job lease duration
    #[serde(with = "duration_ms")]
    pub lease_ttl: Duration,

    /// Sync job attempts before dead-letter
    pub sync_max_attempts: u32,

    /// Number of sync worker tasks
    pub sync_workers: usize,

    /// Explicit extractor binary; `None` resolves `symdex-extractor` on PATH
    pub extractor_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_queue_capacity: 1024,
            write_batch_size: 64,
            write_batch_window: Duration::from_millis(25),
            write_max_retries: 5,
            max_parse_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            parse_timeout: Duration::from_secs(120),
            max_parse_budget: 15,
            query_deadline: Duration::from_secs(3),
            max_repo_hops: 4,
            max_overlay_files: 5_000,
            max_overlay_rows: 2_000_000,
            context_ttl: Duration::from_secs(72 * 3600),
            gc_interval: Duration::from_secs(600),
            lease_ttl: Duration::from_secs(60),
            sync_max_attempts: 5,
            sync_workers: 2,
            extractor_path: None,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.write_queue_capacity, 1024);
        assert_eq!(cfg.write_batch_size, 64);
        assert_eq!(cfg.max_parse_budget, 15);
        assert_eq!(cfg.max_overlay_files, 5_000);
        assert_eq!(cfg.max_overlay_rows, 2_000_000);
        assert_eq!(cfg.sync_max_attempts, 5);
    }

    #[test]
    fn durations_serialize_as_millis() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["write_batch_window"], 25);
        assert_eq!(json["query_deadline"], 3000);
    }
}
