// Worker configuration, loaded from a JSON file with defaults for every field.

use crate::audio::ChunkingConfig;
use crate::transcription::IdleBackoff;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Pending chunks allowed per connection before submissions are rejected
    pub queue_capacity: usize,
    pub idle_backoff_min_ms: u64,
    pub idle_backoff_max_ms: u64,
    pub chunking: ChunkingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let backoff = IdleBackoff::default();
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_backoff_min_ms: backoff.min.as_millis() as u64,
            idle_backoff_max_ms: backoff.max.as_millis() as u64,
            chunking: ChunkingConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid worker config in {}", path.display()))?;
        config.validate()?;
        log::info!("Loaded worker config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.idle_backoff_min_ms == 0 {
            bail!("idle_backoff_min_ms must be at least 1 so an idle worker sleeps");
        }
        if self.idle_backoff_min_ms > self.idle_backoff_max_ms {
            bail!(
                "idle_backoff_min_ms ({}) exceeds idle_backoff_max_ms ({})",
                self.idle_backoff_min_ms,
                self.idle_backoff_max_ms
            );
        }
        if self.chunking.sample_rate == 0 || self.chunking.chunk_duration_secs == 0 {
            bail!("chunking.sample_rate and chunking.chunk_duration_secs must be non-zero");
        }
        if self.chunking.chunk_overlap_secs >= self.chunking.chunk_duration_secs {
            bail!(
                "chunk_overlap_secs ({}) must be shorter than chunk_duration_secs ({})",
                self.chunking.chunk_overlap_secs,
                self.chunking.chunk_duration_secs
            );
        }
        Ok(())
    }

    pub fn idle_backoff(&self) -> IdleBackoff {
        IdleBackoff {
            min: Duration::from_millis(self.idle_backoff_min_ms),
            max: Duration::from_millis(self.idle_backoff_max_ms),
        }
    }
}
