use serde::{Deserialize, Serialize};

/// Fixed-window chunking with overlap, sized for the model's context window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub sample_rate: u32,
    pub chunk_duration_secs: u32,
    pub chunk_overlap_secs: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            sample_rate: super::MODEL_SAMPLE_RATE,
            chunk_duration_secs: 15,
            chunk_overlap_secs: 1,
        }
    }
}

impl ChunkingConfig {
    pub fn chunk_samples(&self) -> usize {
        self.sample_rate as usize * self.chunk_duration_secs as usize
    }

    /// Distance between consecutive window starts
    pub fn shift_samples(&self) -> usize {
        let shift_secs = self
            .chunk_duration_secs
            .saturating_sub(self.chunk_overlap_secs);
        if shift_secs == 0 {
            // Overlap >= window: fall back to back-to-back windows
            self.chunk_samples()
        } else {
            self.sample_rate as usize * shift_secs as usize
        }
    }

    pub fn shift_secs(&self) -> f64 {
        self.shift_samples() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Split a mono waveform into overlapping windows.
///
/// Produces `ceil(len / shift)` windows; the tail window may be shorter than
/// the others. Empty input produces no windows.
pub fn chunk_waveform(samples: &[f32], config: &ChunkingConfig) -> Vec<Vec<f32>> {
    let chunk = config.chunk_samples();
    let shift = config.shift_samples();
    if samples.is_empty() || chunk == 0 {
        return Vec::new();
    }

    let count = samples.len().div_ceil(shift);
    (0..count)
        .map(|i| {
            let start = i * shift;
            let end = (start + chunk).min(samples.len());
            samples[start..end].to_vec()
        })
        .collect()
}
