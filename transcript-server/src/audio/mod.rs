// Audio helpers that operate on already-decoded mono samples.
pub mod chunker;

pub use chunker::{chunk_waveform, ChunkingConfig};

/// Sample rate every inference engine in this crate expects
pub const MODEL_SAMPLE_RATE: u32 = 16000;
