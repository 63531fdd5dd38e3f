// transcription/provider.rs
//
// Defines the synchronous InferenceEngine trait the worker drives, plus the
// error and result types shared by every engine implementation.

use thiserror::Error;

// ============================================================================
// INFERENCE ENGINE TRAIT & ERROR TYPES
// ============================================================================

/// Granular error types for transcription operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TranscriptionError {
    #[error("No transcription model is loaded")]
    ModelNotLoaded,
    #[error("Audio too short: {samples} samples (minimum {minimum})")]
    AudioTooShort { samples: usize, minimum: usize },
    #[error("Transcription engine failed: {0}")]
    EngineFailed(String),
    #[error("Transcription engine panicked: {0}")]
    EnginePanicked(String),
}

/// Unified transcription result across all engines
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptResult {
    pub text: String,
    pub confidence: Option<f32>, // None if the engine doesn't report confidence
}

impl TranscriptResult {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }
}

/// Compute-bound speech-to-text engine.
///
/// The worker scheduler owns exactly one instance and calls it from a single
/// thread, so implementations take `&mut self` and need no internal locking.
///
/// # Arguments
/// * `audio` - Audio samples (16kHz mono, f32 normalized to [-1, 1])
pub trait InferenceEngine: Send + 'static {
    /// Transcribe audio samples to text
    fn transcribe(&mut self, audio: &[f32]) -> Result<TranscriptResult, TranscriptionError>;

    /// Get the engine name (for logging/debugging)
    fn provider_name(&self) -> &'static str {
        "engine"
    }
}

/// Closures make convenient stub engines for tests and the `simulate` command.
impl<F> InferenceEngine for F
where
    F: FnMut(&[f32]) -> Result<String, TranscriptionError> + Send + 'static,
{
    fn transcribe(&mut self, audio: &[f32]) -> Result<TranscriptResult, TranscriptionError> {
        self(audio).map(TranscriptResult::new)
    }

    fn provider_name(&self) -> &'static str {
        "closure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_engine_wraps_text() {
        let mut engine = |audio: &[f32]| Ok::<_, TranscriptionError>(format!("{} samples", audio.len()));
        let result = engine.transcribe(&[0.0; 4]).unwrap();
        assert_eq!(result.text, "4 samples");
        assert_eq!(result.confidence, None);
    }

    #[test]
    fn test_error_messages() {
        let err = TranscriptionError::AudioTooShort {
            samples: 0,
            minimum: 1600,
        };
        assert_eq!(err.to_string(), "Audio too short: 0 samples (minimum 1600)");
        assert_eq!(
            TranscriptionError::EngineFailed("oom".into()).to_string(),
            "Transcription engine failed: oom"
        );
    }
}
