// transcription/mod.rs
//
// Transcription module: engine abstraction, connection registry, the single
// worker scheduler, and result hand-off back to the async side.

pub mod dispatcher;
pub mod provider;
pub mod registry;
pub mod worker;

// Re-export commonly used types
pub use dispatcher::{deliver, Delivery, ResultSink, TranscriptUpdate};
pub use provider::{InferenceEngine, TranscriptResult, TranscriptionError};
pub use registry::{
    ChunkMeta, Connection, ConnectionRegistry, ConnectionStatus, QueueHandle, SubmitError,
    TranscriptionRequest,
};
pub use worker::{IdleBackoff, SchedulerStats, WorkerError, WorkerScheduler};
