//! Live captions transcript server.
//!
//! Many audio connections feed one serialized inference worker; each
//! connection gets its transcripts back, in order, on its own stream.

pub mod audio;
pub mod config;
pub mod session;
pub mod transcription;

pub use config::WorkerConfig;
pub use session::{Session, TranscriptSink, TranscriptionHandler};
pub use transcription::{
    ConnectionRegistry, InferenceEngine, SchedulerStats, SubmitError, TranscriptResult,
    TranscriptUpdate, TranscriptionError, WorkerScheduler,
};
