// transcription/dispatcher.rs
//
// Result hand-off from the worker thread to the tokio side. The worker never
// calls consumer code: it posts a TranscriptUpdate onto the connection's own
// unbounded channel and moves on.

use super::provider::TranscriptResult;
use super::registry::ChunkMeta;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TranscriptUpdate {
    pub connection_id: String,
    pub text: String,
    pub sequence_id: u64, // Per-connection, assigned in delivery order
    pub chunk_index: u64,
    pub confidence: Option<f32>,
    pub audio_start_time: f64, // Seconds from session start
    pub audio_end_time: f64,
    pub duration: f64,
}

/// Outcome of a single delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Receiver is gone (connection closed). Not an error for the worker.
    Unreachable,
}

/// Outbound half of a connection's result stream.
///
/// Cloned into every request so a request popped before its connection closes
/// still has somewhere to (try to) deliver.
#[derive(Clone)]
pub struct ResultSink {
    connection_id: Arc<str>,
    sender: mpsc::UnboundedSender<TranscriptUpdate>,
    next_sequence: Arc<AtomicU64>,
}

impl ResultSink {
    /// Create the sink and the receiver the async side drains
    pub fn channel(
        connection_id: impl Into<Arc<str>>,
    ) -> (Self, mpsc::UnboundedReceiver<TranscriptUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                connection_id: connection_id.into(),
                sender,
                next_sequence: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Post a finished transcript to the connection's result stream.
///
/// Returns immediately. Called only from the worker thread, so sequence ids
/// for one connection follow processing order.
pub fn deliver(
    sink: &ResultSink,
    meta: &ChunkMeta,
    sample_count: usize,
    result: TranscriptResult,
) -> Delivery {
    if sink.is_closed() {
        debug!(
            "Connection {} is gone, dropping transcript for chunk {}",
            sink.connection_id, meta.chunk_index
        );
        return Delivery::Unreachable;
    }

    let duration = if meta.sample_rate > 0 {
        sample_count as f64 / meta.sample_rate as f64
    } else {
        0.0
    };

    let update = TranscriptUpdate {
        connection_id: sink.connection_id.to_string(),
        text: result.text,
        sequence_id: sink.next_sequence.fetch_add(1, Ordering::SeqCst),
        chunk_index: meta.chunk_index,
        confidence: result.confidence,
        audio_start_time: meta.audio_start_time,
        audio_end_time: meta.audio_start_time + duration,
        duration,
    };

    match sink.sender.send(update) {
        Ok(()) => Delivery::Delivered,
        Err(_) => {
            debug!(
                "Connection {} closed during delivery of chunk {}, dropping transcript",
                sink.connection_id, meta.chunk_index
            );
            Delivery::Unreachable
        }
    }
}
