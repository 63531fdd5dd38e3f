// Connection lifecycle on the async side: the handler owns the registry and
// the worker, each session owns one connection's queue handle and result
// stream.

use crate::audio::{chunk_waveform, ChunkingConfig};
use crate::config::WorkerConfig;
use crate::transcription::{
    ChunkMeta, ConnectionRegistry, ConnectionStatus, InferenceEngine, QueueHandle, ResultSink,
    SchedulerStats, SubmitError, TranscriptUpdate, TranscriptionRequest, WorkerError,
    WorkerScheduler,
};
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transport-side consumer of a connection's transcripts (e.g. a websocket)
#[async_trait]
pub trait TranscriptSink: Send + 'static {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()>;
}

/// Entry point for transports: opens sessions against one shared worker.
///
/// Dropping the handler signals the worker and returns at once; the worker
/// thread exits after its in-flight request. Use [`shutdown`](Self::shutdown)
/// to wait for it.
pub struct TranscriptionHandler {
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<WorkerScheduler>,
    chunking: ChunkingConfig,
}

impl TranscriptionHandler {
    /// Build the registry and worker, and start the worker.
    pub fn new(engine: impl InferenceEngine, config: &WorkerConfig) -> Result<Self, WorkerError> {
        let registry = Arc::new(ConnectionRegistry::new(config.queue_capacity));
        let scheduler = Arc::new(WorkerScheduler::new(
            engine,
            Arc::clone(&registry),
            config.idle_backoff(),
        ));
        scheduler.start()?;

        Ok(Self {
            registry,
            scheduler,
            chunking: config.chunking,
        })
    }

    /// Open a session under a fresh UUID
    pub fn open_session(&self) -> Session {
        self.open_session_with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Open (or re-attach to) the connection with the given id.
    ///
    /// Re-attaching shares the existing queue; only the returned session's
    /// results go to the new receiver. The connection stays registered until
    /// every session attached to it has closed.
    pub fn open_session_with_id(&self, id: impl Into<String>) -> Session {
        let id = id.into();
        let queue = self.registry.attach(&id);
        let (sink, results) = ResultSink::channel(id.as_str());
        info!("🎙️ Opened transcription session {}", id);

        Session {
            id,
            queue,
            sink: Some(sink),
            results: Some(results),
            registry: Arc::clone(&self.registry),
            chunking: self.chunking,
            next_chunk_index: 0,
            samples_submitted: 0,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Stop the worker without blocking the runtime
    pub async fn shutdown(&self) {
        let scheduler = Arc::clone(&self.scheduler);
        if let Err(e) = tokio::task::spawn_blocking(move || scheduler.stop()).await {
            error!("Failed to join transcription worker shutdown: {}", e);
        }
    }
}

/// One client connection: submits audio, receives transcripts in order.
pub struct Session {
    id: String,
    queue: QueueHandle,
    sink: Option<ResultSink>,
    results: Option<mpsc::UnboundedReceiver<TranscriptUpdate>>,
    registry: Arc<ConnectionRegistry>,
    chunking: ChunkingConfig,
    next_chunk_index: u64,
    samples_submitted: u64,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.queue.status()
    }

    /// Queue one decoded chunk (mono, model sample rate). Returns its index.
    pub fn submit(&mut self, audio: Vec<f32>) -> Result<u64, SubmitError> {
        let start_time = self.samples_submitted as f64 / self.chunking.sample_rate.max(1) as f64;
        let len = audio.len() as u64;
        let index = self.enqueue(audio, start_time)?;
        self.samples_submitted += len;
        Ok(index)
    }

    /// Split a whole waveform into overlapping windows and queue each one.
    ///
    /// Rejected windows are logged and skipped; the rest still go through.
    /// Returns the number of windows accepted.
    pub fn submit_waveform(&mut self, samples: &[f32]) -> usize {
        let base_time = self.samples_submitted as f64 / self.chunking.sample_rate.max(1) as f64;
        let shift_secs = self.chunking.shift_secs();
        let chunks = chunk_waveform(samples, &self.chunking);
        let total = chunks.len();

        let mut accepted = 0;
        for (i, chunk) in chunks.into_iter().enumerate() {
            match self.enqueue(chunk, base_time + i as f64 * shift_secs) {
                Ok(_) => accepted += 1,
                Err(e) => error!("Failed to enqueue the transcription request: {}", e),
            }
        }
        self.samples_submitted += samples.len() as u64;

        if accepted < total {
            warn!(
                "Session {}: {}/{} audio chunks queued, {} dropped",
                self.id,
                accepted,
                total,
                total - accepted
            );
        }
        accepted
    }

    fn enqueue(&mut self, audio: Vec<f32>, audio_start_time: f64) -> Result<u64, SubmitError> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| SubmitError::ConnectionClosed(self.id.clone()))?;

        let meta = ChunkMeta {
            chunk_index: self.next_chunk_index,
            audio_start_time,
            sample_rate: self.chunking.sample_rate,
        };
        self.queue
            .submit(TranscriptionRequest::new(audio, meta, sink.clone()))?;
        self.next_chunk_index += 1;
        Ok(meta.chunk_index)
    }

    /// Next transcript for this session. `None` once the session is closed and
    /// every outstanding result has been drained, or after `forward_to`.
    pub async fn recv(&mut self) -> Option<TranscriptUpdate> {
        match self.results.as_mut() {
            Some(results) => results.recv().await,
            None => None,
        }
    }

    /// Hand the result stream to a background task that pushes each
    /// transcript into `sink`. A failed send is logged and forwarding carries
    /// on with the next transcript.
    pub fn forward_to<S: TranscriptSink>(&mut self, mut sink: S) -> Option<JoinHandle<S>> {
        let mut results = self.results.take()?;
        let id = self.id.clone();

        Some(tokio::spawn(async move {
            while let Some(update) = results.recv().await {
                if let Err(e) = sink.send_text(&update.text).await {
                    error!("Session {}: failed to send transcript {}: {}", id, update.sequence_id, e);
                }
            }
            info!("Session {} result stream finished", id);
            sink
        }))
    }

    /// Detach from the connection, unregistering it if this was the last
    /// attached session. Requests already inside the worker finish; their
    /// results are still delivered to `recv`/`forward_to` if the receiver is
    /// alive.
    pub fn close(&mut self) {
        if self.sink.take().is_none() {
            return;
        }
        if self.registry.detach(&self.queue) {
            info!("Closed transcription session {}", self.id);
        } else {
            info!(
                "Closed transcription session {}, connection kept for other sessions",
                self.id
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::TranscriptionError;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            queue_capacity: 8,
            idle_backoff_min_ms: 1,
            idle_backoff_max_ms: 5,
            ..WorkerConfig::default()
        }
    }

    /// Stub engine: the first sample encodes which connection sent the chunk
    fn identity_engine() -> impl InferenceEngine {
        |audio: &[f32]| match audio.first().copied() {
            Some(x) if x == 1.0 => Ok("transcript-A".to_string()),
            Some(x) if x == 2.0 => Ok("transcript-B".to_string()),
            _ => Err(TranscriptionError::AudioTooShort {
                samples: audio.len(),
                minimum: 1,
            }),
        }
    }

    async fn next(session: &mut Session) -> TranscriptUpdate {
        timeout(Duration::from_secs(2), session.recv())
            .await
            .expect("timed out waiting for transcript")
            .expect("result stream closed")
    }

    #[derive(Clone, Default)]
    struct CollectingSink {
        sent: Arc<Mutex<Vec<String>>>,
        fail_first: bool,
    }

    #[async_trait]
    impl TranscriptSink for CollectingSink {
        async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
            if self.fail_first {
                self.fail_first = false;
                anyhow::bail!("socket hiccup");
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_two_connections_get_their_own_text() {
        let handler = TranscriptionHandler::new(identity_engine(), &fast_config()).unwrap();
        let mut a = handler.open_session();
        let mut b = handler.open_session();
        assert_ne!(a.id(), b.id());

        b.submit(vec![2.0; 160]).unwrap();
        a.submit(vec![1.0; 160]).unwrap();

        let update_a = next(&mut a).await;
        let update_b = next(&mut b).await;
        assert_eq!(update_a.text, "transcript-A");
        assert_eq!(update_a.connection_id, a.id());
        assert_eq!(update_b.text, "transcript-B");
        assert_eq!(update_b.connection_id, b.id());

        handler.shutdown().await;
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn test_results_arrive_in_submission_order() {
        let engine = |audio: &[f32]| Ok::<_, TranscriptionError>(format!("o{}", audio[0] as u32));
        let handler = TranscriptionHandler::new(engine, &fast_config()).unwrap();
        let mut a = handler.open_session();
        let mut b = handler.open_session();

        for i in 1..=3u32 {
            a.submit(vec![i as f32; 16]).unwrap();
            b.submit(vec![(i + 10) as f32; 16]).unwrap();
        }

        let mut texts = Vec::new();
        for _ in 0..3 {
            let update = next(&mut a).await;
            texts.push((update.sequence_id, update.chunk_index, update.text));
        }
        assert_eq!(
            texts,
            vec![
                (0, 0, "o1".to_string()),
                (1, 1, "o2".to_string()),
                (2, 2, "o3".to_string())
            ]
        );
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_tracks_audio_offsets() {
        let engine = |_: &[f32]| Ok::<_, TranscriptionError>("x".to_string());
        let handler = TranscriptionHandler::new(engine, &fast_config()).unwrap();
        let mut session = handler.open_session();

        session.submit(vec![0.0; 16000]).unwrap();
        session.submit(vec![0.0; 8000]).unwrap();

        let first = next(&mut session).await;
        let second = next(&mut session).await;
        assert_eq!((first.audio_start_time, first.audio_end_time), (0.0, 1.0));
        assert_eq!((second.audio_start_time, second.audio_end_time), (1.0, 1.5));
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_reports_rejection() {
        let engine = |_: &[f32]| Ok::<_, TranscriptionError>("x".to_string());
        let config = WorkerConfig {
            queue_capacity: 2,
            ..fast_config()
        };
        let handler = TranscriptionHandler::new(engine, &config).unwrap();
        // Stop the worker so nothing drains the queue
        handler.shutdown().await;

        let mut session = handler.open_session();
        session.submit(vec![0.0; 4]).unwrap();
        session.submit(vec![0.0; 4]).unwrap();
        let err = session.submit(vec![0.0; 4]).unwrap_err();
        assert!(matches!(err, SubmitError::QueueFull { capacity: 2, .. }));
    }

    #[tokio::test]
    async fn test_submit_waveform_chunks_with_overlap() {
        let engine = |audio: &[f32]| Ok::<_, TranscriptionError>(format!("{}", audio.len()));
        let config = WorkerConfig {
            chunking: ChunkingConfig {
                sample_rate: 100,
                chunk_duration_secs: 3,
                chunk_overlap_secs: 1,
            },
            ..fast_config()
        };
        let handler = TranscriptionHandler::new(engine, &config).unwrap();
        let mut session = handler.open_session();

        // 5s at 100Hz, 2s shift -> windows at 0s, 2s, 4s
        assert_eq!(session.submit_waveform(&[0.1; 500]), 3);

        let mut updates = Vec::new();
        for _ in 0..3 {
            updates.push(next(&mut session).await);
        }
        let summary: Vec<(String, f64)> = updates
            .into_iter()
            .map(|u| (u.text, u.audio_start_time))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("300".to_string(), 0.0),
                ("300".to_string(), 2.0),
                ("100".to_string(), 4.0)
            ]
        );
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_unregisters_and_rejects_further_audio() {
        let handler = TranscriptionHandler::new(identity_engine(), &fast_config()).unwrap();
        let mut session = handler.open_session();
        let id = session.id().to_string();
        assert!(handler.registry().get(&id).is_some());

        session.close();
        session.close();

        assert!(handler.registry().get(&id).is_none());
        assert_eq!(session.status(), ConnectionStatus::Closed);
        assert_eq!(
            session.submit(vec![1.0; 16]).unwrap_err(),
            SubmitError::ConnectionClosed(id)
        );
        // No sender left, so the stream ends instead of hanging
        assert!(timeout(Duration::from_secs(1), session.recv()).await.unwrap().is_none());
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_reattached_sessions_keep_shared_connection_open() {
        let handler = TranscriptionHandler::new(identity_engine(), &fast_config()).unwrap();
        let mut s1 = handler.open_session_with_id("shared");
        let s2 = handler.open_session_with_id("shared");
        drop(s2);

        assert_eq!(s1.status(), ConnectionStatus::Active);
        assert!(handler.registry().get("shared").is_some());
        s1.submit(vec![1.0; 16]).unwrap();
        assert_eq!(next(&mut s1).await.text, "transcript-A");

        s1.close();
        assert_eq!(s1.status(), ConnectionStatus::Closed);
        assert!(handler.registry().get("shared").is_none());
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropping_handler_does_not_block_runtime() {
        let engine = |_: &[f32]| {
            std::thread::sleep(Duration::from_millis(400));
            Ok::<_, TranscriptionError>("slow".to_string())
        };
        let handler = TranscriptionHandler::new(engine, &fast_config()).unwrap();
        let mut session = handler.open_session();
        session.submit(vec![0.0; 16]).unwrap();
        // Give the worker time to pick the chunk up
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        drop(handler);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(next(&mut session).await.text, "slow");
    }

    #[tokio::test]
    async fn test_dropped_session_does_not_stall_others() {
        let handler = TranscriptionHandler::new(identity_engine(), &fast_config()).unwrap();
        {
            let mut gone = handler.open_session();
            gone.submit(vec![1.0; 16]).unwrap();
        }
        let mut b = handler.open_session();
        b.submit(vec![2.0; 16]).unwrap();

        assert_eq!(next(&mut b).await.text, "transcript-B");
        assert_eq!(handler.registry().len(), 1);
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_forward_to_keeps_going_after_send_error() {
        let engine = |audio: &[f32]| Ok::<_, TranscriptionError>(format!("o{}", audio[0] as u32));
        let handler = TranscriptionHandler::new(engine, &fast_config()).unwrap();
        let mut session = handler.open_session();

        let sink = CollectingSink {
            fail_first: true,
            ..CollectingSink::default()
        };
        let sent = Arc::clone(&sink.sent);
        let forwarder = session.forward_to(sink).unwrap();
        assert!(session.forward_to(CollectingSink::default()).is_none());

        for i in 1..=3u32 {
            session.submit(vec![i as f32; 16]).unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while sent.lock().unwrap().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Closing drops the last sender once the worker is done with it
        session.close();
        timeout(Duration::from_secs(2), forwarder).await.unwrap().unwrap();

        assert_eq!(*sent.lock().unwrap(), vec!["o2".to_string(), "o3".to_string()]);
        handler.shutdown().await;
    }
}
