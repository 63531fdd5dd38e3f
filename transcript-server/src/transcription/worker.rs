// transcription/worker.rs
//
// Single transcription worker: round-robins the connection registry and
// serializes every engine call onto one dedicated thread.

use super::dispatcher::{deliver, Delivery};
use super::provider::{InferenceEngine, TranscriptionError};
use super::registry::{ConnectionRegistry, TranscriptionRequest};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

const WORKER_THREAD_NAME: &str = "transcription-worker";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn transcription worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Inference engine was lost after a worker crash")]
    EngineUnavailable,
}

/// Sleep bounds used when a whole pass finds no pending work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleBackoff {
    pub min: Duration,
    pub max: Duration,
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1),
            max: Duration::from_millis(50),
        }
    }
}

impl IdleBackoff {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).clamp(self.min, self.max.max(self.min))
    }
}

#[derive(Debug, Default)]
struct Counters {
    passes: AtomicU64,
    idle_passes: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    delivered: AtomicU64,
    dropped_deliveries: AtomicU64,
}

/// Point-in-time view of the worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub passes: u64,
    pub idle_passes: u64,
    pub processed: u64,
    pub failed: u64,
    pub delivered: u64,
    pub dropped_deliveries: u64,
}

type EngineBox = Box<dyn InferenceEngine>;

/// Owns the one path into the inference engine.
///
/// `Stopped -> Running -> Stopped`. The engine lives on the worker thread while
/// running and comes back through the join handle on stop, so a stopped
/// scheduler can be started again.
pub struct WorkerScheduler {
    registry: Arc<ConnectionRegistry>,
    backoff: IdleBackoff,
    running: Arc<AtomicBool>,
    engine: Mutex<Option<EngineBox>>,
    handle: Mutex<Option<JoinHandle<EngineBox>>>,
    counters: Arc<Counters>,
}

impl WorkerScheduler {
    pub fn new(
        engine: impl InferenceEngine,
        registry: Arc<ConnectionRegistry>,
        backoff: IdleBackoff,
    ) -> Self {
        let engine: EngineBox = Box::new(engine);
        Self {
            registry,
            backoff,
            running: Arc::new(AtomicBool::new(false)),
            engine: Mutex::new(Some(engine)),
            handle: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the worker thread. No-op if it is already running.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            debug!("Transcription worker already running");
            return Ok(());
        }

        let engine = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(WorkerError::EngineUnavailable)?;

        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);
        let counters = Arc::clone(&self.counters);
        let backoff = self.backoff;

        self.running.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(engine, &registry, &running, &counters, backoff));

        match spawned {
            Ok(join_handle) => {
                *handle = Some(join_handle);
                Ok(())
            }
            Err(e) => {
                // The closure (and the engine with it) is gone at this point
                self.running.store(false, Ordering::Release);
                error!("Failed to spawn transcription worker: {}", e);
                Err(WorkerError::Spawn(e))
            }
        }
    }

    /// Ask the worker to stop and wait for it. Idempotent.
    ///
    /// The flag is observed between passes, so this blocks until the request
    /// currently inside the engine (if any) finishes. Async callers should go
    /// through `spawn_blocking`. Dropping the scheduler stops without waiting.
    pub fn stop(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        self.running.store(false, Ordering::Release);

        let Some(join_handle) = handle.take() else {
            return;
        };

        info!("🛑 Stopping transcription worker");
        match join_handle.join() {
            Ok(engine) => {
                *self.engine.lock().unwrap_or_else(PoisonError::into_inner) = Some(engine);
                info!("✅ Transcription worker stopped");
            }
            Err(e) => error!("❌ Transcription worker panicked: {:?}", e),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            passes: c.passes.load(Ordering::Relaxed),
            idle_passes: c.idle_passes.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped_deliveries: c.dropped_deliveries.load(Ordering::Relaxed),
        }
    }
}

/// Dropping signals the worker and detaches it without joining, so a drop on
/// an async runtime thread never waits on an inference call. The thread
/// finishes its in-flight request and exits on its own; the engine goes with
/// it. Call [`WorkerScheduler::stop`] to wait for it instead.
impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let handle = self.handle.get_mut().unwrap_or_else(PoisonError::into_inner);
        if handle.take().is_some() {
            debug!("Transcription worker detached on drop");
        }
    }
}

fn run_worker(
    mut engine: EngineBox,
    registry: &ConnectionRegistry,
    running: &AtomicBool,
    counters: &Counters,
    backoff: IdleBackoff,
) -> EngineBox {
    info!(
        "👷 Transcription worker started with {} engine",
        engine.provider_name()
    );

    let mut idle_sleep = backoff.min;

    while running.load(Ordering::Acquire) {
        counters.passes.fetch_add(1, Ordering::Relaxed);

        // One item per connection per pass keeps a busy connection from
        // starving the others.
        let mut handled = 0usize;
        for (_, queue) in registry.snapshot() {
            if let Some(request) = queue.try_pop() {
                handled += 1;
                process_request(engine.as_mut(), request, counters);
            }
        }

        if handled == 0 {
            counters.idle_passes.fetch_add(1, Ordering::Relaxed);
            thread::sleep(idle_sleep);
            idle_sleep = backoff.next(idle_sleep);
        } else {
            idle_sleep = backoff.min;
        }
    }

    info!("👷 Transcription worker exiting");
    engine
}

fn process_request(engine: &mut dyn InferenceEngine, request: TranscriptionRequest, counters: &Counters) {
    let TranscriptionRequest { audio, meta, sink } = request;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.transcribe(&audio)))
        .unwrap_or_else(|payload| Err(TranscriptionError::EnginePanicked(panic_message(&*payload))));

    let processed = counters.processed.fetch_add(1, Ordering::Relaxed) + 1;
    if processed % 10 == 0 {
        info!("Worker progress: {} requests processed", processed);
    }

    match outcome {
        Ok(result) => {
            match deliver(&sink, &meta, audio.len(), result) {
                Delivery::Delivered => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Unreachable => {
                    counters.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            match e {
                TranscriptionError::AudioTooShort { .. } => {
                    info!("Connection {} chunk {}: {}", sink.connection_id(), meta.chunk_index, e)
                }
                _ => warn!(
                    "Transcription failed for connection {} chunk {}: {}",
                    sink.connection_id(),
                    meta.chunk_index,
                    e
                ),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
