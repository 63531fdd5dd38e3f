// transcription/registry.rs
//
// Connection registry: one bounded inbound request queue per live connection,
// shared between the session tasks (register/unregister/submit) and the worker
// thread (snapshot/try_pop).

use super::dispatcher::ResultSink;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Reasons a chunk could not be placed on a connection's queue
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Request queue for connection '{connection_id}' is full (capacity {capacity})")]
    QueueFull {
        connection_id: String,
        capacity: usize,
    },
    #[error("Connection '{0}' is closed")]
    ConnectionClosed(String),
}

/// Lifecycle status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Closing,
    Closed,
}

impl ConnectionStatus {
    fn as_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Closing => 1,
            Self::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Per-chunk metadata carried alongside the samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkMeta {
    pub chunk_index: u64,
    pub audio_start_time: f64, // Seconds from session start
    pub sample_rate: u32,
}

/// A single unit of work for the worker. Consumed exactly once.
pub struct TranscriptionRequest {
    pub audio: Vec<f32>,
    pub meta: ChunkMeta,
    pub(crate) sink: ResultSink,
}

impl TranscriptionRequest {
    pub fn new(audio: Vec<f32>, meta: ChunkMeta, sink: ResultSink) -> Self {
        Self { audio, meta, sink }
    }

    pub fn connection_id(&self) -> &str {
        self.sink.connection_id()
    }
}

impl std::fmt::Debug for TranscriptionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionRequest")
            .field("connection_id", &self.connection_id())
            .field("samples", &self.audio.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// A registered connection and its inbound request queue
pub struct Connection {
    id: String,
    sender: Sender<TranscriptionRequest>,
    receiver: Receiver<TranscriptionRequest>,
    capacity: usize,
    status: AtomicU8,
    attachments: AtomicUsize, // Sessions currently holding this connection open
    registration_seq: u64,
}

/// Shared handle to a connection's queue. Clones point at the same queue.
pub type QueueHandle = Arc<Connection>;

impl Connection {
    fn new(id: String, capacity: usize, registration_seq: u64) -> Self {
        let (sender, receiver) = channel::bounded(capacity);
        Self {
            id,
            sender,
            receiver,
            capacity,
            status: AtomicU8::new(ConnectionStatus::Active.as_u8()),
            attachments: AtomicUsize::new(0),
            registration_seq,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests waiting for the worker
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Number of sessions attached through [`ConnectionRegistry::attach`]
    pub fn attachments(&self) -> usize {
        self.attachments.load(Ordering::Acquire)
    }

    /// Enqueue a request without blocking. A full queue rejects the request.
    pub fn submit(&self, request: TranscriptionRequest) -> Result<(), SubmitError> {
        if self.status() != ConnectionStatus::Active {
            return Err(SubmitError::ConnectionClosed(self.id.clone()));
        }

        match self.sender.try_send(request) {
            // unregister may have closed and drained the queue between the
            // status check and the send; nothing scans it any more
            Ok(()) if self.status() != ConnectionStatus::Active => {
                self.drain();
                Err(SubmitError::ConnectionClosed(self.id.clone()))
            }
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull {
                connection_id: self.id.clone(),
                capacity: self.capacity,
            }),
            // The connection owns both ends, so this only happens mid-teardown
            Err(TrySendError::Disconnected(_)) => {
                Err(SubmitError::ConnectionClosed(self.id.clone()))
            }
        }
    }

    /// Pop at most one pending request. Never blocks.
    pub fn try_pop(&self) -> Option<TranscriptionRequest> {
        match self.receiver.try_recv() {
            Ok(request) => Some(request),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .field("capacity", &self.capacity)
            .field("status", &self.status())
            .finish()
    }
}

/// Concurrent map of connection id -> queue handle.
///
/// Mutated from session tasks and scanned from the worker thread. The worker
/// never iterates the map directly: it works off [`ConnectionRegistry::snapshot`],
/// so no shard lock is held while inference runs.
pub struct ConnectionRegistry {
    connections: DashMap<String, QueueHandle>,
    next_registration: AtomicU64,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_registration: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Returns the queue for `id`, creating it on first use.
    pub fn register(&self, id: &str) -> QueueHandle {
        let entry = self.connections.entry(id.to_string()).or_insert_with(|| {
            let seq = self.next_registration.fetch_add(1, Ordering::Relaxed);
            info!("📥 Registered connection {} (capacity {})", id, self.queue_capacity);
            Arc::new(Connection::new(id.to_string(), self.queue_capacity, seq))
        });
        entry.value().clone()
    }

    /// Like [`register`](Self::register), but counts the caller as one more
    /// session holding the connection open. Pair with [`detach`](Self::detach).
    pub fn attach(&self, id: &str) -> QueueHandle {
        let entry = self.connections.entry(id.to_string()).or_insert_with(|| {
            let seq = self.next_registration.fetch_add(1, Ordering::Relaxed);
            info!("📥 Registered connection {} (capacity {})", id, self.queue_capacity);
            Arc::new(Connection::new(id.to_string(), self.queue_capacity, seq))
        });
        // Counted under the shard lock so a concurrent detach cannot remove it
        let attached = entry.value().attachments.fetch_add(1, Ordering::AcqRel) + 1;
        if attached > 1 {
            debug!("Connection {} now has {} attached sessions", id, attached);
        }
        entry.value().clone()
    }

    /// Drop one attachment. The connection is unregistered when the last
    /// attached session lets go; returns whether that happened. A connection
    /// that was already unregistered (or replaced under the same id) is left
    /// alone.
    pub fn detach(&self, connection: &QueueHandle) -> bool {
        let removed = self.connections.remove_if(connection.id(), |_, current| {
            Arc::ptr_eq(current, connection)
                && current.attachments.fetch_sub(1, Ordering::AcqRel) == 1
        });
        match removed {
            Some((id, connection)) => {
                connection.set_status(ConnectionStatus::Closing);
                Self::close_removed(&id, &connection);
                true
            }
            None => false,
        }
    }

    /// Removes the connection regardless of attached sessions. Requests still
    /// waiting in its queue are discarded; a request the worker already popped
    /// keeps its own sink and completes normally.
    pub fn unregister(&self, id: &str) {
        match self.connections.remove(id) {
            Some((_, connection)) => Self::close_removed(id, &connection),
            None => debug!("Unregister for unknown connection {} ignored", id),
        }
    }

    fn close_removed(id: &str, connection: &Connection) {
        connection.set_status(ConnectionStatus::Closed);
        let discarded = connection.drain();
        if discarded > 0 {
            warn!(
                "Connection {} unregistered with {} pending request(s), discarding",
                id, discarded
            );
        } else {
            info!("📤 Unregistered connection {}", id);
        }
    }

    pub fn get(&self, id: &str) -> Option<QueueHandle> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Stable copy of all connections, in registration order.
    pub fn snapshot(&self) -> Vec<(String, QueueHandle)> {
        let mut entries: Vec<(String, QueueHandle)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(_, connection)| connection.registration_seq);
        entries
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_QUEUE_CAPACITY)
    }
}
