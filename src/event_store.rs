//! Event store adapter contract and the in-memory reference implementation.
//!
//! The runtime never talks to a concrete store directly: the aggregate
//! instance and the application are written against the [`EventStore`]
//! trait. Production deployments plug in a durable adapter; tests and
//! embedded use run on [`InMemoryEventStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::command::Metadata;

/// Expected stream version for an optimistic-concurrency append.
///
/// A mismatch between the expectation and the stream's actual version
/// rejects the append with [`EventStoreError::WrongExpectedVersion`],
/// which the aggregate instance absorbs via its retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream must be at exactly this version.
    Exact(u64),
}

/// Infrastructure metadata stamped on every appended event.
///
/// `causation_id` is the UUID of the command that produced the event;
/// `correlation_id` groups all messages of one business transaction.
/// `custom` carries caller-provided entries merged from the dispatch
/// options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// UUID of the command that caused this event.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<Uuid>,
    /// UUID correlating this event with the wider business transaction.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<Uuid>,
    /// Caller-provided metadata entries.
    #[serde(default)]
    pub custom: Metadata,
}

/// An event proposed for appending, before the store assigns it a
/// position in the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Freshly generated UUID v4 event ID.
    pub event_id: Uuid,
    /// Event type tag (the `"type"` field of the adjacently tagged
    /// domain event).
    pub event_type: String,
    /// JSON payload (the `"data"` field; `Null` for fieldless variants).
    pub data: Value,
    /// Infrastructure metadata stamped on the event.
    pub metadata: EventMetadata,
}

/// An event as recorded in a stream, with its assigned position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Event ID assigned at proposal time.
    pub event_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// JSON payload.
    pub data: Value,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
    /// Monotonic position within the stream, starting at 1.
    pub stream_version: u64,
}

/// A point-in-time snapshot of an aggregate's serialized state.
///
/// `stream_version` records how many events have been folded into
/// `state`, so rehydration can resume from `stream_version + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Stream the snapshot belongs to.
    pub stream_uuid: String,
    /// Stream version at snapshot time.
    pub stream_version: u64,
    /// Serialized aggregate state.
    pub state: Value,
}

/// Error returned by [`EventStore`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventStoreError {
    /// The append expectation did not match the stream's version.
    #[error("expected stream version {expected} but stream is at {actual}")]
    WrongExpectedVersion {
        /// Version the append expected the stream to be at.
        expected: u64,
        /// Version the stream was actually at.
        actual: u64,
    },

    /// The stream does not exist.
    #[error("stream {0} not found")]
    StreamNotFound(String),

    /// An event or snapshot could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The store could not be reached or failed internally.
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// Abstract append and stream-read contract the runtime executes against.
///
/// # Contract
///
/// - `append` is atomic: either every event in the batch is recorded, in
///   order, with consecutive `stream_version`s, or none is.
/// - `read_stream_forward` returns events ordered by `stream_version`,
///   starting at `from_version` (versions are 1-based), at most
///   `batch_size` per call. A missing stream may be reported either as
///   `Ok(vec![])` or as [`EventStoreError::StreamNotFound`]; the runtime
///   treats both as an empty stream.
/// - The snapshot operations are optional; the defaults make the store
///   snapshot-free.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Append `events` to `stream_uuid`, enforcing `expected_version`.
    ///
    /// # Returns
    ///
    /// The stream's version after the append (the `stream_version` of
    /// the last appended event).
    ///
    /// # Errors
    ///
    /// * [`EventStoreError::WrongExpectedVersion`] on a concurrency
    ///   conflict.
    /// * Any other variant for infrastructure failures.
    async fn append(
        &self,
        stream_uuid: &str,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, EventStoreError>;

    /// Read up to `batch_size` events from `stream_uuid`, starting at
    /// `from_version` (inclusive, 1-based).
    async fn read_stream_forward(
        &self,
        stream_uuid: &str,
        from_version: u64,
        batch_size: usize,
    ) -> Result<Vec<RecordedEvent>, EventStoreError>;

    /// Read the most recent snapshot for `stream_uuid`, if any.
    async fn read_snapshot(
        &self,
        _stream_uuid: &str,
    ) -> Result<Option<SnapshotData>, EventStoreError> {
        Ok(None)
    }

    /// Record a snapshot, replacing any previous one for the stream.
    async fn record_snapshot(&self, _snapshot: SnapshotData) -> Result<(), EventStoreError> {
        Ok(())
    }
}

/// In-memory event store keyed by stream UUID.
///
/// Streams are plain vectors guarded by a single `RwLock`; the
/// expected-version check runs under the write lock so appends are
/// linearizable. Intended for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, Vec<RecordedEvent>>>,
    snapshots: RwLock<HashMap<String, SnapshotData>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of `stream_uuid` (0 when the stream is absent).
    pub async fn stream_version(&self, stream_uuid: &str) -> u64 {
        let streams = self.streams.read().await;
        streams.get(stream_uuid).map_or(0, |s| s.len() as u64)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_uuid: &str,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, EventStoreError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(stream_uuid.to_owned()).or_default();
        let actual = stream.len() as u64;

        match expected_version {
            ExpectedVersion::Any => {}
            ExpectedVersion::NoStream if actual == 0 => {}
            ExpectedVersion::NoStream => {
                return Err(EventStoreError::WrongExpectedVersion {
                    expected: 0,
                    actual,
                });
            }
            ExpectedVersion::Exact(expected) if expected == actual => {}
            ExpectedVersion::Exact(expected) => {
                return Err(EventStoreError::WrongExpectedVersion { expected, actual });
            }
        }

        for (offset, event) in events.into_iter().enumerate() {
            stream.push(RecordedEvent {
                event_id: event.event_id,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                stream_version: actual + offset as u64 + 1,
            });
        }

        Ok(stream.len() as u64)
    }

    async fn read_stream_forward(
        &self,
        stream_uuid: &str,
        from_version: u64,
        batch_size: usize,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let streams = self.streams.read().await;
        let Some(stream) = streams.get(stream_uuid) else {
            return Ok(Vec::new());
        };
        // Versions are 1-based; index 0 holds version 1.
        let start = from_version.saturating_sub(1) as usize;
        Ok(stream
            .iter()
            .skip(start)
            .take(batch_size)
            .cloned()
            .collect())
    }

    async fn read_snapshot(
        &self,
        stream_uuid: &str,
    ) -> Result<Option<SnapshotData>, EventStoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(stream_uuid).cloned())
    }

    async fn record_snapshot(&self, snapshot: SnapshotData) -> Result<(), EventStoreError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.stream_uuid.clone(), snapshot);
        Ok(())
    }
}
