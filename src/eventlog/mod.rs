// Copyright 2025 Machina Contributors.

//! Append-only event log with optimistic concurrency and snapshots
//!
//! Each entity owns one stream. Appends assign dense, gap-free sequence
//! numbers; replaying any prefix of a stream reproduces the corresponding
//! state. Snapshots bound activation cost: activation loads the latest
//! snapshot and applies only the tail.

mod dedupe;
mod events;

pub use dedupe::{DedupeCache, DEFAULT_DEDUPE_CAPACITY};
pub use events::{
    EventRecord, MigrationEvent, MigrationEventOutcome, NonTransitionEvent, SagaEventKind,
    SagaEventRecord, StateSnapshot, TransitionEvent,
};

use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::HashMap;
use std::fmt::Debug;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::MachinaError;

/// Errors raised by event log operations
#[derive(Debug, Error)]
pub enum EventLogError {
    /// The requested stream does not exist
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Optimistic concurrency check failed on append
    #[error("Concurrency conflict: expected sequence {expected}, but current sequence is {actual}")]
    ConcurrencyConflict {
        /// The last sequence the writer expected
        expected: u64,
        /// The stream's actual last sequence
        actual: u64,
    },

    /// Failed to serialize or deserialize a record
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Underlying storage failed
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl From<EventLogError> for MachinaError {
    fn from(err: EventLogError) -> Self {
        match err {
            EventLogError::ConcurrencyConflict { expected, actual } => {
                MachinaError::ConcurrencyConflict { expected, actual }
            }
            EventLogError::SerializationError(msg) => MachinaError::SerializationError(msg),
            other => MachinaError::EventLogError(other.to_string()),
        }
    }
}

/// Stream of event records, boxed for trait objects
pub type EventStream = Pin<Box<dyn Stream<Item = EventRecord> + Send>>;

/// Append-only event log, one stream per entity
#[async_trait]
pub trait EventLog: Send + Sync + Debug {
    /// Append records to a stream, assigning dense sequence numbers
    ///
    /// When `expected_last_seq` is given, the append fails with a
    /// concurrency conflict unless the stream's last sequence matches.
    /// Returns the stream's new last sequence.
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventRecord>,
        expected_last_seq: Option<u64>,
    ) -> Result<u64, EventLogError>;

    /// Read up to `limit` records with sequence numbers greater than
    /// `after_seq`, in order
    async fn read(
        &self,
        stream_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventLogError>;

    /// The stream's last assigned sequence, or 0 for an empty stream
    async fn last_seq(&self, stream_id: &str) -> Result<u64, EventLogError>;

    /// Stream every record of a stream in order
    async fn stream_events(&self, stream_id: &str) -> Result<EventStream, EventLogError>;

    /// Write a snapshot for a stream, replacing any previous one
    async fn write_snapshot(
        &self,
        stream_id: &str,
        snapshot: StateSnapshot,
    ) -> Result<(), EventLogError>;

    /// Read the most recent snapshot for a stream
    async fn read_latest_snapshot(
        &self,
        stream_id: &str,
    ) -> Result<Option<StateSnapshot>, EventLogError>;
}

/// Snapshot cadence configuration
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    /// Write a snapshot after this many appended events
    pub interval: u64,
    /// Whether snapshotting is active
    pub enabled: bool,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            interval: 100,
            enabled: true,
        }
    }
}

impl SnapshotPolicy {
    /// A policy that never snapshots
    pub fn disabled() -> Self {
        Self {
            interval: u64::MAX,
            enabled: false,
        }
    }

    /// Whether a snapshot is due after `events_since_snapshot` events
    pub fn is_due(&self, events_since_snapshot: u64) -> bool {
        self.enabled && events_since_snapshot >= self.interval
    }
}

#[derive(Debug, Default)]
struct StreamData {
    events: Vec<EventRecord>,
    snapshot: Option<StateSnapshot>,
}

/// In-memory event log for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    streams: RwLock<HashMap<String, StreamData>>,
}

impl InMemoryEventLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all streams
    pub async fn total_events(&self) -> usize {
        let streams = self.streams.read().await;
        streams.values().map(|s| s.events.len()).sum()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventRecord>,
        expected_last_seq: Option<u64>,
    ) -> Result<u64, EventLogError> {
        let mut streams = self.streams.write().await;
        let data = streams.entry(stream_id.to_string()).or_default();
        let last = data.events.last().map(EventRecord::seq).unwrap_or(0);

        if let Some(expected) = expected_last_seq {
            if expected != last {
                return Err(EventLogError::ConcurrencyConflict {
                    expected,
                    actual: last,
                });
            }
        }

        let mut seq = last;
        for mut event in events {
            seq += 1;
            event.set_seq(seq);
            data.events.push(event);
        }
        debug!(stream_id, last_seq = seq, "events appended");
        Ok(seq)
    }

    async fn read(
        &self,
        stream_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let streams = self.streams.read().await;
        let Some(data) = streams.get(stream_id) else {
            return Ok(Vec::new());
        };
        Ok(data
            .events
            .iter()
            .filter(|e| e.seq() > after_seq)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_seq(&self, stream_id: &str) -> Result<u64, EventLogError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .and_then(|d| d.events.last())
            .map(EventRecord::seq)
            .unwrap_or(0))
    }

    async fn stream_events(&self, stream_id: &str) -> Result<EventStream, EventLogError> {
        let streams = self.streams.read().await;
        let events = streams
            .get(stream_id)
            .map(|d| d.events.clone())
            .unwrap_or_default();
        Ok(Box::pin(stream::iter(events)))
    }

    async fn write_snapshot(
        &self,
        stream_id: &str,
        snapshot: StateSnapshot,
    ) -> Result<(), EventLogError> {
        let mut streams = self.streams.write().await;
        let data = streams.entry(stream_id.to_string()).or_default();
        data.snapshot = Some(snapshot);
        Ok(())
    }

    async fn read_latest_snapshot(
        &self,
        stream_id: &str,
    ) -> Result<Option<StateSnapshot>, EventLogError> {
        let streams = self.streams.read().await;
        Ok(streams.get(stream_id).and_then(|d| d.snapshot.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use chrono::Utc;
    use futures::StreamExt;

    fn transition(entity: &str, from: &str, to: &str, trigger: &str) -> EventRecord {
        EventRecord::Transition(TransitionEvent {
            entity_id: entity.to_string(),
            seq: 0,
            from_state: from.to_string(),
            to_state: to.to_string(),
            trigger: trigger.to_string(),
            timestamp_utc: Utc::now(),
            correlation_id: None,
            dedupe_key: None,
            fsm_version: Version::new(1, 0, 0),
            params: None,
        })
    }

    #[tokio::test]
    async fn test_append_assigns_dense_sequences() {
        let log = InMemoryEventLog::new();
        let last = log
            .append(
                "order-1",
                vec![
                    transition("order-1", "Pending", "Processing", "Process"),
                    transition("order-1", "Processing", "Shipped", "Ship"),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(last, 2);

        let events = log.read("order-1", 0, 100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq(), 1);
        assert_eq!(events[1].seq(), 2);
    }

    #[tokio::test]
    async fn test_append_concurrency_conflict() {
        let log = InMemoryEventLog::new();
        log.append(
            "order-1",
            vec![transition("order-1", "Pending", "Processing", "Process")],
            Some(0),
        )
        .await
        .unwrap();

        let err = log
            .append(
                "order-1",
                vec![transition("order-1", "Pending", "Processing", "Process")],
                Some(0),
            )
            .await
            .unwrap_err();
        match err {
            EventLogError::ConcurrencyConflict { expected, actual } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_after_seq_and_limit() {
        let log = InMemoryEventLog::new();
        for i in 0..5 {
            log.append(
                "order-1",
                vec![transition("order-1", "A", "B", &format!("t{i}"))],
                None,
            )
            .await
            .unwrap();
        }

        let events = log.read("order-1", 2, 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq(), 3);
        assert_eq!(events[1].seq(), 4);

        assert!(log.read("missing", 0, 10).await.unwrap().is_empty());
        assert_eq!(log.last_seq("order-1").await.unwrap(), 5);
        assert_eq!(log.last_seq("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_events_in_order() {
        let log = InMemoryEventLog::new();
        for i in 0..3 {
            log.append(
                "order-1",
                vec![transition("order-1", "A", "B", &format!("t{i}"))],
                None,
            )
            .await
            .unwrap();
        }

        let collected: Vec<EventRecord> =
            log.stream_events("order-1").await.unwrap().collect().await;
        assert_eq!(collected.len(), 3);
        assert!(collected.windows(2).all(|w| w[0].seq() < w[1].seq()));
    }

    #[tokio::test]
    async fn test_snapshot_write_and_read() {
        let log = InMemoryEventLog::new();
        assert!(log.read_latest_snapshot("order-1").await.unwrap().is_none());

        let snapshot = StateSnapshot {
            state: "Processing".to_string(),
            seq: 7,
            fsm_version: Version::new(1, 0, 0),
            custom_state: None,
            taken_at: Utc::now(),
        };
        log.write_snapshot("order-1", snapshot.clone()).await.unwrap();

        let read = log.read_latest_snapshot("order-1").await.unwrap().unwrap();
        assert_eq!(read, snapshot);
    }

    #[test]
    fn test_snapshot_policy_due() {
        let policy = SnapshotPolicy::default();
        assert!(!policy.is_due(99));
        assert!(policy.is_due(100));
        assert!(!SnapshotPolicy::disabled().is_due(10_000));
    }

    #[test]
    fn test_append_from_blocking_context() {
        // The log is usable from sync call sites through a local runtime
        let log = InMemoryEventLog::new();
        let last = tokio_test::block_on(log.append(
            "order-1",
            vec![transition("order-1", "Pending", "Processing", "Process")],
            None,
        ))
        .unwrap();
        assert_eq!(last, 1);
    }
}
