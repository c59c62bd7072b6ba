//! Object Writer
//!
//! Serializes a batch once, derives its deterministic key and uploads it,
//! retrying retryable store errors with exponential backoff.
//!
//! The key depends only on the stream and the batch sequence number, so a
//! retried or repeated upload of the same batch overwrites the same object
//! with the same bytes.
//!
//! ```text
//! {prefix}/{namespace}/{stream}/{sequence:020}.{ext}
//! ```

use crate::pipeline::accumulator::Batch;
use crate::pipeline::object_store::{ObjectStore, ObjectStoreError};
use crate::pipeline::record::{Offset, StreamId};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::serializer::{SerializeError, Serializer};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Reference to a durably written object
#[derive(Debug, Clone, PartialEq)]
pub struct StorageObjectRef {
    pub key: String,
    pub size_bytes: usize,
    pub stream: StreamId,
    pub sequence: u64,
    pub record_count: usize,
    pub min_offset: Offset,
    pub max_offset: Offset,
    /// Upload attempts it took (1 = first try)
    pub attempts: u32,
}

/// Fatal outcome of [`ObjectWriter::write`]
#[derive(Debug)]
pub enum WriteFailure {
    /// The batch could not be encoded
    Serialize(SerializeError),
    /// The store rejected the upload with a non-retryable error
    Permanent { key: String, error: ObjectStoreError },
    /// Every attempt failed with a retryable error
    RetriesExhausted {
        key: String,
        attempts: u32,
        last_error: ObjectStoreError,
    },
    /// Hard shutdown interrupted the upload
    Cancelled { key: String },
}

impl WriteFailure {
    pub fn key(&self) -> Option<&str> {
        match self {
            WriteFailure::Serialize(_) => None,
            WriteFailure::Permanent { key, .. }
            | WriteFailure::RetriesExhausted { key, .. }
            | WriteFailure::Cancelled { key } => Some(key),
        }
    }
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteFailure::Serialize(e) => write!(f, "Failed to serialize batch: {}", e),
            WriteFailure::Permanent { key, error } => {
                write!(f, "Permanent failure writing {}: {}", key, error)
            }
            WriteFailure::RetriesExhausted {
                key,
                attempts,
                last_error,
            } => write!(
                f,
                "Gave up writing {} after {} attempts: {}",
                key, attempts, last_error
            ),
            WriteFailure::Cancelled { key } => write!(f, "Upload of {} cancelled", key),
        }
    }
}

impl std::error::Error for WriteFailure {}

impl From<SerializeError> for WriteFailure {
    fn from(e: SerializeError) -> Self {
        WriteFailure::Serialize(e)
    }
}

/// Aggregated upload statistics for one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub objects: u64,
    pub attempts: u64,
    pub retries: u64,
    pub bytes: u64,
    pub records: u64,
}

impl WriteStats {
    pub fn record(&mut self, object: &StorageObjectRef) {
        self.objects += 1;
        self.attempts += object.attempts as u64;
        self.retries += object.attempts.saturating_sub(1) as u64;
        self.bytes += object.size_bytes as u64;
        self.records += object.record_count as u64;
    }
}

/// Encode one key segment. Bytes outside `[A-Za-z0-9.-]` become `%XX`, as
/// does a leading `.`, so the encoding is injective and never yields `.` or
/// `..`. The empty string maps to `_`, which no non-empty input produces.
fn encode_segment(segment: &str) -> String {
    if segment.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(segment.len());
    for (i, b) in segment.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'-' || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Deterministic object key for a batch
pub fn object_key(prefix: &str, stream: &StreamId, sequence: u64, extension: &str) -> String {
    let mut key = String::new();
    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        key.push_str(prefix);
        key.push('/');
    }
    if let Some(ns) = &stream.namespace {
        key.push_str(&encode_segment(ns));
        key.push('/');
    }
    key.push_str(&encode_segment(&stream.name));
    key.push('/');
    key.push_str(&format!("{:020}.{}", sequence, extension));
    key
}

/// Uploads batches. Cheap to clone; clones share the store and serializer.
#[derive(Clone)]
pub struct ObjectWriter {
    store: Arc<dyn ObjectStore>,
    serializer: Arc<dyn Serializer>,
    prefix: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ObjectWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        serializer: Arc<dyn Serializer>,
        prefix: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        ObjectWriter {
            store,
            serializer,
            prefix: prefix.into(),
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight uploads when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn key_for(&self, batch: &Batch) -> String {
        object_key(
            &self.prefix,
            batch.stream(),
            batch.sequence(),
            self.serializer.extension(),
        )
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// Write one batch durably
    pub async fn write(&self, batch: Batch) -> Result<StorageObjectRef, WriteFailure> {
        let key = self.key_for(&batch);
        // Serialized once; every retry uploads identical bytes
        let bytes = self.serializer.serialize(&batch)?;

        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(WriteFailure::Cancelled { key });
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                r = self.store.put(&key, &bytes) => Some(r),
            };
            let Some(result) = result else {
                return Err(WriteFailure::Cancelled { key });
            };

            match result {
                Ok(()) => {
                    debug!(
                        stream = %batch.stream(),
                        seq = batch.sequence(),
                        key = %key,
                        attempt,
                        records = batch.len(),
                        bytes = bytes.len(),
                        "Wrote object"
                    );
                    return Ok(StorageObjectRef {
                        size_bytes: bytes.len(),
                        stream: batch.stream().clone(),
                        sequence: batch.sequence(),
                        record_count: batch.len(),
                        min_offset: batch.min_offset(),
                        max_offset: batch.max_offset(),
                        attempts: attempt,
                        key,
                    });
                }
                Err(e) if !e.is_retryable() => {
                    error!(stream = %batch.stream(), key = %key, attempt, error = %e, "Permanent upload failure");
                    return Err(WriteFailure::Permanent { key, error: e });
                }
                Err(e) if attempt >= self.retry.max_attempts => {
                    error!(stream = %batch.stream(), key = %key, attempt, error = %e, "Upload retries exhausted");
                    return Err(WriteFailure::RetriesExhausted {
                        key,
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        stream = %batch.stream(),
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upload failed, retrying"
                    );
                    let cancelled = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        return Err(WriteFailure::Cancelled { key });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::pipeline::accumulator::{Accumulator, FlushThresholds};
    use crate::pipeline::clock::Timestamp;
    use crate::pipeline::record::{Payload, Record};
    use crate::pipeline::serializer::JsonLinesSerializer;
    use crate::pipeline::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig};
    use crate::pipeline::InMemoryObjectStore;
    use std::time::Duration;

    fn batch(stream: StreamId, seq: u64, offsets: std::ops::Range<u64>) -> Batch {
        let mut acc = Accumulator::new(
            stream.clone(),
            FlushThresholds {
                flush_bytes: usize::MAX,
                flush_rows: usize::MAX,
                flush_interval: Duration::from_secs(60),
            },
        );
        for o in offsets {
            let mut data = Payload::new();
            data.insert("n".into(), o.into());
            acc.add(Record::new(stream.clone(), Offset(o), data), Timestamp::ZERO);
        }
        acc.take_batch(seq).unwrap()
    }

    fn writer(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> ObjectWriter {
        ObjectWriter::new(store, Arc::new(JsonLinesSerializer), "out", retry)
    }

    #[test]
    fn test_object_key_layout() {
        assert_eq!(
            object_key("out", &StreamId::with_namespace("public", "users"), 7, "jsonl"),
            "out/public/users/00000000000000000007.jsonl"
        );
        assert_eq!(
            object_key("/out/", &StreamId::new("a b/c"), 1, "csv"),
            "out/a%20b%2Fc/00000000000000000001.csv"
        );
        assert_eq!(
            object_key("", &StreamId::new("s"), 2, "seg"),
            "s/00000000000000000002.seg"
        );
        assert_eq!(
            object_key("out", &StreamId::new(".."), 1, "csv"),
            "out/%2E./00000000000000000001.csv"
        );
    }

    #[test]
    fn test_object_key_distinct_for_distinct_streams() {
        let streams = vec![
            StreamId::new("a/b"),
            StreamId::new("a_b"),
            StreamId::new("a b"),
            StreamId::new("a%2Fb"),
            StreamId::new("a"),
            StreamId::new(""),
            StreamId::new("_"),
            StreamId::new("."),
            StreamId::new("%2E"),
            StreamId::with_namespace("a", "b"),
            StreamId::with_namespace("", "b"),
            StreamId::with_namespace("_", "b"),
            StreamId::with_namespace("a.b", "c"),
            StreamId::with_namespace("a", "b.c"),
            StreamId::with_namespace("a/b", "c"),
        ];
        let keys: std::collections::BTreeSet<String> = streams
            .iter()
            .map(|s| object_key("test", s, 1, "jsonl"))
            .collect();
        assert_eq!(keys.len(), streams.len(), "{:?}", keys);
        for key in &keys {
            let segments: Vec<&str> = key.split('/').collect();
            assert!(segments.iter().all(|s| !s.is_empty() && *s != "." && *s != ".."));
        }
    }

    #[tokio::test]
    async fn test_write_success() {
        let store = InMemoryObjectStore::new();
        let w = writer(Arc::new(store.clone()), RetryPolicy::test());

        let obj = w.write(batch(StreamId::new("users"), 1, 1..4)).await.unwrap();

        assert_eq!(obj.key, "out/users/00000000000000000001.jsonl");
        assert_eq!(obj.record_count, 3);
        assert_eq!(obj.max_offset, Offset(3));
        assert_eq!(obj.attempts, 1);
        assert_eq!(store.get_sync(&obj.key).map(|b| b.len()), Some(obj.size_bytes));
    }

    #[tokio::test]
    async fn test_transient_failures_retried_same_key() {
        let sim = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(7),
            SimulatedStoreConfig {
                fail_first_attempts: 2,
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let w = writer(Arc::new(sim.clone()), RetryPolicy::test());

        let obj = w.write(batch(StreamId::new("users"), 1, 0..10)).await.unwrap();

        assert_eq!(obj.attempts, 3);
        assert_eq!(sim.stats().put_attempts, 3);
        assert_eq!(sim.inner().keys(), vec![obj.key.clone()]);
        assert_eq!(sim.inner().write_count(&obj.key), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let sim = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(7),
            SimulatedStoreConfig {
                fail_first_attempts: 10,
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let retry = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::test()
        };
        let w = writer(Arc::new(sim.clone()), retry);

        let err = w.write(batch(StreamId::new("users"), 1, 0..2)).await.unwrap_err();
        assert!(matches!(err, WriteFailure::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(sim.stats().put_attempts, 3);
        assert!(sim.inner().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let sim = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(7),
            SimulatedStoreConfig {
                permanent_failure_prefixes: vec!["out/users/".into()],
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let w = writer(Arc::new(sim.clone()), RetryPolicy::test());

        let err = w.write(batch(StreamId::new("users"), 1, 0..2)).await.unwrap_err();
        assert!(matches!(err, WriteFailure::Permanent { .. }));
        assert_eq!(err.key(), Some("out/users/00000000000000000001.jsonl"));
        assert_eq!(sim.stats().put_attempts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let sim = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(7),
            SimulatedStoreConfig {
                fail_first_attempts: 100,
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let retry = RetryPolicy {
            max_attempts: 100,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            multiplier: 1.0,
        };
        let cancel = CancellationToken::new();
        let w = writer(Arc::new(sim), retry).with_cancellation(cancel.clone());

        let handle = tokio::spawn(async move { w.write(batch(StreamId::new("users"), 1, 0..2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(WriteFailure::Cancelled { .. })));
    }

    #[test]
    fn test_write_stats() {
        let mut stats = WriteStats::default();
        let obj = StorageObjectRef {
            key: "k".into(),
            size_bytes: 100,
            stream: StreamId::new("s"),
            sequence: 1,
            record_count: 10,
            min_offset: Offset(1),
            max_offset: Offset(10),
            attempts: 3,
        };
        stats.record(&obj);
        stats.record(&StorageObjectRef { attempts: 1, ..obj });
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.bytes, 200);
        assert_eq!(stats.records, 20);
    }
}
