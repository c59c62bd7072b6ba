//! Object Store Ingestion Pipeline
//!
//! Consumes an ordered stream of records spread over many logical streams,
//! groups each stream's records into batches, writes every batch as one
//! immutable object and acknowledges upstream offsets only once the objects
//! that contain them are durable.
//!
//! ## Architecture
//!
//! ```text
//! Message → Pipeline ─┬→ StreamCoordinator(a) → Accumulator → Batch ─┐
//!                     └→ StreamCoordinator(b) → Accumulator → Batch ─┤
//!                                                                    ↓
//!                      (bounded upload permits)  ObjectWriter ── retry ──→ ObjectStore
//!                                                    ↓
//!                                          CheckpointTracker → Checkpoint(stream, offset)
//! ```
//!
//! ## Key Properties
//!
//! - **Batch isolation**: a batch never mixes streams
//! - **Idempotent uploads**: retries reuse the same deterministic key
//! - **Ordered acknowledgement**: a stream's checkpoint only advances over a
//!   contiguous prefix of completed batches
//! - **Backpressure**: at most `max_concurrent_uploads` uploads in flight

pub mod record;
pub mod object_store;
pub mod simulated_store;
pub mod config;
pub mod clock;
pub mod retry;
pub mod accumulator;
pub mod segment;
pub mod serializer;
pub mod writer;
pub mod checkpoint;
pub mod error;
pub mod coordinator;
pub mod orchestrator;
pub mod dst;
#[cfg(feature = "s3")]
pub mod s3_store;

pub use record::{InputError, Message, Offset, Payload, Record, StreamId, WireMessage};
pub use object_store::{
    InMemoryObjectStore, LocalFsObjectStore, ObjectMeta, ObjectStore, ObjectStoreError, StoreFuture,
};
pub use simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
pub use config::{ConfigError, ObjectStoreType, OutputFormat, PipelineConfig, StreamFailurePolicy};
pub use clock::{PipelineClock, ProductionClock, SimulatedClock, Timestamp};
pub use retry::RetryPolicy;
pub use accumulator::{Accumulator, Batch, FlushReason, FlushThresholds};
pub use segment::{Compression, SegmentError, SegmentReader, SegmentRecord, SegmentWriter};
pub use serializer::{serializer_for, DecodedRecord, SerializeError, Serializer};
pub use writer::{object_key, ObjectWriter, StorageObjectRef, WriteFailure, WriteStats};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointKind, CheckpointTracker};
pub use error::{PipelineError, StreamFailure, UploadError};
pub use coordinator::{StreamCoordinator, StreamState, StreamStats};
pub use orchestrator::{EndReason, Pipeline, RunSummary, ShutdownHandle, StreamSummary};
pub use dst::{
    PipelineDSTConfig, PipelineDSTHarness, PipelineDSTResult, PipelineWorkload,
    run_dst_batch, summarize_batch,
};
#[cfg(feature = "s3")]
pub use s3_store::S3ObjectStore;
