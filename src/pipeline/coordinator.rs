//! Stream Coordinator
//!
//! Owns one stream's accumulator and its in-flight uploads.
//!
//! ```text
//!            flush                 all uploads done
//!   Open ──────────────► Flushing ─────────────────► Open
//!    │                      │
//!    │ drain / complete     │ drain / complete
//!    ▼                      ▼
//!   Draining ──── uploads done ───► Closed
//!
//!   any state ── fatal upload failure ──► Failed
//! ```
//!
//! Accumulation continues while uploads are in flight. Each upload runs as
//! its own task holding one permit of the shared upload semaphore; the
//! permit is acquired on the ingestion path before the task is spawned,
//! which is where backpressure comes from.

use crate::pipeline::accumulator::{Accumulator, FlushReason, FlushThresholds};
use crate::pipeline::checkpoint::{CheckpointError, CheckpointTracker};
use crate::pipeline::clock::Timestamp;
use crate::pipeline::error::{PipelineError, StreamFailure, UploadError};
use crate::pipeline::record::{Offset, Record, StreamId};
use crate::pipeline::writer::{ObjectWriter, StorageObjectRef, WriteStats};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Accepting records, nothing in flight
    Open,
    /// Accepting records, at least one upload in flight
    Flushing,
    /// Final flush issued, waiting for uploads
    Draining,
    Closed,
    /// A batch could not be written
    Failed,
}

impl StreamState {
    pub fn accepts_records(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::Flushing)
    }
}

/// Per-stream counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub state: StreamState,
    pub records_received: u64,
    /// Records discarded after the stream failed
    pub records_dropped: u64,
    pub batches_submitted: u64,
    pub batches_written: u64,
    pub objects: u64,
    pub attempts: u64,
    pub retries: u64,
    pub bytes_written: u64,
}

struct UploadOutcome {
    seq: u64,
    object: Option<StorageObjectRef>,
}

pub struct StreamCoordinator {
    stream: StreamId,
    accumulator: Accumulator,
    writer: ObjectWriter,
    tracker: CheckpointTracker,
    failures: mpsc::UnboundedSender<StreamFailure>,
    uploads: JoinSet<UploadOutcome>,
    state: StreamState,
    next_seq: u64,
    last_offset: Option<Offset>,
    records_received: u64,
    records_dropped: u64,
    batches_submitted: u64,
    batches_written: u64,
    write_stats: WriteStats,
}

impl StreamCoordinator {
    pub fn new(
        stream: StreamId,
        thresholds: FlushThresholds,
        writer: ObjectWriter,
        tracker: CheckpointTracker,
        failures: mpsc::UnboundedSender<StreamFailure>,
    ) -> Self {
        StreamCoordinator {
            accumulator: Accumulator::new(stream.clone(), thresholds),
            stream,
            writer,
            tracker,
            failures,
            uploads: JoinSet::new(),
            state: StreamState::Open,
            next_seq: 1,
            last_offset: None,
            records_received: 0,
            records_dropped: 0,
            batches_submitted: 0,
            batches_written: 0,
            write_stats: WriteStats::default(),
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn in_flight(&self) -> usize {
        self.uploads.len()
    }

    pub fn buffered_records(&self) -> usize {
        self.accumulator.len()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            state: self.state,
            records_received: self.records_received,
            records_dropped: self.records_dropped,
            batches_submitted: self.batches_submitted,
            batches_written: self.batches_written,
            objects: self.write_stats.objects,
            attempts: self.write_stats.attempts,
            retries: self.write_stats.retries,
            bytes_written: self.write_stats.bytes,
        }
    }

    /// Buffer a record. Fails when the stream no longer accepts records or
    /// the record's offset is below the last accepted one.
    pub fn add(&mut self, record: Record, now: Timestamp) -> Result<(), PipelineError> {
        if !self.state.accepts_records() {
            return Err(PipelineError::StreamClosed {
                stream: self.stream.clone(),
            });
        }
        if let Some(last) = self.last_offset {
            if record.offset() < last {
                return Err(PipelineError::OrderingViolation(
                    CheckpointError::OrderingViolation {
                        stream: self.stream.clone(),
                        detail: format!(
                            "record offset {} is below last accepted offset {}",
                            record.offset(),
                            last
                        ),
                    },
                ));
            }
        }
        self.last_offset = Some(record.offset());
        self.records_received += 1;
        self.accumulator.add(record, now);
        Ok(())
    }

    /// Count a record discarded because the stream failed
    pub fn drop_record(&mut self) {
        self.records_dropped += 1;
    }

    pub fn should_flush(&self, now: Timestamp) -> bool {
        self.state.accepts_records() && self.accumulator.should_flush(now)
    }

    /// Flush if a threshold is met. Returns whether a batch was submitted.
    pub async fn maybe_flush(
        &mut self,
        now: Timestamp,
        uploads: &Arc<Semaphore>,
    ) -> Result<bool, PipelineError> {
        if !self.state.accepts_records() {
            return Ok(false);
        }
        match self.accumulator.flush_reason(now) {
            Some(reason) => self.submit(reason, uploads).await,
            None => Ok(false),
        }
    }

    /// Take the buffered batch and start its upload.
    ///
    /// Waits for an upload permit first. Returns `false` when nothing was
    /// buffered.
    async fn submit(
        &mut self,
        reason: FlushReason,
        uploads: &Arc<Semaphore>,
    ) -> Result<bool, PipelineError> {
        if self.accumulator.is_empty() {
            return Ok(false);
        }
        let permit = uploads
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Cancelled { hard: true })?;

        let seq = self.next_seq;
        let Some(batch) = self.accumulator.take_batch(seq) else {
            return Ok(false);
        };
        self.next_seq += 1;
        self.tracker.register(&self.stream, seq, batch.max_offset())?;
        self.batches_submitted += 1;

        debug!(
            stream = %self.stream,
            seq,
            reason = %reason,
            records = batch.len(),
            bytes = batch.estimated_bytes(),
            max_offset = %batch.max_offset(),
            "Submitting batch"
        );

        let writer = self.writer.clone();
        let tracker = self.tracker.clone();
        let failures = self.failures.clone();
        let stream = self.stream.clone();
        self.uploads.spawn(async move {
            let _permit = permit;
            let error = match writer.write(batch).await {
                Ok(object) => match tracker.record_flush(&stream, seq) {
                    Ok(_) => return UploadOutcome { seq, object: Some(object) },
                    Err(e) => UploadError::Checkpoint(e),
                },
                Err(e) => UploadError::Write(e),
            };
            let _ = failures.send(StreamFailure { stream, seq, error });
            UploadOutcome { seq, object: None }
        });

        if self.state == StreamState::Open {
            self.state = StreamState::Flushing;
        }
        Ok(true)
    }

    fn on_upload_finished(&mut self, result: Result<UploadOutcome, JoinError>) {
        match result {
            Ok(UploadOutcome {
                object: Some(object),
                ..
            }) => {
                self.batches_written += 1;
                self.write_stats.record(&object);
            }
            Ok(UploadOutcome { seq, object: None }) => {
                error!(stream = %self.stream, seq, "Upload failed, stream marked failed");
                self.mark_failed();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                error!(stream = %self.stream, error = %e, "Upload task panicked");
                self.mark_failed();
                let _ = self.failures.send(StreamFailure {
                    stream: self.stream.clone(),
                    seq: 0,
                    error: UploadError::Panicked(e.to_string()),
                });
            }
        }
        self.settle_state();
    }

    fn settle_state(&mut self) {
        if !self.uploads.is_empty() {
            return;
        }
        match self.state {
            StreamState::Flushing => self.state = StreamState::Open,
            StreamState::Draining => {
                info!(stream = %self.stream, "Stream closed");
                self.state = StreamState::Closed;
            }
            _ => {}
        }
    }

    /// Collect finished uploads without waiting
    pub fn reap(&mut self) {
        while let Some(result) = self.uploads.try_join_next() {
            self.on_upload_finished(result);
        }
    }

    /// Wait for every in-flight upload
    pub async fn await_uploads(&mut self) {
        while let Some(result) = self.uploads.join_next().await {
            self.on_upload_finished(result);
        }
        self.settle_state();
    }

    /// Force out whatever is buffered and stop accepting records.
    ///
    /// Does not wait for the upload; the stream becomes `Closed` once its
    /// uploads finish.
    pub async fn complete(&mut self, uploads: &Arc<Semaphore>) -> Result<(), PipelineError> {
        if !self.state.accepts_records() {
            return Ok(());
        }
        self.submit(FlushReason::StreamComplete, uploads).await?;
        self.state = StreamState::Draining;
        self.settle_state();
        Ok(())
    }

    /// Final flush and wait: `Open`/`Flushing` end up `Closed`, a failed
    /// stream only waits for its in-flight uploads.
    pub async fn drain(&mut self, uploads: &Arc<Semaphore>) -> Result<(), PipelineError> {
        if self.state.accepts_records() {
            self.submit(FlushReason::Drain, uploads).await?;
            self.state = StreamState::Draining;
        }
        self.await_uploads().await;
        Ok(())
    }

    /// Mark the stream failed. Buffered records are discarded and counted
    /// as dropped; later records are dropped by the caller.
    pub fn mark_failed(&mut self) {
        self.state = StreamState::Failed;
        let discarded = self.accumulator.discard();
        if discarded > 0 {
            warn!(stream = %self.stream, records = discarded, "Discarding buffered records of failed stream");
            self.records_dropped += discarded as u64;
        }
    }

    /// Abort in-flight uploads without flushing
    pub fn abort(&mut self) {
        self.uploads.abort_all();
    }
}
