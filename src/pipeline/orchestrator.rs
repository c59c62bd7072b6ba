//! Pipeline Orchestrator
//!
//! Top-level driver. A single task consumes the input messages in order,
//! routes records to per-stream coordinators and triggers flushes. Uploads
//! run as separate tasks bounded by one shared semaphore.
//!
//! ## Termination
//!
//! | Trigger                      | Drain buffered | Final checkpoints | Result                    |
//! |------------------------------|----------------|-------------------|---------------------------|
//! | `END_OF_STREAM`              | yes            | yes               | `Ok(summary)`             |
//! | input ends without it        | yes            | yes               | `Ok`, `UpstreamClosed`    |
//! | input error                  | yes            | no                | `Err(Input)`              |
//! | soft shutdown                | yes            | no                | `Err(Cancelled{false})`   |
//! | hard shutdown                | no (aborted)   | no                | `Err(Cancelled{true})`    |
//! | stream failure, fail-fast    | healthy only   | no                | `Err(StreamFailed)`       |
//! | stream failure, isolate      | healthy only   | no                | `Err(StreamsFailed)`      |
//!
//! Under fail-fast the first failure stops consumption. Under isolate the
//! failed stream's later records are dropped and counted while the other
//! streams keep running until the input ends.

use crate::pipeline::accumulator::FlushThresholds;
use crate::pipeline::checkpoint::{Checkpoint, CheckpointTracker};
use crate::pipeline::clock::{PipelineClock, ProductionClock};
use crate::pipeline::config::{PipelineConfig, StreamFailurePolicy};
use crate::pipeline::coordinator::{StreamCoordinator, StreamState, StreamStats};
use crate::pipeline::error::{PipelineError, StreamFailure};
use crate::pipeline::object_store::ObjectStore;
use crate::pipeline::record::{InputError, Message, Offset, Record, StreamId};
use crate::pipeline::serializer::serializer_for;
use crate::pipeline::writer::ObjectWriter;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the input ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Explicit end-of-stream message
    EndOfStream,
    /// Input ended without an end-of-stream message
    UpstreamClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub stream: StreamId,
    #[serde(flatten)]
    pub stats: StreamStats,
    pub checkpoint: Option<Offset>,
}

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub end_reason: EndReason,
    pub records: u64,
    pub streams: Vec<StreamSummary>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn stream(&self, stream: &StreamId) -> Option<&StreamSummary> {
        self.streams.iter().find(|s| &s.stream == stream)
    }

    pub fn objects_written(&self) -> u64 {
        self.streams.iter().map(|s| s.stats.objects).sum()
    }
}

/// External shutdown control. Cloneable and usable from any task.
#[derive(Clone)]
pub struct ShutdownHandle {
    soft: CancellationToken,
    hard: CancellationToken,
    uploads: Arc<Semaphore>,
}

impl ShutdownHandle {
    /// Stop consuming input, flush what is buffered, then fail with
    /// `Cancelled { hard: false }`
    pub fn soft(&self) {
        self.soft.cancel();
    }

    /// Abort in-flight uploads and stop without flushing
    pub fn hard(&self) {
        self.hard.cancel();
        self.uploads.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.soft.is_cancelled() || self.hard.is_cancelled()
    }
}

enum Stop {
    EndOfStream,
    Disconnected,
    Soft,
    Input(InputError),
    Fatal(PipelineError),
    StreamFailed(StreamFailure),
}

/// Record-ingestion pipeline
pub struct Pipeline<C: PipelineClock = ProductionClock> {
    config: PipelineConfig,
    clock: C,
    writer: ObjectWriter,
    tracker: CheckpointTracker,
    checkpoints: Option<mpsc::UnboundedReceiver<Checkpoint>>,
    uploads: Arc<Semaphore>,
    shutdown: ShutdownHandle,
    coordinators: BTreeMap<StreamId, StreamCoordinator>,
    failures_tx: mpsc::UnboundedSender<StreamFailure>,
    failures_rx: mpsc::UnboundedReceiver<StreamFailure>,
    isolated: Vec<StreamFailure>,
    records: u64,
}

impl Pipeline<ProductionClock> {
    pub fn new(config: PipelineConfig, store: Arc<dyn ObjectStore>) -> Result<Self, PipelineError> {
        Self::with_clock(config, store, ProductionClock::new())
    }
}

impl<C: PipelineClock> Pipeline<C> {
    pub fn with_clock(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        clock: C,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let uploads = Arc::new(Semaphore::new(config.max_concurrent_uploads));
        let shutdown = ShutdownHandle {
            soft: CancellationToken::new(),
            hard: CancellationToken::new(),
            uploads: uploads.clone(),
        };
        let writer = ObjectWriter::new(
            store,
            serializer_for(config.format, config.compression),
            config.prefix.clone(),
            config.retry.clone(),
        )
        .with_cancellation(shutdown.hard.clone());
        let (tracker, checkpoints) = CheckpointTracker::new();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        Ok(Pipeline {
            config,
            clock,
            writer,
            tracker,
            checkpoints: Some(checkpoints),
            uploads,
            shutdown,
            coordinators: BTreeMap::new(),
            failures_tx,
            failures_rx,
            isolated: Vec::new(),
            records: 0,
        })
    }

    /// Take the acknowledgement channel. Must be called before `run` to
    /// observe checkpoints; returns `None` on later calls.
    pub fn take_checkpoints(&mut self) -> Option<mpsc::UnboundedReceiver<Checkpoint>> {
        self.checkpoints.take()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }

    fn thresholds(&self) -> FlushThresholds {
        FlushThresholds {
            flush_bytes: self.config.flush_bytes,
            flush_rows: self.config.flush_rows,
            flush_interval: self.config.flush_interval,
        }
    }

    fn coordinator(&mut self, stream: &StreamId) -> &mut StreamCoordinator {
        let thresholds = self.thresholds();
        let writer = &self.writer;
        let tracker = &self.tracker;
        let failures_tx = &self.failures_tx;
        self.coordinators.entry(stream.clone()).or_insert_with(|| {
            info!(stream = %stream, "Opening stream");
            StreamCoordinator::new(
                stream.clone(),
                thresholds,
                writer.clone(),
                tracker.clone(),
                failures_tx.clone(),
            )
        })
    }

    async fn on_record(&mut self, record: Record) -> Result<(), PipelineError> {
        self.records += 1;
        let now = self.clock.now();
        let uploads = self.uploads.clone();
        let stream = record.stream().clone();
        let coordinator = self.coordinator(&stream);

        if coordinator.state() == StreamState::Failed {
            coordinator.drop_record();
            return Ok(());
        }
        coordinator.add(record, now)?;
        coordinator.maybe_flush(now, &uploads).await?;
        Ok(())
    }

    async fn on_stream_complete(&mut self, stream: StreamId) -> Result<(), PipelineError> {
        debug!(stream = %stream, "Stream complete");
        let uploads = self.uploads.clone();
        self.coordinator(&stream).complete(&uploads).await
    }

    async fn on_tick(&mut self) -> Result<(), PipelineError> {
        let now = self.clock.now();
        let uploads = self.uploads.clone();
        for coordinator in self.coordinators.values_mut() {
            coordinator.reap();
            if coordinator.should_flush(now) {
                coordinator.maybe_flush(now, &uploads).await?;
            }
        }
        Ok(())
    }

    /// Returns `Some` when the failure must stop the pipeline
    fn on_failure(&mut self, failure: StreamFailure) -> Option<StreamFailure> {
        error!(stream = %failure.stream, seq = failure.seq, error = %failure.error, "Stream failed");
        if let Some(c) = self.coordinators.get_mut(&failure.stream) {
            c.mark_failed();
        }
        match self.config.failure_policy {
            StreamFailurePolicy::FailFast => Some(failure),
            StreamFailurePolicy::Isolate => {
                // Only the first failure per stream is reported
                if !self.isolated.iter().any(|f| f.stream == failure.stream) {
                    self.isolated.push(failure);
                }
                None
            }
        }
    }

    async fn drain_all(&mut self) -> Result<(), PipelineError> {
        let uploads = self.uploads.clone();
        for coordinator in self.coordinators.values_mut() {
            coordinator.drain(&uploads).await?;
        }
        Ok(())
    }

    fn abort_all(&mut self) {
        for coordinator in self.coordinators.values_mut() {
            coordinator.abort();
        }
    }

    fn summary(&self, end_reason: EndReason, started: Instant) -> RunSummary {
        RunSummary {
            end_reason,
            records: self.records,
            streams: self
                .coordinators
                .iter()
                .map(|(stream, c)| StreamSummary {
                    stream: stream.clone(),
                    stats: c.stats(),
                    checkpoint: self.tracker.acknowledgeable(stream),
                })
                .collect(),
            elapsed: started.elapsed(),
        }
    }

    /// Consume `input` until it ends, fails or shutdown is requested
    pub async fn run<S>(mut self, mut input: S) -> Result<RunSummary, PipelineError>
    where
        S: Stream<Item = Result<Message, InputError>> + Unpin,
    {
        let started = Instant::now();
        let soft = self.shutdown.soft.clone();
        let hard = self.shutdown.hard.clone();
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            flush_rows = self.config.flush_rows,
            flush_bytes = self.config.flush_bytes,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            max_concurrent_uploads = self.config.max_concurrent_uploads,
            policy = ?self.config.failure_policy,
            format = ?self.config.format,
            "Pipeline started"
        );

        let stop = loop {
            tokio::select! {
                biased;
                _ = hard.cancelled() => break Stop::Soft,
                _ = soft.cancelled() => break Stop::Soft,
                Some(failure) = self.failures_rx.recv() => {
                    if let Some(fatal) = self.on_failure(failure) {
                        break Stop::StreamFailed(fatal);
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.on_tick().await {
                        break Stop::Fatal(e);
                    }
                }
                msg = input.next() => {
                    let handled = match msg {
                        Some(Ok(Message::Record(record))) => self.on_record(record).await,
                        Some(Ok(Message::StreamComplete(stream))) => {
                            self.on_stream_complete(stream).await
                        }
                        Some(Ok(Message::EndOfStream)) => break Stop::EndOfStream,
                        Some(Err(e)) => break Stop::Input(e),
                        None => break Stop::Disconnected,
                    };
                    if let Err(e) = handled {
                        break Stop::Fatal(e);
                    }
                }
            }
        };

        if hard.is_cancelled() {
            return Err(self.abort(started));
        }

        match &stop {
            Stop::Disconnected => warn!("Upstream closed without end-of-stream; draining"),
            Stop::Soft => info!("Shutdown requested; draining"),
            Stop::Input(e) => error!(error = %e, "Input failed; draining"),
            Stop::Fatal(e) => error!(error = %e, "Pipeline error; draining"),
            Stop::StreamFailed(_) => warn!("Fail-fast: draining healthy streams"),
            Stop::EndOfStream => info!("End of stream; draining"),
        }

        let drained = tokio::select! {
            biased;
            _ = hard.cancelled() => None,
            r = self.drain_all() => Some(r),
        };
        let drain_error = match drained {
            None => return Err(self.abort(started)),
            Some(r) => r.err(),
        };

        let end_reason = match &stop {
            Stop::EndOfStream => EndReason::EndOfStream,
            _ => EndReason::UpstreamClosed,
        };

        // Failures surfaced while draining
        let (mut first_failure, stop) = match stop {
            Stop::StreamFailed(f) => (Some(f), None),
            other => (None, Some(other)),
        };
        while let Ok(failure) = self.failures_rx.try_recv() {
            if let Some(fatal) = self.on_failure(failure) {
                first_failure.get_or_insert(fatal);
            }
        }

        let summary = self.summary(end_reason, started);
        info!(
            records = summary.records,
            streams = summary.streams.len(),
            objects = summary.objects_written(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Pipeline finished"
        );

        if let Some(failure) = first_failure {
            return Err(PipelineError::StreamFailed(failure));
        }
        if !self.isolated.is_empty() {
            return Err(PipelineError::StreamsFailed(std::mem::take(&mut self.isolated)));
        }
        match stop {
            Some(Stop::Fatal(e)) => return Err(e),
            Some(Stop::Input(e)) => return Err(PipelineError::Input(e)),
            Some(Stop::Soft) => return Err(PipelineError::Cancelled { hard: false }),
            Some(Stop::StreamFailed(_) | Stop::EndOfStream | Stop::Disconnected) | None => {}
        }
        if let Some(e) = drain_error {
            return Err(e);
        }

        self.tracker.emit_final();
        Ok(summary)
    }

    fn abort(&mut self, started: Instant) -> PipelineError {
        self.abort_all();
        warn!(
            records = self.records,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline aborted; in-flight uploads cancelled"
        );
        PipelineError::Cancelled { hard: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::checkpoint::CheckpointKind;
    use crate::pipeline::record::Payload;
    use crate::pipeline::InMemoryObjectStore;

    fn record(stream: &str, offset: u64) -> Result<Message, InputError> {
        let mut data = Payload::new();
        data.insert("n".into(), offset.into());
        Ok(Message::Record(Record::new(StreamId::new(stream), Offset(offset), data)))
    }

    #[tokio::test]
    async fn test_single_stream_end_of_stream() {
        let store = InMemoryObjectStore::new();
        let mut pipeline = Pipeline::new(PipelineConfig::rows_only(10), Arc::new(store.clone())).unwrap();
        let mut checkpoints = pipeline.take_checkpoints().unwrap();

        let mut input: Vec<_> = (1..=25).map(|i| record("users", i)).collect();
        input.push(Ok(Message::EndOfStream));

        let summary = pipeline.run(futures::stream::iter(input)).await.unwrap();
        assert_eq!(summary.end_reason, EndReason::EndOfStream);
        assert_eq!(summary.records, 25);
        assert_eq!(summary.objects_written(), 3);
        assert_eq!(store.len(), 3);

        let mut finals = Vec::new();
        while let Ok(c) = checkpoints.try_recv() {
            if c.kind == CheckpointKind::Final {
                finals.push(c.offset);
            }
        }
        assert_eq!(finals, vec![Offset(25)]);
    }

    #[tokio::test]
    async fn test_disconnect_drains() {
        let store = InMemoryObjectStore::new();
        let pipeline = Pipeline::new(PipelineConfig::rows_only(100), Arc::new(store.clone())).unwrap();
        let input: Vec<_> = (1..=5).map(|i| record("users", i)).collect();

        let summary = pipeline.run(futures::stream::iter(input)).await.unwrap();
        assert_eq!(summary.end_reason, EndReason::UpstreamClosed);
        assert_eq!(store.len(), 1);
        assert_eq!(
            summary.stream(&StreamId::new("users")).unwrap().checkpoint,
            Some(Offset(5))
        );
    }

    #[tokio::test]
    async fn test_input_error_drains_then_fails() {
        let store = InMemoryObjectStore::new();
        let pipeline = Pipeline::new(PipelineConfig::rows_only(100), Arc::new(store.clone())).unwrap();
        let mut input: Vec<_> = (1..=5).map(|i| record("users", i)).collect();
        input.push(Err(InputError::Malformed("bad line".into())));
        input.push(record("users", 6));

        let err = pipeline.run(futures::stream::iter(input)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));
        // Buffered records were still made durable
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_record_after_stream_complete_is_error() {
        let pipeline = Pipeline::new(PipelineConfig::rows_only(100), Arc::new(InMemoryObjectStore::new())).unwrap();
        let input = vec![
            record("users", 1),
            Ok(Message::StreamComplete(StreamId::new("users"))),
            record("users", 2),
            Ok(Message::EndOfStream),
        ];
        let err = pipeline.run(futures::stream::iter(input)).await.unwrap_err();
        assert!(matches!(err, PipelineError::StreamClosed { .. }));
        assert_eq!(err.failed_streams(), vec![&StreamId::new("users")]);
    }

    #[tokio::test]
    async fn test_offset_regression_is_fatal() {
        let pipeline = Pipeline::new(PipelineConfig::rows_only(100), Arc::new(InMemoryObjectStore::new())).unwrap();
        let input = vec![record("users", 5), record("users", 3), Ok(Message::EndOfStream)];
        let err = pipeline.run(futures::stream::iter(input)).await.unwrap_err();
        assert!(matches!(err, PipelineError::OrderingViolation(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::test();
        config.max_concurrent_uploads = 0;
        assert!(matches!(
            Pipeline::new(config, Arc::new(InMemoryObjectStore::new())),
            Err(PipelineError::Config(_))
        ));
    }

    fn record_for(stream: StreamId, offset: u64) -> Result<Message, InputError> {
        let mut data = Payload::new();
        data.insert("n".into(), offset.into());
        Ok(Message::Record(Record::new(stream, Offset(offset), data)))
    }

    #[tokio::test]
    async fn test_fail_fast_reports_first_failure() {
        use crate::io::SimulatedRng;
        use crate::pipeline::{SimulatedObjectStore, SimulatedStoreConfig};

        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(11),
            SimulatedStoreConfig {
                permanent_failure_prefixes: vec!["test/bad/".into()],
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let pipeline = Pipeline::new(PipelineConfig::rows_only(2), Arc::new(store)).unwrap();
        let mut input: Vec<_> = (1..=2).map(|i| record("bad", i)).collect();
        input.extend((1..=4).map(|i| record("good", i)));
        input.push(Ok(Message::EndOfStream));

        let err = pipeline.run(futures::stream::iter(input)).await.unwrap_err();
        match err {
            PipelineError::StreamFailed(failure) => {
                assert_eq!(failure.stream, StreamId::new("bad"));
                assert_eq!(failure.seq, 1);
            }
            other => panic!("expected StreamFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_streams_with_similar_names_stay_separate() {
        let store = InMemoryObjectStore::new();
        let pipeline = Pipeline::new(PipelineConfig::rows_only(100), Arc::new(store.clone())).unwrap();
        let streams = vec![
            StreamId::new("a/b"),
            StreamId::new("a_b"),
            StreamId::new("a b"),
            StreamId::new("a.b"),
            StreamId::with_namespace("a", "b"),
            StreamId::with_namespace("", "b"),
            StreamId::with_namespace("_", "b"),
        ];
        let mut input: Vec<_> = streams.iter().map(|s| record_for(s.clone(), 1)).collect();
        input.push(Ok(Message::EndOfStream));

        let summary = pipeline.run(futures::stream::iter(input)).await.unwrap();
        assert_eq!(summary.objects_written(), streams.len() as u64);
        assert_eq!(store.len(), streams.len());
        assert_eq!(summary.streams.len(), streams.len());
        for stream in &streams {
            let s = summary.stream(stream).unwrap();
            assert_eq!(&s.stream, stream);
            assert_eq!(s.stats.objects, 1);
            assert_eq!(s.checkpoint, Some(Offset(1)));
        }
    }
}
