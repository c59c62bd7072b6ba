//! Deterministic Simulation Testing for the Ingestion Pipeline
//!
//! Seed-driven whole-pipeline runs against a fault-injecting object store,
//! followed by invariant checks on the emitted checkpoints and the objects
//! actually stored.
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::moderate(seed));
//!     harness.run().await;
//!     harness.check_invariants().await;   // violations carry the seed
//! }
//! ```
//!
//! Invariants:
//! - checkpoints per stream never decrease
//! - every acknowledged offset is present in a stored object
//! - no stored object is empty and no offset is stored twice
//! - a successful run stores every record and acknowledges each stream's
//!   maximum offset as its final checkpoint

use crate::buggify::faults::pipeline as pipeline_faults;
use crate::io::{Rng, SimulatedRng};
use crate::pipeline::checkpoint::{Checkpoint, CheckpointKind};
use crate::pipeline::clock::SimulatedClock;
use crate::pipeline::config::{OutputFormat, PipelineConfig};
use crate::pipeline::object_store::ObjectStore;
use crate::pipeline::orchestrator::{EndReason, Pipeline};
use crate::pipeline::record::{InputError, Message, Offset, Payload, Record, StreamId};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::serializer::serializer_for;
use crate::pipeline::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
use crate::pipeline::writer::object_key;
use crate::pipeline::InMemoryObjectStore;
use futures::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for pipeline DST
#[derive(Debug, Clone)]
pub struct PipelineDSTConfig {
    pub seed: u64,
    pub store_config: SimulatedStoreConfig,
    pub pipeline_config: PipelineConfig,
    /// Number of concurrent logical streams
    pub streams: usize,
    /// Records generated per run
    pub records: usize,
    /// Probability that a stream is completed early (per message)
    pub complete_probability: f64,
    /// Probability that upstream disconnects (per message)
    pub disconnect_probability: f64,
}

impl Default for PipelineDSTConfig {
    fn default() -> Self {
        PipelineDSTConfig {
            seed: 0,
            store_config: SimulatedStoreConfig {
                latency_range_us: (50, 2_000),
                ..SimulatedStoreConfig::default()
            },
            pipeline_config: PipelineConfig {
                flush_rows: 20,
                flush_interval: Duration::from_millis(40),
                tick_interval: Duration::from_millis(5),
                ..PipelineConfig::test()
            },
            streams: 3,
            records: 300,
            complete_probability: 0.002,
            disconnect_probability: 0.0,
        }
    }
}

impl PipelineDSTConfig {
    pub fn new(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Calm mode - no store faults
    pub fn calm(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::latency_only(50, 1_000),
            ..Default::default()
        }
    }

    /// Moderate fault injection
    pub fn moderate(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            disconnect_probability: 0.001,
            ..Default::default()
        }
    }

    /// Chaos mode - aggressive fault injection, small batches
    pub fn chaos(seed: u64) -> Self {
        let defaults = Self::default();
        PipelineDSTConfig {
            seed,
            store_config: SimulatedStoreConfig {
                latency_range_us: (50, 3_000),
                ..SimulatedStoreConfig::high_chaos()
            },
            pipeline_config: PipelineConfig {
                flush_rows: 7,
                max_concurrent_uploads: 2,
                retry: RetryPolicy {
                    max_attempts: 8,
                    ..RetryPolicy::test()
                },
                ..defaults.pipeline_config
            },
            streams: 5,
            complete_probability: 0.005,
            disconnect_probability: 0.002,
            ..defaults
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.pipeline_config.format = format;
        self
    }
}

/// One generated input step
#[derive(Debug, Clone)]
pub struct WorkloadStep {
    /// Virtual time advanced before the message is delivered
    pub advance_ms: u64,
    pub message: Message,
}

/// Generated upstream input plus its ground truth
#[derive(Debug, Clone, Default)]
pub struct Workload {
    pub steps: Vec<WorkloadStep>,
    /// Offsets sent per stream, in order
    pub sent: BTreeMap<StreamId, Vec<Offset>>,
    pub disconnected: bool,
}

impl Workload {
    pub fn records(&self) -> usize {
        self.sent.values().map(|v| v.len()).sum()
    }
}

/// Workload generator
pub struct PipelineWorkload {
    rng: SimulatedRng,
    config: PipelineDSTConfig,
}

impl PipelineWorkload {
    pub fn new(config: PipelineDSTConfig) -> Self {
        PipelineWorkload {
            rng: SimulatedRng::new(config.seed),
            config,
        }
    }

    /// Stream identities include separators, spaces and an empty namespace
    /// so that names which only differ in escaped characters share a run.
    fn stream_id(i: usize) -> StreamId {
        let n = i / 4;
        match i % 4 {
            0 => StreamId::new(format!("stream_{}", n)),
            1 => StreamId::new(format!("stream/{}", n)),
            2 => StreamId::with_namespace("dst", format!("stream {}", n)),
            _ => StreamId::with_namespace("", format!("stream_{}", n)),
        }
    }

    pub fn generate(&mut self) -> Workload {
        let mut workload = Workload::default();
        let mut open: Vec<usize> = (0..self.config.streams.max(1)).collect();
        let mut next_offset: BTreeMap<usize, u64> = BTreeMap::new();

        for n in 0..self.config.records {
            if crate::buggify!(
                &mut self.rng,
                pipeline_faults::UPSTREAM_DISCONNECT,
                self.config.disconnect_probability
            ) {
                workload.disconnected = true;
                return workload;
            }
            if open.is_empty() {
                break;
            }

            let idx = open[self.rng.gen_range(0, open.len() as u64) as usize];
            let stream = Self::stream_id(idx);
            let offset = next_offset.entry(idx).or_insert(0);
            *offset += self.rng.gen_range(1, 4);
            let offset = Offset(*offset);

            let mut data = Payload::new();
            data.insert("n".into(), json!(n));
            data.insert("stream".into(), json!(stream.name));
            if self.rng.gen_bool(0.2) {
                data.insert("note".into(), json!(format!("a \"quoted\", value {}", n)));
            }

            workload.steps.push(WorkloadStep {
                advance_ms: self.rng.gen_range(0, 3),
                message: Message::Record(Record::with_emitted_at(
                    stream.clone(),
                    offset,
                    1_000 + n as u64,
                    data,
                )),
            });
            workload.sent.entry(stream.clone()).or_default().push(offset);

            if self.rng.gen_bool(self.config.complete_probability) {
                open.retain(|&s| s != idx);
                workload.steps.push(WorkloadStep {
                    advance_ms: 0,
                    message: Message::StreamComplete(stream),
                });
            }
        }

        workload.steps.push(WorkloadStep {
            advance_ms: 0,
            message: Message::EndOfStream,
        });
        workload
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct PipelineDSTResult {
    pub seed: u64,
    pub records_sent: usize,
    pub streams: usize,
    pub disconnected: bool,
    /// `None` on success, otherwise the pipeline error
    pub pipeline_error: Option<String>,
    pub end_reason: Option<EndReason>,
    pub objects_stored: usize,
    pub records_stored: usize,
    pub checkpoints: Vec<Checkpoint>,
    pub store_stats: SimulatedStoreStats,
    pub invariant_violations: Vec<String>,
}

impl PipelineDSTResult {
    pub fn new(seed: u64) -> Self {
        PipelineDSTResult {
            seed,
            records_sent: 0,
            streams: 0,
            disconnected: false,
            pipeline_error: None,
            end_reason: None,
            objects_stored: 0,
            records_stored: 0,
            checkpoints: Vec::new(),
            store_stats: SimulatedStoreStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    /// Invariants held (the pipeline itself may still have failed)
    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn pipeline_succeeded(&self) -> bool {
        self.pipeline_error.is_none()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} records over {} streams, {} objects ({} records) stored, {} checkpoints, pipeline {}, {} violations",
            self.seed,
            self.records_sent,
            self.streams,
            self.objects_stored,
            self.records_stored,
            self.checkpoints.len(),
            self.pipeline_error.as_deref().unwrap_or("ok"),
            self.invariant_violations.len()
        )
    }
}

type DSTStore = SimulatedObjectStore<InMemoryObjectStore, SimulatedRng>;

/// Whole-pipeline DST harness
pub struct PipelineDSTHarness {
    config: PipelineDSTConfig,
    store: Arc<DSTStore>,
    workload: Workload,
    result: PipelineDSTResult,
}

impl PipelineDSTHarness {
    pub fn new(config: PipelineDSTConfig) -> Self {
        // Different seed for the store than for the workload
        let rng = SimulatedRng::new(config.seed.wrapping_add(1));
        let store = Arc::new(SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            rng,
            config.store_config.clone(),
        ));
        let workload = PipelineWorkload::new(config.clone()).generate();
        let mut result = PipelineDSTResult::new(config.seed);
        result.records_sent = workload.records();
        result.streams = workload.sent.len();
        result.disconnected = workload.disconnected;

        PipelineDSTHarness {
            config,
            store,
            workload,
            result,
        }
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Feed the workload through a fresh pipeline
    pub async fn run(&mut self) {
        let clock = SimulatedClock::new(0);
        let store: Arc<dyn ObjectStore> = self.store.clone();
        let mut pipeline = match Pipeline::with_clock(
            self.config.pipeline_config.clone(),
            store,
            clock.clone(),
        ) {
            Ok(p) => p,
            Err(e) => {
                self.result.pipeline_error = Some(e.to_string());
                return;
            }
        };
        let Some(mut checkpoints) = pipeline.take_checkpoints() else {
            self.result.pipeline_error = Some("checkpoint channel unavailable".into());
            return;
        };

        let steps = self.workload.steps.clone();
        let input = futures::stream::iter(steps).map(move |step| {
            clock.advance_ms(step.advance_ms);
            Ok::<Message, InputError>(step.message)
        });

        match pipeline.run(input).await {
            Ok(summary) => self.result.end_reason = Some(summary.end_reason),
            Err(e) => self.result.pipeline_error = Some(e.to_string()),
        }

        while let Ok(checkpoint) = checkpoints.try_recv() {
            self.result.checkpoints.push(checkpoint);
        }
        self.result.store_stats = self.store.stats();
    }

    fn violation(&mut self, msg: String) {
        self.result
            .invariant_violations
            .push(format!("seed {}: {}", self.config.seed, msg));
    }

    /// Read every stored object of `stream` (bypassing fault injection)
    async fn stored_offsets(&mut self, stream: &StreamId) -> Vec<Vec<Offset>> {
        let pc = &self.config.pipeline_config;
        let serializer = serializer_for(pc.format, pc.compression);
        let sample = object_key(&pc.prefix, stream, 0, serializer.extension());
        let dir = match sample.rfind('/') {
            Some(i) => sample[..=i].to_string(),
            None => String::new(),
        };

        let inner = self.store.inner().clone();
        let metas = match inner.list(&dir).await {
            Ok(m) => m,
            Err(e) => {
                self.violation(format!("listing {} failed: {}", dir, e));
                return Vec::new();
            }
        };

        let mut objects = Vec::new();
        for meta in metas {
            // Deeper keys belong to a namespace that shares this directory name
            match meta.key.strip_prefix(dir.as_str()) {
                Some(rest) if !rest.contains('/') => {}
                _ => continue,
            }
            let bytes = match inner.get(&meta.key).await {
                Ok(b) => b,
                Err(e) => {
                    self.violation(format!("object {} unreadable: {}", meta.key, e));
                    continue;
                }
            };
            match serializer.deserialize(&bytes) {
                Ok(records) => objects.push(records.into_iter().map(|r| r.offset).collect()),
                Err(e) => self.violation(format!("object {} failed to decode: {}", meta.key, e)),
            }
        }
        objects
    }

    /// Check invariants after the run
    pub async fn check_invariants(&mut self) {
        let mut progress: BTreeMap<StreamId, Vec<Offset>> = BTreeMap::new();
        let mut finals: BTreeMap<StreamId, Offset> = BTreeMap::new();
        for c in &self.result.checkpoints {
            match c.kind {
                CheckpointKind::Progress => progress.entry(c.stream.clone()).or_default().push(c.offset),
                CheckpointKind::Final => {
                    finals.insert(c.stream.clone(), c.offset);
                }
            }
        }

        // Invariant 1: checkpoints never decrease
        for (stream, marks) in &progress {
            if marks.windows(2).any(|w| w[1] < w[0]) {
                let msg = format!("checkpoints for {} decreased: {:?}", stream, marks);
                self.violation(msg);
            }
        }

        let sent = self.workload.sent.clone();
        let succeeded = self.result.pipeline_succeeded();
        for (stream, offsets) in &sent {
            let objects = self.stored_offsets(stream).await;
            self.result.objects_stored += objects.len();

            // Invariant 2: no empty objects, no offset stored twice
            let mut stored = BTreeSet::new();
            for object in &objects {
                if object.is_empty() {
                    self.violation(format!("empty object stored for {}", stream));
                }
                for offset in object {
                    self.result.records_stored += 1;
                    if !stored.insert(*offset) {
                        self.violation(format!("offset {} of {} stored twice", offset, stream));
                    }
                }
            }

            // Invariant 3: everything acknowledged is durable
            let acked = progress
                .get(stream)
                .and_then(|m| m.iter().max().copied())
                .into_iter()
                .chain(finals.get(stream).copied())
                .max();
            if let Some(acked) = acked {
                let missing: Vec<_> = offsets
                    .iter()
                    .filter(|o| **o <= acked && !stored.contains(o))
                    .collect();
                if !missing.is_empty() {
                    self.violation(format!(
                        "{} acknowledged through {} but {} offsets missing (first {})",
                        stream,
                        acked,
                        missing.len(),
                        missing[0]
                    ));
                }
            }

            // Invariant 4: a successful run stores and acknowledges everything
            if succeeded {
                if stored.len() != offsets.len() {
                    self.violation(format!(
                        "{}: {} records sent but {} stored",
                        stream,
                        offsets.len(),
                        stored.len()
                    ));
                }
                let max_sent = offsets.last().copied();
                if finals.get(stream).copied() != max_sent {
                    self.violation(format!(
                        "{}: final checkpoint {:?}, expected {:?}",
                        stream,
                        finals.get(stream),
                        max_sent
                    ));
                }
            }
        }

        // Invariant 5: every stored object belongs to exactly one stream
        let inner = self.store.inner().clone();
        match inner.list(&self.config.pipeline_config.prefix).await {
            Ok(all) if all.len() != self.result.objects_stored => {
                let msg = format!(
                    "{} objects in store but {} attributed to streams",
                    all.len(),
                    self.result.objects_stored
                );
                self.violation(msg);
            }
            Ok(_) => {}
            Err(e) => self.violation(format!("listing all objects failed: {}", e)),
        }

        if succeeded && self.workload.disconnected
            && self.result.end_reason != Some(EndReason::UpstreamClosed)
        {
            let msg = format!("disconnect reported as {:?}", self.result.end_reason);
            self.violation(msg);
        }
    }

    pub fn result(&self) -> &PipelineDSTResult {
        &self.result
    }

    pub fn into_result(self) -> PipelineDSTResult {
        self.result
    }
}

/// Run a batch of DST runs with consecutive seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> PipelineDSTConfig,
) -> Vec<PipelineDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let mut harness = PipelineDSTHarness::new(config_fn(base_seed + i as u64));
        harness.run().await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[PipelineDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let pipeline_ok = results.iter().filter(|r| r.pipeline_succeeded()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let records: usize = results.iter().map(|r| r.records_sent).sum();
    let objects: usize = results.iter().map(|r| r.objects_stored).sum();
    let retries: u64 = results
        .iter()
        .map(|r| r.store_stats.transient_failures + r.store_stats.throttles + r.store_stats.timeouts)
        .sum();

    let mut summary = format!(
        "Batch: {}/{} invariant-clean, {}/{} pipelines succeeded, {} records, {} objects, {} injected retryable faults",
        passed, total, pipeline_ok, total, records, objects, retries
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
        for r in results.iter().filter(|r| !r.is_success()).take(3) {
            for v in r.invariant_violations.iter().take(3) {
                summary.push_str(&format!("\n  {}", v));
            }
        }
    }

    summary
}
