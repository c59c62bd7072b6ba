//! Checkpoint Tracker
//!
//! Tracks, per stream, the highest upstream offset that is durably stored
//! and emits acknowledgements on an ordered channel.
//!
//! Batches are registered in submission order and confirmed in whatever
//! order their uploads finish. A confirmation only advances the mark once
//! every earlier batch of the same stream is confirmed too:
//!
//! ```text
//! register: seq1(max 10)  seq2(max 20)  seq3(max 30)
//! confirm:  seq3 -> no change (seq1, seq2 pending)
//!           seq1 -> mark 10
//!           seq2 -> mark 30   (seq2 and the buffered seq3 apply together)
//! ```
//!
//! The tracker is shared between the ingestion task and upload tasks, so
//! its state sits behind a mutex. Checkpoints are sent while holding the
//! lock, which keeps the channel ordered per stream.

use crate::pipeline::record::{Offset, StreamId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointKind {
    /// Emitted whenever a mark advances
    Progress,
    /// Re-emitted for every stream after a complete drain
    Final,
}

/// Acknowledgement: `stream` is durable up to and including `offset`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub stream: StreamId,
    pub offset: Offset,
    pub kind: CheckpointKind,
}

/// JSON-lines wire form of a checkpoint, emitted upstream
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "STATE")]
pub struct StateMessage<'a> {
    pub stream: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<&'a str>,
    pub offset: u64,
    pub kind: CheckpointKind,
}

impl Checkpoint {
    pub fn to_state(&self) -> StateMessage<'_> {
        StateMessage {
            stream: &self.stream.name,
            namespace: self.stream.namespace.as_deref(),
            offset: self.offset.0,
            kind: self.kind,
        }
    }

    /// Serialize as a single `{"type":"STATE",...}` line (no newline)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_state())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    OrderingViolation { stream: StreamId, detail: String },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::OrderingViolation { stream, detail } => {
                write!(f, "Ordering violation on stream {}: {}", stream, detail)
            }
        }
    }
}

impl std::error::Error for CheckpointError {}

#[derive(Debug, Clone, Copy)]
struct PendingBatch {
    max_offset: Offset,
    confirmed: bool,
}

#[derive(Debug, Default)]
struct StreamMarks {
    /// Registered batches not yet folded into the mark, by sequence
    pending: BTreeMap<u64, PendingBatch>,
    last_registered_seq: u64,
    last_registered_offset: Option<Offset>,
    /// Highest sequence folded into the mark
    applied_through: u64,
    mark: Option<Offset>,
}

impl StreamMarks {
    fn violation(stream: &StreamId, detail: String) -> CheckpointError {
        CheckpointError::OrderingViolation {
            stream: stream.clone(),
            detail,
        }
    }

    /// Fold the contiguous confirmed prefix into the mark, one batch at a
    /// time. Returns every mark reached along the way, ascending.
    fn advance(&mut self) -> Vec<Offset> {
        let mut reached = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().confirmed {
                break;
            }
            let (seq, batch) = entry.remove_entry();
            self.applied_through = seq;
            if self.mark.map_or(true, |m| batch.max_offset > m) {
                self.mark = Some(batch.max_offset);
                reached.push(batch.max_offset);
            }
        }
        reached
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    streams: BTreeMap<StreamId, StreamMarks>,
}

/// Snapshot of one stream's tracking state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCheckpointState {
    pub mark: Option<Offset>,
    pub pending_batches: usize,
    pub applied_through: u64,
}

/// Shared checkpoint tracker. Clones share state and channel.
#[derive(Clone)]
pub struct CheckpointTracker {
    state: Arc<Mutex<TrackerState>>,
    tx: mpsc::UnboundedSender<Checkpoint>,
}

impl CheckpointTracker {
    /// Create a tracker and the receiving end of its acknowledgement channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Checkpoint>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            CheckpointTracker {
                state: Arc::new(Mutex::new(TrackerState::default())),
                tx,
            },
            rx,
        )
    }

    fn emit(&self, checkpoint: Checkpoint) {
        if self.tx.send(checkpoint).is_err() {
            debug!("Checkpoint receiver dropped");
        }
    }

    /// Record that batch `seq` with `max_offset` was handed to a writer.
    ///
    /// Must be called in submission order for each stream.
    pub fn register(
        &self,
        stream: &StreamId,
        seq: u64,
        max_offset: Offset,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state.lock();
        let marks = state.streams.entry(stream.clone()).or_default();

        if seq <= marks.last_registered_seq {
            return Err(StreamMarks::violation(
                stream,
                format!(
                    "batch {} registered after batch {}",
                    seq, marks.last_registered_seq
                ),
            ));
        }
        if let Some(prev) = marks.last_registered_offset {
            if max_offset < prev {
                return Err(StreamMarks::violation(
                    stream,
                    format!(
                        "batch {} max offset {} is below previous max offset {}",
                        seq, max_offset, prev
                    ),
                ));
            }
        }

        marks.last_registered_seq = seq;
        marks.last_registered_offset = Some(max_offset);
        marks.pending.insert(
            seq,
            PendingBatch {
                max_offset,
                confirmed: false,
            },
        );
        Ok(())
    }

    /// Record a durable write confirmation for batch `seq`.
    ///
    /// Returns the new mark if it advanced. A confirmation that releases
    /// buffered successors emits one checkpoint per released batch.
    /// Duplicate confirmations are ignored.
    pub fn record_flush(
        &self,
        stream: &StreamId,
        seq: u64,
    ) -> Result<Option<Offset>, CheckpointError> {
        let mut state = self.state.lock();
        let Some(marks) = state.streams.get_mut(stream) else {
            return Err(StreamMarks::violation(
                stream,
                format!("confirmation for batch {} of an unknown stream", seq),
            ));
        };

        match marks.pending.get_mut(&seq) {
            Some(batch) if batch.confirmed => {
                debug!(stream = %stream, seq, "Duplicate confirmation ignored");
                return Ok(None);
            }
            Some(batch) => batch.confirmed = true,
            None if seq <= marks.applied_through => {
                debug!(stream = %stream, seq, "Duplicate confirmation ignored");
                return Ok(None);
            }
            None => {
                return Err(StreamMarks::violation(
                    stream,
                    format!("confirmation for unregistered batch {}", seq),
                ));
            }
        }

        let reached = marks.advance();
        if reached.is_empty() {
            debug!(stream = %stream, seq, "Confirmation buffered behind earlier batches");
            return Ok(None);
        }

        for offset in &reached {
            debug!(stream = %stream, seq, offset = %offset, "Checkpoint advanced");
            self.emit(Checkpoint {
                stream: stream.clone(),
                offset: *offset,
                kind: CheckpointKind::Progress,
            });
        }
        Ok(reached.last().copied())
    }

    /// Current acknowledgeable mark for a stream
    pub fn acknowledgeable(&self, stream: &StreamId) -> Option<Offset> {
        self.state.lock().streams.get(stream).and_then(|m| m.mark)
    }

    /// Marks of every stream that has one
    pub fn snapshot(&self) -> BTreeMap<StreamId, Offset> {
        self.state
            .lock()
            .streams
            .iter()
            .filter_map(|(s, m)| m.mark.map(|o| (s.clone(), o)))
            .collect()
    }

    pub fn stream_state(&self, stream: &StreamId) -> Option<StreamCheckpointState> {
        self.state
            .lock()
            .streams
            .get(stream)
            .map(|m| StreamCheckpointState {
                mark: m.mark,
                pending_batches: m.pending.len(),
                applied_through: m.applied_through,
            })
    }

    /// Re-emit every mark as a final checkpoint; returns how many were sent
    pub fn emit_final(&self) -> usize {
        let state = self.state.lock();
        let mut count = 0;
        for (stream, marks) in &state.streams {
            if let Some(offset) = marks.mark {
                self.emit(Checkpoint {
                    stream: stream.clone(),
                    offset,
                    kind: CheckpointKind::Final,
                });
                count += 1;
            }
        }
        info!(streams = count, "Emitted final checkpoints");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Checkpoint>) -> Vec<(String, u64, CheckpointKind)> {
        let mut out = Vec::new();
        while let Ok(c) = rx.try_recv() {
            out.push((c.stream.to_string(), c.offset.0, c.kind));
        }
        out
    }

    #[test]
    fn test_in_order_confirmations() {
        let (tracker, mut rx) = CheckpointTracker::new();
        let s = StreamId::new("users");

        tracker.register(&s, 1, Offset(10)).unwrap();
        tracker.register(&s, 2, Offset(20)).unwrap();
        assert_eq!(tracker.record_flush(&s, 1).unwrap(), Some(Offset(10)));
        assert_eq!(tracker.record_flush(&s, 2).unwrap(), Some(Offset(20)));

        assert_eq!(
            drain(&mut rx),
            vec![
                ("users".into(), 10, CheckpointKind::Progress),
                ("users".into(), 20, CheckpointKind::Progress)
            ]
        );
    }

    #[test]
    fn test_out_of_order_completion_30_10_20() {
        let (tracker, mut rx) = CheckpointTracker::new();
        let s = StreamId::new("users");
        for (seq, max) in [(1, 10), (2, 20), (3, 30)] {
            tracker.register(&s, seq, Offset(max)).unwrap();
        }

        assert_eq!(tracker.record_flush(&s, 3).unwrap(), None);
        assert_eq!(tracker.acknowledgeable(&s), None);
        assert_eq!(tracker.record_flush(&s, 1).unwrap(), Some(Offset(10)));
        assert_eq!(tracker.record_flush(&s, 2).unwrap(), Some(Offset(30)));

        let marks: Vec<u64> = drain(&mut rx).into_iter().map(|(_, o, _)| o).collect();
        assert_eq!(marks, vec![10, 20, 30]);
        assert!(marks.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(
            tracker.stream_state(&s),
            Some(StreamCheckpointState {
                mark: Some(Offset(30)),
                pending_batches: 0,
                applied_through: 3,
            })
        );
    }

    #[test]
    fn test_duplicate_confirmation_ignored() {
        let (tracker, mut rx) = CheckpointTracker::new();
        let s = StreamId::new("users");
        tracker.register(&s, 1, Offset(5)).unwrap();
        tracker.register(&s, 2, Offset(9)).unwrap();

        // Buffered duplicate
        tracker.record_flush(&s, 2).unwrap();
        assert_eq!(tracker.record_flush(&s, 2).unwrap(), None);
        // Applied duplicate
        tracker.record_flush(&s, 1).unwrap();
        assert_eq!(tracker.record_flush(&s, 1).unwrap(), None);

        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(tracker.acknowledgeable(&s), Some(Offset(9)));
    }

    #[test]
    fn test_ordering_violations() {
        let (tracker, _rx) = CheckpointTracker::new();
        let s = StreamId::new("users");

        tracker.register(&s, 1, Offset(50)).unwrap();
        assert!(matches!(
            tracker.register(&s, 2, Offset(40)),
            Err(CheckpointError::OrderingViolation { .. })
        ));
        assert!(tracker.register(&s, 1, Offset(60)).is_err());
        assert!(tracker.record_flush(&s, 9).is_err());
        assert!(tracker.record_flush(&StreamId::new("other"), 1).is_err());
    }

    #[test]
    fn test_streams_independent() {
        let (tracker, _rx) = CheckpointTracker::new();
        let a = StreamId::new("a");
        let b = StreamId::with_namespace("ns", "b");
        tracker.register(&a, 1, Offset(100)).unwrap();
        tracker.register(&b, 1, Offset(7)).unwrap();
        tracker.register(&b, 2, Offset(8)).unwrap();

        tracker.record_flush(&b, 1).unwrap();
        assert_eq!(tracker.acknowledgeable(&a), None);
        assert_eq!(tracker.acknowledgeable(&b), Some(Offset(7)));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&b), Some(&Offset(7)));
    }

    #[test]
    fn test_emit_final() {
        let (tracker, mut rx) = CheckpointTracker::new();
        let a = StreamId::new("a");
        let b = StreamId::new("b");
        tracker.register(&a, 1, Offset(3)).unwrap();
        tracker.register(&b, 1, Offset(4)).unwrap();
        tracker.record_flush(&a, 1).unwrap();
        drain(&mut rx);

        // b has no durable batch, so it gets no final checkpoint
        assert_eq!(tracker.emit_final(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![("a".into(), 3, CheckpointKind::Final)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_confirmations_stay_monotonic() {
        let (tracker, mut rx) = CheckpointTracker::new();
        let s = StreamId::new("users");
        for seq in 1..=50u64 {
            tracker.register(&s, seq, Offset(seq * 10)).unwrap();
        }

        let mut handles = Vec::new();
        for seq in (1..=50u64).rev() {
            let tracker = tracker.clone();
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(seq % 7)).await;
                tracker.record_flush(&s, seq).unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let marks: Vec<u64> = drain(&mut rx).into_iter().map(|(_, o, _)| o).collect();
        assert!(marks.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(marks.last(), Some(&500));
        assert_eq!(tracker.acknowledgeable(&s), Some(Offset(500)));
    }

    #[test]
    fn test_state_line() {
        let c = Checkpoint {
            stream: StreamId::with_namespace("public", "users"),
            offset: Offset(42),
            kind: CheckpointKind::Final,
        };
        let v: serde_json::Value = serde_json::from_str(&c.to_json_line().unwrap()).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "type": "STATE", "stream": "users", "namespace": "public",
                "offset": 42, "kind": "FINAL"
            })
        );

        let bare = Checkpoint {
            stream: StreamId::new("orders"),
            offset: Offset(1),
            kind: CheckpointKind::Progress,
        };
        assert!(!bare.to_json_line().unwrap().contains("namespace"));
    }
}
