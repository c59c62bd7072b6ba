//! Batch Accumulator
//!
//! Buffers records for one stream and decides when the buffered batch is
//! ready to flush. Purely in-memory and synchronous.
//!
//! A flush is due when the accumulator is non-empty and any threshold is
//! met: estimated bytes, row count, or the age of the oldest buffered record.
//! An empty accumulator never flushes and never yields a batch.

use crate::pipeline::clock::Timestamp;
use crate::pipeline::record::{Offset, Record, StreamId};
use std::fmt;
use std::time::Duration;

/// Flush thresholds for one accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushThresholds {
    pub flush_bytes: usize,
    pub flush_rows: usize,
    pub flush_interval: Duration,
}

/// Which condition caused a batch to be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Bytes,
    Rows,
    Interval,
    /// Forced flush during shutdown
    Drain,
    /// Upstream finished this stream
    StreamComplete,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlushReason::Bytes => "bytes",
            FlushReason::Rows => "rows",
            FlushReason::Interval => "interval",
            FlushReason::Drain => "drain",
            FlushReason::StreamComplete => "stream_complete",
        };
        f.write_str(s)
    }
}

/// Immutable, non-empty batch of records for one stream
#[derive(Debug, Clone)]
pub struct Batch {
    stream: StreamId,
    sequence: u64,
    records: Vec<Record>,
    estimated_bytes: usize,
    max_offset: Offset,
}

impl Batch {
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Per-stream submission sequence number (starts at 1)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always false; kept for the `len` convention
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn max_offset(&self) -> Offset {
        self.max_offset
    }

    pub fn min_offset(&self) -> Offset {
        self.records
            .first()
            .map(|r| r.offset())
            .unwrap_or(self.max_offset)
    }
}

/// Per-stream record buffer
#[derive(Debug)]
pub struct Accumulator {
    stream: StreamId,
    thresholds: FlushThresholds,
    records: Vec<Record>,
    bytes: usize,
    started_at: Option<Timestamp>,
    max_offset: Offset,
}

impl Accumulator {
    pub fn new(stream: StreamId, thresholds: FlushThresholds) -> Self {
        Accumulator {
            stream,
            thresholds,
            records: Vec::new(),
            bytes: 0,
            started_at: None,
            max_offset: Offset::default(),
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Append a record; `now` starts the batch clock on the first record
    pub fn add(&mut self, record: Record, now: Timestamp) {
        debug_assert_eq!(record.stream(), &self.stream);
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.bytes += record.estimated_size();
        self.max_offset = self.max_offset.max(record.offset());
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    /// The threshold that is currently met, if any
    pub fn flush_reason(&self, now: Timestamp) -> Option<FlushReason> {
        let started_at = self.started_at?;
        if self.records.is_empty() {
            return None;
        }
        if self.bytes >= self.thresholds.flush_bytes {
            Some(FlushReason::Bytes)
        } else if self.records.len() >= self.thresholds.flush_rows {
            Some(FlushReason::Rows)
        } else if now.saturating_sub(started_at) >= self.thresholds.flush_interval {
            Some(FlushReason::Interval)
        } else {
            None
        }
    }

    pub fn should_flush(&self, now: Timestamp) -> bool {
        self.flush_reason(now).is_some()
    }

    /// Detach the buffered records as a batch and reset.
    ///
    /// Returns `None` (and changes nothing) when empty.
    pub fn take_batch(&mut self, sequence: u64) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.records);
        let batch = Batch {
            stream: self.stream.clone(),
            sequence,
            records,
            estimated_bytes: self.bytes,
            max_offset: self.max_offset,
        };
        self.bytes = 0;
        self.started_at = None;
        Some(batch)
    }

    /// Throw away the buffered records. Returns how many were discarded.
    pub fn discard(&mut self) -> usize {
        let discarded = self.records.len();
        self.records.clear();
        self.bytes = 0;
        self.started_at = None;
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::record::Payload;
    use serde_json::json;

    fn thresholds(rows: usize) -> FlushThresholds {
        FlushThresholds {
            flush_bytes: usize::MAX,
            flush_rows: rows,
            flush_interval: Duration::from_secs(3600),
        }
    }

    fn record(offset: u64) -> Record {
        let mut data = Payload::new();
        data.insert("id".to_string(), json!(offset));
        Record::new(StreamId::new("users"), Offset(offset), data)
    }

    #[test]
    fn test_empty_never_flushes() {
        let mut acc = Accumulator::new(StreamId::new("users"), FlushThresholds {
            flush_bytes: 0,
            flush_rows: 0,
            flush_interval: Duration::ZERO,
        });
        assert!(!acc.should_flush(Timestamp(u64::MAX)));
        assert!(acc.take_batch(1).is_none());
    }

    #[test]
    fn test_rows_threshold_150_records() {
        let mut acc = Accumulator::new(StreamId::new("users"), thresholds(100));
        let mut batches = Vec::new();
        let mut seq = 0;
        for i in 1..=150 {
            acc.add(record(i), Timestamp::ZERO);
            if acc.should_flush(Timestamp::ZERO) {
                seq += 1;
                batches.push(acc.take_batch(seq).unwrap());
            }
        }
        seq += 1;
        batches.extend(acc.take_batch(seq));

        let sizes: Vec<_> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![100, 50]);
        assert_eq!(batches[0].max_offset(), Offset(100));
        assert_eq!(batches[1].min_offset(), Offset(101));
        assert_eq!(batches[1].max_offset(), Offset(150));
        assert_eq!(batches[1].sequence(), 2);
    }

    #[test]
    fn test_bytes_threshold() {
        let mut acc = Accumulator::new(StreamId::new("users"), FlushThresholds {
            flush_bytes: 200,
            flush_rows: usize::MAX,
            flush_interval: Duration::from_secs(3600),
        });
        while !acc.should_flush(Timestamp::ZERO) {
            acc.add(record(acc.len() as u64), Timestamp::ZERO);
        }
        assert_eq!(acc.flush_reason(Timestamp::ZERO), Some(FlushReason::Bytes));
        assert!(acc.buffered_bytes() >= 200);
        let batch = acc.take_batch(1).unwrap();
        assert_eq!(batch.estimated_bytes(), batch.records().iter().map(|r| r.estimated_size()).sum::<usize>());
        assert_eq!(acc.buffered_bytes(), 0);
    }

    #[test]
    fn test_interval_measured_from_first_record() {
        let mut acc = Accumulator::new(StreamId::new("users"), FlushThresholds {
            flush_bytes: usize::MAX,
            flush_rows: usize::MAX,
            flush_interval: Duration::from_millis(500),
        });
        acc.add(record(1), Timestamp(1000));
        acc.add(record(2), Timestamp(1400));
        assert!(!acc.should_flush(Timestamp(1499)));
        assert_eq!(acc.flush_reason(Timestamp(1500)), Some(FlushReason::Interval));

        acc.take_batch(1).unwrap();
        // Clock restarts with the next batch
        acc.add(record(3), Timestamp(1600));
        assert!(!acc.should_flush(Timestamp(2000)));
        assert!(acc.should_flush(Timestamp(2100)));
    }

    #[test]
    fn test_take_batch_preserves_order_without_loss() {
        let mut acc = Accumulator::new(StreamId::new("users"), thresholds(1000));
        for i in 0..10 {
            acc.add(record(i), Timestamp::ZERO);
        }
        let first = acc.take_batch(1).unwrap();
        for i in 10..15 {
            acc.add(record(i), Timestamp::ZERO);
        }
        let second = acc.take_batch(2).unwrap();
        assert!(acc.take_batch(3).is_none());

        let offsets: Vec<u64> = first
            .records()
            .iter()
            .chain(second.records())
            .map(|r| r.offset().0)
            .collect();
        assert_eq!(offsets, (0..15).collect::<Vec<_>>());
    }

    #[test]
    fn test_discard() {
        let mut acc = Accumulator::new(StreamId::new("users"), thresholds(2));
        acc.add(record(1), Timestamp::ZERO);
        acc.add(record(2), Timestamp::ZERO);
        assert_eq!(acc.discard(), 2);
        assert!(acc.is_empty());
        assert_eq!(acc.buffered_bytes(), 0);
        assert!(!acc.should_flush(Timestamp::ZERO));
        assert!(acc.take_batch(1).is_none());
    }
}
