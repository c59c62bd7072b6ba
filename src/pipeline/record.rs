//! Records, Streams and Upstream Messages
//!
//! The input boundary of the pipeline is an ordered sequence of [`Message`]s:
//! data records tagged with their stream and upstream offset, plus control
//! signals. [`WireMessage`] is the JSON-lines form read by the binary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Structured record payload (key order preserved)
pub type Payload = Map<String, Value>;

/// Fixed per-record overhead added to the payload size estimate
const RECORD_OVERHEAD_BYTES: usize = 24;

/// Logical output stream identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub namespace: Option<String>,
    pub name: String,
}

impl StreamId {
    pub fn new(name: impl Into<String>) -> Self {
        StreamId {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn with_namespace(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        StreamId {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Upstream position token.
///
/// Opaque to the pipeline except for its ordering: offsets within one stream
/// never go backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One data record. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    stream: StreamId,
    offset: Offset,
    emitted_at_ms: u64,
    data: Payload,
    estimated_size: usize,
}

impl Record {
    pub fn new(stream: StreamId, offset: Offset, data: Payload) -> Self {
        Self::with_emitted_at(stream, offset, 0, data)
    }

    pub fn with_emitted_at(
        stream: StreamId,
        offset: Offset,
        emitted_at_ms: u64,
        data: Payload,
    ) -> Self {
        // Map<String, Value> always serializes; the fallback is unreachable
        let payload_len = serde_json::to_vec(&data).map(|v| v.len()).unwrap_or(0);
        let estimated_size = payload_len + stream.name.len() + RECORD_OVERHEAD_BYTES;
        Record {
            stream,
            offset,
            emitted_at_ms,
            data,
            estimated_size,
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn emitted_at_ms(&self) -> u64 {
        self.emitted_at_ms
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    /// Approximate serialized size, used for byte-threshold flushing
    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }
}

/// Message consumed by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A data record
    Record(Record),
    /// No further records will arrive for this stream
    StreamComplete(StreamId),
    /// Upstream finished cleanly
    EndOfStream,
}

impl Message {
    /// Parse one JSON line of the wire format
    pub fn from_json_line(line: &str) -> Result<Message, InputError> {
        let wire: WireMessage =
            serde_json::from_str(line).map_err(|e| InputError::Malformed(e.to_string()))?;
        Ok(wire.into())
    }
}

/// JSON-lines wire form of [`Message`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    Record {
        stream: String,
        #[serde(default)]
        namespace: Option<String>,
        offset: u64,
        #[serde(default)]
        emitted_at: u64,
        data: Payload,
    },
    StreamComplete {
        stream: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    EndOfStream,
}

fn stream_id(namespace: Option<String>, name: String) -> StreamId {
    StreamId { namespace, name }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::Record {
                stream,
                namespace,
                offset,
                emitted_at,
                data,
            } => Message::Record(Record::with_emitted_at(
                stream_id(namespace, stream),
                Offset(offset),
                emitted_at,
                data,
            )),
            WireMessage::StreamComplete { stream, namespace } => {
                Message::StreamComplete(stream_id(namespace, stream))
            }
            WireMessage::EndOfStream => Message::EndOfStream,
        }
    }
}

/// Error reading the upstream message sequence
#[derive(Debug)]
pub enum InputError {
    /// A message could not be parsed
    Malformed(String),
    /// Reading from upstream failed
    Io(std::io::Error),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::Malformed(msg) => write!(f, "Malformed input message: {}", msg),
            InputError::Io(e) => write!(f, "Input I/O error: {}", e),
        }
    }
}

impl std::error::Error for InputError {}

impl From<std::io::Error> for InputError {
    fn from(e: std::io::Error) -> Self {
        InputError::Io(e)
    }
}
