//! Batch Serializers
//!
//! A [`Serializer`] turns a [`Batch`] into the bytes of one storage object
//! and can decode those bytes back into records. The writer holds it as a
//! trait object, so the output format is chosen once at configuration time.
//!
//! Every format carries the upstream offset and emission time of each
//! record next to its payload:
//!
//! - `jsonl`: one `{"offset":..,"emitted_at":..,"data":{..}}` object per line
//! - `csv`: header `offset,emitted_at,data`, payload as a JSON string column
//! - `seg`: binary segment (see [`crate::pipeline::segment`])

use crate::pipeline::accumulator::Batch;
use crate::pipeline::config::OutputFormat;
use crate::pipeline::record::{Offset, Payload};
use crate::pipeline::segment::{Compression, SegmentError, SegmentReader, SegmentRecord, SegmentWriter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Record recovered from a stored object
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub offset: Offset,
    pub emitted_at_ms: u64,
    pub data: Payload,
}

/// Serialization errors
#[derive(Debug)]
pub enum SerializeError {
    Json(String),
    Segment(SegmentError),
    /// Bytes do not match the expected layout
    Malformed(String),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::Json(msg) => write!(f, "JSON error: {}", msg),
            SerializeError::Segment(e) => write!(f, "Segment error: {}", e),
            SerializeError::Malformed(msg) => write!(f, "Malformed object: {}", msg),
        }
    }
}

impl std::error::Error for SerializeError {}

impl From<serde_json::Error> for SerializeError {
    fn from(e: serde_json::Error) -> Self {
        SerializeError::Json(e.to_string())
    }
}

impl From<SegmentError> for SerializeError {
    fn from(e: SegmentError) -> Self {
        SerializeError::Segment(e)
    }
}

/// Output format capability
pub trait Serializer: Send + Sync + 'static {
    fn format(&self) -> OutputFormat;

    /// File extension used in object keys
    fn extension(&self) -> &'static str {
        self.format().extension()
    }

    fn serialize(&self, batch: &Batch) -> Result<Vec<u8>, SerializeError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<DecodedRecord>, SerializeError>;
}

/// Build the serializer for a configured format
pub fn serializer_for(format: OutputFormat, compression: bool) -> Arc<dyn Serializer> {
    match format {
        OutputFormat::JsonLines => Arc::new(JsonLinesSerializer),
        OutputFormat::Csv => Arc::new(CsvSerializer),
        OutputFormat::Segment => {
            #[cfg(feature = "compression")]
            let compression = if compression {
                Compression::Zstd { level: 3 }
            } else {
                Compression::None
            };
            #[cfg(not(feature = "compression"))]
            let compression = {
                // Rejected by PipelineConfig::validate
                let _ = compression;
                Compression::None
            };
            Arc::new(SegmentSerializer::new(compression))
        }
    }
}

#[derive(Serialize)]
struct JsonLineRef<'a> {
    offset: u64,
    emitted_at: u64,
    data: &'a Payload,
}

#[derive(Deserialize)]
struct JsonLine {
    offset: u64,
    emitted_at: u64,
    data: Payload,
}

/// Newline-delimited JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesSerializer;

impl Serializer for JsonLinesSerializer {
    fn format(&self) -> OutputFormat {
        OutputFormat::JsonLines
    }

    fn serialize(&self, batch: &Batch) -> Result<Vec<u8>, SerializeError> {
        let mut out = Vec::with_capacity(batch.estimated_bytes());
        for record in batch.records() {
            let line = JsonLineRef {
                offset: record.offset().0,
                emitted_at: record.emitted_at_ms(),
                data: record.data(),
            };
            serde_json::to_writer(&mut out, &line)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<DecodedRecord>, SerializeError> {
        bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| {
                let parsed: JsonLine = serde_json::from_slice(line)?;
                Ok(DecodedRecord {
                    offset: Offset(parsed.offset),
                    emitted_at_ms: parsed.emitted_at,
                    data: parsed.data,
                })
            })
            .collect()
    }
}

const CSV_HEADER: &str = "offset,emitted_at,data";

/// CSV with the payload kept as one JSON column
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSerializer;

impl CsvSerializer {
    fn quote(field: &str, out: &mut String) {
        out.push('"');
        for c in field.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
    }

    /// Split one CSV row into fields; returns the fields and the rest of the input
    fn parse_row(input: &str) -> Result<(Vec<String>, &str), SerializeError> {
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut chars = input.char_indices().peekable();
        let mut in_quotes = false;

        while let Some((i, c)) = chars.next() {
            if in_quotes {
                if c == '"' {
                    if matches!(chars.peek(), Some((_, '"'))) {
                        field.push('"');
                        chars.next();
                    } else {
                        in_quotes = false;
                    }
                } else {
                    field.push(c);
                }
                continue;
            }
            match c {
                '"' => in_quotes = true,
                ',' => fields.push(std::mem::take(&mut field)),
                '\n' => {
                    fields.push(field);
                    return Ok((fields, &input[i + 1..]));
                }
                '\r' => {}
                _ => field.push(c),
            }
        }
        if in_quotes {
            return Err(SerializeError::Malformed("unterminated quoted field".into()));
        }
        fields.push(field);
        Ok((fields, ""))
    }
}

impl Serializer for CsvSerializer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Csv
    }

    fn serialize(&self, batch: &Batch) -> Result<Vec<u8>, SerializeError> {
        let mut out = String::with_capacity(batch.estimated_bytes() + CSV_HEADER.len() + 1);
        out.push_str(CSV_HEADER);
        out.push('\n');
        for record in batch.records() {
            let data = serde_json::to_string(record.data())?;
            out.push_str(&record.offset().0.to_string());
            out.push(',');
            out.push_str(&record.emitted_at_ms().to_string());
            out.push(',');
            Self::quote(&data, &mut out);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<DecodedRecord>, SerializeError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SerializeError::Malformed(format!("not UTF-8: {}", e)))?;
        let (header, mut rest) = Self::parse_row(text)?;
        if header.join(",") != CSV_HEADER {
            return Err(SerializeError::Malformed(format!(
                "unexpected header: {:?}",
                header
            )));
        }

        let mut records = Vec::new();
        while !rest.is_empty() {
            let (fields, next) = Self::parse_row(rest)?;
            rest = next;
            let [offset, emitted_at, data] = fields.as_slice() else {
                return Err(SerializeError::Malformed(format!(
                    "expected 3 columns, got {}",
                    fields.len()
                )));
            };
            let parse_u64 = |s: &str, name: &str| {
                s.parse::<u64>()
                    .map_err(|e| SerializeError::Malformed(format!("bad {} {:?}: {}", name, s, e)))
            };
            records.push(DecodedRecord {
                offset: Offset(parse_u64(offset.as_str(), "offset")?),
                emitted_at_ms: parse_u64(emitted_at.as_str(), "emitted_at")?,
                data: serde_json::from_str(data)?,
            });
        }
        Ok(records)
    }
}

/// Binary segment objects
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentSerializer {
    compression: Compression,
}

impl SegmentSerializer {
    pub fn new(compression: Compression) -> Self {
        SegmentSerializer { compression }
    }
}

impl Serializer for SegmentSerializer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Segment
    }

    fn serialize(&self, batch: &Batch) -> Result<Vec<u8>, SerializeError> {
        let mut writer = SegmentWriter::new(self.compression);
        for record in batch.records() {
            writer.write_record(&SegmentRecord {
                offset: record.offset().0,
                emitted_at_ms: record.emitted_at_ms(),
                payload_json: serde_json::to_vec(record.data())?,
            })?;
        }
        Ok(writer.finish()?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<DecodedRecord>, SerializeError> {
        SegmentReader::open(bytes)?
            .read_all()?
            .into_iter()
            .map(|r| {
                Ok(DecodedRecord {
                    offset: Offset(r.offset),
                    emitted_at_ms: r.emitted_at_ms,
                    data: serde_json::from_slice(&r.payload_json)?,
                })
            })
            .collect()
    }
}
