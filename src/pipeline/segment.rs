//! Segment Object Format
//!
//! Binary object layout for batches. Records are bincode-framed, the record
//! region is CRC32-checked and optionally zstd-compressed.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (fixed size)              │
//! │ - magic: "OSEG"                  │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - record_count: u32              │
//! │ - offsets: u64 x 2 (min, max)    │
//! │ - header_checksum: u32           │
//! ├──────────────────────────────────┤
//! │ Records (variable)               │
//! │ - length: u32                    │
//! │ - data: bincode(SegmentRecord)   │
//! ├──────────────────────────────────┤
//! │ Footer (fixed size)              │
//! │ - data_checksum: u32             │
//! │ - sizes: u64 x 2                 │
//! │ - footer_magic: "GESO"           │
//! └──────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

pub const SEGMENT_MAGIC: [u8; 4] = *b"OSEG";
pub const FOOTER_MAGIC: [u8; 4] = *b"GESO";
pub const SEGMENT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 40;
const FOOTER_SIZE: usize = 24;

/// Compression options for segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    /// Zstd compression (requires feature)
    #[cfg(feature = "compression")]
    Zstd { level: i32 },
}

impl Compression {
    fn flag(&self) -> u8 {
        match self {
            Compression::None => 0,
            #[cfg(feature = "compression")]
            Compression::Zstd { .. } => 1,
        }
    }

    fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Compression::None),
            #[cfg(feature = "compression")]
            1 => Some(Compression::Zstd { level: 3 }),
            _ => None,
        }
    }
}

/// Segment error types
#[derive(Debug)]
pub enum SegmentError {
    InvalidMagic,
    UnsupportedVersion(u8),
    ChecksumMismatch { expected: u32, actual: u32 },
    Serialization(String),
    Io(std::io::Error),
    /// Truncated header, footer or record region
    Truncated(&'static str),
    Empty,
    UnsupportedCompression(u8),
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentError::InvalidMagic => write!(f, "Invalid segment magic number"),
            SegmentError::UnsupportedVersion(v) => write!(f, "Unsupported segment version: {}", v),
            SegmentError::ChecksumMismatch { expected, actual } => {
                write!(f, "Checksum mismatch: expected {}, got {}", expected, actual)
            }
            SegmentError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            SegmentError::Io(e) => write!(f, "I/O error: {}", e),
            SegmentError::Truncated(what) => write!(f, "Segment truncated: {}", what),
            SegmentError::Empty => write!(f, "Segment is empty"),
            SegmentError::UnsupportedCompression(c) => {
                write!(f, "Unsupported compression flag: {}", c)
            }
        }
    }
}

impl std::error::Error for SegmentError {}

impl From<std::io::Error> for SegmentError {
    fn from(e: std::io::Error) -> Self {
        SegmentError::Io(e)
    }
}

impl From<bincode::Error> for SegmentError {
    fn from(e: bincode::Error) -> Self {
        SegmentError::Serialization(e.to_string())
    }
}

/// One framed record. The payload is kept as JSON bytes so its key order
/// and value types survive the binary encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub offset: u64,
    pub emitted_at_ms: u64,
    pub payload_json: Vec<u8>,
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)?.try_into().ok().map(u32::from_le_bytes)
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    data.get(at..at + 8)?.try_into().ok().map(u64::from_le_bytes)
}

/// Segment header (serialized at start of object)
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHeader {
    pub magic: [u8; 4],
    pub version: u8,
    /// Compression flag
    pub flags: u8,
    pub record_count: u32,
    pub min_offset: u64,
    pub max_offset: u64,
    /// CRC32 of the fields above
    pub header_checksum: u32,
}

impl SegmentHeader {
    fn new(record_count: u32, min_offset: u64, max_offset: u64, compression: Compression) -> Self {
        let mut header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            flags: compression.flag(),
            record_count,
            min_offset,
            max_offset,
            header_checksum: 0,
        };
        header.header_checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.magic);
        hasher.update(&[self.version, self.flags]);
        hasher.update(&self.record_count.to_le_bytes());
        hasher.update(&self.min_offset.to_le_bytes());
        hasher.update(&self.max_offset.to_le_bytes());
        hasher.finalize()
    }

    fn validate(&self) -> Result<(), SegmentError> {
        if self.magic != SEGMENT_MAGIC {
            return Err(SegmentError::InvalidMagic);
        }
        if self.version != SEGMENT_VERSION {
            return Err(SegmentError::UnsupportedVersion(self.version));
        }
        let expected = self.compute_checksum();
        if self.header_checksum != expected {
            return Err(SegmentError::ChecksumMismatch {
                expected,
                actual: self.header_checksum,
            });
        }
        Ok(())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&self.magic);
        buf.push(self.version);
        buf.push(self.flags);
        buf.extend_from_slice(&self.record_count.to_le_bytes());
        buf.extend_from_slice(&self.min_offset.to_le_bytes());
        buf.extend_from_slice(&self.max_offset.to_le_bytes());
        buf.extend_from_slice(&self.header_checksum.to_le_bytes());
        buf.resize(HEADER_SIZE, 0);
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self, SegmentError> {
        if data.len() < HEADER_SIZE {
            return Err(SegmentError::Truncated("header"));
        }
        let short = || SegmentError::Truncated("header");
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        Ok(SegmentHeader {
            magic,
            version: data[4],
            flags: data[5],
            record_count: read_u32(data, 6).ok_or_else(short)?,
            min_offset: read_u64(data, 10).ok_or_else(short)?,
            max_offset: read_u64(data, 18).ok_or_else(short)?,
            header_checksum: read_u32(data, 26).ok_or_else(short)?,
        })
    }
}

/// Segment footer (serialized at end of object)
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFooter {
    /// CRC32 of the uncompressed record region
    pub data_checksum: u32,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub footer_magic: [u8; 4],
}

impl SegmentFooter {
    fn new(data_checksum: u32, uncompressed_size: u64, compressed_size: u64) -> Self {
        SegmentFooter {
            data_checksum,
            uncompressed_size,
            compressed_size,
            footer_magic: FOOTER_MAGIC,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        buf.extend_from_slice(&self.data_checksum.to_le_bytes());
        buf.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        buf.extend_from_slice(&self.compressed_size.to_le_bytes());
        buf.extend_from_slice(&self.footer_magic);
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self, SegmentError> {
        if data.len() < FOOTER_SIZE {
            return Err(SegmentError::Truncated("footer"));
        }
        let short = || SegmentError::Truncated("footer");
        let mut footer_magic = [0u8; 4];
        footer_magic.copy_from_slice(&data[20..24]);
        if footer_magic != FOOTER_MAGIC {
            return Err(SegmentError::InvalidMagic);
        }
        Ok(SegmentFooter {
            data_checksum: read_u32(data, 0).ok_or_else(short)?,
            uncompressed_size: read_u64(data, 4).ok_or_else(short)?,
            compressed_size: read_u64(data, 12).ok_or_else(short)?,
            footer_magic,
        })
    }
}

/// Builds one segment object
pub struct SegmentWriter {
    compression: Compression,
    record_data: Vec<u8>,
    record_count: u32,
    min_offset: u64,
    max_offset: u64,
}

impl SegmentWriter {
    pub fn new(compression: Compression) -> Self {
        SegmentWriter {
            compression,
            record_data: Vec::new(),
            record_count: 0,
            min_offset: u64::MAX,
            max_offset: 0,
        }
    }

    pub fn write_record(&mut self, record: &SegmentRecord) -> Result<(), SegmentError> {
        let data = bincode::serialize(record)?;

        self.min_offset = self.min_offset.min(record.offset);
        self.max_offset = self.max_offset.max(record.offset);

        self.record_data
            .extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.record_data.extend_from_slice(&data);
        self.record_count += 1;

        debug_assert!(self.min_offset <= self.max_offset);
        Ok(())
    }

    pub fn estimated_size(&self) -> usize {
        HEADER_SIZE + self.record_data.len() + FOOTER_SIZE
    }

    pub fn record_count(&self) -> usize {
        self.record_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Finalize and return the complete segment bytes
    pub fn finish(self) -> Result<Vec<u8>, SegmentError> {
        if self.record_count == 0 {
            return Err(SegmentError::Empty);
        }

        let data_checksum = crc32fast::hash(&self.record_data);
        let uncompressed_size = self.record_data.len() as u64;

        let final_data = match self.compression {
            Compression::None => self.record_data,
            #[cfg(feature = "compression")]
            Compression::Zstd { level } => zstd::encode_all(self.record_data.as_slice(), level)?,
        };
        let compressed_size = final_data.len() as u64;

        let header = SegmentHeader::new(
            self.record_count,
            self.min_offset,
            self.max_offset,
            self.compression,
        );
        let footer = SegmentFooter::new(data_checksum, uncompressed_size, compressed_size);

        let mut segment = Vec::with_capacity(HEADER_SIZE + final_data.len() + FOOTER_SIZE);
        segment.extend_from_slice(&header.to_bytes());
        segment.extend_from_slice(&final_data);
        segment.extend_from_slice(&footer.to_bytes());
        Ok(segment)
    }
}

/// Parses and validates a segment object
pub struct SegmentReader {
    header: SegmentHeader,
    footer: SegmentFooter,
    compression: Compression,
    record_data: Vec<u8>,
}

impl SegmentReader {
    pub fn open(data: &[u8]) -> Result<Self, SegmentError> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(SegmentError::Truncated("segment"));
        }

        let header = SegmentHeader::from_bytes(&data[..HEADER_SIZE])?;
        header.validate()?;

        let footer_start = data.len() - FOOTER_SIZE;
        let footer = SegmentFooter::from_bytes(&data[footer_start..])?;

        let compression = Compression::from_flag(header.flags)
            .ok_or(SegmentError::UnsupportedCompression(header.flags))?;

        Ok(SegmentReader {
            header,
            footer,
            compression,
            record_data: data[HEADER_SIZE..footer_start].to_vec(),
        })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn footer(&self) -> &SegmentFooter {
        &self.footer
    }

    fn decompress_data(&self) -> Result<Vec<u8>, SegmentError> {
        match self.compression {
            Compression::None => Ok(self.record_data.clone()),
            #[cfg(feature = "compression")]
            Compression::Zstd { .. } => Ok(zstd::decode_all(self.record_data.as_slice())?),
        }
    }

    /// Decode every record, verifying the data checksum first
    pub fn read_all(&self) -> Result<Vec<SegmentRecord>, SegmentError> {
        let data = self.decompress_data()?;
        let actual = crc32fast::hash(&data);
        if actual != self.footer.data_checksum {
            return Err(SegmentError::ChecksumMismatch {
                expected: self.footer.data_checksum,
                actual,
            });
        }

        let mut records = Vec::with_capacity(self.header.record_count as usize);
        let mut pos = 0;
        for _ in 0..self.header.record_count {
            let len = read_u32(&data, pos).ok_or(SegmentError::Truncated("record length"))? as usize;
            pos += 4;
            let body = data
                .get(pos..pos + len)
                .ok_or(SegmentError::Truncated("record body"))?;
            records.push(bincode::deserialize(body)?);
            pos += len;
        }
        Ok(records)
    }
}
