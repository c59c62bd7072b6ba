//! Configuration for the Ingestion Pipeline
//!
//! Thresholds, concurrency limits, retry policy and output format. Loaded
//! from TOML (all fields optional, missing ones take defaults) and
//! validated before the pipeline starts.

use crate::pipeline::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Flush when the estimated batch size reaches this many bytes
    pub flush_bytes: usize,
    /// Flush when the batch holds this many records
    pub flush_rows: usize,
    /// Flush when the oldest buffered record is this old
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Maximum uploads in flight across all streams
    pub max_concurrent_uploads: usize,
    /// What to do when a stream hits a fatal write failure
    pub failure_policy: StreamFailurePolicy,
    /// Retry policy for object uploads
    pub retry: RetryPolicy,
    /// Output object format
    pub format: OutputFormat,
    /// Compress segment-format objects (requires the `compression` feature)
    pub compression: bool,
    /// Key prefix for every object written
    pub prefix: String,
    /// How often idle streams are checked for interval flushes
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            flush_bytes: 200 * 1024 * 1024, // 200MB
            flush_rows: 100_000,
            flush_interval: Duration::from_secs(60),
            max_concurrent_uploads: 4,
            failure_policy: StreamFailurePolicy::FailFast,
            retry: RetryPolicy::default(),
            format: OutputFormat::JsonLines,
            compression: false,
            prefix: "objsink".to_string(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    /// Configuration for tests (small thresholds, fast retries)
    pub fn test() -> Self {
        PipelineConfig {
            flush_bytes: 64 * 1024, // 64KB
            flush_rows: 100,
            flush_interval: Duration::from_millis(200),
            max_concurrent_uploads: 4,
            failure_policy: StreamFailurePolicy::FailFast,
            retry: RetryPolicy::test(),
            format: OutputFormat::JsonLines,
            compression: false,
            prefix: "test".to_string(),
            tick_interval: Duration::from_millis(20),
        }
    }

    /// Row-count-only triggering: byte and interval thresholds never fire
    pub fn rows_only(flush_rows: usize) -> Self {
        PipelineConfig {
            flush_bytes: usize::MAX,
            flush_rows,
            flush_interval: Duration::from_secs(24 * 3600),
            ..Self::test()
        }
    }

    /// `true` when the pipeline aborts on the first failed stream
    pub fn fail_fast_on_stream_error(&self) -> bool {
        self.failure_policy == StreamFailurePolicy::FailFast
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_bytes == 0 {
            return Err(ConfigError::Invalid("flush_bytes must be > 0".into()));
        }
        if self.flush_rows == 0 {
            return Err(ConfigError::Invalid("flush_rows must be > 0".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid("flush_interval must be > 0".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval must be > 0".into()));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_uploads must be > 0".into(),
            ));
        }
        self.retry.validate().map_err(ConfigError::Invalid)?;
        if self.compression && self.format != OutputFormat::Segment {
            return Err(ConfigError::Invalid(
                "compression is only supported with the segment format".into(),
            ));
        }
        if self.compression && !cfg!(feature = "compression") {
            return Err(ConfigError::Invalid(
                "compression requested but the `compression` feature is not enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&text)
    }
}

/// Behavior when one stream fails permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFailurePolicy {
    /// Stop the whole pipeline. Healthy streams drain what they buffered.
    #[default]
    FailFast,
    /// Mark the stream failed, drop its records, keep the others running
    Isolate,
}

/// Output object format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    JsonLines,
    Csv,
    /// CRC-checked binary segments
    Segment,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::JsonLines => "jsonl",
            OutputFormat::Csv => "csv",
            OutputFormat::Segment => "seg",
        }
    }
}

/// Type of object store backend (selected by the binary)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStoreType {
    /// In-memory store (for tests)
    InMemory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible
    #[cfg(feature = "s3")]
    S3,
}

impl std::str::FromStr for ObjectStoreType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => Ok(ObjectStoreType::InMemory),
            "local" | "local_fs" | "fs" => Ok(ObjectStoreType::LocalFs),
            #[cfg(feature = "s3")]
            "s3" => Ok(ObjectStoreType::S3),
            other => Err(ConfigError::Invalid(format!("unknown store type: {}", other))),
        }
    }
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert!(config.fail_fast_on_stream_error());
        assert_eq!(config.format, OutputFormat::JsonLines);
    }

    #[test]
    fn test_toml_partial_override() {
        let config = PipelineConfig::from_toml_str(
            r#"
            flush_rows = 500
            flush_interval = 1500
            failure_policy = "isolate"
            format = "csv"

            [retry]
            max_attempts = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.flush_rows, 500);
        assert_eq!(config.flush_interval, Duration::from_millis(1500));
        assert_eq!(config.failure_policy, StreamFailurePolicy::Isolate);
        assert!(!config.fail_fast_on_stream_error());
        assert_eq!(config.format, OutputFormat::Csv);
        assert_eq!(config.retry.max_attempts, 7);
        // Untouched fields keep defaults
        assert_eq!(config.max_concurrent_uploads, 4);
        assert_eq!(config.retry.multiplier, RetryPolicy::default().multiplier);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = PipelineConfig::test();
        config.max_concurrent_uploads = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PipelineConfig::test();
        config.flush_rows = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::test();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compression_requires_segment_format() {
        let mut config = PipelineConfig::test();
        config.compression = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            PipelineConfig::from_toml_str("flush_rows = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_store_type_from_str() {
        assert_eq!("local".parse::<ObjectStoreType>().unwrap(), ObjectStoreType::LocalFs);
        assert_eq!("memory".parse::<ObjectStoreType>().unwrap(), ObjectStoreType::InMemory);
        assert!("ftp".parse::<ObjectStoreType>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objsink.toml");
        std::fs::write(&path, "flush_rows = 10\nprefix = \"out\"\n").unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.flush_rows, 10);
        assert_eq!(config.prefix, "out");

        assert!(matches!(
            PipelineConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
