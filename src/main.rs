//! objsink - stream records from stdin into an object store
//!
//! Reads JSON-lines messages on stdin, writes batched objects to the
//! configured store and prints a `{"type":"STATE",...}` line on stdout for
//! every checkpoint. Logs go to stderr.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | OBJSINK_CONFIG | - | Path to a TOML pipeline config |
//! | OBJSINK_STORE | local | memory, local, or s3 |
//! | OBJSINK_DATA_PATH | ./objsink-data | LocalFs root directory |
//! | OBJSINK_S3_BUCKET | - | S3 bucket name |
//! | OBJSINK_S3_ROOT | - | Key root inside the bucket |
//! | AWS_ENDPOINT | - | MinIO / LocalStack endpoint URL |
//! | AWS_REGION | us-east-1 | S3 region |
//! | RUST_LOG | info | Log filter |
//! | OBJSINK_LOG_FORMAT | text | text or json |
//!
//! The first Ctrl-C drains buffered records and exits; a second one aborts
//! in-flight uploads.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use futures::StreamExt;
use objsink::observability::{init_tracing, service_span, LogConfig};
use objsink::pipeline::{
    ConfigError, InMemoryObjectStore, InputError, LocalFsObjectStore, Message, ObjectStore,
    ObjectStoreType, Pipeline, PipelineConfig, RunSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{error, info, warn, Instrument};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_DATA_PATH: &str = "./objsink-data";
const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;
const STATE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-level settings
#[derive(Debug)]
struct Settings {
    config_path: Option<PathBuf>,
    store_type: ObjectStoreType,
    data_path: PathBuf,
}

impl Settings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Settings {
            config_path: std::env::var("OBJSINK_CONFIG").ok().map(PathBuf::from),
            store_type: std::env::var("OBJSINK_STORE")
                .unwrap_or_else(|_| "local".to_string())
                .parse()?,
            data_path: std::env::var("OBJSINK_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_PATH)),
        })
    }

    fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        match &self.config_path {
            Some(path) => PipelineConfig::load(path),
            None => Ok(PipelineConfig::default()),
        }
    }

    fn build_store(&self) -> Result<Arc<dyn ObjectStore>, BoxError> {
        let store: Arc<dyn ObjectStore> = match self.store_type {
            ObjectStoreType::InMemory => {
                warn!("Using in-memory store; objects are discarded on exit");
                Arc::new(InMemoryObjectStore::new())
            }
            ObjectStoreType::LocalFs => Arc::new(LocalFsObjectStore::new(&self.data_path)),
            #[cfg(feature = "s3")]
            ObjectStoreType::S3 => {
                use objsink::pipeline::s3_store::{S3Config, S3ObjectStore};
                Arc::new(S3ObjectStore::new(S3Config::from_env()?)?)
            }
        };
        Ok(store)
    }
}

fn decode_line(line: Result<String, LinesCodecError>) -> Result<Message, InputError> {
    match line {
        Ok(line) => Message::from_json_line(&line),
        Err(LinesCodecError::Io(e)) => Err(InputError::Io(e)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Err(InputError::Malformed(format!(
            "line exceeds {} bytes",
            MAX_LINE_BYTES
        ))),
    }
}

async fn run() -> Result<RunSummary, BoxError> {
    let settings = Settings::from_env()?;
    let config = settings.pipeline_config()?;
    let store = settings.build_store()?;
    info!(
        store = ?settings.store_type,
        format = ?config.format,
        prefix = %config.prefix,
        "Starting objsink"
    );

    let mut pipeline = Pipeline::new(config, store)?;
    let mut checkpoints = pipeline
        .take_checkpoints()
        .ok_or("checkpoint channel already taken")?;
    let shutdown = pipeline.shutdown_handle();

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(checkpoint) = checkpoints.recv().await {
            let line = match checkpoint.to_json_line() {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "Failed to encode checkpoint");
                    continue;
                }
            };
            let written = async {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await
            };
            if let Err(e) = written.await {
                error!(error = %e, "Failed to write checkpoint to stdout");
                break;
            }
        }
    });

    let signals = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, draining buffered records");
            shutdown.soft();
        }
        if signal::ctrl_c().await.is_ok() {
            warn!("Second shutdown signal, aborting uploads");
            shutdown.hard();
        }
    });

    let input = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    )
    .filter(|line| futures::future::ready(!matches!(line, Ok(l) if l.trim().is_empty())))
    .map(decode_line);

    let result = pipeline.run(input).await;
    signals.abort();

    // The channel closes once the pipeline and its upload tasks are gone
    if tokio::time::timeout(STATE_FLUSH_TIMEOUT, printer).await.is_err() {
        warn!("Timed out flushing checkpoints to stdout");
    }

    Ok(result?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let log_config = LogConfig::from_env();
    if let Err(e) = init_tracing(&log_config) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run().instrument(service_span(&log_config)).await {
        Ok(summary) => {
            match serde_json::to_string(&summary) {
                Ok(json) => info!(summary = %json, "objsink finished"),
                Err(_) => info!(records = summary.records, "objsink finished"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "objsink failed");
            ExitCode::FAILURE
        }
    }
}
