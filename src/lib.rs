pub mod io;
pub mod buggify;
pub mod observability;
pub mod pipeline;

pub use pipeline::{
    Checkpoint, Message, ObjectStore, Offset, Pipeline, PipelineConfig, PipelineError, Record,
    RunSummary, StreamId,
};
