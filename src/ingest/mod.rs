//! Reading access logs into the event store

pub mod parser;
pub mod pipeline;
pub mod tail;

pub use parser::AccessLogParser;
pub use pipeline::{IngestPipeline, PassSummary, PipelineError};
pub use tail::{read_chunk, TailChunk, TailError, TailLine, TailState, Tailer};
