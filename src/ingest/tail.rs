//! Resumable reads of a growing log file
//!
//! There is no background watcher: each call reads what is currently on disk
//! past the saved offset and returns. Only newline-terminated lines are
//! handed out, so a writer caught mid-line never produces a truncated event;
//! the partial tail is simply read again on the next call.

use serde::{Deserialize, Serialize};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Byte position up to which a file has been consumed
///
/// `generation` counts how many times the file was found truncated and
/// re-read from the start. Reading never changes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailState {
    pub path: PathBuf,
    pub offset: u64,
    pub generation: u64,
}

impl TailState {
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            generation: 0,
        }
    }

    pub fn start(path: impl Into<PathBuf>) -> Self {
        Self::new(path, 0)
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Same file from the beginning, as a new generation
    pub fn restarted(&self) -> Self {
        Self {
            path: self.path.clone(),
            offset: 0,
            generation: self.generation + 1,
        }
    }

    /// Key under which this file's progress is persisted
    pub fn source_key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// One complete line and the offset just past its terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailLine {
    pub text: String,
    pub end_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailChunk {
    pub lines: Vec<TailLine>,
    /// State to resume from once every line in `lines` is handled
    pub next: TailState,
    /// Nothing more is available right now
    pub reached_end: bool,
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error("{} is {len} bytes, shorter than saved offset {offset}: file was truncated or rotated", path.display())]
    Truncated { path: PathBuf, offset: u64, len: u64 },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TailError {
    fn io(path: &Path, source: io::Error) -> Self {
        TailError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Read the complete lines available after `state.offset`
///
/// Reads roughly `max_bytes` at a time; a single line longer than that is
/// still returned whole. End of file is reported through
/// [`TailChunk::reached_end`], never as an error.
pub async fn read_chunk(state: &TailState, max_bytes: usize) -> Result<TailChunk, TailError> {
    let path = state.path.as_path();
    let max_bytes = max_bytes.max(1) as u64;

    let mut file = File::open(path).await.map_err(|e| TailError::io(path, e))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| TailError::io(path, e))?
        .len();

    if len < state.offset {
        return Err(TailError::Truncated {
            path: state.path.clone(),
            offset: state.offset,
            len,
        });
    }

    file.seek(SeekFrom::Start(state.offset))
        .await
        .map_err(|e| TailError::io(path, e))?;

    let mut buf = Vec::new();
    let eof = loop {
        let scanned = buf.len();
        let read = (&mut file)
            .take(max_bytes)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| TailError::io(path, e))? as u64;
        if read < max_bytes {
            break true;
        }
        if buf[scanned..].contains(&b'\n') {
            break false;
        }
    };

    let mut lines = Vec::new();
    let mut start = 0usize;
    for (idx, byte) in buf.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let mut line = &buf[start..idx];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        lines.push(TailLine {
            text: line_text(line),
            end_offset: state.offset + idx as u64 + 1,
        });
        start = idx + 1;
    }

    let consumed = start as u64;
    if consumed < buf.len() as u64 {
        debug!(
            path = %path.display(),
            pending = buf.len() as u64 - consumed,
            "leaving unterminated line for the next read"
        );
    }

    Ok(TailChunk {
        lines,
        next: TailState {
            path: state.path.clone(),
            offset: state.offset + consumed,
            generation: state.generation,
        },
        reached_end: eof,
    })
}

/// Decode one line, replacing invalid UTF-8 and NUL with U+FFFD
///
/// PostgreSQL text columns reject NUL, and one such line would otherwise
/// fail every batch that carries it.
fn line_text(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    if text.contains('\0') {
        text.replace('\0', "\u{FFFD}")
    } else {
        text.into_owned()
    }
}

/// Stateful convenience over [`read_chunk`]
///
/// Holds the current position in memory only; persisting it is the caller's
/// job.
#[derive(Debug, Clone)]
pub struct Tailer {
    state: TailState,
    max_bytes: usize,
}

impl Tailer {
    pub fn new(state: TailState, max_bytes: usize) -> Self {
        Self { state, max_bytes }
    }

    pub fn state(&self) -> &TailState {
        &self.state
    }

    pub async fn next_chunk(&mut self) -> Result<TailChunk, TailError> {
        let chunk = read_chunk(&self.state, self.max_bytes).await?;
        self.state = chunk.next.clone();
        Ok(chunk)
    }

    /// Read every complete line currently available
    pub async fn drain(&mut self) -> Result<Vec<TailLine>, TailError> {
        let mut lines = Vec::new();
        loop {
            let chunk = self.next_chunk().await?;
            lines.extend(chunk.lines);
            if chunk.reached_end {
                return Ok(lines);
            }
        }
    }
}
