//! Tail → parse → batch → store loop
//!
//! Each batch is written together with the offset just past its last line,
//! in one transaction. A crash between batches therefore resumes exactly
//! after the last committed line, and a batch retried after a failed commit
//! is deduplicated by line origin.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::analytics::models::{Event, LineOrigin};
use crate::config::{TailConfig, TruncatePolicy};
use crate::ingest::parser::AccessLogParser;
use crate::ingest::tail::{TailError, TailState, Tailer};
use crate::storage::{EventStore, StorageError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Tail(#[from] TailError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PipelineError {
    pub fn is_truncation(&self) -> bool {
        matches!(self, PipelineError::Tail(TailError::Truncated { .. }))
    }
}

/// What one or more passes over a file did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Complete lines read
    pub lines: u64,
    /// Rows actually added; lower than `lines` when a retry hit stored lines
    pub inserted: u64,
    pub batches: u64,
    /// Committed offset after the pass
    pub offset: u64,
    /// The file was found truncated and re-read from the start
    pub restarted: bool,
}

impl PassSummary {
    fn absorb(&mut self, pass: &PassSummary) {
        self.lines += pass.lines;
        self.inserted += pass.inserted;
        self.batches += pass.batches;
        self.offset = pass.offset;
        self.restarted |= pass.restarted;
    }
}

pub struct IngestPipeline {
    store: Arc<dyn EventStore>,
    parser: AccessLogParser,
    batch_size: usize,
    max_chunk_bytes: usize,
    on_truncate: TruncatePolicy,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn EventStore>, parser: AccessLogParser, config: &TailConfig) -> Self {
        Self {
            store,
            parser,
            batch_size: config.batch_size.max(1),
            max_chunk_bytes: config.max_chunk_bytes,
            on_truncate: config.on_truncate,
        }
    }

    /// Ingest everything currently in `path` past the saved offset
    pub async fn run_once(&self, path: &Path) -> Result<PassSummary, PipelineError> {
        let state = self
            .store
            .tail_state(path)
            .await?
            .unwrap_or_else(|| TailState::start(path));

        let mut summary = PassSummary {
            offset: state.offset,
            ..PassSummary::default()
        };

        match self.drain_from(&state, &mut summary).await {
            Err(PipelineError::Tail(TailError::Truncated { offset, len, .. }))
                if self.on_truncate == TruncatePolicy::Restart =>
            {
                let restarted = state.restarted();
                warn!(
                    path = %path.display(),
                    saved_offset = offset,
                    file_len = len,
                    generation = restarted.generation,
                    "log file shrank below saved offset, re-reading from the start"
                );
                self.store.save_tail_state(&restarted).await?;
                summary.offset = 0;
                summary.restarted = true;
                self.drain_from(&restarted, &mut summary).await?;
            }
            other => other?,
        }

        debug!(
            path = %path.display(),
            lines = summary.lines,
            inserted = summary.inserted,
            batches = summary.batches,
            offset = summary.offset,
            "ingest pass finished"
        );
        Ok(summary)
    }

    /// Repeat [`IngestPipeline::run_once`] every `poll_interval` until
    /// `shutdown` turns true
    ///
    /// Read and store failures are logged and retried on the next poll. A
    /// pass already in progress finishes before shutdown is honoured. A zero
    /// interval polls every millisecond.
    pub async fn follow(
        &self,
        path: &Path,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PassSummary, PipelineError> {
        let mut total = PassSummary::default();
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let mut interval = time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(path = %path.display(), ?poll_interval, "following log file");
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once(path).await {
                        Ok(pass) => total.absorb(&pass),
                        Err(err) if err.is_truncation() => return Err(err),
                        Err(err) => warn!(path = %path.display(), "ingest pass failed: {err}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(path = %path.display(), lines = total.lines, "stopped following log file");
        Ok(total)
    }

    async fn drain_from(
        &self,
        state: &TailState,
        summary: &mut PassSummary,
    ) -> Result<(), PipelineError> {
        let source = state.source_key();
        let mut tailer = Tailer::new(state.clone(), self.max_chunk_bytes);
        let mut batch: Vec<Event> = Vec::with_capacity(self.batch_size);
        let mut pending_end = state.offset;

        loop {
            let chunk = match tailer.next_chunk().await {
                Ok(chunk) => chunk,
                Err(err) => {
                    // Lines already parsed are still good; keep them
                    let checkpoint = self.checkpoint(state, pending_end);
                    self.flush(&mut batch, &checkpoint, summary).await?;
                    return Err(err.into());
                }
            };

            for line in chunk.lines {
                let origin = LineOrigin {
                    source: source.clone(),
                    generation: state.generation,
                    end_offset: line.end_offset,
                };
                batch.push(self.parser.parse(&line.text).with_origin(origin));
                summary.lines += 1;
                pending_end = line.end_offset;

                if batch.len() >= self.batch_size {
                    let checkpoint = self.checkpoint(state, pending_end);
                    self.flush(&mut batch, &checkpoint, summary).await?;
                }
            }

            if chunk.reached_end {
                // A partial batch at end of stream is written now rather
                // than waiting for more lines that may never come
                self.flush(&mut batch, &chunk.next, summary).await?;
                return Ok(());
            }
        }
    }

    fn checkpoint(&self, state: &TailState, offset: u64) -> TailState {
        TailState::new(state.path.clone(), offset).with_generation(state.generation)
    }

    async fn flush(
        &self,
        batch: &mut Vec<Event>,
        checkpoint: &TailState,
        summary: &mut PassSummary,
    ) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let inserted = self.store.insert_events(batch, Some(checkpoint)).await?;
        debug!(
            size = batch.len(),
            inserted,
            offset = checkpoint.offset,
            "flushed batch"
        );
        if inserted < batch.len() as u64 {
            info!(
                skipped = batch.len() as u64 - inserted,
                "batch contained lines that were already stored"
            );
        }

        summary.batches += 1;
        summary.inserted += inserted;
        summary.offset = checkpoint.offset;
        batch.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::models::{DailyAggregate, Dimension, Region, TopRow};
    use crate::analytics::region::{CidrTable, RegionLookup};
    use crate::storage::{SqliteStore, StorageResult, StoreStats};
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, Utc};
    use std::io::{Seek, SeekFrom, Write};
    use std::net::IpAddr;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    const LINE: &str = r#"8.8.8.8 - - [01/May/2024:10:00:00 +0000] "GET /a HTTP/1.1" 200 10 "-" "curl""#;

    /// Records batch sizes while delegating to a real store
    struct RecordingStore {
        inner: SqliteStore,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EventStore for RecordingStore {
        async fn ensure_schema(&self) -> StorageResult<()> {
            self.inner.ensure_schema().await
        }

        async fn insert_events(
            &self,
            batch: &[Event],
            checkpoint: Option<&TailState>,
        ) -> StorageResult<u64> {
            self.batches.lock().unwrap().push(batch.len());
            self.inner.insert_events(batch, checkpoint).await
        }

        async fn tail_state(&self, path: &Path) -> StorageResult<Option<TailState>> {
            self.inner.tail_state(path).await
        }

        async fn save_tail_state(&self, state: &TailState) -> StorageResult<()> {
            self.inner.save_tail_state(state).await
        }

        async fn aggregate_daily(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
            self.inner.aggregate_daily(cutoff).await
        }

        async fn query_top(&self, dimension: Dimension, limit: i64) -> StorageResult<Vec<TopRow>> {
            self.inner.query_top(dimension, limit).await
        }

        async fn daily_aggregates(
            &self,
            dimension: Dimension,
            since: Option<NaiveDate>,
        ) -> StorageResult<Vec<DailyAggregate>> {
            self.inner.daily_aggregates(dimension, since).await
        }

        async fn raw_events(&self, limit: i64) -> StorageResult<Vec<Event>> {
            self.inner.raw_events(limit).await
        }

        async fn stats(&self) -> StorageResult<StoreStats> {
            self.inner.stats().await
        }
    }

    /// Empties the log file when asked to resolve `trigger`, so the next
    /// read of the same pass finds it truncated
    struct TruncatingLookup {
        path: PathBuf,
        trigger: IpAddr,
    }

    impl RegionLookup for TruncatingLookup {
        fn resolve(&self, ip: IpAddr) -> Region {
            if ip == self.trigger {
                std::fs::OpenOptions::new()
                    .write(true)
                    .open(&self.path)
                    .unwrap()
                    .set_len(0)
                    .unwrap();
            }
            Region::known("US")
        }
    }

    async fn recording_store() -> Arc<RecordingStore> {
        let inner = SqliteStore::new("sqlite::memory:", 1).await.unwrap();
        inner.ensure_schema().await.unwrap();
        Arc::new(RecordingStore {
            inner,
            batches: Mutex::new(Vec::new()),
        })
    }

    fn parser() -> AccessLogParser {
        AccessLogParser::new(Arc::new(CidrTable::parse("8.8.8.0/24,US\n").unwrap()))
    }

    fn tail_config(batch_size: usize, on_truncate: TruncatePolicy) -> TailConfig {
        TailConfig {
            batch_size,
            on_truncate,
            ..TailConfig::default()
        }
    }

    fn append(file: &mut NamedTempFile, lines: usize) {
        for _ in 0..lines {
            writeln!(file, "{LINE}").unwrap();
        }
        file.flush().unwrap();
    }

    #[tokio::test]
    async fn test_trailing_partial_batch_is_flushed() {
        let store = recording_store().await;
        let pipeline = IngestPipeline::new(
            store.clone(),
            parser(),
            &tail_config(2, TruncatePolicy::Restart),
        );
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, 3);

        let summary = pipeline.run_once(file.path()).await.unwrap();

        assert_eq!(*store.batches.lock().unwrap(), vec![2, 1]);
        assert_eq!(summary.lines, 3);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.batches, 2);

        let saved = store.tail_state(file.path()).await.unwrap().unwrap();
        assert_eq!(saved.offset, summary.offset);
        assert_eq!(saved.offset, std::fs::metadata(file.path()).unwrap().len());
    }

    #[tokio::test]
    async fn test_second_pass_only_reads_new_lines() {
        let store = recording_store().await;
        let pipeline = IngestPipeline::new(
            store.clone(),
            parser(),
            &tail_config(10, TruncatePolicy::Restart),
        );
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, 2);
        pipeline.run_once(file.path()).await.unwrap();

        let idle = pipeline.run_once(file.path()).await.unwrap();
        assert_eq!(idle.lines, 0);
        assert_eq!(idle.batches, 0);

        append(&mut file, 1);
        let pass = pipeline.run_once(file.path()).await.unwrap();
        assert_eq!(pass.lines, 1);
        assert_eq!(store.stats().await.unwrap().raw_events, 3);
    }

    #[tokio::test]
    async fn test_truncated_file_restarts_as_new_generation() {
        let store = recording_store().await;
        let pipeline = IngestPipeline::new(
            store.clone(),
            parser(),
            &tail_config(10, TruncatePolicy::Restart),
        );
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, 3);
        pipeline.run_once(file.path()).await.unwrap();

        file.as_file().set_len(0).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        append(&mut file, 1);

        let pass = pipeline.run_once(file.path()).await.unwrap();
        assert!(pass.restarted);
        assert_eq!(pass.lines, 1);
        assert_eq!(pass.inserted, 1);

        let saved = store.tail_state(file.path()).await.unwrap().unwrap();
        assert_eq!(saved.generation, 1);
        assert_eq!(store.stats().await.unwrap().raw_events, 4);
    }

    #[tokio::test]
    async fn test_abort_policy_reports_truncation() {
        let store = recording_store().await;
        let pipeline = IngestPipeline::new(
            store.clone(),
            parser(),
            &tail_config(10, TruncatePolicy::Abort),
        );
        let file = NamedTempFile::new().unwrap();
        store
            .save_tail_state(&TailState::new(file.path(), 500))
            .await
            .unwrap();

        let err = pipeline.run_once(file.path()).await.unwrap_err();
        assert!(err.is_truncation());

        let saved = store.tail_state(file.path()).await.unwrap().unwrap();
        assert_eq!(saved.offset, 500);
    }

    #[tokio::test]
    async fn test_follow_stops_on_shutdown() {
        let store = recording_store().await;
        let pipeline = IngestPipeline::new(
            store.clone(),
            parser(),
            &tail_config(1, TruncatePolicy::Restart),
        );
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, 2);

        let (tx, rx) = watch::channel(false);
        let path = file.path().to_path_buf();
        let handle = tokio::spawn(async move {
            pipeline
                .follow(&path, Duration::from_millis(10), rx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let total = handle.await.unwrap().unwrap();
        assert_eq!(total.lines, 2);
        assert_eq!(total.inserted, 2);
    }

    #[tokio::test]
    async fn test_oversized_field_does_not_block_the_batch() {
        let store = recording_store().await;
        let pipeline = IngestPipeline::new(
            store.clone(),
            parser(),
            &tail_config(3, TruncatePolicy::Restart),
        );
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, 1);
        writeln!(file, "{}", LINE.replace(" 10 ", " 18446744073709551615 ")).unwrap();
        append(&mut file, 1);

        let summary = pipeline.run_once(file.path()).await.unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.offset, std::fs::metadata(file.path()).unwrap().len());

        let stored = store.raw_events(10).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored[1].bytes.is_none());
        assert!(stored[1].raw_line.contains("18446744073709551615"));
        assert_eq!(stored[1].path.as_deref(), Some("/a"));
    }

    #[tokio::test]
    async fn test_read_error_mid_pass_keeps_parsed_lines() {
        let store = recording_store().await;
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, 1);
        writeln!(file, "{}", LINE.replacen("8.8.8.8", "9.9.9.9", 1)).unwrap();
        append(&mut file, 1);

        let lookup = TruncatingLookup {
            path: file.path().to_path_buf(),
            trigger: "9.9.9.9".parse().unwrap(),
        };
        let config = TailConfig {
            batch_size: 10,
            // one line per read
            max_chunk_bytes: LINE.len() + 1,
            on_truncate: TruncatePolicy::Abort,
            ..TailConfig::default()
        };
        let pipeline = IngestPipeline::new(
            store.clone(),
            AccessLogParser::new(Arc::new(lookup)),
            &config,
        );

        let err = pipeline.run_once(file.path()).await.unwrap_err();
        assert!(err.is_truncation());

        assert_eq!(*store.batches.lock().unwrap(), vec![2]);
        assert_eq!(store.stats().await.unwrap().raw_events, 2);
        let saved = store.tail_state(file.path()).await.unwrap().unwrap();
        assert_eq!(saved.offset, 2 * (LINE.len() as u64 + 1));
        assert_eq!(saved.generation, 0);
    }

    #[tokio::test]
    async fn test_follow_with_zero_interval() {
        let store = recording_store().await;
        let pipeline = IngestPipeline::new(
            store.clone(),
            parser(),
            &tail_config(1, TruncatePolicy::Restart),
        );
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, 2);

        let (tx, rx) = watch::channel(false);
        let path = file.path().to_path_buf();
        let handle =
            tokio::spawn(async move { pipeline.follow(&path, Duration::ZERO, rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let total = handle.await.unwrap().unwrap();
        assert_eq!(total.lines, 2);
        assert_eq!(store.stats().await.unwrap().raw_events, 2);
    }
}
