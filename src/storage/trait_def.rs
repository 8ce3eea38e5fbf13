use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

use crate::analytics::models::{DailyAggregate, Dimension, Event, TopRow};
use crate::ingest::tail::TailState;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored data is invalid: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Row counts for the `status` command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Raw events waiting for aggregation (including unparsed ones)
    pub raw_events: i64,
    /// Raw events with no timestamp; these are never aggregated
    pub unparsed_events: i64,
    pub page_rows: i64,
    pub region_rows: i64,
    pub tracked_files: i64,
}

/// Smallest whole second that is not before `cutoff`
///
/// Stored timestamps have second precision, so `occurred_at < bound` holds
/// exactly for events strictly before `cutoff`.
pub fn cutoff_bound(cutoff: DateTime<Utc>) -> i64 {
    if cutoff.timestamp_subsec_nanos() > 0 {
        cutoff.timestamp() + 1
    } else {
        cutoff.timestamp()
    }
}

/// `tail_offsets` column values for a state
pub(crate) fn offset_columns(state: &TailState) -> StorageResult<(i64, i64)> {
    let offset = i64::try_from(state.offset)
        .map_err(|_| StorageError::Corrupt(format!("offset out of range: {}", state.offset)))?;
    let generation = i64::try_from(state.generation).map_err(|_| {
        StorageError::Corrupt(format!("generation out of range: {}", state.generation))
    })?;
    Ok((offset, generation))
}

pub(crate) fn tail_state_from_columns(
    path: &Path,
    offset: i64,
    generation: i64,
) -> StorageResult<TailState> {
    let offset = u64::try_from(offset)
        .map_err(|_| StorageError::Corrupt(format!("negative tail offset: {offset}")))?;
    let generation = u64::try_from(generation)
        .map_err(|_| StorageError::Corrupt(format!("negative tail generation: {generation}")))?;
    Ok(TailState::new(path, offset).with_generation(generation))
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create tables and indexes if they are missing; never drops data
    async fn ensure_schema(&self) -> StorageResult<()>;

    /// Append a batch in arrival order inside one transaction
    ///
    /// Events whose origin is already stored are skipped, so retrying a batch
    /// never adds rows twice. When `checkpoint` is given the file offset is
    /// saved in the same transaction. Returns the number of rows inserted.
    async fn insert_events(
        &self,
        batch: &[Event],
        checkpoint: Option<&TailState>,
    ) -> StorageResult<u64>;

    /// Saved progress for a tailed file
    async fn tail_state(&self, path: &Path) -> StorageResult<Option<TailState>>;

    /// Overwrite saved progress for a tailed file
    async fn save_tail_state(&self, state: &TailState) -> StorageResult<()>;

    /// Fold raw events with a timestamp strictly before `cutoff` into the
    /// daily tables and delete them, atomically. Returns how many were folded.
    async fn aggregate_daily(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;

    /// Keys with the highest totals across all days, ties broken by key
    async fn query_top(&self, dimension: Dimension, limit: i64) -> StorageResult<Vec<TopRow>>;

    /// Daily rows ordered by day then key, optionally from `since` onward
    async fn daily_aggregates(
        &self,
        dimension: Dimension,
        since: Option<NaiveDate>,
    ) -> StorageResult<Vec<DailyAggregate>>;

    /// Raw events still in the store, in insertion order
    async fn raw_events(&self, limit: i64) -> StorageResult<Vec<Event>>;

    async fn stats(&self) -> StorageResult<StoreStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cutoff_bound_rounds_up_fractions() {
        let whole = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(cutoff_bound(whole), whole.timestamp());

        let fractional = whole + chrono::TimeDelta::milliseconds(500);
        assert_eq!(cutoff_bound(fractional), whole.timestamp() + 1);
    }

    #[test]
    fn test_tail_columns_reject_negative_values() {
        let state = TailState::new("/var/log/access.log", 120).with_generation(2);
        assert_eq!(offset_columns(&state).unwrap(), (120, 2));

        let restored = tail_state_from_columns(Path::new("/var/log/access.log"), 120, 2).unwrap();
        assert_eq!(restored, state);

        assert!(matches!(
            tail_state_from_columns(Path::new("/var/log/access.log"), -1, 0),
            Err(StorageError::Corrupt(_))
        ));
    }
}
