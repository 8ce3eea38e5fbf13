//! Daily aggregation of raw events
//!
//! Raw events strictly older than a cutoff are folded into per-day counts
//! (one table per dimension) and removed from the raw table in the same
//! transaction. Running again with the same or an earlier cutoff finds
//! nothing left to fold, and a later cutoff only picks up the delta.
//!
//! Weekly and monthly views are derived from the daily tables at report time.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::analytics::models::{
    DailyAggregate, Dimension, Period, PeriodAggregate, TopRow, MISSING_PATH,
};
use crate::analytics::storage::ConsumedRow;
use crate::clock::Clock;
use crate::storage::{EventStore, StorageError, StorageResult};
use crate::timespec::{parse_time_expr, TimeExprError};

/// Per-day counts for every dimension, built from consumed raw rows
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DailyTally {
    pages: BTreeMap<(NaiveDate, String), i64>,
    regions: BTreeMap<(NaiveDate, String), i64>,
}

impl DailyTally {
    pub fn from_rows(rows: &[ConsumedRow]) -> StorageResult<Self> {
        let mut tally = Self::default();
        for row in rows {
            let day = DateTime::from_timestamp(row.occurred_at, 0)
                .ok_or_else(|| {
                    StorageError::Corrupt(format!("timestamp out of range: {}", row.occurred_at))
                })?
                .date_naive();

            let page = row.path.clone().unwrap_or_else(|| MISSING_PATH.to_string());
            *tally.pages.entry((day, page)).or_insert(0) += 1;
            *tally.regions.entry((day, row.region.clone())).or_insert(0) += 1;
        }
        Ok(tally)
    }

    pub fn rows(&self, dimension: Dimension) -> Vec<DailyAggregate> {
        let counts = match dimension {
            Dimension::Page => &self.pages,
            Dimension::Region => &self.regions,
        };
        counts
            .iter()
            .map(|((day, key), count)| DailyAggregate {
                day: *day,
                key: key.clone(),
                count: *count,
            })
            .collect()
    }
}

/// Outcome of one aggregation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregationReport {
    pub cutoff: DateTime<Utc>,
    pub events_aggregated: u64,
}

/// Drives aggregation runs and reporting queries against an event store
pub struct Aggregator {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Turn an optional user expression into a cutoff, defaulting to now
    pub fn resolve_cutoff(&self, before: Option<&str>) -> Result<DateTime<Utc>, TimeExprError> {
        let now = self.clock.now();
        match before {
            Some(expr) => parse_time_expr(expr, now),
            None => Ok(now),
        }
    }

    /// Fold every raw event older than `before` (default: now) into the
    /// daily tables
    pub async fn run(&self, before: Option<DateTime<Utc>>) -> StorageResult<AggregationReport> {
        let cutoff = before.unwrap_or_else(|| self.clock.now());
        debug!(%cutoff, "aggregating raw events");

        let events_aggregated = self.store.aggregate_daily(cutoff).await?;
        info!(%cutoff, events_aggregated, "aggregation finished");

        Ok(AggregationReport {
            cutoff,
            events_aggregated,
        })
    }

    pub async fn top(&self, dimension: Dimension, limit: i64) -> StorageResult<Vec<TopRow>> {
        self.store.query_top(dimension, limit).await
    }

    /// Largest single-day counts for `dimension`
    pub async fn top_days(
        &self,
        dimension: Dimension,
        limit: usize,
    ) -> StorageResult<Vec<PeriodAggregate>> {
        let daily = self.store.daily_aggregates(dimension, None).await?;
        Ok(busiest_days(&daily, limit))
    }

    /// Top `limit` keys of each period, periods oldest first
    pub async fn rollup_report(
        &self,
        dimension: Dimension,
        period: Period,
        limit: usize,
    ) -> StorageResult<Vec<PeriodAggregate>> {
        let daily = self.store.daily_aggregates(dimension, None).await?;
        let mut per_period: BTreeMap<NaiveDate, Vec<PeriodAggregate>> = BTreeMap::new();
        for row in rollup(&daily, period) {
            per_period.entry(row.period_start).or_default().push(row);
        }

        Ok(per_period
            .into_values()
            .flat_map(|rows| rows.into_iter().take(limit))
            .collect())
    }
}

/// The `limit` largest daily rows, highest count first
///
/// Ties go to the earlier day, then to the key.
pub fn busiest_days(rows: &[DailyAggregate], limit: usize) -> Vec<PeriodAggregate> {
    let mut result: Vec<PeriodAggregate> = rows
        .iter()
        .map(|row| PeriodAggregate {
            period_start: row.day,
            key: row.key.clone(),
            count: row.count,
        })
        .collect();
    result.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.period_start.cmp(&b.period_start))
            .then_with(|| a.key.cmp(&b.key))
    });
    result.truncate(limit);
    result
}

/// First day of the period containing `day`
pub fn period_start(day: NaiveDate, period: Period) -> NaiveDate {
    match period {
        Period::Day => day,
        Period::Week => day
            .checked_sub_days(Days::new(u64::from(day.weekday().num_days_from_monday())))
            .unwrap_or(day),
        Period::Month => day.with_day(1).unwrap_or(day),
    }
}

/// Sum daily rows into coarser periods
///
/// Output is ordered by period, then count descending, then key.
pub fn rollup(rows: &[DailyAggregate], period: Period) -> Vec<PeriodAggregate> {
    let mut sums: HashMap<(NaiveDate, &str), i64> = HashMap::new();
    for row in rows {
        *sums
            .entry((period_start(row.day, period), row.key.as_str()))
            .or_insert(0) += row.count;
    }

    let mut result: Vec<PeriodAggregate> = sums
        .into_iter()
        .map(|((period_start, key), count)| PeriodAggregate {
            period_start,
            key: key.to_string(),
            count,
        })
        .collect();
    result.sort_by(|a, b| {
        a.period_start
            .cmp(&b.period_start)
            .then(b.count.cmp(&a.count))
            .then_with(|| a.key.cmp(&b.key))
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn daily(d: NaiveDate, key: &str, count: i64) -> DailyAggregate {
        DailyAggregate {
            day: d,
            key: key.to_string(),
            count,
        }
    }

    #[test]
    fn test_tally_groups_by_day_and_dimension() {
        let base = day(2024, 5, 1).and_hms_opt(23, 59, 59).unwrap().and_utc().timestamp();
        let rows = vec![
            ConsumedRow { occurred_at: base, path: Some("/".into()), region: "US".into() },
            ConsumedRow { occurred_at: base, path: Some("/".into()), region: "GB".into() },
            ConsumedRow { occurred_at: base + 1, path: None, region: "US".into() },
        ];

        let tally = DailyTally::from_rows(&rows).unwrap();
        assert_eq!(
            tally.rows(Dimension::Page),
            vec![daily(day(2024, 5, 1), "/", 2), daily(day(2024, 5, 2), "-", 1)]
        );
        assert_eq!(
            tally.rows(Dimension::Region),
            vec![
                daily(day(2024, 5, 1), "GB", 1),
                daily(day(2024, 5, 1), "US", 1),
                daily(day(2024, 5, 2), "US", 1),
            ]
        );
    }

    #[test]
    fn test_period_start() {
        // 2024-05-01 is a Wednesday
        assert_eq!(period_start(day(2024, 5, 1), Period::Day), day(2024, 5, 1));
        assert_eq!(period_start(day(2024, 5, 1), Period::Week), day(2024, 4, 29));
        assert_eq!(period_start(day(2024, 4, 29), Period::Week), day(2024, 4, 29));
        assert_eq!(period_start(day(2024, 5, 31), Period::Month), day(2024, 5, 1));
    }

    #[test]
    fn test_rollup_by_week_and_month() {
        let rows = vec![
            daily(day(2024, 4, 29), "/a", 2),
            daily(day(2024, 5, 1), "/a", 3),
            daily(day(2024, 5, 1), "/b", 5),
            daily(day(2024, 5, 6), "/a", 1),
        ];

        assert_eq!(
            rollup(&rows, Period::Week),
            vec![
                PeriodAggregate { period_start: day(2024, 4, 29), key: "/a".into(), count: 5 },
                PeriodAggregate { period_start: day(2024, 4, 29), key: "/b".into(), count: 5 },
                PeriodAggregate { period_start: day(2024, 5, 6), key: "/a".into(), count: 1 },
            ]
        );

        assert_eq!(
            rollup(&rows, Period::Month),
            vec![
                PeriodAggregate { period_start: day(2024, 4, 1), key: "/a".into(), count: 2 },
                PeriodAggregate { period_start: day(2024, 5, 1), key: "/b".into(), count: 5 },
                PeriodAggregate { period_start: day(2024, 5, 1), key: "/a".into(), count: 4 },
            ]
        );
    }

    #[test]
    fn test_busiest_days_ranks_across_days() {
        let rows = vec![
            daily(day(2024, 5, 1), "/a", 2),
            daily(day(2024, 5, 1), "/b", 7),
            daily(day(2024, 5, 2), "/a", 7),
            daily(day(2024, 5, 3), "/c", 1),
        ];

        assert_eq!(
            busiest_days(&rows, 3),
            vec![
                PeriodAggregate { period_start: day(2024, 5, 1), key: "/b".into(), count: 7 },
                PeriodAggregate { period_start: day(2024, 5, 2), key: "/a".into(), count: 7 },
                PeriodAggregate { period_start: day(2024, 5, 1), key: "/a".into(), count: 2 },
            ]
        );
        assert!(busiest_days(&rows, 0).is_empty());
    }
}
