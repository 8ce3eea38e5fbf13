//! Row models shared by the SQL backends

use chrono::{DateTime, NaiveDate};
use std::net::IpAddr;

use crate::analytics::models::{DailyAggregate, Event, LineOrigin, Region};
use crate::storage::{StorageError, StorageResult};

/// Day keys are stored as ISO dates so they sort lexically
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Event as stored in the `events` table
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub occurred_at: Option<i64>,
    pub client_ip: Option<String>,
    pub region: String,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<i32>,
    pub bytes: Option<i64>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub raw_line: String,
    pub source: Option<String>,
    pub source_generation: Option<i64>,
    pub source_offset: Option<i64>,
}

impl EventRow {
    /// Convert an event into column values, narrowing unsigned fields
    pub fn from_event(event: &Event) -> StorageResult<Self> {
        let bytes = event
            .bytes
            .map(i64::try_from)
            .transpose()
            .map_err(|_| StorageError::Corrupt(format!("byte count out of range: {:?}", event.bytes)))?;

        let (source, source_generation, source_offset) = match &event.origin {
            Some(origin) => {
                let generation = i64::try_from(origin.generation).map_err(|_| {
                    StorageError::Corrupt(format!("generation out of range: {}", origin.generation))
                })?;
                let offset = i64::try_from(origin.end_offset).map_err(|_| {
                    StorageError::Corrupt(format!("offset out of range: {}", origin.end_offset))
                })?;
                (Some(origin.source.clone()), Some(generation), Some(offset))
            }
            None => (None, None, None),
        };

        Ok(Self {
            occurred_at: event.timestamp.map(|ts| ts.timestamp()),
            client_ip: event.client_ip.map(|ip| ip.to_string()),
            region: event.region.as_str().to_string(),
            method: event.method.clone(),
            path: event.path.clone(),
            status: event.status.map(i32::from),
            bytes,
            referrer: event.referrer.clone(),
            user_agent: event.user_agent.clone(),
            raw_line: event.raw_line.clone(),
            source,
            source_generation,
            source_offset,
        })
    }

    pub fn into_event(self) -> StorageResult<Event> {
        let timestamp = self
            .occurred_at
            .map(|secs| {
                DateTime::from_timestamp(secs, 0)
                    .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {secs}")))
            })
            .transpose()?;

        let origin = match (self.source, self.source_generation, self.source_offset) {
            (Some(source), Some(generation), Some(offset)) => Some(LineOrigin {
                source,
                generation: u64::try_from(generation).map_err(|_| {
                    StorageError::Corrupt(format!("negative generation: {generation}"))
                })?,
                end_offset: u64::try_from(offset)
                    .map_err(|_| StorageError::Corrupt(format!("negative offset: {offset}")))?,
            }),
            _ => None,
        };

        Ok(Event {
            timestamp,
            client_ip: self.client_ip.and_then(|ip| ip.parse::<IpAddr>().ok()),
            region: Region::from(self.region),
            method: self.method,
            path: self.path,
            status: self.status.and_then(|s| u16::try_from(s).ok()),
            bytes: self.bytes.and_then(|b| u64::try_from(b).ok()),
            referrer: self.referrer,
            user_agent: self.user_agent,
            raw_line: self.raw_line,
            origin,
        })
    }
}

/// Fields of a raw event consumed by an aggregation run
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConsumedRow {
    pub occurred_at: i64,
    pub path: Option<String>,
    pub region: String,
}

/// Row of a daily aggregate table with the key column aliased to `key`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DailyRow {
    pub day: String,
    pub key: String,
    pub count: i64,
}

impl TryFrom<DailyRow> for DailyAggregate {
    type Error = StorageError;

    fn try_from(row: DailyRow) -> Result<Self, Self::Error> {
        let day = NaiveDate::parse_from_str(&row.day, DAY_FORMAT)
            .map_err(|_| StorageError::Corrupt(format!("invalid day '{}'", row.day)))?;
        Ok(DailyAggregate {
            day,
            key: row.key,
            count: row.count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_event_row_round_trip() {
        let event = Event {
            timestamp: Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()),
            client_ip: Some("8.8.8.8".parse().unwrap()),
            region: Region::known("US"),
            method: Some("GET".to_string()),
            path: Some("/".to_string()),
            status: Some(200),
            bytes: Some(512),
            referrer: None,
            user_agent: Some("curl/8.0".to_string()),
            raw_line: "raw".to_string(),
            origin: None,
        }
        .with_origin(LineOrigin {
            source: "/var/log/access.log".to_string(),
            generation: 1,
            end_offset: 42,
        });

        let row = EventRow::from_event(&event).unwrap();
        assert_eq!(row.source_generation, Some(1));
        assert_eq!(row.source_offset, Some(42));
        assert_eq!(row.into_event().unwrap(), event);
    }

    #[test]
    fn test_invalid_day_is_corrupt() {
        let row = DailyRow {
            day: "yesterday".to_string(),
            key: "/".to_string(),
            count: 1,
        };
        assert!(matches!(
            DailyAggregate::try_from(row),
            Err(StorageError::Corrupt(_))
        ));
    }
}
