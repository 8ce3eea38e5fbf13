//! Data models for ingestion and analytics

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Text stored for events whose region could not be resolved
pub const UNKNOWN_REGION: &str = "unknown";

/// Page key used for events without a parsable request path
pub const MISSING_PATH: &str = "-";

/// Coarse geographic classification derived from a client IP
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Region {
    /// ISO country code (e.g., "US", "GB")
    Known(String),
    #[default]
    Unknown,
}

impl Region {
    pub fn known(code: impl Into<String>) -> Self {
        let code = code.into();
        if code.is_empty() || code == UNKNOWN_REGION {
            Region::Unknown
        } else {
            Region::Known(code)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Region::Known(code) => code,
            Region::Unknown => UNKNOWN_REGION,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Region::Known(_))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Region {
    fn from(value: String) -> Self {
        Region::known(value)
    }
}

impl From<Region> for String {
    fn from(value: Region) -> Self {
        match value {
            Region::Known(code) => code,
            Region::Unknown => UNKNOWN_REGION.to_string(),
        }
    }
}

/// Position of a line within the file it was read from
///
/// `(source, generation, end_offset)` is unique per line, so it doubles as
/// the dedup key when a batch is retried. The generation changes whenever a
/// truncated file is re-read from the start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineOrigin {
    pub source: String,
    pub generation: u64,
    pub end_offset: u64,
}

/// One access-log line with its structured fields
///
/// `raw_line` is always present. Every other field is `None` when the line
/// could not be parsed far enough to recover it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: Option<DateTime<Utc>>,
    pub client_ip: Option<IpAddr>,
    pub region: Region,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub bytes: Option<u64>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub raw_line: String,
    pub origin: Option<LineOrigin>,
}

impl Event {
    /// An event carrying nothing but the original line
    pub fn unparsed(raw_line: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            client_ip: None,
            region: Region::Unknown,
            method: None,
            path: None,
            status: None,
            bytes: None,
            referrer: None,
            user_agent: None,
            raw_line: raw_line.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: LineOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// True when no structured field could be recovered
    pub fn is_unparsed(&self) -> bool {
        self.timestamp.is_none()
            && self.client_ip.is_none()
            && self.path.is_none()
            && self.status.is_none()
    }

    /// Key this event contributes to for the given dimension
    pub fn dimension_key(&self, dimension: Dimension) -> String {
        match dimension {
            Dimension::Page => self
                .path
                .clone()
                .unwrap_or_else(|| MISSING_PATH.to_string()),
            Dimension::Region => self.region.as_str().to_string(),
        }
    }
}

/// Aggregation dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Page,
    Region,
}

impl Dimension {
    pub const ALL: [Dimension; 2] = [Dimension::Page, Dimension::Region];

    /// Aggregate table backing this dimension
    pub fn table(self) -> &'static str {
        match self {
            Dimension::Page => "daily_pages",
            Dimension::Region => "daily_regions",
        }
    }

    /// Key column within [`Dimension::table`]
    pub fn key_column(self) -> &'static str {
        match self {
            Dimension::Page => "path",
            Dimension::Region => "region",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Page => f.write_str("page"),
            Dimension::Region => f.write_str("region"),
        }
    }
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "page" | "pages" | "path" => Ok(Dimension::Page),
            "region" | "regions" | "country" => Ok(Dimension::Region),
            other => Err(format!("unknown dimension '{other}' (expected page or region)")),
        }
    }
}

/// Per-day, per-dimension count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub day: NaiveDate,
    pub key: String,
    pub count: i64,
}

/// Row of a top-N report, summed across days
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopRow {
    pub key: String,
    pub count: i64,
}

/// Reporting granularity for roll-ups of daily aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Week,
    Month,
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Period::Day),
            "week" | "weekly" => Ok(Period::Week),
            "month" | "monthly" => Ok(Period::Month),
            other => Err(format!("unknown period '{other}' (expected day, week or month)")),
        }
    }
}

/// Count for one key within one reporting period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodAggregate {
    /// First day of the period (Monday for weeks, the 1st for months)
    pub period_start: NaiveDate,
    pub key: String,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_round_trips_through_text() {
        let us = Region::known("US");
        assert_eq!(String::from(us.clone()), "US");
        assert_eq!(Region::from("US".to_string()), us);

        assert_eq!(Region::from(UNKNOWN_REGION.to_string()), Region::Unknown);
        assert_eq!(Region::known(""), Region::Unknown);
        assert_eq!(Region::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_unparsed_event_keys() {
        let event = Event::unparsed("garbage");
        assert!(event.is_unparsed());
        assert_eq!(event.dimension_key(Dimension::Page), MISSING_PATH);
        assert_eq!(event.dimension_key(Dimension::Region), UNKNOWN_REGION);
    }

    #[test]
    fn test_dimension_and_period_parsing() {
        assert_eq!("Pages".parse::<Dimension>().unwrap(), Dimension::Page);
        assert_eq!("country".parse::<Dimension>().unwrap(), Dimension::Region);
        assert!("city".parse::<Dimension>().is_err());

        assert_eq!("weekly".parse::<Period>().unwrap(), Period::Week);
        assert!("fortnight".parse::<Period>().is_err());
    }
}
