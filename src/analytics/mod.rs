//! Region resolution, event models and daily aggregation
//!
//! Regions come from a MaxMind MMDB when one is configured, otherwise from a
//! plain CIDR table, otherwise every address resolves to `unknown`.

pub mod aggregator;
pub mod geoip;
pub mod models;
pub mod region;
pub mod storage;

pub use aggregator::{AggregationReport, Aggregator};
pub use geoip::GeoIpService;
pub use models::{DailyAggregate, Dimension, Event, LineOrigin, Period, PeriodAggregate, Region, TopRow};
pub use region::{CidrTable, RegionLookup};
