pub mod analytics;
pub mod clock;
pub mod config;
pub mod ingest;
pub mod storage;
pub mod timespec;
