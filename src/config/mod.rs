use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub geoip: GeoIpConfig,
    pub tail: TailConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

impl DatabaseBackend {
    /// Infer the backend from a connection URL scheme
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(DatabaseBackend::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(DatabaseBackend::Sqlite)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoIpConfig {
    /// Path to a MaxMind .mmdb file (Country or City)
    pub mmdb_path: Option<String>,
    /// Path to a `cidr,code` text table, used when no .mmdb is configured
    pub cidr_path: Option<String>,
    /// Where `geoip-update` downloads the .mmdb from
    pub download_url: Option<String>,
}

/// What to do when a tailed file is shorter than its saved offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncatePolicy {
    /// Log a warning and re-read the file from the beginning
    Restart,
    /// Stop and report the mismatch
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub max_chunk_bytes: usize,
    pub on_truncate: TruncatePolicy,
}

impl TailConfig {
    const fn default_batch_size() -> usize {
        1
    }

    const fn default_poll_interval_ms() -> u64 {
        1000
    }

    const fn default_max_chunk_bytes() -> usize {
        1024 * 1024
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            max_chunk_bytes: Self::default_max_chunk_bytes(),
            on_truncate: TruncatePolicy::Restart,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub limit: i64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { limit: 20 }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            var("DATABASE_URL").unwrap_or_else(|| "sqlite://./nalax.db".to_string());

        let backend = match var("DATABASE_BACKEND") {
            Some(value) => match value.to_lowercase().as_str() {
                "postgres" | "postgresql" => DatabaseBackend::Postgres,
                "sqlite" => DatabaseBackend::Sqlite,
                other => {
                    tracing::warn!(
                        "Unknown DATABASE_BACKEND '{other}', falling back to 'sqlite'. Supported values: sqlite, postgres"
                    );
                    DatabaseBackend::Sqlite
                }
            },
            None => DatabaseBackend::from_url(&database_url).unwrap_or(DatabaseBackend::Sqlite),
        };

        let max_connections = var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|| "5".to_string())
            .parse::<u32>()
            .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?;

        let geoip = GeoIpConfig {
            mmdb_path: var("GEOIP_DB_PATH").filter(|v| !v.is_empty()),
            cidr_path: var("GEOIP_CIDR_PATH").filter(|v| !v.is_empty()),
            download_url: var("GEOIP_DOWNLOAD_URL").filter(|v| !v.is_empty()),
        };

        let batch_size = var("TAIL_BATCH_SIZE")
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("TAIL_BATCH_SIZE must be a positive integer")?
            .unwrap_or_else(TailConfig::default_batch_size);
        if batch_size == 0 {
            bail!("TAIL_BATCH_SIZE must be at least 1");
        }

        let poll_interval_ms = var("TAIL_POLL_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("TAIL_POLL_MS must be a positive integer")?
            .unwrap_or_else(TailConfig::default_poll_interval_ms);
        if poll_interval_ms == 0 {
            bail!("TAIL_POLL_MS must be at least 1");
        }

        let max_chunk_bytes = var("TAIL_MAX_CHUNK_BYTES")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or_else(TailConfig::default_max_chunk_bytes);

        let on_truncate = match var("TAIL_ON_TRUNCATE")
            .unwrap_or_else(|| "restart".to_string())
            .to_lowercase()
            .as_str()
        {
            "restart" => TruncatePolicy::Restart,
            "abort" => TruncatePolicy::Abort,
            other => bail!("Unknown TAIL_ON_TRUNCATE '{other}'. Supported values: restart, abort"),
        };

        let limit = var("REPORT_LIMIT")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(ReportConfig::default().limit);

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            geoip,
            tail: TailConfig {
                batch_size,
                poll_interval_ms,
                max_chunk_bytes,
                on_truncate,
            },
            report: ReportConfig { limit },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Sqlite);
        assert_eq!(config.database.url, "sqlite://./nalax.db");
        assert_eq!(config.tail.batch_size, 1);
        assert_eq!(config.tail.on_truncate, TruncatePolicy::Restart);
        assert_eq!(config.report.limit, 20);
        assert!(config.geoip.mmdb_path.is_none());
    }

    #[test]
    fn test_backend_inferred_from_url() {
        let config = config_from(&[("DATABASE_URL", "postgres://localhost/nalax")]).unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Postgres);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config_from(&[("TAIL_BATCH_SIZE", "0")]).is_err());
        assert!(config_from(&[("TAIL_BATCH_SIZE", "many")]).is_err());
        assert!(config_from(&[("TAIL_POLL_MS", "0")]).is_err());
        assert!(config_from(&[("TAIL_POLL_MS", "soon")]).is_err());
        assert!(config_from(&[("TAIL_ON_TRUNCATE", "ignore")]).is_err());
    }

    #[test]
    fn test_tail_overrides() {
        let config = config_from(&[
            ("TAIL_BATCH_SIZE", "50"),
            ("TAIL_ON_TRUNCATE", "ABORT"),
            ("TAIL_POLL_MS", "250"),
            ("GEOIP_DB_PATH", "/var/lib/GeoLite2-Country.mmdb"),
        ])
        .unwrap();
        assert_eq!(config.tail.batch_size, 50);
        assert_eq!(config.tail.on_truncate, TruncatePolicy::Abort);
        assert_eq!(config.tail.poll_interval_ms, 250);
        assert_eq!(
            config.geoip.mmdb_path.as_deref(),
            Some("/var/lib/GeoLite2-Country.mmdb")
        );
    }
}
