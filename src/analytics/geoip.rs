//! GeoIP lookup service using MaxMind GeoLite2/GeoIP2 MMDB
//!
//! The database is memory-mapped once per process and shared read-only
//! between every parser that needs it.

use anyhow::{Context, Result};
use maxminddb::{geoip2, Mmap, Reader};
use reqwest::Client;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::analytics::models::Region;
use crate::analytics::region::{canonical_ip, is_reserved, CidrTable, RegionLookup};
use crate::config::GeoIpConfig;

/// Resolver shared by the whole process after the first [`load`]
static RESOLVER: OnceLock<Arc<dyn RegionLookup>> = OnceLock::new();

/// GeoIP lookup service backed by a Country or City database
pub struct GeoIpService {
    reader: Option<Arc<Reader<Mmap>>>,
}

impl GeoIpService {
    /// Open a GeoIP service from an MMDB file path
    ///
    /// # Arguments
    /// * `path` - Path to a GeoLite2-Country, GeoLite2-City or GeoIP2 .mmdb file
    pub fn new(path: &str) -> Result<Self> {
        let reader = unsafe { Reader::open_mmap(path) }
            .with_context(|| format!("Failed to open GeoIP database at {}", path))?;
        Ok(Self {
            reader: Some(Arc::new(reader)),
        })
    }

    /// A service with no database; every address resolves to Unknown
    pub fn disabled() -> Self {
        Self { reader: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.reader.is_some()
    }

    /// Lookup the country code for an IP address
    fn lookup_country(&self, ip: IpAddr) -> Option<String> {
        let reader = self.reader.as_ref()?;
        let result = reader.lookup(ip).ok()?;

        // City databases are a superset of Country data, so decoding the
        // Country view works for both.
        let country = result.decode::<geoip2::Country>().ok()??;
        country.country.iso_code.map(|s| s.to_string())
    }
}

impl RegionLookup for GeoIpService {
    fn resolve(&self, ip: IpAddr) -> Region {
        if is_reserved(ip) {
            return Region::Unknown;
        }
        match self.lookup_country(canonical_ip(ip)) {
            Some(code) => Region::known(code),
            None => Region::Unknown,
        }
    }
}

// Implement Clone by cloning the Arc
impl Clone for GeoIpService {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
        }
    }
}

/// Build a resolver from configuration without touching the process cache
///
/// An MMDB path takes precedence over a CIDR table; with neither configured
/// every address resolves to Unknown.
pub fn open(config: &GeoIpConfig) -> Result<Arc<dyn RegionLookup>> {
    if let Some(path) = config.mmdb_path.as_deref() {
        info!("Loading GeoIP database from {}", path);
        return Ok(Arc::new(GeoIpService::new(path)?));
    }

    if let Some(path) = config.cidr_path.as_deref() {
        let table = CidrTable::from_file(path)?;
        info!("Loaded {} region networks from {}", table.len(), path);
        return Ok(Arc::new(table));
    }

    debug!("No geolocation data configured; regions will be unknown");
    Ok(Arc::new(GeoIpService::disabled()))
}

/// Load the process-wide resolver
///
/// The first successful call opens the dataset; later calls return the
/// same handle regardless of their argument.
pub fn load(config: &GeoIpConfig) -> Result<Arc<dyn RegionLookup>> {
    if let Some(resolver) = RESOLVER.get() {
        return Ok(Arc::clone(resolver));
    }

    let resolver = open(config)?;
    // A concurrent loader may have won the race; keep whichever landed first.
    Ok(Arc::clone(RESOLVER.get_or_init(|| resolver)))
}

/// Fetch an .mmdb file and swap it into place at `dest`
///
/// The body is checked to be a readable MaxMind database before it replaces
/// anything, and the replacement is a rename so readers never see a partial
/// file. Returns the number of bytes written.
pub async fn download(url: &str, dest: &Path) -> Result<u64> {
    let client = Client::builder()
        .user_agent(concat!("nalax/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(300))
        .build()
        .context("failed to build HTTP client for GeoIP download")?;

    let body = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to request GeoIP database from {url}"))?
        .error_for_status()
        .context("GeoIP download returned an error status")?
        .bytes()
        .await
        .context("failed to read GeoIP download body")?;

    install(&body, dest).await?;
    info!("Installed GeoIP database at {} ({} bytes)", dest.display(), body.len());
    Ok(body.len() as u64)
}

async fn install(body: &[u8], dest: &Path) -> Result<()> {
    Reader::from_source(body).context("downloaded file is not a MaxMind database")?;

    let mut tmp_name = dest.as_os_str().to_owned();
    tmp_name.push(".download");
    let tmp = Path::new(&tmp_name);

    tokio::fs::write(tmp, body)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(tmp, dest)
        .await
        .with_context(|| format!("failed to move GeoIP database into {}", dest.display()))?;
    Ok(())
}
