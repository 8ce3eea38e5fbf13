//! Access-log line parsing
//!
//! Understands the common and combined log formats:
//!
//! ```text
//! 203.0.113.7 - frank [10/Oct/2023:13:55:36 -0700] "GET /index.html HTTP/1.1" 200 2326 "http://example.com/" "Mozilla/5.0"
//! ```
//!
//! Parsing never fails. A line that does not match the grammar becomes an
//! [`Event`] holding only its raw text, and individual fields that cannot be
//! decoded are left as `None` while the rest of the line is kept.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use crate::analytics::models::{Event, Region};
use crate::analytics::region::RegionLookup;

const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

static ACCESS_LOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?P<ip>\S+)\s+\S+\s+\S+\s+\[(?P<time>[^\]]*)\]\s+"(?P<request>(?:[^"\\]|\\.)*)"\s+(?P<status>\S+)\s+(?P<bytes>\S+)(?:\s+"(?P<referrer>(?:[^"\\]|\\.)*)"\s+"(?P<agent>(?:[^"\\]|\\.)*)")?"#,
    )
    .expect("access log pattern is valid")
});

/// Converts raw lines into events, resolving regions along the way
#[derive(Clone)]
pub struct AccessLogParser {
    resolver: Arc<dyn RegionLookup>,
}

impl AccessLogParser {
    pub fn new(resolver: Arc<dyn RegionLookup>) -> Self {
        Self { resolver }
    }

    pub fn parse(&self, line: &str) -> Event {
        let Some(caps) = ACCESS_LOG.captures(line) else {
            return Event::unparsed(line);
        };

        let client_ip = caps
            .name("ip")
            .and_then(|m| m.as_str().parse::<IpAddr>().ok());
        let region = client_ip
            .map(|ip| self.resolver.resolve(ip))
            .unwrap_or(Region::Unknown);

        let timestamp = caps
            .name("time")
            .and_then(|m| DateTime::parse_from_str(m.as_str(), TIMESTAMP_FORMAT).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let (method, path) = caps
            .name("request")
            .map(|m| split_request(m.as_str()))
            .unwrap_or((None, None));

        let status = caps
            .name("status")
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .filter(|s| (100..=999).contains(s));

        // "-" means no body was sent. Counts past i64::MAX cannot be stored
        let bytes = caps.name("bytes").and_then(|m| match m.as_str() {
            "-" => Some(0),
            other => other
                .parse::<i64>()
                .ok()
                .and_then(|b| u64::try_from(b).ok()),
        });

        Event {
            timestamp,
            client_ip,
            region,
            method,
            path,
            status,
            bytes,
            referrer: caps.name("referrer").and_then(|m| optional_field(m.as_str())),
            user_agent: caps.name("agent").and_then(|m| optional_field(m.as_str())),
            raw_line: line.to_string(),
            origin: None,
        }
    }
}

/// Split `METHOD path [PROTOCOL]`; anything else yields no method or path
fn split_request(request: &str) -> (Option<String>, Option<String>) {
    let mut parts = request.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(method), Some(path)) if method.chars().all(|c| c.is_ascii_alphabetic()) => {
            (Some(method.to_string()), Some(path.to_string()))
        }
        _ => (None, None),
    }
}

fn optional_field(value: &str) -> Option<String> {
    if value.is_empty() || value == "-" {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::region::CidrTable;
    use chrono::TimeZone;

    const COMBINED: &str = r#"8.8.8.8 - frank [10/Oct/2023:13:55:36 -0700] "GET /index.html?lang=en HTTP/1.1" 200 2326 "http://example.com/start" "Mozilla/5.0 (X11; Linux x86_64)""#;

    fn parser() -> AccessLogParser {
        let table = CidrTable::parse("8.8.8.0/24,US\n").unwrap();
        AccessLogParser::new(Arc::new(table))
    }

    #[test]
    fn test_parse_combined_line() {
        let event = parser().parse(COMBINED);

        assert_eq!(
            event.timestamp,
            Some(Utc.with_ymd_and_hms(2023, 10, 10, 20, 55, 36).unwrap())
        );
        assert_eq!(event.client_ip, Some("8.8.8.8".parse().unwrap()));
        assert_eq!(event.region, Region::known("US"));
        assert_eq!(event.method.as_deref(), Some("GET"));
        assert_eq!(event.path.as_deref(), Some("/index.html?lang=en"));
        assert_eq!(event.status, Some(200));
        assert_eq!(event.bytes, Some(2326));
        assert_eq!(event.referrer.as_deref(), Some("http://example.com/start"));
        assert_eq!(
            event.user_agent.as_deref(),
            Some("Mozilla/5.0 (X11; Linux x86_64)")
        );
        assert!(event.origin.is_none());
    }

    #[test]
    fn test_raw_line_round_trips() {
        let event = parser().parse(COMBINED);
        assert_eq!(event.raw_line, COMBINED);
    }

    #[test]
    fn test_parse_common_format() {
        let line = r#"127.0.0.1 - - [01/Jan/2024:00:00:00 +0000] "POST /api HTTP/1.0" 404 -"#;
        let event = parser().parse(line);

        assert_eq!(event.status, Some(404));
        assert_eq!(event.bytes, Some(0));
        assert_eq!(event.region, Region::Unknown);
        assert!(event.referrer.is_none());
        assert!(event.user_agent.is_none());
    }

    #[test]
    fn test_malformed_line_is_preserved() {
        let event = parser().parse("this is not an access log line");
        assert!(event.is_unparsed());
        assert_eq!(event.raw_line, "this is not an access log line");
        assert_eq!(event.region, Region::Unknown);

        let empty = parser().parse("");
        assert!(empty.is_unparsed());
        assert_eq!(empty.raw_line, "");
    }

    #[test]
    fn test_bad_fields_are_dropped_individually() {
        let line = r#"8.8.8.8 - - [not a time] "-" 400 0 "-" "-""#;
        let event = parser().parse(line);

        assert!(event.timestamp.is_none());
        assert_eq!(event.client_ip, Some("8.8.8.8".parse().unwrap()));
        assert_eq!(event.region, Region::known("US"));
        assert!(event.method.is_none());
        assert!(event.path.is_none());
        assert_eq!(event.status, Some(400));
    }

    #[test]
    fn test_oversized_byte_count_is_dropped() {
        let line = r#"8.8.8.8 - - [01/Jan/2024:00:00:00 +0000] "GET / HTTP/1.1" 200 18446744073709551615"#;
        let event = parser().parse(line);
        assert!(event.bytes.is_none());
        assert_eq!(event.status, Some(200));
        assert_eq!(event.path.as_deref(), Some("/"));
        assert_eq!(event.raw_line, line);

        let negative = parser().parse(&line.replace("18446744073709551615", "-12"));
        assert!(negative.bytes.is_none());

        let largest = parser().parse(&line.replace("18446744073709551615", &i64::MAX.to_string()));
        assert_eq!(largest.bytes, Some(i64::MAX as u64));
    }

    #[test]
    fn test_hostname_client_is_unknown_region() {
        let line = r#"crawler.example.net - - [01/Jan/2024:00:00:00 +0000] "GET / HTTP/1.1" 200 12"#;
        let event = parser().parse(line);
        assert!(event.client_ip.is_none());
        assert_eq!(event.region, Region::Unknown);
        assert_eq!(event.path.as_deref(), Some("/"));
    }

    #[test]
    fn test_ipv6_client_and_escaped_quotes() {
        let line = r#"2001:db8::1 - - [01/Jan/2024:00:00:00 +0000] "GET /q?x=\"y\" HTTP/1.1" 200 5 "-" "agent \"quoted\"""#;
        let event = parser().parse(line);
        assert_eq!(event.client_ip, Some("2001:db8::1".parse().unwrap()));
        assert_eq!(event.path.as_deref(), Some(r#"/q?x=\"y\""#));
        assert_eq!(event.user_agent.as_deref(), Some(r#"agent \"quoted\""#));
    }
}
