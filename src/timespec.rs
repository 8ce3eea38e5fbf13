//! Parsing of aggregation cutoffs
//!
//! Accepts humanized relative expressions ("2 days ago", "in 3 hours",
//! "1 day and 6 hours ago") as well as absolute timestamps. Relative
//! expressions are resolved against a caller-supplied "now".

use chrono::{DateTime, Months, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeExprError {
    #[error("empty time expression")]
    Empty,
    #[error("invalid amount '{0}' in time expression")]
    InvalidAmount(String),
    #[error("unknown time unit '{0}' (expected seconds, minutes, hours, days, weeks, months or years)")]
    UnknownUnit(String),
    #[error("missing unit after '{0}' in time expression")]
    MissingUnit(String),
    #[error("time expression '{0}' is out of range")]
    OutOfRange(String),
    #[error("unrecognized time expression '{0}' (try '2 days ago' or '2024-01-31 00:00:00')")]
    Unrecognized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Unit {
    fn parse(word: &str) -> Option<Self> {
        let unit = match word {
            "s" | "sec" | "secs" | "second" | "seconds" => Unit::Second,
            "m" | "min" | "mins" | "minute" | "minutes" => Unit::Minute,
            "h" | "hr" | "hrs" | "hour" | "hours" => Unit::Hour,
            "d" | "day" | "days" => Unit::Day,
            "w" | "wk" | "wks" | "week" | "weeks" => Unit::Week,
            "mo" | "month" | "months" => Unit::Month,
            "y" | "yr" | "yrs" | "year" | "years" => Unit::Year,
            _ => return None,
        };
        Some(unit)
    }
}

/// Parse a cutoff expression relative to `now`
pub fn parse_time_expr(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeExprError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(TimeExprError::Empty);
    }

    let lowered = trimmed.to_lowercase();
    if lowered == "now" || lowered == "just now" {
        return Ok(now);
    }

    if let Some(body) = lowered.strip_suffix(" ago") {
        return apply_relative(body, now, false, trimmed);
    }
    if let Some(body) = lowered.strip_prefix("in ") {
        return apply_relative(body, now, true, trimmed);
    }

    parse_absolute(trimmed).ok_or_else(|| TimeExprError::Unrecognized(trimmed.to_string()))
}

fn apply_relative(
    body: &str,
    now: DateTime<Utc>,
    forward: bool,
    original: &str,
) -> Result<DateTime<Utc>, TimeExprError> {
    let tokens: Vec<&str> = body
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty() && *t != "and")
        .collect();
    if tokens.is_empty() {
        return Err(TimeExprError::Unrecognized(original.to_string()));
    }

    let mut result = now;
    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        // "2days" is accepted as well as "2 days"
        let split_at = token
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(token.len());
        let (amount_text, inline_unit) = token.split_at(split_at);

        let (amount, unit_word) = match (amount_text, inline_unit) {
            ("", "a") | ("", "an") | ("", "one") => {
                (1, iter.next().ok_or_else(|| TimeExprError::MissingUnit(token.to_string()))?)
            }
            ("", _) => return Err(TimeExprError::InvalidAmount(token.to_string())),
            (digits, "") => {
                let amount = digits
                    .parse::<u32>()
                    .map_err(|_| TimeExprError::InvalidAmount(digits.to_string()))?;
                (amount, iter.next().ok_or_else(|| TimeExprError::MissingUnit(token.to_string()))?)
            }
            (digits, unit) => {
                let amount = digits
                    .parse::<u32>()
                    .map_err(|_| TimeExprError::InvalidAmount(digits.to_string()))?;
                (amount, unit)
            }
        };

        let unit = Unit::parse(unit_word)
            .ok_or_else(|| TimeExprError::UnknownUnit(unit_word.to_string()))?;
        result = shift(result, amount, unit, forward)
            .ok_or_else(|| TimeExprError::OutOfRange(original.to_string()))?;
    }

    Ok(result)
}

fn shift(at: DateTime<Utc>, amount: u32, unit: Unit, forward: bool) -> Option<DateTime<Utc>> {
    let amount = i64::from(amount);
    let delta = match unit {
        Unit::Second => TimeDelta::try_seconds(amount)?,
        Unit::Minute => TimeDelta::try_minutes(amount)?,
        Unit::Hour => TimeDelta::try_hours(amount)?,
        Unit::Day => TimeDelta::try_days(amount)?,
        Unit::Week => TimeDelta::try_weeks(amount)?,
        Unit::Month | Unit::Year => {
            let months = if unit == Unit::Year {
                u32::try_from(amount.checked_mul(12)?).ok()?
            } else {
                u32::try_from(amount).ok()?
            };
            let months = Months::new(months);
            return if forward {
                at.checked_add_months(months)
            } else {
                at.checked_sub_months(months)
            };
        }
    };

    if forward {
        at.checked_add_signed(delta)
    } else {
        at.checked_sub_signed(delta)
    }
}

fn parse_absolute(text: &str) -> Option<DateTime<Utc>> {
    if let Some(secs) = text.strip_prefix('@') {
        return secs
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    // Access-log style, e.g. 10/Oct/2023:13:55:36 -0700
    if let Ok(dt) = DateTime::parse_from_str(text, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(dt.with_timezone(&Utc));
    }

    for format in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
