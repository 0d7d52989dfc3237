//! Duration tokens: `<number><unit>`, e.g. `30s`, `1h 30m`, `5y`

use crate::{HdError, Result};
use regex::Regex;
use std::sync::OnceLock;

const MILLIS: i64 = 1;
const SECOND: i64 = 1_000 * MILLIS;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const YEAR: i64 = 365 * DAY;

/// Units from largest to smallest, used for formatting
const UNITS: [(&str, i64); 6] = [
    ("y", YEAR),
    ("d", DAY),
    ("h", HOUR),
    ("m", MINUTE),
    ("s", SECOND),
    ("ms", MILLIS),
];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)(ms|s|m|h|d|y)$").expect("duration pattern is valid")
    })
}

/// Parse whitespace separated duration tokens into milliseconds
pub fn parse_duration(input: &str) -> Result<i64> {
    let mut total: i64 = 0;
    let mut tokens = 0;

    for token in input.split_whitespace() {
        let lower = token.to_ascii_lowercase();
        let caps = token_pattern()
            .captures(&lower)
            .ok_or_else(|| HdError::Config(format!("Malformed duration token: {:?}", token)))?;

        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| HdError::Config(format!("Duration out of range: {:?}", token)))?;
        let unit = UNITS
            .iter()
            .find(|(name, _)| *name == &caps[2])
            .map(|(_, millis)| *millis)
            .unwrap_or(MILLIS);

        total = amount
            .checked_mul(unit)
            .and_then(|millis| total.checked_add(millis))
            .ok_or_else(|| HdError::Config(format!("Duration out of range: {:?}", input)))?;
        tokens += 1;
    }

    if tokens == 0 {
        return Err(HdError::Config("Empty duration".into()));
    }
    Ok(total)
}

/// Format milliseconds as the shortest exact token sequence
pub fn format_duration(millis: i64) -> String {
    if millis <= 0 {
        return "0ms".to_string();
    }

    let mut rest = millis;
    let mut parts = Vec::new();
    for (name, unit) in UNITS {
        if rest >= unit {
            parts.push(format!("{}{}", rest / unit, name));
            rest %= unit;
        }
    }
    parts.join(" ")
}
