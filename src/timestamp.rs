use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

/// Gauge value of an event without `NotBefore`. Anything at or before epoch+1 is due.
pub const READINESS_IMMEDIATE: f64 = 1.0;
/// Gauge value of an event whose `NotBefore` can't be parsed.
pub const READINESS_UNPARSEABLE: f64 = 0.0;

/// How soon a scheduled event is due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// `NotBefore` is empty: the event may start at any moment.
    Immediate,
    At(DateTime<Utc>),
    /// `NotBefore` is set but matches none of the accepted formats.
    Unparseable,
}

impl Readiness {
    pub fn metric_value(&self) -> f64 {
        match self {
            Readiness::Immediate => READINESS_IMMEDIATE,
            Readiness::At(timestamp) => timestamp.timestamp() as f64,
            Readiness::Unparseable => READINESS_UNPARSEABLE,
        }
    }

    /// An unparseable timestamp is never due; it only shows up in logs and metrics.
    pub fn is_due_by(&self, threshold: DateTime<Utc>) -> bool {
        match self {
            Readiness::Immediate => true,
            Readiness::At(timestamp) => *timestamp <= threshold,
            Readiness::Unparseable => false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unable to parse time '{value}': no accepted format matches")]
pub struct TimestampError {
    pub value: String,
}

#[derive(Clone, Copy, Debug)]
enum TimestampFormat {
    Rfc3339,
    /// `Mon, 02 Jan 2006 15:04:05 MST`, zone abbreviation read as UTC
    Rfc1123,
    /// `02 Jan 06 15:04 -0700`
    Rfc822Z,
    /// `Monday, 02-Jan-06 15:04:05 MST`, zone abbreviation read as UTC
    Rfc850,
}

const ACCEPTED_FORMATS: [TimestampFormat; 4] = [
    TimestampFormat::Rfc3339,
    TimestampFormat::Rfc1123,
    TimestampFormat::Rfc822Z,
    TimestampFormat::Rfc850,
];

impl TimestampFormat {
    fn parse(self, value: &str) -> Option<DateTime<Utc>> {
        let parsed = match self {
            TimestampFormat::Rfc3339 => DateTime::parse_from_rfc3339(value).ok()?,
            TimestampFormat::Rfc1123 => return parse_named_zone(value, "%d %b %Y %H:%M:%S"),
            TimestampFormat::Rfc822Z => DateTime::parse_from_str(value, "%d %b %y %H:%M %z").ok()?,
            TimestampFormat::Rfc850 => return parse_named_zone(value, "%d-%b-%y %H:%M:%S"),
        };

        Some(parsed.with_timezone(&Utc))
    }
}

/// `<weekday>, <datetime> <ZONE>`. The weekday is only checked for shape, the
/// zone must be an abbreviation and is read as UTC.
fn parse_named_zone(value: &str, datetime_format: &str) -> Option<DateTime<Utc>> {
    let (weekday, rest) = value.split_once(", ")?;
    let (datetime, zone) = rest.rsplit_once(' ')?;
    if !is_alphabetic(weekday) || !is_alphabetic(zone) {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(datetime, datetime_format).ok()?;
    Some(naive.and_utc())
}

fn is_alphabetic(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_alphabetic())
}

/// First successful parse wins.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    ACCEPTED_FORMATS
        .iter()
        .find_map(|format| format.parse(value))
        .ok_or_else(|| TimestampError {
            value: value.to_owned(),
        })
}

/// Empty means "due now", which is not the same thing as unparseable.
pub fn resolve_not_before(not_before: &str) -> Result<Readiness, TimestampError> {
    if not_before.is_empty() {
        return Ok(Readiness::Immediate);
    }

    parse_timestamp(not_before).map(Readiness::At)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    const EXPECTED: i64 = 1649716018; // 2022-04-11T22:26:58Z

    #[test]
    fn empty_is_immediate() {
        let readiness = resolve_not_before("").unwrap();
        assert_eq!(readiness, Readiness::Immediate);
        assert_eq!(readiness.metric_value(), 1.0);
    }

    #[test]
    fn should_parse_rfc3339() {
        let parsed = parse_timestamp("2022-04-11T22:26:58Z").unwrap();
        assert_eq!(parsed.timestamp(), EXPECTED);

        let parsed = parse_timestamp("2022-04-12T00:26:58+02:00").unwrap();
        assert_eq!(parsed.timestamp(), EXPECTED);
    }

    #[test]
    fn should_parse_rfc1123() {
        let parsed = parse_timestamp("Mon, 11 Apr 2022 22:26:58 GMT").unwrap();
        assert_eq!(parsed.timestamp(), EXPECTED);
    }

    #[test]
    fn rfc1123_reads_any_zone_abbreviation_as_utc() {
        for value in [
            "Mon, 11 Apr 2022 22:26:58 UTC",
            "Mon, 11 Apr 2022 22:26:58 CET",
            "Mon, 11 Apr 2022 22:26:58 PDT",
        ] {
            assert_eq!(parse_timestamp(value).unwrap().timestamp(), EXPECTED, "{value}");
        }
    }

    #[test]
    fn rfc1123_ignores_weekday_mismatch() {
        let parsed = parse_timestamp("Tue, 11 Apr 2022 22:26:58 GMT").unwrap();
        assert_eq!(parsed.timestamp(), EXPECTED);
    }

    #[test]
    fn rfc1123_rejects_numeric_offset() {
        assert!(parse_timestamp("Mon, 11 Apr 2022 22:26:58 +0200").is_err());
        assert!(parse_timestamp("11 Apr 2022 22:26:58 GMT").is_err());
    }

    #[test]
    fn should_parse_rfc822z() {
        let parsed = parse_timestamp("11 Apr 22 22:26 +0000").unwrap();
        assert_eq!(parsed.timestamp(), 1649715960);

        let parsed = parse_timestamp("11 Apr 22 22:26 +0200").unwrap();
        assert_eq!(parsed.timestamp(), 1649708760);
    }

    #[test]
    fn should_parse_rfc850() {
        let parsed = parse_timestamp("Monday, 11-Apr-22 22:26:58 UTC").unwrap();
        assert_eq!(parsed.timestamp(), EXPECTED);
    }

    #[test]
    fn readiness_is_exact_seconds_since_epoch() {
        let readiness = resolve_not_before("Mon, 11 Apr 2022 22:26:58 GMT").unwrap();
        assert_eq!(readiness.metric_value(), EXPECTED as f64);
    }

    #[test]
    fn garbage_is_an_error_not_immediate() {
        let result = resolve_not_before("next tuesday");
        assert_eq!(
            result,
            Err(TimestampError {
                value: "next tuesday".to_owned()
            })
        );
        assert_eq!(Readiness::Unparseable.metric_value(), 0.0);
    }

    #[test]
    fn due_by_threshold() {
        let now = Utc::now();
        let soon = Readiness::At(now + TimeDelta::minutes(3));
        let later = Readiness::At(now + TimeDelta::minutes(30));
        let threshold = now + TimeDelta::minutes(5);

        assert!(soon.is_due_by(threshold));
        assert!(!later.is_due_by(threshold));
        assert!(Readiness::Immediate.is_due_by(threshold));
        assert!(!Readiness::Unparseable.is_due_by(threshold));
    }
}
