use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{WalError, WalResult};

/// Microseconds since 2000-01-01 00:00:00 UTC.
pub type TimestampTz = i64;

const PG_EPOCH_UNIX_SECS: i64 = 946_684_800;
const USECS_PER_SEC: i64 = 1_000_000;

pub fn now() -> TimestampTz {
    from_datetime(Utc::now())
}

pub fn from_datetime(dt: DateTime<Utc>) -> TimestampTz {
    (dt.timestamp() - PG_EPOCH_UNIX_SECS) * USECS_PER_SEC + dt.timestamp_subsec_micros() as i64
}

pub fn to_datetime(ts: TimestampTz) -> Option<DateTime<Utc>> {
    let secs = ts.div_euclid(USECS_PER_SEC) + PG_EPOCH_UNIX_SECS;
    let micros = ts.rem_euclid(USECS_PER_SEC);
    DateTime::from_timestamp(secs, (micros * 1_000) as u32)
}

/// Renders a timestamp the way the server prints `timestamptz` in UTC:
/// fractional seconds only when non-zero, trailing zeros trimmed.
pub fn format_timestamptz(ts: TimestampTz) -> String {
    let Some(dt) = to_datetime(ts) else {
        return format!("invalid timestamp {}", ts);
    };
    let mut out = dt.format("%Y-%m-%d %H:%M:%S").to_string();
    let micros = ts.rem_euclid(USECS_PER_SEC);
    if micros != 0 {
        let frac = format!("{:06}", micros);
        out.push('.');
        out.push_str(frac.trim_end_matches('0'));
    }
    out.push_str("+00");
    out
}

pub fn parse_timestamptz(input: &str) -> WalResult<TimestampTz> {
    let value = input.trim();
    for pattern in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, pattern) {
            return Ok(from_datetime(dt.with_timezone(&Utc)));
        }
    }
    let naive = value
        .trim_end_matches("UTC")
        .trim_end_matches('Z')
        .trim_end();
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, pattern) {
            return Ok(from_datetime(dt.and_utc()));
        }
    }
    Err(WalError::InvalidConfig(format!(
        "invalid input syntax for type timestamp with time zone: \"{}\"",
        input
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_like_timestamptz_out() {
        assert_eq!(
            format_timestamptz(617_826_371_830_030),
            "2019-07-30 18:26:11.83003+00"
        );
        assert_eq!(format_timestamptz(0), "2000-01-01 00:00:00+00");
    }

    #[test]
    fn parses_with_and_without_zone() {
        let ts = parse_timestamptz("2019-07-30 18:26:11.83003+00").unwrap();
        assert_eq!(ts, 617_826_371_830_030);
        assert_eq!(parse_timestamptz("2000-01-01 00:00:01").unwrap(), 1_000_000);
        assert_eq!(
            parse_timestamptz("2000-01-01 02:00:00+02:00").unwrap(),
            0
        );
        assert!(parse_timestamptz("yesterday").is_err());
    }

    #[test]
    fn datetime_roundtrip() {
        let ts = 617_826_371_830_030;
        assert_eq!(from_datetime(to_datetime(ts).unwrap()), ts);
    }
}
