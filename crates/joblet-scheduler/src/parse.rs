//! Schedule-time parsing (§4.10): "RFC3339 absolute times and relative durations like `30min`,
//! `2h`."

use chrono::{DateTime, Duration, Utc};
use joblet_base::error::{JobletError, Result};

/// Parses `input` as either an RFC3339 timestamp or a relative duration offset from `now`.
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let trimmed = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    let offset = parse_relative_duration(trimmed)?;
    Ok(now + offset)
}

fn parse_relative_duration(input: &str) -> Result<Duration> {
    let split_at = input
        .find(|c: char| !c.is_ascii_digit())
        .filter(|&at| at > 0)
        .ok_or_else(|| invalid(input))?;
    let (number, unit) = input.split_at(split_at);
    let amount: i64 = number.parse().map_err(|_| invalid(input))?;
    let duration = match unit {
        "s" | "sec" | "secs" => Duration::seconds(amount),
        "m" | "min" | "mins" => Duration::minutes(amount),
        "h" | "hr" | "hrs" => Duration::hours(amount),
        "d" | "day" | "days" => Duration::days(amount),
        _ => return Err(invalid(input)),
    };
    Ok(duration)
}

fn invalid(input: &str) -> JobletError {
    JobletError::validation(format!("invalid schedule time: {input}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn parses_rfc3339_absolute_time() {
        let parsed = parse_schedule("2026-01-02T03:04:05Z", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
    }

    #[test]
    fn parses_relative_minutes() {
        let parsed = parse_schedule("30min", now()).unwrap();
        assert_eq!(parsed, now() + Duration::minutes(30));
    }

    #[test]
    fn parses_relative_hours() {
        let parsed = parse_schedule("2h", now()).unwrap();
        assert_eq!(parsed, now() + Duration::hours(2));
    }

    #[test]
    fn rejects_unknown_unit() {
        let err = parse_schedule("5fortnights", now()).unwrap_err();
        assert_matches!(err, JobletError::Validation(_));
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_schedule("soon", now()).unwrap_err();
        assert_matches!(err, JobletError::Validation(_));
    }
}
