use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::AttributionError;

/// Upper bound on the lifetime of a source and of its aggregatable report window.
pub const MAX_SOURCE_EXPIRY: Duration = Duration::days(30);

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    truncate_to_micros(OffsetDateTime::now_utc().to_offset(UtcOffset::UTC))
}

/// Drops sub-microsecond precision so values survive a trip through the database.
#[must_use]
pub fn truncate_to_micros(value: OffsetDateTime) -> OffsetDateTime {
    let nanos = value.nanosecond();
    value.replace_nanosecond(nanos - nanos % 1_000).unwrap_or(value)
}

#[must_use]
pub fn min_time() -> OffsetDateTime {
    PrimitiveDateTime::MIN.assume_utc()
}

#[must_use]
pub fn max_time() -> OffsetDateTime {
    PrimitiveDateTime::MAX.assume_utc()
}

#[must_use]
pub fn to_micros(value: OffsetDateTime) -> i64 {
    let micros = value.unix_timestamp_nanos() / 1_000;
    i64::try_from(micros).unwrap_or(if micros < 0 { i64::MIN } else { i64::MAX })
}

/// Converts microseconds since the Unix epoch back into an instant.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when the value is outside the
/// representable calendar range.
pub fn from_micros(micros: i64) -> Result<OffsetDateTime, AttributionError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|err| AttributionError::Validation(format!("invalid timestamp {micros}: {err}")))
}

#[must_use]
pub fn duration_to_micros(value: Duration) -> i64 {
    i64::try_from(value.whole_microseconds()).unwrap_or(if value.is_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}

#[must_use]
pub fn saturating_add(value: OffsetDateTime, delta: Duration) -> OffsetDateTime {
    value.checked_add(delta).unwrap_or_else(|| {
        if delta.is_negative() {
            min_time()
        } else {
            max_time()
        }
    })
}

#[must_use]
pub fn saturating_sub(value: OffsetDateTime, delta: Duration) -> OffsetDateTime {
    value.checked_sub(delta).unwrap_or_else(|| {
        if delta.is_negative() {
            max_time()
        } else {
            min_time()
        }
    })
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when parsing fails or the input
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AttributionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AttributionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AttributionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(truncate_to_micros(parsed))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AttributionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AttributionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T, AttributionError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn micros_survive_conversion() {
        let instant = OffsetDateTime::UNIX_EPOCH + Duration::days(20_000) + Duration::microseconds(7);
        assert_eq!(must(from_micros(to_micros(instant))), instant);
    }

    #[test]
    fn extreme_instants_fit_in_micros() {
        assert_eq!(must(from_micros(to_micros(min_time()))), truncate_to_micros(min_time()));
        assert_eq!(must(from_micros(to_micros(max_time()))), truncate_to_micros(max_time()));
    }

    #[test]
    fn saturating_add_clamps_to_max() {
        assert_eq!(saturating_add(max_time(), Duration::MAX), max_time());
        assert_eq!(saturating_sub(min_time(), Duration::days(1)), min_time());
    }

    #[test]
    fn rfc3339_requires_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+01:00").is_err());
        let parsed = must(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }
}
