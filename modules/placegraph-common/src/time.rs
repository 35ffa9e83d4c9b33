use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};

use crate::error::PlaceGraphError;

/// All pub timestamps are normalized to this reference offset (Beijing time)
/// before storage; comparisons use the parsed instant.
pub const REFERENCE_TZ_OFFSET_HOURS: i32 = 8;

pub fn reference_offset() -> FixedOffset {
    FixedOffset::east_opt(REFERENCE_TZ_OFFSET_HOURS * 3600)
        .unwrap_or_else(|| unreachable!("constant offset is in range"))
}

/// Parse an ISO-8601 pub timestamp. Accepts an explicit offset or 'Z';
/// a naive timestamp is interpreted in the reference timezone. Absence or
/// malformed input is a validation failure, never a silent default.
pub fn parse_pub_timestamp(raw: &str) -> Result<DateTime<Utc>, PlaceGraphError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PlaceGraphError::Validation(
            "pub_timestamp is missing".into(),
        ));
    }

    let with_offset = trimmed.replace('Z', "+00:00");
    if let Ok(dt) = DateTime::parse_from_rfc3339(&with_offset) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        if let Some(local) = naive.and_local_timezone(reference_offset()).single() {
            return Ok(local.with_timezone(&Utc));
        }
    }

    Err(PlaceGraphError::Validation(format!(
        "invalid pub_timestamp '{raw}'"
    )))
}

/// Render an instant in the reference timezone for storage.
pub fn to_reference_string(dt: &DateTime<Utc>) -> String {
    dt.with_timezone(&reference_offset()).to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zulu_suffix() {
        let dt = parse_pub_timestamp("2025-06-27T10:39:56Z").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-06-27T10:39:56+00:00");
    }

    #[test]
    fn parses_explicit_offset() {
        let dt = parse_pub_timestamp("2025-06-27T22:39:56+08:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-06-27T14:39:56+00:00");
    }

    #[test]
    fn naive_timestamp_assumes_reference_timezone() {
        let dt = parse_pub_timestamp("2025-06-27T22:39:56").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-06-27T14:39:56+00:00");
    }

    #[test]
    fn missing_timestamp_is_a_validation_error() {
        assert!(matches!(
            parse_pub_timestamp("   "),
            Err(PlaceGraphError::Validation(_))
        ));
    }

    #[test]
    fn garbage_is_a_validation_error() {
        assert!(matches!(
            parse_pub_timestamp("last tuesday"),
            Err(PlaceGraphError::Validation(_))
        ));
    }

    #[test]
    fn reference_rendering_uses_plus_eight() {
        let dt = parse_pub_timestamp("2025-06-27T10:39:56Z").unwrap();
        assert_eq!(to_reference_string(&dt), "2025-06-27T18:39:56+08:00");
    }
}
