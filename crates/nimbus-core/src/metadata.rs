//! Registry of well-known item metadata keys and their value types.

use chrono::{DateTime, SecondsFormat, Utc};

pub const SIZE_IN_BYTES: &str = "size_in_bytes";
pub const CREATION_TIME: &str = "creation_time";
pub const LAST_MODIFIED_TIME: &str = "last_modified_time";
pub const CHILD_COUNT: &str = "child_count";
pub const DESCRIPTION: &str = "description";
pub const DISPLAY_NAME: &str = "display_name";
pub const FREE_SPACE_BYTES: &str = "free_space_bytes";
pub const USED_SPACE_BYTES: &str = "used_space_bytes";
pub const CONTENT_TYPE: &str = "content_type";
pub const WRITABLE: &str = "writable";

/// Declared type of a known metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataType {
    /// ISO 8601 timestamp with an explicit time zone.
    Iso8601DateTime,
    NonNegativeInt64,
    String,
    Boolean,
}

/// Look up the declared type of `key`, or `None` for keys outside the registry.
pub fn known_type(key: &str) -> Option<MetadataType> {
    let ty = match key {
        SIZE_IN_BYTES | CHILD_COUNT | FREE_SPACE_BYTES | USED_SPACE_BYTES => {
            MetadataType::NonNegativeInt64
        }
        CREATION_TIME | LAST_MODIFIED_TIME => MetadataType::Iso8601DateTime,
        DESCRIPTION | DISPLAY_NAME | CONTENT_TYPE => MetadataType::String,
        WRITABLE => MetadataType::Boolean,
        _ => return None,
    };
    Some(ty)
}

/// Format a timestamp the way providers put it on the wire (`2024-05-01T10:00:00Z`).
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an ISO 8601 timestamp. A missing zone designator is rejected.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn registry_types() {
        assert_eq!(known_type(SIZE_IN_BYTES), Some(MetadataType::NonNegativeInt64));
        assert_eq!(known_type(LAST_MODIFIED_TIME), Some(MetadataType::Iso8601DateTime));
        assert_eq!(known_type(WRITABLE), Some(MetadataType::Boolean));
        assert_eq!(known_type("colour"), None);
    }

    #[test]
    fn timestamps_need_a_zone() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(format_timestamp(t), "2024-05-01T10:00:00Z");
        assert_eq!(parse_timestamp("2024-05-01T10:00:00Z"), Some(t));
        assert_eq!(parse_timestamp("2024-05-01T12:00:00+02:00"), Some(t));
        assert_eq!(parse_timestamp("2024-05-01T10:00:00"), None);
    }
}
