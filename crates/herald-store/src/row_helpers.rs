use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON string column.
pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Parse an RFC 3339 timestamp column.
pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp: {e}"),
        })
}

/// Fixed-width UTC rendering so stored timestamps compare lexically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::EventType;

    #[test]
    fn parse_enum_success() {
        let result: Result<EventType, _> = parse_enum("game_update", "events", "event_type");
        assert_eq!(result.unwrap(), EventType::GameUpdate);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<EventType, _> = parse_enum("INVALID", "events", "event_type");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "events", column: "event_type", .. })
        ));
    }

    #[test]
    fn parse_json_failure() {
        let result = parse_json("not valid json", "events", "payload");
        assert!(matches!(result, Err(StoreError::CorruptRow { column: "payload", .. })));
    }

    #[test]
    fn timestamp_format_roundtrips_and_sorts() {
        let a = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.000007Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.1Z")
            .unwrap()
            .with_timezone(&Utc);
        let (sa, sb) = (format_timestamp(&a), format_timestamp(&b));
        assert_eq!(sa, "2026-01-02T03:04:05.000007Z");
        assert!(sa < sb);
        assert_eq!(parse_timestamp(&sa, "events", "server_timestamp").unwrap(), a);
    }
}
