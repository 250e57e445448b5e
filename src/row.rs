// ABOUTME: Schema-less row representation shared by every store
// ABOUTME: Rows are JSON objects that must carry `id` and `updated_at`

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// A row is a mapping from column name to scalar value.
pub type Row = Map<String, Value>;

pub const ID_COLUMN: &str = "id";
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Build a row from a JSON value, rejecting anything that is not an object.
pub fn row_from_value(value: Value) -> SyncResult<Row> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::InvalidRow(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

/// The row's `id`, if present and not null.
pub fn row_id(row: &Row) -> Option<&Value> {
    row.get(ID_COLUMN).filter(|v| !v.is_null())
}

/// Stable string form of an id, used as a map key and in log lines.
///
/// Strings map to themselves so `"42"` and `42` collide, matching how a
/// text comparison on the server would treat them.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse the row's `updated_at` as a UTC timestamp.
///
/// Accepts RFC 3339 strings and naive `YYYY-MM-DD[T ]HH:MM:SS[.f]`
/// strings (interpreted as UTC).
pub fn row_updated_at(row: &Row) -> Option<DateTime<Utc>> {
    row.get(UPDATED_AT_COLUMN).and_then(parse_timestamp)
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Columns other than `id`, in the row's own order.
pub fn non_id_columns(row: &Row) -> Vec<String> {
    row.keys().filter(|k| *k != ID_COLUMN).cloned().collect()
}

/// Fill in `id` and `updated_at` when the caller left them out.
///
/// Only used on the local-only write path: the master may assign ids itself,
/// but a queued record needs a stable id to be replayable.
pub fn stamp_local_row(row: &mut Row, now: DateTime<Utc>) {
    if row_id(row).is_none() {
        row.insert(
            ID_COLUMN.to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
    }
    if row.get(UPDATED_AT_COLUMN).map_or(true, Value::is_null) {
        row.insert(UPDATED_AT_COLUMN.to_string(), Value::String(now.to_rfc3339()));
    }
}

/// True if every `(column, value)` pair in `filter` equals the row's value.
/// A missing column compares equal to `null`.
pub fn matches_filter(row: &Row, filter: &Row) -> bool {
    filter
        .iter()
        .all(|(column, expected)| row.get(column).unwrap_or(&Value::Null) == expected)
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn row(value: Value) -> Row {
        row_from_value(value).unwrap()
    }

    #[test]
    fn test_row_from_value_rejects_non_objects() {
        assert!(row_from_value(json!([1, 2])).is_err());
        assert!(row_from_value(json!("x")).is_err());
    }

    #[test]
    fn test_row_id_ignores_null() {
        assert!(row_id(&row(json!({"id": null}))).is_none());
        assert_eq!(row_id(&row(json!({"id": 7}))), Some(&json!(7)));
    }

    #[test]
    fn test_id_key() {
        assert_eq!(id_key(&json!("u1")), "u1");
        assert_eq!(id_key(&json!(42)), "42");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2024-03-01T12:00:00Z")), Some(expected));
        assert_eq!(
            parse_timestamp(&json!("2024-03-01T14:00:00+02:00")),
            Some(expected)
        );
        assert_eq!(parse_timestamp(&json!("2024-03-01T12:00:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-03-01 12:00:00.000")), Some(expected));
        assert_eq!(parse_timestamp(&json!(12)), None);
    }

    #[test]
    fn test_stamp_local_row_keeps_existing_values() {
        let now = Utc::now();
        let mut r = row(json!({"id": "u1", "updated_at": "2024-01-01T00:00:00Z"}));
        stamp_local_row(&mut r, now);
        assert_eq!(r["id"], json!("u1"));
        assert_eq!(r["updated_at"], json!("2024-01-01T00:00:00Z"));

        let mut r = row(json!({"name": "Ann"}));
        stamp_local_row(&mut r, now);
        assert!(r["id"].as_str().is_some());
        assert_eq!(row_updated_at(&r).map(|t| t.timestamp()), Some(now.timestamp()));
    }

    #[test]
    fn test_matches_filter() {
        let r = row(json!({"id": "u1", "name": "Ann", "team": null}));
        assert!(matches_filter(&r, &row(json!({"name": "Ann"}))));
        assert!(matches_filter(&r, &row(json!({"team": null}))));
        assert!(matches_filter(&r, &row(json!({"missing": null}))));
        assert!(!matches_filter(&r, &row(json!({"name": "Bob"}))));
        assert!(matches_filter(&r, &Row::new()));
    }
}
