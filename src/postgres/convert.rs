// ABOUTME: Conversions between JSON values and PostgreSQL wire types
// ABOUTME: Used by the raw query path where column types are only known at runtime

use serde_json::{Number, Value};
use tokio_postgres::types::{ToSql, Type};

use crate::error::{SyncError, SyncResult};
use crate::row::{json_type_name, parse_timestamp, Row};

/// Convert a result row to a JSON object by dispatching on each column's type.
///
/// Types without a direct mapping are read as text when the server can
/// provide it, and become `null` otherwise.
pub fn row_to_json(row: &tokio_postgres::Row) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = column_value(row, idx, column.type_());
        out.insert(column.name().to_string(), value);
    }
    out
}

fn column_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    match ty.name() {
        "int2" => opt(row.try_get::<_, Option<i16>>(idx), |v| Value::from(v)),
        "int4" => opt(row.try_get::<_, Option<i32>>(idx), |v| Value::from(v)),
        "int8" => opt(row.try_get::<_, Option<i64>>(idx), |v| Value::from(v)),
        "float4" => opt(row.try_get::<_, Option<f32>>(idx), |v| float(f64::from(v))),
        "float8" => opt(row.try_get::<_, Option<f64>>(idx), float),
        "bool" => opt(row.try_get::<_, Option<bool>>(idx), Value::Bool),
        "text" | "varchar" | "bpchar" | "name" | "char" => {
            opt(row.try_get::<_, Option<String>>(idx), Value::String)
        }
        "uuid" => opt(row.try_get::<_, Option<uuid::Uuid>>(idx), |v| {
            Value::String(v.to_string())
        }),
        "timestamp" => opt(row.try_get::<_, Option<chrono::NaiveDateTime>>(idx), |v| {
            Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }),
        "timestamptz" => opt(
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx),
            |v| Value::String(v.to_rfc3339()),
        ),
        "date" => opt(row.try_get::<_, Option<chrono::NaiveDate>>(idx), |v| {
            Value::String(v.to_string())
        }),
        "json" | "jsonb" => opt(row.try_get::<_, Option<Value>>(idx), |v| v),
        "bytea" => opt(row.try_get::<_, Option<Vec<u8>>>(idx), |v| {
            Value::String(to_hex(&v))
        }),
        _ => opt(row.try_get::<_, Option<String>>(idx), Value::String),
    }
}

fn opt<T, E>(value: Result<Option<T>, E>, map: impl FnOnce(T) -> Value) -> Value {
    match value {
        Ok(Some(v)) => map(v),
        _ => Value::Null,
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// Postgres `bytea` hex output format: `\x0a1b...`
fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Convert a JSON parameter to a value the driver accepts for `ty`.
///
/// The parameter types come from the prepared statement, so `$1` in
/// `WHERE id = $1` gets the column's type and a JSON number or string is
/// converted accordingly. `null` becomes a typed SQL NULL.
pub fn json_to_param(ty: &Type, value: &Value) -> SyncResult<Box<dyn ToSql + Sync + Send>> {
    let mismatch = || {
        SyncError::InvalidRow(format!(
            "cannot bind JSON {} as {}",
            json_type_name(value),
            ty.name()
        ))
    };

    let param: Box<dyn ToSql + Sync + Send> = match ty.name() {
        "int2" => Box::new(int_param(value, mismatch)?.map(i16::try_from).transpose().map_err(|_| mismatch())?),
        "int4" => Box::new(int_param(value, mismatch)?.map(i32::try_from).transpose().map_err(|_| mismatch())?),
        "int8" => Box::new(int_param(value, mismatch)?),
        "float4" => Box::new(float_param(value, mismatch)?.map(|f| f as f32)),
        "float8" => Box::new(float_param(value, mismatch)?),
        "bool" => Box::new(match value {
            Value::Null => None,
            Value::Bool(b) => Some(*b),
            _ => return Err(mismatch()),
        }),
        "uuid" => Box::new(match value {
            Value::Null => None,
            Value::String(s) => Some(uuid::Uuid::parse_str(s).map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        }),
        "timestamptz" => Box::new(match value {
            Value::Null => None,
            other => Some(parse_timestamp(other).ok_or_else(mismatch)?),
        }),
        "timestamp" => Box::new(match value {
            Value::Null => None,
            other => Some(parse_timestamp(other).ok_or_else(mismatch)?.naive_utc()),
        }),
        "date" => Box::new(match value {
            Value::Null => None,
            Value::String(s) => Some(
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| mismatch())?,
            ),
            _ => return Err(mismatch()),
        }),
        "json" | "jsonb" => Box::new(value.clone()),
        _ => Box::new(match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }),
    };
    Ok(param)
}

fn int_param(value: &Value, mismatch: impl Fn() -> SyncError) -> SyncResult<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_i64().map(Some).ok_or_else(mismatch),
        Value::String(s) => s.trim().parse().map(Some).map_err(|_| mismatch()),
        _ => Err(mismatch()),
    }
}

fn float_param(value: &Value, mismatch: impl Fn() -> SyncError) -> SyncResult<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(mismatch),
        Value::String(s) => s.trim().parse().map(Some).map_err(|_| mismatch()),
        _ => Err(mismatch()),
    }
}
