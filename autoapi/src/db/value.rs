use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;

use crate::dialect::{CanonicalType, Dialect};
use crate::errors::ApiError;
use crate::meta::ColumnDescriptor;

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// Typed null so drivers can declare a parameter type.
    Null(CanonicalType),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

fn invalid(col: &ColumnDescriptor, expected: &str, got: &Value) -> ApiError {
    ApiError::Validation(format!(
        "Field '{}' expects {}, got {}",
        col.field_name(),
        expected,
        got
    ))
}

fn parse_datetime(s: &str, dialect: Dialect) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(match dialect {
            Dialect::Postgres => s.to_string(),
            Dialect::MySql => dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        });
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())
}

impl SqlValue {
    /// Coerces a JSON request value into a parameter for `col`.
    pub fn from_json(dialect: Dialect, col: &ColumnDescriptor, value: &Value) -> Result<SqlValue, ApiError> {
        if value.is_null() {
            if !col.nullable && !col.is_auto_increment {
                return Err(ApiError::Validation(format!(
                    "Field '{}' cannot be null",
                    col.field_name()
                )));
            }
            return Ok(SqlValue::Null(col.canonical_type));
        }

        match col.canonical_type {
            CanonicalType::Int | CanonicalType::Long => {
                let n = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    Value::Bool(b) => Some(*b as i64),
                    _ => None,
                }
                .ok_or_else(|| invalid(col, "an integer", value))?;
                if col.canonical_type == CanonicalType::Int && i32::try_from(n).is_err() {
                    return Err(invalid(col, "a 32-bit integer", value));
                }
                Ok(SqlValue::Int(n))
            }
            CanonicalType::Float => match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .map(SqlValue::Float)
            .ok_or_else(|| invalid(col, "a number", value)),
            CanonicalType::Decimal => match value {
                Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
                Value::String(s) if s.trim().parse::<f64>().is_ok() => Ok(SqlValue::Text(s.trim().to_string())),
                _ => Err(invalid(col, "a decimal", value)),
            },
            CanonicalType::Bool => match value {
                Value::Bool(b) => Some(*b),
                Value::Number(n) => n.as_i64().and_then(|i| match i {
                    0 => Some(false),
                    1 => Some(true),
                    _ => None,
                }),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "t" => Some(true),
                    "false" | "0" | "no" | "f" => Some(false),
                    _ => None,
                },
                _ => None,
            }
            .map(SqlValue::Bool)
            .ok_or_else(|| invalid(col, "a boolean", value)),
            CanonicalType::String => Ok(SqlValue::Text(match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            })),
            CanonicalType::Date => value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
                .map(|d| SqlValue::Text(d.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| invalid(col, "a date (YYYY-MM-DD)", value)),
            CanonicalType::DateTime => value
                .as_str()
                .and_then(|s| parse_datetime(s.trim(), dialect))
                .map(SqlValue::Text)
                .ok_or_else(|| invalid(col, "a timestamp", value)),
            CanonicalType::Time => value
                .as_str()
                .and_then(|s| {
                    let s = s.trim();
                    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                        .ok()
                })
                .map(|t| SqlValue::Text(t.format("%H:%M:%S%.f").to_string()))
                .ok_or_else(|| invalid(col, "a time (HH:MM:SS)", value)),
            CanonicalType::Bytes => value
                .as_str()
                .and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
                .map(SqlValue::Bytes)
                .ok_or_else(|| invalid(col, "base64 bytes", value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::fixtures::column;
    use serde_json::json;

    #[test]
    fn integers() {
        let c = column("qty", "integer", CanonicalType::Int, 1);
        assert_eq!(SqlValue::from_json(Dialect::Postgres, &c, &json!(5)).unwrap(), SqlValue::Int(5));
        assert_eq!(SqlValue::from_json(Dialect::Postgres, &c, &json!("7")).unwrap(), SqlValue::Int(7));
        assert!(SqlValue::from_json(Dialect::Postgres, &c, &json!(5_000_000_000i64)).is_err());
        assert!(SqlValue::from_json(Dialect::Postgres, &c, &json!("x")).is_err());
        let l = column("big", "bigint", CanonicalType::Long, 1);
        assert_eq!(
            SqlValue::from_json(Dialect::Postgres, &l, &json!(5_000_000_000i64)).unwrap(),
            SqlValue::Int(5_000_000_000)
        );
    }

    #[test]
    fn nulls_respect_nullability() {
        let mut c = column("name", "text", CanonicalType::String, 1);
        assert_eq!(
            SqlValue::from_json(Dialect::Postgres, &c, &Value::Null).unwrap(),
            SqlValue::Null(CanonicalType::String)
        );
        c.nullable = false;
        assert!(matches!(
            SqlValue::from_json(Dialect::Postgres, &c, &Value::Null),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn booleans_and_strings() {
        let b = column("active", "boolean", CanonicalType::Bool, 1);
        assert_eq!(SqlValue::from_json(Dialect::MySql, &b, &json!(1)).unwrap(), SqlValue::Bool(true));
        assert_eq!(SqlValue::from_json(Dialect::MySql, &b, &json!("false")).unwrap(), SqlValue::Bool(false));
        let s = column("meta", "jsonb", CanonicalType::String, 1);
        assert_eq!(
            SqlValue::from_json(Dialect::Postgres, &s, &json!({"a": 1})).unwrap(),
            SqlValue::Text("{\"a\":1}".into())
        );
    }

    #[test]
    fn temporal_values() {
        let d = column("day", "date", CanonicalType::Date, 1);
        assert!(SqlValue::from_json(Dialect::Postgres, &d, &json!("2024-02-30")).is_err());
        assert_eq!(
            SqlValue::from_json(Dialect::Postgres, &d, &json!("2024-02-29")).unwrap(),
            SqlValue::Text("2024-02-29".into())
        );
        let ts = column("at", "datetime", CanonicalType::DateTime, 1);
        assert_eq!(
            SqlValue::from_json(Dialect::MySql, &ts, &json!("2024-01-02T03:04:05Z")).unwrap(),
            SqlValue::Text("2024-01-02 03:04:05".into())
        );
        let t = column("at", "time", CanonicalType::Time, 1);
        assert_eq!(
            SqlValue::from_json(Dialect::MySql, &t, &json!("09:30")).unwrap(),
            SqlValue::Text("09:30:00".into())
        );
    }

    #[test]
    fn bytes_are_base64() {
        let c = column("blob", "bytea", CanonicalType::Bytes, 1);
        assert_eq!(
            SqlValue::from_json(Dialect::Postgres, &c, &json!("aGk=")).unwrap(),
            SqlValue::Bytes(b"hi".to_vec())
        );
        assert!(SqlValue::from_json(Dialect::Postgres, &c, &json!("***")).is_err());
    }
}
