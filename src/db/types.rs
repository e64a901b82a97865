//! Database-agnostic type mappings.
//!
//! This module decodes database-specific rows into [`Row`] values.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! Unlike a best-effort JSON dump, decoding here is strict: a column that cannot be
//! represented as a [`Value`] is a scan error, because callers scan rows into typed
//! destinations and a silent NULL would hide the mismatch.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Row, Value};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as SqlxRow, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Temporal,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();
    // "BIGINT UNSIGNED", "VARCHAR(255)" → base name
    let base = lower
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");

    match base {
        // SQLite's NUMERIC affinity is really a float
        "numeric" if db == DatabaseType::SQLite => TypeCategory::Float,
        "decimal" | "numeric" => TypeCategory::Decimal,
        "int" | "int2" | "int4" | "int8" | "integer" | "smallint" | "bigint" | "tinyint"
        | "mediumint" | "serial" | "smallserial" | "bigserial" => TypeCategory::Integer,
        "bool" | "boolean" => TypeCategory::Boolean,
        "float" | "float4" | "float8" | "double" | "real" => TypeCategory::Float,
        "json" | "jsonb" => TypeCategory::Json,
        "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" | "bytea" => {
            TypeCategory::Binary
        }
        "timestamp" | "timestamptz" | "datetime" | "date" | "time" => TypeCategory::Temporal,
        "text" | "varchar" | "char" | "bpchar" | "name" | "citext" | "tinytext"
        | "mediumtext" | "longtext" | "enum" | "set" => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

fn decode_error(idx: usize, type_name: &str, err: sqlx::Error) -> DbError {
    DbError::scan(format!(
        "column {} ({}) could not be decoded: {}",
        idx, type_name, err
    ))
}

fn unsupported(idx: usize, type_name: &str) -> DbError {
    DbError::scan(format!(
        "column {} has unsupported type {}; cast it to text in the query",
        idx, type_name
    ))
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        // DECIMAL travels as text in both MySQL protocols
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(pg_numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

/// Render the PostgreSQL binary NUMERIC format as a decimal string.
///
/// Layout: ndigits, weight, sign, dscale (all i16/u16 big-endian), then `ndigits`
/// base-10000 digit groups, the first of which has weight `weight`.
pub(crate) fn pg_numeric_to_string(buf: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;
    const POS_INF: u16 = 0xD000;
    const NEG_INF: u16 = 0xF000;

    if buf.len() < 8 {
        return Err("NUMERIC value is too short".into());
    }
    let read_u16 = |at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);
    let ndigits = read_u16(0) as usize;
    let weight = read_u16(2) as i16 as i32;
    let sign = read_u16(4);
    let dscale = read_u16(6) as usize;

    match sign {
        NAN => return Ok("NaN".to_string()),
        POS_INF => return Ok("Infinity".to_string()),
        NEG_INF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    if buf.len() < 8 + ndigits * 2 {
        return Err("NUMERIC value is truncated".into());
    }
    let digit = |pos: i32| -> u16 {
        if pos < 0 || pos as usize >= ndigits {
            0
        } else {
            read_u16(8 + pos as usize * 2)
        }
    };

    let mut out = String::new();
    if sign == NEGATIVE {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for pos in 0..=weight {
            if pos == 0 {
                out.push_str(&digit(pos).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(pos)));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut pos = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(pos)));
            pos += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}

// =============================================================================
// Row Decoding Trait
// =============================================================================

/// Trait for converting database rows into [`Row`] values.
pub trait DecodeRow {
    fn decode_row(&self) -> DbResult<Row>;
}

/// Walk the columns of `row`, short-circuiting NULLs and dispatching the rest by category.
fn decode_columns<R, F>(row: &R, db: DatabaseType, decode: F) -> DbResult<Row>
where
    R: SqlxRow,
    usize: sqlx::ColumnIndex<R>,
    F: Fn(&R, usize, &str, TypeCategory) -> DbResult<Value>,
{
    let mut names = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());

    for (idx, col) in row.columns().iter().enumerate() {
        names.push(col.name().to_string());

        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }
        // Value type rather than declared type: SQLite columns are dynamically typed
        let type_name = raw.type_info().name().to_string();
        drop(raw);

        let category = categorize_type(&type_name, db);
        values.push(decode(row, idx, &type_name, category)?);
    }

    Ok(Row::new(names, values))
}

impl DecodeRow for MySqlRow {
    fn decode_row(&self) -> DbResult<Row> {
        decode_columns(self, DatabaseType::MySQL, mysql::decode_column)
    }
}

impl DecodeRow for PgRow {
    fn decode_row(&self) -> DbResult<Row> {
        decode_columns(self, DatabaseType::PostgreSQL, postgres::decode_column)
    }
}

impl DecodeRow for SqliteRow {
    fn decode_row(&self) -> DbResult<Row> {
        decode_columns(self, DatabaseType::SQLite, sqlite::decode_column)
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        let err = |e| decode_error(idx, type_name, e);
        match category {
            TypeCategory::Decimal => Ok(Value::String(
                row.try_get::<RawDecimal, _>(idx).map_err(err)?.0,
            )),
            TypeCategory::Integer => decode_integer(row, idx, type_name),
            TypeCategory::Boolean => Ok(Value::Bool(row.try_get(idx).map_err(err)?)),
            TypeCategory::Float => {
                if let Ok(v) = row.try_get::<f64, _>(idx) {
                    return Ok(Value::Float(v));
                }
                Ok(Value::Float(row.try_get::<f32, _>(idx).map_err(err)? as f64))
            }
            TypeCategory::Binary => Ok(Value::Bytes(row.try_get(idx).map_err(err)?)),
            TypeCategory::Json => Ok(Value::Json(row.try_get(idx).map_err(err)?)),
            TypeCategory::Temporal => decode_temporal(row, idx, type_name),
            TypeCategory::Text | TypeCategory::Unknown => row
                .try_get::<String, _>(idx)
                .map(Value::String)
                .map_err(|_| unsupported(idx, type_name)),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize, type_name: &str) -> DbResult<Value> {
        // Try signed types
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Ok(Value::Int(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Ok(Value::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Ok(Value::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i8, _>(idx) {
            return Ok(Value::Int(v.into()));
        }
        // Try unsigned types
        if let Ok(v) = row.try_get::<u64, _>(idx) {
            return i64::try_from(v).map(Value::Int).map_err(|_| {
                DbError::scan(format!("column {} value {} overflows i64", idx, v))
            });
        }
        if let Ok(v) = row.try_get::<u32, _>(idx) {
            return Ok(Value::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<u16, _>(idx) {
            return Ok(Value::Int(v.into()));
        }
        row.try_get::<u8, _>(idx)
            .map(|v| Value::Int(v.into()))
            .map_err(|e| decode_error(idx, type_name, e))
    }

    fn decode_temporal(row: &MySqlRow, idx: usize, type_name: &str) -> DbResult<Value> {
        let err = |e| decode_error(idx, type_name, e);
        let text = match type_name.to_lowercase().as_str() {
            "timestamp" => row
                .try_get::<DateTime<Utc>, _>(idx)
                .map_err(err)?
                .to_rfc3339(),
            "datetime" => row.try_get::<NaiveDateTime, _>(idx).map_err(err)?.to_string(),
            "date" => row.try_get::<NaiveDate, _>(idx).map_err(err)?.to_string(),
            "time" => row.try_get::<NaiveTime, _>(idx).map_err(err)?.to_string(),
            _ => return Err(unsupported(idx, type_name)),
        };
        Ok(Value::String(text))
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        let err = |e| decode_error(idx, type_name, e);
        match category {
            TypeCategory::Decimal => Ok(Value::String(
                row.try_get::<RawDecimal, _>(idx).map_err(err)?.0,
            )),
            TypeCategory::Integer => {
                if let Ok(v) = row.try_get::<i64, _>(idx) {
                    return Ok(Value::Int(v));
                }
                if let Ok(v) = row.try_get::<i32, _>(idx) {
                    return Ok(Value::Int(v.into()));
                }
                Ok(Value::Int(row.try_get::<i16, _>(idx).map_err(err)?.into()))
            }
            TypeCategory::Boolean => Ok(Value::Bool(row.try_get(idx).map_err(err)?)),
            TypeCategory::Float => {
                if let Ok(v) = row.try_get::<f64, _>(idx) {
                    return Ok(Value::Float(v));
                }
                Ok(Value::Float(row.try_get::<f32, _>(idx).map_err(err)? as f64))
            }
            TypeCategory::Binary => Ok(Value::Bytes(row.try_get(idx).map_err(err)?)),
            TypeCategory::Json => Ok(Value::Json(row.try_get(idx).map_err(err)?)),
            TypeCategory::Temporal => {
                let text = match type_name.to_lowercase().as_str() {
                    "timestamptz" => row
                        .try_get::<DateTime<Utc>, _>(idx)
                        .map_err(err)?
                        .to_rfc3339(),
                    "timestamp" => row.try_get::<NaiveDateTime, _>(idx).map_err(err)?.to_string(),
                    "date" => row.try_get::<NaiveDate, _>(idx).map_err(err)?.to_string(),
                    "time" => row.try_get::<NaiveTime, _>(idx).map_err(err)?.to_string(),
                    _ => return Err(unsupported(idx, type_name)),
                };
                Ok(Value::String(text))
            }
            TypeCategory::Text | TypeCategory::Unknown => row
                .try_get::<String, _>(idx)
                .map(Value::String)
                .map_err(|_| unsupported(idx, type_name)),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        let err = |e| decode_error(idx, type_name, e);
        match category {
            TypeCategory::Integer | TypeCategory::Boolean => {
                Ok(Value::Int(row.try_get(idx).map_err(err)?))
            }
            TypeCategory::Float | TypeCategory::Decimal => {
                Ok(Value::Float(row.try_get(idx).map_err(err)?))
            }
            TypeCategory::Binary => Ok(Value::Bytes(row.try_get(idx).map_err(err)?)),
            _ => Ok(Value::String(row.try_get(idx).map_err(err)?)),
        }
    }
}
