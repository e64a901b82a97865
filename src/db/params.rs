//! Parameter binding utilities for database queries.
//!
//! This module binds positional [`Value`] arguments, produced by the named-parameter
//! rewriter, to database-specific query objects.

use crate::models::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo};
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Encode, MySql, Postgres, Sqlite, Type, TypeInfo};

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q Value,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::String(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        Value::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a PostgreSQL query.
///
/// `ty` is the parameter type the server resolved for this slot (see
/// [`declared_postgres_type`]); the value is encoded as that type.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q Value,
    ty: PgTypeInfo,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    query.bind(PgParam { value: param, ty })
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::String(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON type, store as string
        Value::Json(v) => query.bind(v.to_string()),
    }
}

// =============================================================================
// PostgreSQL Parameter Types
// =============================================================================
//
// sqlx sends every parameter in binary format, so a value has to be encoded as
// exactly the type the server expects. Strings and NULLs are declared with an
// unspecified type (OID 0) when the statement is prepared; the server infers it
// from context, and the text is then converted client-side.

/// SQLSTATE for "could not determine data type of parameter".
pub(crate) const INDETERMINATE_DATATYPE: &str = "42P18";

/// Parameter type to declare when preparing a statement.
///
/// With `infer` set, strings and NULLs are left unspecified so the server picks
/// the column type; otherwise they are declared as TEXT.
pub(crate) fn declared_postgres_type(param: &Value, infer: bool) -> PgTypeInfo {
    match param {
        Value::Null | Value::String(_) if infer => PgTypeInfo::with_oid(Oid(0)),
        Value::Null | Value::String(_) => <&str as Type<Postgres>>::type_info(),
        Value::Bool(_) => <bool as Type<Postgres>>::type_info(),
        Value::Int(_) => <i64 as Type<Postgres>>::type_info(),
        Value::Float(_) => <f64 as Type<Postgres>>::type_info(),
        Value::Bytes(_) => <&[u8] as Type<Postgres>>::type_info(),
        Value::Json(_) => <Json<serde_json::Value> as Type<Postgres>>::type_info(),
    }
}

/// A [`Value`] encoded as the parameter type the server resolved.
#[derive(Debug)]
struct PgParam<'a> {
    value: &'a Value,
    ty: PgTypeInfo,
}

impl Type<Postgres> for PgParam<'_> {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for PgParam<'_> {
    fn produces(&self) -> Option<PgTypeInfo> {
        Some(self.ty.clone())
    }

    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        let ty = self.ty.name();
        match self.value {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => match ty {
                "BOOL" => encode(v, buf),
                _ if is_text_type(ty) => encode(&v.to_string().as_str(), buf),
                _ => encode(v, buf),
            },
            Value::Int(v) => match ty {
                "INT2" => encode(&i16::try_from(*v)?, buf),
                "INT4" => encode(&i32::try_from(*v)?, buf),
                "FLOAT4" => encode(&(*v as f32), buf),
                "FLOAT8" => encode(&(*v as f64), buf),
                "NUMERIC" => encode(&pg_numeric_from_str(&v.to_string())?.as_slice(), buf),
                _ if is_text_type(ty) => encode(&v.to_string().as_str(), buf),
                _ => encode(v, buf),
            },
            Value::Float(v) => match ty {
                "FLOAT4" => encode(&(*v as f32), buf),
                "NUMERIC" => encode(&pg_numeric_from_str(&v.to_string())?.as_slice(), buf),
                _ if is_text_type(ty) => encode(&v.to_string().as_str(), buf),
                _ => encode(v, buf),
            },
            Value::String(v) => encode_text_as(v, ty, buf),
            Value::Bytes(v) => encode(&v.as_slice(), buf),
            Value::Json(v) => match ty {
                "JSON" | "JSONB" => encode(&Json(v), buf),
                _ => encode(&v.to_string().as_str(), buf),
            },
        }
    }
}

fn encode<'q, T>(value: &T, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError>
where
    T: Encode<'q, Postgres>,
{
    value.encode_by_ref(buf)
}

/// Types whose binary wire format is the UTF-8 text itself.
fn is_text_type(ty: &str) -> bool {
    matches!(ty, "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "UNKNOWN")
}

/// Convert a string to the binary form of `ty`.
///
/// Types without a conversion here (enums, citext, xml and the like) are sent as
/// raw text, which is their binary format too.
fn encode_text_as(
    text: &str,
    ty: &str,
    buf: &mut PgArgumentBuffer,
) -> Result<IsNull, BoxDynError> {
    let trimmed = text.trim();
    match ty {
        "BOOL" => encode(&parse_pg_bool(trimmed)?, buf),
        "INT2" => encode(&trimmed.parse::<i16>()?, buf),
        "INT4" => encode(&trimmed.parse::<i32>()?, buf),
        "INT8" => encode(&trimmed.parse::<i64>()?, buf),
        "FLOAT4" => encode(&trimmed.parse::<f32>()?, buf),
        "FLOAT8" => encode(&trimmed.parse::<f64>()?, buf),
        "NUMERIC" => encode(&pg_numeric_from_str(trimmed)?.as_slice(), buf),
        "DATE" => encode(&NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")?, buf),
        "TIME" => encode(&parse_time(trimmed)?, buf),
        "TIMESTAMP" => encode(&parse_timestamp(trimmed)?, buf),
        "TIMESTAMPTZ" => encode(&parse_timestamptz(trimmed)?, buf),
        "UUID" => encode(&uuid::Uuid::parse_str(trimmed)?.as_bytes().as_slice(), buf),
        "JSON" | "JSONB" => {
            let value: serde_json::Value = serde_json::from_str(text)?;
            encode(&Json(value), buf)
        }
        _ => encode(&text, buf),
    }
}

/// Accepts the spellings PostgreSQL's own boolean input accepts.
fn parse_pg_bool(s: &str) -> Result<bool, BoxDynError> {
    match s.to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Ok(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Ok(false),
        _ => Err(format!("invalid input syntax for type boolean: {:?}", s).into()),
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, BoxDynError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| format!("invalid time {:?}: {}", s, e).into())
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, BoxDynError> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(ts);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::default()))
        .map_err(|e| format!("invalid timestamp {:?}: {}", s, e).into())
}

/// Zoned input keeps its offset; input without one is taken as UTC.
fn parse_timestamptz(s: &str) -> Result<DateTime<Utc>, BoxDynError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f %#z"] {
        if let Ok(ts) = DateTime::parse_from_str(s, format) {
            return Ok(ts.with_timezone(&Utc));
        }
    }
    Ok(Utc.from_utc_datetime(&parse_timestamp(s)?))
}

/// Encode a decimal string in the PostgreSQL binary NUMERIC format.
///
/// Accepts an optional sign, digits and an optional fraction; `NaN` is passed
/// through. The display scale is the number of fraction digits given.
fn pg_numeric_from_str(s: &str) -> Result<Vec<u8>, BoxDynError> {
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;

    let invalid =
        || -> BoxDynError { format!("invalid input syntax for type numeric: {:?}", s).into() };

    if s.eq_ignore_ascii_case("nan") {
        return Ok(numeric_bytes(0, NAN, 0, &[]));
    }

    let (sign, unsigned) = match s.as_bytes().first() {
        Some(b'-') => (NEGATIVE, &s[1..]),
        Some(b'+') => (0, &s[1..]),
        _ => (0, s),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let dscale = u16::try_from(frac_part.len()).map_err(|_| invalid())?;

    let int_part = int_part.trim_start_matches('0');
    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let int_digits = format!("{}{}", "0".repeat(int_pad), int_part);
    let frac_digits = format!("{}{}", frac_part, "0".repeat(frac_pad));

    let group = |chunk: &[u8]| chunk.iter().fold(0i16, |acc, b| acc * 10 + i16::from(b - b'0'));
    let mut digits: Vec<i16> = int_digits
        .as_bytes()
        .chunks(4)
        .chain(frac_digits.as_bytes().chunks(4))
        .map(group)
        .collect();
    let mut weight = i16::try_from(int_digits.len() / 4).map_err(|_| invalid())? - 1;

    let leading = digits.iter().take_while(|d| **d == 0).count();
    digits.drain(..leading);
    weight -= i16::try_from(leading).map_err(|_| invalid())?;
    while digits.last() == Some(&0) {
        digits.pop();
    }

    if digits.is_empty() {
        return Ok(numeric_bytes(0, 0, dscale, &[]));
    }
    Ok(numeric_bytes(weight, sign, dscale, &digits))
}

fn numeric_bytes(weight: i16, sign: u16, dscale: u16, digits: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + digits.len() * 2);
    out.extend_from_slice(&(digits.len() as i16).to_be_bytes());
    out.extend_from_slice(&weight.to_be_bytes());
    out.extend_from_slice(&sign.to_be_bytes());
    out.extend_from_slice(&dscale.to_be_bytes());
    for digit in digits {
        out.extend_from_slice(&digit.to_be_bytes());
    }
    out
}
