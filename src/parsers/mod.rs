// Per-type value codecs mapping between PostgreSQL wire representations
// (text and binary) and backend values. One codec module per non-trivial
// base type; fixed-width integers, floats, booleans and strings live here.

// Standard library imports
use std::str::FromStr;

// External crate imports
use bytes::{BufMut, BytesMut};
use chrono_tz::Tz;

// Internal crate imports
use crate::errors::{PgError, SqlState};

pub mod array;
pub mod bytea;
pub mod date;
pub mod numeric;
pub mod timestamp;

/// Type OIDs used on the wire.
pub mod oid {
    pub const BOOL: i32 = 16;
    pub const BYTEA: i32 = 17;
    pub const INT8: i32 = 20;
    pub const INT2: i32 = 21;
    pub const INT4: i32 = 23;
    pub const TEXT: i32 = 25;
    pub const FLOAT4: i32 = 700;
    pub const FLOAT8: i32 = 701;
    pub const VARCHAR: i32 = 1043;
    pub const DATE: i32 = 1082;
    pub const TIMESTAMPTZ: i32 = 1184;
    pub const NUMERIC: i32 = 1700;
    pub const JSONB: i32 = 3802;
    // Array types.
    pub const BOOL_ARRAY: i32 = 1000;
    pub const BYTEA_ARRAY: i32 = 1001;
    pub const INT2_ARRAY: i32 = 1005;
    pub const INT4_ARRAY: i32 = 1007;
    pub const TEXT_ARRAY: i32 = 1009;
    pub const VARCHAR_ARRAY: i32 = 1015;
    pub const INT8_ARRAY: i32 = 1016;
    pub const FLOAT4_ARRAY: i32 = 1021;
    pub const FLOAT8_ARRAY: i32 = 1022;
    pub const DATE_ARRAY: i32 = 1182;
    pub const TIMESTAMPTZ_ARRAY: i32 = 1185;
    pub const NUMERIC_ARRAY: i32 = 1231;
    pub const JSONB_ARRAY: i32 = 3807;
}

/// Wire format codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatCode {
    Text,
    Binary,
}

impl FormatCode {
    pub fn from_i16(code: i16) -> Result<FormatCode, PgError> {
        match code {
            0 => Ok(FormatCode::Text),
            1 => Ok(FormatCode::Binary),
            _ => Err(PgError::new(
                SqlState::ProtocolViolation,
                format!("unknown format code {code}"),
            )),
        }
    }
}

/// A decoded backend value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary-precision decimal carried as its canonical text form.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Date(chrono::NaiveDate),
    Timestamptz(chrono::DateTime<chrono::Utc>),
    Jsonb(String),
    /// Element OID plus the elements.
    Array(i32, Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The OID this value is described with in a RowDescription.
    pub fn type_oid(&self) -> i32 {
        match self {
            Value::Null => oid::TEXT,
            Value::Bool(_) => oid::BOOL,
            Value::Int2(_) => oid::INT2,
            Value::Int4(_) => oid::INT4,
            Value::Int8(_) => oid::INT8,
            Value::Float4(_) => oid::FLOAT4,
            Value::Float8(_) => oid::FLOAT8,
            Value::Numeric(_) => oid::NUMERIC,
            Value::Text(_) => oid::TEXT,
            Value::Bytea(_) => oid::BYTEA,
            Value::Date(_) => oid::DATE,
            Value::Timestamptz(_) => oid::TIMESTAMPTZ,
            Value::Jsonb(_) => oid::JSONB,
            Value::Array(elem, _) => array_oid_for(*elem),
        }
    }
}

/// Wire size of a type in a RowDescription, -1 for variable width.
pub fn type_size(type_oid: i32) -> i16 {
    match type_oid {
        oid::BOOL => 1,
        oid::INT2 => 2,
        oid::INT4 | oid::FLOAT4 | oid::DATE => 4,
        oid::INT8 | oid::FLOAT8 | oid::TIMESTAMPTZ => 8,
        _ => -1,
    }
}

/// The array OID for an element OID.
pub fn array_oid_for(elem_oid: i32) -> i32 {
    match elem_oid {
        oid::BOOL => oid::BOOL_ARRAY,
        oid::BYTEA => oid::BYTEA_ARRAY,
        oid::INT2 => oid::INT2_ARRAY,
        oid::INT4 => oid::INT4_ARRAY,
        oid::INT8 => oid::INT8_ARRAY,
        oid::FLOAT4 => oid::FLOAT4_ARRAY,
        oid::FLOAT8 => oid::FLOAT8_ARRAY,
        oid::VARCHAR => oid::VARCHAR_ARRAY,
        oid::DATE => oid::DATE_ARRAY,
        oid::TIMESTAMPTZ => oid::TIMESTAMPTZ_ARRAY,
        oid::NUMERIC => oid::NUMERIC_ARRAY,
        oid::JSONB => oid::JSONB_ARRAY,
        _ => oid::TEXT_ARRAY,
    }
}

/// The element OID for an array OID, if the OID names an array type.
pub fn element_oid_for(array_oid: i32) -> Option<i32> {
    match array_oid {
        oid::BOOL_ARRAY => Some(oid::BOOL),
        oid::BYTEA_ARRAY => Some(oid::BYTEA),
        oid::INT2_ARRAY => Some(oid::INT2),
        oid::INT4_ARRAY => Some(oid::INT4),
        oid::INT8_ARRAY => Some(oid::INT8),
        oid::FLOAT4_ARRAY => Some(oid::FLOAT4),
        oid::FLOAT8_ARRAY => Some(oid::FLOAT8),
        oid::TEXT_ARRAY => Some(oid::TEXT),
        oid::VARCHAR_ARRAY => Some(oid::VARCHAR),
        oid::DATE_ARRAY => Some(oid::DATE),
        oid::TIMESTAMPTZ_ARRAY => Some(oid::TIMESTAMPTZ),
        oid::NUMERIC_ARRAY => Some(oid::NUMERIC),
        oid::JSONB_ARRAY => Some(oid::JSONB),
        _ => None,
    }
}

fn invalid(type_name: &str, input: impl std::fmt::Display) -> PgError {
    PgError::new(
        SqlState::InvalidTextRepresentation,
        format!("invalid input syntax for type {type_name}: \"{input}\""),
    )
}

fn protocol_violation(type_name: &str) -> PgError {
    PgError::new(
        SqlState::ProtocolViolation,
        format!("invalid binary representation for type {type_name}"),
    )
}

/// Decode one parameter or COPY column value. A missing value (wire length
/// -1) must be mapped to `Value::Null` by the caller before reaching here.
pub fn decode(bytes: &[u8], format: FormatCode, type_oid: i32, timezone: Tz) -> Result<Value, PgError> {
    if let Some(elem) = element_oid_for(type_oid) {
        return array::decode(bytes, format, elem, timezone);
    }

    match type_oid {
        oid::BOOL => decode_bool(bytes, format),
        oid::INT2 => decode_int2(bytes, format),
        oid::INT4 => decode_int4(bytes, format),
        oid::INT8 => decode_int8(bytes, format),
        oid::FLOAT4 => decode_float4(bytes, format),
        oid::FLOAT8 => decode_float8(bytes, format),
        oid::NUMERIC => numeric::decode(bytes, format),
        oid::BYTEA => bytea::decode(bytes, format),
        oid::DATE => date::decode(bytes, format),
        oid::TIMESTAMPTZ => timestamp::decode(bytes, format, timezone),
        oid::JSONB => decode_jsonb(bytes, format),
        // Untyped (OID 0), text and varchar parameters arrive as UTF-8.
        _ => decode_text(bytes, format),
    }
}

/// Encode a value for a DataRow column in the requested format. `None` means
/// SQL null (wire length -1).
pub fn encode(value: &Value, format: FormatCode, timezone: Tz) -> Result<Option<BytesMut>, PgError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(if *v { "t" } else { "f" }),
            FormatCode::Binary => {
                let mut buf = BytesMut::with_capacity(1);
                buf.put_u8(*v as u8);
                buf
            }
        })),
        Value::Int2(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(&v.to_string()),
            FormatCode::Binary => {
                let mut buf = BytesMut::with_capacity(2);
                buf.put_i16(*v);
                buf
            }
        })),
        Value::Int4(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(&v.to_string()),
            FormatCode::Binary => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_i32(*v);
                buf
            }
        })),
        Value::Int8(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(&v.to_string()),
            FormatCode::Binary => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_i64(*v);
                buf
            }
        })),
        Value::Float4(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(&format_float(*v as f64)),
            FormatCode::Binary => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_f32(*v);
                buf
            }
        })),
        Value::Float8(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(&format_float(*v)),
            FormatCode::Binary => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_f64(*v);
                buf
            }
        })),
        Value::Numeric(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(v),
            FormatCode::Binary => numeric::binary_encode(v)?,
        })),
        Value::Text(v) => Ok(Some(text_payload(v))),
        Value::Bytea(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(&bytea::to_hex(v)),
            FormatCode::Binary => {
                let mut buf = BytesMut::with_capacity(v.len());
                buf.put_slice(v);
                buf
            }
        })),
        Value::Date(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(&date::format(v)),
            FormatCode::Binary => date::binary_encode(v)?,
        })),
        Value::Timestamptz(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(&timestamp::format(v, timezone)),
            FormatCode::Binary => timestamp::binary_encode(v)?,
        })),
        Value::Jsonb(v) => Ok(Some(match format {
            FormatCode::Text => text_payload(v),
            FormatCode::Binary => {
                // jsonb binary form is a version byte followed by the text.
                let mut buf = BytesMut::with_capacity(v.len() + 1);
                buf.put_u8(1);
                buf.put_slice(v.as_bytes());
                buf
            }
        })),
        Value::Array(elem, values) => array::encode(*elem, values, format, timezone),
    }
}

fn text_payload(s: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(s.len());
    buf.put_slice(s.as_bytes());
    buf
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        format!("{v}")
    }
}

fn text_str<'a>(bytes: &'a [u8], type_name: &str) -> Result<&'a str, PgError> {
    std::str::from_utf8(bytes).map_err(|_| protocol_violation(type_name))
}

fn decode_bool(bytes: &[u8], format: FormatCode) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = text_str(bytes, "boolean")?.trim();
            match text.to_ascii_lowercase().as_str() {
                "t" | "true" | "y" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
                "f" | "false" | "n" | "no" | "off" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid("boolean", text)),
            }
        }
        FormatCode::Binary => {
            if bytes.len() != 1 {
                return Err(protocol_violation("boolean"));
            }
            Ok(Value::Bool(bytes[0] != 0))
        }
    }
}

fn decode_int2(bytes: &[u8], format: FormatCode) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = text_str(bytes, "smallint")?.trim();
            i16::from_str(text)
                .map(Value::Int2)
                .map_err(|_| invalid("smallint", text))
        }
        FormatCode::Binary => {
            let raw: [u8; 2] = bytes
                .try_into()
                .map_err(|_| protocol_violation("smallint"))?;
            Ok(Value::Int2(i16::from_be_bytes(raw)))
        }
    }
}

fn decode_int4(bytes: &[u8], format: FormatCode) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = text_str(bytes, "integer")?.trim();
            i32::from_str(text)
                .map(Value::Int4)
                .map_err(|_| invalid("integer", text))
        }
        FormatCode::Binary => {
            let raw: [u8; 4] = bytes
                .try_into()
                .map_err(|_| protocol_violation("integer"))?;
            Ok(Value::Int4(i32::from_be_bytes(raw)))
        }
    }
}

fn decode_int8(bytes: &[u8], format: FormatCode) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = text_str(bytes, "bigint")?.trim();
            i64::from_str(text)
                .map(Value::Int8)
                .map_err(|_| invalid("bigint", text))
        }
        FormatCode::Binary => {
            let raw: [u8; 8] = bytes
                .try_into()
                .map_err(|_| protocol_violation("bigint"))?;
            Ok(Value::Int8(i64::from_be_bytes(raw)))
        }
    }
}

fn decode_float4(bytes: &[u8], format: FormatCode) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = text_str(bytes, "real")?.trim();
            parse_float(text)
                .map(|v| Value::Float4(v as f32))
                .ok_or_else(|| invalid("real", text))
        }
        FormatCode::Binary => {
            let raw: [u8; 4] = bytes.try_into().map_err(|_| protocol_violation("real"))?;
            Ok(Value::Float4(f32::from_be_bytes(raw)))
        }
    }
}

fn decode_float8(bytes: &[u8], format: FormatCode) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = text_str(bytes, "double precision")?.trim();
            parse_float(text)
                .map(Value::Float8)
                .ok_or_else(|| invalid("double precision", text))
        }
        FormatCode::Binary => {
            let raw: [u8; 8] = bytes
                .try_into()
                .map_err(|_| protocol_violation("double precision"))?;
            Ok(Value::Float8(f64::from_be_bytes(raw)))
        }
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text.to_ascii_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        "infinity" | "inf" => Some(f64::INFINITY),
        "-infinity" | "-inf" => Some(f64::NEG_INFINITY),
        _ => f64::from_str(text).ok(),
    }
}

fn decode_text(bytes: &[u8], _format: FormatCode) -> Result<Value, PgError> {
    // Text and varchar are UTF-8 in both wire formats.
    let text = text_str(bytes, "text")?;
    Ok(Value::Text(text.to_string()))
}

fn decode_jsonb(bytes: &[u8], format: FormatCode) -> Result<Value, PgError> {
    let raw = match format {
        FormatCode::Text => bytes,
        FormatCode::Binary => {
            // Version byte must be 1.
            if bytes.first() != Some(&1) {
                return Err(protocol_violation("jsonb"));
            }
            &bytes[1..]
        }
    };
    let text = text_str(raw, "jsonb")?;
    if serde_json::from_str::<serde_json::Value>(text).is_err() {
        return Err(invalid("jsonb", text));
    }
    Ok(Value::Jsonb(text.to_string()))
}
