// date codec. Binary form is days since 2000-01-01 as a big-endian int32;
// text form is `YYYY-MM-DD`, with the same literal wrapping rules as
// timestamps.

// External crate imports
use bytes::{BufMut, BytesMut};
use chrono::NaiveDate;

// Internal crate imports
use crate::errors::{PgError, SqlState};
use crate::parsers::{FormatCode, Value};

fn pg_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
}

fn invalid(input: &str) -> PgError {
    PgError::new(
        SqlState::InvalidDatetimeFormat,
        format!("invalid input syntax for type date: \"{input}\""),
    )
}

pub fn decode(bytes: &[u8], format: FormatCode) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = std::str::from_utf8(bytes).map_err(|_| {
                PgError::new(
                    SqlState::ProtocolViolation,
                    "invalid binary representation for type date",
                )
            })?;
            parse_text(text).map(Value::Date)
        }
        FormatCode::Binary => {
            let raw: [u8; 4] = bytes.try_into().map_err(|_| {
                PgError::new(
                    SqlState::ProtocolViolation,
                    "invalid binary representation for type date",
                )
            })?;
            let days = i32::from_be_bytes(raw);
            pg_epoch()
                .checked_add_signed(chrono::Duration::days(days as i64))
                .map(Value::Date)
                .ok_or_else(|| {
                    PgError::new(SqlState::InvalidDatetimeFormat, "date out of range")
                })
        }
    }
}

pub fn parse_text(input: &str) -> Result<NaiveDate, PgError> {
    let mut text = input.trim();
    if text.starts_with('\'') && text.ends_with('\'') && text.len() >= 2 {
        text = text[1..text.len() - 1].trim();
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| invalid(input))
}

pub fn binary_encode(value: &NaiveDate) -> Result<BytesMut, PgError> {
    let days = value.signed_duration_since(pg_epoch()).num_days();
    let days = i32::try_from(days)
        .map_err(|_| PgError::new(SqlState::InvalidDatetimeFormat, "date out of range"))?;
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32(days);
    Ok(buf)
}

pub fn format(value: &NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}
