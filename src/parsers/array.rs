// Array codec. Text form is the PostgreSQL `{elem,elem,…}` syntax with
// double-quote quoting and backslash escapes; binary form is the standard
// array header (ndim, hasnull, element OID, dimension, lower bound) followed
// by length-prefixed elements. The backend only supports one-dimensional
// arrays.

// External crate imports
use bytes::{Buf, BufMut, BytesMut};
use chrono_tz::Tz;

// Internal crate imports
use crate::errors::{PgError, SqlState};
use crate::parsers::{self, FormatCode, Value};

fn invalid(input: &str) -> PgError {
    PgError::new(
        SqlState::InvalidTextRepresentation,
        format!("malformed array literal: \"{input}\""),
    )
}

fn violation() -> PgError {
    PgError::new(
        SqlState::ProtocolViolation,
        "invalid binary representation for array",
    )
}

pub fn decode(
    bytes: &[u8],
    format: FormatCode,
    elem_oid: i32,
    timezone: Tz,
) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = std::str::from_utf8(bytes).map_err(|_| violation())?;
            decode_text(text, elem_oid, timezone)
        }
        FormatCode::Binary => decode_binary(bytes, elem_oid, timezone),
    }
}

fn decode_text(input: &str, elem_oid: i32, timezone: Tz) -> Result<Value, PgError> {
    let text = input.trim();
    if !text.starts_with('{') || !text.ends_with('}') {
        return Err(invalid(input));
    }
    let inner = &text[1..text.len() - 1];

    let mut values = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = inner.chars().peekable();

    if inner.trim().is_empty() {
        return Ok(Value::Array(elem_oid, values));
    }

    loop {
        match chars.next() {
            Some('"') if !quoted => {
                quoted = true;
                was_quoted = true;
            }
            Some('"') if quoted => quoted = false,
            Some('\\') if quoted => match chars.next() {
                Some(c) => current.push(c),
                None => return Err(invalid(input)),
            },
            Some('{') if !quoted => {
                return Err(PgError::new(
                    SqlState::FeatureNotSupported,
                    "multidimensional arrays are not supported",
                ))
            }
            Some(',') if !quoted => {
                values.push(finish_element(&current, was_quoted, elem_oid, timezone)?);
                current.clear();
                was_quoted = false;
            }
            Some(c) => current.push(c),
            None => {
                if quoted {
                    return Err(invalid(input));
                }
                values.push(finish_element(&current, was_quoted, elem_oid, timezone)?);
                break;
            }
        }
    }

    Ok(Value::Array(elem_oid, values))
}

fn finish_element(
    raw: &str,
    was_quoted: bool,
    elem_oid: i32,
    timezone: Tz,
) -> Result<Value, PgError> {
    let trimmed = if was_quoted { raw } else { raw.trim() };
    if !was_quoted && trimmed.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    parsers::decode(trimmed.as_bytes(), FormatCode::Text, elem_oid, timezone)
}

fn decode_binary(bytes: &[u8], declared_elem: i32, timezone: Tz) -> Result<Value, PgError> {
    let mut buf = bytes;
    if buf.remaining() < 12 {
        return Err(violation());
    }
    let ndim = buf.get_i32();
    let _hasnull = buf.get_i32();
    let elem_oid = buf.get_i32();

    if elem_oid != declared_elem {
        return Err(violation());
    }
    if ndim == 0 {
        return Ok(Value::Array(elem_oid, Vec::new()));
    }
    if ndim != 1 {
        return Err(PgError::new(
            SqlState::FeatureNotSupported,
            "multidimensional arrays are not supported",
        ));
    }

    if buf.remaining() < 8 {
        return Err(violation());
    }
    let count = buf.get_i32();
    let _lower_bound = buf.get_i32();
    if count < 0 {
        return Err(violation());
    }

    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(violation());
        }
        let len = buf.get_i32();
        if len == -1 {
            values.push(Value::Null);
            continue;
        }
        if len < 0 || buf.remaining() < len as usize {
            return Err(violation());
        }
        let (payload, rest) = buf.split_at(len as usize);
        values.push(parsers::decode(
            payload,
            FormatCode::Binary,
            elem_oid,
            timezone,
        )?);
        buf = rest;
    }
    if buf.has_remaining() {
        return Err(violation());
    }

    Ok(Value::Array(elem_oid, values))
}

pub fn encode(
    elem_oid: i32,
    values: &[Value],
    format: FormatCode,
    timezone: Tz,
) -> Result<Option<BytesMut>, PgError> {
    match format {
        FormatCode::Text => {
            let mut out = String::from("{");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                match parsers::encode(value, FormatCode::Text, timezone)? {
                    None => out.push_str("NULL"),
                    Some(payload) => {
                        let text = String::from_utf8_lossy(&payload);
                        push_element(&mut out, &text);
                    }
                }
            }
            out.push('}');
            let mut buf = BytesMut::with_capacity(out.len());
            buf.put_slice(out.as_bytes());
            Ok(Some(buf))
        }
        FormatCode::Binary => {
            let mut buf = BytesMut::new();
            buf.put_i32(1);
            buf.put_i32(values.iter().any(Value::is_null) as i32);
            buf.put_i32(elem_oid);
            buf.put_i32(values.len() as i32);
            // Lower bound is always 1.
            buf.put_i32(1);
            for value in values {
                match parsers::encode(value, FormatCode::Binary, timezone)? {
                    None => buf.put_i32(-1),
                    Some(payload) => {
                        buf.put_i32(payload.len() as i32);
                        buf.put_slice(&payload);
                    }
                }
            }
            Ok(Some(buf))
        }
    }
}

fn needs_quoting(text: &str) -> bool {
    text.is_empty()
        || text.eq_ignore_ascii_case("null")
        || text.bytes().any(|b| {
            matches!(
                b,
                b'{' | b'}' | b',' | b'"' | b'\\' | b' ' | b'\t' | b'\n' | b'\r'
            )
        })
}

fn push_element(out: &mut String, text: &str) {
    if !needs_quoting(text) {
        out.push_str(text);
        return;
    }
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::oid;

    #[test]
    fn test_text_decode_ints() {
        match decode(b"{1,2,NULL,3}", FormatCode::Text, oid::INT8, Tz::UTC).unwrap() {
            Value::Array(elem, values) => {
                assert_eq!(elem, oid::INT8);
                assert_eq!(
                    values,
                    vec![
                        Value::Int8(1),
                        Value::Int8(2),
                        Value::Null,
                        Value::Int8(3)
                    ]
                );
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_text_decode_quoted_strings() {
        match decode(
            br#"{"a,b","with \"quote\"",NULL,"NULL",plain}"#,
            FormatCode::Text,
            oid::TEXT,
            Tz::UTC,
        )
        .unwrap()
        {
            Value::Array(_, values) => {
                assert_eq!(
                    values,
                    vec![
                        Value::Text("a,b".to_string()),
                        Value::Text("with \"quote\"".to_string()),
                        Value::Null,
                        // A quoted NULL is the string, not the null sentinel.
                        Value::Text("NULL".to_string()),
                        Value::Text("plain".to_string()),
                    ]
                );
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_text_decode_empty_and_malformed() {
        assert_eq!(
            decode(b"{}", FormatCode::Text, oid::INT4, Tz::UTC).unwrap(),
            Value::Array(oid::INT4, vec![])
        );
        assert!(decode(b"1,2,3", FormatCode::Text, oid::INT4, Tz::UTC).is_err());
        assert!(decode(b"{\"unterminated}", FormatCode::Text, oid::TEXT, Tz::UTC).is_err());
        let err = decode(b"{{1},{2}}", FormatCode::Text, oid::INT4, Tz::UTC).unwrap_err();
        assert_eq!(err.code, SqlState::FeatureNotSupported);
    }

    #[test]
    fn test_text_encode_quotes_when_needed() {
        let values = vec![
            Value::Text("plain".to_string()),
            Value::Text("a,b".to_string()),
            Value::Null,
            Value::Text("NULL".to_string()),
        ];
        let encoded = encode(oid::TEXT, &values, FormatCode::Text, Tz::UTC)
            .unwrap()
            .unwrap();
        assert_eq!(&encoded[..], br#"{plain,"a,b",NULL,"NULL"}"#);
    }

    #[test]
    fn test_binary_round_trip() {
        let values = vec![Value::Int4(7), Value::Null, Value::Int4(-1)];
        let encoded = encode(oid::INT4, &values, FormatCode::Binary, Tz::UTC)
            .unwrap()
            .unwrap();
        match decode(&encoded, FormatCode::Binary, oid::INT4, Tz::UTC).unwrap() {
            Value::Array(elem, decoded) => {
                assert_eq!(elem, oid::INT4);
                assert_eq!(decoded, values);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_binary_header_layout() {
        let encoded = encode(oid::INT4, &[Value::Int4(5)], FormatCode::Binary, Tz::UTC)
            .unwrap()
            .unwrap();
        // ndim, hasnull, elem oid, count, lower bound.
        assert_eq!(i32::from_be_bytes(encoded[0..4].try_into().unwrap()), 1);
        assert_eq!(i32::from_be_bytes(encoded[4..8].try_into().unwrap()), 0);
        assert_eq!(
            i32::from_be_bytes(encoded[8..12].try_into().unwrap()),
            oid::INT4
        );
        assert_eq!(i32::from_be_bytes(encoded[12..16].try_into().unwrap()), 1);
        assert_eq!(i32::from_be_bytes(encoded[16..20].try_into().unwrap()), 1);
    }

    #[test]
    fn test_binary_elem_oid_mismatch() {
        let encoded = encode(oid::INT4, &[Value::Int4(5)], FormatCode::Binary, Tz::UTC)
            .unwrap()
            .unwrap();
        let err = decode(&encoded, FormatCode::Binary, oid::INT8, Tz::UTC).unwrap_err();
        assert_eq!(err.code, SqlState::ProtocolViolation);
    }
}
