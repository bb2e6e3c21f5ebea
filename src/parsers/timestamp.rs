// timestamptz codec. The binary form is microseconds since the PostgreSQL
// epoch (2000-01-01T00:00:00Z) as a big-endian int64. The text form accepts
// `YYYY-MM-DD[ T]HH:MM[:SS[.ffffff]][+HH[:MM]]`, optionally wrapped in
// parentheses and single or double quotes, with surrounding whitespace
// tolerated. Values without an offset are interpreted in the session time
// zone.

// External crate imports
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

// Internal crate imports
use crate::constants::PG_EPOCH_UNIX_SECONDS;
use crate::errors::{PgError, SqlState};
use crate::parsers::{FormatCode, Value};

const PG_EPOCH_MICROS: i64 = PG_EPOCH_UNIX_SECONDS * 1_000_000;

fn invalid(input: &str) -> PgError {
    PgError::new(
        SqlState::InvalidDatetimeFormat,
        format!("invalid input syntax for type timestamp with time zone: \"{input}\""),
    )
}

pub fn decode(bytes: &[u8], format: FormatCode, timezone: Tz) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = std::str::from_utf8(bytes).map_err(|_| {
                PgError::new(
                    SqlState::ProtocolViolation,
                    "invalid binary representation for type timestamp with time zone",
                )
            })?;
            parse_text(text, timezone).map(Value::Timestamptz)
        }
        FormatCode::Binary => {
            let raw: [u8; 8] = bytes.try_into().map_err(|_| {
                PgError::new(
                    SqlState::ProtocolViolation,
                    "invalid binary representation for type timestamp with time zone",
                )
            })?;
            let micros = i64::from_be_bytes(raw);
            from_micros(micros.saturating_add(PG_EPOCH_MICROS)).map(Value::Timestamptz)
        }
    }
}

pub fn binary_encode(value: &DateTime<Utc>) -> Result<BytesMut, PgError> {
    let micros = value.timestamp() * 1_000_000 + value.timestamp_subsec_micros() as i64;
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64(micros - PG_EPOCH_MICROS);
    Ok(buf)
}

/// Render the value in the session time zone, PostgreSQL style:
/// `2022-07-08 07:22:59.123456+00`.
pub fn format(value: &DateTime<Utc>, timezone: Tz) -> String {
    let local = value.with_timezone(&timezone);
    let offset = local.offset().fix().local_minus_utc();
    let (sign, offset) = if offset < 0 { ('-', -offset) } else { ('+', offset) };
    let hours = offset / 3600;
    let minutes = (offset % 3600) / 60;

    let mut out = if value.timestamp_subsec_micros() == 0 {
        local.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        let formatted = local.format("%Y-%m-%d %H:%M:%S%.6f").to_string();
        formatted.trim_end_matches('0').to_string()
    };
    out.push(sign);
    out.push_str(&format!("{hours:02}"));
    if minutes != 0 {
        out.push_str(&format!(":{minutes:02}"));
    }
    out
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, PgError> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1000) as u32;
    match Utc.timestamp_opt(secs, nanos) {
        chrono::offset::LocalResult::Single(ts) => Ok(ts),
        _ => Err(PgError::new(
            SqlState::InvalidDatetimeFormat,
            "timestamp out of range",
        )),
    }
}

/// Strip one level of wrapping from a record-style literal: whitespace,
/// optional parentheses, optional single or double quotes, in that order.
fn unwrap_literal(input: &str) -> Result<&str, PgError> {
    let mut text = input.trim();

    if text.starts_with('(') || text.ends_with(')') {
        if !(text.starts_with('(') && text.ends_with(')')) || text.len() < 2 {
            return Err(invalid(input));
        }
        text = text[1..text.len() - 1].trim();
    }

    for quote in ['\'', '"'] {
        if text.starts_with(quote) || text.ends_with(quote) {
            if !(text.starts_with(quote) && text.ends_with(quote)) || text.len() < 2 {
                return Err(invalid(input));
            }
            text = text[1..text.len() - 1].trim();
            break;
        }
    }

    if text.is_empty() {
        return Err(invalid(input));
    }
    Ok(text)
}

pub fn parse_text(input: &str, timezone: Tz) -> Result<DateTime<Utc>, PgError> {
    let text = unwrap_literal(input)?;

    // Split off an explicit offset suffix, if any. A '-' or '+' after the
    // date part (position > 10) is an offset, not a date separator.
    let (datetime_part, offset) = split_offset(text);
    let datetime_part = datetime_part.trim();

    let naive = parse_naive(datetime_part).ok_or_else(|| invalid(input))?;

    match offset {
        Some(offset_text) => {
            let offset = parse_offset(offset_text).ok_or_else(|| invalid(input))?;
            let local: DateTime<FixedOffset> = offset
                .from_local_datetime(&naive)
                .single()
                .ok_or_else(|| invalid(input))?;
            Ok(local.with_timezone(&Utc))
        }
        None => match timezone.from_local_datetime(&naive) {
            chrono::offset::LocalResult::Single(ts) => Ok(ts.with_timezone(&Utc)),
            // Fall forward over DST gaps the way PostgreSQL does.
            chrono::offset::LocalResult::Ambiguous(first, _) => Ok(first.with_timezone(&Utc)),
            chrono::offset::LocalResult::None => Err(invalid(input)),
        },
    }
}

fn split_offset(text: &str) -> (&str, Option<&str>) {
    // The shortest date is 10 characters; look for a +/- beyond it.
    if text.len() > 10 {
        for (index, c) in text.char_indices().skip(11) {
            if c == '+' || c == '-' {
                return (&text[..index], Some(&text[index..]));
            }
        }
    }
    (text, None)
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    if text.len() == 10 {
        return NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0));
    }

    // 'T' and ' ' are both accepted as the date/time separator.
    let normalized = if text.as_bytes().get(10) == Some(&b'T') {
        let mut s = text.to_string();
        s.replace_range(10..11, " ");
        s
    } else {
        text.to_string()
    };

    for pattern in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(&normalized, pattern) {
            return Some(ts);
        }
    }
    None
}

fn parse_offset(text: &str) -> Option<FixedOffset> {
    let (sign, rest) = match text.as_bytes().first() {
        Some(b'+') => (1, &text[1..]),
        Some(b'-') => (-1, &text[1..]),
        _ => return None,
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if !(0..=15).contains(&hours) || !(0..=59).contains(&minutes) {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_text_parse_with_offset() {
        assert_eq!(
            parse_text("2022-12-28 10:00+02:00", Tz::CET).unwrap(),
            utc("2022-12-28T08:00:00Z")
        );
        assert_eq!(
            parse_text("2022-12-28 10:00+02:30", Tz::CET).unwrap(),
            utc("2022-12-28T07:30:00Z")
        );
    }

    #[test]
    fn test_text_parse_session_zone() {
        assert_eq!(
            parse_text("2022-12-28 10:00", Tz::CET).unwrap(),
            utc("2022-12-28T09:00:00Z")
        );
        // Summer time.
        assert_eq!(
            parse_text("2022-08-28 10:00", Tz::Europe__Amsterdam).unwrap(),
            utc("2022-08-28T08:00:00Z")
        );
    }

    #[test]
    fn test_text_parse_date_only() {
        assert_eq!(
            parse_text("2022-12-28", Tz::UTC).unwrap(),
            utc("2022-12-28T00:00:00Z")
        );
    }

    #[test]
    fn test_text_parse_wrapped_literals() {
        let expected = utc("2011-11-04T00:05:23.123456Z");
        for input in [
            "'2011-11-04 00:05:23.123456+00:00'",
            "(\"2011-11-04 00:05:23.123456+00:00\")",
            "('2011-11-04 00:05:23.123456+00:00')",
            " (\"2011-11-04 00:05:23.123456+00:00\")",
            "(\"2011-11-04 00:05:23.123456+00:00\") ",
            "( \"2011-11-04 00:05:23.123456+00:00\" )",
            "(\" 2011-11-04 00:05:23.123456+00:00\")",
            "\n(  \"2011-11-04 00:05:23.123456+00:00  \" )",
            "\t\n( \"  2011-11-04 00:05:23.123456+00:00  \n\t\" )",
        ] {
            assert_eq!(parse_text(input, Tz::UTC).unwrap(), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_text_parse_rejects_malformed() {
        for input in [
            "",
            "(",
            ")",
            "()",
            "''",
            "'2000'",
            "foo",
            "'2011-11-04 00:05:23.123456+00:00')",
            "('2011-11-04 00:05:23.123456+00:00'",
        ] {
            assert!(parse_text(input, Tz::UTC).is_err(), "input {input:?}");
        }
    }

    #[test]
    fn test_binary_round_trip() {
        let ts = utc("2022-07-08T07:22:59.123456Z");
        let encoded = binary_encode(&ts).unwrap();
        assert_eq!(encoded.len(), 8);
        match decode(&encoded, FormatCode::Binary, Tz::UTC).unwrap() {
            Value::Timestamptz(decoded) => assert_eq!(decoded, ts),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_binary_is_micros_from_pg_epoch() {
        let encoded = binary_encode(&utc("2000-01-01T00:00:00Z")).unwrap();
        assert_eq!(i64::from_be_bytes(encoded[..].try_into().unwrap()), 0);

        let encoded = binary_encode(&utc("2000-01-01T00:00:01Z")).unwrap();
        assert_eq!(
            i64::from_be_bytes(encoded[..].try_into().unwrap()),
            1_000_000
        );
    }

    #[test]
    fn test_format_in_session_zone() {
        let ts = utc("2022-07-08T07:22:59.123456Z");
        assert_eq!(format(&ts, Tz::UTC), "2022-07-08 07:22:59.123456+00");
        assert_eq!(
            format(&ts, Tz::Europe__Amsterdam),
            "2022-07-08 09:22:59.123456+02"
        );
        let whole = utc("2022-07-08T07:22:59Z");
        assert_eq!(format(&whole, Tz::UTC), "2022-07-08 07:22:59+00");
    }

    #[test]
    fn test_text_round_trip() {
        let ts = utc("2011-11-04T00:05:23.123456Z");
        let rendered = format(&ts, Tz::UTC);
        assert_eq!(parse_text(&rendered, Tz::UTC).unwrap(), ts);
    }
}
