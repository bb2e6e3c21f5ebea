// numeric codec. The value is carried as its canonical decimal text; the
// binary wire form is the PostgreSQL base-10000 digit representation
// (ndigits, weight, sign, dscale, digits). No arithmetic is ever performed
// on the value, so text is the lossless working representation.

// External crate imports
use bytes::{BufMut, BytesMut};

// Internal crate imports
use crate::errors::{PgError, SqlState};
use crate::parsers::{FormatCode, Value};

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

fn invalid(input: &str) -> PgError {
    PgError::new(
        SqlState::InvalidTextRepresentation,
        format!("invalid input syntax for type numeric: \"{input}\""),
    )
}

fn violation() -> PgError {
    PgError::new(
        SqlState::ProtocolViolation,
        "invalid binary representation for type numeric",
    )
}

pub fn decode(bytes: &[u8], format: FormatCode) -> Result<Value, PgError> {
    match format {
        FormatCode::Text => {
            let text = std::str::from_utf8(bytes).map_err(|_| violation())?;
            let normalized = normalize(text)?;
            Ok(Value::Numeric(normalized))
        }
        FormatCode::Binary => binary_decode(bytes).map(Value::Numeric),
    }
}

/// Validate a numeric literal and normalize it: exponent applied, sign
/// preserved, no leading `+`. `NaN` is accepted; infinities are not
/// representable by the backend.
pub fn normalize(input: &str) -> Result<String, PgError> {
    let text = input.trim();
    if text.eq_ignore_ascii_case("nan") {
        return Ok("NaN".to_string());
    }
    if text.to_ascii_lowercase().contains("inf") {
        return Err(PgError::new(
            SqlState::NumericValueOutOfRange,
            "infinity is not supported for type numeric",
        ));
    }

    let (negative, integer, fraction, exponent) = split_literal(text).ok_or_else(|| invalid(input))?;

    // Apply the exponent by moving the decimal point.
    let mut digits: Vec<u8> = Vec::with_capacity(integer.len() + fraction.len());
    digits.extend(integer.bytes().map(|b| b - b'0'));
    digits.extend(fraction.bytes().map(|b| b - b'0'));
    let mut point = integer.len() as i64 + exponent;

    // Strip leading zeros ahead of the point.
    while digits.len() > 1 && point > 1 && digits[0] == 0 {
        digits.remove(0);
        point -= 1;
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if point <= 0 {
        out.push_str("0.");
        for _ in 0..(-point) {
            out.push('0');
        }
        for d in &digits {
            out.push((b'0' + d) as char);
        }
    } else if (point as usize) >= digits.len() {
        for d in &digits {
            out.push((b'0' + d) as char);
        }
        for _ in 0..(point as usize - digits.len()) {
            out.push('0');
        }
    } else {
        for (i, d) in digits.iter().enumerate() {
            if i == point as usize {
                out.push('.');
            }
            out.push((b'0' + d) as char);
        }
    }

    // "-0" and "-0.00" keep their scale but drop nothing else.
    Ok(out)
}

fn split_literal(text: &str) -> Option<(bool, &str, &str, i64)> {
    let (negative, rest) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };

    let (mantissa, exponent) = match rest.find(['e', 'E']) {
        Some(index) => {
            let exp = rest[index + 1..].parse::<i64>().ok()?;
            (&rest[..index], exp)
        }
        None => (rest, 0),
    };

    let (integer, fraction) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };

    if integer.is_empty() && fraction.is_empty() {
        return None;
    }
    if !integer.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    Some((
        negative,
        if integer.is_empty() { "0" } else { integer },
        fraction,
        exponent,
    ))
}

/// Encode a normalized decimal string into the base-10000 wire form.
pub fn binary_encode(text: &str) -> Result<BytesMut, PgError> {
    let normalized = normalize(text)?;

    let mut buf = BytesMut::new();
    if normalized == "NaN" {
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_u16(NUMERIC_NAN);
        buf.put_i16(0);
        return Ok(buf);
    }

    let (negative, rest) = match normalized.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, normalized.as_str()),
    };
    let (integer, fraction) = match rest.split_once('.') {
        Some((i, f)) => (i, f),
        None => (rest, ""),
    };
    let dscale = fraction.len() as i16;

    // Left-pad the integer part and right-pad the fraction part so both
    // align with base-10000 digit boundaries.
    let mut padded = String::new();
    for _ in 0..((4 - integer.len() % 4) % 4) {
        padded.push('0');
    }
    padded.push_str(integer);
    let integer_groups = padded.len() / 4;
    padded.push_str(fraction);
    while padded.len() % 4 != 0 {
        padded.push('0');
    }

    let mut digits: Vec<i16> = padded
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            chunk
                .iter()
                .fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16)
        })
        .collect();

    let mut weight = integer_groups as i16 - 1;

    // Strip zero groups off both ends; weight tracks the leading strip.
    while digits.len() > 1 && digits.first() == Some(&0) {
        digits.remove(0);
        weight -= 1;
    }
    while digits.len() > 1 && digits.last() == Some(&0) {
        digits.pop();
    }
    if digits == [0] {
        digits.clear();
        weight = 0;
    }

    buf.put_i16(digits.len() as i16);
    buf.put_i16(weight);
    buf.put_u16(if negative { NUMERIC_NEG } else { NUMERIC_POS });
    buf.put_i16(dscale);
    for digit in digits {
        buf.put_i16(digit);
    }
    Ok(buf)
}

/// Decode the base-10000 wire form back into decimal text.
pub fn binary_decode(bytes: &[u8]) -> Result<String, PgError> {
    if bytes.len() < 8 {
        return Err(violation());
    }
    let ndigits = i16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let weight = i16::from_be_bytes([bytes[2], bytes[3]]) as i64;
    let sign = u16::from_be_bytes([bytes[4], bytes[5]]);
    let dscale = i16::from_be_bytes([bytes[6], bytes[7]]) as usize;

    if bytes.len() != 8 + ndigits * 2 {
        return Err(violation());
    }
    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }
    if sign != NUMERIC_POS && sign != NUMERIC_NEG {
        return Err(violation());
    }

    let mut digits = Vec::with_capacity(ndigits);
    for i in 0..ndigits {
        let digit = i16::from_be_bytes([bytes[8 + i * 2], bytes[9 + i * 2]]);
        if !(0..=9999).contains(&digit) {
            return Err(violation());
        }
        digits.push(digit);
    }

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    // Integer part: groups 0..=weight.
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            let digit = digits.get(i as usize).copied().unwrap_or(0);
            if i == 0 {
                out.push_str(&digit.to_string());
            } else {
                out.push_str(&format!("{digit:04}"));
            }
        }
    }

    if dscale > 0 {
        out.push('.');
        let mut fraction = String::new();
        let mut index = weight + 1;
        while fraction.len() < dscale {
            let digit = if index >= 0 {
                digits.get(index as usize).copied().unwrap_or(0)
            } else {
                0
            };
            fraction.push_str(&format!("{digit:04}"));
            index += 1;
        }
        fraction.truncate(dscale);
        out.push_str(&fraction);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(text: &str) -> String {
        binary_decode(&binary_encode(text).unwrap()).unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("42").unwrap(), "42");
        assert_eq!(normalize("+42").unwrap(), "42");
        assert_eq!(normalize("-42.50").unwrap(), "-42.50");
        assert_eq!(normalize("1.5e3").unwrap(), "1500");
        assert_eq!(normalize("1.5e-3").unwrap(), "0.0015");
        assert_eq!(normalize(".5").unwrap(), "0.5");
        assert_eq!(normalize("nan").unwrap(), "NaN");
        assert!(normalize("Infinity").is_err());
        assert!(normalize("1.2.3").is_err());
        assert!(normalize("abc").is_err());
        assert!(normalize("").is_err());
    }

    #[test]
    fn test_binary_round_trip() {
        for text in [
            "0",
            "1",
            "-1",
            "42",
            "9999",
            "10000",
            "123456789.000001",
            "-12.34",
            "0.0001",
            "0.00010",
            "98765432109876543210.12345678901234567890",
        ] {
            assert_eq!(round_trip(text), text, "input {text:?}");
        }
    }

    #[test]
    fn test_nan_round_trip() {
        let encoded = binary_encode("NaN").unwrap();
        assert_eq!(u16::from_be_bytes([encoded[4], encoded[5]]), NUMERIC_NAN);
        assert_eq!(binary_decode(&encoded).unwrap(), "NaN");
    }

    #[test]
    fn test_binary_layout() {
        // 12345.678 → digits [1, 2345, 6780], weight 1, dscale 3.
        let encoded = binary_encode("12345.678").unwrap();
        assert_eq!(i16::from_be_bytes([encoded[0], encoded[1]]), 3);
        assert_eq!(i16::from_be_bytes([encoded[2], encoded[3]]), 1);
        assert_eq!(u16::from_be_bytes([encoded[4], encoded[5]]), NUMERIC_POS);
        assert_eq!(i16::from_be_bytes([encoded[6], encoded[7]]), 3);
        assert_eq!(i16::from_be_bytes([encoded[8], encoded[9]]), 1);
        assert_eq!(i16::from_be_bytes([encoded[10], encoded[11]]), 2345);
        assert_eq!(i16::from_be_bytes([encoded[12], encoded[13]]), 6780);
    }

    #[test]
    fn test_binary_decode_rejects_malformed() {
        assert!(binary_decode(&[0, 0]).is_err());
        // Digit count claims more digits than present.
        assert!(binary_decode(&[0, 5, 0, 0, 0, 0, 0, 0]).is_err());
        // Bad sign word.
        assert!(binary_decode(&[0, 0, 0, 0, 0x20, 0, 0, 0]).is_err());
    }
}
