//! Line parsing for the plaintext wire format.
//!
//! Tokenizes one `"<name> <value> <timestamp>"` line. The byte scan
//! validates printable ASCII and splits fields in a single pass; the
//! metric name is returned as a borrow of the input so the common path
//! does not allocate.

use thiserror::Error;

/// Errors that can occur while tokenizing a wire line.
///
/// Every variant carries the offending line for diagnostics; the error
/// path is allowed to allocate.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("non-ascii or non-printable byte in line {line:?}")]
    NonAscii { line: String },

    #[error("expected exactly 3 space-separated fields in line {line:?}")]
    WrongFieldCount { line: String },

    #[error("empty metric name in line {line:?}")]
    EmptyName { line: String },

    #[error("cannot parse value in line {line:?}")]
    BadValue { line: String },

    #[error("cannot parse timestamp in line {line:?}")]
    BadTimestamp { line: String },
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

/// Parse one wire line (newline already stripped) into
/// `(name, value, timestamp)`.
///
/// The line must consist of exactly three fields separated by single
/// spaces, all bytes in the printable ASCII range 0x20-0x7E. The value
/// must be a finite double and the timestamp a positive integer.
pub fn parse_line(line: &[u8]) -> Result<(&str, f64, i64), ParseError> {
    let mut fields: [&[u8]; 3] = [&[]; 3];
    let mut field = 0;
    let mut start = 0;

    for (i, &b) in line.iter().enumerate() {
        if !(0x20..=0x7e).contains(&b) {
            return Err(ParseError::NonAscii { line: lossy(line) });
        }
        if b == b' ' {
            if field == 2 {
                return Err(ParseError::WrongFieldCount { line: lossy(line) });
            }
            fields[field] = &line[start..i];
            field += 1;
            start = i + 1;
        }
    }

    if field != 2 {
        return Err(ParseError::WrongFieldCount { line: lossy(line) });
    }
    fields[2] = &line[start..];

    if fields[0].is_empty() {
        return Err(ParseError::EmptyName { line: lossy(line) });
    }

    // Safety: every byte was checked to be printable ASCII above, so the
    // field slices are valid single-byte UTF-8.
    let name = unsafe { std::str::from_utf8_unchecked(fields[0]) };
    let value_text = unsafe { std::str::from_utf8_unchecked(fields[1]) };
    let timestamp_text = unsafe { std::str::from_utf8_unchecked(fields[2]) };

    let value: f64 = value_text
        .parse()
        .map_err(|_| ParseError::BadValue { line: lossy(line) })?;
    if !value.is_finite() {
        return Err(ParseError::BadValue { line: lossy(line) });
    }

    let timestamp: i64 = timestamp_text
        .parse()
        .map_err(|_| ParseError::BadTimestamp { line: lossy(line) })?;
    if timestamp < 1 {
        return Err(ParseError::BadTimestamp { line: lossy(line) });
    }

    Ok((name, value, timestamp))
}
