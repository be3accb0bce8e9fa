//! Row and field helpers for the server's line protocol.
//!
//! A response body is a sequence of lines; each line is a `;`-separated
//! record whose fields may be double-quoted (`""` escapes a quote). Lists
//! inside a field are `,`-separated ids or `:`-separated groups.

use std::str::FromStr;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{Error, Result};

/// One record of a response.
pub type Row = Vec<String>;

/// A whole response.
pub type Rows = Vec<Row>;

// ============================================================================
// Field access
// ============================================================================

pub fn field<'a>(row: &'a [String], index: usize, what: &str) -> Result<&'a str> {
    row.get(index)
        .map(String::as_str)
        .ok_or_else(|| Error::Protocol(format!("missing {what} (field {index} of {})", row.len())))
}

/// A trailing optional field; absent reads as empty.
pub fn field_or_empty(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

pub fn parse_u32(row: &[String], index: usize, what: &str) -> Result<u32> {
    let raw = field(row, index, what)?;
    raw.trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid {what} '{raw}'")))
}

pub fn parse_u64(row: &[String], index: usize, what: &str) -> Result<u64> {
    let raw = field(row, index, what)?;
    raw.trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid {what} '{raw}'")))
}

pub fn parse_f64(row: &[String], index: usize, what: &str) -> Result<f64> {
    let raw = field(row, index, what)?;
    raw.trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid {what} '{raw}'")))
}

/// Cell counts may exceed `u64` formatting on very sparse cubes and are then
/// sent in floating-point notation.
pub fn parse_count(row: &[String], index: usize, what: &str) -> Result<u64> {
    let raw = field(row, index, what)?.trim();
    if let Ok(v) = raw.parse::<u64>() {
        return Ok(v);
    }
    raw.parse::<f64>()
        .map(|v| v.max(0.0) as u64)
        .map_err(|_| Error::Protocol(format!("invalid {what} '{raw}'")))
}

pub fn parse_id<T>(row: &[String], index: usize, what: &str) -> Result<T>
where
    T: FromStr<Err = Error>,
{
    field(row, index, what)?.parse()
}

/// `""` and `"-1"` both mean "no such entity".
pub fn optional_id<T>(raw: &str) -> Result<Option<T>>
where
    T: FromStr<Err = Error>,
{
    match raw.trim() {
        "" | "-1" => Ok(None),
        other => other.parse().map(Some),
    }
}

/// Parses a comma-separated id list; empty means no ids.
pub fn id_list<T>(raw: &str) -> Result<Vec<T>>
where
    T: FromStr<Err = Error>,
{
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',').map(str::parse).collect()
}

/// Parses a comma-separated number list; empty means no numbers.
pub fn f64_list(raw: &str) -> Result<Vec<f64>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|w| {
            w.trim()
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid number '{w}'")))
        })
        .collect()
}

pub fn first_row<'a>(rows: &'a Rows, what: &str) -> Result<&'a Row> {
    rows.first()
        .ok_or_else(|| Error::Protocol(format!("empty response for {what}")))
}

/// The token of a token-only response.
pub fn token(rows: &Rows, what: &str) -> Result<u64> {
    parse_u64(first_row(rows, what)?, 0, what)
}

/// Joins displayable items with `sep`.
pub fn join<T: ToString>(items: impl IntoIterator<Item = T>, sep: &str) -> String {
    items.into_iter().map(|i| i.to_string()).collect::<Vec<_>>().join(sep)
}

// ============================================================================
// Quoting
// ============================================================================

/// Wraps `s` in double quotes, doubling embedded quotes.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quotes every item and joins them with `sep`.
pub fn join_quoted<S: AsRef<str>>(items: impl IntoIterator<Item = S>, sep: char) -> String {
    let mut out = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.push_str(&quote(item.as_ref()));
    }
    out
}

/// Splits `raw` on `sep`, honouring quoted fields.
pub fn split_quoted(raw: &str, sep: char) -> Vec<String> {
    split(raw, sep, false)
}

/// Splits one response line; a trailing separator does not open a new field.
pub fn split_line(line: &str, sep: char) -> Vec<String> {
    split(line, sep, true)
}

fn split(raw: &str, sep: char, drop_trailing: bool) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    let mut in_quotes = false;
    let mut ended_with_sep = false;

    while let Some(c) = chars.next() {
        ended_with_sep = false;
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == sep {
            fields.push(std::mem::take(&mut current));
            ended_with_sep = true;
        } else {
            current.push(c);
        }
    }

    if !(drop_trailing && ended_with_sep) {
        fields.push(current);
    }
    fields
}

/// Parses a full response body into rows, skipping blank lines.
pub fn parse_body(body: &str) -> Rows {
    body.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .map(|l| split_line(l, ';'))
        .collect()
}

/// Everything but the RFC 3986 unreserved characters.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Percent-encodes a query parameter value.
pub fn percent_encode(raw: &str) -> String {
    utf8_percent_encode(raw, QUERY_VALUE).to_string()
}
