//! Conversions between server wire text and application C types.
//!
//! The server delivers every value as text (binary transfer is only used for the row locator
//! columns). The routines here parse those texts into the C types the application binds, format
//! bound parameter values back into literals, and implement the truncation contract: a value
//! larger than the target buffer is copied up to `len - 1` bytes plus a terminating zero, the
//! full length is reported, and consecutive reads of the same column resume behind the bytes
//! already delivered.

use atoi::FromRadix10Signed;
use widestring::U16String;

use crate::encoding::ucs2_to_utf8;
use crate::error::Error;

/// Year, month and day of a `date` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Date {
    pub year: i16,
    pub month: u16,
    pub day: u16,
}

/// Wall clock part of a `time` or `timestamp` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Time {
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub date: Date,
    pub time: Time,
    /// Sub-second part in nanoseconds.
    pub fraction: u32,
}

impl Timestamp {
    /// 1970-01-01 00:00:00, the value "invalid" strings collapse to.
    pub fn epoch() -> Self {
        Timestamp {
            date: Date {
                year: 1970,
                month: 1,
                day: 1,
            },
            time: Time::default(),
            fraction: 0,
        }
    }
}

/// A parameter value as bound by the application, after the buffer has been read out.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Null,
    Bit(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    /// Exact numeric kept in its textual form for lossless round trips.
    Numeric(String),
    /// Narrow character data in the client encoding.
    Char(Vec<u8>),
    /// Wide character data, transcoded to UTF-8 on substitution.
    WChar(U16String),
    Binary(Vec<u8>),
    Date(Date),
    Time(Time),
    Timestamp(Timestamp),
}

/// Outcome of copying a converted value into a caller buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The whole value fit. Length excludes the terminating zero.
    Success { length: usize },
    /// Buffer was too small, a zero terminated prefix has been written. `full_length` is the
    /// length the caller's indicator must report.
    Truncated { written: usize, full_length: usize },
}

impl CopyOutcome {
    pub fn is_truncated(self) -> bool {
        matches!(self, CopyOutcome::Truncated { .. })
    }
}

/// Copies `value` into `target` honouring the truncation contract. With an empty target buffer
/// nothing is written and the full length is still reported.
pub fn copy_with_truncation(value: &[u8], target: &mut [u8]) -> CopyOutcome {
    if target.len() > value.len() {
        target[..value.len()].copy_from_slice(value);
        target[value.len()] = 0;
        CopyOutcome::Success { length: value.len() }
    } else {
        let written = target.len().saturating_sub(1);
        target[..written].copy_from_slice(&value[..written]);
        if let Some(last) = target.get_mut(written) {
            *last = 0;
        }
        CopyOutcome::Truncated {
            written,
            full_length: value.len(),
        }
    }
}

#[derive(Debug)]
enum ColumnRead {
    /// Bytes not yet delivered by previous reads of the column.
    Pending(Vec<u8>),
    /// Everything has been delivered, the next read reports no data.
    Drained,
}

/// Per column bookkeeping for piecewise reads of one row.
#[derive(Debug, Default)]
pub struct PartialReads {
    columns: Vec<Option<ColumnRead>>,
}

impl PartialReads {
    /// Forget all partial reads, called whenever the cursor moves to another row.
    pub fn reset(&mut self) {
        self.columns.clear();
    }

    /// Hands out the next chunk of `column`, converting `value` on the first call and resuming
    /// from the remainder on subsequent ones. Returns `None` once the column is drained.
    pub fn next_chunk(
        &mut self,
        column: usize,
        value: &[u8],
        target: &mut [u8],
    ) -> Option<CopyOutcome> {
        if self.columns.len() <= column {
            self.columns.resize_with(column + 1, || None);
        }
        let entry = self.columns[column]
            .get_or_insert_with(|| ColumnRead::Pending(value.to_vec()));
        let remaining = match entry {
            ColumnRead::Drained => return None,
            ColumnRead::Pending(rest) => rest,
        };
        let outcome = copy_with_truncation(remaining, target);
        match outcome {
            CopyOutcome::Success { .. } => self.columns[column] = Some(ColumnRead::Drained),
            CopyOutcome::Truncated { written, .. } => {
                remaining.drain(..written);
            }
        }
        Some(outcome)
    }
}

/// `'f'`, `'F'`, `'n'`, `'N'` and `'0'` are false, everything else is true.
pub fn parse_bool(text: &[u8]) -> bool {
    !matches!(text.first(), Some(b'f' | b'F' | b'n' | b'N' | b'0'))
}

/// Parses a signed integer out of the leading digits, ignoring surrounding whitespace.
pub fn parse_int(text: &[u8]) -> Result<i64, Error> {
    let trimmed = trim_ascii(text);
    let (value, digits) = i64::from_radix_10_signed(trimmed);
    if digits == 0 {
        return Err(Error::RestrictedTypeConversion { from: "integer" });
    }
    Ok(value)
}

/// Narrows a parsed integer into the bound destination width.
pub fn narrow_int<T>(value: i64) -> Result<T, Error>
where
    T: TryFrom<i64>,
{
    T::try_from(value).map_err(|_| Error::RestrictedTypeConversion { from: "integer" })
}

pub fn parse_float(text: &[u8]) -> Result<f64, Error> {
    let trimmed = trim_ascii(text);
    std::str::from_utf8(trimmed)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::RestrictedTypeConversion { from: "float" })
}

/// Money values come back as `$1,234.50` or `($12.00)` for negatives.
pub fn parse_money(text: &[u8]) -> Result<f64, Error> {
    let mut cleaned = String::with_capacity(text.len());
    let mut negative = false;
    for &byte in text {
        match byte {
            b'(' => negative = true,
            b')' | b'$' | b',' | b' ' => (),
            b'-' => negative = true,
            other => cleaned.push(other as char),
        }
    }
    let value: f64 = cleaned
        .parse()
        .map_err(|_| Error::RestrictedTypeConversion { from: "money" })?;
    Ok(if negative { -value } else { value })
}

/// Parses a date in either ISO `YYYY-MM-DD` or the `MM-DD-YYYY` style older servers can be
/// configured to emit. Strings containing `invalid` collapse to the epoch.
pub fn parse_date(text: &[u8]) -> Result<Date, Error> {
    Ok(parse_timestamp(text)?.date)
}

pub fn parse_time(text: &[u8]) -> Result<Time, Error> {
    Ok(parse_timestamp(text)?.time)
}

/// Parses a timestamp. Time components default to midnight when only a date is present, the date
/// defaults to the epoch date when only a time is present.
pub fn parse_timestamp(text: &[u8]) -> Result<Timestamp, Error> {
    let text = std::str::from_utf8(trim_ascii(text))
        .map_err(|_| Error::RestrictedTypeConversion { from: "datetime" })?;
    if text.contains("invalid") {
        return Ok(Timestamp::epoch());
    }
    let mut result = Timestamp::epoch();
    let mut rest = text;
    if let Some((date, tail)) = split_leading_date(rest) {
        result.date = date;
        rest = tail;
    }
    let rest = rest.trim_start();
    if !rest.is_empty() {
        let (time, fraction) = parse_time_part(rest)?;
        result.time = time;
        result.fraction = fraction;
    }
    Ok(result)
}

fn split_leading_date(text: &str) -> Option<(Date, &str)> {
    let (token, rest) = match text.split_once(' ') {
        Some((token, rest)) => (token, rest),
        None => (text, ""),
    };
    let mut fields = token.split('-');
    let first: i32 = fields.next()?.parse().ok()?;
    let second: u16 = fields.next()?.parse().ok()?;
    let third: i32 = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    // A four digit lead field means ISO ordering, otherwise month first.
    let date = if first >= 1000 {
        Date {
            year: first as i16,
            month: second,
            day: third as u16,
        }
    } else {
        Date {
            year: third as i16,
            month: first as u16,
            day: second,
        }
    };
    Some((date, rest))
}

fn parse_time_part(text: &str) -> Result<(Time, u32), Error> {
    let invalid = || Error::RestrictedTypeConversion { from: "datetime" };
    // Strip a trailing time zone displacement. The date has already been cut away, so a minus
    // can only introduce a displacement here.
    let text = text.split(['+', '-', 'Z']).next().unwrap_or(text).trim();
    let mut fraction = 0;
    let (hms, frac) = match text.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (text, None),
    };
    if let Some(frac) = frac {
        let digits: String = frac.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            let parsed: u32 = digits.parse().map_err(|_| invalid())?;
            fraction = parsed * 10u32.pow(9u32.saturating_sub(digits.len() as u32));
        }
    }
    let mut fields = hms.split(':');
    let hour = fields.next().and_then(|f| f.trim().parse().ok()).ok_or_else(invalid)?;
    let minute = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
    let second = fields
        .next()
        .and_then(|f| f.split_whitespace().next())
        .and_then(|f| f.parse().ok())
        .unwrap_or(0);
    Ok((
        Time {
            hour,
            minute,
            second,
        },
        fraction,
    ))
}

/// An `interval` value, server style: calendar and clock components kept apart because their
/// length in absolute time differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    /// Sub day part in microseconds.
    pub micros: i64,
}

/// Parses the server's verbose interval style (`1 year 2 mons 3 days 04:05:06`), including the
/// `@ ... ago` form older servers emit.
pub fn parse_interval(text: &[u8]) -> Result<Interval, Error> {
    let invalid = || Error::RestrictedTypeConversion { from: "interval" };
    let text = std::str::from_utf8(trim_ascii(text)).map_err(|_| invalid())?;
    let mut text = text.strip_prefix('@').map(str::trim_start).unwrap_or(text);
    let negate = text.ends_with("ago");
    if negate {
        text = text[..text.len() - 3].trim_end();
    }

    let mut interval = Interval::default();
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        if token.contains(':') {
            // Clock part, optionally signed: [-]HH:MM:SS[.ffffff]
            let (sign, clock) = match token.strip_prefix('-') {
                Some(rest) => (-1i64, rest),
                None => (1, token),
            };
            let (time, fraction) = parse_time_part(clock)?;
            let seconds = i64::from(time.hour) * 3600
                + i64::from(time.minute) * 60
                + i64::from(time.second);
            interval.micros = sign * (seconds * 1_000_000 + i64::from(fraction / 1_000));
            continue;
        }
        let quantity: i64 = token.parse().map_err(|_| invalid())?;
        let unit = tokens.next().ok_or_else(invalid)?;
        match unit.trim_end_matches('s') {
            "year" => interval.months += (quantity * 12) as i32,
            "mon" | "month" => interval.months += quantity as i32,
            "week" => interval.days += (quantity * 7) as i32,
            "day" => interval.days += quantity as i32,
            "hour" => interval.micros += quantity * 3_600_000_000,
            "min" | "minute" => interval.micros += quantity * 60_000_000,
            "sec" | "second" => interval.micros += quantity * 1_000_000,
            _ => return Err(invalid()),
        }
    }
    if negate {
        interval.months = -interval.months;
        interval.days = -interval.days;
        interval.micros = -interval.micros;
    }
    Ok(interval)
}

/// Inverse of [`parse_interval`], in the server's verbose output style.
pub fn format_interval(interval: &Interval) -> String {
    let mut out = String::new();
    if interval.months != 0 {
        out.push_str(&format!("{} mons", interval.months));
    }
    if interval.days != 0 {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&format!("{} days", interval.days));
    }
    if interval.micros != 0 || out.is_empty() {
        if !out.is_empty() {
            out.push(' ');
        }
        let micros = interval.micros.unsigned_abs();
        let seconds = micros / 1_000_000;
        if interval.micros < 0 {
            out.push('-');
        }
        out.push_str(&format!(
            "{:02}:{:02}:{:02}",
            seconds / 3600,
            (seconds / 60) % 60,
            seconds % 60
        ));
        let sub = micros % 1_000_000;
        if sub != 0 {
            out.push_str(format!(".{sub:06}").trim_end_matches('0'));
        }
    }
    out
}

pub fn format_date(date: &Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year, date.month, date.day)
}

pub fn format_time(time: &Time) -> String {
    format!("{:02}:{:02}:{:02}", time.hour, time.minute, time.second)
}

pub fn format_timestamp(ts: &Timestamp) -> String {
    let mut text = format!("{} {}", format_date(&ts.date), format_time(&ts.time));
    if ts.fraction != 0 {
        // Microsecond resolution, trailing zeroes trimmed.
        let micros = ts.fraction / 1_000;
        let frac = format!(".{micros:06}");
        text.push_str(frac.trim_end_matches('0'));
    }
    text
}

/// Decodes the server's octal escaped `bytea` text: `\\` is a backslash, `\ooo` one byte,
/// printable characters pass through.
pub fn decode_bytea(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        if text[i] == b'\\' {
            if text.get(i + 1) == Some(&b'\\') {
                out.push(b'\\');
                i += 2;
            } else if i + 3 < text.len() {
                let octal = &text[i + 1..i + 4];
                let byte = octal
                    .iter()
                    .fold(0u32, |acc, &d| acc * 8 + u32::from(d - b'0'));
                out.push(byte as u8);
                i += 4;
            } else {
                // Malformed trailing escape, keep the byte as is.
                out.push(text[i]);
                i += 1;
            }
        } else {
            out.push(text[i]);
            i += 1;
        }
    }
    out
}

/// Inverse of [`decode_bytea`]: printable ASCII passes through, backslash doubles, everything
/// else becomes a three digit octal escape.
pub fn encode_bytea(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        if byte == b'\\' {
            out.push_str("\\\\");
        } else if (0x20..0x7f).contains(&byte) && byte != b'\'' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("\\{byte:03o}"));
        }
    }
    out
}

/// Expands bare line feeds to carriage return + line feed pairs, used for `SQL_C_CHAR` targets
/// when the `lf_conversion` option is on.
pub fn lf_to_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for (index, &byte) in bytes.iter().enumerate() {
        if byte == b'\n' && (index == 0 || bytes[index - 1] != b'\r') {
            out.push(b'\r');
        }
        out.push(byte);
    }
    out
}

/// Inverse of [`lf_to_crlf`], applied to `SQL_C_CHAR` input buffers before substitution.
pub fn crlf_to_lf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Formats a bound value as the unquoted payload of a literal. `None` for the SQL NULL.
/// Booleans become `0`/`1` (`-1` for true under the `true_is_minus1` presentation when bound
/// through an integer type, handled by the caller), temporals ISO strings, binary the octal
/// escaped bytea form.
pub fn format_bound_value(value: &BoundValue) -> Option<String> {
    let text = match value {
        BoundValue::Null => return None,
        BoundValue::Bit(value) => if *value { "1" } else { "0" }.to_string(),
        BoundValue::SmallInt(value) => value.to_string(),
        BoundValue::Int(value) => value.to_string(),
        BoundValue::BigInt(value) => value.to_string(),
        BoundValue::Float(value) => value.to_string(),
        BoundValue::Double(value) => value.to_string(),
        BoundValue::Numeric(text) => text.clone(),
        BoundValue::Char(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        BoundValue::WChar(wide) => {
            String::from_utf8_lossy(&ucs2_to_utf8(wide, false)).into_owned()
        }
        BoundValue::Binary(bytes) => encode_bytea(bytes),
        BoundValue::Date(date) => format_date(date),
        BoundValue::Time(time) => format_time(time),
        BoundValue::Timestamp(ts) => format_timestamp(ts),
    };
    Some(text)
}

/// `true` if the literal payload needs single quotes around it in statement text.
pub fn needs_quotes(value: &BoundValue) -> bool {
    !matches!(
        value,
        BoundValue::Bit(_)
            | BoundValue::SmallInt(_)
            | BoundValue::Int(_)
            | BoundValue::BigInt(_)
            | BoundValue::Float(_)
            | BoundValue::Double(_)
            | BoundValue::Numeric(_)
    )
}

fn trim_ascii(text: &[u8]) -> &[u8] {
    let start = text.iter().position(|b| !b.is_ascii_whitespace());
    let end = text.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(start), Some(end)) => &text[start..=end],
        _ => &[],
    }
}
