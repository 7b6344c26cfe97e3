//! Statement text rewriting.
//!
//! Before dispatch the statement text is rewritten: `?` placeholders are replaced with literal
//! fragments formatted from the bound parameters, ODBC escape braces (`{fn ...}`, `{d ...}`,
//! `{call ...}`, ...) are translated to server SQL, and cursor capable SELECTs are wrapped in a
//! `DECLARE ... CURSOR FOR` with the keyset projection appended. Placeholders inside string
//! literals, quoted identifiers and dollar quoted blocks are left alone; literal scanning honours
//! the session's `standard_conforming_strings` setting and steps over multibyte characters.

use log::debug;

use crate::convert::{format_bound_value, needs_quotes, BoundValue};
use crate::encoding::{char_state, Charset};
use crate::error::Error;
use crate::parse::StatementKind;

/// Fixed substitution table for `{fn NAME(...)}` escape functions. Unknown names pass through.
const FUNCTION_MAP: &[(&str, &str)] = &[
    ("CHAR", "chr"),
    ("CONCAT", "textcat"),
    ("LCASE", "lower"),
    ("LEFT", "ltrunc"),
    ("LOCATE", "strpos"),
    ("LENGTH", "char_length"),
    ("RIGHT", "rtrunc"),
    ("SUBSTRING", "substr"),
    ("UCASE", "upper"),
    ("CEILING", "ceil"),
    ("LOG", "ln"),
    ("LOG10", "log"),
    ("POWER", "pow"),
    ("RAND", "random"),
    ("TRUNCATE", "trunc"),
    ("IFNULL", "coalesce"),
    ("USER", "odbc_user"),
];

/// Maps an escape function name to its server counterpart.
pub fn map_function(name: &str) -> Option<&'static str> {
    FUNCTION_MAP
        .iter()
        .find(|(odbc, _)| name.eq_ignore_ascii_case(odbc))
        .map(|&(_, server)| server)
}

/// Session settings steering the rewrite.
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext {
    /// Captured `standard_conforming_strings`: with it off a backslash escapes inside literals.
    pub std_strings: bool,
    pub charset: Charset,
}

impl Default for RewriteContext {
    fn default() -> Self {
        RewriteContext {
            std_strings: true,
            charset: Charset::Utf8,
        }
    }
}

/// Result of the substitution pass.
#[derive(Debug, Clone)]
pub struct Rewritten {
    pub text: String,
    /// Statement kind after rewriting. `SELECT ... INTO` is reclassified as CREATE, it is not
    /// cursor capable.
    pub kind: StatementKind,
    /// Number of placeholders substituted.
    pub num_substituted: usize,
    pub for_update: bool,
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    mb_state: u32,
    ctx: RewriteContext,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str, ctx: RewriteContext) -> Self {
        Scanner {
            bytes: text.as_bytes(),
            pos: 0,
            mb_state: 0,
            ctx,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Consumes one byte and reports whether it sits on a character boundary of the session
    /// encoding. Quote characters inside a multibyte character must not toggle literal state.
    fn bump(&mut self) -> Option<(u8, bool)> {
        let byte = self.peek()?;
        self.pos += 1;
        self.mb_state = char_state(self.mb_state, byte, self.ctx.charset);
        Some((byte, self.mb_state < 2))
    }
}

/// Substitutes placeholders and escape sequences in `sql`. `params` holds the bound parameter
/// values by position; running out of bound parameters is an error attributed to the one based
/// parameter number.
pub fn substitute(
    sql: &str,
    params: &[BoundValue],
    ctx: RewriteContext,
) -> Result<Rewritten, Error> {
    let mut out = String::with_capacity(sql.len().max(4096));
    let mut scanner = Scanner::new(sql, ctx);
    let mut next_param = 0usize;
    substitute_span(&mut scanner, &mut out, params, &mut next_param, None)?;

    let kind = classify_rewritten(&out, ctx);
    let for_update = contains_for_update(&out, ctx);
    Ok(Rewritten {
        text: out,
        kind,
        num_substituted: next_param,
        for_update,
    })
}

/// Copies bytes from `scanner` to `out` substituting placeholders, until `stop` (an unnested
/// closing brace) or the end of input.
fn substitute_span(
    scanner: &mut Scanner<'_>,
    out: &mut String,
    params: &[BoundValue],
    next_param: &mut usize,
    stop: Option<u8>,
) -> Result<(), Error> {
    while let Some(byte) = scanner.peek() {
        if Some(byte) == stop {
            return Ok(());
        }
        match byte {
            b'?' => {
                scanner.pos += 1;
                let value = params.get(*next_param).ok_or(Error::WrongParameterNumber {
                    number: (*next_param + 1) as u16,
                })?;
                *next_param += 1;
                push_literal(out, value);
            }
            b'\'' => copy_string_literal(scanner, out, scanner.ctx.std_strings)?,
            b'E' | b'e' if scanner.bytes.get(scanner.pos + 1) == Some(&b'\'') => {
                let (lead, _) = scanner.bump().expect("peeked");
                out.push(lead as char);
                copy_string_literal(scanner, out, false)?;
            }
            b'"' => copy_quoted_identifier(scanner, out)?,
            b'$' => copy_dollar_quote_or_dollar(scanner, out)?,
            b'-' if scanner.bytes.get(scanner.pos + 1) == Some(&b'-') => {
                while let Some((byte, _)) = scanner.bump() {
                    out.push(byte as char);
                    if byte == b'\n' {
                        break;
                    }
                }
            }
            b'/' if scanner.bytes.get(scanner.pos + 1) == Some(&b'*') => {
                copy_block_comment(scanner, out);
            }
            b'{' => {
                scanner.pos += 1;
                translate_escape(scanner, out, params, next_param)?;
            }
            _ => {
                let (byte, _) = scanner.bump().expect("peeked");
                out.push(byte as char);
            }
        }
    }
    Ok(())
}

/// Renders a bound value as a standalone literal fragment, for generated DML.
pub fn literal_fragment(value: &BoundValue) -> String {
    let mut out = String::new();
    push_literal(&mut out, value);
    out
}

fn push_literal(out: &mut String, value: &BoundValue) {
    match format_bound_value(value) {
        None => out.push_str("NULL"),
        Some(text) => {
            if needs_quotes(value) {
                out.push('\'');
                // Bound text is data, double any quote characters it carries.
                for c in text.chars() {
                    if c == '\'' {
                        out.push('\'');
                    }
                    out.push(c);
                }
                out.push('\'');
            } else {
                out.push_str(&text);
            }
        }
    }
}

fn copy_string_literal(
    scanner: &mut Scanner<'_>,
    out: &mut String,
    std_strings: bool,
) -> Result<(), Error> {
    let (quote, _) = scanner.bump().expect("caller checked the opening quote");
    out.push(quote as char);
    while let Some((byte, boundary)) = scanner.bump() {
        out.push(byte as char);
        if !boundary {
            continue;
        }
        match byte {
            b'\'' => {
                if scanner.peek() == Some(b'\'') {
                    let (escaped, _) = scanner.bump().expect("peeked");
                    out.push(escaped as char);
                } else {
                    return Ok(());
                }
            }
            b'\\' if !std_strings => {
                if let Some((escaped, _)) = scanner.bump() {
                    out.push(escaped as char);
                }
            }
            _ => (),
        }
    }
    Err(Error::Rewrite("unterminated string literal".to_string()))
}

fn copy_quoted_identifier(scanner: &mut Scanner<'_>, out: &mut String) -> Result<(), Error> {
    let (quote, _) = scanner.bump().expect("caller checked the opening quote");
    out.push(quote as char);
    while let Some((byte, boundary)) = scanner.bump() {
        out.push(byte as char);
        if boundary && byte == b'"' {
            if scanner.peek() == Some(b'"') {
                let (escaped, _) = scanner.bump().expect("peeked");
                out.push(escaped as char);
            } else {
                return Ok(());
            }
        }
    }
    Err(Error::Rewrite("unterminated quoted identifier".to_string()))
}

fn copy_dollar_quote_or_dollar(scanner: &mut Scanner<'_>, out: &mut String) -> Result<(), Error> {
    let start = scanner.pos;
    let mut end = start + 1;
    while end < scanner.bytes.len()
        && (scanner.bytes[end] == b'_' || scanner.bytes[end].is_ascii_alphanumeric())
    {
        end += 1;
    }
    if scanner.bytes.get(end) != Some(&b'$') {
        // A lone dollar, e.g. part of an identifier.
        let (byte, _) = scanner.bump().expect("caller checked");
        out.push(byte as char);
        return Ok(());
    }
    let closing = scanner.bytes[start..=end].to_vec();
    // Copy the opening tag.
    for _ in start..=end {
        let (byte, _) = scanner.bump().expect("within bounds");
        out.push(byte as char);
    }
    // Copy the body without interpreting anything until the tag repeats.
    loop {
        if scanner.pos >= scanner.bytes.len() {
            return Err(Error::Rewrite("unterminated dollar quote".to_string()));
        }
        if scanner.bytes[scanner.pos..].starts_with(&closing) {
            for _ in 0..closing.len() {
                let (byte, _) = scanner.bump().expect("within bounds");
                out.push(byte as char);
            }
            return Ok(());
        }
        let (byte, _) = scanner.bump().expect("within bounds");
        out.push(byte as char);
    }
}

fn copy_block_comment(scanner: &mut Scanner<'_>, out: &mut String) {
    // Comments nest; the first iteration consumes the opening slash and counts it.
    let mut depth = 0;
    while let Some((byte, _)) = scanner.bump() {
        out.push(byte as char);
        if byte == b'/' && scanner.peek() == Some(b'*') {
            depth += 1;
        } else if byte == b'*' && scanner.peek() == Some(b'/') {
            let (slash, _) = scanner.bump().expect("peeked");
            out.push(slash as char);
            depth -= 1;
            if depth == 0 {
                return;
            }
        }
    }
}

/// Translates one `{...}` escape sequence, the opening brace already consumed.
fn translate_escape(
    scanner: &mut Scanner<'_>,
    out: &mut String,
    params: &[BoundValue],
    next_param: &mut usize,
) -> Result<(), Error> {
    // Skip whitespace and an optional `?=` result marker.
    skip_spaces(scanner);
    if scanner.peek() == Some(b'?') {
        scanner.pos += 1;
        skip_spaces(scanner);
        if scanner.peek() == Some(b'=') {
            scanner.pos += 1;
        }
        skip_spaces(scanner);
    }
    let keyword = read_word(scanner);
    skip_spaces(scanner);
    match keyword.to_ascii_lowercase().as_str() {
        // Temporal literals: the payload is already a quoted ISO string.
        "d" | "t" | "ts" | "interval" => {
            substitute_span(scanner, out, params, next_param, Some(b'}'))?;
        }
        "oj" => {
            // Outer join escape, the content is server SQL already.
            substitute_span(scanner, out, params, next_param, Some(b'}'))?;
        }
        "call" => {
            out.push_str("SELECT ");
            substitute_span(scanner, out, params, next_param, Some(b'}'))?;
        }
        "fn" => {
            let name = read_word(scanner);
            match map_function(&name) {
                Some(mapped) => out.push_str(mapped),
                None => {
                    debug!("passing through unmapped escape function {name}");
                    out.push_str(&name);
                }
            }
            substitute_span(scanner, out, params, next_param, Some(b'}'))?;
        }
        other => {
            return Err(Error::Rewrite(format!("unknown escape sequence '{other}'")));
        }
    }
    // The payload may carry a blank before the closing brace, drop it so function escapes stay
    // tight, but never beyond what this escape produced.
    if out.ends_with(' ') {
        out.pop();
    }
    if scanner.peek() == Some(b'}') {
        scanner.pos += 1;
        Ok(())
    } else {
        Err(Error::Rewrite("unterminated escape sequence".to_string()))
    }
}

fn skip_spaces(scanner: &mut Scanner<'_>) {
    while scanner.peek().is_some_and(|b| b.is_ascii_whitespace()) {
        scanner.pos += 1;
    }
}

fn read_word(scanner: &mut Scanner<'_>) -> String {
    let start = scanner.pos;
    while scanner
        .peek()
        .is_some_and(|b| b == b'_' || b.is_ascii_alphanumeric())
    {
        scanner.pos += 1;
    }
    String::from_utf8_lossy(&scanner.bytes[start..scanner.pos]).into_owned()
}

/// `SELECT ... INTO table` creates a table, reclassify so the executor does not wrap it in a
/// cursor.
fn classify_rewritten(sql: &str, ctx: RewriteContext) -> StatementKind {
    let kind = StatementKind::of(sql);
    if kind == StatementKind::Select {
        let parsed = crate::parse::parse_statement(sql, ctx.std_strings);
        if parsed.select_into {
            return StatementKind::Create;
        }
    }
    kind
}

fn contains_for_update(sql: &str, ctx: RewriteContext) -> bool {
    crate::parse::parse_statement(sql, ctx.std_strings).for_update
}

/// Replaces each substitutable `?` with the numbered `$n` markers of the wire protocol, for the
/// server side prepare path. Quote and escape handling matches [`substitute`].
pub fn number_placeholders(sql: &str, ctx: RewriteContext) -> Result<(String, usize), Error> {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut scanner = Scanner::new(sql, ctx);
    let mut count = 0usize;
    while let Some(byte) = scanner.peek() {
        match byte {
            b'?' => {
                scanner.pos += 1;
                count += 1;
                out.push_str(&format!("${count}"));
            }
            b'\'' => copy_string_literal(&mut scanner, &mut out, ctx.std_strings)?,
            b'E' | b'e' if scanner.bytes.get(scanner.pos + 1) == Some(&b'\'') => {
                let (lead, _) = scanner.bump().expect("peeked");
                out.push(lead as char);
                copy_string_literal(&mut scanner, &mut out, false)?;
            }
            b'"' => copy_quoted_identifier(&mut scanner, &mut out)?,
            b'$' => copy_dollar_quote_or_dollar(&mut scanner, &mut out)?,
            b'-' if scanner.bytes.get(scanner.pos + 1) == Some(&b'-') => {
                while let Some((byte, _)) = scanner.bump() {
                    out.push(byte as char);
                    if byte == b'\n' {
                        break;
                    }
                }
            }
            b'/' if scanner.bytes.get(scanner.pos + 1) == Some(&b'*') => {
                copy_block_comment(&mut scanner, &mut out);
            }
            _ => {
                let (byte, _) = scanner.bump().expect("peeked");
                out.push(byte as char);
            }
        }
    }
    Ok((out, count))
}

/// Wraps a SELECT into a server cursor declaration.
pub fn declare_cursor(sql: &str, cursor_name: &str, with_hold: bool) -> String {
    let hold = if with_hold { "WITH HOLD " } else { "" };
    format!("DECLARE \"{cursor_name}\" CURSOR {hold}FOR {sql}")
}

/// Appends the keyset projection (`ctid` and, when the table has them, `oid`) to the target list
/// of a SELECT, immediately before its FROM clause. The added columns are stripped again from
/// the visible column count when rows are decoded.
pub fn inject_keyset_columns(sql: &str, with_oid: bool, ctx: RewriteContext) -> Option<String> {
    let mut scanner = Scanner::new(sql, ctx);
    let mut depth = 0i32;
    let mut sink = String::new();
    loop {
        let byte = scanner.peek()?;
        match byte {
            b'\'' => copy_string_literal(&mut scanner, &mut sink, ctx.std_strings).ok()?,
            b'"' => copy_quoted_identifier(&mut scanner, &mut sink).ok()?,
            b'$' => copy_dollar_quote_or_dollar(&mut scanner, &mut sink).ok()?,
            b'(' => {
                depth += 1;
                let _ = scanner.bump();
            }
            b')' => {
                depth -= 1;
                let _ = scanner.bump();
            }
            b'f' | b'F' if depth == 0 && word_at(scanner.bytes, scanner.pos, "from") => {
                let mut out = String::with_capacity(sql.len() + 16);
                out.push_str(sql[..scanner.pos].trim_end());
                out.push_str(if with_oid {
                    ", \"ctid\", \"oid\" "
                } else {
                    ", \"ctid\" "
                });
                out.push_str(&sql[scanner.pos..]);
                return Some(out);
            }
            _ => {
                let _ = scanner.bump();
            }
        }
    }
}

/// `true` when the keyword starts at `pos` delimited by non identifier characters.
fn word_at(bytes: &[u8], pos: usize, word: &str) -> bool {
    let end = pos + word.len();
    if end > bytes.len() {
        return false;
    }
    if !bytes[pos..end].eq_ignore_ascii_case(word.as_bytes()) {
        return false;
    }
    let before = pos
        .checked_sub(1)
        .map(|i| bytes[i])
        .map_or(true, |b| !b.is_ascii_alphanumeric() && b != b'_');
    let after = bytes
        .get(end)
        .map_or(true, |b| !b.is_ascii_alphanumeric() && *b != b'_');
    before && after
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{BoundValue, Date};

    fn ctx() -> RewriteContext {
        RewriteContext::default()
    }

    #[test]
    fn substitutes_each_placeholder_once() {
        let params = vec![BoundValue::Int(1), BoundValue::Char(b"x".to_vec())];
        let rewritten = substitute("SELECT ?, ?", &params, ctx()).unwrap();
        assert_eq!("SELECT 1, 'x'", rewritten.text);
        assert_eq!(2, rewritten.num_substituted);
    }

    /// Placeholders inside literals, quoted identifiers and casts stay untouched.
    #[test]
    fn respects_quotes() {
        let params = vec![BoundValue::Int(5), BoundValue::Char(b"v".to_vec())];
        let rewritten = substitute(
            "SELECT ?::int, 'it''s ?', \"?col\", ?::text",
            &params,
            ctx(),
        )
        .unwrap();
        assert_eq!("SELECT 5::int, 'it''s ?', \"?col\", 'v'::text", rewritten.text);
        assert_eq!(2, rewritten.num_substituted);
    }

    #[test]
    fn respects_dollar_quotes() {
        let params = vec![BoundValue::Int(1)];
        let rewritten = substitute("SELECT $x$ ? $x$, ?", &params, ctx()).unwrap();
        assert_eq!("SELECT $x$ ? $x$, 1", rewritten.text);
    }

    #[test]
    fn backslash_in_literal_honours_setting() {
        let params = vec![BoundValue::Int(1)];
        // With standard conforming strings the backslash ends nothing; the second quote closes.
        let conforming = substitute(r"SELECT '\', ?", &params, ctx()).unwrap();
        assert_eq!(r"SELECT '\', 1", conforming.text);
        // Without, the backslash escapes the quote and the literal swallows the placeholder.
        let legacy = substitute(
            r"SELECT '\' ? ', ?",
            &params,
            RewriteContext {
                std_strings: false,
                ..ctx()
            },
        )
        .unwrap();
        assert_eq!(1, legacy.num_substituted);
    }

    #[test]
    fn missing_parameter_is_reported_with_its_number() {
        let err = substitute("SELECT ?, ?", &[BoundValue::Int(1)], ctx()).unwrap_err();
        assert!(matches!(err, Error::WrongParameterNumber { number: 2 }));
    }

    #[test]
    fn null_parameter() {
        let rewritten = substitute("SELECT ?", &[BoundValue::Null], ctx()).unwrap();
        assert_eq!("SELECT NULL", rewritten.text);
    }

    #[test]
    fn quotes_in_bound_text_are_doubled() {
        let params = vec![BoundValue::Char(b"it's".to_vec())];
        let rewritten = substitute("SELECT ?", &params, ctx()).unwrap();
        assert_eq!("SELECT 'it''s'", rewritten.text);
    }

    #[test]
    fn date_escape() {
        let rewritten = substitute("SELECT {d '1999-01-08'}", &[], ctx()).unwrap();
        assert_eq!("SELECT '1999-01-08'", rewritten.text);
    }

    #[test]
    fn function_escape_is_mapped() {
        let rewritten = substitute("SELECT {fn UCASE('a')}", &[], ctx()).unwrap();
        assert_eq!("SELECT upper('a')", rewritten.text);
        let unknown = substitute("SELECT {fn frobnicate(1)}", &[], ctx()).unwrap();
        assert_eq!("SELECT frobnicate(1)", unknown.text);
    }

    #[test]
    fn nested_function_escapes() {
        let rewritten = substitute("SELECT {fn LCASE({fn RTRIM(name)})} FROM t", &[], ctx());
        // RTRIM is not in the map and passes through.
        assert_eq!("SELECT lower(RTRIM(name)) FROM t", rewritten.unwrap().text);
    }

    #[test]
    fn call_escape() {
        let params = vec![BoundValue::Int(3)];
        let rewritten = substitute("{call add_one(?)}", &params, ctx()).unwrap();
        assert_eq!("SELECT add_one(3)", rewritten.text);
        let with_result = substitute("{?= call add_one(?)}", &params, ctx()).unwrap();
        assert_eq!("SELECT add_one(3)", with_result.text);
    }

    #[test]
    fn parameters_inside_escapes_are_substituted() {
        let params = vec![BoundValue::Date(Date {
            year: 1999,
            month: 1,
            day: 8,
        })];
        let rewritten = substitute("SELECT {fn LENGTH(?)}", &params, ctx()).unwrap();
        assert_eq!("SELECT char_length('1999-01-08')", rewritten.text);
    }

    #[test]
    fn select_into_is_reclassified() {
        let rewritten = substitute("SELECT id INTO t2 FROM t", &[], ctx()).unwrap();
        assert_eq!(StatementKind::Create, rewritten.kind);
    }

    #[test]
    fn for_update_is_flagged() {
        let rewritten = substitute("SELECT id FROM t FOR UPDATE", &[], ctx()).unwrap();
        assert!(rewritten.for_update);
    }

    #[test]
    fn placeholders_are_numbered_for_server_side_prepare() {
        let (text, count) =
            number_placeholders("INSERT INTO t VALUES (?, 'it''s ?', ?)", ctx()).unwrap();
        assert_eq!("INSERT INTO t VALUES ($1, 'it''s ?', $2)", text);
        assert_eq!(2, count);
    }

    #[test]
    fn declare_cursor_wrapping() {
        assert_eq!(
            "DECLARE \"SQL_CUR1\" CURSOR FOR SELECT 1",
            declare_cursor("SELECT 1", "SQL_CUR1", false)
        );
        assert_eq!(
            "DECLARE \"c\" CURSOR WITH HOLD FOR SELECT 1",
            declare_cursor("SELECT 1", "c", true)
        );
    }

    #[test]
    fn keyset_columns_go_before_from() {
        let injected = inject_keyset_columns("SELECT id, s FROM t WHERE id > 0", true, ctx());
        assert_eq!(
            Some("SELECT id, s, \"ctid\", \"oid\" FROM t WHERE id > 0".to_string()),
            injected
        );
        let no_oid = inject_keyset_columns("SELECT id FROM t", false, ctx());
        assert_eq!(Some("SELECT id, \"ctid\" FROM t".to_string()), no_oid);
    }

    /// A FROM inside a literal or subquery must not attract the keyset projection.
    #[test]
    fn keyset_columns_skip_quoted_and_nested_from() {
        let injected =
            inject_keyset_columns("SELECT 'from', (SELECT x FROM u), id FROM t", true, ctx());
        assert_eq!(
            Some(
                "SELECT 'from', (SELECT x FROM u), id, \"ctid\", \"oid\" FROM t".to_string()
            ),
            injected
        );
    }
}
