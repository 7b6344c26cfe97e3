//! Lightweight SQL parsing.
//!
//! The driver parses just enough SQL to describe result columns without a server round trip and
//! to identify the underlying base table of updatable cursors: the target list, the FROM list
//! with aliases, the statement kind and whether the statement can be updatable at all. Everything
//! else (WHERE, GROUP BY, window clauses, ...) is skipped over with balanced parentheses.

use std::sync::Arc;

use crate::client::Oid;

/// Classification of a statement by its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementKind {
    #[default]
    Unknown,
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    Grant,
    Revoke,
    ProcCall,
    Lock,
    Transaction,
    Close,
    Fetch,
    Prepare,
    Execute,
    Deallocate,
    Analyze,
    Notify,
    Explain,
    Set,
    Reset,
    Declare,
    Move,
    Copy,
    Start,
    Other,
}

impl StatementKind {
    /// Classifies by the first token of the statement text.
    pub fn of(sql: &str) -> StatementKind {
        let trimmed = sql.trim_start();
        if trimmed.starts_with('{') {
            return StatementKind::ProcCall;
        }
        let word: String = trimmed
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        match word.to_ascii_lowercase().as_str() {
            "select" | "with" => StatementKind::Select,
            "insert" => StatementKind::Insert,
            "update" => StatementKind::Update,
            "delete" => StatementKind::Delete,
            "create" => StatementKind::Create,
            "alter" => StatementKind::Alter,
            "drop" => StatementKind::Drop,
            "grant" => StatementKind::Grant,
            "revoke" => StatementKind::Revoke,
            "call" => StatementKind::ProcCall,
            "lock" => StatementKind::Lock,
            "begin" | "commit" | "rollback" | "end" | "abort" | "savepoint" | "release" => {
                StatementKind::Transaction
            }
            "close" => StatementKind::Close,
            "fetch" => StatementKind::Fetch,
            "prepare" => StatementKind::Prepare,
            "execute" => StatementKind::Execute,
            "deallocate" => StatementKind::Deallocate,
            "analyze" | "vacuum" => StatementKind::Analyze,
            "notify" | "listen" | "unlisten" => StatementKind::Notify,
            "explain" => StatementKind::Explain,
            "set" => StatementKind::Set,
            "reset" => StatementKind::Reset,
            "declare" => StatementKind::Declare,
            "move" => StatementKind::Move,
            "copy" => StatementKind::Copy,
            "start" => StatementKind::Start,
            "" => StatementKind::Unknown,
            _ => StatementKind::Other,
        }
    }

    /// `true` for kinds which may produce a row bearing result.
    pub fn returns_rows(self) -> bool {
        matches!(
            self,
            StatementKind::Select | StatementKind::Fetch | StatementKind::Execute
        )
    }

    /// `true` for kinds the driver may wrap in a server side cursor.
    pub fn cursor_capable(self) -> bool {
        self == StatementKind::Select
    }
}

/// Metadata of one column of a table, retrieved from the catalog and cached per connection.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub type_oid: Oid,
    pub typmod: i32,
    pub not_null: bool,
    /// Attribute number within the relation.
    pub attnum: i16,
}

/// Columns of one table. Shared between statements through the connection's cache.
#[derive(Debug, Clone, Default)]
pub struct TableColumns {
    pub relid: Oid,
    pub columns: Vec<ColumnMeta>,
    pub has_oids: bool,
}

impl TableColumns {
    pub fn by_name(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Best way to address a single row of a table, besides its ctid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowIdentifier {
    /// The table carries the optional `oid` identity column.
    Oid,
    /// A single column unique, non null, non expression index.
    UniqueColumn(String),
    /// Rows cannot be addressed individually, updatability is dropped.
    None,
}

/// One item of the FROM list.
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub schema: Option<String>,
    pub name: String,
    pub alias: Option<String>,
    /// Relation oid, `0` until the catalog has been consulted.
    pub relid: Oid,
    pub updatable: bool,
    pub row_identifier: Option<RowIdentifier>,
    /// Catalog columns, shared through the connection cache.
    pub columns: Option<Arc<TableColumns>>,
}

impl TableInfo {
    /// `true` if `qualifier` names this table, by alias first, then by name.
    fn matches(&self, qualifier: &str) -> bool {
        self.alias.as_deref() == Some(qualifier) || self.name == qualifier
    }

    /// Schema qualified name for emitted statements.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{}\".\"{}\"", schema, self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

/// One item of the target list.
#[derive(Debug, Clone, Default)]
pub struct FieldInfo {
    /// Column name, or the literal text for expressions.
    pub name: String,
    /// Alias under which the column is reported, defaults to the name.
    pub alias: Option<String>,
    /// Dotted table qualifier as written, e.g. `t` in `t.id`.
    pub qualifier: Option<String>,
    pub func: bool,
    pub expr: bool,
    pub quoted_literal: bool,
    pub numeric_literal: bool,
    pub asterisk: bool,
    /// Index into [`ParsedStatement::tables`] once resolved.
    pub table: Option<usize>,
    /// Catalog metadata once resolved.
    pub column: Option<ColumnMeta>,
    pub updatable: bool,
}

impl FieldInfo {
    pub fn reported_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Result of parsing one statement.
#[derive(Debug, Clone, Default)]
pub struct ParsedStatement {
    pub kind: StatementKind,
    pub fields: Vec<FieldInfo>,
    pub tables: Vec<TableInfo>,
    /// Set when the target list and FROM list could be recovered completely. Without it the
    /// driver falls back to describe-by-execution.
    pub parse_complete: bool,
    /// Aggregation or DISTINCT at the outer nesting level, disables updatability.
    pub has_aggregates: bool,
    /// `SELECT ... INTO table` creates a table and is not cursor capable.
    pub select_into: bool,
    /// `SELECT ... FOR UPDATE` disables the fetch cursor.
    pub for_update: bool,
    /// Stars still awaiting expansion against the catalog.
    pub pending_stars: bool,
}

impl ParsedStatement {
    /// `true` when positioned DML can be generated: exactly one base table, no aggregation, no
    /// SELECT INTO, complete parse.
    pub fn updatable(&self) -> bool {
        self.parse_complete
            && !self.has_aggregates
            && !self.select_into
            && self.tables.len() == 1
            && self.tables[0].updatable
    }

    /// Expands `*` and `t.*` items in place once the table's catalog columns are known. Later
    /// fields shift backwards accordingly.
    pub fn expand_stars(&mut self) {
        if !self.pending_stars {
            return;
        }
        let mut expanded = Vec::with_capacity(self.fields.len());
        for field in self.fields.drain(..) {
            if !field.asterisk {
                expanded.push(field);
                continue;
            }
            let table_indices: Vec<usize> = match &field.qualifier {
                Some(qualifier) => self
                    .tables
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.matches(qualifier))
                    .map(|(i, _)| i)
                    .collect(),
                None => (0..self.tables.len()).collect(),
            };
            let mut any_missing = false;
            for table_index in &table_indices {
                match &self.tables[*table_index].columns {
                    Some(columns) => {
                        for column in &columns.columns {
                            expanded.push(FieldInfo {
                                name: column.name.clone(),
                                table: Some(*table_index),
                                column: Some(column.clone()),
                                updatable: self.tables[*table_index].updatable,
                                ..FieldInfo::default()
                            });
                        }
                    }
                    None => any_missing = true,
                }
            }
            if any_missing || table_indices.is_empty() {
                // Cannot expand yet, keep the star and stay pending.
                expanded.push(field);
            }
        }
        self.fields = expanded;
        self.pending_stars = self.fields.iter().any(|f| f.asterisk);
    }

    /// Resolves dotted field qualifiers against table aliases, then table names. An ambiguous
    /// resolution marks the statement not parsable.
    pub fn resolve_fields(&mut self) {
        for field in &mut self.fields {
            if field.asterisk || field.expr || field.func || field.quoted_literal
                || field.numeric_literal
            {
                continue;
            }
            let matching: Vec<usize> = match &field.qualifier {
                Some(qualifier) => self
                    .tables
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.matches(qualifier))
                    .map(|(i, _)| i)
                    .collect(),
                None => {
                    if self.tables.len() == 1 {
                        vec![0]
                    } else {
                        // Unqualified column over a join, resolved by the catalog columns when
                        // available.
                        self.tables
                            .iter()
                            .enumerate()
                            .filter(|(_, t)| {
                                t.columns
                                    .as_ref()
                                    .is_some_and(|c| c.by_name(&field.name).is_some())
                            })
                            .map(|(i, _)| i)
                            .collect()
                    }
                }
            };
            match matching.as_slice() {
                [single] => field.table = Some(*single),
                [] => (),
                _ => {
                    self.parse_complete = false;
                    return;
                }
            }
            if let Some(table) = field.table {
                if let Some(columns) = &self.tables[table].columns {
                    if let Some(column) = columns.by_name(&field.name) {
                        field.column = Some(column.clone());
                        field.updatable = self.tables[table].updatable;
                    }
                }
            }
        }
    }
}

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count", "sum", "avg", "min", "max", "variance", "stddev",
];

/// One lexical token of the statement text.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Bare or quoted identifier (or keyword, the tokenizer does not distinguish).
    Ident { text: String, quoted: bool },
    Number(String),
    /// Single quoted or dollar quoted literal, quotes stripped.
    StringLiteral(String),
    /// Placeholder `?`.
    Param,
    Symbol(char),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Ident { text, quoted: false } if text.eq_ignore_ascii_case(keyword))
    }
}

/// Single pass tokenizer over statement text. Honours quoted identifiers, string literals with
/// the session's escape rules, dollar quoting and comments.
pub struct Tokenizer<'a> {
    text: &'a [u8],
    pos: usize,
    /// Captured `standard_conforming_strings` setting: with it off, a backslash escapes inside
    /// single quoted literals.
    std_strings: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(text: &'a str, std_strings: bool) -> Self {
        Tokenizer {
            text: text.as_bytes(),
            pos: 0,
            std_strings,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.pos += 1;
                }
                Some(b'-') if self.text.get(self.pos + 1) == Some(&b'-') => {
                    while let Some(b) = self.bump() {
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                Some(b'/') if self.text.get(self.pos + 1) == Some(&b'*') => {
                    self.pos += 2;
                    while self.pos < self.text.len() {
                        if self.text[self.pos] == b'*'
                            && self.text.get(self.pos + 1) == Some(&b'/')
                        {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    /// Next token, `None` at the end of the text.
    pub fn next_token(&mut self) -> Option<Token> {
        self.skip_whitespace_and_comments();
        let byte = self.peek()?;
        match byte {
            b'"' => Some(self.read_quoted_identifier()),
            b'\'' => Some(self.read_string_literal(self.std_strings)),
            b'$' => self.read_dollar_or_symbol(),
            b'?' => {
                self.pos += 1;
                Some(Token::Param)
            }
            b'E' | b'e'
                if self.text.get(self.pos + 1) == Some(&b'\'') =>
            {
                self.pos += 1;
                // E'...' literals always use backslash escapes.
                Some(self.read_string_literal(false))
            }
            _ if byte == b'_' || byte.is_ascii_alphabetic() || byte >= 0x80 => {
                Some(self.read_identifier())
            }
            _ if byte.is_ascii_digit() => Some(self.read_number()),
            _ => {
                self.pos += 1;
                Some(Token::Symbol(byte as char))
            }
        }
    }

    fn read_identifier(&mut self) -> Token {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'_' || b == b'$' || b.is_ascii_alphanumeric() || b >= 0x80 {
                self.pos += 1;
            } else {
                break;
            }
        }
        Token::Ident {
            text: String::from_utf8_lossy(&self.text[start..self.pos]).into_owned(),
            quoted: false,
        }
    }

    fn read_quoted_identifier(&mut self) -> Token {
        self.pos += 1;
        let mut text = String::new();
        while let Some(b) = self.bump() {
            if b == b'"' {
                if self.peek() == Some(b'"') {
                    text.push('"');
                    self.pos += 1;
                } else {
                    break;
                }
            } else {
                text.push(b as char);
            }
        }
        Token::Ident { text, quoted: true }
    }

    fn read_string_literal(&mut self, std_strings: bool) -> Token {
        self.pos += 1;
        let mut text = String::new();
        while let Some(b) = self.bump() {
            match b {
                b'\'' => {
                    if self.peek() == Some(b'\'') {
                        text.push('\'');
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                b'\\' if !std_strings => {
                    if let Some(escaped) = self.bump() {
                        text.push(escaped as char);
                    }
                }
                other => text.push(other as char),
            }
        }
        Token::StringLiteral(text)
    }

    fn read_dollar_or_symbol(&mut self) -> Option<Token> {
        // A dollar quote is `$tag$` where tag is a possibly empty identifier.
        let start = self.pos;
        self.pos += 1;
        let tag_start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'_' || b.is_ascii_alphanumeric() {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.peek() != Some(b'$') {
            // Not a dollar quote after all, e.g. a positional parameter `$1`.
            self.pos = start + 1;
            return Some(Token::Symbol('$'));
        }
        let tag = self.text[tag_start..self.pos].to_vec();
        self.pos += 1;
        // The literal runs until `$tag$` repeats. Placeholders inside must not be scanned.
        let mut closing = Vec::with_capacity(tag.len() + 2);
        closing.push(b'$');
        closing.extend_from_slice(&tag);
        closing.push(b'$');
        let body_start = self.pos;
        while self.pos < self.text.len() {
            if self.text[self.pos..].starts_with(&closing) {
                let body = &self.text[body_start..self.pos];
                self.pos += closing.len();
                return Some(Token::StringLiteral(
                    String::from_utf8_lossy(body).into_owned(),
                ));
            }
            self.pos += 1;
        }
        Some(Token::StringLiteral(
            String::from_utf8_lossy(&self.text[body_start..]).into_owned(),
        ))
    }

    fn read_number(&mut self) -> Token {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || b == b'.' || b == b'e' || b == b'E' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Token::Number(String::from_utf8_lossy(&self.text[start..self.pos]).into_owned())
    }
}

/// Parses `sql` into target list, FROM list and statement classification.
pub fn parse_statement(sql: &str, std_strings: bool) -> ParsedStatement {
    let kind = StatementKind::of(sql);
    let mut parsed = ParsedStatement {
        kind,
        ..ParsedStatement::default()
    };
    if kind != StatementKind::Select {
        return parsed;
    }

    let mut tokenizer = Tokenizer::new(sql, std_strings);
    let mut tokens = Vec::new();
    while let Some(token) = tokenizer.next_token() {
        tokens.push(token);
    }

    let mut cursor = 0;
    // Leading SELECT, bail out on `WITH` since the target list does not follow immediately.
    if !tokens.first().is_some_and(|t| t.is_keyword("select")) {
        return parsed;
    }
    cursor += 1;
    if tokens.get(cursor).is_some_and(|t| t.is_keyword("distinct")) {
        parsed.has_aggregates = true;
        cursor += 1;
    }
    if tokens.get(cursor).is_some_and(|t| t.is_keyword("all")) {
        cursor += 1;
    }

    let target_end = parse_target_list(&tokens, cursor, &mut parsed);
    let mut cursor = target_end;

    if tokens.get(cursor).is_some_and(|t| t.is_keyword("into")) {
        parsed.select_into = true;
        // Skip the created table name (possibly schema qualified).
        cursor += 1;
        while cursor < tokens.len() && !tokens[cursor].is_keyword("from") {
            cursor += 1;
        }
    }
    if tokens.get(cursor).is_some_and(|t| t.is_keyword("from")) {
        cursor = parse_from_list(&tokens, cursor + 1, &mut parsed);
        parsed.parse_complete = !parsed.tables.is_empty();
    }
    // Scan the remainder for FOR UPDATE at depth zero.
    let mut depth = 0i32;
    while cursor < tokens.len() {
        match &tokens[cursor] {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => depth -= 1,
            token if depth == 0 && token.is_keyword("for") => {
                if tokens.get(cursor + 1).is_some_and(|t| {
                    t.is_keyword("update") || t.is_keyword("share")
                }) {
                    parsed.for_update = true;
                }
            }
            token if depth == 0
                && (token.is_keyword("union")
                    || token.is_keyword("intersect")
                    || token.is_keyword("except")) =>
            {
                // Set operations defeat single table analysis.
                parsed.parse_complete = false;
                parsed.has_aggregates = true;
            }
            _ => (),
        }
        cursor += 1;
    }

    if parsed
        .fields
        .iter()
        .any(|f| f.func && is_aggregate_function(&f.name))
    {
        parsed.has_aggregates = true;
    }
    parsed.pending_stars = parsed.fields.iter().any(|f| f.asterisk);
    for table in &mut parsed.tables {
        table.updatable = true;
    }
    if parsed.tables.len() != 1 {
        for table in &mut parsed.tables {
            table.updatable = false;
        }
    }
    parsed.resolve_fields();
    parsed
}

/// Parses the items between SELECT and FROM/INTO. Returns the index of the terminating keyword.
fn parse_target_list(tokens: &[Token], mut cursor: usize, parsed: &mut ParsedStatement) -> usize {
    let mut item: Vec<&Token> = Vec::new();
    let mut depth = 0i32;
    loop {
        let terminal = cursor >= tokens.len()
            || (depth == 0
                && (tokens[cursor].is_keyword("from") || tokens[cursor].is_keyword("into")));
        let comma = !terminal && depth == 0 && tokens[cursor] == Token::Symbol(',');
        if terminal || comma {
            if !item.is_empty() {
                parsed.fields.push(classify_target_item(&item));
            }
            item.clear();
            if terminal {
                return cursor;
            }
            cursor += 1;
            continue;
        }
        match &tokens[cursor] {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => depth -= 1,
            _ => (),
        }
        item.push(&tokens[cursor]);
        cursor += 1;
    }
}

fn classify_target_item(item: &[&Token]) -> FieldInfo {
    let mut field = FieldInfo::default();

    // Split off a trailing alias: `AS alias`, or a bare trailing identifier directly behind a
    // column reference, literal or closing parenthesis.
    let mut core = item;
    if item.len() >= 2 {
        if let Token::Ident { text, .. } = item[item.len() - 1] {
            let before = item[item.len() - 2];
            if before.is_keyword("as") {
                field.alias = Some(text.clone());
                core = &item[..item.len() - 2];
            } else if matches!(
                before,
                Token::Ident { .. }
                    | Token::Number(_)
                    | Token::StringLiteral(_)
                    | Token::Symbol(')')
            ) {
                field.alias = Some(text.clone());
                core = &item[..item.len() - 1];
            }
        }
    }

    match core {
        [Token::Symbol('*')] => {
            field.asterisk = true;
            field.name = "*".to_string();
        }
        [Token::Ident { text, .. }, Token::Symbol('.'), Token::Symbol('*')] => {
            field.asterisk = true;
            field.qualifier = Some(text.clone());
            field.name = "*".to_string();
        }
        [Token::Ident { text, .. }] => {
            field.name = text.clone();
        }
        [Token::Ident { text: table, .. }, Token::Symbol('.'), Token::Ident { text: column, .. }] =>
        {
            field.qualifier = Some(table.clone());
            field.name = column.clone();
        }
        [Token::Number(text)] => {
            field.numeric_literal = true;
            field.name = text.clone();
        }
        [Token::StringLiteral(text)] => {
            field.quoted_literal = true;
            field.name = text.clone();
        }
        [Token::Ident { text, quoted: false }, Token::Symbol('('), ..] => {
            field.func = true;
            field.name = text.clone();
        }
        _ => {
            field.expr = true;
            field.name = item_text(core);
        }
    }
    field
}

fn item_text(tokens: &[&Token]) -> String {
    let mut text = String::new();
    for token in tokens {
        if !text.is_empty() {
            text.push(' ');
        }
        match token {
            Token::Ident { text: t, .. } => text.push_str(t),
            Token::Number(t) => text.push_str(t),
            Token::StringLiteral(t) => text.push_str(t),
            Token::Param => text.push('?'),
            Token::Symbol(c) => text.push(*c),
        }
    }
    text
}

const FROM_TERMINATORS: &[&str] = &[
    "where", "order", "group", "having", "union", "intersect", "except", "for", "limit", "offset",
    "fetch",
];

const JOIN_KEYWORDS: &[&str] = &[
    "inner", "outer", "left", "right", "full", "cross", "join", "natural",
];

/// Parses the FROM list into table infos. Subqueries in FROM defeat the parse.
fn parse_from_list(tokens: &[Token], mut cursor: usize, parsed: &mut ParsedStatement) -> usize {
    loop {
        // One table reference: [schema .] name [AS] [alias]
        match tokens.get(cursor) {
            Some(Token::Ident { text, .. }) => {
                let mut table = TableInfo {
                    name: text.clone(),
                    ..TableInfo::default()
                };
                cursor += 1;
                if tokens.get(cursor) == Some(&Token::Symbol('.')) {
                    if let Some(Token::Ident { text: name, .. }) = tokens.get(cursor + 1) {
                        table.schema = Some(table.name.clone());
                        table.name = name.clone();
                        cursor += 2;
                    }
                }
                if tokens.get(cursor).is_some_and(|t| t.is_keyword("as")) {
                    cursor += 1;
                }
                if let Some(Token::Ident { text: alias, quoted }) = tokens.get(cursor) {
                    let lowered = alias.to_ascii_lowercase();
                    let reserved = !*quoted
                        && (FROM_TERMINATORS.contains(&lowered.as_str())
                            || JOIN_KEYWORDS.contains(&lowered.as_str())
                            || lowered == "on");
                    if !reserved {
                        table.alias = Some(alias.clone());
                        cursor += 1;
                    }
                }
                parsed.tables.push(table);
            }
            Some(Token::Symbol('(')) => {
                // Derived table, not parsable for updatability purposes.
                parsed.parse_complete = false;
                parsed.has_aggregates = true;
                let mut depth = 0i32;
                while cursor < tokens.len() {
                    match &tokens[cursor] {
                        Token::Symbol('(') => depth += 1,
                        Token::Symbol(')') => {
                            depth -= 1;
                            if depth == 0 {
                                cursor += 1;
                                break;
                            }
                        }
                        _ => (),
                    }
                    cursor += 1;
                }
            }
            _ => return cursor,
        }

        // Skip join connectives and their ON condition up to the next table reference.
        loop {
            match tokens.get(cursor) {
                Some(Token::Symbol(',')) => {
                    cursor += 1;
                    break;
                }
                Some(token) if JOIN_KEYWORDS.iter().any(|&k| token.is_keyword(k)) => {
                    let introduces_table = token.is_keyword("join");
                    cursor += 1;
                    if introduces_table {
                        break;
                    }
                }
                Some(token) if token.is_keyword("on") => {
                    // Balanced skip until the next join keyword, comma or clause terminator.
                    cursor += 1;
                    let mut depth = 0i32;
                    while let Some(token) = tokens.get(cursor) {
                        match token {
                            Token::Symbol('(') => depth += 1,
                            Token::Symbol(')') => depth -= 1,
                            Token::Symbol(',') if depth == 0 => break,
                            t if depth == 0
                                && (JOIN_KEYWORDS.iter().any(|&k| t.is_keyword(k))
                                    || FROM_TERMINATORS
                                        .iter()
                                        .any(|&k| t.is_keyword(k))) =>
                            {
                                break;
                            }
                            _ => (),
                        }
                        cursor += 1;
                    }
                }
                Some(token)
                    if FROM_TERMINATORS.iter().any(|&k| token.is_keyword(k)) =>
                {
                    return cursor;
                }
                _ => return cursor,
            }
        }
    }
}

/// `true` when `name` is an aggregate at the outer nesting level of a target item.
pub fn is_aggregate_function(name: &str) -> bool {
    AGGREGATE_FUNCTIONS
        .iter()
        .any(|&a| name.eq_ignore_ascii_case(a))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_statement_kinds() {
        assert_eq!(StatementKind::Select, StatementKind::of("SELECT 1"));
        assert_eq!(StatementKind::Select, StatementKind::of("  with t as (select 1) select * from t"));
        assert_eq!(StatementKind::Insert, StatementKind::of("insert into t values (1)"));
        assert_eq!(StatementKind::Transaction, StatementKind::of("ROLLBACK"));
        assert_eq!(StatementKind::ProcCall, StatementKind::of("{call f(?)}"));
        assert_eq!(StatementKind::Other, StatementKind::of("TRUNCATE t"));
    }

    #[test]
    fn simple_select_fields_and_table() {
        let parsed = parse_statement("SELECT id, s FROM t ORDER BY id", true);
        assert!(parsed.parse_complete);
        assert_eq!(2, parsed.fields.len());
        assert_eq!("id", parsed.fields[0].name);
        assert_eq!("s", parsed.fields[1].name);
        assert_eq!(1, parsed.tables.len());
        assert_eq!("t", parsed.tables[0].name);
        assert!(parsed.updatable());
    }

    #[test]
    fn aliases_and_qualifiers() {
        let parsed = parse_statement(
            "SELECT a.id AS key, a.name nm FROM accounts AS a WHERE a.id > 0",
            true,
        );
        assert_eq!("key", parsed.fields[0].reported_name());
        assert_eq!(Some("a".to_string()), parsed.fields[0].qualifier);
        assert_eq!("nm", parsed.fields[1].reported_name());
        assert_eq!(Some("a".to_string()), parsed.tables[0].alias);
        assert_eq!(Some(0), parsed.fields[0].table);
    }

    #[test]
    fn schema_qualified_table() {
        let parsed = parse_statement("SELECT id FROM public.t", true);
        assert_eq!(Some("public".to_string()), parsed.tables[0].schema);
        assert_eq!("t", parsed.tables[0].name);
        assert_eq!("\"public\".\"t\"", parsed.tables[0].qualified_name());
    }

    #[test]
    fn join_collects_both_tables_and_drops_updatability() {
        let parsed = parse_statement(
            "SELECT a.x, b.y FROM a INNER JOIN b ON a.id = b.id WHERE b.y > 1",
            true,
        );
        assert_eq!(2, parsed.tables.len());
        assert!(!parsed.updatable());
    }

    #[test]
    fn aggregates_disable_updatability() {
        let parsed = parse_statement("SELECT count(*) FROM t", true);
        assert!(parsed.fields[0].func);
        assert!(is_aggregate_function(&parsed.fields[0].name));
    }

    #[test]
    fn select_into_is_detected() {
        let parsed = parse_statement("SELECT id INTO t2 FROM t", true);
        assert!(parsed.select_into);
        assert!(!parsed.updatable());
        assert_eq!(1, parsed.tables.len());
    }

    #[test]
    fn for_update_is_detected() {
        let parsed = parse_statement("SELECT id FROM t FOR UPDATE", true);
        assert!(parsed.for_update);
    }

    #[test]
    fn union_defeats_single_table_analysis() {
        let parsed = parse_statement("SELECT id FROM a UNION SELECT id FROM b", true);
        assert!(!parsed.updatable());
    }

    #[test]
    fn literals_in_target_list() {
        let parsed = parse_statement("SELECT 'lit', 42, id FROM t", true);
        assert!(parsed.fields[0].quoted_literal);
        assert!(parsed.fields[1].numeric_literal);
        assert!(!parsed.fields[2].expr);
    }

    #[test]
    fn question_mark_inside_literal_is_not_a_param() {
        let mut tokenizer = Tokenizer::new("SELECT 'it''s ?', ?", true);
        let mut params = 0;
        while let Some(token) = tokenizer.next_token() {
            if token == Token::Param {
                params += 1;
            }
        }
        assert_eq!(1, params);
    }

    #[test]
    fn dollar_quotes_hide_their_body() {
        let mut tokenizer = Tokenizer::new("SELECT $tag$ a ? ' b $tag$, ?", true);
        let mut tokens = Vec::new();
        while let Some(token) = tokenizer.next_token() {
            tokens.push(token);
        }
        assert_eq!(1, tokens.iter().filter(|t| **t == Token::Param).count());
        assert!(tokens
            .iter()
            .any(|t| matches!(t, Token::StringLiteral(body) if body.contains('?'))));
    }

    #[test]
    fn backslash_escape_depends_on_setting() {
        let mut conforming = Tokenizer::new(r"'a\' , '", true);
        // With standard strings the backslash is data and the literal closes at the second quote.
        assert_eq!(
            Some(Token::StringLiteral(r"a\".to_string())),
            conforming.next_token()
        );
        let mut legacy = Tokenizer::new(r"'a\' , '", false);
        // Without, the backslash escapes the quote and the literal runs to the end.
        assert_eq!(
            Some(Token::StringLiteral("a' , ".to_string())),
            legacy.next_token()
        );
    }

    #[test]
    fn star_expansion_shifts_following_fields() {
        let mut parsed = parse_statement("SELECT *, id FROM t", true);
        assert!(parsed.pending_stars);
        parsed.tables[0].columns = Some(Arc::new(TableColumns {
            relid: 1000,
            columns: vec![
                ColumnMeta {
                    name: "id".into(),
                    type_oid: crate::types::PG_TYPE_INT4,
                    typmod: -1,
                    not_null: true,
                    attnum: 1,
                },
                ColumnMeta {
                    name: "s".into(),
                    type_oid: crate::types::PG_TYPE_TEXT,
                    typmod: -1,
                    not_null: false,
                    attnum: 2,
                },
            ],
            has_oids: false,
        }));
        parsed.expand_stars();
        assert!(!parsed.pending_stars);
        let names: Vec<&str> = parsed.fields.iter().map(|f| f.reported_name()).collect();
        assert_eq!(vec!["id", "s", "id"], names);
    }
}
