//! Per statement state.
//!
//! A statement belongs to one connection and owns its SQL text, the parsed metadata, the bound
//! parameters, the result chain and the cursor position. Statements live in the connection's
//! registry and are addressed by [`StatementId`]; they may be reused after a close and are only
//! destroyed when not executing.

use crate::client::Oid;
use crate::convert::{BoundValue, PartialReads};
use crate::error::Diagnostics;
use crate::parse::ParsedStatement;
use crate::query_result::QueryResult;
use crate::types::CDataType;

/// Index of a statement within its connection's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatementId(pub usize);

/// Scrollability contract requested by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorType {
    #[default]
    ForwardOnly,
    Static,
    KeysetDriven,
    /// Keyset driven with lower membership guarantees.
    Dynamic,
}

impl CursorType {
    pub fn scrollable(self) -> bool {
        self != CursorType::ForwardOnly
    }
}

/// Concurrency contract requested by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    #[default]
    ReadOnly,
    /// Optimistic concurrency over the row version (ctid).
    RowVersion,
}

/// Statement level options, set before execution.
#[derive(Debug, Clone)]
pub struct StatementOptions {
    pub cursor_type: CursorType,
    pub concurrency: Concurrency,
    /// Rows delivered per fetch call.
    pub rowset_size: usize,
    /// Upper bound of rows kept in the cache, as a multiple of the rowset size.
    pub cache_size: usize,
    /// 0 means unlimited.
    pub max_rows: usize,
    /// Maximum length delivered for one character or binary column, 0 means unlimited.
    pub max_length: usize,
    pub use_bookmarks: bool,
    pub retrieve_data: bool,
    /// Keep the server cursor open across commits.
    pub with_hold: bool,
}

impl Default for StatementOptions {
    fn default() -> Self {
        StatementOptions {
            cursor_type: CursorType::default(),
            concurrency: Concurrency::default(),
            rowset_size: 1,
            cache_size: 100,
            max_rows: 0,
            max_length: 0,
            use_bookmarks: false,
            retrieve_data: true,
            with_hold: false,
        }
    }
}

/// Where the value of one bound parameter comes from.
#[derive(Debug, Clone)]
pub enum ParamSource {
    /// Bound buffer, read out at execute time.
    Value(BoundValue),
    /// Supplied chunk by chunk through the putdata loop after execution started.
    DataAtExec {
        /// Accumulated putdata bytes, `None` until the first chunk arrived.
        buffer: Option<Vec<u8>>,
        /// Bytes are character data (subject to line feed conversion) or binary.
        binary: bool,
    },
}

/// One bound parameter, by one based parameter number.
#[derive(Debug, Clone)]
pub struct ParamBinding {
    pub c_type: CDataType,
    pub source: ParamSource,
    /// Declared precision and scale for exact numerics.
    pub precision: Option<usize>,
    pub scale: Option<i16>,
    /// Spool the value into a large object and substitute its oid.
    pub large_object: bool,
    /// Large object oid once the value has been spooled.
    pub lo_oid: Option<Oid>,
}

impl ParamBinding {
    pub fn value(value: BoundValue) -> Self {
        ParamBinding {
            c_type: CDataType::Default,
            source: ParamSource::Value(value),
            precision: None,
            scale: None,
            large_object: false,
            lo_oid: None,
        }
    }

    pub fn data_at_exec(binary: bool) -> Self {
        ParamBinding {
            c_type: CDataType::Default,
            source: ParamSource::DataAtExec {
                buffer: None,
                binary,
            },
            precision: None,
            scale: None,
            large_object: false,
            lo_oid: None,
        }
    }
}

/// Result column binding for row wise delivery.
#[derive(Debug, Clone)]
pub struct ColumnBinding {
    pub c_type: CDataType,
    /// Capacity of the application buffer in bytes.
    pub buffer_length: usize,
}

/// Lifecycle of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StmtStatus {
    #[default]
    Allocated,
    /// SQL text set, not yet executed.
    Ready,
    /// A dispatch is in flight. The statement refuses destruction in this state.
    Executing,
    /// Results are present.
    Finished,
}

/// See the module documentation.
#[derive(Debug, Default)]
pub struct Statement {
    pub id: StatementId,
    pub sql: Option<String>,
    pub parsed: Option<ParsedStatement>,
    pub options: StatementOptions,
    /// Bound parameters, slot 0 holds parameter number 1.
    params: Vec<Option<ParamBinding>>,
    /// Result column bindings, slot 0 holds column number 1.
    bindings: Vec<Option<ColumnBinding>>,
    pub result: Option<QueryResult>,
    /// Absolute row just past the application's position, -1 before the first row.
    pub curr_tuple: i64,
    /// Absolute row of the first row of the current rowset.
    pub rowset_start: i64,
    /// Rows delivered by the last fetch.
    pub last_fetch_count: usize,
    /// Same, but counting rows skipped because they were marked deleted.
    pub last_fetch_count_including_omitted: usize,
    cursor_name: Option<String>,
    /// Set when the driver generated the cursor name rather than the application.
    pub generated_cursor_name: bool,
    /// Server side plan name when `use_server_side_prepare` is active.
    pub plan_name: Option<String>,
    pub status: StmtStatus,
    /// Trailing hidden columns carrying the keyset projection of the running cursor.
    pub hidden_keyset_columns: usize,
    /// Absolute indexes of the rows delivered by the last fetch, in rowset order.
    pub rowset_rows: Vec<i64>,
    pub cursor_open: bool,
    /// The cursor survived a commit probe and persists beyond transaction ends.
    pub cursor_permanent: bool,
    /// A rollback may have moved the server cursor, positions are unreliable.
    pub cursor_doubtful: bool,
    pub updatable: bool,
    /// Parameter number currently collecting putdata chunks.
    pub current_exec_param: Option<usize>,
    /// Rowset position the last piecewise read targeted; moving to another row resets the reads.
    pub last_get_data_row: Option<usize>,
    pub partial_reads: PartialReads,
    /// Error slot of the statement. Connection level errors are copied in on failure.
    pub error: Option<Diagnostics>,
}

impl Statement {
    pub fn new(id: StatementId) -> Self {
        Statement {
            id,
            ..Statement::default()
        }
    }

    /// Binds `sql` and resets everything derived from a previous text.
    pub fn set_sql(&mut self, sql: impl Into<String>) {
        self.sql = Some(sql.into());
        self.parsed = None;
        self.result = None;
        self.status = StmtStatus::Ready;
        self.curr_tuple = -1;
        self.rowset_start = 0;
        self.last_fetch_count = 0;
        self.last_fetch_count_including_omitted = 0;
        self.partial_reads.reset();
    }

    /// Binds a parameter by one based number, growing the parameter array as needed.
    pub fn bind_param(&mut self, number: usize, binding: ParamBinding) {
        debug_assert!(number >= 1);
        if self.params.len() < number {
            self.params.resize_with(number, || None);
        }
        self.params[number - 1] = Some(binding);
    }

    pub fn param(&self, number: usize) -> Option<&ParamBinding> {
        self.params.get(number.checked_sub(1)?)?.as_ref()
    }

    pub fn param_mut(&mut self, number: usize) -> Option<&mut ParamBinding> {
        self.params.get_mut(number.checked_sub(1)?)?.as_mut()
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn unbind_params(&mut self) {
        self.params.clear();
    }

    /// Resolves the bound parameters into substitution values. Data at execution parameters must
    /// have collected their buffers; the first one which has not is reported through
    /// `NeedsData`.
    pub fn substitution_values(&self) -> Result<Vec<BoundValue>, NeedsData> {
        let mut values = Vec::with_capacity(self.params.len());
        for (index, binding) in self.params.iter().enumerate() {
            match binding {
                None => values.push(BoundValue::Null),
                Some(binding) => match (&binding.source, binding.lo_oid) {
                    // A spooled large object substitutes its oid.
                    (_, Some(oid)) => values.push(BoundValue::BigInt(i64::from(oid))),
                    (ParamSource::Value(value), None) => values.push(value.clone()),
                    (ParamSource::DataAtExec { buffer, binary }, None) => match buffer {
                        None => return Err(NeedsData { param: index + 1 }),
                        Some(bytes) if *binary => values.push(BoundValue::Binary(bytes.clone())),
                        Some(bytes) => values.push(BoundValue::Char(bytes.clone())),
                    },
                },
            }
        }
        Ok(values)
    }

    /// Appends one putdata chunk to the parameter currently collecting data.
    pub fn put_data(&mut self, param: usize, chunk: &[u8]) -> bool {
        let Some(binding) = self.param_mut(param) else {
            return false;
        };
        match &mut binding.source {
            ParamSource::DataAtExec { buffer, .. } => {
                buffer.get_or_insert_with(Vec::new).extend_from_slice(chunk);
                true
            }
            ParamSource::Value(_) => false,
        }
    }

    pub fn bind_column(&mut self, number: usize, binding: Option<ColumnBinding>) {
        debug_assert!(number >= 1);
        if self.bindings.len() < number {
            self.bindings.resize_with(number, || None);
        }
        self.bindings[number - 1] = binding;
    }

    pub fn column_binding(&self, number: usize) -> Option<&ColumnBinding> {
        self.bindings.get(number.checked_sub(1)?)?.as_ref()
    }

    /// Cursor name, generating the `SQL_CUR...` default on first use.
    pub fn cursor_name(&mut self) -> &str {
        if self.cursor_name.is_none() {
            self.cursor_name = Some(format!("SQL_CUR{:x}", self.id.0 + 1));
            self.generated_cursor_name = true;
        }
        self.cursor_name.as_deref().expect("just set")
    }

    pub fn set_cursor_name(&mut self, name: impl Into<String>) {
        self.cursor_name = Some(name.into());
        self.generated_cursor_name = false;
    }

    /// Closes the cursor and drops the results, the statement stays allocated for reuse.
    pub fn close(&mut self) {
        self.result = None;
        self.status = if self.sql.is_some() {
            StmtStatus::Ready
        } else {
            StmtStatus::Allocated
        };
        self.cursor_open = false;
        self.cursor_permanent = false;
        self.cursor_doubtful = false;
        self.curr_tuple = -1;
        self.rowset_start = 0;
        self.last_fetch_count = 0;
        self.last_fetch_count_including_omitted = 0;
        self.hidden_keyset_columns = 0;
        self.rowset_rows.clear();
        self.current_exec_param = None;
        self.last_get_data_row = None;
        self.partial_reads.reset();
        for param in self.params.iter_mut().flatten() {
            if let ParamSource::DataAtExec { buffer, .. } = &mut param.source {
                *buffer = None;
            }
            param.lo_oid = None;
        }
    }

    /// `true` when the statement runs a server side cursor which is still open.
    pub fn has_open_cursor(&self) -> bool {
        self.cursor_open
    }
}

/// Execution cannot proceed before the application supplies putdata bytes for `param`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedsData {
    /// One based parameter number.
    pub param: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_one_based() {
        let mut stmt = Statement::new(StatementId(0));
        stmt.bind_param(2, ParamBinding::value(BoundValue::Int(7)));
        assert!(stmt.param(1).is_none());
        assert!(stmt.param(2).is_some());
        assert_eq!(2, stmt.num_params());
    }

    #[test]
    fn unbound_param_slot_substitutes_null() {
        let mut stmt = Statement::new(StatementId(0));
        stmt.bind_param(2, ParamBinding::value(BoundValue::Int(7)));
        let values = stmt.substitution_values().unwrap();
        assert_eq!(vec![BoundValue::Null, BoundValue::Int(7)], values);
    }

    #[test]
    fn data_at_exec_needs_putdata_first() {
        let mut stmt = Statement::new(StatementId(0));
        stmt.bind_param(1, ParamBinding::data_at_exec(false));
        assert_eq!(Err(NeedsData { param: 1 }), stmt.substitution_values());
        assert!(stmt.put_data(1, b"he"));
        assert!(stmt.put_data(1, b"llo"));
        assert_eq!(
            vec![BoundValue::Char(b"hello".to_vec())],
            stmt.substitution_values().unwrap()
        );
    }

    #[test]
    fn generated_cursor_name_is_stable() {
        let mut stmt = Statement::new(StatementId(4));
        let name = stmt.cursor_name().to_string();
        assert!(name.starts_with("SQL_CUR"));
        assert_eq!(name, stmt.cursor_name());
        assert!(stmt.generated_cursor_name);
        stmt.set_cursor_name("my_cursor");
        assert_eq!("my_cursor", stmt.cursor_name());
        assert!(!stmt.generated_cursor_name);
    }

    #[test]
    fn close_keeps_text_and_bindings() {
        let mut stmt = Statement::new(StatementId(0));
        stmt.set_sql("SELECT 1");
        stmt.bind_param(1, ParamBinding::value(BoundValue::Int(1)));
        stmt.status = StmtStatus::Finished;
        stmt.close();
        assert_eq!(StmtStatus::Ready, stmt.status);
        assert!(stmt.sql.is_some());
        assert_eq!(1, stmt.num_params());
    }
}
