//! Connection manager and query executor.
//!
//! A [`Connection`] owns the wire client session, the transaction phase, the statement registry
//! and the per table column cache. [`ConnCore::send_query`] is the central dispatch path: it
//! builds the transaction prologue, drains the result stream, interprets command tags, attributes
//! notices and reconciles the transaction phase with what the client library reports. The phase
//! is never guessed from command text alone.

use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, warn};

use crate::client::{
    ExecStatus, Format, LibraryError, Notice, SessionStatus, WireClient, WireParam, WireResult,
    WireTransactionStatus,
};
use crate::encoding::Charset;
use crate::error::{Diagnostics, Error, State};
use crate::options::{ConnectOptions, RollbackOnError};
use crate::parse::{ColumnMeta, RowIdentifier, TableColumns};
use crate::query_result::{ColumnDesc, KeySet, QueryResult, ResultStatus};
use crate::statement::{Statement, StatementId, StmtStatus};
use crate::types::{strip_typmod_header, TypeMap, TypePresentation};

/// Transaction phase of a connection. Mirrors the client library's report after every dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionPhase {
    #[default]
    NotInTransaction,
    InTransactionOk,
    InTransactionError,
    /// Terminal, the session is gone. Requires a reconnect.
    ConnectionDown,
}

impl TransactionPhase {
    pub fn in_transaction(self) -> bool {
        matches!(
            self,
            TransactionPhase::InTransactionOk | TransactionPhase::InTransactionError
        )
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnStatus {
    #[default]
    NotConnected,
    Connected,
    Executing,
}

bitflags! {
    /// Dispatch behaviour requested by the caller of [`ConnCore::send_query`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryFlags: u16 {
        /// Open a transaction first when none is open.
        const GO_INTO_TRANSACTION = 0x01;
        /// Wrap the query in a per query savepoint when the connect options ask for statement
        /// level recovery.
        const ROLLBACK_ON_ERROR   = 0x02;
        /// Dispatch even while the transaction is in error, e.g. for the rollback itself.
        const IGNORE_ABORT_ON_CONN = 0x04;
        /// Dispatch the prologue as a separate round trip instead of prefixing it.
        const IGNORE_ROUND_TRIP   = 0x08;
    }
}

/// Per dispatch context handed into [`ConnCore::send_query`] by the cursor engine.
#[derive(Debug, Default)]
pub struct QueryInfo {
    /// Reuse this result object instead of allocating one, the cache refill path.
    pub result_in: Option<QueryResult>,
    /// Decode the appended keyset projection into row locators.
    pub keyset: bool,
    /// Number of trailing hidden columns carrying the keyset projection (ctid, and oid when the
    /// table has them).
    pub hidden_columns: usize,
}

/// How the last transaction ended, decided from the drained command tags and the reported phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnEnd {
    Commit,
    Abort,
    /// A savepoint rollback recovered the transaction, it stays open.
    PartialRollback,
}

const SAVEPOINT_NAME: &str = "_per_query_svp_";
const STMT_INCREMENT: usize = 16;
const COL_CACHE_CAP: usize = 32;

/// Object whose server side cleanup had to be deferred because the transaction was in error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardObject {
    Plan(String),
    Cursor(String),
}

/// Transaction isolation requested by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Optional data transformation pair attached to a connection, the seam classic drivers fill by
/// loading a translation library. `to_server` runs over outgoing statement text, `from_server`
/// over delivered character data.
#[derive(Default)]
pub struct Translation {
    pub to_server: Option<Box<dyn Fn(&[u8]) -> Vec<u8> + Send>>,
    pub from_server: Option<Box<dyn Fn(&[u8]) -> Vec<u8> + Send>>,
}

/// Connection state below the statement registry. Split out so the cursor engine can borrow one
/// statement and the core disjointly.
pub struct ConnCore<C: WireClient> {
    client: Option<C>,
    pub status: ConnStatus,
    pub transact: TransactionPhase,
    pub autocommit: bool,
    pub opts: ConnectOptions,
    pub server_version: (u16, u16, u16),
    pub charset: Charset,
    pub max_bytes_per_char: u8,
    pub std_strings: bool,
    pub type_map: TypeMap,
    current_schema: Option<String>,
    discard: Vec<DiscardObject>,
    /// Error slot of the connection.
    pub error: Option<Diagnostics>,
    col_cache: Vec<(String, Arc<TableColumns>)>,
    /// Transaction end observed by the last dispatch, processed by the connection entry point.
    pending_txn_end: Option<TxnEnd>,
    /// A ROLLBACK tag has been seen, cursor positions may have moved.
    pub cursors_doubtful: bool,
    pub isolation: IsolationLevel,
    pub translation: Translation,
}

impl<C: WireClient> ConnCore<C> {
    pub(crate) fn client_mut(&mut self) -> Result<&mut C, Error> {
        match (&mut self.client, self.transact) {
            (_, TransactionPhase::ConnectionDown) | (None, _) => Err(Error::ConnectionDead(
                "no session, connect first".to_string(),
            )),
            (Some(client), _) => Ok(client),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some() && self.transact != TransactionPhase::ConnectionDown
    }

    pub fn set_error(&mut self, diagnostics: Diagnostics) {
        warn!("connection error: {diagnostics}");
        self.error = Some(diagnostics);
    }

    fn mark_dead(&mut self, why: &str) {
        warn!("marking connection dead: {why}");
        self.transact = TransactionPhase::ConnectionDown;
        self.status = ConnStatus::NotConnected;
    }

    /// `true` once the server is new enough for SAVEPOINT.
    fn supports_savepoints(&self) -> bool {
        self.server_version >= (8, 0, 0)
    }

    /// `true` once the server understands `RETURNING` on DML.
    pub fn supports_returning(&self) -> bool {
        self.server_version >= (8, 2, 0)
    }

    /// Queues `object` for cleanup at the next clean transaction boundary.
    pub fn mark_object_to_discard(&mut self, object: DiscardObject) {
        if !self.discard.contains(&object) {
            self.discard.push(object);
        }
    }

    /// Emits the deferred `DEALLOCATE`/`CLOSE` statements. Failures requeue the object.
    pub fn discard_marked_objects(&mut self) {
        let pending = std::mem::take(&mut self.discard);
        for object in pending {
            let sql = match &object {
                DiscardObject::Plan(name) => format!("DEALLOCATE \"{name}\""),
                DiscardObject::Cursor(name) => format!("CLOSE \"{name}\""),
            };
            match self.exec_unchecked(&sql) {
                Ok(_) => debug!("discarded {object:?}"),
                Err(err) => {
                    debug!("deferred discard of {object:?} failed again: {err}");
                    self.discard.push(object);
                }
            }
        }
    }

    /// Transaction end observed by the last dispatch. Cleared on read.
    pub fn take_pending_txn_end(&mut self) -> Option<TxnEnd> {
        self.pending_txn_end.take()
    }

    /// Dispatches an internal query and returns the raw wire result without status mapping.
    fn exec_unchecked(&mut self, sql: &str) -> Result<C::Result, Error> {
        let client = self.client_mut()?;
        match client.exec(sql) {
            Ok(result) => Ok(result),
            Err(err) => {
                if matches!(err, LibraryError::Io(_)) {
                    self.mark_dead("io error on internal query");
                }
                Err(err.into())
            }
        }
    }

    /// Dispatches an internal query, mapping a server reported error into the connection error
    /// slot and an [`Error::ServerError`].
    pub fn exec_checked(
        &mut self,
        sql: &str,
        function: &'static str,
    ) -> Result<C::Result, Error> {
        let result = self.exec_unchecked(sql)?;
        match result.status() {
            ExecStatus::FatalError | ExecStatus::BadResponse => {
                let diagnostics = diagnostics_of(&result, function);
                self.set_error(diagnostics.clone());
                self.reconcile_transaction(false, false);
                Err(Error::ServerError {
                    diagnostics,
                    function,
                })
            }
            _ => {
                self.reconcile_transaction(false, false);
                Ok(result)
            }
        }
    }

    /// The central dispatch path, see the module documentation and the steps in line.
    pub fn send_query(
        &mut self,
        sql: &str,
        flags: QueryFlags,
        info: QueryInfo,
    ) -> Result<QueryResult, Error> {
        if self.transact == TransactionPhase::InTransactionError
            && !flags.contains(QueryFlags::IGNORE_ABORT_ON_CONN)
        {
            return Err(Error::InFailedTransaction);
        }

        // Step 1: transaction prologue.
        let begin_needed = flags.contains(QueryFlags::GO_INTO_TRANSACTION)
            && !self.transact.in_transaction();
        let savepoint_needed = flags.contains(QueryFlags::ROLLBACK_ON_ERROR)
            && self.opts.rollback_on_error == RollbackOnError::Statement
            && self.supports_savepoints()
            && (self.transact.in_transaction() || begin_needed);

        let mut prologue = String::new();
        if begin_needed {
            prologue.push_str("BEGIN;");
        }
        if savepoint_needed {
            prologue.push_str(&format!("SAVEPOINT {SAVEPOINT_NAME};"));
        }

        let mut discard_next_begin = false;
        let mut discard_next_savepoint = false;
        let mut full = String::with_capacity(prologue.len() + sql.len() + 32);
        if prologue.is_empty() {
            full.push_str(sql);
        } else if flags.contains(QueryFlags::IGNORE_ROUND_TRIP) {
            // Dispatch the prologue on its own and let its results die here.
            let prologue_sql = prologue.trim_end_matches(';').to_string();
            self.exec_checked(&prologue_sql, "send_query")?;
            full.push_str(sql);
        } else {
            discard_next_begin = begin_needed;
            discard_next_savepoint = savepoint_needed;
            full.push_str(&prologue);
            full.push_str(sql);
        }
        if savepoint_needed {
            full.push_str(&format!(";RELEASE {SAVEPOINT_NAME}"));
        }

        // SET search_path invalidates the cached current schema. The command tag alone does not
        // carry the variable name, look at the text once up front.
        let targets_search_path = crate::parse::StatementKind::of(sql)
            == crate::parse::StatementKind::Set
            && sql.to_ascii_lowercase().contains("search_path");

        debug!("dispatching: {full}");
        let QueryInfo {
            mut result_in,
            keyset,
            hidden_columns,
        } = info;

        {
            let client = self.client_mut()?;
            if let Err(err) = client.send_query(&full) {
                if matches!(err, LibraryError::Io(_)) {
                    self.mark_dead("send failed");
                }
                return Err(err.into());
            }
        }

        // Step 3: drain one result per command.
        let mut head: Option<QueryResult> = None;
        let mut fatal_seen = false;
        let mut saw_commit = false;
        let mut saw_rollback = false;
        loop {
            let outcome = match self.client_mut()?.get_result() {
                Ok(outcome) => outcome,
                Err(err) => {
                    if matches!(err, LibraryError::Io(_)) {
                        self.mark_dead("connection lost draining results");
                    }
                    return Err(err.into());
                }
            };
            let Some(wire) = outcome else {
                break;
            };
            let notices = self.client_mut()?.take_notices();

            let result = match wire.status() {
                ExecStatus::CommandOk => {
                    let tag = wire.command_tag().to_string();
                    let first_word = tag.split(' ').next().unwrap_or("");
                    match first_word {
                        "BEGIN" => {
                            self.transact = TransactionPhase::InTransactionOk;
                            if discard_next_begin {
                                discard_next_begin = false;
                                continue;
                            }
                        }
                        "SAVEPOINT" => {
                            if discard_next_savepoint {
                                discard_next_savepoint = false;
                                continue;
                            }
                        }
                        "RELEASE" if savepoint_needed => continue,
                        "COMMIT" => saw_commit = true,
                        "ROLLBACK" => {
                            saw_rollback = true;
                            self.cursors_doubtful = true;
                        }
                        "DROP" | "ALTER" => {
                            // Cached column metadata may be stale now.
                            self.col_cache.clear();
                        }
                        "SET" => {
                            if targets_search_path {
                                self.current_schema = None;
                            }
                        }
                        _ => (),
                    }
                    let mut result = QueryResult::with_status(ResultStatus::CommandOk);
                    result.recent_processed_row_count = QueryResult::parse_processed_count(&tag);
                    result.command = Some(tag);
                    attach_notices(&mut result, notices);
                    result
                }
                ExecStatus::TuplesOk => {
                    let mut result = result_in.take().unwrap_or_default();
                    result.status = ResultStatus::TuplesOk;
                    result.command = Some(wire.command_tag().to_string());
                    if keyset {
                        result.enable_keyset();
                    }
                    if result.fields.is_empty() {
                        result.fields = decode_fields(&wire, hidden_columns);
                    }
                    decode_rows(&wire, &mut result, hidden_columns);
                    attach_notices(&mut result, notices);
                    result
                }
                ExecStatus::EmptyQuery => {
                    QueryResult::with_status(ResultStatus::EmptyQuery)
                }
                ExecStatus::CopyIn => QueryResult::with_status(ResultStatus::CopyIn),
                ExecStatus::CopyOut => QueryResult::with_status(ResultStatus::CopyOut),
                ExecStatus::FatalError | ExecStatus::BadResponse => {
                    fatal_seen = true;
                    let diagnostics = diagnostics_of(&wire, "send_query");
                    let mut result = QueryResult::with_status(match wire.status() {
                        ExecStatus::BadResponse => ResultStatus::BadResponse,
                        _ => ResultStatus::FatalError,
                    });
                    result.sqlstate = Some(diagnostics.state);
                    result.message = Some(diagnostics.message.clone());
                    result.aborted = true;
                    self.set_error(diagnostics);
                    result
                }
            };
            match &mut head {
                None => head = Some(result),
                Some(head) => head.push_chain(result),
            }
        }

        // Step 5: a dead socket surfaces through the session status.
        if self
            .client
            .as_ref()
            .is_some_and(|c| c.status() == SessionStatus::Bad)
        {
            self.mark_dead("session status bad after dispatch");
            return Err(Error::ConnectionDead(
                "the session broke down during the dispatch".to_string(),
            ));
        }

        // Per query savepoint recovery: roll back to the savepoint so the transaction stays
        // usable, then release it.
        if fatal_seen && savepoint_needed {
            let recover = format!(
                "ROLLBACK TO {SAVEPOINT_NAME};RELEASE {SAVEPOINT_NAME}"
            );
            if let Err(err) = self.exec_unchecked(&recover) {
                debug!("savepoint recovery failed: {err}");
            }
        }

        // Step 6: reconcile the phase with the library's report.
        self.reconcile_transaction(saw_commit, saw_rollback);

        Ok(head.unwrap_or_else(|| QueryResult::with_status(ResultStatus::EmptyQuery)))
    }

    /// Adopts the transaction phase the client library reports, recording commit/abort cleanup
    /// work for the connection entry point.
    fn reconcile_transaction(&mut self, saw_commit: bool, saw_rollback: bool) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        match client.transaction_status() {
            WireTransactionStatus::Idle => {
                if self.transact.in_transaction() {
                    let end = if saw_rollback
                        || (!saw_commit && self.transact == TransactionPhase::InTransactionError)
                    {
                        TxnEnd::Abort
                    } else {
                        TxnEnd::Commit
                    };
                    self.pending_txn_end = Some(end);
                }
                self.transact = TransactionPhase::NotInTransaction;
            }
            WireTransactionStatus::InTransaction | WireTransactionStatus::Active => {
                if self.transact == TransactionPhase::InTransactionError {
                    self.pending_txn_end = Some(TxnEnd::PartialRollback);
                }
                self.transact = TransactionPhase::InTransactionOk;
            }
            WireTransactionStatus::InError => {
                self.transact = TransactionPhase::InTransactionError;
            }
        }
    }

    /// Cached current schema, loading it from the server on first use.
    pub fn current_schema(&mut self) -> Result<String, Error> {
        if let Some(schema) = &self.current_schema {
            return Ok(schema.clone());
        }
        let result = self.exec_checked("select current_schema()", "current_schema")?;
        let schema = result
            .value(0, 0)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_else(|| "public".to_string());
        self.current_schema = Some(schema.clone());
        Ok(schema)
    }

    /// Columns of a table from the catalog, cached per connection. Entries are shared with
    /// statements via reference counting; unreferenced entries are evicted in access order once
    /// the cache is full.
    pub fn table_columns(
        &mut self,
        schema: Option<&str>,
        name: &str,
    ) -> Result<Arc<TableColumns>, Error> {
        let key = match schema {
            Some(schema) => format!("{schema}.{name}"),
            None => name.to_string(),
        };
        if let Some(pos) = self.col_cache.iter().position(|(k, _)| *k == key) {
            // Move to the back so eviction hits the least recently accessed entry.
            let entry = self.col_cache.remove(pos);
            let columns = entry.1.clone();
            self.col_cache.push(entry);
            return Ok(columns);
        }

        let schema_clause = match schema {
            Some(schema) => format!(
                "and c.relnamespace = (select oid from pg_catalog.pg_namespace \
                 where nspname = '{}')",
                escape_literal(schema)
            ),
            None => String::new(),
        };
        let sql = format!(
            "select a.attname, a.atttypid, a.atttypmod, a.attnotnull, a.attnum, c.oid, \
             c.relhasoids from pg_catalog.pg_class c join pg_catalog.pg_attribute a \
             on a.attrelid = c.oid where c.relname = '{}' {} and a.attnum > 0 \
             and not a.attisdropped order by a.attnum",
            escape_literal(name),
            schema_clause
        );
        let result = self.exec_checked(&sql, "table_columns")?;
        let mut table = TableColumns::default();
        for row in 0..result.num_rows() {
            let text = |col: usize| {
                result
                    .value(row, col)
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default()
            };
            let type_oid = text(1).parse().unwrap_or(0);
            table.columns.push(ColumnMeta {
                name: text(0),
                type_oid,
                typmod: strip_typmod_header(type_oid, text(2).parse().unwrap_or(-1)),
                not_null: text(3) == "t",
                attnum: text(4).parse().unwrap_or(0),
            });
            if row == 0 {
                table.relid = text(5).parse().unwrap_or(0);
                table.has_oids = text(6) == "t";
            }
        }
        let columns = Arc::new(table);
        if self.col_cache.len() >= COL_CACHE_CAP {
            // Evict the least recently accessed entry nobody references anymore.
            if let Some(pos) = self
                .col_cache
                .iter()
                .position(|(_, entry)| Arc::strong_count(entry) == 1)
            {
                self.col_cache.remove(pos);
            }
        }
        self.col_cache.push((key, columns.clone()));
        Ok(columns)
    }

    /// Typed parameterised dispatch, the server side prepare path: the statement carries `$n`
    /// markers and the values travel out of line. One round trip, one result.
    pub fn exec_params_checked(
        &mut self,
        sql: &str,
        params: &[WireParam],
        function: &'static str,
    ) -> Result<QueryResult, Error> {
        if self.transact == TransactionPhase::InTransactionError {
            return Err(Error::InFailedTransaction);
        }
        let wire = {
            let client = self.client_mut()?;
            match client.exec_params(sql, params, Format::Text) {
                Ok(wire) => wire,
                Err(err) => {
                    if matches!(err, LibraryError::Io(_)) {
                        self.mark_dead("exec_params failed");
                    }
                    return Err(err.into());
                }
            }
        };
        let notices = self.client_mut()?.take_notices();
        let result = match wire.status() {
            ExecStatus::FatalError | ExecStatus::BadResponse => {
                let diagnostics = diagnostics_of(&wire, function);
                self.set_error(diagnostics.clone());
                let mut result = QueryResult::with_status(ResultStatus::FatalError);
                result.sqlstate = Some(diagnostics.state);
                result.message = Some(diagnostics.message);
                result.aborted = true;
                result
            }
            ExecStatus::TuplesOk => {
                let mut result = QueryResult::with_status(ResultStatus::TuplesOk);
                result.command = Some(wire.command_tag().to_string());
                result.fields = decode_fields(&wire, 0);
                decode_rows(&wire, &mut result, 0);
                attach_notices(&mut result, notices);
                result
            }
            _ => {
                let tag = wire.command_tag().to_string();
                let mut result = QueryResult::with_status(ResultStatus::CommandOk);
                result.recent_processed_row_count = QueryResult::parse_processed_count(&tag);
                result.command = Some(tag);
                attach_notices(&mut result, notices);
                result
            }
        };
        self.reconcile_transaction(false, false);
        Ok(result)
    }

    /// Best effort cancel of the command in flight, through the client's out of band channel.
    pub fn cancel(&mut self) -> Result<(), Error> {
        let client = self.client_mut()?;
        client.cancel()?;
        Ok(())
    }

    /// Declares the session's default transaction isolation.
    pub fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), Error> {
        let sql = format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        );
        self.exec_checked(&sql, "set_isolation")?;
        self.isolation = level;
        Ok(())
    }

    /// Decides the best row identifier of a table: `oid` when present, otherwise a single column
    /// unique, non null, non expression index, otherwise rows are not individually addressable.
    pub fn best_row_identifier(
        &mut self,
        columns: &TableColumns,
    ) -> Result<RowIdentifier, Error> {
        if columns.has_oids {
            return Ok(RowIdentifier::Oid);
        }
        let sql = format!(
            "select a.attname from pg_catalog.pg_index i join pg_catalog.pg_attribute a \
             on a.attrelid = i.indrelid and a.attnum = i.indkey[0] \
             where i.indrelid = {} and i.indisunique and i.indnatts = 1 \
             and a.attnotnull and i.indexprs is null limit 1",
            columns.relid
        );
        let result = self.exec_checked(&sql, "best_row_identifier")?;
        if result.num_rows() > 0 {
            if let Some(name) = result.value(0, 0) {
                return Ok(RowIdentifier::UniqueColumn(
                    String::from_utf8_lossy(name).into_owned(),
                ));
            }
        }
        Ok(RowIdentifier::None)
    }
}

/// The connection: core state plus the statement registry. All entry points take `&mut self`,
/// which gives the one-request-per-connection discipline at compile time.
pub struct Connection<C: WireClient> {
    pub core: ConnCore<C>,
    pub(crate) statements: Vec<Option<Statement>>,
    /// Liveness token held for the environment's connection registry.
    registration: Option<Arc<()>>,
}

impl<C: WireClient> Connection<C> {
    /// Opens a session and captures the connect time session facts: server version, string
    /// escape rules, client encoding and the large object type.
    pub fn establish(opts: ConnectOptions) -> Result<Self, Error> {
        let client = C::open(&opts.wire_params())?;
        if client.status() == SessionStatus::Bad {
            return Err(Error::ConnectionDead(
                "server refused the session".to_string(),
            ));
        }
        let presentation = TypePresentation {
            int8_as: opts.int8_as,
            bytea_as_longvarbinary: opts.bytea_as_longvarbinary,
            true_is_minus1: opts.true_is_minus1,
        };
        let mut core = ConnCore {
            client: Some(client),
            status: ConnStatus::Connected,
            transact: TransactionPhase::NotInTransaction,
            autocommit: true,
            opts,
            server_version: (7, 4, 0),
            charset: Charset::SqlAscii,
            max_bytes_per_char: 1,
            std_strings: false,
            type_map: TypeMap {
                presentation,
                lo_oid: None,
            },
            current_schema: None,
            discard: Vec::new(),
            error: None,
            col_cache: Vec::new(),
            pending_txn_end: None,
            cursors_doubtful: false,
            isolation: IsolationLevel::default(),
            translation: Translation::default(),
        };
        core.lookup_session_facts();
        Ok(Connection {
            core,
            statements: Vec::new(),
            registration: None,
        })
    }

    /// Adopts the environment's liveness token; dropped together with the connection.
    pub(crate) fn register(&mut self, token: Arc<()>) {
        self.registration = Some(token);
    }

    /// Allocates a statement slot. The registry grows in blocks and reuses freed slots.
    pub fn alloc_statement(&mut self) -> StatementId {
        if let Some(free) = self.statements.iter().position(Option::is_none) {
            let id = StatementId(free);
            self.statements[free] = Some(Statement::new(id));
            return id;
        }
        let id = StatementId(self.statements.len());
        self.statements
            .reserve(STMT_INCREMENT.saturating_sub(self.statements.len() % STMT_INCREMENT));
        self.statements.push(Some(Statement::new(id)));
        id
    }

    pub fn statement(&self, id: StatementId) -> Result<&Statement, Error> {
        self.statements
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(Error::FunctionSequence("no such statement"))
    }

    pub fn statement_mut(&mut self, id: StatementId) -> Result<&mut Statement, Error> {
        self.statements
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::FunctionSequence("no such statement"))
    }

    /// Splits the borrow into core and one statement, the shape every cursor operation needs.
    pub(crate) fn core_and_statement(
        &mut self,
        id: StatementId,
    ) -> Result<(&mut ConnCore<C>, &mut Statement), Error> {
        let statement = self
            .statements
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::FunctionSequence("no such statement"))?;
        Ok((&mut self.core, statement))
    }

    /// Destroys a statement. Refused while it is executing.
    pub fn free_statement(&mut self, id: StatementId) -> Result<(), Error> {
        let slot = self
            .statements
            .get_mut(id.0)
            .ok_or(Error::FunctionSequence("no such statement"))?;
        match slot {
            None => Err(Error::FunctionSequence("statement already freed")),
            Some(statement) if statement.status == StmtStatus::Executing => {
                Err(Error::FunctionSequence("statement is executing"))
            }
            Some(statement) => {
                if statement.cursor_open {
                    let name = statement.cursor_name().to_string();
                    if self.core.transact == TransactionPhase::InTransactionError {
                        self.core
                            .mark_object_to_discard(DiscardObject::Cursor(name));
                    } else if let Err(err) =
                        self.core.exec_checked(&format!("CLOSE \"{name}\""), "free_statement")
                    {
                        debug!("closing cursor of freed statement failed: {err}");
                    }
                }
                *slot = None;
                Ok(())
            }
        }
    }

    pub fn num_statements(&self) -> usize {
        self.statements.iter().flatten().count()
    }

    /// Opens a transaction unless one is already open.
    pub fn begin(&mut self) -> Result<(), Error> {
        if self.core.transact.in_transaction() {
            return Ok(());
        }
        self.core.exec_checked("BEGIN", "begin")?;
        self.process_pending_txn_end();
        Ok(())
    }

    /// Commits the open transaction. Fully consumed non holdable cursors are released first;
    /// other open cursors get a `MOVE 0` survival probe and are upgraded to permanent when they
    /// pass.
    pub fn commit(&mut self) -> Result<(), Error> {
        if !self.core.transact.in_transaction() {
            return Ok(());
        }
        for index in 0..self.statements.len() {
            let Some(statement) = self.statements[index].as_mut() else {
                continue;
            };
            if !statement.cursor_open || statement.cursor_permanent {
                continue;
            }
            let eof = statement
                .result
                .as_ref()
                .is_some_and(|result| result.reached_eof);
            let with_hold = statement.options.with_hold;
            let name = statement.cursor_name().to_string();
            if eof && !with_hold {
                if self
                    .core
                    .exec_checked(&format!("CLOSE \"{name}\""), "commit")
                    .is_ok()
                {
                    statement.cursor_open = false;
                }
            } else {
                match self
                    .core
                    .exec_checked(&format!("MOVE 0 IN \"{name}\""), "commit")
                {
                    Ok(_) => statement.cursor_permanent = true,
                    Err(_) => statement.cursor_open = false,
                }
            }
        }
        self.core.exec_checked("COMMIT", "commit")?;
        self.process_pending_txn_end();
        Ok(())
    }

    /// Rolls the open transaction back.
    pub fn abort(&mut self) -> Result<(), Error> {
        if !self.core.transact.in_transaction() {
            return Ok(());
        }
        let result = self.core.send_query(
            "ROLLBACK",
            QueryFlags::IGNORE_ABORT_ON_CONN,
            QueryInfo::default(),
        )?;
        if !result.command_maybe_successful() {
            return Err(Error::FunctionSequence("rollback failed"));
        }
        self.process_pending_txn_end();
        Ok(())
    }

    /// Switches autocommit. Turning it off while an explicit transaction is open commits that
    /// transaction first.
    pub fn set_autocommit(&mut self, autocommit: bool) -> Result<(), Error> {
        if !autocommit && self.core.transact.in_transaction() {
            self.commit()?;
        }
        self.core.autocommit = autocommit;
        Ok(())
    }

    /// Applies the transaction end the executor observed to every statement: undo log
    /// processing, status bit promotion, cursor invalidation, deferred discards.
    pub fn process_pending_txn_end(&mut self) {
        let Some(end) = self.core.take_pending_txn_end() else {
            return;
        };
        match end {
            TxnEnd::Commit => {
                for statement in self.statements.iter_mut().flatten() {
                    if let Some(result) = &mut statement.result {
                        result.process_commit();
                    }
                    if statement.cursor_open
                        && !statement.cursor_permanent
                        && !statement.options.with_hold
                    {
                        statement.cursor_open = false;
                    }
                }
                self.core.discard_marked_objects();
            }
            TxnEnd::Abort => {
                self.process_rollback_logs(false);
                for statement in self.statements.iter_mut().flatten() {
                    if statement.cursor_open && !statement.cursor_permanent {
                        statement.cursor_doubtful = true;
                    }
                }
                self.core.cursors_doubtful = false;
            }
            TxnEnd::PartialRollback => {
                self.process_rollback_logs(true);
            }
        }
    }

    /// Closes the session. With `keep` the connection object survives for a reconnect.
    pub fn cleanup(&mut self, keep: bool) {
        if self.core.transact.in_transaction() {
            if let Err(err) = self.abort() {
                debug!("rollback during cleanup failed: {err}");
            }
        }
        for slot in &mut self.statements {
            *slot = None;
        }
        self.core.client = None;
        self.core.status = ConnStatus::NotConnected;
        self.core.transact = TransactionPhase::NotInTransaction;
        self.core.col_cache.clear();
        self.core.discard.clear();
        if !keep {
            self.core.error = None;
            self.registration.take();
        }
    }
}

impl<C: WireClient> Drop for Connection<C> {
    fn drop(&mut self) {
        if self.core.client.is_some() {
            self.cleanup(false);
        }
    }
}

impl<C: WireClient> ConnCore<C> {
    /// Captures server version, string escape rules, client encoding and the large object type
    /// right after the session came up.
    fn lookup_session_facts(&mut self) {
        let (version, std_strings, reported_encoding) = {
            let Some(client) = self.client.as_ref() else {
                return;
            };
            (
                client.parameter_status("server_version"),
                client.parameter_status("standard_conforming_strings"),
                client.parameter_status("client_encoding"),
            )
        };
        if let Some(version) = version {
            self.server_version = parse_server_version(&version);
        }
        self.std_strings = std_strings.is_some_and(|v| v == "on");

        let encoding = match reported_encoding {
            Some(name) => Some(name),
            None => self
                .exec_unchecked("select pg_client_encoding()")
                .ok()
                .and_then(|result| {
                    result
                        .value(0, 0)
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                }),
        };
        if let Some(name) = encoding {
            self.charset = Charset::from_name(&name);
            self.max_bytes_per_char = self.charset.max_bytes_per_char();
            debug!("client encoding {name} -> {:?}", self.charset);
            if self.charset == Charset::Other {
                self.set_error(Diagnostics::new(
                    State::GENERAL_ERROR,
                    format!("client encoding mismatch: {name}"),
                    "lookup_session_facts",
                ));
            }
        }

        // The large object type has no fixed oid, resolve it once per session.
        if let Ok(result) = self.exec_unchecked("select oid from pg_type where typname = 'lo'") {
            if result.status() == ExecStatus::TuplesOk && result.num_rows() > 0 {
                self.type_map.lo_oid = result
                    .value(0, 0)
                    .and_then(|v| String::from_utf8_lossy(v).parse().ok());
            }
        }
    }
}

fn attach_notices(result: &mut QueryResult, notices: Vec<Notice>) {
    for notice in notices {
        warn!("server notice: {}", notice.message);
        if result.message.is_none() {
            result.message = Some(notice.message.clone());
        }
        if let Some(sqlstate) = &notice.sqlstate {
            // A notice with diagnostic fields degrades a row bearing result.
            if result.sqlstate.is_none() {
                result.sqlstate = Some(State::from(sqlstate.as_str()));
            }
            if result.status == ResultStatus::TuplesOk {
                result.status = ResultStatus::NonFatalError;
            }
        }
    }
}

fn diagnostics_of<R: WireResult>(wire: &R, function: &'static str) -> Diagnostics {
    let state = wire
        .error_field(crate::client::DiagField::Sqlstate)
        .map(State::from)
        .unwrap_or(State::GENERAL_ERROR);
    let message = wire
        .error_message()
        .unwrap_or("the server reported an error without a message")
        .to_string();
    Diagnostics::new(state, message, function)
}

fn decode_fields<R: WireResult>(wire: &R, hidden_columns: usize) -> Vec<ColumnDesc> {
    let visible = wire.num_fields().saturating_sub(hidden_columns);
    (0..visible)
        .map(|index| {
            let type_oid = wire.field_type(index);
            ColumnDesc {
                name: wire.field_name(index).to_string(),
                type_oid,
                atttypmod: strip_typmod_header(type_oid, wire.field_typmod(index)),
                relid: wire.field_relid(index),
                attnum: wire.field_attnum(index),
            }
        })
        .collect()
}

fn decode_rows<R: WireResult>(wire: &R, result: &mut QueryResult, hidden_columns: usize) {
    let visible = wire.num_fields().saturating_sub(hidden_columns);
    for row in 0..wire.num_rows() {
        let tuple = (0..visible)
            .map(|col| wire.value(row, col).map(<[u8]>::to_vec))
            .collect();
        let key = if result.has_keyset() && hidden_columns > 0 {
            let mut key = KeySet::default();
            if let Some(ctid) = wire.value(row, visible) {
                if let Some((block, offset)) = parse_ctid(ctid) {
                    key.block = block;
                    key.offset = offset;
                }
            }
            if hidden_columns > 1 {
                if let Some(oid) = wire.value(row, visible + 1) {
                    key.oid = String::from_utf8_lossy(oid).parse().unwrap_or(0);
                }
            }
            Some(key)
        } else {
            None
        };
        result.push_tuple(tuple, key);
    }
}

/// Parses the server's textual ctid, e.g. `(12,3)`.
pub fn parse_ctid(text: &[u8]) -> Option<(u32, u16)> {
    let inner = text.strip_prefix(b"(")?.strip_suffix(b")")?;
    let comma = inner.iter().position(|&b| b == b',')?;
    let (block, digits) = atoi::FromRadix10::from_radix_10(&inner[..comma]);
    if digits == 0 {
        return None;
    }
    let (offset, digits) = atoi::FromRadix10::from_radix_10(&inner[comma + 1..]);
    if digits == 0 {
        return None;
    }
    Some((block, offset))
}

fn parse_server_version(text: &str) -> (u16, u16, u16) {
    let mut parts = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Doubles single quotes so `text` can be embedded in a literal of an internal catalog query.
fn escape_literal(text: &str) -> String {
    text.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_version_triples() {
        assert_eq!((9, 6, 11), parse_server_version("9.6.11"));
        assert_eq!((14, 2, 0), parse_server_version("14.2"));
        assert_eq!((12, 0, 0), parse_server_version("12beta1"));
    }

    #[test]
    fn ctid_parsing() {
        assert_eq!(Some((0, 1)), parse_ctid(b"(0,1)"));
        assert_eq!(Some((4294967, 42)), parse_ctid(b"(4294967,42)"));
        assert_eq!(None, parse_ctid(b"0,1"));
        assert_eq!(None, parse_ctid(b"(x,1)"));
    }
}
