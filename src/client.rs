//! Abstract surface of the native wire client.
//!
//! The crate does not perform socket I/O or protocol framing itself. It is generic over a client
//! library which exposes session establishment, query dispatch and result introspection. Any
//! implementation of [`WireClient`] can back a [`crate::Connection`]; the test suite ships a
//! scripted in-memory one.

use std::fmt;

use thiserror::Error as ThisError;

/// Object identifier of a server type, relation or row. Server convention.
pub type Oid = u32;

/// Health of the session as reported by the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ok,
    Bad,
}

/// Transaction state of the session as reported by the client library after the last command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTransactionStatus {
    /// Connection idle, no transaction open.
    Idle,
    /// Idle inside an open transaction block.
    InTransaction,
    /// Idle inside a failed transaction block.
    InError,
    /// A command is currently being processed.
    Active,
}

/// Outcome classification of one dispatched command, before the driver interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The submitted string was empty.
    EmptyQuery,
    /// A command which returns no rows completed.
    CommandOk,
    /// A command which returns rows completed, all rows transferred.
    TuplesOk,
    /// Copy-out transfer started.
    CopyOut,
    /// Copy-in transfer started.
    CopyIn,
    /// The server reported an error for this command.
    FatalError,
    /// The response could not be understood.
    BadResponse,
}

/// Fields of a server error or notice report the driver cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagField {
    Severity,
    Sqlstate,
    MessagePrimary,
    MessageDetail,
}

/// An asynchronous notice or warning received from the server.
#[derive(Debug, Clone)]
pub struct Notice {
    pub severity: String,
    /// SQLSTATE of the notice when the server supplied diagnostic fields.
    pub sqlstate: Option<String>,
    pub message: String,
}

/// Text or binary transfer format of one parameter or of the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Text,
    Binary,
}

/// One parameter of a typed parameterised dispatch.
#[derive(Debug, Clone)]
pub struct WireParam {
    /// Server type to resolve the parameter as, `0` leaves the choice to the server.
    pub oid: Oid,
    /// Wire representation, `None` is the SQL NULL.
    pub value: Option<Vec<u8>>,
    pub format: Format,
}

/// Error reported by the client library itself, as opposed to an error reported by the server.
#[derive(Debug, ThisError)]
pub enum LibraryError {
    /// Session could not be established.
    #[error("could not connect: {0}")]
    ConnectFailed(String),
    /// Session broke down mid-operation.
    #[error("communication error: {0}")]
    Io(String),
    /// The client library refused the request, e.g. a dispatch while another is in flight.
    #[error("client library refused the request: {0}")]
    Usage(String),
}

/// Result introspection surface of the client library. One instance per command in a dispatch.
pub trait WireResult {
    fn status(&self) -> ExecStatus;

    /// Command tag such as `SELECT 2` or `INSERT 0 1`. Empty for row-bearing results on some
    /// servers, the driver falls back to counting rows then.
    fn command_tag(&self) -> &str;

    /// Primary error message, present when [`Self::status`] is an error.
    fn error_message(&self) -> Option<&str>;

    /// Individual error field, e.g. the SQLSTATE.
    fn error_field(&self, field: DiagField) -> Option<&str>;

    fn num_fields(&self) -> usize;
    fn field_name(&self, field: usize) -> &str;
    fn field_type(&self, field: usize) -> Oid;
    /// Declared type modifier, including the protocol's 4 byte header where applicable.
    fn field_typmod(&self, field: usize) -> i32;
    /// Oid of the originating relation, `0` for computed columns.
    fn field_relid(&self, field: usize) -> Oid;
    /// Attribute number within the originating relation, `0` for computed columns.
    fn field_attnum(&self, field: usize) -> i16;

    fn num_rows(&self) -> usize;
    fn is_null(&self, row: usize, field: usize) -> bool;
    /// Raw cell bytes in the transfer format of the result. `None` is the SQL NULL.
    fn value(&self, row: usize, field: usize) -> Option<&[u8]>;
}

/// Session surface of the client library.
///
/// A connection drives exactly one session; `&mut self` receivers encode that no two requests may
/// be in flight on one session at a time.
pub trait WireClient: Sized {
    type Result: WireResult;

    /// Open a session from `key=value` parameters.
    fn open(params: &[(String, String)]) -> Result<Self, LibraryError>;

    fn status(&self) -> SessionStatus;

    fn transaction_status(&self) -> WireTransactionStatus;

    /// Server-reported session parameter, e.g. `client_encoding` or
    /// `standard_conforming_strings`.
    fn parameter_status(&self, name: &str) -> Option<String>;

    /// Dispatch one query string (which may contain multiple statements) and wait for the first
    /// result. Remaining results are drained with [`Self::get_result`].
    fn send_query(&mut self, sql: &str) -> Result<(), LibraryError>;

    /// Next result of the current dispatch, `None` once the dispatch is fully drained.
    fn get_result(&mut self) -> Result<Option<Self::Result>, LibraryError>;

    /// Dispatch and wait for a single result. Convenience over send/drain for internal queries.
    fn exec(&mut self, sql: &str) -> Result<Self::Result, LibraryError>;

    /// Typed parameterised dispatch.
    fn exec_params(
        &mut self,
        sql: &str,
        params: &[WireParam],
        result_format: Format,
    ) -> Result<Self::Result, LibraryError>;

    /// Notices received since the last call. The driver attributes them to the result currently
    /// being drained.
    fn take_notices(&mut self) -> Vec<Notice>;

    /// Out of band best effort cancel of the command in flight.
    fn cancel(&mut self) -> Result<(), LibraryError>;

    /// `true` if the session is SSL protected.
    fn ssl_in_use(&self) -> bool;

    // Large object protocol. Routed through the server's fast-path function calls by real
    // implementations.

    fn lo_creat(&mut self) -> Result<Oid, LibraryError>;
    fn lo_open(&mut self, oid: Oid, mode: i32) -> Result<i32, LibraryError>;
    fn lo_read(&mut self, fd: i32, len: usize) -> Result<Vec<u8>, LibraryError>;
    fn lo_write(&mut self, fd: i32, data: &[u8]) -> Result<usize, LibraryError>;
    fn lo_lseek(&mut self, fd: i32, offset: i32, whence: i32) -> Result<i32, LibraryError>;
    fn lo_close(&mut self, fd: i32) -> Result<(), LibraryError>;
    fn lo_unlink(&mut self, oid: Oid) -> Result<(), LibraryError>;
}

impl fmt::Display for WireTransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            WireTransactionStatus::Idle => "idle",
            WireTransactionStatus::InTransaction => "in transaction",
            WireTransactionStatus::InError => "in failed transaction",
            WireTransactionStatus::Active => "active",
        };
        f.write_str(text)
    }
}
