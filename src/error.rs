use std::fmt;

use thiserror::Error as ThisError;

use crate::client::LibraryError;

/// A five character SQLSTATE code. The first two characters indicate the class, the next three the
/// subclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct State(pub [u8; 5]);

impl State {
    /// Client unable to establish connection.
    pub const UNABLE_TO_CONNECT: State = State(*b"08001");
    /// Connection does not exist.
    pub const CONNECTION_DOES_NOT_EXIST: State = State(*b"08003");
    /// Communication link failure. The session died under us.
    pub const COMMUNICATION_LINK_FAILURE: State = State(*b"08S01");
    /// String data, right truncated. Reported as a warning together with a success.
    pub const STRING_DATA_RIGHT_TRUNCATION: State = State(*b"01004");
    /// Cursor operation conflict. The row version changed under a positioned operation.
    pub const CURSOR_OPERATION_CONFLICT: State = State(*b"01001");
    /// Restricted data type attribute violation.
    pub const RESTRICTED_DATA_TYPE: State = State(*b"07006");
    /// Invalid descriptor index. Column or parameter number out of range.
    pub const INVALID_DESCRIPTOR_INDEX: State = State(*b"07009");
    /// Numeric value out of range.
    pub const NUMERIC_VALUE_OUT_OF_RANGE: State = State(*b"22003");
    /// Invalid datetime format.
    pub const INVALID_DATETIME_FORMAT: State = State(*b"22007");
    /// Invalid cursor state.
    pub const INVALID_CURSOR_STATE: State = State(*b"24000");
    /// Invalid cursor name.
    pub const INVALID_CURSOR_NAME: State = State(*b"34000");
    /// Invalid transaction state.
    pub const INVALID_TRANSACTION_STATE: State = State(*b"25000");
    /// The current transaction is aborted. Commands ignored until end of transaction block.
    pub const IN_FAILED_TRANSACTION: State = State(*b"25P02");
    /// Syntax error or access rule violation.
    pub const SYNTAX_ERROR: State = State(*b"42601");
    /// General error.
    pub const GENERAL_ERROR: State = State(*b"HY000");
    /// Memory allocation failure.
    pub const MEMORY_ALLOCATION: State = State(*b"HY001");
    /// Function sequence error.
    pub const FUNCTION_SEQUENCE_ERROR: State = State(*b"HY010");
    /// Invalid string or buffer length.
    pub const INVALID_BUFFER_LENGTH: State = State(*b"HY090");
    /// Invalid attribute or option identifier.
    pub const INVALID_OPTION: State = State(*b"HY092");
    /// Invalid cursor position within the rowset.
    pub const INVALID_CURSOR_POSITION: State = State(*b"HY109");
    /// Optional feature not implemented.
    pub const NOT_IMPLEMENTED: State = State(*b"HYC00");

    /// View the code as a string slice for display. SQLSTATE codes always consist of ASCII
    /// characters, so this must succeed.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap()
    }

    /// `true` for the `01xxx` class, which reports a successful operation with additional
    /// information rather than a failure.
    pub fn is_warning(&self) -> bool {
        self.0[0] == b'0' && self.0[1] == b'1'
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for State {
    /// Build a state from the five character code reported by the server. Shorter input is padded
    /// with `0`, longer input truncated.
    fn from(code: &str) -> Self {
        let mut bytes = *b"00000";
        for (target, source) in bytes.iter_mut().zip(code.bytes()) {
            *target = source;
        }
        State(bytes)
    }
}

/// Server reported error or warning, attributed to the call which triggered it. Stored in the
/// error slot of the handle the failed operation has been invoked on.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// SQLSTATE reported by the server, or assigned by the driver for locally detected errors.
    pub state: State,
    /// Human readable message.
    pub message: String,
    /// Name of the driver operation which produced the record.
    pub function: &'static str,
}

impl Diagnostics {
    pub fn new(state: State, message: impl Into<String>, function: &'static str) -> Self {
        Diagnostics {
            state,
            message: message.into(),
            function,
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State: {}, Function: {}, Message: {}",
            self.state, self.function, self.message
        )
    }
}

/// Error type used by all fallible operations of this crate.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The session handle has been lost, either because the server closed it or because of a
    /// network failure. The connection is dead, every further operation on it fails until the
    /// application reconnects.
    #[error("The connection to the server is dead. {0}")]
    ConnectionDead(String),
    /// The wire client reported a failure talking to the server.
    #[error("Communication with the server failed:\n{0}")]
    Communication(#[from] LibraryError),
    /// The server reported an error executing a statement. Execution of the statement stopped,
    /// the connection remains usable (possibly only after a rollback).
    #[error("The server reported an error executing '{function}':\n{diagnostics}")]
    ServerError {
        diagnostics: Diagnostics,
        /// Driver operation which dispatched the failing statement.
        function: &'static str,
    },
    /// The current transaction is aborted. All statements fail fast until the application rolls
    /// back, or releases to a savepoint.
    #[error("Current transaction is aborted, commands ignored until end of transaction block")]
    InFailedTransaction,
    /// An operation has been invoked on a connection which is not in the state required for it.
    #[error("Operation invoked in the wrong connection state: {0}")]
    FunctionSequence(&'static str),
    /// Caller supplied an option value the driver does not know.
    #[error("Invalid option or option value: {0}")]
    InvalidOption(String),
    /// Statement text references a parameter number which has no binding.
    #[error("No binding for parameter number {number}")]
    WrongParameterNumber { number: u16 },
    /// Caller asked for a column number the result does not have.
    #[error("Column number {number} is out of range")]
    ColumnOutOfRange { number: u16 },
    /// The requested conversion between bound C type and server type is not supported.
    #[error("Conversion from server type {from} to the bound C type is not supported")]
    RestrictedTypeConversion { from: &'static str },
    /// A positioned operation found the row changed or gone on the server.
    #[error("The row version has changed, positioned operation refused")]
    RowVersionChanged,
    /// A scroll operation tried to position before the first row of the result.
    #[error("Tried to scroll before the beginning of the result set")]
    PosBeforeRecordset,
    /// The cursor is not positioned on a row.
    #[error("Invalid cursor position, no current row")]
    InvalidCursorPosition,
    /// Row number outside the current rowset.
    #[error("Row number {number} is outside the current rowset")]
    RowOutOfRange { number: usize },
    /// Fetch variant cannot be satisfied by the result, e.g. bookmark offset past the end.
    #[error("Fetch target is outside the result set")]
    FetchOutOfRange,
    /// Cursor state does not permit the operation, e.g. positioned update without an open cursor.
    #[error("Invalid cursor state: {0}")]
    InvalidCursorState(&'static str),
    /// The statement is not updatable, positioned DML refused.
    #[error("Statement is not updatable: {0}")]
    NotUpdatable(&'static str),
    /// Statement text could not be rewritten, e.g. an unterminated literal or escape sequence.
    #[error("Cannot rewrite the statement text: {0}")]
    Rewrite(String),
    /// Functionality not provided by this driver.
    #[error("Optional feature not implemented: {0}")]
    NotImplemented(&'static str),
}

impl Error {
    /// SQLSTATE associated with the error, surfaced to the caller through the diagnostic area.
    pub fn state(&self) -> State {
        match self {
            Error::ConnectionDead(_) => State::COMMUNICATION_LINK_FAILURE,
            Error::Communication(_) => State::COMMUNICATION_LINK_FAILURE,
            Error::ServerError { diagnostics, .. } => diagnostics.state,
            Error::InFailedTransaction => State::IN_FAILED_TRANSACTION,
            Error::FunctionSequence(_) => State::FUNCTION_SEQUENCE_ERROR,
            Error::InvalidOption(_) => State::INVALID_OPTION,
            Error::WrongParameterNumber { .. } => State::INVALID_DESCRIPTOR_INDEX,
            Error::ColumnOutOfRange { .. } => State::INVALID_DESCRIPTOR_INDEX,
            Error::RestrictedTypeConversion { .. } => State::RESTRICTED_DATA_TYPE,
            Error::RowVersionChanged => State::CURSOR_OPERATION_CONFLICT,
            Error::PosBeforeRecordset => State::INVALID_CURSOR_POSITION,
            Error::InvalidCursorPosition => State::INVALID_CURSOR_POSITION,
            Error::RowOutOfRange { .. } => State::INVALID_CURSOR_POSITION,
            Error::FetchOutOfRange => State::INVALID_CURSOR_POSITION,
            Error::InvalidCursorState(_) => State::INVALID_CURSOR_STATE,
            Error::NotUpdatable(_) => State::INVALID_CURSOR_STATE,
            Error::Rewrite(_) => State::SYNTAX_ERROR,
            Error::NotImplemented(_) => State::NOT_IMPLEMENTED,
        }
    }

    /// Diagnostics record for the error, filling the error slot of the originating handle.
    pub fn into_diagnostics(self, function: &'static str) -> Diagnostics {
        match self {
            Error::ServerError { diagnostics, .. } => diagnostics,
            other => Diagnostics::new(other.state(), other.to_string(), function),
        }
    }
}
