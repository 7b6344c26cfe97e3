//! # About
//!
//! `pg-odbc` is the core of an ODBC style driver for PostgreSQL family databases. It translates
//! relational client requests (connect, prepare, execute, fetch, positioned update, commit and
//! rollback) into wire protocol exchanges, converts between application C types and server
//! types, and implements a scrollable, updatable cursor layer over the server's forward only
//! cursors.
//!
//! The crate performs no socket I/O itself: it is generic over a wire client implementing the
//! traits in [`client`]. Handle validation, diagnostics getters and the DSN configuration UI of
//! a full driver are thin wrappers over the types exported here.

mod connection;
mod convert;
mod cursor;
mod environment;
mod error;
mod lobj;
mod options;
mod query_result;
mod rewrite;
mod statement;

pub mod client;
pub mod encoding;
pub mod parse;
pub mod types;

pub use self::{
    connection::{
        ConnCore, ConnStatus, Connection, DiscardObject, IsolationLevel, QueryFlags, QueryInfo,
        TransactionPhase, Translation, TxnEnd,
    },
    convert::{
        copy_with_truncation, crlf_to_lf, decode_bytea, encode_bytea, format_bound_value,
        format_date, format_interval, format_time, format_timestamp, lf_to_crlf, narrow_int,
        parse_bool, parse_date, parse_float, parse_int, parse_interval, parse_money, parse_time,
        parse_timestamp, BoundValue, CopyOutcome, Date, Interval, PartialReads, Time, Timestamp,
    },
    cursor::{BulkOutcome, ExecOutcome, FetchOrientation, GetDataOutcome, Rowset},
    environment::{Environment, OdbcVersion, PoolingMode},
    error::{Diagnostics, Error, State},
    options::{ConnectOptions, RollbackOnError, SslMode, UpdatableCursors},
    query_result::{
        AddedRow, ColumnDesc, KeySet, QueryResult, ResultStatus, Rollback, RollbackOp, RowStatus,
        Tuple,
    },
    rewrite::{
        declare_cursor, map_function, number_placeholders, substitute, RewriteContext, Rewritten,
    },
    statement::{
        ColumnBinding, Concurrency, CursorType, NeedsData, ParamBinding, ParamSource, Statement,
        StatementId, StatementOptions, StmtStatus,
    },
};
// Reexports
pub use widestring::{U16Str, U16String};
