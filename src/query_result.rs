//! Result cache.
//!
//! A [`QueryResult`] is a lazily grown window over a server result stream: column descriptors,
//! a tuple cache, and, for updatable cursors, a keyset of row locators kept parallel to the
//! cache. Multi statement dispatches chain their results through `next`. The overlays hold rows
//! the application inserted, updated or deleted through the cursor, and the rollback log records
//! how to undo positioned DML when the transaction aborts.

use bitflags::bitflags;

use crate::client::Oid;
use crate::error::State;

bitflags! {
    /// Status bits of one keyset row. The low bits mirror the row status values reported to the
    /// application, the `SELF_*` bits track positioned DML issued through this very cursor:
    /// `*_ING` while the enclosing transaction is open, promoted to `*_ED` at commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RowStatus: u16 {
        const DELETED       = 0x0001;
        const UPDATED       = 0x0002;
        const ADDED         = 0x0004;
        const SELF_DELETING = 0x0010;
        const SELF_DELETED  = 0x0020;
        const SELF_UPDATING = 0x0040;
        const SELF_UPDATED  = 0x0080;
        const SELF_ADDING   = 0x0100;
        const SELF_ADDED    = 0x0200;
        /// The cached bytes may be stale, hydrate through the keyset before delivery.
        const NEEDS_REREAD  = 0x0400;
    }
}

impl RowStatus {
    /// Commit promotes the transient self modification bits to their permanent variants.
    pub fn promote_self_bits(&mut self) {
        if self.contains(RowStatus::SELF_DELETING) {
            self.remove(RowStatus::SELF_DELETING);
            self.insert(RowStatus::SELF_DELETED);
        }
        if self.contains(RowStatus::SELF_UPDATING) {
            self.remove(RowStatus::SELF_UPDATING);
            self.insert(RowStatus::SELF_UPDATED);
        }
        if self.contains(RowStatus::SELF_ADDING) {
            self.remove(RowStatus::SELF_ADDING);
            self.insert(RowStatus::SELF_ADDED);
        }
    }
}

/// Physical locator of one row: ctid (block, offset) plus the optional oid identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySet {
    pub block: u32,
    pub offset: u16,
    pub oid: Oid,
    pub status: RowStatus,
}

impl KeySet {
    /// Renders the ctid the way the server prints it, e.g. `(0,1)`.
    pub fn ctid(&self) -> String {
        format!("({},{})", self.block, self.offset)
    }
}

/// Outcome classification of one command after the driver interpreted the wire status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultStatus {
    #[default]
    EmptyQuery,
    CommandOk,
    TuplesOk,
    CopyOut,
    CopyIn,
    BadResponse,
    /// A notice carrying diagnostic fields arrived while the command produced rows.
    NonFatalError,
    FatalError,
    /// All rows of the underlying cursor have been read.
    EndTuples,
}

/// One cached row. A `None` field is the SQL NULL.
pub type Tuple = Vec<Option<Vec<u8>>>;

/// Descriptor of one result column as decoded from the protocol.
#[derive(Debug, Clone, Default)]
pub struct ColumnDesc {
    pub name: String,
    pub type_oid: Oid,
    /// Declared modifier with the protocol header already stripped.
    pub atttypmod: i32,
    pub relid: Oid,
    pub attnum: i16,
}

/// What a positioned DML statement did, for the rollback log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOp {
    Add,
    Update,
    Delete,
    Refresh,
}

/// One record of the per result rollback log: enough to undo a positioned operation on abort.
#[derive(Debug, Clone, Copy)]
pub struct Rollback {
    /// Absolute row index the operation applied to.
    pub index: i64,
    pub op: RollbackOp,
    /// ctid before the operation.
    pub block: u32,
    pub offset: u16,
}

/// A row added through the cursor, kept beyond the server visible end of the result.
#[derive(Debug, Clone)]
pub struct AddedRow {
    pub tuple: Tuple,
    pub key: KeySet,
}

/// A lazily grown window over a server result stream. See the module documentation.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub fields: Vec<ColumnDesc>,
    pub status: ResultStatus,
    /// Command tag, e.g. `SELECT` or `INSERT 0 1`.
    pub command: Option<String>,
    /// Primary message of the error or notice which degraded the status.
    pub message: Option<String>,
    /// SQLSTATE of the first error attributed to this result.
    pub sqlstate: Option<State>,
    /// Name of the server cursor when the statement runs over one.
    pub cursor_name: Option<String>,
    /// Plan name used for the keyset re-read statement once prepared.
    pub reread_plan: Option<String>,

    tuples: Vec<Tuple>,
    keyset: Option<Vec<KeySet>>,
    /// Absolute row index of cache slot 0.
    pub base: i64,
    /// Absolute row index of keyset slot 0. Equals `base` whenever rows and keys are both cached.
    pub key_base: i64,
    /// Total rows of the server side result seen so far (high water mark of absolute indexes).
    pub num_total_read: i64,
    /// Highest server row index seen.
    pub curs_tuple: i64,
    /// Absolute index of the next row the server cursor will deliver.
    pub server_cursor_pos: i64,
    pub reached_eof: bool,
    /// Pending displacement for the next `MOVE` command.
    pub move_offset: i64,
    pub move_backward: bool,
    /// Row count parsed from the trailing integer of the command tag.
    pub recent_processed_row_count: Option<i64>,
    pub aborted: bool,

    /// Undo log of positioned DML inside the current transaction.
    pub rollback: Vec<Rollback>,
    /// Absolute indexes of rows deleted through this cursor, kept sorted.
    deleted: Vec<i64>,
    /// Rows inserted through this cursor which the server cursor cannot see yet.
    pub added: Vec<AddedRow>,

    /// Chain link for multi statement dispatches.
    pub next: Option<Box<QueryResult>>,
}

impl QueryResult {
    pub fn new() -> Self {
        QueryResult::default()
    }

    pub fn with_status(status: ResultStatus) -> Self {
        QueryResult {
            status,
            ..QueryResult::default()
        }
    }

    /// `true` unless the command failed or produced a warning grade error.
    pub fn command_successful(&self) -> bool {
        !matches!(
            self.status,
            ResultStatus::BadResponse | ResultStatus::NonFatalError | ResultStatus::FatalError
        )
    }

    /// `true` unless the command failed hard. Non fatal errors pass.
    pub fn command_maybe_successful(&self) -> bool {
        !matches!(
            self.status,
            ResultStatus::BadResponse | ResultStatus::FatalError
        )
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn num_cached_rows(&self) -> usize {
        self.tuples.len()
    }

    pub fn num_cached_keys(&self) -> usize {
        self.keyset.as_ref().map_or(0, Vec::len)
    }

    pub fn has_keyset(&self) -> bool {
        self.keyset.is_some()
    }

    /// Arms the keyset, called when the statement executes with keyset driven concurrency.
    pub fn enable_keyset(&mut self) {
        if self.keyset.is_none() {
            self.keyset = Some(Vec::new());
        }
    }

    /// Appends a row read from the server. Keyset carrying results must push a key for every
    /// tuple so cache and keyset stay parallel. The caller maintains `num_total_read`, since a
    /// cache refill may re-read rows counted before.
    pub fn push_tuple(&mut self, tuple: Tuple, key: Option<KeySet>) {
        self.tuples.push(tuple);
        if let Some(keyset) = &mut self.keyset {
            keyset.push(key.unwrap_or_default());
            debug_assert_eq!(self.tuples.len(), keyset.len());
        }
    }

    /// Raises the seen-rows bookkeeping after a fetch landed `num_cached_rows` rows at `base`.
    pub fn account_fetch(&mut self) {
        let high = self.base + self.num_cached_rows() as i64;
        self.num_total_read = self.num_total_read.max(high);
        self.curs_tuple = self.curs_tuple.max(high - 1);
        self.server_cursor_pos = high;
    }

    /// Drops all cached rows and keys, e.g. before a refill at a new base.
    pub fn clear_cache(&mut self, new_base: i64) {
        self.tuples.clear();
        if let Some(keyset) = &mut self.keyset {
            keyset.clear();
        }
        self.base = new_base;
        self.key_base = new_base;
    }

    /// Cache slot of an absolute row index, when cached.
    pub fn cache_slot(&self, absolute: i64) -> Option<usize> {
        if absolute < self.base {
            return None;
        }
        let slot = (absolute - self.base) as usize;
        (slot < self.tuples.len()).then_some(slot)
    }

    pub fn tuple(&self, slot: usize) -> Option<&Tuple> {
        self.tuples.get(slot)
    }

    pub fn tuple_mut(&mut self, slot: usize) -> Option<&mut Tuple> {
        self.tuples.get_mut(slot)
    }

    /// Cell value of a cached row by absolute index.
    pub fn value(&self, absolute: i64, field: usize) -> Option<&[u8]> {
        let slot = self.cache_slot(absolute)?;
        self.tuples[slot].get(field)?.as_deref()
    }

    pub fn key(&self, absolute: i64) -> Option<&KeySet> {
        if absolute < self.key_base {
            return None;
        }
        let slot = (absolute - self.key_base) as usize;
        self.keyset.as_ref()?.get(slot)
    }

    pub fn key_mut(&mut self, absolute: i64) -> Option<&mut KeySet> {
        if absolute < self.key_base {
            return None;
        }
        let slot = (absolute - self.key_base) as usize;
        self.keyset.as_mut()?.get_mut(slot)
    }

    /// Total rows of the logical result: rows seen by the server cursor plus locally added ones.
    /// Only meaningful once `reached_eof` is set.
    pub fn total_with_added(&self) -> i64 {
        self.num_total_read + self.added.len() as i64
    }

    /// Marks an absolute row deleted through this cursor. The overlay stays sorted so scroll
    /// operations can skip deleted rows cheaply.
    pub fn mark_deleted(&mut self, absolute: i64) {
        if let Err(slot) = self.deleted.binary_search(&absolute) {
            self.deleted.insert(slot, absolute);
        }
    }

    pub fn unmark_deleted(&mut self, absolute: i64) {
        if let Ok(slot) = self.deleted.binary_search(&absolute) {
            self.deleted.remove(slot);
        }
    }

    pub fn is_deleted(&self, absolute: i64) -> bool {
        self.deleted.binary_search(&absolute).is_ok()
    }

    pub fn num_deleted(&self) -> usize {
        self.deleted.len()
    }

    pub fn deleted_rows(&self) -> &[i64] {
        &self.deleted
    }

    /// Appends an undo record for a positioned operation issued inside a transaction.
    pub fn log_rollback(&mut self, record: Rollback) {
        self.rollback.push(record);
    }

    /// Commit side cleanup: the undo log is obsolete and the transient self modification bits
    /// become permanent.
    pub fn process_commit(&mut self) {
        self.rollback.clear();
        if let Some(keyset) = &mut self.keyset {
            for key in keyset {
                key.status.promote_self_bits();
            }
        }
        for added in &mut self.added {
            added.key.status.promote_self_bits();
        }
    }

    /// Walks the result chain, including `self`.
    pub fn chain(&self) -> impl Iterator<Item = &QueryResult> {
        let mut next = Some(self);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.next.as_deref();
            Some(current)
        })
    }

    /// Appends `result` at the end of the chain.
    pub fn push_chain(&mut self, result: QueryResult) {
        let mut tail = self;
        while tail.next.is_some() {
            tail = tail.next.as_mut().unwrap();
        }
        tail.next = Some(Box::new(result));
    }

    /// The trailing integer of the command tag, e.g. `1` of `INSERT 0 1`.
    pub fn parse_processed_count(tag: &str) -> Option<i64> {
        let last = tag.rsplit(' ').next()?;
        let (value, digits) = atoi::FromRadix10::from_radix_10(last.as_bytes());
        (digits > 0 && digits == last.len()).then_some(value)
    }
}
