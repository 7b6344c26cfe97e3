//! Scrollable, updatable cursor engine.
//!
//! The server offers forward only cursors (`FETCH n`, `MOVE n`, `MOVE BACKWARD n`, `MOVE ALL`)
//! over unkeyed row streams. This module turns that into a scroll cursor with an arbitrary
//! rowset window and positioned insert, update and delete: a cache window is maintained over the
//! server cursor, every row of an updatable cursor carries its physical locator in the keyset,
//! locally changed rows live in overlays, and an undo log allows restoring cursor state when the
//! enclosing transaction rolls back.

use log::debug;

use crate::client::{Format, WireClient, WireParam, WireResult};
use crate::connection::{ConnCore, Connection, QueryFlags, QueryInfo};
use crate::convert::{crlf_to_lf, format_bound_value, lf_to_crlf, BoundValue, CopyOutcome};
use crate::error::{Diagnostics, Error, State};
use crate::parse::{parse_statement, RowIdentifier, StatementKind};
use crate::query_result::{
    AddedRow, KeySet, QueryResult, ResultStatus, Rollback, RollbackOp, RowStatus,
};
use crate::rewrite::{
    declare_cursor, inject_keyset_columns, literal_fragment, number_placeholders, substitute,
    RewriteContext,
};
use crate::statement::{Concurrency, CursorType, Statement, StatementId, StmtStatus};

/// Scroll target of one fetch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrientation {
    Next,
    Prior,
    First,
    Last,
    /// One based absolute row, negative counts from the end, zero positions before the first.
    Absolute(i64),
    Relative(i64),
    /// Replay of a bookmark obtained from [`Connection::bookmark`], plus a row displacement.
    Bookmark { bookmark: i64, offset: i64 },
}

/// The rowset delivered by one fetch.
#[derive(Debug, Clone)]
pub struct Rowset {
    /// Absolute row of the first row of the window.
    pub start: i64,
    /// Absolute indexes of the delivered rows, in order.
    pub rows: Vec<i64>,
    /// Row status array, parallel to `rows`.
    pub statuses: Vec<RowStatus>,
}

/// Outcome of [`Connection::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Finished,
    /// A data at execution parameter awaits its putdata loop.
    NeedsData { param: usize },
}

/// Outcome of one [`Connection::get_data`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetDataOutcome {
    /// The value is the SQL NULL.
    Null,
    /// Previous calls already delivered the whole value.
    NoMoreData,
    Data(CopyOutcome),
}

/// Outcome of a bulk positioned operation. The loop continues past row errors; failed rows are
/// reported here and in the keyset status.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub processed: usize,
    pub row_errors: Vec<(usize, Error)>,
}

impl<C: WireClient> Connection<C> {
    /// Executes the bound SQL text of `id`: parse, catalog refinement, parameter substitution,
    /// and dispatch, through a server side cursor for cursor capable SELECTs.
    pub fn execute(&mut self, id: StatementId) -> Result<ExecOutcome, Error> {
        let (core, stmt) = self.core_and_statement(id)?;
        let sql = stmt
            .sql
            .clone()
            .ok_or(Error::FunctionSequence("no statement text bound"))?;

        if stmt.parsed.is_none() {
            let mut parsed = parse_statement(&sql, core.std_strings);
            if parsed.kind == StatementKind::Select
                && parsed.parse_complete
                && parsed.tables.len() == 1
            {
                let schema = parsed.tables[0].schema.clone();
                let name = parsed.tables[0].name.clone();
                match core.table_columns(schema.as_deref(), &name) {
                    Ok(columns) => {
                        parsed.tables[0].relid = columns.relid;
                        let identifier = core.best_row_identifier(&columns)?;
                        if identifier == RowIdentifier::None {
                            parsed.tables[0].updatable = false;
                        }
                        parsed.tables[0].row_identifier = Some(identifier);
                        parsed.tables[0].columns = Some(columns);
                        parsed.expand_stars();
                        parsed.resolve_fields();
                    }
                    Err(err) => {
                        // Catalog free description degrades, execution continues.
                        debug!("catalog lookup for {name} failed: {err}");
                        parsed.parse_complete = false;
                    }
                }
            }
            stmt.updatable = parsed.updatable();
            stmt.parsed = Some(parsed);
        }

        // Spool large object parameters before substitution, their oid replaces the value.
        for number in 1..=stmt.num_params() {
            let needs_spool = stmt
                .param(number)
                .is_some_and(|binding| binding.large_object && binding.lo_oid.is_none());
            if !needs_spool {
                continue;
            }
            let bytes: Option<Vec<u8>> = match stmt.param(number).map(|binding| &binding.source) {
                Some(crate::statement::ParamSource::Value(BoundValue::Binary(bytes))) => {
                    Some(bytes.clone())
                }
                Some(crate::statement::ParamSource::Value(BoundValue::Char(bytes))) => {
                    Some(bytes.clone())
                }
                Some(crate::statement::ParamSource::DataAtExec { buffer, .. }) => buffer.clone(),
                _ => continue,
            };
            let Some(bytes) = bytes else {
                // The large object bytes arrive through the putdata loop first.
                stmt.current_exec_param = Some(number);
                return Ok(ExecOutcome::NeedsData { param: number });
            };
            let oid = core.create_large_object(&bytes)?;
            if let Some(binding) = stmt.param_mut(number) {
                binding.lo_oid = Some(oid);
            }
        }

        let mut values = match stmt.substitution_values() {
            Ok(values) => values,
            Err(needs) => {
                stmt.current_exec_param = Some(needs.param);
                return Ok(ExecOutcome::NeedsData { param: needs.param });
            }
        };
        stmt.current_exec_param = None;
        if core.opts.lf_conversion {
            // Character input buffers arrive with CR LF line ends, the server stores bare LF.
            for value in &mut values {
                if let BoundValue::Char(bytes) = value {
                    *bytes = crlf_to_lf(bytes);
                }
            }
        }

        let ctx = RewriteContext {
            std_strings: core.std_strings,
            charset: core.charset,
        };
        let use_prepare = core.opts.use_server_side_prepare
            && !values.is_empty()
            && stmt
                .parsed
                .as_ref()
                .is_some_and(|parsed| !parsed.kind.cursor_capable());

        stmt.status = StmtStatus::Executing;
        let outcome = (|| {
            if use_prepare {
                return execute_prepared(core, stmt, &sql, &values, ctx);
            }
            let rewritten = substitute(&sql, &values, ctx)?;
            let mut text = rewritten.text;
            if let Some(hook) = &core.translation.to_server {
                text = String::from_utf8_lossy(&hook(text.as_bytes())).into_owned();
            }
            if rewritten.kind == StatementKind::Select && !rewritten.for_update {
                execute_with_cursor(core, stmt, &text, ctx)
            } else {
                execute_direct(core, stmt, &text, rewritten.kind)
            }
        })();
        stmt.status = match outcome {
            Ok(()) => StmtStatus::Finished,
            Err(_) => StmtStatus::Ready,
        };
        if let Err(err) = outcome {
            stmt.error = Some(Diagnostics::new(err.state(), err.to_string(), "execute"));
            return Err(err);
        }
        self.process_pending_txn_end();
        Ok(ExecOutcome::Finished)
    }

    /// Number of rows the last executed DML processed, from the command tag.
    pub fn rows_affected(&self, id: StatementId) -> Result<i64, Error> {
        let statement = self.statement(id)?;
        Ok(statement
            .result
            .as_ref()
            .and_then(|result| result.recent_processed_row_count)
            .unwrap_or(0))
    }

    /// Scrolls the cursor and delivers the next rowset. `Ok(None)` means no data at the target
    /// position; the cursor is then positioned before the first or after the last row.
    pub fn fetch_scroll(
        &mut self,
        id: StatementId,
        orientation: FetchOrientation,
    ) -> Result<Option<Rowset>, Error> {
        let (core, stmt) = self.core_and_statement(id)?;
        if stmt.result.is_none() {
            return Err(Error::InvalidCursorState("no open result"));
        }
        if stmt.cursor_doubtful {
            return Err(Error::InvalidCursorState(
                "a rollback may have moved the cursor, close and re-execute",
            ));
        }
        let rowset_size = stmt.options.rowset_size.max(1);

        let target = match orientation {
            FetchOrientation::Next => {
                if stmt.curr_tuple < 0 && stmt.rowset_start == 0 && stmt.last_fetch_count == 0 {
                    0
                } else {
                    stmt.rowset_start + stmt.last_fetch_count_including_omitted as i64
                }
            }
            FetchOrientation::Prior => {
                prior_rowset_start(core, stmt, rowset_size)?
            }
            FetchOrientation::First => 0,
            FetchOrientation::Last => {
                let total = logical_total(core, stmt)?;
                (total - rowset_size as i64).max(0)
            }
            FetchOrientation::Absolute(number) => match number {
                0 => -1,
                n if n > 0 => n - 1,
                n => logical_total(core, stmt)? + n,
            },
            FetchOrientation::Relative(offset) => stmt.rowset_start + offset,
            FetchOrientation::Bookmark { bookmark, offset } => bookmark - 1 + offset,
        };

        if target < 0 {
            stmt.curr_tuple = -1;
            stmt.rowset_start = 0;
            stmt.last_fetch_count = 0;
            stmt.last_fetch_count_including_omitted = 0;
            stmt.rowset_rows.clear();
            if matches!(
                orientation,
                FetchOrientation::Relative(_) | FetchOrientation::Absolute(_)
            ) && target < -1
            {
                return Err(Error::PosBeforeRecordset);
            }
            return Ok(None);
        }

        let rowset = assemble_rowset(core, stmt, target, rowset_size)?;
        hydrate_reread_rows(core, stmt, &rowset)?;

        stmt.rowset_start = target;
        stmt.partial_reads.reset();
        stmt.last_get_data_row = None;
        if rowset.is_empty() {
            stmt.last_fetch_count = 0;
            stmt.last_fetch_count_including_omitted = 0;
            stmt.rowset_rows.clear();
            // Positioned after the last row; PRIOR from here walks back in.
            stmt.curr_tuple = target;
            return Ok(None);
        }

        let consumed = rowset.last().map(|(abs, _)| abs - target + 1).unwrap_or(0);
        stmt.last_fetch_count = rowset.len();
        stmt.last_fetch_count_including_omitted = consumed as usize;
        stmt.curr_tuple = rowset.last().map(|(abs, _)| *abs).unwrap_or(target);
        let (rows, statuses): (Vec<i64>, Vec<RowStatus>) = rowset.into_iter().unzip();
        stmt.rowset_rows = rows.clone();
        Ok(Some(Rowset {
            start: target,
            rows,
            statuses,
        }))
    }

    /// Driver opaque bookmark of a delivered row, replayable through
    /// [`FetchOrientation::Bookmark`].
    pub fn bookmark(&self, id: StatementId, row: usize) -> Result<i64, Error> {
        let statement = self.statement(id)?;
        let absolute = statement
            .rowset_rows
            .get(row)
            .ok_or(Error::RowOutOfRange { number: row })?;
        Ok(absolute + 1)
    }

    /// Delivers (a chunk of) one column of a delivered row into `target`, with the truncation
    /// contract of `SQLGetData`: repeated calls resume behind the bytes already delivered.
    pub fn get_data(
        &mut self,
        id: StatementId,
        row: usize,
        column: u16,
        target: &mut [u8],
    ) -> Result<GetDataOutcome, Error> {
        let (core, stmt) = self.core_and_statement(id)?;
        let absolute = *stmt
            .rowset_rows
            .get(row)
            .ok_or(Error::RowOutOfRange { number: row })?;
        if stmt.last_get_data_row != Some(row) {
            stmt.partial_reads.reset();
            stmt.last_get_data_row = Some(row);
        }
        let result = stmt
            .result
            .as_ref()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        let index = usize::from(column)
            .checked_sub(1)
            .ok_or(Error::ColumnOutOfRange { number: column })?;
        if index >= result.num_fields() {
            return Err(Error::ColumnOutOfRange { number: column });
        }

        let raw = if absolute >= result.num_total_read {
            let added = (absolute - result.num_total_read) as usize;
            result
                .added
                .get(added)
                .and_then(|row| row.tuple.get(index))
                .and_then(|cell| cell.as_deref())
        } else {
            result.value(absolute, index)
        };
        let Some(raw) = raw else {
            return Ok(GetDataOutcome::Null);
        };

        // Large object columns transfer through the large object protocol.
        let value = if core.type_map.is_lo_type(result.fields[index].type_oid) {
            let oid = String::from_utf8_lossy(raw).trim().parse().unwrap_or(0);
            core.read_large_object(oid)?
        } else if core.opts.lf_conversion {
            lf_to_crlf(raw)
        } else {
            raw.to_vec()
        };
        let value = match &core.translation.from_server {
            Some(hook) => hook(&value),
            None => value,
        };
        let outcome = stmt.partial_reads.next_chunk(index, &value, target);
        Ok(match outcome {
            None => GetDataOutcome::NoMoreData,
            Some(copy) => GetDataOutcome::Data(copy),
        })
    }

    /// Positioned update of one delivered row. `assignments` pairs one based column numbers with
    /// the new values.
    pub fn set_pos_update(
        &mut self,
        id: StatementId,
        row: usize,
        assignments: &[(u16, BoundValue)],
    ) -> Result<(), Error> {
        let (core, stmt) = self.core_and_statement(id)?;
        let absolute = positioned_row(stmt, row)?;
        let (table, identifier) = updatable_table(stmt)?;
        let key = current_key(stmt, absolute)?;

        // Every assigned column must map to a parsed field marked updatable.
        let parsed = stmt.parsed.as_ref().ok_or(Error::NotUpdatable("not parsed"))?;
        let mut set_list = String::new();
        for (column, value) in assignments {
            let field = parsed
                .fields
                .get(usize::from(*column) - 1)
                .ok_or(Error::ColumnOutOfRange { number: *column })?;
            if !field.updatable {
                return Err(Error::NotUpdatable("column is not updatable"));
            }
            if !set_list.is_empty() {
                set_list.push_str(", ");
            }
            set_list.push_str(&format!(
                "\"{}\" = {}",
                field.name,
                literal_fragment(value)
            ));
        }
        if set_list.is_empty() {
            return Err(Error::NotUpdatable("no columns to update"));
        }

        let mut sql = format!(
            "UPDATE {table} SET {set_list} WHERE ctid = '{ctid}'",
            ctid = key.ctid()
        );
        if identifier == RowIdentifier::Oid && key.oid != 0 {
            sql.push_str(&format!(" AND \"oid\" = {}", key.oid));
        }
        let returning = core.supports_returning();
        if returning {
            sql.push_str(" RETURNING ctid");
        }

        let in_txn_before = core.transact.in_transaction();
        let chain = core.send_query(
            &sql,
            QueryFlags::GO_INTO_TRANSACTION | QueryFlags::ROLLBACK_ON_ERROR,
            QueryInfo::default(),
        )?;
        if !chain.command_maybe_successful() {
            let err = result_error(&chain, "set_pos_update");
            stmt.error = Some(err.into_diagnostics("set_pos_update"));
            return Err(take_back_error(stmt));
        }
        let processed = chain
            .recent_processed_row_count
            .or_else(|| Some(chain.num_cached_rows() as i64))
            .unwrap_or(0);
        if processed == 0 {
            return Err(Error::RowVersionChanged);
        }

        let new_ctid = if returning {
            chain
                .value(0, 0)
                .and_then(crate::connection::parse_ctid)
        } else {
            follow_ctid(core, &table, &key)?
        };

        let result = stmt
            .result
            .as_mut()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        if in_txn_before || core.transact.in_transaction() {
            result.log_rollback(Rollback {
                index: absolute,
                op: RollbackOp::Update,
                block: key.block,
                offset: key.offset,
            });
        }
        let in_txn = core.transact.in_transaction();
        if let Some(entry) = key_entry_mut(result, absolute) {
            if let Some((block, offset)) = new_ctid {
                entry.block = block;
                entry.offset = offset;
            }
            entry.status.insert(RowStatus::UPDATED);
            entry.status.insert(if in_txn {
                RowStatus::SELF_UPDATING
            } else {
                RowStatus::SELF_UPDATED
            });
        }
        reread_row(core, stmt, absolute)?;
        Ok(())
    }

    /// Positioned delete of one delivered row.
    pub fn set_pos_delete(&mut self, id: StatementId, row: usize) -> Result<(), Error> {
        let (core, stmt) = self.core_and_statement(id)?;
        let absolute = positioned_row(stmt, row)?;
        let (table, identifier) = updatable_table(stmt)?;
        let key = current_key(stmt, absolute)?;

        let mut sql = format!("DELETE FROM {table} WHERE ctid = '{}'", key.ctid());
        if identifier == RowIdentifier::Oid && key.oid != 0 {
            sql.push_str(&format!(" AND \"oid\" = {}", key.oid));
        }
        let chain = core.send_query(
            &sql,
            QueryFlags::GO_INTO_TRANSACTION | QueryFlags::ROLLBACK_ON_ERROR,
            QueryInfo::default(),
        )?;
        if !chain.command_maybe_successful() {
            let err = result_error(&chain, "set_pos_delete");
            stmt.error = Some(err.into_diagnostics("set_pos_delete"));
            return Err(take_back_error(stmt));
        }
        if chain.recent_processed_row_count.unwrap_or(0) == 0 {
            return Err(Error::RowVersionChanged);
        }

        let in_txn = core.transact.in_transaction();
        let result = stmt
            .result
            .as_mut()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        if in_txn {
            result.log_rollback(Rollback {
                index: absolute,
                op: RollbackOp::Delete,
                block: key.block,
                offset: key.offset,
            });
        }
        if let Some(entry) = key_entry_mut(result, absolute) {
            entry.status.insert(RowStatus::DELETED);
            entry.status.insert(if in_txn {
                RowStatus::SELF_DELETING
            } else {
                RowStatus::SELF_DELETED
            });
        }
        result.mark_deleted(absolute);
        Ok(())
    }

    /// Positioned insert. Returns the bookmark of the new row, which lives in the added overlay
    /// past the server visible end of the result.
    pub fn set_pos_insert(
        &mut self,
        id: StatementId,
        assignments: &[(u16, BoundValue)],
    ) -> Result<i64, Error> {
        let (core, stmt) = self.core_and_statement(id)?;
        let (table, _) = updatable_table(stmt)?;
        let parsed = stmt.parsed.as_ref().ok_or(Error::NotUpdatable("not parsed"))?;

        let mut columns = String::new();
        let mut values = String::new();
        for (column, value) in assignments {
            let field = parsed
                .fields
                .get(usize::from(*column) - 1)
                .ok_or(Error::ColumnOutOfRange { number: *column })?;
            if !field.updatable {
                return Err(Error::NotUpdatable("column is not updatable"));
            }
            if !columns.is_empty() {
                columns.push_str(", ");
                values.push_str(", ");
            }
            columns.push_str(&format!("\"{}\"", field.name));
            values.push_str(&literal_fragment(value));
        }
        if columns.is_empty() {
            return Err(Error::NotUpdatable("no columns to insert"));
        }

        let returning = core.supports_returning();
        let mut sql = format!("INSERT INTO {table} ({columns}) VALUES ({values})");
        if returning {
            sql.push_str(" RETURNING ctid");
        }
        let chain = core.send_query(
            &sql,
            QueryFlags::GO_INTO_TRANSACTION | QueryFlags::ROLLBACK_ON_ERROR,
            QueryInfo::default(),
        )?;
        if !chain.command_maybe_successful() {
            let err = result_error(&chain, "set_pos_insert");
            stmt.error = Some(err.into_diagnostics("set_pos_insert"));
            return Err(take_back_error(stmt));
        }

        let new_ctid = if returning {
            chain.value(0, 0).and_then(crate::connection::parse_ctid)
        } else {
            // Older servers: a currtid probe on the invalid tid yields the last tuple this
            // session inserted.
            let wire = core.exec_checked("select currtid(0, '(0,0)')", "set_pos_insert")?;
            wire.value(0, 0).and_then(crate::connection::parse_ctid)
        };
        let Some((block, offset)) = new_ctid else {
            return Err(Error::InvalidCursorState(
                "the inserted row could not be located",
            ));
        };

        // Read the freshly inserted row back so the overlay carries its bytes.
        let key = KeySet {
            block,
            offset,
            oid: 0,
            status: RowStatus::ADDED,
        };
        let tuple = fetch_row_by_ctid(core, stmt, &key)?;

        let in_txn = core.transact.in_transaction();
        let result = stmt
            .result
            .as_mut()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        let mut key = key;
        key.status.insert(if in_txn {
            RowStatus::SELF_ADDING
        } else {
            RowStatus::SELF_ADDED
        });
        let absolute = result.num_total_read + result.added.len() as i64;
        if in_txn {
            result.log_rollback(Rollback {
                index: absolute,
                op: RollbackOp::Add,
                block,
                offset,
            });
        }
        result.added.push(AddedRow { tuple, key });
        Ok(absolute + 1)
    }

    /// Re-reads one delivered row from the server, refreshing the cache.
    pub fn set_pos_refresh(&mut self, id: StatementId, row: usize) -> Result<(), Error> {
        let (core, stmt) = self.core_and_statement(id)?;
        let absolute = positioned_row(stmt, row)?;
        reread_row(core, stmt, absolute)
    }

    /// Bulk positioned delete over rowset positions. The loop continues past per row errors,
    /// collecting them instead of stopping.
    pub fn bulk_delete(&mut self, id: StatementId, rows: &[usize]) -> Result<BulkOutcome, Error> {
        let mut outcome = BulkOutcome::default();
        for &row in rows {
            match self.set_pos_delete(id, row) {
                Ok(()) => outcome.processed += 1,
                Err(err) => outcome.row_errors.push((row, err)),
            }
        }
        Ok(outcome)
    }

    /// Bulk positioned update, same error discipline as [`Self::bulk_delete`].
    pub fn bulk_update(
        &mut self,
        id: StatementId,
        rows: &[(usize, Vec<(u16, BoundValue)>)],
    ) -> Result<BulkOutcome, Error> {
        let mut outcome = BulkOutcome::default();
        for (row, assignments) in rows {
            match self.set_pos_update(id, *row, assignments) {
                Ok(()) => outcome.processed += 1,
                Err(err) => outcome.row_errors.push((*row, err)),
            }
        }
        Ok(outcome)
    }

    /// Applies the undo logs of all statements after the transaction rolled back. With `partial`
    /// the rollback went to a savepoint and the outer transaction is still alive.
    pub(crate) fn process_rollback_logs(&mut self, partial: bool) {
        let Connection {
            core, statements, ..
        } = self;
        for statement in statements.iter_mut().flatten() {
            if let Err(err) = undo_positioned_ops(core, statement, partial) {
                debug!("rollback processing failed: {err}");
            }
        }
    }

    /// Closes the statement's server cursor and result, keeping the statement for reuse.
    pub fn close_cursor(&mut self, id: StatementId) -> Result<(), Error> {
        let (core, stmt) = self.core_and_statement(id)?;
        if stmt.cursor_open {
            let name = stmt.cursor_name().to_string();
            if core.transact == crate::connection::TransactionPhase::InTransactionError {
                core.mark_object_to_discard(crate::connection::DiscardObject::Cursor(name));
            } else if let Err(err) =
                core.exec_checked(&format!("CLOSE \"{name}\""), "close_cursor")
            {
                debug!("closing cursor failed: {err}");
            }
        }
        stmt.close();
        Ok(())
    }
}

/// Absolute index of a rowset position, failing when the position was not delivered.
fn positioned_row(stmt: &Statement, row: usize) -> Result<i64, Error> {
    stmt.rowset_rows
        .get(row)
        .copied()
        .ok_or(Error::RowOutOfRange { number: row })
}

/// The single updatable base table of the statement and its row identifier.
fn updatable_table(stmt: &Statement) -> Result<(String, RowIdentifier), Error> {
    if !stmt.updatable {
        return Err(Error::NotUpdatable(
            "the statement has no single updatable base table",
        ));
    }
    let parsed = stmt
        .parsed
        .as_ref()
        .ok_or(Error::NotUpdatable("not parsed"))?;
    let table = parsed
        .tables
        .first()
        .ok_or(Error::NotUpdatable("no base table"))?;
    Ok((
        table.qualified_name(),
        table
            .row_identifier
            .clone()
            .unwrap_or(RowIdentifier::None),
    ))
}

/// Keyset entry of an absolute row, looking through the added overlay as well.
fn current_key(stmt: &Statement, absolute: i64) -> Result<KeySet, Error> {
    let result = stmt
        .result
        .as_ref()
        .ok_or(Error::InvalidCursorState("no open result"))?;
    if absolute >= result.num_total_read {
        let added = (absolute - result.num_total_read) as usize;
        return result
            .added
            .get(added)
            .map(|row| row.key)
            .ok_or(Error::InvalidCursorPosition);
    }
    result
        .key(absolute)
        .copied()
        .ok_or(Error::InvalidCursorPosition)
}

fn key_entry_mut(result: &mut QueryResult, absolute: i64) -> Option<&mut KeySet> {
    if absolute >= result.num_total_read {
        let added = (absolute - result.num_total_read) as usize;
        return result.added.get_mut(added).map(|row| &mut row.key);
    }
    result.key_mut(absolute)
}

fn result_error(result: &QueryResult, function: &'static str) -> Error {
    Error::ServerError {
        diagnostics: Diagnostics::new(
            result.sqlstate.unwrap_or(State::GENERAL_ERROR),
            result
                .message
                .clone()
                .unwrap_or_else(|| "the server rejected the statement".to_string()),
            function,
        ),
        function,
    }
}

/// Rebuilds the statement's error slot into an [`Error`] for returning.
fn take_back_error(stmt: &Statement) -> Error {
    match &stmt.error {
        Some(diagnostics) => Error::ServerError {
            diagnostics: diagnostics.clone(),
            function: diagnostics.function,
        },
        None => Error::FunctionSequence("operation failed"),
    }
}

fn execute_with_cursor<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    text: &str,
    ctx: RewriteContext,
) -> Result<(), Error> {
    let keyset_wanted = core.opts.allow_keyset
        && stmt.updatable
        && core
            .opts
            .updatable_cursors
            .contains(crate::options::UpdatableCursors::KEYSET_DRIVEN)
        && (matches!(
            stmt.options.cursor_type,
            CursorType::KeysetDriven | CursorType::Dynamic
        ) || stmt.options.concurrency == Concurrency::RowVersion);

    let (text, hidden) = if keyset_wanted {
        let with_oid = stmt
            .parsed
            .as_ref()
            .and_then(|parsed| parsed.tables.first())
            .and_then(|table| table.columns.as_ref())
            .is_some_and(|columns| columns.has_oids);
        match inject_keyset_columns(text, with_oid, ctx) {
            Some(injected) => (injected, 1 + usize::from(with_oid)),
            None => (text.to_string(), 0),
        }
    } else {
        (text.to_string(), 0)
    };

    let cursor_name = stmt.cursor_name().to_string();
    let declare = declare_cursor(&text, &cursor_name, stmt.options.with_hold);
    let chain = core.send_query(
        &declare,
        QueryFlags::GO_INTO_TRANSACTION | QueryFlags::ROLLBACK_ON_ERROR,
        QueryInfo::default(),
    )?;
    if !chain.command_maybe_successful() {
        return Err(result_error(&chain, "execute"));
    }

    stmt.cursor_open = true;
    stmt.cursor_permanent = false;
    stmt.cursor_doubtful = false;
    stmt.hidden_keyset_columns = hidden;
    let mut shell = QueryResult::new();
    if hidden > 0 {
        shell.enable_keyset();
    }
    shell.cursor_name = Some(cursor_name);
    stmt.result = Some(shell);
    stmt.curr_tuple = -1;
    stmt.rowset_start = 0;
    stmt.last_fetch_count = 0;
    stmt.last_fetch_count_including_omitted = 0;
    stmt.rowset_rows.clear();

    // Initial cache fill so a describe needs no extra round trip.
    refill_cache(core, stmt, 0)
}

/// Server side prepare path: placeholders travel as `$n` markers and the values out of line
/// through the client's typed dispatch.
fn execute_prepared<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    sql: &str,
    values: &[BoundValue],
    ctx: RewriteContext,
) -> Result<(), Error> {
    let (numbered, count) = number_placeholders(sql, ctx)?;
    if count > values.len() {
        return Err(Error::WrongParameterNumber {
            number: (values.len() + 1) as u16,
        });
    }
    let params: Vec<WireParam> = values[..count]
        .iter()
        .map(|value| WireParam {
            oid: 0,
            value: format_bound_value(value).map(String::into_bytes),
            format: Format::Text,
        })
        .collect();
    let mut chain = core.exec_params_checked(&numbered, &params, "execute")?;
    if !chain.command_maybe_successful() {
        return Err(result_error(&chain, "execute"));
    }
    if chain.status == ResultStatus::TuplesOk {
        chain.reached_eof = true;
        chain.account_fetch();
    }
    stmt.result = Some(chain);
    stmt.curr_tuple = -1;
    stmt.rowset_start = 0;
    stmt.rowset_rows.clear();
    Ok(())
}

fn execute_direct<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    text: &str,
    kind: StatementKind,
) -> Result<(), Error> {
    let mut flags = QueryFlags::ROLLBACK_ON_ERROR;
    if !core.autocommit && kind != StatementKind::Transaction {
        flags |= QueryFlags::GO_INTO_TRANSACTION;
    }
    // ROLLBACK and friends must go through even while the transaction is in error.
    if kind == StatementKind::Transaction {
        flags |= QueryFlags::IGNORE_ABORT_ON_CONN;
    }
    let mut chain = core.send_query(text, flags, QueryInfo::default())?;
    if !chain.command_maybe_successful() {
        return Err(result_error(&chain, "execute"));
    }
    if chain.status == ResultStatus::TuplesOk {
        // Everything is cached, the result behaves like a fully read static cursor.
        chain.reached_eof = true;
        chain.account_fetch();
    }
    stmt.result = Some(chain);
    stmt.curr_tuple = -1;
    stmt.rowset_start = 0;
    stmt.rowset_rows.clear();
    Ok(())
}

/// Moves the server cursor to `target` and refills the cache from there. The cache size is a
/// multiple of the rowset size capped by the statement's cache option.
fn refill_cache<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    target: i64,
) -> Result<(), Error> {
    let (cursor_name, server_pos) = {
        let result = stmt
            .result
            .as_ref()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        (result.cursor_name.clone(), result.server_cursor_pos)
    };
    let Some(cursor) = cursor_name else {
        // Direct results are fully cached, there is nothing to refill.
        return Ok(());
    };
    let rowset = stmt.options.rowset_size.max(1);
    let cache_rows = (stmt.options.cache_size.max(rowset) / rowset) * rowset;

    let move_by = target - server_pos;
    if move_by != 0 {
        let sql = if move_by > 0 {
            format!("MOVE {move_by} IN \"{cursor}\"")
        } else {
            format!("MOVE BACKWARD {} IN \"{cursor}\"", -move_by)
        };
        let chain = core.send_query(&sql, QueryFlags::empty(), QueryInfo::default())?;
        if !chain.command_maybe_successful() {
            return Err(result_error(&chain, "fetch"));
        }
        let moved = chain.recent_processed_row_count.unwrap_or(0);
        let result = stmt
            .result
            .as_mut()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        if move_by > 0 {
            result.server_cursor_pos += moved;
            if moved < move_by {
                result.reached_eof = true;
                result.num_total_read = result.num_total_read.max(result.server_cursor_pos);
            }
        } else {
            result.server_cursor_pos = (result.server_cursor_pos - moved).max(0);
        }
    }

    let keyset = stmt.hidden_keyset_columns > 0;
    let mut shell = stmt
        .result
        .take()
        .ok_or(Error::InvalidCursorState("no open result"))?;
    let fetch_from = shell.server_cursor_pos;
    shell.clear_cache(fetch_from);
    shell.status = ResultStatus::TuplesOk;
    let info = QueryInfo {
        result_in: Some(shell),
        keyset,
        hidden_columns: stmt.hidden_keyset_columns,
    };
    let fetch_sql = format!("FETCH FORWARD {cache_rows} IN \"{cursor}\"");
    let mut refilled = core.send_query(&fetch_sql, QueryFlags::empty(), info)?;
    if !refilled.command_maybe_successful() {
        let err = result_error(&refilled, "fetch");
        stmt.result = Some(refilled);
        return Err(err);
    }
    if refilled.num_cached_rows() < cache_rows {
        refilled.reached_eof = true;
    }
    refilled.account_fetch();
    stmt.result = Some(refilled);
    Ok(())
}

/// Total rows of the logical result: the server row count (learned through `MOVE ALL` when not
/// yet known) plus the added overlay.
fn logical_total<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
) -> Result<i64, Error> {
    let (reached_eof, cursor_name) = {
        let result = stmt
            .result
            .as_ref()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        (result.reached_eof, result.cursor_name.clone())
    };
    if !reached_eof {
        let moved = match cursor_name {
            Some(cursor) => {
                let chain = core.send_query(
                    &format!("MOVE ALL IN \"{cursor}\""),
                    QueryFlags::empty(),
                    QueryInfo::default(),
                )?;
                if !chain.command_maybe_successful() {
                    return Err(result_error(&chain, "fetch"));
                }
                chain.recent_processed_row_count.unwrap_or(0)
            }
            // A direct result is fully cached already.
            None => 0,
        };
        let result = stmt
            .result
            .as_mut()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        result.server_cursor_pos += moved;
        result.num_total_read = result.num_total_read.max(result.server_cursor_pos);
        result.reached_eof = true;
    }
    let result = stmt
        .result
        .as_ref()
        .ok_or(Error::InvalidCursorState("no open result"))?;
    Ok(result.total_with_added())
}

/// Start of the rowset PRIOR delivers: walks backward from the current window skipping rows
/// deleted through this cursor.
fn prior_rowset_start<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    rowset_size: usize,
) -> Result<i64, Error> {
    let upper = if stmt.curr_tuple < 0 && stmt.rowset_start == 0 {
        // Before the first row, PRIOR has nothing.
        return Ok(-1);
    } else {
        stmt.rowset_start.min(logical_total(core, stmt)?)
    };
    let result = stmt
        .result
        .as_ref()
        .ok_or(Error::InvalidCursorState("no open result"))?;
    let mut collected = 0;
    let mut index = upper - 1;
    while index >= 0 {
        if !result.is_deleted(index) {
            collected += 1;
            if collected == rowset_size {
                break;
            }
        }
        index -= 1;
    }
    if collected == 0 {
        return Ok(-1);
    }
    Ok(index.max(0))
}

/// Collects the rowset starting at `target`: cached server rows (refilling the cache as needed),
/// skipping rows deleted through this cursor, and synthesising rows from the added overlay past
/// the server visible end.
fn assemble_rowset<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    target: i64,
    rowset_size: usize,
) -> Result<Vec<(i64, RowStatus)>, Error> {
    let mut rows = Vec::with_capacity(rowset_size);
    let mut absolute = target;
    loop {
        if rows.len() == rowset_size {
            break;
        }
        let result = stmt
            .result
            .as_ref()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        let in_server_rows = !result.reached_eof || absolute < result.num_total_read;
        if in_server_rows {
            if result.cache_slot(absolute).is_none() {
                refill_cache(core, stmt, absolute)?;
                let result = stmt
                    .result
                    .as_ref()
                    .ok_or(Error::InvalidCursorState("no open result"))?;
                if result.cache_slot(absolute).is_none() {
                    if result.reached_eof && absolute >= result.num_total_read {
                        // Ran past the server rows, the overlay takes over.
                        continue;
                    }
                    return Err(Error::FetchOutOfRange);
                }
            }
            let result = stmt
                .result
                .as_ref()
                .ok_or(Error::InvalidCursorState("no open result"))?;
            if result.is_deleted(absolute) {
                absolute += 1;
                continue;
            }
            let status = result
                .key(absolute)
                .map(|key| key.status)
                .unwrap_or_default();
            rows.push((absolute, status));
            absolute += 1;
        } else {
            // Past the server rows: deliver locally added rows which the server cursor cannot
            // see yet.
            let added = (absolute - result.num_total_read) as usize;
            match result.added.get(added) {
                Some(row) => {
                    let mut status = row.key.status;
                    status.insert(RowStatus::ADDED);
                    rows.push((absolute, status));
                    absolute += 1;
                }
                None => break,
            }
        }
    }
    Ok(rows)
}

/// Hydrates rows of the delivered window whose cache bytes are marked stale, with one batched
/// ctid lookup (`WHERE ctid IN (...)`).
fn hydrate_reread_rows<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    rowset: &[(i64, RowStatus)],
) -> Result<(), Error> {
    let mut stale: Vec<(i64, String)> = Vec::new();
    for (absolute, status) in rowset {
        if status.contains(RowStatus::NEEDS_REREAD) {
            let key = current_key(stmt, *absolute)?;
            stale.push((*absolute, key.ctid()));
        }
    }
    if stale.is_empty() {
        return Ok(());
    }
    let (table, _) = updatable_table(stmt)?;
    let column_list = {
        let result = stmt
            .result
            .as_ref()
            .ok_or(Error::InvalidCursorState("no open result"))?;
        result
            .fields
            .iter()
            .map(|field| format!("\"{}\"", field.name))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let in_list = stale
        .iter()
        .map(|(_, ctid)| format!("'{ctid}'"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT ctid, {column_list} FROM {table} WHERE ctid IN ({in_list})");
    let wire = core.exec_checked(&sql, "reread")?;

    let result = stmt
        .result
        .as_mut()
        .ok_or(Error::InvalidCursorState("no open result"))?;
    for row in 0..wire.num_rows() {
        let Some(ctid) = wire.value(row, 0) else {
            continue;
        };
        let ctid = String::from_utf8_lossy(ctid).into_owned();
        let Some((absolute, _)) = stale.iter().find(|(_, candidate)| *candidate == ctid) else {
            continue;
        };
        let tuple = (1..wire.num_fields())
            .map(|col| wire.value(row, col).map(<[u8]>::to_vec))
            .collect();
        if let Some(slot) = result.cache_slot(*absolute) {
            if let Some(cached) = result.tuple_mut(slot) {
                *cached = tuple;
            }
        }
        if let Some(entry) = result.key_mut(*absolute) {
            entry.status.remove(RowStatus::NEEDS_REREAD);
        }
    }
    Ok(())
}

/// Single row re-read by ctid, refreshing the cached bytes and clearing the stale mark.
fn reread_row<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    absolute: i64,
) -> Result<(), Error> {
    let key = current_key(stmt, absolute)?;
    let tuple = fetch_row_by_ctid(core, stmt, &key)?;
    let result = stmt
        .result
        .as_mut()
        .ok_or(Error::InvalidCursorState("no open result"))?;
    if absolute >= result.num_total_read {
        let added = (absolute - result.num_total_read) as usize;
        if let Some(row) = result.added.get_mut(added) {
            row.tuple = tuple;
            row.key.status.remove(RowStatus::NEEDS_REREAD);
        }
    } else {
        if let Some(slot) = result.cache_slot(absolute) {
            if let Some(cached) = result.tuple_mut(slot) {
                *cached = tuple;
            }
        }
        if let Some(entry) = result.key_mut(absolute) {
            entry.status.remove(RowStatus::NEEDS_REREAD);
        }
    }
    Ok(())
}

/// Reads the visible columns of one row by its ctid.
fn fetch_row_by_ctid<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    key: &KeySet,
) -> Result<crate::query_result::Tuple, Error> {
    let (table, _) = updatable_table(stmt)?;
    let result = stmt
        .result
        .as_ref()
        .ok_or(Error::InvalidCursorState("no open result"))?;
    let column_list = if result.fields.is_empty() {
        "*".to_string()
    } else {
        result
            .fields
            .iter()
            .map(|field| format!("\"{}\"", field.name))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let sql = format!(
        "SELECT {column_list} FROM {table} WHERE ctid = '{}'",
        key.ctid()
    );
    let wire = core.exec_checked(&sql, "reread")?;
    if wire.num_rows() == 0 {
        return Err(Error::RowVersionChanged);
    }
    let tuple = (0..wire.num_fields())
        .map(|col| wire.value(0, col).map(<[u8]>::to_vec))
        .collect();
    Ok(tuple)
}

/// Follows a row's ctid after an UPDATE on servers without `RETURNING`.
fn follow_ctid<C: WireClient>(
    core: &mut ConnCore<C>,
    table: &str,
    key: &KeySet,
) -> Result<Option<(u32, u16)>, Error> {
    let sql = format!("select currtid2('{table}', '{}')", key.ctid());
    let wire = core.exec_checked(&sql, "follow_ctid")?;
    Ok(wire.value(0, 0).and_then(crate::connection::parse_ctid))
}

/// Walks the undo log of one statement in reverse, restoring keyset entries and overlays. See
/// the transaction abort rules in the module documentation of `query_result`.
fn undo_positioned_ops<C: WireClient>(
    core: &mut ConnCore<C>,
    stmt: &mut Statement,
    partial: bool,
) -> Result<(), Error> {
    let Some(result) = stmt.result.as_mut() else {
        return Ok(());
    };
    let mut records = std::mem::take(&mut result.rollback);
    let mut stop_after = None;
    let table = match updatable_table(stmt) {
        Ok((table, _)) => table,
        // Without a base table there can be no records to undo.
        Err(_) => return Ok(()),
    };

    for (walk_index, record) in records.iter().enumerate().rev() {
        match record.op {
            RollbackOp::Add => {
                let result = stmt
                    .result
                    .as_mut()
                    .ok_or(Error::InvalidCursorState("no open result"))?;
                let added = (record.index - result.num_total_read) as usize;
                if added < result.added.len() {
                    result.added.remove(added);
                }
            }
            RollbackOp::Update | RollbackOp::Delete | RollbackOp::Refresh => {
                let ctid = format!("({},{})", record.block, record.offset);
                let probe = format!("SELECT 1 FROM {table} WHERE ctid = '{ctid}'");
                let exists = core
                    .exec_checked(&probe, "rollback")
                    .map(|wire| wire.num_rows() > 0)
                    .unwrap_or(false);
                let in_rowset = stmt.rowset_rows.contains(&record.index);
                let result = stmt
                    .result
                    .as_mut()
                    .ok_or(Error::InvalidCursorState("no open result"))?;
                if record.op == RollbackOp::Delete {
                    result.unmark_deleted(record.index);
                }
                if let Some(entry) = result.key_mut(record.index) {
                    if exists {
                        entry.block = record.block;
                        entry.offset = record.offset;
                    }
                    entry.status.remove(
                        RowStatus::DELETED
                            | RowStatus::UPDATED
                            | RowStatus::SELF_DELETING
                            | RowStatus::SELF_UPDATING,
                    );
                    entry.status.insert(RowStatus::NEEDS_REREAD);
                }
                if exists && in_rowset {
                    if let Err(err) = reread_row(core, stmt, record.index) {
                        debug!("re-read after rollback failed: {err}");
                    }
                }
                // A savepoint rollback restores only the tail of the log: once a record's old
                // ctid is live again, the earlier records belong to still committed work.
                if partial && exists {
                    stop_after = Some(walk_index);
                    break;
                }
            }
        }
    }

    let result = stmt
        .result
        .as_mut()
        .ok_or(Error::InvalidCursorState("no open result"))?;
    if partial {
        if let Some(stop) = stop_after {
            records.truncate(stop);
            result.rollback = records;
            return Ok(());
        }
    }
    result.rollback.clear();
    Ok(())
}
