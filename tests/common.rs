//! Shared harness: a scripted in-memory wire client.
//!
//! Tests install a session script (server parameters plus an ordered list of expected dispatches
//! with their canned results) and open a connection over [`ScriptedClient`]. Every dispatch pops
//! the next expectation; a dispatch the script did not foresee panics with the offending SQL, so
//! a drifting statement generator fails loudly.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use pg_odbc::client::{
    DiagField, ExecStatus, Format, LibraryError, Notice, Oid, SessionStatus, WireClient,
    WireParam, WireResult, WireTransactionStatus,
};

thread_local! {
    static INSTALLED: RefCell<Option<Script>> = const { RefCell::new(None) };
}

pub struct Script {
    pub parameters: HashMap<String, String>,
    pub expectations: VecDeque<Expectation>,
}

pub struct Expectation {
    /// The dispatched SQL must contain this fragment.
    pub fragment: String,
    pub results: Vec<MockResult>,
    /// Transaction state the server would report after the dispatch.
    pub txn_after: WireTransactionStatus,
    pub notices: Vec<Notice>,
}

/// Installs the script the next [`ScriptedClient::open`] on this thread picks up. Also brings
/// up logging so `RUST_LOG=debug` shows the dispatched SQL of a failing test.
pub fn install(parameters: &[(&str, &str)], expectations: Vec<Expectation>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let script = Script {
        parameters: parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        expectations: expectations.into(),
    };
    INSTALLED.with(|cell| *cell.borrow_mut() = Some(script));
}

/// Server parameters every test connection starts from.
pub fn default_parameters() -> Vec<(&'static str, &'static str)> {
    vec![
        ("server_version", "9.6.0"),
        ("standard_conforming_strings", "on"),
        ("client_encoding", "UTF8"),
    ]
}

pub fn expect(
    fragment: &str,
    results: Vec<MockResult>,
    txn_after: WireTransactionStatus,
) -> Expectation {
    Expectation {
        fragment: fragment.to_string(),
        results,
        txn_after,
        notices: Vec::new(),
    }
}

/// The session fact lookup every connection performs: the large object type probe.
pub fn connect_expectations() -> Vec<Expectation> {
    vec![expect(
        "typname = 'lo'",
        vec![tuples(&[("oid", 26)], &[])],
        WireTransactionStatus::Idle,
    )]
}

#[derive(Debug, Clone)]
pub struct MockField {
    pub name: String,
    pub oid: Oid,
    pub typmod: i32,
    pub relid: Oid,
    pub attnum: i16,
}

#[derive(Debug, Clone)]
pub struct MockResult {
    pub status: ExecStatus,
    pub tag: String,
    pub fields: Vec<MockField>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    pub sqlstate: Option<String>,
    pub message: Option<String>,
}

pub fn command_ok(tag: &str) -> MockResult {
    MockResult {
        status: ExecStatus::CommandOk,
        tag: tag.to_string(),
        fields: Vec::new(),
        rows: Vec::new(),
        sqlstate: None,
        message: None,
    }
}

/// Row bearing result; `fields` pairs column names with type oids, cells are UTF-8 texts.
pub fn tuples(fields: &[(&str, Oid)], rows: &[&[&str]]) -> MockResult {
    MockResult {
        status: ExecStatus::TuplesOk,
        tag: format!("SELECT {}", rows.len()),
        fields: fields
            .iter()
            .map(|(name, oid)| MockField {
                name: name.to_string(),
                oid: *oid,
                typmod: -1,
                relid: 0,
                attnum: 0,
            })
            .collect(),
        rows: rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| Some(cell.as_bytes().to_vec()))
                    .collect()
            })
            .collect(),
        sqlstate: None,
        message: None,
    }
}

/// Like [`tuples`], with explicit NULL support.
pub fn tuples_opt(fields: &[(&str, Oid)], rows: &[&[Option<&str>]]) -> MockResult {
    let mut result = tuples(fields, &[]);
    result.tag = format!("SELECT {}", rows.len());
    result.rows = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| cell.map(|text| text.as_bytes().to_vec()))
                .collect()
        })
        .collect();
    result
}

pub fn server_error(sqlstate: &str, message: &str) -> MockResult {
    MockResult {
        status: ExecStatus::FatalError,
        tag: String::new(),
        fields: Vec::new(),
        rows: Vec::new(),
        sqlstate: Some(sqlstate.to_string()),
        message: Some(message.to_string()),
    }
}

impl WireResult for MockResult {
    fn status(&self) -> ExecStatus {
        self.status
    }

    fn command_tag(&self) -> &str {
        &self.tag
    }

    fn error_message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    fn error_field(&self, field: DiagField) -> Option<&str> {
        match field {
            DiagField::Sqlstate => self.sqlstate.as_deref(),
            DiagField::MessagePrimary => self.message.as_deref(),
            _ => None,
        }
    }

    fn num_fields(&self) -> usize {
        self.fields.len()
    }

    fn field_name(&self, field: usize) -> &str {
        &self.fields[field].name
    }

    fn field_type(&self, field: usize) -> Oid {
        self.fields[field].oid
    }

    fn field_typmod(&self, field: usize) -> i32 {
        self.fields[field].typmod
    }

    fn field_relid(&self, field: usize) -> Oid {
        self.fields[field].relid
    }

    fn field_attnum(&self, field: usize) -> i16 {
        self.fields[field].attnum
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn is_null(&self, row: usize, field: usize) -> bool {
        self.value(row, field).is_none()
    }

    fn value(&self, row: usize, field: usize) -> Option<&[u8]> {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(field))
            .and_then(|cell| cell.as_deref())
    }
}

pub struct ScriptedClient {
    parameters: HashMap<String, String>,
    expectations: VecDeque<Expectation>,
    pending: VecDeque<MockResult>,
    pending_notices: Vec<Notice>,
    txn: WireTransactionStatus,
    large_objects: HashMap<Oid, Vec<u8>>,
    descriptors: HashMap<i32, (Oid, usize)>,
    next_oid: Oid,
    next_fd: i32,
}

impl ScriptedClient {
    fn next_expectation(&mut self, sql: &str) -> Expectation {
        let expectation = self
            .expectations
            .pop_front()
            .unwrap_or_else(|| panic!("dispatch beyond the installed script: {sql}"));
        assert!(
            sql.contains(&expectation.fragment),
            "dispatched SQL does not match the script.\n  dispatched: {sql}\n  expected fragment: {}",
            expectation.fragment
        );
        expectation
    }

    /// Expectations the test forgot to consume usually point at a missing assertion.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }
}

impl WireClient for ScriptedClient {
    type Result = MockResult;

    fn open(_params: &[(String, String)]) -> Result<Self, LibraryError> {
        let script = INSTALLED
            .with(|cell| cell.borrow_mut().take())
            .expect("install a session script before connecting");
        Ok(ScriptedClient {
            parameters: script.parameters,
            expectations: script.expectations,
            pending: VecDeque::new(),
            pending_notices: Vec::new(),
            txn: WireTransactionStatus::Idle,
            large_objects: HashMap::new(),
            descriptors: HashMap::new(),
            next_oid: 33000,
            next_fd: 1,
        })
    }

    fn status(&self) -> SessionStatus {
        SessionStatus::Ok
    }

    fn transaction_status(&self) -> WireTransactionStatus {
        self.txn
    }

    fn parameter_status(&self, name: &str) -> Option<String> {
        self.parameters.get(name).cloned()
    }

    fn send_query(&mut self, sql: &str) -> Result<(), LibraryError> {
        let expectation = self.next_expectation(sql);
        self.pending = expectation.results.into();
        self.pending_notices = expectation.notices;
        self.txn = expectation.txn_after;
        Ok(())
    }

    fn get_result(&mut self) -> Result<Option<Self::Result>, LibraryError> {
        Ok(self.pending.pop_front())
    }

    fn exec(&mut self, sql: &str) -> Result<Self::Result, LibraryError> {
        self.send_query(sql)?;
        let mut last = None;
        while let Some(result) = self.pending.pop_front() {
            last = Some(result);
        }
        last.ok_or_else(|| LibraryError::Usage("script returned no result".to_string()))
    }

    fn exec_params(
        &mut self,
        sql: &str,
        _params: &[WireParam],
        _result_format: Format,
    ) -> Result<Self::Result, LibraryError> {
        self.exec(sql)
    }

    fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.pending_notices)
    }

    fn cancel(&mut self) -> Result<(), LibraryError> {
        Ok(())
    }

    fn ssl_in_use(&self) -> bool {
        false
    }

    fn lo_creat(&mut self) -> Result<Oid, LibraryError> {
        let oid = self.next_oid;
        self.next_oid += 1;
        self.large_objects.insert(oid, Vec::new());
        Ok(oid)
    }

    fn lo_open(&mut self, oid: Oid, _mode: i32) -> Result<i32, LibraryError> {
        if !self.large_objects.contains_key(&oid) {
            return Err(LibraryError::Usage(format!("no large object {oid}")));
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.descriptors.insert(fd, (oid, 0));
        Ok(fd)
    }

    fn lo_read(&mut self, fd: i32, len: usize) -> Result<Vec<u8>, LibraryError> {
        let (oid, pos) = self
            .descriptors
            .get_mut(&fd)
            .ok_or_else(|| LibraryError::Usage("bad descriptor".to_string()))?;
        let content = &self.large_objects[oid];
        let end = (*pos + len).min(content.len());
        let chunk = content[*pos..end].to_vec();
        *pos = end;
        Ok(chunk)
    }

    fn lo_write(&mut self, fd: i32, data: &[u8]) -> Result<usize, LibraryError> {
        let (oid, pos) = self
            .descriptors
            .get_mut(&fd)
            .ok_or_else(|| LibraryError::Usage("bad descriptor".to_string()))?;
        let content = self
            .large_objects
            .get_mut(oid)
            .expect("descriptor to open object");
        if content.len() < *pos + data.len() {
            content.resize(*pos + data.len(), 0);
        }
        content[*pos..*pos + data.len()].copy_from_slice(data);
        *pos += data.len();
        Ok(data.len())
    }

    fn lo_lseek(&mut self, fd: i32, offset: i32, _whence: i32) -> Result<i32, LibraryError> {
        if let Some((_, pos)) = self.descriptors.get_mut(&fd) {
            *pos = offset as usize;
        }
        Ok(offset)
    }

    fn lo_close(&mut self, fd: i32) -> Result<(), LibraryError> {
        self.descriptors.remove(&fd);
        Ok(())
    }

    fn lo_unlink(&mut self, oid: Oid) -> Result<(), LibraryError> {
        self.large_objects.remove(&oid);
        Ok(())
    }
}
