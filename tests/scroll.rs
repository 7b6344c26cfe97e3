//! End to end scenarios of the cursor engine, driven against the scripted wire client.

mod common;

use common::{
    command_ok, connect_expectations, default_parameters, expect, install, tuples, Expectation,
    ScriptedClient,
};
use pg_odbc::client::WireTransactionStatus::{Idle, InTransaction};
use pg_odbc::{
    BoundValue, Concurrency, Connection, CopyOutcome, CursorType, FetchOrientation,
    GetDataOutcome, RowStatus, StatementId,
};

fn connect(connection_string: &str, expectations: Vec<Expectation>) -> Connection<ScriptedClient> {
    let mut script = connect_expectations();
    script.extend(expectations);
    install(&default_parameters(), script);
    let options = pg_odbc::ConnectOptions::parse(connection_string).unwrap();
    Connection::establish(options).unwrap()
}

/// Catalog answer for a table `t(id int not null, s text)` with a unique index on `id`.
fn catalog_for_t() -> Vec<Expectation> {
    vec![
        expect(
            "pg_attribute",
            vec![tuples(
                &[
                    ("attname", 19),
                    ("atttypid", 26),
                    ("atttypmod", 23),
                    ("attnotnull", 16),
                    ("attnum", 21),
                    ("oid", 26),
                    ("relhasoids", 16),
                ],
                &[
                    &["id", "23", "-1", "t", "1", "1000", "f"],
                    &["s", "25", "-1", "f", "2", "1000", "f"],
                ],
            )],
            Idle,
        ),
        expect(
            "pg_index",
            vec![tuples(&[("attname", 19)], &[&["id"]])],
            Idle,
        ),
    ]
}

/// Opens the keyset cursor of the round trip scenario: two rows, rowset size two.
fn open_keyset_cursor(conn: &mut Connection<ScriptedClient>) -> StatementId {
    let id = conn.alloc_statement();
    let stmt = conn.statement_mut(id).unwrap();
    stmt.set_sql("SELECT id, s FROM t ORDER BY id");
    stmt.options.cursor_type = CursorType::KeysetDriven;
    stmt.options.concurrency = Concurrency::RowVersion;
    stmt.options.rowset_size = 2;
    conn.execute(id).unwrap();
    id
}

fn keyset_cursor_expectations() -> Vec<Expectation> {
    let mut expectations = catalog_for_t();
    expectations.push(expect(
        "DECLARE \"SQL_CUR1\" CURSOR FOR SELECT id, s, \"ctid\" FROM t ORDER BY id",
        vec![command_ok("BEGIN"), command_ok("DECLARE CURSOR")],
        InTransaction,
    ));
    expectations.push(expect(
        "FETCH FORWARD 100 IN \"SQL_CUR1\"",
        vec![tuples(
            &[("id", 23), ("s", 25), ("ctid", 27)],
            &[&["1", "hi", "(0,1)"], &["2", "bye", "(0,2)"]],
        )],
        InTransaction,
    ));
    expectations
}

fn read_text(
    conn: &mut Connection<ScriptedClient>,
    id: StatementId,
    row: usize,
    column: u16,
) -> String {
    let mut buf = [0u8; 32];
    match conn.get_data(id, row, column, &mut buf).unwrap() {
        GetDataOutcome::Data(CopyOutcome::Success { length }) => {
            String::from_utf8_lossy(&buf[..length]).into_owned()
        }
        other => panic!("expected a complete value, got {other:?}"),
    }
}

/// Insert two rows, read them back through a keyset cursor with rowset size two.
#[test]
fn round_trip_insert_and_keyset_select() {
    let mut expectations = vec![expect(
        "INSERT INTO t VALUES",
        vec![command_ok("INSERT 0 2")],
        Idle,
    )];
    expectations.extend(keyset_cursor_expectations());
    let mut conn = connect("", expectations);

    let id = conn.alloc_statement();
    conn.statement_mut(id)
        .unwrap()
        .set_sql("INSERT INTO t VALUES (1,'hi'), (2,'bye')");
    conn.execute(id).unwrap();
    assert_eq!(2, conn.rows_affected(id).unwrap());

    {
        let stmt = conn.statement_mut(id).unwrap();
        stmt.set_sql("SELECT id, s FROM t ORDER BY id");
        stmt.options.cursor_type = CursorType::KeysetDriven;
        stmt.options.concurrency = Concurrency::RowVersion;
        stmt.options.rowset_size = 2;
    }
    conn.execute(id).unwrap();

    let rowset = conn
        .fetch_scroll(id, FetchOrientation::Next)
        .unwrap()
        .expect("two rows");
    assert_eq!(0, rowset.start);
    assert_eq!(vec![0, 1], rowset.rows);
    assert!(rowset.statuses.iter().all(|status| status.is_empty()));

    assert_eq!("1", read_text(&mut conn, id, 0, 1));
    assert_eq!("hi", read_text(&mut conn, id, 0, 2));
    assert_eq!("2", read_text(&mut conn, id, 1, 1));
    assert_eq!("bye", read_text(&mut conn, id, 1, 2));
}

/// A positioned delete followed by a transaction rollback restores keyset and status bits.
#[test]
fn positioned_delete_rolled_back_restores_the_row() {
    let mut expectations = keyset_cursor_expectations();
    expectations.extend(vec![
        expect(
            "DELETE FROM \"t\" WHERE ctid = '(0,1)'",
            vec![command_ok("DELETE 1")],
            InTransaction,
        ),
        expect("ROLLBACK", vec![command_ok("ROLLBACK")], Idle),
        expect(
            "SELECT 1 FROM \"t\" WHERE ctid = '(0,1)'",
            vec![tuples(&[("?column?", 23)], &[&["1"]])],
            Idle,
        ),
        expect(
            "SELECT \"id\", \"s\" FROM \"t\" WHERE ctid = '(0,1)'",
            vec![tuples(&[("id", 23), ("s", 25)], &[&["1", "hi"]])],
            Idle,
        ),
    ]);
    let mut conn = connect("", expectations);
    let id = open_keyset_cursor(&mut conn);
    conn.fetch_scroll(id, FetchOrientation::Next)
        .unwrap()
        .expect("two rows");

    conn.set_pos_delete(id, 0).unwrap();
    {
        let result = conn.statement(id).unwrap().result.as_ref().unwrap();
        let status = result.key(0).unwrap().status;
        assert!(status.contains(RowStatus::DELETED));
        assert!(status.contains(RowStatus::SELF_DELETING));
        assert_eq!(&[0], result.deleted_rows());
    }

    conn.abort().unwrap();

    let result = conn.statement(id).unwrap().result.as_ref().unwrap();
    assert!(result.key(0).unwrap().status.is_empty());
    assert!(result.deleted_rows().is_empty());
    assert!(result.rollback.is_empty());
    // The undo log re-read refreshed the cached bytes.
    assert_eq!(Some(b"hi".as_slice()), result.value(0, 1));
}

/// A row inserted through the cursor lives in the added overlay: FETCH LAST delivers it with the
/// added status and a replayable bookmark.
#[test]
fn fetch_last_delivers_the_added_row_with_bookmark() {
    let mut expectations = keyset_cursor_expectations();
    expectations.extend(vec![
        expect(
            "INSERT INTO \"t\" (\"id\", \"s\") VALUES (3, 'new') RETURNING ctid",
            vec![tuples(&[("ctid", 27)], &[&["(0,3)"]])],
            InTransaction,
        ),
        expect(
            "SELECT \"id\", \"s\" FROM \"t\" WHERE ctid = '(0,3)'",
            vec![tuples(&[("id", 23), ("s", 25)], &[&["3", "new"]])],
            InTransaction,
        ),
    ]);
    let mut conn = connect("", expectations);
    let id = open_keyset_cursor(&mut conn);

    let bookmark = conn
        .set_pos_insert(
            id,
            &[
                (1, BoundValue::Int(3)),
                (2, BoundValue::Char(b"new".to_vec())),
            ],
        )
        .unwrap();
    assert_eq!(3, bookmark);

    let rowset = conn
        .fetch_scroll(id, FetchOrientation::Last)
        .unwrap()
        .expect("last rowset");
    assert_eq!(1, rowset.start);
    assert_eq!(vec![1, 2], rowset.rows);
    assert!(rowset.statuses[1].contains(RowStatus::ADDED));
    assert_eq!(3, conn.bookmark(id, 1).unwrap());
    assert_eq!("3", read_text(&mut conn, id, 1, 1));
    assert_eq!("new", read_text(&mut conn, id, 1, 2));

    // Replaying the bookmark scrolls back to the added row.
    let replay = conn
        .fetch_scroll(
            id,
            FetchOrientation::Bookmark {
                bookmark,
                offset: 0,
            },
        )
        .unwrap()
        .expect("bookmark target");
    assert_eq!(vec![2], replay.rows);

    // A bookmark offset past the end clamps to no data, not to the last row.
    let past_end = conn
        .fetch_scroll(
            id,
            FetchOrientation::Bookmark {
                bookmark,
                offset: 5,
            },
        )
        .unwrap();
    assert!(past_end.is_none());
}

/// Servers older than 8.2 have no `RETURNING`: a positioned insert locates the new row through
/// a `currtid` probe on the invalid tid instead.
#[test]
fn positioned_insert_probes_currtid_on_old_servers() {
    let mut script = connect_expectations();
    script.extend(keyset_cursor_expectations());
    script.extend(vec![
        expect(
            "INSERT INTO \"t\" (\"id\", \"s\") VALUES (3, 'new')",
            vec![command_ok("INSERT 17 1")],
            InTransaction,
        ),
        expect(
            "select currtid(0, '(0,0)')",
            vec![tuples(&[("currtid", 27)], &[&["(0,3)"]])],
            InTransaction,
        ),
        expect(
            "SELECT \"id\", \"s\" FROM \"t\" WHERE ctid = '(0,3)'",
            vec![tuples(&[("id", 23), ("s", 25)], &[&["3", "new"]])],
            InTransaction,
        ),
    ]);
    install(&[("server_version", "8.0.2"), ("client_encoding", "UTF8")], script);
    let options = pg_odbc::ConnectOptions::parse("").unwrap();
    let mut conn: Connection<ScriptedClient> = Connection::establish(options).unwrap();

    let id = open_keyset_cursor(&mut conn);
    let bookmark = conn
        .set_pos_insert(
            id,
            &[
                (1, BoundValue::Int(3)),
                (2, BoundValue::Char(b"new".to_vec())),
            ],
        )
        .unwrap();
    assert_eq!(3, bookmark);
    let rowset = conn
        .fetch_scroll(id, FetchOrientation::Last)
        .unwrap()
        .expect("last rowset");
    assert!(rowset.statuses[1].contains(RowStatus::ADDED));
    assert_eq!("new", read_text(&mut conn, id, 1, 2));
}

/// An empty result: FETCH NEXT reports no data and positions after the end.
#[test]
fn empty_result_fetch_next_returns_no_data() {
    let mut expectations = catalog_for_t();
    expectations.push(expect(
        "DECLARE \"SQL_CUR1\" CURSOR FOR SELECT id, s, \"ctid\" FROM t",
        vec![command_ok("BEGIN"), command_ok("DECLARE CURSOR")],
        InTransaction,
    ));
    expectations.push(expect(
        "FETCH FORWARD 100 IN \"SQL_CUR1\"",
        vec![tuples(&[("id", 23), ("s", 25), ("ctid", 27)], &[])],
        InTransaction,
    ));
    let mut conn = connect("", expectations);
    let id = conn.alloc_statement();
    let stmt = conn.statement_mut(id).unwrap();
    stmt.set_sql("SELECT id, s FROM t");
    stmt.options.cursor_type = CursorType::KeysetDriven;
    stmt.options.concurrency = Concurrency::RowVersion;
    stmt.options.rowset_size = 2;
    conn.execute(id).unwrap();

    assert!(conn.fetch_scroll(id, FetchOrientation::Next).unwrap().is_none());
    // The position stays after the end, further NEXT calls keep reporting no data.
    assert!(conn.fetch_scroll(id, FetchOrientation::Next).unwrap().is_none());
}

/// With `lf_conversion` on, character data grows carriage returns in front of bare line feeds,
/// and a zero sized buffer reports the unmodified length.
#[test]
fn lf_conversion_on_char_columns() {
    let mut expectations = vec![expect(
        "pg_attribute",
        vec![tuples(
            &[
                ("attname", 19),
                ("atttypid", 26),
                ("atttypmod", 23),
                ("attnotnull", 16),
                ("attnum", 21),
                ("oid", 26),
                ("relhasoids", 16),
            ],
            &[&["s", "25", "-1", "f", "1", "1000", "f"]],
        )],
        Idle,
    )];
    // No single column unique index: rows are not individually addressable.
    expectations.push(expect("pg_index", vec![tuples(&[("attname", 19)], &[])], Idle));
    expectations.push(expect(
        "DECLARE \"SQL_CUR1\" CURSOR FOR SELECT s FROM t",
        vec![command_ok("BEGIN"), command_ok("DECLARE CURSOR")],
        InTransaction,
    ));
    expectations.push(expect(
        "FETCH FORWARD 100 IN \"SQL_CUR1\"",
        vec![tuples(&[("s", 25)], &[&["a\nb"]])],
        InTransaction,
    ));
    let mut conn = connect("lf_conversion=1", expectations);
    let id = conn.alloc_statement();
    conn.statement_mut(id).unwrap().set_sql("SELECT s FROM t");
    conn.execute(id).unwrap();
    conn.fetch_scroll(id, FetchOrientation::Next)
        .unwrap()
        .expect("one row");

    // cbValueMax of zero: nothing is written, the indicator carries the converted length.
    let outcome = conn.get_data(id, 0, 1, &mut []).unwrap();
    assert_eq!(
        GetDataOutcome::Data(CopyOutcome::Truncated {
            written: 0,
            full_length: 4
        }),
        outcome
    );

    let mut buf = [0u8; 16];
    let outcome = conn.get_data(id, 0, 1, &mut buf).unwrap();
    assert_eq!(
        GetDataOutcome::Data(CopyOutcome::Success { length: 4 }),
        outcome
    );
    assert_eq!(b"a\r\nb\0", &buf[..5]);
}

/// FETCH PRIOR from the after-end position walks back into the result, including overlay rows.
#[test]
fn fetch_prior_after_end_returns_the_last_rowset() {
    let mut expectations = keyset_cursor_expectations();
    let mut conn = {
        expectations.push(expect(
            "INSERT INTO \"t\" (\"id\", \"s\") VALUES (3, 'new') RETURNING ctid",
            vec![tuples(&[("ctid", 27)], &[&["(0,3)"]])],
            InTransaction,
        ));
        expectations.push(expect(
            "SELECT \"id\", \"s\" FROM \"t\" WHERE ctid = '(0,3)'",
            vec![tuples(&[("id", 23), ("s", 25)], &[&["3", "new"]])],
            InTransaction,
        ));
        connect("", expectations)
    };
    let id = open_keyset_cursor(&mut conn);
    conn.set_pos_insert(
        id,
        &[
            (1, BoundValue::Int(3)),
            (2, BoundValue::Char(b"new".to_vec())),
        ],
    )
    .unwrap();

    // Walk past the end: 2 server rows + 1 added row with rowset size 2.
    assert!(conn.fetch_scroll(id, FetchOrientation::Next).unwrap().is_some());
    assert!(conn.fetch_scroll(id, FetchOrientation::Next).unwrap().is_some());
    assert!(conn.fetch_scroll(id, FetchOrientation::Next).unwrap().is_none());

    let rowset = conn
        .fetch_scroll(id, FetchOrientation::Prior)
        .unwrap()
        .expect("prior rowset");
    assert_eq!(vec![1, 2], rowset.rows);
}
