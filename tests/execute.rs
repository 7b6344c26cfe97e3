//! Executor and transaction behaviour against the scripted wire client.

mod common;

use common::{
    command_ok, connect_expectations, default_parameters, expect, install, server_error, tuples,
    Expectation, ScriptedClient,
};
use pg_odbc::client::WireTransactionStatus::{Idle, InError, InTransaction};
use pg_odbc::{
    BoundValue, Connection, CursorType, Environment, Error, ParamBinding, State, TransactionPhase,
};

fn connect(connection_string: &str, expectations: Vec<Expectation>) -> Connection<ScriptedClient> {
    let mut script = connect_expectations();
    script.extend(expectations);
    install(&default_parameters(), script);
    let options = pg_odbc::ConnectOptions::parse(connection_string).unwrap();
    Connection::establish(options).unwrap()
}

#[test]
fn parameters_are_substituted_into_the_dispatched_text() {
    let mut conn = connect(
        "",
        vec![expect(
            "INSERT INTO t VALUES (5, 'it''s')",
            vec![command_ok("INSERT 0 1")],
            Idle,
        )],
    );
    let id = conn.alloc_statement();
    let stmt = conn.statement_mut(id).unwrap();
    stmt.set_sql("INSERT INTO t VALUES (?, ?)");
    stmt.bind_param(1, ParamBinding::value(BoundValue::Int(5)));
    stmt.bind_param(2, ParamBinding::value(BoundValue::Char(b"it's".to_vec())));
    conn.execute(id).unwrap();
    assert_eq!(1, conn.rows_affected(id).unwrap());
}

#[test]
fn server_error_surfaces_its_sqlstate() {
    let mut conn = connect(
        "",
        vec![expect(
            "KABOOM",
            vec![server_error("42601", "syntax error at or near \"KABOOM\"")],
            Idle,
        )],
    );
    let id = conn.alloc_statement();
    conn.statement_mut(id).unwrap().set_sql("KABOOM");
    let err = conn.execute(id).unwrap_err();
    assert_eq!(State::SYNTAX_ERROR, err.state());
    // The failure is recorded in the statement's error slot as well.
    assert!(conn.statement(id).unwrap().error.is_some());
}

/// After a statement error inside a transaction every further statement fails fast until the
/// application rolls back.
#[test]
fn failed_transaction_fails_fast_until_rollback() {
    let mut conn = connect(
        "",
        vec![
            expect("BEGIN", vec![command_ok("BEGIN")], InTransaction),
            expect(
                "KABOOM",
                vec![server_error("42601", "syntax error")],
                InError,
            ),
            expect("ROLLBACK", vec![command_ok("ROLLBACK")], Idle),
        ],
    );
    conn.begin().unwrap();
    let id = conn.alloc_statement();
    conn.statement_mut(id).unwrap().set_sql("KABOOM");
    conn.execute(id).unwrap_err();
    assert_eq!(TransactionPhase::InTransactionError, conn.core.transact);

    conn.statement_mut(id)
        .unwrap()
        .set_sql("INSERT INTO t VALUES (1)");
    let err = conn.execute(id).unwrap_err();
    assert!(matches!(err, Error::InFailedTransaction));

    conn.abort().unwrap();
    assert_eq!(TransactionPhase::NotInTransaction, conn.core.transact);
}

/// With `rollback_on_error=2` every statement runs inside a savepoint; an error rolls back to it
/// and the transaction stays usable.
#[test]
fn per_query_savepoint_recovers_the_transaction() {
    let mut conn = connect(
        "rollback_on_error=2",
        vec![
            expect("BEGIN", vec![command_ok("BEGIN")], InTransaction),
            expect(
                "SAVEPOINT _per_query_svp_;INSERT INTO t VALUES (1)",
                vec![
                    command_ok("SAVEPOINT"),
                    server_error("23505", "duplicate key value"),
                ],
                InError,
            ),
            expect(
                "ROLLBACK TO _per_query_svp_",
                vec![command_ok("ROLLBACK"), command_ok("RELEASE")],
                InTransaction,
            ),
            expect(
                "SAVEPOINT _per_query_svp_;INSERT INTO t VALUES (2);RELEASE _per_query_svp_",
                vec![
                    command_ok("SAVEPOINT"),
                    command_ok("INSERT 0 1"),
                    command_ok("RELEASE"),
                ],
                InTransaction,
            ),
        ],
    );
    conn.begin().unwrap();
    let id = conn.alloc_statement();
    conn.statement_mut(id)
        .unwrap()
        .set_sql("INSERT INTO t VALUES (1)");
    let err = conn.execute(id).unwrap_err();
    assert_eq!(State(*b"23505"), err.state());
    // The savepoint rollback kept the transaction alive.
    assert_eq!(TransactionPhase::InTransactionOk, conn.core.transact);

    conn.statement_mut(id)
        .unwrap()
        .set_sql("INSERT INTO t VALUES (2)");
    conn.execute(id).unwrap();
    assert_eq!(1, conn.rows_affected(id).unwrap());
}

/// Commit releases fully consumed non holdable cursors before the COMMIT itself.
#[test]
fn commit_closes_consumed_cursors() {
    let expectations = vec![
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
                &[&["id", "23", "-1", "t", "1", "1000", "f"]],
            )],
            Idle,
        ),
        expect("pg_index", vec![tuples(&[("attname", 19)], &[&["id"]])], Idle),
        expect(
            "DECLARE \"SQL_CUR1\"",
            vec![command_ok("BEGIN"), command_ok("DECLARE CURSOR")],
            InTransaction,
        ),
        expect(
            "FETCH FORWARD 100 IN \"SQL_CUR1\"",
            vec![tuples(&[("id", 23), ("ctid", 27)], &[&["1", "(0,1)"]])],
            InTransaction,
        ),
        expect("CLOSE \"SQL_CUR1\"", vec![command_ok("CLOSE CURSOR")], InTransaction),
        expect("COMMIT", vec![command_ok("COMMIT")], Idle),
    ];
    let mut conn = connect("", expectations);
    let id = conn.alloc_statement();
    let stmt = conn.statement_mut(id).unwrap();
    stmt.set_sql("SELECT id FROM t");
    stmt.options.cursor_type = CursorType::KeysetDriven;
    stmt.options.concurrency = pg_odbc::Concurrency::RowVersion;
    conn.execute(id).unwrap();
    assert!(conn.statement(id).unwrap().cursor_open);

    conn.commit().unwrap();
    assert!(!conn.statement(id).unwrap().cursor_open);
    assert_eq!(TransactionPhase::NotInTransaction, conn.core.transact);
}

/// With `use_server_side_prepare` parameters travel out of line as `$n` markers instead of
/// being inlined into the statement text.
#[test]
fn server_side_prepare_numbers_the_placeholders() {
    let mut conn = connect(
        "use_server_side_prepare=1",
        vec![expect(
            "INSERT INTO t VALUES ($1, $2)",
            vec![command_ok("INSERT 0 1")],
            Idle,
        )],
    );
    let id = conn.alloc_statement();
    let stmt = conn.statement_mut(id).unwrap();
    stmt.set_sql("INSERT INTO t VALUES (?, ?)");
    stmt.bind_param(1, ParamBinding::value(BoundValue::Int(5)));
    stmt.bind_param(2, ParamBinding::value(BoundValue::Char(b"x".to_vec())));
    conn.execute(id).unwrap();
    assert_eq!(1, conn.rows_affected(id).unwrap());
}

/// Large object round trip through the client's large object protocol, wrapped in private
/// transactions while autocommit is on.
#[test]
fn large_object_round_trip() {
    let mut conn = connect(
        "",
        vec![
            expect("BEGIN", vec![command_ok("BEGIN")], InTransaction),
            expect("COMMIT", vec![command_ok("COMMIT")], Idle),
            expect("BEGIN", vec![command_ok("BEGIN")], InTransaction),
            expect("COMMIT", vec![command_ok("COMMIT")], Idle),
        ],
    );
    let payload = b"large object payload".to_vec();
    let oid = conn.core.create_large_object(&payload).unwrap();
    let read_back = conn.core.read_large_object(oid).unwrap();
    assert_eq!(payload, read_back);
}

#[test]
fn environment_tracks_live_connections() {
    let env = Environment::new();
    install(&default_parameters(), connect_expectations());
    let conn = env.connect::<ScriptedClient>("server=somewhere").unwrap();
    assert_eq!(1, env.num_connections());
    drop(conn);
    assert_eq!(0, env.num_connections());
}
