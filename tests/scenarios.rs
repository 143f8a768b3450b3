//! End-to-end behaviour through the public API

mod common;

use common::{exec, int, ints, open, query, text};
use sqlcore::{
    sqlite3_bind_int64, sqlite3_bind_text, sqlite3_changes, sqlite3_column_int64, sqlite3_column_name,
    sqlite3_db_config,
    sqlite3_errcode, sqlite3_errmsg, sqlite3_finalize, sqlite3_last_insert_rowid, sqlite3_prepare_v2,
    sqlite3_reset, sqlite3_step, sqlite3_test_control_optimizations, sqlite3_total_changes,
    ConstraintKind, DbConfigOption, ErrorCode, Optimizations, StepResult, Value,
};

#[test]
fn test_scenario_a_default_fills_not_null_column() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT NOT NULL DEFAULT 'x');
         INSERT INTO t(a) VALUES(NULL);
         INSERT INTO t(a) VALUES(NULL);",
    )
    .unwrap();
    assert_eq!(
        query(&mut conn, "SELECT a, b FROM t ORDER BY a").unwrap(),
        vec![vec![int(1), text("x")], vec![int(2), text("x")]]
    );
    assert_eq!(sqlite3_last_insert_rowid(&conn), 2);
}

#[test]
fn test_scenario_b_or_replace_on_unique_column() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a INTEGER UNIQUE, b INT);
         INSERT INTO t VALUES(1, 10);
         INSERT OR REPLACE INTO t VALUES(1, 99);",
    )
    .unwrap();
    assert_eq!(query(&mut conn, "SELECT a, b FROM t").unwrap(), vec![vec![int(1), int(99)]]);
}

#[test]
fn test_scenario_c_intersect_removes_duplicates() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t1(x); CREATE TABLE t2(y);
         INSERT INTO t1 VALUES(1),(2),(2),(3);
         INSERT INTO t2 VALUES(2),(3),(4);",
    )
    .unwrap();
    let rows = query(&mut conn, "SELECT x FROM t1 INTERSECT SELECT y FROM t2 ORDER BY 1").unwrap();
    assert_eq!(ints(&rows), vec![2, 3]);
}

#[test]
fn test_scenario_d_group_by_sum() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(g, v); INSERT INTO t VALUES('A', 1), ('A', 2), ('B', 5);",
    )
    .unwrap();
    assert_eq!(
        query(&mut conn, "SELECT g, sum(v) FROM t GROUP BY g ORDER BY g").unwrap(),
        vec![vec![text("A"), int(3)], vec![text("B"), int(5)]]
    );
}

#[test]
fn test_not_null_replace_substitutes_default() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a, b NOT NULL ON CONFLICT REPLACE DEFAULT 7);
         INSERT INTO t VALUES(1, NULL);",
    )
    .unwrap();
    assert_eq!(query(&mut conn, "SELECT a, b FROM t").unwrap(), vec![vec![int(1), int(7)]]);

    exec(&mut conn, "CREATE TABLE u(a NOT NULL DEFAULT 3)").unwrap();
    exec(&mut conn, "INSERT OR REPLACE INTO u VALUES(NULL)").unwrap();
    assert_eq!(ints(&query(&mut conn, "SELECT a FROM u").unwrap()), vec![3]);
}

#[test]
fn test_constraint_errors_name_the_column() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a INTEGER PRIMARY KEY, b NOT NULL, c UNIQUE, d CHECK(d > 0));
         INSERT INTO t VALUES(1, 1, 1, 1);",
    )
    .unwrap();

    let e = exec(&mut conn, "INSERT INTO t VALUES(2, NULL, 2, 1)").unwrap_err();
    assert_eq!(e.constraint, Some(ConstraintKind::NotNull));
    assert_eq!(e.to_string(), "NOT NULL constraint failed: t.b");
    assert_eq!(sqlite3_errcode(&conn), ErrorCode::Constraint);

    let e = exec(&mut conn, "INSERT INTO t VALUES(2, 1, 1, 1)").unwrap_err();
    assert_eq!(e.to_string(), "UNIQUE constraint failed: t.c");

    let e = exec(&mut conn, "INSERT INTO t VALUES(1, 1, 2, 1)").unwrap_err();
    assert_eq!(e.constraint, Some(ConstraintKind::PrimaryKey));
    assert_eq!(sqlite3_errmsg(&conn), "UNIQUE constraint failed: t.a");

    let e = exec(&mut conn, "INSERT INTO t VALUES(2, 1, 2, 0)").unwrap_err();
    assert_eq!(e.constraint, Some(ConstraintKind::Check));
}

#[test]
fn test_abort_undoes_only_the_failing_statement() {
    let mut conn = open();
    exec(&mut conn, "CREATE TABLE t(a UNIQUE); BEGIN; INSERT INTO t VALUES(1);").unwrap();
    assert!(exec(&mut conn, "INSERT INTO t VALUES(2), (1)").is_err());
    exec(&mut conn, "COMMIT").unwrap();
    assert_eq!(ints(&query(&mut conn, "SELECT a FROM t").unwrap()), vec![1]);
}

#[test]
fn test_or_fail_keeps_earlier_rows() {
    let mut conn = open();
    exec(&mut conn, "CREATE TABLE t(a UNIQUE); INSERT INTO t VALUES(3);").unwrap();
    assert!(exec(&mut conn, "INSERT OR FAIL INTO t VALUES(1), (2), (3), (4)").is_err());
    assert_eq!(ints(&query(&mut conn, "SELECT a FROM t ORDER BY a").unwrap()), vec![1, 2, 3]);
}

#[test]
fn test_or_rollback_ends_transaction() {
    let mut conn = open();
    exec(&mut conn, "CREATE TABLE t(a UNIQUE); BEGIN; INSERT INTO t VALUES(1);").unwrap();
    assert!(exec(&mut conn, "INSERT OR ROLLBACK INTO t VALUES(1)").is_err());
    assert!(query(&mut conn, "SELECT a FROM t").unwrap().is_empty());
    assert!(exec(&mut conn, "COMMIT").is_err());
}

#[test]
fn test_or_ignore_skips_conflicting_rows() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a UNIQUE, b); INSERT INTO t VALUES(1, 'old');
         INSERT OR IGNORE INTO t VALUES(1, 'new'), (2, 'new');",
    )
    .unwrap();
    assert_eq!(sqlite3_changes(&conn), 1);
    assert_eq!(
        query(&mut conn, "SELECT a, b FROM t ORDER BY a").unwrap(),
        vec![vec![int(1), text("old")], vec![int(2), text("new")]]
    );
}

#[test]
fn test_replace_fires_delete_triggers_only_when_recursive() {
    let setup = "CREATE TABLE t(a UNIQUE, b); CREATE TABLE log(x);
                 CREATE TRIGGER td AFTER DELETE ON t BEGIN INSERT INTO log VALUES(old.b); END;
                 INSERT INTO t VALUES(1, 'first');";

    let mut conn = open();
    exec(&mut conn, setup).unwrap();
    exec(&mut conn, "INSERT OR REPLACE INTO t VALUES(1, 'second')").unwrap();
    assert!(query(&mut conn, "SELECT x FROM log").unwrap().is_empty());
    assert_eq!(query(&mut conn, "SELECT b FROM t").unwrap(), vec![vec![text("second")]]);

    let mut conn = open();
    sqlite3_db_config(&mut conn, DbConfigOption::RecursiveTriggers, 1).unwrap();
    exec(&mut conn, setup).unwrap();
    exec(&mut conn, "INSERT OR REPLACE INTO t VALUES(1, 'second')").unwrap();
    assert_eq!(query(&mut conn, "SELECT x FROM log").unwrap(), vec![vec![text("first")]]);
    assert_eq!(query(&mut conn, "SELECT count(*) FROM t").unwrap(), vec![vec![int(1)]]);
}

#[test]
fn test_upsert_target_must_match_unique_constraint() {
    let mut conn = open();
    exec(&mut conn, "CREATE TABLE t(a UNIQUE, b, n)").unwrap();
    let e = exec(&mut conn, "INSERT INTO t VALUES(1, 2, 0) ON CONFLICT(b) DO UPDATE SET n = 1").unwrap_err();
    assert_eq!(
        e.to_string(),
        "ON CONFLICT clause does not match any PRIMARY KEY or UNIQUE constraint"
    );
}

#[test]
fn test_upsert_updates_with_excluded_values() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a UNIQUE, b, n);
         INSERT INTO t VALUES(1, 'x', 0);
         INSERT INTO t VALUES(1, 'y', 0), (2, 'z', 0)
             ON CONFLICT(a) DO UPDATE SET b = excluded.b, n = n + 1;",
    )
    .unwrap();
    assert_eq!(
        query(&mut conn, "SELECT a, b, n FROM t ORDER BY a").unwrap(),
        vec![vec![int(1), text("y"), int(1)], vec![int(2), text("z"), int(0)]]
    );
}

#[test]
fn test_upsert_on_rowid_alias() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE kv(k INTEGER PRIMARY KEY, v);
         INSERT INTO kv VALUES(1, 'a');
         INSERT INTO kv VALUES(1, 'b') ON CONFLICT(k) DO UPDATE SET v = v || excluded.v;
         INSERT INTO kv VALUES(1, 'c') ON CONFLICT DO NOTHING;",
    )
    .unwrap();
    assert_eq!(query(&mut conn, "SELECT k, v FROM kv").unwrap(), vec![vec![int(1), text("ab")]]);
}

#[test]
fn test_group_by_strategies_agree() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(k, v);
         INSERT INTO t VALUES(3, 1), (1, 1), (2, 1), (3, 1), (1, 1), (3, 1), (NULL, 1);",
    )
    .unwrap();
    let sql = "SELECT k, count(*) FROM t GROUP BY k";
    let mut sorted = query(&mut conn, sql).unwrap();
    exec(&mut conn, "CREATE INDEX tk ON t(k)").unwrap();
    let mut indexed = query(&mut conn, sql).unwrap();
    sorted.sort_by(|a, b| a[0].to_string().cmp(&b[0].to_string()));
    indexed.sort_by(|a, b| a[0].to_string().cmp(&b[0].to_string()));
    assert_eq!(sorted, indexed);
    assert_eq!(sorted.len(), 4);
    let counts: i64 = sorted.iter().map(|r| r[1].to_i64()).sum();
    assert_eq!(counts, 7);
}

#[test]
fn test_update_rewrites_indexes() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a, b); CREATE INDEX tb ON t(b);
         INSERT INTO t VALUES(1, 10), (2, 20), (3, 30);
         UPDATE t SET b = b + 1 WHERE a >= 2;",
    )
    .unwrap();
    assert_eq!(sqlite3_changes(&conn), 2);
    assert_eq!(ints(&query(&mut conn, "SELECT a FROM t WHERE b = 21").unwrap()), vec![2]);
    assert!(query(&mut conn, "SELECT a FROM t WHERE b = 20").unwrap().is_empty());
}

#[test]
fn test_update_results_without_onepass_match() {
    let run = |onepass: bool| {
        let mut conn = open();
        sqlite3_test_control_optimizations(&mut conn, Optimizations::ONEPASS, onepass).unwrap();
        exec(
            &mut conn,
            "CREATE TABLE t(a INTEGER PRIMARY KEY, b); CREATE INDEX tb ON t(b);
             INSERT INTO t VALUES(1, 1), (2, 2), (3, 3);
             UPDATE t SET b = b * 10 WHERE b > 1;",
        )
        .unwrap();
        query(&mut conn, "SELECT a, b FROM t ORDER BY a").unwrap()
    };
    assert_eq!(run(true), run(false));
}

#[test]
fn test_trigger_cascade_through_tables() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE orders(id INTEGER PRIMARY KEY, qty);
         CREATE TABLE audit(id, what);
         CREATE TRIGGER ai AFTER INSERT ON orders BEGIN
             INSERT INTO audit VALUES(new.id, 'insert');
         END;
         CREATE TRIGGER au AFTER UPDATE OF qty ON orders WHEN new.qty <> old.qty BEGIN
             INSERT INTO audit VALUES(new.id, 'qty ' || old.qty || '->' || new.qty);
         END;
         INSERT INTO orders(qty) VALUES(5);
         UPDATE orders SET qty = 6;
         UPDATE orders SET qty = 6;",
    )
    .unwrap();
    assert_eq!(
        query(&mut conn, "SELECT id, what FROM audit").unwrap(),
        vec![vec![int(1), text("insert")], vec![int(1), text("qty 5->6")]]
    );
    // Rows written by triggers do not count towards changes
    assert_eq!(sqlite3_changes(&conn), 1);
}

#[test]
fn test_foreign_keys_follow_connection_setting() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE p(id INTEGER PRIMARY KEY);
         CREATE TABLE c(pid REFERENCES p(id) ON DELETE CASCADE);
         INSERT INTO c VALUES(9);",
    )
    .unwrap();

    sqlite3_db_config(&mut conn, DbConfigOption::EnableFkey, 1).unwrap();
    let e = exec(&mut conn, "INSERT INTO c VALUES(10)").unwrap_err();
    assert_eq!(e.to_string(), "FOREIGN KEY constraint failed");

    exec(&mut conn, "DELETE FROM c; INSERT INTO p VALUES(1); INSERT INTO c VALUES(1), (1);").unwrap();
    exec(&mut conn, "DELETE FROM p WHERE id = 1").unwrap();
    assert_eq!(ints(&query(&mut conn, "SELECT count(*) FROM c").unwrap()), vec![0]);
}

#[test]
fn test_recursive_cte() {
    let mut conn = open();
    let rows = query(
        &mut conn,
        "WITH RECURSIVE cnt(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM cnt WHERE x < 5)
         SELECT x FROM cnt",
    )
    .unwrap();
    assert_eq!(ints(&rows), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_insert_select_from_self_is_buffered() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a); INSERT INTO t VALUES(1), (2);
         INSERT INTO t SELECT a + 10 FROM t;",
    )
    .unwrap();
    assert_eq!(ints(&query(&mut conn, "SELECT a FROM t ORDER BY a").unwrap()), vec![1, 2, 11, 12]);
}

#[test]
fn test_transfer_copies_rows_and_indexes() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE src(a INTEGER PRIMARY KEY, b UNIQUE);
         CREATE TABLE dst(a INTEGER PRIMARY KEY, b UNIQUE);
         INSERT INTO src VALUES(1, 'one'), (2, 'two');
         INSERT INTO dst SELECT * FROM src;",
    )
    .unwrap();
    assert_eq!(sqlite3_changes(&conn), 2);
    assert_eq!(ints(&query(&mut conn, "SELECT a FROM dst WHERE b = 'two'").unwrap()), vec![2]);
    let e = exec(&mut conn, "INSERT INTO dst VALUES(3, 'one')").unwrap_err();
    assert_eq!(e.to_string(), "UNIQUE constraint failed: dst.b");
}

#[test]
fn test_prepared_insert_reused_with_bindings() {
    let mut conn = open();
    exec(&mut conn, "CREATE TABLE t(a INTEGER PRIMARY KEY, b)").unwrap();
    let (mut stmt, _) = sqlite3_prepare_v2(&mut conn, "INSERT INTO t(b) VALUES(?1)").unwrap();
    for name in ["x", "y", "z"] {
        sqlite3_bind_text(&mut stmt, 1, name).unwrap();
        assert_eq!(sqlite3_step(&mut stmt).unwrap(), StepResult::Done);
        sqlite3_reset(&mut stmt).unwrap();
    }
    sqlite3_finalize(stmt).unwrap();
    assert_eq!(sqlite3_total_changes(&conn), 3);
    assert_eq!(sqlite3_last_insert_rowid(&conn), 3);

    let (mut stmt, _) = sqlite3_prepare_v2(&mut conn, "SELECT a FROM t WHERE b = ?").unwrap();
    sqlite3_bind_text(&mut stmt, 1, "y").unwrap();
    assert_eq!(sqlite3_step(&mut stmt).unwrap(), StepResult::Row);
    assert_eq!(sqlite3_column_int64(&stmt, 0), 2);
    sqlite3_finalize(stmt).unwrap();
}

#[test]
fn test_statement_survives_schema_change() {
    let mut conn = open();
    exec(&mut conn, "CREATE TABLE t(a); INSERT INTO t VALUES(5);").unwrap();
    let (mut stmt, _) = sqlite3_prepare_v2(&mut conn, "SELECT a * ?1 FROM t").unwrap();
    sqlite3_bind_int64(&mut stmt, 1, 3).unwrap();
    exec(&mut conn, "CREATE TABLE other(x)").unwrap();
    assert_eq!(sqlite3_step(&mut stmt).unwrap(), StepResult::Row);
    assert_eq!(sqlite3_column_int64(&stmt, 0), 15);
    sqlite3_finalize(stmt).unwrap();
}

#[test]
fn test_explain_lists_program() {
    let mut conn = open();
    exec(&mut conn, "CREATE TABLE t(a)").unwrap();
    let rows = query(&mut conn, "EXPLAIN INSERT INTO t VALUES(1)").unwrap();
    let opcodes: Vec<String> = rows.iter().map(|r| r[1].to_text()).collect();
    assert_eq!(opcodes.first().map(String::as_str), Some("Init"));
    assert!(opcodes.iter().any(|o| o == "Insert"));
    assert!(opcodes.iter().any(|o| o == "Transaction"));
    assert_eq!(rows[0][0], Value::Integer(0));
    // Nothing was inserted
    assert!(query(&mut conn, "SELECT a FROM t").unwrap().is_empty());
}

#[test]
fn test_view_dml_runs_instead_of_triggers() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a, b);
         CREATE TABLE log(op, x, y);
         CREATE VIEW v AS SELECT a, b FROM t;
         CREATE TRIGGER vi INSTEAD OF INSERT ON v BEGIN
             INSERT INTO t VALUES(new.a, new.b);
             INSERT INTO log VALUES('i', new.a, new.b);
         END;
         CREATE TRIGGER vu INSTEAD OF UPDATE ON v BEGIN
             UPDATE t SET b = new.b WHERE a = old.a;
             INSERT INTO log VALUES('u', old.b, new.b);
         END;
         CREATE TRIGGER vd INSTEAD OF DELETE ON v BEGIN
             DELETE FROM t WHERE a = old.a;
             INSERT INTO log VALUES('d', old.a, old.b);
         END;",
    )
    .unwrap();

    exec(&mut conn, "INSERT INTO v VALUES(1, 10), (2, 20)").unwrap();
    exec(&mut conn, "INSERT INTO v(b, a) VALUES(30, 3)").unwrap();
    exec(&mut conn, "UPDATE v SET b = b + 1 WHERE a = 2").unwrap();
    exec(&mut conn, "DELETE FROM v WHERE a = 1").unwrap();

    assert_eq!(
        query(&mut conn, "SELECT a, b FROM v ORDER BY a").unwrap(),
        vec![vec![int(2), int(21)], vec![int(3), int(30)]]
    );
    assert_eq!(
        query(&mut conn, "SELECT op, x, y FROM log").unwrap(),
        vec![
            vec![text("i"), int(1), int(10)],
            vec![text("i"), int(2), int(20)],
            vec![text("i"), int(3), int(30)],
            vec![text("u"), int(20), int(21)],
            vec![text("d"), int(1), int(10)],
        ]
    );
}

#[test]
fn test_view_without_trigger_is_read_only() {
    let mut conn = open();
    exec(&mut conn, "CREATE TABLE t(a); CREATE VIEW v AS SELECT a FROM t;").unwrap();
    for sql in ["INSERT INTO v VALUES(1)", "UPDATE v SET a = 2", "DELETE FROM v"] {
        let err = exec(&mut conn, sql).unwrap_err();
        assert_eq!(err.to_string(), "cannot modify v because it is a view", "{}", sql);
    }
}

#[test]
fn test_view_column_names() {
    let mut conn = open();
    exec(
        &mut conn,
        "CREATE TABLE t(a, b);
         INSERT INTO t VALUES(1, 2);
         CREATE VIEW v AS SELECT a, b * 10 AS c FROM t;
         CREATE VIEW w(x, y) AS SELECT a, b FROM t;",
    )
    .unwrap();
    assert_eq!(query(&mut conn, "SELECT c, a FROM v").unwrap(), vec![vec![int(20), int(1)]]);
    assert_eq!(query(&mut conn, "SELECT y FROM w WHERE x = 1").unwrap(), vec![vec![int(2)]]);

    let err = exec(&mut conn, "CREATE VIEW bad(x, y, z) AS SELECT a, b FROM t").unwrap_err();
    assert_eq!(err.to_string(), "expected 3 columns for 'bad' but got 2");
    let err = exec(&mut conn, "CREATE VIEW gone AS SELECT * FROM nowhere").unwrap_err();
    assert_eq!(err.to_string(), "no such table: nowhere");
}

#[test]
fn test_values_columns_are_numbered() {
    let mut conn = open();
    assert_eq!(
        query(&mut conn, "SELECT column2, column1 FROM (VALUES(1, 'a'), (3, 'b')) ORDER BY column1 DESC").unwrap(),
        vec![vec![text("b"), int(3)], vec![text("a"), int(1)]]
    );

    let (stmt, _) = sqlite3_prepare_v2(&mut conn, "VALUES(1, 2)").unwrap();
    assert_eq!(sqlite3_column_name(&stmt, 0), Some("column1"));
    assert_eq!(sqlite3_column_name(&stmt, 1), Some("column2"));
    sqlite3_finalize(stmt).unwrap();
}
