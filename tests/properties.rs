//! Property tests over small generated tables

mod common;

use std::collections::BTreeSet;

use proptest::prelude::*;

use common::{exec, ints, open, query};
use sqlcore::{sqlite3_last_insert_rowid, sqlite3_test_control_optimizations, Optimizations, SqliteConnection, Value};

fn fill(conn: &mut SqliteConnection, table: &str, values: &[i64]) {
    if values.is_empty() {
        return;
    }
    let rows: Vec<String> = values.iter().map(|v| format!("({})", v)).collect();
    exec(conn, &format!("INSERT INTO {} VALUES {}", table, rows.join(", "))).unwrap();
}

fn sorted(set: impl IntoIterator<Item = i64>) -> Vec<i64> {
    set.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Rows as a multiset, ignoring order
fn normalized(mut rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    rows.sort_by_key(|r| format!("{:?}", r));
    rows
}

#[derive(Debug, Clone)]
enum RowidOp {
    InsertAuto,
    InsertAt(i64),
    Delete(i64),
}

fn rowid_op() -> impl Strategy<Value = RowidOp> {
    prop_oneof![
        3 => Just(RowidOp::InsertAuto),
        1 => (1i64..40).prop_map(RowidOp::InsertAt),
        2 => (1i64..40).prop_map(RowidOp::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_rowid_is_one_past_the_maximum(ops in prop::collection::vec(rowid_op(), 1..30)) {
        let mut conn = open();
        exec(&mut conn, "CREATE TABLE t(id INTEGER PRIMARY KEY, v)").unwrap();
        let mut live = BTreeSet::new();
        for op in ops {
            match op {
                RowidOp::InsertAuto => {
                    let expected = live.iter().next_back().map_or(1, |m| m + 1);
                    exec(&mut conn, "INSERT INTO t(v) VALUES('auto')").unwrap();
                    let got = sqlite3_last_insert_rowid(&conn);
                    prop_assert_eq!(got, expected);
                    prop_assert!(live.insert(got));
                }
                RowidOp::InsertAt(id) => {
                    exec(&mut conn, &format!("INSERT OR IGNORE INTO t VALUES({}, 'fixed')", id)).unwrap();
                    live.insert(id);
                }
                RowidOp::Delete(id) => {
                    exec(&mut conn, &format!("DELETE FROM t WHERE id = {}", id)).unwrap();
                    live.remove(&id);
                }
            }
        }
        let stored = ints(&query(&mut conn, "SELECT id FROM t ORDER BY id").unwrap());
        prop_assert_eq!(stored, live.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_compound_operators_follow_set_semantics(
        a in prop::collection::vec(0i64..6, 0..12),
        b in prop::collection::vec(0i64..6, 0..12),
    ) {
        let mut conn = open();
        exec(&mut conn, "CREATE TABLE a(x); CREATE TABLE b(x);").unwrap();
        fill(&mut conn, "a", &a);
        fill(&mut conn, "b", &b);
        let sa: BTreeSet<i64> = a.iter().copied().collect();
        let sb: BTreeSet<i64> = b.iter().copied().collect();

        let union = ints(&query(&mut conn, "SELECT x FROM a UNION SELECT x FROM b ORDER BY 1").unwrap());
        prop_assert_eq!(union, sorted(sa.union(&sb).copied()));

        let all = ints(&query(&mut conn, "SELECT x FROM a UNION ALL SELECT x FROM b").unwrap());
        prop_assert_eq!(all, a.iter().chain(b.iter()).copied().collect::<Vec<_>>());

        let both = ints(&query(&mut conn, "SELECT x FROM a INTERSECT SELECT x FROM b ORDER BY 1").unwrap());
        prop_assert_eq!(both, sorted(sa.intersection(&sb).copied()));

        let only_a = ints(&query(&mut conn, "SELECT x FROM a EXCEPT SELECT x FROM b ORDER BY 1").unwrap());
        prop_assert_eq!(only_a, sorted(sa.difference(&sb).copied()));

        // Without ORDER BY the rows may come in any order, but the sets agree
        let unordered = ints(&query(&mut conn, "SELECT x FROM a UNION SELECT x FROM b").unwrap());
        prop_assert_eq!(sorted(unordered.iter().copied()), sorted(sa.union(&sb).copied()));
        prop_assert_eq!(unordered.len(), sa.union(&sb).count());
    }

    #[test]
    fn test_limit_offset_window(
        values in prop::collection::vec(-20i64..20, 0..15),
        limit in -1i64..10,
        offset in 0i64..18,
    ) {
        let mut conn = open();
        exec(&mut conn, "CREATE TABLE t(x)").unwrap();
        fill(&mut conn, "t", &values);
        let mut ordered = values.clone();
        ordered.sort();

        let expected: Vec<i64> = if limit < 0 {
            ordered.iter().skip(offset as usize).copied().collect()
        } else {
            ordered.iter().skip(offset as usize).take(limit as usize).copied().collect()
        };
        let sql = format!("SELECT x FROM t ORDER BY x LIMIT {} OFFSET {}", limit, offset);
        prop_assert_eq!(ints(&query(&mut conn, &sql).unwrap()), expected);

        prop_assert!(query(&mut conn, "SELECT x FROM t ORDER BY x LIMIT 0").unwrap().is_empty());
        prop_assert_eq!(query(&mut conn, "SELECT x FROM t ORDER BY x LIMIT -1").unwrap().len(), values.len());
    }

    #[test]
    fn test_flattening_does_not_change_results(
        rows in prop::collection::vec((0i64..5, 0i64..5), 0..12),
    ) {
        const QUERIES: [&str; 7] = [
            "SELECT a, b FROM (SELECT a, b FROM t WHERE a > 1) WHERE b < 3",
            "SELECT x FROM (SELECT a + b AS x FROM t) WHERE x % 2 = 0",
            "SELECT s.a, u.b FROM (SELECT a FROM t) s, (SELECT b FROM t WHERE b > 0) u WHERE s.a = u.b",
            "SELECT a FROM (SELECT a FROM t ORDER BY a LIMIT 3)",
            "SELECT count(*) FROM (SELECT DISTINCT a FROM t)",
            "SELECT t.a, v.b FROM t LEFT JOIN (SELECT a, b FROM t WHERE b > 2) v ON v.a = t.a",
            "SELECT k, n FROM (SELECT a AS k, count(*) AS n FROM t GROUP BY a) WHERE k = 2 OR n > 1",
        ];
        let rewrites = Optimizations::QUERY_FLATTENER
            | Optimizations::PUSH_DOWN
            | Optimizations::PROPAGATE_CONST
            | Optimizations::LEFT_JOIN_REDUCE;

        let setup = |conn: &mut SqliteConnection| {
            exec(conn, "CREATE TABLE t(a INT, b INT)").unwrap();
            if !rows.is_empty() {
                let values: Vec<String> = rows.iter().map(|(a, b)| format!("({}, {})", a, b)).collect();
                exec(conn, &format!("INSERT INTO t VALUES {}", values.join(", "))).unwrap();
            }
        };
        let mut fast = open();
        setup(&mut fast);
        let mut plain = open();
        sqlite3_test_control_optimizations(&mut plain, rewrites, false).unwrap();
        setup(&mut plain);

        for sql in QUERIES {
            let with = normalized(query(&mut fast, sql).unwrap());
            let without = normalized(query(&mut plain, sql).unwrap());
            prop_assert_eq!(with, without, "query: {}", sql);
        }
    }
}
