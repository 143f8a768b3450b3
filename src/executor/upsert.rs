//! ON CONFLICT clauses of INSERT
//!
//! Each clause names the uniqueness constraint it handles: the rowid, or
//! a UNIQUE index whose key columns match the target term by term (same
//! column or expression, same collation, same order). A partial index
//! only matches a target carrying the same WHERE clause. The constraint
//! checker asks `Upsert::policy_for` how to handle each conflict; a
//! clause without a target handles every constraint.

use tracing::trace;

use crate::error::{Error, Result};
use crate::parser::ast::{Expr, IndexedColumn, UpsertAction, UpsertClause};
use crate::schema::{Index, IndexTarget, Table};
use crate::vdbe::value::{collation_or_error, Collation};

/// Constraint an ON CONFLICT clause handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictTarget {
    Rowid,
    /// Position in `Table::indexes`
    Index(usize),
}

/// One resolved ON CONFLICT clause
#[derive(Debug, Clone)]
pub struct UpsertTarget {
    /// `None` handles every constraint
    pub target: Option<ConflictTarget>,
    pub action: UpsertAction,
}

/// The ON CONFLICT clauses of one INSERT, in declaration order
#[derive(Debug, Clone, Default)]
pub struct Upsert {
    pub clauses: Vec<UpsertTarget>,
    /// Name DO UPDATE expressions use for the existing row
    pub alias: Option<String>,
}

/// Match every clause of `clauses` with a constraint of `table`
pub fn resolve_upsert(table: &Table, clauses: &[UpsertClause], alias: Option<&str>) -> Result<Upsert> {
    let mut out = Upsert {
        clauses: Vec::with_capacity(clauses.len()),
        alias: alias.map(str::to_string),
    };
    for (n, clause) in clauses.iter().enumerate() {
        let target = if clause.target.is_empty() {
            if n + 1 != clauses.len() {
                return Err(Error::sql("only the last ON CONFLICT clause may omit the conflict target"));
            }
            None
        } else {
            Some(match_target(table, &clause.target, clause.target_where.as_ref())?)
        };
        trace!(table = %table.name, ?target, "upsert target");
        out.clauses.push(UpsertTarget {
            target,
            action: clause.action.clone(),
        });
    }
    Ok(out)
}

fn match_target(table: &Table, target: &[IndexedColumn], target_where: Option<&Expr>) -> Result<ConflictTarget> {
    if table.has_rowid() && target.len() == 1 && target[0].collation.is_none() {
        if let Some(name) = target[0].column_name() {
            if let Some(c) = table.column_index(name) {
                if c < 0 || table.ipk == Some(c as usize) {
                    return Ok(ConflictTarget::Rowid);
                }
            }
        }
    }
    for (i, index) in table.indexes.iter().enumerate() {
        if !index.unique || index.n_key_col != target.len() {
            continue;
        }
        if let Some(partial) = &index.partial {
            if target_where != Some(partial) {
                continue;
            }
        }
        if index_matches(table, index, target)? {
            return Ok(ConflictTarget::Index(i));
        }
    }
    Err(Error::sql("ON CONFLICT clause does not match any PRIMARY KEY or UNIQUE constraint"))
}

fn index_matches(table: &Table, index: &Index, target: &[IndexedColumn]) -> Result<bool> {
    for (ic, term) in index.columns[..index.n_key_col].iter().zip(target) {
        let default = match (&ic.target, term.expr.skip_wrappers()) {
            (IndexTarget::Column(c), Expr::Id(name)) => match table.column_index(name) {
                Some(t) if t == *c as i32 => table.columns[*c].collation,
                _ => return Ok(false),
            },
            (IndexTarget::Expr(e), other) if e == other => Collation::Binary,
            _ => return Ok(false),
        };
        let collation = match &term.collation {
            Some(name) => collation_or_error(name)?,
            None => default,
        };
        if collation != ic.collation {
            return Ok(false);
        }
    }
    Ok(true)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DbConfig;
    use crate::executor::testing::exec;
    use crate::parser::parse;
    use crate::parser::ast::Stmt;
    use crate::storage::Database;
    use crate::types::Value;

    fn db(sql: &str) -> Database {
        let mut db = Database::new();
        exec(&mut db, &DbConfig::default(), sql).unwrap();
        db
    }

    fn clauses(sql: &str) -> Vec<UpsertClause> {
        match parse(sql).unwrap().into_iter().next() {
            Some(Stmt::Insert(ins)) => ins.upsert,
            other => panic!("not an insert: {:?}", other),
        }
    }

    fn resolve(db: &Database, sql: &str) -> Result<Upsert> {
        let t = db.schema.table("t").unwrap();
        resolve_upsert(&t, &clauses(sql), None)
    }

    #[test]
    fn test_rowid_alias_target() {
        let db = db("CREATE TABLE t(id INTEGER PRIMARY KEY, v);");
        let u = resolve(&db, "INSERT INTO t VALUES(1, 1) ON CONFLICT(id) DO NOTHING").unwrap();
        assert_eq!(u.clauses[0].target, Some(ConflictTarget::Rowid));
        let u = resolve(&db, "INSERT INTO t VALUES(1, 1) ON CONFLICT(rowid) DO NOTHING").unwrap();
        assert_eq!(u.clauses[0].target, Some(ConflictTarget::Rowid));
    }

    #[test]
    fn test_index_target_needs_same_columns_in_order() {
        let db = db("CREATE TABLE t(a, b, c, UNIQUE(a, b));");
        let u = resolve(&db, "INSERT INTO t VALUES(1, 2, 3) ON CONFLICT(a, b) DO NOTHING").unwrap();
        assert_eq!(u.clauses[0].target, Some(ConflictTarget::Index(0)));
        let e = resolve(&db, "INSERT INTO t VALUES(1, 2, 3) ON CONFLICT(b, a) DO NOTHING").unwrap_err();
        assert_eq!(e.to_string(), "ON CONFLICT clause does not match any PRIMARY KEY or UNIQUE constraint");
        assert!(resolve(&db, "INSERT INTO t VALUES(1, 2, 3) ON CONFLICT(a) DO NOTHING").is_err());
    }

    #[test]
    fn test_collation_must_agree() {
        let db = db("CREATE TABLE t(a TEXT COLLATE NOCASE UNIQUE);");
        assert!(resolve(&db, "INSERT INTO t VALUES('x') ON CONFLICT(a) DO NOTHING").is_ok());
        assert!(resolve(&db, "INSERT INTO t VALUES('x') ON CONFLICT(a COLLATE nocase) DO NOTHING").is_ok());
        assert!(resolve(&db, "INSERT INTO t VALUES('x') ON CONFLICT(a COLLATE binary) DO NOTHING").is_err());
    }

    #[test]
    fn test_partial_index_needs_same_where() {
        let db = db("CREATE TABLE t(a, b); CREATE UNIQUE INDEX tp ON t(a) WHERE b > 0;");
        assert!(resolve(&db, "INSERT INTO t VALUES(1, 1) ON CONFLICT(a) DO NOTHING").is_err());
        let u = resolve(&db, "INSERT INTO t VALUES(1, 1) ON CONFLICT(a) WHERE b > 0 DO NOTHING").unwrap();
        assert_eq!(u.clauses[0].target, Some(ConflictTarget::Index(0)));
    }

    #[test]
    fn test_targetless_clause_must_be_last() {
        let db = db("CREATE TABLE t(a UNIQUE);");
        let u = resolve(&db, "INSERT INTO t VALUES(1) ON CONFLICT DO NOTHING").unwrap();
        assert_eq!(u.clauses[0].target, None);
        assert!(resolve(&db, "INSERT INTO t VALUES(1) ON CONFLICT DO NOTHING ON CONFLICT(a) DO NOTHING").is_err());
    }

    #[test]
    fn test_do_update_reads_excluded() {
        let c = DbConfig::default();
        let mut db = db("CREATE TABLE t(k TEXT PRIMARY KEY, n INT); INSERT INTO t VALUES('a', 1);");
        exec(
            &mut db,
            &c,
            "INSERT INTO t VALUES('a', 5), ('b', 2) ON CONFLICT(k) DO UPDATE SET n = n + excluded.n",
        )
        .unwrap();
        assert_eq!(
            exec(&mut db, &c, "SELECT k, n FROM t ORDER BY k").unwrap(),
            vec![
                vec![Value::Text("a".into()), Value::Integer(6)],
                vec![Value::Text("b".into()), Value::Integer(2)],
            ]
        );
    }

    #[test]
    fn test_do_update_where_false_leaves_row() {
        let c = DbConfig::default();
        let mut db = db("CREATE TABLE t(id INTEGER PRIMARY KEY, v); INSERT INTO t VALUES(1, 'old');");
        exec(
            &mut db,
            &c,
            "INSERT INTO t VALUES(1, 'new') ON CONFLICT(id) DO UPDATE SET v = excluded.v WHERE v <> 'old'",
        )
        .unwrap();
        assert_eq!(
            exec(&mut db, &c, "SELECT v FROM t").unwrap(),
            vec![vec![Value::Text("old".into())]]
        );
    }

    #[test]
    fn test_targetless_do_nothing_ignores_every_constraint() {
        let c = DbConfig::default();
        let mut db = db("CREATE TABLE t(a UNIQUE, b NOT NULL); INSERT INTO t VALUES(1, 1);");
        exec(&mut db, &c, "INSERT INTO t VALUES(1, 2), (2, 2) ON CONFLICT DO NOTHING").unwrap();
        assert_eq!(exec(&mut db, &c, "SELECT count(*) FROM t").unwrap(), vec![vec![Value::Integer(2)]]);
    }

    #[test]
    fn test_untargeted_constraint_keeps_its_policy() {
        let c = DbConfig::default();
        let mut db = db("CREATE TABLE t(a UNIQUE, b UNIQUE); INSERT INTO t VALUES(1, 1);");
        let e = exec(&mut db, &c, "INSERT INTO t VALUES(2, 1) ON CONFLICT(a) DO NOTHING").unwrap_err();
        assert_eq!(e.to_string(), "UNIQUE constraint failed: t.b");
    }
}
