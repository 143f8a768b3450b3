//! Statements carried out directly on the database
//!
//! Schema changes edit the in-memory schema and bump its cookie, which
//! makes every program compiled against the old schema fail its
//! `Transaction` check. CREATE INDEX additionally runs a small program that
//! fills the new index from the table; if that fails (a UNIQUE index over
//! duplicate values) the whole statement is undone.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::api::config::DbConfig;
use crate::error::{ConstraintKind, Error, ErrorCode, Result};
use crate::executor::constraint::unique_message;
use crate::executor::Parse;
use crate::parser::ast::{ConflictAction, CreateIndexStmt, Stmt};
use crate::schema::affinity::index_affinity;
use crate::schema::build::{self, index_key_info};
use crate::schema::{Index, Schema, Table};
use crate::storage::Database;
use crate::types::StepResult;
use crate::vdbe::{Opcode, Program, Vdbe, P4};

/// Execute a statement `compile` handed back as `Compiled::Direct`
#[instrument(level = "debug", skip_all)]
pub fn execute_direct(db: &mut Database, config: &DbConfig, stmt: &Stmt) -> Result<()> {
    match stmt {
        Stmt::CreateTable(s) => build::create_table(db, s).map(|_| ()),
        Stmt::CreateIndex(s) => create_index(db, config, s),
        Stmt::CreateView(s) => build::create_view(db, s).map(|_| ()),
        Stmt::CreateTrigger(s) => build::create_trigger(db, s).map(|_| ()),
        Stmt::Drop(s) => build::drop_object(db, s),
        Stmt::Begin => db.begin(),
        Stmt::Commit => db.commit(),
        Stmt::Rollback => db.rollback(),
        _ => Err(Error::with_message(ErrorCode::Internal, "statement must be compiled")),
    }
}

fn create_index(db: &mut Database, config: &DbConfig, stmt: &CreateIndexStmt) -> Result<()> {
    let saved = db.snapshot();
    let r = build_and_fill_index(db, config, stmt);
    if r.is_err() {
        db.restore(saved);
    }
    r
}

fn build_and_fill_index(db: &mut Database, config: &DbConfig, stmt: &CreateIndexStmt) -> Result<()> {
    let Some((table, index)) = build::create_index(db, stmt)? else {
        return Ok(());
    };
    let program = index_fill_program(&db.schema, config, &table, &index)?;
    let mut vm = Vdbe::new(program);
    while vm.step(db)? == StepResult::Row {}
    debug!(index = %index.name, "index filled");
    Ok(())
}

/// Program adding an entry to `index` for every row of `table`
pub fn index_fill_program(schema: &Schema, config: &DbConfig, table: &Arc<Table>, index: &Index) -> Result<Program> {
    let mut p = Parse::new(schema, config);
    let from = p.open_table_and_indices(table, Opcode::OpenRead, None, Some(&[true]));
    let icur = p.alloc_cursor();
    p.v.add_op4(
        Opcode::OpenWrite,
        icur,
        index.root as i32,
        0,
        P4::KeyInfo(Arc::new(index_key_info(index))),
    );
    p.v.comment(index.name.clone());

    let done = p.v.make_label();
    p.v.add_jump(Opcode::Rewind, from.data, done, 0);
    let top = p.v.current_addr();
    let skip = p.v.make_label();
    let base = p.code_index_key(table, index, from.data, Some(skip))?;
    let rec = p.alloc_reg(1);
    let aff = index_affinity(index, table).to_string();
    p.v.add_op4(Opcode::MakeRecord, base, index.n_column() as i32, rec, P4::Text(aff));
    if index.unique {
        let ok = p.v.make_label();
        p.v
            .add_op4(Opcode::NoConflict, icur, ok.value(), base, P4::Int64(index.n_key_col as i64));
        let kind = if index.is_primary_key() {
            ConstraintKind::PrimaryKey
        } else {
            ConstraintKind::Unique
        };
        p.halt_constraint(kind, ConflictAction::Abort, unique_message(table, index));
        p.v.resolve_label(ok);
    }
    p.v.add_op2(Opcode::IdxInsert, icur, rec);
    p.v.resolve_label(skip);
    p.v.add_op2(Opcode::Next, from.data, top);
    p.v.resolve_label(done);
    p.v.add_op1(Opcode::Close, icur);
    p.finish(Vec::new())
}

#[cfg(test)]
mod tests {
    use crate::api::config::DbConfig;
    use crate::executor::testing::exec;
    use crate::storage::Database;
    use crate::types::Value;

    fn run(db: &mut Database, sql: &str) -> crate::error::Result<Vec<Vec<Value>>> {
        exec(db, &DbConfig::default(), sql)
    }

    #[test]
    fn test_create_index_fills_existing_rows() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(a, b); INSERT INTO t VALUES(1, 'x'), (2, 'y');").unwrap();
        run(&mut db, "CREATE INDEX tb ON t(b)").unwrap();
        assert_eq!(
            run(&mut db, "SELECT a FROM t WHERE b = 'y'").unwrap(),
            vec![vec![Value::Integer(2)]]
        );
    }

    #[test]
    fn test_unique_index_over_duplicates_is_undone() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(a); INSERT INTO t VALUES(1), (1);").unwrap();
        let cookie = db.schema.cookie;
        let e = run(&mut db, "CREATE UNIQUE INDEX ta ON t(a)").unwrap_err();
        assert_eq!(e.to_string(), "UNIQUE constraint failed: t.a");
        assert!(db.schema.index("ta").is_none());
        assert_eq!(db.schema.cookie, cookie);
    }

    #[test]
    fn test_partial_unique_index_ignores_excluded_rows() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(a, live); INSERT INTO t VALUES(1, 0), (1, 0), (1, 1);").unwrap();
        run(&mut db, "CREATE UNIQUE INDEX ta ON t(a) WHERE live").unwrap();
        let e = run(&mut db, "INSERT INTO t VALUES(1, 1)").unwrap_err();
        assert_eq!(e.to_string(), "UNIQUE constraint failed: t.a");
    }

    #[test]
    fn test_transaction_control() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(a); BEGIN; INSERT INTO t VALUES(1); ROLLBACK;").unwrap();
        assert!(run(&mut db, "SELECT a FROM t").unwrap().is_empty());
        assert_eq!(
            run(&mut db, "COMMIT").unwrap_err().to_string(),
            "cannot commit - no transaction is active"
        );
    }
}
