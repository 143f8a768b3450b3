//! Statement compilation entry point
//!
//! SELECT, INSERT, UPDATE and DELETE become programs. Schema changes and
//! transaction control are not compiled; they are carried out directly on
//! the database by [`crate::executor::ddl`] when the statement is stepped.

use tracing::{debug, instrument, trace};

use crate::api::config::DbConfig;
use crate::error::Result;
use crate::executor::Parse;
use crate::parser::ast::Stmt;
use crate::schema::Schema;
use crate::vdbe::explain::listing;
use crate::vdbe::Program;

/// Outcome of compiling one statement
#[derive(Debug, Clone)]
pub enum Compiled {
    Program(Program),
    /// Executed directly: DDL and transaction control
    Direct(Stmt),
}

impl Compiled {
    pub fn is_read_only(&self) -> bool {
        match self {
            Compiled::Program(p) => p.read_only,
            Compiled::Direct(stmt) => stmt.is_read_only(),
        }
    }
}

fn kind(stmt: &Stmt) -> &'static str {
    match stmt {
        Stmt::Select(_) => "select",
        Stmt::Insert(_) => "insert",
        Stmt::Update(_) => "update",
        Stmt::Delete(_) => "delete",
        Stmt::CreateTable(_) => "create table",
        Stmt::CreateIndex(_) => "create index",
        Stmt::CreateView(_) => "create view",
        Stmt::CreateTrigger(_) => "create trigger",
        Stmt::Drop(_) => "drop",
        Stmt::Begin => "begin",
        Stmt::Commit => "commit",
        Stmt::Rollback => "rollback",
        Stmt::Explain(_) => "explain",
    }
}

/// Compile `stmt` against `schema`
#[instrument(level = "debug", skip_all, fields(kind = kind(stmt)))]
pub fn compile(schema: &Schema, config: &DbConfig, stmt: &Stmt) -> Result<Compiled> {
    let compiled = match stmt {
        Stmt::Explain(inner) => {
            let mut program = match compile(schema, config, inner)? {
                Compiled::Program(p) => p,
                // Nothing to list for a statement that is not compiled
                Compiled::Direct(_) => Parse::new(schema, config).finish(Vec::new())?,
            };
            program.explain = true;
            return Ok(Compiled::Program(program));
        }
        Stmt::Select(sel) => {
            let mut p = Parse::new(schema, config);
            let mut sel = (**sel).clone();
            let names = p.compile_select(&mut sel)?;
            p.finish(names)?
        }
        Stmt::Insert(ins) => {
            let mut p = Parse::new(schema, config);
            p.code_insert(ins)?;
            p.finish(Vec::new())?
        }
        Stmt::Update(upd) => {
            let mut p = Parse::new(schema, config);
            p.code_update(upd)?;
            p.finish(Vec::new())?
        }
        Stmt::Delete(del) => {
            let mut p = Parse::new(schema, config);
            p.code_delete(del)?;
            p.finish(Vec::new())?
        }
        other => return Ok(Compiled::Direct(other.clone())),
    };
    debug!(
        ops = compiled.ops.len(),
        subprograms = compiled.subprograms.len(),
        read_only = compiled.read_only,
        "compiled"
    );
    trace!("\n{}", listing(&compiled.ops));
    Ok(Compiled::Program(compiled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::exec;
    use crate::parser::parse;
    use crate::storage::Database;
    use crate::vdbe::Opcode;

    fn compile_one(db: &Database, sql: &str) -> Result<Compiled> {
        let stmt = parse(sql)?.remove(0);
        compile(&db.schema, &DbConfig::default(), &stmt)
    }

    #[test]
    fn test_ddl_is_direct() {
        let db = Database::new();
        assert!(matches!(compile_one(&db, "CREATE TABLE t(a)").unwrap(), Compiled::Direct(_)));
        assert!(matches!(compile_one(&db, "BEGIN").unwrap(), Compiled::Direct(_)));
    }

    #[test]
    fn test_program_starts_with_transaction() {
        let mut db = Database::new();
        exec(&mut db, &DbConfig::default(), "CREATE TABLE t(a)").unwrap();
        let Compiled::Program(p) = compile_one(&db, "INSERT INTO t VALUES(1)").unwrap() else {
            panic!("expected a program");
        };
        assert_eq!(p.ops[0].opcode, Opcode::Init);
        let txn = p.ops.iter().find(|o| o.opcode == Opcode::Transaction).unwrap();
        assert_eq!(txn.p2, 1);
        assert_eq!(txn.p3 as u32, db.schema.cookie);
        assert!(!p.read_only);
    }

    #[test]
    fn test_select_is_read_only() {
        let mut db = Database::new();
        exec(&mut db, &DbConfig::default(), "CREATE TABLE t(a)").unwrap();
        let c = compile_one(&db, "SELECT a FROM t").unwrap();
        assert!(c.is_read_only());
        let Compiled::Program(p) = c else { panic!("expected a program") };
        assert_eq!(p.column_names, vec!["a".to_string()]);
    }

    #[test]
    fn test_explain_marks_program() {
        let mut db = Database::new();
        exec(&mut db, &DbConfig::default(), "CREATE TABLE t(a)").unwrap();
        let Compiled::Program(p) = compile_one(&db, "EXPLAIN DELETE FROM t WHERE a = 1").unwrap() else {
            panic!("expected a program");
        };
        assert!(p.explain);
        assert_eq!(p.column_count(), 8);
    }

    #[test]
    fn test_unknown_table() {
        let db = Database::new();
        let e = compile_one(&db, "SELECT * FROM nope").unwrap_err();
        assert_eq!(e.to_string(), "no such table: nope");
    }
}
