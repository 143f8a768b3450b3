//! DELETE code generation
//!
//! Three shapes, picked per statement:
//!
//! - truncate: no WHERE, no trigger and no foreign key to check; every
//!   b-tree of the table is cleared with one `Clear` each
//! - one-pass: the WHERE loop deletes each row as it visits it
//! - two-pass: the loop only collects keys (a RowSet of rowids, or a
//!   transient index of primary keys for WITHOUT ROWID tables) and a
//!   second loop deletes them
//!
//! The single-row delete (`generate_row_delete`) is shared with the
//! REPLACE conflict handling of INSERT and UPDATE.

use std::sync::Arc;

use tracing::debug;

use crate::api::config::Optimizations;
use crate::error::{Error, Result};
use crate::executor::open::OpenedCursors;
use crate::executor::resolve::Clause;
use crate::executor::trigger::RowEvent;
use crate::executor::where_clause::{OnePass, WhereItem, WhereOptions};
use crate::executor::{CursorSource, Parse, Scope, SelectDest};
use crate::parser::ast::{ConflictAction, DeleteStmt, Expr, ResultColumn, Select, SrcItem, TriggerTiming, With};
use crate::schema::{Table, Trigger};
use crate::vdbe::ops::opflag;
use crate::vdbe::{KeyInfo, Opcode, P4};

/// One row to delete
pub struct RowDelete<'d> {
    pub table: &'d Arc<Table>,
    pub cursors: OpenedCursors,
    /// DELETE triggers to fire around the delete
    pub triggers: &'d [Arc<Trigger>],
    /// Rowid register, or the primary key registers of a WITHOUT ROWID
    /// table in primary key order
    pub key: i32,
    /// Count the row in `changes()`
    pub count: bool,
    /// Policy the triggers run under
    pub conflict: Option<ConflictAction>,
    /// The data cursor already points at the row
    pub positioned: bool,
}

impl<'a> Parse<'a> {
    /// Delete one row together with its index entries
    pub fn generate_row_delete(&mut self, d: &RowDelete<'_>) -> Result<()> {
        let table = d.table;
        let data = d.cursors.data;
        let done = self.v.make_label();
        if !d.positioned {
            self.seek_row(table, data, d.key, done);
        }

        let fk = self.fk_required(table, None, false);
        let old = if !d.triggers.is_empty() || fk {
            let (old, _) = self.alloc_row_images(table);
            self.load_row_image(table, data, old)?;
            Some(old)
        } else {
            None
        };

        if let Some(old) = old {
            if d.triggers.iter().any(|t| t.timing == TriggerTiming::Before) {
                self.code_row_triggers(d.triggers, TriggerTiming::Before, table, old, d.conflict, done)?;
                // The trigger may have moved the cursor or removed the row
                self.seek_row(table, data, d.key, done);
            }
            if fk {
                self.fk_check(table, Some(old), None, None)?;
            }
        }

        self.generate_row_index_delete(table, d.cursors, None)?;
        self.v.add_op4(Opcode::Delete, data, 0, 0, P4::Table(table.name.clone()));
        if d.count {
            self.v.change_p5(opflag::NCHANGE);
        }

        if let Some(old) = old {
            if fk {
                self.fk_actions(table, old, None)?;
            }
            self.code_row_triggers(d.triggers, TriggerTiming::After, table, old, d.conflict, done)?;
        }
        self.v.resolve_label(done);
        Ok(())
    }

    /// Remove the index entries of the row under the data cursor
    ///
    /// With `mask`, only indexes `i` with `mask[i]` set are touched. The
    /// primary key index of a WITHOUT ROWID table is the table itself and
    /// is left to the caller.
    pub fn generate_row_index_delete(
        &mut self,
        table: &Arc<Table>,
        cursors: OpenedCursors,
        mask: Option<&[bool]>,
    ) -> Result<()> {
        for (i, index) in table.indexes.iter().enumerate() {
            if table.without_rowid && index.is_primary_key() {
                continue;
            }
            if mask.is_some_and(|m| !m.get(i).copied().unwrap_or(false)) {
                continue;
            }
            let skip = self.v.make_label();
            let base = self.code_index_key(table, index, cursors.data, Some(skip))?;
            self.v
                .add_op(Opcode::IdxDelete, cursors.index(i), base, index.n_column() as i32);
            self.v.comment(index.name.clone());
            self.v.resolve_label(skip);
        }
        Ok(())
    }

    /// Copy the row under `cursor` into an image: rowid at `image`, then
    /// one register per column
    pub fn load_row_image(&mut self, table: &Table, cursor: i32, image: i32) -> Result<()> {
        if table.has_rowid() {
            self.v.add_op2(Opcode::Rowid, cursor, image);
        } else {
            self.v.add_op2(Opcode::Null, 0, image);
        }
        for i in 0..table.columns.len() {
            self.code_column(cursor, i as i32, image + 1 + i as i32)?;
        }
        Ok(())
    }

    /// Load the key of the row under the data cursor into fresh registers
    ///
    /// Rowid tables get one register. WITHOUT ROWID tables get the primary
    /// key columns in primary key order.
    pub fn code_row_key(&mut self, table: &Table, data: i32) -> i32 {
        match table.pk_index() {
            Some(pk) => {
                let n = pk.n_key_col as i32;
                let regs = self.alloc_reg(n);
                for j in 0..pk.n_key_col {
                    self.v.add_op(Opcode::Column, data, j as i32, regs + j as i32);
                }
                regs
            }
            None => {
                let r = self.alloc_reg(1);
                self.v.add_op2(Opcode::Rowid, data, r);
                r
            }
        }
    }

    /// Transient index holding WITHOUT ROWID primary keys
    pub(crate) fn open_key_set(&mut self, table: &Table) -> i32 {
        let cursor = self.alloc_cursor();
        let n = table.pk_index().map_or(1, |pk| pk.n_key_col);
        let mut ki = KeyInfo::new(n);
        if let Some(pk) = table.pk_index() {
            for j in 0..n {
                ki.collations[j] = pk.columns[j].collation;
            }
        }
        self.v
            .add_op4(Opcode::OpenEphemeral, cursor, n as i32, 0, P4::KeyInfo(Arc::new(ki)));
        self.v.comment("keys");
        cursor
    }

    /// Run `SELECT * FROM view WHERE ...` into a transient table and
    /// return its cursor; the cursor reads view columns by position
    pub(crate) fn materialize_view(
        &mut self,
        view: &Arc<Table>,
        alias: Option<&String>,
        where_clause: Option<&Expr>,
        with: Option<&With>,
    ) -> Result<i32> {
        let mut item = SrcItem::table(view.name.clone());
        item.alias = alias.cloned();
        let mut sel = Select {
            columns: vec![ResultColumn::Star],
            from: vec![item],
            where_clause: where_clause.cloned(),
            with: with.cloned(),
            ..Default::default()
        };
        self.prepare_select(&mut sel)?;
        let cursor = self.alloc_cursor();
        self.v
            .add_op2(Opcode::OpenEphemeral, cursor, view.columns.len() as i32);
        self.v.comment(view.name.clone());
        self.code_select(&sel, SelectDest::EphemTable { cursor })?;
        self.sources.insert(cursor, CursorSource::Ephemeral);
        Ok(cursor)
    }

    /// INSTEAD OF triggers of a view, or the error for modifying a view
    pub(crate) fn instead_of_triggers(&self, view: &Table, event: RowEvent, changed: Option<&[bool]>) -> Result<Vec<Arc<Trigger>>> {
        let triggers: Vec<Arc<Trigger>> = self
            .triggers_for(view, event, changed)
            .into_iter()
            .filter(|t| t.timing == TriggerTiming::InsteadOf)
            .collect();
        if triggers.is_empty() {
            return Err(Error::sql(format!("cannot modify {} because it is a view", view.name)));
        }
        Ok(triggers)
    }

    /// Compile a DELETE statement
    pub fn code_delete(&mut self, stmt: &DeleteStmt) -> Result<()> {
        let table = self.schema.require_table(&stmt.table)?;
        if table.is_view() {
            return self.code_view_delete(stmt, &table);
        }
        let pushed = self.push_ctes(stmt.with.as_ref());
        let r = self.code_table_delete(stmt, &table);
        self.pop_ctes(pushed);
        r
    }

    fn code_table_delete(&mut self, stmt: &DeleteStmt, table: &Arc<Table>) -> Result<()> {
        let triggers = self.triggers_for(table, RowEvent::Delete, None);
        let fk = self.fk_required(table, None, false);

        if stmt.where_clause.is_none() && triggers.is_empty() && !fk {
            debug!(table = %table.name, "delete by truncation");
            self.set_writes();
            if table.has_rowid() {
                self.v.add_op(Opcode::Clear, table.root as i32, 0, 0);
                self.v.change_p5(1);
            }
            for index in &table.indexes {
                self.v.add_op(Opcode::Clear, index.root as i32, 0, 0);
                let counts = table.without_rowid && index.is_primary_key();
                self.v.change_p5(u16::from(counts));
            }
            return Ok(());
        }

        let cursors = self.open_table_and_indices(table, Opcode::OpenWrite, None, None);
        let data = cursors.data;
        let mut where_clause = stmt.where_clause.clone();
        if let Some(w) = where_clause.as_mut() {
            self.scopes.push(Scope::single(table.clone(), data, stmt.alias.clone()));
            let r = self.resolve_expr(w, Clause::Where);
            self.scopes.pop();
            r?;
        }

        let onepass = if !self.config.enabled(Optimizations::ONEPASS) {
            OnePass::Off
        } else if triggers.is_empty() && !fk && !self.is_nested() {
            OnePass::Multi
        } else {
            OnePass::Single
        };
        let opts = WhereOptions {
            onepass,
            modified_indexes: table.indexes.iter().map(|i| i.name.clone()).collect(),
            ..Default::default()
        };
        let item = WhereItem {
            opened: true,
            ..WhereItem::table(data, table.clone())
        };
        // The key set of a two-pass delete is opened before the loop
        let key_cursor = if table.has_rowid() {
            None
        } else {
            Some(self.open_key_set(table))
        };
        let info = self.where_begin(&[item], where_clause.as_ref(), &opts)?;
        debug!(table = %table.name, onepass = ?info.onepass, triggers = triggers.len(), fk, "delete loop");

        if info.onepass != OnePass::Off {
            let key = self.code_row_key(table, data);
            self.generate_row_delete(&RowDelete {
                table,
                cursors,
                triggers: &triggers,
                key,
                count: true,
                conflict: None,
                positioned: true,
            })?;
            return self.where_end(info);
        }

        // First pass: collect the keys
        let set = self.alloc_reg(1);
        let regs = self.code_row_key(table, data);
        match (key_cursor, table.pk_index()) {
            (Some(eph), Some(pk)) => {
                let rec = self.alloc_reg(1);
                self.v.add_op(Opcode::MakeRecord, regs, pk.n_key_col as i32, rec);
                self.v.add_op2(Opcode::IdxInsert, eph, rec);
            }
            _ => {
                self.v.add_op2(Opcode::RowSetAdd, set, regs);
            }
        }
        self.where_end(info)?;

        // Second pass: delete them
        let done = self.v.make_label();
        match key_cursor {
            None => {
                let key = self.alloc_reg(1);
                let top = self.v.add_jump(Opcode::RowSetRead, set, done, key);
                self.generate_row_delete(&RowDelete {
                    table,
                    cursors,
                    triggers: &triggers,
                    key,
                    count: true,
                    conflict: None,
                    positioned: false,
                })?;
                self.v.add_op2(Opcode::Goto, 0, top);
            }
            Some(eph) => {
                let n = table.pk_index().map_or(1, |pk| pk.n_key_col);
                let key = self.alloc_reg(n as i32);
                self.v.add_jump(Opcode::Rewind, eph, done, 0);
                let top = self.v.current_addr();
                for j in 0..n {
                    self.v.add_op(Opcode::Column, eph, j as i32, key + j as i32);
                }
                self.generate_row_delete(&RowDelete {
                    table,
                    cursors,
                    triggers: &triggers,
                    key,
                    count: true,
                    conflict: None,
                    positioned: false,
                })?;
                self.v.add_op2(Opcode::Next, eph, top);
            }
        }
        self.v.resolve_label(done);
        Ok(())
    }

    /// DELETE on a view: every selected row goes to the INSTEAD OF triggers
    fn code_view_delete(&mut self, stmt: &DeleteStmt, view: &Arc<Table>) -> Result<()> {
        let triggers = self.instead_of_triggers(view, RowEvent::Delete, None)?;
        let eph = self.materialize_view(view, stmt.alias.as_ref(), stmt.where_clause.as_ref(), stmt.with.as_ref())?;
        let (old, _) = self.alloc_row_images(view);
        let done = self.v.make_label();
        let next = self.v.make_label();
        self.v.add_jump(Opcode::Rewind, eph, done, 0);
        let top = self.v.current_addr();
        self.load_row_image(view, eph, old)?;
        self.code_row_triggers(&triggers, TriggerTiming::InsteadOf, view, old, None, next)?;
        self.v.resolve_label(next);
        self.v.add_op2(Opcode::Next, eph, top);
        self.v.resolve_label(done);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::api::config::{DbConfig, Optimizations};
    use crate::executor::testing::{exec, program};
    use crate::storage::Database;
    use crate::types::Value;
    use crate::vdbe::Opcode;

    fn db(sql: &str) -> Database {
        let mut db = Database::new();
        exec(&mut db, &DbConfig::default(), sql).unwrap();
        db
    }

    fn ints(db: &mut Database, sql: &str) -> Vec<i64> {
        exec(db, &DbConfig::default(), sql)
            .unwrap()
            .into_iter()
            .map(|r| match r[0] {
                Value::Integer(i) => i,
                ref other => panic!("not an integer: {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_delete_without_where_truncates() {
        let db = db("CREATE TABLE t(a UNIQUE);");
        let p = program(&db, &DbConfig::default(), "DELETE FROM t").unwrap();
        assert_eq!(p.ops.iter().filter(|o| o.opcode == Opcode::Clear).count(), 2);
        assert!(!p.ops.iter().any(|o| o.opcode == Opcode::Delete));
    }

    #[test]
    fn test_truncate_counts_rows() {
        let mut d = db("CREATE TABLE t(a); INSERT INTO t VALUES(1), (2), (3);");
        let config = DbConfig::default();
        let p = program(&d, &config, "DELETE FROM t").unwrap();
        let mut vm = crate::vdbe::Vdbe::new(p);
        while vm.step(&mut d).unwrap() == crate::types::StepResult::Row {}
        assert_eq!(vm.changes(), 3);
    }

    #[test]
    fn test_delete_where_keeps_indexes_consistent() {
        let mut d = db("CREATE TABLE t(a, b UNIQUE); INSERT INTO t VALUES(1, 10), (2, 20), (3, 30);");
        exec(&mut d, &DbConfig::default(), "DELETE FROM t WHERE a >= 2").unwrap();
        assert_eq!(ints(&mut d, "SELECT a FROM t"), vec![1]);
        // The freed key can be reused
        exec(&mut d, &DbConfig::default(), "INSERT INTO t VALUES(4, 20)").unwrap();
        assert_eq!(ints(&mut d, "SELECT b FROM t ORDER BY b"), vec![10, 20]);
    }

    #[test]
    fn test_two_pass_without_onepass() {
        let mut config = DbConfig::default();
        config.set_optimizations(Optimizations::ONEPASS, false);
        let mut d = db("CREATE TABLE t(a); INSERT INTO t VALUES(1), (2), (3), (4);");
        let p = program(&d, &config, "DELETE FROM t WHERE a % 2 = 0").unwrap();
        assert!(p.ops.iter().any(|o| o.opcode == Opcode::RowSetAdd));
        exec(&mut d, &config, "DELETE FROM t WHERE a % 2 = 0").unwrap();
        assert_eq!(ints(&mut d, "SELECT a FROM t ORDER BY a"), vec![1, 3]);
    }

    #[test]
    fn test_without_rowid_two_pass_uses_key_index() {
        let mut config = DbConfig::default();
        config.set_optimizations(Optimizations::ONEPASS, false);
        let mut d = db("CREATE TABLE w(k PRIMARY KEY, v) WITHOUT ROWID; INSERT INTO w VALUES(1, 'a'), (2, 'b'), (3, 'c');");
        exec(&mut d, &config, "DELETE FROM w WHERE k <> 2").unwrap();
        assert_eq!(ints(&mut d, "SELECT k FROM w"), vec![2]);
    }

    #[test]
    fn test_delete_trigger_sees_old_row() {
        let mut d = db(
            "CREATE TABLE t(a); CREATE TABLE log(x);
             CREATE TRIGGER td AFTER DELETE ON t BEGIN INSERT INTO log VALUES(old.a); END;
             INSERT INTO t VALUES(5), (6);",
        );
        exec(&mut d, &DbConfig::default(), "DELETE FROM t").unwrap();
        assert_eq!(ints(&mut d, "SELECT x FROM log ORDER BY x"), vec![5, 6]);
        assert!(ints(&mut d, "SELECT a FROM t").is_empty());
    }

    #[test]
    fn test_view_delete_needs_instead_of() {
        let mut d = db("CREATE TABLE t(a); CREATE VIEW v AS SELECT a FROM t;");
        let e = exec(&mut d, &DbConfig::default(), "DELETE FROM v").unwrap_err();
        assert_eq!(e.to_string(), "cannot modify v because it is a view");

        exec(
            &mut d,
            &DbConfig::default(),
            "INSERT INTO t VALUES(1), (2);
             CREATE TRIGGER vd INSTEAD OF DELETE ON v BEGIN DELETE FROM t WHERE a = old.a; END;",
        )
        .unwrap();
        exec(&mut d, &DbConfig::default(), "DELETE FROM v WHERE a = 2").unwrap();
        assert_eq!(ints(&mut d, "SELECT a FROM t"), vec![1]);
    }
}
