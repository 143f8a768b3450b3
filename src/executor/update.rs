//! UPDATE code generation
//!
//! Each row is rewritten the same way whatever drives the loop: build the
//! NEW image from the SET list and the current row, fire the BEFORE
//! triggers, check the constraints, remove the old index entries, write
//! the new ones and the record, fire the AFTER triggers.
//!
//! The loop itself is one of
//!
//! - one-pass: the WHERE loop rewrites each row as it visits it; rows may
//!   stream past only when no trigger, foreign key, key change or REPLACE
//!   can disturb the cursor
//! - two-pass: the loop collects the keys first, like DELETE
//!
//! `ON CONFLICT ... DO UPDATE` reuses the row rewrite on the conflicting
//! row an INSERT ran into.

use std::sync::Arc;

use tracing::debug;

use crate::api::config::Optimizations;
use crate::error::{Error, ErrorCode, Result};
use crate::executor::constraint::RowWrite;
use crate::executor::open::OpenedCursors;
use crate::executor::resolve::Clause;
use crate::executor::trigger::RowEvent;
use crate::executor::where_clause::{OnePass, WhereItem, WhereOptions};
use crate::executor::{Parse, Scope};
use crate::parser::ast::{Assignment, ConflictAction, Expr, TriggerTiming, UpdateStmt, UpsertAction};
use crate::schema::affinity::table_affinity;
use crate::schema::{Table, Trigger};
use crate::vdbe::{Opcode, P4};

/// Resolved SET list
#[derive(Debug, Clone)]
struct SetList {
    /// New value per column; `None` keeps the current one
    exprs: Vec<Option<Expr>>,
    /// New rowid, from the rowid or its INTEGER PRIMARY KEY alias
    rowid: Option<Expr>,
    changed: Vec<bool>,
    /// The rowid, or a PRIMARY KEY column of a WITHOUT ROWID table, is set
    pk_changed: bool,
}

impl SetList {
    /// Indexes whose entry may change
    fn index_mask(&self, table: &Table) -> Vec<bool> {
        table
            .indexes
            .iter()
            .map(|index| {
                self.pk_changed
                    || (table.without_rowid && index.is_primary_key())
                    || index.has_expressions()
                    || index.partial.is_some()
                    || self
                        .changed
                        .iter()
                        .enumerate()
                        .any(|(c, &changed)| changed && index.covers_column(c))
            })
            .collect()
    }
}

/// Statement-wide state shared by every rewritten row
struct UpdatePlan<'p> {
    table: Arc<Table>,
    cursors: OpenedCursors,
    set: &'p SetList,
    mask: Vec<bool>,
    triggers: &'p [Arc<Trigger>],
    fk: bool,
    conflict: Option<ConflictAction>,
}

impl<'a> Parse<'a> {
    /// Compile an UPDATE statement
    pub fn code_update(&mut self, stmt: &UpdateStmt) -> Result<()> {
        let table = self.schema.require_table(&stmt.table)?;
        if table.is_view() {
            return self.code_view_update(stmt, &table);
        }
        let pushed = self.push_ctes(stmt.with.as_ref());
        let r = self.code_table_update(stmt, &table);
        self.pop_ctes(pushed);
        r
    }

    /// Resolve `set` against the scope already pushed for `table`
    fn resolve_set_list(&mut self, table: &Table, set: &[Assignment]) -> Result<SetList> {
        let n_col = table.columns.len();
        let mut out = SetList {
            exprs: vec![None; n_col],
            rowid: None,
            changed: vec![false; n_col],
            pk_changed: false,
        };
        for a in set {
            let c = table
                .column_index(&a.column)
                .ok_or_else(|| Error::sql(format!("no such column: {}", a.column)))?;
            let mut e = a.expr.clone();
            self.resolve_expr(&mut e, Clause::Other)?;
            if c < 0 {
                out.rowid = Some(e);
                out.pk_changed = true;
                continue;
            }
            let c = c as usize;
            if table.has_rowid() && table.ipk == Some(c) {
                out.rowid = Some(e.clone());
                out.pk_changed = true;
            } else if table.without_rowid && table.pk_columns.contains(&c) {
                out.pk_changed = true;
            }
            out.exprs[c] = Some(e);
            out.changed[c] = true;
        }
        Ok(out)
    }

    fn code_table_update(&mut self, stmt: &UpdateStmt, table: &Arc<Table>) -> Result<()> {
        let cursors = self.open_table_and_indices(table, Opcode::OpenWrite, None, None);
        let data = cursors.data;
        self.scopes.push(Scope::single(table.clone(), data, stmt.alias.clone()));
        let resolved = self.resolve_set_list(table, &stmt.set).and_then(|set| {
            let mut w = stmt.where_clause.clone();
            if let Some(e) = w.as_mut() {
                self.resolve_expr(e, Clause::Where)?;
            }
            Ok((set, w))
        });
        self.scopes.pop();
        let (set, where_clause) = resolved?;

        let triggers = self.triggers_for(table, RowEvent::Update, Some(&set.changed));
        let fk = self.fk_required(table, Some(&set.changed), set.pk_changed);
        let mask = set.index_mask(table);
        let replace = |policy: ConflictAction| stmt.or_conflict.unwrap_or(policy) == ConflictAction::Replace;
        let replace_possible = stmt.or_conflict == Some(ConflictAction::Replace)
            || table
                .indexes
                .iter()
                .zip(&mask)
                .any(|(index, &m)| m && index.unique && replace(index.on_conflict))
            || (set.pk_changed && replace(table.pk_on_conflict));

        let onepass = if !self.config.enabled(Optimizations::ONEPASS) {
            OnePass::Off
        } else if triggers.is_empty()
            && !fk
            && !set.pk_changed
            && !replace_possible
            && table.has_rowid()
            && !self.is_nested()
        {
            OnePass::Multi
        } else {
            OnePass::Single
        };
        let opts = WhereOptions {
            onepass,
            modified_indexes: table
                .indexes
                .iter()
                .zip(&mask)
                .filter(|(_, &m)| m)
                .map(|(i, _)| i.name.clone())
                .collect(),
            ..Default::default()
        };
        let item = WhereItem {
            opened: true,
            ..WhereItem::table(data, table.clone())
        };
        let key_cursor = if table.has_rowid() {
            None
        } else {
            Some(self.open_key_set(table))
        };
        let plan = UpdatePlan {
            table: table.clone(),
            cursors,
            set: &set,
            mask,
            triggers: &triggers,
            fk,
            conflict: stmt.or_conflict,
        };

        let info = self.where_begin(&[item], where_clause.as_ref(), &opts)?;
        debug!(
            table = %table.name,
            onepass = ?info.onepass,
            triggers = triggers.len(),
            fk,
            pk_changed = set.pk_changed,
            "update loop"
        );

        if info.onepass != OnePass::Off {
            let key = self.code_row_key(table, data);
            self.update_row(&plan, key)?;
            return self.where_end(info);
        }

        // First pass: collect the keys
        let rowset = self.alloc_reg(1);
        let regs = self.code_row_key(table, data);
        match (key_cursor, table.pk_index()) {
            (Some(eph), Some(pk)) => {
                let rec = self.alloc_reg(1);
                self.v.add_op(Opcode::MakeRecord, regs, pk.n_key_col as i32, rec);
                self.v.add_op2(Opcode::IdxInsert, eph, rec);
            }
            _ => {
                self.v.add_op2(Opcode::RowSetAdd, rowset, regs);
            }
        }
        self.where_end(info)?;

        // Second pass: rewrite them
        let done = self.v.make_label();
        match key_cursor {
            None => {
                let key = self.alloc_reg(1);
                let top = self.v.add_jump(Opcode::RowSetRead, rowset, done, key);
                let skip = self.v.make_label();
                self.seek_row(table, data, key, skip);
                self.update_row(&plan, key)?;
                self.v.resolve_label(skip);
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
                let skip = self.v.make_label();
                self.seek_row(table, data, key, skip);
                self.update_row(&plan, key)?;
                self.v.resolve_label(skip);
                self.v.add_op2(Opcode::Next, eph, top);
            }
        }
        self.v.resolve_label(done);
        Ok(())
    }

    /// Rewrite the row under the data cursor, whose key is in `key`
    fn update_row(&mut self, plan: &UpdatePlan<'_>, key: i32) -> Result<()> {
        let table = &plan.table;
        let data = plan.cursors.data;
        let set = plan.set;
        let next = self.v.make_label();
        let (old, new) = self.alloc_row_images(table);

        if !plan.triggers.is_empty() || plan.fk {
            self.load_row_image(table, data, old)?;
        }

        let is_ipk = |i: usize| table.has_rowid() && table.ipk == Some(i);
        for i in 0..table.columns.len() {
            let target = new + 1 + i as i32;
            if is_ipk(i) {
                self.v.add_op2(Opcode::Null, 0, target);
                continue;
            }
            match &set.exprs[i] {
                Some(e) => self.expr_code(e, target)?,
                None => self.code_column(data, i as i32, target)?,
            }
        }
        if table.has_rowid() {
            match &set.rowid {
                Some(e) => {
                    self.expr_code(e, new)?;
                    self.v.add_op2(Opcode::MustBeInt, new, 0);
                }
                None => {
                    self.v.add_op2(Opcode::Copy, key, new);
                }
            }
        } else {
            self.v.add_op2(Opcode::Null, 0, new);
        }

        if plan.triggers.iter().any(|t| t.timing == TriggerTiming::Before) {
            let aff = table_affinity(table);
            if !aff.is_empty() {
                self.v
                    .add_op4(Opcode::Affinity, new + 1, aff.len() as i32, 0, P4::Text(aff.to_string()));
            }
            self.code_row_triggers(plan.triggers, TriggerTiming::Before, table, old, plan.conflict, next)?;
            // The trigger may have changed or removed the row
            self.seek_row(table, data, key, next);
            for i in 0..table.columns.len() {
                if !set.changed[i] && !is_ipk(i) {
                    self.code_column(data, i as i32, new + 1 + i as i32)?;
                }
            }
        }

        let write = RowWrite {
            table: table.clone(),
            cursors: plan.cursors,
            new,
            old_key: Some(key),
            pk_changed: set.pk_changed,
            changed: Some(set.changed.clone()),
            indexes: Some(plan.mask.clone()),
            conflict: plan.conflict,
            ignore: next,
            upsert: None,
        };
        let checked = self.generate_constraint_checks(&write)?;
        if plan.fk {
            self.fk_check(table, Some(old), Some(new), Some(&set.changed))?;
        }

        // The checks may have moved the data cursor
        self.seek_row(table, data, key, next);
        self.generate_row_index_delete(table, plan.cursors, Some(&plan.mask))?;
        // A WITHOUT ROWID record is its primary key entry, so it is always
        // replaced rather than overwritten
        if set.pk_changed || table.without_rowid {
            self.v.add_op4(Opcode::Delete, data, 0, 0, P4::Table(table.name.clone()));
        }
        self.complete_insertion(&write, &checked);

        if plan.fk {
            self.fk_actions(table, old, Some(&set.changed))?;
        }
        self.code_row_triggers(plan.triggers, TriggerTiming::After, table, old, plan.conflict, next)?;
        self.v.resolve_label(next);
        Ok(())
    }

    /// DO UPDATE of upsert clause `clause` on the row the data cursor of
    /// `w` points at
    pub(crate) fn code_upsert_update(&mut self, w: &RowWrite<'_>, clause: usize) -> Result<()> {
        let upsert = w
            .upsert
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, "upsert update without upsert"))?;
        let UpsertAction::Update { set, where_clause } = &upsert.clauses[clause].action else {
            return Err(Error::with_message(ErrorCode::Internal, "upsert clause is DO NOTHING"));
        };
        let table = w.table.clone();
        let saved = self.excluded.replace((table.clone(), w.new));
        self.scopes
            .push(Scope::single(table.clone(), w.cursors.data, upsert.alias.clone()));
        let resolved = self.resolve_set_list(&table, set).and_then(|set| {
            let mut cond = where_clause.clone();
            if let Some(e) = cond.as_mut() {
                self.resolve_expr(e, Clause::Where)?;
            }
            Ok((set, cond))
        });
        self.scopes.pop();
        let r = match resolved {
            Ok((set, cond)) => self.code_upsert_row(w, &table, &set, cond.as_ref()),
            Err(e) => Err(e),
        };
        self.excluded = saved;
        r
    }

    fn code_upsert_row(&mut self, w: &RowWrite<'_>, table: &Arc<Table>, set: &SetList, cond: Option<&Expr>) -> Result<()> {
        let skip = self.v.make_label();
        if let Some(cond) = cond {
            self.expr_if_false(cond, skip, true)?;
        }
        let key = self.code_row_key(table, w.cursors.data);
        let triggers = self.triggers_for(table, RowEvent::Update, Some(&set.changed));
        let fk = self.fk_required(table, Some(&set.changed), set.pk_changed);
        debug!(table = %table.name, triggers = triggers.len(), fk, "upsert do update");
        let plan = UpdatePlan {
            table: table.clone(),
            cursors: w.cursors,
            set,
            mask: set.index_mask(table),
            triggers: &triggers,
            fk,
            conflict: Some(ConflictAction::Abort),
        };
        self.update_row(&plan, key)?;
        self.v.resolve_label(skip);
        Ok(())
    }

    /// UPDATE on a view: every selected row goes to the INSTEAD OF
    /// triggers with its OLD values and the values the SET list computes
    fn code_view_update(&mut self, stmt: &UpdateStmt, view: &Arc<Table>) -> Result<()> {
        let eph = self.materialize_view(view, stmt.alias.as_ref(), stmt.where_clause.as_ref(), stmt.with.as_ref())?;
        self.scopes.push(Scope::single(view.clone(), eph, stmt.alias.clone()));
        let resolved = self.resolve_set_list(view, &stmt.set);
        self.scopes.pop();
        let set = resolved?;
        let triggers = self.instead_of_triggers(view, RowEvent::Update, Some(&set.changed))?;

        let (old, new) = self.alloc_row_images(view);
        let done = self.v.make_label();
        self.v.add_jump(Opcode::Rewind, eph, done, 0);
        let top = self.v.current_addr();
        let next = self.v.make_label();
        self.load_row_image(view, eph, old)?;
        self.v.add_op2(Opcode::Null, 0, new);
        for i in 0..view.columns.len() {
            let target = new + 1 + i as i32;
            match &set.exprs[i] {
                Some(e) => self.expr_code(e, target)?,
                None => {
                    self.v.add_op2(Opcode::Copy, old + 1 + i as i32, target);
                }
            }
        }
        self.code_row_triggers(&triggers, TriggerTiming::InsteadOf, view, old, stmt.or_conflict, next)?;
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

    fn rows(db: &mut Database, sql: &str) -> Vec<Vec<Value>> {
        exec(db, &DbConfig::default(), sql).unwrap()
    }

    fn ints(db: &mut Database, sql: &str) -> Vec<i64> {
        rows(db, sql)
            .into_iter()
            .map(|r| match r[0] {
                Value::Integer(i) => i,
                ref other => panic!("not an integer: {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_update_rewrites_indexes() {
        let mut d = db("CREATE TABLE t(a, b); CREATE INDEX tb ON t(b); INSERT INTO t VALUES(1, 10), (2, 20);");
        rows(&mut d, "UPDATE t SET b = b + 1 WHERE a = 2");
        assert_eq!(ints(&mut d, "SELECT a FROM t WHERE b = 21"), vec![2]);
        assert!(ints(&mut d, "SELECT a FROM t WHERE b = 20").is_empty());
    }

    #[test]
    fn test_unknown_column() {
        let mut d = db("CREATE TABLE t(a);");
        let e = exec(&mut d, &DbConfig::default(), "UPDATE t SET zz = 1").unwrap_err();
        assert_eq!(e.to_string(), "no such column: zz");
    }

    #[test]
    fn test_multi_row_onepass_without_triggers() {
        let d = db("CREATE TABLE t(a, b);");
        let c = DbConfig::default();
        let p = program(&d, &c, "UPDATE t SET b = 1").unwrap();
        assert!(!p.ops.iter().any(|o| o.opcode == Opcode::RowSetAdd));

        let mut off = DbConfig::default();
        off.set_optimizations(Optimizations::ONEPASS, false);
        let p = program(&d, &off, "UPDATE t SET b = 1").unwrap();
        assert!(p.ops.iter().any(|o| o.opcode == Opcode::RowSetAdd));
    }

    #[test]
    fn test_rowid_change_moves_row() {
        let mut d = db("CREATE TABLE t(id INTEGER PRIMARY KEY, v); INSERT INTO t VALUES(1, 'a'), (2, 'b');");
        rows(&mut d, "UPDATE t SET id = id + 10");
        assert_eq!(ints(&mut d, "SELECT id FROM t ORDER BY id"), vec![11, 12]);
        let e = exec(&mut d, &DbConfig::default(), "UPDATE t SET id = 12 WHERE id = 11").unwrap_err();
        assert_eq!(e.to_string(), "UNIQUE constraint failed: t.id");
    }

    #[test]
    fn test_unique_violation_and_or_ignore() {
        let mut d = db("CREATE TABLE t(a UNIQUE, b); INSERT INTO t VALUES(1, 'x'), (2, 'y');");
        let e = exec(&mut d, &DbConfig::default(), "UPDATE t SET a = 1 WHERE a = 2").unwrap_err();
        assert_eq!(e.to_string(), "UNIQUE constraint failed: t.a");
        rows(&mut d, "UPDATE OR IGNORE t SET a = 1 WHERE a = 2");
        assert_eq!(ints(&mut d, "SELECT a FROM t ORDER BY a"), vec![1, 2]);
    }

    #[test]
    fn test_or_replace_deletes_conflicting_row() {
        let mut d = db("CREATE TABLE t(a UNIQUE, b); INSERT INTO t VALUES(1, 'x'), (2, 'y');");
        rows(&mut d, "UPDATE OR REPLACE t SET a = 1 WHERE b = 'y'");
        assert_eq!(
            rows(&mut d, "SELECT a, b FROM t"),
            vec![vec![Value::Integer(1), Value::Text("y".into())]]
        );
    }

    #[test]
    fn test_without_rowid_key_update() {
        let mut d = db("CREATE TABLE w(k TEXT PRIMARY KEY, v) WITHOUT ROWID; INSERT INTO w VALUES('a', 1), ('b', 2);");
        rows(&mut d, "UPDATE w SET k = 'c' WHERE k = 'a'");
        rows(&mut d, "UPDATE w SET v = v * 10");
        assert_eq!(
            rows(&mut d, "SELECT k, v FROM w ORDER BY k"),
            vec![
                vec![Value::Text("b".into()), Value::Integer(20)],
                vec![Value::Text("c".into()), Value::Integer(10)],
            ]
        );
    }

    #[test]
    fn test_before_trigger_change_is_seen() {
        let mut d = db(
            "CREATE TABLE t(a, b); CREATE TABLE log(o, n);
             CREATE TRIGGER tu BEFORE UPDATE ON t BEGIN INSERT INTO log VALUES(old.a, new.a); END;
             INSERT INTO t VALUES(1, 0);",
        );
        rows(&mut d, "UPDATE t SET a = 5");
        assert_eq!(
            rows(&mut d, "SELECT o, n FROM log"),
            vec![vec![Value::Integer(1), Value::Integer(5)]]
        );
    }

    #[test]
    fn test_self_referencing_where_uses_old_values() {
        let mut d = db("CREATE TABLE t(a); INSERT INTO t VALUES(1), (2), (3);");
        rows(&mut d, "UPDATE t SET a = a + 1 WHERE a < (SELECT max(a) FROM t)");
        assert_eq!(ints(&mut d, "SELECT a FROM t ORDER BY a"), vec![2, 3, 3]);
    }

    #[test]
    fn test_view_update_goes_to_instead_of() {
        let mut d = db(
            "CREATE TABLE t(a); CREATE VIEW v AS SELECT a FROM t; INSERT INTO t VALUES(1);
             CREATE TRIGGER vu INSTEAD OF UPDATE ON v BEGIN UPDATE t SET a = new.a WHERE a = old.a; END;",
        );
        rows(&mut d, "UPDATE v SET a = 9");
        assert_eq!(ints(&mut d, "SELECT a FROM t"), vec![9]);
    }
}
