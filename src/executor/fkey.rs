//! Foreign key enforcement
//!
//! Constraints are checked immediately. A statement keeps one violation
//! counter: writing a child row whose parent is missing adds one, and so
//! does removing a parent key that child rows still reference. Undoing
//! either subtracts one. A statement that ends with a nonzero counter
//! fails with "FOREIGN KEY constraint failed".
//!
//! ON DELETE and ON UPDATE actions are AFTER triggers synthesized on the
//! parent table and compiled like any other trigger body.

use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::executor::resolve::column_ref;
use crate::executor::where_clause::{WhereItem, WhereOptions};
use crate::executor::{same_name, CursorSource, Parse};
use crate::parser::ast::{BinaryOp, Expr, FkAction, Stmt, TriggerEvent, TriggerTiming};
use crate::parser::grammar::parse_expr;
use crate::parser::parse;
use crate::schema::affinity::index_affinity;
use crate::schema::build::index_key_info;
use crate::schema::{Affinity, ForeignKey, Index, Table, Trigger};
use crate::vdbe::ops::cmp_flags;
use crate::vdbe::{Opcode, P4};

/// How the parent row of a foreign key is looked up
#[derive(Debug, Clone)]
pub struct ParentKey {
    /// UNIQUE index over the parent columns; `None` when the key is the rowid
    pub index: Option<Arc<Index>>,
    /// Parent column for each child column (-1 for the rowid)
    pub columns: Vec<i32>,
    /// Child column position for each index key column
    pub order: Vec<usize>,
}

fn mismatch(child: &Table, parent: &Table) -> Error {
    Error::sql(format!(
        "foreign key mismatch - \"{}\" referencing \"{}\"",
        child.name, parent.name
    ))
}

/// Find the parent key `fk` refers to: the rowid, or a UNIQUE index over
/// exactly the parent columns with their declared collations
pub fn locate_parent_key(parent: &Table, child: &Table, fk: &ForeignKey) -> Result<ParentKey> {
    let n = fk.columns.len();
    let rowid_key = ParentKey {
        index: None,
        columns: vec![-1],
        order: vec![0],
    };
    let columns: Vec<i32> = if fk.parent_columns.is_empty() {
        if parent.has_rowid() && parent.ipk.is_some() {
            if n != 1 {
                return Err(mismatch(child, parent));
            }
            return Ok(rowid_key);
        }
        parent.pk_columns.iter().map(|&c| c as i32).collect()
    } else {
        let mut cols = Vec::with_capacity(fk.parent_columns.len());
        for name in &fk.parent_columns {
            cols.push(parent.column_index(name).ok_or_else(|| mismatch(child, parent))?);
        }
        cols
    };
    if columns.len() != n || n == 0 {
        return Err(mismatch(child, parent));
    }
    if n == 1 && parent.has_rowid() && (columns[0] < 0 || parent.ipk == Some(columns[0] as usize)) {
        return Ok(rowid_key);
    }
    for index in &parent.indexes {
        if !index.unique || index.partial.is_some() || index.n_key_col != n {
            continue;
        }
        let mut order = Vec::with_capacity(n);
        for ic in &index.columns[..n] {
            let at = ic.column_ordinal().and_then(|c| {
                columns
                    .iter()
                    .position(|&p| p == c as i32)
                    .filter(|_| ic.collation == parent.columns[c].collation)
            });
            match at {
                Some(j) => order.push(j),
                None => break,
            }
        }
        if order.len() == n {
            return Ok(ParentKey {
                index: Some(index.clone()),
                columns,
                order,
            });
        }
    }
    Err(mismatch(child, parent))
}

/// Register of column `col` (-1 for the rowid) within the row image at `base`
pub(crate) fn image_reg(table: &Table, base: i32, col: i32) -> i32 {
    if col < 0 || (table.has_rowid() && table.ipk == Some(col as usize)) {
        base
    } else {
        base + 1 + col
    }
}

/// Whether an UPDATE assigning `changed` can modify one of `cols`
fn touches(table: &Table, cols: &[i32], changed: Option<&[bool]>, pk_changed: bool) -> bool {
    let Some(changed) = changed else { return true };
    cols.iter().any(|&c| {
        if c < 0 {
            pk_changed
        } else {
            changed.get(c as usize).copied().unwrap_or(false)
                || (pk_changed && table.has_rowid() && table.ipk == Some(c as usize))
        }
    })
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl<'a> Parse<'a> {
    /// Whether writing `table` needs any foreign key code
    ///
    /// `changed` is the SET mask of an UPDATE; `None` stands for INSERT
    /// and DELETE, which always touch every key.
    pub fn fk_required(&self, table: &Table, changed: Option<&[bool]>, pk_changed: bool) -> bool {
        if !self.config.foreign_keys || table.ephemeral || table.is_view() {
            return false;
        }
        let as_child = table.foreign_keys.iter().any(|fk| {
            let cols: Vec<i32> = fk.columns.iter().map(|&c| c as i32).collect();
            touches(table, &cols, changed, pk_changed)
        });
        as_child
            || self.schema.referencing_keys(&table.name).iter().any(|(child, n)| {
                match locate_parent_key(table, child, &child.foreign_keys[*n]) {
                    Ok(key) => touches(table, &key.columns, changed, pk_changed),
                    // Reported while the check is coded
                    Err(_) => true,
                }
            })
    }

    /// Columns of `table` whose old values the foreign key code reads
    pub fn fk_oldmask(&self, table: &Table) -> Vec<bool> {
        let mut mask = vec![false; table.columns.len()];
        if !self.config.foreign_keys {
            return mask;
        }
        for fk in &table.foreign_keys {
            for &c in &fk.columns {
                mask[c] = true;
            }
        }
        for (child, n) in self.schema.referencing_keys(&table.name) {
            if let Ok(key) = locate_parent_key(table, &child, &child.foreign_keys[n]) {
                for c in key.columns.into_iter().filter(|&c| c >= 0) {
                    mask[c as usize] = true;
                }
            }
        }
        mask
    }

    /// Count the violations a row write causes or removes
    ///
    /// `old` and `new` are row images (rowid, then the columns); DELETE
    /// passes only `old`, INSERT only `new`, UPDATE both plus its SET mask.
    pub fn fk_check(
        &mut self,
        table: &Arc<Table>,
        old: Option<i32>,
        new: Option<i32>,
        changed: Option<&[bool]>,
    ) -> Result<()> {
        if !self.config.foreign_keys {
            return Ok(());
        }
        let pk_changed = changed.is_none() || table.ipk.map_or(true, |i| changed.is_some_and(|c| c[i]));

        for fk in &table.foreign_keys {
            let cols: Vec<i32> = fk.columns.iter().map(|&c| c as i32).collect();
            if !touches(table, &cols, changed, pk_changed) {
                continue;
            }
            let parent = self.schema.table(&fk.parent);
            let key = match &parent {
                Some(p) => Some(locate_parent_key(p, table, fk)?),
                None => None,
            };
            trace!(child = %table.name, parent = %fk.parent, "foreign key child check");
            if let Some(old) = old {
                self.fk_lookup_parent(table, parent.as_ref(), key.as_ref(), fk, old, -1);
            }
            if let Some(new) = new {
                self.fk_lookup_parent(table, parent.as_ref(), key.as_ref(), fk, new, 1);
            }
        }

        for (child, n) in self.schema.referencing_keys(&table.name) {
            let fk = &child.foreign_keys[n];
            let key = locate_parent_key(table, &child, fk)?;
            if !touches(table, &key.columns, changed, pk_changed) {
                continue;
            }
            trace!(parent = %table.name, child = %child.name, "foreign key parent check");
            if let Some(old) = old {
                self.fk_scan_children(table, &child, fk, &key, old, 1)?;
            }
            if let Some(new) = new {
                self.fk_scan_children(table, &child, fk, &key, new, -1)?;
            }
        }
        Ok(())
    }

    /// Adjust the counter by `incr` unless the parent of the child row at
    /// `image` exists; a NULL in the child key satisfies the constraint
    fn fk_lookup_parent(
        &mut self,
        child: &Arc<Table>,
        parent: Option<&Arc<Table>>,
        key: Option<&ParentKey>,
        fk: &ForeignKey,
        image: i32,
        incr: i32,
    ) {
        let ok = self.v.make_label();
        let regs: Vec<i32> = fk.columns.iter().map(|&c| image_reg(child, image, c as i32)).collect();
        for &r in &regs {
            self.v.add_jump(Opcode::IsNull, r, ok, 0);
        }
        if incr < 0 {
            self.v.add_jump(Opcode::FkIfZero, 0, ok, 0);
        }
        if let (Some(parent), Some(key)) = (parent, key) {
            let self_ref = incr > 0 && same_name(&parent.name, &child.name);
            let missing = self.v.make_label();
            let cursor = self.alloc_cursor();
            match &key.index {
                None => {
                    self.v.add_op2(Opcode::OpenRead, cursor, parent.root as i32);
                    let tmp = self.alloc_reg(1);
                    self.v.add_op2(Opcode::SCopy, regs[0], tmp);
                    self.v.add_jump(Opcode::MustBeInt, tmp, missing, 0);
                    if self_ref {
                        self.v.add_jump(Opcode::Eq, tmp, ok, image);
                    }
                    self.v.add_jump(Opcode::NotExists, cursor, missing, tmp);
                    self.v.goto(ok);
                }
                Some(index) => {
                    let key_info = Arc::new(index_key_info(index));
                    self.v
                        .add_op4(Opcode::OpenRead, cursor, index.root as i32, 0, P4::KeyInfo(key_info));
                    let n = key.order.len();
                    let probe = self.alloc_reg(n as i32);
                    for (k, &j) in key.order.iter().enumerate() {
                        self.v.add_op2(Opcode::SCopy, regs[j], probe + k as i32);
                    }
                    let aff: String = index_affinity(index, parent).chars().take(n).collect();
                    self.v
                        .add_op4(Opcode::Affinity, probe, aff.len() as i32, 0, P4::Text(aff));
                    if self_ref {
                        // The row being written may be its own parent
                        let differ = self.v.make_label();
                        for (j, &p) in key.columns.iter().enumerate() {
                            self.v
                                .add_jump(Opcode::Ne, regs[j], differ, image_reg(parent, image, p));
                            self.v.change_p5(cmp_flags::JUMPIFNULL);
                        }
                        self.v.goto(ok);
                        self.v.resolve_label(differ);
                    }
                    self.v
                        .add_op4(Opcode::Found, cursor, ok.value(), probe, P4::Int64(n as i64));
                }
            }
            self.v.resolve_label(missing);
        }
        self.v.add_op2(Opcode::FkCounter, 0, incr);
        self.v.resolve_label(ok);
    }

    /// Adjust the counter by `incr` for every child row referencing the
    /// parent key of the row at `image`
    fn fk_scan_children(
        &mut self,
        parent: &Arc<Table>,
        child: &Arc<Table>,
        fk: &ForeignKey,
        key: &ParentKey,
        image: i32,
        incr: i32,
    ) -> Result<()> {
        let done = self.v.make_label();
        if incr < 0 {
            self.v.add_jump(Opcode::FkIfZero, 0, done, 0);
        }
        let regs: Vec<i32> = key.columns.iter().map(|&p| image_reg(parent, image, p)).collect();
        for &r in &regs {
            self.v.add_jump(Opcode::IsNull, r, done, 0);
        }

        let cursor = self.alloc_cursor();
        self.sources.insert(cursor, CursorSource::Table(child.clone()));
        let mut cond: Option<Expr> = None;
        for (j, &c) in fk.columns.iter().enumerate() {
            let p = key.columns[j];
            let (affinity, collation) = if p < 0 || parent.ipk == Some(p as usize) {
                (Some(Affinity::Integer), None)
            } else {
                let col = &parent.columns[p as usize];
                (Some(col.affinity), Some(col.collation))
            };
            let value = Expr::Register {
                reg: regs[j],
                affinity,
                collation,
            };
            let term = Expr::binary(BinaryOp::Eq, column_ref(child, cursor, c as i32), value);
            cond = Expr::and(cond, Some(term));
        }
        // A row referencing itself goes away with it
        if incr > 0 && same_name(&parent.name, &child.name) && child.has_rowid() {
            let this_row = Expr::Register {
                reg: image,
                affinity: Some(Affinity::Integer),
                collation: None,
            };
            let term = Expr::binary(BinaryOp::Ne, column_ref(child, cursor, -1), this_row);
            cond = Expr::and(cond, Some(term));
        }

        let info = self.where_begin(
            &[WhereItem::table(cursor, child.clone())],
            cond.as_ref(),
            &WhereOptions::default(),
        )?;
        self.v.add_op2(Opcode::FkCounter, 0, incr);
        self.where_end(info)?;
        self.v.resolve_label(done);
        Ok(())
    }

    /// Run the ON DELETE (`changed` is `None`) or ON UPDATE actions of
    /// every foreign key referencing `table`
    ///
    /// `base` is the OLD image of the row pair; the NEW image follows it.
    pub fn fk_actions(&mut self, table: &Arc<Table>, base: i32, changed: Option<&[bool]>) -> Result<()> {
        if !self.config.foreign_keys {
            return Ok(());
        }
        let pk_changed = table.ipk.map_or(true, |i| changed.map_or(true, |c| c[i]));
        for (child, n) in self.schema.referencing_keys(&table.name) {
            let fk = &child.foreign_keys[n];
            let action = if changed.is_some() { fk.on_update } else { fk.on_delete };
            if action == FkAction::NoAction {
                continue;
            }
            let key = locate_parent_key(table, &child, fk)?;
            if !touches(table, &key.columns, changed, pk_changed) {
                continue;
            }
            let trigger = action_trigger(table, &child, n, &key, action, changed.is_some())?;
            let idx = self.trigger_program(&trigger, table, None)?;
            let next = self.v.make_label();
            // Action triggers may recurse whatever the trigger settings
            self.v
                .add_op4(Opcode::Program, base, next.value(), 0, P4::Subprogram(idx));
            self.v.comment(format!("fk action {}", trigger.name));
            self.v.resolve_label(next);
        }
        Ok(())
    }
}

/// The trigger carrying out `action` on the rows of `child` that
/// reference a changed or deleted row of `parent`
fn action_trigger(
    parent: &Table,
    child: &Table,
    n: usize,
    key: &ParentKey,
    action: FkAction,
    on_update: bool,
) -> Result<Trigger> {
    let fk = &child.foreign_keys[n];
    let parent_col = |j: usize| match key.columns[j] {
        p if p < 0 => "rowid".to_string(),
        p => quote(&parent.columns[p as usize].name),
    };
    let child_col = |j: usize| quote(&child.columns[fk.columns[j]].name);
    let n_col = fk.columns.len();
    let matches: Vec<String> = (0..n_col)
        .map(|j| format!("{} = old.{}", child_col(j), parent_col(j)))
        .collect();
    let matches = matches.join(" AND ");
    let target = quote(&child.name);

    let assign = |value: &dyn Fn(usize) -> String| {
        (0..n_col)
            .map(|j| format!("{} = {}", child_col(j), value(j)))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let sql = match action {
        FkAction::Cascade if !on_update => format!("DELETE FROM {} WHERE {}", target, matches),
        FkAction::Cascade => format!(
            "UPDATE {} SET {} WHERE {}",
            target,
            assign(&|j| format!("new.{}", parent_col(j))),
            matches
        ),
        FkAction::SetNull | FkAction::SetDefault => {
            format!("UPDATE {} SET {} WHERE {}", target, assign(&|_| "NULL".to_string()), matches)
        }
        FkAction::Restrict => format!(
            "SELECT RAISE(ABORT, 'FOREIGN KEY constraint failed') FROM {} WHERE {}",
            target, matches
        ),
        FkAction::NoAction => {
            return Err(Error::with_message(ErrorCode::Internal, "no foreign key action to code"));
        }
    };
    let mut body = parse(&sql)?;
    if action == FkAction::SetDefault {
        if let Some(Stmt::Update(update)) = body.first_mut() {
            for (j, a) in update.set.iter_mut().enumerate() {
                if let Some(default) = &child.columns[fk.columns[j]].default {
                    a.expr = default.clone();
                }
            }
        }
    }

    let when = if on_update {
        let same: Vec<String> = (0..n_col)
            .map(|j| format!("old.{} IS new.{}", parent_col(j), parent_col(j)))
            .collect();
        Some(parse_expr(&format!("NOT ({})", same.join(" AND ")))?)
    } else {
        None
    };
    let event = if on_update { "update" } else { "delete" };
    Ok(Trigger {
        name: format!("sqlite_fk_{}_{}_{}", child.name, n, event),
        table: parent.name.clone(),
        timing: TriggerTiming::After,
        event: if on_update {
            TriggerEvent::Update(Vec::new())
        } else {
            TriggerEvent::Delete
        },
        when,
        body,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::{DbConfig, DbConfigOption};
    use crate::executor::testing::exec;
    use crate::storage::Database;
    use crate::types::Value;

    fn fk_config() -> DbConfig {
        let mut c = DbConfig::default();
        c.set(DbConfigOption::EnableFkey, 1).unwrap();
        c
    }

    fn setup(sql: &str) -> (Database, DbConfig) {
        let c = fk_config();
        let mut db = Database::new();
        exec(&mut db, &c, sql).unwrap();
        (db, c)
    }

    fn count(db: &mut Database, c: &DbConfig, sql: &str) -> i64 {
        match exec(db, c, sql).unwrap()[0][0] {
            Value::Integer(n) => n,
            ref other => panic!("not a count: {:?}", other),
        }
    }

    const PARENT_CHILD: &str = "CREATE TABLE p(id INTEGER PRIMARY KEY, name TEXT UNIQUE);
         CREATE TABLE c(x, pid REFERENCES p(id));
         INSERT INTO p VALUES(1, 'one');";

    #[test]
    fn test_locate_rowid_and_index_keys() {
        let (db, _) = setup(
            "CREATE TABLE p(id INTEGER PRIMARY KEY, a, b, UNIQUE(b, a));
             CREATE TABLE c1(x REFERENCES p);
             CREATE TABLE c2(x, y, FOREIGN KEY(x, y) REFERENCES p(a, b));
             CREATE TABLE c3(x REFERENCES p(a));",
        );
        let p = db.schema.table("p").unwrap();
        let c1 = db.schema.table("c1").unwrap();
        let key = locate_parent_key(&p, &c1, &c1.foreign_keys[0]).unwrap();
        assert!(key.index.is_none());
        let c2 = db.schema.table("c2").unwrap();
        let key = locate_parent_key(&p, &c2, &c2.foreign_keys[0]).unwrap();
        assert_eq!(key.columns, vec![1, 2]);
        assert_eq!(key.order, vec![1, 0]);
        let c3 = db.schema.table("c3").unwrap();
        let e = locate_parent_key(&p, &c3, &c3.foreign_keys[0]).unwrap_err();
        assert_eq!(e.to_string(), "foreign key mismatch - \"c3\" referencing \"p\"");
    }

    #[test]
    fn test_child_insert_needs_parent() {
        let (mut db, c) = setup(PARENT_CHILD);
        exec(&mut db, &c, "INSERT INTO c VALUES('a', 1), ('b', NULL)").unwrap();
        let e = exec(&mut db, &c, "INSERT INTO c VALUES('c', 2)").unwrap_err();
        assert_eq!(e.to_string(), "FOREIGN KEY constraint failed");
        assert_eq!(count(&mut db, &c, "SELECT count(*) FROM c"), 2);
    }

    #[test]
    fn test_disabled_by_default() {
        let c = DbConfig::default();
        let mut db = Database::new();
        exec(&mut db, &c, PARENT_CHILD).unwrap();
        exec(&mut db, &c, "INSERT INTO c VALUES('a', 99)").unwrap();
    }

    #[test]
    fn test_parent_delete_with_children_fails() {
        let (mut db, c) = setup(PARENT_CHILD);
        exec(&mut db, &c, "INSERT INTO c VALUES('a', 1)").unwrap();
        let e = exec(&mut db, &c, "DELETE FROM p").unwrap_err();
        assert_eq!(e.to_string(), "FOREIGN KEY constraint failed");
        assert_eq!(count(&mut db, &c, "SELECT count(*) FROM p"), 1);
    }

    #[test]
    fn test_violation_fixed_within_statement() {
        let (mut db, c) = setup(
            "CREATE TABLE p(id INTEGER PRIMARY KEY);
             CREATE TABLE c(pid REFERENCES p);
             CREATE TRIGGER mk AFTER INSERT ON c BEGIN INSERT INTO p VALUES(new.pid); END;",
        );
        exec(&mut db, &c, "INSERT INTO c VALUES(7)").unwrap();
        assert_eq!(count(&mut db, &c, "SELECT count(*) FROM p"), 1);
    }

    #[test]
    fn test_cascade_delete() {
        let (mut db, c) = setup(
            "CREATE TABLE p(id INTEGER PRIMARY KEY);
             CREATE TABLE c(pid REFERENCES p ON DELETE CASCADE);
             INSERT INTO p VALUES(1), (2);
             INSERT INTO c VALUES(1), (1), (2);",
        );
        exec(&mut db, &c, "DELETE FROM p WHERE id = 1").unwrap();
        assert_eq!(count(&mut db, &c, "SELECT count(*) FROM c"), 1);
    }

    #[test]
    fn test_cascade_update_through_unique_index() {
        let (mut db, c) = setup(
            "CREATE TABLE p(id INTEGER PRIMARY KEY, name TEXT UNIQUE);
             CREATE TABLE c(pname REFERENCES p(name) ON UPDATE CASCADE);
             INSERT INTO p VALUES(1, 'one');
             INSERT INTO c VALUES('one');",
        );
        exec(&mut db, &c, "UPDATE p SET name = 'uno'").unwrap();
        assert_eq!(
            exec(&mut db, &c, "SELECT pname FROM c").unwrap(),
            vec![vec![Value::Text("uno".into())]]
        );
    }

    #[test]
    fn test_set_null_and_set_default() {
        let (mut db, c) = setup(
            "CREATE TABLE p(id INTEGER PRIMARY KEY);
             CREATE TABLE n(pid REFERENCES p ON DELETE SET NULL);
             CREATE TABLE d(pid DEFAULT 0 REFERENCES p ON DELETE SET DEFAULT);
             INSERT INTO p VALUES(0), (1);
             INSERT INTO n VALUES(1); INSERT INTO d VALUES(1);",
        );
        exec(&mut db, &c, "DELETE FROM p WHERE id = 1").unwrap();
        assert_eq!(exec(&mut db, &c, "SELECT pid FROM n").unwrap(), vec![vec![Value::Null]]);
        assert_eq!(exec(&mut db, &c, "SELECT pid FROM d").unwrap(), vec![vec![Value::Integer(0)]]);
    }

    #[test]
    fn test_restrict_raises() {
        let (mut db, c) = setup(
            "CREATE TABLE p(id INTEGER PRIMARY KEY);
             CREATE TABLE c(pid REFERENCES p ON DELETE RESTRICT);
             INSERT INTO p VALUES(1); INSERT INTO c VALUES(1);",
        );
        let e = exec(&mut db, &c, "DELETE FROM p").unwrap_err();
        assert_eq!(e.to_string(), "FOREIGN KEY constraint failed");
    }

    #[test]
    fn test_self_reference() {
        let (mut db, c) = setup("CREATE TABLE t(id INTEGER PRIMARY KEY, up REFERENCES t);");
        exec(&mut db, &c, "INSERT INTO t VALUES(1, 1)").unwrap();
        exec(&mut db, &c, "INSERT INTO t VALUES(2, 1)").unwrap();
        assert!(exec(&mut db, &c, "INSERT INTO t VALUES(3, 9)").is_err());
        assert!(exec(&mut db, &c, "DELETE FROM t WHERE id = 1").is_err());
        exec(&mut db, &c, "DELETE FROM t WHERE id = 2").unwrap();
        exec(&mut db, &c, "DELETE FROM t").unwrap();
    }

    #[test]
    fn test_required_only_for_touched_keys() {
        let (db, c) = setup(PARENT_CHILD);
        let schema = db.schema.clone();
        let parse = Parse::new(&schema, &c);
        let child = schema.table("c").unwrap();
        assert!(parse.fk_required(&child, None, false));
        assert!(!parse.fk_required(&child, Some(&[true, false]), false));
        assert!(parse.fk_required(&child, Some(&[false, true]), false));
        assert_eq!(parse.fk_oldmask(&child), vec![false, true]);
    }
}
