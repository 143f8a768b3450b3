//! Constraint checks and the final write of an INSERT or UPDATE row
//!
//! `generate_constraint_checks` runs against a complete NEW row image and
//! checks, in this order: NOT NULL, CHECK, the rowid (unless its REPLACE
//! has to wait for the other constraints), every UNIQUE index, then the
//! postponed rowid check. It leaves one record per index that needs a new
//! entry plus the table record, which `complete_insertion` writes.
//!
//! A failed constraint is handled by its policy: the statement's OR
//! clause when there is one, else the policy declared on the constraint,
//! else ABORT. An upsert overrides both for the constraints it targets.

use std::sync::Arc;

use tracing::trace;

use crate::error::{ConstraintKind, Result};
use crate::executor::delete::RowDelete;
use crate::executor::open::OpenedCursors;
use crate::executor::trigger::RowEvent;
use crate::executor::upsert::{ConflictTarget, Upsert};
use crate::executor::Parse;
use crate::parser::ast::{ConflictAction, Expr, UpsertAction};
use crate::schema::affinity::{index_affinity, table_affinity};
use crate::schema::{Index, IndexTarget, Table};
use crate::vdbe::ops::opflag;
use crate::vdbe::{Label, Opcode, P4};

/// Resolved handling of one failed constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    Rollback,
    Abort,
    Fail,
    Ignore,
    Replace,
    /// Upsert DO UPDATE of the conflicting row
    Update(usize),
}

impl OnError {
    fn of(action: ConflictAction) -> OnError {
        match action {
            ConflictAction::Rollback => OnError::Rollback,
            ConflictAction::Abort => OnError::Abort,
            ConflictAction::Fail => OnError::Fail,
            ConflictAction::Ignore => OnError::Ignore,
            ConflictAction::Replace => OnError::Replace,
        }
    }

    fn halt_action(self) -> ConflictAction {
        match self {
            OnError::Rollback => ConflictAction::Rollback,
            OnError::Fail => ConflictAction::Fail,
            _ => ConflictAction::Abort,
        }
    }
}

/// A row about to be written by INSERT or UPDATE
#[derive(Debug, Clone)]
pub struct RowWrite<'u> {
    pub table: Arc<Table>,
    pub cursors: OpenedCursors,
    /// NEW image: rowid at `new`, column `i` at `new + 1 + i`
    pub new: i32,
    /// UPDATE: key of the row being replaced (the rowid, or the primary
    /// key columns of a WITHOUT ROWID table in primary key order)
    pub old_key: Option<i32>,
    /// The rowid (or primary key) may differ from the old one
    pub pk_changed: bool,
    /// UPDATE: columns assigned by SET
    pub changed: Option<Vec<bool>>,
    /// Indexes that get a new entry; `None` means all of them
    pub indexes: Option<Vec<bool>>,
    /// OR clause of the statement
    pub conflict: Option<ConflictAction>,
    /// Where an IGNORE goes: the end of this row's processing
    pub ignore: Label,
    pub upsert: Option<&'u Upsert>,
}

impl RowWrite<'_> {
    pub fn is_update(&self) -> bool {
        self.old_key.is_some()
    }

    fn wants_index(&self, i: usize) -> bool {
        self.indexes.as_ref().map_or(true, |m| m.get(i).copied().unwrap_or(false))
    }
}

/// New index entry: record register and the key registers it was made from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexKey {
    pub record: i32,
    pub base: i32,
}

/// Output of the constraint checks
#[derive(Debug, Clone, Default)]
pub struct Checked {
    /// Entry per index of the table; `None` when it gets no new entry
    pub keys: Vec<Option<IndexKey>>,
    /// Table record of a rowid table
    pub record: Option<i32>,
    /// Some REPLACE may have deleted rows, so cursor positions are stale
    pub replace_used: bool,
}

/// Error message of a failed UNIQUE or PRIMARY KEY index
pub fn unique_message(table: &Table, index: &Index) -> String {
    let mut cols = Vec::with_capacity(index.n_key_col);
    for ic in &index.columns[..index.n_key_col] {
        match ic.target {
            IndexTarget::Column(c) => cols.push(format!("{}.{}", table.name, table.columns[c].name)),
            IndexTarget::Rowid => cols.push(format!("{}.rowid", table.name)),
            IndexTarget::Expr(_) => return format!("UNIQUE constraint failed: index '{}'", index.name),
        }
    }
    format!("UNIQUE constraint failed: {}", cols.join(", "))
}

/// Whether a resolved expression reads a column of `cursor` that changes
fn reads_changed(e: &Expr, cursor: i32, changed: &[bool], pk_changed: bool) -> bool {
    e.any(&mut |x| match x {
        Expr::Column(c) if c.cursor == cursor => {
            if c.column < 0 {
                pk_changed
            } else {
                changed.get(c.column as usize).copied().unwrap_or(false)
            }
        }
        _ => false,
    })
}

impl<'a> Parse<'a> {
    /// Fill registers with the entry `index` holds for the row read
    /// through `cursor` and return the first one
    ///
    /// When `skip` is given and the index is partial, rows its WHERE
    /// clause rejects jump to `skip` before any key is computed.
    pub fn code_index_key(
        &mut self,
        table: &Arc<Table>,
        index: &Index,
        cursor: i32,
        skip: Option<Label>,
    ) -> Result<i32> {
        if let (Some(w), Some(skip)) = (&index.partial, skip) {
            let mut w = w.clone();
            self.resolve_in_table(&mut w, table, cursor)?;
            self.expr_if_false(&w, skip, true)?;
        }
        let base = self.alloc_reg(index.n_column() as i32);
        for (j, ic) in index.columns.iter().enumerate() {
            let r = base + j as i32;
            match &ic.target {
                IndexTarget::Column(c) => self.code_column(cursor, *c as i32, r)?,
                IndexTarget::Rowid => self.code_column(cursor, -1, r)?,
                IndexTarget::Expr(e) => {
                    let mut e = e.clone();
                    self.resolve_in_table(&mut e, table, cursor)?;
                    self.expr_code(&e, r)?;
                }
            }
        }
        Ok(base)
    }

    /// Check every constraint of `w.table` against the NEW image
    pub fn generate_constraint_checks(&mut self, w: &RowWrite<'_>) -> Result<Checked> {
        let table = w.table.clone();
        let n_col = table.columns.len();
        let row = self.row_cursor(&table, w.new);
        let mut out = Checked {
            keys: vec![None; table.indexes.len()],
            ..Default::default()
        };

        let aff = table_affinity(&table);
        if !aff.is_empty() {
            self.v
                .add_op4(Opcode::Affinity, w.new + 1, aff.len() as i32, 0, P4::Text(aff.to_string()));
        }

        self.check_not_null(w, &table)?;
        self.check_constraints(w, &table, row)?;

        // A REPLACE on the rowid waits until the UNIQUE checks whose policy
        // is not REPLACE have passed
        let rowid_policy = if table.has_rowid() && w.pk_changed {
            Some(self.rowid_policy(w, &table))
        } else {
            None
        };
        let defer_rowid = rowid_policy == Some(OnError::Replace)
            && w.conflict != Some(ConflictAction::Replace)
            && table
                .indexes
                .iter()
                .enumerate()
                .any(|(i, index)| w.wants_index(i) && self.index_policy(w, index, i) != OnError::Replace);
        if let (Some(policy), false) = (rowid_policy, defer_rowid) {
            out.replace_used |= self.check_rowid(w, &table, policy)?;
        }

        let upsert_index = w.upsert.and_then(|u| u.first_index());
        let mut order: Vec<usize> = Vec::with_capacity(table.indexes.len());
        order.extend(upsert_index.filter(|&i| i < table.indexes.len()));
        order.extend((0..table.indexes.len()).filter(|&i| Some(i) != upsert_index));
        for i in order {
            if !w.wants_index(i) {
                continue;
            }
            let (key, replaced) = self.check_index(w, &table, i, row)?;
            out.keys[i] = Some(key);
            out.replace_used |= replaced;
        }

        if let (Some(policy), true) = (rowid_policy, defer_rowid) {
            trace!(table = %table.name, "rowid REPLACE check after the UNIQUE checks");
            out.replace_used |= self.check_rowid(w, &table, policy)?;
        }

        if table.has_rowid() {
            let rec = self.alloc_reg(1);
            self.v.add_op(Opcode::MakeRecord, w.new + 1, n_col as i32, rec);
            out.record = Some(rec);
        }
        Ok(out)
    }

    fn check_not_null(&mut self, w: &RowWrite<'_>, table: &Arc<Table>) -> Result<()> {
        for (i, col) in table.columns.iter().enumerate() {
            let Some(declared) = col.not_null else { continue };
            if table.has_rowid() && table.ipk == Some(i) {
                continue;
            }
            if let Some(changed) = &w.changed {
                if !changed[i] {
                    continue;
                }
            }
            let mut policy = w.conflict.unwrap_or(declared);
            if policy == ConflictAction::Replace && col.default.is_none() {
                policy = ConflictAction::Abort;
            }
            let reg = w.new + 1 + i as i32;
            let message = format!("NOT NULL constraint failed: {}.{}", table.name, col.name);
            match policy {
                ConflictAction::Ignore => {
                    self.v.add_jump(Opcode::IsNull, reg, w.ignore, 0);
                }
                ConflictAction::Replace => {
                    let ok = self.v.make_label();
                    self.v.add_jump(Opcode::NotNull, reg, ok, 0);
                    if let Some(default) = &col.default {
                        self.expr_code(default, reg)?;
                        let a = col.affinity.as_char().to_string();
                        self.v.add_op4(Opcode::Affinity, reg, 1, 0, P4::Text(a));
                    }
                    self.halt_constraint_if_null(ConstraintKind::NotNull, ConflictAction::Abort, message, reg);
                    self.v.resolve_label(ok);
                }
                other => self.halt_constraint_if_null(ConstraintKind::NotNull, other, message, reg),
            }
        }
        Ok(())
    }

    fn check_constraints(&mut self, w: &RowWrite<'_>, table: &Arc<Table>, row: i32) -> Result<()> {
        if table.checks.is_empty() {
            return Ok(());
        }
        let policy = match w.conflict.unwrap_or_default() {
            ConflictAction::Replace => ConflictAction::Abort,
            other => other,
        };
        for check in &table.checks {
            let mut e = check.expr.clone();
            self.resolve_in_table(&mut e, table, row)?;
            if let Some(changed) = &w.changed {
                if !reads_changed(&e, row, changed, w.pk_changed) {
                    continue;
                }
            }
            let ok = self.v.make_label();
            self.expr_if_true(&e, ok, true)?;
            if policy == ConflictAction::Ignore {
                self.v.goto(w.ignore);
            } else {
                let what = match &check.name {
                    Some(name) => name.clone(),
                    None => check.expr.to_string(),
                };
                self.halt_constraint(ConstraintKind::Check, policy, format!("CHECK constraint failed: {}", what));
            }
            self.v.resolve_label(ok);
        }
        Ok(())
    }

    fn rowid_policy(&self, w: &RowWrite<'_>, table: &Table) -> OnError {
        if let Some(policy) = w.upsert.and_then(|u| u.policy_for(ConflictTarget::Rowid)) {
            return policy;
        }
        OnError::of(w.conflict.unwrap_or(table.pk_on_conflict))
    }

    fn index_policy(&self, w: &RowWrite<'_>, index: &Index, i: usize) -> OnError {
        if let Some(policy) = w.upsert.and_then(|u| u.policy_for(ConflictTarget::Index(i))) {
            return policy;
        }
        OnError::of(w.conflict.unwrap_or(index.on_conflict))
    }

    /// Rows a REPLACE deletes go through the full delete path when a
    /// trigger or a foreign key has to see them
    fn replace_triggers(&self, table: &Table) -> Vec<Arc<crate::schema::Trigger>> {
        if self.config.recursive_triggers {
            self.triggers_for(table, RowEvent::Delete, None)
        } else {
            Vec::new()
        }
    }

    /// Returns whether a REPLACE was coded
    fn check_rowid(&mut self, w: &RowWrite<'_>, table: &Arc<Table>, policy: OnError) -> Result<bool> {
        let ok = self.v.make_label();
        if let Some(old) = w.old_key {
            self.v.add_jump(Opcode::Eq, w.new, ok, old);
        }
        self.v.add_jump(Opcode::NotExists, w.cursors.data, ok, w.new);
        // The data cursor now sits on the row holding the rowid
        let mut replaced = false;
        match policy {
            OnError::Replace => {
                replaced = true;
                let triggers = self.replace_triggers(table);
                if !triggers.is_empty() || self.fk_required(table, None, false) {
                    self.generate_row_delete(&RowDelete {
                        table,
                        cursors: w.cursors,
                        triggers: &triggers,
                        key: w.new,
                        count: false,
                        conflict: Some(ConflictAction::Replace),
                        positioned: true,
                    })?;
                } else if !table.indexes.is_empty() {
                    self.generate_row_index_delete(table, w.cursors, None)?;
                }
            }
            OnError::Ignore => {
                self.v.goto(w.ignore);
            }
            OnError::Update(clause) => {
                self.code_upsert_update(w, clause)?;
                self.v.goto(w.ignore);
            }
            other => {
                let (kind, name) = match table.ipk {
                    Some(c) => (ConstraintKind::PrimaryKey, table.columns[c].name.as_str()),
                    None => (ConstraintKind::RowId, "rowid"),
                };
                let message = format!("UNIQUE constraint failed: {}.{}", table.name, name);
                self.halt_constraint(kind, other.halt_action(), message);
            }
        }
        self.v.resolve_label(ok);
        Ok(replaced)
    }

    /// Build the new entry of index `i` and check it for a conflict
    fn check_index(
        &mut self,
        w: &RowWrite<'_>,
        table: &Arc<Table>,
        i: usize,
        row: i32,
    ) -> Result<(IndexKey, bool)> {
        let index = table.indexes[i].clone();
        let icur = w.cursors.index(i);
        let is_pk = table.without_rowid && index.is_primary_key();
        let ok = self.v.make_label();

        let record = self.alloc_reg(1);
        if index.partial.is_some() {
            self.v.add_op2(Opcode::Null, 0, record);
        }
        let base = self.code_index_key(table, &index, row, Some(ok))?;
        let aff = index_affinity(&index, table).to_string();
        self.v
            .add_op4(Opcode::MakeRecord, base, index.n_column() as i32, record, P4::Text(aff));
        let key = IndexKey { record, base };

        if !index.unique || (is_pk && w.is_update() && !w.pk_changed) {
            self.v.resolve_label(ok);
            return Ok((key, false));
        }

        let policy = self.index_policy(w, &index, i);
        self.v
            .add_op4(Opcode::NoConflict, icur, ok.value(), base, P4::Int64(index.n_key_col as i64));

        // Key of the conflicting row
        let conflict_key = if table.has_rowid() {
            let r = self.alloc_reg(1);
            self.v.add_op2(Opcode::IdxRowid, icur, r);
            if let Some(old) = w.old_key {
                self.v.add_jump(Opcode::Eq, r, ok, old);
            }
            r
        } else {
            let positions = index.pk_positions(table);
            let n_pk = positions.len() as i32;
            let regs = self.alloc_reg(n_pk);
            for (j, pos) in positions.iter().enumerate() {
                self.v.add_op(Opcode::Column, icur, *pos as i32, regs + j as i32);
            }
            if let Some(old) = w.old_key {
                self.code_same_pk(table, regs, old, ok);
            }
            regs
        };

        let mut replaced = false;
        match policy {
            OnError::Replace => {
                replaced = true;
                let triggers = self.replace_triggers(table);
                self.generate_row_delete(&RowDelete {
                    table,
                    cursors: w.cursors,
                    triggers: &triggers,
                    key: conflict_key,
                    count: false,
                    conflict: Some(ConflictAction::Replace),
                    positioned: is_pk,
                })?;
            }
            OnError::Ignore => {
                self.v.goto(w.ignore);
            }
            OnError::Update(clause) => {
                if !is_pk {
                    self.seek_row(table, w.cursors.data, conflict_key, ok);
                }
                self.code_upsert_update(w, clause)?;
                self.v.goto(w.ignore);
            }
            other => {
                let kind = if index.is_primary_key() {
                    ConstraintKind::PrimaryKey
                } else {
                    ConstraintKind::Unique
                };
                self.halt_constraint(kind, other.halt_action(), unique_message(table, &index));
            }
        }
        self.v.resolve_label(ok);
        Ok((key, replaced))
    }

    /// Jump to `same` when the primary key in `a` equals the one in `b`
    fn code_same_pk(&mut self, table: &Table, a: i32, b: i32, same: Label) {
        let Some(pk) = table.pk_index() else { return };
        let n = pk.n_key_col;
        let differ = self.v.make_label();
        for j in 0..n {
            let collation = P4::Collation(pk.columns[j].collation);
            let (x, y) = (a + j as i32, b + j as i32);
            if j + 1 < n {
                self.v.add_op4(Opcode::Ne, x, differ.value(), y, collation);
            } else {
                self.v.add_op4(Opcode::Eq, x, same.value(), y, collation);
            }
        }
        self.v.resolve_label(differ);
    }

    /// Position the data cursor on the row with key `key`; jump to
    /// `missing` when there is none
    pub fn seek_row(&mut self, table: &Table, data: i32, key: i32, missing: Label) {
        match table.pk_index() {
            Some(pk) => {
                self.v
                    .add_op4(Opcode::NotFound, data, missing.value(), key, P4::Int64(pk.n_key_col as i64));
            }
            None => {
                self.v.add_jump(Opcode::NotExists, data, missing, key);
            }
        }
    }

    /// Write the new index entries and the table row
    pub fn complete_insertion(&mut self, w: &RowWrite<'_>, checked: &Checked) {
        let table = &w.table;
        for (i, key) in checked.keys.iter().enumerate() {
            let Some(key) = key else { continue };
            let index = &table.indexes[i];
            let skip = self.v.make_label();
            if index.partial.is_some() {
                self.v.add_jump(Opcode::IsNull, key.record, skip, 0);
            }
            let n = if index.is_unique_not_null(table) {
                index.n_key_col
            } else {
                index.n_column()
            };
            self.v
                .add_op4(Opcode::IdxInsert, w.cursors.index(i), key.record, key.base, P4::Int64(n as i64));
            if table.without_rowid && index.is_primary_key() {
                self.v.change_p5(opflag::NCHANGE);
            }
            self.v.resolve_label(skip);
        }
        if let Some(record) = checked.record {
            let mut flags = opflag::NCHANGE;
            flags |= if w.is_update() { opflag::ISUPDATE } else { opflag::LASTROWID };
            if !checked.replace_used {
                flags |= opflag::USESEEKRESULT;
            }
            self.v
                .add_op4(Opcode::Insert, w.cursors.data, record, w.new, P4::Table(table.name.clone()));
            self.v.change_p5(flags);
        }
    }
}

impl Upsert {
    /// Index targeted by the first clause, checked before the others
    fn first_index(&self) -> Option<usize> {
        self.clauses.iter().find_map(|c| match c.target {
            Some(ConflictTarget::Index(i)) => Some(i),
            _ => None,
        })
    }

    /// Handling an upsert imposes on a conflict with `target`
    pub fn policy_for(&self, target: ConflictTarget) -> Option<OnError> {
        let (n, clause) = self
            .clauses
            .iter()
            .enumerate()
            .find(|(_, c)| c.target.map_or(true, |t| t == target))?;
        Some(match clause.action {
            UpsertAction::Nothing => OnError::Ignore,
            UpsertAction::Update { .. } => OnError::Update(n),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
