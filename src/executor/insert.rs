//! INSERT code generation
//!
//! The shape of the program is picked once per statement:
//!
//! - transfer: `INSERT INTO t1 SELECT * FROM t2` between tables with the
//!   same layout copies records without decoding them. When a conflict is
//!   possible the copy only runs into an empty table; otherwise the
//!   program falls back to one of the shapes below.
//! - single row: a one-row VALUES (or DEFAULT VALUES) is computed in place
//! - streamed: the SELECT runs as a coroutine and each row it yields is
//!   inserted before the next one is computed
//! - buffered: when the SELECT reads the table being written, or a
//!   trigger could, its rows are first collected in a transient table
//!
//! AUTOINCREMENT keeps the largest rowid handed out in a root-frame
//! register block per table, loaded from `sqlite_sequence` before the
//! statement runs and stored back after it.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::api::config::Optimizations;
use crate::error::{ConstraintKind, Error, ErrorCode, Result};
use crate::executor::constraint::RowWrite;
use crate::executor::open::OpenedCursors;
use crate::executor::trigger::RowEvent;
use crate::executor::upsert::{resolve_upsert, Upsert};
use crate::executor::where_clause::walk_select_exprs;
use crate::executor::{same_name, AutoincInfo, Parse, SelectDest};
use crate::parser::ast::{
    ConflictAction, Expr, InsertSource, InsertStmt, ResultColumn, Select, SelectFlags, TriggerTiming,
};
use crate::schema::affinity::table_affinity;
use crate::schema::{Index, Table, Trigger, SEQUENCE_TABLE};
use crate::vdbe::ops::opflag;
use crate::vdbe::{Opcode, P4};

/// Where the values of one source row are
enum RowSource<'s> {
    /// Resolved expressions of a single VALUES row
    Exprs(&'s [Expr]),
    /// Registers `base..` filled by a coroutine or a transient table
    Regs(i32),
    /// DEFAULT VALUES
    Defaults,
}

/// Statement-wide state shared by every inserted row
struct InsertPlan<'p> {
    table: Arc<Table>,
    cursors: OpenedCursors,
    /// Source column feeding each table column; `None` takes the default
    map: Vec<Option<usize>>,
    /// Source column holding an explicit rowid
    rowid_src: Option<usize>,
    triggers: &'p [Arc<Trigger>],
    fk: bool,
    upsert: Option<&'p Upsert>,
    conflict: Option<ConflictAction>,
    /// AUTOINCREMENT register block
    autoinc: Option<i32>,
}

/// Whether `sel` reads table `name` anywhere, subqueries included
fn select_reads(sel: &Select, name: &str) -> bool {
    let from_hit = sel.terms().any(|term| {
        term.from.iter().any(|item| {
            item.table.as_ref().is_some_and(|t| !t.ephemeral && same_name(&t.name, name))
                || (item.subquery.is_none() && item.name.as_deref().is_some_and(|n| same_name(n, name)))
                || item.subquery.as_deref().is_some_and(|s| select_reads(s, name))
        })
    });
    if from_hit {
        return true;
    }
    let mut hit = false;
    walk_select_exprs(sel, &mut |e| {
        hit = hit
            || e.any(&mut |x| match x {
                Expr::Subquery(s) | Expr::Exists(s) => select_reads(s, name),
                Expr::InSelect { select, .. } => select_reads(select, name),
                _ => false,
            });
    });
    hit
}

/// A FROM-less single-row VALUES
fn is_single_row(sel: &Select) -> bool {
    sel.flags.contains(SelectFlags::VALUES) && sel.prior.is_none() && sel.from.is_empty()
}

/// Index compatible with `dest` for a raw record copy
fn transfer_compatible(dest: &Index, src: &Index) -> bool {
    dest.n_key_col == src.n_key_col
        && dest.unique == src.unique
        && dest.columns.len() == src.columns.len()
        && dest.partial == src.partial
        && dest
            .columns
            .iter()
            .zip(&src.columns)
            .all(|(a, b)| a.target == b.target && a.collation == b.collation && a.order == b.order)
}

impl<'a> Parse<'a> {
    /// Compile an INSERT statement
    pub fn code_insert(&mut self, stmt: &InsertStmt) -> Result<()> {
        let table = self.schema.require_table(&stmt.table)?;
        let pushed = self.push_ctes(stmt.with.as_ref());
        let r = if table.is_view() {
            self.code_view_insert(stmt, &table)
        } else {
            self.code_table_insert(stmt, &table)
        };
        self.pop_ctes(pushed);
        r
    }

    /// Map the column list onto `table`; returns the source column of each
    /// table column and of the rowid
    fn column_mapping(
        &self,
        stmt: &InsertStmt,
        table: &Table,
        n_src: usize,
    ) -> Result<(Vec<Option<usize>>, Option<usize>)> {
        let n_col = table.columns.len();
        let mut map = vec![None; n_col];
        let mut rowid_src = None;
        if stmt.columns.is_empty() {
            if n_src != n_col && !matches!(stmt.source, InsertSource::DefaultValues) {
                return Err(Error::sql(format!(
                    "table {} has {} columns but {} values were supplied",
                    table.name, n_col, n_src
                )));
            }
            if !matches!(stmt.source, InsertSource::DefaultValues) {
                for (i, slot) in map.iter_mut().enumerate() {
                    *slot = Some(i);
                }
                rowid_src = table.ipk.filter(|_| table.has_rowid());
            }
            return Ok((map, rowid_src));
        }
        if n_src != stmt.columns.len() {
            return Err(Error::sql(format!(
                "{} values for {} columns",
                n_src,
                stmt.columns.len()
            )));
        }
        for (j, name) in stmt.columns.iter().enumerate() {
            let c = table.find_column(name)?;
            if c < 0 {
                rowid_src = Some(j);
                continue;
            }
            map[c as usize] = Some(j);
            if table.has_rowid() && table.ipk == Some(c as usize) {
                rowid_src = Some(j);
            }
        }
        Ok((map, rowid_src))
    }

    fn code_table_insert(&mut self, stmt: &InsertStmt, table: &Arc<Table>) -> Result<()> {
        let conflict = stmt.or_conflict;
        let triggers = self.triggers_for(table, RowEvent::Insert, None);
        let fk = self.fk_required(table, None, false);
        let upsert = if stmt.upsert.is_empty() {
            None
        } else {
            Some(resolve_upsert(table, &stmt.upsert, stmt.alias.as_deref())?)
        };
        let autoinc = if table.autoincrement && table.has_rowid() {
            Some(self.autoinc_register(table)?)
        } else {
            None
        };
        self.set_writes();

        let mut select = match &stmt.source {
            InsertSource::Select(sel) => {
                let mut sel = (**sel).clone();
                self.prepare_select(&mut sel)?;
                Some(sel)
            }
            InsertSource::DefaultValues => None,
        };
        let n_src = select.as_ref().map_or(0, |s| s.column_count());
        let (map, rowid_src) = self.column_mapping(stmt, table, n_src)?;

        let done = self.v.make_label();
        let transfer = match &stmt.source {
            InsertSource::Select(raw) if upsert.is_none() => self.transfer_source(stmt, raw, table, &triggers, fk),
            _ => None,
        };
        if let Some(src) = transfer {
            let fallback = self.v.make_label();
            let needs_fallback = self.code_transfer(table, &src, conflict, fallback)?;
            if !needs_fallback {
                return Ok(());
            }
            self.v.goto(done);
            self.v.resolve_label(fallback);
        }

        let shape = match &select {
            None => "default values",
            Some(sel) if is_single_row(sel) => "single row",
            Some(sel) if select_reads(sel, &table.name) || !triggers.is_empty() => "buffered",
            Some(_) => "streamed",
        };
        debug!(table = %table.name, shape, triggers = triggers.len(), fk, upsert = upsert.is_some(), "code insert");

        let plan_for = |cursors: OpenedCursors| InsertPlan {
            table: table.clone(),
            cursors,
            map: map.clone(),
            rowid_src,
            triggers: &triggers,
            fk,
            upsert: upsert.as_ref(),
            conflict,
            autoinc,
        };

        match (select.as_mut(), shape) {
            (None, _) => {
                let cursors = self.open_table_and_indices(table, Opcode::OpenWrite, None, None);
                self.insert_row(&plan_for(cursors), &RowSource::Defaults)?;
            }
            (Some(sel), "single row") => {
                let exprs: Vec<Expr> = sel
                    .columns
                    .iter()
                    .map(|c| match c {
                        ResultColumn::Expr { expr, .. } => Ok(expr.clone()),
                        _ => Err(Error::with_message(ErrorCode::Internal, "unexpanded VALUES row")),
                    })
                    .collect::<Result<_>>()?;
                let cursors = self.open_table_and_indices(table, Opcode::OpenWrite, None, None);
                self.insert_row(&plan_for(cursors), &RowSource::Exprs(&exprs))?;
            }
            (Some(sel), "buffered") => {
                let eph = self.alloc_cursor();
                self.v.add_op2(Opcode::OpenEphemeral, eph, n_src as i32);
                self.code_select(sel, SelectDest::EphemTable { cursor: eph })?;
                let cursors = self.open_table_and_indices(table, Opcode::OpenWrite, None, None);
                let base = self.alloc_reg(n_src as i32);
                let end = self.v.make_label();
                self.v.add_jump(Opcode::Rewind, eph, end, 0);
                let top = self.v.current_addr();
                for j in 0..n_src {
                    self.v.add_op(Opcode::Column, eph, j as i32, base + j as i32);
                }
                self.insert_row(&plan_for(cursors), &RowSource::Regs(base))?;
                self.v.add_op2(Opcode::Next, eph, top);
                self.v.resolve_label(end);
            }
            (Some(sel), _) => {
                let reg = self.alloc_reg(1);
                let base = self.alloc_reg(n_src as i32);
                let after = self.v.make_label();
                let start = self.v.current_addr() + 1;
                self.v.add_jump(Opcode::InitCoroutine, reg, after, start);
                self.code_select(sel, SelectDest::Coroutine { reg, base })?;
                self.v.add_op1(Opcode::EndCoroutine, reg);
                self.v.resolve_label(after);
                let cursors = self.open_table_and_indices(table, Opcode::OpenWrite, None, None);
                let end = self.v.make_label();
                let top = self.v.add_jump(Opcode::Yield, reg, end, 0);
                self.insert_row(&plan_for(cursors), &RowSource::Regs(base))?;
                self.v.add_op2(Opcode::Goto, 0, top);
                self.v.resolve_label(end);
            }
        }
        self.v.resolve_label(done);
        Ok(())
    }

    /// Put source column `j` in `target`
    fn load_source(&mut self, source: &RowSource<'_>, j: usize, target: i32) -> Result<()> {
        match source {
            RowSource::Exprs(exprs) => self.expr_code(&exprs[j], target),
            RowSource::Regs(base) => {
                self.v.add_op2(Opcode::Copy, base + j as i32, target);
                Ok(())
            }
            RowSource::Defaults => Err(Error::with_message(ErrorCode::Internal, "no source column")),
        }
    }

    /// Insert one row: NEW image, BEFORE triggers, rowid, constraint
    /// checks, the write itself, AFTER triggers
    fn insert_row(&mut self, plan: &InsertPlan<'_>, source: &RowSource<'_>) -> Result<()> {
        let table = &plan.table;
        let (old, new) = self.alloc_row_images(table);
        let next = self.v.make_label();

        for (i, col) in table.columns.iter().enumerate() {
            let target = new + 1 + i as i32;
            if table.has_rowid() && table.ipk == Some(i) {
                // Stored as NULL; the value lives in the rowid register
                self.v.add_op2(Opcode::Null, 0, target);
                continue;
            }
            match plan.map[i] {
                Some(j) => self.load_source(source, j, target)?,
                None => match &col.default {
                    Some(default) => self.expr_code(default, target)?,
                    None => {
                        self.v.add_op2(Opcode::Null, 0, target);
                    }
                },
            }
        }

        let has_before = plan.triggers.iter().any(|t| t.timing == TriggerTiming::Before);
        if has_before {
            // BEFORE triggers see -1 for a rowid that is not chosen yet
            match plan.rowid_src {
                Some(j) if table.has_rowid() => {
                    let given = self.v.make_label();
                    let set = self.v.make_label();
                    self.load_source(source, j, new)?;
                    self.v.add_jump(Opcode::NotNull, new, given, 0);
                    self.v.add_op2(Opcode::Integer, -1, new);
                    self.v.goto(set);
                    self.v.resolve_label(given);
                    self.v.add_op2(Opcode::MustBeInt, new, 0);
                    self.v.resolve_label(set);
                }
                _ => {
                    self.v.add_op2(Opcode::Integer, -1, new);
                }
            }
            let aff = table_affinity(table);
            if !aff.is_empty() {
                self.v
                    .add_op4(Opcode::Affinity, new + 1, aff.len() as i32, 0, P4::Text(aff.to_string()));
            }
            self.code_row_triggers(plan.triggers, TriggerTiming::Before, table, old, plan.conflict, next)?;
        }

        if table.has_rowid() {
            self.code_new_rowid(plan, source, new)?;
        } else {
            self.v.add_op2(Opcode::Null, 0, new);
        }

        let write = RowWrite {
            table: table.clone(),
            cursors: plan.cursors,
            new,
            old_key: None,
            pk_changed: true,
            changed: None,
            indexes: None,
            conflict: plan.conflict,
            ignore: next,
            upsert: plan.upsert,
        };
        let checked = self.generate_constraint_checks(&write)?;
        if plan.fk {
            self.fk_check(table, None, Some(new), None)?;
        }
        self.complete_insertion(&write, &checked);
        self.code_row_triggers(plan.triggers, TriggerTiming::After, table, old, plan.conflict, next)?;
        self.v.resolve_label(next);
        Ok(())
    }

    /// Fill the rowid register: the explicit value when there is one and
    /// it is not NULL, else a fresh rowid
    fn code_new_rowid(&mut self, plan: &InsertPlan<'_>, source: &RowSource<'_>, new: i32) -> Result<()> {
        let floor = plan.autoinc.map_or(0, |r| r + 1);
        let Some(j) = plan.rowid_src else {
            self.v.add_op(Opcode::NewRowid, plan.cursors.data, new, floor);
            return Ok(());
        };
        let given = self.v.make_label();
        let set = self.v.make_label();
        self.load_source(source, j, new)?;
        self.v.add_jump(Opcode::NotNull, new, given, 0);
        self.v.add_op(Opcode::NewRowid, plan.cursors.data, new, floor);
        self.v.goto(set);
        self.v.resolve_label(given);
        self.v.add_op2(Opcode::MustBeInt, new, 0);
        if let Some(reg) = plan.autoinc {
            self.v.add_op2(Opcode::MemMax, reg + 1, new);
        }
        self.v.resolve_label(set);
        Ok(())
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// INSERT into a view: each source row goes to the INSTEAD OF triggers
    fn code_view_insert(&mut self, stmt: &InsertStmt, view: &Arc<Table>) -> Result<()> {
        if !stmt.upsert.is_empty() {
            return Err(Error::sql("cannot UPSERT a view"));
        }
        let triggers = self.instead_of_triggers(view, RowEvent::Insert, None)?;
        let mut select = match &stmt.source {
            InsertSource::Select(sel) => {
                let mut sel = (**sel).clone();
                self.prepare_select(&mut sel)?;
                Some(sel)
            }
            InsertSource::DefaultValues => None,
        };
        let n_src = select.as_ref().map_or(0, |s| s.column_count());
        let (map, _) = self.column_mapping(stmt, view, n_src)?;
        let (old, new) = self.alloc_row_images(view);

        let done = self.v.make_label();
        let (source, eph) = match select.as_mut() {
            Some(sel) => {
                let eph = self.alloc_cursor();
                self.v.add_op2(Opcode::OpenEphemeral, eph, n_src as i32);
                self.code_select(sel, SelectDest::EphemTable { cursor: eph })?;
                let base = self.alloc_reg(n_src as i32);
                (RowSource::Regs(base), Some((eph, base)))
            }
            None => (RowSource::Defaults, None),
        };
        let mut top = None;
        if let Some((eph, base)) = eph {
            self.v.add_jump(Opcode::Rewind, eph, done, 0);
            top = Some(self.v.current_addr());
            for j in 0..n_src {
                self.v.add_op(Opcode::Column, eph, j as i32, base + j as i32);
            }
        }
        let next = self.v.make_label();
        self.v.add_op2(Opcode::Null, 0, new);
        for i in 0..view.columns.len() {
            let target = new + 1 + i as i32;
            match map[i] {
                Some(j) => self.load_source(&source, j, target)?,
                None => {
                    self.v.add_op2(Opcode::Null, 0, target);
                }
            }
        }
        self.code_row_triggers(&triggers, TriggerTiming::InsteadOf, view, old, stmt.or_conflict, next)?;
        self.v.resolve_label(next);
        if let (Some((eph, _)), Some(top)) = (eph, top) {
            self.v.add_op2(Opcode::Next, eph, top);
        }
        self.v.resolve_label(done);
        Ok(())
    }

    // ========================================================================
    // Transfer
    // ========================================================================

    /// Source table of an `INSERT INTO dest SELECT * FROM src` whose
    /// records can be copied as they are
    fn transfer_source(
        &self,
        stmt: &InsertStmt,
        sel: &Select,
        dest: &Table,
        triggers: &[Arc<Trigger>],
        fk: bool,
    ) -> Option<Arc<Table>> {
        if !self.config.enabled(Optimizations::TRANSFER)
            || !stmt.columns.is_empty()
            || stmt.with.is_some()
            || !triggers.is_empty()
            || (fk && !dest.foreign_keys.is_empty())
            || dest.autoincrement
        {
            return None;
        }
        let simple = sel.columns.len() == 1
            && matches!(sel.columns[0], ResultColumn::Star)
            && sel.from.len() == 1
            && sel.from[0].subquery.is_none()
            && sel.where_clause.is_none()
            && sel.group_by.is_empty()
            && sel.having.is_none()
            && sel.order_by.is_empty()
            && sel.limit.is_none()
            && !sel.distinct
            && sel.prior.is_none()
            && sel.with.is_none();
        if !simple {
            return None;
        }
        let name = sel.from[0].name.as_deref()?;
        if self.ctes.iter().any(|c| same_name(&c.cte.name, name)) {
            return None;
        }
        let src = self.schema.table(name)?;
        if src.is_view() || same_name(&src.name, &dest.name) {
            return None;
        }
        if src.columns.len() != dest.columns.len()
            || src.without_rowid != dest.without_rowid
            || src.ipk != dest.ipk
        {
            return None;
        }
        let columns_match = dest.columns.iter().zip(&src.columns).all(|(d, s)| {
            d.affinity == s.affinity && d.collation == s.collation && (d.not_null.is_none() || s.not_null.is_some())
        });
        if !columns_match {
            return None;
        }
        if !dest.checks.is_empty() && dest.checks.iter().map(|c| &c.expr).ne(src.checks.iter().map(|c| &c.expr)) {
            return None;
        }
        let indexes_match = dest
            .indexes
            .iter()
            .all(|d| src.indexes.iter().any(|s| transfer_compatible(d, s)));
        indexes_match.then_some(src)
    }

    /// Copy every record of `src` into `dest`
    ///
    /// Returns whether the copy may be abandoned at run time for a non-empty
    /// destination, in which case execution continues at `fallback`.
    fn code_transfer(
        &mut self,
        dest: &Arc<Table>,
        src: &Arc<Table>,
        conflict: Option<ConflictAction>,
        fallback: crate::vdbe::Label,
    ) -> Result<bool> {
        let policy = conflict.unwrap_or_default();
        let needs_empty = (dest.ipk.is_none() && !dest.indexes.is_empty())
            || dest.indexes.iter().any(|i| i.unique)
            || !matches!(policy, ConflictAction::Abort | ConflictAction::Rollback);
        debug!(dest = %dest.name, src = %src.name, needs_empty, "insert by record transfer");

        let to = self.open_table_and_indices(dest, Opcode::OpenWrite, None, None);
        if needs_empty {
            let empty = self.v.make_label();
            self.v.add_jump(Opcode::Rewind, to.data, empty, 0);
            self.v.goto(fallback);
            self.v.resolve_label(empty);
        }
        let from = self.open_table_and_indices(src, Opcode::OpenRead, None, None);
        let rec = self.alloc_reg(1);

        if dest.has_rowid() {
            let rowid = self.alloc_reg(1);
            let end = self.v.make_label();
            self.v.add_jump(Opcode::Rewind, from.data, end, 0);
            let top = self.v.current_addr();
            if needs_empty {
                self.v.add_op2(Opcode::Rowid, from.data, rowid);
            } else if let Some(ipk) = dest.ipk {
                let ok = self.v.make_label();
                self.v.add_op2(Opcode::Rowid, from.data, rowid);
                self.v.add_jump(Opcode::NotExists, to.data, ok, rowid);
                let message = format!("UNIQUE constraint failed: {}.{}", dest.name, dest.columns[ipk].name);
                self.halt_constraint(ConstraintKind::PrimaryKey, policy, message);
                self.v.resolve_label(ok);
            } else {
                self.v.add_op(Opcode::NewRowid, to.data, rowid, 0);
            }
            self.v.add_op2(Opcode::RowData, from.data, rec);
            self.v
                .add_op4(Opcode::Insert, to.data, rec, rowid, P4::Table(dest.name.clone()));
            self.v.change_p5(opflag::NCHANGE | opflag::LASTROWID);
            self.v.add_op2(Opcode::Next, from.data, top);
            self.v.resolve_label(end);
        }

        for (i, index) in dest.indexes.iter().enumerate() {
            let Some(j) = src.indexes.iter().position(|s| transfer_compatible(index, s)) else {
                return Err(Error::with_message(ErrorCode::Internal, "transfer index vanished"));
            };
            trace!(dest = %index.name, src = %src.indexes[j].name, "transfer index");
            let end = self.v.make_label();
            self.v.add_jump(Opcode::Rewind, from.index(j), end, 0);
            let top = self.v.current_addr();
            self.v.add_op2(Opcode::RowData, from.index(j), rec);
            self.v.add_op2(Opcode::IdxInsert, to.index(i), rec);
            if dest.without_rowid && index.is_primary_key() {
                self.v.change_p5(opflag::NCHANGE);
            }
            self.v.add_op2(Opcode::Next, from.index(j), top);
            self.v.resolve_label(end);
        }
        Ok(needs_empty)
    }

    // ========================================================================
    // AUTOINCREMENT
    // ========================================================================

    /// Register block of `table`'s AUTOINCREMENT bookkeeping, allocated
    /// on first use
    fn autoinc_register(&mut self, table: &Arc<Table>) -> Result<i32> {
        if self.schema.table(SEQUENCE_TABLE).is_none() {
            return Err(Error::with_message(ErrorCode::Internal, "missing sqlite_sequence"));
        }
        if let Some(info) = self
            .top
            .borrow()
            .autoinc
            .iter()
            .find(|a| same_name(&a.table.name, &table.name))
        {
            return Ok(info.reg);
        }
        let reg = self.alloc_root_reg(4);
        self.top.borrow_mut().autoinc.push(AutoincInfo {
            table: table.clone(),
            reg,
        });
        Ok(reg)
    }
}

/// Load the AUTOINCREMENT counters of the statement from `sqlite_sequence`
pub fn autoinc_begin(p: &mut Parse<'_>) -> Result<()> {
    let infos = p.top.borrow().autoinc.clone();
    if infos.is_empty() {
        return Ok(());
    }
    let seq = p
        .schema
        .table(SEQUENCE_TABLE)
        .ok_or_else(|| Error::with_message(ErrorCode::Internal, "missing sqlite_sequence"))?;
    for info in infos {
        let reg = info.reg;
        let cursor = p.alloc_cursor();
        p.v.add_op4(Opcode::String8, 0, reg, 0, P4::Text(info.table.name.clone()));
        p.v.add_op2(Opcode::Integer, 0, reg + 1);
        p.v.add_op2(Opcode::Null, 0, reg + 2);
        p.v.add_op2(Opcode::OpenRead, cursor, seq.root as i32);
        p.v.comment(SEQUENCE_TABLE);
        let done = p.v.make_label();
        let next = p.v.make_label();
        p.v.add_jump(Opcode::Rewind, cursor, done, 0);
        let top = p.v.current_addr();
        p.v.add_op(Opcode::Column, cursor, 0, reg + 3);
        p.v.add_jump(Opcode::Ne, reg + 3, next, reg);
        p.v.add_op2(Opcode::Rowid, cursor, reg + 2);
        p.v.add_op(Opcode::Column, cursor, 1, reg + 1);
        p.v.goto(done);
        p.v.resolve_label(next);
        p.v.add_op2(Opcode::Next, cursor, top);
        p.v.resolve_label(done);
        p.v.add_op1(Opcode::Close, cursor);
        trace!(table = %info.table.name, reg, "autoincrement load");
    }
    Ok(())
}

/// Store the AUTOINCREMENT counters back into `sqlite_sequence`
pub fn autoinc_end(p: &mut Parse<'_>) -> Result<()> {
    let infos = p.top.borrow().autoinc.clone();
    if infos.is_empty() {
        return Ok(());
    }
    let seq = p
        .schema
        .table(SEQUENCE_TABLE)
        .ok_or_else(|| Error::with_message(ErrorCode::Internal, "missing sqlite_sequence"))?;
    for info in infos {
        let reg = info.reg;
        let cursor = p.alloc_cursor();
        p.v.add_op2(Opcode::OpenWrite, cursor, seq.root as i32);
        p.v.comment(SEQUENCE_TABLE);
        let have = p.v.make_label();
        p.v.add_jump(Opcode::NotNull, reg + 2, have, 0);
        p.v.add_op(Opcode::NewRowid, cursor, reg + 2, 0);
        p.v.resolve_label(have);
        p.v.add_op(Opcode::MakeRecord, reg, 2, reg + 3);
        p.v
            .add_op4(Opcode::Insert, cursor, reg + 3, reg + 2, P4::Table(SEQUENCE_TABLE.to_string()));
        p.v.add_op1(Opcode::Close, cursor);
    }
    Ok(())
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

    fn err(db: &mut Database, sql: &str) -> String {
        exec(db, &DbConfig::default(), sql).unwrap_err().to_string()
    }

    fn has(db: &Database, config: &DbConfig, sql: &str, op: Opcode) -> bool {
        program(db, config, sql).unwrap().ops.iter().any(|o| o.opcode == op)
    }

    #[test]
    fn test_single_row_values_has_no_coroutine() {
        let db = db("CREATE TABLE t(a, b);");
        let c = DbConfig::default();
        assert!(!has(&db, &c, "INSERT INTO t VALUES(1, 2)", Opcode::InitCoroutine));
        assert!(has(&db, &c, "INSERT INTO t VALUES(1, 2), (3, 4)", Opcode::InitCoroutine));
    }

    #[test]
    fn test_self_insert_is_buffered() {
        let mut db = db("CREATE TABLE t(a); INSERT INTO t VALUES(1), (2);");
        let c = DbConfig::default();
        assert!(has(&db, &c, "INSERT INTO t SELECT a + 10 FROM t", Opcode::OpenEphemeral));
        rows(&mut db, "INSERT INTO t SELECT a + 10 FROM t");
        assert_eq!(rows(&mut db, "SELECT count(*) FROM t"), vec![vec![Value::Integer(4)]]);
    }

    #[test]
    fn test_column_list_and_defaults() {
        let mut db = db("CREATE TABLE t(a, b DEFAULT 'dflt', c);");
        rows(&mut db, "INSERT INTO t(c, a) VALUES(3, 1)");
        assert_eq!(
            rows(&mut db, "SELECT a, b, c FROM t"),
            vec![vec![Value::Integer(1), Value::Text("dflt".into()), Value::Integer(3)]]
        );
        rows(&mut db, "DELETE FROM t; INSERT INTO t DEFAULT VALUES");
        assert_eq!(
            rows(&mut db, "SELECT a, b FROM t"),
            vec![vec![Value::Null, Value::Text("dflt".into())]]
        );
    }

    #[test]
    fn test_value_count_errors() {
        let mut db = db("CREATE TABLE t(a, b);");
        assert_eq!(err(&mut db, "INSERT INTO t VALUES(1)"), "table t has 2 columns but 1 values were supplied");
        assert_eq!(err(&mut db, "INSERT INTO t(a) VALUES(1, 2)"), "2 values for 1 columns");
        assert_eq!(err(&mut db, "INSERT INTO t(zz) VALUES(1)"), "table t has no column named zz");
    }

    #[test]
    fn test_explicit_rowid_and_datatype_mismatch() {
        let mut db = db("CREATE TABLE t(id INTEGER PRIMARY KEY, v);");
        rows(&mut db, "INSERT INTO t VALUES(10, 'a'), (NULL, 'b')");
        assert_eq!(
            rows(&mut db, "SELECT id FROM t ORDER BY id"),
            vec![vec![Value::Integer(10)], vec![Value::Integer(11)]]
        );
        assert_eq!(err(&mut db, "INSERT INTO t VALUES('x', 1)"), "datatype mismatch");
    }

    #[test]
    fn test_autoincrement_never_reuses() {
        let mut db = db("CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, v);");
        rows(&mut db, "INSERT INTO t(v) VALUES('a'), ('b')");
        rows(&mut db, "DELETE FROM t WHERE id = 2");
        rows(&mut db, "INSERT INTO t(v) VALUES('c')");
        assert_eq!(
            rows(&mut db, "SELECT id FROM t ORDER BY id"),
            vec![vec![Value::Integer(1)], vec![Value::Integer(3)]]
        );
        assert_eq!(
            rows(&mut db, "SELECT seq FROM sqlite_sequence WHERE name = 't'"),
            vec![vec![Value::Integer(3)]]
        );
        rows(&mut db, "INSERT INTO t VALUES(100, 'd'); INSERT INTO t(v) VALUES('e')");
        assert_eq!(rows(&mut db, "SELECT max(id) FROM t"), vec![vec![Value::Integer(101)]]);
    }

    #[test]
    fn test_before_trigger_sees_minus_one_rowid() {
        let mut db = db(
            "CREATE TABLE t(id INTEGER PRIMARY KEY, v); CREATE TABLE log(r);
             CREATE TRIGGER b BEFORE INSERT ON t BEGIN INSERT INTO log VALUES(new.id); END;
             CREATE TRIGGER a AFTER INSERT ON t BEGIN INSERT INTO log VALUES(new.id); END;",
        );
        rows(&mut db, "INSERT INTO t(v) VALUES('x')");
        assert_eq!(
            rows(&mut db, "SELECT r FROM log ORDER BY r"),
            vec![vec![Value::Integer(-1)], vec![Value::Integer(1)]]
        );
    }

    #[test]
    fn test_transfer_copies_records() {
        let mut db = db(
            "CREATE TABLE s(a INTEGER PRIMARY KEY, b TEXT UNIQUE);
             CREATE TABLE d(a INTEGER PRIMARY KEY, b TEXT UNIQUE);
             INSERT INTO s VALUES(1, 'x'), (2, 'y');",
        );
        let c = DbConfig::default();
        let sql = "INSERT INTO d SELECT * FROM s";
        assert!(has(&db, &c, sql, Opcode::RowData));
        rows(&mut db, sql);
        assert_eq!(rows(&mut db, "SELECT count(*) FROM d WHERE b = 'y'"), vec![vec![Value::Integer(1)]]);
        // Non-empty destination with a UNIQUE index takes the checked path
        assert_eq!(err(&mut db, sql), "UNIQUE constraint failed: d.a");

        let mut off = DbConfig::default();
        off.set_optimizations(Optimizations::TRANSFER, false);
        assert!(!has(&db, &off, sql, Opcode::RowData));
    }

    #[test]
    fn test_view_insert_goes_to_instead_of() {
        let mut db = db(
            "CREATE TABLE t(a); CREATE VIEW v AS SELECT a FROM t;
             CREATE TRIGGER vi INSTEAD OF INSERT ON v BEGIN INSERT INTO t VALUES(new.a * 2); END;",
        );
        rows(&mut db, "INSERT INTO v VALUES(4)");
        assert_eq!(rows(&mut db, "SELECT a FROM t"), vec![vec![Value::Integer(8)]]);
        assert_eq!(
            err(&mut db, "INSERT INTO v VALUES(1) ON CONFLICT DO NOTHING"),
            "cannot UPSERT a view"
        );
    }
}
