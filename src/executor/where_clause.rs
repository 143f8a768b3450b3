//! WHERE clause planning and loop generation
//!
//! FROM items are looped over in the order they are written; there is no
//! join reordering. For each item the planner picks one access path:
//!
//! - rowid equality (`SeekRowid`), a single row
//! - rowid range (`SeekGE`/`SeekGT` plus an end test on the rowid)
//! - index equality on a key prefix, optionally followed by a range on
//!   the next key column
//! - a full scan, forwards or backwards
//!
//! A coroutine subquery in the first position is stepped with `Yield`.
//!
//! Every WHERE term is also evaluated as a filter at the innermost level it
//! depends on, so an access path only has to be a superset of the rows
//! that qualify. Terms that depend on no FROM item run once, before the
//! first loop opens.
//!
//! The right side of a LEFT JOIN keeps a match flag; when the loop over it
//! ends without a match the cursor is moved to its null row and the inner
//! part of the loop runs once more.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::executor::expr::{binary_collation, expr_collation};
use crate::executor::{CursorSource, Parse};
use crate::parser::ast::{
    BinaryOp, ColumnRef, Expr, NullsOrder, OrderingTerm, ResultColumn, Select, SortOrder,
};
use crate::schema::affinity::{compare_affinity, index_affinity};
use crate::schema::build::index_key_info;
use crate::schema::{expr_affinity, Affinity, Index, IndexTarget, Table};
use crate::vdbe::value::Collation;
use crate::vdbe::{Label, Opcode, P4};

// ============================================================================
// Planner inputs and outputs
// ============================================================================

/// How the rows of a FROM item are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// A schema table, opened by the planner unless `opened`
    Table,
    /// A transient table already filled by the caller
    Ephemeral,
    /// A subquery run as a coroutine; `Yield reg` delivers the next row
    Coroutine { reg: i32 },
}

/// One FROM item as the planner sees it
#[derive(Debug, Clone)]
pub struct WhereItem {
    pub cursor: i32,
    pub table: Arc<Table>,
    pub left_join: bool,
    pub kind: ItemKind,
    /// The caller already opened the table cursor (write statements)
    pub opened: bool,
}

impl WhereItem {
    pub fn table(cursor: i32, table: Arc<Table>) -> Self {
        WhereItem {
            cursor,
            table,
            left_join: false,
            kind: ItemKind::Table,
            opened: false,
        }
    }
}

/// Whether the caller can process rows as the loop visits them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnePass {
    #[default]
    Off,
    /// At most one row is visited
    Single,
    /// Rows may be changed while the loop is still running
    Multi,
}

/// Planner options
#[derive(Debug, Clone, Default)]
pub struct WhereOptions {
    /// Order the caller would like rows delivered in
    pub order_by: Vec<OrderingTerm>,
    /// `order_by` is a GROUP BY: only adjacency of equal keys matters
    pub group_by: bool,
    /// One-pass mode the caller can accept
    pub onepass: OnePass,
    /// Indexes the caller modifies; a multi-row one-pass loop must not
    /// be driven by one of them
    pub modified_indexes: Vec<String>,
}

/// Loop state handed back by [`Parse::where_begin`]
#[derive(Debug)]
pub struct WhereInfo {
    levels: Vec<Level>,
    done: Label,
    /// Rows come out in the order asked for
    pub order_satisfied: bool,
    /// One-pass mode chosen
    pub onepass: OnePass,
}

impl WhereInfo {
    /// Jump target that ends the whole loop
    pub fn break_label(&self) -> Label {
        self.done
    }

    /// Jump target that moves on to the next row of the innermost loop
    pub fn continue_label(&self) -> Label {
        self.levels.last().map_or(self.done, |l| l.cont)
    }

    /// Whether the outermost level visits at most one row
    pub fn single_row(&self) -> bool {
        self.levels.first().map_or(true, |l| l.single_row)
    }

    /// Index cursor driving the outermost loop, if any
    pub fn index_cursor(&self) -> Option<i32> {
        self.levels.first().and_then(|l| l.index_cursor)
    }
}

#[derive(Debug)]
struct Level {
    cont: Label,
    brk: Label,
    /// Instruction that advances the loop and where it jumps back to
    advance: Option<(Opcode, i32, i32)>,
    left_match: Option<i32>,
    set_match: Option<Label>,
    null_cursors: Vec<i32>,
    index_cursor: Option<i32>,
    single_row: bool,
}

// ============================================================================
// Access paths
// ============================================================================

#[derive(Debug, Clone)]
struct Bound {
    expr: Expr,
    inclusive: bool,
}

#[derive(Debug, Clone)]
enum Access {
    Scan,
    Coroutine(i32),
    RowidEq(Expr),
    RowidRange {
        low: Option<Bound>,
        high: Option<Bound>,
    },
    Index {
        index: Arc<Index>,
        eq: Vec<Expr>,
        low: Option<Bound>,
        high: Option<Bound>,
    },
}

#[derive(Debug, Clone)]
struct Plan {
    access: Access,
    score: i32,
    single_row: bool,
    reverse: bool,
    ordered: bool,
}

impl Plan {
    fn new(access: Access, score: i32) -> Self {
        Plan {
            access,
            score,
            single_row: false,
            reverse: false,
            ordered: false,
        }
    }

    fn describe(&self) -> String {
        match &self.access {
            Access::Scan => "scan".to_string(),
            Access::Coroutine(_) => "coroutine".to_string(),
            Access::RowidEq(_) => "rowid eq".to_string(),
            Access::RowidRange { .. } => "rowid range".to_string(),
            Access::Index { index, eq, .. } => format!("index {} ({} eq)", index.name, eq.len()),
        }
    }
}

/// `column op rhs` usable to drive a lookup on `cursor`
#[derive(Debug, Clone)]
struct Constraint {
    cursor: i32,
    column: i32,
    affinity: Option<Affinity>,
    op: BinaryOp,
    lhs: Expr,
    rhs: Expr,
    on_join: Option<i32>,
}

fn as_column(e: &Expr) -> Option<&ColumnRef> {
    match e {
        Expr::Column(c) => Some(c),
        Expr::Collate { expr, .. } => as_column(expr),
        _ => None,
    }
}

/// Collect the lookup constraints contained in one WHERE term
fn constraints_of(term: &Expr, out: &mut Vec<Constraint>) {
    let (on_join, inner) = match term {
        Expr::OnJoin { cursor, expr } => (Some(*cursor), expr.as_ref()),
        other => (None, other),
    };
    let mut push = |lhs: &Expr, op: BinaryOp, rhs: &Expr| {
        if let Some(c) = as_column(lhs) {
            out.push(Constraint {
                cursor: c.cursor,
                column: c.column,
                affinity: c.affinity,
                op,
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                on_join,
            });
        }
    };
    match inner {
        Expr::Binary(op, l, r)
            if matches!(op, BinaryOp::Eq | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge) =>
        {
            push(l, *op, r);
            push(r, op.commute(), l);
        }
        Expr::Between {
            expr,
            low,
            high,
            negated: false,
        } => {
            push(expr, BinaryOp::Ge, low);
            push(expr, BinaryOp::Le, high);
        }
        _ => {}
    }
}

/// Whether comparing a column of affinity `col` against `rhs` converts the
/// right side the way the column's stored values were converted
fn affinity_ok(col: Option<Affinity>, rhs: &Expr) -> bool {
    let cmp = compare_affinity(col, expr_affinity(rhs, None));
    match col.unwrap_or(Affinity::Blob) {
        Affinity::Blob => cmp.map_or(true, |a| a == Affinity::Blob),
        Affinity::Text => !cmp.map_or(false, |a| a.is_numeric()),
        _ => true,
    }
}

/// Every cursor `e` reads, including from inside subqueries
pub fn referenced_cursors(e: &Expr) -> Vec<i32> {
    let mut out = Vec::new();
    collect_cursors(e, &mut out);
    out
}

fn collect_cursors(e: &Expr, out: &mut Vec<i32>) {
    e.walk(&mut |x| match x {
        Expr::Column(c) => out.push(c.cursor),
        Expr::IfNullRow { cursor, .. } => out.push(*cursor),
        Expr::Subquery(s) | Expr::Exists(s) | Expr::InSelect { select: s, .. } => {
            walk_select_exprs(s, &mut |inner| collect_cursors(inner, out))
        }
        _ => {}
    });
}

/// Visit the top-level expressions of every term of `sel` and its
/// FROM-clause subqueries
pub fn walk_select_exprs(sel: &Select, f: &mut dyn FnMut(&Expr)) {
    for term in sel.terms() {
        for item in &term.from {
            if let Some(sub) = &item.subquery {
                walk_select_exprs(sub, f);
            }
            if let Some(on) = &item.on {
                f(on);
            }
        }
        for c in &term.columns {
            if let ResultColumn::Expr { expr, .. } = c {
                f(expr);
            }
        }
        for e in term.where_clause.iter().chain(term.having.iter()) {
            f(e);
        }
        for e in &term.group_by {
            f(e);
        }
        for o in &term.order_by {
            f(&o.expr);
        }
        for e in term.limit.iter().chain(term.offset.iter()) {
            f(e);
        }
    }
}

// ============================================================================
// Ordering
// ============================================================================

/// Reverse flag under which a rowid-ordered loop over `cursor` delivers
/// `order_by`, or None when it does not
fn rowid_order(order_by: &[OrderingTerm], cursor: i32, table: &Table) -> Option<bool> {
    let first = order_by.first()?;
    let c = as_column(&first.expr)?;
    let is_rowid = c.column < 0 || (table.has_rowid() && table.ipk == Some(c.column as usize));
    if c.cursor != cursor || !is_rowid || first.nulls != NullsOrder::Default {
        return None;
    }
    Some(first.is_desc())
}

/// Reverse flag under which a scan of `index` past an `n_eq`-column
/// equality prefix delivers `order_by`, or None when it does not
fn index_order(
    order_by: &[OrderingTerm],
    group_by: bool,
    cursor: i32,
    index: &Index,
    table: &Table,
    n_eq: usize,
) -> Option<bool> {
    if order_by.is_empty() {
        return None;
    }
    let fixed: Vec<i32> = index.columns[..n_eq]
        .iter()
        .filter_map(|c| c.column_ordinal().map(|o| o as i32))
        .collect();
    let mut reverse = None;
    let mut j = n_eq;
    for term in order_by {
        let c = as_column(&term.expr)?;
        if c.cursor != cursor || term.nulls != NullsOrder::Default {
            return None;
        }
        let column = match table.ipk {
            Some(ipk) if table.has_rowid() && c.column == ipk as i32 => -1,
            _ => c.column,
        };
        if fixed.contains(&column) {
            continue;
        }
        let ic = index.columns.get(j)?;
        let matches = match ic.target {
            IndexTarget::Column(col) => col as i32 == column,
            IndexTarget::Rowid => column < 0,
            IndexTarget::Expr(_) => false,
        };
        if !matches || (column >= 0 && expr_collation(&term.expr) != ic.collation) {
            return None;
        }
        let desc = term.is_desc() != (ic.order == SortOrder::Desc);
        if !group_by {
            match reverse {
                None => reverse = Some(desc),
                Some(r) if r != desc => return None,
                _ => {}
            }
        }
        j += 1;
    }
    Some(reverse.unwrap_or(false))
}

// ============================================================================
// Planning
// ============================================================================

struct Planner<'p> {
    constraints: &'p [Constraint],
    levels: &'p HashMap<i32, usize>,
}

impl Planner<'_> {
    /// Constraints on `cursor` usable at level `at`
    fn usable(&self, item: &WhereItem, at: usize) -> Vec<&Constraint> {
        self.constraints
            .iter()
            .filter(|c| c.cursor == item.cursor)
            .filter(|c| {
                if item.left_join {
                    c.on_join == Some(item.cursor)
                } else {
                    c.on_join.is_none()
                }
            })
            .filter(|c| {
                referenced_cursors(&c.rhs)
                    .iter()
                    .all(|cur| self.levels.get(cur).map_or(true, |&l| l < at))
            })
            .collect()
    }

    fn plan(&self, item: &WhereItem, at: usize, opts: &WhereOptions) -> Plan {
        match item.kind {
            ItemKind::Coroutine { reg } => return Plan::new(Access::Coroutine(reg), 0),
            ItemKind::Ephemeral => return Plan::new(Access::Scan, 0),
            ItemKind::Table => {}
        }
        let table = &item.table;
        let usable = self.usable(item, at);
        let order_by: &[OrderingTerm] = if at == 0 { &opts.order_by } else { &[] };
        let mut candidates = Vec::new();

        // Full scan, in rowid or primary key order
        let mut scan = Plan::new(Access::Scan, 0);
        let scan_order = match table.pk_index() {
            Some(pk) => index_order(order_by, opts.group_by, item.cursor, pk, table, 0),
            None => rowid_order(order_by, item.cursor, table),
        };
        if let Some(rev) = scan_order {
            scan.ordered = true;
            scan.reverse = rev;
        }
        candidates.push(scan);

        if table.has_rowid() {
            let rowid: Vec<&&Constraint> = usable
                .iter()
                .filter(|c| c.column < 0 || table.ipk == Some(c.column as usize))
                .collect();
            if let Some(eq) = rowid.iter().find(|c| c.op == BinaryOp::Eq) {
                let mut p = Plan::new(Access::RowidEq(eq.rhs.clone()), 100);
                p.single_row = true;
                p.ordered = true;
                candidates.push(p);
            }
            let low = rowid.iter().find_map(|c| bound_of(c, true));
            let high = rowid.iter().find_map(|c| bound_of(c, false));
            if low.is_some() || high.is_some() {
                let mut p = Plan::new(Access::RowidRange { low, high }, 30);
                if let Some(rev) = rowid_order(order_by, item.cursor, table) {
                    p.ordered = true;
                    p.reverse = rev;
                }
                candidates.push(p);
            }
        }

        for index in &table.indexes {
            if index.partial.is_some() {
                continue;
            }
            if let Some(p) = self.index_plan(item, index, &usable, order_by, opts.group_by) {
                candidates.push(p);
            }
        }

        let mut best: Option<Plan> = None;
        for mut p in candidates {
            if p.ordered && !order_by.is_empty() {
                p.score += 1;
            }
            if best.as_ref().map_or(true, |b| p.score > b.score) {
                best = Some(p);
            }
        }
        best.unwrap_or_else(|| Plan::new(Access::Scan, 0))
    }

    fn index_plan(
        &self,
        item: &WhereItem,
        index: &Arc<Index>,
        usable: &[&Constraint],
        order_by: &[OrderingTerm],
        group_by: bool,
    ) -> Option<Plan> {
        let matching = |col: usize, collation: Collation, want_eq: bool| {
            usable.iter().find(|c| {
                c.column == col as i32
                    && (c.op == BinaryOp::Eq) == want_eq
                    && binary_collation(&c.lhs, &c.rhs) == collation
                    && affinity_ok(c.affinity, &c.rhs)
            })
        };

        let mut eq = Vec::new();
        for ic in &index.columns[..index.n_key_col] {
            let IndexTarget::Column(col) = &ic.target else { break };
            match matching(*col, ic.collation, true) {
                Some(c) => eq.push(c.rhs.clone()),
                None => break,
            }
        }
        let n_eq = eq.len();

        let (mut low, mut high) = (None, None);
        if let Some(ic) = index.columns.get(n_eq).filter(|_| n_eq < index.n_key_col) {
            if let (IndexTarget::Column(col), SortOrder::Asc) = (&ic.target, ic.order) {
                let ranged: Vec<&&Constraint> = usable
                    .iter()
                    .filter(|c| {
                        c.column == *col as i32
                            && c.op != BinaryOp::Eq
                            && binary_collation(&c.lhs, &c.rhs) == ic.collation
                            && affinity_ok(c.affinity, &c.rhs)
                    })
                    .collect();
                low = ranged.iter().find_map(|c| bound_of(c, true));
                high = ranged.iter().find_map(|c| bound_of(c, false));
            }
        }
        let has_range = low.is_some() || high.is_some();
        let order = index_order(order_by, group_by, item.cursor, index, &item.table, n_eq);

        let single_row = index.unique && n_eq == index.n_key_col;
        let score = if n_eq > 0 {
            50 + 5 * n_eq as i32 + if single_row { 20 } else { 0 } + if has_range { 2 } else { 0 }
        } else if has_range {
            25
        } else if order.is_some() {
            1
        } else {
            return None;
        };
        let mut p = Plan::new(
            Access::Index {
                index: index.clone(),
                eq,
                low,
                high,
            },
            score,
        );
        p.single_row = single_row;
        if let Some(rev) = order {
            p.ordered = true;
            p.reverse = rev;
        }
        if single_row {
            p.ordered = true;
            p.reverse = false;
        }
        Some(p)
    }
}

fn bound_of(c: &Constraint, lower: bool) -> Option<Bound> {
    let (is_lower, inclusive) = match c.op {
        BinaryOp::Gt => (true, false),
        BinaryOp::Ge => (true, true),
        BinaryOp::Lt => (false, false),
        BinaryOp::Le => (false, true),
        _ => return None,
    };
    (is_lower == lower).then(|| Bound {
        expr: c.rhs.clone(),
        inclusive,
    })
}

// ============================================================================
// Loop generation
// ============================================================================

impl<'a> Parse<'a> {
    /// Open the nested loops over `items`, filtered by `where_clause`.
    ///
    /// Code emitted between this call and [`Parse::where_end`] runs once
    /// per qualifying row combination.
    pub fn where_begin(
        &mut self,
        items: &[WhereItem],
        where_clause: Option<&Expr>,
        opts: &WhereOptions,
    ) -> Result<WhereInfo> {
        let done = self.v.make_label();
        let levels_of: HashMap<i32, usize> = items.iter().enumerate().map(|(i, it)| (it.cursor, i)).collect();

        let terms: Vec<Expr> = where_clause.cloned().map(Expr::split_and).unwrap_or_default();
        let mut constraints = Vec::new();
        for t in &terms {
            constraints_of(t, &mut constraints);
        }

        // Level at which each term can first be evaluated
        let term_level = |t: &Expr| -> Option<usize> {
            let mut level = match t {
                Expr::OnJoin { cursor, .. } => levels_of.get(cursor).copied(),
                _ => None,
            };
            for c in referenced_cursors(t) {
                if let Some(&l) = levels_of.get(&c) {
                    level = Some(level.map_or(l, |x: usize| x.max(l)));
                }
            }
            level
        };
        let placed: Vec<(Option<usize>, &Expr)> = terms.iter().map(|t| (term_level(t), t)).collect();

        for (level, t) in &placed {
            if level.is_none() {
                self.expr_if_false(t, done, true)?;
            }
        }

        let planner = Planner {
            constraints: &constraints,
            levels: &levels_of,
        };
        let mut levels = Vec::with_capacity(items.len());
        let mut order_satisfied = opts.order_by.is_empty();
        let mut onepass = OnePass::Off;

        for (at, item) in items.iter().enumerate() {
            let plan = planner.plan(item, at, opts);
            trace!(table = %item.table.name, cursor = item.cursor, level = at, plan = %plan.describe(), "where level");
            if at == 0 {
                order_satisfied = order_satisfied || plan.ordered;
                if items.len() == 1 {
                    onepass = match opts.onepass {
                        OnePass::Off => OnePass::Off,
                        _ if plan.single_row => OnePass::Single,
                        OnePass::Multi => {
                            let driven_by_modified = match &plan.access {
                                Access::Index { index, .. } => opts
                                    .modified_indexes
                                    .iter()
                                    .any(|n| n.eq_ignore_ascii_case(&index.name)),
                                _ => false,
                            };
                            if driven_by_modified {
                                OnePass::Off
                            } else {
                                OnePass::Multi
                            }
                        }
                        OnePass::Single => OnePass::Off,
                    };
                }
            }
            let level = self.code_level(item, &plan)?;

            // ON terms of a LEFT JOIN decide whether the row matched
            if let (Some(m), Some(set_match)) = (level.left_match, level.set_match) {
                for (l, t) in &placed {
                    if *l == Some(at) && matches!(t, Expr::OnJoin { cursor, .. } if *cursor == item.cursor) {
                        self.expr_if_false(t, level.cont, true)?;
                    }
                }
                self.v.resolve_label(set_match);
                self.v.add_op2(Opcode::Integer, 1, m);
            }
            for (l, t) in &placed {
                let is_own_on = item.left_join && matches!(t, Expr::OnJoin { cursor, .. } if *cursor == item.cursor);
                if *l == Some(at) && !is_own_on {
                    self.expr_if_false(t, level.cont, true)?;
                }
            }
            levels.push(level);
        }

        Ok(WhereInfo {
            levels,
            done,
            order_satisfied,
            onepass,
        })
    }

    /// Close the loops opened by [`Parse::where_begin`]
    pub fn where_end(&mut self, info: WhereInfo) -> Result<()> {
        for level in info.levels.iter().rev() {
            self.v.resolve_label(level.cont);
            if let Some((opcode, cursor, top)) = level.advance {
                self.v.add_op2(opcode, cursor, top);
            }
            self.v.resolve_label(level.brk);
            if let (Some(m), Some(set_match)) = (level.left_match, level.set_match) {
                let matched = self.v.make_label();
                self.v.add_jump(Opcode::IfPos, m, matched, 0);
                for &c in &level.null_cursors {
                    self.v.add_op1(Opcode::NullRow, c);
                }
                self.v.goto(set_match);
                self.v.resolve_label(matched);
            }
        }
        self.v.resolve_label(info.done);
        Ok(())
    }

    fn code_level(&mut self, item: &WhereItem, plan: &Plan) -> Result<Level> {
        let cont = self.v.make_label();
        let brk = self.v.make_label();
        let table = item.table.clone();
        let cursor = item.cursor;

        let left_match = if item.left_join {
            let m = self.alloc_reg(1);
            self.v.add_op2(Opcode::Integer, 0, m);
            Some(m)
        } else {
            None
        };

        if item.kind == ItemKind::Table {
            if !item.opened {
                match table.pk_index() {
                    Some(pk) => {
                        let ki = Arc::new(index_key_info(pk));
                        self.v
                            .add_op4(Opcode::OpenRead, cursor, pk.root as i32, 0, P4::KeyInfo(ki));
                    }
                    None => {
                        self.v.add_op2(Opcode::OpenRead, cursor, table.root as i32);
                    }
                }
                self.v.comment(table.name.clone());
            }
            self.sources.insert(cursor, CursorSource::Table(table.clone()));
        }

        let mut null_cursors = vec![cursor];
        let mut index_cursor = None;
        let (first, next) = if plan.reverse {
            (Opcode::Last, Opcode::Prev)
        } else {
            (Opcode::Rewind, Opcode::Next)
        };

        let advance = match &plan.access {
            Access::Coroutine(reg) => {
                let top = self.v.add_jump(Opcode::Yield, *reg, brk, 0);
                Some((Opcode::Goto, 0, top))
            }
            Access::Scan => {
                self.v.add_jump(first, cursor, brk, 0);
                Some((next, cursor, self.v.current_addr()))
            }
            Access::RowidEq(e) => {
                let r = self.expr_code_temp(e)?;
                self.v.add_jump(Opcode::SeekRowid, cursor, brk, r);
                None
            }
            Access::RowidRange { low, high } => {
                let (start, end) = if plan.reverse { (high, low) } else { (low, high) };
                let end_reg = match end {
                    Some(b) => Some((self.expr_code_temp(&b.expr)?, b.inclusive)),
                    None => None,
                };
                match start {
                    Some(b) => {
                        let r = self.expr_code_temp(&b.expr)?;
                        let seek = match (plan.reverse, b.inclusive) {
                            (false, true) => Opcode::SeekGE,
                            (false, false) => Opcode::SeekGT,
                            (true, true) => Opcode::SeekLE,
                            (true, false) => Opcode::SeekLT,
                        };
                        self.v.add_op4(seek, cursor, brk.value(), r, P4::Int64(1));
                    }
                    None => {
                        self.v.add_jump(first, cursor, brk, 0);
                    }
                }
                let top = self.v.current_addr();
                if let Some((r, inclusive)) = end_reg {
                    let rowid = self.alloc_reg(1);
                    self.v.add_op2(Opcode::Rowid, cursor, rowid);
                    let test = match (plan.reverse, inclusive) {
                        (false, true) => Opcode::Gt,
                        (false, false) => Opcode::Ge,
                        (true, true) => Opcode::Lt,
                        (true, false) => Opcode::Le,
                    };
                    self.v.add_op(test, rowid, brk.value(), r);
                    self.v.change_p5(Affinity::Numeric.p5_code());
                }
                Some((next, cursor, top))
            }
            Access::Index { index, eq, low, high } => {
                let is_pk = table.without_rowid && index.is_primary_key();
                let icur = if is_pk {
                    cursor
                } else {
                    let c = self.alloc_cursor();
                    let ki = Arc::new(index_key_info(index));
                    self.v
                        .add_op4(Opcode::OpenRead, c, index.root as i32, 0, P4::KeyInfo(ki));
                    self.v.comment(index.name.clone());
                    null_cursors.push(c);
                    index_cursor = Some(c);
                    c
                };
                let top = self.code_index_seek(&table, index, icur, eq, low.as_ref(), high.as_ref(), plan, brk)?;

                if !is_pk {
                    match table.pk_index() {
                        Some(pk) => {
                            let n_pk = pk.n_key_col;
                            let regs = self.alloc_reg(n_pk as i32);
                            for (j, pos) in index.pk_positions(&table).into_iter().enumerate() {
                                self.v.add_op(Opcode::Column, icur, pos as i32, regs + j as i32);
                            }
                            self.v
                                .add_op4(Opcode::NotFound, cursor, cont.value(), regs, P4::Int64(n_pk as i64));
                        }
                        None => {
                            let r = self.alloc_reg(1);
                            self.v.add_op2(Opcode::IdxRowid, icur, r);
                            self.v.add_jump(Opcode::SeekRowid, cursor, cont, r);
                        }
                    }
                }
                if plan.single_row {
                    None
                } else {
                    Some((next, icur, top))
                }
            }
        };

        Ok(Level {
            cont,
            brk,
            advance,
            left_match,
            set_match: left_match.map(|_| self.v.make_label()),
            null_cursors,
            index_cursor,
            single_row: plan.single_row,
        })
    }

    /// Position `icur` on the first entry of the range and emit the end
    /// test; returns the address the loop jumps back to
    #[allow(clippy::too_many_arguments)]
    fn code_index_seek(
        &mut self,
        table: &Table,
        index: &Index,
        icur: i32,
        eq: &[Expr],
        low: Option<&Bound>,
        high: Option<&Bound>,
        plan: &Plan,
        brk: Label,
    ) -> Result<i32> {
        let n_eq = eq.len();
        let affs: String = index_affinity(index, table).chars().collect();

        // Equality prefix plus one slot for each bound
        let probe_with = |p: &mut Parse<'_>, bound: Option<&Bound>| -> Result<(i32, i32)> {
            let regs = p.alloc_reg(n_eq as i32 + 1);
            for (j, e) in eq.iter().enumerate() {
                let r = regs + j as i32;
                p.expr_code(e, r)?;
                p.v.add_jump(Opcode::IsNull, r, brk, 0);
            }
            let mut n = n_eq as i32;
            if let Some(b) = bound {
                let r = regs + n;
                p.expr_code(&b.expr, r)?;
                p.v.add_jump(Opcode::IsNull, r, brk, 0);
                n += 1;
            }
            if n > 0 {
                let a: String = affs.chars().take(n as usize).collect();
                p.v.add_op4(Opcode::Affinity, regs, n, 0, P4::Text(a));
            }
            Ok((regs, n))
        };

        let (start, end) = if plan.reverse { (high, low) } else { (low, high) };
        let (start_regs, n_start) = probe_with(self, start)?;
        let end_probe = match end {
            Some(b) => Some((probe_with(self, Some(b))?, b.inclusive)),
            None => None,
        };

        if !plan.reverse {
            match start {
                Some(b) => {
                    let op = if b.inclusive { Opcode::SeekGE } else { Opcode::SeekGT };
                    self.v
                        .add_op4(op, icur, brk.value(), start_regs, P4::Int64(n_start as i64));
                }
                None if end.is_some() => {
                    // Step over NULLs in the range column
                    self.v.add_op2(Opcode::Null, 0, start_regs + n_eq as i32);
                    self.v
                        .add_op4(Opcode::SeekGT, icur, brk.value(), start_regs, P4::Int64(n_eq as i64 + 1));
                }
                None if n_eq > 0 => {
                    self.v
                        .add_op4(Opcode::SeekGE, icur, brk.value(), start_regs, P4::Int64(n_eq as i64));
                }
                None => {
                    self.v.add_jump(Opcode::Rewind, icur, brk, 0);
                }
            }
        } else {
            match start {
                Some(b) => {
                    let op = if b.inclusive { Opcode::SeekLE } else { Opcode::SeekLT };
                    self.v
                        .add_op4(op, icur, brk.value(), start_regs, P4::Int64(n_start as i64));
                }
                None if n_eq > 0 => {
                    self.v
                        .add_op4(Opcode::SeekLE, icur, brk.value(), start_regs, P4::Int64(n_eq as i64));
                }
                None => {
                    self.v.add_jump(Opcode::Last, icur, brk, 0);
                }
            }
        }

        let top = self.v.current_addr();
        match end_probe {
            Some(((regs, n), inclusive)) => {
                let op = match (plan.reverse, inclusive) {
                    (false, true) => Opcode::IdxGT,
                    (false, false) => Opcode::IdxGE,
                    (true, true) => Opcode::IdxLT,
                    (true, false) => Opcode::IdxLE,
                };
                self.v.add_op4(op, icur, brk.value(), regs, P4::Int64(n as i64));
            }
            None if n_eq > 0 => {
                let op = if plan.reverse { Opcode::IdxLT } else { Opcode::IdxGT };
                self.v
                    .add_op4(op, icur, brk.value(), start_regs, P4::Int64(n_eq as i64));
            }
            None => {}
        }
        Ok(top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DbConfig;
    use crate::parser::ast::Stmt;
    use crate::parser::grammar::parse_expr;
    use crate::parser::parse;
    use crate::storage::Database;

    fn db_with(sql: &str) -> Database {
        let mut db = Database::new();
        for stmt in parse(sql).unwrap() {
            match stmt {
                Stmt::CreateTable(ct) => {
                    crate::schema::build::create_table(&mut db, &ct).unwrap();
                }
                Stmt::CreateIndex(ci) => {
                    crate::schema::build::create_index(&mut db, &ci).unwrap();
                }
                other => panic!("unexpected statement {:?}", other),
            }
        }
        db
    }

    fn plan_for(db: &Database, table: &str, cond: &str, order: &[(&str, bool)]) -> Plan {
        let config = DbConfig::default();
        let mut p = Parse::new(&db.schema, &config);
        let t = db.schema.require_table(table).unwrap();
        let mut e = parse_expr(cond).unwrap();
        p.resolve_in_table(&mut e, &t, 0).unwrap();
        let mut order_by = Vec::new();
        for (name, desc) in order {
            let mut oe = parse_expr(name).unwrap();
            p.resolve_in_table(&mut oe, &t, 0).unwrap();
            let mut term = OrderingTerm::new(oe);
            if *desc {
                term.order = SortOrder::Desc;
            }
            order_by.push(term);
        }
        let mut constraints = Vec::new();
        for term in e.split_and() {
            constraints_of(&term, &mut constraints);
        }
        let levels = HashMap::from([(0, 0)]);
        let planner = Planner {
            constraints: &constraints,
            levels: &levels,
        };
        let opts = WhereOptions {
            order_by,
            ..Default::default()
        };
        planner.plan(&WhereItem::table(0, t), 0, &opts)
    }

    #[test]
    fn test_rowid_equality_wins() {
        let db = db_with("CREATE TABLE t(a INTEGER PRIMARY KEY, b UNIQUE);");
        let plan = plan_for(&db, "t", "a = 5 AND b = 3", &[]);
        assert!(matches!(plan.access, Access::RowidEq(_)));
        assert!(plan.single_row);
    }

    #[test]
    fn test_unique_index_full_key_is_single_row() {
        let db = db_with("CREATE TABLE t(a, b, c); CREATE UNIQUE INDEX tab ON t(a, b);");
        let plan = plan_for(&db, "t", "b = 2 AND a = 1", &[]);
        match &plan.access {
            Access::Index { index, eq, .. } => {
                assert_eq!(index.name, "tab");
                assert_eq!(eq.len(), 2);
            }
            other => panic!("unexpected access {:?}", other),
        }
        assert!(plan.single_row);
    }

    #[test]
    fn test_index_range_after_prefix() {
        let db = db_with("CREATE TABLE t(a, b); CREATE INDEX tab ON t(a, b);");
        let plan = plan_for(&db, "t", "a = 1 AND b > 2 AND b <= 9", &[]);
        match &plan.access {
            Access::Index { eq, low, high, .. } => {
                assert_eq!(eq.len(), 1);
                assert!(low.as_ref().is_some_and(|b| !b.inclusive));
                assert!(high.as_ref().is_some_and(|b| b.inclusive));
            }
            other => panic!("unexpected access {:?}", other),
        }
    }

    #[test]
    fn test_text_column_ignores_numeric_probe() {
        let db = db_with("CREATE TABLE t(a TEXT); CREATE INDEX ta ON t(a);");
        let plan = plan_for(&db, "t", "a = 5", &[]);
        assert!(matches!(plan.access, Access::Index { .. }));
        let plan = plan_for(&db, "t", "a = CAST(5 AS INTEGER)", &[]);
        assert!(matches!(plan.access, Access::Scan));
    }

    #[test]
    fn test_order_by_rowid_desc_scans_backwards() {
        let db = db_with("CREATE TABLE t(a INTEGER PRIMARY KEY, b);");
        let plan = plan_for(&db, "t", "b > 0", &[("a", true)]);
        assert!(matches!(plan.access, Access::Scan));
        assert!(plan.ordered);
        assert!(plan.reverse);
    }

    #[test]
    fn test_order_by_index_column() {
        let db = db_with("CREATE TABLE t(a, b); CREATE INDEX tb ON t(b);");
        let plan = plan_for(&db, "t", "1", &[("b", false)]);
        assert!(matches!(plan.access, Access::Index { .. }));
        assert!(plan.ordered);
        let plan = plan_for(&db, "t", "1", &[("b", false), ("a", false)]);
        assert!(!plan.ordered);
    }

    #[test]
    fn test_referenced_cursors_sees_correlated_subquery() {
        let db = db_with("CREATE TABLE t(a); CREATE TABLE u(x);");
        let config = DbConfig::default();
        let mut p = Parse::new(&db.schema, &config);
        let t = db.schema.require_table("t").unwrap();
        let mut e = parse_expr("EXISTS (SELECT 1 FROM u WHERE u.x = t.a)").unwrap();
        p.resolve_in_table(&mut e, &t, 7).unwrap();
        assert!(referenced_cursors(&e).contains(&7));
    }
}
