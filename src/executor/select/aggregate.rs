//! Aggregate queries
//!
//! Before any code is emitted, aggregate calls in the result, HAVING and
//! ORDER BY are replaced by `AggFunction` slots, and the source columns
//! read outside of aggregate calls by `AggColumn` slots. Each slot owns a
//! register: the accumulator of the call, or the value the column had in
//! the last row of the group.
//!
//! Without GROUP BY there is a single group. A lone `min(col)` or
//! `max(col)` stops after the first non-NULL row when the loop delivers
//! `col` in order. With GROUP BY, rows reach the group-break logic sorted
//! on the GROUP BY key, either through a sorter or straight from an index.

use std::sync::Arc;

use tracing::debug;

use crate::api::config::Optimizations;
use crate::error::Result;
use crate::executor::expr::expr_collation;
use crate::executor::where_clause::{WhereItem, WhereOptions};
use crate::executor::Parse;
use crate::functions::find_function;
use crate::parser::ast::{Expr, NullsOrder, OrderingTerm, ResultColumn, Select, SortOrder};
use crate::schema::expr_affinity;
use crate::vdbe::value::Collation;
use crate::vdbe::{KeyInfo, Label, Opcode, P4};

use super::flatten::for_each_select_expr;
use super::sort::SortCtx;
use super::{Limits, RowSink, SelectDest};

/// A source column read outside aggregate calls
#[derive(Debug, Clone, PartialEq)]
pub struct AggColumnSlot {
    pub expr: Expr,
    pub reg: i32,
}

/// One aggregate call
#[derive(Debug, Clone, PartialEq)]
pub struct AggFuncSlot {
    /// Lowercase function name
    pub name: String,
    pub args: Vec<Expr>,
    /// Transient index of the argument values already stepped (DISTINCT)
    pub distinct: Option<i32>,
    pub collation: Collation,
    /// Accumulator, then the final value
    pub reg: i32,
}

/// Slots of an aggregate query. While one is installed in
/// [`Parse::agg`], expression coding reads `AggColumn` and `AggFunction`
/// nodes from the slot registers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggCode {
    pub columns: Vec<AggColumnSlot>,
    pub funcs: Vec<AggFuncSlot>,
}

impl AggCode {
    pub fn column_reg(&self, i: usize) -> Option<i32> {
        self.columns.get(i).map(|c| c.reg)
    }

    pub fn func_reg(&self, i: usize) -> Option<i32> {
        self.funcs.get(i).map(|f| f.reg)
    }
}

/// What each group turns into
struct GroupOutput {
    results: Vec<Expr>,
    having: Option<Expr>,
    distinct: Option<i32>,
    sorter: Option<SortCtx>,
}

/// Registers and subroutines of the group-break logic
struct GroupRegs {
    ki: Arc<KeyInfo>,
    n_group: usize,
    prev: i32,
    cur: i32,
    use_flag: i32,
    out_ret: i32,
    output_sub: Label,
    reset_ret: i32,
    reset_sub: Label,
}

fn is_aggregate_call(name: &str, argc: usize) -> bool {
    find_function(name, argc).map_or(false, |f| f.is_aggregate())
}

fn call_argc(args: &[Expr], star: bool) -> usize {
    if star {
        0
    } else {
        args.len()
    }
}

/// A column, or a null-row wrapped expression, of one of `cursors`
fn reads_cursor(e: &Expr, cursors: &[i32]) -> bool {
    match e {
        Expr::Column(c) => cursors.contains(&c.cursor),
        Expr::IfNullRow { cursor, .. } => cursors.contains(cursor),
        _ => false,
    }
}

/// `e` read back from `reg`, comparing the same way
fn register_for(e: &Expr, reg: i32) -> Expr {
    let collation = match e {
        Expr::Column(c) => c.collation,
        _ => Some(expr_collation(e)),
    };
    Expr::Register {
        reg,
        affinity: expr_affinity(e, None),
        collation,
    }
}

/// Pre-order rewrite that also enters expression subqueries. `f` sees
/// each node and whether it lies inside a subquery; returning true stops
/// the descent below that node.
fn map_preorder(e: &mut Expr, nested: bool, f: &mut dyn FnMut(&mut Expr, bool) -> bool) {
    if f(e, nested) {
        return;
    }
    if let Expr::Subquery(s) | Expr::Exists(s) | Expr::InSelect { select: s, .. } = e {
        for_each_select_expr(s, &mut |x| map_preorder(x, true, &mut *f));
    }
    e.for_each_child_mut(&mut |c| map_preorder(c, nested, &mut *f));
}

/// ORDER BY that the group loop already produces
fn orders_like_groups(order_by: &[OrderingTerm], group_by: &[Expr]) -> bool {
    order_by.len() == group_by.len()
        && order_by.iter().zip(group_by).all(|(o, g)| {
            o.expr == *g && o.order == SortOrder::Asc && o.nulls != NullsOrder::Last
        })
}

impl<'a> Parse<'a> {
    /// Code an aggregate simple select. `sel` has been rewritten already.
    pub(super) fn code_aggregate(
        &mut self,
        sel: &mut Select,
        items: &[WhereItem],
        dest: &SelectDest,
        limits: Limits,
        done: Label,
    ) -> Result<()> {
        let group_by = std::mem::take(&mut sel.group_by);
        let sorted_by_groups = !group_by.is_empty() && orders_like_groups(&sel.order_by, &group_by);
        let minmax = if group_by.is_empty() {
            self.minmax_term(sel)
        } else {
            None
        };

        let agg = self.analyze_aggregates(sel);
        let results: Vec<Expr> = sel.result_exprs().cloned().collect();
        let n = results.len();
        let sorter = if sel.order_by.is_empty() || sorted_by_groups {
            None
        } else {
            Some(self.sort_open(&sel.order_by, n))
        };
        let distinct = if sel.distinct {
            Some(self.open_distinct(&results))
        } else {
            None
        };
        let out = GroupOutput {
            results,
            having: sel.having.take(),
            distinct,
            sorter,
        };

        if group_by.is_empty() {
            self.code_single_group(sel, items, &agg, minmax, &out, dest, limits, done)?;
        } else {
            self.code_groups(sel, items, &agg, &group_by, &out, dest, limits, done)?;
        }
        if let Some(s) = &out.sorter {
            self.sort_output(s, n, dest, limits, done)?;
        }
        Ok(())
    }

    /// Replace aggregate calls and bare source columns by slots
    fn analyze_aggregates(&mut self, sel: &mut Select) -> AggCode {
        let cursors: Vec<i32> = sel.from.iter().map(|i| i.cursor).collect();
        let mut agg = AggCode::default();
        let mut capture = |e: &mut Expr, nested: bool| -> bool {
            let call = match &*e {
                Expr::Function {
                    name,
                    args,
                    distinct,
                    star,
                } if !nested && is_aggregate_call(name, call_argc(args, *star)) => Some((
                    name.to_ascii_lowercase(),
                    if *star { Vec::new() } else { args.clone() },
                    *distinct,
                )),
                _ => None,
            };
            if let Some((name, args, distinct)) = call {
                let existing = agg
                    .funcs
                    .iter()
                    .position(|f| f.name == name && f.args == args && f.distinct.is_some() == distinct);
                let idx = match existing {
                    Some(i) => i,
                    None => {
                        let collation = args.first().map_or(Collation::Binary, expr_collation);
                        let distinct = if distinct { Some(self.alloc_cursor()) } else { None };
                        let reg = self.alloc_reg(1);
                        agg.funcs.push(AggFuncSlot {
                            name,
                            args,
                            distinct,
                            collation,
                            reg,
                        });
                        agg.funcs.len() - 1
                    }
                };
                *e = Expr::AggFunction(idx);
                return true;
            }
            if !reads_cursor(e, &cursors) {
                return false;
            }
            let idx = match agg.columns.iter().position(|c| c.expr == *e) {
                Some(i) => i,
                None => {
                    let reg = self.alloc_reg(1);
                    agg.columns.push(AggColumnSlot { expr: e.clone(), reg });
                    agg.columns.len() - 1
                }
            };
            let replacement = if nested {
                register_for(e, agg.columns[idx].reg)
            } else {
                Expr::AggColumn(idx)
            };
            *e = replacement;
            true
        };

        let mut exprs: Vec<&mut Expr> = sel
            .columns
            .iter_mut()
            .filter_map(|c| match c {
                ResultColumn::Expr { expr, .. } => Some(expr),
                _ => None,
            })
            .collect();
        exprs.extend(sel.having.iter_mut());
        exprs.extend(sel.order_by.iter_mut().map(|o| &mut o.expr));
        for e in exprs {
            map_preorder(e, false, &mut capture);
        }
        agg
    }

    /// The index order a lone `min(col)`/`max(col)` can be answered from
    fn minmax_term(&self, sel: &Select) -> Option<OrderingTerm> {
        if !self.config.enabled(Optimizations::MINMAX) || sel.from.len() != 1 {
            return None;
        }
        let item = &sel.from[0];
        if item.subquery.is_some() || item.is_recursive_ref {
            return None;
        }
        let mut calls: Vec<&Expr> = Vec::new();
        for e in sel
            .result_exprs()
            .chain(sel.having.iter())
            .chain(sel.order_by.iter().map(|o| &o.expr))
        {
            e.walk(&mut |x| {
                if let Expr::Function { name, args, star, .. } = x {
                    if is_aggregate_call(name, call_argc(args, *star)) {
                        calls.push(x);
                    }
                }
            });
        }
        let first = *calls.first()?;
        if calls.iter().any(|c| *c != first) {
            return None;
        }
        let Expr::Function { name, args, distinct: false, .. } = first else {
            return None;
        };
        let order = if name.eq_ignore_ascii_case("min") {
            SortOrder::Asc
        } else if name.eq_ignore_ascii_case("max") {
            SortOrder::Desc
        } else {
            return None;
        };
        match args.as_slice() {
            [arg @ Expr::Column(c)] if c.cursor == item.cursor => Some(OrderingTerm {
                expr: arg.clone(),
                order,
                nulls: NullsOrder::Default,
            }),
            _ => None,
        }
    }

    // ========================================================================
    // No GROUP BY
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn code_single_group(
        &mut self,
        sel: &Select,
        items: &[WhereItem],
        agg: &AggCode,
        minmax: Option<OrderingTerm>,
        out: &GroupOutput,
        dest: &SelectDest,
        limits: Limits,
        done: Label,
    ) -> Result<()> {
        self.agg_reset(agg);
        let mut opts = WhereOptions::default();
        if let Some(term) = minmax {
            opts.order_by = vec![term];
        }
        let info = self.where_begin(items, sel.where_clause.as_ref(), &opts)?;
        let first_row = !opts.order_by.is_empty() && info.order_satisfied;
        debug!(
            backend = if first_row { "min/max" } else { "single group" },
            funcs = agg.funcs.len(),
            "aggregate select"
        );

        let args: Vec<Vec<Expr>> = agg.funcs.iter().map(|f| f.args.clone()).collect();
        let columns: Vec<Expr> = agg.columns.iter().map(|c| c.expr.clone()).collect();
        let skip_null = if first_row {
            Some(info.continue_label())
        } else {
            None
        };
        self.agg_step(agg, &args, skip_null)?;
        self.agg_update_columns(agg, &columns)?;
        if first_row {
            self.v.goto(info.break_label());
        }
        self.where_end(info)?;

        self.agg_final(agg);
        let after = self.v.make_label();
        self.code_group_output(agg, out, dest, limits, after, done)?;
        self.v.resolve_label(after);
        Ok(())
    }

    // ========================================================================
    // GROUP BY
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn code_groups(
        &mut self,
        sel: &Select,
        items: &[WhereItem],
        agg: &AggCode,
        group_by: &[Expr],
        out: &GroupOutput,
        dest: &SelectDest,
        limits: Limits,
        done: Label,
    ) -> Result<()> {
        let n_group = group_by.len();
        let mut ki = KeyInfo::new(n_group);
        for (i, g) in group_by.iter().enumerate() {
            ki.collations[i] = expr_collation(g);
        }
        let g = GroupRegs {
            ki: Arc::new(ki),
            n_group,
            prev: self.alloc_reg(n_group as i32),
            cur: self.alloc_reg(n_group as i32),
            use_flag: self.alloc_reg(1),
            out_ret: self.alloc_reg(1),
            output_sub: self.v.make_label(),
            reset_ret: self.alloc_reg(1),
            reset_sub: self.v.make_label(),
        };
        let end = self.v.make_label();

        self.v
            .add_op(Opcode::Null, 0, g.prev, g.prev + n_group as i32 - 1);
        self.v.add_jump(Opcode::Gosub, g.reset_ret, g.reset_sub, 0);

        let cursors: Vec<i32> = sel.from.iter().map(|i| i.cursor).collect();
        let inputs = collect_inputs(agg, &cursors);
        let n_inputs = inputs.len();
        let sorter = self.alloc_cursor();
        let sorter_open = self.v.add_op4(
            Opcode::SorterOpen,
            sorter,
            (n_group + n_inputs) as i32,
            0,
            P4::KeyInfo(g.ki.clone()),
        );
        self.v.comment("group by");

        let mut opts = WhereOptions::default();
        if self.config.enabled(Optimizations::GROUPBY_INDEX) {
            opts.order_by = group_by
                .iter()
                .map(|e| OrderingTerm {
                    expr: e.clone(),
                    order: SortOrder::Asc,
                    nulls: NullsOrder::Default,
                })
                .collect();
            opts.group_by = true;
        }
        let info = self.where_begin(items, sel.where_clause.as_ref(), &opts)?;
        let by_index = !opts.order_by.is_empty() && info.order_satisfied;

        if by_index {
            debug!(keys = n_group, "GROUP BY in index order");
            self.v.change_to_noop(sorter_open);
            let args: Vec<Vec<Expr>> = agg.funcs.iter().map(|f| f.args.clone()).collect();
            let columns: Vec<Expr> = agg.columns.iter().map(|c| c.expr.clone()).collect();
            self.expr_code_list(group_by, g.cur)?;
            self.code_group_break(agg, &g, &args, &columns)?;
            self.where_end(info)?;
        } else {
            debug!(keys = n_group, inputs = n_inputs, "GROUP BY through a sorter");
            let width = (n_group + n_inputs) as i32;
            let base = self.alloc_reg(width);
            self.expr_code_list(group_by, base)?;
            self.expr_code_list(&inputs, base + n_group as i32)?;
            let rec = self.alloc_reg(1);
            self.v.add_op(Opcode::MakeRecord, base, width, rec);
            self.v.add_op2(Opcode::SorterInsert, sorter, rec);
            self.where_end(info)?;

            let input_regs = self.alloc_reg(n_inputs as i32);
            let sorted_end = self.v.make_label();
            self.v.add_jump(Opcode::SorterSort, sorter, sorted_end, 0);
            let top = self.v.current_addr();
            for i in 0..width {
                let target = if (i as usize) < n_group {
                    g.cur + i
                } else {
                    input_regs + i - n_group as i32
                };
                self.v.add_op(Opcode::Column, sorter, i, target);
            }
            let mut args: Vec<Vec<Expr>> = agg.funcs.iter().map(|f| f.args.clone()).collect();
            let mut columns: Vec<Expr> = agg.columns.iter().map(|c| c.expr.clone()).collect();
            for e in args.iter_mut().flatten().chain(columns.iter_mut()) {
                bind_inputs(e, &inputs, input_regs);
            }
            self.code_group_break(agg, &g, &args, &columns)?;
            self.v.add_op2(Opcode::SorterNext, sorter, top);
            self.v.resolve_label(sorted_end);
        }

        // the last group
        self.v.add_jump(Opcode::Gosub, g.out_ret, g.output_sub, 0);
        self.v.goto(end);

        self.v.resolve_label(g.output_sub);
        self.v.comment("output one group");
        let ret = self.v.make_label();
        self.v.add_jump(Opcode::IfNot, g.use_flag, ret, 0);
        self.agg_final(agg);
        self.code_group_output(agg, out, dest, limits, ret, done)?;
        self.v.resolve_label(ret);
        self.v.add_op1(Opcode::Return, g.out_ret);

        self.v.resolve_label(g.reset_sub);
        self.v.comment("reset accumulators");
        self.agg_reset(agg);
        self.v.add_op2(Opcode::Integer, 0, g.use_flag);
        self.v.add_op1(Opcode::Return, g.reset_ret);

        self.v.resolve_label(end);
        Ok(())
    }

    /// Compare the current key with the previous one; on a change flush
    /// the finished group and start a new one. Then step the row.
    fn code_group_break(&mut self, agg: &AggCode, g: &GroupRegs, args: &[Vec<Expr>], columns: &[Expr]) -> Result<()> {
        let n = g.n_group as i32;
        let changed = self.v.make_label();
        let same = self.v.make_label();
        self.v
            .add_op4(Opcode::Compare, g.prev, g.cur, n, P4::KeyInfo(g.ki.clone()));
        self.v
            .add_op(Opcode::Jump, changed.value(), same.value(), changed.value());
        self.v.resolve_label(changed);
        self.v.add_op(Opcode::Copy, g.cur, g.prev, n - 1);
        self.v.add_jump(Opcode::Gosub, g.out_ret, g.output_sub, 0);
        self.v.add_jump(Opcode::Gosub, g.reset_ret, g.reset_sub, 0);
        self.v.resolve_label(same);
        self.agg_step(agg, args, None)?;
        self.agg_update_columns(agg, columns)?;
        self.v.add_op2(Opcode::Integer, 1, g.use_flag);
        Ok(())
    }

    // ========================================================================
    // Slot code
    // ========================================================================

    /// Clear every slot and the DISTINCT sets
    fn agg_reset(&mut self, agg: &AggCode) {
        for reg in agg.funcs.iter().map(|f| f.reg).chain(agg.columns.iter().map(|c| c.reg)) {
            self.v.add_op(Opcode::Null, 0, reg, reg);
        }
        for f in &agg.funcs {
            if let Some(cursor) = f.distinct {
                let mut ki = KeyInfo::new(1);
                ki.collations[0] = f.collation;
                self.v
                    .add_op4(Opcode::OpenEphemeral, cursor, 1, 0, P4::KeyInfo(Arc::new(ki)));
            }
        }
    }

    /// Step every aggregate with the current row. With `skip_null`, a NULL
    /// first argument skips the row.
    fn agg_step(&mut self, agg: &AggCode, args: &[Vec<Expr>], skip_null: Option<Label>) -> Result<()> {
        for (f, args) in agg.funcs.iter().zip(args) {
            let argc = args.len();
            let base = self.alloc_reg(argc.max(1) as i32);
            self.expr_code_list(args, base)?;
            if let Some(l) = skip_null {
                self.v.add_jump(Opcode::IsNull, base, l, 0);
            }
            let skip = self.v.make_label();
            if let Some(cursor) = f.distinct {
                self.code_distinct(cursor, base, 1, skip);
            }
            self.v
                .add_op4(Opcode::AggStep, f.collation.code(), base, f.reg, P4::Func(f.name.clone()));
            self.v.change_p5(argc as u16);
            self.v.resolve_label(skip);
        }
        Ok(())
    }

    fn agg_update_columns(&mut self, agg: &AggCode, columns: &[Expr]) -> Result<()> {
        for (slot, e) in agg.columns.iter().zip(columns) {
            self.expr_code(e, slot.reg)?;
        }
        Ok(())
    }

    fn agg_final(&mut self, agg: &AggCode) {
        for f in &agg.funcs {
            self.v
                .add_op4(Opcode::AggFinal, f.reg, f.args.len() as i32, 0, P4::Func(f.name.clone()));
        }
    }

    /// HAVING, then the result row of the group
    #[allow(clippy::too_many_arguments)]
    fn code_group_output(
        &mut self,
        agg: &AggCode,
        out: &GroupOutput,
        dest: &SelectDest,
        limits: Limits,
        cont: Label,
        done: Label,
    ) -> Result<()> {
        let saved = self.agg.replace(agg.clone());
        let r = (|| -> Result<()> {
            if let Some(h) = &out.having {
                self.expr_if_false(h, cont, true)?;
            }
            let sink = RowSink {
                dest,
                limits,
                distinct: out.distinct,
                sorter: out.sorter.as_ref(),
                done,
            };
            self.emit_row(&out.results, &sink, cont)
        })();
        self.agg = saved;
        r
    }
}

/// Source columns the sorter must carry for the aggregate arguments and
/// the column slots
fn collect_inputs(agg: &AggCode, cursors: &[i32]) -> Vec<Expr> {
    let mut inputs: Vec<Expr> = Vec::new();
    let mut exprs: Vec<Expr> = agg
        .funcs
        .iter()
        .flat_map(|f| f.args.iter().cloned())
        .chain(agg.columns.iter().map(|c| c.expr.clone()))
        .collect();
    for e in exprs.iter_mut() {
        map_preorder(e, false, &mut |x, _| {
            if !reads_cursor(x, cursors) {
                return false;
            }
            if !inputs.contains(x) {
                inputs.push(x.clone());
            }
            true
        });
    }
    inputs
}

/// Read the sorter inputs of `e` from `base..`
fn bind_inputs(e: &mut Expr, inputs: &[Expr], base: i32) {
    map_preorder(e, false, &mut |x, _| match inputs.iter().position(|i| i == x) {
        Some(k) => {
            let r = register_for(x, base + k as i32);
            *x = r;
            true
        }
        None => false,
    });
}
