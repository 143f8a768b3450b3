//! Compound selects
//!
//! Without ORDER BY, UNION ALL runs its terms one after the other, UNION
//! and EXCEPT collect rows in a transient index and INTERSECT fills two
//! indexes and scans one probing the other.
//!
//! With ORDER BY both sides run as coroutines, each ordered on the same
//! key, and their rows are merged. For every operator but UNION ALL the
//! key covers all columns, so equal keys mean equal rows and duplicates
//! are dropped by comparing with the row last returned.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::expr_collation;
use crate::executor::Parse;
use crate::parser::ast::{CompoundOp, Expr, NullsOrder, OrderingTerm, Select, SortOrder};
use crate::vdbe::value::Collation;
use crate::vdbe::{KeyInfo, Label, Opcode, P4};

use super::{Limits, SelectDest};

/// One input of a merge
struct MergeSide {
    /// Coroutine register
    reg: i32,
    /// Row registers
    base: i32,
    /// Merge key, copied out of the row after every yield
    keys: i32,
    /// Return address of the output subroutine
    out_ret: i32,
    output: Label,
}

/// Collation of each result column: the first explicit or column
/// collation found, scanning the terms from the left
fn compound_collations(sel: &Select) -> Vec<Collation> {
    let n = sel.column_count();
    let terms: Vec<&Select> = sel.terms().collect();
    (0..n)
        .map(|i| {
            terms
                .iter()
                .rev()
                .filter_map(|t| t.result_exprs().nth(i))
                .map(expr_collation)
                .find(|c| *c != Collation::Binary)
                .unwrap_or(Collation::Binary)
        })
        .collect()
}

fn key_info(collations: &[Collation]) -> KeyInfo {
    let mut ki = KeyInfo::new(collations.len());
    ki.collations = collations.to_vec();
    ki
}

/// Detach the right-hand term from its prior
fn split_term(mut sel: Select) -> Result<(Select, Select)> {
    let prior = sel
        .prior
        .take()
        .ok_or_else(|| Error::with_message(ErrorCode::Internal, "compound term without a prior"))?;
    sel.op = CompoundOp::Single;
    Ok((*prior, sel))
}

impl<'a> Parse<'a> {
    pub(super) fn code_compound(&mut self, mut sel: Select, dest: SelectDest) -> Result<()> {
        if !sel.order_by.is_empty() {
            return self.code_compound_merge(sel, dest);
        }
        let done = self.v.make_label();
        let limits = self.code_limits(&sel, done)?;
        sel.limit = None;
        sel.offset = None;
        let n = sel.column_count();
        let collations = compound_collations(&sel);

        match sel.op {
            CompoundOp::UnionAll => {
                let mut terms = Vec::new();
                let mut cur = sel;
                while cur.op == CompoundOp::UnionAll {
                    let (prior, term) = split_term(cur)?;
                    terms.push(term);
                    cur = prior;
                }
                terms.push(cur);
                terms.reverse();
                let buffered = limits != Limits::default() || dest.first_row_only();
                debug!(terms = terms.len(), buffered, "compound UNION ALL");
                if buffered {
                    let t = self.alloc_cursor();
                    self.v.add_op2(Opcode::OpenEphemeral, t, n as i32);
                    for term in &terms {
                        self.code_select(term, SelectDest::EphemTable { cursor: t })?;
                    }
                    self.scan_rows(t, n, None, &dest, limits, done)?;
                } else {
                    for term in &terms {
                        self.code_select(term, dest.clone())?;
                    }
                }
            }
            CompoundOp::Union | CompoundOp::Except => {
                let op = sel.op;
                debug!(op = op.name(), "compound through a transient index");
                let (prior, right) = split_term(sel)?;
                let u = self.alloc_cursor();
                self.v
                    .add_op4(Opcode::OpenEphemeral, u, n as i32, 0, P4::KeyInfo(Arc::new(key_info(&collations))));
                self.code_select(&prior, SelectDest::Union { cursor: u })?;
                let right_dest = if op == CompoundOp::Union {
                    SelectDest::Union { cursor: u }
                } else {
                    SelectDest::Except { cursor: u }
                };
                self.code_select(&right, right_dest)?;
                self.scan_rows(u, n, None, &dest, limits, done)?;
            }
            CompoundOp::Intersect => {
                debug!("compound INTERSECT through two transient indexes");
                let (prior, right) = split_term(sel)?;
                let ki = Arc::new(key_info(&collations));
                let u1 = self.alloc_cursor();
                self.v
                    .add_op4(Opcode::OpenEphemeral, u1, n as i32, 0, P4::KeyInfo(ki.clone()));
                self.code_select(&prior, SelectDest::Union { cursor: u1 })?;
                let u2 = self.alloc_cursor();
                self.v
                    .add_op4(Opcode::OpenEphemeral, u2, n as i32, 0, P4::KeyInfo(ki));
                self.code_select(&right, SelectDest::Union { cursor: u2 })?;
                self.scan_rows(u1, n, Some(u2), &dest, limits, done)?;
            }
            CompoundOp::Single => {
                return Err(Error::with_message(ErrorCode::Internal, "compound without an operator"));
            }
        }
        self.v.resolve_label(done);
        Ok(())
    }

    /// Dispose of every row of `cursor`; with `probe`, only rows also
    /// present there
    fn scan_rows(
        &mut self,
        cursor: i32,
        n: usize,
        probe: Option<i32>,
        dest: &SelectDest,
        limits: Limits,
        done: Label,
    ) -> Result<()> {
        let regs = self.alloc_reg(n as i32);
        self.v.add_jump(Opcode::Rewind, cursor, done, 0);
        let top = self.v.current_addr();
        let cont = self.v.make_label();
        for i in 0..n as i32 {
            self.v.add_op(Opcode::Column, cursor, i, regs + i);
        }
        if let Some(other) = probe {
            self.v
                .add_op4(Opcode::NotFound, other, cont.value(), regs, P4::Int64(n as i64));
        }
        self.dispose_row(dest, regs, n, limits, cont, done)?;
        self.v.resolve_label(cont);
        self.v.add_op2(Opcode::Next, cursor, top);
        Ok(())
    }

    // ========================================================================
    // ORDER BY: merge of two coroutines
    // ========================================================================

    fn code_compound_merge(&mut self, sel: Select, dest: SelectDest) -> Result<()> {
        let op = sel.op;
        let n = sel.column_count();
        let collations = compound_collations(&sel);

        // (column, descending) per key; every column joins the key unless
        // duplicates are kept
        let mut keys: Vec<(usize, bool)> = Vec::with_capacity(n);
        for term in &sel.order_by {
            match term.expr {
                Expr::Integer(k) if k >= 1 && (k as usize) <= n => {
                    if !keys.iter().any(|(c, _)| *c == k as usize - 1) {
                        keys.push((k as usize - 1, term.is_desc()));
                    }
                }
                _ => {
                    return Err(Error::with_message(
                        ErrorCode::Internal,
                        "compound ORDER BY term is not a column number",
                    ))
                }
            }
        }
        if op != CompoundOp::UnionAll {
            for i in 0..n {
                if !keys.iter().any(|(c, _)| *c == i) {
                    keys.push((i, false));
                }
            }
        }
        debug!(op = op.name(), keys = keys.len(), "compound merged in ORDER BY order");

        let done = self.v.make_label();
        let limits = self.code_limits(&sel, done)?;

        let (mut left, mut right) = split_term(sel)?;
        right.order_by.clear();
        right.limit = None;
        right.offset = None;
        left.order_by = side_order(&left, &keys);
        right.order_by = side_order(&right, &keys);

        let mut merge_ki = KeyInfo::new(keys.len());
        for (i, (c, desc)) in keys.iter().enumerate() {
            merge_ki.collations[i] = collations[*c];
            merge_ki.sort_orders[i] = *desc;
        }
        let merge_ki = Arc::new(merge_ki);
        let dedupe = op != CompoundOp::UnionAll;

        let a = self.merge_side(&left, n, keys.len())?;
        let b = self.merge_side(&right, n, keys.len())?;

        // Last row returned, for dropping duplicates
        let prev = self.alloc_reg(n as i32);
        let has_prev = self.alloc_reg(1);
        if dedupe {
            self.v.add_op2(Opcode::Integer, 0, has_prev);
        }

        let compare = self.v.make_label();
        let eof_a = self.v.make_label();
        let eof_a_no_b = self.v.make_label();
        let eof_b = self.v.make_label();
        let a_lt_b = self.v.make_label();
        let a_eq_b = self.v.make_label();
        let a_gt_b = self.v.make_label();
        let drain_a = self.v.make_label();
        let drain_b = self.v.make_label();

        self.merge_yield(&a, &keys, eof_a_no_b);
        self.merge_yield(&b, &keys, eof_b);

        self.v.resolve_label(compare);
        self.v.add_op4(
            Opcode::Compare,
            a.keys,
            b.keys,
            keys.len() as i32,
            P4::KeyInfo(merge_ki),
        );
        self.v
            .add_op(Opcode::Jump, a_lt_b.value(), a_eq_b.value(), a_gt_b.value());

        // A < B
        self.v.resolve_label(a_lt_b);
        if op != CompoundOp::Intersect {
            self.v.add_jump(Opcode::Gosub, a.out_ret, a.output, 0);
        }
        self.merge_yield(&a, &keys, eof_a);
        self.v.goto(compare);

        // A == B
        self.v.resolve_label(a_eq_b);
        if matches!(op, CompoundOp::UnionAll | CompoundOp::Intersect) {
            self.v.add_jump(Opcode::Gosub, a.out_ret, a.output, 0);
        }
        self.merge_yield(&a, &keys, eof_a);
        self.v.goto(compare);

        // A > B
        self.v.resolve_label(a_gt_b);
        if matches!(op, CompoundOp::UnionAll | CompoundOp::Union) {
            self.v.add_jump(Opcode::Gosub, b.out_ret, b.output, 0);
        }
        self.merge_yield(&b, &keys, eof_b);
        self.v.goto(compare);

        // A ran out
        let keep_b = matches!(op, CompoundOp::UnionAll | CompoundOp::Union);
        self.v.resolve_label(eof_a_no_b);
        if keep_b {
            self.merge_yield(&b, &keys, done);
        } else {
            self.v.goto(done);
        }
        self.v.resolve_label(eof_a);
        if keep_b {
            self.v.resolve_label(drain_b);
            self.v.add_jump(Opcode::Gosub, b.out_ret, b.output, 0);
            self.merge_yield(&b, &keys, done);
            self.v.goto(drain_b);
        } else {
            self.v.goto(done);
        }

        // B ran out
        self.v.resolve_label(eof_b);
        if op != CompoundOp::Intersect {
            self.v.resolve_label(drain_a);
            self.v.add_jump(Opcode::Gosub, a.out_ret, a.output, 0);
            self.merge_yield(&a, &keys, done);
            self.v.goto(drain_a);
        } else {
            self.v.goto(done);
        }

        let eq_ki = Arc::new(key_info(&collations));
        for side in [&a, &b] {
            self.v.resolve_label(side.output);
            let ret = self.v.make_label();
            if dedupe {
                let emit = self.v.make_label();
                self.v.add_jump(Opcode::IfNot, has_prev, emit, 0);
                self.v
                    .add_op4(Opcode::Compare, prev, side.base, n as i32, P4::KeyInfo(eq_ki.clone()));
                self.v
                    .add_op(Opcode::Jump, emit.value(), ret.value(), emit.value());
                self.v.resolve_label(emit);
                self.v.add_op(Opcode::Copy, side.base, prev, n as i32 - 1);
                self.v.add_op2(Opcode::Integer, 1, has_prev);
            }
            self.dispose_row(&dest, side.base, n, limits, ret, done)?;
            self.v.resolve_label(ret);
            self.v.add_op1(Opcode::Return, side.out_ret);
        }

        self.v.resolve_label(done);
        Ok(())
    }

    /// Set up `term` as a coroutine yielding rows into fresh registers
    fn merge_side(&mut self, term: &Select, n: usize, n_keys: usize) -> Result<MergeSide> {
        let reg = self.alloc_reg(1);
        let base = self.alloc_reg(n as i32);
        let keys = self.alloc_reg(n_keys as i32);
        let out_ret = self.alloc_reg(1);
        let after = self.v.make_label();
        let start = self.v.current_addr() + 1;
        self.v.add_jump(Opcode::InitCoroutine, reg, after, start);
        self.code_select(term, SelectDest::Coroutine { reg, base })?;
        self.v.add_op1(Opcode::EndCoroutine, reg);
        self.v.resolve_label(after);
        Ok(MergeSide {
            reg,
            base,
            keys,
            out_ret,
            output: self.v.make_label(),
        })
    }

    /// Resume a side; at its end go to `eof`, else refresh its key
    fn merge_yield(&mut self, side: &MergeSide, keys: &[(usize, bool)], eof: Label) {
        self.v.add_jump(Opcode::Yield, side.reg, eof, 0);
        for (i, (c, _)) in keys.iter().enumerate() {
            self.v
                .add_op2(Opcode::SCopy, side.base + *c as i32, side.keys + i as i32);
        }
    }
}

/// ORDER BY making one side deliver rows in merge-key order
fn side_order(term: &Select, keys: &[(usize, bool)]) -> Vec<OrderingTerm> {
    keys.iter()
        .filter_map(|(c, desc)| {
            let expr = if term.is_compound() {
                Expr::Integer(*c as i64 + 1)
            } else {
                term.result_exprs().nth(*c)?.clone()
            };
            Some(OrderingTerm {
                expr,
                order: if *desc { SortOrder::Desc } else { SortOrder::Asc },
                nulls: NullsOrder::Default,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::tests::{compile, db_with};
    use crate::api::config::DbConfig;
    use crate::vdbe::{Opcode, Program};

    fn count(program: &Program, opcode: Opcode) -> usize {
        program.ops.iter().filter(|op| op.opcode == opcode).count()
    }

    #[test]
    fn test_intersect_order_by_merges() {
        let db = db_with("CREATE TABLE x(a); CREATE TABLE y(b);");
        let (program, names) = compile(
            &db,
            &DbConfig::default(),
            "SELECT a FROM x INTERSECT SELECT b FROM y ORDER BY 1",
        )
        .unwrap();
        assert_eq!(names, vec!["a"]);
        assert_eq!(count(&program, Opcode::InitCoroutine), 2);
        assert!(count(&program, Opcode::Compare) >= 2);
    }

    #[test]
    fn test_union_uses_transient_index() {
        let db = db_with("CREATE TABLE x(a); CREATE TABLE y(b);");
        let (program, _) = compile(&db, &DbConfig::default(), "SELECT a FROM x UNION SELECT b FROM y").unwrap();
        assert_eq!(count(&program, Opcode::InitCoroutine), 0);
        assert_eq!(count(&program, Opcode::IdxInsert), 2);
    }

    #[test]
    fn test_except_deletes() {
        let db = db_with("CREATE TABLE x(a); CREATE TABLE y(b);");
        let (program, _) = compile(&db, &DbConfig::default(), "SELECT a FROM x EXCEPT SELECT b FROM y").unwrap();
        assert_eq!(count(&program, Opcode::IdxDelete), 1);
    }

    #[test]
    fn test_intersect_probes_second_index() {
        let db = db_with("CREATE TABLE x(a); CREATE TABLE y(b);");
        let (program, _) = compile(&db, &DbConfig::default(), "SELECT a FROM x INTERSECT SELECT b FROM y").unwrap();
        assert_eq!(count(&program, Opcode::NotFound), 1);
    }

    #[test]
    fn test_union_all_with_limit_buffers() {
        let db = db_with("CREATE TABLE x(a); CREATE TABLE y(b);");
        let (program, _) = compile(
            &db,
            &DbConfig::default(),
            "SELECT a FROM x UNION ALL SELECT b FROM y LIMIT 3",
        )
        .unwrap();
        assert_eq!(count(&program, Opcode::ResultRow), 1);
        assert_eq!(count(&program, Opcode::DecrJumpZero), 1);
    }

    #[test]
    fn test_values_rows_run_in_sequence() {
        let db = db_with("CREATE TABLE x(a);");
        let (program, _) = compile(&db, &DbConfig::default(), "VALUES (1), (2), (3)").unwrap();
        assert_eq!(count(&program, Opcode::ResultRow), 3);
    }
}
