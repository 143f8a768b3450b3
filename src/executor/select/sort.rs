//! ORDER BY through a sorter
//!
//! Each sorter entry is the sort key followed by the result row. A NULLS
//! FIRST/LAST that differs from the default for its direction adds a hidden
//! `expr IS NULL` key column ahead of the term.

use std::sync::Arc;

use crate::error::Result;
use crate::executor::expr::expr_collation;
use crate::executor::Parse;
use crate::parser::ast::{Expr, NullsOrder, OrderingTerm};
use crate::vdbe::value::Collation;
use crate::vdbe::{KeyInfo, Label, Opcode, P4};

use super::{Limits, SelectDest};

#[derive(Debug, Clone)]
enum SortKey {
    Value(Expr),
    /// 1 when the expression is NULL
    NullFlag(Expr),
}

/// An open ORDER BY sorter
#[derive(Debug, Clone)]
pub(super) struct SortCtx {
    pub cursor: i32,
    /// The SorterOpen, so it can be dropped when the loop is already ordered
    pub open_addr: i32,
    keys: Vec<SortKey>,
}

impl SortCtx {
    fn n_key(&self) -> usize {
        self.keys.len()
    }
}

impl<'a> Parse<'a> {
    pub(super) fn sort_open(&mut self, order_by: &[OrderingTerm], n_result: usize) -> SortCtx {
        let mut keys = Vec::with_capacity(order_by.len());
        let mut ki = KeyInfo::new(0);
        for term in order_by {
            let desc = term.is_desc();
            let null_flag = match (term.nulls, desc) {
                (NullsOrder::Last, false) => Some(false),
                (NullsOrder::First, true) => Some(true),
                _ => None,
            };
            if let Some(flag_desc) = null_flag {
                keys.push(SortKey::NullFlag(term.expr.clone()));
                ki.collations.push(Collation::Binary);
                ki.sort_orders.push(flag_desc);
            }
            keys.push(SortKey::Value(term.expr.clone()));
            ki.collations.push(expr_collation(&term.expr));
            ki.sort_orders.push(desc);
        }
        ki.n_key_field = keys.len();
        let cursor = self.alloc_cursor();
        let open_addr = self.v.add_op4(
            Opcode::SorterOpen,
            cursor,
            (keys.len() + n_result) as i32,
            0,
            P4::KeyInfo(Arc::new(ki)),
        );
        self.v.comment("order by");
        SortCtx {
            cursor,
            open_addr,
            keys,
        }
    }

    /// Push the row in `base..` (the values of `results`) into the sorter
    pub(super) fn sort_push(&mut self, s: &SortCtx, results: &[Expr], base: i32) -> Result<()> {
        let n = results.len();
        let n_key = s.n_key();
        let start = self.alloc_reg((n_key + n) as i32);
        for (i, key) in s.keys.iter().enumerate() {
            let target = start + i as i32;
            match key {
                SortKey::Value(e) => match results.iter().position(|r| r == e) {
                    Some(j) => {
                        self.v.add_op2(Opcode::SCopy, base + j as i32, target);
                    }
                    None => self.expr_code(e, target)?,
                },
                SortKey::NullFlag(e) => self.expr_code(&Expr::IsNull(Box::new(e.clone())), target)?,
            }
        }
        if n > 0 {
            self.v
                .add_op(Opcode::Copy, base, start + n_key as i32, n as i32 - 1);
        }
        let rec = self.alloc_reg(1);
        self.v
            .add_op(Opcode::MakeRecord, start, (n_key + n) as i32, rec);
        self.v.add_op2(Opcode::SorterInsert, s.cursor, rec);
        Ok(())
    }

    /// After the loop: read the sorted rows back and dispose of them
    pub(super) fn sort_output(
        &mut self,
        s: &SortCtx,
        n: usize,
        dest: &SelectDest,
        limits: Limits,
        done: Label,
    ) -> Result<()> {
        let out = self.alloc_reg(n as i32);
        self.v.add_jump(Opcode::SorterSort, s.cursor, done, 0);
        let top = self.v.current_addr();
        let cont = self.v.make_label();
        for i in 0..n {
            self.v
                .add_op(Opcode::Column, s.cursor, (s.n_key() + i) as i32, out + i as i32);
        }
        self.dispose_row(dest, out, n, limits, cont, done)?;
        self.v.resolve_label(cont);
        self.v.add_op2(Opcode::SorterNext, s.cursor, top);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DbConfig;
    use crate::parser::ast::SortOrder;
    use crate::schema::Schema;

    fn term(order: SortOrder, nulls: NullsOrder) -> OrderingTerm {
        OrderingTerm {
            expr: Expr::Integer(1),
            order,
            nulls,
        }
    }

    #[test]
    fn test_default_nulls_add_no_key() {
        let schema = Schema::new();
        let config = DbConfig::default();
        let mut p = Parse::new(&schema, &config);
        let s = p.sort_open(&[term(SortOrder::Asc, NullsOrder::First), term(SortOrder::Desc, NullsOrder::Last)], 1);
        assert_eq!(s.n_key(), 2);
    }

    #[test]
    fn test_nulls_last_adds_flag_key() {
        let schema = Schema::new();
        let config = DbConfig::default();
        let mut p = Parse::new(&schema, &config);
        let s = p.sort_open(&[term(SortOrder::Asc, NullsOrder::Last)], 1);
        assert_eq!(s.n_key(), 2);
        match &p.v.op_at(s.open_addr).unwrap().p4 {
            P4::KeyInfo(ki) => assert_eq!(ki.sort_orders, vec![false, false]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
