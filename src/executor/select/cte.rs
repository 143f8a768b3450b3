//! Recursive common table expressions
//!
//! The body of a recursive CTE is a setup select followed by one or more
//! recursive terms joined with UNION or UNION ALL. The setup fills a
//! queue. Then, until the queue is empty, the oldest row is taken off it,
//! returned, and made the single row of the CTE seen by the recursive
//! terms, whose results are appended to the queue. With UNION, a row that
//! was queued once is never queued again.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::expr_collation;
use crate::executor::{CursorSource, Parse};
use crate::parser::ast::{CompoundOp, Select, SelectFlags};
use crate::vdbe::{KeyInfo, Opcode, P4};

use super::expand::{synth_table, term_references};
use super::SelectDest;

fn detach(mut sel: Select) -> Result<(Select, Select)> {
    let prior = sel
        .prior
        .take()
        .ok_or_else(|| Error::with_message(ErrorCode::Internal, "recursive term without a prior"))?;
    sel.op = CompoundOp::Single;
    Ok((*prior, sel))
}

impl<'a> Parse<'a> {
    /// Prepare the body of recursive CTE `idx`: the setup first, then the
    /// recursive terms with the CTE name bound to the current queue row
    pub(super) fn prepare_recursive_cte(&mut self, idx: usize, body: &mut Select) -> Result<()> {
        let name = self.ctes[idx].cte.name.clone();
        let columns = self.ctes[idx].cte.columns.clone();
        if !body.order_by.is_empty() {
            return Err(Error::sql(format!(
                "ORDER BY in the recursive query {} is not supported",
                name
            )));
        }

        let mut recursive: Vec<(CompoundOp, Select)> = Vec::new();
        let mut setup = std::mem::take(body);
        while term_references(&setup, &name) {
            let op = setup.op;
            if !matches!(op, CompoundOp::Union | CompoundOp::UnionAll) {
                return Err(Error::sql(format!("circular reference: {}", name)));
            }
            let (prior, term) = detach(setup)?;
            recursive.push((op, term));
            setup = prior;
        }
        if setup.terms().any(|t| term_references(t, &name)) {
            return Err(Error::sql(format!("circular reference: {}", name)));
        }

        self.prepare_select(&mut setup)?;
        let table = synth_table(&name, &setup, &columns)?;
        let cursor = self.alloc_cursor();
        self.ctes[idx].recursive_ref = Some((cursor, table));

        for (_, term) in recursive.iter_mut() {
            self.prepare_select(term)?;
            if term.flags.contains(SelectFlags::AGGREGATE) {
                return Err(Error::sql("recursive aggregate queries not supported"));
            }
            if term.column_count() != setup.column_count() {
                return Err(Error::sql(
                    "SELECTs to the left and right of UNION do not have the same number of result columns",
                ));
            }
        }

        let names = setup.names.clone();
        let mut whole = setup;
        for (op, mut term) in recursive.into_iter().rev() {
            term.op = op;
            term.prior = Some(Box::new(whole));
            whole = term;
        }
        whole.names = names;
        whole.flags |= SelectFlags::RECURSIVE | SelectFlags::RESOLVED;
        *body = whole;
        Ok(())
    }

    /// Run a recursive CTE body into `dest`
    pub(super) fn code_recursive(&mut self, mut sel: Select, dest: SelectDest) -> Result<()> {
        let n = sel.column_count();
        let done = self.v.make_label();
        let limits = self.code_limits(&sel, done)?;
        sel.limit = None;
        sel.offset = None;
        sel.flags.remove(SelectFlags::RECURSIVE);

        let mut recursive = Vec::new();
        let mut distinct = false;
        let mut setup = sel;
        while setup.from.iter().any(|i| i.is_recursive_ref) {
            distinct |= setup.op == CompoundOp::Union;
            let (prior, term) = detach(setup)?;
            recursive.push(term);
            setup = prior;
        }
        recursive.reverse();
        let current = recursive
            .iter()
            .flat_map(|t| t.from.iter())
            .find(|i| i.is_recursive_ref)
            .map(|i| i.cursor)
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, "recursive CTE without a recursive term"))?;
        debug!(terms = recursive.len(), distinct, "recursive CTE through a queue");

        let queue = self.alloc_cursor();
        self.v.add_op2(Opcode::OpenEphemeral, queue, n as i32);
        self.v.comment("queue");
        let seen = if distinct {
            let cursor = self.alloc_cursor();
            let mut ki = KeyInfo::new(n);
            for (i, e) in setup.terms().last().unwrap_or(&setup).result_exprs().enumerate() {
                ki.collations[i] = expr_collation(e);
            }
            self.v
                .add_op4(Opcode::OpenEphemeral, cursor, n as i32, 0, P4::KeyInfo(Arc::new(ki)));
            Some(cursor)
        } else {
            None
        };
        let queue_dest = SelectDest::Queue {
            cursor: queue,
            distinct: seen,
        };
        self.code_select(&setup, queue_dest.clone())?;

        let row = self.alloc_reg(1);
        let regs = self.alloc_reg(n as i32);
        let top = self.v.current_addr();
        self.v.add_jump(Opcode::Rewind, queue, done, 0);
        self.v.add_op2(Opcode::RowData, queue, row);
        self.v.add_op1(Opcode::Delete, queue);
        self.v.add_op(Opcode::OpenPseudo, current, row, n as i32);
        self.sources.insert(current, CursorSource::Ephemeral);
        for i in 0..n as i32 {
            self.v.add_op(Opcode::Column, current, i, regs + i);
        }
        let returned = self.v.make_label();
        self.dispose_row(&dest, regs, n, limits, returned, done)?;
        self.v.resolve_label(returned);
        for term in &recursive {
            self.code_select(term, queue_dest.clone())?;
        }
        self.v.add_op2(Opcode::Goto, 0, top);
        self.v.resolve_label(done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{compile, db_with};
    use crate::api::config::DbConfig;
    use crate::vdbe::Opcode;

    fn error(sql: &str) -> String {
        let db = db_with("CREATE TABLE t(a);");
        compile(&db, &DbConfig::default(), sql).unwrap_err().to_string()
    }

    #[test]
    fn test_counting_cte_uses_queue() {
        let db = db_with("CREATE TABLE t(a);");
        let (program, names) = compile(
            &db,
            &DbConfig::default(),
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 5) SELECT x FROM c",
        )
        .unwrap();
        assert_eq!(names, vec!["x"]);
        assert!(program.ops.iter().any(|o| o.opcode == Opcode::OpenPseudo));
        assert!(program.ops.iter().any(|o| o.opcode == Opcode::RowData));
    }

    #[test]
    fn test_union_queue_drops_repeats() {
        let db = db_with("CREATE TABLE t(a);");
        let (program, _) = compile(
            &db,
            &DbConfig::default(),
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION SELECT x FROM c) SELECT x FROM c",
        )
        .unwrap();
        assert!(program.ops.iter().any(|o| o.opcode == Opcode::Found));
    }

    #[test]
    fn test_no_setup_is_circular() {
        assert_eq!(
            error("WITH RECURSIVE c(x) AS (SELECT x FROM c) SELECT x FROM c"),
            "circular reference: c"
        );
    }

    #[test]
    fn test_recursive_aggregate_refused() {
        assert_eq!(
            error("WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT max(x) FROM c) SELECT x FROM c"),
            "recursive aggregate queries not supported"
        );
    }

    #[test]
    fn test_plain_with_is_not_recursive() {
        let db = db_with("CREATE TABLE t(a);");
        let (program, _) = compile(&db, &DbConfig::default(), "WITH c(x) AS (SELECT a FROM t) SELECT x FROM c").unwrap();
        assert!(!program.ops.iter().any(|o| o.opcode == Opcode::OpenPseudo));
    }
}
