//! Query rewrites on FROM-clause subqueries
//!
//! - LEFT JOIN reduction: a LEFT JOIN becomes an inner join when a WHERE
//!   term can never be true for its null row.
//! - Flattening: a simple subquery in FROM is replaced by its own FROM
//!   items, its WHERE is merged and references to its columns are
//!   replaced by its result expressions. On the right of a LEFT JOIN a
//!   result expression that is not a plain column is wrapped in
//!   `IfNullRow` so it turns NULL together with the null row.
//! - Push-down: a WHERE term that reads only one unflattened subquery is
//!   copied into that subquery's WHERE.

use tracing::debug;

use crate::api::config::Optimizations;
use crate::error::Result;
use crate::executor::where_clause::referenced_cursors;
use crate::executor::Parse;
use crate::parser::ast::{BinaryOp, Expr, JoinType, ResultColumn, Select, SelectFlags};

/// Apply `f` (post-order) to every expression of every term of `sel`,
/// descending into FROM-clause and expression subqueries
pub(crate) fn transform_select_exprs(sel: &mut Select, f: &mut dyn FnMut(&mut Expr)) {
    for_each_select_expr(sel, &mut |e| transform_deep(e, &mut *f));
}

/// Apply `f` to the top-level expressions of every term of `sel` and of
/// its FROM-clause subqueries
pub(crate) fn for_each_select_expr(sel: &mut Select, f: &mut dyn FnMut(&mut Expr)) {
    let mut cur = Some(sel);
    while let Some(term) = cur {
        for item in term.from.iter_mut() {
            if let Some(sub) = item.subquery.as_deref_mut() {
                for_each_select_expr(sub, f);
            }
            if let Some(on) = item.on.as_mut() {
                f(on);
            }
        }
        for col in term.columns.iter_mut() {
            if let ResultColumn::Expr { expr, .. } = col {
                f(expr);
            }
        }
        for e in term
            .where_clause
            .iter_mut()
            .chain(term.having.iter_mut())
            .chain(term.group_by.iter_mut())
            .chain(term.order_by.iter_mut().map(|o| &mut o.expr))
            .chain(term.limit.iter_mut())
            .chain(term.offset.iter_mut())
        {
            f(e);
        }
        cur = term.prior.as_deref_mut();
    }
}

/// `Expr::transform` that also enters subqueries
pub(crate) fn transform_deep(e: &mut Expr, f: &mut dyn FnMut(&mut Expr)) {
    e.transform(&mut |x| {
        match x {
            Expr::Subquery(s) | Expr::Exists(s) | Expr::InSelect { select: s, .. } => {
                transform_select_exprs(s, &mut *f)
            }
            _ => {}
        }
        f(x)
    });
}

/// `e` is a bare column of `cursor`
fn is_column_of(e: &Expr, cursor: i32) -> bool {
    matches!(e.skip_wrappers(), Expr::Column(c) if c.cursor == cursor)
}

/// Whether `term` is false or NULL whenever the columns of `cursor` are NULL
fn rejects_null(term: &Expr, cursor: i32) -> bool {
    match term {
        Expr::Binary(op, l, r) if op.is_comparison() && !matches!(op, BinaryOp::Is | BinaryOp::IsNot) => {
            is_column_of(l, cursor) || is_column_of(r, cursor)
        }
        Expr::NotNull(e) | Expr::Like { expr: e, .. } | Expr::InList { expr: e, .. } => is_column_of(e, cursor),
        Expr::Between { expr, .. } => is_column_of(expr, cursor),
        _ => false,
    }
}

/// Functions whose result may differ between two calls
fn is_volatile(e: &Expr) -> bool {
    e.any(&mut |x| {
        matches!(x, Expr::Function { name, .. }
            if name.eq_ignore_ascii_case("random") || name.eq_ignore_ascii_case("randomblob"))
    })
}

impl<'a> Parse<'a> {
    /// Run the rewrites of a simple select, in order
    pub(super) fn rewrite_select(&mut self, sel: &mut Select) -> Result<()> {
        if self.config.enabled(Optimizations::LEFT_JOIN_REDUCE) {
            reduce_left_joins(sel);
        }
        if self.config.enabled(Optimizations::QUERY_FLATTENER) {
            let mut i = 0;
            while i < sel.from.len() {
                if !self.flatten_subquery(sel, i) {
                    i += 1;
                }
            }
        }
        if self.config.enabled(Optimizations::PROPAGATE_CONST) {
            self.propagate_constants(sel);
        }
        if self.config.enabled(Optimizations::PUSH_DOWN) {
            push_down(sel);
        }
        if self.config.enabled(Optimizations::HAVING_TO_WHERE) {
            self.having_to_where(sel);
        }
        Ok(())
    }

    /// Flatten FROM item `i` into `sel` if it is a subquery that allows it
    fn flatten_subquery(&mut self, sel: &mut Select, i: usize) -> bool {
        match flatten_refusal(sel, i) {
            Some(None) => {}
            Some(Some(reason)) => {
                debug!(cursor = sel.from[i].cursor, reason, "flatten refused");
                return false;
            }
            None => return false,
        }
        let mut item = sel.from.remove(i);
        let Some(sub) = item.subquery.take() else { return false };
        let mut sub = *sub;
        let old = item.cursor;
        let left = item.join.is_left();
        let inner = sub.from.first().map_or(-1, |f| f.cursor);

        let replacement: Vec<Expr> = sub
            .result_exprs()
            .map(|e| {
                if left && !is_column_of(e, inner) {
                    Expr::IfNullRow {
                        cursor: inner,
                        expr: Box::new(e.clone()),
                    }
                } else {
                    e.clone()
                }
            })
            .collect();

        transform_select_exprs(sel, &mut |x| match x {
            Expr::Column(c) if c.cursor == old && c.column >= 0 => {
                if let Some(r) = replacement.get(c.column as usize) {
                    *x = r.clone();
                }
            }
            Expr::OnJoin { cursor, .. } | Expr::IfNullRow { cursor, .. } if *cursor == old => *cursor = inner,
            _ => {}
        });

        let mut items = std::mem::take(&mut sub.from);
        if let Some(first) = items.first_mut() {
            first.join = item.join;
        }
        let n = items.len();
        sel.from.splice(i..i, items);

        let sub_where = sub.where_clause.take().map(|w| {
            if left {
                Expr::OnJoin {
                    cursor: inner,
                    expr: Box::new(w),
                }
            } else {
                w
            }
        });
        sel.where_clause = Expr::and(sub_where, sel.where_clause.take());
        debug!(cursor = old, items = n, left_join = left, "subquery flattened");
        true
    }
}

/// `None` when item `i` is not a subquery, `Some(None)` when it can be
/// flattened, otherwise the reason it cannot
fn flatten_refusal(sel: &Select, i: usize) -> Option<Option<&'static str>> {
    let item = &sel.from[i];
    let sub = item.subquery.as_deref()?;
    let reason = if item.is_recursive_ref || sub.flags.contains(SelectFlags::RECURSIVE) {
        Some("recursive")
    } else if sub.is_compound() {
        Some("compound subquery")
    } else if sub.flags.contains(SelectFlags::AGGREGATE) {
        Some("aggregate subquery")
    } else if sub.distinct {
        Some("DISTINCT subquery")
    } else if sub.limit.is_some() || sub.offset.is_some() {
        Some("LIMIT in subquery")
    } else if sub.from.is_empty() {
        Some("subquery without FROM")
    } else if !sub.order_by.is_empty() && sel.order_by.is_empty() {
        Some("ORDER BY in subquery")
    } else if item.join.is_left() && sub.from.len() != 1 {
        Some("join on the right of a LEFT JOIN")
    } else if item.join.is_left() && sel.flags.contains(SelectFlags::AGGREGATE) {
        Some("LEFT JOIN in an aggregate query")
    } else {
        None
    };
    Some(reason)
}

/// Turn LEFT JOINs into inner joins where WHERE rejects the null row
fn reduce_left_joins(sel: &mut Select) {
    let Some(w) = &sel.where_clause else { return };
    let terms = w.clone().split_and();
    for i in 0..sel.from.len() {
        if !sel.from[i].join.is_left() {
            continue;
        }
        let cursor = sel.from[i].cursor;
        let rejected = terms
            .iter()
            .any(|t| !matches!(t, Expr::OnJoin { .. }) && rejects_null(t, cursor));
        if !rejected {
            continue;
        }
        sel.from[i].join.remove(JoinType::LEFT | JoinType::OUTER);
        if let Some(w) = sel.where_clause.as_mut() {
            w.transform(&mut |x| {
                if let Expr::OnJoin { cursor: c, expr } = x {
                    if *c == cursor {
                        let inner = std::mem::replace(expr.as_mut(), Expr::Null);
                        *x = inner;
                    }
                }
            });
        }
        debug!(cursor, "LEFT JOIN reduced to an inner join");
    }
}

/// Copy single-subquery WHERE terms into the subquery
fn push_down(sel: &mut Select) {
    let Some(w) = &sel.where_clause else { return };
    let terms = w.clone().split_and();
    for item in sel.from.iter_mut() {
        let cursor = item.cursor;
        let left = item.join.is_left();
        if item.is_recursive_ref {
            continue;
        }
        let Some(sub) = item.subquery.as_deref_mut() else { continue };
        if sub.flags.contains(SelectFlags::RECURSIVE)
            || sub
                .terms()
                .any(|t| t.flags.contains(SelectFlags::AGGREGATE) || t.limit.is_some() || t.offset.is_some())
        {
            continue;
        }
        for t in &terms {
            let (body, on_cursor) = match t {
                Expr::OnJoin { cursor, expr } => (expr.as_ref(), Some(*cursor)),
                other => (other, None),
            };
            // WHERE terms stay out of the right side of a LEFT JOIN; its own ON terms may go in
            let allowed = match on_cursor {
                Some(c) => left && c == cursor,
                None => !left,
            };
            if !allowed || body.has_subquery() || is_volatile(body) {
                continue;
            }
            let cursors = referenced_cursors(body);
            if cursors.is_empty() || cursors.iter().any(|c| *c != cursor) {
                continue;
            }
            let mut term = Some(&mut *sub);
            while let Some(s) = term {
                let results: Vec<Expr> = s.result_exprs().cloned().collect();
                let mut pushed = body.clone();
                pushed.transform(&mut |x| {
                    if let Expr::Column(c) = x {
                        if c.cursor == cursor && c.column >= 0 {
                            if let Some(r) = results.get(c.column as usize) {
                                *x = r.clone();
                            }
                        }
                    }
                });
                s.where_clause = Expr::and(s.where_clause.take(), Some(pushed));
                term = s.prior.as_deref_mut();
            }
            debug!(cursor, "WHERE term pushed into subquery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{compile, db_with};
    use super::*;
    use crate::api::config::DbConfig;
    use crate::vdbe::Opcode;

    fn db() -> crate::storage::Database {
        db_with("CREATE TABLE t(a, b); CREATE TABLE u(c, d);")
    }

    fn ops(config: &DbConfig, sql: &str) -> Vec<Opcode> {
        let db = db();
        let (program, _) = compile(&db, config, sql).unwrap();
        program.ops.iter().map(|o| o.opcode).collect()
    }

    #[test]
    fn test_simple_subquery_is_flattened() {
        let ops = ops(&DbConfig::default(), "SELECT x FROM (SELECT a + 1 AS x FROM t WHERE b > 2)");
        assert!(!ops.contains(&Opcode::InitCoroutine));
        assert!(!ops.contains(&Opcode::OpenEphemeral));
    }

    #[test]
    fn test_aggregate_subquery_not_flattened() {
        let ops = ops(&DbConfig::default(), "SELECT n FROM (SELECT count(*) AS n FROM t)");
        assert!(ops.contains(&Opcode::InitCoroutine));
    }

    #[test]
    fn test_left_join_subquery_uses_ifnullrow() {
        let ops = ops(
            &DbConfig::default(),
            "SELECT t.a, s.k FROM t LEFT JOIN (SELECT c, 5 AS k FROM u) s ON s.c = t.a",
        );
        assert!(ops.contains(&Opcode::IfNullRow));
        assert!(ops.contains(&Opcode::NullRow));
    }

    #[test]
    fn test_left_join_reduced_by_where() {
        let ops = ops(&DbConfig::default(), "SELECT * FROM t LEFT JOIN u ON u.c = t.a WHERE u.d > 0");
        assert!(!ops.contains(&Opcode::NullRow));
    }

    #[test]
    fn test_left_join_kept_for_is_null() {
        let ops = ops(&DbConfig::default(), "SELECT * FROM t LEFT JOIN u ON u.c = t.a WHERE u.d IS NULL");
        assert!(ops.contains(&Opcode::NullRow));
    }

    #[test]
    fn test_push_down_into_aggregate_free_subquery() {
        let mut config = DbConfig::default();
        config.set_optimizations(Optimizations::QUERY_FLATTENER, false);
        let db = db();
        let mut stmts = crate::parser::parse("SELECT x FROM (SELECT a AS x FROM t) WHERE x = 3").unwrap();
        let mut sel = match stmts.remove(0) {
            crate::parser::ast::Stmt::Select(s) => s,
            _ => unreachable!(),
        };
        let mut p = Parse::new(&db.schema, &config);
        p.prepare_select(&mut sel).unwrap();
        let mut copy = (*sel).clone();
        p.rewrite_select(&mut copy).unwrap();
        let sub = copy.from[0].subquery.as_ref().unwrap();
        assert!(sub.where_clause.is_some());
        assert!(copy.where_clause.is_some());
    }
}
