//! WHERE and HAVING rewrites that need no subquery
//!
//! Constant propagation: for a WHERE term `col = literal` the column is
//! replaced by the literal wherever it is a direct operand of another
//! comparison. The literal is wrapped in a CAST to the column's affinity
//! class so the rewritten comparison converts its operands the same way.
//! Only BINARY columns take part, and numeric columns only take numeric
//! literals.
//!
//! HAVING to WHERE: a HAVING term free of aggregates that reads only
//! GROUP BY columns filters rows before grouping instead.

use tracing::debug;

use crate::executor::expr::binary_collation;
use crate::executor::resolve::contains_aggregate;
use crate::executor::Parse;
use crate::parser::ast::{BinaryOp, ColumnRef, Expr, Select};
use crate::schema::Affinity;
use crate::vdbe::value::Collation;

/// `col = literal` found in WHERE
struct Constant {
    cursor: i32,
    column: i32,
    value: Expr,
}

/// The constant a `col = literal` term fixes, if it can be propagated
fn constant_of(term: &Expr) -> Option<Constant> {
    let Expr::Binary(BinaryOp::Eq, l, r) = term else { return None };
    if binary_collation(l, r) != Collation::Binary {
        return None;
    }
    let (col, lit) = match (l.as_ref(), r.as_ref()) {
        (Expr::Column(c), lit) | (lit, Expr::Column(c)) if lit.is_literal() => (c, lit),
        _ => return None,
    };
    let type_name = cast_type(col, lit)?;
    Some(Constant {
        cursor: col.cursor,
        column: col.column,
        value: Expr::Cast {
            expr: Box::new(lit.clone()),
            type_name: type_name.to_string(),
        },
    })
}

/// CAST target preserving how `col` compares, or None when the literal
/// cannot stand in for the column
fn cast_type(col: &ColumnRef, lit: &Expr) -> Option<&'static str> {
    if col.collation.map_or(false, |c| c != Collation::Binary) {
        return None;
    }
    let affinity = if col.column < 0 {
        Affinity::Integer
    } else {
        col.affinity.unwrap_or(Affinity::Blob)
    };
    match (affinity, lit) {
        (_, Expr::Null | Expr::Blob(_)) => None,
        (Affinity::Blob, _) => None,
        (Affinity::Text, _) => Some("TEXT"),
        (_, Expr::Integer(_) | Expr::Real(_)) => Some("NUMERIC"),
        _ => None,
    }
}

impl<'a> Parse<'a> {
    pub(super) fn propagate_constants(&mut self, sel: &mut Select) {
        let Some(w) = sel.where_clause.take() else { return };
        let mut terms = w.split_and();
        let constants: Vec<(usize, Constant)> = terms
            .iter()
            .enumerate()
            .filter_map(|(i, t)| constant_of(t).map(|c| (i, c)))
            .collect();
        if !constants.is_empty() {
            let mut rewritten = 0;
            for (i, term) in terms.iter_mut().enumerate() {
                if matches!(term, Expr::OnJoin { .. }) || constants.iter().any(|(j, _)| *j == i) {
                    continue;
                }
                term.transform(&mut |x| {
                    let Expr::Binary(op, l, r) = x else { return };
                    if !op.is_comparison() {
                        return;
                    }
                    for side in [l, r] {
                        if let Expr::Column(c) = side.as_ref() {
                            let found = constants
                                .iter()
                                .find(|(_, k)| k.cursor == c.cursor && k.column == c.column);
                            if let Some((_, k)) = found {
                                **side = k.value.clone();
                                rewritten += 1;
                            }
                        }
                    }
                });
            }
            if rewritten > 0 {
                debug!(constants = constants.len(), rewritten, "constants propagated");
            }
        }
        sel.where_clause = Expr::join_and(terms);
    }

    pub(super) fn having_to_where(&mut self, sel: &mut Select) {
        if sel.group_by.is_empty() {
            return;
        }
        let Some(h) = sel.having.take() else { return };
        let mut keep = Vec::new();
        let mut moved = Vec::new();
        for t in h.split_and() {
            if !contains_aggregate(&t) && !t.has_subquery() && reads_only_group_columns(&t, &sel.group_by) {
                moved.push(t);
            } else {
                keep.push(t);
            }
        }
        if !moved.is_empty() {
            debug!(terms = moved.len(), "HAVING terms moved to WHERE");
        }
        sel.having = Expr::join_and(keep);
        for t in moved {
            sel.where_clause = Expr::and(sel.where_clause.take(), Some(t));
        }
    }
}

/// Every column `e` reads is itself a BINARY GROUP BY term
fn reads_only_group_columns(e: &Expr, group_by: &[Expr]) -> bool {
    let mut ok = true;
    e.walk(&mut |x| match x {
        Expr::Column(c) => {
            let grouped = group_by.iter().any(|g| g == x);
            if !grouped || c.collation.map_or(false, |k| k != Collation::Binary) {
                ok = false;
            }
        }
        Expr::AggColumn(_) | Expr::IfNullRow { .. } => ok = false,
        _ => {}
    });
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Affinity;

    fn col(cursor: i32, column: i32, affinity: Affinity) -> Expr {
        Expr::Column(ColumnRef {
            cursor,
            column,
            affinity: Some(affinity),
            collation: Some(Collation::Binary),
            name: "c".into(),
            table: "t".into(),
        })
    }

    #[test]
    fn test_numeric_column_takes_numeric_literal() {
        let t = Expr::binary(BinaryOp::Eq, col(0, 1, Affinity::Integer), Expr::Integer(5));
        let k = constant_of(&t).unwrap();
        assert!(matches!(k.value, Expr::Cast { ref type_name, .. } if type_name == "NUMERIC"));
    }

    #[test]
    fn test_numeric_column_refuses_text_literal() {
        let t = Expr::binary(BinaryOp::Eq, col(0, 1, Affinity::Integer), Expr::Text("abc".into()));
        assert!(constant_of(&t).is_none());
    }

    #[test]
    fn test_untyped_column_refused() {
        let t = Expr::binary(BinaryOp::Eq, Expr::Integer(1), col(0, 1, Affinity::Blob));
        assert!(constant_of(&t).is_none());
    }

    #[test]
    fn test_group_column_check() {
        let g = vec![col(0, 0, Affinity::Text)];
        let ok = Expr::binary(BinaryOp::Eq, col(0, 0, Affinity::Text), Expr::Text("A".into()));
        let bad = Expr::binary(BinaryOp::Eq, col(0, 1, Affinity::Text), Expr::Text("A".into()));
        assert!(reads_only_group_columns(&ok, &g));
        assert!(!reads_only_group_columns(&bad, &g));
    }
}
