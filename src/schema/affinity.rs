//! Affinity computation
//!
//! Column affinity from declared types, expression affinity for comparisons
//! and expression indexes, and the memoized per-table and per-index
//! affinity strings applied before building records.

use crate::parser::ast::{Expr, UnaryOp};
use crate::schema::{Affinity, Index, IndexTarget, Table};

/// Determine column affinity from a declared type name
///
/// 1. contains "INT" -> INTEGER
/// 2. contains "CHAR", "CLOB" or "TEXT" -> TEXT
/// 3. contains "BLOB" or no type -> BLOB
/// 4. contains "REAL", "FLOA" or "DOUB" -> REAL
/// 5. otherwise NUMERIC
pub fn type_affinity(type_name: &str) -> Affinity {
    let upper = type_name.to_ascii_uppercase();
    if upper.contains("INT") {
        Affinity::Integer
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        Affinity::Text
    } else if upper.contains("BLOB") || upper.trim().is_empty() {
        Affinity::Blob
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        Affinity::Real
    } else {
        Affinity::Numeric
    }
}

/// Affinity of an expression, if it has one
///
/// `table` resolves bare identifiers, which is how index expressions and
/// CHECK constraints are stored before they are bound to a cursor.
pub fn expr_affinity(expr: &Expr, table: Option<&Table>) -> Option<Affinity> {
    match expr {
        Expr::Column(c) => {
            if c.column < 0 {
                Some(Affinity::Integer)
            } else {
                c.affinity
            }
        }
        Expr::Register { affinity, .. } | Expr::TriggerRow { affinity, .. } => *affinity,
        Expr::Cast { type_name, .. } => Some(type_affinity(type_name)),
        Expr::Collate { expr, .. } | Expr::IfNullRow { expr, .. } | Expr::OnJoin { expr, .. } => {
            expr_affinity(expr, table)
        }
        Expr::Subquery(sel) => sel
            .result_exprs()
            .next()
            .and_then(|e| expr_affinity(e, None)),
        Expr::Id(name) | Expr::Qualified(_, name) => {
            let t = table?;
            let idx = t.column_index(name)?;
            if idx < 0 {
                Some(Affinity::Integer)
            } else {
                Some(t.columns[idx as usize].affinity)
            }
        }
        Expr::Unary(UnaryOp::Pos, _) => None,
        _ => None,
    }
}

/// Affinity used when comparing `a` with `b`
///
/// Numeric wins over text; text wins over no affinity; two affinity-less
/// operands compare as-is.
pub fn compare_affinity(a: Option<Affinity>, b: Option<Affinity>) -> Option<Affinity> {
    match (a, b) {
        (Some(x), Some(y)) => {
            if x.is_numeric() || y.is_numeric() {
                Some(Affinity::Numeric)
            } else if x == Affinity::Blob && y == Affinity::Blob {
                None
            } else {
                Some(Affinity::Blob)
            }
        }
        (Some(x), None) | (None, Some(x)) => {
            if x == Affinity::Blob {
                None
            } else {
                Some(x)
            }
        }
        (None, None) => None,
    }
}

/// One affinity character per column, trailing BLOB affinities trimmed
///
/// Computed on first use and cached on the table.
pub fn table_affinity(table: &Table) -> &str {
    table.affinity.get_or_init(|| {
        let mut s: String = table.columns.iter().map(|c| c.affinity.as_char()).collect();
        while s.ends_with(Affinity::Blob.as_char()) {
            s.pop();
        }
        s
    })
}

/// One affinity character per stored index column, including the
/// row identifier tail
///
/// Computed on first use and cached on the index.
pub fn index_affinity<'a>(index: &'a Index, table: &Table) -> &'a str {
    index.affinity.get_or_init(|| {
        index
            .columns
            .iter()
            .map(|c| match &c.target {
                IndexTarget::Column(col) => table.columns[*col].affinity,
                IndexTarget::Rowid => Affinity::Integer,
                IndexTarget::Expr(e) => expr_affinity(e, Some(table)).unwrap_or(Affinity::Blob),
            })
            .map(|a| a.as_char())
            .collect()
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::{ConflictAction, SortOrder};
    use crate::schema::{Column, IndexColumn, IndexOrigin};
    use crate::vdbe::value::Collation;
    use std::sync::OnceLock;

    fn table() -> Table {
        let mut t = Table::new("t");
        for (name, ty) in [("a", "INTEGER"), ("b", "TEXT"), ("c", ""), ("d", "")] {
            let mut c = Column::new(name);
            c.affinity = type_affinity(ty);
            t.columns.push(c);
        }
        t
    }

    #[test]
    fn test_type_affinity_rules() {
        assert_eq!(type_affinity("BIGINT"), Affinity::Integer);
        assert_eq!(type_affinity("VARCHAR(10)"), Affinity::Text);
        assert_eq!(type_affinity(""), Affinity::Blob);
        assert_eq!(type_affinity("DOUBLE PRECISION"), Affinity::Real);
        assert_eq!(type_affinity("DECIMAL(10,5)"), Affinity::Numeric);
        // "INT" wins over "CHAR"
        assert_eq!(type_affinity("CHARINT"), Affinity::Integer);
    }

    #[test]
    fn test_table_affinity_trims_trailing_blob() {
        let t = table();
        assert_eq!(table_affinity(&t), "DB");
        // memoized: same allocation on the second call
        let p1 = table_affinity(&t).as_ptr();
        let p2 = table_affinity(&t).as_ptr();
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_index_affinity_has_rowid_tail() {
        let t = table();
        let idx = Index {
            name: "i".into(),
            table: "t".into(),
            columns: vec![
                IndexColumn::column(1, Collation::Binary),
                IndexColumn {
                    target: IndexTarget::Expr(Expr::Cast {
                        expr: Box::new(Expr::id("c")),
                        type_name: "REAL".into(),
                    }),
                    collation: Collation::Binary,
                    order: SortOrder::Asc,
                },
                IndexColumn {
                    target: IndexTarget::Rowid,
                    collation: Collation::Binary,
                    order: SortOrder::Asc,
                },
            ],
            n_key_col: 2,
            unique: false,
            on_conflict: ConflictAction::Abort,
            partial: None,
            origin: IndexOrigin::CreateIndex,
            root: 3,
            affinity: OnceLock::new(),
        };
        assert_eq!(index_affinity(&idx, &t), "BED");
    }

    #[test]
    fn test_compare_affinity() {
        assert_eq!(compare_affinity(Some(Affinity::Text), Some(Affinity::Integer)), Some(Affinity::Numeric));
        assert_eq!(compare_affinity(Some(Affinity::Text), None), Some(Affinity::Text));
        assert_eq!(compare_affinity(Some(Affinity::Blob), None), None);
        assert_eq!(compare_affinity(None, None), None);
    }
}
