//! Name resolution
//!
//! Binds identifiers to cursor columns, NEW/OLD trigger rows and the
//! `excluded` pseudo-table of an upsert; checks function arity and where
//! aggregates may appear; resolves GROUP BY and ORDER BY terms against the
//! result set.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::{same_name, Parse};
use crate::functions::find_function;
use crate::parser::ast::{ColumnRef, CompoundOp, Expr, OrderingTerm, ResultColumn, Select, SelectFlags};
use crate::schema::{Affinity, Table};
use crate::vdbe::value::collation_or_error;

/// A FROM item visible to name lookup
#[derive(Debug, Clone)]
pub struct ScopeItem {
    pub cursor: i32,
    pub name: Option<String>,
    pub table: Arc<Table>,
    /// Columns merged into an earlier item by USING or NATURAL
    pub hidden: Vec<usize>,
}

/// One level of name lookup: the FROM items of a select
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub items: Vec<ScopeItem>,
    /// Result column aliases with their resolved expressions
    pub aliases: Vec<(String, Expr)>,
    /// An aggregate function was seen in this scope
    pub has_agg: bool,
    /// A name in a nested scope resolved to this scope or an outer one
    pub correlated: bool,
}

impl Scope {
    /// Scope exposing one table under `cursor`
    pub fn single(table: Arc<Table>, cursor: i32, name: Option<String>) -> Scope {
        Scope {
            items: vec![ScopeItem {
                cursor,
                name: name.or_else(|| Some(table.name.clone())),
                table,
                hidden: Vec::new(),
            }],
            ..Default::default()
        }
    }
}

/// Where in a statement an expression appears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    Where,
    Result,
    GroupBy,
    Having,
    OrderBy,
    /// Argument of an aggregate function
    AggArg,
    /// CHECK, DEFAULT, index expressions, SET values, LIMIT
    Other,
}

impl Clause {
    fn allows_aggregate(self) -> bool {
        matches!(self, Clause::Result | Clause::Having | Clause::OrderBy)
    }

    fn allows_alias(self) -> bool {
        matches!(self, Clause::Where | Clause::GroupBy | Clause::Having | Clause::OrderBy)
    }
}

/// Column reference to `column` of `table` read through `cursor`
///
/// The INTEGER PRIMARY KEY column is read as the rowid (-1).
pub fn column_ref(table: &Table, cursor: i32, column: i32) -> Expr {
    let column = if column >= 0 && table.has_rowid() && table.ipk == Some(column as usize) {
        -1
    } else {
        column
    };
    let (name, affinity, collation) = if column < 0 {
        let name = table
            .ipk
            .map(|i| table.columns[i].name.clone())
            .unwrap_or_else(|| "rowid".to_string());
        (name, Some(Affinity::Integer), None)
    } else {
        let c = &table.columns[column as usize];
        (c.name.clone(), Some(c.affinity), Some(c.collation))
    };
    Expr::Column(ColumnRef {
        cursor,
        column,
        affinity,
        collation,
        name,
        table: table.name.clone(),
    })
}

fn ordinal(i: usize) -> String {
    let suffix = match (i % 10, i % 100) {
        (1, n) if n != 11 => "st",
        (2, n) if n != 12 => "nd",
        (3, n) if n != 13 => "rd",
        _ => "th",
    };
    format!("{}{}", i, suffix)
}

/// Whether the expression calls an aggregate function (subqueries not entered)
pub fn contains_aggregate(e: &Expr) -> bool {
    e.any(&mut |x| match x {
        Expr::Function { name, args, star, .. } => {
            let argc = if *star { 0 } else { args.len() };
            find_function(name, argc).map(|d| d.is_aggregate()).unwrap_or(false)
        }
        Expr::AggFunction(_) => true,
        _ => false,
    })
}

impl<'a> Parse<'a> {
    // ========================================================================
    // Entry points
    // ========================================================================

    /// Resolve names in `e` against the current scopes
    pub fn resolve_expr(&mut self, e: &mut Expr, clause: Clause) -> Result<()> {
        self.resolve_node(e, clause)
    }

    /// Resolve an expression stored in the schema (CHECK, index expression,
    /// partial-index WHERE) against a single table read through `cursor`
    pub fn resolve_in_table(&mut self, e: &mut Expr, table: &Arc<Table>, cursor: i32) -> Result<()> {
        let saved_scopes = std::mem::take(&mut self.scopes);
        let saved_trigger = self.trigger.take();
        let saved_excluded = self.excluded.take();
        self.scopes.push(Scope::single(table.clone(), cursor, None));
        let r = self.resolve_node(e, Clause::Other);
        self.scopes = saved_scopes;
        self.trigger = saved_trigger;
        self.excluded = saved_excluded;
        r
    }

    /// Resolve every term of an expanded (possibly compound) select
    pub fn resolve_select(&mut self, sel: &mut Select) -> Result<()> {
        if sel.flags.contains(SelectFlags::RESOLVED) {
            return Ok(());
        }
        let n_col = sel.column_count();
        let compound = sel.is_compound();
        if compound {
            // ORDER BY of a compound names result columns of the leftmost term
            let names = leftmost_aliases(sel);
            let mut order = std::mem::take(&mut sel.order_by);
            for (i, term) in order.iter_mut().enumerate() {
                let k = compound_order_column(&term.expr, &names, n_col)
                    .ok_or_else(|| {
                        Error::sql(format!(
                            "{} ORDER BY term does not match any column in the result set",
                            ordinal(i + 1)
                        ))
                    })?;
                term.expr = Expr::Integer(k as i64 + 1);
            }
            sel.order_by = order;
        }
        let mut cur: Option<&mut Select> = Some(&mut *sel);
        let mut rightmost = true;
        while let Some(term) = cur {
            if !term.flags.contains(SelectFlags::RESOLVED) {
                self.resolve_term(term, rightmost && !compound)?;
            }
            rightmost = false;
            cur = term.prior.as_deref_mut();
        }
        sel.flags |= SelectFlags::RESOLVED;
        Ok(())
    }

    // ========================================================================
    // One SELECT term
    // ========================================================================

    fn resolve_term(&mut self, sel: &mut Select, own_order_by: bool) -> Result<()> {
        let mut scope = Scope::default();
        for (i, item) in sel.from.iter().enumerate() {
            let table = match &item.table {
                Some(t) => t.clone(),
                None => continue,
            };
            let hidden = if i > 0 {
                item.using
                    .iter()
                    .filter_map(|n| table.column_index(n))
                    .filter(|c| *c >= 0)
                    .map(|c| c as usize)
                    .collect()
            } else {
                Vec::new()
            };
            scope.items.push(ScopeItem {
                cursor: item.cursor,
                name: item.visible_name().map(str::to_string),
                table,
                hidden,
            });
        }
        self.scopes.push(scope);
        let r = self.resolve_term_body(sel, own_order_by);
        let scope = self.scopes.pop().unwrap_or_default();
        r?;

        if scope.has_agg || !sel.group_by.is_empty() {
            sel.flags |= SelectFlags::AGGREGATE;
        } else if sel.having.is_some() {
            return Err(Error::sql("HAVING clause on a non-aggregate query"));
        }
        if scope.correlated {
            sel.flags |= SelectFlags::CORRELATED;
        }

        // LIMIT and OFFSET see only enclosing queries
        if let Some(e) = sel.limit.as_mut() {
            self.resolve_node(e, Clause::Other)?;
        }
        if let Some(e) = sel.offset.as_mut() {
            self.resolve_node(e, Clause::Other)?;
        }
        sel.flags |= SelectFlags::RESOLVED;
        Ok(())
    }

    fn resolve_term_body(&mut self, sel: &mut Select, own_order_by: bool) -> Result<()> {
        // ON clauses first; they become WHERE terms
        let mut where_terms = Vec::new();
        for i in 0..sel.from.len() {
            if let Some(mut on) = sel.from[i].on.take() {
                self.resolve_node(&mut on, Clause::Where)?;
                if sel.from[i].join.is_left() {
                    where_terms.push(Expr::OnJoin {
                        cursor: sel.from[i].cursor,
                        expr: Box::new(on),
                    });
                } else {
                    where_terms.push(on);
                }
            }
        }
        if let Some(mut w) = sel.where_clause.take() {
            self.resolve_node(&mut w, Clause::Where)?;
            where_terms.push(w);
        }
        let using_terms = self.using_terms(sel)?;
        where_terms.extend(using_terms);
        sel.where_clause = Expr::join_and(where_terms);

        let mut aliases = Vec::new();
        for col in sel.columns.iter_mut() {
            if let ResultColumn::Expr { expr, alias } = col {
                self.resolve_node(expr, Clause::Result)?;
                if let Some(a) = alias {
                    aliases.push((a.clone(), expr.clone()));
                }
            }
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.aliases = aliases;
        }
        let results: Vec<Expr> = sel.result_exprs().cloned().collect();

        let mut group_by = std::mem::take(&mut sel.group_by);
        for (i, g) in group_by.iter_mut().enumerate() {
            if let Expr::Integer(k) = g {
                let k = *k;
                if k < 1 || k as usize > results.len() {
                    return Err(Error::sql(format!(
                        "{} GROUP BY term out of range - should be between 1 and {}",
                        ordinal(i + 1),
                        results.len()
                    )));
                }
                *g = results[k as usize - 1].clone();
                if contains_aggregate(g) {
                    return Err(Error::sql("aggregate functions are not allowed in the GROUP BY clause"));
                }
                continue;
            }
            self.resolve_node(g, Clause::GroupBy)?;
        }
        sel.group_by = group_by;

        if let Some(h) = sel.having.as_mut() {
            self.resolve_node(h, Clause::Having)?;
        }

        if own_order_by {
            let mut order = std::mem::take(&mut sel.order_by);
            self.resolve_order_by(&mut order, &results)?;
            sel.order_by = order;
        }
        Ok(())
    }

    fn resolve_order_by(&mut self, order: &mut [OrderingTerm], results: &[Expr]) -> Result<()> {
        for (i, term) in order.iter_mut().enumerate() {
            if let Expr::Integer(k) = term.expr {
                if k < 1 || k as usize > results.len() {
                    return Err(Error::sql(format!(
                        "{} ORDER BY term out of range - should be between 1 and {}",
                        ordinal(i + 1),
                        results.len()
                    )));
                }
                term.expr = results[k as usize - 1].clone();
                continue;
            }
            // Aliases win over table columns here
            if let Expr::Id(name) = &term.expr {
                let alias = self
                    .scopes
                    .last()
                    .and_then(|s| s.aliases.iter().find(|(a, _)| same_name(a, name)))
                    .map(|(_, e)| e.clone());
                if let Some(e) = alias {
                    term.expr = e;
                    continue;
                }
            }
            self.resolve_node(&mut term.expr, Clause::OrderBy)?;
        }
        Ok(())
    }

    /// Equality terms implied by USING and NATURAL joins
    fn using_terms(&mut self, sel: &Select) -> Result<Vec<Expr>> {
        let mut terms = Vec::new();
        for i in 1..sel.from.len() {
            let right = &sel.from[i];
            if right.using.is_empty() {
                continue;
            }
            let rt = match &right.table {
                Some(t) => t.clone(),
                None => continue,
            };
            for name in &right.using {
                let missing = || {
                    Error::sql(format!(
                        "cannot join using column {} - column not present in both tables",
                        name
                    ))
                };
                let rc = rt.column_index(name).filter(|c| *c >= 0).ok_or_else(missing)?;
                let left = sel.from[..i].iter().find_map(|l| {
                    let t = l.table.as_ref()?;
                    let c = t.column_index(name).filter(|c| *c >= 0)?;
                    Some(column_ref(t, l.cursor, c))
                });
                let left = left.ok_or_else(missing)?;
                let eq = Expr::binary(
                    crate::parser::ast::BinaryOp::Eq,
                    left,
                    column_ref(&rt, right.cursor, rc),
                );
                terms.push(if right.join.is_left() {
                    Expr::OnJoin {
                        cursor: right.cursor,
                        expr: Box::new(eq),
                    }
                } else {
                    eq
                });
            }
        }
        Ok(terms)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn resolve_node(&mut self, e: &mut Expr, clause: Clause) -> Result<()> {
        match e {
            Expr::Id(name) => {
                let name = name.clone();
                *e = self.lookup_column(None, &name, clause)?;
            }
            Expr::Qualified(t, c) => {
                let (t, c) = (t.clone(), c.clone());
                *e = self.lookup_column(Some(&t), &c, clause)?;
            }
            Expr::Function { name, args, distinct, star } => {
                let argc = if *star { 0 } else { args.len() };
                let def = find_function(name, argc)?;
                if def.is_aggregate() {
                    if !clause.allows_aggregate() {
                        return Err(Error::sql(format!("misuse of aggregate: {}()", name)));
                    }
                    if *distinct && argc != 1 {
                        return Err(Error::sql("DISTINCT aggregates must have exactly one argument"));
                    }
                    if let Some(scope) = self.scopes.last_mut() {
                        scope.has_agg = true;
                    }
                    for a in args.iter_mut() {
                        self.resolve_node(a, Clause::AggArg)?;
                    }
                } else {
                    for a in args.iter_mut() {
                        self.resolve_node(a, clause)?;
                    }
                }
            }
            Expr::Subquery(sel) => {
                self.prepare_select(sel)?;
                if sel.column_count() != 1 {
                    return Err(Error::sql(format!(
                        "sub-select returns {} columns - expected 1",
                        sel.column_count()
                    )));
                }
            }
            Expr::Exists(sel) => self.prepare_select(sel)?,
            Expr::InSelect { expr, select, .. } => {
                self.resolve_node(expr, clause)?;
                self.prepare_select(select)?;
                if select.column_count() != 1 {
                    return Err(Error::sql(format!(
                        "sub-select returns {} columns - expected 1",
                        select.column_count()
                    )));
                }
            }
            Expr::Raise(..) => {
                if self.trigger.is_none() {
                    return Err(Error::sql("RAISE() may only be used within a trigger-program"));
                }
            }
            Expr::Collate { expr, collation } => {
                collation_or_error(collation)?;
                self.resolve_node(expr, clause)?;
            }
            Expr::Variable(n) => {
                let n = *n;
                self.note_variable(n);
            }
            Expr::Unary(_, x)
            | Expr::IsNull(x)
            | Expr::NotNull(x)
            | Expr::Cast { expr: x, .. }
            | Expr::IfNullRow { expr: x, .. }
            | Expr::OnJoin { expr: x, .. } => self.resolve_node(x, clause)?,
            Expr::Binary(_, l, r) => {
                self.resolve_node(l, clause)?;
                self.resolve_node(r, clause)?;
            }
            Expr::Between { expr, low, high, .. } => {
                self.resolve_node(expr, clause)?;
                self.resolve_node(low, clause)?;
                self.resolve_node(high, clause)?;
            }
            Expr::InList { expr, list, .. } => {
                self.resolve_node(expr, clause)?;
                for x in list.iter_mut() {
                    self.resolve_node(x, clause)?;
                }
            }
            Expr::Like { expr, pattern, escape, .. } => {
                self.resolve_node(expr, clause)?;
                self.resolve_node(pattern, clause)?;
                if let Some(x) = escape {
                    self.resolve_node(x, clause)?;
                }
            }
            Expr::Case { operand, whens, else_expr } => {
                if let Some(x) = operand {
                    self.resolve_node(x, clause)?;
                }
                for (w, t) in whens.iter_mut() {
                    self.resolve_node(w, clause)?;
                    self.resolve_node(t, clause)?;
                }
                if let Some(x) = else_expr {
                    self.resolve_node(x, clause)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn lookup_column(&mut self, qual: Option<&str>, col: &str, clause: Clause) -> Result<Expr> {
        let display = match qual {
            Some(q) => format!("{}.{}", q, col),
            None => col.to_string(),
        };

        if let Some(q) = qual {
            if let Some(e) = self.lookup_pseudo_table(q, col, &display)? {
                return Ok(e);
            }
        }

        let innermost = self.scopes.len();
        for depth in (0..innermost).rev() {
            let scope = &self.scopes[depth];
            let mut found = Vec::new();
            let mut qualifier_seen = false;
            for item in &scope.items {
                if let Some(q) = qual {
                    match &item.name {
                        Some(n) if same_name(n, q) => qualifier_seen = true,
                        _ => continue,
                    }
                }
                if let Some(c) = item.table.column_index(col) {
                    if qual.is_none() && c >= 0 && item.hidden.contains(&(c as usize)) {
                        continue;
                    }
                    found.push(column_ref(&item.table, item.cursor, c));
                }
            }
            if found.len() > 1 {
                return Err(Error::sql(format!("ambiguous column name: {}", display)));
            }
            if let Some(e) = found.pop() {
                for s in &mut self.scopes[depth + 1..] {
                    s.correlated = true;
                }
                return Ok(e);
            }
            if qual.is_none() && depth + 1 == innermost && clause.allows_alias() {
                if let Some((_, e)) = scope.aliases.iter().find(|(a, _)| same_name(a, col)) {
                    if clause == Clause::Where && contains_aggregate(e) {
                        return Err(Error::sql(format!("misuse of aliased aggregate {}", col)));
                    }
                    return Ok(e.clone());
                }
            }
            if qualifier_seen {
                return Err(Error::sql(format!("no such column: {}", display)));
            }
        }

        if qual.is_none() {
            if col.eq_ignore_ascii_case("true") {
                return Ok(Expr::Integer(1));
            }
            if col.eq_ignore_ascii_case("false") {
                return Ok(Expr::Integer(0));
            }
        }
        Err(Error::sql(format!("no such column: {}", display)))
    }

    /// `new.x`, `old.x` inside a trigger and `excluded.x` inside an upsert
    fn lookup_pseudo_table(&self, qual: &str, col: &str, display: &str) -> Result<Option<Expr>> {
        if let Some(tc) = &self.trigger {
            let new = same_name(qual, "new");
            if new || same_name(qual, "old") {
                let available = if new { tc.new } else { tc.old };
                let idx = tc.table.column_index(col).filter(|_| available);
                let idx = idx.ok_or_else(|| Error::sql(format!("no such column: {}", display)))?;
                let column = if idx >= 0 && tc.table.ipk == Some(idx as usize) { -1 } else { idx };
                let affinity = if column < 0 {
                    Some(Affinity::Integer)
                } else {
                    Some(tc.table.columns[column as usize].affinity)
                };
                return Ok(Some(Expr::TriggerRow { new, column, affinity }));
            }
        }
        if let Some((table, reg)) = &self.excluded {
            if same_name(qual, "excluded") {
                let idx = table
                    .column_index(col)
                    .ok_or_else(|| Error::sql(format!("no such column: {}", display)))?;
                let is_rowid = idx < 0 || table.ipk == Some(idx as usize);
                let (reg, affinity, collation) = if is_rowid {
                    (*reg, Some(Affinity::Integer), None)
                } else {
                    let c = &table.columns[idx as usize];
                    (*reg + 1 + idx, Some(c.affinity), Some(c.collation))
                };
                return Ok(Some(Expr::Register { reg, affinity, collation }));
            }
        }
        Ok(None)
    }
}

/// Result names of the leftmost term of a compound, for ORDER BY matching
fn leftmost_aliases(sel: &Select) -> Vec<Option<String>> {
    let left = sel.terms().last().unwrap_or(sel);
    left.columns
        .iter()
        .map(|c| match c {
            ResultColumn::Expr { alias: Some(a), .. } => Some(a.clone()),
            ResultColumn::Expr { expr: Expr::Column(c), .. } => Some(c.name.clone()),
            ResultColumn::Expr { expr: Expr::Id(n), .. } => Some(n.clone()),
            ResultColumn::Expr { expr: Expr::Qualified(_, n), .. } => Some(n.clone()),
            _ => None,
        })
        .collect()
}

/// Zero-based result column named by a compound ORDER BY term
fn compound_order_column(e: &Expr, names: &[Option<String>], n_col: usize) -> Option<usize> {
    match e.skip_wrappers() {
        Expr::Integer(k) if *k >= 1 && (*k as usize) <= n_col => Some(*k as usize - 1),
        Expr::Id(n) | Expr::Qualified(_, n) => names
            .iter()
            .position(|a| a.as_deref().map_or(false, |a| same_name(a, n))),
        Expr::Collate { expr, .. } => compound_order_column(expr, names, n_col),
        _ => None,
    }
}

/// Whether a compound operator removes duplicates
pub fn is_distinct_op(op: CompoundOp) -> bool {
    matches!(op, CompoundOp::Union | CompoundOp::Intersect | CompoundOp::Except)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DbConfig;
    use crate::parser::grammar::parse_expr;
    use crate::schema::{Column, Schema};

    fn table() -> Arc<Table> {
        let mut t = Table::new("t");
        let mut a = Column::new("a");
        a.affinity = Affinity::Integer;
        t.columns.push(a);
        t.columns.push(Column::new("b"));
        t.ipk = Some(0);
        Arc::new(t)
    }

    #[test]
    fn test_ipk_resolves_to_rowid() {
        let schema = Schema::new();
        let config = DbConfig::default();
        let mut p = Parse::new(&schema, &config);
        let mut e = parse_expr("a + b").unwrap();
        p.resolve_in_table(&mut e, &table(), 3).unwrap();
        match e {
            Expr::Binary(_, l, r) => {
                assert!(matches!(*l, Expr::Column(ColumnRef { cursor: 3, column: -1, .. })));
                assert!(matches!(*r, Expr::Column(ColumnRef { column: 1, .. })));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_column() {
        let schema = Schema::new();
        let config = DbConfig::default();
        let mut p = Parse::new(&schema, &config);
        let mut e = parse_expr("t.zz").unwrap();
        let err = p.resolve_in_table(&mut e, &table(), 0).unwrap_err();
        assert_eq!(err.errmsg(), "no such column: t.zz");
    }

    #[test]
    fn test_aggregate_misuse_in_where() {
        let schema = Schema::new();
        let config = DbConfig::default();
        let mut p = Parse::new(&schema, &config);
        p.scopes.push(Scope::single(table(), 0, None));
        let mut e = parse_expr("count(b) > 1").unwrap();
        let err = p.resolve_expr(&mut e, Clause::Where).unwrap_err();
        assert_eq!(err.errmsg(), "misuse of aggregate: count()");
    }

    #[test]
    fn test_raise_outside_trigger() {
        let schema = Schema::new();
        let config = DbConfig::default();
        let mut p = Parse::new(&schema, &config);
        let mut e = Expr::Raise(crate::parser::ast::RaiseAction::Ignore, None);
        assert!(p.resolve_expr(&mut e, Clause::Other).is_err());
    }

    #[test]
    fn test_ordinal() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(2), "2nd");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(23), "23rd");
    }
}
