//! Select expansion
//!
//! Binds every FROM item to a table and a cursor, replaces `*` and `t.*`
//! with column references and names the result columns. Views and CTE
//! references are replaced by a prepared copy of their body; a FROM item
//! that is a subquery gets a synthesized table describing its result.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::executor::expr::expr_collation;
use crate::executor::resolve::column_ref;
use crate::executor::{same_name, CteBinding, Parse};
use crate::parser::ast::{Expr, JoinType, ResultColumn, Select, SelectFlags, SrcItem, With};
use crate::schema::{expr_affinity, Affinity, Column, Table};

/// Name of an unaliased result column
fn result_name(expr: &Expr) -> String {
    match expr {
        Expr::Id(n) | Expr::Qualified(_, n) => n.clone(),
        Expr::Column(c) => c.name.clone(),
        other => other.to_string(),
    }
}

/// Table describing the result of `sel`: column names from `columns`
/// when given, else from the result names; affinity and collation from
/// the leftmost term's expressions
pub(super) fn synth_table(name: &str, sel: &Select, columns: &[String]) -> Result<Arc<Table>> {
    let n = sel.column_count();
    if !columns.is_empty() && columns.len() != n {
        return Err(Error::sql(format!(
            "table {} has {} values for {} columns",
            name,
            n,
            columns.len()
        )));
    }
    let leftmost = sel.terms().last().unwrap_or(sel);
    let mut table = Table::new(name);
    let mut seen = HashSet::new();
    for (i, e) in leftmost.result_exprs().enumerate() {
        let base = columns
            .get(i)
            .or_else(|| sel.names.get(i))
            .cloned()
            .unwrap_or_else(|| format!("column{}", i + 1));
        let mut col_name = base.clone();
        let mut k = 0;
        while !seen.insert(col_name.to_ascii_lowercase()) {
            k += 1;
            col_name = format!("{}:{}", base, k);
        }
        table.columns.push(Column {
            affinity: expr_affinity(e, None).unwrap_or(Affinity::Blob),
            collation: expr_collation(e),
            ..Column::new(col_name)
        });
    }
    table.view = Some(Box::new(sel.clone()));
    table.ephemeral = true;
    Ok(Arc::new(table))
}

/// Whether a term of `sel` names `name` directly in its FROM clause
pub(super) fn term_references(term: &Select, name: &str) -> bool {
    term.from
        .iter()
        .any(|i| i.subquery.is_none() && i.name.as_deref().map_or(false, |n| same_name(n, name)))
}

impl<'a> Parse<'a> {
    // ========================================================================
    // CTE scopes
    // ========================================================================

    /// Make the CTEs of a WITH clause visible; returns how many to pop
    pub(crate) fn push_ctes(&mut self, with: Option<&With>) -> usize {
        let Some(with) = with else { return 0 };
        for cte in &with.ctes {
            self.ctes.push(CteBinding {
                cte: cte.clone(),
                recursive: with.recursive,
                recursive_ref: None,
                expanding: false,
            });
        }
        with.ctes.len()
    }

    pub(crate) fn pop_ctes(&mut self, n: usize) {
        let keep = self.ctes.len().saturating_sub(n);
        self.ctes.truncate(keep);
    }

    // ========================================================================
    // Expansion
    // ========================================================================

    /// Expand every term of a (possibly compound) select
    pub(super) fn expand_select(&mut self, sel: &mut Select) -> Result<()> {
        let mut cur = Some(&mut *sel);
        while let Some(term) = cur {
            if !term.flags.contains(SelectFlags::EXPANDED) {
                self.expand_term(term)?;
            }
            cur = term.prior.as_deref_mut();
        }

        if sel.is_compound() {
            for term in sel.terms() {
                let Some(prior) = term.prior.as_deref() else { break };
                if prior.column_count() != term.column_count() {
                    if term.flags.contains(SelectFlags::VALUES) && prior.flags.contains(SelectFlags::VALUES) {
                        return Err(Error::sql("all VALUES must have the same number of terms"));
                    }
                    return Err(Error::sql(format!(
                        "SELECTs to the left and right of {} do not have the same number of result columns",
                        term.op.name()
                    )));
                }
            }
            sel.names = sel.terms().last().map(|t| t.names.clone()).unwrap_or_default();
        }
        Ok(())
    }

    fn expand_term(&mut self, sel: &mut Select) -> Result<()> {
        for i in 0..sel.from.len() {
            let (done, rest) = sel.from.split_at_mut(i);
            let item = &mut rest[0];
            if item.join.contains(JoinType::RIGHT) {
                return Err(Error::sql("RIGHT and FULL OUTER JOINs are not currently supported"));
            }
            self.expand_from_item(item)?;
            if item.join.contains(JoinType::NATURAL) {
                if item.on.is_some() || !item.using.is_empty() {
                    return Err(Error::sql("a NATURAL join may not have an ON or USING clause"));
                }
                item.using = natural_columns(done, item);
            }
        }
        let refs = sel.from.iter().filter(|i| i.is_recursive_ref).count();
        if refs > 1 {
            let name = sel
                .from
                .iter()
                .find(|i| i.is_recursive_ref)
                .and_then(|i| i.name.clone())
                .unwrap_or_default();
            return Err(Error::sql(format!("multiple references to recursive table: {}", name)));
        }

        let mut columns = Vec::with_capacity(sel.columns.len());
        let mut names = Vec::with_capacity(sel.columns.len());
        for col in std::mem::take(&mut sel.columns) {
            match col {
                ResultColumn::Star => {
                    if sel.from.is_empty() {
                        return Err(Error::sql("no tables specified"));
                    }
                    for (i, item) in sel.from.iter().enumerate() {
                        let Some(table) = &item.table else { continue };
                        for (c, column) in table.columns.iter().enumerate() {
                            if i > 0 && item.using.iter().any(|u| same_name(u, &column.name)) {
                                continue;
                            }
                            names.push(column.name.clone());
                            columns.push(ResultColumn::Expr {
                                expr: column_ref(table, item.cursor, c as i32),
                                alias: None,
                            });
                        }
                    }
                }
                ResultColumn::TableStar(q) => {
                    let item = sel
                        .from
                        .iter()
                        .find(|i| i.visible_name().map_or(false, |n| same_name(n, &q)))
                        .ok_or_else(|| Error::sql(format!("no such table: {}", q)))?;
                    let Some(table) = &item.table else { continue };
                    for (c, column) in table.columns.iter().enumerate() {
                        names.push(column.name.clone());
                        columns.push(ResultColumn::Expr {
                            expr: column_ref(table, item.cursor, c as i32),
                            alias: None,
                        });
                    }
                }
                ResultColumn::Expr { expr, alias } => {
                    names.push(alias.clone().unwrap_or_else(|| result_name(&expr)));
                    columns.push(ResultColumn::Expr { expr, alias });
                }
            }
        }
        if sel.flags.contains(SelectFlags::VALUES) {
            names = (1..=columns.len()).map(|i| format!("column{}", i)).collect();
        }
        sel.columns = columns;
        sel.names = names;
        sel.flags |= SelectFlags::EXPANDED;
        Ok(())
    }

    fn expand_from_item(&mut self, item: &mut SrcItem) -> Result<()> {
        if item.table.is_some() {
            return Ok(());
        }
        if let Some(sub) = item.subquery.as_deref_mut() {
            self.prepare_select(sub)?;
            let name = item.alias.clone().unwrap_or_else(|| format!("subquery_{}", self.v.n_cursor()));
            item.table = Some(synth_table(&name, sub, &[])?);
            item.cursor = self.alloc_cursor();
            return Ok(());
        }

        let name = item.name.clone().unwrap_or_default();
        if let Some(idx) = self.ctes.iter().rposition(|b| same_name(&b.cte.name, &name)) {
            return self.expand_cte_ref(item, idx);
        }

        let table = self.schema.require_table(&name)?;
        if table.is_view() {
            let body = self.expand_view(&table)?;
            let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
            item.table = Some(synth_table(&table.name, &body, &columns)?);
            item.subquery = Some(body);
        } else {
            item.table = Some(table);
        }
        item.cursor = self.alloc_cursor();
        Ok(())
    }

    /// Columns of a view declared without a column list, named and typed
    /// after the result of its body
    pub(crate) fn view_columns(&mut self, name: &str, body: &Select) -> Result<Vec<Column>> {
        let mut body = Box::new(body.clone());
        self.expanding_views.push(name.to_string());
        let r = self.prepare_select(&mut body);
        self.expanding_views.pop();
        r?;
        let table = synth_table(name, &body, &[])?;
        Ok(table.columns.clone())
    }

    /// Prepared copy of a view body; a view sees neither the statement's
    /// CTEs nor enclosing queries
    fn expand_view(&mut self, view: &Table) -> Result<Box<Select>> {
        if self.expanding_views.iter().any(|v| same_name(v, &view.name)) {
            return Err(Error::sql(format!("view {} is circularly defined", view.name)));
        }
        let mut body = view
            .view
            .clone()
            .ok_or_else(|| Error::sql(format!("no such view: {}", view.name)))?;
        let ctes = std::mem::take(&mut self.ctes);
        let scopes = std::mem::take(&mut self.scopes);
        self.expanding_views.push(view.name.clone());
        let r = self.prepare_select(&mut body);
        self.expanding_views.pop();
        self.ctes = ctes;
        self.scopes = scopes;
        r?;
        trace!(view = %view.name, "view expanded");
        Ok(body)
    }

    fn expand_cte_ref(&mut self, item: &mut SrcItem, idx: usize) -> Result<()> {
        let binding = &self.ctes[idx];
        if let Some((cursor, table)) = &binding.recursive_ref {
            item.cursor = *cursor;
            item.table = Some(table.clone());
            item.is_recursive_ref = true;
            return Ok(());
        }
        if binding.expanding {
            return Err(Error::sql(format!("circular reference: {}", binding.cte.name)));
        }
        let cte = binding.cte.clone();
        let recursive = binding.recursive && cte.select.terms().any(|t| term_references(t, &cte.name));
        let mut body = cte.select.clone();

        // The body sees the CTEs declared before it and itself
        let later = self.ctes.split_off(idx + 1);
        self.ctes[idx].expanding = true;
        let r = if recursive {
            self.prepare_recursive_cte(idx, &mut body)
        } else {
            self.prepare_select(&mut body)
        };
        self.ctes[idx].expanding = false;
        self.ctes[idx].recursive_ref = None;
        self.ctes.extend(later);
        r?;

        item.table = Some(synth_table(&cte.name, &body, &cte.columns)?);
        item.subquery = Some(body);
        item.cursor = self.alloc_cursor();
        trace!(cte = %cte.name, recursive, cursor = item.cursor, "cte expanded");
        Ok(())
    }
}

/// USING list implied by a NATURAL join: the columns `item` shares with
/// the items before it
fn natural_columns(before: &[SrcItem], item: &SrcItem) -> Vec<String> {
    let Some(table) = &item.table else { return Vec::new() };
    table
        .columns
        .iter()
        .filter(|c| {
            before.iter().any(|b| {
                b.table
                    .as_ref()
                    .map_or(false, |t| t.columns.iter().any(|x| same_name(&x.name, &c.name)))
            })
        })
        .map(|c| c.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::tests::{compile, db_with};
    use crate::api::config::DbConfig;

    fn names(sql: &str) -> Vec<String> {
        let db = db_with("CREATE TABLE t(a, b); CREATE TABLE u(b, c); CREATE VIEW v AS SELECT a, b * 2 AS d FROM t;");
        compile(&db, &DbConfig::default(), sql).unwrap().1
    }

    fn error(sql: &str) -> String {
        let db = db_with("CREATE TABLE t(a, b); CREATE TABLE u(b, c);");
        compile(&db, &DbConfig::default(), sql).unwrap_err().to_string()
    }

    #[test]
    fn test_natural_join_hides_shared_column() {
        assert_eq!(names("SELECT * FROM t NATURAL JOIN u"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_values_subquery_columns() {
        assert_eq!(names("SELECT * FROM (VALUES(1, 2), (3, 4))"), vec!["column1", "column2"]);
        assert_eq!(names("SELECT column2 FROM (VALUES(1, 2))"), vec!["column2"]);
    }

    #[test]
    fn test_table_star() {
        assert_eq!(names("SELECT u.* FROM t, u"), vec!["b", "c"]);
    }

    #[test]
    fn test_view_columns() {
        assert_eq!(names("SELECT * FROM v"), vec!["a", "d"]);
    }

    #[test]
    fn test_cte_column_list() {
        assert_eq!(names("WITH w(x, y) AS (SELECT a, b FROM t) SELECT * FROM w"), vec!["x", "y"]);
    }

    #[test]
    fn test_compound_width_mismatch() {
        assert_eq!(
            error("SELECT a FROM t UNION SELECT b, c FROM u"),
            "SELECTs to the left and right of UNION do not have the same number of result columns"
        );
    }

    #[test]
    fn test_star_without_from() {
        assert_eq!(error("SELECT *"), "no tables specified");
    }

    #[test]
    fn test_right_join_rejected() {
        assert_eq!(
            error("SELECT * FROM t RIGHT JOIN u ON t.b = u.b"),
            "RIGHT and FULL OUTER JOINs are not currently supported"
        );
    }

    #[test]
    fn test_cte_width_mismatch() {
        assert_eq!(
            error("WITH w(x) AS (SELECT a, b FROM t) SELECT * FROM w"),
            "table w has 2 values for 1 columns"
        );
    }
}
