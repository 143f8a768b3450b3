//! SELECT code generation
//!
//! A select is compiled in two steps. [`Parse::prepare_select`] expands
//! `*`, binds every FROM item to a table (views, CTEs and subqueries get a
//! synthesized one) and resolves names, in place. [`Parse::code_select`]
//! then rewrites a private copy and emits the loops, handing each result
//! row to a [`SelectDest`].
//!
//! The rewrites of a simple select run in a fixed order: LEFT JOIN
//! reduction, subquery flattening, constant propagation, push-down of
//! WHERE terms into the remaining subqueries and HAVING-to-WHERE. After
//! that the select is coded by one of three back ends: a plain loop, an
//! aggregate without GROUP BY, or a GROUP BY fed by a sorter or by an
//! index that already delivers rows grouped.

pub mod aggregate;
mod compound;
mod cte;
mod disposer;
mod expand;
mod flatten;
mod propagate;
mod sort;

use std::sync::Arc;

use tracing::{debug, trace};

use crate::api::config::Optimizations;
use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::expr_collation;
use crate::executor::where_clause::{ItemKind, WhereItem, WhereOptions};
use crate::executor::{CursorSource, Parse};
use crate::parser::ast::{Expr, Select, SelectFlags};
use crate::schema::{Affinity, IndexTarget};
use crate::vdbe::{KeyInfo, Label, Opcode, P4};

pub use disposer::Limits;
pub(crate) use flatten::transform_select_exprs;

/// What happens to each result row
#[derive(Debug, Clone, PartialEq)]
pub enum SelectDest {
    /// Return the row to the caller (`ResultRow`)
    Output,
    /// Store the first row in registers starting at `base`, then stop
    Mem { base: i32 },
    /// Set `reg` to 1 if there is any row, then stop
    Exists { reg: i32 },
    /// Insert the single column into a transient index (IN operator)
    Set { cursor: i32, affinity: Option<Affinity> },
    /// Append the row to a transient table
    EphemTable { cursor: i32 },
    /// Insert the row as a key of a transient index, dropping duplicates
    Union { cursor: i32 },
    /// Remove the row from a transient index
    Except { cursor: i32 },
    /// Copy the row to `base..` and yield to the coroutine's caller
    Coroutine { reg: i32, base: i32 },
    /// Append to the queue of a recursive CTE; with `distinct`, rows
    /// already seen are dropped
    Queue { cursor: i32, distinct: Option<i32> },
    /// Evaluate and forget
    Discard,
}

impl SelectDest {
    /// Only the first row matters
    pub fn first_row_only(&self) -> bool {
        matches!(self, SelectDest::Mem { .. } | SelectDest::Exists { .. })
    }
}

impl<'a> Parse<'a> {
    // ========================================================================
    // Entry points
    // ========================================================================

    /// Expand and resolve `sel` in place; a no-op once done
    pub fn prepare_select(&mut self, sel: &mut Select) -> Result<()> {
        if sel.flags.contains(SelectFlags::RESOLVED) {
            return Ok(());
        }
        let pushed = self.push_ctes(sel.with.as_ref());
        let r = self.expand_select(sel).and_then(|_| self.resolve_select(sel));
        self.pop_ctes(pushed);
        r
    }

    /// Compile a top-level SELECT that returns its rows; gives the result
    /// column names
    pub fn compile_select(&mut self, sel: &mut Select) -> Result<Vec<String>> {
        self.prepare_select(sel)?;
        self.code_select(sel, SelectDest::Output)?;
        Ok(sel.names.clone())
    }

    /// Emit code running a prepared select into `dest`
    pub fn code_select(&mut self, sel: &Select, dest: SelectDest) -> Result<()> {
        if !sel.flags.contains(SelectFlags::RESOLVED) {
            return Err(Error::with_message(ErrorCode::Internal, "select coded before it was prepared"));
        }
        let sel = sel.clone();
        if sel.flags.contains(SelectFlags::RECURSIVE) {
            return self.code_recursive(sel, dest);
        }
        if sel.is_compound() {
            return self.code_compound(sel, dest);
        }
        self.code_simple(sel, dest)
    }

    // ========================================================================
    // Simple select
    // ========================================================================

    fn code_simple(&mut self, mut sel: Select, dest: SelectDest) -> Result<()> {
        self.rewrite_select(&mut sel)?;

        let done = self.v.make_label();
        let limits = self.code_limits(&sel, done)?;
        let items = self.code_from_items(&sel)?;

        if sel.flags.contains(SelectFlags::AGGREGATE) {
            self.code_aggregate(&mut sel, &items, &dest, limits, done)?;
        } else {
            self.code_plain(&sel, &items, &dest, limits, done)?;
        }
        self.v.resolve_label(done);
        Ok(())
    }

    /// Non-aggregate loop
    fn code_plain(
        &mut self,
        sel: &Select,
        items: &[WhereItem],
        dest: &SelectDest,
        limits: Limits,
        done: Label,
    ) -> Result<()> {
        let results: Vec<_> = sel.result_exprs().cloned().collect();
        let n = results.len();
        let mut sorter = if sel.order_by.is_empty() {
            None
        } else {
            Some(self.sort_open(&sel.order_by, n))
        };
        let distinct = if !sel.distinct {
            None
        } else if self.distinct_is_redundant(sel, &results) {
            debug!("DISTINCT dropped: rows are already unique");
            None
        } else {
            Some(self.open_distinct(&results))
        };

        let mut opts = WhereOptions::default();
        if sorter.is_some() && self.config.enabled(Optimizations::ORDERBY_INDEX) {
            opts.order_by = sel.order_by.clone();
        }
        let info = self.where_begin(items, sel.where_clause.as_ref(), &opts)?;
        if let Some(s) = sorter.take() {
            if info.order_satisfied && !opts.order_by.is_empty() {
                debug!("ORDER BY satisfied by the loop");
                self.v.change_to_noop(s.open_addr);
            } else {
                sorter = Some(s);
            }
        }
        let cont = info.continue_label();
        let sink = RowSink {
            dest,
            limits,
            distinct,
            sorter: sorter.as_ref(),
            done,
        };
        self.emit_row(&results, &sink, cont)?;
        self.where_end(info)?;

        if let Some(s) = &sorter {
            self.sort_output(s, n, dest, limits, done)?;
        }
        Ok(())
    }

    /// Evaluate the result expressions and pass the row on through
    /// DISTINCT, the ORDER BY sorter or straight to the destination
    pub(super) fn emit_row(&mut self, results: &[Expr], sink: &RowSink, cont: Label) -> Result<()> {
        let n = results.len();
        let base = self.alloc_reg(n as i32);
        self.expr_code_list(results, base)?;
        if let Some(d) = sink.distinct {
            self.code_distinct(d, base, n, cont);
        }
        match sink.sorter {
            Some(s) => self.sort_push(s, results, base),
            None => self.dispose_row(sink.dest, base, n, sink.limits, cont, sink.done),
        }
    }

    /// A DISTINCT over one table whose result includes the rowid, or every
    /// column of a full UNIQUE index on NOT NULL columns, cannot repeat rows
    fn distinct_is_redundant(&self, sel: &Select, results: &[Expr]) -> bool {
        if !self.config.enabled(Optimizations::DISTINCT_OPT) || sel.from.len() != 1 {
            return false;
        }
        let item = &sel.from[0];
        let table = match &item.table {
            Some(t) if item.subquery.is_none() && !item.is_recursive_ref && t.view.is_none() => t,
            _ => return false,
        };
        let mut cols = Vec::new();
        for e in results {
            if let Expr::Column(c) = e {
                if c.cursor == item.cursor {
                    cols.push(c);
                }
            }
        }
        let is_rowid = |col: i32| col < 0 || table.ipk.map_or(false, |ipk| ipk as i32 == col);
        if !table.without_rowid && cols.iter().any(|c| is_rowid(c.column)) {
            return true;
        }
        table.indexes.iter().any(|idx| {
            idx.unique
                && idx.partial.is_none()
                && idx.columns[..idx.n_key_col].iter().all(|ic| {
                    let IndexTarget::Column(col) = ic.target else {
                        return false;
                    };
                    let Some(column) = table.columns.get(col) else {
                        return false;
                    };
                    column.not_null.is_some()
                        && cols.iter().any(|c| {
                            c.column == col as i32 && c.collation.unwrap_or(column.collation) == ic.collation
                        })
                })
        })
    }

    /// Transient index holding rows already returned by a DISTINCT select
    pub(super) fn open_distinct(&mut self, results: &[Expr]) -> i32 {
        let cursor = self.alloc_cursor();
        let mut ki = KeyInfo::new(results.len());
        for (i, e) in results.iter().enumerate() {
            ki.collations[i] = expr_collation(e);
        }
        self.v
            .add_op4(Opcode::OpenEphemeral, cursor, results.len() as i32, 0, P4::KeyInfo(Arc::new(ki)));
        self.v.comment("distinct");
        cursor
    }

    /// Skip to `cont` when the row in `base..base+n` was seen before
    pub(super) fn code_distinct(&mut self, cursor: i32, base: i32, n: usize, cont: Label) {
        self.v
            .add_op4(Opcode::Found, cursor, cont.value(), base, P4::Int64(n as i64));
        let rec = self.alloc_reg(1);
        self.v.add_op(Opcode::MakeRecord, base, n as i32, rec);
        self.v.add_op2(Opcode::IdxInsert, cursor, rec);
    }

    // ========================================================================
    // FROM items
    // ========================================================================

    /// Run or set up the FROM-clause subqueries and describe every item to
    /// the planner
    fn code_from_items(&mut self, sel: &Select) -> Result<Vec<WhereItem>> {
        let mut items = Vec::with_capacity(sel.from.len());
        for (i, item) in sel.from.iter().enumerate() {
            let table = item
                .table
                .clone()
                .ok_or_else(|| Error::with_message(ErrorCode::Internal, "FROM item was not bound"))?;
            let left_join = item.join.is_left();
            let kind = if item.is_recursive_ref {
                ItemKind::Ephemeral
            } else if let Some(sub) = item.subquery.as_deref() {
                self.code_from_subquery(sub, item.cursor, i == 0 && !left_join)?
            } else {
                items.push(WhereItem {
                    left_join,
                    ..WhereItem::table(item.cursor, table)
                });
                continue;
            };
            items.push(WhereItem {
                cursor: item.cursor,
                table,
                left_join,
                kind,
                opened: true,
            });
        }
        Ok(items)
    }

    /// A FROM-clause subquery becomes a coroutine when it drives the
    /// outermost loop, otherwise it is materialized into a transient table
    fn code_from_subquery(&mut self, sub: &Select, cursor: i32, outermost: bool) -> Result<ItemKind> {
        let n = sub.column_count() as i32;
        if outermost && self.config.enabled(Optimizations::COROUTINES) {
            let reg = self.alloc_reg(1);
            let base = self.alloc_reg(n);
            let after = self.v.make_label();
            let start = self.v.current_addr() + 1;
            self.v.add_jump(Opcode::InitCoroutine, reg, after, start);
            self.code_select(sub, SelectDest::Coroutine { reg, base })?;
            self.v.add_op1(Opcode::EndCoroutine, reg);
            self.v.resolve_label(after);
            self.sources.insert(
                cursor,
                CursorSource::Registers {
                    base,
                    rowid: None,
                    ipk: None,
                },
            );
            trace!(cursor, reg, "subquery as coroutine");
            return Ok(ItemKind::Coroutine { reg });
        }

        let once = self.v.make_label();
        if !sub.flags.contains(SelectFlags::CORRELATED) {
            self.v.add_jump(Opcode::Once, 0, once, 0);
        }
        self.v.add_op2(Opcode::OpenEphemeral, cursor, n);
        self.code_select(sub, SelectDest::EphemTable { cursor })?;
        self.v.resolve_label(once);
        self.sources.insert(cursor, CursorSource::Ephemeral);
        trace!(cursor, "subquery materialized");
        Ok(ItemKind::Ephemeral)
    }
}

/// Where [`Parse::emit_row`] sends a row
pub(super) struct RowSink<'s> {
    pub dest: &'s SelectDest,
    pub limits: Limits,
    pub distinct: Option<i32>,
    pub sorter: Option<&'s sort::SortCtx>,
    pub done: Label,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DbConfig;
    use crate::parser::ast::Stmt;
    use crate::parser::parse;
    use crate::storage::Database;
    use crate::vdbe::Program;

    pub(super) fn db_with(sql: &str) -> Database {
        let mut db = Database::new();
        for stmt in parse(sql).unwrap() {
            match stmt {
                Stmt::CreateTable(ct) => {
                    crate::schema::build::create_table(&mut db, &ct).unwrap();
                }
                Stmt::CreateIndex(ci) => {
                    crate::schema::build::create_index(&mut db, &ci).unwrap();
                }
                Stmt::CreateView(cv) => {
                    crate::schema::build::create_view(&mut db, &cv).unwrap();
                }
                other => panic!("unexpected statement {:?}", other),
            }
        }
        db
    }

    pub(super) fn compile(db: &Database, config: &DbConfig, sql: &str) -> Result<(Program, Vec<String>)> {
        let mut stmts = parse(sql)?;
        let mut sel = match stmts.remove(0) {
            Stmt::Select(s) => s,
            other => panic!("not a select: {:?}", other),
        };
        let mut p = Parse::new(&db.schema, config);
        let names = p.compile_select(&mut sel)?;
        let program = p.finish(names.clone())?;
        Ok((program, names))
    }

    fn has_op(program: &Program, opcode: Opcode) -> bool {
        program.ops.iter().any(|op| op.opcode == opcode)
    }

    #[test]
    fn test_star_names() {
        let db = db_with("CREATE TABLE t(a, b, c);");
        let (_, names) = compile(&db, &DbConfig::default(), "SELECT *, a AS x, b + 1 FROM t").unwrap();
        assert_eq!(names, vec!["a", "b", "c", "x", "b + 1"]);
    }

    #[test]
    fn test_order_by_without_index_sorts() {
        let db = db_with("CREATE TABLE t(a, b);");
        let (program, _) = compile(&db, &DbConfig::default(), "SELECT a FROM t ORDER BY b").unwrap();
        assert!(has_op(&program, Opcode::SorterSort));
    }

    #[test]
    fn test_order_by_rowid_needs_no_sorter() {
        let db = db_with("CREATE TABLE t(a INTEGER PRIMARY KEY, b);");
        let (program, _) = compile(&db, &DbConfig::default(), "SELECT b FROM t ORDER BY a DESC").unwrap();
        assert!(!has_op(&program, Opcode::SorterSort));
        assert!(has_op(&program, Opcode::Prev));
    }

    #[test]
    fn test_order_by_index_disabled() {
        let db = db_with("CREATE TABLE t(a INTEGER PRIMARY KEY, b);");
        let mut config = DbConfig::default();
        config.set_optimizations(Optimizations::ORDERBY_INDEX, false);
        let (program, _) = compile(&db, &config, "SELECT b FROM t ORDER BY a").unwrap();
        assert!(has_op(&program, Opcode::SorterSort));
    }

    #[test]
    fn test_no_such_table() {
        let db = db_with("CREATE TABLE t(a);");
        let err = compile(&db, &DbConfig::default(), "SELECT * FROM nope").unwrap_err();
        assert_eq!(err.to_string(), "no such table: nope");
    }

    #[test]
    fn test_subquery_outermost_is_coroutine() {
        let db = db_with("CREATE TABLE t(a, b);");
        let mut config = DbConfig::default();
        config.set_optimizations(Optimizations::QUERY_FLATTENER, false);
        let (program, _) = compile(&db, &config, "SELECT x FROM (SELECT a + b AS x FROM t)").unwrap();
        assert!(has_op(&program, Opcode::InitCoroutine));
        assert!(has_op(&program, Opcode::Yield));
    }

    #[test]
    fn test_subquery_materialized_without_coroutines() {
        let db = db_with("CREATE TABLE t(a, b);");
        let mut config = DbConfig::default();
        config.set_optimizations(Optimizations::QUERY_FLATTENER | Optimizations::COROUTINES, false);
        let (program, _) = compile(&db, &config, "SELECT x FROM (SELECT a + b AS x FROM t)").unwrap();
        assert!(!has_op(&program, Opcode::InitCoroutine));
        assert!(has_op(&program, Opcode::OpenEphemeral));
    }

    #[test]
    fn test_distinct_over_unique_key_is_dropped() {
        let db = db_with("CREATE TABLE t(id INTEGER PRIMARY KEY, u TEXT NOT NULL UNIQUE, n UNIQUE, b);");
        let config = DbConfig::default();
        let (program, _) = compile(&db, &config, "SELECT DISTINCT id, b FROM t").unwrap();
        assert!(!has_op(&program, Opcode::OpenEphemeral));
        let (program, _) = compile(&db, &config, "SELECT DISTINCT b, u FROM t").unwrap();
        assert!(!has_op(&program, Opcode::OpenEphemeral));
        // NULLs repeat in a UNIQUE column that allows them
        let (program, _) = compile(&db, &config, "SELECT DISTINCT n FROM t").unwrap();
        assert!(has_op(&program, Opcode::OpenEphemeral));
    }

    #[test]
    fn test_distinct_kept_when_disabled() {
        let db = db_with("CREATE TABLE t(id INTEGER PRIMARY KEY, b);");
        let mut config = DbConfig::default();
        config.set_optimizations(Optimizations::DISTINCT_OPT, false);
        let (program, _) = compile(&db, &config, "SELECT DISTINCT id, b FROM t").unwrap();
        assert!(has_op(&program, Opcode::OpenEphemeral));
    }
}
