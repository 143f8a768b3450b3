//! Schema construction for DDL
//!
//! Turns CREATE/DROP statements into schema objects and B-trees. Every
//! successful change bumps the schema cookie so that statements compiled
//! against the old schema recompile before they run. Populating a new
//! index needs the code generator and lives in `executor::ddl`.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::api::config::DbConfig;
use crate::error::{Error, Result};
use crate::executor::Parse;
use crate::parser::ast::{
    ColumnConstraint, ConflictAction, CreateIndexStmt, CreateTableStmt, CreateTriggerStmt,
    CreateViewStmt, DropStmt, Expr, IndexedColumn, ObjectKind, SortOrder, TableConstraint,
    TriggerTiming,
};
use crate::schema::{
    type_affinity, CheckConstraint, Column, ForeignKey, Index, IndexColumn, IndexOrigin,
    IndexTarget, Schema, Table, Trigger, SEQUENCE_TABLE,
};
use crate::storage::Database;
use crate::types::Value;
use crate::vdbe::ops::KeyInfo;
use crate::vdbe::record::decode_record;
use crate::vdbe::value::{collation_or_error, Collation};

/// KeyInfo describing the entries of `index`
pub fn index_key_info(index: &Index) -> KeyInfo {
    KeyInfo {
        collations: index.columns.iter().map(|c| c.collation).collect(),
        sort_orders: index.columns.iter().map(|c| c.order == SortOrder::Desc).collect(),
        n_key_field: index.columns.len(),
    }
}

fn check_reserved(name: &str) -> Result<()> {
    if name.len() >= 7 && name[..7].eq_ignore_ascii_case("sqlite_") {
        return Err(Error::sql(format!("object name reserved for internal use: {}", name)));
    }
    Ok(())
}

fn object_exists(schema: &Schema, name: &str) -> Option<&'static str> {
    if let Some(t) = schema.table(name) {
        return Some(if t.is_view() { "view" } else { "table" });
    }
    if schema.index(name).is_some() {
        return Some("index");
    }
    None
}

/// Whether a DEFAULT expression can be evaluated without a row
fn is_constant_default(expr: &Expr) -> bool {
    !expr.any(&mut |e| {
        matches!(
            e,
            Expr::Id(_)
                | Expr::Qualified(..)
                | Expr::Column(_)
                | Expr::Variable(_)
                | Expr::Subquery(_)
                | Expr::Exists(_)
                | Expr::InSelect { .. }
                | Expr::Raise(..)
        )
    })
}

// ============================================================================
// CREATE TABLE
// ============================================================================

/// Candidate index collected while walking the constraints
struct PendingIndex {
    columns: Vec<(usize, Collation, SortOrder)>,
    conflict: Option<ConflictAction>,
    origin: IndexOrigin,
}

/// Declared PRIMARY KEY: columns, policy, AUTOINCREMENT
type PkDecl = (Vec<IndexedColumn>, Option<ConflictAction>, bool);

fn set_pk(pk: &mut Option<PkDecl>, value: PkDecl, table: &str) -> Result<()> {
    if pk.is_some() {
        return Err(Error::sql(format!("table \"{}\" has more than one primary key", table)));
    }
    *pk = Some(value);
    Ok(())
}

/// Build the Table for a CREATE TABLE statement, allocating its roots
pub fn build_table(schema: &mut Schema, stmt: &CreateTableStmt) -> Result<Table> {
    let mut table = Table::new(stmt.name.clone());
    table.without_rowid = stmt.without_rowid;

    let mut seen = HashSet::new();
    for def in &stmt.columns {
        if !seen.insert(def.name.to_ascii_lowercase()) {
            return Err(Error::sql(format!("duplicate column name: {}", def.name)));
        }
        let mut col = Column::new(def.name.clone());
        col.type_name = def.type_name.clone();
        col.affinity = type_affinity(def.type_name.as_deref().unwrap_or(""));
        table.columns.push(col);
    }

    let mut pk: Option<PkDecl> = None;
    let mut pending: Vec<PendingIndex> = Vec::new();

    for (i, def) in stmt.columns.iter().enumerate() {
        for cons in &def.constraints {
            match cons {
                ColumnConstraint::PrimaryKey {
                    order,
                    conflict,
                    autoincrement,
                } => {
                    let ic = IndexedColumn {
                        expr: Expr::id(def.name.clone()),
                        collation: None,
                        order: *order,
                    };
                    set_pk(&mut pk, (vec![ic], *conflict, *autoincrement), &stmt.name)?;
                }
                ColumnConstraint::NotNull { conflict } => {
                    table.columns[i].not_null = Some(conflict.unwrap_or_default());
                }
                ColumnConstraint::Null => {}
                ColumnConstraint::Unique { conflict } => pending.push(PendingIndex {
                    columns: vec![(i, Collation::Binary, SortOrder::Asc)],
                    conflict: *conflict,
                    origin: IndexOrigin::Unique,
                }),
                ColumnConstraint::Check { name, expr } => table.checks.push(CheckConstraint {
                    name: name.clone(),
                    expr: expr.clone(),
                }),
                ColumnConstraint::Default(expr) => {
                    if !is_constant_default(expr) {
                        return Err(Error::sql(format!(
                            "default value of column [{}] is not constant",
                            def.name
                        )));
                    }
                    table.columns[i].default = Some(expr.clone());
                }
                ColumnConstraint::Collate(name) => {
                    table.columns[i].collation = collation_or_error(name)?;
                }
                ColumnConstraint::References(clause) => table.foreign_keys.push(ForeignKey {
                    columns: vec![i],
                    parent: clause.table.clone(),
                    parent_columns: clause.columns.clone(),
                    on_delete: clause.on_delete,
                    on_update: clause.on_update,
                }),
            }
        }
    }
    for p in &mut pending {
        for c in &mut p.columns {
            c.1 = table.columns[c.0].collation;
        }
    }

    for cons in &stmt.constraints {
        match cons {
            TableConstraint::PrimaryKey {
                columns,
                conflict,
                autoincrement,
                ..
            } => set_pk(&mut pk, (columns.clone(), *conflict, *autoincrement), &stmt.name)?,
            TableConstraint::Unique { columns, conflict, .. } => {
                let cols = resolve_indexed_columns(&table, columns)?;
                pending.push(PendingIndex {
                    columns: cols,
                    conflict: *conflict,
                    origin: IndexOrigin::Unique,
                });
            }
            TableConstraint::Check { name, expr } => table.checks.push(CheckConstraint {
                name: name.clone(),
                expr: expr.clone(),
            }),
            TableConstraint::ForeignKey { columns, clause, .. } => {
                let mut ords = Vec::with_capacity(columns.len());
                for name in columns {
                    match table.column_index(name) {
                        Some(i) if i >= 0 => ords.push(i as usize),
                        _ => {
                            return Err(Error::sql(format!(
                                "unknown column \"{}\" in foreign key definition",
                                name
                            )))
                        }
                    }
                }
                if !clause.columns.is_empty() && clause.columns.len() != ords.len() {
                    return Err(Error::sql(
                        "number of columns in foreign key does not match the number of columns in the referenced table",
                    ));
                }
                table.foreign_keys.push(ForeignKey {
                    columns: ords,
                    parent: clause.table.clone(),
                    parent_columns: clause.columns.clone(),
                    on_delete: clause.on_delete,
                    on_update: clause.on_update,
                });
            }
        }
    }

    // PRIMARY KEY: rowid alias, autoindex, or WITHOUT ROWID storage key
    let mut autoincrement = false;
    if let Some((cols, conflict, autoinc)) = pk {
        let resolved = resolve_indexed_columns(&table, &cols)?;
        for (c, _, _) in &resolved {
            table.columns[*c].primary_key = true;
        }
        table.pk_columns = resolved.iter().map(|(c, _, _)| *c).collect();
        table.pk_on_conflict = conflict.unwrap_or_default();
        let is_integer = resolved.len() == 1
            && table.columns[resolved[0].0]
                .type_name
                .as_deref()
                .map_or(false, |t| t.eq_ignore_ascii_case("INTEGER"));
        let ipk = !table.without_rowid && is_integer && resolved[0].2 == SortOrder::Asc;
        if ipk {
            table.ipk = Some(resolved[0].0);
        } else {
            pending.insert(
                0,
                PendingIndex {
                    columns: resolved,
                    conflict,
                    origin: IndexOrigin::PrimaryKey,
                },
            );
        }
        if autoinc {
            if table.without_rowid {
                return Err(Error::sql("AUTOINCREMENT not allowed on WITHOUT ROWID tables"));
            }
            if !ipk {
                return Err(Error::sql("AUTOINCREMENT is only allowed on an INTEGER PRIMARY KEY"));
            }
            autoincrement = true;
        }
    } else if table.without_rowid {
        return Err(Error::sql(format!("PRIMARY KEY missing on table {}", stmt.name)));
    }
    table.autoincrement = autoincrement;

    if table.without_rowid {
        for &c in &table.pk_columns {
            if table.columns[c].not_null.is_none() {
                table.columns[c].not_null = Some(ConflictAction::Abort);
            }
        }
    }

    // Collapse duplicate constraints over the same columns
    let mut kept: Vec<PendingIndex> = Vec::new();
    for p in pending {
        let same = |q: &PendingIndex| {
            q.columns.len() == p.columns.len()
                && q.columns.iter().zip(&p.columns).all(|(a, b)| a.0 == b.0 && a.1 == b.1)
        };
        if let Some(existing) = kept.iter_mut().find(|q| same(q)) {
            match (existing.conflict, p.conflict) {
                (Some(a), Some(b)) if a != b => {
                    return Err(Error::sql("conflicting ON CONFLICT clauses specified"))
                }
                (None, Some(b)) => existing.conflict = Some(b),
                _ => {}
            }
            continue;
        }
        kept.push(p);
    }

    let table_name = table.name.clone();
    let mut indexes = Vec::with_capacity(kept.len());
    for (n, p) in kept.into_iter().enumerate() {
        let mut columns: Vec<IndexColumn> = p
            .columns
            .iter()
            .map(|&(c, coll, order)| IndexColumn {
                target: IndexTarget::Column(c),
                collation: coll,
                order,
            })
            .collect();
        let n_key_col = columns.len();
        append_row_identifier(&table, &mut columns, p.origin == IndexOrigin::PrimaryKey);
        indexes.push(Index {
            name: format!("sqlite_autoindex_{}_{}", table_name, n + 1),
            table: table_name.clone(),
            columns,
            n_key_col,
            unique: true,
            on_conflict: p.conflict.unwrap_or_default(),
            partial: None,
            origin: p.origin,
            root: schema.alloc_root(),
            affinity: OnceLock::new(),
        });
    }
    table.indexes = order_indexes(indexes.into_iter().map(Arc::new).collect());
    table.root = match table.pk_index() {
        Some(pk) => pk.root,
        None => schema.alloc_root(),
    };
    Ok(table)
}

/// Map indexed terms of a constraint to column ordinals with their collation
fn resolve_indexed_columns(
    table: &Table,
    cols: &[IndexedColumn],
) -> Result<Vec<(usize, Collation, SortOrder)>> {
    let mut out = Vec::with_capacity(cols.len());
    for ic in cols {
        let name = ic
            .column_name()
            .ok_or_else(|| Error::sql("expressions prohibited in PRIMARY KEY and UNIQUE constraints"))?;
        let c = match table.column_index(name) {
            Some(c) if c >= 0 => c as usize,
            _ => return Err(Error::sql(format!("no such column: {}", name))),
        };
        let coll = match &ic.collation {
            Some(n) => collation_or_error(n)?,
            None => table.columns[c].collation,
        };
        if !out.iter().any(|(o, _, _): &(usize, Collation, SortOrder)| *o == c) {
            out.push((c, coll, ic.order));
        }
    }
    Ok(out)
}

/// Append what identifies the row: the rowid, the primary key columns of a
/// WITHOUT ROWID table, or (for its primary key index) every other column
fn append_row_identifier(table: &Table, columns: &mut Vec<IndexColumn>, is_pk: bool) {
    if !table.without_rowid {
        columns.push(IndexColumn {
            target: IndexTarget::Rowid,
            collation: Collation::Binary,
            order: SortOrder::Asc,
        });
        return;
    }
    let tail: Vec<usize> = if is_pk {
        (0..table.columns.len()).collect()
    } else {
        table.pk_columns.clone()
    };
    for c in tail {
        if !columns.iter().any(|ic| ic.target == IndexTarget::Column(c)) {
            columns.push(IndexColumn::column(c, table.columns[c].collation));
        }
    }
}

/// Stable reorder placing REPLACE-policy indexes after all others
fn order_indexes(indexes: Vec<Arc<Index>>) -> Vec<Arc<Index>> {
    let (mut rest, replace): (Vec<_>, Vec<_>) = indexes
        .into_iter()
        .partition(|i| i.on_conflict != ConflictAction::Replace);
    rest.extend(replace);
    rest
}

fn create_trees(db: &mut Database, table: &Table) {
    if !table.without_rowid {
        db.btree.create_table(table.root);
    }
    for idx in &table.indexes {
        db.btree.create_index(idx.root, Arc::new(index_key_info(idx)));
    }
}

/// CREATE TABLE; returns false when IF NOT EXISTS skipped it
pub fn create_table(db: &mut Database, stmt: &CreateTableStmt) -> Result<bool> {
    if let Some(kind) = object_exists(&db.schema, &stmt.name) {
        if stmt.if_not_exists && kind != "index" {
            return Ok(false);
        }
        return Err(Error::sql(format!("{} {} already exists", kind, stmt.name)));
    }
    check_reserved(&stmt.name)?;
    let table = build_table(&mut db.schema, stmt)?;
    create_trees(db, &table);
    let autoinc = table.autoincrement;
    debug!(table = %table.name, indexes = table.indexes.len(), root = table.root, "create table");
    db.schema.put_table(table);
    if autoinc {
        ensure_sequence_table(db);
    }
    db.schema.bump_cookie();
    Ok(true)
}

/// Create `sqlite_sequence(name, seq)` unless it already exists
pub fn ensure_sequence_table(db: &mut Database) -> Arc<Table> {
    if let Some(t) = db.schema.table(SEQUENCE_TABLE) {
        return t;
    }
    let mut t = Table::new(SEQUENCE_TABLE);
    t.columns.push(Column::new("name"));
    t.columns.push(Column::new("seq"));
    t.root = db.schema.alloc_root();
    db.btree.create_table(t.root);
    debug!(root = t.root, "create sqlite_sequence");
    db.schema.put_table(t)
}

// ============================================================================
// CREATE INDEX
// ============================================================================

/// Build an Index for CREATE INDEX on `table`, allocating its root
pub fn build_index(schema: &mut Schema, table: &Table, stmt: &CreateIndexStmt) -> Result<Index> {
    let mut columns = Vec::with_capacity(stmt.columns.len());
    for ic in &stmt.columns {
        let (target, default_coll) = match ic.expr.skip_wrappers() {
            Expr::Id(name) => match table.column_index(name) {
                Some(c) if c >= 0 => (IndexTarget::Column(c as usize), table.columns[c as usize].collation),
                _ => return Err(Error::sql(format!("no such column: {}", name))),
            },
            other => {
                if other.any(&mut |e| {
                    matches!(e, Expr::Subquery(_) | Expr::Exists(_) | Expr::InSelect { .. } | Expr::Variable(_))
                }) {
                    return Err(Error::sql("subqueries prohibited in index expressions"));
                }
                (IndexTarget::Expr(other.clone()), Collation::Binary)
            }
        };
        let collation = match &ic.collation {
            Some(n) => collation_or_error(n)?,
            None => default_coll,
        };
        columns.push(IndexColumn {
            target,
            collation,
            order: ic.order,
        });
    }
    let n_key_col = columns.len();
    append_row_identifier(table, &mut columns, false);
    Ok(Index {
        name: stmt.name.clone(),
        table: table.name.clone(),
        columns,
        n_key_col,
        unique: stmt.unique,
        on_conflict: ConflictAction::Abort,
        partial: stmt.where_clause.clone(),
        origin: IndexOrigin::CreateIndex,
        root: schema.alloc_root(),
        affinity: OnceLock::new(),
    })
}

/// Register the index of a CREATE INDEX statement and create its (empty)
/// tree; `None` when IF NOT EXISTS skipped it
pub fn create_index(db: &mut Database, stmt: &CreateIndexStmt) -> Result<Option<(Arc<Table>, Arc<Index>)>> {
    let table = db.schema.require_table(&stmt.table)?;
    if table.is_view() {
        return Err(Error::sql("views may not be indexed"));
    }
    if let Some(kind) = object_exists(&db.schema, &stmt.name) {
        if stmt.if_not_exists && kind == "index" {
            return Ok(None);
        }
        return Err(Error::sql(format!("there is already a {} named {}", kind, stmt.name)));
    }
    check_reserved(&stmt.name)?;
    if table.name.eq_ignore_ascii_case(SEQUENCE_TABLE) {
        return Err(Error::sql(format!("table {} may not be indexed", SEQUENCE_TABLE)));
    }
    let index = Arc::new(build_index(&mut db.schema, &table, stmt)?);
    db.btree.create_index(index.root, Arc::new(index_key_info(&index)));
    let mut updated = (*table).clone();
    updated.indexes.push(index.clone());
    updated.indexes = order_indexes(updated.indexes);
    debug!(index = %index.name, table = %table.name, root = index.root, "create index");
    let table = db.schema.put_table(updated);
    db.schema.bump_cookie();
    Ok(Some((table, index)))
}

// ============================================================================
// CREATE VIEW / CREATE TRIGGER
// ============================================================================

pub fn create_view(db: &mut Database, stmt: &CreateViewStmt) -> Result<bool> {
    if let Some(kind) = object_exists(&db.schema, &stmt.name) {
        if stmt.if_not_exists && kind != "index" {
            return Ok(false);
        }
        return Err(Error::sql(format!("{} {} already exists", kind, stmt.name)));
    }
    check_reserved(&stmt.name)?;
    let mut view = Table::new(stmt.name.clone());
    let config = DbConfig::default();
    let mut columns = Parse::new(&db.schema, &config).view_columns(&stmt.name, &stmt.select)?;
    if !stmt.columns.is_empty() {
        if stmt.columns.len() != columns.len() {
            return Err(Error::sql(format!(
                "expected {} columns for '{}' but got {}",
                stmt.columns.len(),
                stmt.name,
                columns.len()
            )));
        }
        for (column, name) in columns.iter_mut().zip(&stmt.columns) {
            column.name = name.clone();
        }
    }
    view.columns = columns;
    view.view = Some(stmt.select.clone());
    debug!(view = %stmt.name, "create view");
    db.schema.put_table(view);
    db.schema.bump_cookie();
    Ok(true)
}

pub fn create_trigger(db: &mut Database, stmt: &CreateTriggerStmt) -> Result<bool> {
    if db.schema.trigger(&stmt.name).is_some() {
        if stmt.if_not_exists {
            return Ok(false);
        }
        return Err(Error::sql(format!("trigger {} already exists", stmt.name)));
    }
    check_reserved(&stmt.name)?;
    let table = db.schema.require_table(&stmt.table)?;
    if table.name.len() >= 7 && table.name[..7].eq_ignore_ascii_case("sqlite_") {
        return Err(Error::sql("cannot create trigger on system table"));
    }
    match (stmt.timing, table.is_view()) {
        (TriggerTiming::InsteadOf, false) => {
            return Err(Error::sql(format!(
                "cannot create INSTEAD OF trigger on table: {}",
                table.name
            )))
        }
        (TriggerTiming::Before, true) => {
            return Err(Error::sql(format!("cannot create BEFORE trigger on view: {}", table.name)))
        }
        (TriggerTiming::After, true) => {
            return Err(Error::sql(format!("cannot create AFTER trigger on view: {}", table.name)))
        }
        _ => {}
    }
    let trigger = Trigger {
        name: stmt.name.clone(),
        table: table.name.clone(),
        timing: stmt.timing,
        event: stmt.event.clone(),
        when: stmt.when.clone(),
        body: stmt.body.clone(),
    };
    debug!(trigger = %stmt.name, table = %table.name, "create trigger");
    db.schema
        .triggers
        .insert(stmt.name.to_ascii_lowercase(), Arc::new(trigger));
    db.schema.bump_cookie();
    Ok(true)
}

// ============================================================================
// DROP
// ============================================================================

/// DROP TABLE/INDEX/VIEW/TRIGGER
pub fn drop_object(db: &mut Database, stmt: &DropStmt) -> Result<()> {
    match stmt.kind {
        ObjectKind::Table | ObjectKind::View => drop_table(db, stmt),
        ObjectKind::Index => drop_index(db, stmt),
        ObjectKind::Trigger => {
            if db.schema.triggers.remove(&stmt.name.to_ascii_lowercase()).is_none() {
                if stmt.if_exists {
                    return Ok(());
                }
                return Err(Error::sql(format!("no such trigger: {}", stmt.name)));
            }
            debug!(trigger = %stmt.name, "drop trigger");
            db.schema.bump_cookie();
            Ok(())
        }
    }
}

fn drop_table(db: &mut Database, stmt: &DropStmt) -> Result<()> {
    let want_view = stmt.kind == ObjectKind::View;
    let table = match db.schema.table(&stmt.name) {
        Some(t) => t,
        None if stmt.if_exists => return Ok(()),
        None => {
            let what = if want_view { "view" } else { "table" };
            return Err(Error::sql(format!("no such {}: {}", what, stmt.name)));
        }
    };
    if table.name.eq_ignore_ascii_case(SEQUENCE_TABLE) {
        return Err(Error::sql(format!("table {} may not be dropped", SEQUENCE_TABLE)));
    }
    match (want_view, table.is_view()) {
        (true, false) => return Err(Error::sql(format!("use DROP TABLE to delete table {}", table.name))),
        (false, true) => return Err(Error::sql(format!("use DROP VIEW to delete view {}", table.name))),
        _ => {}
    }
    if !table.is_view() {
        if table.has_rowid() {
            db.btree.drop_tree(table.root);
        }
        for idx in &table.indexes {
            db.btree.drop_tree(idx.root);
            db.schema.indexes.remove(&idx.name.to_ascii_lowercase());
        }
        if table.autoincrement {
            forget_sequence(db, &table.name)?;
        }
    }
    db.schema
        .triggers
        .retain(|_, t| !t.table.eq_ignore_ascii_case(&table.name));
    db.schema.tables.remove(&table.name.to_ascii_lowercase());
    debug!(table = %table.name, "drop table");
    db.schema.bump_cookie();
    Ok(())
}

/// Remove the sqlite_sequence row of a dropped table
fn forget_sequence(db: &mut Database, name: &str) -> Result<()> {
    let Some(seq) = db.schema.table(SEQUENCE_TABLE) else {
        return Ok(());
    };
    let rows = db.btree.table_mut(seq.root)?;
    let mut doomed = Vec::new();
    for (rowid, rec) in rows.iter() {
        if let Some(Value::Text(n)) = decode_record(rec)?.first() {
            if n.eq_ignore_ascii_case(name) {
                doomed.push(*rowid);
            }
        }
    }
    for r in doomed {
        rows.remove(&r);
    }
    Ok(())
}

fn drop_index(db: &mut Database, stmt: &DropStmt) -> Result<()> {
    let index = match db.schema.index(&stmt.name) {
        Some(i) => i,
        None if stmt.if_exists => return Ok(()),
        None => return Err(Error::sql(format!("no such index: {}", stmt.name))),
    };
    if index.origin != IndexOrigin::CreateIndex {
        return Err(Error::sql(
            "index associated with UNIQUE or PRIMARY KEY constraint cannot be dropped",
        ));
    }
    let table = db.schema.require_table(&index.table)?;
    let mut updated = (*table).clone();
    updated.indexes.retain(|i| i.name != index.name);
    db.btree.drop_tree(index.root);
    db.schema.indexes.remove(&index.name.to_ascii_lowercase());
    db.schema.put_table(updated);
    debug!(index = %index.name, "drop index");
    db.schema.bump_cookie();
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::Stmt;
    use crate::parser::parse;
    use crate::schema::Affinity;

    fn run(db: &mut Database, sql: &str) -> Result<()> {
        for stmt in parse(sql)? {
            match stmt {
                Stmt::CreateTable(s) => {
                    create_table(db, &s)?;
                }
                Stmt::CreateIndex(s) => {
                    create_index(db, &s)?;
                }
                Stmt::CreateView(s) => {
                    create_view(db, &s)?;
                }
                Stmt::CreateTrigger(s) => {
                    create_trigger(db, &s)?;
                }
                Stmt::Drop(s) => drop_object(db, &s)?,
                other => panic!("unexpected statement {:?}", other),
            }
        }
        Ok(())
    }

    #[test]
    fn test_integer_primary_key_is_rowid_alias() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(id INTEGER PRIMARY KEY, b TEXT)").unwrap();
        let t = db.schema.table("t").unwrap();
        assert_eq!(t.ipk, Some(0));
        assert!(t.indexes.is_empty());
        assert_eq!(t.columns[1].affinity, Affinity::Text);
    }

    #[test]
    fn test_int_primary_key_gets_autoindex() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(id INT PRIMARY KEY, b UNIQUE)").unwrap();
        let t = db.schema.table("t").unwrap();
        assert_eq!(t.ipk, None);
        let names: Vec<_> = t.indexes.iter().map(|i| i.name.clone()).collect();
        assert_eq!(names, vec!["sqlite_autoindex_t_1", "sqlite_autoindex_t_2"]);
        assert!(t.indexes[0].is_primary_key());
        assert_eq!(t.indexes[0].columns.last().unwrap().target, IndexTarget::Rowid);
    }

    #[test]
    fn test_replace_indexes_ordered_last() {
        let mut db = Database::new();
        run(
            &mut db,
            "CREATE TABLE t(a UNIQUE ON CONFLICT REPLACE, b UNIQUE, c UNIQUE ON CONFLICT IGNORE)",
        )
        .unwrap();
        let t = db.schema.table("t").unwrap();
        let policies: Vec<_> = t.indexes.iter().map(|i| i.on_conflict).collect();
        assert_eq!(
            policies,
            vec![ConflictAction::Abort, ConflictAction::Ignore, ConflictAction::Replace]
        );
    }

    #[test]
    fn test_without_rowid_pk_index_is_storage() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE w(a, b, c, PRIMARY KEY(b, a)) WITHOUT ROWID").unwrap();
        let t = db.schema.table("w").unwrap();
        let pk = t.pk_index().unwrap();
        assert_eq!(t.root, pk.root);
        assert_eq!(pk.n_key_col, 2);
        assert_eq!(pk.columns.len(), 3);
        assert_eq!(t.storage_position(1), 0);
        assert_eq!(t.storage_position(2), 2);
        assert_eq!(t.columns[0].not_null, Some(ConflictAction::Abort));
    }

    #[test]
    fn test_autoincrement_creates_sequence_table() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, x)").unwrap();
        assert!(db.schema.table(SEQUENCE_TABLE).is_some());
        let err = run(&mut db, "CREATE TABLE u(id TEXT PRIMARY KEY AUTOINCREMENT)").unwrap_err();
        assert_eq!(err.errmsg(), "AUTOINCREMENT is only allowed on an INTEGER PRIMARY KEY");
    }

    #[test]
    fn test_ddl_bumps_cookie() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(a)").unwrap();
        let c1 = db.schema.cookie;
        run(&mut db, "CREATE INDEX i ON t(a)").unwrap();
        assert!(db.schema.cookie > c1);
        run(&mut db, "DROP INDEX i").unwrap();
        assert!(db.schema.index("i").is_none());
    }

    #[test]
    fn test_create_errors() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(a)").unwrap();
        assert_eq!(run(&mut db, "CREATE TABLE t(b)").unwrap_err().errmsg(), "table t already exists");
        run(&mut db, "CREATE TABLE IF NOT EXISTS t(b)").unwrap();
        assert_eq!(
            run(&mut db, "CREATE TABLE x(a, A)").unwrap_err().errmsg(),
            "duplicate column name: A"
        );
        assert_eq!(
            run(&mut db, "CREATE TABLE sqlite_x(a)").unwrap_err().errmsg(),
            "object name reserved for internal use: sqlite_x"
        );
        assert_eq!(
            run(&mut db, "CREATE TABLE y(a PRIMARY KEY, b PRIMARY KEY)").unwrap_err().errmsg(),
            "table \"y\" has more than one primary key"
        );
    }

    #[test]
    fn test_drop_table_removes_triggers_and_trees() {
        let mut db = Database::new();
        run(
            &mut db,
            "CREATE TABLE t(a UNIQUE); CREATE TRIGGER r AFTER INSERT ON t BEGIN SELECT 1; END",
        )
        .unwrap();
        let t = db.schema.table("t").unwrap();
        run(&mut db, "DROP TABLE t").unwrap();
        assert!(db.schema.trigger("r").is_none());
        assert!(!db.btree.exists(t.root));
        assert!(!db.btree.exists(t.indexes[0].root));
        run(&mut db, "DROP TABLE IF EXISTS t").unwrap();
        assert_eq!(run(&mut db, "DROP TABLE t").unwrap_err().errmsg(), "no such table: t");
    }

    #[test]
    fn test_view_columns_follow_body() {
        let mut db = Database::new();
        run(
            &mut db,
            "CREATE TABLE t(a INTEGER, b TEXT); CREATE VIEW v AS SELECT a, b, a + 1 AS c FROM t;
             CREATE VIEW w(x, y) AS SELECT b, a FROM t;",
        )
        .unwrap();
        let v = db.schema.table("v").unwrap();
        let names: Vec<_> = v.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(v.columns[0].affinity, Affinity::Integer);
        assert_eq!(v.columns[1].affinity, Affinity::Text);
        let w = db.schema.table("w").unwrap();
        let names: Vec<_> = w.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(
            run(&mut db, "CREATE VIEW u(x) AS SELECT a, b FROM t").unwrap_err().errmsg(),
            "expected 1 columns for 'u' but got 2"
        );
    }

    #[test]
    fn test_trigger_timing_rules() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(a); CREATE VIEW v AS SELECT a FROM t").unwrap();
        assert_eq!(
            run(&mut db, "CREATE TRIGGER r INSTEAD OF INSERT ON t BEGIN SELECT 1; END")
                .unwrap_err()
                .errmsg(),
            "cannot create INSTEAD OF trigger on table: t"
        );
        assert_eq!(
            run(&mut db, "CREATE TRIGGER r BEFORE INSERT ON v BEGIN SELECT 1; END")
                .unwrap_err()
                .errmsg(),
            "cannot create BEFORE trigger on view: v"
        );
        assert_eq!(
            run(&mut db, "DROP TABLE v").unwrap_err().errmsg(),
            "use DROP VIEW to delete view v"
        );
    }

    #[test]
    fn test_autoindex_cannot_be_dropped() {
        let mut db = Database::new();
        run(&mut db, "CREATE TABLE t(a UNIQUE)").unwrap();
        assert_eq!(
            run(&mut db, "DROP INDEX sqlite_autoindex_t_1").unwrap_err().errmsg(),
            "index associated with UNIQUE or PRIMARY KEY constraint cannot be dropped"
        );
    }
}
