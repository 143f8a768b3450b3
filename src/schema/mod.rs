//! Schema objects
//!
//! Tables, indexes, triggers and foreign keys as the code generators see
//! them. Objects are shared through `Arc` and never mutated once they are
//! published in a `Schema`; DDL builds replacement objects instead.

pub mod affinity;
pub mod build;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::parser::ast::{
    ConflictAction, Expr, FkAction, Select, SortOrder, Stmt, TriggerEvent, TriggerTiming,
};
use crate::types::Pgno;
use crate::vdbe::value::Collation;

pub use affinity::{expr_affinity, type_affinity};

/// Name of the AUTOINCREMENT bookkeeping table
pub const SEQUENCE_TABLE: &str = "sqlite_sequence";

// ============================================================================
// Affinity
// ============================================================================

/// Column type affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affinity {
    /// No coercion
    #[default]
    Blob,
    Text,
    /// Prefers integer, then real
    Numeric,
    Integer,
    Real,
}

impl Affinity {
    /// Character used in affinity strings
    pub fn as_char(&self) -> char {
        match self {
            Affinity::Blob => 'A',
            Affinity::Text => 'B',
            Affinity::Numeric => 'C',
            Affinity::Integer => 'D',
            Affinity::Real => 'E',
        }
    }

    pub fn from_char(c: char) -> Option<Affinity> {
        match c {
            'A' => Some(Affinity::Blob),
            'B' => Some(Affinity::Text),
            'C' => Some(Affinity::Numeric),
            'D' => Some(Affinity::Integer),
            'E' => Some(Affinity::Real),
            _ => None,
        }
    }

    /// Encoding in the low bits of a comparison opcode's P5
    pub fn p5_code(&self) -> u16 {
        match self {
            Affinity::Blob => 1,
            Affinity::Text => 2,
            Affinity::Numeric => 3,
            Affinity::Integer => 4,
            Affinity::Real => 5,
        }
    }

    pub fn from_p5(code: u16) -> Option<Affinity> {
        match code {
            1 => Some(Affinity::Blob),
            2 => Some(Affinity::Text),
            3 => Some(Affinity::Numeric),
            4 => Some(Affinity::Integer),
            5 => Some(Affinity::Real),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Affinity::Numeric | Affinity::Integer | Affinity::Real)
    }
}

// ============================================================================
// Column
// ============================================================================

/// Column in a table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Column {
    pub name: String,
    /// Declared type
    pub type_name: Option<String>,
    pub affinity: Affinity,
    /// NOT NULL policy; `None` when the column accepts NULL
    pub not_null: Option<ConflictAction>,
    pub default: Option<Expr>,
    pub collation: Collation,
    /// Part of the PRIMARY KEY
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Column {
            name: name.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Foreign Key
// ============================================================================

/// Foreign key constraint declared on a child table
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    /// Child columns (ordinals in the owning table)
    pub columns: Vec<usize>,
    pub parent: String,
    /// Parent columns by name; empty means the parent's PRIMARY KEY
    pub parent_columns: Vec<String>,
    pub on_delete: FkAction,
    pub on_update: FkAction,
}

// ============================================================================
// Index
// ============================================================================

/// What an index key column holds
#[derive(Debug, Clone, PartialEq)]
pub enum IndexTarget {
    Column(usize),
    Rowid,
    Expr(Expr),
}

/// Index key column
#[derive(Debug, Clone, PartialEq)]
pub struct IndexColumn {
    pub target: IndexTarget,
    pub collation: Collation,
    pub order: SortOrder,
}

impl IndexColumn {
    pub fn column(col: usize, collation: Collation) -> Self {
        IndexColumn {
            target: IndexTarget::Column(col),
            collation,
            order: SortOrder::Asc,
        }
    }

    pub fn column_ordinal(&self) -> Option<usize> {
        match self.target {
            IndexTarget::Column(c) => Some(c),
            _ => None,
        }
    }
}

/// How an index came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    CreateIndex,
    Unique,
    PrimaryKey,
}

/// Database index
#[derive(Debug, Clone)]
pub struct Index {
    pub name: String,
    pub table: String,
    /// Key columns followed by the columns that identify the row
    /// (the rowid, or the primary key columns of a WITHOUT ROWID table;
    /// for the WITHOUT ROWID primary key index, every remaining column)
    pub columns: Vec<IndexColumn>,
    /// Number of declared key columns
    pub n_key_col: usize,
    pub unique: bool,
    /// Policy applied when the UNIQUE constraint fails
    pub on_conflict: ConflictAction,
    pub partial: Option<Expr>,
    pub origin: IndexOrigin,
    pub root: Pgno,
    /// Memoized affinity string (see `affinity::index_affinity`)
    pub(crate) affinity: OnceLock<String>,
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.root == other.root
    }
}

impl Index {
    pub fn is_primary_key(&self) -> bool {
        self.origin == IndexOrigin::PrimaryKey
    }

    /// Number of columns stored in an entry, including the row identifier tail
    pub fn n_column(&self) -> usize {
        self.columns.len()
    }

    /// Whether any key column is an expression
    pub fn has_expressions(&self) -> bool {
        self.columns[..self.n_key_col]
            .iter()
            .any(|c| matches!(c.target, IndexTarget::Expr(_)))
    }

    /// Whether the key covers table column `col`
    pub fn covers_column(&self, col: usize) -> bool {
        self.columns[..self.n_key_col]
            .iter()
            .any(|c| c.target == IndexTarget::Column(col))
    }

    /// Whether key column `i` is the table's column `col`
    pub fn key_is_column(&self, i: usize, col: usize) -> bool {
        self.columns.get(i).map(|c| c.target == IndexTarget::Column(col)).unwrap_or(false)
    }

    /// Entry positions holding the primary key columns of a WITHOUT ROWID
    /// table, in primary key order
    pub fn pk_positions(&self, table: &Table) -> Vec<usize> {
        let pk = match table.pk_index() {
            Some(pk) => pk,
            None => return Vec::new(),
        };
        pk.columns[..pk.n_key_col]
            .iter()
            .filter_map(|pc| self.columns.iter().position(|c| c.target == pc.target))
            .collect()
    }

    /// Unique index whose key columns are all NOT NULL: the trailing row
    /// identifier never takes part in a uniqueness decision
    pub fn is_unique_not_null(&self, table: &Table) -> bool {
        self.unique
            && self.columns[..self.n_key_col].iter().all(|c| match c.target {
                IndexTarget::Column(col) => table.columns[col].not_null.is_some(),
                _ => false,
            })
    }
}

// ============================================================================
// Table
// ============================================================================

/// CHECK constraint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckConstraint {
    pub name: Option<String>,
    pub expr: Expr,
}

/// Database table or view
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    /// Column aliasing the rowid (INTEGER PRIMARY KEY)
    pub ipk: Option<usize>,
    /// Declared PRIMARY KEY columns
    pub pk_columns: Vec<usize>,
    /// Policy of the PRIMARY KEY constraint
    pub pk_on_conflict: ConflictAction,
    pub without_rowid: bool,
    pub autoincrement: bool,
    pub root: Pgno,
    /// Indexes; REPLACE-policy indexes come after all others
    pub indexes: Vec<Arc<Index>>,
    pub checks: Vec<CheckConstraint>,
    pub foreign_keys: Vec<ForeignKey>,
    /// Body of a view (or of a FROM-clause subquery)
    pub view: Option<Box<Select>>,
    /// Synthesized for a subquery or CTE, not stored in the schema
    pub ephemeral: bool,
    /// Memoized affinity string (see `affinity::table_affinity`)
    pub(crate) affinity: OnceLock<String>,
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.root == other.root
    }
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            columns: Vec::new(),
            ipk: None,
            pk_columns: Vec::new(),
            pk_on_conflict: ConflictAction::Abort,
            without_rowid: false,
            autoincrement: false,
            root: 0,
            indexes: Vec::new(),
            checks: Vec::new(),
            foreign_keys: Vec::new(),
            view: None,
            ephemeral: false,
            affinity: OnceLock::new(),
        }
    }

    /// Table ordinal of a column name; "rowid" aliases give -1 on rowid tables
    pub fn column_index(&self, name: &str) -> Option<i32> {
        if let Some(i) = self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name)) {
            return Some(i as i32);
        }
        if self.has_rowid() && is_rowid_name(name) {
            return Some(-1);
        }
        None
    }

    pub fn find_column(&self, name: &str) -> Result<i32> {
        self.column_index(name)
            .ok_or_else(|| Error::sql(format!("table {} has no column named {}", self.name, name)))
    }

    pub fn has_rowid(&self) -> bool {
        !self.without_rowid && self.view.is_none()
    }

    pub fn is_view(&self) -> bool {
        self.view.is_some() && !self.ephemeral
    }

    /// The WITHOUT ROWID primary key index
    pub fn pk_index(&self) -> Option<&Arc<Index>> {
        if self.without_rowid {
            self.indexes.iter().find(|i| i.is_primary_key())
        } else {
            None
        }
    }

    /// Position of table column `col` within a stored row
    ///
    /// Rowid tables store columns in declaration order. A WITHOUT ROWID
    /// table stores its primary key index entry: key columns first, then
    /// the rest in declaration order.
    pub fn storage_position(&self, col: usize) -> usize {
        match self.pk_index() {
            Some(pk) => pk
                .columns
                .iter()
                .position(|c| c.target == IndexTarget::Column(col))
                .unwrap_or(col),
            None => col,
        }
    }

    /// Whether the table has a column-level or table-level NOT NULL,
    /// CHECK or UNIQUE constraint that could fire on a write
    pub fn has_constraints(&self) -> bool {
        !self.checks.is_empty()
            || self.columns.iter().any(|c| c.not_null.is_some())
            || self.indexes.iter().any(|i| i.unique)
    }
}

/// Whether `name` is one of the rowid aliases
pub fn is_rowid_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("rowid") || name.eq_ignore_ascii_case("oid") || name.eq_ignore_ascii_case("_rowid_")
}

// ============================================================================
// Trigger
// ============================================================================

/// Row trigger
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub name: String,
    pub table: String,
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    pub when: Option<Expr>,
    pub body: Vec<Stmt>,
}

impl Trigger {
    /// Whether the trigger fires for an UPDATE touching `changed` columns
    pub fn fires_on_update(&self, table: &Table, changed: &[bool]) -> bool {
        match &self.event {
            TriggerEvent::Update(cols) if cols.is_empty() => true,
            TriggerEvent::Update(cols) => cols.iter().any(|name| {
                table
                    .column_index(name)
                    .map(|i| i >= 0 && changed.get(i as usize).copied().unwrap_or(false))
                    .unwrap_or(false)
            }),
            _ => false,
        }
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Every object of the database
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Tables and views by lowercase name
    pub tables: HashMap<String, Arc<Table>>,
    /// Index name (lowercase) to owning table name
    pub indexes: HashMap<String, String>,
    pub triggers: HashMap<String, Arc<Trigger>>,
    /// Bumped by every schema change
    pub cookie: u32,
    /// Next free root page
    pub next_root: Pgno,
}

impl Schema {
    pub fn new() -> Self {
        Schema {
            next_root: 2,
            ..Default::default()
        }
    }

    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Look up a table, failing with "no such table"
    pub fn require_table(&self, name: &str) -> Result<Arc<Table>> {
        self.table(name)
            .ok_or_else(|| Error::sql(format!("no such table: {}", name)))
    }

    pub fn index(&self, name: &str) -> Option<Arc<Index>> {
        let table = self.indexes.get(&name.to_ascii_lowercase())?;
        self.tables
            .get(table)?
            .indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn trigger(&self, name: &str) -> Option<Arc<Trigger>> {
        self.triggers.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Triggers on `table`, in name order for deterministic firing
    pub fn triggers_on(&self, table: &str) -> Vec<Arc<Trigger>> {
        let mut list: Vec<Arc<Trigger>> = self
            .triggers
            .values()
            .filter(|t| t.table.eq_ignore_ascii_case(table))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Foreign keys in other tables that reference `parent`
    pub fn referencing_keys(&self, parent: &str) -> Vec<(Arc<Table>, usize)> {
        let mut out = Vec::new();
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        for name in names {
            let t = &self.tables[name];
            for (i, fk) in t.foreign_keys.iter().enumerate() {
                if fk.parent.eq_ignore_ascii_case(parent) {
                    out.push((t.clone(), i));
                }
            }
        }
        out
    }

    pub fn alloc_root(&mut self) -> Pgno {
        let root = self.next_root;
        self.next_root += 1;
        root
    }

    /// Publish a (new or replacement) table
    pub fn put_table(&mut self, table: Table) -> Arc<Table> {
        for idx in &table.indexes {
            self.indexes
                .insert(idx.name.to_ascii_lowercase(), table.name.to_ascii_lowercase());
        }
        let t = Arc::new(table);
        self.tables.insert(t.name.to_ascii_lowercase(), t.clone());
        t
    }

    pub fn bump_cookie(&mut self) {
        self.cookie = self.cookie.wrapping_add(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_chars_round_trip() {
        for a in [Affinity::Blob, Affinity::Text, Affinity::Numeric, Affinity::Integer, Affinity::Real] {
            assert_eq!(Affinity::from_char(a.as_char()), Some(a));
            assert_eq!(Affinity::from_p5(a.p5_code()), Some(a));
        }
    }

    #[test]
    fn test_rowid_aliases() {
        let mut t = Table::new("t");
        t.columns.push(Column::new("a"));
        assert_eq!(t.column_index("A"), Some(0));
        assert_eq!(t.column_index("rowid"), Some(-1));
        assert_eq!(t.column_index("_rowid_"), Some(-1));
        t.without_rowid = true;
        assert_eq!(t.column_index("rowid"), None);
    }

    #[test]
    fn test_schema_lookup_is_case_insensitive() {
        let mut s = Schema::new();
        s.put_table(Table::new("Users"));
        assert!(s.table("USERS").is_some());
        assert_eq!(s.require_table("nope").unwrap_err().errmsg(), "no such table: nope");
    }

    #[test]
    fn test_alloc_root_is_monotonic() {
        let mut s = Schema::new();
        let a = s.alloc_root();
        let b = s.alloc_root();
        assert!(b > a);
    }
}
