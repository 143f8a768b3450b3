//! Abstract Syntax Tree
//!
//! Defines the parse tree for SQL statements and expressions. The same
//! tree is carried through name resolution and the query rewrites: the
//! resolver replaces identifier nodes with `Expr::Column` references bound
//! to a cursor number, and the aggregate analysis replaces aggregate calls
//! with `Expr::AggFunction` slots.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::schema::{Affinity, Table};
use crate::vdbe::value::Collation;

// ============================================================================
// Core Types
// ============================================================================

/// Sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Null ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullsOrder {
    #[default]
    Default,
    First,
    Last,
}

/// Conflict resolution action named in SQL (`OR REPLACE`, `ON CONFLICT ABORT`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictAction {
    Rollback,
    #[default]
    Abort,
    Fail,
    Ignore,
    Replace,
}

impl ConflictAction {
    /// Encoding used in the P2 operand of Halt
    pub fn code(&self) -> i32 {
        match self {
            ConflictAction::Rollback => 1,
            ConflictAction::Abort => 2,
            ConflictAction::Fail => 3,
            ConflictAction::Ignore => 4,
            ConflictAction::Replace => 5,
        }
    }

    pub fn from_code(code: i32) -> ConflictAction {
        match code {
            1 => ConflictAction::Rollback,
            3 => ConflictAction::Fail,
            4 => ConflictAction::Ignore,
            5 => ConflictAction::Replace,
            _ => ConflictAction::Abort,
        }
    }
}

// ============================================================================
// Statements
// ============================================================================

/// Top-level SQL statement
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Select(Box<Select>),
    Insert(Box<InsertStmt>),
    Update(Box<UpdateStmt>),
    Delete(Box<DeleteStmt>),
    CreateTable(Box<CreateTableStmt>),
    CreateIndex(Box<CreateIndexStmt>),
    CreateView(Box<CreateViewStmt>),
    CreateTrigger(Box<CreateTriggerStmt>),
    Drop(DropStmt),
    Begin,
    Commit,
    Rollback,
    Explain(Box<Stmt>),
}

impl Stmt {
    /// Whether running the statement can never modify the database
    pub fn is_read_only(&self) -> bool {
        match self {
            Stmt::Select(_) | Stmt::Begin | Stmt::Commit | Stmt::Rollback => true,
            Stmt::Explain(_) => true,
            _ => false,
        }
    }
}

// ============================================================================
// SELECT Statement
// ============================================================================

/// Compound operator joining a select to its `prior`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompoundOp {
    #[default]
    Single,
    UnionAll,
    Union,
    Intersect,
    Except,
}

impl CompoundOp {
    pub fn name(&self) -> &'static str {
        match self {
            CompoundOp::Single => "SELECT",
            CompoundOp::UnionAll => "UNION ALL",
            CompoundOp::Union => "UNION",
            CompoundOp::Intersect => "INTERSECT",
            CompoundOp::Except => "EXCEPT",
        }
    }
}

bitflags! {
    /// Properties discovered or imposed while compiling a select
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SelectFlags: u32 {
        /// Result columns have been expanded and FROM items bound
        const EXPANDED = 0x0001;
        /// Names have been resolved
        const RESOLVED = 0x0002;
        /// Contains aggregate functions or GROUP BY
        const AGGREGATE = 0x0004;
        /// Term of a multi-row VALUES clause
        const VALUES = 0x0008;
        /// Recursive CTE body
        const RECURSIVE = 0x0010;
        /// Result is used only for its existence (EXISTS)
        const EXISTS = 0x0020;
        /// Has a correlated reference to an outer query
        const CORRELATED = 0x0040;
    }
}

/// One term of a (possibly compound) SELECT
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    pub distinct: bool,
    pub columns: Vec<ResultColumn>,
    pub from: Vec<SrcItem>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    /// ORDER BY (rightmost compound term only)
    pub order_by: Vec<OrderingTerm>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
    /// Operator joining `prior` to this term
    pub op: CompoundOp,
    pub prior: Option<Box<Select>>,
    pub with: Option<With>,
    pub flags: SelectFlags,
    /// Result column names, filled in by expansion
    pub names: Vec<String>,
}

impl Select {
    /// A select producing the given expressions with no FROM clause
    pub fn values_row(exprs: Vec<Expr>) -> Self {
        Select {
            columns: exprs
                .into_iter()
                .map(|expr| ResultColumn::Expr { expr, alias: None })
                .collect(),
            flags: SelectFlags::VALUES,
            ..Default::default()
        }
    }

    /// Whether this is a compound select
    pub fn is_compound(&self) -> bool {
        self.prior.is_some()
    }

    /// Number of result columns (after expansion)
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Iterate the compound chain from the rightmost term leftwards
    pub fn terms(&self) -> impl Iterator<Item = &Select> {
        let mut cur = Some(self);
        std::iter::from_fn(move || {
            let s = cur?;
            cur = s.prior.as_deref();
            Some(s)
        })
    }

    /// Result expressions (after expansion every column is an Expr)
    pub fn result_exprs(&self) -> impl Iterator<Item = &Expr> {
        self.columns.iter().filter_map(|c| match c {
            ResultColumn::Expr { expr, .. } => Some(expr),
            _ => None,
        })
    }
}

/// WITH clause
#[derive(Debug, Clone, PartialEq)]
pub struct With {
    pub recursive: bool,
    pub ctes: Vec<Cte>,
}

/// Common table expression
#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub columns: Vec<String>,
    pub select: Box<Select>,
}

/// Result column
#[derive(Debug, Clone, PartialEq)]
pub enum ResultColumn {
    /// `*`
    Star,
    /// `table.*`
    TableStar(String),
    /// expression with optional alias
    Expr { expr: Expr, alias: Option<String> },
}

bitflags! {
    /// Join operator preceding a FROM item
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JoinType: u8 {
        const INNER = 0x01;
        const CROSS = 0x02;
        const NATURAL = 0x04;
        const LEFT = 0x08;
        const OUTER = 0x10;
        const RIGHT = 0x20;
    }
}

impl JoinType {
    pub fn is_left(&self) -> bool {
        self.contains(JoinType::LEFT)
    }
}

/// Term of a FROM clause
#[derive(Debug, Clone, PartialEq)]
pub struct SrcItem {
    /// Table, view or CTE name
    pub name: Option<String>,
    pub alias: Option<String>,
    /// FROM-clause subquery (also the body of a view or CTE after expansion)
    pub subquery: Option<Box<Select>>,
    /// Join operator between the previous item and this one
    pub join: JoinType,
    pub on: Option<Expr>,
    pub using: Vec<String>,
    /// Cursor number, assigned during expansion
    pub cursor: i32,
    /// Bound table (synthesized for subqueries)
    pub table: Option<Arc<Table>>,
    /// The item is the self-reference of a recursive CTE
    pub is_recursive_ref: bool,
}

impl SrcItem {
    pub fn table(name: impl Into<String>) -> Self {
        SrcItem {
            name: Some(name.into()),
            alias: None,
            subquery: None,
            join: JoinType::empty(),
            on: None,
            using: Vec::new(),
            cursor: -1,
            table: None,
            is_recursive_ref: false,
        }
    }

    pub fn subquery(select: Select) -> Self {
        SrcItem {
            name: None,
            subquery: Some(Box::new(select)),
            ..SrcItem::table("")
        }
    }

    /// Name by which columns of this item are qualified
    pub fn visible_name(&self) -> Option<&str> {
        self.alias.as_deref().or(self.name.as_deref())
    }
}

/// ORDER BY / GROUP BY term
#[derive(Debug, Clone, PartialEq)]
pub struct OrderingTerm {
    pub expr: Expr,
    pub order: SortOrder,
    pub nulls: NullsOrder,
}

impl OrderingTerm {
    pub fn new(expr: Expr) -> Self {
        OrderingTerm {
            expr,
            order: SortOrder::Asc,
            nulls: NullsOrder::Default,
        }
    }

    pub fn is_desc(&self) -> bool {
        self.order == SortOrder::Desc
    }
}

// ============================================================================
// INSERT / UPDATE / DELETE
// ============================================================================

/// Row source of an INSERT
#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    /// VALUES list or SELECT (a single-row VALUES is a FROM-less select)
    Select(Box<Select>),
    DefaultValues,
}

/// INSERT statement
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub with: Option<With>,
    pub or_conflict: Option<ConflictAction>,
    pub table: String,
    pub alias: Option<String>,
    pub columns: Vec<String>,
    pub source: InsertSource,
    pub upsert: Vec<UpsertClause>,
}

/// ON CONFLICT clause of an INSERT
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertClause {
    /// Conflict target columns or expressions
    pub target: Vec<IndexedColumn>,
    pub target_where: Option<Expr>,
    pub action: UpsertAction,
}

/// DO NOTHING / DO UPDATE
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertAction {
    Nothing,
    Update {
        set: Vec<Assignment>,
        where_clause: Option<Expr>,
    },
}

/// `col = expr` (or `(a, b) = ...` reduced to one assignment per column)
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub expr: Expr,
}

/// UPDATE statement
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub with: Option<With>,
    pub or_conflict: Option<ConflictAction>,
    pub table: String,
    pub alias: Option<String>,
    pub set: Vec<Assignment>,
    pub where_clause: Option<Expr>,
}

/// DELETE statement
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub with: Option<With>,
    pub table: String,
    pub alias: Option<String>,
    pub where_clause: Option<Expr>,
}

// ============================================================================
// DDL
// ============================================================================

/// CREATE TABLE statement
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStmt {
    pub if_not_exists: bool,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<TableConstraint>,
    pub without_rowid: bool,
}

/// Column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: Option<String>,
    pub constraints: Vec<ColumnConstraint>,
}

/// Column constraint
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConstraint {
    PrimaryKey {
        order: SortOrder,
        conflict: Option<ConflictAction>,
        autoincrement: bool,
    },
    NotNull {
        conflict: Option<ConflictAction>,
    },
    Null,
    Unique {
        conflict: Option<ConflictAction>,
    },
    Check {
        name: Option<String>,
        expr: Expr,
    },
    Default(Expr),
    Collate(String),
    References(ForeignKeyClause),
}

/// Table constraint
#[derive(Debug, Clone, PartialEq)]
pub enum TableConstraint {
    PrimaryKey {
        name: Option<String>,
        columns: Vec<IndexedColumn>,
        conflict: Option<ConflictAction>,
        autoincrement: bool,
    },
    Unique {
        name: Option<String>,
        columns: Vec<IndexedColumn>,
        conflict: Option<ConflictAction>,
    },
    Check {
        name: Option<String>,
        expr: Expr,
    },
    ForeignKey {
        name: Option<String>,
        columns: Vec<String>,
        clause: ForeignKeyClause,
    },
}

/// REFERENCES clause
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyClause {
    pub table: String,
    pub columns: Vec<String>,
    pub on_delete: FkAction,
    pub on_update: FkAction,
}

/// Foreign key action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FkAction {
    #[default]
    NoAction,
    Restrict,
    SetNull,
    SetDefault,
    Cascade,
}

/// Indexed column (CREATE INDEX, PRIMARY KEY(...), UNIQUE(...), upsert target)
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedColumn {
    pub expr: Expr,
    pub collation: Option<String>,
    pub order: SortOrder,
}

impl IndexedColumn {
    /// Column name when the indexed term is a bare identifier
    pub fn column_name(&self) -> Option<&str> {
        match &self.expr {
            Expr::Id(name) => Some(name),
            _ => None,
        }
    }
}

/// CREATE INDEX statement
#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStmt {
    pub unique: bool,
    pub if_not_exists: bool,
    pub name: String,
    pub table: String,
    pub columns: Vec<IndexedColumn>,
    pub where_clause: Option<Expr>,
}

/// CREATE VIEW statement
#[derive(Debug, Clone, PartialEq)]
pub struct CreateViewStmt {
    pub if_not_exists: bool,
    pub name: String,
    pub columns: Vec<String>,
    pub select: Box<Select>,
}

/// Trigger timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    Before,
    After,
    InsteadOf,
}

/// Trigger event
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEvent {
    Insert,
    Delete,
    /// UPDATE [OF columns]
    Update(Vec<String>),
}

/// CREATE TRIGGER statement
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTriggerStmt {
    pub if_not_exists: bool,
    pub name: String,
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    pub table: String,
    pub when: Option<Expr>,
    pub body: Vec<Stmt>,
}

/// Kind of object named by DROP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    Index,
    View,
    Trigger,
}

/// DROP statement
#[derive(Debug, Clone, PartialEq)]
pub struct DropStmt {
    pub kind: ObjectKind,
    pub if_exists: bool,
    pub name: String,
}

// ============================================================================
// Expressions
// ============================================================================

/// Unary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    BitNot,
}

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
    IsNot,
    And,
    Or,
    BitAnd,
    BitOr,
    ShiftLeft,
    ShiftRight,
    Concat,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Is
                | BinaryOp::IsNot
        )
    }

    /// The comparison with operands swapped (`a < b` == `b > a`)
    pub fn commute(&self) -> BinaryOp {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::Le => BinaryOp::Ge,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::Ge => BinaryOp::Le,
            other => *other,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Is => "IS",
            BinaryOp::IsNot => "IS NOT",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::ShiftLeft => "<<",
            BinaryOp::ShiftRight => ">>",
            BinaryOp::Concat => "||",
        }
    }
}

/// LIKE-family operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeOp {
    Like,
    Glob,
}

/// RAISE action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseAction {
    Ignore,
    Rollback,
    Abort,
    Fail,
}

/// Current time keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKeyword {
    Time,
    Date,
    Timestamp,
}

/// A column bound to a cursor by name resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub cursor: i32,
    /// Table column ordinal, -1 for the rowid
    pub column: i32,
    pub affinity: Option<Affinity>,
    pub collation: Option<Collation>,
    /// Column name, for error messages and result naming
    pub name: String,
    /// Table name, for result naming
    pub table: String,
}

/// Expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    CurrentTime(TimeKeyword),
    /// Bound parameter (1-based)
    Variable(i32),

    /// Unresolved identifier
    Id(String),
    /// Unresolved `table.column`
    Qualified(String, String),
    /// Resolved column reference
    Column(ColumnRef),

    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSelect {
        expr: Box<Expr>,
        select: Box<Select>,
        negated: bool,
    },
    Like {
        op: LikeOp,
        expr: Box<Expr>,
        pattern: Box<Expr>,
        escape: Option<Box<Expr>>,
        negated: bool,
    },
    IsNull(Box<Expr>),
    NotNull(Box<Expr>),
    Case {
        operand: Option<Box<Expr>>,
        whens: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        type_name: String,
    },
    Collate {
        expr: Box<Expr>,
        collation: String,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
        star: bool,
    },
    Subquery(Box<Select>),
    Exists(Box<Select>),
    Raise(RaiseAction, Option<String>),

    // ------------------------------------------------------------------
    // Nodes introduced after parsing
    // ------------------------------------------------------------------
    /// Value already held in a register
    Register {
        reg: i32,
        affinity: Option<Affinity>,
        collation: Option<Collation>,
    },
    /// Source column captured by an aggregate query
    AggColumn(usize),
    /// Aggregate function call slot
    AggFunction(usize),
    /// NEW.col / OLD.col inside a trigger body (column -1 is the rowid)
    TriggerRow {
        new: bool,
        column: i32,
        affinity: Option<Affinity>,
    },
    /// NULL when cursor is on its null row, else `expr`
    IfNullRow { cursor: i32, expr: Box<Expr> },
    /// Term that came from the ON clause of the join whose right side is `cursor`
    OnJoin { cursor: i32, expr: Box<Expr> },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Integer(value)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Text(value.into())
    }

    pub fn id(name: impl Into<String>) -> Self {
        Expr::Id(name.into())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    /// Conjunction of two optional terms
    pub fn and(left: Option<Expr>, right: Option<Expr>) -> Option<Expr> {
        match (left, right) {
            (Some(l), Some(r)) => Some(Expr::binary(BinaryOp::And, l, r)),
            (l, None) => l,
            (None, r) => r,
        }
    }

    /// Whether this is a literal constant
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Expr::Null | Expr::Integer(_) | Expr::Real(_) | Expr::Text(_) | Expr::Blob(_)
        )
    }

    /// Strip OnJoin wrappers and redundant unary plus
    pub fn skip_wrappers(&self) -> &Expr {
        match self {
            Expr::OnJoin { expr, .. } => expr.skip_wrappers(),
            Expr::Unary(UnaryOp::Pos, e) => e.skip_wrappers(),
            other => other,
        }
    }

    /// Split an AND tree into its conjuncts
    pub fn split_and(self) -> Vec<Expr> {
        let mut out = Vec::new();
        fn walk(e: Expr, out: &mut Vec<Expr>) {
            match e {
                Expr::Binary(BinaryOp::And, l, r) => {
                    walk(*l, out);
                    walk(*r, out);
                }
                Expr::OnJoin { cursor, expr } => match *expr {
                    Expr::Binary(BinaryOp::And, l, r) => {
                        walk(Expr::OnJoin { cursor, expr: l }, out);
                        walk(Expr::OnJoin { cursor, expr: r }, out);
                    }
                    inner => out.push(Expr::OnJoin {
                        cursor,
                        expr: Box::new(inner),
                    }),
                },
                other => out.push(other),
            }
        }
        walk(self, &mut out);
        out
    }

    /// Rebuild an AND tree from conjuncts
    pub fn join_and(terms: Vec<Expr>) -> Option<Expr> {
        terms.into_iter().fold(None, |acc, t| Expr::and(acc, Some(t)))
    }

    /// Visit every sub-expression (pre-order), not descending into subqueries
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Unary(_, e)
            | Expr::IsNull(e)
            | Expr::NotNull(e)
            | Expr::Cast { expr: e, .. }
            | Expr::Collate { expr: e, .. }
            | Expr::IfNullRow { expr: e, .. }
            | Expr::OnJoin { expr: e, .. } => e.walk(f),
            Expr::Binary(_, l, r) => {
                l.walk(f);
                r.walk(f);
            }
            Expr::Between { expr, low, high, .. } => {
                expr.walk(f);
                low.walk(f);
                high.walk(f);
            }
            Expr::InList { expr, list, .. } => {
                expr.walk(f);
                for e in list {
                    e.walk(f);
                }
            }
            Expr::InSelect { expr, .. } => expr.walk(f),
            Expr::Like { expr, pattern, escape, .. } => {
                expr.walk(f);
                pattern.walk(f);
                if let Some(e) = escape {
                    e.walk(f);
                }
            }
            Expr::Case { operand, whens, else_expr } => {
                if let Some(o) = operand {
                    o.walk(f);
                }
                for (w, t) in whens {
                    w.walk(f);
                    t.walk(f);
                }
                if let Some(e) = else_expr {
                    e.walk(f);
                }
            }
            Expr::Function { args, .. } => {
                for a in args {
                    a.walk(f);
                }
            }
            _ => {}
        }
    }

    /// Apply `f` to each direct child (subqueries not entered)
    pub fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        match self {
            Expr::Unary(_, e)
            | Expr::IsNull(e)
            | Expr::NotNull(e)
            | Expr::Cast { expr: e, .. }
            | Expr::Collate { expr: e, .. }
            | Expr::IfNullRow { expr: e, .. }
            | Expr::OnJoin { expr: e, .. } => f(e),
            Expr::Binary(_, l, r) => {
                f(l);
                f(r);
            }
            Expr::Between { expr, low, high, .. } => {
                f(expr);
                f(low);
                f(high);
            }
            Expr::InList { expr, list, .. } => {
                f(expr);
                for e in list.iter_mut() {
                    f(e);
                }
            }
            Expr::InSelect { expr, .. } => f(expr),
            Expr::Like { expr, pattern, escape, .. } => {
                f(expr);
                f(pattern);
                if let Some(e) = escape {
                    f(e);
                }
            }
            Expr::Case { operand, whens, else_expr } => {
                if let Some(o) = operand {
                    f(o);
                }
                for (w, t) in whens.iter_mut() {
                    f(w);
                    f(t);
                }
                if let Some(e) = else_expr {
                    f(e);
                }
            }
            Expr::Function { args, .. } => {
                for a in args.iter_mut() {
                    f(a);
                }
            }
            _ => {}
        }
    }

    /// Mutable post-order rewrite; `f` may replace any node
    pub fn transform(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        self.for_each_child_mut(&mut |c| c.transform(&mut *f));
        f(self);
    }

    /// Whether any node satisfies `pred` (subqueries not entered)
    pub fn any(&self, pred: &mut dyn FnMut(&Expr) -> bool) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if !found && pred(e) {
                found = true;
            }
        });
        found
    }

    /// Whether the expression contains a subquery of any kind
    pub fn has_subquery(&self) -> bool {
        self.any(&mut |e| matches!(e, Expr::Subquery(_) | Expr::Exists(_) | Expr::InSelect { .. }))
    }

    /// Whether the expression reads a column of `cursor`
    pub fn references_cursor(&self, cursor: i32) -> bool {
        self.any(&mut |e| match e {
            Expr::Column(c) => c.cursor == cursor,
            Expr::IfNullRow { cursor: c, .. } => *c == cursor,
            _ => false,
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Null => write!(f, "NULL"),
            Expr::Integer(i) => write!(f, "{}", i),
            Expr::Real(r) => write!(f, "{}", crate::types::format_real(*r)),
            Expr::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Expr::Blob(b) => write!(f, "X'{}'", hex::encode_upper(b)),
            Expr::CurrentTime(TimeKeyword::Time) => write!(f, "CURRENT_TIME"),
            Expr::CurrentTime(TimeKeyword::Date) => write!(f, "CURRENT_DATE"),
            Expr::CurrentTime(TimeKeyword::Timestamp) => write!(f, "CURRENT_TIMESTAMP"),
            Expr::Variable(i) => write!(f, "?{}", i),
            Expr::Id(n) => write!(f, "{}", n),
            Expr::Qualified(t, c) => write!(f, "{}.{}", t, c),
            Expr::Column(c) => write!(f, "{}", c.name),
            Expr::Unary(UnaryOp::Neg, e) => write!(f, "-{}", e),
            Expr::Unary(UnaryOp::Pos, e) => write!(f, "+{}", e),
            Expr::Unary(UnaryOp::Not, e) => write!(f, "NOT {}", e),
            Expr::Unary(UnaryOp::BitNot, e) => write!(f, "~{}", e),
            Expr::Binary(op, l, r) => write!(f, "{} {} {}", l, op.symbol(), r),
            Expr::Between { expr, low, high, negated } => write!(
                f,
                "{} {}BETWEEN {} AND {}",
                expr,
                if *negated { "NOT " } else { "" },
                low,
                high
            ),
            Expr::InList { expr, list, negated } => {
                write!(f, "{} {}IN (", expr, if *negated { "NOT " } else { "" })?;
                for (i, e) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            Expr::InSelect { expr, negated, .. } => {
                write!(f, "{} {}IN (SELECT ...)", expr, if *negated { "NOT " } else { "" })
            }
            Expr::Like { op, expr, pattern, negated, .. } => write!(
                f,
                "{} {}{} {}",
                expr,
                if *negated { "NOT " } else { "" },
                if *op == LikeOp::Like { "LIKE" } else { "GLOB" },
                pattern
            ),
            Expr::IsNull(e) => write!(f, "{} IS NULL", e),
            Expr::NotNull(e) => write!(f, "{} NOT NULL", e),
            Expr::Case { .. } => write!(f, "CASE ... END"),
            Expr::Cast { expr, type_name } => write!(f, "CAST({} AS {})", expr, type_name),
            Expr::Collate { expr, collation } => write!(f, "{} COLLATE {}", expr, collation),
            Expr::Function { name, args, distinct, star } => {
                write!(f, "{}(", name)?;
                if *star {
                    write!(f, "*")?;
                }
                if *distinct {
                    write!(f, "DISTINCT ")?;
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::Subquery(_) => write!(f, "(SELECT ...)"),
            Expr::Exists(_) => write!(f, "EXISTS (SELECT ...)"),
            Expr::Raise(..) => write!(f, "RAISE(...)"),
            Expr::Register { reg, .. } => write!(f, "r[{}]", reg),
            Expr::AggColumn(i) => write!(f, "agg_column({})", i),
            Expr::AggFunction(i) => write!(f, "agg_function({})", i),
            Expr::TriggerRow { new, column, .. } => {
                write!(f, "{}.{}", if *new { "new" } else { "old" }, column)
            }
            Expr::IfNullRow { expr, .. } => write!(f, "{}", expr),
            Expr::OnJoin { expr, .. } => write!(f, "{}", expr),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_keeps_join_provenance() {
        let on = Expr::OnJoin {
            cursor: 1,
            expr: Box::new(Expr::binary(BinaryOp::And, Expr::id("a"), Expr::id("b"))),
        };
        let terms = Expr::binary(BinaryOp::And, Expr::id("c"), on).split_and();
        assert_eq!(terms.len(), 3);
        assert!(matches!(terms[1], Expr::OnJoin { cursor: 1, .. }));
        assert!(matches!(terms[2], Expr::OnJoin { cursor: 1, .. }));
    }

    #[test]
    fn test_join_and_round_trip_count() {
        let joined = Expr::join_and(vec![Expr::id("a"), Expr::id("b"), Expr::id("c")]).unwrap();
        assert_eq!(joined.split_and().len(), 3);
        assert_eq!(Expr::join_and(Vec::new()), None);
    }

    #[test]
    fn test_commute() {
        assert_eq!(BinaryOp::Lt.commute(), BinaryOp::Gt);
        assert_eq!(BinaryOp::Eq.commute(), BinaryOp::Eq);
    }

    #[test]
    fn test_compound_terms_iterate_right_to_left() {
        let left = Select::values_row(vec![Expr::int(1)]);
        let mut right = Select::values_row(vec![Expr::int(2)]);
        right.op = CompoundOp::Union;
        right.prior = Some(Box::new(left));
        assert_eq!(right.terms().count(), 2);
        assert!(right.is_compound());
    }

    #[test]
    fn test_expr_display() {
        let e = Expr::binary(BinaryOp::Eq, Expr::id("a"), Expr::string("it's"));
        assert_eq!(e.to_string(), "a = 'it''s'");
    }
}
