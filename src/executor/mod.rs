//! Code generation: SELECT, INSERT, UPDATE, DELETE and friends
//!
//! A `Parse` compiles one program. The statement itself is compiled by the
//! root `Parse`; each trigger body is compiled by a nested `Parse` that
//! shares the statement-wide `Toplevel` state (root-frame registers, the
//! AUTOINCREMENT bookkeeping and the table of trigger subprograms).

pub mod constraint;
pub mod ddl;
pub mod delete;
pub mod expr;
pub mod fkey;
pub mod insert;
pub mod open;
pub mod prepare;
pub mod resolve;
pub mod select;
pub mod trigger;
pub mod update;
pub mod upsert;
pub mod where_clause;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use crate::api::config::DbConfig;
use crate::error::{ConstraintKind, Error, ErrorCode, Result};
use crate::parser::ast::{ConflictAction, Cte};
use crate::schema::{Schema, Table};
use crate::vdbe::{Label, Opcode, Program, SubProgram, VdbeBuilder, P4};

pub use prepare::{compile, Compiled};
pub use resolve::Scope;
pub use select::SelectDest;

// ============================================================================
// Compile context
// ============================================================================

/// How the columns of a cursor number are read
#[derive(Debug, Clone)]
pub enum CursorSource {
    /// A schema table; rowid tables and WITHOUT ROWID tables alike
    Table(Arc<Table>),
    /// Transient table whose record holds the result columns in order
    Ephemeral,
    /// A row held in registers: column `c` at `base + c`, the rowid in
    /// `rowid`; `ipk` reads the rowid register
    Registers {
        base: i32,
        rowid: Option<i32>,
        ipk: Option<usize>,
    },
}

/// NEW/OLD visibility inside a trigger body
#[derive(Debug, Clone)]
pub struct TriggerCtx {
    pub table: Arc<Table>,
    pub new: bool,
    pub old: bool,
}

/// AUTOINCREMENT bookkeeping for one table
///
/// Four root-frame registers: table name, largest rowid seen, rowid of
/// the sqlite_sequence row (NULL when there is none), scratch.
#[derive(Debug, Clone)]
pub struct AutoincInfo {
    pub table: Arc<Table>,
    pub reg: i32,
}

/// State shared by a statement and every trigger compiled for it
#[derive(Debug, Default)]
pub struct Toplevel {
    root_mem: i32,
    pub autoinc: Vec<AutoincInfo>,
    pub subprograms: Vec<SubProgram>,
    /// (trigger name, conflict policy code) to subprogram index
    pub trigger_cache: HashMap<(String, i32), usize>,
    pub n_var: usize,
    /// Some program of the statement writes
    pub writes: bool,
}

/// CTE visible to name lookup
#[derive(Debug, Clone)]
pub struct CteBinding {
    pub cte: Cte,
    /// Declared under WITH RECURSIVE
    pub recursive: bool,
    /// Set while the recursive terms of this CTE are expanded: the cursor
    /// of the current queue row and the shape of the CTE
    pub recursive_ref: Option<(i32, Arc<Table>)>,
    /// The CTE body is being expanded; a reference to it is circular
    pub expanding: bool,
}

/// Compilation state of one program
pub struct Parse<'a> {
    pub schema: &'a Schema,
    pub config: &'a DbConfig,
    pub v: VdbeBuilder,
    pub top: Rc<RefCell<Toplevel>>,
    /// Trigger nesting depth; 0 compiles the statement itself
    pub nested: usize,
    pub trigger: Option<TriggerCtx>,
    pub sources: HashMap<i32, CursorSource>,
    /// Name resolution scopes, outermost first
    pub scopes: Vec<Scope>,
    /// Visible CTEs, innermost last
    pub ctes: Vec<CteBinding>,
    /// Views whose bodies are being expanded
    pub expanding_views: Vec<String>,
    /// `excluded.*` of an upsert: the table and its candidate row register
    pub excluded: Option<(Arc<Table>, i32)>,
    /// Aggregate slots while coding an aggregate query
    pub agg: Option<select::aggregate::AggCode>,
    prologue: Option<Label>,
}

impl<'a> Parse<'a> {
    /// Context for a top-level statement
    pub fn new(schema: &'a Schema, config: &'a DbConfig) -> Self {
        let mut v = VdbeBuilder::new();
        let prologue = v.make_label();
        v.add_jump(Opcode::Init, 0, prologue, 0);
        Parse {
            schema,
            config,
            v,
            top: Rc::new(RefCell::new(Toplevel::default())),
            nested: 0,
            trigger: None,
            sources: HashMap::new(),
            scopes: Vec::new(),
            ctes: Vec::new(),
            expanding_views: Vec::new(),
            excluded: None,
            agg: None,
            prologue: Some(prologue),
        }
    }

    /// Context for a trigger body compiled on behalf of this statement
    pub fn nested(&self, trigger: TriggerCtx) -> Parse<'a> {
        Parse {
            schema: self.schema,
            config: self.config,
            v: VdbeBuilder::new(),
            top: self.top.clone(),
            nested: self.nested + 1,
            trigger: Some(trigger),
            sources: HashMap::new(),
            scopes: Vec::new(),
            ctes: Vec::new(),
            expanding_views: Vec::new(),
            excluded: None,
            agg: None,
            prologue: None,
        }
    }

    pub fn is_nested(&self) -> bool {
        self.nested > 0
    }

    /// Allocate `n` consecutive registers in this program's frame
    pub fn alloc_reg(&mut self, n: i32) -> i32 {
        if self.nested == 0 {
            self.alloc_root_reg(n)
        } else {
            self.v.alloc_reg(n)
        }
    }

    /// Allocate registers in the statement's root frame
    pub fn alloc_root_reg(&mut self, n: i32) -> i32 {
        let mut top = self.top.borrow_mut();
        let first = top.root_mem + 1;
        top.root_mem += n.max(1);
        first
    }

    pub fn alloc_cursor(&mut self) -> i32 {
        self.v.alloc_cursor()
    }

    pub fn note_variable(&mut self, n: i32) {
        let mut top = self.top.borrow_mut();
        top.n_var = top.n_var.max(n.max(0) as usize);
    }

    /// Record that the statement writes to the database
    pub fn set_writes(&mut self) {
        self.top.borrow_mut().writes = true;
    }

    /// Registers for an OLD and a NEW image of a `table` row
    ///
    /// Each image is the rowid followed by one register per column; the
    /// NEW image starts right after the OLD one. Trigger programs read
    /// both through `Param` relative to the OLD base.
    pub fn alloc_row_images(&mut self, table: &Table) -> (i32, i32) {
        let n = table.columns.len() as i32 + 1;
        let old = self.alloc_reg(2 * n);
        (old, old + n)
    }

    /// Cursor number through which expressions read the row image at `row`
    pub fn row_cursor(&mut self, table: &Arc<Table>, row: i32) -> i32 {
        let cursor = self.alloc_cursor();
        self.sources.insert(
            cursor,
            CursorSource::Registers {
                base: row + 1,
                rowid: table.has_rowid().then_some(row),
                ipk: if table.has_rowid() { table.ipk } else { None },
            },
        );
        cursor
    }

    /// Emit a Halt reporting a constraint failure
    pub fn halt_constraint(&mut self, kind: ConstraintKind, action: ConflictAction, message: String) {
        self.code_halt(Opcode::Halt, kind, action, message, 0);
    }

    /// Emit a HaltIfNull on `reg` reporting a constraint failure
    pub fn halt_constraint_if_null(&mut self, kind: ConstraintKind, action: ConflictAction, message: String, reg: i32) {
        self.code_halt(Opcode::HaltIfNull, kind, action, message, reg);
    }

    fn code_halt(&mut self, opcode: Opcode, kind: ConstraintKind, action: ConflictAction, message: String, reg: i32) {
        let action = match action {
            ConflictAction::Rollback | ConflictAction::Fail => action,
            _ => ConflictAction::Abort,
        };
        self.v.add_op4(
            opcode,
            ErrorCode::Constraint as i32,
            action.code(),
            reg,
            P4::Text(message),
        );
        self.v.change_p5(kind as u16);
    }

    /// Finish the statement program
    pub fn finish(mut self, column_names: Vec<String>) -> Result<Program> {
        if self.nested != 0 {
            return Err(Error::with_message(ErrorCode::Internal, "finish on a nested parse"));
        }
        insert::autoinc_end(&mut self)?;
        self.v.add_op0(Opcode::Halt);

        // Prologue: open the transaction, load AUTOINCREMENT counters, start
        let prologue = self
            .prologue
            .take()
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, "missing prologue"))?;
        self.v.resolve_label(prologue);
        let writes = self.top.borrow().writes;
        self.v
            .add_op(Opcode::Transaction, 0, writes as i32, self.schema.cookie as i32);
        insert::autoinc_begin(&mut self)?;
        self.v.add_op2(Opcode::Goto, 0, 1);

        let top = self.top.borrow();
        let n_mem = top.root_mem.max(self.v.n_mem());
        let n_cursor = self.v.n_cursor();
        let subprograms = top.subprograms.clone();
        let n_var = top.n_var;
        drop(top);
        let ops = self.v.finish()?;
        trace!(n_ops = ops.len(), n_mem, n_cursor, "program finished");
        Ok(Program {
            ops: Arc::new(ops),
            subprograms: Arc::new(subprograms),
            n_mem,
            n_cursor,
            column_names,
            n_var,
            read_only: !writes,
            explain: false,
        })
    }

    /// Finish a trigger body
    pub fn finish_subprogram(mut self, name: &str) -> Result<SubProgram> {
        self.v.add_op0(Opcode::Halt);
        let n_mem = self.v.n_mem();
        let n_cursor = self.v.n_cursor();
        Ok(SubProgram {
            ops: self.v.finish()?,
            n_mem,
            n_cursor,
            name: name.to_string(),
        })
    }
}

/// Lowercase-insensitive name equality
pub(crate) fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Helpers shared by the code generator tests
#[cfg(test)]
pub(crate) mod testing {
    use crate::api::config::DbConfig;
    use crate::error::{Error, ErrorCode, Result};
    use crate::executor::{compile, ddl, Compiled};
    use crate::parser::parse;
    use crate::storage::Database;
    use crate::types::{StepResult, Value};
    use crate::vdbe::{Program, Vdbe};

    /// Run every statement of `sql` in turn; returns all rows produced
    pub fn exec(db: &mut Database, config: &DbConfig, sql: &str) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        for stmt in parse(sql)? {
            match compile(&db.schema, config, &stmt)? {
                Compiled::Program(p) => {
                    let mut vm = Vdbe::new(p);
                    vm.set_max_trigger_depth(config.max_trigger_depth);
                    while vm.step(db)? == StepResult::Row {
                        rows.push(vm.row().to_vec());
                    }
                }
                Compiled::Direct(stmt) => ddl::execute_direct(db, config, &stmt)?,
            }
        }
        Ok(rows)
    }

    /// Program of the first statement of `sql`
    pub fn program(db: &Database, config: &DbConfig, sql: &str) -> Result<Program> {
        let stmt = parse(sql)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "no statement"))?;
        match compile(&db.schema, config, &stmt)? {
            Compiled::Program(p) => Ok(p),
            Compiled::Direct(_) => Err(Error::with_message(ErrorCode::Misuse, "not a compiled statement")),
        }
    }
}
