//! VDBE Execution Engine
//!
//! Runs a `Program` one instruction at a time. State lives in frames: the
//! root frame belongs to the statement and every trigger invocation pushes
//! a frame of its own with private registers and cursors. Cursors hold
//! their position as a key (rowid or index key), so they stay valid while
//! the trees underneath them change.
//!
//! Transient tables, indexes and queues live in a b-tree set owned by the
//! VM and disappear with it.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::error::{ConstraintKind, Error, ErrorCode, Result};
use crate::functions::{scalar_function, AggregateState};
use crate::parser::ast::ConflictAction;
use crate::schema::Affinity;
use crate::storage::btree::{table_next, table_prev};
use crate::storage::{Btree, Database, Snapshot};
use crate::types::{Pgno, RowId, StepResult, Value};
use crate::vdbe::explain::explain_rows;
use crate::vdbe::ops::{cmp_flags, opflag, KeyInfo, Opcode, VdbeOp, P4};
use crate::vdbe::record::{decode_record, make_record};
use crate::vdbe::value::{
    apply_affinity, apply_comparison_affinity, arith, bitwise, cast_value, compare_keys,
    compare_values, concat, must_be_int, negate, ArithOp, BitOp, Collation,
};
use crate::vdbe::Program;

static NULL: Value = Value::Null;

/// Result of a single instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecResult {
    Continue,
    Row,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Ready,
    Running,
    Halted,
}

// ============================================================================
// Cursors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorKind {
    Table,
    Index,
    Sorter,
    /// Reads the record held in a register
    Pseudo(i32),
}

#[derive(Debug)]
struct VdbeCursor {
    kind: CursorKind,
    root: Pgno,
    ephemeral: bool,
    key_info: Arc<KeyInfo>,
    rowid: Option<RowId>,
    key: Option<Vec<Value>>,
    eof: bool,
    null_row: bool,
    /// Decoded row and the write epoch it was read in
    cache: Option<(u64, Vec<Value>)>,
    sorter: Vec<Vec<Value>>,
    sorter_pos: usize,
    sorted: bool,
    seq: i64,
}

impl VdbeCursor {
    fn new(kind: CursorKind, root: Pgno, ephemeral: bool, key_info: Arc<KeyInfo>) -> Self {
        VdbeCursor {
            kind,
            root,
            ephemeral,
            key_info,
            rowid: None,
            key: None,
            eof: true,
            null_row: false,
            cache: None,
            sorter: Vec::new(),
            sorter_pos: 0,
            sorted: false,
            seq: 0,
        }
    }

    fn place_row(&mut self, rowid: Option<RowId>) -> bool {
        self.null_row = false;
        self.cache = None;
        self.eof = rowid.is_none();
        if rowid.is_some() {
            self.rowid = rowid;
        }
        !self.eof
    }

    fn place_key(&mut self, key: Option<Vec<Value>>) -> bool {
        self.null_row = false;
        self.eof = key.is_none();
        if key.is_some() {
            self.key = key;
        }
        !self.eof
    }

    fn sort(&mut self) {
        if !self.sorted {
            let ki = &self.key_info;
            self.sorter
                .sort_by(|a, b| compare_keys(a, b, ki.n_key_field, |i| ki.collation(i), |i| ki.is_desc(i)));
            self.sorted = true;
        }
    }

    fn first(&mut self, bt: &Btree) -> Result<bool> {
        match self.kind {
            CursorKind::Table => {
                let r = table_next(bt.table(self.root)?, None);
                Ok(self.place_row(r))
            }
            CursorKind::Index => {
                let k = bt.index(self.root)?.first().cloned();
                Ok(self.place_key(k))
            }
            CursorKind::Sorter => {
                self.sort();
                self.sorter_pos = 0;
                self.null_row = false;
                self.eof = self.sorter.is_empty();
                Ok(!self.eof)
            }
            CursorKind::Pseudo(_) => Ok(true),
        }
    }

    fn last(&mut self, bt: &Btree) -> Result<bool> {
        match self.kind {
            CursorKind::Table => {
                let r = table_prev(bt.table(self.root)?, None);
                Ok(self.place_row(r))
            }
            CursorKind::Index => {
                let k = bt.index(self.root)?.last().cloned();
                Ok(self.place_key(k))
            }
            CursorKind::Sorter => {
                self.sort();
                self.sorter_pos = self.sorter.len().saturating_sub(1);
                self.null_row = false;
                self.eof = self.sorter.is_empty();
                Ok(!self.eof)
            }
            CursorKind::Pseudo(_) => Ok(true),
        }
    }

    fn next(&mut self, bt: &Btree) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.kind {
            CursorKind::Table => {
                let r = table_next(bt.table(self.root)?, self.rowid);
                Ok(self.place_row(r))
            }
            CursorKind::Index => {
                let idx = bt.index(self.root)?;
                let k = self.key.as_ref().and_then(|k| idx.next_after(k).cloned());
                Ok(self.place_key(k))
            }
            CursorKind::Sorter => {
                self.sorter_pos += 1;
                self.eof = self.sorter_pos >= self.sorter.len();
                Ok(!self.eof)
            }
            CursorKind::Pseudo(_) => Ok(false),
        }
    }

    fn prev(&mut self, bt: &Btree) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.kind {
            CursorKind::Table => {
                let r = match self.rowid {
                    Some(cur) => table_prev(bt.table(self.root)?, Some(cur)),
                    None => None,
                };
                Ok(self.place_row(r))
            }
            CursorKind::Index => {
                let idx = bt.index(self.root)?;
                let k = self.key.as_ref().and_then(|k| idx.prev_before(k).cloned());
                Ok(self.place_key(k))
            }
            CursorKind::Sorter => {
                if self.sorter_pos == 0 {
                    self.eof = true;
                } else {
                    self.sorter_pos -= 1;
                }
                Ok(!self.eof)
            }
            CursorKind::Pseudo(_) => Ok(false),
        }
    }

    /// Decoded current row of a table cursor
    fn table_row(&mut self, bt: &Btree, epoch: u64) -> Result<Option<&Vec<Value>>> {
        if self.eof || self.null_row {
            return Ok(None);
        }
        let fresh = matches!(&self.cache, Some((e, _)) if *e == epoch);
        if !fresh {
            let Some(rowid) = self.rowid else {
                return Ok(None);
            };
            match bt.table(self.root)?.get(&rowid) {
                Some(bytes) => self.cache = Some((epoch, decode_record(bytes)?)),
                None => return Ok(None),
            }
        }
        Ok(self.cache.as_ref().map(|(_, row)| row))
    }

    /// Current entry of an index or sorter cursor
    fn current_key(&self) -> Option<&Vec<Value>> {
        if self.eof || self.null_row {
            return None;
        }
        match self.kind {
            CursorKind::Index => self.key.as_ref(),
            CursorKind::Sorter => self.sorter.get(self.sorter_pos),
            _ => None,
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug)]
struct Frame {
    /// Subprogram being run; `None` for the statement itself
    sub: Option<usize>,
    regs: Vec<Value>,
    cursors: Vec<Option<VdbeCursor>>,
    once: HashSet<usize>,
    aggs: HashMap<i32, AggregateState>,
    rowsets: HashMap<i32, BTreeSet<i64>>,
    param_base: i32,
    return_pc: usize,
    ignore_pc: usize,
}

impl Frame {
    fn new(sub: Option<usize>, n_mem: i32, n_cursor: i32) -> Self {
        Frame {
            sub,
            regs: vec![Value::Null; n_mem.max(0) as usize + 1],
            cursors: (0..n_cursor.max(0)).map(|_| None).collect(),
            once: HashSet::new(),
            aggs: HashMap::new(),
            rowsets: HashMap::new(),
            param_base: 0,
            return_pc: 0,
            ignore_pc: 0,
        }
    }

    fn reg(&self, r: i32) -> &Value {
        self.regs.get(r.max(0) as usize).unwrap_or(&NULL)
    }

    fn set(&mut self, r: i32, v: Value) {
        let i = r.max(0) as usize;
        if i >= self.regs.len() {
            self.regs.resize(i + 1, Value::Null);
        }
        self.regs[i] = v;
    }

    fn int(&self, r: i32) -> i64 {
        self.reg(r).to_i64()
    }

    fn range(&self, start: i32, n: i32) -> Vec<Value> {
        (start..start + n.max(0)).map(|r| self.reg(r).clone()).collect()
    }

    fn cursor(&self, i: i32) -> Result<&VdbeCursor> {
        self.cursors
            .get(i as usize)
            .and_then(|c| c.as_ref())
            .ok_or_else(|| no_cursor(i))
    }

    fn cursor_mut(&mut self, i: i32) -> Result<&mut VdbeCursor> {
        self.cursors
            .get_mut(i as usize)
            .and_then(|c| c.as_mut())
            .ok_or_else(|| no_cursor(i))
    }

    fn put_cursor(&mut self, i: i32, c: VdbeCursor) -> Option<VdbeCursor> {
        let i = i.max(0) as usize;
        if i >= self.cursors.len() {
            self.cursors.resize_with(i + 1, || None);
        }
        self.cursors[i].replace(c)
    }
}

fn no_cursor(i: i32) -> Error {
    Error::with_message(ErrorCode::Internal, format!("cursor {} is not open", i))
}

fn internal(msg: impl Into<String>) -> Error {
    Error::with_message(ErrorCode::Internal, msg)
}

macro_rules! frame {
    ($s:expr) => {
        match $s.stack.last() {
            Some(f) => f,
            None => &$s.root,
        }
    };
}

macro_rules! frame_mut {
    ($s:expr) => {
        match $s.stack.last_mut() {
            Some(f) => f,
            None => &mut $s.root,
        }
    };
}

macro_rules! tree {
    ($s:expr, $db:expr, $eph:expr) => {
        if $eph {
            &$s.ephemeral
        } else {
            &$db.btree
        }
    };
}

macro_rules! tree_mut {
    ($s:expr, $db:expr, $eph:expr) => {
        if $eph {
            &mut $s.ephemeral
        } else {
            &mut $db.btree
        }
    };
}

// ============================================================================
// Virtual Machine
// ============================================================================

/// A statement being executed
#[derive(Debug)]
pub struct Vdbe {
    program: Program,
    root: Frame,
    stack: Vec<Frame>,
    pc: usize,
    vars: Vec<Value>,
    state: RunState,
    row: Vec<Value>,
    ephemeral: Btree,
    next_ephemeral_root: Pgno,
    /// Bumped on every write; invalidates cursor row caches
    epoch: u64,
    stmt_snapshot: Option<Snapshot>,
    fk_counter: i64,
    n_change: i64,
    last_rowid: Option<RowId>,
    compare: Ordering,
    explain: Option<VecDeque<Vec<Value>>>,
    max_trigger_depth: usize,
}

impl Vdbe {
    pub fn new(program: Program) -> Self {
        let root = Frame::new(None, program.n_mem, program.n_cursor);
        let vars = vec![Value::Null; program.n_var];
        Vdbe {
            program,
            root,
            stack: Vec::new(),
            pc: 0,
            vars,
            state: RunState::Ready,
            row: Vec::new(),
            ephemeral: Btree::new(),
            next_ephemeral_root: 1,
            epoch: 0,
            stmt_snapshot: None,
            fk_counter: 0,
            n_change: 0,
            last_rowid: None,
            compare: Ordering::Equal,
            explain: None,
            max_trigger_depth: 1000,
        }
    }

    pub fn set_max_trigger_depth(&mut self, depth: usize) {
        self.max_trigger_depth = depth.max(1);
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The current result row
    pub fn row(&self) -> &[Value] {
        &self.row
    }

    /// Rows changed by the statement (trigger changes excluded)
    pub fn changes(&self) -> i64 {
        self.n_change
    }

    /// Rowid of the last row the statement itself inserted
    pub fn last_insert_rowid(&self) -> Option<RowId> {
        self.last_rowid
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn param_count(&self) -> usize {
        self.vars.len()
    }

    /// Bind parameter `i` (1-based)
    pub fn bind(&mut self, i: usize, value: Value) -> Result<()> {
        match i.checked_sub(1).and_then(|i| self.vars.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::with_message(ErrorCode::Range, "column index out of range")),
        }
    }

    pub fn clear_bindings(&mut self) {
        self.vars.iter_mut().for_each(|v| *v = Value::Null);
    }

    /// Rewind to the start; bindings are kept
    pub fn reset(&mut self) {
        self.root = Frame::new(None, self.program.n_mem, self.program.n_cursor);
        self.stack.clear();
        self.pc = 0;
        self.state = RunState::Ready;
        self.row.clear();
        self.ephemeral = Btree::new();
        self.next_ephemeral_root = 1;
        self.stmt_snapshot = None;
        self.fk_counter = 0;
        self.n_change = 0;
        self.last_rowid = None;
        self.explain = None;
    }

    /// Run until the next result row or the end of the program
    #[instrument(level = "trace", skip_all)]
    pub fn step(&mut self, db: &mut Database) -> Result<StepResult> {
        if self.state == RunState::Halted {
            self.reset();
        }
        self.state = RunState::Running;

        if self.program.explain {
            let rows = self
                .explain
                .get_or_insert_with(|| explain_rows(&self.program).into());
            return Ok(match rows.pop_front() {
                Some(row) => {
                    self.row = row;
                    StepResult::Row
                }
                None => {
                    self.state = RunState::Halted;
                    StepResult::Done
                }
            });
        }

        loop {
            match self.exec_op(db) {
                Ok(ExecResult::Continue) => {}
                Ok(ExecResult::Row) => return Ok(StepResult::Row),
                Ok(ExecResult::Done) => {
                    debug!(changes = self.n_change, "statement done");
                    self.finish();
                    return Ok(StepResult::Done);
                }
                Err(e) => {
                    if self.state != RunState::Halted {
                        self.undo(db, ConflictAction::Abort);
                    }
                    debug!(error = %e, "statement failed");
                    self.finish();
                    return Err(e);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.state = RunState::Halted;
        self.stack.clear();
        self.root.cursors.iter_mut().for_each(|c| *c = None);
        self.ephemeral = Btree::new();
        self.stmt_snapshot = None;
    }

    /// Undo the statement's effects according to `policy`
    fn undo(&mut self, db: &mut Database, policy: ConflictAction) {
        match policy {
            ConflictAction::Rollback => {
                if !db.rollback_if_active() {
                    if let Some(snap) = self.stmt_snapshot.take() {
                        db.restore(snap);
                    }
                }
                self.n_change = 0;
            }
            ConflictAction::Fail => {}
            _ => {
                if let Some(snap) = self.stmt_snapshot.take() {
                    db.restore(snap);
                }
                self.n_change = 0;
            }
        }
        self.state = RunState::Halted;
    }

    fn current_ops(&self) -> &[VdbeOp] {
        match self.stack.last() {
            Some(f) => f
                .sub
                .and_then(|i| self.program.subprograms.get(i))
                .map_or(&[][..], |s| s.ops.as_slice()),
            None => self.program.ops.as_slice(),
        }
    }

    fn in_root(&self) -> bool {
        self.stack.is_empty()
    }

    fn jump(&mut self, addr: i32) {
        self.pc = addr.max(0) as usize;
    }

    /// Successful end of the statement or of a trigger frame
    fn halt_ok(&mut self, ignore: bool) -> Result<ExecResult> {
        if let Some(frame) = self.stack.pop() {
            self.drop_frame_ephemerals(&frame);
            self.pc = if ignore { frame.ignore_pc } else { frame.return_pc };
            return Ok(ExecResult::Continue);
        }
        if self.fk_counter > 0 {
            return Err(Error::constraint(
                ConstraintKind::ForeignKey,
                "FOREIGN KEY constraint failed",
            ));
        }
        Ok(ExecResult::Done)
    }

    fn drop_frame_ephemerals(&mut self, frame: &Frame) {
        for c in frame.cursors.iter().flatten() {
            if c.ephemeral {
                self.ephemeral.drop_tree(c.root);
            }
        }
    }

    fn halt_error(&mut self, db: &mut Database, op: &VdbeOp) -> Error {
        let code = ErrorCode::from_i32(op.p1).unwrap_or(ErrorCode::Error);
        let message = match &op.p4 {
            P4::Text(m) => m.clone(),
            _ => code.as_str().to_string(),
        };
        let mut err = Error::with_message(code, message);
        if code == ErrorCode::Constraint {
            err.constraint = ConstraintKind::from_p5(op.p5);
        }
        let policy = ConflictAction::from_code(op.p2);
        debug!(error = %err, ?policy, "halt");
        self.undo(db, policy);
        err
    }

    fn alloc_ephemeral(&mut self) -> Pgno {
        let root = self.next_ephemeral_root;
        self.next_ephemeral_root += 1;
        root
    }

    /// Probe key for seek/found style instructions
    fn probe(&self, op: &VdbeOp) -> Result<Vec<Value>> {
        let f = frame!(self);
        let n = op.p4.as_int() as i32;
        if n == 0 {
            match f.reg(op.p3) {
                Value::Blob(rec) => decode_record(rec),
                other => Ok(vec![other.clone()]),
            }
        } else {
            Ok(f.range(op.p3, n))
        }
    }

    // ========================================================================
    // Instruction dispatch
    // ========================================================================

    fn exec_op(&mut self, db: &mut Database) -> Result<ExecResult> {
        let addr = self.pc;
        let op = match self.current_ops().get(addr) {
            Some(op) => op.clone(),
            None => return self.halt_ok(false),
        };
        self.pc += 1;
        trace!(addr, depth = self.stack.len(), op = %op, "exec");

        match op.opcode {
            // ================================================================
            // Control flow
            // ================================================================
            Opcode::Init | Opcode::Goto => self.jump(op.p2),

            Opcode::Noop => {}

            Opcode::Halt => {
                if op.p1 == 0 {
                    return self.halt_ok(op.p2 == ConflictAction::Ignore.code());
                }
                return Err(self.halt_error(db, &op));
            }

            Opcode::HaltIfNull => {
                if frame!(self).reg(op.p3).is_null() {
                    return Err(self.halt_error(db, &op));
                }
            }

            Opcode::Gosub => {
                let ret = self.pc as i64;
                frame_mut!(self).set(op.p1, Value::Integer(ret));
                self.jump(op.p2);
            }

            Opcode::Return => {
                let target = frame!(self).int(op.p1);
                self.jump(target as i32);
            }

            Opcode::InitCoroutine => {
                frame_mut!(self).set(op.p1, Value::Integer(op.p3 as i64));
                if op.p2 != 0 {
                    self.jump(op.p2);
                }
            }

            Opcode::Yield => {
                let f = frame_mut!(self);
                let target = f.int(op.p1);
                f.set(op.p1, Value::Integer(self.pc as i64));
                self.jump(target as i32);
            }

            Opcode::EndCoroutine => {
                let f = frame_mut!(self);
                let resume = f.int(op.p1) as usize;
                f.set(op.p1, Value::Integer(addr as i64));
                let caller = resume
                    .checked_sub(1)
                    .and_then(|a| self.current_ops().get(a))
                    .map(|o| o.p2)
                    .ok_or_else(|| internal("coroutine ended without a caller"))?;
                self.jump(caller);
            }

            Opcode::If | Opcode::IfNot => {
                let want = op.opcode == Opcode::If;
                let take = match frame!(self).reg(op.p1).truthiness() {
                    Some(b) => b == want,
                    None => op.p3 != 0,
                };
                if take {
                    self.jump(op.p2);
                }
            }

            Opcode::IsNull => {
                if frame!(self).reg(op.p1).is_null() {
                    self.jump(op.p2);
                }
            }

            Opcode::NotNull => {
                if !frame!(self).reg(op.p1).is_null() {
                    self.jump(op.p2);
                }
            }

            Opcode::IfPos => {
                let f = frame_mut!(self);
                let v = f.int(op.p1);
                if v > 0 {
                    f.set(op.p1, Value::Integer(v - op.p3 as i64));
                    self.jump(op.p2);
                }
            }

            Opcode::IfNotZero => {
                let f = frame_mut!(self);
                let v = f.int(op.p1);
                if v != 0 {
                    if v > 0 {
                        f.set(op.p1, Value::Integer(v - 1));
                    }
                    self.jump(op.p2);
                }
            }

            Opcode::DecrJumpZero => {
                let f = frame_mut!(self);
                let mut v = f.int(op.p1);
                if v > i64::MIN {
                    v -= 1;
                }
                f.set(op.p1, Value::Integer(v));
                if v == 0 {
                    self.jump(op.p2);
                }
            }

            Opcode::OffsetLimit => {
                let f = frame_mut!(self);
                let limit = f.int(op.p1);
                let v = if limit <= 0 {
                    -1
                } else {
                    limit.saturating_add(f.int(op.p3).max(0))
                };
                f.set(op.p2, Value::Integer(v));
            }

            Opcode::MustBeInt => {
                let f = frame_mut!(self);
                match must_be_int(f.reg(op.p1)) {
                    Ok(i) => f.set(op.p1, Value::Integer(i)),
                    Err(_) if op.p2 != 0 => self.jump(op.p2),
                    Err(_) => return Err(Error::with_message(ErrorCode::Mismatch, "datatype mismatch")),
                }
            }

            Opcode::Once => {
                if !frame_mut!(self).once.insert(addr) {
                    self.jump(op.p2);
                }
            }

            Opcode::Program => {
                let idx = match op.p4 {
                    P4::Subprogram(i) => i,
                    _ => return Err(internal("Program without a subprogram")),
                };
                if op.p5 != 0 && self.stack.iter().any(|f| f.sub == Some(idx)) {
                    return Ok(ExecResult::Continue);
                }
                if self.stack.len() >= self.max_trigger_depth {
                    return Err(Error::sql("too many levels of trigger recursion"));
                }
                let sub = self
                    .program
                    .subprograms
                    .get(idx)
                    .ok_or_else(|| internal(format!("no subprogram {}", idx)))?;
                trace!(trigger = %sub.name, depth = self.stack.len() + 1, "enter trigger");
                let mut frame = Frame::new(Some(idx), sub.n_mem, sub.n_cursor);
                frame.param_base = op.p1;
                frame.return_pc = self.pc;
                frame.ignore_pc = op.p2.max(0) as usize;
                self.stack.push(frame);
                self.pc = 0;
            }

            Opcode::Param => {
                let n = self.stack.len();
                let (base, value) = match n {
                    0 => return Err(internal("Param outside a trigger")),
                    1 => {
                        let base = self.stack[0].param_base;
                        (base, self.root.reg(base + op.p1).clone())
                    }
                    _ => {
                        let base = self.stack[n - 1].param_base;
                        (base, self.stack[n - 2].reg(base + op.p1).clone())
                    }
                };
                trace!(reg = base + op.p1, %value, "param");
                frame_mut!(self).set(op.p2, value);
            }

            Opcode::FkCounter => {
                self.fk_counter += op.p2 as i64;
            }

            Opcode::FkIfZero => {
                if self.fk_counter == 0 {
                    self.jump(op.p2);
                }
            }

            Opcode::Transaction => {
                db.verify_cookie(op.p3 as u32)?;
                if op.p2 != 0 && self.in_root() {
                    self.stmt_snapshot = Some(db.snapshot());
                }
            }

            // ================================================================
            // Data movement
            // ================================================================
            Opcode::Null => {
                let f = frame_mut!(self);
                let last = op.p3.max(op.p2);
                for r in op.p2..=last {
                    f.set(r, Value::Null);
                    f.aggs.remove(&r);
                    f.rowsets.remove(&r);
                }
            }

            Opcode::Integer => frame_mut!(self).set(op.p2, Value::Integer(op.p1 as i64)),

            Opcode::Int64 => frame_mut!(self).set(op.p2, Value::Integer(op.p4.as_int())),

            Opcode::Real => {
                let v = match op.p4 {
                    P4::Real(r) => Value::Real(r),
                    _ => Value::Null,
                };
                frame_mut!(self).set(op.p2, v);
            }

            Opcode::String8 => {
                let v = match op.p4 {
                    P4::Text(s) => Value::Text(s),
                    _ => Value::Null,
                };
                frame_mut!(self).set(op.p2, v);
            }

            Opcode::Blob => {
                let v = match op.p4 {
                    P4::Blob(b) => Value::Blob(b),
                    _ => Value::Null,
                };
                frame_mut!(self).set(op.p2, v);
            }

            Opcode::Variable => {
                let v = usize::try_from(op.p1 - 1)
                    .ok()
                    .and_then(|i| self.vars.get(i))
                    .cloned()
                    .unwrap_or(Value::Null);
                frame_mut!(self).set(op.p2, v);
            }

            Opcode::Copy => {
                let f = frame_mut!(self);
                for i in 0..=op.p3 {
                    let v = f.reg(op.p1 + i).clone();
                    f.set(op.p2 + i, v);
                }
            }

            Opcode::SCopy => {
                let f = frame_mut!(self);
                let v = f.reg(op.p1).clone();
                f.set(op.p2, v);
            }

            Opcode::Move => {
                let f = frame_mut!(self);
                let vals = f.range(op.p1, op.p3);
                for (i, v) in vals.into_iter().enumerate() {
                    f.set(op.p1 + i as i32, Value::Null);
                    f.set(op.p2 + i as i32, v);
                }
            }

            Opcode::IntCopy => {
                let f = frame_mut!(self);
                let v = f.int(op.p1);
                f.set(op.p2, Value::Integer(v));
            }

            Opcode::ResultRow => {
                self.row = frame!(self).range(op.p1, op.p2);
                return Ok(ExecResult::Row);
            }

            // ================================================================
            // Comparison and logic
            // ================================================================
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                self.exec_compare(&op);
            }

            Opcode::Compare => {
                let ki = match &op.p4 {
                    P4::KeyInfo(k) => k.clone(),
                    _ => Arc::new(KeyInfo::new(op.p3.max(0) as usize)),
                };
                let f = frame!(self);
                let a = f.range(op.p1, op.p3);
                let b = f.range(op.p2, op.p3);
                self.compare = compare_keys(&a, &b, a.len(), |i| ki.collation(i), |i| ki.is_desc(i));
            }

            Opcode::Jump => {
                let target = match self.compare {
                    Ordering::Less => op.p1,
                    Ordering::Equal => op.p2,
                    Ordering::Greater => op.p3,
                };
                self.jump(target);
            }

            Opcode::And | Opcode::Or => {
                let f = frame_mut!(self);
                let a = f.reg(op.p1).truthiness();
                let b = f.reg(op.p2).truthiness();
                let v = if op.opcode == Opcode::And {
                    match (a, b) {
                        (Some(false), _) | (_, Some(false)) => Some(false),
                        (Some(true), Some(true)) => Some(true),
                        _ => None,
                    }
                } else {
                    match (a, b) {
                        (Some(true), _) | (_, Some(true)) => Some(true),
                        (Some(false), Some(false)) => Some(false),
                        _ => None,
                    }
                };
                f.set(op.p3, v.map_or(Value::Null, |b| Value::Integer(b as i64)));
            }

            Opcode::Not => {
                let f = frame_mut!(self);
                let v = f.reg(op.p1).truthiness();
                f.set(op.p2, v.map_or(Value::Null, |b| Value::Integer(!b as i64)));
            }

            Opcode::IsTrue => {
                let f = frame_mut!(self);
                let v = f.reg(op.p1).truthiness().unwrap_or(op.p3 != 0) ^ (op.p5 != 0);
                f.set(op.p2, Value::Integer(v as i64));
            }

            Opcode::BitNot => {
                let f = frame_mut!(self);
                let v = match f.reg(op.p1) {
                    Value::Null => Value::Null,
                    other => Value::Integer(!other.to_i64()),
                };
                f.set(op.p2, v);
            }

            Opcode::Negate => {
                let f = frame_mut!(self);
                let v = negate(f.reg(op.p1));
                f.set(op.p2, v);
            }

            // ================================================================
            // Arithmetic
            // ================================================================
            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::Remainder
            | Opcode::Concat
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::ShiftLeft
            | Opcode::ShiftRight => {
                let f = frame_mut!(self);
                let (a, b) = (f.reg(op.p1), f.reg(op.p2));
                let v = match op.opcode {
                    Opcode::Add => arith(ArithOp::Add, a, b),
                    Opcode::Subtract => arith(ArithOp::Subtract, a, b),
                    Opcode::Multiply => arith(ArithOp::Multiply, a, b),
                    Opcode::Divide => arith(ArithOp::Divide, a, b),
                    Opcode::Remainder => arith(ArithOp::Remainder, a, b),
                    Opcode::Concat => concat(a, b),
                    Opcode::BitAnd => bitwise(BitOp::And, a, b),
                    Opcode::BitOr => bitwise(BitOp::Or, a, b),
                    Opcode::ShiftLeft => bitwise(BitOp::ShiftLeft, a, b),
                    _ => bitwise(BitOp::ShiftRight, a, b),
                };
                f.set(op.p3, v);
            }

            Opcode::AddImm => {
                let f = frame_mut!(self);
                let v = f.int(op.p1).wrapping_add(op.p2 as i64);
                f.set(op.p1, Value::Integer(v));
            }

            Opcode::Cast => {
                let aff = Affinity::from_p5(op.p2 as u16).unwrap_or(Affinity::Blob);
                let f = frame_mut!(self);
                let v = cast_value(f.reg(op.p1).clone(), aff);
                f.set(op.p1, v);
            }

            Opcode::Affinity => {
                if let P4::Text(affs) = &op.p4 {
                    let f = frame_mut!(self);
                    apply_affinity_string(f, op.p1, op.p2, affs);
                }
            }

            Opcode::Function => {
                let name = match &op.p4 {
                    P4::Func(n) => n.to_ascii_lowercase(),
                    _ => return Err(internal("Function without a name")),
                };
                let argc = op.p5 as usize;
                let func = scalar_function(&name, argc)
                    .ok_or_else(|| Error::sql(format!("no such function: {}", name)))?;
                let f = frame_mut!(self);
                let args = f.range(op.p2, argc as i32);
                let v = func(&args)?;
                f.set(op.p3, v);
            }

            Opcode::AggStep => {
                let name = match &op.p4 {
                    P4::Func(n) => n.to_ascii_lowercase(),
                    _ => return Err(internal("AggStep without a name")),
                };
                let f = frame_mut!(self);
                let args = f.range(op.p2, op.p5 as i32);
                let state = match f.aggs.entry(op.p3) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => e.insert(
                        AggregateState::new(&name)
                            .ok_or_else(|| Error::sql(format!("no such function: {}", name)))?,
                    ),
                };
                state.step(&args, Collation::from_code(op.p1))?;
            }

            Opcode::AggFinal => {
                let name = match &op.p4 {
                    P4::Func(n) => n.to_ascii_lowercase(),
                    _ => return Err(internal("AggFinal without a name")),
                };
                let f = frame_mut!(self);
                let v = match f.aggs.remove(&op.p1) {
                    Some(state) => state.finalize(),
                    None => AggregateState::new(&name)
                        .map(|s| s.finalize())
                        .unwrap_or(Value::Null),
                };
                f.set(op.p1, v);
            }

            Opcode::MemMax => {
                let v = frame!(self).int(op.p2);
                let cur = self.root.int(op.p1);
                if v > cur || self.root.reg(op.p1).is_null() {
                    self.root.set(op.p1, Value::Integer(v));
                }
            }

            // ================================================================
            // Cursor open and close
            // ================================================================
            Opcode::OpenRead | Opcode::OpenWrite => {
                let root = op.p2 as Pgno;
                if !db.btree.exists(root) {
                    return Err(internal(format!("no b-tree at root {}", root)));
                }
                let cursor = match &op.p4 {
                    P4::KeyInfo(ki) => VdbeCursor::new(CursorKind::Index, root, false, ki.clone()),
                    _ => VdbeCursor::new(CursorKind::Table, root, false, Arc::new(KeyInfo::default())),
                };
                frame_mut!(self).put_cursor(op.p1, cursor);
            }

            Opcode::OpenEphemeral => {
                let root = self.alloc_ephemeral();
                let cursor = match &op.p4 {
                    P4::KeyInfo(ki) => {
                        self.ephemeral.create_index(root, ki.clone());
                        VdbeCursor::new(CursorKind::Index, root, true, ki.clone())
                    }
                    _ => {
                        self.ephemeral.create_table(root);
                        VdbeCursor::new(CursorKind::Table, root, true, Arc::new(KeyInfo::default()))
                    }
                };
                if let Some(old) = frame_mut!(self).put_cursor(op.p1, cursor) {
                    if old.ephemeral {
                        self.ephemeral.drop_tree(old.root);
                    }
                }
            }

            Opcode::OpenPseudo => {
                let cursor = VdbeCursor::new(CursorKind::Pseudo(op.p2), 0, false, Arc::new(KeyInfo::default()));
                frame_mut!(self).put_cursor(op.p1, cursor);
            }

            Opcode::SorterOpen => {
                let ki = match &op.p4 {
                    P4::KeyInfo(k) => k.clone(),
                    _ => Arc::new(KeyInfo::new(op.p2.max(0) as usize)),
                };
                frame_mut!(self).put_cursor(op.p1, VdbeCursor::new(CursorKind::Sorter, 0, false, ki));
            }

            Opcode::Close => {
                let f = frame_mut!(self);
                if let Some(slot) = f.cursors.get_mut(op.p1 as usize) {
                    if let Some(old) = slot.take() {
                        if old.ephemeral {
                            self.ephemeral.drop_tree(old.root);
                        }
                    }
                }
            }

            Opcode::NullRow => {
                let f = frame_mut!(self);
                let open = f.cursors.get(op.p1 as usize).map_or(false, Option::is_some);
                if open {
                    let c = f.cursor_mut(op.p1)?;
                    c.null_row = true;
                    c.eof = true;
                    c.cache = None;
                } else {
                    let mut c = VdbeCursor::new(CursorKind::Pseudo(0), 0, false, Arc::new(KeyInfo::default()));
                    c.null_row = true;
                    f.put_cursor(op.p1, c);
                }
            }

            Opcode::IfNullRow => {
                let f = frame_mut!(self);
                let null_row = f.cursors.get(op.p1 as usize).and_then(|c| c.as_ref()).map_or(true, |c| c.null_row);
                if null_row {
                    f.set(op.p3, Value::Null);
                    self.jump(op.p2);
                }
            }

            // ================================================================
            // Cursor movement
            // ================================================================
            Opcode::Rewind | Opcode::Last | Opcode::SorterSort => {
                let c = frame_mut!(self).cursor_mut(op.p1)?;
                let bt = tree!(self, db, c.ephemeral);
                let found = if op.opcode == Opcode::Last { c.last(bt)? } else { c.first(bt)? };
                if !found {
                    self.jump(op.p2);
                }
            }

            Opcode::Next | Opcode::Prev | Opcode::SorterNext => {
                let c = frame_mut!(self).cursor_mut(op.p1)?;
                let bt = tree!(self, db, c.ephemeral);
                let more = if op.opcode == Opcode::Prev { c.prev(bt)? } else { c.next(bt)? };
                if more {
                    self.jump(op.p2);
                }
            }

            Opcode::SeekRowid | Opcode::NotExists => {
                let target = match apply_affinity(frame!(self).reg(op.p3).clone(), Affinity::Numeric) {
                    Value::Integer(i) => Some(i),
                    _ => None,
                };
                let c = frame_mut!(self).cursor_mut(op.p1)?;
                let bt = tree!(self, db, c.ephemeral);
                let hit = match target {
                    Some(r) if bt.table(c.root)?.contains_key(&r) => Some(r),
                    _ => None,
                };
                if !c.place_row(hit) {
                    self.jump(op.p2);
                }
            }

            Opcode::SeekGE | Opcode::SeekGT | Opcode::SeekLE | Opcode::SeekLT => {
                let probe = self.probe(&op)?;
                let c = frame_mut!(self).cursor_mut(op.p1)?;
                let bt = tree!(self, db, c.ephemeral);
                let found = match c.kind {
                    CursorKind::Table => {
                        let target = probe.first().cloned().unwrap_or(Value::Null);
                        let r = seek_rowid(bt.table(c.root)?, op.opcode, &target);
                        c.place_row(r)
                    }
                    CursorKind::Index => {
                        let idx = bt.index(c.root)?;
                        let k = match op.opcode {
                            Opcode::SeekGE => idx.seek_ge(&probe, false),
                            Opcode::SeekGT => idx.seek_ge(&probe, true),
                            Opcode::SeekLE => idx.seek_le(&probe, false),
                            _ => idx.seek_le(&probe, true),
                        }
                        .cloned();
                        c.place_key(k)
                    }
                    _ => return Err(internal("seek on a cursor without a tree")),
                };
                if !found {
                    self.jump(op.p2);
                }
            }

            Opcode::IdxGE | Opcode::IdxGT | Opcode::IdxLE | Opcode::IdxLT => {
                let probe = self.probe(&op)?;
                let c = frame!(self).cursor(op.p1)?;
                let key = c.current_key().ok_or_else(|| internal("index compare on an unpositioned cursor"))?;
                let ki = &c.key_info;
                let ord = compare_keys(key, &probe, probe.len(), |i| ki.collation(i), |i| ki.is_desc(i));
                let take = match op.opcode {
                    Opcode::IdxGE => ord != Ordering::Less,
                    Opcode::IdxGT => ord == Ordering::Greater,
                    Opcode::IdxLE => ord != Ordering::Greater,
                    _ => ord == Ordering::Less,
                };
                if take {
                    self.jump(op.p2);
                }
            }

            Opcode::Found | Opcode::NotFound | Opcode::NoConflict => {
                let probe = self.probe(&op)?;
                let has_null = probe.iter().any(Value::is_null);
                let c = frame_mut!(self).cursor_mut(op.p1)?;
                let bt = tree!(self, db, c.ephemeral);
                let hit = if op.opcode == Opcode::NoConflict && has_null {
                    None
                } else {
                    bt.index(c.root)?.contains_prefix(&probe).cloned()
                };
                let found = c.place_key(hit);
                let take = match op.opcode {
                    Opcode::Found => found,
                    _ => !found,
                };
                if take {
                    self.jump(op.p2);
                }
            }

            // ================================================================
            // Reading rows
            // ================================================================
            Opcode::Column => {
                let default = match &op.p4 {
                    P4::Value(v) => v.clone(),
                    _ => Value::Null,
                };
                let epoch = self.epoch;
                let f = frame_mut!(self);
                let (kind, null_row) = {
                    let c = f.cursor(op.p1)?;
                    (c.kind, c.null_row)
                };
                let col = op.p2.max(0) as usize;
                let v = if null_row {
                    Value::Null
                } else {
                    match kind {
                        CursorKind::Table => {
                            let c = f.cursor_mut(op.p1)?;
                            let bt = tree!(self, db, c.ephemeral);
                            match c.table_row(bt, epoch)? {
                                Some(row) => row.get(col).cloned().unwrap_or(default),
                                None => Value::Null,
                            }
                        }
                        CursorKind::Index | CursorKind::Sorter => f
                            .cursor(op.p1)?
                            .current_key()
                            .and_then(|k| k.get(col))
                            .cloned()
                            .unwrap_or(Value::Null),
                        CursorKind::Pseudo(reg) => match f.reg(reg) {
                            Value::Blob(rec) => decode_record(rec)?.get(col).cloned().unwrap_or(default),
                            _ => Value::Null,
                        },
                    }
                };
                f.set(op.p3, v);
            }

            Opcode::Rowid => {
                let c = frame!(self).cursor(op.p1)?;
                let v = match (c.kind, c.null_row || c.eof) {
                    (CursorKind::Table, false) => c.rowid.map_or(Value::Null, Value::Integer),
                    (CursorKind::Index | CursorKind::Sorter, false) => {
                        c.current_key().and_then(|k| k.last()).cloned().unwrap_or(Value::Null)
                    }
                    _ => Value::Null,
                };
                frame_mut!(self).set(op.p2, v);
            }

            Opcode::IdxRowid => {
                let c = frame!(self).cursor(op.p1)?;
                let v = c.current_key().and_then(|k| k.last()).cloned().unwrap_or(Value::Null);
                frame_mut!(self).set(op.p2, v);
            }

            Opcode::RowData | Opcode::SorterData => {
                let f = frame!(self);
                let c = f.cursor(op.p1)?;
                let rec = match c.kind {
                    CursorKind::Table => {
                        let bt = tree!(self, db, c.ephemeral);
                        c.rowid
                            .filter(|_| !c.eof)
                            .and_then(|r| bt.table(c.root).ok().and_then(|t| t.get(&r).cloned()))
                            .unwrap_or_default()
                    }
                    CursorKind::Pseudo(reg) => f.reg(reg).to_blob(),
                    _ => c.current_key().map(|k| make_record(k)).unwrap_or_default(),
                };
                frame_mut!(self).set(op.p2, Value::Blob(rec));
            }

            Opcode::Count => {
                let c = frame!(self).cursor(op.p1)?;
                let n = match c.kind {
                    CursorKind::Sorter => c.sorter.len(),
                    CursorKind::Pseudo(_) => 1,
                    _ => tree!(self, db, c.ephemeral).tree(c.root)?.len(),
                };
                frame_mut!(self).set(op.p2, Value::Integer(n as i64));
            }

            Opcode::Sequence => {
                let c = frame_mut!(self).cursor_mut(op.p1)?;
                let v = c.seq;
                c.seq += 1;
                frame_mut!(self).set(op.p2, Value::Integer(v));
            }

            Opcode::MakeRecord => {
                let f = frame_mut!(self);
                if let P4::Text(affs) = &op.p4 {
                    apply_affinity_string(f, op.p1, op.p2, affs);
                }
                let rec = make_record(&f.range(op.p1, op.p2));
                f.set(op.p3, Value::Blob(rec));
            }

            // ================================================================
            // Writing rows
            // ================================================================
            Opcode::NewRowid => {
                let floor = if op.p3 != 0 { Some(self.root.int(op.p3)) } else { None };
                let c = frame!(self).cursor(op.p1)?;
                let table = tree!(self, db, c.ephemeral).table(c.root)?;
                let max = table.keys().next_back().copied().unwrap_or(0);
                let rowid = match floor {
                    Some(seq) => {
                        let base = max.max(seq);
                        if base == i64::MAX {
                            return Err(Error::new(ErrorCode::Full));
                        }
                        base + 1
                    }
                    None if max < i64::MAX => max + 1,
                    None => (1..=i64::MAX)
                        .take(1 << 20)
                        .find(|r| !table.contains_key(r))
                        .ok_or_else(|| Error::new(ErrorCode::Full))?,
                };
                if op.p3 != 0 {
                    self.root.set(op.p3, Value::Integer(rowid));
                }
                frame_mut!(self).set(op.p2, Value::Integer(rowid));
            }

            Opcode::Insert => {
                let f = frame_mut!(self);
                let rec = f.reg(op.p2).to_blob();
                let rowid = f.int(op.p3);
                let c = f.cursor_mut(op.p1)?;
                tree_mut!(self, db, c.ephemeral).table_mut(c.root)?.insert(rowid, rec);
                c.place_row(Some(rowid));
                self.epoch += 1;
                if self.in_root() {
                    if op.p5 & opflag::NCHANGE != 0 {
                        self.n_change += 1;
                    }
                    if op.p5 & opflag::LASTROWID != 0 {
                        self.last_rowid = Some(rowid);
                    }
                }
            }

            Opcode::IdxInsert => {
                let f = frame_mut!(self);
                let key = match f.reg(op.p2) {
                    Value::Blob(rec) => decode_record(rec)?,
                    other => vec![other.clone()],
                };
                let c = f.cursor_mut(op.p1)?;
                match c.kind {
                    CursorKind::Sorter => {
                        c.sorter.push(key);
                        c.sorted = false;
                    }
                    _ => {
                        tree_mut!(self, db, c.ephemeral).index_mut(c.root)?.insert(key.clone());
                        c.place_key(Some(key));
                    }
                }
                self.epoch += 1;
                if self.in_root() && op.p5 & opflag::NCHANGE != 0 {
                    self.n_change += 1;
                }
            }

            Opcode::SorterInsert => {
                let f = frame_mut!(self);
                let entry = match f.reg(op.p2) {
                    Value::Blob(rec) => decode_record(rec)?,
                    other => vec![other.clone()],
                };
                let c = f.cursor_mut(op.p1)?;
                c.sorter.push(entry);
                c.sorted = false;
            }

            Opcode::Delete => {
                let c = frame_mut!(self).cursor_mut(op.p1)?;
                let bt = tree_mut!(self, db, c.ephemeral);
                match c.kind {
                    CursorKind::Table => {
                        if let Some(r) = c.rowid.filter(|_| !c.eof) {
                            bt.table_mut(c.root)?.remove(&r);
                        }
                    }
                    CursorKind::Index => {
                        if let Some(k) = c.key.as_ref().filter(|_| !c.eof) {
                            bt.index_mut(c.root)?.delete(k);
                        }
                    }
                    _ => return Err(internal("delete through a cursor without a tree")),
                }
                c.cache = None;
                self.epoch += 1;
                if self.in_root() && op.p5 & opflag::NCHANGE != 0 {
                    self.n_change += 1;
                }
            }

            Opcode::IdxDelete => {
                let probe = frame!(self).range(op.p2, op.p3);
                let c = frame_mut!(self).cursor_mut(op.p1)?;
                tree_mut!(self, db, c.ephemeral).index_mut(c.root)?.delete(&probe);
                self.epoch += 1;
            }

            Opcode::Clear => {
                let n = db.btree.clear(op.p1 as Pgno)?;
                self.epoch += 1;
                if self.in_root() && op.p5 != 0 {
                    self.n_change += n as i64;
                }
            }

            Opcode::ResetSorter => {
                let c = frame_mut!(self).cursor_mut(op.p1)?;
                match c.kind {
                    CursorKind::Sorter => {
                        c.sorter.clear();
                        c.sorted = false;
                    }
                    _ => {
                        self.ephemeral.clear(c.root)?;
                    }
                }
                c.eof = true;
                c.cache = None;
            }

            Opcode::RowSetAdd => {
                let f = frame_mut!(self);
                let v = f.int(op.p2);
                f.rowsets.entry(op.p1).or_default().insert(v);
            }

            Opcode::RowSetRead => {
                let f = frame_mut!(self);
                match f.rowsets.get_mut(&op.p1).and_then(|s| s.pop_first()) {
                    Some(v) => f.set(op.p3, Value::Integer(v)),
                    None => {
                        f.rowsets.remove(&op.p1);
                        self.jump(op.p2);
                    }
                }
            }
        }

        Ok(ExecResult::Continue)
    }

    fn exec_compare(&mut self, op: &VdbeOp) {
        let f = frame_mut!(self);
        let (a, b) = (f.reg(op.p1), f.reg(op.p3));
        let aff = Affinity::from_p5(op.p5 & cmp_flags::AFFINITY_MASK);
        let coll = match op.p4 {
            P4::Collation(c) => c,
            _ => Collation::Binary,
        };
        let result = if a.is_null() || b.is_null() {
            if op.p5 & cmp_flags::NULLEQ != 0 {
                let eq = a.is_null() && b.is_null();
                Some(match op.opcode {
                    Opcode::Eq => eq,
                    Opcode::Ne => !eq,
                    _ => false,
                })
            } else {
                None
            }
        } else {
            let a = apply_comparison_affinity(a, aff);
            let b = apply_comparison_affinity(b, aff);
            let ord = compare_values(&a, &b, coll);
            Some(match op.opcode {
                Opcode::Eq => ord == Ordering::Equal,
                Opcode::Ne => ord != Ordering::Equal,
                Opcode::Lt => ord == Ordering::Less,
                Opcode::Le => ord != Ordering::Greater,
                Opcode::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            })
        };
        if op.p5 & cmp_flags::STOREP2 != 0 {
            f.set(op.p2, result.map_or(Value::Null, |b| Value::Integer(b as i64)));
        } else {
            let take = match result {
                Some(b) => b,
                None => op.p5 & cmp_flags::JUMPIFNULL != 0,
            };
            if take {
                self.jump(op.p2);
            }
        }
    }
}

/// Apply an affinity string to consecutive registers in place
fn apply_affinity_string(f: &mut Frame, start: i32, n: i32, affs: &str) {
    for (i, ch) in affs.chars().take(n.max(0) as usize).enumerate() {
        if let Some(aff) = Affinity::from_char(ch) {
            let r = start + i as i32;
            let v = apply_affinity(f.reg(r).clone(), aff);
            f.set(r, v);
        }
    }
}

/// Rowid seek on a table tree; non-integer targets land between rowids
fn seek_rowid(
    table: &std::collections::BTreeMap<RowId, Vec<u8>>,
    opcode: Opcode,
    target: &Value,
) -> Option<RowId> {
    let forward = matches!(opcode, Opcode::SeekGE | Opcode::SeekGT);
    let bound = match apply_affinity(target.clone(), Affinity::Numeric) {
        Value::Integer(i) => match opcode {
            Opcode::SeekGT => i.checked_add(1),
            Opcode::SeekLT => i.checked_sub(1),
            _ => Some(i),
        },
        Value::Real(x) => {
            let whole = x.fract() == 0.0;
            let b = match opcode {
                Opcode::SeekGE => x.ceil(),
                Opcode::SeekGT if whole => x + 1.0,
                Opcode::SeekGT => x.ceil(),
                Opcode::SeekLE => x.floor(),
                Opcode::SeekLT if whole => x - 1.0,
                _ => x.floor(),
            };
            if b >= 9.2233720368547758e18 {
                if forward {
                    None
                } else {
                    Some(i64::MAX)
                }
            } else if b < -9.2233720368547758e18 {
                if forward {
                    Some(i64::MIN)
                } else {
                    None
                }
            } else {
                Some(b as i64)
            }
        }
        Value::Null => None,
        // text and blobs sort after every number
        _ => {
            if forward {
                None
            } else {
                Some(i64::MAX)
            }
        }
    }?;
    if forward {
        table.range(bound..).next().map(|(k, _)| *k)
    } else {
        table.range(..=bound).next_back().map(|(k, _)| *k)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdbe::builder::VdbeBuilder;

    fn program(b: VdbeBuilder, n_var: usize) -> Program {
        let n_mem = b.n_mem();
        let n_cursor = b.n_cursor();
        Program {
            ops: Arc::new(b.finish().unwrap()),
            n_mem,
            n_cursor,
            n_var,
            ..Default::default()
        }
    }

    fn collect(vm: &mut Vdbe, db: &mut Database) -> Vec<Vec<Value>> {
        let mut rows = Vec::new();
        while vm.step(db).unwrap() == StepResult::Row {
            rows.push(vm.row().to_vec());
        }
        rows
    }

    #[test]
    fn test_counting_loop() {
        let mut b = VdbeBuilder::new();
        let r = b.alloc_reg(1);
        let limit = b.alloc_reg(1);
        b.add_op2(Opcode::Integer, 0, r);
        b.add_op2(Opcode::Integer, 3, limit);
        let top = b.current_addr();
        b.add_op2(Opcode::AddImm, r, 1);
        b.add_op2(Opcode::ResultRow, r, 1);
        b.add_op2(Opcode::DecrJumpZero, limit, top + 4);
        b.add_op2(Opcode::Goto, 0, top);
        b.add_op0(Opcode::Halt);
        let mut vm = Vdbe::new(program(b, 0));
        let mut db = Database::new();
        let rows = collect(&mut vm, &mut db);
        assert_eq!(rows, vec![vec![Value::Integer(1)], vec![Value::Integer(2)], vec![Value::Integer(3)]]);
    }

    #[test]
    fn test_insert_and_scan_table() {
        let mut db = Database::new();
        db.btree.create_table(2);
        let mut b = VdbeBuilder::new();
        let rec = b.alloc_reg(1);
        let rowid = b.alloc_reg(1);
        let val = b.alloc_reg(1);
        let cur = b.alloc_cursor();
        b.add_op2(Opcode::OpenWrite, cur, 2);
        for v in [10, 20] {
            b.add_op2(Opcode::Integer, v, val);
            b.add_op2(Opcode::NewRowid, cur, rowid);
            b.add_op(Opcode::MakeRecord, val, 1, rec);
            b.add_op(Opcode::Insert, cur, rec, rowid);
            b.change_p5(opflag::NCHANGE | opflag::LASTROWID);
        }
        let done = b.make_label();
        b.add_jump(Opcode::Rewind, cur, done, 0);
        let top = b.current_addr();
        b.add_op(Opcode::Column, cur, 0, val);
        b.add_op2(Opcode::ResultRow, val, 1);
        b.add_op2(Opcode::Next, cur, top);
        b.resolve_label(done);
        b.add_op0(Opcode::Halt);
        let mut vm = Vdbe::new(program(b, 0));
        let rows = collect(&mut vm, &mut db);
        assert_eq!(rows, vec![vec![Value::Integer(10)], vec![Value::Integer(20)]]);
        assert_eq!(vm.changes(), 2);
        assert_eq!(vm.last_insert_rowid(), Some(2));
    }

    #[test]
    fn test_constraint_halt_restores_statement_snapshot() {
        let mut db = Database::new();
        db.btree.create_table(2);
        let mut b = VdbeBuilder::new();
        let rec = b.alloc_reg(1);
        let rowid = b.alloc_reg(1);
        let cur = b.alloc_cursor();
        b.add_op(Opcode::Transaction, 0, 1, 0);
        b.add_op2(Opcode::OpenWrite, cur, 2);
        b.add_op2(Opcode::Integer, 7, rowid);
        b.add_op(Opcode::MakeRecord, rowid, 1, rec);
        b.add_op(Opcode::Insert, cur, rec, rowid);
        b.add_op4(
            Opcode::Halt,
            ErrorCode::Constraint as i32,
            ConflictAction::Abort.code(),
            0,
            P4::Text("UNIQUE constraint failed: t.a".into()),
        );
        b.change_p5(ConstraintKind::Unique as u16);
        let mut vm = Vdbe::new(program(b, 0));
        let err = vm.step(&mut db).unwrap_err();
        assert_eq!(err.constraint, Some(ConstraintKind::Unique));
        assert_eq!(err.errmsg(), "UNIQUE constraint failed: t.a");
        assert!(db.btree.table(2).unwrap().is_empty());
    }

    #[test]
    fn test_fail_policy_keeps_prior_changes() {
        let mut db = Database::new();
        db.btree.create_table(2);
        let mut b = VdbeBuilder::new();
        let rec = b.alloc_reg(1);
        let rowid = b.alloc_reg(1);
        let cur = b.alloc_cursor();
        b.add_op(Opcode::Transaction, 0, 1, 0);
        b.add_op2(Opcode::OpenWrite, cur, 2);
        b.add_op2(Opcode::Integer, 1, rowid);
        b.add_op(Opcode::MakeRecord, rowid, 1, rec);
        b.add_op(Opcode::Insert, cur, rec, rowid);
        b.add_op4(Opcode::Halt, ErrorCode::Constraint as i32, ConflictAction::Fail.code(), 0, P4::Text("x".into()));
        let mut vm = Vdbe::new(program(b, 0));
        assert!(vm.step(&mut db).is_err());
        assert_eq!(db.btree.table(2).unwrap().len(), 1);
    }

    #[test]
    fn test_sorter_orders_entries() {
        let mut db = Database::new();
        let mut b = VdbeBuilder::new();
        let v = b.alloc_reg(1);
        let rec = b.alloc_reg(1);
        let out = b.alloc_reg(1);
        let sorter = b.alloc_cursor();
        let mut ki = KeyInfo::new(1);
        ki.sort_orders[0] = true;
        b.add_op4(Opcode::SorterOpen, sorter, 1, 0, P4::KeyInfo(Arc::new(ki)));
        for x in [2, 9, 4] {
            b.add_op2(Opcode::Integer, x, v);
            b.add_op(Opcode::MakeRecord, v, 1, rec);
            b.add_op2(Opcode::SorterInsert, sorter, rec);
        }
        let done = b.make_label();
        b.add_jump(Opcode::SorterSort, sorter, done, 0);
        let top = b.current_addr();
        b.add_op(Opcode::Column, sorter, 0, out);
        b.add_op2(Opcode::ResultRow, out, 1);
        b.add_op2(Opcode::SorterNext, sorter, top);
        b.resolve_label(done);
        b.add_op0(Opcode::Halt);
        let mut vm = Vdbe::new(program(b, 0));
        let got: Vec<i64> = collect(&mut vm, &mut db).iter().map(|r| r[0].to_i64()).collect();
        assert_eq!(got, vec![9, 4, 2]);
    }

    #[test]
    fn test_coroutine_yields_rows() {
        let mut db = Database::new();
        let mut b = VdbeBuilder::new();
        let co = b.alloc_reg(1);
        let v = b.alloc_reg(1);
        let after = b.make_label();
        let end = b.make_label();
        b.add_jump(Opcode::InitCoroutine, co, after, 1);
        for x in [5, 6] {
            b.add_op2(Opcode::Integer, x, v);
            b.add_op1(Opcode::Yield, co);
        }
        b.add_op1(Opcode::EndCoroutine, co);
        b.resolve_label(after);
        let top = b.add_jump(Opcode::Yield, co, end, 0);
        b.add_op2(Opcode::ResultRow, v, 1);
        b.add_op2(Opcode::Goto, 0, top);
        b.resolve_label(end);
        b.add_op0(Opcode::Halt);
        let mut vm = Vdbe::new(program(b, 0));
        let got: Vec<i64> = collect(&mut vm, &mut db).iter().map(|r| r[0].to_i64()).collect();
        assert_eq!(got, vec![5, 6]);
    }

    #[test]
    fn test_comparison_null_handling() {
        let mut db = Database::new();
        let mut b = VdbeBuilder::new();
        let a = b.alloc_reg(1);
        let n = b.alloc_reg(1);
        let out = b.alloc_reg(1);
        b.add_op2(Opcode::Integer, 1, a);
        b.add_op2(Opcode::Null, 0, n);
        b.add_op(Opcode::Eq, a, out, n);
        b.change_p5(cmp_flags::STOREP2);
        b.add_op2(Opcode::ResultRow, out, 1);
        b.add_op(Opcode::Eq, n, out, n);
        b.change_p5(cmp_flags::STOREP2 | cmp_flags::NULLEQ);
        b.add_op2(Opcode::ResultRow, out, 1);
        b.add_op0(Opcode::Halt);
        let mut vm = Vdbe::new(program(b, 0));
        let rows = collect(&mut vm, &mut db);
        assert_eq!(rows, vec![vec![Value::Null], vec![Value::Integer(1)]]);
    }

    #[test]
    fn test_bind_out_of_range() {
        let mut vm = Vdbe::new(Program {
            n_var: 1,
            ..Default::default()
        });
        assert!(vm.bind(1, Value::Integer(3)).is_ok());
        assert_eq!(vm.bind(2, Value::Null).unwrap_err().code, ErrorCode::Range);
        assert_eq!(vm.bind(0, Value::Null).unwrap_err().code, ErrorCode::Range);
    }

    #[test]
    fn test_seek_rowid_between_keys() {
        let mut t = std::collections::BTreeMap::new();
        for r in [1, 3, 5] {
            t.insert(r, vec![]);
        }
        assert_eq!(seek_rowid(&t, Opcode::SeekGE, &Value::Real(2.5)), Some(3));
        assert_eq!(seek_rowid(&t, Opcode::SeekGT, &Value::Integer(3)), Some(5));
        assert_eq!(seek_rowid(&t, Opcode::SeekLT, &Value::Integer(3)), Some(1));
        assert_eq!(seek_rowid(&t, Opcode::SeekLE, &Value::Text("x".into())), Some(5));
        assert_eq!(seek_rowid(&t, Opcode::SeekGE, &Value::Text("x".into())), None);
    }
}
