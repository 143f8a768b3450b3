//! Expression code generation
//!
//! Turns resolved expression trees into register code. `expr_code` leaves
//! the value of an expression in a target register; `expr_if_true` and
//! `expr_if_false` compile a condition straight into jumps, which is how
//! WHERE, ON, HAVING, CHECK and trigger WHEN clauses are evaluated.

use std::sync::Arc;

use crate::error::{ConstraintKind, Error, ErrorCode, Result};
use crate::executor::{CursorSource, Parse, SelectDest};
use crate::parser::ast::{BinaryOp, ConflictAction, Expr, LikeOp, RaiseAction, SelectFlags, TimeKeyword, UnaryOp};
use crate::schema::affinity::compare_affinity;
use crate::schema::{expr_affinity, type_affinity, Affinity};
use crate::vdbe::ops::cmp_flags;
use crate::vdbe::value::Collation;
use crate::vdbe::{KeyInfo, Label, Opcode, P4};

// ============================================================================
// Collation and affinity of operands
// ============================================================================

/// Collation named by a COLLATE operator at the top of `e`
fn explicit_collation(e: &Expr) -> Option<Collation> {
    match e {
        Expr::Collate { collation, .. } => Collation::from_name(collation),
        Expr::OnJoin { expr, .. } | Expr::IfNullRow { expr, .. } => explicit_collation(expr),
        _ => None,
    }
}

/// Collation `e` carries from the column it reads
fn implicit_collation(e: &Expr) -> Option<Collation> {
    match e {
        Expr::Column(c) => c.collation,
        Expr::Register { collation, .. } => *collation,
        Expr::Collate { expr, .. } | Expr::OnJoin { expr, .. } | Expr::IfNullRow { expr, .. } => {
            implicit_collation(expr)
        }
        _ => None,
    }
}

/// Collation of a single expression
pub fn expr_collation(e: &Expr) -> Collation {
    explicit_collation(e)
        .or_else(|| implicit_collation(e))
        .unwrap_or(Collation::Binary)
}

/// Collation used to compare `l` with `r`: an explicit COLLATE on the
/// left, then on the right, then a column collation, left first
pub fn binary_collation(l: &Expr, r: &Expr) -> Collation {
    explicit_collation(l)
        .or_else(|| explicit_collation(r))
        .or_else(|| implicit_collation(l))
        .or_else(|| implicit_collation(r))
        .unwrap_or(Collation::Binary)
}

/// P5 affinity code of a comparison between `l` and `r`
pub fn comparison_p5(l: &Expr, r: &Expr) -> u16 {
    compare_affinity(expr_affinity(l, None), expr_affinity(r, None)).map_or(0, |a| a.p5_code())
}

/// Whether the value of `e` cannot change while the statement runs
pub fn is_constant(e: &Expr) -> bool {
    !e.any(&mut |x| {
        matches!(
            x,
            Expr::Column(_)
                | Expr::Id(_)
                | Expr::Qualified(..)
                | Expr::AggColumn(_)
                | Expr::AggFunction(_)
                | Expr::IfNullRow { .. }
                | Expr::TriggerRow { .. }
                | Expr::Register { .. }
                | Expr::Raise(..)
                | Expr::Subquery(_)
                | Expr::Exists(_)
                | Expr::InSelect { .. }
        )
    })
}

fn comparison_opcode(op: BinaryOp) -> Option<Opcode> {
    Some(match op {
        BinaryOp::Eq | BinaryOp::Is => Opcode::Eq,
        BinaryOp::Ne | BinaryOp::IsNot => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        _ => return None,
    })
}

fn negate_comparison(op: Opcode) -> Opcode {
    match op {
        Opcode::Eq => Opcode::Ne,
        Opcode::Ne => Opcode::Eq,
        Opcode::Lt => Opcode::Ge,
        Opcode::Ge => Opcode::Lt,
        Opcode::Le => Opcode::Gt,
        _ => Opcode::Le,
    }
}

fn arithmetic_opcode(op: BinaryOp) -> Option<Opcode> {
    Some(match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Subtract,
        BinaryOp::Mul => Opcode::Multiply,
        BinaryOp::Div => Opcode::Divide,
        BinaryOp::Mod => Opcode::Remainder,
        BinaryOp::Concat => Opcode::Concat,
        BinaryOp::BitAnd => Opcode::BitAnd,
        BinaryOp::BitOr => Opcode::BitOr,
        BinaryOp::ShiftLeft => Opcode::ShiftLeft,
        BinaryOp::ShiftRight => Opcode::ShiftRight,
        _ => return None,
    })
}

/// Wrap the value held in `reg` so it compares like `like`
fn register_like(reg: i32, like: &Expr) -> Expr {
    Expr::Register {
        reg,
        affinity: expr_affinity(like, None),
        collation: explicit_collation(like).or_else(|| implicit_collation(like)),
    }
}

impl<'a> Parse<'a> {
    // ========================================================================
    // Values
    // ========================================================================

    /// Load column `column` of `cursor` into `target`
    pub fn code_column(&mut self, cursor: i32, column: i32, target: i32) -> Result<()> {
        match self.sources.get(&cursor).cloned() {
            Some(CursorSource::Table(t)) => {
                let is_rowid = column < 0 || (t.has_rowid() && t.ipk == Some(column as usize));
                if is_rowid {
                    self.v.add_op2(Opcode::Rowid, cursor, target);
                } else if t.without_rowid {
                    let pos = t.storage_position(column as usize) as i32;
                    self.v.add_op(Opcode::Column, cursor, pos, target);
                } else {
                    self.v.add_op(Opcode::Column, cursor, column, target);
                }
            }
            Some(CursorSource::Registers { base, rowid, ipk }) => {
                let is_rowid = column < 0 || ipk == Some(column as usize);
                match (is_rowid, rowid) {
                    (true, Some(r)) => self.copy_reg(r, target),
                    (true, None) => {
                        self.v.add_op2(Opcode::Null, 0, target);
                    }
                    (false, _) => self.copy_reg(base + column, target),
                }
            }
            Some(CursorSource::Ephemeral) | None => {
                if column < 0 {
                    self.v.add_op2(Opcode::Rowid, cursor, target);
                } else {
                    self.v.add_op(Opcode::Column, cursor, column, target);
                }
            }
        }
        Ok(())
    }

    fn copy_reg(&mut self, from: i32, to: i32) {
        if from != to {
            self.v.add_op2(Opcode::SCopy, from, to);
        }
    }

    /// Evaluate `e` into a register and return it; registers that already
    /// hold the value are returned as they are
    pub fn expr_code_temp(&mut self, e: &Expr) -> Result<i32> {
        if let Expr::Register { reg, .. } = e {
            return Ok(*reg);
        }
        let r = self.alloc_reg(1);
        self.expr_code(e, r)?;
        Ok(r)
    }

    /// Evaluate `exprs` into consecutive registers starting at `base`
    pub fn expr_code_list(&mut self, exprs: &[Expr], base: i32) -> Result<()> {
        for (i, e) in exprs.iter().enumerate() {
            self.expr_code(e, base + i as i32)?;
        }
        Ok(())
    }

    /// Evaluate `e` into `target`
    pub fn expr_code(&mut self, e: &Expr, target: i32) -> Result<()> {
        match e {
            Expr::Null => {
                self.v.add_op2(Opcode::Null, 0, target);
            }
            Expr::Integer(i) => self.code_integer(*i, target),
            Expr::Real(r) => {
                self.v.add_op4(Opcode::Real, 0, target, 0, P4::Real(*r));
            }
            Expr::Text(s) => {
                self.v.add_op4(Opcode::String8, 0, target, 0, P4::Text(s.clone()));
            }
            Expr::Blob(b) => {
                self.v.add_op4(Opcode::Blob, 0, target, 0, P4::Blob(b.clone()));
            }
            Expr::CurrentTime(kw) => {
                let name = match kw {
                    TimeKeyword::Time => "current_time",
                    TimeKeyword::Date => "current_date",
                    TimeKeyword::Timestamp => "current_timestamp",
                };
                self.v
                    .add_op4(Opcode::Function, 0, target, target, P4::Func(name.to_string()));
            }
            Expr::Variable(n) => {
                self.v.add_op2(Opcode::Variable, *n, target);
            }
            Expr::Column(c) => self.code_column(c.cursor, c.column, target)?,
            Expr::Register { reg, .. } => self.copy_reg(*reg, target),

            Expr::Unary(op, x) => match (op, x.as_ref()) {
                (UnaryOp::Neg, Expr::Integer(i)) if *i != i64::MIN => self.code_integer(-*i, target),
                (UnaryOp::Neg, Expr::Real(r)) => {
                    self.v.add_op4(Opcode::Real, 0, target, 0, P4::Real(-*r));
                }
                (UnaryOp::Pos, x) => self.expr_code(x, target)?,
                (op, x) => {
                    let r = self.expr_code_temp(x)?;
                    let opcode = match op {
                        UnaryOp::Neg => Opcode::Negate,
                        UnaryOp::Not => Opcode::Not,
                        _ => Opcode::BitNot,
                    };
                    self.v.add_op2(opcode, r, target);
                }
            },

            Expr::Binary(op, l, r) => {
                if let Some(opcode) = comparison_opcode(*op) {
                    let nulleq = matches!(op, BinaryOp::Is | BinaryOp::IsNot);
                    self.code_comparison(opcode, l, r, target, nulleq)?;
                } else if matches!(op, BinaryOp::And | BinaryOp::Or) {
                    let a = self.expr_code_temp(l)?;
                    let b = self.expr_code_temp(r)?;
                    let opcode = if *op == BinaryOp::And { Opcode::And } else { Opcode::Or };
                    self.v.add_op(opcode, a, b, target);
                } else if let Some(opcode) = arithmetic_opcode(*op) {
                    let a = self.expr_code_temp(l)?;
                    let b = self.expr_code_temp(r)?;
                    self.v.add_op(opcode, a, b, target);
                }
            }

            Expr::Between { expr, low, high, negated } => {
                let x = self.expr_code_temp(expr)?;
                let xe = register_like(x, expr);
                let both = Expr::binary(
                    BinaryOp::And,
                    Expr::binary(BinaryOp::Ge, xe.clone(), (**low).clone()),
                    Expr::binary(BinaryOp::Le, xe, (**high).clone()),
                );
                self.expr_code(&both, target)?;
                if *negated {
                    self.v.add_op2(Opcode::Not, target, target);
                }
            }

            Expr::InList { expr, list, negated } => {
                self.code_in_list(expr, list, target)?;
                if *negated {
                    self.v.add_op2(Opcode::Not, target, target);
                }
            }

            Expr::InSelect { expr, select, negated } => {
                self.code_in_select(expr, select, target)?;
                if *negated {
                    self.v.add_op2(Opcode::Not, target, target);
                }
            }

            Expr::Like { op, expr, pattern, escape, negated } => {
                let argc = if escape.is_some() { 3 } else { 2 };
                let base = self.alloc_reg(argc);
                self.expr_code(pattern, base)?;
                self.expr_code(expr, base + 1)?;
                if let Some(esc) = escape {
                    self.expr_code(esc, base + 2)?;
                }
                let name = if *op == LikeOp::Like { "like" } else { "glob" };
                self.v
                    .add_op4(Opcode::Function, 0, base, target, P4::Func(name.to_string()));
                self.v.change_p5(argc as u16);
                if *negated {
                    self.v.add_op2(Opcode::Not, target, target);
                }
            }

            Expr::IsNull(x) | Expr::NotNull(x) => {
                let r = self.expr_code_temp(x)?;
                self.v.add_op2(Opcode::Integer, 1, target);
                let test = if matches!(e, Expr::IsNull(_)) { Opcode::IsNull } else { Opcode::NotNull };
                let here = self.v.current_addr();
                self.v.add_op2(test, r, here + 2);
                self.v.add_op2(Opcode::Integer, 0, target);
            }

            Expr::Case { operand, whens, else_expr } => {
                let end = self.v.make_label();
                let subject = match operand {
                    Some(o) => Some((self.expr_code_temp(o)?, (**o).clone())),
                    None => None,
                };
                for (when, then) in whens {
                    let next = self.v.make_label();
                    match &subject {
                        Some((x, o)) => {
                            let xe = register_like(*x, o);
                            let cond = Expr::binary(BinaryOp::Eq, xe, when.clone());
                            self.expr_if_false(&cond, next, true)?;
                        }
                        None => self.expr_if_false(when, next, true)?,
                    }
                    self.expr_code(then, target)?;
                    self.v.goto(end);
                    self.v.resolve_label(next);
                }
                match else_expr {
                    Some(x) => self.expr_code(x, target)?,
                    None => {
                        self.v.add_op2(Opcode::Null, 0, target);
                    }
                }
                self.v.resolve_label(end);
            }

            Expr::Cast { expr, type_name } => {
                self.expr_code(expr, target)?;
                let aff = type_affinity(type_name);
                self.v.add_op2(Opcode::Cast, target, aff.p5_code() as i32);
            }

            Expr::Collate { expr, .. } | Expr::OnJoin { expr, .. } => self.expr_code(expr, target)?,

            Expr::Function { name, args, .. } => {
                let argc = args.len() as i32;
                let base = if argc > 0 { self.alloc_reg(argc) } else { target };
                self.expr_code_list(args, base)?;
                self.v.add_op4(
                    Opcode::Function,
                    0,
                    base,
                    target,
                    P4::Func(name.to_ascii_lowercase()),
                );
                self.v.change_p5(argc as u16);
            }

            Expr::Subquery(sel) => {
                let correlated = sel.flags.contains(SelectFlags::CORRELATED);
                let dest = self.alloc_reg(1);
                let once = self.v.make_label();
                if !correlated {
                    self.v.add_jump(Opcode::Once, 0, once, 0);
                }
                self.v.add_op2(Opcode::Null, 0, dest);
                self.with_saved_agg(|p| p.code_select(sel, SelectDest::Mem { base: dest }))?;
                self.v.resolve_label(once);
                self.copy_reg(dest, target);
            }

            Expr::Exists(sel) => {
                let correlated = sel.flags.contains(SelectFlags::CORRELATED);
                let dest = self.alloc_reg(1);
                let once = self.v.make_label();
                if !correlated {
                    self.v.add_jump(Opcode::Once, 0, once, 0);
                }
                self.v.add_op2(Opcode::Integer, 0, dest);
                self.with_saved_agg(|p| p.code_select(sel, SelectDest::Exists { reg: dest }))?;
                self.v.resolve_label(once);
                self.copy_reg(dest, target);
            }

            Expr::Raise(action, message) => self.code_raise(*action, message.as_deref()),

            Expr::AggColumn(i) => {
                let reg = self
                    .agg
                    .as_ref()
                    .and_then(|a| a.column_reg(*i))
                    .ok_or_else(|| Error::with_message(ErrorCode::Internal, "aggregate column outside an aggregate"))?;
                self.copy_reg(reg, target);
            }
            Expr::AggFunction(i) => {
                let reg = self
                    .agg
                    .as_ref()
                    .and_then(|a| a.func_reg(*i))
                    .ok_or_else(|| Error::with_message(ErrorCode::Internal, "aggregate outside an aggregate"))?;
                self.copy_reg(reg, target);
            }

            Expr::TriggerRow { new, column, .. } => {
                let tc = self
                    .trigger
                    .as_ref()
                    .ok_or_else(|| Error::with_message(ErrorCode::Internal, "trigger row outside a trigger"))?;
                let n_col = tc.table.columns.len() as i32;
                let offset = if *new { n_col + 1 } else { 0 } + column + 1;
                self.v.add_op2(Opcode::Param, offset, target);
            }

            Expr::IfNullRow { cursor, expr } => {
                let skip = self.v.make_label();
                self.v.add_jump(Opcode::IfNullRow, *cursor, skip, target);
                self.expr_code(expr, target)?;
                self.v.resolve_label(skip);
            }

            Expr::Id(name) | Expr::Qualified(_, name) => {
                return Err(Error::with_message(
                    ErrorCode::Internal,
                    format!("unresolved name {}", name),
                ))
            }
        }
        Ok(())
    }

    fn code_integer(&mut self, i: i64, target: i32) {
        if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
            self.v.add_op2(Opcode::Integer, i as i32, target);
        } else {
            self.v.add_op4(Opcode::Int64, 0, target, 0, P4::Int64(i));
        }
    }

    /// Comparison storing 1, 0 or NULL in `target`
    fn code_comparison(&mut self, opcode: Opcode, l: &Expr, r: &Expr, target: i32, nulleq: bool) -> Result<()> {
        let a = self.expr_code_temp(l)?;
        let b = self.expr_code_temp(r)?;
        let mut p5 = comparison_p5(l, r) | cmp_flags::STOREP2;
        if nulleq {
            p5 |= cmp_flags::NULLEQ;
        }
        self.v
            .add_op4(opcode, a, target, b, P4::Collation(binary_collation(l, r)));
        self.v.change_p5(p5);
        Ok(())
    }

    /// Run `f` with the aggregate context hidden; subqueries have their own
    fn with_saved_agg<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = self.agg.take();
        let r = f(self);
        self.agg = saved;
        r
    }

    fn code_raise(&mut self, action: RaiseAction, message: Option<&str>) {
        match action {
            RaiseAction::Ignore => {
                self.v.add_op2(Opcode::Halt, 0, ConflictAction::Ignore.code());
            }
            other => {
                let policy = match other {
                    RaiseAction::Rollback => ConflictAction::Rollback,
                    RaiseAction::Fail => ConflictAction::Fail,
                    _ => ConflictAction::Abort,
                };
                self.halt_constraint(ConstraintKind::Trigger, policy, message.unwrap_or("").to_string());
            }
        }
    }

    /// `x IN (a, b, ...)`: 1 on a match, NULL when there is no match but
    /// `x` or some list value is NULL, else 0
    fn code_in_list(&mut self, expr: &Expr, list: &[Expr], target: i32) -> Result<()> {
        let found = self.v.make_label();
        let is_null = self.v.make_label();
        let done = self.v.make_label();
        let x = self.expr_code_temp(expr)?;
        let saw_null = self.alloc_reg(1);
        self.v.add_op2(Opcode::Integer, 0, saw_null);
        self.v.add_jump(Opcode::IsNull, x, is_null, 0);
        for item in list {
            let r = self.expr_code_temp(item)?;
            let here = self.v.current_addr();
            self.v.add_op2(Opcode::NotNull, r, here + 2);
            self.v.add_op2(Opcode::Integer, 1, saw_null);
            let a = self
                .v
                .add_jump(Opcode::Eq, x, found, r);
            if let Some(op) = self.v.op_at_mut(a) {
                op.p4 = P4::Collation(binary_collation(expr, item));
                op.p5 = comparison_p5(expr, item);
            }
        }
        self.v.add_op2(Opcode::Integer, 0, target);
        self.v.add_jump(Opcode::IfNot, saw_null, done, 0);
        self.v.resolve_label(is_null);
        self.v.add_op2(Opcode::Null, 0, target);
        self.v.goto(done);
        self.v.resolve_label(found);
        self.v.add_op2(Opcode::Integer, 1, target);
        self.v.resolve_label(done);
        Ok(())
    }

    /// `x IN (SELECT ...)` probed against a transient index of the result
    fn code_in_select(&mut self, expr: &Expr, select: &crate::parser::ast::Select, target: i32) -> Result<()> {
        let column = select.result_exprs().next().cloned().unwrap_or(Expr::Null);
        let aff = compare_affinity(expr_affinity(expr, None), expr_affinity(&column, None));
        let coll = binary_collation(expr, &column);
        let cursor = self.fill_in_set(select, aff, coll)?;

        let found = self.v.make_label();
        let x_null = self.v.make_label();
        let has_null = self.v.make_label();
        let done = self.v.make_label();
        let x = self.expr_code_temp(expr)?;
        self.v.add_op2(Opcode::Integer, 0, target);
        self.v.add_jump(Opcode::IsNull, x, x_null, 0);
        let probe = self.alloc_reg(1);
        self.v.add_op2(Opcode::SCopy, x, probe);
        if let Some(a) = aff.filter(|a| *a != Affinity::Blob) {
            self.v
                .add_op4(Opcode::Affinity, probe, 1, 0, P4::Text(a.as_char().to_string()));
        }
        let a = self.v.add_jump(Opcode::Found, cursor, found, probe);
        if let Some(op) = self.v.op_at_mut(a) {
            op.p4 = P4::Int64(1);
        }
        // No match: NULL when the set holds a NULL
        let null_probe = self.alloc_reg(1);
        self.v.add_op2(Opcode::Null, 0, null_probe);
        let a = self.v.add_jump(Opcode::Found, cursor, has_null, null_probe);
        if let Some(op) = self.v.op_at_mut(a) {
            op.p4 = P4::Int64(1);
        }
        self.v.goto(done);
        // NULL on the left: false for an empty set, NULL otherwise
        self.v.resolve_label(x_null);
        self.v.add_jump(Opcode::Rewind, cursor, done, 0);
        self.v.resolve_label(has_null);
        self.v.add_op2(Opcode::Null, 0, target);
        self.v.goto(done);
        self.v.resolve_label(found);
        self.v.add_op2(Opcode::Integer, 1, target);
        self.v.resolve_label(done);
        Ok(())
    }

    /// Materialize the single-column result of `select` into a transient
    /// index; uncorrelated subqueries are filled once per statement run
    pub fn fill_in_set(
        &mut self,
        select: &crate::parser::ast::Select,
        affinity: Option<Affinity>,
        collation: Collation,
    ) -> Result<i32> {
        let cursor = self.alloc_cursor();
        self.sources.insert(cursor, CursorSource::Ephemeral);
        let done = self.v.make_label();
        if !select.flags.contains(SelectFlags::CORRELATED) {
            self.v.add_jump(Opcode::Once, 0, done, 0);
        }
        let mut ki = KeyInfo::new(1);
        ki.collations[0] = collation;
        self.v
            .add_op4(Opcode::OpenEphemeral, cursor, 1, 0, P4::KeyInfo(Arc::new(ki)));
        self.with_saved_agg(|p| p.code_select(select, SelectDest::Set { cursor, affinity }))?;
        self.v.resolve_label(done);
        Ok(cursor)
    }

    // ========================================================================
    // Conditions
    // ========================================================================

    /// Jump to `dest` when `e` is true; NULL jumps when `jump_if_null`
    pub fn expr_if_true(&mut self, e: &Expr, dest: Label, jump_if_null: bool) -> Result<()> {
        match e {
            Expr::OnJoin { expr, .. } | Expr::Collate { expr, .. } => {
                self.expr_if_true(expr, dest, jump_if_null)
            }
            Expr::Binary(BinaryOp::And, l, r) => {
                let skip = self.v.make_label();
                self.expr_if_false(l, skip, !jump_if_null)?;
                self.expr_if_true(r, dest, jump_if_null)?;
                self.v.resolve_label(skip);
                Ok(())
            }
            Expr::Binary(BinaryOp::Or, l, r) => {
                self.expr_if_true(l, dest, jump_if_null)?;
                self.expr_if_true(r, dest, jump_if_null)
            }
            Expr::Unary(UnaryOp::Not, x) => self.expr_if_false(x, dest, jump_if_null),
            Expr::Binary(op, l, r) if comparison_opcode(*op).is_some() => {
                let opcode = comparison_opcode(*op).unwrap_or(Opcode::Eq);
                self.code_compare_jump(opcode, *op, l, r, dest, jump_if_null)
            }
            Expr::IsNull(x) => {
                let r = self.expr_code_temp(x)?;
                self.v.add_jump(Opcode::IsNull, r, dest, 0);
                Ok(())
            }
            Expr::NotNull(x) => {
                let r = self.expr_code_temp(x)?;
                self.v.add_jump(Opcode::NotNull, r, dest, 0);
                Ok(())
            }
            Expr::Integer(i) => {
                if *i != 0 {
                    self.v.goto(dest);
                }
                Ok(())
            }
            _ => {
                let r = self.expr_code_temp(e)?;
                self.v.add_jump(Opcode::If, r, dest, jump_if_null as i32);
                Ok(())
            }
        }
    }

    /// Jump to `dest` when `e` is false; NULL jumps when `jump_if_null`
    pub fn expr_if_false(&mut self, e: &Expr, dest: Label, jump_if_null: bool) -> Result<()> {
        match e {
            Expr::OnJoin { expr, .. } | Expr::Collate { expr, .. } => {
                self.expr_if_false(expr, dest, jump_if_null)
            }
            Expr::Binary(BinaryOp::And, l, r) => {
                self.expr_if_false(l, dest, jump_if_null)?;
                self.expr_if_false(r, dest, jump_if_null)
            }
            Expr::Binary(BinaryOp::Or, l, r) => {
                let skip = self.v.make_label();
                self.expr_if_true(l, skip, !jump_if_null)?;
                self.expr_if_false(r, dest, jump_if_null)?;
                self.v.resolve_label(skip);
                Ok(())
            }
            Expr::Unary(UnaryOp::Not, x) => self.expr_if_true(x, dest, jump_if_null),
            Expr::Binary(op, l, r) if comparison_opcode(*op).is_some() => {
                let opcode = negate_comparison(comparison_opcode(*op).unwrap_or(Opcode::Eq));
                self.code_compare_jump(opcode, *op, l, r, dest, jump_if_null)
            }
            Expr::IsNull(x) => {
                let r = self.expr_code_temp(x)?;
                self.v.add_jump(Opcode::NotNull, r, dest, 0);
                Ok(())
            }
            Expr::NotNull(x) => {
                let r = self.expr_code_temp(x)?;
                self.v.add_jump(Opcode::IsNull, r, dest, 0);
                Ok(())
            }
            Expr::Integer(i) => {
                if *i == 0 {
                    self.v.goto(dest);
                }
                Ok(())
            }
            _ => {
                let r = self.expr_code_temp(e)?;
                self.v.add_jump(Opcode::IfNot, r, dest, jump_if_null as i32);
                Ok(())
            }
        }
    }

    fn code_compare_jump(
        &mut self,
        opcode: Opcode,
        op: BinaryOp,
        l: &Expr,
        r: &Expr,
        dest: Label,
        jump_if_null: bool,
    ) -> Result<()> {
        let a = self.expr_code_temp(l)?;
        let b = self.expr_code_temp(r)?;
        let mut p5 = comparison_p5(l, r);
        if matches!(op, BinaryOp::Is | BinaryOp::IsNot) {
            p5 |= cmp_flags::NULLEQ;
        } else if jump_if_null {
            p5 |= cmp_flags::JUMPIFNULL;
        }
        let addr = self.v.add_jump(opcode, a, dest, b);
        if let Some(op) = self.v.op_at_mut(addr) {
            op.p4 = P4::Collation(binary_collation(l, r));
            op.p5 = p5;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::ColumnRef;

    fn col(collation: Option<Collation>, affinity: Option<Affinity>) -> Expr {
        Expr::Column(ColumnRef {
            cursor: 0,
            column: 0,
            affinity,
            collation,
            name: "a".into(),
            table: "t".into(),
        })
    }

    #[test]
    fn test_binary_collation_precedence() {
        let nocase = col(Some(Collation::NoCase), None);
        let rtrim = Expr::Collate {
            expr: Box::new(Expr::string("x")),
            collation: "rtrim".into(),
        };
        assert_eq!(binary_collation(&nocase, &rtrim), Collation::RTrim);
        assert_eq!(binary_collation(&Expr::string("x"), &nocase), Collation::NoCase);
        assert_eq!(binary_collation(&Expr::int(1), &Expr::int(2)), Collation::Binary);
    }

    #[test]
    fn test_comparison_affinity_code() {
        let int_col = col(None, Some(Affinity::Integer));
        assert_eq!(comparison_p5(&int_col, &Expr::string("1")), Affinity::Integer.p5_code());
        assert_eq!(comparison_p5(&Expr::int(1), &Expr::string("1")), 0);
    }

    #[test]
    fn test_is_constant() {
        assert!(is_constant(&Expr::binary(BinaryOp::Add, Expr::int(1), Expr::Variable(1))));
        assert!(!is_constant(&col(None, None)));
    }

    #[test]
    fn test_negate_comparison() {
        assert_eq!(negate_comparison(Opcode::Lt), Opcode::Ge);
        assert_eq!(negate_comparison(Opcode::Gt), Opcode::Le);
        assert_eq!(negate_comparison(Opcode::Eq), Opcode::Ne);
    }
}
