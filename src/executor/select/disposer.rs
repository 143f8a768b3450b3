//! Result row disposal and LIMIT/OFFSET counters

use crate::error::Result;
use crate::executor::Parse;
use crate::parser::ast::Select;
use crate::vdbe::{Label, Opcode, P4};

use super::SelectDest;

/// Registers holding the LIMIT and OFFSET counters of a select
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    /// Rows still allowed; negative means no limit
    pub limit: Option<i32>,
    /// Rows still to skip
    pub offset: Option<i32>,
}

impl<'a> Parse<'a> {
    /// Evaluate LIMIT and OFFSET once, before the loop. `LIMIT 0` jumps
    /// straight to `done`.
    pub(super) fn code_limits(&mut self, sel: &Select, done: Label) -> Result<Limits> {
        let mut limits = Limits::default();
        if let Some(e) = &sel.limit {
            let r = self.alloc_reg(1);
            self.expr_code(e, r)?;
            self.v.add_op2(Opcode::MustBeInt, r, 0);
            self.v.add_jump(Opcode::IfNot, r, done, 0);
            limits.limit = Some(r);
        }
        if let Some(e) = &sel.offset {
            let r = self.alloc_reg(1);
            self.expr_code(e, r)?;
            self.v.add_op2(Opcode::MustBeInt, r, 0);
            limits.offset = Some(r);
        }
        Ok(limits)
    }

    /// Hand the row in `base..base+n` to `dest`.
    ///
    /// Rows under the OFFSET go to `cont`; once the LIMIT is used up, and
    /// after the first row for destinations that need only one, control
    /// leaves for `done`.
    pub(super) fn dispose_row(
        &mut self,
        dest: &SelectDest,
        base: i32,
        n: usize,
        limits: Limits,
        cont: Label,
        done: Label,
    ) -> Result<()> {
        if let Some(offset) = limits.offset {
            self.v.add_jump(Opcode::IfPos, offset, cont, 1);
        }
        let n32 = n as i32;
        match dest {
            SelectDest::Output => {
                self.v.add_op2(Opcode::ResultRow, base, n32);
            }
            SelectDest::Mem { base: target } => {
                if n > 0 {
                    self.v.add_op(Opcode::Copy, base, *target, n32 - 1);
                }
                self.v.goto(done);
                return Ok(());
            }
            SelectDest::Exists { reg } => {
                self.v.add_op2(Opcode::Integer, 1, *reg);
                self.v.goto(done);
                return Ok(());
            }
            SelectDest::Set { cursor, affinity } => {
                if let Some(a) = affinity {
                    self.v
                        .add_op4(Opcode::Affinity, base, 1, 0, P4::Text(a.as_char().to_string()));
                }
                let rec = self.alloc_reg(1);
                self.v.add_op(Opcode::MakeRecord, base, 1, rec);
                self.v.add_op2(Opcode::IdxInsert, *cursor, rec);
            }
            SelectDest::EphemTable { cursor } => self.append_row(*cursor, base, n32),
            SelectDest::Union { cursor } => {
                let rec = self.alloc_reg(1);
                self.v.add_op(Opcode::MakeRecord, base, n32, rec);
                self.v.add_op2(Opcode::IdxInsert, *cursor, rec);
            }
            SelectDest::Except { cursor } => {
                self.v.add_op(Opcode::IdxDelete, *cursor, base, n32);
            }
            SelectDest::Coroutine { reg, base: target } => {
                if n > 0 {
                    self.v.add_op(Opcode::Copy, base, *target, n32 - 1);
                }
                self.v.add_op1(Opcode::Yield, *reg);
            }
            SelectDest::Queue { cursor, distinct } => {
                if let Some(d) = distinct {
                    self.code_distinct(*d, base, n, cont);
                }
                self.append_row(*cursor, base, n32);
            }
            SelectDest::Discard => {}
        }
        if let Some(limit) = limits.limit {
            self.v.add_jump(Opcode::DecrJumpZero, limit, done, 0);
        }
        Ok(())
    }

    /// Append a record of `n` registers to the transient table `cursor`
    fn append_row(&mut self, cursor: i32, base: i32, n: i32) {
        let rec = self.alloc_reg(2);
        self.v.add_op(Opcode::MakeRecord, base, n, rec);
        self.v.add_op2(Opcode::NewRowid, cursor, rec + 1);
        self.v.add_op(Opcode::Insert, cursor, rec, rec + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{compile, db_with};
    use crate::api::config::DbConfig;
    use crate::vdbe::Opcode;

    #[test]
    fn test_limit_counts_down() {
        let db = db_with("CREATE TABLE t(a);");
        let (program, _) = compile(&db, &DbConfig::default(), "SELECT a FROM t LIMIT 2 OFFSET 1").unwrap();
        let ops: Vec<Opcode> = program.ops.iter().map(|o| o.opcode).collect();
        let ifpos = ops.iter().position(|o| *o == Opcode::IfPos).unwrap();
        let row = ops.iter().position(|o| *o == Opcode::ResultRow).unwrap();
        let decr = ops.iter().position(|o| *o == Opcode::DecrJumpZero).unwrap();
        assert!(ifpos < row && row < decr);
    }

    #[test]
    fn test_no_limit_no_counters() {
        let db = db_with("CREATE TABLE t(a);");
        let (program, _) = compile(&db, &DbConfig::default(), "SELECT a FROM t").unwrap();
        assert!(!program.ops.iter().any(|o| o.opcode == Opcode::DecrJumpZero));
    }
}
