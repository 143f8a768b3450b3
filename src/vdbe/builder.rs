//! Program builder
//!
//! Accumulates instructions for one program (a statement or a trigger
//! body), hands out registers and cursor numbers, and patches forward
//! jumps. Labels are negative integers until resolved; every jump
//! operand still negative when the program is finished is replaced by the
//! address the label was resolved to.

use crate::error::{Error, ErrorCode, Result};
use crate::vdbe::ops::{Opcode, VdbeOp, P4};

/// Forward-jump placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(i32);

impl Label {
    /// The operand value to store in a jump slot
    pub fn value(&self) -> i32 {
        self.0
    }

    fn index(&self) -> usize {
        (-1 - self.0) as usize
    }
}

/// Builds a single VDBE program
#[derive(Debug, Default)]
pub struct VdbeBuilder {
    ops: Vec<VdbeOp>,
    labels: Vec<Option<i32>>,
    n_mem: i32,
    n_cursor: i32,
}

impl VdbeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the next instruction will occupy
    pub fn current_addr(&self) -> i32 {
        self.ops.len() as i32
    }

    pub fn make_label(&mut self) -> Label {
        self.labels.push(None);
        Label(-(self.labels.len() as i32))
    }

    /// Bind `label` to the current address
    pub fn resolve_label(&mut self, label: Label) {
        let addr = self.current_addr();
        if let Some(slot) = self.labels.get_mut(label.index()) {
            *slot = Some(addr);
        }
    }

    pub fn add(&mut self, op: VdbeOp) -> i32 {
        tracing::trace!(addr = self.ops.len(), op = %op, "emit");
        self.ops.push(op);
        self.current_addr() - 1
    }

    pub fn add_op(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32) -> i32 {
        self.add(VdbeOp::new(opcode, p1, p2, p3))
    }

    pub fn add_op0(&mut self, opcode: Opcode) -> i32 {
        self.add_op(opcode, 0, 0, 0)
    }

    pub fn add_op1(&mut self, opcode: Opcode, p1: i32) -> i32 {
        self.add_op(opcode, p1, 0, 0)
    }

    pub fn add_op2(&mut self, opcode: Opcode, p1: i32, p2: i32) -> i32 {
        self.add_op(opcode, p1, p2, 0)
    }

    pub fn add_op4(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32, p4: P4) -> i32 {
        self.add(VdbeOp::with_p4(opcode, p1, p2, p3, p4))
    }

    /// Emit an instruction whose P2 is a label
    pub fn add_jump(&mut self, opcode: Opcode, p1: i32, label: Label, p3: i32) -> i32 {
        self.add_op(opcode, p1, label.value(), p3)
    }

    pub fn goto(&mut self, label: Label) -> i32 {
        self.add_op(Opcode::Goto, 0, label.value(), 0)
    }

    /// Make the jump at `addr` land on the current address
    pub fn jump_here(&mut self, addr: i32) {
        let here = self.current_addr();
        self.change_p2(addr, here);
    }

    pub fn change_p1(&mut self, addr: i32, p1: i32) {
        if let Some(op) = self.op_at_mut(addr) {
            op.p1 = p1;
        }
    }

    pub fn change_p2(&mut self, addr: i32, p2: i32) {
        if let Some(op) = self.op_at_mut(addr) {
            op.p2 = p2;
        }
    }

    pub fn change_p3(&mut self, addr: i32, p3: i32) {
        if let Some(op) = self.op_at_mut(addr) {
            op.p3 = p3;
        }
    }

    pub fn change_p5(&mut self, p5: u16) {
        if let Some(op) = self.ops.last_mut() {
            op.p5 = p5;
        }
    }

    /// Turn the instruction at `addr` into a no-op
    pub fn change_to_noop(&mut self, addr: i32) {
        if let Some(op) = self.op_at_mut(addr) {
            *op = VdbeOp::new(Opcode::Noop, 0, 0, 0);
        }
    }

    /// Attach a comment to the most recent instruction
    pub fn comment(&mut self, text: impl Into<String>) {
        if let Some(op) = self.ops.last_mut() {
            op.comment = Some(text.into());
        }
    }

    pub fn op_at(&self, addr: i32) -> Option<&VdbeOp> {
        self.ops.get(addr as usize)
    }

    pub fn op_at_mut(&mut self, addr: i32) -> Option<&mut VdbeOp> {
        self.ops.get_mut(addr as usize)
    }

    pub fn last_op_mut(&mut self) -> Option<&mut VdbeOp> {
        self.ops.last_mut()
    }

    // ========================================================================
    // Resource allocation
    // ========================================================================

    /// Allocate `n` consecutive registers, returning the first
    pub fn alloc_reg(&mut self, n: i32) -> i32 {
        let first = self.n_mem + 1;
        self.n_mem += n.max(1);
        first
    }

    pub fn alloc_cursor(&mut self) -> i32 {
        self.n_cursor += 1;
        self.n_cursor - 1
    }

    pub fn n_mem(&self) -> i32 {
        self.n_mem
    }

    /// Raise the register high-water mark (registers handed out elsewhere)
    pub fn set_n_mem(&mut self, n: i32) {
        self.n_mem = self.n_mem.max(n);
    }

    pub fn n_cursor(&self) -> i32 {
        self.n_cursor
    }

    // ========================================================================
    // Finishing
    // ========================================================================

    /// Resolve labels and return the finished instruction list
    pub fn finish(mut self) -> Result<Vec<VdbeOp>> {
        let labels = std::mem::take(&mut self.labels);
        let lookup = |v: i32| -> Result<i32> {
            if v >= 0 {
                return Ok(v);
            }
            labels
                .get((-1 - v) as usize)
                .copied()
                .flatten()
                .ok_or_else(|| Error::with_message(ErrorCode::Internal, format!("unresolved label {}", v)))
        };
        for op in self.ops.iter_mut() {
            if op.opcode == Opcode::Jump {
                op.p1 = lookup(op.p1)?;
                op.p2 = lookup(op.p2)?;
                op.p3 = lookup(op.p3)?;
            } else if op.opcode.is_jump() {
                op.p2 = lookup(op.p2)?;
            }
        }
        Ok(self.ops)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_label_resolution() {
        let mut b = VdbeBuilder::new();
        let end = b.make_label();
        b.add_op2(Opcode::Integer, 1, 1);
        b.add_jump(Opcode::IfNot, 1, end, 0);
        b.add_op2(Opcode::ResultRow, 1, 1);
        b.resolve_label(end);
        b.add_op0(Opcode::Halt);
        let ops = b.finish().unwrap();
        assert_eq!(ops[1].p2, 3);
    }

    #[test]
    fn test_unresolved_label_is_an_error() {
        let mut b = VdbeBuilder::new();
        let l = b.make_label();
        b.goto(l);
        assert_eq!(b.finish().unwrap_err().code, ErrorCode::Internal);
    }

    #[test]
    fn test_register_allocation_is_one_based() {
        let mut b = VdbeBuilder::new();
        assert_eq!(b.alloc_reg(3), 1);
        assert_eq!(b.alloc_reg(1), 4);
        assert_eq!(b.n_mem(), 4);
        assert_eq!(b.alloc_cursor(), 0);
        assert_eq!(b.alloc_cursor(), 1);
    }

    #[test]
    fn test_jump_here_patches_p2() {
        let mut b = VdbeBuilder::new();
        let addr = b.add_op2(Opcode::Rewind, 0, 0);
        b.add_op0(Opcode::Noop);
        b.jump_here(addr);
        assert_eq!(b.op_at(addr).unwrap().p2, 2);
    }
}
