//! EXPLAIN output
//!
//! `EXPLAIN stmt` compiles `stmt` as usual and then returns one row per
//! instruction instead of running it. Trigger bodies follow the main
//! program, each introduced by a row naming the trigger.

use crate::types::Value;
use crate::vdbe::ops::VdbeOp;
use crate::vdbe::Program;

/// Result columns of an EXPLAIN statement
pub const EXPLAIN_COLUMNS: [&str; 8] = ["addr", "opcode", "p1", "p2", "p3", "p4", "p5", "comment"];

/// One EXPLAIN row for the instruction at `addr`
pub fn explain_row(addr: usize, op: &VdbeOp) -> Vec<Value> {
    let p4 = if op.p4.is_unused() {
        Value::Null
    } else {
        Value::Text(op.p4.to_string())
    };
    vec![
        Value::Integer(addr as i64),
        Value::Text(op.opcode.name().to_string()),
        Value::Integer(op.p1 as i64),
        Value::Integer(op.p2 as i64),
        Value::Integer(op.p3 as i64),
        p4,
        Value::Integer(op.p5 as i64),
        op.comment.clone().map(Value::Text).unwrap_or(Value::Null),
    ]
}

/// Every EXPLAIN row of a program, subprograms included
pub fn explain_rows(program: &Program) -> Vec<Vec<Value>> {
    let mut rows: Vec<Vec<Value>> = program
        .ops
        .iter()
        .enumerate()
        .map(|(addr, op)| explain_row(addr, op))
        .collect();
    for (i, sub) in program.subprograms.iter().enumerate() {
        rows.push(vec![
            Value::Integer(-1),
            Value::Text("Trigger".to_string()),
            Value::Integer(i as i64),
            Value::Integer(sub.n_mem as i64),
            Value::Integer(sub.n_cursor as i64),
            Value::Text(sub.name.clone()),
            Value::Integer(0),
            Value::Null,
        ]);
        rows.extend(sub.ops.iter().enumerate().map(|(addr, op)| explain_row(addr, op)));
    }
    rows
}

/// Multi-line listing for debug logs
pub fn listing(ops: &[VdbeOp]) -> String {
    ops.iter()
        .enumerate()
        .map(|(addr, op)| format!("{:>4} {}\n", addr, op))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdbe::ops::{Opcode, P4};
    use std::sync::Arc;

    #[test]
    fn test_explain_row_columns() {
        let op = VdbeOp::with_p4(Opcode::String8, 0, 3, 0, P4::Text("hi".into())).with_comment("c");
        let row = explain_row(7, &op);
        assert_eq!(row.len(), EXPLAIN_COLUMNS.len());
        assert_eq!(row[0], Value::Integer(7));
        assert_eq!(row[1], Value::Text("String8".into()));
        assert_eq!(row[5], Value::Text("hi".into()));
        assert_eq!(row[7], Value::Text("c".into()));
    }

    #[test]
    fn test_explain_rows_include_subprograms() {
        let program = Program {
            ops: Arc::new(vec![VdbeOp::new(Opcode::Halt, 0, 0, 0)]),
            subprograms: Arc::new(vec![crate::vdbe::SubProgram {
                ops: vec![VdbeOp::new(Opcode::Noop, 0, 0, 0)],
                n_mem: 2,
                n_cursor: 0,
                name: "tr".into(),
            }]),
            explain: true,
            ..Default::default()
        };
        let rows = explain_rows(&program);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][5], Value::Text("tr".into()));
    }
}
