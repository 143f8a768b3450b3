//! Virtual Database Engine (VDBE)
//!
//! The code generators in `executor` compile every statement into a
//! `Program`; a `Vdbe` runs one against a `Database`.

pub mod builder;
pub mod engine;
pub mod explain;
pub mod ops;
pub mod record;
pub mod value;

use std::sync::Arc;

pub use builder::{Label, VdbeBuilder};
pub use engine::Vdbe;
pub use ops::{KeyInfo, Opcode, SubProgram, VdbeOp, P4};
pub use record::{decode_record, make_record};

/// A compiled statement
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub ops: Arc<Vec<VdbeOp>>,
    /// Trigger bodies referenced by `Program` instructions
    pub subprograms: Arc<Vec<SubProgram>>,
    /// Registers of the root frame
    pub n_mem: i32,
    /// Cursors of the root frame
    pub n_cursor: i32,
    /// Result column names
    pub column_names: Vec<String>,
    /// Highest parameter number used
    pub n_var: usize,
    /// The statement never writes (SELECT)
    pub read_only: bool,
    /// Step returns the instruction listing instead of running it
    pub explain: bool,
}

impl Program {
    /// Number of result columns a step can produce
    pub fn column_count(&self) -> usize {
        if self.explain {
            explain::EXPLAIN_COLUMNS.len()
        } else {
            self.column_names.len()
        }
    }

    pub fn column_name(&self, i: usize) -> Option<&str> {
        if self.explain {
            explain::EXPLAIN_COLUMNS.get(i).copied()
        } else {
            self.column_names.get(i).map(String::as_str)
        }
    }
}
