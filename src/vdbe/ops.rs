//! VDBE Opcodes and Instructions
//!
//! The instruction set the code generators emit and the engine runs.
//! Registers are 1-based, cursors 0-based, jump targets are absolute
//! addresses once labels are resolved. Comparison opcodes test
//! `r[P1] <op> r[P3]`; arithmetic opcodes compute `r[P3] = r[P1] <op> r[P2]`.

use std::fmt;
use std::sync::Arc;

use crate::types::Value;
use crate::vdbe::value::Collation;

// ============================================================================
// Opcode Definitions
// ============================================================================

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $name:ident, )*) => {
        /// VDBE opcode
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $(#[$doc])* $name, )*
        }

        impl Opcode {
            /// Opcode name as shown by EXPLAIN
            pub fn name(&self) -> &'static str {
                match self {
                    $( Opcode::$name => stringify!($name), )*
                }
            }
        }
    };
}

opcodes! {
    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------
    /// Jump to P2 (the program prologue) at startup
    Init,
    /// Stop. P1 result code, P2 conflict policy, P4 message, P5 constraint kind
    Halt,
    /// Halt if r[P3] is NULL (same operands as Halt)
    HaltIfNull,
    /// Jump to P2
    Goto,
    /// r[P1] = return address, jump to P2
    Gosub,
    /// Jump to the address in r[P1]
    Return,
    /// r[P1] = P3 (coroutine entry), then jump to P2 if nonzero
    InitCoroutine,
    /// Swap the program counter with r[P1]
    Yield,
    /// Finish a coroutine: jump to the P2 of the Yield that resumed it
    EndCoroutine,
    /// Jump to P2 if r[P1] is true (or NULL and P3 != 0)
    If,
    /// Jump to P2 if r[P1] is false (or NULL and P3 != 0)
    IfNot,
    /// Jump to P2 if r[P1] is NULL
    IsNull,
    /// Jump to P2 if r[P1] is not NULL
    NotNull,
    /// If r[P1] > 0 then r[P1] -= P3 and jump to P2
    IfPos,
    /// If r[P1] != 0 then decrement a positive r[P1] and jump to P2
    IfNotZero,
    /// Decrement r[P1]; jump to P2 if the result is exactly zero
    DecrJumpZero,
    /// r[P2] = r[P1] + r[P3] when r[P1] > 0, else -1
    OffsetLimit,
    /// Force r[P1] to an integer; jump to P2 if impossible (error if P2 == 0)
    MustBeInt,
    /// Fall through the first time, jump to P2 afterwards
    Once,
    /// Do nothing
    Noop,
    /// Run trigger program P4 with parameters starting at r[P1]; jump to P2 on
    /// RAISE(IGNORE); when P5 != 0 skip it if it is already running
    Program,
    /// r[P2] = parent frame register (Program.P1 + P1)
    Param,
    /// Add P2 to the statement foreign key violation counter
    FkCounter,
    /// Jump to P2 if the foreign key violation counter is zero
    FkIfZero,
    /// Begin a read (P2 == 0) or write transaction; P3 is the expected schema cookie
    Transaction,

    // ------------------------------------------------------------------
    // Data movement
    // ------------------------------------------------------------------
    /// r[P2..=P3] = NULL (just r[P2] when P3 < P2)
    Null,
    /// r[P2] = P1
    Integer,
    /// r[P2] = P4 integer
    Int64,
    /// r[P2] = P4 real
    Real,
    /// r[P2] = P4 text
    String8,
    /// r[P2] = P4 blob
    Blob,
    /// r[P2] = bound parameter P1
    Variable,
    /// r[P2..P2+P3] = r[P1..P1+P3]
    Copy,
    /// r[P2] = r[P1]
    SCopy,
    /// Move P3 registers from r[P1] to r[P2], leaving NULLs behind
    Move,
    /// r[P2] = integer value of r[P1]
    IntCopy,
    /// Output r[P1..P1+P2] as a result row
    ResultRow,

    // ------------------------------------------------------------------
    // Comparison and logic
    // ------------------------------------------------------------------
    /// Jump to P2 if r[P1] == r[P3]
    Eq,
    /// Jump to P2 if r[P1] != r[P3]
    Ne,
    /// Jump to P2 if r[P1] < r[P3]
    Lt,
    /// Jump to P2 if r[P1] <= r[P3]
    Le,
    /// Jump to P2 if r[P1] > r[P3]
    Gt,
    /// Jump to P2 if r[P1] >= r[P3]
    Ge,
    /// Compare r[P1..P1+P3] with r[P2..P2+P3] under KeyInfo P4
    Compare,
    /// Jump to P1, P2 or P3 for a previous Compare of <, == or >
    Jump,
    /// r[P3] = r[P1] AND r[P2]
    And,
    /// r[P3] = r[P1] OR r[P2]
    Or,
    /// r[P2] = NOT r[P1]
    Not,
    /// r[P2] = truth of r[P1], P3 when NULL, inverted when P5 != 0
    IsTrue,
    /// r[P2] = ~r[P1]
    BitNot,
    /// r[P2] = -r[P1]
    Negate,

    // ------------------------------------------------------------------
    // Arithmetic
    // ------------------------------------------------------------------
    /// r[P3] = r[P1] + r[P2]
    Add,
    /// r[P3] = r[P1] - r[P2]
    Subtract,
    /// r[P3] = r[P1] * r[P2]
    Multiply,
    /// r[P3] = r[P1] / r[P2]
    Divide,
    /// r[P3] = r[P1] % r[P2]
    Remainder,
    /// r[P3] = r[P1] || r[P2]
    Concat,
    /// r[P3] = r[P1] & r[P2]
    BitAnd,
    /// r[P3] = r[P1] | r[P2]
    BitOr,
    /// r[P3] = r[P1] << r[P2]
    ShiftLeft,
    /// r[P3] = r[P1] >> r[P2]
    ShiftRight,
    /// r[P1] += P2
    AddImm,
    /// Cast r[P1] to the affinity P2
    Cast,
    /// Apply affinity string P4 to r[P1..P1+P2]
    Affinity,
    /// r[P3] = function P4 over P5 arguments at r[P2]
    Function,
    /// Step aggregate P4 with P5 arguments at r[P2] into accumulator r[P3]
    /// (P1 is the collation code)
    AggStep,
    /// Finalize aggregate P4 in accumulator r[P1]
    AggFinal,
    /// r[P1] = max(r[P1], r[P2]) where r[P1] lives in the root frame
    MemMax,

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------
    /// Open cursor P1 for reading on root P2 (index when P4 is a KeyInfo)
    OpenRead,
    /// Open cursor P1 for writing on root P2 (index when P4 is a KeyInfo)
    OpenWrite,
    /// Open transient table cursor P1 with P2 columns (index when P4 is a KeyInfo)
    OpenEphemeral,
    /// Open cursor P1 over the single record held in r[P2], P3 columns
    OpenPseudo,
    /// Open sorter cursor P1 with P2 columns and KeyInfo P4
    SorterOpen,
    /// Close cursor P1
    Close,
    /// Put cursor P1 on a row of all NULLs
    NullRow,
    /// Jump to P2 if cursor P1 is on a NULL row, setting r[P3] to NULL
    IfNullRow,
    /// Move cursor P1 to its first entry; jump to P2 if empty
    Rewind,
    /// Move cursor P1 to its last entry; jump to P2 if empty
    Last,
    /// Advance cursor P1; jump to P2 if another entry exists
    Next,
    /// Step cursor P1 backwards; jump to P2 if another entry exists
    Prev,
    /// Sort sorter P1; jump to P2 if empty
    SorterSort,
    /// Advance sorter P1; jump to P2 if another entry exists
    SorterNext,
    /// r[P2] = current sorter record of P1
    SorterData,
    /// Add record r[P2] to sorter P1
    SorterInsert,
    /// Discard all entries of transient cursor P1
    ResetSorter,
    /// r[P3] = column P2 of cursor P1 (P4 default when absent)
    Column,
    /// r[P2] = rowid of cursor P1
    Rowid,
    /// r[P2] = rowid stored at the end of index cursor P1's key
    IdxRowid,
    /// r[P2] = raw record of the current row of P1
    RowData,
    /// r[P3] = record of r[P1..P1+P2] after applying affinity string P4
    MakeRecord,
    /// r[P2] = fresh rowid for table cursor P1, above root register r[P3] if P3 != 0
    NewRowid,
    /// Write record r[P2] at rowid r[P3] through cursor P1 (P4 table name)
    Insert,
    /// Insert record r[P2] into index cursor P1
    IdxInsert,
    /// Delete the current row of cursor P1
    Delete,
    /// Delete the index entry matching r[P2..P2+P3] from cursor P1
    IdxDelete,
    /// Position cursor P1 at rowid r[P3]; jump to P2 if missing
    SeekRowid,
    /// Like SeekRowid; r[P3] is known to be an integer
    NotExists,
    /// Position at first key >= r[P3..P3+P4]; jump to P2 if none
    SeekGE,
    /// Position at first key > r[P3..P3+P4]; jump to P2 if none
    SeekGT,
    /// Position at last key <= r[P3..P3+P4]; jump to P2 if none
    SeekLE,
    /// Position at last key < r[P3..P3+P4]; jump to P2 if none
    SeekLT,
    /// Jump to P2 if the current key prefix >= r[P3..P3+P4]
    IdxGE,
    /// Jump to P2 if the current key prefix > r[P3..P3+P4]
    IdxGT,
    /// Jump to P2 if the current key prefix <= r[P3..P3+P4]
    IdxLE,
    /// Jump to P2 if the current key prefix < r[P3..P3+P4]
    IdxLT,
    /// Jump to P2 if a key matching r[P3..P3+P4] exists (record r[P3] when P4 == 0)
    Found,
    /// Jump to P2 if no key matches r[P3..P3+P4]
    NotFound,
    /// Jump to P2 if no key matches or the probe holds a NULL
    NoConflict,
    /// r[P2] = number of entries in cursor P1
    Count,
    /// r[P2] = next sequence number of cursor P1
    Sequence,
    /// Remove all rows of root P1 (P5 counts them as changes)
    Clear,
    /// Add the integer r[P2] to row set r[P1]
    RowSetAdd,
    /// Pop the smallest value of row set r[P1] into r[P3]; jump to P2 when empty
    RowSetRead,
}

impl Opcode {
    /// Whether P2 of this opcode is a jump target
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Opcode::Init
                | Opcode::Goto
                | Opcode::Gosub
                | Opcode::InitCoroutine
                | Opcode::If
                | Opcode::IfNot
                | Opcode::IsNull
                | Opcode::NotNull
                | Opcode::IfPos
                | Opcode::IfNotZero
                | Opcode::DecrJumpZero
                | Opcode::MustBeInt
                | Opcode::Once
                | Opcode::Program
                | Opcode::FkIfZero
                | Opcode::Eq
                | Opcode::Ne
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge
                | Opcode::Yield
                | Opcode::IfNullRow
                | Opcode::Rewind
                | Opcode::Last
                | Opcode::Next
                | Opcode::Prev
                | Opcode::SorterSort
                | Opcode::SorterNext
                | Opcode::SeekRowid
                | Opcode::NotExists
                | Opcode::SeekGE
                | Opcode::SeekGT
                | Opcode::SeekLE
                | Opcode::SeekLT
                | Opcode::IdxGE
                | Opcode::IdxGT
                | Opcode::IdxLE
                | Opcode::IdxLT
                | Opcode::Found
                | Opcode::NotFound
                | Opcode::NoConflict
                | Opcode::RowSetRead
        )
    }

    /// Whether this opcode can modify the database
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Opcode::OpenWrite
                | Opcode::Insert
                | Opcode::IdxInsert
                | Opcode::Delete
                | Opcode::IdxDelete
                | Opcode::Clear
        )
    }
}

// ============================================================================
// P4 Operand
// ============================================================================

/// Comparison sequence description for index keys and sorters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyInfo {
    /// Collation per key column
    pub collations: Vec<Collation>,
    /// true = DESC for each key column
    pub sort_orders: Vec<bool>,
    /// Number of leading columns that participate in comparisons
    pub n_key_field: usize,
}

impl KeyInfo {
    /// KeyInfo of `n` binary ascending columns
    pub fn new(n: usize) -> Self {
        KeyInfo {
            collations: vec![Collation::Binary; n],
            sort_orders: vec![false; n],
            n_key_field: n,
        }
    }

    pub fn collation(&self, i: usize) -> Collation {
        self.collations.get(i).copied().unwrap_or(Collation::Binary)
    }

    pub fn is_desc(&self, i: usize) -> bool {
        self.sort_orders.get(i).copied().unwrap_or(false)
    }
}

/// A compiled trigger body
///
/// Subprograms live in a table owned by the statement's program and are
/// referenced by position, so a trigger body may invoke itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubProgram {
    pub ops: Vec<VdbeOp>,
    /// Registers the frame needs
    pub n_mem: i32,
    /// Cursors the frame needs
    pub n_cursor: i32,
    /// Trigger name, for EXPLAIN
    pub name: String,
}

/// Fourth operand
#[derive(Debug, Clone, PartialEq, Default)]
pub enum P4 {
    #[default]
    Unused,
    Int64(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Value(Value),
    Collation(Collation),
    /// Function name
    Func(String),
    KeyInfo(Arc<KeyInfo>),
    /// Position in the statement's subprogram table
    Subprogram(usize),
    /// Table name (Insert/Delete bookkeeping)
    Table(String),
}

impl P4 {
    pub fn is_unused(&self) -> bool {
        matches!(self, P4::Unused)
    }

    pub fn as_int(&self) -> i64 {
        match self {
            P4::Int64(i) => *i,
            _ => 0,
        }
    }
}

// ============================================================================
// Instruction
// ============================================================================

/// P5 flags for Insert/Delete
pub mod opflag {
    /// Count the change
    pub const NCHANGE: u16 = 0x01;
    /// Record last_insert_rowid
    pub const LASTROWID: u16 = 0x02;
    /// The write is part of an UPDATE
    pub const ISUPDATE: u16 = 0x04;
    /// Cursor is already positioned by a prior NoConflict/NotExists
    pub const USESEEKRESULT: u16 = 0x10;
}

/// P5 flags for comparison opcodes
pub mod cmp_flags {
    /// NULL values compare equal (IS / IS NOT)
    pub const NULLEQ: u16 = 0x80;
    /// Jump if either operand is NULL
    pub const JUMPIFNULL: u16 = 0x10;
    /// Store the boolean result in r[P2] instead of jumping
    pub const STOREP2: u16 = 0x20;
    /// Affinity mask (see `Affinity::p5_code`)
    pub const AFFINITY_MASK: u16 = 0x0F;
}

/// A single VDBE instruction
#[derive(Debug, Clone, PartialEq)]
pub struct VdbeOp {
    pub opcode: Opcode,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub p4: P4,
    pub p5: u16,
    pub comment: Option<String>,
}

impl VdbeOp {
    pub fn new(opcode: Opcode, p1: i32, p2: i32, p3: i32) -> Self {
        Self::with_p4(opcode, p1, p2, p3, P4::Unused)
    }

    pub fn with_p4(opcode: Opcode, p1: i32, p2: i32, p3: i32, p4: P4) -> Self {
        Self {
            opcode,
            p1,
            p2,
            p3,
            p4,
            p5: 0,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_p5(mut self, p5: u16) -> Self {
        self.p5 = p5;
        self
    }
}

impl fmt::Display for P4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            P4::Unused => Ok(()),
            P4::Int64(i) => write!(f, "{}", i),
            P4::Real(r) => write!(f, "{}", r),
            P4::Text(s) => write!(f, "{}", s),
            P4::Blob(b) => write!(f, "x'{}'", hex::encode(b)),
            P4::Value(v) => write!(f, "{}", v),
            P4::Collation(c) => write!(f, "({})", c.name()),
            P4::Func(n) => write!(f, "{}()", n),
            P4::KeyInfo(k) => {
                write!(f, "k({}", k.n_key_field)?;
                for i in 0..k.n_key_field {
                    let desc = if k.is_desc(i) { "-" } else { "" };
                    write!(f, ",{}{}", desc, k.collation(i).name())?;
                }
                write!(f, ")")
            }
            P4::Subprogram(i) => write!(f, "program(#{})", i),
            P4::Table(t) => write!(f, "{}", t),
        }
    }
}

impl fmt::Display for VdbeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<13} {:>4} {:>4} {:>4}",
            self.opcode.name(),
            self.p1,
            self.p2,
            self.p3
        )?;
        if !self.p4.is_unused() {
            write!(f, "  {}", self.p4)?;
        }
        if self.p5 != 0 {
            write!(f, "  p5={}", self.p5)?;
        }
        if let Some(ref comment) = self.comment {
            write!(f, "  ; {}", comment)?;
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

    #[test]
    fn test_opcode_is_jump() {
        assert!(Opcode::Goto.is_jump());
        assert!(Opcode::NoConflict.is_jump());
        assert!(Opcode::Next.is_jump());
        assert!(!Opcode::Null.is_jump());
        assert!(!Opcode::MakeRecord.is_jump());
    }

    #[test]
    fn test_opcode_name() {
        assert_eq!(Opcode::SeekGE.name(), "SeekGE");
        assert_eq!(Opcode::InitCoroutine.name(), "InitCoroutine");
    }

    #[test]
    fn test_vdbe_op_display() {
        let op = VdbeOp::with_p4(Opcode::String8, 0, 1, 0, P4::Text("test".to_string()))
            .with_comment("load string");
        let s = format!("{}", op);
        assert!(s.contains("String8"));
        assert!(s.contains("test"));
        assert!(s.contains("; load string"));
    }

    #[test]
    fn test_key_info_display() {
        let mut ki = KeyInfo::new(2);
        ki.sort_orders[1] = true;
        ki.collations[0] = Collation::NoCase;
        assert_eq!(P4::KeyInfo(Arc::new(ki)).to_string(), "k(2,NOCASE,-BINARY)");
    }

    #[test]
    fn test_blob_display_uses_hex() {
        assert_eq!(P4::Blob(vec![0xde, 0xad]).to_string(), "x'dead'");
    }
}
