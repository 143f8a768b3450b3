//! Error types and Result aliases
//!
//! Errors carry a primary result code in the SQLite vocabulary and an
//! optional human-readable message. Constraint failures additionally
//! record which kind of constraint fired so callers can distinguish a
//! NOT NULL violation from a UNIQUE one without parsing the message.

use std::fmt;

use thiserror::Error as ThisError;

// ============================================================================
// Result Codes
// ============================================================================

/// Primary result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result
    #[default]
    Ok = 0,
    /// Generic error
    Error = 1,
    /// Internal logic error
    Internal = 2,
    /// Access permission denied
    Perm = 3,
    /// Callback routine requested an abort
    Abort = 4,
    /// The database file is locked
    Busy = 5,
    /// A table in the database is locked
    Locked = 6,
    /// Allocation failed
    NoMem = 7,
    /// Attempt to write a readonly database
    ReadOnly = 8,
    /// Operation terminated by interrupt
    Interrupt = 9,
    /// The database disk image is malformed
    Corrupt = 11,
    /// Unknown opcode or object
    NotFound = 12,
    /// Insertion failed because database is full
    Full = 13,
    /// Unable to open the database file
    CantOpen = 14,
    /// The database schema changed
    Schema = 17,
    /// String or BLOB exceeds size limit
    TooBig = 18,
    /// Abort due to constraint violation
    Constraint = 19,
    /// Data type mismatch
    Mismatch = 20,
    /// Library used incorrectly
    Misuse = 21,
    /// Bind parameter or column index out of range
    Range = 25,
}

impl ErrorCode {
    /// Convert a raw integer code (as stored in a Halt operand)
    pub fn from_i32(code: i32) -> Option<ErrorCode> {
        Some(match code {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Error,
            2 => ErrorCode::Internal,
            3 => ErrorCode::Perm,
            4 => ErrorCode::Abort,
            5 => ErrorCode::Busy,
            6 => ErrorCode::Locked,
            7 => ErrorCode::NoMem,
            8 => ErrorCode::ReadOnly,
            9 => ErrorCode::Interrupt,
            11 => ErrorCode::Corrupt,
            12 => ErrorCode::NotFound,
            13 => ErrorCode::Full,
            14 => ErrorCode::CantOpen,
            17 => ErrorCode::Schema,
            18 => ErrorCode::TooBig,
            19 => ErrorCode::Constraint,
            20 => ErrorCode::Mismatch,
            21 => ErrorCode::Misuse,
            25 => ErrorCode::Range,
            _ => return None,
        })
    }

    /// Default English text for a result code (sqlite3_errstr)
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "not an error",
            ErrorCode::Error => "SQL logic error",
            ErrorCode::Internal => "internal error",
            ErrorCode::Perm => "access permission denied",
            ErrorCode::Abort => "query aborted",
            ErrorCode::Busy => "database is locked",
            ErrorCode::Locked => "database table is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::Interrupt => "interrupted",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::NotFound => "unknown operation",
            ErrorCode::Full => "database or disk is full",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::Schema => "database schema has changed",
            ErrorCode::TooBig => "string or blob too big",
            ErrorCode::Constraint => "constraint failed",
            ErrorCode::Mismatch => "datatype mismatch",
            ErrorCode::Misuse => "bad parameter or other API misuse",
            ErrorCode::Range => "column index out of range",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Constraint Kinds
// ============================================================================

/// Which constraint a SQLITE_CONSTRAINT error came from
///
/// The discriminants are what the code generator stores in the P5 operand
/// of a constraint-failure Halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ConstraintKind {
    NotNull = 1,
    Check = 2,
    Unique = 3,
    PrimaryKey = 4,
    RowId = 5,
    ForeignKey = 6,
    Trigger = 7,
}

impl ConstraintKind {
    pub fn from_p5(p5: u16) -> Option<ConstraintKind> {
        Some(match p5 {
            1 => ConstraintKind::NotNull,
            2 => ConstraintKind::Check,
            3 => ConstraintKind::Unique,
            4 => ConstraintKind::PrimaryKey,
            5 => ConstraintKind::RowId,
            6 => ConstraintKind::ForeignKey,
            7 => ConstraintKind::Trigger,
            _ => return None,
        })
    }
}

// ============================================================================
// Error
// ============================================================================

/// Crate-wide error value
#[derive(Debug, Clone, PartialEq, ThisError)]
#[error("{}", error_text(.code, .message))]
pub struct Error {
    /// Primary result code
    pub code: ErrorCode,
    /// Detailed message, when one is available
    pub message: Option<String>,
    /// Constraint kind for `ErrorCode::Constraint`
    pub constraint: Option<ConstraintKind>,
}

impl Error {
    /// Error with only a result code
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
            constraint: None,
        }
    }

    /// Error with a result code and message
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: Some(message.into()),
            constraint: None,
        }
    }

    /// Constraint violation of a particular kind
    pub fn constraint(kind: ConstraintKind, message: impl Into<String>) -> Self {
        Error {
            code: ErrorCode::Constraint,
            message: Some(message.into()),
            constraint: Some(kind),
        }
    }

    /// Shorthand for a generic SQL error (SQLITE_ERROR) with a message
    pub fn sql(message: impl Into<String>) -> Self {
        Error::with_message(ErrorCode::Error, message)
    }

    /// The message as sqlite3_errmsg would report it
    pub fn errmsg(&self) -> String {
        self.to_string()
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

fn error_text<'a>(code: &ErrorCode, message: &'a Option<String>) -> &'a str {
    message.as_deref().unwrap_or_else(|| code.as_str())
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_uses_message() {
        let e = Error::with_message(ErrorCode::Error, "no such table: t");
        assert_eq!(e.to_string(), "no such table: t");
    }

    #[test]
    fn test_error_display_falls_back_to_code_text() {
        let e = Error::new(ErrorCode::Schema);
        assert_eq!(e.to_string(), "database schema has changed");
    }

    #[test]
    fn test_constraint_kind_round_trip() {
        let e = Error::constraint(ConstraintKind::NotNull, "NOT NULL constraint failed: t.b");
        assert_eq!(e.code, ErrorCode::Constraint);
        assert_eq!(e.constraint, Some(ConstraintKind::NotNull));
        assert_eq!(ConstraintKind::from_p5(ConstraintKind::Unique as u16), Some(ConstraintKind::Unique));
        assert_eq!(ConstraintKind::from_p5(0), None);
    }

    #[test]
    fn test_error_code_from_i32() {
        assert_eq!(ErrorCode::from_i32(19), Some(ErrorCode::Constraint));
        assert_eq!(ErrorCode::from_i32(10), None);
    }
}
