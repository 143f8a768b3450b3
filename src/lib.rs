//! sqlcore - query execution core of an embedded SQL database
//!
//! SQL text is parsed into an AST, compiled by the `executor` code
//! generators into a bytecode `Program`, and run by the `vdbe` against an
//! in-memory b-tree store. The `api` module exposes the familiar
//! `sqlite3_*` entry points on top.

pub mod api;
pub mod error;
pub mod executor;
pub mod functions;
pub mod parser;
pub mod schema;
pub mod storage;
pub mod types;
pub mod vdbe;

// Re-export main public types
pub use error::{ConstraintKind, Error, ErrorCode, Result};

// Re-export API types and functions
pub use api::{
    sqlite3_bind_blob, sqlite3_bind_double, sqlite3_bind_int, sqlite3_bind_int64, sqlite3_bind_null,
    sqlite3_bind_parameter_count, sqlite3_bind_parameter_index, sqlite3_bind_parameter_name,
    sqlite3_bind_text, sqlite3_bind_value, sqlite3_changes, sqlite3_clear_bindings, sqlite3_close,
    sqlite3_column_blob, sqlite3_column_bytes, sqlite3_column_count, sqlite3_column_double,
    sqlite3_column_int, sqlite3_column_int64, sqlite3_column_name, sqlite3_column_text,
    sqlite3_column_type, sqlite3_column_value, sqlite3_data_count, sqlite3_db_config, sqlite3_errcode,
    sqlite3_errmsg, sqlite3_errstr, sqlite3_exec, sqlite3_finalize, sqlite3_get_autocommit,
    sqlite3_last_insert_rowid, sqlite3_open, sqlite3_prepare_v2, sqlite3_reset, sqlite3_sql,
    sqlite3_step, sqlite3_stmt_busy, sqlite3_stmt_isexplain, sqlite3_stmt_readonly,
    sqlite3_test_control_optimizations, sqlite3_total_changes, DbConfig, DbConfigOption,
    Optimizations, PreparedStmt, SqliteConnection,
};
pub use types::{ColumnType, StepResult, Value};
