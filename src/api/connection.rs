//! Database connection management
//!
//! A connection owns the in-memory database and its configuration. Prepared
//! statements keep a handle on the same state so that `sqlite3_step` needs
//! nothing but the statement.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::Database;
use crate::types::RowId;

use super::config::{DbConfig, DbConfigOption, Optimizations};

// ============================================================================
// Connection State
// ============================================================================

/// State shared between a connection and its prepared statements
#[derive(Debug, Default)]
pub struct ConnState {
    pub db: Database,
    pub config: DbConfig,
    /// Last error code
    pub err_code: ErrorCode,
    /// Error message
    pub err_msg: Option<String>,
    /// Rows changed by the most recent INSERT, UPDATE or DELETE
    pub changes: i64,
    /// Total changes since connection opened
    pub total_changes: i64,
    pub last_insert_rowid: RowId,
}

impl ConnState {
    /// Record the outcome of an API call
    pub fn record<T>(&mut self, r: &Result<T>) {
        match r {
            Ok(_) => {
                self.err_code = ErrorCode::Ok;
                self.err_msg = None;
            }
            Err(e) => {
                self.err_code = e.code;
                self.err_msg = Some(e.errmsg());
            }
        }
    }
}

pub(crate) type Shared = Arc<Mutex<ConnState>>;

pub(crate) fn lock(state: &Shared) -> Result<MutexGuard<'_, ConnState>> {
    state
        .lock()
        .map_err(|_| Error::with_message(ErrorCode::Misuse, "connection state poisoned"))
}

// ============================================================================
// Connection
// ============================================================================

/// SQLite database connection (sqlite3)
#[derive(Debug)]
pub struct SqliteConnection {
    /// Path given to `sqlite3_open`
    pub path: String,
    pub(crate) state: Shared,
}

impl Default for SqliteConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteConnection {
    /// Create a new in-memory connection
    pub fn new() -> Self {
        Self {
            path: ":memory:".to_string(),
            state: Arc::new(Mutex::new(ConnState::default())),
        }
    }

    /// Run `f` with the connection state locked
    pub fn with_state<T>(&self, f: impl FnOnce(&mut ConnState) -> T) -> Result<T> {
        let mut guard = lock(&self.state)?;
        Ok(f(&mut guard))
    }

    /// Set an error on this connection
    pub fn set_error(&self, code: ErrorCode, msg: &str) {
        let _ = self.with_state(|s| {
            s.err_code = code;
            s.err_msg = Some(msg.to_string());
        });
    }

    /// Clear any pending error
    pub fn clear_error(&self) {
        let _ = self.with_state(|s| {
            s.err_code = ErrorCode::Ok;
            s.err_msg = None;
        });
    }

    /// Get autocommit state
    pub fn get_autocommit(&self) -> bool {
        self.with_state(|s| s.db.autocommit()).unwrap_or(true)
    }

    /// Prepared statements still holding this connection
    fn open_statements(&self) -> usize {
        Arc::strong_count(&self.state) - 1
    }
}

// ============================================================================
// Open/Close Functions
// ============================================================================

/// sqlite3_open - Open a database connection
///
/// Only in-memory databases exist: `filename` must be `":memory:"` or empty.
pub fn sqlite3_open(filename: &str) -> Result<Box<SqliteConnection>> {
    if !filename.is_empty() && filename != ":memory:" {
        return Err(Error::with_message(
            ErrorCode::CantOpen,
            format!("unable to open database file: {}", filename),
        ));
    }
    let mut conn = Box::new(SqliteConnection::new());
    conn.path = filename.to_string();
    debug!(path = filename, "connection opened");
    Ok(conn)
}

/// sqlite3_close - Close a database connection
///
/// Returns SQLITE_BUSY if there are unfinalized statements. They keep the
/// database alive until they are finalized.
pub fn sqlite3_close(conn: Box<SqliteConnection>) -> Result<()> {
    let pending = conn.open_statements();
    if pending > 0 {
        debug!(pending, "close with unfinalized statements");
        return Err(Error::with_message(
            ErrorCode::Busy,
            "unable to close due to unfinalized statements",
        ));
    }
    let mut s = lock(&conn.state)?;
    // An open transaction is rolled back
    s.db.rollback_if_active();
    debug!("connection closed");
    Ok(())
}

// ============================================================================
// Error Functions
// ============================================================================

/// sqlite3_errcode - Get error code
pub fn sqlite3_errcode(conn: &SqliteConnection) -> ErrorCode {
    conn.with_state(|s| s.err_code).unwrap_or(ErrorCode::Misuse)
}

/// sqlite3_errmsg - Get error message
pub fn sqlite3_errmsg(conn: &SqliteConnection) -> String {
    conn.with_state(|s| {
        s.err_msg
            .clone()
            .unwrap_or_else(|| sqlite3_errstr(s.err_code).to_string())
    })
    .unwrap_or_else(|e| e.errmsg())
}

/// sqlite3_errstr - Get error string for code
pub fn sqlite3_errstr(code: ErrorCode) -> &'static str {
    code.as_str()
}

// ============================================================================
// State and Info Functions
// ============================================================================

/// sqlite3_changes - Rows changed by the most recent INSERT, UPDATE or DELETE
pub fn sqlite3_changes(conn: &SqliteConnection) -> i64 {
    conn.with_state(|s| s.changes).unwrap_or(0)
}

/// sqlite3_total_changes - Total rows changed since connection opened
pub fn sqlite3_total_changes(conn: &SqliteConnection) -> i64 {
    conn.with_state(|s| s.total_changes).unwrap_or(0)
}

/// sqlite3_last_insert_rowid - Get last insert rowid
pub fn sqlite3_last_insert_rowid(conn: &SqliteConnection) -> RowId {
    conn.with_state(|s| s.last_insert_rowid).unwrap_or(0)
}

/// sqlite3_get_autocommit - Check autocommit mode
pub fn sqlite3_get_autocommit(conn: &SqliteConnection) -> bool {
    conn.get_autocommit()
}

// ============================================================================
// Database Configuration
// ============================================================================

/// sqlite3_db_config - Configure connection
///
/// A negative `value` queries the current setting without changing it.
/// Returns the setting in effect afterwards. Statements already prepared
/// keep the behaviour they were compiled with.
pub fn sqlite3_db_config(conn: &mut SqliteConnection, option: DbConfigOption, value: i64) -> Result<i64> {
    let mut s = lock(&conn.state)?;
    if value < 0 {
        return Ok(s.config.get(option));
    }
    let r = s.config.set(option, value);
    s.record(&r);
    r
}

/// sqlite3_test_control(SQLITE_TESTCTRL_OPTIMIZATIONS) - Toggle optimizations
pub fn sqlite3_test_control_optimizations(
    conn: &mut SqliteConnection,
    opts: Optimizations,
    enabled: bool,
) -> Result<()> {
    let mut s = lock(&conn.state)?;
    s.config.set_optimizations(opts, enabled);
    debug!(mask = opts.bits(), enabled, "optimizations changed");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let conn = sqlite3_open(":memory:").unwrap();
        assert!(sqlite3_get_autocommit(&conn));
        assert_eq!(sqlite3_errcode(&conn), ErrorCode::Ok);
        assert!(sqlite3_close(conn).is_ok());
    }

    #[test]
    fn test_open_file_is_refused() {
        let e = sqlite3_open("test.db").unwrap_err();
        assert_eq!(e.code, ErrorCode::CantOpen);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(sqlite3_errstr(ErrorCode::Ok), "not an error");
        assert_eq!(sqlite3_errstr(ErrorCode::Error), "SQL logic error");
        assert_eq!(sqlite3_errstr(ErrorCode::Schema), "database schema has changed");

        let conn = SqliteConnection::new();
        assert_eq!(sqlite3_errmsg(&conn), "not an error");
        conn.set_error(ErrorCode::Constraint, "UNIQUE constraint failed: t.a");
        assert_eq!(sqlite3_errcode(&conn), ErrorCode::Constraint);
        assert_eq!(sqlite3_errmsg(&conn), "UNIQUE constraint failed: t.a");
        conn.clear_error();
        assert_eq!(sqlite3_errmsg(&conn), "not an error");
    }

    #[test]
    fn test_db_config() {
        let mut conn = SqliteConnection::new();
        assert_eq!(sqlite3_db_config(&mut conn, DbConfigOption::EnableFkey, -1).unwrap(), 0);
        assert_eq!(sqlite3_db_config(&mut conn, DbConfigOption::EnableFkey, 1).unwrap(), 1);
        assert!(conn.with_state(|s| s.config.foreign_keys).unwrap());
        assert_eq!(sqlite3_db_config(&mut conn, DbConfigOption::MaxSchemaRetries, 3).unwrap(), 3);
    }

    #[test]
    fn test_optimizations() {
        let mut conn = SqliteConnection::new();
        sqlite3_test_control_optimizations(&mut conn, Optimizations::ONEPASS, false).unwrap();
        assert!(!conn.with_state(|s| s.config.enabled(Optimizations::ONEPASS)).unwrap());
        sqlite3_test_control_optimizations(&mut conn, Optimizations::all(), true).unwrap();
        assert!(conn.with_state(|s| s.config.enabled(Optimizations::ONEPASS)).unwrap());
    }
}
