//! Prepared statement handling
//!
//! This module implements sqlite3_stmt (prepared statement) and related functions.
//! A statement remembers the parsed SQL it was built from so it can be
//! recompiled when the schema changes underneath it.

use tracing::{debug, instrument};

use crate::error::{Error, ErrorCode, Result};
use crate::executor::ddl::execute_direct;
use crate::executor::{compile, Compiled};
use crate::parser::ast::Stmt;
use crate::parser::Parser;
use crate::types::{ColumnType, StepResult, Value};
use crate::vdbe::Vdbe;

use super::connection::{lock, ConnState, Shared, SqliteConnection};

// ============================================================================
// Prepared Statement
// ============================================================================

enum Exec {
    Vm(Box<Vdbe>),
    /// Schema change or transaction control; `bool` is set once it has run
    Direct(Stmt, bool),
}

/// Prepared statement (sqlite3_stmt)
pub struct PreparedStmt {
    /// SQL text of this statement alone
    sql: String,
    ast: Stmt,
    exec: Exec,
    read_only: bool,
    conn: Shared,
    /// Parameter values (1-indexed externally)
    params: Vec<Value>,
    /// Parameter names (for named parameters)
    param_names: Vec<Option<String>>,
    /// The last step produced a row
    has_row: bool,
    /// Recompiles since the last step that got past the schema check
    n_reprepare: u32,
}

impl std::fmt::Debug for PreparedStmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStmt").field("sql", &self.sql).finish()
    }
}

impl PreparedStmt {
    fn build(conn: Shared, sql: &str, ast: Stmt, param_names: Vec<Option<String>>) -> Result<Self> {
        let mut stmt = PreparedStmt {
            sql: sql.to_string(),
            ast,
            exec: Exec::Direct(Stmt::Begin, true),
            read_only: true,
            conn,
            params: Vec::new(),
            param_names,
            has_row: false,
            n_reprepare: 0,
        };
        let shared = stmt.conn.clone();
        let state = lock(&shared)?;
        stmt.recompile(&state)?;
        stmt.params = vec![Value::Null; stmt.param_count()];
        Ok(stmt)
    }

    /// Compile the statement against the current schema, keeping bindings
    fn recompile(&mut self, state: &ConnState) -> Result<()> {
        let compiled = compile(&state.db.schema, &state.config, &self.ast)?;
        self.read_only = compiled.is_read_only();
        self.exec = match compiled {
            Compiled::Program(program) => {
                let mut vm = Vdbe::new(program);
                vm.set_max_trigger_depth(state.config.max_trigger_depth);
                for (i, v) in self.params.iter().enumerate() {
                    vm.bind(i + 1, v.clone())?;
                }
                Exec::Vm(Box::new(vm))
            }
            Compiled::Direct(stmt) => Exec::Direct(stmt, false),
        };
        self.has_row = false;
        Ok(())
    }

    /// Get SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Check if read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_explain(&self) -> bool {
        matches!(&self.exec, Exec::Vm(vm) if vm.program().explain)
    }

    fn param_count(&self) -> usize {
        match &self.exec {
            Exec::Vm(vm) => vm.param_count(),
            Exec::Direct(..) => 0,
        }
    }

    fn is_busy(&self) -> bool {
        matches!(&self.exec, Exec::Vm(vm) if vm.is_running())
    }

    fn changes_rows(&self) -> bool {
        matches!(self.ast, Stmt::Insert(_) | Stmt::Update(_) | Stmt::Delete(_))
    }

    fn row(&self) -> Option<&[Value]> {
        match &self.exec {
            Exec::Vm(vm) if self.has_row => Some(vm.row()),
            _ => None,
        }
    }

    fn column(&self, idx: i32) -> Option<&Value> {
        usize::try_from(idx).ok().and_then(|i| self.row()?.get(i))
    }

    /// Run one step with the connection locked
    fn step_locked(&mut self, state: &mut ConnState) -> Result<StepResult> {
        loop {
            let fresh = !self.is_busy();
            match self.step_once(state) {
                Err(e) if e.code == ErrorCode::Schema && fresh => {
                    if self.n_reprepare >= state.config.max_schema_retries {
                        debug!(retries = self.n_reprepare, "schema keeps changing");
                        return Err(e);
                    }
                    self.n_reprepare += 1;
                    debug!(attempt = self.n_reprepare, "schema changed, recompiling");
                    self.recompile(state)?;
                }
                r => {
                    if r.is_ok() {
                        self.n_reprepare = 0;
                    }
                    return r;
                }
            }
        }
    }

    fn step_once(&mut self, state: &mut ConnState) -> Result<StepResult> {
        let counts = self.changes_rows();
        match &mut self.exec {
            Exec::Vm(vm) => {
                let r = vm.step(&mut state.db);
                self.has_row = matches!(r, Ok(StepResult::Row));
                if matches!(r, Ok(StepResult::Done)) && counts && !vm.program().explain {
                    state.changes = vm.changes();
                    state.total_changes += vm.changes();
                    if let Some(rowid) = vm.last_insert_rowid() {
                        state.last_insert_rowid = rowid;
                    }
                }
                r
            }
            Exec::Direct(stmt, done) => {
                if !*done {
                    *done = true;
                    execute_direct(&mut state.db, &state.config, stmt)?;
                }
                Ok(StepResult::Done)
            }
        }
    }

    /// Reset for re-execution
    pub fn reset(&mut self) {
        match &mut self.exec {
            Exec::Vm(vm) => vm.reset(),
            Exec::Direct(_, done) => *done = false,
        }
        self.has_row = false;
    }

    /// Clear all bindings
    pub fn clear_bindings(&mut self) {
        self.params.iter_mut().for_each(|p| *p = Value::Null);
        if let Exec::Vm(vm) = &mut self.exec {
            vm.clear_bindings();
        }
    }

    fn bind(&mut self, idx: i32, value: Value) -> Result<()> {
        if self.is_busy() {
            return Err(Error::with_message(ErrorCode::Misuse, "bind on a busy prepared statement"));
        }
        let slot = usize::try_from(idx)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .filter(|&i| i < self.params.len())
            .ok_or_else(|| Error::with_message(ErrorCode::Range, "column index out of range"))?;
        self.params[slot] = value.clone();
        if let Exec::Vm(vm) = &mut self.exec {
            vm.bind(slot + 1, value)?;
        }
        Ok(())
    }
}

// ============================================================================
// Prepare Functions
// ============================================================================

/// sqlite3_prepare_v2 - Prepare a statement
///
/// Compiles the first statement of `sql`. Returns the statement and any
/// remaining SQL text (tail).
#[instrument(level = "debug", skip(conn))]
pub fn sqlite3_prepare_v2<'a>(
    conn: &mut SqliteConnection,
    sql: &'a str,
) -> Result<(Box<PreparedStmt>, &'a str)> {
    let r = prepare_first(conn, sql);
    conn.with_state(|s| s.record(&r))?;
    let (stmt, tail) = r?;
    match stmt {
        Some(stmt) => Ok((stmt, tail)),
        None => Err(Error::with_message(ErrorCode::Misuse, "no SQL statement to prepare")),
    }
}

fn prepare_first<'a>(
    conn: &SqliteConnection,
    sql: &'a str,
) -> Result<(Option<Box<PreparedStmt>>, &'a str)> {
    let mut parser = Parser::new(sql)?;
    let stmt = next_statement(conn, sql, &mut parser)?;
    Ok((stmt, &sql[parser.offset()..]))
}

fn next_statement(conn: &SqliteConnection, sql: &str, parser: &mut Parser<'_>) -> Result<Option<Box<PreparedStmt>>> {
    let start = parser.offset();
    let Some(ast) = parser.parse_next()? else {
        return Ok(None);
    };
    let text = sql[start..parser.offset()].trim();
    let stmt = PreparedStmt::build(conn.state.clone(), text, ast, parser.params().to_vec())?;
    Ok(Some(Box::new(stmt)))
}

// ============================================================================
// Step and Execute
// ============================================================================

/// sqlite3_step - Execute one step
///
/// Returns Row if a row is available, Done if finished, or an error. A
/// statement compiled against an older schema is recompiled first.
#[instrument(level = "debug", skip_all, fields(sql = %stmt.sql))]
pub fn sqlite3_step(stmt: &mut PreparedStmt) -> Result<StepResult> {
    let shared = stmt.conn.clone();
    let mut state = lock(&shared)?;
    let r = stmt.step_locked(&mut state);
    state.record(&r);
    r
}

/// sqlite3_reset - Reset statement for re-execution
pub fn sqlite3_reset(stmt: &mut PreparedStmt) -> Result<()> {
    stmt.reset();
    Ok(())
}

/// sqlite3_finalize - Destroy a prepared statement
pub fn sqlite3_finalize(stmt: Box<PreparedStmt>) -> Result<()> {
    drop(stmt);
    Ok(())
}

/// sqlite3_exec - Run every statement of a script
///
/// Each statement is compiled only after the previous one has finished, so
/// a script may create a table and then use it. Result rows are discarded.
pub fn sqlite3_exec(conn: &mut SqliteConnection, sql: &str) -> Result<()> {
    let r = exec_script(conn, sql);
    conn.with_state(|s| s.record(&r))?;
    r
}

fn exec_script(conn: &SqliteConnection, sql: &str) -> Result<()> {
    let mut parser = Parser::new(sql)?;
    while let Some(mut stmt) = next_statement(conn, sql, &mut parser)? {
        while sqlite3_step(&mut stmt)? == StepResult::Row {}
    }
    Ok(())
}

// ============================================================================
// Binding Functions
// ============================================================================

/// sqlite3_bind_null - Bind NULL to parameter
pub fn sqlite3_bind_null(stmt: &mut PreparedStmt, idx: i32) -> Result<()> {
    stmt.bind(idx, Value::Null)
}

/// sqlite3_bind_int - Bind i32 to parameter
pub fn sqlite3_bind_int(stmt: &mut PreparedStmt, idx: i32, value: i32) -> Result<()> {
    sqlite3_bind_int64(stmt, idx, value as i64)
}

/// sqlite3_bind_int64 - Bind i64 to parameter
pub fn sqlite3_bind_int64(stmt: &mut PreparedStmt, idx: i32, value: i64) -> Result<()> {
    stmt.bind(idx, Value::Integer(value))
}

/// sqlite3_bind_double - Bind f64 to parameter
pub fn sqlite3_bind_double(stmt: &mut PreparedStmt, idx: i32, value: f64) -> Result<()> {
    stmt.bind(idx, Value::Real(value))
}

/// sqlite3_bind_text - Bind text to parameter
pub fn sqlite3_bind_text(stmt: &mut PreparedStmt, idx: i32, value: &str) -> Result<()> {
    stmt.bind(idx, Value::Text(value.to_string()))
}

/// sqlite3_bind_blob - Bind blob to parameter
pub fn sqlite3_bind_blob(stmt: &mut PreparedStmt, idx: i32, value: &[u8]) -> Result<()> {
    stmt.bind(idx, Value::Blob(value.to_vec()))
}

/// sqlite3_bind_value - Bind Value to parameter
pub fn sqlite3_bind_value(stmt: &mut PreparedStmt, idx: i32, value: &Value) -> Result<()> {
    stmt.bind(idx, value.clone())
}

/// sqlite3_bind_parameter_count - Get parameter count
pub fn sqlite3_bind_parameter_count(stmt: &PreparedStmt) -> i32 {
    stmt.params.len() as i32
}

/// sqlite3_bind_parameter_name - Get parameter name
pub fn sqlite3_bind_parameter_name(stmt: &PreparedStmt, idx: i32) -> Option<&str> {
    let i = usize::try_from(idx).ok()?.checked_sub(1)?;
    stmt.param_names.get(i)?.as_deref()
}

/// sqlite3_bind_parameter_index - Get parameter index by name
pub fn sqlite3_bind_parameter_index(stmt: &PreparedStmt, name: &str) -> i32 {
    stmt.param_names
        .iter()
        .position(|n| n.as_deref() == Some(name))
        .map_or(0, |i| (i + 1) as i32)
}

/// sqlite3_clear_bindings - Clear all parameter bindings
pub fn sqlite3_clear_bindings(stmt: &mut PreparedStmt) -> Result<()> {
    stmt.clear_bindings();
    Ok(())
}

// ============================================================================
// Column Functions
// ============================================================================

/// sqlite3_column_count - Get number of result columns
pub fn sqlite3_column_count(stmt: &PreparedStmt) -> i32 {
    match &stmt.exec {
        Exec::Vm(vm) => vm.program().column_count() as i32,
        Exec::Direct(..) => 0,
    }
}

/// sqlite3_column_name - Get column name
pub fn sqlite3_column_name(stmt: &PreparedStmt, idx: i32) -> Option<&str> {
    match &stmt.exec {
        Exec::Vm(vm) => vm.program().column_name(usize::try_from(idx).ok()?),
        Exec::Direct(..) => None,
    }
}

/// sqlite3_column_type - Get column type for current row
pub fn sqlite3_column_type(stmt: &PreparedStmt, idx: i32) -> ColumnType {
    stmt.column(idx)
        .map(|v| v.column_type())
        .unwrap_or(ColumnType::Null)
}

/// sqlite3_column_int - Get column as i32
pub fn sqlite3_column_int(stmt: &PreparedStmt, idx: i32) -> i32 {
    sqlite3_column_int64(stmt, idx) as i32
}

/// sqlite3_column_int64 - Get column as i64
pub fn sqlite3_column_int64(stmt: &PreparedStmt, idx: i32) -> i64 {
    stmt.column(idx).map(|v| v.to_i64()).unwrap_or(0)
}

/// sqlite3_column_double - Get column as f64
pub fn sqlite3_column_double(stmt: &PreparedStmt, idx: i32) -> f64 {
    stmt.column(idx).map(|v| v.to_f64()).unwrap_or(0.0)
}

/// sqlite3_column_text - Get column as text
pub fn sqlite3_column_text(stmt: &PreparedStmt, idx: i32) -> String {
    stmt.column(idx).map(|v| v.to_text()).unwrap_or_default()
}

/// sqlite3_column_blob - Get column as blob
pub fn sqlite3_column_blob(stmt: &PreparedStmt, idx: i32) -> Vec<u8> {
    stmt.column(idx).map(|v| v.to_blob()).unwrap_or_default()
}

/// sqlite3_column_bytes - Get column byte length
pub fn sqlite3_column_bytes(stmt: &PreparedStmt, idx: i32) -> i32 {
    match stmt.column(idx) {
        None | Some(Value::Null) => 0,
        Some(Value::Blob(b)) => b.len() as i32,
        Some(v) => v.to_text().len() as i32,
    }
}

/// sqlite3_column_value - Get column as Value
pub fn sqlite3_column_value(stmt: &PreparedStmt, idx: i32) -> Value {
    stmt.column(idx).cloned().unwrap_or(Value::Null)
}

// ============================================================================
// Statement Info
// ============================================================================

/// sqlite3_sql - Get SQL text
pub fn sqlite3_sql(stmt: &PreparedStmt) -> &str {
    stmt.sql()
}

/// sqlite3_stmt_readonly - Check if statement is read-only
pub fn sqlite3_stmt_readonly(stmt: &PreparedStmt) -> bool {
    stmt.is_read_only()
}

/// sqlite3_stmt_isexplain - Check if EXPLAIN statement
pub fn sqlite3_stmt_isexplain(stmt: &PreparedStmt) -> bool {
    stmt.is_explain()
}

/// sqlite3_stmt_busy - Check if statement is busy
pub fn sqlite3_stmt_busy(stmt: &PreparedStmt) -> bool {
    stmt.is_busy()
}

/// sqlite3_data_count - Get number of columns with data
pub fn sqlite3_data_count(stmt: &PreparedStmt) -> i32 {
    stmt.row().map_or(0, |r| r.len() as i32)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DbConfigOption;
    use crate::api::connection::{sqlite3_changes, sqlite3_db_config, sqlite3_errmsg, sqlite3_last_insert_rowid};

    fn open() -> Box<SqliteConnection> {
        crate::api::connection::sqlite3_open(":memory:").unwrap()
    }

    fn query(conn: &mut SqliteConnection, sql: &str) -> Vec<Vec<Value>> {
        let (mut stmt, _) = sqlite3_prepare_v2(conn, sql).unwrap();
        let mut rows = Vec::new();
        while sqlite3_step(&mut stmt).unwrap() == StepResult::Row {
            let n = sqlite3_column_count(&stmt);
            rows.push((0..n).map(|i| sqlite3_column_value(&stmt, i)).collect());
        }
        rows
    }

    #[test]
    fn test_prepare_simple() {
        let mut conn = open();
        let (stmt, tail) = sqlite3_prepare_v2(&mut conn, "SELECT 1").unwrap();
        assert!(tail.is_empty());
        assert!(stmt.is_read_only());
        assert_eq!(sqlite3_column_count(&stmt), 1);
    }

    #[test]
    fn test_prepare_with_tail() {
        let mut conn = open();
        let (stmt, tail) = sqlite3_prepare_v2(&mut conn, "SELECT 1; SELECT 2").unwrap();
        assert_eq!(tail.trim(), "SELECT 2");
        assert_eq!(sqlite3_sql(&stmt), "SELECT 1;");
    }

    #[test]
    fn test_prepare_error_sets_errmsg() {
        let mut conn = open();
        assert!(sqlite3_prepare_v2(&mut conn, "SELECT * FROM missing").is_err());
        assert_eq!(sqlite3_errmsg(&conn), "no such table: missing");
        assert!(sqlite3_prepare_v2(&mut conn, "  ;  ").is_err());
    }

    #[test]
    fn test_bind_parameters() {
        let mut conn = open();
        let (mut stmt, _) = sqlite3_prepare_v2(&mut conn, "SELECT ?1, :name").unwrap();
        assert_eq!(sqlite3_bind_parameter_count(&stmt), 2);
        assert_eq!(sqlite3_bind_parameter_index(&stmt, ":name"), 2);
        assert_eq!(sqlite3_bind_parameter_name(&stmt, 2), Some(":name"));

        sqlite3_bind_int(&mut stmt, 1, 42).unwrap();
        sqlite3_bind_text(&mut stmt, 2, "hello").unwrap();
        assert_eq!(sqlite3_step(&mut stmt).unwrap(), StepResult::Row);
        assert_eq!(sqlite3_column_int(&stmt, 0), 42);
        assert_eq!(sqlite3_column_text(&stmt, 1), "hello");
        assert_eq!(sqlite3_column_bytes(&stmt, 1), 5);
    }

    #[test]
    fn test_bind_range_error() {
        let mut conn = open();
        let (mut stmt, _) = sqlite3_prepare_v2(&mut conn, "SELECT ?").unwrap();
        assert_eq!(sqlite3_bind_int(&mut stmt, 0, 42).unwrap_err().code, ErrorCode::Range);
        assert_eq!(sqlite3_bind_int(&mut stmt, 2, 42).unwrap_err().code, ErrorCode::Range);
    }

    #[test]
    fn test_reset_and_clear() {
        let mut conn = open();
        let (mut stmt, _) = sqlite3_prepare_v2(&mut conn, "SELECT ?").unwrap();
        sqlite3_bind_int(&mut stmt, 1, 7).unwrap();
        assert_eq!(sqlite3_step(&mut stmt).unwrap(), StepResult::Row);
        assert!(sqlite3_stmt_busy(&stmt));
        assert!(sqlite3_bind_int(&mut stmt, 1, 8).is_err());

        sqlite3_reset(&mut stmt).unwrap();
        assert!(!sqlite3_stmt_busy(&stmt));
        assert_eq!(sqlite3_data_count(&stmt), 0);
        sqlite3_clear_bindings(&mut stmt).unwrap();
        assert_eq!(sqlite3_step(&mut stmt).unwrap(), StepResult::Row);
        assert_eq!(sqlite3_column_type(&stmt, 0), ColumnType::Null);
    }

    #[test]
    fn test_exec_and_changes() {
        let mut conn = open();
        sqlite3_exec(&mut conn, "CREATE TABLE t(a); INSERT INTO t VALUES(1),(2),(3);").unwrap();
        assert_eq!(sqlite3_changes(&conn), 3);
        assert_eq!(sqlite3_last_insert_rowid(&conn), 3);
        sqlite3_exec(&mut conn, "SELECT * FROM t").unwrap();
        assert_eq!(sqlite3_changes(&conn), 3);
        sqlite3_exec(&mut conn, "DELETE FROM t WHERE a > 1").unwrap();
        assert_eq!(sqlite3_changes(&conn), 2);
    }

    #[test]
    fn test_schema_change_recompiles() {
        let mut conn = open();
        sqlite3_exec(&mut conn, "CREATE TABLE t(a); INSERT INTO t VALUES(1);").unwrap();
        let (mut stmt, _) = sqlite3_prepare_v2(&mut conn, "SELECT * FROM t").unwrap();
        sqlite3_exec(&mut conn, "CREATE INDEX ta ON t(a)").unwrap();
        assert_eq!(sqlite3_step(&mut stmt).unwrap(), StepResult::Row);
        assert_eq!(sqlite3_column_int64(&stmt, 0), 1);
        assert_eq!(sqlite3_step(&mut stmt).unwrap(), StepResult::Done);
    }

    #[test]
    fn test_schema_change_without_retries_fails() {
        let mut conn = open();
        sqlite3_db_config(&mut conn, DbConfigOption::MaxSchemaRetries, 0).unwrap();
        sqlite3_exec(&mut conn, "CREATE TABLE t(a)").unwrap();
        let (mut stmt, _) = sqlite3_prepare_v2(&mut conn, "SELECT * FROM t").unwrap();
        sqlite3_exec(&mut conn, "CREATE TABLE u(b)").unwrap();
        let e = sqlite3_step(&mut stmt).unwrap_err();
        assert_eq!(e.code, ErrorCode::Schema);
        assert_eq!(sqlite3_errmsg(&conn), "database schema has changed");
    }

    #[test]
    fn test_explain_rows() {
        let mut conn = open();
        let (stmt, _) = sqlite3_prepare_v2(&mut conn, "EXPLAIN SELECT 1").unwrap();
        assert!(sqlite3_stmt_isexplain(&stmt));
        assert_eq!(sqlite3_column_name(&stmt, 1), Some("opcode"));
        sqlite3_finalize(stmt).unwrap();
        let rows = query(&mut conn, "EXPLAIN SELECT 1");
        assert_eq!(rows[0][1], Value::Text("Init".to_string()));
    }
}
