//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::sync::Once;

use sqlcore::{
    sqlite3_column_count, sqlite3_column_value, sqlite3_exec, sqlite3_finalize, sqlite3_open,
    sqlite3_prepare_v2, sqlite3_step, Result, SqliteConnection, StepResult, Value,
};

static INIT: Once = Once::new();

/// Install a subscriber once; `RUST_LOG=sqlcore=trace` shows every program
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn open() -> Box<SqliteConnection> {
    init();
    sqlite3_open(":memory:").expect("open in-memory database")
}

pub fn exec(conn: &mut SqliteConnection, sql: &str) -> Result<()> {
    sqlite3_exec(conn, sql)
}

/// Rows of the first statement in `sql`
pub fn query(conn: &mut SqliteConnection, sql: &str) -> Result<Vec<Vec<Value>>> {
    let (mut stmt, _tail) = sqlite3_prepare_v2(conn, sql)?;
    let n = sqlite3_column_count(&stmt);
    let mut rows = Vec::new();
    loop {
        match sqlite3_step(&mut stmt) {
            Ok(StepResult::Row) => rows.push((0..n).map(|i| sqlite3_column_value(&stmt, i)).collect()),
            Ok(StepResult::Done) => break,
            Err(e) => {
                let _ = sqlite3_finalize(stmt);
                return Err(e);
            }
        }
    }
    sqlite3_finalize(stmt)?;
    Ok(rows)
}

pub fn int(v: i64) -> Value {
    Value::Integer(v)
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// Single-column integer results
pub fn ints(rows: &[Vec<Value>]) -> Vec<i64> {
    rows.iter()
        .map(|r| match r.first() {
            Some(Value::Integer(i)) => *i,
            other => panic!("expected an integer, got {:?}", other),
        })
        .collect()
}
