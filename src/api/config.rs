//! Per-connection configuration (sqlite3_db_config)
//!
//! Feature switches read by the code generators when a statement is
//! compiled, plus the optimization mask used to turn individual rewrites
//! and strategies off for testing.

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};

// ============================================================================
// Optimizations
// ============================================================================

bitflags! {
    /// Rewrites and strategies the compiler may use (all on by default)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Optimizations: u32 {
        /// Flatten FROM-clause subqueries into the outer query
        const QUERY_FLATTENER = 0x0001;
        /// Substitute `col = constant` into the rest of WHERE
        const PROPAGATE_CONST = 0x0002;
        /// Push outer WHERE terms into FROM-clause subqueries
        const PUSH_DOWN = 0x0004;
        /// Move HAVING terms on GROUP BY expressions into WHERE
        const HAVING_TO_WHERE = 0x0008;
        /// INSERT INTO t1 SELECT * FROM t2 record transfer
        const TRANSFER = 0x0010;
        /// Satisfy GROUP BY with an index scan
        const GROUPBY_INDEX = 0x0020;
        /// Satisfy ORDER BY with an index scan
        const ORDERBY_INDEX = 0x0040;
        /// min()/max() answered from the first index entry
        const MINMAX = 0x0080;
        /// UPDATE/DELETE rewrite rows during the scan
        const ONEPASS = 0x0100;
        /// Turn a LEFT JOIN into an inner join when WHERE rejects NULLs
        const LEFT_JOIN_REDUCE = 0x0200;
        /// Run FROM-clause subqueries and INSERT sources as coroutines
        const COROUTINES = 0x0400;
        /// Cheaper DISTINCT for ordered input
        const DISTINCT_OPT = 0x0800;
    }
}

impl Default for Optimizations {
    fn default() -> Self {
        Optimizations::all()
    }
}

// ============================================================================
// Connection Configuration
// ============================================================================

/// Options accepted by `sqlite3_db_config`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DbConfigOption {
    /// SQLITE_DBCONFIG_ENABLE_FKEY
    EnableFkey = 1002,
    /// SQLITE_DBCONFIG_ENABLE_TRIGGER
    EnableTrigger = 1003,
    /// PRAGMA recursive_triggers
    RecursiveTriggers = 2001,
    /// Recompile attempts after a schema change
    MaxSchemaRetries = 2002,
    /// Nesting limit for trigger programs
    MaxTriggerDepth = 2003,
}

impl DbConfigOption {
    pub fn from_i32(code: i32) -> Option<DbConfigOption> {
        Some(match code {
            1002 => DbConfigOption::EnableFkey,
            1003 => DbConfigOption::EnableTrigger,
            2001 => DbConfigOption::RecursiveTriggers,
            2002 => DbConfigOption::MaxSchemaRetries,
            2003 => DbConfigOption::MaxTriggerDepth,
            _ => return None,
        })
    }
}

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Enforce FOREIGN KEY constraints
    pub foreign_keys: bool,
    /// A trigger may fire itself, directly or through other triggers
    pub recursive_triggers: bool,
    /// Fire triggers at all
    pub triggers_enabled: bool,
    /// Times a statement is recompiled in a row before SQLITE_SCHEMA surfaces
    pub max_schema_retries: u32,
    pub max_trigger_depth: usize,
    pub optimizations: Optimizations,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            foreign_keys: false,
            recursive_triggers: false,
            triggers_enabled: true,
            max_schema_retries: 1,
            max_trigger_depth: 1000,
            optimizations: Optimizations::default(),
        }
    }
}

impl DbConfig {
    /// Whether optimization `opt` is enabled
    pub fn enabled(&self, opt: Optimizations) -> bool {
        self.optimizations.contains(opt)
    }

    /// Apply one option; returns the new value
    pub fn set(&mut self, option: DbConfigOption, value: i64) -> Result<i64> {
        if value < 0 {
            return Err(Error::with_message(ErrorCode::Misuse, "negative configuration value"));
        }
        match option {
            DbConfigOption::EnableFkey => self.foreign_keys = value != 0,
            DbConfigOption::EnableTrigger => self.triggers_enabled = value != 0,
            DbConfigOption::RecursiveTriggers => self.recursive_triggers = value != 0,
            DbConfigOption::MaxSchemaRetries => self.max_schema_retries = value.min(u32::MAX as i64) as u32,
            DbConfigOption::MaxTriggerDepth => self.max_trigger_depth = value.max(1) as usize,
        }
        Ok(self.get(option))
    }

    pub fn get(&self, option: DbConfigOption) -> i64 {
        match option {
            DbConfigOption::EnableFkey => self.foreign_keys as i64,
            DbConfigOption::EnableTrigger => self.triggers_enabled as i64,
            DbConfigOption::RecursiveTriggers => self.recursive_triggers as i64,
            DbConfigOption::MaxSchemaRetries => self.max_schema_retries as i64,
            DbConfigOption::MaxTriggerDepth => self.max_trigger_depth as i64,
        }
    }

    /// Enable or disable a set of optimizations
    pub fn set_optimizations(&mut self, opts: Optimizations, enabled: bool) {
        self.optimizations.set(opts, enabled);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = DbConfig::default();
        assert!(!c.foreign_keys);
        assert!(!c.recursive_triggers);
        assert!(c.triggers_enabled);
        assert_eq!(c.max_schema_retries, 1);
        assert_eq!(c.max_trigger_depth, 1000);
        assert!(c.enabled(Optimizations::QUERY_FLATTENER | Optimizations::ONEPASS));
    }

    #[test]
    fn test_set_and_get() {
        let mut c = DbConfig::default();
        assert_eq!(c.set(DbConfigOption::EnableFkey, 1).unwrap(), 1);
        assert!(c.foreign_keys);
        c.set(DbConfigOption::MaxTriggerDepth, 0).unwrap();
        assert_eq!(c.max_trigger_depth, 1);
        assert!(c.set(DbConfigOption::MaxSchemaRetries, -1).is_err());
        assert_eq!(DbConfigOption::from_i32(1003), Some(DbConfigOption::EnableTrigger));
    }

    #[test]
    fn test_toggle_optimizations() {
        let mut c = DbConfig::default();
        c.set_optimizations(Optimizations::QUERY_FLATTENER | Optimizations::PUSH_DOWN, false);
        assert!(!c.enabled(Optimizations::QUERY_FLATTENER));
        assert!(!c.enabled(Optimizations::PUSH_DOWN));
        assert!(c.enabled(Optimizations::MINMAX));
        c.set_optimizations(Optimizations::all(), true);
        assert_eq!(c.optimizations, Optimizations::all());
    }
}
