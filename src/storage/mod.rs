//! Storage layer
//!
//! The database proper: a set of in-memory B-trees plus the schema that
//! describes them. Transactions are snapshot based. BEGIN records a copy
//! of both, each write statement records its own copy, and rolling back
//! means restoring one of them.

pub mod btree;

use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::schema::Schema;

pub use btree::{Btree, IndexTree, Tree};

/// Saved database image
#[derive(Debug, Clone)]
pub struct Snapshot {
    btree: Btree,
    schema: Schema,
}

/// An open database
#[derive(Debug, Default)]
pub struct Database {
    pub btree: Btree,
    pub schema: Schema,
    /// Image at BEGIN; `None` in autocommit mode
    txn: Option<Snapshot>,
}

impl Database {
    pub fn new() -> Self {
        Database {
            btree: Btree::new(),
            schema: Schema::new(),
            txn: None,
        }
    }

    pub fn autocommit(&self) -> bool {
        self.txn.is_none()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            btree: self.btree.clone(),
            schema: self.schema.clone(),
        }
    }

    pub fn restore(&mut self, snap: Snapshot) {
        self.btree = snap.btree;
        self.schema = snap.schema;
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::sql("cannot start a transaction within a transaction"));
        }
        debug!("begin transaction");
        self.txn = Some(self.snapshot());
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.txn.take().is_none() {
            return Err(Error::sql("cannot commit - no transaction is active"));
        }
        debug!("commit transaction");
        Ok(())
    }

    /// Undo everything since BEGIN and return to autocommit
    pub fn rollback(&mut self) -> Result<()> {
        match self.txn.take() {
            Some(snap) => {
                debug!("rollback transaction");
                self.restore(snap);
                Ok(())
            }
            None => Err(Error::sql("cannot rollback - no transaction is active")),
        }
    }

    /// Undo the open transaction if there is one (used by ROLLBACK halts)
    pub fn rollback_if_active(&mut self) -> bool {
        match self.txn.take() {
            Some(snap) => {
                self.restore(snap);
                true
            }
            None => false,
        }
    }

    /// Fail with `Schema` unless the live cookie matches `expected`
    pub fn verify_cookie(&self, expected: u32) -> Result<()> {
        if self.schema.cookie != expected {
            return Err(Error::with_message(ErrorCode::Schema, "database schema has changed"));
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
    fn test_rollback_restores_trees_and_schema() {
        let mut db = Database::new();
        db.begin().unwrap();
        let root = db.schema.alloc_root();
        db.btree.create_table(root);
        db.schema.bump_cookie();
        db.rollback().unwrap();
        assert!(!db.btree.exists(root));
        assert_eq!(db.schema.cookie, 0);
        assert!(db.autocommit());
    }

    #[test]
    fn test_nested_begin_fails() {
        let mut db = Database::new();
        db.begin().unwrap();
        assert!(db.begin().is_err());
        db.commit().unwrap();
        assert!(db.commit().is_err());
    }

    #[test]
    fn test_cookie_mismatch() {
        let mut db = Database::new();
        db.schema.bump_cookie();
        assert_eq!(db.verify_cookie(0).unwrap_err().code, ErrorCode::Schema);
        assert!(db.verify_cookie(1).is_ok());
    }
}
