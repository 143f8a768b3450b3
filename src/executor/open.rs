//! Opening a table together with its indexes
//!
//! Every write path (INSERT, UPDATE, DELETE, the REPLACE delete and the
//! foreign key actions) needs the table cursor plus one cursor per index.
//! Index `i` of `table.indexes` always lives at `first_index_cursor + i`,
//! so the constraint checker and the row emitters can address an index by
//! its position alone.

use std::sync::Arc;

use tracing::trace;

use crate::executor::{CursorSource, Parse};
use crate::schema::build::index_key_info;
use crate::schema::Table;
use crate::vdbe::{Opcode, P4};

/// Cursors handed out by [`Parse::open_table_and_indices`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedCursors {
    /// Cursor the table's rows are read through; for a WITHOUT ROWID
    /// table this is the PRIMARY KEY index cursor
    pub data: i32,
    /// Cursor of `table.indexes[0]`
    pub first_index: i32,
    /// Number of indexes considered
    pub n_index: usize,
}

impl OpenedCursors {
    pub fn index(&self, i: usize) -> i32 {
        self.first_index + i as i32
    }
}

impl<'a> Parse<'a> {
    /// Open `table` and its indexes with `OpenRead` or `OpenWrite`.
    ///
    /// `base` is the cursor number for the table itself; one is allocated
    /// when it is `None`. `wanted[0]` selects the table and `wanted[i + 1]`
    /// index `i`; without a mask everything is opened. Cursor numbers are
    /// reserved for unopened indexes too.
    pub fn open_table_and_indices(
        &mut self,
        table: &Arc<Table>,
        op: Opcode,
        base: Option<i32>,
        wanted: Option<&[bool]>,
    ) -> OpenedCursors {
        let is_wanted = |i: usize| wanted.map_or(true, |m| m.get(i).copied().unwrap_or(false));
        let base = base.unwrap_or_else(|| self.alloc_cursor());
        if op == Opcode::OpenWrite {
            self.set_writes();
        }

        if table.has_rowid() && is_wanted(0) {
            self.v.add_op2(op, base, table.root as i32);
            self.v.comment(table.name.clone());
        }

        let first_index = self.v.n_cursor();
        let mut data = base;
        for (i, index) in table.indexes.iter().enumerate() {
            let cursor = self.alloc_cursor();
            let is_pk = index.is_primary_key() && table.without_rowid;
            if is_pk {
                data = cursor;
            }
            if is_wanted(i + 1) || (is_pk && is_wanted(0)) {
                let key_info = Arc::new(index_key_info(index));
                self.v
                    .add_op4(op, cursor, index.root as i32, 0, P4::KeyInfo(key_info));
                self.v.comment(index.name.clone());
            }
        }
        self.sources.insert(data, CursorSource::Table(table.clone()));
        trace!(table = %table.name, data, first_index, n = table.indexes.len(), "open table and indices");
        OpenedCursors {
            data,
            first_index,
            n_index: table.indexes.len(),
        }
    }

    /// Close the cursors opened by `open_table_and_indices`
    pub fn close_table_and_indices(&mut self, table: &Table, cursors: OpenedCursors, base: i32) {
        if table.has_rowid() {
            self.v.add_op1(Opcode::Close, base);
        }
        for i in 0..cursors.n_index {
            self.v.add_op1(Opcode::Close, cursors.index(i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DbConfig;
    use crate::parser::ast::Stmt;
    use crate::parser::parse;
    use crate::storage::Database;

    fn db_with(sql: &str) -> Database {
        let mut db = Database::new();
        for stmt in parse(sql).unwrap() {
            match stmt {
                Stmt::CreateTable(ct) => {
                    crate::schema::build::create_table(&mut db, &ct).unwrap();
                }
                Stmt::CreateIndex(ci) => {
                    crate::schema::build::create_index(&mut db, &ci).unwrap();
                }
                other => panic!("unexpected statement {:?}", other),
            }
        }
        db
    }

    #[test]
    fn test_index_cursors_are_consecutive() {
        let db = db_with("CREATE TABLE t(a, b UNIQUE, c); CREATE INDEX tc ON t(c);");
        let config = DbConfig::default();
        let mut p = Parse::new(&db.schema, &config);
        let t = db.schema.require_table("t").unwrap();
        let c = p.open_table_and_indices(&t, Opcode::OpenWrite, None, None);
        assert_eq!(c.data, 0);
        assert_eq!(c.first_index, 1);
        assert_eq!(c.n_index, 2);
        assert_eq!(c.index(1), 2);
    }

    #[test]
    fn test_without_rowid_uses_pk_cursor() {
        let db = db_with("CREATE TABLE w(k TEXT PRIMARY KEY, v) WITHOUT ROWID;");
        let config = DbConfig::default();
        let mut p = Parse::new(&db.schema, &config);
        let t = db.schema.require_table("w").unwrap();
        let c = p.open_table_and_indices(&t, Opcode::OpenRead, None, None);
        assert_eq!(c.data, c.first_index);
        assert!(matches!(p.sources.get(&c.data), Some(CursorSource::Table(_))));
    }

    #[test]
    fn test_mask_skips_unwanted_indexes() {
        let db = db_with("CREATE TABLE t(a UNIQUE, b UNIQUE);");
        let config = DbConfig::default();
        let mut p = Parse::new(&db.schema, &config);
        let t = db.schema.require_table("t").unwrap();
        let before = p.v.current_addr();
        let c = p.open_table_and_indices(&t, Opcode::OpenRead, None, Some(&[true, false, true]));
        let opened: Vec<i32> = (before..p.v.current_addr())
            .filter_map(|a| p.v.op_at(a))
            .filter(|op| op.opcode == Opcode::OpenRead)
            .map(|op| op.p1)
            .collect();
        assert_eq!(opened, vec![c.data, c.index(1)]);
    }
}
