//! Row trigger compilation
//!
//! A trigger body is compiled into a subprogram of the statement's
//! program the first time a statement needs it, once per conflict
//! policy it can run under. The firing site passes the OLD/NEW row images
//! by register: `Program` records the base of the pair and the body reads
//! a value with `Param`. A `RAISE(IGNORE)` inside the body resumes the
//! caller at the label given to the `Program` instruction.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::resolve::Clause;
use crate::executor::{Parse, SelectDest, TriggerCtx};
use crate::parser::ast::{ConflictAction, Stmt, TriggerEvent, TriggerTiming};
use crate::schema::{Table, Trigger};
use crate::vdbe::{Label, Opcode, SubProgram, P4};

/// Row change a trigger can fire on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEvent {
    Insert,
    Update,
    Delete,
}

impl RowEvent {
    fn matches(self, event: &TriggerEvent) -> bool {
        matches!(
            (self, event),
            (RowEvent::Insert, TriggerEvent::Insert)
                | (RowEvent::Delete, TriggerEvent::Delete)
                | (RowEvent::Update, TriggerEvent::Update(_))
        )
    }

    /// Which of NEW and OLD a body firing on this event may read
    fn visible_rows(self) -> (bool, bool) {
        match self {
            RowEvent::Insert => (true, false),
            RowEvent::Update => (true, true),
            RowEvent::Delete => (false, true),
        }
    }
}

fn event_of(trigger: &Trigger) -> RowEvent {
    match trigger.event {
        TriggerEvent::Insert => RowEvent::Insert,
        TriggerEvent::Update(_) => RowEvent::Update,
        TriggerEvent::Delete => RowEvent::Delete,
    }
}

impl<'a> Parse<'a> {
    /// Triggers on `table` that fire for `event`, any timing
    ///
    /// For UPDATE, `changed` holds the assigned columns; an `UPDATE OF`
    /// trigger fires only when one of its columns is among them.
    pub fn triggers_for(&self, table: &Table, event: RowEvent, changed: Option<&[bool]>) -> Vec<Arc<Trigger>> {
        if !self.config.triggers_enabled || table.ephemeral {
            return Vec::new();
        }
        self.schema
            .triggers_on(&table.name)
            .into_iter()
            .filter(|t| event.matches(&t.event))
            .filter(|t| match (event, changed) {
                (RowEvent::Update, Some(changed)) => t.fires_on_update(table, changed),
                _ => true,
            })
            .collect()
    }

    /// Fire the triggers of `triggers` with the given timing
    ///
    /// `base` is the OLD image of the row pair (see `alloc_row_images`).
    pub fn code_row_triggers(
        &mut self,
        triggers: &[Arc<Trigger>],
        timing: TriggerTiming,
        table: &Arc<Table>,
        base: i32,
        conflict: Option<ConflictAction>,
        ignore: Label,
    ) -> Result<()> {
        for trigger in triggers.iter().filter(|t| t.timing == timing) {
            let idx = self.trigger_program(trigger, table, conflict)?;
            self.v
                .add_op4(Opcode::Program, base, ignore.value(), 0, P4::Subprogram(idx));
            self.v.change_p5(u16::from(!self.config.recursive_triggers));
            self.v.comment(format!("trigger {}", trigger.name));
        }
        Ok(())
    }

    /// Subprogram index of `trigger` compiled for `conflict`
    pub(crate) fn trigger_program(
        &mut self,
        trigger: &Trigger,
        table: &Arc<Table>,
        conflict: Option<ConflictAction>,
    ) -> Result<usize> {
        let key = (trigger.name.to_ascii_lowercase(), conflict.map_or(0, |c| c.code()));
        if let Some(&idx) = self.top.borrow().trigger_cache.get(&key) {
            return Ok(idx);
        }
        // Reserve the slot first so a body that fires itself finds it
        let idx = {
            let mut top = self.top.borrow_mut();
            top.subprograms.push(SubProgram {
                name: trigger.name.clone(),
                ..Default::default()
            });
            let idx = top.subprograms.len() - 1;
            top.trigger_cache.insert(key, idx);
            idx
        };
        debug!(trigger = %trigger.name, depth = self.nested + 1, ?conflict, "compile trigger program");

        let (new, old) = event_of(trigger).visible_rows();
        let mut sub = self.nested(TriggerCtx {
            table: table.clone(),
            new,
            old,
        });
        let end = sub.v.make_label();
        if let Some(when) = &trigger.when {
            let mut when = when.clone();
            sub.resolve_expr(&mut when, Clause::Other)?;
            sub.expr_if_false(&when, end, true)?;
        }
        for step in &trigger.body {
            sub.code_trigger_step(step, conflict)?;
        }
        sub.v.resolve_label(end);
        let program = sub.finish_subprogram(&trigger.name)?;
        self.top.borrow_mut().subprograms[idx] = program;
        Ok(idx)
    }

    /// One statement of a trigger body; a policy given to the firing
    /// statement overrides the step's own OR clause
    fn code_trigger_step(&mut self, step: &Stmt, conflict: Option<ConflictAction>) -> Result<()> {
        match step {
            Stmt::Insert(stmt) => {
                let mut stmt = (**stmt).clone();
                if conflict.is_some() {
                    stmt.or_conflict = conflict;
                }
                self.code_insert(&stmt)
            }
            Stmt::Update(stmt) => {
                let mut stmt = (**stmt).clone();
                if conflict.is_some() {
                    stmt.or_conflict = conflict;
                }
                self.code_update(&stmt)
            }
            Stmt::Delete(stmt) => self.code_delete(stmt),
            Stmt::Select(sel) => {
                let mut sel = (**sel).clone();
                self.prepare_select(&mut sel)?;
                self.code_select(&sel, SelectDest::Discard)
            }
            _ => Err(Error::sql("only INSERT, UPDATE, DELETE and SELECT may appear in a trigger")),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::api::config::{DbConfig, DbConfigOption};
    use crate::executor::testing::{exec, program};
    use crate::storage::Database;
    use crate::types::Value;
    use crate::vdbe::Opcode;

    fn setup(config: &DbConfig, sql: &str) -> Database {
        let mut db = Database::new();
        exec(&mut db, config, sql).unwrap();
        db
    }

    fn ints(rows: Vec<Vec<Value>>) -> Vec<i64> {
        rows.into_iter()
            .map(|r| match r[0] {
                Value::Integer(i) => i,
                _ => panic!("not an integer"),
            })
            .collect()
    }

    #[test]
    fn test_after_insert_trigger_logs_row() {
        let c = DbConfig::default();
        let mut db = setup(
            &c,
            "CREATE TABLE t(a); CREATE TABLE log(x);
             CREATE TRIGGER tr AFTER INSERT ON t BEGIN INSERT INTO log VALUES(new.a * 10); END;",
        );
        exec(&mut db, &c, "INSERT INTO t VALUES(1), (2)").unwrap();
        assert_eq!(ints(exec(&mut db, &c, "SELECT x FROM log ORDER BY x").unwrap()), vec![10, 20]);
    }

    #[test]
    fn test_when_clause_filters() {
        let c = DbConfig::default();
        let mut db = setup(
            &c,
            "CREATE TABLE t(a); CREATE TABLE log(x);
             CREATE TRIGGER tr AFTER INSERT ON t WHEN new.a > 1 BEGIN INSERT INTO log VALUES(new.a); END;",
        );
        exec(&mut db, &c, "INSERT INTO t VALUES(1), (2), (3)").unwrap();
        assert_eq!(ints(exec(&mut db, &c, "SELECT x FROM log ORDER BY x").unwrap()), vec![2, 3]);
    }

    #[test]
    fn test_raise_ignore_skips_row() {
        let c = DbConfig::default();
        let mut db = setup(
            &c,
            "CREATE TABLE t(a);
             CREATE TRIGGER tr BEFORE INSERT ON t WHEN new.a < 0 BEGIN SELECT RAISE(IGNORE); END;",
        );
        exec(&mut db, &c, "INSERT INTO t VALUES(-1), (5)").unwrap();
        assert_eq!(ints(exec(&mut db, &c, "SELECT a FROM t").unwrap()), vec![5]);
    }

    #[test]
    fn test_raise_abort_message() {
        let c = DbConfig::default();
        let mut db = setup(
            &c,
            "CREATE TABLE t(a);
             CREATE TRIGGER tr BEFORE DELETE ON t BEGIN SELECT RAISE(ABORT, 'no deletes'); END;
             INSERT INTO t VALUES(1);",
        );
        let e = exec(&mut db, &c, "DELETE FROM t").unwrap_err();
        assert_eq!(e.to_string(), "no deletes");
        assert_eq!(ints(exec(&mut db, &c, "SELECT a FROM t").unwrap()), vec![1]);
    }

    #[test]
    fn test_update_of_column_list() {
        let c = DbConfig::default();
        let mut db = setup(
            &c,
            "CREATE TABLE t(a, b); CREATE TABLE log(x);
             CREATE TRIGGER tr AFTER UPDATE OF b ON t BEGIN INSERT INTO log VALUES(old.b); END;
             INSERT INTO t VALUES(1, 2);",
        );
        exec(&mut db, &c, "UPDATE t SET a = 5").unwrap();
        assert!(exec(&mut db, &c, "SELECT x FROM log").unwrap().is_empty());
        exec(&mut db, &c, "UPDATE t SET b = 7").unwrap();
        assert_eq!(ints(exec(&mut db, &c, "SELECT x FROM log").unwrap()), vec![2]);
    }

    #[test]
    fn test_program_shared_between_firing_sites() {
        let c = DbConfig::default();
        let db = setup(
            &c,
            "CREATE TABLE t(a); CREATE TABLE log(x);
             CREATE TRIGGER tr AFTER INSERT ON t BEGIN INSERT INTO log VALUES(new.a); END;",
        );
        let p = program(&db, &c, "INSERT INTO t SELECT a FROM t").unwrap();
        assert_eq!(p.subprograms.len(), 1);
        assert!(p.ops.iter().any(|o| o.opcode == Opcode::Program));
    }

    #[test]
    fn test_recursion_needs_recursive_triggers() {
        let sql = "CREATE TABLE t(a);
                   CREATE TRIGGER tr AFTER INSERT ON t WHEN new.a < 3 BEGIN INSERT INTO t VALUES(new.a + 1); END;";
        let plain = DbConfig::default();
        let mut db = setup(&plain, sql);
        exec(&mut db, &plain, "INSERT INTO t VALUES(1)").unwrap();
        assert_eq!(ints(exec(&mut db, &plain, "SELECT a FROM t ORDER BY a").unwrap()), vec![1, 2]);

        let mut recursive = DbConfig::default();
        recursive.set(DbConfigOption::RecursiveTriggers, 1).unwrap();
        let mut db = setup(&recursive, sql);
        exec(&mut db, &recursive, "INSERT INTO t VALUES(1)").unwrap();
        assert_eq!(ints(exec(&mut db, &recursive, "SELECT a FROM t ORDER BY a").unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_disabled_triggers_do_not_fire() {
        let mut c = DbConfig::default();
        let mut db = setup(
            &c,
            "CREATE TABLE t(a); CREATE TABLE log(x);
             CREATE TRIGGER tr AFTER INSERT ON t BEGIN INSERT INTO log VALUES(1); END;",
        );
        c.set(DbConfigOption::EnableTrigger, 0).unwrap();
        exec(&mut db, &c, "INSERT INTO t VALUES(1)").unwrap();
        assert!(exec(&mut db, &c, "SELECT x FROM log").unwrap().is_empty());
    }
}
