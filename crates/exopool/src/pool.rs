//! # Execution Unit Pool
//!
//! The set of live units and the tasks each one holds.
//!
//! The pool itself never spawns or awaits anything. [`Pool::assign`] answers
//! "which unit runs this task", and when the answer is [`Assignment::Grow`]
//! the dispatcher spawns a unit and hands it back through [`Pool::insert`].
//!
//! ## Invariants
//! - **Bounded**: never more than `max_units` records.
//! - **Warm first**: an idle unit is reused before a new one is created.
//! - **Referenced iff busy**: a unit is marked referenced exactly while its
//!   active set is non-empty.
//! - **Busy units survive**: the sweep only removes units with no active tasks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use exowire::TaskId;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::unit::ExecutionUnit;
use crate::unit::UnitId;

/// A snapshot of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub units: usize,
    pub busy: usize,
    pub idle: usize,
    pub active_tasks: usize,
    pub max_units: usize,
}

/// Where a task goes.
pub enum Assignment {
    /// An idle unit was reused.
    Idle(Arc<dyn ExecutionUnit>),
    /// The pool has room: spawn a unit and `insert` it.
    Grow,
    /// The pool is full: the task shares a busy unit.
    Shared(Arc<dyn ExecutionUnit>),
}

struct PoolRecord {
    unit: Arc<dyn ExecutionUnit>,
    active: HashSet<TaskId>,
    last_access: Instant,
}

impl PoolRecord {
    fn attach(&mut self, task: TaskId, now: Instant) {
        if self.active.is_empty() {
            self.unit.set_referenced(true);
        }
        self.active.insert(task);
        self.last_access = now;
    }
}

pub struct Pool {
    max_units: usize,
    records: Vec<PoolRecord>,
}

impl Pool {
    pub fn new(max_units: usize) -> Self {
        Self {
            max_units: max_units.max(1),
            records: Vec::new(),
        }
    }

    /// Chooses a unit for `task` and records the assignment.
    ///
    /// On [`Assignment::Grow`] nothing is recorded until [`Pool::insert`].
    pub fn assign(&mut self, task: TaskId, now: Instant) -> Assignment {
        if let Some(record) = self.records.iter_mut().find(|r| r.active.is_empty()) {
            record.attach(task, now);
            trace!(task = %task, unit = %record.unit.id(), "reusing idle unit");
            return Assignment::Idle(record.unit.clone());
        }

        if self.records.len() < self.max_units {
            return Assignment::Grow;
        }

        let index = (task.0 % self.records.len() as u64) as usize;
        let record = &mut self.records[index];
        record.attach(task, now);
        trace!(task = %task, unit = %record.unit.id(), "pool saturated, sharing unit");
        Assignment::Shared(record.unit.clone())
    }

    /// Adds a freshly spawned unit that runs `task`.
    pub fn insert(&mut self, unit: Arc<dyn ExecutionUnit>, task: TaskId, now: Instant) {
        debug!(unit = %unit.id(), units = self.records.len() + 1, "unit added to pool");
        let mut record = PoolRecord {
            unit,
            active: HashSet::new(),
            last_access: now,
        };
        record.attach(task, now);
        self.records.push(record);
    }

    /// Detaches `task` from `unit`. Returns `false` if it was not attached.
    pub fn release(&mut self, unit: UnitId, task: TaskId, now: Instant) -> bool {
        let Some(record) = self.records.iter_mut().find(|r| r.unit.id() == unit) else {
            return false;
        };
        if !record.active.remove(&task) {
            return false;
        }
        if record.active.is_empty() {
            record.unit.set_referenced(false);
            record.last_access = now;
        }
        true
    }

    /// Removes `unit`'s record, returning the unit and the tasks it held.
    pub fn remove(&mut self, unit: UnitId) -> Option<(Arc<dyn ExecutionUnit>, Vec<TaskId>)> {
        let index = self.records.iter().position(|r| r.unit.id() == unit)?;
        let record = self.records.remove(index);
        Some((record.unit, record.active.into_iter().collect()))
    }

    /// Removes every idle record unused for at least `idle_timeout`.
    pub fn sweep(&mut self, now: Instant, idle_timeout: Duration) -> Vec<Arc<dyn ExecutionUnit>> {
        let mut expired = Vec::new();
        self.records.retain(|record| {
            let keep = !record.active.is_empty()
                || now.duration_since(record.last_access) < idle_timeout;
            if !keep {
                expired.push(record.unit.clone());
            }
            keep
        });
        expired
    }

    /// Empties the pool.
    pub fn drain(&mut self) -> Vec<(Arc<dyn ExecutionUnit>, Vec<TaskId>)> {
        self.records
            .drain(..)
            .map(|record| (record.unit, record.active.into_iter().collect()))
            .collect()
    }

    pub fn unit(&self, id: UnitId) -> Option<Arc<dyn ExecutionUnit>> {
        self.records.iter().find(|r| r.unit.id() == id).map(|r| r.unit.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        let busy = self.records.iter().filter(|r| !r.active.is_empty()).count();
        PoolStats {
            units: self.records.len(),
            busy,
            idle: self.records.len() - busy,
            active_tasks: self.records.iter().map(|r| r.active.len()).sum(),
            max_units: self.max_units,
        }
    }
}
