//! # Identifiers
//!
//! Strong types for the ids that appear on the wire, and their allocators.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Task ids wrap back to 1 once they would exceed this value.
pub const TASK_ID_CEILING: u64 = (1 << 31) - 1;

/// Strong type for task identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Strong type for relayed channel identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// Monotonic task id allocator.
///
/// Ids start at 1, wrap at [`TASK_ID_CEILING`], and never hand out an id the
/// caller reports as still in use.
#[derive(Debug)]
pub struct TaskIds {
    next: AtomicU64,
}

impl TaskIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Starts allocation at `first` (clamped into `1..=TASK_ID_CEILING`).
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.clamp(1, TASK_ID_CEILING)),
        }
    }

    /// Allocates the next id for which `in_use` returns false.
    pub fn allocate(&self, in_use: impl Fn(TaskId) -> bool) -> TaskId {
        loop {
            let raw = self
                .next
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(if n >= TASK_ID_CEILING { 1 } else { n + 1 })
                })
                .unwrap_or(1);
            let id = TaskId(raw);
            if !in_use(id) {
                return id;
            }
        }
    }
}

impl Default for TaskIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator for channel ids. Channel ids are never reused.
#[derive(Debug)]
pub struct ChannelIds {
    next: AtomicU64,
}

impl ChannelIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> ChannelId {
        ChannelId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ChannelIds {
    fn default() -> Self {
        Self::new()
    }
}
