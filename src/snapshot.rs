// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Immutable per-CPU runqueue snapshots.
//!
//! Every transition either hands back the very same `Rc` (nothing changed)
//! or allocates a new snapshot. Time slices share snapshots of CPUs that did
//! not change, so callers detect no-ops with `Rc::ptr_eq`.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::event::RunqueueEvent;
use crate::types::{Pid, TaskState};

/// Tasks queued on one CPU, in the order they were queued, together with
/// the transition that produced this exact set.
#[derive(Debug)]
pub struct RunqueueSnapshot {
    tasks: Vec<Pid>,
    // Re-queueing an already queued task only retags the snapshot.
    event: Cell<RunqueueEvent>,
}

impl RunqueueSnapshot {
    /// Initial state of a CPU: only the idle task.
    pub fn new() -> Rc<Self> {
        Self::with_tasks(vec![Pid::IDLE], RunqueueEvent::Unknown)
    }

    fn with_tasks(tasks: Vec<Pid>, event: RunqueueEvent) -> Rc<Self> {
        Rc::new(Self {
            tasks,
            event: Cell::new(event),
        })
    }

    pub fn tasks(&self) -> &[Pid] {
        &self.tasks
    }

    pub fn event(&self) -> RunqueueEvent {
        self.event.get()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.tasks.contains(&pid)
    }

    /// Number of queued tasks, not counting idle.
    pub fn load(&self) -> usize {
        self.tasks.len().saturating_sub(1)
    }

    /// Applies a context switch from `prev` to `next`.
    ///
    /// A runnable `prev` stays queued; any other state takes it off the
    /// runqueue. `next` is always queued afterwards. The idle task never
    /// leaves the runqueue whatever state the trace reports for it.
    pub fn sched_switch(self: &Rc<Self>, prev: Pid, prev_state: TaskState, next: Pid) -> Rc<Self> {
        let runnable = prev_state.is_runnable() || prev.is_idle();

        if runnable && self.contains(prev) && self.contains(next) {
            return Rc::clone(self);
        }

        let mut event = RunqueueEvent::Unknown;
        if !runnable {
            event = RunqueueEvent::Sleep(prev);
        }

        let mut tasks = self.tasks.clone();
        if self.contains(prev) {
            if !runnable {
                tasks.retain(|&t| t != prev);
            }
        } else if runnable {
            debug!(
                "runnable task {} switched out but was not queued, re-adding",
                prev
            );
            tasks.push(prev);
        }

        if !tasks.contains(&next) {
            tasks.push(next);
        }

        Self::with_tasks(tasks, event)
    }

    /// Removes `pid` for a migration away from this CPU.
    pub fn migrate_out(self: &Rc<Self>, pid: Pid) -> Rc<Self> {
        if pid.is_idle() || !self.contains(pid) {
            return Rc::clone(self);
        }
        let tasks = self.tasks.iter().copied().filter(|&t| t != pid).collect();
        Self::with_tasks(tasks, RunqueueEvent::MigrateOut(pid))
    }

    fn enqueue(self: &Rc<Self>, pid: Pid, event: RunqueueEvent) -> Rc<Self> {
        if self.contains(pid) {
            self.event.set(event);
            return Rc::clone(self);
        }
        let mut tasks = Vec::with_capacity(self.tasks.len() + 1);
        tasks.extend_from_slice(&self.tasks);
        tasks.push(pid);
        Self::with_tasks(tasks, event)
    }

    pub fn migrate_in(self: &Rc<Self>, pid: Pid) -> Rc<Self> {
        self.enqueue(pid, RunqueueEvent::MigrateIn(pid))
    }

    pub fn wake_up(self: &Rc<Self>, pid: Pid) -> Rc<Self> {
        self.enqueue(pid, RunqueueEvent::Wakeup(pid))
    }

    /// Wakeup of a freshly forked task.
    pub fn wake_up_new(self: &Rc<Self>, pid: Pid) -> Rc<Self> {
        self.enqueue(pid, RunqueueEvent::Fork(pid))
    }
}

impl fmt::Display for RunqueueSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, pid) in self.tasks.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", pid)?;
        }
        write!(f, "] {:?}", self.event())
    }
}
