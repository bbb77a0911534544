// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Runqueue transition tags and the normalized scheduler records that drive
//! them.

use std::fmt;

use serde::Serialize;

use crate::names::TaskNames;
use crate::types::{CpuId, Pid, TaskState, TimeNs};

/// RGB triple used to classify runqueue transitions on a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

/// The transition that produced a runqueue snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunqueueEvent {
    #[default]
    Unknown,
    /// The task left the runqueue by blocking.
    Sleep(Pid),
    Wakeup(Pid),
    /// A freshly forked task was woken for the first time.
    Fork(Pid),
    MigrateIn(Pid),
    MigrateOut(Pid),
}

impl RunqueueEvent {
    /// Marker color of this transition. `Unknown` has none.
    pub fn color(&self) -> Option<Rgb> {
        match self {
            RunqueueEvent::Unknown => None,
            RunqueueEvent::Sleep(_) => Some(Rgb(0, 0, 0xff)),
            RunqueueEvent::Wakeup(_) => Some(Rgb(0xff, 0xff, 0)),
            RunqueueEvent::Fork(_) => Some(Rgb(0, 0xff, 0)),
            RunqueueEvent::MigrateIn(_) => Some(Rgb(0, 0xf0, 0xff)),
            RunqueueEvent::MigrateOut(_) => Some(Rgb(0xff, 0, 0xff)),
        }
    }

    /// Human readable description, resolving pids through `names`.
    pub fn display<'a>(&'a self, names: &'a TaskNames) -> RunqueueEventDisplay<'a> {
        RunqueueEventDisplay { event: self, names }
    }
}

pub struct RunqueueEventDisplay<'a> {
    event: &'a RunqueueEvent,
    names: &'a TaskNames,
}

impl fmt::Display for RunqueueEventDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names;
        match *self.event {
            RunqueueEvent::Unknown => f.write_str("unknown"),
            RunqueueEvent::Sleep(pid) => write!(f, "{} gone to sleep", names.thread_name(pid)),
            RunqueueEvent::Wakeup(pid) => write!(f, "{} woke up", names.thread_name(pid)),
            RunqueueEvent::Fork(pid) => write!(f, "new forked task {}", names.thread_name(pid)),
            RunqueueEvent::MigrateIn(pid) => {
                write!(f, "task migrated in {}", names.thread_name(pid))
            }
            RunqueueEvent::MigrateOut(pid) => {
                write!(f, "task migrated out {}", names.thread_name(pid))
            }
        }
    }
}

/// Common fields of every trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub ts: TimeNs,
    /// CPU the event was recorded on.
    pub cpu: CpuId,
    /// Task that was current when the event fired.
    pub pid: Pid,
    pub comm: String,
}

/// Kind-specific payload of a trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedEvent {
    Switch {
        prev_comm: String,
        prev_pid: Pid,
        prev_prio: i32,
        prev_state: TaskState,
        next_comm: String,
        next_pid: Pid,
        next_prio: i32,
    },
    MigrateTask {
        comm: String,
        pid: Pid,
        prio: i32,
        orig_cpu: CpuId,
        dest_cpu: CpuId,
    },
    /// `sched_wakeup` or, with `fork` set, `sched_wakeup_new`.
    Wakeup {
        comm: String,
        pid: Pid,
        prio: i32,
        success: bool,
        target_cpu: CpuId,
        fork: bool,
    },
    /// Accepted and ignored (process exit, stats, kthread stop, ...).
    Other { name: String },
}

impl SchedEvent {
    /// Tracepoint name of the record, as used in log messages.
    pub fn kind(&self) -> &str {
        match self {
            SchedEvent::Switch { .. } => "sched_switch",
            SchedEvent::MigrateTask { .. } => "sched_migrate_task",
            SchedEvent::Wakeup { fork: false, .. } => "sched_wakeup",
            SchedEvent::Wakeup { fork: true, .. } => "sched_wakeup_new",
            SchedEvent::Other { name } => name,
        }
    }
}

/// One normalized record from the event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub header: EventHeader,
    pub event: SchedEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colors() {
        assert_eq!(RunqueueEvent::Unknown.color(), None);
        assert_eq!(RunqueueEvent::Sleep(Pid(1)).color(), Some(Rgb(0, 0, 0xff)));
        assert_eq!(RunqueueEvent::Fork(Pid(1)).color(), Some(Rgb(0, 0xff, 0)));
        assert_eq!(
            RunqueueEvent::MigrateOut(Pid(1)).color(),
            Some(Rgb(0xff, 0, 0xff))
        );
    }

    #[test]
    fn test_descriptions() {
        let mut names = TaskNames::new();
        names.update(Pid(5), "cc1");
        let desc = |ev: RunqueueEvent| ev.display(&names).to_string();

        assert_eq!(desc(RunqueueEvent::Unknown), "unknown");
        assert_eq!(desc(RunqueueEvent::Sleep(Pid(5))), "cc1:5 gone to sleep");
        assert_eq!(desc(RunqueueEvent::Wakeup(Pid(5))), "cc1:5 woke up");
        assert_eq!(desc(RunqueueEvent::Fork(Pid(5))), "new forked task cc1:5");
        assert_eq!(desc(RunqueueEvent::MigrateIn(Pid(5))), "task migrated in cc1:5");
        assert_eq!(
            desc(RunqueueEvent::MigrateOut(Pid(0))),
            "task migrated out idle:0"
        );
    }

    #[test]
    fn test_kind_names() {
        let ev = SchedEvent::Wakeup {
            comm: "a".into(),
            pid: Pid(1),
            prio: 120,
            success: true,
            target_cpu: CpuId(0),
            fork: true,
        };
        assert_eq!(ev.kind(), "sched_wakeup_new");
        let other = SchedEvent::Other {
            name: "sched_process_exit".into(),
        };
        assert_eq!(other.kind(), "sched_process_exit");
    }
}
