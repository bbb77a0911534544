// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers and type aliases for trace concepts.
//!
//! PIDs and CPU ids are newtypes so that a CPU number can never be pushed
//! onto a runqueue by accident. Timestamps stay a plain alias.

use std::fmt;

/// Process identifier. `Pid(0)` is the per-CPU idle task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl Pid {
    pub const IDLE: Pid = Pid(0);

    pub fn is_idle(self) -> bool {
        self == Self::IDLE
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trace time in nanoseconds.
pub type TimeNs = u64;

/// State of the outgoing task in a `sched_switch` record.
///
/// Only the runnable/not-runnable split matters for runqueue membership;
/// the remaining variants are kept for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Preempted or yielded, still on the runqueue (`R`, `R+`, or 0).
    Runnable,
    /// Interruptible sleep (`S`).
    Sleeping,
    /// Uninterruptible sleep (`D`).
    DiskSleep,
    /// Stopped or traced (`T`, `t`).
    Stopped,
    /// Exiting (`X`, `Z`, or 64).
    Dead,
    /// Idle kthread or parked (`I`, `P`, or 0x80).
    Idle,
    /// Anything we could not decode. Treated as having left the runqueue.
    Unknown,
}

/// `TASK_REPORT_MAX` marks a preempted task. It has been 0x100, 0x800 and
/// 0x1000 depending on the kernel version.
const PREEMPTED: u64 = 0x100 | 0x800 | 0x1000;

impl TaskState {
    /// Decode the raw kernel `prev_state` bitmask.
    pub fn from_raw(raw: u64) -> Self {
        if raw & PREEMPTED != 0 {
            return TaskState::Runnable;
        }
        match raw {
            0 => TaskState::Runnable,
            1 => TaskState::Sleeping,
            2 => TaskState::DiskSleep,
            4 | 8 => TaskState::Stopped,
            16 | 32 | 64 => TaskState::Dead,
            0x80 => TaskState::Idle,
            _ => TaskState::Unknown,
        }
    }

    /// Decode a `prev_state` as printed by `perf script`, either the letter
    /// form (`R+`, `S`, `D|K`, ...) or the numeric form.
    pub fn parse(s: &str) -> Self {
        if let Ok(raw) = s.parse::<u64>() {
            return Self::from_raw(raw);
        }
        // "R+" marks a preempted task, "D|K" a killable sleep.
        match s.chars().next() {
            Some('R') => TaskState::Runnable,
            Some('S') => TaskState::Sleeping,
            Some('D') => TaskState::DiskSleep,
            Some('T') | Some('t') => TaskState::Stopped,
            Some('X') | Some('Z') => TaskState::Dead,
            Some('I') | Some('P') => TaskState::Idle,
            _ => TaskState::Unknown,
        }
    }

    pub fn is_runnable(self) -> bool {
        self == TaskState::Runnable
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Runnable => "R",
            TaskState::Sleeping => "S",
            TaskState::DiskSleep => "D",
            TaskState::Stopped => "T",
            TaskState::Dead => "X",
            TaskState::Idle => "I",
            TaskState::Unknown => "?",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_letters() {
        assert_eq!(TaskState::parse("R"), TaskState::Runnable);
        assert_eq!(TaskState::parse("R+"), TaskState::Runnable);
        assert_eq!(TaskState::parse("S"), TaskState::Sleeping);
        assert_eq!(TaskState::parse("D|K"), TaskState::DiskSleep);
        assert_eq!(TaskState::parse("Z"), TaskState::Dead);
        assert_eq!(TaskState::parse(""), TaskState::Unknown);
    }

    #[test]
    fn test_task_state_numeric() {
        assert!(TaskState::parse("0").is_runnable());
        assert_eq!(TaskState::parse("1"), TaskState::Sleeping);
        assert_eq!(TaskState::parse("2"), TaskState::DiskSleep);
        assert_eq!(TaskState::parse("64"), TaskState::Dead);
        assert_eq!(TaskState::parse("128"), TaskState::Idle);
        assert_eq!(TaskState::parse("1026"), TaskState::Unknown);
        assert_eq!(TaskState::parse("512"), TaskState::Unknown);
        assert!(!TaskState::Unknown.is_runnable());
    }

    #[test]
    fn test_preempted_is_runnable() {
        for raw in ["256", "2048", "4096"] {
            assert_eq!(TaskState::parse(raw), TaskState::Runnable, "{}", raw);
        }
        assert_eq!(TaskState::from_raw(0x1000 | 0x1), TaskState::Runnable);
    }

    #[test]
    fn test_idle_pid() {
        assert!(Pid::IDLE.is_idle());
        assert!(!Pid(1).is_idle());
        assert_eq!(Pid::default(), Pid::IDLE);
    }
}
