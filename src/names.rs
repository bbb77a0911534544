// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::HashMap;
use std::fmt;

use crate::types::Pid;

const IDLE_COMM: &str = "idle";
const UNKNOWN_COMM: &str = "<unknown>";

/// Registry of the last command name seen for every pid.
///
/// Entries are only ever added or overwritten, never removed, so a pid that
/// exited early in the trace still resolves when inspecting old slices.
#[derive(Clone, Debug)]
pub struct TaskNames {
    names: HashMap<Pid, String>,
}

impl Default for TaskNames {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskNames {
    pub fn new() -> Self {
        let mut names = HashMap::new();
        names.insert(Pid::IDLE, IDLE_COMM.to_string());
        Self { names }
    }

    /// Records `comm` as the current name of `pid`. The idle task keeps its
    /// name regardless of the per-CPU `swapper/N` comm the kernel reports.
    pub fn update(&mut self, pid: Pid, comm: &str) {
        if pid.is_idle() || comm.is_empty() {
            return;
        }
        match self.names.get_mut(&pid) {
            Some(name) if name == comm => {}
            Some(name) => *name = comm.to_string(),
            None => {
                self.names.insert(pid, comm.to_string());
            }
        }
    }

    pub fn comm(&self, pid: Pid) -> Option<&str> {
        self.names.get(&pid).map(|s| s.as_str())
    }

    /// `comm:pid` display wrapper for `pid`.
    pub fn thread_name(&self, pid: Pid) -> ThreadName<'_> {
        ThreadName {
            comm: self.comm(pid).unwrap_or(UNKNOWN_COMM),
            pid,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Formats as `comm:pid`.
pub struct ThreadName<'a> {
    comm: &'a str,
    pid: Pid,
}

impl fmt::Display for ThreadName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.comm, self.pid)
    }
}
