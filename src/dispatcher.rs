// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Front door turning normalized scheduler records into runqueue history.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::event::{EventHeader, SchedEvent, TraceRecord};
use crate::fmt::FmtTs;
use crate::names::TaskNames;
use crate::timeslice::{CpuDetail, TimeSliceList};
use crate::types::{CpuId, Pid, TaskState, TimeNs};

pub const DEFAULT_MAX_INCONSISTENCY_REPORTS: usize = 32;

/// A `sched_switch` whose outgoing task is not the one we last saw switched
/// in on that CPU. Usually means trace events were lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Inconsistency {
    pub ts: TimeNs,
    pub cpu: u32,
    /// Task we recorded as running on `cpu`.
    pub expected: i32,
    pub prev_pid: i32,
    pub next_pid: i32,
}

/// Counters over everything the dispatcher consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub events: u64,
    pub switches: u64,
    pub migrations: u64,
    pub wakeups: u64,
    pub forks: u64,
    /// Wakeups carrying `success=0`.
    pub rejected_wakeups: u64,
    /// Records of kinds that never affect runqueues.
    pub ignored: u64,
    /// Handled records that left every runqueue unchanged.
    pub noops: u64,
    pub inconsistencies: u64,
    pub slices: usize,
    /// Highest CPU id seen plus one.
    pub cpus: u32,
    pub peak_total_load: usize,
}

impl std::fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Reconstruction Summary:")?;
        writeln!(f, "  events:           {}", self.events)?;
        writeln!(f, "  switches:         {}", self.switches)?;
        writeln!(f, "  migrations:       {}", self.migrations)?;
        writeln!(f, "  wakeups:          {}", self.wakeups)?;
        writeln!(f, "  forks:            {}", self.forks)?;
        writeln!(f, "  rejected_wakeups: {}", self.rejected_wakeups)?;
        writeln!(f, "  ignored:          {}", self.ignored)?;
        writeln!(f, "  noops:            {}", self.noops)?;
        writeln!(f, "  inconsistencies:  {}", self.inconsistencies)?;
        writeln!(f, "  slices:           {}", self.slices)?;
        writeln!(f, "  cpus:             {}", self.cpus)?;
        writeln!(f, "  peak_total_load:  {}", self.peak_total_load)
    }
}

/// Stateful consumer of a time-ordered scheduler event log.
///
/// Owns the runqueue history and the pid → command registry. Events must be
/// fed in non-decreasing timestamp order; nothing is sorted here.
#[derive(Debug)]
pub struct EventDispatcher {
    current_task: BTreeMap<CpuId, Pid>,
    names: TaskNames,
    timeslices: TimeSliceList,
    inconsistencies: Vec<Inconsistency>,
    max_inconsistency_reports: usize,
    stats: DispatchStats,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            current_task: BTreeMap::new(),
            names: TaskNames::new(),
            timeslices: TimeSliceList::new(),
            inconsistencies: Vec::new(),
            max_inconsistency_reports: DEFAULT_MAX_INCONSISTENCY_REPORTS,
            stats: DispatchStats::default(),
        }
    }

    /// Limits how many inconsistencies are logged. Later ones are still
    /// recorded and counted.
    pub fn with_max_inconsistency_reports(mut self, max: usize) -> Self {
        self.max_inconsistency_reports = max;
        self
    }

    pub fn timeslices(&self) -> &TimeSliceList {
        &self.timeslices
    }

    pub fn names(&self) -> &TaskNames {
        &self.names
    }

    pub fn inconsistencies(&self) -> &[Inconsistency] {
        &self.inconsistencies
    }

    /// Task last switched in on `cpu`, if any switch was seen there.
    pub fn current_task(&self, cpu: CpuId) -> Option<Pid> {
        self.current_task.get(&cpu).copied()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            slices: self.timeslices.len(),
            cpus: self.timeslices.nr_rectangles() + u32::from(!self.timeslices.is_empty()),
            peak_total_load: self.timeslices.peak_total_load(),
            ..self.stats.clone()
        }
    }

    /// Point query against the reconstructed history.
    pub fn inspect(&self, cpu: CpuId, ts: TimeNs) -> Option<CpuDetail> {
        self.timeslices.inspect(cpu, ts, &self.names)
    }

    /// Routes one record to its handler.
    pub fn ingest(&mut self, record: &TraceRecord) {
        self.stats.events += 1;
        let header = &record.header;
        let changed = match &record.event {
            SchedEvent::Switch {
                prev_comm,
                prev_pid,
                prev_state,
                next_comm,
                next_pid,
                ..
            } => {
                self.stats.switches += 1;
                self.sched_switch(header, prev_comm, *prev_pid, *prev_state, next_comm, *next_pid)
            }
            SchedEvent::MigrateTask {
                comm,
                pid,
                orig_cpu,
                dest_cpu,
                ..
            } => {
                self.stats.migrations += 1;
                self.names.update(*pid, comm);
                self.migrate(header.ts, *pid, *orig_cpu, *dest_cpu)
            }
            SchedEvent::Wakeup {
                comm,
                pid,
                success,
                target_cpu,
                fork,
                ..
            } => {
                if *fork {
                    self.stats.forks += 1;
                } else {
                    self.stats.wakeups += 1;
                }
                if !*success {
                    trace!(
                        "{} of {} rejected at {}",
                        record.event.kind(),
                        pid,
                        FmtTs(header.ts)
                    );
                    self.stats.rejected_wakeups += 1;
                    return;
                }
                self.names.update(*pid, comm);
                self.wake_up(header.ts, *pid, *target_cpu, *fork)
            }
            SchedEvent::Other { .. } => {
                trace!("ignoring {} at {}", record.event.kind(), FmtTs(header.ts));
                self.stats.ignored += 1;
                return;
            }
        };
        if !changed {
            self.stats.noops += 1;
        }
    }

    pub fn ingest_all<'a, I>(&mut self, records: I)
    where
        I: IntoIterator<Item = &'a TraceRecord>,
    {
        for record in records {
            self.ingest(record);
        }
    }

    /// Handles a context switch. A mismatch between the outgoing task and the
    /// one we last switched in is reported, then the record is trusted.
    pub fn sched_switch(
        &mut self,
        header: &EventHeader,
        prev_comm: &str,
        prev_pid: Pid,
        prev_state: TaskState,
        next_comm: &str,
        next_pid: Pid,
    ) -> bool {
        let cpu = header.cpu;
        if let Some(on_cpu) = self.current_task(cpu) {
            if on_cpu != prev_pid {
                if self.inconsistencies.len() < self.max_inconsistency_reports {
                    warn!(
                        "sched_switch event rejected ts: {} cpu: {} prev: {}({}) next: {}({})",
                        FmtTs(header.ts),
                        cpu,
                        prev_comm,
                        prev_pid,
                        next_comm,
                        next_pid
                    );
                    debug!(
                        "cpu {} was last switched to {}",
                        cpu,
                        self.names.thread_name(on_cpu)
                    );
                } else if self.inconsistencies.len() == self.max_inconsistency_reports {
                    warn!("further sched_switch inconsistencies will only be counted");
                }
                self.stats.inconsistencies += 1;
                self.inconsistencies.push(Inconsistency {
                    ts: header.ts,
                    cpu: cpu.0,
                    expected: on_cpu.0,
                    prev_pid: prev_pid.0,
                    next_pid: next_pid.0,
                });
            }
        }

        self.names.update(prev_pid, prev_comm);
        self.names.update(next_pid, next_comm);
        self.current_task.insert(cpu, next_pid);

        let ts = self.timeslices.get_time_slice(header.ts);
        ts.sched_switch(&mut self.timeslices, prev_pid, prev_state, next_pid, cpu)
    }

    pub fn migrate(&mut self, ts: TimeNs, pid: Pid, orig_cpu: CpuId, dest_cpu: CpuId) -> bool {
        let slice = self.timeslices.get_time_slice(ts);
        slice.migrate(&mut self.timeslices, pid, orig_cpu, dest_cpu)
    }

    /// Queues a woken (or, with `fork`, freshly forked) task. Failed wakeups
    /// must be filtered by the caller; [`EventDispatcher::ingest`] does so.
    pub fn wake_up(&mut self, ts: TimeNs, pid: Pid, target_cpu: CpuId, fork: bool) -> bool {
        let slice = self.timeslices.get_time_slice(ts);
        slice.wake_up(&mut self.timeslices, pid, target_cpu, fork)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(ts: TimeNs, cpu: u32) -> EventHeader {
        EventHeader {
            ts,
            cpu: CpuId(cpu),
            pid: Pid(0),
            comm: String::new(),
        }
    }

    #[test]
    fn test_inconsistency_is_reported_not_fatal() {
        let mut d = EventDispatcher::new().with_max_inconsistency_reports(1);
        assert!(d.sched_switch(&header(10, 0), "idle", Pid(0), TaskState::Runnable, "a", Pid(5)));
        assert_eq!(d.current_task(CpuId(0)), Some(Pid(5)));

        // Pid 6 claims to switch out although 5 is running.
        d.sched_switch(&header(20, 0), "b", Pid(6), TaskState::Sleeping, "c", Pid(7));
        d.sched_switch(&header(30, 0), "b", Pid(6), TaskState::Sleeping, "c", Pid(8));
        assert_eq!(d.inconsistencies().len(), 2);
        assert_eq!(d.stats().inconsistencies, 2);
        assert_eq!(
            d.inconsistencies()[0],
            Inconsistency {
                ts: 20,
                cpu: 0,
                expected: 5,
                prev_pid: 6,
                next_pid: 7,
            }
        );
        assert_eq!(d.current_task(CpuId(0)), Some(Pid(8)));
        assert_eq!(d.names().comm(Pid(7)), Some("c"));
    }

    #[test]
    fn test_first_switch_on_cpu_is_trusted() {
        let mut d = EventDispatcher::new();
        d.sched_switch(&header(10, 2), "x", Pid(3), TaskState::Runnable, "y", Pid(4));
        assert!(d.inconsistencies().is_empty());
        assert_eq!(d.current_task(CpuId(1)), None);
    }

    #[test]
    fn test_stats_counts() {
        let mut d = EventDispatcher::new();
        let records = vec![
            TraceRecord {
                header: header(10, 0),
                event: SchedEvent::Wakeup {
                    comm: "a".into(),
                    pid: Pid(5),
                    prio: 120,
                    success: true,
                    target_cpu: CpuId(1),
                    fork: true,
                },
            },
            TraceRecord {
                header: header(20, 0),
                event: SchedEvent::Wakeup {
                    comm: "a".into(),
                    pid: Pid(5),
                    prio: 120,
                    success: true,
                    target_cpu: CpuId(1),
                    fork: false,
                },
            },
            TraceRecord {
                header: header(30, 0),
                event: SchedEvent::Other {
                    name: "sched_process_exit".into(),
                },
            },
        ];
        d.ingest_all(&records);
        let stats = d.stats();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.forks, 1);
        assert_eq!(stats.wakeups, 1);
        assert_eq!(stats.noops, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.slices, 1);
        assert_eq!(stats.cpus, 2);
        assert_eq!(stats.peak_total_load, 1);
    }
}
