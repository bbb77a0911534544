// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Time-indexed runqueue history.
//!
//! A [`TimeSlice`] holds the runqueue of every known CPU over a half-open
//! interval `[start, end)`. Each incoming event rolls the newest slice
//! forward with [`TimeSlice::next`], which copies the CPU map but shares
//! every snapshot. The successor is only appended to the [`TimeSliceList`]
//! if the event actually changed a runqueue, so the list holds one slice per
//! distinct system state.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use tracing::warn;

use crate::event::Rgb;
use crate::fmt::{FmtTs, FmtUs};
use crate::names::TaskNames;
use crate::snapshot::RunqueueSnapshot;
use crate::types::{CpuId, Pid, TaskState, TimeNs};

/// System-wide runqueue state valid over `[start, end)`.
#[derive(Debug, Clone)]
pub struct TimeSlice {
    start: TimeNs,
    end: TimeNs,
    rqs: BTreeMap<CpuId, Rc<RunqueueSnapshot>>,
    /// Sum of `load()` over `rqs`, maintained incrementally.
    total_load: usize,
    /// CPUs whose runqueue changed when this slice started.
    event_cpus: Vec<CpuId>,
}

impl TimeSlice {
    /// First slice of a trace. No CPU is known yet; every CPU starts out with
    /// only its idle task when first touched.
    fn bootstrap(ts: TimeNs) -> Self {
        Self {
            start: ts,
            end: ts,
            rqs: BTreeMap::new(),
            total_load: 0,
            event_cpus: Vec::new(),
        }
    }

    pub fn start(&self) -> TimeNs {
        self.start
    }

    pub fn end(&self) -> TimeNs {
        self.end
    }

    pub fn duration(&self) -> TimeNs {
        self.end - self.start
    }

    pub fn total_load(&self) -> usize {
        self.total_load
    }

    pub fn event_cpus(&self) -> &[CpuId] {
        &self.event_cpus
    }

    pub fn contains(&self, ts: TimeNs) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn rq(&self, cpu: CpuId) -> Option<&Rc<RunqueueSnapshot>> {
        self.rqs.get(&cpu)
    }

    /// Runqueues of every known CPU, in CPU order.
    pub fn rqs(&self) -> impl Iterator<Item = (CpuId, &Rc<RunqueueSnapshot>)> + '_ {
        self.rqs.iter().map(|(&cpu, rq)| (cpu, rq))
    }

    /// Sum of every CPU's load, computed from scratch.
    pub fn recompute_load(&self) -> usize {
        self.rqs.values().map(|rq| rq.load()).sum()
    }

    fn rq_or_idle(&self, cpu: CpuId) -> Rc<RunqueueSnapshot> {
        match self.rqs.get(&cpu) {
            Some(rq) => Rc::clone(rq),
            None => RunqueueSnapshot::new(),
        }
    }

    fn update_rq(&mut self, cpu: CpuId, old_rq: &RunqueueSnapshot, new_rq: Rc<RunqueueSnapshot>) {
        let diff = new_rq.load() as isize - old_rq.load() as isize;
        self.total_load = self.total_load.saturating_add_signed(diff);
        self.rqs.insert(cpu, new_rq);
    }

    /// Applies a context switch on `cpu`. Returns whether the runqueue
    /// changed, in which case this slice was appended to `ts_list`.
    pub fn sched_switch(
        mut self,
        ts_list: &mut TimeSliceList,
        prev: Pid,
        prev_state: TaskState,
        next: Pid,
        cpu: CpuId,
    ) -> bool {
        let old_rq = self.rq_or_idle(cpu);
        let new_rq = old_rq.sched_switch(prev, prev_state, next);

        if Rc::ptr_eq(&old_rq, &new_rq) {
            return false;
        }

        self.update_rq(cpu, &old_rq, new_rq);
        self.event_cpus = vec![cpu];
        ts_list.append(self);
        true
    }

    /// Moves `pid` from `old_cpu` to `new_cpu`. A migration to the same CPU
    /// is ignored.
    pub fn migrate(
        mut self,
        ts_list: &mut TimeSliceList,
        pid: Pid,
        old_cpu: CpuId,
        new_cpu: CpuId,
    ) -> bool {
        if old_cpu == new_cpu {
            return false;
        }

        let old_rq = self.rq_or_idle(old_cpu);
        let out_rq = old_rq.migrate_out(pid);
        let out_changed = !Rc::ptr_eq(&old_rq, &out_rq);
        self.update_rq(old_cpu, &old_rq, out_rq);

        let new_rq = self.rq_or_idle(new_cpu);
        let in_rq = new_rq.migrate_in(pid);
        self.update_rq(new_cpu, &new_rq, in_rq);

        self.event_cpus.clear();
        if out_changed {
            self.event_cpus.push(old_cpu);
        }
        self.event_cpus.push(new_cpu);
        ts_list.append(self);
        true
    }

    /// Queues `pid` on `cpu` after a wakeup, or a fork when `fork` is set.
    pub fn wake_up(mut self, ts_list: &mut TimeSliceList, pid: Pid, cpu: CpuId, fork: bool) -> bool {
        let old_rq = self.rq_or_idle(cpu);
        let new_rq = if fork {
            old_rq.wake_up_new(pid)
        } else {
            old_rq.wake_up(pid)
        };

        if Rc::ptr_eq(&old_rq, &new_rq) {
            return false;
        }

        self.update_rq(cpu, &old_rq, new_rq);
        self.event_cpus = vec![cpu];
        ts_list.append(self);
        true
    }

    /// Closes this slice at `ts` and returns its successor, which starts out
    /// sharing every runqueue snapshot with this one.
    pub fn next(&mut self, ts: TimeNs) -> TimeSlice {
        self.end = ts;
        TimeSlice {
            start: ts,
            end: ts,
            rqs: self.rqs.clone(),
            total_load: self.total_load,
            event_cpus: Vec::new(),
        }
    }
}

/// One CPU's cell within one slice, as handed to [`TimeSliceList::fill_zone`]
/// callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZonePaint {
    pub cpu: CpuId,
    pub start: TimeNs,
    pub end: TimeNs,
    pub load: usize,
    pub total_load: usize,
    /// Share of the system load queued on this CPU, 0 when the system is
    /// idle.
    pub load_ratio: f64,
    /// Marker color when this CPU's runqueue changed at `start`.
    pub top_color: Option<Rgb>,
}

impl ZonePaint {
    /// White for an idle CPU, shading to full red as the CPU carries the
    /// whole system load.
    pub fn fill_color(&self) -> Rgb {
        let red_power = (255.0 - 255.0 * self.load_ratio.clamp(0.0, 1.0)) as u8;
        Rgb(0xff, red_power, red_power)
    }
}

/// What a CPU looked like at a given time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuDetail {
    pub cpu: u32,
    pub last_event: String,
    pub start: TimeNs,
    pub duration: TimeNs,
    pub load: usize,
    pub tasks: Vec<String>,
}

impl fmt::Display for CpuDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CPU: {}", self.cpu)?;
        writeln!(f, "Last event : {}", self.last_event)?;
        writeln!(f, "Timestamp : {}", FmtTs(self.start))?;
        writeln!(f, "Duration : {}", FmtUs(self.duration))?;
        writeln!(f, "Load = {}", self.load)?;
        for task in &self.tasks {
            writeln!(f, "{}", task)?;
        }
        Ok(())
    }
}

/// Append-only, time-ordered list of slices.
///
/// Slices are contiguous: every slice ends where its successor starts, and
/// starts are strictly increasing.
#[derive(Debug, Default)]
pub struct TimeSliceList {
    slices: Vec<TimeSlice>,
}

impl TimeSliceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&TimeSlice> {
        self.slices.get(idx)
    }

    pub fn last(&self) -> Option<&TimeSlice> {
        self.slices.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TimeSlice> {
        self.slices.iter()
    }

    /// Returns the slice an event at `ts` should be applied to. The slice is
    /// not part of the list until one of its transitions changes state.
    ///
    /// Timestamps older than the newest one seen are clamped to it, so the
    /// newest slice never shrinks and starts keep increasing.
    pub fn get_time_slice(&mut self, ts: TimeNs) -> TimeSlice {
        match self.slices.last_mut() {
            None => TimeSlice::bootstrap(ts),
            Some(last) => {
                // `end` is the latest timestamp applied, no-ops included.
                let ts = if ts < last.end {
                    warn!(
                        "event at {} precedes the latest event at {}, clamping",
                        FmtTs(ts),
                        FmtTs(last.end)
                    );
                    last.end
                } else {
                    ts
                };
                last.next(ts)
            }
        }
    }

    /// Appends a slice whose state changed. A slice sharing its start with
    /// the newest one replaces it, merging the touched CPUs, so that starts
    /// stay strictly increasing.
    fn append(&mut self, mut slice: TimeSlice) {
        if let Some(last) = self.slices.last_mut() {
            if last.start == slice.start {
                for &cpu in &last.event_cpus {
                    if !slice.event_cpus.contains(&cpu) {
                        slice.event_cpus.push(cpu);
                    }
                }
                *last = slice;
                return;
            }
        }
        self.slices.push(slice);
    }

    /// Index of the slice whose `[start, end)` contains `ts`.
    ///
    /// The newest slice stays open until the next event, so this returns
    /// `None` at and after `interval().1`. [`Self::inspect`] and
    /// [`Self::fill_zone`] still reach the final state.
    pub fn find_time_slice(&self, ts: TimeNs) -> Option<usize> {
        // Starts are strictly increasing, so at most one candidate exists.
        let idx = self.slices.partition_point(|s| s.start <= ts);
        if idx == 0 {
            return None;
        }
        self.slices[idx - 1].contains(ts).then_some(idx - 1)
    }

    /// Walks every slice overlapping `start` up to the last one starting at
    /// or before `end`, calling `paint` once per known CPU per slice. A slice
    /// starting exactly at `start` counts as overlapping even when it is
    /// empty, which is how the newest slice gets painted.
    pub fn fill_zone<F>(&self, start: TimeNs, end: TimeNs, mut paint: F)
    where
        F: FnMut(&ZonePaint),
    {
        let first = self
            .slices
            .partition_point(|s| s.end < start || (s.end == start && s.start < start));
        for slice in &self.slices[first..] {
            if slice.start > end {
                return;
            }
            for (cpu, rq) in slice.rqs() {
                let load = rq.load();
                let load_ratio = if slice.total_load != 0 {
                    load as f64 / slice.total_load as f64
                } else {
                    0.0
                };
                let top_color = if slice.event_cpus.contains(&cpu) {
                    rq.event().color()
                } else {
                    None
                };
                paint(&ZonePaint {
                    cpu,
                    start: slice.start,
                    end: slice.end,
                    load,
                    total_load: slice.total_load,
                    load_ratio,
                    top_color,
                });
            }
        }
    }

    /// `(first start, last end)`, or `(0, 0)` for an empty history.
    pub fn interval(&self) -> (TimeNs, TimeNs) {
        match (self.slices.first(), self.slices.last()) {
            (Some(first), Some(last)) => (first.start, last.end),
            _ => (0, 0),
        }
    }

    /// Highest CPU id known in the newest slice, 0 for an empty history.
    pub fn nr_rectangles(&self) -> u32 {
        self.slices
            .last()
            .and_then(|last| last.rqs.keys().next_back())
            .map_or(0, |cpu| cpu.0)
    }

    /// Highest total load reached over the whole history.
    pub fn peak_total_load(&self) -> usize {
        self.slices.iter().map(|s| s.total_load).max().unwrap_or(0)
    }

    /// Slice in effect at `ts`. Unlike [`Self::find_time_slice`], the newest
    /// slice also covers its own end.
    fn slice_at(&self, ts: TimeNs) -> Option<&TimeSlice> {
        match self.find_time_slice(ts) {
            Some(idx) => self.slices.get(idx),
            None => self
                .slices
                .last()
                .filter(|last| last.start <= ts && ts <= last.end),
        }
    }

    /// State of `cpu` at `ts`, or `None` if `ts` is outside the history or
    /// the CPU had not been seen yet. The final state answers at
    /// `interval().1`.
    pub fn inspect(&self, cpu: CpuId, ts: TimeNs, names: &TaskNames) -> Option<CpuDetail> {
        let slice = self.slice_at(ts)?;
        let rq = slice.rq(cpu)?;
        Some(CpuDetail {
            cpu: cpu.0,
            last_event: rq.event().display(names).to_string(),
            start: slice.start,
            duration: slice.duration(),
            load: rq.load(),
            tasks: rq
                .tasks()
                .iter()
                .map(|&pid| names.thread_name(pid).to_string())
                .collect(),
        })
    }
}

impl<'a> IntoIterator for &'a TimeSliceList {
    type Item = &'a TimeSlice;
    type IntoIter = std::slice::Iter<'a, TimeSlice>;

    fn into_iter(self) -> Self::IntoIter {
        self.slices.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RunqueueEvent;

    fn pids(slice: &TimeSlice, cpu: u32) -> Vec<i32> {
        slice
            .rq(CpuId(cpu))
            .map(|rq| rq.tasks().iter().map(|p| p.0).collect())
            .unwrap_or_default()
    }

    fn wake(list: &mut TimeSliceList, ts: TimeNs, pid: i32, cpu: u32) -> bool {
        list.get_time_slice(ts)
            .wake_up(list, Pid(pid), CpuId(cpu), false)
    }

    #[test]
    fn test_empty_list() {
        let list = TimeSliceList::new();
        assert_eq!(list.interval(), (0, 0));
        assert_eq!(list.nr_rectangles(), 0);
        assert_eq!(list.find_time_slice(0), None);
        assert_eq!(list.peak_total_load(), 0);
    }

    #[test]
    fn test_noop_slices_are_discarded() {
        let mut list = TimeSliceList::new();
        let changed = list
            .get_time_slice(100)
            .sched_switch(&mut list, Pid::IDLE, TaskState::Runnable, Pid::IDLE, CpuId(0));
        assert!(!changed);
        assert!(list.is_empty());

        assert!(wake(&mut list, 200, 5, 0));
        assert!(!wake(&mut list, 300, 5, 0));
        assert_eq!(list.len(), 1);
        // The no-op still extended the open slice.
        assert_eq!(list.interval(), (200, 300));
    }

    #[test]
    fn test_slices_share_unchanged_snapshots() {
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 10, 5, 0));
        assert!(wake(&mut list, 20, 6, 1));

        let first = list.get(0).unwrap();
        let second = list.get(1).unwrap();
        assert!(Rc::ptr_eq(
            first.rq(CpuId(0)).unwrap(),
            second.rq(CpuId(0)).unwrap()
        ));
        assert!(first.rq(CpuId(1)).is_none());
        assert_eq!(pids(second, 1), vec![0, 6]);
        assert_eq!(first.end(), second.start());
    }

    #[test]
    fn test_migrate_same_cpu_is_noop() {
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 10, 5, 0));
        let changed = list
            .get_time_slice(20)
            .migrate(&mut list, Pid(5), CpuId(0), CpuId(0));
        assert!(!changed);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_migrate_event_cpus() {
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 10, 5, 0));

        assert!(list
            .get_time_slice(20)
            .migrate(&mut list, Pid(5), CpuId(0), CpuId(2)));
        let slice = list.last().unwrap();
        assert_eq!(slice.event_cpus(), &[CpuId(0), CpuId(2)]);
        assert_eq!(pids(slice, 0), vec![0]);
        assert_eq!(pids(slice, 2), vec![0, 5]);
        assert_eq!(slice.total_load(), 1);

        // Migrating a task that is not queued only touches the destination.
        assert!(list
            .get_time_slice(30)
            .migrate(&mut list, Pid(9), CpuId(1), CpuId(0)));
        let slice = list.last().unwrap();
        assert_eq!(slice.event_cpus(), &[CpuId(0)]);
        assert_eq!(slice.total_load(), 2);
        assert_eq!(slice.recompute_load(), 2);
    }

    #[test]
    fn test_same_timestamp_coalesces() {
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 10, 5, 0));
        assert!(wake(&mut list, 20, 6, 1));
        assert!(wake(&mut list, 20, 7, 0));
        assert_eq!(list.len(), 2);

        let slice = list.last().unwrap();
        assert_eq!(slice.start(), 20);
        assert_eq!(slice.event_cpus(), &[CpuId(0), CpuId(1)]);
        assert_eq!(pids(slice, 0), vec![0, 5, 7]);
        assert_eq!(pids(slice, 1), vec![0, 6]);
        assert_eq!(slice.total_load(), 3);
    }

    #[test]
    fn test_out_of_order_timestamp_is_clamped() {
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 100, 5, 0));
        assert!(wake(&mut list, 50, 6, 0));
        assert_eq!(list.len(), 1);
        assert_eq!(list.last().unwrap().start(), 100);
        assert_eq!(pids(list.last().unwrap(), 0), vec![0, 5, 6]);
    }

    #[test]
    fn test_clamped_event_keeps_extended_end() {
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 100, 5, 0));
        assert!(!wake(&mut list, 200, 5, 0));
        assert_eq!(list.interval(), (100, 200));

        // A late no-op must not roll the open slice back.
        assert!(!wake(&mut list, 150, 5, 0));
        assert_eq!(list.interval(), (100, 200));

        // A late change lands at the latest known time.
        assert!(wake(&mut list, 150, 6, 0));
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0).unwrap().end(), 200);
        assert_eq!(list.last().unwrap().start(), 200);
        assert_eq!(pids(list.last().unwrap(), 0), vec![0, 5, 6]);
    }

    #[test]
    fn test_find_time_slice() {
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 10, 1, 0));
        assert_eq!(list.find_time_slice(10), None, "zero-width slice");

        assert!(wake(&mut list, 20, 2, 0));
        assert_eq!(list.find_time_slice(9), None);
        assert_eq!(list.find_time_slice(10), Some(0));
        assert_eq!(list.find_time_slice(19), Some(0));
        assert_eq!(list.find_time_slice(20), None);

        assert!(wake(&mut list, 30, 3, 0));
        assert!(!wake(&mut list, 40, 3, 0));
        assert_eq!(list.find_time_slice(20), Some(1));
        assert_eq!(list.find_time_slice(35), Some(2));
        assert_eq!(list.find_time_slice(40), None);
        assert_eq!(list.find_time_slice(u64::MAX), None);
    }

    #[test]
    fn test_fill_zone() {
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 10, 5, 0));
        assert!(wake(&mut list, 20, 6, 1));
        assert!(wake(&mut list, 30, 7, 1));
        assert!(!wake(&mut list, 40, 7, 1));

        let mut cells = Vec::new();
        list.fill_zone(15, 25, |cell| cells.push(*cell));
        // Slices [10,20) with CPU 0, and [20,30) with CPUs 0 and 1.
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].cpu, CpuId(0));
        assert_eq!(cells[0].load_ratio, 1.0);
        assert_eq!(cells[0].top_color, RunqueueEvent::Wakeup(Pid(5)).color());
        assert_eq!(cells[1].start, 20);
        assert_eq!(cells[1].top_color, None);
        assert_eq!(cells[1].load_ratio, 0.5);
        assert_eq!(cells[2].cpu, CpuId(1));
        assert!(cells[2].top_color.is_some());
        assert_eq!(cells[2].fill_color(), Rgb(0xff, 127, 127));

        let mut count = 0;
        list.fill_zone(100, 200, |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_final_state_is_reachable() {
        let names = TaskNames::new();
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 1_000_000_000, 5, 0));
        assert!(wake(&mut list, 2_000_000_000, 7, 0));
        let (_, end) = list.interval();
        assert_eq!(end, 2_000_000_000);
        assert_eq!(list.find_time_slice(end), None);

        let detail = list.inspect(CpuId(0), end, &names).unwrap();
        assert_eq!(detail.start, end);
        assert_eq!(detail.load, 2);
        assert_eq!(detail.duration, 0);
        assert!(list.inspect(CpuId(0), end + 1, &names).is_none());

        let mut cells = Vec::new();
        list.fill_zone(end, end, |cell| cells.push(*cell));
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].start, end);
        assert_eq!(cells[0].load, 2);
        assert_eq!(cells[0].top_color, RunqueueEvent::Wakeup(Pid(7)).color());

        // Starting on the boundary of a closed slice skips it.
        let mut starts = Vec::new();
        list.fill_zone(end, u64::MAX, |cell| starts.push(cell.start));
        assert_eq!(starts, vec![end]);
    }

    #[test]
    fn test_inspect() {
        let mut names = TaskNames::new();
        names.update(Pid(5), "make");
        let mut list = TimeSliceList::new();
        assert!(wake(&mut list, 1_000_000_000, 5, 3));
        assert!(!wake(&mut list, 1_000_050_000, 5, 3));

        let detail = list.inspect(CpuId(3), 1_000_000_001, &names).unwrap();
        assert_eq!(detail.last_event, "make:5 woke up");
        assert_eq!(detail.load, 1);
        assert_eq!(detail.duration, 50_000);
        assert_eq!(detail.tasks, vec!["idle:0", "make:5"]);
        let text = detail.to_string();
        assert!(text.contains("Timestamp : 1.000000"));
        assert!(text.contains("Duration :     50 us"));

        assert!(list.inspect(CpuId(0), 1_000_000_001, &names).is_none());
        assert_eq!(list.nr_rectangles(), 3);
    }
}
