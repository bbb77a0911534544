// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Runqueue history reconstruction for scheduler traces
//!
//! Given a time-ordered log of `sched_switch`, `sched_migrate_task`,
//! `sched_wakeup` and `sched_wakeup_new` records, rebuild the set of
//! runnable tasks queued on every CPU at every point in time, along with the
//! event that last changed each runqueue.
//!
//! - [`EventDispatcher`] consumes [`TraceRecord`]s one at a time, checks
//!   switch records against the task it last saw on each CPU, and applies
//!   the transition to the newest [`TimeSlice`].
//! - [`TimeSliceList`] is the resulting history: contiguous slices of
//!   system-wide state, searchable by timestamp.
//! - [`RunqueueSnapshot`]s are immutable and shared between slices, so a
//!   slice only allocates for the CPUs that changed.
//!
//! ```rust
//! use scx_rqtrace::*;
//!
//! let trace = "\
//! bash 10 [000] 1.000000: sched:sched_wakeup: comm=cc1 pid=42 prio=120 target_cpu=001
//! ";
//! let records = read_trace(trace.as_bytes(), false).unwrap();
//! let mut dispatcher = EventDispatcher::new();
//! dispatcher.ingest_all(&records);
//!
//! let slices = dispatcher.timeslices();
//! assert_eq!(slices.len(), 1);
//! assert_eq!(slices.nr_rectangles(), 1);
//! ```

pub mod config;
pub mod dispatcher;
pub mod event;
pub mod fmt;
pub mod names;
pub mod parse;
pub mod snapshot;
pub mod timeslice;
pub mod types;

pub use config::Config;
pub use dispatcher::{DispatchStats, EventDispatcher, Inconsistency};
pub use event::{EventHeader, Rgb, RunqueueEvent, SchedEvent, TraceRecord};
pub use fmt::{FmtTs, FmtUs};
pub use names::TaskNames;
pub use parse::{parse_line, parse_timestamp, read_trace, RecordError};
pub use snapshot::RunqueueSnapshot;
pub use timeslice::{CpuDetail, TimeSlice, TimeSliceList, ZonePaint};
pub use types::{CpuId, Pid, TaskState, TimeNs};
