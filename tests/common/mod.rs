#![allow(dead_code)]

use scx_rqtrace::{CpuId, EventHeader, Pid, SchedEvent, TaskState, TimeNs, TimeSlice, TraceRecord};

/// Initialize tracing from `RUST_LOG`. Idempotent across tests.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn header(ts: TimeNs, cpu: u32) -> EventHeader {
    EventHeader {
        ts,
        cpu: CpuId(cpu),
        pid: Pid(0),
        comm: "test".into(),
    }
}

fn comm(pid: i32) -> String {
    if pid == 0 {
        "swapper".into()
    } else {
        format!("task{}", pid)
    }
}

pub fn switch(ts: TimeNs, cpu: u32, prev: i32, state: TaskState, next: i32) -> TraceRecord {
    TraceRecord {
        header: header(ts, cpu),
        event: SchedEvent::Switch {
            prev_comm: comm(prev),
            prev_pid: Pid(prev),
            prev_prio: 120,
            prev_state: state,
            next_comm: comm(next),
            next_pid: Pid(next),
            next_prio: 120,
        },
    }
}

pub fn migrate(ts: TimeNs, pid: i32, from: u32, to: u32) -> TraceRecord {
    TraceRecord {
        header: header(ts, to),
        event: SchedEvent::MigrateTask {
            comm: comm(pid),
            pid: Pid(pid),
            prio: 120,
            orig_cpu: CpuId(from),
            dest_cpu: CpuId(to),
        },
    }
}

pub fn wakeup(ts: TimeNs, pid: i32, cpu: u32, success: bool) -> TraceRecord {
    TraceRecord {
        header: header(ts, cpu),
        event: SchedEvent::Wakeup {
            comm: comm(pid),
            pid: Pid(pid),
            prio: 120,
            success,
            target_cpu: CpuId(cpu),
            fork: false,
        },
    }
}

pub fn fork(ts: TimeNs, pid: i32, cpu: u32) -> TraceRecord {
    TraceRecord {
        header: header(ts, cpu),
        event: SchedEvent::Wakeup {
            comm: comm(pid),
            pid: Pid(pid),
            prio: 120,
            success: true,
            target_cpu: CpuId(cpu),
            fork: true,
        },
    }
}

pub fn other(ts: TimeNs, name: &str) -> TraceRecord {
    TraceRecord {
        header: header(ts, 0),
        event: SchedEvent::Other { name: name.into() },
    }
}

/// Task ids queued on `cpu` in `slice`, empty if the CPU is unknown.
pub fn tasks(slice: &TimeSlice, cpu: u32) -> Vec<i32> {
    slice
        .rq(CpuId(cpu))
        .map(|rq| rq.tasks().iter().map(|p| p.0).collect())
        .unwrap_or_default()
}
