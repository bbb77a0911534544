// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Reader for the text output of `perf script` on `sched:*` tracepoints.
//!
//! A record looks like
//!
//! ```text
//!     bash  1234 [002] 5123.000456: sched:sched_switch: prev_comm=bash prev_pid=1234 ...
//! ```
//!
//! The ftrace `comm-pid [cpu] flags ts: event:` layout is accepted as well,
//! and so are the compact payloads printed by the libtraceevent sched
//! plugins, which `perf script` uses by default:
//!
//! ```text
//!     bash:1234 [120] S ==> swapper/2:0 [120]
//!     cc1:42 [120] success=1 CPU:001
//! ```
//! Events other than switch, migrate and wakeup are returned as
//! [`SchedEvent::Other`] so that the caller can count them.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::io::BufRead;

use anyhow::Context;
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::event::{EventHeader, SchedEvent, TraceRecord};
use crate::types::{CpuId, Pid, TaskState, TimeNs};

lazy_static! {
    static ref HEADER_RE: Regex = Regex::new(
        r"^\s*(?P<comm>.*?)[\s-]+(?P<pid>-?\d+)(?:/\d+)?\s+\[(?P<cpu>\d+)\]\s+(?:[\w.]+\s+)?(?P<secs>\d+)\.(?P<frac>\d+):\s+(?P<event>[\w:]+):\s*(?P<fields>.*)$"
    )
    .unwrap();
    static ref KEY_RE: Regex = Regex::new(r"(?:^|\s)(\w+)=").unwrap();
    // Group names match the field names of the key=value layout.
    static ref PLUGIN_SWITCH_RE: Regex = Regex::new(
        r"^(?P<prev_comm>.+):(?P<prev_pid>-?\d+)\s+\[(?P<prev_prio>-?\d+)\]\s+(?P<prev_state>\S+)\s+==>\s+(?P<next_comm>.+):(?P<next_pid>-?\d+)\s+\[(?P<next_prio>-?\d+)\]\s*$"
    )
    .unwrap();
    static ref PLUGIN_WAKEUP_RE: Regex = Regex::new(
        r"^(?P<comm>.+):(?P<pid>-?\d+)\s+\[(?P<prio>-?\d+)\](?:\s+success=(?P<success>\d+))?\s+CPU:(?P<target_cpu>\d+)\s*$"
    )
    .unwrap();
}

/// A trace line that cannot be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The line does not have the `comm pid [cpu] ts: event:` shape.
    Malformed(String),
    MissingField {
        event: String,
        field: &'static str,
    },
    InvalidField {
        event: String,
        field: &'static str,
        value: String,
    },
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::Malformed(line) => write!(f, "malformed trace line: {:?}", line),
            RecordError::MissingField { event, field } => {
                write!(f, "{} record is missing field {:?}", event, field)
            }
            RecordError::InvalidField {
                event,
                field,
                value,
            } => write!(f, "{} record has invalid {}={:?}", event, field, value),
        }
    }
}

impl std::error::Error for RecordError {}

impl From<RecordError> for io::Error {
    fn from(err: RecordError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

struct Fields<'a> {
    event: &'a str,
    map: HashMap<&'a str, &'a str>,
}

impl<'a> Fields<'a> {
    fn parse(event: &'a str, text: &'a str) -> Self {
        // Values run up to the next key so that comms containing spaces
        // survive.
        let keys: Vec<_> = KEY_RE.captures_iter(text).collect();
        let mut map = HashMap::new();
        for (i, caps) in keys.iter().enumerate() {
            let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let end = keys
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(text.len(), |m| m.start());
            let value = text[whole.end()..end].trim();
            let value = value.strip_suffix("==>").unwrap_or(value).trim_end();
            map.insert(key.as_str(), value);
        }

        let plugin: Option<&'static Regex> = match event {
            "sched_switch" if !map.contains_key("prev_comm") => Some(&*PLUGIN_SWITCH_RE),
            "sched_wakeup" | "sched_wakeup_new" if !map.contains_key("comm") => {
                Some(&*PLUGIN_WAKEUP_RE)
            }
            _ => None,
        };
        if let Some(re) = plugin {
            if let Some(caps) = re.captures(text) {
                for key in re.capture_names().flatten() {
                    if let Some(value) = caps.name(key) {
                        map.insert(key, value.as_str());
                    }
                }
            }
        }

        Self { event, map }
    }

    fn str(&self, field: &'static str) -> Result<&'a str, RecordError> {
        self.map
            .get(field)
            .copied()
            .ok_or_else(|| RecordError::MissingField {
                event: self.event.to_string(),
                field,
            })
    }

    fn num<T: std::str::FromStr>(&self, field: &'static str) -> Result<T, RecordError> {
        let value = self.str(field)?;
        value.parse().map_err(|_| RecordError::InvalidField {
            event: self.event.to_string(),
            field,
            value: value.to_string(),
        })
    }

    fn pid(&self, field: &'static str) -> Result<Pid, RecordError> {
        self.num(field).map(Pid)
    }

    fn cpu(&self, field: &'static str) -> Result<CpuId, RecordError> {
        self.num(field).map(CpuId)
    }
}

fn timestamp(secs: &str, frac: &str) -> Option<TimeNs> {
    let secs: u64 = secs.parse().ok()?;
    // Normalize the fraction to nanoseconds whatever precision was printed.
    let digits = &frac[..frac.len().min(9)];
    let scale = 10u64.pow(9 - digits.len() as u32);
    let nsecs = digits.parse::<u64>().ok()? * scale;
    secs.checked_mul(1_000_000_000)?.checked_add(nsecs)
}

/// Parses a `seconds.fraction` timestamp as printed by `perf script`.
pub fn parse_timestamp(s: &str) -> Option<TimeNs> {
    match s.split_once('.') {
        Some((secs, frac)) if !frac.is_empty() && frac.bytes().all(|b| b.is_ascii_digit()) => {
            timestamp(secs, frac)
        }
        Some(_) => None,
        None => timestamp(s, "0"),
    }
}

/// Parses one line. Blank lines and `#` comments yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<TraceRecord>, RecordError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let caps = HEADER_RE
        .captures(line)
        .ok_or_else(|| RecordError::Malformed(trimmed.to_string()))?;
    let malformed = || RecordError::Malformed(trimmed.to_string());

    let ts = timestamp(&caps["secs"], &caps["frac"]).ok_or_else(malformed)?;
    let header = EventHeader {
        ts,
        cpu: CpuId(caps["cpu"].parse().map_err(|_| malformed())?),
        pid: Pid(caps["pid"].parse().map_err(|_| malformed())?),
        comm: caps["comm"].trim().to_string(),
    };

    let full_name = caps.name("event").map_or("", |m| m.as_str());
    let name = full_name.rsplit(':').next().unwrap_or(full_name);
    let fields = Fields::parse(name, caps.name("fields").map_or("", |m| m.as_str()));

    let event = match name {
        "sched_switch" => SchedEvent::Switch {
            prev_comm: fields.str("prev_comm")?.to_string(),
            prev_pid: fields.pid("prev_pid")?,
            prev_prio: fields.num("prev_prio")?,
            prev_state: TaskState::parse(fields.str("prev_state")?),
            next_comm: fields.str("next_comm")?.to_string(),
            next_pid: fields.pid("next_pid")?,
            next_prio: fields.num("next_prio")?,
        },
        "sched_migrate_task" => SchedEvent::MigrateTask {
            comm: fields.str("comm")?.to_string(),
            pid: fields.pid("pid")?,
            prio: fields.num("prio")?,
            orig_cpu: fields.cpu("orig_cpu")?,
            dest_cpu: fields.cpu("dest_cpu")?,
        },
        "sched_wakeup" | "sched_wakeup_new" => SchedEvent::Wakeup {
            comm: fields.str("comm")?.to_string(),
            pid: fields.pid("pid")?,
            prio: fields.num("prio")?,
            // Kernels since 4.x no longer report failed wakeups at all.
            success: if fields.map.contains_key("success") {
                fields.num::<u32>("success")? != 0
            } else {
                true
            },
            target_cpu: fields.cpu("target_cpu")?,
            fork: name == "sched_wakeup_new",
        },
        other => SchedEvent::Other {
            name: other.to_string(),
        },
    };

    Ok(Some(TraceRecord { header, event }))
}

/// Reads every record from `reader`.
///
/// With `skip_malformed`, lines that fail to parse are logged and skipped;
/// otherwise the first one aborts with its line number.
pub fn read_trace<R: BufRead>(reader: R, skip_malformed: bool) -> Result<Vec<TraceRecord>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.with_context(|| format!("Failed to read trace line {}", lineno))?;
        match parse_line(&line) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) if skip_malformed => warn!("skipping line {}: {}", lineno, e),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to parse trace line {}", lineno))
            }
        }
    }
    Ok(records)
}
