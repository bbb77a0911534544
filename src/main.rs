// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs::File;
use std::io;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::filter::EnvFilter;

use scx_rqtrace::{
    parse_timestamp, read_trace, Config, CpuDetail, CpuId, DispatchStats, EventDispatcher, FmtTs,
    FmtUs, TimeNs, TimeSliceList, TraceRecord,
};

/// scx_rqtrace: rebuild per-CPU runqueue history from scheduler traces.
///
/// Feed it the output of
/// `perf record -e 'sched:sched_switch,sched:sched_migrate_task,sched:sched_wakeup*'`
/// piped through `perf script`. It reconstructs which tasks were queued on
/// every CPU over time and reports on the result.
#[derive(Debug, Parser)]
struct Opts {
    /// Trace text produced by `perf script`, or `-` for stdin.
    #[clap(required_unless_present = "version")]
    trace: Option<PathBuf>,

    /// Config file. Defaults to $XDG_CONFIG_HOME/scx_rqtrace/scx_rqtrace.toml.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Specify the logging level. Accepts rust's envfilter syntax for modular
    /// logging: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#example-syntax. Examples: ["info", "warn,scx_rqtrace=debug"]
    #[clap(long)]
    log_level: Option<String>,

    /// Skip trace lines that cannot be parsed instead of failing.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    skip_malformed: bool,

    /// Number of trace inconsistencies to log before only counting them.
    #[clap(long)]
    max_inconsistency_reports: Option<usize>,

    /// Show the runqueue of this CPU. Requires --at.
    #[clap(long, requires = "at")]
    cpu: Option<u32>,

    /// Timestamp to inspect, in seconds as printed by perf (e.g. 5123.000456).
    #[clap(long, requires = "cpu")]
    at: Option<String>,

    /// List per-CPU loads of every slice overlapping [FROM, TO], in seconds.
    #[clap(long, num_args = 2, value_names = ["FROM", "TO"])]
    zones: Option<Vec<String>>,

    /// Print the results as JSON.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Print version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

#[derive(Serialize)]
struct Report {
    stats: DispatchStats,
    interval: (TimeNs, TimeNs),
    #[serde(skip_serializing_if = "Option::is_none")]
    inspect: Option<CpuDetail>,
}

fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| match EnvFilter::try_new(log_level) {
            Ok(filter) => Ok(filter),
            Err(e) => {
                eprintln!(
                    "invalid log envvar: {}, using info, err is: {}",
                    log_level, e
                );
                EnvFilter::try_new("info")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(io::stderr)
        .try_init()
    {
        Ok(()) => {}
        Err(e) => eprintln!("failed to init logger: {}", e),
    }
}

fn load_records(opts: &Opts, skip_malformed: bool) -> Result<Vec<TraceRecord>> {
    let Some(path) = &opts.trace else {
        bail!("No trace given");
    };
    if path.as_os_str() == "-" {
        return read_trace(io::stdin().lock(), skip_malformed);
    }
    let file =
        File::open(path).with_context(|| format!("Failed to open trace {}", path.display()))?;
    read_trace(BufReader::new(file), skip_malformed)
}

fn parse_secs(s: &str) -> Result<TimeNs> {
    match parse_timestamp(s) {
        Some(ts) => Ok(ts),
        None => bail!("Invalid timestamp {:?}, expected seconds like 5123.000456", s),
    }
}

fn print_zones(slices: &TimeSliceList, start: TimeNs, end: TimeNs) {
    let mut last_start = None;
    slices.fill_zone(start, end, |cell| {
        if last_start != Some(cell.start) {
            println!("{} +{}", FmtTs(cell.start), FmtUs(cell.end - cell.start));
            last_start = Some(cell.start);
        }
        let marker = match cell.top_color {
            Some(_) => "*",
            None => " ",
        };
        println!(
            "  {}cpu{:<3} load={:<3} share={:5.1}%",
            marker,
            cell.cpu,
            cell.load,
            cell.load_ratio * 100.0
        );
    });
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("scx_rqtrace {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load(opts.config.as_deref())?;
    if let Some(log_level) = &opts.log_level {
        config.set_log_level(log_level.clone());
    }
    if opts.skip_malformed {
        config.set_skip_malformed(true);
    }
    if let Some(max) = opts.max_inconsistency_reports {
        config.set_max_inconsistency_reports(max);
    }

    init_logging(config.log_level());
    debug!("opts={:?}", &opts);
    debug!("config={:?}", &config);

    let records = load_records(&opts, config.skip_malformed())?;
    info!("read {} trace records", records.len());

    let mut dispatcher =
        EventDispatcher::new().with_max_inconsistency_reports(config.max_inconsistency_reports());
    dispatcher.ingest_all(&records);

    let inspect = match (opts.cpu, &opts.at) {
        (Some(cpu), Some(at)) => {
            let ts = parse_secs(at)?;
            let detail = dispatcher.inspect(CpuId(cpu), ts);
            if detail.is_none() {
                info!("cpu {} has no recorded state at {}", cpu, FmtTs(ts));
            }
            detail
        }
        _ => None,
    };

    let report = Report {
        stats: dispatcher.stats(),
        interval: dispatcher.timeslices().interval(),
        inspect,
    };

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.stats);
        println!(
            "  interval:         {} - {}",
            FmtTs(report.interval.0),
            FmtTs(report.interval.1)
        );
        if let Some(detail) = &report.inspect {
            println!();
            print!("{}", detail);
        }
    }

    if let Some(zones) = &opts.zones {
        let (start, end) = match zones.as_slice() {
            [from, to] => (parse_secs(from)?, parse_secs(to)?),
            _ => bail!("--zones takes FROM and TO"),
        };
        print_zones(dispatcher.timeslices(), start, end);
    }

    Ok(())
}
