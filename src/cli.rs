// src/cli.rs
//
// Command-line reader. A small fixed set of long flags targets harness
// state; every option-schema name is merged into the same command at
// startup and accepted as `--name=value`. Seeing `--name=` begins an
// implicit new job: the in-progress worker is committed first. Trailing
// non-option arguments are job-file paths.

use anyhow::{anyhow, Context as _, Result};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use tracing::debug;

use crate::builder::add_job;
use crate::context::{HarnessContext, JobHandle};
use crate::options::{show_cmd_help, SCHEMA};

/// Flags that target the harness itself. A schema option with one of
/// these names stays reachable from job files only, harness flag wins.
const HARNESS_FLAGS: &[&str] = &[
    "output",
    "timeout",
    "latency-log",
    "bandwidth-log",
    "minimal",
    "version",
    "help",
    "cmdhelp",
];

/// Build the long-option table: harness flags first, then every job
/// option from the schema so job files and the command line stay in sync.
fn build_command() -> Command {
    let mut cmd = Command::new("ioforge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Flexible storage-I/O workload generator and benchmarking harness")
        .arg(
            Arg::new("output")
                .long("output")
                .value_name("PATH")
                .help("Write output to file"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SEC")
                .help("Runtime in seconds"),
        )
        .arg(
            Arg::new("latency-log")
                .long("latency-log")
                .action(ArgAction::SetTrue)
                .help("Generate per-job latency logs"),
        )
        .arg(
            Arg::new("bandwidth-log")
                .long("bandwidth-log")
                .action(ArgAction::SetTrue)
                .help("Generate per-job bandwidth logs"),
        )
        .arg(
            Arg::new("minimal")
                .long("minimal")
                .action(ArgAction::SetTrue)
                .help("Minimal (terse) output"),
        )
        .arg(
            Arg::new("cmdhelp")
                .long("cmdhelp")
                .value_name("CMD")
                .help("Print command help, \"all\" for all of them"),
        )
        .arg(
            Arg::new("jobfile")
                .value_name("JOBFILE")
                .num_args(0..)
                .help("Job files to run"),
        );

    for spec in SCHEMA {
        if HARNESS_FLAGS.contains(&spec.name) {
            continue;
        }

        let mut arg = Arg::new(spec.name)
            .long(spec.name)
            .action(ArgAction::Append)
            .help(spec.help);
        arg = if spec.kind.takes_value() {
            arg.value_name("VALUE").num_args(1)
        } else {
            arg.num_args(0..=1).require_equals(true).default_missing_value("")
        };
        cmd = cmd.arg(arg);
    }

    cmd
}

/// Commit the in-progress CLI worker under its own name.
fn commit_pending(ctx: &mut HarnessContext, handle: JobHandle) -> Result<()> {
    let jobname = ctx
        .worker(handle)
        .name
        .clone()
        .unwrap_or_else(|| "ioforge".to_string());
    add_job(ctx, handle, &jobname, 0)
}

/// Parse the command line into the harness context. Returns the job-file
/// paths collected from trailing arguments.
pub fn parse_cmd_line<I, T>(ctx: &mut HarnessContext, argv: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = match build_command().try_get_matches_from(argv) {
        Ok(m) => m,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => return Err(anyhow!(e.to_string())),
    };

    // Harness flags first, then refill defaults so command-line jobs
    // inherit the timeout and log toggles the same way job files do.
    if let Some(path) = matches.get_one::<String>("output") {
        ctx.output.redirect_to(std::path::Path::new(path))?;
    }
    if let Some(secs) = matches.get_one::<String>("timeout") {
        ctx.def_timeout = secs.parse().context("--timeout takes seconds")?;
    }
    ctx.def_lat_log = matches.get_flag("latency-log");
    ctx.def_bw_log = matches.get_flag("bandwidth-log");
    ctx.terse = matches.get_flag("minimal");
    ctx.fill_defaults()?;

    if let Some(name) = matches.get_one::<String>("cmdhelp") {
        let ok = show_cmd_help(name, &mut std::io::stdout().lock()).is_ok();
        std::process::exit(if ok { 0 } else { 1 });
    }

    // Recover argv order across all schema options so `--name=` opens a
    // new job exactly where the user wrote it.
    let mut events: Vec<(usize, &'static str, String)> = Vec::new();
    for spec in SCHEMA {
        if HARNESS_FLAGS.contains(&spec.name) {
            continue;
        }
        let Some(indices) = matches.indices_of(spec.name) else {
            continue;
        };
        let values = matches
            .get_many::<String>(spec.name)
            .expect("indices imply values");
        for (i, v) in indices.zip(values) {
            events.push((i, spec.name, v.clone()));
        }
    }
    events.sort_by_key(|e| e.0);

    let mut current: Option<JobHandle> = None;
    for (_, key, value) in events {
        if key == "name" {
            if let Some(handle) = current.take() {
                commit_pending(ctx, handle)?;
            }
        }

        let handle = match current {
            Some(h) => h,
            None => {
                let global = key == "name" && value.starts_with("global");
                let h = ctx.get_new_job(global)?;
                debug!(?h, "command line opened job");
                current = Some(h);
                h
            }
        };

        let line = if value.is_empty() {
            key.to_string()
        } else {
            format!("{}={}", key, value)
        };
        if let Err(e) = ctx.apply_option_line(handle, &line) {
            ctx.log_err(&format!("{}", e));
            ctx.log_err("job dropped");
            ctx.put_job(handle);
            current = None;
        }
    }

    if let Some(handle) = current.take() {
        commit_pending(ctx, handle)?;
    }

    Ok(matches
        .get_many::<String>("jobfile")
        .map(|vals| vals.map(PathBuf::from).collect())
        .unwrap_or_default())
}
