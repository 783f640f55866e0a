//
// Licensed under the GNU General Public License v3.0 or later
//

// src/main.rs
//
// ioforge - flexible storage-I/O workload generator and benchmarking
// harness. This binary wires the configuration core together: command
// line and job files feed the option schema, the job builder populates
// the shared worker table, and the provisioning pass equips every worker
// with buffers and random state before the I/O loop takes over.

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ioforge::constants::MAX_JOBS;
use ioforge::{cli, ini, memory, random, HarnessContext};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ioforge=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run() {
        eprintln!("ioforge: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut ctx = HarnessContext::new(MAX_JOBS)?;

    let job_files = cli::parse_cmd_line(&mut ctx, std::env::args())?;

    for (i, file) in job_files.iter().enumerate() {
        // Each job file starts from fresh defaults; files after the first
        // are separated by an implicit stonewall.
        ctx.fill_defaults()?;
        let dropped = ini::parse_jobs_file(&mut ctx, file, i > 0)?;
        if dropped > 0 {
            info!(file = %file.display(), dropped, "job file had dropped sections");
        }
    }

    if ctx.table.is_empty() {
        bail!("no jobs defined");
    }

    // Provisioning pass, just before workers begin: the pinned region,
    // each worker's buffer, and the random streams.
    let _pinned = memory::pin_memory(ctx.globals.lock_mem)?;

    let mut buffers = Vec::with_capacity(ctx.table.len());
    for idx in 0..ctx.table.len() {
        {
            let w = ctx.table.get_mut(idx);
            if w.orig_buffer_size == 0 {
                w.orig_buffer_size = memory::io_buffer_size(w);
            }
        }
        random::init_random_state(ctx.table.get_mut(idx))?;
        buffers.push(memory::allocate_io_mem(ctx.table.get(idx))?);
    }

    let groups = ctx.group_id + 1;
    info!(
        workers = ctx.table.len(),
        groups,
        locked_bytes = ctx.globals.lock_mem,
        "job population ready"
    );

    // Handoff point: the I/O submission loop consumes the worker table,
    // the buffer regions, and the pinned region from here.
    drop(buffers);
    Ok(())
}
