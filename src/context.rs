// src/context.rs
//
// The harness context: the process-wide state of a run (defaults
// descriptor, worker table, group counter, output streams, terse flag,
// global directives), threaded through the readers and the job builder.

use anyhow::{anyhow, Context as _, Result};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::options;
use crate::table::WorkerTable;
use crate::worker::Worker;

/// Process-wide directives options can raise from any section.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalDirectives {
    pub exitall_on_terminate: bool,
    pub lock_mem: u64,
}

/// Which descriptor an option line targets: the defaults sentinel or a
/// slot in the worker table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobHandle {
    Defaults,
    Slot(usize),
}

/// Output sink. With `--output` both the summary stream and the error
/// stream are redirected to the file.
#[derive(Debug, Default)]
pub struct Output {
    file: Option<File>,
}

impl Output {
    pub fn redirect_to(&mut self, path: &Path) -> Result<()> {
        let f = File::create(path)
            .with_context(|| format!("cannot open output file {}", path.display()))?;
        self.file = Some(f);
        Ok(())
    }

    pub fn line(&mut self, msg: &str) {
        match &mut self.file {
            Some(f) => {
                let _ = writeln!(f, "{}", msg);
            }
            None => println!("{}", msg),
        }
    }

    pub fn err_line(&mut self, msg: &str) {
        match &mut self.file {
            Some(f) => {
                let _ = writeln!(f, "{}", msg);
            }
            None => eprintln!("{}", msg),
        }
    }
}

pub struct HarnessContext {
    pub table: WorkerTable,
    pub defaults: Worker,
    pub globals: GlobalDirectives,
    /// Monotonically non-decreasing; advanced by stonewall commits.
    pub group_id: u32,
    pub terse: bool,
    pub output: Output,

    // Harness-level defaults folded into the defaults descriptor on each
    // fill (so they apply to every job file).
    pub def_timeout: u64,
    pub def_bw_log: bool,
    pub def_lat_log: bool,
}

impl HarnessContext {
    pub fn new(max_jobs: usize) -> Result<Self> {
        let mut ctx = Self {
            table: WorkerTable::new(max_jobs)?,
            defaults: Worker::default(),
            globals: GlobalDirectives::default(),
            group_id: 0,
            terse: false,
            output: Output::default(),
            def_timeout: 0,
            def_bw_log: false,
            def_lat_log: false,
        };
        ctx.fill_defaults()?;
        Ok(ctx)
    }

    /// Reset the defaults descriptor from the option schema. Run once at
    /// startup and again before each job file.
    pub fn fill_defaults(&mut self) -> Result<()> {
        self.defaults = Worker::default();
        options::fill_defaults(&mut self.defaults, &mut self.globals)?;

        self.defaults.cpumask = current_affinity_mask()?;
        self.defaults.timeout = self.def_timeout;
        self.defaults.write_bw_log = self.def_bw_log;
        self.defaults.write_lat_log = self.def_lat_log;
        Ok(())
    }

    /// Hand out a descriptor: the defaults sentinel for the `global`
    /// section, otherwise the next free table slot seeded from defaults.
    pub fn get_new_job(&mut self, global: bool) -> Result<JobHandle> {
        if global {
            return Ok(JobHandle::Defaults);
        }
        self.table
            .acquire(&self.defaults)
            .map(JobHandle::Slot)
            .ok_or_else(|| anyhow!("worker table full ({} jobs)", self.table.max_jobs()))
    }

    /// Return a descriptor unused. The defaults sentinel is never
    /// released.
    pub fn put_job(&mut self, handle: JobHandle) {
        if let JobHandle::Slot(idx) = handle {
            self.table.release(idx);
        }
    }

    pub fn worker(&self, handle: JobHandle) -> &Worker {
        match handle {
            JobHandle::Defaults => &self.defaults,
            JobHandle::Slot(idx) => self.table.get(idx),
        }
    }

    pub fn worker_mut(&mut self, handle: JobHandle) -> &mut Worker {
        match handle {
            JobHandle::Defaults => &mut self.defaults,
            JobHandle::Slot(idx) => self.table.get_mut(idx),
        }
    }

    /// Dispatch one option line at the descriptor behind `handle`.
    pub fn apply_option_line(&mut self, handle: JobHandle, line: &str) -> Result<()> {
        match handle {
            JobHandle::Defaults => {
                options::parse_option_line(&mut self.defaults, &mut self.globals, line)
            }
            JobHandle::Slot(idx) => {
                options::parse_option_line(self.table.get_mut(idx), &mut self.globals, line)
            }
        }
    }

    /// Emit a user-visible error line with the stable prefix.
    pub fn log_err(&mut self, msg: &str) {
        self.output.err_line(&format!("ioforge: {}", msg));
    }

    /// Emit a user-visible summary line.
    pub fn log_out(&mut self, msg: &str) {
        self.output.line(msg);
    }
}

/// Affinity mask of the current process, packed into the low 64 CPUs.
fn current_affinity_mask() -> Result<u64> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("sched_getaffinity");
    }

    let mut mask = 0u64;
    for cpu in 0..64 {
        if unsafe { libc::CPU_ISSET(cpu, &set) } {
            mask |= 1 << cpu;
        }
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_handle_is_never_released() {
        let mut ctx = HarnessContext::new(4).unwrap();
        let h = ctx.get_new_job(true).unwrap();
        assert_eq!(h, JobHandle::Defaults);
        ctx.put_job(h);
        // Defaults survive and still carry schema values.
        assert_eq!(ctx.defaults.bs, [4096, 4096]);
    }

    #[test]
    fn test_slot_acquisition_clones_defaults() {
        let mut ctx = HarnessContext::new(4).unwrap();
        ctx.apply_option_line(JobHandle::Defaults, "iodepth=8").unwrap();

        let h = ctx.get_new_job(false).unwrap();
        assert_eq!(ctx.worker(h).iodepth, 8);
        assert_eq!(ctx.worker(h).thread_number, 1);
    }

    #[test]
    fn test_table_full_error() {
        let mut ctx = HarnessContext::new(1).unwrap();
        ctx.get_new_job(false).unwrap();
        let err = ctx.get_new_job(false).unwrap_err();
        assert!(err.to_string().contains("full"));
    }

    #[test]
    fn test_affinity_mask_nonzero() {
        assert_ne!(current_affinity_mask().unwrap(), 0);
    }
}
