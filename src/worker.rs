// src/worker.rs
//
// The worker descriptor: one fully-parameterized workload, as produced by
// the option parsers and finished by the job builder. A sentinel instance
// (the defaults descriptor) carries global-section defaults and is never
// committed to the worker table.

use crate::engine::EngineHandle;
use crate::random::RandState;

/// Direction a workload drives I/O in. Mixed workloads keep `Read` here and
/// set `iomix` on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    #[default]
    Read,
    Write,
}

impl DataDirection {
    /// Array index for the per-direction option slots (`bs`, stat floors).
    pub const READ: usize = 0;
    pub const WRITE: usize = 1;
}

/// Classification of the job target, from stat(2) on the section name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    #[default]
    File,
    BlockDevice,
    CharDevice,
}

/// Buffer ownership regime for the worker's I/O region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemKind {
    #[default]
    Malloc,
    Shm,
    ShmHuge,
    Mmap,
    MmapHuge,
}

/// Data verification applied by the I/O loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyKind {
    #[default]
    None,
    Md5,
    Crc32,
}

/// Minimum/maximum tracker seeded so the first observation strictly lowers
/// the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStat {
    pub min_val: u64,
    pub max_val: u64,
    pub samples: u64,
}

impl Default for IoStat {
    fn default() -> Self {
        Self { min_val: u64::MAX, max_val: 0, samples: 0 }
    }
}

/// One sample in a latency or bandwidth log.
#[derive(Debug, Clone, Copy)]
pub struct LogSample {
    pub msec: u64,
    pub value: u64,
}

/// Growable sample log, allocated by the builder when requested.
#[derive(Debug, Clone, Default)]
pub struct IoLog {
    pub samples: Vec<LogSample>,
}

/// One file in the worker's file set.
#[derive(Debug, Clone)]
pub struct JobFile {
    pub fd: i32,
    pub file_name: String,
    pub file_size: u64,
    pub file_offset: u64,
    /// Block-coverage bit array, lazily built for random workloads unless
    /// `norandommap` is set. One bit per `rw_min_bs` block, packed into
    /// `BLOCKS_PER_MAP`-bit words.
    pub file_map: Option<Vec<u64>>,
}

impl JobFile {
    pub fn new(file_name: String) -> Self {
        Self { fd: -1, file_name, file_size: 0, file_offset: 0, file_map: None }
    }
}

/// A single configured workload with its parameters, file set, and backend
/// handle. Cloned from the defaults descriptor at section entry and cloned
/// again per `numjobs` replica.
#[derive(Debug, Clone, Default)]
pub struct Worker {
    // Identity.
    pub name: Option<String>,
    /// 1-based slot index in the worker table; 0 for the defaults
    /// descriptor.
    pub thread_number: u32,
    pub groupid: u32,

    // Targets.
    pub directory: Option<String>,
    pub filename: Option<String>,
    pub nr_files: u32,
    pub nr_uniq_files: u32,
    pub total_file_size: u64,
    pub start_offset: u64,
    pub filetype: FileType,
    pub files: Vec<JobFile>,

    // Workload shape.
    pub ddir: DataDirection,
    pub iomix: bool,
    pub sequential: bool,
    pub rwmixread: u32,
    pub rwmixwrite: u32,
    pub rwmixcycle: u32,
    pub zone_size: u64,
    pub zone_skip: u64,
    pub bs: [u64; 2],
    pub min_bs: [u64; 2],
    pub max_bs: [u64; 2],
    pub rw_min_bs: u64,
    pub bs_unaligned: bool,

    // Rate control.
    pub rate: u32,
    pub ratemin: u32,
    pub ratecycle: u32,
    pub bw_avg_time: u32,
    pub rate_usec_cycle: u64,
    pub rate_pending_usleep: i64,
    pub start_delay: u64,
    pub thinktime: u32,
    pub thinktime_blocks: u32,
    pub loops: u32,
    pub timeout: u64,

    // I/O policy.
    pub engine: Option<EngineHandle>,
    pub iodepth: u32,
    pub sync_io: bool,
    pub odirect: bool,
    pub overwrite: bool,
    pub invalidate_cache: bool,
    pub fsync_blocks: u32,
    pub create_fsync: bool,
    pub end_fsync: bool,
    pub create_serialize: bool,
    pub unlink: bool,

    // Memory.
    pub mem_type: MemKind,
    pub mmapfile: Option<String>,
    pub hugepage_size: u64,
    pub orig_buffer_size: u64,

    // Scheduling hints.
    pub cpumask: u64,
    pub nice: i32,
    pub ioprio: u32,
    pub cpuload: u32,
    pub cpucycle: u32,
    pub use_thread: bool,

    // Verification.
    pub verify: VerifyKind,
    pub norandommap: bool,
    pub rand_repeatable: bool,

    // Barriers and replication.
    pub stonewall: bool,
    pub numjobs: u32,

    // Logging and hooks.
    pub write_bw_log: bool,
    pub write_lat_log: bool,
    pub bw_log: Option<IoLog>,
    pub slat_log: Option<IoLog>,
    pub clat_log: Option<IoLog>,
    pub read_iolog_file: Option<String>,
    pub write_iolog_file: Option<String>,
    pub exec_prerun: Option<String>,
    pub exec_postrun: Option<String>,

    // Statistics floors, per direction.
    pub slat_stat: [IoStat; 2],
    pub clat_stat: [IoStat; 2],
    pub bw_stat: [IoStat; 2],

    // Random streams, seeded after the table is final.
    pub rand: Option<RandState>,
}

impl Worker {
    /// True when the workload issues reads (pure read or mixed).
    pub fn reads(&self) -> bool {
        self.ddir == DataDirection::Read || self.iomix
    }

    /// True when the workload issues writes (pure write or mixed).
    pub fn writes(&self) -> bool {
        self.ddir == DataDirection::Write || self.iomix
    }

    /// The `rw=` spelling for this worker's shape, used in summary lines
    /// and round-trip serialization.
    pub fn rw_name(&self) -> &'static str {
        match (self.iomix, self.sequential, self.ddir) {
            (true, true, _) => "rw",
            (true, false, _) => "randrw",
            (false, true, DataDirection::Read) => "read",
            (false, true, DataDirection::Write) => "write",
            (false, false, DataDirection::Read) => "randread",
            (false, false, DataDirection::Write) => "randwrite",
        }
    }

    /// The `mem=` spelling, including the mapping-file suffix when one is
    /// configured.
    pub fn mem_name(&self) -> String {
        match self.mem_type {
            MemKind::Malloc => "malloc".to_string(),
            MemKind::Shm => "shm".to_string(),
            MemKind::ShmHuge => "shmhuge".to_string(),
            MemKind::Mmap => match &self.mmapfile {
                Some(f) => format!("mmap:{}", f),
                None => "mmap".to_string(),
            },
            MemKind::MmapHuge => match &self.mmapfile {
                Some(f) => format!("mmaphuge:{}", f),
                None => "mmaphuge".to_string(),
            },
        }
    }

    /// The `verify=` spelling.
    pub fn verify_name(&self) -> &'static str {
        match self.verify {
            VerifyKind::None => "0",
            VerifyKind::Md5 => "md5",
            VerifyKind::Crc32 => "crc32",
        }
    }

    /// Reset the statistics floors so the first observation lowers them.
    pub fn init_stat_floors(&mut self) {
        self.slat_stat = [IoStat::default(); 2];
        self.clat_stat = [IoStat::default(); 2];
        self.bw_stat = [IoStat::default(); 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rw_name_covers_all_shapes() {
        let mut w = Worker::default();

        w.sequential = true;
        assert_eq!(w.rw_name(), "read");

        w.ddir = DataDirection::Write;
        assert_eq!(w.rw_name(), "write");

        w.sequential = false;
        assert_eq!(w.rw_name(), "randwrite");

        w.ddir = DataDirection::Read;
        assert_eq!(w.rw_name(), "randread");

        w.iomix = true;
        assert_eq!(w.rw_name(), "randrw");

        w.sequential = true;
        assert_eq!(w.rw_name(), "rw");
    }

    #[test]
    fn test_stat_floor_sentinel() {
        let mut w = Worker::default();
        w.init_stat_floors();
        for d in [DataDirection::READ, DataDirection::WRITE] {
            assert_eq!(w.slat_stat[d].min_val, u64::MAX);
            assert_eq!(w.clat_stat[d].min_val, u64::MAX);
            assert_eq!(w.bw_stat[d].min_val, u64::MAX);
        }
    }

    #[test]
    fn test_mem_name_with_mapping_file() {
        let mut w = Worker::default();
        w.mem_type = MemKind::Mmap;
        w.mmapfile = Some("/tmp/backing".to_string());
        assert_eq!(w.mem_name(), "mmap:/tmp/backing");
    }

    #[test]
    fn test_direction_predicates() {
        let mut w = Worker::default();
        assert!(w.reads() && !w.writes());

        w.iomix = true;
        assert!(w.reads() && w.writes());

        w.iomix = false;
        w.ddir = DataDirection::Write;
        assert!(!w.reads() && w.writes());
    }
}
