// src/options.rs
//
// The option schema registry: one static table describing every recognized
// job option, consumed by both the INI reader and the CLI reader. Each
// entry names its typed kind, destination fields, default, bounds, and
// accepted values; adding an option is one new table entry.

use anyhow::{anyhow, bail, Result};
use std::fmt::Write as _;
use std::io::Write as _;
use tracing::warn;

use crate::context::GlobalDirectives;
use crate::engine::{engine_names, load_engine};
use crate::size_parser::{parse_range, parse_size, parse_time};
use crate::worker::{DataDirection, MemKind, VerifyKind, Worker};

const IOPRIO_CLASS_SHIFT: u32 = 13;

/// Tagged destination field inside the worker descriptor; schema entries
/// reach their storage through this checked write-through dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Directory,
    Filename,
    ReadIolog,
    WriteIolog,
    ExecPrerun,
    ExecPostrun,
    TotalFileSize,
    StartOffset,
    ZoneSize,
    ZoneSkip,
    HugepageSize,
    BsRead,
    BsWrite,
    MinBsRead,
    MaxBsRead,
    MinBsWrite,
    MaxBsWrite,
    Timeout,
    RandRepeat,
    NrFiles,
    Iodepth,
    FsyncBlocks,
    RwMixCycle,
    RwMixRead,
    RwMixWrite,
    Nice,
    Thinktime,
    ThinktimeBlocks,
    Rate,
    RateMin,
    RateCycle,
    BwAvgTime,
    StartDelay,
    Invalidate,
    SyncIo,
    CreateSerialize,
    CreateFsync,
    Loops,
    NumJobs,
    CpuLoad,
    CpuChunks,
    Direct,
    Overwrite,
    EndFsync,
    Unlink,
    Stonewall,
    Thread,
    WriteBwLog,
    WriteLatLog,
    NoRandomMap,
    BsUnaligned,
}

impl Field {
    fn set_str(self, w: &mut Worker, val: &str) {
        let owned = Some(val.to_string());
        match self {
            Field::Name => w.name = owned,
            Field::Directory => w.directory = owned,
            Field::Filename => w.filename = owned,
            Field::ReadIolog => w.read_iolog_file = owned,
            Field::WriteIolog => w.write_iolog_file = owned,
            Field::ExecPrerun => w.exec_prerun = owned,
            Field::ExecPostrun => w.exec_postrun = owned,
            _ => unreachable!("string write to non-string field {:?}", self),
        }
    }

    fn get_str(self, w: &Worker) -> Option<String> {
        match self {
            Field::Name => w.name.clone(),
            Field::Directory => w.directory.clone(),
            Field::Filename => w.filename.clone(),
            Field::ReadIolog => w.read_iolog_file.clone(),
            Field::WriteIolog => w.write_iolog_file.clone(),
            Field::ExecPrerun => w.exec_prerun.clone(),
            Field::ExecPostrun => w.exec_postrun.clone(),
            _ => unreachable!("string read from non-string field {:?}", self),
        }
    }

    fn set_u64(self, w: &mut Worker, v: u64) {
        match self {
            Field::TotalFileSize => w.total_file_size = v,
            Field::StartOffset => w.start_offset = v,
            Field::ZoneSize => w.zone_size = v,
            Field::ZoneSkip => w.zone_skip = v,
            Field::HugepageSize => w.hugepage_size = v,
            Field::BsRead => w.bs[DataDirection::READ] = v,
            Field::BsWrite => w.bs[DataDirection::WRITE] = v,
            Field::MinBsRead => w.min_bs[DataDirection::READ] = v,
            Field::MaxBsRead => w.max_bs[DataDirection::READ] = v,
            Field::MinBsWrite => w.min_bs[DataDirection::WRITE] = v,
            Field::MaxBsWrite => w.max_bs[DataDirection::WRITE] = v,
            Field::Timeout => w.timeout = v,
            Field::StartDelay => w.start_delay = v,
            _ => unreachable!("u64 write to non-u64 field {:?}", self),
        }
    }

    fn get_u64(self, w: &Worker) -> u64 {
        match self {
            Field::TotalFileSize => w.total_file_size,
            Field::StartOffset => w.start_offset,
            Field::ZoneSize => w.zone_size,
            Field::ZoneSkip => w.zone_skip,
            Field::HugepageSize => w.hugepage_size,
            Field::BsRead => w.bs[DataDirection::READ],
            Field::BsWrite => w.bs[DataDirection::WRITE],
            Field::MinBsRead => w.min_bs[DataDirection::READ],
            Field::MaxBsRead => w.max_bs[DataDirection::READ],
            Field::MinBsWrite => w.min_bs[DataDirection::WRITE],
            Field::MaxBsWrite => w.max_bs[DataDirection::WRITE],
            Field::Timeout => w.timeout,
            Field::StartDelay => w.start_delay,
            _ => unreachable!("u64 read from non-u64 field {:?}", self),
        }
    }

    fn set_int(self, w: &mut Worker, v: i64) {
        match self {
            Field::RandRepeat => w.rand_repeatable = v != 0,
            Field::NrFiles => w.nr_files = v as u32,
            Field::Iodepth => w.iodepth = v as u32,
            Field::FsyncBlocks => w.fsync_blocks = v as u32,
            Field::RwMixCycle => w.rwmixcycle = v as u32,
            Field::RwMixRead => w.rwmixread = v as u32,
            Field::RwMixWrite => w.rwmixwrite = v as u32,
            Field::Nice => w.nice = v as i32,
            Field::Thinktime => w.thinktime = v as u32,
            Field::ThinktimeBlocks => w.thinktime_blocks = v as u32,
            Field::Rate => w.rate = v as u32,
            Field::RateMin => w.ratemin = v as u32,
            Field::RateCycle => w.ratecycle = v as u32,
            Field::BwAvgTime => w.bw_avg_time = v as u32,
            Field::Invalidate => w.invalidate_cache = v != 0,
            Field::SyncIo => w.sync_io = v != 0,
            Field::CreateSerialize => w.create_serialize = v != 0,
            Field::CreateFsync => w.create_fsync = v != 0,
            Field::Loops => w.loops = v as u32,
            Field::NumJobs => w.numjobs = v as u32,
            Field::CpuLoad => w.cpuload = v as u32,
            Field::CpuChunks => w.cpucycle = v as u32,
            Field::Direct => w.odirect = v != 0,
            Field::Overwrite => w.overwrite = v != 0,
            Field::EndFsync => w.end_fsync = v != 0,
            Field::Unlink => w.unlink = v != 0,
            _ => unreachable!("int write to non-int field {:?}", self),
        }
    }

    fn get_int(self, w: &Worker) -> i64 {
        match self {
            Field::RandRepeat => w.rand_repeatable as i64,
            Field::NrFiles => w.nr_files as i64,
            Field::Iodepth => w.iodepth as i64,
            Field::FsyncBlocks => w.fsync_blocks as i64,
            Field::RwMixCycle => w.rwmixcycle as i64,
            Field::RwMixRead => w.rwmixread as i64,
            Field::RwMixWrite => w.rwmixwrite as i64,
            Field::Nice => w.nice as i64,
            Field::Thinktime => w.thinktime as i64,
            Field::ThinktimeBlocks => w.thinktime_blocks as i64,
            Field::Rate => w.rate as i64,
            Field::RateMin => w.ratemin as i64,
            Field::RateCycle => w.ratecycle as i64,
            Field::BwAvgTime => w.bw_avg_time as i64,
            Field::Invalidate => w.invalidate_cache as i64,
            Field::SyncIo => w.sync_io as i64,
            Field::CreateSerialize => w.create_serialize as i64,
            Field::CreateFsync => w.create_fsync as i64,
            Field::Loops => w.loops as i64,
            Field::NumJobs => w.numjobs as i64,
            Field::CpuLoad => w.cpuload as i64,
            Field::CpuChunks => w.cpucycle as i64,
            Field::Direct => w.odirect as i64,
            Field::Overwrite => w.overwrite as i64,
            Field::EndFsync => w.end_fsync as i64,
            Field::Unlink => w.unlink as i64,
            _ => unreachable!("int read from non-int field {:?}", self),
        }
    }

    fn set_flag(self, w: &mut Worker) {
        match self {
            Field::Stonewall => w.stonewall = true,
            Field::Thread => w.use_thread = true,
            Field::WriteBwLog => w.write_bw_log = true,
            Field::WriteLatLog => w.write_lat_log = true,
            Field::NoRandomMap => w.norandommap = true,
            Field::BsUnaligned => w.bs_unaligned = true,
            _ => unreachable!("flag write to non-flag field {:?}", self),
        }
    }

    fn get_flag(self, w: &Worker) -> bool {
        match self {
            Field::Stonewall => w.stonewall,
            Field::Thread => w.use_thread,
            Field::WriteBwLog => w.write_bw_log,
            Field::WriteLatLog => w.write_lat_log,
            Field::NoRandomMap => w.norandommap,
            Field::BsUnaligned => w.bs_unaligned,
            _ => unreachable!("flag read from non-flag field {:?}", self),
        }
    }
}

type StrCb = fn(&mut Worker, &str) -> Result<()>;
type ValCb = fn(&mut GlobalDirectives, u64) -> Result<()>;
type IntCb = fn(&mut Worker, i64) -> Result<()>;
type SetCb = fn(&mut GlobalDirectives) -> Result<()>;

/// Typed parsing kind for one option. Destination fields are written
/// through [`Field`]; custom callbacks replace the write-through path.
#[derive(Clone, Copy)]
pub enum OptKind {
    /// Free string, duplicated into the descriptor.
    StrStore(Field),
    /// Enumerated string handled by a custom parser.
    Str(StrCb),
    /// Size-valued integer written to one or two fields.
    StrVal(&'static [Field]),
    /// Size-valued integer routed to a global directive.
    StrValCb(ValCb),
    /// Time-valued integer, stored as seconds.
    StrValTime(Field),
    /// Bounded integer.
    Int(Field),
    /// Bounded integer handled by a custom sink.
    IntCb(IntCb),
    /// Four size values from the `lo:hi[,lo:hi]` grammar.
    Range([Field; 4]),
    /// Presence-only flag.
    Set(Field),
    /// Presence-only flag routed to a global directive.
    SetCb(SetCb),
}

impl OptKind {
    /// Whether the option consumes an argument on the command line.
    pub fn takes_value(&self) -> bool {
        !matches!(self, OptKind::Set(_) | OptKind::SetCb(_))
    }
}

/// One row of the option schema.
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptKind,
    pub help: &'static str,
    pub def: Option<&'static str>,
    pub minval: Option<i64>,
    pub maxval: Option<i64>,
    pub posval: &'static [&'static str],
}

macro_rules! opt {
    ($name:expr, $kind:expr, $help:expr) => {
        opt!($name, $kind, $help, def: None, min: None, max: None, posval: &[])
    };
    ($name:expr, $kind:expr, $help:expr, def: $def:expr) => {
        opt!($name, $kind, $help, def: $def, min: None, max: None, posval: &[])
    };
    ($name:expr, $kind:expr, $help:expr, def: $def:expr, posval: $posval:expr) => {
        opt!($name, $kind, $help, def: $def, min: None, max: None, posval: $posval)
    };
    ($name:expr, $kind:expr, $help:expr, def: $def:expr, min: $min:expr, max: $max:expr) => {
        opt!($name, $kind, $help, def: $def, min: $min, max: $max, posval: &[])
    };
    ($name:expr, $kind:expr, $help:expr, def: $def:expr, min: $min:expr, max: $max:expr, posval: $posval:expr) => {
        OptionSpec {
            name: $name,
            kind: $kind,
            help: $help,
            def: $def,
            minval: $min,
            maxval: $max,
            posval: $posval,
        }
    };
}

/// Map of job/command line options. Single source of truth for both the
/// INI reader and the CLI reader.
pub static SCHEMA: &[OptionSpec] = &[
    opt!("name", OptKind::StrStore(Field::Name), "Name of this job"),
    opt!("directory", OptKind::StrStore(Field::Directory), "Directory to store files in"),
    opt!("filename", OptKind::StrStore(Field::Filename), "Force the use of a specific file"),
    opt!("rw", OptKind::Str(str_rw_cb), "IO direction",
        def: Some("read"),
        posval: &["read", "write", "randwrite", "randread", "rw", "randrw"]),
    opt!("ioengine", OptKind::Str(str_ioengine_cb), "IO engine to use",
        def: Some("sync"),
        posval: &["sync", "libaio", "posixaio", "mmap", "splice", "null", "cpuio"]),
    opt!("mem", OptKind::Str(str_mem_cb), "Backing type for IO buffers",
        def: Some("malloc"),
        posval: &["malloc", "shm", "shmhuge", "mmap", "mmaphuge"]),
    opt!("verify", OptKind::Str(str_verify_cb), "Verify sum function",
        def: Some("0"),
        posval: &["crc32", "md5"]),
    opt!("write_iolog", OptKind::StrStore(Field::WriteIolog), "Store IO pattern to file"),
    opt!("read_iolog", OptKind::StrStore(Field::ReadIolog), "Playback IO pattern from file"),
    opt!("exec_prerun", OptKind::StrStore(Field::ExecPrerun), "Execute this file prior to running job"),
    opt!("exec_postrun", OptKind::StrStore(Field::ExecPostrun), "Execute this file after running job"),
    opt!("size", OptKind::StrVal(&[Field::TotalFileSize]), "Size of device or file"),
    opt!("bs", OptKind::StrVal(&[Field::BsRead, Field::BsWrite]), "Block size unit",
        def: Some("4k")),
    opt!("offset", OptKind::StrVal(&[Field::StartOffset]), "Start IO from this offset",
        def: Some("0")),
    opt!("zonesize", OptKind::StrVal(&[Field::ZoneSize]), "Give size of an IO zone",
        def: Some("0")),
    opt!("zoneskip", OptKind::StrVal(&[Field::ZoneSkip]), "Space between IO zones",
        def: Some("0")),
    opt!("lockmem", OptKind::StrValCb(str_lockmem_cb), "Lock down this amount of memory",
        def: Some("0")),
    opt!("bsrange",
        OptKind::Range([Field::MinBsRead, Field::MaxBsRead, Field::MinBsWrite, Field::MaxBsWrite]),
        "Set block size range"),
    opt!("randrepeat", OptKind::Int(Field::RandRepeat), "Use repeatable random IO pattern",
        def: Some("1")),
    opt!("nrfiles", OptKind::Int(Field::NrFiles), "Split job workload between this number of files",
        def: Some("1")),
    opt!("iodepth", OptKind::Int(Field::Iodepth), "Amount of IO buffers to keep in flight",
        def: Some("1")),
    opt!("fsync", OptKind::Int(Field::FsyncBlocks),
        "Issue fsync for writes every given number of blocks",
        def: Some("0")),
    opt!("rwmixcycle", OptKind::Int(Field::RwMixCycle),
        "Cycle period for mixed read/write workloads (msec)",
        def: Some("500")),
    opt!("rwmixread", OptKind::Int(Field::RwMixRead),
        "Percentage of mixed workload that is reads",
        def: None, min: None, max: Some(100)),
    opt!("rwmixwrite", OptKind::Int(Field::RwMixWrite),
        "Percentage of mixed workload that is writes",
        def: None, min: None, max: Some(100)),
    opt!("nice", OptKind::Int(Field::Nice), "Set job CPU nice value",
        def: Some("0"), min: Some(-19), max: Some(20)),
    opt!("prio", OptKind::IntCb(int_prio_cb), "Set job IO priority value",
        def: None, min: Some(0), max: Some(7)),
    opt!("prioclass", OptKind::IntCb(int_prioclass_cb), "Set job IO priority class",
        def: None, min: Some(0), max: Some(3)),
    opt!("thinktime", OptKind::Int(Field::Thinktime), "Idle time between IO buffers",
        def: Some("0")),
    opt!("thinktime_blocks", OptKind::Int(Field::ThinktimeBlocks),
        "IO buffer period between 'thinktime'",
        def: Some("1")),
    opt!("rate", OptKind::Int(Field::Rate), "Set bandwidth rate"),
    opt!("ratemin", OptKind::Int(Field::RateMin), "The bottom limit accepted"),
    opt!("ratecycle", OptKind::Int(Field::RateCycle), "Window average for rate limits (msec)",
        def: Some("1000")),
    opt!("startdelay", OptKind::StrValTime(Field::StartDelay),
        "Only start job when this period has passed",
        def: Some("0")),
    opt!("timeout", OptKind::StrValTime(Field::Timeout),
        "Stop workload when this amount of time has passed",
        def: Some("0")),
    opt!("invalidate", OptKind::Int(Field::Invalidate),
        "Invalidate buffer/page cache prior to running job",
        def: Some("1")),
    opt!("sync", OptKind::Int(Field::SyncIo), "Use O_SYNC for buffered writes",
        def: Some("0")),
    opt!("bwavgtime", OptKind::Int(Field::BwAvgTime),
        "Time window over which to calculate bandwidth (msec)",
        def: Some("500")),
    opt!("create_serialize", OptKind::Int(Field::CreateSerialize),
        "Serialize creating of job files",
        def: Some("1")),
    opt!("create_fsync", OptKind::Int(Field::CreateFsync), "Fsync file after creation",
        def: Some("1")),
    opt!("loops", OptKind::Int(Field::Loops), "Number of times to run the job",
        def: Some("1")),
    opt!("numjobs", OptKind::Int(Field::NumJobs), "Duplicate this job this many times",
        def: Some("1")),
    opt!("cpuload", OptKind::Int(Field::CpuLoad), "Use this percentage of CPU"),
    opt!("cpuchunks", OptKind::Int(Field::CpuChunks), "Length of the CPU burn cycles"),
    opt!("direct", OptKind::Int(Field::Direct), "Use O_DIRECT IO",
        def: Some("1")),
    opt!("overwrite", OptKind::Int(Field::Overwrite),
        "When writing, set whether to overwrite current data",
        def: Some("0")),
    opt!("cpumask", OptKind::IntCb(int_cpumask_cb), "CPU affinity mask"),
    opt!("end_fsync", OptKind::Int(Field::EndFsync), "Include fsync at the end of job",
        def: Some("0")),
    opt!("unlink", OptKind::Int(Field::Unlink),
        "Unlink created files after job has completed",
        def: Some("1")),
    opt!("exitall", OptKind::SetCb(set_exitall_cb), "Terminate all jobs when one exits"),
    opt!("stonewall", OptKind::Set(Field::Stonewall),
        "Insert a hard barrier between this job and previous"),
    opt!("thread", OptKind::Set(Field::Thread), "Use threads instead of forks"),
    opt!("write_bw_log", OptKind::Set(Field::WriteBwLog),
        "Write log of bandwidth during run"),
    opt!("write_lat_log", OptKind::Set(Field::WriteLatLog),
        "Write log of latency during run"),
    opt!("norandommap", OptKind::Set(Field::NoRandomMap),
        "Accept potential duplicate random blocks"),
    opt!("bs_unaligned", OptKind::Set(Field::BsUnaligned),
        "Don't sector align IO buffer sizes"),
    opt!("hugepage-size", OptKind::StrVal(&[Field::HugepageSize]),
        "When using hugepages, specify size of each page",
        def: Some("4m")),
];

/// Find a schema entry by exact name.
pub fn find_option(name: &str) -> Option<&'static OptionSpec> {
    SCHEMA.iter().find(|o| o.name == name)
}

/// Longest-prefix match of `input` against a candidate table, so longer
/// spellings win over their prefixes (`randread` before `read`).
fn match_prefix<'a>(input: &str, table: &[&'a str]) -> Option<&'a str> {
    table
        .iter()
        .filter(|p| input.starts_with(**p))
        .max_by_key(|p| p.len())
        .copied()
}

fn str_rw_cb(w: &mut Worker, val: &str) -> Result<()> {
    let table = [
        "read", "write", "randread", "randwrite", "rw", "randrw", "0", "1",
    ];
    let (ddir, sequential, iomix) = match match_prefix(val, &table) {
        Some("read") | Some("0") => (DataDirection::Read, true, false),
        Some("randread") => (DataDirection::Read, false, false),
        Some("write") | Some("1") => (DataDirection::Write, true, false),
        Some("randwrite") => (DataDirection::Write, false, false),
        Some("rw") => (DataDirection::Read, true, true),
        Some("randrw") => (DataDirection::Read, false, true),
        _ => bail!("data direction: read, write, randread, randwrite, rw, randrw"),
    };

    w.ddir = ddir;
    w.sequential = sequential;
    w.iomix = iomix;
    Ok(())
}

fn str_verify_cb(w: &mut Worker, val: &str) -> Result<()> {
    w.verify = match match_prefix(val, &["0", "1", "md5", "crc32"]) {
        Some("0") => VerifyKind::None,
        Some("md5") | Some("1") => VerifyKind::Md5,
        Some("crc32") => VerifyKind::Crc32,
        _ => bail!("verify types: md5, crc32"),
    };
    Ok(())
}

/// Check if mmap/mmaphuge has a `:/path/to/file` appended and return it.
fn get_mmap_file(val: &str) -> Option<String> {
    let (_, path) = val.split_once(':')?;
    let path = path.trim();
    (!path.is_empty()).then(|| path.to_string())
}

fn str_mem_cb(w: &mut Worker, val: &str) -> Result<()> {
    let table = ["malloc", "shm", "shmhuge", "mmap", "mmaphuge"];
    match match_prefix(val, &table) {
        Some("malloc") => w.mem_type = MemKind::Malloc,
        Some("shm") => w.mem_type = MemKind::Shm,
        Some("shmhuge") => w.mem_type = MemKind::ShmHuge,
        Some("mmap") => {
            // File backing is optional here; anonymous otherwise.
            w.mmapfile = get_mmap_file(val);
            w.mem_type = MemKind::Mmap;
        }
        Some("mmaphuge") => {
            // mmaphuge must be appended with the actual file.
            w.mmapfile = get_mmap_file(val);
            if w.mmapfile.is_none() {
                bail!("mmaphuge:/path/to/file");
            }
            w.mem_type = MemKind::MmapHuge;
        }
        _ => bail!("mem type: malloc, shm, shmhuge, mmap, mmaphuge"),
    }
    Ok(())
}

fn str_ioengine_cb(w: &mut Worker, val: &str) -> Result<()> {
    w.engine = Some(load_engine(val.trim())?);
    Ok(())
}

fn str_lockmem_cb(globals: &mut GlobalDirectives, val: u64) -> Result<()> {
    globals.lock_mem = val;
    Ok(())
}

fn int_prio_cb(w: &mut Worker, val: i64) -> Result<()> {
    w.ioprio |= val as u32;
    Ok(())
}

fn int_prioclass_cb(w: &mut Worker, val: i64) -> Result<()> {
    w.ioprio |= (val as u32) << IOPRIO_CLASS_SHIFT;
    Ok(())
}

fn int_cpumask_cb(w: &mut Worker, val: i64) -> Result<()> {
    w.cpumask = val as u64;
    Ok(())
}

fn set_exitall_cb(globals: &mut GlobalDirectives) -> Result<()> {
    globals.exitall_on_terminate = true;
    Ok(())
}

/// Apply one `key` / optional-value pair to a worker through the schema.
pub fn apply_option(
    w: &mut Worker,
    globals: &mut GlobalDirectives,
    key: &str,
    value: Option<&str>,
) -> Result<()> {
    let spec = find_option(key).ok_or_else(|| anyhow!("unknown option: {}", key))?;

    let require_value = || {
        value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("option {} requires a value", key))
    };

    match spec.kind {
        OptKind::StrStore(field) => field.set_str(w, require_value()?),
        OptKind::Str(cb) => {
            cb(w, require_value()?).map_err(|e| anyhow!("{}: {}", key, e))?
        }
        OptKind::StrVal(fields) => {
            let v = parse_size(require_value()?).map_err(|e| anyhow!("{}: {}", key, e))?;
            for field in fields {
                field.set_u64(w, v);
            }
        }
        OptKind::StrValCb(cb) => {
            let v = parse_size(require_value()?).map_err(|e| anyhow!("{}: {}", key, e))?;
            cb(globals, v)?;
        }
        OptKind::StrValTime(field) => {
            let v = parse_time(require_value()?).map_err(|e| anyhow!("{}: {}", key, e))?;
            field.set_u64(w, v);
        }
        OptKind::Int(field) => {
            let v = parse_bounded_int(spec, require_value()?)?;
            field.set_int(w, v);
        }
        OptKind::IntCb(cb) => {
            let v = parse_bounded_int(spec, require_value()?)?;
            cb(w, v)?;
        }
        OptKind::Range(fields) => {
            let vals = parse_range(require_value()?).map_err(|e| anyhow!("{}: {}", key, e))?;
            for (field, v) in fields.iter().zip(vals) {
                field.set_u64(w, v);
            }
        }
        OptKind::Set(field) => field.set_flag(w),
        OptKind::SetCb(cb) => cb(globals)?,
    }

    Ok(())
}

/// Parse one trimmed `key=value` (or bare `key`) line from a job file.
pub fn parse_option_line(
    w: &mut Worker,
    globals: &mut GlobalDirectives,
    line: &str,
) -> Result<()> {
    match line.split_once('=') {
        Some((key, value)) => apply_option(w, globals, key.trim(), Some(value.trim())),
        None => apply_option(w, globals, line.trim(), None),
    }
}

fn parse_bounded_int(spec: &OptionSpec, raw: &str) -> Result<i64> {
    let v: i64 = raw
        .trim()
        .parse()
        .map_err(|_| anyhow!("{}: invalid integer {:?}", spec.name, raw))?;

    // Options without an explicit floor store into unsigned fields.
    let min = spec.minval.unwrap_or(0);
    if v < min {
        bail!("{}: value {} below minimum {}", spec.name, v, min);
    }
    if let Some(max) = spec.maxval {
        if v > max {
            bail!("{}: value {} above maximum {}", spec.name, v, max);
        }
    }
    Ok(v)
}

/// Fill a descriptor with every schema default. Global-directive options
/// are left alone so a command-line `lockmem`/`exitall` survives the
/// per-file defaults reset.
pub fn fill_defaults(w: &mut Worker, globals: &mut GlobalDirectives) -> Result<()> {
    for spec in SCHEMA {
        if matches!(spec.kind, OptKind::StrValCb(_) | OptKind::SetCb(_)) {
            continue;
        }
        if let Some(def) = spec.def {
            apply_option(w, globals, spec.name, Some(def))?;
        }
    }
    Ok(())
}

/// Serialize a worker's option-visible state back into job-file form.
/// Re-parsing the result reproduces the same option-visible fields.
pub fn serialize_ini(w: &Worker) -> String {
    let mut out = String::new();

    for spec in SCHEMA {
        match spec.kind {
            OptKind::StrStore(field) => {
                if let Some(v) = field.get_str(w) {
                    let _ = writeln!(out, "{}={}", spec.name, v);
                }
            }
            OptKind::Str(_) => {
                let v = match spec.name {
                    "rw" => w.rw_name().to_string(),
                    "mem" => w.mem_name(),
                    "verify" => w.verify_name().to_string(),
                    "ioengine" => match &w.engine {
                        Some(e) => e.name.to_string(),
                        None => continue,
                    },
                    _ => continue,
                };
                let _ = writeln!(out, "{}={}", spec.name, v);
            }
            OptKind::StrVal(fields) => {
                let _ = writeln!(out, "{}={}", spec.name, fields[0].get_u64(w));
            }
            OptKind::StrValTime(field) => {
                let _ = writeln!(out, "{}={}", spec.name, field.get_u64(w));
            }
            OptKind::Int(field) => {
                let _ = writeln!(out, "{}={}", spec.name, field.get_int(w));
            }
            OptKind::IntCb(_) => {
                let v = match spec.name {
                    "prio" => (w.ioprio & ((1 << IOPRIO_CLASS_SHIFT) - 1)) as i64,
                    "prioclass" => (w.ioprio >> IOPRIO_CLASS_SHIFT) as i64,
                    // Masks with the top bit set don't survive the
                    // integer grammar; leave them implicit.
                    "cpumask" => match i64::try_from(w.cpumask) {
                        Ok(v) => v,
                        Err(_) => continue,
                    },
                    _ => continue,
                };
                if v != 0 {
                    let _ = writeln!(out, "{}={}", spec.name, v);
                }
            }
            OptKind::Range(fields) => {
                let vals: Vec<u64> = fields.iter().map(|f| f.get_u64(w)).collect();
                if vals.iter().any(|&v| v != 0) {
                    let _ = writeln!(
                        out,
                        "{}={}:{},{}:{}",
                        spec.name, vals[0], vals[1], vals[2], vals[3]
                    );
                }
            }
            OptKind::Set(field) => {
                if field.get_flag(w) {
                    let _ = writeln!(out, "{}", spec.name);
                }
            }
            // Global directives are not part of the worker's state.
            OptKind::StrValCb(_) | OptKind::SetCb(_) => {}
        }
    }

    out
}

/// Print help for one option, or all of them for `all`. Returns an error
/// for an unknown name so the caller can exit non-zero.
pub fn show_cmd_help(name: &str, out: &mut dyn std::io::Write) -> Result<()> {
    let mut shown = false;

    for spec in SCHEMA {
        if name != "all" && spec.name != name {
            continue;
        }
        shown = true;

        let _ = writeln!(out, "{:>20}: {}", spec.name, spec.help);
        if let Some(def) = spec.def {
            let _ = writeln!(out, "{:>20}  default: {}", "", def);
        }
        if !spec.posval.is_empty() {
            let _ = writeln!(out, "{:>20}  values: {}", "", spec.posval.join(", "));
        }
        if spec.name == "ioengine" {
            let _ = writeln!(out, "{:>20}  engines: {}", "", engine_names().join(", "));
        }
    }

    if !shown {
        warn!("no such command option: {}", name);
        bail!("no such command option: {}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::FileType;

    fn fresh() -> (Worker, GlobalDirectives) {
        let mut w = Worker::default();
        let mut g = GlobalDirectives::default();
        fill_defaults(&mut w, &mut g).unwrap();
        (w, g)
    }

    #[test]
    fn test_defaults_fill() {
        let (w, _) = fresh();
        assert_eq!(w.bs, [4096, 4096]);
        assert_eq!(w.nr_files, 1);
        assert_eq!(w.iodepth, 1);
        assert_eq!(w.rwmixread, 0);
        assert_eq!(w.rwmixwrite, 0);
        assert!(w.odirect);
        assert!(w.rand_repeatable);
        assert!(w.unlink);
        assert_eq!(w.hugepage_size, 4 << 20);
        assert_eq!(w.engine.as_ref().unwrap().name, "sync");
        assert_eq!(w.ddir, DataDirection::Read);
        assert!(w.sequential);
    }

    #[test]
    fn test_size_and_time_options() {
        let (mut w, mut g) = fresh();
        parse_option_line(&mut w, &mut g, "size=16m").unwrap();
        assert_eq!(w.total_file_size, 16 << 20);
        parse_option_line(&mut w, &mut g, "timeout=2m").unwrap();
        assert_eq!(w.timeout, 120);
        parse_option_line(&mut w, &mut g, "bs=64k").unwrap();
        assert_eq!(w.bs, [65536, 65536]);
    }

    #[test]
    fn test_rw_prefix_matching() {
        let (mut w, mut g) = fresh();

        parse_option_line(&mut w, &mut g, "rw=randread").unwrap();
        assert_eq!(w.ddir, DataDirection::Read);
        assert!(!w.sequential);
        assert!(!w.iomix);

        parse_option_line(&mut w, &mut g, "rw=randrw").unwrap();
        assert!(w.iomix);
        assert!(!w.sequential);

        parse_option_line(&mut w, &mut g, "rw=rw").unwrap();
        assert!(w.iomix);
        assert!(w.sequential);

        assert!(parse_option_line(&mut w, &mut g, "rw=sideways").is_err());
    }

    #[test]
    fn test_int_bounds() {
        let (mut w, mut g) = fresh();
        assert!(parse_option_line(&mut w, &mut g, "rwmixread=101").is_err());
        assert!(parse_option_line(&mut w, &mut g, "nice=-30").is_err());
        parse_option_line(&mut w, &mut g, "nice=-19").unwrap();
        assert_eq!(w.nice, -19);
    }

    #[test]
    fn test_bsrange_writes_four_fields() {
        let (mut w, mut g) = fresh();
        parse_option_line(&mut w, &mut g, "bsrange=4k:64k,1k:8k").unwrap();
        assert_eq!(w.min_bs, [4096, 1024]);
        assert_eq!(w.max_bs, [65536, 8192]);
    }

    #[test]
    fn test_mem_with_mapping_file() {
        let (mut w, mut g) = fresh();
        parse_option_line(&mut w, &mut g, "mem=mmap:/tmp/backing").unwrap();
        assert_eq!(w.mem_type, MemKind::Mmap);
        assert_eq!(w.mmapfile.as_deref(), Some("/tmp/backing"));

        assert!(parse_option_line(&mut w, &mut g, "mem=mmaphuge").is_err());
        parse_option_line(&mut w, &mut g, "mem=mmaphuge:/mnt/huge/f").unwrap();
        assert_eq!(w.mem_type, MemKind::MmapHuge);
    }

    #[test]
    fn test_presence_flags_and_globals() {
        let (mut w, mut g) = fresh();
        parse_option_line(&mut w, &mut g, "stonewall").unwrap();
        assert!(w.stonewall);
        parse_option_line(&mut w, &mut g, "exitall").unwrap();
        assert!(g.exitall_on_terminate);
        parse_option_line(&mut w, &mut g, "lockmem=64m").unwrap();
        assert_eq!(g.lock_mem, 64 << 20);
    }

    #[test]
    fn test_prio_composition() {
        let (mut w, mut g) = fresh();
        parse_option_line(&mut w, &mut g, "prio=4").unwrap();
        parse_option_line(&mut w, &mut g, "prioclass=2").unwrap();
        assert_eq!(w.ioprio, 4 | (2 << 13));
        assert!(parse_option_line(&mut w, &mut g, "prio=8").is_err());
    }

    #[test]
    fn test_unknown_option() {
        let (mut w, mut g) = fresh();
        let err = parse_option_line(&mut w, &mut g, "warpfactor=9").unwrap_err();
        assert!(err.to_string().contains("unknown option"));
    }

    #[test]
    fn test_serialize_round_trip() {
        let (mut w, mut g) = fresh();
        for line in [
            "rw=randrw",
            "rwmixread=70",
            "rwmixwrite=30",
            "size=8m",
            "bs=16k",
            "iodepth=4",
            "ioengine=libaio",
            "norandommap",
            "direct=0",
        ] {
            parse_option_line(&mut w, &mut g, line).unwrap();
        }
        w.filetype = FileType::File;

        let ini = serialize_ini(&w);
        let (mut w2, mut g2) = fresh();
        for line in ini.lines() {
            parse_option_line(&mut w2, &mut g2, line).unwrap();
        }

        assert_eq!(w2.rw_name(), "randrw");
        assert_eq!(w2.rwmixread, 70);
        assert_eq!(w2.total_file_size, 8 << 20);
        assert_eq!(w2.bs, w.bs);
        assert_eq!(w2.iodepth, 4);
        assert_eq!(w2.engine.as_ref().unwrap().name, "libaio");
        assert!(w2.norandommap);
        assert!(!w2.odirect);
    }
}
