// src/constants.rs
//
// Central location for constants used throughout ioforge.

/// Upper bound on concurrently configured workers. The shared worker table
/// is sized from this and negotiated downward if the kernel refuses the
/// segment (see `table::negotiate_segment`).
pub const MAX_JOBS: usize = 1024;

/// Seed pinned into the random-position stream when `randrepeat` is set,
/// so byte-identical job files replay byte-identical offset sequences.
pub const RAND_SEED: u64 = 0xb189_9bed;

/// Bits per word in a file's block-coverage map.
pub const BLOCKS_PER_MAP: u64 = 64;

/// Default hugepage size handed to `hugepage-size` (4 MiB).
pub const DEFAULT_HUGEPAGE_SIZE: u64 = 4 * 1024 * 1024;

/// Headroom subtracted from physical memory when capping the process-wide
/// page-locked region (128 MiB).
pub const MLOCK_HEADROOM: u64 = 128 * 1024 * 1024;

/// Version string printed by `--version` and the usage block.
pub const VERSION_STRING: &str = concat!("ioforge ", env!("CARGO_PKG_VERSION"));
