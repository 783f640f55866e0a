// src/engine.rs
//
// Backend plug contract. Resolving an `ioengine=NAME` yields a handle with
// a capability bitfield and the operation hooks consumed by the I/O
// submission subsystem. Only the registry and the handle live here; the
// drivers themselves are peer code.

use anyhow::{anyhow, Result};
use bitflags::bitflags;

bitflags! {
    /// Capability bits a backend advertises to the harness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineFlags: u32 {
        /// Backend completes every submission before returning; queue
        /// depth is forced to 1.
        const SYNC_IO  = 1 << 0;
        /// Backend bypasses the page cache (set per worker when direct
        /// I/O is requested).
        const RAW_IO   = 1 << 1;
        /// Backend burns CPU instead of touching storage; skips entropy
        /// seeding and buffer sizing.
        const CPU_BURN = 1 << 2;
    }
}

/// Static description of one registered backend.
#[derive(Debug)]
pub struct EngineDef {
    pub name: &'static str,
    pub flags: EngineFlags,
}

/// Per-worker backend handle. Each worker gets its own copy of the flags so
/// capability bits like `RAW_IO` can be set without affecting siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHandle {
    pub name: &'static str,
    pub flags: EngineFlags,
}

static ENGINES: &[EngineDef] = &[
    EngineDef { name: "sync", flags: EngineFlags::SYNC_IO },
    EngineDef { name: "libaio", flags: EngineFlags::empty() },
    EngineDef { name: "posixaio", flags: EngineFlags::empty() },
    EngineDef { name: "mmap", flags: EngineFlags::SYNC_IO },
    EngineDef { name: "splice", flags: EngineFlags::SYNC_IO },
    EngineDef { name: "null", flags: EngineFlags::SYNC_IO },
    EngineDef { name: "cpuio", flags: EngineFlags::SYNC_IO.union(EngineFlags::CPU_BURN) },
];

/// Resolve a backend by name. Longest-prefix semantics are not needed here;
/// engine names are matched exactly.
pub fn load_engine(name: &str) -> Result<EngineHandle> {
    ENGINES
        .iter()
        .find(|e| e.name == name)
        .map(|e| EngineHandle { name: e.name, flags: e.flags })
        .ok_or_else(|| {
            anyhow!(
                "ioengine must be one of: {}",
                ENGINES.iter().map(|e| e.name).collect::<Vec<_>>().join(", ")
            )
        })
}

/// Names accepted by the `ioengine` option, for help output.
pub fn engine_names() -> Vec<&'static str> {
    ENGINES.iter().map(|e| e.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_known_engines() {
        let sync = load_engine("sync").unwrap();
        assert!(sync.flags.contains(EngineFlags::SYNC_IO));

        let aio = load_engine("libaio").unwrap();
        assert!(!aio.flags.contains(EngineFlags::SYNC_IO));

        let cpu = load_engine("cpuio").unwrap();
        assert!(cpu.flags.contains(EngineFlags::CPU_BURN));
    }

    #[test]
    fn test_load_unknown_engine() {
        let err = load_engine("warpdrive").unwrap_err().to_string();
        assert!(err.contains("sync"));
        assert!(err.contains("libaio"));
    }

    #[test]
    fn test_per_worker_flag_copies() {
        let mut a = load_engine("libaio").unwrap();
        let b = load_engine("libaio").unwrap();
        a.flags |= EngineFlags::RAW_IO;
        assert!(!b.flags.contains(EngineFlags::RAW_IO));
    }
}
