// src/table.rs
//
// The process-wide worker table. Descriptors are committed here in
// scheduling order; a System-V shared segment carries the per-slot sync
// block (readiness semaphore + group id) that forked workers must share
// with the parent. Segment size is negotiated downward when the kernel
// refuses the initial request.

use anyhow::{anyhow, bail, Context as _, Result};
use std::io;
use std::mem::size_of;
use tracing::{debug, info};

use crate::worker::Worker;

/// Per-slot block living in the shared segment. Exactly the state a
/// forked worker process needs to share with the parent; everything else
/// stays in the parent-side descriptor.
#[repr(C)]
pub struct SlotSync {
    mutex: libc::sem_t,
    pub groupid: u32,
}

/// Negotiate a shared-segment size with the kernel: on an invalid-argument
/// refusal, halve the job count and retry; any other refusal is fatal.
/// `probe` is the allocation attempt, returning the segment id or errno.
pub fn negotiate_segment(
    mut max_jobs: usize,
    slot_size: usize,
    mut probe: impl FnMut(usize) -> std::result::Result<i32, i32>,
) -> Result<(i32, usize)> {
    while max_jobs > 0 {
        match probe(max_jobs * slot_size) {
            Ok(id) => return Ok((id, max_jobs)),
            Err(errno) if errno == libc::EINVAL => {
                debug!(max_jobs, "kernel refused segment size, halving");
                max_jobs >>= 1;
            }
            Err(errno) => {
                return Err(anyhow!("shmget: {}", io::Error::from_raw_os_error(errno)))
            }
        }
    }
    bail!("cannot size shared worker table");
}

/// Owning handle for the attached segment. Detached and removed on drop,
/// covering both the normal exit hook and every failure path.
struct SharedSegment {
    id: i32,
    base: *mut u8,
}

impl SharedSegment {
    fn attach(id: i32) -> Result<Self> {
        let base = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if base as isize == -1 {
            return Err(io::Error::last_os_error()).context("shmat");
        }
        Ok(Self { id, base: base.cast() })
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base.cast());
            libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
        }
    }
}

// The segment is only touched from the single-threaded parent before
// workers start.
unsafe impl Send for SharedSegment {}

/// Worker table: descriptors committed as a prefix, with the shared sync
/// region sized to the negotiated job limit.
pub struct WorkerTable {
    seg: SharedSegment,
    max_jobs: usize,
    slots: Vec<Worker>,
}

impl WorkerTable {
    pub fn new(requested_jobs: usize) -> Result<Self> {
        let slot_size = size_of::<SlotSync>();
        let (id, max_jobs) = negotiate_segment(requested_jobs, slot_size, |size| {
            let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
            if id == -1 {
                Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
            } else {
                Ok(id)
            }
        })?;

        if max_jobs < requested_jobs {
            info!(requested_jobs, max_jobs, "worker table scaled down by kernel limits");
        }

        let seg = SharedSegment::attach(id)?;
        Ok(Self { seg, max_jobs, slots: Vec::new() })
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// High-water index: committed workers occupy `0..len()`.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Clone `parent` into the next free slot and return its index, or
    /// `None` when the table is full. The 1-based sequence index is
    /// assigned here so file names can use it before commit.
    pub fn acquire(&mut self, parent: &Worker) -> Option<usize> {
        if self.slots.len() >= self.max_jobs {
            return None;
        }
        let mut w = parent.clone();
        w.thread_number = self.slots.len() as u32 + 1;
        self.slots.push(w);
        Some(self.slots.len() - 1)
    }

    /// Release a worker acquired but not kept. Rollback always targets the
    /// most recent slot, which is what keeps committed workers a prefix.
    pub fn release(&mut self, idx: usize) {
        assert_eq!(idx + 1, self.slots.len(), "release must target the last slot");
        self.slots.pop();
    }

    pub fn get(&self, idx: usize) -> &Worker {
        &self.slots[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Worker {
        &mut self.slots[idx]
    }

    pub fn workers(&self) -> &[Worker] {
        &self.slots
    }

    pub fn workers_mut(&mut self) -> &mut [Worker] {
        &mut self.slots
    }

    /// Initialize the shared sync block for a slot: a process-shared
    /// semaphore at zero, plus the group id the runner gates on.
    pub fn init_slot_sync(&mut self, idx: usize, groupid: u32) -> Result<()> {
        assert!(idx < self.max_jobs);
        unsafe {
            let slot = self.seg.base.cast::<SlotSync>().add(idx);
            if libc::sem_init(&mut (*slot).mutex, 1, 0) != 0 {
                return Err(io::Error::last_os_error()).context("sem_init");
            }
            (*slot).groupid = groupid;
        }
        Ok(())
    }

    /// Group id recorded in the shared block (used by tests and the
    /// group-ordering gate).
    pub fn slot_groupid(&self, idx: usize) -> u32 {
        assert!(idx < self.max_jobs);
        unsafe { (*self.seg.base.cast::<SlotSync>().add(idx)).groupid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_halves_on_einval() {
        // Kernel refuses 1024 slots, accepts 512.
        let (id, max_jobs) = negotiate_segment(1024, 64, |size| {
            if size > 512 * 64 {
                Err(libc::EINVAL)
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(id, 7);
        assert_eq!(max_jobs, 512);
    }

    #[test]
    fn test_negotiation_exhaustion() {
        let err = negotiate_segment(1024, 64, |_| Err(libc::EINVAL)).unwrap_err();
        assert!(err.to_string().contains("cannot size"));
    }

    #[test]
    fn test_negotiation_other_errno_is_fatal() {
        let mut calls = 0;
        let err = negotiate_segment(1024, 64, |_| {
            calls += 1;
            Err(libc::ENOMEM)
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.to_string().contains("shmget"));
    }

    #[test]
    fn test_acquire_release_prefix() {
        let mut table = WorkerTable::new(4).unwrap();
        let parent = Worker::default();

        let a = table.acquire(&parent).unwrap();
        let b = table.acquire(&parent).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.get(b).thread_number, 2);
        assert_eq!(table.len(), 2);

        table.release(b);
        assert_eq!(table.len(), 1);

        // Freed slot is reusable.
        let c = table.acquire(&parent).unwrap();
        assert_eq!(c, 1);
    }

    #[test]
    fn test_table_full() {
        let mut table = WorkerTable::new(2).unwrap();
        let parent = Worker::default();
        assert!(table.acquire(&parent).is_some());
        assert!(table.acquire(&parent).is_some());
        assert!(table.acquire(&parent).is_none());
    }

    #[test]
    fn test_slot_sync_groupid() {
        let mut table = WorkerTable::new(2).unwrap();
        table.init_slot_sync(0, 3).unwrap();
        assert_eq!(table.slot_groupid(0), 3);
    }
}
