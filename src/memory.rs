// src/memory.rs
//
// Buffer provisioning. Each worker's I/O region is acquired under one of
// four ownership regimes (heap, shared segment, anonymous or file-backed
// mapping, with hugepage variants); release mirrors acquisition and runs
// on every exit path via Drop. A process-wide page-locked region of
// configurable size is also managed here.

use anyhow::{anyhow, bail, Context as _, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use tracing::info;

use crate::constants::MLOCK_HEADROOM;
use crate::worker::{MemKind, Worker};

/// File backing a mapped buffer region; closed and unlinked on release.
#[derive(Debug)]
pub struct MmapBacking {
    file: File,
    path: PathBuf,
}

/// A worker's I/O buffer region. Each variant owns its native handle.
#[derive(Debug)]
pub enum IoBuffer {
    Heap(Vec<u8>),
    Shm { id: i32, ptr: *mut u8, size: usize },
    Mmap { ptr: *mut u8, size: usize, backing: Option<MmapBacking> },
}

// Regions are exclusively owned; the raw pointers never alias.
unsafe impl Send for IoBuffer {}

impl IoBuffer {
    pub fn len(&self) -> usize {
        match self {
            IoBuffer::Heap(v) => v.len(),
            IoBuffer::Shm { size, .. } | IoBuffer::Mmap { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            IoBuffer::Heap(v) => v.as_mut_ptr(),
            IoBuffer::Shm { ptr, .. } | IoBuffer::Mmap { ptr, .. } => *ptr,
        }
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        match self {
            IoBuffer::Heap(_) => {}
            IoBuffer::Shm { id, ptr, .. } => unsafe {
                libc::shmdt(ptr.cast());
                libc::shmctl(*id, libc::IPC_RMID, std::ptr::null_mut());
            },
            IoBuffer::Mmap { ptr, size, backing } => {
                unsafe {
                    libc::munmap(ptr.cast(), *size);
                }
                if let Some(b) = backing.take() {
                    drop(b.file);
                    let _ = std::fs::remove_file(&b.path);
                }
            }
        }
    }
}

/// Size of the region a worker needs: enough for `iodepth` buffers of the
/// largest block size in either direction.
pub fn io_buffer_size(w: &Worker) -> u64 {
    w.max_bs.iter().copied().max().unwrap_or(0) * w.iodepth as u64
}

fn alloc_shm(size: usize, huge: bool) -> Result<IoBuffer> {
    let mut flags = libc::IPC_CREAT | libc::SHM_R | libc::SHM_W;
    if huge {
        flags |= libc::SHM_HUGETLB;
    }

    let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, flags) };
    if id < 0 {
        let err = io::Error::last_os_error();
        let errno = err.raw_os_error().unwrap_or(0);
        if errno == libc::ENOMEM && unsafe { libc::geteuid() } != 0 {
            bail!("shmget: {} (you may need to run this job as root)", err);
        }
        if errno == libc::EINVAL && huge {
            bail!(
                "shmget: {} (check that you have free huge pages and that hugepage-size is correct)",
                err
            );
        }
        return Err(anyhow!("shmget: {}", err));
    }

    let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
    if ptr as isize == -1 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
        }
        return Err(anyhow!("shmat: {}", err));
    }

    Ok(IoBuffer::Shm { id, ptr: ptr.cast(), size })
}

fn alloc_mmap(size: usize, huge: bool, mmapfile: Option<&str>) -> Result<IoBuffer> {
    let mut flags = libc::MAP_PRIVATE;
    if huge {
        flags |= libc::MAP_HUGETLB;
    }

    let backing = match mmapfile {
        Some(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .with_context(|| format!("open mmap file {}", path))?;
            file.set_len(size as u64)
                .with_context(|| format!("truncate mmap file {}", path))?;
            Some(MmapBacking { file, path: PathBuf::from(path) })
        }
        None => {
            flags |= libc::MAP_ANONYMOUS;
            None
        }
    };

    let fd = backing.as_ref().map_or(-1, |b| {
        use std::os::unix::io::AsRawFd;
        b.file.as_raw_fd()
    });

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        if let Some(b) = backing {
            drop(b.file);
            let _ = std::fs::remove_file(&b.path);
        }
        return Err(anyhow!("mmap: {}", err));
    }

    Ok(IoBuffer::Mmap { ptr: ptr.cast(), size, backing })
}

/// Set up the buffer region a worker does I/O through.
pub fn allocate_io_mem(w: &Worker) -> Result<IoBuffer> {
    let size = w.orig_buffer_size as usize;

    match w.mem_type {
        MemKind::Malloc => Ok(IoBuffer::Heap(vec![0u8; size])),
        MemKind::Shm => alloc_shm(size, false),
        MemKind::ShmHuge => alloc_shm(size, true),
        MemKind::Mmap => alloc_mmap(size, false, w.mmapfile.as_deref()),
        MemKind::MmapHuge => alloc_mmap(size, true, w.mmapfile.as_deref()),
    }
    .with_context(|| format!("iomem allocation for job {}", w.thread_number))
}

/// Process-wide page-locked region, unlocked and unmapped on drop.
#[derive(Debug)]
pub struct PinnedRegion {
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for PinnedRegion {}

impl PinnedRegion {
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munlock(self.ptr.cast(), self.size);
            libc::munmap(self.ptr.cast(), self.size);
        }
    }
}

/// Physical memory in bytes, or 0 when the probe fails.
pub fn phys_mem() -> u64 {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages <= 0 || page_size <= 0 {
        return 0;
    }
    pages as u64 * page_size as u64
}

/// Cap a lock request so at least `MLOCK_HEADROOM` of physical memory
/// stays unlocked.
fn capped_lock_size(requested: u64, phys: u64) -> u64 {
    if phys > 0 && requested + MLOCK_HEADROOM > phys {
        phys.saturating_sub(MLOCK_HEADROOM)
    } else {
        requested
    }
}

/// Map and page-lock `requested` bytes. Returns `None` for a zero request.
pub fn pin_memory(requested: u64) -> Result<Option<PinnedRegion>> {
    if requested == 0 {
        return Ok(None);
    }

    let size = capped_lock_size(requested, phys_mem());
    if size != requested {
        info!("limiting locked memory to {}MiB", size >> 20);
    }
    let size = size as usize;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error()).context("map locked memory");
    }

    if unsafe { libc::mlock(ptr, size) } != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::munmap(ptr, size);
        }
        return Err(anyhow!("mlock: {}", err));
    }

    Ok(Some(PinnedRegion { ptr: ptr.cast(), size }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocation() {
        let mut w = Worker::default();
        w.orig_buffer_size = 8192;
        let mut buf = allocate_io_mem(&w).unwrap();
        assert_eq!(buf.len(), 8192);
        assert!(!buf.as_mut_ptr().is_null());
    }

    #[test]
    fn test_anonymous_mmap_allocation() {
        let mut w = Worker::default();
        w.mem_type = MemKind::Mmap;
        w.orig_buffer_size = 16384;
        let mut buf = allocate_io_mem(&w).unwrap();
        assert_eq!(buf.len(), 16384);
        // Region must be writable.
        unsafe {
            *buf.as_mut_ptr() = 0xa5;
        }
    }

    #[test]
    fn test_file_backed_mmap_unlinks_on_release() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("backing");
        let mut w = Worker::default();
        w.mem_type = MemKind::Mmap;
        w.mmapfile = Some(path.to_string_lossy().into_owned());
        w.orig_buffer_size = 4096;

        let buf = allocate_io_mem(&w).unwrap();
        assert!(path.exists());
        drop(buf);
        assert!(!path.exists());
    }

    #[test]
    fn test_io_buffer_size() {
        let mut w = Worker::default();
        w.max_bs = [4096, 65536];
        w.iodepth = 4;
        assert_eq!(io_buffer_size(&w), 65536 * 4);
    }

    #[test]
    fn test_lock_cap() {
        let gib = 1u64 << 30;
        // Plenty of room: request honored.
        assert_eq!(capped_lock_size(gib, 16 * gib), gib);
        // Request collides with headroom: capped.
        assert_eq!(capped_lock_size(16 * gib, 16 * gib), 16 * gib - MLOCK_HEADROOM);
        // Unknown physical memory: request honored.
        assert_eq!(capped_lock_size(gib, 0), gib);
    }

    #[test]
    fn test_zero_lock_request() {
        assert!(pin_memory(0).unwrap().is_none());
    }
}
