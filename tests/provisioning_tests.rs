// Provisioning integration tests
//
// Exercises the pass that runs after parsing and before workers begin:
// buffer regions per memory regime, the pinned region, and the random
// streams over a real parsed population.

use std::fs;
use tempfile::TempDir;

use ioforge::ini::parse_jobs_file;
use ioforge::{memory, random, HarnessContext};

fn parse(content: &str) -> HarnessContext {
    let mut ctx = HarnessContext::new(16).unwrap();
    ctx.terse = true;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.ini");
    fs::write(&path, content).unwrap();
    let dropped = parse_jobs_file(&mut ctx, &path, false).unwrap();
    assert_eq!(dropped, 0);
    ctx
}

/// The main loop's provisioning pass, reproduced for the parsed table.
fn provision(ctx: &mut HarnessContext) -> Vec<memory::IoBuffer> {
    let mut buffers = Vec::new();
    for idx in 0..ctx.table.len() {
        {
            let w = ctx.table.get_mut(idx);
            if w.orig_buffer_size == 0 {
                w.orig_buffer_size = memory::io_buffer_size(w);
            }
        }
        random::init_random_state(ctx.table.get_mut(idx)).unwrap();
        buffers.push(memory::allocate_io_mem(ctx.table.get(idx)).unwrap());
    }
    buffers
}

#[test]
fn test_heap_buffers_sized_from_depth_and_blocks() {
    let mut ctx = parse("[job]\nioengine=libaio\niodepth=4\nbs=16k\nsize=1m\n");
    let buffers = provision(&mut ctx);

    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].len(), 4 * 16384);
    assert_eq!(ctx.table.get(0).orig_buffer_size, 4 * 16384);
}

#[test]
fn test_mmap_buffer_regime() {
    let mut ctx = parse("[job]\nmem=mmap\nbs=8k\nsize=1m\n");
    let mut buffers = provision(&mut ctx);

    assert_eq!(buffers[0].len(), 8192);
    // Mapped regions must be writable like heap ones.
    unsafe {
        *buffers[0].as_mut_ptr() = 0x5a;
    }
}

#[test]
fn test_file_backed_mmap_cleaned_up() {
    let dir = TempDir::new().unwrap();
    let backing = dir.path().join("iobuf");
    let mut ctx = parse(&format!(
        "[job]\nmem=mmap:{}\nbs=4k\nsize=64k\n",
        backing.display()
    ));

    let buffers = provision(&mut ctx);
    assert!(backing.exists());
    drop(buffers);
    assert!(!backing.exists());
}

#[test]
fn test_random_population_gets_streams_and_maps() {
    let mut ctx = parse("[seq]\nrw=read\nsize=1m\n\n[rand]\nrw=randread\nsize=1m\n");
    let _buffers = provision(&mut ctx);

    let seq = ctx.table.get(0);
    let state = seq.rand.as_ref().unwrap();
    assert!(state.pos.is_none());
    assert!(seq.files[0].file_map.is_none());

    let rand = ctx.table.get(1);
    let state = rand.rand.as_ref().unwrap();
    assert!(state.pos.is_some());
    // 1 MiB of 4k blocks is 256 bits of coverage map.
    let map = rand.files[0].file_map.as_ref().unwrap();
    assert_eq!(map.len(), 4);
}

#[test]
fn test_lockmem_directive_reaches_globals() {
    let ctx = parse("[global]\nlockmem=4m\n\n[job]\nsize=4k\n");
    assert_eq!(ctx.globals.lock_mem, 4 << 20);

    // Zero-sized requests produce no region at all.
    assert!(memory::pin_memory(0).unwrap().is_none());
}

#[test]
fn test_exitall_directive_reaches_globals() {
    let ctx = parse("[global]\nexitall\n\n[job]\nsize=4k\n");
    assert!(ctx.globals.exitall_on_terminate);
}
