// src/random.rs
//
// Per-worker random state. Four streams are seeded from the kernel
// entropy source: block-size range, verification offsets, read/write mix
// decisions, and (for random workloads) I/O position. The position seed
// can be pinned for reproducible runs, and random workloads get a lazy
// block-coverage bitmap per file unless norandommap is set.

use anyhow::{anyhow, Result};
use rand::rngs::{OsRng, StdRng};
use rand::{SeedableRng, TryRngCore};

use crate::constants::{BLOCKS_PER_MAP, RAND_SEED};
use crate::engine::EngineFlags;
use crate::worker::Worker;

/// The pseudo-random streams one worker draws from.
#[derive(Debug, Clone)]
pub struct RandState {
    pub bsrange: StdRng,
    pub verify: StdRng,
    pub rwmix: StdRng,
    /// Random I/O position stream; absent for sequential workloads.
    pub pos: Option<StdRng>,
}

fn entropy_seed() -> Result<u64> {
    OsRng
        .try_next_u64()
        .map_err(|e| anyhow!("entropy source: {}", e))
}

/// Initialize the random states a worker needs (random io, block size
/// ranges, read/write mix). CPU-burn workers have none.
pub fn init_random_state(w: &mut Worker) -> Result<()> {
    if let Some(engine) = &w.engine {
        if engine.flags.contains(EngineFlags::CPU_BURN) {
            return Ok(());
        }
    }

    let mut seeds = [0u64; 4];
    for s in &mut seeds {
        *s = entropy_seed()?;
    }

    let mut state = RandState {
        bsrange: StdRng::seed_from_u64(seeds[0]),
        verify: StdRng::seed_from_u64(seeds[1]),
        rwmix: StdRng::seed_from_u64(seeds[2]),
        pos: None,
    };

    if w.sequential {
        w.rand = Some(state);
        return Ok(());
    }

    if w.rand_repeatable {
        seeds[3] = RAND_SEED;
    }

    if !w.norandommap {
        for f in &mut w.files {
            let blocks = f.file_size.div_ceil(w.rw_min_bs.max(1));
            let words = blocks.div_ceil(BLOCKS_PER_MAP);
            f.file_map = Some(vec![0u64; words as usize]);
        }
    }

    state.pos = Some(StdRng::seed_from_u64(seeds[3]));
    w.rand = Some(state);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::load_engine;
    use crate::worker::JobFile;
    use rand::Rng;

    fn random_worker() -> Worker {
        let mut w = Worker::default();
        w.engine = Some(load_engine("sync").unwrap());
        w.sequential = false;
        w.rw_min_bs = 4096;
        w
    }

    #[test]
    fn test_sequential_worker_has_no_position_stream() {
        let mut w = random_worker();
        w.sequential = true;
        w.files.push(JobFile::new("f".into()));
        w.files[0].file_size = 1 << 20;

        init_random_state(&mut w).unwrap();
        let state = w.rand.as_ref().unwrap();
        assert!(state.pos.is_none());
        assert!(w.files[0].file_map.is_none());
    }

    #[test]
    fn test_cpu_burn_worker_skips_seeding() {
        let mut w = random_worker();
        w.engine = Some(load_engine("cpuio").unwrap());
        init_random_state(&mut w).unwrap();
        assert!(w.rand.is_none());
    }

    #[test]
    fn test_map_sizing() {
        let mut w = random_worker();
        let mut f = JobFile::new("f".into());
        f.file_size = 1 << 20; // 256 blocks of 4k
        w.files.push(f);

        init_random_state(&mut w).unwrap();
        let map = w.files[0].file_map.as_ref().unwrap();
        assert_eq!(map.len(), 4); // ceil(256 / 64)
        assert!(map.iter().all(|&word| word == 0));

        // Sizes that are not block multiples round the block count up.
        let mut w = random_worker();
        let mut f = JobFile::new("g".into());
        f.file_size = (1 << 20) + 1;
        w.files.push(f);
        init_random_state(&mut w).unwrap();
        assert_eq!(w.files[0].file_map.as_ref().unwrap().len(), 5);
    }

    #[test]
    fn test_norandommap_skips_maps() {
        let mut w = random_worker();
        w.norandommap = true;
        let mut f = JobFile::new("f".into());
        f.file_size = 1 << 20;
        w.files.push(f);

        init_random_state(&mut w).unwrap();
        assert!(w.files[0].file_map.is_none());
        assert!(w.rand.as_ref().unwrap().pos.is_some());
    }

    #[test]
    fn test_repeatable_position_stream() {
        let mut a = random_worker();
        a.rand_repeatable = true;
        let mut b = random_worker();
        b.rand_repeatable = true;

        init_random_state(&mut a).unwrap();
        init_random_state(&mut b).unwrap();

        let sa: Vec<u64> = {
            let rng = a.rand.as_mut().unwrap().pos.as_mut().unwrap();
            (0..8).map(|_| rng.random()).collect()
        };
        let sb: Vec<u64> = {
            let rng = b.rand.as_mut().unwrap().pos.as_mut().unwrap();
            (0..8).map(|_| rng.random()).collect()
        };
        assert_eq!(sa, sb);
    }
}
