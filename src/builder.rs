// src/builder.rs
//
// The job builder. Takes a populated descriptor, sanitizes option
// conflicts, materializes the file set, assigns the group id (honoring
// stonewall barriers), and clones replicas per numjobs. On failure the
// descriptor and any replicas already cloned are released.

use anyhow::{anyhow, bail, Result};
use std::os::unix::fs::FileTypeExt;

use crate::context::{HarnessContext, JobHandle};
use crate::engine::EngineFlags;
use crate::size_parser::kmg;
use crate::worker::{DataDirection, FileType, IoLog, JobFile, VerifyKind, Worker};

/// Classify the job target by stat(2) on the section name. Anything that
/// cannot be stat'ed is a regular (not yet created) file.
fn classify_target(jobname: &str) -> FileType {
    match std::fs::metadata(jobname) {
        Ok(md) => {
            let ft = md.file_type();
            if ft.is_block_device() {
                FileType::BlockDevice
            } else if ft.is_char_device() {
                FileType::CharDevice
            } else {
                FileType::File
            }
        }
        Err(_) => FileType::File,
    }
}

/// Fix up options that depend on each other. Returns user-visible
/// warnings for the conflicts that were corrected or kept.
pub fn fixup_options(w: &mut Worker) -> Vec<String> {
    let mut warnings = Vec::new();

    // A zero side of the mix is the complement of the other; two nonzero
    // sides are the user's to get right.
    if w.rwmixread == 0 && w.rwmixwrite == 0 {
        w.rwmixread = 50;
        w.rwmixwrite = 50;
    } else if w.rwmixread == 0 && w.rwmixwrite != 0 {
        w.rwmixread = 100 - w.rwmixwrite;
    } else if w.rwmixwrite == 0 && w.rwmixread != 0 {
        w.rwmixwrite = 100 - w.rwmixread;
    } else if w.rwmixread != 0 && w.rwmixread + w.rwmixwrite != 100 {
        warnings.push(format!(
            "rwmixread={} and rwmixwrite={} do not sum to 100, using as given",
            w.rwmixread, w.rwmixwrite
        ));
    }

    if w.write_iolog_file.is_some() && w.read_iolog_file.is_some() {
        warnings.push("read iolog overrides write_iolog".to_string());
        w.write_iolog_file = None;
    }

    let engine_flags = w.engine.as_ref().map(|e| e.flags).unwrap_or(EngineFlags::empty());
    if engine_flags.contains(EngineFlags::SYNC_IO) {
        w.iodepth = 1;
    } else if w.iodepth == 0 {
        w.iodepth = w.nr_files;
    }

    // Zone stepping only means anything for single-file sequential work.
    if w.zone_size != 0 && !(w.sequential && w.nr_files == 1) {
        w.zone_size = 0;
    }

    // Reads can't hit holes; pre-create file contents.
    if w.reads() {
        w.overwrite = true;
    }

    for d in [DataDirection::READ, DataDirection::WRITE] {
        if w.min_bs[d] == 0 {
            w.min_bs[d] = w.bs[d];
        }
        if w.max_bs[d] == 0 {
            w.max_bs[d] = w.bs[d];
        }
    }
    w.rw_min_bs = w.min_bs[DataDirection::READ].min(w.min_bs[DataDirection::WRITE]);

    if w.ddir == DataDirection::Read && !w.iomix {
        w.verify = VerifyKind::None;
    }

    if w.norandommap && w.verify != VerifyKind::None {
        warnings.push("norandommap given, verify disabled".to_string());
        w.verify = VerifyKind::None;
    }

    if w.bs_unaligned && (w.odirect || engine_flags.contains(EngineFlags::RAW_IO)) {
        warnings.push("bs_unaligned may not work with raw io".to_string());
    }

    // O_DIRECT and char devices don't mix.
    if w.filetype == FileType::CharDevice && w.odirect {
        w.odirect = false;
    }

    warnings
}

/// Build the file set: named files under the directory for regular
/// targets, one record pointing at the device for block/char targets.
fn setup_files(w: &mut Worker, jobname: &str) {
    let dir_prefix = match w.directory.as_deref() {
        Some(d) if !d.is_empty() => format!("{}/", d),
        _ => String::new(),
    };

    if w.filetype == FileType::File || w.filename.is_some() {
        w.files = (0..w.nr_files)
            .map(|i| {
                let path = match w.filename.as_deref() {
                    Some(f) => format!("{}{}", dir_prefix, f),
                    None => format!("{}{}.{}.{}", dir_prefix, jobname, w.thread_number, i),
                };
                JobFile::new(path)
            })
            .collect();
    } else {
        w.nr_files = 1;
        w.files = vec![JobFile::new(jobname.to_string())];
    }

    let per_file = w.total_file_size / w.nr_files.max(1) as u64;
    for f in &mut w.files {
        f.file_size = per_file;
        f.file_offset = w.start_offset;
    }
}

/// Resolve the rate-limit helpers from the target bandwidth (KiB/s).
fn setup_rate(w: &mut Worker) -> Result<()> {
    if w.rate == 0 {
        return Ok(());
    }
    if w.rate < w.ratemin {
        bail!("minimum rate exceeds rate");
    }

    let blocks_per_sec = (w.rate as u64 * 1024) / w.rw_min_bs.max(1);
    if blocks_per_sec == 0 {
        bail!("rate lower than one block per second");
    }
    w.rate_usec_cycle = 1_000_000 / blocks_per_sec;
    w.rate_pending_usleep = 0;
    Ok(())
}

fn summary_line(w: &Worker) -> String {
    let engine = w.engine.as_ref();
    let engine_name = engine.map(|e| e.name).unwrap_or("?");

    if engine.is_some_and(|e| e.flags.contains(EngineFlags::CPU_BURN)) {
        return format!(
            "{}: ioengine=cpu, cpuload={}, cpucycle={}",
            w.name.as_deref().unwrap_or(""),
            w.cpuload,
            w.cpucycle
        );
    }

    format!(
        "{}: (g={}): rw={}, odir={}, bs={}-{}/{}-{}, rate={}, ioengine={}, iodepth={}",
        w.name.as_deref().unwrap_or(""),
        w.groupid,
        w.rw_name(),
        w.odirect as u32,
        kmg(w.min_bs[DataDirection::READ]),
        kmg(w.max_bs[DataDirection::READ]),
        kmg(w.min_bs[DataDirection::WRITE]),
        kmg(w.max_bs[DataDirection::WRITE]),
        w.rate,
        engine_name,
        w.iodepth
    )
}

/// Validate and commit one populated descriptor under the section name
/// `jobname`. `replica` is 0 for the job itself and counts up through the
/// numjobs clones (the first clone echoes `...`, later ones are silent).
///
/// On error the descriptor and any clones already committed are released.
pub fn add_job(
    ctx: &mut HarnessContext,
    handle: JobHandle,
    jobname: &str,
    replica: u32,
) -> Result<()> {
    // The defaults descriptor is just for options, not a real job.
    let idx = match handle {
        JobHandle::Defaults => return Ok(()),
        JobHandle::Slot(idx) => idx,
    };

    match build_one(ctx, idx, jobname, replica) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Roll back this worker and any trailing replicas it cloned.
            for j in (idx..ctx.table.len()).rev() {
                ctx.table.release(j);
            }
            Err(e)
        }
    }
}

fn build_one(ctx: &mut HarnessContext, idx: usize, jobname: &str, replica: u32) -> Result<()> {
    let filetype = classify_target(jobname);

    let warnings;
    {
        let w = ctx.table.get_mut(idx);
        if w.engine.is_none() {
            return Err(anyhow!("job {} has no ioengine", jobname));
        }

        // Direct I/O means the backend runs in raw mode.
        if w.odirect {
            if let Some(e) = w.engine.as_mut() {
                e.flags |= EngineFlags::RAW_IO;
            }
        }

        w.filetype = filetype;
        warnings = fixup_options(w);

        w.nr_uniq_files = if w.filename.is_some() { 1 } else { w.nr_files };
        setup_files(w, jobname);

        w.init_stat_floors();
    }
    for warning in &warnings {
        ctx.log_err(warning);
    }

    // A stonewall job at or after the second worker opens a new group.
    let (stonewall, thread_number) = {
        let w = ctx.table.get(idx);
        (w.stonewall, w.thread_number)
    };
    if stonewall && thread_number > 1 {
        ctx.group_id += 1;
    }
    let groupid = ctx.group_id;

    {
        let w = ctx.table.get_mut(idx);
        w.groupid = groupid;

        setup_rate(w)?;

        if w.write_lat_log {
            w.slat_log = Some(IoLog::default());
            w.clat_log = Some(IoLog::default());
        }
        if w.write_bw_log {
            w.bw_log = Some(IoLog::default());
        }

        if w.name.is_none() {
            w.name = Some(jobname.to_string());
        }
    }
    ctx.table.init_slot_sync(idx, groupid)?;

    if !ctx.terse {
        match replica {
            0 => {
                let line = summary_line(ctx.table.get(idx));
                ctx.log_out(&line);
            }
            1 => ctx.log_out("..."),
            _ => {}
        }
    }

    // Materialize numjobs replicas from the validated template. Barriers
    // apply to the group, not to each clone.
    let numjobs = ctx.table.get(idx).numjobs;
    if replica == 0 && numjobs > 1 {
        let mut template = ctx.table.get(idx).clone();
        template.numjobs = 1;
        template.stonewall = false;

        for i in 1..numjobs {
            let clone_idx = ctx
                .table
                .acquire(&template)
                .ok_or_else(|| anyhow!("worker table full ({} jobs)", ctx.table.max_jobs()))?;
            build_one(ctx, clone_idx, jobname, i)?;
        }
    }

    Ok(())
}
