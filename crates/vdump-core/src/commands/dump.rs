//! The dump orchestrator: full, differential, and incremental backup.
//!
//! Per offset it reconciles the previous generation's dump+digest pair, the
//! changed-block bitmap (incremental only), and a freshly read source block
//! into a new dump + digest (+ rdiff) triple. Provider reads retry with a
//! bounded budget; after a couple of consecutive failures the provider
//! child is reset, with every archive worker paused around the fork.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::archive::manager::DumpArchiveManager;
use crate::config::{DumpMode, JobConfig};
use crate::provider::controller::ProviderSession;
use crate::record::{DigestBlock, DumpBlock};
use vdump_types::error::{Result, VdumpError};

/// Provider read attempts per block before the dump aborts.
pub const READ_RETRY_BUDGET: u32 = 10;

/// Consecutive failures tolerated before each retry goes through a full
/// provider reset.
const RESET_AFTER_FAILURES: u32 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOutcome {
    /// Blocks covered, i.e. the disk size.
    pub blocks_total: u64,
    /// Blocks actually read from the provider.
    pub blocks_read: u64,
    /// Blocks that differ from the previous generation (diff/incr only;
    /// equals the rdiff's block count).
    pub blocks_changed: u64,
    /// Provider resets performed while retrying reads.
    pub resets: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum DumpProgressEvent {
    /// One offset finished. `read` tells whether the provider was consulted;
    /// `changed` whether the offset landed in the rdiff (always true for
    /// full dumps).
    BlockDone { offset: u64, read: bool, changed: bool },
}

pub fn run(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    shutdown: Option<&AtomicBool>,
) -> Result<DumpOutcome> {
    run_with_progress(cfg, provider, shutdown, None)
}

pub fn run_with_progress(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    shutdown: Option<&AtomicBool>,
    mut progress: Option<&mut dyn FnMut(DumpProgressEvent)>,
) -> Result<DumpOutcome> {
    provider.open()?;
    let result = dump_blocks(cfg, provider, shutdown, &mut progress);
    // Close regardless; the first error wins.
    let close_result = provider.close();
    let outcome = result?;
    close_result?;
    Ok(outcome)
}

fn dump_blocks(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    shutdown: Option<&AtomicBool>,
    progress: &mut Option<&mut dyn FnMut(DumpProgressEvent)>,
) -> Result<DumpOutcome> {
    let disk_info = provider.read_info()?;
    let metadata = provider.read_metadata()?;
    let transport = provider.transport_mode()?;
    info!(
        blocks = disk_info.num_blocks,
        block_size = cfg.block_size,
        transport = %transport,
        "starting dump"
    );

    // Workers spawn here, strictly after the provider child was forked.
    let mut archives = DumpArchiveManager::open(cfg)?;
    let mode = archives.mode();

    let prev_headers = archives.read_prev_headers()?;
    if let Some(prev) = &prev_headers {
        if prev.dump.disk_size != disk_info.num_blocks
            || prev.dump.block_size != cfg.block_size
        {
            return Err(VdumpError::Consistency(format!(
                "previous dump geometry ({} x {}) does not match the disk ({} x {})",
                prev.dump.disk_size, prev.dump.block_size, disk_info.num_blocks, cfg.block_size
            )));
        }
    }

    let headers = archives.build_headers(
        disk_info.num_blocks,
        cfg.block_size,
        disk_info.adapter_type,
        metadata,
        prev_headers.as_ref(),
    )?;
    archives.write_headers(&headers)?;

    let bitmap = archives.read_changed_bitmap()?;
    if let Some(bitmap) = &bitmap {
        if bitmap.len() != disk_info.num_blocks {
            return Err(VdumpError::Consistency(format!(
                "changed-block bitmap has {} bits for a {}-block disk",
                bitmap.len(),
                disk_info.num_blocks
            )));
        }
    }

    let mut outcome = DumpOutcome {
        blocks_total: disk_info.num_blocks,
        ..DumpOutcome::default()
    };

    for offset in 0..disk_info.num_blocks {
        if shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return Err(VdumpError::Cancelled);
        }

        let prev_pair = if mode.uses_previous() {
            Some(archives.read_prev_pair()?)
        } else {
            None
        };

        let maybe_changed = match (&bitmap, mode) {
            (Some(bitmap), DumpMode::Incr) => bitmap.get(offset),
            _ => true,
        };

        let curr_dump = if maybe_changed {
            let payload =
                read_block_with_retry(provider, &mut archives, cfg, offset, &mut outcome)?;
            outcome.blocks_read += 1;
            DumpBlock::from_raw(offset, payload)
        } else {
            // Unchanged per the bitmap: carry the previous generation's
            // block forward without touching the provider.
            let (prev_block, _) = prev_pair.as_ref().ok_or_else(|| {
                VdumpError::Consistency("bitmap-gated dump has no previous stream".into())
            })?;
            if prev_block.offset != offset {
                return Err(VdumpError::Consistency(format!(
                    "previous dump is out of order: block {} where {offset} was expected",
                    prev_block.offset
                )));
            }
            prev_block.clone()
        };

        let curr_digest = DigestBlock::of_block(&curr_dump);
        let changed = archives.write_blocks(prev_pair, curr_dump, curr_digest)?;
        if changed && mode.uses_previous() {
            outcome.blocks_changed += 1;
        }

        if let Some(cb) = progress.as_deref_mut() {
            cb(DumpProgressEvent::BlockDone {
                offset,
                read: maybe_changed,
                changed,
            });
        }
    }

    archives.finish()?;
    info!(
        read = outcome.blocks_read,
        changed = outcome.blocks_changed,
        resets = outcome.resets,
        "dump finished"
    );
    Ok(outcome)
}

/// Read one block, retrying up to [`READ_RETRY_BUDGET`] times.
///
/// The first couple of retries go straight back to the provider; from then
/// on each retry resets the provider child from scratch. The reset forks,
/// so all archive workers are paused across it.
fn read_block_with_retry(
    provider: &mut dyn ProviderSession,
    archives: &mut DumpArchiveManager,
    cfg: &JobConfig,
    offset: u64,
    outcome: &mut DumpOutcome,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; cfg.block_size as usize];
    let mut tries_left = READ_RETRY_BUDGET;
    loop {
        match provider.read_block(offset, &mut buf) {
            Ok(()) => return Ok(buf),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                tries_left -= 1;
                warn!(offset, tries_left, "block read failed: {err}");
                if tries_left == 0 {
                    return Err(err);
                }
                if tries_left <= READ_RETRY_BUDGET - RESET_AFTER_FAILURES {
                    let _ = provider.close();
                    archives.pause();
                    let reset = provider.reset(true, cfg.use_san);
                    archives.resume();
                    reset?;
                    provider.open()?;
                    outcome.resets += 1;
                    info!(offset, "provider reset, retrying read");
                }
            }
        }
    }
}
