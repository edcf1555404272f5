//! Restore: write a merged archive chain back to the block provider.
//!
//! The ordinary path streams every present block over one transport. The
//! two-phase SAN path first allocates storage on a thin target by writing a
//! zero block at every non-zero offset (driven by the digest stream over an
//! ordinary transport), then reopens via the fast transport and writes only
//! the non-zero data blocks. Every provider start or transport switch
//! forks, so the multi-archive workers are paused around it.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::archive::manager::ArchiveManager;
use crate::archive::multi::MultiArchiveReader;
use crate::config::JobConfig;
use crate::provider::controller::ProviderSession;
use crate::record::{same_disk, DumpBlock, DumpHeader};
use vdump_types::error::{Result, VdumpError};

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOutcome {
    pub blocks_written: u64,
    /// Offsets no archive listed, or zero blocks skipped by policy.
    pub blocks_skipped: u64,
    /// Zero blocks written during allocation (SAN phase 1).
    pub blocks_allocated: u64,
    pub used_san: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum RestoreProgressEvent {
    BlockDone { offset: u64, kind: BlockWrite },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockWrite {
    /// No archive covered the offset (or a zero block was skipped).
    Skipped,
    Zero,
    Data,
}

pub fn run(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    shutdown: Option<&AtomicBool>,
) -> Result<RestoreOutcome> {
    run_with_progress(cfg, provider, shutdown, None)
}

pub fn run_with_progress(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    shutdown: Option<&AtomicBool>,
    mut progress: Option<&mut dyn FnMut(RestoreProgressEvent)>,
) -> Result<RestoreOutcome> {
    if cfg.archives.is_empty() {
        return Err(VdumpError::Config(
            "restore needs one or more dump/rdiff archives".into(),
        ));
    }

    let mut multi = MultiArchiveReader::open(&cfg.archives, cfg.io_profile)?;
    let synthetic = multi.header().clone();

    // SAN only pays off for a full restore that skips zero blocks; anything
    // else takes the single-phase path.
    let use_san = cfg.use_san && synthetic.is_full && !cfg.write_zero_blocks;
    info!(
        archives = cfg.archives.len(),
        blocks = synthetic.disk_size,
        san = use_san,
        "starting restore"
    );

    let mut outcome = if use_san {
        restore_san(cfg, provider, &mut multi, &synthetic, shutdown, &mut progress)?
    } else {
        restore_plain(cfg, provider, &mut multi, &synthetic, shutdown, &mut progress)?
    };
    outcome.used_san = use_san;

    multi.stop();
    info!(
        written = outcome.blocks_written,
        skipped = outcome.blocks_skipped,
        "restore finished"
    );
    Ok(outcome)
}

/// Start (or restart) the provider child with the workers parked.
fn start_provider(
    provider: &mut dyn ProviderSession,
    multi: &mut MultiArchiveReader,
    read_only: bool,
    use_san: bool,
) -> Result<()> {
    multi.pause();
    let started = provider.reset(read_only, use_san);
    multi.resume();
    started
}

fn prepare_target(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    header: &DumpHeader,
) -> Result<()> {
    if cfg.create {
        provider.create_image(header)?;
    }
    provider.open()?;
    // SAN transports cannot write image metadata, so it is opt-in and
    // happens on the ordinary transport.
    if cfg.write_metadata {
        provider.write_metadata(&header.metadata)?;
    }
    Ok(())
}

fn restore_plain(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    multi: &mut MultiArchiveReader,
    header: &DumpHeader,
    shutdown: Option<&AtomicBool>,
    progress: &mut Option<&mut dyn FnMut(RestoreProgressEvent)>,
) -> Result<RestoreOutcome> {
    start_provider(provider, multi, false, false)?;
    prepare_target(cfg, provider, header)?;

    let mut outcome = RestoreOutcome::default();
    write_blocks(cfg, provider, multi, shutdown, progress, &mut outcome, true)?;

    // Reclaim space freed by skipped zero blocks on local targets.
    provider.shrink()?;
    provider.close()?;
    Ok(outcome)
}

fn restore_san(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    multi: &mut MultiArchiveReader,
    header: &DumpHeader,
    shutdown: Option<&AtomicBool>,
    progress: &mut Option<&mut dyn FnMut(RestoreProgressEvent)>,
) -> Result<RestoreOutcome> {
    let mut outcome = RestoreOutcome::default();

    // Phase 1: ordinary transport. Walk the digest and write one zero block
    // to every non-zero offset, so the thin target allocates storage that
    // the fast transport can then fill.
    start_provider(provider, multi, false, false)?;
    prepare_target(cfg, provider, header)?;
    {
        let mut digest_streams = ArchiveManager::open(cfg)?;
        let digest_header = digest_streams.digest_in_header()?;
        if !same_disk(header, &digest_header) {
            return Err(VdumpError::Consistency(
                "the digest does not correspond to the input archives".into(),
            ));
        }

        let zero = vec![0u8; header.block_size as usize];
        let mut offset = 0u64;
        while digest_streams.can_read_digest()? {
            if shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
                return Err(VdumpError::Cancelled);
            }
            let digest = digest_streams.read_digest_block()?;
            if !digest.is_all_zero() {
                provider.write_block(offset, &zero)?;
                outcome.blocks_allocated += 1;
            }
            offset += 1;
        }
        digest_streams.finish()?;
        debug!(allocated = outcome.blocks_allocated, "allocation pass done");
    }
    provider.close()?;

    // Phase 2: fast transport, data blocks only.
    start_provider(provider, multi, false, true)?;
    provider.open()?;
    write_blocks(cfg, provider, multi, shutdown, progress, &mut outcome, false)?;
    provider.close()?;
    Ok(outcome)
}

/// Stream the merged archive onto the provider.
///
/// `write_zero` controls whether all-zero blocks are materialized (a
/// synthesized zero buffer; the archive stores no payload for them).
fn write_blocks(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    multi: &mut MultiArchiveReader,
    shutdown: Option<&AtomicBool>,
    progress: &mut Option<&mut dyn FnMut(RestoreProgressEvent)>,
    outcome: &mut RestoreOutcome,
    allow_zero_writes: bool,
) -> Result<()> {
    let zero = vec![0u8; multi.block_size() as usize];
    while !multi.is_eof() {
        if shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return Err(VdumpError::Cancelled);
        }
        let offset = multi.offset();
        let kind = match multi.read_block()? {
            None => BlockWrite::Skipped,
            Some(block) => write_one(
                cfg,
                provider,
                offset,
                &block,
                &zero,
                allow_zero_writes,
            )?,
        };
        match kind {
            BlockWrite::Skipped => outcome.blocks_skipped += 1,
            _ => outcome.blocks_written += 1,
        }
        if let Some(cb) = progress.as_deref_mut() {
            cb(RestoreProgressEvent::BlockDone { offset, kind });
        }
    }
    Ok(())
}

fn write_one(
    cfg: &JobConfig,
    provider: &mut dyn ProviderSession,
    offset: u64,
    block: &DumpBlock,
    zero: &[u8],
    allow_zero_writes: bool,
) -> Result<BlockWrite> {
    debug_assert_eq!(block.offset, offset);
    match block.payload() {
        Some(payload) => {
            provider.write_block(offset, payload)?;
            Ok(BlockWrite::Data)
        }
        None if allow_zero_writes && cfg.write_zero_blocks => {
            provider.write_block(offset, zero)?;
            Ok(BlockWrite::Zero)
        }
        None => Ok(BlockWrite::Skipped),
    }
}
