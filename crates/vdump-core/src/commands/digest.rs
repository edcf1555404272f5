//! Recompute a digest stream from an existing dump.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::archive::manager::ArchiveManager;
use crate::config::JobConfig;
use crate::record::{DigestBlock, DigestHeader};
use vdump_types::error::{Result, VdumpError};

#[derive(Debug, Clone, Copy, Default)]
pub struct DigestOutcome {
    pub blocks_digested: u64,
}

pub fn run(cfg: &JobConfig, shutdown: Option<&AtomicBool>) -> Result<DigestOutcome> {
    let mut streams = ArchiveManager::open(cfg)?;

    let dump_header = streams.dump_in_header()?;
    // The derived digest carries the dump's identity triple and timestamp,
    // exactly as if it had been written alongside the dump.
    let digest_header = DigestHeader::derive_from(&dump_header);
    streams.write_digest_header(&digest_header)?;

    let mut outcome = DigestOutcome::default();
    for _ in 0..dump_header.disk_size {
        if shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return Err(VdumpError::Cancelled);
        }
        let block = streams.read_dump_block()?;
        streams.write_digest_block(DigestBlock::of_block(&block))?;
        outcome.blocks_digested += 1;
    }

    streams.finish()?;
    info!(blocks = outcome.blocks_digested, "digest finished");
    Ok(outcome)
}
