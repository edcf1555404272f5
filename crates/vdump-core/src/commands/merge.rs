//! Merge a full+rdiff chain into one logically current archive.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::archive::manager::ArchiveManager;
use crate::archive::multi::MultiArchiveReader;
use crate::config::JobConfig;
use vdump_types::error::{Result, VdumpError};

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOutcome {
    pub blocks_written: u64,
    /// Offsets no input listed; implicitly unchanged/zero across the chain.
    pub blocks_skipped: u64,
    /// True when the result is a full dump, false when it is an rdiff.
    pub wrote_full: bool,
}

pub fn run(cfg: &JobConfig, shutdown: Option<&AtomicBool>) -> Result<MergeOutcome> {
    if cfg.archives.len() < 2 {
        return Err(VdumpError::Config(
            "merge needs two or more dump/rdiff archives".into(),
        ));
    }

    let mut multi = MultiArchiveReader::open(&cfg.archives, cfg.io_profile)?;
    let header = multi.header().clone();
    let mut out = ArchiveManager::open(cfg)?;

    // A chain rooted in a full dump merges to a full dump; an rdiff-only
    // chain merges to a combined rdiff.
    let wrote_full = header.is_full;
    if wrote_full {
        out.write_dump_header(&header)?;
    } else {
        out.write_rdiff_header(&header)?;
    }

    let mut outcome = MergeOutcome {
        wrote_full,
        ..MergeOutcome::default()
    };
    while !multi.is_eof() {
        if shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return Err(VdumpError::Cancelled);
        }
        match multi.read_block()? {
            Some(block) => {
                if wrote_full {
                    out.write_dump_block(block)?;
                } else {
                    out.write_rdiff_block(block)?;
                }
                outcome.blocks_written += 1;
            }
            None => outcome.blocks_skipped += 1,
        }
    }

    multi.stop();
    out.finish()?;
    info!(
        written = outcome.blocks_written,
        skipped = outcome.blocks_skipped,
        full = outcome.wrote_full,
        "merge finished"
    );
    Ok(outcome)
}
