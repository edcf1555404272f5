//! Verify an archive chain against its digest stream.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::archive::manager::ArchiveManager;
use crate::archive::multi::MultiArchiveReader;
use crate::config::JobConfig;
use crate::record::{same_snapshot, DigestBlock};
use vdump_types::error::{Result, VdumpError};

#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Synthetic archive header and digest header describe the same snapshot.
    pub headers_match: bool,
    pub blocks_checked: u64,
    /// Offsets whose recomputed digest disagreed with the digest stream.
    pub mismatched_offsets: Vec<u64>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.headers_match && self.mismatched_offsets.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CheckProgressEvent {
    BlockDone {
        offset: u64,
        present: bool,
        valid: bool,
    },
}

pub fn run(cfg: &JobConfig, shutdown: Option<&AtomicBool>) -> Result<CheckReport> {
    run_with_progress(cfg, shutdown, None)
}

pub fn run_with_progress(
    cfg: &JobConfig,
    shutdown: Option<&AtomicBool>,
    mut progress: Option<&mut dyn FnMut(CheckProgressEvent)>,
) -> Result<CheckReport> {
    if cfg.archives.is_empty() {
        return Err(VdumpError::Config(
            "check needs one or more dump/rdiff archives".into(),
        ));
    }

    let mut multi = MultiArchiveReader::open(&cfg.archives, cfg.io_profile)?;
    let mut digest_streams = ArchiveManager::open(cfg)?;
    let digest_header = digest_streams.digest_in_header()?;

    let mut report = CheckReport {
        headers_match: same_snapshot(multi.header(), &digest_header),
        ..CheckReport::default()
    };

    // Absent offsets are unchanged-or-zero by construction; only present
    // blocks can disagree with the digest.
    while !multi.is_eof() && digest_streams.can_read_digest()? {
        if shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return Err(VdumpError::Cancelled);
        }
        let offset = multi.offset();
        let block = multi.read_block()?;
        let digest = digest_streams.read_digest_block()?;

        let present = block.is_some();
        let mut valid = true;
        if let Some(block) = &block {
            if DigestBlock::of_block(block) != digest {
                valid = false;
                report.mismatched_offsets.push(offset);
            }
        }
        report.blocks_checked += 1;

        if let Some(cb) = progress.as_deref_mut() {
            cb(CheckProgressEvent::BlockDone {
                offset,
                present,
                valid,
            });
        }
    }

    multi.stop();
    digest_streams.finish()?;
    info!(
        checked = report.blocks_checked,
        mismatches = report.mismatched_offsets.len(),
        headers_match = report.headers_match,
        "check finished"
    );
    Ok(report)
}
