//! Job configuration shared by the archive manager and the commands.

use std::path::PathBuf;

use crate::record::SECTOR_SIZE;
use vdump_types::error::{Result, VdumpError};

/// Default block size: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Dump,
    Restore,
    Check,
    Print,
    Digest,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    Full,
    Diff,
    Incr,
}

impl DumpMode {
    /// Diff and incr both reconcile against a previous generation.
    pub fn uses_previous(self) -> bool {
        matches!(self, DumpMode::Diff | DumpMode::Incr)
    }
}

/// Whether archive streams run worker threads or inline I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoProfile {
    Parallel,
    Single,
}

/// Everything one invocation needs: the command, the stream filenames, and
/// the knobs. Stream requirements per command are enforced by the archive
/// manager, not here.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub command: Command,
    /// Dump mode; only meaningful (and required) for `Command::Dump`.
    pub mode: Option<DumpMode>,

    pub dump_in: Option<PathBuf>,
    pub digest_in: Option<PathBuf>,
    pub dump_out: Option<PathBuf>,
    pub digest_out: Option<PathBuf>,
    pub rdiff_out: Option<PathBuf>,
    pub bitmap_in: Option<PathBuf>,
    /// Ordered dump/rdiff list for restore, check, and merge.
    pub archives: Vec<PathBuf>,

    pub block_size: u64,
    pub use_san: bool,
    /// When false (`--omitzeroblock`), restore skips all-zero blocks.
    pub write_zero_blocks: bool,
    pub write_metadata: bool,
    pub create: bool,
    pub io_profile: IoProfile,
}

impl JobConfig {
    pub fn new(command: Command) -> Self {
        JobConfig {
            command,
            mode: None,
            dump_in: None,
            digest_in: None,
            dump_out: None,
            digest_out: None,
            rdiff_out: None,
            bitmap_in: None,
            archives: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            use_san: false,
            write_zero_blocks: true,
            write_metadata: false,
            create: false,
            io_profile: IoProfile::Parallel,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % SECTOR_SIZE != 0 {
            return Err(VdumpError::Config(format!(
                "block size {} is not a positive multiple of {SECTOR_SIZE}",
                self.block_size
            )));
        }
        if self.command == Command::Dump && self.mode.is_none() {
            return Err(VdumpError::Config(
                "dump requires --mode full|diff|incr".into(),
            ));
        }
        Ok(())
    }
}
