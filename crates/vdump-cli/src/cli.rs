use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "vdump",
    version,
    about = "Block-level backup of virtual disk images",
    after_help = "\
Required streams per command:
  dump --mode full: --dumpout and --digestout
  dump --mode diff: all stream options except --bmpin
  dump --mode incr: all six stream options
  restore: archives in line; --digestin only with --san
  check:   --digestin, archives in line
  print:   --dumpin or --digestin
  digest:  --dumpin and --digestout
  merge:   --dumpout (full result) or --rdiffout (rdiff result), archives in line

Archives whose filename ends in .gz are gzip-compressed transparently."
)]
pub(crate) struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum Mode {
    Full,
    Diff,
    Incr,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Dump a disk image into dump/digest (and rdiff) archives
    Dump {
        /// Local disk image to back up
        #[arg(long)]
        local: PathBuf,

        /// Dump mode
        #[arg(long, value_enum)]
        mode: Mode,

        /// Previous generation's full dump (diff/incr)
        #[arg(long = "dumpin")]
        dump_in: Option<PathBuf>,

        /// Previous generation's digest (diff/incr)
        #[arg(long = "digestin")]
        digest_in: Option<PathBuf>,

        /// Output dump (an up-to-date full image)
        #[arg(long = "dumpout")]
        dump_out: Option<PathBuf>,

        /// Output digest
        #[arg(long = "digestout")]
        digest_out: Option<PathBuf>,

        /// Changed-block bitmap (incr)
        #[arg(long = "bmpin")]
        bitmap_in: Option<PathBuf>,

        /// Output rdiff (reverse delta back to the previous generation)
        #[arg(long = "rdiffout")]
        rdiff_out: Option<PathBuf>,

        /// Block size in bytes, a multiple of 512 (default 1 MiB)
        #[arg(long = "blocksize")]
        block_size: Option<u64>,

        /// Try the SAN transport
        #[arg(long)]
        san: bool,
    },

    /// Restore a disk image from an archive chain
    Restore {
        /// Local disk image to restore into
        #[arg(long)]
        local: PathBuf,

        /// Digest input; required with --san
        #[arg(long = "digestin")]
        digest_in: Option<PathBuf>,

        /// Create the target image before restoring
        #[arg(long)]
        create: bool,

        /// Write image metadata explicitly
        #[arg(long)]
        metadata: bool,

        /// Skip all-zero blocks (for restoring onto an empty thin image)
        #[arg(long = "omitzeroblock")]
        omit_zero_block: bool,

        /// Try the SAN transport
        #[arg(long)]
        san: bool,

        /// Full dump then rdiffs, oldest first
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },

    /// Verify an archive chain against its digest
    Check {
        /// Digest to verify against
        #[arg(long = "digestin")]
        digest_in: PathBuf,

        /// Full dump then rdiffs, oldest first
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },

    /// Print a dump or digest in human-readable form
    Print {
        #[arg(long = "dumpin")]
        dump_in: Option<PathBuf>,

        #[arg(long = "digestin")]
        digest_in: Option<PathBuf>,
    },

    /// Recompute a digest file from a dump
    Digest {
        #[arg(long = "dumpin")]
        dump_in: PathBuf,

        #[arg(long = "digestout")]
        digest_out: PathBuf,
    },

    /// Merge a full+rdiff chain into a single archive
    Merge {
        /// Write a merged full dump here
        #[arg(long = "dumpout")]
        dump_out: Option<PathBuf>,

        /// Write a merged rdiff here (for rdiff-only chains)
        #[arg(long = "rdiffout")]
        rdiff_out: Option<PathBuf>,

        /// Full dump then rdiffs, oldest first
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },

    /// Derive a changed-block bitmap from an rdiff
    Rdiff2bmp {
        /// Input rdiff
        #[arg(long = "dumpin")]
        dump_in: PathBuf,

        /// Output bitmap
        #[arg(long = "bmpout")]
        bitmap_out: PathBuf,
    },

    /// Print a bitmap file in human-readable form
    Printbmp {
        #[arg(long = "bmpin")]
        bitmap_in: PathBuf,
    },
}
