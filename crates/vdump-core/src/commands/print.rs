//! Human-readable listing of dump and digest streams.

use std::io::Write;

use crate::archive::manager::ArchiveManager;
use crate::config::JobConfig;
use vdump_types::error::Result;

pub fn run(cfg: &JobConfig, out: &mut impl Write) -> Result<()> {
    let mut streams = ArchiveManager::open(cfg)?;

    if streams.is_dump_in_open() {
        let header = streams.dump_in_header()?;
        header.print(out)?;
        while streams.can_read_dump()? {
            streams.read_dump_block()?.print(out)?;
        }
    }

    if streams.is_digest_in_open() {
        let header = streams.digest_in_header()?;
        header.print(out)?;
        while streams.can_read_digest()? {
            streams.read_digest_block()?.print(out)?;
        }
    }

    streams.finish()
}
