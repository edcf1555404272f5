//! Bitmap utilities: derive a changed-block bitmap from an rdiff, and
//! print a bitmap file.
//!
//! An rdiff lists exactly the offsets that changed between two
//! generations, so setting one bit per listed block yields the bitmap a
//! subsequent incremental dump can consume.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::archive::open_dump_input;
use crate::config::IoProfile;
use crate::record::bitmap::Bitmap;
use vdump_types::error::{Result, VdumpError};

pub fn bitmap_from_rdiff(rdiff: &Path, bitmap_out: &Path, profile: IoProfile) -> Result<Bitmap> {
    let mut input = open_dump_input(rdiff, profile)?;
    let header = input.header();

    let mut bmp = Bitmap::new(header.disk_size);
    let mut listed = 0u64;
    while let Some(block) = input.next_block()? {
        if block.offset >= header.disk_size {
            return Err(VdumpError::Format(format!(
                "rdiff lists block {} beyond the {}-block disk",
                block.offset, header.disk_size
            )));
        }
        bmp.set(block.offset, true);
        listed += 1;
    }
    input.stop();

    let mut out = BufWriter::new(File::create(bitmap_out)?);
    bmp.write_to(&mut out)?;
    out.flush()?;
    info!(
        blocks = header.disk_size,
        changed = listed,
        "bitmap written"
    );
    Ok(bmp)
}

pub fn print_bitmap(bitmap_in: &Path, out: &mut impl Write) -> Result<()> {
    let mut reader = BufReader::new(File::open(bitmap_in)?);
    let bmp = Bitmap::read_from(&mut reader)?;
    bmp.print(out)?;
    Ok(())
}
