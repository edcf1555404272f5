//! Shared test fixtures: an in-memory provider session with scripted
//! failures, and archive file readers.

use std::collections::HashMap;

use crate::provider::controller::ProviderSession;
use crate::provider::DiskInfo;
use crate::record::{DigestBlock, DigestHeader, DumpBlock, DumpHeader};
use crate::serialize::StringMap;
use vdump_types::error::{Result, VdumpError};

/// In-memory disk behind the [`ProviderSession`] interface.
///
/// `fail_counts` scripts transient read failures per offset: each read of a
/// scripted offset fails until its counter runs out, which exercises the
/// dump loop's retry-and-reset path.
pub struct MemorySession {
    pub block_size: usize,
    pub disk: Vec<Vec<u8>>,
    pub metadata: StringMap,
    pub fail_counts: HashMap<u64, u32>,
    pub opened: bool,
    pub resets: u32,
    pub blocks_read: u64,
    pub blocks_written: u64,
}

impl MemorySession {
    pub fn new(block_size: usize, disk: Vec<Vec<u8>>) -> Self {
        assert!(disk.iter().all(|b| b.len() == block_size));
        MemorySession {
            block_size,
            disk,
            metadata: StringMap::new(),
            fail_counts: HashMap::new(),
            opened: false,
            resets: 0,
            blocks_read: 0,
            blocks_written: 0,
        }
    }

    fn slot(&mut self, offset: u64) -> Result<&mut Vec<u8>> {
        let len = self.disk.len() as u64;
        self.disk
            .get_mut(offset as usize)
            .ok_or_else(|| VdumpError::Provider(format!("block {offset} out of range 0..{len}")))
    }
}

impl ProviderSession for MemorySession {
    fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if let Some(remaining) = self.fail_counts.get_mut(&offset) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(VdumpError::Provider(format!(
                    "scripted read failure at block {offset}"
                )));
            }
        }
        let block = self.slot(offset)?;
        buf.copy_from_slice(block);
        self.blocks_read += 1;
        Ok(())
    }

    fn write_block(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let block = self.slot(offset)?;
        block.copy_from_slice(buf);
        self.blocks_written += 1;
        Ok(())
    }

    fn read_info(&mut self) -> Result<DiskInfo> {
        Ok(DiskInfo {
            adapter_type: 1,
            num_blocks: self.disk.len() as u64,
            num_links: 1,
        })
    }

    fn read_metadata(&mut self) -> Result<StringMap> {
        Ok(self.metadata.clone())
    }

    fn write_metadata(&mut self, metadata: &StringMap) -> Result<()> {
        self.metadata = metadata.clone();
        Ok(())
    }

    fn create_image(&mut self, header: &DumpHeader) -> Result<()> {
        self.disk = vec![vec![0u8; header.block_size as usize]; header.disk_size as usize];
        self.metadata = header.metadata.clone();
        Ok(())
    }

    fn shrink(&mut self) -> Result<()> {
        Ok(())
    }

    fn transport_mode(&mut self) -> Result<String> {
        Ok("memory".into())
    }

    fn reset(&mut self, _read_only: bool, _use_san: bool) -> Result<()> {
        self.resets += 1;
        self.opened = false;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Archive fixtures
// ---------------------------------------------------------------------------

pub fn read_dump_file(path: &std::path::Path) -> (DumpHeader, Vec<DumpBlock>) {
    let mut input = crate::archive::open_dump_input(path, crate::config::IoProfile::Single)
        .expect("open dump fixture");
    let header = (*input.header()).clone();
    let mut blocks = Vec::new();
    while let Some(b) = input.next_block().expect("read dump fixture") {
        blocks.push(b);
    }
    (header, blocks)
}

pub fn read_digest_file(path: &std::path::Path) -> (DigestHeader, Vec<DigestBlock>) {
    let mut input = crate::archive::open_digest_input(path, crate::config::IoProfile::Single)
        .expect("open digest fixture");
    let header = (*input.header()).clone();
    let mut blocks = Vec::new();
    while let Some(b) = input.next_block().expect("read digest fixture") {
        blocks.push(b);
    }
    (header, blocks)
}

/// Write a dump/rdiff file directly, bypassing the managers.
pub fn write_dump_file(path: &std::path::Path, header: &DumpHeader, blocks: &[DumpBlock]) {
    let mut out = crate::archive::DumpOutput::create(path, crate::config::IoProfile::Single)
        .expect("create dump fixture");
    out.write_header(header).expect("fixture header");
    for b in blocks {
        out.put(b.clone()).expect("fixture block");
    }
    out.stop().expect("finish fixture");
}

/// Write a digest file directly, bypassing the managers.
pub fn write_digest_file(path: &std::path::Path, header: &DigestHeader, blocks: &[DigestBlock]) {
    let mut out = crate::archive::DigestOutput::create(path, crate::config::IoProfile::Single)
        .expect("create digest fixture");
    out.write_header(header).expect("fixture header");
    for b in blocks {
        out.put(*b).expect("fixture digest");
    }
    out.stop().expect("finish fixture");
}
