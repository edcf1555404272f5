//! Merging reader over an ordered chain of dump/rdiff archives.
//!
//! Inputs cover the same disk and are listed oldest first: one full dump,
//! then the rdiffs produced by later generations. Because each rdiff stores
//! the *previous* generation's blocks at the offsets that changed, the
//! newest value for an offset lives in the **last** input that lists it.

use std::path::PathBuf;

use tracing::debug;

use crate::archive::{open_dump_input, DumpInput};
use crate::config::IoProfile;
use crate::record::{DumpBlock, DumpHeader};
use vdump_types::error::{Result, VdumpError};

pub struct MultiArchiveReader {
    inputs: Vec<DumpInput>,
    /// Head block of each input; `None` once that input is exhausted.
    heads: Vec<Option<DumpBlock>>,
    offset: u64,
    synthetic: DumpHeader,
}

impl std::fmt::Debug for MultiArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiArchiveReader")
            .field("inputs", &self.inputs.len())
            .field("heads", &self.heads)
            .field("offset", &self.offset)
            .field("synthetic", &self.synthetic)
            .finish()
    }
}

impl MultiArchiveReader {
    pub fn open(paths: &[PathBuf], profile: IoProfile) -> Result<Self> {
        if paths.is_empty() {
            return Err(VdumpError::Config(
                "at least one dump/rdiff archive is required".into(),
            ));
        }

        let mut inputs = Vec::with_capacity(paths.len());
        let mut headers = Vec::with_capacity(paths.len());
        for path in paths {
            let input = open_dump_input(path, profile)?;
            headers.push(input.header());
            inputs.push(input);
        }

        let first = &headers[0];
        for (i, header) in headers.iter().enumerate().skip(1) {
            if header.disk_size != first.disk_size
                || header.block_size != first.block_size
                || header.uuid != first.uuid
            {
                return Err(VdumpError::Consistency(format!(
                    "archive '{}' does not describe the same disk as '{}'",
                    paths[i].display(),
                    paths[0].display()
                )));
            }
            // Rdiffs store the previous generation's blocks, so a chain of
            // them runs backwards in time.
            if !headers[i - 1].is_full
                && !header.is_full
                && headers[i - 1].timestamp <= header.timestamp
            {
                return Err(VdumpError::Consistency(format!(
                    "rdiff '{}' is not older than its predecessor",
                    paths[i].display()
                )));
            }
        }

        let mut heads = Vec::with_capacity(inputs.len());
        for input in &mut inputs {
            heads.push(input.next_block()?);
        }

        // The synthetic header: the newest generation's identity and
        // timestamp, with fullness taken from the base archive.
        let mut synthetic = (**headers.last().expect("nonempty")).clone();
        synthetic.is_full = first.is_full;

        debug!(
            archives = inputs.len(),
            disk_size = synthetic.disk_size,
            "multi-archive reader open"
        );
        Ok(MultiArchiveReader {
            inputs,
            heads,
            offset: 0,
            synthetic,
        })
    }

    /// Header describing the merged logical dump.
    pub fn header(&self) -> &DumpHeader {
        &self.synthetic
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn disk_size(&self) -> u64 {
        self.synthetic.disk_size
    }

    pub fn block_size(&self) -> u64 {
        self.synthetic.block_size
    }

    pub fn is_eof(&self) -> bool {
        self.offset == self.synthetic.disk_size
    }

    /// Read the newest block for the current offset and advance.
    ///
    /// Every input whose head sits at the current offset is advanced; the
    /// last of them in list order supplies the result. `Ok(None)` means no
    /// input lists this offset (unchanged or implicitly zero); the caller
    /// decides whether that means skip or zero-fill.
    pub fn read_block(&mut self) -> Result<Option<DumpBlock>> {
        if self.is_eof() {
            return Ok(None);
        }

        let mut newest = None;
        for i in 0..self.inputs.len() {
            let matches = self.heads[i]
                .as_ref()
                .is_some_and(|b| b.offset == self.offset);
            if matches {
                newest = self.heads[i].take();
                self.heads[i] = self.inputs[i].next_block()?;
            }
        }
        self.offset += 1;
        Ok(newest)
    }

    pub fn pause(&mut self) {
        for input in &mut self.inputs {
            input.pause();
        }
    }

    pub fn resume(&mut self) {
        for input in &mut self.inputs {
            input.resume();
        }
    }

    pub fn stop(&mut self) {
        for input in &mut self.inputs {
            input.stop();
        }
    }
}
