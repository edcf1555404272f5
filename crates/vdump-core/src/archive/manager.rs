//! The archive manager: every stream one job has open, behind one façade.
//!
//! Opens the set of streams the configuration names, validates that set
//! against what the command and mode require, and exposes one-header or
//! one-block operations that delegate to the per-stream managers. All
//! streams are strictly sequential; there is no back-tracking.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tracing::debug;

use crate::archive::{
    open_digest_input, open_dump_input, DigestInput, DigestOutput, DumpInput, DumpOutput,
};
use crate::config::{Command, DumpMode, JobConfig};
use crate::record::bitmap::Bitmap;
use crate::record::{
    same_snapshot, DigestBlock, DigestHeader, DumpBlock, DumpHeader,
};
use crate::serialize::StringMap;
use crate::timestamp::Timestamp;
use vdump_types::error::{Result, VdumpError};

pub struct ArchiveManager {
    dump_in: Option<DumpInput>,
    digest_in: Option<DigestInput>,
    dump_out: Option<DumpOutput>,
    digest_out: Option<DigestOutput>,
    rdiff_out: Option<DumpOutput>,
    bitmap_in: Option<BufReader<File>>,
}

impl ArchiveManager {
    /// Open every stream the configuration names, then enforce the
    /// command+mode requirement table.
    pub fn open(cfg: &JobConfig) -> Result<Self> {
        cfg.validate()?;

        let dump_in = cfg
            .dump_in
            .as_deref()
            .map(|p| open_dump_input(p, cfg.io_profile))
            .transpose()?;
        let digest_in = cfg
            .digest_in
            .as_deref()
            .map(|p| open_digest_input(p, cfg.io_profile))
            .transpose()?;
        let dump_out = cfg
            .dump_out
            .as_deref()
            .map(|p| DumpOutput::create(p, cfg.io_profile))
            .transpose()?;
        let digest_out = cfg
            .digest_out
            .as_deref()
            .map(|p| DigestOutput::create(p, cfg.io_profile))
            .transpose()?;
        let rdiff_out = cfg
            .rdiff_out
            .as_deref()
            .map(|p| DumpOutput::create(p, cfg.io_profile))
            .transpose()?;
        let bitmap_in = cfg
            .bitmap_in
            .as_deref()
            .map(|p| File::open(p).map(BufReader::new))
            .transpose()?;

        let mgr = ArchiveManager {
            dump_in,
            digest_in,
            dump_out,
            digest_out,
            rdiff_out,
            bitmap_in,
        };
        mgr.check_streams(cfg)?;
        Ok(mgr)
    }

    /// The required-stream table. Restore's archive list is validated by the
    /// restore command itself, which owns the multi-archive reader.
    fn check_streams(&self, cfg: &JobConfig) -> Result<()> {
        let missing = |what: &str| {
            Err(VdumpError::Config(format!(
                "required streams are not open for {what}"
            )))
        };
        match cfg.command {
            Command::Dump => match cfg.mode {
                Some(DumpMode::Full) => {
                    if self.dump_out.is_none() || self.digest_out.is_none() {
                        return missing("dump --mode full (need --dumpout, --digestout)");
                    }
                }
                Some(DumpMode::Diff) => {
                    if self.dump_in.is_none()
                        || self.digest_in.is_none()
                        || self.dump_out.is_none()
                        || self.digest_out.is_none()
                        || self.rdiff_out.is_none()
                    {
                        return missing("dump --mode diff (need all streams except --bmpin)");
                    }
                }
                Some(DumpMode::Incr) => {
                    if self.dump_in.is_none()
                        || self.digest_in.is_none()
                        || self.dump_out.is_none()
                        || self.digest_out.is_none()
                        || self.rdiff_out.is_none()
                        || self.bitmap_in.is_none()
                    {
                        return missing("dump --mode incr (need all six streams)");
                    }
                }
                None => return missing("dump (mode not set)"),
            },
            Command::Restore => {
                if cfg.use_san && self.digest_in.is_none() {
                    return missing("restore --san (need --digestin)");
                }
            }
            Command::Check => {
                if self.digest_in.is_none() {
                    return missing("check (need --digestin)");
                }
            }
            Command::Print => {
                if self.dump_in.is_none() && self.digest_in.is_none() {
                    return missing("print (need --dumpin or --digestin)");
                }
            }
            Command::Digest => {
                if self.dump_in.is_none() || self.digest_out.is_none() {
                    return missing("digest (need --dumpin, --digestout)");
                }
            }
            Command::Merge => {
                if self.dump_out.is_none() && self.rdiff_out.is_none() {
                    return missing("merge (need --dumpout or --rdiffout)");
                }
            }
        }
        Ok(())
    }

    pub fn is_dump_in_open(&self) -> bool {
        self.dump_in.is_some()
    }

    pub fn is_digest_in_open(&self) -> bool {
        self.digest_in.is_some()
    }

    fn dump_in_mut(&mut self) -> Result<&mut DumpInput> {
        self.dump_in
            .as_mut()
            .ok_or_else(|| VdumpError::Config("dump input stream is not open".into()))
    }

    fn digest_in_mut(&mut self) -> Result<&mut DigestInput> {
        self.digest_in
            .as_mut()
            .ok_or_else(|| VdumpError::Config("digest input stream is not open".into()))
    }

    fn dump_out_mut(&mut self) -> Result<&mut DumpOutput> {
        self.dump_out
            .as_mut()
            .ok_or_else(|| VdumpError::Config("dump output stream is not open".into()))
    }

    fn digest_out_mut(&mut self) -> Result<&mut DigestOutput> {
        self.digest_out
            .as_mut()
            .ok_or_else(|| VdumpError::Config("digest output stream is not open".into()))
    }

    fn rdiff_out_mut(&mut self) -> Result<&mut DumpOutput> {
        self.rdiff_out
            .as_mut()
            .ok_or_else(|| VdumpError::Config("rdiff output stream is not open".into()))
    }

    pub fn dump_in_header(&mut self) -> Result<Arc<DumpHeader>> {
        Ok(self.dump_in_mut()?.header())
    }

    pub fn digest_in_header(&mut self) -> Result<Arc<DigestHeader>> {
        Ok(self.digest_in_mut()?.header())
    }

    pub fn can_read_dump(&mut self) -> Result<bool> {
        Ok(!self.dump_in_mut()?.is_end()?)
    }

    pub fn can_read_digest(&mut self) -> Result<bool> {
        Ok(!self.digest_in_mut()?.is_end()?)
    }

    pub fn read_dump_block(&mut self) -> Result<DumpBlock> {
        self.dump_in_mut()?.next_block()?.ok_or_else(|| {
            VdumpError::Consistency("dump input ended before the expected block count".into())
        })
    }

    pub fn read_digest_block(&mut self) -> Result<DigestBlock> {
        self.digest_in_mut()?.next_block()?.ok_or_else(|| {
            VdumpError::Consistency("digest input ended before the expected block count".into())
        })
    }

    pub fn write_dump_header(&mut self, header: &DumpHeader) -> Result<()> {
        self.dump_out_mut()?.write_header(header)
    }

    pub fn write_digest_header(&mut self, header: &DigestHeader) -> Result<()> {
        self.digest_out_mut()?.write_header(header)
    }

    pub fn write_rdiff_header(&mut self, header: &DumpHeader) -> Result<()> {
        self.rdiff_out_mut()?.write_header(header)
    }

    pub fn write_dump_block(&mut self, block: DumpBlock) -> Result<()> {
        self.dump_out_mut()?.put(block)
    }

    pub fn write_digest_block(&mut self, digest: DigestBlock) -> Result<()> {
        self.digest_out_mut()?.put(digest)
    }

    pub fn write_rdiff_block(&mut self, block: DumpBlock) -> Result<()> {
        self.rdiff_out_mut()?.put(block)
    }

    pub fn read_changed_bitmap(&mut self) -> Result<Bitmap> {
        let reader = self.bitmap_in.as_mut().ok_or_else(|| {
            VdumpError::Config("changed-block bitmap stream is not open".into())
        })?;
        Bitmap::read_from(reader)
    }

    /// Join every worker before a fork. Write queues are flushed; read
    /// positions and in-flight records are preserved.
    pub fn pause(&mut self) {
        debug!("pausing archive streams");
        if let Some(s) = &mut self.dump_in {
            s.pause();
        }
        if let Some(s) = &mut self.digest_in {
            s.pause();
        }
        if let Some(s) = &mut self.dump_out {
            s.pause();
        }
        if let Some(s) = &mut self.digest_out {
            s.pause();
        }
        if let Some(s) = &mut self.rdiff_out {
            s.pause();
        }
    }

    pub fn resume(&mut self) {
        debug!("resuming archive streams");
        if let Some(s) = &mut self.dump_in {
            s.resume();
        }
        if let Some(s) = &mut self.digest_in {
            s.resume();
        }
        if let Some(s) = &mut self.dump_out {
            s.resume();
        }
        if let Some(s) = &mut self.digest_out {
            s.resume();
        }
        if let Some(s) = &mut self.rdiff_out {
            s.resume();
        }
    }

    /// Drain and close every stream. Must be called on the success path so
    /// write errors and gzip trailers are not lost to a silent drop.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(s) = &mut self.dump_in {
            s.stop();
        }
        if let Some(s) = &mut self.digest_in {
            s.stop();
        }
        let mut first_err = None;
        if let Some(s) = &mut self.dump_out {
            if let Err(e) = s.stop() {
                first_err.get_or_insert(e);
            }
        }
        if let Some(s) = &mut self.digest_out {
            if let Err(e) = s.stop() {
                first_err.get_or_insert(e);
            }
        }
        if let Some(s) = &mut self.rdiff_out {
            if let Err(e) = s.stop() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ArchiveManager {
    fn drop(&mut self) {
        // Error-path cleanup; the success path already called finish().
        let _ = self.finish();
    }
}

// ---------------------------------------------------------------------------
// DumpArchiveManager
// ---------------------------------------------------------------------------

/// Previous-generation headers, present for diff and incr dumps.
pub struct PrevHeaders {
    pub dump: Arc<DumpHeader>,
    pub digest: Arc<DigestHeader>,
}

/// The three output headers of one dump run.
pub struct OutputHeaders {
    pub dump: DumpHeader,
    pub digest: DigestHeader,
    /// Present for diff and incr.
    pub rdiff: Option<DumpHeader>,
}

/// Archive manager specialized for the dump command: adds the composite
/// operations that keep the three output streams synchronized per offset.
pub struct DumpArchiveManager {
    inner: ArchiveManager,
    mode: DumpMode,
}

impl DumpArchiveManager {
    pub fn open(cfg: &JobConfig) -> Result<Self> {
        debug_assert_eq!(cfg.command, Command::Dump);
        let mode = cfg
            .mode
            .ok_or_else(|| VdumpError::Config("dump requires --mode full|diff|incr".into()))?;
        Ok(DumpArchiveManager {
            inner: ArchiveManager::open(cfg)?,
            mode,
        })
    }

    pub fn mode(&self) -> DumpMode {
        self.mode
    }

    /// Read and validate the previous-generation headers (diff/incr only).
    ///
    /// The previous dump and digest must come from the same snapshot, and
    /// the previous dump must be a full image.
    pub fn read_prev_headers(&mut self) -> Result<Option<PrevHeaders>> {
        if !self.mode.uses_previous() {
            return Ok(None);
        }
        let dump = self.inner.dump_in_header()?;
        let digest = self.inner.digest_in_header()?;
        if !same_snapshot(&dump, &digest) {
            return Err(VdumpError::Consistency(
                "previous dump and digest were not written by the same dump run".into(),
            ));
        }
        if !dump.is_full {
            return Err(VdumpError::Consistency(
                "previous dump must be a full image, not an rdiff".into(),
            ));
        }
        Ok(Some(PrevHeaders { dump, digest }))
    }

    /// Construct the output headers for this run.
    ///
    /// The output dump is always a full image. Diff/incr inherit the
    /// previous uuid so the generations chain; the rdiff header is a copy of
    /// the previous dump header (previous timestamp) marked non-full.
    pub fn build_headers(
        &self,
        disk_size: u64,
        block_size: u64,
        adapter_type: i32,
        metadata: StringMap,
        prev: Option<&PrevHeaders>,
    ) -> Result<OutputHeaders> {
        let now = Timestamp::now();
        let mut dump = DumpHeader::new(disk_size, block_size, adapter_type);
        dump.timestamp = now;
        dump.metadata = metadata;

        let rdiff = if self.mode.uses_previous() {
            let prev = prev.ok_or_else(|| {
                VdumpError::Consistency("diff/incr dump is missing previous headers".into())
            })?;
            dump.uuid = prev.dump.uuid;
            let mut rdiff = (*prev.dump).clone();
            rdiff.is_full = false;
            Some(rdiff)
        } else {
            None
        };

        let digest = DigestHeader::derive_from(&dump);
        Ok(OutputHeaders { dump, digest, rdiff })
    }

    pub fn write_headers(&mut self, headers: &OutputHeaders) -> Result<()> {
        self.inner.write_dump_header(&headers.dump)?;
        self.inner.write_digest_header(&headers.digest)?;
        if let Some(rdiff) = &headers.rdiff {
            self.inner.write_rdiff_header(rdiff)?;
        }
        Ok(())
    }

    /// Read the previous block and its digest, re-checking that the stored
    /// digest matches the stored block. The same check `check` performs,
    /// run inline so a corrupt previous generation never contaminates the
    /// new one.
    pub fn read_prev_pair(&mut self) -> Result<(DumpBlock, DigestBlock)> {
        debug_assert!(self.mode.uses_previous());
        let block = self.inner.read_dump_block()?;
        let digest = self.inner.read_digest_block()?;
        if DigestBlock::of_block(&block) != digest {
            return Err(VdumpError::Consistency(format!(
                "previous archive corrupt: digest mismatch at offset {}",
                block.offset
            )));
        }
        Ok((block, digest))
    }

    /// Write one offset's results to the output streams, in stream order.
    ///
    /// Dump and digest always receive the current block. For diff/incr, the
    /// rdiff receives the **previous** block when the digests differ; the
    /// reverse delta applied to the new full reconstructs the old one.
    /// Returns whether this offset changed.
    pub fn write_blocks(
        &mut self,
        prev: Option<(DumpBlock, DigestBlock)>,
        curr_dump: DumpBlock,
        curr_digest: DigestBlock,
    ) -> Result<bool> {
        self.inner.write_dump_block(curr_dump)?;
        self.inner.write_digest_block(curr_digest)?;

        let mut changed = true;
        if let Some((prev_block, prev_digest)) = prev {
            if prev_digest != curr_digest {
                self.inner.write_rdiff_block(prev_block)?;
            } else {
                changed = false;
            }
        }
        Ok(changed)
    }

    /// Incremental dumps read their changed-block bitmap up front.
    pub fn read_changed_bitmap(&mut self) -> Result<Option<Bitmap>> {
        if self.mode != DumpMode::Incr {
            return Ok(None);
        }
        Ok(Some(self.inner.read_changed_bitmap()?))
    }

    pub fn pause(&mut self) {
        self.inner.pause();
    }

    pub fn resume(&mut self) {
        self.inner.resume();
    }

    pub fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }
}
