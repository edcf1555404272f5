//! Archive record types: dump/digest headers and blocks.
//!
//! A dump or rdiff file is one serialized [`DumpHeader`] followed by
//! serialized [`DumpBlock`]s in ascending offset order. A digest file is one
//! [`DigestHeader`] followed by exactly `disk_size` [`DigestBlock`]s.
//!
//! A disk is identified by `uuid` across generations; one snapshot is
//! identified by `(uuid, timestamp)`. See [`same_disk`] / [`same_snapshot`].

pub mod bitmap;

use std::io::{BufRead, Write};

use crate::serialize::{self, StringMap};
use crate::timestamp::Timestamp;
use vdump_types::error::{Result, VdumpError};
use vdump_types::fingerprint::{BlockDigest, DIGEST_LEN};

/// Smallest addressable unit; block sizes must be a multiple of this.
pub const SECTOR_SIZE: u64 = 512;

/// Length of the archive uuid (not a disk-metadata uuid).
pub const UUID_LEN: usize = 16;

pub fn generate_uuid() -> [u8; UUID_LEN] {
    rand::random()
}

fn read_uuid(r: &mut impl BufRead) -> Result<[u8; UUID_LEN]> {
    let bytes = serialize::get_bytes(r)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| VdumpError::Format(format!("uuid must be {UUID_LEN} bytes, got {}", bytes.len())))
}

// ---------------------------------------------------------------------------
// DumpHeader
// ---------------------------------------------------------------------------

/// Header of a dump or rdiff stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpHeader {
    /// Disk size in blocks.
    pub disk_size: u64,
    /// Block size in bytes, a multiple of [`SECTOR_SIZE`].
    pub block_size: u64,
    pub adapter_type: i32,
    /// `true` for a full dump, `false` for an rdiff.
    pub is_full: bool,
    pub uuid: [u8; UUID_LEN],
    pub timestamp: Timestamp,
    pub metadata: StringMap,
}

impl DumpHeader {
    /// Fresh full-dump header with a newly generated uuid.
    pub fn new(disk_size: u64, block_size: u64, adapter_type: i32) -> Self {
        DumpHeader {
            disk_size,
            block_size,
            adapter_type,
            is_full: true,
            uuid: generate_uuid(),
            timestamp: Timestamp::now(),
            metadata: StringMap::new(),
        }
    }

    /// Same disk across generations: size, block size and uuid agree.
    /// Timestamps may differ.
    pub fn same_disk(&self, rhs: &DumpHeader) -> bool {
        self.disk_size == rhs.disk_size
            && self.block_size == rhs.block_size
            && self.uuid == rhs.uuid
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        serialize::put_u64(w, self.disk_size)?;
        serialize::put_u64(w, self.block_size)?;
        serialize::put_i32(w, self.adapter_type)?;
        serialize::put_bool(w, self.is_full)?;
        serialize::put_bytes(w, &self.uuid)?;
        self.timestamp.write_to(w)?;
        serialize::put_map(w, &self.metadata)?;
        Ok(())
    }

    pub fn read_from(r: &mut impl BufRead) -> Result<Self> {
        Ok(DumpHeader {
            disk_size: serialize::get_u64(r)?,
            block_size: serialize::get_u64(r)?,
            adapter_type: serialize::get_i32(r)?,
            is_full: serialize::get_bool(r)?,
            uuid: read_uuid(r)?,
            timestamp: Timestamp::read_from(r)?,
            metadata: serialize::get_map(r)?,
        })
    }

    pub fn print(&self, w: &mut impl Write) -> Result<()> {
        writeln!(w, "dump header:")?;
        writeln!(w, "  disk_size:    {} blocks", self.disk_size)?;
        writeln!(w, "  block_size:   {} bytes", self.block_size)?;
        writeln!(w, "  adapter_type: {}", self.adapter_type)?;
        writeln!(w, "  is_full:      {}", self.is_full)?;
        writeln!(w, "  uuid:         {}", hex::encode(self.uuid))?;
        writeln!(w, "  timestamp:    {}", self.timestamp.unix())?;
        writeln!(w, "  metadata:     {} entries", self.metadata.len())?;
        for (k, v) in &self.metadata {
            writeln!(w, "    {k} -> {v}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DumpBlock
// ---------------------------------------------------------------------------

/// Block content. All-zero blocks carry no payload anywhere: not in memory,
/// not on the wire. There is no unresolved state to serialize by accident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockData {
    AllZero,
    Data(Vec<u8>),
}

/// One block of disk data inside a dump or rdiff stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpBlock {
    /// Position in blocks from the start of the disk.
    pub offset: u64,
    pub data: BlockData,
}

impl DumpBlock {
    /// Classify a freshly read buffer: scans for any nonzero byte and drops
    /// the payload entirely when there is none.
    pub fn from_raw(offset: u64, payload: Vec<u8>) -> Self {
        if payload.iter().all(|&b| b == 0) {
            DumpBlock {
                offset,
                data: BlockData::AllZero,
            }
        } else {
            DumpBlock {
                offset,
                data: BlockData::Data(payload),
            }
        }
    }

    pub fn all_zero(offset: u64) -> Self {
        DumpBlock {
            offset,
            data: BlockData::AllZero,
        }
    }

    pub fn is_all_zero(&self) -> bool {
        matches!(self.data, BlockData::AllZero)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match &self.data {
            BlockData::AllZero => None,
            BlockData::Data(buf) => Some(buf),
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        serialize::put_u64(w, self.offset)?;
        serialize::put_bool(w, self.is_all_zero())?;
        if let BlockData::Data(buf) = &self.data {
            serialize::put_bytes(w, buf)?;
        }
        Ok(())
    }

    pub fn read_from(r: &mut impl BufRead, block_size: u64) -> Result<Self> {
        let offset = serialize::get_u64(r)?;
        let is_all_zero = serialize::get_bool(r)?;
        let data = if is_all_zero {
            BlockData::AllZero
        } else {
            let buf = serialize::get_bytes(r)?;
            if buf.len() as u64 != block_size {
                return Err(VdumpError::Format(format!(
                    "block at offset {offset} has {} payload bytes, expected {block_size}",
                    buf.len()
                )));
            }
            BlockData::Data(buf)
        };
        Ok(DumpBlock { offset, data })
    }

    pub fn print(&self, w: &mut impl Write) -> Result<()> {
        match &self.data {
            BlockData::AllZero => writeln!(w, "block offset={} all_zero", self.offset)?,
            BlockData::Data(buf) => {
                writeln!(w, "block offset={} size={}", self.offset, buf.len())?
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DigestHeader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestHeader {
    pub disk_size: u64,
    pub block_size: u64,
    pub uuid: [u8; UUID_LEN],
    pub timestamp: Timestamp,
}

impl DigestHeader {
    /// Digest header for the dump described by `dump_h`: identical identity
    /// triple and timestamp.
    pub fn derive_from(dump_h: &DumpHeader) -> Self {
        DigestHeader {
            disk_size: dump_h.disk_size,
            block_size: dump_h.block_size,
            uuid: dump_h.uuid,
            timestamp: dump_h.timestamp,
        }
    }

    pub fn same_disk(&self, rhs: &DigestHeader) -> bool {
        self.disk_size == rhs.disk_size
            && self.block_size == rhs.block_size
            && self.uuid == rhs.uuid
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        serialize::put_u64(w, self.disk_size)?;
        serialize::put_u64(w, self.block_size)?;
        serialize::put_bytes(w, &self.uuid)?;
        self.timestamp.write_to(w)?;
        Ok(())
    }

    pub fn read_from(r: &mut impl BufRead) -> Result<Self> {
        Ok(DigestHeader {
            disk_size: serialize::get_u64(r)?,
            block_size: serialize::get_u64(r)?,
            uuid: read_uuid(r)?,
            timestamp: Timestamp::read_from(r)?,
        })
    }

    pub fn print(&self, w: &mut impl Write) -> Result<()> {
        writeln!(w, "digest header:")?;
        writeln!(w, "  disk_size:  {} blocks", self.disk_size)?;
        writeln!(w, "  block_size: {} bytes", self.block_size)?;
        writeln!(w, "  uuid:       {}", hex::encode(self.uuid))?;
        writeln!(w, "  timestamp:  {}", self.timestamp.unix())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DigestBlock
// ---------------------------------------------------------------------------

/// Per-block fingerprint. Any two all-zero blocks compare equal; data blocks
/// compare by fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestBlock {
    AllZero,
    Digest(BlockDigest),
}

impl DigestBlock {
    pub fn of_block(block: &DumpBlock) -> Self {
        match block.payload() {
            None => DigestBlock::AllZero,
            Some(buf) => DigestBlock::Digest(BlockDigest::compute(buf)),
        }
    }

    pub fn is_all_zero(&self) -> bool {
        matches!(self, DigestBlock::AllZero)
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        serialize::put_bool(w, self.is_all_zero())?;
        if let DigestBlock::Digest(d) = self {
            serialize::put_bytes(w, d.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_from(r: &mut impl BufRead) -> Result<Self> {
        if serialize::get_bool(r)? {
            return Ok(DigestBlock::AllZero);
        }
        let bytes = serialize::get_bytes(r)?;
        let digest = BlockDigest::from_bytes(&bytes).ok_or_else(|| {
            VdumpError::Format(format!(
                "fingerprint must be {DIGEST_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(DigestBlock::Digest(digest))
    }

    pub fn print(&self, w: &mut impl Write) -> Result<()> {
        match self {
            DigestBlock::AllZero => writeln!(w, "digest all_zero")?,
            DigestBlock::Digest(d) => writeln!(w, "digest {d}")?,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cross-stream identity
// ---------------------------------------------------------------------------

/// The dump and digest describe the same disk (any generation).
pub fn same_disk(dump_h: &DumpHeader, digest_h: &DigestHeader) -> bool {
    dump_h.disk_size == digest_h.disk_size
        && dump_h.block_size == digest_h.block_size
        && dump_h.uuid == digest_h.uuid
}

/// The dump and digest were written by the same dump run.
pub fn same_snapshot(dump_h: &DumpHeader, digest_h: &DigestHeader) -> bool {
    same_disk(dump_h, digest_h) && dump_h.timestamp == digest_h.timestamp
}
