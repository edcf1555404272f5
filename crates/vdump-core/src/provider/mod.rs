//! The block provider: the component that reads and writes the live disk.
//!
//! The provider library is process-global and not thread-safe, so in
//! production it runs inside a forked child driven over a framed pipe (see
//! [`controller`]). This module defines the provider interface itself, the
//! geometry record that crosses the wire, and the flat-file implementation
//! used for local images.

pub mod controller;
pub mod frame;

use std::fs::{File, OpenOptions};
use std::io::{BufRead, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::{debug, info};

use crate::record::DumpHeader;
use crate::serialize::{self, StringMap};
use vdump_types::error::{Result, VdumpError};

/// Provider-supplied disk geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    pub adapter_type: i32,
    /// Disk size in blocks.
    pub num_blocks: u64,
    pub num_links: i32,
}

impl DiskInfo {
    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        serialize::put_i32(w, self.adapter_type)?;
        serialize::put_u64(w, self.num_blocks)?;
        serialize::put_i32(w, self.num_links)?;
        Ok(())
    }

    pub fn read_from(r: &mut impl BufRead) -> Result<Self> {
        Ok(DiskInfo {
            adapter_type: serialize::get_i32(r)?,
            num_blocks: serialize::get_u64(r)?,
            num_links: serialize::get_i32(r)?,
        })
    }
}

/// Interface to the disk being backed up or restored.
///
/// One blocking call per operation; offsets are in blocks. Implementations
/// are driven from a single thread (the controller child's command loop).
pub trait BlockProvider: Send {
    fn open(&mut self, read_only: bool) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_block(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn read_info(&mut self) -> Result<DiskInfo>;
    fn read_metadata(&mut self) -> Result<StringMap>;
    fn write_metadata(&mut self, metadata: &StringMap) -> Result<()>;
    fn create_image(&mut self, header: &DumpHeader) -> Result<()>;
    fn shrink(&mut self) -> Result<()>;
    fn transport_mode(&self) -> String;
}

/// Builds a provider inside the controller child after each fork.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, read_only: bool, use_san: bool) -> Result<Box<dyn BlockProvider>>;
}

// ---------------------------------------------------------------------------
// FileProvider
// ---------------------------------------------------------------------------

/// Flat raw-image provider for local disks.
///
/// Image metadata lives in a `<image>.meta` sidecar in the archive map
/// format; an absent sidecar reads as an empty map.
pub struct FileProvider {
    path: PathBuf,
    block_size: u64,
    file: Option<File>,
}

impl FileProvider {
    pub fn new(path: PathBuf, block_size: u64) -> Self {
        FileProvider {
            path,
            block_size,
            file: None,
        }
    }

    fn meta_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".meta");
        PathBuf::from(name)
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| VdumpError::Provider("image is not open".into()))
    }

    fn seek_to_block(&mut self, offset: u64) -> Result<&mut File> {
        let pos = offset
            .checked_mul(self.block_size)
            .ok_or_else(|| VdumpError::Provider(format!("block offset {offset} overflows")))?;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| VdumpError::Provider(format!("seek to block {offset} failed: {e}")))?;
        Ok(file)
    }
}

impl BlockProvider for FileProvider {
    fn open(&mut self, read_only: bool) -> Result<()> {
        debug!(path = %self.path.display(), read_only, "opening image");
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&self.path)
            .map_err(|e| {
                VdumpError::Provider(format!("open '{}' failed: {e}", self.path.display()))
            })?;
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let block_size = self.block_size;
        debug_assert_eq!(buf.len() as u64, block_size);
        let file = self.seek_to_block(offset)?;
        file.read_exact(buf)
            .map_err(|e| VdumpError::Provider(format!("read of block {offset} failed: {e}")))
    }

    fn write_block(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, self.block_size);
        let file = self.seek_to_block(offset)?;
        file.write_all(buf)
            .map_err(|e| VdumpError::Provider(format!("write of block {offset} failed: {e}")))
    }

    fn read_info(&mut self) -> Result<DiskInfo> {
        let block_size = self.block_size;
        let len = self
            .file_mut()?
            .metadata()
            .map_err(|e| VdumpError::Provider(format!("stat failed: {e}")))?
            .len();
        if len % block_size != 0 {
            return Err(VdumpError::Provider(format!(
                "image size {len} is not a multiple of the block size {block_size}"
            )));
        }
        Ok(DiskInfo {
            adapter_type: 0,
            num_blocks: len / block_size,
            num_links: 1,
        })
    }

    fn read_metadata(&mut self) -> Result<StringMap> {
        match File::open(self.meta_path()) {
            Ok(file) => serialize::get_map(&mut std::io::BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StringMap::new()),
            Err(e) => Err(VdumpError::Provider(format!("metadata read failed: {e}"))),
        }
    }

    fn write_metadata(&mut self, metadata: &StringMap) -> Result<()> {
        let mut buf = Vec::new();
        serialize::put_map(&mut buf, metadata)?;
        std::fs::write(self.meta_path(), buf)
            .map_err(|e| VdumpError::Provider(format!("metadata write failed: {e}")))
    }

    fn create_image(&mut self, header: &DumpHeader) -> Result<()> {
        info!(path = %self.path.display(), blocks = header.disk_size, "creating image");
        let file = File::create(&self.path).map_err(|e| {
            VdumpError::Provider(format!("create '{}' failed: {e}", self.path.display()))
        })?;
        file.set_len(header.disk_size * header.block_size)
            .map_err(|e| VdumpError::Provider(format!("sizing image failed: {e}")))?;
        self.write_metadata(&header.metadata)
    }

    fn shrink(&mut self) -> Result<()> {
        // A flat image has no allocation table to reclaim.
        debug!(path = %self.path.display(), "shrink is a no-op for flat images");
        Ok(())
    }

    fn transport_mode(&self) -> String {
        "file".into()
    }
}

/// Factory producing [`FileProvider`]s; `use_san` has no meaning for local
/// files and is ignored.
pub struct FileProviderFactory {
    pub path: PathBuf,
    pub block_size: u64,
}

impl ProviderFactory for FileProviderFactory {
    fn build(&self, _read_only: bool, _use_san: bool) -> Result<Box<dyn BlockProvider>> {
        Ok(Box::new(FileProvider::new(
            self.path.clone(),
            self.block_size,
        )))
    }
}

// ---------------------------------------------------------------------------
// In-process hosting
// ---------------------------------------------------------------------------

/// [`ProviderSession`] that hosts the provider in this process, no child.
///
/// Usable whenever the provider library is fork-free and thread-compatible;
/// `reset` rebuilds the provider from the factory instead of re-forking.
/// Callers keep the same pause/resume discipline so the two hostings stay
/// interchangeable.
///
/// [`ProviderSession`]: controller::ProviderSession
pub struct InProcessSession {
    factory: std::sync::Arc<dyn ProviderFactory>,
    read_only: bool,
    use_san: bool,
    provider: Option<Box<dyn BlockProvider>>,
}

impl InProcessSession {
    pub fn new(
        factory: std::sync::Arc<dyn ProviderFactory>,
        read_only: bool,
        use_san: bool,
    ) -> Self {
        InProcessSession {
            factory,
            read_only,
            use_san,
            provider: None,
        }
    }

    fn provider_mut(&mut self) -> Result<&mut Box<dyn BlockProvider>> {
        if self.provider.is_none() {
            self.provider = Some(self.factory.build(self.read_only, self.use_san)?);
        }
        Ok(self.provider.as_mut().expect("just built"))
    }
}

impl controller::ProviderSession for InProcessSession {
    fn open(&mut self) -> Result<()> {
        let read_only = self.read_only;
        self.provider_mut()?.open(read_only)
    }

    fn close(&mut self) -> Result<()> {
        self.provider_mut()?.close()
    }

    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.provider_mut()?.read_block(offset, buf)
    }

    fn write_block(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.provider_mut()?.write_block(offset, buf)
    }

    fn read_info(&mut self) -> Result<DiskInfo> {
        self.provider_mut()?.read_info()
    }

    fn read_metadata(&mut self) -> Result<StringMap> {
        self.provider_mut()?.read_metadata()
    }

    fn write_metadata(&mut self, metadata: &StringMap) -> Result<()> {
        self.provider_mut()?.write_metadata(metadata)
    }

    fn create_image(&mut self, header: &DumpHeader) -> Result<()> {
        self.provider_mut()?.create_image(header)
    }

    fn shrink(&mut self) -> Result<()> {
        self.provider_mut()?.shrink()
    }

    fn transport_mode(&mut self) -> Result<String> {
        Ok(self.provider_mut()?.transport_mode())
    }

    fn reset(&mut self, read_only: bool, use_san: bool) -> Result<()> {
        self.provider = None;
        self.read_only = read_only;
        self.use_san = use_san;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(dir: &std::path::Path, blocks: &[&[u8]]) -> PathBuf {
        let path = dir.join("disk.img");
        let mut data = Vec::new();
        for b in blocks {
            data.extend_from_slice(b);
        }
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn disk_info_roundtrip() {
        let info = DiskInfo {
            adapter_type: 2,
            num_blocks: 1024,
            num_links: 1,
        };
        let mut buf = Vec::new();
        info.write_to(&mut buf).unwrap();
        let back = DiskInfo::read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn file_provider_reads_and_writes_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let a = vec![1u8; 512];
        let b = vec![2u8; 512];
        let path = image_with(dir.path(), &[&a, &b]);

        let mut provider = FileProvider::new(path, 512);
        provider.open(false).unwrap();
        assert_eq!(provider.read_info().unwrap().num_blocks, 2);

        let mut buf = vec![0u8; 512];
        provider.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, b);

        provider.write_block(0, &vec![9u8; 512]).unwrap();
        provider.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, vec![9u8; 512]);
        provider.close().unwrap();
    }

    #[test]
    fn file_provider_read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_with(dir.path(), &[&[0u8; 512]]);
        let mut provider = FileProvider::new(path, 512);
        provider.open(true).unwrap();
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            provider.read_block(5, &mut buf),
            Err(VdumpError::Provider(_))
        ));
    }

    #[test]
    fn file_provider_rejects_ragged_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.img");
        std::fs::write(&path, vec![0u8; 700]).unwrap();
        let mut provider = FileProvider::new(path, 512);
        provider.open(true).unwrap();
        assert!(matches!(
            provider.read_info(),
            Err(VdumpError::Provider(_))
        ));
    }

    #[test]
    fn metadata_sidecar_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_with(dir.path(), &[&[0u8; 512]]);
        let mut provider = FileProvider::new(path, 512);

        assert!(provider.read_metadata().unwrap().is_empty());

        let mut map = StringMap::new();
        map.insert("cylinders".into(), "1024".into());
        provider.write_metadata(&map).unwrap();
        assert_eq!(provider.read_metadata().unwrap(), map);
    }

    #[test]
    fn create_image_sizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.img");
        let mut provider = FileProvider::new(path.clone(), 512);
        let mut header = DumpHeader::new(8, 512, 0);
        header.metadata.insert("origin".into(), "restore".into());
        provider.create_image(&header).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * 512);
        provider.open(true).unwrap();
        assert_eq!(provider.read_info().unwrap().num_blocks, 8);
        assert_eq!(
            provider.read_metadata().unwrap().get("origin").unwrap(),
            "restore"
        );
    }
}
