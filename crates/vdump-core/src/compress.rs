//! Archive stream opening with transparent gzip.
//!
//! Any stream whose filename ends in `.gz` is gzip-wrapped. Writers use the
//! fastest compression level: dump payloads dominate and the pipeline is
//! disk-bound, not ratio-bound.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use vdump_types::error::Result;

pub type ArchiveReader = Box<dyn BufRead + Send>;
pub type ArchiveWriter = Box<dyn ArchiveSink>;

/// A writable archive stream that can flush its container trailer.
///
/// Gzip needs an explicit finish to emit the trailer; a plain file only
/// needs a flush. Stream managers call [`finish`] exactly once, at stop.
///
/// [`finish`]: ArchiveSink::finish
pub trait ArchiveSink: Write + Send {
    fn finish(&mut self) -> io::Result<()>;
}

impl ArchiveSink for BufWriter<File> {
    fn finish(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl<W: Write + Send> ArchiveSink for GzEncoder<W> {
    fn finish(&mut self) -> io::Result<()> {
        self.try_finish()
    }
}

pub fn is_gzip_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

pub fn open_input(path: &Path) -> Result<ArchiveReader> {
    let file = File::open(path)?;
    if is_gzip_path(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(
            BufReader::new(file),
        ))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub fn open_output(path: &Path) -> Result<ArchiveWriter> {
    let file = File::create(path)?;
    if is_gzip_path(path) {
        Ok(Box::new(GzEncoder::new(
            BufWriter::new(file),
            Compression::fast(),
        )))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}
