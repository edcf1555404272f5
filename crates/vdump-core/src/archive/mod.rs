//! Per-stream archive I/O managers.
//!
//! Each open archive stream is a header plus a sequence of blocks. The
//! manager owns the file (with optional gzip), the parsed header, and a
//! [`BlockSource`] or [`BlockSink`] backend. Two backends exist with one
//! contract: the parallel one runs a worker thread behind a bounded queue,
//! the single-threaded one does the I/O inline. Which one a job uses is a
//! construction-time policy ([`IoProfile`]); callers cannot observe the
//! difference except in scheduling.

pub mod manager;
pub mod multi;

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::compress::{self, ArchiveReader, ArchiveWriter};
use crate::config::IoProfile;
use crate::record::{DigestBlock, DigestHeader, DumpBlock, DumpHeader};
use crate::serialize;
use crate::worker::{ReaderWorker, Record, WriterWorker};
use vdump_types::error::{Result, VdumpError};

impl Record for DumpBlock {
    /// Block size in bytes; payload length is validated against it.
    type Seed = u64;

    fn read_record(r: &mut ArchiveReader, seed: &u64) -> Result<Self> {
        DumpBlock::read_from(r, *seed)
    }

    fn write_record(&self, w: &mut ArchiveWriter) -> Result<()> {
        self.write_to(w)
    }
}

impl Record for DigestBlock {
    type Seed = ();

    fn read_record(r: &mut ArchiveReader, _seed: &()) -> Result<Self> {
        DigestBlock::read_from(r)
    }

    fn write_record(&self, w: &mut ArchiveWriter) -> Result<()> {
        self.write_to(w)
    }
}

// ---------------------------------------------------------------------------
// Source / sink backends
// ---------------------------------------------------------------------------

/// Reading side of one archive stream, header already consumed.
pub trait BlockSource<T>: Send {
    /// Next block; `Ok(None)` at end of stream.
    fn get(&mut self) -> Result<Option<T>>;
    /// True iff the stream is exhausted and nothing is buffered.
    fn is_end(&mut self) -> Result<bool>;
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
}

/// Writing side of one archive stream, header already written.
pub trait BlockSink<T>: Send {
    fn put(&mut self, item: T) -> Result<()>;
    fn pause(&mut self);
    fn resume(&mut self);
    /// Drain, join, and finish the underlying stream (gzip trailer).
    fn stop(&mut self) -> Result<()>;
}

struct ParallelSource<T: Record> {
    worker: ReaderWorker<T>,
    /// Block consumed by an `is_end` probe, delivered by the next `get`.
    peeked: Option<T>,
}

impl<T: Record> ParallelSource<T> {
    fn new(stream: ArchiveReader, seed: T::Seed) -> Self {
        let mut worker = ReaderWorker::new(stream, seed);
        worker.start();
        ParallelSource {
            worker,
            peeked: None,
        }
    }
}

impl<T: Record> BlockSource<T> for ParallelSource<T> {
    fn get(&mut self) -> Result<Option<T>> {
        if let Some(item) = self.peeked.take() {
            return Ok(Some(item));
        }
        match self.worker.get() {
            Some(item) => Ok(Some(item)),
            None => match self.worker.take_failure() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Blocking peek: waits for the next block or end-of-stream, so the
    /// answer is definitive, not a racy snapshot of the worker's state.
    fn is_end(&mut self) -> Result<bool> {
        if self.peeked.is_some() {
            return Ok(false);
        }
        match self.worker.get() {
            Some(item) => {
                self.peeked = Some(item);
                Ok(false)
            }
            None => match self.worker.take_failure() {
                Some(err) => Err(err),
                None => Ok(true),
            },
        }
    }

    fn pause(&mut self) {
        self.worker.pause();
    }

    fn resume(&mut self) {
        self.worker.resume();
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

struct SyncSource<T: Record> {
    stream: ArchiveReader,
    seed: T::Seed,
}

impl<T: Record> BlockSource<T> for SyncSource<T> {
    fn get(&mut self) -> Result<Option<T>> {
        if serialize::at_eof(&mut self.stream)? {
            return Ok(None);
        }
        T::read_record(&mut self.stream, &self.seed).map(Some)
    }

    fn is_end(&mut self) -> Result<bool> {
        serialize::at_eof(&mut self.stream)
    }

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn stop(&mut self) {}
}

struct ParallelSink<T: Record> {
    worker: WriterWorker<T>,
}

impl<T: Record> ParallelSink<T> {
    fn new(stream: ArchiveWriter) -> Self {
        let mut worker = WriterWorker::new(stream);
        worker.start();
        ParallelSink { worker }
    }
}

impl<T: Record> BlockSink<T> for ParallelSink<T> {
    fn put(&mut self, item: T) -> Result<()> {
        self.worker.put(item)
    }

    fn pause(&mut self) {
        self.worker.pause();
    }

    fn resume(&mut self) {
        self.worker.resume();
    }

    fn stop(&mut self) -> Result<()> {
        self.worker.stop();
        if let Some(err) = self.worker.take_failure() {
            return Err(err);
        }
        match self.worker.take_stream() {
            Some(mut stream) => {
                stream.finish()?;
                Ok(())
            }
            None => Err(VdumpError::Other("writer stream already taken".into())),
        }
    }
}

struct SyncSink<T: Record> {
    stream: Option<ArchiveWriter>,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Record> BlockSink<T> for SyncSink<T> {
    fn put(&mut self, item: T) -> Result<()> {
        match self.stream.as_mut() {
            Some(stream) => item.write_record(stream),
            None => Err(VdumpError::Other("archive stream already stopped".into())),
        }
    }

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn stop(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.finish()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Input stream managers
// ---------------------------------------------------------------------------

/// Input side of a dump or digest stream: shared header plus block source.
pub struct InputStream<H, T: Record> {
    header: Arc<H>,
    source: Box<dyn BlockSource<T>>,
}

impl<H, T: Record> InputStream<H, T> {
    fn with_backend(header: H, stream: ArchiveReader, seed: T::Seed, profile: IoProfile) -> Self {
        let source: Box<dyn BlockSource<T>> = match profile {
            IoProfile::Parallel => Box::new(ParallelSource::new(stream, seed)),
            IoProfile::Single => Box::new(SyncSource { stream, seed }),
        };
        InputStream {
            header: Arc::new(header),
            source,
        }
    }

    /// Header parsed at open time. Shared and immutable from then on.
    pub fn header(&self) -> Arc<H> {
        Arc::clone(&self.header)
    }

    pub fn next_block(&mut self) -> Result<Option<T>> {
        self.source.get()
    }

    pub fn is_end(&mut self) -> Result<bool> {
        self.source.is_end()
    }

    pub fn pause(&mut self) {
        self.source.pause();
    }

    pub fn resume(&mut self) {
        self.source.resume();
    }

    pub fn stop(&mut self) {
        self.source.stop();
    }
}

pub type DumpInput = InputStream<DumpHeader, DumpBlock>;
pub type DigestInput = InputStream<DigestHeader, DigestBlock>;

pub fn open_dump_input(path: &Path, profile: IoProfile) -> Result<DumpInput> {
    debug!(path = %path.display(), "opening dump input");
    let mut stream = compress::open_input(path)?;
    let header = DumpHeader::read_from(&mut stream)
        .map_err(|e| annotate(e, "dump header", path))?;
    let block_size = header.block_size;
    Ok(InputStream::with_backend(header, stream, block_size, profile))
}

pub fn open_digest_input(path: &Path, profile: IoProfile) -> Result<DigestInput> {
    debug!(path = %path.display(), "opening digest input");
    let mut stream = compress::open_input(path)?;
    let header = DigestHeader::read_from(&mut stream)
        .map_err(|e| annotate(e, "digest header", path))?;
    Ok(InputStream::with_backend(header, stream, (), profile))
}

fn annotate(err: VdumpError, what: &str, path: &Path) -> VdumpError {
    VdumpError::Format(format!("{what} in '{}': {err}", path.display()))
}

/// Read just the header of a dump/rdiff archive, without keeping a stream
/// open. Used to learn the block size before the provider child starts.
pub fn read_archive_header(path: &Path) -> Result<DumpHeader> {
    let mut stream = compress::open_input(path)?;
    DumpHeader::read_from(&mut stream).map_err(|e| annotate(e, "dump header", path))
}

// ---------------------------------------------------------------------------
// Output stream managers
// ---------------------------------------------------------------------------

/// A header that can open an output stream.
pub trait WireHeader {
    fn write_wire(&self, w: &mut ArchiveWriter) -> Result<()>;
}

impl WireHeader for DumpHeader {
    fn write_wire(&self, w: &mut ArchiveWriter) -> Result<()> {
        self.write_to(w)
    }
}

impl WireHeader for DigestHeader {
    fn write_wire(&self, w: &mut ArchiveWriter) -> Result<()> {
        self.write_to(w)
    }
}

/// Output side of a stream. The header is written synchronously before the
/// worker starts; blocks then go through the sink until `stop`.
pub struct OutputStream<T: Record> {
    profile: IoProfile,
    state: OutputState<T>,
}

enum OutputState<T: Record> {
    /// Open file, header not yet written, no worker.
    Pending(Option<ArchiveWriter>),
    Running(Box<dyn BlockSink<T>>),
    Stopped,
}

impl<T: Record> OutputStream<T> {
    pub fn create(path: &Path, profile: IoProfile) -> Result<Self> {
        debug!(path = %path.display(), "opening archive output");
        let stream = compress::open_output(path)?;
        Ok(OutputStream {
            profile,
            state: OutputState::Pending(Some(stream)),
        })
    }

    /// Write the stream header and start the block sink. Must be called
    /// exactly once, before any `put`.
    pub fn write_header(&mut self, header: &impl WireHeader) -> Result<()> {
        let OutputState::Pending(slot) = &mut self.state else {
            return Err(VdumpError::Other("archive header written twice".into()));
        };
        let mut stream = slot
            .take()
            .ok_or_else(|| VdumpError::Other("archive output stream missing".into()))?;
        header.write_wire(&mut stream)?;
        let sink: Box<dyn BlockSink<T>> = match self.profile {
            IoProfile::Parallel => Box::new(ParallelSink::new(stream)),
            IoProfile::Single => Box::new(SyncSink {
                stream: Some(stream),
                _marker: std::marker::PhantomData,
            }),
        };
        self.state = OutputState::Running(sink);
        Ok(())
    }

    pub fn put(&mut self, item: T) -> Result<()> {
        match &mut self.state {
            OutputState::Running(sink) => sink.put(item),
            _ => Err(VdumpError::Other(
                "archive output used before its header was written".into(),
            )),
        }
    }

    pub fn pause(&mut self) {
        if let OutputState::Running(sink) = &mut self.state {
            sink.pause();
        }
    }

    pub fn resume(&mut self) {
        if let OutputState::Running(sink) = &mut self.state {
            sink.resume();
        }
    }

    /// Drain and close. Idempotent; a stream whose header was never written
    /// finishes as an empty container.
    pub fn stop(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, OutputState::Stopped) {
            OutputState::Running(mut sink) => sink.stop(),
            OutputState::Pending(Some(mut stream)) => {
                stream.finish()?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

pub type DumpOutput = OutputStream<DumpBlock>;
pub type DigestOutput = OutputStream<DigestBlock>;
