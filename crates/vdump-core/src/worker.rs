//! Background reader/writer workers, one per open archive stream.
//!
//! Workers must be joinable and re-startable any number of times: the
//! orchestrator forks (to start or reset the block-provider child), and no
//! thread may be alive across that fork. `pause` joins the worker while
//! keeping the underlying stream and any in-flight record; `resume` spawns
//! a fresh thread that picks up exactly where the old one stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::compress::{ArchiveReader, ArchiveWriter};
use crate::queue::{Queue, DEFAULT_QUEUE_CAPACITY};
use crate::serialize;
use vdump_types::error::{Result, VdumpError};

/// A record that can travel through a worker queue: deserializable from an
/// archive stream (given per-stream context such as the block size) and
/// serializable back.
pub trait Record: Sized + Send + 'static {
    type Seed: Clone + Send + 'static;
    fn read_record(r: &mut ArchiveReader, seed: &Self::Seed) -> Result<Self>;
    fn write_record(&self, w: &mut ArchiveWriter) -> Result<()>;
}

fn store_failure(slot: &Mutex<Option<VdumpError>>, err: VdumpError) {
    let mut guard = slot.lock().unwrap();
    if guard.is_none() {
        *guard = Some(err);
    }
}

// ---------------------------------------------------------------------------
// ReaderWorker
// ---------------------------------------------------------------------------

/// What travels into the reader thread and comes back at join: the stream
/// position and a record that was built but could not be enqueued before the
/// queue closed. Redelivered first thing after resume, so pause never loses
/// or duplicates a record.
struct ReadState<T> {
    stream: ArchiveReader,
    pending: Option<T>,
}

pub struct ReaderWorker<T: Record> {
    seed: T::Seed,
    queue: Arc<Queue<T>>,
    ended: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<VdumpError>>>,
    handle: Option<JoinHandle<ReadState<T>>>,
    parked: Option<ReadState<T>>,
}

impl<T: Record> ReaderWorker<T> {
    pub fn new(stream: ArchiveReader, seed: T::Seed) -> Self {
        ReaderWorker {
            seed,
            queue: Arc::new(Queue::new(DEFAULT_QUEUE_CAPACITY)),
            ended: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
            handle: None,
            parked: Some(ReadState {
                stream,
                pending: None,
            }),
        }
    }

    /// Spawn the worker thread. No-op while one is already running.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            debug!("reader start ignored: worker already running");
            return;
        }
        let Some(state) = self.parked.take() else {
            debug!("reader start ignored: stream lost to an earlier panic");
            return;
        };
        self.ended.store(false, Ordering::SeqCst);
        self.queue.open();

        let seed = self.seed.clone();
        let queue = Arc::clone(&self.queue);
        let ended = Arc::clone(&self.ended);
        let failure = Arc::clone(&self.failure);
        self.handle = Some(std::thread::spawn(move || {
            read_loop(state, seed, &queue, &ended, &failure)
        }));
    }

    /// Close the queue and join the worker. Pending items stay drainable.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.queue.close();
            match handle.join() {
                Ok(state) => self.parked = Some(state),
                Err(_) => {
                    store_failure(&self.failure, VdumpError::Other("reader worker panicked".into()))
                }
            }
        }
    }

    pub fn pause(&mut self) {
        self.stop();
    }

    pub fn resume(&mut self) {
        self.start();
    }

    /// Next record, blocking. `None` means end-of-stream or worker failure;
    /// callers distinguish via [`take_failure`](Self::take_failure).
    pub fn get(&self) -> Option<T> {
        self.queue.get()
    }

    /// True iff the worker reached end-of-stream and the queue is drained.
    pub fn is_end(&self) -> bool {
        self.ended.load(Ordering::SeqCst) && self.queue.is_empty()
    }

    pub fn take_failure(&self) -> Option<VdumpError> {
        self.failure.lock().unwrap().take()
    }
}

impl<T: Record> Drop for ReaderWorker<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop<T: Record>(
    mut state: ReadState<T>,
    seed: T::Seed,
    queue: &Queue<T>,
    ended: &AtomicBool,
    failure: &Mutex<Option<VdumpError>>,
) -> ReadState<T> {
    loop {
        let item = match state.pending.take() {
            Some(item) => item,
            None => {
                if queue.is_closed() {
                    break;
                }
                match serialize::at_eof(&mut state.stream) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        store_failure(failure, e.into());
                        break;
                    }
                }
                match T::read_record(&mut state.stream, &seed) {
                    Ok(item) => item,
                    Err(e) => {
                        store_failure(failure, e);
                        break;
                    }
                }
            }
        };
        if let Err(item) = queue.put(item) {
            // Queue closed under us (pause): keep the record for redelivery.
            state.pending = Some(item);
            break;
        }
    }
    ended.store(true, Ordering::SeqCst);
    // Close so get() returns None at end-of-stream instead of blocking.
    // resume() re-opens.
    queue.close();
    state
}

// ---------------------------------------------------------------------------
// WriterWorker
// ---------------------------------------------------------------------------

pub struct WriterWorker<T: Record> {
    queue: Arc<Queue<T>>,
    stop_queuing: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<VdumpError>>>,
    handle: Option<JoinHandle<ArchiveWriter>>,
    parked: Option<ArchiveWriter>,
}

impl<T: Record> WriterWorker<T> {
    pub fn new(stream: ArchiveWriter) -> Self {
        WriterWorker {
            queue: Arc::new(Queue::new(DEFAULT_QUEUE_CAPACITY)),
            stop_queuing: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
            handle: None,
            parked: Some(stream),
        }
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            debug!("writer start ignored: worker already running");
            return;
        }
        let Some(stream) = self.parked.take() else {
            debug!("writer start ignored: stream lost to an earlier panic");
            return;
        };
        self.stop_queuing.store(false, Ordering::SeqCst);
        self.queue.open();

        let queue = Arc::clone(&self.queue);
        let stop_queuing = Arc::clone(&self.stop_queuing);
        let failure = Arc::clone(&self.failure);
        self.handle = Some(std::thread::spawn(move || {
            write_loop(stream, &queue, &stop_queuing, &failure)
        }));
    }

    /// Enqueue a record for the worker. Once handed over the record must not
    /// be touched; the worker owns it.
    pub fn put(&self, item: T) -> Result<()> {
        if self.queue.put(item).is_err() {
            return Err(self
                .take_failure()
                .unwrap_or_else(|| VdumpError::Other("writer queue is closed".into())));
        }
        Ok(())
    }

    /// Signal that no more records will be queued, drain the queue, and join
    /// the worker. The stream is parked for [`take_stream`](Self::take_stream).
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop_queuing.store(true, Ordering::SeqCst);
            self.queue.close();
            match handle.join() {
                Ok(stream) => self.parked = Some(stream),
                Err(_) => {
                    store_failure(&self.failure, VdumpError::Other("writer worker panicked".into()))
                }
            }
        }
    }

    pub fn pause(&mut self) {
        self.stop();
    }

    pub fn resume(&mut self) {
        self.start();
    }

    /// Hand the underlying stream back after `stop`, for trailer finishing.
    pub fn take_stream(&mut self) -> Option<ArchiveWriter> {
        self.parked.take()
    }

    pub fn take_failure(&self) -> Option<VdumpError> {
        self.failure.lock().unwrap().take()
    }
}

impl<T: Record> Drop for WriterWorker<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_loop<T: Record>(
    mut stream: ArchiveWriter,
    queue: &Queue<T>,
    stop_queuing: &AtomicBool,
    failure: &Mutex<Option<VdumpError>>,
) -> ArchiveWriter {
    loop {
        if stop_queuing.load(Ordering::SeqCst) && queue.is_empty() {
            break;
        }
        match queue.get() {
            Some(item) => {
                if let Err(e) = item.write_record(&mut stream) {
                    store_failure(failure, e);
                    // Refuse further puts; the orchestrator sees the error
                    // on its next put.
                    queue.close();
                    break;
                }
            }
            None => break, // closed and drained
        }
    }
    stream
}
