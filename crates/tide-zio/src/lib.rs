#![forbid(unsafe_code)]
//! I/O pipeline primitives for tidepool.
//!
//! Provides the `Zio` client I/O object with bypass/execute semantics,
//! `ChildRead` device fills with completion callbacks, and the
//! `IoScheduler` that submits fills asynchronously on a worker thread.
//!
//! A caching layer absorbs a client I/O by calling [`Zio::bypass`]
//! (while it still holds whatever lock made the decision coherent) and
//! later completes it with [`Zio::execute`]. Waiters block on the
//! I/O's completion latch, not on the layer that absorbed it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use tide_error::{PoolError, Result};
use tide_types::ByteOffset;
use tracing::{trace, warn};

mod device;

pub use device::{ByteDevice, FileByteDevice};

bitflags! {
    /// Per-I/O behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFlags: u32 {
        /// Caching layers must not absorb or retain this I/O.
        const DONT_CACHE = 1 << 0;
        /// Do not propagate this I/O's error to a parent I/O.
        const DONT_PROPAGATE = 1 << 1;
        /// The framework must not retry this I/O on failure.
        const DONT_RETRY = 1 << 2;
        /// No bookmark accounting for this I/O.
        const NO_BOOKMARK = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPriority {
    SyncRead,
    SyncWrite,
    /// Device read populating a cache line.
    CacheFill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Issued, not yet absorbed or completed.
    Open,
    /// A caching layer has taken responsibility for completion.
    Bypassed,
    Done,
}

#[derive(Debug)]
struct ZioState {
    data: Vec<u8>,
    error: Option<Arc<PoolError>>,
    stage: Stage,
}

/// A client I/O.
///
/// Reads own a zeroed destination buffer of exactly `size` bytes;
/// writes own their payload. All state mutation goes through the
/// internal mutex, so a `Zio` can sit on a delegate queue while its
/// issuer holds another reference.
#[derive(Debug)]
pub struct Zio {
    io_type: IoType,
    priority: IoPriority,
    flags: IoFlags,
    offset: ByteOffset,
    size: usize,
    state: Mutex<ZioState>,
    done: Condvar,
}

impl Zio {
    /// A read of `size` bytes at `offset`.
    #[must_use]
    pub fn read(offset: ByteOffset, size: usize) -> Arc<Self> {
        Self::read_with_flags(offset, size, IoFlags::empty())
    }

    /// A read carrying explicit flags.
    #[must_use]
    pub fn read_with_flags(offset: ByteOffset, size: usize, flags: IoFlags) -> Arc<Self> {
        debug_assert!(size > 0);
        Arc::new(Self {
            io_type: IoType::Read,
            priority: IoPriority::SyncRead,
            flags,
            offset,
            size,
            state: Mutex::new(ZioState {
                data: vec![0_u8; size],
                error: None,
                stage: Stage::Open,
            }),
            done: Condvar::new(),
        })
    }

    /// A write of `payload` at `offset`.
    #[must_use]
    pub fn write(offset: ByteOffset, payload: Vec<u8>) -> Arc<Self> {
        debug_assert!(!payload.is_empty());
        let size = payload.len();
        Arc::new(Self {
            io_type: IoType::Write,
            priority: IoPriority::SyncWrite,
            flags: IoFlags::empty(),
            offset,
            size,
            state: Mutex::new(ZioState {
                data: payload,
                error: None,
                stage: Stage::Open,
            }),
            done: Condvar::new(),
        })
    }

    #[must_use]
    pub fn io_type(&self) -> IoType {
        self.io_type
    }

    #[must_use]
    pub fn priority(&self) -> IoPriority {
        self.priority
    }

    #[must_use]
    pub fn flags(&self) -> IoFlags {
        self.flags
    }

    #[must_use]
    pub fn offset(&self) -> ByteOffset {
        self.offset
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Mark this I/O as satisfied by a caching layer.
    ///
    /// The layer that bypasses an I/O owns its completion: it must
    /// eventually call [`Zio::execute`].
    pub fn bypass(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.stage, Stage::Open);
        state.stage = Stage::Bypassed;
    }

    /// Complete this I/O and wake any waiters.
    pub fn execute(&self) {
        let mut state = self.state.lock();
        debug_assert_ne!(state.stage, Stage::Done);
        state.stage = Stage::Done;
        drop(state);
        self.done.notify_all();
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.lock().stage == Stage::Done
    }

    /// Block until this I/O completes.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.stage != Stage::Done {
            self.done.wait(&mut state);
        }
    }

    /// Block until this I/O completes or `timeout` elapses.
    ///
    /// Returns `true` if the I/O completed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.stage != Stage::Done {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                return state.stage == Stage::Done;
            }
        }
        true
    }

    /// Fill the whole destination buffer from `src`.
    ///
    /// `src.len()` must equal [`Zio::size`].
    pub fn copy_from(&self, src: &[u8]) {
        let mut state = self.state.lock();
        debug_assert_eq!(src.len(), self.size);
        state.data.copy_from_slice(src);
    }

    pub fn set_error(&self, error: Option<Arc<PoolError>>) {
        self.state.lock().error = error;
    }

    #[must_use]
    pub fn error(&self) -> Option<Arc<PoolError>> {
        self.state.lock().error.clone()
    }

    /// Run `f` against the data buffer.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.state.lock();
        f(&state.data)
    }

    /// Run `f` against the data buffer mutably.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.data)
    }

    /// Copy of the data buffer.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }
}

/// Completion record handed to a [`ChildRead`] callback.
///
/// Owns the buffer the device read into. `error` is `None` on success.
#[derive(Debug)]
pub struct ChildCompletion {
    pub offset: ByteOffset,
    pub data: Vec<u8>,
    pub error: Option<Arc<PoolError>>,
}

type CompletionFn = Box<dyn FnOnce(ChildCompletion) + Send + 'static>;

/// A device read issued on behalf of another I/O.
///
/// Constructed first, submitted separately via [`IoScheduler::nowait`].
/// The child owns its destination buffer; completion hands the buffer
/// (and any error) to the callback on the scheduler's worker thread.
pub struct ChildRead {
    offset: ByteOffset,
    priority: IoPriority,
    flags: IoFlags,
    data: Vec<u8>,
    on_complete: CompletionFn,
}

impl ChildRead {
    #[must_use]
    pub fn new(
        offset: ByteOffset,
        size: usize,
        priority: IoPriority,
        flags: IoFlags,
        on_complete: impl FnOnce(ChildCompletion) + Send + 'static,
    ) -> Self {
        debug_assert!(size > 0);
        Self {
            offset,
            priority,
            flags,
            data: vec![0_u8; size],
            on_complete: Box::new(on_complete),
        }
    }

    #[must_use]
    pub fn offset(&self) -> ByteOffset {
        self.offset
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn priority(&self) -> IoPriority {
        self.priority
    }

    #[must_use]
    pub fn flags(&self) -> IoFlags {
        self.flags
    }

    fn complete(self, error: Option<Arc<PoolError>>) {
        let Self {
            offset,
            data,
            on_complete,
            ..
        } = self;
        (on_complete)(ChildCompletion {
            offset,
            data,
            error,
        });
    }
}

impl std::fmt::Debug for ChildRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildRead")
            .field("offset", &self.offset)
            .field("size", &self.data.len())
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// In-flight child accounting: a count plus an idle signal, the same
/// completion-latch shape `Zio` uses for its own waiters.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0);
        *count -= 1;
        let drained = *count == 0;
        drop(count);
        if drained {
            self.idle.notify_all();
        }
    }

    fn current(&self) -> usize {
        *self.count.lock()
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Asynchronous submission queue over a [`ByteDevice`].
///
/// `nowait` never blocks on device latency: a named worker thread
/// drains the queue, performs each read, and invokes the completion
/// callback on its own thread. A failed read still completes its
/// callback, carrying the error, so callers can always reclaim state
/// tied to an outstanding child.
pub struct IoScheduler {
    tx: Option<flume::Sender<ChildRead>>,
    in_flight: Arc<InFlight>,
    worker: Option<JoinHandle<()>>,
}

impl IoScheduler {
    pub fn new(device: Arc<dyn ByteDevice>) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<ChildRead>();
        let in_flight = Arc::new(InFlight::default());
        let gauge = Arc::clone(&in_flight);

        let worker = thread::Builder::new()
            .name("tide-io".to_owned())
            .spawn(move || {
                while let Ok(mut child) = rx.recv() {
                    let error = device
                        .read_exact_at(child.offset, &mut child.data)
                        .err()
                        .map(Arc::new);
                    trace!(
                        event = "child_read_done",
                        offset = child.offset.0,
                        size = child.data.len(),
                        failed = error.is_some()
                    );
                    child.complete(error);
                    gauge.decrement();
                }
            })
            .map_err(PoolError::Io)?;

        Ok(Self {
            tx: Some(tx),
            in_flight,
            worker: Some(worker),
        })
    }

    /// Submit `child` without waiting for it.
    pub fn nowait(&self, child: ChildRead) {
        trace!(
            event = "child_read_submit",
            offset = child.offset.0,
            size = child.size(),
            priority = ?child.priority,
        );
        self.in_flight.increment();
        let Some(tx) = self.tx.as_ref() else {
            self.in_flight.decrement();
            child.complete(Some(Arc::new(PoolError::Cancelled)));
            return;
        };
        if let Err(flume::SendError(child)) = tx.send(child) {
            self.in_flight.decrement();
            warn!(event = "child_read_abandoned", offset = child.offset.0);
            child.complete(Some(Arc::new(PoolError::Cancelled)));
        }
    }

    /// Number of submitted children whose callbacks have not returned.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Block until every submitted child has completed its callback.
    pub fn quiesce(&self) {
        self.in_flight.wait_idle();
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for IoScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoScheduler")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// FIFO queue of client I/Os waiting on one outstanding fill.
///
/// Enqueue is O(1); drainage is forward, single-pass, by value.
pub type DelegateQueue = VecDeque<Arc<Zio>>;
