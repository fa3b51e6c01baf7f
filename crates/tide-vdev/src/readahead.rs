//! Per-vdev read-ahead line cache.
//!
//! When a small read arrives, the cache fetches an aligned, power-of-two
//! sized *line* from the device, returns the requested slice, and keeps
//! the remainder to satisfy nearby reads. Bursts of small sequential
//! reads become one device I/O plus in-memory copies.
//!
//! Five operations drive the cache: allocate, fill, read, write, evict.
//! Allocation is separated from the fill so that concurrent readers of
//! the same missing line do not each generate a device I/O: the first
//! miss allocates the line and submits one fill; later readers are
//! *delegated* onto that fill's FIFO queue and complete when it does.
//! Writes never touch the device through this module; a ready line is
//! patched in place, and a line whose fill is still outstanding is
//! marked stale and evicted once the fill has serviced the readers that
//! were queued before the write arrived.
//!
//! One mutex per cache guards both indices and every line field. Buffer
//! copies happen inside the lock, so no reader ever observes a
//! partially written line. The lock is never held across a device
//! submission or a client I/O resumption.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tide_error::{PoolError, Result};
use tide_types::{ByteOffset, LineShift, align_down, align_up, crosses_boundary};
use tide_zio::{
    ChildCompletion, ChildRead, DelegateQueue, IoFlags, IoPriority, IoScheduler, IoType, Zio,
};
use tracing::{debug, error, trace};

use crate::stats::ReadaheadStats;

/// Read-ahead cache tunables, snapshotted per vdev at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadaheadConfig {
    /// Largest client read eligible for caching, in bytes.
    pub max_io_size: usize,
    /// Aggregate byte budget for resident lines. Zero disables
    /// allocation; resident lines keep serving until evicted or purged.
    pub size_limit: u64,
    /// log2 of the line size.
    pub line_shift: LineShift,
}

impl Default for ReadaheadConfig {
    /// 16 KiB eligibility, 10 MiB budget, 64 KiB lines.
    fn default() -> Self {
        Self {
            max_io_size: 16 * 1024,
            size_limit: 10 * 1024 * 1024,
            line_shift: LineShift::default(),
        }
    }
}

impl ReadaheadConfig {
    pub fn validate(self) -> Result<Self> {
        if self.max_io_size == 0 {
            return Err(PoolError::Config(
                "max_io_size must be positive".to_owned(),
            ));
        }
        Ok(self)
    }

    /// Line size in bytes.
    #[must_use]
    pub fn line_size(&self) -> u64 {
        self.line_shift.size()
    }
}

/// Outstanding device fill for one line.
#[derive(Debug, Default)]
struct Fill {
    /// Client reads awaiting this fill, in arrival order.
    delegates: DelegateQueue,
}

/// One resident cache line. The owning map key is its aligned offset.
#[derive(Debug)]
struct Line {
    /// Exactly one line of data; contents are meaningful only once
    /// `fill` is `None`.
    data: Box<[u8]>,
    /// Tick of the most recent access; mirrored in the LRU index.
    last_used: u64,
    hits: u32,
    fill: Option<Fill>,
    /// A write overlapped this line while its fill was outstanding.
    missed_update: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    /// Offset index: aligned line offset -> line.
    lines: BTreeMap<u64, Line>,
    /// LRU index: (last_used, offset), front = eldest. Offset breaks
    /// ties so the ordering is a strict total order.
    lru: BTreeSet<(u64, u64)>,
    /// Monotonic access clock.
    tick: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Refresh a line's recency, reinserting it in the LRU index.
    fn touch(&mut self, offset: u64) {
        self.tick += 1;
        let tick = self.tick;
        let Some(line) = self.lines.get_mut(&offset) else {
            debug_assert!(false, "touch of absent line {offset}");
            return;
        };
        if line.last_used != tick {
            let removed = self.lru.remove(&(line.last_used, offset));
            debug_assert!(removed);
            line.last_used = tick;
            self.lru.insert((tick, offset));
        }
    }

    /// Drop a line from both indices. The line must not be filling.
    fn evict(&mut self, offset: u64) {
        if let Some(line) = self.lines.remove(&offset) {
            debug_assert!(line.fill.is_none());
            let removed = self.lru.remove(&(line.last_used, offset));
            debug_assert!(removed);
            trace!(
                event = "line_evict",
                offset,
                hits = line.hits,
                stale = line.missed_update
            );
        }
    }

    fn lru_front(&self) -> Option<u64> {
        self.lru.first().map(|&(_, offset)| offset)
    }
}

/// The per-vdev read-ahead cache.
pub struct ReadaheadCache {
    config: ReadaheadConfig,
    line_size: u64,
    scheduler: Arc<IoScheduler>,
    stats: ReadaheadStats,
    state: Mutex<CacheState>,
}

impl ReadaheadCache {
    pub fn new(
        config: ReadaheadConfig,
        scheduler: Arc<IoScheduler>,
        stats: ReadaheadStats,
    ) -> Result<Self> {
        let config = config.validate()?;
        let line_size = config.line_size();
        debug!(
            event = "cache_init",
            line_size,
            size_limit = config.size_limit,
            max_io_size = config.max_io_size
        );
        Ok(Self {
            config,
            line_size,
            scheduler,
            stats,
            state: Mutex::new(CacheState::default()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ReadaheadConfig {
        &self.config
    }

    #[must_use]
    pub fn line_size(&self) -> u64 {
        self.line_size
    }

    #[must_use]
    pub fn stats(&self) -> &ReadaheadStats {
        &self.stats
    }

    /// Serve a client read from the cache.
    ///
    /// `Ok(())` means the read has been absorbed: it has been bypassed
    /// and will complete (or already completed) through [`Zio::execute`];
    /// the caller must not issue it to the device. An error means the
    /// cache declined and its state is untouched; the caller performs
    /// its own uncached I/O.
    pub fn read(self: &Arc<Self>, io: &Arc<Zio>) -> Result<()> {
        debug_assert_eq!(io.io_type(), IoType::Read);
        debug_assert!(io.size() > 0);

        if io.flags().contains(IoFlags::DONT_CACHE) {
            return Err(PoolError::Uncacheable);
        }
        if io.size() > self.config.max_io_size {
            return Err(PoolError::ReadTooLarge {
                size: io.size(),
                max: self.config.max_io_size,
            });
        }
        let offset = io.offset().0;
        let straddle = PoolError::LineStraddle {
            offset,
            size: io.size(),
        };
        let Some(last) = offset.checked_add(io.size() as u64 - 1) else {
            return Err(straddle);
        };
        if crosses_boundary(offset, last, self.line_size) {
            return Err(straddle);
        }

        let line_offset = align_down(offset, self.line_size);
        let phase = (offset - line_offset) as usize;

        let mut state = self.state.lock();
        if let Some(line) = state.lines.get_mut(&line_offset) {
            if line.missed_update {
                drop(state);
                return Err(PoolError::StaleLine {
                    offset: line_offset,
                });
            }
            if let Some(fill) = line.fill.as_mut() {
                fill.delegates.push_back(Arc::clone(io));
                io.bypass();
                drop(state);
                self.stats.delegations.inc();
                trace!(event = "read_delegated", offset, size = io.size(), line = line_offset);
                return Ok(());
            }
            io.copy_from(&line.data[phase..phase + io.size()]);
            line.hits += 1;
            state.touch(line_offset);
            io.bypass();
            drop(state);
            io.execute();
            self.stats.hits.inc();
            trace!(event = "read_hit", offset, size = io.size(), line = line_offset);
            return Ok(());
        }

        // Miss: reserve a line and issue exactly one fill for it.
        self.make_room(&mut state)?;
        let tick = state.next_tick();
        let mut delegates = DelegateQueue::new();
        delegates.push_back(Arc::clone(io));
        state.lines.insert(
            line_offset,
            Line {
                data: vec![0_u8; self.line_size as usize].into_boxed_slice(),
                last_used: tick,
                hits: 0,
                fill: Some(Fill { delegates }),
                missed_update: false,
            },
        );
        state.lru.insert((tick, line_offset));
        io.bypass();

        let cache = Arc::clone(self);
        let child = ChildRead::new(
            ByteOffset(line_offset),
            self.line_size as usize,
            IoPriority::CacheFill,
            IoFlags::DONT_CACHE | IoFlags::DONT_PROPAGATE | IoFlags::DONT_RETRY | IoFlags::NO_BOOKMARK,
            move |done| cache.fill_complete(done),
        );
        drop(state);
        self.scheduler.nowait(child);
        self.stats.misses.inc();
        trace!(event = "read_miss", offset, size = io.size(), line = line_offset);
        Ok(())
    }

    /// Make the budget admit one more line, or refuse.
    ///
    /// Eviction happens before insertion, so other threads never
    /// observe the budget exceeded.
    fn make_room(&self, state: &mut CacheState) -> Result<()> {
        if self.config.size_limit == 0 {
            return Err(PoolError::NoLineAvailable);
        }
        let projected = (state.lines.len() as u64 + 1).saturating_mul(self.line_size);
        if projected <= self.config.size_limit {
            return Ok(());
        }
        let Some(eldest) = state.lru_front() else {
            // Budget smaller than a single line.
            return Err(PoolError::NoLineAvailable);
        };
        if state
            .lines
            .get(&eldest)
            .is_some_and(|line| line.fill.is_some())
        {
            // The eviction candidate is pinned by its own fill; the
            // miss proceeds uncached and retries the budget later.
            debug!(event = "alloc_blocked_by_fill", line = eldest);
            return Err(PoolError::NoLineAvailable);
        }
        state.evict(eldest);
        Ok(())
    }

    /// Completion of the device read that populates a line.
    fn fill_complete(&self, done: ChildCompletion) {
        let line_offset = done.offset.0;
        let failed = done.error.is_some();

        let mut state = self.state.lock();
        let Some(line) = state.lines.get_mut(&line_offset) else {
            error!(event = "fill_without_line", offset = line_offset);
            return;
        };
        let Some(fill) = line.fill.take() else {
            error!(event = "fill_not_recorded", offset = line_offset);
            return;
        };
        let delegates = fill.delegates;
        if !failed {
            line.data.copy_from_slice(&done.data);
            // Queued delegates predate any conflicting write, so they
            // are entitled to the fill's view even when the line has
            // gone stale in the meantime.
            for dio in &delegates {
                let phase = (dio.offset().0 - line_offset) as usize;
                dio.copy_from(&line.data[phase..phase + dio.size()]);
            }
            line.hits += delegates.len() as u32;
        }
        let evict_now = failed || line.missed_update;
        if evict_now {
            state.evict(line_offset);
        } else if !delegates.is_empty() {
            state.touch(line_offset);
        }
        drop(state);

        debug!(
            event = "line_fill_done",
            offset = line_offset,
            delegates = delegates.len(),
            failed,
            evicted = evict_now
        );
        for dio in delegates {
            dio.set_error(done.error.clone());
            dio.execute();
        }
    }

    /// Apply a completed client write to resident lines.
    ///
    /// Ready lines overlapping the write are patched in place; lines
    /// still filling are marked stale instead, because the in-flight
    /// device read may race the patch. No device I/O is issued, writes
    /// never fail, and recency is not refreshed.
    pub fn write(&self, io: &Arc<Zio>) {
        debug_assert_eq!(io.io_type(), IoType::Write);

        let io_start = io.offset().0;
        let io_end = io_start.saturating_add(io.size() as u64);
        let min = align_down(io_start, self.line_size);
        let max = align_up(io_end, self.line_size);

        let mut patched = 0_usize;
        let mut invalidated = 0_usize;
        let mut state = self.state.lock();
        io.with_data(|payload| {
            for (&line_offset, line) in state.lines.range_mut(min..max) {
                if line.fill.is_some() {
                    line.missed_update = true;
                    invalidated += 1;
                    continue;
                }
                let start = line_offset.max(io_start);
                let end = (line_offset + self.line_size).min(io_end);
                if start >= end {
                    continue;
                }
                line.data[(start - line_offset) as usize..(end - line_offset) as usize]
                    .copy_from_slice(
                        &payload[(start - io_start) as usize..(end - io_start) as usize],
                    );
                patched += 1;
            }
        });
        drop(state);
        if patched + invalidated > 0 {
            trace!(
                event = "write_update",
                offset = io_start,
                size = io.size(),
                patched,
                invalidated
            );
        }
    }

    /// Evict every resident line.
    ///
    /// The caller must ensure no fill is outstanding (quiesce the
    /// scheduler first); lines pinned by a fill cannot be dropped.
    pub fn purge(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.lines.values().all(|line| line.fill.is_none()));
        let evicted = state.lines.len();
        state.lines.clear();
        state.lru.clear();
        drop(state);
        if evicted > 0 {
            debug!(event = "cache_purged", lines = evicted);
        }
    }

    /// Number of resident lines (filling lines included).
    #[must_use]
    pub fn resident_lines(&self) -> usize {
        self.state.lock().lines.len()
    }

    /// Resident bytes (`resident_lines * line_size`).
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.resident_lines() as u64 * self.line_size
    }

    /// Aligned offsets of all resident lines, ascending.
    #[must_use]
    pub fn resident_offsets(&self) -> Vec<u64> {
        self.state.lock().lines.keys().copied().collect()
    }

    /// Resident line offsets in LRU order, eldest first.
    #[must_use]
    pub fn lru_offsets(&self) -> Vec<u64> {
        self.state
            .lock()
            .lru
            .iter()
            .map(|&(_, offset)| offset)
            .collect()
    }
}

impl Drop for ReadaheadCache {
    /// Teardown is purge: drain every line under the lock before the
    /// indices go away. Outstanding fills hold a reference to the
    /// cache, so none can still be in flight here.
    fn drop(&mut self) {
        self.purge();
    }
}

impl std::fmt::Debug for ReadaheadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadaheadCache")
            .field("config", &self.config)
            .field("resident_lines", &self.resident_lines())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Condvar;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tide_zio::ByteDevice;

    const LINE: u64 = 65_536;

    fn pattern(offset: u64) -> u8 {
        (offset.wrapping_mul(31).wrapping_add(7) % 251) as u8
    }

    #[derive(Debug)]
    struct MemoryByteDevice {
        bytes: Mutex<Vec<u8>>,
        reads: AtomicUsize,
        fail_reads: AtomicBool,
    }

    impl MemoryByteDevice {
        fn new(len: usize) -> Self {
            let bytes = (0..len as u64).map(pattern).collect();
            Self {
                bytes: Mutex::new(bytes),
                reads: AtomicUsize::new(0),
                fail_reads: AtomicBool::new(false),
            }
        }

        fn read_count(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl ByteDevice for MemoryByteDevice {
        fn len_bytes(&self) -> u64 {
            self.bytes.lock().len() as u64
        }

        fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> tide_error::Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(PoolError::Io(std::io::Error::other("injected read fault")));
            }
            let start = usize::try_from(offset.0).expect("offset fits");
            let bytes = self.bytes.lock();
            let end = start + buf.len();
            if end > bytes.len() {
                return Err(PoolError::OutOfBounds {
                    offset: offset.0,
                    len: buf.len(),
                    device_len: bytes.len() as u64,
                });
            }
            buf.copy_from_slice(&bytes[start..end]);
            drop(bytes);
            Ok(())
        }

        fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> tide_error::Result<()> {
            let start = usize::try_from(offset.0).expect("offset fits");
            let mut bytes = self.bytes.lock();
            let end = start + buf.len();
            assert!(end <= bytes.len(), "test write oob");
            bytes[start..end].copy_from_slice(buf);
            drop(bytes);
            Ok(())
        }

        fn sync(&self) -> tide_error::Result<()> {
            Ok(())
        }
    }

    /// Device wrapper that snapshots each read, then blocks the reader
    /// until the gate opens. Writes pass through.
    #[derive(Debug)]
    struct GatedDevice {
        inner: Arc<MemoryByteDevice>,
        gate: Mutex<GateState>,
        cv: Condvar,
    }

    #[derive(Debug)]
    struct GateState {
        open: bool,
        entered: usize,
    }

    impl GatedDevice {
        fn new(inner: Arc<MemoryByteDevice>) -> Self {
            Self {
                inner,
                gate: Mutex::new(GateState {
                    open: true,
                    entered: 0,
                }),
                cv: Condvar::new(),
            }
        }

        fn close(&self) {
            self.gate.lock().open = false;
        }

        fn open(&self) {
            self.gate.lock().open = true;
            self.cv.notify_all();
        }

        /// Wait until `n` reads have snapshotted their data (and are
        /// either blocked on the gate or already through it).
        fn wait_entered(&self, n: usize, timeout: Duration) {
            let deadline = Instant::now() + timeout;
            let mut gate = self.gate.lock();
            while gate.entered < n {
                assert!(
                    !self.cv.wait_until(&mut gate, deadline).timed_out(),
                    "gated device never saw {n} reads"
                );
            }
        }
    }

    impl ByteDevice for GatedDevice {
        fn len_bytes(&self) -> u64 {
            self.inner.len_bytes()
        }

        fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> tide_error::Result<()> {
            let result = self.inner.read_exact_at(offset, buf);
            let mut gate = self.gate.lock();
            gate.entered += 1;
            self.cv.notify_all();
            while !gate.open {
                self.cv.wait(&mut gate);
            }
            drop(gate);
            result
        }

        fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> tide_error::Result<()> {
            self.inner.write_all_at(offset, buf)
        }

        fn sync(&self) -> tide_error::Result<()> {
            self.inner.sync()
        }
    }

    struct Harness {
        memory: Arc<MemoryByteDevice>,
        gated: Arc<GatedDevice>,
        scheduler: Arc<IoScheduler>,
        cache: Arc<ReadaheadCache>,
    }

    fn harness(size_limit: u64) -> Harness {
        let memory = Arc::new(MemoryByteDevice::new(16 * LINE as usize));
        let gated = Arc::new(GatedDevice::new(Arc::clone(&memory)));
        let device: Arc<dyn ByteDevice> = gated.clone() as Arc<dyn ByteDevice>;
        let scheduler = Arc::new(IoScheduler::new(device).expect("scheduler"));
        let config = ReadaheadConfig {
            size_limit,
            ..ReadaheadConfig::default()
        };
        let cache = Arc::new(
            ReadaheadCache::new(config, Arc::clone(&scheduler), ReadaheadStats::default())
                .expect("cache"),
        );
        Harness {
            memory,
            gated,
            scheduler,
            cache,
        }
    }

    fn expected(offset: u64, len: usize) -> Vec<u8> {
        (offset..offset + len as u64).map(pattern).collect()
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn rejects_ineligible_reads_untouched() {
        let h = harness(10 * LINE);

        let flagged = Zio::read_with_flags(ByteOffset(0), 512, IoFlags::DONT_CACHE);
        assert!(matches!(
            h.cache.read(&flagged),
            Err(PoolError::Uncacheable)
        ));

        let oversize = Zio::read(ByteOffset(0), 16 * 1024 + 1);
        assert!(matches!(
            h.cache.read(&oversize),
            Err(PoolError::ReadTooLarge { .. })
        ));

        let straddling = Zio::read(ByteOffset(LINE - 256), 512);
        assert!(matches!(
            h.cache.read(&straddling),
            Err(PoolError::LineStraddle { .. })
        ));

        assert_eq!(h.cache.resident_lines(), 0);
        assert_eq!(h.cache.stats().snapshot(), Default::default());
        assert_eq!(h.memory.read_count(), 0);
    }

    #[test]
    fn miss_fills_line_then_hits_serve_in_memory() {
        let h = harness(10 * LINE);

        let first = Zio::read(ByteOffset(0), 512);
        h.cache.read(&first).expect("absorbed");
        assert!(first.wait_for(WAIT));
        assert!(first.error().is_none());
        assert_eq!(first.data(), expected(0, 512));

        let second = Zio::read(ByteOffset(512), 512);
        h.cache.read(&second).expect("absorbed");
        // A ready line serves synchronously.
        assert!(second.is_done());
        assert_eq!(second.data(), expected(512, 512));

        assert_eq!(h.memory.read_count(), 1);
        assert_eq!(h.cache.resident_lines(), 1);
        let counters = h.cache.stats().snapshot();
        assert_eq!((counters.misses, counters.hits, counters.delegations), (1, 1, 0));
    }

    #[test]
    fn concurrent_misses_coalesce_onto_one_fill() {
        let h = harness(10 * LINE);
        h.gated.close();

        let first = Zio::read(ByteOffset(0), 512);
        h.cache.read(&first).expect("absorbed");
        h.gated.wait_entered(1, WAIT);

        let second = Zio::read(ByteOffset(1024), 512);
        h.cache.read(&second).expect("absorbed");
        assert!(!second.is_done());

        h.gated.open();
        assert!(first.wait_for(WAIT));
        assert!(second.wait_for(WAIT));
        assert_eq!(first.data(), expected(0, 512));
        assert_eq!(second.data(), expected(1024, 512));

        assert_eq!(h.memory.read_count(), 1);
        let counters = h.cache.stats().snapshot();
        assert_eq!((counters.misses, counters.hits, counters.delegations), (1, 0, 1));
    }

    #[test]
    fn write_patches_ready_line_in_place() {
        let h = harness(10 * LINE);

        let warm = Zio::read(ByteOffset(0), 512);
        h.cache.read(&warm).expect("absorbed");
        assert!(warm.wait_for(WAIT));

        let payload = vec![0xEE_u8; 256];
        h.memory
            .write_all_at(ByteOffset(128), &payload)
            .expect("device write");
        let write = Zio::write(ByteOffset(128), payload.clone());
        h.cache.write(&write);

        let reread = Zio::read(ByteOffset(128), 256);
        h.cache.read(&reread).expect("absorbed");
        assert!(reread.is_done());
        assert_eq!(reread.data(), payload);
        // Patch was in-memory; no second device read.
        assert_eq!(h.memory.read_count(), 1);
    }

    #[test]
    fn write_during_fill_marks_line_stale() {
        let h = harness(10 * LINE);
        h.gated.close();

        let delegated = Zio::read(ByteOffset(0), 512);
        h.cache.read(&delegated).expect("absorbed");
        h.gated.wait_entered(1, WAIT);

        // The fill has snapshotted pre-write device contents; now a
        // write lands in the middle of the filling line.
        let payload = vec![0xAA_u8; 256];
        h.memory
            .write_all_at(ByteOffset(256), &payload)
            .expect("device write");
        let write = Zio::write(ByteOffset(256), payload.clone());
        h.cache.write(&write);

        // New reads of the stale line are refused until it is gone.
        let stale = Zio::read(ByteOffset(0), 512);
        assert!(matches!(
            h.cache.read(&stale),
            Err(PoolError::StaleLine { .. })
        ));

        h.gated.open();
        assert!(delegated.wait_for(WAIT));
        // The queued read observes the pre-write view.
        assert_eq!(delegated.data(), expected(0, 512));

        h.scheduler.quiesce();
        assert_eq!(h.cache.resident_lines(), 0);

        // A fresh miss refills from the device and sees the write.
        let fresh = Zio::read(ByteOffset(0), 512);
        h.cache.read(&fresh).expect("absorbed");
        assert!(fresh.wait_for(WAIT));
        let mut want = expected(0, 512);
        want[256..512].copy_from_slice(&payload);
        assert_eq!(fresh.data(), want);
        assert_eq!(h.memory.read_count(), 2);
    }

    #[test]
    fn lru_pressure_evicts_eldest_line() {
        let h = harness(2 * LINE);

        for line in 0..3_u64 {
            let io = Zio::read(ByteOffset(line * LINE), 512);
            h.cache.read(&io).expect("absorbed");
            assert!(io.wait_for(WAIT));
        }

        assert_eq!(h.cache.resident_offsets(), vec![LINE, 2 * LINE]);
        assert_eq!(h.cache.lru_offsets(), vec![LINE, 2 * LINE]);
    }

    #[test]
    fn writes_do_not_refresh_recency() {
        let h = harness(2 * LINE);

        for line in 0..2_u64 {
            let io = Zio::read(ByteOffset(line * LINE), 512);
            h.cache.read(&io).expect("absorbed");
            assert!(io.wait_for(WAIT));
        }

        // Patching the eldest line must not save it from eviction.
        let write = Zio::write(ByteOffset(64), vec![1_u8; 64]);
        h.cache.write(&write);

        let io = Zio::read(ByteOffset(2 * LINE), 512);
        h.cache.read(&io).expect("absorbed");
        assert!(io.wait_for(WAIT));
        assert_eq!(h.cache.resident_offsets(), vec![LINE, 2 * LINE]);
    }

    #[test]
    fn budget_front_pinned_by_fill_refuses_allocation() {
        let h = harness(LINE);
        h.gated.close();

        let filling = Zio::read(ByteOffset(0), 512);
        h.cache.read(&filling).expect("absorbed");
        h.gated.wait_entered(1, WAIT);

        // Budget is one line and the only eviction candidate is still
        // filling: the second miss is refused, transiently.
        let refused = Zio::read(ByteOffset(LINE), 512);
        assert!(matches!(
            h.cache.read(&refused),
            Err(PoolError::NoLineAvailable)
        ));

        h.gated.open();
        assert!(filling.wait_for(WAIT));

        let retry = Zio::read(ByteOffset(LINE), 512);
        h.cache.read(&retry).expect("absorbed");
        assert!(retry.wait_for(WAIT));
        assert_eq!(h.cache.resident_offsets(), vec![LINE]);
    }

    #[test]
    fn zero_budget_disables_allocation() {
        let h = harness(0);

        for _ in 0..3 {
            let io = Zio::read(ByteOffset(0), 512);
            assert!(matches!(
                h.cache.read(&io),
                Err(PoolError::NoLineAvailable)
            ));
        }
        let write = Zio::write(ByteOffset(0), vec![9_u8; 128]);
        h.cache.write(&write);

        assert_eq!(h.cache.resident_lines(), 0);
        assert_eq!(h.memory.read_count(), 0);
        assert_eq!(h.cache.stats().snapshot(), Default::default());
    }

    #[test]
    fn budget_is_never_observably_exceeded() {
        let h = harness(4 * LINE);

        for line in 0..12_u64 {
            let io = Zio::read(ByteOffset(line * LINE), 512);
            h.cache.read(&io).expect("absorbed");
            assert!(io.wait_for(WAIT));
            assert!(h.cache.resident_bytes() <= 4 * LINE);
        }
        assert_eq!(h.cache.resident_lines(), 4);
    }

    #[test]
    fn fill_error_propagates_and_reclaims_line() {
        let h = harness(10 * LINE);
        h.memory.fail_reads.store(true, Ordering::SeqCst);

        let io = Zio::read(ByteOffset(0), 512);
        h.cache.read(&io).expect("absorbed");
        assert!(io.wait_for(WAIT));
        let err = io.error().expect("fill error");
        assert!(matches!(*err, PoolError::Io(_)));

        h.scheduler.quiesce();
        assert_eq!(h.cache.resident_lines(), 0);

        // The line was reclaimed, so the next read misses again.
        h.memory.fail_reads.store(false, Ordering::SeqCst);
        let retry = Zio::read(ByteOffset(0), 512);
        h.cache.read(&retry).expect("absorbed");
        assert!(retry.wait_for(WAIT));
        assert!(retry.error().is_none());
        assert_eq!(retry.data(), expected(0, 512));
        assert_eq!(h.cache.stats().snapshot().misses, 2);
    }

    #[test]
    fn honors_custom_line_shift() {
        let memory = Arc::new(MemoryByteDevice::new(64 * 4096));
        let device: Arc<dyn ByteDevice> = memory.clone() as Arc<dyn ByteDevice>;
        let scheduler = Arc::new(IoScheduler::new(device).expect("scheduler"));
        let config = ReadaheadConfig {
            max_io_size: 2048,
            size_limit: 8 * 4096,
            line_shift: LineShift::new(12).expect("4 KiB lines"),
        };
        let cache = Arc::new(
            ReadaheadCache::new(config, scheduler, ReadaheadStats::default()).expect("cache"),
        );
        assert_eq!(cache.line_size(), 4096);

        let miss = Zio::read(ByteOffset(3 * 4096 + 128), 512);
        cache.read(&miss).expect("absorbed");
        assert!(miss.wait_for(WAIT));
        assert_eq!(miss.data(), expected(3 * 4096 + 128, 512));

        let hit = Zio::read(ByteOffset(3 * 4096 + 2048), 512);
        cache.read(&hit).expect("absorbed");
        assert!(hit.is_done());
        assert_eq!(hit.data(), expected(3 * 4096 + 2048, 512));

        // A 4 KiB-line cache straddles at 4 KiB boundaries.
        let straddling = Zio::read(ByteOffset(4096 - 256), 512);
        assert!(matches!(
            cache.read(&straddling),
            Err(PoolError::LineStraddle { .. })
        ));
        assert_eq!(memory.read_count(), 1);
        assert_eq!(cache.resident_offsets(), vec![3 * 4096]);
    }

    #[test]
    fn purge_empties_both_indices() {
        let h = harness(10 * LINE);

        for line in 0..3_u64 {
            let io = Zio::read(ByteOffset(line * LINE), 512);
            h.cache.read(&io).expect("absorbed");
            assert!(io.wait_for(WAIT));
        }
        assert_eq!(h.cache.resident_lines(), 3);

        h.scheduler.quiesce();
        h.cache.purge();
        assert_eq!(h.cache.resident_lines(), 0);
        assert!(h.cache.lru_offsets().is_empty());

        // Purge of an empty cache is a no-op.
        h.cache.purge();
        assert_eq!(h.cache.resident_lines(), 0);
    }

    #[test]
    fn offset_and_lru_indices_agree() {
        let h = harness(5 * LINE);

        for line in [3_u64, 1, 4, 1, 5, 9, 2, 6] {
            let io = Zio::read(ByteOffset(line * LINE), 256);
            h.cache.read(&io).expect("absorbed");
            assert!(io.wait_for(WAIT));
        }

        let mut by_lru = h.cache.lru_offsets();
        by_lru.sort_unstable();
        assert_eq!(by_lru, h.cache.resident_offsets());
        for offset in h.cache.resident_offsets() {
            assert_eq!(offset % LINE, 0);
        }
    }
}
