#![forbid(unsafe_code)]
//! vdev layer: a byte device, its I/O scheduler, and the per-device
//! read-ahead cache, behind a small routing surface.
//!
//! [`Vdev::read`] routes client reads through the cache; a read the
//! cache refuses (ineligible, stale, or no line available) is served
//! uncached from the device instead. [`Vdev::write`] performs the
//! device write and then lets the cache patch or invalidate overlapping
//! lines. Completion always arrives on the I/O object itself.

mod readahead;
mod stats;

pub use readahead::{ReadaheadCache, ReadaheadConfig};
pub use stats::{ReadaheadCounters, ReadaheadStats};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tide_error::Result;
use tide_types::DeviceId;
use tide_zio::{ByteDevice, IoScheduler, IoType, Zio};
use tracing::{info, trace};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// One virtual device: backing storage plus its read-ahead cache.
pub struct Vdev {
    id: DeviceId,
    device: Arc<dyn ByteDevice>,
    scheduler: Arc<IoScheduler>,
    cache: Arc<ReadaheadCache>,
}

impl Vdev {
    pub fn open(
        device: Arc<dyn ByteDevice>,
        config: ReadaheadConfig,
        stats: ReadaheadStats,
    ) -> Result<Self> {
        let id = DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed));
        let scheduler = Arc::new(IoScheduler::new(Arc::clone(&device))?);
        let cache = Arc::new(ReadaheadCache::new(config, Arc::clone(&scheduler), stats)?);
        info!(event = "vdev_open", vdev = id.0, len_bytes = device.len_bytes());
        Ok(Self {
            id,
            device,
            scheduler,
            cache,
        })
    }

    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ReadaheadCache> {
        &self.cache
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.device.len_bytes()
    }

    /// Route a client read.
    ///
    /// An absorbed read completes asynchronously (or already has); a
    /// refused read is served uncached right here. Either way the
    /// outcome arrives on `io`.
    pub fn read(&self, io: &Arc<Zio>) {
        debug_assert_eq!(io.io_type(), IoType::Read);
        match self.cache.read(io) {
            Ok(()) => {}
            Err(err) if err.is_cache_refusal() => {
                trace!(
                    event = "read_uncached",
                    vdev = self.id.0,
                    offset = io.offset().0,
                    reason = %err
                );
                self.read_direct(io);
            }
            Err(err) => {
                io.set_error(Some(Arc::new(err)));
                io.execute();
            }
        }
    }

    fn read_direct(&self, io: &Arc<Zio>) {
        let result = io.with_data_mut(|buf| self.device.read_exact_at(io.offset(), buf));
        if let Err(err) = result {
            io.set_error(Some(Arc::new(err)));
        }
        io.execute();
    }

    /// Route a client write: device first, then the in-memory cache
    /// update so resident lines reflect what the device now holds.
    pub fn write(&self, io: &Arc<Zio>) {
        debug_assert_eq!(io.io_type(), IoType::Write);
        let result = io.with_data(|payload| self.device.write_all_at(io.offset(), payload));
        match result {
            Ok(()) => {
                self.cache.write(io);
                io.execute();
            }
            Err(err) => {
                io.set_error(Some(Arc::new(err)));
                io.execute();
            }
        }
    }

    /// Wait until no fill is outstanding. Required before
    /// [`Vdev::purge_cache`].
    pub fn quiesce(&self) {
        self.scheduler.quiesce();
    }

    /// Drop every resident cache line.
    pub fn purge_cache(&self) {
        self.cache.purge();
    }

    /// Flush the backing device.
    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }
}

impl std::fmt::Debug for Vdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vdev")
            .field("id", &self.id)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
