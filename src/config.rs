use crate::kvstore::KvStore;
use crate::notify::{NullCallbacks, ServerCallbacks};
use crate::time::{Clock, RelTime, WallClock};
use crate::Store;
use std::sync::Arc;
use std::time::Duration;

/// Global store configuration
pub struct Config {
    /// Max items persisted per backing-store commit
    pub(crate) txn_size: usize,

    /// Seconds a dirty item must sit before it is persisted, unless it is
    /// already over the queue age cap
    pub(crate) min_data_age: RelTime,

    /// Seconds after which a queued item is persisted no matter how young
    /// its data is
    pub(crate) queue_age_cap: RelTime,

    /// Artificial delay before background fetches run; only useful to
    /// widen race windows in tests
    pub(crate) bg_fetch_delay: Duration,

    /// Grace seconds past `exptime` before the flusher drops a dirty
    /// record as expired instead of writing it
    pub(crate) item_expiry_window: RelTime,

    /// When false the dirty queue is suppressed and the store is a purely
    /// in-memory cache
    pub(crate) do_persistence: bool,

    /// Memory ceiling for stored values; inserts beyond it are refused
    pub(crate) max_memory: usize,

    /// Below this, warm-up keeps loading values resident and post-active
    /// writes skip opportunistic ejection
    pub(crate) mem_low_watermark: usize,

    /// Advisory ceiling for external pagers
    pub(crate) mem_high_watermark: usize,

    /// Buckets (and bucket mutexes) per partition hash table
    pub(crate) hash_buckets: usize,

    /// How long the background flusher sleeps when the queue is idle.
    /// `None` disables the background flusher; [`Store::flush`] still
    /// works.
    pub(crate) flush_interval: Option<Duration>,

    /// Repopulate partitions from the backing store at open
    pub(crate) warmup: bool,

    /// Create partition 0 in active state at open
    pub(crate) start_partition_zero: bool,

    /// Time source for staleness and expiry decisions
    pub(crate) clock: Arc<dyn Clock>,
}

impl Default for Config {
    fn default() -> Self {
        let max_memory = usize::MAX;

        Self {
            txn_size: 10_000,
            min_data_age: 0,
            queue_age_cap: 900,
            bg_fetch_delay: Duration::ZERO,
            item_expiry_window: 3,
            do_persistence: std::env::var_os("EBB_NO_PERSISTENCE").is_none(),
            max_memory,
            mem_low_watermark: max_memory,
            mem_high_watermark: max_memory,
            hash_buckets: 769,
            flush_interval: Some(Duration::from_secs(1)),
            warmup: true,
            start_partition_zero: true,
            clock: Arc::new(WallClock::default()),
        }
    }
}

impl Config {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Max items persisted per backing-store commit.
    ///
    /// Default = 10 000
    #[must_use]
    pub fn txn_size(mut self, count: usize) -> Self {
        assert!(count > 0);
        self.txn_size = count;
        self
    }

    /// Minimum seconds a dirty item's data must age before it is
    /// persisted. Young items are deferred so rapid rewrites coalesce into
    /// one write.
    ///
    /// Default = 0 (persist as soon as the flusher sees it)
    #[must_use]
    pub fn min_data_age(mut self, secs: RelTime) -> Self {
        self.min_data_age = secs;
        self
    }

    /// Seconds after which a queued item is persisted even if its data is
    /// younger than the minimum age.
    ///
    /// Default = 900
    #[must_use]
    pub fn queue_age_cap(mut self, secs: RelTime) -> Self {
        self.queue_age_cap = secs;
        self
    }

    /// Artificial delay before background fetches run.
    ///
    /// Default = none; production stores want it that way.
    #[must_use]
    pub fn bg_fetch_delay(mut self, delay: Duration) -> Self {
        self.bg_fetch_delay = delay;
        self
    }

    /// Grace seconds past an item's expiry before the flusher drops it
    /// instead of writing it.
    ///
    /// Default = 3
    #[must_use]
    pub fn item_expiry_window(mut self, secs: RelTime) -> Self {
        self.item_expiry_window = secs;
        self
    }

    /// Turns write-behind persistence on or off. With persistence off the
    /// dirty queue is suppressed entirely and the store is a plain
    /// concurrent cache.
    ///
    /// Default = true, unless the `EBB_NO_PERSISTENCE` environment
    /// variable is set.
    #[must_use]
    pub fn do_persistence(mut self, enabled: bool) -> Self {
        self.do_persistence = enabled;
        self
    }

    /// Memory ceiling for stored values. Also derives the low and high
    /// watermarks (60% / 75%) unless they were set explicitly before.
    ///
    /// Default = unlimited
    #[must_use]
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self.mem_low_watermark = bytes / 100 * 60;
        self.mem_high_watermark = bytes / 100 * 75;
        self
    }

    /// Below this many resident bytes, warm-up keeps values resident and
    /// post-active persists skip opportunistic ejection.
    #[must_use]
    pub fn mem_low_watermark(mut self, bytes: usize) -> Self {
        self.mem_low_watermark = bytes;
        self
    }

    /// Advisory ceiling for external pagers; recorded, not enforced here.
    #[must_use]
    pub fn mem_high_watermark(mut self, bytes: usize) -> Self {
        self.mem_high_watermark = bytes;
        self
    }

    /// Buckets (and bucket mutexes) per partition hash table.
    ///
    /// Default = 769
    #[must_use]
    pub fn hash_buckets(mut self, n: usize) -> Self {
        assert!(n > 0);
        self.hash_buckets = n;
        self
    }

    /// Idle sleep of the background flusher, or `None` to not start one
    /// (flushing then only happens through [`Store::flush`]).
    ///
    /// Default = 1 second
    #[must_use]
    pub fn flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Whether `open` repopulates partitions from the backing store.
    ///
    /// Default = true
    #[must_use]
    pub fn warmup(mut self, enabled: bool) -> Self {
        self.warmup = enabled;
        self
    }

    /// Whether `open` creates partition 0 in active state.
    ///
    /// Default = true
    #[must_use]
    pub fn start_partition_zero(mut self, enabled: bool) -> Self {
        self.start_partition_zero = enabled;
        self
    }

    /// Injects a time source. Tests use [`ManualClock`](crate::ManualClock)
    /// to drive age and expiry checks deterministically.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens a store over the given backing store, with notifications
    /// going nowhere.
    pub fn open(self, kvstore: Arc<dyn KvStore>) -> Store {
        self.open_with_callbacks(kvstore, Arc::new(NullCallbacks))
    }

    /// Opens a store over the given backing store and notification sink.
    pub fn open_with_callbacks(
        self,
        kvstore: Arc<dyn KvStore>,
        callbacks: Arc<dyn ServerCallbacks>,
    ) -> Store {
        Store::open(self, kvstore, callbacks)
    }
}
