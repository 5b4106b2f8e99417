use crate::config::Config;
use crate::dirty_queue::{DirtyQueue, QueueOp, QueuedItem};
use crate::dispatcher::{Dispatcher, DispatcherCallback, Priority, TaskId};
use crate::error::Error;
use crate::fetcher::{VKeyFetchTask, ValueFetchTask};
use crate::flusher::{FlusherPhase, FlusherState, FlusherTask};
use crate::hash_table::{AddStatus, BucketGuard, DeleteStatus, MutationStatus};
use crate::kvstore::{GetResult, KvStore};
use crate::notify::{Cookie, ServerCallbacks};
use crate::partition::{Partition, PartitionRef, PartitionState, PartitionTable};
use crate::stats::Stats;
use crate::stored_value::StoredValue;
use crate::time::RelTime;
use crate::value::{next_cas, Item, PartitionId, RowId, UserKey, LOCKED_CAS};
use crate::warmup;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-key metadata snapshot, for observability front-ends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyStats {
    /// Whether the in-memory state is ahead of the persisted state.
    pub dirty: bool,

    /// Expiry time in the store's relative time domain; `0` = never.
    pub exptime: RelTime,

    /// Opaque user flags.
    pub flags: u32,

    /// Current CAS token.
    pub cas: crate::value::Cas,

    /// When the value last went dirty (relative time domain).
    pub dirtied_at: RelTime,

    /// Seconds since the value last went dirty; `0` for clean values.
    pub data_age: RelTime,

    /// Wall-clock seconds of the last modification.
    pub last_modified: u64,
}

/// Shared state behind a [`Store`] handle.
pub struct StoreInner {
    pub(crate) config: Config,
    pub(crate) kvstore: Arc<dyn KvStore>,
    pub(crate) callbacks: Arc<dyn ServerCallbacks>,
    pub(crate) clock: Arc<dyn crate::time::Clock>,
    pub(crate) partitions: PartitionTable,
    pub(crate) dirty_queue: DirtyQueue,

    /// Flusher-owned batch; the mutex also serializes flush cycles.
    pub(crate) writing: Mutex<VecDeque<QueuedItem>>,

    pub(crate) io_dispatcher: Dispatcher,
    pub(crate) nonio_dispatcher: Dispatcher,
    pub(crate) flusher: FlusherState,
    stats: Arc<Stats>,

    /// Serializes partition lifecycle transitions. Ordered strictly before
    /// any bucket mutex.
    state_lock: Mutex<()>,

    pub(crate) min_data_age: AtomicU32,
    pub(crate) queue_age_cap: AtomicU32,
    pub(crate) txn_size: AtomicUsize,
}

/// Eventually-persistent, partitioned key-value store.
///
/// Clients read and mutate the in-memory layer at memory speed; a
/// background flusher persists mutations to the backing store, and
/// background fetchers page ejected values back in on demand.
///
/// The handle is cheap to clone and shares one store.
#[derive(Clone)]
pub struct Store(Arc<StoreInner>);

impl std::ops::Deref for Store {
    type Target = StoreInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Store {
    pub(crate) fn open(
        config: Config,
        kvstore: Arc<dyn KvStore>,
        callbacks: Arc<dyn ServerCallbacks>,
    ) -> Self {
        let clock = config.clock.clone();

        let inner = StoreInner {
            kvstore,
            callbacks,
            clock,
            partitions: PartitionTable::default(),
            dirty_queue: DirtyQueue::default(),
            writing: Mutex::new(VecDeque::new()),
            io_dispatcher: Dispatcher::new("io-dispatcher"),
            nonio_dispatcher: Dispatcher::new("nonio-dispatcher"),
            flusher: FlusherState::default(),
            stats: Arc::new(Stats::default()),
            state_lock: Mutex::new(()),
            min_data_age: AtomicU32::new(config.min_data_age),
            queue_age_cap: AtomicU32::new(config.queue_age_cap),
            txn_size: AtomicUsize::new(config.txn_size),
            config,
        };

        let store = Self(Arc::new(inner));

        if store.config.start_partition_zero {
            store
                .partitions
                .insert(store.new_partition(0, PartitionState::Active));
        }

        if store.config.warmup {
            warmup::run(&store);
        }

        store.io_dispatcher.start();
        store.nonio_dispatcher.start();
        store.flusher.set_phase(FlusherPhase::Running);

        if store.config.do_persistence {
            if let Some(interval) = store.config.flush_interval {
                store.io_dispatcher.schedule(
                    Box::new(FlusherTask {
                        store: store.clone(),
                        interval,
                    }),
                    Priority::Flusher,
                    Duration::ZERO,
                    true,
                );
            }
        }

        store
    }

    /// Stops the flusher and both dispatchers.
    ///
    /// The currently-running background task finishes; everything still
    /// queued (including delayed retries) is dropped. Call
    /// [`Store::flush`] first if the dirty queue should land on disk.
    pub fn stop(&self) {
        log::debug!("store: stopping");
        self.flusher.request_stop();
        self.io_dispatcher.stop();
        self.nonio_dispatcher.stop();
        self.flusher.set_phase(FlusherPhase::Stopped);
    }

    /// Runs one synchronous flush cycle.
    ///
    /// Returns the smallest defer hint in seconds: non-zero means some
    /// items were too young and will be retried after that long.
    pub fn flush(&self) -> RelTime {
        crate::flusher::flush_cycle(self).unwrap_or(0)
    }

    /// Suspends the background flusher after its current cycle.
    pub fn pause_flusher(&self) {
        self.flusher.pause();
    }

    /// Resumes a paused background flusher.
    pub fn resume_flusher(&self) {
        self.flusher.resume();
    }

    /// The store's counters.
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Adjusts the minimum data age on a live store.
    pub fn set_min_data_age(&self, secs: RelTime) {
        self.min_data_age.store(secs, Ordering::Relaxed);
    }

    /// Adjusts the queue age cap on a live store.
    pub fn set_queue_age_cap(&self, secs: RelTime) {
        self.queue_age_cap.store(secs, Ordering::Relaxed);
    }

    /// Adjusts the per-commit batch size on a live store.
    pub fn set_txn_size(&self, count: usize) {
        assert!(count > 0);
        self.txn_size.store(count, Ordering::Relaxed);
    }

    /// Copies out the producer-side dirty queue, oldest first. Intended
    /// for tests and monitoring; the flusher may drain it at any moment.
    #[must_use]
    pub fn pending_writes(&self) -> Vec<QueuedItem> {
        self.dirty_queue.snapshot()
    }

    /// Current state of a partition, if it exists.
    #[must_use]
    pub fn partition_state(&self, id: PartitionId) -> Option<PartitionState> {
        self.partitions.get(id).map(|p| p.state())
    }

    fn new_partition(&self, id: PartitionId, state: PartitionState) -> PartitionRef {
        Partition::new(
            id,
            state,
            self.config.hash_buckets,
            self.config.max_memory,
            self.stats.clone(),
        )
    }

    /// Creates the partition in `state` if it does not exist yet.
    pub(crate) fn ensure_partition(&self, id: PartitionId, state: PartitionState) -> PartitionRef {
        let _guard = self.state_lock.lock().expect("lock is poisoned");

        if let Some(partition) = self.partitions.get(id) {
            return partition;
        }

        let partition = self.new_partition(id, state);
        self.partitions.insert(partition.clone());
        partition
    }

    fn not_my_partition<T>(&self) -> Result<T, Error> {
        self.stats
            .num_not_my_partitions
            .fetch_add(1, Ordering::Relaxed);
        Err(Error::NotMyPartition)
    }

    /// Looks up `key` in the bucket, applying the expiry policy: an
    /// expired live entry is soft-deleted on the spot (queueing its
    /// delete) and reported as absent. Tombstones bypass expiry and are
    /// only returned when `want_deleted` is set.
    pub(crate) fn fetch_valid_value<'g, 't>(
        &self,
        partition: &PartitionRef,
        guard: &'g mut BucketGuard<'t>,
        key: &[u8],
        want_deleted: bool,
        now: RelTime,
    ) -> Option<&'g mut StoredValue> {
        enum Probe {
            Missing,
            Deleted,
            Expired,
            Live,
        }

        let probe = match guard.find(key, true) {
            None => Probe::Missing,
            Some(v) if v.is_deleted() => Probe::Deleted,
            Some(v) if v.is_expired(now) => Probe::Expired,
            Some(_) => Probe::Live,
        };

        match probe {
            Probe::Missing => None,
            Probe::Deleted => {
                if want_deleted {
                    guard.find(key, true)
                } else {
                    None
                }
            }
            Probe::Expired => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                if guard.soft_delete(key, now) == DeleteStatus::WasClean {
                    self.queue_dirty(key, partition.id(), QueueOp::Del);
                }
                None
            }
            Probe::Live => guard.find(key, false),
        }
    }

    pub(crate) fn queue_dirty(&self, key: &[u8], partition_id: PartitionId, op: QueueOp) {
        if !self.config.do_persistence {
            return;
        }

        self.dirty_queue.push(
            QueuedItem {
                key: key.to_vec().into(),
                partition_id,
                op,
                queued_at: self.clock.now(),
            },
            &self.stats,
        );
    }

    /// Puts an already-built queue entry back, keeping its original
    /// enqueue stamp (used when a flush could not go through).
    pub(crate) fn requeue(&self, item: QueuedItem) {
        if !self.config.do_persistence {
            return;
        }
        self.dirty_queue.push(item, &self.stats);
    }

    /// Runs `f` on the stored value for `key` under the bucket lock,
    /// tombstones included. Returns false if the entry is gone.
    pub(crate) fn with_locked_value<F>(&self, key: &[u8], partition_id: PartitionId, f: F) -> bool
    where
        F: FnOnce(&mut StoredValue),
    {
        let Some(partition) = self.partitions.get(partition_id) else {
            return false;
        };

        let mut guard = partition.hash_table.lock_bucket(key);
        match guard.find(key, true) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    /// Retrieves `key`, queueing a background fetch when the value is not
    /// resident.
    ///
    /// # Errors
    ///
    /// - [`Error::WouldBlock`]: the partition is pending (cookie parked)
    ///   or a background fetch was queued; the cookie is notified later.
    /// - [`Error::NotFound`], [`Error::NotMyPartition`]: as usual.
    pub fn get(&self, key: &[u8], partition: PartitionId, cookie: Cookie) -> Result<Item, Error> {
        self.get_with(key, partition, cookie, true, true)
    }

    /// [`Store::get`] with the background-fetch and state-check knobs
    /// exposed. `queue_bg = false` reports `WouldBlock` for non-resident
    /// values without scheduling anything; `honor_states = false` reads
    /// through replica and pending states.
    pub fn get_with(
        &self,
        key: &[u8],
        partition: PartitionId,
        cookie: Cookie,
        queue_bg: bool,
        honor_states: bool,
    ) -> Result<Item, Error> {
        let Some(vb) = self.partitions.get(partition) else {
            return self.not_my_partition();
        };

        match vb.state() {
            PartitionState::Active => {}
            PartitionState::Dead if honor_states => return self.not_my_partition(),
            PartitionState::Replica if honor_states => return self.not_my_partition(),
            PartitionState::Pending if honor_states => {
                vb.add_pending_op(cookie, &self.stats);
                return Err(Error::WouldBlock);
            }
            _ => {}
        }

        let now = self.clock.now();
        let mut guard = vb.hash_table.lock_bucket(key);

        let Some(v) = self.fetch_valid_value(&vb, &mut guard, key, false, now) else {
            return Err(Error::NotFound);
        };

        if !v.is_resident() {
            let row_id = v.row_id();
            if queue_bg {
                self.bg_fetch(key, partition, row_id, cookie);
            }
            return Err(Error::WouldBlock);
        }

        let locked = v.is_locked(now);
        let mut item = v.to_item(partition);
        if locked {
            item.cas = LOCKED_CAS;
        }
        Ok(item)
    }

    /// Stores `item`, honoring its CAS token if one is set.
    ///
    /// `force` is for replication ingest: it writes through replica and
    /// pending states.
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] on CAS mismatch or when the value is locked,
    /// [`Error::NotFound`] for a CAS write against a missing key,
    /// [`Error::NoMemory`] when the memory budget is exhausted, plus the
    /// partition-state outcomes of [`Store::get`].
    pub fn set(&self, item: Item, cookie: Cookie, force: bool) -> Result<(), Error> {
        let Some(vb) = self.partitions.get(item.partition_id) else {
            return self.not_my_partition();
        };

        match vb.state() {
            PartitionState::Active => {}
            PartitionState::Dead => return self.not_my_partition(),
            PartitionState::Replica if !force => return self.not_my_partition(),
            PartitionState::Pending if !force => {
                vb.add_pending_op(cookie, &self.stats);
                return Err(Error::WouldBlock);
            }
            _ => {}
        }

        let cas_op = item.cas != 0;
        let now = self.clock.now();
        let status = vb.hash_table.lock_bucket(&item.key).set(&item, now);

        match status {
            MutationStatus::NoMem => Err(Error::NoMemory),
            MutationStatus::InvalidCas | MutationStatus::Locked => Err(Error::Exists),
            MutationStatus::WasDirty => Ok(()),
            MutationStatus::NotFound if cas_op => Err(Error::NotFound),
            MutationStatus::NotFound | MutationStatus::WasClean => {
                self.queue_dirty(&item.key, item.partition_id, QueueOp::Set);
                Ok(())
            }
        }
    }

    /// Stores `item` only if the key does not exist (tombstones and
    /// expired entries count as absent).
    ///
    /// # Errors
    ///
    /// [`Error::NotStored`] when the request carries a CAS token,
    /// [`Error::Exists`] when the key is present, [`Error::NoMemory`] when
    /// the memory budget is exhausted, plus partition-state outcomes.
    pub fn add(&self, item: Item, cookie: Cookie) -> Result<(), Error> {
        let Some(vb) = self.partitions.get(item.partition_id) else {
            return self.not_my_partition();
        };

        match vb.state() {
            PartitionState::Active => {}
            PartitionState::Dead | PartitionState::Replica => return self.not_my_partition(),
            PartitionState::Pending => {
                vb.add_pending_op(cookie, &self.stats);
                return Err(Error::WouldBlock);
            }
        }

        if item.cas != 0 {
            // Adding with a CAS token makes no sense
            return Err(Error::NotStored);
        }

        let now = self.clock.now();
        let status = vb.hash_table.lock_bucket(&item.key).add(&item, now, false, true);
        match status {
            AddStatus::NoMem => Err(Error::NoMemory),
            AddStatus::Exists => Err(Error::Exists),
            AddStatus::Success | AddStatus::Undel => {
                self.queue_dirty(&item.key, item.partition_id, QueueOp::Set);
                Ok(())
            }
        }
    }

    /// Soft-deletes `key`: it becomes invisible immediately and the row
    /// removal is queued behind the flusher.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the key is absent, plus partition-state
    /// outcomes.
    pub fn del(&self, key: &[u8], partition: PartitionId, cookie: Cookie) -> Result<(), Error> {
        let Some(vb) = self.partitions.get(partition) else {
            return self.not_my_partition();
        };

        match vb.state() {
            PartitionState::Active => {}
            PartitionState::Dead | PartitionState::Replica => return self.not_my_partition(),
            PartitionState::Pending => {
                vb.add_pending_op(cookie, &self.stats);
                return Err(Error::WouldBlock);
            }
        }

        let now = self.clock.now();
        let status = vb.hash_table.lock_bucket(key).soft_delete(key, now);

        match status {
            DeleteStatus::NotFound => Err(Error::NotFound),
            DeleteStatus::WasClean => {
                self.queue_dirty(key, partition, QueueOp::Del);
                Ok(())
            }
            DeleteStatus::WasDirty => Ok(()),
        }
    }

    /// Retrieves `key` under an exclusive lease of `timeout` seconds.
    ///
    /// The returned item carries a fresh CAS token; only a `set` with
    /// that token (or lease expiry) releases the lock. `Ok(None)` means
    /// the key is currently engaged by another lease.
    ///
    /// # Errors
    ///
    /// [`Error::NotMyPartition`] unless the partition is active,
    /// [`Error::NotFound`] when the key is absent,
    /// [`Error::WouldBlock`] when the value is not resident (do a plain
    /// `get` first).
    pub fn get_locked(
        &self,
        key: &[u8],
        partition: PartitionId,
        timeout: RelTime,
    ) -> Result<Option<Item>, Error> {
        let Some(vb) = self.partitions.get(partition) else {
            return self.not_my_partition();
        };
        if vb.state() != PartitionState::Active {
            return self.not_my_partition();
        }

        let now = self.clock.now();
        let mut guard = vb.hash_table.lock_bucket(key);

        let Some(v) = self.fetch_valid_value(&vb, &mut guard, key, false, now) else {
            return Err(Error::NotFound);
        };

        if v.is_locked(now) {
            return Ok(None);
        }
        if !v.is_resident() {
            return Err(Error::WouldBlock);
        }

        v.lock(now + timeout);
        v.set_cas(next_cas());
        Ok(Some(v.to_item(partition)))
    }

    /// Drops the resident value payload of `key` to reclaim memory.
    /// Returns a human-readable description of what happened.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the key is absent,
    /// [`Error::NotMyPartition`] unless the partition is active.
    pub fn evict_key(&self, key: &[u8], partition: PartitionId) -> Result<&'static str, Error> {
        let Some(vb) = self.partitions.get(partition) else {
            return self.not_my_partition();
        };
        if vb.state() != PartitionState::Active {
            return self.not_my_partition();
        }

        let now = self.clock.now();
        let mut guard = vb.hash_table.lock_bucket(key);

        let resident = match self.fetch_valid_value(&vb, &mut guard, key, false, now) {
            None => return Err(Error::NotFound),
            Some(v) => v.is_resident(),
        };

        if !resident {
            return Ok("Already ejected.");
        }

        match guard.eject(key, now) {
            Some(_) => Ok("Ejected."),
            None => Ok("Can't eject: dirty, locked or a small object."),
        }
    }

    /// Per-key metadata snapshot.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the key is absent,
    /// [`Error::NotMyPartition`] unless the partition is active.
    pub fn key_stats(&self, key: &[u8], partition: PartitionId) -> Result<KeyStats, Error> {
        let Some(vb) = self.partitions.get(partition) else {
            return self.not_my_partition();
        };
        if vb.state() != PartitionState::Active {
            return self.not_my_partition();
        }

        let now = self.clock.now();
        let mut guard = vb.hash_table.lock_bucket(key);

        let Some(v) = self.fetch_valid_value(&vb, &mut guard, key, false, now) else {
            return Err(Error::NotFound);
        };

        Ok(KeyStats {
            dirty: v.is_dirty(),
            exptime: v.exptime(),
            flags: v.flags(),
            cas: v.cas(),
            dirtied_at: v.dirtied_at(),
            data_age: if v.is_dirty() {
                now.saturating_sub(v.dirtied_at())
            } else {
                0
            },
            last_modified: self.clock.abs(v.dirtied_at()),
        })
    }

    /// Reads `key` straight from the backing store on a background task,
    /// delivering the raw row to `callback`.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::WouldBlock`] on success: the result
    /// arrives through the callback. [`Error::NotFound`] when the key has
    /// no in-memory entry to take a row id from, plus partition-state
    /// outcomes.
    pub fn get_from_underlying(
        &self,
        key: &[u8],
        partition: PartitionId,
        cookie: Cookie,
        callback: Box<dyn FnOnce(GetResult) + Send>,
    ) -> Result<(), Error> {
        let Some(vb) = self.partitions.get(partition) else {
            return self.not_my_partition();
        };

        match vb.state() {
            PartitionState::Active => {}
            PartitionState::Dead | PartitionState::Replica => return self.not_my_partition(),
            PartitionState::Pending => {
                vb.add_pending_op(cookie, &self.stats);
                return Err(Error::WouldBlock);
            }
        }

        let now = self.clock.now();
        let mut guard = vb.hash_table.lock_bucket(key);

        let Some(v) = self.fetch_valid_value(&vb, &mut guard, key, false, now) else {
            return Err(Error::NotFound);
        };
        let row_id = v.row_id();
        drop(guard);

        self.stats.bg_fetch_queue.fetch_add(1, Ordering::Relaxed);
        self.io_dispatcher.schedule(
            Box::new(VKeyFetchTask {
                store: self.clone(),
                key: key.to_vec().into(),
                row_id,
                callback: Some(callback),
            }),
            Priority::VKeyFetch,
            self.config.bg_fetch_delay,
            false,
        );

        Err(Error::WouldBlock)
    }

    /// Clears every active partition and queues a single marker that
    /// resets the backing store.
    ///
    /// This is a barrier, not an atomic operation: mutations racing the
    /// marker may be durably dropped while remaining in memory.
    pub fn reset(&self) {
        for id in self.partitions.ids() {
            let Some(vb) = self.partitions.get(id) else {
                continue;
            };
            if vb.state() != PartitionState::Active {
                continue;
            }

            let (items, bytes) = vb.hash_table.clear();
            log::debug!("store: reset dropped {items} items ({bytes} B) from partition {id}");
        }

        self.queue_dirty(&[], 0, QueueOp::FlushAll);
    }

    fn bg_fetch(&self, key: &[u8], partition: PartitionId, row_id: RowId, cookie: Cookie) {
        let queued = self.stats.bg_fetch_queue.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("store: queued background fetch of {key:?}, now at {queued}");

        self.io_dispatcher.schedule(
            Box::new(ValueFetchTask {
                store: self.clone(),
                key: key.to_vec().into(),
                partition_id: partition,
                row_id,
                cookie,
            }),
            Priority::BgFetch,
            self.config.bg_fetch_delay,
            false,
        );
    }

    /// Finishes a background fetch: reads the row, rehydrates the table
    /// if the partition is still active and the entry still wants the
    /// value, and notifies the waiting cookie.
    pub(crate) fn complete_bg_fetch(
        &self,
        key: &UserKey,
        partition: PartitionId,
        row_id: RowId,
        cookie: Cookie,
    ) {
        let fetched = self.kvstore.get(key, row_id);

        let remaining = self.stats.bg_fetch_queue.fetch_sub(1, Ordering::Relaxed) - 1;
        self.stats.bg_fetched.fetch_add(1, Ordering::Relaxed);
        log::debug!("store: completed background fetch, now at {remaining}");

        // Lifecycle lock first, then the bucket lock: a concurrent
        // partition delete must not race the rehydration.
        {
            let _guard = self.state_lock.lock().expect("lock is poisoned");

            if let (Some(vb), GetResult::Found(item)) = (self.partitions.get(partition), &fetched)
            {
                if vb.state() == PartitionState::Active {
                    let now = self.clock.now();
                    let mut guard = vb.hash_table.lock_bucket(key);

                    if self
                        .fetch_valid_value(&vb, &mut guard, key, false, now)
                        .is_some()
                    {
                        guard.restore(key, &item.value);
                    }
                }
            }
        }

        let status = match fetched {
            GetResult::Found(_) => Ok(()),
            GetResult::NotFound => Err(Error::NotFound),
        };
        self.callbacks.notify_io_complete(cookie, status);
    }

    /// Sets a partition's state, creating the partition if needed.
    ///
    /// Parked cookies are notified from the non-I/O dispatcher; the state
    /// is persisted from the I/O dispatcher, retrying every 5 seconds on
    /// failure.
    pub fn set_partition_state(&self, id: PartitionId, state: PartitionState) {
        let vb = {
            let _guard = self.state_lock.lock().expect("lock is poisoned");

            match self.partitions.get(id) {
                Some(vb) => {
                    vb.set_state(state);
                    vb
                }
                None => {
                    let vb = self.new_partition(id, state);
                    self.partitions.insert(vb.clone());
                    vb
                }
            }
        };

        self.nonio_dispatcher.schedule(
            Box::new(NotifyStateChangeTask {
                partition: vb,
                callbacks: self.callbacks.clone(),
            }),
            Priority::StateNotify,
            Duration::ZERO,
            false,
        );

        self.io_dispatcher.schedule(
            Box::new(PersistStateTask {
                store: self.clone(),
                id,
                state,
            }),
            Priority::PartitionPersist,
            Duration::ZERO,
            true,
        );
    }

    /// Detaches a dead partition and schedules its removal from the
    /// backing store (retrying every 10 seconds on failure).
    ///
    /// # Errors
    ///
    /// [`Error::NotMyPartition`] unless the partition exists and is dead.
    pub fn delete_partition(&self, id: PartitionId) -> Result<(), Error> {
        {
            let _guard = self.state_lock.lock().expect("lock is poisoned");

            let Some(vb) = self.partitions.get(id) else {
                return Err(Error::NotMyPartition);
            };
            if vb.state() != PartitionState::Dead {
                return Err(Error::NotMyPartition);
            }

            self.partitions.set_pending_deletion(id, true);
            if let Some(detached) = self.partitions.remove(id) {
                log::debug!(
                    "store: detached partition {id} with {} items",
                    detached.hash_table.len()
                );

                // The detached table keeps its counters; the store-wide
                // gauges must forget it now.
                self.stats
                    .cur_size
                    .fetch_sub(detached.hash_table.mem_size(), Ordering::Relaxed);
                self.stats
                    .num_non_resident
                    .fetch_sub(detached.hash_table.non_resident(), Ordering::Relaxed);
            }
        }

        self.io_dispatcher.schedule(
            Box::new(PartitionDeleteTask {
                store: self.clone(),
                id,
            }),
            Priority::PartitionDeletion,
            Duration::ZERO,
            true,
        );

        Ok(())
    }

    /// Asks the backing store to drop a partition that was marked for
    /// deletion. Idempotent; safe to call again if a previous attempt
    /// failed. Returns true once there is nothing left to do.
    pub fn complete_partition_deletion(&self, id: PartitionId) -> bool {
        let obsolete = {
            let _guard = self.state_lock.lock().expect("lock is poisoned");

            match self.partitions.get(id) {
                None => true,
                Some(vb) => {
                    vb.state() == PartitionState::Dead || self.partitions.is_pending_deletion(id)
                }
            }
        };

        if !obsolete {
            return true;
        }

        if self.kvstore.del_partition(id) {
            self.partitions.set_pending_deletion(id, false);
            self.stats
                .partition_deletions
                .fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.stats.partition_del_fail.fetch_add(1, Ordering::Relaxed);
            log::debug!("store: partition {id} deletion failed, will retry");
            false
        }
    }
}

struct NotifyStateChangeTask {
    partition: PartitionRef,
    callbacks: Arc<dyn ServerCallbacks>,
}

impl DispatcherCallback for NotifyStateChangeTask {
    fn run(&mut self, _: &Dispatcher, _: TaskId) -> Option<Duration> {
        self.partition.fire_all_ops(&*self.callbacks);
        None
    }

    fn describe(&self) -> String {
        format!(
            "Notifying state change of partition {}",
            self.partition.id()
        )
    }
}

struct PersistStateTask {
    store: Store,
    id: PartitionId,
    state: PartitionState,
}

impl DispatcherCallback for PersistStateTask {
    fn run(&mut self, _: &Dispatcher, _: TaskId) -> Option<Duration> {
        if self.store.kvstore.set_partition_state(self.id, self.state) {
            None
        } else {
            log::debug!(
                "store: rescheduling persist of partition {} state",
                self.id
            );
            Some(Duration::from_secs(5))
        }
    }

    fn describe(&self) -> String {
        format!("Setting partition {} state to {}", self.id, self.state)
    }
}

struct PartitionDeleteTask {
    store: Store,
    id: PartitionId,
}

impl DispatcherCallback for PartitionDeleteTask {
    fn run(&mut self, _: &Dispatcher, _: TaskId) -> Option<Duration> {
        if self.store.complete_partition_deletion(self.id) {
            None
        } else {
            Some(Duration::from_secs(10))
        }
    }

    fn describe(&self) -> String {
        format!("Removing partition {} from the backing store", self.id)
    }
}
