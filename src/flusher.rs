use crate::dirty_queue::{QueueOp, QueuedItem};
use crate::dispatcher::{Dispatcher, DispatcherCallback, TaskId};
use crate::kvstore::SetResult;
use crate::partition::PartitionState;
use crate::stats::Stats;
use crate::store::Store;
use crate::time::RelTime;
use crate::value::UNASSIGNED_ROW_ID;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

const COMMIT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Flusher lifecycle.
///
/// `Initializing → Running ⇄ {Writing, Paused} → Stopping → Stopped`
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum FlusherPhase {
    Initializing,
    Running,
    Writing,
    Paused,
    Stopping,
    Stopped,
}

impl FlusherPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Initializing,
            1 => Self::Running,
            2 => Self::Writing,
            3 => Self::Paused,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Default)]
pub(crate) struct FlusherState(AtomicU8);

impl FlusherState {
    pub(crate) fn phase(&self) -> FlusherPhase {
        FlusherPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: FlusherPhase) {
        log::trace!("flusher: {:?} -> {phase:?}", self.phase());
        self.0.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn pause(&self) {
        if matches!(self.phase(), FlusherPhase::Running | FlusherPhase::Writing) {
            self.set_phase(FlusherPhase::Paused);
        }
    }

    pub(crate) fn resume(&self) {
        if self.phase() == FlusherPhase::Paused {
            self.set_phase(FlusherPhase::Running);
        }
    }

    pub(crate) fn request_stop(&self) {
        if self.phase() != FlusherPhase::Stopped {
            self.set_phase(FlusherPhase::Stopping);
        }
    }
}

/// Background task driving the flusher on the I/O dispatcher.
///
/// Each tick runs one flush cycle and reschedules itself; the reschedule
/// delay shrinks to the smallest defer hint so deferred items are retried
/// on time.
pub(crate) struct FlusherTask {
    pub(crate) store: Store,
    pub(crate) interval: Duration,
}

impl DispatcherCallback for FlusherTask {
    fn run(&mut self, _: &Dispatcher, _: TaskId) -> Option<Duration> {
        match self.store.flusher.phase() {
            FlusherPhase::Stopping => {
                self.store.flusher.set_phase(FlusherPhase::Stopped);
                log::debug!("flusher: stopped");
                None
            }
            FlusherPhase::Stopped => None,
            FlusherPhase::Paused => Some(COMMIT_RETRY_BACKOFF),
            FlusherPhase::Initializing | FlusherPhase::Running | FlusherPhase::Writing => {
                match flush_cycle(&self.store) {
                    None => Some(self.interval),
                    Some(0) => Some(Duration::ZERO),
                    Some(secs) => Some(self.interval.min(Duration::from_secs(u64::from(secs)))),
                }
            }
        }
    }

    fn describe(&self) -> String {
        "Flushing dirty items to the backing store".into()
    }
}

/// Runs one flush cycle: swap the dirty queue, drain it in transactional
/// batches, requeue rejects.
///
/// Returns `None` when there was nothing to do, otherwise the smallest
/// defer hint in seconds (`0` = nothing was deferred).
pub(crate) fn flush_cycle(store: &Store) -> Option<RelTime> {
    let mut writing = store.writing.lock().expect("lock is poisoned");
    let stats = store.stats();

    if !store.dirty_queue.begin_flush(&mut writing, stats) {
        return None;
    }

    store.flusher.set_phase(FlusherPhase::Writing);
    log::debug!(
        "flusher: flushing {} items, {} still queued",
        writing.len(),
        store.dirty_queue.len()
    );

    let mut rejects: VecDeque<QueuedItem> = VecDeque::new();
    let mut min_defer: Option<RelTime> = None;

    while !writing.is_empty() {
        let defer = flush_some(store, &mut writing, &mut rejects);
        if defer != 0 {
            min_defer = Some(min_defer.map_or(defer, |d| d.min(defer)));
        }

        if stats.bg_fetch_queue.load(Ordering::Relaxed) > 0 {
            // Latency-sensitive reads want the disk; come back later
            break;
        }
    }

    // Requeue the rejects for the next cycle
    while let Some(item) = rejects.pop_front() {
        writing.push_back(item);
    }
    stats.flusher_todo.store(writing.len(), Ordering::Relaxed);

    store.flusher.set_phase(FlusherPhase::Running);
    Some(min_defer.unwrap_or(0))
}

/// Flushes up to one transaction's worth of items.
/// Returns the smallest non-zero defer hint seen in the batch.
fn flush_some(
    store: &Store,
    writing: &mut VecDeque<QueuedItem>,
    rejects: &mut VecDeque<QueuedItem>,
) -> RelTime {
    let stats = store.stats();
    let txn_size = store.txn_size.load(Ordering::Relaxed);

    store.kvstore.begin();

    let mut min_defer: RelTime = 0;
    for _ in 0..txn_size {
        if writing.is_empty() || stats.bg_fetch_queue.load(Ordering::Relaxed) > 0 {
            break;
        }

        let Some(item) = writing.pop_front() else {
            break;
        };

        let defer = flush_one(store, item, rejects);
        if defer != 0 && (min_defer == 0 || defer < min_defer) {
            min_defer = defer;
        }
    }

    if stats.bg_fetch_queue.load(Ordering::Relaxed) > 0 {
        stats.flusher_preempts.fetch_add(1, Ordering::Relaxed);
    }

    while !store.kvstore.commit() {
        stats.commit_failed.fetch_add(1, Ordering::Relaxed);
        log::warn!("flusher: commit failed, retrying");
        std::thread::sleep(COMMIT_RETRY_BACKOFF);
    }
    stats.flusher_commits.fetch_add(1, Ordering::Relaxed);

    min_defer
}

fn flush_one(store: &Store, item: QueuedItem, rejects: &mut VecDeque<QueuedItem>) -> RelTime {
    let stats = store.stats();
    stats.mem_overhead.fetch_sub(item.size(), Ordering::Relaxed);
    let _ = stats
        .flusher_todo
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

    match item.op {
        QueueOp::FlushAll => {
            log::info!("flusher: resetting the backing store");
            store.kvstore.reset();
            0
        }
        QueueOp::Set | QueueOp::Del => flush_one_del_or_set(store, item, rejects),
    }
}

/// Persists (or deletes) a single queued key, deciding from what is in
/// memory right now rather than from the queued operation.
///
/// Returns the number of seconds to defer the item, `0` if it was handled.
fn flush_one_del_or_set(
    store: &Store,
    item: QueuedItem,
    rejects: &mut VecDeque<QueuedItem>,
) -> RelTime {
    let Some(partition) = store.partitions.get(item.partition_id) else {
        // Partition is gone; so is the work
        return 0;
    };

    let stats = store.stats();
    let now = store.clock.now();
    let min_data_age = store.min_data_age.load(Ordering::Relaxed);
    let queue_age_cap = store.queue_age_cap.load(Ordering::Relaxed);

    let mut guard = partition.hash_table.lock_bucket(&item.key);

    let mut deleted = false;
    let mut is_dirty = false;
    let mut row_id = UNASSIGNED_ROW_ID;
    let mut dirtied: RelTime = 0;
    let mut defer: RelTime = 0;
    let mut snapshot = None;

    if let Some(v) = store.fetch_valid_value(&partition, &mut guard, &item.key, true, now) {
        deleted = v.is_deleted();
        is_dirty = v.is_dirty();
        row_id = v.row_id();

        if is_dirty && v.is_expired(now.saturating_add(store.config.item_expiry_window)) {
            // About to expire anyway; not worth a write
            stats.flush_expired.fetch_add(1, Ordering::Relaxed);
            v.mark_clean();
            is_dirty = false;
        }

        if is_dirty {
            dirtied = v.mark_clean();
            let data_age = now.saturating_sub(dirtied);
            let dirty_age = now.saturating_sub(item.queued_at);

            let mut eligible = true;
            if v.is_pending_id() {
                // A persist for this value is already in flight
                eligible = false;
            } else if dirty_age > queue_age_cap {
                stats.too_old.fetch_add(1, Ordering::Relaxed);
            } else if data_age < min_data_age {
                eligible = false;
                defer = min_data_age - data_age;
                stats.too_young.fetch_add(1, Ordering::Relaxed);
            }

            if eligible {
                Stats::set_high_water(&stats.dirty_age, &stats.dirty_age_high_wat, dirty_age.into());
                Stats::set_high_water(&stats.data_age, &stats.data_age_high_wat, data_age.into());

                if !deleted {
                    snapshot = Some(v.to_item(item.partition_id));
                    if row_id == UNASSIGNED_ROW_ID {
                        v.set_pending_id();
                    }
                }
            } else {
                is_dirty = false;
                v.re_dirty(dirtied);
                stats.mem_overhead.fetch_add(item.size(), Ordering::Relaxed);
                rejects.push_back(item.clone());
            }
        }
    }

    // Never hold a bucket lock across backing-store I/O
    drop(guard);

    if is_dirty && !deleted {
        if store.partitions.is_pending_deletion(item.partition_id) {
            // The partition's rows are being dropped; writing now would
            // resurrect them. Requeue and let a later cycle decide.
            log::debug!(
                "flusher: partition {} is being deleted, requeueing {:?}",
                item.partition_id,
                item.key
            );
            store.requeue(item);
        } else {
            let snapshot = snapshot.expect("accepted set always has a snapshot");
            if snapshot.row_id != UNASSIGNED_ROW_ID {
                stats.disk_updates.fetch_add(1, Ordering::Relaxed);
            }

            let result = store.kvstore.set(&snapshot);
            PersistenceCallback::new(store, &item, rejects, dirtied).on_set_result(result);
        }
    } else if deleted {
        let mut callback = PersistenceCallback::new(store, &item, rejects, dirtied);
        if row_id > 0 {
            let affected = store.kvstore.del(&item.key, row_id);
            callback.on_del_result(affected);
        } else {
            // Nothing persisted to delete; run the callback for cleanup
            callback.on_del_result(0);
        }
    }

    defer
}

/// Closure over one queued item so a failed persist can be requeued.
///
/// The two operations mirror the two results a backing store can hand
/// back: a set result carrying the row identity, and a delete result.
struct PersistenceCallback<'a> {
    store: &'a Store,
    item: &'a QueuedItem,
    rejects: &'a mut VecDeque<QueuedItem>,
    dirtied: RelTime,
}

impl<'a> PersistenceCallback<'a> {
    fn new(
        store: &'a Store,
        item: &'a QueuedItem,
        rejects: &'a mut VecDeque<QueuedItem>,
        dirtied: RelTime,
    ) -> Self {
        Self {
            store,
            item,
            rejects,
            dirtied,
        }
    }

    fn on_set_result(&mut self, result: SetResult) {
        let stats = self.store.stats();

        match result.affected {
            1 => {
                if result.row_id > 0 {
                    stats.new_items.fetch_add(1, Ordering::Relaxed);
                    self.assign_row_id(result.row_id);
                }

                // A partition that is no longer active does not need the
                // value resident; reclaim it when memory is tight.
                if let Some(partition) = self.store.partitions.get(self.item.partition_id) {
                    let tight = stats.cur_size.load(Ordering::Relaxed)
                        > self.store.config.mem_low_watermark;
                    if partition.state() != PartitionState::Active && tight {
                        let now = self.store.clock.now();
                        let mut guard = partition.hash_table.lock_bucket(&self.item.key);
                        guard.eject(&self.item.key, now);
                    }
                }
            }
            0 => {
                // Stored nothing but did not fail; we cannot learn the row
                // id from this, so treat it as transient and retry.
                log::warn!(
                    "flusher: persisting {:?}@{} affected no rows",
                    self.item.key,
                    self.item.partition_id
                );
                self.redirty();
            }
            _ => self.redirty(),
        }
    }

    fn on_del_result(&mut self, affected: i8) {
        debug_assert!(affected < 2, "deleted more than the one row");
        let stats = self.store.stats();

        if affected < 0 {
            self.redirty();
            return;
        }

        if affected > 0 {
            stats.del_items.fetch_add(1, Ordering::Relaxed);
        }

        // The row is gone from disk; the tombstone may leave the table.
        let Some(partition) = self.store.partitions.get(self.item.partition_id) else {
            return;
        };

        let mut guard = partition.hash_table.lock_bucket(&self.item.key);
        let still_tombstone = guard.find(&self.item.key, true).map(|v| v.is_deleted());

        match still_tombstone {
            Some(true) => {
                let removed = guard.remove(&self.item.key);
                debug_assert!(removed);
            }
            Some(false) => {
                // The key was written again in the meantime; its old row
                // is gone, so the next flush must insert it fresh.
                if let Some(v) = guard.find(&self.item.key, true) {
                    v.clear_row_id();
                }
            }
            None => {}
        }
    }

    fn assign_row_id(&self, row_id: crate::value::RowId) {
        let done = self
            .store
            .with_locked_value(&self.item.key, self.item.partition_id, |v| {
                v.set_row_id(row_id);
            });

        if !done {
            log::warn!(
                "flusher: failed to record row id for {:?}@{}",
                self.item.key,
                self.item.partition_id
            );
        }
    }

    fn redirty(&mut self) {
        let stats = self.store.stats();
        stats.mem_overhead.fetch_add(self.item.size(), Ordering::Relaxed);
        stats.flush_failed.fetch_add(1, Ordering::Relaxed);

        let dirtied = self.dirtied;
        self.store
            .with_locked_value(&self.item.key, self.item.partition_id, |v| {
                v.re_dirty(dirtied);
            });

        self.rejects.push_back(self.item.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kvstore::MemoryKvStore;
    use crate::time::ManualClock;
    use crate::value::Item;
    use std::sync::Arc;
    use test_log::test;

    fn store_with_clock(min_data_age: RelTime) -> (Store, Arc<MemoryKvStore>, Arc<ManualClock>) {
        let kvstore = Arc::new(MemoryKvStore::default());
        let clock = Arc::new(ManualClock::default());

        let store = Config::new()
            .min_data_age(min_data_age)
            .queue_age_cap(3600)
            .flush_interval(None)
            .clock(clock.clone())
            .open(kvstore.clone());

        (store, kvstore, clock)
    }

    #[test]
    fn idle_cycle_reports_nothing_to_do() {
        let (store, _, _) = store_with_clock(0);
        assert_eq!(flush_cycle(&store), None);
        store.stop();
    }

    #[test]
    fn young_items_are_deferred_with_a_hint() {
        let (store, kvstore, clock) = store_with_clock(10);

        store
            .set(Item::new(b"c".to_vec(), b"1".to_vec(), 0, 0, 0), 0, false)
            .expect("set works");

        clock.advance(3);
        assert_eq!(flush_cycle(&store), Some(7), "hint is the age shortfall");
        assert_eq!(kvstore.row_count(), 0);
        assert_eq!(store.stats().snapshot().too_young, 1);

        clock.advance(8);
        assert_eq!(flush_cycle(&store), Some(0));
        assert_eq!(kvstore.row_count(), 1);
        store.stop();
    }

    #[test]
    fn queue_age_cap_beats_min_data_age() {
        let (store, kvstore, clock) = store_with_clock(10_000);

        store
            .set(Item::new(b"old".to_vec(), b"1".to_vec(), 0, 0, 0), 0, false)
            .expect("set works");

        // Way past the queue age cap, still younger than min_data_age
        clock.advance(3601);
        assert_eq!(flush_cycle(&store), Some(0));
        assert_eq!(kvstore.row_count(), 1);
        assert_eq!(store.stats().snapshot().too_old, 1);
        store.stop();
    }

    #[test]
    fn failed_set_is_redirtied_and_retried() {
        let (store, kvstore, _) = store_with_clock(0);
        kvstore.fail_sets(1);

        store
            .set(Item::new(b"a".to_vec(), b"1".to_vec(), 0, 0, 0), 0, false)
            .expect("set works");

        assert_eq!(flush_cycle(&store), Some(0));
        assert_eq!(kvstore.row_count(), 0);
        assert_eq!(store.stats().snapshot().flush_failed, 1);

        // The reject is still in the writing queue; next cycle lands it
        assert_eq!(flush_cycle(&store), Some(0));
        assert_eq!(kvstore.row_count(), 1);
        store.stop();
    }

    #[test]
    fn flusher_state_transitions() {
        let state = FlusherState::default();
        assert_eq!(state.phase(), FlusherPhase::Initializing);

        state.set_phase(FlusherPhase::Running);
        state.pause();
        assert_eq!(state.phase(), FlusherPhase::Paused);

        state.resume();
        assert_eq!(state.phase(), FlusherPhase::Running);

        state.request_stop();
        assert_eq!(state.phase(), FlusherPhase::Stopping);
    }

    #[test]
    fn expiring_items_are_dropped_not_written() {
        let (store, kvstore, clock) = store_with_clock(0);

        store
            .set(Item::new(b"a".to_vec(), b"1".to_vec(), 0, 2, 0), 0, false)
            .expect("set works");

        // Inside the expiry window at flush time
        clock.advance(1);
        assert_eq!(flush_cycle(&store), Some(0));
        assert_eq!(kvstore.row_count(), 0);
        assert_eq!(store.stats().snapshot().flush_expired, 1);
        store.stop();
    }
}
