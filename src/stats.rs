use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

macro_rules! counter {
    ($this:expr) => {
        $this.load(Ordering::Relaxed)
    };
}

/// Atomic counters describing the store's behavior.
///
/// Everything here is monotonic or a gauge; reading is always allowed and
/// never locks. External collectors are expected to poll
/// [`Stats::snapshot`].
#[derive(Default)]
pub struct Stats {
    /// Resident bytes across all partitions
    pub(crate) cur_size: AtomicUsize,

    /// Bytes of queue bookkeeping (dirty-queue entries in flight)
    pub(crate) mem_overhead: AtomicUsize,

    /// Entries whose value payload is not in memory
    pub(crate) num_non_resident: AtomicUsize,

    /// Value payloads dropped to reclaim memory
    pub(crate) num_value_ejects: AtomicU64,

    /// Items lazily expired on access
    pub(crate) expired: AtomicU64,

    /// Dirty items dropped by the flusher because they expired in the
    /// meantime
    pub(crate) flush_expired: AtomicU64,

    /// Total entries pushed onto the dirty queue
    pub(crate) tot_enqueued: AtomicU64,

    /// Gauge: entries waiting in the producer-side dirty queue
    pub(crate) queue_size: AtomicUsize,

    /// Gauge: entries in the current flush batch
    pub(crate) flusher_todo: AtomicUsize,

    /// Items deferred because their data was younger than the minimum age
    pub(crate) too_young: AtomicU64,

    /// Items force-accepted because they sat in the queue past the age cap
    pub(crate) too_old: AtomicU64,

    /// Successful backing-store commits
    pub(crate) flusher_commits: AtomicU64,

    /// Commit attempts the backing store refused
    pub(crate) commit_failed: AtomicU64,

    /// Flush batches cut short by a pending background fetch
    pub(crate) flusher_preempts: AtomicU64,

    /// Persists that failed and were redirtied
    pub(crate) flush_failed: AtomicU64,

    /// Rows newly inserted into the backing store
    pub(crate) new_items: AtomicU64,

    /// Rows removed from the backing store
    pub(crate) del_items: AtomicU64,

    /// Set persists that updated an existing row
    pub(crate) disk_updates: AtomicU64,

    /// Completed background fetches
    pub(crate) bg_fetched: AtomicU64,

    /// Gauge: background fetches queued but not yet completed. The flusher
    /// yields while this is non-zero.
    pub(crate) bg_fetch_queue: AtomicUsize,

    /// Operations refused because of partition state
    pub(crate) num_not_my_partitions: AtomicU64,

    /// Gauge: age of the oldest flushed entry in the last batch, seconds
    pub(crate) dirty_age: AtomicU64,
    pub(crate) dirty_age_high_wat: AtomicU64,

    /// Gauge: data age of the last flushed entry, seconds
    pub(crate) data_age: AtomicU64,
    pub(crate) data_age_high_wat: AtomicU64,

    /// Records loaded during warm-up
    pub(crate) warmed_up: AtomicU64,

    /// Duplicate keys seen during warm-up
    pub(crate) warm_dups: AtomicU64,

    /// Records dropped during warm-up because memory stayed exhausted even
    /// after the emergency purge
    pub(crate) warm_oom: AtomicU64,

    /// Partitions removed from the backing store
    pub(crate) partition_deletions: AtomicU64,

    /// Failed partition removal attempts (rescheduled)
    pub(crate) partition_del_fail: AtomicU64,

    /// Cookies parked on pending partitions
    pub(crate) pending_ops: AtomicU64,
}

impl Stats {
    pub(crate) fn set_high_water(gauge: &AtomicU64, high: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
        high.fetch_max(value, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cur_size: counter!(self.cur_size),
            mem_overhead: counter!(self.mem_overhead),
            num_non_resident: counter!(self.num_non_resident),
            num_value_ejects: counter!(self.num_value_ejects),
            expired: counter!(self.expired),
            flush_expired: counter!(self.flush_expired),
            tot_enqueued: counter!(self.tot_enqueued),
            queue_size: counter!(self.queue_size),
            flusher_todo: counter!(self.flusher_todo),
            too_young: counter!(self.too_young),
            too_old: counter!(self.too_old),
            flusher_commits: counter!(self.flusher_commits),
            commit_failed: counter!(self.commit_failed),
            flusher_preempts: counter!(self.flusher_preempts),
            flush_failed: counter!(self.flush_failed),
            new_items: counter!(self.new_items),
            del_items: counter!(self.del_items),
            disk_updates: counter!(self.disk_updates),
            bg_fetched: counter!(self.bg_fetched),
            bg_fetch_queue: counter!(self.bg_fetch_queue),
            num_not_my_partitions: counter!(self.num_not_my_partitions),
            dirty_age: counter!(self.dirty_age),
            dirty_age_high_wat: counter!(self.dirty_age_high_wat),
            data_age: counter!(self.data_age),
            data_age_high_wat: counter!(self.data_age_high_wat),
            warmed_up: counter!(self.warmed_up),
            warm_dups: counter!(self.warm_dups),
            warm_oom: counter!(self.warm_oom),
            partition_deletions: counter!(self.partition_deletions),
            partition_del_fail: counter!(self.partition_del_fail),
            pending_ops: counter!(self.pending_ops),
        }
    }
}

/// Plain-data copy of [`Stats`], safe to ship across threads or serialize.
#[derive(Clone, Debug, Default)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub cur_size: usize,
    pub mem_overhead: usize,
    pub num_non_resident: usize,
    pub num_value_ejects: u64,
    pub expired: u64,
    pub flush_expired: u64,
    pub tot_enqueued: u64,
    pub queue_size: usize,
    pub flusher_todo: usize,
    pub too_young: u64,
    pub too_old: u64,
    pub flusher_commits: u64,
    pub commit_failed: u64,
    pub flusher_preempts: u64,
    pub flush_failed: u64,
    pub new_items: u64,
    pub del_items: u64,
    pub disk_updates: u64,
    pub bg_fetched: u64,
    pub bg_fetch_queue: usize,
    pub num_not_my_partitions: u64,
    pub dirty_age: u64,
    pub dirty_age_high_wat: u64,
    pub data_age: u64,
    pub data_age_high_wat: u64,
    pub warmed_up: u64,
    pub warm_dups: u64,
    pub warm_oom: u64,
    pub partition_deletions: u64,
    pub partition_del_fail: u64,
    pub pending_ops: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn high_water_marks_only_rise() {
        let stats = Stats::default();

        Stats::set_high_water(&stats.dirty_age, &stats.dirty_age_high_wat, 10);
        Stats::set_high_water(&stats.dirty_age, &stats.dirty_age_high_wat, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.dirty_age, 3);
        assert_eq!(snap.dirty_age_high_wat, 10);
    }
}
