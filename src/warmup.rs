use crate::hash_table::AddStatus;
use crate::kvstore::LoadCallback;
use crate::partition::PartitionState;
use crate::store::Store;
use crate::value::{Item, PartitionId};
use std::sync::atomic::Ordering;

/// Start-up ingestion: streams the backing store's rows back into the
/// partitions, ejecting as it goes once memory runs low.
pub(crate) fn run(store: &Store) {
    let mut loader = WarmupLoader {
        store: store.clone(),
        has_purged: false,
    };

    store.kvstore.dump(&mut loader);

    let snapshot = store.stats().snapshot();
    log::info!(
        "warmup: loaded {} items ({} duplicates, {} dropped for memory)",
        snapshot.warmed_up,
        snapshot.warm_dups,
        snapshot.warm_oom
    );
}

struct WarmupLoader {
    store: Store,
    has_purged: bool,
}

impl WarmupLoader {
    /// Values stay resident while memory is comfortably below the low
    /// watermark; past it, records are loaded as metadata only.
    fn should_be_resident(&self) -> bool {
        self.store.stats().cur_size.load(Ordering::Relaxed) < self.store.config.mem_low_watermark
    }

    fn try_add(&self, partition: PartitionId, item: &Item, retain: bool) -> AddStatus {
        let Some(partition) = self.store.partitions.get(partition) else {
            return AddStatus::NoMem;
        };

        let now = self.store.clock.now();
        let status = partition
            .hash_table
            .lock_bucket(&item.key)
            .add(item, now, true, retain);
        status
    }

    /// One-shot sweep: eject every ejectable value in every partition.
    fn purge(&mut self) {
        let now = self.store.clock.now();
        let mut ejected = 0;

        for id in self.store.partitions.ids() {
            if let Some(partition) = self.store.partitions.get(id) {
                ejected += partition.hash_table.eject_eligible(now);
            }
        }

        log::warn!("warmup: emergency purge ejected {ejected} values");
        self.has_purged = true;
    }
}

impl LoadCallback for WarmupLoader {
    fn partition_state(&mut self, id: PartitionId, state: PartitionState) {
        self.store.ensure_partition(id, state);
    }

    fn load(&mut self, item: Item) {
        let id = item.partition_id;

        // A row without a persisted partition state gets a pending
        // partition; the state change will arrive eventually.
        self.store.ensure_partition(id, PartitionState::Pending);

        let retain = self.should_be_resident();

        match self.try_add(id, &item, retain) {
            AddStatus::Success | AddStatus::Undel => {}
            AddStatus::Exists => {
                log::warn!("warmup: duplicate key {:?}", item.key);
                self.store.stats().warm_dups.fetch_add(1, Ordering::Relaxed);
            }
            AddStatus::NoMem => {
                if self.has_purged {
                    self.store.stats().warm_oom.fetch_add(1, Ordering::Relaxed);
                } else {
                    log::warn!("warmup: emergency purge to free space for load");
                    self.purge();

                    match self.try_add(id, &item, retain) {
                        AddStatus::Success | AddStatus::Undel => {}
                        AddStatus::Exists => {
                            log::warn!("warmup: duplicate key {:?}", item.key);
                            self.store.stats().warm_dups.fetch_add(1, Ordering::Relaxed);
                        }
                        AddStatus::NoMem => {
                            if self.store.stats().warm_oom.fetch_add(1, Ordering::Relaxed) == 0 {
                                log::warn!("warmup: memory ceiling too low for data load");
                            }
                        }
                    }
                }
            }
        }

        self.store.stats().warmed_up.fetch_add(1, Ordering::Relaxed);
    }
}
