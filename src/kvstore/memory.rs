use super::{GetResult, KvStore, LoadCallback, SetResult};
use crate::partition::PartitionState;
use crate::value::{Item, PartitionId, RowId, UNASSIGNED_ROW_ID};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

enum StagedOp {
    Set { row_id: RowId, item: Item },
    Del { row_id: RowId },
}

#[derive(Default)]
struct Tables {
    rows: BTreeMap<RowId, Item>,
    states: HashMap<PartitionId, PartitionState>,
    staged: Vec<StagedOp>,
}

/// In-memory [`KvStore`] with a staged transaction buffer.
///
/// This is the backing store for tests and for running the cache without
/// durability. The `fail_*` knobs make the next *n* calls of the matching
/// operation report failure, which is how the flusher's redirty and retry
/// paths get exercised.
#[derive(Default)]
pub struct MemoryKvStore {
    tables: Mutex<Tables>,
    next_row_id: AtomicI64,
    commit_count: AtomicU64,
    reset_count: AtomicU64,
    fail_sets: AtomicUsize,
    fail_dels: AtomicUsize,
    fail_commits: AtomicUsize,
    fail_del_partitions: AtomicUsize,
}

impl MemoryKvStore {
    /// Makes the next `n` set persists fail with `affected = -1`.
    pub fn fail_sets(&self, n: usize) {
        self.fail_sets.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` delete persists fail with `affected = -1`.
    pub fn fail_dels(&self, n: usize) {
        self.fail_dels.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` commits report failure.
    pub fn fail_commits(&self, n: usize) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` partition deletions report failure.
    pub fn fail_del_partitions(&self, n: usize) {
        self.fail_del_partitions.store(n, Ordering::SeqCst);
    }

    /// Number of committed rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.lock().expect("lock is poisoned").rows.len()
    }

    /// Committed row for `key` in `partition`, if any.
    #[must_use]
    pub fn row_for_key(&self, partition: PartitionId, key: &[u8]) -> Option<Item> {
        self.tables
            .lock()
            .expect("lock is poisoned")
            .rows
            .values()
            .find(|item| item.partition_id == partition && &*item.key == key)
            .cloned()
    }

    /// Persisted state of `partition`, if any.
    #[must_use]
    pub fn partition_state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.tables
            .lock()
            .expect("lock is poisoned")
            .states
            .get(&partition)
            .copied()
    }

    /// How many commits have succeeded.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::SeqCst)
    }

    /// How many times [`KvStore::reset`] ran.
    #[must_use]
    pub fn reset_count(&self) -> u64 {
        self.reset_count.load(Ordering::SeqCst)
    }

    /// Seeds a committed row directly, bypassing the transaction buffer.
    /// Returns the assigned row id. Meant for warm-up tests.
    pub fn seed_row(&self, mut item: Item) -> RowId {
        let row_id = self.next_row_id.fetch_add(1, Ordering::SeqCst) + 1;
        item.row_id = row_id;

        let mut tables = self.tables.lock().expect("lock is poisoned");
        tables.rows.insert(row_id, item);
        row_id
    }

    /// Seeds a persisted partition state directly.
    pub fn seed_partition_state(&self, id: PartitionId, state: PartitionState) {
        let mut tables = self.tables.lock().expect("lock is poisoned");
        tables.states.insert(id, state);
    }

    fn take_failure(knob: &AtomicUsize) -> bool {
        knob.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl KvStore for MemoryKvStore {
    fn begin(&self) {
        let mut tables = self.tables.lock().expect("lock is poisoned");
        debug_assert!(tables.staged.is_empty(), "transaction already open");
        tables.staged.clear();
    }

    fn commit(&self) -> bool {
        if Self::take_failure(&self.fail_commits) {
            return false;
        }

        let mut tables = self.tables.lock().expect("lock is poisoned");
        let staged = std::mem::take(&mut tables.staged);
        for op in staged {
            match op {
                StagedOp::Set { row_id, item } => {
                    tables.rows.insert(row_id, item);
                }
                StagedOp::Del { row_id } => {
                    tables.rows.remove(&row_id);
                }
            }
        }

        self.commit_count.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn rollback(&self) {
        self.tables.lock().expect("lock is poisoned").staged.clear();
    }

    fn set(&self, item: &Item) -> SetResult {
        if Self::take_failure(&self.fail_sets) {
            return SetResult {
                affected: -1,
                row_id: UNASSIGNED_ROW_ID,
            };
        }

        let row_id = if item.row_id > 0 {
            item.row_id
        } else {
            self.next_row_id.fetch_add(1, Ordering::SeqCst) + 1
        };

        let mut stored = item.clone();
        stored.row_id = row_id;

        let mut tables = self.tables.lock().expect("lock is poisoned");
        tables.staged.push(StagedOp::Set {
            row_id,
            item: stored,
        });

        SetResult {
            affected: 1,
            row_id: if item.row_id > 0 {
                UNASSIGNED_ROW_ID
            } else {
                row_id
            },
        }
    }

    fn del(&self, key: &[u8], row_id: RowId) -> i8 {
        if Self::take_failure(&self.fail_dels) {
            return -1;
        }

        let mut tables = self.tables.lock().expect("lock is poisoned");
        let exists = tables
            .rows
            .get(&row_id)
            .is_some_and(|item| &*item.key == key);

        if exists {
            tables.staged.push(StagedOp::Del { row_id });
            1
        } else {
            0
        }
    }

    fn get(&self, key: &[u8], row_id: RowId) -> GetResult {
        let tables = self.tables.lock().expect("lock is poisoned");
        match tables.rows.get(&row_id) {
            Some(item) if &*item.key == key => GetResult::Found(item.clone()),
            _ => GetResult::NotFound,
        }
    }

    fn set_partition_state(&self, id: PartitionId, state: PartitionState) -> bool {
        let mut tables = self.tables.lock().expect("lock is poisoned");
        tables.states.insert(id, state);
        true
    }

    fn del_partition(&self, id: PartitionId) -> bool {
        if Self::take_failure(&self.fail_del_partitions) {
            return false;
        }

        let mut tables = self.tables.lock().expect("lock is poisoned");
        tables.rows.retain(|_, item| item.partition_id != id);
        tables.states.remove(&id);
        true
    }

    fn reset(&self) {
        let mut tables = self.tables.lock().expect("lock is poisoned");
        tables.rows.clear();
        tables.staged.clear();
        self.reset_count.fetch_add(1, Ordering::SeqCst);
    }

    fn dump(&self, loader: &mut dyn LoadCallback) {
        let tables = self.tables.lock().expect("lock is poisoned");

        for (id, state) in &tables.states {
            loader.partition_state(*id, *state);
        }
        for item in tables.rows.values() {
            loader.load(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn item(key: &[u8], value: &[u8]) -> Item {
        Item::new(key.to_vec(), value.to_vec(), 0, 0, 0)
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let store = MemoryKvStore::default();

        store.begin();
        let result = store.set(&item(b"a", b"1"));
        assert_eq!(result.affected, 1);
        assert!(result.row_id > 0);
        assert_eq!(store.row_count(), 0);

        assert!(store.commit());
        assert_eq!(store.row_count(), 1);
        assert!(store.row_for_key(0, b"a").is_some());
    }

    #[test]
    fn update_keeps_the_row_identity() {
        let store = MemoryKvStore::default();

        store.begin();
        let row_id = store.set(&item(b"a", b"1")).row_id;
        store.commit();

        let mut update = item(b"a", b"2");
        update.row_id = row_id;

        store.begin();
        let result = store.set(&update);
        assert_eq!(result.affected, 1);
        assert_eq!(result.row_id, UNASSIGNED_ROW_ID, "updates assign no new row");
        store.commit();

        assert_eq!(store.row_count(), 1);
        let row = store.row_for_key(0, b"a").expect("row exists");
        assert_eq!(&*row.value, b"2");
    }

    #[test]
    fn del_reports_missing_rows() {
        let store = MemoryKvStore::default();

        store.begin();
        let row_id = store.set(&item(b"a", b"1")).row_id;
        store.commit();

        store.begin();
        assert_eq!(store.del(b"a", row_id), 1);
        assert_eq!(store.del(b"a", 999), 0);
        store.commit();

        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let store = MemoryKvStore::default();

        store.begin();
        store.set(&item(b"a", b"1"));
        store.rollback();
        store.begin();
        assert!(store.commit());

        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn failure_knobs_are_one_shot() {
        let store = MemoryKvStore::default();
        store.fail_sets(1);

        assert_eq!(store.set(&item(b"a", b"1")).affected, -1);
        store.begin();
        assert_eq!(store.set(&item(b"a", b"1")).affected, 1);
        assert!(store.commit());

        store.fail_commits(2);
        store.begin();
        store.set(&item(b"b", b"2"));
        assert!(!store.commit());
        assert!(!store.commit());
        assert!(store.commit());
        assert_eq!(store.row_count(), 2);
    }

    #[test]
    fn get_checks_the_key() {
        let store = MemoryKvStore::default();

        store.begin();
        let row_id = store.set(&item(b"a", b"1")).row_id;
        store.commit();

        assert!(matches!(store.get(b"a", row_id), GetResult::Found(_)));
        assert!(matches!(store.get(b"b", row_id), GetResult::NotFound));
    }

    #[test]
    fn dump_streams_states_then_rows() {
        let store = MemoryKvStore::default();
        store.seed_partition_state(3, PartitionState::Replica);
        store.seed_row(item(b"a", b"1"));

        #[derive(Default)]
        struct Sink {
            states: Vec<(PartitionId, PartitionState)>,
            items: Vec<Item>,
        }

        impl LoadCallback for Sink {
            fn partition_state(&mut self, id: PartitionId, state: PartitionState) {
                self.states.push((id, state));
            }

            fn load(&mut self, item: Item) {
                self.items.push(item);
            }
        }

        let mut sink = Sink::default();
        store.dump(&mut sink);

        assert_eq!(sink.states, vec![(3, PartitionState::Replica)]);
        assert_eq!(sink.items.len(), 1);
    }

    #[test]
    fn del_partition_drops_its_rows() {
        let store = MemoryKvStore::default();
        store.seed_row(item(b"a", b"1"));

        let mut other = item(b"b", b"2");
        other.partition_id = 5;
        store.seed_row(other);

        assert!(store.del_partition(5));
        assert_eq!(store.row_count(), 1);

        store.fail_del_partitions(1);
        assert!(!store.del_partition(0));
        assert!(store.del_partition(0));
        assert_eq!(store.row_count(), 0);
    }
}
