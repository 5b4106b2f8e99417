use crate::stats::Stats;
use crate::stored_value::StoredValue;
use crate::time::RelTime;
use crate::value::{Item, UserValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Outcome of a `set` against the hash table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum MutationStatus {
    /// The key was absent. A fresh value was inserted, unless the request
    /// carried a CAS token, in which case nothing was changed.
    NotFound,

    /// Updated a clean value; the caller must enqueue a dirty marker.
    WasClean,

    /// Updated an already-dirty value; a marker is already queued.
    WasDirty,

    /// Memory budget exhausted, nothing was inserted.
    NoMem,

    /// The request's CAS token does not match the stored one.
    InvalidCas,

    /// The value is locked and the request does not hold the lease.
    Locked,
}

/// Outcome of an `add` (fail-if-exists insert).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum AddStatus {
    Success,
    Exists,
    /// A tombstone was revived.
    Undel,
    NoMem,
}

/// Outcome of a soft delete.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum DeleteStatus {
    NotFound,
    WasClean,
    WasDirty,
}

/// Read-only iteration hook over every stored value.
pub(crate) trait Visitor {
    fn visit(&mut self, value: &mut StoredValue);
}

/// Striped-lock chained hash table.
///
/// Every bucket chain sits behind its own mutex; [`HashTable::lock_bucket`]
/// picks it by `hash(key) mod n_buckets`. Memory accounting is atomic and
/// mirrored into the store-wide [`Stats`], so visitors and sweeps can adjust
/// it without taking more than one bucket lock at a time.
pub(crate) struct HashTable {
    buckets: Vec<Mutex<Vec<StoredValue>>>,
    mem_size: AtomicUsize,
    item_count: AtomicUsize,
    non_resident: AtomicUsize,
    max_memory: usize,
    stats: Arc<Stats>,
}

impl HashTable {
    pub(crate) fn new(n_buckets: usize, max_memory: usize, stats: Arc<Stats>) -> Self {
        assert!(n_buckets > 0);

        let mut buckets = Vec::with_capacity(n_buckets);
        buckets.resize_with(n_buckets, || Mutex::new(Vec::new()));

        Self {
            buckets,
            mem_size: AtomicUsize::new(0),
            item_count: AtomicUsize::new(0),
            non_resident: AtomicUsize::new(0),
            max_memory,
            stats,
        }
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        // NOTE: Truncation is fine on 32-bit targets, we only need a bucket
        #[allow(clippy::cast_possible_truncation)]
        let hash = seahash::hash(key) as usize;
        hash % self.buckets.len()
    }

    /// Locks the bucket responsible for `key`.
    pub(crate) fn lock_bucket(&self, key: &[u8]) -> BucketGuard<'_> {
        let idx = self.bucket_of(key);
        let chain = self
            .buckets
            .get(idx)
            .expect("bucket index in range")
            .lock()
            .expect("lock is poisoned");

        BucketGuard { table: self, chain }
    }

    /// Resident bytes held by this table.
    pub(crate) fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Relaxed)
    }

    pub(crate) fn len(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }

    pub(crate) fn non_resident(&self) -> usize {
        self.non_resident.load(Ordering::Relaxed)
    }

    /// Calls the visitor on every stored value, one bucket lock at a time.
    ///
    /// Visitors must be fast and must not block.
    pub(crate) fn visit<V: Visitor>(&self, visitor: &mut V) {
        for bucket in &self.buckets {
            let mut chain = bucket.lock().expect("lock is poisoned");
            for value in chain.iter_mut() {
                visitor.visit(value);
            }
        }
    }

    /// Ejects every ejectable value payload. Returns how many were ejected.
    pub(crate) fn eject_eligible(&self, now: RelTime) -> usize {
        struct EjectVisitor<'a> {
            table: &'a HashTable,
            now: RelTime,
            ejected: usize,
        }

        impl Visitor for EjectVisitor<'_> {
            fn visit(&mut self, value: &mut StoredValue) {
                if let Some(freed) = value.eject_value(self.now) {
                    self.table.note_eject(freed);
                    self.ejected += 1;
                }
            }
        }

        let mut visitor = EjectVisitor {
            table: self,
            now,
            ejected: 0,
        };
        self.visit(&mut visitor);
        visitor.ejected
    }

    /// Drops every entry and resets the counters.
    /// Returns `(entries, resident bytes)` removed.
    pub(crate) fn clear(&self) -> (usize, usize) {
        let mut items = 0;
        let mut bytes = 0;

        for bucket in &self.buckets {
            let mut chain = bucket.lock().expect("lock is poisoned");
            for value in chain.drain(..) {
                items += 1;
                bytes += value.size();
                if !value.is_resident() && !value.is_deleted() {
                    self.dec_non_resident();
                }
            }
        }

        self.debit(bytes);
        self.item_count.fetch_sub(items, Ordering::Relaxed);
        (items, bytes)
    }

    fn has_space_for(&self, extra: usize) -> bool {
        self.stats.cur_size.load(Ordering::Relaxed) + extra <= self.max_memory
    }

    fn credit(&self, bytes: usize) {
        self.mem_size.fetch_add(bytes, Ordering::Relaxed);
        self.stats.cur_size.fetch_add(bytes, Ordering::Relaxed);
    }

    fn debit(&self, bytes: usize) {
        self.mem_size.fetch_sub(bytes, Ordering::Relaxed);
        self.stats.cur_size.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn inc_non_resident(&self) {
        self.non_resident.fetch_add(1, Ordering::Relaxed);
        self.stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_non_resident(&self) {
        self.non_resident.fetch_sub(1, Ordering::Relaxed);
        self.stats.num_non_resident.fetch_sub(1, Ordering::Relaxed);
    }

    fn note_eject(&self, freed: usize) {
        self.debit(freed);
        self.inc_non_resident();
        self.stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
    }
}

/// Exclusive access to one bucket chain.
///
/// All per-key operations happen through this guard so the counters stay
/// consistent with the chain contents.
pub(crate) struct BucketGuard<'a> {
    table: &'a HashTable,
    chain: MutexGuard<'a, Vec<StoredValue>>,
}

impl BucketGuard<'_> {
    /// Finds the stored value for `key`; tombstones are only returned when
    /// `want_deleted` is set.
    pub(crate) fn find(&mut self, key: &[u8], want_deleted: bool) -> Option<&mut StoredValue> {
        self.chain
            .iter_mut()
            .find(|v| &**v.key() == key && (want_deleted || !v.is_deleted()))
    }

    /// Inserts or updates a value.
    pub(crate) fn set(&mut self, item: &Item, now: RelTime) -> MutationStatus {
        let table = self.table;

        if let Some(v) = self.find(&item.key, true) {
            if v.is_locked(now) {
                // The lease holder proves itself with the CAS handed out
                // by `get_locked`; anyone else bounces.
                if item.cas != v.cas() {
                    return MutationStatus::Locked;
                }
                v.unlock();
            }

            if item.cas != 0 {
                if v.is_deleted() {
                    return MutationStatus::NotFound;
                }
                if item.cas != v.cas() {
                    return MutationStatus::InvalidCas;
                }
            }

            let status = if v.is_dirty() {
                MutationStatus::WasDirty
            } else {
                MutationStatus::WasClean
            };

            let was_counted_non_resident = !v.is_resident() && !v.is_deleted();
            let old_size = v.size();
            v.overwrite(item, now);
            let new_size = v.size();

            if new_size >= old_size {
                table.credit(new_size - old_size);
            } else {
                table.debit(old_size - new_size);
            }
            if was_counted_non_resident {
                table.dec_non_resident();
            }

            return status;
        }

        if item.cas != 0 {
            return MutationStatus::NotFound;
        }

        let value = StoredValue::from_item(item, now);
        if !table.has_space_for(value.size()) {
            return MutationStatus::NoMem;
        }

        table.credit(value.size());
        table.item_count.fetch_add(1, Ordering::Relaxed);
        self.chain.push(value);
        MutationStatus::NotFound
    }

    /// Fail-if-exists insert.
    ///
    /// `is_restore` inserts the item clean, keeping its CAS and row id
    /// (warm-up path); `retain_value` = false stores it non-resident.
    pub(crate) fn add(
        &mut self,
        item: &Item,
        now: RelTime,
        is_restore: bool,
        retain_value: bool,
    ) -> AddStatus {
        let table = self.table;

        if let Some(v) = self.find(&item.key, true) {
            if !v.is_deleted() && !v.is_expired(now) {
                return AddStatus::Exists;
            }

            let undel = v.is_deleted();
            let was_counted_non_resident = !v.is_resident() && !v.is_deleted();
            let old_size = v.size();
            let prior_row_id = v.row_id();

            if is_restore {
                *v = StoredValue::from_restored_item(item, retain_value);
            } else {
                v.overwrite(item, now);
                if prior_row_id > 0 {
                    // A revived tombstone still owns its persisted row.
                    v.set_row_id(prior_row_id);
                }
            }

            let new_size = v.size();
            if new_size >= old_size {
                table.credit(new_size - old_size);
            } else {
                table.debit(old_size - new_size);
            }

            let counted_now = !v.is_resident() && !v.is_deleted();
            match (was_counted_non_resident, counted_now) {
                (false, true) => table.inc_non_resident(),
                (true, false) => table.dec_non_resident(),
                _ => {}
            }

            return if undel {
                AddStatus::Undel
            } else {
                AddStatus::Success
            };
        }

        let value = if is_restore {
            StoredValue::from_restored_item(item, retain_value)
        } else {
            StoredValue::from_item(item, now)
        };

        if !table.has_space_for(value.size()) {
            return AddStatus::NoMem;
        }

        table.credit(value.size());
        table.item_count.fetch_add(1, Ordering::Relaxed);
        if !value.is_resident() {
            table.inc_non_resident();
            table.stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
        }
        self.chain.push(value);
        AddStatus::Success
    }

    /// Tombstones the value, freeing its payload. The entry stays in the
    /// chain until the backing store confirms removal.
    pub(crate) fn soft_delete(&mut self, key: &[u8], now: RelTime) -> DeleteStatus {
        let table = self.table;

        let Some(v) = self.find(key, false) else {
            return DeleteStatus::NotFound;
        };

        let status = if v.is_dirty() {
            DeleteStatus::WasDirty
        } else {
            DeleteStatus::WasClean
        };

        if !v.is_resident() {
            table.dec_non_resident();
        }
        let freed = v.soft_delete(now);
        table.debit(freed);

        status
    }

    /// Physically removes the entry. Only valid once the backing store has
    /// acknowledged the row removal.
    pub(crate) fn remove(&mut self, key: &[u8]) -> bool {
        let Some(pos) = self.chain.iter().position(|v| &**v.key() == key) else {
            return false;
        };

        let value = self.chain.swap_remove(pos);
        self.table.debit(value.size());
        self.table.item_count.fetch_sub(1, Ordering::Relaxed);
        if !value.is_resident() && !value.is_deleted() {
            self.table.dec_non_resident();
        }
        true
    }

    /// Drops the value payload of `key` if it is ejectable.
    /// Returns the freed bytes.
    pub(crate) fn eject(&mut self, key: &[u8], now: RelTime) -> Option<usize> {
        let table = self.table;
        let v = self.find(key, false)?;
        let freed = v.eject_value(now)?;
        table.note_eject(freed);
        Some(freed)
    }

    /// Re-attaches a fetched value payload. Returns false if the entry
    /// vanished, was deleted, or is resident again.
    pub(crate) fn restore(&mut self, key: &[u8], value: &UserValue) -> bool {
        let table = self.table;
        let Some(v) = self.find(key, false) else {
            return false;
        };

        match v.restore_value(value) {
            Some(bytes) => {
                table.credit(bytes);
                table.dec_non_resident();
                true
            }
            None => false,
        }
    }
}
