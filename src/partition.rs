use crate::error::Error;
use crate::hash_table::HashTable;
use crate::notify::{Cookie, ServerCallbacks};
use crate::stats::Stats;
use crate::value::PartitionId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Cookies parked per pending partition are capped; beyond this the
/// operation still reports `WouldBlock` but the cookie is not recorded.
const MAX_PENDING_OPS: usize = 1024;

/// Role and lifecycle state of a partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionState {
    /// Owns its share of the keyspace; serves reads and writes.
    Active,
    /// Receives replicated writes only (`force = true`).
    Replica,
    /// In transfer; operations park their cookie until the state settles.
    Pending,
    /// Not serving; a dead partition is eligible for deletion.
    Dead,
}

impl PartitionState {
    /// Tag used when persisting the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Replica => "replica",
            Self::Pending => "pending",
            Self::Dead => "dead",
        }
    }

    /// Parses a persisted tag; unknown tags map to `Dead`, matching how a
    /// store treats a partition it cannot make sense of.
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag {
            "active" => Self::Active,
            "replica" => Self::Replica,
            "pending" => Self::Pending,
            _ => Self::Dead,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::Replica,
            2 => Self::Pending,
            _ => Self::Dead,
        }
    }
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numbered shard of the keyspace.
///
/// Reference-counted: background tasks may hold a partition beyond its
/// removal from the table and must re-validate its state afterwards.
pub(crate) struct Partition {
    id: PartitionId,
    state: AtomicU8,
    pub(crate) hash_table: HashTable,
    pending_ops: Mutex<Vec<Cookie>>,
}

pub(crate) type PartitionRef = Arc<Partition>;

impl Partition {
    pub(crate) fn new(
        id: PartitionId,
        state: PartitionState,
        n_buckets: usize,
        max_memory: usize,
        stats: Arc<Stats>,
    ) -> PartitionRef {
        Arc::new(Self {
            id,
            state: AtomicU8::new(state as u8),
            hash_table: HashTable::new(n_buckets, max_memory, stats),
            pending_ops: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn id(&self) -> PartitionId {
        self.id
    }

    pub(crate) fn state(&self) -> PartitionState {
        PartitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PartitionState) {
        log::debug!("partition {}: state -> {state}", self.id);
        self.state.store(state as u8, Ordering::Release);
    }

    /// Parks a cookie until the partition leaves `Pending`.
    ///
    /// Deduplicates by cookie identity and refuses to grow past
    /// [`MAX_PENDING_OPS`]; either way the caller reports `WouldBlock`.
    pub(crate) fn add_pending_op(&self, cookie: Cookie, stats: &Stats) {
        let mut ops = self.pending_ops.lock().expect("lock is poisoned");

        if ops.contains(&cookie) {
            return;
        }
        if ops.len() >= MAX_PENDING_OPS {
            log::warn!(
                "partition {}: pending-op list full, not parking cookie {cookie}",
                self.id
            );
            return;
        }

        ops.push(cookie);
        stats.pending_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Notifies and unparks every cookie waiting on this partition.
    ///
    /// Cookies learn `Ok` when the partition went active and should retry;
    /// any other state resolves them with `NotMyPartition`.
    pub(crate) fn fire_all_ops(&self, callbacks: &dyn ServerCallbacks) {
        let cookies: Vec<Cookie> = {
            let mut ops = self.pending_ops.lock().expect("lock is poisoned");
            ops.drain(..).collect()
        };

        if cookies.is_empty() {
            return;
        }

        let status = if self.state() == PartitionState::Active {
            Ok(())
        } else {
            Err(Error::NotMyPartition)
        };

        log::debug!(
            "partition {}: firing {} pending ops ({status:?})",
            self.id,
            cookies.len()
        );

        for cookie in cookies {
            callbacks.notify_io_complete(cookie, status);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_op_count(&self) -> usize {
        self.pending_ops.lock().expect("lock is poisoned").len()
    }
}

/// Mapping from partition id to partition, plus the set of ids whose
/// backing-store deletion has not been acknowledged yet.
#[derive(Default)]
pub(crate) struct PartitionTable {
    partitions: RwLock<HashMap<PartitionId, PartitionRef>>,
    pending_deletion: Mutex<HashSet<PartitionId>>,
}

impl PartitionTable {
    pub(crate) fn get(&self, id: PartitionId) -> Option<PartitionRef> {
        self.partitions
            .read()
            .expect("lock is poisoned")
            .get(&id)
            .cloned()
    }

    pub(crate) fn insert(&self, partition: PartitionRef) {
        self.partitions
            .write()
            .expect("lock is poisoned")
            .insert(partition.id(), partition);
    }

    /// Detaches the partition from the table; background holders keep it
    /// alive until they notice.
    pub(crate) fn remove(&self, id: PartitionId) -> Option<PartitionRef> {
        self.partitions
            .write()
            .expect("lock is poisoned")
            .remove(&id)
    }

    pub(crate) fn ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self
            .partitions
            .read()
            .expect("lock is poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn set_pending_deletion(&self, id: PartitionId, pending: bool) {
        let mut set = self.pending_deletion.lock().expect("lock is poisoned");
        if pending {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    pub(crate) fn is_pending_deletion(&self, id: PartitionId) -> bool {
        self.pending_deletion
            .lock()
            .expect("lock is poisoned")
            .contains(&id)
    }
}
