use crate::dispatcher::{Dispatcher, DispatcherCallback, TaskId};
use crate::kvstore::GetResult;
use crate::notify::Cookie;
use crate::store::Store;
use crate::value::{PartitionId, RowId, UserKey};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Disk load for a `get` that found a non-resident value.
///
/// Reads the row, rehydrates the hash table if the world has not moved
/// on, and notifies the waiting client cookie either way.
pub(crate) struct ValueFetchTask {
    pub(crate) store: Store,
    pub(crate) key: UserKey,
    pub(crate) partition_id: PartitionId,
    pub(crate) row_id: RowId,
    pub(crate) cookie: Cookie,
}

impl DispatcherCallback for ValueFetchTask {
    fn run(&mut self, _: &Dispatcher, _: TaskId) -> Option<Duration> {
        self.store
            .complete_bg_fetch(&self.key, self.partition_id, self.row_id, self.cookie);
        None
    }

    fn describe(&self) -> String {
        format!("Fetching item from disk: {:?}", self.key)
    }
}

/// Disk load whose result goes to a client-supplied callback instead of
/// the hash table (per-key stat lookups).
pub(crate) struct VKeyFetchTask {
    pub(crate) store: Store,
    pub(crate) key: UserKey,
    pub(crate) row_id: RowId,
    pub(crate) callback: Option<Box<dyn FnOnce(GetResult) + Send>>,
}

impl DispatcherCallback for VKeyFetchTask {
    fn run(&mut self, _: &Dispatcher, _: TaskId) -> Option<Duration> {
        self.store
            .stats()
            .bg_fetch_queue
            .fetch_sub(1, Ordering::Relaxed);

        let result = self.store.kvstore.get(&self.key, self.row_id);
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
        None
    }

    fn describe(&self) -> String {
        format!("Fetching item from disk for vkey stat: {:?}", self.key)
    }
}
