use crate::stats::Stats;
use crate::time::RelTime;
use crate::value::{PartitionId, UserKey};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

/// What a dirty-queue entry asks the flusher to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueOp {
    /// Persist the current in-memory state of the key.
    Set,
    /// Remove the key's row from the backing store.
    Del,
    /// Drop every row in the backing store (`reset` marker).
    FlushAll,
}

/// One pending unit of persistence work.
#[derive(Clone, Debug)]
pub struct QueuedItem {
    /// Key the entry refers to; empty for [`QueueOp::FlushAll`].
    pub key: UserKey,

    /// Partition the key lives in.
    pub partition_id: PartitionId,

    /// Requested operation.
    pub op: QueueOp,

    /// When the entry was enqueued, in the store's relative time domain.
    pub queued_at: RelTime,
}

impl QueuedItem {
    /// Approximate bookkeeping footprint of the entry.
    #[must_use]
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len()
    }
}

/// Dual-buffer dirty queue.
///
/// Mutators append concurrently to the producer side; the flusher swaps
/// everything out at the start of a cycle and drains the swapped batch as
/// the single consumer.
#[derive(Default)]
pub(crate) struct DirtyQueue {
    towrite: Mutex<VecDeque<QueuedItem>>,
}

impl DirtyQueue {
    pub(crate) fn push(&self, item: QueuedItem, stats: &Stats) {
        stats.mem_overhead.fetch_add(item.size(), Ordering::Relaxed);
        stats.tot_enqueued.fetch_add(1, Ordering::Relaxed);

        let mut queue = self.towrite.lock().expect("lock is poisoned");
        queue.push_back(item);
        stats.queue_size.store(queue.len(), Ordering::Relaxed);
    }

    pub(crate) fn len(&self) -> usize {
        self.towrite.lock().expect("lock is poisoned").len()
    }

    /// Moves every queued entry into `writing`. Returns false if both the
    /// producer side and `writing` are empty (nothing to flush).
    pub(crate) fn begin_flush(&self, writing: &mut VecDeque<QueuedItem>, stats: &Stats) -> bool {
        let mut queue = self.towrite.lock().expect("lock is poisoned");
        if queue.is_empty() && writing.is_empty() {
            stats.dirty_age.store(0, Ordering::Relaxed);
            return false;
        }

        writing.extend(queue.drain(..));
        stats.queue_size.store(0, Ordering::Relaxed);
        stats.flusher_todo.store(writing.len(), Ordering::Relaxed);
        true
    }

    /// Copies out the producer-side entries, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<QueuedItem> {
        self.towrite
            .lock()
            .expect("lock is poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn entry(key: &[u8], op: QueueOp) -> QueuedItem {
        QueuedItem {
            key: key.to_vec().into(),
            partition_id: 0,
            op,
            queued_at: 0,
        }
    }

    #[test]
    fn begin_flush_swaps_the_buffers() {
        let stats = Stats::default();
        let queue = DirtyQueue::default();
        let mut writing = VecDeque::new();

        assert!(!queue.begin_flush(&mut writing, &stats));

        queue.push(entry(b"a", QueueOp::Set), &stats);
        queue.push(entry(b"b", QueueOp::Del), &stats);
        assert_eq!(queue.len(), 2);

        assert!(queue.begin_flush(&mut writing, &stats));
        assert_eq!(queue.len(), 0);
        assert_eq!(writing.len(), 2);
        assert_eq!(writing.front().map(|i| i.op), Some(QueueOp::Set));

        // Leftovers in `writing` still count as work
        assert!(queue.begin_flush(&mut writing, &stats));
        assert_eq!(writing.len(), 2);
    }

    #[test]
    fn order_is_preserved_across_swaps() {
        let stats = Stats::default();
        let queue = DirtyQueue::default();
        let mut writing = VecDeque::new();

        queue.push(entry(b"a", QueueOp::Set), &stats);
        queue.begin_flush(&mut writing, &stats);
        queue.push(entry(b"b", QueueOp::Set), &stats);
        queue.begin_flush(&mut writing, &stats);

        let keys: Vec<_> = writing.iter().map(|i| i.key.to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
