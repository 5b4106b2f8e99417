use crate::time::RelTime;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// User defined key
pub type UserKey = Arc<[u8]>;

/// User defined data (blob of bytes)
pub type UserValue = Arc<[u8]>;

/// Partition identifier
pub type PartitionId = u16;

/// Compare-and-swap token, a monotonically increasing counter
///
/// Every accepted mutation stamps the stored value with a fresh token.
/// `0` means "unset" in a request (no CAS check requested).
pub type Cas = u64;

/// CAS value returned for items that are currently locked, so clients
/// cannot forge a CAS without going through `get_locked`
pub const LOCKED_CAS: Cas = Cas::MAX;

/// Row identity in the backing store
pub type RowId = i64;

/// Row id of an item that has never been persisted
pub const UNASSIGNED_ROW_ID: RowId = -1;

static CAS_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Produces the next CAS token.
pub(crate) fn next_cas() -> Cas {
    CAS_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A key-value pair plus its user metadata, as it crosses the store
/// boundary.
///
/// This is what clients hand to `set`/`add`, what `get` returns, and what
/// the flusher snapshots for the backing store.
#[derive(Clone, PartialEq, Eq)]
pub struct Item {
    /// User-defined key - an arbitrary, non-empty byte array
    pub key: UserKey,

    /// User-defined value - an arbitrary byte array
    pub value: UserValue,

    /// Opaque user flags
    pub flags: u32,

    /// Absolute expiry time in the store's relative time domain;
    /// `0` means "never expires"
    pub exptime: RelTime,

    /// CAS token; `0` in a request means "no CAS check"
    pub cas: Cas,

    /// Identity of the persisted row, [`UNASSIGNED_ROW_ID`] before the
    /// first persist
    pub row_id: RowId,

    /// Partition this item belongs to
    pub partition_id: PartitionId,
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}@{}:{} => {} B",
            self.key,
            self.partition_id,
            self.cas,
            self.value.len()
        )
    }
}

impl Item {
    /// Creates a new [`Item`] without a CAS token or row identity.
    ///
    /// # Panics
    ///
    /// Panics if the key is empty or longer than 2^16 bytes.
    pub fn new<K: Into<UserKey>, V: Into<UserValue>>(
        key: K,
        value: V,
        flags: u32,
        exptime: RelTime,
        partition_id: PartitionId,
    ) -> Self {
        let k = key.into();
        let v = value.into();

        assert!(!k.is_empty());
        assert!(k.len() <= u16::MAX.into());

        Self {
            key: k,
            value: v,
            flags,
            exptime,
            cas: 0,
            row_id: UNASSIGNED_ROW_ID,
            partition_id,
        }
    }

    /// Sets the CAS token the mutation must match.
    #[must_use]
    pub fn with_cas(mut self, cas: Cas) -> Self {
        self.cas = cas;
        self
    }

    /// Approximate in-memory footprint.
    #[doc(hidden)]
    #[must_use]
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn cas_tokens_are_monotonic() {
        let a = next_cas();
        let b = next_cas();
        let c = next_cas();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn item_starts_unpersisted() {
        let item = Item::new(b"abc".to_vec(), b"xyz".to_vec(), 0, 0, 0);
        assert_eq!(item.cas, 0);
        assert_eq!(item.row_id, UNASSIGNED_ROW_ID);
        assert!(item.size() >= 6);
    }

    #[test]
    #[should_panic]
    fn empty_key_is_refused() {
        let _ = Item::new(vec![], b"xyz".to_vec(), 0, 0, 0);
    }
}
