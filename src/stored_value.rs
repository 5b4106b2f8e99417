use crate::time::RelTime;
use crate::value::{next_cas, Cas, Item, PartitionId, RowId, UserKey, UserValue, UNASSIGNED_ROW_ID};

/// In-memory record for a single key.
///
/// Exclusively owned by its hash table bucket; every access goes through
/// the bucket mutex. The value payload may be absent: either the item was
/// ejected to save memory (non-resident) or it is a tombstone awaiting
/// persisted removal.
pub struct StoredValue {
    key: UserKey,
    value: Option<UserValue>,
    flags: u32,
    exptime: RelTime,
    cas: Cas,
    row_id: RowId,

    /// True while a persist is in flight that will assign a row id
    pending_id: bool,

    /// True if memory state differs from the last successfully persisted
    /// state
    dirty: bool,

    /// When the most recent clean-to-dirty transition happened
    dirtied_at: RelTime,

    /// Tombstone marker; the entry stays addressable until the backing
    /// store confirms removal
    deleted: bool,

    /// While in the future, the item is exclusive to its lock holder;
    /// `0` means unlocked
    locked_until: RelTime,
}

impl std::fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}{}{}",
            self.key,
            self.cas,
            if self.dirty { "D" } else { "C" },
            if self.deleted { "T" } else { "" },
            if self.is_resident() { "" } else { "!" },
        )
    }
}

impl StoredValue {
    /// Creates a dirty, resident value from a request item.
    pub(crate) fn from_item(item: &Item, now: RelTime) -> Self {
        Self {
            key: item.key.clone(),
            value: Some(item.value.clone()),
            flags: item.flags,
            exptime: item.exptime,
            cas: next_cas(),
            row_id: item.row_id,
            pending_id: false,
            dirty: true,
            dirtied_at: now,
            deleted: false,
            locked_until: 0,
        }
    }

    /// Creates a clean value as loaded from the backing store.
    ///
    /// Keeps the item's CAS and row id; `retain_value` = false inserts the
    /// record as non-resident right away.
    pub(crate) fn from_restored_item(item: &Item, retain_value: bool) -> Self {
        Self {
            key: item.key.clone(),
            value: retain_value.then(|| item.value.clone()),
            flags: item.flags,
            exptime: item.exptime,
            cas: if item.cas == 0 { next_cas() } else { item.cas },
            row_id: item.row_id,
            pending_id: false,
            dirty: false,
            dirtied_at: 0,
            deleted: false,
            locked_until: 0,
        }
    }

    #[must_use]
    pub fn key(&self) -> &UserKey {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> Option<&UserValue> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[must_use]
    pub fn exptime(&self) -> RelTime {
        self.exptime
    }

    #[must_use]
    pub fn cas(&self) -> Cas {
        self.cas
    }

    #[must_use]
    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether the value payload is held in memory.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    #[must_use]
    pub fn is_pending_id(&self) -> bool {
        self.pending_id
    }

    /// When the value last went dirty.
    #[must_use]
    pub fn dirtied_at(&self) -> RelTime {
        self.dirtied_at
    }

    #[must_use]
    pub fn is_expired(&self, now: RelTime) -> bool {
        self.exptime != 0 && now >= self.exptime
    }

    #[must_use]
    pub fn is_locked(&self, now: RelTime) -> bool {
        self.locked_until > now
    }

    /// Grants an exclusive lease until `until`.
    pub(crate) fn lock(&mut self, until: RelTime) {
        self.locked_until = until;
    }

    pub(crate) fn unlock(&mut self) {
        self.locked_until = 0;
    }

    pub(crate) fn set_cas(&mut self, cas: Cas) {
        self.cas = cas;
    }

    pub(crate) fn set_row_id(&mut self, row_id: RowId) {
        self.row_id = row_id;
        self.pending_id = false;
    }

    /// Forgets the persisted row identity; the next flush treats the value
    /// as an insert again.
    pub(crate) fn clear_row_id(&mut self) {
        self.row_id = UNASSIGNED_ROW_ID;
        self.pending_id = false;
    }

    pub(crate) fn set_pending_id(&mut self) {
        self.pending_id = true;
    }

    /// Marks the value clean, returning the timestamp of the dirty
    /// transition so a failed persist can restore it via [`Self::re_dirty`].
    pub(crate) fn mark_clean(&mut self) -> RelTime {
        self.dirty = false;
        self.dirtied_at
    }

    pub(crate) fn mark_dirty(&mut self, now: RelTime) {
        self.dirty = true;
        self.dirtied_at = now;
    }

    /// Restores dirty state after a deferred or failed persist, keeping the
    /// original dirty timestamp so age checks stay truthful.
    pub(crate) fn re_dirty(&mut self, dirtied_at: RelTime) {
        self.dirty = true;
        self.dirtied_at = dirtied_at;
        self.pending_id = false;
    }

    /// Replaces value and metadata from a request item, stamping a fresh
    /// CAS. The row identity is kept; a persisted row is updated in place.
    pub(crate) fn overwrite(&mut self, item: &Item, now: RelTime) {
        self.value = Some(item.value.clone());
        self.flags = item.flags;
        self.exptime = item.exptime;
        self.cas = next_cas();
        self.deleted = false;
        self.mark_dirty(now);
    }

    /// Turns the entry into a tombstone, freeing the value payload.
    /// Returns the number of value bytes released.
    pub(crate) fn soft_delete(&mut self, now: RelTime) -> usize {
        let freed = self.value.as_ref().map_or(0, |v| v.len());
        self.value = None;
        self.deleted = true;
        self.mark_dirty(now);
        freed
    }

    /// Drops the value payload of a clean, resident, unlocked entry.
    ///
    /// Values at or below the bookkeeping size are not worth ejecting.
    /// Returns the freed bytes, or `None` if the entry is not ejectable.
    pub(crate) fn eject_value(&mut self, now: RelTime) -> Option<usize> {
        if self.dirty || self.deleted || self.is_locked(now) {
            return None;
        }

        let len = self.value.as_ref()?.len();
        if len <= std::mem::size_of::<Self>() {
            return None;
        }

        self.value = None;
        Some(len)
    }

    /// Re-attaches a value payload fetched from the backing store.
    ///
    /// Only a non-resident, non-deleted entry accepts it. Returns the
    /// number of bytes now resident.
    pub(crate) fn restore_value(&mut self, value: &UserValue) -> Option<usize> {
        if self.is_resident() || self.deleted {
            return None;
        }

        self.value = Some(value.clone());
        Some(value.len())
    }

    /// Copies the record out as an [`Item`] for a client or the flusher.
    ///
    /// # Panics
    ///
    /// Panics if the value is not resident.
    pub(crate) fn to_item(&self, partition_id: PartitionId) -> Item {
        Item {
            key: self.key.clone(),
            value: self
                .value
                .clone()
                .expect("cannot snapshot a non-resident value"),
            flags: self.flags,
            exptime: self.exptime,
            cas: self.cas,
            row_id: self.row_id,
            partition_id,
        }
    }

    /// Approximate in-memory footprint of the record.
    #[must_use]
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }
}
