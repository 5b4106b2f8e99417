/// Non-success outcomes of store operations.
///
/// Everything here is a *client-visible* condition. Transient backing-store
/// failures are recovered internally by the flusher (redirty + requeue) and
/// never show up in this enum.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The partition does not exist, is dead, or has the wrong role for the
    /// requested operation.
    NotMyPartition,

    /// The operation cannot complete right now.
    ///
    /// Either the partition is pending and the cookie has been parked, or
    /// the value is non-resident and a background fetch has been queued.
    /// The client will be notified through
    /// [`ServerCallbacks`](crate::ServerCallbacks) when it should retry.
    WouldBlock,

    /// The key is absent, expired, or tombstoned.
    NotFound,

    /// CAS mismatch, or `add` on an existing key.
    Exists,

    /// The mutation was refused (e.g. a CAS token supplied to `add`).
    NotStored,

    /// The hash table refused the insert because the memory budget is
    /// exhausted. Evicting some values may help.
    NoMemory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EbbError: {self:?}")
    }
}

impl std::error::Error for Error {}

/// Result helper type
pub type Result<T> = std::result::Result<T, Error>;
