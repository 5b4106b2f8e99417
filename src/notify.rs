use crate::error::Error;

/// Opaque client handle, handed back through
/// [`ServerCallbacks::notify_io_complete`] when a blocked operation can be
/// retried or a background fetch has finished.
pub type Cookie = u64;

/// Seam to the protocol front-end.
///
/// The store never blocks a client thread on I/O; instead it parks the
/// cookie and pokes it here once the world has changed.
pub trait ServerCallbacks: Send + Sync {
    /// Reports the outcome of asynchronous work tied to `cookie`.
    ///
    /// `Ok(())` means "retry now / your data is ready"; an error carries
    /// the final status of the operation.
    fn notify_io_complete(&self, cookie: Cookie, status: Result<(), Error>);
}

/// Default sink that only logs notifications. Useful for embedded use
/// where nothing ever blocks.
#[derive(Default)]
pub struct NullCallbacks;

impl ServerCallbacks for NullCallbacks {
    fn notify_io_complete(&self, cookie: Cookie, status: Result<(), Error>) {
        log::trace!("notify: cookie {cookie} -> {status:?}");
    }
}
