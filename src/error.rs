use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object or mapping offset not found")]
    NotFound,

    #[error("Write access denied")]
    AccessDenied,

    #[error("Not supported by this device or object")]
    Unsupported,

    #[error("Address space or backing store exhausted")]
    ResourceExhausted,

    #[error("Device busy")]
    DeviceBusy,

    /// Unrecoverable access: destroyed, purged or otherwise permanently
    /// invalid object. Terminates the faulting access, never retried.
    #[error("Unrecoverable access fault")]
    FatalAccess,

    /// Internal signal from the multi-lock transaction: drop everything,
    /// wait on the contended reservation, restart. Never escapes
    /// `txn::run`.
    #[error("Lock transaction backed off")]
    Backoff,
}

// A convenient alias
pub type MapResult<T> = Result<T, MapError>;
