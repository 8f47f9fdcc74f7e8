use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IpcError>;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("name conflict on '{name}': {reason}")]
    NameConflict { name: String, reason: String },

    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("payload of {len} bytes exceeds capacity of {capacity} bytes")]
    TooLarge { len: usize, capacity: usize },

    #[error("item of {len} bytes exceeds slot size of {item_size} bytes")]
    ItemTooLarge { len: usize, item_size: usize },

    #[error("'{0}' is full")]
    Full(String),

    #[error("'{0}' is empty")]
    Empty(String),

    #[error("key '{0}' not found")]
    NotFound(String),

    #[error("resource '{0}' not found")]
    ResourceNotFound(String),

    #[error("{op} is not supported in {mode} mode")]
    InvalidMode { op: &'static str, mode: &'static str },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("timed out after {0:?} waiting for the segment lock")]
    LockTimeout(Duration),

    #[error("timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    #[error("no response for '{0}'")]
    NoResponse(String),

    #[error("'{0}' has not been set up")]
    NotSetUp(String),

    #[error("'{0}' is closed")]
    Closed(String),

    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl IpcError {
    /// Steady-state conditions a caller may poll through; the resource stays usable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IpcError::Full(_)
                | IpcError::Empty(_)
                | IpcError::NotFound(_)
                | IpcError::LockTimeout(_)
                | IpcError::Timeout(_)
        )
    }

    // raw_sync reports failures as boxed errors that are neither Send nor Sync.
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> IpcError {
        IpcError::Lock(err.to_string())
    }
}

/// Maps a raw OS return code to a result.
///
/// Some calls fail with a nonzero return while `errno` still reads 0
/// ("the operation completed successfully"). That status is success.
pub(crate) fn os_result(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    normalize(io::Error::last_os_error())
}

/// Drops the benign zero-status error, passes every other error through.
pub(crate) fn normalize(err: io::Error) -> io::Result<()> {
    match err.raw_os_error() {
        Some(0) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_status_is_success() {
        assert!(normalize(io::Error::from_raw_os_error(0)).is_ok());
        assert!(os_result(0).is_ok());
    }

    #[test]
    fn real_errors_pass_through() {
        let err = normalize(io::Error::from_raw_os_error(libc::ENOENT)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn transient_classification() {
        assert!(IpcError::Full("q".into()).is_transient());
        assert!(IpcError::Empty("q".into()).is_transient());
        assert!(IpcError::LockTimeout(Duration::from_millis(5)).is_transient());
        assert!(!IpcError::NotSetUp("q".into()).is_transient());
        assert!(!IpcError::ItemTooLarge { len: 9, item_size: 8 }.is_transient());
    }
}
