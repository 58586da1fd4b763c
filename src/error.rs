use std::cell::{Cell, RefCell};
use std::io;
use thiserror::Error;
use tracing::error;

/// Numeric code of [`RpmaError::Unknown`]
pub const E_UNKNOWN: i32 = -100_000;
/// Numeric code of [`RpmaError::NoSupp`]
pub const E_NOSUPP: i32 = -100_001;
/// Numeric code of [`RpmaError::Provider`]
pub const E_PROVIDER: i32 = -100_002;
/// Numeric code of [`RpmaError::NoMem`]
pub const E_NOMEM: i32 = -100_003;
/// Numeric code of [`RpmaError::Invalid`]
pub const E_INVAL: i32 = -100_004;

/// Ceiling of the thread-local error message buffer
const ERROR_MSG_CAP: usize = 256;

thread_local! {
    /// Errno of the last provider failure observed on this thread
    static PROVIDER_ERROR: Cell<i32> = Cell::new(0);
    /// Message describing the last failure observed on this thread,
    /// lazily allocated on the first failing call
    static ERROR_MSG: RefCell<String> = RefCell::new(String::new());
}

/// Error returned by every fallible entry point of this crate
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpmaError {
    /// The provider failed without setting an error value
    #[error("provider failed without setting an error value")]
    Unknown,
    /// The operation is not supported by this provider or build
    #[error("operation not supported")]
    NoSupp,
    /// Provider-level failure, the underlying errno is attached and also
    /// available through [`err_get_provider_error`]
    #[error("provider error: {errno}")]
    Provider {
        /// The errno reported by the provider
        errno: i32,
    },
    /// Allocation failure
    #[error("out of memory")]
    NoMem,
    /// An argument violates the operation's preconditions
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl RpmaError {
    /// Get the numeric error code of this error
    #[inline]
    #[must_use]
    pub fn code(&self) -> i32 {
        match *self {
            Self::Unknown => E_UNKNOWN,
            Self::NoSupp => E_NOSUPP,
            Self::Provider { .. } => E_PROVIDER,
            Self::NoMem => E_NOMEM,
            Self::Invalid(_) => E_INVAL,
        }
    }
}

/// Crate-level result type
pub type Result<T> = std::result::Result<T, RpmaError>;

/// Return the errno captured by the last provider failure on the calling
/// thread. Meaningful only immediately after a call returned
/// [`RpmaError::Provider`] on the same thread.
#[inline]
#[must_use]
pub fn err_get_provider_error() -> i32 {
    PROVIDER_ERROR.with(Cell::get)
}

/// Return the last error message recorded on the calling thread. The buffer
/// is never cleared by successful calls; its content is significant only
/// immediately after a failing call on the same thread.
#[inline]
#[must_use]
pub fn err_get_msg() -> String {
    ERROR_MSG.with(|msg| msg.borrow().clone())
}

/// Store `msg` into the thread-local message buffer, bounded by
/// `ERROR_MSG_CAP` bytes
pub(crate) fn record_msg(mut msg: String) {
    if msg.len() > ERROR_MSG_CAP {
        let mut end = ERROR_MSG_CAP;
        while !msg.is_char_boundary(end) {
            end = end.wrapping_sub(1);
        }
        msg.truncate(end);
    }
    ERROR_MSG.with(|buf| *buf.borrow_mut() = msg);
}

/// Record a provider failure with an arbitrary error value (an errno or a
/// connection-manager event code) and an already formatted message
pub(crate) fn record_provider_failure(value: i32, msg: String) -> RpmaError {
    error!("{}", msg);
    PROVIDER_ERROR.with(|cell| cell.set(value));
    record_msg(msg);
    RpmaError::Provider { errno: value }
}

/// Record a provider failure with an explicit errno and return the
/// corresponding error. Used for verbs calls that report errno through
/// their return value.
pub(crate) fn provider_error(op: &str, errno: i32) -> RpmaError {
    let err = io::Error::from_raw_os_error(errno);
    record_provider_failure(errno, format!("{}: {}", op, err))
}

/// Record a provider failure from the calling thread's errno and return the
/// corresponding error. Used for calls that report failure through a
/// sentinel return value and `errno`.
pub(crate) fn last_provider_error(op: &str) -> RpmaError {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    provider_error(op, errno)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(RpmaError::Unknown.code(), -100_000);
        assert_eq!(RpmaError::NoSupp.code(), -100_001);
        assert_eq!(RpmaError::Provider { errno: libc::EAGAIN }.code(), -100_002);
        assert_eq!(RpmaError::NoMem.code(), -100_003);
        assert_eq!(RpmaError::Invalid("x").code(), -100_004);
    }

    #[test]
    fn provider_errno_captured() {
        let err = provider_error("ibv_destroy_cq", libc::EAGAIN);
        assert_eq!(err, RpmaError::Provider { errno: libc::EAGAIN });
        assert_eq!(err_get_provider_error(), libc::EAGAIN);
        assert!(err_get_msg().starts_with("ibv_destroy_cq: "));
    }

    #[test]
    fn msg_is_thread_local() {
        let _ = provider_error("rdma_listen", libc::EIO);
        assert!(!err_get_msg().is_empty());
        let handle = std::thread::spawn(|| {
            assert_eq!(err_get_provider_error(), 0);
            assert!(err_get_msg().is_empty());
            let _ = provider_error("rdma_connect", libc::ECONNREFUSED);
            assert_eq!(err_get_provider_error(), libc::ECONNREFUSED);
        });
        handle.join().unwrap();
        // the other thread's failure did not clobber ours
        assert_eq!(err_get_provider_error(), libc::EIO);
        assert!(err_get_msg().starts_with("rdma_listen: "));
    }

    #[test]
    fn msg_is_bounded() {
        let long = "x".repeat(4 * ERROR_MSG_CAP);
        record_msg(long);
        assert_eq!(err_get_msg().len(), ERROR_MSG_CAP);
    }
}
