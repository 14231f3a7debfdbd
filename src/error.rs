//! Error types and handling for ringsock operations.
//!
//! This module provides a single error type covering every failure mode in
//! the crate, from socket syscalls to mirror-mapping setup, with proper
//! error chaining for diagnostics.

use static_assertions;
use thiserror::Error;

/// Result type alias for ringsock operations.
///
/// This type alias simplifies function signatures throughout the crate by
/// providing a consistent error type while allowing different success types.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ringsock operations.
///
/// Each variant carries enough detail for diagnostics: POSIX failures keep
/// the errno-derived [`std::io::Error`], resolution failures keep the
/// `getaddrinfo` code, and mirror-mapping failures name the step that
/// failed.
///
/// # Design Notes
///
/// - Uses `thiserror` for automatic `Error` trait implementation
/// - Provides automatic conversion from [`std::io::Error`] via `#[from]`
/// - All variants are `Send + Sync` for use across queue threads
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying POSIX call failed.
    ///
    /// Wraps the errno-derived I/O error from a socket or descriptor
    /// syscall.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host name resolution failed.
    ///
    /// Carries the raw `getaddrinfo` result code together with the
    /// resolver's description of it.
    #[error("address resolution failed: {detail} (gai error {code})")]
    AddressResolution {
        /// The non-zero `getaddrinfo` return code.
        code: i32,
        /// The resolver's message for the code.
        detail: String,
    },

    /// Building the mirrored buffer mapping failed.
    ///
    /// The mirror is assembled in several kernel steps (backing object
    /// creation, reservation, the two fixed mappings); `op` names the step
    /// that failed so the condition can be told apart in the field.
    #[error("memory remap failed during {op}: {source}")]
    Remap {
        /// The mapping step that failed.
        op: &'static str,
        /// The kernel's error for that step.
        source: std::io::Error,
    },

    /// The requested transport protocol is not one the crate speaks.
    ///
    /// Only TCP and UDP are accepted; any other protocol number is
    /// rejected at the API boundary.
    #[error("protocol not supported")]
    ProtocolNotSupported,

    /// Buffered bytes are not valid UTF-8.
    ///
    /// Returned by the string-producing readers (`read_line`,
    /// `read_token`, `peek`) when the bytes they would hand back do not
    /// decode.
    #[error("buffered data is not valid UTF-8")]
    NotUtf8,

    /// The outbound buffer cannot take the write.
    ///
    /// The buffer is non-empty and too full to grow, so the caller must
    /// apply backpressure and retry once the connection has drained. This
    /// is the only recoverable runtime error.
    #[error("write buffer is full")]
    WriteBufferFull,

    /// The listener could not be brought up.
    ///
    /// Wraps the bind/listen/setup failure that stopped `start()`.
    #[error("could not start listener: {0}")]
    ListenerStart(#[source] Box<Error>),

    /// A dial did not complete within its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed or reset the connection.
    ///
    /// Also covers an orderly zero-byte read from the kernel, which the
    /// socket layer surfaces as this condition rather than a short read.
    #[error("connection reset by peer")]
    ConnectionReset,
}

impl Error {
    /// Build a [`Error::Remap`] from the current OS error.
    pub(crate) fn remap(op: &'static str) -> Self {
        Error::Remap {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Whether the error is the recoverable backpressure condition.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::WriteBufferFull)
    }
}

// Errors cross queue-thread boundaries inside delegate callbacks.
static_assertions::assert_impl_all!(Error: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;
    use std::io::{Error as IoError, ErrorKind};

    /// Test error message formatting for all variants
    mod error_messages {
        use super::*;

        #[test]
        fn protocol_not_supported() {
            let error = Error::ProtocolNotSupported;
            assert_eq!(error.to_string(), "protocol not supported");
        }

        #[test]
        fn not_utf8() {
            let error = Error::NotUtf8;
            assert_eq!(error.to_string(), "buffered data is not valid UTF-8");
        }

        #[test]
        fn write_buffer_full() {
            let error = Error::WriteBufferFull;
            assert_eq!(error.to_string(), "write buffer is full");
        }

        #[test]
        fn timed_out() {
            let error = Error::TimedOut;
            assert_eq!(error.to_string(), "operation timed out");
        }

        #[test]
        fn connection_reset() {
            let error = Error::ConnectionReset;
            assert_eq!(error.to_string(), "connection reset by peer");
        }

        #[test]
        fn address_resolution() {
            let error = Error::AddressResolution {
                code: -2,
                detail: "Name or service not known".to_string(),
            };
            assert!(error.to_string().contains("Name or service not known"));
            assert!(error.to_string().contains("-2"));
        }

        #[test]
        fn remap_names_failing_step() {
            let error = Error::Remap {
                op: "memfd_create",
                source: IoError::new(ErrorKind::PermissionDenied, "denied"),
            };
            assert!(error.to_string().contains("memfd_create"));
            assert!(error.to_string().contains("denied"));
        }

        #[test]
        fn listener_start_carries_cause() {
            let cause = Error::Io(IoError::new(ErrorKind::AddrInUse, "in use"));
            let error = Error::ListenerStart(Box::new(cause));
            assert!(error.to_string().contains("could not start listener"));
            assert!(error.to_string().contains("in use"));
        }
    }

    /// Test error conversion and chaining
    mod error_conversion {
        use super::*;

        #[test]
        fn io_error_conversion() {
            let io_error = IoError::new(ErrorKind::PermissionDenied, "Access denied");
            let error = Error::from(io_error);

            let Error::Io(ref e) = error else {
                panic!("Expected Io error variant");
            };

            assert_eq!(e.kind(), ErrorKind::PermissionDenied);
            assert!(error.to_string().contains("Access denied"));
        }

        #[test]
        fn listener_start_preserves_source() {
            let cause = Error::Io(IoError::new(ErrorKind::AddrInUse, "in use"));
            let error = Error::ListenerStart(Box::new(cause));

            let source = error.source().expect("cause should be chained");
            assert!(source.to_string().contains("in use"));
        }

        #[test]
        fn remap_preserves_source() {
            let error = Error::Remap {
                op: "ftruncate",
                source: IoError::new(ErrorKind::OutOfMemory, "no space"),
            };

            let source = error.source().expect("kernel error should be chained");
            let io_err = source.downcast_ref::<IoError>().unwrap();
            assert_eq!(io_err.kind(), ErrorKind::OutOfMemory);
        }
    }

    /// Test error trait implementations and helpers
    mod error_traits {
        use super::*;

        #[test]
        fn implements_error_trait() {
            let error = Error::WriteBufferFull;
            let _: &dyn StdError = &error;
            assert!(error.source().is_none());
        }

        #[test]
        fn backpressure_query() {
            assert!(Error::WriteBufferFull.is_backpressure());
            assert!(!Error::TimedOut.is_backpressure());
            assert!(!Error::ConnectionReset.is_backpressure());
        }

        #[test]
        fn debug_formatting() {
            let error = Error::Remap {
                op: "mmap",
                source: IoError::other("boom"),
            };
            let debug_str = format!("{:?}", error);
            assert!(debug_str.contains("Remap"));
            assert!(debug_str.contains("mmap"));
        }
    }

    /// Test the Result type alias
    mod result_alias {
        use super::*;

        #[test]
        fn success_case() {
            fn returns_success() -> Result<i32> {
                Ok(42)
            }

            assert_eq!(returns_success().unwrap(), 42);
        }

        #[test]
        fn error_case() {
            fn returns_error() -> Result<i32> {
                Err(Error::WriteBufferFull)
            }

            match returns_error() {
                Err(Error::WriteBufferFull) => {}
                _ => panic!("Expected WriteBufferFull error"),
            }
        }
    }
}
