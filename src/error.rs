use std::io;
use thiserror::Error;

/// Errors raised by reactor lifecycle and scheduling operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReactorError {
    /// A loop was started on a reactor that already has one.
    #[error("reactor is already running")]
    AlreadyRunning,
    /// A scheduling or query operation found no active loop.
    #[error("reactor is not running")]
    NotRunning,
}

/// Closed set of failures a connection can terminate with.
///
/// Raw OS errors are folded into this taxonomy before they reach user
/// callbacks; anything without a dedicated variant surfaces as [`Other`].
///
/// [`Other`]: ConnectionError::Other
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("host not found")]
    HostNotFound,
    #[error("connection refused")]
    Refused,
    #[error("permission denied")]
    Permission,
    #[error("operation timed out")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("connection reset by peer")]
    Reset,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("connection error: {0}")]
    Other(String),
}

/// Umbrella error for operations that can fail on either level,
/// e.g. `listen` raising bind failures synchronously.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ConnectionError::HostNotFound,
            io::ErrorKind::AddrNotAvailable => ConnectionError::HostNotFound,
            io::ErrorKind::ConnectionRefused => ConnectionError::Refused,
            io::ErrorKind::PermissionDenied => ConnectionError::Permission,
            io::ErrorKind::TimedOut => ConnectionError::Timeout,
            io::ErrorKind::UnexpectedEof => ConnectionError::Closed,
            io::ErrorKind::ConnectionReset => ConnectionError::Reset,
            io::ErrorKind::ConnectionAborted => ConnectionError::Reset,
            io::ErrorKind::BrokenPipe => ConnectionError::BrokenPipe,
            _ => ConnectionError::Other(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionError;
    use std::io;

    #[test]
    fn io_kinds_translate_to_the_closed_set() {
        let cases = [
            (io::ErrorKind::NotFound, ConnectionError::HostNotFound),
            (io::ErrorKind::AddrNotAvailable, ConnectionError::HostNotFound),
            (io::ErrorKind::ConnectionRefused, ConnectionError::Refused),
            (io::ErrorKind::PermissionDenied, ConnectionError::Permission),
            (io::ErrorKind::TimedOut, ConnectionError::Timeout),
            (io::ErrorKind::UnexpectedEof, ConnectionError::Closed),
            (io::ErrorKind::ConnectionReset, ConnectionError::Reset),
            (io::ErrorKind::ConnectionAborted, ConnectionError::Reset),
            (io::ErrorKind::BrokenPipe, ConnectionError::BrokenPipe),
        ];

        for (kind, expected) in cases {
            assert_eq!(ConnectionError::from(io::Error::from(kind)), expected);
        }
    }

    #[test]
    fn unmapped_kinds_fall_back_to_the_catch_all() {
        let err = io::Error::new(io::ErrorKind::Other, "something odd");
        assert!(matches!(ConnectionError::from(err), ConnectionError::Other(_)));
    }
}
