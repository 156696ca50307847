use std::fmt;
use std::io;

use support::error::WaitError;

/// Errors surfaced to a dispatcher's error callback, or returned from its own methods.
///
/// The source represents these as a `(kind, errno)` pair passed to `err_cb`; here they're a
/// closed enum so a caller pattern-matches instead of re-deriving which errno values are which
/// condition.
#[derive(Debug)]
pub enum Error {
    /// Peer closed its end (`read()` returned 0).
    Eof,
    /// The idle-read timeout armed at registration time elapsed with no activity.
    TimedOut,
    /// Peer reset the connection (`ECONNRESET`).
    ConnReset,
    /// A single frame would exceed the buffer's configured maximum size.
    TooBig,
    /// Anything else `read`/`write`/`sendfile` can fail with.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Eof => write!(f, "peer closed the connection"),
            Error::TimedOut => write!(f, "idle timeout elapsed"),
            Error::ConnReset => write!(f, "connection reset by peer"),
            Error::TooBig => write!(f, "frame exceeds maximum buffer size"),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset => Error::ConnReset,
            io::ErrorKind::UnexpectedEof => Error::Eof,
            _ => Error::Io(err),
        }
    }
}

impl From<reactor::Error> for Error {
    fn from(err: reactor::Error) -> Self {
        match err {
            reactor::Error::Io(io_err) => io_err.into(),
        }
    }
}

impl WaitError for Error {
    fn is_wait(&self) -> bool {
        matches!(self, Error::Io(err) if err.is_wait())
    }
}
