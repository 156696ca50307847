use std::fmt;
use std::io;

use support::error::WaitError;

/// Errors surfaced by wire (de)serialization and by a request's lifecycle.
#[derive(Debug)]
pub enum Error {
    /// A reply packet is shorter than a DNS header.
    Truncated,
    /// A reply's structure doesn't parse as a valid DNS message (bad label pointer, length past
    /// the end of the packet, short RR header, ...).
    BadFormat,
    /// A reply's transaction ID doesn't match any outstanding request.
    IdMismatch,
    /// A reply's question section doesn't match what was sent for its transaction ID — treated as
    /// a spoofing attempt, not merely a malformed reply, so it's kept distinct from `BadFormat`.
    QuestionMismatch,
    /// The reply's `RCODE` was nonzero.
    Rcode(u8),
    /// Every configured nameserver is presently marked dead.
    NameserverExhausted,
    /// A request exhausted its retransmit budget with no reply.
    MaxRetransmits,
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "dns reply truncated"),
            Error::BadFormat => write!(f, "dns reply malformed"),
            Error::IdMismatch => write!(f, "dns reply transaction id does not match any pending request"),
            Error::QuestionMismatch => write!(f, "dns reply question section does not match the request"),
            Error::Rcode(code) => write!(f, "dns server returned rcode {}", code),
            Error::NameserverExhausted => write!(f, "no live nameserver available"),
            Error::MaxRetransmits => write!(f, "exceeded maximum number of retransmits"),
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
        Error::Io(err)
    }
}

impl From<reactor::Error> for Error {
    fn from(err: reactor::Error) -> Self {
        match err {
            reactor::Error::Io(io_err) => Error::Io(io_err),
        }
    }
}

impl WaitError for Error {
    fn is_wait(&self) -> bool {
        matches!(self, Error::Io(err) if err.is_wait())
    }
}
