use std::fmt;
use std::io;

use support::error::WaitError;

/// Errors surfaced by the reactor's registration and poll machinery.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "reactor io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl WaitError for Error {
    #[inline]
    fn is_wait(&self) -> bool {
        match self {
            Error::Io(err) => err.is_wait(),
        }
    }
}
