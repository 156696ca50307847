//! Shared error plumbing.
//!
//! The source treats `EAGAIN` as a routine "come back later" outcome rather than a failure, and
//! every call site that can hit it checks for it explicitly. This module generalizes that
//! check: each crate's `Error` enum implements [`WaitError`], and [`ErrorUtils`] gives callers a
//! single `.has_failed()` to use uniformly instead of re-deriving the distinction per crate.

/// Implemented by an `Error` type that has a non-fatal "would block, try again later" variant.
pub trait WaitError {
    fn is_wait(&self) -> bool;
}

/// Extension trait mirroring the source's `ErrorUtils`, generalized over any `WaitError`.
pub trait ErrorUtils {
    /// True if this result is a fatal error, i.e. not `Ok` and not the `Wait` case.
    fn has_failed(&self) -> bool;
}

impl<T, E: WaitError> ErrorUtils for Result<T, E> {
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(err) => !err.is_wait(),
        }
    }
}

impl WaitError for std::io::Error {
    #[inline]
    fn is_wait(&self) -> bool {
        self.kind() == std::io::ErrorKind::WouldBlock
    }
}
