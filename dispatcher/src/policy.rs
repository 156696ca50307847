/// Framing policy: how the dispatcher decides where one frame ends and the next begins.
///
/// Mirrors the source's `BUFD_LINE` / `BUFD_CHARACTER` / `BUFD_ANY`. A read callback gets a
/// `&mut Policy` alongside each delivered frame and can write through it directly (reaching back
/// into the dispatcher via `set_policy` would deadlock, since the callback already runs under the
/// dispatcher's own borrow); the scan restarts under the new policy on the very next byte (see
/// `Dispatcher::scan_frames`). `Dispatcher::set_policy` remains available for changing the policy
/// from outside a callback, e.g. once a handle has been returned to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// A frame is everything up to and including the next `\n`. `strip_eol` controls whether the
    /// trailing `\r\n`/`\n` is included in the bytes handed to the read callback.
    Line { strip_eol: bool },
    /// A frame is exactly `n` bytes, no scanning for a delimiter.
    Character(usize),
    /// The whole buffered region is one frame, delivered as soon as anything is read.
    Any,
}

impl Policy {
    pub fn line() -> Policy {
        Policy::Line { strip_eol: true }
    }
}
