//! The buffered I/O state machine: lazy input buffering, frame scanning under a [`Policy`],
//! ordered output flushing, and zero-copy `sendfile` transmission, all driven by one
//! [`reactor::Reactor`] registration per dispatcher.
//!
//! The source (`src/buffer.c`) owns its `event` directly and re-arms it inline from within
//! `rspamd_dispatcher_cb`. Here the reactor owns the registration and the dispatcher is reached
//! through a `Weak` reference from the callback it hands the reactor — the dispatcher (and
//! whoever holds its `Handle`) owns the reactor reference, not the other way around, so the two
//! never keep each other alive past the point the caller drops its handle.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::Evented;
use reactor::{Interest, Readiness, SharedReactor, Token};
use support::error::WaitError;
use support::logging::{warn, Logger};

use crate::buffer::{InputBuffer, OutBuf, OutQueue};
use crate::error::Error;
use crate::policy::Policy;
use crate::sendfile::{Progress, SendfileState};

/// Anything a dispatcher can drive: a readable/writable, `mio`-registerable, raw-fd-bearing
/// stream. `mio::net::TcpStream` and `mio::net::UnixStream` both satisfy this.
pub trait Channel: Read + Write + Evented + AsRawFd {}
impl<T: Read + Write + Evented + AsRawFd> Channel for T {}

const BUFSIZ: usize = 8 * 1024;
const DEFAULT_MAX_SIZE: usize = 16 * 1024 * 1024;

/// What the read callback does with a delivered frame.
///
/// `true` keeps the dispatcher reading; `false` is the source's "unregister me" return value —
/// the dispatcher tears itself down as soon as the current scan pass returns (invariant I4: no
/// further callback fires once one has asked to stop). The second argument is the live framing
/// policy: writing through it changes how `scan_frames` splits the *next* frame, letting a
/// callback switch e.g. from a line-oriented handshake to a fixed-size binary body mid-stream
/// without reaching back into the dispatcher itself.
pub type ReadCallback = Box<dyn FnMut(&[u8], &mut Policy) -> bool>;
/// Called once queued output has fully drained. Return value is currently unused (reserved the
/// way the source's own `write_cb` return value is ignored) but kept `bool` for symmetry with
/// `ReadCallback` and to allow a future "keep writing" extension without an API break.
pub type WriteCallback = Box<dyn FnMut() -> bool>;
pub type ErrorCallback = Box<dyn FnMut(Error)>;

/// Mirrors the source's dispatcher state diagram (`src/STATE MACHINE`). The source's separate
/// `wanna_die` flag collapses into the `Dead` state here: a teardown transitions straight to it
/// rather than setting a flag a later tick has to notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    IdleRead,
    Writing,
    WritingWaiting,
    InSendfile,
    Paused,
    Dead,
}

pub struct Dispatcher<S: Channel> {
    io: S,
    reactor: SharedReactor,
    token: Token,

    state: State,
    paused_from: Option<State>,

    policy: Policy,
    input: InputBuffer,
    output: OutQueue,
    sendfile: Option<SendfileState>,

    timeout: Option<Duration>,

    read_cb: ReadCallback,
    write_cb: WriteCallback,
    err_cb: ErrorCallback,

    peer: Option<String>,
    log: Logger,

    /// Non-owning reference back to the handle itself, used to re-arm the reactor registration
    /// from `restore` with the same dispatch closure `create` installed — never upgraded from
    /// inside `Drop`.
    self_ref: Weak<RefCell<Dispatcher<S>>>,
}

/// Caller-owned handle. The reactor only ever sees a [`Weak`] clone of this, so dropping every
/// `Handle` tears the registration down via `Drop` even if a callback panics before calling
/// `remove` explicitly.
pub type Handle<S> = Rc<RefCell<Dispatcher<S>>>;

/// Input buffer size to allocate for `policy` (§4.2 step 1): a tight `n+1` bytes for a fixed
/// frame size, `BUFSIZ` for anything scanned (`LINE`/`ANY`), since those have no a priori bound.
fn initial_buffer_size(policy: Policy) -> usize {
    match policy {
        Policy::Character(n) => n + 1,
        Policy::Line { .. } | Policy::Any => BUFSIZ,
    }
}

impl<S: Channel + 'static> Dispatcher<S> {
    /// Registers `io` for reading under `policy`, returning the caller-owned handle.
    ///
    /// `timeout`, if set, is the idle-read timeout: if no byte arrives within it, `err_cb` is
    /// called with [`Error::TimedOut`] and the dispatcher tears itself down.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        reactor: SharedReactor,
        io: S,
        policy: Policy,
        timeout: Option<Duration>,
        peer: Option<String>,
        log: Logger,
        read_cb: ReadCallback,
        write_cb: WriteCallback,
        err_cb: ErrorCallback,
    ) -> Result<Handle<S>, Error> {
        // A throwaway token; replaced with the real one returned by `reactor.register` right
        // after construction, since `register` needs a callback that already closes over the
        // dispatcher it is registering.
        let placeholder = Token(usize::MAX);

        let dispatcher = Rc::new(RefCell::new(Dispatcher {
            io,
            reactor: reactor.clone(),
            token: placeholder,
            state: State::IdleRead,
            paused_from: None,
            policy,
            input: InputBuffer::new(initial_buffer_size(policy), DEFAULT_MAX_SIZE),
            output: VecDeque::new(),
            sendfile: None,
            timeout,
            read_cb,
            write_cb,
            err_cb,
            peer,
            log,
            self_ref: Weak::new(),
        }));

        let weak: Weak<RefCell<Dispatcher<S>>> = Rc::downgrade(&dispatcher);
        dispatcher.borrow_mut().self_ref = weak.clone();

        let token = {
            let d = dispatcher.borrow();
            reactor.borrow_mut().register(&d.io, Interest::Read, timeout, Dispatcher::dispatch_closure(weak))?
        };
        dispatcher.borrow_mut().token = token;

        Ok(dispatcher)
    }

    /// Builds the closure the reactor invokes on readiness. Shared by `create` and `restore` so
    /// a paused-then-restored dispatcher keeps dispatching through the same path, not a stub.
    fn dispatch_closure(weak: Weak<RefCell<Dispatcher<S>>>) -> impl FnMut(Readiness) {
        move |readiness| {
            if let Some(strong) = weak.upgrade() {
                Dispatcher::on_ready(&strong, readiness);
            }
        }
    }

    /// Entry point invoked by the reactor; resolves the `Rc<RefCell<_>>` borrow and dispatches to
    /// the read or write path depending on what's ready.
    fn on_ready(handle: &Handle<S>, readiness: Readiness) {
        let mut this = handle.borrow_mut();

        if this.state == State::Dead {
            return;
        }

        if readiness.timed_out {
            this.fail(Error::TimedOut);
            return;
        }

        if readiness.readable && matches!(this.state, State::IdleRead) {
            this.handle_readable();
        }

        if readiness.writable
            && matches!(this.state, State::Writing | State::WritingWaiting | State::InSendfile)
        {
            this.handle_writable();
        }
    }

    /// Read as much as is available, scan it for frames under the current policy, and deliver
    /// each one to the read callback in order (source: `rspamd_dispatcher_cb`, read branch).
    fn handle_readable(&mut self) {
        loop {
            if !self.input.ensure_room() {
                self.fail(Error::TooBig);
                return;
            }

            let n = match self.io.read(self.input.write_region()) {
                Ok(0) => {
                    self.fail(Error::Eof);
                    return;
                }
                Ok(n) => n,
                Err(err) if err.is_wait() => break,
                Err(err) => {
                    self.fail(err.into());
                    return;
                }
            };
            self.input.advance_write(n);

            if !self.scan_frames() {
                // A frame callback asked to stop; tear down and do not read further.
                return;
            }

            if self.state == State::Dead {
                return;
            }
        }

        self.input.compact();
    }

    /// Walks the buffered region looking for complete frames under `self.policy`, delivering
    /// each to `read_cb`. Returns `false` if the callback asked to stop (I4).
    fn scan_frames(&mut self) -> bool {
        loop {
            let frame_len = match self.policy {
                Policy::Any => {
                    if self.input.valid().is_empty() {
                        None
                    } else {
                        Some(self.input.valid().len())
                    }
                }
                Policy::Character(n) => {
                    if self.input.valid().len() >= n {
                        Some(n)
                    } else {
                        None
                    }
                }
                Policy::Line { .. } => {
                    let valid = self.input.valid();
                    let scanned = self.input.scanned();
                    match valid[scanned..].iter().position(|&b| b == b'\n') {
                        Some(rel) => Some(scanned + rel + 1),
                        None => {
                            self.input.advance_scan(valid.len() - scanned);
                            None
                        }
                    }
                }
            };

            let frame_len = match frame_len {
                Some(n) => n,
                None => return true,
            };

            let strip_eol = matches!(self.policy, Policy::Line { strip_eol: true });
            let deliver_len = if strip_eol {
                let frame = &self.input.valid()[..frame_len];
                let trimmed = frame
                    .iter()
                    .rposition(|&b| b != b'\n' && b != b'\r')
                    .map(|i| i + 1)
                    .unwrap_or(0);
                trimmed
            } else {
                frame_len
            };

            let keep_going = {
                let frame = &self.input.valid()[..deliver_len];
                (self.read_cb)(frame, &mut self.policy)
            };

            self.input.consume(frame_len);

            if !keep_going {
                self.teardown();
                return false;
            }
        }
    }

    /// Appends `data` to the output queue without copying it, then attempts to flush immediately
    /// unless `delayed` is set.
    pub fn write_owned(this: &Handle<S>, data: Vec<u8>, delayed: bool) -> Result<(), Error> {
        Dispatcher::enqueue(this, OutBuf::owned(data), delayed)
    }

    /// Copies `data` into a buffer the dispatcher owns, then attempts to flush immediately unless
    /// `delayed` is set. Use [`write_owned`](Self::write_owned) when the caller can give up the
    /// buffer instead.
    pub fn write_copy(this: &Handle<S>, data: &[u8], delayed: bool) -> Result<(), Error> {
        Dispatcher::enqueue(this, OutBuf::copied(data), delayed)
    }

    fn enqueue(this: &Handle<S>, buf: OutBuf, delayed: bool) -> Result<(), Error> {
        {
            let mut d = this.borrow_mut();
            d.output.push_back(buf);
        }

        if !delayed {
            Dispatcher::flush(this)?;
        }
        Ok(())
    }

    /// Drains as much of the output queue as the socket will currently accept, in order. Leaves
    /// the dispatcher registered for write readiness if anything remains unsent.
    pub fn flush(this: &Handle<S>) -> Result<(), Error> {
        let mut d = this.borrow_mut();
        if d.state == State::Dead {
            return Ok(());
        }
        d.drain_output()
    }

    fn drain_output(&mut self) -> Result<(), Error> {
        while let Some(front) = self.output.front_mut() {
            let n = match self.io.write(front.remaining()) {
                Ok(0) => {
                    self.fail(Error::Io(io::Error::new(io::ErrorKind::WriteZero, "zero-length write")));
                    return Ok(());
                }
                Ok(n) => n,
                Err(err) if err.is_wait() => {
                    self.enter_writing_waiting()?;
                    return Ok(());
                }
                Err(err) => {
                    self.fail(err.into());
                    return Ok(());
                }
            };

            front.advance(n);
            if front.is_complete() {
                self.output.pop_front();
            }
        }

        if self.output.is_empty() {
            if self.state == State::Writing || self.state == State::WritingWaiting {
                self.return_to_idle()?;
                (self.write_cb)();
            }
        } else if self.state == State::IdleRead {
            self.enter_writing()?;
        }

        Ok(())
    }

    fn enter_writing(&mut self) -> Result<(), Error> {
        self.state = State::Writing;
        self.reactor.borrow_mut().reregister(&self.io, self.token, Interest::Write)?;
        Ok(())
    }

    fn enter_writing_waiting(&mut self) -> Result<(), Error> {
        self.state = State::WritingWaiting;
        self.reactor.borrow_mut().reregister(&self.io, self.token, Interest::Write)?;
        Ok(())
    }

    fn return_to_idle(&mut self) -> Result<(), Error> {
        self.state = State::IdleRead;
        self.reactor.borrow_mut().reregister(&self.io, self.token, Interest::Read)?;
        Ok(())
    }

    fn handle_writable(&mut self) {
        if self.state == State::InSendfile {
            self.pump_sendfile();
        } else if let Err(err) = self.drain_output() {
            self.fail(err);
        }
    }

    /// Begins a zero-copy transfer of `file[offset..offset+len)` to the peer. Queued `write_*`
    /// output is flushed first, in order, before the sendfile transfer begins (ordering
    /// invariant: nothing jumps ahead of previously queued writes).
    pub fn sendfile(this: &Handle<S>, file: File, offset: u64, len: u64) -> Result<(), Error> {
        Dispatcher::flush(this)?;

        let mut d = this.borrow_mut();
        if !d.output.is_empty() {
            // Still draining regular output; the sendfile call is recorded and will begin once
            // `drain_output` finds the queue empty. Simpler to require callers not to overlap the
            // two in this crate's scope — record as a hard error instead of silently queuing.
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "sendfile requested while regular output is still pending",
            )));
        }

        d.sendfile = Some(SendfileState::new(file, offset, offset + len));
        d.state = State::InSendfile;
        d.reactor.borrow_mut().reregister(&d.io, d.token, Interest::Write)?;
        Ok(())
    }

    fn pump_sendfile(&mut self) {
        let dst_fd: RawFd = self.io.as_raw_fd();
        let result = match &mut self.sendfile {
            Some(state) => state.advance(dst_fd),
            None => return,
        };

        match result {
            Ok(Progress::Advanced(_)) => {}
            Ok(Progress::WouldBlock) => {}
            Ok(Progress::Complete) => {
                self.sendfile = None;
                if let Err(err) = self.return_to_idle() {
                    self.fail(err);
                    return;
                }
                (self.write_cb)();
            }
            Err(err) => {
                self.fail(err.into());
            }
        }
    }

    /// Suspends reading and writing without tearing the registration down; `restore` resumes
    /// from the same point.
    pub fn pause(&mut self) -> Result<(), Error> {
        if self.state == State::Paused || self.state == State::Dead {
            return Ok(());
        }
        self.paused_from = Some(self.state);
        self.state = State::Paused;
        self.reactor.borrow_mut().deregister(&self.io, self.token)?;
        Ok(())
    }

    pub fn restore(&mut self) -> Result<(), Error> {
        if self.state != State::Paused {
            return Ok(());
        }
        let prior = self.paused_from.take().unwrap_or(State::IdleRead);
        let interest = match prior {
            State::Writing | State::WritingWaiting | State::InSendfile => Interest::Write,
            _ => Interest::Read,
        };
        self.state = prior;

        let callback = Dispatcher::dispatch_closure(self.self_ref.clone());
        self.token = self.reactor.borrow_mut().register(&self.io, interest, self.timeout, callback)?;
        Ok(())
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
        self.input.reset_scan();
    }

    /// Explicit teardown: deregisters from the reactor and marks the dispatcher dead. Idempotent.
    pub fn remove(&mut self) {
        self.teardown();
    }

    fn fail(&mut self, err: Error) {
        warn!(self.log, "dispatcher failing"; "peer" => self.peer.as_deref().unwrap_or("?"), "error" => %err);
        (self.err_cb)(err);
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.state == State::Dead {
            return;
        }
        let _ = self.reactor.borrow_mut().deregister(&self.io, self.token);
        self.state = State::Dead;
        self.output.clear();
        self.sendfile = None;
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }
}

impl<S: Channel> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}
