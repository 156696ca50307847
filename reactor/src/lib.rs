//! The readiness-notification reactor shared by `dispatcher` and `resolver`.
//!
//! The source hardcodes `libevent`'s `event_set`/`event_add`/`event_del` directly into both
//! `buffer.c` and `dns.c`. Since this workspace has two cores sharing one event loop, the
//! reactor is pulled out into its own abstraction, built on `mio` the way `neutronium`'s
//! `net::endpoint::Endpoint` drives its `mio::Poll` instances: one `Poll`, a token-keyed
//! registry, edge-triggered interest sets.
//!
//! A registration owns neither the underlying file descriptor nor the user's state; the caller
//! (a `dispatcher::Dispatcher` or the `resolver::Resolver`) keeps the socket alive for as long
//! as it is registered, matching the source's resource policy (`src/SYSTEM OVERVIEW`, ambient
//! resource model in `SPEC_FULL.md` §5).

pub mod error;

pub use error::Error;

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::Evented;

/// Interest set a caller registers on an fd. The reactor never holds both read and write
/// interest plus a "neither" state simultaneously for the same registration — callers express
/// exactly one of these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    fn to_ready(self) -> mio::Ready {
        match self {
            Interest::Read => mio::Ready::readable(),
            Interest::Write => mio::Ready::writable(),
            Interest::ReadWrite => mio::Ready::readable() | mio::Ready::writable(),
        }
    }
}

/// What woke a registered callback up: socket readiness, or the registration's own idle timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub timed_out: bool,
}

pub type Token = mio::Token;

/// Handle to a standalone timer armed with [`Reactor::arm_timer`]. Cancel with
/// [`Reactor::cancel_timer`]; cancelling an already-fired or already-cancelled key is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

type IoCallback = Box<dyn FnMut(Readiness)>;
type TimerCallback = Box<dyn FnMut()>;

struct IoEntry {
    callback: IoCallback,
    /// The timer backing this registration's idle timeout, if any. Cancelled on deregister.
    timer_key: Option<TimerKey>,
}

enum TimerAction {
    Standalone(TimerCallback),
    /// Fires the registration's own io callback with `timed_out = true` instead of a free
    /// standing closure — this is how `register`'s `timeout` argument is implemented.
    FdTimeout(usize),
}

struct TimerEntry {
    deadline: Instant,
    key: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.key == other.key
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so a `BinaryHeap` (a max-heap) pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then_with(|| other.key.cmp(&self.key))
    }
}

/// One readiness-notification event loop: `register(fd, interest, timeout, callback) -> Token`,
/// receive callbacks when readable/writable/timed-out on `turn()`.
pub struct Reactor {
    poll: mio::Poll,
    events: mio::Events,
    next_token: usize,
    next_timer: u64,
    io: HashMap<usize, IoEntry>,
    timers: BinaryHeap<TimerEntry>,
    timer_actions: HashMap<u64, TimerAction>,
}

/// Shared handle type: both `dispatcher::Dispatcher` and `resolver::Resolver` hold one of these
/// so a single OS thread can multiplex an arbitrary number of dispatchers and the resolver's
/// sockets, matching the source's single-threaded-per-worker model.
pub type SharedReactor = Rc<RefCell<Reactor>>;

impl Reactor {
    const EVENTS_CAPACITY: usize = 1024;

    pub fn new() -> Result<Reactor, Error> {
        Ok(Reactor {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(Self::EVENTS_CAPACITY),
            next_token: 0,
            next_timer: 0,
            io: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_actions: HashMap::new(),
        })
    }

    /// Convenience constructor for the shared handle both cores hold.
    pub fn shared() -> Result<SharedReactor, Error> {
        Ok(Rc::new(RefCell::new(Reactor::new()?)))
    }

    /// Registers `io` for `interest`, invoking `callback` on every subsequent `turn()` that
    /// finds it ready. If `timeout` is set, `callback` additionally fires once with
    /// `timed_out = true` if no readiness event arrives within that duration; the caller is
    /// responsible for tearing the registration down in response (I4 in `dispatcher`'s
    /// invariants — the reactor never silently removes a registration).
    pub fn register<E: Evented>(
        &mut self,
        io: &E,
        interest: Interest,
        timeout: Option<Duration>,
        callback: impl FnMut(Readiness) + 'static,
    ) -> Result<Token, Error> {
        let token = mio::Token(self.next_token);
        self.next_token += 1;

        self.poll.register(io, token, interest.to_ready(), mio::PollOpt::edge())?;

        let timer_key = timeout.map(|duration| self.arm_fd_timeout(duration, token.0));

        self.io.insert(token.0, IoEntry { callback: Box::new(callback), timer_key });

        Ok(token)
    }

    /// Changes the interest set for an existing registration (I1: read-or-write, never both).
    pub fn reregister<E: Evented>(&mut self, io: &E, token: Token, interest: Interest) -> Result<(), Error> {
        self.poll.reregister(io, token, interest.to_ready(), mio::PollOpt::edge())?;
        Ok(())
    }

    /// Removes a registration and cancels its idle timeout, if any.
    pub fn deregister<E: Evented>(&mut self, io: &E, token: Token) -> Result<(), Error> {
        self.poll.deregister(io)?;

        if let Some(entry) = self.io.remove(&token.0) {
            if let Some(timer_key) = entry.timer_key {
                self.cancel_timer(timer_key);
            }
        }

        Ok(())
    }

    /// Arms a standalone timer not tied to any fd registration — used by the resolver for
    /// per-request retransmit timeouts, which have nothing to do with the nameserver socket's
    /// own readiness.
    pub fn arm_timer(&mut self, duration: Duration, callback: impl FnMut() + 'static) -> TimerKey {
        self.arm_timer_action(duration, TimerAction::Standalone(Box::new(callback)))
    }

    fn arm_fd_timeout(&mut self, duration: Duration, token: usize) -> TimerKey {
        self.arm_timer_action(duration, TimerAction::FdTimeout(token))
    }

    fn arm_timer_action(&mut self, duration: Duration, action: TimerAction) -> TimerKey {
        let key = self.next_timer;
        self.next_timer += 1;

        let deadline = Instant::now() + duration;
        self.timers.push(TimerEntry { deadline, key });
        self.timer_actions.insert(key, action);

        TimerKey(key)
    }

    /// Cancels a timer. A no-op if it already fired or was already cancelled.
    pub fn cancel_timer(&mut self, key: TimerKey) {
        self.timer_actions.remove(&key.0);
    }

    /// One poll tick: blocks until the next readiness event or the next timer deadline,
    /// whichever is sooner, then drains and fires callbacks.
    pub fn turn(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        let poll_timeout = self
            .timers
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now));

        self.poll.poll(&mut self.events, poll_timeout)?;

        let mut ready = Vec::new();
        for event in &self.events {
            let r = event.readiness();
            ready.push((
                event.token(),
                Readiness {
                    readable: r.is_readable(),
                    writable: r.is_writable(),
                    timed_out: false,
                },
            ));
        }

        for (token, readiness) in ready {
            if let Some(entry) = self.io.get_mut(&token.0) {
                (entry.callback)(readiness);
            }
        }

        self.fire_expired_timers();

        Ok(())
    }

    fn fire_expired_timers(&mut self) {
        let now = Instant::now();

        loop {
            match self.timers.peek() {
                Some(entry) if entry.deadline <= now => {
                    let entry = self.timers.pop().expect("just peeked");

                    if let Some(action) = self.timer_actions.remove(&entry.key) {
                        match action {
                            TimerAction::Standalone(mut callback) => callback(),
                            TimerAction::FdTimeout(token) => {
                                if let Some(io_entry) = self.io.get_mut(&token) {
                                    (io_entry.callback)(Readiness {
                                        readable: false,
                                        writable: false,
                                        timed_out: true,
                                    });
                                }
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::cell::Cell;
    use std::net::SocketAddr;
    use std::rc::Rc;

    #[test]
    fn fires_readable_callback_on_connect() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let local_addr = listener.local_addr().unwrap();

        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let fired_clone = fired.clone();
        reactor
            .register(&listener, Interest::Read, None, move |r| {
                if r.readable {
                    fired_clone.set(true);
                }
            })
            .unwrap();

        let _client = TcpStream::connect(&local_addr).unwrap();

        // A couple of turns to let the connect complete and the listener notice.
        for _ in 0..10 {
            reactor.turn().unwrap();
            if fired.get() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(fired.get());
    }

    #[test]
    fn standalone_timer_fires_once_after_duration() {
        let mut reactor = Reactor::new().unwrap();
        let count = Rc::new(Cell::new(0));

        let count_clone = count.clone();
        reactor.arm_timer(Duration::from_millis(5), move || {
            count_clone.set(count_clone.get() + 1);
        });

        std::thread::sleep(Duration::from_millis(20));
        reactor.turn().unwrap();
        reactor.turn().unwrap();

        assert_eq!(count.get(), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let fired_clone = fired.clone();
        let key = reactor.arm_timer(Duration::from_millis(5), move || {
            fired_clone.set(true);
        });
        reactor.cancel_timer(key);

        std::thread::sleep(Duration::from_millis(20));
        reactor.turn().unwrap();

        assert!(!fired.get());
    }

    #[test]
    fn fd_timeout_invokes_registration_callback() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();

        let mut reactor = Reactor::new().unwrap();
        let timed_out = Rc::new(Cell::new(false));

        let timed_out_clone = timed_out.clone();
        reactor
            .register(&listener, Interest::Read, Some(Duration::from_millis(5)), move |r| {
                if r.timed_out {
                    timed_out_clone.set(true);
                }
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        reactor.turn().unwrap();

        assert!(timed_out.get());
    }
}
