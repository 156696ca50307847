//! The stub resolver: a pool of UDP sockets (one per nameserver), an active-request map keyed by
//! transaction ID, and the round-robin/retransmit state machine driving each in-flight request.
//!
//! Grounded on the source's `dns_resolver_init`/`make_dns_request`/`dns_retransmit_handler`/
//! `dns_timer_cb`/`dns_read_cb` (`src/dns.c`). The source's `get_upstream_round_robin` health
//! bookkeeping (`DEFAULT_UPSTREAM_ERROR_TIME`/`DEAD_TIME`/`MAXERRORS`) is reproduced here as
//! [`ServerState::record_error`]/[`ServerState::is_dead`].

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use reactor::{Interest, Readiness, SharedReactor, Token, TimerKey};
use support::error::{ErrorUtils, WaitError};
use support::logging::{debug, warn, Logger};

use crate::config::ResolverConfig;
use crate::error::Error;
use crate::permutor::Permutor;
use crate::wire::{self, QType, Question, Record, Reply as WireReply};

const DNS_PORT: u16 = 53;
const UDP_PACKET_SIZE: usize = 512;

const ERROR_TIME: Duration = Duration::from_secs(10);
const DEAD_TIME: Duration = Duration::from_secs(300);
const MAXERRORS: u32 = 10;

/// What a caller asks the resolver to look up (source: `enum rspamd_request_type`).
#[derive(Debug, Clone)]
pub enum RequestType {
    A(String),
    Ptr(Ipv4Addr),
    Mx(String),
    Txt(String),
}

/// The type-specific elements a successful reply carries (source: `union rspamd_reply_element`,
/// collected into one list per reply rather than a `GList` of tagged unions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveReply {
    A(Vec<Ipv4Addr>),
    Ptr(Vec<String>),
    Mx(Vec<(u16, String)>),
    Txt(Vec<Vec<u8>>),
}

pub type ResolveCallback = Box<dyn FnOnce(Result<ResolveReply, Error>)>;

impl RequestType {
    fn question(&self) -> Question {
        match self {
            RequestType::A(name) => Question { name: name.clone(), qtype: QType::A },
            RequestType::Ptr(addr) => Question { name: wire::ptr_name(*addr), qtype: QType::Ptr },
            RequestType::Mx(name) => Question { name: name.clone(), qtype: QType::Mx },
            RequestType::Txt(name) => Question { name: name.clone(), qtype: QType::Txt },
        }
    }
}

/// One configured nameserver: its UDP socket (registered with the reactor for the resolver's
/// whole lifetime, never closed except at shutdown — see `SPEC_FULL.md` §5 resource policy) plus
/// its round-robin health counters.
struct ServerState {
    addr: Ipv4Addr,
    socket: UdpSocket,
    token: Token,
    priority: u32,
    errors: u32,
    first_error: Option<Instant>,
    dead_until: Option<Instant>,
    /// Transaction IDs whose query is waiting for this socket to become writable again.
    pending_writes: VecDeque<u16>,
    write_armed: bool,
}

impl ServerState {
    fn target(&self) -> SocketAddr {
        SocketAddr::from((self.addr, DNS_PORT))
    }

    fn is_dead(&self, now: Instant) -> bool {
        self.dead_until.map_or(false, |until| until > now)
    }

    /// Records a send/timeout failure; marks the server dead for `DEAD_TIME` once it has
    /// exceeded `MAXERRORS` within a rolling `ERROR_TIME` window (source:
    /// `get_upstream_round_robin`'s companion `upstream_fail`).
    fn record_error(&mut self, now: Instant) {
        match self.first_error {
            Some(first) if now.duration_since(first) <= ERROR_TIME => {
                self.errors += 1;
            }
            _ => {
                self.errors = 1;
                self.first_error = Some(now);
            }
        }

        if self.errors > MAXERRORS {
            self.dead_until = Some(now + DEAD_TIME);
        }
    }
}

/// One in-flight request: enough state to resend it against a different server and to match a
/// reply against what was actually asked (invariants R1-R3, `SPEC_FULL.md` §3).
struct RequestEntry {
    question: Question,
    packet: Vec<u8>,
    server_idx: usize,
    retransmits: u32,
    timer_key: Option<TimerKey>,
    callback: Option<ResolveCallback>,
}

/// Process-wide (per worker) singleton: the nameserver pool, the permutor, and the active-request
/// map. Held behind an `Rc<RefCell<_>>` the same way `dispatcher::Dispatcher` is, since reactor
/// callbacks need to reach back into it (source: global `struct rspamd_dns_resolver`, scoped here
/// to one worker instance per `SPEC_FULL.md` §9 "Global state").
pub struct Resolver {
    reactor: SharedReactor,
    servers: Vec<ServerState>,
    permutor: Permutor,
    requests: HashMap<u16, RequestEntry>,
    cursor: usize,
    timeout: Duration,
    max_retransmits: u32,
    log: Logger,
    self_ref: Weak<RefCell<Resolver>>,
}

pub type Handle = Rc<RefCell<Resolver>>;

impl Resolver {
    /// Builds the nameserver pool from `config` and registers one socket per server with the
    /// reactor for the resolver's entire lifetime (source: `dns_resolver_init`).
    pub fn init(reactor: SharedReactor, config: ResolverConfig, log: Logger) -> Result<Handle, Error> {
        if config.nameservers.is_empty() {
            return Err(Error::NameserverExhausted);
        }

        let mut servers = Vec::with_capacity(config.nameservers.len());
        for ns in &config.nameservers {
            let bind_addr: SocketAddr = ([0, 0, 0, 0], 0).into();
            let socket = UdpSocket::bind(&bind_addr)?;
            servers.push(ServerState {
                addr: ns.addr,
                socket,
                token: Token(usize::MAX),
                priority: ns.priority,
                errors: 0,
                first_error: None,
                dead_until: None,
                pending_writes: VecDeque::new(),
                write_armed: false,
            });
        }

        let resolver = Rc::new(RefCell::new(Resolver {
            reactor: reactor.clone(),
            servers,
            permutor: Permutor::new(0, u16::MAX as u32),
            requests: HashMap::new(),
            cursor: 0,
            timeout: config.timeout,
            max_retransmits: config.max_retransmits,
            log,
            self_ref: Weak::new(),
        }));

        let weak: Weak<RefCell<Resolver>> = Rc::downgrade(&resolver);
        resolver.borrow_mut().self_ref = weak.clone();

        let server_count = resolver.borrow().servers.len();
        for idx in 0..server_count {
            let token = {
                let this = resolver.borrow();
                reactor.borrow_mut().register(
                    &this.servers[idx].socket,
                    Interest::Read,
                    None,
                    Resolver::read_closure(weak.clone(), idx),
                )?
            };
            resolver.borrow_mut().servers[idx].token = token;
        }

        Ok(resolver)
    }

    fn read_closure(weak: Weak<RefCell<Resolver>>, server_idx: usize) -> impl FnMut(Readiness) {
        move |readiness| {
            if let Some(strong) = weak.upgrade() {
                if readiness.readable {
                    Resolver::on_socket_readable(&strong, server_idx);
                }
                if readiness.writable {
                    Resolver::on_socket_writable(&strong, server_idx);
                }
            }
        }
    }

    /// Issues one query (source: `make_dns_request`). Selects a live server, builds the wire
    /// packet, and either sends it immediately or arms write-interest for a retry.
    pub fn resolve(this: &Handle, request_type: RequestType, callback: ResolveCallback) -> Result<(), Error> {
        let mut resolver = this.borrow_mut();

        let question = request_type.question();
        let server_idx = resolver.select_server().ok_or(Error::NameserverExhausted)?;

        let mut id = resolver.permutor.step() as u16;
        // The permutor guarantees no repeat within one 65,536-step cycle, but guard against the
        // pathological case of more in-flight requests than transaction ID space regardless.
        let mut guard = 0u32;
        while resolver.requests.contains_key(&id) {
            guard += 1;
            if guard > u16::MAX as u32 {
                return Err(Error::NameserverExhausted);
            }
            id = resolver.permutor.step() as u16;
        }

        let packet = wire::build_query(id, &question);

        resolver.requests.insert(
            id,
            RequestEntry {
                question,
                packet: packet.clone(),
                server_idx,
                retransmits: 0,
                timer_key: None,
                callback: Some(callback),
            },
        );

        resolver.dispatch_send(id, server_idx, &packet);
        Ok(())
    }

    /// Picks the highest-priority live server, rotating among ties (source:
    /// `get_upstream_round_robin`).
    fn select_server(&mut self) -> Option<usize> {
        let now = Instant::now();
        let alive: Vec<usize> = (0..self.servers.len())
            .filter(|&i| !self.servers[i].is_dead(now))
            .collect();
        if alive.is_empty() {
            return None;
        }

        let max_priority = alive.iter().map(|&i| self.servers[i].priority).max().unwrap();
        let candidates: Vec<usize> =
            alive.into_iter().filter(|&i| self.servers[i].priority == max_priority).collect();

        self.cursor = (self.cursor + 1) % candidates.len();
        Some(candidates[self.cursor])
    }

    /// Attempts one send on `server_idx`'s socket. On success, arms the per-request retransmit
    /// timer. On `WouldBlock`, queues the id for a retry once the socket reports writable. On a
    /// hard send failure, fails the server's health counter and retries with a different one
    /// (same transaction ID — the wire hasn't committed to anything yet, §4.5).
    fn dispatch_send(&mut self, id: u16, server_idx: usize, packet: &[u8]) {
        let target = self.servers[server_idx].target();
        let result = self.servers[server_idx].socket.send_to(packet, &target);

        if !result.has_failed() {
            match result {
                Ok(_) => self.arm_request_timer(id),
                Err(_) => {
                    self.arm_write_interest(server_idx);
                    self.servers[server_idx].pending_writes.push_back(id);
                }
            }
            return;
        }

        let err = result.unwrap_err();
        warn!(self.log, "dns send failed"; "server" => %self.servers[server_idx].addr, "error" => %err);
        self.servers[server_idx].record_error(Instant::now());
        self.retry_on_other_server(id);
    }

    fn arm_write_interest(&mut self, server_idx: usize) {
        let server = &mut self.servers[server_idx];
        if server.write_armed {
            return;
        }
        server.write_armed = true;
        let _ = self.reactor.borrow_mut().reregister(&server.socket, server.token, Interest::ReadWrite);
    }

    fn disarm_write_interest(&mut self, server_idx: usize) {
        let server = &mut self.servers[server_idx];
        if !server.write_armed {
            return;
        }
        server.write_armed = false;
        let _ = self.reactor.borrow_mut().reregister(&server.socket, server.token, Interest::Read);
    }

    fn on_socket_writable(this: &Handle, server_idx: usize) {
        let mut resolver = this.borrow_mut();
        let pending: Vec<u16> = resolver.servers[server_idx].pending_writes.drain(..).collect();

        for id in pending {
            if let Some(packet) = resolver.requests.get(&id).map(|r| r.packet.clone()) {
                resolver.dispatch_send(id, server_idx, &packet);
            }
        }

        if resolver.servers[server_idx].pending_writes.is_empty() {
            resolver.disarm_write_interest(server_idx);
        }
    }

    /// Picks a new server for `id` and resends under the same transaction ID, matching the
    /// source's retransmit-keeps-id behavior (a stale reply from the original server is still
    /// accepted — §4.5 "Ordering and races").
    fn retry_on_other_server(&mut self, id: u16) {
        let next = self.select_server();
        match next {
            Some(server_idx) => {
                let packet = match self.requests.get_mut(&id) {
                    Some(req) => {
                        req.server_idx = server_idx;
                        req.packet.clone()
                    }
                    None => return,
                };
                self.dispatch_send(id, server_idx, &packet);
            }
            None => self.fail_request(id, Error::NameserverExhausted),
        }
    }

    fn arm_request_timer(&mut self, id: u16) {
        let timeout = self.timeout;
        let weak = self.self_ref.clone();
        let key = self.reactor.borrow_mut().arm_timer(timeout, move || {
            if let Some(strong) = weak.upgrade() {
                Resolver::on_request_timeout(&strong, id);
            }
        });

        if let Some(req) = self.requests.get_mut(&id) {
            req.timer_key = Some(key);
        }
    }

    /// Per-request retransmit timer firing with no reply yet (source: `dns_timer_cb`).
    fn on_request_timeout(this: &Handle, id: u16) {
        let mut resolver = this.borrow_mut();

        let (retransmits, old_server_idx) = match resolver.requests.get(&id) {
            Some(req) => (req.retransmits + 1, req.server_idx),
            None => return,
        };

        // A timeout is a failure of the server that was asked, exactly like a hard send
        // failure (§4.5 "On send failure or timeout, increment the server's error counter") —
        // record it against `old_server_idx` before `select_server` below picks the next one.
        resolver.servers[old_server_idx].record_error(Instant::now());

        if retransmits >= resolver.max_retransmits {
            debug!(resolver.log, "dns request exhausted retransmits"; "id" => id);
            drop(resolver);
            Resolver::complete(this, id, Err(Error::MaxRetransmits));
            return;
        }

        if let Some(req) = resolver.requests.get_mut(&id) {
            req.retransmits = retransmits;
        }

        let server_idx = resolver.select_server();
        match server_idx {
            Some(server_idx) => {
                let packet = match resolver.requests.get_mut(&id) {
                    Some(req) => {
                        req.server_idx = server_idx;
                        req.packet.clone()
                    }
                    None => return,
                };
                resolver.dispatch_send(id, server_idx, &packet);
            }
            None => {
                drop(resolver);
                Resolver::complete(this, id, Err(Error::NameserverExhausted));
            }
        }
    }

    fn fail_request(&mut self, id: u16, err: Error) {
        if let Some(req) = self.requests.get_mut(&id) {
            if let Some(key) = req.timer_key.take() {
                self.reactor.borrow_mut().cancel_timer(key);
            }
        }
        if let Some(mut req) = self.requests.remove(&id) {
            if let Some(callback) = req.callback.take() {
                callback(Err(err));
            }
        }
    }

    /// Reply datagram available on `server_idx`'s socket (source: `dns_read_cb`).
    fn on_socket_readable(this: &Handle, server_idx: usize) {
        let mut buf = [0u8; UDP_PACKET_SIZE];
        let read = {
            let resolver = this.borrow();
            resolver.servers[server_idx].socket.recv_from(&mut buf)
        };

        let n = match read {
            Ok((n, _from)) => n,
            Err(err) if err.is_wait() => return,
            Err(_) => return,
        };

        let packet = &buf[..n];
        let reply = match wire::parse_reply(packet) {
            Ok(reply) => reply,
            // Malformed replies are dropped silently (§7: protocol errors never reach the
            // caller — another server may still answer correctly).
            Err(_) => return,
        };

        let id = reply.id;
        let resolver = this.borrow();
        let log = resolver.log.clone();
        let question = match resolver.requests.get(&id) {
            Some(req) => req.question.clone(),
            None => {
                drop(resolver);
                debug!(log, "dns reply id matches no pending request, dropping";
                    "id" => id, "error" => %Error::IdMismatch);
                return;
            }
        };
        drop(resolver);

        if !questions_match(&question, &reply.question) {
            debug!(log, "dns reply question mismatch, dropping as possible spoof";
                "id" => id, "error" => %Error::QuestionMismatch);
            return;
        }

        let result = reply_result(&reply);
        Resolver::complete(this, id, result);
    }

    /// Removes the request from the map, cancels its timer, and fires its callback exactly once
    /// (invariant: a caller sees one terminal outcome per request).
    fn complete(this: &Handle, id: u16, result: Result<ResolveReply, Error>) {
        let mut resolver = this.borrow_mut();
        let mut req = match resolver.requests.remove(&id) {
            Some(req) => req,
            None => return,
        };
        if let Some(key) = req.timer_key.take() {
            resolver.reactor.borrow_mut().cancel_timer(key);
        }
        drop(resolver);

        if let Some(callback) = req.callback.take() {
            callback(result);
        }
    }
}

fn questions_match(expected: &Question, got: &Question) -> bool {
    expected.qtype == got.qtype && expected.name.eq_ignore_ascii_case(&got.name)
}

fn reply_result(reply: &WireReply) -> Result<ResolveReply, Error> {
    if reply.rcode != 0 {
        return Err(Error::Rcode(reply.rcode));
    }

    match reply.question.qtype {
        QType::A => {
            let addrs = reply
                .answers
                .iter()
                .filter_map(|r| match r {
                    Record::A(addr) => Some(*addr),
                    _ => None,
                })
                .collect();
            Ok(ResolveReply::A(addrs))
        }
        QType::Ptr => {
            let names = reply
                .answers
                .iter()
                .filter_map(|r| match r {
                    Record::Ptr(name) => Some(name.clone()),
                    _ => None,
                })
                .collect();
            Ok(ResolveReply::Ptr(names))
        }
        QType::Mx => {
            let pairs = reply
                .answers
                .iter()
                .filter_map(|r| match r {
                    Record::Mx { preference, exchange } => Some((*preference, exchange.clone())),
                    _ => None,
                })
                .collect();
            Ok(ResolveReply::Mx(pairs))
        }
        QType::Txt => {
            let strings = reply
                .answers
                .iter()
                .filter_map(|r| match r {
                    Record::Txt(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            Ok(ResolveReply::Txt(strings))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NameServerConfig;
    use std::time::Duration;

    fn config_for(servers: Vec<NameServerConfig>) -> ResolverConfig {
        ResolverConfig {
            nameservers: servers,
            timeout: Duration::from_millis(50),
            max_retransmits: 3,
        }
    }

    #[test]
    fn init_registers_one_socket_per_nameserver() {
        let reactor = reactor::Reactor::shared().unwrap();
        let servers = vec![NameServerConfig::new(Ipv4Addr::new(127, 0, 0, 1))];
        let resolver = Resolver::init(reactor, config_for(servers), support::logging::discard()).unwrap();
        assert_eq!(resolver.borrow().servers.len(), 1);
    }

    #[test]
    fn init_rejects_an_empty_nameserver_list() {
        let reactor = reactor::Reactor::shared().unwrap();
        let err = Resolver::init(reactor, config_for(Vec::new()), support::logging::discard());
        assert!(matches!(err, Err(Error::NameserverExhausted)));
    }

    #[test]
    fn select_server_skips_dead_servers_and_rotates_among_the_rest() {
        let reactor = reactor::Reactor::shared().unwrap();
        let servers = vec![
            NameServerConfig::new(Ipv4Addr::new(127, 0, 0, 1)),
            NameServerConfig::new(Ipv4Addr::new(127, 0, 0, 2)),
        ];
        let resolver = Resolver::init(reactor, config_for(servers), support::logging::discard()).unwrap();

        resolver.borrow_mut().servers[0].dead_until = Some(Instant::now() + Duration::from_secs(60));

        let mut r = resolver.borrow_mut();
        assert_eq!(r.select_server(), Some(1));
        assert_eq!(r.select_server(), Some(1));
    }

    #[test]
    fn questions_match_is_case_insensitive() {
        let a = Question { name: "Example.COM".into(), qtype: QType::A };
        let b = Question { name: "example.com".into(), qtype: QType::A };
        assert!(questions_match(&a, &b));

        let c = Question { name: "example.com".into(), qtype: QType::Mx };
        assert!(!questions_match(&a, &c));
    }

    #[test]
    fn reply_result_surfaces_nonzero_rcode_as_an_error() {
        let reply = WireReply {
            id: 1,
            rcode: 2,
            question: Question { name: "example.com".into(), qtype: QType::A },
            answers: Vec::new(),
        };
        assert!(matches!(reply_result(&reply), Err(Error::Rcode(2))));
    }

    #[test]
    fn reply_result_collects_a_records() {
        let reply = WireReply {
            id: 1,
            rcode: 0,
            question: Question { name: "example.com".into(), qtype: QType::A },
            answers: vec![Record::A(Ipv4Addr::new(93, 184, 216, 34))],
        };
        match reply_result(&reply).unwrap() {
            ResolveReply::A(addrs) => assert_eq!(addrs, vec![Ipv4Addr::new(93, 184, 216, 34)]),
            other => panic!("unexpected reply kind: {:?}", other),
        }
    }

    #[test]
    fn server_health_marks_dead_after_maxerrors_within_error_time() {
        let socket = UdpSocket::bind(&([0, 0, 0, 0], 0).into()).unwrap();
        let mut server = ServerState {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            socket,
            token: Token(0),
            priority: 0,
            errors: 0,
            first_error: None,
            dead_until: None,
            pending_writes: VecDeque::new(),
            write_armed: false,
        };

        let now = Instant::now();
        assert!(!server.is_dead(now));

        for _ in 0..=MAXERRORS {
            server.record_error(now);
        }

        assert!(server.is_dead(now));
        assert!(!server.is_dead(now + DEAD_TIME + Duration::from_secs(1)));
    }
}
