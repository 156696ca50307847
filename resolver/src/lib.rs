//! Stub DNS resolver: a keyed transaction-ID permutation generator, an RFC 1035 wire codec with
//! label compression, and a multi-nameserver resolver with round-robin failover and
//! retransmission.
//!
//! Grounded on the source's `src/dns.c` (`dns_k_permutor_*` / `make_*_req` / `dns_parse_reply` /
//! `dns_resolver_init`), generalized from one hardcoded process-wide resolver to an explicit
//! instance built on a shared [`reactor::Reactor`] (`SPEC_FULL.md` §9 "Global state").

pub mod config;
pub mod error;
pub mod permutor;
pub mod wire;

mod resolver;

pub use config::{NameServerConfig, ResolverConfig};
pub use error::Error;
pub use permutor::Permutor;
pub use resolver::{Handle, RequestType, ResolveCallback, ResolveReply, Resolver};
pub use wire::{QType, Question, Record, Reply};
