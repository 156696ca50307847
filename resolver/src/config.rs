//! Resolver configuration: the nameserver list and request timing knobs, with a
//! `/etc/resolv.conf` fallback when none are configured explicitly (source: `parse_resolv_conf`,
//! `src/dns.c`).

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameServerConfig {
    pub addr: Ipv4Addr,
    /// Higher priority servers are preferred by round-robin selection (source:
    /// `up.priority` on `struct rspamd_dns_server`). Defaults to 0 for resolv.conf-derived
    /// entries, which don't carry a priority of their own.
    pub priority: u32,
}

impl NameServerConfig {
    pub fn new(addr: Ipv4Addr) -> NameServerConfig {
        NameServerConfig { addr, priority: 0 }
    }

    pub fn with_priority(addr: Ipv4Addr, priority: u32) -> NameServerConfig {
        NameServerConfig { addr, priority }
    }

    /// Parses one `ip[:priority]` entry from an explicit nameserver list (source:
    /// `dns_resolver_init`'s `strchr(begin, ':')` split).
    pub fn parse(entry: &str) -> Result<NameServerConfig, Error> {
        match entry.split_once(':') {
            Some((ip, priority)) => {
                let addr = Ipv4Addr::from_str(ip).map_err(|_| Error::BadFormat)?;
                let priority = priority.parse().map_err(|_| Error::BadFormat)?;
                Ok(NameServerConfig::with_priority(addr, priority))
            }
            None => {
                let addr = Ipv4Addr::from_str(entry).map_err(|_| Error::BadFormat)?;
                Ok(NameServerConfig::new(addr))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub nameservers: Vec<NameServerConfig>,
    pub timeout: Duration,
    pub max_retransmits: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            nameservers: Vec::new(),
            timeout: Duration::from_secs(1),
            max_retransmits: 5,
        }
    }
}

const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

impl NameServerConfig {
    /// Reads `nameserver` lines out of a resolv.conf-formatted file. Lines that don't parse as an
    /// IPv4 address are skipped with a warning rather than aborting the whole file, matching the
    /// source's per-line tolerance.
    pub fn from_resolv_conf(path: &Path) -> Result<Vec<NameServerConfig>, Error> {
        let contents = fs::read_to_string(path)?;
        let mut servers = Vec::new();

        for line in contents.lines() {
            let line = line.trim();
            let rest = match line.strip_prefix("nameserver") {
                Some(rest) => rest,
                None => continue,
            };
            let addr_str = rest.trim_start();
            if addr_str.is_empty() {
                continue;
            }
            match Ipv4Addr::from_str(addr_str.split_whitespace().next().unwrap_or("")) {
                Ok(addr) => servers.push(NameServerConfig::new(addr)),
                Err(_) => continue,
            }
        }

        Ok(servers)
    }

    pub fn from_default_resolv_conf() -> Result<Vec<NameServerConfig>, Error> {
        NameServerConfig::from_resolv_conf(Path::new(DEFAULT_RESOLV_CONF))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_explicit_entry_with_and_without_priority() {
        let plain = NameServerConfig::parse("8.8.8.8").unwrap();
        assert_eq!(plain.addr, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(plain.priority, 0);

        let weighted = NameServerConfig::parse("1.1.1.1:10").unwrap();
        assert_eq!(weighted.addr, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(weighted.priority, 10);

        assert!(NameServerConfig::parse("not-an-ip").is_err());
    }

    #[test]
    fn parses_nameserver_lines_and_skips_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"# comment\nnameserver 8.8.8.8\nsearch example.com\nnameserver 1.1.1.1\nnameserver not-an-ip\n",
        )
        .unwrap();
        file.flush().unwrap();

        let servers = NameServerConfig::from_resolv_conf(file.path()).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].addr, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(servers[1].addr, Ipv4Addr::new(1, 1, 1, 1));
    }
}
