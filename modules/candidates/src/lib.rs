//! Candidate generation for backend discovery: which hosts to probe, in which
//! order, and how ports are layered on top of them.

use ipnet::Ipv4Net;
use signance_core::{Candidate, CandidateConfig, PageContext, PortRange};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Ordered, deduplicated candidate hosts for the given page, highest confidence first.
///
/// A same-origin page yields exactly its own hostname. Otherwise the order is: the
/// page hostname (unless loopback), configured preferred hosts, loopback, likely
/// servers on the page's /24, then likely servers on common private networks.
pub fn generate(ctx: &PageContext, cfg: &CandidateConfig) -> Vec<String> {
    if ctx.same_origin {
        return vec![ctx.hostname.clone()];
    }

    let mut out = OrderedHosts::default();
    if !ctx.is_loopback() {
        out.push(&ctx.hostname);
    }
    for h in &cfg.preferred_hosts {
        out.push(h.trim());
    }
    if cfg.include_loopback {
        out.push("127.0.0.1");
        out.push("localhost");
    }

    let own = own_network(ctx);
    if cfg.scan_subnet {
        if let Some(net) = own {
            for ip in likely_servers(net, &cfg.suffixes) {
                out.push(&ip.to_string());
            }
        }
    }
    if cfg.scan_common_networks {
        for raw in &cfg.common_networks {
            let Some(net) = parse_network(raw) else {
                warn!(network = %raw, "ignoring unparseable common network");
                continue;
            };
            if Some(net) == own {
                continue;
            }
            for ip in likely_servers(net, &cfg.suffixes) {
                out.push(&ip.to_string());
            }
        }
    }

    let hosts = out.into_vec();
    debug!(count = hosts.len(), page = %ctx.hostname, "generated candidate hosts");
    hosts
}

/// The page's own /24, when the page is addressed by a non-loopback IPv4 literal.
pub fn own_network(ctx: &PageContext) -> Option<Ipv4Net> {
    let ip: Ipv4Addr = ctx.hostname.parse().ok()?;
    if ip.is_loopback() || ip.is_unspecified() {
        return None;
    }
    Ipv4Net::new(ip, 24).ok().map(|n| n.trunc())
}

/// Accepts `192.168.0.0/24`, `192.168.0` or `192.168.0.x`.
pub fn parse_network(raw: &str) -> Option<Ipv4Net> {
    let s = raw.trim();
    if s.contains('/') {
        return s.parse::<Ipv4Net>().ok().map(|n| n.trunc());
    }
    let s = s.trim_end_matches(".x");
    let cidr = match s.split('.').count() {
        3 => format!("{}.0/24", s),
        4 => format!("{}/24", s),
        _ => return None,
    };
    cidr.parse::<Ipv4Net>().ok().map(|n| n.trunc())
}

/// Deterministic "likely server" addresses inside `net`, one per suffix.
pub fn likely_servers(net: Ipv4Net, suffixes: &[u8]) -> Vec<Ipv4Addr> {
    let base = u32::from(net.network());
    suffixes
        .iter()
        .filter_map(|&s| {
            let ip = Ipv4Addr::from(base.checked_add(s as u32)?);
            let usable = net.contains(&ip) && ip != net.network() && ip != net.broadcast();
            usable.then_some(ip)
        })
        .collect()
}

#[derive(Default)]
struct OrderedHosts {
    seen: HashSet<String>,
    hosts: Vec<String>,
}

impl OrderedHosts {
    fn push(&mut self, host: &str) {
        if host.is_empty() {
            return;
        }
        if self.seen.insert(host.to_string()) {
            self.hosts.push(host.to_string());
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.hosts
    }
}

/// Two-phase probe order: every host at the preferred port, then every host across
/// the rest of the range, host-major.
#[derive(Debug, Clone)]
pub struct ProbePlan {
    hosts: Vec<String>,
    preferred_port: u16,
    fallback_ports: Vec<u16>,
}

pub fn plan(hosts: Vec<String>, preferred_port: u16, range: PortRange) -> ProbePlan {
    let fallback_ports = range.iter().filter(|&p| p != preferred_port).collect();
    ProbePlan { hosts, preferred_port, fallback_ports }
}

impl ProbePlan {
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn preferred_port(&self) -> u16 {
        self.preferred_port
    }

    pub fn phase_one(&self) -> impl Iterator<Item = Candidate> + '_ {
        self.hosts.iter().map(move |h| Candidate::new(h.clone(), self.preferred_port))
    }

    pub fn phase_two(&self) -> impl Iterator<Item = Candidate> + '_ {
        self.hosts
            .iter()
            .flat_map(move |h| self.fallback_ports.iter().map(move |&p| Candidate::new(h.clone(), p)))
    }

    /// Total probes if nothing answers.
    pub fn len(&self) -> usize {
        self.hosts.len() * (1 + self.fallback_ports.len())
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
