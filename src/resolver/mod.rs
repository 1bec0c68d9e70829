//! Endpoint name resolution.
//!
//! Two modes: [`Resolver::System`] delegates to the OS resolver, while
//! [`Resolver::Direct`] walks the DNS delegation chain itself so that no
//! intermediate cache can serve a stale DDNS address. The walk discovers the
//! authoritative name servers for the target zone from a seed pool of public
//! resolvers, prefers glue addresses, races A and AAAA lookups and stops at
//! the first usable address.

mod query;

pub use query::RateLimiter;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use domain::base::iana::Rcode;
use domain::base::message::Message;
use domain::base::Rtype;
use rand::seq::SliceRandom as _;
use tokio::task::JoinSet;

use query::{Client, MessageSection, Rdata};

pub type DomainName = domain::base::name::Name<Vec<u8>>;

const MAX_CNAME_DEPTH: usize = 5;
const DNS_PORT: u16 = 53;
const FALLBACK_SEEDS: [SocketAddr; 2] = [
    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(1, 1, 1, 1)), DNS_PORT),
    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)), DNS_PORT),
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("domain `{0}` does not exist")]
    NxDomain(String),
    #[error("DNS exchange with {server} timed out")]
    Timeout { server: SocketAddr },
    #[error("DNS server {server} answered with rcode {rcode}")]
    ServerFailure { server: SocketAddr, rcode: Rcode },
    #[error("no seed DNS server could be reached")]
    NoNameservers,
    #[error("no authoritative name server found for `{0}`")]
    DelegationExhausted(String),
    #[error("CNAME chain for `{0}` is too deep")]
    CnameChainTooDeep(String),
    #[error("no address records for `{0}`")]
    NoAddress(String),
    #[error("`{0}` is not a valid host:port endpoint")]
    InvalidEndpoint(String),
    #[error("`{0}` is not a valid domain name")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// NXDOMAIN is an authoritative "no": retrying or asking another server
    /// cannot change it.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::NxDomain(_))
    }
}

/// The one operation the daemon and the config loader need from a resolver.
pub trait ResolveEndpoint {
    fn resolve_udp_addr(
        &self,
        addr: &str,
    ) -> impl Future<Output = Result<SocketAddr, Error>> + Send;
}

impl<R> ResolveEndpoint for std::sync::Arc<R>
where
    R: ResolveEndpoint + Send + Sync,
{
    fn resolve_udp_addr(
        &self,
        addr: &str,
    ) -> impl Future<Output = Result<SocketAddr, Error>> + Send {
        (**self).resolve_udp_addr(addr)
    }
}

pub enum Resolver {
    /// `tokio::net::lookup_host`, i.e. whatever the OS resolver returns.
    System,
    /// The iterative, cache-bypassing resolver.
    Direct(Iterative),
}

impl Resolver {
    /// Picks the resolver mode from the daemon settings. The seed pool order
    /// is: operator-configured servers, `/etc/resolv.conf`, hard-coded
    /// fallback.
    pub fn from_settings(settings: &crate::settings::Settings) -> Self {
        if !settings.enhanced_dns.direct_resolver.enabled {
            return Resolver::System;
        }
        let seeds = seed_pool(
            &settings.enhanced_dns.direct_resolver.roa_finder,
            Path::new("/etc/resolv.conf"),
        );
        tracing::info!(?seeds, "direct resolver enabled");
        Resolver::Direct(Iterative::new(seeds))
    }
}

impl ResolveEndpoint for Resolver {
    async fn resolve_udp_addr(&self, addr: &str) -> Result<SocketAddr, Error> {
        match self {
            Resolver::System => {
                let (host, port) = split_host_port(addr)?;
                if let Ok(ip) = host.parse::<IpAddr>() {
                    return Ok(SocketAddr::new(ip, port));
                }
                let mut addrs = tokio::net::lookup_host((host.as_str(), port)).await?;
                addrs.next().ok_or_else(|| Error::NoAddress(host.clone()))
            }
            Resolver::Direct(iterative) => iterative.resolve_udp_addr(addr).await,
        }
    }
}

/// Splits `host:port`, accepting bracketed IPv6 literals.
pub fn split_host_port(addr: &str) -> Result<(String, u16), Error> {
    let invalid = || Error::InvalidEndpoint(addr.to_owned());

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;

    let host = if let Some(inner) = host.strip_prefix('[') {
        inner.strip_suffix(']').ok_or_else(invalid)?
    } else {
        // a bare colon-containing host is an unbracketed IPv6 literal,
        // which rsplit would have cut in the middle
        if host.contains(':') {
            return Err(invalid());
        }
        host
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_owned(), port))
}

/// True when the endpoint's host part is an IP literal, i.e. nothing to
/// re-resolve later.
pub fn is_literal_endpoint(addr: &str) -> bool {
    match split_host_port(addr) {
        Ok((host, _)) => host.parse::<IpAddr>().is_ok(),
        Err(_) => false,
    }
}

/// An authority for the target zone: its name plus any glue addresses the
/// delegating server handed out.
struct Authority {
    name: DomainName,
    glue: Vec<IpAddr>,
}

pub struct Iterative {
    seeds: Vec<SocketAddr>,
    authority_port: u16,
    client: std::sync::Arc<Client>,
}

impl Iterative {
    pub fn new(seeds: Vec<SocketAddr>) -> Self {
        Self {
            seeds,
            authority_port: DNS_PORT,
            client: std::sync::Arc::new(Client::default()),
        }
    }

    /// Overrides the port authoritative servers are queried on.
    pub fn with_authority_port(mut self, port: u16) -> Self {
        self.authority_port = port;
        self
    }

    pub async fn resolve_udp_addr(&self, addr: &str) -> Result<SocketAddr, Error> {
        let (host, port) = split_host_port(addr)?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let ip = self.resolve_host(&host).await?;
        Ok(SocketAddr::new(ip, port))
    }

    async fn resolve_host(&self, host: &str) -> Result<IpAddr, Error> {
        let name =
            DomainName::vec_from_str(host).map_err(|_| Error::InvalidName(host.to_owned()))?;

        let target = self.unfold_cname(name).await?;
        let authorities = self.find_authorities(&target).await?;

        for authority in authorities {
            let addrs = if authority.glue.is_empty() {
                match self.host_addrs(&self.seeds, &authority.name).await {
                    Ok(addrs) => addrs,
                    Err(err) if err.is_unrecoverable() => return Err(err),
                    Err(err) => {
                        tracing::debug!(ns = %authority.name, %err, "failed to resolve name server");
                        continue;
                    }
                }
            } else {
                authority.glue
            };

            for addr in addrs {
                let server = [SocketAddr::new(addr, self.authority_port)];
                match self.host_addrs(&server, &target).await {
                    Ok(addrs) => {
                        if let Some(ip) = addrs.into_iter().next() {
                            return Ok(ip);
                        }
                    }
                    Err(err) if err.is_unrecoverable() => return Err(err),
                    Err(err) => {
                        tracing::debug!(server = %server[0], domain = %target, %err, "authority query failed")
                    }
                }
            }
        }

        Err(Error::NoAddress(host.to_owned()))
    }

    /// Flattens CNAME aliases against the seed pool before walking the
    /// delegation chain, capped at five levels.
    async fn unfold_cname(&self, mut name: DomainName) -> Result<DomainName, Error> {
        for _ in 0..MAX_CNAME_DEPTH {
            let msg = self.query_pool(&name, Rtype::A).await?;
            let cname = query::section_records(&msg, MessageSection::Answer)
                .into_iter()
                .find_map(|record| match record.data {
                    Rdata::Cname(target) => Some(target),
                    _ => None,
                });
            match cname {
                Some(target) => name = target,
                None => return Ok(name),
            }
        }
        Err(Error::CnameChainTooDeep(name.to_string()))
    }

    /// Walks up from the target until a zone answers with NS records.
    ///
    /// A SOA in the authority section with a strictly shorter owner name
    /// short-circuits the walk to that zone; otherwise the leftmost label is
    /// stripped. Reaching the root without an NS answer is a hard failure.
    async fn find_authorities(&self, target: &DomainName) -> Result<Vec<Authority>, Error> {
        let mut zone = target.clone();

        loop {
            let msg = self.query_pool(&zone, Rtype::NS).await?;

            let mut authorities = collect_authorities(&msg);
            if !authorities.is_empty() {
                authorities.shuffle(&mut rand::thread_rng());
                return Ok(authorities);
            }

            let zone_text = zone.to_string();
            let next = query::section_records(&msg, MessageSection::Authority)
                .into_iter()
                .filter(|record| matches!(record.data, Rdata::Soa))
                .map(|record| record.owner)
                .find(|owner| owner.to_string().len() < zone_text.len());

            zone = match next {
                Some(shorter) => shorter,
                None => match parent_zone(&zone) {
                    Some(parent) => parent,
                    None => return Err(Error::DelegationExhausted(target.to_string())),
                },
            };
        }
    }

    /// Races A and AAAA queries for `name` against `servers`; the first
    /// non-empty answer wins and the slower query is aborted.
    async fn host_addrs(
        &self,
        servers: &[SocketAddr],
        name: &DomainName,
    ) -> Result<Vec<IpAddr>, Error> {
        let mut set = JoinSet::new();
        for rtype in [Rtype::A, Rtype::AAAA] {
            let client = self.client.clone();
            let servers = servers.to_vec();
            let name = name.clone();
            set.spawn(async move {
                let msg = query_pool_with(&client, &servers, &name, rtype).await?;
                Ok::<_, Error>(
                    query::section_records(&msg, MessageSection::Answer)
                        .into_iter()
                        .filter_map(|record| record.data.ip())
                        .collect::<Vec<_>>(),
                )
            });
        }

        let mut last = Error::NoAddress(name.to_string());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(addrs)) if !addrs.is_empty() => return Ok(addrs),
                Ok(Ok(_)) => {}
                Ok(Err(err)) if err.is_unrecoverable() => return Err(err),
                Ok(Err(err)) => last = err,
                Err(_) => {}
            }
        }
        Err(last)
    }

    async fn query_pool(&self, name: &DomainName, rtype: Rtype) -> Result<Message<Vec<u8>>, Error> {
        query_pool_with(&self.client, &self.seeds, name, rtype).await
    }
}

/// Tries each server in turn; transport and server failures move on to the
/// next one, NXDOMAIN is final.
async fn query_pool_with(
    client: &Client,
    servers: &[SocketAddr],
    name: &DomainName,
    rtype: Rtype,
) -> Result<Message<Vec<u8>>, Error> {
    let mut last = Error::NoNameservers;
    for server in servers {
        match client.exchange(*server, name, rtype).await {
            Ok(msg) => return Ok(msg),
            Err(err) if err.is_unrecoverable() => return Err(err),
            Err(err) => {
                tracing::debug!(%server, domain = %name, %err, "server failed, trying next");
                last = err;
            }
        }
    }
    Err(last)
}

/// NS records from the answer section, each paired with matching glue from
/// the additional section.
fn collect_authorities(msg: &Message<Vec<u8>>) -> Vec<Authority> {
    let additional = query::section_records(msg, MessageSection::Additional);

    query::section_records(msg, MessageSection::Answer)
        .into_iter()
        .filter_map(|record| match record.data {
            Rdata::Ns(ns) => Some(ns),
            _ => None,
        })
        .map(|name| {
            let glue = additional
                .iter()
                .filter(|record| record.owner == name)
                .filter_map(|record| record.data.ip())
                .collect();
            Authority { name, glue }
        })
        .collect()
}

/// Strips the leftmost label; `None` once the parent would be the root (or
/// the name already is).
fn parent_zone(name: &DomainName) -> Option<DomainName> {
    if name.is_root() {
        return None;
    }
    let text = name.to_string();
    let text = text.trim_end_matches('.');
    let (_, parent) = text.split_once('.')?;
    if parent.is_empty() {
        return None;
    }
    DomainName::vec_from_str(parent).ok()
}

/// Builds the seed pool: operator entries first, then `resolv.conf`, then
/// the hard-coded public fallback.
fn seed_pool(configured: &[String], resolv_conf: &Path) -> Vec<SocketAddr> {
    let mut seeds = Vec::new();

    for entry in configured {
        if let Ok(addr) = entry.parse::<SocketAddr>() {
            seeds.push(addr);
        } else if let Ok(ip) = entry.parse::<IpAddr>() {
            seeds.push(SocketAddr::new(ip, DNS_PORT));
        } else {
            tracing::warn!(addr = %entry, "ignoring unparsable seed DNS server");
        }
    }

    if seeds.is_empty() {
        match std::fs::read_to_string(resolv_conf) {
            Ok(contents) => match resolv_conf::Config::parse(&contents) {
                Ok(config) => {
                    for nameserver in config.nameservers {
                        let ip: IpAddr = nameserver.into();
                        seeds.push(SocketAddr::new(ip, DNS_PORT));
                    }
                }
                Err(err) => tracing::warn!(%err, "failed to parse resolv.conf"),
            },
            Err(err) => tracing::debug!(%err, "failed to read resolv.conf"),
        }
    }

    if seeds.is_empty() {
        tracing::warn!("no seed DNS servers configured, falling back to public resolvers");
        seeds.extend(FALLBACK_SEEDS);
    }

    seeds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_v4_host_port() {
        assert_eq!(
            split_host_port("198.51.100.1:51820").unwrap(),
            ("198.51.100.1".to_owned(), 51820)
        );
    }

    #[test]
    fn splits_bracketed_v6() {
        assert_eq!(
            split_host_port("[fd00::1]:51820").unwrap(),
            ("fd00::1".to_owned(), 51820)
        );
    }

    #[test]
    fn splits_hostname() {
        assert_eq!(
            split_host_port("vpn.example.net:51820").unwrap(),
            ("vpn.example.net".to_owned(), 51820)
        );
    }

    #[test]
    fn rejects_missing_port() {
        assert!(split_host_port("vpn.example.net").is_err());
        assert!(split_host_port("fd00::1").is_err());
    }

    #[test]
    fn literal_detection() {
        assert!(is_literal_endpoint("198.51.100.1:51820"));
        assert!(is_literal_endpoint("[fd00::1]:51820"));
        assert!(!is_literal_endpoint("vpn.example.net:51820"));
    }

    #[test]
    fn parent_zone_strips_leftmost_label() {
        let name = DomainName::vec_from_str("www.example.com").unwrap();
        let parent = parent_zone(&name).unwrap();
        assert_eq!(parent, DomainName::vec_from_str("example.com").unwrap());

        let tld = parent_zone(&parent).unwrap();
        assert_eq!(tld, DomainName::vec_from_str("com").unwrap());

        assert!(parent_zone(&tld).is_none());
    }

    #[test]
    fn seed_pool_prefers_configured_entries() {
        let configured = vec!["223.5.5.5".to_owned(), "9.9.9.9:5353".to_owned()];
        let seeds = seed_pool(&configured, Path::new("/nonexistent/resolv.conf"));
        assert_eq!(
            seeds,
            vec![
                "223.5.5.5:53".parse().unwrap(),
                "9.9.9.9:5353".parse().unwrap()
            ]
        );
    }

    #[test]
    fn seed_pool_reads_resolv_conf() {
        let path = std::env::temp_dir().join("wg-steward-resolv-conf-test");
        std::fs::write(&path, "nameserver 192.0.2.53\nnameserver 192.0.2.54\n").unwrap();

        let seeds = seed_pool(&[], &path);
        assert_eq!(
            seeds,
            vec![
                "192.0.2.53:53".parse().unwrap(),
                "192.0.2.54:53".parse().unwrap()
            ]
        );

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn seed_pool_falls_back_to_public_resolvers() {
        let seeds = seed_pool(&[], Path::new("/nonexistent/resolv.conf"));
        assert_eq!(seeds, FALLBACK_SEEDS.to_vec());
    }

    #[tokio::test]
    async fn literal_endpoints_resolve_without_queries() {
        let resolver = Iterative::new(vec![]);

        let addr = resolver.resolve_udp_addr("198.51.100.1:51820").await.unwrap();
        assert_eq!(addr, "198.51.100.1:51820".parse().unwrap());

        let addr = resolver.resolve_udp_addr("[fd00::1]:53").await.unwrap();
        assert_eq!(addr, "[fd00::1]:53".parse().unwrap());
    }
}
