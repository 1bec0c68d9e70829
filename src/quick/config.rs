//! Parsed representation of `wg-quick` interface configuration files.
//!
//! The parser is deliberately pure: it maps the INI text to an
//! [`InterfaceConfig`] plus the textual peer endpoints, and leaves name
//! resolution to the caller. The original `host:port` strings of peers whose
//! host is not an IP literal are preserved in the unresolved-endpoint table
//! so the daemon can re-resolve them long after the file was read.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ip_network::IpNetwork;

use crate::key::Key;
use crate::resolver::{self, ResolveEndpoint};
use crate::settings::WireguardDefaults;

pub const CONFIG_DIR: &str = "/etc/wireguard";
pub const DEFAULT_MTU: u32 = 1420;

/// An interface address: an IP plus prefix length.
///
/// Unlike a route destination this is not a network, host bits are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpAddrMask {
    pub ip: IpAddr,
    pub cidr: u8,
}

impl IpAddrMask {
    pub fn new(ip: IpAddr, cidr: u8) -> Self {
        Self { ip, cidr }
    }

    fn max_cidr(ip: &IpAddr) -> u8 {
        match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

impl fmt::Display for IpAddrMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.cidr)
    }
}

impl FromStr for IpAddrMask {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, cidr) = match s.split_once('/') {
            Some((ip, cidr)) => {
                let ip: IpAddr = ip
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::InvalidValue("Address", s.to_owned()))?;
                let cidr: u8 = cidr
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::InvalidValue("Address", s.to_owned()))?;
                if cidr > Self::max_cidr(&ip) {
                    return Err(ParseError::InvalidValue("Address", s.to_owned()));
                }
                (ip, cidr)
            }
            None => {
                let ip: IpAddr = s
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::InvalidValue("Address", s.to_owned()))?;
                (ip, Self::max_cidr(&ip))
            }
        };
        Ok(Self { ip, cidr })
    }
}

/// Routing-table selector for route synchronization.
///
/// `Main` manages the main table, `Off` disables route sync entirely and
/// `Id` targets a specific table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteTable {
    #[default]
    Main,
    Off,
    Id(u32),
}

impl FromStr for RouteTable {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "off" => Ok(Self::Off),
            "auto" | "main" => Ok(Self::Main),
            other => other
                .parse::<u32>()
                .map(Self::Id)
                .map_err(|_| ParseError::InvalidValue("Table", other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
    pub allowed_ips: Vec<IpNetwork>,
}

impl Peer {
    fn new(public_key: Key) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            allowed_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub private_key: Key,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub mtu: Option<u32>,
    pub address: Vec<IpAddrMask>,
    pub dns: Vec<IpAddr>,
    pub table: RouteTable,
    pub route_protocol: Option<u8>,
    pub route_metric: Option<u32>,
    pub address_label: Option<String>,
    pub pre_up: Vec<String>,
    pub post_up: Vec<String>,
    pub pre_down: Vec<String>,
    pub post_down: Vec<String>,
    pub wg_bin: Option<PathBuf>,
    pub peers: Vec<Peer>,
}

impl InterfaceConfig {
    pub fn effective_mtu(&self) -> u32 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }

    pub fn peer_mut(&mut self, key: &Key) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.public_key == *key)
    }
}

/// Parser output: the config plus the textual endpoint of every peer.
///
/// Endpoints are not resolved yet; [`load`] turns them into socket
/// addresses and splits off the unresolved-endpoint table.
#[derive(Debug)]
pub struct ParsedConfig {
    pub interface: InterfaceConfig,
    pub endpoints: HashMap<Key, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("line {0}: expected `key = value`")]
    MalformedLine(usize),
    #[error("line {0}: unknown section `{1}`")]
    UnknownSection(usize, String),
    #[error("line {0}: key `{1}` outside of any section")]
    KeyOutsideSection(usize, String),
    #[error("line {line}: unknown key `{key}` in [{section}]")]
    UnknownKey {
        line: usize,
        section: &'static str,
        key: String,
    },
    #[error("invalid {0} value `{1}`")]
    InvalidValue(&'static str, String),
    #[error("invalid key: {0}")]
    Key(#[from] crate::key::InvalidKey),
    #[error("[Interface] section is missing a PrivateKey")]
    MissingPrivateKey,
    #[error("[Peer] section is missing a PublicKey")]
    MissingPublicKey,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("failed to resolve endpoint `{endpoint}`: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: resolver::Error,
    },
    #[error("invalid interface pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

enum Section {
    None,
    Interface,
    Peer,
}

struct Builder {
    private_key: Option<Key>,
    interface: InterfaceConfig,
    endpoints: HashMap<Key, String>,
    current_peer: Option<(Option<Key>, Peer, Option<String>)>,
}

impl Builder {
    fn new() -> Self {
        Self {
            private_key: None,
            interface: InterfaceConfig {
                // placeholder until the [Interface] section is parsed
                private_key: Key::new([0; 32]),
                listen_port: None,
                fwmark: None,
                mtu: None,
                address: Vec::new(),
                dns: Vec::new(),
                table: RouteTable::default(),
                route_protocol: None,
                route_metric: None,
                address_label: None,
                pre_up: Vec::new(),
                post_up: Vec::new(),
                pre_down: Vec::new(),
                post_down: Vec::new(),
                wg_bin: None,
                peers: Vec::new(),
            },
            endpoints: HashMap::new(),
            current_peer: None,
        }
    }

    fn begin_peer(&mut self) -> Result<(), ParseError> {
        self.flush_peer()?;
        self.current_peer = Some((None, Peer::new(Key::new([0; 32])), None));
        Ok(())
    }

    fn flush_peer(&mut self) -> Result<(), ParseError> {
        if let Some((key, mut peer, endpoint)) = self.current_peer.take() {
            let key = key.ok_or(ParseError::MissingPublicKey)?;
            peer.public_key = key;
            if let Some(endpoint) = endpoint {
                self.endpoints.insert(key, endpoint);
            }
            self.interface.peers.push(peer);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<ParsedConfig, ParseError> {
        self.flush_peer()?;
        self.interface.private_key = self.private_key.ok_or(ParseError::MissingPrivateKey)?;
        Ok(ParsedConfig {
            interface: self.interface,
            endpoints: self.endpoints,
        })
    }
}

/// Parses the `wg-quick` INI dialect.
pub fn parse(input: &str) -> Result<ParsedConfig, ParseError> {
    let mut builder = Builder::new();
    let mut section = Section::None;

    for (idx, raw) in input.lines().enumerate() {
        let lineno = idx + 1;
        let line = match raw.split_once(['#', ';']) {
            Some((before, _)) => before.trim(),
            None => raw.trim(),
        };
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') {
            let name = line
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
                .ok_or(ParseError::MalformedLine(lineno))?;
            section = match name.to_ascii_lowercase().as_str() {
                "interface" => Section::Interface,
                "peer" => {
                    builder.begin_peer()?;
                    Section::Peer
                }
                other => return Err(ParseError::UnknownSection(lineno, other.to_owned())),
            };
            continue;
        }

        let (key, value) = line.split_once('=').ok_or(ParseError::MalformedLine(lineno))?;
        let key = key.trim();
        let value = value.trim();

        match section {
            Section::None => return Err(ParseError::KeyOutsideSection(lineno, key.to_owned())),
            Section::Interface => interface_key(&mut builder, lineno, key, value)?,
            Section::Peer => peer_key(&mut builder, lineno, key, value)?,
        }
    }

    builder.finish()
}

fn interface_key(
    builder: &mut Builder,
    lineno: usize,
    key: &str,
    value: &str,
) -> Result<(), ParseError> {
    let iface = &mut builder.interface;
    match key.to_ascii_lowercase().as_str() {
        "privatekey" => builder.private_key = Some(value.parse()?),
        "listenport" => {
            iface.listen_port = Some(
                value
                    .parse()
                    .map_err(|_| ParseError::InvalidValue("ListenPort", value.to_owned()))?,
            )
        }
        "fwmark" => {
            iface.fwmark = Some(
                parse_u32(value)
                    .ok_or_else(|| ParseError::InvalidValue("FwMark", value.to_owned()))?,
            )
        }
        "mtu" => {
            let mtu: u32 = value
                .parse()
                .ok()
                .filter(|mtu| *mtu > 0)
                .ok_or_else(|| ParseError::InvalidValue("MTU", value.to_owned()))?;
            iface.mtu = Some(mtu);
        }
        "address" => {
            for part in value.split(',') {
                iface.address.push(part.trim().parse()?);
            }
        }
        "dns" => {
            for part in value.split(',') {
                let addr = part
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::InvalidValue("DNS", part.trim().to_owned()))?;
                iface.dns.push(addr);
            }
        }
        "table" => iface.table = value.parse()?,
        "routeprotocol" => {
            iface.route_protocol = Some(
                value
                    .parse()
                    .map_err(|_| ParseError::InvalidValue("RouteProtocol", value.to_owned()))?,
            )
        }
        "routemetric" => {
            iface.route_metric = Some(
                value
                    .parse()
                    .map_err(|_| ParseError::InvalidValue("RouteMetric", value.to_owned()))?,
            )
        }
        "addresslabel" => iface.address_label = Some(value.to_owned()),
        "preup" => iface.pre_up.push(value.to_owned()),
        "postup" => iface.post_up.push(value.to_owned()),
        "predown" => iface.pre_down.push(value.to_owned()),
        "postdown" => iface.post_down.push(value.to_owned()),
        "wgbin" => iface.wg_bin = Some(PathBuf::from(value)),
        _ => {
            return Err(ParseError::UnknownKey {
                line: lineno,
                section: "Interface",
                key: key.to_owned(),
            })
        }
    }
    Ok(())
}

fn peer_key(
    builder: &mut Builder,
    lineno: usize,
    key: &str,
    value: &str,
) -> Result<(), ParseError> {
    let (public_key, peer, endpoint) = builder
        .current_peer
        .as_mut()
        .expect("peer section always has a current peer");
    match key.to_ascii_lowercase().as_str() {
        "publickey" => *public_key = Some(value.parse()?),
        "presharedkey" => peer.preshared_key = Some(value.parse()?),
        "endpoint" => *endpoint = Some(value.to_owned()),
        "persistentkeepalive" => {
            peer.persistent_keepalive = match value {
                "off" | "0" => None,
                _ => Some(
                    value.parse().map_err(|_| {
                        ParseError::InvalidValue("PersistentKeepalive", value.to_owned())
                    })?,
                ),
            }
        }
        "allowedips" => {
            for part in value.split(',') {
                peer.allowed_ips.push(parse_allowed_ip(part.trim())?);
            }
        }
        _ => {
            return Err(ParseError::UnknownKey {
                line: lineno,
                section: "Peer",
                key: key.to_owned(),
            })
        }
    }
    Ok(())
}

fn parse_allowed_ip(s: &str) -> Result<IpNetwork, ParseError> {
    let mask: IpAddrMask = s.parse()?;
    // wg-quick masks off host bits rather than rejecting them
    IpNetwork::new_truncate(mask.ip, mask.cidr)
        .map_err(|_| ParseError::InvalidValue("AllowedIPs", s.to_owned()))
}

fn parse_u32(value: &str) -> Option<u32> {
    if let Some(hex) = value.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// A fully loaded interface: resolved config plus the frozen
/// unresolved-endpoint table.
#[derive(Debug)]
pub struct Loaded {
    pub config: InterfaceConfig,
    pub unresolved: HashMap<Key, String>,
}

pub fn config_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.conf"))
}

/// Reads and parses `<dir>/<name>.conf`, applies daemon defaults and
/// resolves peer endpoints through `resolver`.
pub async fn load<R: ResolveEndpoint>(
    dir: &Path,
    name: &str,
    resolver: &R,
    defaults: &WireguardDefaults,
) -> Result<Loaded, LoadError> {
    let path = config_path(dir, name);
    let input = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| LoadError::Read { path, source })?;
    let parsed = parse(&input)?;
    finish(parsed, resolver, defaults).await
}

async fn finish<R: ResolveEndpoint>(
    parsed: ParsedConfig,
    resolver: &R,
    defaults: &WireguardDefaults,
) -> Result<Loaded, LoadError> {
    let ParsedConfig {
        mut interface,
        endpoints,
    } = parsed;

    if interface.mtu.is_none() {
        interface.mtu = Some(defaults.mtu);
    }
    if defaults.random_port && interface.listen_port.is_none() {
        interface.listen_port = Some(0);
    }

    let mut unresolved = HashMap::new();
    for (key, text) in endpoints {
        let addr = resolver
            .resolve_udp_addr(&text)
            .await
            .map_err(|source| LoadError::Endpoint {
                endpoint: text.clone(),
                source,
            })?;
        if !resolver::is_literal_endpoint(&text) {
            unresolved.insert(key, text);
        }
        if let Some(peer) = interface.peer_mut(&key) {
            peer.endpoint = Some(addr);
        }
    }

    Ok(Loaded {
        config: interface,
        unresolved,
    })
}

/// Lists the interface names with a `.conf` file in `dir`, sorted.
pub fn list_interfaces(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("conf") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Applies the daemon's only/skip interface filter.
pub fn filter_interfaces(names: Vec<String>, only: &[String], skip: &[String]) -> Vec<String> {
    names
        .into_iter()
        .filter(|name| only.is_empty() || only.iter().any(|o| o == name))
        .filter(|name| !skip.iter().any(|s| s == name))
        .collect()
}

/// Matches configured interface names against a CLI pattern anchored as
/// `^pattern$`.
pub fn matching_interfaces(dir: &Path, pattern: &str) -> Result<Vec<String>, LoadError> {
    let re = regex::Regex::new(&format!("^{pattern}$")).map_err(|source| LoadError::Pattern {
        pattern: pattern.to_owned(),
        source,
    })?;
    let names = list_interfaces(dir).unwrap_or_default();
    Ok(names.into_iter().filter(|n| re.is_match(n)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
# demo interface
[Interface]
PrivateKey = LlaygSDSany5T+/ft9TcaLlk83gGKrFc1gcG8VWAxtM=
ListenPort = 51820
FwMark = 0x8000
MTU = 1280
Address = 10.11.0.2/24, fd00:11::2/64
DNS = 10.11.0.1
Table = 200
RouteProtocol = 57
RouteMetric = 100
AddressLabel = steward
PreUp = echo pre %i
PostUp = echo post %i
PostDown = echo bye

[Peer]
PublicKey = SBGX26d2F9aECQ7zMD4nUu90T3gPZvNzTara/iS2CW4=
PresharedKey = dk5wF6ddw4IolWSxtwhIrghD753KdQRmg0m+DwkFgDo=
Endpoint = vpn.example.net:51820
PersistentKeepalive = 25
AllowedIPs = 10.11.0.0/24, 0.0.0.0/0

[Peer]
PublicKey = dk5wF6ddw4IolWSxtwhIrghD753KdQRmg0m+DwkFgDo=
Endpoint = 198.51.100.7:51820
AllowedIPs = 10.12.0.0/24
"#;

    #[test]
    fn parses_full_config() {
        let parsed = parse(FULL).unwrap();
        let iface = &parsed.interface;

        assert_eq!(iface.listen_port, Some(51820));
        assert_eq!(iface.fwmark, Some(0x8000));
        assert_eq!(iface.mtu, Some(1280));
        assert_eq!(iface.address.len(), 2);
        assert_eq!(iface.address[0].to_string(), "10.11.0.2/24");
        assert_eq!(iface.dns, vec!["10.11.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(iface.table, RouteTable::Id(200));
        assert_eq!(iface.route_protocol, Some(57));
        assert_eq!(iface.route_metric, Some(100));
        assert_eq!(iface.address_label.as_deref(), Some("steward"));
        assert_eq!(iface.pre_up, vec!["echo pre %i".to_owned()]);
        assert_eq!(iface.peers.len(), 2);

        let peer = &iface.peers[0];
        assert_eq!(peer.persistent_keepalive, Some(25));
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(parsed.endpoints[&peer.public_key], "vpn.example.net:51820");
    }

    #[test]
    fn defaults_are_conservative() {
        let input = "[Interface]\nPrivateKey = LlaygSDSany5T+/ft9TcaLlk83gGKrFc1gcG8VWAxtM=\n";
        let parsed = parse(input).unwrap();
        let iface = &parsed.interface;

        assert_eq!(iface.listen_port, None);
        assert_eq!(iface.mtu, None);
        assert_eq!(iface.table, RouteTable::Main);
        assert!(iface.peers.is_empty());
        assert_eq!(iface.effective_mtu(), DEFAULT_MTU);
    }

    #[test]
    fn table_off_disables_route_sync() {
        let input = "[Interface]\nPrivateKey = LlaygSDSany5T+/ft9TcaLlk83gGKrFc1gcG8VWAxtM=\nTable = off\n";
        let parsed = parse(input).unwrap();
        assert_eq!(parsed.interface.table, RouteTable::Off);
    }

    #[test]
    fn allowed_ips_are_truncated_to_networks() {
        let input = "[Interface]\nPrivateKey = LlaygSDSany5T+/ft9TcaLlk83gGKrFc1gcG8VWAxtM=\n\
                     [Peer]\nPublicKey = SBGX26d2F9aECQ7zMD4nUu90T3gPZvNzTara/iS2CW4=\nAllowedIPs = 10.0.0.5/24\n";
        let parsed = parse(input).unwrap();
        let net = parsed.interface.peers[0].allowed_ips[0];
        assert_eq!(net.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn rejects_unknown_keys() {
        let input = "[Interface]\nPrivateKey = LlaygSDSany5T+/ft9TcaLlk83gGKrFc1gcG8VWAxtM=\nBogus = 1\n";
        assert!(matches!(
            parse(input),
            Err(ParseError::UnknownKey { key, .. }) if key == "Bogus"
        ));
    }

    #[test]
    fn rejects_peer_without_public_key() {
        let input = "[Interface]\nPrivateKey = LlaygSDSany5T+/ft9TcaLlk83gGKrFc1gcG8VWAxtM=\n[Peer]\nAllowedIPs = 10.0.0.0/24\n";
        assert!(matches!(parse(input), Err(ParseError::MissingPublicKey)));
    }

    #[test]
    fn missing_private_key_is_an_error() {
        assert!(matches!(parse(""), Err(ParseError::MissingPrivateKey)));
    }

    #[test]
    fn filter_applies_only_then_skip() {
        let names = vec!["wg0".to_owned(), "wg1".to_owned(), "wg2".to_owned()];
        let only = vec!["wg0".to_owned(), "wg1".to_owned()];
        let skip = vec!["wg1".to_owned()];
        assert_eq!(filter_interfaces(names, &only, &skip), vec!["wg0".to_owned()]);
    }
}
