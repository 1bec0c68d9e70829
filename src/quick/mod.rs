//! Bring-up, tear-down and idempotent synchronization of one interface,
//! the `wg-quick` equivalent surface.
//!
//! `sync` reconciles kernel state with a parsed config in four steps: link,
//! wireguard device, addresses, routes. Routes are fenced by protocol so
//! that entries owned by anything else are never touched.

pub mod config;

use std::collections::HashSet;
use std::process::Stdio;

use rtnetlink::IpVersion;
use tokio::io::AsyncWriteExt as _;

use crate::device::{self, DeviceManager, WantedRoute, PROTO_BOOT, TABLE_MAIN};
use crate::quick::config::{InterfaceConfig, RouteTable};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("interface `{0}` is already up")]
    AlreadyExists(String),
    #[error("hook `{command}` failed: {output}")]
    Hook { command: String, output: String },
    #[error(transparent)]
    Device(#[from] device::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Brings an interface up: DNS entries, `PreUp` hooks, full sync, `PostUp`
/// hooks. Refuses to touch a link that already exists; in that case no hook
/// is executed.
pub async fn up(mgr: &DeviceManager, cfg: &InterfaceConfig, name: &str) -> Result<(), Error> {
    if mgr.link_index(name).await?.is_some() {
        return Err(Error::AlreadyExists(name.to_owned()));
    }

    for dns in &cfg.dns {
        exec_sh(
            "resolvconf -a tun.%i -m 0 -x",
            name,
            Some(format!("nameserver {dns}\n")),
        )
        .await?;
    }

    for command in &cfg.pre_up {
        exec_sh(command, name, None).await?;
    }
    if !cfg.pre_up.is_empty() {
        tracing::info!(iface = %name, "applied pre-up commands");
    }

    sync(mgr, cfg, name).await?;

    for command in &cfg.post_up {
        exec_sh(command, name, None).await?;
    }
    if !cfg.post_up.is_empty() {
        tracing::info!(iface = %name, "applied post-up commands");
    }

    Ok(())
}

/// Tears an interface down: DNS entries, `PreDown` hooks, link deletion,
/// `PostDown` hooks.
pub async fn down(mgr: &DeviceManager, cfg: &InterfaceConfig, name: &str) -> Result<(), Error> {
    if mgr.link_index(name).await?.is_none() {
        return Err(Error::Device(device::Error::LinkNotFound(name.to_owned())));
    }

    if cfg.dns.len() >= 2 {
        exec_sh("resolvconf -d tun.%i", name, None).await?;
    }

    for command in &cfg.pre_down {
        exec_sh(command, name, None).await?;
    }
    if !cfg.pre_down.is_empty() {
        tracing::info!(iface = %name, "applied pre-down commands");
    }

    mgr.delete_link(name).await?;
    tracing::info!(iface = %name, "link deleted");

    for command in &cfg.post_down {
        exec_sh(command, name, None).await?;
    }
    if !cfg.post_down.is_empty() {
        tracing::info!(iface = %name, "applied post-down commands");
    }

    Ok(())
}

/// `down` followed by `up`; a link that is not up yet only logs.
pub async fn bounce(mgr: &DeviceManager, cfg: &InterfaceConfig, name: &str) -> Result<(), Error> {
    match down(mgr, cfg, name).await {
        Ok(()) => {}
        Err(Error::Device(device::Error::LinkNotFound(_))) => {
            tracing::info!(iface = %name, "interface not up, skipping down");
        }
        Err(err) => return Err(err),
    }
    up(mgr, cfg, name).await
}

/// Reconciles the complete kernel state of one interface with its config.
pub async fn sync(mgr: &DeviceManager, cfg: &InterfaceConfig, name: &str) -> Result<(), Error> {
    let index = sync_link(mgr, cfg, name).await?;
    tracing::debug!(iface = %name, index, "synced link");

    sync_device(mgr, cfg, name).await?;
    tracing::debug!(iface = %name, "synced wireguard device");

    sync_address(mgr, cfg, name, index).await?;
    tracing::debug!(iface = %name, "synced addresses");

    if cfg.table == RouteTable::Off {
        tracing::debug!(iface = %name, "Table=off, skipping route sync");
    } else {
        sync_routes(mgr, cfg, name, index).await?;
        tracing::debug!(iface = %name, "synced routes");
    }

    tracing::info!(iface = %name, "synced interface");
    Ok(())
}

/// The wireguard-only subset of [`sync`]: pushes keys, port, fwmark and the
/// full peer list without touching link, addresses or routes.
pub async fn sync_device(
    mgr: &DeviceManager,
    cfg: &InterfaceConfig,
    name: &str,
) -> Result<(), Error> {
    mgr.configure_device(name, cfg, true).await?;
    Ok(())
}

/// Makes sure the link exists (creating it via netlink or the configured
/// helper) and is up. Returns the link index.
async fn sync_link(mgr: &DeviceManager, cfg: &InterfaceConfig, name: &str) -> Result<u32, Error> {
    if mgr.link_index(name).await?.is_none() {
        tracing::info!(iface = %name, "link not found, creating");
        mgr.create_link(name, cfg.effective_mtu(), cfg.wg_bin.as_deref())
            .await?;
    }
    let index = mgr
        .link_index(name)
        .await?
        .ok_or_else(|| device::Error::LinkNotFound(name.to_owned()))?;
    mgr.set_link_up(name, index).await?;
    Ok(index)
}

/// Adds missing addresses and removes extraneous ones, both families.
async fn sync_address(
    mgr: &DeviceManager,
    cfg: &InterfaceConfig,
    name: &str,
    index: u32,
) -> Result<(), Error> {
    let current = mgr.list_addresses(index).await?;

    let mut present = HashSet::new();
    for message in &current {
        if let Some(addr) = device::address_of(message) {
            present.insert(addr);
        }
    }

    let wanted: HashSet<_> = cfg.address.iter().copied().collect();

    for addr in &cfg.address {
        if present.contains(addr) {
            tracing::debug!(iface = %name, %addr, "address present");
            continue;
        }
        mgr.add_address(index, *addr, cfg.address_label.as_deref())
            .await?;
        tracing::info!(iface = %name, %addr, "address added");
    }

    for message in current {
        let Some(addr) = device::address_of(&message) else {
            continue;
        };
        if wanted.contains(&addr) {
            continue;
        }
        mgr.delete_address(message).await?;
        tracing::info!(iface = %name, %addr, "address deleted");
    }

    Ok(())
}

/// Replaces every wanted route, then deletes routes on the link, in the same
/// table, owned by our route protocol, that are no longer wanted. Routes
/// with any other protocol belong to someone else and stay.
async fn sync_routes(
    mgr: &DeviceManager,
    cfg: &InterfaceConfig,
    name: &str,
    index: u32,
) -> Result<(), Error> {
    let wanted = wanted_routes(cfg);

    for route in &wanted {
        mgr.replace_route(index, route).await?;
        tracing::debug!(iface = %name, dst = %route.dst, table = route.table, protocol = route.protocol, "route replaced");
    }

    let table = effective_table(cfg.table);
    let protocol = cfg.route_protocol.unwrap_or(PROTO_BOOT);

    for version in [IpVersion::V4, IpVersion::V6] {
        for message in mgr.list_routes(index, version).await? {
            if device::route_table(&message) != table {
                continue;
            }
            if device::route_protocol(&message) != protocol {
                tracing::debug!(iface = %name, "route not owned by this daemon, skipping");
                continue;
            }
            let Some(dst) = device::route_destination(&message) else {
                continue;
            };
            let priority = device::route_priority(&message);
            let is_wanted = wanted.iter().any(|route| {
                route.dst == dst && route.metric.map_or(true, |metric| priority == Some(metric))
            });
            if is_wanted {
                continue;
            }
            mgr.delete_route(message).await?;
            tracing::info!(iface = %name, %dst, "route deleted");
        }
    }

    Ok(())
}

fn effective_table(table: RouteTable) -> u32 {
    match table {
        RouteTable::Main => TABLE_MAIN,
        RouteTable::Id(id) => id,
        RouteTable::Off => TABLE_MAIN,
    }
}

/// The union of all peers' allowed IPs as routes into this link, deduplicated,
/// with kernel defaults filled in (`main` table, `boot` protocol).
fn wanted_routes(cfg: &InterfaceConfig) -> Vec<WantedRoute> {
    let table = effective_table(cfg.table);
    let protocol = cfg.route_protocol.unwrap_or(PROTO_BOOT);

    let mut seen = HashSet::new();
    let mut routes = Vec::new();
    for peer in &cfg.peers {
        for dst in &peer.allowed_ips {
            if !seen.insert(*dst) {
                continue;
            }
            routes.push(WantedRoute {
                dst: *dst,
                table,
                protocol,
                metric: cfg.route_metric,
            });
        }
    }
    routes
}

/// Runs a hook command through `sh -ce` with `%i` replaced by the interface
/// name. The combined output is logged; a non-zero exit aborts the enclosing
/// operation.
async fn exec_sh(command: &str, iface: &str, stdin: Option<String>) -> Result<String, Error> {
    let rendered = command.replace("%i", iface);

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-ce")
        .arg(&rendered)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    if let Some(input) = stdin {
        let mut pipe = child.stdin.take().expect("stdin was requested above");
        pipe.write_all(input.as_bytes()).await?;
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    let combined = device::combined_output(&output);

    if !output.status.success() {
        tracing::error!(command = %rendered, output = %combined, "hook command failed");
        return Err(Error::Hook {
            command: rendered,
            output: combined,
        });
    }

    if combined.is_empty() {
        tracing::info!(command = %rendered, "executed hook");
    } else {
        tracing::info!(command = %rendered, output = %combined, "executed hook");
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::quick::config::{IpAddrMask, Peer};

    fn test_config() -> InterfaceConfig {
        InterfaceConfig {
            private_key: Key::new([1; 32]),
            listen_port: Some(51820),
            fwmark: None,
            mtu: None,
            address: vec![IpAddrMask::new("10.0.0.2".parse().unwrap(), 24)],
            dns: vec![],
            table: RouteTable::Main,
            route_protocol: None,
            route_metric: None,
            address_label: None,
            pre_up: vec![],
            post_up: vec![],
            pre_down: vec![],
            post_down: vec![],
            wg_bin: None,
            peers: vec![
                Peer {
                    public_key: Key::new([2; 32]),
                    preshared_key: None,
                    endpoint: Some("198.51.100.1:51820".parse().unwrap()),
                    persistent_keepalive: None,
                    allowed_ips: vec![
                        "10.0.0.0/24".parse().unwrap(),
                        "10.1.0.0/24".parse().unwrap(),
                    ],
                },
                Peer {
                    public_key: Key::new([3; 32]),
                    preshared_key: None,
                    endpoint: None,
                    persistent_keepalive: None,
                    allowed_ips: vec!["10.0.0.0/24".parse().unwrap()],
                },
            ],
        }
    }

    #[test]
    fn wanted_routes_fill_kernel_defaults() {
        let routes = wanted_routes(&test_config());

        // the duplicate 10.0.0.0/24 collapses into one route
        assert_eq!(routes.len(), 2);
        for route in &routes {
            assert_eq!(route.table, TABLE_MAIN);
            assert_eq!(route.protocol, PROTO_BOOT);
            assert_eq!(route.metric, None);
        }
    }

    #[test]
    fn wanted_routes_honor_explicit_attributes() {
        let mut cfg = test_config();
        cfg.table = RouteTable::Id(200);
        cfg.route_protocol = Some(57);
        cfg.route_metric = Some(100);

        let routes = wanted_routes(&cfg);
        for route in &routes {
            assert_eq!(route.table, 200);
            assert_eq!(route.protocol, 57);
            assert_eq!(route.metric, Some(100));
        }
    }

    #[tokio::test]
    async fn exec_sh_substitutes_interface_name() {
        let output = exec_sh("echo hook-%i", "wg7", None).await.unwrap();
        assert_eq!(output, "hook-wg7");
    }

    #[tokio::test]
    async fn exec_sh_feeds_stdin() {
        let output = exec_sh("cat", "wg0", Some("nameserver 10.0.0.1\n".to_owned()))
            .await
            .unwrap();
        assert_eq!(output, "nameserver 10.0.0.1");
    }

    #[tokio::test]
    async fn exec_sh_surfaces_failures() {
        let err = exec_sh("echo boom >&2; exit 3", "wg0", None)
            .await
            .unwrap_err();
        match err {
            Error::Hook { command, output } => {
                assert_eq!(command, "echo boom >&2; exit 3");
                assert_eq!(output, "boom");
            }
            other => panic!("expected hook error, got {other:?}"),
        }
    }
}
