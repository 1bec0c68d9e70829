//! Kernel adapter: WireGuard links, addresses and routes over netlink.
//!
//! One rtnetlink connection and one generic-netlink connection are opened at
//! startup and shared for the lifetime of the process. All operations are
//! idempotent where the kernel semantics allow it: adding an existing
//! address or deleting a missing route is not an error.

mod wireguard;

pub use wireguard::PeerSnapshot;

use std::path::Path;
use std::process::Output;

use futures::TryStreamExt as _;
use ip_network::IpNetwork;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol,
};
use netlink_packet_route::AddressFamily;
use rtnetlink::{Error::NetlinkError, Handle, IpVersion};
use tokio::task::JoinHandle;

use crate::quick::config::IpAddrMask;

/// `RT_CLASS_MAIN`
pub const TABLE_MAIN: u32 = 254;
/// `RTPROT_BOOT`, the kernel default for manually added routes.
pub const PROTO_BOOT: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("link `{0}` already exists")]
    LinkExists(String),
    #[error("link `{0}` not found")]
    LinkNotFound(String),
    #[error("operation not permitted, the daemon needs CAP_NET_ADMIN")]
    NotPermitted(#[source] rtnetlink::Error),
    #[error("link helper `{bin}` failed: {output}")]
    Helper { bin: String, output: String },
    #[error("wireguard netlink request failed: {0}")]
    Wireguard(String),
    #[error(transparent)]
    Netlink(rtnetlink::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    fn from_netlink(link: &str, err: rtnetlink::Error) -> Self {
        match &err {
            NetlinkError(msg) if msg.raw_code() == -libc::EEXIST => {
                Error::LinkExists(link.to_owned())
            }
            NetlinkError(msg) if msg.raw_code() == -libc::ENODEV => {
                Error::LinkNotFound(link.to_owned())
            }
            NetlinkError(msg) if msg.raw_code() == -libc::EPERM => Error::NotPermitted(err),
            _ => Error::Netlink(err),
        }
    }
}

/// Shared netlink handles plus the connection tasks driving them.
pub struct DeviceManager {
    route: Handle,
    genl: genetlink::GenetlinkHandle,
    route_task: JoinHandle<()>,
    genl_task: JoinHandle<()>,
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.route_task.abort();
        self.genl_task.abort();
    }
}

impl DeviceManager {
    /// Opens both netlink connections.
    ///
    /// Must be called from within a tokio runtime; a failure here is fatal
    /// for the whole process.
    pub fn new() -> Result<Self, Error> {
        let (conn, route, _) = rtnetlink::new_connection()?;
        let route_task = tokio::spawn(conn);
        let (conn, genl, _) = genetlink::new_connection()?;
        let genl_task = tokio::spawn(conn);

        Ok(Self {
            route,
            genl,
            route_task,
            genl_task,
        })
    }

    /// Looks up a link index by name; `None` when the link does not exist.
    pub async fn link_index(&self, name: &str) -> Result<Option<u32>, Error> {
        let result = self
            .route
            .link()
            .get()
            .match_name(name.to_owned())
            .execute()
            .try_next()
            .await;
        match result {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            Err(NetlinkError(msg)) if msg.raw_code() == -libc::ENODEV => Ok(None),
            Err(err) => Err(Error::from_netlink(name, err)),
        }
    }

    /// Creates a `wireguard`-type link, either in-kernel or through an
    /// operator-supplied helper binary invoked as `<helper> <name>`.
    pub async fn create_link(
        &self,
        name: &str,
        mtu: u32,
        helper: Option<&Path>,
    ) -> Result<(), Error> {
        if self.link_index(name).await?.is_some() {
            return Err(Error::LinkExists(name.to_owned()));
        }

        match helper {
            Some(bin) => {
                tracing::info!(iface = %name, helper = %bin.display(), "creating link via helper");
                let output = tokio::process::Command::new(bin)
                    .arg(name)
                    .output()
                    .await?;
                if !output.status.success() {
                    return Err(Error::Helper {
                        bin: bin.display().to_string(),
                        output: combined_output(&output),
                    });
                }
                Ok(())
            }
            None => {
                let mut request = self.route.link().add().wireguard(name.to_owned());
                request
                    .message_mut()
                    .attributes
                    .push(LinkAttribute::Mtu(mtu));
                request
                    .execute()
                    .await
                    .map_err(|err| Error::from_netlink(name, err))
            }
        }
    }

    pub async fn set_link_up(&self, name: &str, index: u32) -> Result<(), Error> {
        self.route
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|err| Error::from_netlink(name, err))
    }

    pub async fn delete_link(&self, name: &str) -> Result<(), Error> {
        let index = self
            .link_index(name)
            .await?
            .ok_or_else(|| Error::LinkNotFound(name.to_owned()))?;
        self.route
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|err| Error::from_netlink(name, err))
    }

    pub async fn list_addresses(&self, index: u32) -> Result<Vec<AddressMessage>, Error> {
        self.route
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(Error::Netlink)
    }

    /// Adds an address; an already present address is treated as success.
    pub async fn add_address(
        &self,
        index: u32,
        addr: IpAddrMask,
        label: Option<&str>,
    ) -> Result<(), Error> {
        let mut request = self.route.address().add(index, addr.ip, addr.cidr);
        if let Some(label) = label {
            if addr.ip.is_ipv4() {
                request
                    .message_mut()
                    .attributes
                    .push(AddressAttribute::Label(label.to_owned()));
            }
        }
        match request.execute().await {
            Ok(()) => Ok(()),
            Err(NetlinkError(msg)) if msg.raw_code() == -libc::EEXIST => Ok(()),
            Err(err) => Err(Error::Netlink(err)),
        }
    }

    /// Deletes an address previously returned by [`Self::list_addresses`];
    /// a missing address is treated as success.
    pub async fn delete_address(&self, message: AddressMessage) -> Result<(), Error> {
        match self.route.address().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(NetlinkError(msg))
                if matches!(msg.raw_code(), code if code == -libc::ENOENT || code == -libc::EADDRNOTAVAIL) =>
            {
                Ok(())
            }
            Err(err) => Err(Error::Netlink(err)),
        }
    }

    /// Creates or updates a route (`NLM_F_REPLACE`).
    pub async fn replace_route(&self, index: u32, route: &WantedRoute) -> Result<(), Error> {
        let result = match route.dst {
            IpNetwork::V4(net) => {
                let mut request = self
                    .route
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(net.network_address(), net.netmask())
                    .output_interface(index)
                    .table_id(route.table)
                    .protocol(RouteProtocol::from(route.protocol))
                    .replace();
                if let Some(metric) = route.metric {
                    request = request.priority(metric);
                }
                request.execute().await
            }
            IpNetwork::V6(net) => {
                let mut request = self
                    .route
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(net.network_address(), net.netmask())
                    .output_interface(index)
                    .table_id(route.table)
                    .protocol(RouteProtocol::from(route.protocol))
                    .replace();
                if let Some(metric) = route.metric {
                    request = request.priority(metric);
                }
                request.execute().await
            }
        };
        result.map_err(Error::Netlink)
    }

    /// Routes of one family leaving through `index`.
    pub async fn list_routes(
        &self,
        index: u32,
        version: IpVersion,
    ) -> Result<Vec<RouteMessage>, Error> {
        let routes: Vec<RouteMessage> = self
            .route
            .route()
            .get(version)
            .execute()
            .try_collect()
            .await
            .map_err(Error::Netlink)?;
        Ok(routes
            .into_iter()
            .filter(|msg| route_oif(msg) == Some(index))
            .collect())
    }

    /// Deletes a route previously returned by [`Self::list_routes`]; a
    /// route that is already gone is treated as success.
    pub async fn delete_route(&self, message: RouteMessage) -> Result<(), Error> {
        match self.route.route().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(NetlinkError(msg))
                if matches!(msg.raw_code(), code if code == -libc::ENOENT || code == -libc::ESRCH) =>
            {
                Ok(())
            }
            Err(err) => Err(Error::Netlink(err)),
        }
    }
}

/// A route this daemon wants present, with kernel defaults already filled
/// in (`table` main, `protocol` boot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedRoute {
    pub dst: IpNetwork,
    pub table: u32,
    pub protocol: u8,
    pub metric: Option<u32>,
}

pub fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_owned()
}

pub fn address_of(message: &AddressMessage) -> Option<IpAddrMask> {
    let prefix = message.header.prefix_len;
    message.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(ip) => Some(IpAddrMask::new(*ip, prefix)),
        _ => None,
    })
}

pub fn route_destination(message: &RouteMessage) -> Option<IpNetwork> {
    let prefix = message.header.destination_prefix_length;
    let dst = message.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(std::net::IpAddr::V4(*ip)),
        RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(std::net::IpAddr::V6(*ip)),
        _ => None,
    });
    let dst = dst.or_else(|| {
        // default routes carry no destination attribute
        match message.header.address_family {
            AddressFamily::Inet => Some(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            AddressFamily::Inet6 => Some(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)),
            _ => None,
        }
    })?;
    IpNetwork::new_truncate(dst, prefix).ok()
}

pub fn route_oif(message: &RouteMessage) -> Option<u32> {
    message.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Oif(index) => Some(*index),
        _ => None,
    })
}

pub fn route_table(message: &RouteMessage) -> u32 {
    message
        .attributes
        .iter()
        .find_map(|attr| match attr {
            RouteAttribute::Table(table) => Some(*table),
            _ => None,
        })
        .unwrap_or(u32::from(message.header.table))
}

pub fn route_protocol(message: &RouteMessage) -> u8 {
    message.header.protocol.into()
}

pub fn route_priority(message: &RouteMessage) -> Option<u32> {
    message.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Priority(priority) => Some(*priority),
        _ => None,
    })
}
