//! WireGuard device configuration over generic netlink.

use std::net::SocketAddr;
use std::time::SystemTime;

use futures::StreamExt as _;
use ip_network::IpNetwork;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_generic::GenlMessage;
use netlink_packet_wireguard::constants::{
    AF_INET, AF_INET6, WGDEVICE_F_REPLACE_PEERS, WGPEER_F_REPLACE_ALLOWEDIPS,
};
use netlink_packet_wireguard::nlas::{WgAllowedIp, WgAllowedIpAttrs, WgDeviceAttrs, WgPeer, WgPeerAttrs};
use netlink_packet_wireguard::{Wireguard, WireguardCmd};

use super::{DeviceManager, Error};
use crate::key::Key;
use crate::quick::config::InterfaceConfig;

/// Live peer state as reported by the kernel.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub public_key: Key,
    pub endpoint: Option<SocketAddr>,
    /// `None` until the first handshake completes.
    pub last_handshake: Option<SystemTime>,
}

impl DeviceManager {
    /// Reads the peer list of a device: endpoint and handshake freshness per
    /// public key.
    pub async fn peer_status(&self, name: &str) -> Result<Vec<PeerSnapshot>, Error> {
        let genlmsg = GenlMessage::from_payload(Wireguard {
            cmd: WireguardCmd::GetDevice,
            nlas: vec![WgDeviceAttrs::IfName(name.to_owned())],
        });
        let mut nlmsg = NetlinkMessage::from(genlmsg);
        nlmsg.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut handle = self.genl.clone();
        let mut responses = handle
            .request(nlmsg)
            .await
            .map_err(|err| Error::Wireguard(err.to_string()))?;

        let mut peers = Vec::new();
        while let Some(result) = responses.next().await {
            let message = result.map_err(|err| Error::Wireguard(err.to_string()))?;
            match message.payload {
                NetlinkPayload::InnerMessage(genl) => {
                    for nla in genl.payload.nlas {
                        if let WgDeviceAttrs::Peers(list) = nla {
                            peers.extend(list.into_iter().filter_map(parse_peer));
                        }
                    }
                }
                NetlinkPayload::Error(err) => {
                    return Err(match err.raw_code() {
                        code if code == -libc::ENODEV => Error::LinkNotFound(name.to_owned()),
                        _ => Error::Wireguard(err.to_string()),
                    });
                }
                _ => {}
            }
        }
        Ok(peers)
    }

    /// Pushes private key, listen port, fwmark and the peer list onto the
    /// device. With `replace_peers` the kernel drops peers absent from the
    /// list (full sync); without it, listed peers are created or updated in
    /// place.
    pub async fn configure_device(
        &self,
        name: &str,
        config: &InterfaceConfig,
        replace_peers: bool,
    ) -> Result<(), Error> {
        let mut nlas = vec![
            WgDeviceAttrs::IfName(name.to_owned()),
            WgDeviceAttrs::PrivateKey(*config.private_key.as_bytes()),
        ];
        if replace_peers {
            nlas.push(WgDeviceAttrs::Flags(WGDEVICE_F_REPLACE_PEERS));
        }
        if let Some(port) = config.listen_port {
            nlas.push(WgDeviceAttrs::ListenPort(port));
        }
        if let Some(fwmark) = config.fwmark {
            nlas.push(WgDeviceAttrs::Fwmark(fwmark));
        }

        let peers = config
            .peers
            .iter()
            .map(|peer| {
                let mut attrs = vec![WgPeerAttrs::PublicKey(*peer.public_key.as_bytes())];
                if replace_peers {
                    attrs.push(WgPeerAttrs::Flags(WGPEER_F_REPLACE_ALLOWEDIPS));
                }
                if let Some(psk) = &peer.preshared_key {
                    attrs.push(WgPeerAttrs::PresharedKey(*psk.as_bytes()));
                }
                if let Some(endpoint) = peer.endpoint {
                    attrs.push(WgPeerAttrs::Endpoint(endpoint));
                }
                if let Some(keepalive) = peer.persistent_keepalive {
                    attrs.push(WgPeerAttrs::PersistentKeepalive(keepalive));
                }
                let allowed = peer.allowed_ips.iter().map(allowed_ip).collect();
                attrs.push(WgPeerAttrs::AllowedIps(allowed));
                WgPeer(attrs)
            })
            .collect();
        nlas.push(WgDeviceAttrs::Peers(peers));

        let genlmsg = GenlMessage::from_payload(Wireguard {
            cmd: WireguardCmd::SetDevice,
            nlas,
        });
        let mut nlmsg = NetlinkMessage::from(genlmsg);
        nlmsg.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        let mut handle = self.genl.clone();
        let mut responses = handle
            .request(nlmsg)
            .await
            .map_err(|err| Error::Wireguard(err.to_string()))?;

        while let Some(result) = responses.next().await {
            let message = result.map_err(|err| Error::Wireguard(err.to_string()))?;
            if let NetlinkPayload::Error(err) = message.payload {
                match err.raw_code() {
                    0 => {}
                    code if code == -libc::ENODEV => {
                        return Err(Error::LinkNotFound(name.to_owned()))
                    }
                    _ => return Err(Error::Wireguard(err.to_string())),
                }
            }
        }
        Ok(())
    }
}

fn allowed_ip(network: &IpNetwork) -> WgAllowedIp {
    let family = match network {
        IpNetwork::V4(_) => AF_INET,
        IpNetwork::V6(_) => AF_INET6,
    };
    WgAllowedIp(vec![
        WgAllowedIpAttrs::Family(family),
        WgAllowedIpAttrs::IpAddr(network.network_address()),
        WgAllowedIpAttrs::Cidr(network.netmask()),
    ])
}

fn parse_peer(peer: WgPeer) -> Option<PeerSnapshot> {
    let mut public_key = None;
    let mut endpoint = None;
    let mut last_handshake = None;

    for attr in peer.0 {
        match attr {
            WgPeerAttrs::PublicKey(key) => public_key = Some(Key::new(key)),
            WgPeerAttrs::Endpoint(addr) => endpoint = Some(addr),
            WgPeerAttrs::LastHandshake(time) => {
                // the kernel reports the epoch for peers that never shook hands
                if time != SystemTime::UNIX_EPOCH {
                    last_handshake = Some(time);
                }
            }
            _ => {}
        }
    }

    Some(PeerSnapshot {
        public_key: public_key?,
        endpoint,
        last_handshake,
    })
}
