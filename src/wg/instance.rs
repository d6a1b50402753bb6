use std::net::IpAddr;

use super::{
    Cidr, Key,
    peer::{Peer, RunningPeer},
};

#[derive(Default, Clone, PartialEq, Eq)]
pub struct Interface {
    // PrivateKey
    pub private_key: Option<Key>,

    // PublicKey
    pub public_key: Option<Key>,

    // Address
    pub address: Vec<Cidr>,

    // ListenPort
    pub listen_port: Option<u16>,

    // MTU
    pub mtu: Option<u32>,

    // Table
    pub table: Option<String>,

    // FwMark
    pub fw_mark: Option<String>,

    // SaveConfig
    pub save_conf: bool,

    // PreUp
    pub pre_up: Vec<String>,

    // PostUp
    pub post_up: Vec<String>,

    // PreDown
    pub pre_down: Vec<String>,

    // PostDown
    pub post_down: Vec<String>,

    // DNS
    pub dns: Vec<IpAddr>,

    pub peers: Vec<Peer>,
}

impl Interface {
    pub fn peer(&self, public_key: &Key) -> Option<&Peer> {
        self.peers.iter().find(|x| &x.public_key == public_key)
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .field("listen_port", &self.listen_port)
            .field("mtu", &self.mtu)
            .field("table", &self.table)
            .field("fw_mark", &self.fw_mark)
            .field("save_conf", &self.save_conf)
            .field("dns", &self.dns)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

/// Interface as reported by the device.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct RunningInterface {
    pub private_key: Option<Key>,
    pub public_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub fw_mark: Option<String>,

    // filled from the address query, not from the dump
    pub address: Vec<Cidr>,

    pub peers: Vec<RunningPeer>,
}

impl RunningInterface {
    pub fn peer(&self, public_key: &Key) -> Option<&RunningPeer> {
        self.peers.iter().find(|x| &x.public_key == public_key)
    }
}

impl std::fmt::Debug for RunningInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningInterface")
            .field("public_key", &self.public_key)
            .field("listen_port", &self.listen_port)
            .field("fw_mark", &self.fw_mark)
            .field("address", &self.address)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

impl From<RunningInterface> for Interface {
    fn from(iface: RunningInterface) -> Self {
        Interface {
            private_key: iface.private_key,
            public_key: iface.public_key,
            address: iface.address,
            listen_port: iface.listen_port,
            fw_mark: iface.fw_mark,
            peers: iface.peers.into_iter().map(Peer::from).collect(),
            ..Default::default()
        }
    }
}
