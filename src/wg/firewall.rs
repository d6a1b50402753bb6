use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use serde::Deserialize;

use crate::error::Error;

use super::{
    Cidr,
    instance::RunningInterface,
    peer::Peer,
    shell::{Executor, Script},
};

pub const TABLE: &str = "wg-table";
pub const DISABLED_SET: &str = "disabled-peers";

/// Packet filter side of peer management. A peer is disabled while any of
/// its allowed-ip hosts is in the disabled set.
pub trait Firewall {
    async fn disabled_addresses(&self) -> Result<HashSet<IpAddr>, Error>;
    async fn disable_peer(&self, peer: &Peer) -> Result<(), Error>;
    async fn enable_peer(&self, peer: &Peer) -> Result<(), Error>;
    async fn get_interfaces_addresses(
        &self,
        names: &[&str],
    ) -> Result<HashMap<String, Vec<Cidr>>, Error>;

    async fn get_disabled_peers(
        &self,
        interfaces: &[&RunningInterface],
    ) -> Result<Vec<Peer>, Error> {
        if interfaces.is_empty() {
            return Ok(Vec::new());
        }

        let disabled = self.disabled_addresses().await?;
        Ok(interfaces
            .iter()
            .flat_map(|x| &x.peers)
            .filter(|peer| is_disabled(&peer.allowed_ips, &disabled))
            .cloned()
            .map(Peer::from)
            .collect())
    }
}

pub fn is_disabled(allowed_ips: &[Cidr], disabled: &HashSet<IpAddr>) -> bool {
    allowed_ips.iter().any(|x| disabled.contains(&x.ip))
}

#[derive(Debug, Deserialize)]
struct NftOutput {
    #[serde(default)]
    nftables: Vec<NftObject>,
}

#[derive(Debug, Deserialize)]
struct NftObject {
    set: Option<NftSet>,
}

#[derive(Debug, Deserialize)]
struct NftSet {
    table: String,
    name: String,
    #[serde(default)]
    elem: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: IpAddr,
    prefixlen: u8,
}

/// nftables set `inet wg-table disabled-peers` plus `ip -j` address lookups.
#[derive(Debug, Default, Clone)]
pub struct NftFirewall<E> {
    executor: E,
}

impl<E: Executor> NftFirewall<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    fn peer_hosts(peer: &Peer) -> Option<String> {
        if peer.allowed_ips.is_empty() {
            return None;
        }

        Some(
            peer.allowed_ips
                .iter()
                .map(|x| x.ip.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }

    async fn update_set(&self, action: &str, peer: &Peer) -> Result<(), Error> {
        let Some(hosts) = Self::peer_hosts(peer) else {
            return Ok(());
        };

        let script = Script::new("nft")
            .raw(action)
            .raw("element inet")
            .arg(TABLE)
            .arg(DISABLED_SET)
            .arg(format!("{{ {hosts} }}"));
        self.executor.run(&script).await?;

        log::info!("firewall: {action} {} ({hosts})", peer.public_key);
        Ok(())
    }
}

fn set_elements(data: &str) -> Result<HashSet<IpAddr>, Error> {
    if data.is_empty() {
        return Ok(HashSet::new());
    }

    let out: NftOutput = serde_json::from_str(data)?;
    Ok(out
        .nftables
        .into_iter()
        .filter_map(|x| x.set)
        .filter(|x| x.table == TABLE && x.name == DISABLED_SET)
        .flat_map(|x| x.elem)
        .filter_map(|x| x.as_str().and_then(|ip| ip.parse().ok()))
        .collect())
}

fn interface_addresses(data: &str, names: &[&str]) -> Result<HashMap<String, Vec<Cidr>>, Error> {
    if data.is_empty() {
        return Ok(HashMap::new());
    }

    let links: Vec<IpLink> = serde_json::from_str(data)?;
    let mut addresses: HashMap<String, Vec<Cidr>> = HashMap::new();

    for link in links.into_iter().filter(|x| names.contains(&x.ifname.as_str())) {
        let entry = addresses.entry(link.ifname).or_default();
        for addr in link.addr_info {
            entry.push(Cidr::new(addr.local, addr.prefixlen)?);
        }
    }

    Ok(addresses)
}

impl<E: Executor> Firewall for NftFirewall<E> {
    async fn disabled_addresses(&self) -> Result<HashSet<IpAddr>, Error> {
        let script = Script::new("nft --json list set inet")
            .arg(TABLE)
            .arg(DISABLED_SET);
        set_elements(&self.executor.run(&script).await?)
    }

    async fn disable_peer(&self, peer: &Peer) -> Result<(), Error> {
        self.update_set("add", peer).await
    }

    async fn enable_peer(&self, peer: &Peer) -> Result<(), Error> {
        self.update_set("delete", peer).await
    }

    async fn get_interfaces_addresses(
        &self,
        names: &[&str],
    ) -> Result<HashMap<String, Vec<Cidr>>, Error> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }

        let data = self.executor.run(&Script::new("ip -j -br a show")).await?;
        interface_addresses(&data, names)
    }
}
