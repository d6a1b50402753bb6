use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

use crate::error::Error;

use super::{
    Cidr, Endpoint, Keepalive, Key,
    instance::Interface,
    peer::Peer,
    shell::{Executor, Script},
};

pub const CLIENT_DNS: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
pub const CLIENT_MTU: u32 = 1420;
pub const CLIENT_KEEPALIVE: u32 = 20;

pub trait KeyDeriver {
    async fn derive_public_key(&self, private_key: &Key) -> Result<Key, Error>;
}

/// `wg pubkey`, fed through stdin.
#[derive(Debug, Default, Clone)]
pub struct WgKeyDeriver<E> {
    executor: E,
}

impl<E: Executor> WgKeyDeriver<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }
}

impl<E: Executor> KeyDeriver for WgKeyDeriver<E> {
    async fn derive_public_key(&self, private_key: &Key) -> Result<Key, Error> {
        let script = Script::new("wg pubkey").raw("<").secret(private_key);
        Ok(self.executor.run(&script).await?.parse()?)
    }
}

fn is_reserved(peers: &[Peer], addr: Ipv4Addr) -> bool {
    peers
        .iter()
        .flat_map(|x| &x.allowed_ips)
        .any(|x| x.contains(IpAddr::V4(addr)))
}

/// First free host after the interface's own address, scanning the
/// interface's IPv4 blocks in order.
pub fn allocate(interface: &Interface) -> Result<Cidr, Error> {
    for block in &interface.address {
        let (IpAddr::V4(own), Some((network, broadcast))) = (block.ip, block.v4_bounds()) else {
            continue;
        };

        // /31 and /32 have no network or broadcast address to skip
        let (first, last) = if block.mask >= 31 {
            (network, broadcast)
        } else {
            (network + 1, broadcast - 1)
        };

        let start = first.max(u32::from(own).saturating_add(1));
        if start > last {
            continue;
        }

        if let Some(host) = (start..=last)
            .map(Ipv4Addr::from)
            .find(|x| !is_reserved(&interface.peers, *x))
        {
            return Ok(Cidr::host(host));
        }
    }

    Err(Error::AddressesExhausted)
}

/// Builds new client configs against a server interface.
#[derive(Debug, Clone)]
pub struct Provisioner<K> {
    keys: K,
    server_ip: Ipv4Addr,
}

impl<K: KeyDeriver> Provisioner<K> {
    pub fn new(keys: K, server_ip: Ipv4Addr) -> Self {
        Self { keys, server_ip }
    }

    /// Key derivation failures carry tool output, which stays in the log.
    async fn derive(&self, name: &str, private_key: &Key) -> Result<Key, Error> {
        self.keys.derive_public_key(private_key).await.map_err(|err| {
            log::error!("{name}: public key derivation failed: {err}");
            Error::interface(name, "client is not created")
        })
    }

    async fn server_public_key(&self, name: &str, interface: &Interface) -> Result<Key, Error> {
        if let Some(key) = interface.public_key {
            return Ok(key);
        }

        let private_key = interface
            .private_key
            .ok_or_else(|| Error::interface(name, "interface has no key"))?;
        self.derive(name, &private_key).await
    }

    /// Returns the peer to add on the server and the client's own interface.
    pub async fn create_client(
        &self,
        name: &str,
        interface: &Interface,
    ) -> Result<(Peer, Interface), Error> {
        let listen_port = interface
            .listen_port
            .filter(|x| *x != 0)
            .ok_or_else(|| Error::interface(name, "interface has no listen port"))?;

        let address = allocate(interface)?;
        let server_key = self.server_public_key(name, interface).await?;

        let private_key = Key::random();
        let public_key = self.derive(name, &private_key).await?;

        let mut server = Peer::new(server_key);
        server.end_point = Some(Endpoint(SocketAddrV4::new(self.server_ip, listen_port)));
        server.allowed_ips = vec![Cidr {
            ip: Ipv4Addr::UNSPECIFIED.into(),
            mask: 0,
        }];
        server.keepalive = Some(Keepalive::new(CLIENT_KEEPALIVE)?);

        let client = Interface {
            private_key: Some(private_key),
            address: vec![address],
            dns: vec![CLIENT_DNS],
            mtu: Some(CLIENT_MTU),
            peers: vec![server],
            ..Default::default()
        };

        let mut peer = Peer::new(public_key);
        peer.allowed_ips = vec![address];

        log::info!("provisioned client {public_key} at {address} on {name}");
        Ok((peer, client))
    }
}
