use base64::prelude::*;
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddrV4},
    num::NonZeroU16,
    str::FromStr,
};

use crate::error::Error;
use instance::{Interface, RunningInterface};
use peer::{Peer, RunningPeer};

pub mod client;
pub mod cmd;
pub mod config;
pub mod dump;
pub mod firewall;
pub mod instance;
pub mod peer;
pub mod shell;
pub mod store;

const KEY_LEN: usize = 32;
const MAX_INTERFACE_NAME_LEN: usize = 15;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("base64 decode error: {0}")]
    Decode(#[from] base64::DecodeSliceError),

    #[error("key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listen_port must be in the range [0;65535], got {0}")]
    PortRange(u32),

    #[error("keepalive must be in the range [1;65535], got {0}")]
    KeepaliveRange(u32),

    #[error("end_point must match the format <ipv4>:<port>, got \"{0}\"")]
    Endpoint(String),

    #[error("incorrect address \"{0}\"")]
    Cidr(String),
}

/// Curve25519 key in its base64 text form.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key([u8; KEY_LEN]);

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // one spare byte so an over-long value is reported as a length error
        let mut inner = [0u8; KEY_LEN + 1];
        let len = BASE64_STANDARD.decode_slice(s.trim(), &mut inner)?;
        if len != KEY_LEN {
            return Err(KeyError::Length(len));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&inner[..KEY_LEN]);
        Ok(Key(key))
    }
}

impl Key {
    /// Fresh private key, clamped the way `wg genkey` clamps it.
    pub fn random() -> Key {
        let mut key: [u8; KEY_LEN] = rand::random();
        key[0] &= 248;
        key[31] &= 127;
        key[31] |= 64;
        Key(key)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({self})")
    }
}

/// Address with prefix length, e.g. `10.0.0.1/24`.
///
/// The host part is kept as written: `10.0.0.1/24` is the interface address
/// `10.0.0.1` inside the `10.0.0.0/24` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    pub ip: IpAddr,
    pub mask: u8,
}

impl Default for Cidr {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mask: 0,
        }
    }
}

impl Cidr {
    pub fn new(ip: IpAddr, mask: u8) -> Result<Self, ValidationError> {
        if mask > Self::width(&ip) {
            return Err(ValidationError::Cidr(format!("{ip}/{mask}")));
        }

        Ok(Self { ip, mask })
    }

    /// Single-address block (`/32`).
    pub fn host(ip: Ipv4Addr) -> Self {
        Self {
            ip: IpAddr::V4(ip),
            mask: 32,
        }
    }

    fn width(ip: &IpAddr) -> u8 {
        match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Whether `addr` lies inside the network this address belongs to.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.ip, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => (u32::from(net) ^ u32::from(addr))
                .checked_shr(32 - u32::from(self.mask))
                .unwrap_or(0)
                == 0,
            (IpAddr::V6(net), IpAddr::V6(addr)) => (u128::from(net) ^ u128::from(addr))
                .checked_shr(128 - u32::from(self.mask))
                .unwrap_or(0)
                == 0,
            _ => false,
        }
    }

    /// First and last address of the IPv4 network, `None` for IPv6.
    pub fn v4_bounds(&self) -> Option<(u32, u32)> {
        let IpAddr::V4(ip) = self.ip else {
            return None;
        };

        let host_bits = u32::MAX.checked_shr(u32::from(self.mask)).unwrap_or(0);
        let network = u32::from(ip) & !host_bits;
        Some((network, network | host_bits))
    }
}

impl FromStr for Cidr {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, mask) = s.split_once('/').unwrap_or((s, ""));
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| ValidationError::Cidr(s.to_string()))?;
        let mask = mask.trim();

        let mask = if mask.is_empty() {
            Self::width(&ip)
        } else {
            mask.parse()
                .map_err(|_| ValidationError::Cidr(s.to_string()))?
        };

        Self::new(ip, mask).map_err(|_| ValidationError::Cidr(s.to_string()))
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.mask)
    }
}

/// Peer endpoint, always `<ipv4>:<port>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint(pub SocketAddrV4);

impl FromStr for Endpoint {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::Endpoint(s.to_string());

        let (address, port) = s.split_once(':').ok_or_else(invalid)?;
        if address.is_empty() || port.is_empty() {
            return Err(invalid());
        }

        let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
        let port: u32 = port.parse().map_err(|_| invalid())?;

        Ok(Endpoint(SocketAddrV4::new(address, validate_port(port)?)))
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(v: SocketAddrV4) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persistent keepalive interval in seconds, 1..=65535.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Keepalive(NonZeroU16);

impl Keepalive {
    pub fn new(seconds: u32) -> Result<Self, ValidationError> {
        u16::try_from(seconds)
            .ok()
            .and_then(NonZeroU16::new)
            .map(Keepalive)
            .ok_or(ValidationError::KeepaliveRange(seconds))
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl std::fmt::Display for Keepalive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listen ports cover the whole `u16` range, `0` meaning "pick one".
pub fn validate_port(port: u32) -> Result<u16, ValidationError> {
    u16::try_from(port).map_err(|_| ValidationError::PortRange(port))
}

/// Interface names end up in shell text and file paths, so this check runs
/// before either is built.
pub fn check_interface_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(Error::IncorrectInterfaceName(name.to_string()))
    }
}

/// Replace the peer with the same public key, or append it.
pub fn upsert_peer(peers: &mut Vec<Peer>, peer: Peer) {
    match peers.iter_mut().find(|x| x.public_key == peer.public_key) {
        Some(existing) => *existing = peer,
        None => peers.push(peer),
    }
}

/// Operations on the live device.
pub trait WireguardApi {
    type Error;

    async fn list_interfaces(&self) -> Result<Vec<String>, Self::Error>;
    async fn get_all(&self) -> Result<BTreeMap<String, RunningInterface>, Self::Error>;
    async fn get_by_name(&self, name: &str) -> Result<RunningInterface, Self::Error>;
    async fn get_status(&self, name: &str) -> Result<BTreeMap<Key, bool>, Self::Error>;
    async fn get_status_all(&self)
    -> Result<BTreeMap<String, BTreeMap<Key, bool>>, Self::Error>;
    async fn get_peers_pks(&self, name: &str) -> Result<Vec<Key>, Self::Error>;
    async fn get_peer(&self, name: &str, public_key: &Key) -> Result<RunningPeer, Self::Error>;

    async fn set_interface(&self, name: &str, interface: &Interface) -> Result<(), Self::Error>;
    async fn set_peer(&self, name: &str, peer: Peer) -> Result<(), Self::Error>;
    async fn remove_peer(&self, name: &str, public_key: &Key)
    -> Result<RunningPeer, Self::Error>;
    async fn disable_peer(&self, name: &str, public_key: &Key) -> Result<(), Self::Error>;
    async fn enable_peer(&self, name: &str, public_key: &Key) -> Result<(), Self::Error>;

    async fn start(&self, name: &str) -> Result<(), Self::Error>;
    async fn stop(&self, name: &str) -> Result<(), Self::Error>;
    async fn save_config(&self, name: &str) -> Result<(), Self::Error>;
    async fn sync_with_config(&self, name: &str) -> Result<(), Self::Error>;
}
