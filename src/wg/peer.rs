use super::{Cidr, Endpoint, Key, Keepalive};

/// Handshakes younger than this mark a peer as connected.
pub const CONNECTION_WINDOW_SECS: u64 = 120;

#[derive(Clone, PartialEq, Eq)]
pub struct Peer {
    // PublicKey
    pub public_key: Key,

    // PresharedKey
    pub preshared_key: Option<Key>,

    // Endpoint
    pub end_point: Option<Endpoint>,

    // AllowedIPs
    pub allowed_ips: Vec<Cidr>,

    // PersistentKeepalive
    pub keepalive: Option<Keepalive>,
}

impl Peer {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            preshared_key: None,
            end_point: None,
            allowed_ips: Vec::new(),
            keepalive: None,
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("public_key", &self.public_key)
            .field("preshared_key", &self.preshared_key.map(|_| "<redacted>"))
            .field("end_point", &self.end_point)
            .field("allowed_ips", &self.allowed_ips)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RunningPeer {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub end_point: Option<Endpoint>,
    pub allowed_ips: Vec<Cidr>,
    pub keepalive: Option<Keepalive>,

    // LatestHandshake, unix seconds
    pub latest_handshake: Option<u64>,

    // Transfer
    pub transfer_rx: u64,
    pub transfer_tx: u64,

    pub connected: bool,

    // blocked by the firewall
    pub disabled: bool,
}

impl std::fmt::Debug for RunningPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPeer")
            .field("public_key", &self.public_key)
            .field("preshared_key", &self.preshared_key.map(|_| "<redacted>"))
            .field("end_point", &self.end_point)
            .field("allowed_ips", &self.allowed_ips)
            .field("keepalive", &self.keepalive)
            .field("latest_handshake", &self.latest_handshake)
            .field("transfer_rx", &self.transfer_rx)
            .field("transfer_tx", &self.transfer_tx)
            .field("connected", &self.connected)
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl From<RunningPeer> for Peer {
    fn from(peer: RunningPeer) -> Self {
        Peer {
            public_key: peer.public_key,
            preshared_key: peer.preshared_key,
            end_point: peer.end_point,
            allowed_ips: peer.allowed_ips,
            keepalive: peer.keepalive,
        }
    }
}

pub fn is_connected(latest_handshake: Option<u64>, now: u64) -> bool {
    match latest_handshake {
        Some(handshake) => now.saturating_sub(handshake) < CONNECTION_WINDOW_SECS,
        None => false,
    }
}
