//! Parsers for `wg show` output.
//!
//! `wg show all dump` prints one tab separated record per line, prefixed by
//! the interface name:
//!
//! ```text
//! wg0  <private-key>  <public-key>  <listen-port>  <fwmark>
//! wg0  <public-key>  <preshared-key>  <endpoint>  <allowed-ips>
//!      <latest-handshake>  <rx>  <tx>  <keepalive>
//! ```
//!
//! `wg show <name> dump` prints the same records without the name column.
//! The first record of an interface describes the interface, the rest its
//! peers.

use std::{collections::BTreeMap, str::FromStr, time::SystemTime};

use super::{
    Cidr, Endpoint, Keepalive, Key,
    instance::RunningInterface,
    peer::{RunningPeer, is_connected},
    validate_port,
};

const INTERFACE_FIELDS: usize = 4;
const PEER_FIELDS: usize = 8;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|x| x.as_secs())
        .unwrap_or_default()
}

fn prepare(value: &str) -> Option<&str> {
    match value.trim() {
        "(none)" | "" => None,
        value => Some(value),
    }
}

fn off(value: &str) -> Option<&str> {
    prepare(value).filter(|x| *x != "off")
}

fn parsed<T: FromStr>(field: &str, value: Option<&str>) -> Option<T> {
    let value = value?;
    match value.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("dump: ignoring {field} \"{value}\"");
            None
        }
    }
}

fn parse_interface(parts: &[&str]) -> RunningInterface {
    RunningInterface {
        private_key: parsed("private key", prepare(parts[0])),
        public_key: parsed("public key", prepare(parts[1])),
        listen_port: parsed::<u32>("listen port", prepare(parts[2]))
            .and_then(|x| validate_port(x).ok()),
        fw_mark: off(parts[3]).map(String::from),
        ..Default::default()
    }
}

fn handshake(value: &str) -> Option<u64> {
    parsed::<u64>("handshake", prepare(value))
        .filter(|x| *x != 0)
}

fn allowed_ips(value: &str) -> Vec<Cidr> {
    value
        .split(',')
        .filter_map(|ip| parsed::<Cidr>("allowed ip", Some(ip.trim())))
        .collect()
}

fn parse_peer(parts: &[&str], now: u64) -> Option<RunningPeer> {
    let public_key = parsed("public key", prepare(parts[0]))?;
    let latest_handshake = handshake(parts[4]);

    Some(RunningPeer {
        public_key,
        preshared_key: parsed("preshared key", prepare(parts[1])),
        end_point: parsed::<Endpoint>("endpoint", prepare(parts[2])),
        allowed_ips: prepare(parts[3]).map(allowed_ips).unwrap_or_default(),
        latest_handshake,
        transfer_rx: parsed("rx", prepare(parts[5])).unwrap_or_default(),
        transfer_tx: parsed("tx", prepare(parts[6])).unwrap_or_default(),
        keepalive: parsed::<u32>("keepalive", off(parts[7]))
            .and_then(|x| Keepalive::new(x).ok()),
        connected: is_connected(latest_handshake, now),
        disabled: false,
    })
}

fn records(data: &str) -> impl Iterator<Item = Vec<&str>> {
    data.lines()
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|x| x.split('\t').collect())
}

/// Parses `wg show all dump`.
pub fn parse_all(data: &str, now: u64) -> BTreeMap<String, RunningInterface> {
    let mut interfaces = BTreeMap::new();
    let mut current: Option<(&str, RunningInterface)> = None;

    for parts in records(data) {
        let Some((&name, fields)) = parts.split_first() else {
            continue;
        };

        if let Some((_, iface)) = current.as_mut().filter(|(curr, _)| *curr == name) {
            if fields.len() != PEER_FIELDS {
                log::warn!("dump: bad peer record for {name}");
                continue;
            }
            iface.peers.extend(parse_peer(fields, now));
            continue;
        }

        if fields.len() != INTERFACE_FIELDS {
            log::warn!("dump: bad interface record for {name}");
            continue;
        }
        if let Some((prev, iface)) = current.replace((name, parse_interface(fields))) {
            interfaces.insert(prev.to_string(), iface);
        }
    }

    if let Some((name, iface)) = current {
        interfaces.insert(name.to_string(), iface);
    }

    interfaces
}

/// Parses `wg show <name> dump`; `None` on empty output.
pub fn parse_one(data: &str, now: u64) -> Option<RunningInterface> {
    let mut interface: Option<RunningInterface> = None;

    for parts in records(data) {
        match &mut interface {
            Some(iface) => {
                if parts.len() != PEER_FIELDS {
                    log::warn!("dump: bad peer record");
                    continue;
                }
                iface.peers.extend(parse_peer(&parts, now));
            }
            None => {
                if parts.len() != INTERFACE_FIELDS {
                    log::warn!("dump: bad interface record");
                    continue;
                }
                interface = Some(parse_interface(&parts));
            }
        }
    }

    interface
}

fn parse_handshake(key: &str, latest: &str, now: u64) -> Option<(Key, bool)> {
    let key = parsed("public key", prepare(key))?;
    Some((key, is_connected(handshake(latest), now)))
}

/// Parses `wg show <name> latest-handshakes` into key → connected.
pub fn parse_status(data: &str, now: u64) -> BTreeMap<Key, bool> {
    records(data)
        .filter_map(|parts| match parts[..] {
            [key, handshake] => parse_handshake(key, handshake, now),
            _ => None,
        })
        .collect()
}

/// Parses `wg show all latest-handshakes` into name → key → connected.
pub fn parse_status_all(data: &str, now: u64) -> BTreeMap<String, BTreeMap<Key, bool>> {
    let mut status: BTreeMap<String, BTreeMap<Key, bool>> = BTreeMap::new();

    for parts in records(data) {
        if let [name, key, handshake] = parts[..] {
            if let Some((key, connected)) = parse_handshake(key, handshake, now) {
                status
                    .entry(name.to_string())
                    .or_default()
                    .insert(key, connected);
            }
        }
    }

    status
}

/// Parses whitespace separated listings (`wg show interfaces`, `wg show <name> peers`).
pub fn parse_list(data: &str) -> Vec<String> {
    data.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::wg::{Cidr, Key};

    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn keys() -> (Key, Key, Key, Key) {
        (Key::random(), Key::random(), Key::random(), Key::random())
    }

    #[test]
    fn test_parse_all() {
        let (priv0, pub0, peer_a, peer_b) = keys();
        let (priv1, pub1, peer_c, psk) = keys();

        let data = format!(
            "wg0\t{priv0}\t{pub0}\t51820\toff\n\
             wg0\t{peer_a}\t{psk}\t203.0.113.5:40000\t10.0.0.2/32,10.0.10.0/24\t\
             {}\t1024\t2048\t25\n\
             wg0\t{peer_b}\t(none)\t(none)\t10.0.0.3/32\t0\t0\t0\toff\n\
             wg1\t{priv1}\t{pub1}\t51821\t0xca6c\n\
             wg1\t{peer_c}\t(none)\t(none)\t(none)\t{}\t1\t2\toff\n",
            NOW - 30,
            NOW - 500,
        );

        let all = parse_all(&data, NOW);
        assert_eq!(all.len(), 2);

        let wg0 = &all["wg0"];
        assert_eq!(wg0.private_key, Some(priv0));
        assert_eq!(wg0.public_key, Some(pub0));
        assert_eq!(wg0.listen_port, Some(51820));
        assert_eq!(wg0.fw_mark, None);
        assert_eq!(wg0.peers.len(), 2);

        let a = &wg0.peers[0];
        assert_eq!(a.public_key, peer_a);
        assert_eq!(a.preshared_key, Some(psk));
        assert_eq!(a.end_point.unwrap().to_string(), "203.0.113.5:40000");
        assert_eq!(
            a.allowed_ips,
            vec![
                Cidr::host(Ipv4Addr::new(10, 0, 0, 2)),
                "10.0.10.0/24".parse().unwrap()
            ]
        );
        assert_eq!(a.latest_handshake, Some(NOW - 30));
        assert_eq!((a.transfer_rx, a.transfer_tx), (1024, 2048));
        assert_eq!(a.keepalive.map(|x| x.get()), Some(25));
        assert!(a.connected);
        assert!(!a.disabled);

        let b = &wg0.peers[1];
        assert_eq!(b.preshared_key, None);
        assert_eq!(b.end_point, None);
        assert_eq!(b.latest_handshake, None);
        assert_eq!(b.keepalive, None);
        assert!(!b.connected);

        let wg1 = &all["wg1"];
        assert_eq!(wg1.fw_mark.as_deref(), Some("0xca6c"));
        assert_eq!(wg1.peers.len(), 1);
        assert!(wg1.peers[0].allowed_ips.is_empty());
        assert!(!wg1.peers[0].connected);
    }

    #[test]
    fn test_parse_one() {
        let (private, public, peer, _) = keys();
        let data = format!(
            "{private}\t{public}\t0\toff\n{peer}\t(none)\t(none)\t10.0.0.2/32\t{}\t0\t0\toff\n",
            NOW - 119
        );

        let iface = parse_one(&data, NOW).unwrap();
        assert_eq!(iface.listen_port, Some(0));
        assert_eq!(iface.peers.len(), 1);
        assert!(iface.peers[0].connected);

        assert_eq!(parse_one("", NOW), None);
    }

    #[test]
    fn test_malformed_records_skipped() {
        let (private, public, peer, _) = keys();
        let data = format!(
            "{private}\t{public}\t51820\toff\ngarbage\n\
             {peer}\t(none)\t(none)\t10.0.0.2/32\t0\t0\t0\toff\n"
        );

        let iface = parse_one(&data, NOW).unwrap();
        assert_eq!(iface.peers.len(), 1);
        assert_eq!(iface.peers[0].public_key, peer);
    }

    #[test]
    fn test_parse_status() {
        let (a, b, c, _) = keys();

        let status = parse_status(&format!("{a}\t{}\n{b}\t0\n", NOW - 121), NOW);
        assert_eq!(status.get(&a), Some(&false));
        assert_eq!(status.get(&b), Some(&false));

        let all = parse_status_all(
            &format!("wg0\t{a}\t{}\nwg1\t{c}\t{}\n", NOW - 10, NOW - 1000),
            NOW,
        );
        assert!(all["wg0"][&a]);
        assert!(!all["wg1"][&c]);
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("wg0 wg1\n"), vec!["wg0", "wg1"]);
        assert!(parse_list("").is_empty());
    }
}
