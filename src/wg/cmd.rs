use std::collections::BTreeMap;

use crate::error::Error;

use super::{
    Key, WireguardApi, check_interface_name,
    client::{KeyDeriver, Provisioner},
    config,
    dump::{self, unix_now},
    firewall::{Firewall, is_disabled},
    instance::{Interface, RunningInterface},
    peer::{Peer, RunningPeer},
    shell::{Executor, Script},
    upsert_peer,
};

const ALL: &str = "all";

/// Drives the device through `wg` / `wg-quick`.
#[derive(Debug, Default, Clone)]
pub struct WgCmdBackend<E, F> {
    executor: E,
    firewall: F,
}

/// One `wg set` invocation converging `name` to `interface`; peers in
/// `running` that `interface` does not list get a remove clause.
pub fn set_command(name: &str, interface: &Interface, running: &[Key]) -> Script {
    let mut script = Script::new("wg set")
        .arg(name)
        .raw("listen-port")
        .arg(interface.listen_port.unwrap_or(0))
        .raw("fwmark")
        .arg(interface.fw_mark.as_deref().unwrap_or("0"));

    script = match &interface.private_key {
        Some(key) => script.raw("private-key").secret(key),
        None => script.raw("private-key /dev/null"),
    };

    for peer in &interface.peers {
        script = script.raw("peer").arg(peer.public_key);

        script = match &peer.preshared_key {
            Some(key) => script.raw("preshared-key").secret(key),
            None => script.raw("preshared-key /dev/null"),
        };

        if let Some(endpoint) = &peer.end_point {
            script = script.raw("endpoint").arg(endpoint);
        }

        let allowed_ips = peer
            .allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        script = script
            .raw("persistent-keepalive")
            .arg(peer.keepalive.map_or(0, |x| x.get()))
            .raw("allowed-ips")
            .arg(allowed_ips);
    }

    for key in running.iter().filter(|x| interface.peer(x).is_none()) {
        script = script.raw("peer").arg(key).raw("remove");
    }

    script
}

impl<E: Executor, F: Firewall> WgCmdBackend<E, F> {
    pub fn new(executor: E, firewall: F) -> Self {
        Self { executor, firewall }
    }

    /// Runs `script`, hiding the command text and diagnostics behind an
    /// interface error.
    async fn exec_for(
        &self,
        name: &str,
        script: &Script,
        reason: &'static str,
    ) -> Result<String, Error> {
        self.executor.run(script).await.map_err(|err| {
            log::error!("{name}: {reason}: {err}");
            Error::interface(name, reason)
        })
    }

    async fn is_running(&self, name: &str) -> Result<bool, Error> {
        Ok(self.list_interfaces().await?.iter().any(|x| x == name))
    }

    async fn ensure_running(&self, name: &str) -> Result<(), Error> {
        check_interface_name(name)?;
        if !self.is_running(name).await? {
            return Err(Error::InterfaceNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Marks disabled peers and attaches addresses, both from the firewall.
    async fn fill(&self, interfaces: &mut BTreeMap<String, RunningInterface>) -> Result<(), Error> {
        if interfaces.is_empty() {
            return Ok(());
        }

        let names: Vec<&str> = interfaces.keys().map(String::as_str).collect();
        let (disabled, mut addresses) = futures::try_join!(
            self.firewall.disabled_addresses(),
            self.firewall.get_interfaces_addresses(&names),
        )?;

        for (name, iface) in interfaces.iter_mut() {
            for peer in &mut iface.peers {
                peer.disabled = is_disabled(&peer.allowed_ips, &disabled);
            }
            if let Some(address) = addresses.remove(name) {
                iface.address = address;
            }
        }

        Ok(())
    }

    async fn fill_for(
        &self,
        name: &str,
        interfaces: &mut BTreeMap<String, RunningInterface>,
    ) -> Result<(), Error> {
        self.fill(interfaces).await.map_err(|err| {
            log::error!("{name}: firewall query failed: {err}");
            Error::interface(name, "interface state is not read")
        })
    }

    /// Provisions a client on the running interface and adds its peer.
    /// Returns the new peer and the client's config text.
    pub async fn create_client<K: KeyDeriver>(
        &self,
        name: &str,
        provisioner: &Provisioner<K>,
    ) -> Result<(Peer, String), Error> {
        let interface = Interface::from(self.get_by_name(name).await?);
        let (peer, client) = provisioner.create_client(name, &interface).await?;
        self.set_peer(name, peer.clone()).await?;

        Ok((peer, config::serialize(&client)))
    }
}

impl<E: Executor, F: Firewall> WireguardApi for WgCmdBackend<E, F> {
    type Error = Error;

    async fn list_interfaces(&self) -> Result<Vec<String>, Self::Error> {
        let script = Script::new("wg show interfaces");
        let out = self
            .exec_for(ALL, &script, "interfaces are not listed")
            .await?;
        Ok(dump::parse_list(&out))
    }

    async fn get_all(&self) -> Result<BTreeMap<String, RunningInterface>, Self::Error> {
        let script = Script::new("wg show all dump");
        let out = self
            .exec_for(ALL, &script, "interfaces are not read")
            .await?;

        let mut interfaces = dump::parse_all(&out, unix_now());
        self.fill_for(ALL, &mut interfaces).await?;
        Ok(interfaces)
    }

    async fn get_by_name(&self, name: &str) -> Result<RunningInterface, Self::Error> {
        self.ensure_running(name).await?;

        let script = Script::new("wg show").arg(name).raw("dump");
        let out = self.exec_for(name, &script, "interface is not read").await?;
        let iface = dump::parse_one(&out, unix_now())
            .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))?;

        let mut interfaces = BTreeMap::from([(name.to_string(), iface)]);
        self.fill_for(name, &mut interfaces).await?;
        interfaces
            .remove(name)
            .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
    }

    async fn get_status(&self, name: &str) -> Result<BTreeMap<Key, bool>, Self::Error> {
        self.ensure_running(name).await?;

        let script = Script::new("wg show").arg(name).raw("latest-handshakes");
        let out = self
            .exec_for(name, &script, "interface status is not read")
            .await?;
        Ok(dump::parse_status(&out, unix_now()))
    }

    async fn get_status_all(&self) -> Result<BTreeMap<String, BTreeMap<Key, bool>>, Self::Error> {
        let script = Script::new("wg show all latest-handshakes");
        let out = self
            .exec_for(ALL, &script, "interfaces status is not read")
            .await?;
        Ok(dump::parse_status_all(&out, unix_now()))
    }

    async fn get_peers_pks(&self, name: &str) -> Result<Vec<Key>, Self::Error> {
        self.ensure_running(name).await?;

        let script = Script::new("wg show").arg(name).raw("peers");
        let out = self.exec_for(name, &script, "peers are not read").await?;

        Ok(dump::parse_list(&out)
            .iter()
            .filter_map(|x| match x.parse() {
                Ok(key) => Some(key),
                Err(err) => {
                    log::warn!("{name}: ignoring peer \"{x}\": {err}");
                    None
                }
            })
            .collect())
    }

    async fn get_peer(&self, name: &str, public_key: &Key) -> Result<RunningPeer, Self::Error> {
        self.get_by_name(name)
            .await?
            .peer(public_key)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound {
                name: name.to_string(),
                public_key: *public_key,
            })
    }

    async fn set_interface(&self, name: &str, interface: &Interface) -> Result<(), Self::Error> {
        let running = self.get_peers_pks(name).await?;
        let script = set_command(name, interface, &running);

        self.exec_for(name, &script, "interface is not set").await?;
        log::info!("{name}: applied {} peers", interface.peers.len());
        Ok(())
    }

    async fn set_peer(&self, name: &str, peer: Peer) -> Result<(), Self::Error> {
        let mut interface = Interface::from(self.get_by_name(name).await?);
        upsert_peer(&mut interface.peers, peer);
        self.set_interface(name, &interface).await
    }

    async fn remove_peer(&self, name: &str, public_key: &Key) -> Result<RunningPeer, Self::Error> {
        let running = self.get_by_name(name).await?;
        let removed = running
            .peer(public_key)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound {
                name: name.to_string(),
                public_key: *public_key,
            })?;

        let mut interface = Interface::from(running);
        interface.peers.retain(|x| &x.public_key != public_key);

        self.set_interface(name, &interface)
            .await
            .map_err(|err| match err {
                Error::Interface { .. } => Error::peer(name, *public_key, "peer is not removed"),
                err => err,
            })?;

        Ok(removed)
    }

    async fn disable_peer(&self, name: &str, public_key: &Key) -> Result<(), Self::Error> {
        let peer = Peer::from(self.get_peer(name, public_key).await?);
        self.firewall.disable_peer(&peer).await.map_err(|err| {
            log::error!("{name}: {err}");
            Error::peer(name, *public_key, "peer is not disabled")
        })
    }

    async fn enable_peer(&self, name: &str, public_key: &Key) -> Result<(), Self::Error> {
        let peer = Peer::from(self.get_peer(name, public_key).await?);
        self.firewall.enable_peer(&peer).await.map_err(|err| {
            log::error!("{name}: {err}");
            Error::peer(name, *public_key, "peer is not enabled")
        })
    }

    async fn start(&self, name: &str) -> Result<(), Self::Error> {
        check_interface_name(name)?;
        if self.is_running(name).await? {
            return Ok(());
        }

        let script = Script::new("wg-quick up").arg(name);
        self.exec_for(name, &script, "interface is not started")
            .await?;
        log::info!("{name}: up");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), Self::Error> {
        check_interface_name(name)?;
        if !self.is_running(name).await? {
            return Ok(());
        }

        let script = Script::new("wg-quick down").arg(name);
        self.exec_for(name, &script, "interface is not stopped")
            .await?;
        log::info!("{name}: down");
        Ok(())
    }

    async fn save_config(&self, name: &str) -> Result<(), Self::Error> {
        check_interface_name(name)?;

        let script = Script::new("wg-quick save").arg(name);
        self.exec_for(name, &script, "interface is not saved")
            .await?;
        Ok(())
    }

    async fn sync_with_config(&self, name: &str) -> Result<(), Self::Error> {
        check_interface_name(name)?;

        let script = Script::new("wg syncconf")
            .arg(name)
            .raw("<(wg-quick strip")
            .arg(name)
            .raw(")");
        self.exec_for(name, &script, "interface is not synchronized")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::wg::{
        Cidr, Keepalive,
        client::{WgKeyDeriver, fake::FakeKeys},
        firewall::fake::FakeFirewall,
        shell::fake::FakeExecutor,
    };

    use super::*;

    struct Device {
        private: Key,
        public: Key,
        peers: Vec<(Key, &'static str)>,
    }

    impl Device {
        fn new(peers: &[&'static str]) -> Self {
            Self {
                private: Key::random(),
                public: Key::random(),
                peers: peers.iter().map(|ip| (Key::random(), *ip)).collect(),
            }
        }

        fn dump(&self) -> String {
            let mut out = format!("{}\t{}\t51820\toff\n", self.private, self.public);
            for (key, ip) in &self.peers {
                out.push_str(&format!("{key}\t(none)\t(none)\t{ip}\t0\t0\t0\toff\n"));
            }
            out
        }

        fn peer_keys(&self) -> String {
            self.peers
                .iter()
                .map(|(key, _)| key.to_string())
                .collect::<Vec<_>>()
                .join("\n")
        }

        fn executor(&self) -> FakeExecutor {
            FakeExecutor::default()
                .reply("wg show interfaces", "wg0 wg1")
                .reply("wg show 'wg0' dump", &self.dump())
                .reply("wg show 'wg0' peers", &self.peer_keys())
        }
    }

    fn firewall() -> FakeFirewall {
        FakeFirewall {
            addresses: [("wg0".to_string(), vec!["10.0.0.1/24".parse().unwrap()])].into(),
            ..Default::default()
        }
    }

    fn set_calls(exec: &FakeExecutor) -> Vec<crate::wg::shell::fake::Call> {
        exec.calls()
            .into_iter()
            .filter(|x| x.command.contains("wg set"))
            .collect()
    }

    #[test]
    fn test_set_command() {
        let (a, b, c) = (Key::random(), Key::random(), Key::random());
        let private = Key::random();
        let psk = Key::random();

        let mut peer_a = Peer::new(a);
        peer_a.preshared_key = Some(psk);
        peer_a.end_point = Some("192.0.2.1:51820".parse().unwrap());
        peer_a.keepalive = Some(Keepalive::new(25).unwrap());
        peer_a.allowed_ips = vec!["10.0.0.2/32".parse().unwrap(), "10.0.9.0/24".parse().unwrap()];

        let iface = Interface {
            private_key: Some(private),
            listen_port: Some(51820),
            peers: vec![peer_a, Peer::new(b)],
            ..Default::default()
        };

        let script = set_command("wg0", &iface, &[a, b, c]);
        assert_eq!(
            script.command(),
            format!(
                "wg set 'wg0' listen-port '51820' fwmark '0' \
                 private-key <(printf '%s\\n' \"$wg_secret_0\") \
                 peer '{a}' preshared-key <(printf '%s\\n' \"$wg_secret_1\") \
                 endpoint '192.0.2.1:51820' persistent-keepalive '25' \
                 allowed-ips '10.0.0.2/32,10.0.9.0/24' \
                 peer '{b}' preshared-key /dev/null persistent-keepalive '0' allowed-ips '' \
                 peer '{c}' remove"
            )
        );
        assert_eq!(script.secrets(), [private.to_string(), psk.to_string()]);
    }

    #[test]
    fn test_set_command_clears() {
        let script = set_command("wg0", &Interface::default(), &[]);
        assert_eq!(
            script.command(),
            "wg set 'wg0' listen-port '0' fwmark '0' private-key /dev/null"
        );
        assert!(script.secrets().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_removes_only_missing_peer() {
        let device = Device::new(&["10.0.0.2/32", "10.0.0.3/32", "10.0.0.4/32"]);
        let exec = device.executor();
        let wg = WgCmdBackend::new(exec.clone(), firewall());

        let desired = Interface {
            private_key: Some(device.private),
            peers: device.peers[..2]
                .iter()
                .map(|(key, _)| Peer::new(*key))
                .collect(),
            ..Default::default()
        };
        wg.set_interface("wg0", &desired).await.unwrap();

        let calls = set_calls(&exec);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command.matches(" remove").count(), 1);
        let remove = format!("peer '{}' remove", device.peers[2].0);
        assert!(calls[0].command.ends_with(&remove));
        assert_eq!(calls[0].secrets, vec![device.private.to_string()]);
        assert!(!calls[0].command.contains(&device.private.to_string()));
    }

    #[tokio::test]
    async fn test_bad_name_rejected_before_any_command() {
        let exec = FakeExecutor::default();
        let wg = WgCmdBackend::new(exec.clone(), firewall());

        let err = wg
            .set_interface("wg0; rm -rf /", &Interface::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IncorrectInterfaceName(_)));
        assert!(wg.start("$(reboot)").await.is_err());
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_not_running_is_not_found() {
        let device = Device::new(&[]);
        let wg = WgCmdBackend::new(device.executor(), firewall());

        let err = wg.get_by_name("wg9").await.unwrap_err();
        assert!(err.is_not_found());

        let err = wg
            .set_interface("wg9", &Interface::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InterfaceNotFound(_)));
    }

    #[tokio::test]
    async fn test_command_failure_is_wrapped() {
        let device = Device::new(&[]);
        let exec = device
            .executor()
            .fail("wg set", "Unable to modify interface: secret detail");
        let wg = WgCmdBackend::new(exec, firewall());

        let desired = Interface {
            private_key: Some(Key::random()),
            ..Default::default()
        };
        let err = wg.set_interface("wg0", &desired).await.unwrap_err();

        assert!(matches!(err, Error::Interface { .. }));
        assert!(!err.is_not_found());
        let text = err.to_string();
        assert!(!text.contains("secret detail"));
        assert!(!text.contains("wg set"));
    }

    #[tokio::test]
    async fn test_get_by_name_fills_firewall_state() {
        let device = Device::new(&["10.0.0.2/32", "10.0.0.3/32"]);
        let fw = firewall();
        fw.disabled
            .lock()
            .unwrap()
            .insert(Ipv4Addr::new(10, 0, 0, 3).into());
        let wg = WgCmdBackend::new(device.executor(), fw);

        let iface = wg.get_by_name("wg0").await.unwrap();
        assert_eq!(iface.public_key, Some(device.public));
        assert_eq!(iface.address, vec!["10.0.0.1/24".parse::<Cidr>().unwrap()]);
        assert!(!iface.peers[0].disabled);
        assert!(iface.peers[1].disabled);
    }

    #[tokio::test]
    async fn test_get_all() {
        let device = Device::new(&["10.0.0.2/32"]);
        let all_dump = device
            .dump()
            .lines()
            .map(|x| format!("wg0\t{x}\n"))
            .collect::<String>();
        let exec = FakeExecutor::default().reply("wg show all dump", &all_dump);
        let wg = WgCmdBackend::new(exec, firewall());

        let all = wg.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["wg0"].peers.len(), 1);
        assert_eq!(all["wg0"].address.len(), 1);
    }

    #[tokio::test]
    async fn test_set_peer_upserts() {
        let device = Device::new(&["10.0.0.2/32", "10.0.0.3/32"]);
        let exec = device.executor();
        let wg = WgCmdBackend::new(exec.clone(), firewall());

        let mut changed = Peer::new(device.peers[0].0);
        changed.allowed_ips = vec!["10.0.0.20/32".parse().unwrap()];
        wg.set_peer("wg0", changed).await.unwrap();

        let cmd = &set_calls(&exec)[0].command;
        assert_eq!(cmd.matches(&device.peers[0].0.to_string()).count(), 1);
        assert!(cmd.contains("allowed-ips '10.0.0.20/32'"));
        assert!(!cmd.contains("remove"));

        let added = Peer::new(Key::random());
        wg.set_peer("wg0", added.clone()).await.unwrap();
        let cmd = &set_calls(&exec)[1].command;
        assert!(cmd.contains(&added.public_key.to_string()));
        assert_eq!(cmd.matches("peer '").count(), 3);
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let device = Device::new(&["10.0.0.2/32", "10.0.0.3/32"]);
        let exec = device.executor();
        let wg = WgCmdBackend::new(exec.clone(), firewall());

        let err = wg.remove_peer("wg0", &Key::random()).await.unwrap_err();
        assert!(matches!(err, Error::PeerNotFound { .. }));
        assert!(set_calls(&exec).is_empty());

        let key = device.peers[1].0;
        let removed = wg.remove_peer("wg0", &key).await.unwrap();
        assert_eq!(removed.public_key, key);

        let cmd = &set_calls(&exec)[0].command;
        assert!(cmd.ends_with(&format!("peer '{key}' remove")));
    }

    #[tokio::test]
    async fn test_disable_and_enable_touch_only_firewall() {
        let device = Device::new(&["10.0.0.2/32"]);
        let exec = device.executor();
        let fw = firewall();
        let wg = WgCmdBackend::new(exec.clone(), fw.clone());
        let key = device.peers[0].0;

        wg.disable_peer("wg0", &key).await.unwrap();
        assert!(wg.get_peer("wg0", &key).await.unwrap().disabled);

        wg.enable_peer("wg0", &key).await.unwrap();
        assert!(!wg.get_peer("wg0", &key).await.unwrap().disabled);

        assert_eq!(*fw.toggled.lock().unwrap(), vec![(key, true), (key, false)]);
        assert!(set_calls(&exec).is_empty());

        let err = wg.disable_peer("wg0", &Key::random()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_up_down_only_when_needed() {
        let device = Device::new(&[]);
        let exec = device.executor();
        let wg = WgCmdBackend::new(exec.clone(), firewall());

        wg.start("wg0").await.unwrap();
        wg.stop("wg5").await.unwrap();
        wg.start("wg5").await.unwrap();
        wg.stop("wg0").await.unwrap();
        wg.sync_with_config("wg0").await.unwrap();

        let quick: Vec<String> = exec
            .calls()
            .into_iter()
            .map(|x| x.command)
            .filter(|x| x.contains("wg-quick"))
            .collect();
        assert_eq!(
            quick,
            vec![
                "wg-quick up 'wg5'",
                "wg-quick down 'wg0'",
                "wg syncconf 'wg0' <(wg-quick strip 'wg0' )",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_client_adds_peer() {
        let device = Device::new(&["10.0.0.2/32"]);
        let exec = device.executor();
        let wg = WgCmdBackend::new(exec.clone(), firewall());
        let provisioner = Provisioner::new(FakeKeys, Ipv4Addr::new(203, 0, 113, 1));

        let (peer, text) = wg.create_client("wg0", &provisioner).await.unwrap();
        assert_eq!(
            peer.allowed_ips,
            vec!["10.0.0.3/32".parse::<Cidr>().unwrap()]
        );
        assert!(text.contains(&format!("PublicKey = {}", device.public)));
        assert!(text.contains("Endpoint = 203.0.113.1:51820"));

        let cmd = &set_calls(&exec)[0].command;
        assert!(cmd.contains(&format!("peer '{}'", peer.public_key)));
    }

    #[tokio::test]
    async fn test_create_client_hides_pubkey_failure() {
        let device = Device::new(&["10.0.0.2/32"]);
        let exec = device.executor();
        let wg = WgCmdBackend::new(exec.clone(), firewall());

        let keys = FakeExecutor::default().fail("wg pubkey", "pubkey: detail from stderr");
        let provisioner = Provisioner::new(WgKeyDeriver::new(keys), Ipv4Addr::new(203, 0, 113, 1));

        let err = wg.create_client("wg0", &provisioner).await.unwrap_err();
        assert!(matches!(err, Error::Interface { .. }));
        assert!(!err.to_string().contains("detail from stderr"));
        assert!(!format!("{err:?}").contains("detail from stderr"));
        assert!(set_calls(&exec).is_empty());
    }
}
