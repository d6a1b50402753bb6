use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf};

use crate::error::Error;

use super::{
    Key, check_interface_name,
    client::{KeyDeriver, Provisioner},
    config::{ConfigParser, serialize},
    instance::Interface,
    peer::Peer,
    upsert_peer,
};

const EXTENSION: &str = "conf";

/// `wg-quick` style config files, one `<name>.conf` per interface.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
    parser: ConfigParser,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            parser: ConfigParser::new(),
        }
    }

    /// Store whose reads fail on the first line that does not parse.
    pub fn strict(self) -> Self {
        Self {
            parser: ConfigParser::strict(),
            ..self
        }
    }

    fn path(&self, name: &str) -> Result<PathBuf, Error> {
        check_interface_name(name)?;
        Ok(self.dir.join(format!("{name}.{EXTENSION}")))
    }

    /// Interface names with a config file, sorted.
    pub async fn list(&self) -> Result<Vec<String>, Error> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|x| x.to_str()) != Some(EXTENSION) {
                continue;
            }

            match path.file_stem().and_then(|x| x.to_str()) {
                Some(name) if check_interface_name(name).is_ok() => names.push(name.to_string()),
                _ => log::debug!("store: skipping {}", path.display()),
            }
        }

        names.sort();
        Ok(names)
    }

    pub async fn get_all(&self) -> Result<BTreeMap<String, Interface>, Error> {
        let mut interfaces = BTreeMap::new();

        for name in self.list().await? {
            match self.get(&name).await {
                Ok(iface) => {
                    interfaces.insert(name, iface);
                }
                Err(err) if err.is_not_found() => {
                    log::debug!("store: {name} has no interface data");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(interfaces)
    }

    pub async fn get(&self, name: &str) -> Result<Interface, Error> {
        let path = self.path(name)?;

        match self.parser.load(&path).await {
            Ok(Some(iface)) => Ok(iface),
            Ok(None) => Err(Error::InterfaceNotFound(name.to_string())),
            Err(Error::IoError(err)) if err.kind() == ErrorKind::NotFound => {
                Err(Error::InterfaceNotFound(name.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn set(&self, name: &str, interface: &Interface) -> Result<(), Error> {
        let path = self.path(name)?;
        self.parser.dump(&path, interface).await?;

        log::info!("store: saved {}", path.display());
        Ok(())
    }

    pub async fn get_peer(&self, name: &str, public_key: &Key) -> Result<Peer, Error> {
        self.get(name)
            .await?
            .peer(public_key)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound {
                name: name.to_string(),
                public_key: *public_key,
            })
    }

    pub async fn set_peer(&self, name: &str, peer: Peer) -> Result<(), Error> {
        let mut interface = self.get(name).await?;
        upsert_peer(&mut interface.peers, peer);
        self.set(name, &interface).await
    }

    pub async fn remove_peer(&self, name: &str, public_key: &Key) -> Result<Peer, Error> {
        let mut interface = self.get(name).await?;

        let idx = interface
            .peers
            .iter()
            .position(|x| &x.public_key == public_key)
            .ok_or_else(|| Error::PeerNotFound {
                name: name.to_string(),
                public_key: *public_key,
            })?;
        let removed = interface.peers.remove(idx);

        self.set(name, &interface).await?;
        Ok(removed)
    }

    /// Provisions a client against the stored interface and saves the new
    /// peer. Returns the peer and the client's config text.
    pub async fn create_client<K: KeyDeriver>(
        &self,
        name: &str,
        provisioner: &Provisioner<K>,
    ) -> Result<(Peer, String), Error> {
        let mut interface = self.get(name).await?;
        let (peer, client) = provisioner.create_client(name, &interface).await?;

        upsert_peer(&mut interface.peers, peer.clone());
        self.set(name, &interface).await?;

        Ok((peer, Self::make_config(&client)))
    }

    pub fn make_config(interface: &Interface) -> String {
        serialize(interface)
    }
}
