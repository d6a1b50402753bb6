use std::{collections::BTreeMap, net::Ipv4Addr, path::PathBuf};

use clap::{CommandFactory, Parser, Subcommand, error::ErrorKind};
use error::Error;
use wg::{
    Cidr, Endpoint, Keepalive, Key, WireguardApi,
    client::{Provisioner, WgKeyDeriver},
    cmd::WgCmdBackend,
    dump::unix_now,
    firewall::{Firewall, NftFirewall},
    instance::RunningInterface,
    peer::{Peer, RunningPeer},
    shell::ShellExecutor,
    store::ConfigStore,
};

pub(crate) mod error;
mod wg;

/// Manage WireGuard interfaces, their peers and config files.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Directory holding `<name>.conf` files
    #[arg(long, env = "WG_CONFIG_DIR", default_value = "/etc/wireguard")]
    config_dir: PathBuf,

    /// Public address clients connect to
    #[arg(long, env = "WG_SERVER_IP")]
    server_ip: Option<Ipv4Addr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Running interfaces and their peers
    Show { name: Option<String> },
    /// Peer connectivity
    Status { name: Option<String> },
    Up { name: String },
    Down { name: String },
    /// Write the running state back to the config file
    Save { name: String },
    /// Load the config file into the running interface
    Sync { name: String },
    /// Reconcile the running interface to the parsed config file
    Apply { name: String },
    #[command(subcommand)]
    Config(ConfigCommand),
    #[command(subcommand)]
    Peer(PeerCommand),
    /// Provision a new client and print its config
    Client {
        name: String,
        /// Add the peer to the config file instead of the running interface
        #[arg(long)]
        persist: bool,
    },
}

/// Config files under `--config-dir`
#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Interfaces with a config file
    List,
    /// Print the parsed config file
    Show {
        name: String,
        /// Fail on the first line that does not parse
        #[arg(long)]
        strict: bool,
    },
    #[command(subcommand)]
    Peer(ConfigPeerCommand),
}

#[derive(Debug, Subcommand)]
enum ConfigPeerCommand {
    Show { name: String, key: Key },
    /// Add the peer, or replace the one with the same key
    Set {
        name: String,
        key: Key,
        #[command(flatten)]
        peer: PeerArgs,
    },
    Remove { name: String, key: Key },
}

/// Peers of a running interface
#[derive(Debug, Subcommand)]
enum PeerCommand {
    /// Public keys of the interface's peers
    List { name: String },
    Show { name: String, key: Key },
    /// Add the peer, or replace the one with the same key
    Set {
        name: String,
        key: Key,
        #[command(flatten)]
        peer: PeerArgs,
    },
    Remove { name: String, key: Key },
    Enable { name: String, key: Key },
    Disable { name: String, key: Key },
    /// Peers blocked by the firewall, across running interfaces
    Disabled,
}

#[derive(Debug, clap::Args)]
struct PeerArgs {
    /// Comma separated networks routed to the peer
    #[arg(long, value_delimiter = ',')]
    allowed_ips: Vec<Cidr>,

    #[arg(long)]
    endpoint: Option<Endpoint>,

    /// Persistent keepalive interval in seconds
    #[arg(long)]
    keepalive: Option<u32>,
}

impl PeerArgs {
    fn into_peer(self, key: Key) -> Result<Peer, Error> {
        let mut peer = Peer::new(key);
        peer.allowed_ips = self.allowed_ips;
        peer.end_point = self.endpoint;
        peer.keepalive = self.keepalive.map(Keepalive::new).transpose()?;
        Ok(peer)
    }
}

fn print_peer(peer: &Peer) {
    println!("peer: {}", peer.public_key);
    if let Some(endpoint) = &peer.end_point {
        println!("  endpoint: {endpoint}");
    }
    let allowed_ips: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();
    println!("  allowed ips: {}", allowed_ips.join(", "));
    if let Some(keepalive) = peer.keepalive {
        println!("  persistent keepalive: every {}s", keepalive.get());
    }
}

fn print_running_peer(peer: &RunningPeer, now: u64) {
    print_peer(&Peer::from(peer.clone()));
    match peer.latest_handshake {
        Some(ts) => println!("  latest handshake: {}s ago", now.saturating_sub(ts)),
        None => println!("  latest handshake: never"),
    }
    println!(
        "  transfer: {} B received, {} B sent",
        peer.transfer_rx, peer.transfer_tx
    );
    println!(
        "  state: {}{}",
        connection(peer.connected),
        if peer.disabled { ", disabled" } else { "" }
    );
}

fn connection(connected: bool) -> &'static str {
    match connected {
        true => "connected",
        false => "disconnected",
    }
}

fn print_interface(name: &str, iface: &RunningInterface, now: u64) {
    println!("interface: {name}");
    if let Some(key) = &iface.public_key {
        println!("  public key: {key}");
    }
    if let Some(port) = iface.listen_port {
        println!("  listening port: {port}");
    }
    if let Some(mark) = &iface.fw_mark {
        println!("  fwmark: {mark}");
    }
    for addr in &iface.address {
        println!("  address: {addr}");
    }

    for peer in &iface.peers {
        println!();
        print_running_peer(peer, now);
    }
}

fn print_status(name: &str, status: &BTreeMap<Key, bool>) {
    for (key, connected) in status {
        println!("{name}\t{key}\t{}", connection(*connected));
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args = Args::parse();
    let store = ConfigStore::new(&args.config_dir);
    let firewall = NftFirewall::new(ShellExecutor);
    let wg = WgCmdBackend::new(ShellExecutor, firewall.clone());

    match args.command {
        Command::Show { name: Some(name) } => {
            print_interface(&name, &wg.get_by_name(&name).await?, unix_now());
        }
        Command::Show { name: None } => {
            let now = unix_now();
            for (idx, (name, iface)) in wg.get_all().await?.iter().enumerate() {
                if idx > 0 {
                    println!();
                }
                print_interface(name, iface, now);
            }
        }
        Command::Status { name: Some(name) } => {
            print_status(&name, &wg.get_status(&name).await?);
        }
        Command::Status { name: None } => {
            for (name, status) in wg.get_status_all().await? {
                print_status(&name, &status);
            }
        }
        Command::Up { name } => wg.start(&name).await?,
        Command::Down { name } => wg.stop(&name).await?,
        Command::Save { name } => wg.save_config(&name).await?,
        Command::Sync { name } => wg.sync_with_config(&name).await?,
        Command::Apply { name } => {
            let iface = store.get(&name).await?;
            wg.set_interface(&name, &iface).await?;
        }
        Command::Config(ConfigCommand::List) => {
            for (name, iface) in store.get_all().await? {
                let port = iface.listen_port.unwrap_or(0);
                println!("{name}\t{port}\t{} peers", iface.peers.len());
            }
        }
        Command::Config(ConfigCommand::Show { name, strict }) => {
            let store = if strict { store.strict() } else { store };
            print!("{}", ConfigStore::make_config(&store.get(&name).await?));
        }
        Command::Config(ConfigCommand::Peer(ConfigPeerCommand::Show { name, key })) => {
            print_peer(&store.get_peer(&name, &key).await?);
        }
        Command::Config(ConfigCommand::Peer(ConfigPeerCommand::Set { name, key, peer })) => {
            store.set_peer(&name, peer.into_peer(key)?).await?;
        }
        Command::Config(ConfigCommand::Peer(ConfigPeerCommand::Remove { name, key })) => {
            let peer = store.remove_peer(&name, &key).await?;
            log::info!("{name}: removed peer {} from config", peer.public_key);
        }
        Command::Peer(PeerCommand::List { name }) => {
            for key in wg.get_peers_pks(&name).await? {
                println!("{key}");
            }
        }
        Command::Peer(PeerCommand::Show { name, key }) => {
            print_running_peer(&wg.get_peer(&name, &key).await?, unix_now());
        }
        Command::Peer(PeerCommand::Set { name, key, peer }) => {
            wg.set_peer(&name, peer.into_peer(key)?).await?;
        }
        Command::Peer(PeerCommand::Remove { name, key }) => {
            let peer = wg.remove_peer(&name, &key).await?;
            log::info!("{name}: removed peer {}", peer.public_key);
        }
        Command::Peer(PeerCommand::Enable { name, key }) => wg.enable_peer(&name, &key).await?,
        Command::Peer(PeerCommand::Disable { name, key }) => wg.disable_peer(&name, &key).await?,
        Command::Peer(PeerCommand::Disabled) => {
            let all = wg.get_all().await?;
            let interfaces: Vec<&RunningInterface> = all.values().collect();
            for peer in firewall.get_disabled_peers(&interfaces).await? {
                println!("{}", peer.public_key);
            }
        }
        Command::Client { name, persist } => {
            let Some(server_ip) = args.server_ip else {
                Args::command()
                    .error(
                        ErrorKind::MissingRequiredArgument,
                        "--server-ip (or WG_SERVER_IP) is required to provision a client",
                    )
                    .exit();
            };

            let provisioner = Provisioner::new(WgKeyDeriver::new(ShellExecutor), server_ip);
            let (peer, config) = if persist {
                store.create_client(&name, &provisioner).await?
            } else {
                wg.create_client(&name, &provisioner).await?
            };

            log::info!("{name}: added client {}", peer.public_key);
            print!("{config}");
        }
    }

    Ok(())
}
