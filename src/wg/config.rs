use std::{
    collections::HashMap,
    fmt::Display,
    net::IpAddr,
    path::Path,
    str::FromStr,
    sync::LazyLock,
};

use crate::error::Error;

use super::{
    Cidr, Endpoint, Keepalive, Key,
    instance::Interface,
    peer::Peer,
    validate_port,
};

const INTERFACE_SECT: &str = "Interface";
const PEER_SECT: &str = "Peer";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("configuration parsing error at line {line} [{section}][{option}]: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub section: String,
    pub option: String,
    pub reason: String,
}

/// Result of a lenient parse: the interface, if any interface option was
/// seen, plus everything that was skipped on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub interface: Option<Interface>,
    pub diagnostics: Vec<ParseError>,
}

#[derive(Default)]
struct PeerDraft {
    public_key: Option<Key>,
    preshared_key: Option<Key>,
    end_point: Option<Endpoint>,
    allowed_ips: Vec<Cidr>,
    keepalive: Option<Keepalive>,
}

impl PeerDraft {
    fn into_peer(self) -> Option<Peer> {
        Some(Peer {
            public_key: self.public_key?,
            preshared_key: self.preshared_key,
            end_point: self.end_point,
            allowed_ips: self.allowed_ips,
            keepalive: self.keepalive,
        })
    }
}

type Decoded = Result<(), String>;

enum Setter {
    Interface(fn(&mut Interface, &str) -> Decoded),
    Peer(fn(&mut PeerDraft, &str) -> Decoded),
}

fn str_val(value: &str) -> Option<&str> {
    match value {
        "off" | "0" | "" => None,
        value => Some(value),
    }
}

fn bool_val(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "1" => Some(true),
        "no" | "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn int_val(value: &str) -> Result<Option<u32>, String> {
    str_val(value)
        .map(|v| v.parse().map_err(|err| format!("\"{v}\": {err}")))
        .transpose()
}

fn key_val(value: &str) -> Result<Option<Key>, String> {
    str_val(value)
        .map(|v| v.parse().map_err(|err| format!("{err}")))
        .transpose()
}

fn list_val<T>(value: &str) -> Result<Vec<T>, String>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|x| x.parse().map_err(|err| format!("\"{x}\": {err}")))
        .collect()
}

fn push_command(commands: &mut Vec<String>, value: &str) -> Decoded {
    if let Some(command) = str_val(value) {
        commands.push(command.to_string());
    }
    Ok(())
}

static READERS: LazyLock<HashMap<&'static str, Setter>> = LazyLock::new(|| {
    use Setter::{Interface as I, Peer as P};

    HashMap::from([
        (
            "Interface:PrivateKey",
            I(|iface, v| {
                iface.private_key = key_val(v)?;
                Ok(())
            }),
        ),
        (
            "Interface:PublicKey",
            I(|iface, v| {
                iface.public_key = key_val(v)?;
                Ok(())
            }),
        ),
        (
            "Interface:ListenPort",
            I(|iface, v| {
                iface.listen_port = int_val(v)?
                    .map(validate_port)
                    .transpose()
                    .map_err(|err| err.to_string())?;
                Ok(())
            }),
        ),
        (
            "Interface:FwMark",
            I(|iface, v| {
                iface.fw_mark = str_val(v).map(String::from);
                Ok(())
            }),
        ),
        (
            "Interface:Address",
            I(|iface, v| {
                iface.address.extend(list_val::<Cidr>(v)?);
                Ok(())
            }),
        ),
        (
            "Interface:DNS",
            I(|iface, v| {
                iface.dns.extend(list_val::<IpAddr>(v)?);
                Ok(())
            }),
        ),
        (
            "Interface:MTU",
            I(|iface, v| {
                iface.mtu = int_val(v)?;
                Ok(())
            }),
        ),
        (
            "Interface:Table",
            I(|iface, v| {
                iface.table = str_val(v).map(String::from);
                Ok(())
            }),
        ),
        ("Interface:PreUp", I(|iface, v| push_command(&mut iface.pre_up, v))),
        ("Interface:PostUp", I(|iface, v| push_command(&mut iface.post_up, v))),
        ("Interface:PreDown", I(|iface, v| push_command(&mut iface.pre_down, v))),
        ("Interface:PostDown", I(|iface, v| push_command(&mut iface.post_down, v))),
        (
            "Interface:SaveConfig",
            I(|iface, v| {
                iface.save_conf = bool_val(v).unwrap_or(false);
                Ok(())
            }),
        ),
        (
            "Peer:PublicKey",
            P(|peer, v| {
                peer.public_key = key_val(v)?;
                Ok(())
            }),
        ),
        (
            "Peer:PresharedKey",
            P(|peer, v| {
                peer.preshared_key = key_val(v)?;
                Ok(())
            }),
        ),
        (
            "Peer:Endpoint",
            P(|peer, v| {
                peer.end_point = str_val(v)
                    .map(Endpoint::from_str)
                    .transpose()
                    .map_err(|err| err.to_string())?;
                Ok(())
            }),
        ),
        (
            "Peer:AllowedIPs",
            P(|peer, v| {
                peer.allowed_ips.extend(list_val::<Cidr>(v)?);
                Ok(())
            }),
        ),
        (
            "Peer:PersistentKeepalive",
            P(|peer, v| {
                peer.keepalive = int_val(v)?
                    .map(Keepalive::new)
                    .transpose()
                    .map_err(|err| err.to_string())?;
                Ok(())
            }),
        ),
    ])
});

type Writer<T> = fn(&T) -> Vec<String>;

fn opt<T: Display>(value: &Option<T>) -> Vec<String> {
    value.iter().map(ToString::to_string).collect()
}

fn non_zero(value: Option<impl Into<u32>>) -> Vec<String> {
    let value: Option<u32> = value.map(Into::into);
    value
        .filter(|x| *x != 0)
        .map(|x| x.to_string())
        .into_iter()
        .collect()
}

fn list<T: Display>(values: &[T]) -> Vec<String> {
    values
        .iter()
        .map(ToString::to_string)
        .filter(|x| !x.is_empty())
        .collect()
}

static INTERFACE_WRITERS: &[(&str, Writer<Interface>)] = &[
    ("PrivateKey", |i| opt(&i.private_key)),
    ("PublicKey", |i| opt(&i.public_key)),
    ("Address", |i| list(&i.address)),
    ("ListenPort", |i| non_zero(i.listen_port)),
    ("FwMark", |i| list(i.fw_mark.as_slice())),
    ("MTU", |i| non_zero(i.mtu)),
    ("Table", |i| list(i.table.as_slice())),
    ("DNS", |i| list(&i.dns)),
    ("PreUp", |i| list(&i.pre_up)),
    ("PostUp", |i| list(&i.post_up)),
    ("PreDown", |i| list(&i.pre_down)),
    ("PostDown", |i| list(&i.post_down)),
    ("SaveConfig", |i| {
        if i.save_conf {
            vec!["true".to_string()]
        } else {
            vec![]
        }
    }),
];

static PEER_WRITERS: &[(&str, Writer<Peer>)] = &[
    ("PublicKey", |p| vec![p.public_key.to_string()]),
    ("PresharedKey", |p| opt(&p.preshared_key)),
    ("Endpoint", |p| opt(&p.end_point)),
    ("AllowedIPs", |p| list(&p.allowed_ips)),
    ("PersistentKeepalive", |p| non_zero(p.keepalive.map(Keepalive::get))),
];

fn write_section<T>(out: &mut String, section: &str, value: &T, writers: &[(&str, Writer<T>)]) {
    let mut opened = false;

    for (name, writer) in writers {
        for line in writer(value) {
            if !opened {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&format!("[{section}]\n"));
                opened = true;
            }
            out.push_str(&format!("{name} = {line}\n"));
        }
    }
}

/// Renders the interface, skipping every empty, zero, false or absent field.
pub fn serialize(interface: &Interface) -> String {
    let mut out = String::new();

    write_section(&mut out, INTERFACE_SECT, interface, INTERFACE_WRITERS);
    for peer in &interface.peers {
        write_section(&mut out, PEER_SECT, peer, PEER_WRITERS);
    }

    out
}

enum State {
    Preamble,
    Section(String),
    // accumulator is created by the first known option after the header
    Peer {
        header: usize,
        draft: Option<PeerDraft>,
    },
}

impl State {
    fn name(&self) -> &str {
        match self {
            State::Preamble => "",
            State::Section(name) => name,
            State::Peer { .. } => PEER_SECT,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigParser {
    strict: bool,
}

impl ConfigParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser that fails on the first line the lenient parser would skip.
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn parse(&self, input: &str) -> Result<Parsed, ParseError> {
        let mut interface = Interface::default();
        let mut has_interface = false;
        let mut diagnostics = Vec::new();
        let mut state = State::Preamble;

        for (idx, line) in input.lines().enumerate() {
            let lineno = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut skip = |section: &str, option: &str, reason: String| {
                log::warn!("config line {lineno} skipped: {reason}");
                diagnostics.push(ParseError {
                    line: lineno,
                    section: section.to_string(),
                    option: option.to_string(),
                    reason,
                });
            };

            if line.starts_with('[') {
                let header = line.split('#').next().unwrap_or_default().trim();
                match header
                    .strip_prefix('[')
                    .and_then(|x| x.strip_suffix(']'))
                    .filter(|x| !x.is_empty())
                {
                    Some(name) => {
                        let next = if name == PEER_SECT {
                            State::Peer {
                                header: lineno,
                                draft: None,
                            }
                        } else {
                            State::Section(name.to_string())
                        };
                        let prev = std::mem::replace(&mut state, next);
                        diagnostics.extend(finish_peer(prev, &mut interface.peers));
                    }
                    None => skip(
                        state.name(),
                        "",
                        format!("malformed section header \"{line}\""),
                    ),
                }
                continue;
            }

            if matches!(state, State::Preamble) {
                continue;
            }

            let Some((option, value)) = line.split_once('=') else {
                skip(state.name(), "", "expected \"Key = Value\"".to_string());
                continue;
            };
            let (option, value) = (option.trim(), value.trim());
            if option.is_empty() || value.is_empty() {
                skip(state.name(), option, "empty option or value".to_string());
                continue;
            }

            let key = format!("{}:{option}", state.name());
            let decoded = match (READERS.get(key.as_str()), &mut state) {
                (Some(Setter::Interface(set)), _) => {
                    has_interface = true;
                    set(&mut interface, value)
                }
                (Some(Setter::Peer(set)), State::Peer { draft, .. }) => {
                    set(draft.get_or_insert_with(PeerDraft::default), value)
                }
                _ => Err("unknown option".to_string()),
            };

            if let Err(reason) = decoded {
                skip(state.name(), option, reason);
            }
        }

        diagnostics.extend(finish_peer(state, &mut interface.peers));
        diagnostics.sort_by_key(|x| x.line);

        if self.strict {
            if let Some(err) = diagnostics.first() {
                return Err(err.clone());
            }
        }

        Ok(Parsed {
            interface: has_interface.then_some(interface),
            diagnostics,
        })
    }

    /// Reads a config file; `None` when it holds no interface data.
    pub async fn load(&self, path: &Path) -> Result<Option<Interface>, Error> {
        let data = tokio::fs::read_to_string(path).await?;
        Ok(self.parse(&data)?.interface)
    }

    pub async fn dump(&self, path: &Path, interface: &Interface) -> Result<(), Error> {
        let data = serialize(interface);
        if data.is_empty() {
            return Err(Error::EmptyConfig);
        }

        write_private(path, &data).await
    }
}

/// Closes a `[Peer]` section. Diagnostics point at the section header.
fn finish_peer(state: State, peers: &mut Vec<Peer>) -> Option<ParseError> {
    let State::Peer {
        header,
        draft: Some(draft),
    } = state
    else {
        return None;
    };

    let diagnostic = |reason: String| {
        log::warn!("config peer at line {header} skipped: {reason}");
        ParseError {
            line: header,
            section: PEER_SECT.to_string(),
            option: "PublicKey".to_string(),
            reason,
        }
    };

    let Some(peer) = draft.into_peer() else {
        return Some(diagnostic("peer without public key".to_string()));
    };

    let duplicate = match peers.iter().any(|x| x.public_key == peer.public_key) {
        true => {
            let reason = format!("duplicate peer {}, keeping the last one", peer.public_key);
            Some(diagnostic(reason))
        }
        false => None,
    };
    super::upsert_peer(peers, peer);
    duplicate
}

async fn write_private(path: &Path, data: &str) -> Result<(), Error> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    // mode only applies on create
    #[cfg(unix)]
    {
        use std::{fs::Permissions, os::unix::fs::PermissionsExt};
        file.set_permissions(Permissions::from_mode(0o600)).await?;
    }
    file.write_all(data.as_bytes()).await?;
    file.flush().await?;

    Ok(())
}
