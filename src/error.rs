use crate::wg::{Key, KeyError, ValidationError, config::ParseError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    ParseError(#[from] ParseError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("key error: {0}")]
    KeyError(#[from] KeyError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("incorrect interface name \"{0}\"")]
    IncorrectInterfaceName(String),

    #[error("not found interface \"{0}\"")]
    InterfaceNotFound(String),

    #[error("interface \"{name}\" error: {reason}")]
    Interface { name: String, reason: &'static str },

    #[error("interface \"{name}\" does not have a peer \"{public_key}\"")]
    PeerNotFound { name: String, public_key: Key },

    #[error("peer \"{public_key}\" in interface \"{name}\" error: {reason}")]
    Peer {
        name: String,
        public_key: Key,
        reason: &'static str,
    },

    #[error("all addresses are reserved")]
    AddressesExhausted,

    #[error("failed to save the interface: nothing to write")]
    EmptyConfig,
}

impl Error {
    pub(crate) fn interface(name: &str, reason: &'static str) -> Self {
        Error::Interface {
            name: name.to_string(),
            reason,
        }
    }

    pub(crate) fn peer(name: &str, public_key: Key, reason: &'static str) -> Self {
        Error::Peer {
            name: name.to_string(),
            public_key,
            reason,
        }
    }

    /// Absent, as opposed to failed.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::InterfaceNotFound(_) | Error::PeerNotFound { .. }
        )
    }
}

/// External tool exited non-zero and said why on stderr.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command \"{command}\" execution error \"{stderr}\" (code: {code:?})")]
pub struct CommandError {
    pub command: String,
    pub stderr: String,
    pub code: Option<i32>,
}
