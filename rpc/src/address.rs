//! Textual peer addresses.
//!
//! An address says how to reach a peer and whom to expect there:
//! `net:host:port~shs:<base64 key>`. The `shs` suffix binds the transport
//! endpoint to the long-term identity the handshake must authenticate; an
//! address without a key is useless and rejected outright.

use mangrove_stream::PublicKey;
use std::{fmt, str::FromStr};
use thiserror::Error;

/// The transport protocols an address can name.
///
/// Parsing recognizes all three; only `net` (plain TCP) is carried in-tree,
/// the WebSocket kinds are satisfied by external transports implementing
/// the duplex contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Net,
    Ws,
    Wss,
}

impl TransportKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Net => "net",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced when parsing an [`Address`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected <transport>:<host>:<port>~shs:<key>")]
    MalformedAddress,
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("expected ~shs key suffix, found: {0}")]
    UnexpectedSuffix(String),
    #[error("invalid peer key")]
    InvalidKey,
}

/// Where a peer can be reached, and the identity to expect there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub key: PublicKey,
}

impl Address {
    pub fn new(transport: TransportKind, host: impl Into<String>, port: u16, key: PublicKey) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            key,
        }
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let mut sections = s.splitn(4, ':');
        let (Some(transport), Some(host), Some(port_suffix), Some(key)) = (
            sections.next(),
            sections.next(),
            sections.next(),
            sections.next(),
        ) else {
            return Err(ParseError::MalformedAddress);
        };

        let transport = match transport {
            "net" => TransportKind::Net,
            "ws" => TransportKind::Ws,
            "wss" => TransportKind::Wss,
            other => return Err(ParseError::UnsupportedTransport(other.to_string())),
        };
        if host.is_empty() {
            return Err(ParseError::MalformedAddress);
        }

        let (port, suffix) = port_suffix
            .split_once('~')
            .ok_or(ParseError::MalformedAddress)?;
        let port: u16 = port
            .parse()
            .map_err(|_| ParseError::InvalidPort(port.to_string()))?;
        if suffix != "shs" {
            return Err(ParseError::UnexpectedSuffix(suffix.to_string()));
        }

        let key = PublicKey::from_base64(key).map_err(|_| ParseError::InvalidKey)?;
        Ok(Self {
            transport,
            host: host.to_string(),
            port,
            key,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}~shs:{}",
            self.transport,
            self.host,
            self.port,
            self.key.to_base64()
        )
    }
}
