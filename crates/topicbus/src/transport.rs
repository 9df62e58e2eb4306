//! Channel name → endpoint address resolution.
//!
//! Both peers compute the address independently, so every scheme here is fixed:
//! - **Ipc**: `{ipc_dir}/{channel}.ipc` (Unix domain socket)
//! - **Network**: `{network_host}:{port_base + fnv1a_32(channel) % port_span}` (TCP)
//! - **Inproc**: the channel name, scoped to the current process

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::BusConfig;
use crate::error::{Error, Result};

pub const MAX_CHANNEL_NAME_LEN: usize = 100;

/// `sun_path` is 108 bytes including the trailing NUL.
const MAX_IPC_PATH_LEN: usize = 107;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local machine, Unix domain socket.
    Ipc,
    /// TCP host:port.
    Network,
    /// Same process, in-memory streams.
    Inproc,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Network => "network",
            Self::Inproc => "inproc",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipc" => Ok(Self::Ipc),
            "network" | "tcp" => Ok(Self::Network),
            "inproc" => Ok(Self::Inproc),
            other => Err(format!(
                "unknown transport '{other}', expected ipc, network or inproc"
            )),
        }
    }
}

/// A resolved endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipc(PathBuf),
    Network { host: String, port: u16 },
    Inproc(String),
}

impl Address {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Ipc(_) => TransportKind::Ipc,
            Self::Network { .. } => TransportKind::Network,
            Self::Inproc(_) => TransportKind::Inproc,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Self::Network { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Inproc(name) => write!(f, "inproc://{name}"),
        }
    }
}

/// Resolve a channel name to the address both peers will use.
pub fn resolve(channel: &str, kind: TransportKind, config: &BusConfig) -> Result<Address> {
    validate_channel_name(channel)?;

    match kind {
        TransportKind::Ipc => {
            let path = config.ipc_dir.join(format!("{channel}.ipc"));
            let len = path.as_os_str().len();
            if len > MAX_IPC_PATH_LEN {
                return Err(Error::invalid_channel(
                    channel,
                    format!("socket path is {len} bytes, limit is {MAX_IPC_PATH_LEN}"),
                ));
            }
            Ok(Address::Ipc(path))
        }
        TransportKind::Network => Ok(Address::Network {
            host: config.network_host.clone(),
            port: channel_port(channel, config.port_base, config.port_span),
        }),
        TransportKind::Inproc => Ok(Address::Inproc(channel.to_string())),
    }
}

/// Channel names are address tokens: `[A-Za-z0-9_.-]`, not starting with `.`.
pub fn validate_channel_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_channel(name, "name is empty"));
    }
    if name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(Error::invalid_channel(
            name,
            format!("longer than {MAX_CHANNEL_NAME_LEN} bytes"),
        ));
    }
    if name.starts_with('.') {
        return Err(Error::invalid_channel(name, "may not start with '.'"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(Error::invalid_channel(
            name,
            format!("contains illegal character {bad:?}"),
        ));
    }
    Ok(())
}

/// Port for a network channel. The span is clipped so the result stays a valid port.
pub fn channel_port(channel: &str, port_base: u16, port_span: u16) -> u16 {
    let room = u32::from(u16::MAX) - u32::from(port_base) + 1;
    let span = u32::from(port_span).clamp(1, room);
    let offset = fnv1a_32(channel.as_bytes()) % span;
    (u32::from(port_base) + offset) as u16
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}
