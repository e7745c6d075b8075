use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    dualstack::{
        address::{AddressFamily, SocketKind},
        socket::DualStackSocket,
    },
    error::SocketError,
};

/// Socket options as they appear in a JSON configuration file. Every field is
/// optional; an empty object yields a dual-mode IPv6 stream socket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    /// `None` picks IPv6 with dual mode on.
    pub family: Option<AddressFamily>,
    pub kind: SocketKind,
    pub dual_mode: Option<bool>,
    pub receive_timeout_ms: Option<u64>,
    pub packet_information: bool,
    pub reuse_address: bool,
    pub ttl: Option<u32>,
}

impl SocketConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<SocketConfig> {
        let contents = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }
}

impl DualStackSocket {
    pub fn from_config(config: &SocketConfig) -> Result<DualStackSocket, SocketError> {
        let socket = match config.family {
            None => DualStackSocket::new(config.kind)?,
            Some(family) => DualStackSocket::with_family(family, config.kind)?,
        };
        if let Some(dual) = config.dual_mode {
            socket.set_dual_mode(dual)?;
        }
        socket.set_receive_timeout(config.receive_timeout());
        if config.packet_information {
            socket.set_packet_information(true)?;
        }
        if config.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if let Some(ttl) = config.ttl {
            socket.set_ttl(ttl)?;
        }
        Ok(socket)
    }
}
