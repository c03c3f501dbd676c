use std::fmt;
use std::net::Ipv4Addr;

use crate::{Error, Result};

/// Network address of the management overlay (`10.13.13.0/24`).
pub const OVERLAY_NETWORK: Ipv4Addr = Ipv4Addr::new(10, 13, 13, 0);

/// Prefix length of the overlay. Fixed: every host octet maps to one endpoint.
pub const OVERLAY_PREFIX: u8 = 24;

/// WireGuard's conventional listen port.
pub const DEFAULT_TUNNEL_PORT: u16 = 51820;

/// `.0` is the network, `.1` the server, `.255` broadcast.
pub const MAX_PEERS: usize = 253;

/// Fixed point-to-site overlay: the instance is `.1`, peers follow in
/// request order starting at `.2`.
///
/// The index→address mapping is a pure function so a lost bundle can be
/// regenerated without any provider state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelTopology {
    port: u16,
}

impl TunnelTopology {
    pub fn new(port: u16) -> Result<Self> {
        if port == 0 {
            return Err(Error::InputValidation {
                field: "tunnel port",
                reason: "port 0 cannot be listened on".into(),
            });
        }
        Ok(Self { port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn server_address(&self) -> Ipv4Addr {
        host(1)
    }

    /// Overlay address of the peer at zero-based `index`.
    pub fn peer_address(&self, index: usize) -> Result<Ipv4Addr> {
        if index >= MAX_PEERS {
            return Err(Error::InputValidation {
                field: "peer count",
                reason: format!("at most {MAX_PEERS} peers fit in a /{OVERLAY_PREFIX}"),
            });
        }
        Ok(host(index as u8 + 2))
    }

    pub fn subnet(&self) -> Subnet {
        Subnet
    }
}

impl Default for TunnelTopology {
    fn default() -> Self {
        Self {
            port: DEFAULT_TUNNEL_PORT,
        }
    }
}

/// Displays as `10.13.13.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet;

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{OVERLAY_NETWORK}/{OVERLAY_PREFIX}")
    }
}

fn host(last: u8) -> Ipv4Addr {
    let [a, b, c, _] = OVERLAY_NETWORK.octets();
    Ipv4Addr::new(a, b, c, last)
}

/// Validate an operator-requested peer count.
pub fn validate_peer_count(peers: usize) -> Result<()> {
    if peers == 0 {
        return Err(Error::InputValidation {
            field: "peer count",
            reason: "at least one device must be able to join the tunnel".into(),
        });
    }
    if peers > MAX_PEERS {
        return Err(Error::InputValidation {
            field: "peer count",
            reason: format!("at most {MAX_PEERS} peers fit in a /{OVERLAY_PREFIX}"),
        });
    }
    Ok(())
}
