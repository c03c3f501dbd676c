use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Opaque provider-side instance identifier (Hetzner server id, droplet id,
/// Lightsail or Multipass instance name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a provider needs to launch one instance. The first-boot
/// document is finished; providers only pass it along.
#[derive(Debug, Clone)]
pub struct InstanceSpec<'a> {
    pub name: &'a str,
    pub region: &'a str,
    pub size: &'a str,
    /// Image name pattern; the provider's default when `None`.
    pub image: Option<&'a str>,
    /// Finished first-boot document, for providers that take it inline.
    pub user_data: &'a str,
    /// The same document on disk, for providers that take a file reference.
    pub user_data_file: &'a Path,
    /// CIDRs allowed to reach SSH through an edge firewall.
    pub ssh_sources: &'a [String],
    pub tunnel_port: u16,
}

impl InstanceSpec<'_> {
    pub fn firewall_name(&self) -> String {
        firewall_name(self.name)
    }
}

/// What `destroy` knows about a deployment. After an interrupted create the
/// instance id may be unknown; providers then look the instance up by name.
#[derive(Debug, Clone, Copy)]
pub struct Teardown<'a> {
    pub name: &'a str,
    pub region: Option<&'a str>,
    pub id: Option<&'a InstanceId>,
    /// Provider-owned address recorded for the deployment, released even
    /// when it is no longer associated with the instance.
    pub reserved_address: Option<IpAddr>,
}

impl<'a> Teardown<'a> {
    /// Target known only by name, as for an instance without a record.
    pub fn by_name(name: &'a str) -> Self {
        Self {
            name,
            region: None,
            id: None,
            reserved_address: None,
        }
    }
}

/// Name of the provider-side access-control object for an instance.
pub fn firewall_name(instance: &str) -> String {
    format!("{instance}-fw")
}

/// Instance status and metadata returned from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub state: InstanceState,
    pub address: Option<IpAddr>,
    /// Address is statically allocated and owned by this deployment.
    pub static_address: bool,
    pub region: Option<String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: InstanceState) -> Self {
        Self {
            id: InstanceId(id.into()),
            name: name.into(),
            state,
            address: None,
            static_address: false,
            region: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }
}

/// Provider-reported lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Creating,
    Running,
    Stopped,
    Destroying,
    Destroyed,
    Unknown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Unknown => "unknown",
        })
    }
}

/// Parse an address string as reported by a provider; empty means none.
pub(crate) fn parse_address(raw: Option<&str>) -> Option<IpAddr> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}
