pub mod digitalocean;
pub mod exec;
pub mod hetzner;
pub mod lightsail;
pub mod multipass;
pub mod types;
pub mod wait;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moat_core::profile::{FirewallPolicy, LoginAccount, ProviderProfile, Transport};
use serde::{Deserialize, Serialize};
use types::{Instance, InstanceSpec, Teardown};

/// Tag/label applied to every cloud instance this tool creates.
pub const MANAGED_TAG: &str = "moat";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `status` is `None` when no HTTP response arrived.
    #[error("hetzner api error: {message}")]
    Hetzner { message: String, status: Option<u16> },

    #[error("digitalocean error: {0}")]
    DigitalOcean(#[from] do_api::Error),

    #[error("lightsail error: {0}")]
    Lightsail(String),

    #[error("multipass error: {0}")]
    Multipass(String),

    #[error("no {provider} image matches `{pattern}`")]
    ImageNotFound { provider: ProviderName, pattern: String },

    #[error("provider action failed: {0}")]
    ActionFailed(String),

    #[error("timed out after {secs}s waiting for {what}{}", last_error(.last))]
    Timeout {
        what: &'static str,
        secs: u64,
        last: Option<String>,
    },

    /// The resource is locked or still in use by something being torn down.
    #[error("{0} is still busy")]
    Busy(String),

    #[error("address {address} is still allocated: {reason}")]
    AddressLeftBehind { address: String, reason: String },

    #[error("required tool `{0}` is not installed or not on PATH")]
    MissingTool(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// AWS error codes that no amount of waiting fixes.
const PERMANENT_AWS_ERRORS: &[&str] = &[
    "AccessDenied",
    "UnauthenticatedException",
    "UnrecognizedClientException",
    "InvalidClientTokenId",
    "ExpiredToken",
    "NotFoundException",
    "Unable to locate credentials",
];

fn last_error(last: &Option<String>) -> String {
    last.as_deref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

/// Rate limits and server-side failures; every other 4xx is final.
pub fn retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

impl Error {
    /// Provider-side failures that may clear up on their own. Only the
    /// bounded waits act on this.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Hetzner { status, .. } => status.is_none_or(retryable_status),
            Self::DigitalOcean(e) => e.is_transient(),
            Self::Lightsail(msg) => !PERMANENT_AWS_ERRORS.iter().any(|code| msg.contains(code)),
            Self::Multipass(msg) => !msg.contains("does not exist"),
            Self::Busy(_) => true,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Hetzner { status, .. } => *status,
            Self::DigitalOcean(e) => e.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Known provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Local,
    Hetzner,
    DigitalOcean,
    Lightsail,
}

impl ProviderName {
    pub const ALL: [ProviderName; 4] = [
        Self::Local,
        Self::Hetzner,
        Self::DigitalOcean,
        Self::Lightsail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Hetzner => "hetzner",
            Self::DigitalOcean => "digitalocean",
            Self::Lightsail => "lightsail",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Local => "Local VM (Multipass)",
            Self::Hetzner => "Hetzner Cloud",
            Self::DigitalOcean => "DigitalOcean",
            Self::Lightsail => "AWS Lightsail",
        }
    }

    /// How the first-boot document has to be shaped for this provider.
    pub fn profile(&self) -> ProviderProfile {
        match self {
            Self::Local => ProviderProfile {
                account: LoginAccount::ubuntu(),
                tunnel: false,
                firewall: FirewallPolicy::HostOnly,
                transport: Transport::CloudConfigFile,
                stable_address: false,
            },
            Self::Hetzner => ProviderProfile {
                account: LoginAccount::root(),
                tunnel: true,
                firewall: FirewallPolicy::Edge,
                transport: Transport::CloudConfigInline,
                stable_address: false,
            },
            Self::DigitalOcean => ProviderProfile {
                account: LoginAccount::root(),
                tunnel: true,
                firewall: FirewallPolicy::Edge,
                transport: Transport::CloudConfigInline,
                stable_address: true,
            },
            // The public-port list cannot tell tunnel peers from the
            // internet, so SSH is confined on the host.
            Self::Lightsail => ProviderProfile {
                account: LoginAccount::ubuntu(),
                tunnel: true,
                firewall: FirewallPolicy::HostOnly,
                transport: Transport::ScriptFile,
                stable_address: true,
            },
        }
    }

    pub fn regions(&self) -> &'static [&'static str] {
        match self {
            Self::Local => &["local"],
            Self::Hetzner => &["fsn1", "nbg1", "hel1", "ash", "hil", "sin"],
            Self::DigitalOcean => &["fra1", "ams3", "lon1", "nyc3", "sfo3", "tor1", "sgp1", "syd1"],
            Self::Lightsail => &[
                "eu-central-1",
                "eu-west-1",
                "us-east-1",
                "us-west-2",
                "ap-southeast-1",
                "ap-northeast-1",
            ],
        }
    }

    pub fn sizes(&self) -> &'static [&'static str] {
        match self {
            Self::Local => &["small", "medium", "large"],
            Self::Hetzner => &["cx22", "cpx11", "cpx21", "cpx31"],
            Self::DigitalOcean => &["s-1vcpu-2gb", "s-2vcpu-2gb", "s-2vcpu-4gb", "s-4vcpu-8gb"],
            Self::Lightsail => &["micro_3_0", "small_3_0", "medium_3_0", "large_3_0"],
        }
    }

    /// Image name pattern used when the operator does not pick one.
    pub fn default_image(&self) -> &'static str {
        match self {
            Self::Local => "24.04",
            Self::Hetzner => "ubuntu-24.04",
            Self::DigitalOcean => "ubuntu-24-04-x64",
            Self::Lightsail => "ubuntu_24",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "multipass" => Ok(Self::Local),
            "hetzner" => Ok(Self::Hetzner),
            "digitalocean" | "do" => Ok(Self::DigitalOcean),
            "lightsail" | "aws" => Ok(Self::Lightsail),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Uniform lifecycle contract over the supported backends.
///
/// Each provider owns its own configuration, loaded from environment
/// variables at construction. Providers receive a finished first-boot
/// document and never look inside it.
#[async_trait]
pub trait InstanceProvider: Send + Sync + 'static {
    /// Submit the instance (and any access-control object it needs).
    async fn launch(&self, spec: &InstanceSpec<'_>) -> Result<Instance>;

    /// Bounded poll until the instance reports running with an address.
    async fn wait_until_running(&self, instance: &Instance, timeout: Duration) -> Result<Instance>;

    /// Replace the ephemeral address with one owned by the deployment.
    /// Providers without static addresses keep what they have.
    async fn assign_stable_address(&self, instance: &Instance) -> Result<Instance> {
        Ok(instance.clone())
    }

    /// Remove the instance and everything created alongside it. Resources
    /// already gone count as removed. Works from a partial target left by
    /// an interrupted create.
    async fn destroy(&self, target: &Teardown<'_>) -> Result<()>;

    /// Instances managed by this tool.
    async fn list(&self) -> Result<Vec<Instance>>;

    fn name(&self) -> ProviderName;

    fn profile(&self) -> ProviderProfile {
        self.name().profile()
    }

    /// Launch, wait for running, then pin the address if the provider
    /// supports it.
    async fn create(&self, spec: &InstanceSpec<'_>, timeout: Duration) -> Result<Instance> {
        let launched = self.launch(spec).await?;
        let running = self.wait_until_running(&launched, timeout).await?;
        if self.profile().stable_address {
            self.assign_stable_address(&running).await
        } else {
            Ok(running)
        }
    }

    async fn find(&self, name: &str) -> Result<Option<Instance>> {
        Ok(self.list().await?.into_iter().find(|i| i.name == name))
    }
}

/// Registry of provider backends.
///
/// Each provider is constructed from environment variables at startup.
/// Providers that cannot be built are kept with the reason, so asking for
/// one reports why it is unavailable.
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Arc<dyn InstanceProvider>>,
    unavailable: HashMap<ProviderName, Error>,
}

impl ProviderRegistry {
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn InstanceProvider>> {
        self.providers.get(&name)
    }

    /// Take the provider out of the registry, or the reason it is missing.
    pub fn take(mut self, name: ProviderName) -> Result<Arc<dyn InstanceProvider>> {
        if let Some(provider) = self.providers.remove(&name) {
            return Ok(provider);
        }
        Err(self
            .unavailable
            .remove(&name)
            .unwrap_or_else(|| Error::UnknownProvider(name.to_string())))
    }

    /// Names of all configured providers, in menu order.
    pub fn available(&self) -> Vec<ProviderName> {
        ProviderName::ALL
            .into_iter()
            .filter(|n| self.providers.contains_key(n))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn register<P: InstanceProvider>(&mut self, name: ProviderName, built: Result<P>) {
        match built {
            Ok(p) => {
                tracing::debug!(provider = %name, "registered provider");
                self.providers.insert(name, Arc::new(p));
            }
            Err(e) => {
                tracing::debug!(provider = %name, "skipping provider: {e}");
                self.unavailable.insert(name, e);
            }
        }
    }
}

/// Build every provider whose configuration is present.
pub fn build_providers() -> ProviderRegistry {
    dotenvy::dotenv().ok();

    let mut registry = ProviderRegistry {
        providers: HashMap::new(),
        unavailable: HashMap::new(),
    };

    registry.register(ProviderName::Local, multipass::MultipassProvider::from_env());
    registry.register(ProviderName::Hetzner, hetzner::HetznerProvider::from_env());
    registry.register(ProviderName::DigitalOcean, digitalocean::DigitalOceanProvider::from_env());
    registry.register(ProviderName::Lightsail, lightsail::LightsailProvider::from_env());

    registry
}
