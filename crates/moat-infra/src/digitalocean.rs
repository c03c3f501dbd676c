use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use do_api::{
    Addresses, CreateDropletRequest, CreateFirewallRequest, DoClient, Droplet, InboundRule,
    OutboundRule,
};
use tracing::{info, warn};

use crate::types::{
    Instance, InstanceSpec, InstanceState, Teardown, firewall_name, parse_address,
};
use crate::wait::{DEFAULT_POLL_INTERVAL, poll_until, retry};
use crate::{Error, InstanceProvider, MANAGED_TAG, ProviderName, Result};

const RESERVED_IP_TIMEOUT: Duration = Duration::from_secs(180);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Reserved IP lifecycle, split out so allocation and cleanup can be
/// exercised without the API.
#[async_trait]
trait ReservedIps: Send + Sync {
    async fn create_ip(&self, region: &str) -> Result<String>;

    /// Returns once the assignment has settled.
    async fn assign_ip(&self, ip: &str, droplet_id: u64) -> Result<()>;

    async fn unassign_ip(&self, ip: &str) -> Result<()>;

    /// Deleting an address that is already gone succeeds.
    async fn delete_ip(&self, ip: &str) -> Result<()>;

    /// Every reserved IP on the account with the droplet it points at.
    async fn list_ips(&self) -> Result<Vec<(String, Option<u64>)>>;
}

/// Allocate a reserved IP and assign it to the droplet. An address that
/// cannot be assigned is released again; if that fails too the error
/// carries the address so it can be recorded and cleaned up later.
async fn pin_reserved_ip(ips: &dyn ReservedIps, region: &str, droplet_id: u64) -> Result<String> {
    let ip = ips.create_ip(region).await?;
    info!(reserved_ip = %ip, "digitalocean: reserved ip created");

    if let Err(e) = ips.assign_ip(&ip, droplet_id).await {
        warn!(reserved_ip = %ip, error = %e, "digitalocean: assign failed, releasing");
        if let Err(release) = release_one(ips, &ip).await {
            return Err(Error::AddressLeftBehind {
                address: ip,
                reason: format!("{e}; release failed: {release}"),
            });
        }
        return Err(e);
    }

    info!(reserved_ip = %ip, droplet_id, "digitalocean: reserved ip assigned");
    Ok(ip)
}

async fn release_one(ips: &dyn ReservedIps, ip: &str) -> Result<()> {
    if let Err(e) = ips.unassign_ip(ip).await {
        warn!(reserved_ip = %ip, error = %e, "digitalocean: unassign failed");
    }
    ips.delete_ip(ip).await?;
    info!(reserved_ip = %ip, "digitalocean: reserved ip released");
    Ok(())
}

/// Release the reserved IPs pointing at `droplet_id` and the `recorded`
/// address, assigned or not.
async fn release_reserved_ips(
    ips: &dyn ReservedIps,
    droplet_id: Option<u64>,
    recorded: Option<IpAddr>,
) -> Result<()> {
    let recorded = recorded.map(|addr| addr.to_string());
    let owned: Vec<String> = ips
        .list_ips()
        .await?
        .into_iter()
        .filter(|(ip, droplet)| {
            recorded.as_deref() == Some(ip.as_str())
                || droplet.is_some_and(|d| Some(d) == droplet_id)
        })
        .map(|(ip, _)| ip)
        .collect();

    for ip in owned {
        release_one(ips, &ip).await?;
    }
    Ok(())
}

/// DigitalOcean provider using the `do-api` client.
pub struct DigitalOceanProvider {
    client: DoClient,
    poll_interval: Duration,
}

impl DigitalOceanProvider {
    /// Create from env vars:
    ///
    /// - `DIGITALOCEAN_TOKEN` (required)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("DIGITALOCEAN_TOKEN")
            .map_err(|_| Error::MissingEnv("DIGITALOCEAN_TOKEN".into()))?;

        Ok(Self {
            client: DoClient::new(token),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    fn parse_state(status: &str) -> InstanceState {
        match status {
            "new" => InstanceState::Creating,
            "active" => InstanceState::Running,
            "off" | "archive" => InstanceState::Stopped,
            _ => InstanceState::Unknown,
        }
    }

    fn to_instance(droplet: &Droplet) -> Instance {
        let mut instance = Instance::new(
            droplet.id.to_string(),
            droplet.name.clone(),
            Self::parse_state(&droplet.status),
        );
        instance.address = parse_address(droplet.public_ipv4());
        instance.region = droplet.region.as_ref().map(|r| r.slug.clone());
        instance
    }

    fn parse_id(raw: &str) -> Result<u64> {
        raw.parse::<u64>()
            .map_err(|_| Error::InvalidId(raw.to_string()))
    }

    /// Newest distribution image whose slug starts with `pattern` and that
    /// is available in `region`.
    async fn resolve_image(&self, pattern: &str, region: &str) -> Result<serde_json::Value> {
        let images = self.client.list_distribution_images().await?;

        images
            .into_iter()
            .filter(|i| i.slug.as_deref().is_some_and(|s| s.starts_with(pattern)))
            .filter(|i| i.regions.is_empty() || i.regions.iter().any(|r| r == region))
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .map(|i| match i.slug {
                Some(slug) => serde_json::Value::String(slug),
                None => serde_json::Value::from(i.id),
            })
            .ok_or_else(|| Error::ImageNotFound {
                provider: ProviderName::DigitalOcean,
                pattern: pattern.to_string(),
            })
    }

    /// Reuse `<name>-fw` or create it: SSH from the configured sources,
    /// the tunnel port from anywhere, all outbound allowed.
    async fn ensure_firewall(&self, spec: &InstanceSpec<'_>) -> Result<String> {
        let name = spec.firewall_name();
        let existing = self.client.list_firewalls().await?;
        if let Some(fw) = existing.into_iter().find(|f| f.name == name) {
            info!(firewall_id = %fw.id, "digitalocean: reusing firewall");
            return Ok(fw.id);
        }

        let anywhere = || Addresses {
            addresses: vec!["0.0.0.0/0".into(), "::/0".into()],
        };
        let outbound = |protocol: &str, ports: &str| OutboundRule {
            protocol: protocol.into(),
            ports: ports.into(),
            destinations: anywhere(),
        };

        let fw = self
            .client
            .create_firewall(&CreateFirewallRequest {
                name,
                inbound_rules: vec![
                    InboundRule {
                        protocol: "tcp".into(),
                        ports: "22".into(),
                        sources: Addresses {
                            addresses: spec.ssh_sources.to_vec(),
                        },
                    },
                    InboundRule {
                        protocol: "udp".into(),
                        ports: spec.tunnel_port.to_string(),
                        sources: anywhere(),
                    },
                ],
                outbound_rules: vec![
                    outbound("tcp", "all"),
                    outbound("udp", "all"),
                    outbound("icmp", "all"),
                ],
                droplet_ids: Vec::new(),
            })
            .await?;

        info!(firewall_id = %fw.id, "digitalocean: firewall created");
        Ok(fw.id)
    }

    async fn wait_for_action(&self, action_id: u64) -> Result<()> {
        let what = "digitalocean action";
        poll_until(what, RESERVED_IP_TIMEOUT, self.poll_interval, move || async move {
            let action = self.client.get_action(action_id).await?;
            if action.is_errored() {
                let msg = format!("digitalocean action {action_id} errored");
                return Err(Error::ActionFailed(msg));
            }
            Ok(action.is_done().then_some(()))
        })
        .await
    }

    async fn delete_firewall(&self, name: &str) -> Result<()> {
        let existing = self.client.list_firewalls().await?;
        let Some(fw) = existing.into_iter().find(|f| f.name == name) else {
            return Ok(());
        };
        let id = fw.id.as_str();
        let what = "digitalocean firewall delete";
        retry(what, CLEANUP_TIMEOUT, self.poll_interval, move || async move {
            self.client.delete_firewall(id).await.map_err(Error::from)
        })
        .await?;
        info!(firewall_id = %fw.id, "digitalocean: firewall deleted");
        Ok(())
    }
}

#[async_trait]
impl ReservedIps for DigitalOceanProvider {
    async fn create_ip(&self, region: &str) -> Result<String> {
        let what = "digitalocean reserved ip";
        let reserved = retry(what, RESERVED_IP_TIMEOUT, self.poll_interval, move || async move {
            self.client.create_reserved_ip(region).await.map_err(Error::from)
        })
        .await?;
        Ok(reserved.ip)
    }

    async fn assign_ip(&self, ip: &str, droplet_id: u64) -> Result<()> {
        // A fresh droplet rejects the assign while its create event is pending.
        let what = "digitalocean reserved ip assign";
        let action = retry(what, RESERVED_IP_TIMEOUT, self.poll_interval, move || async move {
            match self.client.assign_reserved_ip(ip, droplet_id).await {
                Ok(action) => Ok(action),
                Err(e) if e.is_conflict() => Err(Error::Busy(format!("droplet {droplet_id}"))),
                Err(e) => Err(e.into()),
            }
        })
        .await?;
        self.wait_for_action(action.id).await
    }

    async fn unassign_ip(&self, ip: &str) -> Result<()> {
        match self.client.unassign_reserved_ip(ip).await {
            Ok(action) => self.wait_for_action(action.id).await,
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_ip(&self, ip: &str) -> Result<()> {
        let what = "digitalocean reserved ip delete";
        retry(what, CLEANUP_TIMEOUT, self.poll_interval, move || async move {
            match self.client.delete_reserved_ip(ip).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_conflict() => Err(Error::Busy(format!("reserved ip {ip}"))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn list_ips(&self) -> Result<Vec<(String, Option<u64>)>> {
        let reserved = self.client.list_reserved_ips().await?;
        Ok(reserved
            .into_iter()
            .map(|ip| (ip.ip, ip.droplet.map(|d| d.id)))
            .collect())
    }
}

#[async_trait]
impl InstanceProvider for DigitalOceanProvider {
    async fn launch(&self, spec: &InstanceSpec<'_>) -> Result<Instance> {
        let pattern = spec.image.unwrap_or(ProviderName::DigitalOcean.default_image());
        let image = self.resolve_image(pattern, spec.region).await?;
        let firewall_id = self.ensure_firewall(spec).await?;

        let droplet = self
            .client
            .create_droplet(&CreateDropletRequest {
                name: spec.name.to_string(),
                region: spec.region.to_string(),
                size: spec.size.to_string(),
                image,
                user_data: spec.user_data.to_string(),
                tags: vec![MANAGED_TAG.to_string()],
                ipv6: false,
                monitoring: false,
            })
            .await?;
        info!(droplet_id = droplet.id, "digitalocean: droplet created");

        self.client
            .add_droplets_to_firewall(&firewall_id, &[droplet.id])
            .await?;
        info!(
            droplet_id = droplet.id,
            firewall_id = %firewall_id,
            "digitalocean: firewall attached"
        );

        let mut instance = Self::to_instance(&droplet);
        instance.region.get_or_insert_with(|| spec.region.to_string());
        Ok(instance)
    }

    async fn wait_until_running(&self, instance: &Instance, timeout: Duration) -> Result<Instance> {
        let droplet_id = Self::parse_id(&instance.id.0)?;
        let what = "digitalocean droplet to run";
        poll_until(what, timeout, self.poll_interval, move || async move {
            let droplet = self.client.get_droplet(droplet_id).await?;
            let current = Self::to_instance(&droplet);
            Ok((current.is_running() && current.address.is_some()).then_some(current))
        })
        .await
    }

    async fn assign_stable_address(&self, instance: &Instance) -> Result<Instance> {
        let droplet_id = Self::parse_id(&instance.id.0)?;
        let region = instance
            .region
            .as_deref()
            .ok_or_else(|| Error::ActionFailed(format!("droplet {droplet_id} has no region")))?;

        let ip = pin_reserved_ip(self, region, droplet_id).await?;

        let mut pinned = instance.clone();
        pinned.address = parse_address(Some(&ip));
        pinned.static_address = true;
        Ok(pinned)
    }

    async fn destroy(&self, target: &Teardown<'_>) -> Result<()> {
        let droplet_id = match target.id {
            Some(id) => Some(Self::parse_id(&id.0)?),
            None => match self.find(target.name).await? {
                Some(found) => Some(Self::parse_id(&found.id.0)?),
                None => None,
            },
        };

        release_reserved_ips(self, droplet_id, target.reserved_address).await?;

        match droplet_id {
            Some(id) => {
                self.client.delete_droplet(id).await?;
                info!(droplet_id = id, "digitalocean: droplet destroyed");
            }
            None => warn!(name = target.name, "digitalocean: no droplet to destroy"),
        }

        if let Err(e) = self.delete_firewall(&firewall_name(target.name)).await {
            warn!(error = %e, "digitalocean: firewall left behind");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let droplets = self.client.list_droplets_by_tag(MANAGED_TAG).await?;
        Ok(droplets.iter().map(Self::to_instance).collect())
    }

    fn name(&self) -> ProviderName {
        ProviderName::DigitalOcean
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// In-memory account: reserved IPs and the droplet each points at.
    #[derive(Default)]
    struct FakeIps {
        ips: Mutex<Vec<(String, Option<u64>)>>,
        fail_assign: bool,
        fail_delete: bool,
    }

    impl FakeIps {
        fn with(ips: &[(&str, Option<u64>)]) -> Self {
            let ips = ips.iter().map(|(ip, d)| (ip.to_string(), *d)).collect();
            Self {
                ips: Mutex::new(ips),
                ..Default::default()
            }
        }

        fn held(&self) -> Vec<String> {
            self.ips.lock().unwrap().iter().map(|(ip, _)| ip.clone()).collect()
        }
    }

    fn rejected(endpoint: &'static str) -> Error {
        Error::DigitalOcean(do_api::Error::Api {
            endpoint,
            status: reqwest::StatusCode::UNPROCESSABLE_ENTITY,
            body: "droplet already has a pending event".into(),
        })
    }

    #[async_trait]
    impl ReservedIps for FakeIps {
        async fn create_ip(&self, _region: &str) -> Result<String> {
            let mut ips = self.ips.lock().unwrap();
            let ip = format!("203.0.113.{}", 10 + ips.len());
            ips.push((ip.clone(), None));
            Ok(ip)
        }

        async fn assign_ip(&self, ip: &str, droplet_id: u64) -> Result<()> {
            if self.fail_assign {
                return Err(rejected("assign reserved ip"));
            }
            for entry in self.ips.lock().unwrap().iter_mut().filter(|(i, _)| i == ip) {
                entry.1 = Some(droplet_id);
            }
            Ok(())
        }

        async fn unassign_ip(&self, ip: &str) -> Result<()> {
            for entry in self.ips.lock().unwrap().iter_mut().filter(|(i, _)| i == ip) {
                entry.1 = None;
            }
            Ok(())
        }

        async fn delete_ip(&self, ip: &str) -> Result<()> {
            if self.fail_delete {
                return Err(rejected("delete reserved ip"));
            }
            self.ips.lock().unwrap().retain(|(i, _)| i != ip);
            Ok(())
        }

        async fn list_ips(&self) -> Result<Vec<(String, Option<u64>)>> {
            Ok(self.ips.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn pinned_ip_points_at_the_droplet() {
        let ips = FakeIps::default();
        let ip = pin_reserved_ip(&ips, "fra1", 42).await.unwrap();
        assert_eq!(ips.list_ips().await.unwrap(), vec![(ip, Some(42))]);
    }

    #[tokio::test]
    async fn failed_assign_releases_the_new_ip() {
        let ips = FakeIps {
            fail_assign: true,
            ..Default::default()
        };
        let err = pin_reserved_ip(&ips, "fra1", 42).await.unwrap_err();
        assert_eq!(err.status(), Some(422));
        assert!(ips.held().is_empty());
    }

    #[tokio::test]
    async fn unreleasable_ip_is_reported_by_address() {
        let ips = FakeIps {
            fail_assign: true,
            fail_delete: true,
            ..Default::default()
        };
        match pin_reserved_ip(&ips, "fra1", 42).await {
            Err(Error::AddressLeftBehind { address, .. }) => {
                assert_eq!(ips.held(), vec![address]);
            }
            other => panic!("expected AddressLeftBehind, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_releases_assigned_and_recorded_ips() {
        let ips = FakeIps::with(&[
            ("203.0.113.10", Some(42)),
            ("203.0.113.11", None),
            ("203.0.113.12", Some(7)),
            ("203.0.113.13", None),
        ]);
        let recorded = "203.0.113.11".parse().ok();

        release_reserved_ips(&ips, Some(42), recorded).await.unwrap();
        assert_eq!(ips.held(), vec!["203.0.113.12", "203.0.113.13"]);
    }

    #[tokio::test]
    async fn teardown_without_droplet_still_releases_the_recorded_ip() {
        let ips = FakeIps::with(&[("203.0.113.10", None), ("203.0.113.11", None)]);
        let recorded = "203.0.113.10".parse().ok();

        release_reserved_ips(&ips, None, recorded).await.unwrap();
        assert_eq!(ips.held(), vec!["203.0.113.11"]);
    }

    #[test]
    fn droplet_states_map_to_lifecycle() {
        assert_eq!(DigitalOceanProvider::parse_state("new"), InstanceState::Creating);
        assert_eq!(DigitalOceanProvider::parse_state("active"), InstanceState::Running);
        assert_eq!(DigitalOceanProvider::parse_state("archive"), InstanceState::Stopped);
        assert_eq!(DigitalOceanProvider::parse_state("weird"), InstanceState::Unknown);
    }

    #[test]
    fn droplet_ids_must_be_numeric() {
        assert_eq!(DigitalOceanProvider::parse_id("3164444").unwrap(), 3164444);
        assert!(DigitalOceanProvider::parse_id("moat-1").is_err());
    }
}
