use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hcloud::apis::configuration::Configuration;
use hcloud::apis::{firewalls_api, images_api, servers_api};
use hcloud::models;
use tracing::{info, warn};

use crate::types::{
    Instance, InstanceSpec, InstanceState, Teardown, firewall_name, parse_address,
};
use crate::wait::{DEFAULT_POLL_INTERVAL, poll_until, retry};
use crate::{Error, InstanceProvider, MANAGED_TAG, ProviderName, Result};

const LABEL_KEY: &str = "managed-by";
const FIREWALL_DELETE_TIMEOUT: Duration = Duration::from_secs(60);
const IMAGES_PER_PAGE: i64 = 50;

/// Keep the HTTP status so the waits can tell a rate limit from a bad token.
fn hcloud_error<T>(context: &str, e: hcloud::apis::Error<T>) -> Error {
    match e {
        hcloud::apis::Error::ResponseError(resp) => Error::Hetzner {
            message: format!("{context}: status {}: {}", resp.status, resp.content.trim()),
            status: Some(resp.status.as_u16()),
        },
        other => Error::Hetzner {
            message: format!("{context}: {other}"),
            status: None,
        },
    }
}

fn unexpected(message: impl Into<String>) -> Error {
    Error::Hetzner {
        message: message.into(),
        status: None,
    }
}

/// Newest image (by creation time) whose name starts with `pattern`.
fn newest_matching(images: &[models::Image], pattern: &str) -> Option<(String, String)> {
    images
        .iter()
        .filter_map(|image| image.name.as_ref().map(|name| (name.clone(), image.created.clone())))
        .filter(|(name, _)| name.starts_with(pattern))
        .max_by(|a, b| a.1.cmp(&b.1))
}

/// Hetzner Cloud provider using the `hcloud` crate.
///
/// All configuration is loaded from environment variables via `from_env()`.
pub struct HetznerProvider {
    config: Configuration,
    poll_interval: Duration,
}

impl HetznerProvider {
    /// Create from env vars:
    ///
    /// - `HETZNER_API_TOKEN` (required)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("HETZNER_API_TOKEN")
            .map_err(|_| Error::MissingEnv("HETZNER_API_TOKEN".into()))?;

        let mut config = Configuration::new();
        config.bearer_access_token = Some(token);

        Ok(Self {
            config,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    fn parse_state(status: &models::server::Status) -> InstanceState {
        match status {
            models::server::Status::Running => InstanceState::Running,
            models::server::Status::Initializing | models::server::Status::Starting => {
                InstanceState::Creating
            }
            models::server::Status::Off | models::server::Status::Stopping => {
                InstanceState::Stopped
            }
            models::server::Status::Deleting => InstanceState::Destroying,
            _ => InstanceState::Unknown,
        }
    }

    fn to_instance(server: &models::Server) -> Instance {
        let mut instance = Instance::new(
            server.id.to_string(),
            server.name.clone(),
            Self::parse_state(&server.status),
        );
        instance.address = parse_address(server.public_net.ipv4.as_ref().map(|v4| v4.ip.as_str()));
        instance
    }

    fn parse_id(raw: &str) -> Result<i64> {
        raw.parse::<i64>()
            .map_err(|_| Error::InvalidId(raw.to_string()))
    }

    fn label_selector() -> String {
        format!("{LABEL_KEY}={MANAGED_TAG}")
    }

    /// Newest available system image whose name starts with `pattern`,
    /// across every page of the listing.
    async fn resolve_image(&self, pattern: &str) -> Result<String> {
        let mut best: Option<(String, String)> = None;
        let mut page = Some(1);

        while let Some(current) = page {
            let resp = images_api::list_images(
                &self.config,
                images_api::ListImagesParams {
                    r#type: Some(vec!["system".into()]),
                    status: Some(vec!["available".into()]),
                    page: Some(current),
                    per_page: Some(IMAGES_PER_PAGE),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| hcloud_error("list images", e))?;

            if let Some(found) = newest_matching(&resp.images, pattern) {
                if best.as_ref().is_none_or(|b| found.1 > b.1) {
                    best = Some(found);
                }
            }
            page = resp.meta.pagination.next_page;
        }

        best.map(|(name, _)| name).ok_or_else(|| Error::ImageNotFound {
            provider: ProviderName::Hetzner,
            pattern: pattern.to_string(),
        })
    }

    async fn find_firewall(&self, name: &str) -> Result<Option<i64>> {
        let resp = firewalls_api::list_firewalls(
            &self.config,
            firewalls_api::ListFirewallsParams {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| hcloud_error("list firewalls", e))?;

        Ok(resp.firewalls.into_iter().find(|fw| fw.name == name).map(|fw| fw.id))
    }

    /// Reuse `<name>-fw` or create it: SSH from the configured sources,
    /// the tunnel port from anywhere.
    async fn ensure_firewall(&self, spec: &InstanceSpec<'_>) -> Result<i64> {
        let name = spec.firewall_name();
        if let Some(id) = self.find_firewall(&name).await? {
            info!(firewall_id = id, "hetzner: reusing firewall");
            return Ok(id);
        }

        use models::rule::{Direction, Protocol};

        let mut ssh = models::Rule::new(Direction::In, Protocol::Tcp);
        ssh.port = Some(Some("22".into()));
        ssh.source_ips = Some(spec.ssh_sources.to_vec());
        ssh.description = Some(Some("ssh".into()));

        let mut tunnel = models::Rule::new(Direction::In, Protocol::Udp);
        tunnel.port = Some(Some(spec.tunnel_port.to_string()));
        tunnel.source_ips = Some(vec!["0.0.0.0/0".into(), "::/0".into()]);
        tunnel.description = Some(Some("wireguard".into()));

        let mut request = models::CreateFirewallRequest::new(name.clone());
        request.rules = Some(vec![ssh, tunnel]);

        firewalls_api::create_firewall(
            &self.config,
            firewalls_api::CreateFirewallParams {
                create_firewall_request: request,
            },
        )
        .await
        .map_err(|e| hcloud_error("create firewall", e))?;

        let id = self
            .find_firewall(&name)
            .await?
            .ok_or_else(|| unexpected(format!("firewall {name} missing after create")))?;
        info!(firewall_id = id, "hetzner: firewall created");
        Ok(id)
    }

    async fn delete_firewall(&self, name: &str) -> Result<()> {
        let Some(id) = self.find_firewall(name).await? else {
            return Ok(());
        };

        // Still attached until the server deletion has propagated.
        let what = "hetzner firewall delete";
        retry(what, FIREWALL_DELETE_TIMEOUT, self.poll_interval, move || async move {
            let params = firewalls_api::DeleteFirewallParams { id };
            match firewalls_api::delete_firewall(&self.config, params).await {
                Ok(_) => Ok(()),
                Err(e) => match hcloud_error("delete firewall", e) {
                    e if e.status() == Some(404) => Ok(()),
                    e if matches!(e.status(), Some(409 | 422 | 423)) => {
                        Err(Error::Busy(format!("firewall {id}")))
                    }
                    e => Err(e),
                },
            }
        })
        .await?;

        info!(firewall_id = id, "hetzner: firewall deleted");
        Ok(())
    }
}

#[async_trait]
impl InstanceProvider for HetznerProvider {
    async fn launch(&self, spec: &InstanceSpec<'_>) -> Result<Instance> {
        let pattern = spec.image.unwrap_or(ProviderName::Hetzner.default_image());
        let image = self.resolve_image(pattern).await?;
        let firewall = self.ensure_firewall(spec).await?;

        let labels = HashMap::from([(LABEL_KEY.to_string(), MANAGED_TAG.to_string())]);

        let resp = servers_api::create_server(
            &self.config,
            servers_api::CreateServerParams {
                create_server_request: models::CreateServerRequest {
                    name: spec.name.to_string(),
                    server_type: spec.size.to_string(),
                    image,
                    location: Some(spec.region.to_string()),
                    user_data: Some(spec.user_data.to_string()),
                    networks: None,
                    firewalls: Some(vec![models::CreateServerRequestFirewalls { firewall }]),
                    ssh_keys: None,
                    volumes: None,
                    start_after_create: Some(true),
                    automount: None,
                    datacenter: None,
                    labels: Some(labels),
                    placement_group: None,
                    public_net: None,
                },
            },
        )
        .await
        .map_err(|e| hcloud_error("create server", e))?;

        let server = resp.server;
        info!(server_id = server.id, "hetzner: server created");

        let mut instance = Self::to_instance(&server);
        instance.region = Some(spec.region.to_string());
        Ok(instance)
    }

    async fn wait_until_running(&self, instance: &Instance, timeout: Duration) -> Result<Instance> {
        let server_id = Self::parse_id(&instance.id.0)?;
        let region = instance.region.clone();

        let what = "hetzner server to run";
        let mut running = poll_until(what, timeout, self.poll_interval, move || async move {
            let params = servers_api::GetServerParams { id: server_id };
            let resp = servers_api::get_server(&self.config, params)
                .await
                .map_err(|e| hcloud_error("get server", e))?;
            let server = resp
                .server
                .ok_or_else(|| unexpected("server not found in response"))?;
            let current = Self::to_instance(&server);
            Ok((current.is_running() && current.address.is_some()).then_some(current))
        })
        .await?;

        running.region = region;
        Ok(running)
    }

    async fn destroy(&self, target: &Teardown<'_>) -> Result<()> {
        let server_id = match target.id {
            Some(id) => Some(Self::parse_id(&id.0)?),
            None => match self.find(target.name).await? {
                Some(found) => Some(Self::parse_id(&found.id.0)?),
                None => None,
            },
        };

        match server_id {
            Some(id) => {
                let params = servers_api::DeleteServerParams { id };
                match servers_api::delete_server(&self.config, params).await {
                    Ok(_) => info!(server_id = id, "hetzner: server destroyed"),
                    Err(e) => match hcloud_error("delete server", e) {
                        e if e.status() == Some(404) => {
                            warn!(server_id = id, "hetzner: server already destroyed")
                        }
                        e => return Err(e),
                    },
                }
            }
            None => warn!(name = target.name, "hetzner: no server to destroy"),
        }

        // Best effort: a leftover firewall costs nothing and is reused by
        // the next deployment with the same name.
        if let Err(e) = self.delete_firewall(&firewall_name(target.name)).await {
            warn!(error = %e, "hetzner: firewall left behind");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let resp = servers_api::list_servers(
            &self.config,
            servers_api::ListServersParams {
                label_selector: Some(Self::label_selector()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| hcloud_error("list servers", e))?;

        Ok(resp.servers.iter().map(Self::to_instance).collect())
    }

    fn name(&self) -> ProviderName {
        ProviderName::Hetzner
    }
}
