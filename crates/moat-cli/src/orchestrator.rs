//! `moat create`: keys, document, instance, address, credentials.
//!
//! Each deployment moves through [`Stage`] strictly forward. The record is
//! written before the provider is called and updated as the instance
//! comes up, so an interrupted run is always visible to `status` and
//! removable with `destroy`.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use colored::Colorize;
use moat_core::bundle;
use moat_core::keys::{self, KeyMaterial, SshKeyChoice};
use moat_core::profile::{FirewallPolicy, ProviderProfile};
use moat_core::template::{self, ApiCredential, BuildOptions, FinalDocument};
use moat_core::tunnel::{TunnelTopology, validate_peer_count};
use moat_infra::types::{Instance, InstanceSpec};
use moat_infra::wait::poll_until;
use moat_infra::{InstanceProvider, ProviderName};
use tokio::net::TcpStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MoatConfig;
use crate::error::{CliError, Result};
use crate::export;
use crate::prompt::Console;
use crate::records::{DeploymentRecord, RecordStore, validate_name};
use crate::ui::{done, spinner, warning};

const SSH_PORT: u16 = 22;
const CONNECT_ATTEMPT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    CollectingInput,
    KeyGeneration,
    DocumentBuild,
    Creating,
    AwaitingRunning,
    AllocatingAddress,
    Ready,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CollectingInput => "collecting-input",
            Self::KeyGeneration => "key-generation",
            Self::DocumentBuild => "document-build",
            Self::Creating => "creating",
            Self::AwaitingRunning => "awaiting-running",
            Self::AllocatingAddress => "allocating-address",
            Self::Ready => "ready",
            Self::Failed => "failed",
        })
    }
}

/// Everything the operator decided. Fixed once confirmed.
#[derive(Debug)]
pub struct DeploymentRequest {
    pub provider: ProviderName,
    pub region: String,
    pub size: String,
    pub name: String,
    pub image: Option<String>,
    pub peers: usize,
    pub ssh_key: SshKeyChoice,
    pub credential: Option<ApiCredential>,
    pub base_document: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub running: Duration,
    pub health: Duration,
    pub health_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            running: Duration::from_secs(600),
            health: Duration::from_secs(180),
            health_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub struct Outcome {
    pub record: DeploymentRecord,
    pub peer_configs: Vec<PathBuf>,
    /// `None` when SSH could not be checked from here.
    pub ssh_reachable: Option<bool>,
}

pub struct Orchestrator<'a> {
    provider: Arc<dyn InstanceProvider>,
    config: &'a MoatConfig,
    store: RecordStore,
    timeouts: Timeouts,
    stage: Stage,
}

impl<'a> Orchestrator<'a> {
    pub fn new(provider: Arc<dyn InstanceProvider>, config: &'a MoatConfig) -> Self {
        Self {
            provider,
            store: RecordStore::new(&config.home),
            config,
            timeouts: Timeouts::default(),
            stage: Stage::CollectingInput,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "stage {} -> {next} goes backwards", self.stage);
        info!(from = %self.stage, to = %next, "deployment stage");
        self.stage = next;
    }

    pub async fn run(
        &mut self,
        request: DeploymentRequest,
        console: &mut Console,
    ) -> Result<Outcome> {
        match self.drive(request, console).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(stage = %self.stage, error = %e, "deployment failed");
                self.advance(Stage::Failed);
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        request: DeploymentRequest,
        console: &mut Console,
    ) -> Result<Outcome> {
        let config = self.config;
        let profile = self.provider.profile();
        let name = request.name.as_str();

        validate_name(name)?;
        if self.store.load(name)?.is_some() {
            return Err(CliError::input(format!(
                "a deployment named `{name}` already exists; destroy it or pick another name"
            )));
        }
        let peer_count = if profile.tunnel {
            validate_peer_count(request.peers)?;
            request.peers
        } else {
            0
        };
        let base = read_base_document(&request.base_document)?;
        let topology = TunnelTopology::new(config.tunnel_port)?;

        self.advance(Stage::KeyGeneration);
        let keys = keys::generate(peer_count, &request.ssh_key)?;

        self.advance(Stage::DocumentBuild);
        let document = template::build(
            &base,
            &keys,
            &profile,
            &BuildOptions {
                topology,
                credential: request.credential.as_ref(),
            },
        )?;
        // Removed on every exit path, including Ctrl-C.
        let work = tempfile::Builder::new().prefix("moat-").tempdir()?;
        let document_path = work.path().join(document.file_name());
        document.write_to(&document_path)?;

        self.summarize(console, &request, &profile, &keys, &document)?;
        if !console.confirm("Create this instance?")? {
            return Err(CliError::cancelled("creation not confirmed", None));
        }

        self.advance(Stage::Creating);
        let ssh_key_path = keys.ssh.persist(&self.store.dir(name)?)?;
        let spec = InstanceSpec {
            name,
            region: &request.region,
            size: &request.size,
            image: request.image.as_deref(),
            user_data: document.as_str(),
            user_data_file: &document_path,
            ssh_sources: &config.ssh_sources,
            tunnel_port: topology.port(),
        };

        // A launch that fails after the provider accepted it can leave
        // resources behind; the record lets `destroy` find them by name.
        let mut record = DeploymentRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            provider: request.provider,
            region: request.region.clone(),
            size: request.size.clone(),
            instance_id: None,
            address: None,
            static_address: false,
            reserved_address: None,
            peers: peer_count,
            tunnel_port: topology.port(),
            server_public_key: profile.tunnel.then(|| keys.server.public_key().to_string()),
            ssh_key_path,
            account: profile.account.name.clone(),
            created_at: Utc::now(),
        };
        self.store.save(&record)?;

        let provider_name = request.provider.display_name();
        let progress = spinner(format!("creating {name} on {provider_name}"));
        let launched = interruptible(self.provider.launch(&spec), name).await;
        progress.finish_and_clear();
        drop(work);
        let launched = launched?;

        record.instance_id = Some(launched.id.clone());
        self.store.save(&record)?;
        console.say(done(&format!("instance {} launched", launched.id)))?;

        self.advance(Stage::AwaitingRunning);
        if let Some(instance) = self.await_running(console, &launched).await? {
            record.address = instance.address;

            if profile.stable_address {
                self.advance(Stage::AllocatingAddress);
                let allocation = self.allocate_address(console, &instance).await?;
                record.address = allocation.instance.address;
                record.static_address = allocation.instance.static_address;
                record.reserved_address = allocation.reserved;
            }
            self.store.save(&record)?;
        }

        let bundles = bundle::for_peers(&keys, &topology, record.address)?;
        let peers_dir = self.store.peers_dir(name)?;
        let peer_configs = export::publish(console, &bundles, &peers_dir, true)?;

        self.advance(Stage::Ready);
        let ssh_reachable = self.check_ssh(console, &profile, record.address).await?;
        self.next_steps(console, &profile, &record)?;

        Ok(Outcome {
            record,
            peer_configs,
            ssh_reachable,
        })
    }

    fn summarize(
        &self,
        console: &mut Console,
        request: &DeploymentRequest,
        profile: &ProviderProfile,
        keys: &KeyMaterial,
        document: &FinalDocument,
    ) -> Result<()> {
        console.say(format!("\n{}", "Deployment".bold()))?;
        console.say(format!("  provider     {}", request.provider.display_name()))?;
        console.say(format!("  region       {}", request.region))?;
        console.say(format!("  size         {}", request.size))?;
        console.say(format!("  name         {}", request.name))?;
        console.say(format!("  login        {}", profile.account.name))?;
        if profile.tunnel {
            console.say(format!("  tunnel peers {}", keys.peers.len()))?;
            console.say(format!("  tunnel port  {}/udp", self.config.tunnel_port))?;
        } else {
            console.say("  tunnel       none (local VM)")?;
        }
        if let Some(credential) = &request.credential {
            console.say(format!("  credential   {}", credential.env_var()))?;
        }
        console.say(format!(
            "  document     {} ({} bytes)",
            document.file_name(),
            document.as_str().len()
        ))?;
        console.say(format!("  ssh key      {}", keys.ssh.fingerprint()?))?;
        Ok(())
    }

    /// `None` when the bounded wait ran out: the deployment continues
    /// without an address.
    async fn await_running(
        &self,
        console: &mut Console,
        launched: &Instance,
    ) -> Result<Option<Instance>> {
        let progress = spinner("waiting for the instance to run");
        let waited = interruptible(
            self.provider.wait_until_running(launched, self.timeouts.running),
            &launched.name,
        )
        .await;
        progress.finish_and_clear();

        match waited {
            Ok(instance) => {
                let address = instance.address.map(|a| a.to_string()).unwrap_or_default();
                console.say(done(&format!("instance is running at {address}")))?;
                Ok(Some(instance))
            }
            Err(CliError::Infra(e @ moat_infra::Error::Timeout { .. })) => {
                warn!(error = %e, "running wait gave up");
                console.say(warning(&format!(
                    "{e}; peer configs are written without an Endpoint, \
                     fill it in later with `moat export --name {} --refresh`",
                    launched.name
                )))?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Falls back to the ephemeral address when allocation fails.
    async fn allocate_address(
        &self,
        console: &mut Console,
        instance: &Instance,
    ) -> Result<Allocation> {
        let progress = spinner("allocating a static address");
        let call = self.provider.assign_stable_address(instance);
        let pinned = interruptible(call, &instance.name).await;
        progress.finish_and_clear();

        match pinned {
            Ok(pinned) => {
                if let Some(address) = pinned.address {
                    console.say(done(&format!("static address {address} attached")))?;
                }
                let reserved = pinned.static_address.then_some(pinned.address).flatten();
                Ok(Allocation {
                    instance: pinned,
                    reserved,
                })
            }
            Err(e @ CliError::Cancelled { .. }) => Err(e),
            Err(e) => {
                warn!(error = %e, "static address allocation failed");
                console.say(warning(&format!("{e}; keeping the ephemeral address")))?;
                Ok(Allocation {
                    instance: instance.clone(),
                    reserved: left_behind(&e),
                })
            }
        }
    }

    /// Bounded TCP connect to the SSH port. Skipped when SSH is only open
    /// inside the tunnel.
    async fn check_ssh(
        &self,
        console: &mut Console,
        profile: &ProviderProfile,
        address: Option<IpAddr>,
    ) -> Result<Option<bool>> {
        let Some(address) = address else {
            return Ok(None);
        };
        if profile.tunnel && profile.firewall == FirewallPolicy::HostOnly {
            return Ok(None);
        }

        let target = SocketAddr::new(address, SSH_PORT);
        let attempt_timeout = CONNECT_ATTEMPT.min(self.timeouts.health);
        let Timeouts {
            health,
            health_interval,
            ..
        } = self.timeouts;
        let progress = spinner(format!("waiting for ssh on {target}"));
        let what = "ssh to accept connections";
        let connect = poll_until(what, health, health_interval, move || async move {
            let attempt = tokio::time::timeout(attempt_timeout, TcpStream::connect(target)).await;
            Ok(matches!(attempt, Ok(Ok(_))).then_some(()))
        });
        let reachable = tokio::select! {
            result = connect => result.is_ok(),
            Ok(()) = tokio::signal::ctrl_c() => false,
        };
        progress.finish_and_clear();

        if reachable {
            console.say(done(&format!("ssh answers on {target}")))?;
        } else {
            warn!(%target, "ssh health check gave up");
            console.say(warning(&format!(
                "ssh did not answer on {target} yet; first boot may still be running"
            )))?;
        }
        Ok(Some(reachable))
    }

    fn next_steps(
        &self,
        console: &mut Console,
        profile: &ProviderProfile,
        record: &DeploymentRecord,
    ) -> Result<()> {
        let key = record.ssh_key_path.display();
        let account = &record.account;

        console.say(format!("\n{}", "Next steps".bold()))?;
        if profile.tunnel {
            console.say(
                "  1. import a peer config into the WireGuard app (scan the QR code above)",
            )?;
            console.say(format!(
                "  2. ssh -i {key} {account}@{}",
                TunnelTopology::default().server_address()
            ))?;
        } else if let Some(address) = record.address {
            console.say(format!("  ssh -i {key} {account}@{address}"))?;
        }
        console.say(format!(
            "  first boot is finished once {} exists on the instance",
            template::COMPLETION_MARKER
        ))?;
        console.say(format!("  remove everything with `moat destroy --name {}`", record.name))?;
        Ok(())
    }
}

/// The stable address and, separately, any provider-held address that
/// `destroy` has to release.
struct Allocation {
    instance: Instance,
    reserved: Option<IpAddr>,
}

/// Address the provider kept after a failed allocation, if it said so.
fn left_behind(err: &CliError) -> Option<IpAddr> {
    match err {
        CliError::Infra(moat_infra::Error::AddressLeftBehind { address, .. }) => {
            address.parse().ok()
        }
        _ => None,
    }
}

fn read_base_document(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CliError::MissingDocument(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Run a provider call, turning Ctrl-C into a cancellation that names the
/// deployment to clean up.
async fn interruptible<T, F>(call: F, name: &str) -> Result<T>
where
    F: Future<Output = moat_infra::Result<T>>,
{
    tokio::select! {
        result = call => result.map_err(CliError::from),
        Ok(()) = tokio::signal::ctrl_c() => Err(CliError::cancelled("interrupted", Some(name))),
    }
}


#[cfg(test)]
mod tests {
    use std::io;

    use moat_infra::types::InstanceId;

    use super::fake::{FakeProvider, Mode};
    use super::*;

    const BASE: &str = "#cloud-config\npackages:\n  - git\nruncmd:\n  - echo hello\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        config: MoatConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cloud-init.yaml"), BASE).unwrap();
        let config = MoatConfig {
            home: dir.path().join("home"),
            cloud_init: dir.path().join("cloud-init.yaml"),
            tunnel_port: 51820,
            ssh_sources: vec!["0.0.0.0/0".into()],
        };
        Fixture { _dir: dir, config }
    }

    fn request(config: &MoatConfig, provider: ProviderName, peers: usize) -> DeploymentRequest {
        DeploymentRequest {
            provider,
            region: provider.regions()[0].into(),
            size: provider.sizes()[0].into(),
            name: "dev".into(),
            image: None,
            peers,
            ssh_key: SshKeyChoice::Generate {
                comment: "moat@test".into(),
            },
            credential: None,
            base_document: config.cloud_init.clone(),
        }
    }

    fn fast() -> Timeouts {
        Timeouts {
            running: Duration::from_millis(20),
            health: Duration::from_millis(20),
            health_interval: Duration::from_millis(5),
        }
    }

    fn answering(script: &str) -> Console {
        Console::new(io::Cursor::new(script.to_string()), io::sink())
    }

    fn orchestrator<'a>(provider: &Arc<FakeProvider>, config: &'a MoatConfig) -> Orchestrator<'a> {
        Orchestrator::new(provider.clone(), config).with_timeouts(fast())
    }

    #[tokio::test]
    async fn digitalocean_deployment_reaches_ready_with_static_endpoint() {
        let fx = fixture();
        let provider = FakeProvider::new(ProviderName::DigitalOcean, Mode::Healthy);
        let mut orchestrator = orchestrator(&provider, &fx.config);

        let outcome = orchestrator
            .run(request(&fx.config, ProviderName::DigitalOcean, 2), &mut answering("y\n"))
            .await
            .unwrap();

        assert_eq!(orchestrator.stage, Stage::Ready);
        assert_eq!(outcome.record.address, Some("192.0.2.99".parse().unwrap()));
        assert!(outcome.record.static_address);
        assert_eq!(outcome.record.account, "root");
        assert_eq!(outcome.peer_configs.len(), 2);

        let peer = std::fs::read_to_string(&outcome.peer_configs[1]).unwrap();
        assert!(peer.contains("Address = 10.13.13.3/32"));
        assert!(peer.contains("Endpoint = 192.0.2.99:51820"));

        let store = RecordStore::new(&fx.config.home);
        assert_eq!(store.require("dev").unwrap(), outcome.record);
        assert_eq!(outcome.record.instance_id, Some(InstanceId("4711".into())));
        assert_eq!(outcome.record.reserved_address, outcome.record.address);
        assert!(outcome.record.ssh_key_path.exists());

        let user_data = provider.user_data.lock().unwrap().clone();
        assert!(user_data.contains("wg-quick@wg0"));
        // Peer private keys never travel in the document.
        let bundle = moat_core::bundle::ClientBundle::load(&outcome.peer_configs[0]).unwrap();
        assert!(!user_data.contains(bundle.private_key()));

        let work_file = provider.document_file.lock().unwrap().clone().unwrap();
        assert!(!work_file.exists(), "working area must be removed");
    }

    #[tokio::test]
    async fn declining_creates_nothing() {
        let fx = fixture();
        let provider = FakeProvider::new(ProviderName::Hetzner, Mode::Healthy);
        let mut orchestrator = orchestrator(&provider, &fx.config);

        let err = orchestrator
            .run(request(&fx.config, ProviderName::Hetzner, 1), &mut answering("n\n"))
            .await
            .unwrap_err();

        assert!(matches!(err, CliError::Cancelled { name: None, .. }));
        assert_eq!(orchestrator.stage, Stage::Failed);
        assert_eq!(provider.launches(), 0);
        assert!(RecordStore::new(&fx.config.home).list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn running_timeout_is_a_warning_and_skips_the_endpoint() {
        let fx = fixture();
        let provider = FakeProvider::new(ProviderName::Lightsail, Mode::NeverRuns);
        let mut orchestrator = orchestrator(&provider, &fx.config);

        let outcome = orchestrator
            .run(request(&fx.config, ProviderName::Lightsail, 1), &mut answering("y\n"))
            .await
            .unwrap();

        assert_eq!(orchestrator.stage, Stage::Ready);
        assert_eq!(outcome.record.address, None);
        assert!(!outcome.record.static_address);
        assert_eq!(outcome.ssh_reachable, None);

        let peer = std::fs::read_to_string(&outcome.peer_configs[0]).unwrap();
        assert!(!peer.contains("Endpoint"));
        // Recorded right after launch so destroy can find it.
        assert!(RecordStore::new(&fx.config.home).load("dev").unwrap().is_some());
        assert!(provider.user_data.lock().unwrap().starts_with("#!/bin/bash"));
    }

    #[tokio::test]
    async fn failed_launch_leaves_a_record_destroy_can_use() {
        let fx = fixture();
        let provider = FakeProvider::new(ProviderName::Hetzner, Mode::LaunchFails);
        let mut orchestrator = orchestrator(&provider, &fx.config);

        let err = orchestrator
            .run(request(&fx.config, ProviderName::Hetzner, 1), &mut answering("y\n"))
            .await
            .unwrap_err();

        assert!(matches!(err, CliError::Infra(moat_infra::Error::Hetzner { .. })));
        assert_eq!(orchestrator.stage, Stage::Failed);

        let record = RecordStore::new(&fx.config.home).require("dev").unwrap();
        assert_eq!(record.provider, ProviderName::Hetzner);
        assert_eq!(record.instance_id, None);
        assert!(record.ssh_key_path.exists());

        // The document's working copy is gone even on failure.
        let work_file = provider.document_file.lock().unwrap().clone().unwrap();
        assert!(!work_file.exists());
    }

    #[tokio::test]
    async fn stuck_reserved_address_is_recorded_for_destroy() {
        let fx = fixture();
        let provider = FakeProvider::new(ProviderName::DigitalOcean, Mode::AddressStuck);
        let mut orchestrator = orchestrator(&provider, &fx.config);

        let outcome = orchestrator
            .run(request(&fx.config, ProviderName::DigitalOcean, 1), &mut answering("y\n"))
            .await
            .unwrap();

        assert_eq!(orchestrator.stage, Stage::Ready);
        assert_eq!(outcome.record.address, Some("192.0.2.10".parse().unwrap()));
        assert!(!outcome.record.static_address);
        assert_eq!(outcome.record.reserved_address, Some("192.0.2.77".parse().unwrap()));

        let saved = RecordStore::new(&fx.config.home).require("dev").unwrap();
        assert_eq!(saved.reserved_address, outcome.record.reserved_address);
    }

    #[tokio::test]
    async fn local_vm_has_no_tunnel_or_peer_configs() {
        let fx = fixture();
        let provider = FakeProvider::new(ProviderName::Local, Mode::Healthy);
        let mut orchestrator = orchestrator(&provider, &fx.config);

        let outcome = orchestrator
            .run(request(&fx.config, ProviderName::Local, 3), &mut answering("y\n"))
            .await
            .unwrap();

        assert!(outcome.peer_configs.is_empty());
        assert_eq!(outcome.record.peers, 0);
        assert_eq!(outcome.record.server_public_key, None);
        assert_eq!(outcome.record.account, "ubuntu");
        assert!(!provider.user_data.lock().unwrap().contains("wireguard"));
    }

    #[tokio::test]
    async fn missing_base_document_fails_before_keys() {
        let fx = fixture();
        let provider = FakeProvider::new(ProviderName::Hetzner, Mode::Healthy);
        let mut req = request(&fx.config, ProviderName::Hetzner, 1);
        req.base_document = PathBuf::from("/nonexistent/cloud-init.yaml");

        let mut orchestrator = orchestrator(&provider, &fx.config);
        let err = orchestrator.run(req, &mut answering("y\n")).await.unwrap_err();

        assert!(matches!(err, CliError::MissingDocument(_)));
        assert_eq!(provider.launches(), 0);
    }

    #[tokio::test]
    async fn existing_deployment_name_is_refused() {
        let fx = fixture();
        let provider = FakeProvider::new(ProviderName::Hetzner, Mode::Healthy);

        orchestrator(&provider, &fx.config)
            .run(request(&fx.config, ProviderName::Hetzner, 1), &mut answering("y\n"))
            .await
            .unwrap();

        let err = orchestrator(&provider, &fx.config)
            .run(request(&fx.config, ProviderName::Hetzner, 1), &mut answering("y\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Input(_)));
        assert_eq!(provider.launches(), 1);
    }

    #[tokio::test]
    async fn invalid_peer_count_is_rejected_for_tunnel_providers() {
        let fx = fixture();
        let provider = FakeProvider::new(ProviderName::Hetzner, Mode::Healthy);
        let err = orchestrator(&provider, &fx.config)
            .run(request(&fx.config, ProviderName::Hetzner, 0), &mut answering("y\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Core(moat_core::Error::InputValidation { .. })));
    }

    #[test]
    fn stages_only_move_forward() {
        assert!(Stage::CollectingInput < Stage::KeyGeneration);
        assert!(Stage::AllocatingAddress < Stage::Ready);
        assert!(Stage::Ready < Stage::Failed);
        assert_eq!(Stage::AwaitingRunning.to_string(), "awaiting-running");
    }
}
