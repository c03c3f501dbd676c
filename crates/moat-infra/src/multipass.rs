use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::exec::{CommandRunner, SystemRunner, require_tool};
use crate::types::{Instance, InstanceSpec, InstanceState, Teardown, parse_address};
use crate::wait::{DEFAULT_POLL_INTERVAL, poll_until};
use crate::{Error, InstanceProvider, ProviderName, Result};

const PROGRAM: &str = "multipass";
const LAUNCH_TIMEOUT_SECS: u32 = 900;

/// Local VM provider driving the `multipass` CLI.
///
/// No network or firewall resources are created: the VM sits on the
/// host-only bridge and the tunnel is disabled for it.
pub struct MultipassProvider {
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct InfoOutput {
    #[serde(default)]
    info: HashMap<String, VmInfo>,
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    state: String,
    #[serde(default)]
    ipv4: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListOutput {
    #[serde(default)]
    list: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    state: String,
    #[serde(default)]
    ipv4: Vec<String>,
}

impl MultipassProvider {
    /// Requires the `multipass` binary on `PATH`.
    pub fn from_env() -> Result<Self> {
        require_tool(PROGRAM)?;
        Ok(Self::with_runner(Arc::new(SystemRunner)))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// `(cpus, memory, disk)` for a size class.
    fn resources(size: &str) -> (&'static str, &'static str, &'static str) {
        match size {
            "large" => ("4", "8G", "40G"),
            "medium" => ("2", "4G", "20G"),
            _ => ("1", "2G", "10G"),
        }
    }

    fn parse_state(state: &str) -> InstanceState {
        match state {
            "Running" => InstanceState::Running,
            "Starting" | "Restarting" => InstanceState::Creating,
            "Stopped" | "Suspended" | "Suspending" => InstanceState::Stopped,
            "Deleted" => InstanceState::Destroyed,
            _ => InstanceState::Unknown,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_fed(args, None).await
    }

    /// `input`, when given, goes to stdin.
    async fn run_fed(&self, args: &[&str], input: Option<&str>) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let out = match input {
            Some(input) => self.runner.run_with_input(PROGRAM, &args, input).await?,
            None => self.runner.run(PROGRAM, &args).await?,
        };
        if !out.success() {
            return Err(Error::Multipass(format!(
                "{} failed: {}",
                args.first().map(String::as_str).unwrap_or(PROGRAM),
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    async fn info(&self, name: &str) -> Result<Instance> {
        let stdout = self.run(&["info", name, "--format", "json"]).await?;
        let parsed: InfoOutput = serde_json::from_str(&stdout)
            .map_err(|e| Error::Multipass(format!("unexpected info output: {e}")))?;
        let vm = parsed
            .info
            .get(name)
            .ok_or_else(|| Error::Multipass(format!("{name} missing from info output")))?;

        let mut instance = Instance::new(name, name, Self::parse_state(&vm.state));
        instance.address = parse_address(vm.ipv4.first().map(String::as_str));
        instance.region = Some("local".into());
        Ok(instance)
    }
}

#[async_trait]
impl InstanceProvider for MultipassProvider {
    async fn launch(&self, spec: &InstanceSpec<'_>) -> Result<Instance> {
        let (cpus, memory, disk) = Self::resources(spec.size);
        let image = spec.image.unwrap_or(ProviderName::Local.default_image());
        let timeout = LAUNCH_TIMEOUT_SECS.to_string();

        // The snap-confined daemon cannot read files outside the user's
        // home, so the document goes over stdin.
        let args = [
            "launch",
            image,
            "--name",
            spec.name,
            "--cpus",
            cpus,
            "--memory",
            memory,
            "--disk",
            disk,
            "--cloud-init",
            "-",
            "--timeout",
            &timeout,
        ];
        self.run_fed(&args, Some(spec.user_data)).await?;

        info!(name = spec.name, "multipass: instance launched");
        self.info(spec.name).await
    }

    async fn wait_until_running(&self, instance: &Instance, timeout: Duration) -> Result<Instance> {
        let what = "multipass instance to run";
        poll_until(what, timeout, self.poll_interval, move || async move {
            let current = self.info(&instance.name).await?;
            Ok((current.is_running() && current.address.is_some()).then_some(current))
        })
        .await
    }

    async fn destroy(&self, target: &Teardown<'_>) -> Result<()> {
        // Instance ids are the VM names.
        let name = target.id.map_or(target.name, |id| id.0.as_str());
        match self.run(&["delete", "--purge", name]).await {
            Ok(_) => {
                info!(name, "multipass: instance deleted");
                Ok(())
            }
            Err(Error::Multipass(msg)) if msg.contains("does not exist") => {
                warn!(name, "multipass: instance already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Multipass has no labels: every local VM is listed.
    async fn list(&self) -> Result<Vec<Instance>> {
        let stdout = self.run(&["list", "--format", "json"]).await?;
        let parsed: ListOutput = serde_json::from_str(&stdout)
            .map_err(|e| Error::Multipass(format!("unexpected list output: {e}")))?;

        Ok(parsed
            .list
            .into_iter()
            .map(|vm| {
                let state = Self::parse_state(&vm.state);
                let mut instance = Instance::new(&vm.name, &vm.name, state);
                instance.address = parse_address(vm.ipv4.first().map(String::as_str));
                instance.region = Some("local".into());
                instance
            })
            .collect())
    }

    fn name(&self) -> ProviderName {
        ProviderName::Local
    }
}
