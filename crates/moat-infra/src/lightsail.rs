use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::exec::{CommandRunner, SystemRunner, require_tool};
use crate::types::{
    Instance, InstanceId, InstanceSpec, InstanceState, Teardown, parse_address,
};
use crate::wait::{DEFAULT_POLL_INTERVAL, poll_until, retry};
use crate::{Error, InstanceProvider, MANAGED_TAG, ProviderName, Result};

const PROGRAM: &str = "aws";
const PORTS_TIMEOUT: Duration = Duration::from_secs(90);
const STATIC_IP_TIMEOUT: Duration = Duration::from_secs(120);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// AWS Lightsail provider driving the `aws` CLI.
///
/// Credentials and the default region come from the CLI's own
/// configuration (`AWS_PROFILE`, `AWS_REGION`). Instance ids are
/// `<region>/<name>` so destroy works without extra state.
pub struct LightsailProvider {
    runner: Arc<dyn CommandRunner>,
    region: Option<String>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blueprint {
    blueprint_id: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    is_active: bool,
    #[serde(default)]
    platform: String,
}

#[derive(Debug, Deserialize)]
struct Blueprints {
    blueprints: Vec<Blueprint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LsInstance {
    name: String,
    state: LsState,
    public_ip_address: Option<String>,
    #[serde(default)]
    is_static_ip: bool,
    location: Option<LsLocation>,
    #[serde(default)]
    tags: Vec<LsTag>,
}

#[derive(Debug, Deserialize)]
struct LsState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LsLocation {
    region_name: String,
}

#[derive(Debug, Deserialize)]
struct LsTag {
    key: String,
}

#[derive(Debug, Deserialize)]
struct GetInstance {
    instance: LsInstance,
}

#[derive(Debug, Deserialize)]
struct GetInstances {
    #[serde(default)]
    instances: Vec<LsInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaticIp {
    ip_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetStaticIp {
    static_ip: StaticIp,
}

impl LightsailProvider {
    /// Requires the `aws` binary on `PATH`. Reads:
    ///
    /// - `AWS_REGION` / `AWS_DEFAULT_REGION` (optional, used by `list`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        require_tool(PROGRAM)?;

        let region = std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .ok()
            .filter(|r| !r.is_empty());

        Ok(Self::with_runner(Arc::new(SystemRunner), region))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>, region: Option<String>) -> Self {
        Self {
            runner,
            region,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn static_ip_name(instance: &str) -> String {
        format!("{instance}-ip")
    }

    fn instance_id(region: &str, name: &str) -> InstanceId {
        InstanceId(format!("{region}/{name}"))
    }

    fn split_id(id: &InstanceId) -> Result<(&str, &str)> {
        id.0.split_once('/')
            .filter(|(r, n)| !r.is_empty() && !n.is_empty())
            .ok_or_else(|| Error::InvalidId(id.0.clone()))
    }

    fn parse_state(state: &str) -> InstanceState {
        match state {
            "running" => InstanceState::Running,
            "pending" | "starting" => InstanceState::Creating,
            "stopped" | "stopping" => InstanceState::Stopped,
            "shutting-down" => InstanceState::Destroying,
            "terminated" => InstanceState::Destroyed,
            _ => InstanceState::Unknown,
        }
    }

    fn is_not_found(err: &Error) -> bool {
        matches!(err, Error::Lightsail(msg)
            if msg.contains("NotFoundException") || msg.contains("does not exist"))
    }

    /// Numeric components of a blueprint version, `24.04 LTS` → `[24, 4]`.
    fn version_key(version: &str) -> Vec<u64> {
        version
            .split(|c: char| !c.is_ascii_digit())
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.parse().ok())
            .collect()
    }

    fn to_instance(raw: LsInstance, fallback_region: &str) -> Instance {
        let region = raw
            .location
            .map(|l| l.region_name)
            .unwrap_or_else(|| fallback_region.to_string());
        let mut instance = Instance::new(
            Self::instance_id(&region, &raw.name).0,
            raw.name,
            Self::parse_state(&raw.state.name),
        );
        instance.address = parse_address(raw.public_ip_address.as_deref());
        instance.static_address = raw.is_static_ip;
        instance.region = Some(region);
        instance
    }

    async fn run(&self, region: Option<&str>, op: &'static str, rest: &[&str]) -> Result<String> {
        let mut args: Vec<String> = vec!["lightsail".into(), op.into()];
        args.extend(rest.iter().map(|a| a.to_string()));
        args.extend(["--output".to_string(), "json".to_string()]);
        if let Some(region) = region {
            args.extend(["--region".to_string(), region.to_string()]);
        }

        let out = self.runner.run(PROGRAM, &args).await?;
        if !out.success() {
            return Err(Error::Lightsail(format!("{op}: {}", out.stderr.trim())));
        }
        Ok(out.stdout)
    }

    fn parse<T: serde::de::DeserializeOwned>(op: &str, stdout: &str) -> Result<T> {
        serde_json::from_str(stdout)
            .map_err(|e| Error::Lightsail(format!("unexpected {op} output: {e}")))
    }

    async fn resolve_blueprint(&self, region: &str, pattern: &str) -> Result<String> {
        let stdout = self.run(Some(region), "get-blueprints", &[]).await?;
        let parsed: Blueprints = Self::parse("get-blueprints", &stdout)?;

        parsed
            .blueprints
            .into_iter()
            .filter(|b| b.is_active && b.platform == "LINUX_UNIX")
            .filter(|b| b.blueprint_id.starts_with(pattern))
            .max_by_key(|b| Self::version_key(&b.version))
            .map(|b| b.blueprint_id)
            .ok_or_else(|| Error::ImageNotFound {
                provider: ProviderName::Lightsail,
                pattern: pattern.to_string(),
            })
    }

    async fn get_instance(&self, region: &str, name: &str) -> Result<Instance> {
        let stdout = self
            .run(Some(region), "get-instance", &["--instance-name", name])
            .await?;
        let parsed: GetInstance = Self::parse("get-instance", &stdout)?;
        Ok(Self::to_instance(parsed.instance, region))
    }

    /// Replace the instance's public port list. Re-applying is harmless.
    async fn put_public_ports(&self, region: &str, spec: &InstanceSpec<'_>) -> Result<()> {
        let (v6, v4): (Vec<&String>, Vec<&String>) =
            spec.ssh_sources.iter().partition(|c| c.contains(':'));
        let ports = json!([
            {
                "fromPort": 22,
                "toPort": 22,
                "protocol": "tcp",
                "cidrs": v4,
                "ipv6Cidrs": v6,
            },
            {
                "fromPort": spec.tunnel_port,
                "toPort": spec.tunnel_port,
                "protocol": "udp",
                "cidrs": ["0.0.0.0/0"],
                "ipv6Cidrs": ["::/0"],
            },
        ])
        .to_string();

        self.run(
            Some(region),
            "put-instance-public-ports",
            &["--instance-name", spec.name, "--port-infos", &ports],
        )
        .await?;
        Ok(())
    }

    async fn release_static_ip(&self, region: &str, name: &str) -> Result<()> {
        let ip_name = Self::static_ip_name(name);

        match self
            .run(Some(region), "detach-static-ip", &["--static-ip-name", &ip_name])
            .await
        {
            Ok(_) => info!(static_ip = %ip_name, "lightsail: static ip detached"),
            Err(e) if Self::is_not_found(&e) => {}
            // Release below fails loudly if the address is really stuck.
            Err(e) => warn!(static_ip = %ip_name, error = %e, "lightsail: detach failed"),
        }

        let what = "lightsail static ip release";
        let released = retry(what, RELEASE_TIMEOUT, self.poll_interval, move || {
            let ip_name = ip_name.clone();
            async move {
                match self
                    .run(Some(region), "release-static-ip", &["--static-ip-name", &ip_name])
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(e) if Self::is_not_found(&e) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        })
        .await?;

        if released {
            info!(instance = name, "lightsail: static ip released");
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceProvider for LightsailProvider {
    async fn launch(&self, spec: &InstanceSpec<'_>) -> Result<Instance> {
        let region = spec.region;
        let pattern = spec.image.unwrap_or(ProviderName::Lightsail.default_image());
        let blueprint = self.resolve_blueprint(region, pattern).await?;
        let zone = format!("{region}a");
        let user_data = format!("file://{}", spec.user_data_file.display());
        let tag = format!("key={MANAGED_TAG}");

        self.run(
            Some(region),
            "create-instances",
            &[
                "--instance-names",
                spec.name,
                "--availability-zone",
                &zone,
                "--blueprint-id",
                &blueprint,
                "--bundle-id",
                spec.size,
                "--user-data",
                &user_data,
                "--tags",
                &tag,
            ],
        )
        .await?;
        info!(instance = spec.name, blueprint = %blueprint, "lightsail: instance created");

        // The port list can only be set once the instance exists.
        retry("lightsail public ports", PORTS_TIMEOUT, self.poll_interval, move || {
            self.put_public_ports(region, spec)
        })
        .await?;
        info!(instance = spec.name, "lightsail: public ports set");

        let mut instance = Instance::new(
            Self::instance_id(region, spec.name).0,
            spec.name,
            InstanceState::Creating,
        );
        instance.region = Some(region.to_string());
        Ok(instance)
    }

    async fn wait_until_running(&self, instance: &Instance, timeout: Duration) -> Result<Instance> {
        let (region, name) = Self::split_id(&instance.id)?;
        poll_until("lightsail instance to run", timeout, self.poll_interval, move || async move {
            let current = self.get_instance(region, name).await?;
            Ok((current.is_running() && current.address.is_some()).then_some(current))
        })
        .await
    }

    async fn assign_stable_address(&self, instance: &Instance) -> Result<Instance> {
        let (region, name) = Self::split_id(&instance.id)?;
        let ip_name = Self::static_ip_name(name);

        match self
            .run(Some(region), "allocate-static-ip", &["--static-ip-name", &ip_name])
            .await
        {
            Ok(_) => info!(static_ip = %ip_name, "lightsail: static ip allocated"),
            Err(Error::Lightsail(msg))
                if msg.contains("already in use") || msg.contains("already exists") =>
            {
                info!(static_ip = %ip_name, "lightsail: reusing static ip");
            }
            Err(e) => return Err(e),
        }

        let ip = ip_name.as_str();
        let what = "lightsail static ip attach";
        retry(what, STATIC_IP_TIMEOUT, self.poll_interval, move || async move {
            self.run(
                Some(region),
                "attach-static-ip",
                &["--static-ip-name", ip, "--instance-name", name],
            )
            .await
        })
        .await?;

        let stdout = self
            .run(Some(region), "get-static-ip", &["--static-ip-name", &ip_name])
            .await?;
        let parsed: GetStaticIp = Self::parse("get-static-ip", &stdout)?;

        let mut pinned = instance.clone();
        pinned.address = parse_address(Some(&parsed.static_ip.ip_address));
        pinned.static_address = true;
        info!(
            instance = name,
            address = %parsed.static_ip.ip_address,
            "lightsail: static ip attached"
        );
        Ok(pinned)
    }

    async fn destroy(&self, target: &Teardown<'_>) -> Result<()> {
        let id = match (target.id, target.region.or(self.region.as_deref())) {
            (Some(id), _) => id.clone(),
            (None, Some(region)) => Self::instance_id(region, target.name),
            (None, None) => return Err(Error::InvalidId(target.name.to_string())),
        };
        let (region, name) = Self::split_id(&id)?;

        // Release first: a static IP left behind keeps billing.
        let released = self.release_static_ip(region, name).await;

        match self
            .run(
                Some(region),
                "delete-instance",
                &["--instance-name", name, "--force-delete-add-ons"],
            )
            .await
        {
            Ok(_) => info!(instance = name, "lightsail: instance deleted"),
            Err(e) if Self::is_not_found(&e) => {
                warn!(instance = name, "lightsail: instance already deleted");
            }
            Err(e) => return Err(e),
        }

        released
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let region = self.region.as_deref();
        let stdout = self.run(region, "get-instances", &[]).await?;
        let parsed: GetInstances = Self::parse("get-instances", &stdout)?;

        Ok(parsed
            .instances
            .into_iter()
            .filter(|i| i.tags.iter().any(|t| t.key == MANAGED_TAG))
            .map(|i| Self::to_instance(i, region.unwrap_or_default()))
            .collect())
    }

    fn name(&self) -> ProviderName {
        ProviderName::Lightsail
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::exec::CommandOutput;
    use crate::exec::scripted::ScriptedRunner;

    const BLUEPRINTS: &str = r#"{"blueprints": [
        {"blueprintId": "ubuntu_22_04", "version": "22.04 LTS", "isActive": true,
         "platform": "LINUX_UNIX", "type": "os"},
        {"blueprintId": "ubuntu_24_04", "version": "24.04 LTS", "isActive": true,
         "platform": "LINUX_UNIX", "type": "os"},
        {"blueprintId": "ubuntu_20_04", "version": "20.04 LTS", "isActive": false,
         "platform": "LINUX_UNIX", "type": "os"},
        {"blueprintId": "windows_server_2022", "version": "2022", "isActive": true,
         "platform": "WINDOWS", "type": "os"}
    ]}"#;

    const PENDING: &str = r#"{"instance": {"name": "box", "state": {"code": 0, "name": "pending"},
        "location": {"availabilityZone": "eu-central-1a", "regionName": "eu-central-1"},
        "tags": [{"key": "moat"}]}}"#;
    const RUNNING: &str = r#"{"instance": {"name": "box", "state": {"code": 16, "name": "running"},
        "publicIpAddress": "3.120.0.10", "isStaticIp": false,
        "location": {"availabilityZone": "eu-central-1a", "regionName": "eu-central-1"},
        "tags": [{"key": "moat"}]}}"#;
    const STATIC_IP: &str =
        r#"{"staticIp": {"name": "box-ip", "ipAddress": "18.196.0.7", "isAttached": true}}"#;
    const NOT_FOUND: &str = "An error occurred (NotFoundException): The Instance does not exist";

    fn provider(runner: &Arc<ScriptedRunner>) -> LightsailProvider {
        LightsailProvider::with_runner(runner.clone(), Some("eu-central-1".into()))
            .with_poll_interval(Duration::from_millis(1))
    }

    fn id() -> InstanceId {
        InstanceId("eu-central-1/box".into())
    }

    fn target(id: &InstanceId) -> Teardown<'_> {
        Teardown {
            name: "box",
            region: Some("eu-central-1"),
            id: Some(id),
            reserved_address: None,
        }
    }

    #[tokio::test]
    async fn create_pins_static_address() {
        let pending = "An error occurred (InvalidInputException): instance is pending";
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("get-blueprints", vec![CommandOutput::ok(BLUEPRINTS)])
                .on("create-instances", vec![CommandOutput::ok(r#"{"operations": []}"#)])
                .on(
                    "put-instance-public-ports",
                    vec![
                        CommandOutput::failed(254, pending),
                        CommandOutput::ok(r#"{"operation": {}}"#),
                    ],
                )
                .on(
                    "get-instance ",
                    vec![CommandOutput::ok(PENDING), CommandOutput::ok(RUNNING)],
                )
                .on("allocate-static-ip", vec![CommandOutput::ok(r#"{"operations": []}"#)])
                .on("attach-static-ip", vec![CommandOutput::ok(r#"{"operations": []}"#)])
                .on("get-static-ip", vec![CommandOutput::ok(STATIC_IP)]),
        );
        let sources = vec!["203.0.113.0/24".to_string(), "2001:db8::/32".to_string()];
        let spec = InstanceSpec {
            name: "box",
            region: "eu-central-1",
            size: "small_3_0",
            image: None,
            user_data: "#!/bin/bash\n",
            user_data_file: Path::new("/tmp/w/bootstrap.sh"),
            ssh_sources: &sources,
            tunnel_port: 51820,
        };

        let instance = provider(&runner).create(&spec, Duration::from_secs(5)).await.unwrap();

        assert_eq!(instance.id, id());
        assert!(instance.static_address);
        assert_eq!(instance.address, Some("18.196.0.7".parse().unwrap()));
        assert!(runner.called("--blueprint-id ubuntu_24_04"));
        assert!(runner.called("--availability-zone eu-central-1a"));
        assert!(runner.called("--user-data file:///tmp/w/bootstrap.sh"));
        assert!(runner.called("--tags key=moat"));
        assert!(runner.called("\"ipv6Cidrs\":[\"2001:db8::/32\"]"));
        assert!(runner.called("allocate-static-ip --static-ip-name box-ip"));
        assert!(runner.position("create-instances") < runner.position("allocate-static-ip"));
    }

    #[tokio::test]
    async fn destroy_releases_static_ip_before_deleting() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("detach-static-ip", vec![CommandOutput::ok("{}")])
                .on("release-static-ip", vec![CommandOutput::ok("{}")])
                .on("delete-instance", vec![CommandOutput::ok("{}")]),
        );

        provider(&runner).destroy(&target(&id())).await.unwrap();

        assert!(runner.called(
            "release-static-ip --static-ip-name box-ip --output json --region eu-central-1"
        ));
        assert!(runner.position("release-static-ip") < runner.position("delete-instance"));
    }

    #[tokio::test]
    async fn destroy_releases_even_when_detach_or_delete_fail() {
        let not_attached = "An error occurred (OperationFailureException): not attached";
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("detach-static-ip", vec![CommandOutput::failed(254, not_attached)])
                .on("release-static-ip", vec![CommandOutput::ok("{}")])
                .on("delete-instance", vec![CommandOutput::failed(254, NOT_FOUND)]),
        );

        provider(&runner).destroy(&target(&id())).await.unwrap();
        assert!(runner.called("release-static-ip --static-ip-name box-ip"));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let gone = CommandOutput::failed(254, NOT_FOUND);
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("detach-static-ip", vec![gone.clone()])
                .on("release-static-ip", vec![gone.clone()])
                .on("delete-instance", vec![gone]),
        );
        provider(&runner).destroy(&target(&id())).await.unwrap();
    }

    #[tokio::test]
    async fn destroy_by_name_uses_the_configured_region() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("detach-static-ip", vec![CommandOutput::ok("{}")])
                .on("release-static-ip", vec![CommandOutput::ok("{}")])
                .on("delete-instance", vec![CommandOutput::ok("{}")]),
        );

        provider(&runner).destroy(&Teardown::by_name("box")).await.unwrap();
        assert!(runner.called("delete-instance --instance-name box"));
        assert!(runner.called("--region eu-central-1"));

        let regionless = LightsailProvider::with_runner(runner.clone(), None);
        let err = regionless.destroy(&Teardown::by_name("box")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidId(_)));
    }

    #[tokio::test]
    async fn no_matching_blueprint_is_image_not_found() {
        let blueprints = vec![CommandOutput::ok(BLUEPRINTS)];
        let runner = Arc::new(ScriptedRunner::new().on("get-blueprints", blueprints));
        let err = provider(&runner)
            .resolve_blueprint("eu-central-1", "debian_")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { .. }));
    }

    #[tokio::test]
    async fn list_only_returns_managed_instances() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "get-instances",
            vec![CommandOutput::ok(
                r#"{"instances": [
                    {"name": "box", "state": {"name": "running"}, "publicIpAddress": "1.2.3.4",
                     "tags": [{"key": "moat"}]},
                    {"name": "web", "state": {"name": "running"}, "publicIpAddress": "1.2.3.5",
                     "tags": []}
                ]}"#,
            )],
        ));
        let list = provider(&runner).list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id());
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(LightsailProvider::split_id(&InstanceId("box".into())).is_err());
        assert_eq!(LightsailProvider::version_key("24.04 LTS"), vec![24, 4]);
    }
}
