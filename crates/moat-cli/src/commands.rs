use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::Local;
use clap::Args;
use moat_core::keys::SshKeyChoice;
use moat_core::template::ApiCredential;
use moat_infra::types::{Instance, Teardown};
use moat_infra::{InstanceProvider, ProviderName, ProviderRegistry, build_providers};
use tracing::{info, warn};

use crate::config::MoatConfig;
use crate::error::{CliError, Result};
use crate::export;
use crate::orchestrator::{DeploymentRequest, Orchestrator};
use crate::prompt::Console;
use crate::records::{DeploymentRecord, RecordStore, validate_name};
use crate::ui::{done, spinner, table, warning};

/// Variable name used when the credential is typed in at the prompt.
pub const DEFAULT_CREDENTIAL_VAR: &str = "ANTHROPIC_API_KEY";
const DEFAULT_PEERS: [&str; 3] = ["1", "2", "3"];

#[derive(Args, Debug, Default, Clone)]
pub struct CreateArgs {
    /// local, hetzner, digitalocean or lightsail
    #[arg(long)]
    pub provider: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    /// Server type / droplet size / bundle id / local size class
    #[arg(long)]
    pub size: Option<String>,

    /// Instance name (lowercase letters, digits and '-')
    #[arg(long)]
    pub name: Option<String>,

    /// Image name prefix, overriding the provider's Ubuntu LTS default
    #[arg(long)]
    pub image: Option<String>,

    /// Devices that will join the tunnel
    #[arg(long)]
    pub peers: Option<usize>,

    /// Reuse this SSH private key instead of generating one
    #[arg(long)]
    pub ssh_key: Option<PathBuf>,

    /// Base cloud-config (default: MOAT_CLOUD_INIT or ./cloud-init.yaml)
    #[arg(long)]
    pub cloud_init: Option<PathBuf>,

    /// Environment variable holding an API credential to place on the instance
    #[arg(long)]
    pub api_key_env: Option<String>,
}

// ── create ──

pub async fn create(args: CreateArgs, config: &MoatConfig, console: &mut Console) -> Result<()> {
    let registry = build_providers();

    let provider_name = match &args.provider {
        Some(raw) => raw.parse::<ProviderName>()?,
        None => choose_provider(console, &registry)?,
    };
    let provider = registry.take(provider_name)?;
    let profile = provider_name.profile();

    let region = pick(console, "Region", args.region, provider_name.regions())?;
    let size = pick(console, "Size", args.size, provider_name.sizes())?;
    let name = match args.name {
        Some(name) => name,
        None => console.text("Instance name", Some(&default_name()))?,
    };
    validate_name(&name)?;

    let peers = match (profile.tunnel, args.peers) {
        (false, _) => 0,
        (true, Some(n)) => n,
        (true, None) => {
            let options = DEFAULT_PEERS.map(String::from).to_vec();
            console.choose("Devices that will join the tunnel", &options, 0)? + 1
        }
    };

    let ssh_key = match args.ssh_key {
        Some(path) => SshKeyChoice::Reuse(path),
        None => choose_ssh_key(console, &name)?,
    };
    let credential = resolve_credential(console, args.api_key_env.as_deref())?;

    let request = DeploymentRequest {
        provider: provider_name,
        region,
        size,
        name,
        image: args.image,
        peers,
        ssh_key,
        credential,
        base_document: args.cloud_init.unwrap_or_else(|| config.cloud_init.clone()),
    };

    let outcome = Orchestrator::new(provider, config).run(request, console).await?;
    info!(
        name = %outcome.record.name,
        peers = outcome.peer_configs.len(),
        ssh_reachable = ?outcome.ssh_reachable,
        "deployment ready"
    );
    Ok(())
}

fn choose_provider(console: &mut Console, registry: &ProviderRegistry) -> Result<ProviderName> {
    let available = registry.available();
    if available.is_empty() {
        return Err(CliError::input(
            "no provider is usable: install multipass or set HETZNER_API_TOKEN, \
             DIGITALOCEAN_TOKEN or AWS credentials",
        ));
    }
    let options: Vec<String> = available
        .iter()
        .map(|p| format!("{} ({p})", p.display_name()))
        .collect();
    let index = console.choose("Provider", &options, 0)?;
    Ok(available[index])
}

/// A flag value wins; otherwise a numbered menu of common choices.
fn pick(
    console: &mut Console,
    label: &str,
    given: Option<String>,
    options: &[&str],
) -> Result<String> {
    if let Some(value) = given {
        return Ok(value);
    }
    let owned: Vec<String> = options.iter().map(|o| o.to_string()).collect();
    let index = console.choose(label, &owned, 0)?;
    Ok(owned[index].clone())
}

fn default_name() -> String {
    format!("moat-{}", Local::now().format("%m%d-%H%M"))
}

fn choose_ssh_key(console: &mut Console, name: &str) -> Result<SshKeyChoice> {
    let generate = SshKeyChoice::Generate {
        comment: format!("moat@{name}"),
    };
    let Some(existing) = dirs::home_dir()
        .map(|h| h.join(".ssh").join("id_ed25519"))
        .filter(|p| p.exists())
    else {
        return Ok(generate);
    };

    let options = vec![
        "generate a new key for this deployment".to_string(),
        format!("reuse {}", existing.display()),
    ];
    Ok(match console.choose("SSH key", &options, 0)? {
        0 => generate,
        _ => SshKeyChoice::Reuse(existing),
    })
}

fn resolve_credential(
    console: &mut Console,
    env_var: Option<&str>,
) -> Result<Option<ApiCredential>> {
    if let Some(var) = env_var {
        let value =
            std::env::var(var).map_err(|_| moat_infra::Error::MissingEnv(var.to_string()))?;
        return Ok(Some(ApiCredential::new(var, value)?));
    }
    if !console.confirm("Place an API credential on the instance?")? {
        return Ok(None);
    }
    let value = console.secret(&format!("{DEFAULT_CREDENTIAL_VAR} (input hidden)"))?;
    Ok(Some(ApiCredential::new(DEFAULT_CREDENTIAL_VAR, value)?))
}

// ── destroy ──

/// Without a record, `provider` names where to look the instance up by
/// name; with one, the record decides.
pub async fn destroy(
    name: &str,
    provider: Option<&str>,
    config: &MoatConfig,
    console: &mut Console,
) -> Result<()> {
    validate_name(name)?;
    let store = RecordStore::new(&config.home);
    let record = store.load(name)?;

    let provider_name = match (&record, provider) {
        (Some(record), given) => {
            if let Some(given) = given.map(str::parse::<ProviderName>).transpose()? {
                if given != record.provider {
                    warn!(recorded = %record.provider, %given, "--provider ignored");
                }
            }
            record.provider
        }
        (None, Some(raw)) => raw.parse::<ProviderName>()?,
        (None, None) => return Err(CliError::UnknownDeployment(name.to_string())),
    };
    let provider = build_providers().take(provider_name)?;

    teardown(provider.as_ref(), &store, name, record.as_ref(), console).await
}

async fn teardown(
    provider: &dyn InstanceProvider,
    store: &RecordStore,
    name: &str,
    record: Option<&DeploymentRecord>,
    console: &mut Console,
) -> Result<()> {
    let target = match record {
        Some(r) => Teardown {
            name: &r.name,
            region: Some(r.region.as_str()),
            id: r.instance_id.as_ref(),
            reserved_address: r.reserved_address,
        },
        None => Teardown::by_name(name),
    };

    let id = target
        .id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "looked up by name".into());
    let address = record
        .and_then(|r| r.address)
        .map(|a| a.to_string())
        .unwrap_or_else(|| "no address".into());
    let question = format!(
        "This destroys {name} ({}, {id}, {address}), releases its address \
         and deletes its keys and peer configs.",
        provider.name().display_name(),
    );
    if !console.confirm_by_typing(&question, name)? {
        return Err(CliError::cancelled("destroy not confirmed", None));
    }

    let progress = spinner(format!("destroying {name}"));
    let destroyed = provider.destroy(&target).await;
    progress.finish_and_clear();
    destroyed?;

    store.remove(name)?;
    console.say(done(&format!("{name} destroyed")))?;
    Ok(())
}

// ── status ──

pub async fn status(config: &MoatConfig, console: &mut Console) -> Result<()> {
    let records = RecordStore::new(&config.home).list()?;
    let registry = build_providers();

    let mut live: HashMap<ProviderName, Vec<Instance>> = HashMap::new();
    for name in registry.available() {
        let Some(provider) = registry.get(name) else {
            continue;
        };
        match provider.list().await {
            Ok(instances) => {
                live.insert(name, instances);
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "listing instances failed");
                let provider = name.display_name();
                console.say(warning(&format!("could not list {provider} instances: {e}")))?;
            }
        }
    }

    let rows = status_rows(&records, &live);
    if rows.is_empty() {
        console.say("no deployments")?;
        return Ok(());
    }

    let mut out = table(&["Name", "Provider", "Region", "State", "Address", "Peers", "Created"]);
    for row in rows {
        out.add_row(row);
    }
    console.say(out.to_string())?;
    Ok(())
}

/// A record matches by instance id, or by name while the id is unknown.
fn tracks(record: &DeploymentRecord, provider: ProviderName, instance: &Instance) -> bool {
    record.provider == provider
        && match &record.instance_id {
            Some(id) => *id == instance.id,
            None => record.name == instance.name,
        }
}

/// Recorded deployments first, then managed instances with no record.
fn status_rows(
    records: &[DeploymentRecord],
    live: &HashMap<ProviderName, Vec<Instance>>,
) -> Vec<Vec<String>> {
    let mut rows = Vec::new();

    for r in records {
        let state = match live.get(&r.provider) {
            Some(instances) => instances
                .iter()
                .find(|i| tracks(r, r.provider, i))
                .map(|i| i.state.to_string())
                .unwrap_or_else(|| "missing".into()),
            None => "unknown".into(),
        };
        let address = match (r.address, r.static_address) {
            (Some(a), true) => format!("{a} (static)"),
            (Some(a), false) => a.to_string(),
            (None, _) => "-".into(),
        };
        rows.push(vec![
            r.name.clone(),
            r.provider.to_string(),
            r.region.clone(),
            state,
            address,
            r.peers.to_string(),
            r.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }

    for name in ProviderName::ALL {
        let Some(instances) = live.get(&name) else {
            continue;
        };
        for i in instances {
            if records.iter().any(|r| tracks(r, name, i)) {
                continue;
            }
            rows.push(vec![
                i.name.clone(),
                name.to_string(),
                i.region.clone().unwrap_or_else(|| "-".into()),
                i.state.to_string(),
                i.address.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
                "-".into(),
                "untracked".into(),
            ]);
        }
    }
    rows
}

// ── export / qr ──

pub async fn export(
    name: &str,
    address: Option<IpAddr>,
    refresh: bool,
    qr: bool,
    config: &MoatConfig,
    console: &mut Console,
) -> Result<()> {
    let store = RecordStore::new(&config.home);
    let mut record = store.require(name)?;

    let endpoint = match (address, refresh) {
        (Some(address), _) => Some(address),
        (None, true) => {
            let provider = build_providers().take(record.provider)?;
            let found = provider.find(&record.name).await?;
            let current = found.and_then(|i| i.address).ok_or_else(|| {
                CliError::input(format!(
                    "{name} has no public address yet; retry once it is running"
                ))
            })?;
            Some(current)
        }
        (None, false) => record.address,
    };

    let bundles = export::refresh(&store.peers_dir(name)?, endpoint, record.tunnel_port)?;
    if endpoint != record.address {
        record.address = endpoint;
        store.save(&record)?;
    }

    for bundle in &bundles {
        console.say(done(&format!(
            "peer {} -> {}",
            bundle.peer,
            bundle.endpoint.as_deref().unwrap_or("no endpoint")
        )))?;
        if qr {
            export::show_qr(console, bundle)?;
        }
    }
    Ok(())
}

pub fn qr(
    name: &str,
    peer: Option<usize>,
    config: &MoatConfig,
    console: &mut Console,
) -> Result<()> {
    let store = RecordStore::new(&config.home);
    let bundles = export::load(&store.peers_dir(name)?)?;

    let selected: Vec<_> = bundles
        .iter()
        .filter(|b| peer.is_none_or(|p| b.peer == p))
        .collect();
    if selected.is_empty() {
        return Err(CliError::input(format!(
            "{name} has peers 1..={}, not {}",
            bundles.len(),
            peer.unwrap_or_default()
        )));
    }
    for bundle in selected {
        export::show_qr(console, bundle)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io;

    use chrono::Utc;
    use moat_infra::types::{InstanceId, InstanceState};
    use uuid::Uuid;

    use super::*;
    use crate::orchestrator::fake::{FakeProvider, Mode, TornDown};

    fn record(name: &str, id: &str) -> DeploymentRecord {
        DeploymentRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            provider: ProviderName::Hetzner,
            region: "fsn1".into(),
            size: "cx22".into(),
            instance_id: Some(InstanceId(id.into())),
            address: Some("203.0.113.5".parse().unwrap()),
            static_address: false,
            reserved_address: None,
            peers: 1,
            tunnel_port: 51820,
            server_public_key: None,
            ssh_key_path: PathBuf::from("/tmp/id_ed25519"),
            account: "root".into(),
            created_at: Utc::now(),
        }
    }

    fn console(script: &str) -> Console {
        Console::new(io::Cursor::new(script.to_string()), io::sink())
    }

    fn config(home: &tempfile::TempDir) -> MoatConfig {
        MoatConfig {
            home: home.path().to_path_buf(),
            cloud_init: PathBuf::from("cloud-init.yaml"),
            tunnel_port: 51820,
            ssh_sources: vec!["0.0.0.0/0".into()],
        }
    }

    #[test]
    fn status_joins_records_with_live_state() {
        let records = vec![record("dev", "1"), record("gone", "2")];
        let mut running = Instance::new("1", "dev", InstanceState::Running);
        running.region = Some("fsn1".into());
        let stray = Instance::new("3", "stray", InstanceState::Stopped);
        let live = HashMap::from([(ProviderName::Hetzner, vec![running, stray])]);

        let rows = status_rows(&records, &live);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][3], "running");
        assert_eq!(rows[1][3], "missing");
        assert_eq!(rows[2][0], "stray");
        assert_eq!(rows[2][6], "untracked");
    }

    #[test]
    fn status_matches_unlaunched_records_by_name() {
        let mut pending = record("dev", "1");
        pending.instance_id = None;
        let live = HashMap::from([(
            ProviderName::Hetzner,
            vec![Instance::new("77", "dev", InstanceState::Creating)],
        )]);

        let rows = status_rows(&[pending], &live);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][3], "creating");
    }

    #[test]
    fn status_without_provider_access_is_unknown() {
        let rows = status_rows(&[record("dev", "1")], &HashMap::new());
        assert_eq!(rows[0][3], "unknown");
        assert_eq!(rows[0][4], "203.0.113.5");
    }

    #[test]
    fn menu_values_can_come_from_flags() {
        let mut c = console("");
        assert_eq!(pick(&mut c, "Region", Some("ash".into()), &["fsn1"]).unwrap(), "ash");
        let mut c = console("2\n");
        assert_eq!(pick(&mut c, "Region", None, &["fsn1", "nbg1"]).unwrap(), "nbg1");
    }

    #[test]
    fn default_names_are_valid() {
        validate_name(&default_name()).unwrap();
    }

    #[test]
    fn declined_credential_prompt_places_nothing() {
        assert!(resolve_credential(&mut console("n\n"), None).unwrap().is_none());
    }

    #[test]
    fn credential_from_unset_variable_is_a_precondition_failure() {
        let err = resolve_credential(&mut console(""), Some("MOAT_TEST_SURELY_UNSET_VAR"))
            .unwrap_err();
        assert!(matches!(err, CliError::Infra(moat_infra::Error::MissingEnv(_))));
    }

    #[tokio::test]
    async fn destroy_unknown_deployment() {
        let home = tempfile::tempdir().unwrap();
        let err = destroy("dev", None, &config(&home), &mut console("dev\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::UnknownDeployment(_)));
    }

    #[tokio::test]
    async fn teardown_of_a_failed_launch_looks_up_by_name() {
        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());
        let mut pending = record("dev", "1");
        pending.instance_id = None;
        store.save(&pending).unwrap();

        let provider = FakeProvider::new(ProviderName::Hetzner, Mode::Healthy);
        teardown(provider.as_ref(), &store, "dev", Some(&pending), &mut console("dev\n"))
            .await
            .unwrap();

        let torn = provider.torn_down.lock().unwrap().clone();
        assert_eq!(
            torn,
            vec![TornDown {
                name: "dev".into(),
                id: None,
                reserved_address: None,
            }]
        );
        assert!(store.load("dev").unwrap().is_none());
    }

    #[tokio::test]
    async fn teardown_passes_the_recorded_address_along() {
        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());
        let mut rec = record("dev", "4711");
        rec.reserved_address = Some("192.0.2.77".parse().unwrap());
        store.save(&rec).unwrap();

        let provider = FakeProvider::new(ProviderName::DigitalOcean, Mode::Healthy);
        teardown(provider.as_ref(), &store, "dev", Some(&rec), &mut console("dev\n"))
            .await
            .unwrap();

        let torn = provider.torn_down.lock().unwrap().clone();
        assert_eq!(torn[0].id, Some(InstanceId("4711".into())));
        assert_eq!(torn[0].reserved_address, rec.reserved_address);
    }

    #[tokio::test]
    async fn teardown_without_record_uses_the_name() {
        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());
        let provider = FakeProvider::new(ProviderName::Hetzner, Mode::Healthy);

        teardown(provider.as_ref(), &store, "dev", None, &mut console("dev\n"))
            .await
            .unwrap();
        assert_eq!(provider.torn_down.lock().unwrap()[0].name, "dev");
    }

    #[tokio::test]
    async fn unconfirmed_teardown_touches_nothing() {
        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());
        let rec = record("dev", "4711");
        store.save(&rec).unwrap();
        let provider = FakeProvider::new(ProviderName::Hetzner, Mode::Healthy);

        let err = teardown(provider.as_ref(), &store, "dev", Some(&rec), &mut console("nope\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Cancelled { .. }));
        assert!(provider.torn_down.lock().unwrap().is_empty());
        assert!(store.load("dev").unwrap().is_some());
    }

    #[test]
    fn qr_rejects_unknown_peer() {
        let home = tempfile::tempdir().unwrap();
        let config = config(&home);
        let material = moat_core::keys::generate(
            1,
            &SshKeyChoice::Generate {
                comment: "moat@test".into(),
            },
        )
        .unwrap();
        let topology = moat_core::tunnel::TunnelTopology::default();
        let bundles = moat_core::bundle::for_peers(&material, &topology, None).unwrap();
        let dir = RecordStore::new(&config.home).peers_dir("dev").unwrap();
        export::publish(&mut console(""), &bundles, &dir, false).unwrap();

        qr("dev", Some(1), &config, &mut console("")).unwrap();
        let unknown = qr("dev", Some(4), &config, &mut console(""));
        assert!(matches!(unknown, Err(CliError::Input(_))));
    }
}
