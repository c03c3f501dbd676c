//! First-boot document assembly.
//!
//! [`build`] turns the operator's base cloud-config into the document a
//! provider receives: deployment key first, account paths adapted to the
//! provider's image, tunnel and credential files inside `write_files`,
//! tunnel/firewall commands after every base command, and the completion
//! marker last. Providers that only run scripts get the result wrapped by
//! [`wrap_script`].

use std::fmt;
use std::path::Path;

use serde_yaml::Value;
use zeroize::Zeroizing;

use crate::cloud_config::{CloudConfig, WriteFile, command_text};
use crate::keys::KeyMaterial;
use crate::profile::{AccountRewrite, FirewallPolicy, ProviderProfile};
use crate::tunnel::TunnelTopology;
use crate::{Error, Result, write_owner_only};

pub const WG_INTERFACE: &str = "wg0";
pub const WG_CONFIG_PATH: &str = "/etc/wireguard/wg0.conf";
pub const COMPLETION_MARKER: &str = "/var/lib/moat/bootstrap-complete";
pub const TUNNEL_PACKAGES: &[&str] = &["wireguard", "ufw"];

const WRAPPED_CONFIG_PATH: &str = "/etc/cloud/cloud.cfg.d/99-moat-bootstrap.cfg";
const SCRIPT_DELIMITER: &str = "MOAT_CLOUD_CONFIG_EOF";
const METADATA_ADDRESS: &str = "169.254.169.254";

/// cloud-init modules forced after the wrapped document is in place. The
/// `runcmd` module only writes the command script; it is executed directly
/// afterwards because `scripts_user` would run this bootstrap script again.
/// A failing module is reported and the rest still run.
const FORCED_MODULES: &[&str] = &[
    "ssh",
    "set_passwords",
    "write_files",
    "package_update_upgrade_install",
    "runcmd",
];

/// Third-party API credential placed on the instance.
pub struct ApiCredential {
    env_var: String,
    value: Zeroizing<String>,
}

impl ApiCredential {
    pub fn new(env_var: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let env_var = env_var.into();
        let value = Zeroizing::new(value.into().trim().to_string());

        if env_var.is_empty()
            || !env_var
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::InputValidation {
                field: "credential variable",
                reason: format!("`{env_var}` is not a valid environment variable name"),
            });
        }
        if is_placeholder(&value) {
            return Err(Error::InputValidation {
                field: "API credential",
                reason: "value is empty or still a placeholder".into(),
            });
        }

        Ok(Self { env_var, value })
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("env_var", &self.env_var)
            .finish_non_exhaustive()
    }
}

/// Values people leave in templates instead of a real secret.
pub fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    let lower = v.to_ascii_lowercase();
    v.is_empty()
        || (v.starts_with('<') && v.ends_with('>'))
        || lower == "changeme"
        || lower.starts_with("your-")
        || lower.starts_with("your_")
        || lower.starts_with("xxx")
        || lower.ends_with("...")
        || lower.contains("placeholder")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    CloudConfig,
    Script,
}

/// The finished document. Holds the tunnel server's private key, so it is
/// zeroized on drop and written owner-only.
pub struct FinalDocument {
    kind: DocumentKind,
    text: Zeroizing<String>,
}

impl FinalDocument {
    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn file_name(&self) -> &'static str {
        match self.kind {
            DocumentKind::CloudConfig => "cloud-init.yaml",
            DocumentKind::Script => "bootstrap.sh",
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_owner_only(path, self.text.as_bytes())
    }
}

impl fmt::Debug for FinalDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalDocument")
            .field("kind", &self.kind)
            .field("len", &self.text.len())
            .finish()
    }
}

pub struct BuildOptions<'a> {
    pub topology: TunnelTopology,
    pub credential: Option<&'a ApiCredential>,
}

/// Assemble the provider-adapted first-boot document.
pub fn build(
    base: &str,
    keys: &KeyMaterial,
    profile: &ProviderProfile,
    options: &BuildOptions<'_>,
) -> Result<FinalDocument> {
    let mut doc = CloudConfig::parse(base)?;
    // Fail before touching anything if the run-commands section is absent.
    doc.runcmd_mut()?;

    doc.prepend_authorized_key(keys.ssh.public_line());

    if profile.rewrites_account() {
        let rewrite = AccountRewrite::new(&profile.account);
        doc.rewrite(|s| rewrite.text(s), |s| rewrite.command(s));
    }

    if profile.tunnel {
        doc.ensure_packages(TUNNEL_PACKAGES)?;
        doc.write_files_mut()
            .push(tunnel_server_file(keys, &options.topology)?);
    }

    if let Some(credential) = options.credential {
        doc.write_files_mut()
            .push(credential_file(credential, profile));
    }

    let commands = doc.runcmd_mut()?;
    if profile.tunnel {
        if profile.firewall == FirewallPolicy::HostOnly {
            commands.retain(|c| !command_text(c).is_some_and(|t| opens_public_ssh(&t)));
        }
        commands.extend(
            tunnel_commands(profile.firewall, &options.topology)
                .into_iter()
                .map(Value::String),
        );
    }
    let marker = completion_command();
    commands.retain(|c| command_text(c).as_deref() != Some(marker.as_str()));
    commands.push(Value::String(marker));

    if profile.wraps_script() {
        // The module is re-run by hand; host keys must survive it.
        doc.set("ssh_deletekeys", Value::Bool(false));
        let rendered = Zeroizing::new(doc.render()?);
        return Ok(FinalDocument {
            kind: DocumentKind::Script,
            text: wrap_script(&rendered)?,
        });
    }

    Ok(FinalDocument {
        kind: DocumentKind::CloudConfig,
        text: Zeroizing::new(doc.render()?),
    })
}

/// Server side `wg0.conf`: interface `.1`, one `[Peer]` per device.
pub fn tunnel_server_config(
    keys: &KeyMaterial,
    topology: &TunnelTopology,
) -> Result<Zeroizing<String>> {
    let mut conf = Zeroizing::new(format!(
        "[Interface]\nAddress = {}/24\nListenPort = {}\nPrivateKey = {}\n",
        topology.server_address(),
        topology.port(),
        keys.server.private_key(),
    ));

    for (i, peer) in keys.peers.iter().enumerate() {
        conf.push_str(&format!(
            "\n[Peer]\n# peer-{}\nPublicKey = {}\nAllowedIPs = {}/32\n",
            i + 1,
            peer.public_key(),
            topology.peer_address(i)?,
        ));
    }

    Ok(conf)
}

fn tunnel_server_file(keys: &KeyMaterial, topology: &TunnelTopology) -> Result<WriteFile> {
    let conf = tunnel_server_config(keys, topology)?;
    Ok(WriteFile::new(WG_CONFIG_PATH, "root:root", "0600", conf.to_string()))
}

fn credential_file(credential: &ApiCredential, profile: &ProviderProfile) -> WriteFile {
    WriteFile::new(
        format!("{}/.config/moat/credentials.env", profile.account.home),
        profile.account.owner(),
        "0600",
        format!("{}={}\n", credential.env_var, credential.value.as_str()),
    )
}

/// Tunnel activation plus host firewall, in execution order.
pub fn tunnel_commands(policy: FirewallPolicy, topology: &TunnelTopology) -> Vec<String> {
    let port = topology.port();
    let mut commands = vec![
        format!("systemctl enable --now wg-quick@{WG_INTERFACE}"),
        "ufw default deny incoming".to_string(),
        "ufw default allow outgoing".to_string(),
    ];
    match policy {
        FirewallPolicy::Edge => {
            commands.push("ufw allow 22/tcp".to_string());
        }
        FirewallPolicy::HostOnly => {
            commands.push(format!(
                "ufw allow from {} to any port 22 proto tcp",
                topology.subnet()
            ));
        }
    }
    commands.push(format!("ufw allow {port}/udp"));
    commands.push("ufw --force enable".to_string());
    commands
}

pub fn completion_command() -> String {
    let dir = COMPLETION_MARKER
        .rsplit_once('/')
        .map(|(d, _)| d)
        .unwrap_or("/");
    format!("mkdir -p {dir} && touch {COMPLETION_MARKER}")
}

/// `ufw allow 22`, `ufw allow 22/tcp`, `ufw allow ssh`, `ufw allow OpenSSH`
/// without a `from` restriction.
fn opens_public_ssh(command: &str) -> bool {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let Some(pos) = tokens.windows(2).position(|w| w == ["ufw", "allow"]) else {
        return false;
    };
    if tokens.contains(&"from") {
        return false;
    }
    matches!(
        tokens.get(pos + 2).copied(),
        Some("22" | "22/tcp" | "ssh" | "OpenSSH")
    )
}

/// Wrap a finished cloud-config for providers whose user-data must be an
/// executable script.
///
/// The scrub of cached user-data runs from an `EXIT` trap, so it happens
/// whether or not the modules succeed. It is best effort: the provider's
/// metadata service may still hold the payload, and the packet filter only
/// stops the instance itself from fetching it again.
pub fn wrap_script(document: &str) -> Result<Zeroizing<String>> {
    if document.lines().any(|l| l.trim() == SCRIPT_DELIMITER) {
        return Err(Error::DocumentAssembly(format!(
            "document contains the heredoc delimiter `{SCRIPT_DELIMITER}`"
        )));
    }

    let mut script = Zeroizing::new(String::with_capacity(document.len() + 1024));
    script.push_str("#!/bin/bash\n");
    script.push_str("# moat bootstrap: hands the embedded cloud-config to cloud-init.\n");
    script.push_str("set -euo pipefail\n");
    script.push_str("umask 077\n\n");

    let drop_rule = format!(
        "OUTPUT -d {METADATA_ADDRESS} -p tcp --dport 80 \\\n    \
         -m string --string /latest/user-data --algo bm -j DROP"
    );
    script.push_str("# Remove cached copies of this payload, however the script ends.\n");
    script.push_str("scrub() {\n");
    script.push_str(&format!("  rm -f {WRAPPED_CONFIG_PATH} || true\n"));
    script.push_str("  rm -f /var/lib/cloud/instance/user-data.txt \\\n");
    script.push_str("    /var/lib/cloud/instance/user-data.txt.i || true\n");
    script.push_str("  rm -f /var/lib/cloud/instance/scripts/part-* || true\n");
    script.push_str(&format!("  iptables -C {drop_rule} 2>/dev/null \\\n"));
    script.push_str(&format!("    || iptables -A {drop_rule} \\\n"));
    script.push_str("    || true\n");
    script.push_str("}\n");
    script.push_str("trap scrub EXIT\n\n");

    script.push_str(&format!("mkdir -p {}\n", parent(WRAPPED_CONFIG_PATH)));
    script.push_str(&format!("cat > {WRAPPED_CONFIG_PATH} <<'{SCRIPT_DELIMITER}'\n"));
    script.push_str(document);
    if !document.ends_with('\n') {
        script.push('\n');
    }
    script.push_str(SCRIPT_DELIMITER);
    script.push_str("\n\n");

    for module in FORCED_MODULES {
        script.push_str(&format!(
            "cloud-init single --name {module} --frequency always \\\n  \
             || echo \"moat: cloud-init module {module} failed\" >&2\n"
        ));
    }
    script.push_str(
        "sh /var/lib/cloud/instance/scripts/runcmd || echo \"moat: runcmd failed\" >&2\n",
    );

    Ok(script)
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(d, _)| d).unwrap_or("/")
}
