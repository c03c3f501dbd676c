//! Per-provider facts that shape the first-boot document.

/// Account the base document is written for.
pub const BASE_ACCOUNT: &str = "ubuntu";

/// The account a provider's image logs in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAccount {
    pub name: String,
    pub home: String,
    /// Shell change command; `{shell}` and `{user}` are filled in.
    pub shell_change: String,
}

impl LoginAccount {
    pub fn ubuntu() -> Self {
        Self {
            name: BASE_ACCOUNT.into(),
            home: format!("/home/{BASE_ACCOUNT}"),
            shell_change: "chsh -s {shell} {user}".into(),
        }
    }

    pub fn root() -> Self {
        Self {
            name: "root".into(),
            home: "/root".into(),
            shell_change: "chsh -s {shell} {user}".into(),
        }
    }

    /// `user:user`, as used in `chown` and write-file owners.
    pub fn owner(&self) -> String {
        format!("{0}:{0}", self.name)
    }

    pub fn shell_change_command(&self, shell: &str) -> String {
        self.shell_change
            .replace("{shell}", shell)
            .replace("{user}", &self.name)
    }
}

/// Where SSH is gated before it reaches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallPolicy {
    /// Provider-side firewall filters public SSH; the host firewall only
    /// adds defense in depth.
    Edge,
    /// Nothing upstream; the host firewall confines SSH to the tunnel.
    HostOnly,
}

/// How the finished document travels to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Native cloud-config passed inline in the API request.
    CloudConfigInline,
    /// Native cloud-config passed as a file reference.
    CloudConfigFile,
    /// The provider only runs executable user-data; the cloud-config is
    /// wrapped into a bootstrap script.
    ScriptFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub account: LoginAccount,
    /// Whether the instance runs the management tunnel at all.
    pub tunnel: bool,
    pub firewall: FirewallPolicy,
    pub transport: Transport,
    /// Whether a stable address is allocated after the instance runs.
    pub stable_address: bool,
}

impl ProviderProfile {
    pub fn wraps_script(&self) -> bool {
        self.transport == Transport::ScriptFile
    }

    pub fn rewrites_account(&self) -> bool {
        self.account.name != BASE_ACCOUNT
    }
}

/// Rewrites references to [`BASE_ACCOUNT`] for another login account.
pub(crate) struct AccountRewrite<'a> {
    account: &'a LoginAccount,
    base_home: String,
    base_owner: String,
}

impl<'a> AccountRewrite<'a> {
    pub(crate) fn new(account: &'a LoginAccount) -> Self {
        Self {
            account,
            base_home: format!("/home/{BASE_ACCOUNT}"),
            base_owner: format!("{BASE_ACCOUNT}:{BASE_ACCOUNT}"),
        }
    }

    /// Paths and file contents: home directory and owner tokens.
    pub(crate) fn text(&self, input: &str) -> String {
        input
            .replace(&self.base_home, &self.account.home)
            .replace(&self.base_owner, &self.account.owner())
    }

    /// Commands additionally get account-name arguments rewritten.
    pub(crate) fn command(&self, input: &str) -> String {
        if let Some(rest) = input.trim().strip_prefix("chsh -s ")
            && let Some(shell) = rest.strip_suffix(&format!(" {BASE_ACCOUNT}"))
        {
            return self.account.shell_change_command(shell.trim());
        }

        let name = &self.account.name;
        self.text(input)
            .replace(&format!("su - {BASE_ACCOUNT}"), &format!("su - {name}"))
            .replace(&format!("sudo -u {BASE_ACCOUNT}"), &format!("sudo -u {name}"))
    }
}
