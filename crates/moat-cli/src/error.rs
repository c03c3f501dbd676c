use colored::Colorize;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Input(String),

    #[error("{reason}")]
    Cancelled { reason: String, name: Option<String> },

    #[error("no deployment named `{0}`")]
    UnknownDeployment(String),

    #[error("base cloud-config not found at {0}")]
    MissingDocument(String),

    #[error("{0}")]
    Core(#[from] moat_core::Error),

    #[error("{0}")]
    Infra(#[from] moat_infra::Error),

    #[error("deployment record is unreadable: {0}")]
    Record(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn cancelled(reason: impl Into<String>, name: Option<&str>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
            name: name.map(str::to_string),
        }
    }

    /// One line telling the operator what to do next.
    pub fn hint(&self) -> Option<String> {
        use moat_infra::Error as Infra;

        match self {
            Self::Cancelled { name: Some(name), .. } => Some(format!(
                "anything already created is still billed; \
                 remove it with `moat destroy --name {name}`"
            )),
            Self::Cancelled { name: None, .. } => Some("nothing was changed".into()),
            Self::UnknownDeployment(name) => Some(format!(
                "run `moat status` to see known deployments; for an instance without a \
                 record use `moat destroy --name {name} --provider <provider>`"
            )),
            Self::MissingDocument(_) => Some(
                "create cloud-init.yaml next to you, or point --cloud-init / MOAT_CLOUD_INIT at one"
                    .into(),
            ),
            Self::Input(_) => {
                Some("every prompt can also be answered with a flag, see `moat --help`".into())
            }
            Self::Core(moat_core::Error::InputValidation { .. }) => {
                Some("pass a real value; template placeholders are rejected".into())
            }
            Self::Core(moat_core::Error::DocumentAssembly(_)) => Some(
                "the base document needs a `#cloud-config` first line and a `runcmd:` section"
                    .into(),
            ),
            Self::Core(moat_core::Error::InvalidBundle(_)) => Some(
                "peer configs are regenerated only by `moat create`; do not edit them by hand"
                    .into(),
            ),
            Self::Infra(Infra::MissingTool(tool)) if tool == "multipass" => {
                Some("install Multipass (https://multipass.run) and make sure it is on PATH".into())
            }
            Self::Infra(Infra::MissingTool(tool)) if tool == "aws" => {
                Some("install the AWS CLI v2 and run `aws configure`".into())
            }
            Self::Infra(Infra::MissingTool(tool)) => Some(format!("install `{tool}` and retry")),
            Self::Infra(Infra::MissingEnv(var)) => {
                Some(format!("export {var} or put it in a .env file in this directory"))
            }
            Self::Infra(Infra::ImageNotFound { .. }) => {
                Some("pass an image name prefix the provider offers with --image".into())
            }
            Self::Infra(Infra::UnknownProvider(_)) => Some(format!(
                "choose one of: {}",
                moat_infra::ProviderName::ALL.map(|p| p.as_str()).join(", ")
            )),
            Self::Infra(Infra::Timeout { .. }) => {
                Some("the instance may still be booting; check `moat status`".into())
            }
            Self::Infra(Infra::AddressLeftBehind { address, .. }) => Some(format!(
                "{address} is still billed; release it in the provider console \
                 or with `moat destroy` once it is recorded"
            )),
            Self::Infra(e) if matches!(e.status(), Some(401 | 403)) => {
                Some("the provider rejected the credentials; check the API token".into())
            }
            Self::Infra(e) if e.is_transient() => {
                Some("the provider may be degraded or rate limiting; retry in a moment".into())
            }
            Self::Record(_) => Some("inspect or delete the deployment.json under MOAT_HOME".into()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Print the error and its hint to stderr.
pub fn report(err: &CliError) {
    eprintln!("{} {err}", "error:".red().bold());
    if let Some(hint) = err.hint() {
        eprintln!("{} {hint}", "hint:".yellow().bold());
    }
}
