//! Deployment-independent building blocks for a moat bootstrap:
//! key material, the tunnel overlay, the typed first-boot document and the
//! client credential bundles.
//!
//! Nothing in this crate talks to a provider. The orchestrator in `moat-cli`
//! owns the flow; `moat-infra` only ever receives a finished document.

pub mod bundle;
pub mod cloud_config;
pub mod keys;
pub mod profile;
pub mod template;
pub mod tunnel;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid {field}: {reason}")]
    InputValidation { field: &'static str, reason: String },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("document assembly failed: {0}")]
    DocumentAssembly(String),

    #[error("invalid credential bundle: {0}")]
    InvalidBundle(String),

    #[error("qr code render failed: {0}")]
    QrCode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Write `contents` to `path` readable and writable by the owner only.
///
/// The mode is applied at creation and again afterwards, so a pre-existing
/// file with looser permissions is tightened as well.
pub fn write_owner_only(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
