use std::net::IpAddr;
use std::path::{Path, PathBuf};

use colored::Colorize;
use moat_core::bundle::{self, ClientBundle};
use tracing::info;

use crate::error::{CliError, Result};
use crate::prompt::Console;
use crate::ui::{done, warning};

/// Persist each bundle under `dir`, optionally showing it as a QR code.
pub fn publish(
    console: &mut Console,
    bundles: &[ClientBundle],
    dir: &Path,
    qr: bool,
) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(bundles.len());
    for bundle in bundles {
        let path = bundle.persist(dir)?;
        info!(peer = bundle.peer, path = %path.display(), "peer config written");
        console.say(done(&format!(
            "peer {} config written to {}",
            bundle.peer,
            path.display()
        )))?;
        if qr {
            show_qr(console, bundle)?;
        }
        paths.push(path);
    }
    Ok(paths)
}

pub fn show_qr(console: &mut Console, bundle: &ClientBundle) -> Result<()> {
    console.say(format!(
        "\n{} (tunnel address {})",
        format!("peer-{}", bundle.peer).bold(),
        bundle.address
    ))?;
    if bundle.endpoint.is_none() {
        console.say(warning(
            "this config has no Endpoint yet; run `moat export` once the instance has an address",
        ))?;
    }
    console.say(bundle.render_qr()?.as_str())?;
    Ok(())
}

/// Load the persisted configs from `dir`; an empty directory is an error.
pub fn load(dir: &Path) -> Result<Vec<ClientBundle>> {
    let bundles = match bundle::load_dir(dir) {
        Ok(b) => b,
        Err(moat_core::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    if bundles.is_empty() {
        return Err(CliError::input(format!(
            "no peer configs under {} (local deployments have no tunnel)",
            dir.display()
        )));
    }
    Ok(bundles)
}

/// Rewrite every persisted config in `dir` to point at `address`.
pub fn refresh(dir: &Path, address: Option<IpAddr>, port: u16) -> Result<Vec<ClientBundle>> {
    load(dir)?
        .into_iter()
        .map(|b| {
            let updated = b.with_endpoint(address, port);
            updated.persist(dir)?;
            Ok(updated)
        })
        .collect()
}
