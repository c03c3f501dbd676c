use std::env;
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use moat_core::tunnel::DEFAULT_TUNNEL_PORT;

use crate::error::{CliError, Result};

const DEFAULT_SSH_SOURCES: &str = "0.0.0.0/0,::/0";

/// Operator settings read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct MoatConfig {
    /// State directory holding one subdirectory per deployment.
    pub home: PathBuf,
    pub cloud_init: PathBuf,
    pub tunnel_port: u16,
    /// CIDRs allowed to reach SSH through an edge firewall.
    pub ssh_sources: Vec<String>,
}

impl MoatConfig {
    pub fn from_env() -> Result<Self> {
        let home = match env::var_os("MOAT_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .map(|h| h.join(".moat"))
                .ok_or_else(|| CliError::input("cannot locate a home directory; set MOAT_HOME"))?,
        };

        let cloud_init = env::var_os("MOAT_CLOUD_INIT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("cloud-init.yaml"));

        let tunnel_port = match env::var("MOAT_WG_PORT") {
            Ok(raw) => parse_port(&raw)?,
            Err(_) => DEFAULT_TUNNEL_PORT,
        };

        let ssh_sources = parse_sources(
            &env::var("MOAT_SSH_SOURCES").unwrap_or_else(|_| DEFAULT_SSH_SOURCES.into()),
        )?;

        Ok(Self {
            home,
            cloud_init,
            tunnel_port,
            ssh_sources,
        })
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(CliError::input(format!("MOAT_WG_PORT must be a port number, got `{raw}`"))),
    }
}

/// Comma-separated CIDR list, normalized to canonical network notation.
fn parse_sources(raw: &str) -> Result<Vec<String>> {
    let sources = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNetwork>()
                .map(|net| format!("{}/{}", net.network(), net.prefix()))
                .map_err(|e| {
                    CliError::input(format!("MOAT_SSH_SOURCES entry `{s}` is not a CIDR: {e}"))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    if sources.is_empty() {
        return Err(CliError::input("MOAT_SSH_SOURCES must name at least one CIDR"));
    }
    Ok(sources)
}
