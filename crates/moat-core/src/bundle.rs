//! Client-side tunnel configs, one per peer device.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use qrcode::QrCode;
use qrcode::render::unicode::Dense1x2;
use zeroize::Zeroizing;

use crate::keys::KeyMaterial;
use crate::tunnel::TunnelTopology;
use crate::{Error, Result, write_owner_only};

pub const KEEPALIVE_SECS: u16 = 25;

const HEADER_PREFIX: &str = "# moat peer-";

/// WireGuard client config for one peer.
///
/// [`ClientBundle::render`] is canonical: parsing a rendered bundle and
/// rendering it again yields the same bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientBundle {
    /// One-based device number.
    pub peer: usize,
    private_key: Zeroizing<String>,
    pub address: Ipv4Addr,
    pub server_public_key: String,
    /// `host:port`, absent until the instance address is known.
    pub endpoint: Option<String>,
    pub allowed_ips: String,
    pub keepalive: u16,
}

impl std::fmt::Debug for ClientBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBundle")
            .field("peer", &self.peer)
            .field("address", &self.address)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ClientBundle {
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    pub fn file_name(&self) -> String {
        format!("peer-{}.conf", self.peer)
    }

    /// Same bundle pointed at `address`.
    pub fn with_endpoint(mut self, address: Option<IpAddr>, port: u16) -> Self {
        self.endpoint = address.map(|a| format_endpoint(a, port));
        self
    }

    pub fn render(&self) -> Zeroizing<String> {
        let mut out = Zeroizing::new(String::new());
        // Writing into a String cannot fail.
        let _ = write!(
            out,
            "{HEADER_PREFIX}{}\n[Interface]\nPrivateKey = {}\nAddress = {}/32\n\n\
             [Peer]\nPublicKey = {}\n",
            self.peer,
            self.private_key.as_str(),
            self.address,
            self.server_public_key,
        );
        if let Some(endpoint) = &self.endpoint {
            let _ = writeln!(out, "Endpoint = {endpoint}");
        }
        let _ = write!(
            out,
            "AllowedIPs = {}\nPersistentKeepalive = {}\n",
            self.allowed_ips, self.keepalive
        );
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let peer = lines
            .next()
            .and_then(|l| l.strip_prefix(HEADER_PREFIX))
            .and_then(|n| n.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| invalid("missing `# moat peer-<n>` header"))?;

        let mut section = "";
        let mut private_key = None;
        let mut address = None;
        let mut server_public_key = None;
        let mut endpoint = None;
        let mut allowed_ips = None;
        let mut keepalive = None;

        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                section = match line {
                    "[Interface]" => "interface",
                    "[Peer]" => "peer",
                    other => return Err(invalid(format!("unknown section {other}"))),
                };
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim().to_string()))
                .ok_or_else(|| invalid(format!("malformed line `{line}`")))?;

            match (section, key) {
                ("interface", "PrivateKey") => private_key = Some(Zeroizing::new(value)),
                ("interface", "Address") => {
                    let ip = value.strip_suffix("/32").unwrap_or(&value);
                    address = Some(
                        ip.parse::<Ipv4Addr>()
                            .map_err(|e| invalid(format!("address `{value}`: {e}")))?,
                    );
                }
                ("peer", "PublicKey") => server_public_key = Some(value),
                ("peer", "Endpoint") => endpoint = Some(value),
                ("peer", "AllowedIPs") => allowed_ips = Some(value),
                ("peer", "PersistentKeepalive") => {
                    keepalive = Some(
                        value
                            .parse::<u16>()
                            .map_err(|e| invalid(format!("keepalive `{value}`: {e}")))?,
                    );
                }
                _ => return Err(invalid(format!("unexpected `{key}` in {section} section"))),
            }
        }

        Ok(Self {
            peer,
            private_key: private_key.ok_or_else(|| invalid("missing PrivateKey"))?,
            address: address.ok_or_else(|| invalid("missing Address"))?,
            server_public_key: server_public_key.ok_or_else(|| invalid("missing PublicKey"))?,
            endpoint,
            allowed_ips: allowed_ips.ok_or_else(|| invalid("missing AllowedIPs"))?,
            keepalive: keepalive.unwrap_or(KEEPALIVE_SECS),
        })
    }

    /// Write to `<dir>/peer-<n>.conf`, owner-only.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        write_owner_only(&path, self.render().as_bytes())?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = Zeroizing::new(std::fs::read_to_string(path)?);
        Self::parse(&text)
    }

    /// Terminal QR code of the rendered config.
    pub fn render_qr(&self) -> Result<String> {
        let code = QrCode::new(self.render().as_bytes()).map_err(|e| Error::QrCode(e.to_string()))?;
        Ok(code
            .render::<Dense1x2>()
            .dark_color(Dense1x2::Light)
            .light_color(Dense1x2::Dark)
            .quiet_zone(true)
            .build())
    }
}

/// One bundle per peer in `keys`, in request order.
pub fn for_peers(
    keys: &KeyMaterial,
    topology: &TunnelTopology,
    endpoint: Option<IpAddr>,
) -> Result<Vec<ClientBundle>> {
    keys.peers
        .iter()
        .enumerate()
        .map(|(i, pair)| {
            Ok(ClientBundle {
                peer: i + 1,
                private_key: Zeroizing::new(pair.private_key().to_string()),
                address: topology.peer_address(i)?,
                server_public_key: keys.server.public_key().to_string(),
                endpoint: endpoint.map(|a| format_endpoint(a, topology.port())),
                allowed_ips: format!("{}/32", topology.server_address()),
                keepalive: KEEPALIVE_SECS,
            })
        })
        .collect()
}

/// Every `peer-<n>.conf` under `dir`, ordered by peer number.
pub fn load_dir(dir: &Path) -> Result<Vec<ClientBundle>> {
    let mut bundles = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_bundle = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("peer-") && n.ends_with(".conf"));
        if is_bundle {
            bundles.push(ClientBundle::load(&path)?);
        }
    }
    bundles.sort_by_key(|b| b.peer);
    Ok(bundles)
}

fn format_endpoint(address: IpAddr, port: u16) -> String {
    match address {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidBundle(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{SshKeyChoice, generate};

    fn keys(peers: usize) -> KeyMaterial {
        generate(peers, &SshKeyChoice::Generate { comment: "t".into() }).unwrap()
    }

    #[test]
    fn bundles_address_peers_in_order() {
        let keys = keys(3);
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let bundles = for_peers(&keys, &TunnelTopology::default(), Some(ip)).unwrap();

        assert_eq!(bundles.len(), 3);
        for (i, b) in bundles.iter().enumerate() {
            let text = b.render();
            assert!(text.contains(&format!("Address = 10.13.13.{}/32", i + 2)));
            assert!(text.contains(&format!("PrivateKey = {}", keys.peers[i].private_key())));
            assert!(text.contains(&format!("PublicKey = {}", keys.server.public_key())));
            assert!(text.contains("Endpoint = 203.0.113.7:51820"));
            assert!(text.contains("AllowedIPs = 10.13.13.1/32"));
            assert!(text.contains("PersistentKeepalive = 25"));
        }
    }

    #[test]
    fn unknown_address_omits_endpoint() {
        let bundles = for_peers(&keys(1), &TunnelTopology::default(), None).unwrap();
        assert!(!bundles[0].render().contains("Endpoint"));

        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let filled = bundles[0].clone().with_endpoint(Some(ip), 51820);
        assert!(filled.render().contains("Endpoint = [2001:db8::1]:51820"));
    }

    #[test]
    fn regeneration_is_byte_stable() {
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        for endpoint in [None, Some(ip)] {
            for b in for_peers(&keys(2), &TunnelTopology::default(), endpoint).unwrap() {
                let first = b.render();
                let reparsed = ClientBundle::parse(&first).unwrap();
                assert_eq!(reparsed, b);
                assert_eq!(reparsed.render().as_str(), first.as_str());
            }
        }
    }

    #[test]
    fn persisted_bundles_reload_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let bundles = for_peers(&keys(3), &TunnelTopology::default(), None).unwrap();
        for b in bundles.iter().rev() {
            b.persist(dir.path()).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = load_dir(dir.path()).unwrap();
        assert_eq!(loaded, bundles);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("peer-1.conf"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn malformed_bundles_are_rejected() {
        assert!(matches!(ClientBundle::parse("[Interface]\n"), Err(Error::InvalidBundle(_))));
        let missing_key = "# moat peer-1\n[Interface]\nAddress = 10.13.13.2/32\n\
                           [Peer]\nPublicKey = x\nAllowedIPs = 10.13.13.1/32\n";
        assert!(matches!(ClientBundle::parse(missing_key), Err(Error::InvalidBundle(_))));
    }

    #[test]
    fn qr_renders_for_full_bundle() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let bundle = for_peers(&keys(1), &TunnelTopology::default(), Some(ip))
            .unwrap()
            .remove(0);
        let qr = bundle.render_qr().unwrap();
        assert!(qr.lines().count() > 10);
    }
}
