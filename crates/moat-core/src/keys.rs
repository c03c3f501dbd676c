//! Per-deployment key material.
//!
//! One SSH identity (Ed25519, OpenSSH encoding) and one WireGuard identity
//! per tunnel endpoint. Everything is produced once by [`generate`] and then
//! only borrowed; private halves are zeroized on drop.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey};
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{Error, Result, write_owner_only};

/// File name of a newly generated SSH identity inside the deployment's state dir.
pub const SSH_KEY_FILE: &str = "id_ed25519";

/// How the deployment's SSH identity is obtained.
#[derive(Debug, Clone)]
pub enum SshKeyChoice {
    Generate { comment: String },
    Reuse(PathBuf),
}

/// WireGuard key pair, base64 encoded as `wg` expects.
#[derive(Clone)]
pub struct WgKeyPair {
    private_key: Zeroizing<String>,
    public_key: String,
}

impl WgKeyPair {
    pub fn from_private(private_key: &str) -> Result<Self> {
        let public_key = wireguard_public_key(private_key)?;
        Ok(Self {
            private_key: Zeroizing::new(private_key.trim().to_string()),
            public_key,
        })
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

impl fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// SSH identity injected as the instance's authorized key.
pub struct SshIdentity {
    /// OpenSSH-encoded private key. `None` when an existing key was reused:
    /// the operator's own file stays the only copy.
    private_key: Option<Zeroizing<String>>,
    public_key: ssh_key::PublicKey,
    public_line: String,
    source: Option<PathBuf>,
}

impl SshIdentity {
    pub fn public_line(&self) -> &str {
        &self.public_line
    }

    /// The reused key file, if any.
    pub fn reused_from(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn is_generated(&self) -> bool {
        self.private_key.is_some()
    }

    /// `SHA256:<base64>` fingerprint, as printed by `ssh-keygen -l`.
    pub fn fingerprint(&self) -> Result<String> {
        Ok(self.public_key.fingerprint(HashAlg::Sha256).to_string())
    }

    /// Persist a newly generated identity as `<dir>/id_ed25519{,.pub}`.
    ///
    /// Returns the private key path. For a reused identity nothing is
    /// written and the original path is returned.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        let Some(private_key) = &self.private_key else {
            return self.source.clone().ok_or_else(|| {
                Error::KeyGeneration("reused identity has no source path".into())
            });
        };

        std::fs::create_dir_all(dir)?;
        let path = dir.join(SSH_KEY_FILE);
        write_owner_only(&path, private_key.as_bytes())?;
        std::fs::write(
            dir.join(format!("{SSH_KEY_FILE}.pub")),
            format!("{}\n", self.public_line),
        )?;

        info!(path = %path.display(), "ssh identity saved");
        Ok(path)
    }
}

impl fmt::Debug for SshIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshIdentity")
            .field("public_line", &self.public_line)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// All key material of one deployment. Built once, never mutated.
#[derive(Debug)]
pub struct KeyMaterial {
    pub ssh: SshIdentity,
    pub server: WgKeyPair,
    pub peers: Vec<WgKeyPair>,
}

/// Produce the key material for a deployment with `peer_count` devices.
pub fn generate(peer_count: usize, ssh: &SshKeyChoice) -> Result<KeyMaterial> {
    let ssh = match ssh {
        SshKeyChoice::Generate { comment } => generate_ssh_identity(comment)?,
        SshKeyChoice::Reuse(path) => load_ssh_identity(path)?,
    };

    let server = generate_wireguard_keypair()?;
    let peers = (0..peer_count)
        .map(|_| generate_wireguard_keypair())
        .collect::<Result<Vec<_>>>()?;

    debug!(peers = peers.len(), "key material generated");

    Ok(KeyMaterial { ssh, server, peers })
}

/// Generate a WireGuard key pair from the OS RNG.
pub fn generate_wireguard_keypair() -> Result<WgKeyPair> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    fill_random(&mut bytes[..])?;

    // WireGuard clamping
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;

    let secret = StaticSecret::from(*bytes);
    let public = PublicKey::from(&secret);

    Ok(WgKeyPair {
        private_key: Zeroizing::new(STANDARD.encode(&bytes[..])),
        public_key: STANDARD.encode(public.as_bytes()),
    })
}

/// Derive the base64 public key from a base64 WireGuard private key.
pub fn wireguard_public_key(private_key: &str) -> Result<String> {
    let raw = Zeroizing::new(
        STANDARD
            .decode(private_key.trim())
            .map_err(|e| Error::KeyGeneration(format!("wireguard key is not base64: {e}")))?,
    );
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| Error::KeyGeneration("wireguard key must be 32 bytes".into()))?;
    let secret = StaticSecret::from(bytes);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| Error::KeyGeneration(format!("system random source unavailable: {e}")))
}

fn ssh_error(context: &str, e: ssh_key::Error) -> Error {
    Error::KeyGeneration(format!("{context}: {e}"))
}

fn generate_ssh_identity(comment: &str) -> Result<SshIdentity> {
    let mut private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| ssh_error("cannot generate ssh key", e))?;
    private.set_comment(comment);

    let public_key = private.public_key().clone();
    let public_line = public_key
        .to_openssh()
        .map_err(|e| ssh_error("cannot encode ssh public key", e))?;
    let private_key = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| ssh_error("cannot encode ssh private key", e))?;

    Ok(SshIdentity {
        private_key: Some(private_key),
        public_key,
        public_line: public_line.trim_end().to_string(),
        source: None,
    })
}

/// Derive the public half of an existing identity.
///
/// The public key section of an OpenSSH private key is never encrypted, so
/// passphrase-protected keys work without prompting. Other formats fall back
/// to the adjacent `.pub` file.
fn load_ssh_identity(path: &Path) -> Result<SshIdentity> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::KeyGeneration(format!("cannot read ssh identity {}: {e}", path.display()))
    })?;

    let public_key = match PrivateKey::from_openssh(&text) {
        Ok(private) => private.public_key().clone(),
        Err(_) => {
            let pub_path = PathBuf::from(format!("{}.pub", path.display()));
            let line = std::fs::read_to_string(&pub_path).map_err(|e| {
                Error::KeyGeneration(format!(
                    "cannot derive public key from {} and {} is unreadable: {e}",
                    path.display(),
                    pub_path.display()
                ))
            })?;
            ssh_key::PublicKey::from_openssh(line.trim()).map_err(|e| {
                ssh_error(&format!("{} does not contain an ssh public key", pub_path.display()), e)
            })?
        }
    };

    let public_line = public_key
        .to_openssh()
        .map_err(|e| ssh_error("cannot encode ssh public key", e))?;

    Ok(SshIdentity {
        private_key: None,
        public_key,
        public_line: public_line.trim_end().to_string(),
        source: Some(path.to_path_buf()),
    })
}
