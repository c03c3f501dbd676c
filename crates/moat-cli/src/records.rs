use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use moat_infra::ProviderName;
use moat_infra::types::InstanceId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CliError, Result};

const RECORD_FILE: &str = "deployment.json";
const PEERS_DIR: &str = "peers";
const MAX_NAME_LEN: usize = 63;

/// What `status`, `export` and `destroy` need to find a deployment again.
///
/// Saved before the provider is asked for anything, so a create that dies
/// halfway still leaves something `destroy` can act on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub name: String,
    pub provider: ProviderName,
    pub region: String,
    pub size: String,
    /// `None` until the provider has acknowledged the launch.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    pub address: Option<IpAddr>,
    #[serde(default)]
    pub static_address: bool,
    /// Provider-held address to release on destroy, even if it never got
    /// attached to the instance.
    #[serde(default)]
    pub reserved_address: Option<IpAddr>,
    pub peers: usize,
    pub tunnel_port: u16,
    pub server_public_key: Option<String>,
    pub ssh_key_path: PathBuf,
    pub account: String,
    pub created_at: DateTime<Utc>,
}

/// Deployment records under `<home>/deployments/<name>/`.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(home: &Path) -> Self {
        Self {
            root: home.join("deployments"),
        }
    }

    /// Directory owned by one deployment: record, SSH key, peer configs.
    pub fn dir(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    pub fn peers_dir(&self, name: &str) -> Result<PathBuf> {
        Ok(self.dir(name)?.join(PEERS_DIR))
    }

    pub fn save(&self, record: &DeploymentRecord) -> Result<PathBuf> {
        let dir = self.dir(&record.name)?;
        fs::create_dir_all(&dir)?;
        let path = dir.join(RECORD_FILE);
        let json = serde_json::to_vec_pretty(record)?;
        moat_core::write_owner_only(&path, &json)?;
        debug!(path = %path.display(), "deployment record saved");
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<Option<DeploymentRecord>> {
        let path = self.dir(name)?.join(RECORD_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn require(&self, name: &str) -> Result<DeploymentRecord> {
        self.load(name)?
            .ok_or_else(|| CliError::UnknownDeployment(name.to_string()))
    }

    /// All readable records, oldest first. Directories without a record
    /// are skipped.
    pub fn list(&self) -> Result<Vec<DeploymentRecord>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_name(&name).is_err() {
                continue;
            }
            if let Some(record) = self.load(&name)? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Drop everything stored for `name`, keys and peer configs included.
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.dir(name)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(name, "deployment state removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Instance names double as directory names and provider hostnames:
/// lowercase letters, digits and hyphens, starting with a letter.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(CliError::input(format!(
            "`{name}` is not a valid instance name (lowercase letters, digits and '-', \
             starting with a letter, at most {MAX_NAME_LEN} characters)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(name: &str, age_minutes: i64) -> DeploymentRecord {
        DeploymentRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            provider: ProviderName::Hetzner,
            region: "fsn1".into(),
            size: "cx22".into(),
            instance_id: Some(InstanceId("4711".into())),
            address: None,
            static_address: false,
            reserved_address: None,
            peers: 2,
            tunnel_port: 51820,
            server_public_key: Some("c2VydmVy".into()),
            ssh_key_path: PathBuf::from("/tmp/id_ed25519"),
            account: "root".into(),
            created_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn save_load_and_update() {
        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());

        let mut rec = record("dev", 0);
        store.save(&rec).unwrap();
        assert_eq!(store.load("dev").unwrap().unwrap(), rec);

        rec.address = Some("203.0.113.9".parse().unwrap());
        rec.static_address = true;
        rec.reserved_address = rec.address;
        store.save(&rec).unwrap();
        let loaded = store.require("dev").unwrap();
        assert_eq!(loaded.address, rec.address);
        assert!(loaded.static_address);
        assert_eq!(loaded.reserved_address, rec.address);
    }

    #[test]
    fn records_from_before_launch_load() {
        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());
        let mut rec = record("dev", 0);
        rec.instance_id = None;
        let path = store.save(&rec).unwrap();

        let raw = fs::read(&path).unwrap();
        let mut json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        let fields = json.as_object_mut().unwrap();
        fields.remove("instance_id");
        fields.remove("reserved_address");
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let loaded = store.require("dev").unwrap();
        assert_eq!(loaded.instance_id, None);
        assert_eq!(loaded.reserved_address, None);
    }

    #[cfg(unix)]
    #[test]
    fn record_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());
        let path = store.save(&record("dev", 0)).unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn list_is_oldest_first_and_skips_strays() {
        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());
        store.save(&record("newer", 1)).unwrap();
        store.save(&record("older", 30)).unwrap();
        fs::create_dir_all(home.path().join("deployments/empty")).unwrap();
        fs::create_dir_all(home.path().join("deployments/Not_A_Name")).unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["older", "newer"]);
    }

    #[test]
    fn missing_records() {
        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());
        assert!(store.list().unwrap().is_empty());
        assert!(store.load("dev").unwrap().is_none());
        assert!(matches!(store.require("dev"), Err(CliError::UnknownDeployment(_))));
        store.remove("dev").unwrap();
    }

    #[test]
    fn remove_deletes_the_whole_directory() {
        let home = tempfile::tempdir().unwrap();
        let store = RecordStore::new(home.path());
        store.save(&record("dev", 0)).unwrap();
        fs::create_dir_all(store.peers_dir("dev").unwrap()).unwrap();

        store.remove("dev").unwrap();
        assert!(!home.path().join("deployments/dev").exists());
    }

    #[test]
    fn names_cannot_escape_the_state_dir() {
        for bad in ["", "../etc", "Dev", "9lives", "a b", "trailing-", &"x".repeat(64)] {
            assert!(validate_name(bad).is_err(), "{bad:?} accepted");
        }
        for good in ["dev", "moat-0412", "a1-b2"] {
            validate_name(good).unwrap();
        }
    }
}
