//! Typed cloud-config section tree.
//!
//! The base document is parsed once into header, authorized keys, an
//! order-preserving body, `write_files` and `runcmd`. Fragments are added to
//! those sections and the tree is serialized once, always in the order
//! header → `ssh_authorized_keys` → body → `write_files` → `runcmd`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};

use crate::{Error, Result};

pub const HEADER: &str = "#cloud-config";

const AUTHORIZED_KEYS: &str = "ssh_authorized_keys";
const WRITE_FILES: &str = "write_files";
const RUNCMD: &str = "runcmd";
const PACKAGES: &str = "packages";

/// One `write_files` entry. Unknown keys (`encoding`, `append`, `defer`)
/// are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_permissions",
        skip_serializing_if = "Option::is_none"
    )]
    pub permissions: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub extra: Mapping,
}

impl WriteFile {
    pub fn new(
        path: impl Into<String>,
        owner: impl Into<String>,
        permissions: &str,
        content: String,
    ) -> Self {
        Self {
            path: path.into(),
            owner: Some(owner.into()),
            permissions: Some(permissions.into()),
            content,
            extra: Mapping::new(),
        }
    }

    /// Effective owner (cloud-init default `root:root`).
    pub fn owner(&self) -> &str {
        self.owner.as_deref().unwrap_or("root:root")
    }

    /// Effective mode (cloud-init default `0644`).
    pub fn permissions(&self) -> &str {
        self.permissions.as_deref().unwrap_or("0644")
    }
}

/// Unquoted modes such as `0644` arrive as integers.
fn de_permissions<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(format!("{:0>4}", n.to_string())),
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "unsupported permissions value: {other:?}"
            )));
        }
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloudConfig {
    header: String,
    authorized_keys: Vec<String>,
    body: Mapping,
    write_files: Vec<WriteFile>,
    runcmd: Option<Vec<Value>>,
}

impl CloudConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let header = text.lines().next().unwrap_or_default().trim_end();
        if !header.starts_with(HEADER) {
            return Err(Error::DocumentAssembly(format!(
                "base document must start with `{HEADER}`"
            )));
        }

        let root: Value = serde_yaml::from_str(text)
            .map_err(|e| Error::DocumentAssembly(format!("base document is not valid YAML: {e}")))?;
        let Value::Mapping(root) = root else {
            return Err(Error::DocumentAssembly(
                "base document must be a mapping of cloud-config keys".into(),
            ));
        };

        let mut doc = Self {
            header: header.to_string(),
            authorized_keys: Vec::new(),
            body: Mapping::new(),
            write_files: Vec::new(),
            runcmd: None,
        };

        for (key, value) in root {
            match key.as_str() {
                Some(AUTHORIZED_KEYS) => {
                    doc.authorized_keys = serde_yaml::from_value(value).map_err(|e| {
                        Error::DocumentAssembly(format!("{AUTHORIZED_KEYS}: {e}"))
                    })?;
                }
                Some(WRITE_FILES) => {
                    doc.write_files = serde_yaml::from_value(value)
                        .map_err(|e| Error::DocumentAssembly(format!("{WRITE_FILES}: {e}")))?;
                }
                Some(RUNCMD) => {
                    let commands = match value {
                        Value::Null => Vec::new(),
                        Value::Sequence(seq) => seq,
                        _ => {
                            return Err(Error::DocumentAssembly(format!(
                                "{RUNCMD} must be a list of commands"
                            )));
                        }
                    };
                    doc.runcmd = Some(commands);
                }
                _ => {
                    doc.body.insert(key, value);
                }
            }
        }

        Ok(doc)
    }

    pub fn authorized_keys(&self) -> &[String] {
        &self.authorized_keys
    }

    /// Put `key` first among the authorized keys (deduplicated).
    pub fn prepend_authorized_key(&mut self, key: &str) {
        self.authorized_keys.retain(|k| k != key);
        self.authorized_keys.insert(0, key.to_string());
    }

    pub fn write_files(&self) -> &[WriteFile] {
        &self.write_files
    }

    pub fn write_files_mut(&mut self) -> &mut Vec<WriteFile> {
        &mut self.write_files
    }

    /// Run-commands section. Missing section is an error: fragments that
    /// belong there must never land anywhere else.
    pub fn runcmd_mut(&mut self) -> Result<&mut Vec<Value>> {
        self.runcmd.as_mut().ok_or_else(|| {
            Error::DocumentAssembly(format!(
                "base document has no `{RUNCMD}` section; \
                 refusing to place tunnel and firewall commands elsewhere"
            ))
        })
    }

    pub fn runcmd(&self) -> Option<&[Value]> {
        self.runcmd.as_deref()
    }

    /// Body value for `key` (anything outside the typed sections).
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.body.insert(Value::String(key.into()), value);
    }

    /// Make sure every name in `wanted` is listed under `packages`.
    pub fn ensure_packages(&mut self, wanted: &[&str]) -> Result<()> {
        let entry = self
            .body
            .entry(Value::String(PACKAGES.into()))
            .or_insert_with(|| Value::Sequence(Vec::new()));
        if entry.is_null() {
            *entry = Value::Sequence(Vec::new());
        }
        let Value::Sequence(packages) = entry else {
            return Err(Error::DocumentAssembly(format!("{PACKAGES} must be a list")));
        };

        for name in wanted {
            let present = packages.iter().any(|p| match p {
                Value::String(s) => s == name,
                Value::Sequence(pinned) => pinned.first().and_then(Value::as_str) == Some(*name),
                _ => false,
            });
            if !present {
                packages.push(Value::String((*name).into()));
            }
        }
        Ok(())
    }

    /// Apply `f` to every string in the body (recursively), write-file
    /// paths, owners and contents, and run-commands.
    pub(crate) fn rewrite(
        &mut self,
        text: impl Fn(&str) -> String,
        command: impl Fn(&str) -> String,
    ) {
        for (_, value) in self.body.iter_mut() {
            rewrite_value(value, &text);
        }
        for file in &mut self.write_files {
            file.path = text(&file.path);
            if let Some(owner) = &file.owner {
                file.owner = Some(text(owner));
            }
            file.content = text(&file.content);
        }
        if let Some(commands) = &mut self.runcmd {
            for cmd in commands.iter_mut() {
                rewrite_value(cmd, &command);
            }
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut out = Mapping::new();
        if !self.authorized_keys.is_empty() {
            out.insert(
                Value::String(AUTHORIZED_KEYS.into()),
                Value::Sequence(
                    self.authorized_keys
                        .iter()
                        .cloned()
                        .map(Value::String)
                        .collect(),
                ),
            );
        }
        for (key, value) in &self.body {
            out.insert(key.clone(), value.clone());
        }
        if !self.write_files.is_empty() {
            let files = serde_yaml::to_value(&self.write_files)
                .map_err(|e| Error::DocumentAssembly(format!("{WRITE_FILES}: {e}")))?;
            out.insert(Value::String(WRITE_FILES.into()), files);
        }
        if let Some(commands) = &self.runcmd {
            out.insert(Value::String(RUNCMD.into()), Value::Sequence(commands.clone()));
        }

        let yaml = serde_yaml::to_string(&out)
            .map_err(|e| Error::DocumentAssembly(format!("serialize: {e}")))?;
        Ok(format!("{}\n{yaml}", self.header))
    }
}

/// Text of a run-command: a shell string, or an argv list joined by spaces.
pub fn command_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Sequence(argv) => Some(
            argv.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

fn rewrite_value(value: &mut Value, f: &impl Fn(&str) -> String) {
    match value {
        Value::String(s) => *s = f(s),
        Value::Sequence(seq) => seq.iter_mut().for_each(|v| rewrite_value(v, f)),
        Value::Mapping(map) => map.iter_mut().for_each(|(_, v)| rewrite_value(v, f)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"#cloud-config
package_update: true
packages:
  - git
  - zsh
ssh_pwauth: false
write_files:
  - path: /home/ubuntu/.zshrc
    owner: ubuntu:ubuntu
    permissions: '0644'
    content: |
      export EDITOR=vim
runcmd:
  - apt-get install -y ripgrep
  - [sh, -c, "echo hi"]
"#;

    #[test]
    fn parses_sections() {
        let doc = CloudConfig::parse(BASE).unwrap();
        assert!(doc.authorized_keys().is_empty());
        assert_eq!(doc.write_files().len(), 1);
        assert_eq!(doc.write_files()[0].owner(), "ubuntu:ubuntu");
        assert_eq!(doc.runcmd().unwrap().len(), 2);
        assert_eq!(command_text(&doc.runcmd().unwrap()[1]).unwrap(), "sh -c echo hi");
        assert_eq!(doc.get("ssh_pwauth"), Some(&Value::Bool(false)));
    }

    #[test]
    fn missing_header_is_rejected() {
        let err = CloudConfig::parse("packages: [git]\nruncmd: []\n").unwrap_err();
        assert!(matches!(err, Error::DocumentAssembly(_)));
    }

    #[test]
    fn missing_runcmd_fails_closed() {
        let mut doc = CloudConfig::parse("#cloud-config\npackages: [git]\n").unwrap();
        assert!(matches!(doc.runcmd_mut(), Err(Error::DocumentAssembly(_))));
    }

    #[test]
    fn render_orders_sections() {
        let mut doc = CloudConfig::parse(BASE).unwrap();
        doc.prepend_authorized_key("ssh-ed25519 AAAA test");
        doc.write_files_mut().push(WriteFile::new(
            "/etc/example",
            "root:root",
            "0600",
            "x\n".into(),
        ));
        let text = doc.render().unwrap();

        assert!(text.starts_with("#cloud-config\n"));
        let keys = text.find("ssh_authorized_keys:").unwrap();
        let packages = text.find("packages:").unwrap();
        let files = text.find("write_files:").unwrap();
        let example = text.find("/etc/example").unwrap();
        let runcmd = text.find("runcmd:").unwrap();
        assert!(keys < packages);
        assert!(packages < files);
        assert!(files < example && example < runcmd);

        let reparsed = CloudConfig::parse(&text).unwrap();
        assert_eq!(reparsed.write_files()[1].permissions(), "0600");
        assert_eq!(reparsed.authorized_keys(), ["ssh-ed25519 AAAA test"]);
    }

    #[test]
    fn unquoted_mode_is_kept_as_text() {
        let doc = CloudConfig::parse(
            "#cloud-config\nwrite_files:\n  - path: /a\n    permissions: 600\n    content: x\n\
             runcmd: []\n",
        )
        .unwrap();
        assert_eq!(doc.write_files()[0].permissions(), "0600");
    }

    #[test]
    fn ensure_packages_is_idempotent() {
        let mut doc = CloudConfig::parse(BASE).unwrap();
        doc.ensure_packages(&["wireguard", "git"]).unwrap();
        doc.ensure_packages(&["wireguard"]).unwrap();
        let packages = doc.get("packages").unwrap().as_sequence().unwrap();
        assert_eq!(packages.len(), 3);

        let mut bare = CloudConfig::parse("#cloud-config\nruncmd: []\n").unwrap();
        bare.ensure_packages(&["ufw"]).unwrap();
        assert_eq!(bare.get("packages").unwrap().as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn prepend_deduplicates() {
        let mut doc = CloudConfig::parse(
            "#cloud-config\nssh_authorized_keys:\n  - ssh-ed25519 B old\n  - ssh-ed25519 A new\n\
             runcmd: []\n",
        )
        .unwrap();
        doc.prepend_authorized_key("ssh-ed25519 A new");
        assert_eq!(doc.authorized_keys(), ["ssh-ed25519 A new", "ssh-ed25519 B old"]);
    }
}
