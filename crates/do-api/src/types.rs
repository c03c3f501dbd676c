use serde::{Deserialize, Serialize};

// ── Droplet types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateDropletRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    /// Image slug, or numeric id when the image has no slug.
    pub image: serde_json::Value,
    pub user_data: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub ipv6: bool,
    pub monitoring: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    /// `new`, `active`, `off` or `archive`.
    pub status: String,
    pub created_at: String,
    #[serde(default)]
    pub networks: Networks,
    #[serde(default)]
    pub tags: Vec<String>,
    pub region: Option<RegionRef>,
}

impl Droplet {
    pub fn public_ipv4(&self) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkAddress>,
    #[serde(default)]
    pub v6: Vec<NetworkAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkAddress {
    pub ip_address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionRef {
    pub slug: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DropletEnvelope {
    pub droplet: Droplet,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DropletsEnvelope {
    pub droplets: Vec<Droplet>,
}

// ── Image types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: u64,
    pub name: String,
    pub distribution: String,
    pub slug: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub regions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImagesEnvelope {
    pub images: Vec<Image>,
}

// ── Firewall types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRule {
    pub protocol: String,
    pub ports: String,
    pub sources: Addresses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRule {
    pub protocol: String,
    pub ports: String,
    pub destinations: Addresses,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Addresses {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateFirewallRequest {
    pub name: String,
    pub inbound_rules: Vec<InboundRule>,
    pub outbound_rules: Vec<OutboundRule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub droplet_ids: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Firewall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub droplet_ids: Vec<u64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DropletIds<'a> {
    pub droplet_ids: &'a [u64],
}

#[derive(Debug, Deserialize)]
pub(crate) struct FirewallEnvelope {
    pub firewall: Firewall,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FirewallsEnvelope {
    pub firewalls: Vec<Firewall>,
}

// ── Reserved IP types ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ReservedIp {
    pub ip: String,
    pub droplet: Option<DropletRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DropletRef {
    pub id: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateReservedIpRequest<'a> {
    pub region: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReservedIpAction {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub droplet_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReservedIpEnvelope {
    pub reserved_ip: ReservedIp,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReservedIpsEnvelope {
    pub reserved_ips: Vec<ReservedIp>,
}

// ── Action types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    pub id: u64,
    /// `in-progress`, `completed` or `errored`.
    pub status: String,
}

impl Action {
    pub fn is_done(&self) -> bool {
        self.status == "completed"
    }

    pub fn is_errored(&self) -> bool {
        self.status == "errored"
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ActionEnvelope {
    pub action: Action,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn droplet_public_address_skips_private_network() {
        let json = r#"{
            "droplet": {
                "id": 3164444,
                "name": "moat-1",
                "status": "active",
                "created_at": "2026-01-10T12:00:00Z",
                "networks": {
                    "v4": [
                        {"ip_address": "10.128.0.2", "netmask": "255.255.0.0", "type": "private"},
                        {"ip_address": "203.0.113.9", "netmask": "255.255.240.0", "type": "public"}
                    ],
                    "v6": []
                },
                "tags": ["moat"],
                "region": {"slug": "fra1", "name": "Frankfurt 1"}
            }
        }"#;
        let env: DropletEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.droplet.public_ipv4(), Some("203.0.113.9"));
        assert_eq!(env.droplet.region.unwrap().slug, "fra1");
    }

    #[test]
    fn new_droplet_has_no_address_yet() {
        let json = r#"{"droplet": {"id": 1, "name": "x", "status": "new",
            "created_at": "2026-01-10T12:00:00Z", "networks": {}, "region": null}}"#;
        let env: DropletEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.droplet.public_ipv4(), None);
        assert!(env.droplet.tags.is_empty());
    }

    #[test]
    fn firewall_request_omits_empty_lists() {
        let req = CreateFirewallRequest {
            name: "moat-1-fw".into(),
            inbound_rules: vec![InboundRule {
                protocol: "tcp".into(),
                ports: "22".into(),
                sources: Addresses {
                    addresses: vec!["0.0.0.0/0".into()],
                },
            }],
            outbound_rules: vec![],
            droplet_ids: vec![],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("droplet_ids").is_none());
        assert_eq!(json["inbound_rules"][0]["sources"]["addresses"][0], "0.0.0.0/0");
    }
}
