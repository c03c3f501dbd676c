//! Typed Rust client for the DigitalOcean v2 API.
//!
//! Covers the subset needed for a single bootstrap host:
//! droplets, distribution images, cloud firewalls, reserved IPs and their
//! actions.

mod types;

pub use types::*;

const BASE_URL: &str = "https://api.digitalocean.com/v2";
const PAGE_SIZE: u32 = 200;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("digitalocean api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("digitalocean api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

impl Error {
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(status.as_u16()),
            Error::Request(e) => e.status().map(|s| s.as_u16()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// 409/422/423: the resource is locked or has a pending event.
    pub fn is_conflict(&self) -> bool {
        matches!(self.status(), Some(409 | 422 | 423))
    }

    /// Connection failures, rate limits and 5xx. Other 4xx are final.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Request(e) => !e.is_decode() && !e.is_builder(),
            Error::Api { status, .. } => status.as_u16() == 429 || status.is_server_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the DigitalOcean REST API.
#[derive(Clone)]
pub struct DoClient {
    token: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for DoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoClient").finish_non_exhaustive()
    }
}

impl DoClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{BASE_URL}{path}")
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(
        resp: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Droplets ─────────────────────────────────────────────────────

    pub async fn create_droplet(&self, req: &CreateDropletRequest) -> Result<Droplet> {
        let resp = self
            .http
            .post(self.url("/droplets"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        let env: DropletEnvelope = Self::check(resp, "create droplet").await?.json().await?;
        Ok(env.droplet)
    }

    pub async fn get_droplet(&self, droplet_id: u64) -> Result<Droplet> {
        let resp = self
            .http
            .get(self.url(&format!("/droplets/{droplet_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let env: DropletEnvelope = Self::check(resp, "get droplet").await?.json().await?;
        Ok(env.droplet)
    }

    /// Droplets carrying `tag`. Only the first page is read.
    pub async fn list_droplets_by_tag(&self, tag: &str) -> Result<Vec<Droplet>> {
        let per_page = PAGE_SIZE.to_string();
        let resp = self
            .http
            .get(self.url("/droplets"))
            .header("Authorization", self.auth())
            .query(&[("tag_name", tag), ("per_page", per_page.as_str())])
            .send()
            .await?;

        let env: DropletsEnvelope = Self::check(resp, "list droplets").await?.json().await?;
        Ok(env.droplets)
    }

    pub async fn delete_droplet(&self, droplet_id: u64) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/droplets/{droplet_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check_allow_404(resp, "delete droplet").await?;
        Ok(())
    }

    // ── Images ───────────────────────────────────────────────────────

    pub async fn list_distribution_images(&self) -> Result<Vec<Image>> {
        let per_page = PAGE_SIZE.to_string();
        let resp = self
            .http
            .get(self.url("/images"))
            .header("Authorization", self.auth())
            .query(&[("type", "distribution"), ("per_page", per_page.as_str())])
            .send()
            .await?;

        let env: ImagesEnvelope = Self::check(resp, "list images").await?.json().await?;
        Ok(env.images)
    }

    // ── Firewalls ────────────────────────────────────────────────────

    pub async fn list_firewalls(&self) -> Result<Vec<Firewall>> {
        let resp = self
            .http
            .get(self.url("/firewalls"))
            .header("Authorization", self.auth())
            .query(&[("per_page", PAGE_SIZE)])
            .send()
            .await?;

        let env: FirewallsEnvelope = Self::check(resp, "list firewalls").await?.json().await?;
        Ok(env.firewalls)
    }

    pub async fn create_firewall(&self, req: &CreateFirewallRequest) -> Result<Firewall> {
        let resp = self
            .http
            .post(self.url("/firewalls"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        let env: FirewallEnvelope = Self::check(resp, "create firewall").await?.json().await?;
        Ok(env.firewall)
    }

    pub async fn add_droplets_to_firewall(
        &self,
        firewall_id: &str,
        droplet_ids: &[u64],
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/firewalls/{firewall_id}/droplets")))
            .header("Authorization", self.auth())
            .json(&DropletIds { droplet_ids })
            .send()
            .await?;

        Self::check(resp, "attach firewall").await?;
        Ok(())
    }

    pub async fn delete_firewall(&self, firewall_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/firewalls/{firewall_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check_allow_404(resp, "delete firewall").await?;
        Ok(())
    }

    // ── Reserved IPs ─────────────────────────────────────────────────

    pub async fn create_reserved_ip(&self, region: &str) -> Result<ReservedIp> {
        let resp = self
            .http
            .post(self.url("/reserved_ips"))
            .header("Authorization", self.auth())
            .json(&CreateReservedIpRequest { region })
            .send()
            .await?;

        let env: ReservedIpEnvelope = Self::check(resp, "create reserved ip")
            .await?
            .json()
            .await?;
        Ok(env.reserved_ip)
    }

    pub async fn list_reserved_ips(&self) -> Result<Vec<ReservedIp>> {
        let resp = self
            .http
            .get(self.url("/reserved_ips"))
            .header("Authorization", self.auth())
            .query(&[("per_page", PAGE_SIZE)])
            .send()
            .await?;

        let env: ReservedIpsEnvelope = Self::check(resp, "list reserved ips")
            .await?
            .json()
            .await?;
        Ok(env.reserved_ips)
    }

    pub async fn assign_reserved_ip(&self, ip: &str, droplet_id: u64) -> Result<Action> {
        let action = ReservedIpAction {
            kind: "assign",
            droplet_id: Some(droplet_id),
        };
        self.reserved_ip_action(ip, action, "assign reserved ip").await
    }

    pub async fn unassign_reserved_ip(&self, ip: &str) -> Result<Action> {
        let action = ReservedIpAction {
            kind: "unassign",
            droplet_id: None,
        };
        self.reserved_ip_action(ip, action, "unassign reserved ip").await
    }

    async fn reserved_ip_action(
        &self,
        ip: &str,
        action: ReservedIpAction,
        endpoint: &'static str,
    ) -> Result<Action> {
        let resp = self
            .http
            .post(self.url(&format!("/reserved_ips/{ip}/actions")))
            .header("Authorization", self.auth())
            .json(&action)
            .send()
            .await?;

        let env: ActionEnvelope = Self::check(resp, endpoint).await?.json().await?;
        Ok(env.action)
    }

    pub async fn delete_reserved_ip(&self, ip: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/reserved_ips/{ip}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check_allow_404(resp, "delete reserved ip").await?;
        Ok(())
    }

    // ── Actions ──────────────────────────────────────────────────────

    pub async fn get_action(&self, action_id: u64) -> Result<Action> {
        let resp = self
            .http
            .get(self.url(&format!("/actions/{action_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let env: ActionEnvelope = Self::check(resp, "get action").await?.json().await?;
        Ok(env.action)
    }
}
