//! Blocking HTTP client for the elrond server API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use elrond_core::model::{
    CreateRingRequest, CreateWebhookRequest, RegisterInstallationGroupRequest, Ring,
    RingRelease, RingReleaseRequest, UpdateRingRequest, Webhook,
};

/// Client for one elrond server address.
pub struct Client {
    address: String,
    http: reqwest::blocking::Client,
}

impl Client {
    /// Creates a client for the server at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying HTTP client cannot be
    /// constructed.
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            address: address.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.address.trim_end_matches('/'))
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)).send()?;
        Self::parse(response)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: Option<&B>) -> Result<T> {
        let mut request = self.http.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        Self::parse(request.send()?)
    }

    fn post_no_response<B: Serialize>(&self, path: &str, body: Option<&B>) -> Result<()> {
        let mut request = self.http.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        Self::check(request.send()?)
    }

    fn delete(&self, path: &str) -> Result<()> {
        Self::check(self.http.delete(self.url(path)).send()?)
    }

    fn parse<T: DeserializeOwned>(response: reqwest::blocking::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("server returned {status}: {body}");
        }
        response.json().context("failed to decode server response")
    }

    fn check(response: reqwest::blocking::Response) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("server returned {status}: {body}");
        }
        Ok(())
    }

    pub fn create_ring(&self, request: &CreateRingRequest) -> Result<Ring> {
        self.post("/api/rings", Some(request))
    }

    pub fn retry_create_ring(&self, ring_id: &str) -> Result<Ring> {
        self.post::<(), _>(&format!("/api/ring/{ring_id}"), None)
    }

    pub fn update_ring(&self, ring_id: &str, request: &UpdateRingRequest) -> Result<Ring> {
        self.post(&format!("/api/ring/{ring_id}/update"), Some(request))
    }

    pub fn release_ring(&self, ring_id: &str, request: &RingReleaseRequest) -> Result<Ring> {
        self.post(&format!("/api/ring/{ring_id}/release"), Some(request))
    }

    pub fn release_all_rings(&self, request: &RingReleaseRequest) -> Result<Vec<Ring>> {
        self.post("/api/rings/release", Some(request))
    }

    pub fn pause_release(&self) -> Result<()> {
        self.post_no_response::<()>("/api/rings/release/pause", None)
    }

    pub fn resume_release(&self) -> Result<()> {
        self.post_no_response::<()>("/api/rings/release/resume", None)
    }

    pub fn cancel_release(&self) -> Result<()> {
        self.post_no_response::<()>("/api/rings/release/cancel", None)
    }

    pub fn get_ring(&self, ring_id: &str) -> Result<Ring> {
        self.get(&format!("/api/ring/{ring_id}"))
    }

    pub fn get_rings(&self, page: i64, per_page: i64, include_deleted: bool) -> Result<Vec<Ring>> {
        self.get(&format!(
            "/api/rings?page={page}&per_page={per_page}&include_deleted={include_deleted}"
        ))
    }

    pub fn get_release(&self, release_id: &str) -> Result<RingRelease> {
        self.get(&format!("/api/release/{release_id}"))
    }

    pub fn delete_ring(&self, ring_id: &str) -> Result<()> {
        self.delete(&format!("/api/ring/{ring_id}"))
    }

    pub fn register_installation_group(
        &self,
        ring_id: &str,
        request: &RegisterInstallationGroupRequest,
    ) -> Result<Ring> {
        self.post(&format!("/api/ring/{ring_id}/installationgroup"), Some(request))
    }

    pub fn delete_installation_group(&self, ring_id: &str, group_id: &str) -> Result<()> {
        self.delete(&format!("/api/ring/{ring_id}/installationgroup/{group_id}"))
    }

    pub fn create_webhook(&self, request: &CreateWebhookRequest) -> Result<Webhook> {
        self.post("/api/webhooks", Some(request))
    }

    pub fn get_webhook(&self, webhook_id: &str) -> Result<Webhook> {
        self.get(&format!("/api/webhook/{webhook_id}"))
    }

    pub fn get_webhooks(&self, page: i64, per_page: i64) -> Result<Vec<Webhook>> {
        self.get(&format!("/api/webhooks?page={page}&per_page={per_page}"))
    }

    pub fn delete_webhook(&self, webhook_id: &str) -> Result<()> {
        self.delete(&format!("/api/webhook/{webhook_id}"))
    }

    pub fn lock_ring_api(&self, ring_id: &str) -> Result<()> {
        self.post_no_response::<()>(&format!("/api/security/ring/{ring_id}/api/lock"), None)
    }

    pub fn unlock_ring_api(&self, ring_id: &str) -> Result<()> {
        self.post_no_response::<()>(&format!("/api/security/ring/{ring_id}/api/unlock"), None)
    }
}
