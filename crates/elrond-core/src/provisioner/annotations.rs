//! Grafana-style release annotations.
//!
//! Annotations mark release milestones on dashboards. The sink is
//! best-effort: failures are logged and never fail the release.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::model::{now_ns, InstallationGroup, Ring, RingRelease};

#[derive(Debug, Serialize)]
struct AnnotationRequest {
    text: String,
    tags: Vec<String>,
    /// Milliseconds since the Unix epoch.
    time: i64,
}

/// Posts release annotations to zero or more Grafana organizations.
pub struct AnnotationSink {
    grafana_url: Option<String>,
    tokens: Vec<String>,
    client: reqwest::Client,
}

impl AnnotationSink {
    /// Creates a sink for the given Grafana URL and API tokens. A sink
    /// without a URL or without tokens is a no-op.
    #[must_use]
    pub fn new(grafana_url: Option<String>, tokens: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            grafana_url,
            tokens,
            client,
        }
    }

    /// A sink that never posts anywhere.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(None, Vec::new())
    }

    /// Posts `text` tagged with the ring, group, and release identity.
    /// Failures are logged and swallowed.
    pub async fn annotate(
        &self,
        text: &str,
        ring: &Ring,
        group: &InstallationGroup,
        release: &RingRelease,
    ) {
        let Some(url) = &self.grafana_url else {
            return;
        };
        if self.tokens.is_empty() {
            return;
        }

        let request = AnnotationRequest {
            text: text.to_string(),
            tags: vec![
                format!("ring:{}", ring.name),
                format!("installation-group:{}", group.provisioner_group_id),
                format!("image:{}", release.image),
                format!("version:{}", release.version),
                "elrond".to_string(),
            ],
            time: now_ns() / 1_000_000,
        };

        let endpoint = format!("{}/api/annotations", url.trim_end_matches('/'));
        for token in &self.tokens {
            let result = self
                .client
                .post(&endpoint)
                .bearer_auth(token)
                .json(&request)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    info!(installation_group = %group.id, "annotation created");
                }
                Ok(response) => {
                    warn!(
                        status = %response.status(),
                        installation_group = %group.id,
                        "failed to create annotation"
                    );
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        installation_group = %group.id,
                        "failed to create annotation"
                    );
                }
            }
        }
    }
}
