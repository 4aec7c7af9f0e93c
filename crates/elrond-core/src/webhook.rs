//! Webhook fan-out.
//!
//! State transitions are committed to the store before delivery is
//! attempted, so receivers never observe a state that is not durable.
//! Delivery is fire-and-forget: each hook gets its own detached task
//! with a short timeout, failures are logged, and nothing is awaited
//! under a row lock. Exactly-once delivery is not guaranteed.

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::model::{Webhook, WebhookFilter, WebhookPayload};
use crate::store::Store;

/// Per-delivery HTTP timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends transition payloads to every registered webhook.
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
}

impl WebhookSender {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Queues the payload for delivery to all live webhooks. Store
    /// failures fetching the hook list are logged, not propagated.
    pub fn send_to_all(&self, store: &Store, payload: &WebhookPayload) {
        let hooks = match store.get_webhooks(&WebhookFilter::all()) {
            Ok(hooks) => hooks,
            Err(err) => {
                error!(error = %err, "failed to find webhooks");
                return;
            }
        };
        if hooks.is_empty() {
            return;
        }

        debug!(count = hooks.len(), "sending webhooks");
        for hook in hooks {
            self.spawn_delivery(hook, payload.clone());
        }
    }

    fn spawn_delivery(&self, hook: Webhook, payload: WebhookPayload) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client.post(&hook.url).json(&payload).send().await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    warn!(
                        webhook_url = %hook.url,
                        status = %response.status(),
                        "webhook delivery rejected"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(webhook_url = %hook.url, error = %err, "unable to send webhook");
                }
            }
        });
    }
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}
