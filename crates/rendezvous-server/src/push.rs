//! Push-notification adapter.
//!
//! Invoked after the storage commit, outside the registry lock. Delivery
//! is best effort: failures are logged and never fail the request.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::registry::PushTarget;

const REQUEST_TIMEOUT_SECS: u64 = 10;

pub struct PushGateway {
    client: Option<Client>,
    default_endpoint: String,
}

impl PushGateway {
    /// `default_endpoint` is the configured gateway, used for users whose
    /// record carries no notification server. Empty disables push.
    pub fn new(default_endpoint: String) -> Self {
        let client = match Client::builder()
            .user_agent("rendezvous-push/1.0")
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
        {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(error = %err, "failed to build push HTTP client; push disabled");
                None
            }
        };
        Self {
            client,
            default_endpoint,
        }
    }

    pub async fn dispatch(&self, targets: Vec<PushTarget>) {
        let Some(client) = &self.client else {
            return;
        };
        let mut seen = HashSet::new();
        for target in targets {
            if !seen.insert(target.device) {
                continue;
            }
            let endpoint = if target.endpoint.is_empty() {
                self.default_endpoint.as_str()
            } else {
                target.endpoint.as_str()
            };
            if endpoint.is_empty() {
                continue;
            }
            let body = serde_json::json!({
                "deviceToken": STANDARD.encode(&target.token),
            });
            match client.post(endpoint).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(device = %target.device.short(), "push delivered");
                }
                Ok(response) => {
                    warn!(
                        device = %target.device.short(),
                        status = response.status().as_u16(),
                        "push rejected"
                    );
                }
                Err(err) => {
                    warn!(device = %target.device.short(), error = %err, "push failed");
                }
            }
        }
    }
}
