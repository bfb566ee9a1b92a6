//! Default action adapters.
//!
//! [`LoggingAdapter`] performs no side effects and is what a freshly built
//! engine uses until the host wires in real platform clients.
//! [`HttpWebhookAdapter`] POSTs webhook payloads with `reqwest`.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::AdapterError;
use crate::traits::{MessageAdapter, ResourceAdapter, ResourceRef, TagAdapter, WebhookAdapter};
use crate::types::Recipient;

/// Logs every action at `info` and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAdapter;

#[async_trait]
impl MessageAdapter for LoggingAdapter {
    async fn send_message(
        &self,
        account_id: Option<&str>,
        recipient: &Recipient,
        content: &str,
        media: &[String],
    ) -> Result<(), AdapterError> {
        tracing::info!(
            account_id = account_id.unwrap_or(""),
            recipient = %recipient,
            chars = content.chars().count(),
            media = media.len(),
            "send_message"
        );
        Ok(())
    }
}

#[async_trait]
impl WebhookAdapter for LoggingAdapter {
    async fn call_webhook(&self, url: &str, _payload: &Value) -> Result<(), AdapterError> {
        tracing::info!(url, "call_webhook");
        Ok(())
    }
}

#[async_trait]
impl ResourceAdapter for LoggingAdapter {
    async fn deliver_resource(
        &self,
        recipient: &Recipient,
        resource: &ResourceRef,
    ) -> Result<(), AdapterError> {
        tracing::info!(
            recipient = %recipient,
            resource_type = ?resource.resource_type,
            locator = %resource.locator,
            "deliver_resource"
        );
        Ok(())
    }
}

#[async_trait]
impl TagAdapter for LoggingAdapter {
    async fn tag_contact(&self, recipient: &Recipient, tag: &str) -> Result<(), AdapterError> {
        tracing::info!(recipient = %recipient, tag, "tag_contact");
        Ok(())
    }
}

/// POSTs the rendered payload as JSON. 2xx is success, any other status is
/// a rejection and a failed send is a transport error.
#[derive(Debug, Clone, Default)]
pub struct HttpWebhookAdapter {
    client: reqwest::Client,
}

impl HttpWebhookAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookAdapter for HttpWebhookAdapter {
    async fn call_webhook(&self, url: &str, payload: &Value) -> Result<(), AdapterError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AdapterError::Transport {
                message: format!("webhook request failed: {e}"),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AdapterError::Rejected {
                message: format!("HTTP {status}"),
            })
        }
    }
}
