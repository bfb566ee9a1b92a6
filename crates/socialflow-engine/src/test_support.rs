//! Fixtures and a recording adapter for engine tests.
//!
//! ```ignore
//! let adapter = RecordingAdapter::new();
//! adapter.fail(NodeKind::Message, Fault::Reject);
//! let engine = Engine::builder().in_memory().adapters(adapter.adapters()).build().await?;
//!
//! engine.handle_event(event).await?;
//!
//! assert_eq!(adapter.calls_of(NodeKind::Resource).len(), 1);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use crate::errors::AdapterError;
use crate::executor::ActionAdapters;
use crate::traits::{MessageAdapter, ResourceAdapter, ResourceRef, TagAdapter, WebhookAdapter};
use crate::types::*;

// -- Fixtures ---------------------------------------------------------------

/// Inactive keyword flow on Instagram: "guide" sends a welcome message, a
/// link to the guide and tags the contact.
///
/// ```text
/// trigger -> welcome (message) -> guide (resource) -> tag (tag)
/// ```
pub fn guide_flow() -> AutomationFlow {
    let definition = FlowDefinition {
        nodes: vec![
            FlowNode::new("trigger", NodeData::Trigger),
            FlowNode::new(
                "welcome",
                NodeData::Message {
                    content: "Thanks {{username}}! Here is your guide.".into(),
                    media: vec![],
                },
            ),
            FlowNode::new(
                "guide",
                NodeData::Resource {
                    resource_type: ResourceType::Link,
                    locator: "https://example.com/guide.pdf".into(),
                },
            ),
            FlowNode::new(
                "tag",
                NodeData::Tag {
                    tag_name: "guide-lead".into(),
                },
            ),
        ],
        connections: vec![
            FlowConnection::new("e1", "trigger", "welcome"),
            FlowConnection::new("e2", "welcome", "guide"),
            FlowConnection::new("e3", "guide", "tag"),
        ],
    };
    AutomationFlow::new(
        "store-1",
        "Guide giveaway",
        TriggerType::Keyword,
        TriggerConditions::new([Platform::Instagram]).keywords(MatchType::Contains, ["guide"]),
        definition,
    )
    .with_id("flow-guide")
}

/// A running run of [`guide_flow`] for an Instagram contact with no
/// username, at the first node after the trigger.
pub fn sample_run(run_id: &str, flow_id: &str, platform_user_id: &str) -> Run {
    let mut flow = guide_flow();
    flow.id = flow_id.to_string();
    let now = Utc::now();
    Run {
        id: run_id.to_string(),
        flow_id: flow_id.to_string(),
        snapshot: FlowSnapshot::capture(&flow),
        event: SocialEvent::new(Platform::Instagram, platform_user_id, "guide"),
        origin: RunOrigin::Event,
        status: RunStatus::Running,
        current_node: Some("welcome".into()),
        pending: vec!["welcome".into()],
        resume_at: None,
        deadline: None,
        trail: vec![],
        responses: vec![],
        termination: None,
        suppressed_events: 0,
        claim: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
        last_seq: 0,
    }
}

// -- Recording adapter ------------------------------------------------------

/// A call received by [`RecordingAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    Message {
        account_id: Option<String>,
        recipient: Recipient,
        content: String,
        media: Vec<String>,
    },
    Webhook {
        url: String,
        payload: Value,
    },
    Resource {
        recipient: Recipient,
        resource: ResourceRef,
    },
    Tag {
        recipient: Recipient,
        tag: String,
    },
}

impl AdapterCall {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Message { .. } => NodeKind::Message,
            Self::Webhook { .. } => NodeKind::Webhook,
            Self::Resource { .. } => NodeKind::Resource,
            Self::Tag { .. } => NodeKind::Tag,
        }
    }
}

/// How an injected adapter failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Return [`AdapterError::Rejected`].
    Reject,
    /// Panic inside the adapter.
    Panic,
    /// Never return.
    Hang,
}

/// Implements every action adapter, records each call, and fails calls of
/// the node kinds it was told to fail.
#[derive(Default)]
pub struct RecordingAdapter {
    calls: RwLock<Vec<AdapterCall>>,
    faults: RwLock<HashMap<NodeKind, Fault>>,
}

impl RecordingAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All four adapter slots backed by this recorder.
    pub fn adapters(self: &Arc<Self>) -> ActionAdapters {
        ActionAdapters {
            message: self.clone(),
            webhook: self.clone(),
            resource: self.clone(),
            tag: self.clone(),
        }
    }

    pub fn fail(&self, kind: NodeKind, fault: Fault) {
        self.faults.write().insert(kind, fault);
    }

    pub fn heal(&self, kind: NodeKind) {
        self.faults.write().remove(&kind);
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.read().clone()
    }

    pub fn calls_of(&self, kind: NodeKind) -> Vec<AdapterCall> {
        self.calls
            .read()
            .iter()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    async fn record(&self, call: AdapterCall) -> Result<(), AdapterError> {
        let kind = call.kind();
        self.calls.write().push(call);
        let fault = self.faults.read().get(&kind).copied();
        match fault {
            None => Ok(()),
            Some(Fault::Reject) => Err(AdapterError::Rejected {
                message: format!("{kind} refused"),
            }),
            Some(Fault::Panic) => panic!("{kind} adapter exploded"),
            Some(Fault::Hang) => std::future::pending().await,
        }
    }
}

#[async_trait]
impl MessageAdapter for RecordingAdapter {
    async fn send_message(
        &self,
        account_id: Option<&str>,
        recipient: &Recipient,
        content: &str,
        media: &[String],
    ) -> Result<(), AdapterError> {
        self.record(AdapterCall::Message {
            account_id: account_id.map(str::to_string),
            recipient: recipient.clone(),
            content: content.to_string(),
            media: media.to_vec(),
        })
        .await
    }
}

#[async_trait]
impl WebhookAdapter for RecordingAdapter {
    async fn call_webhook(&self, url: &str, payload: &Value) -> Result<(), AdapterError> {
        self.record(AdapterCall::Webhook {
            url: url.to_string(),
            payload: payload.clone(),
        })
        .await
    }
}

#[async_trait]
impl ResourceAdapter for RecordingAdapter {
    async fn deliver_resource(
        &self,
        recipient: &Recipient,
        resource: &ResourceRef,
    ) -> Result<(), AdapterError> {
        self.record(AdapterCall::Resource {
            recipient: recipient.clone(),
            resource: resource.clone(),
        })
        .await
    }
}

#[async_trait]
impl TagAdapter for RecordingAdapter {
    async fn tag_contact(&self, recipient: &Recipient, tag: &str) -> Result<(), AdapterError> {
        self.record(AdapterCall::Tag {
            recipient: recipient.clone(),
            tag: tag.to_string(),
        })
        .await
    }
}
