//! Flow schema types: the contract between the flow builder and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::Platform;

/// A user-defined automation: trigger conditions plus a graph of action nodes.
///
/// `total_triggers`, `total_completions` and `last_triggered` are caches of
/// the run ledger. They are rewritten from [`FlowStats`](super::FlowStats)
/// after every run creation and completion and can be rebuilt at any time
/// with [`Engine::recompute_counters`](crate::Engine::recompute_counters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct AutomationFlow {
    pub id: String,
    /// Owning storefront.
    pub store_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Inactive flows never match new events.
    #[serde(default)]
    pub is_active: bool,
    pub trigger_type: TriggerType,
    pub trigger_conditions: TriggerConditions,
    pub flow_definition: FlowDefinition,
    #[serde(default)]
    pub settings: FlowSettings,
    #[serde(default)]
    pub total_triggers: u64,
    #[serde(default)]
    pub total_completions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationFlow {
    /// A new, inactive flow with a random id and zeroed counters.
    pub fn new(
        store_id: impl Into<String>,
        name: impl Into<String>,
        trigger_type: TriggerType,
        trigger_conditions: TriggerConditions,
        flow_definition: FlowDefinition,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            store_id: store_id.into(),
            name: name.into(),
            description: None,
            is_active: false,
            trigger_type,
            trigger_conditions,
            flow_definition,
            settings: FlowSettings::default(),
            total_triggers: 0,
            total_completions: 0,
            last_triggered: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn activated(mut self) -> Self {
        self.is_active = true;
        self
    }
}

/// What kind of social activity starts the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Keyword,
    Comment,
    Dm,
    Mention,
    Hashtag,
    /// Only started through the owner's test trigger.
    Manual,
}

/// How keywords are compared against event content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    #[default]
    Contains,
    StartsWith,
    /// Each keyword is a regular expression.
    Regex,
}

/// The platform/keyword rule that decides whether an event starts a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct TriggerConditions {
    /// Ordered; only consulted for [`TriggerType::Keyword`].
    #[serde(default)]
    pub keywords: Vec<String>,
    pub platforms: BTreeSet<Platform>,
    #[serde(default)]
    pub match_type: MatchType,
    /// When set, only events received on these connected accounts match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_ids: Option<BTreeSet<String>>,
}

impl TriggerConditions {
    pub fn new(platforms: impl IntoIterator<Item = Platform>) -> Self {
        Self {
            keywords: Vec::new(),
            platforms: platforms.into_iter().collect(),
            match_type: MatchType::default(),
            account_ids: None,
        }
    }

    pub fn keywords<I, S>(mut self, match_type: MatchType, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.match_type = match_type;
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn accounts<I, S>(mut self, account_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.account_ids = Some(account_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Structural problems that prevent activation.
    pub fn problems(&self, trigger_type: TriggerType) -> Vec<String> {
        let mut problems = Vec::new();
        if self.platforms.is_empty() {
            problems.push("Trigger conditions list no platforms".to_string());
        }
        if trigger_type == TriggerType::Keyword {
            if self.keywords.iter().all(|k| k.trim().is_empty()) {
                problems.push("Keyword trigger has no keywords".to_string());
            }
            if self.match_type == MatchType::Regex {
                for pattern in &self.keywords {
                    if let Err(e) = regex::Regex::new(pattern) {
                        problems.push(format!("Invalid regex keyword '{pattern}': {e}"));
                    }
                }
            }
        }
        problems
    }
}

/// Per-flow execution policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct FlowSettings {
    /// Fail the run on the first adapter error or unmatched condition branch.
    #[serde(default)]
    pub stop_on_error: bool,
    /// When false, a contact with a live run of this flow cannot start another.
    #[serde(default)]
    pub allow_multiple_runs: bool,
    /// Measured from run creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Nodes and directed connections of a flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct FlowDefinition {
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub connections: Vec<FlowConnection>,
}

impl FlowDefinition {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The first trigger node, if any. Validation guarantees exactly one.
    pub fn trigger_node(&self) -> Option<&FlowNode> {
        self.nodes
            .iter()
            .find(|n| matches!(n.data, NodeData::Trigger))
    }
}

/// A typed step in a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct FlowNode {
    pub id: String,
    /// Canvas position. Never read by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<(f64, f64)>,
    pub data: NodeData,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, data: NodeData) -> Self {
        Self {
            id: id.into(),
            position: None,
            data,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.data.kind()
    }
}

/// Node payload, one variant per node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NodeData {
    Trigger,
    Message {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        media: Vec<String>,
    },
    Delay {
        delay_minutes: u32,
    },
    Condition {
        condition_type: ConditionType,
        #[serde(default)]
        condition_value: String,
    },
    Resource {
        resource_type: ResourceType,
        /// URL for links and files, internal id for courses and products.
        locator: String,
    },
    Tag {
        tag_name: String,
    },
    Webhook {
        url: String,
        /// String leaves are rendered with the event placeholders.
        #[serde(default)]
        payload_template: serde_json::Value,
    },
}

impl NodeData {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Trigger => NodeKind::Trigger,
            Self::Message { .. } => NodeKind::Message,
            Self::Delay { .. } => NodeKind::Delay,
            Self::Condition { .. } => NodeKind::Condition,
            Self::Resource { .. } => NodeKind::Resource,
            Self::Tag { .. } => NodeKind::Tag,
            Self::Webhook { .. } => NodeKind::Webhook,
        }
    }
}

/// Fieldless discriminant of [`NodeData`], used in run trails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Message,
    Delay,
    Condition,
    Resource,
    Tag,
    Webhook,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trigger => "trigger",
            Self::Message => "message",
            Self::Delay => "delay",
            Self::Condition => "condition",
            Self::Resource => "resource",
            Self::Tag => "tag",
            Self::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// Event content contains one of the comma-separated values.
    Keyword,
    /// The latest recorded reply contains one of the values.
    UserResponse,
    /// Current UTC time falls in an `HH:MM-HH:MM` window.
    TimeBased,
    /// The contact was tagged earlier in this run.
    TagBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Link,
    File,
    Course,
    Product,
}

/// A directed edge. `label` selects a branch out of condition nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct FlowConnection {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl FlowConnection {
    pub fn new(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            label: None,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
