//! Socialflow engine: trigger matching and graph execution for social-media
//! automation flows.
//!
//! A storefront owner defines an [`AutomationFlow`]: trigger conditions over
//! inbound comments, DMs, mentions and hashtags on their connected accounts,
//! plus a graph of typed action nodes (message, delay, condition, resource,
//! tag, webhook). For every matching [`SocialEvent`] the engine creates a
//! [`Run`] and walks the graph exactly once, calling out to the host's
//! action adapters.
//!
//! Runs are event-sourced. The [`RunStore`] persists [`LedgerEvent`]s and
//! serves runs and per-flow [`FlowStats`] as projections, so the counters
//! cached on a flow can always be rebuilt from history. Delays are persisted
//! resume times picked up by the [`ResumeScheduler`], never in-memory sleeps.
//!
//! The crate has no web server, database or platform client of its own; the
//! surrounding application supplies those through the traits in [`traits`].
#[cfg(feature = "schemars")]
pub mod schema;

pub mod config;
pub mod defaults;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod ledger_event;
pub(crate) mod locks;
pub mod snapshot;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod traits;
pub mod triggers;
pub mod types;
pub mod validate;

// Re-export public types at the crate level.

// config
pub use config::{EngineConfig, UnmatchedBranchPolicy};

// defaults
pub use defaults::{
    FileFlowStore, FileRunStore, HttpWebhookAdapter, InMemoryFlowStore, InMemoryRunStore,
    LoggingAdapter, ManualClock, OpenAccountRegistry, StaticAccountRegistry, SystemClock,
};

// engine
pub use engine::{Engine, EngineBuilder, EngineError};

// errors
pub use errors::{AdapterError, FlowStoreError, MatchError, RunStoreError, ValidationError};

// executor
pub use executor::{ActionAdapters, Executor, ExecutorError, StartOutcome};

// graph
pub use graph::FlowGraph;

// ledger_event
pub use ledger_event::LedgerEvent;

// snapshot
pub use snapshot::compute_definition_hash;

// traits
pub use traits::{
    AccountRegistry, Clock, FlowStore, MessageAdapter, ResourceAdapter, ResourceRef, RunFilter,
    RunPage, RunStore, TagAdapter, WebhookAdapter,
};

// triggers
pub use triggers::{MatchDecision, MatchedFlow, ResumeScheduler, TriggerMatcher};

// types
pub use types::{
    AutomationFlow, ConditionType, FlowConnection, FlowDefinition, FlowNode, FlowSettings,
    FlowSnapshot, FlowStats, MatchType, NodeData, NodeKind, Platform, Recipient, ResourceType,
    Run, RunOrigin, RunStatus, SocialEvent, StepClaim, StepOutcome, TerminationReason,
    TrailEntry, TriggerConditions, TriggerType, LEDGER_SCHEMA_VERSION,
};

// validate
pub use validate::{validate_definition, validate_flow};
