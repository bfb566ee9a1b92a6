//! JSON Schema generation for the flow types the builder UI exchanges.
//!
//! This module is only available when the `schemars` feature is enabled.

use schemars::{schema_for, JsonSchema};
use serde_json::Value;
use std::collections::BTreeMap;

/// Generate JSON Schema for a single type.
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).expect("schema serialization")
}

/// Generate all engine type schemas, keyed by type name.
pub fn all_schemas() -> BTreeMap<String, Value> {
    let mut schemas = BTreeMap::new();

    // types/flow.rs
    schemas.insert("AutomationFlow".into(), schema_of::<crate::AutomationFlow>());
    schemas.insert(
        "TriggerConditions".into(),
        schema_of::<crate::TriggerConditions>(),
    );
    schemas.insert("FlowSettings".into(), schema_of::<crate::FlowSettings>());
    schemas.insert("FlowDefinition".into(), schema_of::<crate::FlowDefinition>());
    schemas.insert("FlowNode".into(), schema_of::<crate::FlowNode>());
    schemas.insert("NodeData".into(), schema_of::<crate::NodeData>());
    schemas.insert("FlowConnection".into(), schema_of::<crate::FlowConnection>());

    // types/event.rs
    schemas.insert("SocialEvent".into(), schema_of::<crate::SocialEvent>());

    // types/run.rs
    schemas.insert("Run".into(), schema_of::<crate::Run>());
    schemas.insert("FlowStats".into(), schema_of::<crate::FlowStats>());
    schemas.insert(
        "TerminationReason".into(),
        schema_of::<crate::TerminationReason>(),
    );

    // ledger_event.rs
    schemas.insert("LedgerEvent".into(), schema_of::<crate::LedgerEvent>());

    schemas
}
