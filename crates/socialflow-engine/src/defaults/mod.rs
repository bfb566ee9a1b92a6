//! Default implementations for the engine's pluggable traits.
//!
//! These defaults allow the engine to start with zero external configuration.
//! Each can be replaced via the [`EngineBuilder`](crate::EngineBuilder).

pub mod accounts;
pub mod adapters;
pub mod clock;
pub mod file_flow_store;
pub mod file_run_store;
pub mod in_memory_flow_store;
pub mod in_memory_run_store;
pub mod reconstruct;
pub use accounts::{OpenAccountRegistry, StaticAccountRegistry};
pub use adapters::{HttpWebhookAdapter, LoggingAdapter};
pub use clock::{ManualClock, SystemClock};
pub use file_flow_store::FileFlowStore;
pub use file_run_store::FileRunStore;
pub use in_memory_flow_store::InMemoryFlowStore;
pub use in_memory_run_store::InMemoryRunStore;
