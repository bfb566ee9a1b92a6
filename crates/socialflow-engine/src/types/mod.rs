//! Foundational types for the automation engine.
//!
//! Every persisted type here is `Serialize + Deserialize + Debug + Clone`.
//! Set and map fields use `BTreeSet`/`BTreeMap` so serialized flows and
//! ledger lines are byte-stable, which the snapshot hash relies on.
//!
//! Enums use `#[non_exhaustive]` where new variants are expected (platforms,
//! ledger-facing statuses).

pub mod event;
pub mod flow;
pub mod run;

pub use event::*;
pub use flow::*;
pub use run::*;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Current schema version for [`LedgerEvent`](crate::ledger_event::LedgerEvent)
/// serialization.
pub const LEDGER_SCHEMA_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Platforms
// ---------------------------------------------------------------------------

/// Social platforms the engine can receive events from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Platform {
    Instagram,
    Facebook,
    Twitter,
    Tiktok,
    Linkedin,
    Youtube,
    Threads,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instagram => "instagram",
            Self::Facebook => "facebook",
            Self::Twitter => "twitter",
            Self::Tiktok => "tiktok",
            Self::Linkedin => "linkedin",
            Self::Youtube => "youtube",
            Self::Threads => "threads",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
