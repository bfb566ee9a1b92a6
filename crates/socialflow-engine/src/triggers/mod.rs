//! Deciding when runs start and when they continue.
//!
//! The [`TriggerMatcher`] resolves an inbound social event to the active
//! flows it starts. The [`ResumeScheduler`] picks delayed and interrupted
//! runs back up once they are due.

mod matcher;
mod scheduler;

pub use matcher::{MatchDecision, MatchedFlow, TriggerMatcher};
pub use scheduler::ResumeScheduler;
