//! Condition node evaluation against a run's accumulated context.

use chrono::{DateTime, NaiveTime, Utc};

use crate::types::{ConditionType, Run};

/// Result of evaluating a condition node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionOutcome {
    pub matched: bool,
    /// The concrete value that matched, for keyword-like conditions. Edges
    /// labelled with this value take precedence over `matched` edges.
    pub value: Option<String>,
}

impl ConditionOutcome {
    fn hit(value: Option<String>) -> Self {
        Self {
            matched: true,
            value,
        }
    }

    fn miss() -> Self {
        Self {
            matched: false,
            value: None,
        }
    }

    /// `matched` or `unmatched`.
    pub fn label(&self) -> &'static str {
        if self.matched {
            "matched"
        } else {
            "unmatched"
        }
    }
}

pub fn evaluate(
    condition_type: ConditionType,
    condition_value: &str,
    run: &Run,
    now: DateTime<Utc>,
) -> ConditionOutcome {
    match condition_type {
        ConditionType::Keyword => first_contained(condition_value, &run.event.content),
        ConditionType::UserResponse => match run.responses.last() {
            None => ConditionOutcome::miss(),
            Some(reply) if values(condition_value).is_empty() => {
                ConditionOutcome::hit(Some(reply.trim().to_string()))
            }
            Some(reply) => first_contained(condition_value, reply),
        },
        ConditionType::TagBased => {
            let applied: Vec<String> = run.applied_tags().iter().map(|t| t.to_lowercase()).collect();
            values(condition_value)
                .into_iter()
                .find(|v| applied.contains(v))
                .map(|v| ConditionOutcome::hit(Some(v)))
                .unwrap_or_else(ConditionOutcome::miss)
        }
        ConditionType::TimeBased => match parse_window(condition_value) {
            Some((start, end)) => {
                let t = now.time();
                let inside = if start <= end {
                    start == end || (t >= start && t < end)
                } else {
                    t >= start || t < end
                };
                if inside {
                    ConditionOutcome::hit(None)
                } else {
                    ConditionOutcome::miss()
                }
            }
            None => {
                tracing::warn!(
                    run_id = %run.id,
                    window = %condition_value,
                    "unparseable time window, treating condition as unmatched"
                );
                ConditionOutcome::miss()
            }
        },
    }
}

/// Comma-separated, trimmed, lowercased, non-empty values.
fn values(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn first_contained(raw: &str, text: &str) -> ConditionOutcome {
    let text = text.trim().to_lowercase();
    values(raw)
        .into_iter()
        .find(|v| text.contains(v.as_str()))
        .map(|v| ConditionOutcome::hit(Some(v)))
        .unwrap_or_else(ConditionOutcome::miss)
}

/// `HH:MM-HH:MM`, UTC.
fn parse_window(raw: &str) -> Option<(NaiveTime, NaiveTime)> {
    let (start, end) = raw.split_once('-')?;
    let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
    let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
    Some((start, end))
}
