//! Decides which active flows an inbound social event starts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};

use crate::errors::MatchError;
use crate::types::{AutomationFlow, MatchType, SocialEvent, TriggerType};

/// A flow selected for an event.
#[derive(Debug, Clone)]
pub struct MatchedFlow {
    pub flow: AutomationFlow,
    /// The keyword (or pattern) that matched, for keyword flows.
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchDecision {
    Match { keyword: Option<String> },
    NoMatch,
}

/// Upper bound on cached compiled patterns across all flows.
pub const DEFAULT_MAX_CACHED_PATTERNS: usize = 1024;

/// Pure trigger evaluation with a cache of compiled keyword patterns.
///
/// Keyword comparison trims the event content and ignores case for every
/// match type, regex included. The cache never changes a result: a
/// pattern that fails to compile is not cached and fails again next time.
///
/// Patterns are cached per flow. The engine calls [`forget_flow`] when a
/// flow is updated, deactivated or deleted, and the cache is emptied
/// whenever it would grow past its limit.
///
/// [`forget_flow`]: TriggerMatcher::forget_flow
pub struct TriggerMatcher {
    /// flow id -> pattern -> compiled regex
    patterns: RwLock<HashMap<String, HashMap<String, Arc<Regex>>>>,
    max_patterns: usize,
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_CACHED_PATTERNS)
    }
}

impl TriggerMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_patterns: usize) -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
            max_patterns: max_patterns.max(1),
        }
    }

    /// Every flow in `flows` that `event` starts, in input order. Flows with
    /// an invalid pattern are logged and skipped.
    pub fn match_event(&self, event: &SocialEvent, flows: &[AutomationFlow]) -> Vec<MatchedFlow> {
        let mut matched = Vec::new();
        for flow in flows {
            match self.evaluate(flow, event) {
                Ok(MatchDecision::Match { keyword }) => {
                    tracing::debug!(
                        flow_id = %flow.id,
                        event_id = %event.event_id,
                        keyword = ?keyword,
                        "event matched flow trigger"
                    );
                    matched.push(MatchedFlow {
                        flow: flow.clone(),
                        keyword,
                    });
                }
                Ok(MatchDecision::NoMatch) => {}
                Err(e) => {
                    tracing::warn!(
                        flow_id = %flow.id,
                        event_id = %event.event_id,
                        error = %e,
                        "skipping flow with invalid trigger"
                    );
                }
            }
        }
        matched
    }

    /// Evaluate one flow against one event.
    pub fn evaluate(
        &self,
        flow: &AutomationFlow,
        event: &SocialEvent,
    ) -> Result<MatchDecision, MatchError> {
        let conditions = &flow.trigger_conditions;
        if !flow.is_active || !conditions.platforms.contains(&event.platform) {
            return Ok(MatchDecision::NoMatch);
        }
        if let Some(allowed) = &conditions.account_ids {
            let on_allowed = event
                .account_id
                .as_ref()
                .is_some_and(|id| allowed.contains(id));
            if !on_allowed {
                return Ok(MatchDecision::NoMatch);
            }
        }

        match flow.trigger_type {
            TriggerType::Manual => Ok(MatchDecision::NoMatch),
            TriggerType::Comment | TriggerType::Dm | TriggerType::Mention | TriggerType::Hashtag => {
                Ok(MatchDecision::Match { keyword: None })
            }
            TriggerType::Keyword => {
                let text = event.content.trim();
                for keyword in &conditions.keywords {
                    if self.keyword_matches(&flow.id, conditions.match_type, keyword, text)? {
                        return Ok(MatchDecision::Match {
                            keyword: Some(keyword.clone()),
                        });
                    }
                }
                Ok(MatchDecision::NoMatch)
            }
        }
    }

    fn keyword_matches(
        &self,
        flow_id: &str,
        match_type: MatchType,
        keyword: &str,
        text: &str,
    ) -> Result<bool, MatchError> {
        if match_type == MatchType::Regex {
            let regex = self.compiled(flow_id, keyword)?;
            return Ok(regex.is_match(text));
        }
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() {
            return Ok(false);
        }
        let text = text.to_lowercase();
        Ok(match match_type {
            MatchType::Exact => text == keyword,
            MatchType::Contains => text.contains(&keyword),
            MatchType::StartsWith => text.starts_with(&keyword),
            MatchType::Regex => false,
        })
    }

    fn compiled(&self, flow_id: &str, pattern: &str) -> Result<Arc<Regex>, MatchError> {
        if let Some(re) = self.patterns.read().get(flow_id).and_then(|p| p.get(pattern)) {
            return Ok(Arc::clone(re));
        }
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| MatchError::InvalidPattern {
                flow_id: flow_id.to_string(),
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        let re = Arc::new(re);
        let mut cache = self.patterns.write();
        if count(&cache) >= self.max_patterns {
            tracing::debug!(limit = self.max_patterns, "pattern cache full, clearing");
            cache.clear();
        }
        cache
            .entry(flow_id.to_string())
            .or_default()
            .insert(pattern.to_string(), Arc::clone(&re));
        Ok(re)
    }

    /// Drop the compiled patterns cached for `flow_id`.
    pub fn forget_flow(&self, flow_id: &str) {
        self.patterns.write().remove(flow_id);
    }

    /// Number of cached patterns.
    pub fn cached_patterns(&self) -> usize {
        count(&self.patterns.read())
    }
}

fn count(cache: &HashMap<String, HashMap<String, Arc<Regex>>>) -> usize {
    cache.values().map(HashMap::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::guide_flow;
    use crate::types::{FlowDefinition, Platform, TriggerConditions};

    fn keyword_flow(match_type: MatchType, keywords: &[&str]) -> AutomationFlow {
        AutomationFlow::new(
            "store-1",
            "kw",
            TriggerType::Keyword,
            TriggerConditions::new([Platform::Instagram]).keywords(match_type, keywords.iter().copied()),
            FlowDefinition::default(),
        )
        .activated()
    }

    fn ig(content: &str) -> SocialEvent {
        SocialEvent::new(Platform::Instagram, "u-1", content)
    }

    #[test]
    fn keyword_contains_is_case_insensitive() {
        let matcher = TriggerMatcher::new();
        let flow = guide_flow().activated();
        let decision = matcher.evaluate(&flow, &ig("SEND ME THE GUIDE")).unwrap();
        assert_eq!(
            decision,
            MatchDecision::Match {
                keyword: Some("guide".into())
            }
        );
    }

    #[test]
    fn exact_and_starts_with_trim_content() {
        let matcher = TriggerMatcher::new();
        let exact = keyword_flow(MatchType::Exact, &["Price"]);
        assert!(matches!(
            matcher.evaluate(&exact, &ig("  price \n")).unwrap(),
            MatchDecision::Match { .. }
        ));
        assert_eq!(matcher.evaluate(&exact, &ig("price?")).unwrap(), MatchDecision::NoMatch);

        let prefix = keyword_flow(MatchType::StartsWith, &["info"]);
        assert!(matches!(
            matcher.evaluate(&prefix, &ig("  INFO please")).unwrap(),
            MatchDecision::Match { .. }
        ));
        assert_eq!(
            matcher.evaluate(&prefix, &ig("more info")).unwrap(),
            MatchDecision::NoMatch
        );
    }

    #[test]
    fn anchored_regex() {
        let matcher = TriggerMatcher::new();
        let flow = keyword_flow(MatchType::Regex, &[r"^buy\s+\d+$"]);
        assert!(matches!(
            matcher.evaluate(&flow, &ig("buy 3")).unwrap(),
            MatchDecision::Match { .. }
        ));
        assert_eq!(
            matcher.evaluate(&flow, &ig("please buy 3")).unwrap(),
            MatchDecision::NoMatch
        );
        assert_eq!(matcher.cached_patterns(), 1);
    }

    #[test]
    fn invalid_regex_skips_only_that_flow() {
        let matcher = TriggerMatcher::new();
        let broken = keyword_flow(MatchType::Regex, &["(unclosed"]);
        let good = keyword_flow(MatchType::Contains, &["guide"]);
        assert!(matches!(
            matcher.evaluate(&broken, &ig("guide")),
            Err(MatchError::InvalidPattern { .. })
        ));

        let matched = matcher.match_event(&ig("guide"), &[broken, good.clone()]);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].flow.id, good.id);
        assert_eq!(matcher.cached_patterns(), 0);
    }

    #[test]
    fn forgotten_flow_recompiles_its_new_patterns() {
        let matcher = TriggerMatcher::new();
        let mut flow = keyword_flow(MatchType::Regex, &[r"^buy\s+\d+$"]);
        assert!(matches!(
            matcher.evaluate(&flow, &ig("buy 2")).unwrap(),
            MatchDecision::Match { .. }
        ));

        flow.trigger_conditions = flow
            .trigger_conditions
            .clone()
            .keywords(MatchType::Regex, [r"^sell\s+\d+$"]);
        matcher.forget_flow(&flow.id);
        assert_eq!(matcher.cached_patterns(), 0);
        assert!(matches!(
            matcher.evaluate(&flow, &ig("sell 2")).unwrap(),
            MatchDecision::Match { .. }
        ));
        assert_eq!(matcher.cached_patterns(), 1);
    }

    #[test]
    fn pattern_cache_stays_within_its_limit() {
        let matcher = TriggerMatcher::with_limit(3);
        for n in 0..10 {
            let pattern = format!("^code{n}$");
            let flow = keyword_flow(MatchType::Regex, &[pattern.as_str()]);
            assert!(matches!(
                matcher.evaluate(&flow, &ig(&format!("CODE{n}"))).unwrap(),
                MatchDecision::Match { .. }
            ));
            assert!(matcher.cached_patterns() <= 3);
        }
    }

    #[test]
    fn inactive_wrong_platform_and_manual_never_match() {
        let matcher = TriggerMatcher::new();
        let inactive = guide_flow();
        assert_eq!(
            matcher.evaluate(&inactive, &ig("guide")).unwrap(),
            MatchDecision::NoMatch
        );

        let flow = guide_flow().activated();
        let tiktok = SocialEvent::new(Platform::Tiktok, "u-1", "guide");
        assert_eq!(matcher.evaluate(&flow, &tiktok).unwrap(), MatchDecision::NoMatch);

        let mut manual = guide_flow().activated();
        manual.trigger_type = TriggerType::Manual;
        assert_eq!(matcher.evaluate(&manual, &ig("guide")).unwrap(), MatchDecision::NoMatch);
    }

    #[test]
    fn account_restriction() {
        let matcher = TriggerMatcher::new();
        let mut flow = guide_flow().activated();
        flow.trigger_conditions = flow.trigger_conditions.clone().accounts(["acct-1"]);

        assert_eq!(matcher.evaluate(&flow, &ig("guide")).unwrap(), MatchDecision::NoMatch);
        assert_eq!(
            matcher
                .evaluate(&flow, &ig("guide").with_account("acct-2"))
                .unwrap(),
            MatchDecision::NoMatch
        );
        assert!(matches!(
            matcher
                .evaluate(&flow, &ig("guide").with_account("acct-1"))
                .unwrap(),
            MatchDecision::Match { .. }
        ));
    }

    #[test]
    fn non_keyword_triggers_match_on_platform() {
        let matcher = TriggerMatcher::new();
        let mut flow = guide_flow().activated();
        flow.trigger_type = TriggerType::Dm;
        assert_eq!(
            matcher.evaluate(&flow, &ig("anything at all")).unwrap(),
            MatchDecision::Match { keyword: None }
        );
    }

    #[test]
    fn results_keep_input_order() {
        let matcher = TriggerMatcher::new();
        let a = keyword_flow(MatchType::Contains, &["guide"]);
        let b = keyword_flow(MatchType::Contains, &["the"]);
        let ids: Vec<_> = matcher
            .match_event(&ig("the guide"), &[b.clone(), a.clone()])
            .into_iter()
            .map(|m| m.flow.id)
            .collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }
}
