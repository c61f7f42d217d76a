//! Metric activation: a metric only receives `what` matches while armed.

use crate::engine::stats_config::MetricActivation;
use crate::matcher::MatchResults;

#[derive(Debug, Clone)]
struct ActivationRule {
    activation_matcher: i64,
    deactivation_matcher: Option<i64>,
    ttl_ns: Option<i64>,
    /// `Some(i64::MAX)` when armed without a TTL.
    armed_until_ns: Option<i64>,
}

impl ActivationRule {
    fn is_armed(&self, elapsed_ns: i64) -> bool {
        self.armed_until_ns.is_some_and(|until| elapsed_ns < until)
    }
}

#[derive(Debug, Clone)]
pub struct ActivationTracker {
    metric_id: i64,
    rules: Vec<ActivationRule>,
}

impl ActivationTracker {
    pub fn new(activation: &MetricActivation) -> Self {
        let rules = activation
            .event_activations
            .iter()
            .map(|event| ActivationRule {
                activation_matcher: event.atom_matcher_id,
                deactivation_matcher: event.deactivation_atom_matcher_id,
                ttl_ns: event
                    .ttl
                    .map(|ttl| i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX)),
                armed_until_ns: None,
            })
            .collect();
        Self {
            metric_id: activation.metric_id,
            rules,
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.metric_id
    }

    /// Arms or disarms rules for one atom. Activation is applied before
    /// deactivation, so an atom firing both leaves the rule disarmed.
    pub fn on_matched(&mut self, fired: &MatchResults, elapsed_ns: i64) {
        for rule in &mut self.rules {
            if fired.contains(rule.activation_matcher) {
                let until = rule
                    .ttl_ns
                    .map_or(i64::MAX, |ttl| elapsed_ns.saturating_add(ttl));
                rule.armed_until_ns = Some(until);
                tracing::debug!("Metric {} armed until {}", self.metric_id, until);
            }
            if rule.deactivation_matcher.is_some_and(|id| fired.contains(id)) {
                rule.armed_until_ns = None;
                tracing::debug!("Metric {} disarmed", self.metric_id);
            }
        }
    }

    pub fn is_active(&self, elapsed_ns: i64) -> bool {
        self.rules.iter().any(|rule| rule.is_armed(elapsed_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Atom;
    use crate::engine::stats_config::EventActivation;
    use crate::matcher::{AtomMatcher, MatcherSet};
    use std::time::Duration;

    fn matchers() -> MatcherSet {
        MatcherSet::new(&[AtomMatcher::simple(1, 47), AtomMatcher::simple(2, 48)]).unwrap()
    }

    fn fire(set: &MatcherSet, atom_id: i32) -> MatchResults {
        set.evaluate(&Atom::builder(atom_id).build().unwrap())
    }

    fn tracker(ttl: Option<Duration>) -> ActivationTracker {
        ActivationTracker::new(&MetricActivation {
            metric_id: 100,
            event_activations: vec![EventActivation {
                atom_matcher_id: 1,
                ttl,
                deactivation_atom_matcher_id: Some(2),
            }],
        })
    }

    #[test]
    fn test_inactive_until_armed() {
        let set = matchers();
        let mut t = tracker(None);
        assert!(!t.is_active(0));
        t.on_matched(&fire(&set, 47), 10);
        assert!(t.is_active(10));
        assert!(t.is_active(i64::MAX - 1));
    }

    #[test]
    fn test_ttl_expires() {
        let set = matchers();
        let mut t = tracker(Some(Duration::from_nanos(100)));
        t.on_matched(&fire(&set, 47), 10);
        assert!(t.is_active(109));
        assert!(!t.is_active(110));
        // Re-arming extends the window.
        t.on_matched(&fire(&set, 47), 105);
        assert!(t.is_active(200));
    }

    #[test]
    fn test_deactivation() {
        let set = matchers();
        let mut t = tracker(None);
        t.on_matched(&fire(&set, 47), 10);
        t.on_matched(&fire(&set, 48), 20);
        assert!(!t.is_active(20));
    }
}
