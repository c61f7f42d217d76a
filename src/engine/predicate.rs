//! Predicate tracking: a boolean driven by start/stop/stop_all matchers.

use crate::engine::stats_config::{InitialValue, Predicate};
use crate::matcher::MatchResults;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    True,
    False,
    Unknown,
}

#[derive(Debug)]
pub struct PredicateTracker {
    predicate: Predicate,
    state: ConditionState,
    nesting: u32,
}

impl PredicateTracker {
    pub fn new(predicate: Predicate) -> Self {
        let state = match predicate.initial_value {
            InitialValue::False => ConditionState::False,
            InitialValue::Unknown => ConditionState::Unknown,
        };
        Self {
            predicate,
            state,
            nesting: 0,
        }
    }

    pub fn id(&self) -> i64 {
        self.predicate.id
    }

    pub fn state(&self) -> ConditionState {
        self.state
    }

    /// Metrics only count while their condition is known to hold.
    pub fn is_met(&self) -> bool {
        self.state == ConditionState::True
    }

    /// Applies one atom's matcher results. Returns the new truth value when
    /// it changed. `stop_all` wins over start, and start wins over stop.
    pub fn on_matched(&mut self, fired: &MatchResults) -> Option<bool> {
        let fires = |id: Option<i64>| id.is_some_and(|id| fired.contains(id));
        let was_met = self.is_met();

        if fires(self.predicate.stop_all) {
            self.nesting = 0;
            self.state = ConditionState::False;
        } else if fires(self.predicate.start) {
            self.nesting = if self.predicate.count_nesting {
                self.nesting + 1
            } else {
                1
            };
            self.state = ConditionState::True;
        } else if fires(self.predicate.stop) {
            if self.predicate.count_nesting && self.nesting > 1 {
                self.nesting -= 1;
            } else {
                self.nesting = 0;
                self.state = ConditionState::False;
            }
        } else {
            return None;
        }

        let met = self.is_met();
        (met != was_met).then_some(met)
    }
}
