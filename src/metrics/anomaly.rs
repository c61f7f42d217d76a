//! Sum-over-window anomaly detection for count metrics.

use crate::engine::stats_config::Alert;
use crate::metrics::dimension::DimensionKey;
use ahash::AHashMap;
use std::collections::VecDeque;

/// A declared anomaly, before it is fanned out to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyEvent {
    pub alert_id: i64,
    pub metric_id: i64,
    pub dimension: DimensionKey,
    /// Window sum that crossed the threshold.
    pub sum: i64,
    pub elapsed_ns: i64,
}

/// Tracks one alert over one count metric.
///
/// Keeps the last `num_buckets - 1` closed bucket values per dimension. The
/// current bucket value is supplied by the producer on every increment.
#[derive(Debug)]
pub struct AnomalyTracker {
    alert: Alert,
    refractory_ns: i64,
    past: AHashMap<DimensionKey, VecDeque<(i64, i64)>>,
    refractory_end_ns: AHashMap<DimensionKey, i64>,
}

impl AnomalyTracker {
    pub fn new(alert: Alert) -> Self {
        let refractory_ns = alert
            .refractory_period
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
        Self {
            alert,
            refractory_ns,
            past: AHashMap::new(),
            refractory_end_ns: AHashMap::new(),
        }
    }

    pub fn alert_id(&self) -> i64 {
        self.alert.id
    }

    fn window(&self) -> i64 {
        i64::from(self.alert.num_buckets.saturating_sub(1))
    }

    /// Records the final value of a closed bucket.
    pub fn add_past_bucket(&mut self, key: &DimensionKey, value: i64, bucket_num: i64) {
        let window = self.window();
        if window == 0 {
            return;
        }
        let buckets = self.past.entry(key.clone()).or_default();
        buckets.push_back((bucket_num, value));
        while buckets.len() as i64 > window {
            buckets.pop_front();
        }
    }

    /// Sum of the closed buckets inside the window ending before `current_bucket`.
    pub fn past_sum(&self, key: &DimensionKey, current_bucket: i64) -> i64 {
        let oldest = current_bucket - self.window();
        self.past.get(key).map_or(0, |buckets| {
            buckets
                .iter()
                .filter(|(num, _)| *num >= oldest && *num < current_bucket)
                .map(|(_, value)| value)
                .sum()
        })
    }

    /// Checks the window for `key` and declares an anomaly when the sum
    /// exceeds the threshold outside the refractory period.
    pub fn detect_and_declare(
        &mut self,
        metric_id: i64,
        key: &DimensionKey,
        current_bucket: i64,
        current_value: i64,
        elapsed_ns: i64,
    ) -> Option<AnomalyEvent> {
        let sum = self.past_sum(key, current_bucket) + current_value;
        if sum <= self.alert.trigger_if_sum_gt {
            return None;
        }
        if self
            .refractory_end_ns
            .get(key)
            .is_some_and(|end| elapsed_ns < *end)
        {
            return None;
        }
        self.refractory_end_ns
            .insert(key.clone(), elapsed_ns.saturating_add(self.refractory_ns));
        tracing::info!(
            "Anomaly declared by alert {} on metric {} for [{}]: sum {}",
            self.alert.id,
            metric_id,
            key,
            sum
        );
        Some(AnomalyEvent {
            alert_id: self.alert.id,
            metric_id,
            dimension: key.clone(),
            sum,
            elapsed_ns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::dimension::DimensionValue;
    use std::time::Duration;

    fn alert(num_buckets: u32, threshold: i64, refractory: Option<Duration>) -> Alert {
        Alert {
            id: 1,
            metric_id: 10,
            num_buckets,
            trigger_if_sum_gt: threshold,
            refractory_period: refractory,
        }
    }

    fn key() -> DimensionKey {
        DimensionKey::from_values([DimensionValue::Str("a".into())])
    }

    #[test]
    fn test_single_bucket_threshold() {
        let mut tracker = AnomalyTracker::new(alert(1, 2, None));
        assert!(tracker.detect_and_declare(10, &key(), 0, 2, 100).is_none());
        let event = tracker.detect_and_declare(10, &key(), 0, 3, 200).unwrap();
        assert_eq!(event.sum, 3);
    }

    #[test]
    fn test_window_includes_past_buckets() {
        let mut tracker = AnomalyTracker::new(alert(3, 5, None));
        tracker.add_past_bucket(&key(), 2, 0);
        tracker.add_past_bucket(&key(), 2, 1);
        assert_eq!(tracker.past_sum(&key(), 2), 4);
        assert!(tracker.detect_and_declare(10, &key(), 2, 2, 0).is_some());
        // Bucket 0 has left the window by bucket 3.
        assert_eq!(tracker.past_sum(&key(), 3), 2);
    }

    #[test]
    fn test_refractory_period() {
        let mut tracker = AnomalyTracker::new(alert(1, 0, Some(Duration::from_nanos(1000))));
        assert!(tracker.detect_and_declare(10, &key(), 0, 1, 0).is_some());
        assert!(tracker.detect_and_declare(10, &key(), 0, 2, 999).is_none());
        assert!(tracker.detect_and_declare(10, &key(), 0, 3, 1000).is_some());
    }
}
