//! Count metric: matches per dimension per bucket.

use crate::core::types::Atom;
use crate::engine::stats_config::Dimension;
use crate::metrics::anomaly::{AnomalyEvent, AnomalyTracker};
use crate::metrics::bucket::{BucketClock, BucketedSeries};
use crate::metrics::dimension::{DimensionGuardrail, DimensionKey};
use crate::report::{CountBucket, CountSeries, MetricData};
use crate::uid_map::UidMap;

#[derive(Debug)]
pub struct CountProducer {
    metric_id: i64,
    dimensions: Vec<Dimension>,
    series: BucketedSeries<i64>,
    condition_met: bool,
    guardrail: DimensionGuardrail,
    anomaly_trackers: Vec<AnomalyTracker>,
    anomalies: Vec<AnomalyEvent>,
}

impl CountProducer {
    pub fn new(
        metric_id: i64,
        dimensions: Vec<Dimension>,
        clock: BucketClock,
        condition_met: bool,
        max_dimensions: usize,
    ) -> Self {
        Self {
            metric_id,
            dimensions,
            series: BucketedSeries::new(clock),
            condition_met,
            guardrail: DimensionGuardrail::new(max_dimensions),
            anomaly_trackers: Vec::new(),
            anomalies: Vec::new(),
        }
    }

    pub fn add_anomaly_tracker(&mut self, tracker: AnomalyTracker) {
        self.anomaly_trackers.push(tracker);
    }

    pub fn on_matched_event(&mut self, atom: &Atom, uid_map: &UidMap) {
        let ts = atom.elapsed_timestamp_ns();
        self.flush_if_needed(ts);
        if !self.condition_met {
            return;
        }
        if self.series.is_late(ts) {
            tracing::debug!("Metric {} dropped late atom at {}", self.metric_id, ts);
            return;
        }
        let Some(key) = DimensionKey::project(atom, &self.dimensions, uid_map) else {
            return;
        };
        if !self.guardrail.admit(self.series.contains(&key), self.series.current_len()) {
            return;
        }

        let count = {
            let slot = self.series.current_mut(key.clone());
            *slot += 1;
            *slot
        };
        let bucket = self.series.current_bucket();
        for tracker in &mut self.anomaly_trackers {
            if let Some(event) = tracker.detect_and_declare(self.metric_id, &key, bucket, count, ts) {
                self.anomalies.push(event);
            }
        }
    }

    pub fn on_condition_changed(&mut self, met: bool, elapsed_ns: i64) {
        self.flush_if_needed(elapsed_ns);
        self.condition_met = met;
    }

    pub fn flush_if_needed(&mut self, elapsed_ns: i64) {
        let trackers = &mut self.anomaly_trackers;
        self.series.advance(elapsed_ns, |key, count, bucket| {
            for tracker in trackers.iter_mut() {
                tracker.add_past_bucket(key, *count, bucket);
            }
        });
    }

    /// Anomalies declared since the last call.
    pub fn take_anomalies(&mut self) -> Vec<AnomalyEvent> {
        std::mem::take(&mut self.anomalies)
    }

    pub fn guardrail_hit(&self) -> bool {
        self.guardrail.hit()
    }

    pub fn dump(&mut self, dump_ns: i64, clear: bool) -> MetricData {
        self.flush_if_needed(dump_ns);
        let series = self
            .series
            .snapshot(dump_ns)
            .into_iter()
            .map(|(dimension, buckets)| CountSeries {
                dimension,
                buckets: buckets
                    .into_iter()
                    .map(|(info, count)| CountBucket { info, count })
                    .collect(),
            })
            .collect();
        if clear {
            self.clear();
        }
        MetricData::Count(series)
    }

    pub fn clear(&mut self) {
        self.series.clear();
        self.guardrail.reset();
    }
}
