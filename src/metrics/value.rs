//! Value metric: per-bucket sum of a numeric field.

use crate::core::types::Atom;
use crate::engine::stats_config::Dimension;
use crate::metrics::bucket::{BucketClock, BucketedSeries};
use crate::metrics::dimension::{DimensionGuardrail, DimensionKey};
use crate::report::{MetricData, SkippedSample, ValueBucket, ValueSeries};
use crate::uid_map::UidMap;
use ahash::AHashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct ValueAccumulator {
    sum: f64,
    sample_count: u64,
}

#[derive(Debug)]
pub struct ValueProducer {
    metric_id: i64,
    value_field: u32,
    use_diff: bool,
    dimensions: Vec<Dimension>,
    series: BucketedSeries<ValueAccumulator>,
    /// Last raw value per key, the baseline for diffs.
    last_values: AHashMap<DimensionKey, f64>,
    condition_met: bool,
    skipped: Vec<SkippedSample>,
    guardrail: DimensionGuardrail,
}

impl ValueProducer {
    pub fn new(
        metric_id: i64,
        value_field: u32,
        use_diff: bool,
        dimensions: Vec<Dimension>,
        clock: BucketClock,
        condition_met: bool,
        max_dimensions: usize,
    ) -> Self {
        Self {
            metric_id,
            value_field,
            use_diff,
            dimensions,
            series: BucketedSeries::new(clock),
            last_values: AHashMap::new(),
            condition_met,
            skipped: Vec::new(),
            guardrail: DimensionGuardrail::new(max_dimensions),
        }
    }

    pub fn on_matched_event(&mut self, atom: &Atom, uid_map: &UidMap) {
        let ts = atom.elapsed_timestamp_ns();
        self.flush_if_needed(ts);
        if self.condition_met && !self.series.is_late(ts) {
            self.add_value(atom, uid_map);
        }
    }

    pub fn on_data_pulled(&mut self, atoms: &[Atom], request_ns: i64, uid_map: &UidMap) {
        self.flush_if_needed(request_ns);
        if !self.condition_met || self.series.is_late(request_ns) {
            return;
        }
        for atom in atoms {
            self.add_value(atom, uid_map);
        }
    }

    pub fn on_pull_failed(&mut self, request_ns: i64, reason: &str) {
        self.skipped.push(SkippedSample {
            bucket_num: self.series.clock().bucket_num(request_ns),
            elapsed_ns: request_ns,
            reason: reason.to_string(),
        });
    }

    fn add_value(&mut self, atom: &Atom, uid_map: &UidMap) {
        let Some(value) = atom.field(self.value_field).and_then(|v| v.as_f64()) else {
            return;
        };
        let Some(key) = DimensionKey::project(atom, &self.dimensions, uid_map) else {
            return;
        };
        let known = self.series.contains(&key) || self.last_values.contains_key(&key);
        if !self.guardrail.admit(known, self.series.current_len()) {
            return;
        }

        let contribution = if self.use_diff {
            match self.last_values.insert(key.clone(), value) {
                // The first reading only establishes the baseline.
                None => return,
                Some(previous) if value < previous => {
                    tracing::debug!(
                        "Value metric {} saw counter reset for [{}]",
                        self.metric_id,
                        key
                    );
                    return;
                },
                Some(previous) => value - previous,
            }
        } else {
            value
        };

        let accumulator = self.series.current_mut(key);
        accumulator.sum += contribution;
        accumulator.sample_count += 1;
    }

    pub fn on_condition_changed(&mut self, met: bool, elapsed_ns: i64) {
        self.flush_if_needed(elapsed_ns);
        self.condition_met = met;
    }

    pub fn flush_if_needed(&mut self, elapsed_ns: i64) {
        self.series.advance(elapsed_ns, |_, _, _| {});
    }

    pub fn guardrail_hit(&self) -> bool {
        self.guardrail.hit()
    }

    pub fn skipped(&self) -> &[SkippedSample] {
        &self.skipped
    }

    pub fn dump(&mut self, dump_ns: i64, clear: bool) -> MetricData {
        self.flush_if_needed(dump_ns);
        let series = self
            .series
            .snapshot(dump_ns)
            .into_iter()
            .map(|(dimension, buckets)| ValueSeries {
                dimension,
                buckets: buckets
                    .into_iter()
                    .map(|(info, acc)| ValueBucket {
                        info,
                        sum: acc.sum,
                        sample_count: acc.sample_count,
                    })
                    .collect(),
            })
            .collect();
        if clear {
            self.clear();
        }
        MetricData::Value(series)
    }

    /// Baselines survive so the next pull still produces a diff.
    pub fn clear(&mut self) {
        self.series.clear();
        self.skipped.clear();
        self.guardrail.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::FieldTarget;

    fn cpu(uid: i32, user_time: i64) -> Atom {
        Atom::builder(10009).int(uid).long(user_time).long(0).build().unwrap()
    }

    fn producer(use_diff: bool) -> ValueProducer {
        ValueProducer::new(
            1,
            2,
            use_diff,
            vec![FieldTarget::Field(1)],
            BucketClock::new(0, 1000),
            true,
            100,
        )
    }

    fn buckets(data: MetricData) -> Vec<(String, f64, u64)> {
        let MetricData::Value(series) = data else {
            panic!("Expected value data");
        };
        series
            .iter()
            .flat_map(|s| {
                s.buckets
                    .iter()
                    .map(move |b| (s.dimension.to_string(), b.sum, b.sample_count))
            })
            .collect()
    }

    #[test]
    fn test_sum_per_bucket() {
        let uid_map = UidMap::default();
        let mut p = producer(false);
        p.on_data_pulled(&[cpu(1, 10), cpu(2, 5)], 100, &uid_map);
        p.on_data_pulled(&[cpu(1, 15)], 200, &uid_map);
        assert_eq!(
            buckets(p.dump(300, false)),
            vec![("1".to_string(), 25.0, 2), ("2".to_string(), 5.0, 1)]
        );
    }

    #[test]
    fn test_diff_against_previous_pull() {
        let uid_map = UidMap::default();
        let mut p = producer(true);
        p.on_data_pulled(&[cpu(1, 100)], 0, &uid_map);
        p.on_data_pulled(&[cpu(1, 130)], 1000, &uid_map);
        p.on_data_pulled(&[cpu(1, 150)], 2000, &uid_map);
        let got = buckets(p.dump(2500, false));
        assert_eq!(got, vec![("1".to_string(), 30.0, 1), ("1".to_string(), 20.0, 1)]);
    }

    #[test]
    fn test_counter_reset_skipped() {
        let uid_map = UidMap::default();
        let mut p = producer(true);
        p.on_data_pulled(&[cpu(1, 100)], 0, &uid_map);
        p.on_data_pulled(&[cpu(1, 40)], 100, &uid_map);
        p.on_data_pulled(&[cpu(1, 50)], 200, &uid_map);
        assert_eq!(buckets(p.dump(300, false)), vec![("1".to_string(), 10.0, 1)]);
    }

    #[test]
    fn test_pull_failure_recorded() {
        let mut p = producer(false);
        p.on_pull_failed(1500, "timeout");
        assert_eq!(p.skipped()[0].bucket_num, 1);
        p.dump(2000, true);
        assert!(p.skipped().is_empty());
    }
}
