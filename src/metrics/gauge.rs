//! Gauge metric: sampled atom snapshots per dimension per bucket.

use crate::core::types::Atom;
use crate::engine::stats_config::{Dimension, GaugeSampling};
use crate::metrics::bucket::{BucketClock, BucketedSeries};
use crate::metrics::dimension::{DimensionGuardrail, DimensionKey};
use crate::report::{GaugeBucket, GaugeSample, GaugeSeries, MetricData, SkippedSample};
use crate::uid_map::UidMap;
use std::time::Duration;

#[derive(Debug)]
pub struct GaugeProducer {
    metric_id: i64,
    dimensions: Vec<Dimension>,
    sampling: GaugeSampling,
    max_pull_delay: Option<Duration>,
    series: BucketedSeries<Vec<GaugeSample>>,
    condition_met: bool,
    skipped: Vec<SkippedSample>,
    guardrail: DimensionGuardrail,
}

impl GaugeProducer {
    pub fn new(
        metric_id: i64,
        dimensions: Vec<Dimension>,
        clock: BucketClock,
        sampling: GaugeSampling,
        max_pull_delay: Option<Duration>,
        condition_met: bool,
        max_dimensions: usize,
    ) -> Self {
        Self {
            metric_id,
            dimensions,
            sampling,
            max_pull_delay,
            series: BucketedSeries::new(clock),
            condition_met,
            skipped: Vec::new(),
            guardrail: DimensionGuardrail::new(max_dimensions),
        }
    }

    /// Samples a pushed atom directly.
    pub fn on_matched_event(&mut self, atom: &Atom, uid_map: &UidMap) {
        let ts = atom.elapsed_timestamp_ns();
        self.flush_if_needed(ts);
        if self.condition_met && !self.series.is_late(ts) {
            self.add_sample(atom, ts, uid_map);
        }
    }

    /// Samples the atoms of a completed pull requested at `request_ns`.
    pub fn on_data_pulled(
        &mut self,
        atoms: &[Atom],
        request_ns: i64,
        delay: Duration,
        uid_map: &UidMap,
    ) {
        self.flush_if_needed(request_ns);
        if !self.condition_met || self.series.is_late(request_ns) {
            return;
        }
        if let Some(max) = self.max_pull_delay {
            if delay > max {
                tracing::debug!(
                    "Gauge {} discarded pull after {:?} (max {:?})",
                    self.metric_id,
                    delay,
                    max
                );
                self.on_pull_failed(request_ns, "pull delay exceeded");
                return;
            }
        }
        for atom in atoms {
            self.add_sample(atom, request_ns, uid_map);
        }
    }

    pub fn on_pull_failed(&mut self, request_ns: i64, reason: &str) {
        self.skipped.push(SkippedSample {
            bucket_num: self.series.clock().bucket_num(request_ns),
            elapsed_ns: request_ns,
            reason: reason.to_string(),
        });
    }

    fn add_sample(&mut self, atom: &Atom, ts: i64, uid_map: &UidMap) {
        let Some(key) = DimensionKey::project(atom, &self.dimensions, uid_map) else {
            return;
        };
        if !self.guardrail.admit(self.series.contains(&key), self.series.current_len()) {
            return;
        }
        let samples = self.series.current_mut(key);
        if let GaugeSampling::FirstNSamples(n) = self.sampling {
            if samples.len() >= n {
                return;
            }
        }
        samples.push(GaugeSample {
            elapsed_timestamp_ns: ts,
            atom: atom.clone(),
        });
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
            .map(|(dimension, buckets)| GaugeSeries {
                dimension,
                buckets: buckets
                    .into_iter()
                    .map(|(info, mut samples)| {
                        samples.sort_by_key(|s| s.elapsed_timestamp_ns);
                        GaugeBucket { info, samples }
                    })
                    .collect(),
            })
            .collect();
        if clear {
            self.clear();
        }
        MetricData::Gauge(series)
    }

    pub fn clear(&mut self) {
        self.series.clear();
        self.skipped.clear();
        self.guardrail.reset();
    }
}
