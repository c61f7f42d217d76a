//! Duration metric: level-triggered start/stop intervals per dimension.
//!
//! A key is active from its first start until the matching stop. With
//! nesting enabled every start must be balanced by a stop before the key
//! closes; without it, repeated starts and stops are no-ops. Time accrues
//! only while the metric's condition holds, and accrued segments are split
//! at bucket boundaries. Zero-length segments are never recorded.

use crate::core::types::Atom;
use crate::engine::stats_config::{Dimension, DurationAggregation};
use crate::metrics::bucket::BucketClock;
use crate::metrics::dimension::{DimensionGuardrail, DimensionKey};
use crate::report::{DurationBucket, DurationRecord, DurationSeries, MetricData};
use crate::uid_map::UidMap;
use ahash::AHashMap;
use std::collections::BTreeMap;

#[derive(Debug)]
struct OpenInterval {
    nesting: u32,
    /// Start of the segment currently accruing, if the condition holds.
    segment_start: Option<i64>,
}

#[derive(Debug)]
pub struct DurationProducer {
    metric_id: i64,
    dimensions: Vec<Dimension>,
    clock: BucketClock,
    nesting: bool,
    aggregation: DurationAggregation,
    condition_met: bool,
    open: AHashMap<DimensionKey, OpenInterval>,
    records: BTreeMap<DimensionKey, Vec<DurationRecord>>,
    guardrail: DimensionGuardrail,
}

impl DurationProducer {
    pub fn new(
        metric_id: i64,
        dimensions: Vec<Dimension>,
        clock: BucketClock,
        nesting: bool,
        aggregation: DurationAggregation,
        condition_met: bool,
        max_dimensions: usize,
    ) -> Self {
        Self {
            metric_id,
            dimensions,
            clock,
            nesting,
            aggregation,
            condition_met,
            open: AHashMap::new(),
            records: BTreeMap::new(),
            guardrail: DimensionGuardrail::new(max_dimensions),
        }
    }

    pub fn on_start(&mut self, atom: &Atom, uid_map: &UidMap) {
        let Some(key) = DimensionKey::project(atom, &self.dimensions, uid_map) else {
            return;
        };
        if let Some(open) = self.open.get_mut(&key) {
            if self.nesting {
                open.nesting += 1;
            }
            return;
        }
        if !self.guardrail.admit(false, self.open.len()) {
            return;
        }
        let ts = atom.elapsed_timestamp_ns();
        self.open.insert(
            key,
            OpenInterval {
                nesting: 1,
                segment_start: self.condition_met.then_some(ts),
            },
        );
    }

    pub fn on_stop(&mut self, atom: &Atom, uid_map: &UidMap) {
        let Some(key) = DimensionKey::project(atom, &self.dimensions, uid_map) else {
            return;
        };
        let Some(open) = self.open.get_mut(&key) else {
            return;
        };
        if self.nesting && open.nesting > 1 {
            open.nesting -= 1;
            return;
        }
        if let Some(open) = self.open.remove(&key) {
            if let Some(start) = open.segment_start {
                record(&mut self.records, &self.clock, &key, start, atom.elapsed_timestamp_ns());
            }
        }
    }

    /// Closes every open key regardless of nesting.
    pub fn on_stop_all(&mut self, elapsed_ns: i64) {
        for (key, open) in self.open.drain() {
            if let Some(start) = open.segment_start {
                record(&mut self.records, &self.clock, &key, start, elapsed_ns);
            }
        }
    }

    pub fn on_condition_changed(&mut self, met: bool, elapsed_ns: i64) {
        if met == self.condition_met {
            return;
        }
        self.condition_met = met;
        for (key, open) in self.open.iter_mut() {
            if met {
                open.segment_start = Some(elapsed_ns);
            } else if let Some(start) = open.segment_start.take() {
                record(&mut self.records, &self.clock, key, start, elapsed_ns);
            }
        }
    }

    pub fn guardrail_hit(&self) -> bool {
        self.guardrail.hit()
    }

    /// Open segments are reported up to `dump_ns`. A clearing dump restarts
    /// them at `dump_ns` so the reported part is never reported again.
    pub fn dump(&mut self, dump_ns: i64, clear: bool) -> MetricData {
        let mut all = if clear {
            std::mem::take(&mut self.records)
        } else {
            self.records.clone()
        };
        for (key, open) in self.open.iter_mut() {
            let Some(start) = open.segment_start else {
                continue;
            };
            if start < dump_ns {
                record(&mut all, &self.clock, key, start, dump_ns);
                if clear {
                    open.segment_start = Some(dump_ns);
                }
            }
        }
        if clear {
            self.guardrail.reset();
        }

        let series = all
            .into_iter()
            .map(|(dimension, mut intervals)| {
                intervals.sort_by_key(|r| r.start_ns);
                let buckets = self.aggregate(&intervals, dump_ns);
                DurationSeries {
                    dimension,
                    intervals,
                    buckets,
                }
            })
            .collect();
        MetricData::Duration(series)
    }

    fn aggregate(&self, intervals: &[DurationRecord], dump_ns: i64) -> Vec<DurationBucket> {
        let mut per_bucket: BTreeMap<i64, i64> = BTreeMap::new();
        for interval in intervals {
            let slot = per_bucket.entry(interval.bucket_num).or_insert(0);
            *slot = match self.aggregation {
                DurationAggregation::Sum => *slot + interval.duration_ns,
                DurationAggregation::MaxSparse => (*slot).max(interval.duration_ns),
            };
        }
        per_bucket
            .into_iter()
            .map(|(bucket, duration_ns)| DurationBucket {
                info: self.clock.partial_info(bucket, dump_ns),
                duration_ns,
            })
            .collect()
    }

    /// Drops recorded intervals. Open segments restart at `elapsed_ns`.
    pub fn clear(&mut self, elapsed_ns: i64) {
        self.records.clear();
        for open in self.open.values_mut() {
            if open.segment_start.is_some() {
                open.segment_start = Some(elapsed_ns);
            }
        }
        self.guardrail.reset();
        tracing::trace!("Duration metric {} cleared", self.metric_id);
    }
}

/// Appends `[start, end)` split at bucket boundaries.
fn record(
    records: &mut BTreeMap<DimensionKey, Vec<DurationRecord>>,
    clock: &BucketClock,
    key: &DimensionKey,
    start: i64,
    end: i64,
) {
    let mut segment_start = start;
    while segment_start < end {
        let bucket_num = clock.bucket_num(segment_start);
        let segment_end = end.min(clock.bucket_end_ns(bucket_num));
        if segment_end <= segment_start {
            break;
        }
        records.entry(key.clone()).or_default().push(DurationRecord {
            bucket_num,
            start_ns: segment_start,
            end_ns: segment_end,
            duration_ns: segment_end - segment_start,
        });
        segment_start = segment_end;
    }
}
