//! Report types returned by `query`.
//!
//! Every series is sorted by dimension key, and every bucket list by bucket
//! number, so two dumps of the same state serialize identically.

use crate::core::types::{Atom, ConfigKey};
use crate::metrics::bucket::BucketInfo;
use crate::metrics::dimension::DimensionKey;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct ConfigMetricsReport {
    pub config_key: ConfigKey,
    pub time_base_elapsed_ns: i64,
    pub dump_elapsed_ns: i64,
    pub metrics: Vec<MetricReport>,
}

impl ConfigMetricsReport {
    pub fn metric(&self, metric_id: i64) -> Option<&MetricReport> {
        self.metrics.iter().find(|m| m.metric_id == metric_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricReport {
    pub metric_id: i64,
    pub bucket_size_ns: i64,
    /// False while the metric waits for an activation.
    pub is_active: bool,
    pub dimension_guardrail_hit: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedSample>,
    #[serde(flatten)]
    pub data: MetricData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MetricData {
    Event(Vec<EventRecord>),
    Count(Vec<CountSeries>),
    Duration(Vec<DurationSeries>),
    Gauge(Vec<GaugeSeries>),
    Value(Vec<ValueSeries>),
}

impl MetricReport {
    /// Total count per dimension across all buckets, keyed by the
    /// dimension's display form. Empty for non-count metrics.
    pub fn count_totals(&self) -> BTreeMap<String, i64> {
        let MetricData::Count(series) = &self.data else {
            return BTreeMap::new();
        };
        series
            .iter()
            .map(|s| {
                let total = s.buckets.iter().map(|b| b.count).sum::<i64>();
                (s.dimension.to_string(), total)
            })
            .collect()
    }

    /// Every duration interval of every dimension, in report order.
    pub fn duration_intervals(&self) -> Vec<DurationRecord> {
        match &self.data {
            MetricData::Duration(series) => {
                series.iter().flat_map(|s| s.intervals.iter().copied()).collect()
            },
            _ => Vec::new(),
        }
    }

    /// Number of data points regardless of kind.
    pub fn data_len(&self) -> usize {
        match &self.data {
            MetricData::Event(records) => records.len(),
            MetricData::Count(series) => series.iter().map(|s| s.buckets.len()).sum(),
            MetricData::Duration(series) => series.iter().map(|s| s.intervals.len()).sum(),
            MetricData::Gauge(series) => series
                .iter()
                .flat_map(|s| &s.buckets)
                .map(|b| b.samples.len())
                .sum(),
            MetricData::Value(series) => series.iter().map(|s| s.buckets.len()).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub elapsed_timestamp_ns: i64,
    pub atom: Atom,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountSeries {
    pub dimension: DimensionKey,
    pub buckets: Vec<CountBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CountBucket {
    #[serde(flatten)]
    pub info: BucketInfo,
    pub count: i64,
}

/// One accrued interval, never crossing a bucket boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DurationRecord {
    pub bucket_num: i64,
    pub start_ns: i64,
    pub end_ns: i64,
    pub duration_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationSeries {
    pub dimension: DimensionKey,
    pub intervals: Vec<DurationRecord>,
    /// Per-bucket aggregate (sum or max) of `intervals`.
    pub buckets: Vec<DurationBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DurationBucket {
    #[serde(flatten)]
    pub info: BucketInfo,
    pub duration_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GaugeSeries {
    pub dimension: DimensionKey,
    pub buckets: Vec<GaugeBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GaugeBucket {
    #[serde(flatten)]
    pub info: BucketInfo,
    pub samples: Vec<GaugeSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GaugeSample {
    pub elapsed_timestamp_ns: i64,
    pub atom: Atom,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueSeries {
    pub dimension: DimensionKey,
    pub buckets: Vec<ValueBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueBucket {
    #[serde(flatten)]
    pub info: BucketInfo,
    pub sum: f64,
    pub sample_count: u64,
}

/// A pull that produced no data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedSample {
    pub bucket_num: i64,
    pub elapsed_ns: i64,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::dimension::DimensionValue;
    use pretty_assertions::assert_eq;

    fn info(bucket_num: i64) -> BucketInfo {
        BucketInfo {
            bucket_num,
            start_bucket_elapsed_millis: bucket_num * 1000,
            end_bucket_elapsed_millis: (bucket_num + 1) * 1000,
        }
    }

    fn count_report() -> MetricReport {
        let key = |s: &str| DimensionKey::from_values([DimensionValue::Str(s.into())]);
        MetricReport {
            metric_id: 1,
            bucket_size_ns: 1_000_000_000,
            is_active: true,
            dimension_guardrail_hit: false,
            skipped: Vec::new(),
            data: MetricData::Count(vec![
                CountSeries {
                    dimension: key("a"),
                    buckets: vec![
                        CountBucket {
                            info: info(0),
                            count: 1,
                        },
                        CountBucket {
                            info: info(1),
                            count: 1,
                        },
                    ],
                },
                CountSeries {
                    dimension: key("b"),
                    buckets: vec![CountBucket {
                        info: info(0),
                        count: 1,
                    }],
                },
            ]),
        }
    }

    #[test]
    fn test_count_totals() {
        let totals = count_report().count_totals();
        assert_eq!(totals.get("a"), Some(&2));
        assert_eq!(totals.get("b"), Some(&1));
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(count_report()).unwrap();
        assert_eq!(json["kind"], "count");
        assert_eq!(json["data"][0]["dimension"], serde_json::json!(["a"]));
        assert_eq!(json["data"][0]["buckets"][1]["bucket_num"], 1);
        assert_eq!(json["data"][0]["buckets"][1]["start_bucket_elapsed_millis"], 1000);
        assert!(json.get("skipped").is_none());
    }
}
