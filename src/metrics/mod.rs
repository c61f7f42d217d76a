//! Metric producers.
//!
//! One producer per configured metric, dispatched through the
//! [`MetricProducer`] tagged union. Producers own all aggregate state of a
//! metric and are only ever touched under their config's lock.

pub mod anomaly;
pub mod bucket;
pub mod count;
pub mod dimension;
pub mod duration;
pub mod event;
pub mod gauge;
pub mod value;

pub use anomaly::{AnomalyEvent, AnomalyTracker};
pub use bucket::{BucketClock, BucketInfo};
pub use count::CountProducer;
pub use dimension::{DimensionKey, DimensionValue};
pub use duration::DurationProducer;
pub use event::EventProducer;
pub use gauge::GaugeProducer;
pub use value::ValueProducer;

use crate::core::types::Atom;
use crate::engine::stats_config::MetricKind;
use crate::report::{MetricData, SkippedSample};
use crate::uid_map::UidMap;
use std::time::Duration;

/// Why a matcher is routed to a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRole {
    What,
    Start,
    Stop,
    StopAll,
}

impl MatchRole {
    /// When one atom fires several roles of the same metric only the
    /// highest applies: stop_all, then start, then stop.
    pub(crate) fn precedence(self) -> u8 {
        match self {
            MatchRole::What => 0,
            MatchRole::Stop => 1,
            MatchRole::Start => 2,
            MatchRole::StopAll => 3,
        }
    }
}

#[derive(Debug)]
pub enum MetricProducer {
    Event(EventProducer),
    Count(CountProducer),
    Duration(DurationProducer),
    Gauge(GaugeProducer),
    Value(ValueProducer),
}

/// Everything a producer contributes to a metric report.
#[derive(Debug)]
pub struct ProducerDump {
    pub data: MetricData,
    pub dimension_guardrail_hit: bool,
    pub skipped: Vec<SkippedSample>,
}

impl MetricProducer {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricProducer::Event(_) => MetricKind::Event,
            MetricProducer::Count(_) => MetricKind::Count,
            MetricProducer::Duration(_) => MetricKind::Duration,
            MetricProducer::Gauge(_) => MetricKind::Gauge,
            MetricProducer::Value(_) => MetricKind::Value,
        }
    }

    /// Routes a matched atom. Roles a producer does not use are ignored.
    pub fn on_matched_event(&mut self, role: MatchRole, atom: &Atom, uid_map: &UidMap) {
        match (self, role) {
            (MetricProducer::Event(p), MatchRole::What) => p.on_matched_event(atom),
            (MetricProducer::Count(p), MatchRole::What) => p.on_matched_event(atom, uid_map),
            (MetricProducer::Duration(p), MatchRole::Start) => p.on_start(atom, uid_map),
            (MetricProducer::Duration(p), MatchRole::Stop) => p.on_stop(atom, uid_map),
            (MetricProducer::Duration(p), MatchRole::StopAll) => {
                p.on_stop_all(atom.elapsed_timestamp_ns())
            },
            (MetricProducer::Gauge(p), MatchRole::What) => p.on_matched_event(atom, uid_map),
            (MetricProducer::Value(p), MatchRole::What) => p.on_matched_event(atom, uid_map),
            _ => {},
        }
    }

    /// Delivers pulled atoms already filtered by the metric's `what` matcher.
    pub fn on_data_pulled(
        &mut self,
        atoms: &[Atom],
        request_ns: i64,
        delay: Duration,
        uid_map: &UidMap,
    ) {
        match self {
            MetricProducer::Gauge(p) => p.on_data_pulled(atoms, request_ns, delay, uid_map),
            MetricProducer::Value(p) => p.on_data_pulled(atoms, request_ns, uid_map),
            _ => {},
        }
    }

    pub fn on_pull_failed(&mut self, request_ns: i64, reason: &str) {
        match self {
            MetricProducer::Gauge(p) => p.on_pull_failed(request_ns, reason),
            MetricProducer::Value(p) => p.on_pull_failed(request_ns, reason),
            _ => {},
        }
    }

    pub fn on_condition_changed(&mut self, met: bool, elapsed_ns: i64) {
        match self {
            MetricProducer::Event(p) => p.on_condition_changed(met),
            MetricProducer::Count(p) => p.on_condition_changed(met, elapsed_ns),
            MetricProducer::Duration(p) => p.on_condition_changed(met, elapsed_ns),
            MetricProducer::Gauge(p) => p.on_condition_changed(met, elapsed_ns),
            MetricProducer::Value(p) => p.on_condition_changed(met, elapsed_ns),
        }
    }

    pub fn flush_if_needed(&mut self, elapsed_ns: i64) {
        match self {
            MetricProducer::Count(p) => p.flush_if_needed(elapsed_ns),
            MetricProducer::Gauge(p) => p.flush_if_needed(elapsed_ns),
            MetricProducer::Value(p) => p.flush_if_needed(elapsed_ns),
            MetricProducer::Event(_) | MetricProducer::Duration(_) => {},
        }
    }

    pub fn take_anomalies(&mut self) -> Vec<AnomalyEvent> {
        match self {
            MetricProducer::Count(p) => p.take_anomalies(),
            _ => Vec::new(),
        }
    }

    pub fn on_dump_report(&mut self, dump_ns: i64, clear: bool) -> ProducerDump {
        let (dimension_guardrail_hit, skipped) = match self {
            MetricProducer::Event(_) => (false, Vec::new()),
            MetricProducer::Count(p) => (p.guardrail_hit(), Vec::new()),
            MetricProducer::Duration(p) => (p.guardrail_hit(), Vec::new()),
            MetricProducer::Gauge(p) => (p.guardrail_hit(), p.skipped().to_vec()),
            MetricProducer::Value(p) => (p.guardrail_hit(), p.skipped().to_vec()),
        };
        let data = match self {
            MetricProducer::Event(p) => p.dump(clear),
            MetricProducer::Count(p) => p.dump(dump_ns, clear),
            MetricProducer::Duration(p) => p.dump(dump_ns, clear),
            MetricProducer::Gauge(p) => p.dump(dump_ns, clear),
            MetricProducer::Value(p) => p.dump(dump_ns, clear),
        };
        ProducerDump {
            data,
            dimension_guardrail_hit,
            skipped,
        }
    }

    /// Drops accumulated data without producing a report.
    pub fn clear(&mut self, elapsed_ns: i64) {
        match self {
            MetricProducer::Event(p) => p.clear(),
            MetricProducer::Count(p) => p.clear(),
            MetricProducer::Duration(p) => p.clear(elapsed_ns),
            MetricProducer::Gauge(p) => p.clear(),
            MetricProducer::Value(p) => p.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stats_config::DurationAggregation;
    use crate::matcher::FieldTarget;

    #[test]
    fn test_roles_outside_kind_are_ignored() {
        let uid_map = UidMap::default();
        let mut producer = MetricProducer::Count(CountProducer::new(
            1,
            vec![FieldTarget::Field(1)],
            BucketClock::new(0, 100),
            true,
            10,
        ));
        let atom = Atom::builder(42).timestamp_ns(5).string("a").build().unwrap();
        producer.on_matched_event(MatchRole::Start, &atom, &uid_map);
        producer.on_matched_event(MatchRole::What, &atom, &uid_map);
        let dump = producer.on_dump_report(10, false);
        let MetricData::Count(series) = dump.data else {
            panic!("Expected count data");
        };
        assert_eq!(series[0].buckets[0].count, 1);
    }

    #[test]
    fn test_duration_roles() {
        let uid_map = UidMap::default();
        let mut producer = MetricProducer::Duration(DurationProducer::new(
            1,
            Vec::new(),
            BucketClock::new(0, 1000),
            false,
            DurationAggregation::Sum,
            true,
            10,
        ));
        let at = |ts| {
            Atom::builder(47)
                .timestamp_ns(ts)
                .int(1)
                .int(1)
                .enumeration(2)
                .build()
                .unwrap()
        };
        producer.on_matched_event(MatchRole::Start, &at(10), &uid_map);
        producer.on_matched_event(MatchRole::What, &at(20), &uid_map);
        producer.on_matched_event(MatchRole::StopAll, &at(60), &uid_map);
        assert_eq!(producer.kind(), MetricKind::Duration);
        let dump = producer.on_dump_report(100, true);
        let MetricData::Duration(series) = dump.data else {
            panic!("Expected duration data");
        };
        assert_eq!(series[0].intervals[0].duration_ns, 50);
    }
}
