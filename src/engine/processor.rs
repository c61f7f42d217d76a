//! Per-config processing: one validated stats config turned into producers,
//! predicate trackers, activations and routing tables.
//!
//! A processor is only ever driven by one writer at a time (the engine keeps
//! it behind a mutex), so nothing in here synchronizes.

use crate::core::config::EngineConfig;
use crate::core::types::{Atom, ConfigKey};
use crate::engine::activation::ActivationTracker;
use crate::engine::predicate::PredicateTracker;
use crate::engine::stats_config::{StatsConfig, Subscription};
use crate::matcher::{self, MatcherSet, SimpleAtomMatcher};
use crate::metrics::{
    AnomalyTracker, BucketClock, CountProducer, DurationProducer, EventProducer, GaugeProducer,
    MatchRole, MetricProducer, ValueProducer,
};
use crate::puller::PullOutcome;
use crate::report::{ConfigMetricsReport, MetricReport};
use crate::schema::SchemaRegistry;
use crate::subscriber::AnomalyAlert;
use crate::uid_map::UidMap;
use ahash::AHashMap;
use std::time::Duration;

/// A pull a metric asked for while processing an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRequest {
    pub atom_tag: i32,
    pub metric_id: i64,
    pub request_ns: i64,
}

/// A periodic pull a metric needs, registered with the puller manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledPull {
    pub atom_tag: i32,
    pub metric_id: i64,
    pub next_pull_ns: i64,
    pub interval_ns: i64,
}

/// Side effects of one atom.
#[derive(Debug, Default)]
pub struct AtomOutcome {
    /// Whether any matcher of the config fired.
    pub matched: bool,
    /// Anomalies declared, whether or not anyone subscribed to them.
    pub anomalies: usize,
    pub pull_requests: Vec<PullRequest>,
    pub alerts: Vec<(Subscription, AnomalyAlert)>,
}

#[derive(Debug)]
struct MetricSlot {
    id: i64,
    producer: MetricProducer,
    bucket_size_ns: i64,
    activation: Option<ActivationTracker>,
    /// Filter applied to pulled atoms.
    pull_filter: Option<SimpleAtomMatcher>,
}

impl MetricSlot {
    fn is_active(&self, elapsed_ns: i64) -> bool {
        self.activation
            .as_ref()
            .map_or(true, |activation| activation.is_active(elapsed_ns))
    }
}

#[derive(Debug)]
pub struct ConfigProcessor {
    key: ConfigKey,
    generation: u64,
    time_base_ns: i64,
    matchers: MatcherSet,
    metrics: Vec<MetricSlot>,
    metric_index: AHashMap<i64, usize>,
    /// Matcher id → metrics that consume it and in which role.
    routes: AHashMap<i64, Vec<(usize, MatchRole)>>,
    /// Matcher id → metrics whose pull it triggers.
    pull_triggers: AHashMap<i64, Vec<usize>>,
    predicates: Vec<PredicateTracker>,
    /// Predicate index → metrics gated by it.
    condition_links: Vec<Vec<usize>>,
    subscriptions: Vec<Subscription>,
    scheduled_pulls: Vec<ScheduledPull>,
}

pub(crate) fn duration_ns(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

impl ConfigProcessor {
    /// Builds a processor for an already validated config.
    pub fn new(
        key: ConfigKey,
        generation: u64,
        config: &StatsConfig,
        matchers: MatcherSet,
        schemas: &SchemaRegistry,
        settings: &EngineConfig,
        time_base_ns: i64,
    ) -> Self {
        let mut processor = Self {
            key,
            generation,
            time_base_ns,
            matchers,
            metrics: Vec::with_capacity(config.metric_count()),
            metric_index: AHashMap::new(),
            routes: AHashMap::new(),
            pull_triggers: AHashMap::new(),
            predicates: config
                .predicates
                .iter()
                .cloned()
                .map(PredicateTracker::new)
                .collect(),
            condition_links: vec![Vec::new(); config.predicates.len()],
            subscriptions: config.subscriptions.clone(),
            scheduled_pulls: Vec::new(),
        };
        processor.build_metrics(config, schemas, settings);
        processor.attach_activations(config);
        processor.attach_alerts(config);
        tracing::debug!(
            "Config {} built: {} metrics, {} predicates, {} matchers",
            key,
            processor.metrics.len(),
            processor.predicates.len(),
            processor.matchers.len()
        );
        processor
    }

    fn build_metrics(
        &mut self,
        config: &StatsConfig,
        schemas: &SchemaRegistry,
        settings: &EngineConfig,
    ) {
        let max_dims = settings.max_dimensions_per_metric;
        let time_base_ns = self.time_base_ns;
        let clock_for = |bucket: Option<Duration>| {
            let size = duration_ns(bucket.unwrap_or(settings.default_bucket_size));
            BucketClock::new(time_base_ns, size)
        };

        for m in &config.event_metrics {
            let met = self.initial_condition(m.condition);
            let producer = MetricProducer::Event(EventProducer::new(met));
            let slot = self.push_metric(m.id, producer, 0, None, m.condition);
            self.route(m.what, slot, MatchRole::What);
        }

        for m in &config.count_metrics {
            let clock = clock_for(m.bucket);
            let size = clock.bucket_size_ns();
            let met = self.initial_condition(m.condition);
            let producer = MetricProducer::Count(CountProducer::new(
                m.id,
                m.dimensions_in_what.clone(),
                clock,
                met,
                max_dims,
            ));
            let slot = self.push_metric(m.id, producer, size, None, m.condition);
            self.route(m.what, slot, MatchRole::What);
        }

        for m in &config.duration_metrics {
            let clock = clock_for(m.bucket);
            let size = clock.bucket_size_ns();
            let met = self.initial_condition(m.condition);
            let producer = MetricProducer::Duration(DurationProducer::new(
                m.id,
                m.dimensions_in_what.clone(),
                clock,
                m.nesting,
                m.aggregation,
                met,
                max_dims,
            ));
            let slot = self.push_metric(m.id, producer, size, None, m.condition);
            self.route(m.start, slot, MatchRole::Start);
            self.route(m.stop, slot, MatchRole::Stop);
            if let Some(stop_all) = m.stop_all {
                self.route(stop_all, slot, MatchRole::StopAll);
            }
        }

        for m in &config.gauge_metrics {
            let clock = clock_for(m.bucket);
            let size = clock.bucket_size_ns();
            let met = self.initial_condition(m.condition);
            let producer = MetricProducer::Gauge(GaugeProducer::new(
                m.id,
                m.dimensions_in_what.clone(),
                clock,
                m.sampling,
                m.max_pull_delay,
                met,
                max_dims,
            ));
            let filter = self.matchers.simple(m.what).cloned();
            let slot = self.push_metric(m.id, producer, size, filter, m.condition);
            self.wire_sampled(slot, m.what, m.trigger_event, schemas);
        }

        for m in &config.value_metrics {
            let clock = clock_for(m.bucket);
            let size = clock.bucket_size_ns();
            let met = self.initial_condition(m.condition);
            let producer = MetricProducer::Value(ValueProducer::new(
                m.id,
                m.value_field,
                m.use_diff,
                m.dimensions_in_what.clone(),
                clock,
                met,
                max_dims,
            ));
            let filter = self.matchers.simple(m.what).cloned();
            let slot = self.push_metric(m.id, producer, size, filter, m.condition);
            self.wire_sampled(slot, m.what, m.trigger_event, schemas);
        }

        self.metric_index = self
            .metrics
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.id, i))
            .collect();
    }

    /// Gauge and value metrics sample pushed atoms directly. A pulled `what`
    /// atom is fetched on the trigger matcher, or at every bucket boundary
    /// when there is none.
    fn wire_sampled(
        &mut self,
        slot: usize,
        what: i64,
        trigger: Option<i64>,
        schemas: &SchemaRegistry,
    ) {
        self.route(what, slot, MatchRole::What);
        let pulled_atom = self
            .matchers
            .simple(what)
            .map(|s| s.atom_id)
            .filter(|atom_id| schemas.get(*atom_id).is_some_and(|s| s.pulled));
        let Some(atom_tag) = pulled_atom else {
            return;
        };
        match trigger {
            Some(trigger) => self.pull_triggers.entry(trigger).or_default().push(slot),
            None => {
                let interval_ns = self.metrics[slot].bucket_size_ns;
                self.scheduled_pulls.push(ScheduledPull {
                    atom_tag,
                    metric_id: self.metrics[slot].id,
                    next_pull_ns: self.time_base_ns.saturating_add(interval_ns),
                    interval_ns,
                });
            },
        }
    }

    fn initial_condition(&self, condition: Option<i64>) -> bool {
        condition.map_or(true, |id| {
            self.predicates
                .iter()
                .find(|p| p.id() == id)
                .is_some_and(|p| p.is_met())
        })
    }

    fn push_metric(
        &mut self,
        id: i64,
        producer: MetricProducer,
        bucket_size_ns: i64,
        pull_filter: Option<SimpleAtomMatcher>,
        condition: Option<i64>,
    ) -> usize {
        let slot = self.metrics.len();
        self.metrics.push(MetricSlot {
            id,
            producer,
            bucket_size_ns,
            activation: None,
            pull_filter,
        });
        if let Some(predicate) = condition {
            if let Some(p) = self.predicates.iter().position(|p| p.id() == predicate) {
                self.condition_links[p].push(slot);
            }
        }
        slot
    }

    fn route(&mut self, matcher_id: i64, slot: usize, role: MatchRole) {
        self.routes.entry(matcher_id).or_default().push((slot, role));
    }

    fn attach_activations(&mut self, config: &StatsConfig) {
        for activation in &config.metric_activations {
            if let Some(&slot) = self.metric_index.get(&activation.metric_id) {
                self.metrics[slot].activation = Some(ActivationTracker::new(activation));
            }
        }
    }

    fn attach_alerts(&mut self, config: &StatsConfig) {
        for alert in &config.alerts {
            let Some(&slot) = self.metric_index.get(&alert.metric_id) else {
                continue;
            };
            if let MetricProducer::Count(count) = &mut self.metrics[slot].producer {
                count.add_anomaly_tracker(AnomalyTracker::new(alert.clone()));
            }
        }
    }

    pub fn key(&self) -> ConfigKey {
        self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn time_base_ns(&self) -> i64 {
        self.time_base_ns
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// Periodic pulls this config needs scheduled.
    pub fn scheduled_pulls(&self) -> &[ScheduledPull] {
        &self.scheduled_pulls
    }

    /// Processes one atom: activations first, then predicates, then pull
    /// triggers, then routing to producers.
    pub fn on_atom(&mut self, atom: &Atom, uid_map: &UidMap) -> AtomOutcome {
        let results = self.matchers.evaluate(atom);
        if results.is_empty() {
            return AtomOutcome::default();
        }
        let ts = atom.elapsed_timestamp_ns();

        for slot in &mut self.metrics {
            if let Some(activation) = &mut slot.activation {
                activation.on_matched(&results, ts);
            }
        }

        for (p, predicate) in self.predicates.iter_mut().enumerate() {
            if let Some(met) = predicate.on_matched(&results) {
                tracing::trace!("Predicate {} is now {}", predicate.id(), met);
                for &slot in &self.condition_links[p] {
                    self.metrics[slot].producer.on_condition_changed(met, ts);
                }
            }
        }

        let mut outcome = AtomOutcome {
            matched: true,
            ..AtomOutcome::default()
        };
        let mut routed: Vec<(usize, MatchRole)> = Vec::new();
        for &matcher_id in results.fired() {
            if let Some(targets) = self.routes.get(&matcher_id) {
                for &(slot, role) in targets {
                    match routed.iter_mut().find(|(s, _)| *s == slot) {
                        Some(entry) if role.precedence() > entry.1.precedence() => entry.1 = role,
                        Some(_) => {},
                        None => routed.push((slot, role)),
                    }
                }
            }
            if let Some(targets) = self.pull_triggers.get(&matcher_id) {
                for &slot in targets {
                    let metric = &self.metrics[slot];
                    let Some(filter) = &metric.pull_filter else {
                        continue;
                    };
                    if metric.is_active(ts) {
                        outcome.pull_requests.push(PullRequest {
                            atom_tag: filter.atom_id,
                            metric_id: metric.id,
                            request_ns: ts,
                        });
                    }
                }
            }
        }

        for (slot, role) in routed {
            let metric = &mut self.metrics[slot];
            if metric.is_active(ts) {
                metric.producer.on_matched_event(role, atom, uid_map);
            }
        }

        self.collect_alerts(&mut outcome);
        outcome
    }

    fn collect_alerts(&mut self, outcome: &mut AtomOutcome) {
        for slot in &mut self.metrics {
            for event in slot.producer.take_anomalies() {
                outcome.anomalies += 1;
                for subscription in self
                    .subscriptions
                    .iter()
                    .filter(|s| s.rule_id == event.alert_id)
                {
                    let alert = AnomalyAlert::new(self.key, subscription, &event);
                    outcome.alerts.push((subscription.clone(), alert));
                }
            }
        }
    }

    /// Delivers a completed (or failed) pull to a metric. Returns false when
    /// the metric does not exist in this config.
    pub fn on_pull_result(
        &mut self,
        metric_id: i64,
        request_ns: i64,
        delay: Duration,
        outcome: &PullOutcome,
        uid_map: &UidMap,
    ) -> bool {
        let Some(&slot) = self.metric_index.get(&metric_id) else {
            return false;
        };
        let metric = &mut self.metrics[slot];
        if !metric.is_active(request_ns) {
            return true;
        }
        match outcome {
            PullOutcome::Success(atoms) => {
                let accepted: Vec<Atom> = match &metric.pull_filter {
                    Some(filter) => atoms
                        .iter()
                        .filter(|atom| matcher::matches(filter, atom))
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                };
                metric
                    .producer
                    .on_data_pulled(&accepted, request_ns, delay, uid_map);
            },
            PullOutcome::Failed(failure) => {
                metric
                    .producer
                    .on_pull_failed(request_ns, &failure.to_string());
            },
        }
        true
    }

    /// Snapshots every metric. With `clear`, reported data is dropped in the
    /// same critical section.
    pub fn dump(&mut self, dump_ns: i64, clear: bool) -> ConfigMetricsReport {
        let metrics = self
            .metrics
            .iter_mut()
            .map(|slot| {
                let is_active = slot.is_active(dump_ns);
                let dump = slot.producer.on_dump_report(dump_ns, clear);
                MetricReport {
                    metric_id: slot.id,
                    bucket_size_ns: slot.bucket_size_ns,
                    is_active,
                    dimension_guardrail_hit: dump.dimension_guardrail_hit,
                    skipped: dump.skipped,
                    data: dump.data,
                }
            })
            .collect();
        ConfigMetricsReport {
            config_key: self.key,
            time_base_elapsed_ns: self.time_base_ns,
            dump_elapsed_ns: dump_ns,
            metrics,
        }
    }

    /// Drops all accumulated data without reporting it.
    pub fn clear(&mut self, elapsed_ns: i64) {
        for slot in &mut self.metrics {
            slot.producer.clear(elapsed_ns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stats_config::{
        CountMetric, DurationMetric, EventActivation, EventMetric, GaugeMetric, MetricActivation,
        Predicate,
    };
    use crate::matcher::{AtomMatcher, FieldTarget, FieldValueMatcher};
    use crate::puller::PullFailure;
    use crate::report::MetricData;
    use crate::schema::{atom_ids, breadcrumb};

    const SEC: i64 = 1_000_000_000;

    fn build(config: &StatsConfig) -> ConfigProcessor {
        let schemas = SchemaRegistry::with_builtin_atoms();
        let matchers = config.validate(&schemas).unwrap();
        ConfigProcessor::new(
            ConfigKey::new(1000, 1),
            1,
            config,
            matchers,
            &schemas,
            &EngineConfig::default(),
            0,
        )
    }

    fn crumb(ts: i64, label: i32, state: i32) -> Atom {
        Atom::builder(atom_ids::APP_BREADCRUMB_REPORTED)
            .timestamp_ns(ts)
            .int(1000)
            .int(label)
            .enumeration(state)
            .build()
            .unwrap()
    }

    fn breadcrumb_matchers() -> Vec<AtomMatcher> {
        vec![
            AtomMatcher::simple(1, atom_ids::APP_BREADCRUMB_REPORTED),
            AtomMatcher::simple(2, atom_ids::APP_BREADCRUMB_REPORTED).with_field(
                FieldValueMatcher::eq_int(breadcrumb::STATE_FIELD, breadcrumb::STATE_START.into()),
            ),
            AtomMatcher::simple(3, atom_ids::APP_BREADCRUMB_REPORTED).with_field(
                FieldValueMatcher::eq_int(breadcrumb::STATE_FIELD, breadcrumb::STATE_STOP.into()),
            ),
        ]
    }

    #[test]
    fn test_unmatched_atom_has_no_effect() {
        let config = StatsConfig {
            atom_matchers: breadcrumb_matchers(),
            event_metrics: vec![EventMetric {
                id: 10,
                what: 1,
                condition: None,
            }],
            ..StatsConfig::default()
        };
        let mut processor = build(&config);
        let other = Atom::builder(atom_ids::CAMERA_STATE_CHANGED).build().unwrap();
        assert!(!processor.on_atom(&other, &UidMap::default()).matched);
        assert!(processor.on_atom(&crumb(5, 1, 0), &UidMap::default()).matched);

        let report = processor.dump(10, false);
        assert_eq!(report.metric(10).unwrap().data_len(), 1);
    }

    #[test]
    fn test_condition_gates_count() {
        let config = StatsConfig {
            atom_matchers: breadcrumb_matchers(),
            predicates: vec![Predicate::new(50, 2, 3)],
            count_metrics: vec![CountMetric {
                condition: Some(50),
                dimensions_in_what: vec![FieldTarget::Field(breadcrumb::LABEL_FIELD)],
                ..CountMetric::new(10, 1)
            }],
            ..StatsConfig::default()
        };
        let uid_map = UidMap::default();
        let mut processor = build(&config);
        processor.on_atom(&crumb(1, 101, 0), &uid_map);
        processor.on_atom(&crumb(2, 102, 2), &uid_map);
        processor.on_atom(&crumb(3, 103, 0), &uid_map);
        processor.on_atom(&crumb(4, 104, 1), &uid_map);
        processor.on_atom(&crumb(5, 105, 0), &uid_map);

        let totals = processor.dump(SEC, false).metric(10).unwrap().count_totals();
        // The start atom turns the condition on before it is routed.
        assert_eq!(totals.keys().cloned().collect::<Vec<_>>(), vec!["102", "103"]);
    }

    #[test]
    fn test_duration_start_wins_over_stop() {
        let any_crumb = AtomMatcher::simple(1, atom_ids::APP_BREADCRUMB_REPORTED);
        let stopped = AtomMatcher::simple(3, atom_ids::APP_BREADCRUMB_REPORTED).with_field(
            FieldValueMatcher::eq_int(breadcrumb::STATE_FIELD, breadcrumb::STATE_STOP.into()),
        );
        for atom_matchers in [
            vec![any_crumb.clone(), stopped.clone()],
            vec![stopped.clone(), any_crumb.clone()],
        ] {
            let config = StatsConfig {
                atom_matchers,
                duration_metrics: vec![DurationMetric::new(20, 1, 3)],
                ..StatsConfig::default()
            };
            let uid_map = UidMap::default();
            let mut processor = build(&config);
            processor.on_atom(&crumb(0, 1, breadcrumb::STATE_START), &uid_map);
            // Fires both start and stop; the interval stays open.
            processor.on_atom(&crumb(SEC / 4, 1, breadcrumb::STATE_STOP), &uid_map);

            let intervals = processor.dump(SEC / 2, false).metric(20).unwrap().duration_intervals();
            assert_eq!(intervals.len(), 1);
            assert_eq!((intervals[0].start_ns, intervals[0].end_ns), (0, SEC / 2));
        }
    }

    #[test]
    fn test_activation_counts_arming_atom() {
        let config = StatsConfig {
            atom_matchers: breadcrumb_matchers(),
            count_metrics: vec![CountMetric::new(10, 1)],
            metric_activations: vec![MetricActivation {
                metric_id: 10,
                event_activations: vec![EventActivation {
                    atom_matcher_id: 2,
                    ttl: None,
                    deactivation_atom_matcher_id: Some(3),
                }],
            }],
            ..StatsConfig::default()
        };
        let uid_map = UidMap::default();
        let mut processor = build(&config);
        processor.on_atom(&crumb(1, 1, 0), &uid_map);
        assert!(!processor.dump(2, false).metric(10).unwrap().is_active);

        processor.on_atom(&crumb(3, 1, 2), &uid_map);
        processor.on_atom(&crumb(4, 1, 0), &uid_map);
        processor.on_atom(&crumb(5, 1, 1), &uid_map);
        processor.on_atom(&crumb(6, 1, 0), &uid_map);

        let report = processor.dump(SEC, false);
        let metric = report.metric(10).unwrap();
        assert!(!metric.is_active);
        assert_eq!(metric.count_totals().values().sum::<i64>(), 2);
    }

    #[test]
    fn test_gauge_trigger_requests_pull() {
        let config = StatsConfig {
            atom_matchers: vec![
                AtomMatcher::simple(1, atom_ids::APP_BREADCRUMB_REPORTED),
                AtomMatcher::simple(4, atom_ids::PROCESS_MEMORY_STATE),
            ],
            gauge_metrics: vec![GaugeMetric {
                trigger_event: Some(1),
                ..GaugeMetric::new(20, 4)
            }],
            ..StatsConfig::default()
        };
        let uid_map = UidMap::default();
        let mut processor = build(&config);
        let outcome = processor.on_atom(&crumb(7, 1, 0), &uid_map);
        assert_eq!(
            outcome.pull_requests,
            vec![PullRequest {
                atom_tag: atom_ids::PROCESS_MEMORY_STATE,
                metric_id: 20,
                request_ns: 7,
            }]
        );
        assert!(processor.scheduled_pulls().is_empty());

        let pulled = vec![
            Atom::builder(atom_ids::PROCESS_MEMORY_STATE)
                .timestamp_ns(7)
                .int(1000)
                .string("proc")
                .long(0)
                .long(0)
                .long(4096)
                .build()
                .unwrap(),
            crumb(7, 1, 0),
        ];
        assert!(processor.on_pull_result(
            20,
            7,
            Duration::ZERO,
            &PullOutcome::Success(pulled),
            &uid_map
        ));
        processor.on_pull_result(
            20,
            8,
            Duration::ZERO,
            &PullOutcome::Failed(PullFailure::Timeout),
            &uid_map,
        );
        assert!(!processor.on_pull_result(
            99,
            8,
            Duration::ZERO,
            &PullOutcome::Failed(PullFailure::Timeout),
            &uid_map
        ));

        let report = processor.dump(SEC, true);
        let metric = report.metric(20).unwrap();
        let MetricData::Gauge(series) = &metric.data else {
            panic!("Expected gauge data");
        };
        assert_eq!(series[0].buckets[0].samples.len(), 1);
        assert_eq!(metric.skipped.len(), 1);
        assert_eq!(metric.skipped[0].reason, "pull timed out");
    }

    #[test]
    fn test_untriggered_pulled_gauge_is_scheduled() {
        let config = StatsConfig {
            atom_matchers: vec![AtomMatcher::simple(4, atom_ids::CPU_TIME_PER_UID)],
            gauge_metrics: vec![GaugeMetric {
                bucket: Some(Duration::from_secs(60)),
                ..GaugeMetric::new(20, 4)
            }],
            ..StatsConfig::default()
        };
        let processor = build(&config);
        assert_eq!(
            processor.scheduled_pulls(),
            &[ScheduledPull {
                atom_tag: atom_ids::CPU_TIME_PER_UID,
                metric_id: 20,
                next_pull_ns: 60 * SEC,
                interval_ns: 60 * SEC,
            }]
        );
    }
}
