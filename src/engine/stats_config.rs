//! The stats config document: matchers, predicates, metric definitions,
//! activations, alerts and subscriptions, plus upload-time validation.
//!
//! Everything references everything else by integer id within one config.
//! [`StatsConfig::validate`] resolves every reference against the config and
//! every field position against the [`SchemaRegistry`], so evaluation never
//! meets a dangling id or an undeclared field.

use crate::core::error::ConfigError;
use crate::core::types::FieldType;
use crate::matcher::{AtomMatcher, FieldTarget, MatcherKind, MatcherSet};
use crate::schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Largest accepted bucket size. Keeps bucket boundaries far from `i64` overflow.
pub const MAX_BUCKET_SIZE: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Projection used to slice a metric into dimension series.
pub type Dimension = FieldTarget;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub atom_matchers: Vec<AtomMatcher>,
    pub predicates: Vec<Predicate>,
    pub event_metrics: Vec<EventMetric>,
    pub count_metrics: Vec<CountMetric>,
    pub duration_metrics: Vec<DurationMetric>,
    pub gauge_metrics: Vec<GaugeMetric>,
    pub value_metrics: Vec<ValueMetric>,
    pub metric_activations: Vec<MetricActivation>,
    pub alerts: Vec<Alert>,
    pub subscriptions: Vec<Subscription>,
}

/// Initial truth value of a predicate before its first start/stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialValue {
    #[default]
    False,
    Unknown,
}

/// A boolean condition driven by start/stop matchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub id: i64,
    pub start: Option<i64>,
    pub stop: Option<i64>,
    #[serde(default)]
    pub stop_all: Option<i64>,
    #[serde(default = "default_true")]
    pub count_nesting: bool,
    #[serde(default)]
    pub initial_value: InitialValue,
}

impl Predicate {
    pub fn new(id: i64, start: i64, stop: i64) -> Self {
        Self {
            id,
            start: Some(start),
            stop: Some(stop),
            stop_all: None,
            count_nesting: true,
            initial_value: InitialValue::False,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetric {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountMetric {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<Dimension>,
    #[serde(default, with = "humantime_serde")]
    pub bucket: Option<Duration>,
}

impl CountMetric {
    pub fn new(id: i64, what: i64) -> Self {
        Self {
            id,
            what,
            condition: None,
            dimensions_in_what: Vec::new(),
            bucket: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationMetric {
    pub id: i64,
    pub start: i64,
    pub stop: i64,
    #[serde(default)]
    pub stop_all: Option<i64>,
    /// Count nested starts and close only when every start has been stopped.
    #[serde(default)]
    pub nesting: bool,
    #[serde(default)]
    pub aggregation: DurationAggregation,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<Dimension>,
    #[serde(default, with = "humantime_serde")]
    pub bucket: Option<Duration>,
}

impl DurationMetric {
    pub fn new(id: i64, start: i64, stop: i64) -> Self {
        Self {
            id,
            start,
            stop,
            stop_all: None,
            nesting: false,
            aggregation: DurationAggregation::Sum,
            condition: None,
            dimensions_in_what: Vec::new(),
            bucket: None,
        }
    }
}

/// How a duration metric summarizes each bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationAggregation {
    #[default]
    Sum,
    /// Longest single interval in the bucket.
    MaxSparse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeSampling {
    #[default]
    AllSamples,
    FirstNSamples(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeMetric {
    pub id: i64,
    pub what: i64,
    /// Matcher whose firing requests a pull. Without one the metric is
    /// sampled by the periodic pull alarm at each bucket boundary.
    #[serde(default)]
    pub trigger_event: Option<i64>,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<Dimension>,
    #[serde(default)]
    pub sampling: GaugeSampling,
    #[serde(default, with = "humantime_serde")]
    pub bucket: Option<Duration>,
    /// Pulls that complete later than this after their trigger are discarded.
    #[serde(default, with = "humantime_serde")]
    pub max_pull_delay: Option<Duration>,
}

impl GaugeMetric {
    pub fn new(id: i64, what: i64) -> Self {
        Self {
            id,
            what,
            trigger_event: None,
            condition: None,
            dimensions_in_what: Vec::new(),
            sampling: GaugeSampling::AllSamples,
            bucket: None,
            max_pull_delay: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMetric {
    pub id: i64,
    pub what: i64,
    /// Numeric field summed per bucket.
    pub value_field: u32,
    /// Report the change since the previous pull instead of the raw value.
    #[serde(default)]
    pub use_diff: bool,
    #[serde(default)]
    pub trigger_event: Option<i64>,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<Dimension>,
    #[serde(default, with = "humantime_serde")]
    pub bucket: Option<Duration>,
}

impl ValueMetric {
    pub fn new(id: i64, what: i64, value_field: u32) -> Self {
        Self {
            id,
            what,
            value_field,
            use_diff: false,
            trigger_event: None,
            condition: None,
            dimensions_in_what: Vec::new(),
            bucket: None,
        }
    }
}

/// One way to arm a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventActivation {
    pub atom_matcher_id: i64,
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub deactivation_atom_matcher_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricActivation {
    pub metric_id: i64,
    pub event_activations: Vec<EventActivation>,
}

/// Anomaly rule on a count metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub metric_id: i64,
    pub num_buckets: u32,
    pub trigger_if_sum_gt: i64,
    #[serde(default, with = "humantime_serde")]
    pub refractory_period: Option<Duration>,
}

/// Routes an alert to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub rule_id: i64,
    pub subscriber_id: i64,
}

fn default_true() -> bool {
    true
}

/// Metric kinds, used in messages and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Event,
    Count,
    Duration,
    Gauge,
    Value,
}

impl StatsConfig {
    /// Parses a YAML (or JSON, which is a YAML subset) config document.
    pub fn from_yaml(text: &str) -> crate::core::Result<Self> {
        crate::core::config::parse_yaml(text).map_err(|e| {
            crate::core::AtomdError::parse(format!("Failed to parse stats config: {}", e))
        })
    }

    pub fn metric_count(&self) -> usize {
        self.event_metrics.len()
            + self.count_metrics.len()
            + self.duration_metrics.len()
            + self.gauge_metrics.len()
            + self.value_metrics.len()
    }

    /// Kind of the metric with this id, if declared.
    pub fn metric_kind(&self, metric_id: i64) -> Option<MetricKind> {
        if self.event_metrics.iter().any(|m| m.id == metric_id) {
            Some(MetricKind::Event)
        } else if self.count_metrics.iter().any(|m| m.id == metric_id) {
            Some(MetricKind::Count)
        } else if self.duration_metrics.iter().any(|m| m.id == metric_id) {
            Some(MetricKind::Duration)
        } else if self.gauge_metrics.iter().any(|m| m.id == metric_id) {
            Some(MetricKind::Gauge)
        } else if self.value_metrics.iter().any(|m| m.id == metric_id) {
            Some(MetricKind::Value)
        } else {
            None
        }
    }

    /// Checks every reference and field position. Returns the compiled
    /// matcher set on success.
    pub fn validate(&self, schemas: &SchemaRegistry) -> std::result::Result<MatcherSet, ConfigError> {
        let matchers = MatcherSet::new(&self.atom_matchers)?;
        for matcher in &self.atom_matchers {
            validate_matcher_fields(matcher, schemas)?;
        }

        let mut predicate_ids = HashSet::new();
        for p in &self.predicates {
            if !predicate_ids.insert(p.id) {
                return Err(ConfigError::DuplicatePredicateId(p.id));
            }
            let owner = format!("predicate {}", p.id);
            for id in [p.start, p.stop, p.stop_all].into_iter().flatten() {
                require_matcher(&matchers, &owner, id)?;
            }
        }

        let mut metric_ids = HashSet::new();
        let mut check = Checker {
            matchers: &matchers,
            predicates: &predicate_ids,
            schemas,
        };

        for m in &self.event_metrics {
            insert_metric_id(&mut metric_ids, m.id)?;
            check.what(m.id, m.what, &[])?;
            check.condition(m.id, m.condition)?;
        }
        for m in &self.count_metrics {
            insert_metric_id(&mut metric_ids, m.id)?;
            check.what(m.id, m.what, &m.dimensions_in_what)?;
            check.condition(m.id, m.condition)?;
            check.bucket(m.id, m.bucket)?;
        }
        for m in &self.duration_metrics {
            insert_metric_id(&mut metric_ids, m.id)?;
            check.what(m.id, m.start, &m.dimensions_in_what)?;
            check.what(m.id, m.stop, &m.dimensions_in_what)?;
            if let Some(stop_all) = m.stop_all {
                require_matcher(&matchers, &format!("metric {}", m.id), stop_all)?;
            }
            check.condition(m.id, m.condition)?;
            check.bucket(m.id, m.bucket)?;
        }
        for m in &self.gauge_metrics {
            insert_metric_id(&mut metric_ids, m.id)?;
            check.simple_what(m.id, m.what, &m.dimensions_in_what)?;
            if let Some(trigger) = m.trigger_event {
                require_matcher(&matchers, &format!("metric {}", m.id), trigger)?;
            }
            if let GaugeSampling::FirstNSamples(0) = m.sampling {
                return Err(ConfigError::InvalidMetric {
                    metric_id: m.id,
                    reason: "first_n_samples must be at least 1".to_string(),
                });
            }
            check.condition(m.id, m.condition)?;
            check.bucket(m.id, m.bucket)?;
        }
        for m in &self.value_metrics {
            insert_metric_id(&mut metric_ids, m.id)?;
            let atom_id = check.simple_what(m.id, m.what, &m.dimensions_in_what)?;
            let declared = schemas.get(atom_id).and_then(|s| s.field_type(m.value_field));
            match declared {
                Some(t) if t.is_integral() || t == FieldType::Float => {},
                Some(t) => {
                    return Err(ConfigError::InvalidMetric {
                        metric_id: m.id,
                        reason: format!("value field {} is {}, not numeric", m.value_field, t.as_str()),
                    })
                },
                None => {
                    return Err(ConfigError::FieldOutOfRange {
                        matcher_id: m.what,
                        atom_id,
                        position: m.value_field,
                    })
                },
            }
            if let Some(trigger) = m.trigger_event {
                require_matcher(&matchers, &format!("metric {}", m.id), trigger)?;
            }
            check.condition(m.id, m.condition)?;
            check.bucket(m.id, m.bucket)?;
        }

        let mut activated = HashSet::new();
        for activation in &self.metric_activations {
            let owner = format!("activation of metric {}", activation.metric_id);
            if !metric_ids.contains(&activation.metric_id) {
                return Err(ConfigError::DanglingReference {
                    owner,
                    kind: "metric",
                    target: activation.metric_id,
                });
            }
            if !activated.insert(activation.metric_id) {
                return Err(ConfigError::InvalidMetric {
                    metric_id: activation.metric_id,
                    reason: "metric has more than one activation".to_string(),
                });
            }
            if activation.event_activations.is_empty() {
                return Err(ConfigError::InvalidMetric {
                    metric_id: activation.metric_id,
                    reason: "activation has no event activations".to_string(),
                });
            }
            for event in &activation.event_activations {
                require_matcher(&matchers, &owner, event.atom_matcher_id)?;
                if let Some(deactivation) = event.deactivation_atom_matcher_id {
                    require_matcher(&matchers, &owner, deactivation)?;
                }
            }
        }

        let mut alert_ids = HashSet::new();
        for alert in &self.alerts {
            if !alert_ids.insert(alert.id) {
                return Err(ConfigError::DuplicateAlertId(alert.id));
            }
            match self.metric_kind(alert.metric_id) {
                Some(MetricKind::Count) => {},
                Some(other) => {
                    return Err(ConfigError::InvalidAlert {
                        alert_id: alert.id,
                        reason: format!("alerts apply to count metrics, not {:?}", other),
                    })
                },
                None => {
                    return Err(ConfigError::DanglingReference {
                        owner: format!("alert {}", alert.id),
                        kind: "metric",
                        target: alert.metric_id,
                    })
                },
            }
            if alert.num_buckets == 0 {
                return Err(ConfigError::InvalidAlert {
                    alert_id: alert.id,
                    reason: "num_buckets must be at least 1".to_string(),
                });
            }
        }

        for subscription in &self.subscriptions {
            if !alert_ids.contains(&subscription.rule_id) {
                return Err(ConfigError::DanglingReference {
                    owner: format!("subscription {}", subscription.id),
                    kind: "alert",
                    target: subscription.rule_id,
                });
            }
        }

        Ok(matchers)
    }
}

fn insert_metric_id(ids: &mut HashSet<i64>, id: i64) -> std::result::Result<(), ConfigError> {
    if ids.insert(id) {
        Ok(())
    } else {
        Err(ConfigError::DuplicateMetricId(id))
    }
}

fn require_matcher(
    matchers: &MatcherSet,
    owner: &str,
    id: i64,
) -> std::result::Result<(), ConfigError> {
    if matchers.contains(id) {
        Ok(())
    } else {
        Err(ConfigError::DanglingReference {
            owner: owner.to_string(),
            kind: "matcher",
            target: id,
        })
    }
}

fn validate_matcher_fields(
    matcher: &AtomMatcher,
    schemas: &SchemaRegistry,
) -> std::result::Result<(), ConfigError> {
    let MatcherKind::Simple(simple) = &matcher.kind else {
        return Ok(());
    };
    let schema = schemas.get(simple.atom_id).ok_or(ConfigError::UnknownAtomId {
        matcher_id: matcher.id,
        atom_id: simple.atom_id,
    })?;

    for constraint in &simple.field_value_matchers {
        let (position, declared) = match constraint.target {
            FieldTarget::Field(position) => {
                let declared = schema.field_type(position).ok_or(ConfigError::FieldOutOfRange {
                    matcher_id: matcher.id,
                    atom_id: simple.atom_id,
                    position,
                })?;
                (position, declared)
            },
            FieldTarget::AttributionUid(_) | FieldTarget::AttributionTag(_)
                if !schema.attribution_chain =>
            {
                return Err(ConfigError::NoAttributionChain {
                    matcher_id: matcher.id,
                    atom_id: simple.atom_id,
                });
            },
            FieldTarget::AttributionUid(_) => (0, FieldType::Int),
            FieldTarget::AttributionTag(_) => (0, FieldType::String),
        };
        constraint
            .op
            .check_against(declared)
            .map_err(|found| ConfigError::FieldTypeMismatch {
                matcher_id: matcher.id,
                position,
                declared: declared.as_str(),
                found,
            })?;
    }
    Ok(())
}

struct Checker<'a> {
    matchers: &'a MatcherSet,
    predicates: &'a HashSet<i64>,
    schemas: &'a SchemaRegistry,
}

impl Checker<'_> {
    fn what(
        &mut self,
        metric_id: i64,
        matcher_id: i64,
        dimensions: &[Dimension],
    ) -> std::result::Result<(), ConfigError> {
        require_matcher(self.matchers, &format!("metric {}", metric_id), matcher_id)?;
        for atom_id in self.matchers.atom_ids_of(matcher_id) {
            self.dimensions(matcher_id, atom_id, dimensions)?;
        }
        Ok(())
    }

    /// Gauge and value metrics read a single atom type.
    fn simple_what(
        &mut self,
        metric_id: i64,
        matcher_id: i64,
        dimensions: &[Dimension],
    ) -> std::result::Result<i32, ConfigError> {
        self.what(metric_id, matcher_id, dimensions)?;
        self.matchers
            .simple(matcher_id)
            .map(|simple| simple.atom_id)
            .ok_or_else(|| ConfigError::InvalidMetric {
                metric_id,
                reason: format!("what matcher {} must be a simple matcher", matcher_id),
            })
    }

    fn dimensions(
        &self,
        matcher_id: i64,
        atom_id: i32,
        dimensions: &[Dimension],
    ) -> std::result::Result<(), ConfigError> {
        let Some(schema) = self.schemas.get(atom_id) else {
            return Err(ConfigError::UnknownAtomId {
                matcher_id,
                atom_id,
            });
        };
        for dimension in dimensions {
            match dimension {
                FieldTarget::Field(position) => {
                    if schema.field_type(*position).is_none() {
                        return Err(ConfigError::FieldOutOfRange {
                            matcher_id,
                            atom_id,
                            position: *position,
                        });
                    }
                },
                FieldTarget::AttributionUid(_) | FieldTarget::AttributionTag(_) => {
                    if !schema.attribution_chain {
                        return Err(ConfigError::NoAttributionChain {
                            matcher_id,
                            atom_id,
                        });
                    }
                },
            }
        }
        Ok(())
    }

    fn condition(
        &self,
        metric_id: i64,
        condition: Option<i64>,
    ) -> std::result::Result<(), ConfigError> {
        match condition {
            Some(id) if !self.predicates.contains(&id) => Err(ConfigError::DanglingReference {
                owner: format!("metric {}", metric_id),
                kind: "predicate",
                target: id,
            }),
            _ => Ok(()),
        }
    }

    fn bucket(&self, metric_id: i64, bucket: Option<Duration>) -> std::result::Result<(), ConfigError> {
        match bucket {
            Some(b) if b.is_zero() => Err(ConfigError::InvalidMetric {
                metric_id,
                reason: "bucket size must be positive".to_string(),
            }),
            Some(b) if b > MAX_BUCKET_SIZE => Err(ConfigError::InvalidMetric {
                metric_id,
                reason: format!(
                    "bucket size {:?} exceeds the maximum of {:?}",
                    b, MAX_BUCKET_SIZE
                ),
            }),
            _ => Ok(()),
        }
    }
}
