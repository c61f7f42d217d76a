//! Broadcast subscribers for anomaly alerts.
//!
//! A subscriber registers a channel per `(config, subscriber_id)`. When an
//! alert fires, every subscription naming that alert is delivered to its
//! subscriber. A closed channel means the subscriber went away; it is pruned
//! on the next send.

use crate::core::types::ConfigKey;
use crate::engine::stats_config::Subscription;
use crate::metrics::AnomalyEvent;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyAlert {
    pub config_key: ConfigKey,
    pub subscription_id: i64,
    pub alert_id: i64,
    pub metric_id: i64,
    pub dimension: String,
    pub sum: i64,
    pub elapsed_ns: i64,
}

impl AnomalyAlert {
    pub fn new(config_key: ConfigKey, subscription: &Subscription, event: &AnomalyEvent) -> Self {
        Self {
            config_key,
            subscription_id: subscription.id,
            alert_id: event.alert_id,
            metric_id: event.metric_id,
            dimension: event.dimension.to_string(),
            sum: event.sum,
            elapsed_ns: event.elapsed_ns,
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriberReporter {
    subscribers: DashMap<(ConfigKey, i64), mpsc::Sender<AnomalyAlert>>,
}

impl SubscriberReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_broadcast_subscriber(
        &self,
        config_key: ConfigKey,
        subscriber_id: i64,
        sender: mpsc::Sender<AnomalyAlert>,
    ) {
        tracing::info!(
            "Subscriber {} registered for config {}",
            subscriber_id,
            config_key
        );
        self.subscribers.insert((config_key, subscriber_id), sender);
    }

    pub fn unset_broadcast_subscriber(&self, config_key: ConfigKey, subscriber_id: i64) -> bool {
        self.subscribers
            .remove(&(config_key, subscriber_id))
            .is_some()
    }

    /// Drops every subscriber of a config.
    pub fn unset_config(&self, config_key: ConfigKey) {
        self.subscribers.retain(|(key, _), _| *key != config_key);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Sends `alert` to the subscriber of `subscription`. Returns whether it
    /// was delivered.
    pub fn alert_broadcast_subscriber(
        &self,
        config_key: ConfigKey,
        subscription: &Subscription,
        alert: AnomalyAlert,
    ) -> bool {
        let key = (config_key, subscription.subscriber_id);
        let Some(sender) = self.subscribers.get(&key).map(|s| s.clone()) else {
            tracing::debug!(
                "No subscriber {} for config {}",
                subscription.subscriber_id,
                config_key
            );
            return false;
        };
        match sender.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Subscriber {} is not keeping up, alert dropped",
                    subscription.subscriber_id
                );
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::info!(
                    "Subscriber {} went away, unregistering",
                    subscription.subscriber_id
                );
                self.subscribers.remove(&key);
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{DimensionKey, DimensionValue};

    fn subscription() -> Subscription {
        Subscription {
            id: 1,
            rule_id: 7,
            subscriber_id: 99,
        }
    }

    fn alert(key: ConfigKey) -> AnomalyAlert {
        let event = AnomalyEvent {
            alert_id: 7,
            metric_id: 3,
            dimension: DimensionKey::from_values([DimensionValue::Str("a".into())]),
            sum: 11,
            elapsed_ns: 500,
        };
        AnomalyAlert::new(key, &subscription(), &event)
    }

    #[tokio::test]
    async fn test_alert_delivered() {
        let reporter = SubscriberReporter::new();
        let key = ConfigKey::new(1000, 1);
        let (tx, mut rx) = mpsc::channel(4);
        reporter.set_broadcast_subscriber(key, 99, tx);

        assert!(reporter.alert_broadcast_subscriber(key, &subscription(), alert(key)));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.dimension, "a");
        assert_eq!(received.sum, 11);
    }

    #[tokio::test]
    async fn test_dead_subscriber_pruned() {
        let reporter = SubscriberReporter::new();
        let key = ConfigKey::new(1000, 1);
        let (tx, rx) = mpsc::channel(4);
        reporter.set_broadcast_subscriber(key, 99, tx);
        drop(rx);

        assert!(!reporter.alert_broadcast_subscriber(key, &subscription(), alert(key)));
        assert_eq!(reporter.subscriber_count(), 0);
    }

    #[test]
    fn test_unknown_subscriber() {
        let reporter = SubscriberReporter::new();
        let key = ConfigKey::new(1000, 1);
        assert!(!reporter.alert_broadcast_subscriber(key, &subscription(), alert(key)));
        assert!(!reporter.unset_broadcast_subscriber(key, 99));
    }
}
