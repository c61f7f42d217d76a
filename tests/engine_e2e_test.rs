//! End-to-end engine tests: configs in, atoms through, reports out.

mod common;

use atomd_lib::core::AtomdError;
use atomd_lib::puller::PullAtomMetadata;
use atomd_lib::report::MetricData;
use atomd_lib::schema::atom_ids;
use common::*;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const LABEL_COUNT: &str = r#"
atom_matchers:
  - id: 1
    simple:
      atom_id: 100001
count_metrics:
  - id: 10
    what: 1
    dimensions_in_what: [{ field: 1 }]
"#;

#[tokio::test]
async fn test_count_by_string_dimension() {
    let engine = engine_with(LABEL_COUNT);
    for (ts, name) in [(10, "a"), (20, "b"), (30, "a")] {
        assert!(engine.log_event(&label(ts, name)).await);
    }

    let report = engine.query(KEY, 100, false).unwrap();
    assert_count_totals!(report, 10, { "a" => 2, "b" => 1 });
    assert_eq!(engine.stats().atoms_matched, 3);
}

#[test]
fn test_wakelock_duration() {
    let engine = engine_with(
        r#"
atom_matchers:
  - id: 1
    simple:
      atom_id: 10
      field_value_matchers:
        - target: { field: 3 }
          eq: 1
  - id: 2
    simple:
      atom_id: 10
      field_value_matchers:
        - target: { field: 3 }
          eq: 0
duration_metrics:
  - id: 20
    start: 1
    stop: 2
    dimensions_in_what: [{ field: 2 }]
"#,
    );
    engine.on_log_event(&wakelock(0, "wakelock1", 1));
    engine.on_log_event(&wakelock(500, "wakelock1", 0));

    let report = engine.query(KEY, 600, false).unwrap();
    let intervals: Vec<(i64, i64, i64)> = report
        .metric(20)
        .unwrap()
        .duration_intervals()
        .into_iter()
        .map(|r| (r.start_ns, r.end_ns, r.duration_ns))
        .collect();
    assert_eq!(intervals, vec![(0, 500, 500)]);
}

#[test]
fn test_reupload_discards_data() {
    let engine = engine_with(LABEL_COUNT);
    engine.on_log_event(&label(10, "a"));
    engine.on_log_event(&label(20, "a"));

    engine.upload(KEY, &stats_config(LABEL_COUNT), 30).unwrap();
    let report = engine.query(KEY, 100, false).unwrap();
    assert_count_totals!(report, 10, {});
    assert_eq!(report.time_base_elapsed_ns, 30);
}

#[test]
fn test_clear_drains_once() {
    let engine = engine_with(LABEL_COUNT);
    for ts in [10, 20, 30] {
        engine.on_log_event(&label(ts, "a"));
    }

    let first = engine.query(KEY, SEC, true).unwrap();
    assert_count_totals!(first, 10, { "a" => 3 });
    let second = engine.query(KEY, SEC, true).unwrap();
    assert_eq!(second.metric(10).unwrap().data_len(), 0);
    assert_eq!(engine.stats().reports_served, 2);
}

#[test]
fn test_count_conserved_across_buckets() {
    let engine = engine_with(
        r#"
atom_matchers:
  - id: 1
    simple: { atom_id: 100001 }
count_metrics:
  - id: 10
    what: 1
    bucket: 1s
"#,
    );
    let timestamps = [SEC / 10, SEC / 2, SEC + SEC / 5, 3 * SEC - 1, 3 * SEC];
    for ts in timestamps {
        engine.on_log_event(&label(ts, "a"));
    }

    let report = engine.query(KEY, 3 * SEC + SEC / 2, false).unwrap();
    let metric = report.metric(10).unwrap();
    let MetricData::Count(series) = &metric.data else {
        panic!("Expected count data");
    };
    let buckets: Vec<(i64, i64)> = series[0]
        .buckets
        .iter()
        .map(|b| (b.info.bucket_num, b.count))
        .collect();
    assert_eq!(buckets, vec![(0, 2), (1, 1), (2, 1), (3, 1)]);
    assert_eq!(
        metric.count_totals().values().sum::<i64>(),
        timestamps.len() as i64
    );
}

#[test]
fn test_condition_gates_counting() {
    let engine = engine_with(
        r#"
atom_matchers:
  - id: 1
    simple: { atom_id: 100001 }
  - id: 2
    simple:
      atom_id: 47
      field_value_matchers:
        - target: { field: 3 }
          eq: 2
  - id: 3
    simple:
      atom_id: 47
      field_value_matchers:
        - target: { field: 3 }
          eq: 1
predicates:
  - id: 50
    start: 2
    stop: 3
count_metrics:
  - id: 10
    what: 1
    condition: 50
    dimensions_in_what: [{ field: 1 }]
"#,
    );
    engine.on_log_event(&label(10, "before"));
    engine.on_log_event(&crumb(20, 1, 2));
    engine.on_log_event(&label(30, "during"));
    engine.on_log_event(&crumb(40, 1, 1));
    engine.on_log_event(&label(50, "after"));

    let report = engine.query(KEY, 100, false).unwrap();
    assert_count_totals!(report, 10, { "during" => 1 });
}

#[test]
fn test_activation_ttl() {
    let engine = engine_with(
        r#"
atom_matchers:
  - id: 1
    simple: { atom_id: 100001 }
  - id: 2
    simple:
      atom_id: 47
      field_value_matchers:
        - target: { field: 3 }
          eq: 2
count_metrics:
  - id: 10
    what: 1
    dimensions_in_what: [{ field: 1 }]
metric_activations:
  - metric_id: 10
    event_activations:
      - atom_matcher_id: 2
        ttl: 1s
"#,
    );
    engine.on_log_event(&label(SEC / 10, "inactive"));
    engine.on_log_event(&crumb(SEC / 5, 1, 2));
    engine.on_log_event(&label(SEC / 2, "active"));
    engine.on_log_event(&label(2 * SEC, "expired"));

    let report = engine.query(KEY, 3 * SEC, false).unwrap();
    assert_count_totals!(report, 10, { "active" => 1 });
    assert!(!report.metric(10).unwrap().is_active);
}

const TRIGGERED_GAUGE: &str = r#"
atom_matchers:
  - id: 1
    simple: { atom_id: 47 }
  - id: 4
    simple: { atom_id: 10018 }
gauge_metrics:
  - id: 20
    what: 4
    trigger_event: 1
"#;

fn gauge_samples(report: &atomd_lib::report::ConfigMetricsReport, metric_id: i64) -> usize {
    match &report.metric(metric_id).unwrap().data {
        MetricData::Gauge(series) => series
            .iter()
            .flat_map(|s| &s.buckets)
            .map(|b| b.samples.len())
            .sum(),
        other => panic!("Expected gauge data, got {:?}", other),
    }
}

#[tokio::test]
async fn test_triggered_gauge_pull() {
    let engine = engine_with(TRIGGERED_GAUGE);
    let puller = Arc::new(StaticPuller::new(vec![
        process_memory(1000, "system_server", 4096),
        process_memory(10001, "app", 2048),
    ]));
    engine.pullers().register_pull_atom_callback(
        1000,
        atom_ids::PROCESS_MEMORY_STATE,
        PullAtomMetadata::default(),
        puller.clone(),
    );

    engine.log_event(&crumb(7, 1, 0)).await;

    let report = engine.query(KEY, SEC, false).unwrap();
    assert_eq!(gauge_samples(&report, 20), 2);
    assert_eq!(puller.calls(), 1);
    assert_eq!(engine.stats().pulls, 1);
}

#[tokio::test]
async fn test_gauge_without_puller_records_skip() {
    let engine = engine_with(TRIGGERED_GAUGE);
    engine.log_event(&crumb(7, 1, 0)).await;

    let report = engine.query(KEY, SEC, false).unwrap();
    let metric = report.metric(20).unwrap();
    assert_eq!(gauge_samples(&report, 20), 0);
    assert_eq!(metric.skipped.len(), 1);
    assert_eq!(metric.skipped[0].reason, "no puller registered");
}

#[tokio::test]
async fn test_pull_for_replaced_config_is_dropped() {
    let engine = engine_with(TRIGGERED_GAUGE);
    engine.pullers().register_pull_atom_callback(
        1000,
        atom_ids::PROCESS_MEMORY_STATE,
        PullAtomMetadata::default(),
        Arc::new(StaticPuller::new(vec![process_memory(1000, "proc", 1)])),
    );

    let pending = engine.on_log_event(&crumb(7, 1, 0));
    assert_eq!(pending.len(), 1);
    engine.upload(KEY, &stats_config(TRIGGERED_GAUGE), 8).unwrap();
    for pull in pending {
        engine.execute_pull(pull).await;
    }

    let report = engine.query(KEY, SEC, false).unwrap();
    assert_eq!(gauge_samples(&report, 20), 0);
}

#[tokio::test]
async fn test_periodic_pull_alarm() {
    let engine = engine_with(
        r#"
atom_matchers:
  - id: 4
    simple: { atom_id: 10009 }
gauge_metrics:
  - id: 20
    what: 4
    bucket: 1s
"#,
    );
    let cpu = atomd_lib::core::Atom::builder(atom_ids::CPU_TIME_PER_UID)
        .int(1000)
        .long(10)
        .long(20)
        .build()
        .unwrap();
    let puller = Arc::new(StaticPuller::new(vec![cpu]));
    engine.pullers().register_pull_atom_callback(
        0,
        atom_ids::CPU_TIME_PER_UID,
        PullAtomMetadata::default(),
        puller.clone(),
    );

    assert_eq!(engine.on_alarm(SEC / 2).await, 0);
    assert_eq!(engine.on_alarm(SEC).await, 1);
    assert_eq!(engine.on_alarm(SEC + 1).await, 0);

    let report = engine.query(KEY, 2 * SEC - 1, false).unwrap();
    assert_eq!(gauge_samples(&report, 20), 1);
    assert_eq!(puller.calls(), 1);
}

#[tokio::test]
async fn test_alert_reaches_subscriber() {
    let engine = engine_with(
        r#"
atom_matchers:
  - id: 1
    simple: { atom_id: 100001 }
count_metrics:
  - id: 10
    what: 1
    dimensions_in_what: [{ field: 1 }]
alerts:
  - id: 90
    metric_id: 10
    num_buckets: 1
    trigger_if_sum_gt: 2
    refractory_period: 10s
subscriptions:
  - id: 1
    rule_id: 90
    subscriber_id: 5
"#,
    );
    let (tx, mut rx) = mpsc::channel(8);
    engine.subscribers().set_broadcast_subscriber(KEY, 5, tx);

    for ts in [10, 20, 30, 40] {
        engine.log_event(&label(ts, "a")).await;
    }

    let alert = rx.recv().await.unwrap();
    assert_eq!(alert.alert_id, 90);
    assert_eq!(alert.metric_id, 10);
    assert_eq!(alert.dimension, "a");
    assert_eq!(alert.sum, 3);
    assert_eq!(alert.elapsed_ns, 30);
    // The fourth atom falls inside the refractory period.
    assert!(rx.try_recv().is_err());
    assert_eq!(engine.stats().anomalies, 1);
}

#[test]
fn test_remove_config() {
    let engine = engine_with(LABEL_COUNT);
    let (tx, _rx) = mpsc::channel(1);
    engine.subscribers().set_broadcast_subscriber(KEY, 5, tx);

    engine.remove(KEY).unwrap();
    assert!(matches!(
        engine.query(KEY, 100, false),
        Err(AtomdError::ConfigNotFound(_))
    ));
    assert_eq!(engine.subscribers().subscriber_count(), 0);

    engine.on_log_event(&label(10, "a"));
    assert_eq!(engine.stats().atoms_matched, 0);
}

#[test]
fn test_isolated_uid_counted_under_host() {
    let engine = engine_with(
        r#"
atom_matchers:
  - id: 1
    simple: { atom_id: 10 }
count_metrics:
  - id: 10
    what: 1
    dimensions_in_what: [{ attribution_uid: first }]
"#,
    );
    engine.uid_map().write().assign_isolated_uid(99010, 10010);

    let isolated = atomd_lib::core::Atom::builder(atom_ids::WAKELOCK_STATE_CHANGED)
        .timestamp_ns(10)
        .attribution(99010, "isolated")
        .enumeration(1)
        .string("wl")
        .enumeration(1)
        .build()
        .unwrap();
    engine.on_log_event(&isolated);
    engine.on_log_event(&wakelock(20, "wl", 1));

    let report = engine.query(KEY, 100, false).unwrap();
    assert_count_totals!(report, 10, { "1000" => 1, "10010" => 1 });
}

#[test]
fn test_concurrent_ingest_and_drain_conserve_count() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 500;
    let engine = engine_with(LABEL_COUNT);
    let producers_done = AtomicUsize::new(0);

    let drained = std::thread::scope(|scope| {
        for t in 0..THREADS {
            let (engine, done) = (&engine, &producers_done);
            scope.spawn(move || {
                let name = format!("t{}", t);
                for i in 0..PER_THREAD {
                    engine.on_log_event(&label(10 + i as i64, &name));
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        let drainer = scope.spawn(|| {
            let mut total = 0i64;
            loop {
                let finished = producers_done.load(Ordering::SeqCst) == THREADS;
                let report = engine.query(KEY, SEC, true).unwrap();
                total += report.metric(10).unwrap().count_totals().values().sum::<i64>();
                if finished {
                    break total;
                }
            }
        });
        drainer.join().unwrap()
    });

    assert_eq!(drained, (THREADS * PER_THREAD) as i64);
    assert_eq!(engine.stats().atoms_matched, (THREADS * PER_THREAD) as u64);
}

#[test]
fn test_oversized_bucket_rejected_at_upload() {
    let engine = engine();
    let config = stats_config(
        r#"
atom_matchers:
  - id: 1
    simple: { atom_id: 100001 }
count_metrics:
  - id: 10
    what: 1
    bucket: 300years
"#,
    );
    assert!(matches!(
        engine.upload(KEY, &config, 5 * SEC),
        Err(AtomdError::InvalidStatsConfig(_))
    ));
    assert_eq!(engine.config_count(), 0);
}
