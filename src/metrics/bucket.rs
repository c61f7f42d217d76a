//! Bucket arithmetic.
//!
//! Buckets are aligned to the config's time base:
//! `bucket_num = (t - time_base) / bucket_size`.

use crate::core::clock::ns_to_millis;
use crate::metrics::dimension::DimensionKey;
use ahash::AHashMap;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketClock {
    time_base_ns: i64,
    bucket_size_ns: i64,
}

impl BucketClock {
    /// `bucket_size_ns` must be positive; upload validation guarantees it.
    pub fn new(time_base_ns: i64, bucket_size_ns: i64) -> Self {
        Self {
            time_base_ns,
            bucket_size_ns: bucket_size_ns.max(1),
        }
    }

    pub fn time_base_ns(&self) -> i64 {
        self.time_base_ns
    }

    pub fn bucket_size_ns(&self) -> i64 {
        self.bucket_size_ns
    }

    /// Timestamps before the time base fall into bucket 0.
    pub fn bucket_num(&self, elapsed_ns: i64) -> i64 {
        elapsed_ns.saturating_sub(self.time_base_ns).max(0) / self.bucket_size_ns
    }

    /// Saturates at `i64::MAX` so boundaries stay ordered for any bucket size.
    pub fn bucket_start_ns(&self, bucket_num: i64) -> i64 {
        self.time_base_ns
            .saturating_add(bucket_num.saturating_mul(self.bucket_size_ns))
    }

    pub fn bucket_end_ns(&self, bucket_num: i64) -> i64 {
        self.bucket_start_ns(bucket_num.saturating_add(1))
    }

    pub fn info(&self, bucket_num: i64) -> BucketInfo {
        BucketInfo {
            bucket_num,
            start_bucket_elapsed_millis: ns_to_millis(self.bucket_start_ns(bucket_num)),
            end_bucket_elapsed_millis: ns_to_millis(self.bucket_end_ns(bucket_num)),
        }
    }

    /// Metadata for a partial bucket cut short at `dump_ns`.
    pub fn partial_info(&self, bucket_num: i64, dump_ns: i64) -> BucketInfo {
        let end = dump_ns.clamp(self.bucket_start_ns(bucket_num), self.bucket_end_ns(bucket_num));
        BucketInfo {
            end_bucket_elapsed_millis: ns_to_millis(end),
            ..self.info(bucket_num)
        }
    }
}

/// Bucket alignment metadata attached to every bucketed report entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BucketInfo {
    pub bucket_num: i64,
    pub start_bucket_elapsed_millis: i64,
    pub end_bucket_elapsed_millis: i64,
}

/// Per-dimension values for the open bucket plus every closed bucket.
#[derive(Debug)]
pub struct BucketedSeries<T> {
    clock: BucketClock,
    current_bucket: i64,
    current: AHashMap<DimensionKey, T>,
    past: BTreeMap<DimensionKey, Vec<(BucketInfo, T)>>,
}

impl<T: Clone + Default> BucketedSeries<T> {
    pub fn new(clock: BucketClock) -> Self {
        Self {
            clock,
            current_bucket: 0,
            current: AHashMap::new(),
            past: BTreeMap::new(),
        }
    }

    pub fn clock(&self) -> &BucketClock {
        &self.clock
    }

    pub fn current_bucket(&self) -> i64 {
        self.current_bucket
    }

    /// Whether `elapsed_ns` belongs to a bucket that has already closed.
    pub fn is_late(&self, elapsed_ns: i64) -> bool {
        self.clock.bucket_num(elapsed_ns) < self.current_bucket
    }

    /// Closes the open bucket when `elapsed_ns` lies past it. `on_close`
    /// sees every closing value with its bucket number.
    pub fn advance<F>(&mut self, elapsed_ns: i64, mut on_close: F)
    where
        F: FnMut(&DimensionKey, &T, i64),
    {
        let bucket = self.clock.bucket_num(elapsed_ns);
        if bucket <= self.current_bucket {
            return;
        }
        let info = self.clock.info(self.current_bucket);
        for (key, value) in self.current.drain() {
            on_close(&key, &value, self.current_bucket);
            self.past.entry(key).or_default().push((info, value));
        }
        self.current_bucket = bucket;
    }

    pub fn contains(&self, key: &DimensionKey) -> bool {
        self.current.contains_key(key)
    }

    /// Distinct keys in the open bucket.
    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    pub fn current_mut(&mut self, key: DimensionKey) -> &mut T {
        self.current.entry(key).or_default()
    }

    /// Closed buckets plus the open bucket, cut short at `dump_ns`.
    pub fn snapshot(&self, dump_ns: i64) -> BTreeMap<DimensionKey, Vec<(BucketInfo, T)>> {
        let mut out = self.past.clone();
        let partial = self.clock.partial_info(self.current_bucket, dump_ns);
        for (key, value) in &self.current {
            out.entry(key.clone()).or_default().push((partial, value.clone()));
        }
        out
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.past.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::NS_PER_SEC;
    use crate::metrics::dimension::DimensionValue;

    #[test]
    fn test_series_closes_buckets() {
        let mut series: BucketedSeries<i64> = BucketedSeries::new(BucketClock::new(0, 10));
        let key = DimensionKey::from_values([DimensionValue::Int(1)]);
        *series.current_mut(key.clone()) += 2;

        let mut closed = Vec::new();
        series.advance(25, |k, v, b| closed.push((k.clone(), *v, b)));
        assert_eq!(closed, vec![(key.clone(), 2, 0)]);
        assert_eq!(series.current_bucket(), 2);
        assert!(series.is_late(15));

        *series.current_mut(key.clone()) += 1;
        let snapshot = series.snapshot(27);
        let buckets = &snapshot[&key];
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].0.bucket_num, 0);
        assert_eq!(buckets[1].0.bucket_num, 2);
        assert_eq!(buckets[1].1, 1);
    }

    #[test]
    fn test_bucket_alignment() {
        let clock = BucketClock::new(5 * NS_PER_SEC, 60 * NS_PER_SEC);
        assert_eq!(clock.bucket_num(5 * NS_PER_SEC), 0);
        assert_eq!(clock.bucket_num(64 * NS_PER_SEC), 0);
        assert_eq!(clock.bucket_num(65 * NS_PER_SEC), 1);
        assert_eq!(clock.bucket_start_ns(1), 65 * NS_PER_SEC);
        assert_eq!(clock.bucket_num(0), 0);
    }

    #[test]
    fn test_boundaries_saturate() {
        let clock = BucketClock::new(5 * NS_PER_SEC, i64::MAX);
        assert_eq!(clock.bucket_num(7 * NS_PER_SEC), 0);
        assert_eq!(clock.bucket_end_ns(0), i64::MAX);
        assert_eq!(clock.bucket_end_ns(1), i64::MAX);
        let info = clock.partial_info(0, 7 * NS_PER_SEC);
        assert_eq!(info.start_bucket_elapsed_millis, 5_000);
        assert_eq!(info.end_bucket_elapsed_millis, 7_000);
    }

    #[test]
    fn test_partial_info() {
        let clock = BucketClock::new(0, 60 * NS_PER_SEC);
        let info = clock.partial_info(0, 30 * NS_PER_SEC);
        assert_eq!(info.start_bucket_elapsed_millis, 0);
        assert_eq!(info.end_bucket_elapsed_millis, 30_000);
        assert_eq!(clock.info(0).end_bucket_elapsed_millis, 60_000);
    }
}
