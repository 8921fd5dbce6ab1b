/*
 * Copyright 2024 ArpNetworking
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Per-key period worker
//!
//! One worker owns the timeline for a single (key, period): it floors record
//! timestamps onto period boundaries, keeps the matching buckets open through
//! a close delay to absorb late samples, and closes them in ascending
//! period-start order. The rotation state machine is synchronous and takes
//! the clock as an argument; `run` drives it from a single-consumer mailbox
//! and a period-granularity timer.

use crate::aggregation::StatisticResolver;
use crate::model::{Key, Record};
use crate::sinks::{PeriodicData, Sink};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::bucket::Bucket;

/// Rotation and routing state for one (key, period)
#[derive(Debug)]
pub struct PeriodWorker {
    key: Key,
    period: Duration,
    close_delay: chrono::Duration,
    lateness_horizon: chrono::Duration,
    period_chrono: chrono::Duration,
    resolver: Arc<StatisticResolver>,
    buckets: BTreeMap<DateTime<Utc>, Bucket>,
    late_dropped: u64,
    samples_dropped: u64,
}

impl PeriodWorker {
    pub fn new(
        key: Key,
        period: Duration,
        close_delay: Duration,
        lateness_horizon: Duration,
        resolver: Arc<StatisticResolver>,
    ) -> Self {
        Self {
            key,
            period,
            close_delay: to_chrono(close_delay),
            lateness_horizon: to_chrono(lateness_horizon),
            period_chrono: to_chrono(period),
            resolver,
            buckets: BTreeMap::new(),
            late_dropped: 0,
            samples_dropped: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Records dropped because they were older than the lateness horizon.
    pub fn late_dropped(&self) -> u64 {
        self.late_dropped
    }

    /// Samples dropped by buckets (unit inconsistency).
    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped
    }

    /// Floors a timestamp onto this worker's period grid.
    fn period_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let period_millis = self.period.as_millis() as i64;
        let floored = time.timestamp_millis().div_euclid(period_millis) * period_millis;
        DateTime::from_timestamp_millis(floored).unwrap_or(time)
    }

    /// Routes a record to its bucket, creating the bucket if the record is
    /// inside the lateness horizon. Beyond the horizon the record is dropped.
    pub fn handle_record(&mut self, record: &Record, now: DateTime<Utc>) {
        let start = self.period_start(record.time);

        if let Some(bucket) = self.buckets.get_mut(&start) {
            for (name, metric) in &record.metrics {
                self.samples_dropped += bucket.record(name, metric);
            }
            return;
        }

        let cutoff = now.checked_sub_signed(self.lateness_horizon);
        if cutoff.is_some_and(|cutoff| start < cutoff) {
            self.late_dropped += 1;
            warn!(
                key = %self.key,
                record_time = %record.time,
                period_start = %start,
                "dropping record beyond lateness horizon"
            );
            return;
        }

        let bucket = self
            .buckets
            .entry(start)
            .or_insert_with(|| {
                Bucket::new(self.key.clone(), start, self.period, self.resolver.clone())
            });
        for (name, metric) in &record.metrics {
            self.samples_dropped += bucket.record(name, metric);
        }
    }

    /// Closes every bucket whose close delay has elapsed, in ascending
    /// period-start order.
    pub fn rotate(&mut self, now: DateTime<Utc>) -> Vec<PeriodicData> {
        let due: Vec<DateTime<Utc>> = self
            .buckets
            .keys()
            .copied()
            .take_while(|start| {
                start
                    .checked_add_signed(self.period_chrono)
                    .and_then(|end| end.checked_add_signed(self.close_delay))
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect();

        due.into_iter()
            .filter_map(|start| self.buckets.remove(&start))
            .map(Bucket::close)
            .collect()
    }

    /// Closes all remaining buckets; used on shutdown.
    pub fn drain(&mut self) -> Vec<PeriodicData> {
        std::mem::take(&mut self.buckets)
            .into_values()
            .map(Bucket::close)
            .collect()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Drives a worker until its mailbox closes, then drains it.
///
/// Sink failures are logged and swallowed; delivery is at-most-once.
pub async fn run(
    mut worker: PeriodWorker,
    mut mailbox: mpsc::Receiver<Arc<Record>>,
    sink: Arc<dyn Sink>,
) {
    let mut ticker = tokio::time::interval(worker.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reported = (0u64, 0u64);

    loop {
        tokio::select! {
            received = mailbox.recv() => match received {
                Some(record) => worker.handle_record(&record, Utc::now()),
                None => break,
            },
            _ = ticker.tick() => {
                for data in worker.rotate(Utc::now()) {
                    emit(sink.as_ref(), data).await;
                }
                let counters = (worker.late_dropped(), worker.samples_dropped());
                if counters != reported {
                    reported = counters;
                    warn!(
                        key = %worker.key,
                        late_dropped = counters.0,
                        samples_dropped = counters.1,
                        "worker drop counters increased"
                    );
                }
            }
        }
    }

    for data in worker.drain() {
        emit(sink.as_ref(), data).await;
    }
    debug!(
        key = %worker.key,
        period = ?worker.period,
        late_dropped = worker.late_dropped(),
        samples_dropped = worker.samples_dropped(),
        "period worker stopped"
    );
}

async fn emit(sink: &dyn Sink, data: PeriodicData) {
    if let Err(error) = sink.record(data).await {
        warn!(sink = sink.name(), %error, "sink rejected periodic data");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregatorConfig;
    use crate::model::{Metric, MetricType, Quantity};
    use crate::statistics::Statistic;
    use ahash::HashMapExt;

    fn resolver() -> Arc<StatisticResolver> {
        Arc::new(
            StatisticResolver::new(&AggregatorConfig {
                timer_statistics: [Statistic::Max, Statistic::Count].into(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn worker(period_secs: u64, close_delay_secs: u64, horizon_secs: u64) -> PeriodWorker {
        PeriodWorker::new(
            Key::from_iter([("host".to_string(), "a".to_string())]),
            Duration::from_secs(period_secs),
            Duration::from_secs(close_delay_secs),
            Duration::from_secs(horizon_secs),
            resolver(),
        )
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn record_at(seconds: i64, value: f64) -> Record {
        let mut metrics = ahash::HashMap::new();
        metrics.insert(
            "latency".to_string(),
            Metric {
                metric_type: MetricType::Timer,
                values: vec![Quantity::new(value)],
                statistics: Default::default(),
            },
        );
        Record {
            id: format!("r-{seconds}"),
            time: at(seconds),
            received_time: at(seconds),
            dimensions: ahash::HashMap::new(),
            annotations: ahash::HashMap::new(),
            metrics,
        }
    }

    fn max_value(data: &PeriodicData) -> f64 {
        data.data
            .iter()
            .find(|d| d.statistic == Statistic::Max)
            .unwrap()
            .value
            .value
    }

    #[test]
    fn test_rotation_closes_elapsed_buckets_only() {
        let mut w = worker(60, 60, 120);

        for (t, v) in [(0, 1.0), (30, 2.0), (59, 3.0)] {
            w.handle_record(&record_at(t, v), at(t));
        }
        w.handle_record(&record_at(60, 9.0), at(60));

        // At t=119 the first bucket's close delay has not elapsed.
        assert!(w.rotate(at(119)).is_empty());

        // At t=120 exactly, [0, 60) closes; [60, 120) stays open.
        let closed = w.rotate(at(120));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].period_start, at(0));
        assert_eq!(max_value(&closed[0]), 3.0);

        let rest = w.rotate(at(240));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].period_start, at(60));
        assert_eq!(max_value(&rest[0]), 9.0);
    }

    #[test]
    fn test_boundary_timestamp_belongs_to_next_bucket() {
        let mut w = worker(60, 60, 240);
        w.handle_record(&record_at(59, 1.0), at(59));
        w.handle_record(&record_at(60, 2.0), at(60));

        let closed = w.rotate(at(500));
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].period_start, at(0));
        assert_eq!(max_value(&closed[0]), 1.0);
        assert_eq!(closed[1].period_start, at(60));
        assert_eq!(max_value(&closed[1]), 2.0);
    }

    #[test]
    fn test_late_record_within_close_delay_is_absorbed() {
        let mut w = worker(60, 60, 120);
        w.handle_record(&record_at(10, 1.0), at(10));

        // Sample from t=30 arrives at wall-clock t=75; bucket still open.
        w.handle_record(&record_at(30, 5.0), at(75));
        assert_eq!(w.late_dropped(), 0);

        let closed = w.rotate(at(120));
        assert_eq!(closed.len(), 1);
        assert_eq!(max_value(&closed[0]), 5.0);
    }

    #[test]
    fn test_record_beyond_horizon_is_dropped() {
        let mut w = worker(60, 60, 120);
        let _ = w.rotate(at(150));

        // Same t=30 sample arriving at wall-clock t=150: 150 - 120 > 0.
        w.handle_record(&record_at(30, 5.0), at(150));
        assert_eq!(w.late_dropped(), 1);
        assert!(w.rotate(at(1000)).is_empty());
    }

    #[test]
    fn test_buckets_close_in_ascending_period_start_order() {
        let mut w = worker(60, 60, 100_000);
        for t in [300, 0, 120, 60] {
            w.handle_record(&record_at(t, t as f64), at(t));
        }

        let closed = w.rotate(at(10_000));
        let starts: Vec<DateTime<Utc>> = closed.iter().map(|d| d.period_start).collect();
        assert_eq!(starts, vec![at(0), at(60), at(120), at(300)]);
    }

    #[test]
    fn test_drain_closes_everything() {
        let mut w = worker(60, 60, 120);
        w.handle_record(&record_at(0, 1.0), at(0));
        w.handle_record(&record_at(60, 2.0), at(60));

        let drained = w.drain();
        assert_eq!(drained.len(), 2);
        assert!(w.rotate(at(100_000)).is_empty());
    }

    #[test]
    fn test_contributes_to_exactly_one_bucket() {
        let mut w = worker(60, 60, 100_000);
        w.handle_record(&record_at(61, 7.0), at(61));

        let closed = w.rotate(at(100_000));
        let contributing: Vec<&PeriodicData> =
            closed.iter().filter(|d| !d.data.is_empty()).collect();
        assert_eq!(contributing.len(), 1);
        assert_eq!(contributing[0].period_start, at(60));
    }
}
