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

//! Time-based metrics aggregation engine
//!
//! The aggregator is the pipeline front-end: it routes each observed record
//! to the per-key period workers (one per configured period, created on
//! first sight of a key) and resolves which statistics apply to which metric
//! name. Resolution is pattern-override-first with per-type defaults, and is
//! memoized because metric-name cardinality is small and stable.

use crate::config::AggregatorConfig;
use crate::model::{Key, MetricType, Record};
use crate::sinks::Sink;
use crate::statistics::{dependency_closure, Statistic};
use anyhow::{Context, Result};
use dashmap::DashMap;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod bucket;
pub mod worker;

pub use bucket::Bucket;
pub use worker::PeriodWorker;

/// How long shutdown waits for workers to drain before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Resolves the statistic sets to compute for a metric name.
///
/// The first matching pattern override wins, in configured order; otherwise
/// the metric type's default set applies. Dependent sets are the transitive
/// dependency closure minus the specified set. Both lookups are memoized per
/// metric name.
#[derive(Debug)]
pub struct StatisticResolver {
    counter_specified: Arc<BTreeSet<Statistic>>,
    counter_dependent: Arc<BTreeSet<Statistic>>,
    gauge_specified: Arc<BTreeSet<Statistic>>,
    gauge_dependent: Arc<BTreeSet<Statistic>>,
    timer_specified: Arc<BTreeSet<Statistic>>,
    timer_dependent: Arc<BTreeSet<Statistic>>,
    patterns: Vec<PatternStatistics>,
    specified_cache: DashMap<String, Option<Arc<BTreeSet<Statistic>>>>,
    dependent_cache: DashMap<String, Option<Arc<BTreeSet<Statistic>>>>,
}

#[derive(Debug)]
struct PatternStatistics {
    pattern: Regex,
    specified: Arc<BTreeSet<Statistic>>,
    dependent: Arc<BTreeSet<Statistic>>,
}

fn with_dependents(
    specified: &BTreeSet<Statistic>,
) -> (Arc<BTreeSet<Statistic>>, Arc<BTreeSet<Statistic>>) {
    let dependent = dependency_closure(specified);
    (Arc::new(specified.clone()), Arc::new(dependent))
}

impl StatisticResolver {
    pub fn new(config: &AggregatorConfig) -> Result<Self> {
        let (counter_specified, counter_dependent) = with_dependents(&config.counter_statistics);
        let (gauge_specified, gauge_dependent) = with_dependents(&config.gauge_statistics);
        let (timer_specified, timer_dependent) = with_dependents(&config.timer_statistics);

        let mut patterns = Vec::with_capacity(config.statistics.len());
        for entry in &config.statistics {
            // Overrides match the full metric name, not a substring.
            let pattern = Regex::new(&format!("^(?:{})$", entry.pattern))
                .with_context(|| format!("invalid metric pattern: {}", entry.pattern))?;
            let (specified, dependent) = with_dependents(&entry.statistics);
            patterns.push(PatternStatistics {
                pattern,
                specified,
                dependent,
            });
        }

        Ok(Self {
            counter_specified,
            counter_dependent,
            gauge_specified,
            gauge_dependent,
            timer_specified,
            timer_dependent,
            patterns,
            specified_cache: DashMap::new(),
            dependent_cache: DashMap::new(),
        })
    }

    /// Statistics to compute and emit for this metric.
    pub fn specified_for(&self, metric: &str, metric_type: MetricType) -> Arc<BTreeSet<Statistic>> {
        let overridden = self
            .specified_cache
            .entry(metric.to_string())
            .or_insert_with(|| {
                self.patterns
                    .iter()
                    .find(|entry| entry.pattern.is_match(metric))
                    .map(|entry| Arc::clone(&entry.specified))
            })
            .clone();

        overridden.unwrap_or_else(|| match metric_type {
            MetricType::Counter => Arc::clone(&self.counter_specified),
            MetricType::Gauge => Arc::clone(&self.gauge_specified),
            MetricType::Timer => Arc::clone(&self.timer_specified),
        })
    }

    /// Statistics to compute but not emit: dependencies of the specified set.
    pub fn dependent_for(&self, metric: &str, metric_type: MetricType) -> Arc<BTreeSet<Statistic>> {
        let overridden = self
            .dependent_cache
            .entry(metric.to_string())
            .or_insert_with(|| {
                self.patterns
                    .iter()
                    .find(|entry| entry.pattern.is_match(metric))
                    .map(|entry| Arc::clone(&entry.dependent))
            })
            .clone();

        overridden.unwrap_or_else(|| match metric_type {
            MetricType::Counter => Arc::clone(&self.counter_dependent),
            MetricType::Gauge => Arc::clone(&self.gauge_dependent),
            MetricType::Timer => Arc::clone(&self.timer_dependent),
        })
    }
}

struct WorkerHandle {
    mailbox: mpsc::Sender<Arc<Record>>,
    task: JoinHandle<()>,
}

/// Routes records to per-key period workers and owns their lifecycle.
/// Safe for concurrent `observe` callers.
pub struct Aggregator {
    periods: Vec<Duration>,
    close_delay: Option<Duration>,
    lateness_horizon: Duration,
    mailbox_capacity: usize,
    resolver: Arc<StatisticResolver>,
    sink: Arc<dyn Sink>,
    workers: DashMap<Key, Vec<WorkerHandle>>,
    running: AtomicBool,
    overflow_dropped: DashMap<Key, AtomicU64>,
}

impl Aggregator {
    pub fn new(config: &AggregatorConfig, sink: Arc<dyn Sink>) -> Result<Self> {
        Ok(Self {
            periods: config.periods.clone(),
            close_delay: config.close_delay,
            lateness_horizon: config.effective_lateness_horizon(),
            mailbox_capacity: config.worker_mailbox_capacity,
            resolver: Arc::new(StatisticResolver::new(config)?),
            sink,
            workers: DashMap::new(),
            running: AtomicBool::new(false),
            overflow_dropped: DashMap::new(),
        })
    }

    /// Begins accepting records. Workers are created lazily per key.
    pub fn launch(&self) {
        info!(periods = self.periods.len(), "launching aggregator");
        self.workers.clear();
        self.running.store(true, Ordering::Release);
    }

    /// Routes one record to every period worker for its key.
    ///
    /// Never blocks and never fails: a full mailbox drops the record for
    /// that worker with a counter, and a dead worker set is recreated on the
    /// next record for the key.
    pub fn observe(&self, record: Record) {
        if !self.running.load(Ordering::Acquire) {
            debug!(record_id = %record.id, "ignoring record while not running");
            return;
        }

        let key = record.key();
        let record = Arc::new(record);
        let mut worker_died = false;

        {
            let handles = self
                .workers
                .entry(key.clone())
                .or_insert_with(|| self.spawn_workers(&key));
            for handle in handles.iter() {
                match handle.mailbox.try_send(Arc::clone(&record)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.note_overflow(&key);
                        warn!(key = %key, "worker mailbox full; dropping record");
                    }
                    Err(TrySendError::Closed(_)) => {
                        worker_died = true;
                    }
                }
            }
        }

        if worker_died {
            // In-flight buckets for the dead worker are lost; best effort.
            warn!(key = %key, "worker exited unexpectedly; recreating on next record");
            self.workers.remove(&key);
        }
    }

    fn note_overflow(&self, key: &Key) {
        self.overflow_dropped
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records dropped because a worker mailbox was full, across all keys.
    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped
            .iter()
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Records dropped on mailbox overflow for one key.
    pub fn overflow_dropped_for(&self, key: &Key) -> u64 {
        self.overflow_dropped
            .get(key)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Number of keys with live worker sets.
    pub fn key_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting records, closes worker mailboxes, and waits up to the
    /// shutdown grace for workers to drain and emit; stragglers are aborted.
    pub async fn shutdown(&self) {
        info!(keys = self.key_count(), "stopping aggregator");
        self.running.store(false, Ordering::Release);

        let mut tasks = Vec::new();
        let keys: Vec<Key> = self.workers.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, handles)) = self.workers.remove(&key) {
                for handle in handles {
                    // Dropping the sender closes the mailbox; the worker
                    // drains its buckets and exits.
                    drop(handle.mailbox);
                    tasks.push(handle.task);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for mut task in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                task.abort();
                warn!("abandoned period worker at shutdown");
            }
        }

        for entry in self.overflow_dropped.iter() {
            let dropped = entry.value().load(Ordering::Relaxed);
            if dropped > 0 {
                warn!(key = %entry.key(), records = dropped, "dropped records on mailbox overflow");
            }
        }
    }

    fn spawn_workers(&self, key: &Key) -> Vec<WorkerHandle> {
        let mut handles = Vec::with_capacity(self.periods.len());
        for period in &self.periods {
            let (mailbox, receiver) = mpsc::channel(self.mailbox_capacity);
            let period_worker = PeriodWorker::new(
                key.clone(),
                *period,
                self.close_delay.unwrap_or(*period),
                self.lateness_horizon,
                Arc::clone(&self.resolver),
            );
            let task = tokio::spawn(worker::run(period_worker, receiver, Arc::clone(&self.sink)));
            handles.push(WorkerHandle { mailbox, task });
        }
        debug!(key = %key, workers = handles.len(), "created period workers");
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternStatisticsConfig;
    use crate::model::{Metric, MetricType, Quantity};
    use crate::sinks::PeriodicData;
    use ahash::HashMapExt;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        data: Mutex<Vec<PeriodicData>>,
    }

    impl CollectingSink {
        fn collected(&self) -> Vec<PeriodicData> {
            self.data.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for CollectingSink {
        async fn record(&self, data: PeriodicData) -> Result<()> {
            self.data.lock().unwrap().push(data);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "collecting"
        }
    }

    fn test_config() -> AggregatorConfig {
        AggregatorConfig {
            periods: vec![Duration::from_millis(50)],
            timer_statistics: [Statistic::Max, Statistic::Count].into(),
            ..Default::default()
        }
    }

    fn record_for(host: &str, value: f64) -> Record {
        let mut dimensions = ahash::HashMap::new();
        dimensions.insert("host".to_string(), host.to_string());
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
            id: format!("r-{host}-{value}"),
            time: Utc::now(),
            received_time: Utc::now(),
            dimensions,
            annotations: ahash::HashMap::new(),
            metrics,
        }
    }

    #[test]
    fn test_resolver_first_pattern_wins() {
        let config = AggregatorConfig {
            statistics: vec![
                PatternStatisticsConfig {
                    pattern: "http/.*".to_string(),
                    statistics: [Statistic::Max].into(),
                },
                PatternStatisticsConfig {
                    pattern: "http/latency".to_string(),
                    statistics: [Statistic::Min].into(),
                },
            ],
            ..Default::default()
        };
        let resolver = StatisticResolver::new(&config).unwrap();

        let specified = resolver.specified_for("http/latency", MetricType::Timer);
        assert_eq!(*specified, BTreeSet::from([Statistic::Max]));
    }

    #[test]
    fn test_resolver_pattern_requires_full_match() {
        let config = AggregatorConfig {
            statistics: vec![PatternStatisticsConfig {
                pattern: "latency".to_string(),
                statistics: [Statistic::Max].into(),
            }],
            timer_statistics: [Statistic::Count].into(),
            ..Default::default()
        };
        let resolver = StatisticResolver::new(&config).unwrap();

        // "request_latency" contains but does not equal the pattern.
        let specified = resolver.specified_for("request_latency", MetricType::Timer);
        assert_eq!(*specified, BTreeSet::from([Statistic::Count]));
    }

    #[test]
    fn test_resolver_falls_back_to_type_defaults() {
        let resolver = StatisticResolver::new(&test_config()).unwrap();
        let counter = resolver.specified_for("requests", MetricType::Counter);
        assert!(counter.contains(&Statistic::Sum));
        let timer = resolver.specified_for("latency", MetricType::Timer);
        assert_eq!(*timer, BTreeSet::from([Statistic::Max, Statistic::Count]));
    }

    #[test]
    fn test_resolver_memoizes_lookups() {
        let config = AggregatorConfig {
            statistics: vec![PatternStatisticsConfig {
                pattern: "http/.*".to_string(),
                statistics: [Statistic::TP99].into(),
            }],
            ..Default::default()
        };
        let resolver = StatisticResolver::new(&config).unwrap();

        let first = resolver.specified_for("http/latency", MetricType::Timer);
        let second = resolver.specified_for("http/latency", MetricType::Timer);
        assert!(Arc::ptr_eq(&first, &second));

        let dependent = resolver.dependent_for("http/latency", MetricType::Timer);
        assert_eq!(*dependent, BTreeSet::from([Statistic::Histogram]));
    }

    #[tokio::test]
    async fn test_per_key_isolation() {
        let sink = Arc::new(CollectingSink::default());
        let aggregator = Aggregator::new(&test_config(), sink.clone()).unwrap();
        aggregator.launch();

        aggregator.observe(record_for("a", 10.0));
        aggregator.observe(record_for("b", 99.0));
        assert_eq!(aggregator.key_count(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        aggregator.shutdown().await;

        let collected = sink.collected();
        assert_eq!(collected.len(), 2);
        for data in &collected {
            let host = data.key.dimensions()["host"].clone();
            let max = data
                .data
                .iter()
                .find(|d| d.statistic == Statistic::Max)
                .unwrap()
                .value
                .value;
            match host.as_str() {
                "a" => assert_eq!(max, 10.0),
                "b" => assert_eq!(max, 99.0),
                other => panic!("unexpected key {other}"),
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_buckets() {
        let sink = Arc::new(CollectingSink::default());
        let aggregator = Aggregator::new(&test_config(), sink.clone()).unwrap();
        aggregator.launch();

        aggregator.observe(record_for("a", 5.0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        aggregator.shutdown().await;

        let collected = sink.collected();
        assert_eq!(collected.len(), 1);
        assert!(!collected[0].data.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_counter_is_per_key() {
        let sink = Arc::new(CollectingSink::default());
        let aggregator = Aggregator::new(&test_config(), sink).unwrap();

        let key_a = record_for("a", 1.0).key();
        let key_b = record_for("b", 1.0).key();
        aggregator.note_overflow(&key_a);
        aggregator.note_overflow(&key_a);
        aggregator.note_overflow(&key_b);

        assert_eq!(aggregator.overflow_dropped_for(&key_a), 2);
        assert_eq!(aggregator.overflow_dropped_for(&key_b), 1);
        assert_eq!(aggregator.overflow_dropped(), 3);

        let untouched = record_for("c", 1.0).key();
        assert_eq!(aggregator.overflow_dropped_for(&untouched), 0);
    }

    #[tokio::test]
    async fn test_observe_before_launch_is_ignored() {
        let sink = Arc::new(CollectingSink::default());
        let aggregator = Aggregator::new(&test_config(), sink.clone()).unwrap();

        aggregator.observe(record_for("a", 5.0));
        assert_eq!(aggregator.key_count(), 0);
    }

    #[tokio::test]
    async fn test_one_worker_set_per_key() {
        let sink = Arc::new(CollectingSink::default());
        let config = AggregatorConfig {
            periods: vec![Duration::from_secs(60), Duration::from_secs(300)],
            ..test_config()
        };
        let aggregator = Aggregator::new(&config, sink.clone()).unwrap();
        aggregator.launch();

        aggregator.observe(record_for("a", 1.0));
        aggregator.observe(record_for("a", 2.0));
        assert_eq!(aggregator.key_count(), 1);

        aggregator.shutdown().await;
        // One emission per period on shutdown drain.
        assert_eq!(sink.collected().len(), 2);
    }
}
