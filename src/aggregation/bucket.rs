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

//! One period's aggregation state for one dimension key
//!
//! A bucket lazily materializes accumulators per metric on first touch:
//! the specified statistics for the metric plus every dependency they
//! require. Closing a bucket evaluates accumulators in topological
//! dependency order and emits only the specified statistics. Closing
//! consumes the bucket, so it can only happen once.

use crate::aggregation::StatisticResolver;
use crate::model::{Key, Metric, MetricType, Unit};
use crate::sinks::{AggregatedDatum, PeriodicData};
use crate::statistics::{
    reconcile_unit, topological_order, Accumulator, Dependencies, Statistic,
};
use ahash::HashMap;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Aggregation state for one (key, period start)
#[derive(Debug)]
pub struct Bucket {
    key: Key,
    period_start: DateTime<Utc>,
    period: Duration,
    resolver: Arc<StatisticResolver>,
    metrics: HashMap<String, MetricAggregationState>,
}

/// Accumulators for one metric within a bucket
#[derive(Debug)]
struct MetricAggregationState {
    metric_type: MetricType,
    unit: Option<Unit>,
    population_size: u64,
    specified: BTreeMap<Statistic, Box<dyn Accumulator>>,
    dependent: BTreeMap<Statistic, Box<dyn Accumulator>>,
}

impl MetricAggregationState {
    fn new(
        metric_type: MetricType,
        specified: &BTreeSet<Statistic>,
        dependent: &BTreeSet<Statistic>,
    ) -> Self {
        Self {
            metric_type,
            unit: None,
            population_size: 0,
            specified: specified
                .iter()
                .map(|s| (*s, s.new_accumulator()))
                .collect(),
            dependent: dependent
                .iter()
                .map(|s| (*s, s.new_accumulator()))
                .collect(),
        }
    }

    fn accumulators_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Accumulator>> {
        self.specified.values_mut().chain(self.dependent.values_mut())
    }

    fn accumulator_mut(&mut self, statistic: Statistic) -> Option<&mut Box<dyn Accumulator>> {
        self.specified
            .get_mut(&statistic)
            .or_else(|| self.dependent.get_mut(&statistic))
    }
}

impl Bucket {
    pub fn new(
        key: Key,
        period_start: DateTime<Utc>,
        period: Duration,
        resolver: Arc<StatisticResolver>,
    ) -> Self {
        Self {
            key,
            period_start,
            period,
            resolver,
            metrics: HashMap::default(),
        }
    }

    pub fn period_start(&self) -> DateTime<Utc> {
        self.period_start
    }

    /// Ingests one metric's samples. Returns the number of samples dropped
    /// for unit inconsistency.
    pub fn record(&mut self, name: &str, metric: &Metric) -> u64 {
        if !self.metrics.contains_key(name) {
            let specified = self.resolver.specified_for(name, metric.metric_type);
            let dependent = self.resolver.dependent_for(name, metric.metric_type);
            self.metrics.insert(
                name.to_string(),
                MetricAggregationState::new(metric.metric_type, &specified, &dependent),
            );
        }
        let Some(state) = self.metrics.get_mut(name) else {
            return 0;
        };

        if state.metric_type != metric.metric_type {
            debug!(
                metric = name,
                first = ?state.metric_type,
                now = ?metric.metric_type,
                "metric changed type within a period"
            );
        }

        let mut dropped = 0u64;
        for quantity in &metric.values {
            if !quantity.value.is_finite() {
                warn!(metric = name, value = quantity.value, "dropping non-finite sample");
                dropped += 1;
                continue;
            }
            // One unit gate per metric; accumulators then never disagree.
            if let Err(error) =
                reconcile_unit(&mut state.unit, state.population_size > 0, quantity)
            {
                warn!(metric = name, %error, "dropping sample");
                dropped += 1;
                continue;
            }
            for accumulator in state.accumulators_mut() {
                // Unreachable after the unit gate above.
                if let Err(error) = accumulator.accumulate(quantity) {
                    warn!(metric = name, %error, "accumulator rejected sample");
                }
            }
            state.population_size += 1;
        }

        dropped += self.merge_precomputed(name, metric);
        dropped
    }

    /// Merges statistics pre-computed by an upstream aggregator.
    fn merge_precomputed(&mut self, name: &str, metric: &Metric) -> u64 {
        let mut dropped = 0u64;
        let Some(state) = self.metrics.get_mut(name) else {
            return 0;
        };
        for (statistic_name, values) in &metric.statistics {
            let statistic: Statistic = match statistic_name.parse() {
                Ok(statistic) => statistic,
                Err(error) => {
                    warn!(metric = name, %error, "ignoring pre-aggregated statistic");
                    dropped += values.len() as u64;
                    continue;
                }
            };
            let Some(accumulator) = state.accumulator_mut(statistic) else {
                // Not tracked for this metric; nothing to merge into.
                continue;
            };
            for value in values {
                if let Err(error) = accumulator.accumulate_calculated(value) {
                    warn!(
                        metric = name,
                        statistic = %statistic,
                        %error,
                        "dropping pre-aggregated value"
                    );
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Evaluates all accumulators and produces this bucket's emission.
    ///
    /// Dependencies are evaluated before their dependents and receive the
    /// live calculator instances from this bucket. Only specified statistics
    /// appear in the result.
    pub fn close(self) -> PeriodicData {
        let mut entries = Vec::new();

        let mut metrics: Vec<(String, MetricAggregationState)> =
            self.metrics.into_iter().collect();
        metrics.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (name, state) in metrics {
            let specified: BTreeSet<Statistic> = state.specified.keys().copied().collect();
            let mut all = state.specified;
            all.extend(state.dependent);

            let mut results: BTreeMap<Statistic, crate::model::CalculatedValue> = BTreeMap::new();
            for statistic in topological_order(all.keys().copied()) {
                let dependencies: Dependencies<'_> = statistic
                    .dependencies()
                    .iter()
                    .filter_map(|d| all.get(d).map(|a| (*d, a.as_ref() as &dyn Accumulator)))
                    .collect();
                if let Some(accumulator) = all.get(&statistic) {
                    results.insert(statistic, accumulator.calculate(&dependencies));
                }
            }

            for statistic in specified {
                if let Some(value) = results.remove(&statistic) {
                    entries.push(AggregatedDatum {
                        metric: name.clone(),
                        statistic,
                        value: value.value,
                        population_size: state.population_size,
                        supporting_data: value.data,
                    });
                }
            }
        }

        PeriodicData {
            period: self.period,
            period_start: self.period_start,
            key: self.key,
            data: entries,
        }
    }
}
