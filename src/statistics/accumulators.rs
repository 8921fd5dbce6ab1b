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

//! Built-in accumulator implementations
//!
//! min/max/sum/count are single-pass. mean and the percentiles are thin
//! pass-throughs: they hold no sample state and read their dependencies'
//! calculators when the bucket closes.

use super::{
    reconcile_unit, Accumulator, Dependencies, PercentileRank, Statistic, StatisticError,
};
use crate::model::{
    CalculatedValue, HistogramSupportingData, Quantity, SparseHistogram, SupportingData, Unit,
};
use std::any::Any;
use tracing::warn;

/// Smallest observed value
#[derive(Debug, Default)]
pub struct MinAccumulator {
    min: Option<f64>,
    unit: Option<Unit>,
}

impl Accumulator for MinAccumulator {
    fn statistic(&self) -> Statistic {
        Statistic::Min
    }

    fn accumulate(&mut self, quantity: &Quantity) -> Result<(), StatisticError> {
        let value = reconcile_unit(&mut self.unit, self.min.is_some(), quantity)?;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        Ok(())
    }

    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), StatisticError> {
        self.accumulate(&value.value)
    }

    fn calculate(&self, _dependencies: &Dependencies<'_>) -> CalculatedValue {
        CalculatedValue::scalar(Quantity {
            value: self.min.unwrap_or(0.0),
            unit: self.unit,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Largest observed value
#[derive(Debug, Default)]
pub struct MaxAccumulator {
    max: Option<f64>,
    unit: Option<Unit>,
}

impl Accumulator for MaxAccumulator {
    fn statistic(&self) -> Statistic {
        Statistic::Max
    }

    fn accumulate(&mut self, quantity: &Quantity) -> Result<(), StatisticError> {
        let value = reconcile_unit(&mut self.unit, self.max.is_some(), quantity)?;
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        Ok(())
    }

    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), StatisticError> {
        self.accumulate(&value.value)
    }

    fn calculate(&self, _dependencies: &Dependencies<'_>) -> CalculatedValue {
        CalculatedValue::scalar(Quantity {
            value: self.max.unwrap_or(0.0),
            unit: self.unit,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Running sum of observed values
#[derive(Debug, Default)]
pub struct SumAccumulator {
    sum: f64,
    count: u64,
    unit: Option<Unit>,
}

impl Accumulator for SumAccumulator {
    fn statistic(&self) -> Statistic {
        Statistic::Sum
    }

    fn accumulate(&mut self, quantity: &Quantity) -> Result<(), StatisticError> {
        let value = reconcile_unit(&mut self.unit, self.count > 0, quantity)?;
        self.sum += value;
        self.count += 1;
        Ok(())
    }

    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), StatisticError> {
        self.accumulate(&value.value)
    }

    fn calculate(&self, _dependencies: &Dependencies<'_>) -> CalculatedValue {
        CalculatedValue::scalar(Quantity {
            value: self.sum,
            unit: self.unit,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Number of observed samples. Unitless; pre-aggregated counts merge by
/// adding their value.
#[derive(Debug, Default)]
pub struct CountAccumulator {
    count: f64,
}

impl Accumulator for CountAccumulator {
    fn statistic(&self) -> Statistic {
        Statistic::Count
    }

    fn accumulate(&mut self, _quantity: &Quantity) -> Result<(), StatisticError> {
        self.count += 1.0;
        Ok(())
    }

    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), StatisticError> {
        self.count += value.value.value;
        Ok(())
    }

    fn calculate(&self, _dependencies: &Dependencies<'_>) -> CalculatedValue {
        CalculatedValue::scalar(Quantity::new(self.count))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Arithmetic mean, computed as sum/count at evaluation time
#[derive(Debug)]
pub struct MeanAccumulator;

impl Accumulator for MeanAccumulator {
    fn statistic(&self) -> Statistic {
        Statistic::Mean
    }

    fn accumulate(&mut self, _quantity: &Quantity) -> Result<(), StatisticError> {
        // Samples are held by the sum and count dependencies.
        Ok(())
    }

    fn accumulate_calculated(&mut self, _value: &CalculatedValue) -> Result<(), StatisticError> {
        Err(StatisticError::UnsupportedData)
    }

    fn calculate(&self, dependencies: &Dependencies<'_>) -> CalculatedValue {
        let empty = Dependencies::new();
        let sum = dependencies
            .get(&Statistic::Sum)
            .map(|calculator| calculator.calculate(&empty));
        let count = dependencies
            .get(&Statistic::Count)
            .map(|calculator| calculator.calculate(&empty));

        match (sum, count) {
            (Some(sum), Some(count)) if count.value.value > 0.0 => {
                CalculatedValue::scalar(Quantity {
                    value: sum.value.value / count.value.value,
                    unit: sum.value.unit,
                })
            }
            (Some(sum), _) => CalculatedValue::scalar(Quantity {
                value: 0.0,
                unit: sum.value.unit,
            }),
            _ => {
                warn!("mean evaluated without sum/count dependencies");
                CalculatedValue::scalar(Quantity::new(0.0))
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sample distribution in a sparse truncated-key histogram.
///
/// A supporting statistic: percentile calculators read its snapshot as a
/// dependency. Its own calculated value carries the snapshot as supporting
/// data with a nominal scalar of 1.0.
#[derive(Debug, Default)]
pub struct HistogramAccumulator {
    histogram: SparseHistogram,
    unit: Option<Unit>,
}

impl HistogramAccumulator {
    pub fn supporting_data(&self) -> HistogramSupportingData {
        HistogramSupportingData {
            snapshot: self.histogram.snapshot(),
            unit: self.unit,
        }
    }

    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }
}

impl Accumulator for HistogramAccumulator {
    fn statistic(&self) -> Statistic {
        Statistic::Histogram
    }

    fn accumulate(&mut self, quantity: &Quantity) -> Result<(), StatisticError> {
        let value = reconcile_unit(&mut self.unit, self.histogram.entries_count() > 0, quantity)?;
        self.histogram.record(value);
        Ok(())
    }

    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), StatisticError> {
        let Some(SupportingData::Histogram(data)) = &value.data else {
            return Err(StatisticError::UnsupportedData);
        };

        if self.histogram.entries_count() == 0 && self.unit.is_none() {
            self.unit = data.unit;
            self.histogram.merge(&data.snapshot);
            return Ok(());
        }

        match (self.unit, data.unit) {
            (expected, actual) if expected == actual => {
                self.histogram.merge(&data.snapshot);
                Ok(())
            }
            (Some(expected), Some(_)) => {
                let converted = data.converted_to(expected)?;
                self.histogram.merge(&converted.snapshot);
                Ok(())
            }
            (expected, actual) => Err(StatisticError::InconsistentUnit { expected, actual }),
        }
    }

    fn calculate(&self, _dependencies: &Dependencies<'_>) -> CalculatedValue {
        CalculatedValue {
            value: Quantity::new(1.0),
            data: Some(SupportingData::Histogram(self.supporting_data())),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Percentile of the sample distribution, read from the histogram dependency
#[derive(Debug)]
pub struct PercentileAccumulator {
    rank: PercentileRank,
}

impl PercentileAccumulator {
    pub fn new(rank: PercentileRank) -> Self {
        Self { rank }
    }
}

impl Accumulator for PercentileAccumulator {
    fn statistic(&self) -> Statistic {
        Statistic::Percentile(self.rank)
    }

    fn accumulate(&mut self, _quantity: &Quantity) -> Result<(), StatisticError> {
        // Samples are held by the histogram dependency.
        Ok(())
    }

    fn accumulate_calculated(&mut self, _value: &CalculatedValue) -> Result<(), StatisticError> {
        Err(StatisticError::UnsupportedData)
    }

    fn calculate(&self, dependencies: &Dependencies<'_>) -> CalculatedValue {
        let histogram = dependencies
            .get(&Statistic::Histogram)
            .and_then(|calculator| calculator.as_any().downcast_ref::<HistogramAccumulator>());

        match histogram {
            Some(histogram) => {
                let data = histogram.supporting_data();
                CalculatedValue::scalar(Quantity {
                    value: data.snapshot.value_at_percentile(self.rank.percent()),
                    unit: data.unit,
                })
            }
            None => {
                warn!(rank = %self.rank, "percentile evaluated without histogram dependency");
                CalculatedValue::scalar(Quantity::new(0.0))
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
