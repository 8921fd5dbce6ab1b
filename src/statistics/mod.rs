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

//! Statistic algebra and the calculator/accumulator protocol
//!
//! Statistics are small value types addressable by name. A statistic may
//! depend on other statistics (mean on sum and count, percentiles on the
//! histogram); dependents receive the dependency's live calculator at
//! evaluation time rather than a flattened scalar, so a percentile can read
//! the histogram's full distribution.

use crate::model::{CalculatedValue, Quantity, Unit, UnitError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod accumulators;

pub use accumulators::{
    CountAccumulator, HistogramAccumulator, MaxAccumulator, MeanAccumulator, MinAccumulator,
    PercentileAccumulator, SumAccumulator,
};

/// A percentile rank in (0, 100], stored in thousandths of a percent so
/// equality and ordering are exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PercentileRank(u32);

impl PercentileRank {
    /// Creates a rank from a percent value; rejects values outside (0, 100].
    pub fn from_percent(percent: f64) -> Option<Self> {
        if percent.is_finite() && percent > 0.0 && percent <= 100.0 {
            Some(Self((percent * 1000.0).round() as u32))
        } else {
            None
        }
    }

    pub fn percent(self) -> f64 {
        f64::from(self.0) / 1000.0
    }
}

impl fmt::Display for PercentileRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.percent())
    }
}

/// The statistics the engine can compute.
///
/// Statistics are plain values: parsing the same name twice yields equal
/// values, so identity-by-name holds structurally and no interning registry
/// is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Statistic {
    Count,
    Histogram,
    Max,
    Mean,
    Min,
    Sum,
    /// Percentile of the sample distribution at the given rank
    Percentile(PercentileRank),
}

impl Statistic {
    pub const TP50: Statistic = Statistic::Percentile(PercentileRank(50_000));
    pub const TP75: Statistic = Statistic::Percentile(PercentileRank(75_000));
    pub const TP90: Statistic = Statistic::Percentile(PercentileRank(90_000));
    pub const TP95: Statistic = Statistic::Percentile(PercentileRank(95_000));
    pub const TP99: Statistic = Statistic::Percentile(PercentileRank(99_000));
    pub const TP99_9: Statistic = Statistic::Percentile(PercentileRank(99_900));

    /// The addressable name, e.g. `max` or `tp99.9`.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Statistics whose calculators this statistic requires at evaluation.
    pub fn dependencies(&self) -> &'static [Statistic] {
        match self {
            Statistic::Mean => &[Statistic::Sum, Statistic::Count],
            Statistic::Percentile(_) => &[Statistic::Histogram],
            _ => &[],
        }
    }

    /// A fresh accumulator for this statistic.
    pub fn new_accumulator(&self) -> Box<dyn Accumulator> {
        match self {
            Statistic::Count => Box::new(CountAccumulator::default()),
            Statistic::Histogram => Box::new(HistogramAccumulator::default()),
            Statistic::Max => Box::new(MaxAccumulator::default()),
            Statistic::Mean => Box::new(MeanAccumulator),
            Statistic::Min => Box::new(MinAccumulator::default()),
            Statistic::Sum => Box::new(SumAccumulator::default()),
            Statistic::Percentile(rank) => Box::new(PercentileAccumulator::new(*rank)),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Count => write!(f, "count"),
            Statistic::Histogram => write!(f, "histogram"),
            Statistic::Max => write!(f, "max"),
            Statistic::Mean => write!(f, "mean"),
            Statistic::Min => write!(f, "min"),
            Statistic::Sum => write!(f, "sum"),
            Statistic::Percentile(rank) => write!(f, "tp{rank}"),
        }
    }
}

/// Failure resolving a statistic name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown statistic: {0}")]
pub struct ParseStatisticError(pub String);

impl FromStr for Statistic {
    type Err = ParseStatisticError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "count" => Ok(Statistic::Count),
            "histogram" => Ok(Statistic::Histogram),
            "max" => Ok(Statistic::Max),
            "mean" => Ok(Statistic::Mean),
            "min" => Ok(Statistic::Min),
            "sum" => Ok(Statistic::Sum),
            other => other
                .strip_prefix("tp")
                .and_then(|suffix| suffix.parse::<f64>().ok())
                .and_then(PercentileRank::from_percent)
                .map(Statistic::Percentile)
                .ok_or_else(|| ParseStatisticError(other.to_string())),
        }
    }
}

impl Serialize for Statistic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Statistic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Failure ingesting a sample or pre-aggregated value into an accumulator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatisticError {
    #[error("sample unit {actual:?} inconsistent with accumulated unit {expected:?}")]
    InconsistentUnit {
        expected: Option<Unit>,
        actual: Option<Unit>,
    },

    #[error(transparent)]
    IncompatibleUnit(#[from] UnitError),

    #[error("pre-aggregated data cannot be merged into this statistic")]
    UnsupportedData,
}

/// Dependency calculators handed to a statistic at evaluation time,
/// keyed by the dependency statistic.
pub type Dependencies<'a> = BTreeMap<Statistic, &'a dyn Accumulator>;

/// Per-statistic state carrier: ingests raw samples and pre-aggregated
/// values, and produces a calculated value when a bucket closes.
pub trait Accumulator: Send + fmt::Debug {
    /// The statistic this accumulator computes.
    fn statistic(&self) -> Statistic;

    /// Ingests a raw sample.
    fn accumulate(&mut self, quantity: &Quantity) -> Result<(), StatisticError>;

    /// Merges a value pre-computed by an upstream aggregator.
    fn accumulate_calculated(&mut self, value: &CalculatedValue) -> Result<(), StatisticError>;

    /// Produces the final value. `dependencies` contains the live calculator
    /// for every statistic named by `Statistic::dependencies`.
    fn calculate(&self, dependencies: &Dependencies<'_>) -> CalculatedValue;

    /// Downcast hook so dependents can inspect richer state than a scalar.
    fn as_any(&self) -> &dyn Any;
}

/// Establishes or checks an accumulator's unit against an incoming sample,
/// converting the value where the units are compatible.
pub(crate) fn reconcile_unit(
    unit: &mut Option<Unit>,
    has_samples: bool,
    quantity: &Quantity,
) -> Result<f64, StatisticError> {
    if !has_samples && unit.is_none() {
        *unit = quantity.unit;
        return Ok(quantity.value);
    }
    match (*unit, quantity.unit) {
        (expected, actual) if expected == actual => Ok(quantity.value),
        (Some(expected), Some(actual)) => Ok(expected.convert(quantity.value, actual)?),
        (expected, actual) => Err(StatisticError::InconsistentUnit { expected, actual }),
    }
}

/// The transitive dependencies of a statistic set, excluding the set itself.
pub fn dependency_closure(statistics: &BTreeSet<Statistic>) -> BTreeSet<Statistic> {
    let mut closure = BTreeSet::new();
    let mut stack: Vec<Statistic> = statistics.iter().copied().collect();
    while let Some(statistic) = stack.pop() {
        for dependency in statistic.dependencies() {
            if !statistics.contains(dependency) && closure.insert(*dependency) {
                stack.push(*dependency);
            }
        }
    }
    closure
}

/// Orders statistics so every dependency precedes its dependents.
///
/// The input must be closed under dependencies; the built-in graph is
/// acyclic by construction (histogram, sum, and count are terminal).
pub fn topological_order<I>(statistics: I) -> Vec<Statistic>
where
    I: IntoIterator<Item = Statistic>,
{
    let members: BTreeSet<Statistic> = statistics.into_iter().collect();
    let mut ordered = Vec::with_capacity(members.len());
    let mut visited = BTreeSet::new();
    for statistic in &members {
        visit(*statistic, &members, &mut visited, &mut ordered);
    }
    ordered
}

fn visit(
    statistic: Statistic,
    members: &BTreeSet<Statistic>,
    visited: &mut BTreeSet<Statistic>,
    ordered: &mut Vec<Statistic>,
) {
    if !visited.insert(statistic) {
        return;
    }
    for dependency in statistic.dependencies() {
        if members.contains(dependency) {
            visit(*dependency, members, visited, ordered);
        }
    }
    ordered.push(statistic);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_names() {
        assert_eq!("min".parse::<Statistic>().unwrap(), Statistic::Min);
        assert_eq!("max".parse::<Statistic>().unwrap(), Statistic::Max);
        assert_eq!("sum".parse::<Statistic>().unwrap(), Statistic::Sum);
        assert_eq!("count".parse::<Statistic>().unwrap(), Statistic::Count);
        assert_eq!("mean".parse::<Statistic>().unwrap(), Statistic::Mean);
        assert_eq!(
            "histogram".parse::<Statistic>().unwrap(),
            Statistic::Histogram
        );
    }

    #[test]
    fn test_parse_percentiles() {
        assert_eq!("tp50".parse::<Statistic>().unwrap(), Statistic::TP50);
        assert_eq!("tp99".parse::<Statistic>().unwrap(), Statistic::TP99);
        assert_eq!("tp99.9".parse::<Statistic>().unwrap(), Statistic::TP99_9);

        let parametric = "tp12.5".parse::<Statistic>().unwrap();
        match parametric {
            Statistic::Percentile(rank) => assert_eq!(rank.percent(), 12.5),
            other => panic!("expected percentile, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_same_name_twice_is_equal() {
        assert_eq!(
            "tp99.9".parse::<Statistic>().unwrap(),
            "tp99.9".parse::<Statistic>().unwrap()
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_out_of_range() {
        assert!("median".parse::<Statistic>().is_err());
        assert!("tp0".parse::<Statistic>().is_err());
        assert!("tp101".parse::<Statistic>().is_err());
        assert!("tp-5".parse::<Statistic>().is_err());
        assert!("tpabc".parse::<Statistic>().is_err());
    }

    #[test]
    fn test_names_round_trip() {
        for statistic in [
            Statistic::Min,
            Statistic::Max,
            Statistic::Sum,
            Statistic::Count,
            Statistic::Mean,
            Statistic::Histogram,
            Statistic::TP50,
            Statistic::TP99_9,
        ] {
            assert_eq!(
                statistic.name().parse::<Statistic>().unwrap(),
                statistic,
                "name {} did not round trip",
                statistic.name()
            );
        }
        assert_eq!(Statistic::TP99_9.name(), "tp99.9");
        assert_eq!(Statistic::TP50.name(), "tp50");
    }

    #[test]
    fn test_serde_as_name() {
        let json = serde_json::to_string(&Statistic::TP99).unwrap();
        assert_eq!(json, "\"tp99\"");
        let back: Statistic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Statistic::TP99);
    }

    #[test]
    fn test_dependencies() {
        assert!(Statistic::Min.dependencies().is_empty());
        assert!(Statistic::Histogram.dependencies().is_empty());
        assert_eq!(
            Statistic::Mean.dependencies(),
            &[Statistic::Sum, Statistic::Count]
        );
        assert_eq!(Statistic::TP99.dependencies(), &[Statistic::Histogram]);
    }

    #[test]
    fn test_dependency_closure_excludes_specified() {
        let specified: BTreeSet<Statistic> =
            [Statistic::Mean, Statistic::Sum, Statistic::TP99].into();
        let closure = dependency_closure(&specified);
        assert_eq!(
            closure,
            BTreeSet::from([Statistic::Count, Statistic::Histogram])
        );
    }

    #[test]
    fn test_topological_order_puts_dependencies_first() {
        let ordered = topological_order([
            Statistic::TP99,
            Statistic::Mean,
            Statistic::Histogram,
            Statistic::Sum,
            Statistic::Count,
        ]);

        let position = |s: Statistic| ordered.iter().position(|x| *x == s).unwrap();
        assert!(position(Statistic::Histogram) < position(Statistic::TP99));
        assert!(position(Statistic::Sum) < position(Statistic::Mean));
        assert!(position(Statistic::Count) < position(Statistic::Mean));
        assert_eq!(ordered.len(), 5);
    }

    #[test]
    fn test_reconcile_unit_establishes_then_converts() {
        let mut unit = None;
        let v = reconcile_unit(&mut unit, false, &Quantity::with_unit(2.0, Unit::Second)).unwrap();
        assert_eq!(v, 2.0);
        assert_eq!(unit, Some(Unit::Second));

        let v =
            reconcile_unit(&mut unit, true, &Quantity::with_unit(500.0, Unit::Millisecond))
                .unwrap();
        assert_eq!(v, 0.5);

        let err = reconcile_unit(&mut unit, true, &Quantity::with_unit(1.0, Unit::Byte))
            .unwrap_err();
        assert!(matches!(err, StatisticError::IncompatibleUnit(_)));

        let err = reconcile_unit(&mut unit, true, &Quantity::new(1.0)).unwrap_err();
        assert!(matches!(err, StatisticError::InconsistentUnit { .. }));
    }
}
