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

//! Core data model for metrics aggregation
//!
//! Defines the fundamental data structures used throughout the daemon for
//! representing samples, records, units, and calculated values.

use ahash::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod histogram;

pub use histogram::{HistogramSnapshot, OrderedFloat, SparseHistogram};

/// A complete metrics record containing multiple metrics with shared dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier for this record
    pub id: String,

    /// Timestamp the samples in this record were measured at
    pub time: DateTime<Utc>,

    /// Wall-clock time the record entered the pipeline
    #[serde(default = "Utc::now")]
    pub received_time: DateTime<Utc>,

    /// Key-value pairs of dimensions/tags associated with all metrics in this record
    pub dimensions: HashMap<String, String>,

    /// Annotations - additional metadata not used for routing
    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Map of metric name to metric data
    pub metrics: HashMap<String, Metric>,
}

impl Record {
    /// The routing key derived from this record's dimensions.
    pub fn key(&self) -> Key {
        Key::from_dimensions(&self.dimensions)
    }
}

/// A single metric with its type and sample values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// The type of metric (counter, gauge, timer)
    #[serde(rename = "type")]
    pub metric_type: MetricType,

    /// Raw sample values
    pub values: Vec<Quantity>,

    /// Pre-aggregated statistics from an upstream aggregator, by statistic name.
    /// Merged into the matching accumulators instead of raw samples.
    #[serde(default)]
    pub statistics: BTreeMap<String, Vec<CalculatedValue>>,
}

/// Type of metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Monotonically increasing counter
    Counter,
    /// Point-in-time value
    Gauge,
    /// Duration measurement
    Timer,
}

/// A single measurement value with optional unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    /// The numeric value
    pub value: f64,

    /// Optional unit information
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
}

impl Quantity {
    /// A unitless quantity.
    pub fn new(value: f64) -> Self {
        Self { value, unit: None }
    }

    /// A quantity with a unit.
    pub fn with_unit(value: f64, unit: Unit) -> Self {
        Self {
            value,
            unit: Some(unit),
        }
    }
}

/// Category of unit; conversion is only defined within a family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitFamily {
    /// Time-based units
    Time,
    /// Data size units
    DataSize,
}

/// Units a sample value may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Bit,
    Byte,
    Kilobyte,
    Megabyte,
    Gigabyte,
    Terabyte,
}

/// Failure converting between units
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("cannot convert {from:?} to {to:?}: incompatible unit families")]
    Incompatible { from: Unit, to: Unit },
}

impl Unit {
    /// The family this unit belongs to.
    pub fn family(&self) -> UnitFamily {
        match self {
            Unit::Nanosecond
            | Unit::Microsecond
            | Unit::Millisecond
            | Unit::Second
            | Unit::Minute
            | Unit::Hour
            | Unit::Day
            | Unit::Week => UnitFamily::Time,
            Unit::Bit
            | Unit::Byte
            | Unit::Kilobyte
            | Unit::Megabyte
            | Unit::Gigabyte
            | Unit::Terabyte => UnitFamily::DataSize,
        }
    }

    /// Multiplier from this unit to the family base unit (seconds, bytes).
    fn scale(&self) -> f64 {
        match self {
            Unit::Nanosecond => 1e-9,
            Unit::Microsecond => 1e-6,
            Unit::Millisecond => 1e-3,
            Unit::Second => 1.0,
            Unit::Minute => 60.0,
            Unit::Hour => 3600.0,
            Unit::Day => 86400.0,
            Unit::Week => 604800.0,
            Unit::Bit => 0.125,
            Unit::Byte => 1.0,
            Unit::Kilobyte => 1024.0,
            Unit::Megabyte => 1024.0 * 1024.0,
            Unit::Gigabyte => 1024.0 * 1024.0 * 1024.0,
            Unit::Terabyte => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        }
    }

    /// Converts `value` expressed in `from` into this unit.
    pub fn convert(self, value: f64, from: Unit) -> Result<f64, UnitError> {
        if self.family() != from.family() {
            return Err(UnitError::Incompatible { from, to: self });
        }
        Ok(value * from.scale() / self.scale())
    }
}

/// Routing identity of a record: the content of its dimension map.
///
/// Keys compare and hash by content; the map is kept sorted so two records
/// with the same dimensions in any order produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(BTreeMap<String, String>);

impl Key {
    pub fn from_dimensions(dimensions: &HashMap<String, String>) -> Self {
        Self(
            dimensions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn dimensions(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Key {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A value produced by a calculator, with optional statistic-specific payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedValue {
    /// The computed value
    pub value: Quantity,

    /// Supporting data consumable by dependent calculators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SupportingData>,
}

impl CalculatedValue {
    pub fn scalar(value: Quantity) -> Self {
        Self { value, data: None }
    }
}

/// Auxiliary payload carried by some calculated values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SupportingData {
    /// A histogram distribution snapshot
    Histogram(HistogramSupportingData),
}

/// Snapshot of a histogram distribution plus the unit its buckets are in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramSupportingData {
    pub snapshot: HistogramSnapshot,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
}

impl HistogramSupportingData {
    /// Re-buckets the snapshot into a new unit. A unitless snapshot is
    /// returned unchanged.
    pub fn converted_to(&self, new_unit: Unit) -> Result<Self, UnitError> {
        let Some(unit) = self.unit else {
            return Ok(self.clone());
        };
        let mut histogram = SparseHistogram::new();
        for (bucket, count) in self.snapshot.buckets() {
            histogram.record_n(new_unit.convert(bucket, unit)?, count);
        }
        Ok(Self {
            snapshot: histogram.snapshot(),
            unit: Some(new_unit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::HashMapExt;

    #[test]
    fn test_unit_conversion_within_family() {
        assert_eq!(Unit::Millisecond.convert(1.0, Unit::Second).unwrap(), 1000.0);
        assert_eq!(Unit::Second.convert(500.0, Unit::Millisecond).unwrap(), 0.5);
        assert_eq!(Unit::Kilobyte.convert(2048.0, Unit::Byte).unwrap(), 2.0);
        assert_eq!(Unit::Byte.convert(1.0, Unit::Byte).unwrap(), 1.0);
    }

    #[test]
    fn test_unit_conversion_across_families_fails() {
        let err = Unit::Byte.convert(1.0, Unit::Second).unwrap_err();
        assert_eq!(
            err,
            UnitError::Incompatible {
                from: Unit::Second,
                to: Unit::Byte
            }
        );
    }

    #[test]
    fn test_key_is_order_insensitive() {
        let mut a = HashMap::new();
        a.insert("host".to_string(), "web-1".to_string());
        a.insert("service".to_string(), "api".to_string());

        let mut b = HashMap::new();
        b.insert("service".to_string(), "api".to_string());
        b.insert("host".to_string(), "web-1".to_string());

        assert_eq!(Key::from_dimensions(&a), Key::from_dimensions(&b));
        assert_eq!(
            Key::from_dimensions(&a).to_string(),
            "host=web-1,service=api"
        );
    }

    #[test]
    fn test_metric_serialization() {
        let metric = Metric {
            metric_type: MetricType::Timer,
            values: vec![Quantity::with_unit(1.5, Unit::Second)],
            statistics: BTreeMap::new(),
        };

        let json = serde_json::to_string(&metric).unwrap();
        let deserialized: Metric = serde_json::from_str(&json).unwrap();

        assert_eq!(metric, deserialized);
    }

    #[test]
    fn test_record_deserialization_defaults() {
        let json = r#"
        {
            "id": "r-1",
            "time": "2024-05-01T00:00:00Z",
            "dimensions": {"host": "web-1"},
            "metrics": {
                "latency": {"type": "timer", "values": [{"value": 12.0, "unit": "millisecond"}]}
            }
        }
        "#;

        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(record.key().to_string(), "host=web-1");
        assert!(record.annotations.is_empty());
        assert_eq!(
            record.metrics["latency"].values[0],
            Quantity::with_unit(12.0, Unit::Millisecond)
        );
    }

    #[test]
    fn test_histogram_supporting_data_unit_conversion() {
        let mut histogram = SparseHistogram::new();
        histogram.record(1.0);
        histogram.record(2.0);

        let data = HistogramSupportingData {
            snapshot: histogram.snapshot(),
            unit: Some(Unit::Second),
        };

        let converted = data.converted_to(Unit::Millisecond).unwrap();
        assert_eq!(converted.snapshot.entries_count(), 2);
        let buckets: Vec<f64> = converted.snapshot.buckets().map(|(b, _)| b).collect();
        assert!(buckets.iter().any(|b| (*b - 1000.0).abs() < 10.0));
        assert!(buckets.iter().any(|b| (*b - 2000.0).abs() < 20.0));
    }
}
