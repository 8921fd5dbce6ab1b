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

//! Sparse histogram with truncated-key bucketing
//!
//! Bucket keys are sample values with the low 45 bits of the IEEE-754 bit
//! pattern masked off, preserving sign, exponent, and the high 7 mantissa
//! bits. This gives roughly 0.78% relative precision and O(1) bucketing.
//! The mask is part of the exchange contract: snapshots are merged across
//! nodes and all parties must agree on bucket boundaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bucketing mask applied to the raw bit pattern of each sample.
pub const TRUNCATION_MASK: u64 = 0xffff_e000_0000_0000;

/// Wrapper for f64 that implements Ord for use in BTreeMap
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl Eq for OrderedFloat {}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .partial_cmp(&other.0)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Truncates a value to its bucket key.
pub fn truncate(value: f64) -> f64 {
    f64::from_bits(value.to_bits() & TRUNCATION_MASK)
}

/// A mutable sparse histogram
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseHistogram {
    data: BTreeMap<OrderedFloat, u64>,
    entries_count: u64,
}

impl SparseHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single sample.
    pub fn record(&mut self, value: f64) {
        self.record_n(value, 1);
    }

    /// Records `count` entries at `value`.
    pub fn record_n(&mut self, value: f64, count: u64) {
        if !value.is_finite() || count == 0 {
            return;
        }
        *self.data.entry(OrderedFloat(truncate(value))).or_insert(0) += count;
        self.entries_count += count;
    }

    /// Merges a snapshot into this histogram, bucket by bucket.
    pub fn merge(&mut self, snapshot: &HistogramSnapshot) {
        for (bucket, count) in snapshot.buckets() {
            *self.data.entry(OrderedFloat(bucket)).or_insert(0) += count;
        }
        self.entries_count += snapshot.entries_count();
    }

    pub fn entries_count(&self) -> u64 {
        self.entries_count
    }

    /// An immutable copy of the current state.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            data: self.data.clone(),
            entries_count: self.entries_count,
        }
    }
}

/// An immutable snapshot of histogram state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramSnapshot {
    #[serde(rename = "buckets", with = "bucket_list")]
    data: BTreeMap<OrderedFloat, u64>,
    entries_count: u64,
}

impl HistogramSnapshot {
    pub fn entries_count(&self) -> u64 {
        self.entries_count
    }

    pub fn is_empty(&self) -> bool {
        self.entries_count == 0
    }

    /// Buckets in ascending numeric order as (key, count) pairs.
    pub fn buckets(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.data.iter().map(|(k, v)| (k.0, *v))
    }

    /// The value of the bucket at `percentile`.
    ///
    /// Fractional sample positions round up, biasing toward 100%. An empty
    /// histogram yields 0.0.
    pub fn value_at_percentile(&self, percentile: f64) -> f64 {
        // The min guards against floating-point overshoot past the total.
        let target = ((self.entries_count as f64 * percentile / 100.0).ceil() as u64)
            .min(self.entries_count);
        let mut accumulated = 0u64;
        for (bucket, count) in self.buckets() {
            accumulated += count;
            if accumulated >= target {
                return bucket;
            }
        }
        0.0
    }
}

/// Serializes histogram buckets as an ordered list of [key, count] pairs;
/// JSON maps cannot carry numeric keys.
mod bucket_list {
    use super::OrderedFloat;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(data: &BTreeMap<OrderedFloat, u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let pairs: Vec<(f64, u64)> = data.iter().map(|(k, v)| (k.0, *v)).collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<OrderedFloat, u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pairs: Vec<(f64, u64)> = Vec::deserialize(deserializer)?;
        Ok(pairs
            .into_iter()
            .map(|(k, v)| (OrderedFloat(k), v))
            .collect())
    }
}
