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

//! Sinks for publishing periodic aggregates
//!
//! Sinks receive one `PeriodicData` per closed bucket and forward it
//! downstream. `record` must be safe for concurrent invocation; delivery is
//! best-effort and failures are logged by the caller, never retried.

use crate::model::{Key, Quantity, SupportingData};
use crate::statistics::Statistic;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Aggregated results for one (key, period, period start)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicData {
    /// Length of the aggregation period
    #[serde(with = "crate::config::duration_serde")]
    pub period: Duration,

    /// Start of the aggregation window (inclusive; the end is exclusive)
    pub period_start: DateTime<Utc>,

    /// The dimension key this data was aggregated for
    pub key: Key,

    /// One entry per (metric, specified statistic)
    pub data: Vec<AggregatedDatum>,
}

/// A single computed statistic for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedDatum {
    pub metric: String,

    pub statistic: Statistic,

    pub value: Quantity,

    /// Number of raw samples behind this value
    pub population_size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_data: Option<SupportingData>,
}

/// Trait for all sinks
#[async_trait]
pub trait Sink: Send + Sync {
    /// Publishes one periodic aggregate. Must be safe for concurrent callers.
    async fn record(&self, data: PeriodicData) -> Result<()>;

    /// Called once on shutdown; no `record` calls follow.
    async fn close(&self) -> Result<()>;

    /// Get the name of this sink
    fn name(&self) -> &str;
}

/// Sink that writes each periodic aggregate as a JSON log line
pub struct LoggingSink {
    name: String,
}

impl LoggingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Sink for LoggingSink {
    async fn record(&self, data: PeriodicData) -> Result<()> {
        let payload = serde_json::to_string(&data)?;
        info!(sink = %self.name, key = %data.key, "{payload}");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
