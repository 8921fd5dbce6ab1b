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

//! Configuration parsing
//!
//! JSON configuration with camelCase keys and ISO-8601 durations (`PT60S`,
//! `PT5M`). Statistic sets are given by name; per-metric overrides are an
//! ordered list of regex patterns resolved first-match-wins.

use crate::statistics::Statistic;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Aggregation daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AggregatorConfig {
    /// Aggregation windows, e.g. PT60S and PT5M
    #[serde(default = "default_periods", with = "duration_list_serde")]
    pub periods: Vec<Duration>,

    /// Default statistics for timer metrics
    #[serde(default = "default_timer_statistics")]
    pub timer_statistics: BTreeSet<Statistic>,

    /// Default statistics for counter metrics
    #[serde(default = "default_counter_statistics")]
    pub counter_statistics: BTreeSet<Statistic>,

    /// Default statistics for gauge metrics
    #[serde(default = "default_gauge_statistics")]
    pub gauge_statistics: BTreeSet<Statistic>,

    /// Per-metric-name statistic overrides; first matching pattern wins
    #[serde(default)]
    pub statistics: Vec<PatternStatisticsConfig>,

    /// Maximum sample age still accepted; defaults to twice the longest period
    #[serde(default, with = "duration_opt_serde", skip_serializing_if = "Option::is_none")]
    pub lateness_horizon: Option<Duration>,

    /// Grace period a bucket stays open past its nominal end; defaults to the
    /// bucket's own period length
    #[serde(default, with = "duration_opt_serde", skip_serializing_if = "Option::is_none")]
    pub close_delay: Option<Duration>,

    /// Bounded per-worker mailbox size; overflow drops records
    #[serde(default = "default_worker_mailbox_capacity")]
    pub worker_mailbox_capacity: usize,

    /// Log level for the daemon shell
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One per-metric statistics override
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternStatisticsConfig {
    /// Full-match regex over the metric name
    pub pattern: String,

    /// Statistics to compute for matching metrics
    pub statistics: BTreeSet<Statistic>,
}

impl AggregatorConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&contents)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.periods.is_empty() {
            bail!("at least one aggregation period is required");
        }
        if self.periods.iter().any(|p| p.is_zero()) {
            bail!("aggregation periods must be positive");
        }
        if self.worker_mailbox_capacity == 0 {
            bail!("workerMailboxCapacity must be positive");
        }
        for entry in &self.statistics {
            Regex::new(&entry.pattern)
                .with_context(|| format!("invalid metric pattern: {}", entry.pattern))?;
        }
        Ok(())
    }

    /// The lateness horizon, defaulted from the configured periods.
    pub fn effective_lateness_horizon(&self) -> Duration {
        self.lateness_horizon.unwrap_or_else(|| {
            2 * self
                .periods
                .iter()
                .copied()
                .max()
                .unwrap_or(Duration::from_secs(60))
        })
    }

    /// The close delay for a given period.
    pub fn effective_close_delay(&self, period: Duration) -> Duration {
        self.close_delay.unwrap_or(period)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            periods: default_periods(),
            timer_statistics: default_timer_statistics(),
            counter_statistics: default_counter_statistics(),
            gauge_statistics: default_gauge_statistics(),
            statistics: Vec::new(),
            lateness_horizon: None,
            close_delay: None,
            worker_mailbox_capacity: default_worker_mailbox_capacity(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_periods() -> Vec<Duration> {
    vec![Duration::from_secs(60)]
}

fn default_timer_statistics() -> BTreeSet<Statistic> {
    [
        Statistic::Min,
        Statistic::Max,
        Statistic::Mean,
        Statistic::Sum,
        Statistic::Count,
        Statistic::TP50,
        Statistic::TP90,
        Statistic::TP99,
    ]
    .into()
}

fn default_counter_statistics() -> BTreeSet<Statistic> {
    [
        Statistic::Min,
        Statistic::Max,
        Statistic::Mean,
        Statistic::Sum,
        Statistic::Count,
    ]
    .into()
}

fn default_gauge_statistics() -> BTreeSet<Statistic> {
    [Statistic::Min, Statistic::Max, Statistic::Mean].into()
}

fn default_worker_mailbox_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

// Duration serialization helpers (ISO-8601, PT-prefixed)
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_iso(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        from_iso(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn to_iso(duration: &Duration) -> String {
        let seconds = duration.as_secs_f64();
        format!("PT{seconds}S")
    }

    pub(crate) fn from_iso(s: &str) -> Result<Duration, String> {
        let body = s
            .strip_prefix("PT")
            .ok_or_else(|| format!("Invalid duration format: {s}"))?;
        let (number, scale) = match body.as_bytes().last() {
            Some(b'S') => (&body[..body.len() - 1], 1.0),
            Some(b'M') => (&body[..body.len() - 1], 60.0),
            Some(b'H') => (&body[..body.len() - 1], 3600.0),
            _ => return Err(format!("Invalid duration format: {s}")),
        };
        let value: f64 = number
            .parse()
            .map_err(|_| format!("Invalid duration format: {s}"))?;
        if value < 0.0 {
            return Err(format!("Negative duration: {s}"));
        }
        Ok(Duration::from_secs_f64(value * scale))
    }
}

pub(crate) mod duration_opt_serde {
    use super::duration_serde::{from_iso, to_iso};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&to_iso(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| from_iso(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

pub(crate) mod duration_list_serde {
    use super::duration_serde::{from_iso, to_iso};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(durations.iter().map(to_iso))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings: Vec<String> = Vec::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| from_iso(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
