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

//! # Metrics Aggregation Daemon
//!
//! A streaming engine that ingests dimensioned metric samples, groups them
//! into fixed-duration periods per dimension key, computes configured
//! statistics, and emits periodic summaries to a sink.
//!
//! ## Pipeline
//!
//! - **Sources** push records into the aggregator.
//! - The **aggregator** routes each record to per-key period workers, one
//!   per configured period, created on first sight of a key.
//! - Each **period worker** owns the timeline for its key: records land in
//!   time buckets, buckets stay open through a close delay to absorb late
//!   samples, then close in order and emit.
//! - **Sinks** receive one periodic aggregate per closed bucket.
//!
//! ## Example
//!
//! ```rust,no_run
//! use aggd::{config::AggregatorConfig, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AggregatorConfig::from_file("config.json")?;
//!     let daemon = Daemon::new(&config)?;
//!     daemon.start().await?;
//!     daemon.wait_for_shutdown().await?;
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod aggregation;
pub mod config;
pub mod model;
pub mod sinks;
pub mod sources;
pub mod statistics;

use aggregation::Aggregator;
use config::AggregatorConfig;
use sinks::{LoggingSink, Sink};
use sources::{Source, StdinSource};

/// Main daemon instance wiring source, aggregator, and sink
pub struct Daemon {
    aggregator: Arc<Aggregator>,
    source: Arc<StdinSource>,
    sink: Arc<dyn Sink>,
    shutdown_notify: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    /// Create a new daemon with the given configuration
    pub fn new(config: &AggregatorConfig) -> Result<Self> {
        let sink: Arc<dyn Sink> = Arc::new(LoggingSink::new("logging"));
        let aggregator = Arc::new(Aggregator::new(config, Arc::clone(&sink))?);
        Ok(Self {
            aggregator,
            source: Arc::new(StdinSource::default()),
            sink,
            shutdown_notify: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the pipeline and install signal handlers
    pub async fn start(&self) -> Result<()> {
        info!("Starting services");
        self.aggregator.launch();

        let (sender, mut receiver) = mpsc::unbounded_channel();

        let source = Arc::clone(&self.source);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        let source_task = tokio::spawn(async move {
            if let Err(error) = source.start(sender).await {
                warn!(%error, "source failed");
            }
            // Input exhausted; let the daemon wind down.
            shutdown_notify.notify_one();
        });

        let aggregator = Arc::clone(&self.aggregator);
        let forward_task = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                aggregator.observe(record);
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(source_task);
            tasks.push(forward_task);
        }

        self.setup_signal_handlers().await;

        info!("All services started successfully");
        Ok(())
    }

    /// Wait for a shutdown signal, then stop everything in order:
    /// source, aggregator (draining open buckets), sink.
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        self.shutdown_notify.notified().await;
        info!("Shutdown signal received, stopping services...");

        self.source.stop().await?;
        self.aggregator.shutdown().await;
        self.sink.close().await?;

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }

        let dropped = self.aggregator.overflow_dropped();
        if dropped > 0 {
            warn!(records = dropped, "records were dropped on worker mailbox overflow");
        }
        info!("Shutdown complete");
        Ok(())
    }

    /// Request shutdown programmatically.
    pub fn trigger_shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    async fn setup_signal_handlers(&self) {
        let shutdown_notify = Arc::clone(&self.shutdown_notify);

        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown_notify.notify_one();
                }
                Err(err) => {
                    warn!("Failed to listen for SIGINT: {}", err);
                }
            }
        });

        #[cfg(unix)]
        {
            let shutdown_notify = Arc::clone(&self.shutdown_notify);
            tokio::spawn(async move {
                let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");

                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
                shutdown_notify.notify_one();
            });
        }
    }
}
