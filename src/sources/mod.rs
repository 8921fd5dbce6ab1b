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

//! Record sources
//!
//! Sources feed records into the aggregation pipeline through a channel.
//! Network listeners and wire-format parsers live outside this crate; the
//! built-in source reads newline-delimited JSON records (the crate's own
//! model) from standard input.

use crate::model::Record;
use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Channel for sending records from sources to aggregation
pub type RecordSender = mpsc::UnboundedSender<Record>;

/// Channel for receiving records in aggregation
pub type RecordReceiver = mpsc::UnboundedReceiver<Record>;

/// Trait for all record sources
#[async_trait]
pub trait Source: Send + Sync {
    /// Run the source, sending received records to the provided channel.
    /// Returns when the input is exhausted or the source is stopped.
    async fn start(&self, sender: RecordSender) -> Result<()>;

    /// Stop the source gracefully
    async fn stop(&self) -> Result<()>;

    /// Get the name of this source
    fn name(&self) -> &str;
}

/// Source reading newline-delimited JSON records from standard input
#[derive(Default)]
pub struct StdinSource {
    shutdown: Notify,
}

/// Parses one input line into a record; malformed lines are logged and
/// discarded.
pub fn parse_record_line(line: &str) -> Option<Record> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Record>(line) {
        Ok(record) => Some(record),
        Err(error) => {
            warn!(%error, "discarding unparseable record line");
            None
        }
    }
}

#[async_trait]
impl Source for StdinSource {
    async fn start(&self, sender: RecordSender) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(record) = parse_record_line(&line) {
                            if sender.send(record).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(%error, "stdin read failed");
                        break;
                    }
                },
            }
        }
        debug!("stdin source finished");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        Ok(())
    }

    fn name(&self) -> &str {
        "stdin"
    }
}
