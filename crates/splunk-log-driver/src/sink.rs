// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch worker between the delivery queue and the collector.
//!
//! Records are grouped into batches and shipped in FIFO order, one request
//! in flight at a time. A batch is flushed when it reaches the configured
//! size or when the flush interval elapses, whichever comes first. Transient
//! failures retry the same batch with exponential backoff; permanent
//! failures and exhausted retries drop the batch and report it once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::SessionSettings;
use crate::error::DriverError;
use crate::hec::{build_event, EventTransport, HecEvent};
use crate::queue::RecordReceiver;
use crate::record::LogRecord;
use crate::{FLUSH_RETRY_BACKOFF_MS, FLUSH_RETRY_COUNT};

/// Batching and retry knobs, taken from the plugin config per session.
#[derive(Debug, Clone)]
pub struct SinkTuning {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_attempts: u32,
}

impl Default for SinkTuning {
    fn default() -> Self {
        SinkTuning {
            batch_size: 1000,
            flush_interval: Duration::from_secs(5),
            max_attempts: FLUSH_RETRY_COUNT,
        }
    }
}

/// Report for one batch the sink gave up on.
#[derive(Debug)]
pub struct BatchFailure {
    pub error: DriverError,
    pub records: usize,
}

/// Delivery totals returned when the sink drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub delivered: u64,
    pub dropped: u64,
}

pub struct Sink {
    receiver: RecordReceiver,
    transport: Arc<dyn EventTransport>,
    settings: Arc<SessionSettings>,
    tuning: SinkTuning,
    failures: mpsc::UnboundedSender<BatchFailure>,
    delivered: u64,
    dropped: u64,
}

impl Sink {
    pub fn new(
        receiver: RecordReceiver,
        transport: Arc<dyn EventTransport>,
        settings: Arc<SessionSettings>,
        tuning: SinkTuning,
        failures: mpsc::UnboundedSender<BatchFailure>,
    ) -> Sink {
        Sink {
            receiver,
            transport,
            settings,
            tuning,
            failures,
            delivered: 0,
            dropped: 0,
        }
    }

    /// Runs until the queue closes and drains, then flushes the remainder.
    pub async fn run(mut self) -> SinkStats {
        let mut interval = tokio::time::interval(self.tuning.flush_interval);
        // The first tick completes immediately.
        interval.tick().await;
        let mut batch: Vec<LogRecord> = Vec::with_capacity(self.tuning.batch_size);

        loop {
            tokio::select! {
                record = self.receiver.pop() => match record {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= self.tuning.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => {
                    self.flush(&mut batch).await;
                }
            }
        }

        self.flush(&mut batch).await;
        debug!(
            delivered = self.delivered,
            dropped = self.dropped,
            "sink drained"
        );
        SinkStats {
            delivered: self.delivered,
            dropped: self.dropped,
        }
    }

    async fn flush(&mut self, batch: &mut Vec<LogRecord>) {
        if batch.is_empty() {
            return;
        }
        let events: Vec<HecEvent> = batch
            .iter()
            .map(|record| build_event(&self.settings, record))
            .collect();
        let result = self.deliver(&events).await;
        let records = batch.len();
        self.receiver.acknowledge(records);
        batch.clear();

        match result {
            Ok(()) => self.delivered += records as u64,
            Err(error) => {
                self.dropped += records as u64;
                error!("dropping batch of {records} records: {error}");
                let _ = self.failures.send(BatchFailure { error, records });
            }
        }
    }

    async fn deliver(&self, events: &[HecEvent]) -> Result<(), DriverError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.transport.submit(events).await {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    if attempts >= self.tuning.max_attempts {
                        return Err(err);
                    }
                    debug!("transient delivery failure (attempt {attempts}): {err}");
                }
            }
            // Exponential backoff
            let backoff_ms = FLUSH_RETRY_BACKOFF_MS * (2_u64.pow(attempts - 1));
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }
}
