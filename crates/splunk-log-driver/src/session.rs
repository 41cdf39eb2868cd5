// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! One container's logging pipeline.
//!
//! A session owns two tasks joined by the bounded record queue: a decoder
//! reading frames off the container fifo, and a sink shipping batches to the
//! collector. Status moves Starting -> Running -> Stopping -> Stopped; a
//! session is Failed on open failure, exhausted read retries, permanent
//! delivery failure or a drain that misses its deadline. Stopped and Failed
//! are terminal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use logdriver_proto::{EntryCodec, Frame};

use crate::config::{Config, SessionSettings};
use crate::error::DriverError;
use crate::hec::EventTransport;
use crate::partial::PartialBuffer;
use crate::queue::{record_queue, RecordSender};
use crate::record::LogRecord;
use crate::sink::{BatchFailure, Sink, SinkStats, SinkTuning};
use crate::FLUSH_RETRY_COUNT;

/// Pause between retries of a failed input read.
const READ_RETRY_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Shared status cell. Terminal states win over any later transition.
struct SessionState {
    tx: watch::Sender<SessionStatus>,
}

impl SessionState {
    fn new() -> SessionState {
        let (tx, _) = watch::channel(SessionStatus::Starting);
        SessionState { tx }
    }

    fn transition(&self, next: SessionStatus) {
        self.tx.send_if_modified(|current| {
            if matches!(*current, SessionStatus::Stopped | SessionStatus::Failed)
                || *current == next
            {
                return false;
            }
            *current = next;
            true
        });
    }

    fn current(&self) -> SessionStatus {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }
}

pub struct Session {
    container_id: String,
    fifo_path: PathBuf,
    state: Arc<SessionState>,
    sender: RecordSender,
    cancel: CancellationToken,
    decoder_task: JoinHandle<()>,
    sink_task: JoinHandle<SinkStats>,
    stop_timeout: Duration,
}

impl Session {
    /// Registers the pipeline tasks for one container and returns
    /// immediately with the session in Starting state. The decoder opens the
    /// fifo non-blocking, so a writer that has not attached yet delays the
    /// first read, never the caller.
    pub fn spawn(
        config: &Config,
        settings: SessionSettings,
        container_id: String,
        fifo_path: PathBuf,
        transport: Arc<dyn EventTransport>,
    ) -> Session {
        let state = Arc::new(SessionState::new());
        let (sender, receiver) = record_queue(config.channel_size);
        let cancel = CancellationToken::new();
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();

        let tuning = SinkTuning {
            batch_size: config.post_messages_batch_size,
            flush_interval: config.post_messages_frequency,
            max_attempts: FLUSH_RETRY_COUNT,
        };
        let sink = Sink::new(
            receiver,
            transport,
            Arc::new(settings),
            tuning,
            failure_tx,
        );

        let sink_state = Arc::clone(&state);
        let sink_container = container_id.clone();
        let sink_task = tokio::spawn(async move {
            let run = sink.run();
            tokio::pin!(run);
            let stats = loop {
                tokio::select! {
                    stats = &mut run => break stats,
                    Some(failure) = failure_rx.recv() => {
                        report_batch_failure(&sink_state, &sink_container, &failure);
                    }
                }
            };
            // A failure sent during the final flush may still be queued.
            while let Ok(failure) = failure_rx.try_recv() {
                report_batch_failure(&sink_state, &sink_container, &failure);
            }
            sink_state.transition(SessionStatus::Stopped);
            stats
        });

        let decoder = Decoder {
            fifo_path: fifo_path.clone(),
            container_id: container_id.clone(),
            sender: sender.clone(),
            partial: PartialBuffer::new(
                config.partial_msg_hold,
                config.partial_msg_buffer_maximum,
            ),
            state: Arc::clone(&state),
            cancel: cancel.clone(),
            max_read_retries: config.read_fifo_error_retries,
        };
        let decoder_task = tokio::spawn(decoder.run());

        Session {
            container_id,
            fifo_path,
            state,
            sender,
            cancel,
            decoder_task,
            sink_task,
            stop_timeout: config.stop_timeout,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.state.subscribe()
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Records pushed but not yet delivered or dropped.
    pub fn pending(&self) -> usize {
        self.sender.in_flight()
    }

    /// Graceful shutdown: stops the decoder, closes the queue and waits for
    /// the sink to drain, bounded by the configured stop timeout.
    pub async fn stop(self) -> Result<SinkStats, DriverError> {
        let Session {
            container_id,
            fifo_path,
            state,
            sender,
            cancel,
            decoder_task,
            sink_task,
            stop_timeout,
        } = self;

        state.transition(SessionStatus::Stopping);
        cancel.cancel();
        sender.close();

        let drained = tokio::time::timeout(stop_timeout, async {
            let _ = decoder_task.await;
            sink_task.await
        })
        .await;

        match drained {
            Ok(Ok(stats)) => {
                state.transition(SessionStatus::Stopped);
                info!(
                    container_id = %container_id,
                    delivered = stats.delivered,
                    dropped = stats.dropped,
                    "session stopped for {}",
                    fifo_path.display()
                );
                Ok(stats)
            }
            Ok(Err(join_err)) => {
                let undelivered = sender.in_flight();
                error!(
                    container_id = %container_id,
                    "session worker failed while draining {}: {join_err}",
                    fifo_path.display()
                );
                state.transition(SessionStatus::Failed);
                Err(DriverError::DrainTimeout { undelivered })
            }
            Err(_) => {
                let undelivered = sender.in_flight();
                error!(
                    container_id = %container_id,
                    undelivered,
                    "session for {} did not drain within {:?}",
                    fifo_path.display(),
                    stop_timeout
                );
                state.transition(SessionStatus::Failed);
                Err(DriverError::DrainTimeout { undelivered })
            }
        }
    }
}

fn report_batch_failure(state: &SessionState, container_id: &str, failure: &BatchFailure) {
    error!(
        container_id = %container_id,
        "dropped batch of {} records: {}", failure.records, failure.error
    );
    state.transition(SessionStatus::Failed);
}

struct Decoder {
    fifo_path: PathBuf,
    container_id: String,
    sender: RecordSender,
    partial: PartialBuffer,
    state: Arc<SessionState>,
    cancel: CancellationToken,
    max_read_retries: i32,
}

impl Decoder {
    async fn run(mut self) {
        if self.cancel.is_cancelled() {
            self.sender.close();
            return;
        }
        // The open never waits for a writer; the rendezvous happens at the
        // first read instead.
        let input = match pipe::OpenOptions::new().open_receiver(&self.fifo_path) {
            Ok(input) => input,
            Err(err) => {
                error!(
                    container_id = %self.container_id,
                    "{}",
                    DriverError::InputUnavailable(format!(
                        "cannot open {}: {err}",
                        self.fifo_path.display()
                    ))
                );
                self.state.transition(SessionStatus::Failed);
                self.sender.close();
                return;
            }
        };
        self.state.transition(SessionStatus::Running);
        debug!(
            container_id = %self.container_id,
            "reading log entries from {}",
            self.fifo_path.display()
        );

        self.decode_stream(input).await;

        if let Some(record) = self.partial.drain() {
            self.forward(record).await;
        }
        self.sender.close();
    }

    async fn decode_stream<R>(&mut self, input: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut framed = FramedRead::new(input, EntryCodec::new());
        let mut read_errors: i32 = 0;
        let mut resume_after_error = false;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = wait_deadline(self.partial.deadline()) => {
                    if let Some(record) = self.partial.flush_expired(Instant::now()) {
                        if !self.forward(record).await {
                            break;
                        }
                    }
                }
                frame = framed.next() => match frame {
                    // The framed stream yields one None after an error before
                    // it resumes reading. That None is part of the retry, not
                    // end of stream.
                    None if resume_after_error => resume_after_error = false,
                    None => {
                        debug!(container_id = %self.container_id, "log input closed");
                        self.state.transition(SessionStatus::Stopping);
                        break;
                    }
                    Some(Ok(Frame::Entry(entry))) => {
                        read_errors = 0;
                        if let Some(record) = self.partial.push(LogRecord::from(entry)) {
                            if !self.forward(record).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Frame::Skipped(reason))) => {
                        read_errors = 0;
                        warn!(
                            container_id = %self.container_id,
                            "{}",
                            DriverError::from(reason)
                        );
                    }
                    Some(Err(err)) => {
                        read_errors += 1;
                        if self.max_read_retries >= 0 && read_errors > self.max_read_retries {
                            error!(
                                container_id = %self.container_id,
                                "{}",
                                DriverError::InputUnavailable(format!(
                                    "giving up on {} after {read_errors} read errors: {err}",
                                    self.fifo_path.display()
                                ))
                            );
                            self.state.transition(SessionStatus::Failed);
                            break;
                        }
                        warn!(
                            container_id = %self.container_id,
                            "input read error, retrying: {err}"
                        );
                        resume_after_error = true;
                        tokio::time::sleep(READ_RETRY_PAUSE).await;
                    }
                },
            }
        }
    }

    /// Queues one logical record, filtering blank lines. Returns false once
    /// the queue is closed.
    async fn forward(&self, record: LogRecord) -> bool {
        if record.is_blank() {
            debug!(
                container_id = %self.container_id,
                "skipping blank record from {}", record.source
            );
            return true;
        }
        self.sender.push(record).await.is_ok()
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
