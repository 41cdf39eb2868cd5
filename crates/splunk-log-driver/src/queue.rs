// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO between a session's decoder and its sink.
//!
//! One producer, one consumer. Push suspends when the queue is full and never
//! drops. Close is idempotent, wakes a blocked pop, and buffered records
//! drain before the consumer observes closure. A shared in-flight counter
//! tracks records that were queued but not yet delivered or dropped, so a
//! timed-out drain can report how much was left behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::record::LogRecord;

/// Pushing into a closed queue. The record was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("delivery queue is closed")]
pub struct QueueClosed;

struct QueueShared {
    closed: CancellationToken,
    in_flight: AtomicUsize,
}

/// Producer half. Cloneable so the owning session can also close the queue.
#[derive(Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<LogRecord>,
    shared: Arc<QueueShared>,
}

/// Consumer half.
pub struct RecordReceiver {
    rx: mpsc::Receiver<LogRecord>,
    shared: Arc<QueueShared>,
}

/// Creates the bounded queue for one session.
pub fn record_queue(capacity: usize) -> (RecordSender, RecordReceiver) {
    let (tx, rx) = mpsc::channel::<LogRecord>(capacity);
    let shared = Arc::new(QueueShared {
        closed: CancellationToken::new(),
        in_flight: AtomicUsize::new(0),
    });
    (
        RecordSender {
            tx,
            shared: Arc::clone(&shared),
        },
        RecordReceiver { rx, shared },
    )
}

impl RecordSender {
    /// Enqueues one record, waiting for space when the queue is full.
    pub async fn push(&self, record: LogRecord) -> Result<(), QueueClosed> {
        if self.shared.closed.is_cancelled() {
            return Err(QueueClosed);
        }
        tokio::select! {
            res = self.tx.send(record) => match res {
                Ok(()) => {
                    self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Err(_) => Err(QueueClosed),
            },
            _ = self.shared.closed.cancelled() => Err(QueueClosed),
        }
    }

    /// Closes the queue. Idempotent; wakes a pop blocked on an empty queue.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Records queued but not yet delivered or dropped by the consumer.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }
}

impl RecordReceiver {
    /// Next record in FIFO order. `None` once the queue is closed and its
    /// buffer has drained.
    pub async fn pop(&mut self) -> Option<LogRecord> {
        tokio::select! {
            // Buffered records win over closure.
            biased;
            record = self.rx.recv() => record,
            _ = self.shared.closed.cancelled() => {
                match self.rx.try_recv() {
                    Ok(record) => Some(record),
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
                }
            }
        }
    }

    /// Marks `count` popped records as resolved (delivered or dropped).
    pub fn acknowledge(&self, count: usize) {
        self.shared.in_flight.fetch_sub(count, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    /// Records queued but not yet delivered or dropped.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::timeout;

    use super::*;

    fn create_test_record(line: &str) -> LogRecord {
        LogRecord {
            source: "stdout".to_string(),
            timestamp_nanos: 1,
            payload: Bytes::copy_from_slice(line.as_bytes()),
            partial: false,
        }
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let (tx, mut rx) = record_queue(10);
        for i in 0..5 {
            tx.push(create_test_record(&format!("line {i}"))).await.unwrap();
        }
        for i in 0..5 {
            let record = rx.pop().await.unwrap();
            assert_eq!(record.payload.as_ref(), format!("line {i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn test_push_blocks_when_full_until_pop() {
        let (tx, mut rx) = record_queue(2);
        let pushed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&pushed);
        let producer = tokio::spawn(async move {
            for i in 0..3 {
                tx.push(create_test_record(&format!("line {i}"))).await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // The first two pushes fill the queue; the third parks.
        while pushed.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert!(!producer.is_finished());

        let first = rx.pop().await.unwrap();
        assert_eq!(first.payload.as_ref(), b"line 0");

        timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed.load(Ordering::SeqCst), 3);
        assert_eq!(rx.pop().await.unwrap().payload.as_ref(), b"line 1");
        assert_eq!(rx.pop().await.unwrap().payload.as_ref(), b"line 2");
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_pop() {
        let (tx, mut rx) = record_queue(4);
        let consumer = tokio::spawn(async move { rx.pop().await });
        tx.close();
        let popped = timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_buffered_records_drain_before_closure() {
        let (tx, mut rx) = record_queue(4);
        for i in 0..3 {
            tx.push(create_test_record(&format!("line {i}"))).await.unwrap();
        }
        tx.close();
        tx.close(); // idempotent

        for i in 0..3 {
            let record = rx.pop().await.unwrap();
            assert_eq!(record.payload.as_ref(), format!("line {i}").as_bytes());
        }
        assert!(rx.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_push_after_close_is_rejected() {
        let (tx, _rx) = record_queue(4);
        tx.close();
        let err = tx.push(create_test_record("late")).await.unwrap_err();
        assert_eq!(err, QueueClosed);
    }

    #[tokio::test]
    async fn test_dropping_receiver_fails_push() {
        let (tx, rx) = record_queue(1);
        drop(rx);
        assert!(tx.push(create_test_record("orphan")).await.is_err());
    }

    #[tokio::test]
    async fn test_in_flight_counts_until_acknowledged() {
        let (tx, mut rx) = record_queue(4);
        tx.push(create_test_record("a")).await.unwrap();
        tx.push(create_test_record("b")).await.unwrap();
        assert_eq!(tx.in_flight(), 2);

        // Popping alone does not resolve a record.
        let _ = rx.pop().await.unwrap();
        assert_eq!(rx.in_flight(), 2);

        rx.acknowledge(1);
        assert_eq!(rx.in_flight(), 1);
        let _ = rx.pop().await.unwrap();
        rx.acknowledge(1);
        assert_eq!(tx.in_flight(), 0);
    }
}
