// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Coalesces partial records into logical lines before queueing.
//!
//! The daemon splits long lines into partial fragments. Consecutive fragments
//! accumulate here and leave as one record when a non-partial record
//! completes the line, when the buffer has been held past its hold duration,
//! or when it grows past its size cap. Source and timestamp of the emitted
//! record come from the most recent fragment.

use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;

use crate::record::LogRecord;

pub struct PartialBuffer {
    buf: BytesMut,
    source: String,
    timestamp_nanos: i64,
    started: Option<Instant>,
    hold: Duration,
    max_size: usize,
}

impl PartialBuffer {
    pub fn new(hold: Duration, max_size: usize) -> Self {
        PartialBuffer {
            buf: BytesMut::new(),
            source: String::new(),
            timestamp_nanos: 0,
            started: None,
            hold,
            max_size,
        }
    }

    /// Feeds one decoded record through the buffer. Returns a record when a
    /// logical line is ready to queue.
    pub fn push(&mut self, record: LogRecord) -> Option<LogRecord> {
        if !record.partial {
            if self.buf.is_empty() {
                return Some(record);
            }
            self.buf.extend_from_slice(&record.payload);
            return Some(self.take(&record, false));
        }

        if self.buf.is_empty() {
            self.started = Some(Instant::now());
        }
        self.buf.extend_from_slice(&record.payload);
        if self.buf.len() > self.max_size {
            return Some(self.take(&record, true));
        }
        self.source = record.source;
        self.timestamp_nanos = record.timestamp_nanos;
        None
    }

    /// Emits the held line when it has been buffered past the hold duration.
    pub fn flush_expired(&mut self, now: Instant) -> Option<LogRecord> {
        let started = self.started?;
        if self.buf.is_empty() || now.duration_since(started) <= self.hold {
            return None;
        }
        let source = self.source.clone();
        let timestamp_nanos = self.timestamp_nanos;
        Some(self.take_with(source, timestamp_nanos, true))
    }

    /// When the next held line must be forced out, if one is held.
    pub fn deadline(&self) -> Option<Instant> {
        if self.buf.is_empty() {
            return None;
        }
        self.started.map(|started| started + self.hold)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Forces out whatever is held, used when the input stream closes.
    pub fn drain(&mut self) -> Option<LogRecord> {
        if self.buf.is_empty() {
            return None;
        }
        let source = self.source.clone();
        let timestamp_nanos = self.timestamp_nanos;
        Some(self.take_with(source, timestamp_nanos, true))
    }

    fn take(&mut self, current: &LogRecord, partial: bool) -> LogRecord {
        self.take_with(current.source.clone(), current.timestamp_nanos, partial)
    }

    fn take_with(&mut self, source: String, timestamp_nanos: i64, partial: bool) -> LogRecord {
        let payload = self.buf.split().freeze();
        self.started = None;
        LogRecord {
            source,
            timestamp_nanos,
            payload,
            partial,
        }
    }
}
