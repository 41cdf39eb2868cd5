// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! The in-driver record model. Decoded once, immutable afterwards.

use bytes::Bytes;
use logdriver_proto::LogEntry;

/// One log record on its way from the container stream to the backend.
///
/// `payload` is raw bytes and not required to be valid UTF-8; text conversion
/// happens lossily at the formatting boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Origin stream, `stdout` or `stderr`.
    pub source: String,
    /// Wall-clock capture time in nanoseconds.
    pub timestamp_nanos: i64,
    pub payload: Bytes,
    /// True when the payload is a fragment of a longer logical line.
    pub partial: bool,
}

impl LogRecord {
    /// True when there is nothing worth forwarding.
    pub fn is_blank(&self) -> bool {
        self.payload.iter().all(u8::is_ascii_whitespace)
    }
}

impl From<LogEntry> for LogRecord {
    fn from(entry: LogEntry) -> Self {
        LogRecord {
            source: entry.source,
            timestamp_nanos: entry.time_nano,
            payload: Bytes::from(entry.line),
            partial: entry.partial,
        }
    }
}
