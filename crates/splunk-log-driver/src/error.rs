// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

use logdriver_proto::FrameError;
use reqwest::StatusCode;

/// Errors raised across the logging pipeline.
///
/// Frame-level problems stay inside the decoder task (the codec skips the
/// offending frame and resynchronizes); the remaining variants cross task
/// boundaries and drive session state.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A malformed start request. No session is created.
    #[error("Invalid logging configuration: {0}")]
    Config(String),

    /// The input stream could not be opened or read.
    #[error("Log input unavailable: {0}")]
    InputUnavailable(String),

    /// An unusable frame on the wire. Decoder-local; at most one record lost.
    #[error("Skipped log frame: {0}")]
    Frame(#[from] FrameError),

    /// The backend failed in a way worth retrying the same batch.
    #[error("Transient delivery failure: {0:?} {1}")]
    TransientDelivery(Option<StatusCode>, String),

    /// The backend rejected the batch. The batch is dropped, never retried.
    #[error("Permanent delivery failure: {0:?} {1}")]
    PermanentDelivery(Option<StatusCode>, String),

    /// Stop ran out of drain time with records still queued.
    #[error("Session drain timed out with {undelivered} records undelivered")]
    DrainTimeout { undelivered: usize },
}

impl DriverError {
    /// True for failures that warrant resubmitting the same batch.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::TransientDelivery(_, _))
    }
}
