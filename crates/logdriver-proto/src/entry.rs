// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Protobuf message types mirroring Docker's `entry.proto`.
//!
//! Field numbers are wire-stable identifiers and must not change. The
//! messages are hand-derived with `prost` so the crate builds without a
//! `protoc` toolchain step.

/// One log record as emitted by the Docker daemon.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LogEntry {
    /// Origin stream, `"stdout"` or `"stderr"`.
    #[prost(string, tag = "1")]
    pub source: String,
    /// Wall-clock capture time in nanoseconds since the Unix epoch.
    #[prost(int64, tag = "2")]
    pub time_nano: i64,
    /// Raw log line. Not required to be valid UTF-8.
    #[prost(bytes = "vec", tag = "3")]
    pub line: Vec<u8>,
    /// True when the line is a fragment of a longer logical line.
    #[prost(bool, tag = "4")]
    pub partial: bool,
    /// Fragment bookkeeping, only present on newer daemons. Decoders must
    /// tolerate its absence.
    #[prost(message, optional, tag = "5")]
    pub partial_log_metadata: Option<PartialLogEntryMetadata>,
}

/// Metadata attached to partial entries by daemons that split long lines.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PartialLogEntryMetadata {
    /// True on the final fragment of a logical line.
    #[prost(bool, tag = "1")]
    pub last: bool,
    /// Identifier shared by all fragments of one logical line.
    #[prost(string, tag = "2")]
    pub id: String,
    /// Zero-based fragment position within the logical line.
    #[prost(int32, tag = "3")]
    pub ordinal: i32,
}

impl LogEntry {
    /// Builds an entry with the metadata field left unset, the common case
    /// for complete lines.
    pub fn new(source: impl Into<String>, time_nano: i64, line: impl Into<Vec<u8>>, partial: bool) -> Self {
        LogEntry {
            source: source.into(),
            time_nano,
            line: line.into(),
            partial,
            partial_log_metadata: None,
        }
    }
}
