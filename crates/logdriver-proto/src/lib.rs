// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire schema for the Docker log-driver stream.
//!
//! Docker writes container output to the plugin as a sequence of protobuf
//! `LogEntry` messages, each preceded by a 4-byte big-endian length prefix.
//! This crate defines the message types ([`entry`]) and a
//! [`tokio_util::codec::Decoder`] for the length-delimited stream
//! ([`framing`]) so higher layers never deal with raw framing.

pub mod entry;
pub mod framing;

pub use entry::{LogEntry, PartialLogEntryMetadata};
pub use framing::{EntryCodec, Frame, FrameError, MAX_FRAME_LEN};
