// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! # Splunk Log Driver
//!
//! Library behind the Splunk Docker logging plugin. For each container the
//! driver reads length-delimited protobuf log entries from a fifo, coalesces
//! partial lines, and forwards batches to a Splunk HTTP Event Collector
//! endpoint.
//!
//! The library is organized into several key modules:
//! - [`config`]: plugin tuning from the environment and per-session options
//! - [`driver`]: the session supervisor behind the plugin endpoints
//! - [`session`]: one container's decode, queue and sink pipeline
//! - [`queue`]: the bounded record queue between decoder and sink
//! - [`partial`]: partial-message coalescing
//! - [`hec`]: event formatting and the collector client
//! - [`sink`]: batching, retry and backoff
//! - [`server`]: the Docker plugin control plane over UDS or TCP

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod driver;
pub mod error;
pub mod hec;
mod http_utils;
pub mod partial;
pub mod queue;
pub mod record;
pub mod server;
pub mod session;
pub mod sink;
pub mod uds;

/// Name the plugin registers under, also the prefix of config error messages.
pub(crate) const DRIVER_NAME: &str = "splunk";

/// Maximum attempts for one batch before the sink drops it.
pub(crate) const FLUSH_RETRY_COUNT: u32 = 3;

/// Base delay for the sink's exponential backoff, in milliseconds.
pub(crate) const FLUSH_RETRY_BACKOFF_MS: u64 = 100;
