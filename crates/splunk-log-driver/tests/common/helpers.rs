// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::SinkExt;
use logdriver_proto::{EntryCodec, LogEntry};
use nix::sys::stat::Mode;
use serde_json::{json, Value};
use tokio_util::codec::FramedWrite;

/// Creates the fifo the daemon would hand to the plugin.
pub fn create_fifo(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    nix::unistd::mkfifo(&path, Mode::S_IRWXU).expect("Failed to create fifo");
    path
}

/// Opens the writer side of the fifo, framing entries the way the daemon does.
pub async fn open_entry_writer(fifo: &Path) -> FramedWrite<tokio::fs::File, EntryCodec> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(fifo)
        .await
        .expect("Failed to open fifo for writing");
    FramedWrite::new(file, EntryCodec::new())
}

/// Sends each line as a complete stdout entry.
pub async fn send_lines(writer: &mut FramedWrite<tokio::fs::File, EntryCodec>, lines: &[&str]) {
    for (i, line) in lines.iter().enumerate() {
        let entry = LogEntry::new("stdout", 1_720_000_000_000_000_000 + i as i64, *line, false);
        writer.send(entry).await.expect("Failed to write entry");
    }
}

/// Writes the lines and closes the writer, ending the session input.
pub async fn write_entries(fifo: &Path, lines: &[&str]) {
    let mut writer = open_entry_writer(fifo).await;
    send_lines(&mut writer, lines).await;
}

/// Builds the StartLogging payload the daemon would send.
pub fn start_logging_request(fifo: &Path, container_id: &str, opts: &[(&str, &str)]) -> Value {
    let mut config = serde_json::Map::new();
    for (key, value) in opts {
        config.insert((*key).to_string(), Value::String((*value).to_string()));
    }
    json!({
        "File": fifo.to_str().unwrap(),
        "Info": {
            "Config": Value::Object(config),
            "ContainerID": container_id,
            "ContainerName": "/test-container",
            "LogPath": "",
        },
    })
}

/// Polls until the condition holds, panicking after ten seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Condition not reached within timeout");
}
