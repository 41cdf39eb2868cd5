// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Splunk HTTP Event Collector transport.
//!
//! Records become HEC JSON documents shaped by the session's format and ship
//! in batches, one POST per batch, optionally gzip-compressed. The response
//! status decides whether a failed batch is worth retrying: connect errors,
//! 5xx and 429 are transient, any other 4xx is final.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::config::{MessageFormat, SessionSettings};
use crate::error::DriverError;
use crate::record::LogRecord;
use crate::DRIVER_NAME;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One HEC document as POSTed to the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HecEvent {
    pub event: Value,
    /// Capture time as fractional seconds, six decimal places.
    pub time: String,
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(rename = "sourcetype", skip_serializing_if = "String::is_empty")]
    pub source_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub index: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<HashMap<String, String>>,
}

/// Keys a `hec`-format payload may override. Any present key must carry the
/// right type or the whole payload falls back to inline formatting.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HecOverrides {
    event: Option<Value>,
    time: Option<String>,
    host: Option<String>,
    source: Option<String>,
    sourcetype: Option<String>,
    index: Option<String>,
    fields: Option<HashMap<String, String>>,
}

/// Builds the HEC document for one record per the session's format.
pub fn build_event(settings: &SessionSettings, record: &LogRecord) -> HecEvent {
    let mut doc = HecEvent {
        event: Value::Null,
        time: format_event_time(record.timestamp_nanos),
        host: settings.host.clone(),
        source: settings.source.clone(),
        source_type: settings.source_type.clone(),
        index: settings.index.clone(),
        fields: None,
    };

    match settings.format {
        MessageFormat::Inline => {
            doc.event = inline_event(&settings.tag, record, None);
        }
        MessageFormat::Json => {
            let parsed = serde_json::from_slice::<Value>(&record.payload).ok();
            doc.event = inline_event(&settings.tag, record, parsed);
        }
        MessageFormat::Raw => {
            let mut text = String::new();
            if !settings.tag.is_empty() {
                text.push_str(&settings.tag);
                text.push(' ');
            }
            text.push_str(&String::from_utf8_lossy(&record.payload));
            doc.event = Value::String(text);
        }
        MessageFormat::Hec => match serde_json::from_slice::<HecOverrides>(&record.payload) {
            Ok(overrides) => apply_hec_overrides(&mut doc, overrides, &settings.tag),
            Err(_) => {
                doc.event = inline_event(&settings.tag, record, None);
            }
        },
    }

    doc
}

fn inline_event(tag: &str, record: &LogRecord, parsed_line: Option<Value>) -> Value {
    let line = parsed_line
        .unwrap_or_else(|| Value::String(String::from_utf8_lossy(&record.payload).into_owned()));
    let mut event = serde_json::Map::new();
    event.insert("line".to_string(), line);
    event.insert("source".to_string(), Value::String(record.source.clone()));
    if !tag.is_empty() {
        event.insert("tag".to_string(), Value::String(tag.to_string()));
    }
    Value::Object(event)
}

fn apply_hec_overrides(doc: &mut HecEvent, overrides: HecOverrides, tag: &str) {
    if let Some(event) = overrides.event {
        doc.event = event;
    }
    if let Some(time) = overrides.time {
        doc.time = time;
    }
    if let Some(host) = overrides.host {
        doc.host = host;
    }
    if let Some(source) = overrides.source {
        doc.source = source;
    }
    if let Some(source_type) = overrides.sourcetype {
        doc.source_type = source_type;
    }
    if let Some(index) = overrides.index {
        doc.index = index;
    }
    let mut fields = overrides.fields.unwrap_or_default();
    if !tag.is_empty() {
        fields.insert("container_tag".to_string(), tag.to_string());
    }
    if !fields.is_empty() {
        doc.fields = Some(fields);
    }
}

/// Seconds with six decimal places, the collector's expected `time` shape.
pub fn format_event_time(timestamp_nanos: i64) -> String {
    format!("{:.6}", timestamp_nanos as f64 / 1e9)
}

/// Transport seam between the sink worker and the collector.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Ships one batch as a single request.
    async fn submit(&self, events: &[HecEvent]) -> Result<(), DriverError>;
}

/// HTTP client for one session's collector endpoint.
pub struct HecClient {
    client: reqwest::Client,
    collector_url: reqwest::Url,
    health_check_url: reqwest::Url,
    auth: HeaderValue,
    gzip: bool,
    gzip_level: Compression,
    headers: OnceCell<HeaderMap>,
}

impl HecClient {
    pub fn new(settings: &SessionSettings) -> Result<HecClient, DriverError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.insecure_skip_verify)
            .timeout(SUBMIT_TIMEOUT)
            .build()
            .map_err(|err| {
                DriverError::Config(format!(
                    "{DRIVER_NAME}: failed to build http client: {err}"
                ))
            })?;
        let mut auth =
            HeaderValue::from_str(&format!("Splunk {}", settings.token)).map_err(|_| {
                DriverError::Config(format!(
                    "{DRIVER_NAME}: splunk-token is not a valid header value"
                ))
            })?;
        auth.set_sensitive(true);

        Ok(HecClient {
            client,
            collector_url: settings.collector_url.clone(),
            health_check_url: settings.health_check_url.clone(),
            auth,
            gzip: settings.gzip,
            gzip_level: compression_level(settings.gzip_level),
            headers: OnceCell::new(),
        })
    }

    /// Startup connectivity probe, an OPTIONS against the collector health
    /// endpoint. Anything but 200 fails the start request.
    pub async fn verify_connection(&self) -> Result<(), DriverError> {
        let response = self
            .client
            .request(Method::OPTIONS, self.health_check_url.clone())
            .send()
            .await
            .map_err(|err| {
                DriverError::Config(format!(
                    "{DRIVER_NAME}: failed to verify connection - {err}"
                ))
            })?;
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DriverError::Config(format!(
            "{DRIVER_NAME}: failed to verify connection - {status} - {body}"
        )))
    }

    async fn get_headers(&self) -> &HeaderMap {
        self.headers
            .get_or_init(|| async {
                let mut headers = HeaderMap::new();
                headers.insert(AUTHORIZATION, self.auth.clone());
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                if self.gzip {
                    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                }
                headers
            })
            .await
    }

    /// One JSON document per event, back to back, gzipped when enabled.
    fn encode_body(&self, events: &[HecEvent]) -> Result<Vec<u8>, DriverError> {
        let mut body = Vec::new();
        for event in events {
            let doc = serde_json::to_vec(event).map_err(|err| {
                DriverError::PermanentDelivery(
                    None,
                    format!("{DRIVER_NAME}: failed to encode event: {err}"),
                )
            })?;
            body.extend_from_slice(&doc);
        }
        if !self.gzip {
            return Ok(body);
        }
        let mut encoder = GzEncoder::new(Vec::new(), self.gzip_level);
        encoder
            .write_all(&body)
            .and_then(|()| encoder.finish())
            .map_err(|err| {
                DriverError::PermanentDelivery(
                    None,
                    format!("{DRIVER_NAME}: failed to compress batch: {err}"),
                )
            })
    }
}

#[async_trait]
impl EventTransport for HecClient {
    async fn submit(&self, events: &[HecEvent]) -> Result<(), DriverError> {
        if events.is_empty() {
            return Ok(());
        }
        let body = self.encode_body(events)?;
        let headers = self.get_headers().await.clone();
        let response = self
            .client
            .post(self.collector_url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                DriverError::TransientDelivery(
                    None,
                    format!("{DRIVER_NAME}: failed to send event - {err}"),
                )
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("{DRIVER_NAME}: failed to send event - {status} - {body}");
        if is_permanent(status) {
            Err(DriverError::PermanentDelivery(Some(status), message))
        } else {
            Err(DriverError::TransientDelivery(Some(status), message))
        }
    }
}

fn is_permanent(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS
}

fn compression_level(level: i32) -> Compression {
    if level < 0 {
        Compression::default()
    } else {
        Compression::new(level as u32)
    }
}
