// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Plugin-level configuration from the environment and per-session settings
//! from the `Config` map Docker passes with StartLogging.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::DriverError;
use crate::DRIVER_NAME;

pub const DEFAULT_SOCKET_PATH: &str = "/run/docker/plugins/splunklog.sock";
const DEFAULT_COLLECTOR_PATH: &str = "/services/collector/event/1.0";
const HEALTH_CHECK_PATH: &str = "/services/collector/health";
const DEFAULT_SOURCE_TYPE: &str = "splunk_connect_docker";
const TAG_ID_LENGTH: usize = 12;

const DEFAULT_POST_MESSAGES_FREQUENCY: Duration = Duration::from_secs(5);
const DEFAULT_POST_MESSAGES_BATCH_SIZE: usize = 1000;
const DEFAULT_STREAM_CHANNEL_SIZE: usize = 1000;
const DEFAULT_PARTIAL_MSG_HOLD: Duration = Duration::from_secs(5);
const DEFAULT_PARTIAL_MSG_BUFFER_MAXIMUM: usize = 1024 * 1024;
const DEFAULT_READ_FIFO_ERROR_RETRIES: i32 = 3;
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const ENV_POST_MESSAGES_FREQUENCY: &str = "SPLUNK_LOGGING_DRIVER_POST_MESSAGES_FREQUENCY";
const ENV_POST_MESSAGES_BATCH_SIZE: &str = "SPLUNK_LOGGING_DRIVER_POST_MESSAGES_BATCH_SIZE";
const ENV_STREAM_CHANNEL_SIZE: &str = "SPLUNK_LOGGING_DRIVER_CHANNEL_SIZE";
const ENV_PARTIAL_MSG_HOLD: &str = "SPLUNK_LOGGING_DRIVER_TEMP_MESSAGES_HOLD_DURATION";
const ENV_PARTIAL_MSG_BUFFER_MAXIMUM: &str = "SPLUNK_LOGGING_DRIVER_TEMP_MESSAGES_BUFFER_SIZE";
const ENV_READ_FIFO_ERROR_RETRIES: &str = "SPLUNK_LOGGING_DRIVER_FIFO_ERROR_RETRY_TIME";
const ENV_SOCKET_PATH: &str = "SPLUNK_LOG_PLUGIN_SOCKET";
const ENV_TCP_PORT: &str = "SPLUNK_LOG_PLUGIN_TCP_PORT";
const ENV_STOP_TIMEOUT: &str = "SPLUNK_LOG_PLUGIN_STOP_TIMEOUT";
const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

const OPT_URL: &str = "splunk-url";
const OPT_URL_PATH: &str = "splunk-url-path";
const OPT_TOKEN: &str = "splunk-token";
const OPT_SOURCE: &str = "splunk-source";
const OPT_SOURCE_TYPE: &str = "splunk-sourcetype";
const OPT_INDEX: &str = "splunk-index";
const OPT_FORMAT: &str = "splunk-format";
const OPT_GZIP: &str = "splunk-gzip";
const OPT_GZIP_LEVEL: &str = "splunk-gzip-level";
const OPT_VERIFY_CONNECTION: &str = "splunk-verify-connection";
const OPT_INSECURE_SKIP_VERIFY: &str = "splunk-insecureskipverify";
const OPT_TAG: &str = "tag";

const KNOWN_LOG_OPTS: [&str; 12] = [
    OPT_URL,
    OPT_URL_PATH,
    OPT_TOKEN,
    OPT_SOURCE,
    OPT_SOURCE_TYPE,
    OPT_INDEX,
    OPT_FORMAT,
    OPT_GZIP,
    OPT_GZIP_LEVEL,
    OPT_VERIFY_CONNECTION,
    OPT_INSECURE_SKIP_VERIFY,
    OPT_TAG,
];

/// Plugin-wide tuning, read once at startup.
///
/// Durations are configured as whole seconds. A malformed tuning value falls
/// back to its default with a warning; only a bad `LOG_LEVEL` is fatal.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often a partially filled batch is flushed.
    pub post_messages_frequency: Duration,
    /// Batch size that triggers an immediate flush.
    pub post_messages_batch_size: usize,
    /// Capacity of the per-session delivery queue.
    pub channel_size: usize,
    /// How long a partial-message buffer may be held before it is forced out.
    pub partial_msg_hold: Duration,
    /// Size cap on a partial-message buffer before it is forced out.
    pub partial_msg_buffer_maximum: usize,
    /// Input read retries before a session gives up. -1 retries forever.
    pub read_fifo_error_retries: i32,
    /// Unix socket the control server listens on.
    pub socket_path: String,
    /// Loopback TCP port instead of the Unix socket. Dev and test mode.
    pub tcp_port: Option<u16>,
    /// Bound on draining a session at stop.
    pub stop_timeout: Duration,
    pub log_level: String,
}

impl Config {
    pub fn new() -> Result<Config, Box<dyn std::error::Error>> {
        let log_level = match env::var(ENV_LOG_LEVEL) {
            Ok(level) if !level.is_empty() => level,
            _ => "info".to_string(),
        };
        if !VALID_LOG_LEVELS.contains(&log_level.as_str()) {
            return Err(anyhow::anyhow!("invalid log level: {log_level}").into());
        }

        let tcp_port = match env::var(ENV_TCP_PORT) {
            Ok(raw) if !raw.is_empty() => match raw.parse::<u16>() {
                Ok(port) => Some(port),
                Err(err) => {
                    warn!("Failed to parse value of {ENV_TCP_PORT} as port, ignoring: {err}");
                    None
                }
            },
            _ => None,
        };

        Ok(Config {
            post_messages_frequency: advanced_option_secs(
                ENV_POST_MESSAGES_FREQUENCY,
                DEFAULT_POST_MESSAGES_FREQUENCY,
            ),
            post_messages_batch_size: advanced_option_usize(
                ENV_POST_MESSAGES_BATCH_SIZE,
                DEFAULT_POST_MESSAGES_BATCH_SIZE,
            ),
            channel_size: advanced_option_usize(ENV_STREAM_CHANNEL_SIZE, DEFAULT_STREAM_CHANNEL_SIZE),
            partial_msg_hold: advanced_option_secs(ENV_PARTIAL_MSG_HOLD, DEFAULT_PARTIAL_MSG_HOLD),
            partial_msg_buffer_maximum: advanced_option_usize(
                ENV_PARTIAL_MSG_BUFFER_MAXIMUM,
                DEFAULT_PARTIAL_MSG_BUFFER_MAXIMUM,
            ),
            read_fifo_error_retries: advanced_option_i32(
                ENV_READ_FIFO_ERROR_RETRIES,
                DEFAULT_READ_FIFO_ERROR_RETRIES,
            ),
            socket_path: match env::var(ENV_SOCKET_PATH) {
                Ok(path) if !path.is_empty() => path,
                _ => DEFAULT_SOCKET_PATH.to_string(),
            },
            tcp_port,
            stop_timeout: advanced_option_secs(ENV_STOP_TIMEOUT, DEFAULT_STOP_TIMEOUT),
            log_level,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            post_messages_frequency: DEFAULT_POST_MESSAGES_FREQUENCY,
            post_messages_batch_size: DEFAULT_POST_MESSAGES_BATCH_SIZE,
            channel_size: DEFAULT_STREAM_CHANNEL_SIZE,
            partial_msg_hold: DEFAULT_PARTIAL_MSG_HOLD,
            partial_msg_buffer_maximum: DEFAULT_PARTIAL_MSG_BUFFER_MAXIMUM,
            read_fifo_error_retries: DEFAULT_READ_FIFO_ERROR_RETRIES,
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            tcp_port: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

fn advanced_option_secs(name: &str, default: Duration) -> Duration {
    let raw = match env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => return default,
    };
    match raw.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(err) => {
            warn!("Failed to parse value of {name} as seconds. Using default {default:?}. {err}");
            default
        }
    }
}

fn advanced_option_usize(name: &str, default: usize) -> usize {
    let raw = match env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => return default,
    };
    match raw.parse::<usize>() {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to parse value of {name} as integer. Using default {default}. {err}");
            default
        }
    }
}

fn advanced_option_i32(name: &str, default: i32) -> i32 {
    let raw = match env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => return default,
    };
    match raw.parse::<i32>() {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to parse value of {name} as integer. Using default {default}. {err}");
            default
        }
    }
}

/// The `Info` payload Docker sends with a StartLogging request.
///
/// Field names follow the daemon's JSON casing. Only the fields this driver
/// consumes are modeled; the rest of the daemon payload is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInfo {
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default, rename = "ContainerID")]
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub log_path: String,
}

/// How a record's payload is shaped into the event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Inline,
    Json,
    Raw,
    Hec,
}

/// Validated per-session settings derived from a StartLogging request.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Full collector URL, endpoint plus collector path.
    pub collector_url: reqwest::Url,
    /// OPTIONS target for the optional startup connectivity check.
    pub health_check_url: reqwest::Url,
    pub token: String,
    pub host: String,
    pub source: String,
    pub source_type: String,
    pub index: String,
    pub format: MessageFormat,
    pub tag: String,
    pub gzip: bool,
    /// Compression level, -1 for the library default.
    pub gzip_level: i32,
    pub verify_connection: bool,
    pub insecure_skip_verify: bool,
}

impl SessionSettings {
    /// Validates the log opts and builds the session settings.
    ///
    /// Everything here fails before a session exists, so an error surfaces
    /// straight through the StartLogging response.
    pub fn parse(info: &SessionInfo) -> Result<SessionSettings, DriverError> {
        validate_log_opts(&info.config)?;

        if info.container_id.is_empty() {
            return Err(DriverError::Config(
                "must provide container id in log context".to_string(),
            ));
        }

        let (collector_url, health_check_url) = parse_collector_url(&info.config)?;

        let token = info
            .config
            .get(OPT_TOKEN)
            .cloned()
            .ok_or_else(|| config_error(format!("{DRIVER_NAME}: {OPT_TOKEN} is expected")))?;

        let host = hostname()?;

        let source = info.config.get(OPT_SOURCE).cloned().unwrap_or_default();
        let source_type = match info.config.get(OPT_SOURCE_TYPE) {
            Some(value) if !value.is_empty() => value.clone(),
            _ => DEFAULT_SOURCE_TYPE.to_string(),
        };
        let index = info.config.get(OPT_INDEX).cloned().unwrap_or_default();

        let format = match info.config.get(OPT_FORMAT).map(String::as_str) {
            None => MessageFormat::Inline,
            Some("inline") => MessageFormat::Inline,
            Some("json") => MessageFormat::Json,
            Some("raw") => MessageFormat::Raw,
            Some("hec") => MessageFormat::Hec,
            Some(other) => {
                return Err(config_error(format!(
                    "unknown format specified {other}, supported formats are inline, json, hec and raw"
                )));
            }
        };

        // A present empty tag removes the tag from messages entirely.
        let tag = match info.config.get(OPT_TAG) {
            Some(tag) => tag.clone(),
            None => default_tag(&info.container_id).to_string(),
        };

        let gzip = parse_bool_opt(&info.config, OPT_GZIP, false)?;
        let gzip_level = parse_gzip_level(&info.config)?;
        let verify_connection = parse_bool_opt(&info.config, OPT_VERIFY_CONNECTION, false)?;
        let insecure_skip_verify = parse_bool_opt(&info.config, OPT_INSECURE_SKIP_VERIFY, false)?;

        Ok(SessionSettings {
            collector_url,
            health_check_url,
            token,
            host,
            source,
            source_type,
            index,
            format,
            tag,
            gzip,
            gzip_level,
            verify_connection,
            insecure_skip_verify,
        })
    }
}

fn config_error(message: String) -> DriverError {
    DriverError::Config(message)
}

fn validate_log_opts(config: &HashMap<String, String>) -> Result<(), DriverError> {
    for key in config.keys() {
        if !KNOWN_LOG_OPTS.contains(&key.as_str()) {
            return Err(config_error(format!(
                "unknown log opt '{key}' for {DRIVER_NAME} log driver"
            )));
        }
    }
    Ok(())
}

/// Parses `splunk-url` and `splunk-url-path` into the collector URL and the
/// health check URL. The endpoint must be bare: scheme, host, port, nothing
/// else.
fn parse_collector_url(
    config: &HashMap<String, String>,
) -> Result<(reqwest::Url, reqwest::Url), DriverError> {
    let raw = config
        .get(OPT_URL)
        .ok_or_else(|| config_error(format!("{DRIVER_NAME}: {OPT_URL} is expected")))?;

    let parsed = reqwest::Url::parse(raw).map_err(|_| {
        config_error(format!(
            "{DRIVER_NAME}: failed to parse {raw} as url value in {OPT_URL}"
        ))
    })?;

    let bare = matches!(parsed.scheme(), "http" | "https")
        && parsed.host_str().is_some()
        && (parsed.path().is_empty() || parsed.path() == "/")
        && parsed.query().is_none()
        && parsed.fragment().is_none();
    if !bare {
        return Err(config_error(format!(
            "{DRIVER_NAME}: expected format scheme://dns_name_or_ip:port for {OPT_URL}"
        )));
    }

    let collector_path = match config.get(OPT_URL_PATH) {
        None => DEFAULT_COLLECTOR_PATH,
        Some(path) if path.starts_with('/') => path.as_str(),
        Some(_) => {
            return Err(config_error(format!(
                "{DRIVER_NAME}: expected format /path/to/collector for {OPT_URL_PATH}"
            )));
        }
    };

    let mut collector_url = parsed.clone();
    collector_url.set_path(collector_path);
    let mut health_check_url = parsed;
    health_check_url.set_path(HEALTH_CHECK_PATH);

    Ok((collector_url, health_check_url))
}

fn hostname() -> Result<String, DriverError> {
    let raw = nix::unistd::gethostname().map_err(|_| {
        config_error(format!(
            "{DRIVER_NAME}: cannot access hostname to set source field"
        ))
    })?;
    match raw.to_str() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(config_error(format!(
            "{DRIVER_NAME}: cannot access hostname to set source field"
        ))),
    }
}

fn default_tag(container_id: &str) -> &str {
    container_id.get(..TAG_ID_LENGTH).unwrap_or(container_id)
}

fn parse_bool_opt(
    config: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, DriverError> {
    let raw = match config.get(key) {
        Some(value) => value,
        None => return Ok(default),
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => Err(config_error(format!(
            "{DRIVER_NAME}: invalid boolean value '{raw}' for {key}"
        ))),
    }
}

fn parse_gzip_level(config: &HashMap<String, String>) -> Result<i32, DriverError> {
    let raw = match config.get(OPT_GZIP_LEVEL) {
        Some(value) => value,
        None => return Ok(-1),
    };
    let level = raw.parse::<i32>().map_err(|_| {
        config_error(format!(
            "{DRIVER_NAME}: invalid integer value '{raw}' for {OPT_GZIP_LEVEL}"
        ))
    })?;
    if !(-1..=9).contains(&level) {
        return Err(config_error(format!(
            "not supported level '{raw}' for {OPT_GZIP_LEVEL} (supported values between -1 and 9)"
        )));
    }
    Ok(level)
}
