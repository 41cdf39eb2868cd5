// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    header,
    http::{self, HeaderMap},
    Response, StatusCode,
};
use serde_json::json;
use tracing::{debug, error};

/// Body type for every control plane response.
pub(crate) type PluginBody = Full<Bytes>;

pub(crate) type HttpResponse = Response<PluginBody>;

/// Media type Docker expects from plugin endpoints.
pub(crate) const PLUGIN_MEDIA_TYPE: &str = "application/vnd.docker.plugins.v1.1+json";

/// Does two things:
/// 1. Logs the given message. A success status code (within 200-299) will cause a debug log to be
///    written, otherwise error will be written.
/// 2. Returns the given message in the body of JSON response with the given status code.
///
/// Response body format:
/// {
///     "message": message
/// }
pub(crate) fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
}

/// Builds the answer Docker reads for a log driver operation.
///
/// The daemon treats any 200 response with an empty `Err` field as success
/// and surfaces a non-empty `Err` to the user, so operation failures are
/// reported through the body rather than the status code.
///
/// Response body format:
/// {
///     "Err": error message, or "" on success
/// }
pub(crate) fn log_and_create_plugin_response(
    operation: &str,
    error: Option<&str>,
) -> http::Result<HttpResponse> {
    let err_field = match error {
        Some(message) => {
            error!("{operation}: {message}");
            message
        }
        None => {
            debug!("{operation}: ok");
            ""
        }
    };
    let body = json!({ "Err": err_field }).to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PLUGIN_MEDIA_TYPE)
        .body(Full::new(Bytes::from(body)))
}

/// Returns a fixed JSON document with the plugin media type, used for the
/// handshake and capability endpoints.
pub(crate) fn plugin_json_response(body: serde_json::Value) -> http::Result<HttpResponse> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PLUGIN_MEDIA_TYPE)
        .body(Full::new(Bytes::from(body.to_string())))
}

/// Takes a request's header map, and verifies that the "content-length" and/or "Transfer-Encoding" header
/// is present, valid, and less than the given max_content_length.
///
/// Will return None if no issues are found. Otherwise logs an error (with the given prefix) and
/// returns an HTTP Response with the appropriate error status code.
pub(crate) fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
    error_message_prefix: &str,
) -> Option<http::Result<HttpResponse>> {
    let content_length_header = match header_map.get(header::CONTENT_LENGTH) {
        Some(res) => res,
        None => {
            if let Some(transfer_encoding_header) = header_map.get(header::TRANSFER_ENCODING) {
                debug!(
                    "Transfer-Encoding header is present: {:?}",
                    transfer_encoding_header
                );
                return None;
            }
            return Some(log_and_create_http_response(
                &format!(
                    "{error_message_prefix}: Missing Content-Length and Transfer-Encoding header"
                ),
                StatusCode::LENGTH_REQUIRED,
            ));
        }
    };
    let header_as_string = match content_length_header.to_str() {
        Ok(res) => res,
        Err(_) => {
            return Some(log_and_create_http_response(
                &format!("{error_message_prefix}: Invalid Content-Length header"),
                StatusCode::BAD_REQUEST,
            ));
        }
    };
    let content_length = match header_as_string.parse::<usize>() {
        Ok(res) => res,
        Err(_) => {
            return Some(log_and_create_http_response(
                &format!("{error_message_prefix}: Invalid Content-Length header"),
                StatusCode::BAD_REQUEST,
            ));
        }
    };
    if content_length > max_content_length {
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Payload too large"),
            StatusCode::PAYLOAD_TOO_LARGE,
        ));
    }
    None
}
