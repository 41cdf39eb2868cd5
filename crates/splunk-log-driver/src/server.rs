// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Docker plugin control plane.
//!
//! The daemon drives the plugin over a small HTTP API: a handshake on
//! `/Plugin.Activate`, session lifecycle on `/LogDriver.StartLogging` and
//! `/LogDriver.StopLogging`, and capability discovery on
//! `/LogDriver.Capabilities`. Requests arrive over the plugin Unix socket
//! in production and over loopback TCP in tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::SessionInfo;
use crate::driver::LogDriver;
use crate::http_utils::{
    log_and_create_http_response, log_and_create_plugin_response, plugin_json_response,
    verify_request_content_length, HttpResponse,
};
use crate::uds::Listener;

const ACTIVATE_ENDPOINT_PATH: &str = "/Plugin.Activate";
const START_LOGGING_ENDPOINT_PATH: &str = "/LogDriver.StartLogging";
const STOP_LOGGING_ENDPOINT_PATH: &str = "/LogDriver.StopLogging";
const CAPABILITIES_ENDPOINT_PATH: &str = "/LogDriver.Capabilities";

/// Largest control request body the server will read.
const MAX_REQUEST_CONTENT_LENGTH: usize = 1024 * 1024;

/// Payload of a StartLogging request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartLoggingRequest {
    file: String,
    info: SessionInfo,
}

/// Payload of a StopLogging request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StopLoggingRequest {
    file: String,
}

/// Serves the plugin control API until the shutdown token fires.
pub struct PluginServer {
    driver: Arc<LogDriver>,
    shutdown: CancellationToken,
}

impl PluginServer {
    pub fn new(driver: Arc<LogDriver>, shutdown: CancellationToken) -> PluginServer {
        PluginServer { driver, shutdown }
    }

    /// Accepts control connections until shutdown is requested.
    ///
    /// Open connections are dropped on shutdown. Outstanding sessions are
    /// drained by the driver, not here.
    pub async fn serve(&self, listener: Listener) -> io::Result<()> {
        let driver = self.driver.clone();
        let service = service_fn(move |req| {
            // called for each http request
            let driver = driver.clone();
            Self::control_endpoint_handler(driver, req)
        });

        match listener {
            Listener::Tcp(listener) => self.serve_tcp(listener, service).await,
            Listener::Unix(listener) => self.serve_unix(listener, service).await,
        }
    }

    async fn serve_tcp<S>(&self, listener: TcpListener, service: S) -> io::Result<()>
    where
        S: hyper::service::Service<Request<Incoming>, Response = HttpResponse>
            + Clone
            + Send
            + 'static,
        S::Future: Send,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Control server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        // Don't kill server on panic - log and continue
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                () = self.shutdown.cancelled() => {
                    debug!("Control server shutting down");
                    break;
                }
            };
            let conn = TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }

        joinset.shutdown().await;
        Ok(())
    }

    async fn serve_unix<S>(&self, listener: UnixListener, service: S) -> io::Result<()>
    where
        S: hyper::service::Service<Request<Incoming>, Response = HttpResponse>
            + Clone
            + Send
            + 'static,
        S::Future: Send,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Control server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        // Don't kill server on panic - log and continue
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                () = self.shutdown.cancelled() => {
                    debug!("Control server shutting down");
                    break;
                }
            };
            let conn = TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }

        joinset.shutdown().await;
        Ok(())
    }

    async fn control_endpoint_handler(
        driver: Arc<LogDriver>,
        req: Request<Incoming>,
    ) -> http::Result<HttpResponse> {
        match (req.method(), req.uri().path()) {
            (&Method::POST, ACTIVATE_ENDPOINT_PATH) => {
                debug!("Plugin activation requested");
                plugin_json_response(json!({ "Implements": ["LogDriver"] }))
            }
            (&Method::POST, START_LOGGING_ENDPOINT_PATH) => {
                let request: StartLoggingRequest = match Self::read_request(req).await {
                    Ok(request) => request,
                    Err(response) => return response,
                };
                match driver
                    .start_logging(PathBuf::from(&request.file), request.info)
                    .await
                {
                    Ok(()) => log_and_create_plugin_response("StartLogging", None),
                    Err(err) => {
                        log_and_create_plugin_response("StartLogging", Some(&err.to_string()))
                    }
                }
            }
            (&Method::POST, STOP_LOGGING_ENDPOINT_PATH) => {
                let request: StopLoggingRequest = match Self::read_request(req).await {
                    Ok(request) => request,
                    Err(response) => return response,
                };
                match driver.stop_logging(Path::new(&request.file)).await {
                    Ok(()) => log_and_create_plugin_response("StopLogging", None),
                    Err(err) => {
                        log_and_create_plugin_response("StopLogging", Some(&err.to_string()))
                    }
                }
            }
            (&Method::POST, CAPABILITIES_ENDPOINT_PATH) => {
                plugin_json_response(json!({ "Cap": { "ReadLogs": false } }))
            }
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        }
    }

    /// Reads and deserializes a control request body, converting any problem
    /// into the error response to send back.
    async fn read_request<T: DeserializeOwned>(
        req: Request<Incoming>,
    ) -> Result<T, http::Result<HttpResponse>> {
        let (parts, body) = req.into_parts();
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            MAX_REQUEST_CONTENT_LENGTH,
            "Error processing control request",
        ) {
            return Err(response);
        }

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return Err(log_and_create_http_response(
                    &format!("Error reading control request body: {e}"),
                    StatusCode::BAD_REQUEST,
                ));
            }
        };

        serde_json::from_slice(&body_bytes).map_err(|e| {
            log_and_create_http_response(
                &format!("Error deserializing control request: {e}"),
                StatusCode::BAD_REQUEST,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http_utils::PLUGIN_MEDIA_TYPE;
    use bytes::Bytes;
    use http_body_util::Full;
    use serde_json::Value;
    use tokio::task::JoinHandle;

    struct TestServer {
        base_url: String,
        shutdown: CancellationToken,
        driver: Arc<LogDriver>,
        handle: JoinHandle<io::Result<()>>,
    }

    async fn spawn_test_server() -> TestServer {
        let config = Arc::new(Config {
            tcp_port: Some(0),
            ..Config::default()
        });
        let (listener, info) = crate::uds::create_listener(&config).await.unwrap();
        let driver = Arc::new(LogDriver::new(config));
        let shutdown = CancellationToken::new();
        let server = PluginServer::new(driver.clone(), shutdown.clone());
        let handle = tokio::spawn(async move { server.serve(listener).await });

        TestServer {
            base_url: format!("http://127.0.0.1:{}", info.tcp_port.unwrap()),
            shutdown,
            driver,
            handle,
        }
    }

    async fn post_json(base_url: &str, path: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{base_url}{path}"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_activate_lists_log_driver() {
        let server = spawn_test_server().await;

        let response = reqwest::Client::new()
            .post(format!("{}{}", server.base_url, ACTIVATE_ENDPOINT_PATH))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            PLUGIN_MEDIA_TYPE
        );
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "Implements": ["LogDriver"] }));

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_capabilities_disable_log_reading() {
        let server = spawn_test_server().await;

        let response = reqwest::Client::new()
            .post(format!("{}{}", server.base_url, CAPABILITIES_ENDPOINT_PATH))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "Cap": { "ReadLogs": false } }));

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_start_logging_reports_invalid_options_in_err_field() {
        let server = spawn_test_server().await;

        let request = json!({
            "File": "/tmp/does-not-matter",
            "Info": {
                "Config": {},
                "ContainerID": "abc123def456",
            },
        });
        let response =
            post_json(&server.base_url, START_LOGGING_ENDPOINT_PATH, request).await;

        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert!(body["Err"].as_str().unwrap().contains("splunk-url"));
        assert_eq!(server.driver.session_count().await, 0);

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stop_logging_for_unknown_fifo_succeeds() {
        let server = spawn_test_server().await;

        let request = json!({ "File": "/run/docker/logging/never-started" });
        let response = post_json(&server.base_url, STOP_LOGGING_ENDPOINT_PATH, request).await;

        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "Err": "" }));

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let server = spawn_test_server().await;

        let response = reqwest::Client::new()
            .post(format!("{}/LogDriver.ReadLogs", server.base_url))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 404);

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_request_body_is_rejected() {
        let server = spawn_test_server().await;

        let response = reqwest::Client::new()
            .post(format!("{}{}", server.base_url, START_LOGGING_ENDPOINT_PATH))
            .body("{not json")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("Error deserializing control request"));

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_server() {
        let server = spawn_test_server().await;

        server.shutdown.cancel();
        let result = server.handle.await.unwrap();
        assert!(result.is_ok());

        let error = reqwest::Client::new()
            .post(format!("{}{}", server.base_url, ACTIVATE_ENDPOINT_PATH))
            .send()
            .await;
        assert!(error.is_err());
    }

    #[tokio::test]
    async fn test_serves_over_unix_socket() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("plugin.sock");
        let config = Arc::new(Config {
            socket_path: socket_path.to_str().unwrap().to_string(),
            tcp_port: None,
            ..Config::default()
        });
        let (listener, _info) = crate::uds::create_listener(&config).await.unwrap();
        let driver = Arc::new(LogDriver::new(config));
        let shutdown = CancellationToken::new();
        let server = PluginServer::new(driver, shutdown.clone());
        tokio::spawn(async move { server.serve(listener).await });

        let stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.unwrap();
        tokio::spawn(conn);

        let request = Request::builder()
            .method(Method::POST)
            .uri(ACTIVATE_ENDPOINT_PATH)
            .header(hyper::header::HOST, "plugin")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = sender.send_request(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "Implements": ["LogDriver"] }));

        shutdown.cancel();
    }
}
