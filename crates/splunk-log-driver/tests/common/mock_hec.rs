// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Simple mock HTTP Event Collector for integration tests

use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Status code this request was answered with.
    pub status: u16,
}

#[derive(Clone)]
pub struct MockHec {
    pub addr: SocketAddr,
    pub received_requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    fail_remaining: Arc<AtomicUsize>,
    health_ok: Arc<AtomicBool>,
}

impl MockHec {
    /// Start a mock collector on a random port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let received_requests = Arc::new(Mutex::new(Vec::new()));
        let fail_remaining = Arc::new(AtomicUsize::new(0));
        let health_ok = Arc::new(AtomicBool::new(true));

        let requests_clone = received_requests.clone();
        let fail_clone = fail_remaining.clone();
        let health_clone = health_ok.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let io = TokioIo::new(stream);
                let requests = requests_clone.clone();
                let fail = fail_clone.clone();
                let health = health_clone.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let fail = fail.clone();
                        let health = health.clone();
                        async move {
                            // Capture the request
                            let method = req.method().clone();
                            let path = req.uri().path().to_string();
                            let headers: Vec<(String, String)> = req
                                .headers()
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                                .collect();

                            // Read the body
                            let body_bytes = req
                                .into_body()
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes().to_vec())
                                .unwrap_or_default();

                            let status = if method == Method::OPTIONS {
                                // The connectivity probe.
                                if health.load(Ordering::SeqCst) {
                                    StatusCode::OK
                                } else {
                                    StatusCode::SERVICE_UNAVAILABLE
                                }
                            } else if fail
                                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                                    n.checked_sub(1)
                                })
                                .is_ok()
                            {
                                StatusCode::SERVICE_UNAVAILABLE
                            } else {
                                StatusCode::OK
                            };

                            // Store the request with how it was answered
                            requests.lock().unwrap().push(ReceivedRequest {
                                method: method.to_string(),
                                path,
                                headers,
                                body: body_bytes,
                                status: status.as_u16(),
                            });

                            let body = if status.is_success() {
                                r#"{"text":"Success","code":0}"#
                            } else {
                                r#"{"text":"Internal processing error","code":90}"#
                            };
                            Ok::<_, hyper::http::Error>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });

                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        MockHec {
            addr,
            received_requests,
            fail_remaining,
            health_ok,
        }
    }

    /// Get the base URL of the mock collector
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer the next `count` event submissions with 503
    pub fn fail_next_posts(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Control what the health check endpoint answers
    pub fn set_health_ok(&self, ok: bool) {
        self.health_ok.store(ok, Ordering::SeqCst);
    }

    /// Get all received requests
    pub fn get_requests(&self) -> Vec<ReceivedRequest> {
        self.received_requests.lock().unwrap().clone()
    }

    /// Events from accepted submissions, flattened in arrival order.
    ///
    /// Bodies are concatenated JSON documents, gzip-compressed when the
    /// session asked for it. Rejected submissions are excluded so retried
    /// batches are not double counted.
    pub fn accepted_events(&self) -> Vec<serde_json::Value> {
        self.received_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.method == "POST" && req.status == 200)
            .flat_map(parse_event_stream)
            .collect()
    }
}

fn parse_event_stream(req: &ReceivedRequest) -> Vec<serde_json::Value> {
    let gzipped = req
        .headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("content-encoding") && v == "gzip");
    let body = if gzipped {
        let mut decoder = flate2::read::GzDecoder::new(&req.body[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).expect("Failed to gunzip body");
        out
    } else {
        req.body.clone()
    };

    serde_json::Deserializer::from_slice(&body)
        .into_iter::<serde_json::Value>()
        .collect::<Result<_, _>>()
        .expect("Body is not a stream of JSON events")
}
