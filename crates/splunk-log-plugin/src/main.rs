// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use splunk_log_driver::config::Config;
use splunk_log_driver::driver::LogDriver;
use splunk_log_driver::server::PluginServer;
use splunk_log_driver::uds;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::new() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Error creating config on plugin startup: {e}");
            return;
        }
    };

    let (listener, listener_info) = match uds::create_listener(&config).await {
        Ok(bound) => bound,
        Err(e) => {
            error!("Error binding plugin control listener: {e}");
            return;
        }
    };

    if let Some(port) = listener_info.tcp_port {
        info!("Splunk logging plugin listening on 127.0.0.1:{port}");
    } else if let Some(ref path) = listener_info.socket_path {
        info!("Splunk logging plugin listening on {path}");
    }

    let driver = Arc::new(LogDriver::new(Arc::clone(&config)));
    let shutdown = CancellationToken::new();

    let server = PluginServer::new(Arc::clone(&driver), shutdown.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!("Control server error: {e}");
        }
    });

    wait_for_shutdown_signal().await;
    info!("Shutdown requested, draining active sessions");

    // Stop accepting control requests first, then drain what is still queued.
    shutdown.cancel();
    let _ = server_handle.await;
    driver.shutdown().await;

    // Removes the control socket file.
    drop(listener_info);

    info!("Splunk logging plugin stopped");
}

/// Blocks until SIGTERM or Ctrl+C arrives.
async fn wait_for_shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                }
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                    }
                }
            }
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
    }
}
