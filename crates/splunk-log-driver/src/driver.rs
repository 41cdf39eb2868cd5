// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Session supervisor behind the plugin endpoints.
//!
//! The registry maps each container fifo path to its running [`Session`]
//! and is the only structure shared across sessions. Config validation and
//! the optional collector probe happen before a session exists, so a
//! malformed start request never leaves anything behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::{Config, SessionInfo, SessionSettings};
use crate::error::DriverError;
use crate::hec::HecClient;
use crate::session::{Session, SessionStatus};

pub struct LogDriver {
    config: Arc<Config>,
    sessions: Mutex<HashMap<PathBuf, Session>>,
}

impl LogDriver {
    pub fn new(config: Arc<Config>) -> LogDriver {
        LogDriver {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Validates the request and spawns the container's pipeline. A second
    /// start for a fifo that is already being read is a no-op; the session
    /// is identified by its fifo path.
    pub async fn start_logging(
        &self,
        fifo_path: PathBuf,
        info: SessionInfo,
    ) -> Result<(), DriverError> {
        {
            let sessions = self.sessions.lock().await;
            if sessions.contains_key(&fifo_path) {
                info!("logging session for {} already running", fifo_path.display());
                return Ok(());
            }
        }

        let settings = SessionSettings::parse(&info)?;
        let client = HecClient::new(&settings)?;
        if settings.verify_connection {
            client.verify_connection().await?;
        }

        let container_id = info.container_id.clone();
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&fifo_path) {
            return Ok(());
        }
        let session = Session::spawn(
            &self.config,
            settings,
            container_id,
            fifo_path.clone(),
            Arc::new(client),
        );
        info!(
            container_id = %session.container_id(),
            "started logging session for {}",
            fifo_path.display()
        );
        sessions.insert(fifo_path, session);
        Ok(())
    }

    /// Drains and removes the session for a fifo path. Unknown paths are a
    /// no-op so the daemon can retry stops safely.
    pub async fn stop_logging(&self, fifo_path: &Path) -> Result<(), DriverError> {
        let session = self.sessions.lock().await.remove(fifo_path);
        match session {
            Some(session) => {
                debug!("stopping logging session for {}", fifo_path.display());
                session.stop().await.map(|_| ())
            }
            None => {
                info!("no logging session for {}", fifo_path.display());
                Ok(())
            }
        }
    }

    /// Drains every session, used at plugin shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<(PathBuf, Session)> = {
            let mut registry = self.sessions.lock().await;
            registry.drain().collect()
        };
        for (path, session) in sessions {
            if let Err(err) = session.stop().await {
                error!("failed to drain session for {}: {err}", path.display());
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn session_status(&self, fifo_path: &Path) -> Option<SessionStatus> {
        self.sessions
            .lock()
            .await
            .get(fifo_path)
            .map(Session::status)
    }
}
