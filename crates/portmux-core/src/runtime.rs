//! Top-level coordinator: owns the session pool and one supervisor per
//! forward, and exposes the control interface.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError, ForwardConfig};
use crate::control::{ForwardEntry, ForwardSnapshot, ServerStatus, Snapshot};
use crate::error::{Error, Result};
use crate::forward::{self, ForwardStatus, SharedStatus};
use crate::session::SessionPool;

/// How long `stop` waits for supervisors to drain before aborting them.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

struct ForwardHandle {
    config: ForwardConfig,
    status: SharedStatus,
    /// Set when the forward can never start (unknown server). The forward
    /// stays `idle` and the reason is surfaced in its snapshot entry.
    config_error: Option<ConfigError>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

pub struct Runtime {
    config: Config,
    pool: SessionPool,
    forwards: Vec<ForwardHandle>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let pool = SessionPool::new(config.servers.clone().into_iter().collect());

        let forwards = config
            .forwards
            .iter()
            .map(|fc| {
                let config_error = if config.servers.contains_key(&fc.server_name) {
                    None
                } else {
                    Some(ConfigError::Validation {
                        section: fc.name.clone(),
                        reason: format!("references unknown server '{}'", fc.server_name),
                    })
                };
                let mut status = ForwardStatus::default();
                if let Some(e) = &config_error {
                    status.last_error = Some(e.to_string());
                }
                ForwardHandle {
                    config: fc.clone(),
                    status: Arc::new(RwLock::new(status)),
                    config_error,
                    task: Mutex::new(None),
                }
            })
            .collect();

        Runtime {
            config,
            pool,
            forwards,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start every startable forward. Idempotent: forwards already running
    /// are left alone.
    pub async fn start(&self) {
        for handle in &self.forwards {
            if handle.config_error.is_some() {
                warn!(
                    forward = %handle.config.name,
                    "not starting: {}",
                    handle.config_error.as_ref().map(ToString::to_string).unwrap_or_default()
                );
                continue;
            }
            self.spawn_supervisor(handle).await;
        }
    }

    /// Stop everything: cancel supervisors, wait up to the shutdown
    /// deadline, abort stragglers, then close all sessions. Idempotent.
    pub async fn stop(&self) {
        let mut joins = Vec::new();
        for handle in &self.forwards {
            let mut task = handle.task.lock().await;
            if let Some((token, join)) = task.take() {
                token.cancel();
                joins.push((handle.config.name.clone(), join));
            }
        }

        if !joins.is_empty() {
            info!("stopping {} forward(s)", joins.len());
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        for (name, mut join) in joins {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, &mut join).await {
                Ok(_) => debug!(forward = %name, "supervisor drained"),
                Err(_) => {
                    warn!(forward = %name, "supervisor did not drain in time; aborting");
                    join.abort();
                }
            }
        }

        self.pool.close_all().await;
    }

    pub async fn is_running(&self) -> bool {
        for handle in &self.forwards {
            if handle.task.lock().await.is_some() {
                return true;
            }
        }
        false
    }

    pub async fn start_forward(&self, name: &str) -> Result<()> {
        let handle = self.find(name)?;
        if let Some(e) = &handle.config_error {
            return Err(Error::Config(ConfigError::Validation {
                section: name.to_string(),
                reason: e.to_string(),
            }));
        }
        self.spawn_supervisor(handle).await;
        Ok(())
    }

    pub async fn stop_forward(&self, name: &str) -> Result<()> {
        let handle = self.find(name)?;
        let mut task = handle.task.lock().await;
        if let Some((token, mut join)) = task.take() {
            token.cancel();
            if timeout(SHUTDOWN_DEADLINE, &mut join).await.is_err() {
                warn!(forward = %name, "supervisor did not drain in time; aborting");
                join.abort();
            }
        }
        Ok(())
    }

    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let mut out = Vec::with_capacity(self.config.servers.len());
        for name in self.config.servers.keys() {
            out.push(ServerStatus {
                name: name.clone(),
                connected: self.pool.connected(name).await,
            });
        }
        out
    }

    pub async fn list_forwards(&self) -> Vec<ForwardEntry> {
        let mut out = Vec::with_capacity(self.forwards.len());
        for handle in &self.forwards {
            out.push(ForwardEntry {
                name: handle.config.name.clone(),
                server: handle.config.server_name.clone(),
                direction: handle.config.direction,
                endpoints: handle.config.endpoints(),
                state: handle.status.read().await.state,
            });
        }
        out
    }

    pub async fn snapshot(&self) -> Snapshot {
        let mut forwards = Vec::with_capacity(self.forwards.len());
        for handle in &self.forwards {
            forwards.push(ForwardSnapshot {
                name: handle.config.name.clone(),
                server: handle.config.server_name.clone(),
                direction: handle.config.direction,
                endpoints: handle.config.endpoints(),
                status: handle.status.read().await.clone(),
            });
        }
        Snapshot {
            running: self.is_running().await,
            servers: self.list_servers().await,
            forwards,
        }
    }

    /// Number of live sessions in the pool (shutdown-cleanliness checks).
    pub async fn live_sessions(&self) -> usize {
        self.pool.live_sessions().await
    }

    fn find(&self, name: &str) -> Result<&ForwardHandle> {
        self.forwards
            .iter()
            .find(|h| h.config.name == name)
            .ok_or_else(|| Error::UnknownForward(name.to_string()))
    }

    async fn spawn_supervisor(&self, handle: &ForwardHandle) {
        let mut task = handle.task.lock().await;
        if let Some((_, join)) = task.as_ref() {
            if !join.is_finished() {
                return;
            }
        }

        let token = CancellationToken::new();
        let join = tokio::spawn(forward::supervise(
            handle.config.clone(),
            self.pool.clone(),
            handle.status.clone(),
            token.clone(),
        ));
        info!(
            forward = %handle.config.name,
            direction = %handle.config.direction,
            server = %handle.config.server_name,
            "forward started"
        );
        *task = Some((token, join));
    }
}
