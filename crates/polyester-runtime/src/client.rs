// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client session with the control plane.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use polyester_protocol::{ApiStub, ChannelPool, RpcError, RpcStatus};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::task_context::{TaskContext, TaskFailure};

/// Version reported to the server when the session is created.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Live,
    Stopped,
}

struct Live {
    stub: ApiStub,
    client_id: String,
}

/// A session with the control plane.
///
/// Owns the channel pool and the task context for its whole lifetime.
/// [`start`](Self::start) connects, authenticates and starts the heartbeat;
/// [`stop`](Self::stop) cancels background tasks and closes the pool.
///
/// # Example
///
/// ```ignore
/// use polyester_runtime::{Client, RuntimeConfig};
///
/// let answer = Client::scoped(RuntimeConfig::from_env()?, |client| async move {
///     let stub = client.stub()?;
///     // ... talk to the server
///     Ok(42)
/// })
/// .await?;
/// ```
pub struct Client {
    config: RuntimeConfig,
    tasks: TaskContext,
    live: OnceLock<Live>,
    state: Mutex<State>,
}

impl Client {
    pub fn new(config: RuntimeConfig) -> Self {
        let grace = Duration::from_millis(config.stop_grace_ms);
        Self {
            config,
            tasks: TaskContext::new(grace),
            live: OnceLock::new(),
            state: Mutex::new(State::Idle),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Open the session.
    ///
    /// # Errors
    /// - [`RuntimeError::Connection`] if the server cannot be reached
    /// - [`RuntimeError::Auth`] if the identity is rejected
    /// - [`RuntimeError::Invalid`] if the server issues no client id, or the
    ///   session was already started
    #[instrument(skip(self), fields(server = %self.config.server_addr))]
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != State::Idle {
            return Err(RuntimeError::Invalid(format!(
                "session cannot start from state {:?}",
                *state
            )));
        }

        let pool = Arc::new(ChannelPool::new(self.config.pool_config())?);
        match self.open(&pool).await {
            Ok(live) => {
                info!(client_id = %live.client_id, "Session started");
                // Only ever set here, under the state lock, from Idle.
                let _ = self.live.set(live);
                *state = State::Live;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Session failed to start");
                *state = State::Stopped;
                self.tasks.stop().await;
                pool.close().await;
                Err(e)
            }
        }
    }

    async fn open(&self, pool: &Arc<ChannelPool>) -> Result<Live> {
        pool.start().await?;

        let identity = &self.config.identity;
        let stub = ApiStub::new(
            pool.clone(),
            identity.credentials(),
            self.config.call_timeouts(),
        );
        let response = stub
            .client_create(identity.client_type(), CLIENT_VERSION)
            .await
            .map_err(bootstrap_error)?;
        if response.client_id.is_empty() {
            return Err(RuntimeError::Invalid(
                "server returned an empty client id".to_string(),
            ));
        }
        let client_id = response.client_id;

        self.tasks.start()?;
        if self.config.heartbeat_interval_ms > 0 {
            let heartbeat_stub = stub.clone();
            let heartbeat_id = client_id.clone();
            self.tasks.spawn_periodic(
                "heartbeat",
                Duration::from_millis(self.config.heartbeat_interval_ms),
                move || {
                    let stub = heartbeat_stub.clone();
                    let id = heartbeat_id.clone();
                    async move {
                        stub.client_heartbeat(&id).await?;
                        debug!(client_id = %id, "Heartbeat sent");
                        Ok::<_, RpcError>(())
                    }
                },
            )?;
        }

        Ok(Live { stub, client_id })
    }

    /// Cancel background tasks, then close the channel pool.
    ///
    /// Idempotent, and safe after a failed [`start`](Self::start).
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state == State::Stopped {
            return;
        }
        *state = State::Stopped;

        self.tasks.stop().await;
        if let Some(live) = self.live.get() {
            live.stub.pool().close().await;
            info!(client_id = %live.client_id, "Session stopped");
        }
    }

    /// Stub for control-plane calls; fails before the session started.
    pub fn stub(&self) -> Result<&ApiStub> {
        self.live
            .get()
            .map(|live| &live.stub)
            .ok_or_else(|| RuntimeError::Invalid("session is not started".to_string()))
    }

    pub fn client_id(&self) -> Option<&str> {
        self.live.get().map(|live| live.client_id.as_str())
    }

    /// Whether the session is started and not yet stopped.
    pub fn is_live(&self) -> bool {
        self.live.get().is_some() && self.tasks.is_running()
    }

    /// Supervisor for everything that must not outlive the session.
    pub(crate) fn tasks(&self) -> &TaskContext {
        &self.tasks
    }

    /// Number of background tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks.active_tasks()
    }

    /// Failures recorded by background tasks, such as missed heartbeats.
    pub fn task_failures(&self) -> Vec<TaskFailure> {
        self.tasks.failures()
    }

    /// Run `f` with a started session and stop the session on every exit
    /// path.
    pub async fn scoped<F, Fut, T>(config: RuntimeConfig, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Client>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = Arc::new(Client::new(config));
        client.start().await?;
        let result = f(client.clone()).await;
        client.stop().await;
        result
    }
}

fn bootstrap_error(err: RpcError) -> RuntimeError {
    match err.status {
        RpcStatus::Unauthenticated | RpcStatus::PermissionDenied => {
            RuntimeError::Auth(err.message)
        }
        RpcStatus::Unavailable | RpcStatus::DeadlineExceeded => {
            RuntimeError::Connection(err.to_string())
        }
        _ => RuntimeError::Transport(err),
    }
}
