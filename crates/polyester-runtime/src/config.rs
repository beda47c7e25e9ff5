// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime configuration for connecting to the control plane.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use polyester_protocol::api_proto::{ClientType, Credentials};
use polyester_protocol::{CallTimeouts, PoolConfig, RetryPolicy};

use crate::error::{Result, RuntimeError};

/// Who the session authenticates as.
#[derive(Clone, PartialEq, Eq)]
pub enum Identity {
    /// Container started by the platform for one task
    Task { id: String, secret: String },
    /// User token (local tooling)
    Token { id: String, secret: String },
    Anonymous,
}

impl Identity {
    pub fn client_type(&self) -> ClientType {
        match self {
            Identity::Task { .. } => ClientType::Container,
            Identity::Token { .. } | Identity::Anonymous => ClientType::Client,
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match self {
            Identity::Task { id, secret } | Identity::Token { id, secret } => Some(Credentials {
                id: id.clone(),
                secret: secret.clone(),
            }),
            Identity::Anonymous => None,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Task { id, .. } => f.debug_struct("Task").field("id", id).finish_non_exhaustive(),
            Identity::Token { id, .. } => {
                f.debug_struct("Token").field("id", id).finish_non_exhaustive()
            }
            Identity::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Runtime configuration for connecting to the control plane.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Control-plane endpoint (default: "127.0.0.1:8001")
    pub server_addr: SocketAddr,
    /// Server name for TLS verification (default: "localhost")
    pub server_name: String,
    /// Skip TLS certificate verification (default: false, use true for dev)
    pub skip_cert_verification: bool,
    pub identity: Identity,
    /// Connection timeout in milliseconds (default: 10_000)
    pub connect_timeout_ms: u64,
    /// Deadline for data-plane calls in milliseconds (default: 10_000)
    pub request_timeout_ms: u64,
    /// Deadline for session bootstrap and long-poll calls (default: 30_000)
    pub blocking_request_timeout_ms: u64,
    /// Heartbeat period in milliseconds (default: 3_000)
    pub heartbeat_interval_ms: u64,
    /// Number of pooled connections (default: 2)
    pub pool_size: usize,
    /// Retry budget for transient data-plane failures (default: 3)
    pub max_retries: u32,
    /// How long `stop()` waits for background tasks before aborting them
    pub stop_grace_ms: u64,
    /// Treat Ctrl-C during a container run as an operator abort (default: true)
    pub intercept_interrupts: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 8001)),
            server_name: "localhost".to_string(),
            skip_cert_verification: false,
            identity: Identity::Anonymous,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            blocking_request_timeout_ms: 30_000,
            heartbeat_interval_ms: 3_000,
            pool_size: 2,
            max_retries: 3,
            stop_grace_ms: 1_000,
            intercept_interrupts: true,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `POLYESTER_SERVER_ADDR` - Server address (default: "127.0.0.1:8001")
    /// - `POLYESTER_SERVER_NAME` - Server name for TLS (default: "localhost")
    /// - `POLYESTER_SKIP_CERT_VERIFICATION` - Skip TLS verification (default: false)
    /// - `POLYESTER_TASK_ID` / `POLYESTER_TASK_SECRET` - Container identity
    /// - `POLYESTER_TOKEN_ID` / `POLYESTER_TOKEN_SECRET` - User identity
    /// - `POLYESTER_CONNECT_TIMEOUT_MS` - Connection timeout (default: 10000)
    /// - `POLYESTER_REQUEST_TIMEOUT_MS` - Data-plane call timeout (default: 10000)
    /// - `POLYESTER_BLOCKING_REQUEST_TIMEOUT_MS` - Bootstrap call timeout (default: 30000)
    /// - `POLYESTER_HEARTBEAT_INTERVAL_MS` - Heartbeat period (default: 3000)
    /// - `POLYESTER_POOL_SIZE` - Pooled connections (default: 2)
    /// - `POLYESTER_MAX_RETRIES` - Retry budget (default: 3)
    /// - `POLYESTER_INTERCEPT_INTERRUPTS` - Handle Ctrl-C as abort (default: true)
    ///
    /// Task credentials take precedence over token credentials.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        let server_addr = match lookup("POLYESTER_SERVER_ADDR") {
            Some(v) => v.parse().map_err(|e| {
                RuntimeError::Config(format!("invalid POLYESTER_SERVER_ADDR '{v}': {e}"))
            })?,
            None => default.server_addr,
        };

        let identity = match (
            lookup("POLYESTER_TASK_ID"),
            lookup("POLYESTER_TASK_SECRET"),
            lookup("POLYESTER_TOKEN_ID"),
            lookup("POLYESTER_TOKEN_SECRET"),
        ) {
            (Some(id), Some(secret), _, _) => Identity::Task { id, secret },
            (Some(_), None, _, _) => {
                return Err(RuntimeError::Config(
                    "POLYESTER_TASK_ID is set without POLYESTER_TASK_SECRET".to_string(),
                ));
            }
            (None, _, Some(id), Some(secret)) => Identity::Token { id, secret },
            _ => Identity::Anonymous,
        };

        Ok(Self {
            server_addr,
            server_name: lookup("POLYESTER_SERVER_NAME").unwrap_or(default.server_name),
            skip_cert_verification: lookup("POLYESTER_SKIP_CERT_VERIFICATION")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.skip_cert_verification),
            identity,
            connect_timeout_ms: parse_or(
                &lookup,
                "POLYESTER_CONNECT_TIMEOUT_MS",
                default.connect_timeout_ms,
            )?,
            request_timeout_ms: parse_or(
                &lookup,
                "POLYESTER_REQUEST_TIMEOUT_MS",
                default.request_timeout_ms,
            )?,
            blocking_request_timeout_ms: parse_or(
                &lookup,
                "POLYESTER_BLOCKING_REQUEST_TIMEOUT_MS",
                default.blocking_request_timeout_ms,
            )?,
            heartbeat_interval_ms: parse_or(
                &lookup,
                "POLYESTER_HEARTBEAT_INTERVAL_MS",
                default.heartbeat_interval_ms,
            )?,
            pool_size: parse_or(&lookup, "POLYESTER_POOL_SIZE", default.pool_size)?,
            max_retries: parse_or(&lookup, "POLYESTER_MAX_RETRIES", default.max_retries)?,
            stop_grace_ms: default.stop_grace_ms,
            intercept_interrupts: lookup("POLYESTER_INTERCEPT_INTERRUPTS")
                .map(|v| !(v == "false" || v == "0"))
                .unwrap_or(default.intercept_interrupts),
        })
    }

    /// Configuration for a local development server.
    ///
    /// Connects to `addr` without verifying the server certificate.
    pub fn localhost(addr: SocketAddr) -> Self {
        Self {
            server_addr: addr,
            skip_cert_verification: true,
            ..Default::default()
        }
    }

    pub fn with_server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = addr;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Skip TLS certificate verification (for development only!).
    pub fn with_skip_cert_verification(mut self, skip: bool) -> Self {
        self.skip_cert_verification = skip;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn with_blocking_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.blocking_request_timeout_ms = timeout_ms;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_intercept_interrupts(mut self, intercept: bool) -> Self {
        self.intercept_interrupts = intercept;
        self
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            server_addr: self.server_addr,
            server_name: self.server_name.clone(),
            dangerous_skip_cert_verification: self.skip_cert_verification,
            connect_timeout_ms: self.connect_timeout_ms,
            pool_size: self.pool_size,
            retry: RetryPolicy::default().with_max_retries(self.max_retries),
            ..Default::default()
        }
    }

    pub(crate) fn call_timeouts(&self) -> CallTimeouts {
        CallTimeouts {
            request: Duration::from_millis(self.request_timeout_ms),
            blocking: Duration::from_millis(self.blocking_request_timeout_ms),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(v) => v
            .parse()
            .map_err(|e| RuntimeError::Config(format!("invalid {key} '{v}': {e}"))),
        None => Ok(default),
    }
}
