// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blocking facade over the async session and entrypoint.
//!
//! Each call runs the async implementation to completion on a runtime owned
//! by the [`Client`]. The runtime has a single worker thread, so background
//! tasks such as the heartbeat keep running between calls.
//!
//! Must not be used from inside an async context.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::entrypoint::{self, ContainerOutcome};
use crate::error::{Result, RuntimeError};
use crate::registry::{EventLog, FunctionRegistry};
use crate::types::ContainerArguments;

pub struct Client {
    runtime: tokio::runtime::Runtime,
    inner: Arc<crate::client::Client>,
}

impl Client {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("polyester-runtime")
            .enable_all()
            .build()
            .map_err(|e| RuntimeError::Supervisor(format!("failed to build runtime: {e}")))?;
        Ok(Self {
            runtime,
            inner: Arc::new(crate::client::Client::new(config)),
        })
    }

    pub fn start(&self) -> Result<()> {
        self.runtime.block_on(self.inner.start())
    }

    pub fn stop(&self) {
        self.runtime.block_on(self.inner.stop())
    }

    pub fn client_id(&self) -> Option<&str> {
        self.inner.client_id()
    }

    /// The async session behind this facade.
    pub fn session(&self) -> &Arc<crate::client::Client> {
        &self.inner
    }

    pub fn run_container(
        &self,
        registry: &FunctionRegistry,
        args: &ContainerArguments,
        events: &EventLog,
    ) -> Result<ContainerOutcome> {
        self.runtime.block_on(entrypoint::run_container(
            &self.inner,
            registry,
            args,
            events,
        ))
    }

    /// Run `f` with a started session and stop the session afterwards, also
    /// when `f` fails.
    pub fn scoped<F, T>(config: RuntimeConfig, f: F) -> Result<T>
    where
        F: FnOnce(&Client) -> Result<T>,
    {
        let client = Client::new(config)?;
        client.start()?;
        let result = f(&client);
        client.stop();
        result
    }
}

/// Blocking form of [`entrypoint::run_container`] with its own session.
pub fn run_container(
    config: RuntimeConfig,
    registry: &FunctionRegistry,
    args: &ContainerArguments,
    events: &EventLog,
) -> Result<ContainerOutcome> {
    Client::scoped(config, |client| client.run_container(registry, args, events))
}
