// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured supervision of background tasks.
//!
//! A [`TaskContext`] owns every background operation of a session (the
//! heartbeat loop, watchers). Stopping it cancels all of them and waits for
//! them to finish, so nothing outlives the session that spawned it.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Result, RuntimeError};

/// An error raised by a supervised task while the context was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct Supervised {
    name: String,
    handle: JoinHandle<()>,
}

pub struct TaskContext {
    cancel: CancellationToken,
    phase: Mutex<Phase>,
    tasks: Mutex<Vec<Supervised>>,
    failures: Arc<Mutex<Vec<TaskFailure>>>,
    stopping: tokio::sync::Mutex<()>,
    grace: Duration,
}

impl TaskContext {
    /// `grace` bounds how long [`stop`](Self::stop) waits for a cancelled
    /// task before aborting it.
    pub fn new(grace: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            phase: Mutex::new(Phase::Idle),
            tasks: Mutex::new(Vec::new()),
            failures: Default::default(),
            stopping: tokio::sync::Mutex::new(()),
            grace,
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut phase = lock(&self.phase);
        match *phase {
            Phase::Idle => {
                *phase = Phase::Running;
                Ok(())
            }
            Phase::Running => Err(RuntimeError::Supervisor("already started".to_string())),
            Phase::Stopped => Err(RuntimeError::Supervisor(
                "cannot restart a stopped task context".to_string(),
            )),
        }
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.phase) == Phase::Running
    }

    /// Token cancelled when the context stops.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `task` until it finishes or the context stops. An error it
    /// returns is logged and recorded; it never stops the context.
    pub fn spawn<F, E>(&self, name: &str, task: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display,
    {
        self.ensure_running(name)?;
        let cancel = self.cancel.clone();
        let failures = self.failures.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(task = %task_name, "Supervised task cancelled");
                }
                result = task => {
                    if let Err(e) = result {
                        error!(task = %task_name, error = %e, "Supervised task failed");
                        record(&failures, &task_name, e.to_string());
                    }
                }
            }
        });
        self.track(name, handle);
        Ok(())
    }

    /// Run `task` under supervision and hand its output back through the
    /// returned receiver. The receiver errors if the context stops first or
    /// the task panics.
    pub fn spawn_joinable<F, T>(&self, name: &str, task: F) -> Result<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_running(name)?;
        let cancel = self.cancel.clone();
        let task_name = name.to_string();
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(task = %task_name, "Supervised task cancelled");
                }
                output = task => {
                    let _ = tx.send(output);
                }
            }
        });
        self.track(name, handle);
        Ok(rx)
    }

    /// Run `tick` immediately and then every `interval` until the context
    /// stops. Failed ticks are logged and recorded; the loop keeps going.
    pub fn spawn_periodic<F, Fut, E>(&self, name: &str, interval: Duration, mut tick: F) -> Result<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display,
    {
        self.ensure_running(name)?;
        let cancel = self.cancel.clone();
        let failures = self.failures.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            debug!(task = %task_name, interval_ms = interval.as_millis() as u64, "Periodic task started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = tick() => {
                        if let Err(e) = result {
                            warn!(task = %task_name, error = %e, "Periodic task iteration failed");
                            record(&failures, &task_name, e.to_string());
                        }
                    }
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!(task = %task_name, "Periodic task stopped");
        });
        self.track(name, handle);
        Ok(())
    }

    /// Cancel every task and wait for all of them. Idempotent; a concurrent
    /// caller waits for the stop already in progress.
    pub async fn stop(&self) {
        let _guard = self.stopping.lock().await;
        {
            let mut phase = lock(&self.phase);
            if *phase == Phase::Stopped {
                return;
            }
            *phase = Phase::Stopped;
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for Supervised { name, mut handle } in tasks {
            match tokio::time::timeout(self.grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    error!(task = %name, error = %e, "Supervised task panicked");
                    record(&self.failures, &name, e.to_string());
                }
                Err(_) => {
                    warn!(task = %name, "Task ignored cancellation, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
        debug!("Task context stopped");
    }

    /// Best-effort synchronous teardown for drop paths: cancel and abort.
    pub fn abort_all(&self) {
        self.cancel.cancel();
        for task in lock(&self.tasks).drain(..) {
            task.handle.abort();
        }
    }

    /// Number of tracked tasks that have not finished.
    pub fn active_tasks(&self) -> usize {
        lock(&self.tasks)
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        lock(&self.failures).clone()
    }

    fn ensure_running(&self, name: &str) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RuntimeError::Supervisor(format!(
                "cannot spawn '{name}': task context is not running"
            )))
        }
    }

    fn track(&self, name: &str, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(Supervised {
            name: name.to_string(),
            handle,
        });
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn record(failures: &Mutex<Vec<TaskFailure>>, task: &str, error: String) {
    lock(failures).push(TaskFailure {
        task: task.to_string(),
        error,
        at: Utc::now(),
    });
}

// A poisoned lock only means another task panicked mid-update; the data is
// still a valid Vec or Phase.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
