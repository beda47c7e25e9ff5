// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Output emission loop.
//!
//! Results are queued through an [`OutputSender`] and reported by a single
//! background task, so items leave in exactly the order they were queued.
//! Whatever is already queued when a send returns is batched into the next
//! `FunctionPutOutputs` call. A rate-limit delay signalled by the server is
//! slept before the next call.

use std::time::Duration;

use polyester_protocol::ApiStub;
use polyester_protocol::api_proto::FunctionPutOutputsItem;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{Result, RuntimeError};
use crate::task_context::TaskContext;
use crate::types::OutputItem;

/// Upper bound on items per `FunctionPutOutputs` call.
pub const DEFAULT_MAX_BATCH: usize = 32;

const QUEUE_CAPACITY: usize = 256;

/// Queues results for the emitter. Dropping every sender lets the emitter
/// flush and finish.
#[derive(Clone)]
pub struct OutputSender {
    tx: mpsc::Sender<OutputItem>,
}

impl OutputSender {
    /// Queue `item`, waiting while the queue is full.
    ///
    /// Fails once the emitter has stopped, which only happens after a
    /// reporting call failed.
    pub async fn send(&self, item: OutputItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| RuntimeError::Supervisor("output emitter has stopped".to_string()))
    }

    #[cfg(test)]
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutputItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Handle on the emitter task, which runs under the session's
/// [`TaskContext`] so stopping the session also stops the emitter.
pub struct OutputEmitter {
    done: oneshot::Receiver<Result<u64>>,
}

impl OutputEmitter {
    pub fn spawn(
        tasks: &TaskContext,
        stub: ApiStub,
        function_id: impl Into<String>,
        max_batch: usize,
    ) -> Result<(Self, OutputSender)> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let done = tasks.spawn_joinable(
            "output-emitter",
            emit_loop(stub, function_id.into(), rx, max_batch.max(1)),
        )?;
        Ok((Self { done }, OutputSender { tx }))
    }

    /// Wait until every queued item has been reported. Returns the number
    /// of items sent.
    ///
    /// All senders must be dropped first or this waits forever.
    pub async fn finish(self) -> Result<u64> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Supervisor(
                "output emitter was cancelled or panicked".to_string(),
            )),
        }
    }
}

async fn emit_loop(
    stub: ApiStub,
    function_id: String,
    mut rx: mpsc::Receiver<OutputItem>,
    max_batch: usize,
) -> Result<u64> {
    let mut sent = 0u64;
    while let Some(first) = rx.recv().await {
        let mut batch: Vec<FunctionPutOutputsItem> = vec![first.into()];
        while batch.len() < max_batch {
            match rx.try_recv() {
                Ok(item) => batch.push(item.into()),
                Err(_) => break,
            }
        }

        let count = batch.len();
        let response = match stub.function_put_outputs(&function_id, batch).await {
            Ok(response) => response,
            Err(e) => {
                error!(function_id = %function_id, error = %e, "Failed to report outputs");
                return Err(e.into());
            }
        };
        sent += count as u64;
        debug!(function_id = %function_id, count, "Reported outputs");

        if response.rate_limit_delay_ms > 0 {
            debug!(
                function_id = %function_id,
                delay_ms = response.rate_limit_delay_ms,
                "Rate limited, backing off"
            );
            tokio::time::sleep(Duration::from_millis(response.rate_limit_delay_ms)).await;
        }
    }
    Ok(sent)
}
