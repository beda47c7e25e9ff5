// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Input fetch loop: pulls work items for one function invocation.

use std::collections::VecDeque;
use std::time::Duration;

use polyester_protocol::{ApiStub, RetryPolicy};
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::types::WorkItem;

/// Items requested per `FunctionGetInputs` call.
pub const DEFAULT_BATCH_SIZE: u32 = 1;

/// Backoff between consecutive empty batches: 50 ms doubling to 1 s.
fn idle_backoff() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(1),
    }
}

/// Yields [`WorkItem`]s in fetch order until the server sends a kill switch.
///
/// The kill-switch item itself is never yielded, and items queued behind it
/// in the same batch are dropped. A failed fetch is not retried here beyond
/// the stub's own transient-retry budget; it ends the invocation. An empty
/// batch is followed by a growing pause before the next fetch, reset as soon
/// as items arrive.
pub struct InputFetcher {
    stub: ApiStub,
    function_id: String,
    batch_size: u32,
    buffer: VecDeque<WorkItem>,
    finished: bool,
    fetched: u64,
    idle_polls: u32,
    idle_backoff: RetryPolicy,
}

impl InputFetcher {
    pub fn new(stub: ApiStub, function_id: impl Into<String>) -> Self {
        Self {
            stub,
            function_id: function_id.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            buffer: VecDeque::new(),
            finished: false,
            fetched: 0,
            idle_polls: 0,
            idle_backoff: idle_backoff(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of work items handed out so far.
    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    /// Next work item, or `None` once the kill switch was observed.
    #[instrument(skip(self), fields(function_id = %self.function_id))]
    pub async fn next(&mut self) -> Result<Option<WorkItem>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if let Some(item) = self.buffer.pop_front() {
                if item.kill_switch {
                    info!(inputs = self.fetched, "Kill switch received, no more inputs");
                    self.finished = true;
                    self.buffer.clear();
                    return Ok(None);
                }
                self.fetched += 1;
                return Ok(Some(item));
            }

            if self.idle_polls > 0 {
                let delay = self.idle_backoff.delay_for_attempt(self.idle_polls);
                debug!(delay_ms = delay.as_millis() as u64, "No inputs yet, backing off");
                tokio::time::sleep(delay).await;
            }

            let response = self
                .stub
                .function_get_inputs(&self.function_id, self.batch_size)
                .await?;
            debug!(count = response.inputs.len(), "Fetched input batch");
            if response.inputs.is_empty() {
                self.idle_polls = self.idle_polls.saturating_add(1);
            } else {
                self.idle_polls = 0;
            }
            self.buffer
                .extend(response.inputs.into_iter().map(WorkItem::from));
        }
    }
}
