// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pull-based driver for generator callables.

use std::panic::AssertUnwindSafe;

use futures::{FutureExt, StreamExt};
use serde_json::Value;

use crate::failure::panic_to_raised;
use crate::function::{Raised, ValueStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Nothing pulled yet
    Pending,
    /// At least one value produced, more may follow
    Producing,
    /// Ran to completion
    Exhausted,
    /// Stopped by a raised signal or panic
    Failed,
}

#[derive(Debug, PartialEq)]
pub enum GeneratorStep {
    Yielded { index: u64, value: Value },
    /// Sequence finished; `index` is the next free sequence index
    Completed { index: u64 },
    /// Sequence aborted; `index` is the next free sequence index
    Failed { index: u64, raised: Raised },
}

/// Drives a [`ValueStream`] one value at a time, numbering values from 0.
///
/// After a `Completed` or `Failed` step the driver is finished and every
/// further pull returns `None`; a generator is never restarted.
pub struct GeneratorDriver {
    stream: ValueStream,
    state: GeneratorState,
    next_index: u64,
}

impl GeneratorDriver {
    pub fn new(stream: ValueStream) -> Self {
        Self {
            stream,
            state: GeneratorState::Pending,
            next_index: 0,
        }
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    pub async fn pull(&mut self) -> Option<GeneratorStep> {
        if matches!(
            self.state,
            GeneratorState::Exhausted | GeneratorState::Failed
        ) {
            return None;
        }

        let next = AssertUnwindSafe(self.stream.next()).catch_unwind().await;
        let index = self.next_index;
        let step = match next {
            Ok(Some(Ok(value))) => {
                self.state = GeneratorState::Producing;
                self.next_index += 1;
                GeneratorStep::Yielded { index, value }
            }
            Ok(Some(Err(raised))) => {
                self.state = GeneratorState::Failed;
                GeneratorStep::Failed { index, raised }
            }
            Ok(None) => {
                self.state = GeneratorState::Exhausted;
                GeneratorStep::Completed { index }
            }
            Err(payload) => {
                self.state = GeneratorState::Failed;
                GeneratorStep::Failed {
                    index,
                    raised: panic_to_raised(payload),
                }
            }
        };
        Some(step)
    }
}
