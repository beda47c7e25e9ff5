// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution dispatcher: runs a resolved callable against one work item.
//!
//! Every shape reports through the [`OutputSender`]:
//!
//! - plain and async callables produce one result at sequence index 0
//! - generators produce one INCOMPLETE result per value at indices `0..k`,
//!   then either a COMPLETE marker at index `k` or a FAILURE at the index
//!   where the sequence stopped
//!
//! Raised exceptions, exit requests and panics become FAILURE results. An
//! interrupt is returned as [`RuntimeError::Interrupted`] and nothing is
//! reported for the input.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::{Result, RuntimeError};
use crate::failure::{CallSite, classify, panic_to_raised};
use crate::function::{Callable, FunctionArgs, Raised};
use crate::generator::{GeneratorDriver, GeneratorStep};
use crate::outputs::OutputSender;
use crate::registry::{EventLog, LifecycleEvent, Target};
use crate::types::{ExecutionResult, OutputItem, WorkItem};

/// Run `target` on `item` and queue its results. Returns how many results
/// were queued.
#[instrument(skip_all, fields(input_id = %item.input_id, qualname = %target.qualname))]
pub async fn dispatch(
    target: &Target,
    item: &WorkItem,
    outputs: &OutputSender,
    events: &EventLog,
) -> Result<u64> {
    let site = CallSite::new(target.qualname.as_str(), Some(&item.input_id));
    let started = Instant::now();

    if let Some(instance) = &target.instance {
        events.record(&instance.class, LifecycleEvent::Call);
    }

    let args = match FunctionArgs::from_bytes(&item.args) {
        Ok(args) => args,
        Err(e) => {
            let raised = Raised::exception("DeserializationError", e.to_string());
            emit(outputs, item, 0, classify(raised, &site)?).await?;
            return Ok(1);
        }
    };

    let emitted = match &target.callable {
        Callable::Plain(f) => {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| f(args)))
                .unwrap_or_else(|payload| Err(panic_to_raised(payload)));
            emit(outputs, item, 0, single(outcome, &site)?).await?;
            1
        }
        Callable::Async(f) => {
            let outcome = AssertUnwindSafe(async { f(args).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(panic_to_raised(payload)));
            emit(outputs, item, 0, single(outcome, &site)?).await?;
            1
        }
        Callable::Generator(f) => {
            match std::panic::catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(stream) => drive(GeneratorDriver::new(stream), item, outputs, &site).await?,
                Err(payload) => {
                    let result = classify(panic_to_raised(payload), &site)?;
                    emit(outputs, item, 0, result).await?;
                    1
                }
            }
        }
    };

    debug!(
        outputs = emitted,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Input processed"
    );
    Ok(emitted)
}

async fn drive(
    mut driver: GeneratorDriver,
    item: &WorkItem,
    outputs: &OutputSender,
    site: &CallSite,
) -> Result<u64> {
    let mut emitted = 0;
    while let Some(step) = driver.pull().await {
        let (index, result) = match step {
            GeneratorStep::Yielded { index, value } => {
                (index, ExecutionResult::generator_item(encode(&value)?))
            }
            GeneratorStep::Completed { index } => (index, ExecutionResult::generator_complete()),
            GeneratorStep::Failed { index, raised } => (index, classify(raised, site)?),
        };
        emit(outputs, item, index, result).await?;
        emitted += 1;
    }
    Ok(emitted)
}

fn single(outcome: std::result::Result<Value, Raised>, site: &CallSite) -> Result<ExecutionResult> {
    match outcome {
        Ok(value) => Ok(ExecutionResult::success(encode(&value)?)),
        Err(raised) => classify(raised, site),
    }
}

fn encode(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(RuntimeError::from)
}

async fn emit(
    outputs: &OutputSender,
    item: &WorkItem,
    gen_index: u64,
    result: ExecutionResult,
) -> Result<()> {
    outputs
        .send(OutputItem {
            input_id: item.input_id.clone(),
            gen_index,
            result,
        })
        .await
}
