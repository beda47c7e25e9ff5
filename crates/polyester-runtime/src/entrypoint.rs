// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container entrypoint: resolve the target, then fetch, execute and report
//! until the kill switch.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use polyester_protocol::ApiStub;
use tracing::{error, info, instrument, warn};

use crate::client::Client;
use crate::config::RuntimeConfig;
use crate::dispatcher::dispatch;
use crate::error::{Result, RuntimeError};
use crate::failure::{RemoteError, classify_startup, panic_to_raised};
use crate::inputs::InputFetcher;
use crate::logging::init_tracing;
use crate::outputs::{DEFAULT_MAX_BATCH, OutputEmitter, OutputSender};
use crate::registry::{EventLog, FunctionRegistry, LifecycleEvent, StartupError, Target};
use crate::types::ContainerArguments;

/// Process exit code for an operator abort.
pub const EXIT_INTERRUPTED: i32 = 130;

/// How a container invocation ended without a runtime error.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerOutcome {
    /// The target could not be loaded; reported through `TaskResult`.
    StartupFailed(RemoteError),
    /// Every input up to the kill switch was processed and reported.
    Completed { inputs: u64, outputs: u64 },
}

/// Run one container invocation on a started session.
///
/// User failures are reported as results and do not make this fail. It fails
/// on transport errors that outlast the retry budget and on interruption,
/// whether raised by user code or by Ctrl-C (when the session config
/// intercepts interrupts). When interrupted, results already queued are
/// flushed and nothing is reported for the in-flight input.
///
/// For `Class.method` targets the instance's `enter` hook runs before the
/// first input and its `exit` hook after the loop, on every path.
#[instrument(skip_all, fields(task_id = %args.task_id, function_id = %args.function_id))]
pub async fn run_container(
    client: &Client,
    registry: &FunctionRegistry,
    args: &ContainerArguments,
    events: &EventLog,
) -> Result<ContainerOutcome> {
    let stub = client.stub()?.clone();

    let target = match registry.resolve(&args.function_def, events) {
        Ok(target) => target,
        Err(e) => return report_startup(&stub, args, &e).await,
    };
    let (emitter, sender) = OutputEmitter::spawn(
        client.tasks(),
        stub.clone(),
        &args.function_id,
        DEFAULT_MAX_BATCH,
    )?;
    if let Some(instance) = &target.instance {
        let entered = AssertUnwindSafe(instance.object.enter())
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_to_raised(payload)));
        if let Err(raised) = entered {
            let err = StartupError::Lifecycle {
                class: instance.class.clone(),
                stage: "enter",
                raised,
            };
            return report_startup(&stub, args, &err).await;
        }
        events.record(&instance.class, LifecycleEvent::Enter);
    }

    info!(qualname = %target.qualname, shape = %args.function_def.shape, "Container started");
    let fetcher = InputFetcher::new(stub, &args.function_id);

    let looped = if client.config().intercept_interrupts {
        tokio::select! {
            result = process(fetcher, &target, sender, events) => result,
            _ = interrupted() => {
                warn!("Interrupt received, aborting container");
                Err(RuntimeError::Interrupted)
            }
        }
    } else {
        process(fetcher, &target, sender, events).await
    };

    let outcome = match looped {
        Ok(inputs) => emitter
            .finish()
            .await
            .map(|outputs| ContainerOutcome::Completed { inputs, outputs }),
        // Results of inputs that finished before the interrupt are still
        // delivered; only the in-flight input goes unreported.
        Err(RuntimeError::Interrupted) => {
            if let Err(e) = emitter.finish().await {
                warn!(error = %e, "Failed to flush outputs after interrupt");
            }
            Err(RuntimeError::Interrupted)
        }
        // A stopped emitter surfaces in the loop as a failed send; its own
        // error is the cause.
        Err(e) => match emitter.finish().await {
            Err(emit_err) => Err(emit_err),
            Ok(_) => Err(e),
        },
    };

    if let Some(instance) = &target.instance {
        let _ = AssertUnwindSafe(instance.object.exit()).catch_unwind().await;
        events.record(&instance.class, LifecycleEvent::Exit);
    }

    match &outcome {
        Ok(ContainerOutcome::Completed { inputs, outputs }) => {
            info!(inputs, outputs, "Container finished")
        }
        Ok(ContainerOutcome::StartupFailed(_)) => {}
        Err(e) => error!(error = %e, "Container failed"),
    }
    outcome
}

async fn process(
    mut fetcher: InputFetcher,
    target: &Target,
    sender: OutputSender,
    events: &EventLog,
) -> Result<u64> {
    while let Some(item) = fetcher.next().await? {
        dispatch(target, &item, &sender, events).await?;
    }
    Ok(fetcher.fetched())
}

async fn report_startup(
    stub: &ApiStub,
    args: &ContainerArguments,
    err: &StartupError,
) -> Result<ContainerOutcome> {
    error!(qualname = %args.function_def.qualified_name(), error = %err, "Container startup failed");
    let result = classify_startup(err, &args.function_def)?;
    let remote = RemoteError::from_bytes(&result.data)?;
    stub.task_result(&args.task_id, result.into()).await?;
    Ok(ContainerOutcome::StartupFailed(remote))
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Exit code for a finished container run: 0 when every result (including
/// user failures) was reported, 130 when interrupted, 1 otherwise.
pub fn exit_code(outcome: &Result<ContainerOutcome>) -> i32 {
    match outcome {
        Ok(_) => 0,
        Err(RuntimeError::Interrupted) => EXIT_INTERRUPTED,
        Err(_) => 1,
    }
}

/// Entry point for container binaries.
///
/// Installs tracing, opens a session from the environment, runs the
/// invocation on a single-threaded runtime and returns the process exit code.
///
/// ```ignore
/// fn main() {
///     let registry = build_registry();
///     let code = match ContainerArguments::from_env() {
///         Ok(args) => container_main(&registry, args),
///         Err(_) => 1,
///     };
///     std::process::exit(code);
/// }
/// ```
pub fn container_main(registry: &FunctionRegistry, args: ContainerArguments) -> i32 {
    init_tracing();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            return 1;
        }
    };

    let outcome = match RuntimeConfig::from_env() {
        Ok(config) => runtime.block_on(async move {
            let events = EventLog::new();
            Client::scoped(config, |client| async move {
                run_container(&client, registry, &args, &events).await
            })
            .await
        }),
        Err(e) => Err(e),
    };
    if let Err(e) = &outcome {
        error!(error = %e, "Container exited with error");
    }
    exit_code(&outcome)
}
