// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polyester Runtime - in-container execution engine.
//!
//! A container process opens a session with the control plane, fetches work
//! items for one function invocation, runs user callables against them and
//! streams the results back, until the server sends the kill switch.
//!
//! # Features
//!
//! - **Session**: authenticated connection with a supervised heartbeat
//! - **Three execution shapes**: plain, async and generator callables
//! - **Failure capture**: exceptions, exit requests and panics become
//!   FAILURE results with a summary, a traceback and a reconstructable
//!   [`RemoteError`]
//! - **Backpressure**: server rate-limit delays are honoured between output
//!   batches
//! - **Blocking facade**: [`blocking`] drives the same code from sync callers
//!
//! # Quick Start
//!
//! ```ignore
//! use polyester_runtime::{
//!     Callable, ContainerArguments, FunctionRegistry, Module, container_main,
//! };
//!
//! fn main() {
//!     let registry = FunctionRegistry::new().with_module(
//!         Module::new("functions")
//!             .function("square", Callable::plain(|args| Ok(args.arg::<i64>(0)?.pow(2)))),
//!     );
//!     let code = match ContainerArguments::from_env() {
//!         Ok(args) => container_main(&registry, args),
//!         Err(_) => 1,
//!     };
//!     std::process::exit(code);
//! }
//! ```
//!
//! # Execution shapes
//!
//! | Shape | Results per input |
//! |---|---|
//! | [`ExecutionShape::Plain`] | one, at index 0 |
//! | [`ExecutionShape::Async`] | one, at index 0 |
//! | [`ExecutionShape::Generator`] | one per value at `0..k`, then COMPLETE at `k` (or FAILURE) |

pub mod blocking;
mod client;
mod config;
mod dispatcher;
mod entrypoint;
mod error;
mod failure;
mod function;
mod generator;
mod inputs;
mod logging;
mod outputs;
mod registry;
mod task_context;
mod types;

pub use client::{CLIENT_VERSION, Client};
pub use config::{Identity, RuntimeConfig};
pub use dispatcher::dispatch;
pub use entrypoint::{
    ContainerOutcome, EXIT_INTERRUPTED, container_main, exit_code, run_container,
};
pub use error::{Result, RuntimeError};
pub use failure::{CallSite, ErrorKind, RemoteError, classify, classify_startup};
pub use function::{
    Callable, ExecutionShape, FunctionArgs, Raised, UserException, ValueStream,
};
pub use generator::{GeneratorDriver, GeneratorState, GeneratorStep};
pub use inputs::{DEFAULT_BATCH_SIZE, InputFetcher};
pub use logging::{DEFAULT_FILTER, init_tracing};
pub use outputs::{DEFAULT_MAX_BATCH, OutputEmitter, OutputSender};
pub use registry::{
    ClassDef, EventLog, FunctionRegistry, Instance, LifecycleEvent, Module, StartupError, Target,
    UserClass,
};
pub use task_context::{TaskContext, TaskFailure};
pub use types::{
    ContainerArguments, ExecutionResult, FunctionDefinition, GeneratorStatus, OutputItem,
    ResultStatus, WorkItem,
};

// Re-export for convenience
pub use async_trait::async_trait;
pub use polyester_protocol;
