// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fake control plane and test functions shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use polyester_protocol::api_proto::{
    ClientCreateResponse, ClientHeartbeatResponse, Credentials, FunctionGetInputsItem,
    FunctionGetInputsResponse, FunctionInput, FunctionPutOutputsItem, FunctionPutOutputsResponse,
    GenericResult, TaskResultResponse, rpc_request::Request, rpc_response::Response,
};
use polyester_protocol::{ApiHandler, ApiServer, ApiServerConfig, RpcError, RpcStatus};
use polyester_runtime::{
    Callable, ClassDef, ContainerArguments, ExecutionResult, ExecutionShape, FunctionArgs,
    FunctionDefinition, FunctionRegistry, Identity, Module, Raised, RuntimeConfig, UserClass,
};
use serde_json::{Value, json};

pub const TASK_ID: &str = "ta-1";
pub const FUNCTION_ID: &str = "fu-1";

/// Scripted control plane.
///
/// Hands out one queued input per `FunctionGetInputs` call, then the kill
/// switch. Records every output and task result it receives.
#[derive(Default)]
pub struct Servicer {
    pub inputs: Mutex<VecDeque<FunctionGetInputsItem>>,
    pub outputs: Mutex<Vec<FunctionPutOutputsItem>>,
    pub task_results: Mutex<Vec<(String, GenericResult)>>,
    pub heartbeats: AtomicU32,
    pub get_inputs_calls: AtomicU32,
    pub put_outputs_calls: AtomicU32,
    /// Empty `FunctionGetInputs` batches to answer with before any input.
    pub empty_batches: AtomicU32,
    pub rate_limit_delay_ms: u64,
    pub fail_get_inputs: bool,
    pub reject_auth: bool,
    pub empty_client_id: bool,
}

impl Servicer {
    pub fn with_inputs(inputs: Vec<FunctionArgs>) -> Self {
        let servicer = Self::default();
        servicer.push_inputs(inputs);
        servicer
    }

    pub fn push_inputs(&self, inputs: Vec<FunctionArgs>) {
        let mut queue = self.inputs.lock().unwrap();
        let start = queue.len();
        for (i, args) in inputs.into_iter().enumerate() {
            queue.push_back(FunctionGetInputsItem {
                input_id: format!("in-{}", start + i),
                input: Some(FunctionInput {
                    args: args.to_bytes().unwrap(),
                }),
                kill_switch: false,
            });
        }
    }

    /// Every output item received, as `(input_id, gen_index, result)`.
    pub fn outputs(&self) -> Vec<(String, u64, ExecutionResult)> {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .map(|item| {
                (
                    item.input_id.clone(),
                    item.gen_index,
                    item.result.clone().unwrap_or_default().into(),
                )
            })
            .collect()
    }

    pub fn task_results(&self) -> Vec<(String, ExecutionResult)> {
        self.task_results
            .lock()
            .unwrap()
            .iter()
            .map(|(task_id, result)| (task_id.clone(), result.clone().into()))
            .collect()
    }
}

#[async_trait]
impl ApiHandler for Servicer {
    async fn handle(
        &self,
        credentials: Option<Credentials>,
        request: Request,
    ) -> Result<Response, RpcError> {
        match request {
            Request::ClientCreate(_) => {
                if self.reject_auth || credentials.is_none() {
                    return Err(RpcError::new(RpcStatus::Unauthenticated, "invalid credentials"));
                }
                let client_id = if self.empty_client_id { "" } else { "cl-1" };
                Ok(Response::ClientCreate(ClientCreateResponse {
                    client_id: client_id.to_string(),
                }))
            }
            Request::ClientHeartbeat(_) => {
                self.heartbeats.fetch_add(1, Ordering::SeqCst);
                Ok(Response::ClientHeartbeat(ClientHeartbeatResponse {}))
            }
            Request::FunctionGetInputs(req) => {
                self.get_inputs_calls.fetch_add(1, Ordering::SeqCst);
                if self.fail_get_inputs {
                    return Err(RpcError::new(RpcStatus::Internal, "injected failure"));
                }
                if self.empty_batches.load(Ordering::SeqCst) > 0 {
                    self.empty_batches.fetch_sub(1, Ordering::SeqCst);
                    return Ok(Response::FunctionGetInputs(FunctionGetInputsResponse {
                        inputs: Vec::new(),
                    }));
                }
                let mut queue = self.inputs.lock().unwrap();
                let mut inputs = Vec::new();
                while inputs.len() < req.max_values.max(1) as usize {
                    match queue.pop_front() {
                        Some(item) => inputs.push(item),
                        None => {
                            inputs.push(FunctionGetInputsItem {
                                kill_switch: true,
                                ..Default::default()
                            });
                            break;
                        }
                    }
                }
                Ok(Response::FunctionGetInputs(FunctionGetInputsResponse {
                    inputs,
                }))
            }
            Request::FunctionPutOutputs(req) => {
                self.put_outputs_calls.fetch_add(1, Ordering::SeqCst);
                self.outputs.lock().unwrap().extend(req.outputs);
                Ok(Response::FunctionPutOutputs(FunctionPutOutputsResponse {
                    rate_limit_delay_ms: self.rate_limit_delay_ms,
                }))
            }
            Request::TaskResult(req) => {
                self.task_results
                    .lock()
                    .unwrap()
                    .push((req.task_id, req.result.unwrap_or_default()));
                Ok(Response::TaskResult(TaskResultResponse {}))
            }
        }
    }
}

pub async fn start_server(servicer: Arc<Servicer>) -> (Arc<ApiServer>, SocketAddr) {
    let server = Arc::new(
        ApiServer::localhost_with_config(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            ApiServerConfig::default(),
        )
        .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(servicer).await;
    });
    (server, addr)
}

pub fn config(addr: SocketAddr) -> RuntimeConfig {
    RuntimeConfig::localhost(addr)
        .with_identity(Identity::Task {
            id: TASK_ID.to_string(),
            secret: "ts-1".to_string(),
        })
        .with_connect_timeout_ms(2_000)
        .with_request_timeout_ms(2_000)
        .with_blocking_request_timeout_ms(2_000)
}

pub fn container_args(function: &str, shape: ExecutionShape) -> ContainerArguments {
    container_args_in("functions", function, shape)
}

pub fn container_args_in(module: &str, function: &str, shape: ExecutionShape) -> ContainerArguments {
    ContainerArguments {
        task_id: TASK_ID.to_string(),
        function_id: FUNCTION_ID.to_string(),
        app_id: "ap-1".to_string(),
        function_def: FunctionDefinition::new(module, function, shape),
    }
}

pub fn args(values: Vec<Value>) -> FunctionArgs {
    FunctionArgs::positional(values)
}

struct Greeter {
    greeting: String,
}

#[async_trait]
impl UserClass for Greeter {
    fn method(self: Arc<Self>, name: &str) -> Option<Callable> {
        match name {
            "greet" => Some(Callable::plain(move |args: FunctionArgs| {
                let who: String = args.arg(0)?;
                Ok(format!("{}, {who}!", self.greeting))
            })),
            _ => None,
        }
    }
}

fn squares(n: u64, fail_at: Option<u64>) -> Vec<Result<u64, Raised>> {
    (0..n)
        .map(|i| {
            if Some(i) == fail_at {
                Err(Raised::exception("Exception", "bad"))
            } else {
                Ok(i * i)
            }
        })
        .collect()
}

/// The functions the tests run inside the container.
pub fn registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with_module(
            Module::new("functions")
                .function(
                    "square",
                    Callable::plain(|args: FunctionArgs| Ok(args.arg::<i64>(0)?.pow(2))),
                )
                .function(
                    "square_or_interrupt",
                    Callable::plain(|args: FunctionArgs| {
                        let x = args.arg::<i64>(0)?;
                        if x < 0 {
                            Err(Raised::Interrupt)
                        } else {
                            Ok(x.pow(2))
                        }
                    }),
                )
                .function(
                    "square_async",
                    Callable::asynchronous(|args: FunctionArgs| async move {
                        let delay_ms: u64 = args.arg(1)?;
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        Ok(args.arg::<i64>(0)?.pow(2))
                    }),
                )
                .function(
                    "gen_n",
                    Callable::generator_iter(|args: FunctionArgs| match args.arg::<u64>(0) {
                        Ok(n) => squares(n, None),
                        Err(raised) => vec![Err(raised)],
                    }),
                )
                .function(
                    "gen_n_fail_on_m",
                    Callable::generator_iter(|args: FunctionArgs| {
                        match (args.arg::<u64>(0), args.arg::<u64>(1)) {
                            (Ok(n), Ok(m)) => squares(n, Some(m)),
                            (Err(raised), _) | (_, Err(raised)) => vec![Err(raised)],
                        }
                    }),
                )
                .function(
                    "raises",
                    Callable::plain(|_: FunctionArgs| -> Result<Value, Raised> {
                        Err(Raised::exception("Exception", "Failure!"))
                    }),
                )
                .function(
                    "exits",
                    Callable::plain(|_: FunctionArgs| -> Result<Value, Raised> {
                        Err(Raised::Exit(1))
                    }),
                )
                .function(
                    "interrupts",
                    Callable::plain(|_: FunctionArgs| -> Result<Value, Raised> {
                        Err(Raised::Interrupt)
                    }),
                )
                .function("identity", Callable::plain(|args: FunctionArgs| Ok(json!(args.args))))
                .class(ClassDef::new("Greeter", || {
                    Ok(Greeter {
                        greeting: "Hello".to_string(),
                    })
                }))
                .class(ClassDef::new("Boom", || -> Result<Greeter, Raised> {
                    panic!("ctor blew up")
                })),
        )
        .with_module(Module::new("broken").with_loader(|| {
            Err(Raised::exception("ImportError", "No module named 'nonexistent_dependency'"))
        }))
        .with_module(
            Module::new("script")
                .unguarded()
                .function("square", Callable::plain(|args: FunctionArgs| Ok(args.arg::<i64>(0)?))),
        )
}
