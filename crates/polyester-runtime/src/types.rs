// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work items, results and invocation descriptors exchanged with the server.

use base64::Engine;
use polyester_protocol::api_proto as proto;
use prost::Message;

use crate::error::{Result, RuntimeError};
use crate::function::ExecutionShape;

/// Outcome of one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Unspecified,
    Success,
    Failure,
}

impl From<proto::GenericStatus> for ResultStatus {
    fn from(status: proto::GenericStatus) -> Self {
        match status {
            proto::GenericStatus::Unspecified => ResultStatus::Unspecified,
            proto::GenericStatus::Success => ResultStatus::Success,
            proto::GenericStatus::Failure => ResultStatus::Failure,
        }
    }
}

impl From<i32> for ResultStatus {
    fn from(value: i32) -> Self {
        proto::GenericStatus::try_from(value)
            .map(ResultStatus::from)
            .unwrap_or(ResultStatus::Unspecified)
    }
}

impl From<ResultStatus> for proto::GenericStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Unspecified => proto::GenericStatus::Unspecified,
            ResultStatus::Success => proto::GenericStatus::Success,
            ResultStatus::Failure => proto::GenericStatus::Failure,
        }
    }
}

/// Generator sub-status of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStatus {
    /// Not a generator item, or a generator failure
    Unspecified,
    /// Partial result, more may follow
    Incomplete,
    /// Terminal marker, empty payload
    Complete,
}

impl From<proto::GeneratorStatus> for GeneratorStatus {
    fn from(status: proto::GeneratorStatus) -> Self {
        match status {
            proto::GeneratorStatus::Unspecified => GeneratorStatus::Unspecified,
            proto::GeneratorStatus::Incomplete => GeneratorStatus::Incomplete,
            proto::GeneratorStatus::Complete => GeneratorStatus::Complete,
        }
    }
}

impl From<i32> for GeneratorStatus {
    fn from(value: i32) -> Self {
        proto::GeneratorStatus::try_from(value)
            .map(GeneratorStatus::from)
            .unwrap_or(GeneratorStatus::Unspecified)
    }
}

impl From<GeneratorStatus> for proto::GeneratorStatus {
    fn from(status: GeneratorStatus) -> Self {
        match status {
            GeneratorStatus::Unspecified => proto::GeneratorStatus::Unspecified,
            GeneratorStatus::Incomplete => proto::GeneratorStatus::Incomplete,
            GeneratorStatus::Complete => proto::GeneratorStatus::Complete,
        }
    }
}

/// Result of executing user code for one input (or one generator step).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ResultStatus,
    pub gen_status: GeneratorStatus,
    /// JSON value on success, JSON [`RemoteError`](crate::RemoteError) on failure
    pub data: Vec<u8>,
    /// Single-line summary, failures only
    pub exception: String,
    pub traceback: String,
}

impl ExecutionResult {
    pub fn success(data: Vec<u8>) -> Self {
        Self {
            status: ResultStatus::Success,
            gen_status: GeneratorStatus::Unspecified,
            data,
            exception: String::new(),
            traceback: String::new(),
        }
    }

    pub fn generator_item(data: Vec<u8>) -> Self {
        Self {
            gen_status: GeneratorStatus::Incomplete,
            ..Self::success(data)
        }
    }

    pub fn generator_complete() -> Self {
        Self {
            gen_status: GeneratorStatus::Complete,
            ..Self::success(Vec::new())
        }
    }

    pub fn failure(exception: String, traceback: String, data: Vec<u8>) -> Self {
        Self {
            status: ResultStatus::Failure,
            gen_status: GeneratorStatus::Unspecified,
            data,
            exception,
            traceback,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == ResultStatus::Failure
    }
}

impl From<ExecutionResult> for proto::GenericResult {
    fn from(result: ExecutionResult) -> Self {
        Self {
            status: proto::GenericStatus::from(result.status) as i32,
            gen_status: proto::GeneratorStatus::from(result.gen_status) as i32,
            data: result.data,
            exception: result.exception,
            traceback: result.traceback,
        }
    }
}

impl From<proto::GenericResult> for ExecutionResult {
    fn from(result: proto::GenericResult) -> Self {
        Self {
            status: ResultStatus::from(result.status),
            gen_status: GeneratorStatus::from(result.gen_status),
            data: result.data,
            exception: result.exception,
            traceback: result.traceback,
        }
    }
}

/// One unit of work fetched from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub input_id: String,
    /// JSON-encoded [`FunctionArgs`](crate::FunctionArgs)
    pub args: Vec<u8>,
    /// End-of-input sentinel; never dispatched
    pub kill_switch: bool,
}

impl From<proto::FunctionGetInputsItem> for WorkItem {
    fn from(item: proto::FunctionGetInputsItem) -> Self {
        Self {
            input_id: item.input_id,
            args: item.input.map(|i| i.args).unwrap_or_default(),
            kill_switch: item.kill_switch,
        }
    }
}

/// A result addressed to one input, with its sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputItem {
    pub input_id: String,
    /// Zero for single results; 0..k for generator results
    pub gen_index: u64,
    pub result: ExecutionResult,
}

impl From<OutputItem> for proto::FunctionPutOutputsItem {
    fn from(item: OutputItem) -> Self {
        Self {
            input_id: item.input_id,
            gen_index: item.gen_index,
            result: Some(item.result.into()),
        }
    }
}

/// Which callable to run and how it produces results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDefinition {
    pub module_name: String,
    /// `name` or `Class.method`
    pub function_name: String,
    pub shape: ExecutionShape,
}

impl FunctionDefinition {
    pub fn new(
        module_name: impl Into<String>,
        function_name: impl Into<String>,
        shape: ExecutionShape,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            function_name: function_name.into(),
            shape,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module_name, self.function_name)
    }
}

impl TryFrom<proto::Function> for FunctionDefinition {
    type Error = RuntimeError;

    fn try_from(function: proto::Function) -> Result<Self> {
        let function_type = proto::FunctionType::try_from(function.function_type)
            .unwrap_or(proto::FunctionType::Unspecified);
        Ok(Self {
            module_name: function.module_name,
            function_name: function.function_name,
            shape: function_type.try_into()?,
        })
    }
}

/// Everything the container needs to know about its invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerArguments {
    pub task_id: String,
    pub function_id: String,
    pub app_id: String,
    pub function_def: FunctionDefinition,
}

impl ContainerArguments {
    /// Decode the base64-encoded protobuf form handed to the container.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| RuntimeError::Config(format!("container arguments: {e}")))?;
        proto::ContainerArguments::decode(bytes.as_slice())?.try_into()
    }

    /// Read `POLYESTER_CONTAINER_ARGUMENTS`.
    pub fn from_env() -> Result<Self> {
        let encoded = std::env::var("POLYESTER_CONTAINER_ARGUMENTS").map_err(|_| {
            RuntimeError::Config("POLYESTER_CONTAINER_ARGUMENTS is required".to_string())
        })?;
        Self::from_base64(&encoded)
    }

    pub fn to_base64(&self) -> String {
        let message = proto::ContainerArguments::from(self.clone());
        base64::engine::general_purpose::STANDARD.encode(message.encode_to_vec())
    }
}

impl TryFrom<proto::ContainerArguments> for ContainerArguments {
    type Error = RuntimeError;

    fn try_from(args: proto::ContainerArguments) -> Result<Self> {
        let function_def = args
            .function_def
            .ok_or_else(|| RuntimeError::Invalid("container arguments lack a function".into()))?
            .try_into()?;
        Ok(Self {
            task_id: args.task_id,
            function_id: args.function_id,
            app_id: args.app_id,
            function_def,
        })
    }
}

impl From<ContainerArguments> for proto::ContainerArguments {
    fn from(args: ContainerArguments) -> Self {
        Self {
            task_id: args.task_id,
            function_id: args.function_id,
            app_id: args.app_id,
            function_def: Some(proto::Function {
                module_name: args.function_def.module_name,
                function_name: args.function_def.function_name,
                function_type: proto::FunctionType::from(args.function_def.shape) as i32,
            }),
        }
    }
}
