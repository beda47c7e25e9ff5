// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed wrappers over [`ChannelPool::call`], one per control-plane method.

use std::sync::Arc;
use std::time::Duration;

use crate::api_proto::{
    ClientCreateRequest, ClientCreateResponse, ClientHeartbeatRequest, ClientHeartbeatResponse,
    ClientType, Credentials, FunctionGetInputsRequest, FunctionGetInputsResponse,
    FunctionPutOutputsItem, FunctionPutOutputsRequest, FunctionPutOutputsResponse, GenericResult,
    RpcRequest, TaskResultRequest, TaskResultResponse, rpc_request, rpc_response,
};
use crate::client::{ChannelPool, Method};
use crate::status::{RpcError, RpcStatus};

/// Per-call deadlines. Long-polling and session-establishing calls use the
/// blocking deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    pub request: Duration,
    pub blocking: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(10),
            blocking: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct ApiStub {
    pool: Arc<ChannelPool>,
    credentials: Option<Credentials>,
    timeouts: CallTimeouts,
}

impl ApiStub {
    pub fn new(
        pool: Arc<ChannelPool>,
        credentials: Option<Credentials>,
        timeouts: CallTimeouts,
    ) -> Self {
        Self {
            pool,
            credentials,
            timeouts,
        }
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    async fn unary<T>(
        &self,
        request: rpc_request::Request,
        timeout: Duration,
        retryable: bool,
        extract: impl FnOnce(rpc_response::Response) -> Option<T>,
    ) -> Result<T, RpcError> {
        let method = Method::of(&request);
        let envelope = RpcRequest {
            credentials: self.credentials.clone(),
            request: Some(request),
        };
        let response = self
            .pool
            .call(method, &envelope, timeout, retryable)
            .await?;
        response.response.and_then(extract).ok_or_else(|| {
            RpcError::new(
                RpcStatus::Internal,
                format!("unexpected response to {}", method.name()),
            )
        })
    }

    /// Never retried: a rejected identity must surface immediately.
    pub async fn client_create(
        &self,
        client_type: ClientType,
        version: &str,
    ) -> Result<ClientCreateResponse, RpcError> {
        let request = rpc_request::Request::ClientCreate(ClientCreateRequest {
            client_type: client_type as i32,
            version: version.to_string(),
        });
        self.unary(request, self.timeouts.blocking, false, |r| match r {
            rpc_response::Response::ClientCreate(resp) => Some(resp),
            _ => None,
        })
        .await
    }

    pub async fn client_heartbeat(
        &self,
        client_id: &str,
    ) -> Result<ClientHeartbeatResponse, RpcError> {
        let request = rpc_request::Request::ClientHeartbeat(ClientHeartbeatRequest {
            client_id: client_id.to_string(),
        });
        self.unary(request, self.timeouts.request, true, |r| match r {
            rpc_response::Response::ClientHeartbeat(resp) => Some(resp),
            _ => None,
        })
        .await
    }

    pub async fn function_get_inputs(
        &self,
        function_id: &str,
        max_values: u32,
    ) -> Result<FunctionGetInputsResponse, RpcError> {
        let request = rpc_request::Request::FunctionGetInputs(FunctionGetInputsRequest {
            function_id: function_id.to_string(),
            max_values,
        });
        self.unary(request, self.timeouts.blocking, true, |r| match r {
            rpc_response::Response::FunctionGetInputs(resp) => Some(resp),
            _ => None,
        })
        .await
    }

    pub async fn function_put_outputs(
        &self,
        function_id: &str,
        outputs: Vec<FunctionPutOutputsItem>,
    ) -> Result<FunctionPutOutputsResponse, RpcError> {
        let request = rpc_request::Request::FunctionPutOutputs(FunctionPutOutputsRequest {
            function_id: function_id.to_string(),
            outputs,
        });
        self.unary(request, self.timeouts.request, true, |r| match r {
            rpc_response::Response::FunctionPutOutputs(resp) => Some(resp),
            _ => None,
        })
        .await
    }

    pub async fn task_result(
        &self,
        task_id: &str,
        result: GenericResult,
    ) -> Result<TaskResultResponse, RpcError> {
        let request = rpc_request::Request::TaskResult(TaskResultRequest {
            task_id: task_id.to_string(),
            result: Some(result),
        });
        self.unary(request, self.timeouts.blocking, true, |r| match r {
            rpc_response::Response::TaskResult(resp) => Some(resp),
            _ => None,
        })
        .await
    }
}
