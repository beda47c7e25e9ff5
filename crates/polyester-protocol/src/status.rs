// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status codes carried by failed calls.

use std::fmt;

use thiserror::Error;

use crate::api_proto;
use crate::client::ClientError;

/// Outcome category of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcStatus {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl RpcStatus {
    /// Transient statuses that a retry may clear.
    pub fn is_retryable(self) -> bool {
        matches!(self, RpcStatus::Unavailable | RpcStatus::DeadlineExceeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RpcStatus::Ok => "OK",
            RpcStatus::Cancelled => "CANCELLED",
            RpcStatus::Unknown => "UNKNOWN",
            RpcStatus::InvalidArgument => "INVALID_ARGUMENT",
            RpcStatus::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcStatus::NotFound => "NOT_FOUND",
            RpcStatus::PermissionDenied => "PERMISSION_DENIED",
            RpcStatus::ResourceExhausted => "RESOURCE_EXHAUSTED",
            RpcStatus::Internal => "INTERNAL",
            RpcStatus::Unavailable => "UNAVAILABLE",
            RpcStatus::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<api_proto::StatusCode> for RpcStatus {
    fn from(code: api_proto::StatusCode) -> Self {
        use api_proto::StatusCode as C;
        match code {
            C::Ok => RpcStatus::Ok,
            C::Cancelled => RpcStatus::Cancelled,
            C::Unknown => RpcStatus::Unknown,
            C::InvalidArgument => RpcStatus::InvalidArgument,
            C::DeadlineExceeded => RpcStatus::DeadlineExceeded,
            C::NotFound => RpcStatus::NotFound,
            C::PermissionDenied => RpcStatus::PermissionDenied,
            C::ResourceExhausted => RpcStatus::ResourceExhausted,
            C::Internal => RpcStatus::Internal,
            C::Unavailable => RpcStatus::Unavailable,
            C::Unauthenticated => RpcStatus::Unauthenticated,
        }
    }
}

impl From<RpcStatus> for api_proto::StatusCode {
    fn from(status: RpcStatus) -> Self {
        use api_proto::StatusCode as C;
        match status {
            RpcStatus::Ok => C::Ok,
            RpcStatus::Cancelled => C::Cancelled,
            RpcStatus::Unknown => C::Unknown,
            RpcStatus::InvalidArgument => C::InvalidArgument,
            RpcStatus::DeadlineExceeded => C::DeadlineExceeded,
            RpcStatus::NotFound => C::NotFound,
            RpcStatus::PermissionDenied => C::PermissionDenied,
            RpcStatus::ResourceExhausted => C::ResourceExhausted,
            RpcStatus::Internal => C::Internal,
            RpcStatus::Unavailable => C::Unavailable,
            RpcStatus::Unauthenticated => C::Unauthenticated,
        }
    }
}

/// A failed call: a status plus the server's (or transport's) message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {message}")]
pub struct RpcError {
    pub status: RpcStatus,
    pub message: String,
}

impl RpcError {
    pub fn new(status: RpcStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }
}

impl From<api_proto::RpcStatusError> for RpcError {
    fn from(err: api_proto::RpcStatusError) -> Self {
        // Unrecognised codes from a newer server degrade to UNKNOWN.
        let status = api_proto::StatusCode::try_from(err.code)
            .map(RpcStatus::from)
            .unwrap_or(RpcStatus::Unknown);
        Self::new(status, err.message)
    }
}

impl From<RpcError> for api_proto::RpcStatusError {
    fn from(err: RpcError) -> Self {
        Self {
            code: api_proto::StatusCode::from(err.status) as i32,
            message: err.message,
        }
    }
}

impl From<ClientError> for RpcError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Timeout(_) => RpcError::new(RpcStatus::DeadlineExceeded, err.to_string()),
            ClientError::Frame(_) => RpcError::new(RpcStatus::Internal, err.to_string()),
            ClientError::InvalidServerName(_) => {
                RpcError::new(RpcStatus::InvalidArgument, err.to_string())
            }
            ClientError::Closed => RpcError::new(RpcStatus::Cancelled, err.to_string()),
            _ => RpcError::new(RpcStatus::Unavailable, err.to_string()),
        }
    }
}
