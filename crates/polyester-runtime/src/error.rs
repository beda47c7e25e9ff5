// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime error types.
//!
//! User-code failures are deliberately absent: they become data
//! ([`ExecutionResult`](crate::ExecutionResult)) at the dispatcher boundary and
//! never travel as a `RuntimeError`.

use polyester_protocol::{ClientError, RpcError};
use thiserror::Error;

/// Errors that end a session or a container invocation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Identity rejected while opening the session
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Control plane unreachable while opening the session
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed session state or user configuration
    #[error("invalid: {0}")]
    Invalid(String),

    /// A control-plane call failed after the retry budget was spent
    #[error("transport error: {0}")]
    Transport(#[from] RpcError),

    /// Operator abort; no result is reported for the in-flight input
    #[error("interrupted")]
    Interrupted,

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Missing or invalid environment variable
    #[error("configuration error: {0}")]
    Config(String),

    /// Background task bookkeeping failed
    #[error("supervisor error: {0}")]
    Supervisor(String),
}

impl From<ClientError> for RuntimeError {
    fn from(err: ClientError) -> Self {
        RuntimeError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

impl From<prost::DecodeError> for RuntimeError {
    fn from(err: prost::DecodeError) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

/// Type alias for runtime results.
pub type Result<T> = std::result::Result<T, RuntimeError>;
