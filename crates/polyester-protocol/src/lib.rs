// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polyester Protocol - QUIC + Protobuf control-plane layer
//!
//! This crate carries every call a container runtime makes to the server:
//! session creation and heartbeats, input fetching, output submission and
//! whole-task results.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    polyester-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Stub: typed calls, deadlines, retry of transient failures  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Channel pool: round-robin QUIC connections, reconnect      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing + Protobuf (prost), one call per stream            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use polyester_protocol::{ApiStub, CallTimeouts, ChannelPool, api_proto::ClientType};
//!
//! let pool = Arc::new(ChannelPool::localhost("127.0.0.1:8001".parse()?)?);
//! pool.start().await?;
//!
//! let stub = ApiStub::new(pool.clone(), None, CallTimeouts::default());
//! let session = stub.client_create(ClientType::Container, "0.1.0").await?;
//! stub.client_heartbeat(&session.client_id).await?;
//!
//! pool.close().await;
//! ```

pub mod client;
pub mod frame;
pub mod retry;
pub mod server;
pub mod status;
pub mod stub;

pub mod api_proto {
    include!(concat!(env!("OUT_DIR"), "/polyester.api.rs"));
}

pub use client::{ChannelPool, ClientError, Method, PoolConfig};
pub use frame::{Frame, FrameError, FrameKind};
pub use retry::{RetryPolicy, retry_transient};
pub use server::{
    ApiHandler, ApiServer, ApiServerConfig, ConnectionHandler, ServerError, StreamHandler,
};
pub use status::{RpcError, RpcStatus};
pub use stub::{ApiStub, CallTimeouts};
