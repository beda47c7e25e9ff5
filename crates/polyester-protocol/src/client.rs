// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC channel pool used by the container runtime to reach the server.
//!
//! The pool keeps a fixed number of connection slots. Each call picks a slot
//! round-robin, lazily (re)establishes its connection, opens a fresh
//! bidirectional stream and exchanges one request frame for one response
//! frame. A call that finds its connection dead is replayed once on a new
//! connection before any retry policy gets involved.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::api_proto::{RpcRequest, RpcResponse, rpc_request, rpc_response};
use crate::frame::{Frame, FrameError, FrameKind, read_frame, write_frame};
use crate::retry::{RetryPolicy, retry_transient};
use crate::status::RpcError;

/// Transport-level failures. Callers normally see these folded into
/// [`RpcError`] by [`ChannelPool::call`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("no connection established")]
    NotConnected,

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("channel pool closed")]
    Closed,
}

/// The five control-plane operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    ClientCreate,
    ClientHeartbeat,
    FunctionGetInputs,
    FunctionPutOutputs,
    TaskResult,
}

impl Method {
    pub fn name(self) -> &'static str {
        match self {
            Method::ClientCreate => "ClientCreate",
            Method::ClientHeartbeat => "ClientHeartbeat",
            Method::FunctionGetInputs => "FunctionGetInputs",
            Method::FunctionPutOutputs => "FunctionPutOutputs",
            Method::TaskResult => "TaskResult",
        }
    }

    pub fn of(request: &rpc_request::Request) -> Self {
        match request {
            rpc_request::Request::ClientCreate(_) => Method::ClientCreate,
            rpc_request::Request::ClientHeartbeat(_) => Method::ClientHeartbeat,
            rpc_request::Request::FunctionGetInputs(_) => Method::FunctionGetInputs,
            rpc_request::Request::FunctionPutOutputs(_) => Method::FunctionPutOutputs,
            rpc_request::Request::TaskResult(_) => Method::TaskResult,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub server_addr: SocketAddr,
    /// Server name for TLS verification
    pub server_name: String,
    /// Skip certificate verification (development only)
    pub dangerous_skip_cert_verification: bool,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Number of connection slots
    pub pool_size: usize,
    /// Applied to calls made with `retryable = true`
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 8001)),
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 600_000,
            connect_timeout_ms: 10_000,
            pool_size: 2,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ChannelPool {
    endpoint: Endpoint,
    slots: Vec<Mutex<Option<Connection>>>,
    next: AtomicUsize,
    closed: AtomicBool,
    config: PoolConfig,
}

impl ChannelPool {
    /// Create a pool. No connection is made until [`start`](Self::start) or
    /// the first call. Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        endpoint.set_default_client_config(Self::build_client_config(&config)?);

        let slots = (0..config.pool_size.max(1))
            .map(|_| Mutex::new(None))
            .collect();

        Ok(Self {
            endpoint,
            slots,
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Pool for a local development server with a self-signed certificate.
    pub fn localhost(server_addr: SocketAddr) -> Result<Self, ClientError> {
        Self::new(PoolConfig {
            server_addr,
            dangerous_skip_cert_verification: true,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn build_client_config(config: &PoolConfig) -> Result<ClientConfig, ClientError> {
        let crypto = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        let idle = Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| ClientError::Tls("idle timeout out of range".to_string()))?;
        transport.max_idle_timeout(Some(idle));

        let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        let mut client_config = ClientConfig::new(Arc::new(quic));
        client_config.transport_config(Arc::new(transport));
        Ok(client_config)
    }

    /// Establish every slot's connection up front.
    #[instrument(skip(self), fields(addr = %self.config.server_addr, size = self.slots.len()))]
    pub async fn start(&self) -> Result<(), ClientError> {
        for idx in 0..self.slots.len() {
            self.connection_at(idx).await?;
        }
        info!("Channel pool connected");
        Ok(())
    }

    async fn connect(&self) -> Result<Connection, ClientError> {
        let connecting = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)
            .map_err(|e| match e {
                quinn::ConnectError::InvalidServerName(name) => ClientError::InvalidServerName(name),
                other => ClientError::Connect(other),
            })?;

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;
        debug!(addr = %self.config.server_addr, "Connected");
        Ok(connection)
    }

    async fn connection_at(&self, idx: usize) -> Result<Connection, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let mut slot = self.slots[idx].lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            debug!(slot = idx, "Replacing dead connection");
        }
        let conn = self.connect().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn invalidate(&self, idx: usize, dead: &Connection) {
        let mut slot = self.slots[idx].lock().await;
        if slot
            .as_ref()
            .is_some_and(|conn| conn.stable_id() == dead.stable_id())
        {
            *slot = None;
        }
    }

    async fn exchange(conn: &Connection, request: &RpcRequest) -> Result<RpcResponse, ClientError> {
        let (mut send, mut recv) = conn.open_bi().await?;
        write_frame(&mut send, &Frame::request(request)?).await?;
        send.finish()?;
        let frame = read_frame(&mut recv).await?;
        Ok(frame.decode_as(FrameKind::Response)?)
    }

    async fn round_trip(&self, request: &RpcRequest) -> Result<RpcResponse, ClientError> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let conn = self.connection_at(idx).await?;
        match Self::exchange(&conn, request).await {
            Err(err) if conn.close_reason().is_some() => {
                debug!(slot = idx, error = %err, "Connection lost mid-call, reconnecting");
                self.invalidate(idx, &conn).await;
                let conn = self.connection_at(idx).await?;
                Self::exchange(&conn, request).await
            }
            other => other,
        }
    }

    async fn attempt(&self, request: &RpcRequest, timeout: Duration) -> Result<RpcResponse, RpcError> {
        let response = tokio::time::timeout(timeout, self.round_trip(request))
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_millis() as u64))??;
        match response.response {
            Some(rpc_response::Response::Error(err)) => Err(err.into()),
            _ => Ok(response),
        }
    }

    /// Issue one call. With `retryable` set, transient failures are retried
    /// according to the pool's [`RetryPolicy`].
    #[instrument(skip(self, request), fields(method = method.name()))]
    pub async fn call(
        &self,
        method: Method,
        request: &RpcRequest,
        timeout: Duration,
        retryable: bool,
    ) -> Result<RpcResponse, RpcError> {
        let policy = if retryable {
            self.config.retry.clone()
        } else {
            RetryPolicy::none()
        };
        retry_transient(&policy, method.name(), move || {
            self.attempt(request, timeout)
        })
        .await
    }

    /// Close every connection. Calls made afterwards fail with
    /// [`ClientError::Closed`]. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.slots {
            if let Some(conn) = slot.lock().await.take() {
                conn.close(0u32.into(), b"pool closing");
            }
        }
        info!("Channel pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether any slot currently holds a live connection.
    pub async fn is_connected(&self) -> bool {
        for slot in &self.slots {
            if slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|conn| conn.close_reason().is_none())
            {
                return true;
            }
        }
        false
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            match slot.try_lock() {
                Ok(mut guard) => {
                    if let Some(conn) = guard.take() {
                        conn.close(0u32.into(), b"pool dropped");
                    }
                }
                Err(_) => warn!("Connection slot busy while dropping pool"),
            }
        }
    }
}

/// Certificate verifier that accepts anything (development only).
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_proto::{ClientHeartbeatRequest, FunctionGetInputsRequest};

    fn unreachable_config(port: u16) -> PoolConfig {
        PoolConfig {
            server_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: 100,
            retry: RetryPolicy::none(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.server_addr, SocketAddr::from(([127, 0, 0, 1], 8001)));
        assert_eq!(config.server_name, "localhost");
        assert_eq!(config.pool_size, 2);
        assert!(!config.dangerous_skip_cert_verification);
    }

    #[test]
    fn test_method_of_request() {
        let req = rpc_request::Request::ClientHeartbeat(ClientHeartbeatRequest::default());
        assert_eq!(Method::of(&req), Method::ClientHeartbeat);
        let req = rpc_request::Request::FunctionGetInputs(FunctionGetInputsRequest::default());
        assert_eq!(Method::of(&req).name(), "FunctionGetInputs");
    }

    #[test]
    fn test_build_client_config_variants() {
        assert!(ChannelPool::build_client_config(&PoolConfig::default()).is_ok());
        let config = PoolConfig {
            dangerous_skip_cert_verification: true,
            keep_alive_interval_ms: 0,
            ..Default::default()
        };
        assert!(ChannelPool::build_client_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_zero_pool_size_still_has_one_slot() {
        let pool = ChannelPool::new(PoolConfig {
            pool_size: 0,
            ..unreachable_config(59990)
        })
        .unwrap();
        assert_eq!(pool.size(), 1);
        assert!(!pool.is_connected().await);
    }

    #[tokio::test]
    async fn test_start_against_unreachable_server_fails() {
        let pool = ChannelPool::new(unreachable_config(59991)).unwrap();
        let err = pool.start().await.unwrap_err();
        assert!(
            matches!(err, ClientError::Timeout(_) | ClientError::Connection(_)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_call_after_close_is_cancelled() {
        let pool = ChannelPool::new(unreachable_config(59992)).unwrap();
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());

        let request = RpcRequest {
            credentials: None,
            request: Some(rpc_request::Request::ClientHeartbeat(
                ClientHeartbeatRequest::default(),
            )),
        };
        let err = pool
            .call(
                Method::ClientHeartbeat,
                &request,
                Duration::from_millis(200),
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, crate::status::RpcStatus::Cancelled);
    }
}
