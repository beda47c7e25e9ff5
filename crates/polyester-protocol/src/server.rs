// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server side of the control-plane API.
//!
//! Used by development servers and by integration tests that stand in for
//! the real control plane.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::api_proto::{Credentials, RpcRequest, RpcResponse, rpc_request, rpc_response};
use crate::client::Method;
use crate::frame::{Frame, FrameError, FrameKind, read_frame, write_frame};
use crate::status::{RpcError, RpcStatus};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("stream already finished")]
    Finished,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM)
    pub key_pem: Vec<u8>,
    /// Maximum concurrent bidirectional streams per connection
    pub max_bi_streams: u32,
    pub idle_timeout_ms: u64,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// UDP receive buffer size in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_bi_streams: 1_000,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 2 * 1024 * 1024,
        }
    }
}

impl ApiServerConfig {
    /// Defaults overridden by `POLYESTER_QUIC_MAX_BI_STREAMS`,
    /// `POLYESTER_QUIC_IDLE_TIMEOUT_MS`, `POLYESTER_QUIC_KEEP_ALIVE_MS` and
    /// `POLYESTER_QUIC_UDP_RECV_BUFFER`.
    pub fn from_env() -> Self {
        fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let default = Self::default();
        Self {
            max_bi_streams: env_or("POLYESTER_QUIC_MAX_BI_STREAMS", default.max_bi_streams),
            idle_timeout_ms: env_or("POLYESTER_QUIC_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "POLYESTER_QUIC_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
            udp_receive_buffer_size: env_or(
                "POLYESTER_QUIC_UDP_RECV_BUFFER",
                default.udp_receive_buffer_size,
            ),
            ..default
        }
    }
}

/// Server-side implementation of the five control-plane operations.
///
/// The handler sees the credentials sent with each call and returns either
/// the matching response variant or an [`RpcError`] that is relayed to the
/// caller with its status intact.
#[async_trait]
pub trait ApiHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        credentials: Option<Credentials>,
        request: rpc_request::Request,
    ) -> Result<rpc_response::Response, RpcError>;
}

pub struct ApiServer {
    endpoint: Endpoint,
    config: ApiServerConfig,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if config.udp_receive_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
        {
            warn!(
                size = config.udp_receive_buffer_size,
                error = %e,
                "Failed to set UDP receive buffer size"
            );
        }
        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(addr = %config.bind_addr, "API server bound");
        Ok(Self { endpoint, config })
    }

    /// Server with a freshly generated self-signed certificate for `localhost`.
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        Self::localhost_with_config(bind_addr, ApiServerConfig::from_env())
    }

    pub fn localhost_with_config(
        bind_addr: SocketAddr,
        mut config: ApiServerConfig,
    ) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        config.bind_addr = bind_addr;
        config.cert_pem = cert.cert.pem().into_bytes();
        config.key_pem = cert.key_pair.serialize_pem().into_bytes();
        Self::new(config)
    }

    pub fn config(&self) -> &ApiServerConfig {
        &self.config
    }

    fn build_server_config(config: &ApiServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {e}")))?;
        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let mut transport = TransportConfig::default();
        let idle = Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| ServerError::Tls("idle timeout out of range".to_string()))?;
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        Ok(server_config)
    }

    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Accept connections until the endpoint closes, handing each one to
    /// `handler` on its own task.
    #[instrument(skip(self, handler))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("API server running");
        while let Some(incoming) = self.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        debug!(remote = %connection.remote_address(), "Accepted connection");
                        handler(ConnectionHandler::new(connection)).await;
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                }
            });
        }
        Ok(())
    }

    /// Serve the control-plane API with `api` until the endpoint closes.
    pub async fn serve<A: ApiHandler>(&self, api: Arc<A>) -> Result<(), ServerError> {
        self.run(move |conn| {
            let api = api.clone();
            async move {
                conn.run(move |mut stream| {
                    let api = api.clone();
                    async move {
                        if let Err(e) = stream.serve_one(api.as_ref()).await {
                            debug!(error = %e, "Stream ended without a response");
                        }
                    }
                })
                .await;
            }
        })
        .await
    }
}

pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        Ok(self.connection.accept_bi().await?)
    }

    /// Accept streams until the connection closes, running `handler` for
    /// each one on its own task.
    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept_bi().await {
                Ok((send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler(StreamHandler::new(send, recv)).await;
                    });
                }
                Err(ServerError::Connection(
                    quinn::ConnectionError::ApplicationClosed(_)
                    | quinn::ConnectionError::LocallyClosed
                    | quinn::ConnectionError::TimedOut,
                )) => {
                    debug!("Connection closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Error accepting stream");
                    break;
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    pub fn close(&self, code: u32, reason: &[u8]) {
        self.connection.close(code.into(), reason);
    }
}

/// One bidirectional stream: one request in, one response out.
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    pub async fn read_request(&mut self) -> Result<RpcRequest, ServerError> {
        let frame = read_frame(&mut self.recv).await?;
        Ok(frame.decode_as(FrameKind::Request)?)
    }

    /// Write the response and finish the send half.
    pub async fn respond(&mut self, response: &RpcResponse) -> Result<(), ServerError> {
        write_frame(&mut self.send, &Frame::response(response)?).await?;
        self.send.finish().map_err(|_| ServerError::Finished)
    }

    pub async fn respond_error(&mut self, err: RpcError) -> Result<(), ServerError> {
        self.respond(&RpcResponse {
            response: Some(rpc_response::Response::Error(err.into())),
        })
        .await
    }

    /// Read one request, dispatch it to `api`, write back its answer.
    pub async fn serve_one<A: ApiHandler + ?Sized>(&mut self, api: &A) -> Result<(), ServerError> {
        let request = self.read_request().await?;
        let Some(body) = request.request else {
            return self
                .respond_error(RpcError::new(RpcStatus::InvalidArgument, "empty request"))
                .await;
        };
        let method = Method::of(&body);
        match api.handle(request.credentials, body).await {
            Ok(response) => {
                self.respond(&RpcResponse {
                    response: Some(response),
                })
                .await
            }
            Err(err) => {
                debug!(method = method.name(), error = %err, "Call rejected");
                self.respond_error(err).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 8001)));
        assert_eq!(config.max_bi_streams, 1_000);
        assert!(config.cert_pem.is_empty());
    }

    #[test]
    fn test_build_server_config_rejects_missing_key() {
        let config = ApiServerConfig::default();
        let err = ApiServer::build_server_config(&config).unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
    }

    #[tokio::test]
    async fn test_localhost_binds_ephemeral_port() {
        let server = ApiServer::localhost_with_config(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            ApiServerConfig::default(),
        )
        .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        server.close();
    }
}
