// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session lifecycle tests: start, heartbeat, stop.

mod common;

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use polyester_runtime::{Client, Identity, RuntimeConfig, RuntimeError, blocking};

use common::{Servicer, config, start_server};

#[tokio::test]
async fn test_start_issues_client_id_and_heartbeats() {
    let servicer = Arc::new(Servicer::default());
    let (server, addr) = start_server(servicer.clone()).await;

    let client = Client::new(config(addr).with_heartbeat_interval_ms(50));
    client.start().await.unwrap();
    assert_eq!(client.client_id(), Some("cl-1"));
    assert!(client.is_live());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(servicer.heartbeats.load(Ordering::SeqCst) >= 3);

    client.stop().await;
    assert!(!client.is_live());
    assert_eq!(client.active_tasks(), 0);

    let after_stop = servicer.heartbeats.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(servicer.heartbeats.load(Ordering::SeqCst), after_stop);
    server.close();
}

#[tokio::test]
async fn test_double_stop_is_safe() {
    let servicer = Arc::new(Servicer::default());
    let (server, addr) = start_server(servicer).await;

    let client = Client::new(config(addr));
    client.start().await.unwrap();
    client.stop().await;
    client.stop().await;
    assert_eq!(client.active_tasks(), 0);
    server.close();
}

#[tokio::test]
async fn test_concurrent_stops_both_return() {
    let servicer = Arc::new(Servicer::default());
    let (server, addr) = start_server(servicer).await;

    let client = Arc::new(Client::new(config(addr).with_heartbeat_interval_ms(20)));
    client.start().await.unwrap();
    let (a, b) = (client.clone(), client.clone());
    tokio::join!(a.stop(), b.stop());
    assert_eq!(client.active_tasks(), 0);
    server.close();
}

#[tokio::test]
async fn test_rejected_identity_is_auth_error() {
    let servicer = Arc::new(Servicer {
        reject_auth: true,
        ..Default::default()
    });
    let (server, addr) = start_server(servicer.clone()).await;

    let client = Client::new(config(addr).with_heartbeat_interval_ms(20));
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Auth(_)), "{err:?}");

    // Stopping after a failed start is a no-op and nothing keeps running.
    client.stop().await;
    assert_eq!(client.active_tasks(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(servicer.heartbeats.load(Ordering::SeqCst), 0);
    server.close();
}

#[tokio::test]
async fn test_anonymous_identity_is_rejected_by_servicer() {
    let servicer = Arc::new(Servicer::default());
    let (server, addr) = start_server(servicer).await;

    let client = Client::new(config(addr).with_identity(Identity::Anonymous));
    assert!(matches!(client.start().await, Err(RuntimeError::Auth(_))));
    server.close();
}

#[tokio::test]
async fn test_empty_client_id_is_invalid() {
    let servicer = Arc::new(Servicer {
        empty_client_id: true,
        ..Default::default()
    });
    let (server, addr) = start_server(servicer).await;

    let client = Client::new(config(addr));
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Invalid(_)), "{err:?}");
    client.stop().await;
    assert_eq!(client.active_tasks(), 0);
    server.close();
}

#[tokio::test]
async fn test_unreachable_server_is_connection_error() {
    // Reserve a port, then free it so nothing answers there.
    let addr: SocketAddr = {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    let client = Client::new(
        RuntimeConfig::localhost(addr)
            .with_identity(Identity::Task {
                id: "ta-1".into(),
                secret: "ts-1".into(),
            })
            .with_connect_timeout_ms(300),
    );
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Connection(_)), "{err:?}");
    client.stop().await;
}

#[tokio::test]
async fn test_scoped_stops_session_on_error() {
    let servicer = Arc::new(Servicer::default());
    let (server, addr) = start_server(servicer).await;

    let kept: Arc<Mutex<Option<Arc<Client>>>> = Arc::default();
    let slot = kept.clone();
    let result = Client::scoped(config(addr).with_heartbeat_interval_ms(20), |client| {
        *slot.lock().unwrap() = Some(client.clone());
        async move {
            assert!(client.is_live());
            Err::<(), _>(RuntimeError::Invalid("user code gave up".to_string()))
        }
    })
    .await;

    assert!(matches!(result, Err(RuntimeError::Invalid(_))));
    let client = kept.lock().unwrap().take().unwrap();
    assert!(!client.is_live());
    assert_eq!(client.active_tasks(), 0);
    server.close();
}

#[test]
fn test_blocking_session_lifecycle() {
    let server_runtime = tokio::runtime::Runtime::new().unwrap();
    let servicer = Arc::new(Servicer::default());
    let (server, addr) = server_runtime.block_on(start_server(servicer.clone()));

    let client = blocking::Client::new(config(addr).with_heartbeat_interval_ms(50)).unwrap();
    client.start().unwrap();
    assert_eq!(client.client_id(), Some("cl-1"));

    // The heartbeat keeps running between blocking calls.
    std::thread::sleep(Duration::from_millis(300));
    assert!(servicer.heartbeats.load(Ordering::SeqCst) >= 2);

    client.stop();
    client.stop();
    assert_eq!(client.session().active_tasks(), 0);
    server_runtime.block_on(async { server.close() });
}
