//! Test utilities and common setup.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use http_body_util::BodyExt;
use ssehub::api::{AppState, create_router};
use ssehub::config::ServerConfig;
use ssehub::{Hub, HubConfig};
use tokio::net::TcpListener;

/// Hub settings small enough for tests to exercise every path quickly.
pub fn test_config() -> HubConfig {
    HubConfig {
        workers: 4,
        pool_queue_size: 128,
        retry_timeout_ms: 200,
        close_wait_ms: 2_000,
        close_poll_ms: 20,
        ..HubConfig::default()
    }
}

pub fn test_server_config() -> ServerConfig {
    ServerConfig {
        extra_headers: HashMap::from([("X-Test-Header".to_string(), "present".to_string())]),
        ..ServerConfig::default()
    }
}

/// Create a router backed by `hub`.
pub fn test_app(hub: &Hub) -> Router {
    create_router(AppState::new(hub.clone(), test_server_config()))
}

/// Serve `hub` over a real socket on an ephemeral port.
pub async fn spawn_server(hub: &Hub) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = test_app(hub);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing is listening on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Read the next data frame of a streaming body as text.
pub async fn next_record(body: &mut Body) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("timed out waiting for a record")
            .expect("body ended")
            .expect("body error");
        if let Ok(data) = frame.into_data() {
            return String::from_utf8(data.to_vec()).unwrap();
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
