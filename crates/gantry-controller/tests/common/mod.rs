// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for controller integration tests.
//!
//! Runs the full server (demux, native framing, HTTP wrapper, event fabric)
//! on an ephemeral port over the in-memory store. Tests drive the API through
//! the protocol client and play the role of the external workers by mutating
//! the store directly.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use gantry_controller::handlers::HandlerState;
use gantry_controller::store::{
    AppRecord, ControllerStore, MemoryStore, NewRelease, ReleaseRecord,
};
use gantry_controller::{http, mux};
use gantry_protocol::client::{ControllerClient, ResponseStream};
use gantry_protocol::controller::rpc_response::Response;
use gantry_protocol::controller::RpcResponse;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Test context managing store, server and client.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub state: Arc<HandlerState>,
    pub client: ControllerClient,
    pub addr: SocketAddr,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestContext {
    /// Create a context with the default scale timeout.
    pub async fn new() -> Self {
        Self::with_scale_timeout(Duration::from_secs(5)).await
    }

    /// Create a context with an explicit scale timeout (shrunk by the
    /// deadline tests).
    pub async fn with_scale_timeout(scale_timeout: Duration) -> Self {
        let store = Arc::new(MemoryStore::new(None));
        let dyn_store: Arc<dyn ControllerStore> = store.clone();
        let state = Arc::new(HandlerState::new(dyn_store, scale_timeout));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("no local addr");

        let router = http::router(state.clone());
        let server = tokio::spawn(mux::serve(listener, state.clone(), router));

        let client = ControllerClient::new(addr);

        Self {
            store,
            state,
            client,
            addr,
            server,
        }
    }

    pub async fn seed_app(&self, name: &str) -> AppRecord {
        self.store
            .create_app(name, HashMap::new())
            .await
            .expect("failed to seed app")
    }

    pub async fn seed_app_with_labels(&self, name: &str, labels: &[(&str, &str)]) -> AppRecord {
        let meta = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.store
            .create_app(name, meta)
            .await
            .expect("failed to seed app")
    }

    pub async fn seed_release(&self, app_id: &str, artifacts: &[&str]) -> ReleaseRecord {
        self.store
            .create_release(
                app_id,
                NewRelease {
                    artifacts: artifacts.iter().map(|a| a.to_string()).collect(),
                    ..Default::default()
                },
            )
            .await
            .expect("failed to seed release")
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Receive the next response or panic with a useful message.
pub async fn next_response(stream: &mut ResponseStream) -> Response {
    let response: RpcResponse = tokio::time::timeout(RECV_TIMEOUT, stream.next())
        .await
        .expect("timed out waiting for response")
        .expect("stream returned an error")
        .expect("stream closed early");
    response.response.expect("response envelope was empty")
}

/// Open a streaming call and return its first response. Streaming methods
/// always use stream framing on the wire, even when the request asks for a
/// single snapshot page.
pub async fn first_response(
    client: &ControllerClient,
    request: &gantry_protocol::controller::RpcRequest,
) -> Result<Response, gantry_protocol::ClientError> {
    let mut stream = client.open_stream(request).await?;
    let response = tokio::time::timeout(RECV_TIMEOUT, stream.next())
        .await
        .expect("timed out waiting for response")?;
    Ok(response
        .expect("stream closed without a response")
        .response
        .expect("response envelope was empty"))
}

/// Assert that no further response arrives within the window.
pub async fn assert_quiet(stream: &mut ResponseStream, window: Duration) {
    match tokio::time::timeout(window, stream.next()).await {
        Err(_) => {}
        Ok(result) => panic!("expected quiet stream, got {result:?}"),
    }
}
