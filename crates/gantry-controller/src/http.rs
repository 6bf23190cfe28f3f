// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP wrapper for browser clients.
//!
//! Bridges ordinary HTTP requests onto the native RPC dispatch: the request
//! body is a protobuf `RpcRequest`, and the response body carries exactly the
//! frames the native transport would write, so a browser client shares one
//! decoder with native clients. CORS allows any origin, with credentials.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use http::{HeaderName, Method, StatusCode, header};
use prost::Message;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use gantry_protocol::controller::RpcRequest;

use crate::handlers::{HandlerState, spawn_rpc};

/// Content type of RPC bodies on the HTTP transport.
pub const RPC_CONTENT_TYPE: &str = "application/x-gantry-rpc";

/// Header browser clients set on RPC requests; allowed through CORS.
pub const RPC_HEADER: &str = "x-gantry-rpc";

/// Build the HTTP router for the wrapper.
pub fn router(state: Arc<HandlerState>) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        tracing::info_span!(
            "http.request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %Uuid::new_v4(),
        )
    });

    Router::new()
        .route("/rpc", post(handle_rpc))
        .layer(cors_layer())
        .layer(trace_layer)
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        // Every origin is allowed; reflecting the request origin keeps the
        // wildcard compatible with credentialed requests.
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::IF_MATCH,
            header::IF_NONE_MATCH,
            HeaderName::from_static(RPC_HEADER),
        ])
        .expose_headers([header::ETAG])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}

async fn handle_rpc(State(state): State<Arc<HandlerState>>, body: Bytes) -> Response {
    let request = match RpcRequest::decode(body.as_ref()) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("malformed rpc request: {e}"),
            )
                .into_response();
        }
    };

    let frames = spawn_rpc(state, request);
    (
        [(header::CONTENT_TYPE, RPC_CONTENT_TYPE)],
        Body::from_stream(FrameStream(frames)),
    )
        .into_response()
}

/// Adapts the RPC frame channel into a response body stream.
struct FrameStream(mpsc::Receiver<Bytes>);

impl futures_util::Stream for FrameStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}
