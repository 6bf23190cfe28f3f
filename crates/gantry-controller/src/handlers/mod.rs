// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC request handlers.
//!
//! [`dispatch`] routes a decoded [`RpcRequest`] to the per-entity handler
//! modules. Handlers emit responses through a [`ResponseSink`]; the
//! transport-independent [`spawn_rpc`] pump turns those responses into
//! encoded wire frames consumed identically by the native TCP server and the
//! HTTP wrapper.

pub mod apps;
pub mod deployments;
pub mod formations;
pub mod releases;
pub mod scales;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gantry_protocol::controller::rpc_request::Request;
use gantry_protocol::controller::rpc_response::Response;
use gantry_protocol::controller::{RpcRequest, RpcResponse};
use gantry_protocol::frame::Frame;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::ControllerError;
use crate::events::EventHub;
use crate::store::ControllerStore;

/// Shared state injected into every handler.
pub struct HandlerState {
    pub store: Arc<dyn ControllerStore>,
    pub hub: EventHub,
    /// Deadline for the synchronous scale RPC.
    pub scale_timeout: Duration,
}

impl HandlerState {
    pub fn new(store: Arc<dyn ControllerStore>, scale_timeout: Duration) -> Self {
        let hub = EventHub::new(store.clone());
        Self {
            store,
            hub,
            scale_timeout,
        }
    }
}

/// Outbound response channel handed to handlers.
///
/// A send failure means the client has gone away; handlers treat it as
/// cancellation and unwind, releasing their subscriptions.
#[derive(Clone)]
pub struct ResponseSink {
    tx: mpsc::Sender<RpcResponse>,
}

impl ResponseSink {
    pub async fn send(&self, response: Response) -> Result<(), ControllerError> {
        self.tx
            .send(RpcResponse {
                response: Some(response),
            })
            .await
            .map_err(|_| ControllerError::Cancelled)
    }
}

/// Whether the method produces a response stream rather than a single
/// response.
pub fn is_streaming(request: &RpcRequest) -> bool {
    matches!(
        request.request,
        Some(Request::StreamApps(_))
            | Some(Request::StreamReleases(_))
            | Some(Request::StreamScales(_))
            | Some(Request::StreamFormations(_))
            | Some(Request::StreamDeployments(_))
            | Some(Request::CreateDeployment(_))
    )
}

/// Route a request to its handler.
pub async fn dispatch(
    state: Arc<HandlerState>,
    request: RpcRequest,
    sink: ResponseSink,
) -> Result<(), ControllerError> {
    let request = request
        .request
        .ok_or_else(|| ControllerError::Validation("request contained no method".to_string()))?;
    debug!(method = method_name(&request), "rpc started");

    match request {
        Request::StreamApps(req) => apps::stream_apps(&state, req, &sink).await,
        Request::UpdateApp(req) => {
            let app = apps::update_app(&state, req).await?;
            sink.send(Response::App(app)).await
        }
        Request::StreamReleases(req) => releases::stream_releases(&state, req, &sink).await,
        Request::CreateRelease(req) => {
            let release = releases::create_release(&state, req).await?;
            sink.send(Response::Release(release)).await
        }
        Request::StreamScales(req) => scales::stream_scales(&state, req, &sink).await,
        Request::CreateScale(req) => {
            let scale_request = scales::create_scale(&state, req).await?;
            sink.send(Response::ScaleRequest(scale_request)).await
        }
        Request::StreamFormations(req) => formations::stream_formations(&state, req, &sink).await,
        Request::StreamDeployments(req) => {
            deployments::stream_deployments(&state, req, &sink).await
        }
        Request::CreateDeployment(req) => {
            deployments::create_deployment(&state, req, &sink).await
        }
    }
}

fn method_name(request: &Request) -> &'static str {
    match request {
        Request::StreamApps(_) => "StreamApps",
        Request::UpdateApp(_) => "UpdateApp",
        Request::StreamReleases(_) => "StreamReleases",
        Request::CreateRelease(_) => "CreateRelease",
        Request::StreamScales(_) => "StreamScales",
        Request::CreateScale(_) => "CreateScale",
        Request::StreamFormations(_) => "StreamFormations",
        Request::StreamDeployments(_) => "StreamDeployments",
        Request::CreateDeployment(_) => "CreateDeployment",
    }
}

/// Run one RPC and return a channel of encoded wire frames.
///
/// The native server writes each chunk straight to the socket; the HTTP
/// wrapper streams them as the response body. Dropping the receiver aborts
/// the handler, which releases its event subscriptions on the way out.
pub fn spawn_rpc(state: Arc<HandlerState>, request: RpcRequest) -> mpsc::Receiver<Bytes> {
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(16);

    tokio::spawn(async move {
        let streaming = is_streaming(&request);
        let (tx, mut rx) = mpsc::channel(16);
        let sink = ResponseSink { tx };
        let handler = tokio::spawn(dispatch(state, request, sink));

        if streaming && out_tx.send(Frame::stream_start().encode()).await.is_err() {
            handler.abort();
            return;
        }

        while let Some(response) = rx.recv().await {
            let frame = if streaming {
                Frame::stream_data(&response)
            } else {
                Frame::response(&response)
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, "failed to encode response frame");
                    handler.abort();
                    return;
                }
            };
            if out_tx.send(frame.encode()).await.is_err() {
                // Client went away; tear the handler down.
                handler.abort();
                return;
            }
        }

        let result = match handler.await {
            Ok(result) => result,
            Err(join_err) => {
                if join_err.is_cancelled() {
                    return;
                }
                Err(ControllerError::Internal(format!(
                    "handler panicked: {join_err}"
                )))
            }
        };

        let closing = match result {
            Ok(()) if streaming => Some(Frame::stream_end()),
            Ok(()) => None,
            Err(e) => {
                debug!(error = %e, "rpc failed");
                match Frame::error(&e.to_rpc_error()) {
                    Ok(frame) => Some(frame),
                    Err(encode_err) => {
                        error!(error = %encode_err, "failed to encode error frame");
                        None
                    }
                }
            }
        };
        if let Some(frame) = closing {
            let _ = out_tx.send(frame.encode()).await;
        }
    });

    out_rx
}
