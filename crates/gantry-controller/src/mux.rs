// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection demultiplexer.
//!
//! One TCP listener serves both transports. Each accepted connection is
//! classified by its first bytes: the native framing preamble routes to the
//! framed RPC path, anything else is served as HTTP through the wrapper
//! router. Bytes consumed during classification are replayed to the HTTP
//! parser through [`PrefixedStream`].

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Context as _;
use axum::Router;
use bytes::{Buf, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;
use tracing::{debug, info};

use gantry_protocol::controller::RpcRequest;
use gantry_protocol::frame::{Frame, FrameError, FramedStream, MessageType, PREAMBLE};

use crate::error::ControllerError;
use crate::handlers::{HandlerState, spawn_rpc};

/// Accept loop. Runs until the listener fails or the task is aborted; both
/// transports stop with it.
pub async fn serve(
    listener: TcpListener,
    state: Arc<HandlerState>,
    router: Router,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "controller listening");
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let state = state.clone();
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, state, router).await {
                debug!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<HandlerState>,
    router: Router,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;

    // Classify by the first bytes. Reading stops as soon as the prefix
    // diverges from the preamble, so an HTTP request is never blocked on.
    let mut prefix = [0u8; PREAMBLE.len()];
    let mut read = 0;
    while read < prefix.len() {
        let n = stream.read(&mut prefix[read..]).await?;
        if n == 0 {
            // Peer closed before sending a recognizable request.
            return Ok(());
        }
        read += n;
        if prefix[..read] != PREAMBLE[..read] {
            break;
        }
    }

    if prefix[..read] == PREAMBLE[..] {
        debug!(%peer, "native rpc connection");
        serve_native(stream, state).await
    } else {
        debug!(%peer, "http connection");
        serve_http(
            PrefixedStream::new(Bytes::copy_from_slice(&prefix[..read]), stream),
            router,
        )
        .await
    }
}

/// One native connection carries one RPC: a request frame in, response
/// frames out.
async fn serve_native(stream: TcpStream, state: Arc<HandlerState>) -> anyhow::Result<()> {
    let mut framed = FramedStream::new(stream);

    let frame = match framed.read_frame().await {
        Ok(frame) => frame,
        Err(FrameError::ConnectionClosed) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if frame.message_type != MessageType::Request {
        let err = ControllerError::Validation("expected a request frame".to_string());
        framed.write_frame(&Frame::error(&err.to_rpc_error())?).await?;
        return Ok(());
    }
    let request: RpcRequest = match frame.decode() {
        Ok(request) => request,
        Err(e) => {
            let err = ControllerError::Validation(format!("malformed request: {e}"));
            framed.write_frame(&Frame::error(&err.to_rpc_error())?).await?;
            return Ok(());
        }
    };

    let mut frames = spawn_rpc(state, request);
    while let Some(chunk) = frames.recv().await {
        framed.write_encoded(&chunk).await?;
    }
    Ok(())
}

/// Serve the already-accepted connection as HTTP/1.1 through the wrapper
/// router.
async fn serve_http(stream: PrefixedStream, router: Router) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |request| {
        let router = router.clone();
        async move { router.oneshot(request).await }
    });
    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(anyhow::Error::from)
}

/// A stream that replays already-consumed bytes before reading from the
/// underlying socket. Writes pass straight through.
struct PrefixedStream {
    prefix: Bytes,
    inner: TcpStream,
}

impl PrefixedStream {
    fn new(prefix: Bytes, inner: TcpStream) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
