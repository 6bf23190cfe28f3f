// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native TCP client for the controller protocol.
//!
//! Each RPC call opens its own connection: the client writes the preamble and
//! a single `Request` frame, then reads either one `Response` frame (unary)
//! or a `StreamStart`/`StreamData`.../`StreamEnd` sequence (server-streaming).

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::controller::{RpcError, RpcRequest, RpcResponse};
use crate::frame::{Frame, FrameError, FramedStream, MessageType, write_preamble};

/// Errors that can occur in the controller client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("rpc error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    #[error("unexpected message type: {0:?}")]
    UnexpectedMessage(MessageType),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),
}

/// Configuration for the controller client
#[derive(Debug, Clone)]
pub struct ControllerClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ControllerClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:3000".parse().unwrap(),
            connect_timeout_ms: 10_000,
        }
    }
}

/// TCP client for the controller protocol
pub struct ControllerClient {
    config: ControllerClientConfig,
}

impl ControllerClient {
    /// Create a client for the given server address
    pub fn new(server_addr: SocketAddr) -> Self {
        Self::with_config(ControllerClientConfig {
            server_addr,
            ..Default::default()
        })
    }

    /// Create a client with explicit configuration
    pub fn with_config(config: ControllerClientConfig) -> Self {
        Self { config }
    }

    async fn open(&self) -> Result<FramedStream<TcpStream>, ClientError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(self.config.server_addr))
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;
        stream.set_nodelay(true)?;

        write_preamble(&mut stream).await?;
        debug!(addr = %self.config.server_addr, "controller connection opened");
        Ok(FramedStream::new(stream))
    }

    /// Perform a unary RPC call
    pub async fn unary(&self, request: &RpcRequest) -> Result<RpcResponse, ClientError> {
        let mut framed = self.open().await?;
        framed.write_frame(&Frame::request(request)?).await?;

        let frame = framed.read_frame().await?;
        match frame.message_type {
            MessageType::Response => Ok(frame.decode()?),
            MessageType::Error => Err(ClientError::Rpc(frame.decode()?)),
            other => Err(ClientError::UnexpectedMessage(other)),
        }
    }

    /// Open a server-streaming RPC call
    pub async fn open_stream(&self, request: &RpcRequest) -> Result<ResponseStream, ClientError> {
        let mut framed = self.open().await?;
        framed.write_frame(&Frame::request(request)?).await?;
        Ok(ResponseStream {
            framed,
            done: false,
        })
    }
}

/// Receiving half of a server-streaming RPC call.
pub struct ResponseStream {
    framed: FramedStream<TcpStream>,
    done: bool,
}

impl ResponseStream {
    /// Receive the next response, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Result<Option<RpcResponse>, ClientError> {
        if self.done {
            return Ok(None);
        }
        loop {
            let frame = match self.framed.read_frame().await {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => {
                    self.done = true;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            match frame.message_type {
                MessageType::StreamStart => continue,
                MessageType::StreamData => return Ok(Some(frame.decode()?)),
                // A unary response on a stream handle ends the call.
                MessageType::Response => {
                    self.done = true;
                    return Ok(Some(frame.decode()?));
                }
                MessageType::StreamEnd => {
                    self.done = true;
                    return Ok(None);
                }
                MessageType::Error => {
                    self.done = true;
                    return Err(ClientError::Rpc(frame.decode()?));
                }
                other => return Err(ClientError::UnexpectedMessage(other)),
            }
        }
    }
}
