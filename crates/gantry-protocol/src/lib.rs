// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry Protocol - wire protocol for the controller API.
//!
//! This crate provides the protocol spoken between clients and the gantry
//! controller:
//!
//! ```text
//! +-----------------------------------------------------------+
//! |                     gantry-protocol                       |
//! +-----------------------------------------------------------+
//! |  RPC layer: unary + server-streaming over framed messages |
//! +-----------------------------------------------------------+
//! |  Serialization: protobuf (prost)                          |
//! +-----------------------------------------------------------+
//! |  Transport: TCP (native framing) or HTTP (browser bridge) |
//! +-----------------------------------------------------------+
//! ```
//!
//! The controller accepts both transports on a single port. Native
//! connections announce themselves with the [`frame::PREAMBLE`]; everything
//! else is treated as HTTP and handled by the controller's HTTP wrapper,
//! which carries the exact same frames in request/response bodies.
//!
//! # Usage
//!
//! ```ignore
//! use gantry_protocol::{ControllerClient, controller};
//! use gantry_protocol::controller::rpc_request::Request;
//!
//! let client = ControllerClient::new("127.0.0.1:3000".parse()?);
//!
//! // Unary call
//! let response = client
//!     .unary(&controller::RpcRequest {
//!         request: Some(Request::CreateScale(controller::CreateScaleRequest {
//!             parent: "apps/app1/releases/r1".to_string(),
//!             ..Default::default()
//!         })),
//!     })
//!     .await?;
//!
//! // Server-streaming call
//! let mut stream = client
//!     .open_stream(&controller::RpcRequest {
//!         request: Some(Request::StreamApps(Default::default())),
//!     })
//!     .await?;
//! while let Some(response) = stream.next().await? {
//!     // ...
//! }
//! ```

pub mod client;
pub mod filters;
pub mod frame;

// Generated protobuf types for the controller protocol
pub mod controller {
    include!(concat!(env!("OUT_DIR"), "/gantry.controller.rs"));
}

pub use client::{ClientError, ControllerClient, ControllerClientConfig, ResponseStream};
pub use filters::{match_label_filters, ReleaseTypeMatcher};
pub use frame::{Frame, FrameError, FramedStream, MessageType, PREAMBLE};
