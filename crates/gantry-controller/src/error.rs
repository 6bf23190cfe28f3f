// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the controller.

use gantry_protocol::controller::{RpcError, StatusCode};
use gantry_protocol::frame::FrameError;
use thiserror::Error;

use crate::names::MalformedPageToken;
use crate::store::StoreError;

/// Controller errors, mapped onto wire status codes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    /// Malformed request (bad page token, bad resource name).
    #[error("{0}")]
    Validation(String),

    /// The referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The operation cannot proceed in the current state.
    #[error("{0}")]
    Precondition(String),

    /// A built-in deadline elapsed.
    #[error("{0}")]
    DeadlineExceeded(String),

    /// The client went away.
    #[error("request cancelled")]
    Cancelled,

    /// Store failure or other internal fault.
    #[error("{0}")]
    Internal(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Wire framing failed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl ControllerError {
    /// The wire status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControllerError::Validation(_) => StatusCode::StatusInvalidArgument,
            ControllerError::NotFound(_) => StatusCode::StatusNotFound,
            ControllerError::Precondition(_) => StatusCode::StatusFailedPrecondition,
            ControllerError::DeadlineExceeded(_) => StatusCode::StatusDeadlineExceeded,
            ControllerError::Cancelled => StatusCode::StatusCancelled,
            ControllerError::Store(StoreError::NotFound(_)) => StatusCode::StatusNotFound,
            ControllerError::Internal(_)
            | ControllerError::Store(_)
            | ControllerError::Frame(_) => StatusCode::StatusInternal,
        }
    }

    /// Build the wire error payload.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.status_code() as i32,
            message: self.to_string(),
        }
    }
}

impl From<MalformedPageToken> for ControllerError {
    fn from(err: MalformedPageToken) -> Self {
        ControllerError::Validation(err.to_string())
    }
}

/// Result type using [`ControllerError`].
pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            ControllerError::Validation("bad".into()).status_code(),
            StatusCode::StatusInvalidArgument
        );
        assert_eq!(
            ControllerError::Precondition("scale request cancelled".into()).status_code(),
            StatusCode::StatusFailedPrecondition
        );
        assert_eq!(
            ControllerError::DeadlineExceeded("timed out".into()).status_code(),
            StatusCode::StatusDeadlineExceeded
        );
        assert_eq!(
            ControllerError::Store(StoreError::NotFound("app a1".into())).status_code(),
            StatusCode::StatusNotFound
        );
        assert_eq!(
            ControllerError::Store(StoreError::Feed("gone".into())).status_code(),
            StatusCode::StatusInternal
        );
        assert_eq!(
            ControllerError::Cancelled.status_code(),
            StatusCode::StatusCancelled
        );
    }
}
