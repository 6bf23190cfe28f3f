// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Formation handler: `StreamFormations`.
//!
//! Formations are derived state. Rather than folding event payloads into a
//! local copy, every relevant event triggers a re-read of the formation from
//! the store; the store stays the single source of truth and out-of-order
//! events cannot corrupt the view.

use std::collections::HashMap;

use gantry_protocol::controller as pb;
use gantry_protocol::controller::rpc_response::Response;
use tracing::{debug, warn};

use crate::convert;
use crate::error::Result;
use crate::events::subscribe_events;
use crate::names::{parse_app_ids_from_name_filters, scale_request_name};
use crate::store::{EventType, ScaleState, StoreError};

use super::{HandlerState, ResponseSink};

/// Stream the tracked formations, re-deriving them from the store on every
/// scale-request or app-release event.
pub async fn stream_formations(
    state: &HandlerState,
    req: pb::StreamFormationsRequest,
    sink: &ResponseSink,
) -> Result<()> {
    let app_ids = parse_app_ids_from_name_filters(&req.name_filters);

    // Current release per app, preloaded so the first refresh works on a
    // real (app, release) pair.
    let mut release_ids: HashMap<String, String> = HashMap::new();
    for app_id in &app_ids {
        let release = state.store.get_app_release(app_id).await?;
        release_ids.insert(app_id.clone(), release.id);
    }

    let mut sub = subscribe_events(
        &state.hub,
        &app_ids,
        &[EventType::ScaleRequest, EventType::AppRelease],
        "",
    )
    .await?;

    let mut formations: HashMap<String, pb::Formation> = HashMap::new();
    for (app_id, release_id) in release_ids.clone() {
        refresh_formation(state, &mut formations, &app_id, &release_id).await?;
    }
    send_formations(&formations, sink).await?;

    while let Some(event) = sub.recv().await {
        let app_id = event.app_id.clone();
        if event.object_type == EventType::AppRelease {
            release_ids.insert(app_id.clone(), event.object_id.clone());
        }
        let release_id = match release_ids.get(&app_id) {
            Some(release_id) => release_id.clone(),
            None => match state.store.get_app_release(&app_id).await {
                Ok(release) => {
                    release_ids.insert(app_id.clone(), release.id.clone());
                    release.id
                }
                Err(e) => {
                    warn!(app = %app_id, error = %e, "skipping event for app without a current release");
                    continue;
                }
            },
        };
        refresh_formation(state, &mut formations, &app_id, &release_id).await?;
        send_formations(&formations, sink).await?;
    }

    sub.finish()
}

/// Re-read one formation and the state of its latest scale request.
async fn refresh_formation(
    state: &HandlerState,
    formations: &mut HashMap<String, pb::Formation>,
    app_id: &str,
    release_id: &str,
) -> Result<()> {
    let record = match state.store.get_formation(app_id, release_id).await {
        Ok(record) => record,
        Err(StoreError::NotFound(_)) => {
            // The pair has never been scaled; nothing to show yet.
            debug!(app = %app_id, release = %release_id, "no formation yet");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let latest = state.store.latest_scale_request(app_id, release_id).await?;
    let mut scale_state = pb::ScaleRequestState::ScaleComplete;
    let scale_request = match &latest {
        Some(sr) => {
            match sr.state {
                ScaleState::Pending => scale_state = pb::ScaleRequestState::ScalePending,
                ScaleState::Cancelled => scale_state = pb::ScaleRequestState::ScaleCancelled,
                ScaleState::Complete => {}
            }
            scale_request_name(app_id, release_id, &sr.id)
        }
        None => String::new(),
    };

    formations.insert(
        app_id.to_string(),
        convert::formation(&record, scale_state, scale_request),
    );
    Ok(())
}

/// Emit one response listing every tracked formation. Nothing is sent while
/// the map is still empty.
async fn send_formations(
    formations: &HashMap<String, pb::Formation>,
    sink: &ResponseSink,
) -> Result<()> {
    if formations.is_empty() {
        return Ok(());
    }
    sink.send(Response::Formations(pb::StreamFormationsResponse {
        formations: formations.values().cloned().collect(),
    }))
    .await
}
