// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scale handlers: `StreamScales` and the synchronous `CreateScale`.

use std::sync::Arc;

use gantry_protocol::controller as pb;
use gantry_protocol::controller::rpc_response::Response;
use tokio::sync::{RwLock, mpsc};
use tokio::time::{Instant, sleep};
use tracing::warn;

use crate::convert;
use crate::error::{ControllerError, Result};
use crate::events::subscribe_events;
use crate::names::{parse_app_ids_from_name_filters, parse_id_from_name};
use crate::store::{EventFilter, EventRecord, EventType, ScaleRequestRecord, ScaleState};

use super::{HandlerState, ResponseSink};

/// Live-tail responses are coalesced behind this debounce window so bursts of
/// scale events produce one response instead of many.
const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(10);

/// Always-streaming list of scale requests, newest first.
pub async fn stream_scales(
    state: &HandlerState,
    req: pb::StreamScalesRequest,
    sink: &ResponseSink,
) -> Result<()> {
    let app_ids = parse_app_ids_from_name_filters(&req.name_filters);

    // Subscribe before listing; the curr_id guard discards the overlap.
    let mut sub = subscribe_events(&state.hub, &app_ids, &[EventType::ScaleRequest], "").await?;

    let requests = Arc::new(RwLock::new(Vec::<pb::ScaleRequest>::new()));

    let filter = EventFilter {
        app_ids,
        object_types: vec![EventType::ScaleRequest],
        object_id: String::new(),
    };
    let events = state.store.list_events(&filter, None, 0).await?;
    let mut curr_id = 0;
    // Newest-first list, replayed oldest-first.
    for event in events.iter().rev() {
        curr_id = event.id;
        prepend(&requests, event).await;
    }
    send_requests(&requests, sink).await?;

    let (kick_tx, kick_rx) = mpsc::channel(1);
    tokio::spawn(debounce_sender(requests.clone(), sink.clone(), kick_rx));

    while let Some(event) = sub.recv().await {
        let _ = kick_tx.try_send(());
        if event.id <= curr_id {
            continue;
        }
        curr_id = event.id;
        prepend(&requests, &event).await;
    }

    sub.finish()
}

/// Send the current list; the read lock is held for the duration of the send.
async fn send_requests(
    requests: &RwLock<Vec<pb::ScaleRequest>>,
    sink: &ResponseSink,
) -> Result<()> {
    let requests = requests.read().await;
    sink.send(Response::Scales(pb::StreamScalesResponse {
        scale_requests: requests.clone(),
    }))
    .await
}

/// Reset-on-event debounce: the list snapshot goes out once the timer has
/// been quiet for the full window.
async fn debounce_sender(
    requests: Arc<RwLock<Vec<pb::ScaleRequest>>>,
    sink: ResponseSink,
    mut kick: mpsc::Receiver<()>,
) {
    let timer = sleep(DEBOUNCE);
    tokio::pin!(timer);
    let mut armed = false;
    loop {
        tokio::select! {
            kicked = kick.recv() => match kicked {
                Some(()) => {
                    timer.as_mut().reset(Instant::now() + DEBOUNCE);
                    armed = true;
                }
                None => break,
            },
            () = timer.as_mut(), if armed => {
                armed = false;
                if send_requests(&requests, &sink).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Decode the event payload and move it to the head of the list, dropping
/// any older entry with the same name.
async fn prepend(requests: &RwLock<Vec<pb::ScaleRequest>>, event: &EventRecord) {
    let record: ScaleRequestRecord = match serde_json::from_value(event.data.clone()) {
        Ok(record) => record,
        Err(e) => {
            warn!(event = event.id, error = %e, "skipping malformed scale request payload");
            return;
        }
    };
    let request = convert::scale_request(&record);
    let mut requests = requests.write().await;
    requests.retain(|r| r.name != request.name);
    requests.insert(0, request);
}

/// Insert a scale request and block until an external worker drives it to a
/// terminal state, or the deadline passes.
pub async fn create_scale(
    state: &HandlerState,
    req: pb::CreateScaleRequest,
) -> Result<pb::ScaleRequest> {
    let app_id = parse_id_from_name(&req.parent, "apps")
        .ok_or_else(|| {
            ControllerError::Validation(format!("malformed parent name {:?}", req.parent))
        })?
        .to_string();
    let release_id = parse_id_from_name(&req.parent, "releases")
        .ok_or_else(|| {
            ControllerError::Validation(format!("malformed parent name {:?}", req.parent))
        })?
        .to_string();

    // Subscribe before inserting so the terminal event cannot slip past.
    let mut sub = subscribe_events(
        &state.hub,
        std::slice::from_ref(&app_id),
        &[EventType::ScaleRequest],
        "",
    )
    .await?;

    let new_processes = (!req.processes.is_empty()).then(|| req.processes.clone());
    let new_tags = (!req.tags.is_empty()).then(|| convert::tags_from_proto(&req.tags));
    let mut record = state
        .store
        .create_scale_request(&app_id, &release_id, new_processes, new_tags)
        .await?;

    let timeout = state.scale_timeout;
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                if event.object_type != EventType::ScaleRequest {
                    continue;
                }
                let updated: ScaleRequestRecord = match serde_json::from_value(event.data.clone()) {
                    Ok(updated) => updated,
                    Err(e) => {
                        warn!(event = event.id, error = %e, "skipping malformed scale request payload");
                        continue;
                    }
                };
                if updated.id != record.id {
                    continue;
                }
                match updated.state {
                    ScaleState::Cancelled => {
                        return Err(ControllerError::Precondition(
                            "scale request cancelled".to_string(),
                        ));
                    }
                    ScaleState::Complete => {
                        record = updated;
                        break;
                    }
                    ScaleState::Pending => {}
                }
            }
            () = deadline.as_mut() => {
                return Err(ControllerError::DeadlineExceeded(format!(
                    "timed out waiting for scale to complete (waited {} seconds)",
                    timeout.as_secs()
                )));
            }
        }
    }

    sub.finish()?;
    Ok(convert::scale_request(&record))
}
