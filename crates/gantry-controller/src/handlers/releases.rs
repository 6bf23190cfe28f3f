// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release handlers: `StreamReleases` and `CreateRelease`.
//!
//! The release snapshot is paged out of the event log rather than the
//! releases table, so one `curr_id` guard covers both the page seam and the
//! snapshot/live-tail seam.

use std::collections::HashSet;

use gantry_protocol::controller as pb;
use gantry_protocol::controller::rpc_response::Response;
use gantry_protocol::match_label_filters;
use tracing::warn;

use crate::convert;
use crate::error::{ControllerError, Result};
use crate::events::subscribe_events;
use crate::names::{PageToken, parse_app_ids_from_name_filters, parse_id_from_name,
    parse_ids_from_name_filters};
use crate::store::{EventFilter, EventRecord, EventType, NewRelease, ReleaseRecord};

use super::{HandlerState, ResponseSink};

/// Snapshot page of release events plus live tail of new releases.
pub async fn stream_releases(
    state: &HandlerState,
    req: pb::StreamReleasesRequest,
    sink: &ResponseSink,
) -> Result<()> {
    let unary = !(req.stream_creates || req.stream_updates);

    let mut token = PageToken::parse(&req.page_token)?;
    if req.page_size > 0 {
        token.size = req.page_size;
    }
    let page_size = if req.page_size > 0 {
        req.page_size as usize
    } else {
        token.size as usize
    };

    let mut event_app_ids = parse_app_ids_from_name_filters(&req.name_filters);
    let app_ids: HashSet<String> = event_app_ids.iter().cloned().collect();
    let release_ids: HashSet<String> =
        parse_ids_from_name_filters(&req.name_filters, "releases")
            .into_iter()
            .collect();
    // The event log and subscription filter on one id kind at a time;
    // release-id constraints win and app narrowing happens in-handler.
    if !release_ids.is_empty() {
        event_app_ids.clear();
    }

    let mut sub = subscribe_events(&state.hub, &event_app_ids, &[EventType::Release], "").await?;

    let count = if page_size > 0 { page_size + 1 } else { 0 };
    let filter = EventFilter {
        app_ids: event_app_ids,
        object_types: vec![EventType::Release],
        object_id: String::new(),
    };
    let mut list = state.store.list_events(&filter, token.before_id, count).await?;

    let mut curr_id = token.before_id.unwrap_or(0);
    let mut next_token = None;
    if (page_size == 0 || list.len() == page_size + 1) && !list.is_empty() {
        // Drop the probe row and cursor the next page off the head of the
        // returned window.
        list.pop();
        if let Some(first) = list.first() {
            next_token = Some(PageToken {
                before_id: Some(first.id),
                size: token.size,
            });
        }
    }

    let mut releases: Vec<pb::Release> = Vec::new();
    // The list is newest-first; replay it oldest-first so prepending leaves
    // the newest release at the head.
    for event in list.iter().rev() {
        curr_id = event.id;
        let Some(release) = accept_release(event, &release_ids, &app_ids, &req.label_filters)
        else {
            continue;
        };
        releases.retain(|r| r.name != release.name);
        releases.insert(0, release);
    }

    sink.send(Response::Releases(pb::StreamReleasesResponse {
        releases,
        next_page_token: next_token.map(|t| t.to_string()).unwrap_or_default(),
        page_complete: true,
    }))
    .await?;

    if unary {
        return sub.finish();
    }

    while let Some(event) = sub.recv().await {
        // Avoid overlap between the listed page and the stream.
        if event.id <= curr_id {
            continue;
        }
        curr_id = event.id;
        let Some(release) = accept_release(&event, &release_ids, &app_ids, &req.label_filters)
        else {
            continue;
        };
        sink.send(Response::Releases(pb::StreamReleasesResponse {
            releases: vec![release],
            ..Default::default()
        }))
        .await?;
    }

    sub.finish()
}

/// Apply the request's name and label filters to one release event.
fn accept_release(
    event: &EventRecord,
    release_ids: &HashSet<String>,
    app_ids: &HashSet<String>,
    label_filters: &[pb::LabelFilter],
) -> Option<pb::Release> {
    if !release_ids.is_empty()
        && !release_ids.contains(&event.object_id)
        && (app_ids.is_empty() || !app_ids.contains(&event.app_id))
    {
        return None;
    }

    let record: ReleaseRecord = match serde_json::from_value(event.data.clone()) {
        Ok(record) => record,
        Err(e) => {
            warn!(event = event.id, error = %e, "skipping malformed release event payload");
            return None;
        }
    };
    let release = convert::release(&record);
    if !match_label_filters(&release.labels, label_filters) {
        return None;
    }
    Some(release)
}

/// Create a release under the parent app.
pub async fn create_release(
    state: &HandlerState,
    req: pb::CreateReleaseRequest,
) -> Result<pb::Release> {
    let app_id = parse_id_from_name(&req.parent, "apps")
        .ok_or_else(|| {
            ControllerError::Validation(format!("malformed parent name {:?}", req.parent))
        })?
        .to_string();
    let body = req.release.unwrap_or_default();
    let record = state
        .store
        .create_release(
            &app_id,
            NewRelease {
                artifacts: body.artifacts,
                env: body.env,
                process_types: body.process_types,
                meta: body.labels,
            },
        )
        .await?;
    Ok(convert::release(&record))
}
