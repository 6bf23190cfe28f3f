// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App handlers: `StreamApps` and `UpdateApp`.

use std::collections::HashSet;

use gantry_protocol::controller as pb;
use gantry_protocol::controller::rpc_response::Response;
use gantry_protocol::match_label_filters;
use tracing::warn;

use crate::convert;
use crate::error::{ControllerError, Result};
use crate::events::subscribe_events;
use crate::names::{PageToken, parse_app_ids_from_name_filters, parse_id_from_name};
use crate::store::{AppRecord, AppUpdate, EventOp, EventType};

use super::{HandlerState, ResponseSink};

/// Snapshot page plus live tail of app creates/updates.
pub async fn stream_apps(
    state: &HandlerState,
    req: pb::StreamAppsRequest,
    sink: &ResponseSink,
) -> Result<()> {
    let unary = !(req.stream_creates || req.stream_updates);

    let mut sub = if unary {
        None
    } else {
        let app_ids = parse_app_ids_from_name_filters(&req.name_filters);
        Some(
            subscribe_events(
                &state.hub,
                &app_ids,
                &[
                    EventType::App,
                    EventType::AppDeletion,
                    EventType::AppRelease,
                ],
                "",
            )
            .await?,
        )
    };

    let (apps, next_token) = list_apps(state, &req).await?;
    sink.send(Response::Apps(pb::StreamAppsResponse {
        apps,
        next_page_token: next_token.map(|t| t.to_string()).unwrap_or_default(),
        page_complete: true,
    }))
    .await?;

    let Some(mut sub) = sub.take() else {
        return Ok(());
    };

    while let Some(event) = sub.recv().await {
        match event.object_type {
            EventType::App => {
                let record: AppRecord = match serde_json::from_value(event.data.clone()) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(event = event.id, error = %e, "skipping malformed app event payload");
                        continue;
                    }
                };
                let app = convert::app(&record);
                let wanted = match event.op {
                    EventOp::Create => req.stream_creates,
                    EventOp::Update => req.stream_updates,
                    EventOp::Delete => false,
                };
                if !wanted || !match_label_filters(&app.labels, &req.label_filters) {
                    continue;
                }
                sink.send(Response::Apps(pb::StreamAppsResponse {
                    apps: vec![app],
                    ..Default::default()
                }))
                .await?;
            }
            // Deletion and release-pointer events share this subscription but
            // produce no response.
            EventType::AppDeletion | EventType::AppRelease => {}
            _ => {}
        }
    }

    sub.finish()
}

/// Materialize the snapshot page, filling across store pages when in-handler
/// filters thin a page out.
async fn list_apps(
    state: &HandlerState,
    req: &pb::StreamAppsRequest,
) -> Result<(Vec<pb::App>, Option<PageToken>)> {
    let mut token = PageToken::parse(&req.page_token)?;
    if req.page_size > 0 {
        token.size = req.page_size;
    }
    let page_size = if req.page_size > 0 {
        req.page_size as usize
    } else {
        token.size as usize
    };
    let wanted = if page_size > 0 { page_size } else { usize::MAX };

    let name_ids = parse_app_ids_from_name_filters(&req.name_filters);

    let mut apps = Vec::new();
    let next_token = loop {
        let (records, next) = state.store.list_apps_page(&token).await?;
        for record in &records {
            // Name filters match either the app id or its human name.
            if !name_ids.is_empty()
                && !name_ids
                    .iter()
                    .any(|id| *id == record.id || *id == record.name)
            {
                continue;
            }
            let app = convert::app(record);
            if !match_label_filters(&app.labels, &req.label_filters) {
                continue;
            }
            apps.push(app);
            if apps.len() == wanted {
                break;
            }
        }
        match next {
            Some(next) if apps.len() < wanted => token = next,
            other => break other,
        }
    };
    Ok((apps, next_token))
}

/// Apply a field-masked update to an app.
pub async fn update_app(state: &HandlerState, req: pb::UpdateAppRequest) -> Result<pb::App> {
    let app = req
        .app
        .ok_or_else(|| ControllerError::Validation("app is required".to_string()))?;
    let app_id = parse_id_from_name(&app.name, "apps")
        .ok_or_else(|| ControllerError::Validation(format!("malformed app name {:?}", app.name)))?
        .to_string();

    let mut update = AppUpdate {
        meta: Some(app.labels.clone()),
        strategy: (!app.strategy.is_empty()).then(|| app.strategy.clone()),
        deploy_timeout: (app.deploy_timeout > 0).then_some(app.deploy_timeout),
    };

    if !req.update_mask.is_empty() {
        let paths: HashSet<&str> = req.update_mask.iter().map(|p| p.as_str()).collect();
        if !paths.contains("labels") {
            update.meta = None;
        }
        if !paths.contains("strategy") {
            update.strategy = None;
        }
        if !paths.contains("deploy_timeout") {
            update.deploy_timeout = None;
        }
    }

    let record = state.store.update_app(&app_id, update).await?;
    Ok(convert::app(&record))
}
