// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment handlers: `StreamDeployments` and `CreateDeployment`.

use gantry_protocol::ReleaseTypeMatcher;
use gantry_protocol::controller as pb;
use gantry_protocol::controller::rpc_response::Response;
use tracing::warn;

use crate::convert;
use crate::error::{ControllerError, Result};
use crate::events::subscribe_events;
use crate::names::{PageToken, parse_app_ids_from_name_filters, parse_id_from_name,
    parse_ids_from_name_filters, release_name};
use crate::store::{DeployState, DeploymentEventData, EventType, ListDeploymentOptions};

use super::{HandlerState, ResponseSink, scales};

/// Snapshot of expanded deployments plus a live tail that re-fetches the
/// expanded record on every deployment event.
pub async fn stream_deployments(
    state: &HandlerState,
    req: pb::StreamDeploymentsRequest,
    sink: &ResponseSink,
) -> Result<()> {
    let unary = !(req.stream_creates || req.stream_updates);
    let app_ids = parse_app_ids_from_name_filters(&req.name_filters);

    let deployments = list_deployments(state, &req).await?;
    sink.send(Response::Deployments(pb::StreamDeploymentsResponse {
        deployments,
    }))
    .await?;

    if unary {
        return Ok(());
    }

    let mut sub = subscribe_events(&state.hub, &app_ids, &[EventType::Deployment], "").await?;
    let matcher = ReleaseTypeMatcher::new(&req.type_filters);

    while let Some(event) = sub.recv().await {
        let payload: DeploymentEventData = match serde_json::from_value(event.data.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event = event.id, error = %e, "skipping malformed deployment event payload");
                continue;
            }
        };
        let mut expanded = match state.store.get_expanded_deployment(&event.object_id).await {
            Ok(expanded) => expanded,
            Err(e) => {
                warn!(deployment = %event.object_id, error = %e, "failed to fetch deployment for event");
                continue;
            }
        };
        // The event is the authority on the status at this point in the
        // stream; the row may already be further along.
        expanded.deployment.status = payload.status;
        let deployment = convert::expanded_deployment(&expanded);
        if !matcher.matches(deployment.r#type()) {
            continue;
        }
        sink.send(Response::Deployments(pb::StreamDeploymentsResponse {
            deployments: vec![deployment],
        }))
        .await?;
    }

    sub.finish()
}

async fn list_deployments(
    state: &HandlerState,
    req: &pb::StreamDeploymentsRequest,
) -> Result<Vec<pb::ExpandedDeployment>> {
    let mut token = PageToken::parse(&req.page_token)?;
    if req.page_size > 0 {
        token.size = req.page_size;
    }
    let opts = ListDeploymentOptions {
        page_token: token,
        app_ids: parse_app_ids_from_name_filters(&req.name_filters),
        deployment_ids: parse_ids_from_name_filters(&req.name_filters, "deployments"),
    };
    let records = state.store.list_deployments(&opts).await?;
    let matcher = ReleaseTypeMatcher::new(&req.type_filters);
    Ok(records
        .iter()
        .map(convert::expanded_deployment)
        .filter(|d| matcher.matches(d.r#type()))
        .collect())
}

/// Create a deployment and stream its events until it reaches a terminal
/// state. A completed deployment with an embedded scale request triggers the
/// synchronous scale RPC against the new release before the stream closes.
pub async fn create_deployment(
    state: &HandlerState,
    req: pb::CreateDeploymentRequest,
    sink: &ResponseSink,
) -> Result<()> {
    let app_id = parse_id_from_name(&req.parent, "apps")
        .ok_or_else(|| {
            ControllerError::Validation(format!("malformed parent name {:?}", req.parent))
        })?
        .to_string();
    let release_id = parse_id_from_name(&req.release, "releases")
        .ok_or_else(|| {
            ControllerError::Validation(format!("malformed release name {:?}", req.release))
        })?
        .to_string();

    let deployment = state.store.create_deployment(&app_id, &release_id).await?;

    let mut sub = subscribe_events(
        &state.hub,
        std::slice::from_ref(&app_id),
        &[EventType::Deployment],
        &deployment.id,
    )
    .await?;

    while let Some(event) = sub.recv().await {
        if event.object_type != EventType::Deployment {
            continue;
        }
        let payload: DeploymentEventData = match serde_json::from_value(event.data.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event = event.id, error = %e, "skipping malformed deployment event payload");
                continue;
            }
        };
        let current = match state.store.get_deployment(&event.object_id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(deployment = %event.object_id, error = %e, "failed to fetch deployment for event");
                continue;
            }
        };

        // Scale the new release to the requested processes/tags once the
        // deployment lands.
        if current.status == DeployState::Complete {
            if let Some(scale) = &req.scale_request {
                let scale_req = pb::CreateScaleRequest {
                    parent: release_name(&current.app_id, &current.new_release_id),
                    processes: scale.processes.clone(),
                    tags: scale.tags.clone(),
                };
                if let Err(e) = scales::create_scale(state, scale_req).await {
                    warn!(deployment = %current.id, error = %e, "post-deploy scale failed");
                }
            }
        }

        let expanded = match state.store.get_expanded_deployment(&current.id).await {
            Ok(expanded) => expanded,
            Err(e) => {
                warn!(deployment = %current.id, error = %e, "failed to expand deployment");
                continue;
            }
        };
        sink.send(Response::DeploymentEvent(pb::DeploymentEvent {
            deployment: Some(convert::expanded_deployment(&expanded)),
            job_type: payload.job_type.clone(),
            job_state: payload.job_state.clone(),
            error: payload.error.clone().unwrap_or_default(),
            create_time_ms: event.created_at.timestamp_millis(),
        }))
        .await?;

        if current.status == DeployState::Failed {
            return Err(ControllerError::Precondition(
                payload
                    .error
                    .unwrap_or_else(|| "deployment failed".to_string()),
            ));
        }
        if current.status == DeployState::Complete {
            break;
        }
    }

    sub.finish()
}
