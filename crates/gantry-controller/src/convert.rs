// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conversions between store records and wire messages.

use std::collections::HashMap;

use gantry_protocol::controller as pb;

use crate::names::{app_name, deployment_name, release_name, scale_request_name};
use crate::store::{
    AppRecord, DeployState, ExpandedDeploymentRecord, FormationRecord, ProcessTags, ReleaseRecord,
    ScaleRequestRecord, ScaleState,
};

pub fn app(record: &AppRecord) -> pb::App {
    pb::App {
        name: app_name(&record.id),
        display_name: record.name.clone(),
        labels: record.meta.clone(),
        strategy: record.strategy.clone(),
        deploy_timeout: record.deploy_timeout,
        create_time_ms: record.created_at.timestamp_millis(),
        update_time_ms: record.updated_at.timestamp_millis(),
    }
}

pub fn release(record: &ReleaseRecord) -> pb::Release {
    pb::Release {
        name: release_name(&record.app_id, &record.id),
        labels: record.meta.clone(),
        artifacts: record.artifacts.clone(),
        env: record.env.clone(),
        process_types: record.process_types.clone(),
        create_time_ms: record.created_at.timestamp_millis(),
    }
}

pub fn scale_state(state: ScaleState) -> pb::ScaleRequestState {
    match state {
        ScaleState::Pending => pb::ScaleRequestState::ScalePending,
        ScaleState::Cancelled => pb::ScaleRequestState::ScaleCancelled,
        ScaleState::Complete => pb::ScaleRequestState::ScaleComplete,
    }
}

pub fn deployment_status(state: DeployState) -> pb::DeploymentStatus {
    match state {
        DeployState::Pending => pb::DeploymentStatus::DeploymentPending,
        DeployState::Running => pb::DeploymentStatus::DeploymentRunning,
        DeployState::Complete => pb::DeploymentStatus::DeploymentComplete,
        DeployState::Failed => pb::DeploymentStatus::DeploymentFailed,
    }
}

pub fn tags_to_proto(tags: &ProcessTags) -> HashMap<String, pb::DeploymentProcessTags> {
    tags.iter()
        .map(|(process, tags)| {
            (
                process.clone(),
                pb::DeploymentProcessTags { tags: tags.clone() },
            )
        })
        .collect()
}

pub fn tags_from_proto(tags: &HashMap<String, pb::DeploymentProcessTags>) -> ProcessTags {
    tags.iter()
        .map(|(process, tags)| (process.clone(), tags.tags.clone()))
        .collect()
}

pub fn scale_request(record: &ScaleRequestRecord) -> pb::ScaleRequest {
    pb::ScaleRequest {
        name: scale_request_name(&record.app_id, &record.release_id, &record.id),
        state: scale_state(record.state) as i32,
        old_processes: record.old_processes.clone().unwrap_or_default(),
        new_processes: record.new_processes.clone().unwrap_or_default(),
        old_tags: record.old_tags.as_ref().map(tags_to_proto).unwrap_or_default(),
        new_tags: record.new_tags.as_ref().map(tags_to_proto).unwrap_or_default(),
        create_time_ms: record.created_at.timestamp_millis(),
        update_time_ms: record.updated_at.timestamp_millis(),
    }
}

pub fn formation(
    record: &FormationRecord,
    state: pb::ScaleRequestState,
    scale_request: String,
) -> pb::Formation {
    pb::Formation {
        app: app_name(&record.app_id),
        release: release_name(&record.app_id, &record.release_id),
        state: state as i32,
        processes: record.processes.clone(),
        tags: tags_to_proto(&record.tags),
        scale_request,
        update_time_ms: record.updated_at.timestamp_millis(),
    }
}

/// Classify the release transition: changed artifacts mean new code,
/// anything else is a configuration change.
pub fn release_type(
    old_release: Option<&ReleaseRecord>,
    new_release: Option<&ReleaseRecord>,
) -> pb::ReleaseType {
    match (old_release, new_release) {
        (Some(old), Some(new)) if old.artifacts == new.artifacts => pb::ReleaseType::Config,
        _ => pb::ReleaseType::Code,
    }
}

pub fn expanded_deployment(record: &ExpandedDeploymentRecord) -> pb::ExpandedDeployment {
    let d = &record.deployment;
    pb::ExpandedDeployment {
        name: deployment_name(&d.app_id, &d.id),
        old_release: record.old_release.as_ref().map(release),
        new_release: record.new_release.as_ref().map(release),
        r#type: release_type(record.old_release.as_ref(), record.new_release.as_ref()) as i32,
        status: deployment_status(d.status) as i32,
        processes: d.processes.clone(),
        job_state: record.job_state.clone(),
        create_time_ms: d.created_at.timestamp_millis(),
        finish_time_ms: d.finished_at.map(|t| t.timestamp_millis()).unwrap_or(0),
    }
}
