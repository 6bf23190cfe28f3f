// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! StreamDeployments and CreateDeployment integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestContext, first_response};
use gantry_controller::store::{
    ControllerStore, DeployState, ListDeploymentOptions, MemoryStore, ScaleState,
};
use gantry_protocol::controller::rpc_request::Request;
use gantry_protocol::controller::rpc_response::Response;
use gantry_protocol::controller::{
    CreateDeploymentRequest, CreateScaleRequest, DeploymentStatus, ReleaseType, RpcRequest,
    StatusCode, StreamDeploymentsRequest,
};

fn create_deployment_request(req: CreateDeploymentRequest) -> RpcRequest {
    RpcRequest {
        request: Some(Request::CreateDeployment(req)),
    }
}

/// Wait for the app's next deployment to appear, then walk it through the
/// given states.
fn spawn_deploy_worker(store: Arc<MemoryStore>, app_id: String, outcome: DeployState) {
    tokio::spawn(async move {
        let opts = ListDeploymentOptions {
            app_ids: vec![app_id],
            ..Default::default()
        };
        for _ in 0..100 {
            let deployments = store.list_deployments(&opts).await.unwrap_or_default();
            if let Some(expanded) = deployments.first() {
                let id = expanded.deployment.id.clone();
                // Give the handler a beat to finish subscribing.
                tokio::time::sleep(Duration::from_millis(100)).await;
                store
                    .record_deployment_event(&id, DeployState::Running, "web", "starting", None)
                    .await
                    .expect("worker failed to record running");
                // Space the transitions out so each event is observed against
                // its own row state.
                tokio::time::sleep(Duration::from_millis(150)).await;
                let error = (outcome == DeployState::Failed).then_some("boom");
                store
                    .record_deployment_event(&id, outcome, "web", "up", error)
                    .await
                    .expect("worker failed to record outcome");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never saw a deployment");
    });
}

#[tokio::test]
async fn deployment_events_stream_until_complete_and_trigger_the_scale() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;
    let r1 = ctx.seed_release(&app.id, &["img:v1"]).await;
    ctx.store.set_app_release(&app.id, &r1.id).await.unwrap();
    let r2 = ctx.seed_release(&app.id, &["img:v2"]).await;

    spawn_deploy_worker(ctx.store.clone(), app.id.clone(), DeployState::Complete);
    // The embedded scale request needs its own worker once the deployment
    // lands.
    {
        let store = ctx.store.clone();
        let app_id = app.id.clone();
        let release_id = r2.id.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                if let Ok(Some(sr)) = store.latest_scale_request(&app_id, &release_id).await {
                    if sr.state == ScaleState::Pending {
                        store
                            .update_scale_request_state(&sr.id, ScaleState::Complete)
                            .await
                            .expect("scale worker failed");
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
    }

    let mut stream = ctx
        .client
        .open_stream(&create_deployment_request(CreateDeploymentRequest {
            parent: format!("apps/{}", app.id),
            release: format!("apps/{}/releases/{}", app.id, r2.id),
            scale_request: Some(CreateScaleRequest {
                processes: [("web".to_string(), 2)].into(),
                ..Default::default()
            }),
        }))
        .await
        .unwrap();

    let mut statuses = Vec::new();
    loop {
        let response = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for deployment events")
            .expect("deployment stream errored");
        let Some(response) = response else { break };
        let Some(Response::DeploymentEvent(event)) = response.response else {
            panic!("unexpected response {response:?}");
        };
        let deployment = event.deployment.expect("event without deployment");
        statuses.push(deployment.status);
    }

    assert_eq!(
        statuses,
        vec![
            DeploymentStatus::DeploymentRunning as i32,
            DeploymentStatus::DeploymentComplete as i32,
        ]
    );

    // The embedded scale request ran against the new release.
    let sr = ctx
        .store
        .latest_scale_request(&app.id, &r2.id)
        .await
        .unwrap()
        .expect("no scale request created");
    assert_eq!(sr.state, ScaleState::Complete);
    assert_eq!(sr.new_processes.as_ref().and_then(|p| p.get("web")), Some(&2));

    // Completing the deployment switched the app's current release.
    let current = ctx.store.get_app_release(&app.id).await.unwrap();
    assert_eq!(current.id, r2.id);
}

#[tokio::test]
async fn failed_deployment_closes_the_stream_with_the_event_error() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;
    let r1 = ctx.seed_release(&app.id, &["img:v1"]).await;
    ctx.store.set_app_release(&app.id, &r1.id).await.unwrap();
    let r2 = ctx.seed_release(&app.id, &["img:v2"]).await;

    spawn_deploy_worker(ctx.store.clone(), app.id.clone(), DeployState::Failed);

    let mut stream = ctx
        .client
        .open_stream(&create_deployment_request(CreateDeploymentRequest {
            parent: format!("apps/{}", app.id),
            release: format!("apps/{}/releases/{}", app.id, r2.id),
            scale_request: None,
        }))
        .await
        .unwrap();

    // Events stream through until the failure terminates the call.
    let err = loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for deployment events")
        {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("stream closed without an error"),
            Err(e) => break e,
        }
    };
    match err {
        gantry_protocol::ClientError::Rpc(rpc) => {
            assert_eq!(rpc.code, StatusCode::StatusFailedPrecondition as i32);
            assert_eq!(rpc.message, "boom");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn snapshot_respects_type_filters() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;
    let r1 = ctx.seed_release(&app.id, &["img:v1"]).await;
    ctx.store.set_app_release(&app.id, &r1.id).await.unwrap();
    // Same artifacts: a config-only change.
    let config_release = ctx.seed_release(&app.id, &["img:v1"]).await;
    let _config_deploy = ctx
        .store
        .create_deployment(&app.id, &config_release.id)
        .await
        .unwrap();
    // New artifacts: a code change.
    let code_release = ctx.seed_release(&app.id, &["img:v2"]).await;
    let code_deploy = ctx
        .store
        .create_deployment(&app.id, &code_release.id)
        .await
        .unwrap();

    let response = first_response(
        &ctx.client,
        &RpcRequest {
            request: Some(Request::StreamDeployments(StreamDeploymentsRequest {
                name_filters: vec![format!("apps/{}", app.id)],
                type_filters: vec![ReleaseType::Code as i32],
                ..Default::default()
            })),
        },
    )
    .await
    .unwrap();
    let Response::Deployments(page) = response else {
        panic!("unexpected response {response:?}");
    };
    assert_eq!(page.deployments.len(), 1);
    assert_eq!(
        page.deployments[0].name,
        format!("apps/{}/deployments/{}", app.id, code_deploy.id)
    );
    assert_eq!(page.deployments[0].r#type, ReleaseType::Code as i32);
}
