// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! StreamScales and CreateScale integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestContext, assert_quiet, next_response};
use gantry_controller::store::{ControllerStore, MemoryStore, ScaleState};
use gantry_protocol::controller::rpc_request::Request;
use gantry_protocol::controller::rpc_response::Response;
use gantry_protocol::controller::{
    CreateScaleRequest, RpcRequest, ScaleRequestState, StatusCode, StreamScalesRequest,
};

fn stream_scales_request(name_filters: Vec<String>) -> RpcRequest {
    RpcRequest {
        request: Some(Request::StreamScales(StreamScalesRequest { name_filters })),
    }
}

fn create_scale_request(parent: String, processes: &[(&str, i32)]) -> RpcRequest {
    RpcRequest {
        request: Some(Request::CreateScale(CreateScaleRequest {
            parent,
            processes: processes
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            ..Default::default()
        })),
    }
}

/// Spawn a worker that drives the next pending scale request for the pair to
/// the given terminal state.
fn spawn_scale_worker(
    store: Arc<MemoryStore>,
    app_id: String,
    release_id: String,
    state: ScaleState,
) {
    tokio::spawn(async move {
        for _ in 0..100 {
            if let Ok(Some(sr)) = store.latest_scale_request(&app_id, &release_id).await {
                if sr.state == ScaleState::Pending {
                    store
                        .update_scale_request_state(&sr.id, state)
                        .await
                        .expect("worker failed to update scale request");
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never saw a pending scale request");
    });
}

#[tokio::test]
async fn bursts_coalesce_into_one_response() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;
    let release = ctx.seed_release(&app.id, &["img:v1"]).await;

    let mut stream = ctx
        .client
        .open_stream(&stream_scales_request(vec![format!("apps/{}", app.id)]))
        .await
        .unwrap();

    // Initial snapshot: nothing scaled yet.
    let Response::Scales(initial) = next_response(&mut stream).await else {
        panic!("expected initial scales response");
    };
    assert!(initial.scale_requests.is_empty());

    // Three events in a burst produce exactly one coalesced response, with
    // the requests in reverse-arrival order.
    let sr1 = ctx
        .store
        .create_scale_request(&app.id, &release.id, None, None)
        .await
        .unwrap();
    let sr2 = ctx
        .store
        .create_scale_request(&app.id, &release.id, None, None)
        .await
        .unwrap();
    let sr3 = ctx
        .store
        .create_scale_request(&app.id, &release.id, None, None)
        .await
        .unwrap();

    let Response::Scales(coalesced) = next_response(&mut stream).await else {
        panic!("expected coalesced response");
    };
    let names: Vec<&str> = coalesced
        .scale_requests
        .iter()
        .map(|sr| sr.name.as_str())
        .collect();
    let expected: Vec<String> = [&sr3, &sr2, &sr1]
        .iter()
        .map(|sr| format!("apps/{}/releases/{}/scale/{}", app.id, release.id, sr.id))
        .collect();
    assert_eq!(names, expected);

    assert_quiet(&mut stream, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn updated_request_moves_to_the_head_without_duplicates() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;
    let release = ctx.seed_release(&app.id, &["img:v1"]).await;

    let sr1 = ctx
        .store
        .create_scale_request(&app.id, &release.id, None, None)
        .await
        .unwrap();
    let _sr2 = ctx
        .store
        .create_scale_request(&app.id, &release.id, None, None)
        .await
        .unwrap();

    let mut stream = ctx
        .client
        .open_stream(&stream_scales_request(vec![format!("apps/{}", app.id)]))
        .await
        .unwrap();
    let Response::Scales(initial) = next_response(&mut stream).await else {
        panic!("expected initial response");
    };
    assert_eq!(initial.scale_requests.len(), 2);

    // Completing sr1 re-delivers it: it must appear once, at the head.
    ctx.store
        .update_scale_request_state(&sr1.id, ScaleState::Complete)
        .await
        .unwrap();
    let Response::Scales(updated) = next_response(&mut stream).await else {
        panic!("expected coalesced response");
    };
    assert_eq!(updated.scale_requests.len(), 2);
    let sr1_name = format!("apps/{}/releases/{}/scale/{}", app.id, release.id, sr1.id);
    assert_eq!(updated.scale_requests[0].name, sr1_name);
    assert_eq!(
        updated.scale_requests[0].state,
        ScaleRequestState::ScaleComplete as i32
    );
    assert_eq!(
        updated
            .scale_requests
            .iter()
            .filter(|sr| sr.name == sr1_name)
            .count(),
        1
    );
}

#[tokio::test]
async fn create_scale_returns_once_the_worker_completes() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;
    let release = ctx.seed_release(&app.id, &["img:v1"]).await;

    spawn_scale_worker(
        ctx.store.clone(),
        app.id.clone(),
        release.id.clone(),
        ScaleState::Complete,
    );

    let response = ctx
        .client
        .unary(&create_scale_request(
            format!("apps/{}/releases/{}", app.id, release.id),
            &[("web", 3)],
        ))
        .await
        .unwrap();
    let Some(Response::ScaleRequest(sr)) = response.response else {
        panic!("unexpected response {response:?}");
    };
    assert_eq!(sr.state, ScaleRequestState::ScaleComplete as i32);
    assert_eq!(sr.new_processes.get("web"), Some(&3));

    // The completed scale updated the formation.
    let formation = ctx.store.get_formation(&app.id, &release.id).await.unwrap();
    assert_eq!(formation.processes.get("web"), Some(&3));
}

#[tokio::test]
async fn create_scale_cancelled_is_a_failed_precondition() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;
    let release = ctx.seed_release(&app.id, &["img:v1"]).await;

    spawn_scale_worker(
        ctx.store.clone(),
        app.id.clone(),
        release.id.clone(),
        ScaleState::Cancelled,
    );

    let err = ctx
        .client
        .unary(&create_scale_request(
            format!("apps/{}/releases/{}", app.id, release.id),
            &[("web", 3)],
        ))
        .await
        .unwrap_err();
    match err {
        gantry_protocol::ClientError::Rpc(rpc) => {
            assert_eq!(rpc.code, StatusCode::StatusFailedPrecondition as i32);
            assert_eq!(rpc.message, "scale request cancelled");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn create_scale_times_out_without_a_worker() {
    let ctx = TestContext::with_scale_timeout(Duration::from_millis(200)).await;
    let app = ctx.seed_app("web").await;
    let release = ctx.seed_release(&app.id, &["img:v1"]).await;

    let err = ctx
        .client
        .unary(&create_scale_request(
            format!("apps/{}/releases/{}", app.id, release.id),
            &[("web", 3)],
        ))
        .await
        .unwrap_err();
    match err {
        gantry_protocol::ClientError::Rpc(rpc) => {
            assert_eq!(rpc.code, StatusCode::StatusDeadlineExceeded as i32);
            assert!(rpc.message.contains("seconds"), "message: {}", rpc.message);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn create_scale_rejects_malformed_parent() {
    let ctx = TestContext::new().await;
    let err = ctx
        .client
        .unary(&create_scale_request("apps/only-an-app".to_string(), &[]))
        .await
        .unwrap_err();
    match err {
        gantry_protocol::ClientError::Rpc(rpc) => {
            assert_eq!(rpc.code, StatusCode::StatusInvalidArgument as i32);
        }
        other => panic!("unexpected error {other:?}"),
    }
}
